// Remote file fetching: `github://owner/repo/path`, `https://…`, and the
// `json://path` variable loader. Remote reads go through the scope gate and
// land in the shared cache directory, keyed by URI hash.

use std::path::{Path, PathBuf};

use serde_json::Value;

use rundown_common::cache;
use rundown_common::errors::{Result, RundownError};
use rundown_common::scope;

pub const GITHUB_SCHEME: &str = "github://";
pub const JSON_SCHEME: &str = "json://";

/// Whether a book path needs a network fetch.
pub fn is_remote(path: &str) -> bool {
    path.starts_with(GITHUB_SCHEME) || path.starts_with("https://") || path.starts_with("http://")
}

/// Check the read-remote scope for `uri`, failing before any network I/O.
pub fn check_remote_scope(uri: &str) -> Result<()> {
    if !scope::allow_read_remote() {
        return Err(RundownError::PermissionDenied(format!(
            "remote read of {uri} requires the read:remote scope"
        )));
    }
    Ok(())
}

/// Fetch `uri` into the cache directory and return the local path.
/// A cached copy is reused without re-fetching.
pub async fn fetch_to_cache(uri: &str) -> Result<PathBuf> {
    check_remote_scope(uri)?;

    let dir = cache::cache_dir()?;
    let local = dir.join(cache::cache_key(uri));
    if local.exists() {
        return Ok(local);
    }

    let url = resolve_url(uri)?;
    tracing::debug!(uri, url = %url, "fetching remote file");
    let response = reqwest::get(&url).await.map_err(|e| RundownError::RunnerFailure {
        runner: "fetch".to_string(),
        message: format!("GET {url}: {e}"),
    })?;
    if !response.status().is_success() {
        return Err(RundownError::RunnerFailure {
            runner: "fetch".to_string(),
            message: format!("GET {url}: status {}", response.status()),
        });
    }
    let body = response.bytes().await.map_err(|e| RundownError::RunnerFailure {
        runner: "fetch".to_string(),
        message: format!("reading {url}: {e}"),
    })?;
    std::fs::write(&local, &body)?;
    Ok(local)
}

/// Map a `github://owner/repo/path` URI to its raw-content URL.
fn resolve_url(uri: &str) -> Result<String> {
    if let Some(rest) = uri.strip_prefix(GITHUB_SCHEME) {
        let mut parts = rest.splitn(3, '/');
        let owner = parts.next().unwrap_or_default();
        let repo = parts.next().unwrap_or_default();
        let path = parts.next().unwrap_or_default();
        if owner.is_empty() || repo.is_empty() || path.is_empty() {
            return Err(RundownError::InvalidBook {
                path: uri.to_string(),
                message: "github:// URI needs owner/repo/path".to_string(),
            });
        }
        return Ok(format!("https://raw.githubusercontent.com/{owner}/{repo}/main/{path}"));
    }
    Ok(uri.to_string())
}

/// Load a `json://path` var value, relative to `base` when the path is not
/// absolute.
pub fn load_json_var(reference: &str, base: Option<&Path>) -> Result<Value> {
    let raw = reference.strip_prefix(JSON_SCHEME).unwrap_or(reference);
    let path = match base {
        Some(base) if !Path::new(raw).is_absolute() => base.join(raw),
        _ => PathBuf::from(raw),
    };
    let bytes = std::fs::read(&path)?;
    serde_json::from_slice(&bytes).map_err(|e| RundownError::InvalidBook {
        path: path.display().to_string(),
        message: format!("invalid JSON: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_remote_paths() {
        assert!(is_remote("github://owner/repo/book.yml"));
        assert!(is_remote("https://example.com/book.yml"));
        assert!(!is_remote("testdata/book/book.yml"));
        assert!(!is_remote("/abs/book.yml"));
    }

    #[test]
    fn github_uri_resolves_to_raw_url() {
        let url = resolve_url("github://k1LoW/runn/testdata/book/http.yml").unwrap();
        assert_eq!(url, "https://raw.githubusercontent.com/k1LoW/runn/main/testdata/book/http.yml");
    }

    #[test]
    fn github_uri_missing_parts_is_invalid() {
        assert!(resolve_url("github://only-owner").is_err());
    }
}
