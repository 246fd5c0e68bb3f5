// Cache directory for fetched remote files.
// One directory per process, shared by every operator. Contents are keyed by
// the sha1 of the source URI. The CLI sets the directory before execution and
// removes it afterwards unless the retain flag was given.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use uuid::Uuid;

use crate::errors::Result;

struct CacheState {
    dir: Option<PathBuf>,
    // A directory we created ourselves may be removed; one handed to us by the
    // caller is left in place on remove_cache_dir.
    created: bool,
}

static CACHE: Lazy<Mutex<CacheState>> = Lazy::new(|| Mutex::new(CacheState { dir: None, created: false }));

/// Use `dir` as the cache directory, creating it if needed.
/// An empty path keeps the default temp-dir behaviour.
pub fn set_cache_dir(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(dir)?;
    let mut state = CACHE.lock();
    state.dir = Some(dir.to_path_buf());
    state.created = false;
    Ok(())
}

/// The current cache directory, creating a per-process temp dir on first use.
pub fn cache_dir() -> Result<PathBuf> {
    let mut state = CACHE.lock();
    if let Some(ref dir) = state.dir {
        return Ok(dir.clone());
    }
    let dir = std::env::temp_dir().join(format!("rundown-cache-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    state.dir = Some(dir.clone());
    state.created = true;
    Ok(dir)
}

/// Remove the cache directory if this process created it.
pub fn remove_cache_dir() -> Result<()> {
    let mut state = CACHE.lock();
    if let Some(dir) = state.dir.take() {
        if state.created && dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
    }
    state.created = false;
    Ok(())
}

/// Stable file name for a cached copy of `uri`, keeping the extension so
/// loaders can sniff the format.
pub fn cache_key(uri: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(uri.as_bytes());
    let digest = hex::encode(hasher.finalize());
    match uri.rsplit('/').next().and_then(|name| name.rsplit_once('.')) {
        Some((_, ext)) if !ext.is_empty() && ext.len() <= 8 => format!("{digest}.{ext}"),
        _ => digest,
    }
}
