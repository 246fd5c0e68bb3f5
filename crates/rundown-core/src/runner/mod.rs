// Uniform runner contract and the per-operator registry.
// Every transport hides behind the same capability set: run a rendered step
// payload, renew any underlying session, release resources on close.

pub mod db;
pub mod exec;
pub mod grpc;
pub mod http;
pub mod ssh;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use rundown_common::errors::{Result, RundownError};
use rundown_common::SecretMasker;

use crate::capture::CaptureChain;
use crate::sink::SharedSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    Http,
    Db,
    Grpc,
    Ssh,
    Exec,
}

/// Everything a runner may need while executing one step.
pub struct StepContext {
    pub step_index: usize,
    pub step_key: String,
    /// Payload already templated against the store.
    pub payload: Value,
    /// Rendered store snapshot for runners that evaluate expressions.
    pub store: Value,
    pub cancel: CancellationToken,
    pub stdout: SharedSink,
    pub stderr: SharedSink,
    pub masker: SecretMasker,
    pub capturers: CaptureChain,
    /// Run-ID chain (ancestors first) for trace propagation.
    pub trace_chain: Vec<String>,
    /// Cookie jar shared with the operator's store.
    pub cookies: Arc<Mutex<Map<String, Value>>>,
    /// LIFO release actions; background work registers itself here.
    pub cleanup: Arc<crate::operator::CleanupGroup>,
    pub wait_timeout: Duration,
}

/// The polymorphic runner capability set.
#[async_trait]
pub trait StepRunner: Send + Sync {
    fn kind(&self) -> RunnerKind;
    fn name(&self) -> &str;

    /// Execute one step and return its output record.
    async fn run(&self, ctx: &StepContext) -> Result<Value>;

    /// Re-establish any underlying session (connection pools, SSH sessions).
    async fn renew(&self) -> Result<()> {
        Ok(())
    }

    /// Release owned resources. Called only by the owning operator.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// One registry entry: the runner plus its ownership. Runners injected by the
/// caller are shared and must never be closed by the operator.
#[derive(Clone)]
pub struct RunnerEntry {
    pub runner: Arc<dyn StepRunner>,
    pub shared: bool,
}

/// Typed map name → runner, insertion-ordered.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    entries: Vec<(String, RunnerEntry)>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner; a same-name duplicate overrides the earlier one.
    pub fn insert(&mut self, name: &str, runner: Arc<dyn StepRunner>, shared: bool) {
        self.entries.retain(|(n, _)| n != name);
        self.entries.push((name.to_string(), RunnerEntry { runner, shared }));
    }

    pub fn get(&self, name: &str) -> Option<&RunnerEntry> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, e)| e)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RunnerEntry)> {
        self.entries.iter().map(|(n, e)| (n.as_str(), e))
    }

    pub fn count_of(&self, kind: RunnerKind) -> usize {
        self.entries.iter().filter(|(_, e)| e.runner.kind() == kind).count()
    }

    /// Close every owned runner; shared runners are left untouched.
    pub async fn close_owned(&self) -> Vec<RundownError> {
        let mut errors = Vec::new();
        for (_, entry) in &self.entries {
            if !entry.shared {
                if let Err(e) = entry.runner.close().await {
                    errors.push(e);
                }
            }
        }
        errors
    }
}

impl std::fmt::Debug for RunnerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RunnerRegistry({:?})", self.names())
    }
}

/// Build a runner from a document/option spec: a URI string or a config map.
pub fn build_runner(name: &str, spec: &Value, book_path: &str) -> Result<Arc<dyn StepRunner>> {
    match spec {
        Value::String(uri) => build_from_uri(name, uri, None, book_path),
        Value::Object(map) => {
            let endpoint = map
                .get("endpoint")
                .or_else(|| map.get("dsn"))
                .or_else(|| map.get("addr"))
                .and_then(Value::as_str)
                .ok_or_else(|| RundownError::InvalidBook {
                    path: book_path.to_string(),
                    message: format!("runner {name}: config map needs endpoint/dsn/addr"),
                })?;
            build_from_uri(name, endpoint, Some(map), book_path)
        }
        other => Err(RundownError::InvalidBook {
            path: book_path.to_string(),
            message: format!("runner {name}: invalid spec {other}"),
        }),
    }
}

fn build_from_uri(
    name: &str,
    uri: &str,
    config: Option<&Map<String, Value>>,
    book_path: &str,
) -> Result<Arc<dyn StepRunner>> {
    let scheme = uri.split("://").next().unwrap_or_default();
    match scheme {
        "http" | "https" => Ok(Arc::new(http::HttpRunner::from_config(name, uri, config)?)),
        "mysql" | "postgres" | "postgresql" | "sqlite" | "sq" => {
            Ok(Arc::new(db::DbRunner::new(name, uri)))
        }
        "grpc" | "grpcs" => Ok(Arc::new(grpc::GrpcRunner::from_config(name, uri, config)?)),
        "ssh" => Ok(Arc::new(ssh::SshRunner::from_config(name, uri, config)?)),
        _ => Err(RundownError::InvalidBook {
            path: book_path.to_string(),
            message: format!("runner {name}: unsupported scheme in {uri:?}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn uri_dispatch_by_scheme() {
        let http = build_runner("req", &json!("https://example.com"), "b").unwrap();
        assert_eq!(http.kind(), RunnerKind::Http);
        let db = build_runner("db", &json!("sqlite://test.db"), "b").unwrap();
        assert_eq!(db.kind(), RunnerKind::Db);
        let grpc = build_runner("greq", &json!("grpc://localhost:50051"), "b").unwrap();
        assert_eq!(grpc.kind(), RunnerKind::Grpc);
        let ssh = build_runner("host", &json!("ssh://deploy@example.com:22"), "b").unwrap();
        assert_eq!(ssh.kind(), RunnerKind::Ssh);
    }

    #[test]
    fn unknown_scheme_is_invalid() {
        assert!(build_runner("x", &json!("ftp://example.com"), "b").is_err());
    }

    #[test]
    fn config_map_needs_endpoint() {
        assert!(build_runner("x", &json!({"timeout": 5}), "b").is_err());
        assert!(build_runner("x", &json!({"endpoint": "https://example.com"}), "b").is_ok());
    }

    #[test]
    fn duplicate_insert_overrides() {
        let mut reg = RunnerRegistry::new();
        let a = build_runner("req", &json!("https://a.example"), "b").unwrap();
        let b = build_runner("req", &json!("https://b.example"), "b").unwrap();
        reg.insert("req", a, false);
        reg.insert("req", b, true);
        assert_eq!(reg.names().len(), 1);
        assert!(reg.get("req").unwrap().shared);
    }
}
