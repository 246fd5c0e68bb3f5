// Include resolver: runs a child runbook inline on the parent's task.
// The child sees a snapshot of the parent store under `parent`, shares the
// parent's runners by reference, and reports failures wrapped as an
// included-run error.

use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};

use rundown_common::errors::{IncludedRunError, Result, RundownError};
use rundown_common::expr;
use rundown_common::scope;

use crate::book::expand_json_vars;
use crate::fetch;
use crate::operator::Operator;
use crate::options::Options;
use crate::step::StepDef;

#[derive(Debug, Clone, Default)]
pub struct IncludeConfig {
    pub path: String,
    pub vars: Map<String, Value>,
    /// Runner overrides: name -> spec, rebinding the child's runner names.
    pub runners: Map<String, Value>,
    pub skip_test: Option<bool>,
    pub force: Option<bool>,
}

impl IncludeConfig {
    pub fn from_payload(payload: &Value) -> std::result::Result<Self, String> {
        match payload {
            Value::String(path) => Ok(Self { path: path.clone(), ..Default::default() }),
            Value::Object(map) => {
                let path = map
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or("include needs a path")?
                    .to_string();
                let vars = map.get("vars").and_then(Value::as_object).cloned().unwrap_or_default();
                let runners =
                    map.get("runners").and_then(Value::as_object).cloned().unwrap_or_default();
                Ok(Self {
                    path,
                    vars,
                    runners,
                    skip_test: map.get("skipTest").and_then(Value::as_bool),
                    force: map.get("force").and_then(Value::as_bool),
                })
            }
            other => Err(format!("invalid include payload: {other}")),
        }
    }
}

pub(crate) fn run_include<'a>(
    op: &'a mut Operator,
    step: &'a StepDef,
) -> Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>> {
    Box::pin(run_include_inner(op, step))
}

async fn run_include_inner(op: &mut Operator, step: &StepDef) -> Result<Value> {
    let cfg = IncludeConfig::from_payload(&step.payload).map_err(|m| RundownError::InvalidBook {
        path: op.book_path.as_ref().map(|p| p.display().to_string()).unwrap_or_default(),
        message: format!("step {}: {m}", step.key),
    })?;

    let parent_snapshot = op.store.to_map();

    // Include vars are evaluated in the parent context before the child
    // exists; `json://` references resolve relative to the parent book.
    let mut vars = Map::new();
    for (k, v) in &cfg.vars {
        let rendered = expr::render_value(v, &parent_snapshot, op.store.funcs())?;
        vars.insert(k.clone(), rendered);
    }
    expand_json_vars(&mut vars, op.book_path.as_deref().and_then(|p| p.parent()))?;

    let child_path = resolve_child_path(op, &cfg.path)?;

    let mut child_opts = Options::new()
        .vars(vars)
        .debug(op.debug)
        .skip_test(cfg.skip_test.unwrap_or(op.skip_test))
        .stdout(op.stdout.clone())
        .stderr(op.stderr.clone())
        .wait_timeout(op.wait_timeout);
    if let Some(force) = cfg.force {
        child_opts = child_opts.force(force);
    }
    child_opts.funcs = op.store.funcs().clone();
    child_opts.capturers = op.options.capturers.clone();
    child_opts.secrets = op.options.secrets.clone();
    // Runner overrides declared on the include step rebind those names for
    // the child; the overriding runners are constructed fresh and owned by
    // it. Specs are rendered in the parent context like include vars.
    for (name, spec) in &cfg.runners {
        let rendered = expr::render_value(spec, &parent_snapshot, op.store.funcs())?;
        child_opts = child_opts.runner(name.clone(), rendered);
    }
    // Every remaining parent runner is handed down by reference; the child
    // must not close them.
    for (name, entry) in op.registry.iter() {
        if cfg.runners.contains_key(name) {
            continue;
        }
        child_opts.injected.push((name.to_string(), entry.runner.clone()));
    }

    let mut child = Operator::load_path(&child_path, &child_opts)
        .await
        .map_err(|e| wrap(&cfg.path, e))?;
    child.included = true;
    child.store.set_parent(parent_snapshot);
    child.masker = op.masker.clone();
    child.set_cancel(op.cancel.child_token());
    child.trace_chain = {
        let mut chain = op.trace_chain.clone();
        chain.push(op.id.clone());
        chain
    };

    let run = child.run().await;
    let rendered = child.store.to_map();
    run.map_err(|e| wrap(&cfg.path, e))?;

    Ok(prune_child_map(rendered))
}

fn wrap(path: &str, e: RundownError) -> RundownError {
    RundownError::Included(IncludedRunError::new(path, e))
}

/// Resolve the child path against the parent book directory. Remote children
/// go through the read-remote gate in the fetcher; a relative path that
/// escapes the parent directory needs the read-parent scope.
fn resolve_child_path(op: &Operator, path: &str) -> Result<String> {
    if fetch::is_remote(path) {
        return Ok(path.to_string());
    }
    if std::path::Path::new(path).is_absolute() {
        return Ok(path.to_string());
    }
    if path.starts_with("..") && !scope::allow_read_parent() {
        return Err(RundownError::PermissionDenied(format!(
            "including {path} outside the book directory requires the read:parent scope"
        )));
    }
    let base = op
        .book_path
        .as_deref()
        .and_then(|p| p.parent())
        .map(|p| p.to_path_buf())
        .unwrap_or_default();
    Ok(base.join(path).display().to_string())
}

/// The child store rendered as the include step's output: `steps`, `vars`,
/// aliases and friends, without the ambient keys that would bloat the parent
/// store.
fn prune_child_map(mut rendered: Value) -> Value {
    if let Value::Object(ref mut map) = rendered {
        map.remove("env");
        map.remove("parent");
        map.remove("runn");
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_string_is_a_path() {
        let cfg = IncludeConfig::from_payload(&json!("child.yml")).unwrap();
        assert_eq!(cfg.path, "child.yml");
        assert!(cfg.vars.is_empty());
    }

    #[test]
    fn payload_map_carries_vars_and_flags() {
        let cfg = IncludeConfig::from_payload(&json!({
            "path": "child.yml",
            "vars": {"foo": "bar"},
            "skipTest": true,
        }))
        .unwrap();
        assert_eq!(cfg.path, "child.yml");
        assert_eq!(cfg.vars["foo"], json!("bar"));
        assert_eq!(cfg.skip_test, Some(true));
    }

    #[test]
    fn payload_map_requires_path() {
        assert!(IncludeConfig::from_payload(&json!({"vars": {}})).is_err());
    }

    #[test]
    fn payload_map_carries_runner_overrides() {
        let cfg = IncludeConfig::from_payload(&json!({
            "path": "child.yml",
            "runners": {"svc": "grpc://localhost:50051"},
        }))
        .unwrap();
        assert_eq!(cfg.runners["svc"], json!("grpc://localhost:50051"));
    }

    #[test]
    fn pruned_map_drops_ambient_keys() {
        let pruned = prune_child_map(json!({
            "vars": {"a": 1},
            "steps": [],
            "env": {"HOME": "/root"},
            "parent": {},
            "runn": {"kv": {}},
        }));
        let map = pruned.as_object().unwrap();
        assert!(map.contains_key("vars"));
        assert!(map.contains_key("steps"));
        assert!(!map.contains_key("env"));
        assert!(!map.contains_key("parent"));
    }
}
