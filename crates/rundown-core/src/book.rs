// Book loader/normaliser: turns a YAML document plus options into an
// immutable execution plan. Underlays merge beneath the document, overlays on
// top; map values merge recursively, lists and scalars replace.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};

use rundown_common::duration::parse_duration;
use rundown_common::errors::{Result, RundownError};

use crate::fetch;
use crate::step::{LoopSpec, StepDef};
use crate::store::is_reserved_key;

#[derive(Debug, Clone, Default)]
pub struct Book {
    pub path: Option<PathBuf>,
    pub desc: String,
    pub labels: Vec<String>,
    pub vars: Map<String, Value>,
    /// Raw runner specs from the document, in declaration order.
    pub runners: Vec<(String, Value)>,
    pub steps: Vec<StepDef>,
    pub debug: bool,
    pub interval: Duration,
    /// The document's interval value as written, for round-tripping.
    pub interval_str: String,
    pub if_cond: Option<String>,
    pub skip_test: bool,
    pub fail_fast: bool,
    pub force: bool,
    pub loop_spec: Option<LoopSpec>,
    /// Serialisation key: operators sharing it never run concurrently.
    pub concurrency: Option<String>,
    /// Dotted store paths whose values are masked in streamed output.
    pub secrets: Vec<String>,
}

impl Book {
    /// Directory for resolving relative includes and `json://` vars.
    pub fn dir(&self) -> Option<&Path> {
        self.path.as_deref().and_then(Path::parent)
    }

    /// Serialise the normalised book back to a document. Reloading the result
    /// yields an equivalent execution plan.
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();
        if !self.desc.is_empty() {
            doc.insert("desc".into(), Value::String(self.desc.clone()));
        }
        if !self.labels.is_empty() {
            doc.insert(
                "labels".into(),
                Value::Array(self.labels.iter().cloned().map(Value::String).collect()),
            );
        }
        if !self.runners.is_empty() {
            let mut runners = Map::new();
            for (name, spec) in &self.runners {
                runners.insert(name.clone(), spec.clone());
            }
            doc.insert("runners".into(), Value::Object(runners));
        }
        if !self.vars.is_empty() {
            doc.insert("vars".into(), Value::Object(self.vars.clone()));
        }
        if !self.secrets.is_empty() {
            doc.insert(
                "secrets".into(),
                Value::Array(self.secrets.iter().cloned().map(Value::String).collect()),
            );
        }
        if !self.interval_str.is_empty() {
            doc.insert("interval".into(), Value::String(self.interval_str.clone()));
        }
        if let Some(ref cond) = self.if_cond {
            doc.insert("if".into(), Value::String(cond.clone()));
        }
        if self.debug {
            doc.insert("debug".into(), Value::Bool(true));
        }
        if self.skip_test {
            doc.insert("skipTest".into(), Value::Bool(true));
        }
        if self.fail_fast {
            doc.insert("failFast".into(), Value::Bool(true));
        }
        if self.force {
            doc.insert("force".into(), Value::Bool(true));
        }
        if let Some(ref key) = self.concurrency {
            doc.insert("concurrency".into(), Value::String(key.clone()));
        }

        let sequence_form = self.steps.iter().all(|s| s.key == s.index.to_string());
        if sequence_form {
            doc.insert(
                "steps".into(),
                Value::Array(self.steps.iter().map(|s| s.raw.clone()).collect()),
            );
        } else {
            let mut steps = Map::new();
            for step in &self.steps {
                steps.insert(step.key.clone(), step.raw.clone());
            }
            doc.insert("steps".into(), Value::Object(steps));
        }
        Value::Object(doc)
    }
}

/// Load and normalise a book with no options.
pub async fn load_book(path: &str) -> Result<Book> {
    let (doc, local) = read_document(path).await?;
    build_book(doc, local, &[])
}

/// Read a book document, fetching through the cache for remote paths.
pub async fn read_document(path: &str) -> Result<(Value, Option<PathBuf>)> {
    let local = if fetch::is_remote(path) {
        fetch::fetch_to_cache(path).await?
    } else {
        PathBuf::from(path)
    };
    let doc = read_yaml(&local)?;
    Ok((doc, Some(local)))
}

pub fn read_yaml(path: &Path) -> Result<Value> {
    let bytes = std::fs::read(path).map_err(|e| RundownError::InvalidBook {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let yaml: serde_yaml::Value =
        serde_yaml::from_slice(&bytes).map_err(|e| RundownError::InvalidBook {
            path: path.display().to_string(),
            message: format!("YAML parse: {e}"),
        })?;
    Ok(yaml_to_json(yaml))
}

/// Normalise a merged document into a Book. `extra_runner_names` is the set
/// registered through options, needed to validate step selectors.
pub fn build_book(doc: Value, path: Option<PathBuf>, extra_runner_names: &[String]) -> Result<Book> {
    let path_str = path.as_ref().map(|p| p.display().to_string()).unwrap_or_default();
    let invalid = |message: String| RundownError::InvalidBook {
        path: path_str.clone(),
        message,
    };

    let doc = match doc {
        Value::Object(map) => map,
        other => return Err(invalid(format!("document must be a map, got {other}"))),
    };

    let desc = doc.get("desc").and_then(Value::as_str).unwrap_or_default().to_string();

    let labels = match doc.get("labels") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or_else(|| invalid("labels must be strings".into())))
            .collect::<Result<Vec<_>>>()?,
        _ => Vec::new(),
    };

    let base_dir = path.as_deref().and_then(Path::parent);
    let mut vars = match doc.get("vars") {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    expand_json_vars(&mut vars, base_dir)?;

    let runners: Vec<(String, Value)> = match doc.get("runners") {
        Some(Value::Object(map)) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => Vec::new(),
    };

    let mut runner_names: Vec<String> = runners.iter().map(|(n, _)| n.clone()).collect();
    for name in extra_runner_names {
        if !runner_names.contains(name) {
            runner_names.push(name.clone());
        }
    }

    let steps = parse_steps(doc.get("steps"), &runner_names, &path_str)?;

    // DEBUG in the environment forces the debug flag at load time.
    let env_debug = std::env::var("DEBUG").map(|v| truthy_env(&v)).unwrap_or(false);
    let debug = env_debug || doc.get("debug").and_then(Value::as_bool).unwrap_or(false);

    let (interval, interval_str) = match doc.get("interval") {
        Some(Value::String(s)) => (parse_duration(s)?, s.clone()),
        Some(Value::Number(n)) => (Duration::from_secs_f64(n.as_f64().unwrap_or(0.0)), n.to_string()),
        _ => (Duration::ZERO, String::new()),
    };

    let if_cond = doc.get("if").and_then(Value::as_str).map(str::to_string);
    let skip_test = doc.get("skipTest").and_then(Value::as_bool).unwrap_or(false);
    let fail_fast = doc.get("failFast").and_then(Value::as_bool).unwrap_or(false);
    let force = doc.get("force").and_then(Value::as_bool).unwrap_or(false);
    let concurrency = doc.get("concurrency").and_then(Value::as_str).map(str::to_string);

    let loop_spec = match doc.get("loop") {
        Some(v) => Some(LoopSpec::parse(v, &path_str)?),
        None => None,
    };

    let secrets = match doc.get("secrets") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };

    Ok(Book {
        path,
        desc,
        labels,
        vars,
        runners,
        steps,
        debug,
        interval,
        interval_str,
        if_cond,
        skip_test,
        fail_fast,
        force,
        loop_spec,
        concurrency,
        secrets,
    })
}

fn parse_steps(
    raw: Option<&Value>,
    runner_names: &[String],
    path_str: &str,
) -> Result<Vec<StepDef>> {
    let mut steps = Vec::new();
    match raw {
        // Sequence form: keys become "0", "1", ...
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                steps.push(StepDef::parse(i, i.to_string(), item, runner_names, path_str)?);
            }
        }
        // Mapping form: declaration order preserved, keys checked against the
        // reserved store keys.
        Some(Value::Object(map)) => {
            for (i, (key, item)) in map.iter().enumerate() {
                if is_reserved_key(key) {
                    return Err(RundownError::InvalidBook {
                        path: path_str.to_string(),
                        message: format!("step key {key:?} collides with a reserved store key"),
                    });
                }
                steps.push(StepDef::parse(i, key.clone(), item, runner_names, path_str)?);
            }
        }
        None => {}
        Some(other) => {
            return Err(RundownError::InvalidBook {
                path: path_str.to_string(),
                message: format!("steps must be a sequence or mapping, got {other}"),
            });
        }
    }
    Ok(steps)
}

/// Expand `json://path` var values into the parsed file contents.
pub fn expand_json_vars(vars: &mut Map<String, Value>, base: Option<&Path>) -> Result<()> {
    for (_, value) in vars.iter_mut() {
        if let Value::String(s) = value {
            if s.starts_with(fetch::JSON_SCHEME) {
                *value = fetch::load_json_var(s, base)?;
            }
        }
    }
    Ok(())
}

fn truthy_env(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Recursive merge: maps merge key-by-key, everything else (lists included)
/// is replaced by the layer value.
pub fn deep_merge(base: &mut Value, layer: &Value) {
    match (base, layer) {
        (Value::Object(base_map), Value::Object(layer_map)) => {
            for (k, v) in layer_map {
                match base_map.get_mut(k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        base_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (base, layer) => {
            *base = layer.clone();
        }
    }
}

/// Convert YAML to JSON values; mapping keys are stringified.
pub fn yaml_to_json(yaml: serde_yaml::Value) -> Value {
    match yaml {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else {
                Value::from(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_yaml::Value::String(s) => Value::String(s),
        serde_yaml::Value::Sequence(seq) => {
            Value::Array(seq.into_iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(map) => {
            let mut out = Map::new();
            for (k, v) in map {
                let key = match k {
                    serde_yaml::Value::String(s) => s,
                    serde_yaml::Value::Number(n) => n.to_string(),
                    serde_yaml::Value::Bool(b) => b.to_string(),
                    other => serde_yaml::to_string(&other).unwrap_or_default().trim().to_string(),
                };
                out.insert(key, yaml_to_json(v));
            }
            Value::Object(out)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(tagged.value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(yaml: &str) -> Value {
        yaml_to_json(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn sequence_steps_get_index_keys() {
        let book = build_book(
            doc(r#"
desc: seq
runners:
  req: https://example.com
steps:
  - req:
      /a:
        get: null
  - test: "true"
"#),
            None,
            &[],
        )
        .unwrap();
        assert_eq!(book.steps.len(), 2);
        assert_eq!(book.steps[0].key, "0");
        assert_eq!(book.steps[1].key, "1");
        assert_eq!(book.steps[1].runner_key, "test");
    }

    #[test]
    fn mapping_steps_keep_declaration_order() {
        let book = build_book(
            doc(r#"
steps:
  zeta:
    test: "true"
  alpha:
    test: "true"
  middle:
    test: "true"
"#),
            None,
            &[],
        )
        .unwrap();
        let keys: Vec<&str> = book.steps.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "middle"]);
    }

    #[test]
    fn reserved_step_key_is_invalid() {
        let err = build_book(
            doc(r#"
steps:
  current:
    test: "true"
"#),
            None,
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, RundownError::InvalidBook { .. }));
    }

    #[test]
    fn interval_string_is_preserved() {
        let book = build_book(doc("interval: 5\nsteps: []"), None, &[]).unwrap();
        assert_eq!(book.interval_str, "5");
        assert_eq!(book.interval, Duration::from_secs(5));

        let book = build_book(doc("interval: 500ms\nsteps: []"), None, &[]).unwrap();
        assert_eq!(book.interval_str, "500ms");
        assert_eq!(book.interval, Duration::from_millis(500));
    }

    #[test]
    fn option_runner_names_extend_selector_set() {
        let result = build_book(
            doc(r#"
steps:
  - myrunner:
      /a:
        get: null
"#),
            None,
            &["myrunner".to_string()],
        );
        assert!(result.is_ok());
    }

    #[test]
    fn deep_merge_maps_merge_lists_replace() {
        let mut base = json!({
            "vars": {"a": 1, "b": 2},
            "labels": ["x", "y"],
            "desc": "base",
        });
        deep_merge(
            &mut base,
            &json!({
                "vars": {"b": 20, "c": 30},
                "labels": ["z"],
            }),
        );
        assert_eq!(base["vars"], json!({"a": 1, "b": 20, "c": 30}));
        assert_eq!(base["labels"], json!(["z"]));
        assert_eq!(base["desc"], json!("base"));
    }

    #[test]
    fn disjoint_overlay_underlay_commute() {
        let base = json!({"vars": {"a": 1}});
        let overlay = json!({"vars": {"b": 2}});
        let underlay = json!({"vars": {"c": 3}});

        // overlay then underlay
        let mut first = underlay.clone();
        {
            let mut doc = base.clone();
            deep_merge(&mut doc, &overlay);
            deep_merge(&mut first, &doc);
        }
        // underlay then overlay
        let mut second = underlay.clone();
        deep_merge(&mut second, &base);
        deep_merge(&mut second, &overlay);

        assert_eq!(first, second);
    }

    #[test]
    fn yaml_numeric_keys_become_strings() {
        let v = doc("steps:\n  1:\n    test: 'true'\n");
        assert!(v["steps"].get("1").is_some());
    }
}
