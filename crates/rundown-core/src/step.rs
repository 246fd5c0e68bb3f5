// Step model: one unit of work bound to exactly one runner, plus the
// modifiers that wrap it (if, loop, test, defer, desc).

use std::time::Duration;

use serde_json::Value;

use rundown_common::duration::parse_duration;
use rundown_common::errors::{Result, RundownError};

/// Modifier keys that may accompany the runner selector in a step map.
const MODIFIER_KEYS: &[&str] = &["test", "if", "loop", "desc", "defer", "retry"];

/// Default iteration cap for an until-loop that does not set a count.
pub const DEFAULT_UNTIL_ITERATIONS: u64 = 3;

/// Default backoff multiplier when min/max intervals are both set.
pub const DEFAULT_LOOP_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone)]
pub struct StepDef {
    pub index: usize,
    /// Stable key: the user-assigned map key, or the zero-padded index for
    /// sequence-form books.
    pub key: String,
    pub desc: Option<String>,
    /// Registry name ("req", "db", ...) or a built-in selector
    /// (exec/include/test/dump/bind/wait).
    pub runner_key: String,
    /// Unrendered command payload; templated against the store at dispatch.
    pub payload: Value,
    pub test: Option<String>,
    pub if_cond: Option<String>,
    pub loop_spec: Option<LoopSpec>,
    pub defer: bool,
    /// The step map as written, for re-serialising the normalised book.
    pub raw: Value,
}

impl StepDef {
    /// Parse one step map. `runner_names` is the set of known runner names
    /// (document `runners:` plus option-registered ones).
    pub fn parse(
        index: usize,
        key: String,
        raw: &Value,
        runner_names: &[String],
        book_path: &str,
    ) -> Result<Self> {
        let map = raw.as_object().ok_or_else(|| RundownError::InvalidBook {
            path: book_path.to_string(),
            message: format!("step {key} is not a map"),
        })?;

        let mut selector: Option<(String, Value)> = None;
        for (k, v) in map {
            if MODIFIER_KEYS.contains(&k.as_str()) {
                continue;
            }
            let known = is_builtin_selector(k) || runner_names.iter().any(|n| n == k);
            if !known {
                return Err(RundownError::InvalidBook {
                    path: book_path.to_string(),
                    message: format!("step {key}: unknown runner {k:?}"),
                });
            }
            if let Some((prev, _)) = &selector {
                return Err(RundownError::InvalidBook {
                    path: book_path.to_string(),
                    message: format!("step {key}: multiple runner selectors ({prev}, {k})"),
                });
            }
            selector = Some((k.clone(), v.clone()));
        }
        // `test` doubles as a selector: a step carrying only a test
        // expression is a test step.
        let (runner_key, payload) = match selector {
            Some(found) => found,
            None => match map.get("test") {
                Some(v) => ("test".to_string(), v.clone()),
                None => {
                    return Err(RundownError::InvalidBook {
                        path: book_path.to_string(),
                        message: format!("step {key}: no runner selector"),
                    });
                }
            },
        };

        let test = string_field(map.get("test"));
        let if_cond = string_field(map.get("if"));
        let desc = string_field(map.get("desc"));
        let defer = map.get("defer").and_then(Value::as_bool).unwrap_or(false);

        let mut loop_spec = match map.get("loop") {
            Some(v) => Some(LoopSpec::parse(v, book_path)?),
            None => None,
        };
        // `retry:` is loop sugar: an until-loop whose condition defaults to
        // the step's own test expression.
        if let Some(retry) = map.get("retry") {
            if loop_spec.is_some() {
                return Err(RundownError::InvalidBook {
                    path: book_path.to_string(),
                    message: format!("step {key}: both loop and retry set"),
                });
            }
            let mut spec = LoopSpec::parse(retry, book_path)?;
            if spec.until.is_none() {
                spec.until = test.clone();
            }
            loop_spec = Some(spec);
        }

        Ok(Self {
            index,
            key,
            desc,
            runner_key,
            payload,
            test,
            if_cond,
            loop_spec,
            defer,
            raw: raw.clone(),
        })
    }
}

/// Selectors handled by the operator itself rather than a registered runner.
pub fn is_builtin_selector(key: &str) -> bool {
    matches!(key, "exec" | "include" | "test" | "dump" | "bind" | "wait")
}

fn string_field(v: Option<&Value>) -> Option<String> {
    match v {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Loop envelope: a fixed count, or an until-expression with backoff.
#[derive(Debug, Clone)]
pub struct LoopSpec {
    /// Iteration count; an expression evaluated against the store at loop
    /// entry. For until-loops this caps the iterations.
    pub count: Option<String>,
    pub until: Option<String>,
    pub interval: Option<Duration>,
    pub min_interval: Option<Duration>,
    pub max_interval: Option<Duration>,
    /// Fraction of the interval added as random jitter (0..1).
    pub jitter: Option<f64>,
    pub multiplier: f64,
}

impl LoopSpec {
    pub fn parse(raw: &Value, book_path: &str) -> Result<Self> {
        match raw {
            // `loop: 3` shorthand
            Value::Number(n) => Ok(Self::count_only(n.to_string())),
            Value::String(s) => Ok(Self::count_only(s.clone())),
            Value::Object(map) => {
                let count = map.get("count").map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
                let until = match map.get("until") {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(other) => Some(other.to_string()),
                    None => None,
                };
                let interval = duration_field(map.get("interval"), book_path)?;
                let min_interval = duration_field(map.get("minInterval"), book_path)?;
                let max_interval = duration_field(map.get("maxInterval"), book_path)?;
                let jitter = map.get("jitter").and_then(Value::as_f64);
                let multiplier = map
                    .get("multiplier")
                    .and_then(Value::as_f64)
                    .unwrap_or(DEFAULT_LOOP_MULTIPLIER);
                if count.is_none() && until.is_none() {
                    return Err(RundownError::InvalidBook {
                        path: book_path.to_string(),
                        message: "loop needs count or until".to_string(),
                    });
                }
                Ok(Self { count, until, interval, min_interval, max_interval, jitter, multiplier })
            }
            other => Err(RundownError::InvalidBook {
                path: book_path.to_string(),
                message: format!("invalid loop spec: {other}"),
            }),
        }
    }

    fn count_only(count: String) -> Self {
        Self {
            count: Some(count),
            until: None,
            interval: None,
            min_interval: None,
            max_interval: None,
            jitter: None,
            multiplier: DEFAULT_LOOP_MULTIPLIER,
        }
    }

    /// Iteration cap: the count when set, otherwise the until-loop default.
    pub fn max_iterations(&self, counted: Option<u64>) -> u64 {
        match counted {
            Some(n) => n,
            None => DEFAULT_UNTIL_ITERATIONS,
        }
    }
}

fn duration_field(v: Option<&Value>, book_path: &str) -> Result<Option<Duration>> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(parse_duration(s)?)),
        Some(Value::Number(n)) => Ok(Some(Duration::from_secs_f64(n.as_f64().unwrap_or(0.0)))),
        Some(other) => Err(RundownError::InvalidBook {
            path: book_path.to_string(),
            message: format!("invalid duration: {other}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names() -> Vec<String> {
        vec!["req".to_string(), "db".to_string()]
    }

    #[test]
    fn parses_runner_selector_and_modifiers() {
        let raw = json!({
            "req": {"/users": {"get": null}},
            "test": "current.status == 200",
            "if": "vars.enabled",
            "desc": "list users",
        });
        let step = StepDef::parse(0, "0".to_string(), &raw, &names(), "book.yml").unwrap();
        assert_eq!(step.runner_key, "req");
        assert_eq!(step.test.as_deref(), Some("current.status == 200"));
        assert_eq!(step.if_cond.as_deref(), Some("vars.enabled"));
        assert!(!step.defer);
    }

    #[test]
    fn rejects_zero_selectors() {
        let raw = json!({"test": "true"});
        // `test` alone is a selector, so drop it too
        let raw2 = json!({"desc": "nothing"});
        assert!(StepDef::parse(0, "0".into(), &raw, &names(), "b").is_ok());
        assert!(StepDef::parse(0, "0".into(), &raw2, &names(), "b").is_err());
    }

    #[test]
    fn rejects_two_selectors() {
        let raw = json!({"req": {"/": {"get": null}}, "exec": {"command": "true"}});
        let err = StepDef::parse(0, "0".into(), &raw, &names(), "b").unwrap_err();
        assert!(matches!(err, RundownError::InvalidBook { .. }));
    }

    #[test]
    fn rejects_unknown_runner() {
        let raw = json!({"greq": {"svc/Method": {}}});
        assert!(StepDef::parse(0, "0".into(), &raw, &names(), "b").is_err());
    }

    #[test]
    fn loop_shorthand_number() {
        let raw = json!({"exec": {"command": "true"}, "loop": 3});
        let step = StepDef::parse(0, "0".into(), &raw, &names(), "b").unwrap();
        let spec = step.loop_spec.unwrap();
        assert_eq!(spec.count.as_deref(), Some("3"));
        assert!(spec.until.is_none());
    }

    #[test]
    fn loop_until_with_backoff() {
        let raw = json!({
            "exec": {"command": "true"},
            "loop": {
                "until": "current.exit_code == 0",
                "minInterval": "500ms",
                "maxInterval": 10,
                "jitter": 0.2,
            },
        });
        let step = StepDef::parse(0, "0".into(), &raw, &names(), "b").unwrap();
        let spec = step.loop_spec.unwrap();
        assert_eq!(spec.min_interval, Some(Duration::from_millis(500)));
        assert_eq!(spec.max_interval, Some(Duration::from_secs(10)));
        assert_eq!(spec.multiplier, DEFAULT_LOOP_MULTIPLIER);
        assert_eq!(spec.max_iterations(None), DEFAULT_UNTIL_ITERATIONS);
    }

    #[test]
    fn retry_defaults_until_to_test() {
        let raw = json!({
            "exec": {"command": "true"},
            "test": "current.exit_code == 0",
            "retry": {"count": 5, "interval": "100ms"},
        });
        let step = StepDef::parse(0, "0".into(), &raw, &names(), "b").unwrap();
        let spec = step.loop_spec.unwrap();
        assert_eq!(spec.until.as_deref(), Some("current.exit_code == 0"));
        assert_eq!(spec.count.as_deref(), Some("5"));
    }
}
