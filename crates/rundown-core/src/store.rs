// Per-operator mutable state: vars, accumulated step outputs, the parent
// snapshot for included runs, cookies, secrets, and user functions.
// Rendered to a fresh map at every expression-evaluation point; the rendered
// shape is the only thing expressions ever see.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};

use rundown_common::expr::{self, UserFunc};

/// Keys of the rendered store that a named step may not shadow.
pub const RESERVED_STORE_KEYS: &[&str] = &[
    "vars", "steps", "env", "previous", "current", "parent", "loop", "i", "cookies", "needs",
    "runn",
];

pub fn is_reserved_key(key: &str) -> bool {
    RESERVED_STORE_KEYS.contains(&key)
}

#[derive(Clone, Default)]
pub struct Store {
    vars: Map<String, Value>,
    funcs: HashMap<String, UserFunc>,
    steps: Vec<Value>,
    step_keys: Vec<String>,
    skipped: Vec<bool>,
    parent: Option<Value>,
    cookies: Arc<Mutex<Map<String, Value>>>,
    secrets: Vec<String>,
    loop_index: Option<u64>,
    kv: Map<String, Value>,
}

impl Store {
    pub fn new(vars: Map<String, Value>, funcs: HashMap<String, UserFunc>, secrets: Vec<String>) -> Self {
        Self { vars, funcs, secrets, ..Default::default() }
    }

    pub fn vars(&self) -> &Map<String, Value> {
        &self.vars
    }

    pub fn funcs(&self) -> &HashMap<String, UserFunc> {
        &self.funcs
    }

    pub fn secrets(&self) -> &[String] {
        &self.secrets
    }

    pub fn steps_len(&self) -> usize {
        self.steps.len()
    }

    pub fn step(&self, index: usize) -> Option<&Value> {
        self.steps.get(index)
    }

    /// Handle shared with HTTP runners so recorded cookies land in the store.
    pub fn cookie_jar(&self) -> Arc<Mutex<Map<String, Value>>> {
        Arc::clone(&self.cookies)
    }

    pub fn set_parent(&mut self, snapshot: Value) {
        self.parent = Some(snapshot);
    }

    pub fn parent(&self) -> Option<&Value> {
        self.parent.as_ref()
    }

    /// Record the terminal output of a step. Called exactly once per step.
    pub fn record(&mut self, key: &str, output: Value) {
        self.steps.push(output);
        self.step_keys.push(key.to_string());
        self.skipped.push(false);
    }

    /// Record an iteration of a looped step: the previous iteration's record
    /// for the same step is replaced so only the final one survives.
    pub fn record_iteration(&mut self, key: &str, output: Value, first: bool) {
        if !first {
            self.steps.pop();
            self.step_keys.pop();
            self.skipped.pop();
        }
        self.record(key, output);
    }

    /// Record a step skipped by its if-gate: an empty output that does not
    /// advance `current`/`previous`.
    pub fn record_skipped(&mut self, key: &str) {
        self.steps.push(json!({}));
        self.step_keys.push(key.to_string());
        self.skipped.push(true);
    }

    /// Output of the most recent non-skipped step.
    pub fn current(&self) -> Option<&Value> {
        self.live_indices().next_back().map(|i| &self.steps[i])
    }

    /// Output two non-skipped steps back.
    pub fn previous(&self) -> Option<&Value> {
        let mut live = self.live_indices();
        live.next_back();
        live.next_back().map(|i| &self.steps[i])
    }

    fn live_indices(&self) -> impl DoubleEndedIterator<Item = usize> + '_ {
        (0..self.steps.len()).filter(|&i| !self.skipped[i])
    }

    /// Assign into `vars`. Returns false when the key is reserved.
    pub fn bind(&mut self, key: &str, value: Value) -> bool {
        if is_reserved_key(key) {
            return false;
        }
        self.vars.insert(key.to_string(), value);
        true
    }

    pub fn set_loop_index(&mut self, i: u64) {
        self.loop_index = Some(i);
    }

    pub fn clear_loop_index(&mut self) {
        self.loop_index = None;
    }

    pub fn set_kv(&mut self, key: &str, value: Value) {
        self.kv.insert(key.to_string(), value);
    }

    /// Render the store for expression evaluation.
    ///
    /// Shape: `{vars, steps, <named step aliases>, previous?, current?, env,
    /// parent?, cookies?, i?, loop?, runn}`. Named-step aliases point at the
    /// same record as their positional entry.
    pub fn to_map(&self) -> Value {
        let mut map = Map::new();
        map.insert("vars".to_string(), Value::Object(self.vars.clone()));
        map.insert("steps".to_string(), Value::Array(self.steps.clone()));

        for (i, key) in self.step_keys.iter().enumerate() {
            if !key.is_empty() && key.parse::<u64>().is_err() {
                map.insert(key.clone(), self.steps[i].clone());
            }
        }

        if let Some(prev) = self.previous() {
            map.insert("previous".to_string(), prev.clone());
        }
        if let Some(cur) = self.current() {
            map.insert("current".to_string(), cur.clone());
        }

        let env: Map<String, Value> =
            std::env::vars().map(|(k, v)| (k, Value::String(v))).collect();
        map.insert("env".to_string(), Value::Object(env));

        if let Some(ref parent) = self.parent {
            map.insert("parent".to_string(), parent.clone());
        }

        let cookies = self.cookies.lock();
        if !cookies.is_empty() {
            map.insert("cookies".to_string(), Value::Object(cookies.clone()));
        }
        drop(cookies);

        if let Some(i) = self.loop_index {
            map.insert("i".to_string(), json!(i));
            map.insert("loop".to_string(), json!({ "index": i }));
        }

        map.insert("runn".to_string(), json!({ "kv": self.kv }));

        Value::Object(map)
    }

    /// Resolve the configured secret paths against the rendered store,
    /// returning the string forms to register with the masker.
    /// Paths that do not resolve are skipped, not errors.
    pub fn resolved_secrets(&self) -> Vec<String> {
        let rendered = self.to_map();
        let mut out = Vec::new();
        for path in &self.secrets {
            if let Ok(value) = expr::eval(path, &rendered) {
                if !value.is_null() {
                    let s = expr::value_to_string(&value);
                    if !s.is_empty() {
                        out.push(s);
                    }
                }
            }
        }
        out
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("vars", &self.vars)
            .field("steps", &self.steps.len())
            .field("secrets", &self.secrets)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(vars: Value) -> Store {
        let vars = match vars {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Store::new(vars, HashMap::new(), Vec::new())
    }

    #[test]
    fn current_and_previous_track_records() {
        let mut store = store_with(json!({}));
        assert!(store.current().is_none());

        store.record("0", json!({"a": 1}));
        assert_eq!(store.current(), Some(&json!({"a": 1})));
        assert!(store.previous().is_none());

        store.record("1", json!({"b": 2}));
        assert_eq!(store.current(), Some(&json!({"b": 2})));
        assert_eq!(store.previous(), Some(&json!({"a": 1})));
    }

    #[test]
    fn skipped_steps_do_not_advance_current() {
        let mut store = store_with(json!({}));
        store.record("0", json!({"a": 1}));
        store.record_skipped("1");
        assert_eq!(store.steps_len(), 2);
        assert_eq!(store.current(), Some(&json!({"a": 1})));
        assert!(store.previous().is_none());
    }

    #[test]
    fn named_step_alias_matches_positional_entry() {
        let mut store = store_with(json!({}));
        store.record("login", json!({"status": 200}));
        let rendered = store.to_map();
        assert_eq!(rendered["login"], rendered["steps"][0]);
        assert_eq!(rendered["current"], rendered["steps"][0]);
    }

    #[test]
    fn loop_iterations_keep_only_final_record() {
        let mut store = store_with(json!({}));
        store.record_iteration("0", json!({"i": 0}), true);
        store.record_iteration("0", json!({"i": 1}), false);
        store.record_iteration("0", json!({"i": 2}), false);
        assert_eq!(store.steps_len(), 1);
        assert_eq!(store.current(), Some(&json!({"i": 2})));
    }

    #[test]
    fn bind_rejects_reserved_keys() {
        let mut store = store_with(json!({}));
        assert!(!store.bind("steps", json!(1)));
        assert!(!store.bind("current", json!(1)));
        assert!(store.bind("answer", json!(42)));
        assert_eq!(store.vars()["answer"], json!(42));
    }

    #[test]
    fn resolved_secrets_skip_missing_paths() {
        let mut store = store_with(json!({"message": "hello"}));
        store.secrets = vec!["vars.message".to_string(), "vars.missing".to_string()];
        assert_eq!(store.resolved_secrets(), vec!["hello".to_string()]);
    }

    #[test]
    fn loop_index_appears_in_rendered_map() {
        let mut store = store_with(json!({}));
        store.set_loop_index(2);
        let rendered = store.to_map();
        assert_eq!(rendered["i"], json!(2));
        assert_eq!(rendered["loop"]["index"], json!(2));
        store.clear_loop_index();
        assert!(store.to_map().get("i").is_none());
    }
}
