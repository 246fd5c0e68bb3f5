// Load options: everything a caller can bind onto a book before execution.
// Applied in call order; later same-key values win. Also carries the
// selection options the scheduler consumes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};

use rundown_common::errors::Result;
use rundown_common::expr::UserFunc;
use rundown_common::scope;

use crate::capture::Capturer;
use crate::runner::StepRunner;
use crate::scheduler::{Concurrency, Shuffle};
use crate::sink::SharedSink;

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Default)]
pub struct Options {
    pub(crate) book_path: Option<String>,
    pub(crate) overlays: Vec<String>,
    pub(crate) underlays: Vec<String>,
    pub(crate) vars: Map<String, Value>,
    /// Runner specs to construct (owned by the operator).
    pub(crate) runner_specs: Vec<(String, Value)>,
    /// Pre-built runners (shared; never closed by the operator).
    pub(crate) injected: Vec<(String, Arc<dyn StepRunner>)>,
    pub(crate) funcs: HashMap<String, UserFunc>,
    pub(crate) debug: Option<bool>,
    pub(crate) fail_fast: Option<bool>,
    pub(crate) skip_test: Option<bool>,
    pub(crate) force: Option<bool>,
    pub(crate) interval: Option<Duration>,
    pub(crate) grpc_no_tls: bool,
    pub(crate) secrets: Vec<String>,
    pub(crate) host_rules: Map<String, Value>,
    pub(crate) stdout: Option<SharedSink>,
    pub(crate) stderr: Option<SharedSink>,
    pub(crate) capturers: Vec<Arc<dyn Capturer>>,
    pub(crate) wait_timeout: Option<Duration>,

    // Selection options, consumed by the scheduler rather than the loader.
    pub(crate) run_match: Option<String>,
    pub(crate) run_ids: Vec<String>,
    pub(crate) run_labels: Vec<String>,
    pub(crate) sample: Option<usize>,
    pub(crate) shuffle: Shuffle,
    pub(crate) concurrency: Concurrency,
    pub(crate) shard: Option<(usize, usize)>,
    pub(crate) skip_included: bool,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set or replace the primary document path (local or remote URI).
    pub fn book(mut self, path: impl Into<String>) -> Self {
        self.book_path = Some(path.into());
        self
    }

    /// Deep-merge a document on top of the book; later overlays win.
    pub fn overlay(mut self, path: impl Into<String>) -> Self {
        self.overlays.push(path.into());
        self
    }

    /// Deep-merge a document beneath the book.
    pub fn underlay(mut self, path: impl Into<String>) -> Self {
        self.underlays.push(path.into());
        self
    }

    /// Seed or override one initial var. String values of the form
    /// `json://path` are loaded and parsed at load time.
    pub fn var(mut self, key: impl Into<String>, value: Value) -> Self {
        self.vars.insert(key.into(), value);
        self
    }

    pub fn vars(mut self, vars: Map<String, Value>) -> Self {
        self.vars.extend(vars);
        self
    }

    /// Register a runner by URI string or config map; same-name duplicates
    /// override.
    pub fn runner(mut self, name: impl Into<String>, spec: Value) -> Self {
        let name = name.into();
        self.runner_specs.retain(|(n, _)| *n != name);
        self.runner_specs.push((name, spec));
        self
    }

    /// Inject a pre-constructed runner. Shared: the operator will not close it.
    pub fn shared_runner(mut self, name: impl Into<String>, runner: Arc<dyn StepRunner>) -> Self {
        self.injected.push((name.into(), runner));
        self
    }

    /// Register a user function usable inside expressions.
    pub fn func(mut self, name: impl Into<String>, f: UserFunc) -> Self {
        self.funcs.insert(name.into(), f);
        self
    }

    pub fn debug(mut self, on: bool) -> Self {
        self.debug = Some(on);
        self
    }

    pub fn fail_fast(mut self, on: bool) -> Self {
        self.fail_fast = Some(on);
        self
    }

    pub fn skip_test(mut self, on: bool) -> Self {
        self.skip_test = Some(on);
        self
    }

    pub fn force(mut self, on: bool) -> Self {
        self.force = Some(on);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn grpc_no_tls(mut self, on: bool) -> Self {
        self.grpc_no_tls = on;
        self
    }

    /// Union scope tokens into the process-wide gate.
    pub fn scopes<I, S>(self, tokens: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        scope::set_scopes(tokens)?;
        Ok(self)
    }

    /// Host -> address overrides handed to HTTP runner construction.
    pub fn host_rules(mut self, rules: Map<String, Value>) -> Self {
        self.host_rules.extend(rules);
        self
    }

    /// Add redaction paths (dotted references into the store).
    pub fn secret<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.secrets.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Redirect live output; the default discards it.
    pub fn stdout(mut self, sink: SharedSink) -> Self {
        self.stdout = Some(sink);
        self
    }

    pub fn stderr(mut self, sink: SharedSink) -> Self {
        self.stderr = Some(sink);
        self
    }

    pub fn capturer(mut self, capturer: Arc<dyn Capturer>) -> Self {
        self.capturers.push(capturer);
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    // -- selection options ---------------------------------------------------

    /// Regex filter over runbook paths.
    pub fn run_match(mut self, pattern: impl Into<String>) -> Self {
        self.run_match = Some(pattern.into());
        self
    }

    /// Prefix filter over stable runbook IDs.
    pub fn run_id(mut self, id: impl Into<String>) -> Self {
        self.run_ids.push(id.into());
        self
    }

    /// Label-set filter.
    pub fn run_label(mut self, label: impl Into<String>) -> Self {
        self.run_labels.push(label.into());
        self
    }

    /// Take the first K after filtering and sharding.
    pub fn sample(mut self, k: usize) -> Self {
        self.sample = Some(k);
        self
    }

    pub fn shuffle(mut self, shuffle: Shuffle) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn concurrent(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Run only shard `index` of `n`, partitioned by stable path hash.
    pub fn shard(mut self, index: usize, n: usize) -> Self {
        self.shard = Some((index, n));
        self
    }

    /// Do not run standalone the books that are only reached via include.
    pub fn skip_included(mut self, on: bool) -> Self {
        self.skip_included = on;
        self
    }

    // -- accessors used by the engine ---------------------------------------

    pub(crate) fn stdout_sink(&self) -> SharedSink {
        self.stdout.clone().unwrap_or_default()
    }

    pub(crate) fn stderr_sink(&self) -> SharedSink {
        self.stderr.clone().unwrap_or_default()
    }

    pub(crate) fn wait_timeout_or_default(&self) -> Duration {
        self.wait_timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT)
    }

    /// Expand `json://` references in option vars relative to the working
    /// directory.
    pub(crate) fn expanded_vars(&self) -> Result<Map<String, Value>> {
        let mut vars = self.vars.clone();
        crate::book::expand_json_vars(&mut vars, None)?;
        Ok(vars)
    }
}

impl std::fmt::Debug for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Options")
            .field("book_path", &self.book_path)
            .field("overlays", &self.overlays)
            .field("underlays", &self.underlays)
            .field("vars", &self.vars)
            .field("runner_specs", &self.runner_specs.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("injected", &self.injected.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
