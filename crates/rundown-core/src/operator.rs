// The operator executes one book: it owns the store, the runner registry, the
// failure policy, and the cleanup group, and drives every step through the
// if-gate -> loop -> dispatch -> record -> test -> interval pipeline.
// Deferred steps run LIFO after the main sequence on every exit path.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use rundown_common::errors::{Result, RundownError};
use rundown_common::expr;
use rundown_common::SecretMasker;

use crate::book::{self, Book};
use crate::capture::{CaptureChain, DebugCapturer, StepOutcome};
use crate::include;
use crate::options::Options;
use crate::runner::exec::ExecRunner;
use crate::runner::{build_runner, RunnerRegistry, StepContext};
use crate::sink::SharedSink;
use crate::step::{LoopSpec, StepDef};
use crate::store::Store;

/// Cleanup budget when the run was cancelled and defers still must go.
const DEFER_CLEANUP_BUDGET: Duration = Duration::from_secs(30);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Cleanup group
// ---------------------------------------------------------------------------

pub type CleanupFuture = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;
type CleanupFn = Box<dyn FnOnce() -> CleanupFuture + Send + 'static>;

/// LIFO collection of release actions (background commands, forwarders,
/// temp files) run on every exit path with error joining.
#[derive(Default)]
pub struct CleanupGroup {
    actions: Mutex<Vec<(String, CleanupFn)>>,
}

impl CleanupGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &self,
        label: impl Into<String>,
        action: impl FnOnce() -> CleanupFuture + Send + 'static,
    ) {
        self.actions.lock().push((label.into(), Box::new(action)));
    }

    pub fn len(&self) -> usize {
        self.actions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.lock().is_empty()
    }

    /// Run all collected actions in reverse registration order.
    pub async fn run_all(&self) -> Vec<RundownError> {
        let mut errors = Vec::new();
        loop {
            let next = self.actions.lock().pop();
            let Some((label, action)) = next else {
                break;
            };
            if let Err(e) = action().await {
                tracing::warn!(label = %label, error = %e, "cleanup action failed");
                errors.push(e);
            }
        }
        errors
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Structured record for one failed step.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub index: usize,
    pub key: String,
    pub runner: String,
    pub kind: &'static str,
    pub message: String,
}

/// Final per-operator summary.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub id: String,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failures: Vec<StepFailure>,
}

impl RunSummary {
    pub fn is_failed(&self) -> bool {
        self.failed > 0
    }
}

fn error_kind(e: &RundownError) -> &'static str {
    match e {
        RundownError::InvalidBook { .. } => "InvalidBook",
        RundownError::InvalidScope(_) => "InvalidScope",
        RundownError::PermissionDenied(_) => "PermissionDenied",
        RundownError::RunnerFailure { .. } => "RunnerError",
        RundownError::TestFailed { .. } => "TestFailed",
        RundownError::LoopExhausted { .. } => "LoopExhausted",
        RundownError::Expr { .. } => "ExprError",
        RundownError::Timeout(_) => "Timeout",
        RundownError::Canceled => "Canceled",
        RundownError::Included(_) => "IncludedRun",
        RundownError::ThresholdViolated { .. } => "ThresholdViolated",
        RundownError::Deferred(_) => "Deferred",
        RundownError::Io(_) => "Io",
    }
}

enum StepStatus {
    Ran,
    Skipped,
}

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

pub struct Operator {
    pub(crate) id: String,
    pub(crate) book_path: Option<PathBuf>,
    pub(crate) desc: String,
    pub(crate) labels: Vec<String>,
    pub(crate) steps: Vec<StepDef>,
    pub(crate) store: Store,
    pub(crate) registry: RunnerRegistry,
    pub(crate) debug: bool,
    pub(crate) interval: Duration,
    pub(crate) fail_fast: bool,
    pub(crate) skip_test: bool,
    pub(crate) force: bool,
    pub(crate) if_cond: Option<String>,
    pub(crate) book_loop: Option<LoopSpec>,
    pub(crate) concurrency_key: Option<String>,
    /// Set when this operator was created by an include step.
    pub(crate) included: bool,
    /// Ancestor run IDs, for trace propagation into transports.
    pub(crate) trace_chain: Vec<String>,
    pub(crate) capturers: CaptureChain,
    pub(crate) stdout: SharedSink,
    pub(crate) stderr: SharedSink,
    pub(crate) masker: SecretMasker,
    pub(crate) wait_timeout: Duration,
    pub(crate) cancel: CancellationToken,
    pub(crate) cleanup: Arc<CleanupGroup>,
    /// The options this operator was loaded with; includes and the load-test
    /// factory re-derive children and fresh instances from them.
    pub(crate) options: Options,
    summary: RunSummary,
    closed: bool,
}

impl std::fmt::Debug for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operator").field("id", &self.id).field("book_path", &self.book_path).finish()
    }
}

impl Operator {
    /// Load the book named by `options.book(...)` and bind it into a fresh
    /// operator.
    pub async fn load(options: &Options) -> Result<Self> {
        let path = options.book_path.clone().ok_or_else(|| RundownError::InvalidBook {
            path: String::new(),
            message: "no book path set".to_string(),
        })?;
        Self::load_path(&path, options).await
    }

    pub async fn load_path(path: &str, options: &Options) -> Result<Self> {
        let (mut doc, local) = book::read_document(path).await?;

        // Underlays merge beneath the document (the book wins), overlays on
        // top (the overlay wins); later overlays beat earlier ones.
        for underlay in &options.underlays {
            let (layer, _) = book::read_document(underlay).await?;
            let mut base = layer;
            book::deep_merge(&mut base, &doc);
            doc = base;
        }
        for overlay in &options.overlays {
            let (layer, _) = book::read_document(overlay).await?;
            book::deep_merge(&mut doc, &layer);
        }

        let mut extra_names: Vec<String> =
            options.runner_specs.iter().map(|(n, _)| n.clone()).collect();
        for (name, _) in &options.injected {
            if !extra_names.contains(name) {
                extra_names.push(name.clone());
            }
        }

        let book = book::build_book(doc, local, &extra_names)?;
        Self::bind(book, options)
    }

    /// Bind a normalised book plus options into an operator.
    pub fn bind(book: Book, options: &Options) -> Result<Self> {
        let path_str = book.path.as_ref().map(|p| p.display().to_string()).unwrap_or_default();

        let mut vars = book.vars.clone();
        for (k, v) in options.expanded_vars()? {
            vars.insert(k, v);
        }

        let mut secrets = book.secrets.clone();
        secrets.extend(options.secrets.iter().cloned());

        let mut registry = RunnerRegistry::new();
        registry.insert("exec", Arc::new(ExecRunner::new()), false);
        for (name, spec) in &book.runners {
            let spec = apply_grpc_no_tls(spec, options.grpc_no_tls);
            let spec = apply_host_rules(&spec, &options.host_rules);
            registry.insert(name, build_runner(name, &spec, &path_str)?, false);
        }
        for (name, spec) in &options.runner_specs {
            let spec = apply_grpc_no_tls(spec, options.grpc_no_tls);
            let spec = apply_host_rules(&spec, &options.host_rules);
            registry.insert(name, build_runner(name, &spec, &path_str)?, false);
        }
        for (name, runner) in &options.injected {
            registry.insert(name, Arc::clone(runner), true);
        }

        let debug = options.debug.unwrap_or(book.debug);
        let stdout = options.stdout_sink();
        let stderr = options.stderr_sink();

        let mut capturers = CaptureChain::new(options.capturers.clone());
        if debug {
            capturers.push(Arc::new(DebugCapturer::new(stderr.clone())));
        }

        let store = Store::new(vars, options.funcs.clone(), secrets);

        Ok(Self {
            id: crate::id::random_id(),
            book_path: book.path.clone(),
            desc: book.desc.clone(),
            labels: book.labels.clone(),
            steps: book.steps.clone(),
            store,
            registry,
            debug,
            interval: options.interval.unwrap_or(book.interval),
            fail_fast: options.fail_fast.unwrap_or(book.fail_fast),
            skip_test: options.skip_test.unwrap_or(book.skip_test),
            force: options.force.unwrap_or(book.force),
            if_cond: book.if_cond.clone(),
            book_loop: book.loop_spec.clone(),
            concurrency_key: book.concurrency.clone(),
            included: false,
            trace_chain: Vec::new(),
            capturers,
            stdout,
            stderr,
            masker: SecretMasker::new(),
            wait_timeout: options.wait_timeout_or_default(),
            cancel: CancellationToken::new(),
            cleanup: Arc::new(CleanupGroup::new()),
            options: options.clone(),
            summary: RunSummary::default(),
            closed: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn book_path(&self) -> Option<&PathBuf> {
        self.book_path.as_ref()
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn steps_count(&self) -> usize {
        self.steps.len()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &crate::runner::RunnerRegistry {
        &self.registry
    }

    pub fn concurrency_key(&self) -> Option<&str> {
        self.concurrency_key.as_deref()
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Token cancelling this operator's current and future runner calls.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn set_cancel(&mut self, token: CancellationToken) {
        self.cancel = token;
    }

    /// Steps that fail-fast may abort vs. deferred steps run afterwards.
    fn main_and_defer_indices(&self) -> (Vec<usize>, Vec<usize>) {
        let mut main = Vec::new();
        let mut defer = Vec::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.defer {
                defer.push(i);
            } else {
                main.push(i);
            }
        }
        // Defers run in reverse declaration order.
        defer.reverse();
        (main, defer)
    }

    /// Execute the book to completion or first fatal error. Defers and
    /// resource release run on every exit path. Returns an error when any
    /// step failed; per-step records stay available via [`Operator::summary`].
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_main().await;
        let deferred = self.run_defers().await;
        let close_errors = self.close_internal().await;

        self.summary.id = self.id.clone();
        self.capturers.each(|c| {
            c.on_runbook_end(
                &self.id,
                self.summary.succeeded,
                self.summary.failed,
                self.summary.skipped,
            )
        });
        self.emit_summary();

        let primary = result.err();
        let deferred_err = (!deferred.is_empty()).then(|| RundownError::Deferred(deferred));
        for e in close_errors {
            tracing::warn!(id = %self.id, error = %e, "runner close failed");
        }

        match (primary, deferred_err) {
            (Some(e), _) => Err(e),
            (None, Some(d)) => {
                self.summary.failed += 1;
                Err(d)
            }
            (None, None) => Ok(()),
        }
    }

    async fn run_main(&mut self) -> Result<()> {
        self.capturers.each(|c| {
            c.on_runbook_start(&self.id, &self.desc, self.book_path.as_deref())
        });

        if let Some(cond) = self.if_cond.clone() {
            let env = self.store.to_map();
            if !expr::eval_cond(&cond, &env, self.store.funcs())? {
                self.summary.skipped = self.steps.len();
                tracing::info!(id = %self.id, "runbook skipped by if-condition");
                return Ok(());
            }
        }

        let iterations = match self.book_loop.clone() {
            Some(spec) => self.loop_count(&spec)?.unwrap_or(1),
            None => 1,
        };

        let (main, _) = self.main_and_defer_indices();
        let mut first_error: Option<RundownError> = None;

        'outer: for _ in 0..iterations {
            for (pos, &idx) in main.iter().enumerate() {
                if self.cancel.is_cancelled() {
                    first_error = Some(RundownError::Canceled);
                    break 'outer;
                }
                match self.run_step(idx).await {
                    Ok(StepStatus::Ran) => self.summary.succeeded += 1,
                    Ok(StepStatus::Skipped) => self.summary.skipped += 1,
                    Err(e) => {
                        self.record_failure(idx, &e);
                        let abort = e.is_fatal() || (self.fail_fast && !self.force);
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                        if abort {
                            break 'outer;
                        }
                    }
                }
                // Book-level interval between steps.
                if !self.interval.is_zero() && pos + 1 < main.len() {
                    tokio::select! {
                        _ = tokio::time::sleep(self.interval) => {}
                        _ = self.cancel.cancelled() => {
                            first_error = Some(RundownError::Canceled);
                            break 'outer;
                        }
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run deferred steps in reverse declaration order. Failures accumulate
    /// and never stop later defers. When the run was cancelled, defers get a
    /// fresh token and a bounded budget.
    async fn run_defers(&mut self) -> Vec<RundownError> {
        let (_, defers) = self.main_and_defer_indices();
        if defers.is_empty() {
            return Vec::new();
        }

        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
            let deadline = tokio::time::Instant::now() + DEFER_CLEANUP_BUDGET;
            let mut errors = Vec::new();
            for idx in defers {
                let run = self.run_step(idx);
                match tokio::time::timeout_at(deadline, run).await {
                    Ok(Ok(StepStatus::Ran)) => self.summary.succeeded += 1,
                    Ok(Ok(StepStatus::Skipped)) => self.summary.skipped += 1,
                    Ok(Err(e)) => {
                        self.record_failure(idx, &e);
                        errors.push(e);
                    }
                    Err(_) => {
                        let e = RundownError::Timeout("defer cleanup budget exceeded".into());
                        self.record_failure(idx, &e);
                        errors.push(e);
                        break;
                    }
                }
            }
            return errors;
        }

        let mut errors = Vec::new();
        for idx in defers {
            match self.run_step(idx).await {
                Ok(StepStatus::Ran) => self.summary.succeeded += 1,
                Ok(StepStatus::Skipped) => self.summary.skipped += 1,
                Err(e) => {
                    self.record_failure(idx, &e);
                    errors.push(e);
                }
            }
        }
        errors
    }

    fn record_failure(&mut self, idx: usize, e: &RundownError) {
        let step = &self.steps[idx];
        let failure = StepFailure {
            index: step.index,
            key: step.key.clone(),
            runner: step.runner_key.clone(),
            kind: error_kind(e),
            message: e.to_string(),
        };
        tracing::error!(
            id = %self.id,
            step = failure.index,
            key = %failure.key,
            runner = %failure.runner,
            kind = failure.kind,
            "step failed: {}",
            failure.message,
        );
        self.summary.failed += 1;
        self.summary.failures.push(failure);
    }

    fn emit_summary(&self) {
        tracing::info!(
            id = %self.id,
            succeeded = self.summary.succeeded,
            failed = self.summary.failed,
            skipped = self.summary.skipped,
            "runbook finished",
        );
    }

    async fn run_step(&mut self, idx: usize) -> Result<StepStatus> {
        let step = self.steps[idx].clone();
        self.capturers.each(|c| c.on_step_start(&self.id, step.index, &step.key));

        // If-gate: false skips the step; evaluation errors are fatal.
        if let Some(ref cond) = step.if_cond {
            let env = self.store.to_map();
            if !expr::eval_cond(cond, &env, self.store.funcs())? {
                self.store.record_skipped(&step.key);
                self.capturers
                    .each(|c| c.on_step_end(&self.id, step.index, &step.key, &StepOutcome::Skipped));
                return Ok(StepStatus::Skipped);
            }
        }

        // Register the secrets resolvable at this point so live output of the
        // dispatch below is already masked.
        for secret in self.store.resolved_secrets() {
            self.masker.add_value(&secret);
        }

        let run = self.run_step_body(&step).await;
        match &run {
            Ok(_) => {
                self.capturers
                    .each(|c| c.on_step_end(&self.id, step.index, &step.key, &StepOutcome::Success));
            }
            Err(e) => {
                let outcome = StepOutcome::Failure(e.to_string());
                self.capturers
                    .each(|c| c.on_step_end(&self.id, step.index, &step.key, &outcome));
            }
        }
        run?;
        Ok(StepStatus::Ran)
    }

    async fn run_step_body(&mut self, step: &StepDef) -> Result<()> {
        match step.loop_spec.clone() {
            Some(spec) => self.run_looped(step, &spec).await?,
            None => {
                let output = self.dispatch(step).await;
                match output {
                    Ok(v) => self.store.record(&step.key, v),
                    Err(e) => {
                        self.store.record(&step.key, json!({ "error": e.to_string() }));
                        return Err(e);
                    }
                }
            }
        }

        // Test phase. A dedicated `test` step already ran its expression in
        // dispatch; this covers the `test:` modifier on other steps.
        if let Some(ref test) = step.test {
            if !self.skip_test && step.runner_key != "test" {
                self.eval_test(test, &step.key)?;
            }
        }
        Ok(())
    }

    async fn run_looped(&mut self, step: &StepDef, spec: &LoopSpec) -> Result<()> {
        let counted = self.loop_count(spec)?;
        let max = spec.max_iterations(counted);
        let mut interval = spec.interval.or(spec.min_interval).unwrap_or(Duration::ZERO);
        let mut satisfied = spec.until.is_none();

        for i in 0..max {
            if self.cancel.is_cancelled() {
                self.store.clear_loop_index();
                return Err(RundownError::Canceled);
            }
            self.store.set_loop_index(i);

            let output = self.dispatch(step).await;
            match output {
                Ok(v) => self.store.record_iteration(&step.key, v, i == 0),
                Err(e) => {
                    self.store.clear_loop_index();
                    self.store.record_iteration(
                        &step.key,
                        json!({ "error": e.to_string() }),
                        i == 0,
                    );
                    return Err(e);
                }
            }

            if let Some(ref until) = spec.until {
                let env = self.store.to_map();
                if expr::eval_cond(until, &env, self.store.funcs())? {
                    satisfied = true;
                    break;
                }
            }

            if i + 1 < max && !interval.is_zero() {
                let sleep = jittered(interval, spec.jitter);
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = self.cancel.cancelled() => {
                        self.store.clear_loop_index();
                        return Err(RundownError::Canceled);
                    }
                }
                interval = next_backoff(interval, spec);
            }
        }
        self.store.clear_loop_index();

        if !satisfied {
            return Err(RundownError::LoopExhausted {
                iterations: max,
                expr: spec.until.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn loop_count(&self, spec: &LoopSpec) -> Result<Option<u64>> {
        match &spec.count {
            None => Ok(None),
            Some(count) => {
                let env = self.store.to_map();
                let v = expr::eval_with_funcs(count, &env, self.store.funcs())?;
                let n = v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())).ok_or(
                    RundownError::Expr {
                        expr: count.clone(),
                        message: format!("loop count is not a number: {v}"),
                    },
                )?;
                Ok(Some(n))
            }
        }
    }

    fn eval_test(&self, test: &str, step_key: &str) -> Result<()> {
        let env = self.store.to_map();
        match expr::eval_cond(test, &env, self.store.funcs()) {
            Ok(true) => Ok(()),
            Ok(false) => Err(RundownError::TestFailed {
                step: step_key.to_string(),
                expr: test.to_string(),
            }),
            Err(e) => Err(RundownError::TestFailed {
                step: step_key.to_string(),
                expr: format!("{test} ({e})"),
            }),
        }
    }

    /// Select and invoke the runner for one step, returning its output record.
    async fn dispatch(&mut self, step: &StepDef) -> Result<Value> {
        match step.runner_key.as_str() {
            "test" => self.run_test_pseudo(step),
            "dump" => self.run_dump(step),
            "bind" => self.run_bind(step),
            "wait" => self.run_wait(step).await,
            // Boxed: includes recurse through the whole run pipeline.
            "include" => include::run_include(self, step).await,
            name => {
                let env = self.store.to_map();
                let payload = expr::render_value(&step.payload, &env, self.store.funcs())?;
                let entry = self.registry.get(name).ok_or_else(|| RundownError::InvalidBook {
                    path: self.path_str(),
                    message: format!("step {}: no runner named {name:?}", step.key),
                })?;
                let runner = Arc::clone(&entry.runner);
                let ctx = self.step_context(step, payload, env);
                runner.run(&ctx).await
            }
        }
    }

    fn step_context(&self, step: &StepDef, payload: Value, store_env: Value) -> StepContext {
        let mut trace_chain = self.trace_chain.clone();
        trace_chain.push(self.id.clone());
        StepContext {
            step_index: step.index,
            step_key: step.key.clone(),
            payload,
            store: store_env,
            cancel: self.cancel.clone(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            masker: self.masker.clone(),
            capturers: self.capturers.clone(),
            trace_chain,
            cookies: self.store.cookie_jar(),
            cleanup: Arc::clone(&self.cleanup),
            wait_timeout: self.wait_timeout,
        }
    }

    // -- pseudo-runners ------------------------------------------------------

    /// `test:` as a step selector: drives only its expression.
    fn run_test_pseudo(&self, step: &StepDef) -> Result<Value> {
        let test = step.payload.as_str().ok_or_else(|| RundownError::InvalidBook {
            path: self.path_str(),
            message: format!("step {}: test payload must be an expression", step.key),
        })?;
        if self.skip_test {
            return Ok(json!({}));
        }
        self.eval_test(test, &step.key)?;
        Ok(json!({}))
    }

    /// `dump:` writes a snapshot (or a sub-expression) to stdout.
    fn run_dump(&self, step: &StepDef) -> Result<Value> {
        let expr_str = match &step.payload {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("expr")
                .and_then(Value::as_str)
                .unwrap_or("steps")
                .to_string(),
            _ => "steps".to_string(),
        };
        let env = self.store.to_map();
        let value = expr::eval_with_funcs(&expr_str, &env, self.store.funcs())?;
        let rendered = serde_json::to_string_pretty(&value).unwrap_or_default();
        self.stdout.write_str(&rendered);
        self.stdout.write_str("\n");
        Ok(json!({}))
    }

    /// `bind:` assigns evaluated expressions into vars.
    fn run_bind(&mut self, step: &StepDef) -> Result<Value> {
        let map = step.payload.as_object().cloned().ok_or_else(|| RundownError::InvalidBook {
            path: self.path_str(),
            message: format!("step {}: bind payload must be a map", step.key),
        })?;
        let env = self.store.to_map();
        let mut bound = Map::new();
        for (key, raw) in map {
            let value = match &raw {
                Value::String(s) => expr::eval_with_funcs(s, &env, self.store.funcs())?,
                other => expr::render_value(other, &env, self.store.funcs())?,
            };
            if !self.store.bind(&key, value.clone()) {
                return Err(RundownError::InvalidBook {
                    path: self.path_str(),
                    message: format!("step {}: bind target {key:?} is a reserved key", step.key),
                });
            }
            bound.insert(key, value);
        }
        Ok(Value::Object(bound))
    }

    /// `wait:` blocks until an expression turns true, up to a timeout.
    async fn run_wait(&self, step: &StepDef) -> Result<Value> {
        let (cond, timeout) = match &step.payload {
            Value::String(s) => (Some(s.clone()), self.wait_timeout),
            Value::Object(map) => {
                let cond = map.get("expr").and_then(Value::as_str).map(str::to_string);
                let timeout = match map.get("timeout") {
                    Some(Value::String(s)) => rundown_common::parse_duration(s)?,
                    Some(Value::Number(n)) => Duration::from_secs_f64(n.as_f64().unwrap_or(0.0)),
                    _ => self.wait_timeout,
                };
                (cond, timeout)
            }
            other => {
                // `wait: 3` sleeps for a fixed duration.
                let d = other.as_f64().map(Duration::from_secs_f64).unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(d) => return Ok(json!({})),
                    _ = self.cancel.cancelled() => return Err(RundownError::Canceled),
                }
            }
        };

        let Some(cond) = cond else {
            return Err(RundownError::InvalidBook {
                path: self.path_str(),
                message: format!("step {}: wait needs an expr", step.key),
            });
        };

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let env = self.store.to_map();
            if expr::eval_cond(&cond, &env, self.store.funcs())? {
                return Ok(json!({}));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RundownError::Timeout(format!(
                    "wait condition {cond:?} not met within {timeout:?}"
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(WAIT_POLL_INTERVAL) => {}
                _ = self.cancel.cancelled() => return Err(RundownError::Canceled),
            }
        }
    }

    // -- shutdown ------------------------------------------------------------

    /// Release cleanup actions (LIFO) and close owned runners.
    pub async fn close(&mut self) -> Result<()> {
        let errors = self.close_internal().await;
        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn close_internal(&mut self) -> Vec<RundownError> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        let mut errors = self.cleanup.run_all().await;
        errors.extend(self.registry.close_owned().await);
        errors
    }

    fn path_str(&self) -> String {
        self.book_path.as_ref().map(|p| p.display().to_string()).unwrap_or_default()
    }
}

fn apply_grpc_no_tls(spec: &Value, no_tls: bool) -> Value {
    if !no_tls {
        return spec.clone();
    }
    match spec {
        Value::String(uri) if uri.starts_with("grpcs://") => {
            Value::String(uri.replacen("grpcs://", "grpc://", 1))
        }
        other => other.clone(),
    }
}

fn apply_host_rules(spec: &Value, rules: &Map<String, Value>) -> Value {
    if rules.is_empty() {
        return spec.clone();
    }
    match spec {
        // Only HTTP config maps understand hostRules; URI specs are upgraded
        // to a config map.
        Value::String(uri) if uri.starts_with("http") => {
            json!({ "endpoint": uri, "hostRules": rules })
        }
        Value::Object(map) if map.get("endpoint").is_some() => {
            let mut map = map.clone();
            map.entry("hostRules".to_string()).or_insert_with(|| Value::Object(rules.clone()));
            Value::Object(map)
        }
        other => other.clone(),
    }
}

fn jittered(interval: Duration, jitter: Option<f64>) -> Duration {
    match jitter {
        Some(j) if j > 0.0 => {
            let factor = 1.0 + rand::thread_rng().gen_range(-j..j);
            interval.mul_f64(factor.max(0.0))
        }
        _ => interval,
    }
}

/// Exponential backoff when min/max are both set; constant otherwise.
fn next_backoff(current: Duration, spec: &LoopSpec) -> Duration {
    match (spec.min_interval, spec.max_interval) {
        (Some(min), Some(max)) => {
            let next = current.mul_f64(spec.multiplier);
            next.clamp(min, max)
        }
        _ => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cleanup_group_runs_lifo() {
        let group = CleanupGroup::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            group.push(label, move || {
                Box::pin(async move {
                    order.lock().push(label);
                    Ok(())
                })
            });
        }

        let errors = group.run_all().await;
        assert!(errors.is_empty());
        assert_eq!(*order.lock(), vec!["third", "second", "first"]);
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn cleanup_group_joins_errors() {
        let group = CleanupGroup::new();
        group.push("ok", || Box::pin(async { Ok(()) }));
        group.push("bad", || {
            Box::pin(async { Err(RundownError::Timeout("late".into())) })
        });
        let errors = group.run_all().await;
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn backoff_doubles_within_clamp() {
        let spec = LoopSpec {
            count: None,
            until: Some("true".into()),
            interval: None,
            min_interval: Some(Duration::from_millis(500)),
            max_interval: Some(Duration::from_secs(4)),
            jitter: None,
            multiplier: 2.0,
        };
        let mut d = Duration::from_millis(500);
        d = next_backoff(d, &spec);
        assert_eq!(d, Duration::from_secs(1));
        d = next_backoff(d, &spec);
        assert_eq!(d, Duration::from_secs(2));
        d = next_backoff(d, &spec);
        assert_eq!(d, Duration::from_secs(4));
        d = next_backoff(d, &spec);
        assert_eq!(d, Duration::from_secs(4));
    }

    #[test]
    fn jitter_zero_is_identity() {
        let d = Duration::from_millis(100);
        assert_eq!(jittered(d, None), d);
        assert_eq!(jittered(d, Some(0.0)), d);
    }
}
