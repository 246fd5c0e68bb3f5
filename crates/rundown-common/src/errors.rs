// Error taxonomy for the whole workspace.
// The operator decides per kind whether a failure is step-local (subject to
// fail-fast) or fatal to the run; the CLI maps kinds to exit codes.

use std::error::Error as StdError;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RundownError>;

#[derive(Debug, Error)]
pub enum RundownError {
    /// Malformed document: missing fields, reserved-key collisions, a step
    /// with zero or more than one runner selector.
    #[error("invalid runbook ({path}): {message}")]
    InvalidBook { path: String, message: String },

    /// An unrecognized scope token.
    #[error("invalid scope: {0}")]
    InvalidScope(String),

    /// The scope gate refused the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Transport-layer failure. An HTTP non-2xx response is not a failure
    /// unless a test asserts on it; connection and protocol faults are.
    #[error("runner {runner} failed: {message}")]
    RunnerFailure { runner: String, message: String },

    /// A test expression evaluated non-truthy.
    #[error("test failed on step {step}: {expr}")]
    TestFailed { step: String, expr: String },

    /// An until-loop ran out of iterations without its condition turning true.
    #[error("loop exhausted after {iterations} iterations: {expr}")]
    LoopExhausted { iterations: u64, expr: String },

    /// Evaluation of an expression failed (syntax, unknown function, bad
    /// operand types).
    #[error("expression error in {expr:?}: {message}")]
    Expr { expr: String, message: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("run canceled")]
    Canceled,

    /// A child runbook run via `include` failed.
    #[error(transparent)]
    Included(#[from] IncludedRunError),

    /// Load-test counters did not satisfy the threshold expression.
    #[error("threshold violated: {threshold} (result: {counters})")]
    ThresholdViolated { threshold: String, counters: String },

    /// Failures collected from deferred steps; never overrides the primary
    /// error of the run.
    #[error("{} deferred step(s) failed: {}", .0.len(), join_messages(.0))]
    Deferred(Vec<RundownError>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn join_messages(errs: &[RundownError]) -> String {
    errs.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

impl RundownError {
    /// Fatal kinds abort the operator regardless of the fail-fast flag.
    /// Expression errors are fatal: a broken if-condition or template means
    /// the book itself is wrong.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RundownError::InvalidBook { .. }
                | RundownError::InvalidScope(_)
                | RundownError::PermissionDenied(_)
                | RundownError::Expr { .. }
                | RundownError::Timeout(_)
                | RundownError::Canceled
        )
    }
}

/// Wrapper for any error escaping a child runbook run via `include`.
/// Carries the child path; detection works through arbitrary wrapping depth
/// (see [`is_included_run`]).
#[derive(Debug, Error)]
#[error("included runbook {path} failed")]
pub struct IncludedRunError {
    pub path: String,
    #[source]
    pub source: Box<RundownError>,
}

impl IncludedRunError {
    pub fn new(path: impl Into<String>, source: RundownError) -> Self {
        Self { path: path.into(), source: Box::new(source) }
    }
}

/// Whether `err` is, or wraps at any depth, a failed included run.
pub fn is_included_run(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if e.downcast_ref::<IncludedRunError>().is_some() {
            return true;
        }
        if let Some(RundownError::Included(_)) = e.downcast_ref::<RundownError>() {
            return true;
        }
        current = e.source();
    }
    false
}
