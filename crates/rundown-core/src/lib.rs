// rundown-core: the runbook execution engine.
// A book is loaded and normalised into an immutable plan, bound to a set of
// named runners, and interpreted step-by-step by an operator with an
// accumulating store; the scheduler runs many operators with selection and
// concurrency controls and feeds the load-test adapter.

pub mod book;
pub mod capture;
pub mod fetch;
pub mod id;
pub mod include;
pub mod loadt;
pub mod operator;
pub mod options;
pub mod runner;
pub mod scheduler;
pub mod sink;
pub mod step;
pub mod store;

pub use book::{load_book, Book};
pub use capture::{CaptureChain, Capturer, DebugCapturer, StepOutcome};
pub use loadt::{run_load_test, LoadtConfig, LoadtResult};
pub use operator::{CleanupGroup, Operator, RunSummary, StepFailure};
pub use options::Options;
pub use runner::{RunnerKind, RunnerRegistry, StepContext, StepRunner};
pub use scheduler::{load_group, Concurrency, GroupResult, OperatorGroup, Shuffle};
pub use sink::SharedSink;
pub use step::{LoopSpec, StepDef};
pub use store::Store;

// Re-export the shared layer so embedders need a single crate.
pub use rundown_common::{
    errors::{is_included_run, IncludedRunError, Result, RundownError},
    expr, scope, SecretMasker,
};

/// Load one book with options into a runnable operator.
pub async fn load(path: &str, options: &Options) -> Result<Operator> {
    Operator::load_path(path, options).await
}
