// rundown-common: shared services for the rundown workspace.
// Everything here is independent of the execution engine: the process-wide
// scope gate, secret masking for streamed output, the error taxonomy, the
// expression evaluator, duration parsing, and the remote-file cache directory.

pub mod cache;
pub mod duration;
pub mod errors;
pub mod expr;
pub mod scope;
pub mod secret_masker;

pub use cache::{cache_dir, cache_key, remove_cache_dir, set_cache_dir};
pub use duration::parse_duration;
pub use errors::{is_included_run, IncludedRunError, Result, RundownError};
pub use scope::{
    allow_read_parent, allow_read_remote, allow_run_exec, set_scopes, SCOPE_ALLOW_READ_PARENT,
    SCOPE_ALLOW_READ_REMOTE, SCOPE_ALLOW_RUN_EXEC, SCOPE_DENY_READ_PARENT, SCOPE_DENY_READ_REMOTE,
    SCOPE_DENY_RUN_EXEC,
};
pub use secret_masker::SecretMasker;
