// Process-wide capability gate.
// Runners consult these flags before touching anything outside the runbook:
// reading the parent store from an included book, fetching remote files, or
// spawning local commands. Allow tokens OR bits in, deny tokens clear them,
// and later calls compose with earlier ones.

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::errors::{Result, RundownError};

pub const SCOPE_ALLOW_READ_PARENT: &str = "read:parent";
pub const SCOPE_ALLOW_READ_REMOTE: &str = "read:remote";
pub const SCOPE_ALLOW_RUN_EXEC: &str = "run:exec";
pub const SCOPE_DENY_READ_PARENT: &str = "deny:read:parent";
pub const SCOPE_DENY_READ_REMOTE: &str = "deny:read:remote";
pub const SCOPE_DENY_RUN_EXEC: &str = "deny:run:exec";

#[derive(Debug, Default, Clone, Copy)]
struct Scopes {
    read_parent: bool,
    read_remote: bool,
    run_exec: bool,
}

static GLOBAL_SCOPES: Lazy<RwLock<Scopes>> = Lazy::new(|| RwLock::new(Scopes::default()));

/// Apply scope tokens to the process-wide gate.
///
/// Unknown tokens are rejected so a typo in `--scopes` cannot silently widen
/// or narrow the gate.
pub fn set_scopes<I, S>(tokens: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut scopes = GLOBAL_SCOPES.write();
    for token in tokens {
        match token.as_ref() {
            SCOPE_ALLOW_READ_PARENT => scopes.read_parent = true,
            SCOPE_ALLOW_READ_REMOTE => scopes.read_remote = true,
            SCOPE_ALLOW_RUN_EXEC => scopes.run_exec = true,
            SCOPE_DENY_READ_PARENT => scopes.read_parent = false,
            SCOPE_DENY_READ_REMOTE => scopes.read_remote = false,
            SCOPE_DENY_RUN_EXEC => scopes.run_exec = false,
            unknown => {
                return Err(RundownError::InvalidScope(unknown.to_string()));
            }
        }
    }
    Ok(())
}

/// Whether included runbooks may read their parent's store.
pub fn allow_read_parent() -> bool {
    GLOBAL_SCOPES.read().read_parent
}

/// Whether remote runbooks and files (`github://`, `https://`) may be fetched.
pub fn allow_read_remote() -> bool {
    GLOBAL_SCOPES.read().read_remote
}

/// Whether `exec` steps may spawn local commands.
pub fn allow_run_exec() -> bool {
    GLOBAL_SCOPES.read().run_exec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_then_deny_composes() {
        set_scopes([SCOPE_ALLOW_READ_REMOTE]).unwrap();
        assert!(allow_read_remote());
        set_scopes([SCOPE_DENY_READ_REMOTE]).unwrap();
        assert!(!allow_read_remote());
    }

    #[test]
    fn later_tokens_win_within_one_call() {
        set_scopes([SCOPE_ALLOW_RUN_EXEC, SCOPE_DENY_RUN_EXEC]).unwrap();
        assert!(!allow_run_exec());
        set_scopes([SCOPE_DENY_RUN_EXEC, SCOPE_ALLOW_RUN_EXEC]).unwrap();
        assert!(allow_run_exec());
        set_scopes([SCOPE_DENY_RUN_EXEC]).unwrap();
    }

    #[test]
    fn unknown_token_is_rejected() {
        let err = set_scopes(["write:remote"]).unwrap_err();
        assert!(matches!(err, RundownError::InvalidScope(_)));
    }
}
