// SSH runner boundary.
// Payload: {command: "..."}. Session management is an external collaborator
// injected via options; the runner owns address/config parsing and fails
// cleanly when no transport is bound.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use rundown_common::errors::{Result, RundownError};

use super::{RunnerKind, StepContext, StepRunner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub user: Option<String>,
    pub host: String,
    pub port: u16,
    pub keep_session: bool,
    /// `(local, remote)` port-forward spec handed to the transport.
    pub local_forward: Option<(String, String)>,
}

/// Output of one remote command.
#[derive(Debug, Clone, Default)]
pub struct SshOutput {
    pub stdout: String,
    pub stderr: String,
}

/// External collaborator holding the session.
#[async_trait]
pub trait SshTransport: Send + Sync {
    async fn run_command(&self, command: &str, cancel: CancellationToken) -> Result<SshOutput>;

    async fn renew(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct SshRunner {
    name: String,
    config: SshConfig,
    transport: Option<Arc<dyn SshTransport>>,
}

impl SshRunner {
    pub fn from_config(name: &str, uri: &str, config: Option<&Map<String, Value>>) -> Result<Self> {
        let mut parsed = parse_addr(uri).ok_or_else(|| RundownError::InvalidBook {
            path: String::new(),
            message: format!("runner {name}: invalid ssh address {uri:?}"),
        })?;

        if let Some(map) = config {
            parsed.keep_session =
                map.get("keepSession").and_then(Value::as_bool).unwrap_or(false);
            if let Some(fwd) = map.get("localForward").and_then(Value::as_object) {
                if let (Some(local), Some(remote)) = (
                    fwd.get("local").and_then(Value::as_str),
                    fwd.get("remote").and_then(Value::as_str),
                ) {
                    parsed.local_forward = Some((local.to_string(), remote.to_string()));
                }
            }
        }

        Ok(Self { name: name.to_string(), config: parsed, transport: None })
    }

    pub fn with_transport(mut self, transport: Arc<dyn SshTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }

    fn fail(&self, message: impl Into<String>) -> RundownError {
        RundownError::RunnerFailure { runner: self.name.clone(), message: message.into() }
    }
}

#[async_trait]
impl StepRunner for SshRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Ssh
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StepContext) -> Result<Value> {
        let command = ctx
            .payload
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| self.fail("payload needs a command string"))?;
        let transport = self.transport.as_ref().ok_or_else(|| {
            self.fail(format!("no SSH session bound for {}", self.config.host))
        })?;
        let output = transport.run_command(command, ctx.cancel.clone()).await?;
        Ok(json!({ "stdout": output.stdout, "stderr": output.stderr }))
    }

    async fn renew(&self) -> Result<()> {
        if let Some(ref transport) = self.transport {
            transport.renew().await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(ref transport) = self.transport {
            transport.close().await?;
        }
        Ok(())
    }
}

/// Parse `ssh://[user@]host[:port]`.
fn parse_addr(uri: &str) -> Option<SshConfig> {
    let rest = uri.strip_prefix("ssh://").unwrap_or(uri);
    if rest.is_empty() {
        return None;
    }
    let (user, hostport) = match rest.split_once('@') {
        Some((user, hostport)) => (Some(user.to_string()), hostport),
        None => (None, rest),
    };
    let (host, port) = match hostport.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (hostport, 22),
    };
    if host.is_empty() {
        return None;
    }
    Some(SshConfig {
        user,
        host: host.to_string(),
        port,
        keep_session: false,
        local_forward: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_address() {
        let config = parse_addr("ssh://deploy@example.com:2222").unwrap();
        assert_eq!(config.user.as_deref(), Some("deploy"));
        assert_eq!(config.host, "example.com");
        assert_eq!(config.port, 2222);
    }

    #[test]
    fn port_defaults_to_22() {
        let config = parse_addr("ssh://example.com").unwrap();
        assert!(config.user.is_none());
        assert_eq!(config.port, 22);
    }

    #[test]
    fn empty_host_is_rejected() {
        assert!(parse_addr("ssh://").is_none());
        assert!(parse_addr("ssh://user@:22").is_none());
    }

    #[test]
    fn config_map_parses_forward() {
        let config = serde_json::json!({
            "addr": "ssh://example.com",
            "keepSession": true,
            "localForward": {"local": "127.0.0.1:8080", "remote": "10.0.0.2:80"},
        });
        let runner =
            SshRunner::from_config("host", "ssh://example.com", config.as_object()).unwrap();
        assert!(runner.config().keep_session);
        assert_eq!(
            runner.config().local_forward,
            Some(("127.0.0.1:8080".to_string(), "10.0.0.2:80".to_string()))
        );
    }
}
