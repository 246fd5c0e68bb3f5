// Local command runner.
// Payload: {command, shell?, stdin?, env?, background?, liveOutput?}.
// Output record: {stdout, stderr, exit_code}; a background command detaches
// into the cleanup group and records {} immediately.
//
// Shell resolution: empty -> bash (sh when bash is absent) with plain -c;
// "bash" by name -> bash with -eo pipefail; any template containing {0} has
// the command substituted as a single argument.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use rundown_common::errors::{Result, RundownError};
use rundown_common::scope;

use super::{RunnerKind, StepContext, StepRunner};

pub struct ExecRunner {
    name: String,
}

#[derive(Debug, Clone, Default)]
struct ExecCommand {
    command: String,
    shell: String,
    stdin: Option<String>,
    env: Vec<(String, String)>,
    background: bool,
    live_output: bool,
}

impl ExecRunner {
    pub fn new() -> Self {
        Self { name: "exec".to_string() }
    }

    fn fail(&self, message: impl Into<String>) -> RundownError {
        RundownError::RunnerFailure { runner: self.name.clone(), message: message.into() }
    }
}

impl Default for ExecRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StepRunner for ExecRunner {
    fn kind(&self) -> RunnerKind {
        RunnerKind::Exec
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &StepContext) -> Result<Value> {
        if !scope::allow_run_exec() {
            return Err(RundownError::PermissionDenied(
                "exec steps require the run:exec scope".to_string(),
            ));
        }

        let cmd = parse_payload(&ctx.payload).map_err(|m| self.fail(m))?;
        let argv = shell_argv(&cmd.shell, &cmd.command).map_err(|m| self.fail(m))?;

        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        for (k, v) in &cmd.env {
            command.env(k, v);
        }

        if cmd.background {
            command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
            let child = command.spawn().map_err(|e| self.fail(format!("spawn: {e}")))?;
            let child = Arc::new(Mutex::new(Some(child)));
            let label = format!("background exec: {}", cmd.command);
            ctx.cleanup.push(label, move || {
                Box::pin(async move {
                    let taken = child.lock().take();
                    if let Some(mut c) = taken {
                        let _ = c.kill().await;
                        let _ = c.wait().await;
                    }
                    Ok(())
                })
            });
            return Ok(json!({}));
        }

        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        command.stdin(if cmd.stdin.is_some() { Stdio::piped() } else { Stdio::null() });

        let mut child = command.spawn().map_err(|e| self.fail(format!("spawn: {e}")))?;

        if let Some(ref input) = cmd.stdin {
            let mut handle = child.stdin.take().ok_or_else(|| self.fail("stdin unavailable"))?;
            let bytes = input.clone().into_bytes();
            // Write and close so the child sees EOF.
            tokio::spawn(async move {
                let _ = handle.write_all(&bytes).await;
                drop(handle);
            });
        }

        let stdout_task = read_stream(
            child.stdout.take(),
            cmd.live_output.then(|| ctx.stdout.clone()),
            ctx.masker.clone(),
            ctx.capturers.clone(),
            false,
        );
        let stderr_task = read_stream(
            child.stderr.take(),
            cmd.live_output.then(|| ctx.stderr.clone()),
            ctx.masker.clone(),
            ctx.capturers.clone(),
            true,
        );

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| self.fail(format!("wait: {e}")))?,
            _ = ctx.cancel.cancelled() => {
                let _ = child.kill().await;
                let _ = child.wait().await;
                return Err(RundownError::Canceled);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        Ok(json!({
            "stdout": String::from_utf8_lossy(&stdout).into_owned(),
            "stderr": String::from_utf8_lossy(&stderr).into_owned(),
            "exit_code": status.code().unwrap_or(-1),
        }))
    }
}

/// Read a child stream to completion, preserving the exact bytes for the
/// record while streaming masked lines to the live sink.
fn read_stream(
    stream: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    live: Option<crate::sink::SharedSink>,
    masker: rundown_common::SecretMasker,
    capturers: crate::capture::CaptureChain,
    is_stderr: bool,
) -> tokio::task::JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut collected = Vec::new();
        let Some(stream) = stream else {
            return collected;
        };
        let mut reader = BufReader::new(stream);
        let mut segment = Vec::new();
        loop {
            segment.clear();
            match reader.read_until(b'\n', &mut segment).await {
                Ok(0) => break,
                Ok(_) => {
                    collected.extend_from_slice(&segment);
                    if live.is_some() || !capturers.is_empty() {
                        let text = String::from_utf8_lossy(&segment);
                        let masked = masker.mask(&text);
                        if let Some(ref sink) = live {
                            sink.write_str(&masked);
                        }
                        if is_stderr {
                            capturers.each(|c| c.on_stderr(&masked));
                        } else {
                            capturers.each(|c| c.on_stdout(&masked));
                        }
                    }
                }
                Err(_) => break,
            }
        }
        collected
    })
}

fn parse_payload(payload: &Value) -> std::result::Result<ExecCommand, String> {
    let map = payload.as_object().ok_or("payload must be a map")?;
    let command = map
        .get("command")
        .and_then(Value::as_str)
        .ok_or("payload needs a command string")?
        .to_string();
    if command.trim().is_empty() {
        return Err("command is empty".to_string());
    }

    let mut env = Vec::new();
    if let Some(vars) = map.get("env").and_then(Value::as_object) {
        for (k, v) in vars {
            env.push((k.clone(), super::http::value_as_header(v)));
        }
    }

    Ok(ExecCommand {
        command,
        shell: map.get("shell").and_then(Value::as_str).unwrap_or_default().to_string(),
        stdin: map.get("stdin").and_then(Value::as_str).map(str::to_string),
        env,
        background: map.get("background").and_then(Value::as_bool).unwrap_or(false),
        live_output: map.get("liveOutput").and_then(Value::as_bool).unwrap_or(false),
    })
}

/// Resolve the shell spec into an argv.
fn shell_argv(shell: &str, command: &str) -> std::result::Result<Vec<String>, String> {
    let shell = shell.trim();

    if shell.contains("{0}") || shell.contains(char::is_whitespace) {
        let mut argv: Vec<String> = Vec::new();
        let mut substituted = false;
        for word in shell.split_whitespace() {
            if word == "{0}" {
                argv.push(command.to_string());
                substituted = true;
            } else {
                argv.push(word.to_string());
            }
        }
        if !substituted {
            argv.push(command.to_string());
        }
        argv[0] = lookup_shell(&argv[0])?;
        return Ok(argv);
    }

    if shell.is_empty() {
        let resolved = lookup_shell("bash").or_else(|_| lookup_shell("sh"))?;
        return Ok(vec![resolved, "-c".to_string(), command.to_string()]);
    }

    if shell == "bash" {
        let resolved = lookup_shell("bash")?;
        return Ok(vec![
            resolved,
            "--noprofile".to_string(),
            "--norc".to_string(),
            "-eo".to_string(),
            "pipefail".to_string(),
            "-c".to_string(),
            command.to_string(),
        ]);
    }

    let resolved = lookup_shell(shell)?;
    Ok(vec![resolved, "-c".to_string(), command.to_string()])
}

/// PATH lookup so the child's argv[0] carries the full interpreter path.
fn lookup_shell(name: &str) -> std::result::Result<String, String> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return if candidate.is_file() {
            Ok(name.to_string())
        } else {
            Err(format!("shell not found: {name}"))
        };
    }
    let path = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path) {
        let full: PathBuf = dir.join(name);
        if full.is_file() {
            return Ok(full.to_string_lossy().into_owned());
        }
    }
    Err(format!("shell not found in PATH: {name}"))
}
