// Capturer chain: observers notified at step boundaries and transport events.
// Capturers are pure sinks; nothing they do can affect execution.

use std::path::Path;
use std::sync::Arc;

use crate::sink::SharedSink;

/// Outcome of one step, as seen by capturers.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Success,
    Failure(String),
    Skipped,
}

/// Observer notified at runbook/step boundaries and per-transport events.
/// All methods default to no-ops so implementations pick what they need.
pub trait Capturer: Send + Sync {
    fn on_runbook_start(&self, _id: &str, _desc: &str, _path: Option<&Path>) {}
    fn on_runbook_end(&self, _id: &str, _succeeded: usize, _failed: usize, _skipped: usize) {}
    fn on_step_start(&self, _id: &str, _index: usize, _key: &str) {}
    fn on_step_end(&self, _id: &str, _index: usize, _key: &str, _outcome: &StepOutcome) {}
    fn on_http_request(&self, _runner: &str, _method: &str, _url: &str) {}
    fn on_http_response(&self, _runner: &str, _status: u16) {}
    fn on_db_query(&self, _runner: &str, _query: &str) {}
    fn on_stdout(&self, _chunk: &str) {}
    fn on_stderr(&self, _chunk: &str) {}
}

/// Fan-out over a fixed set of capturers.
#[derive(Clone, Default)]
pub struct CaptureChain {
    capturers: Vec<Arc<dyn Capturer>>,
}

impl CaptureChain {
    pub fn new(capturers: Vec<Arc<dyn Capturer>>) -> Self {
        Self { capturers }
    }

    pub fn push(&mut self, capturer: Arc<dyn Capturer>) {
        self.capturers.push(capturer);
    }

    pub fn is_empty(&self) -> bool {
        self.capturers.is_empty()
    }

    pub fn each(&self, f: impl Fn(&dyn Capturer)) {
        for c in &self.capturers {
            f(c.as_ref());
        }
    }
}

impl std::fmt::Debug for CaptureChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CaptureChain({})", self.capturers.len())
    }
}

/// Renders step boundaries to a sink when the debug flag is on.
pub struct DebugCapturer {
    sink: SharedSink,
}

impl DebugCapturer {
    pub fn new(sink: SharedSink) -> Self {
        Self { sink }
    }
}

impl Capturer for DebugCapturer {
    fn on_runbook_start(&self, id: &str, desc: &str, path: Option<&Path>) {
        let path = path.map(|p| p.display().to_string()).unwrap_or_default();
        self.sink.write_str(&format!("=== run {id} {desc} ({path})\n"));
    }

    fn on_runbook_end(&self, id: &str, succeeded: usize, failed: usize, skipped: usize) {
        self.sink.write_str(&format!(
            "=== end {id} succeeded={succeeded} failed={failed} skipped={skipped}\n"
        ));
    }

    fn on_step_start(&self, id: &str, index: usize, key: &str) {
        self.sink.write_str(&format!("--- {id} step {index} ({key})\n"));
        tracing::debug!(id, index, key, "step start");
    }

    fn on_step_end(&self, id: &str, index: usize, key: &str, outcome: &StepOutcome) {
        self.sink.write_str(&format!("--- {id} step {index} ({key}) -> {outcome:?}\n"));
        tracing::debug!(id, index, key, ?outcome, "step end");
    }

    fn on_http_request(&self, runner: &str, method: &str, url: &str) {
        tracing::debug!(runner, method, url, "http request");
    }

    fn on_http_response(&self, runner: &str, status: u16) {
        tracing::debug!(runner, status, "http response");
    }

    fn on_db_query(&self, runner: &str, query: &str) {
        tracing::debug!(runner, query, "db query");
    }
}
