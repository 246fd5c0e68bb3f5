// Load-test adapter: drives fresh operator sets against the clock with
// concurrency, warm-up, and max-RPS pacing, then checks the counters against
// a threshold expression.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use rundown_common::errors::{Result, RundownError};
use rundown_common::expr;

use crate::scheduler::OperatorGroup;

#[derive(Debug, Clone)]
pub struct LoadtConfig {
    pub concurrent: usize,
    pub duration: Duration,
    pub warm_up: Duration,
    /// 0 means unpaced.
    pub max_rps: usize,
}

impl Default for LoadtConfig {
    fn default() -> Self {
        Self {
            concurrent: 1,
            duration: Duration::from_secs(10),
            warm_up: Duration::from_secs(5),
            max_rps: 0,
        }
    }
}

/// Aggregated counters for one load test.
#[derive(Debug, Clone, Default)]
pub struct LoadtResult {
    pub runbooks: usize,
    pub concurrent: usize,
    pub max_rps: usize,
    pub duration: Duration,
    pub warm_up: Duration,
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Latencies of counted (post-warm-up) iterations.
    pub latencies: Vec<Duration>,
}

impl LoadtResult {
    pub fn error_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }

    fn percentile(&self, p: f64) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted = self.latencies.clone();
        sorted.sort();
        let rank = ((sorted.len() as f64) * p).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
    }

    pub fn p50(&self) -> Duration {
        self.percentile(0.50)
    }

    pub fn p90(&self) -> Duration {
        self.percentile(0.90)
    }

    pub fn p99(&self) -> Duration {
        self.percentile(0.99)
    }

    /// Evaluate a boolean threshold expression over the counters.
    /// An empty threshold always passes.
    pub fn check_threshold(&self, threshold: &str) -> Result<()> {
        if threshold.trim().is_empty() {
            return Ok(());
        }
        let env = json!({
            "total": self.total,
            "succeeded": self.succeeded,
            "failed": self.failed,
            "error_rate": self.error_rate(),
            "p50_ms": self.p50().as_millis() as u64,
            "p90_ms": self.p90().as_millis() as u64,
            "p99_ms": self.p99().as_millis() as u64,
        });
        let pass = expr::eval_cond(threshold, &env, &expr::no_funcs())?;
        if !pass {
            return Err(RundownError::ThresholdViolated {
                threshold: threshold.to_string(),
                counters: env.to_string(),
            });
        }
        Ok(())
    }

    /// Text report ahead of the threshold decision.
    pub fn report(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "Number of runbooks per RunN....: {}", self.runbooks)?;
        writeln!(out, "Warm up time (--warm-up).......: {:?}", self.warm_up)?;
        writeln!(out, "Duration (--duration)..........: {:?}", self.duration)?;
        writeln!(out, "Concurrent (--load-concurrent).: {}", self.concurrent)?;
        writeln!(out, "Max RunN per second (--max-rps): {}", self.max_rps)?;
        writeln!(out, "Total..........................: {}", self.total)?;
        writeln!(out, "Succeeded......................: {}", self.succeeded)?;
        writeln!(out, "Failed.........................: {}", self.failed)?;
        writeln!(out, "Error rate.....................: {:.2}%", self.error_rate() * 100.0)?;
        writeln!(out, "Latency p50/p90/p99............: {:?} / {:?} / {:?}",
            self.p50(), self.p90(), self.p99())?;
        Ok(())
    }
}

/// Simple shared pacer: at most `max_rps` iteration starts per second.
struct Pacer {
    next: Mutex<tokio::time::Instant>,
    step: Duration,
}

impl Pacer {
    fn new(max_rps: usize) -> Option<Arc<Self>> {
        if max_rps == 0 {
            return None;
        }
        Some(Arc::new(Self {
            next: Mutex::new(tokio::time::Instant::now()),
            step: Duration::from_secs_f64(1.0 / max_rps as f64),
        }))
    }

    async fn acquire(&self) {
        let slot = {
            let mut next = self.next.lock();
            let slot = *next;
            *next = slot.max(tokio::time::Instant::now()) + self.step;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

/// Run the load test: `concurrent` workers repeatedly build a fresh operator
/// set from the group and run it until warm-up plus duration elapse.
/// Warm-up iterations run and are measured but not counted.
pub async fn run_load_test(
    group: Arc<OperatorGroup>,
    config: &LoadtConfig,
    cancel: CancellationToken,
) -> Result<LoadtResult> {
    let selected = group.selected_indices()?.len();
    let started = tokio::time::Instant::now();
    let warm_until = started + config.warm_up;
    let deadline = started + config.warm_up + config.duration;

    let counters = Arc::new(Mutex::new(LoadtResult {
        runbooks: selected,
        concurrent: config.concurrent,
        max_rps: config.max_rps,
        duration: config.duration,
        warm_up: config.warm_up,
        ..Default::default()
    }));
    let pacer = Pacer::new(config.max_rps);

    let mut workers = tokio::task::JoinSet::new();
    for _ in 0..config.concurrent.max(1) {
        let group = Arc::clone(&group);
        let counters = Arc::clone(&counters);
        let pacer = pacer.clone();
        let cancel = cancel.clone();
        workers.spawn(async move {
            loop {
                if cancel.is_cancelled() || tokio::time::Instant::now() >= deadline {
                    break;
                }
                if let Some(ref pacer) = pacer {
                    pacer.acquire().await;
                }

                let iteration_start = tokio::time::Instant::now();
                let outcome = run_iteration(&group, &cancel).await;
                let elapsed = iteration_start.elapsed();

                if iteration_start < warm_until {
                    continue;
                }
                let mut c = counters.lock();
                c.total += 1;
                match outcome {
                    Ok(()) => c.succeeded += 1,
                    Err(_) => c.failed += 1,
                }
                c.latencies.push(elapsed);
            }
        });
    }

    while workers.join_next().await.is_some() {}

    let result = counters.lock().clone();
    Ok(result)
}

async fn run_iteration(group: &OperatorGroup, cancel: &CancellationToken) -> Result<()> {
    let mut ops = group.new_operator_set().await?;
    for op in &mut ops {
        op.set_cancel(cancel.child_token());
        op.run().await?;
    }
    Ok(())
}
