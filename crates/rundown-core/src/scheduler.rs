// Multi-runbook scheduler: filtering, sharding, sampling, shuffling, and
// bounded-concurrent execution of an operator group. One fatal failure under
// fail-fast cancels every sibling's token.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use regex::Regex;
use sha1::{Digest, Sha1};
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use rundown_common::errors::{Result, RundownError};

use crate::fetch;
use crate::id;
use crate::include::IncludeConfig;
use crate::operator::{Operator, RunSummary};
use crate::options::Options;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Shuffle {
    #[default]
    Off,
    /// Random seed per invocation.
    On,
    /// Deterministic.
    Seed(u64),
}

impl FromStr for Shuffle {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "off" | "" => Ok(Shuffle::Off),
            "on" => Ok(Shuffle::On),
            n => n
                .parse::<u64>()
                .map(Shuffle::Seed)
                .map_err(|_| format!("invalid shuffle value {n:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Concurrency {
    /// Sequential, in admission order.
    #[default]
    Off,
    /// Unbounded parallelism.
    On,
    /// At most N in flight.
    Max(usize),
}

impl FromStr for Concurrency {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "off" | "" => Ok(Concurrency::Off),
            "on" => Ok(Concurrency::On),
            n => n
                .parse::<usize>()
                .map(Concurrency::Max)
                .map_err(|_| format!("invalid concurrent value {n:?}")),
        }
    }
}

/// Result of one operator's run within a group.
pub struct OperatorResult {
    pub id: String,
    pub path: Option<String>,
    pub summary: RunSummary,
    pub error: Option<RundownError>,
}

#[derive(Default)]
pub struct GroupResult {
    pub results: Vec<OperatorResult>,
}

impl GroupResult {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.error.is_none()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| r.error.is_some()).count()
    }

    pub fn ok(&self) -> bool {
        self.failed() == 0
    }
}

pub struct OperatorGroup {
    ops: Vec<Operator>,
    opts: Options,
    /// Expanded source paths, aligned with `ops`, for the load-test factory.
    sources: Vec<String>,
    /// Operators only ever reachable via include steps of others.
    included_only: Vec<bool>,
}

/// Expand path patterns, load every matching book, and assign stable IDs.
pub async fn load_group(patterns: &[String], opts: &Options) -> Result<OperatorGroup> {
    let mut sources = Vec::new();
    for pattern in patterns {
        if fetch::is_remote(pattern) {
            sources.push(pattern.clone());
            continue;
        }
        let mut matched: Vec<String> = glob::glob(pattern)
            .map_err(|e| RundownError::InvalidBook {
                path: pattern.clone(),
                message: format!("bad pattern: {e}"),
            })?
            .filter_map(|entry| entry.ok())
            .map(|p| p.display().to_string())
            .collect();
        matched.sort();
        if matched.is_empty() {
            // Not a pattern: treat as a literal path and let the loader report
            // the miss.
            sources.push(pattern.clone());
        } else {
            sources.append(&mut matched);
        }
    }

    let mut ops = Vec::with_capacity(sources.len());
    for source in &sources {
        ops.push(Operator::load_path(source, opts).await?);
    }
    id::generate_ids(&mut ops)?;

    let included_only = mark_included_only(&ops);

    Ok(OperatorGroup { ops, opts: opts.clone(), sources, included_only })
}

/// Paths referenced by include steps, used for the skip-included filter.
fn mark_included_only(ops: &[Operator]) -> Vec<bool> {
    let mut included_paths = Vec::new();
    for op in ops {
        let base = op.book_path().and_then(|p| p.parent());
        for step in &op.steps {
            if step.runner_key != "include" {
                continue;
            }
            if let Ok(cfg) = IncludeConfig::from_payload(&step.payload) {
                let resolved = match base {
                    Some(base) if !std::path::Path::new(&cfg.path).is_absolute() => {
                        base.join(&cfg.path).display().to_string()
                    }
                    _ => cfg.path.clone(),
                };
                included_paths.push(resolved);
            }
        }
    }
    ops.iter()
        .map(|op| {
            op.book_path()
                .map(|p| included_paths.iter().any(|inc| same_path(inc, &p.display().to_string())))
                .unwrap_or(false)
        })
        .collect()
}

fn same_path(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

fn normalize(p: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in p.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

impl OperatorGroup {
    pub fn operators(&self) -> &[Operator] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Apply filter -> shard -> sample -> shuffle, returning indices in
    /// execution order.
    pub fn selected_indices(&self) -> Result<Vec<usize>> {
        let regex = match &self.opts.run_match {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| RundownError::InvalidBook {
                path: pattern.clone(),
                message: format!("bad --run pattern: {e}"),
            })?),
            None => None,
        };

        let has_filters = regex.is_some()
            || !self.opts.run_ids.is_empty()
            || !self.opts.run_labels.is_empty();

        let mut selected: Vec<usize> = (0..self.ops.len())
            .filter(|&i| {
                let op = &self.ops[i];
                if self.opts.skip_included && self.included_only[i] {
                    return false;
                }
                if !has_filters {
                    return true;
                }
                let path = op.book_path().map(|p| p.display().to_string()).unwrap_or_default();
                if let Some(ref re) = regex {
                    if re.is_match(&path) {
                        return true;
                    }
                }
                if self.opts.run_ids.iter().any(|prefix| op.id().starts_with(prefix.as_str())) {
                    return true;
                }
                if self.opts.run_labels.iter().any(|l| op.labels().contains(l)) {
                    return true;
                }
                false
            })
            .collect();

        if let Some((index, n)) = self.opts.shard {
            if n == 0 || index >= n {
                return Err(RundownError::InvalidBook {
                    path: String::new(),
                    message: format!("invalid shard {index}/{n}"),
                });
            }
            selected.retain(|&i| {
                let path = self.ops[i]
                    .book_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| self.ops[i].id().to_string());
                path_shard(&path, n) == index
            });
        }

        if let Some(k) = self.opts.sample {
            selected.truncate(k);
        }

        match self.opts.shuffle {
            Shuffle::Off => {}
            Shuffle::On => {
                let seed = rand::thread_rng().gen();
                selected.shuffle(&mut StdRng::seed_from_u64(seed));
            }
            Shuffle::Seed(seed) => {
                selected.shuffle(&mut StdRng::seed_from_u64(seed));
            }
        }

        Ok(selected)
    }

    /// Run the selected operators. The group can run only once; operators are
    /// consumed.
    pub async fn run_all(&mut self, cancel: CancellationToken) -> Result<GroupResult> {
        let selected = self.selected_indices()?;
        let fail_fast = self.opts.fail_fast.unwrap_or(false);

        let mut taken: Vec<Option<Operator>> =
            std::mem::take(&mut self.ops).into_iter().map(Some).collect();

        // Same concurrency key => strict serialisation in admission order.
        let mut key_locks: HashMap<String, Arc<AsyncMutex<()>>> = HashMap::new();
        for &i in &selected {
            if let Some(key) = taken[i].as_ref().and_then(|o| o.concurrency_key()) {
                key_locks.entry(key.to_string()).or_default();
            }
        }

        let limit = match self.opts.concurrency {
            Concurrency::Off => {
                // Sequential path: no tasks, strict admission order.
                let mut results = GroupResult::default();
                for i in selected {
                    let Some(mut op) = taken[i].take() else { continue };
                    if cancel.is_cancelled() {
                        break;
                    }
                    op.set_cancel(cancel.child_token());
                    let error = op.run().await.err();
                    let failed = error.is_some();
                    results.results.push(OperatorResult {
                        id: op.id().to_string(),
                        path: op.book_path().map(|p| p.display().to_string()),
                        summary: op.summary().clone(),
                        error,
                    });
                    if failed && fail_fast {
                        cancel.cancel();
                        break;
                    }
                }
                return Ok(results);
            }
            Concurrency::On => Semaphore::MAX_PERMITS,
            Concurrency::Max(n) => n.max(1),
        };

        let semaphore = Arc::new(Semaphore::new(limit));
        let mut set: JoinSet<OperatorResult> = JoinSet::new();

        for i in selected {
            let Some(mut op) = taken[i].take() else { continue };
            let semaphore = Arc::clone(&semaphore);
            let key_lock = op.concurrency_key().and_then(|k| key_locks.get(k)).cloned();
            let cancel = cancel.clone();
            op.set_cancel(cancel.child_token());

            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let _key_guard = match &key_lock {
                    Some(lock) => Some(lock.lock().await),
                    None => None,
                };
                let error = op.run().await.err();
                if error.is_some() && fail_fast {
                    cancel.cancel();
                }
                OperatorResult {
                    id: op.id().to_string(),
                    path: op.book_path().map(|p| p.display().to_string()),
                    summary: op.summary().clone(),
                    error,
                }
            });
        }

        let mut results = GroupResult::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.results.push(result),
                Err(e) => {
                    tracing::error!(error = %e, "operator task panicked");
                }
            }
        }
        Ok(results)
    }

    /// A fresh, independent operator set for one load-test iteration: no
    /// shared stores, no shared owned runners.
    pub async fn new_operator_set(&self) -> Result<Vec<Operator>> {
        let selected = self.selected_indices()?;
        let mut ops = Vec::with_capacity(selected.len());
        for i in selected {
            ops.push(Operator::load_path(&self.sources[i], &self.opts).await?);
        }
        id::generate_ids(&mut ops)?;
        Ok(ops)
    }
}

/// Stable shard assignment by path hash.
fn path_shard(path: &str, n: usize) -> usize {
    let mut hasher = Sha1::new();
    hasher.update(path.as_bytes());
    let digest = hasher.finalize();
    let mut value = 0u64;
    for byte in &digest[..8] {
        value = (value << 8) | u64::from(*byte);
    }
    (value % n as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shuffle_and_concurrency_parse() {
        assert_eq!(Shuffle::from_str("off").unwrap(), Shuffle::Off);
        assert_eq!(Shuffle::from_str("on").unwrap(), Shuffle::On);
        assert_eq!(Shuffle::from_str("42").unwrap(), Shuffle::Seed(42));
        assert!(Shuffle::from_str("maybe").is_err());

        assert_eq!(Concurrency::from_str("off").unwrap(), Concurrency::Off);
        assert_eq!(Concurrency::from_str("on").unwrap(), Concurrency::On);
        assert_eq!(Concurrency::from_str("3").unwrap(), Concurrency::Max(3));
    }

    #[test]
    fn shard_assignment_is_stable_and_total() {
        let paths = ["a.yml", "b.yml", "c.yml", "d.yml", "e.yml"];
        for p in paths {
            let first = path_shard(p, 3);
            assert_eq!(first, path_shard(p, 3));
            assert!(first < 3);
        }
    }

    #[test]
    fn normalize_resolves_dots() {
        assert_eq!(normalize("a/b/../c/./d.yml"), "a/c/d.yml");
        assert!(same_path("x/./y.yml", "x/y.yml"));
    }
}
