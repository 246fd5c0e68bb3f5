// rundown CLI: run runbooks, load-test them, list what would run, and
// scaffold new books.
// Exit codes: 0 success, 1 any runbook failure, 2 usage error (clap),
// 3 threshold violation.

use std::io::Write;
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use rundown_common::{cache, parse_duration, scope};
use rundown_core::{
    load_group, loadt, Concurrency, Options, RundownError, SharedSink, Shuffle,
};

const EXIT_FAILURE: u8 = 1;
// Usage errors exit with 2 via clap's own error path.
const EXIT_THRESHOLD: u8 = 3;

#[derive(Parser)]
#[command(name = "rundown", version, about = "Run declarative runbooks against your systems")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run runbooks
    Run(RunArgs),
    /// Run a load test using runbooks
    #[command(alias = "loadtest")]
    Loadt(LoadtArgs),
    /// List runbooks with their stable IDs
    List(ListArgs),
    /// Write a skeleton runbook
    New(NewArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// Runbook path patterns
    #[arg(value_name = "PATH_PATTERN", required = true)]
    paths: Vec<String>,

    /// Set var (key:value or key:json://file)
    #[arg(long = "var")]
    vars: Vec<String>,

    /// Set runner (name:uri)
    #[arg(long = "runner")]
    runners: Vec<String>,

    /// Overlay values on the runbook
    #[arg(long = "overlay")]
    overlays: Vec<String>,

    /// Underlay values under the runbook
    #[arg(long = "underlay")]
    underlays: Vec<String>,

    /// Regex over runbook paths
    #[arg(long = "run")]
    run_match: Option<String>,

    /// Run by ID prefix
    #[arg(long = "id")]
    run_ids: Vec<String>,

    /// Run by label
    #[arg(long = "label")]
    run_labels: Vec<String>,

    /// Take the first N runbooks after filtering
    #[arg(long)]
    sample: Option<usize>,

    /// off | on | <seed>
    #[arg(long, default_value = "off")]
    shuffle: String,

    /// off | on | <max parallel>
    #[arg(long, default_value = "off")]
    concurrent: String,

    /// Shard index to run
    #[arg(long = "shard-index")]
    shard_index: Option<usize>,

    /// Number of shards
    #[arg(long = "shard-n")]
    shard_n: Option<usize>,

    /// Cache directory for remote files
    #[arg(long = "cache-dir")]
    cache_dir: Option<String>,

    /// Keep the cache directory after the run
    #[arg(long = "retain-cache-dir")]
    retain_cache_dir: bool,

    /// Timeout for wait steps
    #[arg(long = "wait-timeout", default_value = "10sec")]
    wait_timeout: String,

    /// Load KEY=VALUE lines into the environment before loading books
    #[arg(long = "env-file")]
    env_file: Option<String>,

    /// Capability scopes (e.g. run:exec, read:remote, deny:read:parent)
    #[arg(long = "scopes")]
    scopes: Vec<String>,

    #[arg(long)]
    debug: bool,

    #[arg(long = "fail-fast")]
    fail_fast: bool,

    #[arg(long = "skip-test")]
    skip_test: bool,

    /// Do not run books that are included by other selected books
    #[arg(long = "skip-included")]
    skip_included: bool,

    /// Force running every step even after failures
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct LoadtArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Concurrent load workers
    #[arg(long = "load-concurrent", default_value_t = 1)]
    load_concurrent: usize,

    #[arg(long, default_value = "10sec")]
    duration: String,

    /// Warm-up period: measured but not counted
    #[arg(long = "warm-up", default_value = "5sec")]
    warm_up: String,

    /// Boolean expression over the counters (e.g. "error_rate < 0.01")
    #[arg(long)]
    threshold: Option<String>,

    /// Max iteration starts per second (0 = unpaced)
    #[arg(long = "max-rps", default_value_t = 0)]
    max_rps: usize,
}

#[derive(Args)]
struct ListArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args)]
struct NewArgs {
    /// Output path; stdout when omitted
    #[arg(long)]
    out: Option<String>,

    /// Description for the new runbook
    #[arg(long, default_value = "New runbook")]
    desc: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let code = runtime.block_on(async {
        match cli.command {
            Command::Run(args) => cmd_run(args).await,
            Command::Loadt(args) => cmd_loadt(args).await,
            Command::List(args) => cmd_list(args).await,
            Command::New(args) => cmd_new(args).await,
        }
    });

    match code {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("rundown: {e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if std::env::var("DEBUG").map(|v| v == "true" || v == "1").unwrap_or(false) {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("warn")
        }
    });
    let ansi = std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .init();
}

/// Translate CLI flags into load options.
fn build_options(common: &CommonArgs) -> Result<Options> {
    if let Some(ref env_file) = common.env_file {
        load_env_file(env_file)?;
    }
    if !common.scopes.is_empty() {
        scope::set_scopes(&common.scopes).context("applying --scopes")?;
    }
    if let Some(ref dir) = common.cache_dir {
        cache::set_cache_dir(dir).context("setting --cache-dir")?;
    }

    let mut opts = Options::new()
        .skip_included(common.skip_included)
        .stdout(SharedSink::from_writer(std::io::stdout()))
        .stderr(SharedSink::from_writer(std::io::stderr()))
        .wait_timeout(parse_duration(&common.wait_timeout).context("--wait-timeout")?);

    // Flags only override the book's own settings when given.
    if common.debug {
        opts = opts.debug(true);
    }
    if common.fail_fast {
        opts = opts.fail_fast(true);
    }
    if common.skip_test {
        opts = opts.skip_test(true);
    }
    if common.force {
        opts = opts.force(true);
    }

    for pair in &common.vars {
        let (key, value) = split_pair(pair).context("--var expects key:value")?;
        opts = opts.var(key, parse_var_value(value));
    }
    for pair in &common.runners {
        let (name, uri) = split_pair(pair).context("--runner expects name:uri")?;
        opts = opts.runner(name, Value::String(uri.to_string()));
    }
    for overlay in &common.overlays {
        opts = opts.overlay(overlay.clone());
    }
    for underlay in &common.underlays {
        opts = opts.underlay(underlay.clone());
    }
    if let Some(ref pattern) = common.run_match {
        opts = opts.run_match(pattern.clone());
    }
    for id in &common.run_ids {
        opts = opts.run_id(id.clone());
    }
    for label in &common.run_labels {
        opts = opts.run_label(label.clone());
    }
    if let Some(k) = common.sample {
        opts = opts.sample(k);
    }
    opts = opts.shuffle(Shuffle::from_str(&common.shuffle).map_err(anyhow::Error::msg)?);
    opts = opts.concurrent(Concurrency::from_str(&common.concurrent).map_err(anyhow::Error::msg)?);
    if let (Some(index), Some(n)) = (common.shard_index, common.shard_n) {
        opts = opts.shard(index, n);
    }

    Ok(opts)
}

async fn cmd_run(args: RunArgs) -> Result<u8> {
    let opts = build_options(&args.common)?;
    let mut group = load_group(&args.common.paths, &opts).await?;

    let result = group.run_all(CancellationToken::new()).await?;
    remove_cache_unless_retained(args.common.retain_cache_dir);

    for r in &result.results {
        let status = if r.error.is_none() { "ok" } else { "failed" };
        let path = r.path.as_deref().unwrap_or("-");
        println!("{status:>6}  {}  {path}", &r.id[..r.id.len().min(7)]);
        if let Some(ref e) = r.error {
            println!("        {e}");
        }
    }
    println!("{} runbooks, {} succeeded, {} failed", result.results.len(), result.succeeded(), result.failed());

    Ok(if result.ok() { 0 } else { EXIT_FAILURE })
}

async fn cmd_loadt(args: LoadtArgs) -> Result<u8> {
    let opts = build_options(&args.common)?;
    let group = Arc::new(load_group(&args.common.paths, &opts).await?);

    let config = loadt::LoadtConfig {
        concurrent: args.load_concurrent,
        duration: parse_duration(&args.duration).context("--duration")?,
        warm_up: parse_duration(&args.warm_up).context("--warm-up")?,
        max_rps: args.max_rps,
    };

    let result = loadt::run_load_test(group, &config, CancellationToken::new()).await?;
    remove_cache_unless_retained(args.common.retain_cache_dir);

    let mut stdout = std::io::stdout();
    result.report(&mut stdout)?;
    stdout.flush()?;

    if let Some(ref threshold) = args.threshold {
        if let Err(e) = result.check_threshold(threshold) {
            eprintln!("{e}");
            return Ok(match e {
                RundownError::ThresholdViolated { .. } => EXIT_THRESHOLD,
                _ => EXIT_FAILURE,
            });
        }
    }
    Ok(0)
}

async fn cmd_list(args: ListArgs) -> Result<u8> {
    let opts = build_options(&args.common)?;
    let group = load_group(&args.common.paths, &opts).await?;
    let selected = group.selected_indices()?;

    println!("{:<10} {:<30} {}", "id", "desc", "path");
    for i in selected {
        let op = &group.operators()[i];
        let path = op.book_path().map(|p| p.display().to_string()).unwrap_or_default();
        println!("{:<10} {:<30} {}", &op.id()[..op.id().len().min(7)], op.desc(), path);
    }
    Ok(0)
}

async fn cmd_new(args: NewArgs) -> Result<u8> {
    let skeleton = format!(
        "desc: {}\nrunners:\n  req: https://example.com\nsteps:\n  - req:\n      /health:\n        get: null\n    test: current.status == 200\n",
        args.desc
    );
    match args.out {
        Some(path) => {
            std::fs::write(&path, skeleton).with_context(|| format!("writing {path}"))?;
            println!("wrote {path}");
        }
        None => print!("{skeleton}"),
    }
    Ok(0)
}

fn remove_cache_unless_retained(retain: bool) {
    if !retain {
        if let Err(e) = cache::remove_cache_dir() {
            tracing::warn!(error = %e, "failed to remove cache dir");
        }
    }
}

/// `key:value` with the value allowed to contain further colons.
fn split_pair(pair: &str) -> Option<(&str, &str)> {
    pair.split_once(':')
}

/// Var values: JSON when it parses, raw string otherwise.
fn parse_var_value(raw: &str) -> Value {
    if raw.starts_with("json://") {
        return Value::String(raw.to_string());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn load_env_file(path: &str) -> Result<()> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            std::env::set_var(key.trim(), value.trim());
        }
    }
    Ok(())
}
