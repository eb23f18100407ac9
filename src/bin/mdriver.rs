//! Replays malloc-lab trace files against a fresh heap each and reports
//! space utilization.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use segalloc::{
  DEFAULT_HEAP_LIMIT, DEFAULT_SEED, FreeCheck, Heap, HeapConfig, ReplayOptions, Trace, VecHeap,
  replay,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Trace-driven checker for the segregated-fit allocator.
#[derive(Debug, Parser)]
#[command(name = "mdriver")]
struct Cli {
  /// Trace files to replay.
  #[arg(required = true)]
  traces: Vec<PathBuf>,

  /// Seed of the merge-skip rng.
  #[arg(long, default_value_t = DEFAULT_SEED)]
  seed: u64,

  /// Verify heap consistency after every op.
  #[arg(long)]
  check: bool,

  /// Hard limit of each simulated heap, in bytes.
  #[arg(long, default_value_t = DEFAULT_HEAP_LIMIT)]
  heap_limit: usize,

  /// Never leave a cross-class merge undone.
  #[arg(long)]
  no_skip: bool,

  /// Reject double and invalid frees.
  #[arg(long)]
  strict: bool,
}

impl Cli {
  fn config(&self) -> HeapConfig {
    let mut config = HeapConfig::default().with_seed(self.seed);
    if self.no_skip {
      config = config.with_merge_skip_one_in(0);
    }
    if self.strict {
      config = config.with_free_check(FreeCheck::Strict);
    }
    config
  }
}

fn init_tracing() {
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::registry()
    .with(env_filter)
    .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
    .init();
}

fn main() -> Result<()> {
  init_tracing();
  let cli = Cli::parse();
  let options = ReplayOptions {
    check_heap: cli.check,
  };

  println!("{:<32} {:>8} {:>10} {:>6}", "trace", "ops", "heap", "util");
  let mut failed = 0;
  let mut utilization = 0.0;
  for path in &cli.traces {
    let text =
      std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let trace: Trace = text
      .parse()
      .with_context(|| format!("parsing {}", path.display()))?;

    let mut heap = Heap::new(VecHeap::with_limit(cli.heap_limit), cli.config())
      .context("initializing heap")?;
    match replay(&mut heap, &trace, &options) {
      Ok(report) => {
        println!(
          "{:<32} {:>8} {:>10} {:>5.1}%",
          path.display(),
          report.ops,
          report.heap_bytes,
          report.utilization * 100.0
        );
        utilization += report.utilization;
      }
      Err(err) => {
        error!(trace = %path.display(), %err, "replay failed");
        failed += 1;
      }
    }
  }

  let passed = cli.traces.len() - failed;
  if passed > 0 {
    info!(
      passed,
      mean_util = utilization / passed as f64,
      "replay complete"
    );
  }
  if failed > 0 {
    bail!("{failed} of {} traces failed", cli.traces.len());
  }
  Ok(())
}
