use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use fetchcache::{Cache, CacheStats, CancelToken, Config, KeyMatcher};

#[derive(Parser, Debug)]
#[command(name = "fetchcache")]
#[command(about = "Simulate concurrent cached fetches against a slow remote")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fetchcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Concurrent callers per key in every round
  #[arg(long, default_value_t = 10)]
  callers: usize,

  /// Simulated remote latency in milliseconds
  #[arg(long, default_value_t = 200)]
  latency_ms: u64,

  /// Number of rounds
  #[arg(long, default_value_t = 3)]
  rounds: usize,

  /// Regex of keys to invalidate between rounds
  #[arg(long)]
  invalidate: Option<String>,

  /// Print the report as JSON
  #[arg(long)]
  json: bool,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  /// Keys to fetch
  #[arg(default_values = ["listings:status=open", "farms"])]
  keys: Vec<String>,
}

#[derive(Debug, Serialize)]
struct Report {
  rounds: usize,
  callers_per_key: usize,
  remote_calls: u64,
  #[serde(flatten)]
  stats: CacheStats,
}

/// Stand-in for a slow upstream service.
#[derive(Clone)]
struct FakeRemote {
  latency: Duration,
  calls: Arc<AtomicU64>,
}

impl FakeRemote {
  async fn fetch(&self, key: String, token: CancelToken) -> Result<String> {
    let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
    debug!(key, call = n, "remote fetch");
    tokio::time::sleep(self.latency).await;
    if token.is_cancelled() {
      return Err(eyre!("request for {} aborted", key));
    }
    Ok(format!("{}#{}", key, n))
  }
}

async fn run_round(cache: &Cache, remote: &FakeRemote, keys: &[String], callers: usize) -> Result<()> {
  let loads = keys.iter().flat_map(|key| {
    (0..callers).map(move |_| {
      let remote = remote.clone();
      let key = key.clone();
      let binding = cache.bind(key.clone(), move |token| {
        let remote = remote.clone();
        let key = key.clone();
        async move { remote.fetch(key, token).await }
      });
      async move { binding.load(false).await }
    })
  });

  for result in join_all(loads).await {
    result?;
  }
  Ok(())
}

fn print_report(report: &Report) {
  let stats = &report.stats;
  println!("rounds:          {}", report.rounds);
  println!("callers per key: {}", report.callers_per_key);
  println!("remote calls:    {}", report.remote_calls);
  println!("entries:         {} ({} fresh)", stats.entries, stats.fresh_entries);
  println!("in flight:       {}", stats.in_flight);
  println!("hits:            {}", stats.hits);
  println!("misses:          {}", stats.misses);
  println!("fetches:         {}", stats.fetches);
  println!("joins:           {}", stats.joins);
  println!("failures:        {}", stats.failures);
  println!("cancellations:   {}", stats.cancellations);
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let _log_guard = fetchcache::logging::init(args.log_file.as_deref())?;

  let invalidate = args
    .invalidate
    .as_deref()
    .map(KeyMatcher::regex)
    .transpose()
    .map_err(|e| eyre!("Invalid --invalidate pattern: {}", e))?;

  let cache = Cache::new(config);
  let _sweeper = cache.spawn_sweeper();
  let remote = FakeRemote {
    latency: Duration::from_millis(args.latency_ms),
    calls: Arc::new(AtomicU64::new(0)),
  };

  for round in 1..=args.rounds {
    run_round(&cache, &remote, &args.keys, args.callers).await?;
    info!(round, remote_calls = remote.calls.load(Ordering::SeqCst), "round finished");

    if round < args.rounds {
      if let Some(matcher) = &invalidate {
        cache.invalidate_by_pattern(matcher.clone());
      }
    }
  }

  let report = Report {
    rounds: args.rounds,
    callers_per_key: args.callers,
    remote_calls: remote.calls.load(Ordering::SeqCst),
    stats: cache.stats(),
  };

  if args.json {
    println!("{}", serde_json::to_string_pretty(&report)?);
  } else {
    print_report(&report);
  }

  Ok(())
}
