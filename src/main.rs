// SPDX-License-Identifier: PMPL-1.0-or-later

//! swarm-fuzz: load harness and configuration tool for the fuzzing engine.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use colored::*;
use log::info;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use swarm_fuzz::backpressure::BackpressureStrategy;
use swarm_fuzz::pool::WorkerPoolConfig;
use swarm_fuzz::{
    Context, EngineConfig, EngineStats, FuzzEngine, Response, Severity, Task, TaskError,
};

#[derive(Parser)]
#[command(name = "swarm-fuzz")]
#[command(version)]
#[command(about = "Concurrent request engine with baseline anomaly detection")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push a synthetic workload through the engine and report its stats
    Bench {
        /// Number of tasks to submit
        #[arg(short, long, default_value = "10000")]
        tasks: u64,

        /// Pool queue capacity
        #[arg(short, long, default_value = "1000")]
        queue_size: usize,

        /// Backpressure strategy
        #[arg(short, long, value_enum, default_value = "adaptive")]
        strategy: StrategyArg,

        /// Simulated request latency in milliseconds
        #[arg(short, long, default_value = "1")]
        delay_ms: u64,

        /// Fixed worker count (default: autoscale from config)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Distinct targets the tasks rotate over
        #[arg(long, default_value = "4")]
        targets: u64,

        /// Every Nth request returns a 500 (0 disables)
        #[arg(long, default_value = "250")]
        crash_every: u64,

        /// Engine config file (JSON or YAML)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Disable the request rate limiter
        #[arg(long)]
        no_rate_limit: bool,

        /// Seconds to wait for queued work after submission
        #[arg(long, default_value = "120")]
        drain_timeout: u64,

        /// Print stats as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the default engine configuration
    Config {
        /// Output format
        #[arg(short, long, value_enum, default_value = "yaml")]
        format: FormatArg,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum StrategyArg {
    Block,
    Drop,
    DropOldest,
    Adaptive,
}

impl From<StrategyArg> for BackpressureStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Block => BackpressureStrategy::Block,
            StrategyArg::Drop => BackpressureStrategy::Drop,
            StrategyArg::DropOldest => BackpressureStrategy::DropOldest,
            StrategyArg::Adaptive => BackpressureStrategy::Adaptive,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum FormatArg {
    Yaml,
    Json,
}

const NORMAL_BODY: &str = "<html><head><title>Catalogue</title></head><body>\
<ul><li>alpha</li><li>beta</li><li>gamma</li></ul></body></html>";

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Bench {
            tasks,
            queue_size,
            strategy,
            delay_ms,
            workers,
            targets,
            crash_every,
            config,
            no_rate_limit,
            drain_timeout,
            json,
        } => {
            let mut engine_config = match &config {
                Some(path) => EngineConfig::load(path)?,
                None => EngineConfig::default(),
            };
            engine_config.pool.queue_size = queue_size;
            if let Some(workers) = workers {
                engine_config.pool = WorkerPoolConfig {
                    min_workers: workers,
                    max_workers: workers,
                    ..engine_config.pool
                };
            }
            engine_config.backpressure.strategy = strategy.into();
            if no_rate_limit {
                engine_config.rate_limit.enabled = false;
            }

            let delay = Duration::from_millis(delay_ms);
            let requester = move |ctx: &Context, task: &Task| -> Result<Response, TaskError> {
                ctx.sleep(delay).map_err(TaskError::from)?;
                if crash_every > 0 && task.id % crash_every == crash_every - 1 {
                    return Ok(Response::new(500, "Internal Server Error: unhandled exception"));
                }
                Ok(Response::new(200, NORMAL_BODY))
            };

            let engine = FuzzEngine::new(engine_config, requester)
                .context("starting engine")?;
            let results = engine.results();
            let consumer = thread::spawn(move || results.iter().count());

            info!("submitting {} tasks", tasks);
            let started = Instant::now();
            let targets = targets.max(1);
            for id in 0..tasks {
                let target = format!("/api/item/{}", id % targets);
                engine.submit(Task::new(id, target, id.to_le_bytes().to_vec()));
            }
            let submitted_in = started.elapsed();

            let drained = engine.drain(Duration::from_secs(drain_timeout));
            let findings = engine.drain_anomalies(usize::MAX);
            engine.stop();
            let received = consumer.join().unwrap_or_default();
            let elapsed = started.elapsed();
            let stats = engine.stats();

            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_stats(&stats, submitted_in, elapsed, received, drained);
                print_findings(&findings);
            }
        }

        Commands::Config { format } => {
            let config = EngineConfig::default();
            let text = match format {
                FormatArg::Yaml => config.to_yaml()?,
                FormatArg::Json => config.to_json()?,
            };
            println!("{}", text);
        }
    }

    Ok(())
}

fn print_stats(
    stats: &EngineStats,
    submitted_in: Duration,
    elapsed: Duration,
    received: usize,
    drained: bool,
) {
    let pool = &stats.pool;
    let bp = &stats.backpressure;

    println!("\n{}", "=== SWARM-FUZZ BENCH ===".bold().cyan());
    println!(
        "Submitted {} tasks in {:.2}s, finished in {:.2}s",
        stats.submitted,
        submitted_in.as_secs_f64(),
        elapsed.as_secs_f64()
    );
    if !drained {
        println!("{}", "Drain timed out; queued tasks were cancelled".yellow());
    }

    println!("\n{}", "POOL".bold().yellow());
    println!("  Completed: {}", pool.tasks_completed.to_string().green());
    println!("  Failed:    {}", pool.tasks_failed);
    println!("  Dropped:   {}", stats.dropped().to_string().red());
    println!("  Cancelled: {}", pool.tasks_cancelled);
    println!("  Results received: {} (discarded {})", received, pool.results_discarded);
    println!(
        "  Workers: spawned {}, retired {}",
        pool.workers_spawned, pool.workers_retired
    );
    println!("  Average latency: {:?}", pool.average_latency);

    println!("\n{}", "BACKPRESSURE".bold().yellow());
    println!(
        "  Checks {}, pressure events {}, slowdowns {}, blocked {}, drop-oldest {}",
        bp.checks, bp.pressure_events, bp.slowdowns, bp.blocked, bp.drop_oldest_signals
    );
    println!("  Current delay: {:?}", bp.current_delay);

    println!("\n{}", "ANALYZER".bold().yellow());
    let an = &stats.analyzer;
    println!(
        "  Analysed {}, learning {}, duplicates {}, clustered {}",
        an.analysed, an.learning, an.duplicates, an.clustered
    );
    println!(
        "  Info {} | Low {} | Medium {} | High {} | Critical {}",
        an.info,
        an.low,
        an.medium,
        an.high.to_string().red(),
        an.critical.to_string().red().bold()
    );
    println!(
        "  Cache: {} entries, {} bytes, hit rate {:.2}",
        stats.cache.entries,
        stats.cache.size_bytes,
        stats.cache.hit_rate()
    );
}

fn print_findings(findings: &[swarm_fuzz::AnomalyResult]) {
    if findings.is_empty() {
        return;
    }
    println!("\n{}", "FINDINGS".bold().red());
    for finding in findings.iter().take(10) {
        let label = match finding.severity {
            Severity::Critical | Severity::High => finding.severity.label().red().bold(),
            Severity::Medium => finding.severity.label().yellow(),
            _ => finding.severity.label().normal(),
        };
        let cluster = finding
            .similar_to
            .map(|id| format!(" (like #{})", id))
            .unwrap_or_default();
        println!(
            "  [{}] #{} {}: {}{}",
            label, finding.request_id, finding.target, finding.evidence, cluster
        );
    }
    if findings.len() > 10 {
        println!("  ... {} more", findings.len() - 10);
    }
}
