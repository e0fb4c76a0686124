//! Taskframe - CLI

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use taskframe::util::config::{discover_config, load_config, EngineConfig};
use taskframe::util::logger::{self, LogLevel};
use taskframe::{FrameView, Pool, Simulation, TaskKind, NAME, VERSION};

/// Parallel task pool and double-buffered simulation pipeline
#[derive(Parser, Debug)]
#[command(name = "taskframe")]
#[command(version = VERSION)]
#[command(about = NAME, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to ./taskframe.toml if present)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, value_name = "LEVEL")]
    log_level: Option<LogLevel>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a batch of tasks to a worker pool
    Tasks {
        /// Number of workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Number of tasks to submit
        #[arg(short = 'n', long, default_value_t = 8)]
        count: usize,

        /// Task kind (echo, sum, fib, primes, sleep, sort)
        #[arg(short, long, default_value = "fib")]
        kind: TaskKind,

        /// JSON payload for every task
        #[arg(short, long, default_value = "30")]
        arg: String,
    },

    /// Run the simulation pipeline and print each rendered frame
    Simulate {
        /// Number of entities
        #[arg(short, long)]
        entities: Option<usize>,

        #[arg(long)]
        width: Option<f32>,

        #[arg(long)]
        height: Option<f32>,

        /// Seed for the initial state
        #[arg(long)]
        seed: Option<u64>,

        /// How long to run, in milliseconds
        #[arg(short, long, default_value_t = 500)]
        duration_ms: u64,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Print version information
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => discover_config(&std::env::current_dir()?).context("Failed to load taskframe.toml")?,
    };
    config
        .apply_env()
        .context("Invalid TASKFRAME_* environment override")?;
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    if args.verbose {
        config.log.level = LogLevel::Debug;
    }
    logger::init_with_level(config.log.level);

    if args.verbose {
        eprintln!("{} version: {}", NAME, VERSION);
        eprintln!("Host: {}", std::env::consts::OS);
    }

    match args.command {
        Commands::Tasks {
            workers,
            count,
            kind,
            arg,
        } => {
            if let Some(workers) = workers {
                config.pool.workers = workers;
            }
            let payload: Value = serde_json::from_str(&arg)
                .with_context(|| format!("Task payload is not valid JSON: {arg}"))?;
            run_tasks(&config, count, kind, payload)?;
        }
        Commands::Simulate {
            entities,
            width,
            height,
            seed,
            duration_ms,
        } => {
            let sim = &mut config.simulation;
            sim.entities = entities.unwrap_or(sim.entities);
            sim.width = width.unwrap_or(sim.width);
            sim.height = height.unwrap_or(sim.height);
            sim.seed = seed.or(sim.seed);
            run_simulation(&config, Duration::from_millis(duration_ms))?;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
        Commands::Version => {
            println!("{} {}", NAME, VERSION);
        }
    }

    Ok(())
}

fn run_tasks(
    config: &EngineConfig,
    count: usize,
    kind: TaskKind,
    payload: Value,
) -> Result<()> {
    config.validate()?;
    let pool = Pool::with_config(config.pool_config()).context("Failed to create pool")?;

    let start = Instant::now();
    let handles: Vec<_> = (0..count)
        .map(|_| pool.submit(kind, payload.clone()))
        .collect();

    let mut failures = 0;
    for handle in handles {
        let id = handle.id();
        match handle.wait() {
            Ok(value) => println!("{id}: {value}"),
            Err(err) => {
                failures += 1;
                println!("{id}: error: {err}");
            }
        }
    }
    let elapsed = start.elapsed();
    pool.terminate().wait();

    println!(
        "{} task(s) on {} worker(s) in {:.2?} ({} failed)",
        count,
        pool.size(),
        elapsed,
        failures
    );
    if failures > 0 {
        bail!("{failures} task(s) failed");
    }
    Ok(())
}

fn run_simulation(
    config: &EngineConfig,
    duration: Duration,
) -> Result<()> {
    config.validate()?;
    let mut sim =
        Simulation::init(config.simulation_config()).context("Failed to initialise simulation")?;
    sim.on_frame(|view| println!("{}", render(view)));

    sim.start()?;
    thread::sleep(duration);
    sim.stop();

    let stats = sim.stats();
    println!(
        "generation {}: {} step(s), {} frame(s) rendered, {} dropped",
        sim.generation(),
        stats.steps.load(std::sync::atomic::Ordering::SeqCst),
        stats.consumed.load(std::sync::atomic::Ordering::SeqCst),
        stats.dropped.load(std::sync::atomic::Ordering::SeqCst),
    );
    Ok(())
}

/// Text stand-in for a draw routine: one summary line per frame.
fn render(view: FrameView<'_>) -> String {
    let n = view.len().max(1) as f32;
    let (mut cx, mut cy, mut speed) = (0.0f32, 0.0f32, 0.0f32);
    for record in view.records() {
        cx += record.position_x;
        cy += record.position_y;
        speed += record.velocity_x.hypot(record.velocity_y);
    }
    format!(
        "frame {:>6}  entities {:>6}  centroid ({:>7.2}, {:>7.2})  mean speed {:.3}",
        view.generation(),
        view.len(),
        cx / n,
        cy / n,
        speed / n
    )
}
