//! Tunnel CLI
//!
//! Command-line front end for the tunnel event pipeline.

mod generator;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use generator::IntervalGenerator;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use tunnel_core::{EventQueue, QueueConfig, DEFAULT_SIMULATIONS_ROOT, SIMULATIONS_DIR_ENV};
use tunnel_event::Envelope;
use tunnel_store::{
    compare_log_files, ActionStore, LogComparison, MemoryActionStore, Tunnel, Visitor,
};

#[derive(Parser)]
#[command(name = "tunnel")]
#[command(about = "Tunnel - record, replay and compare visitor event runs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest envelopes from stdin and record the run
    Run {
        /// Simulations root (defaults to $SIMULATIONS_DIR, then ./simulations)
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Emit a TICK envelope every SECS seconds
        #[arg(short, long, value_name = "SECS")]
        tick: Option<u64>,

        /// Log level
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },

    /// Replay a recorded input log
    Replay {
        /// Input log to replay
        file: PathBuf,

        /// Simulations root (defaults to $SIMULATIONS_DIR, then ./simulations)
        #[arg(short, long)]
        root: Option<PathBuf>,

        /// Write replayed input here instead of the debug mirror
        #[arg(long)]
        input_log: Option<PathBuf>,

        /// Write replayed output here instead of the debug mirror
        #[arg(long)]
        output_log: Option<PathBuf>,

        /// Log level
        #[arg(short, long, default_value = "info")]
        log_level: String,
    },

    /// Compare two log files line by line
    Compare {
        left: PathBuf,
        right: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            root,
            tick,
            log_level,
        } => {
            setup_logging(&log_level)?;
            run_live(queue_config(root), tick).await?;
        }
        Commands::Replay {
            file,
            root,
            input_log,
            output_log,
            log_level,
        } => {
            setup_logging(&log_level)?;
            run_replay(queue_config(root), file, input_log, output_log).await?;
        }
        Commands::Compare { left, right } => {
            setup_logging("warn")?;
            compare(left, right).await?;
        }
    }

    Ok(())
}

fn setup_logging(level: &str) -> Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);

    // stdout carries pipeline output
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to set tracing subscriber: {}", e))?;

    Ok(())
}

fn queue_config(root: Option<PathBuf>) -> QueueConfig {
    let root = root
        .or_else(|| std::env::var_os(SIMULATIONS_DIR_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SIMULATIONS_ROOT));
    QueueConfig::with_root(root)
}

async fn run_live(config: QueueConfig, tick: Option<u64>) -> Result<()> {
    info!(root = %config.simulations_root.display(), "Starting live run");

    let store = Arc::new(MemoryActionStore::new());
    let tunnel = Arc::new(Mutex::new(Tunnel::normal(store.clone()).await?));

    let mut queue = EventQueue::builder(config)
        .live()
        .context("Failed to open session logs")?;
    let output = queue.take_output().context("Output stream already taken")?;
    let recorder = tokio::spawn(record_outputs(output, tunnel.clone()));

    let (tick_tx, mut ticks) = mpsc::channel(16);
    let generator = tick
        .filter(|secs| *secs > 0)
        .map(|secs| IntervalGenerator::tick(Duration::from_secs(secs)).spawn(tick_tx, queue.done()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!("Reading envelopes from stdin. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => admit(&queue, &tunnel, line).await?,
                None => {
                    info!("Input closed");
                    break;
                }
            },
            Some(line) = ticks.recv() => admit(&queue, &tunnel, line).await?,
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
        }
    }

    queue.flush().await?;
    let metrics = queue.metrics();
    queue.shutdown().await;

    if let Some(generator) = generator {
        generator.await?;
    }
    let recorded = recorder.await?;

    let replay_id = tunnel.lock().await.replay_id();
    let actions = store.actions_by_replay(replay_id).await?.len();

    info!(
        replay_id,
        received = metrics.received,
        published = metrics.published,
        rejected = metrics.rejected,
        recorded,
        actions,
        "Live run finished"
    );

    Ok(())
}

/// Pass a line through the tunnel entrance, then hand it to the queue.
///
/// Envelopes are forwarded as the visitor leaving the tunnel; anything else
/// goes to the queue as-is and is rejected there.
async fn admit(queue: &EventQueue, tunnel: &Mutex<Tunnel>, line: String) -> Result<()> {
    let line = match Envelope::parse(&line) {
        Ok(envelope) => {
            let mut tunnel = tunnel.lock().await;
            tunnel.enter(Visitor::from_envelope(&envelope)).await?;
            match tunnel.next_visitor() {
                Some(visitor) => visitor.envelope().to_line(),
                None => line,
            }
        }
        Err(_) => line,
    };
    queue.enqueue(line).await?;
    Ok(())
}

/// Print each published line and record it at the tunnel exit
async fn record_outputs(mut output: mpsc::Receiver<String>, tunnel: Arc<Mutex<Tunnel>>) -> u64 {
    let mut recorded = 0;

    while let Some(line) = output.recv().await {
        println!("{}", line);

        let envelope = match Envelope::parse(&line) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Published line is not an envelope");
                continue;
            }
        };

        match tunnel.lock().await.exit(Visitor::reply(&envelope)).await {
            Ok(_) => recorded += 1,
            Err(e) => warn!(error = %e, "Failed to record exit"),
        }
    }

    recorded
}

async fn run_replay(
    config: QueueConfig,
    file: PathBuf,
    input_log: Option<PathBuf>,
    output_log: Option<PathBuf>,
) -> Result<()> {
    let mut queue = EventQueue::replay(config);

    if let Some(path) = input_log {
        queue
            .set_input_log(&path)
            .await
            .with_context(|| format!("Failed to open input log {}", path.display()))?;
    }
    if let Some(path) = output_log {
        queue
            .set_output_log(&path)
            .await
            .with_context(|| format!("Failed to open output log {}", path.display()))?;
    }

    let mut output = queue.take_output().context("Output stream already taken")?;
    queue
        .start_reading_log_file(&file)
        .await
        .with_context(|| format!("Failed to replay {}", file.display()))?;

    let quit = queue.quit();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut published = 0u64;
    loop {
        tokio::select! {
            biased;
            Some(line) = output.recv() => {
                println!("{}", line);
                published += 1;
            }
            _ = quit.wait() => break,
            _ = &mut ctrl_c => {
                warn!("Interrupted before the replay completed");
                break;
            }
        }
    }

    // Everything processed before quit is already buffered
    while let Ok(line) = output.try_recv() {
        println!("{}", line);
        published += 1;
    }

    let metrics = queue.metrics();
    queue.shutdown().await;

    info!(
        source = %file.display(),
        processed = metrics.processed,
        rejected = metrics.rejected,
        published,
        "Replay finished"
    );

    Ok(())
}

async fn compare(left: PathBuf, right: PathBuf) -> Result<()> {
    match compare_log_files(&left, &right).await? {
        LogComparison::Identical { lines } => {
            println!("Identical ({} lines)", lines);
            Ok(())
        }
        LogComparison::Differs {
            line,
            left: a,
            right: b,
        } => {
            println!("First difference at line {}:", line);
            println!("< {}", a.as_deref().unwrap_or("<end of file>"));
            println!("> {}", b.as_deref().unwrap_or("<end of file>"));
            anyhow::bail!(
                "{} and {} differ",
                left.display(),
                right.display()
            )
        }
    }
}
