//! Dual-Mode Event Queue
//!
//! The [`EventQueue`] owns a single-consumer processing loop that validates
//! raw lines, routes valid envelopes, logs every input and output line and
//! republishes routed envelopes on a bounded output stream.
//!
//! A queue runs in one of two modes, fixed at construction:
//! - **Live**: producers push lines with [`EventQueue::enqueue`].
//! - **Replay**: a reader task drains an existing log file
//!   ([`EventQueue::start_reading_log_file`]) and raises the quit signal once
//!   every line of the file has been processed.
//!
//! ```text
//!  enqueue / reader ──► [input, cap 1] ──► processing loop ──► [output, cap 100]
//!                                               │
//!                                      input/output log files
//! ```
//!
//! All coordination goes through the two channels and the done/quit
//! [`Signal`]s. The log files are owned by the processing loop alone; log
//! destinations are swapped by sending commands down the input channel, so
//! a swap takes effect exactly between two items.

use crate::logs::{self, derive_session_timestamp, session_timestamp, LogFiles, LogLayout};
use crate::router::{Application, Router};
use crate::signal::Signal;
use crate::QueueConfig;
use chrono::Local;
use std::fmt;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tunnel_event::Envelope;

/// Capacity of the input channel.
///
/// Items are handed over with an acknowledgement: a producer returns only
/// once the loop has taken its item, so at most one line is in flight
/// between producer and loop.
const INPUT_CAPACITY: usize = 1;

/// Operating mode of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Accepts lines through `enqueue`
    Live,
    /// Drains a pre-existing log file
    Replay,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Live => write!(f, "live"),
            Mode::Replay => write!(f, "replay"),
        }
    }
}

/// Queue error types
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{operation} is not available in {mode} mode")]
    ModeViolation { operation: &'static str, mode: Mode },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Queue has stopped")]
    Stopped,

    #[error("Replay source already started")]
    AlreadyReading,
}

/// Messages understood by the processing loop
#[derive(Debug)]
enum Command {
    /// A raw line to validate, route and log; `taken` fires when the loop
    /// picks it up
    Item {
        raw: String,
        taken: oneshot::Sender<()>,
    },
    /// Swap the timestamped input destination
    SetInputLog(File),
    /// Swap the timestamped output destination
    SetOutputLog(File),
    /// Acknowledged once every earlier command has been handled
    Barrier(oneshot::Sender<()>),
}

/// Builder that fixes configuration and application order before start
pub struct QueueBuilder {
    config: QueueConfig,
    router: Router,
}

impl QueueBuilder {
    /// Create a builder with no applications
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            router: Router::new(),
        }
    }

    /// Register an application; registration order breaks ties
    pub fn application(self, application: impl Application + 'static) -> Self {
        self.shared_application(Arc::new(application))
    }

    /// Register an application that is shared with other owners
    pub fn shared_application(mut self, application: Arc<dyn Application>) -> Self {
        self.router.register(application);
        self
    }

    /// Start a live queue.
    ///
    /// Creates the session's timestamped files and truncates the day's
    /// latest files. Failing to open any of them is a startup error.
    /// Must be called from within a Tokio runtime.
    pub fn live(self) -> Result<EventQueue, QueueError> {
        let now = Local::now();
        let layout = LogLayout::new(&self.config.simulations_root, &now);
        let ts = session_timestamp(&now);
        let logs = LogFiles::open_live(&layout, &ts)?;

        info!(
            day_dir = %layout.day_dir().display(),
            session = %ts,
            applications = self.router.len(),
            "Live session logs opened"
        );

        Ok(self.spawn(Mode::Live, logs))
    }

    /// Start a replay queue.
    ///
    /// No log files are opened until a source is started or destinations are
    /// set explicitly. Must be called from within a Tokio runtime.
    pub fn replay(self) -> EventQueue {
        info!(applications = self.router.len(), "Replay queue created");
        self.spawn(Mode::Replay, LogFiles::new())
    }

    fn spawn(self, mode: Mode, logs: LogFiles) -> EventQueue {
        let (input_tx, input_rx) = mpsc::channel(INPUT_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(self.config.output_capacity.max(1));
        let done = Signal::new();
        let metrics = Arc::new(QueueMetrics::default());

        let worker = Worker {
            mode,
            commands: input_rx,
            output: output_tx,
            router: self.router,
            logs,
            done: done.clone(),
            metrics: metrics.clone(),
        };

        EventQueue {
            mode,
            config: self.config,
            input: input_tx,
            output: Some(output_rx),
            done,
            quit: Signal::new(),
            metrics,
            custom_logs: false,
            worker: Some(tokio::spawn(worker.run())),
            reader: None,
        }
    }
}

/// Cloneable producer handle for a live queue
#[derive(Debug, Clone)]
pub struct QueueHandle {
    input: mpsc::Sender<Command>,
    done: Signal,
}

impl QueueHandle {
    /// Enqueue a raw line; blank lines are discarded
    pub async fn enqueue(&self, item: impl Into<String>) -> Result<(), QueueError> {
        send_item(&self.input, &self.done, item.into()).await
    }
}

/// Dual-mode event queue
pub struct EventQueue {
    mode: Mode,
    config: QueueConfig,
    input: mpsc::Sender<Command>,
    output: Option<mpsc::Receiver<String>>,
    done: Signal,
    quit: Signal,
    metrics: Arc<QueueMetrics>,
    custom_logs: bool,
    worker: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl EventQueue {
    /// Live queue with no applications
    pub fn live(config: QueueConfig) -> Result<Self, QueueError> {
        QueueBuilder::new(config).live()
    }

    /// Replay queue with no applications
    pub fn replay(config: QueueConfig) -> Self {
        QueueBuilder::new(config).replay()
    }

    /// Start building a queue with applications
    pub fn builder(config: QueueConfig) -> QueueBuilder {
        QueueBuilder::new(config)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Enqueue a raw line (live mode only).
    ///
    /// Blank or whitespace-only lines are discarded before logging. Waits
    /// while the loop is busy with the previous item. Per-item outcomes are
    /// only visible on the output stream and in the log files.
    pub async fn enqueue(&self, item: impl Into<String>) -> Result<(), QueueError> {
        self.require(Mode::Live, "enqueue")?;
        send_item(&self.input, &self.done, item.into()).await
    }

    /// Producer handle for concurrent enqueuing (live mode only)
    pub fn handle(&self) -> Result<QueueHandle, QueueError> {
        self.require(Mode::Live, "handle")?;
        Ok(QueueHandle {
            input: self.input.clone(),
            done: self.done.clone(),
        })
    }

    /// Append input lines to `path` instead of the current destination
    pub async fn set_input_log(&mut self, path: impl AsRef<Path>) -> Result<(), QueueError> {
        let file = logs::open_append_async(path.as_ref()).await?;
        self.send_command(Command::SetInputLog(file)).await?;
        self.custom_logs = true;
        debug!(path = %path.as_ref().display(), "Input log set");
        Ok(())
    }

    /// Append output lines to `path` instead of the current destination
    pub async fn set_output_log(&mut self, path: impl AsRef<Path>) -> Result<(), QueueError> {
        let file = logs::open_append_async(path.as_ref()).await?;
        self.send_command(Command::SetOutputLog(file)).await?;
        self.custom_logs = true;
        debug!(path = %path.as_ref().display(), "Output log set");
        Ok(())
    }

    /// Start replaying a log file (replay mode only).
    ///
    /// Symbolic links are resolved first. Unless custom destinations were
    /// set, input and output are mirrored to
    /// `<root>/<YYYY>/<MM>/<DD>/debug/{input,output}_debug_<ts>.log`, where
    /// `<ts>` is derived from the source file name.
    pub async fn start_reading_log_file(
        &mut self,
        path: impl AsRef<Path>,
    ) -> Result<(), QueueError> {
        self.require(Mode::Replay, "start_reading_log_file")?;
        if self.reader.is_some() {
            return Err(QueueError::AlreadyReading);
        }

        let source = logs::resolve_source(path.as_ref());
        let file = tokio::fs::File::open(&source).await?;

        let now = Local::now();
        let ts = derive_session_timestamp(&source, &now);

        if !self.custom_logs {
            let layout = LogLayout::new(&self.config.simulations_root, &now);
            tokio::fs::create_dir_all(layout.debug_dir()).await?;
            self.set_input_log(layout.debug_input(&ts)).await?;
            self.set_output_log(layout.debug_output(&ts)).await?;
        }

        info!(source = %source.display(), session = %ts, "Replay started");

        self.reader = Some(tokio::spawn(read_log_file(
            file,
            self.input.clone(),
            self.done.clone(),
            self.quit.clone(),
        )));
        Ok(())
    }

    /// Wait until every command sent before this call has been handled.
    ///
    /// Blocks like any producer if the output stream is full.
    pub async fn flush(&self) -> Result<(), QueueError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.send_command(Command::Barrier(ack_tx)).await?;
        tokio::select! {
            biased;
            _ = self.done.wait() => Err(QueueError::Stopped),
            ack = ack_rx => ack.map_err(|_| QueueError::Stopped),
        }
    }

    /// Take the output stream; returns `None` once taken
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<String>> {
        self.output.take()
    }

    /// Signal raised once a replay source is exhausted and fully processed
    pub fn quit(&self) -> Signal {
        self.quit.clone()
    }

    /// Signal raised when the queue is asked to stop
    pub fn done(&self) -> Signal {
        self.done.clone()
    }

    /// Ask the loop and reader to stop; queued input is abandoned
    pub fn stop(&self) {
        if self.done.raise() {
            debug!(mode = %self.mode, "Stop requested");
        } else {
            debug!(mode = %self.mode, "Stop already requested");
        }
    }

    /// Stop and wait for the background tasks to finish.
    ///
    /// When this returns, every log file handle has been closed.
    pub async fn shutdown(mut self) {
        self.stop();
        for task in [self.reader.take(), self.worker.take()].into_iter().flatten() {
            if let Err(e) = task.await {
                warn!(error = %e, "Queue task ended abnormally");
            }
        }
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> QueueMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn require(&self, mode: Mode, operation: &'static str) -> Result<(), QueueError> {
        if self.mode == mode {
            Ok(())
        } else {
            Err(QueueError::ModeViolation {
                operation,
                mode: self.mode,
            })
        }
    }

    async fn send_command(&self, command: Command) -> Result<(), QueueError> {
        send(&self.input, &self.done, command).await
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.done.raise();
    }
}

impl fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventQueue")
            .field("mode", &self.mode)
            .field("config", &self.config)
            .field("done", &self.done.is_raised())
            .field("quit", &self.quit.is_raised())
            .finish()
    }
}

async fn send_item(
    input: &mpsc::Sender<Command>,
    done: &Signal,
    item: String,
) -> Result<(), QueueError> {
    if item.trim().is_empty() {
        return Ok(());
    }

    let (taken_tx, taken_rx) = oneshot::channel();
    send(
        input,
        done,
        Command::Item {
            raw: item,
            taken: taken_tx,
        },
    )
    .await?;

    tokio::select! {
        biased;
        _ = done.wait() => Err(QueueError::Stopped),
        taken = taken_rx => taken.map_err(|_| QueueError::Stopped),
    }
}

async fn send(
    input: &mpsc::Sender<Command>,
    done: &Signal,
    command: Command,
) -> Result<(), QueueError> {
    tokio::select! {
        biased;
        _ = done.wait() => Err(QueueError::Stopped),
        sent = input.send(command) => sent.map_err(|_| QueueError::Stopped),
    }
}

/// The processing loop and everything it owns
struct Worker {
    mode: Mode,
    commands: mpsc::Receiver<Command>,
    output: mpsc::Sender<String>,
    router: Router,
    logs: LogFiles,
    done: Signal,
    metrics: Arc<QueueMetrics>,
}

impl Worker {
    async fn run(mut self) {
        debug!(mode = %self.mode, "Processing loop started");

        loop {
            let command = tokio::select! {
                biased;
                _ = self.done.wait() => break,
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                Command::Item { raw, taken } => {
                    let _ = taken.send(());
                    let Some(line) = self.process(raw) else {
                        continue;
                    };
                    let sent = tokio::select! {
                        biased;
                        _ = self.done.wait() => break,
                        sent = self.output.send(line) => sent,
                    };
                    match sent {
                        Ok(()) => {
                            self.metrics.published.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_) => debug!("Output stream has no reader, envelope logged only"),
                    }
                }
                Command::SetInputLog(file) => self.logs.set_input(file),
                Command::SetOutputLog(file) => self.logs.set_output(file),
                Command::Barrier(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        self.logs.close();
        let metrics = self.metrics.snapshot();
        info!(
            mode = %self.mode,
            processed = metrics.processed,
            rejected = metrics.rejected,
            "Processing loop stopped"
        );
    }

    /// Validate, route and log one line.
    ///
    /// Returns the line to publish, or `None` for blank input and rejected
    /// envelopes (which are logged but not published).
    fn process(&mut self, raw: String) -> Option<String> {
        if raw.trim().is_empty() {
            return None;
        }

        self.metrics.received.fetch_add(1, Ordering::Relaxed);
        self.logs.write_input(&raw);

        let result = match Envelope::parse(&raw) {
            Ok(envelope) => {
                let routed = self.router.route(envelope);
                let line = routed.to_line();
                self.logs.write_output(&line);
                Some(line)
            }
            Err(reason) => {
                debug!(%reason, "Rejected malformed envelope");
                self.logs.write_output(&Envelope::invalid_event(&raw).to_line());
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                None
            }
        };

        self.metrics.processed.fetch_add(1, Ordering::Relaxed);
        result
    }
}

/// Replay reader: pushes every non-blank line of `file` into the queue, then
/// raises `quit` once the loop has handled all of them.
async fn read_log_file(
    file: tokio::fs::File,
    input: mpsc::Sender<Command>,
    done: Signal,
    quit: Signal,
) {
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut count: u64 = 0;

    loop {
        if done.is_raised() {
            debug!(lines = count, "Replay reader stopped");
            return;
        }

        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "Failed to read replay source, treating as end of file");
                break;
            }
        }

        let line = decode_line(&buf);
        if line.trim().is_empty() {
            continue;
        }

        if send_item(&input, &done, line).await.is_err() {
            debug!(lines = count, "Replay reader stopped");
            return;
        }
        count += 1;
    }

    // Wait until the loop has worked through everything sent above.
    let (ack_tx, ack_rx) = oneshot::channel();
    if send(&input, &done, Command::Barrier(ack_tx)).await.is_err() {
        return;
    }
    let drained = tokio::select! {
        biased;
        _ = done.wait() => false,
        ack = ack_rx => ack.is_ok(),
    };

    if drained {
        quit.raise();
        info!(lines = count, "Replay source exhausted");
    }
}

/// One source line without its terminator.
///
/// Bytes that are not UTF-8 are replaced, so the line still reaches the
/// loop and is rejected there as a malformed envelope.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Queue metrics (atomic for lock-free access)
#[derive(Debug, Default)]
pub struct QueueMetrics {
    received: AtomicU64,
    processed: AtomicU64,
    published: AtomicU64,
    rejected: AtomicU64,
}

impl QueueMetrics {
    fn snapshot(&self) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of queue metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMetricsSnapshot {
    /// Non-blank lines taken by the loop
    pub received: u64,
    /// Lines fully handled (logged on both sides)
    pub processed: u64,
    /// Envelopes delivered on the output stream
    pub published: u64,
    /// Malformed lines converted to error envelopes
    pub rejected: u64,
}
