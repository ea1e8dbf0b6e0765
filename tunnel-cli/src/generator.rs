//! Interval input generator
//!
//! Emits one envelope line per interval until the queue's done signal is
//! raised or the receiving side goes away.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use tunnel_core::Signal;
use tunnel_event::Envelope;

/// Topic of the engine heartbeat
pub const TICK_TOPIC: &str = "TICK";

/// Produces envelopes on a fixed interval
pub struct IntervalGenerator {
    interval: Duration,
    make: Box<dyn Fn() -> Envelope + Send + Sync>,
}

impl IntervalGenerator {
    pub fn new(interval: Duration, make: impl Fn() -> Envelope + Send + Sync + 'static) -> Self {
        Self {
            interval,
            make: Box::new(make),
        }
    }

    /// Heartbeat whose payload is the current UTC time in nanoseconds
    pub fn tick(interval: Duration) -> Self {
        Self::new(interval, || {
            let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
            Envelope::new(TICK_TOPIC, nanos.to_string())
        })
    }

    /// Run until `done` is raised or `tx` is closed
    pub fn spawn(self, tx: mpsc::Sender<String>, done: Signal) -> JoinHandle<()> {
        info!(interval = ?self.interval, "Started interval generator");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = done.wait() => break,
                    _ = ticker.tick() => {
                        let line = (self.make)().to_line();
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                }
            }

            debug!("Interval generator stopped");
        })
    }
}
