//! Tunnel Core
//!
//! The event queue engine and its collaborators: the handler router, the
//! log file manager and the one-shot signals used for shutdown and replay
//! completion.

pub mod logs;
pub mod queue;
pub mod router;
pub mod signal;

use std::path::PathBuf;

/// Re-export common types
pub use logs::{derive_session_timestamp, LogFiles, LogLayout};
pub use queue::{
    EventQueue, Mode, QueueBuilder, QueueError, QueueHandle, QueueMetricsSnapshot,
};
pub use router::{Application, HandlerError, Router};
pub use signal::Signal;
pub use tunnel_event::{Envelope, EnvelopeError};

/// Environment variable that selects the simulations root.
///
/// Only read at the process boundary; the engine itself takes a [`QueueConfig`].
pub const SIMULATIONS_DIR_ENV: &str = "SIMULATIONS_DIR";

/// Default simulations root, relative to the working directory
pub const DEFAULT_SIMULATIONS_ROOT: &str = "simulations";

/// Default capacity of the output stream
pub const DEFAULT_OUTPUT_CAPACITY: usize = 100;

/// Configuration for an event queue
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Root of the `<YYYY>/<MM>/<DD>` log tree
    pub simulations_root: PathBuf,

    /// Output stream capacity before the loop blocks
    pub output_capacity: usize,
}

impl QueueConfig {
    /// Default configuration rooted at `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            simulations_root: root.into(),
            ..Default::default()
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            simulations_root: PathBuf::from(DEFAULT_SIMULATIONS_ROOT),
            output_capacity: DEFAULT_OUTPUT_CAPACITY,
        }
    }
}
