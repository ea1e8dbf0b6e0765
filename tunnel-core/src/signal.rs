//! One-shot broadcast signal
//!
//! A [`Signal`] moves from unset to set exactly once and never resets.
//! Any number of tasks may wait on it; waiters that arrive after the signal
//! was raised return immediately.

use std::sync::Arc;
use tokio::sync::watch;

/// One-shot, broadcast-readable flag
#[derive(Debug, Clone)]
pub struct Signal {
    state: Arc<watch::Sender<bool>>,
}

impl Signal {
    /// Create an unset signal
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Raise the signal.
    ///
    /// Returns `true` if this call raised it, `false` if it was already set.
    pub fn raise(&self) -> bool {
        self.state.send_if_modified(|raised| {
            if *raised {
                false
            } else {
                *raised = true;
                true
            }
        })
    }

    /// Whether the signal has been raised
    pub fn is_raised(&self) -> bool {
        *self.state.borrow()
    }

    /// Wait until the signal is raised
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = rx.wait_for(|raised| *raised).await;
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}
