//! Tunnel
//!
//! A tunnel records every visitor that enters or exits it in an
//! [`ActionStore`], under the replay id of the run it belongs to. Entered
//! visitors wait in a FIFO until [`Tunnel::next_visitor`] takes them.

use crate::action::{generate_file_id, ActionRow, NewReplay, Visitor};
use crate::store::{ActionStore, StoreError};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Name given to the replay row created by a normal run
pub const NORMAL_RUN_NAME: &str = "Normal Run Created";

/// Tunnel error types
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Visitor {message_id} has no replay id")]
    MissingReplayId { message_id: String },

    #[error("Unknown replay: {0}")]
    UnknownReplay(i64),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for tunnel operations
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Recording entry and exit point of the pipeline
pub struct Tunnel {
    store: Arc<dyn ActionStore>,
    replay_id: i64,
    queue: VecDeque<Visitor>,
}

impl Tunnel {
    /// Create a tunnel for a fresh live run.
    ///
    /// Inserts a new replay row and stamps its id on every visitor that
    /// enters without one.
    pub async fn normal(store: Arc<dyn ActionStore>) -> Result<Self> {
        let file_id = generate_file_id();
        let replay_id = store
            .insert_replay(NewReplay::new(NORMAL_RUN_NAME, file_id.clone()))
            .await?;

        info!(replay_id, file_id = %file_id, "Normal tunnel opened");

        Ok(Self {
            store,
            replay_id,
            queue: VecDeque::new(),
        })
    }

    /// Create a tunnel that only accepts visitors already carrying a replay id
    pub fn debug(store: Arc<dyn ActionStore>) -> Self {
        Self {
            store,
            replay_id: 0,
            queue: VecDeque::new(),
        }
    }

    /// Replay id stamped on entering visitors (0 for a debug tunnel)
    pub fn replay_id(&self) -> i64 {
        self.replay_id
    }

    /// Record `visitor` and queue it
    pub async fn enter(&mut self, mut visitor: Visitor) -> Result<()> {
        if visitor.replay_id == 0 {
            visitor.replay_id = self.replay_id;
        }
        if visitor.replay_id == 0 {
            return Err(TunnelError::MissingReplayId {
                message_id: visitor.message_id,
            });
        }

        self.store.insert_action(&visitor).await?;
        debug!(message_id = %visitor.message_id, topic = %visitor.topic, "Visitor entered");
        self.queue.push_back(visitor);
        Ok(())
    }

    /// Take the oldest queued visitor
    pub fn next_visitor(&mut self) -> Option<Visitor> {
        self.queue.pop_front()
    }

    /// Record the terminal state of `visitor`
    pub async fn exit(&mut self, mut visitor: Visitor) -> Result<Visitor> {
        if visitor.replay_id == 0 {
            visitor.replay_id = self.replay_id;
        }
        if visitor.replay_id == 0 {
            warn!(message_id = %visitor.message_id, "Skipping exit record: visitor has no replay id");
            return Err(TunnelError::MissingReplayId {
                message_id: visitor.message_id,
            });
        }

        self.store.insert_action(&visitor).await?;
        debug!(message_id = %visitor.message_id, topic = %visitor.topic, "Visitor exited");
        Ok(visitor)
    }

    /// Number of queued visitors
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("replay_id", &self.replay_id)
            .field("queued", &self.queue.len())
            .finish()
    }
}

/// Re-run a recorded replay.
///
/// Creates a child replay of `replay_id` and returns the original actions
/// re-stamped with the child's id, in their original order. The caller feeds
/// them through a debug tunnel.
pub async fn rerun(
    store: &dyn ActionStore,
    replay_id: i64,
    name: Option<&str>,
) -> Result<(i64, Vec<Visitor>)> {
    let original = store
        .replay(replay_id)
        .await?
        .ok_or(TunnelError::UnknownReplay(replay_id))?;

    let name = name
        .map(str::to_string)
        .unwrap_or_else(|| format!("Debug of replay {}", replay_id));
    let child = NewReplay {
        version: original.version + 1,
        ..NewReplay::new(name, original.file_id.clone()).child_of(replay_id)
    };
    let child_id = store.insert_replay(child).await?;

    let rows: Vec<ActionRow> = store.actions_by_replay(replay_id).await?;
    let visitors = rows
        .iter()
        .map(|row| Visitor::from_action_row(row, child_id))
        .collect::<Vec<_>>();

    info!(replay_id, child_id, actions = visitors.len(), "Replay re-run prepared");
    Ok((child_id, visitors))
}
