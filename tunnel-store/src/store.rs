//! Action Store
//!
//! The append-only persistence contract used by tunnels: replays are
//! created, actions are appended to them, and both are read back in a fixed
//! order. [`MemoryActionStore`] keeps everything in process.

use crate::action::{ActionRow, NewReplay, Replay, Visitor};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Replay id must be non-zero (message {message_id})")]
    InvalidReplayId { message_id: String },

    #[error("Unknown replay: {0}")]
    UnknownReplay(i64),
}

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Append-only store of replays and actions
#[async_trait]
pub trait ActionStore: Send + Sync {
    /// Append an action for `visitor`, returning the new row id
    async fn insert_action(&self, visitor: &Visitor) -> Result<i64>;

    /// Create a replay, returning its id
    async fn insert_replay(&self, replay: NewReplay) -> Result<i64>;

    /// Look up one replay
    async fn replay(&self, id: i64) -> Result<Option<Replay>>;

    /// All replays, newest first
    async fn replays(&self) -> Result<Vec<Replay>>;

    /// Replays created from `parent`, oldest first
    async fn child_replays(&self, parent: i64) -> Result<Vec<Replay>>;

    /// Actions of one replay, oldest first
    async fn actions_by_replay(&self, replay_id: i64) -> Result<Vec<ActionRow>>;

    /// The `limit` most recent actions across all replays, newest first
    async fn recent_actions(&self, limit: usize) -> Result<Vec<ActionRow>>;
}

#[derive(Debug, Default)]
struct StoreState {
    replays: Vec<Replay>,
    actions: Vec<ActionRow>,
}

/// In-process action store
#[derive(Debug, Clone, Default)]
pub struct MemoryActionStore {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryActionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActionStore for MemoryActionStore {
    async fn insert_action(&self, visitor: &Visitor) -> Result<i64> {
        if visitor.replay_id == 0 {
            return Err(StoreError::InvalidReplayId {
                message_id: visitor.message_id.clone(),
            });
        }

        let mut state = self.state.write().await;
        let id = state.actions.len() as i64 + 1;
        state.actions.push(ActionRow {
            id,
            replay_id: visitor.replay_id,
            message_id: visitor.message_id.clone(),
            topic: visitor.topic.clone(),
            caused_by: visitor.caused_by.clone(),
            kind: visitor.kind,
            direction: visitor.direction,
            payload: visitor.payload.clone(),
            action_type: visitor.action_type.clone(),
            created_at: Utc::now().timestamp(),
        });

        debug!(id, replay_id = visitor.replay_id, topic = %visitor.topic, "Action recorded");
        Ok(id)
    }

    async fn insert_replay(&self, replay: NewReplay) -> Result<i64> {
        let mut state = self.state.write().await;

        if let Some(parent) = replay.parent_replay_id {
            if !state.replays.iter().any(|r| r.id == parent) {
                return Err(StoreError::UnknownReplay(parent));
            }
        }

        let id = state.replays.len() as i64 + 1;
        state.replays.push(Replay {
            id,
            name: replay.name,
            file_id: replay.file_id,
            version: replay.version,
            parent_replay_id: replay.parent_replay_id,
            created_at: Utc::now().timestamp(),
        });

        debug!(id, "Replay created");
        Ok(id)
    }

    async fn replay(&self, id: i64) -> Result<Option<Replay>> {
        let state = self.state.read().await;
        Ok(state.replays.iter().find(|r| r.id == id).cloned())
    }

    async fn replays(&self) -> Result<Vec<Replay>> {
        let state = self.state.read().await;
        Ok(state.replays.iter().rev().cloned().collect())
    }

    async fn child_replays(&self, parent: i64) -> Result<Vec<Replay>> {
        let state = self.state.read().await;
        Ok(state
            .replays
            .iter()
            .filter(|r| r.parent_replay_id == Some(parent))
            .cloned()
            .collect())
    }

    async fn actions_by_replay(&self, replay_id: i64) -> Result<Vec<ActionRow>> {
        let state = self.state.read().await;
        Ok(state
            .actions
            .iter()
            .filter(|a| a.replay_id == replay_id)
            .cloned()
            .collect())
    }

    async fn recent_actions(&self, limit: usize) -> Result<Vec<ActionRow>> {
        let state = self.state.read().await;
        Ok(state.actions.iter().rev().take(limit).cloned().collect())
    }
}
