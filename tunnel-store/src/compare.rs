//! Run Comparison
//!
//! Compares a recorded replay against its debug re-runs, and two log files
//! line by line.

use crate::action::{ActionRow, Replay};
use crate::store::ActionStore;
use crate::tunnel::{Result, TunnelError};
use serde::Serialize;
use std::path::Path;

/// Outcome of comparing two action sequences
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionComparison {
    pub identical: bool,
    pub differences: Vec<String>,
}

/// Compare the actions of an original run with those of a debug run.
///
/// A count mismatch is reported first; the common prefix is still compared
/// field by field.
pub fn compare_actions(original: &[ActionRow], debug: &[ActionRow]) -> ActionComparison {
    let mut differences = Vec::new();

    if original.len() != debug.len() {
        differences.push(format!(
            "Action count mismatch: original has {}, debug has {}",
            original.len(),
            debug.len()
        ));
    }

    for (index, (orig, dbg)) in original.iter().zip(debug).enumerate() {
        compare_row(index, orig, dbg, &mut differences);
    }

    ActionComparison {
        identical: differences.is_empty(),
        differences,
    }
}

fn compare_row(index: usize, orig: &ActionRow, dbg: &ActionRow, out: &mut Vec<String>) {
    let mut check = |field: &str, a: &str, b: &str| {
        if a != b {
            out.push(format!("Index {}: {} differs ({} vs {})", index, field, a, b));
        }
    };

    check("MessageId", &orig.message_id, &dbg.message_id);
    check("Topic", &orig.topic, &dbg.topic);
    check("CausedBy", &orig.caused_by, &dbg.caused_by);
    check("Kind", &orig.kind.to_string(), &dbg.kind.to_string());
    check("Direction", &orig.direction.to_string(), &dbg.direction.to_string());
    check("Payload", &orig.payload, &dbg.payload);
}

/// One debug run compared against its parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugRunComparison {
    pub replay_id: i64,
    pub name: String,
    pub action_count: usize,
    pub identical: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub differences: Vec<String>,
}

/// A replay compared against every debug run made from it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComparisonReport {
    pub original_replay_id: i64,
    pub original_name: String,
    pub action_count: usize,
    pub debug_runs: Vec<DebugRunComparison>,
}

/// Compare replay `replay_id` against each of its child replays
pub async fn compare_replay(store: &dyn ActionStore, replay_id: i64) -> Result<ComparisonReport> {
    let original: Replay = store
        .replay(replay_id)
        .await?
        .ok_or(TunnelError::UnknownReplay(replay_id))?;
    let original_actions = store.actions_by_replay(replay_id).await?;

    let mut debug_runs = Vec::new();
    for child in store.child_replays(replay_id).await? {
        let debug_actions = store.actions_by_replay(child.id).await?;
        let comparison = compare_actions(&original_actions, &debug_actions);
        debug_runs.push(DebugRunComparison {
            replay_id: child.id,
            name: child.name,
            action_count: debug_actions.len(),
            identical: comparison.identical,
            differences: comparison.differences,
        });
    }

    Ok(ComparisonReport {
        original_replay_id: replay_id,
        original_name: original.name,
        action_count: original_actions.len(),
        debug_runs,
    })
}

/// Outcome of comparing two log files
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogComparison {
    /// Both files hold the same `lines` lines
    Identical { lines: usize },

    /// First differing line (1-based); `None` means the file ended first
    Differs {
        line: usize,
        left: Option<String>,
        right: Option<String>,
    },
}

impl LogComparison {
    pub fn is_identical(&self) -> bool {
        matches!(self, LogComparison::Identical { .. })
    }
}

/// Compare two texts line by line
pub fn compare_lines(left: &str, right: &str) -> LogComparison {
    let mut left_lines = left.lines();
    let mut right_lines = right.lines();
    let mut line = 0;

    loop {
        line += 1;
        match (left_lines.next(), right_lines.next()) {
            (None, None) => return LogComparison::Identical { lines: line - 1 },
            (Some(a), Some(b)) if a == b => continue,
            (a, b) => {
                return LogComparison::Differs {
                    line,
                    left: a.map(str::to_string),
                    right: b.map(str::to_string),
                }
            }
        }
    }
}

/// Compare two log files line by line
pub async fn compare_log_files(
    left: impl AsRef<Path>,
    right: impl AsRef<Path>,
) -> std::io::Result<LogComparison> {
    let left = tokio::fs::read_to_string(left.as_ref()).await?;
    let right = tokio::fs::read_to_string(right.as_ref()).await?;
    Ok(compare_lines(&left, &right))
}
