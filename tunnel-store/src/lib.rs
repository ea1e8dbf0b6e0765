//! Tunnel Store
//!
//! Action recording for the tunnel pipeline: visitors, the append-only
//! [`ActionStore`], recording tunnels, debug re-runs and run comparison.

pub mod action;
pub mod compare;
pub mod store;
pub mod tunnel;

pub use action::{
    generate_file_id, generate_message_id, ActionRow, Direction, MessageKind, NewReplay, Replay,
    UnknownValue, Visitor, ACTION_DEBUG, ACTION_RECORDED, ROOT_CAUSE,
};
pub use compare::{
    compare_actions, compare_lines, compare_log_files, compare_replay, ActionComparison,
    ComparisonReport, DebugRunComparison, LogComparison,
};
pub use store::{ActionStore, MemoryActionStore, StoreError};
pub use tunnel::{rerun, Tunnel, TunnelError, NORMAL_RUN_NAME};
