//! Visitor and Action Records
//!
//! A [`Visitor`] is one event travelling through a tunnel, tagged with the
//! metadata the action store records for it. [`ActionRow`] and [`Replay`]
//! are the rows read back from the store.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tunnel_event::Envelope;

/// Causal origin used for visitors that were not caused by another message
pub const ROOT_CAUSE: &str = "M0";

/// Action type tag for visitors recorded during a live run
pub const ACTION_RECORDED: &str = "r";

/// Action type tag for visitors re-entered from a stored row
pub const ACTION_DEBUG: &str = "d";

const MESSAGE_ID_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const MESSAGE_ID_LEN: usize = 5;
const FILE_ID_CHARSET: &[u8] = b"abcdefghjklmnpqrstxyz";
const FILE_ID_LEN: usize = 7;

/// Kind of message carried by a visitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Input,
    Request,
    Reply,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageKind::Input => write!(f, "INPUT"),
            MessageKind::Request => write!(f, "REQUEST"),
            MessageKind::Reply => write!(f, "REPLY"),
        }
    }
}

impl FromStr for MessageKind {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INPUT" => Ok(MessageKind::Input),
            "REQUEST" => Ok(MessageKind::Request),
            "REPLY" => Ok(MessageKind::Reply),
            other => Err(UnknownValue::new("message kind", other)),
        }
    }
}

/// Direction of a visitor relative to the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    In,
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
        }
    }
}

impl FromStr for Direction {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN" => Ok(Direction::In),
            "OUT" => Ok(Direction::Out),
            other => Err(UnknownValue::new("direction", other)),
        }
    }
}

/// Unrecognized enum text read back from a store
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("Unknown {field}: {value}")]
pub struct UnknownValue {
    pub field: &'static str,
    pub value: String,
}

impl UnknownValue {
    fn new(field: &'static str, value: &str) -> Self {
        Self {
            field,
            value: value.to_string(),
        }
    }
}

/// One event travelling through a tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visitor {
    /// Replay the visitor belongs to; 0 until a tunnel stamps it
    pub replay_id: i64,
    pub message_id: String,
    pub topic: String,
    /// Message id of the cause, or [`ROOT_CAUSE`]
    pub caused_by: String,
    pub kind: MessageKind,
    pub direction: Direction,
    pub payload: String,
    /// [`ACTION_RECORDED`] or [`ACTION_DEBUG`]
    pub action_type: String,
}

impl Visitor {
    /// A new inbound input with a fresh message id
    pub fn input(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            replay_id: 0,
            message_id: generate_message_id(),
            topic: topic.into(),
            caused_by: ROOT_CAUSE.to_string(),
            kind: MessageKind::Input,
            direction: Direction::In,
            payload: payload.into(),
            action_type: ACTION_RECORDED.to_string(),
        }
    }

    /// An outbound reply for an envelope that left the pipeline
    pub fn reply(envelope: &Envelope) -> Self {
        Self {
            kind: MessageKind::Reply,
            direction: Direction::Out,
            ..Self::input(envelope.topic.clone(), envelope.payload.clone())
        }
    }

    /// Inbound input built from an envelope
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self::input(envelope.topic.clone(), envelope.payload.clone())
    }

    /// Re-create a visitor from a stored row under a new replay id
    pub fn from_action_row(row: &ActionRow, replay_id: i64) -> Self {
        Self {
            replay_id,
            message_id: row.message_id.clone(),
            topic: row.topic.clone(),
            caused_by: row.caused_by.clone(),
            kind: row.kind,
            direction: row.direction,
            payload: row.payload.clone(),
            action_type: ACTION_DEBUG.to_string(),
        }
    }

    /// The envelope carried by this visitor
    pub fn envelope(&self) -> Envelope {
        Envelope::new(self.topic.clone(), self.payload.clone())
    }
}

/// A recorded action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRow {
    pub id: i64,
    pub replay_id: i64,
    pub message_id: String,
    pub topic: String,
    pub caused_by: String,
    pub kind: MessageKind,
    pub direction: Direction,
    pub payload: String,
    pub action_type: String,
    /// Unix seconds
    pub created_at: i64,
}

/// A recorded replay (one run of the pipeline)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replay {
    pub id: i64,
    pub name: String,
    pub file_id: String,
    pub version: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_replay_id: Option<i64>,
    /// Unix seconds
    pub created_at: i64,
}

/// Fields supplied when creating a replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReplay {
    pub name: String,
    pub file_id: String,
    pub version: i32,
    pub parent_replay_id: Option<i64>,
}

impl NewReplay {
    /// A top-level replay, version 1
    pub fn new(name: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_id: file_id.into(),
            version: 1,
            parent_replay_id: None,
        }
    }

    /// Mark this replay as a child of `parent`
    pub fn child_of(mut self, parent: i64) -> Self {
        self.parent_replay_id = Some(parent);
        self
    }
}

/// `M` followed by five characters from `[A-Z0-9]`
pub fn generate_message_id() -> String {
    let mut id = String::with_capacity(MESSAGE_ID_LEN + 1);
    id.push('M');
    id.push_str(&random_string(MESSAGE_ID_CHARSET, MESSAGE_ID_LEN));
    id
}

/// Seven lowercase characters naming a replay's file
pub fn generate_file_id() -> String {
    random_string(FILE_ID_CHARSET, FILE_ID_LEN)
}

fn random_string(charset: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| charset[rng.random_range(0..charset.len())] as char)
        .collect()
}
