//! Events delivered to listeners.

use std::fmt;

use serde_json::Value;

use crate::status::Status;

/// Kind of a real-time envelope, from the `e` field of the subscribe
/// response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageType {
    #[default]
    Message,
    Signal,
    Object,
    MessageAction,
    File,
}

impl MessageType {
    pub(crate) fn from_wire(kind: Option<i64>) -> Self {
        match kind {
            Some(1) => Self::Signal,
            Some(2) => Self::Object,
            Some(3) => Self::MessageAction,
            Some(4) => Self::File,
            _ => Self::Message,
        }
    }
}

/// A message, signal, object, action or file event received on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub channel: String,
    /// Channel group or wildcard pattern that routed the message, if any.
    pub subscription: Option<String>,
    /// Publish timetoken.
    pub timetoken: i64,
    pub originating_timetoken: Option<i64>,
    pub publisher: Option<String>,
    /// Decrypted payload when a cipher is configured.
    pub payload: Value,
    pub message_type: MessageType,
    pub user_metadata: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceAction {
    Join,
    Leave,
    Timeout,
    StateChange,
    Interval,
    Other(String),
}

impl PresenceAction {
    pub(crate) fn parse(action: &str) -> Self {
        match action {
            "join" => Self::Join,
            "leave" => Self::Leave,
            "timeout" => Self::Timeout,
            "state-change" => Self::StateChange,
            "interval" => Self::Interval,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for PresenceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Timeout => "timeout",
            Self::StateChange => "state-change",
            Self::Interval => "interval",
            Self::Other(s) => s,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    pub event: PresenceAction,
    pub uuid: Option<String>,
    pub occupancy: u64,
    pub state: Option<Value>,
    /// Interval events list the UUIDs that joined, left or timed out since
    /// the previous interval.
    pub joined: Vec<String>,
    pub left: Vec<String>,
    pub timed_out: Vec<String>,
    /// Channel the event is about, without the presence suffix.
    pub channel: String,
    pub subscription: Option<String>,
    pub timetoken: i64,
}

/// Item yielded by [`Listener::next`](crate::Listener::next).
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Status(Status),
    Message(Message),
    Presence(PresenceEvent),
}
