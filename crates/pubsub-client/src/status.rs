//! Status descriptors returned by one-shot requests and emitted to listeners.

use std::fmt;
use std::time::Duration;

use crate::error::Error;

/// Status categories. Every variant except `Acknowledgment` can reach
/// listeners; `Acknowledgment` only appears on the status returned from a
/// successful one-shot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCategory {
    Connected,
    Disconnected,
    Reconnected,
    UnexpectedDisconnect,
    AccessDenied,
    Timeout,
    NetworkIssues,
    BadRequest,
    ReconnectionAttemptsExhausted,
    MessageCountExceeded,
    RequestMessageCountExceeded,
    Cancelled,
    Unknown,
    HeartbeatSuccess,
    HeartbeatFailed,
    DecryptionError,
    /// A one-shot request completed without error. Never emitted to
    /// listeners.
    Acknowledgment,
}

/// Operation a [`Status`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Time,
    Publish,
    Signal,
    Fire,
    Subscribe,
    Unsubscribe,
    Heartbeat,
    Leave,
    HereNow,
    WhereNow,
    SetState,
    GetState,
    History,
    DeleteMessages,
    AddChannelsToGroup,
    RemoveChannelsFromGroup,
    ListChannelsInGroup,
    DeleteChannelGroup,
    AddPushNotifications,
    RemovePushNotifications,
    ListPushProvisions,
    RemoveAllPushNotifications,
    GrantToken,
    RevokeToken,
    ListFiles,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Descriptor accompanying every request outcome and every status event.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub operation: Operation,
    pub category: StatusCategory,
    pub affected_channels: Vec<String>,
    pub affected_groups: Vec<String>,
    /// HTTP status code of the response, `0` when no response was received.
    pub status_code: u16,
    pub was_cancelled: bool,
    /// Rendered error, if the status describes a failure.
    pub error: Option<String>,
    /// Delay before the next reconnection attempt.
    pub retry_delay: Option<Duration>,
    pub retry_count: u32,
}

impl Status {
    pub fn new(operation: Operation, category: StatusCategory) -> Self {
        Self {
            operation,
            category,
            affected_channels: Vec::new(),
            affected_groups: Vec::new(),
            status_code: 0,
            was_cancelled: false,
            error: None,
            retry_delay: None,
            retry_count: 0,
        }
    }

    /// Build a failure status whose category and flags follow `err`.
    pub fn from_error(operation: Operation, err: &Error) -> Self {
        let mut status = Self::new(operation, err.category());
        status.status_code = err.status_code().unwrap_or(0);
        status.was_cancelled = err.is_cancelled();
        status.error = Some(err.to_string());
        status
    }

    pub fn with_targets(mut self, channels: &[String], groups: &[String]) -> Self {
        self.affected_channels = channels.to_vec();
        self.affected_groups = groups.to_vec();
        self
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = code;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_from_cancelled_error() {
        let status = Status::from_error(Operation::Publish, &Error::Cancelled);
        assert_eq!(status.category, StatusCategory::Cancelled);
        assert!(status.was_cancelled);
        assert!(status.is_error());
        assert_eq!(status.status_code, 0);
    }

    #[test]
    fn status_with_targets() {
        let status = Status::new(Operation::Subscribe, StatusCategory::Connected)
            .with_targets(&["a".to_string()], &["g".to_string()])
            .with_status_code(200);
        assert_eq!(status.affected_channels, vec!["a"]);
        assert_eq!(status.affected_groups, vec!["g"]);
        assert_eq!(status.status_code, 200);
        assert!(!status.is_error());
    }
}
