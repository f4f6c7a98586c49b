//! Link status state machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of one peer link.
///
/// ```text
/// new -> connecting -> connected -> open -> closed
///            |             |
///            +--> failed <-+           (failed -> closed)
/// ```
///
/// `closed -> connecting` is the restart edge taken by a full reconnect
/// after teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    New,
    Connecting,
    Connected,
    Open,
    Failed,
    Closed,
}

impl Status {
    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (New, Connecting)
                | (New, Closed)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Closed)
                | (Connected, Open)
                | (Connected, Failed)
                | (Connected, Closed)
                | (Open, Closed)
                | (Failed, Closed)
                | (Closed, Connecting)
        )
    }

    /// Connected or open
    pub fn is_established(self) -> bool {
        matches!(self, Status::Connected | Status::Open)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::New => "new",
            Status::Connecting => "connecting",
            Status::Connected => "connected",
            Status::Open => "open",
            Status::Failed => "failed",
            Status::Closed => "closed",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
