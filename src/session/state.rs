use std::fmt;

/// Lifecycle of a [`Session`](super::Session).
///
/// `Idle → Connecting → Active → Closing → Closed`; any state may fall into
/// `Error` on an unrecoverable transport failure. `Closed` and `Error` are
/// terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
    Error { reason: String },
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Error { .. })
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Connecting => write!(f, "connecting"),
            Self::Active => write!(f, "active"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
            Self::Error { reason } => write!(f, "error ({reason})"),
        }
    }
}
