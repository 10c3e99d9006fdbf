use serde::{Deserialize, Serialize};

/// Failures reported by a Protocol Session Engine.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("session closed")]
    SessionClosed,
    #[error("send rejected: {0}")]
    SendRejected(String),
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timeout")]
    Timeout,
}

impl ProtocolError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::Network(_) | Self::Timeout
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "connection_failed",
            Self::SessionClosed => "session_closed",
            Self::SendRejected(_) => "send_rejected",
            Self::InvalidCredentials(_) => "invalid_credentials",
            Self::Network(_) => "network_error",
            Self::Timeout => "timeout",
        }
    }
}

/// Why an engine connection closed.
///
/// Terminal reasons mean the stored credential is permanently invalid;
/// everything else is eligible for reconnection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "code")]
pub enum CloseReason {
    LoggedOut,
    Forbidden,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    TimedOut,
    BadSession,
    RestartRequired,
    ServiceUnavailable,
    Unknown(u16),
}

impl CloseReason {
    /// Map a protocol disconnect status code to a reason.
    pub fn from_code(code: u16) -> Self {
        match code {
            401 => Self::LoggedOut,
            403 => Self::Forbidden,
            428 => Self::ConnectionClosed,
            408 => Self::ConnectionLost,
            440 => Self::ConnectionReplaced,
            500 => Self::BadSession,
            515 => Self::RestartRequired,
            503 => Self::ServiceUnavailable,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::LoggedOut => 401,
            Self::Forbidden => 403,
            Self::ConnectionClosed => 428,
            Self::ConnectionLost | Self::TimedOut => 408,
            Self::ConnectionReplaced => 440,
            Self::BadSession => 500,
            Self::RestartRequired => 515,
            Self::ServiceUnavailable => 503,
            Self::Unknown(code) => *code,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::LoggedOut | Self::Forbidden)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoggedOut => "logged_out",
            Self::Forbidden => "forbidden",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionLost => "connection_lost",
            Self::ConnectionReplaced => "connection_replaced",
            Self::TimedOut => "timed_out",
            Self::BadSession => "bad_session",
            Self::RestartRequired => "restart_required",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Unknown(_) => "unknown",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}
