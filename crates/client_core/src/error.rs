use shared::{
    domain::{ClientId, VoiceId},
    error::{ProtocolError, RemoteError},
    protocol::ResponseValue,
    transport::LinkError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("background context is gone")]
    ChannelClosed,
    #[error("link queue to the background context is full")]
    QueueFull,
    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("unknown client {0}")]
    UnknownClient(ClientId),
    #[error("voice stream {0} is already finished")]
    VoiceFinished(VoiceId),
    #[error("expected {expected} response, got {got:?}")]
    UnexpectedResponse {
        expected: &'static str,
        got: ResponseValue,
    },
}

impl From<LinkError> for ConnectorError {
    fn from(value: LinkError) -> Self {
        match value {
            LinkError::Full => Self::QueueFull,
            LinkError::Closed => Self::ChannelClosed,
        }
    }
}

impl ConnectorError {
    /// Transport failures cannot be retried on the same connector.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ChannelClosed)
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ChannelClosed | Self::QueueFull => ErrorCategory::Transport,
            Self::Remote(remote) => classify(remote),
            _ => ErrorCategory::Unknown,
        }
    }
}

/// Coarse grouping of failures for user-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Auth,
    Version,
    Capacity,
    Transport,
    Unknown,
}

impl ErrorCategory {
    pub fn label(self) -> &'static str {
        match self {
            Self::Auth => "Authentication",
            Self::Version => "Version",
            Self::Capacity => "Capacity",
            Self::Transport => "Transport",
            Self::Unknown => "Unexpected",
        }
    }
}

pub fn classify(error: &RemoteError) -> ErrorCategory {
    match error.kind.as_deref() {
        Some("AuthenticationFailed" | "WrongServerPassword" | "UsernameInUse" | "InvalidUsername") => {
            return ErrorCategory::Auth
        }
        Some("VersionMismatch") => return ErrorCategory::Version,
        Some("ServerFull") => return ErrorCategory::Capacity,
        _ => {}
    }

    let message_lower = std::iter::once(error.message.as_str())
        .chain(error.causes.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(": ")
        .to_ascii_lowercase();
    if message_lower.contains("password")
        || message_lower.contains("authentication")
        || message_lower.contains("certificate")
        || message_lower.contains("username")
    {
        ErrorCategory::Auth
    } else if message_lower.contains("version") {
        ErrorCategory::Version
    } else if message_lower.contains("full") || message_lower.contains("capacity") {
        ErrorCategory::Capacity
    } else if message_lower.contains("timeout")
        || message_lower.contains("timed out")
        || message_lower.contains("connection")
        || message_lower.contains("network")
        || message_lower.contains("refused")
        || message_lower.contains("unreachable")
    {
        ErrorCategory::Transport
    } else {
        ErrorCategory::Unknown
    }
}

#[cfg(test)]
mod tests {
    use shared::error::{ErrorCode, RejectReason};

    use super::*;

    #[test]
    fn type_tag_decides_before_message() {
        let full = RemoteError::from(RejectReason::ServerFull);
        assert_eq!(classify(&full), ErrorCategory::Capacity);

        let version = RemoteError::from(RejectReason::VersionMismatch {
            server: "1.2.4".into(),
        });
        assert_eq!(classify(&version), ErrorCategory::Version);

        let password = RemoteError::new(ErrorCode::Rejected, "connection closed")
            .with_kind(RejectReason::WrongServerPassword.kind());
        assert_eq!(classify(&password), ErrorCategory::Auth);
    }

    #[test]
    fn untagged_errors_fall_back_to_message_and_causes() {
        let refused = RemoteError::new(ErrorCode::Rejected, "connecting to example.org")
            .with_causes(vec!["Connection refused (os error 111)".into()]);
        assert_eq!(classify(&refused), ErrorCategory::Transport);

        let odd = RemoteError::new(ErrorCode::Internal, "codec exploded");
        assert_eq!(classify(&odd), ErrorCategory::Unknown);
    }

    #[test]
    fn link_errors_map_to_connector_errors() {
        assert!(ConnectorError::from(LinkError::Closed).is_fatal());
        let full = ConnectorError::from(LinkError::Full);
        assert!(!full.is_fatal());
        assert_eq!(full.category(), ErrorCategory::Transport);
    }
}
