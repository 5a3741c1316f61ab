use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Rejected,
    NotFound,
    Unsupported,
    Internal,
}

/// Error value that survives the trip across the link.
///
/// Only plain data is kept: the display message, the cause chain and, when
/// the failure was a [`RejectReason`], its type tag.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct RemoteError {
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub causes: Vec<String>,
}

impl RemoteError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            kind: None,
            message: message.into(),
            causes: Vec::new(),
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_causes(mut self, causes: Vec<String>) -> Self {
        self.causes = causes;
        self
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, what)
    }
}

impl From<RejectReason> for RemoteError {
    fn from(value: RejectReason) -> Self {
        Self::new(ErrorCode::Rejected, value.to_string()).with_kind(value.kind())
    }
}

/// Typed reasons a server refuses a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("wrong server password")]
    WrongServerPassword,
    #[error("username already in use: {0}")]
    UsernameInUse(String),
    #[error("invalid username: {0}")]
    InvalidUsername(String),
    #[error("version mismatch: server runs {server}")]
    VersionMismatch { server: String },
    #[error("server is full")]
    ServerFull,
    #[error("connection refused: {0}")]
    Other(String),
}

impl RejectReason {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "AuthenticationFailed",
            Self::WrongServerPassword => "WrongServerPassword",
            Self::UsernameInUse(_) => "UsernameInUse",
            Self::InvalidUsername(_) => "InvalidUsername",
            Self::VersionMismatch { .. } => "VersionMismatch",
            Self::ServerFull => "ServerFull",
            Self::Other(_) => "Other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unsupported method `{method}` on {entity}")]
    UnsupportedMethod { entity: &'static str, method: String },
    #[error("invalid arguments for `{method}`: {reason}")]
    InvalidArguments { method: String, reason: String },
}
