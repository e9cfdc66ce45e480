//! Routing error types

use bytes::Bytes;
use thiserror::Error;

/// Every failure the routing layer can report.
///
/// Errors are `Clone` because a single in-flight pool refresh or path build
/// hands its outcome to every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Couldn't find enough service nodes to satisfy the request")]
    InsufficientSnodes,

    #[error("Unsupported service node version: {0}")]
    UnsupportedSnodeVersion(String),

    #[error("Service node didn't report a version")]
    MissingSnodeVersion,

    #[error("Invalid URL")]
    InvalidUrl,

    #[error("Invalid request info")]
    InvalidRequestInfo,

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("The user's clock is out of sync with the service node network")]
    ClockOutOfSync,

    #[error("Failed to verify the signature")]
    SignatureVerificationFailed,

    #[error("Request failed at destination with status code {status_code}")]
    RequestFailedAtDestination {
        status_code: u16,
        body: Option<Bytes>,
    },

    #[error("HTTP request failed with status code {status_code}")]
    HttpRequestFailed {
        status_code: u16,
        body: Option<Bytes>,
    },

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Couldn't sign message")]
    SigningFailed,

    #[error("Couldn't compute hash")]
    HashingFailed,

    #[error("Couldn't decrypt value")]
    DecryptionFailed,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Name service responses didn't match")]
    ValidationFailed,

    #[error("Missing user key material")]
    MissingKeyMaterial,

    #[error("Service node pools returned by different nodes were inconsistent")]
    InconsistentSnodePools,

    #[error("Failed to update the service node pool")]
    SnodePoolUpdatingFailed,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Work queue closed")]
    QueueClosed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RoutingError {
    /// Status code for transport or destination failures. Timeouts report 0.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RoutingError::HttpRequestFailed { status_code, .. }
            | RoutingError::RequestFailedAtDestination { status_code, .. } => Some(*status_code),
            RoutingError::Timeout => Some(0),
            _ => None,
        }
    }

    /// Raw body attached to a transport or destination failure.
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            RoutingError::HttpRequestFailed { body, .. }
            | RoutingError::RequestFailedAtDestination { body, .. } => body.as_ref(),
            _ => None,
        }
    }

    /// Status 0 and timeouts can't be attributed to a specific node.
    pub fn is_ambiguous(&self) -> bool {
        self.status_code() == Some(0)
    }
}

impl From<serde_json::Error> for RoutingError {
    fn from(err: serde_json::Error) -> Self {
        RoutingError::InvalidJson(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RoutingError>;
