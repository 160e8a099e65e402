//! Error taxonomy for the bus client.
//!
//! [`BusError`] is the error type surfaced by the public [`BusClient`]
//! operations. Transport-level failures have their own type
//! ([`TransportError`](crate::transport::TransportError)) and are wrapped
//! into `BusError::Transport` at the client boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportError;

/// Direction of a schema validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationDirection {
    /// Payload was checked before transmission.
    Outgoing,
    /// Payload was checked on receipt.
    Incoming,
}

impl std::fmt::Display for ValidationDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Outgoing => write!(f, "outgoing"),
            Self::Incoming => write!(f, "incoming"),
        }
    }
}

/// Classification of a failure that happened on the responding side of an
/// RPC. Carried inside [`ResultMessage`](crate::message::ResultMessage) and
/// surfaced to the caller as [`BusError::Remote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteFailureKind {
    /// The handler itself returned an error.
    HandlerError,
    /// Incoming kwargs failed schema validation on the responder.
    ValidationFailed,
    /// The handler was cancelled (responder shutdown).
    Cancelled,
    /// Anything else that went wrong while dispatching.
    Internal,
}

impl std::fmt::Display for RemoteFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HandlerError => write!(f, "handler_error"),
            Self::ValidationFailed => write!(f, "validation_failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// A failure marshalled back from the responding side of an RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub kind: RemoteFailureKind,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(kind: RemoteFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Errors surfaced by the public bus client operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// Invalid or missing configuration. Fatal at start.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Broker unreachable or protocol error.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// An RPC call exceeded its deadline.
    #[error("RPC {address} timed out after {timeout_ms}ms")]
    RpcTimeout { address: String, timeout_ms: u64 },

    /// An RPC call expired and the broker reported no consumers for the API.
    #[error("no responders for RPC {address} (call expired after {timeout_ms}ms)")]
    NoResponders { address: String, timeout_ms: u64 },

    /// A payload did not match the schema for its address.
    #[error("{direction} validation failed for {address}: {reason}")]
    ValidationFailed {
        address: String,
        direction: ValidationDirection,
        reason: String,
    },

    /// The API is not known on the responding side.
    #[error("unknown API: {api_name}")]
    NoSuchApi { api_name: String },

    /// The API exists but the named method or event does not.
    #[error("API {api_name} has no member named {member}")]
    NoSuchMember { api_name: String, member: String },

    /// The remote handler failed; carries the remote classification.
    #[error("remote error while calling {address}: {failure}")]
    Remote {
        address: String,
        failure: RemoteFailure,
        trace: Option<String>,
    },

    /// A listener name is already registered for an overlapping address.
    #[error("listener '{listener_name}' is already registered for {address}")]
    DuplicateListener {
        listener_name: String,
        address: String,
    },

    /// Incompatible re-registration of an API in the same process.
    #[error("schema conflict for {api_name}: {reason}")]
    SchemaConflict { api_name: String, reason: String },

    /// Invalid lifecycle transition (e.g. `start()` twice, `call()` after stop).
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// Operation cancelled by shutdown or timeout.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// A dotted API or member name failed validation.
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },
}

impl BusError {
    /// Shorthand used by schema checks.
    pub(crate) fn validation(
        address: impl Into<String>,
        direction: ValidationDirection,
        reason: impl Into<String>,
    ) -> Self {
        Self::ValidationFailed {
            address: address.into(),
            direction,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_failure_round_trip() {
        let failure = RemoteFailure::new(RemoteFailureKind::HandlerError, "boom");
        let json = serde_json::to_string(&failure).unwrap();
        assert!(json.contains("handler_error"));

        let back: RemoteFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(back, failure);
    }

    #[test]
    fn test_error_display() {
        let err = BusError::RpcTimeout {
            address: "auth.login".to_string(),
            timeout_ms: 1000,
        };
        assert_eq!(err.to_string(), "RPC auth.login timed out after 1000ms");

        let err = BusError::validation(
            "store.page_view",
            ValidationDirection::Outgoing,
            "kwargs.id: expected integer, got string",
        );
        assert!(err.to_string().starts_with("outgoing validation failed"));
    }
}
