//! Message envelopes flowing across the bus.
//!
//! Three envelope types exist: [`RpcMessage`] (a call, consumed by exactly
//! one responder), [`ResultMessage`] (the reply, consumed by the originating
//! caller) and [`EventMessage`] (fanned out to every listener group).
//!
//! # Example
//!
//! ```rust,ignore
//! use axon::message::{EventMessage, RpcMessage};
//! use serde_json::json;
//!
//! let rpc = RpcMessage::new("auth", "login", kwargs_map(json!({"user": "a"})));
//! assert_eq!(rpc.canonical_name(), "auth.login");
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{BusError, RemoteFailure};

/// Metadata key carrying the codec identifier (see [`crate::codec`]).
pub const METADATA_CODEC: &str = "codec";

/// Opaque unique message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a fresh random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// String-keyed metadata carried on every envelope (correlation ids, client
/// identity, trace context, codec identifier).
pub type Metadata = HashMap<String, String>;

/// Keyword arguments for a method or event: parameter name to JSON value.
pub type Kwargs = Map<String, Value>;

/// A remote procedure call envelope.
///
/// Created by the caller, serialized, consumed by exactly one worker, then
/// discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    pub id: MessageId,

    pub api_name: String,

    pub procedure_name: String,

    pub kwargs: Kwargs,

    /// Transport-specific address where the result must be sent.
    #[serde(default)]
    pub return_path: String,

    #[serde(default)]
    pub metadata: Metadata,
}

impl RpcMessage {
    pub fn new(
        api_name: impl Into<String>,
        procedure_name: impl Into<String>,
        kwargs: Kwargs,
    ) -> Self {
        Self {
            id: MessageId::random(),
            api_name: api_name.into(),
            procedure_name: procedure_name.into(),
            kwargs,
            return_path: String::new(),
            metadata: Metadata::new(),
        }
    }

    /// Canonical address, `api_name.procedure_name`.
    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.api_name, self.procedure_name)
    }
}

/// The reply to an [`RpcMessage`]. Exactly one is produced per dispatched
/// call; `result` and `error` are mutually exclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub id: MessageId,

    pub rpc_message_id: MessageId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFailure>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,

    #[serde(default)]
    pub metadata: Metadata,
}

impl ResultMessage {
    /// Build a success reply for the given call.
    pub fn success(rpc_message: &RpcMessage, result: Value) -> Self {
        Self {
            id: MessageId::random(),
            rpc_message_id: rpc_message.id.clone(),
            result: Some(result),
            error: None,
            trace: None,
            metadata: Metadata::new(),
        }
    }

    /// Build an error reply for the given call.
    pub fn failure(rpc_message: &RpcMessage, failure: RemoteFailure, trace: Option<String>) -> Self {
        Self {
            id: MessageId::random(),
            rpc_message_id: rpc_message.id.clone(),
            result: None,
            error: Some(failure),
            trace,
            metadata: Metadata::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// An event envelope, fanned out to every listener group subscribed at the
/// time of publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: MessageId,

    pub api_name: String,

    pub event_name: String,

    pub kwargs: Kwargs,

    #[serde(default)]
    pub metadata: Metadata,

    /// Broker-assigned stream position, when known (e.g. a Redis stream id
    /// such as `1234567890123-0`). Not serialized; it is carried out of band
    /// by the transport.
    #[serde(skip)]
    pub native_id: Option<String>,
}

impl EventMessage {
    pub fn new(
        api_name: impl Into<String>,
        event_name: impl Into<String>,
        kwargs: Kwargs,
    ) -> Self {
        Self {
            id: MessageId::random(),
            api_name: api_name.into(),
            event_name: event_name.into(),
            kwargs,
            metadata: Metadata::new(),
            native_id: None,
        }
    }

    /// Canonical address, `api_name.event_name`.
    pub fn canonical_name(&self) -> String {
        format!("{}.{}", self.api_name, self.event_name)
    }
}

/// Validate a dotted API name (`a.b.c`): one or more dot-separated
/// identifiers, each starting with a letter or underscore.
pub fn validate_api_name(name: &str) -> Result<(), BusError> {
    if name.is_empty() {
        return Err(BusError::InvalidName {
            name: name.to_string(),
            reason: "API name is empty".to_string(),
        });
    }
    for part in name.split('.') {
        validate_identifier(name, part)?;
    }
    Ok(())
}

/// Validate a method or event name: a single identifier, no dots.
pub fn validate_member_name(name: &str) -> Result<(), BusError> {
    if name.contains('.') {
        return Err(BusError::InvalidName {
            name: name.to_string(),
            reason: "member names must not contain dots".to_string(),
        });
    }
    validate_identifier(name, name)
}

fn validate_identifier(full: &str, part: &str) -> Result<(), BusError> {
    let mut chars = part.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_start || !part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(BusError::InvalidName {
            name: full.to_string(),
            reason: format!("'{part}' is not a valid identifier"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kwargs(value: Value) -> Kwargs {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_rpc_message_serialize() {
        let mut msg = RpcMessage::new("auth", "login", kwargs(json!({"user": "a"})));
        msg.return_path = "client-1.abc".to_string();

        let json_str = serde_json::to_string(&msg).unwrap();
        assert!(json_str.contains("api_name"));
        assert!(json_str.contains("procedure_name"));
        assert!(json_str.contains("return_path"));

        let back: RpcMessage = serde_json::from_str(&json_str).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.canonical_name(), "auth.login");
        assert_eq!(back.kwargs["user"], json!("a"));
    }

    #[test]
    fn test_result_message_exclusive() {
        let rpc = RpcMessage::new("auth", "login", Kwargs::new());

        let ok = ResultMessage::success(&rpc, json!(true));
        assert!(!ok.is_error());
        assert_eq!(ok.rpc_message_id, rpc.id);

        let failure = RemoteFailure::new(crate::error::RemoteFailureKind::HandlerError, "bad");
        let err = ResultMessage::failure(&rpc, failure, None);
        assert!(err.is_error());
        assert!(err.result.is_none());
    }

    #[test]
    fn test_event_message_native_id_not_serialized() {
        let mut event = EventMessage::new("store", "page_view", kwargs(json!({"id": 42})));
        event.native_id = Some("123-0".to_string());

        let json_str = serde_json::to_string(&event).unwrap();
        assert!(!json_str.contains("123-0"));

        let back: EventMessage = serde_json::from_str(&json_str).unwrap();
        assert!(back.native_id.is_none());
        assert_eq!(back.canonical_name(), "store.page_view");
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_api_name("auth").is_ok());
        assert!(validate_api_name("company.auth.v2").is_ok());
        assert!(validate_api_name("").is_err());
        assert!(validate_api_name("1auth").is_err());
        assert!(validate_api_name("auth..x").is_err());

        assert!(validate_member_name("login").is_ok());
        assert!(validate_member_name("page_view").is_ok());
        assert!(validate_member_name("a.b").is_err());
        assert!(validate_member_name("-x").is_err());
    }
}
