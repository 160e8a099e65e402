//! Pluggable payload codecs.
//!
//! A [`Codec`] converts RPC and result envelopes to and from the byte
//! payloads stored on the broker. The default is UTF-8 JSON. The codec
//! identifier travels in `metadata.codec` so consumers can refuse payloads
//! they cannot decode.
//!
//! Event entries are not run through a codec: their wire layout on the
//! stream is field-based (see the event transport).

use thiserror::Error;

use crate::message::{ResultMessage, RpcMessage};

/// Errors produced while encoding or decoding payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),
}

/// Converts envelopes to and from broker payloads.
///
/// Implementations must be cheap to call concurrently; the same codec
/// instance is shared by every transport.
pub trait Codec: Send + Sync {
    /// Identifier carried in `metadata.codec` (e.g. "json").
    fn name(&self) -> &'static str;

    fn encode_rpc(&self, message: &RpcMessage) -> Result<Vec<u8>, CodecError>;
    fn decode_rpc(&self, payload: &[u8]) -> Result<RpcMessage, CodecError>;

    fn encode_result(&self, message: &ResultMessage) -> Result<Vec<u8>, CodecError>;
    fn decode_result(&self, payload: &[u8]) -> Result<ResultMessage, CodecError>;
}

/// The default codec: UTF-8 JSON.
///
/// Supports integers, floats, booleans, strings, null, ordered sequences and
/// string-keyed mappings. Binary payloads must be base64-wrapped by the
/// caller before they reach the bus.
#[derive(Debug, Clone, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_rpc(&self, message: &RpcMessage) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(message).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_rpc(&self, payload: &[u8]) -> Result<RpcMessage, CodecError> {
        serde_json::from_slice(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn encode_result(&self, message: &ResultMessage) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(message).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_result(&self, payload: &[u8]) -> Result<ResultMessage, CodecError> {
        serde_json::from_slice(payload).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Kwargs;
    use serde_json::json;

    #[test]
    fn test_json_codec_rpc_round_trip() {
        let codec = JsonCodec::new();
        let mut kwargs = Kwargs::new();
        kwargs.insert("user".to_string(), json!("alice"));

        let mut msg = RpcMessage::new("auth", "login", kwargs);
        msg.return_path = "client-1.xyz".to_string();
        msg.metadata
            .insert("codec".to_string(), codec.name().to_string());

        let bytes = codec.encode_rpc(&msg).unwrap();
        let back = codec.decode_rpc(&bytes).unwrap();

        assert_eq!(back.id, msg.id);
        assert_eq!(back.return_path, msg.return_path);
        assert_eq!(back.metadata.get("codec").map(String::as_str), Some("json"));
    }

    #[test]
    fn test_json_codec_result_round_trip() {
        let codec = JsonCodec::new();
        let rpc = RpcMessage::new("auth", "login", Kwargs::new());
        let result = ResultMessage::success(&rpc, json!({"ok": true}));

        let bytes = codec.encode_result(&result).unwrap();
        let back = codec.decode_result(&bytes).unwrap();

        assert_eq!(back.rpc_message_id, rpc.id);
        assert_eq!(back.result, Some(json!({"ok": true})));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let codec = JsonCodec::new();
        assert!(codec.decode_rpc(b"not json").is_err());
        assert!(codec.decode_result(b"{").is_err());
    }
}
