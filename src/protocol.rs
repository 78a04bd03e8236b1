//! Wire protocol for the LiveStyle sync transport.
//!
//! Every message is a single JSON text frame of the form `{"name": ..., "data": ...}`.
//! `name` selects routing and semantics, `data` is an opaque payload that the
//! relay forwards verbatim to interested peers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Plaintext body returned for plain HTTP requests hitting the relay.
/// Doubles as a liveness probe response.
pub const SERVER_ID: &str = "LiveStyle WebSocket relay is up and running.";

/// Path prefix a WebSocket upgrade request must match to be accepted.
pub const ACCEPT_PATH: &str = "/livestyle";

/// Message names understood by the transport. Unknown names are still
/// relayed; these constants only cover the names the core itself inspects
/// or emits.
pub mod names {
    pub const EDITOR_CONNECT: &str = "editor-connect";
    pub const PATCHER_CONNECT: &str = "patcher-connect";
    pub const CLIENT_CONNECT: &str = "client-connect";
    pub const EDITOR_DISCONNECT: &str = "editor-disconnect";
    pub const IDENTIFY_CLIENT: &str = "identify-client";
    pub const CALCULATE_DIFF: &str = "calculate-diff";
    pub const APPLY_PATCH: &str = "apply-patch";
    pub const DIFF: &str = "diff";
    pub const ERROR: &str = "error";
}

/// Errors produced by the envelope codec.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not parseable JSON or lacks a `name` field.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

/// The `{name, data}` unit of wire communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn new(name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            data: Some(data),
        }
    }

    /// An envelope carrying no payload, e.g. `client-connect`.
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: None,
        }
    }

    /// Serialize into a single self-contained text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }

    /// Parse a text frame. Fails when the frame is not structured data or
    /// has no `name`.
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }
}

/// Routing class: `calculate-diff` and `apply-patch` go to patchers only,
/// everything else is broadcast to the full connection set.
pub fn routes_to_patchers(name: &str) -> bool {
    matches!(name, names::CALCULATE_DIFF | names::APPLY_PATCH)
}

/// Accept predicate for WebSocket upgrade paths: `/livestyle` with an
/// optional trailing slash or sub-path.
pub fn accepts_path(path: &str) -> bool {
    match path.strip_prefix(ACCEPT_PATH) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_roundtrip() {
        let env = Envelope::new("calculate-diff", json!({"uri": "file.css"}));
        let frame = env.encode().unwrap();
        let back = Envelope::decode(&frame).unwrap();
        assert_eq!(back.name, "calculate-diff");
        assert_eq!(back.data.unwrap()["uri"], "file.css");
    }

    #[test]
    fn bare_envelope_omits_data() {
        let frame = Envelope::bare("client-connect").encode().unwrap();
        assert_eq!(frame, r#"{"name":"client-connect"}"#);
        let back = Envelope::decode(&frame).unwrap();
        assert!(back.data.is_none());
    }

    #[test]
    fn malformed_frames_rejected() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode("42").is_err());
        // valid JSON but no `name`
        assert!(Envelope::decode(r#"{"data": {}}"#).is_err());
    }

    #[test]
    fn routing_class() {
        assert!(routes_to_patchers("calculate-diff"));
        assert!(routes_to_patchers("apply-patch"));
        assert!(!routes_to_patchers("diff"));
        assert!(!routes_to_patchers("editor-connect"));
    }

    #[test]
    fn accept_path_predicate() {
        assert!(accepts_path("/livestyle"));
        assert!(accepts_path("/livestyle/"));
        assert!(accepts_path("/livestyle/session"));
        assert!(!accepts_path("/"));
        assert!(!accepts_path("/livestylex"));
        assert!(!accepts_path("/other"));
    }
}
