//! # Live Query Wire Protocol
//!
//! The client sends one [`LiveHandshake`] text frame after the socket
//! opens. The server answers with zero or more [`LiveMessage`] frames and
//! ends with a close frame.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::{LiveQueryError, LiveQueryResult};
use crate::query::{DocumentQuery, ErrorBody};

fn is_false(b: &bool) -> bool {
    !*b
}

/// One server frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveMessage {
    /// Changed document after shaping
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_fields: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removed_fields: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated_arrays: Option<Vec<Value>>,

    /// Raw change envelope when no event-specific shape applies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub terminated: bool,
}

impl LiveMessage {
    /// Full-document frame
    pub fn document(doc: Value) -> Self {
        Self {
            doc: Some(doc),
            ..Self::default()
        }
    }

    /// Full document plus the update diff
    pub fn diff(
        doc: Value,
        updated_fields: Value,
        removed_fields: Vec<String>,
        truncated_arrays: Vec<Value>,
    ) -> Self {
        Self {
            doc: Some(doc),
            updated_fields: Some(updated_fields),
            removed_fields: Some(removed_fields),
            truncated_arrays: Some(truncated_arrays),
            ..Self::default()
        }
    }

    /// Raw envelope frame
    pub fn envelope(change: Value) -> Self {
        Self {
            change: Some(change),
            ..Self::default()
        }
    }

    /// Final frame reporting a failure
    pub fn failure(error: ErrorBody) -> Self {
        Self {
            error: Some(error),
            terminated: true,
            ..Self::default()
        }
    }

    /// Encode as a text frame
    pub fn to_text(&self) -> LiveQueryResult<String> {
        serde_json::to_string(self).map_err(|e| LiveQueryError::Protocol(e.to_string()))
    }

    /// Decode a text frame
    pub fn from_text(text: &str) -> LiveQueryResult<Self> {
        serde_json::from_str(text).map_err(|e| LiveQueryError::Protocol(e.to_string()))
    }
}

/// Subscription body: the query descriptor plus credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveHandshake {
    #[serde(flatten)]
    pub query: DocumentQuery,

    /// Elevated-mode secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
}

impl LiveHandshake {
    pub fn new(query: DocumentQuery) -> Self {
        Self {
            query,
            secret: None,
            session_token: None,
        }
    }

    /// Encode as a text frame
    pub fn to_text(&self) -> LiveQueryResult<String> {
        serde_json::to_string(self).map_err(|e| LiveQueryError::Protocol(e.to_string()))
    }

    /// Decode a text frame
    pub fn from_text(text: &str) -> LiveQueryResult<Self> {
        serde_json::from_str(text).map_err(|e| LiveQueryError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::LiveEvent;
    use serde_json::json;

    #[test]
    fn test_message_omits_absent_parts() {
        let msg = LiveMessage::document(json!({"objectId": "abcdefghij"}));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"doc": {"objectId": "abcdefghij"}})
        );

        let failure = LiveMessage::failure(ErrorBody {
            code: "STORE_FEED".into(),
            message: "lagged".into(),
        });
        let wire = serde_json::to_value(&failure).unwrap();
        assert_eq!(wire["terminated"], true);
        assert_eq!(wire["error"]["code"], "STORE_FEED");
    }

    #[test]
    fn test_diff_field_names() {
        let msg = LiveMessage::diff(json!({}), json!({"title": "t"}), vec!["body".into()], vec![]);
        let wire = msg.to_text().unwrap();
        assert!(wire.contains("\"updatedFields\""));
        assert!(wire.contains("\"removedFields\":[\"body\"]"));
        assert_eq!(LiveMessage::from_text(&wire).unwrap(), msg);
    }

    #[test]
    fn test_handshake_flattens_query() {
        let mut query = DocumentQuery::new("Post");
        query.event = Some(LiveEvent::Insert);
        let mut handshake = LiveHandshake::new(query);
        handshake.session_token = Some("tok".into());

        let wire: Value = serde_json::from_str(&handshake.to_text().unwrap()).unwrap();
        assert_eq!(wire["collection"], "Post");
        assert_eq!(wire["event"], "insert");
        assert_eq!(wire["sessionToken"], "tok");
        assert!(wire.get("secret").is_none());

        let back = LiveHandshake::from_text(&wire.to_string()).unwrap();
        assert_eq!(back, handshake);
    }

    #[test]
    fn test_garbage_handshake_is_protocol_error() {
        let err = LiveHandshake::from_text("{\"filter\": 1}").unwrap_err();
        assert_eq!(err.code(), "LIVE_PROTOCOL");
    }
}
