//! Upstream gateway wire format

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON message on the gateway connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GatewayMessage {
    Request {
        id: String,
        payload: Value,
    },
    Response {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        /// Either a string or an object with a `message` field
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Value>,
    },
    Ping {
        id: String,
    },
    Pong {
        id: String,
    },
    /// Unsolicited notification
    Event {
        payload: Value,
    },
}

impl GatewayMessage {
    /// Serialize to a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame
    ///
    /// # Errors
    ///
    /// Returns error for malformed JSON or an unknown `type`
    pub fn from_json(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Human-readable text of a response `error` field
#[must_use]
pub fn error_text(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Object(fields) => fields
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), ToString::to_string),
        other => other.to_string(),
    }
}
