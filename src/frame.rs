//! Message types exchanged with the daemon.
//!
//! Every message is a UTF-8 JSON document followed by a single ETX byte:
//!
//! ```text
//! {"id":"KRPC_0x1","method":"info","params":{}}\x03
//! ```
//!
//! Shapes seen on the wire:
//! - Request: `{method, params, id}`
//! - Response: `{id, result}` or `{id, error: {message, ..}}`
//! - Push: `{remote_method, params, ..}` (no id)

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, RpcError};

/// Frame terminator (ASCII ETX).
pub const DELIMITER: u8 = 0x03;

/// Correlation id of a request.
///
/// The daemon echoes whatever the client sent, so both strings and integers
/// are accepted. Generated ids are always strings with a `KRPC_` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Int(i64),
    /// String id.
    Str(String),
}

impl RequestId {
    /// Extract an id from a JSON value.
    ///
    /// Returns `None` for anything other than a string or an integer that
    /// fits in `i64`.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Int),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

/// Outbound request.
///
/// Leave `id` empty to have the session assign one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    /// Correlation id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// Endpoint name, e.g. `info` or `objects/subscribe`.
    pub method: String,
    /// Method arguments.
    pub params: Value,
}

impl Request {
    /// Build a request without an id.
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Build a request with empty `params`.
    pub fn method(method: impl Into<String>) -> Self {
        Self::new(method, Value::Object(serde_json::Map::new()))
    }

    /// Use a caller-chosen id instead of a generated one.
    pub fn with_id(mut self, id: impl Into<RequestId>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// One decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame(Value);

impl Frame {
    /// Wrap a JSON value.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Correlation id, if the frame answers a request.
    pub fn id(&self) -> Option<RequestId> {
        self.0.get("id").and_then(RequestId::from_value)
    }

    /// Name a push is routed by.
    pub fn remote_method(&self) -> Option<&str> {
        self.0.get("remote_method").and_then(Value::as_str)
    }

    /// `params` member (pushes).
    pub fn params(&self) -> Option<&Value> {
        self.0.get("params")
    }

    /// `result` member (successful responses).
    pub fn result(&self) -> Option<&Value> {
        self.0.get("result")
    }

    /// `error` member (failed responses). A `null` error counts as absent.
    pub fn error(&self) -> Option<&Value> {
        self.0.get("error").filter(|error| !error.is_null())
    }

    /// Returns `true` if the frame carries a non-null `error` member.
    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }

    /// `error.message`, falling back to the serialized `error` value.
    pub fn error_message(&self) -> Option<String> {
        let error = self.error()?;
        Some(match error.get("message").and_then(Value::as_str) {
            Some(msg) => msg.to_string(),
            None => error.to_string(),
        })
    }

    /// Borrow the raw JSON.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Unwrap into the raw JSON.
    pub fn into_value(self) -> Value {
        self.0
    }

    /// Convert an application error into `Err`, otherwise return `result`.
    ///
    /// A response without `result` yields `Value::Null`.
    pub fn into_result(self) -> Result<Value> {
        if let Some(message) = self.error_message() {
            let error = self.error().cloned().unwrap_or(Value::Null);
            return Err(RpcError::Remote { message, error });
        }
        match self.0 {
            Value::Object(mut map) => Ok(map.remove("result").unwrap_or(Value::Null)),
            _ => Ok(Value::Null),
        }
    }
}

impl From<Value> for Frame {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Serialize `message` and append the delimiter.
pub fn encode_frame<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>> {
    let mut buf = serde_json::to_vec(message)
        .map_err(|e| RpcError::InvalidRequest(format!("cannot serialize message: {e}")))?;
    buf.push(DELIMITER);
    Ok(buf)
}
