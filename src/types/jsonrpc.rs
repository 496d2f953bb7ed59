//! JSON-RPC 2.0 framing.

use crate::error::{Error, Result, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// JSON-RPC version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Numeric id
    Number(i64),
    /// String id
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

/// JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCRequest {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Request id
    pub id: RequestId,
    /// Method name
    pub method: String,
    /// Method parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JSONRPCRequest {
    /// Create a request.
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC notification (no id, no response).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCNotification {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Method name
    pub method: String,
    /// Method parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JSONRPCNotification {
    /// Create a notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
    /// Additional data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JSONRPCResponse {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Id of the request this answers; null for some parse errors
    #[serde(default)]
    pub id: Option<RequestId>,
    /// Successful result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JSONRPCError>,
}

impl JSONRPCResponse {
    /// Successful response.
    pub fn success(id: impl Into<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            result: Some(result),
            error: None,
        }
    }

    /// Error response. `id` is `None` when the request could not be read.
    pub fn error(id: Option<RequestId>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JSONRPCError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Convert into the result value, mapping a JSON-RPC error to [`Error::Protocol`].
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(Error::Protocol {
                code: error.code,
                message: error.message,
                data: error.data,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// A message read from a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Response to one of our requests
    Response(JSONRPCResponse),
    /// Server-initiated request
    Request(JSONRPCRequest),
    /// Server-initiated notification
    Notification(JSONRPCNotification),
}

impl IncomingMessage {
    /// Classify a decoded JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        if value.get("method").is_some() {
            if value.get("id").is_some() {
                Ok(IncomingMessage::Request(serde_json::from_value(value)?))
            } else {
                Ok(IncomingMessage::Notification(serde_json::from_value(value)?))
            }
        } else if value.get("result").is_some() || value.get("error").is_some() {
            Ok(IncomingMessage::Response(serde_json::from_value(value)?))
        } else {
            Err(TransportError::InvalidMessage("not a JSON-RPC message".to_string()).into())
        }
    }

    /// Decode one JSON-RPC message.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| TransportError::InvalidMessage(format!("Invalid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Decode a single message or a batch.
    pub fn parse_batch(bytes: &[u8]) -> Result<Vec<Self>> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| TransportError::InvalidMessage(format!("Invalid JSON: {}", e)))?;
        match value {
            Value::Array(items) => items.into_iter().map(Self::from_value).collect(),
            other => Ok(vec![Self::from_value(other)?]),
        }
    }

    /// The response, if this message answers the given request id.
    pub fn into_response_for(self, id: &RequestId) -> Option<JSONRPCResponse> {
        match self {
            IncomingMessage::Response(response) if response.id.as_ref() == Some(id) => {
                Some(response)
            },
            _ => None,
        }
    }
}
