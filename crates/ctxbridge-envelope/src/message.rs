use std::fmt;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{EnvelopeError, Result};

/// JSON-RPC protocol version carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Request identifier: a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number).ok_or_else(|| {
                EnvelopeError::InvalidMessage(format!("id must be an integer, got {n}"))
            }),
            Value::String(s) => Ok(RequestId::String(s)),
            other => Err(EnvelopeError::InvalidMessage(format!(
                "id must be a number or string, got {other}"
            ))),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s:?}"),
        }
    }
}

/// A call that expects exactly one response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A fire-and-forget call. Never answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Exactly one of `result` or `error`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(RpcError),
}

/// The answer to a [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub jsonrpc: String,
    pub id: RequestId,
    pub outcome: Outcome,
}

impl Response {
    /// The result value, if this is a success response.
    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Result(value) => Some(value),
            Outcome::Error(_) => None,
        }
    }

    /// The error object, if this is an error response.
    pub fn error(&self) -> Option<&RpcError> {
        match &self.outcome {
            Outcome::Result(_) => None,
            Outcome::Error(err) => Some(err),
        }
    }
}

impl Serialize for Response {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("jsonrpc", &self.jsonrpc)?;
        map.serialize_entry("id", &self.id)?;
        match &self.outcome {
            Outcome::Result(value) => map.serialize_entry("result", value)?,
            Outcome::Error(err) => map.serialize_entry("error", err)?,
        }
        map.end()
    }
}

/// A JSON-RPC message: request, notification, or response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    /// Build a request.
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request(Request {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    /// Build a notification.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification(Notification {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        })
    }

    /// Build a success response.
    pub fn result(id: impl Into<RequestId>, result: Value) -> Self {
        Message::Response(Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            outcome: Outcome::Result(result),
        })
    }

    /// Build an error response.
    pub fn error(id: impl Into<RequestId>, error: RpcError) -> Self {
        Message::Response(Response {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            outcome: Outcome::Error(error),
        })
    }

    /// Classify and parse a JSON value.
    ///
    /// `method` + `id` is a request, `method` alone a notification, and `id`
    /// with exactly one of `result`/`error` a response.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(EnvelopeError::InvalidMessage(
                "message must be a JSON object".to_string(),
            ));
        };

        let jsonrpc = match map.remove("jsonrpc") {
            Some(Value::String(version)) if version == JSONRPC_VERSION => version,
            Some(other) => {
                return Err(EnvelopeError::InvalidMessage(format!(
                    "unsupported jsonrpc version {other}"
                )))
            }
            None => {
                return Err(EnvelopeError::InvalidMessage(
                    "missing jsonrpc version".to_string(),
                ))
            }
        };

        let id = map.remove("id").map(RequestId::from_value).transpose()?;

        match map.remove("method") {
            Some(Value::String(method)) => {
                let params = map.remove("params");
                Ok(match id {
                    Some(id) => Message::Request(Request {
                        jsonrpc,
                        id,
                        method,
                        params,
                    }),
                    None => Message::Notification(Notification {
                        jsonrpc,
                        method,
                        params,
                    }),
                })
            }
            Some(other) => Err(EnvelopeError::InvalidMessage(format!(
                "method must be a string, got {other}"
            ))),
            None => {
                let id = id.ok_or_else(|| {
                    EnvelopeError::InvalidMessage(
                        "message has neither method nor id".to_string(),
                    )
                })?;
                let outcome = take_outcome(&mut map)?;
                Ok(Message::Response(Response {
                    jsonrpc,
                    id,
                    outcome,
                }))
            }
        }
    }

    /// Serialize to a JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// The id of a request or response.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(req) => Some(&req.id),
            Message::Response(resp) => Some(&resp.id),
            Message::Notification(_) => None,
        }
    }

    /// The method of a request or notification.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(req) => Some(&req.method),
            Message::Notification(note) => Some(&note.method),
            Message::Response(_) => None,
        }
    }

    /// Returns true for requests (method and id).
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    /// Returns true for responses.
    pub fn is_response(&self) -> bool {
        matches!(self, Message::Response(_))
    }
}

fn take_outcome(map: &mut Map<String, Value>) -> Result<Outcome> {
    match (map.remove("result"), map.remove("error")) {
        (Some(result), None) => Ok(Outcome::Result(result)),
        (None, Some(error)) => Ok(Outcome::Error(serde_json::from_value(error)?)),
        _ => Err(EnvelopeError::InvalidMessage(
            "response must carry exactly one of result or error".to_string(),
        )),
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Message::from_value(value).map_err(D::Error::custom)
    }
}
