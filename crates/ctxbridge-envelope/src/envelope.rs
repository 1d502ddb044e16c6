use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EnvelopeError, Result};
use crate::message::Message;

/// Value of the envelope `type` field.
pub const ENVELOPE_TYPE: &str = "mcp";

/// Which party an envelope travels towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    /// The opposite direction.
    pub fn reverse(self) -> Self {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }

    /// Wire string for this direction.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToServer => "client-to-server",
            Direction::ServerToClient => "server-to-client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope kind. Only protocol traffic exists today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    #[serde(rename = "mcp")]
    Mcp,
}

/// Lifecycle signals exchanged instead of protocol messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlSignal {
    /// Client asks whether a server is listening.
    CheckReady,
    /// Server announces it is listening.
    ServerReady,
    /// Server announces it has stopped.
    ServerStopped,
}

impl ControlSignal {
    /// Wire string for this signal.
    pub fn as_str(self) -> &'static str {
        match self {
            ControlSignal::CheckReady => "mcp-check-ready",
            ControlSignal::ServerReady => "mcp-server-ready",
            ControlSignal::ServerStopped => "mcp-server-stopped",
        }
    }
}

impl FromStr for ControlSignal {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mcp-check-ready" => Ok(ControlSignal::CheckReady),
            "mcp-server-ready" => Ok(ControlSignal::ServerReady),
            "mcp-server-stopped" => Ok(ControlSignal::ServerStopped),
            other => Err(EnvelopeError::UnknownControlSignal(other.to_string())),
        }
    }
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed envelope payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Control(ControlSignal),
    Message(Message),
}

/// Routing wrapper around a message or control signal.
///
/// The payload is kept as raw JSON until the receiver has checked channel and
/// direction; [`Envelope::parse_payload`] interprets it afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub direction: Direction,
    pub payload: Value,
}

impl Envelope {
    /// Wrap a protocol message.
    pub fn message(channel: impl Into<String>, direction: Direction, message: &Message) -> Self {
        Self {
            channel: channel.into(),
            kind: EnvelopeKind::Mcp,
            direction,
            payload: message.to_value(),
        }
    }

    /// Wrap a control signal.
    pub fn control(channel: impl Into<String>, direction: Direction, signal: ControlSignal) -> Self {
        Self {
            channel: channel.into(),
            kind: EnvelopeKind::Mcp,
            direction,
            payload: Value::String(signal.as_str().to_string()),
        }
    }

    /// Read an envelope from an arbitrary value.
    ///
    /// Returns `None` for anything that is not envelope-shaped; on a broadcast
    /// medium that is other traffic, not an error.
    pub fn from_value(value: &Value) -> Option<Self> {
        Envelope::deserialize(value).ok()
    }

    /// Serialize to a JSON value.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Interpret the payload as a control signal or a protocol message.
    pub fn parse_payload(&self) -> Result<Payload> {
        match &self.payload {
            Value::String(signal) => signal.parse().map(Payload::Control),
            other => Message::from_value(other.clone()).map(Payload::Message),
        }
    }
}
