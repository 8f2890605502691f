//! Asynchronous messages exchanged between ports.

use crate::chunk::TypedChunk;
use crate::label::Label;
use serde_json::{Map, Value};

/// A message delivered outside the sample stream.
#[derive(Debug, Clone)]
pub enum Message {
    /// An arbitrary value.
    Value(Value),
    /// A buffer with its labels and metadata.
    Packet(Packet),
}

impl Message {
    /// The packet, when this message carries one.
    pub fn as_packet(&self) -> Option<&Packet> {
        match self {
            Message::Packet(packet) => Some(packet),
            Message::Value(_) => None,
        }
    }

    /// The value, when this message carries one.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Message::Value(value) => Some(value),
            Message::Packet(_) => None,
        }
    }
}

impl From<Value> for Message {
    fn from(value: Value) -> Self {
        Message::Value(value)
    }
}

impl From<Packet> for Message {
    fn from(packet: Packet) -> Self {
        Message::Packet(packet)
    }
}

/// Payload buffer plus labels indexed in payload elements.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    /// Payload.
    pub payload: TypedChunk,
    /// Labels, indexed relative to the payload start.
    pub labels: Vec<Label>,
    /// Free-form metadata.
    pub metadata: Map<String, Value>,
}
