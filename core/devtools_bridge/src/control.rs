//! Session control messages exchanged on the control data channel
//!
//! Messages are small JSON objects sent as TEXT on channel 0, each with a
//! `type` discriminator:
//!
//! ```text
//! server → client   {"type":"ICE_EXCHANGE"}
//! server → client   {"type":"UNKNOWN_RESPONSE","rawType":"<type>"}
//! client → server   {"type":"<any type the server does not know>"}
//! ```
//!
//! Clients may be newer than servers, so a server decodes any unrecognized
//! client `type` as [`ClientMessage::UnknownRequest`] and answers with
//! `UNKNOWN_RESPONSE`. A client has no safe default for an unknown server
//! message and decoding fails.

use serde_json::{Map, Value};

// ============================================================================
// Constants
// ============================================================================

const TYPE_FIELD: &str = "type";
const RAW_TYPE_FIELD: &str = "rawType";

pub const TYPE_ICE_EXCHANGE: &str = "ICE_EXCHANGE";
pub const TYPE_UNKNOWN_RESPONSE: &str = "UNKNOWN_RESPONSE";

// ============================================================================
// Messages
// ============================================================================

/// Messages a client sends to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// A request type this server does not understand
    UnknownRequest { raw_type: String },
}

/// Messages a server sends to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// The server has new ICE candidates; the client should pull them
    IceExchange,
    /// Reply to an [`ClientMessage::UnknownRequest`]
    UnknownResponse { raw_type: String },
}

/// Control message could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlMessageError {
    #[error("malformed control message: {0}")]
    Format(String),
    #[error("unknown control message type: {0}")]
    UnknownType(String),
}

impl ClientMessage {
    pub fn encode(&self) -> String {
        match self {
            ClientMessage::UnknownRequest { raw_type } => object(raw_type, None),
        }
    }

    pub fn decode(text: &str) -> Result<Self, ControlMessageError> {
        let (raw_type, _) = parse(text)?;
        Ok(ClientMessage::UnknownRequest { raw_type })
    }

    /// The reply a server sends for this request
    pub fn response(&self) -> ServerMessage {
        match self {
            ClientMessage::UnknownRequest { raw_type } => ServerMessage::UnknownResponse {
                raw_type: raw_type.clone(),
            },
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> String {
        match self {
            ServerMessage::IceExchange => object(TYPE_ICE_EXCHANGE, None),
            ServerMessage::UnknownResponse { raw_type } => {
                object(TYPE_UNKNOWN_RESPONSE, Some(raw_type))
            }
        }
    }

    pub fn decode(text: &str) -> Result<Self, ControlMessageError> {
        let (message_type, fields) = parse(text)?;
        match message_type.as_str() {
            TYPE_ICE_EXCHANGE => Ok(ServerMessage::IceExchange),
            TYPE_UNKNOWN_RESPONSE => {
                let raw_type = fields
                    .get(RAW_TYPE_FIELD)
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ControlMessageError::Format(format!("{} without {}", TYPE_UNKNOWN_RESPONSE, RAW_TYPE_FIELD))
                    })?;
                Ok(ServerMessage::UnknownResponse {
                    raw_type: raw_type.to_string(),
                })
            }
            _ => Err(ControlMessageError::UnknownType(message_type)),
        }
    }
}

// ============================================================================
// JSON helpers
// ============================================================================

fn object(message_type: &str, raw_type: Option<&str>) -> String {
    let mut fields = Map::new();
    fields.insert(TYPE_FIELD.to_string(), Value::from(message_type));
    if let Some(raw_type) = raw_type {
        fields.insert(RAW_TYPE_FIELD.to_string(), Value::from(raw_type));
    }
    Value::Object(fields).to_string()
}

fn parse(text: &str) -> Result<(String, Map<String, Value>), ControlMessageError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ControlMessageError::Format(e.to_string()))?;
    let Value::Object(fields) = value else {
        return Err(ControlMessageError::Format("not a JSON object".to_string()));
    };
    let message_type = fields
        .get(TYPE_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| ControlMessageError::Format("missing type".to_string()))?
        .to_string();
    Ok((message_type, fields))
}

// ============================================================================
// Tests
// ============================================================================
