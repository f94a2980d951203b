//! Real-time channel protocol
//!
//! The backend fans out events over Socket.IO v4 on a plain WebSocket
//! transport. This module is the single validation boundary for that channel:
//! - Engine.IO framing (open handshake, ping/pong, close, message)
//! - Socket.IO packets carried in Engine.IO messages (connect, event, ...)
//! - Typed decoding of the event payloads the client consumes
//!
//! Anything that fails to decode here is rejected with `Error::Protocol` and
//! never reaches the stores.

use crate::model::{ContactId, DeliveryStatus, NewMessagePayload, TicketId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine.IO protocol revision spoken by the client
pub const ENGINE_IO_VERSION: u8 = 4;

/// Inbound event: a message arrived in a conversation
pub const EVENT_NEW_MESSAGE: &str = "newMessage";
/// Inbound event: a message was sent from the tenant's number
pub const EVENT_MESSAGE_SENT: &str = "messageSent";
/// Outbound event: join the tenant's room
pub const EVENT_JOIN: &str = "join";

/// Build the WebSocket endpoint for a Socket.IO server base URL
///
/// `http(s)` schemes are mapped to `ws(s)`.
pub fn socket_endpoint(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/socket.io/?EIO={}&transport=websocket", base, ENGINE_IO_VERSION)
}

/// Engine.IO open handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Engine.IO session id
    pub sid: String,
    /// Server ping interval in milliseconds
    pub ping_interval: u64,
    /// How long the server waits for a pong, in milliseconds
    pub ping_timeout: u64,
}

/// Socket.IO packet, carried inside an Engine.IO message
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    /// Namespace connect (request from client, acknowledgement from server)
    Connect(Option<Value>),
    /// Namespace disconnect
    Disconnect,
    /// Named event with its payload (`Null` when none was sent)
    Event {
        /// Event name
        name: String,
        /// First argument of the event
        payload: Value,
    },
    /// Server refused the namespace connect
    ConnectError(Value),
}

/// Engine.IO packet as exchanged over one WebSocket text frame
#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    /// Session opened
    Open(Handshake),
    /// Session closed by the peer
    Close,
    /// Heartbeat from the server
    Ping,
    /// Heartbeat answer
    Pong,
    /// Socket.IO payload
    Message(SocketPacket),
    /// Filler packet, ignored
    Noop,
}

impl EnginePacket {
    /// Decode one text frame
    pub fn decode(frame: &str) -> Result<Self> {
        let mut chars = frame.chars();
        let kind = chars
            .next()
            .ok_or_else(|| Error::Protocol("empty frame".to_string()))?;
        let body = chars.as_str();

        match kind {
            '0' => {
                let handshake: Handshake = serde_json::from_str(body)
                    .map_err(|e| Error::Protocol(format!("invalid open handshake: {}", e)))?;
                Ok(EnginePacket::Open(handshake))
            }
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping),
            '3' => Ok(EnginePacket::Pong),
            '4' => Ok(EnginePacket::Message(SocketPacket::decode(body)?)),
            '6' => Ok(EnginePacket::Noop),
            other => Err(Error::Protocol(format!("unsupported engine packet type '{}'", other))),
        }
    }

    /// Encode as a text frame
    pub fn encode(&self) -> Result<String> {
        Ok(match self {
            EnginePacket::Open(handshake) => format!("0{}", serde_json::to_string(handshake)?),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping => "2".to_string(),
            EnginePacket::Pong => "3".to_string(),
            EnginePacket::Message(packet) => format!("4{}", packet.encode()?),
            EnginePacket::Noop => "6".to_string(),
        })
    }
}

impl SocketPacket {
    fn decode(body: &str) -> Result<Self> {
        let mut chars = body.chars();
        let kind = chars
            .next()
            .ok_or_else(|| Error::Protocol("empty socket packet".to_string()))?;
        let rest = skip_namespace(chars.as_str());

        match kind {
            '0' => {
                if rest.is_empty() {
                    Ok(SocketPacket::Connect(None))
                } else {
                    Ok(SocketPacket::Connect(Some(serde_json::from_str(rest)?)))
                }
            }
            '1' => Ok(SocketPacket::Disconnect),
            '2' => {
                // Events may carry an ack id before the argument array
                let args = rest.trim_start_matches(|c: char| c.is_ascii_digit());
                let mut values: Vec<Value> = serde_json::from_str(args)
                    .map_err(|e| Error::Protocol(format!("invalid event arguments: {}", e)))?;
                if values.is_empty() {
                    return Err(Error::Protocol("event without a name".to_string()));
                }
                let name = match values.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(Error::Protocol(format!("event name is not a string: {}", other)));
                    }
                };
                let payload = if values.is_empty() { Value::Null } else { values.remove(0) };
                Ok(SocketPacket::Event { name, payload })
            }
            '4' => {
                let value = if rest.is_empty() { Value::Null } else { serde_json::from_str(rest)? };
                Ok(SocketPacket::ConnectError(value))
            }
            other => Err(Error::Protocol(format!("unsupported socket packet type '{}'", other))),
        }
    }

    fn encode(&self) -> Result<String> {
        Ok(match self {
            SocketPacket::Connect(None) => "0".to_string(),
            SocketPacket::Connect(Some(auth)) => format!("0{}", serde_json::to_string(auth)?),
            SocketPacket::Disconnect => "1".to_string(),
            SocketPacket::Event { name, payload } => {
                let args = if payload.is_null() {
                    Value::Array(vec![Value::String(name.clone())])
                } else {
                    Value::Array(vec![Value::String(name.clone()), payload.clone()])
                };
                format!("2{}", serde_json::to_string(&args)?)
            }
            SocketPacket::ConnectError(value) => format!("4{}", serde_json::to_string(value)?),
        })
    }
}

/// Strip a non-default namespace prefix ("/admin,") from a packet body
fn skip_namespace(rest: &str) -> &str {
    if rest.starts_with('/') {
        match rest.find(',') {
            Some(idx) => &rest[idx + 1..],
            None => "",
        }
    } else {
        rest
    }
}

/// Frame that joins the tenant's room
pub fn join_frame(tenant_id: &str) -> Result<String> {
    EnginePacket::Message(SocketPacket::Event {
        name: EVENT_JOIN.to_string(),
        payload: Value::String(tenant_id.to_string()),
    })
    .encode()
}

/// Payload of a `newMessage` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageEvent {
    /// Conversation the message belongs to
    pub contact_id: ContactId,
    /// Ticket the backend attached the message to, when known
    #[serde(default)]
    pub ticket_id: Option<TicketId>,
    /// The message itself
    pub message: NewMessagePayload,
}

/// Payload of a `messageSent` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSentEvent {
    /// Conversation the message was sent to
    pub contact_id: ContactId,
    /// Text that was sent
    pub message: String,
    /// Delivery status at emission time
    #[serde(default)]
    pub status: DeliveryStatus,
    /// Epoch milliseconds, when the backend provides it
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Inbound event, validated at the transport boundary
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// `newMessage`
    NewMessage(NewMessageEvent),
    /// `messageSent`
    MessageSent(MessageSentEvent),
    /// Any event name this client does not model yet
    Unknown {
        /// Event name
        name: String,
        /// Raw payload
        payload: Value,
    },
}

impl ServerEvent {
    /// Decode a named event payload into its typed form
    pub fn decode(name: &str, payload: Value) -> Result<Self> {
        match name {
            EVENT_NEW_MESSAGE => serde_json::from_value(payload)
                .map(ServerEvent::NewMessage)
                .map_err(|e| Error::Protocol(format!("invalid {} payload: {}", name, e))),
            EVENT_MESSAGE_SENT => serde_json::from_value(payload)
                .map(ServerEvent::MessageSent)
                .map_err(|e| Error::Protocol(format!("invalid {} payload: {}", name, e))),
            _ => Ok(ServerEvent::Unknown {
                name: name.to_string(),
                payload,
            }),
        }
    }

    /// Event name as sent on the wire
    pub fn name(&self) -> &str {
        match self {
            ServerEvent::NewMessage(_) => EVENT_NEW_MESSAGE,
            ServerEvent::MessageSent(_) => EVENT_MESSAGE_SENT,
            ServerEvent::Unknown { name, .. } => name,
        }
    }

    /// Conversation the event concerns, for modelled events
    pub fn contact_id(&self) -> Option<&ContactId> {
        match self {
            ServerEvent::NewMessage(event) => Some(&event.contact_id),
            ServerEvent::MessageSent(event) => Some(&event.contact_id),
            ServerEvent::Unknown { .. } => None,
        }
    }
}
