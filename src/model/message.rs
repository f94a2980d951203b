//! Message structures and delivery status tracking

use crate::model::contact::ContactId;
use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Media carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaKind {
    /// Plain text
    #[default]
    Text,
    /// Image attachment
    Image,
    /// Voice note or audio file
    Audio,
    /// Video attachment
    Video,
    /// Any other file
    Document,
}

/// Delivery status as reported by the backend
///
/// Variants are declared in acknowledgement order, so a later variant is
/// always an upgrade over an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// Local send not yet confirmed
    Pending,
    /// Accepted by the backend
    #[default]
    Sent,
    /// Acknowledged by the WhatsApp server
    ServerAck,
    /// Delivered to the contact's device
    DeliveryAck,
    /// Read (or played) by the contact
    #[serde(alias = "PLAYED")]
    Read,
}

/// Coarse acknowledgement indicator used for display
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDisplay {
    /// Waiting for the backend
    Clock,
    /// Single check
    Single,
    /// Double check
    Double,
    /// Double check, highlighted
    Read,
}

impl DeliveryStatus {
    /// Collapse the server status into the indicator a chat bubble shows
    pub fn ack_display(self) -> AckDisplay {
        match self {
            DeliveryStatus::Pending => AckDisplay::Clock,
            DeliveryStatus::Sent | DeliveryStatus::ServerAck => AckDisplay::Single,
            DeliveryStatus::DeliveryAck => AckDisplay::Double,
            DeliveryStatus::Read => AckDisplay::Read,
        }
    }

    /// Glyph for terminal rendering
    pub fn status_indicator(self) -> &'static str {
        match self.ack_display() {
            AckDisplay::Clock => "⏱",
            AckDisplay::Single => "✓",
            AckDisplay::Double => "✓✓",
            AckDisplay::Read => "✓✓ (read)",
        }
    }
}

/// Message as sent by the backend, in REST history and `newMessage` events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    /// Server id; empty string is treated as absent
    #[serde(default, deserialize_with = "empty_string_as_none")]
    pub id: Option<String>,
    /// Text body or media caption
    #[serde(default, alias = "text")]
    pub content: String,
    /// Media kind
    #[serde(default, alias = "messageType")]
    pub media_type: MediaKind,
    /// Download URL for media messages
    #[serde(default)]
    pub media_url: Option<String>,
    /// Whether the tenant sent this message
    #[serde(default)]
    pub from_me: bool,
    /// Delivery status
    #[serde(default)]
    pub status: DeliveryStatus,
    /// Epoch milliseconds
    pub timestamp: i64,
}

fn empty_string_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|id| !id.trim().is_empty()))
}

/// Message in the unified client shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned id, absent for unconfirmed or echoed sends
    pub id: Option<String>,
    /// Client correlation id of an optimistic send
    pub correlation_id: Option<Uuid>,
    /// Conversation this message belongs to
    pub contact_id: ContactId,
    /// Text body or media caption
    pub content: String,
    /// Media kind
    pub media_kind: MediaKind,
    /// Download URL for media messages
    pub media_url: Option<String>,
    /// Sent by us (true) or received (false)
    pub from_me: bool,
    /// Delivery status
    pub status: DeliveryStatus,
    /// Epoch milliseconds (server clock, or client clock while optimistic)
    pub timestamp: i64,
}

impl Message {
    /// Map a backend payload into the unified shape
    pub fn from_payload(contact_id: ContactId, payload: NewMessagePayload) -> Self {
        Self {
            id: payload.id,
            correlation_id: None,
            contact_id,
            content: payload.content,
            media_kind: payload.media_type,
            media_url: payload.media_url,
            from_me: payload.from_me,
            status: payload.status,
            timestamp: payload.timestamp,
        }
    }

    /// Create a pending outbound text message stamped with the client clock
    pub fn optimistic(contact_id: ContactId, text: impl Into<String>) -> Self {
        Self {
            id: None,
            correlation_id: Some(Uuid::new_v4()),
            contact_id,
            content: text.into(),
            media_kind: MediaKind::Text,
            media_url: None,
            from_me: true,
            status: DeliveryStatus::Pending,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Whether this entry still awaits backend confirmation
    pub fn is_optimistic(&self) -> bool {
        self.correlation_id.is_some() && self.id.is_none()
    }

    /// Apply a status only if it moves the message forward
    ///
    /// Returns true when the status changed.
    pub fn upgrade_status(&mut self, status: DeliveryStatus) -> bool {
        if status > self.status {
            self.status = status;
            true
        } else {
            false
        }
    }
}
