//! Conversation counterpart

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable remote identifier of a contact (e.g. a WhatsApp JID)
///
/// Tickets, message history and live events all refer to a conversation
/// through this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContactId(String);

impl ContactId {
    /// Wrap a remote identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContactId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The external party on the other end of a ticket's conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Remote identifier, the join key with the message stream
    #[serde(rename = "remoteJid")]
    pub id: ContactId,
    /// Display name, if the backend knows one
    #[serde(default)]
    pub name: Option<String>,
    /// Phone number as reported by the backend
    #[serde(default)]
    pub phone: Option<String>,
}

impl Contact {
    /// Create a contact with only its identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: ContactId::new(id),
            name: None,
            phone: None,
        }
    }

    /// Name to show in lists, falling back to phone then identifier
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.phone.as_deref())
            .unwrap_or_else(|| self.id.as_str())
    }
}
