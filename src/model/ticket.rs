//! Tickets and pipeline positions

use crate::model::{contact::Contact, message::MediaKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ticket identifier, unique per tenant
pub type TicketId = i64;

/// Kanban step identifier
pub type StepId = i64;

/// Ticket status; each status is one tab of the inbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    /// Waiting for an advisor to accept it
    Pending,
    /// Being worked
    Open,
    /// Closed as a sale
    Sold,
    /// Closed as lost
    Loss,
}

impl TicketStatus {
    /// All statuses in tab order
    pub const ALL: [TicketStatus; 4] = [
        TicketStatus::Pending,
        TicketStatus::Open,
        TicketStatus::Sold,
        TicketStatus::Loss,
    ];

    /// Wire and path representation
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::Pending => "PENDING",
            TicketStatus::Open => "OPEN",
            TicketStatus::Sold => "SOLD",
            TicketStatus::Loss => "LOSS",
        }
    }

    /// Whether the ticket's conversation is finished
    pub fn is_terminal(self) -> bool {
        matches!(self, TicketStatus::Sold | TicketStatus::Loss)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        TicketStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::Error::Config(format!("unknown ticket status '{}'", s)))
    }
}

/// A named, ordered pipeline stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KanbanStep {
    /// Step id
    pub id: StepId,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Position on the board
    #[serde(default)]
    pub position: Option<i32>,
}

impl KanbanStep {
    /// Reference to a step by id only
    pub fn with_id(id: StepId) -> Self {
        Self {
            id,
            name: None,
            position: None,
        }
    }
}

/// Denormalized preview of a ticket's latest message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessagePreview {
    /// Text body or caption
    #[serde(default)]
    pub content: String,
    /// Whether the tenant sent it
    #[serde(default)]
    pub from_me: bool,
    /// Epoch milliseconds
    pub timestamp: i64,
    /// Media kind
    #[serde(default)]
    pub media_type: MediaKind,
}

/// A reason a ticket can be closed as lost
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LossReason {
    /// Reason id
    pub id: i64,
    /// Human readable reason
    pub description: String,
}

/// One conversation thread with a contact, tracked through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    /// Ticket id
    pub id: TicketId,
    /// Current status
    pub status: TicketStatus,
    /// Owning company (tenant)
    #[serde(default)]
    pub company_id: Option<i64>,
    /// Responsible advisor
    #[serde(default)]
    pub user_id: Option<i64>,
    /// Current pipeline stage
    #[serde(default, rename = "KanbanStep")]
    pub kanban_step: Option<KanbanStep>,
    /// Counterpart of the conversation
    #[serde(default, rename = "Contact", alias = "contact")]
    pub contact: Option<Contact>,
    /// Latest message preview
    #[serde(default)]
    pub last_message: Option<LastMessagePreview>,
}

impl Ticket {
    /// Current step id, if the ticket sits on the board
    pub fn step_id(&self) -> Option<StepId> {
        self.kanban_step.as_ref().map(|step| step.id)
    }
}
