//! Domain model shared by the stores, the REST client and the socket codec
//!
//! - `contact` - Conversation counterpart and its join key
//! - `message` - Unified message shape and delivery status
//! - `ticket` - Tickets, statuses, kanban steps and loss reasons

pub mod contact;
pub mod message;
pub mod ticket;

pub use contact::{Contact, ContactId};
pub use message::{AckDisplay, DeliveryStatus, MediaKind, Message, NewMessagePayload};
pub use ticket::{
    KanbanStep, LastMessagePreview, LossReason, StepId, Ticket, TicketId, TicketStatus,
};
