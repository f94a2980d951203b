//! In-memory backend and fixtures shared by the scenario tests

use crate::api::{Backend, BoardColumn, LossRequest, SendReceipt, SendTextRequest};
use crate::model::{
    Contact, ContactId, DeliveryStatus, KanbanStep, LossReason, MediaKind, NewMessagePayload,
    StepId, Ticket, TicketId, TicketStatus,
};
use crate::notify::{Notice, NoticeLevel, NoticeReceiver};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

/// Scriptable backend; delays are meant for paused-clock tests
#[derive(Default)]
pub struct FakeBackend {
    pub tickets: Mutex<HashMap<TicketStatus, Vec<Ticket>>>,
    pub ticket_delays: Mutex<HashMap<TicketStatus, Duration>>,
    pub failing_tabs: Mutex<HashSet<TicketStatus>>,
    pub history: Mutex<HashMap<ContactId, Vec<NewMessagePayload>>>,
    pub history_delays: Mutex<HashMap<ContactId, Duration>>,
    pub steps: Mutex<Vec<KanbanStep>>,
    pub receipt: Mutex<SendReceipt>,
    pub fail_send: Mutex<bool>,
    pub fail_move: Mutex<bool>,
    pub move_delay: Mutex<Option<Duration>>,
    pub status_delay: Mutex<Option<Duration>>,
    pub fail_status: Mutex<bool>,
    pub calls: Mutex<Vec<String>>,
    pub sent: Mutex<Vec<SendTextRequest>>,
    pub losses: Mutex<Vec<LossRequest>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_tickets(&self, status: TicketStatus, tickets: Vec<Ticket>) {
        self.tickets.lock().unwrap().insert(status, tickets);
    }

    pub fn delay_tickets(&self, status: TicketStatus, delay: Duration) {
        self.ticket_delays.lock().unwrap().insert(status, delay);
    }

    pub fn set_history(&self, contact: &str, messages: Vec<NewMessagePayload>) {
        self.history.lock().unwrap().insert(ContactId::new(contact), messages);
    }

    pub fn delay_history(&self, contact: &str, delay: Duration) {
        self.history_delays.lock().unwrap().insert(ContactId::new(contact), delay);
    }

    pub fn calls_to(&self, prefix: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

fn failure(what: &str) -> Error {
    Error::Api {
        status: 500,
        message: format!("{} failed", what),
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn tickets(&self, status: TicketStatus) -> Result<Vec<Ticket>> {
        self.record(format!("tickets {}", status));
        let delay = self.ticket_delays.lock().unwrap().get(&status).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_tabs.lock().unwrap().contains(&status) {
            return Err(failure("tickets"));
        }
        Ok(self.tickets.lock().unwrap().get(&status).cloned().unwrap_or_default())
    }

    async fn messages(&self, contact_id: &ContactId) -> Result<Vec<NewMessagePayload>> {
        self.record(format!("messages {}", contact_id));
        let delay = self.history_delays.lock().unwrap().get(contact_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.history.lock().unwrap().get(contact_id).cloned().unwrap_or_default())
    }

    async fn send_text(&self, request: &SendTextRequest) -> Result<SendReceipt> {
        self.record(format!("send {}", request.remote_jid));
        if *self.fail_send.lock().unwrap() {
            return Err(failure("send"));
        }
        self.sent.lock().unwrap().push(request.clone());
        Ok(self.receipt.lock().unwrap().clone())
    }

    async fn move_ticket(&self, ticket_id: TicketId, step_id: StepId) -> Result<()> {
        self.record(format!("move {} {}", ticket_id, step_id));
        let delay = *self.move_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_move.lock().unwrap() {
            return Err(failure("move"));
        }
        Ok(())
    }

    async fn update_ticket_status(&self, ticket_id: TicketId, status: TicketStatus) -> Result<()> {
        self.record(format!("status {} {}", ticket_id, status));
        let delay = *self.status_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_status.lock().unwrap() {
            return Err(failure("status"));
        }
        Ok(())
    }

    async fn record_loss(&self, request: &LossRequest) -> Result<()> {
        self.record(format!("loss {}", request.ticket_id));
        if *self.fail_status.lock().unwrap() {
            return Err(failure("loss"));
        }
        self.losses.lock().unwrap().push(request.clone());
        Ok(())
    }

    async fn kanban_steps(&self) -> Result<Vec<KanbanStep>> {
        self.record("steps".to_string());
        Ok(self.steps.lock().unwrap().clone())
    }

    async fn kanban_board(&self) -> Result<Vec<BoardColumn>> {
        Ok(Vec::new())
    }

    async fn loss_reasons(&self) -> Result<Vec<LossReason>> {
        Ok(vec![LossReason {
            id: 1,
            description: "Price".to_string(),
        }])
    }
}

pub fn ticket(id: TicketId, status: TicketStatus, step: StepId, contact: &str) -> Ticket {
    Ticket {
        id,
        status,
        company_id: Some(1),
        user_id: None,
        kanban_step: Some(KanbanStep::with_id(step)),
        contact: Some(Contact::new(contact)),
        last_message: None,
    }
}

pub fn step(id: StepId, name: &str) -> KanbanStep {
    KanbanStep {
        id,
        name: Some(name.to_string()),
        position: None,
    }
}

pub fn payload(id: &str, content: &str, timestamp: i64) -> NewMessagePayload {
    NewMessagePayload {
        id: Some(id.to_string()),
        content: content.to_string(),
        media_type: MediaKind::Text,
        media_url: None,
        from_me: false,
        status: DeliveryStatus::Sent,
        timestamp,
    }
}

pub fn drain(rx: &mut NoticeReceiver) -> Vec<Notice> {
    let mut notices = Vec::new();
    while let Ok(notice) = rx.try_recv() {
        notices.push(notice);
    }
    notices
}

pub fn errors(notices: &[Notice]) -> usize {
    notices.iter().filter(|n| n.level == NoticeLevel::Error).count()
}
