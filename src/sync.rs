//! Reconciliation and session lifecycle
//!
//! [`Reconciler`] is the only consumer of live events: socket handlers just
//! forward validated events into its channel, and it folds them into the
//! ticket store and message stream. [`Session`] is the explicitly constructed
//! context of one authenticated session. It wires backend, transport and
//! stores together and runs the user actions that span more than one store.

use crate::api::{Backend, RestClient, SendTextRequest};
use crate::config::Settings;
use crate::messages::MessageStream;
use crate::model::{
    DeliveryStatus, LastMessagePreview, MediaKind, Message, StepId, Ticket, TicketId, TicketStatus,
};
use crate::notify::{NoticeReceiver, Notifier};
use crate::protocol::{EVENT_MESSAGE_SENT, EVENT_NEW_MESSAGE, ServerEvent};
use crate::tickets::TicketStore;
use crate::transport::Transport;
use crate::{Error, FetchOutcome, Result, cancellable};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Folds live events into the stores
#[derive(Clone)]
pub struct Reconciler {
    tickets: TicketStore,
    messages: MessageStream,
    debounce: Duration,
}

impl Reconciler {
    /// Create a reconciler over the given stores
    pub fn new(tickets: TicketStore, messages: MessageStream, debounce: Duration) -> Self {
        Self {
            tickets,
            messages,
            debounce,
        }
    }

    /// Apply one event to the message stream
    ///
    /// Returns true when the ticket list should be refreshed.
    pub async fn apply(&self, event: ServerEvent) -> bool {
        match event {
            ServerEvent::NewMessage(event) => {
                let message = Message::from_payload(event.contact_id, event.message);
                if self.messages.append_incoming(message).await {
                    debug!("Live message appended to the open conversation");
                }
                true
            }
            ServerEvent::MessageSent(event) => {
                let echo = Message {
                    id: None,
                    correlation_id: None,
                    contact_id: event.contact_id,
                    content: event.message,
                    media_kind: MediaKind::Text,
                    media_url: None,
                    from_me: true,
                    status: event.status,
                    timestamp: event.timestamp.unwrap_or_else(|| Utc::now().timestamp_millis()),
                };
                self.messages.append_incoming(echo).await;
                true
            }
            ServerEvent::Unknown { name, .. } => {
                debug!("Ignoring unhandled event {}", name);
                false
            }
        }
    }

    /// Consume events until the channel closes or `cancel` fires
    ///
    /// Ticket refreshes are debounced: every relevant event pushes the
    /// deadline back, and one refresh of the active tab runs once events
    /// have been quiet for the debounce window.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<ServerEvent>, cancel: CancellationToken) {
        let mut refresh_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        if self.apply(event).await {
                            refresh_at = Some(Instant::now() + self.debounce);
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(refresh_at.unwrap_or_else(Instant::now)), if refresh_at.is_some() => {
                    refresh_at = None;
                    let tickets = self.tickets.clone();
                    tokio::spawn(async move {
                        if let Err(e) = tickets.refresh().await {
                            debug!("Debounced refresh failed: {}", e);
                        }
                    });
                }
            }
        }

        debug!("Reconciler stopped");
    }
}

/// Everything one authenticated session needs, with an explicit lifecycle
///
/// Build it with [`Session::start`] (or [`Session::open`] to inject the
/// backend) when the user logs in and call [`Session::shutdown`] on logout.
pub struct Session {
    backend: Arc<dyn Backend>,
    transport: Option<Transport>,
    tickets: TicketStore,
    messages: MessageStream,
    notifier: Notifier,
    events: mpsc::UnboundedSender<ServerEvent>,
    cancel: CancellationToken,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Start a session against the backend described by `settings`
    pub async fn start(settings: Settings, status: TicketStatus) -> Result<(Self, NoticeReceiver)> {
        settings.validate()?;
        let backend: Arc<dyn Backend> = Arc::new(RestClient::new(&settings)?);
        let transport = Transport::from_settings(&settings);
        Self::open(&settings, backend, Some(transport), status).await
    }

    /// Start a session with an explicit backend and optional transport
    ///
    /// Without a transport the session only reacts to events passed to
    /// [`Session::dispatch_event`].
    pub async fn open(
        settings: &Settings,
        backend: Arc<dyn Backend>,
        transport: Option<Transport>,
        status: TicketStatus,
    ) -> Result<(Self, NoticeReceiver)> {
        let (notifier, notices) = Notifier::channel();
        let cancel = CancellationToken::new();
        let tickets = TicketStore::new(backend.clone(), notifier.clone(), cancel.clone(), status);
        let messages = MessageStream::new(backend.clone(), notifier.clone(), cancel.clone());

        let (events, events_rx) = mpsc::unbounded_channel();
        let reconciler = Reconciler::new(tickets.clone(), messages.clone(), settings.refresh_debounce());
        let handle = tokio::spawn(reconciler.run(events_rx, cancel.clone()));

        if let Some(transport) = &transport {
            for name in [EVENT_NEW_MESSAGE, EVENT_MESSAGE_SENT] {
                let tx = events.clone();
                transport
                    .on(name, move |event| {
                        let _ = tx.send(event);
                    })
                    .await;
            }
            if let Err(e) = transport.connect(&settings.tenant_id).await {
                cancel.cancel();
                return Err(e);
            }
        }

        let session = Self {
            backend,
            transport,
            tickets,
            messages,
            notifier,
            events,
            cancel,
            reconciler: Mutex::new(Some(handle)),
        };

        // Failures are already surfaced as notices; the session stays usable
        if let Err(e) = session.tickets.fetch_steps().await {
            warn!("Pipeline steps unavailable: {}", e);
        }
        if let Err(e) = session.tickets.fetch_tickets(status).await {
            warn!("Initial ticket fetch failed: {}", e);
        }

        info!("Session started on the {} tab", status);
        Ok((session, notices))
    }

    /// Feed an event to the reconciler as if it came from the socket
    pub fn dispatch_event(&self, event: ServerEvent) {
        if self.events.send(event).is_err() {
            warn!("Reconciler is not running, event dropped");
        }
    }

    /// Switch the inbox to another status tab
    pub async fn switch_tab(&self, status: TicketStatus) -> Result<FetchOutcome> {
        self.tickets.select_ticket(None).await?;
        self.messages.clear().await;
        self.tickets.fetch_tickets(status).await
    }

    /// Select a ticket and load its conversation, or clear the selection
    pub async fn select_ticket(&self, ticket_id: Option<TicketId>) -> Result<Option<Ticket>> {
        let ticket = match self.tickets.select_ticket(ticket_id).await {
            Ok(ticket) => ticket,
            Err(e) => {
                self.notifier.error(format!("Could not open ticket: {}", e));
                return Err(e);
            }
        };

        match ticket.as_ref().and_then(|t| t.contact.as_ref()) {
            Some(contact) => {
                self.messages.load_history(contact.id.clone()).await?;
            }
            None => {
                if let Some(ticket) = &ticket {
                    warn!("Ticket {} has no contact, nothing to load", ticket.id);
                }
                self.messages.clear().await;
            }
        }
        Ok(ticket)
    }

    /// Send a text message to the selected ticket's contact
    ///
    /// The message shows up at once as pending. It is confirmed with the
    /// backend's receipt, or removed again if the send fails.
    pub async fn send_message(&self, text: &str, quoted_message_id: Option<String>) -> Result<Message> {
        let Some(ticket) = self.tickets.selected() else {
            self.notifier.error("Select a conversation before sending");
            return Err(Error::NotFound("no ticket selected".to_string()));
        };
        let Some(contact) = ticket.contact.clone() else {
            self.notifier.error(format!("Ticket #{} has no contact", ticket.id));
            return Err(Error::NotFound(format!("contact of ticket {}", ticket.id)));
        };

        let pending = self.messages.append_optimistic(text).await?;
        let Some(correlation_id) = pending.correlation_id else {
            return Err(Error::NotFound("optimistic message without correlation id".to_string()));
        };

        let request = SendTextRequest {
            remote_jid: contact.id.clone(),
            text: text.to_string(),
            quoted_message_id,
        };

        match cancellable(&self.cancel, self.backend.send_text(&request)).await {
            Ok(receipt) => {
                let status = receipt.status.unwrap_or(DeliveryStatus::Sent);
                self.messages
                    .confirm_optimistic(correlation_id, receipt.id.clone(), status)
                    .await;
                self.tickets
                    .apply_last_message_preview(
                        ticket.id,
                        LastMessagePreview {
                            content: text.to_string(),
                            from_me: true,
                            timestamp: receipt.timestamp.unwrap_or(pending.timestamp),
                            media_type: MediaKind::Text,
                        },
                    )
                    .await;
                info!("Message sent to {}", contact.id);

                let mut sent = pending;
                sent.id = receipt.id;
                sent.upgrade_status(status);
                Ok(sent)
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                self.messages.rollback_optimistic(correlation_id).await;
                self.notifier
                    .error(format!("Message to {} was not sent: {}", contact.display_name(), e));
                Err(e)
            }
        }
    }

    /// Move a ticket to another kanban step
    pub async fn move_ticket(&self, ticket_id: TicketId, step_id: StepId) -> Result<()> {
        self.tickets.move_ticket(ticket_id, step_id).await
    }

    /// Change a ticket's status
    pub async fn change_status(&self, ticket_id: TicketId, status: TicketStatus) -> Result<()> {
        self.tickets.change_status(ticket_id, status).await
    }

    /// Close a ticket as lost
    pub async fn mark_lost(&self, ticket_id: TicketId, loss_reason_id: i64, description: Option<String>) -> Result<()> {
        self.tickets.mark_lost(ticket_id, loss_reason_id, description).await
    }

    /// Ticket store of this session
    pub fn tickets(&self) -> &TicketStore {
        &self.tickets
    }

    /// Message stream of this session
    pub fn messages(&self) -> &MessageStream {
        &self.messages
    }

    /// Backend this session talks to
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Whether the real-time channel is joined
    pub fn is_live(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_connected)
    }

    /// End the session: abandon in-flight calls, stop the reconciler, close the socket
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(transport) = &self.transport {
            transport.disconnect().await;
        }
        let handle = self.reconciler.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Reconciler task failed: {}", e);
            }
        }
        info!("Session closed");
    }
}
