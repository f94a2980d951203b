//! Message stream of the selected conversation
//!
//! Holds the messages of one contact, merging three sources:
//! - REST history (`load_history`), which replaces the stream
//! - live pushes (`append_incoming`), deduplicated by server id
//! - optimistic local sends (`append_optimistic`), later confirmed or rolled back
//!
//! Confirmed messages are kept in timestamp order. Optimistic entries are
//! stamped with the client clock and always appended at the end, so an
//! optimistic entry may carry a smaller timestamp than the entry before it
//! when the client clock lags the server's. That skew is left as is.

use crate::api::Backend;
use crate::model::{ContactId, DeliveryStatus, Message};
use crate::notify::Notifier;
use crate::{Error, FetchOutcome, Result, cancellable};
use chrono::{DateTime, NaiveDate, TimeZone};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Default)]
struct StreamState {
    /// Conversation currently displayed
    contact: Option<ContactId>,
    /// Messages, see module docs for ordering
    messages: Vec<Message>,
    /// Bumped on every load or switch; stale responses compare against it
    generation: u64,
    /// Optimistic entries that already absorbed their `messageSent` echo
    echoed: HashSet<Uuid>,
}

impl StreamState {
    fn position_of_id(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id.as_deref() == Some(id))
    }

    fn position_of_correlation(&self, correlation_id: Uuid) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.correlation_id == Some(correlation_id))
    }

    /// Insert after the last message not newer than `message`
    fn insert_ordered(&mut self, message: Message) {
        let idx = self
            .messages
            .iter()
            .rposition(|m| m.timestamp <= message.timestamp)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.messages.insert(idx, message);
    }
}

/// Ordered, deduplicated message history of the selected contact
#[derive(Clone)]
pub struct MessageStream {
    backend: Arc<dyn Backend>,
    notifier: Notifier,
    cancel: CancellationToken,
    state: Arc<RwLock<StreamState>>,
}

impl MessageStream {
    /// Create an empty stream
    pub fn new(backend: Arc<dyn Backend>, notifier: Notifier, cancel: CancellationToken) -> Self {
        Self {
            backend,
            notifier,
            cancel,
            state: Arc::new(RwLock::new(StreamState::default())),
        }
    }

    /// Replace the stream with the contact's history
    ///
    /// Every call is a fresh load. Switching to another contact empties the
    /// stream right away so messages of two conversations never mix. When the
    /// history arrives, in-flight optimistic sends and live messages missing
    /// from it are kept. A response for a load that was superseded meanwhile
    /// is discarded.
    pub async fn load_history(&self, contact_id: ContactId) -> Result<FetchOutcome> {
        let generation = {
            let mut state = self.state.write().await;
            state.generation += 1;
            if state.contact.as_ref() != Some(&contact_id) {
                state.contact = Some(contact_id.clone());
                state.messages.clear();
                state.echoed.clear();
            }
            state.generation
        };

        debug!("Loading history for {} (generation {})", contact_id, generation);
        let result = cancellable(&self.cancel, self.backend.messages(&contact_id)).await;

        let mut state = self.state.write().await;
        if state.generation != generation {
            debug!("Discarding superseded history for {}", contact_id);
            return Ok(FetchOutcome::Superseded);
        }

        let payloads = match result {
            Ok(payloads) => payloads,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                self.notifier
                    .error(format!("Could not load messages for {}: {}", contact_id, e));
                return Err(e);
            }
        };

        let mut history: Vec<Message> = payloads
            .into_iter()
            .map(|payload| Message::from_payload(contact_id.clone(), payload))
            .collect();
        history.sort_by_key(|m| m.timestamp);

        let known: HashSet<String> = history.iter().filter_map(|m| m.id.clone()).collect();
        let previous = std::mem::replace(&mut state.messages, history);
        let mut carried_optimistic = Vec::new();
        for message in previous {
            let missing_from_history = message.id.as_ref().is_some_and(|id| !known.contains(id));
            if missing_from_history {
                state.insert_ordered(message);
            } else if message.id.is_none() && message.status == DeliveryStatus::Pending {
                carried_optimistic.push(message);
            }
        }
        state.messages.extend(carried_optimistic);
        let live: HashSet<Uuid> = state.messages.iter().filter_map(|m| m.correlation_id).collect();
        state.echoed.retain(|id| live.contains(id));

        info!("Loaded {} messages for {}", state.messages.len(), contact_id);
        Ok(FetchOutcome::Applied)
    }

    /// Fold a live message into the stream
    ///
    /// Returns true when a new entry was added. A message whose server id is
    /// already present only upgrades that entry's delivery status. Messages
    /// without an id are appended, except a from-me echo matching an
    /// optimistic entry of ours, which is absorbed into it.
    pub async fn append_incoming(&self, message: Message) -> bool {
        let mut state = self.state.write().await;

        if state.contact.as_ref() != Some(&message.contact_id) {
            debug!("Ignoring message for inactive contact {}", message.contact_id);
            return false;
        }

        match message.id.as_deref() {
            Some(id) => {
                if let Some(idx) = state.position_of_id(id) {
                    state.messages[idx].upgrade_status(message.status);
                    debug!("Message {} already present", id);
                    return false;
                }
            }
            None if message.from_me => {
                let absorbed = state
                    .messages
                    .iter()
                    .filter(|m| m.content == message.content)
                    .filter_map(|m| m.correlation_id)
                    .find(|correlation_id| !state.echoed.contains(correlation_id));
                if let Some(correlation_id) = absorbed {
                    state.echoed.insert(correlation_id);
                    if let Some(idx) = state.position_of_correlation(correlation_id) {
                        state.messages[idx].upgrade_status(message.status);
                    }
                    debug!("Echo absorbed by optimistic message {}", correlation_id);
                    return false;
                }
            }
            None => {}
        }

        state.insert_ordered(message);
        true
    }

    /// Append a pending outbound text message to the selected conversation
    pub async fn append_optimistic(&self, text: &str) -> Result<Message> {
        let mut state = self.state.write().await;
        let contact_id = state
            .contact
            .clone()
            .ok_or_else(|| Error::NotFound("no conversation selected".to_string()))?;

        let message = Message::optimistic(contact_id, text);
        state.messages.push(message.clone());
        Ok(message)
    }

    /// Reconcile an optimistic entry with the backend's answer
    ///
    /// Returns false when the entry is gone (a history load superseded it).
    pub async fn confirm_optimistic(
        &self,
        correlation_id: Uuid,
        server_id: Option<String>,
        status: DeliveryStatus,
    ) -> bool {
        let mut state = self.state.write().await;
        let Some(idx) = state.position_of_correlation(correlation_id) else {
            debug!("Optimistic message {} no longer in stream", correlation_id);
            return false;
        };

        if let Some(server_id) = server_id {
            if let Some(existing) = state.position_of_id(&server_id).filter(|&i| i != idx) {
                // The live push won the race; keep the server copy only
                state.messages[existing].upgrade_status(status);
                state.messages.remove(idx);
                state.echoed.remove(&correlation_id);
                return true;
            }
            state.messages[idx].id = Some(server_id);
        }
        let entry = &mut state.messages[idx];
        entry.upgrade_status(status.max(DeliveryStatus::Sent));
        true
    }

    /// Remove an optimistic entry whose send failed
    pub async fn rollback_optimistic(&self, correlation_id: Uuid) -> bool {
        let mut state = self.state.write().await;
        match state.position_of_correlation(correlation_id) {
            Some(idx) => {
                state.messages.remove(idx);
                state.echoed.remove(&correlation_id);
                true
            }
            None => {
                warn!("Rollback of unknown optimistic message {}", correlation_id);
                false
            }
        }
    }

    /// Stop displaying any conversation
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.generation += 1;
        state.contact = None;
        state.messages.clear();
        state.echoed.clear();
    }

    /// Conversation currently displayed
    pub async fn contact(&self) -> Option<ContactId> {
        self.state.read().await.contact.clone()
    }

    /// Snapshot of the stream
    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }
}

/// Label of a day separator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayLabel {
    /// Same calendar day as "now"
    Today,
    /// The day before "now"
    Yesterday,
    /// Any other day
    Date(NaiveDate),
}

impl fmt::Display for DayLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DayLabel::Today => f.write_str("Today"),
            DayLabel::Yesterday => f.write_str("Yesterday"),
            DayLabel::Date(date) => write!(f, "{}", date.format("%d/%m/%Y")),
        }
    }
}

/// Consecutive run of messages sharing a calendar day
#[derive(Debug, Clone, PartialEq)]
pub struct DayGroup<'a> {
    /// Calendar day in the caller's timezone
    pub date: NaiveDate,
    /// Separator label relative to "now"
    pub label: DayLabel,
    /// Messages of that day, in stream order
    pub messages: Vec<&'a Message>,
}

/// Split messages into day groups, in the timezone of `now`
///
/// Pure function of its inputs. Messages with out-of-range timestamps are skipped.
pub fn group_by_day<'a, Tz: TimeZone>(messages: &'a [Message], now: &DateTime<Tz>) -> Vec<DayGroup<'a>> {
    let tz = now.timezone();
    let today = now.date_naive();
    let yesterday = today.pred_opt();

    let mut groups: Vec<DayGroup<'a>> = Vec::new();
    for message in messages {
        let Some(utc) = DateTime::<chrono::Utc>::from_timestamp_millis(message.timestamp) else {
            continue;
        };
        let date = utc.with_timezone(&tz).date_naive();

        match groups.last_mut() {
            Some(group) if group.date == date => group.messages.push(message),
            _ => {
                let label = if date == today {
                    DayLabel::Today
                } else if Some(date) == yesterday {
                    DayLabel::Yesterday
                } else {
                    DayLabel::Date(date)
                };
                groups.push(DayGroup {
                    date,
                    label,
                    messages: vec![message],
                });
            }
        }
    }
    groups
}
