//! Ticket store
//!
//! Client-side list of the tickets of one status tab. The list keeps the
//! backend's order; local mutations only touch the ticket they target.
//!
//! Every fetch is tagged with a generation number taken when it is issued.
//! A response whose generation is no longer current is dropped, so a slow
//! fetch for a previous tab can never overwrite the list of the current one.
//!
//! Optimistic moves and status changes are also kept as overlays until the
//! backend has answered and a fetch issued after that answer has landed.
//! A fetch that was in flight while the edit was pending may carry the old
//! server state; the overlay is re-applied on top of it.

use crate::api::{Backend, LossRequest};
use crate::model::{
    KanbanStep, LastMessagePreview, LossReason, StepId, Ticket, TicketId, TicketStatus,
};
use crate::notify::Notifier;
use crate::{Error, FetchOutcome, Result, cancellable};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local edit not yet reflected by a fetch
#[derive(Debug, Clone, Copy)]
struct Overlay<T> {
    value: T,
    /// Generation current when the backend accepted the edit
    settled_at: Option<u64>,
}

impl<T> Overlay<T> {
    fn pending(value: T) -> Self {
        Self {
            value,
            settled_at: None,
        }
    }

    /// Whether a fetch issued at `generation` may predate the edit
    fn applies_to(&self, generation: u64) -> bool {
        self.settled_at.is_none_or(|settled| generation <= settled)
    }
}

#[derive(Debug)]
struct TicketState {
    /// Tab the list belongs to
    status: TicketStatus,
    /// Tickets in server order
    tickets: Vec<Ticket>,
    /// Bumped whenever a fetch is issued
    generation: u64,
    /// Known pipeline steps, used to name a step after a move
    steps: Vec<KanbanStep>,
    /// Selected ticket id
    selected: Option<TicketId>,
    /// Step moves awaiting confirmation by a later fetch
    moves: HashMap<TicketId, Overlay<StepId>>,
    /// Status changes awaiting confirmation by a later fetch
    transitions: HashMap<TicketId, Overlay<TicketStatus>>,
}

impl TicketState {
    fn position(&self, ticket_id: TicketId) -> Option<usize> {
        self.tickets.iter().position(|t| t.id == ticket_id)
    }

    fn step(&self, step_id: StepId) -> KanbanStep {
        self.steps
            .iter()
            .find(|s| s.id == step_id)
            .cloned()
            .unwrap_or_else(|| KanbanStep::with_id(step_id))
    }

    fn set_step(&mut self, ticket_id: TicketId, step_id: StepId) {
        let step = self.step(step_id);
        if let Some(pos) = self.position(ticket_id) {
            self.tickets[pos].kanban_step = Some(step);
        }
    }

    /// Put a status change into effect on the current list
    fn set_status(&mut self, ticket_id: TicketId, status: TicketStatus) {
        let Some(pos) = self.position(ticket_id) else {
            return;
        };
        if self.status == status {
            self.tickets[pos].status = status;
        } else {
            self.tickets.remove(pos);
        }
    }

    /// Re-apply local edits on top of a list fetched at `generation`
    fn apply_overlays(&mut self, generation: u64) {
        self.moves.retain(|_, overlay| overlay.applies_to(generation));
        self.transitions.retain(|_, overlay| overlay.applies_to(generation));

        let moves: Vec<(TicketId, StepId)> = self.moves.iter().map(|(id, o)| (*id, o.value)).collect();
        for (ticket_id, step_id) in moves {
            self.set_step(ticket_id, step_id);
        }
        let transitions: Vec<(TicketId, TicketStatus)> =
            self.transitions.iter().map(|(id, o)| (*id, o.value)).collect();
        for (ticket_id, status) in transitions {
            self.set_status(ticket_id, status);
        }
    }
}

/// Ticket list of the active status tab
#[derive(Clone)]
pub struct TicketStore {
    backend: Arc<dyn Backend>,
    notifier: Notifier,
    cancel: CancellationToken,
    state: Arc<RwLock<TicketState>>,
    selection: Arc<watch::Sender<Option<Ticket>>>,
}

impl TicketStore {
    /// Create an empty store showing `status`
    pub fn new(
        backend: Arc<dyn Backend>,
        notifier: Notifier,
        cancel: CancellationToken,
        status: TicketStatus,
    ) -> Self {
        let (selection, _) = watch::channel(None);
        Self {
            backend,
            notifier,
            cancel,
            state: Arc::new(RwLock::new(TicketState {
                status,
                tickets: Vec::new(),
                generation: 0,
                steps: Vec::new(),
                selected: None,
                moves: HashMap::new(),
                transitions: HashMap::new(),
            })),
            selection: Arc::new(selection),
        }
    }

    /// Replace the list with the backend's tickets for `status`
    ///
    /// Switching tabs empties the list at once. On failure the list is kept
    /// and an error notice is emitted.
    pub async fn fetch_tickets(&self, status: TicketStatus) -> Result<FetchOutcome> {
        self.fetch(Some(status)).await
    }

    /// Re-fetch the active tab
    ///
    /// The tab is read under the same lock that issues the fetch, so a
    /// refresh never switches tabs.
    pub async fn refresh(&self) -> Result<FetchOutcome> {
        self.fetch(None).await
    }

    async fn fetch(&self, target: Option<TicketStatus>) -> Result<FetchOutcome> {
        let (status, generation) = {
            let mut state = self.state.write().await;
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            state.generation += 1;
            let status = target.unwrap_or(state.status);
            if state.status != status {
                debug!("Switching tab {} -> {}", state.status, status);
                state.status = status;
                state.tickets.clear();
            }
            (status, state.generation)
        };

        let result = cancellable(&self.cancel, self.backend.tickets(status)).await;

        let mut state = self.state.write().await;
        if state.generation != generation {
            debug!("Discarding superseded {} ticket list", status);
            return Ok(FetchOutcome::Superseded);
        }

        match result {
            Ok(tickets) => {
                info!("Fetched {} {} tickets", tickets.len(), status);
                state.tickets = tickets;
                state.apply_overlays(generation);
                self.publish_selection(&mut state);
                Ok(FetchOutcome::Applied)
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                self.notifier.error(format!("Could not load {} tickets: {}", status, e));
                Err(e)
            }
        }
    }

    /// Load the pipeline steps used to label moved tickets
    pub async fn fetch_steps(&self) -> Result<Vec<KanbanStep>> {
        match cancellable(&self.cancel, self.backend.kanban_steps()).await {
            Ok(steps) => {
                self.state.write().await.steps = steps.clone();
                Ok(steps)
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                self.notifier.error(format!("Could not load pipeline steps: {}", e));
                Err(e)
            }
        }
    }

    /// Reasons available when marking a ticket as lost
    pub async fn loss_reasons(&self) -> Result<Vec<LossReason>> {
        match cancellable(&self.cancel, self.backend.loss_reasons()).await {
            Err(e) if !matches!(e, Error::Cancelled) => {
                self.notifier.error(format!("Could not load loss reasons: {}", e));
                Err(e)
            }
            other => other,
        }
    }

    /// Select a ticket of the current list, or clear the selection
    pub async fn select_ticket(&self, ticket_id: Option<TicketId>) -> Result<Option<Ticket>> {
        let mut state = self.state.write().await;
        let ticket = match ticket_id {
            None => None,
            Some(id) => {
                let pos = state
                    .position(id)
                    .ok_or_else(|| Error::NotFound(format!("ticket {} is not in the {} tab", id, state.status)))?;
                Some(state.tickets[pos].clone())
            }
        };
        state.selected = ticket_id;
        self.selection.send_replace(ticket.clone());
        Ok(ticket)
    }

    /// Show a new last message on a ticket without refetching
    ///
    /// Returns false when the ticket is not in the list.
    pub async fn apply_last_message_preview(&self, ticket_id: TicketId, preview: LastMessagePreview) -> bool {
        let mut state = self.state.write().await;
        let Some(pos) = state.position(ticket_id) else {
            return false;
        };
        state.tickets[pos].last_message = Some(preview);
        self.publish_selection(&mut state);
        true
    }

    /// Move a ticket to another kanban step
    ///
    /// The step changes locally before the backend call and stays in place
    /// across fetches that race the call. If the call fails the previous step
    /// is restored.
    pub async fn move_ticket(&self, ticket_id: TicketId, step_id: StepId) -> Result<()> {
        let previous = {
            let mut state = self.state.write().await;
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(pos) = state.position(ticket_id) else {
                self.notifier.error(format!("Ticket #{} is no longer in this list", ticket_id));
                return Err(Error::NotFound(format!("ticket {}", ticket_id)));
            };
            if state.tickets[pos].step_id() == Some(step_id) {
                return Ok(());
            }
            let step = state.step(step_id);
            let previous = state.tickets[pos].kanban_step.replace(step);
            state.moves.insert(ticket_id, Overlay::pending(step_id));
            self.publish_selection(&mut state);
            previous
        };

        let result = cancellable(&self.cancel, self.backend.move_ticket(ticket_id, step_id)).await;

        let mut state = self.state.write().await;
        let ours = state.moves.get(&ticket_id).is_some_and(|o| o.value == step_id);
        match result {
            Ok(()) => {
                if ours {
                    let generation = state.generation;
                    if let Some(overlay) = state.moves.get_mut(&ticket_id) {
                        overlay.settled_at = Some(generation);
                    }
                    state.set_step(ticket_id, step_id);
                    self.publish_selection(&mut state);
                }
                info!("Ticket {} moved to step {}", ticket_id, step_id);
                Ok(())
            }
            Err(e) => {
                if ours {
                    state.moves.remove(&ticket_id);
                }
                if matches!(e, Error::Cancelled) {
                    return Err(e);
                }
                if let Some(pos) = state.position(ticket_id) {
                    if state.tickets[pos].step_id() == Some(step_id) {
                        state.tickets[pos].kanban_step = previous;
                        self.publish_selection(&mut state);
                    }
                }
                warn!("Reverted move of ticket {}: {}", ticket_id, e);
                self.notifier.error(format!("Could not move ticket #{}: {}", ticket_id, e));
                Err(e)
            }
        }
    }

    /// Change a ticket's status, e.g. accept a pending ticket or close it as sold
    pub async fn change_status(&self, ticket_id: TicketId, status: TicketStatus) -> Result<()> {
        let backend = self.backend.clone();
        self.transition(ticket_id, status, async move {
            backend.update_ticket_status(ticket_id, status).await
        })
        .await
    }

    /// Close a ticket as lost with a reason
    pub async fn mark_lost(&self, ticket_id: TicketId, loss_reason_id: i64, description: Option<String>) -> Result<()> {
        let backend = self.backend.clone();
        let request = LossRequest {
            ticket_id,
            loss_reason_id,
            description,
        };
        self.transition(ticket_id, TicketStatus::Loss, async move {
            backend.record_loss(&request).await
        })
        .await
    }

    /// Optimistic status change: the ticket leaves the tab, and comes back on failure
    async fn transition<F>(&self, ticket_id: TicketId, status: TicketStatus, call: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        let (index, original) = {
            let mut state = self.state.write().await;
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(pos) = state.position(ticket_id) else {
                self.notifier.error(format!("Ticket #{} is no longer in this list", ticket_id));
                return Err(Error::NotFound(format!("ticket {}", ticket_id)));
            };
            if state.tickets[pos].status == status {
                return Ok(());
            }
            let original = state.tickets[pos].clone();
            state.set_status(ticket_id, status);
            state.transitions.insert(ticket_id, Overlay::pending(status));
            self.clear_selection_if(&mut state, ticket_id, status);
            (pos, original)
        };

        let result = cancellable(&self.cancel, call).await;

        let mut state = self.state.write().await;
        let ours = state.transitions.get(&ticket_id).is_some_and(|o| o.value == status);
        match result {
            Ok(()) => {
                if ours {
                    let generation = state.generation;
                    if let Some(overlay) = state.transitions.get_mut(&ticket_id) {
                        overlay.settled_at = Some(generation);
                    }
                    state.set_status(ticket_id, status);
                    self.clear_selection_if(&mut state, ticket_id, status);
                    self.publish_selection(&mut state);
                }
                self.notifier.info(format!("Ticket #{} is now {}", ticket_id, status));
                Ok(())
            }
            Err(e) => {
                if ours {
                    state.transitions.remove(&ticket_id);
                }
                if matches!(e, Error::Cancelled) {
                    return Err(e);
                }
                match state.position(ticket_id) {
                    Some(pos) => state.tickets[pos].status = original.status,
                    None if state.status == original.status => {
                        let index = index.min(state.tickets.len());
                        state.tickets.insert(index, original);
                    }
                    None => {}
                }
                self.publish_selection(&mut state);
                warn!("Reverted status change of ticket {}: {}", ticket_id, e);
                self.notifier
                    .error(format!("Could not change ticket #{} to {}: {}", ticket_id, status, e));
                Err(e)
            }
        }
    }

    /// Drop the selection when the selected ticket leaves the tab
    fn clear_selection_if(&self, state: &mut TicketState, ticket_id: TicketId, status: TicketStatus) {
        if state.selected == Some(ticket_id) && state.status != status {
            state.selected = None;
            self.selection.send_replace(None);
        }
    }

    /// Push the current copy of the selected ticket to observers
    ///
    /// A selected ticket that is no longer in the list is deselected.
    fn publish_selection(&self, state: &mut TicketState) {
        let Some(selected) = state.selected else {
            return;
        };
        if let Some(ticket) = state.tickets.iter().find(|t| t.id == selected) {
            self.selection.send_if_modified(|current| {
                if current.as_ref() == Some(ticket) {
                    false
                } else {
                    *current = Some(ticket.clone());
                    true
                }
            });
            return;
        }
        debug!("Selected ticket {} left the {} tab", selected, state.status);
        state.selected = None;
        self.selection.send_replace(None);
    }

    /// Status tab the list belongs to
    pub async fn active_status(&self) -> TicketStatus {
        self.state.read().await.status
    }

    /// Snapshot of the list
    pub async fn tickets(&self) -> Vec<Ticket> {
        self.state.read().await.tickets.clone()
    }

    /// Snapshot of the list together with the tab it belongs to
    pub async fn view(&self) -> (TicketStatus, Vec<Ticket>) {
        let state = self.state.read().await;
        (state.status, state.tickets.clone())
    }

    /// Copy of one ticket
    pub async fn ticket(&self, ticket_id: TicketId) -> Option<Ticket> {
        let state = self.state.read().await;
        state.tickets.iter().find(|t| t.id == ticket_id).cloned()
    }

    /// Currently selected ticket
    pub fn selected(&self) -> Option<Ticket> {
        self.selection.borrow().clone()
    }

    /// Observe selection changes
    pub fn selection(&self) -> watch::Receiver<Option<Ticket>> {
        self.selection.subscribe()
    }
}
