//! Backend REST client
//!
//! [`Backend`] is the seam the stores depend on; [`RestClient`] implements it
//! over HTTP with bearer authentication. List endpoints are decoded per item:
//! a malformed element is logged and skipped instead of failing the whole
//! response.

use crate::config::Settings;
use crate::model::{
    ContactId, DeliveryStatus, KanbanStep, LossReason, NewMessagePayload, StepId, Ticket,
    TicketId, TicketStatus,
};
use crate::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Body of `POST /message/text`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SendTextRequest {
    /// Recipient conversation
    #[serde(rename = "remoteJId")]
    pub remote_jid: ContactId,
    /// Text to send
    pub text: String,
    /// Message being replied to
    #[serde(rename = "quotedMessageEvolutionId", skip_serializing_if = "Option::is_none")]
    pub quoted_message_id: Option<String>,
}

/// What the backend tells us about an accepted send
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SendReceipt {
    /// Server id of the created message, if returned
    pub id: Option<String>,
    /// Delivery status at acceptance
    pub status: Option<DeliveryStatus>,
    /// Server timestamp in epoch milliseconds
    pub timestamp: Option<i64>,
}

/// Body of `POST /losses`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LossRequest {
    /// Ticket being closed
    pub ticket_id: TicketId,
    /// Selected reason
    pub loss_reason_id: i64,
    /// Free-form note
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One column of the kanban board
#[derive(Debug, Clone, PartialEq)]
pub struct BoardColumn {
    /// The step
    pub step: KanbanStep,
    /// Tickets currently in it, in server order
    pub tickets: Vec<Ticket>,
}

/// Operations the client needs from the backend
#[async_trait]
pub trait Backend: Send + Sync {
    /// `GET /tickets/{status}`
    async fn tickets(&self, status: TicketStatus) -> Result<Vec<Ticket>>;

    /// `GET /messages?contactId=`
    async fn messages(&self, contact_id: &ContactId) -> Result<Vec<NewMessagePayload>>;

    /// `POST /message/text`
    async fn send_text(&self, request: &SendTextRequest) -> Result<SendReceipt>;

    /// `PATCH /kanban-steps/{ticketId}`
    async fn move_ticket(&self, ticket_id: TicketId, step_id: StepId) -> Result<()>;

    /// `PATCH /tickets/{id}/status`
    async fn update_ticket_status(&self, ticket_id: TicketId, status: TicketStatus) -> Result<()>;

    /// `POST /losses`
    async fn record_loss(&self, request: &LossRequest) -> Result<()>;

    /// `GET /kanban-steps`
    async fn kanban_steps(&self) -> Result<Vec<KanbanStep>>;

    /// `GET /kanban-steps/board`
    async fn kanban_board(&self) -> Result<Vec<BoardColumn>>;

    /// `GET /loss-reasons`
    async fn loss_reasons(&self) -> Result<Vec<LossReason>>;
}

/// HTTP implementation of [`Backend`]
#[derive(Debug, Clone)]
pub struct RestClient {
    client: reqwest::Client,
    base_url: String,
}

impl RestClient {
    /// Build a client from settings
    ///
    /// The bearer token is installed as a default header so every call carries it.
    pub fn new(settings: &Settings) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if !settings.access_token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", settings.access_token))
                .map_err(|e| Error::Config(format!("invalid access token header value: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(settings.request_timeout())
            .build()?;

        Ok(Self {
            client,
            base_url: settings.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_list<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<Vec<T>> {
        debug!("GET {}", path);
        let response = check(self.client.get(self.url(path)).send().await?).await?;
        let values: Vec<Value> = response.json().await?;
        Ok(decode_list(values, what))
    }
}

/// Turn a non-success response into `Error::Api`
async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.trim().is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
    } else {
        body
    };
    Err(Error::Api {
        status: status.as_u16(),
        message,
    })
}

/// Decode list items one by one, skipping the malformed ones
pub fn decode_list<T: DeserializeOwned>(values: Vec<Value>, what: &str) -> Vec<T> {
    values
        .into_iter()
        .enumerate()
        .filter_map(|(idx, value)| match serde_json::from_value(value) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Skipping malformed {} at index {}: {}", what, idx, e);
                None
            }
        })
        .collect()
}

fn take_field(value: &mut Value, key: &str) -> Value {
    value.get_mut(key).map(Value::take).unwrap_or(Value::Null)
}

#[async_trait]
impl Backend for RestClient {
    async fn tickets(&self, status: TicketStatus) -> Result<Vec<Ticket>> {
        self.get_list(&format!("/tickets/{}", status.as_str()), "ticket").await
    }

    async fn messages(&self, contact_id: &ContactId) -> Result<Vec<NewMessagePayload>> {
        debug!("GET /messages for {}", contact_id);
        let response = check(
            self.client
                .get(self.url("/messages"))
                .query(&[("contactId", contact_id.as_str())])
                .send()
                .await?,
        )
        .await?;
        let values: Vec<Value> = response.json().await?;
        Ok(decode_list(values, "message"))
    }

    async fn send_text(&self, request: &SendTextRequest) -> Result<SendReceipt> {
        debug!("POST /message/text to {}", request.remote_jid);
        let response = check(
            self.client
                .post(self.url("/message/text"))
                .json(request)
                .send()
                .await?,
        )
        .await?;

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(SendReceipt::default());
        }
        match serde_json::from_str::<SendReceipt>(&body) {
            Ok(mut receipt) => {
                receipt.id = receipt.id.filter(|id| !id.trim().is_empty());
                Ok(receipt)
            }
            Err(e) => {
                // The send itself succeeded; only the echo is unusable
                warn!("Unreadable send receipt for {}: {}", request.remote_jid, e);
                Ok(SendReceipt::default())
            }
        }
    }

    async fn move_ticket(&self, ticket_id: TicketId, step_id: StepId) -> Result<()> {
        debug!("PATCH /kanban-steps/{} -> step {}", ticket_id, step_id);
        check(
            self.client
                .patch(self.url(&format!("/kanban-steps/{}", ticket_id)))
                .json(&serde_json::json!({ "kanbanStepId": step_id }))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn update_ticket_status(&self, ticket_id: TicketId, status: TicketStatus) -> Result<()> {
        debug!("PATCH /tickets/{}/status -> {}", ticket_id, status);
        check(
            self.client
                .patch(self.url(&format!("/tickets/{}/status", ticket_id)))
                .json(&serde_json::json!({ "status": status }))
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn record_loss(&self, request: &LossRequest) -> Result<()> {
        debug!("POST /losses for ticket {}", request.ticket_id);
        check(self.client.post(self.url("/losses")).json(request).send().await?).await?;
        Ok(())
    }

    async fn kanban_steps(&self) -> Result<Vec<KanbanStep>> {
        self.get_list("/kanban-steps", "kanban step").await
    }

    async fn kanban_board(&self) -> Result<Vec<BoardColumn>> {
        let columns: Vec<Value> = self.get_list("/kanban-steps/board", "board column").await?;
        Ok(columns
            .into_iter()
            .filter_map(|mut column| {
                let step = match serde_json::from_value::<KanbanStep>(take_field(&mut column, "step")) {
                    Ok(step) => step,
                    Err(e) => {
                        warn!("Skipping board column without a valid step: {}", e);
                        return None;
                    }
                };
                let tickets = match take_field(&mut column, "tickets") {
                    Value::Array(values) => decode_list(values, "ticket"),
                    _ => Vec::new(),
                };
                Some(BoardColumn { step, tickets })
            })
            .collect())
    }

    async fn loss_reasons(&self) -> Result<Vec<LossReason>> {
        self.get_list("/loss-reasons", "loss reason").await
    }
}
