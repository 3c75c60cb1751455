use serde::Deserialize;

use msaq_core::{SearchPayload, Ticket};
use msaq_infra::jobs::JobRecord;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(flatten)]
    pub payload: SearchPayload,
    /// Skip fingerprint deduplication
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct TicketsRequest {
    pub tickets: Vec<String>,
}

// -------------------------
// Mapping helpers
// -------------------------

pub fn parse_ticket(raw: &str) -> Result<Ticket, axum::response::Response> {
    raw.parse::<Ticket>()
        .map_err(errors::request_error_to_response)
}

pub fn record_to_json(record: &JobRecord) -> serde_json::Value {
    let variant = record.request.variant();
    let mut body = serde_json::json!({
        "ticket": record.ticket.to_string(),
        "state": record.state.as_str(),
        "kind": variant.tag(),
        "mode": variant.mode(),
        "databases": variant.databases(),
        "created_at": record.created_at,
        "updated_at": record.updated_at,
    });
    if let Some(location) = &record.result_location {
        body["result"] = serde_json::json!(location.display().to_string());
    }
    if let Some(message) = &record.message {
        body["message"] = serde_json::json!(message);
    }
    body
}

pub fn unknown_ticket_json(ticket: Ticket) -> serde_json::Value {
    serde_json::json!({
        "ticket": ticket.to_string(),
        "state": "unknown",
    })
}
