//! Ticket submission and lookup.
//!
//! Job system calls may block (file I/O, Redis round trips), so every handler
//! runs them on the blocking pool.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tokio::task::spawn_blocking;

use msaq_core::Ticket;
use msaq_infra::Dispatcher;

use crate::app::{dto, errors};

/// POST /ticket - Validate and enqueue a search
pub async fn submit(
    Extension(dispatcher): Extension<Arc<Dispatcher>>,
    Json(body): Json<dto::SubmitRequest>,
) -> axum::response::Response {
    let submitted = spawn_blocking(move || {
        let ticket = dispatcher.submit(&body.payload, body.force)?;
        let state = dispatcher.status(ticket)?;
        Ok::<_, msaq_infra::DispatchError>((ticket, state))
    })
    .await;

    match submitted {
        Ok(Ok((ticket, state))) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "ticket": ticket.to_string(),
                "state": state.as_str(),
            })),
        )
            .into_response(),
        Ok(Err(e)) => errors::dispatch_error_to_response(e),
        Err(e) => errors::task_failed(e),
    }
}

/// GET /ticket/:id - State of one ticket
pub async fn get_ticket(
    Extension(dispatcher): Extension<Arc<Dispatcher>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let ticket = match dto::parse_ticket(&id) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    match spawn_blocking(move || dispatcher.record(ticket)).await {
        Ok(Ok(record)) => Json(dto::record_to_json(&record)).into_response(),
        Ok(Err(e)) => errors::dispatch_error_to_response(e),
        Err(e) => errors::task_failed(e),
    }
}

/// POST /tickets - State of many tickets; unknown ones are reported as such
pub async fn get_tickets(
    Extension(dispatcher): Extension<Arc<Dispatcher>>,
    Json(body): Json<dto::TicketsRequest>,
) -> axum::response::Response {
    let mut tickets = Vec::with_capacity(body.tickets.len());
    for raw in &body.tickets {
        match dto::parse_ticket(raw) {
            Ok(t) => tickets.push(t),
            Err(resp) => return resp,
        }
    }

    match spawn_blocking(move || dispatcher.records(&tickets)).await {
        Ok(Ok(records)) => {
            let items: Vec<_> = records
                .iter()
                .map(|(ticket, record)| match record {
                    Some(r) => dto::record_to_json(r),
                    None => dto::unknown_ticket_json(*ticket),
                })
                .collect();
            Json(serde_json::json!({ "items": items })).into_response()
        }
        Ok(Err(e)) => errors::dispatch_error_to_response(e),
        Err(e) => errors::task_failed(e),
    }
}

/// GET /result/:id - Result location of a completed ticket (409 until then)
pub async fn get_result(
    Extension(dispatcher): Extension<Arc<Dispatcher>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let ticket: Ticket = match dto::parse_ticket(&id) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    match spawn_blocking(move || dispatcher.result(ticket)).await {
        Ok(Ok(location)) => Json(serde_json::json!({
            "ticket": ticket.to_string(),
            "location": location.display().to_string(),
        }))
        .into_response(),
        Ok(Err(e)) => errors::dispatch_error_to_response(e),
        Err(e) => errors::task_failed(e),
    }
}
