use axum::{
    routing::{get, post},
    Router,
};

pub mod system;
pub mod tickets;

/// Router for the submission and query endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/ticket", post(tickets::submit))
        .route("/ticket/:id", get(tickets::get_ticket))
        .route("/tickets", post(tickets::get_tickets))
        .route("/result/:id", get(tickets::get_result))
        .route("/databases", get(system::databases))
}
