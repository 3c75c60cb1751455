//! `msaq-core`: request model for the search dispatch backend.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! tickets, validated job requests and the database catalog abstraction.

pub mod catalog;
pub mod error;
pub mod id;
pub mod request;

pub use catalog::{DatabaseCatalog, StaticCatalog};
pub use error::{RequestError, RequestResult};
pub use id::Ticket;
pub use request::{
    Fingerprint, JobRequest, JobVariant, PAIR_MODE_PREFIX, SearchPayload, is_pair_mode,
    normalize_query,
};
