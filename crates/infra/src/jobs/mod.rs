//! Job system: queue and lifecycle store for search jobs.
//!
//! ## Design
//!
//! - One `JobSystem` trait, two backends with identical semantics
//! - `LocalJobSystem`: in-process queue mirrored to the results directory
//! - `RedisJobSystem`: shared store for workers on many machines (feature `redis`)
//! - Lifecycle `Pending -> Running -> {Complete, Error}`, enforced by every backend
//! - Submissions deduplicate on the request fingerprint
//!
//! ## Components
//!
//! - `JobRecord` / `JobState`: persistent record and its lifecycle
//! - `StatusUpdate`: validated state change
//! - `RetryPolicy`: backoff for transient store failures

pub mod local;
#[cfg(feature = "redis")]
pub mod redis_store;
pub mod store;
pub mod types;

pub use local::LocalJobSystem;
#[cfg(feature = "redis")]
pub use redis_store::RedisJobSystem;
pub use store::{JobSystem, JobSystemError};
pub use types::{ClaimedJob, JobRecord, JobState, RetryPolicy, StatusUpdate};
