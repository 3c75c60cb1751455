//! Background workers.

pub mod search_worker;

pub use search_worker::{JobOutcome, SearchWorker, WorkerConfig, WorkerHandle, WorkerStats};
