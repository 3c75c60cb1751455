//! Infrastructure layer: job systems, search engine, workers, config.

pub mod catalog;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod jobs;
pub mod workers;

pub use catalog::{CatalogError, DatabaseEntry, DirectoryCatalog};
pub use config::{AppConfig, ConfigError};
pub use dispatcher::{DispatchError, Dispatcher};
pub use engine::{CommandEngine, ExecutionError, SearchEngine};
