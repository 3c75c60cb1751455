//! HTTP adapter and run modes of the `msaq` binary.

pub mod app;
pub mod cli;
pub mod server;
pub mod shutdown;
