//! Quiz monitoring and answer resolution core.
//!
//! Framework-agnostic: the chat transport, session login and the assistant
//! backend live behind ports (traits) implemented in adapter crates.

pub mod accounts;
pub mod assistant;
pub mod audit;
pub mod cache;
pub mod config;
pub mod detector;
pub mod domain;
pub mod errors;
pub mod extractor;
pub mod fingerprint;
pub mod logging;
pub mod monitor;
pub mod ports;
pub mod prompt;
pub mod resolver;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use errors::{Error, Result};
