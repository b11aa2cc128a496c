//! Core domain and application logic for the WhatsApp relay.
//!
//! Framework-agnostic: Telegram, the protocol bridge and the LLM provider
//! live behind ports (traits) implemented in adapter crates.

pub mod admin;
pub mod config;
pub mod conversation;
pub mod domain;
pub mod errors;
pub mod formatting;
pub mod ingest;
pub mod logging;
pub mod messaging;
pub mod model;
pub mod pairing;
pub mod protocol;
pub mod reconnect;
pub mod records;
pub mod scheduler;
pub mod scripture;
pub mod session;
pub mod store;
pub mod triggers;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_support;

pub use errors::{Error, Result};
