//! Language-model port and the prompts the relay sends through it.

pub mod client;
pub mod prompts;
pub mod types;
