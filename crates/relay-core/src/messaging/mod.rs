//! Outbound chat front-end abstraction (Telegram implements it).

pub mod port;
pub mod throttled;
pub mod types;
