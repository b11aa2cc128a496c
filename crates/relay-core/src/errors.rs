/// Core error type for the relay.
///
/// Adapter crates map their specific errors into this type. Whether a session
/// retries is decided from its close reason, not from these variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Network drop or bridge failure; the session reconnects.
    #[error("connection error: {0}")]
    Connection(String),

    /// A pairing challenge (or other payload) could not be delivered.
    #[error("delivery failed: {0}")]
    Delivery(String),

    /// LLM, Telegram or other third-party call failed.
    #[error("external error: {0}")]
    External(String),

    #[error("persistence error for {key}: {reason}")]
    Persistence { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;
