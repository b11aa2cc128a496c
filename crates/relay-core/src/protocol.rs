//! Protocol session port (the paired messaging account of a user).
//!
//! A connector opens one connection per session attempt. The connection is a
//! pull-based event source owned by exactly one session actor.

use async_trait::async_trait;

use crate::Result;

/// Text-bearing fields of a captured protocol message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageContent {
    pub conversation: Option<String>,
    pub extended_text: Option<String>,
    pub image_caption: Option<String>,
}

impl MessageContent {
    /// First populated, non-blank text field.
    pub fn text(&self) -> Option<&str> {
        [
            self.conversation.as_deref(),
            self.extended_text.as_deref(),
            self.image_caption.as_deref(),
        ]
        .into_iter()
        .flatten()
        .find(|s| !s.trim().is_empty())
    }
}

/// A message observed on a live connection, before filtering.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawMessage {
    pub id: Option<String>,
    /// Remote chat address, e.g. `15550001@s.whatsapp.net`.
    pub chat_id: String,
    pub from_me: bool,
    /// `None` for protocol stubs (receipts, reactions, deletions).
    pub content: Option<MessageContent>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// The account was unlinked on the phone; credentials are void.
    LoggedOut,
    Other(String),
}

impl CloseReason {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CloseReason::LoggedOut)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolEvent {
    ChallengeIssued(String),
    Paired,
    CredentialsUpdated(serde_json::Value),
    MessageReceived(RawMessage),
    Closed(CloseReason),
}

/// Parameters for opening a connection.
#[derive(Clone, Debug)]
pub struct ConnectSpec {
    /// Client label shown on the linked device list.
    pub label: String,
    pub credentials: Option<serde_json::Value>,
    pub sync_full_history: bool,
}

#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    async fn open(&self, spec: ConnectSpec) -> Result<Box<dyn ProtocolConnection>>;
}

#[async_trait]
pub trait ProtocolConnection: Send {
    /// Next event; `None` once the underlying stream has ended.
    async fn next_event(&mut self) -> Option<ProtocolEvent>;

    /// Tear the connection down. Must be safe to call more than once.
    async fn close(&mut self) -> Result<()>;

    /// Unlink the account, then close.
    async fn logout(&mut self) -> Result<()> {
        self.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_prefers_first_populated_field() {
        let c = MessageContent {
            conversation: Some("   ".to_string()),
            extended_text: Some("linked".to_string()),
            image_caption: Some("caption".to_string()),
        };
        assert_eq!(c.text(), Some("linked"));
        assert_eq!(MessageContent::default().text(), None);
    }
}
