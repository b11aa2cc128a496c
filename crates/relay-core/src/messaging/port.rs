use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    formatting::split_html_chunks,
    messaging::types::{ChatAction, MessagingCapabilities},
    Result,
};

/// Outbound chat front-end port.
///
/// Every user-facing or operator-facing message leaves the core through this
/// trait. Failures come back as `Error::Delivery`.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;

    /// Send an image (PNG bytes) with an optional HTML caption.
    async fn send_photo(
        &self,
        chat_id: ChatId,
        png: &[u8],
        caption_html: Option<&str>,
    ) -> Result<MessageRef>;

    /// Send raw bytes as a file attachment.
    async fn send_document(
        &self,
        chat_id: ChatId,
        bytes: &[u8],
        file_name: &str,
        caption_html: Option<&str>,
    ) -> Result<MessageRef>;

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()>;
}

/// Send a report that may exceed one message, in order, stopping at the
/// first failed part.
pub async fn send_html_split(
    messenger: &dyn MessagingPort,
    chat_id: ChatId,
    html: &str,
    limit: usize,
) -> Result<()> {
    let limit = limit.min(messenger.capabilities().max_message_len).max(200);
    for chunk in split_html_chunks(html, limit) {
        messenger.send_html(chat_id, &chunk).await?;
    }
    Ok(())
}
