//! Telegram adapter (teloxide).
//!
//! Implements the `relay-core` MessagingPort over the Telegram Bot API and
//! routes incoming updates to the conversation and operator services.

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{InputFile, ParseMode},
};

use tokio::time::sleep;

pub mod handlers;
pub mod qr;
pub mod router;

use relay_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{ChatAction, MessagingCapabilities},
    },
    Result,
};

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn map_err(e: teloxide::RequestError) -> Error {
        Error::Delivery(format!("telegram error: {e}"))
    }

    fn message_ref(chat_id: ChatId, msg: &Message) -> MessageRef {
        MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        }
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        tracing::debug!(wait = ?d, "telegram asked us to back off");
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities::default()
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(Self::tg_chat(chat_id), html.to_string())
                    .parse_mode(ParseMode::Html)
            })
            .await?;
        Ok(Self::message_ref(chat_id, &msg))
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        png: &[u8],
        caption_html: Option<&str>,
    ) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                let file = InputFile::memory(png.to_vec()).file_name("image.png");
                let mut req = self.bot.send_photo(Self::tg_chat(chat_id), file);
                if let Some(caption) = caption_html {
                    req = req.caption(caption.to_string()).parse_mode(ParseMode::Html);
                }
                req
            })
            .await?;
        Ok(Self::message_ref(chat_id, &msg))
    }

    async fn send_document(
        &self,
        chat_id: ChatId,
        bytes: &[u8],
        file_name: &str,
        caption_html: Option<&str>,
    ) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                let file = InputFile::memory(bytes.to_vec()).file_name(file_name.to_string());
                let mut req = self.bot.send_document(Self::tg_chat(chat_id), file);
                if let Some(caption) = caption_html {
                    req = req.caption(caption.to_string()).parse_mode(ParseMode::Html);
                }
                req
            })
            .await?;
        Ok(Self::message_ref(chat_id, &msg))
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        let tg_action = match action {
            ChatAction::Typing => teloxide::types::ChatAction::Typing,
            ChatAction::UploadPhoto => teloxide::types::ChatAction::UploadPhoto,
        };
        self.with_retry(|| self.bot.send_chat_action(Self::tg_chat(chat_id), tg_action))
            .await?;
        Ok(())
    }
}
