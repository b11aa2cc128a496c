//! Telegram update handlers.
//!
//! Commands go to the conversation or operator services; plain text is
//! serialized per chat and answered by the companion.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};

use relay_core::domain::UserId;

use crate::router::AppState;

mod commands;
mod text;

/// Who sent an update, as the services need it.
pub(crate) struct Sender {
    pub user: UserId,
    pub display_name: String,
    pub username: Option<String>,
}

impl Sender {
    fn from_message(msg: &Message) -> Option<Self> {
        let u = msg.from()?;
        Some(Self {
            user: UserId(u.id.0 as i64),
            display_name: u.first_name.clone(),
            username: u.username.clone(),
        })
    }
}

pub async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(sender) = Sender::from_message(&msg) else {
        return Ok(());
    };
    // Photos, stickers and other media carry no text to answer.
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let chat_id = msg.chat.id.0;
    let _guard = state.chat_locks.lock_chat(chat_id).await;

    let result = if text.starts_with('/') {
        commands::handle_command(&state, &sender, text).await
    } else {
        text::handle_text(&state, &sender, text).await
    };

    if let Err(e) = result {
        tracing::warn!(user = %sender.user, error = %e, "update handling failed");
    }
    Ok(())
}
