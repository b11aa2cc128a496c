use std::{collections::HashMap, sync::Arc};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use tokio::sync::{Mutex, OwnedMutexGuard};

use relay_core::{admin::AdminService, config::Config, conversation::ConversationService};

use crate::handlers;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub conversation: Arc<ConversationService>,
    pub admin: Arc<AdminService>,
    pub chat_locks: Arc<ChatLocks>,
}

impl AppState {
    pub fn new(
        cfg: Arc<Config>,
        conversation: Arc<ConversationService>,
        admin: Arc<AdminService>,
    ) -> Self {
        Self {
            cfg,
            conversation,
            admin,
            chat_locks: Arc::new(ChatLocks::default()),
        }
    }
}

/// Serializes handling per chat so replies and history stay in order.
#[derive(Default)]
pub struct ChatLocks {
    inner: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl ChatLocks {
    pub async fn lock_chat(&self, chat_id: i64) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(chat_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Long-poll Telegram until Ctrl-C.
pub async fn run_polling(bot: Bot, state: Arc<AppState>) -> anyhow::Result<()> {
    match bot.get_me().await {
        Ok(me) => tracing::info!(bot = %me.username(), "telegram bot started"),
        Err(e) => anyhow::bail!("telegram token rejected: {e}"),
    }

    let handler = dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .default_handler(|_| async {})
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    tracing::info!("telegram polling stopped");
    Ok(())
}
