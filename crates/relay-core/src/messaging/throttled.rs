use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{ChatId, MessageRef},
    messaging::{
        port::MessagingPort,
        types::{ChatAction, MessagingCapabilities},
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between any two outbound API calls.
    pub global_min_interval: Duration,
    /// Minimum spacing between calls to the same chat.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_chat_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return how long to wait before using it.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// MessagingPort decorator that rate-limits outbound calls.
///
/// The operator chat receives a relay for every captured message of every
/// user, so bursts are common; spacing them out keeps the bot clear of
/// Telegram's flood limits most of the time.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<i64, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_chat(&self, chat_id: i64) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_chat.lock().await;
        map.entry(chat_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_chat_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_chat(&self, chat_id: ChatId) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for_chat(chat_id.0).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl MessagingPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.throttle_chat(chat_id).await;
        self.inner.send_html(chat_id, html).await
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        png: &[u8],
        caption_html: Option<&str>,
    ) -> Result<MessageRef> {
        self.throttle_chat(chat_id).await;
        self.inner.send_photo(chat_id, png, caption_html).await
    }

    async fn send_document(
        &self,
        chat_id: ChatId,
        bytes: &[u8],
        file_name: &str,
        caption_html: Option<&str>,
    ) -> Result<MessageRef> {
        self.throttle_chat(chat_id).await;
        self.inner
            .send_document(chat_id, bytes, file_name, caption_html)
            .await
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        self.throttle_chat(chat_id).await;
        self.inner.send_chat_action(chat_id, action).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeMessenger;

    #[tokio::test(start_paused = true)]
    async fn same_chat_calls_are_spaced_by_per_chat_interval() {
        let fake = Arc::new(FakeMessenger::default());
        let throttled = ThrottledMessenger::new(fake.clone(), ThrottleConfig::default());

        let started = Instant::now();
        throttled.send_html(ChatId(1), "a").await.unwrap();
        throttled.send_html(ChatId(1), "b").await.unwrap();
        throttled.send_html(ChatId(1), "c").await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(2100));
        assert_eq!(fake.html_to(ChatId(1)).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn different_chats_only_wait_for_global_interval() {
        let fake = Arc::new(FakeMessenger::default());
        let throttled = ThrottledMessenger::new(fake.clone(), ThrottleConfig::default());

        let started = Instant::now();
        throttled.send_html(ChatId(1), "a").await.unwrap();
        throttled.send_html(ChatId(2), "b").await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(100));
    }
}
