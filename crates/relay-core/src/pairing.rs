//! Pairing challenge delivery and session lifecycle announcements.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};

use crate::{
    domain::{ChatId, SessionKey},
    errors::Error,
    formatting::{escape_html, titled_block},
    messaging::{port::MessagingPort, types::ChatAction},
    reconnect::TerminalReason,
    utils::local_timestamp,
    Result,
};

pub const QR_FILE_NAME: &str = "pairing-qr.png";

/// Turns an opaque pairing challenge into a scannable image.
pub trait ChallengeRenderer: Send + Sync {
    fn render_png(&self, challenge: &str) -> Result<Vec<u8>>;
}

/// In-memory bookkeeping for one pairing attempt.
#[derive(Clone, Copy, Debug)]
pub struct PendingPairing {
    pub attempt: u64,
    pub issued: bool,
    pub delivered: bool,
    pub started_at: DateTime<Utc>,
}

impl PendingPairing {
    fn new(attempt: u64) -> Self {
        Self {
            attempt,
            issued: false,
            delivered: false,
            started_at: Utc::now(),
        }
    }
}

pub struct PairingCoordinator {
    messenger: Arc<dyn MessagingPort>,
    renderer: Arc<dyn ChallengeRenderer>,
    admin: ChatId,
    pending: Mutex<HashMap<SessionKey, PendingPairing>>,
}

impl PairingCoordinator {
    pub fn new(
        messenger: Arc<dyn MessagingPort>,
        renderer: Arc<dyn ChallengeRenderer>,
        admin: ChatId,
    ) -> Self {
        Self {
            messenger,
            renderer,
            admin,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn chat_for(&self, key: SessionKey) -> ChatId {
        match key {
            SessionKey::User(u) => u.into(),
            SessionKey::Operator => self.admin,
        }
    }

    /// Open a fresh record for `attempt`, replacing any older one.
    pub fn begin(&self, key: SessionKey, attempt: u64) {
        if let Ok(mut map) = self.pending.lock() {
            map.insert(key, PendingPairing::new(attempt));
        }
    }

    /// Drop the record for `key` (paired, torn down or failed).
    pub fn resolve(&self, key: SessionKey) -> Option<PendingPairing> {
        self.pending.lock().ok().and_then(|mut m| m.remove(&key))
    }

    pub fn pending(&self, key: SessionKey) -> Option<PendingPairing> {
        self.pending.lock().ok().and_then(|m| m.get(&key).copied())
    }

    /// Claim the single delivery slot of `attempt`. Later attempts replace
    /// older records; stale attempts are refused.
    fn claim(&self, key: SessionKey, attempt: u64) -> bool {
        let Ok(mut map) = self.pending.lock() else {
            return false;
        };
        let entry = map
            .entry(key)
            .or_insert_with(|| PendingPairing::new(attempt));
        if entry.attempt < attempt {
            *entry = PendingPairing::new(attempt);
        }
        if entry.attempt != attempt || entry.issued {
            return false;
        }
        entry.issued = true;
        true
    }

    fn mark_delivered(&self, key: SessionKey, attempt: u64) {
        if let Ok(mut map) = self.pending.lock() {
            if let Some(p) = map.get_mut(&key) {
                if p.attempt == attempt {
                    p.delivered = true;
                }
            }
        }
    }

    /// Deliver `challenge` for `attempt` at most once.
    ///
    /// Returns `Ok(false)` when this attempt already had its challenge sent,
    /// and `Err(Error::Delivery)` after both image representations failed (the
    /// user and the operator have been told in text by then).
    pub async fn issue_challenge(
        &self,
        key: SessionKey,
        display_name: &str,
        attempt: u64,
        challenge: &str,
    ) -> Result<bool> {
        if !self.claim(key, attempt) {
            tracing::debug!(%key, attempt, "pairing challenge suppressed");
            return Ok(false);
        }

        let chat = self.chat_for(key);
        let caption = pairing_caption(key);

        let delivered = match self.renderer.render_png(challenge) {
            Ok(png) => self.send_image(chat, &png, &caption).await,
            Err(e) => {
                tracing::error!(%key, error = %e, "failed to render pairing code");
                false
            }
        };

        if delivered {
            self.mark_delivered(key, attempt);
            tracing::info!(%key, attempt, "pairing code delivered");
            return Ok(true);
        }

        self.report_failure(key, display_name).await;
        Err(Error::Delivery(format!("pairing code for {key} could not be sent")))
    }

    async fn send_image(&self, chat: ChatId, png: &[u8], caption: &str) -> bool {
        if let Err(e) = self
            .messenger
            .send_chat_action(chat, ChatAction::UploadPhoto)
            .await
        {
            tracing::debug!(chat = chat.0, error = %e, "upload indicator not sent");
        }

        match self.messenger.send_photo(chat, png, Some(caption)).await {
            Ok(_) => return true,
            Err(e) => tracing::warn!(chat = chat.0, error = %e, "pairing photo failed, trying document"),
        }
        match self
            .messenger
            .send_document(chat, png, QR_FILE_NAME, Some(caption))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(chat = chat.0, error = %e, "pairing document failed");
                false
            }
        }
    }

    async fn report_failure(&self, key: SessionKey, display_name: &str) {
        let chat = self.chat_for(key);
        let notice = "⚠️ I couldn't send your pairing code. Please try /connect again later \
                      or contact the administrator.";
        if let Err(e) = self.messenger.send_html(chat, notice).await {
            tracing::warn!(%key, error = %e, "pairing failure notice not delivered");
        }
        if let SessionKey::User(u) = key {
            let html = titled_block(
                "⚠️ Pairing code not delivered",
                &[
                    ("User", format!("{display_name} ({u})")),
                    ("Time", local_timestamp()),
                ],
            );
            self.notify_operator(&html).await;
        }
    }

    pub async fn announce_paired(&self, key: SessionKey, display_name: &str, fresh: bool) {
        match key {
            SessionKey::User(u) => {
                if fresh {
                    let html = "✅ <b>WhatsApp linked</b>\n\n\
                                Messages from your linked chats are now shared with the \
                                community administrator. Send /disconnect at any time to unlink.";
                    if let Err(e) = self.messenger.send_html(u.into(), html).await {
                        tracing::warn!(user = %u, error = %e, "paired notice not delivered");
                    }
                }
                let html = titled_block(
                    "✅ WhatsApp linked",
                    &[
                        ("User", format!("{display_name} ({u})")),
                        ("Time", local_timestamp()),
                    ],
                );
                self.notify_operator(&html).await;
            }
            SessionKey::Operator => {
                self.notify_operator("✅ <b>Operator WhatsApp connected</b>")
                    .await;
            }
        }
    }

    pub async fn announce_terminal(
        &self,
        key: SessionKey,
        display_name: &str,
        reason: TerminalReason,
    ) {
        let why = match reason {
            TerminalReason::LoggedOut => "logged out",
            TerminalReason::RetriesExhausted => "gave up reconnecting",
            TerminalReason::Requested => "disconnected on request",
        };
        match key {
            SessionKey::User(u) => {
                if reason != TerminalReason::Requested {
                    let html = "🕊️ Your WhatsApp connection has closed. Send /connect when \
                                you'd like to link again.";
                    if let Err(e) = self.messenger.send_html(u.into(), html).await {
                        tracing::warn!(user = %u, error = %e, "closed notice not delivered");
                    }
                }
                let html = titled_block(
                    "❌ WhatsApp session ended",
                    &[
                        ("User", format!("{display_name} ({u})")),
                        ("Reason", why.to_string()),
                        ("Time", local_timestamp()),
                    ],
                );
                self.notify_operator(&html).await;
            }
            SessionKey::Operator => {
                let html = format!(
                    "❌ <b>Operator WhatsApp {}</b>\n\nSend /connect to pair it again.",
                    escape_html(why)
                );
                self.notify_operator(&html).await;
            }
        }
    }

    async fn notify_operator(&self, html: &str) {
        if let Err(e) = self.messenger.send_html(self.admin, html).await {
            tracing::warn!(error = %e, "operator notification failed");
        }
    }
}

fn pairing_caption(key: SessionKey) -> String {
    let steps = "1. Open WhatsApp on your phone\n\
                 2. Open Settings, then Linked Devices\n\
                 3. Tap Link a Device\n\
                 4. Scan this code";
    match key {
        SessionKey::User(_) => format!(
            "📱 <b>Your WhatsApp pairing code</b>\n\n{steps}\n\n\
             Once linked, messages from your chats are shared with the community \
             administrator. Send /disconnect at any time to unlink."
        ),
        SessionKey::Operator => format!("📱 <b>Operator WhatsApp pairing code</b>\n\n{steps}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        domain::UserId,
        test_support::{FakeMessenger, FakeRenderer, Sent},
    };

    const ADMIN: ChatId = ChatId(1);

    fn coordinator(fake: &Arc<FakeMessenger>) -> PairingCoordinator {
        PairingCoordinator::new(fake.clone(), Arc::new(FakeRenderer), ADMIN)
    }

    #[tokio::test]
    async fn challenge_is_delivered_once_per_attempt() {
        let fake = Arc::new(FakeMessenger::default());
        let pairing = coordinator(&fake);
        let key = SessionKey::User(UserId(7));
        pairing.begin(key, 1);

        assert!(pairing.issue_challenge(key, "Ann", 1, "qr-a").await.unwrap());
        assert!(!pairing.issue_challenge(key, "Ann", 1, "qr-b").await.unwrap());
        assert!(!pairing.issue_challenge(key, "Ann", 1, "qr-c").await.unwrap());

        assert_eq!(fake.photos_to(ChatId(7)), 1);
        assert!(pairing.pending(key).unwrap().delivered);

        // A new attempt gets its own delivery.
        assert!(pairing.issue_challenge(key, "Ann", 2, "qr-d").await.unwrap());
        assert_eq!(fake.photos_to(ChatId(7)), 2);
        // And the old attempt stays closed.
        assert!(!pairing.issue_challenge(key, "Ann", 1, "qr-e").await.unwrap());
    }

    #[tokio::test]
    async fn photo_failure_falls_back_to_document() {
        let fake = Arc::new(FakeMessenger::default());
        fake.fail_photos.store(true, Ordering::SeqCst);
        let pairing = coordinator(&fake);
        let key = SessionKey::User(UserId(7));

        assert!(pairing.issue_challenge(key, "Ann", 1, "qr").await.unwrap());
        assert_eq!(fake.photos_to(ChatId(7)), 0);
        assert_eq!(fake.documents_to(ChatId(7)), 1);
        assert!(fake
            .all()
            .contains(&Sent::Document(ChatId(7), QR_FILE_NAME.to_string())));
    }

    #[tokio::test]
    async fn double_failure_notifies_user_and_operator() {
        let fake = Arc::new(FakeMessenger::default());
        fake.fail_photos.store(true, Ordering::SeqCst);
        fake.fail_documents.store(true, Ordering::SeqCst);
        let pairing = coordinator(&fake);
        let key = SessionKey::User(UserId(7));

        let res = pairing.issue_challenge(key, "Ann", 1, "qr").await;
        assert!(matches!(res, Err(Error::Delivery(_))));
        assert_eq!(fake.html_to(ChatId(7)).len(), 1);
        assert!(fake.html_to(ADMIN)[0].contains("Pairing code not delivered"));
        assert!(!pairing.pending(key).unwrap().delivered);
    }

    #[tokio::test]
    async fn user_caption_discloses_operator_visibility() {
        let fake = Arc::new(FakeMessenger::default());
        let pairing = coordinator(&fake);
        pairing
            .issue_challenge(SessionKey::User(UserId(7)), "Ann", 1, "qr")
            .await
            .unwrap();
        let caption = fake
            .all()
            .into_iter()
            .find_map(|s| match s {
                Sent::Photo(_, c) => c,
                _ => None,
            })
            .unwrap();
        assert!(caption.contains("administrator"));
        assert!(caption.contains("/disconnect"));
    }

    #[tokio::test]
    async fn operator_challenge_goes_to_admin_chat() {
        let fake = Arc::new(FakeMessenger::default());
        let pairing = coordinator(&fake);
        pairing
            .issue_challenge(SessionKey::Operator, "operator", 1, "qr")
            .await
            .unwrap();
        assert_eq!(fake.photos_to(ADMIN), 1);
    }

    #[tokio::test]
    async fn announce_paired_only_tells_user_when_code_was_delivered() {
        let fake = Arc::new(FakeMessenger::default());
        let pairing = coordinator(&fake);
        let key = SessionKey::User(UserId(7));

        pairing.announce_paired(key, "Ann", false).await;
        assert!(fake.html_to(ChatId(7)).is_empty());
        assert_eq!(fake.html_to(ADMIN).len(), 1);

        pairing.announce_paired(key, "Ann", true).await;
        assert_eq!(fake.html_to(ChatId(7)).len(), 1);
        assert_eq!(fake.html_to(ADMIN).len(), 2);
    }
}
