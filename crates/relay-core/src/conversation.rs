//! Chat front-end callbacks: greeting, companion replies, link commands.
//!
//! The registry document is only held under its key lock for the short
//! read-modify-write steps; model calls happen outside of it.

use std::sync::Arc;

use crate::{
    admin,
    config::Config,
    domain::{SessionKey, SessionStatus, UserId},
    formatting::{escape_html, titled_block},
    messaging::{port::MessagingPort, types::ChatAction},
    model::{
        client::LanguageModel,
        prompts::{self, PersonaContext},
        types::ChatTurn,
    },
    records::{Knowledge, UserAccount, UserRegistryDoc, KNOWLEDGE_KEY, USERS_KEY},
    store::Documents,
    triggers::{SessionControl, TriggerDispatcher},
    utils::{iso_timestamp_utc, local_timestamp, truncate_text},
    Result,
};

const START_FIRST: &str = "Please /start first! 😊";
const GREETING_PROMPT_TEXT: &str = "Hi";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartOutcome {
    OperatorPanel,
    Greeted { new_user: bool },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextOutcome {
    Ignored,
    NotRegistered,
    Replied { count: u64, nudged: bool },
}

pub struct ConversationService {
    cfg: Arc<Config>,
    docs: Documents,
    messenger: Arc<dyn MessagingPort>,
    model: Arc<dyn LanguageModel>,
    triggers: Arc<TriggerDispatcher>,
    sessions: Arc<dyn SessionControl>,
}

impl ConversationService {
    pub fn new(
        cfg: Arc<Config>,
        docs: Documents,
        messenger: Arc<dyn MessagingPort>,
        model: Arc<dyn LanguageModel>,
        triggers: Arc<TriggerDispatcher>,
        sessions: Arc<dyn SessionControl>,
    ) -> Self {
        Self {
            cfg,
            docs,
            messenger,
            model,
            triggers,
            sessions,
        }
    }

    // ============== /start ==============

    pub async fn on_start(
        &self,
        user: UserId,
        display_name: &str,
        username: Option<&str>,
    ) -> Result<StartOutcome> {
        if self.cfg.is_admin(user) {
            self.messenger
                .send_html(user.into(), &admin::help_panel(&self.cfg))
                .await?;
            return Ok(StartOutcome::OperatorPanel);
        }

        let (new_user, account) = self
            .docs
            .update(USERS_KEY, |reg: &mut UserRegistryDoc| {
                let key = user.to_string();
                let new_user = !reg.users.contains_key(&key);
                let acc = reg.users.entry(key).or_insert_with(|| UserAccount {
                    id: user.0,
                    display_name: display_name.to_string(),
                    username: username.map(str::to_string),
                    joined_at: iso_timestamp_utc(),
                    ..UserAccount::default()
                });
                (new_user, acc.clone())
            })
            .await?;

        if new_user {
            tracing::info!(user = %user, "new user registered");
            let html = titled_block(
                "🆕 New user",
                &[
                    ("Name", display_name.to_string()),
                    ("Username", format!("@{}", username.unwrap_or("none"))),
                    ("ID", user.to_string()),
                ],
            );
            self.notify_operator(&html).await;
        }

        let knowledge = self.knowledge().await;
        let prompt = prompts::persona_prompt(&PersonaContext {
            knowledge: &knowledge,
            account: Some(&account),
            display_name,
            first_meeting: true,
            nudge: false,
        });

        self.typing(user).await;
        let greeting = match self.model.complete(&prompt, &[], GREETING_PROMPT_TEXT).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => prompts::fallback_greeting(display_name),
            Err(e) => {
                tracing::warn!(user = %user, error = %e, "greeting generation failed");
                prompts::fallback_greeting(display_name)
            }
        };

        self.docs
            .update(USERS_KEY, |reg: &mut UserRegistryDoc| {
                if let Some(acc) = reg.get_mut(user) {
                    acc.conversation_history.push(ChatTurn::user(GREETING_PROMPT_TEXT));
                    acc.conversation_history.push(ChatTurn::assistant(greeting.as_str()));
                    acc.interaction_count = 1;
                }
            })
            .await?;

        self.messenger
            .send_html(user.into(), &escape_html(&greeting))
            .await?;
        Ok(StartOutcome::Greeted { new_user })
    }

    // ============== Plain text ==============

    pub async fn on_text(&self, user: UserId, display_name: &str, text: &str) -> Result<TextOutcome> {
        let text = text.trim();
        if self.cfg.is_admin(user) || text.is_empty() || text.starts_with('/') {
            return Ok(TextOutcome::Ignored);
        }

        let account = self
            .docs
            .update(USERS_KEY, |reg: &mut UserRegistryDoc| {
                reg.get_mut(user).map(|acc| {
                    acc.interaction_count += 1;
                    acc.clone()
                })
            })
            .await?;
        let Some(account) = account else {
            self.messenger.send_html(user.into(), START_FIRST).await?;
            return Ok(TextOutcome::NotRegistered);
        };
        let count = account.interaction_count;

        let knowledge = self.knowledge().await;
        let prompt = prompts::persona_prompt(&PersonaContext {
            knowledge: &knowledge,
            account: Some(&account),
            display_name,
            first_meeting: false,
            nudge: count == self.cfg.nudge_at_message
                && !matches!(account.session_status, SessionStatus::Active | SessionStatus::Pairing),
        });
        let history = &account.conversation_history;
        let recent = &history[history.len().saturating_sub(self.cfg.history_window)..];

        self.typing(user).await;
        let reply = match self.model.complete(&prompt, recent, text).await {
            Ok(r) if !r.trim().is_empty() => r,
            Ok(_) => prompts::fallback_reply(display_name),
            Err(e) => {
                tracing::warn!(user = %user, error = %e, "reply generation failed");
                prompts::fallback_reply(display_name)
            }
        };

        self.docs
            .update(USERS_KEY, |reg: &mut UserRegistryDoc| {
                if let Some(acc) = reg.get_mut(user) {
                    acc.conversation_history.push(ChatTurn::user(text));
                    acc.conversation_history.push(ChatTurn::assistant(reply.as_str()));
                }
            })
            .await?;

        // The count is already bumped; a lost reply must not cost the nudge.
        if let Err(e) = self
            .messenger
            .send_html(user.into(), &escape_html(&reply))
            .await
        {
            tracing::warn!(user = %user, error = %e, "reply not delivered");
        }

        let nudged = self.triggers.maybe_nudge(&account, self.sessions.as_ref());
        if nudged {
            self.announce_pairing(user, display_name, count).await;
        }

        let html = titled_block(
            "💬 Telegram chat",
            &[
                ("User", format!("{display_name} ({user})")),
                ("Message #", count.to_string()),
                ("USER", truncate_text(text, 1500)),
                ("BOT", truncate_text(&reply, 1500)),
                ("Time", local_timestamp()),
            ],
        );
        self.notify_operator(&html).await;

        Ok(TextOutcome::Replied { count, nudged })
    }

    // ============== /connect, /disconnect ==============

    /// Begin pairing for the caller. The operator pairs the operator session.
    pub async fn connect(&self, user: UserId, display_name: &str) -> Result<()> {
        if self.cfg.is_admin(user) {
            self.sessions.start_session(SessionKey::Operator, display_name);
            self.messenger
                .send_html(user.into(), "⏳ Starting the operator WhatsApp session...")
                .await?;
            return Ok(());
        }

        let registry: UserRegistryDoc = self.docs.load_or_default(USERS_KEY).await;
        let Some(account) = registry.get(user) else {
            self.messenger.send_html(user.into(), START_FIRST).await?;
            return Ok(());
        };

        tracing::info!(user = %user, "pairing requested by user");
        self.messenger
            .send_html(user.into(), CONNECT_NOTICE)
            .await?;
        self.sessions
            .start_session(SessionKey::User(user), &account.display_name);
        Ok(())
    }

    pub async fn disconnect(&self, user: UserId) -> Result<()> {
        let key = if self.cfg.is_admin(user) {
            SessionKey::Operator
        } else {
            SessionKey::User(user)
        };
        tracing::info!(%key, "unlink requested");
        self.sessions.logout_session(key);
        self.messenger
            .send_html(
                user.into(),
                "🔌 <b>WhatsApp unlinked</b>\n\nNothing further is shared. \
                 Send /connect if you ever want to link again.",
            )
            .await?;
        Ok(())
    }

    // ============== Helpers ==============

    async fn announce_pairing(&self, user: UserId, display_name: &str, count: u64) {
        if let Err(e) = self.messenger.send_html(user.into(), CONNECT_NOTICE).await {
            tracing::warn!(user = %user, error = %e, "pairing notice not delivered");
        }
        let html = titled_block(
            "📱 Pairing started",
            &[
                ("User", format!("{display_name} ({user})")),
                ("Message #", count.to_string()),
            ],
        );
        self.notify_operator(&html).await;
    }

    async fn knowledge(&self) -> Knowledge {
        self.docs
            .load_or_default::<Knowledge>(KNOWLEDGE_KEY)
            .await
            .with_defaults(&self.cfg)
    }

    async fn typing(&self, user: UserId) {
        if let Err(e) = self
            .messenger
            .send_chat_action(user.into(), ChatAction::Typing)
            .await
        {
            tracing::debug!(user = %user, error = %e, "typing indicator failed");
        }
    }

    async fn notify_operator(&self, html: &str) {
        if let Err(e) = self.messenger.send_html(self.cfg.admin_id.into(), html).await {
            tracing::warn!(error = %e, "operator notification failed");
        }
    }
}

const CONNECT_NOTICE: &str = "📱 <b>Linking your WhatsApp</b>\n\n\
    ⏳ Generating a pairing code, it will arrive in a moment.\n\n\
    While linked, messages from your WhatsApp chats are shared with the \
    community administrator. Send /disconnect at any time to stop.";
