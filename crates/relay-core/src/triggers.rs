//! Trigger dispatcher: deep analysis, daily scripture sweep, pairing nudge.
//!
//! Every trigger is guarded by a per (user, kind) cooldown: at most one run
//! in flight, and a mark (message-count boundary, calendar day, or "once")
//! that never fires twice.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use chrono::{DateTime, Datelike, Local, Utc};
use tokio::task::JoinHandle;

use crate::{
    config::Config,
    domain::{SessionKey, SessionStatus, UserId},
    errors::Error,
    formatting::{escape_html, titled_block, RULE},
    messaging::port::{send_html_split, MessagingPort},
    model::{client::LanguageModel, prompts},
    records::{
        conversation_key, ConversationLog, Insight, Knowledge, UserAccount, UserRegistryDoc,
        KNOWLEDGE_KEY, USERS_KEY,
    },
    scripture,
    store::Documents,
    utils::{iso_timestamp_utc, local_timestamp},
    Result,
};

/// Starts and stops protocol sessions; implemented by the session registry.
pub trait SessionControl: Send + Sync {
    fn start_session(&self, key: SessionKey, display_name: &str);
    fn logout_session(&self, key: SessionKey);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TriggerKind {
    Analysis,
    Scripture,
    Nudge,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TriggerCooldown {
    pub last_fired_at: Option<DateTime<Utc>>,
    pub last_mark: Option<u64>,
    pub in_flight: bool,
}

#[derive(Default)]
pub struct Cooldowns {
    inner: Mutex<HashMap<(UserId, TriggerKind), TriggerCooldown>>,
}

impl Cooldowns {
    /// Claim `(user, kind)` for `mark`. `force` skips the mark check but
    /// never the in-flight check.
    pub fn acquire(
        self: &Arc<Self>,
        user: UserId,
        kind: TriggerKind,
        mark: u64,
        force: bool,
    ) -> Option<CooldownGuard> {
        let mut map = self.inner.lock().ok()?;
        let entry = map.entry((user, kind)).or_default();
        if entry.in_flight {
            return None;
        }
        if !force && entry.last_mark.is_some_and(|m| m >= mark) {
            return None;
        }
        entry.in_flight = true;
        entry.last_mark = Some(entry.last_mark.map_or(mark, |m| m.max(mark)));
        entry.last_fired_at = Some(Utc::now());
        Some(CooldownGuard {
            cooldowns: Arc::clone(self),
            key: (user, kind),
        })
    }

    pub fn get(&self, user: UserId, kind: TriggerKind) -> Option<TriggerCooldown> {
        self.inner.lock().ok()?.get(&(user, kind)).copied()
    }

    fn release(&self, key: (UserId, TriggerKind)) {
        if let Ok(mut map) = self.inner.lock() {
            if let Some(entry) = map.get_mut(&key) {
                entry.in_flight = false;
            }
        }
    }
}

/// Clears the in-flight flag when dropped.
pub struct CooldownGuard {
    cooldowns: Arc<Cooldowns>,
    key: (UserId, TriggerKind),
}

impl Drop for CooldownGuard {
    fn drop(&mut self) {
        self.cooldowns.release(self.key);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
    pub already_running: bool,
}

fn local_day_mark() -> u64 {
    Local::now().date_naive().num_days_from_ce().max(0) as u64
}

pub struct TriggerDispatcher {
    cfg: Arc<Config>,
    docs: Documents,
    messenger: Arc<dyn MessagingPort>,
    model: Arc<dyn LanguageModel>,
    cooldowns: Arc<Cooldowns>,
    sweep_running: AtomicBool,
}

impl TriggerDispatcher {
    pub fn new(
        cfg: Arc<Config>,
        docs: Documents,
        messenger: Arc<dyn MessagingPort>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            cfg,
            docs,
            messenger,
            model,
            cooldowns: Arc::new(Cooldowns::default()),
            sweep_running: AtomicBool::new(false),
        }
    }

    pub fn cooldowns(&self) -> &Arc<Cooldowns> {
        &self.cooldowns
    }

    // ============== Deep analysis ==============

    /// Spawn an analysis when `count` sits on a fresh boundary.
    pub fn request_analysis(
        self: &Arc<Self>,
        user: UserId,
        display_name: &str,
        count: usize,
    ) -> Option<JoinHandle<()>> {
        let every = self.cfg.analysis_every.max(1);
        if count < self.cfg.min_analysis_messages || count % every != 0 {
            return None;
        }
        let guard = self
            .cooldowns
            .acquire(user, TriggerKind::Analysis, count as u64, false)?;

        let this = Arc::clone(self);
        let name = display_name.to_string();
        Some(tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = this.run_analysis(user, &name).await {
                tracing::warn!(user = %user, error = %e, "analysis failed");
            }
        }))
    }

    async fn run_analysis(&self, user: UserId, name: &str) -> Result<()> {
        let log: ConversationLog = self.docs.load(&conversation_key(user)).await?;
        let window = log.tail(self.cfg.analysis_window);
        if window.is_empty() {
            return Ok(());
        }
        let transcript = prompts::analysis_transcript(name, window);

        tracing::info!(user = %user, messages = log.messages.len(), "running analysis");
        let summary = self.model.summarize(name, &transcript).await?;

        let html = format!(
            "{}\n\n{RULE}\n\n{}\n\n{RULE}",
            titled_block(
                &format!("🔍 Insights: {name}"),
                &[
                    ("User ID", user.to_string()),
                    ("Messages", log.messages.len().to_string()),
                    ("Contacts", log.contacts.len().to_string()),
                ],
            ),
            escape_html(&summary),
        );
        if let Err(e) = send_html_split(
            self.messenger.as_ref(),
            self.cfg.admin_id.into(),
            &html,
            self.cfg.telegram_message_limit,
        )
        .await
        {
            tracing::warn!(user = %user, error = %e, "insight not delivered to operator");
        }

        let insight = Insight {
            insights: summary,
            message_count: log.messages.len(),
            timestamp: iso_timestamp_utc(),
        };
        self.docs
            .update(USERS_KEY, |reg: &mut UserRegistryDoc| {
                if let Some(acc) = reg.get_mut(user) {
                    acc.insights.push(insight);
                }
            })
            .await
    }

    // ============== Pairing nudge ==============

    /// Start pairing once, on the configured interaction count, for users
    /// with no session live or mid-pairing.
    pub fn maybe_nudge(
        &self,
        account: &UserAccount,
        starter: &dyn SessionControl,
    ) -> bool {
        if account.interaction_count != self.cfg.nudge_at_message
            || matches!(
                account.session_status,
                SessionStatus::Active | SessionStatus::Pairing
            )
        {
            return false;
        }
        let user = account.user_id();
        if self
            .cooldowns
            .acquire(user, TriggerKind::Nudge, 1, false)
            .is_none()
        {
            return false;
        }
        tracing::info!(user = %user, "nudging user toward pairing");
        starter.start_session(SessionKey::User(user), &account.display_name);
        true
    }

    // ============== Scripture sweep ==============

    /// Deliver a problem-aware verse to every eligible user.
    ///
    /// `force` bypasses the once-per-day mark (operator command).
    pub async fn run_scripture_sweep(&self, force: bool) -> SweepReport {
        if self.sweep_running.swap(true, Ordering::SeqCst) {
            return SweepReport {
                already_running: true,
                ..SweepReport::default()
            };
        }
        let _running = RunningFlag(&self.sweep_running);

        let registry: UserRegistryDoc = self.docs.load_or_default(USERS_KEY).await;
        let knowledge: Knowledge = self
            .docs
            .load_or_default::<Knowledge>(KNOWLEDGE_KEY)
            .await
            .with_defaults(&self.cfg);

        let mut accounts: Vec<&UserAccount> = registry
            .users
            .values()
            .filter(|a| a.session_status == SessionStatus::Active)
            .collect();
        accounts.sort_by_key(|a| a.id);

        let day = local_day_mark();
        let mut report = SweepReport::default();
        let mut first = true;

        for account in accounts {
            let user = account.user_id();
            let log: ConversationLog = self.docs.load_or_default(&conversation_key(user)).await;
            if log.messages.len() < self.cfg.min_sweep_messages {
                report.skipped += 1;
                continue;
            }
            let Some(_guard) = self
                .cooldowns
                .acquire(user, TriggerKind::Scripture, day, force)
            else {
                report.skipped += 1;
                continue;
            };

            if !first {
                tokio::time::sleep(self.cfg.scripture_spacing).await;
            }
            first = false;

            match self.deliver_scripture(account, &log, &knowledge).await {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(user = %user, error = %e, "scripture delivery failed");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed,
            "scripture sweep finished"
        );
        report
    }

    async fn deliver_scripture(
        &self,
        account: &UserAccount,
        log: &ConversationLog,
        knowledge: &Knowledge,
    ) -> Result<()> {
        let user = account.user_id();
        let name = account.display_name.as_str();
        let transcript = prompts::classification_transcript(log.tail(self.cfg.analysis_window));

        let verdict = match self.model.classify_problem(name, &transcript).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(user = %user, error = %e, "problem classification failed");
                None
            }
        };
        let category = verdict
            .as_deref()
            .map(scripture::category_for)
            .unwrap_or(scripture::Category::General);
        let verse = scripture::pick_verse(category);

        let html = scripture::render_delivery(name, &verse, verdict.is_some(), &knowledge.group_name);
        self.messenger
            .send_html(user.into(), &html)
            .await
            .map_err(|e| Error::Delivery(format!("scripture to {user}: {e}")))?;

        let kind = if verdict.is_some() {
            format!("Problem-specific ({})", category.as_str())
        } else {
            "General encouragement".to_string()
        };
        let confirm = titled_block(
            "📖 Scripture sent",
            &[
                ("User", format!("{name} ({user})")),
                ("Kind", kind),
                ("Verse", verse.reference.to_string()),
                ("Time", local_timestamp()),
            ],
        );
        if let Err(e) = self.messenger.send_html(self.cfg.admin_id.into(), &confirm).await {
            tracing::warn!(user = %user, error = %e, "scripture confirmation not delivered");
        }
        Ok(())
    }
}

struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
