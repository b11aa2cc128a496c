//! Operator control surface.
//!
//! Every command replies to the operator chat only. Callers route a command
//! here after parsing; non-operator senders are refused in [`AdminService::handle`].

use std::sync::Arc;

use serde_json::{json, Map, Value};

use crate::{
    config::Config,
    domain::{SessionKey, SessionStatus, UserId},
    formatting::{escape_html, titled_block, RULE},
    messaging::port::{send_html_split, MessagingPort},
    records::{
        conversation_key, ConversationLog, Knowledge, UserRegistryDoc, KNOWLEDGE_KEY, USERS_KEY,
    },
    session::{SessionRegistry, SessionState},
    store::Documents,
    triggers::TriggerDispatcher,
    utils::{iso_timestamp_utc, local_timestamp},
    Result,
};

/// Command list shown on the operator's `/start`.
pub fn help_panel(cfg: &Config) -> String {
    format!(
        "👑 <b>Welcome back, administrator</b>\n\n\
         <b>Commands</b>\n\
         /admin - dashboard\n\
         /users - registered users\n\
         /stats - detailed statistics\n\
         /sessions - live WhatsApp sessions\n\
         /addinfo [text] - teach the assistant about {}\n\
         /viewinfo - what the assistant knows\n\
         /sendscripture - run the scripture sweep now\n\
         /broadcast [text] - message every user\n\
         /fixdata - repair incomplete user records\n\
         /connect, /disconnect - operator WhatsApp session\n\n\
         Daily scriptures go out at {:02}:{:02}.",
        escape_html(&cfg.group_name),
        cfg.scripture_hour,
        cfg.scripture_minute
    )
}

pub struct AdminService {
    cfg: Arc<Config>,
    docs: Documents,
    messenger: Arc<dyn MessagingPort>,
    triggers: Arc<TriggerDispatcher>,
    sessions: SessionRegistry,
}

impl AdminService {
    pub fn new(
        cfg: Arc<Config>,
        docs: Documents,
        messenger: Arc<dyn MessagingPort>,
        triggers: Arc<TriggerDispatcher>,
        sessions: SessionRegistry,
    ) -> Self {
        Self {
            cfg,
            docs,
            messenger,
            triggers,
            sessions,
        }
    }

    /// Run an operator command. Returns `false` when `cmd` is not an
    /// operator command or `from` is not the operator.
    pub async fn handle(&self, from: UserId, cmd: &str, args: &str) -> Result<bool> {
        if !self.cfg.is_admin(from) {
            return Ok(false);
        }
        match cmd {
            "help" => self.help().await?,
            "admin" => self.dashboard().await?,
            "addinfo" => self.add_info(args).await?,
            "viewinfo" => self.view_info().await?,
            "users" => self.list_users().await?,
            "stats" => self.stats().await?,
            "sendscripture" => self.send_scripture_now().await?,
            "fixdata" => {
                self.fix_data().await?;
            }
            "broadcast" => self.broadcast(args).await?,
            "sessions" => self.list_sessions().await?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub async fn help(&self) -> Result<()> {
        self.reply(&help_panel(&self.cfg)).await
    }

    // ============== Reports ==============

    pub async fn dashboard(&self) -> Result<()> {
        let registry: UserRegistryDoc = self.docs.load_or_default(USERS_KEY).await;
        let connected = count_active(&registry);
        let monitored = self.monitored_total(&registry).await;
        let live = self.sessions.snapshots();
        let operator_live = live
            .iter()
            .any(|s| s.key == SessionKey::Operator && s.state == SessionState::Active);

        let html = format!(
            "{}\n\n{}",
            titled_block(
                "👑 Admin dashboard",
                &[
                    ("👥 Total users", registry.users.len().to_string()),
                    ("📱 WhatsApp connected", connected.to_string()),
                    ("💬 Messages monitored", monitored.to_string()),
                    ("🔗 Live sessions", live.len().to_string()),
                ],
            ),
            titled_block(
                "🤖 Status",
                &[
                    ("Telegram", "✅".to_string()),
                    ("Operator WhatsApp", mark(operator_live).to_string()),
                    (
                        "Daily scriptures",
                        format!(
                            "✅ {:02}:{:02}",
                            self.cfg.scripture_hour, self.cfg.scripture_minute
                        ),
                    ),
                ],
            ),
        );
        self.reply(&html).await
    }

    pub async fn list_users(&self) -> Result<()> {
        let registry: UserRegistryDoc = self.docs.load_or_default(USERS_KEY).await;
        let mut accounts: Vec<_> = registry.users.values().collect();
        accounts.sort_by_key(|a| a.id);

        let mut html = String::from("👥 <b>All users</b>\n");
        if accounts.is_empty() {
            html.push_str("\nNo users yet.");
        }
        for acc in accounts {
            let connected = acc.session_status == SessionStatus::Active;
            let mut whatsapp = mark(connected).to_string();
            if connected {
                let log: ConversationLog = self
                    .docs
                    .load_or_default(&conversation_key(acc.user_id()))
                    .await;
                whatsapp.push_str(&format!(
                    " ({} msgs, {} insights)",
                    log.messages.len(),
                    acc.insights.len()
                ));
            }
            html.push_str(&format!(
                "\n👤 {} (@{})\n   ID: {}\n   Telegram: {} msgs\n   WhatsApp: {}\n   Joined: {}\n",
                escape_html(&acc.display_name),
                escape_html(acc.username.as_deref().unwrap_or("none")),
                acc.id,
                acc.interaction_count,
                whatsapp,
                acc.joined_at.get(..10).unwrap_or(acc.joined_at.as_str()),
            ));
        }
        self.reply(&html).await
    }

    pub async fn stats(&self) -> Result<()> {
        let registry: UserRegistryDoc = self.docs.load_or_default(USERS_KEY).await;
        let chat_turns: usize = registry
            .users
            .values()
            .map(|a| a.conversation_history.len())
            .sum();
        let insights: usize = registry.users.values().map(|a| a.insights.len()).sum();
        let monitored = self.monitored_total(&registry).await;

        let html = [
            titled_block(
                "📊 Users",
                &[
                    ("Total", registry.users.len().to_string()),
                    ("WhatsApp connected", count_active(&registry).to_string()),
                ],
            ),
            titled_block(
                "💬 Messages",
                &[
                    ("Telegram turns", chat_turns.to_string()),
                    ("WhatsApp monitored", monitored.to_string()),
                ],
            ),
            titled_block("🧠 Insights", &[("Generated", insights.to_string())]),
            titled_block("⚙️ System", &[("As of", local_timestamp())]),
        ]
        .join("\n\n");
        self.reply(&html).await
    }

    pub async fn list_sessions(&self) -> Result<()> {
        let snapshots = self.sessions.snapshots();
        let mut html = String::from("🔗 <b>Live sessions</b>\n");
        if snapshots.is_empty() {
            html.push_str("\nNo live sessions.");
        }
        for s in snapshots {
            let seen = s
                .last_activity
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "never".to_string());
            html.push_str(&format!(
                "\n• {}: {} (attempt {}, retries {}, last activity {})",
                s.key,
                s.state.label(),
                s.attempt,
                s.retry_count,
                seen
            ));
        }
        self.reply(&html).await
    }

    // ============== Knowledge ==============

    pub async fn add_info(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return self.reply("Usage: /addinfo [text]").await;
        }
        let total = self
            .docs
            .update(KNOWLEDGE_KEY, |k: &mut Knowledge| {
                k.custom_info.push(text.to_string());
                k.custom_info.len()
            })
            .await?;
        tracing::info!(entries = total, "knowledge entry added");
        self.reply(&format!(
            "✅ <b>Added to knowledge</b>\n\n\"{}\"\n\nThe assistant now uses this in replies.",
            escape_html(text)
        ))
        .await
    }

    pub async fn view_info(&self) -> Result<()> {
        let k = self
            .docs
            .load::<Knowledge>(KNOWLEDGE_KEY)
            .await?
            .with_defaults(&self.cfg);
        let mut html = format!(
            "📚 <b>Knowledge base</b>\n\n<b>Group:</b> {}\n<b>About:</b> {}\n\n<b>Custom info:</b>\n",
            escape_html(&k.group_name),
            escape_html(&k.about)
        );
        if k.custom_info.is_empty() {
            html.push_str("None yet. Use: /addinfo [text]");
        } else {
            for (i, info) in k.custom_info.iter().enumerate() {
                html.push_str(&format!("{}. {}\n", i + 1, escape_html(info)));
            }
        }
        self.reply(&html).await
    }

    // ============== Actions ==============

    pub async fn send_scripture_now(&self) -> Result<()> {
        self.reply("📖 Sending personalized scriptures...").await?;
        let report = self.triggers.run_scripture_sweep(true).await;
        if report.already_running {
            return self.reply("⏳ A scripture sweep is already running.").await;
        }
        let html = titled_block(
            "✅ Scripture sweep done",
            &[
                ("Delivered", report.delivered.to_string()),
                ("Skipped", report.skipped.to_string()),
                ("Failed", report.failed.to_string()),
            ],
        );
        self.reply(&html).await
    }

    /// Fill missing fields on every raw user record; returns how many changed.
    pub async fn fix_data(&self) -> Result<usize> {
        let fixed = self
            .docs
            .update(USERS_KEY, |doc: &mut Value| repair_registry(doc))
            .await?;
        tracing::info!(fixed, "user records repaired");
        self.reply(&format!("✅ Fixed {fixed} records!")).await?;
        Ok(fixed)
    }

    pub async fn broadcast(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return self.reply("Usage: /broadcast [text]").await;
        }
        let registry: UserRegistryDoc = self.docs.load_or_default(USERS_KEY).await;
        let knowledge = self
            .docs
            .load_or_default::<Knowledge>(KNOWLEDGE_KEY)
            .await
            .with_defaults(&self.cfg);
        let html = format!(
            "📢 <b>Message from {}</b>\n\n{}",
            escape_html(&knowledge.group_name),
            escape_html(text)
        );

        let mut ids: Vec<UserId> = registry.users.values().map(|a| a.user_id()).collect();
        ids.sort();

        let (mut sent, mut failed) = (0usize, 0usize);
        for (i, user) in ids.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.cfg.broadcast_spacing).await;
            }
            match self.messenger.send_html(user.into(), &html).await {
                Ok(_) => sent += 1,
                Err(e) => {
                    tracing::warn!(user = %user, error = %e, "broadcast not delivered");
                    failed += 1;
                }
            }
        }

        tracing::info!(sent, failed, "broadcast finished");
        self.reply(&format!(
            "📢 <b>Broadcast complete</b>\n{RULE}\n✅ Sent: {sent}\n❌ Failed: {failed}"
        ))
        .await
    }

    // ============== Helpers ==============

    async fn monitored_total(&self, registry: &UserRegistryDoc) -> usize {
        let mut total = 0;
        for acc in registry.users.values() {
            let log: ConversationLog = self
                .docs
                .load_or_default(&conversation_key(acc.user_id()))
                .await;
            total += log.messages.len();
        }
        total
    }

    async fn reply(&self, html: &str) -> Result<()> {
        send_html_split(
            self.messenger.as_ref(),
            self.cfg.admin_id.into(),
            html,
            self.cfg.telegram_message_limit,
        )
        .await
    }
}

fn count_active(registry: &UserRegistryDoc) -> usize {
    registry
        .users
        .values()
        .filter(|a| a.session_status == SessionStatus::Active)
        .count()
}

fn mark(ok: bool) -> &'static str {
    if ok {
        "✅"
    } else {
        "❌"
    }
}

fn repair_registry(doc: &mut Value) -> usize {
    if !doc.is_object() {
        *doc = json!({ "users": {} });
    }
    let Some(root) = doc.as_object_mut() else {
        return 0;
    };
    let users = root.entry("users").or_insert_with(|| json!({}));
    if !users.is_object() {
        *users = json!({});
    }
    let Some(users) = users.as_object_mut() else {
        return 0;
    };

    let mut fixed = 0;
    for (key, record) in users.iter_mut() {
        if let Some(record) = record.as_object_mut() {
            if repair_record(key, record) {
                fixed += 1;
            }
        }
    }
    fixed
}

fn fill(rec: &mut Map<String, Value>, field: &str, value: Value) -> bool {
    if rec.get(field).map_or(true, Value::is_null) {
        rec.insert(field.to_string(), value);
        return true;
    }
    false
}

/// Older records used `firstName`, `messageCount` and `whatsappConnected`.
fn repair_record(key: &str, rec: &mut Map<String, Value>) -> bool {
    let id = key.parse::<i64>().map(Value::from).unwrap_or(Value::Null);
    let name = rec.get("firstName").cloned().unwrap_or_else(|| json!(""));
    let count = rec.get("messageCount").cloned().unwrap_or_else(|| json!(0));
    let status = if rec.get("whatsappConnected") == Some(&Value::Bool(true)) {
        SessionStatus::Active
    } else {
        SessionStatus::Unpaired
    };

    let mut changed = fill(rec, "id", id);
    changed |= fill(rec, "displayName", name);
    changed |= fill(rec, "joinedAt", json!(iso_timestamp_utc()));
    changed |= fill(rec, "interactionCount", count);
    changed |= fill(rec, "sessionStatus", json!(status.as_str()));
    changed |= fill(rec, "conversationHistory", json!([]));
    changed |= fill(rec, "insights", json!([]));
    changed
}
