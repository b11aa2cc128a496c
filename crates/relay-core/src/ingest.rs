//! Message ingestion: filter, normalize, deduplicate, append, relay.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    config::Config,
    domain::{ChatId, Direction, UserId},
    formatting::titled_block,
    messaging::port::MessagingPort,
    protocol::RawMessage,
    records::{conversation_key, AppendResult, ConversationLog, MessageRecord},
    store::Documents,
    triggers::TriggerDispatcher,
    utils::{iso_timestamp_utc, local_timestamp, truncate_text},
    Result,
};

/// Whose linked account a message was captured from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionProfile {
    pub user: UserId,
    pub display_name: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    NoContent,
    GroupOrBroadcast,
    NoText,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    Dropped(DropReason),
    Duplicate,
    Appended { count: usize },
}

/// Apply the capture filters and build the record to persist.
pub fn normalize(raw: &RawMessage) -> std::result::Result<MessageRecord, DropReason> {
    let Some(content) = raw.content.as_ref() else {
        return Err(DropReason::NoContent);
    };
    if raw.chat_id.contains("@g.us") || raw.chat_id.contains("@broadcast") {
        return Err(DropReason::GroupOrBroadcast);
    }
    let Some(text) = content.text() else {
        return Err(DropReason::NoText);
    };

    let counterpart = raw
        .chat_id
        .split('@')
        .next()
        .unwrap_or_default()
        .to_string();

    Ok(MessageRecord {
        text: text.to_string(),
        direction: if raw.from_me {
            Direction::Outbound
        } else {
            Direction::Inbound
        },
        counterpart,
        chat_id: raw.chat_id.clone(),
        timestamp: iso_timestamp_utc(),
        id: raw.id.clone().filter(|id| !id.is_empty()),
    })
}

/// Ordered background delivery of activity reports to the operator chat.
///
/// Session actors only enqueue; the worker absorbs the operator chat's
/// throttle so one user's burst never delays another user's appends.
#[derive(Clone)]
pub struct OperatorRelay {
    tx: mpsc::UnboundedSender<String>,
}

impl OperatorRelay {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn spawn(messenger: Arc<dyn MessagingPort>, chat: ChatId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(html) = rx.recv().await {
                if let Err(e) = messenger.send_html(chat, &html).await {
                    tracing::warn!(chat = chat.0, error = %e, "relay to operator failed");
                }
            }
            tracing::debug!("operator relay stopped");
        });
        Self { tx }
    }

    pub fn push(&self, html: String) {
        if self.tx.send(html).is_err() {
            tracing::warn!("operator relay is gone; report dropped");
        }
    }
}

pub struct IngestionPipeline {
    cfg: Arc<Config>,
    docs: Documents,
    relay: OperatorRelay,
    triggers: Arc<TriggerDispatcher>,
}

impl IngestionPipeline {
    pub fn new(
        cfg: Arc<Config>,
        docs: Documents,
        messenger: Arc<dyn MessagingPort>,
        triggers: Arc<TriggerDispatcher>,
    ) -> Self {
        let relay = OperatorRelay::spawn(messenger, cfg.admin_id.into());
        Self {
            cfg,
            docs,
            relay,
            triggers,
        }
    }

    pub async fn ingest(&self, profile: &SessionProfile, raw: RawMessage) -> Result<IngestOutcome> {
        let record = match normalize(&raw) {
            Ok(r) => r,
            Err(reason) => {
                tracing::debug!(user = %profile.user, ?reason, "message dropped");
                return Ok(IngestOutcome::Dropped(reason));
            }
        };

        let appended = self
            .docs
            .update(&conversation_key(profile.user), |log: &mut ConversationLog| {
                if log.user_id == 0 {
                    log.user_id = profile.user.0;
                }
                log.display_name = profile.display_name.clone();
                log.append(record.clone())
            })
            .await?;

        let count = match appended {
            AppendResult::Duplicate => {
                tracing::debug!(user = %profile.user, id = ?record.id, "duplicate message skipped");
                return Ok(IngestOutcome::Duplicate);
            }
            AppendResult::Appended { count } => count,
        };

        self.relay(profile, &record, count);

        if count % self.cfg.analysis_every.max(1) == 0 {
            // The spawned task outlives this call; errors are logged there.
            if self
                .triggers
                .request_analysis(profile.user, &profile.display_name, count)
                .is_none()
            {
                tracing::debug!(user = %profile.user, count, "analysis already covered");
            }
        }

        Ok(IngestOutcome::Appended { count })
    }

    fn relay(&self, profile: &SessionProfile, record: &MessageRecord, count: usize) {
        let direction = match record.direction {
            Direction::Outbound => "📤 sent",
            Direction::Inbound => "📥 received",
        };
        let html = titled_block(
            "📱 WhatsApp activity",
            &[
                ("User", format!("{} ({})", profile.display_name, profile.user)),
                ("Contact", record.counterpart.clone()),
                ("Direction", direction.to_string()),
                ("Message", truncate_text(&record.text, 3000)),
                ("Total messages", count.to_string()),
                ("Time", local_timestamp()),
            ],
        );
        self.relay.push(html);
    }
}
