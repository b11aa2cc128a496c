//! Persisted document shapes.
//!
//! Field names are camelCase on disk. Every field carries `#[serde(default)]`
//! so older or hand-edited documents still load.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    domain::{Direction, SessionStatus, UserId},
    model::types::ChatTurn,
};

pub const USERS_KEY: &str = "telegram_users";
pub const KNOWLEDGE_KEY: &str = "ai_knowledge";

pub fn conversation_key(user: UserId) -> String {
    format!("conversation_{}", user.0)
}

// ============== User registry ==============

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UserRegistryDoc {
    #[serde(default)]
    pub users: BTreeMap<String, UserAccount>,
}

impl UserRegistryDoc {
    pub fn get(&self, user: UserId) -> Option<&UserAccount> {
        self.users.get(&user.to_string())
    }

    pub fn get_mut(&mut self, user: UserId) -> Option<&mut UserAccount> {
        self.users.get_mut(&user.to_string())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub joined_at: String,
    #[serde(default)]
    pub session_status: SessionStatus,
    #[serde(default)]
    pub interaction_count: u64,
    #[serde(default)]
    pub conversation_history: Vec<ChatTurn>,
    #[serde(default)]
    pub insights: Vec<Insight>,
}

impl UserAccount {
    pub fn user_id(&self) -> UserId {
        UserId(self.id)
    }

    pub fn latest_insight(&self) -> Option<&Insight> {
        self.insights.last()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Insight {
    #[serde(default)]
    pub insights: String,
    #[serde(default)]
    pub message_count: usize,
    #[serde(default)]
    pub timestamp: String,
}

// ============== Conversation log ==============

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationLog {
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub messages: Vec<MessageRecord>,
    #[serde(default)]
    pub contacts: BTreeMap<String, ContactAggregate>,
    #[serde(default)]
    pub last_activity: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub text: String,
    pub direction: Direction,
    pub counterpart: String,
    pub chat_id: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactAggregate {
    #[serde(default)]
    pub message_count: usize,
    #[serde(default)]
    pub last_message: String,
}

/// Result of appending one record to a log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendResult {
    Duplicate,
    Appended { count: usize },
}

impl ConversationLog {
    /// Append `record` unless a record with the same protocol id exists.
    pub fn append(&mut self, record: MessageRecord) -> AppendResult {
        if let Some(id) = record.id.as_deref() {
            if self.messages.iter().any(|m| m.id.as_deref() == Some(id)) {
                return AppendResult::Duplicate;
            }
        }

        let contact = self.contacts.entry(record.counterpart.clone()).or_default();
        contact.message_count += 1;
        contact.last_message = record.text.clone();
        self.last_activity = Some(record.timestamp.clone());
        self.messages.push(record);

        AppendResult::Appended {
            count: self.messages.len(),
        }
    }

    /// The last `n` records, oldest first.
    pub fn tail(&self, n: usize) -> &[MessageRecord] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }
}

// ============== Knowledge ==============

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Knowledge {
    #[serde(default)]
    pub group_name: String,
    #[serde(default)]
    pub about: String,
    #[serde(default)]
    pub custom_info: Vec<String>,
}

impl Knowledge {
    /// Fill blank fields from configuration.
    pub fn with_defaults(mut self, cfg: &Config) -> Self {
        if self.group_name.trim().is_empty() {
            self.group_name = cfg.group_name.clone();
        }
        if self.about.trim().is_empty() {
            self.about = cfg.group_about.clone();
        }
        self
    }
}
