use std::fmt;

use serde::{Deserialize, Serialize};

/// Telegram user id (numeric). Also the tenant key for every per-user document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

impl From<UserId> for ChatId {
    fn from(u: UserId) -> Self {
        ChatId(u.0)
    }
}

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Pairing status of a user's protocol session, as persisted on the account.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Unpaired,
    Pairing,
    Active,
    Disconnected,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Unpaired => "unpaired",
            SessionStatus::Pairing => "pairing",
            SessionStatus::Active => "active",
            SessionStatus::Disconnected => "disconnected",
        }
    }
}

/// Which side of a conversation a captured message came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Identifies one session owner: a registered user or the operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionKey {
    User(UserId),
    Operator,
}

impl SessionKey {
    pub fn class(self) -> SessionClass {
        match self {
            SessionKey::User(_) => SessionClass::User,
            SessionKey::Operator => SessionClass::Operator,
        }
    }

    pub fn user(self) -> Option<UserId> {
        match self {
            SessionKey::User(u) => Some(u),
            SessionKey::Operator => None,
        }
    }

    /// Document key under which the opaque credential bundle is stored.
    pub fn credentials_key(self) -> String {
        match self {
            SessionKey::User(u) => format!("creds_user_{}", u.0),
            SessionKey::Operator => "creds_operator".to_string(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::User(u) => write!(f, "user:{u}"),
            SessionKey::Operator => write!(f, "operator"),
        }
    }
}

/// Session class selects the reconnect policy and the notification targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionClass {
    User,
    Operator,
}
