use serde::{Deserialize, Serialize};

/// Speaker of one chat turn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    #[default]
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One entry of a user's conversation with the assistant (persisted).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Sampling knobs per call kind.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Sampling {
    pub const REPLY: Sampling = Sampling {
        temperature: 0.8,
        max_tokens: 600,
    };
    pub const ANALYSIS: Sampling = Sampling {
        temperature: 0.6,
        max_tokens: 1000,
    };
    pub const CLASSIFY: Sampling = Sampling {
        temperature: 0.5,
        max_tokens: 300,
    };
}
