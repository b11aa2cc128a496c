use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::UserId, errors::Error, Result};

/// Typed configuration for the relay.
///
/// Everything is read from the environment (optionally seeded from `.env`).
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub telegram_bot_token: String,
    pub admin_id: UserId,
    pub groq_api_key: Option<String>,
    pub groq_model: String,
    pub data_dir: PathBuf,

    // Protocol bridge
    pub bridge_path: PathBuf,
    pub bridge_args: Vec<String>,
    pub operator_session_enabled: bool,

    // Reconnect supervisor
    pub user_reconnect_delay: Duration,
    pub operator_reconnect_delay: Duration,
    pub reconnect_max_retries: Option<u32>,
    pub reconnect_jitter: Duration,

    // Triggers
    pub analysis_every: usize,
    pub min_analysis_messages: usize,
    pub analysis_window: usize,
    pub min_sweep_messages: usize,
    pub nudge_at_message: u64,
    pub history_window: usize,

    // Scheduled delivery
    pub scripture_hour: u32,
    pub scripture_minute: u32,
    pub scripture_spacing: Duration,
    pub broadcast_spacing: Duration,

    // Knowledge defaults
    pub group_name: String,
    pub group_about: String,

    // Telegram limits
    pub telegram_message_limit: usize,
}

impl Config {
    /// Defaults for everything except the two required values.
    pub fn new(telegram_bot_token: impl Into<String>, admin_id: UserId) -> Self {
        Self {
            telegram_bot_token: telegram_bot_token.into(),
            admin_id,
            groq_api_key: None,
            groq_model: "llama-3.3-70b-versatile".to_string(),
            data_dir: PathBuf::from("data"),
            bridge_path: PathBuf::from("wa-bridge"),
            bridge_args: Vec::new(),
            operator_session_enabled: true,
            user_reconnect_delay: Duration::from_secs(5),
            operator_reconnect_delay: Duration::from_secs(10),
            reconnect_max_retries: None,
            reconnect_jitter: Duration::ZERO,
            analysis_every: 10,
            min_analysis_messages: 10,
            analysis_window: 20,
            min_sweep_messages: 5,
            nudge_at_message: 3,
            history_window: 10,
            scripture_hour: 7,
            scripture_minute: 0,
            scripture_spacing: Duration::from_secs(2),
            broadcast_spacing: Duration::from_millis(100),
            group_name: "Ensign of God's Glory".to_string(),
            group_about: "A community of believers growing together in faith and purpose"
                .to_string(),
            telegram_message_limit: 4096,
        }
    }

    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        // Required env vars
        let telegram_bot_token = env_str("TELEGRAM_TOKEN")
            .or_else(|| env_str("TELEGRAM_BOT_TOKEN"))
            .unwrap_or_default();
        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_TOKEN environment variable is required".to_string(),
            ));
        }

        let admin_id = env_str("ADMIN_ID")
            .and_then(|s| s.trim().parse::<i64>().ok())
            .map(UserId)
            .ok_or_else(|| {
                Error::Config("ADMIN_ID environment variable is required".to_string())
            })?;

        let mut cfg = Self::new(telegram_bot_token, admin_id);

        // Optional providers
        cfg.groq_api_key = env_str("GROQ_API_KEY").and_then(non_empty);
        if let Some(model) = env_str("GROQ_MODEL").and_then(non_empty) {
            cfg.groq_model = model;
        }
        if let Some(dir) = env_path("DATA_DIR") {
            cfg.data_dir = dir;
        }
        fs::create_dir_all(&cfg.data_dir)?;

        // Bridge
        if let Some(p) = env_path("BRIDGE_PATH") {
            cfg.bridge_path = p;
        }
        cfg.bridge_args = env_str("BRIDGE_ARGS")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        cfg.operator_session_enabled = env_bool("OPERATOR_SESSION_ENABLED").unwrap_or(true);

        // Reconnect policy
        if let Some(ms) = env_u64("USER_RECONNECT_DELAY_MS") {
            cfg.user_reconnect_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("OPERATOR_RECONNECT_DELAY_MS") {
            cfg.operator_reconnect_delay = Duration::from_millis(ms);
        }
        cfg.reconnect_max_retries = env_u32("RECONNECT_MAX_RETRIES");
        if let Some(ms) = env_u64("RECONNECT_JITTER_MS") {
            cfg.reconnect_jitter = Duration::from_millis(ms);
        }

        // Triggers
        if let Some(v) = env_usize("ANALYSIS_EVERY") {
            cfg.analysis_every = v.max(1);
        }
        if let Some(v) = env_usize("MIN_ANALYSIS_MESSAGES") {
            cfg.min_analysis_messages = v;
        }
        if let Some(v) = env_usize("ANALYSIS_WINDOW") {
            cfg.analysis_window = v.max(1);
        }
        if let Some(v) = env_usize("MIN_SWEEP_MESSAGES") {
            cfg.min_sweep_messages = v;
        }
        if let Some(v) = env_u64("NUDGE_AT_MESSAGE") {
            cfg.nudge_at_message = v;
        }
        if let Some(v) = env_usize("HISTORY_WINDOW") {
            cfg.history_window = v;
        }

        // Scheduled delivery
        cfg.scripture_hour = env_u32("SCRIPTURE_HOUR").unwrap_or(7).min(23);
        cfg.scripture_minute = env_u32("SCRIPTURE_MINUTE").unwrap_or(0).min(59);
        if let Some(ms) = env_u64("SCRIPTURE_SPACING_MS") {
            cfg.scripture_spacing = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("BROADCAST_SPACING_MS") {
            cfg.broadcast_spacing = Duration::from_millis(ms);
        }

        if let Some(name) = env_str("GROUP_NAME").and_then(non_empty) {
            cfg.group_name = name;
        }
        if let Some(about) = env_str("GROUP_ABOUT").and_then(non_empty) {
            cfg.group_about = about;
        }
        if let Some(limit) = env_usize("TELEGRAM_MESSAGE_LIMIT") {
            cfg.telegram_message_limit = limit;
        }

        Ok(cfg)
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        user == self.admin_id
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        env::set_var(key, strip_quotes(v.trim()));
    }
}

fn strip_quotes(val: &str) -> &str {
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return &val[1..val.len() - 1];
    }
    val
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
