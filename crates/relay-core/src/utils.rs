use chrono::{Local, Utc};

// ============== Timestamp Helpers ==============

/// RFC3339 timestamp in UTC (persisted records, insights).
pub fn iso_timestamp_utc() -> String {
    Utc::now().to_rfc3339()
}

/// Human-readable local timestamp for operator notifications.
pub fn local_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

// ============== Text Helpers ==============

/// Truncate to `max_chars` characters, appending `...` when shortened.
pub fn truncate_text(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out = s.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}

/// Split `/cmd@bot rest of line` into (`cmd`, `rest of line`).
pub fn parse_command(text: &str) -> (String, String) {
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}
