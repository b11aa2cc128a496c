//! Protocol bridge adapter.
//!
//! Each session attempt spawns the bridge program and talks NDJSON with it:
//! one init line on stdin, then one event per stdout line.

use std::{collections::VecDeque, path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::Mutex,
};

use relay_core::{
    errors::Error,
    protocol::{
        CloseReason, ConnectSpec, MessageContent, ProtocolConnection, ProtocolConnector,
        ProtocolEvent, RawMessage,
    },
    utils::truncate_text,
    Result,
};

const STDERR_TAIL_MAX_BYTES: usize = 8 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 100;
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const LOGOUT_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            match self.lines.pop_front() {
                Some(front) => self.bytes = self.bytes.saturating_sub(front.len() + 1),
                None => break,
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

/// Spawns `program args...` once per connection.
#[derive(Clone, Debug)]
pub struct BridgeConnector {
    program: PathBuf,
    args: Vec<String>,
}

impl BridgeConnector {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl ProtocolConnector for BridgeConnector {
    async fn open(&self, spec: ConnectSpec) -> Result<Box<dyn ProtocolConnection>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Connection(format!(
                    "failed to start bridge {}: {e}",
                    self.program.display()
                ))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Connection("bridge stdout was not captured".to_string()))?;
        let stdin = child.stdin.take();
        let stderr_tail = Arc::new(Mutex::new(StderrTail::default()));

        // Drain stderr so the bridge never blocks on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let tail = stderr_tail.clone();
            let label = spec.label.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    tracing::debug!(session = %label, "bridge: {line}");
                    tail.lock().await.push_line(line);
                }
            });
        }

        let mut conn = BridgeConnection {
            label: spec.label.clone(),
            child: Some(child),
            stdin,
            lines: BufReader::new(stdout).lines(),
            stderr_tail,
            saw_close: false,
            ended: false,
        };

        let init = json!({
            "type": "init",
            "label": spec.label,
            "credentials": spec.credentials,
            "syncFullHistory": spec.sync_full_history,
        });
        if let Err(e) = conn.write_line(&init).await {
            if let Err(close_err) = conn.close().await {
                tracing::warn!(session = %conn.label, error = %close_err, "bridge cleanup failed");
            }
            return Err(Error::Connection(format!("bridge rejected init: {e}")));
        }

        tracing::debug!(session = %conn.label, "bridge started");
        Ok(Box::new(conn))
    }
}

pub struct BridgeConnection {
    label: String,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    lines: Lines<BufReader<ChildStdout>>,
    stderr_tail: Arc<Mutex<StderrTail>>,
    saw_close: bool,
    ended: bool,
}

impl BridgeConnection {
    async fn write_line(&mut self, value: &Value) -> Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(Error::Connection("bridge stdin is closed".to_string()));
        };
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Close event synthesized when the bridge stops without reporting why.
    async fn exit_event(&mut self, detail: String) -> Option<ProtocolEvent> {
        self.ended = true;
        if self.saw_close {
            return None;
        }
        self.saw_close = true;
        let stderr = self.stderr_tail.lock().await.snapshot();
        let mut reason = detail;
        if !stderr.trim().is_empty() {
            reason.push_str(&format!(
                "\nstderr (tail):\n{}",
                truncate_text(&stderr, 500)
            ));
        }
        Some(ProtocolEvent::Closed(CloseReason::Other(reason)))
    }

    async fn wait_or_kill(&mut self, grace: Duration) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return Ok(());
        }
        tracing::debug!(session = %self.label, "bridge did not exit in time; killing");
        match child.kill().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if child.try_wait()?.is_none() {
                    self.child = Some(child);
                    return Err(Error::Io(e));
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ProtocolConnection for BridgeConnection {
    async fn next_event(&mut self) -> Option<ProtocolEvent> {
        if self.ended {
            return None;
        }
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return self.exit_event("bridge exited".to_string()).await,
                Err(e) => return self.exit_event(format!("bridge stdout read failed: {e}")).await,
            };
            if line.trim().is_empty() {
                continue;
            }
            match parse_event(&line) {
                Ok(Some(ev)) => {
                    if matches!(ev, ProtocolEvent::Closed(_)) {
                        self.saw_close = true;
                    }
                    return Some(ev);
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(
                        session = %self.label,
                        error = %e,
                        line = %truncate_text(&line, 200),
                        "unparseable bridge line"
                    );
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if self.child.is_none() {
            return Ok(());
        }
        if self.stdin.is_some() {
            // The bridge may already be gone.
            if let Err(e) = self.write_line(&json!({ "type": "close" })).await {
                tracing::debug!(session = %self.label, error = %e, "close not sent to bridge");
            }
        }
        self.stdin = None;
        self.ended = true;
        self.wait_or_kill(CLOSE_GRACE).await
    }

    async fn logout(&mut self) -> Result<()> {
        if self.child.is_none() {
            return Ok(());
        }
        if let Err(e) = self.write_line(&json!({ "type": "logout" })).await {
            tracing::warn!(session = %self.label, error = %e, "logout not sent to bridge");
        }
        self.stdin = None;
        self.ended = true;
        self.wait_or_kill(LOGOUT_GRACE).await
    }
}

// ============== Wire format ==============

/// Parse one stdout line. Unknown event types yield `Ok(None)`.
pub fn parse_event(line: &str) -> Result<Option<ProtocolEvent>> {
    let value: Value = serde_json::from_str(line)?;
    let ev = match value.get("type").and_then(Value::as_str) {
        Some("qr") => value
            .get("qr")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| ProtocolEvent::ChallengeIssued(s.to_string())),
        Some("open") => Some(ProtocolEvent::Paired),
        Some("creds") => Some(ProtocolEvent::CredentialsUpdated(
            value.get("creds").cloned().unwrap_or(Value::Null),
        )),
        Some("message") => value
            .get("message")
            .and_then(parse_message)
            .map(ProtocolEvent::MessageReceived),
        Some("close") => Some(ProtocolEvent::Closed(parse_close(&value))),
        _ => None,
    };
    Ok(ev)
}

fn parse_message(v: &Value) -> Option<RawMessage> {
    let key = v.get("key")?;
    let chat_id = key.get("remoteJid").and_then(Value::as_str)?.to_string();
    let text_at = |path: &[&str]| -> Option<String> {
        let mut cur = v.get("message")?;
        for p in path {
            cur = cur.get(p)?;
        }
        cur.as_str().map(str::to_string)
    };

    let content = match v.get("message") {
        Some(m) if m.is_object() => Some(MessageContent {
            conversation: text_at(&["conversation"]),
            extended_text: text_at(&["extendedTextMessage", "text"]),
            image_caption: text_at(&["imageMessage", "caption"]),
        }),
        _ => None,
    };

    Some(RawMessage {
        id: key.get("id").and_then(Value::as_str).map(str::to_string),
        chat_id,
        from_me: key.get("fromMe").and_then(Value::as_bool).unwrap_or(false),
        content,
    })
}

fn parse_close(v: &Value) -> CloseReason {
    let reason = v.get("reason").and_then(Value::as_str);
    let status = v.get("statusCode").and_then(Value::as_u64);
    if reason == Some("logged_out") || status == Some(401) {
        return CloseReason::LoggedOut;
    }
    let text = match (reason, status) {
        (Some(r), Some(s)) => format!("{r} (status {s})"),
        (Some(r), None) => r.to_string(),
        (None, Some(s)) => format!("status {s}"),
        (None, None) => "connection closed".to_string(),
    };
    CloseReason::Other(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lifecycle_events() {
        assert_eq!(
            parse_event(r#"{"type":"qr","qr":"2@abc"}"#).unwrap(),
            Some(ProtocolEvent::ChallengeIssued("2@abc".to_string()))
        );
        assert_eq!(
            parse_event(r#"{"type":"open"}"#).unwrap(),
            Some(ProtocolEvent::Paired)
        );
        assert_eq!(
            parse_event(r#"{"type":"creds","creds":{"me":{"id":"1"}}}"#).unwrap(),
            Some(ProtocolEvent::CredentialsUpdated(json!({"me": {"id": "1"}})))
        );
        assert_eq!(parse_event(r#"{"type":"presence"}"#).unwrap(), None);
        assert!(parse_event("not json").is_err());
    }

    #[test]
    fn close_maps_logged_out_by_reason_or_status() {
        let ev = |s: &str| match parse_event(s).unwrap() {
            Some(ProtocolEvent::Closed(r)) => r,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(ev(r#"{"type":"close","reason":"logged_out"}"#), CloseReason::LoggedOut);
        assert_eq!(ev(r#"{"type":"close","statusCode":401}"#), CloseReason::LoggedOut);
        assert_eq!(
            ev(r#"{"type":"close","reason":"connection_lost","statusCode":408}"#),
            CloseReason::Other("connection_lost (status 408)".to_string())
        );
        assert_eq!(
            ev(r#"{"type":"close"}"#),
            CloseReason::Other("connection closed".to_string())
        );
    }

    #[test]
    fn message_reads_key_and_text_fields() {
        let line = r#"{"type":"message","message":{
            "key":{"id":"ABC","remoteJid":"15550001@s.whatsapp.net","fromMe":true},
            "message":{"extendedTextMessage":{"text":"see you"}}}}"#
            .replace('\n', "");
        let Some(ProtocolEvent::MessageReceived(raw)) = parse_event(&line).unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(raw.id.as_deref(), Some("ABC"));
        assert_eq!(raw.chat_id, "15550001@s.whatsapp.net");
        assert!(raw.from_me);
        assert_eq!(raw.content.unwrap().text(), Some("see you"));
    }

    #[test]
    fn stub_message_has_no_content() {
        let line = r#"{"type":"message","message":{"key":{"id":"X","remoteJid":"1@s.whatsapp.net"},"message":null}}"#;
        let Some(ProtocolEvent::MessageReceived(raw)) = parse_event(line).unwrap() else {
            panic!("expected a message");
        };
        assert!(raw.content.is_none());
        assert!(!raw.from_me);
    }

    #[test]
    fn stderr_tail_keeps_the_most_recent_lines() {
        let mut tail = StderrTail::default();
        for i in 0..(STDERR_TAIL_MAX_LINES + 5) {
            tail.push_line(format!("line {i}"));
        }
        assert_eq!(tail.lines.len(), STDERR_TAIL_MAX_LINES);
        assert!(tail.snapshot().ends_with(&format!("line {}", STDERR_TAIL_MAX_LINES + 4)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawned_bridge_streams_events_then_reports_exit() {
        let script = r#"read init; echo '{"type":"qr","qr":"abc"}'; echo '{"type":"open"}'"#;
        let connector = BridgeConnector::new("sh", vec!["-c".to_string(), script.to_string()]);
        let mut conn = connector
            .open(ConnectSpec {
                label: "test".to_string(),
                credentials: None,
                sync_full_history: false,
            })
            .await
            .unwrap();

        assert_eq!(
            conn.next_event().await,
            Some(ProtocolEvent::ChallengeIssued("abc".to_string()))
        );
        assert_eq!(conn.next_event().await, Some(ProtocolEvent::Paired));
        assert!(matches!(
            conn.next_event().await,
            Some(ProtocolEvent::Closed(CloseReason::Other(_)))
        ));
        assert_eq!(conn.next_event().await, None);
        conn.close().await.unwrap();
    }
}
