//! Hand-written fakes for the ports, shared by the unit tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{ChatAction, MessagingCapabilities},
    },
    model::{
        client::LanguageModel,
        types::{ChatTurn, Role, Sampling},
    },
    pairing::ChallengeRenderer,
    protocol::{ConnectSpec, ProtocolConnection, ProtocolConnector, ProtocolEvent},
    Result,
};

// ============== Messenger ==============

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sent {
    Html(ChatId, String),
    Photo(ChatId, Option<String>),
    Document(ChatId, String),
    Action(ChatId, ChatAction),
}

#[derive(Default)]
pub struct FakeMessenger {
    pub sent: Mutex<Vec<Sent>>,
    pub fail_photos: AtomicBool,
    pub fail_documents: AtomicBool,
    pub failing_chats: Mutex<HashSet<i64>>,
    next_id: AtomicU32,
}

impl FakeMessenger {
    pub fn fail_chat(&self, chat: ChatId) {
        self.failing_chats.lock().unwrap().insert(chat.0);
    }

    pub fn recover_chat(&self, chat: ChatId) {
        self.failing_chats.lock().unwrap().remove(&chat.0);
    }

    pub fn all(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn html_to(&self, chat: ChatId) -> Vec<String> {
        self.all()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Html(c, t) if c == chat => Some(t),
                _ => None,
            })
            .collect()
    }

    pub fn photos_to(&self, chat: ChatId) -> usize {
        self.all()
            .iter()
            .filter(|s| matches!(s, Sent::Photo(c, _) if *c == chat))
            .count()
    }

    pub fn documents_to(&self, chat: ChatId) -> usize {
        self.all()
            .iter()
            .filter(|s| matches!(s, Sent::Document(c, _) if *c == chat))
            .count()
    }

    fn check_chat(&self, chat: ChatId) -> Result<()> {
        if self.failing_chats.lock().unwrap().contains(&chat.0) {
            return Err(Error::Delivery(format!("chat {} unreachable", chat.0)));
        }
        Ok(())
    }

    fn record(&self, chat: ChatId, sent: Sent) -> MessageRef {
        self.sent.lock().unwrap().push(sent);
        MessageRef {
            chat_id: chat,
            message_id: MessageId(self.next_id.fetch_add(1, Ordering::SeqCst) as i32),
        }
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities::default()
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        self.check_chat(chat_id)?;
        Ok(self.record(chat_id, Sent::Html(chat_id, html.to_string())))
    }

    async fn send_photo(
        &self,
        chat_id: ChatId,
        _png: &[u8],
        caption_html: Option<&str>,
    ) -> Result<MessageRef> {
        self.check_chat(chat_id)?;
        if self.fail_photos.load(Ordering::SeqCst) {
            return Err(Error::Delivery("photo rejected".to_string()));
        }
        Ok(self.record(chat_id, Sent::Photo(chat_id, caption_html.map(str::to_string))))
    }

    async fn send_document(
        &self,
        chat_id: ChatId,
        _bytes: &[u8],
        file_name: &str,
        _caption_html: Option<&str>,
    ) -> Result<MessageRef> {
        self.check_chat(chat_id)?;
        if self.fail_documents.load(Ordering::SeqCst) {
            return Err(Error::Delivery("document rejected".to_string()));
        }
        Ok(self.record(chat_id, Sent::Document(chat_id, file_name.to_string())))
    }

    async fn send_chat_action(&self, chat_id: ChatId, action: ChatAction) -> Result<()> {
        self.record(chat_id, Sent::Action(chat_id, action));
        Ok(())
    }
}

// ============== Model ==============

/// Answers by call kind; classification verdicts are keyed by subject.
pub struct FakeModel {
    pub reply: Mutex<String>,
    pub summary: String,
    pub verdicts: Mutex<HashMap<String, String>>,
    pub fail: AtomicBool,
    pub calls: Mutex<Vec<(Sampling, Vec<ChatTurn>)>>,
}

impl Default for FakeModel {
    fn default() -> Self {
        Self {
            reply: Mutex::new("reply".to_string()),
            summary: "summary".to_string(),
            verdicts: Mutex::new(HashMap::new()),
            fail: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeModel {
    pub fn set_verdict(&self, subject: &str, verdict: &str) {
        self.verdicts
            .lock()
            .unwrap()
            .insert(subject.to_string(), verdict.to_string());
    }

    pub fn calls_of(&self, sampling: Sampling) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == sampling)
            .count()
    }
}

#[async_trait]
impl LanguageModel for FakeModel {
    async fn chat(&self, messages: Vec<ChatTurn>, sampling: Sampling) -> Result<String> {
        self.calls.lock().unwrap().push((sampling, messages.clone()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::External("model unavailable".to_string()));
        }
        if sampling == Sampling::ANALYSIS {
            return Ok(self.summary.clone());
        }
        if sampling == Sampling::CLASSIFY {
            let system = messages
                .iter()
                .find(|m| m.role == Role::System)
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let verdicts = self.verdicts.lock().unwrap();
            let verdict = verdicts
                .iter()
                .find(|(subject, _)| system.contains(&format!("{subject}'s")))
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| "NO_PROBLEM".to_string());
            return Ok(verdict);
        }
        Ok(self.reply.lock().unwrap().clone())
    }
}

// ============== Renderer ==============

pub struct FakeRenderer;

impl ChallengeRenderer for FakeRenderer {
    fn render_png(&self, challenge: &str) -> Result<Vec<u8>> {
        let mut out = b"\x89PNG".to_vec();
        out.extend_from_slice(challenge.as_bytes());
        Ok(out)
    }
}

// ============== Protocol ==============

/// Every `open` hands out a connection fed by a channel the test can drive.
#[derive(Default)]
pub struct FakeConnector {
    pub opens: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    pub logouts: Arc<AtomicUsize>,
    pub fail_opens: AtomicUsize,
    pub specs: Mutex<Vec<ConnectSpec>>,
    feeds: Mutex<Vec<mpsc::UnboundedSender<ProtocolEvent>>>,
}

impl FakeConnector {
    /// Push an event into the most recently opened connection.
    pub fn emit(&self, ev: ProtocolEvent) {
        let feeds = self.feeds.lock().unwrap();
        if let Some(tx) = feeds.last() {
            let _ = tx.send(ev);
        }
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProtocolConnector for FakeConnector {
    async fn open(&self, spec: ConnectSpec) -> Result<Box<dyn ProtocolConnection>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().unwrap().push(spec);
        if self
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Connection("bridge failed to start".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds.lock().unwrap().push(tx);
        Ok(Box::new(FakeConnection {
            rx,
            closed: false,
            closes: self.closes.clone(),
            logouts: self.logouts.clone(),
        }))
    }
}

pub struct FakeConnection {
    rx: mpsc::UnboundedReceiver<ProtocolEvent>,
    closed: bool,
    closes: Arc<AtomicUsize>,
    logouts: Arc<AtomicUsize>,
}

#[async_trait]
impl ProtocolConnection for FakeConnection {
    async fn next_event(&mut self) -> Option<ProtocolEvent> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn logout(&mut self) -> Result<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        self.close().await
    }
}
