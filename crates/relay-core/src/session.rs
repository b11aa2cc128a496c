//! Protocol session lifecycle.
//!
//! Each session key (a user, or the operator) gets one actor task. The actor
//! owns the live connection, the pending reconnect deadline and a
//! [`SessionMachine`]; every command and protocol event becomes a
//! [`SessionInput`], the machine turns it into [`SessionEffect`]s and the actor
//! applies them in order. Transitions for one key are therefore serialized,
//! while different keys run independently.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    domain::{SessionKey, SessionStatus},
    ingest::{IngestionPipeline, SessionProfile},
    pairing::PairingCoordinator,
    protocol::{CloseReason, ConnectSpec, ProtocolConnection, ProtocolConnector, ProtocolEvent, RawMessage},
    reconnect::{ReconnectDecision, ReconnectPolicy, TerminalReason},
    records::{UserRegistryDoc, USERS_KEY},
    store::Documents,
    triggers::SessionControl,
    Result,
};

// ============== State machine ==============

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disconnect {
    Retryable,
    Terminal(TerminalReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unpaired,
    Pairing,
    Active,
    Disconnected(Disconnect),
}

impl SessionState {
    pub fn label(self) -> &'static str {
        match self {
            SessionState::Unpaired => "unpaired",
            SessionState::Pairing => "pairing",
            SessionState::Active => "active",
            SessionState::Disconnected(Disconnect::Retryable) => "reconnecting",
            SessionState::Disconnected(Disconnect::Terminal(_)) => "disconnected",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionInput {
    /// Explicit start: new attempt, status goes to `pairing`.
    Start,
    /// Boot-time restart of a session that was active; status untouched.
    Resume,
    RetryElapsed,
    Logout,
    ChallengeIssued(String),
    ChallengeDelivered,
    ChallengeDeliveryFailed,
    Paired,
    CredentialsUpdated(serde_json::Value),
    MessageReceived(RawMessage),
    Closed(CloseReason),
    OpenFailed(String),
}

impl From<ProtocolEvent> for SessionInput {
    fn from(ev: ProtocolEvent) -> Self {
        match ev {
            ProtocolEvent::ChallengeIssued(c) => SessionInput::ChallengeIssued(c),
            ProtocolEvent::Paired => SessionInput::Paired,
            ProtocolEvent::CredentialsUpdated(v) => SessionInput::CredentialsUpdated(v),
            ProtocolEvent::MessageReceived(m) => SessionInput::MessageReceived(m),
            ProtocolEvent::Closed(r) => SessionInput::Closed(r),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEffect {
    CancelRetry,
    Teardown { logout: bool },
    Open { attempt: u64 },
    DeliverChallenge { attempt: u64, challenge: String },
    PersistCredentials(serde_json::Value),
    ClearCredentials,
    MarkStatus(SessionStatus),
    NotifyPaired { fresh: bool },
    NotifyTerminal(TerminalReason),
    Ingest(RawMessage),
    ScheduleRetry { delay: Duration },
}

/// Pure transition function for one session key.
#[derive(Clone, Debug)]
pub struct SessionMachine {
    key: SessionKey,
    state: SessionState,
    attempt: u64,
    retry_count: u32,
    challenge_sent: bool,
    challenge_delivered: bool,
    policy: ReconnectPolicy,
}

impl SessionMachine {
    pub fn new(key: SessionKey, policy: ReconnectPolicy) -> Self {
        Self {
            key,
            state: SessionState::Unpaired,
            attempt: 0,
            retry_count: 0,
            challenge_sent: false,
            challenge_delivered: false,
            policy,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Nothing left to do until someone starts the session again.
    pub fn is_settled(&self) -> bool {
        matches!(
            self.state,
            SessionState::Unpaired | SessionState::Disconnected(Disconnect::Terminal(_))
        )
    }

    fn is_live(&self) -> bool {
        matches!(self.state, SessionState::Pairing | SessionState::Active)
    }

    fn next_attempt(&mut self) -> u64 {
        self.attempt += 1;
        self.challenge_sent = false;
        self.challenge_delivered = false;
        self.state = SessionState::Pairing;
        self.attempt
    }

    pub fn handle(&mut self, input: SessionInput) -> Vec<SessionEffect> {
        use SessionEffect as E;

        match input {
            SessionInput::Start => {
                let mut fx = self.restart();
                fx.push(E::MarkStatus(SessionStatus::Pairing));
                fx
            }
            SessionInput::Resume => self.restart(),
            SessionInput::RetryElapsed => {
                if self.state != SessionState::Disconnected(Disconnect::Retryable) {
                    return Vec::new();
                }
                let attempt = self.next_attempt();
                vec![E::Open { attempt }]
            }
            SessionInput::Logout => {
                let was_running =
                    self.is_live() || self.state == SessionState::Disconnected(Disconnect::Retryable);
                self.state = SessionState::Disconnected(Disconnect::Terminal(TerminalReason::Requested));
                let mut fx = vec![
                    E::CancelRetry,
                    E::Teardown { logout: true },
                    E::ClearCredentials,
                    E::MarkStatus(SessionStatus::Disconnected),
                ];
                if was_running {
                    fx.push(E::NotifyTerminal(TerminalReason::Requested));
                }
                fx
            }
            SessionInput::ChallengeIssued(challenge) => {
                if self.state != SessionState::Pairing || self.challenge_sent {
                    return Vec::new();
                }
                self.challenge_sent = true;
                vec![E::DeliverChallenge {
                    attempt: self.attempt,
                    challenge,
                }]
            }
            SessionInput::ChallengeDelivered => {
                if self.state == SessionState::Pairing {
                    self.challenge_delivered = true;
                }
                Vec::new()
            }
            SessionInput::ChallengeDeliveryFailed => {
                if self.state != SessionState::Pairing {
                    return Vec::new();
                }
                self.state = SessionState::Unpaired;
                vec![
                    E::Teardown { logout: false },
                    E::MarkStatus(SessionStatus::Unpaired),
                ]
            }
            SessionInput::Paired => {
                if self.state != SessionState::Pairing {
                    return Vec::new();
                }
                self.state = SessionState::Active;
                self.retry_count = 0;
                vec![
                    E::MarkStatus(SessionStatus::Active),
                    E::NotifyPaired {
                        fresh: self.challenge_delivered,
                    },
                ]
            }
            SessionInput::CredentialsUpdated(bundle) => {
                if !self.is_live() {
                    return Vec::new();
                }
                vec![E::PersistCredentials(bundle)]
            }
            SessionInput::MessageReceived(raw) => {
                if self.state != SessionState::Active || self.key.user().is_none() {
                    return Vec::new();
                }
                vec![E::Ingest(raw)]
            }
            SessionInput::Closed(reason) => self.on_closed(reason),
            SessionInput::OpenFailed(msg) => self.on_closed(CloseReason::Other(msg)),
        }
    }

    fn restart(&mut self) -> Vec<SessionEffect> {
        self.retry_count = 0;
        let attempt = self.next_attempt();
        vec![
            SessionEffect::CancelRetry,
            SessionEffect::Teardown { logout: false },
            SessionEffect::Open { attempt },
        ]
    }

    fn on_closed(&mut self, reason: CloseReason) -> Vec<SessionEffect> {
        use SessionEffect as E;

        if !self.is_live() {
            return Vec::new();
        }
        match self.policy.decide(&reason, self.retry_count) {
            ReconnectDecision::Terminal(why) => {
                self.state = SessionState::Disconnected(Disconnect::Terminal(why));
                let mut fx = vec![E::Teardown { logout: false }];
                if why == TerminalReason::LoggedOut {
                    fx.push(E::ClearCredentials);
                }
                fx.push(E::MarkStatus(SessionStatus::Disconnected));
                fx.push(E::NotifyTerminal(why));
                fx
            }
            ReconnectDecision::Retry { delay } => {
                self.retry_count += 1;
                self.state = SessionState::Disconnected(Disconnect::Retryable);
                vec![E::Teardown { logout: false }, E::ScheduleRetry { delay }]
            }
        }
    }
}

// ============== Actor ==============

/// Point-in-time view of a session, published by its actor.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub state: SessionState,
    pub attempt: u64,
    pub retry_count: u32,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Collaborators shared by every session actor.
pub struct SessionDeps {
    pub cfg: Arc<Config>,
    pub docs: Documents,
    pub connector: Arc<dyn ProtocolConnector>,
    pub pairing: Arc<PairingCoordinator>,
    pub ingest: Arc<IngestionPipeline>,
}

#[derive(Debug)]
enum SessionCommand {
    Start { display_name: String, resume: bool },
    Logout,
}

struct SessionActor {
    machine: SessionMachine,
    deps: Arc<SessionDeps>,
    display_name: String,
    conn: Option<Box<dyn ProtocolConnection>>,
    retry_at: Option<Instant>,
    last_activity: Option<DateTime<Utc>>,
    rx: mpsc::UnboundedReceiver<SessionCommand>,
    snapshot: watch::Sender<SessionSnapshot>,
    cancel: CancellationToken,
    registry: Weak<RegistryInner>,
    generation: u64,
}

async fn next_event(conn: &mut Option<Box<dyn ProtocolConnection>>) -> Option<ProtocolEvent> {
    match conn {
        Some(c) => c.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl SessionActor {
    fn key(&self) -> SessionKey {
        self.machine.key
    }

    async fn run(mut self) {
        tracing::debug!(key = %self.key(), generation = self.generation, "session actor started");
        while let Some(input) = self.next_input().await {
            self.dispatch(input).await;
            if self.machine.is_settled() && self.try_retire() {
                break;
            }
        }
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                tracing::warn!(key = %self.key(), error = %e, "close on exit failed");
            }
        }
        self.deps.pairing.resolve(self.key());
        tracing::debug!(key = %self.key(), "session actor stopped");
    }

    async fn next_input(&mut self) -> Option<SessionInput> {
        let Self {
            machine,
            rx,
            conn,
            retry_at,
            cancel,
            display_name,
            ..
        } = self;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            cmd = rx.recv() => match cmd? {
                SessionCommand::Start { display_name: name, resume } => {
                    if !name.is_empty() {
                        *display_name = name;
                    }
                    Some(if resume { SessionInput::Resume } else { SessionInput::Start })
                }
                SessionCommand::Logout => Some(SessionInput::Logout),
            },
            ev = next_event(conn) => match ev {
                Some(ev) => Some(ev.into()),
                None => {
                    if let Some(mut c) = conn.take() {
                        if let Err(e) = c.close().await {
                            tracing::warn!(key = %machine.key, error = %e, "close after stream end failed");
                        }
                    }
                    Some(SessionInput::Closed(CloseReason::Other("event stream ended".to_string())))
                }
            },
            _ = sleep_until_opt(*retry_at) => {
                *retry_at = None;
                Some(SessionInput::RetryElapsed)
            }
        }
    }

    async fn dispatch(&mut self, input: SessionInput) {
        let mut queue = VecDeque::from([input]);
        while let Some(input) = queue.pop_front() {
            if matches!(input, SessionInput::MessageReceived(_)) {
                self.last_activity = Some(Utc::now());
            }
            for effect in self.machine.handle(input) {
                if let Some(follow_up) = self.apply(effect).await {
                    queue.push_back(follow_up);
                }
            }
        }
        self.publish();
    }

    fn publish(&self) {
        let snap = SessionSnapshot {
            key: self.key(),
            state: self.machine.state(),
            attempt: self.machine.attempt(),
            retry_count: self.machine.retry_count(),
            last_activity: self.last_activity,
        };
        self.snapshot.send_replace(snap);
    }

    async fn apply(&mut self, effect: SessionEffect) -> Option<SessionInput> {
        let key = self.key();
        match effect {
            SessionEffect::CancelRetry => {
                self.retry_at = None;
            }
            SessionEffect::Teardown { logout } => {
                if let Some(mut conn) = self.conn.take() {
                    let res = if logout {
                        conn.logout().await
                    } else {
                        conn.close().await
                    };
                    if let Err(e) = res {
                        tracing::warn!(%key, error = %e, "connection teardown failed");
                    }
                }
            }
            SessionEffect::Open { attempt } => {
                self.deps.pairing.begin(key, attempt);
                let spec = ConnectSpec {
                    label: client_label(key),
                    credentials: load_credentials(&self.deps.docs, key).await,
                    sync_full_history: false,
                };
                match self.deps.connector.open(spec).await {
                    Ok(conn) => {
                        tracing::info!(%key, attempt, "protocol connection opened");
                        self.conn = Some(conn);
                    }
                    Err(e) => {
                        tracing::warn!(%key, attempt, error = %e, "protocol connection failed to open");
                        return Some(SessionInput::OpenFailed(e.to_string()));
                    }
                }
            }
            SessionEffect::DeliverChallenge { attempt, challenge } => {
                return match self
                    .deps
                    .pairing
                    .issue_challenge(key, &self.display_name, attempt, &challenge)
                    .await
                {
                    Ok(true) => Some(SessionInput::ChallengeDelivered),
                    Ok(false) => None,
                    Err(e) => {
                        tracing::warn!(%key, attempt, error = %e, "pairing failed");
                        Some(SessionInput::ChallengeDeliveryFailed)
                    }
                };
            }
            SessionEffect::PersistCredentials(bundle) => {
                if let Err(e) = self.deps.docs.save(&key.credentials_key(), &bundle).await {
                    tracing::error!(%key, error = %e, "failed to persist credentials");
                }
            }
            SessionEffect::ClearCredentials => {
                if let Err(e) = self
                    .deps
                    .docs
                    .save(&key.credentials_key(), &serde_json::Value::Null)
                    .await
                {
                    tracing::error!(%key, error = %e, "failed to clear credentials");
                }
            }
            SessionEffect::MarkStatus(status) => {
                if let Some(user) = key.user() {
                    let res = self
                        .deps
                        .docs
                        .update(USERS_KEY, |reg: &mut UserRegistryDoc| {
                            if let Some(acc) = reg.get_mut(user) {
                                acc.session_status = status;
                            }
                        })
                        .await;
                    if let Err(e) = res {
                        tracing::error!(%key, status = status.as_str(), error = %e, "failed to record session status");
                    }
                }
            }
            SessionEffect::NotifyPaired { fresh } => {
                self.deps.pairing.resolve(key);
                tracing::info!(%key, "session paired");
                self.deps
                    .pairing
                    .announce_paired(key, &self.display_name, fresh)
                    .await;
            }
            SessionEffect::NotifyTerminal(reason) => {
                tracing::info!(%key, ?reason, "session ended");
                self.deps
                    .pairing
                    .announce_terminal(key, &self.display_name, reason)
                    .await;
            }
            SessionEffect::Ingest(raw) => {
                if let Some(user) = key.user() {
                    let profile = SessionProfile {
                        user,
                        display_name: self.display_name.clone(),
                    };
                    match self.deps.ingest.ingest(&profile, raw).await {
                        Ok(outcome) => tracing::debug!(%key, ?outcome, "message ingested"),
                        Err(e) => tracing::warn!(%key, error = %e, "message ingestion failed"),
                    }
                }
            }
            SessionEffect::ScheduleRetry { delay } => {
                tracing::info!(
                    %key,
                    retry = self.machine.retry_count(),
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                );
                self.retry_at = Some(Instant::now() + delay);
            }
        }
        None
    }

    /// Remove this actor from the registry if nothing is queued for it.
    fn try_retire(&self) -> bool {
        let Some(inner) = self.registry.upgrade() else {
            return true;
        };
        let Ok(mut actors) = inner.actors.lock() else {
            return false;
        };
        if !self.rx.is_empty() {
            return false;
        }
        if actors
            .get(&self.key())
            .is_some_and(|h| h.generation == self.generation)
        {
            actors.remove(&self.key());
        }
        true
    }
}

async fn load_credentials(docs: &Documents, key: SessionKey) -> Option<serde_json::Value> {
    let value: serde_json::Value = docs.load_or_default(&key.credentials_key()).await;
    (!value.is_null()).then_some(value)
}

fn client_label(key: SessionKey) -> String {
    match key {
        SessionKey::User(u) => format!("Relay user {u}"),
        SessionKey::Operator => "Relay operator".to_string(),
    }
}

// ============== Registry ==============

struct ActorHandle {
    tx: mpsc::UnboundedSender<SessionCommand>,
    snapshot: watch::Receiver<SessionSnapshot>,
    generation: u64,
    task: JoinHandle<()>,
}

struct RegistryInner {
    deps: Arc<SessionDeps>,
    actors: Mutex<HashMap<SessionKey, ActorHandle>>,
    generations: AtomicU64,
    cancel: CancellationToken,
}

/// Owns every live session actor, keyed by [`SessionKey`].
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                deps: Arc::new(deps),
                actors: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(1),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Begin a new pairing attempt, tearing down any live connection first.
    pub fn start(&self, key: SessionKey, display_name: &str) {
        self.send(
            key,
            SessionCommand::Start {
                display_name: display_name.to_string(),
                resume: false,
            },
        );
    }

    /// Reopen with stored credentials without touching the persisted status.
    pub fn resume(&self, key: SessionKey, display_name: &str) {
        self.send(
            key,
            SessionCommand::Start {
                display_name: display_name.to_string(),
                resume: true,
            },
        );
    }

    /// Unlink and stop the session; no reconnect follows.
    pub fn logout(&self, key: SessionKey) {
        self.send(key, SessionCommand::Logout);
    }

    fn send(&self, key: SessionKey, cmd: SessionCommand) {
        if self.inner.cancel.is_cancelled() {
            tracing::warn!(%key, "session registry is shut down");
            return;
        }
        let Ok(mut actors) = self.inner.actors.lock() else {
            tracing::error!(%key, "session registry lock poisoned");
            return;
        };

        let cmd = match actors.get(&key) {
            Some(handle) => match handle.tx.send(cmd) {
                Ok(()) => return,
                Err(mpsc::error::SendError(cmd)) => cmd,
            },
            None => cmd,
        };

        let handle = self.spawn_actor(key, cmd);
        actors.insert(key, handle);
    }

    fn spawn_actor(&self, key: SessionKey, first: SessionCommand) -> ActorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        // The receiver is alive; this cannot fail.
        let _ = tx.send(first);

        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst);
        let policy = ReconnectPolicy::for_class(&self.inner.deps.cfg, key.class());
        let machine = SessionMachine::new(key, policy);
        let (snap_tx, snap_rx) = watch::channel(SessionSnapshot {
            key,
            state: machine.state(),
            attempt: 0,
            retry_count: 0,
            last_activity: None,
        });

        let actor = SessionActor {
            machine,
            deps: Arc::clone(&self.inner.deps),
            display_name: String::new(),
            conn: None,
            retry_at: None,
            last_activity: None,
            rx,
            snapshot: snap_tx,
            cancel: self.inner.cancel.child_token(),
            registry: Arc::downgrade(&self.inner),
            generation,
        };
        let task = tokio::spawn(actor.run());

        ActorHandle {
            tx,
            snapshot: snap_rx,
            generation,
            task,
        }
    }

    pub fn snapshot(&self, key: SessionKey) -> Option<SessionSnapshot> {
        let actors = self.inner.actors.lock().ok()?;
        actors.get(&key).map(|h| h.snapshot.borrow().clone())
    }

    /// Snapshots of every live actor, operator first, then by user id.
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let Ok(actors) = self.inner.actors.lock() else {
            return Vec::new();
        };
        let mut out: Vec<SessionSnapshot> = actors
            .values()
            .map(|h| h.snapshot.borrow().clone())
            .collect();
        out.sort_by_key(|s| s.key.user().map(|u| u.0));
        out
    }

    /// Reopen every user session whose persisted status is `active`.
    pub async fn restore_active(&self) -> Result<usize> {
        let registry: UserRegistryDoc = self.inner.deps.docs.load(USERS_KEY).await?;
        let mut restored = 0usize;
        for acc in registry.users.values() {
            if acc.session_status == SessionStatus::Active {
                self.resume(SessionKey::User(acc.user_id()), &acc.display_name);
                restored += 1;
            }
        }
        if restored > 0 {
            tracing::info!(restored, "restoring active sessions");
        }
        Ok(restored)
    }

    /// Stop every actor and wait for their connections to close.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = match self.inner.actors.lock() {
            Ok(mut actors) => actors.drain().map(|(_, h)| h.task).collect(),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "session actor did not stop cleanly");
            }
        }
    }
}

impl SessionControl for SessionRegistry {
    fn start_session(&self, key: SessionKey, display_name: &str) {
        self.start(key, display_name);
    }

    fn logout_session(&self, key: SessionKey) {
        self.logout(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{ChatId, UserId},
        protocol::MessageContent,
        records::{conversation_key, ConversationLog, UserAccount},
        store::MemoryStore,
        test_support::{FakeConnector, FakeMessenger, FakeModel, FakeRenderer},
        triggers::TriggerDispatcher,
    };

    const ADMIN: UserId = UserId(1);
    const ANN: UserId = UserId(5);

    fn assert_send<T: Send>(_: &T) {}

    #[allow(dead_code)]
    fn actor_future_is_send(actor: SessionActor) {
        let fut = actor.run();
        assert_send(&fut);
    }

    // ---- pure machine ----

    fn machine(key: SessionKey) -> SessionMachine {
        SessionMachine::new(key, ReconnectPolicy::fixed(Duration::from_secs(5)))
    }

    #[test]
    fn start_tears_down_then_opens_next_attempt() {
        let mut m = machine(SessionKey::User(ANN));
        let fx = m.handle(SessionInput::Start);
        assert_eq!(
            fx,
            vec![
                SessionEffect::CancelRetry,
                SessionEffect::Teardown { logout: false },
                SessionEffect::Open { attempt: 1 },
                SessionEffect::MarkStatus(SessionStatus::Pairing),
            ]
        );
        let fx = m.handle(SessionInput::Resume);
        assert!(fx.contains(&SessionEffect::Open { attempt: 2 }));
        assert!(!fx.iter().any(|e| matches!(e, SessionEffect::MarkStatus(_))));
    }

    #[test]
    fn logout_reports_only_a_running_session() {
        let mut idle = machine(SessionKey::User(ANN));
        let fx = idle.handle(SessionInput::Logout);
        assert!(!fx.iter().any(|e| matches!(e, SessionEffect::NotifyTerminal(_))));

        let mut live = machine(SessionKey::User(ANN));
        live.handle(SessionInput::Start);
        live.handle(SessionInput::Paired);
        let fx = live.handle(SessionInput::Logout);
        assert_eq!(
            fx.last(),
            Some(&SessionEffect::NotifyTerminal(TerminalReason::Requested))
        );
        assert!(live.is_settled());
    }

    #[test]
    fn challenge_is_forwarded_once_per_attempt() {
        let mut m = machine(SessionKey::User(ANN));
        m.handle(SessionInput::Start);
        let first = m.handle(SessionInput::ChallengeIssued("a".into()));
        assert_eq!(first.len(), 1);
        assert!(m.handle(SessionInput::ChallengeIssued("b".into())).is_empty());
        assert!(m.handle(SessionInput::ChallengeIssued("c".into())).is_empty());

        m.handle(SessionInput::Start);
        assert_eq!(m.handle(SessionInput::ChallengeIssued("d".into())).len(), 1);
    }

    #[test]
    fn delivery_failure_returns_to_unpaired() {
        let mut m = machine(SessionKey::User(ANN));
        m.handle(SessionInput::Start);
        m.handle(SessionInput::ChallengeIssued("a".into()));
        let fx = m.handle(SessionInput::ChallengeDeliveryFailed);
        assert!(fx.contains(&SessionEffect::MarkStatus(SessionStatus::Unpaired)));
        assert_eq!(m.state(), SessionState::Unpaired);
        assert!(m.is_settled());
    }

    #[test]
    fn paired_notifies_user_only_after_delivered_challenge() {
        let mut m = machine(SessionKey::User(ANN));
        m.handle(SessionInput::Start);
        let fx = m.handle(SessionInput::Paired);
        assert!(fx.contains(&SessionEffect::NotifyPaired { fresh: false }));

        m.handle(SessionInput::Start);
        m.handle(SessionInput::ChallengeIssued("a".into()));
        m.handle(SessionInput::ChallengeDelivered);
        let fx = m.handle(SessionInput::Paired);
        assert!(fx.contains(&SessionEffect::NotifyPaired { fresh: true }));
        assert_eq!(m.state(), SessionState::Active);
    }

    #[test]
    fn messages_are_ingested_only_while_active() {
        let raw = RawMessage::default();
        let mut m = machine(SessionKey::User(ANN));
        m.handle(SessionInput::Start);
        assert!(m.handle(SessionInput::MessageReceived(raw.clone())).is_empty());
        m.handle(SessionInput::Paired);
        assert_eq!(m.handle(SessionInput::MessageReceived(raw.clone())).len(), 1);

        let mut op = machine(SessionKey::Operator);
        op.handle(SessionInput::Start);
        op.handle(SessionInput::Paired);
        assert!(op.handle(SessionInput::MessageReceived(raw)).is_empty());
    }

    #[test]
    fn closures_split_into_terminal_and_retryable() {
        let mut m = machine(SessionKey::User(ANN));
        m.handle(SessionInput::Start);
        m.handle(SessionInput::Paired);
        let fx = m.handle(SessionInput::Closed(CloseReason::Other("lost".into())));
        assert_eq!(
            fx,
            vec![
                SessionEffect::Teardown { logout: false },
                SessionEffect::ScheduleRetry {
                    delay: Duration::from_secs(5)
                }
            ]
        );
        assert_eq!(m.retry_count(), 1);
        // A stale close after the retry was scheduled changes nothing.
        assert!(m.handle(SessionInput::Closed(CloseReason::LoggedOut)).is_empty());

        m.handle(SessionInput::RetryElapsed);
        let fx = m.handle(SessionInput::Closed(CloseReason::LoggedOut));
        assert!(fx.contains(&SessionEffect::ClearCredentials));
        assert!(fx.contains(&SessionEffect::NotifyTerminal(TerminalReason::LoggedOut)));
        assert!(m.is_settled());
        assert!(m.handle(SessionInput::RetryElapsed).is_empty());
    }

    // ---- actor + registry ----

    struct Harness {
        docs: Documents,
        messenger: Arc<FakeMessenger>,
        connector: Arc<FakeConnector>,
        registry: SessionRegistry,
    }

    async fn harness() -> Harness {
        let cfg = Arc::new(Config::new("t", ADMIN));
        let docs = Documents::new(Arc::new(MemoryStore::new()));
        let messenger = Arc::new(FakeMessenger::default());
        let connector = Arc::new(FakeConnector::default());
        let triggers = Arc::new(TriggerDispatcher::new(
            cfg.clone(),
            docs.clone(),
            messenger.clone(),
            Arc::new(FakeModel::default()),
        ));
        let ingest = Arc::new(IngestionPipeline::new(
            cfg.clone(),
            docs.clone(),
            messenger.clone(),
            triggers,
        ));
        let pairing = Arc::new(PairingCoordinator::new(
            messenger.clone(),
            Arc::new(FakeRenderer),
            ADMIN.into(),
        ));
        let registry = SessionRegistry::new(SessionDeps {
            cfg,
            docs: docs.clone(),
            connector: connector.clone(),
            pairing,
            ingest,
        });

        docs.update(USERS_KEY, |reg: &mut UserRegistryDoc| {
            reg.users.insert(
                ANN.to_string(),
                UserAccount {
                    id: ANN.0,
                    display_name: "Ann".to_string(),
                    ..UserAccount::default()
                },
            );
        })
        .await
        .unwrap();

        Harness {
            docs,
            messenger,
            connector,
            registry,
        }
    }

    /// Let every actor run until it is idle (the paused clock advances 1ms).
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn status_of(docs: &Documents, user: UserId) -> SessionStatus {
        let reg: UserRegistryDoc = docs.load(USERS_KEY).await.unwrap();
        reg.get(user).unwrap().session_status
    }

    fn text(id: &str, body: &str) -> ProtocolEvent {
        ProtocolEvent::MessageReceived(RawMessage {
            id: Some(id.to_string()),
            chat_id: "15550001@s.whatsapp.net".to_string(),
            from_me: false,
            content: Some(MessageContent {
                conversation: Some(body.to_string()),
                ..MessageContent::default()
            }),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn starting_twice_replaces_the_connection() {
        let h = harness().await;
        let key = SessionKey::User(ANN);

        h.registry.start(key, "Ann");
        settle().await;
        h.registry.start(key, "Ann");
        settle().await;

        assert_eq!(h.connector.open_count(), 2);
        assert_eq!(h.connector.close_count(), 1);
        let snap = h.registry.snapshot(key).unwrap();
        assert_eq!(snap.attempt, 2);
        assert_eq!(snap.state, SessionState::Pairing);
        assert_eq!(status_of(&h.docs, ANN).await, SessionStatus::Pairing);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_challenges_deliver_one_code() {
        let h = harness().await;
        h.registry.start(SessionKey::User(ANN), "Ann");
        settle().await;

        for qr in ["qr-1", "qr-2", "qr-3"] {
            h.connector.emit(ProtocolEvent::ChallengeIssued(qr.to_string()));
        }
        settle().await;
        assert_eq!(h.messenger.photos_to(ChatId(5)), 1);

        h.connector.emit(ProtocolEvent::Paired);
        settle().await;
        assert_eq!(status_of(&h.docs, ANN).await, SessionStatus::Active);
        // User heard about the link because the code was delivered.
        assert_eq!(h.messenger.html_to(ChatId(5)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn logged_out_session_never_retries() {
        let h = harness().await;
        let key = SessionKey::User(ANN);
        h.registry.start(key, "Ann");
        settle().await;
        h.connector.emit(ProtocolEvent::CredentialsUpdated(serde_json::json!({"k": 1})));
        h.connector.emit(ProtocolEvent::Paired);
        h.connector.emit(ProtocolEvent::Closed(CloseReason::LoggedOut));
        settle().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.connector.open_count(), 1);
        assert_eq!(status_of(&h.docs, ANN).await, SessionStatus::Disconnected);

        let creds: serde_json::Value = h.docs.load(&key.credentials_key()).await.unwrap();
        assert!(creds.is_null());
        // Settled actors leave the registry.
        assert!(h.registry.snapshot(key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_close_retries_once_after_user_delay() {
        let h = harness().await;
        h.registry.start(SessionKey::User(ANN), "Ann");
        settle().await;
        h.connector.emit(ProtocolEvent::Paired);
        h.connector.emit(ProtocolEvent::Closed(CloseReason::Other("timed out".into())));
        settle().await;

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert_eq!(h.connector.open_count(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.connector.open_count(), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.connector.open_count(), 2);
        assert_eq!(h.connector.close_count(), 1);
        // Retryable closure keeps the persisted status.
        assert_eq!(status_of(&h.docs, ANN).await, SessionStatus::Active);
        assert_eq!(h.registry.snapshot(SessionKey::User(ANN)).unwrap().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn operator_session_uses_longer_delay() {
        let h = harness().await;
        h.registry.start(SessionKey::Operator, "operator");
        settle().await;
        h.connector.emit(ProtocolEvent::Paired);
        h.connector.emit(ProtocolEvent::Closed(CloseReason::Other("lost".into())));
        settle().await;

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(h.connector.open_count(), 1);
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(h.connector.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn open_failure_is_retried() {
        let h = harness().await;
        h.connector
            .fail_opens
            .store(1, std::sync::atomic::Ordering::SeqCst);
        h.registry.start(SessionKey::User(ANN), "Ann");
        settle().await;
        assert_eq!(h.connector.open_count(), 1);

        tokio::time::sleep(Duration::from_millis(5100)).await;
        assert_eq!(h.connector.open_count(), 2);
        assert_eq!(
            h.registry.snapshot(SessionKey::User(ANN)).unwrap().state,
            SessionState::Pairing
        );
    }

    #[tokio::test(start_paused = true)]
    async fn start_cancels_pending_retry() {
        let h = harness().await;
        let key = SessionKey::User(ANN);
        h.registry.start(key, "Ann");
        settle().await;
        h.connector.emit(ProtocolEvent::Paired);
        h.connector.emit(ProtocolEvent::Closed(CloseReason::Other("lost".into())));
        settle().await;

        h.registry.start(key, "Ann");
        settle().await;
        assert_eq!(h.connector.open_count(), 2);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.connector.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn active_session_ingests_messages_in_order() {
        let h = harness().await;
        h.registry.start(SessionKey::User(ANN), "Ann");
        settle().await;
        h.connector.emit(text("early", "before pairing"));
        h.connector.emit(ProtocolEvent::Paired);
        for i in 0..3 {
            h.connector.emit(text(&format!("m{i}"), &format!("body {i}")));
        }
        settle().await;

        let log: ConversationLog = h.docs.load(&conversation_key(ANN)).await.unwrap();
        let texts: Vec<_> = log.messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["body 0", "body 1", "body 2"]);
        assert!(h.registry.snapshot(SessionKey::User(ANN)).unwrap().last_activity.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn logout_unlinks_and_marks_disconnected() {
        let h = harness().await;
        let key = SessionKey::User(ANN);
        h.registry.start(key, "Ann");
        settle().await;
        h.connector.emit(ProtocolEvent::Paired);
        settle().await;

        h.registry.logout(key);
        settle().await;
        assert_eq!(
            h.connector.logouts.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
        assert_eq!(status_of(&h.docs, ANN).await, SessionStatus::Disconnected);
        assert!(h.registry.snapshot(key).is_none());
        let operator = h.messenger.html_to(ADMIN.into());
        assert!(operator
            .iter()
            .any(|m| m.contains("session ended") && m.contains("disconnected on request")));

        // A later start spins up a fresh actor.
        h.registry.start(key, "Ann");
        settle().await;
        assert_eq!(h.connector.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_reopens_active_sessions_with_stored_credentials() {
        let h = harness().await;
        h.docs
            .update(USERS_KEY, |reg: &mut UserRegistryDoc| {
                if let Some(acc) = reg.get_mut(ANN) {
                    acc.session_status = SessionStatus::Active;
                }
            })
            .await
            .unwrap();
        h.docs
            .save(
                &SessionKey::User(ANN).credentials_key(),
                &serde_json::json!({"noiseKey": "x"}),
            )
            .await
            .unwrap();

        let restored = h.registry.restore_active().await.unwrap();
        settle().await;

        assert_eq!(restored, 1);
        assert_eq!(h.connector.open_count(), 1);
        let specs = h.connector.specs.lock().unwrap();
        assert_eq!(specs[0].credentials, Some(serde_json::json!({"noiseKey": "x"})));
        drop(specs);
        assert_eq!(status_of(&h.docs, ANN).await, SessionStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_live_connections() {
        let h = harness().await;
        h.registry.start(SessionKey::User(ANN), "Ann");
        h.registry.start(SessionKey::Operator, "operator");
        settle().await;

        h.registry.shutdown().await;
        assert_eq!(h.connector.close_count(), 2);
        assert!(h.registry.snapshots().is_empty());
    }
}
