use std::sync::Arc;

use teloxide::Bot;

use relay_bridge::BridgeConnector;
use relay_core::{
    admin::AdminService,
    config::Config,
    conversation::ConversationService,
    domain::SessionKey,
    ingest::IngestionPipeline,
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    model::client::LanguageModel,
    pairing::PairingCoordinator,
    scheduler::ScriptureScheduler,
    session::{SessionDeps, SessionRegistry},
    store::{Documents, JsonFileStore},
    triggers::TriggerDispatcher,
};
use relay_groq::GroqClient;
use relay_telegram::{
    qr::QrRenderer,
    router::{self, AppState},
    TelegramMessenger,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay_core::logging::init("relay")?;

    let cfg = Arc::new(Config::load()?);
    tracing::info!(
        admin = %cfg.admin_id,
        data_dir = %cfg.data_dir.display(),
        bridge = %cfg.bridge_path.display(),
        "starting relay"
    );

    let docs = Documents::new(Arc::new(JsonFileStore::new(cfg.data_dir.clone())));

    // Bursty operator relays go through the throttle; 429s are retried below it.
    let bot = Bot::new(cfg.telegram_bot_token.clone());
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let groq = GroqClient::new(cfg.groq_api_key.clone(), cfg.groq_model.clone())?;
    if !groq.is_configured() {
        tracing::warn!("GROQ_API_KEY not set; replies and analysis use local fallbacks");
    }
    let model: Arc<dyn LanguageModel> = Arc::new(groq);

    let triggers = Arc::new(TriggerDispatcher::new(
        cfg.clone(),
        docs.clone(),
        messenger.clone(),
        model.clone(),
    ));
    let ingest = Arc::new(IngestionPipeline::new(
        cfg.clone(),
        docs.clone(),
        messenger.clone(),
        triggers.clone(),
    ));
    let pairing = Arc::new(PairingCoordinator::new(
        messenger.clone(),
        Arc::new(QrRenderer::default()),
        cfg.admin_id.into(),
    ));
    let sessions = SessionRegistry::new(SessionDeps {
        cfg: cfg.clone(),
        docs: docs.clone(),
        connector: Arc::new(BridgeConnector::new(
            cfg.bridge_path.clone(),
            cfg.bridge_args.clone(),
        )),
        pairing,
        ingest,
    });

    let conversation = Arc::new(ConversationService::new(
        cfg.clone(),
        docs.clone(),
        messenger.clone(),
        model,
        triggers.clone(),
        Arc::new(sessions.clone()),
    ));
    let admin = Arc::new(AdminService::new(
        cfg.clone(),
        docs.clone(),
        messenger,
        triggers.clone(),
        sessions.clone(),
    ));

    if cfg.operator_session_enabled {
        sessions.resume(SessionKey::Operator, "Operator");
    }
    match sessions.restore_active().await {
        Ok(n) => tracing::info!(restored = n, "user sessions restored"),
        Err(e) => tracing::error!(error = %e, "could not read the user registry; no sessions restored"),
    }

    let scheduler = ScriptureScheduler::new(cfg.clone(), triggers);
    scheduler.start().await;

    let state = Arc::new(AppState::new(cfg, conversation, admin));
    let polled = router::run_polling(bot, state).await;

    tracing::info!("shutting down");
    scheduler.stop().await;
    sessions.shutdown().await;

    polled
}
