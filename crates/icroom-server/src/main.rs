// Debate room server entry point.
//
// Startup sequence:
// 1. Initialize tracing (stderr)
// 2. Load config
// 3. Open database, clear participant gauges left by the previous run,
//    report sessions on record
// 4. Build the channel hub and the agent gateway
// 5. Bind the WebSocket listener and spawn it
// 6. Run the event loop until Ctrl+C
// 7. Cleanup on exit

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info};

use icroom_app::app::{self, AppState};
use icroom_app::gateway::{AgentGateway, GatewaySettings};
use icroom_app::hub::ChannelHub;
use icroom_core::config;
use icroom_core::db::Database;
use icroom_core::notify::LogNotifier;
use icroom_core::store::SessionStore;
use icroom_core::ws_server;
use icroom_llm::agent::LlmAgent;
use icroom_llm::client::LlmClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Tracing
    init_tracing()?;
    info!("Debate room server starting up");

    // 2. Config
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        "Config loaded: {}:{}, agent model {}",
        config.server.bind, config.server.port, config.agents.model
    );

    // 3. Database
    let db_path = config.database.resolve_path()?;
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    let reset = db
        .reset_participant_counts()
        .context("failed to reset participant counts")?;
    info!("Database opened at {} ({reset} stale participant counts cleared)", db_path.display());
    let sessions = db.list_sessions().context("failed to list debate sessions")?;
    let open = sessions.iter().filter(|s| !s.is_completed()).count();
    info!("{} debate sessions on record, {open} still open", sessions.len());

    // 4. Hub and gateway
    let notifier = Arc::new(LogNotifier);
    let hub = Arc::new(
        ChannelHub::new(Arc::new(db), notifier.clone())
            .with_presence_announcements(config.hub.announce_presence),
    );

    let llm_client = LlmClient::from_config(&config);
    match &llm_client {
        LlmClient::Active(_) => info!("LLM client initialized (API key configured)"),
        LlmClient::Disabled => info!("LLM client disabled (no API key), agent invocations will fail"),
    }
    let generator = Arc::new(LlmAgent::new(llm_client, config.agents.max_tokens));
    let gateway = AgentGateway::new(
        hub.clone(),
        generator,
        notifier,
        GatewaySettings::from_config(&config.agents),
    );

    // 5. WebSocket listener
    let (ws_tx, ws_rx) = mpsc::channel(256);
    let listener = ws_server::bind(&config.server.bind, config.server.port)
        .await
        .with_context(|| {
            format!(
                "failed to bind WebSocket server on {}:{}",
                config.server.bind, config.server.port
            )
        })?;
    let outbound_buffer = config.hub.outbound_buffer;
    let ws_handle = tokio::spawn(async move {
        if let Err(e) = ws_server::run(listener, ws_tx, outbound_buffer).await {
            error!("WebSocket server error: {}", e);
        }
    });

    // 6. Event loop
    let state = AppState::new(hub, gateway);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let result = app::run(ws_rx, state, shutdown).await;

    // 7. Cleanup: the listener loops forever
    ws_handle.abort();

    match &result {
        Ok(()) => info!("Debate room server shut down cleanly"),
        Err(e) => error!("Application loop error: {}", e),
    }
    result
}

/// Initialize tracing to stderr. `RUST_LOG` overrides the default filter.
fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("icroom=info,icroom_core=info,icroom_app=info,icroom_llm=info,warn")
            }),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
