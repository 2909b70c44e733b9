//! CareLink - identity and linking reconciliation engine

use clap::Parser;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use carelink::{
    config::{Args, StoreBackend},
    db::{DocumentStore, MemoryStore, MongoClient, MongoStore},
    gateway::LocalCredentialGateway,
    server::{self, AppState},
    services::{ChannelNotifier, Engine, LogNotifier, SystemClock},
};

/// Pending notifications before new ones are dropped
const NOTIFICATION_QUEUE: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    init_logging(&args);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  CareLink reconciliation engine");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("Store: {:?}", args.store);
    info!(
        "Retry: {} attempts, {}ms..{}ms backoff",
        args.retry_max_attempts, args.retry_initial_backoff_ms, args.retry_max_backoff_ms
    );
    info!("Linking code TTL: {}h", args.link_code_ttl_hours);
    info!("======================================");

    let store: Arc<dyn DocumentStore> = match args.store {
        StoreBackend::Memory => {
            warn!("Using in-memory store; all data is lost on restart");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Mongo => {
            let client = match MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await {
                Ok(client) => {
                    info!("MongoDB connected successfully");
                    client
                }
                Err(e) => {
                    error!("MongoDB connection failed: {}", e);
                    std::process::exit(1);
                }
            };
            Arc::new(MongoStore::new(client).await?)
        }
    };

    let gateway = Arc::new(LocalCredentialGateway::new(args.token_signer()?));
    let (notifier, delivery) = ChannelNotifier::spawn(NOTIFICATION_QUEUE, LogNotifier);

    let engine = Engine::new(
        store,
        gateway,
        Arc::new(SystemClock),
        Arc::new(notifier),
        args.engine_config(),
    );
    let state = Arc::new(AppState::new(args, engine));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Received Ctrl+C, shutting down");
        signal.cancel();
    });

    server::run(state, shutdown).await?;

    // The queue closes once in-flight connections release the engine
    match tokio::time::timeout(Duration::from_secs(5), delivery).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Notification delivery task ended abnormally: {}", e),
        Err(_) => warn!("Gave up waiting for pending notifications"),
    }

    Ok(())
}

/// Text for terminals, JSON lines for log aggregation
fn init_logging(args: &Args) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("carelink={},info", args.log_level).into());

    if args.log_format.use_json(std::io::stdout().is_terminal()) {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().flatten_event(true).with_current_span(false))
            .init();
    } else {
        tracing_subscriber::registry().with(env_filter).with(fmt::layer()).init();
    }
}
