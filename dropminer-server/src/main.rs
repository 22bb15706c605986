use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use dropminer_common::models::EngineState;
use dropminer_core::api::twitch::TwitchGqlApi;
use dropminer_core::auth::SessionManager;
use dropminer_core::client::RequestClient;
use dropminer_core::credentials::{master_key_from_keyring, EncryptedFileStore};
use dropminer_core::crypto::Encryptor;
use dropminer_core::engine::{EngineParts, MiningEngine};
use dropminer_core::eventbus::EventBus;
use dropminer_core::http::DefaultHttpClient;
use dropminer_core::pubsub::{EventStreamPool, PoolConfig, TungsteniteConnector};
use dropminer_core::status::sink_for;

mod config;
mod login;

use login::ConsoleLoginHandler;

const KEYRING_SERVICE: &str = "dropminer";

#[derive(Parser, Debug, Clone)]
#[command(name = "dropminer")]
#[command(author, version, about = "Dropminer - watches live channels to earn drop campaign rewards")]
struct Args {
    /// Settings file. Defaults to <config dir>/dropminer/settings.json
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Encrypted session file. Defaults to <config dir>/dropminer/session.enc
    #[arg(long)]
    credentials: Option<PathBuf>,

    /// Log level for the miner crates when RUST_LOG does not say otherwise.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Forget the stored session and exit.
    #[arg(long, default_value = "false")]
    logout: bool,
}

const LOG_TARGETS: [&str; 3] = ["dropminer", "dropminer_core", "dropminer_common"];

/// `<crate>=<level>` for each miner crate `RUST_LOG` does not already name.
fn default_directives(rust_log: Option<&str>, level: &str) -> Vec<String> {
    let named: Vec<&str> = rust_log
        .unwrap_or_default()
        .split(',')
        .filter_map(|d| d.split(['=', '[']).next())
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();
    LOG_TARGETS
        .iter()
        .filter(|krate| !named.contains(*krate))
        .map(|krate| format!("{krate}={level}"))
        .collect()
}

fn init_tracing(level: &str) -> anyhow::Result<()> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let mut filter = EnvFilter::from_default_env();
    for directive in default_directives(rust_log.as_deref(), level) {
        filter = filter.add_directive(directive.parse().unwrap_or_default());
    }
    fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to set global subscriber: {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(&args.log_level)?;
    info!("Dropminer {} starting", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args).await {
        error!("Miner error: {:#}", e);
        return Err(e);
    }
    info!("Main finished. Goodbye!");
    Ok(())
}

async fn run(args: Args) -> anyhow::Result<()> {
    let settings_path = config::settings_path(args.settings.as_deref())?;
    let credentials_path = config::credentials_path(args.credentials.as_deref())?;

    let key = master_key_from_keyring(KEYRING_SERVICE)?;
    let store = Arc::new(EncryptedFileStore::new(credentials_path, Encryptor::new(&key)?));

    let client_config = config::client_config(|k| std::env::var(k).ok());
    let client = Arc::new(RequestClient::new(Arc::new(DefaultHttpClient::new()?), client_config));
    let sessions = Arc::new(SessionManager::new(client.clone(), store, Arc::new(ConsoleLoginHandler)));

    if args.logout {
        sessions.logout().await?;
        return Ok(());
    }

    let settings = config::load_or_create(&settings_path)?;
    info!("Loaded settings from {}", settings_path.display());

    let bus = EventBus::new();
    let pool = EventStreamPool::new(
        PoolConfig::default(),
        Arc::new(TungsteniteConnector),
        sessions.clone(),
        bus.clone(),
    );
    let parts = EngineParts {
        api: Arc::new(TwitchGqlApi::new(client, sessions.clone())),
        session: sessions,
        subscriptions: Box::new(pool),
        bus,
        sink: sink_for(settings.status_sink),
    };

    let (handle, engine_task) = MiningEngine::spawn(settings, parts).await;
    let watcher = config::spawn_settings_watcher(settings_path, handle.clone());

    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received; stopping the miner");
            if let Err(e) = ctrl_c_handle.stop().await {
                warn!("Stop request not delivered: {}", e);
            }
        }
    });

    let final_state = engine_task.await?;
    watcher.abort();
    info!("Engine finished in state {:?}", final_state);

    if final_state == EngineState::Error {
        anyhow::bail!("miner stopped after an unrecoverable failure; see the error report above");
    }
    Ok(())
}
