// dropminer-server/src/config.rs
//
// Settings file, credential path and environment overrides for the binary.

use anyhow::{anyhow, Context};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use dropminer_common::models::MinerConfig;
use dropminer_core::client::ClientConfig;
use dropminer_core::engine::EngineHandle;

const APP_DIR: &str = "dropminer";
const SETTINGS_FILE: &str = "settings.json";
const CREDENTIALS_FILE: &str = "session.enc";
const WATCH_PERIOD: Duration = Duration::from_secs(30);

fn app_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .map(|d| d.join(APP_DIR))
        .ok_or_else(|| anyhow!("no configuration directory on this platform"))
}

pub fn settings_path(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(p) => Ok(p.to_path_buf()),
        None => Ok(app_dir()?.join(SETTINGS_FILE)),
    }
}

pub fn credentials_path(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    match explicit {
        Some(p) => Ok(p.to_path_buf()),
        None => Ok(app_dir()?.join(CREDENTIALS_FILE)),
    }
}

/// Reads the settings file, writing the defaults there first if it does not
/// exist yet.
pub fn load_or_create(path: &Path) -> anyhow::Result<MinerConfig> {
    if !path.exists() {
        let config = MinerConfig::default();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&config)?)
            .with_context(|| format!("writing default settings to {}", path.display()))?;
        info!("Wrote default settings to {}", path.display());
        return Ok(config);
    }
    load(path)
}

pub fn load(path: &Path) -> anyhow::Result<MinerConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

/// Client settings with `DROPMINER_CLIENT_ID` / `DROPMINER_USER_AGENT`
/// applied from `lookup`.
pub fn client_config<F>(lookup: F) -> ClientConfig
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ClientConfig::default();
    if let Some(id) = lookup("DROPMINER_CLIENT_ID").filter(|v| !v.trim().is_empty()) {
        info!("Using client id from DROPMINER_CLIENT_ID");
        config.client_id = id.trim().to_string();
    }
    if let Some(agent) = lookup("DROPMINER_USER_AGENT").filter(|v| !v.trim().is_empty()) {
        config.user_agent = agent.trim().to_string();
    }
    config
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Polls the settings file and hands every valid edit to the engine.
pub fn spawn_settings_watcher(path: PathBuf, handle: EngineHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_seen = modified(&path);
        let mut ticker = interval(WATCH_PERIOD);
        loop {
            ticker.tick().await;
            let current = modified(&path);
            if current == last_seen {
                continue;
            }
            last_seen = current;
            match load(&path) {
                Ok(config) => {
                    info!("Settings changed; applying");
                    if handle.apply_config(config).await.is_err() {
                        debug!("Engine is gone; settings watcher exiting");
                        return;
                    }
                }
                Err(e) => warn!("Ignoring settings edit: {:#}", e),
            }
        }
    })
}
