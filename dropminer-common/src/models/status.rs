// File: dropminer-common/src/models/status.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::campaign::Campaign;
use super::channel::{Channel, ChannelRef};
use super::game::Game;
use super::watch::WatchState;
use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineState {
    Init,
    FetchInventory,
    UpdateGames,
    CleanupChannels,
    FetchChannels,
    SwitchChannel,
    Watching,
    Error,
    Stopped,
}

impl EngineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EngineState::Error | EngineState::Stopped)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Init => "INIT",
            EngineState::FetchInventory => "FETCH_INVENTORY",
            EngineState::UpdateGames => "UPDATE_GAMES",
            EngineState::CleanupChannels => "CLEANUP_CHANNELS",
            EngineState::FetchChannels => "FETCH_CHANNELS",
            EngineState::SwitchChannel => "SWITCH_CHANNEL",
            EngineState::Watching => "WATCHING",
            EngineState::Error => "ERROR",
            EngineState::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardStatus {
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

/// Summary of the drop currently being mined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropSummary {
    pub id: String,
    pub name: String,
    pub campaign_name: String,
    pub current_minutes: u32,
    pub required_minutes: u32,
}

/// Pushed to the status sink on every meaningful change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub state: EngineState,
    pub current_channel: Option<ChannelRef>,
    pub current_game: Option<Game>,
    pub current_drop: Option<DropSummary>,
    pub progress_fraction: f64,
    pub remaining_estimate: Option<Duration>,
    /// Values are the last known good ones; the engine has stopped.
    pub stale: bool,
}

impl StatusUpdate {
    pub fn idle(state: EngineState) -> Self {
        Self {
            state,
            current_channel: None,
            current_game: None,
            current_drop: None,
            progress_fraction: 0.0,
            remaining_estimate: None,
            stale: false,
        }
    }
}

/// Sent once when the engine enters `ERROR`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub operation: String,
    pub kind: ErrorKind,
    pub message: String,
    pub last_state: EngineState,
    pub at: DateTime<Utc>,
}

/// Read-only view of engine state for presentation layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerSnapshot {
    pub state: EngineState,
    pub watch: WatchState,
    pub campaigns: Vec<Campaign>,
    pub channels: Vec<Channel>,
    pub shards: Vec<ShardStatus>,
    pub last_status: Option<StatusUpdate>,
    pub stale: bool,
}

impl Default for MinerSnapshot {
    fn default() -> Self {
        Self {
            state: EngineState::Init,
            watch: WatchState::default(),
            campaigns: Vec::new(),
            channels: Vec::new(),
            shards: Vec::new(),
            last_status: None,
            stale: false,
        }
    }
}
