//! The platform operations the engine depends on, behind one trait so the
//! engine can be driven by a scripted fake in tests.

pub mod parse;
pub mod twitch;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use dropminer_common::models::{Campaign, ChannelRef, Game, StreamInfo};

use crate::Error;

pub use twitch::TwitchGqlApi;

/// A channel as seen by a full fetch. `stream` is `None` when offline.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelObservation {
    pub id: String,
    pub login: String,
    pub display_name: Option<String>,
    pub stream: Option<StreamInfo>,
}

impl ChannelObservation {
    pub fn channel_ref(&self) -> ChannelRef {
        ChannelRef { id: self.id.clone(), login: self.login.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimStatus {
    Claimed,
    AlreadyClaimed,
    /// The server answered but refused; carries its status string.
    Rejected(String),
}

/// Server-side view of the drop currently accruing on a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentDrop {
    pub drop_id: String,
    pub current_minutes: u32,
    pub required_minutes: u32,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DropsApi: Send + Sync {
    /// Campaigns in progress merged with every active or upcoming campaign.
    async fn fetch_inventory(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>, Error>;

    /// Stream details for each channel, in input order. Channels the
    /// platform no longer knows are left out.
    async fn fetch_streams(&self, channels: &[ChannelRef]) -> Result<Vec<ChannelObservation>, Error>;

    /// Live, drops-enabled channels for a game.
    async fn game_directory(&self, game: &Game, limit: usize) -> Result<Vec<ChannelObservation>, Error>;

    async fn claim_drop(&self, claim_id: &str) -> Result<ClaimStatus, Error>;

    async fn current_drop(&self, channel_id: &str) -> Result<Option<CurrentDrop>, Error>;

    /// One watch heartbeat. `Ok(false)` means the stream could not be
    /// reached this cycle.
    async fn send_watch(&self, channel: &ChannelRef) -> Result<bool, Error>;

    async fn delete_notification(&self, notification_id: &str) -> Result<(), Error>;

    async fn claim_points(&self, channel_id: &str, claim_id: &str) -> Result<(), Error>;

    /// Claims the channel-points bonus if one is waiting. Returns whether
    /// anything was claimed.
    async fn claim_channel_bonus(&self, channel: &ChannelRef) -> Result<bool, Error>;
}
