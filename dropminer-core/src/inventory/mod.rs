// =============================================================================
// dropminer-core/src/inventory/mod.rs
//   Campaigns, drops and claim state. Replaced wholesale on every fetch;
//   between fetches only progress and claims change.
// =============================================================================

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use thiserror::Error as ThisError;
use tracing::{debug, info, warn};

use dropminer_common::models::{
    Campaign, CampaignStatus, Channel, ChannelRef, Drop, Game, MinerConfig, PriorityMode, ProgressOutcome,
    ProgressSource,
};

use crate::api::{ClaimStatus, DropsApi};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
}

#[derive(Debug, ThisError)]
pub enum ClaimError {
    #[error("drop {0} is not in the inventory")]
    UnknownDrop(String),

    #[error("drop not ready to claim: {0}")]
    NotReady(String),

    #[error("claim failed, retry later: {0}")]
    NetworkError(Error),

    #[error("claim failed: {0}")]
    Fatal(Error),
}

/// Counts from the last refresh, for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub campaigns: usize,
    pub drops: usize,
    pub earnable: usize,
}

#[derive(Debug, Default, Clone)]
pub struct InventoryStore {
    campaigns: Vec<Campaign>,
    /// drop id -> (campaign index, drop index)
    index: HashMap<String, (usize, usize)>,
    /// Campaign and drop window edges inside the current horizon.
    triggers: BTreeSet<DateTime<Utc>>,
    fetched_at: Option<DateTime<Utc>>,
}

impl InventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn campaigns(&self) -> &[Campaign] {
        &self.campaigns
    }

    pub fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }

    pub fn drop(&self, drop_id: &str) -> Option<&Drop> {
        let (c, d) = *self.index.get(drop_id)?;
        self.campaigns.get(c)?.drops.get(d)
    }

    pub fn campaign_of(&self, drop_id: &str) -> Option<&Campaign> {
        let (c, _) = *self.index.get(drop_id)?;
        self.campaigns.get(c)
    }

    fn drop_mut(&mut self, drop_id: &str) -> Option<&mut Drop> {
        let (c, d) = *self.index.get(drop_id)?;
        self.campaigns.get_mut(c)?.drops.get_mut(d)
    }

    /// Fetches the full inventory and swaps it in. On error the previous
    /// contents stay untouched.
    pub async fn refresh(
        &mut self,
        api: &dyn DropsApi,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<RefreshSummary, Error> {
        let campaigns = api.fetch_inventory(now).await?;
        let summary = self.replace(campaigns, now, horizon);
        info!(
            "[Inventory] {} campaign(s), {} drop(s), {} earnable now",
            summary.campaigns, summary.drops, summary.earnable
        );
        Ok(summary)
    }

    /// Installs a freshly fetched campaign list.
    pub fn replace(&mut self, mut campaigns: Vec<Campaign>, now: DateTime<Utc>, horizon: Duration) -> RefreshSummary {
        for c in campaigns.iter_mut() {
            c.refresh_status(now);
        }
        // Earnable first, then by the next relevant edge of the window.
        campaigns.sort_by_key(|c| {
            let edge = if c.status == CampaignStatus::Upcoming { c.starts_at } else { c.ends_at };
            (!c.can_earn(now), c.status != CampaignStatus::Active, edge)
        });

        let mut index = HashMap::new();
        for (ci, c) in campaigns.iter().enumerate() {
            for (di, d) in c.drops.iter().enumerate() {
                index.insert(d.id.clone(), (ci, di));
            }
        }

        let until = now + ChronoDuration::from_std(horizon).unwrap_or(ChronoDuration::hours(1));
        let mut triggers = BTreeSet::new();
        for c in campaigns.iter().filter(|c| c.can_earn_within(now, until)) {
            triggers.insert(c.starts_at);
            triggers.insert(c.ends_at);
            for d in &c.drops {
                triggers.insert(d.starts_at);
                triggers.insert(d.ends_at);
            }
        }
        triggers.retain(|t| *t > now && *t <= until);

        let summary = RefreshSummary {
            campaigns: campaigns.len(),
            drops: index.len(),
            earnable: campaigns.iter().filter(|c| c.can_earn(now)).count(),
        };
        self.campaigns = campaigns;
        self.index = index;
        self.triggers = triggers;
        self.fetched_at = Some(now);
        summary
    }

    pub fn refresh_statuses(&mut self, now: DateTime<Utc>) {
        for c in self.campaigns.iter_mut() {
            c.refresh_status(now);
        }
    }

    /// Window edges still ahead of `now`, earliest first.
    pub fn triggers_after(&self, now: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.triggers.iter().copied().filter(|t| *t > now).collect()
    }

    /// Offers a progress value for a drop; `None` for an unknown drop.
    pub fn apply_progress(&mut self, drop_id: &str, minutes: u32, source: ProgressSource) -> Option<ProgressOutcome> {
        let drop = self.drop_mut(drop_id)?;
        let outcome = drop.apply_progress(minutes, source);
        match outcome {
            ProgressOutcome::Applied { previous, current } => {
                debug!("[Inventory] {} progress {} -> {} ({:?})", drop.name, previous, current, source)
            }
            ProgressOutcome::Stale => debug!("[Inventory] {} stale progress {} ignored", drop.name, minutes),
            _ => {}
        }
        Some(outcome)
    }

    pub fn estimate_minute(&mut self, drop_id: &str) -> Option<ProgressOutcome> {
        let drop = self.drop_mut(drop_id)?;
        Some(drop.estimate_minute())
    }

    pub fn set_claim_id(&mut self, drop_id: &str, instance_id: &str) {
        if let Some(drop) = self.drop_mut(drop_id) {
            drop.claim_id = Some(instance_id.to_string());
        }
    }

    pub fn claimable_ids(&self) -> Vec<String> {
        self.campaigns
            .iter()
            .flat_map(|c| c.claimable_drops().map(|d| d.id.clone()))
            .collect()
    }

    /// Claims a completed drop. A drop already marked claimed never goes to
    /// the network again.
    pub async fn claim(&mut self, drop_id: &str, api: &dyn DropsApi) -> Result<ClaimOutcome, ClaimError> {
        let drop = self
            .drop(drop_id)
            .ok_or_else(|| ClaimError::UnknownDrop(drop_id.to_string()))?;
        if drop.claimed {
            return Ok(ClaimOutcome::AlreadyClaimed);
        }
        if !drop.is_complete() {
            return Err(ClaimError::NotReady(format!(
                "{}/{} minutes",
                drop.current_minutes(),
                drop.required_minutes
            )));
        }
        let Some(claim_id) = drop.claim_id.clone() else {
            return Err(ClaimError::Fatal(Error::Invalid(format!("drop {drop_id} has no claim id"))));
        };

        match api.claim_drop(&claim_id).await {
            Ok(status @ (ClaimStatus::Claimed | ClaimStatus::AlreadyClaimed)) => {
                if let Some(drop) = self.drop_mut(drop_id) {
                    drop.mark_claimed();
                    info!("[Inventory] claimed {}", drop.name);
                }
                Ok(if status == ClaimStatus::Claimed {
                    ClaimOutcome::Claimed
                } else {
                    ClaimOutcome::AlreadyClaimed
                })
            }
            Ok(ClaimStatus::Rejected(status)) => {
                warn!("[Inventory] claim for {} rejected: {}", drop_id, status);
                Err(ClaimError::NotReady(status))
            }
            Err(e) if e.is_retryable() => Err(ClaimError::NetworkError(e)),
            Err(e) => Err(ClaimError::Fatal(e)),
        }
    }

    /// Games worth mining, best priority first: an earnable campaign, not
    /// excluded, and listed when the mode is priority-only.
    pub fn relevant_games(&self, config: &MinerConfig, now: DateTime<Utc>) -> Vec<Game> {
        let mut games: Vec<Game> = Vec::new();
        for c in self.campaigns.iter().filter(|c| c.can_earn(now)) {
            if config.is_excluded(&c.game.name) {
                continue;
            }
            if config.priority_mode == PriorityMode::PriorityOnly && config.priority_index(&c.game.name).is_none() {
                continue;
            }
            if !games.contains(&c.game) {
                games.push(c.game.clone());
            }
        }
        games.sort_by_key(|g| config.priority_rank(&g.name));
        games
    }

    /// ACL channels of earnable campaigns for `games`.
    pub fn acl_channels(&self, games: &[Game], now: DateTime<Utc>) -> Vec<ChannelRef> {
        let mut seen = BTreeSet::new();
        self.campaigns
            .iter()
            .filter(|c| games.contains(&c.game) && c.is_acl_based() && c.can_earn(now))
            .flat_map(|c| c.allowed_channels.iter())
            .filter(|r| seen.insert(r.id.clone()))
            .cloned()
            .collect()
    }

    /// Games whose earnable campaigns are not ACL-restricted and so need the
    /// directory.
    pub fn directory_games(&self, games: &[Game], now: DateTime<Utc>) -> Vec<Game> {
        games
            .iter()
            .filter(|g| {
                self.campaigns
                    .iter()
                    .any(|c| c.game == **g && !c.is_acl_based() && c.can_earn(now))
            })
            .cloned()
            .collect()
    }

    /// The drop a channel is most likely advancing: the earnable drop with
    /// the fewest minutes left.
    pub fn active_drop(&self, channel: &Channel, now: DateTime<Utc>) -> Option<&Drop> {
        let game = channel.game()?;
        self.campaigns
            .iter()
            .filter(|c| c.game == *game && c.allows_channel(&channel.id) && c.can_earn(now))
            .filter_map(|c| c.active_drop(now))
            .min_by_key(|d| (d.remaining_minutes(), d.ends_at))
    }

    /// Any campaign still references the channel's game or lists it.
    pub fn references_channel(&self, channel: &Channel, games: &[Game]) -> bool {
        channel.game().is_some_and(|g| games.contains(g))
            || self
                .campaigns
                .iter()
                .any(|c| games.contains(&c.game) && c.allowed_channels.iter().any(|r| r.id == channel.id))
    }
}
