// File: dropminer-common/src/models/campaign.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::channel::ChannelRef;
use super::game::Game;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Benefit {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

/// Where a progress value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressSource {
    EventStream,
    SessionQuery,
    Estimate,
}

/// Result of offering a progress value to a drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressOutcome {
    Applied { previous: u32, current: u32 },
    /// Same value as already stored.
    Duplicate,
    /// Lower than the stored value; ignored.
    Stale,
    /// Drop already claimed; progress is frozen.
    Frozen,
}

impl ProgressOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, ProgressOutcome::Applied { .. })
    }
}

/// A single timed reward inside a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drop {
    pub id: String,
    pub campaign_id: String,
    pub name: String,
    pub required_minutes: u32,
    current_minutes: u32,
    pub claimed: bool,
    /// Drop instance id used for claiming, once the server has issued one.
    pub claim_id: Option<String>,
    pub benefits: Vec<Benefit>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    /// Ids of drops in the same campaign that must be claimed first.
    #[serde(default)]
    pub preconditions: Vec<String>,
}

impl Drop {
    /// Builds a drop from server-reported state. A claimed drop is pinned at
    /// its requirement; progress is clamped to it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        campaign_id: impl Into<String>,
        name: impl Into<String>,
        required_minutes: u32,
        reported_minutes: u32,
        claimed: bool,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Self {
        let current_minutes = if claimed {
            required_minutes
        } else {
            reported_minutes.min(required_minutes)
        };
        Self {
            id: id.into(),
            campaign_id: campaign_id.into(),
            name: name.into(),
            required_minutes,
            current_minutes,
            claimed,
            claim_id: None,
            benefits: Vec::new(),
            starts_at,
            ends_at,
            preconditions: Vec::new(),
        }
    }

    pub fn current_minutes(&self) -> u32 {
        self.current_minutes
    }

    pub fn remaining_minutes(&self) -> u32 {
        self.required_minutes.saturating_sub(self.current_minutes)
    }

    pub fn progress_fraction(&self) -> f64 {
        if self.required_minutes == 0 {
            return 1.0;
        }
        f64::from(self.current_minutes) / f64::from(self.required_minutes)
    }

    pub fn is_complete(&self) -> bool {
        self.current_minutes >= self.required_minutes
    }

    /// Complete but not yet claimed.
    pub fn is_claimable(&self) -> bool {
        !self.claimed && self.is_complete()
    }

    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now && now < self.ends_at
    }

    /// Offers a progress value. Accepts only non-decreasing values on an
    /// unclaimed drop, capped at the requirement.
    pub fn apply_progress(&mut self, minutes: u32, _source: ProgressSource) -> ProgressOutcome {
        if self.claimed {
            return ProgressOutcome::Frozen;
        }
        let capped = minutes.min(self.required_minutes);
        if capped < self.current_minutes {
            return ProgressOutcome::Stale;
        }
        if capped == self.current_minutes {
            return ProgressOutcome::Duplicate;
        }
        let previous = self.current_minutes;
        self.current_minutes = capped;
        ProgressOutcome::Applied { previous, current: capped }
    }

    /// One-minute estimate used when the server stays silent.
    pub fn estimate_minute(&mut self) -> ProgressOutcome {
        let next = self.current_minutes.saturating_add(1);
        self.apply_progress(next, ProgressSource::Estimate)
    }

    pub fn mark_claimed(&mut self) {
        self.claimed = true;
        self.current_minutes = self.required_minutes;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CampaignStatus {
    Upcoming,
    Active,
    Expired,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub game: Game,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    /// Account is linked, so the campaign can pay out.
    pub linked: bool,
    pub link_url: String,
    /// Channel ACL; empty means any drops-enabled channel qualifies.
    pub allowed_channels: Vec<ChannelRef>,
    pub drops: Vec<Drop>,
    pub status: CampaignStatus,
}

impl Campaign {
    pub fn compute_status(&self, now: DateTime<Utc>) -> CampaignStatus {
        if !self.drops.is_empty() && self.drops.iter().all(|d| d.claimed) {
            CampaignStatus::Finished
        } else if now >= self.ends_at {
            CampaignStatus::Expired
        } else if now < self.starts_at {
            CampaignStatus::Upcoming
        } else {
            CampaignStatus::Active
        }
    }

    pub fn refresh_status(&mut self, now: DateTime<Utc>) {
        self.status = self.compute_status(now);
    }

    pub fn is_acl_based(&self) -> bool {
        !self.allowed_channels.is_empty()
    }

    pub fn allows_channel(&self, channel_id: &str) -> bool {
        self.allowed_channels.is_empty()
            || self.allowed_channels.iter().any(|c| c.id == channel_id)
    }

    pub fn drop_by_id(&self, drop_id: &str) -> Option<&Drop> {
        self.drops.iter().find(|d| d.id == drop_id)
    }

    fn preconditions_met(&self, drop: &Drop) -> bool {
        drop.preconditions.iter().all(|pre| {
            self.drop_by_id(pre).map(|d| d.claimed).unwrap_or(true)
        })
    }

    /// Drop still accrues watch time right now.
    pub fn drop_can_earn(&self, drop: &Drop, now: DateTime<Utc>) -> bool {
        !drop.claimed
            && !drop.is_complete()
            && drop.in_window(now)
            && self.preconditions_met(drop)
    }

    pub fn earnable_drops(&self, now: DateTime<Utc>) -> impl Iterator<Item = &Drop> {
        self.drops.iter().filter(move |d| self.drop_can_earn(d, now))
    }

    pub fn claimable_drops(&self) -> impl Iterator<Item = &Drop> {
        self.drops.iter().filter(|d| d.is_claimable())
    }

    /// Linked, active and with at least one drop still accruing.
    pub fn can_earn(&self, now: DateTime<Utc>) -> bool {
        self.linked
            && self.compute_status(now) == CampaignStatus::Active
            && self.earnable_drops(now).next().is_some()
    }

    /// Same as `can_earn`, but also accepts campaigns and drops that open
    /// before `horizon`.
    pub fn can_earn_within(&self, now: DateTime<Utc>, horizon: DateTime<Utc>) -> bool {
        self.linked
            && self.ends_at > now
            && self.starts_at < horizon
            && self.drops.iter().any(|d| {
                !d.claimed
                    && !d.is_complete()
                    && d.ends_at > now
                    && d.starts_at < horizon
                    && self.preconditions_met(d)
            })
    }

    /// The drop to display while watching: fewest minutes left first.
    pub fn active_drop(&self, now: DateTime<Utc>) -> Option<&Drop> {
        self.earnable_drops(now).min_by_key(|d| (d.remaining_minutes(), d.ends_at))
    }

    pub fn claimed_count(&self) -> usize {
        self.drops.iter().filter(|d| d.claimed).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn drop_at(now: DateTime<Utc>, id: &str, required: u32, current: u32) -> Drop {
        Drop::new(id, "c1", id, required, current, false, now - Duration::hours(1), now + Duration::hours(5))
    }

    #[test]
    fn test_progress_is_monotonic_and_capped() {
        let now = Utc::now();
        let mut d = drop_at(now, "d1", 60, 0);
        assert!(d.apply_progress(20, ProgressSource::EventStream).applied());
        assert_eq!(d.apply_progress(15, ProgressSource::EventStream), ProgressOutcome::Stale);
        assert_eq!(d.apply_progress(20, ProgressSource::EventStream), ProgressOutcome::Duplicate);
        assert!(d.apply_progress(40, ProgressSource::EventStream).applied());
        assert_eq!(d.current_minutes(), 40);
        d.apply_progress(500, ProgressSource::EventStream);
        assert_eq!(d.current_minutes(), 60);
        d.mark_claimed();
        assert_eq!(d.apply_progress(61, ProgressSource::EventStream), ProgressOutcome::Frozen);
        assert_eq!(d.current_minutes(), 60);
    }

    #[test]
    fn test_campaign_status_and_preconditions() {
        let now = Utc::now();
        let mut first = drop_at(now, "a", 30, 0);
        first.claimed = false;
        let mut second = drop_at(now, "b", 60, 0);
        second.preconditions = vec!["a".into()];
        let mut campaign = Campaign {
            id: "c1".into(),
            name: "Camp".into(),
            game: Game::new("g1", "Game One"),
            starts_at: now - Duration::hours(2),
            ends_at: now + Duration::hours(10),
            linked: true,
            link_url: String::new(),
            allowed_channels: vec![],
            drops: vec![first, second],
            status: CampaignStatus::Upcoming,
        };
        campaign.refresh_status(now);
        assert_eq!(campaign.status, CampaignStatus::Active);
        let earnable: Vec<_> = campaign.earnable_drops(now).map(|d| d.id.clone()).collect();
        assert_eq!(earnable, vec!["a".to_string()]);

        campaign.drops[0].mark_claimed();
        assert_eq!(campaign.active_drop(now).map(|d| d.id.as_str()), Some("b"));

        campaign.drops[1].mark_claimed();
        assert_eq!(campaign.compute_status(now), CampaignStatus::Finished);
        assert!(!campaign.can_earn(now));
    }
}
