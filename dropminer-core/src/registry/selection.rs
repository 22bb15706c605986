//! Channel ranking: priority list first, then the configured priority mode,
//! then viewers, then id.

use chrono::{DateTime, Utc};
use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;

use dropminer_common::models::{Campaign, Channel, MinerConfig, PriorityMode};

/// Everything eligibility and ranking look at.
#[derive(Debug, Clone, Copy)]
pub struct SelectionContext<'a> {
    pub config: &'a MinerConfig,
    pub campaigns: &'a [Campaign],
    pub now: DateTime<Utc>,
}

impl<'a> SelectionContext<'a> {
    pub fn new(config: &'a MinerConfig, campaigns: &'a [Campaign], now: DateTime<Utc>) -> Self {
        Self { config, campaigns, now }
    }

    /// Campaigns the channel can progress right now.
    pub fn earning_campaigns<'c>(&'c self, channel: &'c Channel) -> impl Iterator<Item = &'a Campaign> + 'c {
        let game = channel.game();
        let drops_enabled = channel.drops_enabled();
        self.campaigns.iter().filter(move |c| {
            drops_enabled
                && game.is_some_and(|g| *g == c.game)
                && c.allows_channel(&channel.id)
                && c.can_earn(self.now)
        })
    }

    /// Online, not excluded, and with at least one active, linked drop the
    /// stream is compatible with.
    pub fn is_eligible(&self, channel: &Channel) -> bool {
        let Some(game) = channel.game() else {
            return false;
        };
        channel.is_online()
            && !self.config.is_excluded(&game.name)
            && self.earning_campaigns(channel).next().is_some()
    }
}

/// Sort key; smaller is better.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RankKey {
    pub priority: usize,
    pub mode: i64,
    pub viewers: Reverse<u32>,
    pub id: String,
}

impl RankKey {
    /// Compares the parts that justify leaving a channel that is still
    /// eligible. Viewer count alone never does.
    pub fn outranks(&self, other: &RankKey) -> bool {
        (self.priority, self.mode) < (other.priority, other.mode)
    }
}

fn rank_key(ctx: &SelectionContext<'_>, channel: &Channel, per_game: &HashMap<String, usize>) -> RankKey {
    let game_name = channel.game().map(|g| g.name.as_str()).unwrap_or_default();
    let priority = ctx.config.priority_rank(game_name);
    let mode = match ctx.config.priority_mode {
        PriorityMode::EndingSoonest | PriorityMode::PriorityOnly => ctx
            .earning_campaigns(channel)
            .map(|c| c.ends_at.timestamp())
            .min()
            .unwrap_or(i64::MAX),
        PriorityMode::LowAvailabilityFirst => channel
            .game()
            .and_then(|g| per_game.get(&g.id))
            .map(|n| *n as i64)
            .unwrap_or(i64::MAX),
    };
    RankKey {
        priority,
        mode,
        viewers: Reverse(channel.viewers()),
        id: channel.id.clone(),
    }
}

/// Eligible channels, best first. In `PriorityOnly` mode channels whose game
/// is not on the priority list are left out entirely.
pub fn rank<'c, I>(ctx: &SelectionContext<'_>, channels: I) -> Vec<(RankKey, &'c Channel)>
where
    I: IntoIterator<Item = &'c Channel>,
{
    let eligible: Vec<&Channel> = channels
        .into_iter()
        .filter(|c| ctx.is_eligible(c))
        .filter(|c| {
            ctx.config.priority_mode != PriorityMode::PriorityOnly
                || c.game().is_some_and(|g| ctx.config.priority_index(&g.name).is_some())
        })
        .collect();

    let mut per_game: HashMap<String, usize> = HashMap::new();
    for c in &eligible {
        if let Some(g) = c.game() {
            *per_game.entry(g.id.clone()).or_default() += 1;
        }
    }

    let mut ranked: Vec<(RankKey, &Channel)> = eligible
        .into_iter()
        .map(|c| (rank_key(ctx, c, &per_game), c))
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0));
    ranked
}

/// Whether to leave `current` for the best ranked channel.
pub fn should_switch(ranked: &[(RankKey, &Channel)], current: Option<&str>) -> bool {
    let Some((best_key, best)) = ranked.first() else {
        return current.is_some();
    };
    let Some(current_id) = current else {
        return true;
    };
    if best.id == current_id {
        return false;
    }
    match ranked.iter().find(|(_, c)| c.id == current_id) {
        None => true,
        Some((current_key, _)) => best_key.outranks(current_key),
    }
}

/// Orders any two channels for trimming: eligible ones by rank, then the
/// rest by ACL membership and viewers.
pub fn retention_order(a: &Channel, b: &Channel) -> Ordering {
    Reverse(a.acl_based)
        .cmp(&Reverse(b.acl_based))
        .then_with(|| Reverse(a.is_online() || a.is_pending()).cmp(&Reverse(b.is_online() || b.is_pending())))
        .then_with(|| Reverse(a.viewers()).cmp(&Reverse(b.viewers())))
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::helpers::{campaign, game, live};
    use chrono::Duration;
    use dropminer_common::models::EventVersion;

    fn channel_for(obs: crate::api::ChannelObservation) -> Channel {
        let mut ch = Channel::new(obs.id.clone(), obs.login.clone());
        ch.apply_observation(obs.stream, EventVersion::new(1, EventVersion::FETCH));
        ch
    }

    fn best<'c>(ctx: &SelectionContext<'_>, channels: &'c [Channel]) -> Option<&'c str> {
        rank(ctx, channels).first().map(|(_, c)| c.id.as_str())
    }

    #[test]
    fn test_priority_beats_viewers() {
        let a = game("1", "Alpha");
        let b = game("2", "Beta");
        let campaigns = vec![
            campaign("ca", &a, Duration::days(3), &[60]),
            campaign("cb", &b, Duration::days(1), &[60]),
        ];
        let config = MinerConfig { priority: vec!["Alpha".into(), "Beta".into()], ..Default::default() };
        let ctx = SelectionContext::new(&config, &campaigns, Utc::now());
        let channels = [channel_for(live("10", &a, 5)), channel_for(live("20", &b, 50_000))];
        assert_eq!(best(&ctx, &channels), Some("10"));
    }

    #[test]
    fn test_ending_soonest_then_viewers_then_id() {
        let a = game("1", "Alpha");
        let b = game("2", "Beta");
        let campaigns = vec![
            campaign("ca", &a, Duration::days(3), &[60]),
            campaign("cb", &b, Duration::days(1), &[60]),
        ];
        let config = MinerConfig::default();
        let ctx = SelectionContext::new(&config, &campaigns, Utc::now());
        let channels = [
            channel_for(live("10", &a, 900)),
            channel_for(live("21", &b, 10)),
            channel_for(live("20", &b, 10)),
        ];
        let ids: Vec<&str> = rank(&ctx, &channels).iter().map(|(_, c)| c.id.as_str()).collect();
        assert_eq!(ids, vec!["20", "21", "10"]);
    }

    #[test]
    fn test_low_availability_prefers_scarce_game() {
        let a = game("1", "Alpha");
        let b = game("2", "Beta");
        // Beta ends sooner, so only the availability count can put Alpha first.
        let campaigns = vec![
            campaign("ca", &a, Duration::days(3), &[60]),
            campaign("cb", &b, Duration::days(1), &[60]),
        ];
        let channels = [
            channel_for(live("10", &a, 3)),
            channel_for(live("20", &b, 8_000)),
            channel_for(live("21", &b, 6_000)),
            channel_for(live("22", &b, 4_000)),
        ];

        // Both games share one rank when neither is listed.
        let unlisted = MinerConfig {
            priority_mode: PriorityMode::LowAvailabilityFirst,
            ..Default::default()
        };
        let ctx = SelectionContext::new(&unlisted, &campaigns, Utc::now());
        let ids: Vec<&str> = rank(&ctx, &channels).iter().map(|(_, c)| c.id.as_str()).collect();
        assert_eq!(ids, vec!["10", "20", "21", "22"]);
        let ranked = rank(&ctx, &channels);
        assert!(should_switch(&ranked, Some("20")));

        // A listed rank still comes before availability.
        let beta_first = MinerConfig { priority: vec!["Beta".into()], ..unlisted.clone() };
        let ctx = SelectionContext::new(&beta_first, &campaigns, Utc::now());
        assert_eq!(best(&ctx, &channels), Some("20"));

        let soonest = MinerConfig { priority_mode: PriorityMode::EndingSoonest, ..unlisted };
        let ctx = SelectionContext::new(&soonest, &campaigns, Utc::now());
        assert_eq!(best(&ctx, &channels), Some("20"));
    }

    #[test]
    fn test_switch_only_for_better_rank() {
        let a = game("1", "Alpha");
        let campaigns = vec![campaign("ca", &a, Duration::days(3), &[60])];
        let config = MinerConfig::default();
        let ctx = SelectionContext::new(&config, &campaigns, Utc::now());
        let channels = [channel_for(live("1", &a, 10)), channel_for(live("2", &a, 10_000))];
        let ranked = rank(&ctx, &channels);
        assert_eq!(ranked[0].1.id, "2");
        assert!(!should_switch(&ranked, Some("1")));
        assert!(should_switch(&ranked, Some("gone")));
        assert!(should_switch(&ranked, None));
        assert!(should_switch(&[], Some("1")));
    }
}
