//! Channel registry: every channel the miner tracks, with last-write-wins
//! live status. Written only from the engine loop.

pub mod selection;

use std::collections::HashMap;
use tracing::{debug, trace};

use dropminer_common::models::{Channel, ChannelRef, EventVersion};

use crate::api::ChannelObservation;
use crate::pubsub::InboundEvent;

pub use selection::{rank, should_switch, RankKey, SelectionContext};

/// What an inbound event did to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelChange {
    /// Unknown channel, or an update older than the stored state.
    Ignored,
    /// Reported online; stream details must be fetched before it counts.
    PendingOnline(String),
    WentOffline(String),
    ViewersChanged(String),
    /// Title or game may have changed; re-fetch the stream.
    NeedsRefresh(String),
}

#[derive(Debug, Default, Clone)]
pub struct ChannelRegistry {
    channels: HashMap<String, Channel>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Channel> {
        self.channels.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.channels.contains_key(id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn refs(&self) -> Vec<ChannelRef> {
        self.channels.values().map(Channel::to_ref).collect()
    }

    /// Inserts or updates a channel from a full fetch. An ACL flag, once set,
    /// sticks. Returns whether any live field changed.
    pub fn upsert(&mut self, obs: &ChannelObservation, version: EventVersion, acl_based: bool) -> bool {
        let channel = self
            .channels
            .entry(obs.id.clone())
            .or_insert_with(|| Channel::new(obs.id.clone(), obs.login.clone()));
        if obs.display_name.is_some() {
            channel.display_name = obs.display_name.clone();
        }
        channel.login = obs.login.clone();
        channel.acl_based |= acl_based;
        channel.apply_observation(obs.stream.clone(), version)
    }

    /// Adds a bare channel (from an ACL) without live status.
    pub fn ensure(&mut self, r: &ChannelRef, acl_based: bool) -> &Channel {
        let channel = self
            .channels
            .entry(r.id.clone())
            .or_insert_with(|| Channel::from_ref(r));
        channel.acl_based |= acl_based;
        channel
    }

    pub fn mark_offline(&mut self, id: &str, version: EventVersion) -> bool {
        let Some(channel) = self.channels.get_mut(id) else {
            return false;
        };
        let changed = channel.apply_stream_down(version);
        if changed {
            debug!("[Registry] {} went offline", channel.name());
        }
        changed
    }

    pub fn apply_event(&mut self, event: &InboundEvent) -> ChannelChange {
        if let InboundEvent::StreamDown { channel_id, version } = event {
            return if self.mark_offline(channel_id, *version) {
                ChannelChange::WentOffline(channel_id.clone())
            } else {
                ChannelChange::Ignored
            };
        }
        let Some(id) = event.channel_id() else {
            return ChannelChange::Ignored;
        };
        let Some(channel) = self.channels.get_mut(id) else {
            trace!("[Registry] event for untracked channel {}", id);
            return ChannelChange::Ignored;
        };
        let id = id.to_string();
        match event {
            InboundEvent::StreamUp { version, .. } => {
                if channel.apply_stream_up(*version) && channel.is_pending() {
                    debug!("[Registry] {} reported online", channel.name());
                    ChannelChange::PendingOnline(id)
                } else {
                    ChannelChange::Ignored
                }
            }
            InboundEvent::ViewerCount { viewers, version, .. } => {
                if !channel.apply_viewers(*viewers, *version) {
                    ChannelChange::Ignored
                } else if channel.is_pending() {
                    ChannelChange::NeedsRefresh(id)
                } else {
                    ChannelChange::ViewersChanged(id)
                }
            }
            InboundEvent::SettingsChanged { .. } => ChannelChange::NeedsRefresh(id),
            _ => ChannelChange::Ignored,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Channel> {
        self.channels.remove(id)
    }

    /// Keeps channels matching `keep`; returns the removed ids.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<String>
    where
        F: FnMut(&Channel) -> bool,
    {
        let removed: Vec<String> = self
            .channels
            .values()
            .filter(|c| !keep(c))
            .map(|c| c.id.clone())
            .collect();
        for id in &removed {
            self.channels.remove(id);
        }
        removed
    }

    /// Eligible channels with their rank, best first.
    pub fn candidates(&self, ctx: &SelectionContext<'_>) -> Vec<(RankKey, &Channel)> {
        rank(ctx, self.channels.values())
    }

    /// Drops the least useful channels until at most `cap` remain. Ranked
    /// candidates go first, then the retention order; `keep` is never
    /// removed.
    pub fn trim_to(&mut self, cap: usize, ctx: &SelectionContext<'_>, keep: Option<&str>) -> Vec<String> {
        if self.channels.len() <= cap {
            return Vec::new();
        }
        let ranked: Vec<String> = rank(ctx, self.channels.values())
            .into_iter()
            .map(|(_, c)| c.id.clone())
            .collect();
        let mut rest: Vec<&Channel> = self
            .channels
            .values()
            .filter(|c| !ranked.contains(&c.id))
            .collect();
        rest.sort_by(|a, b| selection::retention_order(a, b));

        let mut order: Vec<String> = Vec::with_capacity(self.channels.len());
        if let Some(k) = keep.filter(|k| self.channels.contains_key(*k)) {
            order.push(k.to_string());
        }
        order.extend(ranked.into_iter().filter(|id| Some(id.as_str()) != keep));
        order.extend(rest.into_iter().map(|c| c.id.clone()).filter(|id| Some(id.as_str()) != keep));

        let removed: Vec<String> = order.split_off(cap.min(order.len()));
        for id in &removed {
            self.channels.remove(id);
        }
        debug!("[Registry] trimmed {} channel(s) to stay within {}", removed.len(), cap);
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::helpers::{game, live};

    #[test]
    fn test_stream_up_on_known_channel_is_pending() {
        let mut reg = ChannelRegistry::new();
        reg.ensure(&ChannelRef { id: "1".into(), login: "one".into() }, true);
        let change = reg.apply_event(&InboundEvent::StreamUp {
            channel_id: "1".into(),
            version: EventVersion::new(5, EventVersion::STREAM_UP),
        });
        assert_eq!(change, ChannelChange::PendingOnline("1".into()));
        let again = reg.apply_event(&InboundEvent::StreamUp {
            channel_id: "1".into(),
            version: EventVersion::new(5, EventVersion::STREAM_UP),
        });
        assert_eq!(again, ChannelChange::Ignored);
    }

    #[test]
    fn test_stale_fetch_does_not_resurrect_channel() {
        let g = game("1", "Alpha");
        let mut reg = ChannelRegistry::new();
        reg.upsert(&live("1", &g, 10), EventVersion::new(100, EventVersion::FETCH), false);
        assert!(reg.mark_offline("1", EventVersion::new(200, EventVersion::STREAM_DOWN)));
        reg.upsert(&live("1", &g, 10), EventVersion::new(150, EventVersion::FETCH), false);
        assert!(!reg.get("1").is_some_and(|c| c.is_online()));
    }

    #[test]
    fn test_stream_down_event_marks_offline_once() {
        let g = game("1", "Alpha");
        let mut reg = ChannelRegistry::new();
        reg.upsert(&live("1", &g, 10), EventVersion::new(100, EventVersion::FETCH), false);
        let down = |id: &str, at| InboundEvent::StreamDown {
            channel_id: id.into(),
            version: EventVersion::new(at, EventVersion::STREAM_DOWN),
        };

        assert_eq!(reg.apply_event(&down("1", 90)), ChannelChange::Ignored);
        assert!(reg.get("1").is_some_and(|c| c.is_online()));
        assert_eq!(reg.apply_event(&down("1", 200)), ChannelChange::WentOffline("1".into()));
        assert!(!reg.get("1").is_some_and(|c| c.is_online()));
        assert_eq!(reg.apply_event(&down("1", 200)), ChannelChange::Ignored);
        assert_eq!(reg.apply_event(&down("9", 300)), ChannelChange::Ignored);
    }
}
