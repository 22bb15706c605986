use chrono::{Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use dropminer_common::models::{ChannelRef, EventVersion, MinerConfig};
use dropminer_core::api::ChannelObservation;
use dropminer_core::pubsub::InboundEvent;
use dropminer_core::registry::{ChannelChange, ChannelRegistry, SelectionContext};
use dropminer_core::test_utils::helpers::{campaign, game, live, offline};

#[derive(Clone)]
enum Update {
    Event(InboundEvent),
    Fetch(ChannelObservation, EventVersion),
}

fn apply_all(updates: &[Update]) -> ChannelRegistry {
    let mut reg = ChannelRegistry::new();
    reg.ensure(&ChannelRef { id: "1".into(), login: "chan1".into() }, false);
    for u in updates {
        match u {
            Update::Event(e) => {
                reg.apply_event(e);
            }
            Update::Fetch(obs, version) => {
                reg.upsert(obs, *version, false);
            }
        }
    }
    reg
}

fn history() -> Vec<Update> {
    let g = game("1", "Alpha");
    let up = |at| Update::Event(InboundEvent::StreamUp {
        channel_id: "1".into(),
        version: EventVersion::new(at, EventVersion::STREAM_UP),
    });
    let viewers = |at, n| Update::Event(InboundEvent::ViewerCount {
        channel_id: "1".into(),
        viewers: n,
        version: EventVersion::new(at, EventVersion::VIEWCOUNT),
    });
    vec![
        up(100),
        Update::Fetch(live("1", &g, 7), EventVersion::new(120, EventVersion::FETCH)),
        viewers(150, 10),
        Update::Event(InboundEvent::StreamDown {
            channel_id: "1".into(),
            version: EventVersion::new(200, EventVersion::STREAM_DOWN),
        }),
        viewers(250, 42),
        up(300),
        Update::Fetch(offline("1"), EventVersion::new(90, EventVersion::FETCH)),
    ]
}

#[test]
fn test_shuffled_and_repeated_updates_converge() {
    let baseline = apply_all(&history());
    let channel = baseline.get("1").cloned();
    assert!(channel.as_ref().is_some_and(|c| c.is_pending()));
    assert_eq!(channel.as_ref().map(|c| c.viewers()), Some(42));

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..50 {
        let mut updates = history();
        let repeats: Vec<Update> = updates.iter().take(3).cloned().collect();
        updates.extend(repeats);
        updates.shuffle(&mut rng);
        assert_eq!(apply_all(&updates).get("1"), channel.as_ref());
    }
}

#[test]
fn test_repeated_stream_down_reports_once() {
    let g = game("1", "Alpha");
    let mut reg = ChannelRegistry::new();
    reg.upsert(&live("1", &g, 5), EventVersion::new(10, EventVersion::FETCH), false);
    let down = InboundEvent::StreamDown {
        channel_id: "1".into(),
        version: EventVersion::new(20, EventVersion::STREAM_DOWN),
    };
    assert_eq!(reg.apply_event(&down), ChannelChange::WentOffline("1".into()));
    assert_eq!(reg.apply_event(&down), ChannelChange::Ignored);

    let unknown = InboundEvent::StreamDown {
        channel_id: "2".into(),
        version: EventVersion::new(20, EventVersion::STREAM_DOWN),
    };
    assert_eq!(reg.apply_event(&unknown), ChannelChange::Ignored);
}

#[test]
fn test_viewcount_on_pending_channel_asks_for_refresh() {
    let mut reg = ChannelRegistry::new();
    reg.ensure(&ChannelRef { id: "1".into(), login: "chan1".into() }, true);
    let change = reg.apply_event(&InboundEvent::ViewerCount {
        channel_id: "1".into(),
        viewers: 12,
        version: EventVersion::new(50, EventVersion::VIEWCOUNT),
    });
    assert_eq!(change, ChannelChange::NeedsRefresh("1".into()));
    let settings = reg.apply_event(&InboundEvent::SettingsChanged { channel_id: "1".into(), game: None });
    assert_eq!(settings, ChannelChange::NeedsRefresh("1".into()));
}

#[test]
fn test_trim_keeps_watched_and_acl_channels() {
    let a = game("1", "Alpha");
    let campaigns = vec![campaign("ca", &a, ChronoDuration::days(2), &[60])];
    let config = MinerConfig::default();
    let ctx = SelectionContext::new(&config, &campaigns, Utc::now());
    let version = EventVersion::new(1, EventVersion::FETCH);

    let mut reg = ChannelRegistry::new();
    reg.ensure(&ChannelRef { id: "acl".into(), login: "acl".into() }, true);
    reg.upsert(&offline("watched"), version, false);
    for (id, viewers) in [("10", 100), ("11", 50), ("12", 10)] {
        reg.upsert(&live(id, &a, viewers), version, false);
    }
    reg.upsert(&offline("dead"), version, false);

    assert_eq!(reg.trim_to(5, &ctx, Some("watched")), vec!["dead".to_string()]);
    assert!(reg.contains("watched"));
    assert!(reg.contains("acl"));

    // Eligible channels outrank ACL membership, the watched one stays.
    let mut removed = reg.trim_to(3, &ctx, Some("watched"));
    removed.sort();
    assert_eq!(removed, vec!["12".to_string(), "acl".to_string()]);
    assert!(reg.contains("watched"));
    assert_eq!(reg.len(), 3);
}

#[test]
fn test_acl_campaign_only_counts_listed_channels() {
    let a = game("1", "Alpha");
    let mut c = campaign("ca", &a, ChronoDuration::days(2), &[60]);
    c.allowed_channels = vec![ChannelRef { id: "10".into(), login: "chan10".into() }];
    let campaigns = vec![c];
    let config = MinerConfig::default();
    let ctx = SelectionContext::new(&config, &campaigns, Utc::now());

    let mut reg = ChannelRegistry::new();
    let version = EventVersion::new(1, EventVersion::FETCH);
    reg.upsert(&live("10", &a, 1), version, true);
    reg.upsert(&live("11", &a, 9_000), version, false);

    let ids: Vec<&str> = reg.candidates(&ctx).iter().map(|(_, c)| c.id.as_str()).collect();
    assert_eq!(ids, vec!["10"]);
}
