use chrono::{Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::time::Duration;

use dropminer_common::models::{Campaign, CampaignStatus, Game, MinerConfig, PriorityMode, ProgressSource};
use dropminer_core::inventory::{ClaimOutcome, InventoryStore};
use dropminer_core::test_utils::helpers::{campaign, game};
use dropminer_core::test_utils::FakeApi;
use dropminer_core::Error;

const HORIZON: Duration = Duration::from_secs(3600);

fn upcoming(id: &str, game: &Game, starts_in: ChronoDuration) -> Campaign {
    let mut c = campaign(id, game, ChronoDuration::days(5), &[30]);
    let starts_at = Utc::now() + starts_in;
    c.starts_at = starts_at;
    for d in c.drops.iter_mut() {
        d.starts_at = starts_at;
    }
    c.refresh_status(Utc::now());
    c
}

#[tokio::test]
async fn test_refresh_orders_and_schedules_edges() -> Result<(), Error> {
    let a = game("1", "Alpha");
    let b = game("2", "Beta");
    let c = game("3", "Gamma");
    let mut unlinked = campaign("cu", &c, ChronoDuration::days(1), &[30]);
    unlinked.linked = false;
    let api = FakeApi::new();
    api.set_campaigns(vec![
        upcoming("cb", &b, ChronoDuration::minutes(30)),
        unlinked,
        campaign("ca", &a, ChronoDuration::days(2), &[30, 60]),
    ]);

    let now = Utc::now();
    let mut store = InventoryStore::new();
    let summary = store.refresh(&api, now, HORIZON).await?;
    assert_eq!(summary.campaigns, 3);
    assert_eq!(summary.drops, 4);
    assert_eq!(summary.earnable, 1);
    assert_eq!(store.campaigns()[0].id, "ca");
    assert_eq!(store.campaigns()[0].status, CampaignStatus::Active);
    assert_eq!(store.fetched_at(), Some(now));

    // Only the upcoming campaign has an edge inside the horizon.
    let triggers = store.triggers_after(now);
    assert_eq!(triggers.len(), 1);
    assert!(triggers[0] > now && triggers[0] <= now + ChronoDuration::minutes(30));

    assert_eq!(store.relevant_games(&MinerConfig::default(), now), vec![a.clone()]);
    let only_beta = MinerConfig {
        priority: vec!["Beta".into()],
        priority_mode: PriorityMode::PriorityOnly,
        ..Default::default()
    };
    assert!(store.relevant_games(&only_beta, now).is_empty());
    Ok(())
}

#[tokio::test]
async fn test_failed_refresh_keeps_previous_contents() -> Result<(), Error> {
    let a = game("1", "Alpha");
    let api = FakeApi::new();
    api.set_campaigns(vec![campaign("ca", &a, ChronoDuration::days(2), &[30])]);
    let mut store = InventoryStore::new();
    store.refresh(&api, Utc::now(), HORIZON).await?;
    store.apply_progress("ca-d0", 12, ProgressSource::EventStream);

    api.fail_inventory_with(|| Error::Transient("gateway timeout".into()));
    assert!(store.refresh(&api, Utc::now(), HORIZON).await.is_err());
    assert_eq!(store.drop("ca-d0").map(|d| d.current_minutes()), Some(12));
    assert_eq!(store.campaigns().len(), 1);
    Ok(())
}

#[test]
fn test_progress_in_any_order_settles_on_maximum() {
    let a = game("1", "Alpha");
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..25 {
        let mut store = InventoryStore::new();
        store.replace(vec![campaign("ca", &a, ChronoDuration::days(2), &[45])], Utc::now(), HORIZON);
        let mut values: Vec<u32> = vec![3, 17, 17, 29, 8, 40, 40, 1];
        values.shuffle(&mut rng);
        let mut seen = 0;
        for v in values {
            store.apply_progress("ca-d0", v, ProgressSource::EventStream);
            let current = store.drop("ca-d0").map(|d| d.current_minutes()).unwrap_or_default();
            assert!(current >= seen);
            seen = current;
        }
        assert_eq!(seen, 40);
        assert_eq!(store.claimable_ids(), Vec::<String>::new());
    }
}

#[tokio::test]
async fn test_completed_drops_are_claimed_once() -> Result<(), Error> {
    let a = game("1", "Alpha");
    let api = FakeApi::new();
    let mut finished = campaign("ca", &a, ChronoDuration::days(2), &[10, 20]);
    finished.drops[0].apply_progress(10, ProgressSource::SessionQuery);
    api.set_campaigns(vec![finished]);

    let mut store = InventoryStore::new();
    store.refresh(&api, Utc::now(), HORIZON).await?;
    assert_eq!(store.claimable_ids(), vec!["ca-d0".to_string()]);

    assert_eq!(store.claim("ca-d0", &api).await.ok(), Some(ClaimOutcome::Claimed));
    assert_eq!(store.claim("ca-d0", &api).await.ok(), Some(ClaimOutcome::AlreadyClaimed));
    assert_eq!(api.claims(), vec!["claim-ca-d0".to_string()]);
    assert!(store.claimable_ids().is_empty());

    // A drop-claim notice may carry a fresh instance id.
    store.apply_progress("ca-d1", 25, ProgressSource::EventStream);
    store.set_claim_id("ca-d1", "instance-9");
    assert_eq!(store.claim("ca-d1", &api).await.ok(), Some(ClaimOutcome::Claimed));
    assert_eq!(api.claims().last().map(String::as_str), Some("instance-9"));
    Ok(())
}
