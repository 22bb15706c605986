use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use dropminer_common::models::ProgressSource;
use dropminer_core::eventbus::{EventBus, MinerEvent};
use dropminer_core::inventory::InventoryStore;
use dropminer_core::pubsub::{EventStreamPool, InboundEvent, PoolConfig, ShardConfig, Subscriptions, Topic};
use dropminer_core::test_utils::helpers::{campaign, game, wait_until};
use dropminer_core::test_utils::{FakeConnector, FakeSession};
use dropminer_core::Error;

const LIMIT: Duration = Duration::from_secs(30);

fn pool_with(connector: &FakeConnector, shard: ShardConfig, bus: EventBus) -> EventStreamPool {
    let config = PoolConfig { shard, ..PoolConfig::default() };
    EventStreamPool::new(config, Arc::new(connector.clone()), Arc::new(FakeSession::new("100")), bus)
}

fn channel_topics(count: usize) -> Vec<Topic> {
    (0..count)
        .flat_map(|i| Topic::channel_topics(&format!("{}", 1000 + i)))
        .collect()
}

fn progress_frame(drop_id: &str, minutes: u32) -> String {
    let inner = serde_json::json!({
        "type": "drop-progress",
        "data": {"drop_id": drop_id, "current_progress_min": minutes, "required_progress_min": 60},
    });
    serde_json::json!({
        "type": "MESSAGE",
        "data": {"topic": "user-drop-events.100", "message": inner.to_string()},
    })
    .to_string()
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_resubscribes_every_topic_once() -> Result<(), Error> {
    let connector = FakeConnector::new();
    let mut pool = pool_with(&connector, ShardConfig::default(), EventBus::new());
    let topics = channel_topics(15);
    for t in &topics {
        pool.subscribe(t.clone())?;
    }
    assert_eq!(pool.shard_count(), 1);
    wait_until(LIMIT, || connector.listened(0).len() == 30).await?;

    connector.disconnect(0);
    wait_until(LIMIT, || connector.listened(1).len() >= 30).await?;

    let expected: BTreeSet<String> = topics.iter().map(Topic::to_string).collect();
    let relistened = connector.listened(1);
    assert_eq!(relistened.len(), 30);
    assert_eq!(relistened.iter().cloned().collect::<BTreeSet<_>>(), expected);
    assert_eq!(connector.connection_count(), 2);
    pool.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_missing_pong_forces_reconnect() -> Result<(), Error> {
    let connector = FakeConnector::new();
    connector.mute_pongs();
    let shard = ShardConfig {
        ping_interval: Duration::from_secs(5),
        ping_timeout: Duration::from_secs(2),
        ..ShardConfig::default()
    };
    let mut pool = pool_with(&connector, shard, EventBus::new());
    pool.subscribe(Topic::user_topics("100")[0].clone())?;

    wait_until(LIMIT, || connector.connection_count() >= 2).await?;
    assert!(connector.sent(0).iter().any(|f| f.contains("PING")));
    wait_until(LIMIT, || connector.listened(1).len() == 1).await?;
    pool.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_answered_pings_keep_the_connection() -> Result<(), Error> {
    let connector = FakeConnector::new();
    let shard = ShardConfig {
        ping_interval: Duration::from_secs(5),
        ping_timeout: Duration::from_secs(2),
        ..ShardConfig::default()
    };
    let mut pool = pool_with(&connector, shard, EventBus::new());
    pool.subscribe(Topic::user_topics("100")[0].clone())?;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.connection_count(), 1);
    assert!(connector.sent(0).iter().filter(|f| f.contains("PING")).count() >= 10);
    pool.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_progress_counts_once() -> Result<(), Error> {
    let connector = FakeConnector::new();
    let bus = EventBus::new();
    let mut events = bus.subscribe(None).await;
    let mut pool = pool_with(&connector, ShardConfig::default(), bus);
    for t in Topic::user_topics("100") {
        pool.subscribe(t)?;
    }
    wait_until(LIMIT, || connector.listened(0).len() == 3).await?;

    let alpha = game("1", "Alpha");
    let c = campaign("ca", &alpha, ChronoDuration::days(2), &[60]);
    let mut store = InventoryStore::new();
    store.replace(vec![c], Utc::now(), Duration::from_secs(3600));

    connector.push(0, progress_frame("ca-d0", 12));
    connector.disconnect(0);
    wait_until(LIMIT, || connector.listened(1).len() == 3).await?;
    connector.push(1, progress_frame("ca-d0", 12));
    connector.push(1, progress_frame("ca-d0", 11));

    let mut seen = 0;
    while seen < 3 {
        match events.recv().await {
            Some(MinerEvent::Inbound { event: InboundEvent::DropProgress { drop_id, current_minutes, .. }, .. }) => {
                store.apply_progress(&drop_id, current_minutes, ProgressSource::EventStream);
                seen += 1;
            }
            Some(_) => {}
            None => return Err(Error::Task("bus closed".into())),
        }
    }
    assert_eq!(store.drop("ca-d0").map(|d| d.current_minutes()), Some(12));
    pool.shutdown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_auth_rejection_is_relistened_on_request() -> Result<(), Error> {
    let connector = FakeConnector::new();
    let bus = EventBus::new();
    let mut events = bus.subscribe(None).await;
    let mut pool = pool_with(&connector, ShardConfig::default(), bus);
    let topic = Topic::user_topics("100")[0].clone();
    pool.subscribe(topic.clone())?;
    wait_until(LIMIT, || connector.listened(0).len() == 1).await?;

    // No nonce: everything on the connection counts as rejected.
    connector.push(0, r#"{"type":"RESPONSE","error":"ERR_BADAUTH"}"#);
    loop {
        match events.recv().await {
            Some(MinerEvent::ShardAuthRejected { shard }) => {
                assert_eq!(shard, 0);
                break;
            }
            Some(_) => {}
            None => return Err(Error::Task("bus closed".into())),
        }
    }

    // The rejected topic stays silent until asked for again.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(connector.listened(0).len(), 1);

    pool.relisten();
    wait_until(LIMIT, || connector.listened(0).len() == 2).await?;
    assert_eq!(connector.listened(0), vec![topic.to_string(), topic.to_string()]);
    assert_eq!(connector.connection_count(), 1);
    assert!(pool.is_subscribed(&topic));
    pool.shutdown().await;
    Ok(())
}
