use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use dropminer_common::models::{ChannelRef, EngineState, EventVersion, MinerConfig, PriorityMode};
use dropminer_common::ErrorKind;
use dropminer_core::engine::{EngineHandle, EngineParts, MiningEngine};
use dropminer_core::eventbus::{EventBus, MinerEvent};
use dropminer_core::pubsub::{EventStreamPool, InboundEvent, PoolConfig};
use dropminer_core::test_utils::helpers::{campaign, game, live, wait_until};
use dropminer_core::test_utils::{FakeApi, FakeConnector, FakeSession, RecordingSink, WatchBehavior};
use dropminer_core::Error;

const LIMIT: Duration = Duration::from_secs(30);

struct Rig {
    api: FakeApi,
    sink: RecordingSink,
    bus: EventBus,
    session: Arc<FakeSession>,
    connector: FakeConnector,
    handle: EngineHandle,
    task: JoinHandle<EngineState>,
}

impl Rig {
    async fn start(api: &FakeApi, config: MinerConfig) -> Rig {
        Self::start_with(api, config, FakeSession::new("100")).await
    }

    async fn start_with(api: &FakeApi, config: MinerConfig, session: FakeSession) -> Rig {
        let bus = EventBus::new();
        let session = Arc::new(session);
        let connector = FakeConnector::new();
        let pool = EventStreamPool::new(
            PoolConfig::default(),
            Arc::new(connector.clone()),
            session.clone(),
            bus.clone(),
        );
        let sink = RecordingSink::new();
        let parts = EngineParts {
            api: Arc::new(api.clone()),
            session: session.clone(),
            subscriptions: Box::new(pool),
            bus: bus.clone(),
            sink: Arc::new(sink.clone()),
        };
        let (handle, task) = MiningEngine::spawn(config, parts).await;
        Rig {
            api: api.clone(),
            sink,
            bus,
            session,
            connector,
            handle,
            task,
        }
    }

    async fn inbound(&self, event: InboundEvent) {
        self.bus.publish(MinerEvent::Inbound { shard: 0, event }).await;
    }

    fn watched(&self) -> Option<String> {
        self.handle.snapshot().watch.channel.map(|c| c.id)
    }

    async fn wait_watching(&self, id: &str) -> Result<(), Error> {
        wait_until(LIMIT, || self.watched().as_deref() == Some(id)).await
    }

    async fn stop(self) -> Result<EngineState, Error> {
        self.handle.stop().await?;
        self.task.await.map_err(|e| Error::Task(e.to_string()))
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[tokio::test(start_paused = true)]
async fn test_watches_best_channel_and_claims_finished_drop() -> Result<(), Error> {
    let alpha = game("1", "Alpha");
    let api = FakeApi::new();
    api.set_campaigns(vec![campaign("ca", &alpha, ChronoDuration::days(2), &[2])]);
    api.set_directory("1", vec![live("10", &alpha, 50), live("11", &alpha, 500)]);

    let rig = Rig::start(&api, MinerConfig::default()).await;
    rig.wait_watching("11").await?;
    wait_until(LIMIT, || rig.api.watches().first().map(String::as_str) == Some("11")).await?;
    assert!(rig.sink.updates().iter().any(|u| {
        u.current_channel.as_ref().is_some_and(|c| c.id == "11")
            && u.current_drop.as_ref().is_some_and(|d| d.id == "ca-d0")
    }));

    rig.inbound(InboundEvent::DropProgress {
        drop_id: "ca-d0".into(),
        current_minutes: 2,
        required_minutes: 2,
    })
    .await;
    wait_until(LIMIT, || rig.api.claims() == vec!["claim-ca-d0".to_string()]).await?;

    // Nothing left to earn on the only campaign.
    wait_until(LIMIT, || rig.watched().is_none()).await?;
    assert_eq!(rig.api.claims().len(), 1);
    assert_eq!(rig.stop().await?, EngineState::Stopped);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_panic_ends_in_error_once() -> Result<(), Error> {
    let alpha = game("1", "Alpha");
    let api = FakeApi::new();
    api.set_campaigns(vec![campaign("ca", &alpha, ChronoDuration::days(2), &[60])]);
    api.set_directory("1", vec![live("10", &alpha, 50)]);
    api.set_watch_behavior(WatchBehavior::Panic);

    let rig = Rig::start(&api, MinerConfig::default()).await;
    assert_eq!(rig.handle.wait_terminal().await?, EngineState::Error);

    let errors = rig.sink.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].operation, "heartbeat task");
    assert_eq!(errors[0].kind, ErrorKind::Fatal);
    assert_eq!(errors[0].last_state, EngineState::Watching);

    let last = rig.sink.updates().last().cloned().ok_or(Error::Task("no status".into()))?;
    assert_eq!(last.state, EngineState::Error);
    assert!(last.stale);
    assert_eq!(last.current_channel.map(|c| c.id).as_deref(), Some("10"));

    sleep(Duration::from_secs(600)).await;
    assert_eq!(rig.api.watches().len(), 1);
    assert!(rig.api.claims().is_empty());
    assert_eq!(rig.sink.errors().len(), 1);
    assert!(rig.handle.snapshot().stale);
    assert_eq!(rig.task.await.map_err(|e| Error::Task(e.to_string()))?, EngineState::Error);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_priority_only_stays_idle_without_listed_games() -> Result<(), Error> {
    let alpha = game("1", "Alpha");
    let api = FakeApi::new();
    api.set_campaigns(vec![campaign("ca", &alpha, ChronoDuration::days(2), &[60])]);
    api.set_directory("1", vec![live("10", &alpha, 50)]);
    let config = MinerConfig {
        priority: vec!["Beta".into()],
        priority_mode: PriorityMode::PriorityOnly,
        ..Default::default()
    };

    let rig = Rig::start(&api, config).await;
    sleep(Duration::from_secs(900)).await;
    assert!(rig.api.watches().is_empty());
    assert!(rig.watched().is_none());
    assert!(!rig.handle.state().is_terminal());
    assert_eq!(rig.stop().await?, EngineState::Stopped);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_offline_channel_is_replaced() -> Result<(), Error> {
    let alpha = game("1", "Alpha");
    let api = FakeApi::new();
    api.set_campaigns(vec![campaign("ca", &alpha, ChronoDuration::days(2), &[60])]);
    api.set_directory("1", vec![live("10", &alpha, 500), live("11", &alpha, 50)]);

    let rig = Rig::start(&api, MinerConfig::default()).await;
    rig.wait_watching("10").await?;

    rig.inbound(InboundEvent::StreamDown {
        channel_id: "10".into(),
        version: EventVersion::new(now_ms() + 60_000, EventVersion::STREAM_DOWN),
    })
    .await;
    rig.wait_watching("11").await?;
    wait_until(LIMIT, || rig.api.watches().iter().any(|w| w == "11")).await?;
    assert_eq!(rig.stop().await?, EngineState::Stopped);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_priority_channel_coming_online_wins_after_delay() -> Result<(), Error> {
    let alpha = game("1", "Alpha");
    let beta = game("2", "Beta");
    let mut acl = campaign("ca", &alpha, ChronoDuration::days(2), &[60]);
    acl.allowed_channels = vec![ChannelRef { id: "30".into(), login: "chan30".into() }];
    let api = FakeApi::new();
    api.set_campaigns(vec![acl, campaign("cb", &beta, ChronoDuration::days(2), &[60])]);
    api.set_directory("2", vec![live("20", &beta, 10)]);
    let config = MinerConfig {
        priority: vec!["Alpha".into(), "Beta".into()],
        ..Default::default()
    };

    let rig = Rig::start(&api, config).await;
    rig.wait_watching("20").await?;
    assert!(rig.handle.snapshot().channels.iter().any(|c| c.id == "30" && c.acl_based));

    rig.api.set_stream(live("30", &alpha, 5));
    rig.inbound(InboundEvent::StreamUp {
        channel_id: "30".into(),
        version: EventVersion::new(now_ms(), EventVersion::STREAM_UP),
    })
    .await;

    // Stream details are fetched only once the online delay has passed.
    sleep(Duration::from_secs(60)).await;
    assert_eq!(rig.watched().as_deref(), Some("20"));

    rig.wait_watching("30").await?;
    assert_eq!(rig.stop().await?, EngineState::Stopped);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_excluding_watched_game_moves_on() -> Result<(), Error> {
    let alpha = game("1", "Alpha");
    let beta = game("2", "Beta");
    let api = FakeApi::new();
    api.set_campaigns(vec![
        campaign("ca", &alpha, ChronoDuration::days(1), &[60]),
        campaign("cb", &beta, ChronoDuration::days(3), &[60]),
    ]);
    api.set_directory("1", vec![live("10", &alpha, 10)]);
    api.set_directory("2", vec![live("20", &beta, 10)]);

    let rig = Rig::start(&api, MinerConfig::default()).await;
    rig.wait_watching("10").await?;

    let mut config = MinerConfig::default();
    config.exclude.insert("alpha".into());
    rig.handle.apply_config(config).await?;
    rig.wait_watching("20").await?;
    assert!(!rig.handle.snapshot().channels.iter().any(|c| c.id == "10"));
    assert_eq!(rig.stop().await?, EngineState::Stopped);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_reward_reminder_reloads_inventory() -> Result<(), Error> {
    let alpha = game("1", "Alpha");
    let api = FakeApi::new();
    api.set_campaigns(vec![campaign("ca", &alpha, ChronoDuration::days(2), &[60])]);
    api.set_directory("1", vec![live("10", &alpha, 50)]);

    let rig = Rig::start(&api, MinerConfig::default()).await;
    rig.wait_watching("10").await?;
    let before = rig.api.inventory_fetches();

    rig.inbound(InboundEvent::RewardReminder { notification_id: "n1".into() }).await;
    wait_until(LIMIT, || rig.api.inventory_fetches() > before).await?;
    assert_eq!(rig.api.deleted_notifications(), vec!["n1".to_string()]);
    rig.wait_watching("10").await?;
    assert_eq!(rig.stop().await?, EngineState::Stopped);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_rejected_listen_refreshes_session() -> Result<(), Error> {
    let api = FakeApi::new();
    let rig = Rig::start(&api, MinerConfig::default()).await;
    wait_until(LIMIT, || rig.api.inventory_fetches() > 0).await?;
    wait_until(LIMIT, || rig.connector.listened(0).len() == 3).await?;
    let before = rig.connector.listened(0).len();

    let first_listen: serde_json::Value = rig
        .connector
        .sent(0)
        .iter()
        .filter_map(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
        .find(|v| v["type"] == "LISTEN")
        .ok_or(Error::Task("no LISTEN sent".into()))?;
    let rejected_topic = first_listen["data"]["topics"][0].as_str().unwrap_or_default().to_string();
    let nonce = first_listen["nonce"].as_str().unwrap_or_default().to_string();
    rig.connector.push(
        0,
        serde_json::json!({"type": "RESPONSE", "nonce": nonce, "error": "ERR_BADAUTH"}).to_string(),
    );

    wait_until(LIMIT, || rig.session.refresh_count() == 1).await?;
    wait_until(LIMIT, || rig.connector.listened(0).len() == before + 1).await?;
    assert_eq!(rig.connector.listened(0).last(), Some(&rejected_topic));
    assert_eq!(rig.connector.connection_count(), 1);

    // Nothing else was rejected, so no further LISTENs follow.
    sleep(Duration::from_secs(600)).await;
    assert_eq!(rig.connector.listened(0).len(), before + 1);
    assert!(!rig.handle.state().is_terminal());
    assert_eq!(rig.stop().await?, EngineState::Stopped);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stop_releases_and_reports_stopped() -> Result<(), Error> {
    let alpha = game("1", "Alpha");
    let api = FakeApi::new();
    api.set_campaigns(vec![campaign("ca", &alpha, ChronoDuration::days(2), &[60])]);
    api.set_directory("1", vec![live("10", &alpha, 50)]);

    let rig = Rig::start(&api, MinerConfig::default()).await;
    rig.wait_watching("10").await?;
    let handle = rig.handle.clone();
    let sink = rig.sink.clone();
    assert_eq!(rig.stop().await?, EngineState::Stopped);

    let snapshot = handle.snapshot();
    assert_eq!(snapshot.state, EngineState::Stopped);
    assert!(snapshot.watch.channel.is_none());
    assert!(snapshot.shards.is_empty());
    assert_eq!(sink.updates().last().map(|u| u.state), Some(EngineState::Stopped));
    assert!(sink.errors().is_empty());
    assert!(matches!(handle.stop().await, Err(Error::Stopped)));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_manual_action_on_inventory_is_fatal() -> Result<(), Error> {
    let api = FakeApi::new();
    api.fail_inventory_with(|| Error::ManualActionRequired("captcha".into()));

    let rig = Rig::start(&api, MinerConfig::default()).await;
    assert_eq!(rig.handle.wait_terminal().await?, EngineState::Error);
    let errors = rig.sink.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].operation, "fetch inventory");
    assert_eq!(errors[0].kind, ErrorKind::ManualActionRequired);
    assert_eq!(errors[0].last_state, EngineState::FetchInventory);
    assert_eq!(rig.api.inventory_fetches(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_login_ends_in_error() -> Result<(), Error> {
    let api = FakeApi::new();
    let rig = Rig::start_with(&api, MinerConfig::default(), FakeSession::failing()).await;
    assert_eq!(rig.handle.wait_terminal().await?, EngineState::Error);
    let errors = rig.sink.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].operation, "establish session");
    assert_eq!(errors[0].last_state, EngineState::Init);
    assert_eq!(rig.api.inventory_fetches(), 0);
    Ok(())
}
