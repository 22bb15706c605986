// =============================================================================
// dropminer-core/src/engine/mod.rs
//   The mining engine. One control loop owns the channel registry, the
//   inventory and the watch state, and walks
//     INIT -> FETCH_INVENTORY -> UPDATE_GAMES -> CLEANUP_CHANNELS
//          -> FETCH_CHANNELS -> SWITCH_CHANNEL -> WATCHING
//   until it ends in ERROR or STOPPED. Shards, the heartbeat and the
//   maintenance timer only talk to it over channels.
// =============================================================================

pub mod handle;

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use dropminer_common::models::{
    Channel, ChannelRef, DropSummary, EngineState, ErrorReport, EventVersion, Game, MinerConfig, MinerSnapshot,
    ProgressOutcome, ProgressSource, StatusUpdate, WatchState,
};
use dropminer_common::traits::StatusSink;
use dropminer_common::ErrorKind;

use crate::api::DropsApi;
use crate::auth::SessionProvider;
use crate::constants::MAX_CHANNELS;
use crate::eventbus::{EventBus, MinerEvent};
use crate::inventory::{ClaimError, InventoryStore};
use crate::pubsub::{InboundEvent, Subscriptions, Topic};
use crate::registry::{should_switch, ChannelChange, ChannelRegistry, SelectionContext};
use crate::tasks::{
    spawn_heartbeat_task, spawn_maintenance_task, HeartbeatReport, MaintenanceKind, MaintenancePlan, TaskFailure,
};
use crate::Error;

pub use handle::{EngineCommand, EngineHandle};

/// Collaborators the engine drives. The subscriptions publish onto `bus`.
pub struct EngineParts {
    pub api: Arc<dyn DropsApi>,
    pub session: Arc<dyn SessionProvider>,
    pub subscriptions: Box<dyn Subscriptions>,
    pub bus: EventBus,
    pub sink: Arc<dyn StatusSink>,
}

/// Why the engine ended in `ERROR`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    pub operation: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl Fault {
    fn new(operation: &str, e: &Error) -> Self {
        Self {
            operation: operation.to_string(),
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl From<TaskFailure> for Fault {
    fn from(f: TaskFailure) -> Self {
        Self {
            operation: format!("{} task", f.task),
            kind: f.kind,
            message: f.message,
        }
    }
}

/// Result of one state's work: the next state, or the fault that ends the run.
type Step = Result<EngineState, Fault>;

/// Result of handling one input: `Some(state)` when it demands a transition.
type Reaction = Result<Option<EngineState>, Fault>;

/// What to do after a non-fatal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    /// Retries were exhausted; try again later.
    RetryLater,
    /// The entity is bad; carry on without it.
    Skip,
}

#[derive(Debug)]
enum Input {
    Command(EngineCommand),
    Event(MinerEvent),
    Heartbeat(HeartbeatReport),
    Maintenance(MaintenanceKind),
    Failure(TaskFailure),
    /// A channel's delayed stream re-fetch is due.
    RecheckDue,
    Timeout,
    /// Every handle was dropped or the event bus went away.
    Closed,
}

pub struct MiningEngine {
    config: MinerConfig,
    state: EngineState,

    api: Arc<dyn DropsApi>,
    session: Arc<dyn SessionProvider>,
    subscriptions: Box<dyn Subscriptions>,
    bus: EventBus,
    sink: Arc<dyn StatusSink>,

    registry: ChannelRegistry,
    inventory: InventoryStore,
    watch: WatchState,
    games: Vec<Game>,
    /// Channel id -> when to re-fetch its stream.
    rechecks: HashMap<String, Instant>,
    last_status: Option<StatusUpdate>,

    commands: mpsc::Receiver<EngineCommand>,
    events: mpsc::Receiver<MinerEvent>,
    heartbeats: mpsc::UnboundedReceiver<HeartbeatReport>,
    maintenance: mpsc::UnboundedReceiver<MaintenanceKind>,
    failures: mpsc::UnboundedReceiver<TaskFailure>,
    failures_tx: mpsc::UnboundedSender<TaskFailure>,
    task_senders: Option<(mpsc::UnboundedSender<HeartbeatReport>, mpsc::UnboundedSender<MaintenanceKind>)>,

    snapshot_tx: watch::Sender<MinerSnapshot>,
    target_tx: watch::Sender<Option<ChannelRef>>,
    plan_tx: watch::Sender<MaintenancePlan>,
    tasks: Vec<JoinHandle<()>>,
}

impl MiningEngine {
    pub async fn new(config: MinerConfig, parts: EngineParts) -> (Self, EngineHandle) {
        let (commands_tx, commands) = mpsc::channel(32);
        let (snapshot_tx, snapshot_rx) = watch::channel(MinerSnapshot::default());
        let (target_tx, _) = watch::channel(None);
        let (plan_tx, _) = watch::channel(MaintenancePlan {
            triggers: Vec::new(),
            period: config.intervals.maintenance_period(),
        });
        let (heartbeat_tx, heartbeats) = mpsc::unbounded_channel();
        let (maintenance_tx, maintenance) = mpsc::unbounded_channel();
        let (failures_tx, failures) = mpsc::unbounded_channel();
        let events = parts.bus.subscribe(None).await;

        let engine = Self {
            config,
            state: EngineState::Init,
            api: parts.api,
            session: parts.session,
            subscriptions: parts.subscriptions,
            bus: parts.bus,
            sink: parts.sink,
            registry: ChannelRegistry::new(),
            inventory: InventoryStore::new(),
            watch: WatchState::default(),
            games: Vec::new(),
            rechecks: HashMap::new(),
            last_status: None,
            commands,
            events,
            heartbeats,
            maintenance,
            failures,
            failures_tx,
            task_senders: Some((heartbeat_tx, maintenance_tx)),
            snapshot_tx,
            target_tx,
            plan_tx,
            tasks: Vec::new(),
        };
        (engine, EngineHandle::new(commands_tx, snapshot_rx))
    }

    /// Builds the engine and runs it on its own task.
    pub async fn spawn(config: MinerConfig, parts: EngineParts) -> (EngineHandle, JoinHandle<EngineState>) {
        let (engine, handle) = Self::new(config, parts).await;
        (handle, tokio::spawn(engine.run()))
    }

    /// Runs the state machine to completion and returns the terminal state.
    pub async fn run(mut self) -> EngineState {
        info!("[Engine] starting");
        let mut state = EngineState::Init;
        loop {
            match self.pending_command() {
                Some(EngineState::Stopped) => state = EngineState::Stopped,
                Some(next) if !matches!(state, EngineState::Init | EngineState::FetchInventory) => state = next,
                _ => {}
            }
            self.enter(state);

            let step = match state {
                EngineState::Init => self.init().await,
                EngineState::FetchInventory => self.fetch_inventory().await,
                EngineState::UpdateGames => self.update_games(),
                EngineState::CleanupChannels => self.cleanup_channels(),
                EngineState::FetchChannels => self.fetch_channels().await,
                EngineState::SwitchChannel => self.switch_channel().await,
                EngineState::Watching => self.watching().await,
                EngineState::Stopped => return self.stop().await,
                EngineState::Error => return EngineState::Error,
            };
            state = match step {
                Ok(next) => next,
                Err(fault) => return self.fail(fault).await,
            };
        }
    }

    // -------------------------------------------------------------------------
    // States
    // -------------------------------------------------------------------------

    async fn init(&mut self) -> Step {
        let session = self
            .session
            .establish()
            .await
            .map_err(|e| Fault::new("establish session", &e))?;
        info!(
            "[Engine] logged in as {}",
            session.login.as_deref().unwrap_or(session.user_id.as_str())
        );
        for topic in Topic::user_topics(&session.user_id) {
            self.subscriptions
                .subscribe(topic)
                .map_err(|e| Fault::new("subscribe user topics", &e))?;
        }
        self.start_tasks();
        Ok(EngineState::FetchInventory)
    }

    async fn fetch_inventory(&mut self) -> Step {
        let now = Utc::now();
        let horizon = self.config.intervals.maintenance_period();
        if let Err(e) = self.inventory.refresh(self.api.as_ref(), now, horizon).await {
            let recovery = self.recover("fetch inventory", e)?;
            if recovery == Recovery::Skip && self.inventory.fetched_at().is_some() {
                return Ok(EngineState::UpdateGames);
            }
            let delay = self.config.intervals.idle_poll();
            warn!("[Engine] inventory unavailable; retrying in {:?}", delay);
            return Ok(self.pause(delay).await?.unwrap_or(EngineState::FetchInventory));
        }

        for drop_id in self.inventory.claimable_ids() {
            self.claim(&drop_id).await?;
        }
        self.plan_tx.send_replace(MaintenancePlan {
            triggers: self.inventory.triggers_after(now),
            period: horizon,
        });
        Ok(EngineState::UpdateGames)
    }

    fn update_games(&mut self) -> Step {
        let now = Utc::now();
        self.inventory.refresh_statuses(now);
        self.games = self.inventory.relevant_games(&self.config, now);
        if self.games.is_empty() {
            info!("[Engine] no campaigns to mine right now");
        } else {
            let names: Vec<&str> = self.games.iter().map(|g| g.name.as_str()).collect();
            info!("[Engine] games to mine: {}", names.join(", "));
        }
        Ok(EngineState::CleanupChannels)
    }

    fn cleanup_channels(&mut self) -> Step {
        let inventory = &self.inventory;
        let games = &self.games;
        let removed = self.registry.retain(|c| inventory.references_channel(c, games));
        for id in &removed {
            self.forget_channel(id);
        }
        let reaped = self.subscriptions.reap_idle();
        if !removed.is_empty() || reaped > 0 {
            debug!(
                "[Engine] dropped {} channel(s), closed {} idle shard(s)",
                removed.len(),
                reaped
            );
        }
        Ok(EngineState::FetchChannels)
    }

    async fn fetch_channels(&mut self) -> Step {
        let now = Utc::now();
        for r in self.inventory.acl_channels(&self.games, now) {
            self.registry.ensure(&r, true);
        }

        let known = self.registry.refs();
        if !known.is_empty() {
            match self.api.fetch_streams(&known).await {
                Ok(observed) => {
                    let version = EventVersion::fetched_at(Utc::now());
                    for obs in &observed {
                        self.registry.upsert(obs, version, false);
                    }
                }
                Err(e) => {
                    self.recover("fetch channel streams", e)?;
                }
            }
        }

        for game in self.inventory.directory_games(&self.games, now) {
            match self.api.game_directory(&game, self.config.directory_limit).await {
                Ok(found) => {
                    debug!("[Engine] {} live channel(s) for {}", found.len(), game.name);
                    let version = EventVersion::fetched_at(Utc::now());
                    for obs in &found {
                        self.registry.upsert(obs, version, false);
                    }
                }
                Err(e) => {
                    self.recover("fetch game directory", e)?;
                }
            }
        }

        let ctx = SelectionContext::new(&self.config, self.inventory.campaigns(), now);
        let trimmed = self.registry.trim_to(MAX_CHANNELS, &ctx, self.watch.channel_id());
        for id in &trimmed {
            self.forget_channel(id);
        }

        let ids: Vec<String> = self.registry.all().map(|c| c.id.clone()).collect();
        'channels: for id in &ids {
            for topic in Topic::channel_topics(id) {
                match self.subscriptions.subscribe(topic) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::PoolExhausted => {
                        warn!("[Engine] {}; remaining subscriptions deferred", e);
                        break 'channels;
                    }
                    Err(e) => return Err(Fault::new("subscribe channel topics", &e)),
                }
            }
        }
        info!(
            "[Engine] tracking {} channel(s) on {} topic(s)",
            self.registry.len(),
            self.subscriptions.topic_count()
        );
        Ok(EngineState::SwitchChannel)
    }

    async fn switch_channel(&mut self) -> Step {
        let now = Utc::now();
        let decision = {
            let ctx = SelectionContext::new(&self.config, self.inventory.campaigns(), now);
            let ranked = self.registry.candidates(&ctx);
            should_switch(&ranked, self.watch.channel_id()).then(|| ranked.first().map(|(_, c)| c.to_ref()))
        };
        match decision {
            Some(Some(next)) => {
                self.start_watching(next, now).await;
                Ok(EngineState::Watching)
            }
            Some(None) => {
                self.stop_watching();
                self.idle().await
            }
            None if self.watch.channel.is_some() => Ok(EngineState::Watching),
            None => self.idle().await,
        }
    }

    /// No candidate: wait for the candidate set to change, the idle poll to
    /// elapse, or a stop.
    async fn idle(&mut self) -> Step {
        info!("[Engine] no channel to watch; waiting for one to come online");
        self.push_status();
        let deadline = Instant::now() + self.config.intervals.idle_poll();
        loop {
            match self.next_input(Some(deadline)).await {
                Input::Timeout => return Ok(EngineState::FetchChannels),
                input => {
                    if let Some(next) = self.react(input).await? {
                        return Ok(next);
                    }
                }
            }
        }
    }

    async fn watching(&mut self) -> Step {
        loop {
            let input = self.next_input(None).await;
            if let Some(next) = self.react(input).await? {
                return Ok(next);
            }
        }
    }

    async fn stop(&mut self) -> EngineState {
        info!("[Engine] stopping");
        self.stop_watching();
        self.state = EngineState::Stopped;
        self.push_status();
        self.release().await;
        self.publish_snapshot();
        EngineState::Stopped
    }

    /// Reports the fault once, marks the last status stale and releases
    /// everything. There is no restart from here.
    async fn fail(&mut self, fault: Fault) -> EngineState {
        let last_state = self.state;
        error!(
            "[Engine] {} failed in {} ({:?}): {}",
            fault.operation, last_state, fault.kind, fault.message
        );
        self.sink.report_error(&ErrorReport {
            operation: fault.operation,
            kind: fault.kind,
            message: fault.message,
            last_state,
            at: Utc::now(),
        });

        self.state = EngineState::Error;
        let mut stale = self
            .last_status
            .clone()
            .unwrap_or_else(|| StatusUpdate::idle(last_state));
        stale.state = EngineState::Error;
        stale.stale = true;
        self.sink.update(&stale);
        self.last_status = Some(stale);

        self.release().await;
        self.publish_snapshot();
        EngineState::Error
    }

    // -------------------------------------------------------------------------
    // Inputs
    // -------------------------------------------------------------------------

    async fn next_input(&mut self, deadline: Option<Instant>) -> Input {
        let recheck_at = self.rechecks.values().min().copied();
        tokio::select! {
            biased;
            failure = self.failures.recv() => failure.map(Input::Failure).unwrap_or(Input::Closed),
            command = self.commands.recv() => command.map(Input::Command).unwrap_or(Input::Closed),
            report = self.heartbeats.recv() => report
                .map(Input::Heartbeat)
                .unwrap_or_else(|| Input::Failure(exited("heartbeat"))),
            kind = self.maintenance.recv() => kind
                .map(Input::Maintenance)
                .unwrap_or_else(|| Input::Failure(exited("maintenance"))),
            event = self.events.recv() => event.map(Input::Event).unwrap_or(Input::Closed),
            _ = sleep_until_opt(recheck_at) => Input::RecheckDue,
            _ = sleep_until_opt(deadline) => Input::Timeout,
        }
    }

    async fn react(&mut self, input: Input) -> Reaction {
        match input {
            Input::Command(EngineCommand::Stop) | Input::Closed => Ok(Some(EngineState::Stopped)),
            Input::Command(EngineCommand::ApplyConfig(config)) => {
                self.apply_config(config);
                Ok(Some(EngineState::UpdateGames))
            }
            Input::Failure(failure) => Err(failure.into()),
            Input::Event(event) => self.on_event(event).await,
            Input::Heartbeat(report) => self.on_heartbeat(report).await,
            Input::Maintenance(MaintenanceKind::Cleanup) => Ok(Some(EngineState::UpdateGames)),
            Input::Maintenance(MaintenanceKind::Reload) => Ok(Some(EngineState::FetchInventory)),
            Input::RecheckDue => self.recheck_channels().await,
            Input::Timeout => Ok(None),
        }
    }

    /// Waits out `delay` while still serving inputs.
    async fn pause(&mut self, delay: Duration) -> Reaction {
        let deadline = Instant::now() + delay;
        loop {
            match self.next_input(Some(deadline)).await {
                Input::Timeout => return Ok(None),
                input => {
                    if let Some(next) = self.react(input).await? {
                        return Ok(Some(next));
                    }
                }
            }
        }
    }

    /// Drains queued commands between states that never wait on inputs.
    fn pending_command(&mut self) -> Option<EngineState> {
        let mut next = None;
        while let Ok(command) = self.commands.try_recv() {
            match command {
                EngineCommand::Stop => return Some(EngineState::Stopped),
                EngineCommand::ApplyConfig(config) => {
                    self.apply_config(config);
                    next = Some(EngineState::UpdateGames);
                }
            }
        }
        next
    }

    fn apply_config(&mut self, config: MinerConfig) {
        info!("[Engine] configuration updated");
        let period = config.intervals.maintenance_period();
        if period != self.config.intervals.maintenance_period() {
            self.plan_tx.send_modify(|plan| plan.period = period);
        }
        self.config = config;
    }

    async fn on_event(&mut self, event: MinerEvent) -> Reaction {
        match event {
            MinerEvent::Inbound { event, .. } => self.on_inbound(event).await,
            MinerEvent::ShardStatus { shard, status } => {
                debug!("[Engine] shard {} is {:?}", shard, status);
                self.publish_snapshot();
                Ok(None)
            }
            MinerEvent::ShardAuthRejected { shard } => {
                warn!("[Engine] shard {} rejected the token; refreshing the session", shard);
                self.session
                    .refresh()
                    .await
                    .map_err(|e| Fault::new("refresh session", &e))?;
                self.subscriptions.relisten();
                Ok(None)
            }
        }
    }

    async fn on_inbound(&mut self, event: InboundEvent) -> Reaction {
        match event {
            InboundEvent::DropProgress { drop_id, current_minutes, .. } => {
                self.on_progress(&drop_id, current_minutes, ProgressSource::EventStream).await
            }
            InboundEvent::DropClaim { drop_id, instance_id } => {
                self.inventory.set_claim_id(&drop_id, &instance_id);
                self.claim(&drop_id).await
            }
            InboundEvent::RewardReminder { notification_id } => {
                info!("[Engine] reward reminder received; reloading inventory");
                if let Err(e) = self.api.delete_notification(&notification_id).await {
                    warn!("[Engine] could not delete notification {}: {}", notification_id, e);
                }
                Ok(Some(EngineState::FetchInventory))
            }
            InboundEvent::PointsClaimAvailable { channel_id, claim_id } => {
                if self.config.claim_points_bonus {
                    match self.api.claim_points(&channel_id, &claim_id).await {
                        Ok(()) => info!("[Engine] claimed channel points bonus on {}", channel_id),
                        Err(e) => warn!("[Engine] channel points claim failed: {}", e),
                    }
                }
                Ok(None)
            }
            other => {
                let change = self.registry.apply_event(&other);
                Ok(self.on_channel_change(change))
            }
        }
    }

    fn on_channel_change(&mut self, change: ChannelChange) -> Option<EngineState> {
        match change {
            ChannelChange::Ignored | ChannelChange::ViewersChanged(_) => None,
            ChannelChange::PendingOnline(id) => {
                let delay = self.config.intervals.online_delay();
                self.schedule_recheck(id, delay);
                None
            }
            ChannelChange::NeedsRefresh(id) => {
                self.schedule_recheck(id, Duration::ZERO);
                None
            }
            ChannelChange::WentOffline(id) => {
                self.rechecks.remove(&id);
                if self.watch.is_watching(&id) {
                    info!("[Engine] {} went offline", self.channel_name(&id));
                    Some(EngineState::SwitchChannel)
                } else {
                    None
                }
            }
        }
    }

    async fn on_heartbeat(&mut self, report: HeartbeatReport) -> Reaction {
        if !self.watch.is_watching(&report.channel_id) {
            return Ok(None);
        }
        self.watch.record_heartbeat(report.at);
        if !report.delivered {
            warn!(
                "[Engine] could not reach {}; checking whether it is still live",
                self.channel_name(&report.channel_id)
            );
            self.schedule_recheck(report.channel_id.clone(), Duration::ZERO);
        }
        if self
            .watch
            .progress_overdue(Utc::now(), self.config.intervals.progress_timeout())
        {
            return self.query_progress(&report.channel_id).await;
        }
        self.push_status();
        Ok(None)
    }

    // -------------------------------------------------------------------------
    // Progress and claims
    // -------------------------------------------------------------------------

    async fn on_progress(&mut self, drop_id: &str, minutes: u32, source: ProgressSource) -> Reaction {
        let Some(outcome) = self.inventory.apply_progress(drop_id, minutes, source) else {
            if self.watch.channel.is_none() {
                return Ok(None);
            }
            info!("[Engine] progress for unknown drop {}; reloading inventory", drop_id);
            return Ok(Some(EngineState::FetchInventory));
        };
        if matches!(outcome, ProgressOutcome::Applied { .. } | ProgressOutcome::Duplicate) && self.watch.channel.is_some() {
            self.watch.record_progress(drop_id, Utc::now());
        }
        if self.inventory.drop(drop_id).is_some_and(|d| d.is_claimable()) {
            return self.claim(drop_id).await;
        }
        self.push_status();
        Ok(None)
    }

    /// No confirmation arrived in time: ask the server, else count one
    /// minute as an estimate.
    async fn query_progress(&mut self, channel_id: &str) -> Reaction {
        match self.api.current_drop(channel_id).await {
            Ok(Some(current)) => {
                return self
                    .on_progress(&current.drop_id, current.current_minutes, ProgressSource::SessionQuery)
                    .await;
            }
            Ok(None) => {}
            Err(e) => {
                self.recover("query drop progress", e)?;
            }
        }

        let Some(drop_id) = self.watched_drop_id(Utc::now()) else {
            self.push_status();
            return Ok(None);
        };
        if self.inventory.estimate_minute(&drop_id).is_some_and(|o| o.applied()) {
            debug!("[Engine] no progress confirmation; estimated a minute on {}", drop_id);
        }
        self.watch.record_progress(&drop_id, Utc::now());
        if self.inventory.drop(&drop_id).is_some_and(|d| d.is_claimable()) {
            return self.claim(&drop_id).await;
        }
        self.push_status();
        Ok(None)
    }

    async fn claim(&mut self, drop_id: &str) -> Reaction {
        match self.inventory.claim(drop_id, self.api.as_ref()).await {
            Ok(_) => {
                let next = self.after_claim();
                self.push_status();
                Ok(next)
            }
            Err(ClaimError::NotReady(reason)) => {
                debug!("[Engine] {} not claimable yet: {}", drop_id, reason);
                Ok(None)
            }
            Err(ClaimError::UnknownDrop(_)) => Ok(Some(EngineState::FetchInventory)),
            Err(ClaimError::NetworkError(e)) => {
                warn!("[Engine] claim for {} will be retried: {}", drop_id, e);
                Ok(None)
            }
            Err(ClaimError::Fatal(e)) => {
                self.recover("claim drop", e)?;
                Ok(None)
            }
        }
    }

    /// Moves the watch on to the next drop, or asks for a switch when the
    /// channel has nothing left to earn.
    fn after_claim(&mut self) -> Option<EngineState> {
        let id = self.watch.channel_id()?.to_string();
        let next = self
            .registry
            .get(&id)
            .and_then(|c| self.inventory.active_drop(c, Utc::now()))
            .map(|d| d.id.clone());
        match next {
            Some(drop_id) => {
                self.watch.drop_id = Some(drop_id);
                None
            }
            None => {
                info!("[Engine] nothing left to earn on {}", self.channel_name(&id));
                Some(EngineState::SwitchChannel)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Channels
    // -------------------------------------------------------------------------

    fn schedule_recheck(&mut self, id: String, delay: Duration) {
        let at = Instant::now() + delay;
        self.rechecks
            .entry(id)
            .and_modify(|t| *t = (*t).min(at))
            .or_insert(at);
    }

    /// Re-fetches every channel whose recheck is due.
    async fn recheck_channels(&mut self) -> Reaction {
        let now = Instant::now();
        let due: Vec<String> = self
            .rechecks
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let mut refs = Vec::with_capacity(due.len());
        for id in &due {
            self.rechecks.remove(id);
            if let Some(channel) = self.registry.get(id) {
                refs.push(channel.to_ref());
            }
        }
        if refs.is_empty() {
            return Ok(None);
        }

        match self.api.fetch_streams(&refs).await {
            Ok(observed) => {
                let version = EventVersion::fetched_at(Utc::now());
                let mut changed = false;
                for obs in &observed {
                    changed |= self.registry.upsert(obs, version, false);
                }
                Ok(if changed { self.reevaluate() } else { None })
            }
            Err(e) => {
                if self.recover("refresh channel streams", e)? == Recovery::RetryLater {
                    let delay = self.config.intervals.online_delay();
                    for r in refs {
                        self.schedule_recheck(r.id, delay);
                    }
                }
                Ok(None)
            }
        }
    }

    /// Asks for a switch when the candidate set now ranks differently.
    fn reevaluate(&self) -> Option<EngineState> {
        let ctx = SelectionContext::new(&self.config, self.inventory.campaigns(), Utc::now());
        let ranked = self.registry.candidates(&ctx);
        should_switch(&ranked, self.watch.channel_id()).then_some(EngineState::SwitchChannel)
    }

    fn forget_channel(&mut self, id: &str) {
        for topic in Topic::channel_topics(id) {
            self.subscriptions.unsubscribe(&topic);
        }
        self.rechecks.remove(id);
    }

    async fn start_watching(&mut self, channel: ChannelRef, now: DateTime<Utc>) {
        match &self.watch.channel {
            Some(prev) => info!("[Engine] switching from {} to {}", prev.login, channel.login),
            None => info!("[Engine] watching {}", channel.login),
        }
        self.watch.start(channel.clone(), now);
        self.watch.drop_id = self.watched_drop_id(now);
        self.target_tx.send_replace(Some(channel.clone()));

        if self.config.claim_points_bonus {
            match self.api.claim_channel_bonus(&channel).await {
                Ok(true) => info!("[Engine] claimed channel points bonus on {}", channel.login),
                Ok(false) => {}
                Err(e) => debug!("[Engine] channel points check failed: {}", e),
            }
        }
        self.push_status();
    }

    fn stop_watching(&mut self) {
        if let Some(channel) = &self.watch.channel {
            info!("[Engine] stopped watching {}", channel.login);
            self.watch.clear();
            self.target_tx.send_replace(None);
        }
    }

    fn watched_drop_id(&self, now: DateTime<Utc>) -> Option<String> {
        if let Some(id) = self.watch.drop_id.as_ref().filter(|id| {
            self.inventory.drop(id).is_some_and(|d| !d.claimed)
        }) {
            return Some(id.clone());
        }
        let channel = self.registry.get(self.watch.channel_id()?)?;
        self.inventory.active_drop(channel, now).map(|d| d.id.clone())
    }

    fn channel_name(&self, id: &str) -> String {
        self.registry
            .get(id)
            .map(|c| c.name().to_string())
            .unwrap_or_else(|| id.to_string())
    }

    // -------------------------------------------------------------------------
    // Plumbing
    // -------------------------------------------------------------------------

    fn start_tasks(&mut self) {
        let Some((heartbeat_tx, maintenance_tx)) = self.task_senders.take() else {
            return;
        };
        let shutdown = self.bus.shutdown_receiver();
        self.tasks.push(spawn_heartbeat_task(
            self.api.clone(),
            self.target_tx.subscribe(),
            self.config.intervals.watch_interval(),
            heartbeat_tx,
            shutdown.clone(),
            self.failures_tx.clone(),
        ));
        self.tasks.push(spawn_maintenance_task(
            self.plan_tx.subscribe(),
            maintenance_tx,
            shutdown,
            self.failures_tx.clone(),
        ));
    }

    /// Sorts a failure that escaped the request layer. Expired auth here
    /// means the silent refresh already failed.
    fn recover(&self, operation: &str, e: Error) -> Result<Recovery, Fault> {
        match e.kind() {
            ErrorKind::Transient | ErrorKind::RateLimited => {
                warn!("[Engine] {} failed after retries: {}", operation, e);
                Ok(Recovery::RetryLater)
            }
            ErrorKind::NotFound | ErrorKind::Invalid | ErrorKind::PoolExhausted => {
                warn!("[Engine] {} skipped: {}", operation, e);
                Ok(Recovery::Skip)
            }
            ErrorKind::AuthExpired | ErrorKind::ManualActionRequired | ErrorKind::Fatal => {
                Err(Fault::new(operation, &e))
            }
        }
    }

    async fn release(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.target_tx.send_replace(None);
        self.events.close();
        self.bus.shutdown();
        self.subscriptions.shutdown().await;
        debug!("[Engine] released all connections");
    }

    fn enter(&mut self, state: EngineState) {
        if self.state != state {
            debug!("[Engine] {} -> {}", self.state, state);
            self.state = state;
            self.push_status();
        }
    }

    /// Pushes the current status to the sink when it changed, and always
    /// republishes the snapshot.
    fn push_status(&mut self) {
        let update = self.status_update(Utc::now());
        if self.last_status.as_ref() != Some(&update) {
            self.sink.update(&update);
            self.last_status = Some(update);
        }
        self.publish_snapshot();
    }

    fn status_update(&self, now: DateTime<Utc>) -> StatusUpdate {
        let mut update = StatusUpdate::idle(self.state);
        let Some(channel) = self.watch.channel.clone() else {
            return update;
        };
        let tracked: Option<&Channel> = self.registry.get(&channel.id);
        update.current_game = tracked.and_then(|c| c.game().cloned());
        let drop = self
            .watch
            .drop_id
            .as_deref()
            .and_then(|id| self.inventory.drop(id))
            .or_else(|| tracked.and_then(|c| self.inventory.active_drop(c, now)));
        if let Some(drop) = drop {
            update.current_drop = Some(DropSummary {
                id: drop.id.clone(),
                name: drop.name.clone(),
                campaign_name: self
                    .inventory
                    .campaign_of(&drop.id)
                    .map(|c| c.name.clone())
                    .unwrap_or_default(),
                current_minutes: drop.current_minutes(),
                required_minutes: drop.required_minutes,
            });
            update.progress_fraction = drop.progress_fraction();
            update.remaining_estimate = Some(self.watch.remaining_estimate(drop.remaining_minutes(), now));
        }
        update.current_channel = Some(channel);
        update
    }

    fn publish_snapshot(&self) {
        self.snapshot_tx.send_replace(MinerSnapshot {
            state: self.state,
            watch: self.watch.clone(),
            campaigns: self.inventory.campaigns().to_vec(),
            channels: self.registry.all().cloned().collect(),
            shards: self.subscriptions.statuses(),
            last_status: self.last_status.clone(),
            stale: self.state == EngineState::Error,
        });
    }
}

fn exited(task: &'static str) -> TaskFailure {
    TaskFailure {
        task,
        kind: ErrorKind::Fatal,
        message: "exited unexpectedly".into(),
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
