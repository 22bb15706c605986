// pubsub/shard.rs
//
// One websocket connection and the topics it carries. Runs as its own task,
// takes LISTEN/UNLISTEN commands from the pool, reconnects with backoff and
// pushes parsed messages onto the event bus.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};

use dropminer_common::models::ShardStatus;

use super::messages::{listen_frame, nonce, ping_frame, unlisten_frame, InboundEvent, PubSubFrame, StreamMessage};
use super::socket::{ShardConnector, ShardSocket};
use super::topic::Topic;
use crate::auth::SessionProvider;
use crate::client::ExponentialBackoff;
use crate::constants::{PING_INTERVAL, PING_TIMEOUT, PUBSUB_URL, SHARD_BACKOFF_MAX};
use crate::eventbus::{EventBus, MinerEvent};

#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub url: String,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self {
            url: PUBSUB_URL.to_string(),
            ping_interval: PING_INTERVAL,
            ping_timeout: PING_TIMEOUT,
            backoff_initial: Duration::from_secs(1),
            backoff_max: SHARD_BACKOFF_MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardCommand {
    Listen(Vec<Topic>),
    Unlisten(Vec<Topic>),
    /// Re-sends LISTENs the server rejected, typically after a token refresh.
    Relisten,
    Close,
}

/// Why a connected session ended.
enum SessionEnd {
    Reconnect,
    Close,
}

pub struct ShardTask {
    index: usize,
    config: ShardConfig,
    connector: Arc<dyn ShardConnector>,
    session: Arc<dyn SessionProvider>,
    bus: EventBus,
    commands: mpsc::UnboundedReceiver<ShardCommand>,
    status: watch::Sender<ShardStatus>,
    /// Topics this shard is responsible for.
    topics: BTreeSet<Topic>,
    /// Topics LISTENed on the current connection.
    submitted: BTreeSet<Topic>,
    /// LISTENs awaiting their RESPONSE, by nonce.
    outstanding: HashMap<String, Vec<Topic>>,
    shutdown: watch::Receiver<bool>,
}

impl ShardTask {
    pub fn new(
        index: usize,
        config: ShardConfig,
        connector: Arc<dyn ShardConnector>,
        session: Arc<dyn SessionProvider>,
        bus: EventBus,
        commands: mpsc::UnboundedReceiver<ShardCommand>,
        status: watch::Sender<ShardStatus>,
    ) -> Self {
        let shutdown = bus.shutdown_receiver();
        Self {
            index,
            config,
            connector,
            session,
            bus,
            commands,
            status,
            topics: BTreeSet::new(),
            submitted: BTreeSet::new(),
            outstanding: HashMap::new(),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut backoff = ExponentialBackoff::new(self.config.backoff_initial, self.config.backoff_max);
        let mut first = true;
        loop {
            self.set_status(if first { ShardStatus::Connecting } else { ShardStatus::Reconnecting })
                .await;
            first = false;

            let Some(mut socket) = self.connect(&mut backoff).await else {
                break;
            };
            info!("[Shard {}] connected -> {}", self.index, self.config.url);
            backoff.reset();

            match self.serve(socket.as_mut()).await {
                SessionEnd::Close => {
                    socket.close().await;
                    break;
                }
                SessionEnd::Reconnect => {
                    socket.close().await;
                    self.set_status(ShardStatus::Reconnecting).await;
                    let delay = backoff.next_delay();
                    warn!("[Shard {}] reconnecting in {:?}", self.index, delay);
                    if !self.idle_for(delay).await {
                        break;
                    }
                }
            }
        }
        self.set_status(ShardStatus::Closed).await;
        debug!("[Shard {}] task finished", self.index);
    }

    async fn connect(&mut self, backoff: &mut ExponentialBackoff) -> Option<Box<dyn ShardSocket>> {
        loop {
            if *self.shutdown.borrow() {
                return None;
            }
            let result = tokio::select! {
                r = self.connector.connect(&self.config.url) => r,
                _ = self.shutdown.changed() => return None,
            };
            match result {
                Ok(socket) => return Some(socket),
                Err(e) => {
                    let delay = backoff.next_delay();
                    error!("[Shard {}] connect error: {}; retrying in {:?}", self.index, e, delay);
                    if !self.idle_for(delay).await {
                        return None;
                    }
                }
            }
        }
    }

    /// Waits out a backoff while still tracking topic changes. Returns
    /// `false` when the shard should stop instead.
    async fn idle_for(&mut self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                _ = self.shutdown.changed() => return false,
                cmd = self.commands.recv() => match cmd {
                    Some(ShardCommand::Listen(topics)) => self.topics.extend(topics),
                    Some(ShardCommand::Unlisten(topics)) => {
                        for t in &topics {
                            self.topics.remove(t);
                        }
                    }
                    Some(ShardCommand::Relisten) => {}
                    Some(ShardCommand::Close) | None => return false,
                },
            }
        }
    }

    async fn serve(&mut self, socket: &mut dyn ShardSocket) -> SessionEnd {
        self.submitted.clear();
        self.outstanding.clear();
        self.set_status(ShardStatus::Connected).await;

        let all: Vec<Topic> = self.topics.iter().cloned().collect();
        if self.listen(socket, all).await.is_err() {
            return SessionEnd::Reconnect;
        }

        let period = self.config.ping_interval;
        let mut ping = interval_at(Instant::now() + period, period);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let deadline = pong_deadline;
            let pong_wait = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return SessionEnd::Close,
                cmd = self.commands.recv() => match cmd {
                    Some(ShardCommand::Listen(topics)) => {
                        let fresh: Vec<Topic> = topics
                            .into_iter()
                            .filter(|t| self.topics.insert(t.clone()))
                            .collect();
                        if self.listen(socket, fresh).await.is_err() {
                            return SessionEnd::Reconnect;
                        }
                    }
                    Some(ShardCommand::Unlisten(topics)) => {
                        let gone: Vec<Topic> = topics
                            .into_iter()
                            .filter(|t| self.topics.remove(t))
                            .collect();
                        if self.unlisten(socket, gone).await.is_err() {
                            return SessionEnd::Reconnect;
                        }
                    }
                    Some(ShardCommand::Relisten) => {
                        let all: Vec<Topic> = self.topics.iter().cloned().collect();
                        if self.listen(socket, all).await.is_err() {
                            return SessionEnd::Reconnect;
                        }
                    }
                    Some(ShardCommand::Close) | None => return SessionEnd::Close,
                },
                frame = socket.next_text() => match frame {
                    Some(Ok(text)) => match self.handle_text(&text).await {
                        Some(FrameAction::Reconnect) => return SessionEnd::Reconnect,
                        Some(FrameAction::Pong) => pong_deadline = None,
                        None => {}
                    },
                    Some(Err(e)) => {
                        error!("[Shard {}] read error: {}", self.index, e);
                        return SessionEnd::Reconnect;
                    }
                    None => {
                        warn!("[Shard {}] connection closed by server", self.index);
                        return SessionEnd::Reconnect;
                    }
                },
                _ = ping.tick() => {
                    trace!("[Shard {}] PING", self.index);
                    if socket.send_text(ping_frame()).await.is_err() {
                        return SessionEnd::Reconnect;
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.config.ping_timeout);
                    }
                },
                _ = pong_wait => {
                    warn!("[Shard {}] no PONG within {:?}", self.index, self.config.ping_timeout);
                    return SessionEnd::Reconnect;
                },
            }
        }
    }

    /// LISTENs the topics not yet submitted on this connection.
    async fn listen(&mut self, socket: &mut dyn ShardSocket, topics: Vec<Topic>) -> Result<(), ()> {
        let fresh: Vec<Topic> = topics
            .into_iter()
            .filter(|t| !self.submitted.contains(t))
            .collect();
        if fresh.is_empty() {
            return Ok(());
        }
        let token = self.auth_token().await;
        let names: Vec<String> = fresh.iter().map(Topic::to_string).collect();
        let id = nonce();
        debug!("[Shard {}] LISTEN {} topic(s)", self.index, names.len());
        socket
            .send_text(listen_frame(&id, &names, &token))
            .await
            .map_err(|e| error!("[Shard {}] send failed: {}", self.index, e))?;
        self.submitted.extend(fresh.iter().cloned());
        self.outstanding.insert(id, fresh);
        Ok(())
    }

    async fn unlisten(&mut self, socket: &mut dyn ShardSocket, topics: Vec<Topic>) -> Result<(), ()> {
        let held: Vec<Topic> = topics
            .into_iter()
            .filter(|t| self.submitted.remove(t))
            .collect();
        if held.is_empty() {
            return Ok(());
        }
        let token = self.auth_token().await;
        let names: Vec<String> = held.iter().map(Topic::to_string).collect();
        debug!("[Shard {}] UNLISTEN {} topic(s)", self.index, names.len());
        socket
            .send_text(unlisten_frame(&nonce(), &names, &token))
            .await
            .map_err(|e| error!("[Shard {}] send failed: {}", self.index, e))
    }

    async fn auth_token(&self) -> String {
        match self.session.current().await {
            Ok(s) => s.access_token,
            Err(e) => {
                warn!("[Shard {}] no session for auth token: {}", self.index, e);
                String::new()
            }
        }
    }

    async fn handle_text(&mut self, text: &str) -> Option<FrameAction> {
        let frame = match PubSubFrame::parse(text) {
            Ok(f) => f,
            Err(e) => {
                warn!("[Shard {}] unparseable frame ({}): {}", self.index, e, text);
                return None;
            }
        };
        match frame {
            PubSubFrame::Pong => {
                trace!("[Shard {}] PONG", self.index);
                Some(FrameAction::Pong)
            }
            PubSubFrame::Reconnect => {
                info!("[Shard {}] server requested reconnect", self.index);
                Some(FrameAction::Reconnect)
            }
            PubSubFrame::Response { nonce, error } => {
                let answered = self.outstanding.remove(&nonce);
                if error == "ERR_BADAUTH" {
                    // Without a known nonce every topic on this connection is suspect.
                    let rejected = answered.unwrap_or_else(|| self.submitted.iter().cloned().collect());
                    for t in &rejected {
                        self.submitted.remove(t);
                    }
                    error!("[Shard {}] LISTEN of {} topic(s) rejected: bad auth", self.index, rejected.len());
                    self.bus.publish(MinerEvent::ShardAuthRejected { shard: self.index }).await;
                } else if !error.is_empty() {
                    warn!("[Shard {}] RESPONSE {} error: {}", self.index, nonce, error);
                }
                None
            }
            PubSubFrame::Message { topic, message } => {
                debug!("[Shard {}] MESSAGE on {}", self.index, topic);
                match StreamMessage::parse(&topic, &message).and_then(|m| InboundEvent::from_message(&m)) {
                    Ok(Some(event)) => {
                        self.bus.publish(MinerEvent::Inbound { shard: self.index, event }).await;
                    }
                    Ok(None) => trace!("[Shard {}] ignored message on {}", self.index, topic),
                    Err(e) => warn!("[Shard {}] bad message on {}: {}", self.index, topic, e),
                }
                None
            }
            PubSubFrame::Unknown(kind) => {
                debug!("[Shard {}] unknown frame type {:?}", self.index, kind);
                None
            }
        }
    }

    async fn set_status(&self, status: ShardStatus) {
        if *self.status.borrow() == status {
            return;
        }
        let _ = self.status.send(status);
        self.bus.publish(MinerEvent::ShardStatus { shard: self.index, status }).await;
    }
}

enum FrameAction {
    Pong,
    Reconnect,
}

