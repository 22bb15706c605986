//! Event stream pool: a bounded set of pubsub shards, each carrying up to
//! `topics_per_shard` topics. The pool decides which shard holds which
//! topic; the shards do the networking.

pub mod messages;
pub mod shard;
pub mod socket;
pub mod topic;

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use dropminer_common::models::ShardStatus;

use crate::auth::SessionProvider;
use crate::constants::{MAX_SHARDS, RESERVED_TOPICS, SHARD_IDLE_GRACE, TOPICS_PER_SHARD};
use crate::eventbus::EventBus;
use crate::Error;

pub use messages::InboundEvent;
pub use shard::{ShardCommand, ShardConfig};
pub use socket::{ShardConnector, ShardSocket, TungsteniteConnector};
pub use topic::{Topic, TopicKind};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_shards: usize,
    pub topics_per_shard: usize,
    /// Capacity only control topics may use.
    pub reserved_topics: usize,
    /// How long an empty shard is kept open for reuse.
    pub idle_grace: Duration,
    pub shard: ShardConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_shards: MAX_SHARDS,
            topics_per_shard: TOPICS_PER_SHARD,
            reserved_topics: RESERVED_TOPICS,
            idle_grace: SHARD_IDLE_GRACE,
            shard: ShardConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn capacity(&self) -> usize {
        self.max_shards * self.topics_per_shard
    }

    /// Topics available to channel subscriptions.
    pub fn channel_capacity(&self) -> usize {
        self.capacity().saturating_sub(self.reserved_topics)
    }
}

/// Topic bookkeeping the engine drives. Implemented by [`EventStreamPool`].
#[async_trait]
pub trait Subscriptions: Send {
    /// Assigns `topic` to a shard. Subscribing an already-held topic is a
    /// no-op. Fails with `PoolExhausted` at capacity.
    fn subscribe(&mut self, topic: Topic) -> Result<(), Error>;

    /// Returns whether the topic was held.
    fn unsubscribe(&mut self, topic: &Topic) -> bool;

    fn is_subscribed(&self, topic: &Topic) -> bool;

    fn topic_count(&self) -> usize;

    /// Closes shards that have been empty for longer than the grace period.
    fn reap_idle(&mut self) -> usize;

    fn statuses(&self) -> Vec<ShardStatus>;

    /// Asks every shard to re-send LISTENs the server rejected.
    fn relisten(&mut self);

    /// Closes every shard and waits for their tasks to finish.
    async fn shutdown(&mut self);
}

struct ShardHandle {
    topics: BTreeSet<Topic>,
    commands: mpsc::UnboundedSender<ShardCommand>,
    status: watch::Receiver<ShardStatus>,
    idle_since: Option<Instant>,
    task: JoinHandle<()>,
}

impl ShardHandle {
    fn send(&self, index: usize, cmd: ShardCommand) {
        if self.commands.send(cmd).is_err() {
            warn!("[Pool] shard {} is gone; command dropped", index);
        }
    }
}

pub struct EventStreamPool {
    config: PoolConfig,
    connector: Arc<dyn ShardConnector>,
    session: Arc<dyn SessionProvider>,
    bus: EventBus,
    shards: BTreeMap<usize, ShardHandle>,
    assignments: HashMap<Topic, usize>,
    next_index: usize,
}

impl EventStreamPool {
    pub fn new(
        config: PoolConfig,
        connector: Arc<dyn ShardConnector>,
        session: Arc<dyn SessionProvider>,
        bus: EventBus,
    ) -> Self {
        Self {
            config,
            connector,
            session,
            bus,
            shards: BTreeMap::new(),
            assignments: HashMap::new(),
            next_index: 0,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard currently holding `topic`.
    pub fn shard_of(&self, topic: &Topic) -> Option<usize> {
        self.assignments.get(topic).copied()
    }

    fn channel_topic_count(&self) -> usize {
        self.assignments.keys().filter(|t| !t.is_control()).count()
    }

    /// First shard with room, preferring ones already carrying topics so
    /// idle shards can drain away.
    fn pick_shard(&self) -> Option<usize> {
        let per_shard = self.config.topics_per_shard;
        let busy = self
            .shards
            .iter()
            .filter(|(_, s)| !s.topics.is_empty() && s.topics.len() < per_shard)
            .map(|(i, _)| *i)
            .next();
        busy.or_else(|| {
            self.shards
                .iter()
                .find(|(_, s)| s.topics.is_empty())
                .map(|(i, _)| *i)
        })
    }

    fn spawn_shard(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ShardStatus::Connecting);
        let task = shard::ShardTask::new(
            index,
            self.config.shard.clone(),
            self.connector.clone(),
            self.session.clone(),
            self.bus.clone(),
            cmd_rx,
            status_tx,
        );
        let handle = tokio::spawn(task.run());
        info!("[Pool] opened shard {} ({} open)", index, self.shards.len() + 1);
        self.shards.insert(
            index,
            ShardHandle {
                topics: BTreeSet::new(),
                commands: cmd_tx,
                status: status_rx,
                idle_since: None,
                task: handle,
            },
        );
        index
    }
}

#[async_trait]
impl Subscriptions for EventStreamPool {
    fn subscribe(&mut self, topic: Topic) -> Result<(), Error> {
        if self.assignments.contains_key(&topic) {
            return Ok(());
        }
        let total = self.assignments.len();
        let at_limit = if topic.is_control() {
            total >= self.config.capacity()
        } else {
            self.channel_topic_count() >= self.config.channel_capacity() || total >= self.config.capacity()
        };
        if at_limit {
            debug!("[Pool] no room for {}", topic);
            return Err(Error::PoolExhausted(format!("no capacity left for {topic}")));
        }

        let index = match self.pick_shard() {
            Some(i) => i,
            None if self.shards.len() < self.config.max_shards => self.spawn_shard(),
            None => return Err(Error::PoolExhausted(format!("all shards full for {topic}"))),
        };
        let Some(shard) = self.shards.get_mut(&index) else {
            return Err(Error::Fatal(format!("shard {index} vanished")));
        };
        shard.topics.insert(topic.clone());
        shard.idle_since = None;
        shard.send(index, ShardCommand::Listen(vec![topic.clone()]));
        self.assignments.insert(topic, index);
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &Topic) -> bool {
        let Some(index) = self.assignments.remove(topic) else {
            return false;
        };
        if let Some(shard) = self.shards.get_mut(&index) {
            shard.topics.remove(topic);
            shard.send(index, ShardCommand::Unlisten(vec![topic.clone()]));
            if shard.topics.is_empty() {
                debug!("[Pool] shard {} is now idle", index);
                shard.idle_since = Some(Instant::now());
            }
        }
        true
    }

    fn is_subscribed(&self, topic: &Topic) -> bool {
        self.assignments.contains_key(topic)
    }

    fn topic_count(&self) -> usize {
        self.assignments.len()
    }

    fn reap_idle(&mut self) -> usize {
        let grace = self.config.idle_grace;
        let expired: Vec<usize> = self
            .shards
            .iter()
            .filter(|(_, s)| s.idle_since.is_some_and(|since| since.elapsed() >= grace))
            .map(|(i, _)| *i)
            .collect();
        for index in &expired {
            if let Some(shard) = self.shards.remove(index) {
                info!("[Pool] closing idle shard {}", index);
                shard.send(*index, ShardCommand::Close);
            }
        }
        expired.len()
    }

    fn statuses(&self) -> Vec<ShardStatus> {
        self.shards.values().map(|s| *s.status.borrow()).collect()
    }

    fn relisten(&mut self) {
        for (index, shard) in &self.shards {
            shard.send(*index, ShardCommand::Relisten);
        }
    }

    async fn shutdown(&mut self) {
        let shards = std::mem::take(&mut self.shards);
        self.assignments.clear();
        info!("[Pool] shutting down {} shard(s)", shards.len());
        for (index, shard) in shards {
            shard.send(index, ShardCommand::Close);
            if timeout(Duration::from_secs(5), shard.task).await.is_err() {
                warn!("[Pool] shard {} did not stop in time", index);
            }
        }
    }
}
