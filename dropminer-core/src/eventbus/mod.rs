//! src/eventbus/mod.rs
//!
//! In-process bus carrying shard traffic to the engine over bounded MPSC
//! queues, plus the shutdown signal every long-running task watches.

use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};

use dropminer_common::models::ShardStatus;

use crate::constants::INBOUND_BUFFER_SIZE;
use crate::pubsub::messages::InboundEvent;

/// Everything the event stream pool reports upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum MinerEvent {
    /// A parsed stream message, tagged with the shard that delivered it.
    Inbound { shard: usize, event: InboundEvent },

    ShardStatus { shard: usize, status: ShardStatus },

    /// The server rejected a LISTEN with ERR_BADAUTH.
    ShardAuthRejected { shard: usize },
}

impl MinerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            MinerEvent::Inbound { event, .. } => event.event_type(),
            MinerEvent::ShardStatus { .. } => "shard.status",
            MinerEvent::ShardAuthRejected { .. } => "shard.auth_rejected",
        }
    }
}

/// Each subscriber gets its own `mpsc::Sender<MinerEvent>`.
///
/// - If a subscriber's buffer fills, `publish` waits for space, so events
///   from one shard are never reordered or dropped.
/// - A subscriber that dropped its `Receiver` is pruned on the next publish.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<MinerEvent>>>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    pub shutdown_rx: watch::Receiver<bool>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            subscribers: Arc::new(Mutex::new(vec![])),
            shutdown_tx: Arc::new(tx),
            shutdown_rx: rx,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Returns a receiver on which events will be delivered.
    pub async fn subscribe(&self, buffer_size: Option<usize>) -> mpsc::Receiver<MinerEvent> {
        let size = buffer_size.unwrap_or(INBOUND_BUFFER_SIZE);
        let (tx, rx) = mpsc::channel(size);
        self.subscribers.lock().await.push(tx);
        rx
    }

    /// Publishes to every live subscriber, waiting on full queues.
    pub async fn publish(&self, event: MinerEvent) {
        let senders = {
            let subs = self.subscribers.lock().await;
            subs.clone()
        };
        let mut closed = false;
        for s in senders {
            if s.send(event.clone()).await.is_err() {
                closed = true;
            }
        }
        if closed {
            self.subscribers.lock().await.retain(|s| !s.is_closed());
        }
    }
}

/// Resolves once `rx` reports shutdown (or its sender is gone).
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
