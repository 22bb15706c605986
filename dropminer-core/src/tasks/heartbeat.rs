// dropminer-core/src/tasks/heartbeat.rs

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use dropminer_common::models::ChannelRef;
use dropminer_common::ErrorKind;

use super::{spawn_critical, TaskFailure};
use crate::api::DropsApi;
use crate::eventbus::wait_for_shutdown;
use crate::Error;

/// Outcome of one watch heartbeat, sent back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub channel_id: String,
    /// The stream was reached this cycle.
    pub delivered: bool,
    pub at: DateTime<Utc>,
}

/// Sends a heartbeat for whatever channel `target` holds, once right away
/// and then every `interval`. A new target cancels the call in flight.
pub fn spawn_heartbeat_task(
    api: Arc<dyn DropsApi>,
    target: watch::Receiver<Option<ChannelRef>>,
    interval: Duration,
    reports: mpsc::UnboundedSender<HeartbeatReport>,
    shutdown: watch::Receiver<bool>,
    failures: mpsc::UnboundedSender<TaskFailure>,
) -> JoinHandle<()> {
    spawn_critical(
        "heartbeat",
        failures,
        run_heartbeat(api, target, interval, reports, shutdown),
    )
}

async fn run_heartbeat(
    api: Arc<dyn DropsApi>,
    mut target: watch::Receiver<Option<ChannelRef>>,
    interval: Duration,
    reports: mpsc::UnboundedSender<HeartbeatReport>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    loop {
        let current = target.borrow_and_update().clone();
        let Some(channel) = current else {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
                changed = target.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
            continue;
        };

        let beat = tokio::select! {
            biased;
            _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
            changed = target.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                debug!("[Heartbeat] target changed; dropping call for {}", channel.login);
                continue;
            }
            res = api.send_watch(&channel) => res,
        };

        let delivered = match beat {
            Ok(delivered) => delivered,
            Err(e) if e.is_retryable() || matches!(e.kind(), ErrorKind::NotFound | ErrorKind::Invalid) => {
                warn!("[Heartbeat] {} unreachable: {}", channel.login, e);
                false
            }
            Err(e) => return Err(e),
        };
        trace!("[Heartbeat] {} delivered={}", channel.login, delivered);
        let report = HeartbeatReport {
            channel_id: channel.id.clone(),
            delivered,
            at: Utc::now(),
        };
        if reports.send(report).is_err() {
            return Ok(());
        }

        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
            changed = target.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
            _ = sleep(interval) => {}
        }
    }
}
