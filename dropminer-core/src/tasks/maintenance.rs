// dropminer-core/src/tasks/maintenance.rs

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use super::{spawn_critical, TaskFailure};
use crate::eventbus::wait_for_shutdown;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceKind {
    /// A campaign or drop window opened or closed.
    Cleanup,
    /// The periodic full inventory reload.
    Reload,
}

/// What the maintenance task waits for. Replaced after every inventory
/// fetch; replacing it also restarts the reload period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaintenancePlan {
    pub triggers: Vec<DateTime<Utc>>,
    pub period: Duration,
}

pub fn spawn_maintenance_task(
    plan: watch::Receiver<MaintenancePlan>,
    events: mpsc::UnboundedSender<MaintenanceKind>,
    shutdown: watch::Receiver<bool>,
    failures: mpsc::UnboundedSender<TaskFailure>,
) -> JoinHandle<()> {
    spawn_critical("maintenance", failures, run_maintenance(plan, events, shutdown))
}

async fn run_maintenance(
    mut plan: watch::Receiver<MaintenancePlan>,
    events: mpsc::UnboundedSender<MaintenanceKind>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let mut period = plan.borrow_and_update().period;
    let mut next_reload = Instant::now() + period;
    let mut last_fired: Option<DateTime<Utc>> = None;

    loop {
        let now = Utc::now();
        let next_trigger = plan
            .borrow()
            .triggers
            .iter()
            .copied()
            .filter(|t| last_fired.is_none_or(|f| *t > f))
            .min();
        let trigger_at = next_trigger.map(|t| Instant::now() + (t - now).to_std().unwrap_or(Duration::ZERO));

        let kind = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => return Ok(()),
            changed = plan.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                period = plan.borrow_and_update().period;
                next_reload = Instant::now() + period;
                continue;
            }
            _ = sleep_until(next_reload) => {
                next_reload = Instant::now() + period;
                MaintenanceKind::Reload
            }
            _ = sleep_until_opt(trigger_at) => {
                last_fired = next_trigger;
                MaintenanceKind::Cleanup
            }
        };

        debug!("[Maintenance] {:?}", kind);
        if events.send(kind).is_err() {
            return Ok(());
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
