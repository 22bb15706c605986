// dropminer-core/src/tasks/mod.rs

pub mod heartbeat;
pub mod maintenance;

use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use dropminer_common::ErrorKind;

use crate::Error;

pub use heartbeat::{spawn_heartbeat_task, HeartbeatReport};
pub use maintenance::{spawn_maintenance_task, MaintenanceKind, MaintenancePlan};

/// Why a critical task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub task: &'static str,
    pub kind: ErrorKind,
    pub message: String,
}

/// Spawns a task whose failure must stop the engine. An `Err` return or a
/// panic is sent on `failures`; a clean `Ok(())` is not.
pub fn spawn_critical<F>(name: &'static str, failures: mpsc::UnboundedSender<TaskFailure>, task: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), Error>> + Send + 'static,
{
    tokio::spawn(async move {
        let failure = match AssertUnwindSafe(task).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => TaskFailure {
                task: name,
                kind: e.kind(),
                message: e.to_string(),
            },
            Err(payload) => TaskFailure {
                task: name,
                kind: ErrorKind::Fatal,
                message: format!("panicked: {}", panic_message(payload.as_ref())),
            },
        };
        error!("[Task] {} failed: {}", name, failure.message);
        let _ = failures.send(failure);
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panic_is_reported() -> Result<(), Error> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_critical("boom", tx, async { panic!("kaput") });
        handle.await.map_err(|e| Error::Task(e.to_string()))?;
        let failure = rx.recv().await.ok_or(Error::Task("no failure reported".into()))?;
        assert_eq!(failure.task, "boom");
        assert_eq!(failure.kind, ErrorKind::Fatal);
        assert!(failure.message.contains("kaput"));
        Ok(())
    }

    #[tokio::test]
    async fn test_error_keeps_its_kind_and_clean_exit_is_silent() -> Result<(), Error> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_critical("ok", tx.clone(), async { Ok(()) })
            .await
            .map_err(|e| Error::Task(e.to_string()))?;
        spawn_critical("err", tx, async { Err(Error::ManualActionRequired("captcha".into())) })
            .await
            .map_err(|e| Error::Task(e.to_string()))?;
        let failure = rx.recv().await.ok_or(Error::Task("no failure reported".into()))?;
        assert_eq!(failure.task, "err");
        assert_eq!(failure.kind, ErrorKind::ManualActionRequired);
        assert!(rx.recv().await.is_none());
        Ok(())
    }
}
