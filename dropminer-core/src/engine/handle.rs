// dropminer-core/src/engine/handle.rs

use tokio::sync::{mpsc, watch};

use dropminer_common::models::{EngineState, MinerConfig, MinerSnapshot};

use crate::Error;

/// Requests the engine's control loop accepts from outside.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Stop,
    ApplyConfig(MinerConfig),
}

/// Cloneable remote for a running engine. Reads go through snapshots;
/// nothing here touches engine state directly. Dropping every handle stops
/// the engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    snapshots: watch::Receiver<MinerSnapshot>,
}

impl EngineHandle {
    pub(crate) fn new(commands: mpsc::Sender<EngineCommand>, snapshots: watch::Receiver<MinerSnapshot>) -> Self {
        Self { commands, snapshots }
    }

    pub async fn stop(&self) -> Result<(), Error> {
        self.commands.send(EngineCommand::Stop).await.map_err(|_| Error::Stopped)
    }

    /// Replaces the configuration; the engine re-reads it from `UPDATE_GAMES`.
    pub async fn apply_config(&self, config: MinerConfig) -> Result<(), Error> {
        self.commands
            .send(EngineCommand::ApplyConfig(config))
            .await
            .map_err(|_| Error::Stopped)
    }

    pub fn snapshot(&self) -> MinerSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn state(&self) -> EngineState {
        self.snapshots.borrow().state
    }

    /// A receiver that wakes on every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<MinerSnapshot> {
        self.snapshots.clone()
    }

    /// Waits until the engine reaches a state matching `pred`.
    pub async fn wait_for<F>(&self, mut pred: F) -> Result<EngineState, Error>
    where
        F: FnMut(EngineState) -> bool,
    {
        let mut rx = self.snapshots.clone();
        loop {
            let state = rx.borrow_and_update().state;
            if pred(state) {
                return Ok(state);
            }
            if rx.changed().await.is_err() {
                let state = rx.borrow().state;
                return if pred(state) { Ok(state) } else { Err(Error::Stopped) };
            }
        }
    }

    /// Waits for `ERROR` or `STOPPED`.
    pub async fn wait_terminal(&self) -> Result<EngineState, Error> {
        self.wait_for(|s| s.is_terminal()).await
    }
}
