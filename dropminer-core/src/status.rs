//! Status sinks the miner can be configured with.

use std::sync::Arc;
use tracing::{error, info};

use dropminer_common::models::{ErrorReport, StatusSinkKind, StatusUpdate};
use dropminer_common::traits::{NoopStatusSink, StatusSink};

/// Writes every status change to the log. Used by the headless binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

impl StatusSink for LogStatusSink {
    fn update(&self, status: &StatusUpdate) {
        let channel = status.current_channel.as_ref().map(|c| c.login.as_str()).unwrap_or("-");
        let game = status.current_game.as_ref().map(|g| g.name.as_str()).unwrap_or("-");
        match &status.current_drop {
            Some(drop) => info!(
                "[Status] {} | {} | {} | {} ({}) {}/{} min, {:.0}%{}{}",
                status.state,
                channel,
                game,
                drop.name,
                drop.campaign_name,
                drop.current_minutes,
                drop.required_minutes,
                status.progress_fraction * 100.0,
                status
                    .remaining_estimate
                    .map(|d| format!(", ~{}m{:02}s left", d.as_secs() / 60, d.as_secs() % 60))
                    .unwrap_or_default(),
                if status.stale { " (stale)" } else { "" },
            ),
            None => info!(
                "[Status] {} | {} | {}{}",
                status.state,
                channel,
                game,
                if status.stale { " (stale)" } else { "" }
            ),
        }
    }

    fn report_error(&self, report: &ErrorReport) {
        error!(
            "[Status] {} failed in {} ({:?}): {}",
            report.operation, report.last_state, report.kind, report.message
        );
    }
}

pub fn sink_for(kind: StatusSinkKind) -> Arc<dyn StatusSink> {
    match kind {
        StatusSinkKind::Log => Arc::new(LogStatusSink),
        StatusSinkKind::None => Arc::new(NoopStatusSink),
    }
}
