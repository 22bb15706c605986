// File: dropminer-common/src/traits/status_sink.rs

use crate::models::status::{ErrorReport, StatusUpdate};

/// Presentation collaborator. The engine only pushes; it never reads back.
///
/// Calls happen on the engine's control loop, so implementations must
/// return quickly and hand any slow work off elsewhere.
pub trait StatusSink: Send + Sync {
    fn update(&self, status: &StatusUpdate);

    fn report_error(&self, report: &ErrorReport);
}

/// Default sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatusSink;

impl StatusSink for NoopStatusSink {
    fn update(&self, _status: &StatusUpdate) {}

    fn report_error(&self, _report: &ErrorReport) {}
}
