// File: dropminer-common/src/models/watch.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::channel::ChannelRef;

/// What the engine is currently watching. Exactly one per engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchState {
    pub channel: Option<ChannelRef>,
    pub watched_since: Option<DateTime<Utc>>,
    pub accumulated: Duration,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_progress: Option<DateTime<Utc>>,
    /// Drop shown as in progress; follows server progress events.
    pub drop_id: Option<String>,
}

impl WatchState {
    pub fn start(&mut self, channel: ChannelRef, now: DateTime<Utc>) {
        *self = WatchState {
            channel: Some(channel),
            watched_since: Some(now),
            last_progress: Some(now),
            ..Default::default()
        };
    }

    pub fn clear(&mut self) {
        *self = WatchState::default();
    }

    pub fn is_watching(&self, channel_id: &str) -> bool {
        self.channel.as_ref().is_some_and(|c| c.id == channel_id)
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.channel.as_ref().map(|c| c.id.as_str())
    }

    pub fn record_heartbeat(&mut self, now: DateTime<Utc>) {
        if let Some(prev) = self.last_heartbeat {
            if let Ok(elapsed) = (now - prev).to_std() {
                self.accumulated += elapsed;
            }
        }
        self.last_heartbeat = Some(now);
    }

    pub fn record_progress(&mut self, drop_id: &str, now: DateTime<Utc>) {
        self.drop_id = Some(drop_id.to_string());
        self.last_progress = Some(now);
    }

    /// No progress confirmation for longer than `timeout`.
    pub fn progress_overdue(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match self.last_progress {
            Some(at) => (now - at).to_std().map(|e| e > timeout).unwrap_or(false),
            None => true,
        }
    }

    /// Approximate time left on a drop. The current minute counts down from
    /// the last confirmation and stops at zero until the next one arrives.
    pub fn remaining_estimate(&self, remaining_minutes: u32, now: DateTime<Utc>) -> Duration {
        if remaining_minutes == 0 {
            return Duration::ZERO;
        }
        let minute = Duration::from_secs(60);
        let since = self
            .last_progress
            .and_then(|at| (now - at).to_std().ok())
            .unwrap_or(Duration::ZERO);
        let this_minute = minute.saturating_sub(since);
        minute * (remaining_minutes - 1) + this_minute
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_countdown_halts_at_minute_boundary() {
        let now = Utc::now();
        let mut ws = WatchState::default();
        ws.start(ChannelRef { id: "1".into(), login: "a".into() }, now);
        let later = now + chrono::Duration::seconds(20);
        assert_eq!(ws.remaining_estimate(3, later), Duration::from_secs(160));
        let much_later = now + chrono::Duration::seconds(300);
        assert_eq!(ws.remaining_estimate(3, much_later), Duration::from_secs(120));
        assert!(ws.progress_overdue(much_later, Duration::from_secs(60)));
    }
}
