// File: dropminer-common/src/models/channel.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::game::Game;

/// Minimal channel identity, as found in campaign ACLs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: String,
    pub login: String,
}

/// Live stream details from a full fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub broadcast_id: String,
    pub game: Option<Game>,
    pub title: String,
    pub viewers: u32,
    pub tags: Vec<String>,
    pub drops_enabled: bool,
}

/// Ordering key for channel updates: server timestamp first, then a rank
/// that separates event kinds sharing one timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventVersion {
    pub at_ms: i64,
    pub rank: u8,
}

impl EventVersion {
    pub const FETCH: u8 = 0;
    pub const STREAM_UP: u8 = 1;
    pub const VIEWCOUNT: u8 = 2;
    pub const STREAM_DOWN: u8 = 3;

    pub fn new(at_ms: i64, rank: u8) -> Self {
        Self { at_ms, rank }
    }

    /// PubSub reports `server_time` as fractional epoch seconds.
    pub fn from_server_time(server_time: f64, rank: u8) -> Self {
        Self { at_ms: (server_time * 1000.0).round() as i64, rank }
    }

    pub fn fetched_at(at: DateTime<Utc>) -> Self {
        Self { at_ms: at.timestamp_millis(), rank: Self::FETCH }
    }
}

/// Last-write-wins register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    value: T,
    version: Option<EventVersion>,
}

impl<T> Versioned<T> {
    pub fn new(value: T) -> Self {
        Self { value, version: None }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn version(&self) -> Option<EventVersion> {
        self.version
    }

    /// Stores `value` unless a newer version is already held. Returns
    /// whether the stored value changed.
    pub fn set(&mut self, value: T, version: EventVersion) -> bool
    where
        T: PartialEq,
    {
        if self.version.is_some_and(|held| held > version) {
            return false;
        }
        let changed = self.value != value;
        self.value = value;
        self.version = Some(version);
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub login: String,
    pub display_name: Option<String>,
    /// Came from a campaign ACL rather than the game directory.
    pub acl_based: bool,
    online: Versioned<bool>,
    viewers: Versioned<u32>,
    stream: Versioned<Option<StreamInfo>>,
}

impl Channel {
    pub fn new(id: impl Into<String>, login: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            login: login.into(),
            display_name: None,
            acl_based: false,
            online: Versioned::new(false),
            viewers: Versioned::new(0),
            stream: Versioned::new(None),
        }
    }

    pub fn from_ref(r: &ChannelRef) -> Self {
        Self::new(r.id.clone(), r.login.clone())
    }

    pub fn to_ref(&self) -> ChannelRef {
        ChannelRef { id: self.id.clone(), login: self.login.clone() }
    }

    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.login)
    }

    /// Online with known stream details.
    pub fn is_online(&self) -> bool {
        *self.online.get() && self.stream.get().is_some()
    }

    /// Reported online, but stream details have not been fetched yet.
    pub fn is_pending(&self) -> bool {
        *self.online.get() && self.stream.get().is_none()
    }

    pub fn viewers(&self) -> u32 {
        *self.viewers.get()
    }

    pub fn stream(&self) -> Option<&StreamInfo> {
        self.stream.get().as_ref()
    }

    pub fn game(&self) -> Option<&Game> {
        self.stream().and_then(|s| s.game.as_ref())
    }

    pub fn drops_enabled(&self) -> bool {
        self.stream().is_some_and(|s| s.drops_enabled)
    }

    pub fn apply_stream_up(&mut self, version: EventVersion) -> bool {
        self.online.set(true, version)
    }

    pub fn apply_stream_down(&mut self, version: EventVersion) -> bool {
        let a = self.online.set(false, version);
        let b = self.viewers.set(0, version);
        let c = self.stream.set(None, version);
        a || b || c
    }

    pub fn apply_viewers(&mut self, viewers: u32, version: EventVersion) -> bool {
        let a = self.viewers.set(viewers, version);
        let b = self.online.set(true, version);
        a || b
    }

    /// Applies the result of a full fetch; `None` means offline.
    pub fn apply_observation(&mut self, stream: Option<StreamInfo>, version: EventVersion) -> bool {
        let online = stream.is_some();
        let viewers = stream.as_ref().map(|s| s.viewers).unwrap_or(0);
        let a = self.online.set(online, version);
        let b = self.viewers.set(viewers, version);
        let c = self.stream.set(stream, version);
        a || b || c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_ignores_older_writes() {
        let mut reg = Versioned::new(0u32);
        assert!(reg.set(5, EventVersion::new(10, 2)));
        assert!(!reg.set(3, EventVersion::new(9, 2)));
        assert!(reg.set(7, EventVersion::new(10, 3)));
        assert_eq!(*reg.get(), 7);
    }

    #[test]
    fn test_stream_up_without_details_is_pending() {
        let mut ch = Channel::new("1", "one");
        ch.apply_stream_up(EventVersion::new(1, EventVersion::STREAM_UP));
        assert!(ch.is_pending());
        assert!(!ch.is_online());
    }
}
