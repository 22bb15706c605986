use std::fmt;
use std::str::FromStr;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TopicKind {
    /// Drop progress and claim notices for the user.
    UserDrops,
    /// Site notifications for the user.
    Notifications,
    /// Channel points claims for the user.
    UserPoints,
    /// Stream up/down and viewer counts for a channel.
    StreamState,
    /// Title and game changes for a channel.
    StreamSettings,
}

impl TopicKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            TopicKind::UserDrops => "user-drop-events",
            TopicKind::Notifications => "onsite-notifications",
            TopicKind::UserPoints => "community-points-user-v1",
            TopicKind::StreamState => "video-playback-by-id",
            TopicKind::StreamSettings => "broadcast-settings-update",
        }
    }

    /// User-level topics that may use the reserved pool headroom.
    pub fn is_control(&self) -> bool {
        matches!(self, TopicKind::UserDrops | TopicKind::Notifications | TopicKind::UserPoints)
    }
}

/// A pubsub topic: kind plus the user or channel id it targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic {
    pub kind: TopicKind,
    pub target: String,
}

impl Topic {
    pub fn new(kind: TopicKind, target: impl Into<String>) -> Self {
        Self { kind, target: target.into() }
    }

    pub fn user_topics(user_id: &str) -> [Topic; 3] {
        [
            Topic::new(TopicKind::UserDrops, user_id),
            Topic::new(TopicKind::Notifications, user_id),
            Topic::new(TopicKind::UserPoints, user_id),
        ]
    }

    pub fn channel_topics(channel_id: &str) -> [Topic; 2] {
        [
            Topic::new(TopicKind::StreamState, channel_id),
            Topic::new(TopicKind::StreamSettings, channel_id),
        ]
    }

    pub fn is_control(&self) -> bool {
        self.kind.is_control()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind.prefix(), self.target)
    }
}

impl FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, target) = s
            .rsplit_once('.')
            .ok_or_else(|| Error::Parse(format!("topic without target: {s}")))?;
        let kind = [
            TopicKind::UserDrops,
            TopicKind::Notifications,
            TopicKind::UserPoints,
            TopicKind::StreamState,
            TopicKind::StreamSettings,
        ]
        .into_iter()
        .find(|k| k.prefix() == prefix)
        .ok_or_else(|| Error::Parse(format!("unknown topic: {s}")))?;
        if target.is_empty() {
            return Err(Error::Parse(format!("topic without target: {s}")));
        }
        Ok(Topic::new(kind, target))
    }
}
