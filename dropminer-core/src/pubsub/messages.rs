//! PubSub frames in both directions, and the typed events derived from
//! inbound messages.

use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};

use dropminer_common::models::EventVersion;

use super::topic::{Topic, TopicKind};
use crate::Error;

pub fn nonce() -> String {
    rand::rng().sample_iter(&Alphanumeric).take(30).map(char::from).collect()
}

pub fn listen_frame(nonce: &str, topics: &[String], auth_token: &str) -> String {
    json!({
        "type": "LISTEN",
        "nonce": nonce,
        "data": {"topics": topics, "auth_token": auth_token},
    })
    .to_string()
}

pub fn unlisten_frame(nonce: &str, topics: &[String], auth_token: &str) -> String {
    json!({
        "type": "UNLISTEN",
        "nonce": nonce,
        "data": {"topics": topics, "auth_token": auth_token},
    })
    .to_string()
}

pub fn ping_frame() -> String {
    json!({"type": "PING"}).to_string()
}

/// A top-level frame received on a shard.
#[derive(Debug, Clone, PartialEq)]
pub enum PubSubFrame {
    Pong,
    Reconnect,
    Response { nonce: String, error: String },
    Message { topic: String, message: String },
    Unknown(String),
}

impl PubSubFrame {
    pub fn parse(text: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        Ok(match kind {
            "PONG" => PubSubFrame::Pong,
            "RECONNECT" => PubSubFrame::Reconnect,
            "RESPONSE" => PubSubFrame::Response {
                nonce: str_at(&value, "/nonce").to_string(),
                error: str_at(&value, "/error").to_string(),
            },
            "MESSAGE" => PubSubFrame::Message {
                topic: str_at(&value, "/data/topic").to_string(),
                message: str_at(&value, "/data/message").to_string(),
            },
            other => PubSubFrame::Unknown(other.to_string()),
        })
    }
}

/// `{topic, type, payload}` view of a `MESSAGE` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub topic: Topic,
    pub kind: String,
    pub payload: Value,
}

impl StreamMessage {
    pub fn parse(topic: &str, message: &str) -> Result<Self, Error> {
        let topic: Topic = topic.parse()?;
        let payload: Value = serde_json::from_str(message)?;
        let kind = payload.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
        Ok(Self { topic, kind, payload })
    }
}

/// Typed events the engine consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    StreamUp { channel_id: String, version: EventVersion },
    StreamDown { channel_id: String, version: EventVersion },
    ViewerCount { channel_id: String, viewers: u32, version: EventVersion },
    /// Title or game changed; stream details need a re-fetch.
    SettingsChanged { channel_id: String, game: Option<String> },
    DropProgress { drop_id: String, current_minutes: u32, required_minutes: u32 },
    DropClaim { drop_id: String, instance_id: String },
    RewardReminder { notification_id: String },
    PointsClaimAvailable { channel_id: String, claim_id: String },
}

impl InboundEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            InboundEvent::StreamUp { .. } => "stream.up",
            InboundEvent::StreamDown { .. } => "stream.down",
            InboundEvent::ViewerCount { .. } => "stream.viewcount",
            InboundEvent::SettingsChanged { .. } => "stream.settings",
            InboundEvent::DropProgress { .. } => "drop.progress",
            InboundEvent::DropClaim { .. } => "drop.claim",
            InboundEvent::RewardReminder { .. } => "notification.reward_reminder",
            InboundEvent::PointsClaimAvailable { .. } => "points.claim_available",
        }
    }

    /// Channel the event is about, for channel-scoped events.
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            InboundEvent::StreamUp { channel_id, .. }
            | InboundEvent::StreamDown { channel_id, .. }
            | InboundEvent::ViewerCount { channel_id, .. }
            | InboundEvent::SettingsChanged { channel_id, .. }
            | InboundEvent::PointsClaimAvailable { channel_id, .. } => Some(channel_id.as_str()),
            _ => None,
        }
    }

    /// Maps a stream message to an event. Message kinds the miner does not
    /// act on (commercials, other notifications) yield `Ok(None)`.
    pub fn from_message(msg: &StreamMessage) -> Result<Option<Self>, Error> {
        let p = &msg.payload;
        let target = msg.topic.target.clone();
        let event = match (msg.topic.kind, msg.kind.as_str()) {
            (TopicKind::StreamState, "stream-up") => Some(InboundEvent::StreamUp {
                channel_id: target,
                version: version_of(p, EventVersion::STREAM_UP),
            }),
            (TopicKind::StreamState, "stream-down") => Some(InboundEvent::StreamDown {
                channel_id: target,
                version: version_of(p, EventVersion::STREAM_DOWN),
            }),
            (TopicKind::StreamState, "viewcount") => Some(InboundEvent::ViewerCount {
                channel_id: target,
                viewers: u32_at(p, "/viewers")?,
                version: version_of(p, EventVersion::VIEWCOUNT),
            }),
            (TopicKind::StreamSettings, _) => Some(InboundEvent::SettingsChanged {
                channel_id: target,
                game: p.get("game").and_then(Value::as_str).map(str::to_string),
            }),
            (TopicKind::UserDrops, "drop-progress") => Some(InboundEvent::DropProgress {
                drop_id: required_str(p, "/data/drop_id")?,
                current_minutes: u32_at(p, "/data/current_progress_min")?,
                required_minutes: u32_at(p, "/data/required_progress_min")?,
            }),
            (TopicKind::UserDrops, "drop-claim") => Some(InboundEvent::DropClaim {
                drop_id: required_str(p, "/data/drop_id")?,
                instance_id: required_str(p, "/data/drop_instance_id")?,
            }),
            (TopicKind::Notifications, "create-notification") => {
                let kind = str_at(p, "/data/notification/type");
                if kind == "user_drop_reward_reminder_notification" {
                    Some(InboundEvent::RewardReminder {
                        notification_id: required_str(p, "/data/notification/id")?,
                    })
                } else {
                    None
                }
            }
            (TopicKind::UserPoints, "claim-available") => Some(InboundEvent::PointsClaimAvailable {
                channel_id: required_str(p, "/data/claim/channel_id")?,
                claim_id: required_str(p, "/data/claim/id")?,
            }),
            _ => None,
        };
        Ok(event)
    }
}

fn str_at<'a>(v: &'a Value, pointer: &str) -> &'a str {
    v.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

fn required_str(v: &Value, pointer: &str) -> Result<String, Error> {
    v.pointer(pointer)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Parse(format!("missing {pointer}")))
}

fn u32_at(v: &Value, pointer: &str) -> Result<u32, Error> {
    v.pointer(pointer)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| Error::Parse(format!("missing or invalid {pointer}")))
}

fn version_of(p: &Value, rank: u8) -> EventVersion {
    let server_time = p.get("server_time").and_then(Value::as_f64).unwrap_or(0.0);
    EventVersion::from_server_time(server_time, rank)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_drop_progress_message() -> Result<(), Error> {
        let frame = r#"{"type":"MESSAGE","data":{"topic":"user-drop-events.42","message":"{\"type\":\"drop-progress\",\"data\":{\"drop_id\":\"d1\",\"current_progress_min\":20,\"required_progress_min\":60}}"}}"#;
        let PubSubFrame::Message { topic, message } = PubSubFrame::parse(frame)? else {
            panic!("expected a MESSAGE frame");
        };
        let msg = StreamMessage::parse(&topic, &message)?;
        assert_eq!(msg.kind, "drop-progress");
        assert_eq!(
            InboundEvent::from_message(&msg)?,
            Some(InboundEvent::DropProgress {
                drop_id: "d1".into(),
                current_minutes: 20,
                required_minutes: 60
            })
        );
        Ok(())
    }

    #[test]
    fn test_viewcount_carries_server_time() -> Result<(), Error> {
        let msg = StreamMessage::parse(
            "video-playback-by-id.7",
            r#"{"type":"viewcount","server_time":1700000000.25,"viewers":321}"#,
        )?;
        let event = InboundEvent::from_message(&msg)?;
        assert_eq!(
            event,
            Some(InboundEvent::ViewerCount {
                channel_id: "7".into(),
                viewers: 321,
                version: EventVersion::new(1_700_000_000_250, EventVersion::VIEWCOUNT),
            })
        );
        let commercial = StreamMessage::parse("video-playback-by-id.7", r#"{"type":"commercial"}"#)?;
        assert_eq!(InboundEvent::from_message(&commercial)?, None);
        Ok(())
    }

    #[test]
    fn test_listen_frame_shape() -> Result<(), Error> {
        let n = nonce();
        assert_eq!(n.len(), 30);
        let frame: Value = serde_json::from_str(&listen_frame(&n, &["a.1".into()], "tok"))?;
        assert_eq!(frame["type"], "LISTEN");
        assert_eq!(frame["data"]["topics"][0], "a.1");
        assert_eq!(frame["data"]["auth_token"], "tok");
        Ok(())
    }
}
