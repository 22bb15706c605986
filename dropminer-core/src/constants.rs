//! Endpoints, limits and timer defaults for the platform.

use std::time::Duration;

pub const CLIENT_URL: &str = "https://www.twitch.tv";
/// Android app client; the only one allowed to use the device-code flow.
pub const CLIENT_ID: &str = "kd1unb4b3q4t58fwlpcbzcbnm76a8fp";
pub const USER_AGENT: &str =
    "Dalvik/2.1.0 (Linux; U; Android 7.1.2; SM-G977N Build/LMY48Z) tv.twitch.android.app/16.8.1/1608010";

pub const GQL_URL: &str = "https://gql.twitch.tv/gql";
pub const DEVICE_URL: &str = "https://id.twitch.tv/oauth2/device";
pub const TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
pub const VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
pub const USHER_URL: &str = "https://usher.ttvnw.net/api/channel/hls";
pub const PUBSUB_URL: &str = "wss://pubsub-edge.twitch.tv/v1";

pub const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

// Event stream sizing
pub const MAX_SHARDS: usize = 8;
pub const TOPICS_PER_SHARD: usize = 50;
/// Slots held back for the per-user control topics.
pub const RESERVED_TOPICS: usize = 3;
pub const TOPICS_PER_CHANNEL: usize = 2;
pub const MAX_TOPICS: usize = MAX_SHARDS * TOPICS_PER_SHARD - RESERVED_TOPICS;
pub const MAX_CHANNELS: usize = MAX_TOPICS / TOPICS_PER_CHANNEL;

pub const PING_INTERVAL: Duration = Duration::from_secs(3 * 60);
pub const PING_TIMEOUT: Duration = Duration::from_secs(10);
pub const SHARD_IDLE_GRACE: Duration = Duration::from_secs(30);

// Request pacing
pub const GQL_RATE_PER_SECOND: u32 = 5;
pub const GQL_BATCH_SIZE: usize = 20;
pub const MAX_ATTEMPTS: u32 = 5;
pub const GQL_BACKOFF_MAX: Duration = Duration::from_secs(60);
pub const SHARD_BACKOFF_MAX: Duration = Duration::from_secs(180);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Inbound queue depth between shards and the engine.
pub const INBOUND_BUFFER_SIZE: usize = 10_000;
