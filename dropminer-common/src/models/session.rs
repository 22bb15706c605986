// File: dropminer-common/src/models/session.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An authenticated session. Serialized as the opaque credential blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub login: Option<String>,
    pub client_id: String,
    /// Sent as `Client-Session-Id`; regenerated per process.
    #[serde(default)]
    pub session_id: String,
    /// Sent as `X-Device-Id`; stable across restarts.
    pub device_id: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

/// What the user needs to finish a device-code login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginPrompt {
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    pub poll_interval: u64,
}
