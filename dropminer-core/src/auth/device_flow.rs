//! Wire shapes for the OAuth device-code flow.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCodeResponse {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    pub interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateResponse {
    pub client_id: String,
    #[serde(default)]
    pub login: Option<String>,
    pub user_id: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Body of a 400 from the token endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthErrorBody {
    #[serde(default)]
    pub status: u16,
    #[serde(default)]
    pub message: String,
}

/// How a pending device authorization currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    SlowDown,
    Expired,
    Denied,
    Other(String),
}

impl PollStatus {
    pub fn from_message(message: &str) -> Self {
        match message.trim().to_ascii_lowercase().as_str() {
            "authorization_pending" => PollStatus::Pending,
            "slow_down" => PollStatus::SlowDown,
            "expired_token" | "invalid device code" => PollStatus::Expired,
            "access_denied" => PollStatus::Denied,
            other => PollStatus::Other(other.to_string()),
        }
    }
}
