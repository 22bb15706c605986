//! Persisted GQL operations the miner issues.

use serde_json::{json, Map, Value};

/// A persisted query: operation name, its sha256 hash and variables.
#[derive(Debug, Clone, PartialEq)]
pub struct GqlOperation {
    pub name: &'static str,
    pub sha256: &'static str,
    pub variables: Option<Value>,
}

impl GqlOperation {
    pub const fn new(name: &'static str, sha256: &'static str) -> Self {
        Self { name, sha256, variables: None }
    }

    /// Merges `vars` over the operation's default variables, recursively.
    pub fn with_variables(&self, vars: Value) -> Self {
        let mut merged = self.variables.clone().unwrap_or_else(|| Value::Object(Map::new()));
        merge(&mut merged, vars);
        Self { name: self.name, sha256: self.sha256, variables: Some(merged) }
    }

    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "operationName": self.name,
            "extensions": {
                "persistedQuery": {
                    "version": 1,
                    "sha256Hash": self.sha256,
                }
            }
        });
        if let (Some(vars), Some(obj)) = (&self.variables, body.as_object_mut()) {
            obj.insert("variables".to_string(), vars.clone());
        }
        body
    }
}

fn merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(b), Value::Object(p)) => {
            for (k, v) in p {
                merge(b.entry(k).or_insert(Value::Null), v);
            }
        }
        (slot, value) => *slot = value,
    }
}

pub const INVENTORY: GqlOperation = GqlOperation::new(
    "Inventory",
    "37fea486d6179047c41d0f549088a4c3a7dd60c05c70956a1490262f532dccd9",
);

pub const CAMPAIGNS: GqlOperation = GqlOperation::new(
    "ViewerDropsDashboard",
    "8d5d9b5e3f088f9d1ff39eb2caab11f7a4cf7a3353da9ce82b5778226ff37268",
);

/// Variables: `channelLogin` (user id), `dropID` (campaign id).
pub const CAMPAIGN_DETAILS: GqlOperation = GqlOperation::new(
    "DropCampaignDetails",
    "e5916665a37150808f8ad053ed6394b225d5504d175c7c0b01b9a89634c57136",
);

/// Variables: `input.dropInstanceID`.
pub const CLAIM_DROP: GqlOperation = GqlOperation::new(
    "DropsPage_ClaimDropRewards",
    "a455deea71bdc9015b78eb49f4acfbce8baa7ccbedd28e549bb025bd0f751930",
);

/// Variables: `channelID`.
pub const CURRENT_DROP: GqlOperation = GqlOperation::new(
    "DropCurrentSessionContext",
    "2e4b3630b91552eb05b76a94b6850eb25fe42263b7cf6d06bee6d156dd247c1c",
);

/// Variables: `limit`, `slug`, `options.systemFilters`.
pub const GAME_DIRECTORY: GqlOperation = GqlOperation::new(
    "DirectoryPage_Game",
    "3c9a94ee095c735e43ed3ad6ce6d4cbd03c4c6f754b31de54993e0d48fd54e30",
);

/// Variables: `channel` (login).
pub const STREAM_INFO: GqlOperation = GqlOperation::new(
    "VideoPlayerStreamInfoOverlayChannel",
    "a5f2e34d626a9f4f5c0204f910bab2194948a9502089be558bb6e779a9e1b3d2",
);

/// Variables: `channelID`.
pub const AVAILABLE_DROPS: GqlOperation = GqlOperation::new(
    "DropsHighlightService_AvailableDrops",
    "9a62a09bce5b53e26e64a671e530bc599cb6aab1e5ba3cbd5d85966d3940716f",
);

/// Variables: `login`, plus the live-stream defaults set in `playback_token`.
pub const PLAYBACK_ACCESS_TOKEN: GqlOperation = GqlOperation::new(
    "PlaybackAccessToken",
    "ed230aa1e33e07eebb8928504583da78a5173989fadfb1ac94be06a04f3cdbe9",
);

/// Variables: `channelLogin`.
pub const CHANNEL_POINTS_CONTEXT: GqlOperation = GqlOperation::new(
    "ChannelPointsContext",
    "1530a003a7d374b0380b79db0be0534f30ff46e61cffa2bc0e2468a909fbc024",
);

/// Variables: `input.claimID`, `input.channelID`.
pub const CLAIM_COMMUNITY_POINTS: GqlOperation = GqlOperation::new(
    "ClaimCommunityPoints",
    "46aaeebe02c99afdf4fc97c7c0cba964124bf6b0af229395f1f6d1feed05b3d0",
);

/// Variables: `input.id`.
pub const DELETE_NOTIFICATION: GqlOperation = GqlOperation::new(
    "OnsiteNotifications_DeleteNotification",
    "13d463c831f28ffe17dccf55b3148ed8b3edbbd0ebadd56352f1ff0160616816",
);

pub fn playback_token(login: &str) -> GqlOperation {
    PLAYBACK_ACCESS_TOKEN.with_variables(json!({
        "isLive": true,
        "login": login,
        "isVod": false,
        "vodID": "",
        "playerType": "site",
    }))
}

pub fn game_directory(slug: &str, limit: usize) -> GqlOperation {
    GAME_DIRECTORY.with_variables(json!({
        "limit": limit,
        "slug": slug,
        "imageWidth": 50,
        "options": {
            "broadcasterLanguages": [],
            "freeformTags": null,
            "includeRestricted": ["SUB_ONLY_LIVE"],
            "recommendationsContext": {"platform": "web"},
            "sort": "RELEVANCE",
            "tags": [],
            "systemFilters": ["DROPS_ENABLED"],
        },
        "sortTypeIsRecency": false,
        "includeIsDJ": false,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variables_merge_recursively() {
        let op = GAME_DIRECTORY
            .with_variables(json!({"options": {"sort": "RELEVANCE", "tags": []}, "limit": 10}))
            .with_variables(json!({"options": {"sort": "VIEWER_COUNT"}}));
        let body = op.to_json();
        assert_eq!(body["operationName"], "DirectoryPage_Game");
        assert_eq!(body["variables"]["options"]["sort"], "VIEWER_COUNT");
        assert_eq!(body["variables"]["options"]["tags"], json!([]));
        assert_eq!(body["variables"]["limit"], 10);
        assert!(INVENTORY.to_json().get("variables").is_none());
    }
}
