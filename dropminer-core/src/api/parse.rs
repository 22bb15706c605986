//! Turns GQL response objects into models.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

use dropminer_common::models::{Benefit, Campaign, ChannelRef, Drop, Game, StreamInfo};

use super::{ChannelObservation, ClaimStatus, CurrentDrop};
use crate::Error;

fn field<'a>(v: &'a Value, key: &str) -> Result<&'a Value, Error> {
    match v.get(key) {
        Some(Value::Null) | None => Err(Error::Invalid(format!("missing field `{key}`"))),
        Some(inner) => Ok(inner),
    }
}

fn string(v: &Value, key: &str) -> Result<String, Error> {
    match field(v, key)? {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Error::Invalid(format!("`{key}` is not a string: {other}"))),
    }
}

fn opt_string(v: &Value, key: &str) -> Option<String> {
    string(v, key).ok()
}

fn number(v: &Value, key: &str) -> u32 {
    v.get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

pub fn timestamp(v: &Value, key: &str) -> Result<DateTime<Utc>, Error> {
    let raw = string(v, key)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Invalid(format!("`{key}`: bad timestamp {raw:?}: {e}")))
}

pub fn game(v: &Value) -> Result<Game, Error> {
    let name = opt_string(v, "displayName")
        .or_else(|| opt_string(v, "name"))
        .ok_or_else(|| Error::Invalid("game without a name".into()))?;
    Ok(Game::new(string(v, "id")?, name).with_slug(opt_string(v, "slug")))
}

/// Recursively merges two response objects; on conflicting leaves the
/// primary value wins.
pub fn merge_primary(primary: Value, secondary: Value) -> Result<Value, Error> {
    match (primary, secondary) {
        (Value::Object(mut p), Value::Object(s)) => {
            for (k, sv) in s {
                let merged = match p.remove(&k) {
                    Some(pv) => merge_primary(pv, sv)?,
                    None => sv,
                };
                p.insert(k, merged);
            }
            Ok(Value::Object(p))
        }
        (Value::Null, s) => Ok(s),
        (p, Value::Null) => Ok(p),
        (p, s) if std::mem::discriminant(&p) == std::mem::discriminant(&s) => Ok(p),
        (p, s) => Err(Error::Invalid(format!("inconsistent merge data: {p} vs {s}"))),
    }
}

/// Benefit id -> last awarded time, from `inventory.gameEventDrops`.
pub fn claimed_benefits(inventory: &Value) -> HashMap<String, DateTime<Utc>> {
    inventory
        .get("gameEventDrops")
        .and_then(Value::as_array)
        .map(|drops| {
            drops
                .iter()
                .filter_map(|d| Some((string(d, "id").ok()?, timestamp(d, "lastAwardedAt").ok()?)))
                .collect()
        })
        .unwrap_or_default()
}

fn benefit(edge: &Value) -> Result<Benefit, Error> {
    let b = field(edge, "benefit")?;
    Ok(Benefit {
        id: string(b, "id")?,
        name: string(b, "name")?,
        image_url: opt_string(b, "imageAssetURL"),
    })
}

fn drop_from(
    v: &Value,
    campaign_id: &str,
    claimed: &HashMap<String, DateTime<Utc>>,
    user_id: &str,
) -> Result<Drop, Error> {
    let id = string(v, "id")?;
    let starts_at = timestamp(v, "startAt")?;
    let ends_at = timestamp(v, "endAt")?;
    let benefits = v
        .get("benefitEdges")
        .and_then(Value::as_array)
        .map(|edges| edges.iter().filter_map(|e| benefit(e).ok()).collect::<Vec<_>>())
        .unwrap_or_default();

    let (reported, is_claimed, claim_id) = match v.get("self").filter(|s| !s.is_null()) {
        Some(own) => (
            number(own, "currentMinutesWatched"),
            own.get("isClaimed").and_then(Value::as_bool).unwrap_or(false),
            opt_string(own, "dropInstanceID"),
        ),
        None => {
            // Without a `self` edge, awarded benefits inside the drop window
            // mean the drop was claimed.
            let awarded: Vec<&DateTime<Utc>> = benefits.iter().filter_map(|b| claimed.get(&b.id)).collect();
            let was_claimed =
                !awarded.is_empty() && awarded.iter().all(|at| starts_at <= **at && **at < ends_at);
            (0, was_claimed, None)
        }
    };

    let mut drop = Drop::new(
        id.clone(),
        campaign_id,
        string(v, "name")?,
        number(v, "requiredMinutesWatched"),
        reported,
        is_claimed,
        starts_at,
        ends_at,
    );
    drop.benefits = benefits;
    drop.claim_id = Some(claim_id.unwrap_or_else(|| format!("{user_id}#{campaign_id}#{id}")));
    drop.preconditions = v
        .get("preconditionDrops")
        .and_then(Value::as_array)
        .map(|pre| pre.iter().filter_map(|p| opt_string(p, "id")).collect())
        .unwrap_or_default();
    Ok(drop)
}

/// Parses a merged campaign object.
pub fn campaign(
    v: &Value,
    claimed: &HashMap<String, DateTime<Utc>>,
    user_id: &str,
    now: DateTime<Utc>,
) -> Result<Campaign, Error> {
    let id = string(v, "id")?;
    let allow = v.get("allow").filter(|a| !a.is_null());
    let acl_enabled = allow
        .and_then(|a| a.get("isEnabled"))
        .and_then(Value::as_bool)
        .unwrap_or(true);
    let allowed_channels = match allow.and_then(|a| a.get("channels")).and_then(Value::as_array) {
        Some(channels) if acl_enabled => channels
            .iter()
            .filter_map(|c| {
                Some(ChannelRef {
                    id: string(c, "id").ok()?,
                    login: string(c, "name").or_else(|_| string(c, "login")).ok()?,
                })
            })
            .collect(),
        _ => Vec::new(),
    };

    let drops = v
        .get("timeBasedDrops")
        .and_then(Value::as_array)
        .map(|drops| {
            drops
                .iter()
                .map(|d| drop_from(d, &id, claimed, user_id))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    let linked = v
        .pointer("/self/isAccountConnected")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut campaign = Campaign {
        name: string(v, "name")?,
        game: game(field(v, "game")?)?,
        starts_at: timestamp(v, "startAt")?,
        ends_at: timestamp(v, "endAt")?,
        linked,
        link_url: opt_string(v, "accountLinkURL").unwrap_or_default(),
        allowed_channels,
        drops,
        status: dropminer_common::models::CampaignStatus::Upcoming,
        id,
    };
    campaign.refresh_status(now);
    Ok(campaign)
}

fn tags(v: &Value) -> Vec<String> {
    v.get("freeformTags")
        .and_then(Value::as_array)
        .map(|t| t.iter().filter_map(|tag| opt_string(tag, "name")).collect())
        .unwrap_or_default()
}

/// `data.user` of a stream-info query. `Ok(None)` for an unknown channel.
pub fn stream_user(user: &Value) -> Result<Option<ChannelObservation>, Error> {
    if user.is_null() {
        return Ok(None);
    }
    let stream = match user.get("stream").filter(|s| !s.is_null()) {
        Some(s) => {
            let settings = user.get("broadcastSettings").unwrap_or(&Value::Null);
            Some(StreamInfo {
                broadcast_id: string(s, "id")?,
                game: settings.get("game").filter(|g| !g.is_null()).map(game).transpose()?,
                title: opt_string(settings, "title").unwrap_or_default(),
                viewers: number(s, "viewersCount"),
                tags: tags(s),
                drops_enabled: false,
            })
        }
        None => None,
    };
    Ok(Some(ChannelObservation {
        id: string(user, "id")?,
        login: string(user, "login")?,
        display_name: opt_string(user, "displayName"),
        stream,
    }))
}

/// Whether `data.channel.viewerDropCampaigns` lists any timed drops.
pub fn has_available_drops(data: &Value) -> bool {
    data.pointer("/channel/viewerDropCampaigns")
        .and_then(Value::as_array)
        .is_some_and(|campaigns| {
            campaigns.iter().any(|c| {
                c.get("timeBasedDrops")
                    .and_then(Value::as_array)
                    .is_some_and(|d| !d.is_empty())
            })
        })
}

/// Streams listed in a drops-enabled game directory.
pub fn directory(data: &Value) -> Vec<ChannelObservation> {
    let Some(edges) = data.pointer("/game/streams/edges").and_then(Value::as_array) else {
        return Vec::new();
    };
    edges
        .iter()
        .filter_map(|edge| {
            let node = edge.get("node")?;
            let broadcaster = node.get("broadcaster").filter(|b| !b.is_null())?;
            Some(ChannelObservation {
                id: string(broadcaster, "id").ok()?,
                login: string(broadcaster, "login").ok()?,
                display_name: opt_string(broadcaster, "displayName"),
                stream: Some(StreamInfo {
                    broadcast_id: string(node, "id").ok()?,
                    game: node.get("game").and_then(|g| game(g).ok()),
                    title: opt_string(node, "title").unwrap_or_default(),
                    viewers: number(node, "viewersCount"),
                    tags: tags(node),
                    drops_enabled: true,
                }),
            })
        })
        .collect()
}

pub fn claim_status(data: &Value) -> ClaimStatus {
    match data.pointer("/claimDropRewards/status").and_then(Value::as_str) {
        Some("ELIGIBLE_FOR_ALL") => ClaimStatus::Claimed,
        Some("DROP_INSTANCE_ALREADY_CLAIMED") => ClaimStatus::AlreadyClaimed,
        Some(other) => ClaimStatus::Rejected(other.to_string()),
        None => ClaimStatus::Rejected("no claim result".into()),
    }
}

pub fn current_drop(data: &Value) -> Option<CurrentDrop> {
    let session = data.pointer("/currentUser/dropCurrentSession").filter(|s| !s.is_null())?;
    Some(CurrentDrop {
        drop_id: string(session, "dropID").ok()?,
        current_minutes: number(session, "currentMinutesWatched"),
        required_minutes: number(session, "requiredMinutesWatched"),
    })
}

/// Last non-comment line of an HLS playlist, when it is an http(s) URL.
pub fn last_playlist_url(body: &str) -> Option<url::Url> {
    let line = body
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .next_back()?;
    let parsed = url::Url::parse(line).ok()?;
    matches!(parsed.scheme(), "http" | "https").then_some(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn campaign_json() -> Value {
        json!({
            "id": "c1",
            "name": "Spring Event",
            "game": {"id": "33214", "displayName": "Fortnite", "slug": "fortnite"},
            "self": {"isAccountConnected": true},
            "accountLinkURL": "https://example.com/link",
            "startAt": "2026-01-01T00:00:00Z",
            "endAt": "2026-02-01T00:00:00Z",
            "allow": {"isEnabled": true, "channels": [{"id": "7", "name": "seven"}]},
            "timeBasedDrops": [
                {
                    "id": "d1",
                    "name": "Glider",
                    "requiredMinutesWatched": 60,
                    "startAt": "2026-01-01T00:00:00Z",
                    "endAt": "2026-02-01T00:00:00Z",
                    "benefitEdges": [{"benefit": {"id": "b1", "name": "Glider", "imageAssetURL": "x"}}],
                    "self": {"currentMinutesWatched": 20, "isClaimed": false, "dropInstanceID": null},
                    "preconditionDrops": null
                },
                {
                    "id": "d2",
                    "name": "Wrap",
                    "requiredMinutesWatched": 120,
                    "startAt": "2026-01-01T00:00:00Z",
                    "endAt": "2026-02-01T00:00:00Z",
                    "benefitEdges": [{"benefit": {"id": "b2", "name": "Wrap"}}],
                    "preconditionDrops": [{"id": "d1"}]
                }
            ]
        })
    }

    #[test]
    fn test_campaign_parses_drops_and_acl() -> Result<(), Error> {
        let now = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        let awarded = HashMap::from([(
            "b2".to_string(),
            Utc.with_ymd_and_hms(2026, 1, 5, 0, 0, 0).unwrap(),
        )]);
        let c = campaign(&campaign_json(), &awarded, "u1", now)?;
        assert_eq!(c.game.slug, "fortnite");
        assert!(c.linked);
        assert!(c.allows_channel("7"));
        assert!(!c.allows_channel("8"));
        let d1 = c.drop_by_id("d1").unwrap();
        assert_eq!(d1.current_minutes(), 20);
        assert_eq!(d1.claim_id.as_deref(), Some("u1#c1#d1"));
        let d2 = c.drop_by_id("d2").unwrap();
        assert!(d2.claimed, "awarded benefit inside the window marks the drop claimed");
        assert_eq!(d2.preconditions, vec!["d1".to_string()]);
        Ok(())
    }

    #[test]
    fn test_merge_prefers_primary() -> Result<(), Error> {
        let merged = merge_primary(
            json!({"id": "c1", "self": {"isAccountConnected": true}}),
            json!({"id": "c1", "name": "x", "self": {"isAccountConnected": false, "extra": 1}}),
        )?;
        assert_eq!(merged["self"]["isAccountConnected"], true);
        assert_eq!(merged["self"]["extra"], 1);
        assert_eq!(merged["name"], "x");
        assert!(merge_primary(json!({"a": 1}), json!({"a": "s"})).is_err());
        Ok(())
    }

    #[test]
    fn test_playlist_last_url() {
        let master = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nhttps://cdn.example/high.m3u8\n#EXT-X-STREAM-INF:BANDWIDTH=2\nhttps://cdn.example/low.m3u8\n";
        assert_eq!(
            last_playlist_url(master).map(|u| u.to_string()),
            Some("https://cdn.example/low.m3u8".to_string())
        );
        assert!(last_playlist_url("#EXTM3U\nnot a url\n").is_none());
    }
}
