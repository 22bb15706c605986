// =============================================================================
// dropminer-core/src/api/twitch.rs
//   `DropsApi` over the GQL endpoint and the HLS edge.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use dropminer_common::models::{Campaign, ChannelRef, Game};

use super::parse;
use super::{ChannelObservation, ClaimStatus, CurrentDrop, DropsApi};
use crate::auth::SessionProvider;
use crate::client::gql::{self, GqlOperation};
use crate::client::RequestClient;
use crate::constants::USHER_URL;
use crate::http::HttpRequest;
use crate::Error;

pub struct TwitchGqlApi {
    client: Arc<RequestClient>,
    session: Arc<dyn SessionProvider>,
}

impl TwitchGqlApi {
    pub fn new(client: Arc<RequestClient>, session: Arc<dyn SessionProvider>) -> Self {
        Self { client, session }
    }

    /// Runs one operation; an `AuthExpired` gets one silent refresh.
    async fn gql(&self, op: GqlOperation) -> Result<Value, Error> {
        let session = self.session.current().await?;
        match self.client.call(&op, &session).await {
            Err(Error::AuthExpired(reason)) => {
                debug!("[Gql] {} auth expired ({}), refreshing", op.name, reason);
                let session = self.session.refresh().await?;
                self.client.call(&op, &session).await
            }
            other => other,
        }
    }

    async fn gql_batch(&self, ops: &[GqlOperation]) -> Result<Vec<Value>, Error> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let session = self.session.current().await?;
        match self.client.call_batch(ops, &session).await {
            Err(Error::AuthExpired(reason)) => {
                debug!("[Gql] batch auth expired ({}), refreshing", reason);
                let session = self.session.refresh().await?;
                self.client.call_batch(ops, &session).await
            }
            other => other,
        }
    }

    async fn user_id(&self) -> Result<String, Error> {
        Ok(self.session.current().await?.user_id)
    }

    async fn fetch_text(&self, label: &str, url: &str) -> Result<Option<String>, Error> {
        let resp = self.client.send(label, HttpRequest::get(url)).await?;
        if !resp.is_success() {
            debug!("[Gql] {} returned HTTP {}", label, resp.status);
            return Ok(None);
        }
        Ok(Some(resp.body))
    }
}

fn data(value: &Value) -> &Value {
    value.get("data").unwrap_or(&Value::Null)
}

#[async_trait]
impl DropsApi for TwitchGqlApi {
    async fn fetch_inventory(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>, Error> {
        let user_id = self.user_id().await?;

        let inventory_resp = self.gql(gql::INVENTORY.clone()).await?;
        let inventory = data(&inventory_resp)
            .pointer("/currentUser/inventory")
            .cloned()
            .ok_or_else(|| Error::Invalid("Inventory: no currentUser.inventory".into()))?;
        let claimed = parse::claimed_benefits(&inventory);

        let mut merged: Vec<(String, Value)> = Vec::new();
        if let Some(in_progress) = inventory.get("dropCampaignsInProgress").and_then(Value::as_array) {
            for c in in_progress {
                if let Some(id) = c.get("id").and_then(Value::as_str) {
                    merged.push((id.to_string(), c.clone()));
                }
            }
        }

        let dashboard = self
            .gql(gql::CAMPAIGNS.with_variables(json!({"fetchRewardCampaigns": false})))
            .await?;
        let listed: Vec<Value> = data(&dashboard)
            .pointer("/currentUser/dropCampaigns")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter(|c| matches!(c.get("status").and_then(Value::as_str), Some("ACTIVE" | "UPCOMING")))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let detail_ops: Vec<GqlOperation> = listed
            .iter()
            .filter_map(|c| c.get("id").and_then(Value::as_str))
            .map(|id| gql::CAMPAIGN_DETAILS.with_variables(json!({"channelLogin": user_id, "dropID": id})))
            .collect();
        let details = self.gql_batch(&detail_ops).await?;

        for (summary, detail) in listed.into_iter().zip(details) {
            let full = match data(&detail).pointer("/user/dropCampaign") {
                Some(d) if !d.is_null() => parse::merge_primary(d.clone(), summary)?,
                _ => summary,
            };
            let Some(id) = full.get("id").and_then(Value::as_str).map(str::to_string) else {
                continue;
            };
            match merged.iter_mut().find(|(existing, _)| *existing == id) {
                Some((_, primary)) => {
                    let base = std::mem::take(primary);
                    *primary = parse::merge_primary(base, full)?;
                }
                None => merged.push((id, full)),
            }
        }

        let mut campaigns = Vec::with_capacity(merged.len());
        for (id, raw) in merged {
            match parse::campaign(&raw, &claimed, &user_id, now) {
                Ok(c) => campaigns.push(c),
                Err(e) => warn!("[Inventory] skipping campaign {}: {}", id, e),
            }
        }
        Ok(campaigns)
    }

    async fn fetch_streams(&self, channels: &[ChannelRef]) -> Result<Vec<ChannelObservation>, Error> {
        let ops: Vec<GqlOperation> = channels
            .iter()
            .map(|c| gql::STREAM_INFO.with_variables(json!({"channel": c.login})))
            .collect();
        let responses = self.gql_batch(&ops).await?;

        let mut observed = Vec::with_capacity(responses.len());
        for (channel, resp) in channels.iter().zip(responses) {
            match parse::stream_user(data(&resp).get("user").unwrap_or(&Value::Null)) {
                Ok(Some(obs)) => observed.push(obs),
                Ok(None) => debug!("[Gql] channel {} not found", channel.login),
                Err(e) => warn!("[Gql] bad stream info for {}: {}", channel.login, e),
            }
        }

        // Stream info does not say whether drops are on; ask for the live ones.
        let live: Vec<usize> = observed
            .iter()
            .enumerate()
            .filter(|(_, o)| o.stream.is_some())
            .map(|(i, _)| i)
            .collect();
        let drop_ops: Vec<GqlOperation> = live
            .iter()
            .map(|&i| gql::AVAILABLE_DROPS.with_variables(json!({"channelID": observed[i].id})))
            .collect();
        match self.gql_batch(&drop_ops).await {
            Ok(results) => {
                for (i, resp) in live.into_iter().zip(results) {
                    if let Some(stream) = observed[i].stream.as_mut() {
                        stream.drops_enabled = parse::has_available_drops(data(&resp));
                    }
                }
            }
            Err(e) if e.is_retryable() => warn!("[Gql] AvailableDrops failed: {}", e),
            Err(e) => return Err(e),
        }
        Ok(observed)
    }

    async fn game_directory(&self, game: &Game, limit: usize) -> Result<Vec<ChannelObservation>, Error> {
        let resp = self.gql(gql::game_directory(&game.slug, limit)).await?;
        let channels = parse::directory(data(&resp));
        debug!("[Gql] directory for {} returned {} channel(s)", game, channels.len());
        Ok(channels)
    }

    async fn claim_drop(&self, claim_id: &str) -> Result<ClaimStatus, Error> {
        let resp = self
            .gql(gql::CLAIM_DROP.with_variables(json!({"input": {"dropInstanceID": claim_id}})))
            .await?;
        Ok(parse::claim_status(data(&resp)))
    }

    async fn current_drop(&self, channel_id: &str) -> Result<Option<CurrentDrop>, Error> {
        let resp = self
            .gql(gql::CURRENT_DROP.with_variables(json!({"channelID": channel_id, "channelLogin": ""})))
            .await?;
        Ok(parse::current_drop(data(&resp)))
    }

    async fn send_watch(&self, channel: &ChannelRef) -> Result<bool, Error> {
        let resp = self.gql(gql::playback_token(&channel.login)).await?;
        let token = data(&resp).get("streamPlaybackAccessToken").unwrap_or(&Value::Null);
        let (Some(sig), Some(value)) = (
            token.get("signature").and_then(Value::as_str),
            token.get("value").and_then(Value::as_str),
        ) else {
            debug!("[Gql] no playback token for {}", channel.login);
            return Ok(false);
        };

        let mut master = url::Url::parse(&format!("{USHER_URL}/{}.m3u8", channel.login))
            .map_err(|e| Error::Invalid(format!("usher url: {e}")))?;
        master.query_pairs_mut().append_pair("sig", sig).append_pair("token", value);

        let Some(qualities) = self.fetch_text("Usher", master.as_str()).await? else {
            return Ok(false);
        };
        let Some(variant) = parse::last_playlist_url(&qualities) else {
            return Ok(false);
        };
        let Some(segments) = self.fetch_text("Playlist", variant.as_str()).await? else {
            return Ok(false);
        };
        let Some(segment) = parse::last_playlist_url(&segments) else {
            return Ok(false);
        };
        let head = self.client.send("Segment", HttpRequest::head(segment.as_str())).await?;
        Ok(head.status == 200)
    }

    async fn delete_notification(&self, notification_id: &str) -> Result<(), Error> {
        self.gql(gql::DELETE_NOTIFICATION.with_variables(json!({"input": {"id": notification_id}})))
            .await?;
        Ok(())
    }

    async fn claim_points(&self, channel_id: &str, claim_id: &str) -> Result<(), Error> {
        self.gql(gql::CLAIM_COMMUNITY_POINTS.with_variables(json!({
            "input": {"channelID": channel_id, "claimID": claim_id}
        })))
        .await?;
        info!("[Gql] claimed bonus points on channel {}", channel_id);
        Ok(())
    }

    async fn claim_channel_bonus(&self, channel: &ChannelRef) -> Result<bool, Error> {
        let resp = self
            .gql(gql::CHANNEL_POINTS_CONTEXT.with_variables(json!({"channelLogin": channel.login})))
            .await?;
        let claim = data(&resp)
            .pointer("/community/channel/self/communityPoints/availableClaim/id")
            .and_then(Value::as_str)
            .map(str::to_string);
        match claim {
            Some(claim_id) => {
                self.claim_points(&channel.id, &claim_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::http::HttpResponse;
    use crate::test_utils::{FakeSession, ScriptedTransport};
    use chrono::TimeZone;

    fn api(transport: &ScriptedTransport) -> TwitchGqlApi {
        let client = RequestClient::new(Arc::new(transport.clone()), ClientConfig::default());
        TwitchGqlApi::new(Arc::new(client), Arc::new(FakeSession::new("u1")))
    }

    #[tokio::test]
    async fn test_claim_drop_maps_statuses() -> Result<(), Error> {
        let transport = ScriptedTransport::new();
        transport.push(HttpResponse::new(200, r#"{"data":{"claimDropRewards":{"status":"ELIGIBLE_FOR_ALL"}}}"#));
        transport.push(HttpResponse::new(
            200,
            r#"{"data":{"claimDropRewards":{"status":"DROP_INSTANCE_ALREADY_CLAIMED"}}}"#,
        ));
        let api = api(&transport);
        assert_eq!(api.claim_drop("x").await?, ClaimStatus::Claimed);
        assert_eq!(api.claim_drop("x").await?, ClaimStatus::AlreadyClaimed);
        Ok(())
    }

    #[tokio::test]
    async fn test_inventory_merges_dashboard_and_details() -> Result<(), Error> {
        let transport = ScriptedTransport::new();
        transport.push(HttpResponse::new(
            200,
            r#"{"data":{"currentUser":{"inventory":{"dropCampaignsInProgress":[],"gameEventDrops":[]}}}}"#,
        ));
        transport.push(HttpResponse::new(
            200,
            r#"{"data":{"currentUser":{"dropCampaigns":[
                {"id":"c1","status":"ACTIVE"},
                {"id":"c2","status":"EXPIRED"}
            ]}}}"#,
        ));
        transport.push(HttpResponse::new(
            200,
            r#"[{"data":{"user":{"dropCampaign":{
                "id":"c1","name":"Event","self":{"isAccountConnected":true},
                "game":{"id":"1","displayName":"Game One","slug":"game-one"},
                "startAt":"2026-01-01T00:00:00Z","endAt":"2026-03-01T00:00:00Z",
                "allow":null,"timeBasedDrops":[]
            }}}}]"#,
        ));
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let campaigns = api(&transport).fetch_inventory(now).await?;
        assert_eq!(campaigns.len(), 1);
        assert_eq!(campaigns[0].game.name, "Game One");
        assert_eq!(transport.requests().len(), 3);
        Ok(())
    }
}
