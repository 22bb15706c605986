// File: dropminer-core/src/test_utils/helpers.rs

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use dropminer_common::models::{Campaign, CampaignStatus, Drop, Game, Session, StreamInfo};

use crate::api::ChannelObservation;
use crate::Error;

pub fn session(user_id: &str) -> Session {
    Session {
        access_token: format!("token-{user_id}"),
        refresh_token: None,
        user_id: user_id.to_string(),
        login: Some(format!("login{user_id}")),
        client_id: String::new(),
        session_id: "0123456789abcdef".into(),
        device_id: "d".repeat(32),
        expires_at: None,
        created_at: Utc::now(),
    }
}

pub fn game(id: &str, name: &str) -> Game {
    Game::new(id, name)
}

/// A linked campaign running from a day ago to `ends_in` from now, with one
/// drop per entry of `required` (minutes).
pub fn campaign(id: &str, game: &Game, ends_in: ChronoDuration, required: &[u32]) -> Campaign {
    let now = Utc::now();
    let starts_at = now - ChronoDuration::days(1);
    let ends_at = now + ends_in;
    let drops = required
        .iter()
        .enumerate()
        .map(|(i, minutes)| {
            let mut d = Drop::new(
                format!("{id}-d{i}"),
                id,
                format!("Reward {i}"),
                *minutes,
                0,
                false,
                starts_at,
                ends_at,
            );
            d.claim_id = Some(format!("claim-{id}-d{i}"));
            d
        })
        .collect();
    let mut c = Campaign {
        id: id.to_string(),
        name: format!("Campaign {id}"),
        game: game.clone(),
        starts_at,
        ends_at,
        linked: true,
        link_url: String::new(),
        allowed_channels: Vec::new(),
        drops,
        status: CampaignStatus::Upcoming,
    };
    c.refresh_status(now);
    c
}

pub fn live(id: &str, game: &Game, viewers: u32) -> ChannelObservation {
    ChannelObservation {
        id: id.to_string(),
        login: format!("chan{id}"),
        display_name: None,
        stream: Some(StreamInfo {
            broadcast_id: format!("b{id}"),
            game: Some(game.clone()),
            title: String::new(),
            viewers,
            tags: Vec::new(),
            drops_enabled: true,
        }),
    }
}

pub fn offline(id: &str) -> ChannelObservation {
    ChannelObservation {
        id: id.to_string(),
        login: format!("chan{id}"),
        display_name: None,
        stream: None,
    }
}

pub fn at(secs_from_now: i64) -> DateTime<Utc> {
    Utc::now() + ChronoDuration::seconds(secs_from_now)
}

/// Polls `check` until it holds or `limit` passes.
pub async fn wait_until<F>(limit: Duration, mut check: F) -> Result<(), Error>
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + limit;
    while !check() {
        if Instant::now() >= deadline {
            return Err(Error::Task(format!("condition not met within {limit:?}")));
        }
        sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
