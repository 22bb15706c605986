// File: dropminer-core/src/test_utils/fakes.rs
//
// Scripted stand-ins for the network-facing seams: HTTP transport, pubsub
// socket, session provider, platform API and status sink.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use dropminer_common::models::{Campaign, ChannelRef, ErrorReport, Game, Session, StatusUpdate};
use dropminer_common::traits::StatusSink;

use crate::api::{ChannelObservation, ClaimStatus, CurrentDrop, DropsApi};
use crate::auth::SessionProvider;
use crate::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::pubsub::socket::{ShardConnector, ShardSocket};
use crate::Error;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// -----------------------------------------------------------------------------
// HTTP
// -----------------------------------------------------------------------------

/// Answers requests from a queue of canned responses, recording each request.
/// An empty queue answers 500.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    responses: Arc<Mutex<VecDeque<HttpResponse>>>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: HttpResponse) {
        lock(&self.responses).push_back(response);
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, Error> {
        lock(&self.requests).push(request);
        Ok(lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| HttpResponse::new(500, "no scripted response")))
    }
}

// -----------------------------------------------------------------------------
// Pubsub socket
// -----------------------------------------------------------------------------

struct FakeLink {
    sent: Arc<Mutex<Vec<String>>>,
    inbound: mpsc::UnboundedSender<Option<String>>,
}

#[derive(Default)]
struct ConnectorState {
    links: Vec<FakeLink>,
    refuse: usize,
    mute_pongs: bool,
}

/// Hands out in-memory sockets. Every connection is kept, in order, so a
/// test can inspect what was sent on it or feed it frames. PINGs are
/// answered unless `mute_pongs` was called.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` connection attempts fail.
    pub fn refuse_next(&self, n: usize) {
        lock(&self.state).refuse = n;
    }

    pub fn mute_pongs(&self) {
        lock(&self.state).mute_pongs = true;
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.state).links.len()
    }

    pub fn sent(&self, connection: usize) -> Vec<String> {
        lock(&self.state)
            .links
            .get(connection)
            .map(|l| lock(&l.sent).clone())
            .unwrap_or_default()
    }

    /// Topics named in LISTEN frames on `connection`, in send order.
    pub fn listened(&self, connection: usize) -> Vec<String> {
        frames_of(&self.sent(connection), "LISTEN")
    }

    pub fn unlistened(&self, connection: usize) -> Vec<String> {
        frames_of(&self.sent(connection), "UNLISTEN")
    }

    pub fn push(&self, connection: usize, frame: impl Into<String>) {
        if let Some(link) = lock(&self.state).links.get(connection) {
            let _ = link.inbound.send(Some(frame.into()));
        }
    }

    /// Simulates the server dropping `connection`.
    pub fn disconnect(&self, connection: usize) {
        if let Some(link) = lock(&self.state).links.get(connection) {
            let _ = link.inbound.send(None);
        }
    }
}

fn frames_of(sent: &[String], kind: &str) -> Vec<String> {
    sent.iter()
        .filter_map(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
        .filter(|v| v["type"] == kind)
        .flat_map(|v| {
            v["data"]["topics"]
                .as_array()
                .map(|t| t.iter().filter_map(|s| s.as_str().map(str::to_string)).collect::<Vec<_>>())
                .unwrap_or_default()
        })
        .collect()
}

#[async_trait]
impl ShardConnector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn ShardSocket>, Error> {
        let mut state = lock(&self.state);
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(Error::WebSocket(format!("refused: {url}")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        state.links.push(FakeLink { sent: sent.clone(), inbound: tx.clone() });
        let echo = (!state.mute_pongs).then_some(tx);
        Ok(Box::new(FakeSocket { sent, inbound: rx, echo, closed: false }))
    }
}

struct FakeSocket {
    sent: Arc<Mutex<Vec<String>>>,
    inbound: mpsc::UnboundedReceiver<Option<String>>,
    echo: Option<mpsc::UnboundedSender<Option<String>>>,
    closed: bool,
}

#[async_trait]
impl ShardSocket for FakeSocket {
    async fn send_text(&mut self, text: String) -> Result<(), Error> {
        if self.closed {
            return Err(Error::WebSocket("socket closed".into()));
        }
        if let Some(echo) = &self.echo {
            if text.contains(r#""PING""#) {
                let _ = echo.send(Some(r#"{"type":"PONG"}"#.to_string()));
            }
        }
        lock(&self.sent).push(text);
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String, Error>> {
        if self.closed {
            return None;
        }
        match self.inbound.recv().await {
            Some(Some(text)) => Some(Ok(text)),
            Some(None) | None => {
                self.closed = true;
                None
            }
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

// -----------------------------------------------------------------------------
// Session
// -----------------------------------------------------------------------------

/// Always-logged-in session. `refresh` hands back the same session and
/// counts the calls; `fail_establish` makes `establish` fail.
pub struct FakeSession {
    session: Session,
    refreshes: AtomicUsize,
    fail_establish: bool,
}

impl FakeSession {
    pub fn new(user_id: &str) -> Self {
        Self {
            session: super::helpers::session(user_id),
            refreshes: AtomicUsize::new(0),
            fail_establish: false,
        }
    }

    pub fn failing() -> Self {
        Self { fail_establish: true, ..Self::new("nobody") }
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionProvider for FakeSession {
    async fn establish(&self) -> Result<Session, Error> {
        if self.fail_establish {
            return Err(Error::LoginDenied);
        }
        Ok(self.session.clone())
    }

    async fn current(&self) -> Result<Session, Error> {
        Ok(self.session.clone())
    }

    async fn refresh(&self) -> Result<Session, Error> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(self.session.clone())
    }
}

// -----------------------------------------------------------------------------
// Platform API
// -----------------------------------------------------------------------------

/// What the fake does when asked for a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchBehavior {
    #[default]
    Ok,
    Unreachable,
    Fatal,
    Panic,
}

#[derive(Default)]
struct ApiState {
    campaigns: Vec<Campaign>,
    streams: HashMap<String, ChannelObservation>,
    directories: HashMap<String, Vec<ChannelObservation>>,
    current_drop: Option<CurrentDrop>,
    watch: WatchBehavior,
    inventory_error: Option<fn() -> Error>,
    claims: Vec<String>,
    watches: Vec<String>,
    deleted_notifications: Vec<String>,
    inventory_fetches: usize,
}

/// In-memory platform. Channels and directories are keyed by channel id
/// and game id.
#[derive(Clone, Default)]
pub struct FakeApi {
    state: Arc<Mutex<ApiState>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_campaigns(&self, campaigns: Vec<Campaign>) {
        lock(&self.state).campaigns = campaigns;
    }

    pub fn set_stream(&self, observation: ChannelObservation) {
        lock(&self.state).streams.insert(observation.id.clone(), observation);
    }

    pub fn set_directory(&self, game_id: &str, channels: Vec<ChannelObservation>) {
        for c in &channels {
            self.set_stream(c.clone());
        }
        lock(&self.state).directories.insert(game_id.to_string(), channels);
    }

    pub fn set_current_drop(&self, current: Option<CurrentDrop>) {
        lock(&self.state).current_drop = current;
    }

    pub fn set_watch_behavior(&self, behavior: WatchBehavior) {
        lock(&self.state).watch = behavior;
    }

    pub fn fail_inventory_with(&self, make: fn() -> Error) {
        lock(&self.state).inventory_error = Some(make);
    }

    pub fn claims(&self) -> Vec<String> {
        lock(&self.state).claims.clone()
    }

    pub fn watches(&self) -> Vec<String> {
        lock(&self.state).watches.clone()
    }

    pub fn deleted_notifications(&self) -> Vec<String> {
        lock(&self.state).deleted_notifications.clone()
    }

    pub fn inventory_fetches(&self) -> usize {
        lock(&self.state).inventory_fetches
    }
}

#[async_trait]
impl DropsApi for FakeApi {
    async fn fetch_inventory(&self, now: DateTime<Utc>) -> Result<Vec<Campaign>, Error> {
        let mut state = lock(&self.state);
        state.inventory_fetches += 1;
        if let Some(make) = state.inventory_error {
            return Err(make());
        }
        Ok(state
            .campaigns
            .iter()
            .cloned()
            .map(|mut c| {
                c.refresh_status(now);
                c
            })
            .collect())
    }

    async fn fetch_streams(&self, channels: &[ChannelRef]) -> Result<Vec<ChannelObservation>, Error> {
        let state = lock(&self.state);
        Ok(channels
            .iter()
            .map(|c| {
                state.streams.get(&c.id).cloned().unwrap_or(ChannelObservation {
                    id: c.id.clone(),
                    login: c.login.clone(),
                    display_name: None,
                    stream: None,
                })
            })
            .collect())
    }

    async fn game_directory(&self, game: &Game, limit: usize) -> Result<Vec<ChannelObservation>, Error> {
        let state = lock(&self.state);
        Ok(state
            .directories
            .get(&game.id)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn claim_drop(&self, claim_id: &str) -> Result<ClaimStatus, Error> {
        let mut state = lock(&self.state);
        let already = state.claims.iter().any(|c| c == claim_id);
        state.claims.push(claim_id.to_string());
        Ok(if already { ClaimStatus::AlreadyClaimed } else { ClaimStatus::Claimed })
    }

    async fn current_drop(&self, _channel_id: &str) -> Result<Option<CurrentDrop>, Error> {
        Ok(lock(&self.state).current_drop.clone())
    }

    async fn send_watch(&self, channel: &ChannelRef) -> Result<bool, Error> {
        let behavior = {
            let mut state = lock(&self.state);
            state.watches.push(channel.id.clone());
            state.watch
        };
        match behavior {
            WatchBehavior::Ok => Ok(true),
            WatchBehavior::Unreachable => Ok(false),
            WatchBehavior::Fatal => Err(Error::Fatal("heartbeat rejected".into())),
            WatchBehavior::Panic => panic!("heartbeat blew up"),
        }
    }

    async fn delete_notification(&self, notification_id: &str) -> Result<(), Error> {
        lock(&self.state).deleted_notifications.push(notification_id.to_string());
        Ok(())
    }

    async fn claim_points(&self, _channel_id: &str, _claim_id: &str) -> Result<(), Error> {
        Ok(())
    }

    async fn claim_channel_bonus(&self, _channel: &ChannelRef) -> Result<bool, Error> {
        Ok(false)
    }
}

// -----------------------------------------------------------------------------
// Status sink
// -----------------------------------------------------------------------------

/// Keeps every update and error report it receives.
#[derive(Clone, Default)]
pub struct RecordingSink {
    updates: Arc<Mutex<Vec<StatusUpdate>>>,
    errors: Arc<Mutex<Vec<ErrorReport>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        lock(&self.updates).clone()
    }

    pub fn errors(&self) -> Vec<ErrorReport> {
        lock(&self.errors).clone()
    }
}

impl StatusSink for RecordingSink {
    fn update(&self, update: &StatusUpdate) {
        lock(&self.updates).push(update.clone());
    }

    fn report_error(&self, report: &ErrorReport) {
        lock(&self.errors).push(report.clone());
    }
}
