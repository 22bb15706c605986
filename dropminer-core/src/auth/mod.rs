// =============================================================================
// dropminer-core/src/auth/mod.rs
//   Device-code login and token lifecycle for the single mining session.
// =============================================================================

pub mod device_flow;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use dropminer_common::models::{LoginPrompt, Session};
use dropminer_common::traits::CredentialStore;

use crate::client::{classify_status, RequestClient};
use crate::constants::{DEVICE_GRANT_TYPE, DEVICE_URL, TOKEN_URL, VALIDATE_URL};
use crate::http::HttpRequest;
use crate::Error;

use device_flow::{DeviceCodeResponse, OAuthErrorBody, PollStatus, TokenResponse, ValidateResponse};

/// Shows the device-login code to whoever runs the miner.
#[async_trait]
pub trait LoginHandler: Send + Sync {
    async fn show_prompt(&self, prompt: &LoginPrompt) -> Result<(), Error>;
}

/// Logs the prompt; used when nothing better is wired in.
#[derive(Default)]
pub struct LogLoginHandler;

#[async_trait]
impl LoginHandler for LogLoginHandler {
    async fn show_prompt(&self, prompt: &LoginPrompt) -> Result<(), Error> {
        info!(
            "[Session] Open {} and enter code {} (expires in {}s)",
            prompt.verification_uri, prompt.user_code, prompt.expires_in
        );
        Ok(())
    }
}

/// What the rest of the miner needs from the session owner.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Restores a stored session or runs a fresh login.
    async fn establish(&self) -> Result<Session, Error>;

    /// The active session, or `Unauthenticated`.
    async fn current(&self) -> Result<Session, Error>;

    /// One silent refresh after an `AuthExpired`. On failure the session is
    /// dropped and `Unauthenticated` returned.
    async fn refresh(&self) -> Result<Session, Error>;
}

struct PendingLogin {
    device_code: String,
    interval: Duration,
    expires_at: Instant,
}

#[derive(Default)]
struct SessionState {
    session: Option<Session>,
    pending: Option<PendingLogin>,
    device_id: Option<String>,
}

pub struct SessionManager {
    client: Arc<RequestClient>,
    store: Arc<dyn CredentialStore>,
    handler: Arc<dyn LoginHandler>,
    state: RwLock<SessionState>,
}

impl SessionManager {
    pub fn new(
        client: Arc<RequestClient>,
        store: Arc<dyn CredentialStore>,
        handler: Arc<dyn LoginHandler>,
    ) -> Self {
        Self {
            client,
            store,
            handler,
            state: RwLock::new(SessionState::default()),
        }
    }

    /// Requests a device code. The returned prompt is what the user enters.
    pub async fn start_login(&self) -> Result<LoginPrompt, Error> {
        let request = HttpRequest::post(DEVICE_URL)
            .header("Client-Id", self.client.client_id())
            .form(&[("client_id", self.client.client_id()), ("scopes", "")]);
        let resp = self.client.send("DeviceAuth", request).await?;
        classify_status(&resp, "DeviceAuth")?;
        let device: DeviceCodeResponse = serde_json::from_str(&resp.body)?;

        let prompt = LoginPrompt {
            user_code: device.user_code.clone(),
            verification_uri: device.verification_uri.clone(),
            expires_in: device.expires_in,
            poll_interval: device.interval,
        };
        let mut state = self.state.write().await;
        state.pending = Some(PendingLogin {
            device_code: device.device_code,
            interval: Duration::from_secs(device.interval.max(1)),
            expires_at: Instant::now() + Duration::from_secs(device.expires_in),
        });
        debug!("[Session] Device code issued, polling every {}s", device.interval);
        Ok(prompt)
    }

    /// Polls the token endpoint until the pending login resolves.
    pub async fn poll_login(&self) -> Result<Session, Error> {
        loop {
            let (device_code, interval, expires_at) = {
                let state = self.state.read().await;
                let pending = state
                    .pending
                    .as_ref()
                    .ok_or_else(|| Error::Fatal("poll_login called without start_login".into()))?;
                (pending.device_code.clone(), pending.interval, pending.expires_at)
            };

            if Instant::now() + interval >= expires_at {
                self.state.write().await.pending = None;
                return Err(Error::LoginExpired);
            }
            sleep(interval).await;

            let request = HttpRequest::post(TOKEN_URL)
                .header("Client-Id", self.client.client_id())
                .form(&[
                    ("client_id", self.client.client_id()),
                    ("device_code", device_code.as_str()),
                    ("grant_type", DEVICE_GRANT_TYPE),
                ]);
            let resp = self.client.send("DeviceToken", request).await?;

            if resp.status == 200 {
                let token: TokenResponse = serde_json::from_str(&resp.body)?;
                let session = self.session_from_token(token).await?;
                {
                    let mut state = self.state.write().await;
                    state.pending = None;
                    state.session = Some(session.clone());
                }
                self.persist(&session).await;
                info!("[Session] Logged in as user_id={}", session.user_id);
                return Ok(session);
            }

            if resp.status != 400 {
                classify_status(&resp, "DeviceToken")?;
            }
            let body: OAuthErrorBody = serde_json::from_str(&resp.body).unwrap_or(OAuthErrorBody {
                status: resp.status,
                message: resp.body.clone(),
            });
            match PollStatus::from_message(&body.message) {
                PollStatus::Pending => continue,
                PollStatus::SlowDown => {
                    let mut state = self.state.write().await;
                    if let Some(p) = state.pending.as_mut() {
                        p.interval += Duration::from_secs(5);
                    }
                }
                PollStatus::Expired => {
                    self.state.write().await.pending = None;
                    return Err(Error::LoginExpired);
                }
                PollStatus::Denied => {
                    self.state.write().await.pending = None;
                    return Err(Error::LoginDenied);
                }
                PollStatus::Other(msg) => {
                    return Err(Error::Fatal(format!("DeviceToken: HTTP {} => {}", body.status, msg)));
                }
            }
        }
    }

    pub async fn current_session(&self) -> Result<Session, Error> {
        self.state
            .read()
            .await
            .session
            .clone()
            .ok_or(Error::Unauthenticated)
    }

    /// Loads and validates the stored session, if any.
    pub async fn restore(&self) -> Result<Option<Session>, Error> {
        let Some(blob) = self.store.load().await? else {
            return Ok(None);
        };
        let mut session: Session = match serde_json::from_slice(&blob) {
            Ok(s) => s,
            Err(e) => {
                warn!("[Session] Stored session unreadable ({}), discarding", e);
                self.store.clear().await?;
                return Ok(None);
            }
        };
        self.state.write().await.device_id = Some(session.device_id.clone());

        match self.validate(&session.access_token).await {
            Ok(v) => {
                session.user_id = v.user_id;
                session.login = v.login.or(session.login);
                session.session_id = new_session_id();
                self.state.write().await.session = Some(session.clone());
                info!("[Session] Restored session for user_id={}", session.user_id);
                Ok(Some(session))
            }
            Err(Error::AuthExpired(_)) => {
                self.state.write().await.session = Some(session);
                match self.refresh_inner().await {
                    Ok(s) => Ok(Some(s)),
                    Err(_) => {
                        self.store.clear().await?;
                        Ok(None)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    pub async fn logout(&self) -> Result<(), Error> {
        {
            let mut state = self.state.write().await;
            state.session = None;
            state.pending = None;
        }
        self.store.clear().await?;
        info!("[Session] Logged out");
        Ok(())
    }

    async fn refresh_inner(&self) -> Result<Session, Error> {
        let current = self.current_session().await?;
        let refreshed = match current.refresh_token.as_deref() {
            Some(refresh_token) => {
                let request = HttpRequest::post(TOKEN_URL)
                    .header("Client-Id", self.client.client_id())
                    .form(&[
                        ("client_id", self.client.client_id()),
                        ("grant_type", "refresh_token"),
                        ("refresh_token", refresh_token),
                    ]);
                let resp = self.client.send("RefreshToken", request).await?;
                if resp.status == 400 || resp.status == 401 {
                    return Err(Error::AuthExpired(format!("RefreshToken: HTTP {}", resp.status)));
                }
                classify_status(&resp, "RefreshToken")?;
                let token: TokenResponse = serde_json::from_str(&resp.body)?;
                self.session_from_token(token).await?
            }
            None => {
                let v = self.validate(&current.access_token).await?;
                Session { user_id: v.user_id, ..current }
            }
        };
        self.state.write().await.session = Some(refreshed.clone());
        self.persist(&refreshed).await;
        Ok(refreshed)
    }

    async fn validate(&self, token: &str) -> Result<ValidateResponse, Error> {
        let request = HttpRequest::get(VALIDATE_URL).header("Authorization", format!("OAuth {token}"));
        let resp = self.client.send("Validate", request).await?;
        classify_status(&resp, "Validate")?;
        let v: ValidateResponse = serde_json::from_str(&resp.body)?;
        if v.client_id != self.client.client_id() {
            warn!("[Session] Token belongs to client {}, not {}", v.client_id, self.client.client_id());
            return Err(Error::AuthExpired("token issued for a different client".into()));
        }
        Ok(v)
    }

    async fn session_from_token(&self, token: TokenResponse) -> Result<Session, Error> {
        let v = self.validate(&token.access_token).await?;
        let device_id = {
            let mut state = self.state.write().await;
            state
                .device_id
                .get_or_insert_with(|| Uuid::new_v4().simple().to_string())
                .clone()
        };
        let now = Utc::now();
        Ok(Session {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            user_id: v.user_id,
            login: v.login,
            client_id: self.client.client_id().to_string(),
            session_id: new_session_id(),
            device_id,
            expires_at: token.expires_in.map(|s| now + ChronoDuration::seconds(s)),
            created_at: now,
        })
    }

    async fn persist(&self, session: &Session) {
        match serde_json::to_vec(session) {
            Ok(blob) => {
                if let Err(e) = self.store.save(&blob).await {
                    warn!("[Session] Could not persist session: {}", e);
                }
            }
            Err(e) => warn!("[Session] Could not serialize session: {}", e),
        }
    }
}

#[async_trait]
impl SessionProvider for SessionManager {
    async fn establish(&self) -> Result<Session, Error> {
        if let Ok(session) = self.current_session().await {
            return Ok(session);
        }
        if let Some(session) = self.restore().await? {
            return Ok(session);
        }
        let prompt = self.start_login().await?;
        self.handler.show_prompt(&prompt).await?;
        self.poll_login().await
    }

    async fn current(&self) -> Result<Session, Error> {
        self.current_session().await
    }

    async fn refresh(&self) -> Result<Session, Error> {
        match self.refresh_inner().await {
            Ok(s) => {
                info!("[Session] Session refreshed");
                Ok(s)
            }
            Err(e) => {
                warn!("[Session] Silent refresh failed: {}; session invalidated", e);
                self.state.write().await.session = None;
                Err(Error::Unauthenticated)
            }
        }
    }
}

fn new_session_id() -> String {
    format!("{:016x}", rand::rng().random::<u64>())
}
