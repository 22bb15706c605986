//! Request client: GQL calls and raw platform requests with rate limiting,
//! error classification and bounded retries.

pub mod backoff;
pub mod gql;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde_json::Value;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use dropminer_common::models::Session;

use crate::constants::{
    CLIENT_ID, GQL_BACKOFF_MAX, GQL_BATCH_SIZE, GQL_RATE_PER_SECOND, GQL_URL, MAX_ATTEMPTS, USER_AGENT,
};
use crate::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::Error;

pub use backoff::ExponentialBackoff;
pub use gql::GqlOperation;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            initial_delay: Duration::from_secs(1),
            max_delay: GQL_BACKOFF_MAX,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub client_id: String,
    pub user_agent: String,
    pub requests_per_second: u32,
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: CLIENT_ID.to_string(),
            user_agent: USER_AGENT.to_string(),
            requests_per_second: GQL_RATE_PER_SECOND,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct RequestClient {
    transport: Arc<dyn HttpTransport>,
    limiter: DefaultDirectRateLimiter,
    config: ClientConfig,
}

impl RequestClient {
    pub fn new(transport: Arc<dyn HttpTransport>, config: ClientConfig) -> Self {
        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            transport,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
            config,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn user_agent(&self) -> &str {
        &self.config.user_agent
    }

    /// Runs one persisted query and returns its checked response object.
    pub async fn call(&self, op: &GqlOperation, session: &Session) -> Result<Value, Error> {
        let body = op.to_json();
        let value = self.gql_exchange(op.name, &body, session).await?;
        Ok(value)
    }

    /// Runs many queries, batched; results come back in input order.
    pub async fn call_batch(&self, ops: &[GqlOperation], session: &Session) -> Result<Vec<Value>, Error> {
        let mut out = Vec::with_capacity(ops.len());
        for chunk in ops.chunks(GQL_BATCH_SIZE) {
            let body = Value::Array(chunk.iter().map(GqlOperation::to_json).collect());
            let label = chunk.first().map(|o| o.name).unwrap_or("batch");
            match self.gql_exchange(label, &body, session).await? {
                Value::Array(items) if items.len() == chunk.len() => out.extend(items),
                other => {
                    return Err(Error::Invalid(format!(
                        "{label}: batch of {} returned {}",
                        chunk.len(),
                        other.as_array().map(|a| a.len().to_string()).unwrap_or_else(|| "a non-array".into())
                    )));
                }
            }
        }
        Ok(out)
    }

    /// Sends a non-GQL request with the same pacing and retries. Only
    /// transport failures, 429 and 5xx are treated as errors here; the
    /// caller interprets every other status.
    pub async fn send(&self, label: &str, request: HttpRequest) -> Result<HttpResponse, Error> {
        self.with_retry(label, || async {
            let request = request.clone().header("User-Agent", self.config.user_agent.as_str());
            let resp = self.transport.send(request).await?;
            match resp.status {
                429 => Err(rate_limited(&resp)),
                500..=599 => Err(Error::Transient(format!("{label}: HTTP {}", resp.status))),
                _ => Ok(resp),
            }
        })
        .await
    }

    async fn gql_exchange(&self, label: &str, body: &Value, session: &Session) -> Result<Value, Error> {
        self.with_retry(label, || async {
            self.limiter.until_ready().await;
            let request = HttpRequest::post(GQL_URL)
                .header("Client-Id", self.session_client_id(session))
                .header("User-Agent", self.config.user_agent.as_str())
                .header("Authorization", format!("OAuth {}", session.access_token))
                .header("Client-Session-Id", session.session_id.as_str())
                .header("X-Device-Id", session.device_id.as_str())
                .json(body.clone());
            trace!("[Gql] -> {}", label);
            let resp = self.transport.send(request).await?;
            classify_status(&resp, label)?;
            let value = resp
                .json()
                .map_err(|e| Error::Invalid(format!("{label}: malformed response: {e}")))?;
            match value {
                Value::Array(items) => items
                    .into_iter()
                    .map(|item| check_gql_response(label, item))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array),
                item => check_gql_response(label, item),
            }
        })
        .await
    }

    fn session_client_id<'a>(&'a self, session: &'a Session) -> &'a str {
        if session.client_id.is_empty() {
            &self.config.client_id
        } else {
            &session.client_id
        }
    }

    async fn with_retry<F, Fut, T>(&self, label: &str, mut attempt_fn: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let policy = &self.config.retry;
        let mut backoff = ExponentialBackoff::new(policy.initial_delay, policy.max_delay);
        let mut attempt = 1;
        loop {
            match attempt_fn().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                    let mut delay = backoff.next_delay();
                    if let Error::RateLimited { retry_after: Some(min) } = &e {
                        delay = delay.max(*min);
                    }
                    warn!(
                        "[Gql] {} failed: {}; retrying in {:?} (attempt {}/{})",
                        label, e, delay, attempt, policy.max_attempts
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!("[Gql] {} gave up after {} attempt(s): {}", label, attempt, e);
                    return Err(e);
                }
            }
        }
    }
}

fn rate_limited(resp: &HttpResponse) -> Error {
    let retry_after = resp
        .header("retry-after")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    Error::RateLimited { retry_after }
}

/// Maps an HTTP status onto the error taxonomy.
pub fn classify_status(resp: &HttpResponse, label: &str) -> Result<(), Error> {
    match resp.status {
        200..=299 => Ok(()),
        401 => Err(Error::AuthExpired(format!("{label}: HTTP 401"))),
        404 => Err(Error::NotFound(format!("{label}: HTTP 404"))),
        429 => Err(rate_limited(resp)),
        500..=599 => Err(Error::Transient(format!("{label}: HTTP {}", resp.status))),
        status => Err(Error::Fatal(format!("{label}: HTTP {} => {}", status, resp.body))),
    }
}

/// Inspects one GQL response object and classifies any `errors` entries.
pub fn check_gql_response(label: &str, mut value: Value) -> Result<Value, Error> {
    if let Some(top) = value.get("error") {
        let status = value.get("status").and_then(Value::as_u64).unwrap_or(0);
        let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
        return Err(if status == 401 {
            Error::AuthExpired(format!("{label}: {message}"))
        } else {
            Error::Fatal(format!("{label}: {top} {message}"))
        });
    }

    let errors = match value.get("errors").and_then(Value::as_array) {
        Some(errors) if !errors.is_empty() => errors.clone(),
        _ => return Ok(value),
    };

    for error in &errors {
        let message = error.get("message").and_then(Value::as_str).unwrap_or_default();
        let lowered = message.to_ascii_lowercase();
        match lowered.as_str() {
            "service error" | "persistedquerynotfound" | "service timeout" | "service unavailable"
            | "context deadline exceeded" => {
                return Err(Error::Transient(format!("{label}: {message}")));
            }
            "server error" => {
                if let Some(path) = error.get("path").and_then(Value::as_array) {
                    if let Some(data) = value.get_mut("data") {
                        null_at_path(data, path);
                    }
                }
            }
            m if m.contains("integrity") || m.contains("captcha") => {
                return Err(Error::ManualActionRequired(format!("{label}: {message}")));
            }
            m if m.contains("unauthorized") || m.contains("unauthenticated") => {
                return Err(Error::AuthExpired(format!("{label}: {message}")));
            }
            _ => return Err(Error::Fatal(format!("{label}: GQL error: {message}"))),
        }
    }
    Ok(value)
}

fn null_at_path(data: &mut Value, path: &[Value]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = data;
    for segment in parents {
        let next = match segment {
            Value::String(key) => cursor.get_mut(key.as_str()),
            Value::Number(n) => n.as_u64().and_then(|i| cursor.get_mut(i as usize)),
            _ => None,
        };
        match next {
            Some(v) => cursor = v,
            None => return,
        }
    }
    match last {
        Value::String(key) => {
            if let Some(obj) = cursor.as_object_mut() {
                obj.insert(key.clone(), Value::Null);
            }
        }
        Value::Number(n) => {
            if let Some(slot) = n.as_u64().and_then(|i| cursor.get_mut(i as usize)) {
                *slot = Value::Null;
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_server_error_nulls_only_its_path() -> Result<(), Error> {
        let resp = json!({
            "errors": [{"message": "server error", "path": ["user", "stream"]}],
            "data": {"user": {"id": "1", "stream": {"id": "9"}}}
        });
        let checked = check_gql_response("GetStreamInfo", resp)?;
        assert_eq!(checked["data"]["user"]["id"], "1");
        assert!(checked["data"]["user"]["stream"].is_null());
        Ok(())
    }

    #[test]
    fn test_gql_error_classes() {
        let transient = check_gql_response("x", json!({"errors": [{"message": "service timeout"}]}));
        assert!(matches!(transient, Err(Error::Transient(_))));
        let captcha = check_gql_response("x", json!({"errors": [{"message": "failed integrity check"}]}));
        assert!(matches!(captcha, Err(Error::ManualActionRequired(_))));
        let auth = check_gql_response("x", json!({"error": "Unauthorized", "status": 401, "message": "token"}));
        assert!(matches!(auth, Err(Error::AuthExpired(_))));
        let other = check_gql_response("x", json!({"errors": [{"message": "bad variables"}]}));
        assert!(matches!(other, Err(Error::Fatal(_))));
    }
}
