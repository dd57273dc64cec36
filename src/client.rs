//! Client for the `/request` routes.
//!
//! The client does not need to know which node leads: it starts from a
//! random server, follows `NotLeader` redirects, and backs off
//! exponentially while no leader is known.

use std::time::Duration;

use rand::seq::SliceRandom;
use reqwest::Method;
use thiserror::Error;
use tracing::debug;

use crate::protocol::{ClientReply, RecordPayload, ReplyCode};
use crate::store::TOMBSTONE_SENTINEL;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_MAX_ATTEMPTS: usize = 8;
const DEFAULT_MAX_REDIRECTS: usize = 4;
const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// A reply the cluster gave to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOutcome {
    /// The read or write succeeded. `value` is the stored JSON string, or the
    /// tombstone sentinel.
    Success(RecordPayload),
    /// The leader refused the request, e.g. `VersionMismatch`.
    Failed { error: String, message: String },
}

impl ClientOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ClientOutcome::Success(_))
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no server list given")]
    NoServers,

    #[error("no leader reachable after {attempts} attempts")]
    NoLeader {
        attempts: usize,
        #[source]
        last: Option<reqwest::Error>,
    },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub struct Client {
    servers: Vec<String>,
    token: String,
    http: reqwest::Client,
    max_attempts: usize,
    max_redirects: usize,
}

impl Client {
    pub fn new(servers: Vec<String>, token: impl Into<String>) -> Result<Self, ClientError> {
        if servers.is_empty() {
            return Err(ClientError::NoServers);
        }
        let http = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            servers,
            token: token.into(),
            http,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_redirects: DEFAULT_MAX_REDIRECTS,
        })
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub async fn get(&self, key: &str) -> Result<ClientOutcome, ClientError> {
        let body = serde_json::json!({
            "payload": { "key": key, "token": self.token }
        });
        self.send(Method::GET, &body).await
    }

    /// Create (`version == 0`) or update `key` with a JSON document.
    pub async fn put(
        &self,
        key: &str,
        mut document: serde_json::Map<String, serde_json::Value>,
        version: u64,
    ) -> Result<ClientOutcome, ClientError> {
        document.insert("version_number".into(), version.into());
        let value = serde_json::Value::Object(document).to_string();
        self.put_raw(key, value).await
    }

    pub async fn delete(&self, key: &str) -> Result<ClientOutcome, ClientError> {
        self.put_raw(key, TOMBSTONE_SENTINEL.to_string()).await
    }

    async fn put_raw(&self, key: &str, value: String) -> Result<ClientOutcome, ClientError> {
        let body = serde_json::json!({
            "payload": { "key": key, "value": value, "token": self.token }
        });
        self.send(Method::PUT, &body).await
    }

    async fn send(
        &self,
        method: Method,
        body: &serde_json::Value,
    ) -> Result<ClientOutcome, ClientError> {
        let mut order = self.servers.clone();
        order.shuffle(&mut rand::thread_rng());

        let mut next_server = 0;
        let mut redirect: Option<String> = None;
        let mut redirects = 0;
        let mut backoff = INITIAL_BACKOFF;
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            let server = match redirect.take() {
                Some(leader) => leader,
                None => {
                    let server = order[next_server % order.len()].clone();
                    next_server += 1;
                    server
                }
            };

            let reply = match self.call(&server, method.clone(), body).await {
                Ok(reply) => reply,
                Err(err) => {
                    debug!("attempt {attempt} against {server} failed: {err}");
                    last_error = Some(err);
                    continue;
                }
            };

            if reply.code == ReplyCode::Success {
                let payload = reply
                    .payload
                    .and_then(|p| serde_json::from_value::<RecordPayload>(p).ok())
                    .unwrap_or_else(|| RecordPayload {
                        key: String::new(),
                        value: String::new(),
                    });
                return Ok(ClientOutcome::Success(payload));
            }

            let error = reply.error.clone().unwrap_or_default();
            if error != "NotLeader" {
                return Ok(ClientOutcome::Failed {
                    error,
                    message: reply.message.unwrap_or_default(),
                });
            }

            match leader_hint(&reply) {
                Some(leader) if leader != server && redirects < self.max_redirects => {
                    debug!("{server} redirected to {leader}");
                    redirects += 1;
                    redirect = Some(leader);
                }
                _ => {
                    debug!("no leader known at {server}, backing off {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        Err(ClientError::NoLeader {
            attempts: self.max_attempts,
            last: last_error,
        })
    }

    async fn call(
        &self,
        server: &str,
        method: Method,
        body: &serde_json::Value,
    ) -> Result<ClientReply, reqwest::Error> {
        let url = format!("{}/request", server.trim_end_matches('/'));
        self.http
            .request(method, url)
            .json(body)
            .send()
            .await?
            .json::<ClientReply>()
            .await
    }
}

/// Leader address from a `NotLeader` reply: the typed `redirect` field, or
/// `payload.message` as older servers send it.
fn leader_hint(reply: &ClientReply) -> Option<String> {
    reply
        .redirect
        .clone()
        .or_else(|| {
            reply
                .payload
                .as_ref()?
                .get("message")?
                .as_str()
                .map(str::to_string)
        })
        .filter(|leader| !leader.is_empty())
}
