//! Peer RPC transport.
//!
//! The consensus code only talks to peers through [`PeerTransport`], so the
//! same node drives real HTTP peers in production and in-memory peers in the
//! cluster tests.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::{HeartbeatReply, HeartbeatRequest, VoteReply, VoteRequest};

/// Async peer RPC contract. `peer` is the peer's base address.
pub trait PeerTransport: Send + Sync + 'static {
    /// Ask `peer` for its vote.
    fn request_vote(
        &self,
        peer: &str,
        request: VoteRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<VoteReply>> + Send + '_>>;

    /// Send a heartbeat, possibly carrying entries, to `peer`.
    fn heartbeat(
        &self,
        peer: &str,
        request: HeartbeatRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HeartbeatReply>> + Send + '_>>;
}

/// JSON-over-HTTP transport on `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .context("building peer HTTP client")?;
        Ok(Self { client })
    }

    async fn post<Req, Resp>(&self, peer: &str, route: &str, body: &Req) -> anyhow::Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = format!("{}/{route}", peer.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?
            .error_for_status()
            .with_context(|| format!("POST {url}"))?;
        response
            .json::<Resp>()
            .await
            .with_context(|| format!("decoding reply from {url}"))
    }
}

impl PeerTransport for HttpTransport {
    fn request_vote(
        &self,
        peer: &str,
        request: VoteRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<VoteReply>> + Send + '_>> {
        let peer = peer.to_string();
        Box::pin(async move { self.post(&peer, "vote_req", &request).await })
    }

    fn heartbeat(
        &self,
        peer: &str,
        request: HeartbeatRequest,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<HeartbeatReply>> + Send + '_>> {
        let peer = peer.to_string();
        Box::pin(async move { self.post(&peer, "heartbeat", &request).await })
    }
}
