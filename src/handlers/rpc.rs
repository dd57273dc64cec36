//! Peer RPC endpoints.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;

use super::decode_body;
use crate::errors::NodeError;
use crate::protocol::{HeartbeatReply, HeartbeatRequest, VoteReply, VoteRequest};
use crate::AppState;

/// `POST /vote_req`
pub async fn vote_req(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<VoteReply>, NodeError> {
    let request: VoteRequest = decode_body(&body)?;
    Ok(Json(state.node.decide_vote(&request)))
}

/// `POST /heartbeat`
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<HeartbeatReply>, NodeError> {
    let request: HeartbeatRequest = decode_body(&body)?;
    Ok(Json(state.node.handle_heartbeat(&request)))
}
