//! Node error taxonomy.
//!
//! Client-facing kinds render as a normal `200 OK` failure reply so callers
//! can always tell "this write did not happen" from "the server is
//! unreachable". The enum implements [`axum::response::IntoResponse`] so
//! handlers can simply return `Err(NodeError::VersionMismatch { .. })`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::protocol::ClientReply;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

#[derive(Debug, Error)]
pub enum NodeError {
    /// Token verification failed.
    #[error("Invalid token")]
    InvalidToken,

    /// Optimistic concurrency conflict; re-read and retry.
    #[error("Version mismatch")]
    VersionMismatch { current: u64, supplied: u64 },

    /// This node is not the leader. `leader` is the last known leader.
    #[error("Not the leader")]
    NotLeader { leader: Option<String> },

    /// The write did not reach a majority in time. It may still commit.
    #[error("Write was not committed within the replication timeout")]
    ReplicationTimeout,

    /// An RPC carried a term lower than ours. Logged by the peer RPC paths.
    #[error("Stale term {received} (current term {current})")]
    StaleTerm { received: u64, current: u64 },

    #[error("Key not found")]
    NotFound,

    /// The request body did not decode or failed validation.
    #[error("{message}")]
    MalformedRequest { message: String },

    #[error("Internal error")]
    Internal(#[from] anyhow::Error),
}

impl NodeError {
    /// Stable error kind carried in the `error` field of a reply.
    pub fn code(&self) -> &'static str {
        match self {
            NodeError::InvalidToken => "InvalidToken",
            NodeError::VersionMismatch { .. } => "VersionMismatch",
            NodeError::NotLeader { .. } => "NotLeader",
            NodeError::ReplicationTimeout => "ReplicationTimeout",
            NodeError::StaleTerm { .. } => "StaleTerm",
            NodeError::NotFound => "NotFound",
            NodeError::MalformedRequest { .. } => "MalformedRequest",
            NodeError::Internal(_) => "InternalError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            NodeError::InvalidToken
            | NodeError::VersionMismatch { .. }
            | NodeError::NotLeader { .. }
            | NodeError::ReplicationTimeout
            | NodeError::NotFound => StatusCode::OK,
            NodeError::StaleTerm { .. } => StatusCode::CONFLICT,
            NodeError::MalformedRequest { .. } => StatusCode::BAD_REQUEST,
            NodeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        if let NodeError::Internal(ref err) = self {
            tracing::error!("internal error: {err:#}");
        }
        let status = self.status_code();
        (status, Json(ClientReply::failure(&self))).into_response()
    }
}
