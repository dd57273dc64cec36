//! Client reads and writes.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use garde::Validate;
use anyhow::anyhow;
use tracing::{debug, warn};

use super::decode_body;
use crate::errors::NodeError;
use crate::metrics::KV_OPERATIONS_TOTAL;
use crate::protocol::{ClientReply, GetRequest, PutRequest, RecordPayload};
use crate::store::{is_valid_principal, namespaced_key, Write};
use crate::AppState;

/// `GET /request` -- read a committed record.
pub async fn get_value(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<ClientReply>, NodeError> {
    let result = read(&state, &body);
    record_outcome("get", &result);
    result.map(Json)
}

fn read(state: &AppState, body: &[u8]) -> Result<ClientReply, NodeError> {
    let request: GetRequest = decode_body(body)?;
    validate(&request)?;
    state.node.ensure_leader()?;

    let principal = authorize(state, &request.payload.token)?;
    let key = namespaced_key(&principal, &request.payload.key);
    match state.node.handle_get(&key)? {
        Some(record) => Ok(ClientReply::success(RecordPayload::new(key, &record))),
        None => Err(NodeError::NotFound),
    }
}

/// `PUT /request` -- create, update or delete a record.
pub async fn put_value(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<ClientReply>, NodeError> {
    let mut operation = "put";
    let result = write(&state, &body, &mut operation).await;
    record_outcome(operation, &result);
    result.map(Json)
}

async fn write(
    state: &AppState,
    body: &[u8],
    operation: &mut &'static str,
) -> Result<ClientReply, NodeError> {
    let request: PutRequest = decode_body(body)?;
    validate(&request)?;
    state.node.ensure_leader()?;
    let payload = request.payload;
    let decoded = payload.decode_value()?;
    if matches!(decoded.write, Write::Delete) {
        *operation = "delete";
    }

    let token = payload
        .token
        .or(decoded.embedded_token)
        .unwrap_or_default();
    let principal = authorize(state, &token)?;
    let key = namespaced_key(&principal, &payload.key);
    let record = state.node.handle_put(&key, decoded.write).await?;
    debug!("committed {key} as {:?}", record.version());
    Ok(ClientReply::success(RecordPayload::new(key, &record)))
}

fn validate<T: Validate<Context = ()>>(request: &T) -> Result<(), NodeError> {
    request
        .validate()
        .map_err(|report| NodeError::MalformedRequest {
            message: report.to_string(),
        })
}

/// Verify `token` and return the principal it names.
fn authorize(state: &AppState, token: &str) -> Result<String, NodeError> {
    state
        .verifier
        .verify(token)
        .and_then(|principal| {
            if is_valid_principal(&principal) {
                Ok(principal)
            } else {
                Err(anyhow!("principal {principal:?} cannot own a namespace"))
            }
        })
        .map_err(|err| {
            warn!("rejecting token: {err:#}");
            NodeError::InvalidToken
        })
}

fn record_outcome<T>(operation: &'static str, result: &Result<T, NodeError>) {
    let outcome = match result {
        Ok(_) => "success",
        Err(err) => err.code(),
    };
    metrics::counter!(KV_OPERATIONS_TOTAL, "operation" => operation, "outcome" => outcome)
        .increment(1);
}
