//! HTTP handlers.
//!
//! - [`request`] serves client reads and writes on `/request`
//! - [`rpc`] serves the peer RPCs `/vote_req` and `/heartbeat`

pub mod request;
pub mod rpc;

use serde::de::DeserializeOwned;

use crate::errors::NodeError;

/// Decode a JSON body regardless of its `Content-Type`.
///
/// Existing clients send JSON bodies on `GET` without a content type, which
/// the stock `Json` extractor rejects.
pub(crate) fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, NodeError> {
    serde_json::from_slice(body).map_err(|e| NodeError::MalformedRequest {
        message: format!("invalid request body: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::VoteRequest;

    #[test]
    fn test_decode_body_reports_malformed() {
        let err = decode_body::<VoteRequest>(b"{not json").unwrap_err();
        assert_eq!(err.code(), "MalformedRequest");
        let ok: VoteRequest = decode_body(br#"{"term":1,"commitIdx":0,"staged":0}"#).unwrap();
        assert_eq!(ok.term, 1);
    }
}
