//! Request and reply schemas for every endpoint.
//!
//! Client routes keep the original JSON layout (`{payload: {...}}` in,
//! `{code, message?, payload?}` out) and add typed `error` and `redirect`
//! fields. Peer RPCs use camelCase field names on the wire.

use garde::Validate;
use serde::{Deserialize, Serialize};

use crate::cluster::LogEntry;
use crate::errors::NodeError;
use crate::store::{Document, Record, Write, TOMBSTONE_SENTINEL};

// -- Client requests ---------------------------------------------------------

/// `GET /request` body.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct GetRequest {
    #[garde(dive)]
    pub payload: GetPayload,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct GetPayload {
    /// Keys are limited to 1024 bytes.
    #[garde(length(min = 1, max = 1024))]
    pub key: String,
    #[serde(default)]
    #[garde(skip)]
    pub token: String,
}

/// `PUT /request` body.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PutRequest {
    #[garde(dive)]
    pub payload: PutPayload,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct PutPayload {
    #[garde(length(min = 1, max = 1024))]
    pub key: String,
    /// JSON-encoded document string, the tombstone sentinel, or an inline
    /// JSON object.
    #[garde(skip)]
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub token: Option<String>,
}

/// A decoded `PUT` value plus the token embedded in it, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPut {
    pub write: Write,
    pub embedded_token: Option<String>,
}

impl PutPayload {
    /// Decode `value` into a typed [`Write`].
    pub fn decode_value(&self) -> Result<DecodedPut, NodeError> {
        let object = match &self.value {
            serde_json::Value::String(raw) if raw == TOMBSTONE_SENTINEL => {
                return Ok(DecodedPut {
                    write: Write::Delete,
                    embedded_token: None,
                });
            }
            serde_json::Value::String(raw) => {
                serde_json::from_str::<serde_json::Value>(raw).map_err(|e| malformed(format!(
                    "value is not valid JSON: {e}"
                )))?
            }
            other => other.clone(),
        };

        let serde_json::Value::Object(mut fields) = object else {
            return Err(malformed("value must be a JSON object or \"__DELETE__\""));
        };

        let embedded_token = match fields.remove("token") {
            Some(serde_json::Value::String(token)) => Some(token),
            _ => None,
        };
        let expected_version = match fields.remove("version_number") {
            Some(v) => parse_version(&v)?,
            None => return Err(malformed("value is missing version_number")),
        };

        Ok(DecodedPut {
            write: Write::Upsert {
                expected_version,
                document: Document::new(fields),
            },
            embedded_token,
        })
    }
}

/// Accept `version_number` as a JSON number or a decimal string.
fn parse_version(value: &serde_json::Value) -> Result<u64, NodeError> {
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| malformed("version_number must be a non-negative integer")),
        serde_json::Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| malformed("version_number must be a non-negative integer")),
        _ => Err(malformed("version_number must be a non-negative integer")),
    }
}

fn malformed(message: impl Into<String>) -> NodeError {
    NodeError::MalformedRequest {
        message: message.into(),
    }
}

// -- Client replies ----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyCode {
    Success,
    Fail,
}

/// Key and wire value of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPayload {
    pub key: String,
    pub value: String,
}

impl RecordPayload {
    pub fn new(key: impl Into<String>, record: &Record) -> Self {
        Self {
            key: key.into(),
            value: record.wire_value().to_string(),
        }
    }
}

/// Reply body for `GET`/`PUT /request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientReply {
    pub code: ReplyCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Typed error kind, see [`NodeError::code`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Leader address to retry against when `error == "NotLeader"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl ClientReply {
    pub fn success(record: RecordPayload) -> Self {
        Self {
            code: ReplyCode::Success,
            message: None,
            error: None,
            redirect: None,
            payload: serde_json::to_value(record).ok(),
        }
    }

    pub fn failure(err: &NodeError) -> Self {
        let (redirect, payload) = match err {
            // `payload.message` is the redirect field older clients read.
            NodeError::NotLeader { leader } => (
                leader.clone(),
                Some(serde_json::json!({ "message": leader })),
            ),
            _ => (None, None),
        };
        Self {
            code: ReplyCode::Fail,
            message: Some(err.to_string()),
            error: Some(err.code().to_string()),
            redirect,
            payload,
        }
    }
}

// -- Peer RPCs ---------------------------------------------------------------

/// `POST /vote_req` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub term: u64,
    pub commit_idx: u64,
    /// Number of staged (uncommitted) entries on the candidate.
    pub staged: u64,
    /// Term of the candidate's last log entry.
    #[serde(default)]
    pub last_term: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReply {
    pub choice: bool,
    pub term: u64,
}

/// `POST /heartbeat` body. An empty `entries` list is a plain heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub term: u64,
    pub commit_idx: u64,
    pub leader: String,
    #[serde(default)]
    pub prev_idx: u64,
    #[serde(default)]
    pub prev_term: u64,
    #[serde(default)]
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReply {
    pub term: u64,
    pub commit_idx: u64,
    #[serde(default)]
    pub success: bool,
    /// On success the follower's last matching index, otherwise a hint for
    /// where the leader should resume.
    #[serde(default)]
    pub match_idx: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(value: serde_json::Value) -> PutPayload {
        PutPayload {
            key: "u1:/f".into(),
            value,
            token: None,
        }
    }

    #[test]
    fn test_decode_tombstone() {
        let decoded = put(serde_json::json!("__DELETE__")).decode_value().unwrap();
        assert_eq!(decoded.write, Write::Delete);
    }

    #[test]
    fn test_decode_encoded_document_with_embedded_token() {
        let raw = r#"{"version_number":"2","token":"abc","data":"x"}"#;
        let decoded = put(serde_json::json!(raw)).decode_value().unwrap();
        assert_eq!(decoded.embedded_token.as_deref(), Some("abc"));
        match decoded.write {
            Write::Upsert {
                expected_version,
                document,
            } => {
                assert_eq!(expected_version, 2);
                let stored: serde_json::Value =
                    serde_json::from_str(&document.render(3)).unwrap();
                assert_eq!(stored["data"], "x");
                assert!(stored.get("token").is_none());
            }
            other => panic!("unexpected write {other:?}"),
        }
    }

    #[test]
    fn test_decode_inline_object_numeric_version() {
        let decoded = put(serde_json::json!({"version_number": 0}))
            .decode_value()
            .unwrap();
        assert!(matches!(
            decoded.write,
            Write::Upsert {
                expected_version: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_rejects_bad_values() {
        for value in [
            serde_json::json!("not json"),
            serde_json::json!("[1,2]"),
            serde_json::json!({"data": "no version"}),
            serde_json::json!({"version_number": -1}),
            serde_json::json!({"version_number": "abc"}),
        ] {
            let err = put(value).decode_value().unwrap_err();
            assert_eq!(err.code(), "MalformedRequest");
        }
    }

    #[test]
    fn test_get_request_validation() {
        let ok: GetRequest =
            serde_json::from_str(r#"{"payload":{"key":"u1:/f","token":"t"}}"#).unwrap();
        assert!(ok.validate().is_ok());
        let empty: GetRequest = serde_json::from_str(r#"{"payload":{"key":""}}"#).unwrap();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_not_leader_reply_keeps_redirect_layout() {
        let reply = ClientReply::failure(&NodeError::NotLeader {
            leader: Some("http://10.0.0.1:5000".into()),
        });
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["code"], "fail");
        assert_eq!(json["error"], "NotLeader");
        assert_eq!(json["payload"]["message"], "http://10.0.0.1:5000");
        assert_eq!(json["redirect"], "http://10.0.0.1:5000");
    }

    #[test]
    fn test_vote_request_wire_names() {
        let req: VoteRequest =
            serde_json::from_str(r#"{"term":3,"commitIdx":2,"staged":1}"#).unwrap();
        assert_eq!(req.term, 3);
        assert_eq!(req.commit_idx, 2);
        assert_eq!(req.staged, 1);
        assert_eq!(req.last_term, 0);
        assert_eq!(req.candidate, None);
    }
}
