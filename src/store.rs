//! Versioned in-memory key-value store.
//!
//! The store only ever holds committed state. The leader and every follower
//! keep their own replica and mutate it exclusively by applying committed
//! log entries, in log order. Deletion is recorded as a [`Record::Tombstone`]
//! so a deleted key stays distinguishable from a key that never existed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Wire sentinel clients use for a tombstone value.
pub const TOMBSTONE_SENTINEL: &str = "__DELETE__";

/// A committed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Record {
    /// A live value at a given version.
    Live { value: String, version: u64 },
    /// The key was deleted. A create with version 0 starts a new lineage.
    Tombstone,
}

impl Record {
    /// Version of a live record, `None` for a tombstone.
    pub fn version(&self) -> Option<u64> {
        match self {
            Record::Live { version, .. } => Some(*version),
            Record::Tombstone => None,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Record::Tombstone)
    }

    /// Value as presented on the wire.
    pub fn wire_value(&self) -> &str {
        match self {
            Record::Live { value, .. } => value,
            Record::Tombstone => TOMBSTONE_SENTINEL,
        }
    }
}

/// Value carried by a replicated write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum WriteValue {
    Live(String),
    Tombstone,
}

/// A client mutation before version resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Unconditional delete.
    Delete,
    /// Create (expected version 0) or update (expected == current version).
    Upsert {
        expected_version: u64,
        document: Document,
    },
}

/// Client-supplied JSON document stored as a record value.
///
/// `version_number` and `token` are stripped on decode; the stored value
/// gets `version_number` re-inserted with the version assigned at staging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Document {
    fields: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    pub fn new(fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Self { fields }
    }

    /// Render the stored JSON value for `version`.
    ///
    /// The version is written as a decimal string, the form existing
    /// clients parse.
    pub fn render(&self, version: u64) -> String {
        let mut fields = self.fields.clone();
        fields.insert(
            "version_number".to_string(),
            serde_json::Value::String(version.to_string()),
        );
        serde_json::Value::Object(fields).to_string()
    }
}

/// Resolve the version a write would produce against `current`.
///
/// Returns `Ok(version)` for the entry to stage, or `Err(current_version)`
/// when the caller's expected version is stale. Deletes always succeed and
/// carry the version they supersede (0 when there is no live record).
pub fn resolve_version(current: Option<&Record>, write: &Write) -> Result<u64, u64> {
    let current_version = current.and_then(Record::version);
    match write {
        Write::Delete => Ok(current_version.unwrap_or(0)),
        Write::Upsert {
            expected_version, ..
        } => match current_version {
            None if *expected_version == 0 => Ok(1),
            None => Err(0),
            Some(v) if v == *expected_version => Ok(v + 1),
            Some(v) => Err(v),
        },
    }
}

/// Separator between the owning principal and the logical path.
pub const NAMESPACE_SEPARATOR: char = ':';

/// Whether `principal` can own a namespace. The owner of a key is the text
/// before its first separator, so a principal must not contain one.
pub fn is_valid_principal(principal: &str) -> bool {
    !principal.is_empty() && !principal.contains(NAMESPACE_SEPARATOR)
}

/// Build the record key for an authenticated principal.
///
/// A requested key already in the principal's namespace is kept as-is;
/// anything else is placed under it. Principals must pass
/// [`is_valid_principal`] for two of them never to share a key.
pub fn namespaced_key(principal: &str, requested: &str) -> String {
    let prefix = format!("{principal}{NAMESPACE_SEPARATOR}");
    if requested.starts_with(&prefix) {
        requested.to_string()
    } else {
        format!("{prefix}{requested}")
    }
}

/// Committed key-value replica.
#[derive(Debug, Default)]
pub struct ReplicatedStore {
    records: HashMap<String, Record>,
}

impl ReplicatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Record> {
        self.records.get(key)
    }

    /// Apply a committed write.
    pub fn apply(&mut self, key: &str, value: &WriteValue, version: u64) {
        let record = match value {
            WriteValue::Live(value) => Record::Live {
                value: value.clone(),
                version,
            },
            WriteValue::Tombstone => Record::Tombstone,
        };
        self.records.insert(key.to_string(), record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upsert(expected_version: u64) -> Write {
        Write::Upsert {
            expected_version,
            document: Document::default(),
        }
    }

    fn live(version: u64) -> Record {
        Record::Live {
            value: "{}".to_string(),
            version,
        }
    }

    #[test]
    fn test_create_requires_version_zero() {
        assert_eq!(resolve_version(None, &upsert(0)), Ok(1));
        assert_eq!(resolve_version(None, &upsert(3)), Err(0));
    }

    #[test]
    fn test_update_requires_current_version() {
        let current = live(4);
        assert_eq!(resolve_version(Some(&current), &upsert(4)), Ok(5));
        assert_eq!(resolve_version(Some(&current), &upsert(3)), Err(4));
        assert_eq!(resolve_version(Some(&current), &upsert(0)), Err(4));
    }

    #[test]
    fn test_create_after_tombstone_restarts_lineage() {
        let tomb = Record::Tombstone;
        assert_eq!(resolve_version(Some(&tomb), &upsert(0)), Ok(1));
        assert_eq!(resolve_version(Some(&tomb), &upsert(7)), Err(0));
    }

    #[test]
    fn test_delete_is_unconditional() {
        assert_eq!(resolve_version(None, &Write::Delete), Ok(0));
        assert_eq!(resolve_version(Some(&live(9)), &Write::Delete), Ok(9));
        assert_eq!(
            resolve_version(Some(&Record::Tombstone), &Write::Delete),
            Ok(0)
        );
    }

    #[test]
    fn test_principals_with_separator_are_invalid() {
        assert!(is_valid_principal("a"));
        assert!(is_valid_principal("42"));
        assert!(!is_valid_principal(""));
        assert!(!is_valid_principal("a:b"));
        assert!(!is_valid_principal(":"));
    }

    #[test]
    fn test_valid_principals_never_share_a_key() {
        let principals = ["a", "b", "ab", "a.b"];
        let paths = ["c", "b:c", "a:b:c", "ab:c", "/f", ""];
        let mut owners: HashMap<String, &str> = HashMap::new();
        for principal in principals {
            assert!(is_valid_principal(principal));
            for path in paths {
                let key = namespaced_key(principal, path);
                let owner = owners.entry(key.clone()).or_insert(principal);
                assert_eq!(*owner, principal, "{key} reached by {owner} and {principal}");
            }
        }
        assert_eq!(namespaced_key("a", "b:c"), "a:b:c");
        assert_eq!(namespaced_key("a", "a:b:c"), "a:b:c");
    }

    #[test]
    fn test_apply_tombstone_twice_is_idempotent() {
        let mut store = ReplicatedStore::new();
        store.apply("u1:/f", &WriteValue::Live("{}".into()), 1);
        store.apply("u1:/f", &WriteValue::Tombstone, 1);
        let after_first = store.get("u1:/f").cloned();
        store.apply("u1:/f", &WriteValue::Tombstone, 0);
        assert_eq!(store.get("u1:/f").cloned(), after_first);
        assert_eq!(store.records.len(), 1);
    }

    #[test]
    fn test_document_render_sets_string_version() {
        let mut fields = serde_json::Map::new();
        fields.insert("data".into(), serde_json::json!("abc"));
        let rendered = Document::new(fields).render(3);
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["version_number"], "3");
        assert_eq!(parsed["data"], "abc");
    }

    #[test]
    fn test_namespaced_key() {
        assert_eq!(namespaced_key("u1", "u1:/f"), "u1:/f");
        assert_eq!(namespaced_key("u1", "/f"), "u1:/f");
        assert_eq!(namespaced_key("u1", "u2:/f"), "u1:u2:/f");
    }

    #[test]
    fn test_wire_value() {
        assert_eq!(Record::Tombstone.wire_value(), TOMBSTONE_SENTINEL);
        assert_eq!(live(1).wire_value(), "{}");
    }
}
