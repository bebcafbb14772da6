//! Change event representation
//!
//! The unit of work flowing through the engine: one row-level change
//! captured from the source database and published on the upstream stream.
//! Only the fields the engine reads are modeled; unknown payload fields are
//! ignored on decode.

use crate::error::{Result, SluiceError};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::BTreeMap;
use std::io::Read;

/// Row operation carried by a change event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    #[default]
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Insert => write!(f, "INSERT"),
            Operation::Update => write!(f, "UPDATE"),
            Operation::Delete => write!(f, "DELETE"),
        }
    }
}

/// A database change event.
///
/// `key` is ordered: the first element is the table name, the rest are
/// primary-key values in column order. `after` is present for
/// INSERT/UPDATE, `before` for DELETE. `mvcc_timestamp` is a monotonic
/// ordering token assigned by the source database; within one upstream
/// partition events for a given primary key arrive in non-decreasing
/// mvcc order.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub id: String,
    pub operation: Operation,
    pub table: String,
    #[serde(default)]
    pub key: Vec<String>,
    pub timestamp: i64,
    #[serde(default)]
    pub mvcc_timestamp: String,
    #[serde(default)]
    pub model_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diff: Vec<String>,
    /// True for events synthesized by a bulk-import pass.
    #[serde(default)]
    pub imported: bool,
    /// Matched-rule token filled in by the schema validator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_validated_path: Option<String>,
}

impl ChangeEvent {
    /// Decode an event from raw payload bytes, gunzipping first when the
    /// message's `content-encoding` header says `gzip/json`.
    pub fn from_payload(buf: &[u8], gzipped: bool) -> Result<Self> {
        if gzipped {
            let mut decoder = flate2::read::GzDecoder::new(buf);
            let mut decompressed = Vec::new();
            decoder
                .read_to_end(&mut decompressed)
                .map_err(|e| SluiceError::decode(format!("gunzip: {e}")))?;
            serde_json::from_slice(&decompressed).map_err(|e| SluiceError::decode(e.to_string()))
        } else {
            serde_json::from_slice(buf).map_err(|e| SluiceError::decode(e.to_string()))
        }
    }

    /// The first key element after the table, or empty when absent.
    pub fn primary_key(&self) -> &str {
        self.key.get(1).map(String::as_str).unwrap_or_default()
    }

    /// The row state as a key→value map: `after` for INSERT/UPDATE,
    /// `before` for DELETE.
    pub fn object(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        let raw = match self.operation {
            Operation::Delete => self.before.as_deref(),
            _ => self.after.as_deref(),
        };
        match raw {
            Some(raw) => {
                serde_json::from_str(raw.get()).map_err(|e| SluiceError::decode(e.to_string()))
            }
            None => Ok(BTreeMap::new()),
        }
    }

    /// JSON representation for trace logs.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn sample_json() -> &'static str {
        r#"{
            "id": "evt_1",
            "operation": "UPDATE",
            "table": "orders",
            "key": ["orders", "ord_123"],
            "timestamp": 1700000000123,
            "mvccTimestamp": "1700000000123000000.0000000001",
            "modelVersion": "a1b2c3",
            "version": 42,
            "region": "us-east",
            "after": {"id": "ord_123", "total": 1999},
            "diff": ["total"],
            "someFutureField": true
        }"#
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let evt = ChangeEvent::from_payload(sample_json().as_bytes(), false).unwrap();
        assert_eq!(evt.id, "evt_1");
        assert_eq!(evt.operation, Operation::Update);
        assert_eq!(evt.table, "orders");
        assert_eq!(evt.timestamp, 1700000000123);
        assert_eq!(evt.diff, vec!["total"]);
        assert!(!evt.imported);
    }

    #[test]
    fn test_decode_gzip() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(sample_json().as_bytes()).unwrap();
        let compressed = enc.finish().unwrap();

        let evt = ChangeEvent::from_payload(&compressed, true).unwrap();
        assert_eq!(evt.table, "orders");
    }

    #[test]
    fn test_decode_truncated_is_error() {
        let err = ChangeEvent::from_payload(br#"{"operation":"#, false).unwrap_err();
        assert!(matches!(err, SluiceError::Decode(_)));
    }

    #[test]
    fn test_primary_key() {
        let evt = ChangeEvent::from_payload(sample_json().as_bytes(), false).unwrap();
        assert_eq!(evt.primary_key(), "ord_123");

        let no_key = ChangeEvent {
            key: vec!["orders".into()],
            ..Default::default()
        };
        assert_eq!(no_key.primary_key(), "");
    }

    #[test]
    fn test_object_uses_after_for_update() {
        let evt = ChangeEvent::from_payload(sample_json().as_bytes(), false).unwrap();
        let obj = evt.object().unwrap();
        assert_eq!(obj["total"], serde_json::json!(1999));
    }

    #[test]
    fn test_object_uses_before_for_delete() {
        let json = r#"{
            "id": "evt_2",
            "operation": "DELETE",
            "table": "orders",
            "key": ["orders", "ord_9"],
            "timestamp": 1,
            "before": {"id": "ord_9"}
        }"#;
        let evt = ChangeEvent::from_payload(json.as_bytes(), false).unwrap();
        let obj = evt.object().unwrap();
        assert_eq!(obj["id"], serde_json::json!("ord_9"));
    }
}
