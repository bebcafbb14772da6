//! Local durable key/value tracker
//!
//! Small redb-backed store on local disk recording resumable state:
//! per-table import watermarks and the registry's last-known schemas.
//! Single writer (the supervisor); concurrent readers are fine. Each
//! `set` commits its own transaction, so the store is crash-safe to the
//! granularity of a single write.

use crate::error::{Result, SluiceError};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sluice_state");

/// Tracker key holding the table → export-timestamp record written when a
/// bulk import completes.
pub const TABLE_EXPORT_INFO_KEY: &str = "table-export-info";

/// Per-table import watermark: events older than `timestamp` were already
/// delivered by a bulk import and must not be re-applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableExportInfo {
    pub table: String,
    pub timestamp: DateTime<Utc>,
}

/// redb-backed durable tracker.
pub struct Tracker {
    db: Arc<Database>,
}

impl Tracker {
    /// Open (or create) the tracker store inside the data directory.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| SluiceError::tracker(format!("create data dir: {e}")))?;
        let path = dir.join("tracker.redb");

        let db = Database::create(&path)
            .map_err(|e| SluiceError::tracker(format!("open {}: {e}", path.display())))?;

        {
            let txn = db
                .begin_write()
                .map_err(|e| SluiceError::tracker(e.to_string()))?;
            let _ = txn.open_table(STATE_TABLE);
            txn.commit().map_err(|e| SluiceError::tracker(e.to_string()))?;
        }

        debug!(path = %path.display(), "opened tracker store");
        Ok(Self { db: Arc::new(db) })
    }

    /// Fetch the value stored under `key`, or `None` when missing.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let txn = self
            .db
            .begin_read()
            .map_err(|e| SluiceError::tracker(e.to_string()))?;
        let table = txn
            .open_table(STATE_TABLE)
            .map_err(|e| SluiceError::tracker(e.to_string()))?;
        let value = table
            .get(key)
            .map_err(|e| SluiceError::tracker(e.to_string()))?;
        Ok(value.map(|v| v.value().to_vec()))
    }

    /// Store `value` under `key`, committing before returning.
    pub fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| SluiceError::tracker(e.to_string()))?;
        {
            let mut table = txn
                .open_table(STATE_TABLE)
                .map_err(|e| SluiceError::tracker(e.to_string()))?;
            table
                .insert(key, value)
                .map_err(|e| SluiceError::tracker(e.to_string()))?;
        }
        txn.commit().map_err(|e| SluiceError::tracker(e.to_string()))?;
        Ok(())
    }

    /// Remove `key` if present.
    pub fn delete(&self, key: &str) -> Result<()> {
        let txn = self
            .db
            .begin_write()
            .map_err(|e| SluiceError::tracker(e.to_string()))?;
        {
            let mut table = txn
                .open_table(STATE_TABLE)
                .map_err(|e| SluiceError::tracker(e.to_string()))?;
            table
                .remove(key)
                .map_err(|e| SluiceError::tracker(e.to_string()))?;
        }
        txn.commit().map_err(|e| SluiceError::tracker(e.to_string()))?;
        Ok(())
    }

    /// Fetch and JSON-decode a typed record.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// JSON-encode and store a typed record.
    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes)
    }

    /// Load the per-table export watermarks, empty when no import has run.
    pub fn table_export_info(&self) -> Result<Vec<TableExportInfo>> {
        Ok(self
            .get_json::<Vec<TableExportInfo>>(TABLE_EXPORT_INFO_KEY)?
            .unwrap_or_default())
    }

    /// Watermarks as a table → epoch-milliseconds map, the shape the
    /// consumer's skip policy wants.
    pub fn export_watermarks(&self) -> Result<HashMap<String, i64>> {
        Ok(self
            .table_export_info()?
            .into_iter()
            .map(|info| (info.table, info.timestamp.timestamp_millis()))
            .collect())
    }

    /// Tracker outlives the consumer; the supervisor closes it last.
    pub fn close(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_get_set_delete() {
        let dir = TempDir::new().unwrap();
        let tracker = Tracker::open(dir.path()).unwrap();

        assert!(tracker.get("missing").unwrap().is_none());

        tracker.set("k", b"v1").unwrap();
        assert_eq!(tracker.get("k").unwrap().unwrap(), b"v1");

        tracker.set("k", b"v2").unwrap();
        assert_eq!(tracker.get("k").unwrap().unwrap(), b"v2");

        tracker.delete("k").unwrap();
        assert!(tracker.get("k").unwrap().is_none());
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let tracker = Tracker::open(dir.path()).unwrap();
            tracker.set("durable", b"yes").unwrap();
            tracker.close();
        }
        let tracker = Tracker::open(dir.path()).unwrap();
        assert_eq!(tracker.get("durable").unwrap().unwrap(), b"yes");
    }

    #[test]
    fn test_table_export_info_roundtrip() {
        let dir = TempDir::new().unwrap();
        let tracker = Tracker::open(dir.path()).unwrap();

        assert!(tracker.table_export_info().unwrap().is_empty());

        let info = vec![
            TableExportInfo {
                table: "orders".into(),
                timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            },
            TableExportInfo {
                table: "customers".into(),
                timestamp: Utc.timestamp_millis_opt(1_699_000_000_000).unwrap(),
            },
        ];
        tracker.set_json(TABLE_EXPORT_INFO_KEY, &info).unwrap();

        let watermarks = tracker.export_watermarks().unwrap();
        assert_eq!(watermarks["orders"], 1_700_000_000_000);
        assert_eq!(watermarks["customers"], 1_699_000_000_000);
    }
}
