//! Per-table schema descriptors
//!
//! Schemas are immutable: a new model version produces a new descriptor.
//! The registry client keys them by table name and version.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single column in a table descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    /// Logical type name as reported by the source (string, number,
    /// boolean, object, ...).
    #[serde(rename = "type")]
    pub data_type: String,
    /// Optional format refinement (date-time, uuid, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default)]
    pub nullable: bool,
}

/// Per-table schema descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub table: String,
    pub model_version: String,
    /// Columns in source order.
    pub columns: Vec<Column>,
    /// Primary-key column names in key order.
    #[serde(default)]
    pub primary_keys: Vec<String>,
    /// Columns that must be present on every row.
    #[serde(default)]
    pub required: Vec<String>,
}

impl Schema {
    /// Column names in source order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Latest-version schema descriptors keyed by table name.
pub type SchemaMap = HashMap<String, Schema>;
