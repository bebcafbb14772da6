//! Optional event schema validation
//!
//! Built from a directory of JSON Schema documents, one per table
//! (file stem = table name). The dispatcher consults the validator before
//! handing an event to the driver: events with no schema or an invalid
//! payload are acked-and-skipped, never treated as errors.

use crate::error::{Result, SluiceError};
use crate::event::ChangeEvent;
use jsonschema::JSONSchema;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, trace};

/// Outcome of validating one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// No schema document exists for the event's table.
    NoSchema,
    /// The payload did not satisfy the table's schema.
    Invalid,
    /// Valid; `path` is the matched-rule token recorded on the event.
    Valid { path: String },
}

struct CompiledRule {
    path: String,
    schema: JSONSchema,
}

/// Directory-backed validator.
pub struct SchemaValidator {
    rules: HashMap<String, CompiledRule>,
}

impl SchemaValidator {
    /// Load and compile every `*.json` document under `dir`.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut rules = HashMap::new();

        let entries = std::fs::read_dir(dir)
            .map_err(|e| SluiceError::validation(format!("read {}: {e}", dir.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| SluiceError::validation(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(table) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| SluiceError::validation(format!("read {}: {e}", path.display())))?;
            let doc: serde_json::Value = serde_json::from_str(&raw)
                .map_err(|e| SluiceError::validation(format!("parse {}: {e}", path.display())))?;
            let schema = JSONSchema::compile(&doc).map_err(|e| {
                SluiceError::validation(format!("compile {}: {e}", path.display()))
            })?;
            rules.insert(
                table.to_string(),
                CompiledRule {
                    path: path.display().to_string(),
                    schema,
                },
            );
        }

        debug!(dir = %dir.display(), tables = rules.len(), "loaded schema validator");
        Ok(Self { rules })
    }

    /// Number of table rules loaded.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Validate the event's row object against its table's rule.
    pub fn validate(&self, event: &ChangeEvent) -> Result<Verdict> {
        let Some(rule) = self.rules.get(&event.table) else {
            return Ok(Verdict::NoSchema);
        };
        let object = event.object()?;
        let instance = serde_json::to_value(&object)?;
        if rule.schema.is_valid(&instance) {
            trace!(table = %event.table, path = %rule.path, "schema validated");
            Ok(Verdict::Valid {
                path: rule.path.clone(),
            })
        } else {
            trace!(table = %event.table, "schema did not validate");
            Ok(Verdict::Invalid)
        }
    }
}
