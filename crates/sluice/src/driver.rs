//! Sink driver contract
//!
//! Drivers are stateful processors: the dispatcher hands them events one
//! at a time and periodically asks them to flush the accumulated batch.
//! Because delivery is at-least-once, `process` and `flush` must tolerate
//! re-delivery of any prefix of a previous batch; sinks typically key
//! upserts on the primary key and filter DELETEs by key existence.
//!
//! The dispatcher owns the driver: methods are never called concurrently,
//! and the driver must not retain borrowed events past `flush`.

use crate::error::{Result, SluiceError};
use crate::event::ChangeEvent;
use crate::registry::SchemaRegistry;
use crate::schema::{Schema, SchemaMap};
use crate::tracker::Tracker;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::trace;

/// Runtime wiring handed to a driver at start.
#[derive(Clone)]
pub struct DriverConfig {
    /// Sink connection string, e.g. `file:///var/lib/sluice/out`.
    pub url: String,
    /// Data directory for per-sink local state.
    pub data_dir: PathBuf,
    /// Schema registry, when the sink needs table descriptors.
    pub registry: Option<Arc<dyn SchemaRegistry>>,
    /// Tracker for per-sink resumable state.
    pub tracker: Option<Arc<Tracker>>,
}

/// Handler for the bulk-import pipeline, advertised by drivers that can
/// bulk load exported archives.
#[async_trait]
pub trait ImportHandler: Send {
    /// Prepare the sink-side datasource before importing.
    async fn create_datasource(&mut self, schema: &SchemaMap) -> Result<()>;

    /// Apply one synthesized import event.
    async fn import_event(&mut self, event: &ChangeEvent, schema: &Schema) -> Result<()>;

    /// All events have been handed over.
    async fn import_completed(&mut self) -> Result<()>;
}

/// Uniform sink contract.
///
/// Optional capabilities are probed through the default methods at
/// registration time; implementations advertise by overriding them.
#[async_trait]
pub trait Driver: Send {
    /// Initialize connections and load per-sink state.
    async fn start(&mut self, config: DriverConfig) -> Result<()>;

    /// Release resources. After stop, `process`/`flush` return the
    /// [`SluiceError::DriverStopped`] sentinel.
    async fn stop(&mut self) -> Result<()>;

    /// Largest number of events `process` accepts before `flush` must be
    /// called. `0` means no driver-imposed limit; the consumer
    /// substitutes its own in-flight cap.
    fn max_batch_size(&self) -> usize {
        0
    }

    /// Append one event to the internal batch. Returning `true` asks the
    /// consumer to flush immediately after this event. Errors are
    /// terminal for the current batch.
    async fn process(&mut self, event: ChangeEvent) -> Result<bool>;

    /// Commit the accumulated batch as atomically as the sink allows.
    /// On `Ok(())` the consumer acks every pending message.
    async fn flush(&mut self) -> Result<()>;

    /// Capability: receive the consumer session id.
    fn set_session_id(&mut self, _session_id: &str) {}

    /// Capability: whether the sink applies DELETE operations.
    fn supports_delete(&self) -> bool {
        true
    }

    /// Capability: sink-specific note surfaced next to validation skips.
    fn validation_notes(&self) -> Option<String> {
        None
    }

    /// Capability: bulk-import handler, when supported.
    fn import_handler(&mut self) -> Option<&mut dyn ImportHandler> {
        None
    }
}

/// Resolve the directory from a `file://` URL (or a bare path).
pub fn file_url_dir(url: &str) -> Result<PathBuf> {
    let path = match url.strip_prefix("file://") {
        Some(rest) => rest,
        None => url,
    };
    if path.is_empty() {
        return Err(SluiceError::config(
            "file url requires a directory path".to_string(),
        ));
    }
    Ok(PathBuf::from(path))
}

/// Filesystem sink: each flushed event becomes
/// `<dir>/<table>/<unix-seconds>-<primary-key>.json`, written via a
/// temp-file rename so a crashed flush leaves no partial record. Writes
/// are keyed by primary key and timestamp, so replaying a batch prefix
/// rewrites identical files.
#[derive(Default)]
pub struct FileDriver {
    dir: PathBuf,
    batch: Vec<ChangeEvent>,
    stopped: bool,
    started: bool,
}

impl FileDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn file_name(event: &ChangeEvent) -> String {
        format!("{}-{}.json", event.timestamp / 1000, event.primary_key())
    }

    async fn write_event(&self, event: &ChangeEvent) -> Result<()> {
        let dir = self.dir.join(&event.table);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(Self::file_name(event));
        let tmp = path.with_extension("json.tmp");
        let buf = serde_json::to_vec(event)?;
        tokio::fs::write(&tmp, &buf).await?;
        tokio::fs::rename(&tmp, &path).await?;
        trace!(path = %path.display(), "stored event");
        Ok(())
    }
}

#[async_trait]
impl Driver for FileDriver {
    async fn start(&mut self, config: DriverConfig) -> Result<()> {
        self.dir = file_url_dir(&config.url)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        self.started = true;
        self.stopped = false;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.stopped = true;
        Ok(())
    }

    async fn process(&mut self, event: ChangeEvent) -> Result<bool> {
        if self.stopped || !self.started {
            return Err(SluiceError::DriverStopped);
        }
        self.batch.push(event);
        Ok(false)
    }

    async fn flush(&mut self) -> Result<()> {
        if self.stopped || !self.started {
            return Err(SluiceError::DriverStopped);
        }
        for event in std::mem::take(&mut self.batch) {
            self.write_event(&event).await?;
        }
        Ok(())
    }

    fn supports_delete(&self) -> bool {
        false
    }
}
