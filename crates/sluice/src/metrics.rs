//! Metrics facade
//!
//! All instrumentation goes through [`SluiceMetrics`] so no other module
//! depends on the metrics backend. Uses the `metrics` crate facade; the
//! daemon installs a Prometheus recorder and serves the exposition.
//!
//! Naming convention: `sluice_{name}_{unit}`.
//!
//! The facade mirrors counters into process-local atomics so heartbeats
//! can sample current values without querying the exporter.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

static TOTAL_EVENTS: AtomicU64 = AtomicU64::new(0);
static PENDING_EVENTS: AtomicI64 = AtomicI64::new(0);
static FLUSH_COUNT: AtomicU64 = AtomicU64::new(0);
static FLUSH_DURATION_US: AtomicU64 = AtomicU64::new(0);

/// Process-wide engine metrics.
pub struct SluiceMetrics;

impl SluiceMetrics {
    /// One message received from the upstream pump.
    pub fn increment_total_events() {
        metrics::counter!("sluice_total_events").increment(1);
        TOTAL_EVENTS.fetch_add(1, Ordering::Relaxed);
    }

    /// A message entered the in-flight buffer.
    pub fn increment_pending_events() {
        metrics::gauge!("sluice_pending_events").increment(1.0);
        PENDING_EVENTS.fetch_add(1, Ordering::Relaxed);
    }

    /// A message left the in-flight set (acked, naked, or skipped).
    pub fn decrement_pending_events() {
        metrics::gauge!("sluice_pending_events").decrement(1.0);
        PENDING_EVENTS.fetch_sub(1, Ordering::Relaxed);
    }

    /// A driver flush committed `count` events in `seconds`.
    pub fn record_flush(count: u64, seconds: f64) {
        metrics::histogram!("sluice_flush_count").record(count as f64);
        metrics::histogram!("sluice_flush_duration_seconds").record(seconds);
        FLUSH_COUNT.fetch_add(1, Ordering::Relaxed);
        FLUSH_DURATION_US.fetch_add((seconds * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    /// Time from oldest-pending to flush completion.
    pub fn record_processing_duration(seconds: f64) {
        metrics::histogram!("sluice_processing_duration_seconds").record(seconds);
    }

    /// Sample the counters for the heartbeat payload.
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            total_events: TOTAL_EVENTS.load(Ordering::Relaxed),
            pending_events: PENDING_EVENTS.load(Ordering::Relaxed).max(0),
            flush_count: FLUSH_COUNT.load(Ordering::Relaxed),
            flush_duration_seconds: FLUSH_DURATION_US.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}

/// Counter sample carried in heartbeats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_events: u64,
    pub pending_events: i64,
    pub flush_count: u64,
    pub flush_duration_seconds: f64,
}
