//! Consumer heartbeats
//!
//! Every minute the consumer publishes a compact msgpack record on
//! `eds.client.<sessionId>.heartbeat` with uptime, sampled engine
//! counters, and host memory/load. Heartbeat failures are logged and
//! never affect the consumer state machine.

use crate::error::Result;
use crate::metrics::{MetricsSnapshot, SluiceMetrics};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sysinfo::System;

/// Tick interval for the heartbeat task.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Subject a session's heartbeats are published on.
pub fn heartbeat_subject(session_id: &str) -> String {
    format!("eds.client.{session_id}.heartbeat")
}

/// Host memory and load sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStats {
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub load_one: f64,
    pub load_five: f64,
    pub load_fifteen: f64,
}

impl HostStats {
    pub fn sample() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        let load = System::load_average();
        Self {
            memory_total_bytes: sys.total_memory(),
            memory_used_bytes: sys.used_memory(),
            load_one: load.one,
            load_five: load.five,
            load_fifteen: load.fifteen,
        }
    }
}

/// Counters and host stats carried in one heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStats {
    pub metrics: MetricsSnapshot,
    pub host: HostStats,
}

impl SystemStats {
    pub fn sample() -> Self {
        Self {
            metrics: SluiceMetrics::snapshot(),
            host: HostStats::sample(),
        }
    }
}

/// Wire payload, msgpack-encoded with a `content-encoding: msgpack`
/// header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub session_id: String,
    /// Seconds since consumer start.
    pub uptime: u64,
    pub stats: SystemStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused: Option<DateTime<Utc>>,
}

impl HeartbeatPayload {
    pub fn new(session_id: &str, uptime: Duration, paused: Option<DateTime<Utc>>) -> Self {
        Self {
            session_id: session_id.to_string(),
            uptime: uptime.as_secs(),
            stats: SystemStats::sample(),
            paused,
        }
    }

    /// Encode the msgpack body.
    pub fn encode(&self) -> Result<Bytes> {
        let buf = rmp_serde::to_vec_named(self)
            .map_err(|e| crate::error::SluiceError::other(format!("encode heartbeat: {e}")))?;
        Ok(Bytes::from(buf))
    }

    /// Headers attached to the published record.
    pub fn headers() -> Vec<(String, String)> {
        vec![
            (
                crate::upstream::MSG_ID_HEADER.to_string(),
                uuid::Uuid::new_v4().to_string(),
            ),
            (
                crate::upstream::CONTENT_ENCODING_HEADER.to_string(),
                "msgpack".to_string(),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject() {
        assert_eq!(
            heartbeat_subject("9f2d"),
            "eds.client.9f2d.heartbeat"
        );
    }

    #[test]
    fn test_msgpack_roundtrip() {
        let hb = HeartbeatPayload {
            session_id: "s1".into(),
            uptime: 61,
            stats: SystemStats::default(),
            paused: None,
        };
        let bytes = hb.encode().unwrap();
        let back: HeartbeatPayload = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back.session_id, "s1");
        assert_eq!(back.uptime, 61);
        assert!(back.paused.is_none());
    }

    #[test]
    fn test_headers_name_encoding() {
        let headers = HeartbeatPayload::headers();
        assert!(headers
            .iter()
            .any(|(k, v)| k == "content-encoding" && v == "msgpack"));
    }

    #[test]
    fn test_host_stats_sample() {
        let stats = HostStats::sample();
        assert!(stats.memory_total_bytes > 0);
    }
}
