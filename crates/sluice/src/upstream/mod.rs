//! Upstream stream abstraction
//!
//! The engine never names a concrete client library: it speaks to the
//! upstream through these traits, and adapters map their library's
//! errors onto two abstract conditions, "connection lost"
//! ([`crate::SluiceError::ConnectionLost`]) and "subscription error"
//! ([`crate::SluiceError::Subscription`]), at the boundary.

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Message header naming the stable message id.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Message header naming the payload encoding.
pub const CONTENT_ENCODING_HEADER: &str = "content-encoding";

/// Initial position of a newly created durable subscription. Ignored when
/// the durable already exists: the stored policy wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverPolicy {
    /// Start at the beginning of the stream.
    All,
    /// Only messages published after creation.
    New,
    /// Start at the given wall-clock position.
    ByStartTime(DateTime<Utc>),
}

/// Durable consumer specification.
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    pub stream: String,
    pub durable_name: String,
    pub filter_subjects: Vec<String>,
    /// In-flight cap; also sizes the engine's buffer.
    pub max_ack_pending: usize,
    /// Per-pull batch hint.
    pub max_request_batch: usize,
    pub deliver_policy: DeliverPolicy,
    pub ack_wait: Duration,
    pub max_deliver: u32,
    pub inactive_threshold: Duration,
}

impl ConsumerSpec {
    /// Deterministic durable name: `eds-server-<company>[-suffix]`.
    pub fn durable_name_for(company_id: &str, suffix: &str) -> String {
        if suffix.is_empty() {
            format!("eds-server-{company_id}")
        } else {
            format!("eds-server-{company_id}-{suffix}")
        }
    }

    /// Per-tenant subject filter: `dbchange.*.*.<companyId>.*.PUBLIC.>`.
    pub fn filter_subject_for(company_id: &str) -> String {
        format!("dbchange.*.*.{company_id}.*.PUBLIC.>")
    }
}

/// Delivery metadata sampled from the upstream for one message.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageInfo {
    /// How many times this message has been delivered.
    pub deliveries: u64,
    /// Messages remaining on the server for this consumer.
    pub num_pending: u64,
    pub stream_sequence: u64,
    pub consumer_sequence: u64,
}

/// Acknowledgement handle; exactly one of ack/nak is issued per message.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nak(&self) -> Result<()>;
}

/// One in-flight upstream message owned by the engine from intake until
/// ack or nak.
pub struct UpstreamMessage {
    pub subject: String,
    pub message_id: String,
    /// True when the payload carries `content-encoding: gzip/json`.
    pub gzipped: bool,
    pub payload: Bytes,
    pub info: MessageInfo,
    acker: Box<dyn AckHandle>,
}

impl UpstreamMessage {
    pub fn new(
        subject: impl Into<String>,
        message_id: impl Into<String>,
        gzipped: bool,
        payload: Bytes,
        info: MessageInfo,
        acker: Box<dyn AckHandle>,
    ) -> Self {
        Self {
            subject: subject.into(),
            message_id: message_id.into(),
            gzipped,
            payload,
            info,
            acker,
        }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nak(&self) -> Result<()> {
        self.acker.nak().await
    }
}

impl std::fmt::Debug for UpstreamMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamMessage")
            .field("subject", &self.subject)
            .field("message_id", &self.message_id)
            .field("payload_len", &self.payload.len())
            .field("info", &self.info)
            .finish()
    }
}

/// A live delivery; draining stops new messages without touching the
/// durable's server-side position.
#[async_trait]
pub trait SubscriptionHandle: Send {
    async fn drain(&mut self);
}

/// Client facade owned by the consumer.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Create the durable consumer, or update it preserving the stored
    /// delivery policy when it already exists.
    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> Result<()>;

    /// Start delivering messages into `tx`. Requires a prior
    /// `ensure_consumer`.
    async fn subscribe(
        &self,
        tx: mpsc::Sender<UpstreamMessage>,
    ) -> Result<Box<dyn SubscriptionHandle>>;

    /// Fire-and-forget publish (heartbeats). Failures are the caller's
    /// to log; they never affect the consumer state machine.
    async fn publish(
        &self,
        subject: &str,
        headers: Vec<(String, String)>,
        payload: Bytes,
    ) -> Result<()>;

    /// Flips to `true` when the connection is lost.
    fn disconnected(&self) -> watch::Receiver<bool>;

    /// Close the connection.
    async fn close(&self) -> Result<()>;
}
