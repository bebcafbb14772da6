//! In-memory upstream for tests
//!
//! Scripted messages, recorded acks/naks, and a switchable disconnect
//! signal. Mirrors the contract of the real adapter closely enough to
//! exercise every consumer path without a broker.

use super::{
    AckHandle, ConsumerSpec, SubscriptionHandle, UpstreamClient, UpstreamMessage,
};
use crate::error::{Result, SluiceError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// What happened to a message, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckEvent {
    Acked(String),
    Naked(String),
}

#[derive(Default)]
struct Script {
    queued: VecDeque<UpstreamMessage>,
    live_tx: Option<mpsc::Sender<UpstreamMessage>>,
}

struct Shared {
    script: Mutex<Script>,
    ack_log: Mutex<Vec<AckEvent>>,
    published: Mutex<Vec<(String, Vec<(String, String)>, Bytes)>>,
    ensured: Mutex<Option<ConsumerSpec>>,
    /// Pre-existing durable consumer config, when simulating a restart.
    existing: Mutex<Option<ConsumerSpec>>,
    fail_acks: Mutex<bool>,
    disconnect_tx: watch::Sender<bool>,
}

/// Scriptable in-memory upstream.
#[derive(Clone)]
pub struct MemoryUpstream {
    shared: Arc<Shared>,
}

impl Default for MemoryUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryUpstream {
    pub fn new() -> Self {
        let (disconnect_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                script: Mutex::new(Script::default()),
                ack_log: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                ensured: Mutex::new(None),
                existing: Mutex::new(None),
                fail_acks: Mutex::new(false),
                disconnect_tx,
            }),
        }
    }

    /// Queue a message for delivery; goes out immediately when a
    /// subscription is live.
    pub fn push(&self, subject: &str, message_id: &str, payload: &[u8], num_pending: u64) {
        let info = super::MessageInfo {
            deliveries: 1,
            num_pending,
            ..Default::default()
        };
        let msg = UpstreamMessage::new(
            subject,
            message_id,
            false,
            Bytes::copy_from_slice(payload),
            info,
            Box::new(MemoryAck {
                message_id: message_id.to_string(),
                shared: self.shared.clone(),
            }),
        );
        let mut script = self.shared.script.lock();
        match &script.live_tx {
            Some(tx) => {
                // delivery must not block the test thread
                let tx = tx.clone();
                let _ = tx.try_send(msg);
            }
            None => script.queued.push_back(msg),
        }
    }

    /// Simulate a durable consumer that survived a previous run.
    pub fn set_existing_consumer(&self, spec: ConsumerSpec) {
        *self.shared.existing.lock() = Some(spec);
    }

    /// Make every subsequent ack fail.
    pub fn fail_acks(&self, fail: bool) {
        *self.shared.fail_acks.lock() = fail;
    }

    /// Signal a lost connection.
    pub fn disconnect(&self) {
        let _ = self.shared.disconnect_tx.send(true);
    }

    /// Ack/nak sequence observed so far.
    pub fn ack_log(&self) -> Vec<AckEvent> {
        self.shared.ack_log.lock().clone()
    }

    /// Message ids acked, in order.
    pub fn acked(&self) -> Vec<String> {
        self.ack_log()
            .into_iter()
            .filter_map(|e| match e {
                AckEvent::Acked(id) => Some(id),
                AckEvent::Naked(_) => None,
            })
            .collect()
    }

    /// Message ids naked, in order.
    pub fn naked(&self) -> Vec<String> {
        self.ack_log()
            .into_iter()
            .filter_map(|e| match e {
                AckEvent::Naked(id) => Some(id),
                AckEvent::Acked(_) => None,
            })
            .collect()
    }

    /// Records published via the client (heartbeats).
    pub fn published(&self) -> Vec<(String, Vec<(String, String)>, Bytes)> {
        self.shared.published.lock().clone()
    }

    /// The consumer spec the engine ensured, when it has.
    pub fn ensured_spec(&self) -> Option<ConsumerSpec> {
        self.shared.ensured.lock().clone()
    }

    /// Whether a subscription is currently live.
    pub fn is_subscribed(&self) -> bool {
        self.shared.script.lock().live_tx.is_some()
    }
}

struct MemoryAck {
    message_id: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn ack(&self) -> Result<()> {
        if *self.shared.fail_acks.lock() {
            return Err(SluiceError::Ack(format!("ack refused for {}", self.message_id)));
        }
        self.shared
            .ack_log
            .lock()
            .push(AckEvent::Acked(self.message_id.clone()));
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        self.shared
            .ack_log
            .lock()
            .push(AckEvent::Naked(self.message_id.clone()));
        Ok(())
    }
}

struct MemorySubscription {
    shared: Arc<Shared>,
}

#[async_trait]
impl SubscriptionHandle for MemorySubscription {
    async fn drain(&mut self) {
        self.shared.script.lock().live_tx = None;
    }
}

#[async_trait]
impl UpstreamClient for MemoryUpstream {
    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> Result<()> {
        let mut effective = spec.clone();
        if let Some(existing) = self.shared.existing.lock().as_ref() {
            // stored delivery policy wins on update
            effective.deliver_policy = existing.deliver_policy;
        }
        *self.shared.ensured.lock() = Some(effective);
        Ok(())
    }

    async fn subscribe(
        &self,
        tx: mpsc::Sender<UpstreamMessage>,
    ) -> Result<Box<dyn SubscriptionHandle>> {
        let mut script = self.shared.script.lock();
        if script.live_tx.is_some() {
            return Err(SluiceError::subscription("already subscribed"));
        }
        while let Some(msg) = script.queued.pop_front() {
            tx.try_send(msg)
                .map_err(|e| SluiceError::subscription(e.to_string()))?;
        }
        script.live_tx = Some(tx);
        Ok(Box::new(MemorySubscription {
            shared: self.shared.clone(),
        }))
    }

    async fn publish(
        &self,
        subject: &str,
        headers: Vec<(String, String)>,
        payload: Bytes,
    ) -> Result<()> {
        self.shared
            .published
            .lock()
            .push((subject.to_string(), headers, payload));
        Ok(())
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.shared.disconnect_tx.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.shared.script.lock().live_tx = None;
        Ok(())
    }
}
