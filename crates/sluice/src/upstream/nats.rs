//! NATS JetStream adapter
//!
//! The only module allowed to name the client library. Maps the
//! library's failures onto the two abstract upstream conditions at this
//! boundary and implements the durable create-or-update rule: the
//! delivery policy is chosen only when the durable does not exist yet;
//! afterwards the stored policy (and start time) always wins.

use super::{
    AckHandle, ConsumerSpec, DeliverPolicy, MessageInfo, SubscriptionHandle, UpstreamClient,
    UpstreamMessage, CONTENT_ENCODING_HEADER, MSG_ID_HEADER,
};
use crate::error::{Result, SluiceError};
use async_nats::jetstream;
use async_nats::jetstream::consumer::{pull, AckPolicy, PullConsumer};
use async_nats::ConnectOptions;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Deadline for durable create/update round-trips.
const CONSUMER_SETUP_TIMEOUT: Duration = Duration::from_secs(600);

/// Pull expiry for the delivery loop.
const PULL_EXPIRY: Duration = Duration::from_secs(60);

/// Connection settings for the adapter.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    pub url: String,
    /// Credentials file; `None` for localhost development servers.
    pub credentials: Option<PathBuf>,
    /// Client connection name.
    pub name: String,
}

/// JetStream-backed upstream.
pub struct NatsUpstream {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    consumer: parking_lot::Mutex<Option<PullConsumer>>,
    disconnect_tx: watch::Sender<bool>,
}

impl NatsUpstream {
    /// Connect and build the JetStream context.
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let (disconnect_tx, _) = watch::channel(false);
        let event_tx = disconnect_tx.clone();

        let mut options = ConnectOptions::new()
            .name(&config.name)
            .event_callback(move |event| {
                let event_tx = event_tx.clone();
                async move {
                    match event {
                        async_nats::Event::Disconnected | async_nats::Event::Closed => {
                            warn!(?event, "upstream connection lost");
                            let _ = event_tx.send(true);
                        }
                        async_nats::Event::Connected => {
                            let _ = event_tx.send(false);
                        }
                        other => trace!(?other, "upstream connection event"),
                    }
                }
            });

        if let Some(creds) = &config.credentials {
            options = options
                .credentials_file(creds)
                .await
                .map_err(|e| SluiceError::config(format!("credentials: {e}")))?;
        }

        let client = options
            .connect(&config.url)
            .await
            .map_err(|_| SluiceError::ConnectionLost)?;
        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            consumer: parking_lot::Mutex::new(None),
            disconnect_tx,
        })
    }

    fn map_deliver_policy(policy: DeliverPolicy) -> jetstream::consumer::DeliverPolicy {
        match policy {
            DeliverPolicy::All => jetstream::consumer::DeliverPolicy::All,
            DeliverPolicy::New => jetstream::consumer::DeliverPolicy::New,
            DeliverPolicy::ByStartTime(ts) => jetstream::consumer::DeliverPolicy::ByStartTime {
                start_time: time::OffsetDateTime::from_unix_timestamp_nanos(
                    ts.timestamp_nanos_opt().unwrap_or_default() as i128,
                )
                .unwrap_or(time::OffsetDateTime::UNIX_EPOCH),
            },
        }
    }

    fn pull_config(spec: &ConsumerSpec) -> pull::Config {
        pull::Config {
            durable_name: Some(spec.durable_name.clone()),
            filter_subjects: spec.filter_subjects.clone(),
            ack_policy: AckPolicy::Explicit,
            ack_wait: spec.ack_wait,
            max_deliver: spec.max_deliver as i64,
            max_ack_pending: spec.max_ack_pending as i64,
            max_batch: spec.max_request_batch as i64,
            inactive_threshold: spec.inactive_threshold,
            ..Default::default()
        }
    }
}

#[async_trait]
impl UpstreamClient for NatsUpstream {
    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> Result<()> {
        let setup = async {
            let stream = self
                .jetstream
                .get_stream(&spec.stream)
                .await
                .map_err(|e| SluiceError::subscription(format!("get stream: {e}")))?;

            let mut config = Self::pull_config(spec);
            match stream.get_consumer::<pull::Config>(&spec.durable_name).await {
                Ok(existing) => {
                    // durable exists: its delivery position is immutable
                    config.deliver_policy = existing.cached_info().config.deliver_policy;
                    debug!(
                        durable = %spec.durable_name,
                        policy = ?config.deliver_policy,
                        "updating existing durable consumer"
                    );
                }
                Err(_) => {
                    config.deliver_policy = Self::map_deliver_policy(spec.deliver_policy);
                    debug!(
                        durable = %spec.durable_name,
                        policy = ?config.deliver_policy,
                        "creating durable consumer"
                    );
                }
            }

            let consumer = stream
                .create_consumer(config)
                .await
                .map_err(|e| SluiceError::subscription(format!("create consumer: {e}")))?;
            *self.consumer.lock() = Some(consumer);
            Ok(())
        };

        tokio::time::timeout(CONSUMER_SETUP_TIMEOUT, setup)
            .await
            .map_err(|_| SluiceError::subscription("consumer setup timed out".to_string()))?
    }

    async fn subscribe(
        &self,
        tx: mpsc::Sender<UpstreamMessage>,
    ) -> Result<Box<dyn SubscriptionHandle>> {
        let consumer = self
            .consumer
            .lock()
            .clone()
            .ok_or_else(|| SluiceError::subscription("consumer not ensured"))?;

        let mut messages = consumer
            .stream()
            .expires(PULL_EXPIRY)
            .messages()
            .await
            .map_err(|e| SluiceError::subscription(e.to_string()))?;

        let cancel = CancellationToken::new();
        let pump_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => return,
                    next = messages.next() => {
                        let msg = match next {
                            Some(Ok(msg)) => msg,
                            Some(Err(e)) => {
                                warn!(error = %e, "consumer delivery error");
                                continue;
                            }
                            None => return,
                        };
                        let info = match msg.info() {
                            Ok(info) => MessageInfo {
                                deliveries: info.delivered.max(0) as u64,
                                num_pending: info.pending,
                                stream_sequence: info.stream_sequence,
                                consumer_sequence: info.consumer_sequence,
                            },
                            Err(e) => {
                                warn!(error = %e, "unparseable reply metadata");
                                MessageInfo::default()
                            }
                        };
                        let header = |name: &str| {
                            msg.headers
                                .as_ref()
                                .and_then(|h| h.get(name))
                                .map(|v| v.to_string())
                                .unwrap_or_default()
                        };
                        let message_id = header(MSG_ID_HEADER);
                        let gzipped = header(CONTENT_ENCODING_HEADER) == "gzip/json";
                        let subject = msg.subject.to_string();
                        let payload = msg.payload.clone();
                        let upstream_msg = UpstreamMessage::new(
                            subject,
                            message_id,
                            gzipped,
                            payload,
                            info,
                            Box::new(NatsAck { message: msg }),
                        );
                        if tx.send(upstream_msg).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Box::new(NatsSubscription { cancel, handle }))
    }

    async fn publish(
        &self,
        subject: &str,
        headers: Vec<(String, String)>,
        payload: Bytes,
    ) -> Result<()> {
        let mut header_map = async_nats::HeaderMap::new();
        for (name, value) in headers {
            header_map.insert(name.as_str(), value.as_str());
        }
        self.client
            .publish_with_headers(subject.to_string(), header_map, payload)
            .await
            .map_err(|_| SluiceError::ConnectionLost)?;
        Ok(())
    }

    fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnect_tx.subscribe()
    }

    async fn close(&self) -> Result<()> {
        *self.consumer.lock() = None;
        self.client
            .drain()
            .await
            .map_err(|_| SluiceError::ConnectionLost)?;
        Ok(())
    }
}

struct NatsAck {
    message: jetstream::Message,
}

#[async_trait]
impl AckHandle for NatsAck {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| SluiceError::Ack(e.to_string()))
    }

    async fn nak(&self) -> Result<()> {
        self.message
            .ack_with(jetstream::AckKind::Nak(None))
            .await
            .map_err(|e| SluiceError::Nak(e.to_string()))
    }
}

struct NatsSubscription {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

#[async_trait]
impl SubscriptionHandle for NatsSubscription {
    async fn drain(&mut self) {
        self.cancel.cancel();
        let _ = (&mut self.handle).await;
    }
}
