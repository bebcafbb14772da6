//! Event intake and batched dispatch
//!
//! The consumer owns the durable upstream subscription, pulls messages
//! into a bounded buffer, decodes and filters them, hands them to the
//! driver, and commits batches under the size/time flush policy with
//! explicit ack/nak semantics.
//!
//! A single dispatcher task is the sole mutator of the pending batch and
//! the driver, so no locking is needed around batch state. Parallel
//! tasks: the adapter's message pump, the heartbeat timer, and (in the
//! daemon) the control listener and disconnect watcher.
//!
//! Delivery is at-least-once: the engine retries nothing itself; every
//! retry is upstream redelivery after a nak.

use crate::driver::Driver;
use crate::error::{Result, SluiceError};
use crate::event::ChangeEvent;
use crate::heartbeat::{heartbeat_subject, HeartbeatPayload, HEARTBEAT_INTERVAL};
use crate::metrics::SluiceMetrics;
use crate::registry::SchemaRegistry;
use crate::upstream::{
    ConsumerSpec, DeliverPolicy, SubscriptionHandle, UpstreamClient, UpstreamMessage,
};
use crate::validator::{SchemaValidator, Verdict};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

/// Upstream system cap on in-flight messages.
pub const DEFAULT_MAX_ACK_PENDING: usize = 25_000;
/// Per-pull batch hint.
pub const DEFAULT_MAX_PENDING_BUFFER: usize = 4_096;

/// Minimum accumulation period before an idle flush.
const DEFAULT_MIN_PENDING_LATENCY: Duration = Duration::from_secs(2);
/// Maximum accumulation period before a forced flush.
const DEFAULT_MAX_PENDING_LATENCY: Duration = Duration::from_secs(30);
/// Wait when the buffer is empty to prevent CPU spinning.
const EMPTY_BUFFER_PAUSE: Duration = Duration::from_millis(50);

const STREAM_NAME: &str = "dbchange";
const ACK_WAIT: Duration = Duration::from_secs(5 * 60);
const MAX_DELIVER: u32 = 20;
/// Expire the durable if unused for three days.
const INACTIVE_THRESHOLD: Duration = Duration::from_secs(72 * 3600);

/// The driver is shared with the supervisor so it can outlive the
/// consumer across restarts; the dispatcher is the only caller while the
/// consumer runs.
pub type SharedDriver = Arc<tokio::sync::Mutex<Box<dyn Driver>>>;

/// Consumer lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Running,
    Paused,
    Stopping,
    Stopped,
    Errored,
}

/// Per-run session, published in heartbeats.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub started: DateTime<Utc>,
    start_instant: Instant,
}

impl Session {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started: Utc::now(),
            start_instant: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_instant.elapsed()
    }
}

/// Consumer configuration. Zero numeric values select the defaults.
pub struct ConsumerConfig {
    /// Tenant owning the durable.
    pub company_id: String,
    /// Tenants to filter subjects for; defaults to `[company_id]`.
    pub company_ids: Vec<String>,
    /// Appended to the durable name for parallel workers.
    pub suffix: String,
    pub max_ack_pending: usize,
    pub max_pending_buffer: usize,
    pub min_pending_latency: Duration,
    pub max_pending_latency: Duration,
    /// Read from the beginning of the stream; only effective when the
    /// durable does not exist yet.
    pub deliver_all: bool,
    /// Per-table import watermarks (epoch milliseconds).
    pub export_table_timestamps: HashMap<String, i64>,
    pub validator: Option<SchemaValidator>,
    pub registry: Option<Arc<dyn SchemaRegistry>>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            company_id: "dev".to_string(),
            company_ids: Vec::new(),
            suffix: String::new(),
            max_ack_pending: DEFAULT_MAX_ACK_PENDING,
            max_pending_buffer: DEFAULT_MAX_PENDING_BUFFER,
            min_pending_latency: Duration::ZERO,
            max_pending_latency: Duration::ZERO,
            deliver_all: false,
            export_table_timestamps: HashMap::new(),
            validator: None,
            registry: None,
        }
    }
}

impl ConsumerConfig {
    /// The delivery policy for first creation: `deliver_all` wins, then
    /// the earliest watermark across all tables, then deliver-new.
    fn initial_deliver_policy(&self) -> DeliverPolicy {
        if self.deliver_all {
            return DeliverPolicy::All;
        }
        match self.export_table_timestamps.values().min() {
            Some(&earliest) => match Utc.timestamp_millis_opt(earliest).single() {
                Some(ts) => DeliverPolicy::ByStartTime(ts),
                None => DeliverPolicy::New,
            },
            None => DeliverPolicy::New,
        }
    }

    fn consumer_spec(&self) -> Result<ConsumerSpec> {
        if self.company_id.is_empty() {
            return Err(SluiceError::config("company id is required"));
        }
        let company_ids: Vec<&str> = if self.company_ids.is_empty() {
            vec![self.company_id.as_str()]
        } else {
            self.company_ids.iter().map(String::as_str).collect()
        };
        let max_ack_pending = if self.max_ack_pending == 0 {
            DEFAULT_MAX_ACK_PENDING
        } else {
            self.max_ack_pending
        };
        let max_request_batch = if self.max_pending_buffer == 0 {
            DEFAULT_MAX_PENDING_BUFFER
        } else {
            self.max_pending_buffer
        };
        Ok(ConsumerSpec {
            stream: STREAM_NAME.to_string(),
            durable_name: ConsumerSpec::durable_name_for(&self.company_id, &self.suffix),
            filter_subjects: company_ids
                .iter()
                .map(|id| ConsumerSpec::filter_subject_for(id))
                .collect(),
            max_ack_pending,
            max_request_batch,
            deliver_policy: self.initial_deliver_policy(),
            ack_wait: ACK_WAIT,
            max_deliver: MAX_DELIVER,
            inactive_threshold: INACTIVE_THRESHOLD,
        })
    }

    fn min_latency(&self) -> Duration {
        if self.min_pending_latency.is_zero() {
            DEFAULT_MIN_PENDING_LATENCY
        } else {
            self.min_pending_latency
        }
    }

    fn max_latency(&self) -> Duration {
        if self.max_pending_latency.is_zero() {
            DEFAULT_MAX_PENDING_LATENCY
        } else {
            self.max_pending_latency
        }
    }
}

/// The intake-and-dispatch engine.
pub struct Consumer {
    session: Session,
    durable_name: String,
    state: Arc<Mutex<ConsumerState>>,
    client: Arc<dyn UpstreamClient>,
    buffer_tx: mpsc::Sender<UpstreamMessage>,
    dispatcher: Option<Dispatcher>,
    dispatcher_handle: Option<tokio::task::JoinHandle<()>>,
    heartbeat_handle: Option<tokio::task::JoinHandle<()>>,
    subscription: Option<Box<dyn SubscriptionHandle>>,
    pause_started: Arc<Mutex<Option<DateTime<Utc>>>>,
    error_rx: mpsc::Receiver<SluiceError>,
    cancel: CancellationToken,
    graceful: CancellationToken,
}

impl Consumer {
    /// Set up the durable consumer and the dispatcher, but do not start
    /// consuming.
    pub async fn create(
        config: ConsumerConfig,
        client: Arc<dyn UpstreamClient>,
        driver: SharedDriver,
    ) -> Result<Self> {
        let session = Session::new();
        let spec = config.consumer_spec()?;
        debug!(
            durable = %spec.durable_name,
            session = %session.id,
            policy = ?spec.deliver_policy,
            "creating consumer"
        );

        client.ensure_consumer(&spec).await?;

        driver.lock().await.set_session_id(&session.id);

        if let Some(registry) = &config.registry {
            // warms the cache; the map itself is only used by drivers
            match registry.get_latest_schema_map().await {
                Ok(map) => debug!(tables = map.len(), "schema registry primed"),
                Err(err) => warn!(error = %err, "unable to prime schema registry"),
            }
        }

        let (buffer_tx, buffer_rx) = mpsc::channel(spec.max_ack_pending);
        let (error_tx, error_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();
        let graceful = CancellationToken::new();
        let state = Arc::new(Mutex::new(ConsumerState::Created));

        let min_pending_latency = config.min_latency();
        let max_pending_latency = config.max_latency();

        let dispatcher = Dispatcher {
            buffer_rx,
            pending: Vec::new(),
            pending_started: None,
            driver,
            watermarks: config.export_table_timestamps.clone(),
            validator: config.validator,
            max_ack_pending: spec.max_ack_pending,
            min_pending_latency,
            max_pending_latency,
            error_tx,
            cancel: cancel.clone(),
            graceful: graceful.clone(),
            state: state.clone(),
        };

        Ok(Self {
            durable_name: spec.durable_name.clone(),
            session,
            state,
            client,
            buffer_tx,
            dispatcher: Some(dispatcher),
            dispatcher_handle: None,
            heartbeat_handle: None,
            subscription: None,
            pause_started: Arc::new(Mutex::new(None)),
            error_rx,
            cancel,
            graceful,
        })
    }

    /// Subscribe and spawn the dispatcher and heartbeat tasks.
    pub async fn start(&mut self) -> Result<()> {
        let dispatcher = self
            .dispatcher
            .take()
            .ok_or_else(|| SluiceError::other("consumer already started"))?;

        self.unpause().await?;

        self.dispatcher_handle = Some(tokio::spawn(dispatcher.run()));
        self.heartbeat_handle = Some(tokio::spawn(Self::heartbeat_loop(
            self.client.clone(),
            self.session.clone(),
            self.pause_started.clone(),
            self.cancel.clone(),
        )));

        debug!(session = %self.session.id, "started");
        Ok(())
    }

    /// Drain the subscription so no new messages arrive. Pending
    /// messages are not flushed: they stay pending and the upstream
    /// redelivers them after the ack wait if the pause outlasts it.
    pub async fn pause(&mut self) {
        debug!("pausing");
        if let Some(mut sub) = self.subscription.take() {
            sub.drain().await;
        }
        *self.pause_started.lock() = Some(Utc::now());
        *self.state.lock() = ConsumerState::Paused;
        debug!("paused");
    }

    /// Re-subscribe with the same durable name and filters.
    pub async fn unpause(&mut self) -> Result<()> {
        if self.subscription.is_some() {
            return Err(SluiceError::other("consumer already subscribed"));
        }
        let sub = self.client.subscribe(self.buffer_tx.clone()).await?;
        self.subscription = Some(sub);
        *self.pause_started.lock() = None;
        *self.state.lock() = ConsumerState::Running;
        Ok(())
    }

    /// Drain the dispatcher, attempt a final flush, unsubscribe, and
    /// close the upstream connection.
    pub async fn stop(&mut self) -> Result<()> {
        if matches!(*self.state.lock(), ConsumerState::Stopped) {
            return Ok(());
        }
        debug!("stopping consumer");
        *self.state.lock() = ConsumerState::Stopping;

        self.graceful.cancel();
        if let Some(handle) = self.dispatcher_handle.take() {
            let _ = handle.await;
        }
        self.cancel.cancel();
        if let Some(handle) = self.heartbeat_handle.take() {
            let _ = handle.await;
        }
        if let Some(mut sub) = self.subscription.take() {
            sub.drain().await;
        }
        if let Err(err) = self.client.close().await {
            debug!(error = %err, "error closing upstream connection");
        }
        *self.state.lock() = ConsumerState::Stopped;
        debug!("stopped consumer");
        Ok(())
    }

    /// Receive the next fatal engine error.
    pub async fn recv_error(&mut self) -> Option<SluiceError> {
        self.error_rx.recv().await
    }

    /// Flips to `true` when the upstream connection is lost.
    pub fn disconnected(&self) -> tokio::sync::watch::Receiver<bool> {
        self.client.disconnected()
    }

    /// Durable consumer name.
    pub fn name(&self) -> &str {
        &self.durable_name
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    async fn heartbeat_loop(
        client: Arc<dyn UpstreamClient>,
        session: Session,
        pause_started: Arc<Mutex<Option<DateTime<Utc>>>>,
        cancel: CancellationToken,
    ) {
        let subject = heartbeat_subject(&session.id);
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("stopping heartbeat");
                    return;
                }
                _ = ticker.tick() => {
                    let payload =
                        HeartbeatPayload::new(&session.id, session.uptime(), *pause_started.lock());
                    match payload.encode() {
                        Ok(bytes) => {
                            if let Err(err) = client
                                .publish(&subject, HeartbeatPayload::headers(), bytes)
                                .await
                            {
                                error!(error = %err, "error sending heartbeat");
                            } else {
                                trace!(subject = %subject, "heartbeat sent");
                            }
                        }
                        Err(err) => error!(error = %err, "error encoding heartbeat"),
                    }
                }
            }
        }
    }
}

/// Keep accumulating instead of flushing while the server reports a
/// large backlog, bounded at twice the maximum pending latency.
fn defer_for_catchup(
    num_pending: u64,
    max_ack_pending: usize,
    pending_elapsed: Duration,
    max_pending_latency: Duration,
) -> bool {
    num_pending > max_ack_pending as u64 && pending_elapsed < max_pending_latency * 2
}

struct Dispatcher {
    buffer_rx: mpsc::Receiver<UpstreamMessage>,
    pending: Vec<UpstreamMessage>,
    pending_started: Option<Instant>,
    driver: SharedDriver,
    watermarks: HashMap<String, i64>,
    validator: Option<SchemaValidator>,
    max_ack_pending: usize,
    min_pending_latency: Duration,
    max_pending_latency: Duration,
    error_tx: mpsc::Sender<SluiceError>,
    cancel: CancellationToken,
    graceful: CancellationToken,
    state: Arc<Mutex<ConsumerState>>,
}

impl Dispatcher {
    async fn run(mut self) {
        trace!("dispatcher started");
        loop {
            if self.cancel.is_cancelled() {
                self.nak_everything().await;
                trace!("dispatcher cancelled");
                return;
            }
            if self.graceful.is_cancelled() {
                // final flush; a failure naks pending internally
                let _ = self.flush().await;
                trace!("dispatcher drained");
                return;
            }
            match self.buffer_rx.try_recv() {
                Ok(msg) => {
                    if self.handle_message(msg).await.is_break() {
                        return;
                    }
                }
                Err(TryRecvError::Empty) => {
                    let count = self.pending.len();
                    if count > 0
                        && count < self.max_ack_pending
                        && self.pending_elapsed() >= self.min_pending_latency
                    {
                        trace!(count, "idle flush");
                        if self.flush().await.is_break() {
                            return;
                        }
                        continue;
                    }
                    tokio::time::sleep(EMPTY_BUFFER_PAUSE).await;
                }
                Err(TryRecvError::Disconnected) => {
                    self.nak_everything().await;
                    return;
                }
            }
        }
    }

    fn pending_elapsed(&self) -> Duration {
        self.pending_started
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Ack-and-skip policy: import watermarks first, then the optional
    /// schema validator. Valid events get the matched-rule token.
    fn should_skip(&self, event: &mut ChangeEvent) -> bool {
        if let Some(&watermark) = self.watermarks.get(&event.table) {
            if event.timestamp < watermark {
                trace!(table = %event.table, watermark, ts = event.timestamp, "below watermark");
                return true;
            }
        }
        if let Some(validator) = &self.validator {
            match validator.validate(event) {
                Ok(Verdict::NoSchema) => {
                    trace!(table = %event.table, "skipping, no schema found for event");
                    return true;
                }
                Ok(Verdict::Invalid) => {
                    trace!(table = %event.table, "skipping, schema did not validate");
                    return true;
                }
                Ok(Verdict::Valid { path }) => {
                    trace!(path = %path, "schema validated");
                    event.schema_validated_path = Some(path);
                }
                Err(err) => {
                    error!(error = %err, "error validating schema");
                    return true;
                }
            }
        }
        false
    }

    async fn handle_message(&mut self, msg: UpstreamMessage) -> ControlFlow<()> {
        SluiceMetrics::increment_total_events();
        SluiceMetrics::increment_pending_events();

        let num_pending = msg.info.num_pending;
        let msg_id = msg.message_id.clone();
        let subject = msg.subject.clone();
        trace!(
            msg_id = %msg_id,
            subject = %subject,
            seq = msg.info.consumer_sequence,
            sid = msg.info.stream_sequence,
            deliveries = msg.info.deliveries,
            pending = self.pending.len(),
            "msg received"
        );
        let decoded = ChangeEvent::from_payload(&msg.payload, msg.gzipped);
        self.pending.push(msg);

        let mut event = match decoded {
            Ok(event) => event,
            Err(err) => {
                error!(
                    msg_id = %msg_id,
                    subject = %subject,
                    error = %err,
                    "error decoding change event"
                );
                return self.fail(err).await;
            }
        };

        if self.should_skip(&mut event) {
            debug!(msg_id = %event.id, table = %event.table, "skipping event");
            if let Some(msg) = self.pending.pop() {
                if let Err(err) = msg.ack().await {
                    // nothing else to do, the redelivery will skip again
                    error!(error = %err, "error acking skipped msg");
                }
            }
            SluiceMetrics::decrement_pending_events();
            return ControlFlow::Continue(());
        }

        let process_result = {
            let mut driver = self.driver.lock().await;
            match driver.process(event).await {
                Ok(hint) => Ok((hint, driver.max_batch_size())),
                Err(err) => Err(err),
            }
        };
        let (flush_hint, max_batch) = match process_result {
            Ok(v) => v,
            Err(err) => return self.fail(err).await,
        };
        let max_batch = if max_batch == 0 {
            self.max_ack_pending
        } else {
            max_batch
        };
        trace!(
            flush_hint,
            pending = self.pending.len(),
            max_batch,
            "process returned"
        );

        if flush_hint
            || self.pending.len() >= max_batch
            || self.pending.len() >= self.max_ack_pending
        {
            return self.flush().await;
        }

        if self.pending_started.is_none() {
            self.pending_started = Some(Instant::now());
        }
        if defer_for_catchup(
            num_pending,
            self.max_ack_pending,
            self.pending_elapsed(),
            self.max_pending_latency,
        ) {
            return ControlFlow::Continue(());
        }
        if self.pending_elapsed() >= self.max_pending_latency {
            return self.flush().await;
        }
        ControlFlow::Continue(())
    }

    /// Commit the driver's batch, then ack the pending messages in
    /// delivery order. Any failure naks what remains.
    async fn flush(&mut self) -> ControlFlow<()> {
        trace!(pending = self.pending.len(), "flush");
        let started = Instant::now();

        let flush_result = {
            let mut driver = self.driver.lock().await;
            driver.flush().await
        };
        if let Err(err) = flush_result {
            return match err {
                SluiceError::DriverStopped => {
                    // shutdown race: nak silently
                    self.nak_everything().await;
                    ControlFlow::Break(())
                }
                err => self.fail(err).await,
            };
        }

        let pending = std::mem::take(&mut self.pending);
        let mut count = 0u64;
        let mut ack_failure: Option<SluiceError> = None;
        for (i, msg) in pending.iter().enumerate() {
            match msg.ack().await {
                Ok(()) => {
                    SluiceMetrics::decrement_pending_events();
                    count += 1;
                }
                Err(err) => {
                    error!(msg_id = %msg.message_id, error = %err, "error acking msg");
                    for rest in &pending[i..] {
                        if let Err(nak_err) = rest.nak().await {
                            error!(msg_id = %rest.message_id, error = %nak_err, "error nacking msg");
                        }
                        SluiceMetrics::decrement_pending_events();
                    }
                    ack_failure = Some(err);
                    break;
                }
            }
        }

        if let Some(started_at) = self.pending_started.take() {
            SluiceMetrics::record_processing_duration(started_at.elapsed().as_secs_f64());
        }
        SluiceMetrics::record_flush(count, started.elapsed().as_secs_f64());

        if let Some(err) = ack_failure {
            error!(error = %err, "flush aborted on ack failure");
            let _ = self.error_tx.send(err).await;
            *self.state.lock() = ConsumerState::Errored;
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    }

    /// Nak the whole pending batch, surface the error, and stop.
    async fn fail(&mut self, err: SluiceError) -> ControlFlow<()> {
        error!(error = %err, "dispatcher error");
        self.nak_everything().await;
        let _ = self.error_tx.send(err).await;
        *self.state.lock() = ConsumerState::Errored;
        ControlFlow::Break(())
    }

    async fn nak_everything(&mut self) {
        if !self.pending.is_empty() {
            debug!(count = self.pending.len(), "nak everything");
        }
        for msg in self.pending.drain(..) {
            if let Err(err) = msg.nak().await {
                error!(msg_id = %msg.message_id, error = %err, "error nacking msg");
            }
            SluiceMetrics::decrement_pending_events();
        }
        self.pending_started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDriver;
    use crate::upstream::memory::{AckEvent, MemoryUpstream};

    fn event_json(id: &str, table: &str, pk: &str, ts: i64) -> String {
        format!(
            r#"{{"id":"{id}","operation":"INSERT","table":"{table}","key":["{table}","{pk}"],
                "timestamp":{ts},"modelVersion":"v1","after":{{"id":"{pk}"}}}}"#
        )
    }

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig {
            company_id: "acme".into(),
            max_ack_pending: 10,
            min_pending_latency: Duration::from_millis(20),
            max_pending_latency: Duration::from_millis(200),
            ..Default::default()
        }
    }

    async fn started_consumer(
        config: ConsumerConfig,
        upstream: &MemoryUpstream,
        driver: MockDriver,
    ) -> Consumer {
        let client: Arc<dyn UpstreamClient> = Arc::new(upstream.clone());
        let shared: SharedDriver =
            Arc::new(tokio::sync::Mutex::new(Box::new(driver) as Box<dyn Driver>));
        let mut consumer = Consumer::create(config, client, shared).await.unwrap();
        consumer.start().await.unwrap();
        consumer
    }

    async fn wait_until(mut predicate: impl FnMut() -> bool) {
        for _ in 0..100 {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn test_flush_hint_flushes_after_single_event() {
        let upstream = MemoryUpstream::new();
        let driver = MockDriver::new().with_flush_hint();
        upstream.push("dbchange.orders.INSERT.acme.l.PUBLIC.1.a", "m1",
            event_json("e1", "orders", "o1", 10).as_bytes(), 0);

        let mut consumer = started_consumer(fast_config(), &upstream, driver.clone()).await;
        wait_until(|| upstream.acked() == vec!["m1"]).await;

        assert_eq!(driver.flush_count(), 1);
        assert_eq!(driver.processed_ids(), vec!["e1"]);
        assert!(upstream.naked().is_empty());
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_watermark_skips_older_events() {
        let upstream = MemoryUpstream::new();
        let driver = MockDriver::new();
        upstream.push("s", "m1",
            event_json("e1", "orders", "o1", 1_699_999_999_999).as_bytes(), 0);

        let mut config = fast_config();
        config
            .export_table_timestamps
            .insert("orders".into(), 1_700_000_000_000);
        let mut consumer = started_consumer(config, &upstream, driver.clone()).await;

        wait_until(|| upstream.acked() == vec!["m1"]).await;
        assert!(driver.processed().is_empty(), "skipped event must not reach the driver");
        assert_eq!(driver.flush_count(), 0);
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_watermark_lets_newer_events_through() {
        let upstream = MemoryUpstream::new();
        let driver = MockDriver::new().with_flush_hint();
        upstream.push("s", "m1",
            event_json("e1", "orders", "o1", 1_700_000_000_001).as_bytes(), 0);

        let mut config = fast_config();
        config
            .export_table_timestamps
            .insert("orders".into(), 1_700_000_000_000);
        let mut consumer = started_consumer(config, &upstream, driver.clone()).await;

        wait_until(|| upstream.acked() == vec!["m1"]).await;
        assert_eq!(driver.processed_ids(), vec!["e1"]);
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_cap_flushes_and_acks_in_order() {
        let upstream = MemoryUpstream::new();
        let driver = MockDriver::new();
        for i in 1..=3 {
            upstream.push("s", &format!("m{i}"),
                event_json(&format!("e{i}"), "orders", &format!("o{i}"), i).as_bytes(), 0);
        }

        let mut config = fast_config();
        config.max_ack_pending = 3;
        config.max_pending_latency = Duration::from_secs(30);
        config.min_pending_latency = Duration::from_secs(30);
        let mut consumer = started_consumer(config, &upstream, driver.clone()).await;

        wait_until(|| upstream.acked().len() == 3).await;
        assert_eq!(upstream.acked(), vec!["m1", "m2", "m3"]);
        assert_eq!(driver.processed_ids(), vec!["e1", "e2", "e3"]);
        assert_eq!(driver.flush_count(), 1);
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_driver_batch_size_caps_batch() {
        let upstream = MemoryUpstream::new();
        let driver = MockDriver::new().with_max_batch_size(2);
        for i in 1..=2 {
            upstream.push("s", &format!("m{i}"),
                event_json(&format!("e{i}"), "orders", &format!("o{i}"), i).as_bytes(), 0);
        }
        let mut config = fast_config();
        config.min_pending_latency = Duration::from_secs(30);
        config.max_pending_latency = Duration::from_secs(30);
        let mut consumer = started_consumer(config, &upstream, driver.clone()).await;

        wait_until(|| driver.flush_count() == 1).await;
        assert_eq!(upstream.acked(), vec!["m1", "m2"]);
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_min_latency_flush() {
        let upstream = MemoryUpstream::new();
        let driver = MockDriver::new();
        for i in 1..=2 {
            upstream.push("s", &format!("m{i}"),
                event_json(&format!("e{i}"), "orders", &format!("o{i}"), i).as_bytes(), 0);
        }
        let mut consumer = started_consumer(fast_config(), &upstream, driver.clone()).await;

        wait_until(|| upstream.acked().len() == 2).await;
        assert_eq!(driver.flush_count(), 1);
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_decode_error_naks_all_pending() {
        let upstream = MemoryUpstream::new();
        let driver = MockDriver::new();
        let mut config = fast_config();
        config.min_pending_latency = Duration::from_secs(30);
        config.max_pending_latency = Duration::from_secs(30);
        upstream.push("s", "m1", event_json("e1", "orders", "o1", 1).as_bytes(), 0);
        upstream.push("s", "m2", br#"{"operation":"#, 0);

        let mut consumer = started_consumer(config, &upstream, driver.clone()).await;
        let err = consumer.recv_error().await.unwrap();
        assert!(matches!(err, SluiceError::Decode(_)));

        wait_until(|| upstream.naked().len() == 2).await;
        assert_eq!(upstream.naked(), vec!["m1", "m2"]);
        assert!(upstream.acked().is_empty());
        assert_eq!(consumer.state(), ConsumerState::Errored);
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_process_error_naks_all_pending() {
        let upstream = MemoryUpstream::new();
        let driver = MockDriver::new();
        driver.fail_process(true);
        upstream.push("s", "m1", event_json("e1", "orders", "o1", 1).as_bytes(), 0);

        let mut consumer = started_consumer(fast_config(), &upstream, driver.clone()).await;
        let err = consumer.recv_error().await.unwrap();
        assert!(matches!(err, SluiceError::Driver(_)));
        assert_eq!(upstream.naked(), vec!["m1"]);
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_error_naks_batch_then_redelivery_succeeds() {
        let upstream = MemoryUpstream::new();
        let driver = MockDriver::new().with_max_batch_size(5);
        driver.fail_next_flushes(1);
        let mut config = fast_config();
        config.min_pending_latency = Duration::from_secs(30);
        config.max_pending_latency = Duration::from_secs(30);
        for i in 1..=5 {
            upstream.push("s", &format!("m{i}"),
                event_json(&format!("e{i}"), "orders", &format!("o{i}"), i).as_bytes(), 0);
        }

        let mut consumer = started_consumer(config, &upstream, driver.clone()).await;
        let err = consumer.recv_error().await.unwrap();
        assert!(matches!(err, SluiceError::Driver(_)));
        assert_eq!(upstream.naked().len(), 5);
        assert!(upstream.acked().is_empty());
        consumer.stop().await.unwrap();

        // restart: the upstream redelivers and a succeeding flush acks all
        let upstream2 = MemoryUpstream::new();
        for i in 1..=5 {
            upstream2.push("s", &format!("m{i}"),
                event_json(&format!("e{i}"), "orders", &format!("o{i}"), i).as_bytes(), 0);
        }
        let driver2 = MockDriver::new().with_max_batch_size(5);
        let mut config2 = fast_config();
        config2.min_pending_latency = Duration::from_secs(30);
        config2.max_pending_latency = Duration::from_secs(30);
        let mut consumer2 = started_consumer(config2, &upstream2, driver2.clone()).await;

        wait_until(|| upstream2.acked().len() == 5).await;
        assert_eq!(upstream2.acked(), vec!["m1", "m2", "m3", "m4", "m5"]);
        consumer2.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_driver_stopped_sentinel_naks_silently() {
        let upstream = MemoryUpstream::new();
        let driver = MockDriver::new().with_max_batch_size(2);
        driver.stop_sentinel(true);
        for i in 1..=2 {
            upstream.push("s", &format!("m{i}"),
                event_json(&format!("e{i}"), "orders", &format!("o{i}"), i).as_bytes(), 0);
        }
        let mut config = fast_config();
        config.min_pending_latency = Duration::from_secs(30);
        config.max_pending_latency = Duration::from_secs(30);
        let mut consumer = started_consumer(config, &upstream, driver.clone()).await;

        wait_until(|| upstream.naked().len() == 2).await;
        // silent: nothing surfaced on the error channel
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tokio::time::timeout(Duration::from_millis(50), consumer.recv_error())
            .await
            .is_err());
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_ack_failure_naks_remainder_and_surfaces() {
        let upstream = MemoryUpstream::new();
        let driver = MockDriver::new().with_flush_hint();
        upstream.fail_acks(true);
        upstream.push("s", "m1", event_json("e1", "orders", "o1", 1).as_bytes(), 0);

        let mut consumer = started_consumer(fast_config(), &upstream, driver.clone()).await;
        let err = consumer.recv_error().await.unwrap();
        assert!(matches!(err, SluiceError::Ack(_)));
        assert_eq!(upstream.naked(), vec!["m1"]);
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_validator_skips_invalid_and_records_path() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("orders.json"),
            r#"{"type":"object","required":["id"],"properties":{"id":{"type":"string"}}}"#,
        )
        .unwrap();

        let upstream = MemoryUpstream::new();
        let driver = MockDriver::new().with_flush_hint();
        // no schema for customers -> skipped
        upstream.push("s", "m1", event_json("e1", "customers", "c1", 1).as_bytes(), 0);
        // invalid orders payload -> skipped
        upstream.push("s", "m2",
            br#"{"id":"e2","operation":"INSERT","table":"orders","key":["orders","o2"],
                 "timestamp":2,"after":{"total":5}}"#, 0);
        // valid orders payload -> processed with matched path
        upstream.push("s", "m3", event_json("e3", "orders", "o3", 3).as_bytes(), 0);

        let mut config = fast_config();
        config.validator = Some(SchemaValidator::load(dir.path()).unwrap());
        let mut consumer = started_consumer(config, &upstream, driver.clone()).await;

        wait_until(|| upstream.acked().len() == 3).await;
        assert_eq!(driver.processed_ids(), vec!["e3"]);
        let path = driver.processed()[0].schema_validated_path.clone().unwrap();
        assert!(path.ends_with("orders.json"));
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_drains_and_unpause_resumes_without_loss() {
        let upstream = MemoryUpstream::new();
        let driver = MockDriver::new();
        let mut consumer = started_consumer(fast_config(), &upstream, driver.clone()).await;
        assert!(upstream.is_subscribed());

        consumer.pause().await;
        assert!(!upstream.is_subscribed());
        assert_eq!(consumer.state(), ConsumerState::Paused);

        // arrives while paused; queued, not delivered
        upstream.push("s", "m1", event_json("e1", "orders", "o1", 1).as_bytes(), 0);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(driver.processed().is_empty());

        consumer.unpause().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Running);
        wait_until(|| upstream.acked() == vec!["m1"]).await;
        assert_eq!(driver.processed_ids(), vec!["e1"]);
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_flushes_pending_batch() {
        let upstream = MemoryUpstream::new();
        let driver = MockDriver::new();
        let mut config = fast_config();
        config.min_pending_latency = Duration::from_secs(30);
        config.max_pending_latency = Duration::from_secs(30);
        upstream.push("s", "m1", event_json("e1", "orders", "o1", 1).as_bytes(), 0);

        let mut consumer = started_consumer(config, &upstream, driver.clone()).await;
        wait_until(|| driver.processed_ids() == vec!["e1"]).await;
        assert!(upstream.acked().is_empty(), "no flush yet");

        consumer.stop().await.unwrap();
        assert_eq!(upstream.acked(), vec!["m1"], "final flush acks pending");
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }

    #[tokio::test]
    async fn test_every_message_acked_or_naked_exactly_once() {
        let upstream = MemoryUpstream::new();
        let driver = MockDriver::new();
        for i in 1..=6 {
            upstream.push("s", &format!("m{i}"),
                event_json(&format!("e{i}"), "orders", &format!("o{i}"), i).as_bytes(), 0);
        }
        let mut consumer = started_consumer(fast_config(), &upstream, driver.clone()).await;
        wait_until(|| upstream.ack_log().len() == 6).await;
        consumer.stop().await.unwrap();

        let log = upstream.ack_log();
        let mut seen = std::collections::HashSet::new();
        for entry in &log {
            let id = match entry {
                AckEvent::Acked(id) | AckEvent::Naked(id) => id,
            };
            assert!(seen.insert(id.clone()), "{id} settled twice");
        }
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_deliver_policy_all_wins_over_watermarks() {
        let mut config = fast_config();
        config.deliver_all = true;
        config
            .export_table_timestamps
            .insert("orders".into(), 1_700_000_000_000);
        assert_eq!(config.initial_deliver_policy(), DeliverPolicy::All);
    }

    #[test]
    fn test_deliver_policy_uses_earliest_watermark() {
        let mut config = fast_config();
        config
            .export_table_timestamps
            .insert("orders".into(), 1_700_000_000_000);
        config
            .export_table_timestamps
            .insert("customers".into(), 1_650_000_000_000);
        match config.initial_deliver_policy() {
            DeliverPolicy::ByStartTime(ts) => {
                assert_eq!(ts.timestamp_millis(), 1_650_000_000_000)
            }
            other => panic!("expected start-time policy, got {other:?}"),
        }
    }

    #[test]
    fn test_deliver_policy_defaults_to_new() {
        assert_eq!(fast_config().initial_deliver_policy(), DeliverPolicy::New);
    }

    #[tokio::test]
    async fn test_existing_durable_keeps_stored_policy() {
        let upstream = MemoryUpstream::new();
        let mut existing = fast_config().consumer_spec().unwrap();
        existing.deliver_policy = DeliverPolicy::All;
        upstream.set_existing_consumer(existing);

        let mut config = fast_config();
        config.deliver_all = false;
        let mut consumer =
            started_consumer(config, &upstream, MockDriver::new()).await;

        assert_eq!(
            upstream.ensured_spec().unwrap().deliver_policy,
            DeliverPolicy::All,
            "stored delivery policy wins over the new request"
        );
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_durable_name_is_deterministic() {
        let upstream = MemoryUpstream::new();
        let mut config = fast_config();
        config.suffix = "w2".into();
        let mut consumer = started_consumer(config, &upstream, MockDriver::new()).await;
        assert_eq!(consumer.name(), "eds-server-acme-w2");
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_session_id_handed_to_driver() {
        let upstream = MemoryUpstream::new();
        let driver = MockDriver::new();
        let mut consumer = started_consumer(fast_config(), &upstream, driver.clone()).await;
        assert_eq!(driver.session_id().unwrap(), consumer.session().id);
        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_published_with_msgpack_encoding() {
        let upstream = MemoryUpstream::new();
        let mut consumer = started_consumer(fast_config(), &upstream, MockDriver::new()).await;

        wait_until(|| !upstream.published().is_empty()).await;
        let (subject, headers, payload) = upstream.published()[0].clone();
        assert_eq!(subject, heartbeat_subject(&consumer.session().id));
        assert!(headers
            .iter()
            .any(|(k, v)| k == "content-encoding" && v == "msgpack"));
        let hb: HeartbeatPayload = rmp_serde::from_slice(&payload).unwrap();
        assert_eq!(hb.session_id, consumer.session().id);
        assert!(hb.paused.is_none());
        consumer.stop().await.unwrap();
    }

    #[test]
    fn test_defer_for_catchup() {
        let max_latency = Duration::from_secs(30);
        // backlog larger than the cap, still inside the window
        assert!(defer_for_catchup(100, 10, Duration::from_secs(10), max_latency));
        // window exhausted
        assert!(!defer_for_catchup(100, 10, Duration::from_secs(61), max_latency));
        // no backlog
        assert!(!defer_for_catchup(5, 10, Duration::from_secs(10), max_latency));
    }
}
