//! # sluice
//!
//! Change-data-streaming engine: consumes row-level change events from a
//! durable, at-least-once message stream and applies them, batched, to a
//! configurable downstream sink.
//!
//! The core is the [`consumer`] module: it owns the durable upstream
//! subscription, buffers and coalesces messages, enforces ack/nak
//! semantics, and drives per-sink flushes with backpressure. Sinks
//! implement the [`driver::Driver`] contract; the upstream transport is
//! abstracted behind [`upstream::UpstreamClient`] with a NATS JetStream
//! adapter behind the `nats` feature.
//!
//! ```text
//! upstream stream → Consumer ─→ Driver ─→ sink
//!                      │            ↑
//!                 Tracker      SchemaRegistry / SchemaValidator
//! ```

pub mod consumer;
pub mod driver;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod testing;
pub mod tracker;
pub mod upstream;
pub mod validator;

pub use consumer::{Consumer, ConsumerConfig, ConsumerState, SharedDriver};
pub use driver::{Driver, DriverConfig, FileDriver};
pub use error::{Result, SluiceError};
pub use event::{ChangeEvent, Operation};
pub use registry::{ApiRegistry, SchemaRegistry};
pub use schema::{Schema, SchemaMap};
pub use tracker::{TableExportInfo, Tracker};
pub use validator::{SchemaValidator, Verdict};
