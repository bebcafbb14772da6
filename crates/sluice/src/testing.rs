//! Test doubles
//!
//! A scriptable sink driver used by the engine's own tests and available
//! to downstream crates for harness tests. The in-memory upstream lives
//! in [`crate::upstream::memory`].

use crate::driver::{Driver, DriverConfig};
use crate::error::{Result, SluiceError};
use crate::event::ChangeEvent;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct MockState {
    processed: Vec<ChangeEvent>,
    flushes: u32,
    flush_hint: bool,
    max_batch_size: usize,
    fail_flushes: u32,
    driver_stopped: bool,
    fail_process: bool,
    session_id: Option<String>,
}

/// Scriptable in-memory driver.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the consumer to flush after every processed event.
    pub fn with_flush_hint(self) -> Self {
        self.state.lock().flush_hint = true;
        self
    }

    /// Declare a driver-imposed batch cap.
    pub fn with_max_batch_size(self, size: usize) -> Self {
        self.state.lock().max_batch_size = size;
        self
    }

    /// Fail the next `n` flushes.
    pub fn fail_next_flushes(&self, n: u32) {
        self.state.lock().fail_flushes = n;
    }

    /// Fail every process call.
    pub fn fail_process(&self, fail: bool) {
        self.state.lock().fail_process = fail;
    }

    /// Make flush return the driver-stopped sentinel (shutdown race).
    pub fn stop_sentinel(&self, stopped: bool) {
        self.state.lock().driver_stopped = stopped;
    }

    /// Events handed to `process`, in order.
    pub fn processed(&self) -> Vec<ChangeEvent> {
        self.state.lock().processed.clone()
    }

    /// Ids of processed events, in order.
    pub fn processed_ids(&self) -> Vec<String> {
        self.state.lock().processed.iter().map(|e| e.id.clone()).collect()
    }

    pub fn flush_count(&self) -> u32 {
        self.state.lock().flushes
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }
}

#[async_trait]
impl Driver for MockDriver {
    async fn start(&mut self, _config: DriverConfig) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        self.state.lock().max_batch_size
    }

    async fn process(&mut self, event: ChangeEvent) -> Result<bool> {
        let mut state = self.state.lock();
        if state.fail_process {
            return Err(SluiceError::driver("scripted process failure"));
        }
        state.processed.push(event);
        Ok(state.flush_hint)
    }

    async fn flush(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.driver_stopped {
            return Err(SluiceError::DriverStopped);
        }
        if state.fail_flushes > 0 {
            state.fail_flushes -= 1;
            return Err(SluiceError::driver("scripted flush failure"));
        }
        state.flushes += 1;
        Ok(())
    }

    fn set_session_id(&mut self, session_id: &str) {
        self.state.lock().session_id = Some(session_id.to_string());
    }
}
