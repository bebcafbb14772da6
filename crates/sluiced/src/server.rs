//! Supervisor loop
//!
//! Reacts to consumer errors, upstream disconnects, interrupt signals,
//! and the control surface. The exit code tells the outer wrapper what
//! to do next: relaunch on 4 (intentional restart) and 5 (upstream
//! disconnected), stop otherwise.

use crate::control::ControlSignal;
use sluice::{Consumer, SluiceError};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_INCORRECT_USAGE: i32 = 3;
pub const EXIT_RESTART: i32 = 4;
pub const EXIT_DISCONNECTED: i32 = 5;

enum Event {
    Interrupt,
    ConsumerError(Option<SluiceError>),
    DisconnectChanged,
    Control(Option<ControlSignal>),
}

/// Drive the consumer until something decides the process's fate, then
/// stop it (final flush included) and return the exit code.
pub async fn supervise(
    mut consumer: Consumer,
    mut control_rx: mpsc::Receiver<ControlSignal>,
) -> i32 {
    let mut disconnected = consumer.disconnected();
    let mut paused = false;

    let code = loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => Event::Interrupt,
            err = consumer.recv_error() => Event::ConsumerError(err),
            changed = disconnected.changed() => match changed {
                Ok(()) => Event::DisconnectChanged,
                Err(_) => Event::DisconnectChanged,
            },
            signal = control_rx.recv() => Event::Control(signal),
        };

        match event {
            Event::Interrupt => {
                debug!("interrupt received, shutting down");
                break EXIT_OK;
            }
            Event::ConsumerError(Some(err)) if err.is_connection_lost() => {
                warn!(error = %err, "upstream needs reconnection");
                break EXIT_DISCONNECTED;
            }
            Event::ConsumerError(Some(err)) => {
                error!(error = %err, "error from consumer");
                break EXIT_ERROR;
            }
            Event::ConsumerError(None) => {
                error!("consumer error channel closed");
                break EXIT_ERROR;
            }
            Event::DisconnectChanged => {
                if *disconnected.borrow() {
                    warn!("upstream server disconnected");
                    break EXIT_DISCONNECTED;
                }
            }
            Event::Control(Some(ControlSignal::Pause)) => {
                if !paused {
                    debug!("pausing");
                    paused = true;
                    consumer.pause().await;
                }
            }
            Event::Control(Some(ControlSignal::Unpause)) => {
                if paused {
                    debug!("unpausing");
                    paused = false;
                    if let Err(err) = consumer.unpause().await {
                        error!(error = %err, "error unpausing");
                        break EXIT_ERROR;
                    }
                }
            }
            Event::Control(Some(ControlSignal::Restart)) => {
                debug!("restarting consumer");
                break EXIT_RESTART;
            }
            Event::Control(Some(ControlSignal::Shutdown)) => {
                debug!("shutting down");
                break EXIT_OK;
            }
            Event::Control(None) => {
                debug!("control channel closed, shutting down");
                break EXIT_OK;
            }
        }
    };

    if let Err(err) = consumer.stop().await {
        error!(error = %err, "error stopping consumer");
    }
    code
}
