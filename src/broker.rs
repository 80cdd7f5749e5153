use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

use crate::protocol::ProcessEvent;

pub const BROADCAST_CAPACITY: usize = 1024;

/// Capacity for the dedicated event-log channel. Output events are pipe
/// reads of at most a few KiB, so this bounds the log backlog to a few MiB.
const LOG_CHANNEL_CAPACITY: usize = 4096;

/// Fan-out of process events from the supervisor.
///
/// Live watchers (spawn streams) subscribe to the broadcast side and may lag.
/// The drone's event log takes the single lossless channel.
#[derive(Clone)]
pub struct Broker {
    tx: broadcast::Sender<ProcessEvent>,
    log_tx: mpsc::Sender<ProcessEvent>,
    log_rx: Arc<Mutex<Option<mpsc::Receiver<ProcessEvent>>>>,
}

impl Broker {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (log_tx, log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        Self {
            tx,
            log_tx,
            log_rx: Arc::new(Mutex::new(Some(log_rx))),
        }
    }

    pub fn publish(&self, event: ProcessEvent) {
        if self.log_rx.lock().is_none() {
            match self.log_tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!("event log channel full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!("event log channel closed");
                }
            }
        }
        // Ignore error - means no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.tx.subscribe()
    }

    /// Take the lossless event-log channel. Only the first caller gets it;
    /// events are not queued for the log until it has been taken.
    pub fn take_log(&self) -> Option<mpsc::Receiver<ProcessEvent>> {
        self.log_rx.lock().take()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
