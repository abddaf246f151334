//! Per-connection capture queue
//!
//! Deliveries arrive on the transport's reader task while assertions run on the
//! scenario runner. The queue decouples the two: pushes never block and are
//! buffered in delivery order until the runner pops them with a bounded wait.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use crate::error::CaptureError;

/// One inbound (event name, payload) pair as delivered by the relay
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedEvent {
    pub event: String,
    pub payload: Value,
}

impl CapturedEvent {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

impl fmt::Display for CapturedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.event, self.payload)
    }
}

/// Producer half, handed to delivery callbacks
#[derive(Debug, Clone)]
pub struct CaptureSink {
    tx: mpsc::UnboundedSender<CapturedEvent>,
}

impl CaptureSink {
    /// Buffer an event; never blocks. Events pushed after the queue is gone are discarded.
    pub fn push(&self, event: CapturedEvent) {
        if let Err(mpsc::error::SendError(event)) = self.tx.send(event) {
            debug!("Capture queue gone, discarding '{}'", event.event);
        }
    }
}

/// Consumer half, owned by the role connection
#[derive(Debug)]
pub struct CaptureQueue {
    rx: mpsc::UnboundedReceiver<CapturedEvent>,
}

impl CaptureQueue {
    /// Create a queue and its first producer handle. Clone the sink for more producers;
    /// once every sink is dropped and the buffer is empty, `pop` reports `Closed`.
    pub fn channel() -> (CaptureSink, CaptureQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CaptureSink { tx }, CaptureQueue { rx })
    }

    /// Wait up to `budget` for the next event in delivery order
    pub async fn pop(&mut self, budget: Duration) -> Result<CapturedEvent, CaptureError> {
        match timeout(budget, self.rx.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => Err(CaptureError::Closed),
            Err(_) => Err(CaptureError::Timeout { budget }),
        }
    }

    /// Take every buffered event without waiting
    pub fn drain(&mut self) -> Vec<CapturedEvent> {
        let mut pending = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            pending.push(event);
        }
        pending
    }
}
