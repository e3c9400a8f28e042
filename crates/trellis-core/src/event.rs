//! Bounded stream of lifecycle events from the engine to one consumer.
//!
//! What happens when the consumer falls behind is an explicit
//! [`BackpressurePolicy`] chosen when the stream is created.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::types::StreamEvent;

/// Behaviour of [`EventSender::emit`] when the buffer is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Wait for buffer space. A consumer that never drains stalls the workflow.
    Block,
    /// Never wait: drop the event that does not fit and count it.
    #[default]
    DropNewest,
}

/// Create a stream with `capacity` buffered events.
pub struct EventStream;

impl EventStream {
    pub fn new(capacity: usize, policy: BackpressurePolicy) -> (EventSender, EventReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sender = EventSender {
            tx,
            policy,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sender, EventReceiver { rx })
    }
}

/// Producer half, shared by the engine and every node processor.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<StreamEvent>,
    policy: BackpressurePolicy,
    dropped: Arc<AtomicU64>,
}

impl EventSender {
    /// Push one event according to the stream's policy.
    ///
    /// A closed receiver is not an error; the event is discarded.
    pub async fn emit(&self, event: StreamEvent) {
        match self.policy {
            BackpressurePolicy::Block => {
                let _ = self.tx.send(event).await;
            }
            BackpressurePolicy::DropNewest => match self.tx.try_send(event) {
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        event_type = %event.event_type,
                        dropped_total = total,
                        "Event stream full, dropping event"
                    );
                }
            },
        }
    }

    /// Events dropped so far under [`BackpressurePolicy::DropNewest`].
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl std::fmt::Debug for EventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSender")
            .field("policy", &self.policy)
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// Consumer half.
pub struct EventReceiver {
    rx: mpsc::Receiver<StreamEvent>,
}

impl EventReceiver {
    /// Next event, or `None` once every sender is gone and the buffer is empty.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }

    /// Everything currently buffered.
    pub fn drain(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}
