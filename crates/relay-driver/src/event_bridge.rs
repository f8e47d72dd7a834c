//! Event bridge between transport callbacks and the polled driver API
//!
//! Callbacks enqueue, the host application pops once per tick. The queue is
//! strictly FIFO and unbounded. It sits behind a mutex so a transport that
//! delivers callbacks from another thread can still enqueue safely.

use relay_core::NetworkEvent;
use relay_core::sync::lock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Cloneable handle onto one FIFO event queue
#[derive(Clone, Default)]
pub struct EventBridge {
    queue: Arc<Mutex<VecDeque<NetworkEvent>>>,
}

impl EventBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event
    pub fn enqueue(&self, event: NetworkEvent) {
        trace!("Enqueue {:?} from {}", event.kind(), event.connection());
        lock(&self.queue).push_back(event);
    }

    /// Take the oldest event, if any. Never blocks.
    pub fn pop_event(&self) -> Option<NetworkEvent> {
        lock(&self.queue).pop_front()
    }

    /// Number of queued events
    pub fn len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.queue).is_empty()
    }
}
