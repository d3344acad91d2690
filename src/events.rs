//! Cache lifecycle notifications
//!
//! Availability and memory-pressure changes are published on a broadcast
//! channel; any component can subscribe without knowing who publishes.

use tokio::sync::broadcast;

use crate::config::EvictionPolicy;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// The remote tier became usable or unusable
    AvailabilityChanged { available: bool },
    /// Reconnection stopped after this many attempts
    ReconnectAbandoned { attempts: u32 },
    MemoryWarning { usage_pct: f64 },
    MemoryCritical { usage_pct: f64 },
    /// An eviction pass finished
    Evicted { policy: EvictionPolicy, keys: usize },
}

/// Publishing half shared by the remote client and the governor
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publish to current subscribers; having none is not an error
    pub fn emit(&self, event: CacheEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
