use serde::{Deserialize, Serialize};

pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_DEDUP_CAPACITY_PER_GROUP: usize = 1000;
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Reconnection attempts the provider makes before giving up.
    pub reconnect_attempts: u32,
    /// Recently dispatched message ids remembered per group.
    pub dedup_capacity_per_group: usize,
    /// Capacity of broadcast channels (group events, loopback sources).
    pub event_buffer: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            dedup_capacity_per_group: DEFAULT_DEDUP_CAPACITY_PER_GROUP,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl ChatConfig {
    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect_attempts = attempts;
        self
    }

    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity_per_group = capacity;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    /// Clamps zero capacities, which tokio broadcast channels reject.
    pub(crate) fn normalized(mut self) -> Self {
        self.dedup_capacity_per_group = self.dedup_capacity_per_group.max(1);
        self.event_buffer = self.event_buffer.max(1);
        self
    }
}
