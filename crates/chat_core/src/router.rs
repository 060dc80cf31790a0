use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use shared::domain::{GroupId, MessageId};
use tracing::{debug, error};

use crate::{error::ChatError, lock, message::ChatMessage, registry::ListenerRegistry};

#[derive(Default)]
struct GroupWindow {
    order: VecDeque<MessageId>,
    seen: HashSet<MessageId>,
}

/// Bounded memory of `(group, message id)` pairs already dispatched. Each
/// group keeps its own window; the oldest id is evicted once a window is
/// full.
pub(crate) struct DedupCache {
    capacity_per_group: usize,
    groups: HashMap<GroupId, GroupWindow>,
}

impl DedupCache {
    pub(crate) fn new(capacity_per_group: usize) -> Self {
        Self {
            capacity_per_group: capacity_per_group.max(1),
            groups: HashMap::new(),
        }
    }

    /// Records the pair. Returns false when it was already present.
    pub(crate) fn insert(&mut self, group_id: &GroupId, message_id: &MessageId) -> bool {
        let window = self.groups.entry(group_id.clone()).or_default();
        if !window.seen.insert(message_id.clone()) {
            return false;
        }
        window.order.push_back(message_id.clone());
        while window.order.len() > self.capacity_per_group {
            if let Some(evicted) = window.order.pop_front() {
                window.seen.remove(&evicted);
            }
        }
        true
    }

    pub(crate) fn contains(&self, group_id: &GroupId, message_id: &MessageId) -> bool {
        self.groups
            .get(group_id)
            .is_some_and(|window| window.seen.contains(message_id))
    }

    pub(crate) fn len(&self) -> usize {
        self.groups.values().map(|window| window.order.len()).sum()
    }

    pub(crate) fn clear(&mut self) {
        self.groups.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Already dispatched while still in the dedup window.
    Duplicate,
    Delivered {
        listeners: usize,
        failures: Vec<ChatError>,
    },
}

impl DispatchOutcome {
    pub fn delivered_to(&self) -> usize {
        match self {
            Self::Duplicate => 0,
            Self::Delivered { listeners, .. } => *listeners,
        }
    }
}

pub struct MessageRouter {
    registry: Arc<ListenerRegistry>,
    dedup: Mutex<DedupCache>,
}

impl MessageRouter {
    pub fn new(registry: Arc<ListenerRegistry>, capacity_per_group: usize) -> Self {
        Self {
            registry,
            dedup: Mutex::new(DedupCache::new(capacity_per_group)),
        }
    }

    pub fn dispatch(&self, message: &ChatMessage) -> DispatchOutcome {
        if let Some(message_id) = message.dedup_key() {
            if !lock(&self.dedup).insert(&message.group_id, message_id) {
                debug!(
                    group_id = %message.group_id,
                    message_id = %message_id,
                    "chat: dropping duplicate message"
                );
                return DispatchOutcome::Duplicate;
            }
        }

        let mut listeners = 0;
        let mut failures = Vec::new();
        for listener in self.registry.message_listeners(&message.group_id) {
            match listener.deliver(message) {
                None => {}
                Some(Ok(())) => listeners += 1,
                Some(Err(reason)) => {
                    listeners += 1;
                    let err = ChatError::Listener {
                        group_id: message.group_id.clone(),
                        message_id: message
                            .message_id
                            .as_ref()
                            .map(ToString::to_string)
                            .unwrap_or_default(),
                        reason,
                    };
                    error!(group_id = %message.group_id, "chat: {err}");
                    failures.push(err);
                }
            }
        }

        debug!(
            group_id = %message.group_id,
            listeners,
            failures = failures.len(),
            "chat: message dispatched"
        );
        DispatchOutcome::Delivered {
            listeners,
            failures,
        }
    }

    pub fn is_cached(&self, group_id: &GroupId, message_id: &MessageId) -> bool {
        lock(&self.dedup).contains(group_id, message_id)
    }

    pub fn cached_len(&self) -> usize {
        lock(&self.dedup).len()
    }

    pub fn clear_cache(&self) {
        lock(&self.dedup).clear();
    }
}

#[cfg(test)]
#[path = "tests/router_tests.rs"]
mod tests;
