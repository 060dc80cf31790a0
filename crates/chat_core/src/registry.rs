//! Per-group message listeners and global connection listeners.
//!
//! The registry lock only guards the listener lists. Callbacks always run
//! outside it, against a snapshot, so subscribers may register or unsubscribe
//! from inside a callback. Each listener owns a delivery gate: once
//! [`Subscription::unsubscribe`] returns, that listener is never invoked again,
//! even by a dispatch that snapshotted it earlier.
//!
//! Called from outside any listener, unsubscribe also waits for an invocation
//! already running on another thread to finish. Called from inside a listener
//! callback, it only stops future invocations: waiting there could deadlock
//! against another thread whose listener is unsubscribing this one.

use std::{
    any::Any,
    cell::RefCell,
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use anyhow::Result;
use shared::domain::{ConnectionEventKind, GroupId};
use tracing::{debug, error};

use crate::{lock, message::ChatMessage};

pub type MessageCallback = dyn Fn(&ChatMessage) -> Result<()> + Send + Sync;
pub type ConnectionCallback = dyn Fn(ConnectionEventKind) -> Result<()> + Send + Sync;

thread_local! {
    static INVOKING: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

fn inside_any_delivery() -> bool {
    INVOKING.with(|stack| !stack.borrow().is_empty())
}

struct DeliveryGate {
    id: u64,
    active: AtomicBool,
    delivery: Mutex<()>,
}

impl DeliveryGate {
    fn new(id: u64) -> Self {
        Self {
            id,
            active: AtomicBool::new(true),
            delivery: Mutex::new(()),
        }
    }

    fn invoking_on_this_thread(&self) -> bool {
        INVOKING.with(|stack| stack.borrow().contains(&self.id))
    }

    fn deliver(&self, call: impl FnOnce() -> Result<(), String>) -> Option<Result<(), String>> {
        if self.invoking_on_this_thread() {
            // Re-entrant delivery: this thread already holds the gate.
            return self.active.load(Ordering::Acquire).then(call);
        }

        let _guard = lock(&self.delivery);
        if !self.active.load(Ordering::Acquire) {
            return None;
        }
        INVOKING.with(|stack| stack.borrow_mut().push(self.id));
        let result = call();
        INVOKING.with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(position) = stack.iter().rposition(|id| *id == self.id) {
                stack.remove(position);
            }
        });
        Some(result)
    }

    /// Deactivates the gate. Unless this thread is itself inside a delivery,
    /// also waits out any in-flight delivery on another thread. Returns
    /// whether the gate was still active.
    fn close(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::AcqRel);
        if !inside_any_delivery() {
            drop(lock(&self.delivery));
        }
        was_active
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

pub(crate) struct MessageListener {
    gate: Arc<DeliveryGate>,
    callback: Box<MessageCallback>,
}

impl MessageListener {
    /// `None` when the listener was removed before it could run.
    pub(crate) fn deliver(&self, message: &ChatMessage) -> Option<Result<(), String>> {
        self.gate
            .deliver(|| run_isolated(|| (self.callback)(message)))
    }
}

struct ConnectionListener {
    gate: Arc<DeliveryGate>,
    callback: Box<ConnectionCallback>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ListenerKey {
    Message(GroupId),
    Connection(ConnectionEventKind),
}

/// Handle returned by every subscribe call.
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::unsubscribe`] (any number of times) to remove it.
#[must_use = "dropping a Subscription does not remove the listener"]
pub struct Subscription {
    registry: Weak<ListenerRegistry>,
    key: ListenerKey,
    gate: Arc<DeliveryGate>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.gate.close() {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key, self.gate.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_active()
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.gate.id)
            .field("active", &self.gate.is_active())
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    messages: HashMap<GroupId, Vec<Arc<MessageListener>>>,
    connection: HashMap<ConnectionEventKind, Vec<Arc<ConnectionListener>>>,
}

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    state: Mutex<RegistryState>,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_gate(&self) -> Arc<DeliveryGate> {
        Arc::new(DeliveryGate::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
        ))
    }

    pub fn add_message_listener(
        self: &Arc<Self>,
        group_id: GroupId,
        callback: Box<MessageCallback>,
    ) -> Subscription {
        let gate = self.next_gate();
        lock(&self.state)
            .messages
            .entry(group_id.clone())
            .or_default()
            .push(Arc::new(MessageListener {
                gate: Arc::clone(&gate),
                callback,
            }));
        debug!(group_id = %group_id, listener_id = gate.id, "chat: message listener added");
        Subscription {
            registry: Arc::downgrade(self),
            key: ListenerKey::Message(group_id),
            gate,
        }
    }

    pub fn add_connection_listener(
        self: &Arc<Self>,
        kind: ConnectionEventKind,
        callback: Box<ConnectionCallback>,
    ) -> Subscription {
        let gate = self.next_gate();
        lock(&self.state)
            .connection
            .entry(kind)
            .or_default()
            .push(Arc::new(ConnectionListener {
                gate: Arc::clone(&gate),
                callback,
            }));
        Subscription {
            registry: Arc::downgrade(self),
            key: ListenerKey::Connection(kind),
            gate,
        }
    }

    fn remove(&self, key: &ListenerKey, id: u64) {
        let mut state = lock(&self.state);
        match key {
            ListenerKey::Message(group_id) => {
                if let Some(listeners) = state.messages.get_mut(group_id) {
                    listeners.retain(|listener| listener.gate.id != id);
                    if listeners.is_empty() {
                        state.messages.remove(group_id);
                    }
                }
            }
            ListenerKey::Connection(kind) => {
                if let Some(listeners) = state.connection.get_mut(kind) {
                    listeners.retain(|listener| listener.gate.id != id);
                    if listeners.is_empty() {
                        state.connection.remove(kind);
                    }
                }
            }
        }
    }

    /// Removes every message listener for `group_id`. Returns how many were
    /// removed.
    pub fn remove_all_for_group(&self, group_id: &GroupId) -> usize {
        let removed = lock(&self.state).messages.remove(group_id).unwrap_or_default();
        for listener in &removed {
            listener.gate.close();
        }
        removed.len()
    }

    /// Removes all message and connection listeners.
    pub fn clear(&self) -> usize {
        let (messages, connection) = {
            let mut state = lock(&self.state);
            (
                std::mem::take(&mut state.messages),
                std::mem::take(&mut state.connection),
            )
        };
        let mut removed = 0;
        for listener in messages.values().flatten() {
            listener.gate.close();
            removed += 1;
        }
        for listener in connection.values().flatten() {
            listener.gate.close();
            removed += 1;
        }
        removed
    }

    /// Snapshot of a group's listeners in registration order.
    pub(crate) fn message_listeners(&self, group_id: &GroupId) -> Vec<Arc<MessageListener>> {
        lock(&self.state)
            .messages
            .get(group_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Invokes every connection listener for `kind`. Returns the number of
    /// listeners that failed.
    pub fn notify_connection(&self, kind: ConnectionEventKind) -> usize {
        let listeners = lock(&self.state)
            .connection
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut failures = 0;
        for listener in listeners {
            if let Some(Err(reason)) = listener
                .gate
                .deliver(|| run_isolated(|| (listener.callback)(kind)))
            {
                failures += 1;
                error!(?kind, listener_id = listener.gate.id, "chat: connection listener failed: {reason}");
            }
        }
        failures
    }

    pub fn message_listener_count(&self, group_id: &GroupId) -> usize {
        lock(&self.state)
            .messages
            .get(group_id)
            .map_or(0, Vec::len)
    }

    pub fn connection_listener_count(&self, kind: ConnectionEventKind) -> usize {
        lock(&self.state)
            .connection
            .get(&kind)
            .map_or(0, Vec::len)
    }

    pub fn total_listener_count(&self) -> usize {
        let state = lock(&self.state);
        state.messages.values().map(Vec::len).sum::<usize>()
            + state.connection.values().map(Vec::len).sum::<usize>()
    }
}

fn run_isolated(call: impl FnOnce() -> Result<()>) -> Result<(), String> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(payload) => Err(panic_reason(payload.as_ref())),
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    if let Some(reason) = payload.downcast_ref::<&str>() {
        format!("listener panicked: {reason}")
    } else if let Some(reason) = payload.downcast_ref::<String>() {
        format!("listener panicked: {reason}")
    } else {
        "listener panicked".to_string()
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
