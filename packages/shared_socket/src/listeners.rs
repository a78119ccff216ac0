//! Per-proxy table of local callbacks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::protocol::ack_token;

pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;
pub type AckCallback = Box<dyn FnOnce(Value) + Send>;

/// Handle returned by `ClientProxy::on`, used to remove that one callback.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct ListenerRegistry {
    next_listener: u64,
    next_ack: u64,
    listeners: HashMap<String, Vec<(ListenerId, Callback)>>,
    /// One-shot acknowledgement callbacks keyed by ack token.
    pending_acks: HashMap<String, AckCallback>,
}

impl ListenerRegistry {
    pub fn add(&mut self, event: &str, callback: Callback) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    /// Remove one callback, or every callback for `event` when `id` is
    /// `None`. Returns how many were removed.
    pub fn remove(&mut self, event: &str, id: Option<ListenerId>) -> usize {
        let Some(list) = self.listeners.get_mut(event) else {
            return 0;
        };
        let before = list.len();
        match id {
            Some(id) => list.retain(|(existing, _)| *existing != id),
            None => list.clear(),
        }
        let removed = before - list.len();
        if list.is_empty() {
            self.listeners.remove(event);
        }
        removed
    }

    pub fn callbacks(&self, event: &str) -> Vec<Callback> {
        self.listeners
            .get(event)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, event: &str) -> usize {
        self.listeners.get(event).map_or(0, Vec::len)
    }

    /// Allocate a fresh ack id and park `callback` under its token.
    pub fn add_ack(&mut self, callback: AckCallback) -> (u64, String) {
        let id = self.next_ack;
        self.next_ack += 1;
        let token = ack_token(id);
        self.pending_acks.insert(token.clone(), callback);
        (id, token)
    }

    pub fn take_ack(&mut self, token: &str) -> Option<AckCallback> {
        self.pending_acks.remove(token)
    }

    pub fn pending_acks(&self) -> usize {
        self.pending_acks.len()
    }
}

/// A registry shared between a proxy and its pump task.
pub type SharedRegistry = Arc<Mutex<ListenerRegistry>>;

pub fn lock(registry: &SharedRegistry) -> MutexGuard<'_, ListenerRegistry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Invoke every callback registered for `event`. The lock is released
/// before any callback runs, so callbacks may register or remove listeners.
pub fn dispatch(registry: &SharedRegistry, event: &str, payload: &Value) -> usize {
    let callbacks = lock(registry).callbacks(event);
    for callback in &callbacks {
        callback(payload);
    }
    callbacks.len()
}

/// Fire and forget the ack callback for `token`. Returns false when no
/// callback was waiting (already fired, or never registered here).
pub fn resolve_ack(registry: &SharedRegistry, token: &str, response: Value) -> bool {
    let callback = lock(registry).take_ack(token);
    match callback {
        Some(callback) => {
            callback(response);
            true
        }
        None => false,
    }
}
