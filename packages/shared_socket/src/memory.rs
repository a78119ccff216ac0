//! In-process event server implementing the remote collaborator.
//!
//! `MemoryServer` hands out `MemoryRemote` connections through its
//! `RemoteFactory` impl. It is what the tests and the demo binary talk to,
//! and it keeps enough bookkeeping (listener installs, connect counts,
//! emitted events) to check what the hub did to the "real" connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::options::SocketOptions;
use crate::protocol::Lifecycle;
use crate::remote::{
    AckId, ConnectionState, RemoteConnection, RemoteEvent, RemoteFactory, RemoteSink, SlotId,
};

type Responder = Arc<dyn Fn(&str, &Value) -> Value + Send + Sync>;

#[derive(Clone, Default)]
pub struct MemoryServer {
    inner: Arc<Mutex<ServerState>>,
}

#[derive(Default)]
struct ServerState {
    next_conn: u64,
    next_slot: u64,
    connections: HashMap<u64, Conn>,
    /// Set while the server refuses new connections.
    refusing: Option<String>,
    responder: Option<Responder>,
    connects: usize,
    installs: HashMap<String, usize>,
    removals: HashMap<String, usize>,
    emitted: Vec<(String, Value)>,
}

struct Conn {
    url: String,
    options: SocketOptions,
    state: ConnectionState,
    sink: RemoteSink,
    slots: HashMap<String, Vec<SlotId>>,
    /// Emits issued before the connection came up.
    outbox: Vec<(String, Value, Option<AckId>)>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push `event` to every listener installed on a connected client.
    /// Returns the number of listener deliveries.
    pub fn publish(&self, event: &str, payload: Value) -> usize {
        let state = self.lock();
        let mut delivered = 0;
        for conn in state.connections.values() {
            if conn.state != ConnectionState::Connected {
                continue;
            }
            for slot in conn.slots.get(event).into_iter().flatten() {
                let sent = conn.sink.send(RemoteEvent::Event {
                    slot: *slot,
                    name: event.to_string(),
                    payload: payload.clone(),
                });
                if sent.is_ok() {
                    delivered += 1;
                }
            }
        }
        debug!(event, delivered, "memory server published event");
        delivered
    }

    /// Answer acknowledged emits with `f(event, data)` instead of echoing
    /// `data` back.
    pub fn set_responder<F>(&self, f: F)
    where
        F: Fn(&str, &Value) -> Value + Send + Sync + 'static,
    {
        self.lock().responder = Some(Arc::new(f));
    }

    /// Fail every connection attempt with `connect_error` until
    /// `accept_connections` is called.
    pub fn refuse_connections(&self, reason: &str) {
        self.lock().refusing = Some(reason.to_string());
    }

    pub fn accept_connections(&self) {
        self.lock().refusing = None;
    }

    /// Drop every connected client as if the server went away. Clients
    /// with reconnection enabled retry on their own backoff schedule.
    pub fn drop_connections(&self, reason: &str) {
        let mut retry = Vec::new();
        {
            let mut state = self.lock();
            for (id, conn) in state.connections.iter_mut() {
                if conn.state != ConnectionState::Connected {
                    continue;
                }
                conn.state = ConnectionState::Disconnected;
                let _ = conn.sink.send(RemoteEvent::Lifecycle {
                    signal: Lifecycle::Disconnect,
                    payload: json!(reason),
                });
                if conn.options.reconnection {
                    retry.push((*id, conn.options.clone()));
                }
            }
        }

        info!(reason, reconnecting = retry.len(), "memory server dropped connections");
        if retry.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(clients = retry.len(), "no tokio runtime, dropped clients will not reconnect");
            return;
        };
        for (id, options) in retry {
            let server = self.clone();
            runtime.spawn(async move { server.reconnect(id, options).await });
        }
    }

    async fn reconnect(self, id: u64, options: SocketOptions) {
        let mut attempt: u32 = 0;
        while u64::from(attempt) < options.reconnection_attempts {
            tokio::time::sleep(options.backoff(attempt)).await;
            {
                let mut state = self.lock();
                match state.connections.get(&id) {
                    Some(conn) if conn.state == ConnectionState::Disconnected => {}
                    _ => return,
                }
                if try_connect(&mut state, id) {
                    debug!(conn = id, attempt, "memory client reconnected");
                    return;
                }
            }
            attempt = attempt.saturating_add(1);
        }
    }

    /// Connections that currently exist, connected or not.
    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn connected_count(&self) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|c| c.state == ConnectionState::Connected)
            .count()
    }

    /// Successful connects over the server's lifetime.
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Listener slots installed for `event`, summed over all connections.
    pub fn active_listeners(&self, event: &str) -> usize {
        self.lock()
            .connections
            .values()
            .map(|c| c.slots.get(event).map_or(0, Vec::len))
            .sum()
    }

    pub fn install_count(&self, event: &str) -> usize {
        self.lock().installs.get(event).copied().unwrap_or(0)
    }

    pub fn removal_count(&self, event: &str) -> usize {
        self.lock().removals.get(event).copied().unwrap_or(0)
    }

    /// Every `(event, data)` the server has received, in arrival order.
    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.lock().emitted.clone()
    }

    /// URLs the current connections were opened with.
    pub fn urls(&self) -> Vec<String> {
        self.lock()
            .connections
            .values()
            .map(|c| c.url.clone())
            .collect()
    }
}

fn try_connect(state: &mut ServerState, id: u64) -> bool {
    let refusing = state.refusing.clone();
    let Some(conn) = state.connections.get_mut(&id) else {
        return false;
    };
    if conn.state == ConnectionState::Connected {
        return true;
    }

    if let Some(reason) = refusing {
        conn.state = ConnectionState::Disconnected;
        let _ = conn.sink.send(RemoteEvent::Lifecycle {
            signal: Lifecycle::ConnectError,
            payload: json!({ "message": reason }),
        });
        return false;
    }

    conn.state = ConnectionState::Connected;
    let _ = conn.sink.send(RemoteEvent::Lifecycle {
        signal: Lifecycle::Connect,
        payload: Value::Null,
    });
    let queued: Vec<_> = conn.outbox.drain(..).collect();
    let sink = conn.sink.clone();
    state.connects += 1;

    for (event, data, ack) in queued {
        deliver(state, &sink, event, data, ack);
    }
    true
}

fn deliver(
    state: &mut ServerState,
    sink: &RemoteSink,
    event: String,
    data: Value,
    ack: Option<AckId>,
) {
    if let Some(id) = ack {
        let response = match &state.responder {
            Some(respond) => respond(&event, &data),
            None => data.clone(),
        };
        let _ = sink.send(RemoteEvent::Ack { id, response });
    }
    state.emitted.push((event, data));
}

impl RemoteFactory for MemoryServer {
    fn create(
        &self,
        url: &str,
        options: &SocketOptions,
        sink: RemoteSink,
    ) -> Result<Box<dyn RemoteConnection>, RemoteError> {
        if url.trim().is_empty() {
            return Err(RemoteError::InvalidAddress(url.to_string()));
        }

        let id = {
            let mut state = self.lock();
            let id = state.next_conn;
            state.next_conn += 1;
            state.connections.insert(
                id,
                Conn {
                    url: url.to_string(),
                    options: options.clone(),
                    state: ConnectionState::Disconnected,
                    sink,
                    slots: HashMap::new(),
                    outbox: Vec::new(),
                },
            );
            if options.auto_connect {
                try_connect(&mut state, id);
            }
            id
        };

        debug!(conn = id, url, "memory server accepted client");
        Ok(Box::new(MemoryRemote {
            id,
            server: self.clone(),
        }))
    }
}

/// Client side of a `MemoryServer` connection.
pub struct MemoryRemote {
    id: u64,
    server: MemoryServer,
}

impl RemoteConnection for MemoryRemote {
    fn connect(&mut self) {
        let mut state = self.server.lock();
        if let Some(conn) = state.connections.get_mut(&self.id) {
            if conn.state == ConnectionState::Disconnected {
                conn.state = ConnectionState::Connecting;
            }
        }
        try_connect(&mut state, self.id);
    }

    fn disconnect(&mut self) {
        let mut state = self.server.lock();
        if let Some(conn) = state.connections.get_mut(&self.id) {
            if conn.state == ConnectionState::Connected {
                conn.state = ConnectionState::Disconnected;
                let _ = conn.sink.send(RemoteEvent::Lifecycle {
                    signal: Lifecycle::Disconnect,
                    payload: json!("io client disconnect"),
                });
            }
        }
    }

    fn on(&mut self, event: &str) -> SlotId {
        let mut state = self.server.lock();
        let slot = SlotId(state.next_slot);
        state.next_slot += 1;
        *state.installs.entry(event.to_string()).or_default() += 1;
        if let Some(conn) = state.connections.get_mut(&self.id) {
            conn.slots.entry(event.to_string()).or_default().push(slot);
        }
        slot
    }

    fn off(&mut self, event: &str) {
        let mut state = self.server.lock();
        *state.removals.entry(event.to_string()).or_default() += 1;
        if let Some(conn) = state.connections.get_mut(&self.id) {
            conn.slots.remove(event);
        }
    }

    fn emit(&mut self, event: &str, data: Value, ack: Option<AckId>) {
        let mut state = self.server.lock();
        let Some(conn) = state.connections.get_mut(&self.id) else {
            return;
        };
        if conn.state != ConnectionState::Connected {
            conn.outbox.push((event.to_string(), data, ack));
            return;
        }
        let sink = conn.sink.clone();
        deliver(&mut state, &sink, event.to_string(), data, ack);
    }

    fn state(&self) -> ConnectionState {
        self.server
            .lock()
            .connections
            .get(&self.id)
            .map_or(ConnectionState::Disconnected, |c| c.state)
    }
}

impl Drop for MemoryRemote {
    fn drop(&mut self) {
        self.server.lock().connections.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn connect(server: &MemoryServer) -> (Box<dyn RemoteConnection>, mpsc::UnboundedReceiver<RemoteEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut remote = server
            .create("mem://test", &SocketOptions::default(), tx)
            .unwrap();
        remote.connect();
        (remote, rx)
    }

    #[test]
    fn connect_reports_lifecycle() {
        let server = MemoryServer::new();
        let (remote, mut rx) = connect(&server);
        assert_eq!(remote.state(), ConnectionState::Connected);
        assert_eq!(
            rx.try_recv().unwrap(),
            RemoteEvent::Lifecycle {
                signal: Lifecycle::Connect,
                payload: Value::Null
            }
        );
        assert_eq!(server.connect_count(), 1);
        assert_eq!(server.urls(), vec!["mem://test".to_string()]);
    }

    #[test]
    fn refused_connect_reports_error() {
        let server = MemoryServer::new();
        server.refuse_connections("maintenance");
        let (remote, mut rx) = connect(&server);
        assert_eq!(remote.state(), ConnectionState::Disconnected);
        match rx.try_recv().unwrap() {
            RemoteEvent::Lifecycle { signal, payload } => {
                assert_eq!(signal, Lifecycle::ConnectError);
                assert_eq!(payload["message"], "maintenance");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(server.connect_count(), 0);
    }

    #[test]
    fn publish_reaches_each_installed_slot() {
        let server = MemoryServer::new();
        let (mut remote, mut rx) = connect(&server);
        let _ = rx.try_recv();

        let a = remote.on("news");
        let b = remote.on("news");
        assert_ne!(a, b);
        assert_eq!(server.active_listeners("news"), 2);
        assert_eq!(server.publish("news", json!(1)), 2);
        assert_eq!(server.publish("other", json!(1)), 0);

        remote.off("news");
        assert_eq!(server.active_listeners("news"), 0);
        assert_eq!(server.install_count("news"), 2);
        assert_eq!(server.removal_count("news"), 1);
        assert_eq!(server.publish("news", json!(2)), 0);
    }

    #[test]
    fn emit_answers_ack_with_responder() {
        let server = MemoryServer::new();
        server.set_responder(|event, data| json!({ "event": event, "echo": data }));
        let (mut remote, mut rx) = connect(&server);
        let _ = rx.try_recv();

        remote.emit("save", json!(5), Some(9));
        assert_eq!(
            rx.try_recv().unwrap(),
            RemoteEvent::Ack {
                id: 9,
                response: json!({ "event": "save", "echo": 5 })
            }
        );
        remote.emit("fire", json!("x"), None);
        assert!(rx.try_recv().is_err());
        assert_eq!(server.emitted().len(), 2);
    }

    #[test]
    fn emits_before_connect_are_flushed() {
        let server = MemoryServer::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut remote = server
            .create("mem://test", &SocketOptions::default(), tx)
            .unwrap();
        remote.emit("early", json!(1), Some(0));
        assert!(server.emitted().is_empty());

        remote.connect();
        assert!(matches!(rx.try_recv().unwrap(), RemoteEvent::Lifecycle { .. }));
        assert_eq!(
            rx.try_recv().unwrap(),
            RemoteEvent::Ack {
                id: 0,
                response: json!(1)
            }
        );
        assert_eq!(server.emitted(), vec![("early".to_string(), json!(1))]);
    }

    #[test]
    fn empty_url_is_rejected() {
        let server = MemoryServer::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            server.create("  ", &SocketOptions::default(), tx),
            Err(RemoteError::InvalidAddress(_))
        ));
    }

    #[test]
    fn dropping_remote_closes_connection() {
        let server = MemoryServer::new();
        let (remote, _rx) = connect(&server);
        assert_eq!(server.connection_count(), 1);
        drop(remote);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn drop_connections_outside_a_runtime_only_disconnects() {
        let server = MemoryServer::new();
        let (remote, mut rx) = connect(&server);
        let _ = rx.try_recv();

        server.drop_connections("transport close");
        assert_eq!(
            rx.try_recv().unwrap(),
            RemoteEvent::Lifecycle {
                signal: Lifecycle::Disconnect,
                payload: json!("transport close")
            }
        );
        assert_eq!(remote.state(), ConnectionState::Disconnected);
        assert_eq!(server.connected_count(), 0);
        assert_eq!(server.connect_count(), 1);
    }

    #[tokio::test]
    async fn dropped_connections_reconnect_on_backoff() {
        let server = MemoryServer::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = SocketOptions {
            reconnection_delay: 5,
            reconnection_delay_max: 20,
            ..Default::default()
        };
        let mut remote = server.create("mem://test", &options, tx).unwrap();
        remote.connect();
        let _ = rx.recv().await;

        server.drop_connections("transport close");
        assert!(matches!(
            rx.recv().await,
            Some(RemoteEvent::Lifecycle {
                signal: Lifecycle::Disconnect,
                ..
            })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(RemoteEvent::Lifecycle {
                signal: Lifecycle::Connect,
                ..
            })
        ));
        assert_eq!(remote.state(), ConnectionState::Connected);
        assert_eq!(server.connect_count(), 2);
    }

    #[tokio::test]
    async fn reconnection_disabled_stays_down() {
        let server = MemoryServer::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let options = SocketOptions {
            reconnection: false,
            reconnection_delay: 1,
            ..Default::default()
        };
        let mut remote = server.create("mem://test", &options, tx).unwrap();
        remote.connect();
        let _ = rx.recv().await;

        server.drop_connections("transport close");
        let _ = rx.recv().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(remote.state(), ConnectionState::Disconnected);
        assert_eq!(server.connect_count(), 1);
    }
}
