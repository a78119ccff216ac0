//! The hub: sole owner of the shared remote connection.
//!
//! One task per hub. Every input (endpoint attach/detach, endpoint
//! requests, remote events, diagnostics queries) arrives on a single queue,
//! so the remote connection and the subscription table have exactly one
//! writer and need no locking.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::context::{Port, PortEvent};
use crate::error::ContextError;
use crate::options::SocketOptions;
use crate::protocol::{ClientRequest, Lifecycle, ServerEnvelope};
use crate::remote::{AckId, RemoteConnection, RemoteEvent, RemoteFactory, SlotId};

/// Identifies one attached client proxy.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct EndpointId(Uuid);

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "endpoint-{}", self.0)
    }
}

/// Inputs to the hub task
enum HubInput {
    Attach {
        id: EndpointId,
        outbound: mpsc::UnboundedSender<PortEvent>,
    },
    Request {
        id: EndpointId,
        text: String,
    },
    Detach {
        id: EndpointId,
    },
    Snapshot {
        respond_to: oneshot::Sender<HubSnapshot>,
    },
}

/// Point-in-time view of the hub, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubSnapshot {
    pub endpoints: usize,
    pub connected: bool,
    pub has_remote: bool,
    /// Event names with a listener installed on the remote, sorted.
    pub subscriptions: Vec<String>,
    pub pending_acks: usize,
}

struct Endpoint {
    id: EndpointId,
    outbound: mpsc::UnboundedSender<PortEvent>,
    /// Received the `connect` broadcast for the current connection.
    saw_connect: bool,
}

/// Where a remote acknowledgement has to go.
struct PendingAck {
    endpoint: EndpointId,
    token: String,
    event: String,
}

/// Handle to a running hub.
#[derive(Clone)]
pub struct HubHandle {
    inputs: mpsc::UnboundedSender<HubInput>,
}

impl HubHandle {
    /// Attach a new endpoint and return the client's side of its port.
    pub fn attach(&self) -> Result<Port, ContextError> {
        let id = EndpointId(Uuid::new_v4());
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, mut from_client) = mpsc::unbounded_channel::<String>();

        self.inputs
            .send(HubInput::Attach {
                id,
                outbound: to_client,
            })
            .map_err(|_| ContextError::Construction("hub is not running".into()))?;

        // Tag each request with its endpoint; closing the port detaches it.
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            while let Some(text) = from_client.recv().await {
                if inputs.send(HubInput::Request { id, text }).is_err() {
                    return;
                }
            }
            let _ = inputs.send(HubInput::Detach { id });
        });

        Ok(Port { outbound, inbound })
    }

    pub async fn snapshot(&self) -> Option<HubSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.inputs
            .send(HubInput::Snapshot { respond_to: tx })
            .ok()?;
        rx.await.ok()
    }

    pub fn is_running(&self) -> bool {
        !self.inputs.is_closed()
    }
}

pub struct Hub {
    factory: Arc<dyn RemoteFactory>,
    inputs: mpsc::UnboundedReceiver<HubInput>,
    endpoints: Vec<Endpoint>,
    remote: Option<Box<dyn RemoteConnection>>,
    remote_events: Option<mpsc::UnboundedReceiver<RemoteEvent>>,
    connected: bool,
    /// At most one installed listener per event name.
    subscriptions: HashMap<String, SlotId>,
    pending_acks: HashMap<AckId, PendingAck>,
    next_ack: AckId,
}

impl Hub {
    /// Spawn a hub on the current tokio runtime.
    pub fn spawn(factory: Arc<dyn RemoteFactory>) -> HubHandle {
        let (hub, handle) = Self::new(factory);
        tokio::spawn(hub.run());
        handle
    }

    fn new(factory: Arc<dyn RemoteFactory>) -> (Self, HubHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Hub {
            factory,
            inputs: rx,
            endpoints: Vec::new(),
            remote: None,
            remote_events: None,
            connected: false,
            subscriptions: HashMap::new(),
            pending_acks: HashMap::new(),
            next_ack: 0,
        };
        (hub, HubHandle { inputs: tx })
    }

    async fn run(mut self) {
        info!("hub started");
        loop {
            tokio::select! {
                input = self.inputs.recv() => match input {
                    Some(input) => self.handle_input(input),
                    None => break,
                },
                event = next_remote_event(&mut self.remote_events) => match event {
                    Some(event) => self.handle_remote(event),
                    None => self.remote_events = None,
                },
            }
        }
        info!("hub shutting down");
    }

    fn handle_input(&mut self, input: HubInput) {
        match input {
            HubInput::Attach { id, outbound } => {
                self.endpoints.push(Endpoint {
                    id,
                    outbound,
                    saw_connect: false,
                });
                debug!(endpoint = %id, total = self.endpoints.len(), "client connected to hub");
            }
            HubInput::Request { id, text } => self.handle_request(id, &text),
            HubInput::Detach { id } => self.detach(id),
            HubInput::Snapshot { respond_to } => {
                let mut subscriptions: Vec<String> = self.subscriptions.keys().cloned().collect();
                subscriptions.sort();
                let _ = respond_to.send(HubSnapshot {
                    endpoints: self.endpoints.len(),
                    connected: self.connected,
                    has_remote: self.remote.is_some(),
                    subscriptions,
                    pending_acks: self.pending_acks.len(),
                });
            }
        }
    }

    fn handle_request(&mut self, id: EndpointId, text: &str) {
        let request = match ClientRequest::decode(text) {
            Ok(request) => request,
            Err(e) => {
                warn!(endpoint = %id, code = e.error_code(), error = %e, "dropping unrecognized request");
                return;
            }
        };
        debug!(endpoint = %id, kind = request.kind(), "hub received request");

        match request {
            ClientRequest::Connect { url, options } => self.handle_connect(&url, options),
            ClientRequest::On { event } => self.handle_on(id, event),
            ClientRequest::Emit { event, data, ack } => self.handle_emit(id, event, data, ack),
            ClientRequest::Off { event } => self.handle_off(id, &event),
        }
    }

    fn handle_connect(&mut self, url: &str, options: SocketOptions) {
        if let Some(remote) = &self.remote {
            debug!(url, state = ?remote.state(), "remote connection already exists, ignoring connect");
            return;
        }

        let options = SocketOptions {
            auto_connect: false,
            ..options
        };
        let (sink, events) = mpsc::unbounded_channel();
        match self.factory.create(url, &options, sink) {
            Ok(mut remote) => {
                info!(url, "hub opening remote connection");
                self.remote_events = Some(events);
                remote.connect();
                self.remote = Some(remote);
            }
            Err(e) => {
                error!(url, error = %e, "failed to create remote connection");
                self.broadcast(ServerEnvelope::lifecycle(
                    Lifecycle::ConnectError,
                    json!({ "message": e.to_string() }),
                ));
            }
        }
    }

    fn handle_on(&mut self, id: EndpointId, event: String) {
        match Lifecycle::from_name(&event) {
            Some(Lifecycle::Connect) => {
                // Late joiners missed the broadcast. An endpoint that already
                // got it must not see the same connect twice.
                if self.connected && !self.saw_connect(id) {
                    self.send_to(id, ServerEnvelope::lifecycle(Lifecycle::Connect, Value::Null));
                    if let Some(ep) = self.endpoints.iter_mut().find(|ep| ep.id == id) {
                        ep.saw_connect = true;
                    }
                }
                return;
            }
            // Lifecycle signals are broadcast, never installed on the remote.
            Some(Lifecycle::Disconnect | Lifecycle::ConnectError) => return,
            None => {}
        }

        let Some(remote) = self.remote.as_mut() else {
            warn!(endpoint = %id, event = %event, "subscribe before connect, dropping");
            return;
        };

        // Replace, never stack: one listener per name serves every endpoint.
        remote.off(&event);
        let slot = remote.on(&event);
        if let Some(previous) = self.subscriptions.insert(event.clone(), slot) {
            debug!(event = %event, %previous, %slot, "replaced remote listener");
        } else {
            debug!(event = %event, %slot, "installed remote listener");
        }
    }

    fn handle_emit(&mut self, id: EndpointId, event: String, data: Value, ack: Option<String>) {
        let Some(remote) = self.remote.as_mut() else {
            warn!(endpoint = %id, event = %event, "emit before connect, dropping");
            return;
        };

        let ack_id = ack.map(|token| {
            let ack_id = self.next_ack;
            self.next_ack += 1;
            self.pending_acks.insert(
                ack_id,
                PendingAck {
                    endpoint: id,
                    token,
                    event: event.clone(),
                },
            );
            ack_id
        });
        remote.emit(&event, data, ack_id);
    }

    /// Removes the remote listener for every endpoint, not just `id`.
    fn handle_off(&mut self, id: EndpointId, event: &str) {
        let Some(remote) = self.remote.as_mut() else {
            warn!(endpoint = %id, event, "unsubscribe before connect, dropping");
            return;
        };
        remote.off(event);
        self.subscriptions.remove(event);
        debug!(endpoint = %id, event, "removed remote listener");
    }

    fn handle_remote(&mut self, event: RemoteEvent) {
        match event {
            RemoteEvent::Lifecycle { signal, payload } => {
                self.connected = signal == Lifecycle::Connect;
                info!(%signal, "remote connection lifecycle");
                self.broadcast(ServerEnvelope::lifecycle(signal, payload));
                for ep in &mut self.endpoints {
                    ep.saw_connect = self.connected;
                }
            }
            RemoteEvent::Event {
                slot,
                name,
                payload,
            } => {
                if self.subscriptions.get(&name) != Some(&slot) {
                    debug!(event = %name, %slot, "dropping event from stale listener");
                    return;
                }
                self.broadcast(ServerEnvelope::event(name, payload));
            }
            RemoteEvent::Ack { id, response } => {
                let Some(pending) = self.pending_acks.remove(&id) else {
                    warn!(ack = id, "acknowledgement with no pending request");
                    return;
                };
                self.send_to(
                    pending.endpoint,
                    ServerEnvelope::ack_reply(&pending.token, &pending.event, response),
                );
            }
        }
    }

    fn saw_connect(&self, id: EndpointId) -> bool {
        self.endpoints
            .iter()
            .any(|ep| ep.id == id && ep.saw_connect)
    }

    fn broadcast(&mut self, envelope: ServerEnvelope) {
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                error!(kind = %envelope.kind, error = %e, "failed to encode envelope");
                return;
            }
        };
        let before = self.endpoints.len();
        self.endpoints
            .retain(|ep| ep.outbound.send(PortEvent::Message(text.clone())).is_ok());
        let pruned = before - self.endpoints.len();
        if pruned > 0 {
            debug!(pruned, "pruned closed endpoints during broadcast");
        }
        debug!(kind = %envelope.kind, recipients = self.endpoints.len(), "broadcast");
    }

    fn send_to(&mut self, id: EndpointId, envelope: ServerEnvelope) {
        let Some(index) = self.endpoints.iter().position(|ep| ep.id == id) else {
            warn!(endpoint = %id, kind = %envelope.kind, "endpoint gone, dropping reply");
            return;
        };
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                error!(kind = %envelope.kind, error = %e, "failed to encode envelope");
                return;
            }
        };
        if self.endpoints[index]
            .outbound
            .send(PortEvent::Message(text))
            .is_err()
        {
            self.detach(id);
        }
    }

    fn detach(&mut self, id: EndpointId) {
        self.endpoints.retain(|ep| ep.id != id);
        self.pending_acks.retain(|_, pending| pending.endpoint != id);
        debug!(endpoint = %id, remaining = self.endpoints.len(), "client left hub");
    }
}

async fn next_remote_event(
    events: &mut Option<mpsc::UnboundedReceiver<RemoteEvent>>,
) -> Option<RemoteEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
