//! Client proxy: the per-consumer face of the shared connection.
//!
//! `on`, `emit` and `off` behave the same whether the proxy ended up
//! attached to a hub (shared mode) or holding its own remote connection
//! (direct mode). The first call to any of them starts the proxy; the mode
//! is decided once and never changes afterwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::context::{DEFAULT_LOCATOR, PortEvent, SharedContext, UnavailableContext};
use crate::error::{ConfigError, ContextError, ProxyError};
use crate::listeners::{ListenerId, SharedRegistry, dispatch, lock, resolve_ack};
use crate::options::SocketOptions;
use crate::protocol::{ClientRequest, ERROR_EVENT, Lifecycle, ServerEnvelope, ack_token};
use crate::remote::{RemoteConnection, RemoteEvent, RemoteFactory, SlotId};

/// Which path a proxy's traffic takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    NotStarted,
    /// Multiplexed through a hub.
    Shared,
    /// Talking to the remote without a hub.
    Direct,
}

enum Link {
    NotStarted,
    Shared {
        outbound: mpsc::UnboundedSender<String>,
    },
    Direct(DirectLink),
}

struct DirectLink {
    /// `None` when the remote could not even be created.
    remote: Option<Box<dyn RemoteConnection>>,
    /// One remote listener per name, like the hub keeps.
    slots: HashMap<String, SlotId>,
}

pub struct ProxyBuilder {
    url: String,
    options: SocketOptions,
    remote: Arc<dyn RemoteFactory>,
    context: Option<Arc<dyn SharedContext>>,
    locator: Option<String>,
}

impl ProxyBuilder {
    pub fn options(mut self, options: SocketOptions) -> Self {
        self.options = options;
        self
    }

    /// Merge caller overrides over the current options, key by key.
    pub fn overrides(mut self, overrides: &Map<String, Value>) -> Result<Self, ConfigError> {
        self.options = self.options.merged(overrides)?;
        Ok(self)
    }

    /// Which shared-context mechanism to try. Without one the proxy always
    /// goes direct.
    pub fn context(mut self, context: Arc<dyn SharedContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Override the hub's resource locator.
    pub fn locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }

    pub fn build(self) -> ClientProxy {
        ClientProxy {
            url: self.url,
            options: self.options,
            remote: self.remote,
            context: self.context.unwrap_or_else(|| {
                Arc::new(UnavailableContext::new("no shared context configured"))
            }),
            locator: self.locator.unwrap_or_else(|| DEFAULT_LOCATOR.to_string()),
            link: Mutex::new(Link::NotStarted),
            registry: SharedRegistry::default(),
            pump: Mutex::new(None),
        }
    }
}

pub struct ClientProxy {
    url: String,
    options: SocketOptions,
    remote: Arc<dyn RemoteFactory>,
    context: Arc<dyn SharedContext>,
    locator: String,
    link: Mutex<Link>,
    registry: SharedRegistry,
    /// Task that turns inbound traffic into local callbacks.
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ClientProxy {
    pub fn builder(url: impl Into<String>, remote: Arc<dyn RemoteFactory>) -> ProxyBuilder {
        ProxyBuilder {
            url: url.into(),
            options: SocketOptions::default(),
            remote,
            context: None,
            locator: None,
        }
    }

    /// Build a proxy from loaded configuration. Option overrides are merged
    /// over the defaults here, so a bad override fails before anything starts.
    pub fn from_config(
        config: &ProxyConfig,
        remote: Arc<dyn RemoteFactory>,
        context: Arc<dyn SharedContext>,
    ) -> Result<Self, ConfigError> {
        let options = config.socket_options()?;
        let mut builder = Self::builder(config.url.clone(), remote)
            .options(options)
            .context(context);
        if let Some(locator) = &config.locator {
            builder = builder.locator(locator.clone());
        }
        Ok(builder.build())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn options(&self) -> &SocketOptions {
        &self.options
    }

    pub fn mode(&self) -> ProxyMode {
        match *self.lock_link() {
            Link::NotStarted => ProxyMode::NotStarted,
            Link::Shared { .. } => ProxyMode::Shared,
            Link::Direct(_) => ProxyMode::Direct,
        }
    }

    /// Start the proxy if it has not started yet.
    ///
    /// Tries the shared context first. Any failure there falls back to a
    /// direct connection with the same url and options; callers never see
    /// the difference. Must run inside a tokio runtime.
    pub fn start(&self) {
        let mut link = self.lock_link();
        if !matches!(*link, Link::NotStarted) {
            return;
        }

        debug!(url = %self.url, locator = %self.locator, "attempting to start shared context");
        *link = match self.start_shared() {
            Ok(shared) => {
                info!(url = %self.url, "proxy attached to shared hub");
                shared
            }
            Err(e) => {
                info!(url = %self.url, error = %e, "shared context unavailable, connecting directly");
                self.start_direct()
            }
        };
    }

    fn start_shared(&self) -> Result<Link, ContextError> {
        let port = self.context.open(&self.locator, &self.url)?;

        let connect = ClientRequest::Connect {
            url: self.url.clone(),
            options: self.options.clone(),
        }
        .encode()
        .map_err(|e| ContextError::Construction(e.to_string()))?;
        port.outbound
            .send(connect)
            .map_err(|_| ContextError::Construction("hub closed the port".into()))?;

        self.set_pump(pump_port(port.inbound, self.registry.clone()));
        Ok(Link::Shared {
            outbound: port.outbound,
        })
    }

    fn start_direct(&self) -> Link {
        let (sink, events) = mpsc::unbounded_channel();
        let remote = match self.remote.create(&self.url, &self.options, sink.clone()) {
            Ok(mut remote) => {
                remote.connect();
                Some(remote)
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "failed to create direct connection");
                let _ = sink.send(RemoteEvent::Lifecycle {
                    signal: Lifecycle::ConnectError,
                    payload: json!({ "message": e.to_string() }),
                });
                None
            }
        };
        drop(sink);

        self.set_pump(pump_remote(events, self.registry.clone()));
        Link::Direct(DirectLink {
            remote,
            slots: HashMap::new(),
        })
    }

    fn set_pump<F>(&self, pump: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(pump);
                *self.pump.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Err(_) => error!(url = %self.url, "no tokio runtime, inbound events will not be delivered"),
        }
    }

    /// Emit `event` and call `callback` once with the server's
    /// acknowledgement.
    pub fn emit<F>(&self, event: &str, data: Value, callback: F)
    where
        F: FnOnce(Value) + Send + 'static,
    {
        // Registered before start: in direct mode the pump may deliver the
        // reply as soon as the connection exists.
        let (ack_id, token) = lock(&self.registry).add_ack(Box::new(callback));
        self.start();
        debug!(event, ack = %token, "io emit");

        let mut link = self.lock_link();
        let delivered = match &mut *link {
            Link::Shared { outbound } => send_request(
                outbound,
                ClientRequest::Emit {
                    event: event.to_string(),
                    data,
                    ack: Some(token.clone()),
                },
            ),
            Link::Direct(direct) => match direct.remote.as_mut() {
                Some(remote) => {
                    remote.emit(event, data, Some(ack_id));
                    true
                }
                None => false,
            },
            Link::NotStarted => false,
        };

        if !delivered {
            warn!(event, "emit not delivered, dropping acknowledgement");
            lock(&self.registry).take_ack(&token);
        }
    }

    /// Emit without asking for an acknowledgement.
    pub fn emit_without_ack(&self, event: &str, data: Value) {
        self.start();
        debug!(event, "io emit (no ack)");
        let mut link = self.lock_link();
        match &mut *link {
            Link::Shared { outbound } => {
                send_request(
                    outbound,
                    ClientRequest::Emit {
                        event: event.to_string(),
                        data,
                        ack: None,
                    },
                );
            }
            Link::Direct(direct) => {
                if let Some(remote) = direct.remote.as_mut() {
                    remote.emit(event, data, None);
                }
            }
            Link::NotStarted => {}
        }
    }

    /// Emit and wait for the acknowledgement.
    pub async fn request<T: Serialize>(&self, event: &str, data: &T) -> Result<Value, ProxyError> {
        let data = serde_json::to_value(data)?;
        let (tx, rx) = oneshot::channel();
        self.emit(event, data, move |response| {
            let _ = tx.send(response);
        });
        rx.await.map_err(|_| ProxyError::AckDropped)
    }

    /// Call `callback` for every later occurrence of `event`, including the
    /// `connect`, `disconnect` and `connect_error` lifecycle signals.
    pub fn on<F>(&self, event: &str, callback: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        // Registered before start so an immediate `connect` is not missed.
        let id = lock(&self.registry).add(event, Arc::new(callback));
        self.start();
        debug!(event, "io on");

        let mut link = self.lock_link();
        match &mut *link {
            Link::Shared { outbound } => {
                send_request(
                    outbound,
                    ClientRequest::On {
                        event: event.to_string(),
                    },
                );
            }
            Link::Direct(direct) => {
                if Lifecycle::from_name(event).is_none() && !direct.slots.contains_key(event) {
                    if let Some(remote) = direct.remote.as_mut() {
                        let slot = remote.on(event);
                        direct.slots.insert(event.to_string(), slot);
                    }
                }
            }
            Link::NotStarted => {}
        }
        id
    }

    /// Stop listening for `event`: one callback, or all of them with `None`.
    ///
    /// The remote listener is dropped unconditionally. In shared mode that
    /// silences `event` for every proxy on the same hub, even ones that
    /// still have callbacks registered.
    pub fn off(&self, event: &str, listener: Option<ListenerId>) {
        debug!(event, "io off");
        {
            let mut link = self.lock_link();
            match &mut *link {
                Link::Shared { outbound } => {
                    send_request(
                        outbound,
                        ClientRequest::Off {
                            event: event.to_string(),
                        },
                    );
                }
                Link::Direct(direct) => {
                    if direct.slots.remove(event).is_some() {
                        if let Some(remote) = direct.remote.as_mut() {
                            remote.off(event);
                        }
                    }
                }
                Link::NotStarted => {}
            }
        }
        lock(&self.registry).remove(event, listener);
    }

    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.registry).count(event)
    }

    pub fn pending_acks(&self) -> usize {
        lock(&self.registry).pending_acks()
    }

    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ClientProxy {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take() {
            pump.abort();
        }
    }
}

fn send_request(outbound: &mpsc::UnboundedSender<String>, request: ClientRequest) -> bool {
    let text = match request.encode() {
        Ok(text) => text,
        Err(e) => {
            error!(kind = request.kind(), error = %e, "failed to encode request");
            return false;
        }
    };
    if outbound.send(text).is_err() {
        warn!(kind = request.kind(), "hub port closed, request dropped");
        return false;
    }
    true
}

/// Shared mode: decode hub envelopes into local callbacks.
async fn pump_port(mut inbound: mpsc::UnboundedReceiver<PortEvent>, registry: SharedRegistry) {
    while let Some(event) = inbound.recv().await {
        match event {
            PortEvent::Message(text) => match ServerEnvelope::decode(&text) {
                Ok(envelope) => deliver_envelope(&registry, envelope),
                Err(e) => {
                    warn!(error = %e, "undecodable message from hub");
                    dispatch(&registry, ERROR_EVENT, &json!({ "message": e.to_string() }));
                }
            },
            PortEvent::Error(message) => {
                warn!(error = %message, "hub port error");
                dispatch(&registry, ERROR_EVENT, &json!({ "message": message }));
            }
        }
    }
    debug!("hub port closed");
}

fn deliver_envelope(registry: &SharedRegistry, envelope: ServerEnvelope) {
    match envelope.ack {
        Some(token) => {
            if !resolve_ack(registry, &token, envelope.message) {
                debug!(ack = %token, "acknowledgement with no waiting callback");
            }
        }
        None => {
            dispatch(registry, &envelope.kind, &envelope.message);
        }
    }
}

/// Direct mode: remote events straight into local callbacks.
async fn pump_remote(mut events: mpsc::UnboundedReceiver<RemoteEvent>, registry: SharedRegistry) {
    while let Some(event) = events.recv().await {
        match event {
            RemoteEvent::Lifecycle { signal, payload } => {
                dispatch(&registry, signal.as_str(), &payload);
            }
            RemoteEvent::Event { name, payload, .. } => {
                dispatch(&registry, &name, &payload);
            }
            RemoteEvent::Ack { id, response } => {
                resolve_ack(&registry, &ack_token(id), response);
            }
        }
    }
    debug!("direct connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryServer;
    use std::time::Duration;

    /// Hands the hub side of every opened port to the test.
    #[derive(Default)]
    struct ScriptedContext {
        opened: Mutex<Vec<(mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<PortEvent>)>>,
    }

    impl SharedContext for ScriptedContext {
        fn open(&self, _locator: &str, _name: &str) -> Result<crate::context::Port, ContextError> {
            let (outbound, from_client) = mpsc::unbounded_channel();
            let (to_client, inbound) = mpsc::unbounded_channel();
            self.opened.lock().unwrap().push((from_client, to_client));
            Ok(crate::context::Port { outbound, inbound })
        }
    }

    impl ScriptedContext {
        fn take(&self) -> (mpsc::UnboundedReceiver<String>, mpsc::UnboundedSender<PortEvent>) {
            self.opened.lock().unwrap().remove(0)
        }
    }

    fn collector() -> (
        mpsc::UnboundedSender<Value>,
        mpsc::UnboundedReceiver<Value>,
    ) {
        mpsc::unbounded_channel()
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn start_is_idempotent_and_one_way() {
        let ctx = Arc::new(ScriptedContext::default());
        let proxy = ClientProxy::builder("mem://x", Arc::new(MemoryServer::new()))
            .context(ctx.clone())
            .build();
        assert_eq!(proxy.mode(), ProxyMode::NotStarted);

        proxy.start();
        proxy.start();
        assert_eq!(proxy.mode(), ProxyMode::Shared);
        assert_eq!(ctx.opened.lock().unwrap().len(), 1);

        let (mut requests, _events) = ctx.take();
        let first = ClientRequest::decode(&requests.recv().await.unwrap()).unwrap();
        assert!(matches!(first, ClientRequest::Connect { ref url, .. } if url == "mem://x"));
    }

    #[tokio::test]
    async fn operations_translate_to_requests() {
        let ctx = Arc::new(ScriptedContext::default());
        let proxy = ClientProxy::builder("mem://x", Arc::new(MemoryServer::new()))
            .context(ctx.clone())
            .build();

        let id = proxy.on("news", |_| {});
        proxy.emit("save", json!({"n": 1}), |_| {});
        proxy.off("news", Some(id));

        let (mut requests, _events) = ctx.take();
        let mut decoded = Vec::new();
        for _ in 0..4 {
            decoded.push(ClientRequest::decode(&requests.recv().await.unwrap()).unwrap());
        }
        assert_eq!(decoded[0].kind(), "connect");
        assert_eq!(
            decoded[1],
            ClientRequest::On {
                event: "news".into()
            }
        );
        assert!(matches!(
            decoded[2],
            ClientRequest::Emit { ref event, ref ack, .. }
                if event == "save" && ack.as_deref() == Some("ack:0:")
        ));
        assert_eq!(
            decoded[3],
            ClientRequest::Off {
                event: "news".into()
            }
        );
        assert_eq!(proxy.listener_count("news"), 0);
        assert_eq!(proxy.pending_acks(), 1);
    }

    #[tokio::test]
    async fn undecodable_message_raises_error_event() {
        let ctx = Arc::new(ScriptedContext::default());
        let proxy = ClientProxy::builder("mem://x", Arc::new(MemoryServer::new()))
            .context(ctx.clone())
            .build();
        let (tx, mut rx) = collector();
        proxy.on(ERROR_EVENT, move |payload| {
            let _ = tx.send(payload.clone());
        });

        let (_requests, events) = ctx.take();
        events.send(PortEvent::Message("{broken".into())).unwrap();
        let err = next(&mut rx).await;
        assert!(err["message"].as_str().unwrap().starts_with("malformed message"));

        events.send(PortEvent::Error("clone failed".into())).unwrap();
        assert_eq!(next(&mut rx).await, json!({ "message": "clone failed" }));
    }

    #[tokio::test]
    async fn ack_replies_bypass_event_listeners() {
        let ctx = Arc::new(ScriptedContext::default());
        let proxy = ClientProxy::builder("mem://x", Arc::new(MemoryServer::new()))
            .context(ctx.clone())
            .build();
        let (event_tx, mut event_rx) = collector();
        let (ack_tx, mut ack_rx) = collector();
        // a real event that happens to look like an ack name
        proxy.on("ack:0:save", move |payload| {
            let _ = event_tx.send(payload.clone());
        });
        proxy.emit("save", json!(1), move |resp| {
            let _ = ack_tx.send(resp);
        });

        let (_requests, events) = ctx.take();
        let reply = ServerEnvelope::ack_reply("ack:0:", "save", json!("stored"));
        events.send(PortEvent::Message(reply.encode().unwrap())).unwrap();
        assert_eq!(next(&mut ack_rx).await, json!("stored"));

        let event = ServerEnvelope::event("ack:0:save", json!("real"));
        events.send(PortEvent::Message(event.encode().unwrap())).unwrap();
        assert_eq!(next(&mut event_rx).await, json!("real"));
        assert!(ack_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn falls_back_to_direct_without_context() {
        let server = MemoryServer::new();
        let proxy = ClientProxy::builder("mem://x", Arc::new(server.clone())).build();
        let (tx, mut rx) = collector();
        proxy.on("connect", move |payload| {
            let _ = tx.send(payload.clone());
        });

        assert_eq!(proxy.mode(), ProxyMode::Direct);
        assert_eq!(next(&mut rx).await, Value::Null);
        assert_eq!(server.connection_count(), 1);
        // lifecycle names never install remote listeners
        assert_eq!(server.install_count("connect"), 0);
    }

    #[tokio::test]
    async fn direct_mode_keeps_one_remote_listener_per_name() {
        let server = MemoryServer::new();
        let proxy = ClientProxy::builder("mem://x", Arc::new(server.clone())).build();
        let (tx, mut rx) = collector();
        let tx2 = tx.clone();
        proxy.on("news", move |p| {
            let _ = tx.send(p.clone());
        });
        proxy.on("news", move |p| {
            let _ = tx2.send(p.clone());
        });
        assert_eq!(server.active_listeners("news"), 1);

        server.publish("news", json!(1));
        assert_eq!(next(&mut rx).await, json!(1));
        assert_eq!(next(&mut rx).await, json!(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());

        proxy.off("news", None);
        assert_eq!(server.active_listeners("news"), 0);
    }

    #[tokio::test]
    async fn direct_create_failure_surfaces_connect_error() {
        let server = MemoryServer::new();
        let proxy = ClientProxy::builder("", Arc::new(server.clone())).build();
        let (tx, mut rx) = collector();
        proxy.on("connect_error", move |payload| {
            let _ = tx.send(payload.clone());
        });

        let err = next(&mut rx).await;
        assert!(err["message"].as_str().unwrap().contains("invalid remote address"));
        assert_eq!(proxy.mode(), ProxyMode::Direct);

        // emits have nowhere to go and do not leak their ack
        proxy.emit("save", json!(1), |_| {});
        assert_eq!(proxy.pending_acks(), 0);
    }

    #[tokio::test]
    async fn off_before_start_only_touches_local_state() {
        let ctx = Arc::new(ScriptedContext::default());
        let proxy = ClientProxy::builder("mem://x", Arc::new(MemoryServer::new()))
            .context(ctx.clone())
            .build();
        proxy.off("news", None);
        assert_eq!(proxy.mode(), ProxyMode::NotStarted);
        assert!(ctx.opened.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn request_resolves_with_ack() {
        let server = MemoryServer::new();
        server.set_responder(|_, data| json!({ "saved": data }));
        let proxy = ClientProxy::builder("mem://x", Arc::new(server)).build();
        let resp = proxy.request("save", &json!({"id": 4})).await.unwrap();
        assert_eq!(resp, json!({ "saved": {"id": 4} }));
        assert_eq!(proxy.pending_acks(), 0);
    }

    // Worker threads let the pump run while `on` is still returning, so an
    // early connect would be lost if the callback were registered late.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn direct_connect_reaches_listener_on_multi_thread_runtime() {
        for _ in 0..50 {
            let server = MemoryServer::new();
            let proxy = ClientProxy::builder("mem://x", Arc::new(server.clone())).build();
            let (tx, mut rx) = collector();
            proxy.on("connect", move |payload| {
                let _ = tx.send(payload.clone());
            });

            assert_eq!(next(&mut rx).await, Value::Null);
            tokio::time::sleep(Duration::from_millis(5)).await;
            assert!(rx.try_recv().is_err());
            assert_eq!(server.connect_count(), 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn direct_ack_reaches_callback_on_multi_thread_runtime() {
        for n in 0..50 {
            let server = MemoryServer::new();
            let proxy = ClientProxy::builder("mem://x", Arc::new(server)).build();
            let resp = tokio::time::timeout(Duration::from_secs(2), proxy.request("save", &json!(n)))
                .await
                .expect("ack lost")
                .unwrap();
            assert_eq!(resp, json!(n));
            assert_eq!(proxy.pending_acks(), 0);
        }
    }
}
