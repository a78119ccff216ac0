//! Socket.IO client over a websocket: the production `RemoteFactory`.
//!
//! Each connection is owned by one driver task. The `SocketIoRemote`
//! handle given to the hub (or a direct proxy) sends it commands over a
//! queue and shares the listener table and connection state through a
//! mutex, so every trait call returns immediately.
//!
//! Speaks Engine.IO protocol 4 on the websocket transport only: no long
//! polling, no upgrade, no binary attachments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, tungstenite};
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, RemoteError};
use crate::options::{SocketOptions, Transport};
use crate::protocol::Lifecycle;
use crate::remote::{
    AckId, ConnectionState, RemoteConnection, RemoteEvent, RemoteFactory, RemoteSink, SlotId,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, tungstenite::Message>;
type WsRead = SplitStream<WsStream>;

/// Engine.IO mount point when the options carry no `path`.
pub const DEFAULT_PATH: &str = "/socket.io/";
const DEFAULT_TIMEOUT_MS: u64 = 20_000;

// ── Wire format ─────────────────────────────────────────────────────────
//
//   engine.io frame     <type>[body]         0 open, 1 close, 2 ping,
//                                            3 pong, 4 message, 6 noop
//   socket.io packet    <type>[/nsp,][id][json]   inside a "4" frame
//
//   42["news",{"n":1}]         event on the default namespace
//   4212["save",{"x":1}]       event asking for ack 12
//   4/chat,312[{"ok":true}]    ack 12 on /chat

/// One Engine.IO frame, borrowed from the websocket text.
#[derive(Debug, PartialEq)]
enum Frame<'a> {
    Open(&'a str),
    Close,
    Ping,
    Pong,
    Message(&'a str),
    Upgrade,
    Noop,
}

fn parse_frame(text: &str) -> Result<Frame<'_>, ProtocolError> {
    let Some(kind) = text.chars().next() else {
        return Err(ProtocolError::Malformed("empty engine.io frame".into()));
    };
    let body = &text[kind.len_utf8()..];
    Ok(match kind {
        '0' => Frame::Open(body),
        '1' => Frame::Close,
        '2' => Frame::Ping,
        '3' => Frame::Pong,
        '4' => Frame::Message(body),
        '5' => Frame::Upgrade,
        '6' => Frame::Noop,
        other => return Err(ProtocolError::UnknownEventType(format!("engine.io {other}"))),
    })
}

/// One Socket.IO packet.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Packet {
    Connect(Value),
    Disconnect,
    Event {
        id: Option<AckId>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        id: AckId,
        args: Vec<Value>,
    },
    ConnectError(Value),
}

/// Decode the body of an Engine.IO message frame into its namespace and
/// packet.
pub(crate) fn decode_packet(body: &str) -> Result<(String, Packet), ProtocolError> {
    let Some(kind) = body.chars().next() else {
        return Err(ProtocolError::Malformed("empty socket.io packet".into()));
    };
    let mut rest = &body[kind.len_utf8()..];

    let namespace = if rest.starts_with('/') {
        let (namespace, tail) = rest.split_once(',').unwrap_or((rest, ""));
        rest = tail;
        namespace
    } else {
        "/"
    };

    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    let id = match digits {
        0 => None,
        n => Some(
            rest[..n]
                .parse::<AckId>()
                .map_err(|e| ProtocolError::Malformed(format!("ack id: {e}")))?,
        ),
    };
    rest = &rest[digits..];

    let payload: Option<Value> = if rest.is_empty() {
        None
    } else {
        Some(serde_json::from_str(rest)?)
    };

    let packet = match kind {
        '0' => Packet::Connect(payload.unwrap_or(Value::Null)),
        '1' => Packet::Disconnect,
        '2' => {
            let mut args = into_args(payload)?.into_iter();
            let name = match args.next() {
                Some(Value::String(name)) => name,
                Some(_) => return Err(ProtocolError::Malformed("event name is not a string".into())),
                None => return Err(ProtocolError::MissingField("event")),
            };
            Packet::Event {
                id,
                name,
                args: args.collect(),
            }
        }
        '3' => Packet::Ack {
            id: id.ok_or(ProtocolError::MissingField("id"))?,
            args: into_args(payload)?,
        },
        '4' => Packet::ConnectError(payload.unwrap_or(Value::Null)),
        '5' | '6' => return Err(ProtocolError::Malformed("binary packets are not supported".into())),
        other => return Err(ProtocolError::UnknownEventType(format!("socket.io {other}"))),
    };
    Ok((namespace.to_string(), packet))
}

fn into_args(payload: Option<Value>) -> Result<Vec<Value>, ProtocolError> {
    match payload {
        None => Ok(Vec::new()),
        Some(Value::Array(args)) => Ok(args),
        Some(_) => Err(ProtocolError::Malformed("expected a JSON array".into())),
    }
}

/// Encode `packet` as a complete Engine.IO message frame.
pub(crate) fn encode_packet(namespace: &str, packet: &Packet) -> String {
    let (kind, id, payload) = match packet {
        Packet::Connect(auth) => ('0', None, (!auth.is_null()).then(|| auth.clone())),
        Packet::Disconnect => ('1', None, None),
        Packet::Event { id, name, args } => {
            let mut array = Vec::with_capacity(args.len() + 1);
            array.push(Value::String(name.clone()));
            array.extend(args.iter().cloned());
            ('2', *id, Some(Value::Array(array)))
        }
        Packet::Ack { id, args } => ('3', Some(*id), Some(Value::Array(args.clone()))),
        Packet::ConnectError(payload) => ('4', None, Some(payload.clone())),
    };

    let mut out = String::from("4");
    out.push(kind);
    if namespace != "/" {
        out.push_str(namespace);
        out.push(',');
    }
    if let Some(id) = id {
        out.push_str(&id.to_string());
    }
    if let Some(payload) = payload {
        out.push_str(&payload.to_string());
    }
    out
}

/// Listeners take one payload: no args is null, several become an array.
fn single_payload(mut args: Vec<Value>) -> Value {
    match args.len() {
        0 => Value::Null,
        1 => args.remove(0),
        _ => Value::Array(args),
    }
}

// ── Addressing ──────────────────────────────────────────────────────────

/// Where the websocket goes and which namespace it joins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub ws_url: String,
    pub namespace: String,
}

impl Target {
    /// `http(s)://host[:port][/namespace][?query]` (or `ws(s)://`) to the
    /// Engine.IO websocket endpoint. `path` and `query` in the options'
    /// extra keys are honored the way socket.io clients read them.
    pub(crate) fn parse(url: &str, options: &SocketOptions) -> Result<Self, RemoteError> {
        let invalid = || RemoteError::InvalidAddress(url.to_string());

        let (scheme, rest) = url.trim().split_once("://").ok_or_else(invalid)?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            _ => return Err(invalid()),
        };
        let (authority, tail) = match rest.find(|c: char| c == '/' || c == '?') {
            Some(at) => rest.split_at(at),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(invalid());
        }
        let (path, query) = tail.split_once('?').unwrap_or((tail, ""));
        let namespace = match path.trim_end_matches('/') {
            "" => "/".to_string(),
            namespace => namespace.to_string(),
        };

        let engine_path = options
            .extra
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PATH);
        let slash = if engine_path.starts_with('/') { "" } else { "/" };
        let mut ws_url =
            format!("{scheme}://{authority}{slash}{engine_path}?EIO=4&transport=websocket");
        if !query.is_empty() {
            ws_url.push('&');
            ws_url.push_str(query);
        }
        if let Some(Value::Object(extra)) = options.extra.get("query") {
            for (key, value) in extra {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                ws_url.push_str(&format!("&{key}={value}"));
            }
        }

        Ok(Target { ws_url, namespace })
    }
}

// ── Factory and handle ──────────────────────────────────────────────────

/// Opens Socket.IO connections over tokio-tungstenite.
#[derive(Clone, Copy, Debug, Default)]
pub struct SocketIoClient;

impl SocketIoClient {
    pub fn new() -> Self {
        Self
    }
}

impl RemoteFactory for SocketIoClient {
    fn create(
        &self,
        url: &str,
        options: &SocketOptions,
        sink: RemoteSink,
    ) -> Result<Box<dyn RemoteConnection>, RemoteError> {
        if !options.transports.contains(&Transport::Websocket) {
            return Err(RemoteError::WebsocketDisabled);
        }
        let target = Target::parse(url, options)?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RemoteError::NoRuntime)?;

        let shared = Arc::new(Mutex::new(Shared {
            state: ConnectionState::Disconnected,
            slots: HashMap::new(),
            next_slot: 0,
        }));
        let (commands, queue) = mpsc::unbounded_channel();
        debug!(url, ws_url = %target.ws_url, namespace = %target.namespace, "socket.io client created");

        let driver = Driver {
            target,
            options: options.clone(),
            sink,
            shared: shared.clone(),
            outbox: Vec::new(),
        };
        runtime.spawn(driver.run(queue));

        let mut remote = SocketIoRemote { commands, shared };
        if options.auto_connect {
            remote.connect();
        }
        Ok(Box::new(remote))
    }
}

/// State the handle and the driver task both see.
struct Shared {
    state: ConnectionState,
    slots: HashMap<String, Vec<SlotId>>,
    next_slot: u64,
}

fn lock_shared(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Emit {
    event: String,
    data: Value,
    ack: Option<AckId>,
}

enum Command {
    Connect,
    Disconnect,
    Emit(Emit),
}

/// Handle to one Socket.IO connection. Dropping it stops the driver and
/// closes the websocket.
pub struct SocketIoRemote {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Mutex<Shared>>,
}

impl SocketIoRemote {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("socket.io driver stopped, command dropped");
        }
    }
}

impl RemoteConnection for SocketIoRemote {
    fn connect(&mut self) {
        {
            let mut shared = lock_shared(&self.shared);
            if shared.state == ConnectionState::Disconnected {
                shared.state = ConnectionState::Connecting;
            }
        }
        self.send(Command::Connect);
    }

    fn disconnect(&mut self) {
        self.send(Command::Disconnect);
    }

    fn on(&mut self, event: &str) -> SlotId {
        let mut shared = lock_shared(&self.shared);
        let slot = SlotId(shared.next_slot);
        shared.next_slot += 1;
        shared.slots.entry(event.to_string()).or_default().push(slot);
        slot
    }

    fn off(&mut self, event: &str) {
        lock_shared(&self.shared).slots.remove(event);
    }

    fn emit(&mut self, event: &str, data: Value, ack: Option<AckId>) {
        self.send(Command::Emit(Emit {
            event: event.to_string(),
            data,
            ack,
        }));
    }

    fn state(&self) -> ConnectionState {
        lock_shared(&self.shared).state
    }
}

// ── Driver task ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenPayload {
    sid: String,
    #[serde(default = "default_ping_interval")]
    ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    ping_timeout: u64,
}

fn default_ping_interval() -> u64 {
    25_000
}
fn default_ping_timeout() -> u64 {
    20_000
}

enum HandshakeError {
    /// The server answered CONNECT with CONNECT_ERROR.
    Refused(Value),
    Transport(String),
}

/// How a live session ended.
enum SessionEnd {
    /// `disconnect()` was called.
    Client,
    /// The server sent DISCONNECT for our namespace.
    Server,
    /// The websocket went away. Reconnect if the options allow it.
    Transport(String),
    /// The handle was dropped.
    Dropped,
}

enum Backoff {
    Retry,
    Cancel,
    Dropped,
}

struct Driver {
    target: Target,
    options: SocketOptions,
    sink: RemoteSink,
    shared: Arc<Mutex<Shared>>,
    /// Emits issued while no session is up, flushed in order on connect.
    outbox: Vec<Emit>,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        'idle: loop {
            loop {
                match commands.recv().await {
                    None => return,
                    Some(Command::Connect) => break,
                    Some(Command::Disconnect) => self.set_state(ConnectionState::Disconnected),
                    Some(Command::Emit(emit)) => self.outbox.push(emit),
                }
            }

            let mut attempt: u32 = 0;
            loop {
                self.set_state(ConnectionState::Connecting);
                match self.open().await {
                    Ok((write, read, heartbeat)) => {
                        attempt = 0;
                        self.set_state(ConnectionState::Connected);
                        self.lifecycle(Lifecycle::Connect, Value::Null);

                        let end = self.session(write, read, heartbeat, &mut commands).await;
                        self.set_state(ConnectionState::Disconnected);
                        match end {
                            SessionEnd::Dropped => return,
                            SessionEnd::Client => {
                                self.lifecycle(Lifecycle::Disconnect, json!("io client disconnect"));
                                continue 'idle;
                            }
                            SessionEnd::Server => {
                                self.lifecycle(Lifecycle::Disconnect, json!("io server disconnect"));
                                continue 'idle;
                            }
                            SessionEnd::Transport(reason) => {
                                self.lifecycle(Lifecycle::Disconnect, json!(reason));
                            }
                        }
                    }
                    Err(HandshakeError::Refused(payload)) => {
                        self.set_state(ConnectionState::Disconnected);
                        self.lifecycle(Lifecycle::ConnectError, payload);
                        continue 'idle;
                    }
                    Err(HandshakeError::Transport(message)) => {
                        self.set_state(ConnectionState::Disconnected);
                        self.lifecycle(Lifecycle::ConnectError, json!({ "message": message }));
                    }
                }

                if !self.options.reconnection
                    || u64::from(attempt) >= self.options.reconnection_attempts
                {
                    info!(url = %self.target.ws_url, attempt, "not reconnecting");
                    continue 'idle;
                }
                let delay = self.options.backoff(attempt);
                attempt = attempt.saturating_add(1);
                debug!(attempt, ?delay, "socket.io reconnecting");
                match self.backoff(delay, &mut commands).await {
                    Backoff::Retry => {}
                    Backoff::Cancel => {
                        self.set_state(ConnectionState::Disconnected);
                        continue 'idle;
                    }
                    Backoff::Dropped => return,
                }
            }
        }
    }

    async fn backoff(
        &mut self,
        delay: Duration,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Backoff {
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                () = &mut timer => return Backoff::Retry,
                command = commands.recv() => match command {
                    None => return Backoff::Dropped,
                    Some(Command::Connect) => {}
                    Some(Command::Disconnect) => return Backoff::Cancel,
                    Some(Command::Emit(emit)) => self.outbox.push(emit),
                },
            }
        }
    }

    /// Websocket plus Socket.IO handshake, bounded by the `timeout` option.
    async fn open(&self) -> Result<(WsWrite, WsRead, Duration), HandshakeError> {
        let timeout = self
            .options
            .extra
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        match tokio::time::timeout(Duration::from_millis(timeout), self.handshake()).await {
            Ok(result) => result,
            Err(_) => Err(HandshakeError::Transport("timeout".into())),
        }
    }

    async fn handshake(&self) -> Result<(WsWrite, WsRead, Duration), HandshakeError> {
        debug!(url = %self.target.ws_url, "opening websocket");
        let (ws, _) = tokio_tungstenite::connect_async(self.target.ws_url.as_str())
            .await
            .map_err(|e| HandshakeError::Transport(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let open = loop {
            let text = next_text(&mut read).await.map_err(HandshakeError::Transport)?;
            match parse_frame(&text) {
                Ok(Frame::Open(body)) => {
                    break serde_json::from_str::<OpenPayload>(body).map_err(|e| {
                        HandshakeError::Transport(format!("bad engine.io open packet: {e}"))
                    })?;
                }
                Ok(_) => {}
                Err(e) => return Err(HandshakeError::Transport(e.to_string())),
            }
        };

        let auth = self.options.extra.get("auth").cloned().unwrap_or(Value::Null);
        send_text(&mut write, encode_packet(&self.target.namespace, &Packet::Connect(auth)))
            .await
            .map_err(HandshakeError::Transport)?;

        loop {
            let text = next_text(&mut read).await.map_err(HandshakeError::Transport)?;
            match parse_frame(&text) {
                Ok(Frame::Ping) => send_text(&mut write, "3".into())
                    .await
                    .map_err(HandshakeError::Transport)?,
                Ok(Frame::Close) => return Err(HandshakeError::Transport("transport close".into())),
                Ok(Frame::Message(body)) => match decode_packet(body) {
                    Ok((namespace, Packet::Connect(_))) if namespace == self.target.namespace => {
                        info!(sid = %open.sid, namespace = %namespace, "socket.io connected");
                        let heartbeat = Duration::from_millis(open.ping_interval + open.ping_timeout);
                        return Ok((write, read, heartbeat));
                    }
                    Ok((namespace, Packet::ConnectError(payload)))
                        if namespace == self.target.namespace =>
                    {
                        warn!(namespace = %namespace, %payload, "socket.io connection refused");
                        return Err(HandshakeError::Refused(payload));
                    }
                    Ok(_) => {}
                    Err(e) => warn!(code = e.error_code(), error = %e, "undecodable packet during handshake"),
                },
                Ok(_) => {}
                Err(e) => warn!(code = e.error_code(), error = %e, "dropping engine.io frame"),
            }
        }
    }

    async fn session(
        &mut self,
        mut write: WsWrite,
        mut read: WsRead,
        heartbeat: Duration,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> SessionEnd {
        for emit in std::mem::take(&mut self.outbox) {
            if let Err(reason) = self.send_emit(&mut write, emit).await {
                return SessionEnd::Transport(reason);
            }
        }

        // The server pings every ping_interval; silence past that plus
        // ping_timeout means the transport is dead.
        let deadline = tokio::time::sleep(heartbeat);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                frame = next_text(&mut read) => {
                    let text = match frame {
                        Ok(text) => text,
                        Err(reason) => return SessionEnd::Transport(reason),
                    };
                    deadline.as_mut().reset(tokio::time::Instant::now() + heartbeat);
                    if let Some(end) = self.handle_frame(&mut write, &text).await {
                        return end;
                    }
                }
                command = commands.recv() => match command {
                    None => {
                        let _ = write.close().await;
                        return SessionEnd::Dropped;
                    }
                    Some(Command::Connect) => {}
                    Some(Command::Disconnect) => {
                        let bye = encode_packet(&self.target.namespace, &Packet::Disconnect);
                        let _ = send_text(&mut write, bye).await;
                        let _ = write.close().await;
                        return SessionEnd::Client;
                    }
                    Some(Command::Emit(emit)) => {
                        if let Err(reason) = self.send_emit(&mut write, emit).await {
                            return SessionEnd::Transport(reason);
                        }
                    }
                },
                () = &mut deadline => return SessionEnd::Transport("ping timeout".into()),
            }
        }
    }

    async fn handle_frame(&mut self, write: &mut WsWrite, text: &str) -> Option<SessionEnd> {
        match parse_frame(text) {
            Ok(Frame::Ping) => {
                if let Err(reason) = send_text(write, "3".into()).await {
                    return Some(SessionEnd::Transport(reason));
                }
            }
            Ok(Frame::Close) => return Some(SessionEnd::Transport("transport close".into())),
            Ok(Frame::Message(body)) => return self.handle_packet(body),
            Ok(Frame::Open(_) | Frame::Pong | Frame::Upgrade | Frame::Noop) => {}
            Err(e) => warn!(code = e.error_code(), error = %e, "dropping engine.io frame"),
        }
        None
    }

    fn handle_packet(&self, body: &str) -> Option<SessionEnd> {
        let (namespace, packet) = match decode_packet(body) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(code = e.error_code(), error = %e, "dropping socket.io packet");
                return None;
            }
        };
        if namespace != self.target.namespace {
            debug!(namespace = %namespace, "packet for another namespace");
            return None;
        }

        match packet {
            Packet::Event { id, name, args } => {
                if id.is_some() {
                    debug!(event = %name, "server requested an acknowledgement, not answered");
                }
                let slots = lock_shared(&self.shared)
                    .slots
                    .get(&name)
                    .cloned()
                    .unwrap_or_default();
                if slots.is_empty() {
                    debug!(event = %name, "no listener installed, dropping event");
                    return None;
                }
                let payload = single_payload(args);
                for slot in slots {
                    let _ = self.sink.send(RemoteEvent::Event {
                        slot,
                        name: name.clone(),
                        payload: payload.clone(),
                    });
                }
            }
            Packet::Ack { id, args } => {
                let _ = self.sink.send(RemoteEvent::Ack {
                    id,
                    response: single_payload(args),
                });
            }
            Packet::Disconnect => return Some(SessionEnd::Server),
            Packet::ConnectError(payload) => {
                warn!(%payload, "connect_error on a live session");
                return Some(SessionEnd::Server);
            }
            Packet::Connect(_) => {}
        }
        None
    }

    async fn send_emit(&mut self, write: &mut WsWrite, emit: Emit) -> Result<(), String> {
        let text = encode_packet(
            &self.target.namespace,
            &Packet::Event {
                id: emit.ack,
                name: emit.event.clone(),
                args: vec![emit.data.clone()],
            },
        );
        if let Err(reason) = send_text(write, text).await {
            // resent after reconnecting
            self.outbox.push(emit);
            return Err(reason);
        }
        Ok(())
    }

    fn set_state(&self, state: ConnectionState) {
        lock_shared(&self.shared).state = state;
    }

    fn lifecycle(&self, signal: Lifecycle, payload: Value) {
        debug!(%signal, url = %self.target.ws_url, "socket.io lifecycle");
        let _ = self.sink.send(RemoteEvent::Lifecycle { signal, payload });
    }
}

/// Next text frame. Close frames and a finished stream both mean the
/// transport closed.
async fn next_text(read: &mut WsRead) -> Result<String, String> {
    loop {
        match read.next().await {
            Some(Ok(tungstenite::Message::Text(text))) => return Ok(text.as_str().to_owned()),
            Some(Ok(tungstenite::Message::Close(_))) | None => return Err("transport close".into()),
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(error = %e, "websocket read failed");
                return Err("transport error".into());
            }
        }
    }
}

async fn send_text(write: &mut WsWrite, text: String) -> Result<(), String> {
    write
        .send(tungstenite::Message::Text(text.into()))
        .await
        .map_err(|e| {
            warn!(error = %e, "websocket write failed");
            "transport error".to_string()
        })
}
