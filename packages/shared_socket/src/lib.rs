//! Shared Socket - one remote event connection multiplexed across many clients
//!
//! Every `ClientProxy` looks like its own socket.io-style connection, but
//! proxies that open the same url through a `SharedHubContext` are served by
//! a single hub task owning a single remote connection. Subscriptions are
//! installed on the remote once per event name and every inbound event is
//! fanned out to all attached proxies. When no shared context can be opened
//! the proxy quietly connects directly instead.
//!
//! Remote connections come from a `RemoteFactory`: `SocketIoClient` speaks
//! Socket.IO over a websocket, `MemoryServer` is an in-process server for
//! tests and demos.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shared_socket::{ClientProxy, MemoryServer, SharedHubContext};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Arc::new(MemoryServer::new());
//!     let context = Arc::new(SharedHubContext::new(server.clone()));
//!
//!     let proxy = ClientProxy::builder("mem://events", server)
//!         .context(context)
//!         .build();
//!
//!     proxy.on("news", |payload| println!("news: {payload}"));
//!     let saved = proxy.request("save", &serde_json::json!({"id": 1})).await;
//!     println!("saved: {saved:?}");
//! }
//! ```

pub mod config;
pub mod context;
mod error;
pub mod hub;
mod listeners;
pub mod memory;
pub mod options;
pub mod protocol;
mod proxy;
pub mod remote;
pub mod socketio;

pub use config::{ContextKind, ProxyConfig, load_config};
pub use context::{
    DEFAULT_LOCATOR, DedicatedHubContext, Port, PortEvent, SharedContext, SharedHubContext,
    UnavailableContext,
};
pub use error::{ConfigError, ContextError, ProtocolError, ProxyError, RemoteError};
pub use hub::{Hub, HubHandle, HubSnapshot};
pub use listeners::ListenerId;
pub use memory::MemoryServer;
pub use options::{SocketOptions, Transport};
pub use proxy::{ClientProxy, ProxyBuilder, ProxyMode};
pub use socketio::SocketIoClient;
