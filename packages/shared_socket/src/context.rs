//! Shared background contexts that host a hub.
//!
//! A `SharedContext` turns a locator plus a name into a `Port`: a pair of
//! channels into some hub. Which hub, and whether it is shared with other
//! openers, is up to the implementation:
//!
//! - `SharedHubContext`: one hub per `(locator, name)`, shared by everyone
//!   who opens it. This is the multiplexed mode.
//! - `DedicatedHubContext`: a fresh hub for every opener.
//! - `UnavailableContext`: always fails, so proxies go direct.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::ContextError;
use crate::hub::{Hub, HubHandle};
use crate::remote::RemoteFactory;

/// Default resource locator for the hub.
pub const DEFAULT_LOCATOR: &str = "shared_socket::hub";

/// What a port delivers to the client side.
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    /// A JSON-encoded `ServerEnvelope`.
    Message(String),
    /// The channel failed to deliver something.
    Error(String),
}

/// The client's side of a channel into a hub.
pub struct Port {
    /// JSON-encoded `ClientRequest`s, delivered in send order.
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<PortEvent>,
}

pub trait SharedContext: Send + Sync {
    fn open(&self, locator: &str, name: &str) -> Result<Port, ContextError>;
}

fn require_runtime() -> Result<(), ContextError> {
    tokio::runtime::Handle::try_current()
        .map(|_| ())
        .map_err(|_| ContextError::NoRuntime)
}

/// One hub per `(locator, name)`, shared by every proxy that opens it.
pub struct SharedHubContext {
    remote: Arc<dyn RemoteFactory>,
    hubs: Mutex<HashMap<(String, String), HubHandle>>,
}

impl SharedHubContext {
    pub fn new(remote: Arc<dyn RemoteFactory>) -> Self {
        Self {
            remote,
            hubs: Mutex::new(HashMap::new()),
        }
    }

    /// The hub currently serving `(locator, name)`, if one was started.
    pub fn hub(&self, locator: &str, name: &str) -> Option<HubHandle> {
        self.hubs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(locator.to_string(), name.to_string()))
            .cloned()
    }
}

impl SharedContext for SharedHubContext {
    fn open(&self, locator: &str, name: &str) -> Result<Port, ContextError> {
        require_runtime()?;
        let key = (locator.to_string(), name.to_string());
        let mut hubs = self.hubs.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(hub) = hubs.get(&key) {
            if hub.is_running() {
                debug!(locator, name, "attaching to running hub");
                return hub.attach();
            }
        }

        info!(locator, name, "starting shared hub");
        let hub = Hub::spawn(self.remote.clone());
        let port = hub.attach()?;
        hubs.insert(key, hub);
        Ok(port)
    }
}

/// A private hub for every opener; nothing is shared.
pub struct DedicatedHubContext {
    remote: Arc<dyn RemoteFactory>,
}

impl DedicatedHubContext {
    pub fn new(remote: Arc<dyn RemoteFactory>) -> Self {
        Self { remote }
    }
}

impl SharedContext for DedicatedHubContext {
    fn open(&self, locator: &str, name: &str) -> Result<Port, ContextError> {
        require_runtime()?;
        debug!(locator, name, "starting dedicated hub");
        Hub::spawn(self.remote.clone()).attach()
    }
}

/// A context that can never be opened.
pub struct UnavailableContext {
    reason: String,
}

impl UnavailableContext {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl SharedContext for UnavailableContext {
    fn open(&self, _locator: &str, _name: &str) -> Result<Port, ContextError> {
        Err(ContextError::Unavailable(self.reason.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryServer;

    #[tokio::test]
    async fn shared_context_reuses_hub_per_key() {
        let ctx = SharedHubContext::new(Arc::new(MemoryServer::new()));
        let _a = ctx.open(DEFAULT_LOCATOR, "mem://one").unwrap();
        let _b = ctx.open(DEFAULT_LOCATOR, "mem://one").unwrap();
        let _c = ctx.open(DEFAULT_LOCATOR, "mem://two").unwrap();

        let one = ctx.hub(DEFAULT_LOCATOR, "mem://one").unwrap();
        let two = ctx.hub(DEFAULT_LOCATOR, "mem://two").unwrap();
        assert_eq!(one.snapshot().await.unwrap().endpoints, 2);
        assert_eq!(two.snapshot().await.unwrap().endpoints, 1);
        assert!(ctx.hub("elsewhere", "mem://one").is_none());
    }

    #[tokio::test]
    async fn dedicated_context_never_shares() {
        let ctx = DedicatedHubContext::new(Arc::new(MemoryServer::new()));
        let a = ctx.open(DEFAULT_LOCATOR, "mem://one");
        let b = ctx.open(DEFAULT_LOCATOR, "mem://one");
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[test]
    fn unavailable_context_fails() {
        let ctx = UnavailableContext::new("disabled");
        assert!(matches!(
            ctx.open(DEFAULT_LOCATOR, "mem://one"),
            Err(ContextError::Unavailable(reason)) if reason == "disabled"
        ));
    }

    #[test]
    fn open_without_runtime_fails() {
        let ctx = SharedHubContext::new(Arc::new(MemoryServer::new()));
        assert!(matches!(
            ctx.open(DEFAULT_LOCATOR, "mem://one"),
            Err(ContextError::NoRuntime)
        ));
    }
}
