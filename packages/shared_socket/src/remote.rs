//! The remote collaborator: one real-time connection to the event server.
//!
//! The transport's own wire protocol and reconnection policy live behind
//! these traits. Whatever owns a `RemoteConnection` (the hub, or a proxy in
//! direct mode) sees it only through calls on the trait and the
//! `RemoteEvent`s it pushes into its sink.

use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::RemoteError;
use crate::options::SocketOptions;
use crate::protocol::Lifecycle;

/// Identifies one emit-with-acknowledgement on a connection.
pub type AckId = u64;

/// One listener slot installed on a remote connection.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct SlotId(pub u64);

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything a remote connection reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// Always delivered, no listener needed.
    Lifecycle { signal: Lifecycle, payload: Value },
    /// A named event arriving on an installed listener slot.
    Event {
        slot: SlotId,
        name: String,
        payload: Value,
    },
    /// The server answered an emit.
    Ack { id: AckId, response: Value },
}

pub type RemoteSink = mpsc::UnboundedSender<RemoteEvent>;

pub trait RemoteConnection: Send {
    fn connect(&mut self);
    fn disconnect(&mut self);
    /// Install a listener for `event`. Previously installed listeners for
    /// the same name stay installed; callers that want one slot per name
    /// call `off` first.
    fn on(&mut self, event: &str) -> SlotId;
    /// Remove every listener installed for `event`.
    fn off(&mut self, event: &str);
    fn emit(&mut self, event: &str, data: Value, ack: Option<AckId>);
    fn state(&self) -> ConnectionState;
}

pub trait RemoteFactory: Send + Sync {
    fn create(
        &self,
        url: &str,
        options: &SocketOptions,
        sink: RemoteSink,
    ) -> Result<Box<dyn RemoteConnection>, RemoteError>;
}
