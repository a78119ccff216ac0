//! Wire format for the channel between a client proxy and the hub.
//!
//! Client → hub:
//!
//! ```text
//! {"connect": true, "url": "...", "options": {...}}
//! {"eventType": "on",   "event": "..."}
//! {"eventType": "emit", "event": "...", "data": ..., "ack": "ack:7:"}
//! {"eventType": "off",  "event": "..."}
//! ```
//!
//! Hub → client: `{"type": "...", "message": ...}`. Acknowledgement replies
//! also carry the `ack` token they answer, so they never need to be told
//! apart from ordinary events by their name.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::options::SocketOptions;

/// Prefix carried by every acknowledgement token.
pub const ACK_PREFIX: &str = "ack:";

/// Local event raised when the channel itself misbehaves.
pub const ERROR_EVENT: &str = "error";

/// Connection lifecycle signals that are delivered without a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Connect,
    Disconnect,
    ConnectError,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Connect => "connect",
            Lifecycle::Disconnect => "disconnect",
            Lifecycle::ConnectError => "connect_error",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "connect" => Some(Lifecycle::Connect),
            "disconnect" => Some(Lifecycle::Disconnect),
            "connect_error" => Some(Lifecycle::ConnectError),
            _ => None,
        }
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the ack token for a proxy-local request id.
pub fn ack_token(id: u64) -> String {
    format!("{ACK_PREFIX}{id}:")
}

/// A request sent from a client proxy to the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    /// Ask the hub to open the shared remote connection (first one wins).
    Connect { url: String, options: SocketOptions },
    /// Subscribe to a remote event on behalf of every attached proxy.
    On { event: String },
    /// Emit to the remote; the reply is routed back using `ack`.
    Emit {
        event: String,
        data: Value,
        ack: Option<String>,
    },
    /// Drop the remote listener for an event name.
    Off { event: String },
}

#[derive(Serialize, Deserialize)]
struct ConnectWire {
    connect: bool,
    url: String,
    #[serde(default)]
    options: SocketOptions,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "lowercase")]
enum EventWire {
    On {
        event: String,
    },
    Emit {
        event: String,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<String>,
    },
    Off {
        event: String,
    },
}

impl ClientRequest {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            ClientRequest::Connect { url, options } => serde_json::to_string(&ConnectWire {
                connect: true,
                url: url.clone(),
                options: options.clone(),
            }),
            ClientRequest::On { event } => serde_json::to_string(&EventWire::On {
                event: event.clone(),
            }),
            ClientRequest::Emit { event, data, ack } => serde_json::to_string(&EventWire::Emit {
                event: event.clone(),
                data: data.clone(),
                ack: ack.clone(),
            }),
            ClientRequest::Off { event } => serde_json::to_string(&EventWire::Off {
                event: event.clone(),
            }),
        }
    }

    /// Decode one channel message. Anything that is not one of the four
    /// known request kinds is an error; the hub logs it and moves on.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(ref obj) = value else {
            return Err(ProtocolError::Malformed("expected a JSON object".into()));
        };

        if obj.get("connect").and_then(Value::as_bool) == Some(true) {
            let wire: ConnectWire = serde_json::from_value(value)?;
            return Ok(ClientRequest::Connect {
                url: wire.url,
                options: wire.options,
            });
        }

        let event_type = obj
            .get("eventType")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("eventType"))?;
        if !matches!(event_type, "on" | "emit" | "off") {
            return Err(ProtocolError::UnknownEventType(event_type.to_string()));
        }

        Ok(match serde_json::from_value::<EventWire>(value)? {
            EventWire::On { event } => ClientRequest::On { event },
            EventWire::Emit { event, data, ack } => ClientRequest::Emit { event, data, ack },
            EventWire::Off { event } => ClientRequest::Off { event },
        })
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientRequest::Connect { .. } => "connect",
            ClientRequest::On { .. } => "on",
            ClientRequest::Emit { .. } => "emit",
            ClientRequest::Off { .. } => "off",
        }
    }
}

/// A message sent from the hub to a client proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub message: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<String>,
}

impl ServerEnvelope {
    pub fn event(kind: impl Into<String>, message: Value) -> Self {
        Self {
            kind: kind.into(),
            message,
            ack: None,
        }
    }

    pub fn lifecycle(signal: Lifecycle, message: Value) -> Self {
        Self::event(signal.as_str(), message)
    }

    /// Reply to an emit. `type` keeps the `ack:` prefix for readers that
    /// only look at names; routing uses the `ack` field.
    pub fn ack_reply(token: &str, event: &str, response: Value) -> Self {
        Self {
            kind: format!("{token}{event}"),
            message: response,
            ack: Some(token.to_string()),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}
