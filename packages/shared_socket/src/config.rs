use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::{DedicatedHubContext, SharedContext, SharedHubContext, UnavailableContext};
use crate::error::ConfigError;
use crate::options::SocketOptions;
use crate::remote::RemoteFactory;

// Layered config (defaults / shared_socket.toml / env vars)
//
//   shared_socket.toml:   url = "wss://events.example.com"
//                         context = "dedicated"
//                         [options]
//                         reconnectionDelay = 250
//
//   env var:              SHARED_SOCKET_OPTIONS__RECONNECTION_DELAY=250
//
// Option keys may be written snake_case; they are camelCased before being
// merged over the socket defaults.

pub const CONFIG_FILE: &str = "shared_socket.toml";
pub const ENV_PREFIX: &str = "SHARED_SOCKET_";

/// How proxies built from this config reach a hub.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    /// One hub per url, shared by every proxy.
    #[default]
    Shared,
    /// A private hub for every proxy.
    Dedicated,
    /// No hub; every proxy connects directly.
    #[serde(alias = "none")]
    #[value(alias = "none")]
    Disabled,
}

impl ContextKind {
    /// Build the context. Proxies only share a hub when they are handed the
    /// same context value, so build once and clone the `Arc`.
    pub fn build(self, remote: Arc<dyn RemoteFactory>) -> Arc<dyn SharedContext> {
        match self {
            ContextKind::Shared => Arc::new(SharedHubContext::new(remote)),
            ContextKind::Dedicated => Arc::new(DedicatedHubContext::new(remote)),
            ContextKind::Disabled => {
                Arc::new(UnavailableContext::new("shared context disabled by config"))
            }
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    #[serde(default)]
    pub url: String,
    /// Overrides merged over `SocketOptions::default()`.
    #[serde(default)]
    pub options: Map<String, Value>,
    #[serde(default)]
    pub context: ContextKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locator: Option<String>,
}

impl ProxyConfig {
    /// Extract and validate a config from a loaded figment.
    pub fn resolve(figment: &figment::Figment) -> Result<Self, ConfigError> {
        let config: ProxyConfig = figment.extract()?;
        if config.url.trim().is_empty() {
            return Err(ConfigError::MissingUrl);
        }
        config.socket_options()?;
        Ok(config)
    }

    /// The effective socket options: defaults with this config's overrides.
    pub fn socket_options(&self) -> Result<SocketOptions, ConfigError> {
        let overrides = self
            .options
            .iter()
            .map(|(key, value)| (camel_case(key), value.clone()))
            .collect();
        Ok(SocketOptions::default().merged(&overrides)?)
    }
}

/// Layers defaults, then `<dir>/shared_socket.toml`, then `SHARED_SOCKET_*`
/// env vars (`__` nests).
pub fn load_config(dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(ProxyConfig::default()))
        .merge(Toml::file(dir.join(CONFIG_FILE)))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for ch in key.chars() {
        if ch == '_' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}
