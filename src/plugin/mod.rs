//! Application-level proxy plugins
//!
//! Plugins front a connected client's advertised backends with
//! server-side listeners. The registry is process-wide and populated
//! before the server starts accepting connections; it is never mutated at
//! runtime. Two lifecycle points:
//!
//! - [`setup_all`] at process start, once per plugin named in the config
//!   (failure is fatal),
//! - [`ProxyPlugin::run_proxy`] / [`ProxyPlugin::stop_proxy`] when a client
//!   attaches/detaches, once per protocol the client advertised.

mod tcp_proxy;

pub use tcp_proxy::TcpProxy;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::PluginError;

/// Per-attach description handed to a plugin
#[derive(Debug, Clone)]
pub struct PluginMeta {
    /// Protocol this proxy serves ("http", "https", "grpc", ...)
    pub protocol: String,

    /// Requested listen address; plugins may rebind (e.g. port 0) and
    /// report the real port in the returned tuple
    pub from: String,

    /// Backend address inside the tunnel, `vip:port`
    pub to: String,

    /// Recycle signal; cancelled on detach to tear the proxy down
    pub recycle: CancellationToken,
}

impl PluginMeta {
    #[must_use]
    pub fn new(protocol: impl Into<String>, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            from: from.into(),
            to: to.into(),
            recycle: CancellationToken::new(),
        }
    }
}

/// What a plugin actually bound, used for registration downstream
#[derive(Debug, Clone)]
pub struct ProxyTuple {
    pub protocol: String,
    pub from_port: u16,
    pub to_port: u16,
}

/// A named proxy type
#[async_trait]
pub trait ProxyPlugin: Send + Sync {
    /// Registry name, matched against the `plugin` config section
    fn name(&self) -> &'static str;

    /// Protocols this plugin can front
    fn protocols(&self) -> &'static [&'static str];

    /// Process-start initialization with the plugin's config string
    async fn setup(&self, config: &str) -> Result<(), PluginError>;

    /// Start a proxy for one client attach. May rebind `meta.from` and
    /// must report the actual ports in the returned tuple.
    async fn run_proxy(&self, meta: &PluginMeta) -> Result<ProxyTuple, PluginError>;

    /// Stop the proxy started for `meta`
    fn stop_proxy(&self, meta: &PluginMeta) {
        meta.recycle.cancel();
    }
}

static REGISTRY: LazyLock<RwLock<HashMap<String, Arc<dyn ProxyPlugin>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Register a plugin under its name. Later registrations under the same
/// name replace earlier ones.
pub fn register(plugin: Arc<dyn ProxyPlugin>) {
    REGISTRY.write().insert(plugin.name().to_string(), plugin);
}

/// Register the plugins compiled into this binary.
pub fn register_builtin() {
    register(Arc::new(TcpProxy::new()));
}

/// Look up a plugin by registry name.
#[must_use]
pub fn lookup(name: &str) -> Option<Arc<dyn ProxyPlugin>> {
    REGISTRY.read().get(name).cloned()
}

/// Look up the plugin serving `protocol`.
#[must_use]
pub fn lookup_protocol(protocol: &str) -> Option<Arc<dyn ProxyPlugin>> {
    let registry = REGISTRY.read();
    registry
        .values()
        .find(|p| p.protocols().iter().any(|proto| *proto == protocol))
        .cloned()
}

/// Run `setup` for every plugin named in the configuration.
///
/// # Errors
///
/// Returns `PluginError::NotFound` for a configured but unregistered name
/// and propagates the plugin's own setup errors. Both are fatal at startup.
pub async fn setup_all(configs: &HashMap<String, String>) -> Result<(), PluginError> {
    for (name, config) in configs {
        let plugin = lookup(name).ok_or_else(|| PluginError::NotFound(name.clone()))?;
        plugin.setup(config).await?;
        info!("Plugin {} ready (protocols: {:?})", name, plugin.protocols());
    }
    Ok(())
}
