//! tunneld: server side of a reverse-tunneling daemon
//!
//! Remote clients dial in over a long-lived control connection; the server
//! assigns each one a virtual IP (VIP) from a private pool and registers a
//! domain name pointing at the server's public address. Public TCP/UDP
//! traffic aimed at a VIP is transparently intercepted by the host kernel
//! and relayed over a per-client multiplexed session down to that client,
//! with the original public source preserved on the reverse path.
//!
//! # Architecture
//!
//! ```text
//! public peer → kernel redirect → TCP/UDP forwarder
//!                                      ↓ lookup by original dst VIP
//!                                session registry
//!                                      ↓ sub-stream on the client mux
//!                              proxy header + payload → client
//!
//! TUN device → reader loop → registry → session egress queue → Data frames
//! ```
//!
//! # Requirements
//!
//! - Linux kernel with TPROXY support and the matching iptables/routing
//!   setup (`route_localnet=1`, `rp_filter=0`, a local-delivery rule for
//!   the tproxy mark)
//! - `CAP_NET_ADMIN` (transparent sockets, TUN) and `CAP_NET_RAW`
//!   (spoofed-source UDP replies)
//! - The gateway VIP configured on the TUN interface externally
//!
//! # Modules
//!
//! - [`config`]: YAML configuration types and loading
//! - [`error`]: error types
//! - [`vip`]: VIP pool
//! - [`proto`]: control-channel and sub-stream wire protocol
//! - [`tun`]: TUN device wrapper
//! - [`resolver`]: etcd-backed domain record bridge
//! - [`public_ip`]: public address discovery
//! - [`session`]: control sessions, registry, TUN routing
//! - [`forward`]: transparent TCP/UDP forwarders and the raw return path
//! - [`plugin`]: application-level proxy plugins

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod error;
pub mod forward;
pub mod plugin;
pub mod proto;
pub mod public_ip;
pub mod resolver;
pub mod session;
pub mod tun;
pub mod vip;

pub use config::{load_config, Config};
pub use error::{
    ConfigError, ForwardError, PluginError, ResolverError, SessionError, TunError, TunneldError,
    VipError,
};
pub use forward::{RawSender, TcpForward, UdpForward};
pub use session::{SessionRegistry, TunnelServer};
pub use tun::{PacketSink, TunDevice};
pub use vip::VipPool;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
