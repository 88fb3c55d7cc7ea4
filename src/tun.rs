//! TUN device wrapper
//!
//! The daemon treats the host tunnel device as an opaque IPv4 packet pipe:
//! packets read from it are routed by destination VIP to a client session,
//! and `Data` frames received from clients are written back to it. The
//! gateway address is configured on the interface externally (ip-route
//! setup is not this daemon's job).

use std::io;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use tracing::info;
use tun_rs::{AsyncDevice, DeviceBuilder};

use crate::config::TunConfig;
use crate::error::TunError;

/// Where the session reader delivers client `Data` payloads.
///
/// `TunDevice` is the production implementation; tests substitute an
/// in-memory sink to observe what a session would have written to the
/// device.
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn send_packet(&self, pkt: &[u8]) -> io::Result<()>;
}

/// Async TUN device
pub struct TunDevice {
    dev: AsyncDevice,
    name: String,
}

impl TunDevice {
    /// Create and open the device.
    ///
    /// # Errors
    ///
    /// Returns `TunError::Open` if the device cannot be created (typically
    /// missing CAP_NET_ADMIN or an already-claimed name).
    pub fn open(config: &TunConfig) -> Result<Self, TunError> {
        let dev = DeviceBuilder::new()
            .name(&config.name)
            .mtu(config.mtu)
            .build_async()
            .map_err(|e| TunError::Open {
                name: config.name.clone(),
                reason: e.to_string(),
            })?;

        info!("TUN device {} up (mtu={})", config.name, config.mtu);

        Ok(Self {
            dev,
            name: config.name.clone(),
        })
    }

    /// Read one packet from the device.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error; the caller treats any error as
    /// fatal for the TUN-reader loop.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.dev.recv(buf).await
    }

    /// Write one packet to the device.
    ///
    /// Linux TUN writes are atomic per packet, so concurrent session
    /// readers may call this without extra serialization.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub async fn send(&self, pkt: &[u8]) -> io::Result<usize> {
        self.dev.send(pkt).await
    }

    /// Device name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl PacketSink for TunDevice {
    async fn send_packet(&self, pkt: &[u8]) -> io::Result<()> {
        self.send(pkt).await.map(|_| ())
    }
}

/// Borrowed view over a raw IPv4 packet, exposing the fields the router
/// needs
#[derive(Debug, Clone, Copy)]
pub struct Ipv4View<'a>(&'a [u8]);

impl<'a> Ipv4View<'a> {
    /// Minimum IPv4 header length
    pub const MIN_HEADER_LEN: usize = 20;

    /// Wrap a packet; `None` if it is too short to carry an IPv4 header.
    #[must_use]
    pub fn new(pkt: &'a [u8]) -> Option<Self> {
        if pkt.len() < Self::MIN_HEADER_LEN {
            return None;
        }
        Some(Self(pkt))
    }

    /// IP version field
    #[must_use]
    pub fn version(&self) -> u8 {
        self.0[0] >> 4
    }

    /// Source address
    #[must_use]
    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.0[12], self.0[13], self.0[14], self.0[15])
    }

    /// Destination address; the routing key into the session registry
    #[must_use]
    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.0[16], self.0[17], self.0[18], self.0[19])
    }
}
