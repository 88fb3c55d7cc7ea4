//! Transparent TCP forwarder
//!
//! Accepts kernel-redirected TCP connections whose original destination is
//! some client's VIP, opens a sub-stream on that client's session, sends
//! the proxy-protocol header, and splices the two byte streams until
//! either side closes.

use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::socket::{bind_socket, create_transparent_tcp_socket, get_original_dst};
use super::{splice, timeout_from_secs, LOCAL_SENTINEL};
use crate::config::TcpForwardConfig;
use crate::error::ForwardError;
use crate::proto::{Proto, ProxyHeader};
use crate::session::{SessionRegistry, WRITE_TIMEOUT};

/// Accept backlog for the transparent listener
const LISTEN_BACKLOG: i32 = 1024;

/// Transparent TCP forwarder
pub struct TcpForward {
    listen: SocketAddr,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    registry: Arc<SessionRegistry>,
}

impl TcpForward {
    #[must_use]
    pub fn new(config: &TcpForwardConfig, registry: Arc<SessionRegistry>) -> Self {
        Self {
            listen: config.listen,
            read_timeout: timeout_from_secs(config.read_timeout),
            write_timeout: timeout_from_secs(config.write_timeout),
            registry,
        }
    }

    /// Bind the transparent listener.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError` on socket, option, or bind failure.
    pub fn listen(&self) -> Result<TcpListener, ForwardError> {
        let socket = create_transparent_tcp_socket()?;
        bind_socket(&socket, self.listen)?;
        socket
            .listen(LISTEN_BACKLOG)
            .map_err(|e| ForwardError::socket_option("listen", e.to_string()))?;

        // Safety: the socket is a valid listening socket we own
        let std_listener = unsafe { std::net::TcpListener::from_raw_fd(socket.into_raw_fd()) };
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| ForwardError::SocketCreation(e.to_string()))?;

        info!("transparent TCP forwarder listening on {}", self.listen);
        Ok(listener)
    }

    /// Accept redirected connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("transparent TCP accept failed: {}", e);
                    break;
                }
            };

            let forward = self.clone();
            tokio::spawn(async move {
                if let Err(e) = forward.handle_conn(stream, peer).await {
                    debug!("TCP flow from {} ended: {}", peer, e);
                }
            });
        }
    }

    /// Relay one redirected connection to the session owning its original
    /// destination.
    async fn handle_conn(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ForwardError> {
        let orig_dst = get_original_dst(stream.as_raw_fd())?;

        let SocketAddr::V4(peer_v4) = peer else {
            warn!("dropping non-IPv4 TCP flow from {}", peer);
            return Ok(());
        };

        debug!("TCP flow {} -> {} (original)", peer, orig_dst);

        let session = self
            .registry
            .get(*orig_dst.ip())
            .ok_or_else(|| ForwardError::NoRoute(orig_dst.ip().to_string()))?;

        let mut sub_stream = session
            .open_stream()
            .await
            .map_err(|e| ForwardError::SocketCreation(e.to_string()))?;

        // First bytes on the sub-stream: who this flow belongs to
        let header = ProxyHeader::new(
            Proto::Tcp,
            peer_v4,
            SocketAddrV4::new(LOCAL_SENTINEL.into(), orig_dst.port()),
        );
        timeout(WRITE_TIMEOUT, sub_stream.write_all(&header.encode()))
            .await
            .map_err(|_| {
                ForwardError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "proxy header write timed out",
                ))
            })??;

        splice(stream, sub_stream, self.read_timeout, self.write_timeout)
            .await
            .map_err(ForwardError::Io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_header_uses_local_sentinel() {
        let peer: SocketAddrV4 = "203.0.113.5:52000".parse().unwrap();
        let header = ProxyHeader::new(
            Proto::Tcp,
            peer,
            SocketAddrV4::new(LOCAL_SENTINEL.into(), 8080),
        );
        assert_eq!(*header.dst.ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(header.dst.port(), 8080);
        assert_eq!(header.src, peer);
    }

    #[test]
    fn test_timeouts_from_config() {
        let config = TcpForwardConfig {
            listen: "127.0.0.1:8884".parse().unwrap(),
            read_timeout: 0,
            write_timeout: 15,
        };
        let forward = TcpForward::new(&config, Arc::new(SessionRegistry::new()));
        assert_eq!(forward.read_timeout, None);
        assert_eq!(forward.write_timeout, Some(Duration::from_secs(15)));
    }
}
