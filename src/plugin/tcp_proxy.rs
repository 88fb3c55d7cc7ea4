//! Built-in TCP stream proxy plugin
//!
//! Fronts a client's advertised backend with a plain TCP listener on an
//! OS-assigned port and splices each accepted connection to the backend
//! VIP address. Serves the stream-shaped protocols (http, https, grpc);
//! protocol-aware proxies can be registered in its place.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{PluginMeta, ProxyPlugin, ProxyTuple};
use crate::error::PluginError;
use crate::forward::splice;

/// Backend dial deadline
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Plain TCP splice proxy
#[derive(Debug, Default)]
pub struct TcpProxy;

impl TcpProxy {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProxyPlugin for TcpProxy {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn protocols(&self) -> &'static [&'static str] {
        &["http", "https", "grpc"]
    }

    async fn setup(&self, _config: &str) -> Result<(), PluginError> {
        Ok(())
    }

    async fn run_proxy(&self, meta: &PluginMeta) -> Result<ProxyTuple, PluginError> {
        let listener = TcpListener::bind(&meta.from)
            .await
            .map_err(|e| PluginError::run(&meta.protocol, format!("listen {}: {e}", meta.from)))?;

        let local = listener
            .local_addr()
            .map_err(|e| PluginError::run(&meta.protocol, e.to_string()))?;

        let to_port = meta
            .to
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(|| {
                PluginError::run(&meta.protocol, format!("bad backend address {}", meta.to))
            })?;

        info!(
            "TCP proxy for {} listening on {} -> {}",
            meta.protocol, local, meta.to
        );

        tokio::spawn(accept_loop(
            listener,
            meta.to.clone(),
            meta.recycle.clone(),
        ));

        Ok(ProxyTuple {
            protocol: meta.protocol.clone(),
            from_port: local.port(),
            to_port,
        })
    }
}

async fn accept_loop(listener: TcpListener, to: String, recycle: CancellationToken) {
    loop {
        let conn = tokio::select! {
            _ = recycle.cancelled() => {
                debug!("TCP proxy for {} recycled", to);
                break;
            }
            accepted = listener.accept() => accepted,
        };

        match conn {
            Ok((stream, peer)) => {
                debug!("TCP proxy accepted {} -> {}", peer, to);
                tokio::spawn(proxy_conn(stream, to.clone(), recycle.clone()));
            }
            Err(e) => {
                error!("TCP proxy accept failed: {}", e);
                break;
            }
        }
    }
}

async fn proxy_conn(stream: TcpStream, to: String, recycle: CancellationToken) {
    let backend = match timeout(DIAL_TIMEOUT, TcpStream::connect(&to)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            error!("TCP proxy dial {} failed: {}", to, e);
            return;
        }
        Err(_) => {
            error!("TCP proxy dial {} timed out", to);
            return;
        }
    };

    tokio::select! {
        _ = recycle.cancelled() => {}
        r = splice(stream, backend, None, None) => {
            if let Err(e) = r {
                debug!("TCP proxy splice ended: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_run_proxy_rebinds_port() {
        // Backend echoes one message back
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let plugin = TcpProxy::new();
        let meta = PluginMeta::new("http", "127.0.0.1:0", backend_addr.to_string());
        let tuple = plugin.run_proxy(&meta).await.unwrap();

        assert_ne!(tuple.from_port, 0);
        assert_eq!(tuple.to_port, backend_addr.port());
        assert_eq!(tuple.protocol, "http");

        // Round-trip through the proxy
        let mut client = TcpStream::connect(("127.0.0.1", tuple.from_port))
            .await
            .unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        plugin.stop_proxy(&meta);
    }

    #[tokio::test]
    async fn test_recycle_stops_listener() {
        let plugin = TcpProxy::new();
        let meta = PluginMeta::new("http", "127.0.0.1:0", "127.0.0.1:1");
        let tuple = plugin.run_proxy(&meta).await.unwrap();

        plugin.stop_proxy(&meta);
        // The accept loop observes the recycle signal and drops the
        // listener; a subsequent connect must fail once that happens.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = TcpStream::connect(("127.0.0.1", tuple.from_port)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bad_backend_address() {
        let plugin = TcpProxy::new();
        let meta = PluginMeta::new("http", "127.0.0.1:0", "no-port-here");
        assert!(matches!(
            plugin.run_proxy(&meta).await,
            Err(PluginError::Run { .. })
        ));
    }
}
