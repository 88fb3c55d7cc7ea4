//! Transparent UDP forwarder
//!
//! Receives kernel-redirected datagrams with their original destination
//! recovered from the `IP_RECVORIGDSTADDR` control message. Each distinct
//! `(src, original dst)` 4-tuple gets its own sub-stream on the owning
//! session; datagrams ride the stream as length-prefixed body frames. A
//! per-flow return worker reads reply frames and emits them through the
//! shared raw socket with the source spoofed to the original destination,
//! so the public peer sees replies from the address it targeted.
//!
//! Flows idle longer than `udpforward.sessionTimeout` are swept in the
//! background; the next datagram on the same 4-tuple opens a fresh flow.

use std::fmt;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncWriteExt, Interest, ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_yamux::stream::StreamHandle;
use tracing::{debug, error, info, warn};

use super::raw::RawSender;
use super::socket::{bind_socket, create_transparent_udp_socket, recv_with_original_dst};
use super::LOCAL_SENTINEL;
use crate::config::UdpForwardConfig;
use crate::error::ForwardError;
use crate::proto::{self, Proto, ProxyHeader};
use crate::session::SessionRegistry;

/// Deadline for writes onto a flow's sub-stream
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Receive buffer; large enough for any UDP datagram
const RECV_BUF_SIZE: usize = 64 * 1024;

/// Canonical 4-tuple identifying one UDP flow
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Public source of the ingress datagram
    pub src: SocketAddrV4,
    /// Original destination (a session's VIP plus the service port)
    pub dst: SocketAddrV4,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.src.ip(),
            self.src.port(),
            self.dst.ip(),
            self.dst.port()
        )
    }
}

/// One live flow: the sub-stream write half and a last-touch timestamp
struct UdpFlow<W> {
    tx: Mutex<W>,
    last_seen: parking_lot::Mutex<Instant>,
    cancel: CancellationToken,
}

impl<W> UdpFlow<W> {
    fn new(tx: W) -> Self {
        Self {
            tx: Mutex::new(tx),
            last_seen: parking_lot::Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
        }
    }

    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

/// Concurrent flow table with idle sweeping
struct FlowTable<W> {
    flows: DashMap<FlowKey, Arc<UdpFlow<W>>>,
}

impl<W> FlowTable<W> {
    fn new() -> Self {
        Self {
            flows: DashMap::new(),
        }
    }

    fn get(&self, key: &FlowKey) -> Option<Arc<UdpFlow<W>>> {
        self.flows.get(key).map(|entry| entry.clone())
    }

    fn insert(&self, key: FlowKey, flow: Arc<UdpFlow<W>>) {
        self.flows.insert(key, flow);
    }

    /// Remove a flow and fire its cancellation.
    fn evict(&self, key: &FlowKey) {
        if let Some((_, flow)) = self.flows.remove(key) {
            flow.cancel.cancel();
        }
    }

    /// Remove the mapping without cancelling; used by a return worker
    /// cleaning up after itself.
    fn forget(&self, key: &FlowKey) {
        self.flows.remove(key);
    }

    /// Evict every flow idle for at least `max_idle`; returns how many.
    fn sweep(&self, max_idle: Duration) -> usize {
        let expired: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|entry| entry.value().idle() >= max_idle)
            .map(|entry| entry.key().clone())
            .collect();

        for key in &expired {
            debug!("sweeping idle UDP flow {}", key);
            self.evict(key);
        }
        expired.len()
    }

    fn len(&self) -> usize {
        self.flows.len()
    }
}

type StreamFlowTable = FlowTable<WriteHalf<StreamHandle>>;

/// Transparent UDP forwarder
pub struct UdpForward {
    listen: SocketAddr,
    session_timeout: Duration,
    registry: Arc<SessionRegistry>,
    raw: Arc<RawSender>,
    flows: Arc<StreamFlowTable>,
}

impl UdpForward {
    /// Create the forwarder, opening the shared raw return socket.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError` if the raw socket cannot be opened.
    pub fn new(
        config: &UdpForwardConfig,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self, ForwardError> {
        let raw = RawSender::new()?;

        Ok(Self {
            listen: config.listen,
            session_timeout: Duration::from_secs(config.session_timeout),
            registry,
            raw: Arc::new(raw),
            flows: Arc::new(FlowTable::new()),
        })
    }

    /// Bind the transparent UDP socket.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError` on socket, option, or bind failure.
    pub fn listen(&self) -> Result<UdpSocket, ForwardError> {
        let socket = create_transparent_udp_socket()?;
        bind_socket(&socket, self.listen)?;

        let std_socket = unsafe { std::net::UdpSocket::from_raw_fd(socket.into_raw_fd()) };
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| ForwardError::SocketCreation(e.to_string()))?;

        info!("transparent UDP forwarder listening on {}", self.listen);
        Ok(socket)
    }

    /// Receive redirected datagrams until the socket fails.
    pub async fn serve(self: Arc<Self>, socket: UdpSocket) {
        tokio::spawn(sweep_loop(self.flows.clone(), self.session_timeout));

        let fd = socket.as_raw_fd();
        let mut buf = vec![0u8; RECV_BUF_SIZE];

        loop {
            if let Err(e) = socket.readable().await {
                error!("transparent UDP socket failed: {}", e);
                break;
            }

            let received =
                socket.try_io(Interest::READABLE, || recv_with_original_dst(fd, &mut buf));

            match received {
                Ok((n, src, dst)) => {
                    self.handle_datagram(&buf[..n], src, dst).await;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(ref e) if e.kind() == io::ErrorKind::InvalidData => {
                    // No original destination on this datagram; not ours
                    warn!("dropping datagram without original destination: {}", e);
                }
                Err(e) => {
                    error!("transparent UDP recv failed: {}", e);
                }
            }
        }
    }

    /// Relay one datagram onto its flow, opening the flow first if this is
    /// the 4-tuple's first packet.
    async fn handle_datagram(&self, data: &[u8], src: SocketAddrV4, dst: SocketAddrV4) {
        let key = FlowKey { src, dst };

        let flow = match self.flows.get(&key) {
            Some(flow) => flow,
            None => match self.open_flow(&key).await {
                Ok(flow) => flow,
                Err(e) => {
                    warn!("UDP flow {} setup failed: {}", key, e);
                    return;
                }
            },
        };

        flow.touch();

        let mut tx = flow.tx.lock().await;
        let written = timeout(STREAM_WRITE_TIMEOUT, proto::write_udp_frame(&mut *tx, data)).await;
        drop(tx);

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("UDP flow {} write failed: {}", key, e);
                self.flows.evict(&key);
            }
            Err(_) => {
                warn!("UDP flow {} write timed out", key);
                self.flows.evict(&key);
            }
        }
    }

    /// Open a sub-stream for a new flow, send the proxy header, and spawn
    /// the return worker.
    async fn open_flow(&self, key: &FlowKey) -> Result<Arc<UdpFlow<WriteHalf<StreamHandle>>>, ForwardError> {
        let session = self
            .registry
            .get(*key.dst.ip())
            .ok_or_else(|| ForwardError::NoRoute(key.dst.ip().to_string()))?;

        let stream = session
            .open_stream()
            .await
            .map_err(|e| ForwardError::SocketCreation(e.to_string()))?;
        let (rx, mut tx) = tokio::io::split(stream);

        let header = ProxyHeader::new(
            Proto::Udp,
            key.src,
            SocketAddrV4::new(LOCAL_SENTINEL.into(), key.dst.port()),
        );
        timeout(STREAM_WRITE_TIMEOUT, tx.write_all(&header.encode()))
            .await
            .map_err(|_| {
                ForwardError::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "proxy header write timed out",
                ))
            })??;

        debug!("opened UDP flow {}", key);

        let flow = Arc::new(UdpFlow::new(tx));
        self.flows.insert(key.clone(), flow.clone());

        tokio::spawn(return_worker(
            rx,
            key.clone(),
            self.raw.clone(),
            self.flows.clone(),
            flow.cancel.clone(),
        ));

        Ok(flow)
    }

    /// Number of live flows
    #[must_use]
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }
}

/// Read reply frames off a flow's sub-stream and emit them via the raw
/// socket with source and destination swapped back.
async fn return_worker(
    mut rx: ReadHalf<StreamHandle>,
    key: FlowKey,
    raw: Arc<RawSender>,
    flows: Arc<StreamFlowTable>,
    cancel: CancellationToken,
) {
    loop {
        let reply = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = proto::read_udp_frame(&mut rx) => match frame {
                Ok(reply) => reply,
                Err(e) => {
                    debug!("UDP flow {} return stream closed: {}", key, e);
                    break;
                }
            },
        };

        // Source = original destination, destination = original source:
        // the public peer sees the address it sent to.
        if let Err(e) = raw.send_udp(key.dst, key.src, &reply) {
            error!("raw send for UDP flow {} failed: {}", key, e);
        }
    }

    flows.forget(&key);
}

/// Periodically sweep idle flows.
async fn sweep_loop<W>(flows: Arc<FlowTable<W>>, max_idle: Duration)
where
    W: Send + 'static,
{
    let period = max_idle.max(Duration::from_secs(1)) / 2;
    let mut tick = tokio::time::interval(period);
    tick.tick().await;

    loop {
        tick.tick().await;
        let swept = flows.sweep(max_idle);
        if swept > 0 {
            debug!("swept {} idle UDP flows", swept);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn test_key(sport: u16) -> FlowKey {
        FlowKey {
            src: SocketAddrV4::new([198, 51, 100, 7].into(), sport),
            dst: SocketAddrV4::new([100, 64, 240, 2].into(), 5300),
        }
    }

    fn test_flow() -> (Arc<UdpFlow<DuplexStream>>, DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        (Arc::new(UdpFlow::new(near)), far)
    }

    #[test]
    fn test_flow_key_canonical_form() {
        let key = test_key(40000);
        assert_eq!(key.to_string(), "198.51.100.7:40000:100.64.240.2:5300");
        assert_eq!(key, test_key(40000));
        assert_ne!(key, test_key(40001));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_idle_tracking() {
        let (flow, _rx) = test_flow();
        assert!(flow.idle() < Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(40)).await;
        assert!(flow.idle() >= Duration::from_secs(40));

        flow.touch();
        assert!(flow.idle() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_idle_flows() {
        let table: FlowTable<DuplexStream> = FlowTable::new();

        let (stale, _rx1) = test_flow();
        let stale_cancel = stale.cancel.clone();
        table.insert(test_key(1), stale);

        tokio::time::advance(Duration::from_secs(31)).await;

        let (fresh, _rx2) = test_flow();
        table.insert(test_key(2), fresh);

        let swept = table.sweep(Duration::from_secs(30));
        assert_eq!(swept, 1);
        assert_eq!(table.len(), 1);
        assert!(stale_cancel.is_cancelled());
        assert!(table.get(&test_key(1)).is_none());
        assert!(table.get(&test_key(2)).is_some());
    }

    #[tokio::test]
    async fn test_evict_cancels_flow() {
        let table: FlowTable<DuplexStream> = FlowTable::new();
        let (flow, _rx) = test_flow();
        let cancel = flow.cancel.clone();
        table.insert(test_key(9), flow);

        table.evict(&test_key(9));
        assert!(cancel.is_cancelled());
        assert!(table.get(&test_key(9)).is_none());

        // eviction of an absent key is a no-op
        table.evict(&test_key(9));
    }

    #[tokio::test]
    async fn test_forget_does_not_cancel() {
        let table: FlowTable<DuplexStream> = FlowTable::new();
        let (flow, _rx) = test_flow();
        let cancel = flow.cancel.clone();
        table.insert(test_key(3), flow);

        table.forget(&test_key(3));
        assert!(!cancel.is_cancelled());
        assert_eq!(table.len(), 0);
    }
}
