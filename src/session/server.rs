//! Control-channel server
//!
//! Accepts client connections, wraps each in a multiplexer server
//! endpoint, runs the auth handshake, and owns the per-session scope:
//! three control loops plus exactly-once teardown. Also hosts the
//! TUN-reader loop that routes egress packets to sessions by destination
//! VIP.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_yamux::config::Config as YamuxConfig;
use tokio_yamux::Control;
use tokio_yamux::session::Session as YamuxSession;
use tracing::{debug, error, info, trace, warn};

use super::registry::SessionRegistry;
use super::session::{
    heartbeat_loop, reader_loop, writer_loop, Attachment, Session, SessionQueues, WRITE_TIMEOUT,
};
use crate::config::ServerConfig;
use crate::error::{PluginError, SessionError, TunneldError};
use crate::plugin::{self, PluginMeta};
use crate::proto::{self, C2SAuth, Cmd, S2CAuth};
use crate::resolver::Resolver;
use crate::tun::{Ipv4View, PacketSink, TunDevice};
use crate::vip::VipPool;

/// Deadline for the whole auth exchange on a fresh connection
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Alphabet for generated sub-domain labels. Digits are emitted
/// least-significant first; deployed clients decode this exact alphabet.
const ALPHABET: &[u8] = b"123456789abcdefghijklmnopqrstuvwxyz";

/// The control-channel server
pub struct TunnelServer {
    listen: SocketAddr,
    auth_key: String,
    domain_root: String,
    public_ip: Ipv4Addr,
    vip_pool: Arc<VipPool>,
    resolver: Option<Arc<Resolver>>,
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn PacketSink>,
}

impl TunnelServer {
    #[must_use]
    pub fn new(
        config: &ServerConfig,
        public_ip: Ipv4Addr,
        vip_pool: Arc<VipPool>,
        resolver: Option<Arc<Resolver>>,
        registry: Arc<SessionRegistry>,
        sink: Arc<dyn PacketSink>,
    ) -> Self {
        Self {
            listen: config.listen,
            auth_key: config.auth_key.clone(),
            domain_root: config.domain.clone(),
            public_ip,
            vip_pool,
            resolver,
            registry,
            sink,
        }
    }

    /// Accept control connections until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns the bind or accept error; both are fatal for the daemon.
    pub async fn run(self: Arc<Self>) -> Result<(), TunneldError> {
        let listener = TcpListener::bind(self.listen).await?;
        info!("control channel listening on {}", self.listen);

        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("client connected from {}", peer);
            tokio::spawn(self.clone().handle_conn(stream, peer));
        }
    }

    /// Drive one control connection from accept to teardown.
    ///
    /// The connection is wrapped in a mux server endpoint first; the
    /// client's first sub-stream carries the framed control protocol, and
    /// forwarders later open flow sub-streams from this side.
    pub async fn handle_conn<T>(self: Arc<Self>, io: T, peer: SocketAddr)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut mux = YamuxSession::new_server(io, YamuxConfig::default());
        let control = mux.control();

        let ctrl_stream = match timeout(AUTH_TIMEOUT, mux.next()).await {
            Ok(Some(Ok(stream))) => stream,
            Ok(Some(Err(e))) => {
                error!("mux failed for {} before auth: {}", peer, e);
                return;
            }
            Ok(None) => {
                error!("{} closed before auth", peer);
                return;
            }
            Err(_) => {
                error!("auth timed out for {}", peer);
                return;
            }
        };

        // The mux must keep being polled for any stream I/O to progress;
        // dropping it on exit closes the carrier connection.
        let conn_cancel = CancellationToken::new();
        let mux_task = tokio::spawn(drive_mux(mux, conn_cancel.clone()));

        let (rd, wr) = tokio::io::split(ctrl_stream);
        if let Err(e) = self.establish(rd, wr, peer, control).await {
            error!("session rejected for {}: {}", peer, e);
        }

        conn_cancel.cancel();
        let _ = mux_task.await;
    }

    /// Auth a fresh control stream, then run the session until teardown.
    /// Any failure before the session is registered releases whatever
    /// partial state was already claimed.
    async fn establish<R, W>(
        &self,
        mut rd: R,
        mut wr: W,
        peer: SocketAddr,
        control: Control,
    ) -> Result<(), TunneldError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let auth = timeout(AUTH_TIMEOUT, read_auth(&mut rd))
            .await
            .map_err(|_| SessionError::AuthTimeout)??;

        if auth.key != self.auth_key {
            return Err(SessionError::AuthRejected("key verification failed".into()).into());
        }

        let domain = if auth.domain.is_empty() {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;
            format!("{}.{}", random_domain(now), self.domain_root)
        } else {
            auth.domain.clone()
        };

        let vip = self.vip_pool.select().map_err(TunneldError::from)?;

        let reply = S2CAuth {
            vip: vip.to_string(),
            gateway: self.vip_pool.cidr(),
            domain: domain.clone(),
        };
        let payload = serde_json::to_vec(&reply)
            .map_err(|e| SessionError::Protocol(format!("encode auth reply: {e}")))?;

        let written = match timeout(WRITE_TIMEOUT, proto::write_frame(&mut wr, Cmd::Auth, &payload))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "auth reply timed out",
            ))),
        };
        if let Err(e) = written {
            self.vip_pool.release(vip);
            return Err(e.into());
        }

        if let Some(resolver) = &self.resolver {
            if let Err(e) = resolver.apply(&domain, self.public_ip).await {
                self.vip_pool.release(vip);
                return Err(e.into());
            }
        }

        let attachments = match self.attach_plugins(&auth, vip).await {
            Ok(attachments) => attachments,
            Err(e) => {
                self.retract_domain(&domain).await;
                self.vip_pool.release(vip);
                return Err(e.into());
            }
        };

        info!(
            "client {} attached: vip={} domain={}",
            peer, vip, domain
        );

        let (session, queues) = Session::new(peer, vip, domain, control, attachments);
        let session = Arc::new(session);
        self.registry.insert(session.clone());

        self.run_session(session.clone(), queues, rd, wr).await;

        // Exactly-once teardown: every loop has observed cancellation by
        // the time run_session returns.
        self.registry.remove(vip);
        self.vip_pool.release(vip);
        self.retract_domain(session.domain()).await;
        for attachment in session.attachments() {
            attachment.plugin.stop_proxy(&attachment.meta);
        }

        info!("client {} detached: vip={}", peer, vip);
        Ok(())
    }

    /// Run the three session loops; the first to exit cancels the rest.
    async fn run_session<R, W>(
        &self,
        session: Arc<Session>,
        queues: SessionQueues,
        rd: R,
        wr: W,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let cancel = session.cancel_token();
        let read_done = CancellationToken::new();

        let mut loops = JoinSet::new();
        loops.spawn(reader_loop(
            rd,
            session.clone(),
            self.sink.clone(),
            read_done.clone(),
        ));
        loops.spawn(writer_loop(wr, queues, cancel.clone()));
        loops.spawn(heartbeat_loop(session.clone(), read_done));

        loops.join_next().await;
        cancel.cancel();
        while loops.join_next().await.is_some() {}
    }

    /// Start one plugin proxy per advertised protocol. Rolls back already
    /// started proxies if a later one fails.
    async fn attach_plugins(
        &self,
        auth: &C2SAuth,
        vip: Ipv4Addr,
    ) -> Result<Vec<Attachment>, PluginError> {
        let advertised = [
            ("http", auth.http),
            ("https", auth.https),
            ("grpc", auth.grpc),
        ];

        let mut attachments: Vec<Attachment> = Vec::new();
        for (protocol, port) in advertised {
            if port == 0 {
                continue;
            }

            let plugin = plugin::lookup_protocol(protocol)
                .ok_or_else(|| PluginError::NotFound(protocol.into()))?;
            let meta = PluginMeta::new(protocol, "0.0.0.0:0", format!("{vip}:{port}"));

            match plugin.run_proxy(&meta).await {
                Ok(tuple) => {
                    info!(
                        "plugin proxy {}: public port {} -> {}",
                        protocol, tuple.from_port, meta.to
                    );
                    attachments.push(Attachment {
                        plugin,
                        meta,
                        tuple,
                    });
                }
                Err(e) => {
                    for attachment in &attachments {
                        attachment.plugin.stop_proxy(&attachment.meta);
                    }
                    return Err(e);
                }
            }
        }

        Ok(attachments)
    }

    /// Best-effort domain retraction; failures are logged, not propagated.
    async fn retract_domain(&self, domain: &str) {
        if let Some(resolver) = &self.resolver {
            if let Err(e) = resolver.retract(domain).await {
                warn!("failed to retract domain {}: {}", domain, e);
            }
        }
    }
}

/// Poll the mux session so stream I/O progresses; reject sub-streams the
/// client opens beyond the control stream.
async fn drive_mux<T>(mut mux: YamuxSession<T>, cancel: CancellationToken)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = mux.next() => match inbound {
                Some(Ok(stream)) => {
                    warn!("unexpected client-opened sub-stream; dropping");
                    drop(stream);
                }
                Some(Err(e)) => {
                    debug!("mux terminated: {}", e);
                    break;
                }
                None => break,
            },
        }
    }
    cancel.cancel();
}

/// Read and decode the client's auth frame.
async fn read_auth<R>(rd: &mut R) -> Result<C2SAuth, SessionError>
where
    R: AsyncRead + Unpin,
{
    let frame = proto::read_frame(rd).await?;
    if Cmd::from_u8(frame.cmd) != Some(Cmd::Auth) {
        return Err(SessionError::Protocol(format!(
            "expected auth frame, got cmd {}",
            frame.cmd
        )));
    }
    serde_json::from_slice(&frame.payload)
        .map_err(|e| SessionError::AuthRejected(format!("malformed auth payload: {e}")))
}

/// Generate a sub-domain label from a timestamp, least-significant digit
/// first.
fn random_domain(mut num: i64) -> String {
    let base = ALPHABET.len() as i64;
    let mut label = String::new();
    while num > 0 {
        label.push(ALPHABET[(num % base) as usize] as char);
        num /= base;
    }
    label
}

/// Read packets off the TUN device and route them to sessions by
/// destination VIP until the device fails.
pub async fn run_tun_reader(dev: Arc<TunDevice>, registry: Arc<SessionRegistry>) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = match dev.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                error!("TUN read failed: {}", e);
                break;
            }
        };
        route_packet(&registry, &buf[..n]);
    }
}

/// Route one TUN packet to the session owning its destination VIP.
/// Returns whether the packet was enqueued.
pub(crate) fn route_packet(registry: &SessionRegistry, pkt: &[u8]) -> bool {
    let Some(view) = Ipv4View::new(pkt) else {
        warn!("runt packet from TUN ({} bytes)", pkt.len());
        return false;
    };

    if view.version() != 4 {
        warn!("unsupported IP version {}", view.version());
        return false;
    }

    trace!("TUN packet {} -> {}", view.src(), view.dst());

    let Some(session) = registry.get(view.dst()) else {
        warn!("no session for VIP {}", view.dst());
        return false;
    };

    if !session.enqueue_packet(Bytes::copy_from_slice(pkt)) {
        debug!("egress queue full for {}, packet dropped", view.dst());
        return false;
    }

    true
}
