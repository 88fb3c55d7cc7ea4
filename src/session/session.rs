//! Per-client session state and the three control loops
//!
//! A session owns one authenticated client. Three cooperating loops share
//! its control stream:
//!
//! - **reader**: parses inbound control frames under a per-read deadline;
//!   heartbeat replies decrement the active-ping counter, `Data` payloads
//!   go to the TUN device.
//! - **writer**: the only writer on the stream; drains heartbeat ticks and
//!   egress packets with equal priority under a per-write deadline.
//! - **heartbeat**: ticks every [`HEARTBEAT_INTERVAL`]; declares the
//!   session dead once [`MAX_ACTIVE_PING`] probes go unanswered.
//!
//! Any loop exiting cancels the session token; the owning scope in
//! `server.rs` then runs teardown exactly once.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_yamux::Control;
use tokio_yamux::stream::StreamHandle;
use tracing::{debug, error, warn};

use crate::plugin::{PluginMeta, ProxyPlugin, ProxyTuple};
use crate::proto::{self, Cmd};
use crate::tun::PacketSink;

/// Deadline for one control-frame read
pub const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for one control-frame write
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Heartbeat probe interval
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Unanswered probes before the session is declared dead
pub const MAX_ACTIVE_PING: i32 = 3;

/// Egress queue depth; the TUN reader drops packets beyond this
pub const EGRESS_QUEUE_CAPACITY: usize = 128;

/// A plugin proxy attached to this session
pub struct Attachment {
    pub plugin: Arc<dyn ProxyPlugin>,
    pub meta: PluginMeta,
    pub tuple: ProxyTuple,
}

/// One connected client
pub struct Session {
    remote_addr: SocketAddr,
    vip: Ipv4Addr,
    domain: String,

    /// Probes sent minus replies received; updated by heartbeat/reader
    active_ping: AtomicI32,

    /// Single-slot heartbeat tick queue into the writer
    hb_tx: mpsc::Sender<()>,

    /// Bounded egress packet queue into the writer
    egress_tx: mpsc::Sender<Bytes>,

    /// Mux control handle; forwarders open flow sub-streams through it
    control: Control,

    /// Cancelled by whichever loop exits first; observed by all
    cancel: CancellationToken,

    /// Plugin proxies started on attach, stopped on teardown
    attachments: Vec<Attachment>,
}

/// Writer-side receive ends, consumed by the writer loop
pub struct SessionQueues {
    pub hb_rx: mpsc::Receiver<()>,
    pub egress_rx: mpsc::Receiver<Bytes>,
}

impl Session {
    /// Create a session and its writer-side queue ends.
    #[must_use]
    pub fn new(
        remote_addr: SocketAddr,
        vip: Ipv4Addr,
        domain: String,
        control: Control,
        attachments: Vec<Attachment>,
    ) -> (Self, SessionQueues) {
        let (hb_tx, hb_rx) = mpsc::channel(1);
        let (egress_tx, egress_rx) = mpsc::channel(EGRESS_QUEUE_CAPACITY);

        let session = Self {
            remote_addr,
            vip,
            domain,
            active_ping: AtomicI32::new(0),
            hb_tx,
            egress_tx,
            control,
            cancel: CancellationToken::new(),
            attachments,
        };

        (session, SessionQueues { hb_rx, egress_rx })
    }

    /// Client's address on the control connection
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Assigned VIP
    #[must_use]
    pub fn vip(&self) -> Ipv4Addr {
        self.vip
    }

    /// Registered domain
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Session cancellation token
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Plugin proxies attached to this session
    #[must_use]
    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// Queue an egress packet for the writer loop. Non-blocking: returns
    /// `false` and drops the packet when the queue is full, keeping the
    /// TUN reader live (IP retransmits above us).
    pub fn enqueue_packet(&self, pkt: Bytes) -> bool {
        match self.egress_tx.try_send(pkt) {
            Ok(()) => true,
            Err(_) => false,
        }
    }

    /// Open a new sub-stream on the session's multiplexer.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::OpenStream` when the mux is gone or refuses.
    pub async fn open_stream(&self) -> Result<StreamHandle, crate::error::SessionError> {
        let mut control = self.control.clone();
        control
            .open_stream()
            .await
            .map_err(|e| crate::error::SessionError::OpenStream(e.to_string()))
    }

    /// Current probes-outstanding count
    #[must_use]
    pub fn active_ping(&self) -> i32 {
        self.active_ping.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn set_active_ping(&self, value: i32) {
        self.active_ping.store(value, Ordering::SeqCst);
    }

    /// Test constructor backed by an unpolled in-memory mux.
    #[cfg(test)]
    pub(crate) fn for_tests(vip: Ipv4Addr) -> (Self, TestHandles) {
        use tokio_yamux::config::Config;
        use tokio_yamux::session::Session as YamuxSession;

        let (near, far) = tokio::io::duplex(4096);
        let mut mux = YamuxSession::new_server(near, Config::default());
        let control = mux.control();

        let (session, queues) = Self::new(
            "203.0.113.5:52000".parse().unwrap(),
            vip,
            "test.tunnel.example.com".into(),
            control,
            Vec::new(),
        );

        (
            session,
            TestHandles {
                queues,
                _mux: mux,
                _far: far,
            },
        )
    }
}

/// Keeps the test mux and its far end alive alongside the queues
#[cfg(test)]
pub(crate) struct TestHandles {
    pub queues: SessionQueues,
    _mux: tokio_yamux::session::Session<tokio::io::DuplexStream>,
    _far: tokio::io::DuplexStream,
}

/// Reader loop: parse control frames until error, deadline, or cancel.
/// Signals completion through the `read_done` latch.
pub(crate) async fn reader_loop<R, S>(
    mut rd: R,
    session: Arc<Session>,
    sink: Arc<S>,
    read_done: CancellationToken,
) where
    R: AsyncRead + Unpin,
    S: PacketSink + ?Sized,
{
    let cancel = session.cancel_token();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            read = timeout(READ_TIMEOUT, proto::read_frame(&mut rd)) => match read {
                Err(_) => {
                    warn!("control read timed out for {}", session.remote_addr());
                    break;
                }
                Ok(Err(e)) => {
                    debug!("control read failed for {}: {}", session.remote_addr(), e);
                    break;
                }
                Ok(Ok(frame)) => frame,
            },
        };

        match Cmd::from_u8(frame.cmd) {
            Some(Cmd::Heartbeat) => {
                session.active_ping.fetch_sub(1, Ordering::SeqCst);
            }
            Some(Cmd::Data) => {
                if let Err(e) = sink.send_packet(&frame.payload).await {
                    error!("TUN write failed: {}", e);
                }
            }
            Some(Cmd::Auth) | None => {
                warn!(
                    "unsupported cmd {} from {}",
                    frame.cmd,
                    session.remote_addr()
                );
            }
        }
    }

    read_done.cancel();
}

/// Writer loop: sole writer on the control stream. Drains heartbeat ticks
/// and egress packets with equal priority; exits on cancel or write error.
pub(crate) async fn writer_loop<W>(mut wr: W, queues: SessionQueues, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    let SessionQueues {
        mut hb_rx,
        mut egress_rx,
    } = queues;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            tick = hb_rx.recv() => {
                if tick.is_none() {
                    break;
                }
                if let Err(e) = write_frame_deadline(&mut wr, Cmd::Heartbeat, &[]).await {
                    debug!("heartbeat write failed: {}", e);
                    break;
                }
            }
            pkt = egress_rx.recv() => {
                let Some(pkt) = pkt else { break };
                if let Err(e) = write_frame_deadline(&mut wr, Cmd::Data, &pkt).await {
                    debug!("data write failed: {}", e);
                    break;
                }
            }
        }
    }
}

async fn write_frame_deadline<W>(
    wr: &mut W,
    cmd: Cmd,
    payload: &[u8],
) -> Result<(), crate::error::SessionError>
where
    W: AsyncWrite + Unpin,
{
    timeout(WRITE_TIMEOUT, proto::write_frame(wr, cmd, payload))
        .await
        .map_err(|_| {
            crate::error::SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "control write timed out",
            ))
        })?
}

/// Heartbeat loop: probe the client every tick; give up after
/// [`MAX_ACTIVE_PING`] unanswered probes. Exits when the reader latch or
/// the session token fires.
pub(crate) async fn heartbeat_loop(session: Arc<Session>, read_done: CancellationToken) {
    let cancel = session.cancel_token();
    let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
    // interval's first tick completes immediately; consume it so probes
    // start one full period after establishment
    tick.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = read_done.cancelled() => return,
            _ = tick.tick() => {}
        }

        if session.active_ping.load(Ordering::SeqCst) >= MAX_ACTIVE_PING {
            warn!("heartbeat timeout for {}", session.remote_addr());
            return;
        }

        // Single-slot queue: a pending tick means the writer is behind,
        // skip this probe rather than block
        if session.hb_tx.try_send(()).is_ok() {
            session.active_ping.fetch_add(1, Ordering::SeqCst);
        }
    }
}
