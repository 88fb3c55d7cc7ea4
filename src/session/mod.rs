//! Control-channel sessions
//!
//! Everything that lives for the duration of one connected client: the
//! auth handshake, the session state and its three control loops, and the
//! VIP-keyed registry the forwarders and the TUN reader route through.

mod registry;
mod server;
pub(crate) mod session;

pub use registry::SessionRegistry;
pub use server::{run_tun_reader, TunnelServer, AUTH_TIMEOUT};
pub use session::{
    Attachment, Session, SessionQueues, EGRESS_QUEUE_CAPACITY, HEARTBEAT_INTERVAL,
    MAX_ACTIVE_PING, READ_TIMEOUT, WRITE_TIMEOUT,
};
