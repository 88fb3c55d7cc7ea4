//! Raw-socket return path for forwarded UDP
//!
//! Replies coming back from a client must appear to originate from the
//! address the public peer originally targeted. A single `SOCK_RAW` socket
//! with `IP_HDRINCL` is opened once and shared by all return workers; each
//! reply is a fully hand-built IPv4+UDP packet whose source is the original
//! destination of the ingress datagram. The kernel serializes concurrent
//! sends.

use std::io;
use std::mem;
use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::ForwardError;

/// IPv4 header length without options
const IPV4_HEADER_LEN: usize = 20;

/// UDP header length
const UDP_HEADER_LEN: usize = 8;

/// TTL stamped on crafted return packets
const RETURN_TTL: u8 = 64;

/// Shared raw sender for spoofed-source UDP replies
pub struct RawSender {
    socket: Socket,
}

impl RawSender {
    /// Open the raw socket and enable `IP_HDRINCL`.
    ///
    /// # Errors
    ///
    /// Returns `ForwardError::PermissionDenied` without CAP_NET_RAW /
    /// CAP_NET_ADMIN, other `ForwardError` variants on socket failures.
    pub fn new() -> Result<Self, ForwardError> {
        let socket = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(libc::IPPROTO_RAW)),
        )
        .map_err(|e| {
            if e.raw_os_error() == Some(libc::EPERM) {
                ForwardError::PermissionDenied
            } else {
                ForwardError::SocketCreation(e.to_string())
            }
        })?;

        let fd = socket.as_raw_fd();
        let one: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IP,
                libc::IP_HDRINCL,
                std::ptr::addr_of!(one).cast::<libc::c_void>(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(ForwardError::socket_option(
                "IP_HDRINCL",
                io::Error::last_os_error().to_string(),
            ));
        }

        Ok(Self { socket })
    }

    /// Emit one UDP datagram with `src` spoofed as the packet source.
    ///
    /// # Errors
    ///
    /// Returns the send error; the caller logs it and the reply is lost
    /// (the session is unaffected).
    pub fn send_udp(&self, src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> io::Result<()> {
        let packet = build_udp_packet(src, dst, payload)?;
        self.socket
            .send_to(&packet, &SocketAddr::V4(dst).into())
            .map(|_| ())
    }
}

/// Build a complete IPv4+UDP packet with the header included.
///
/// The IPv4 header checksum is computed here; the UDP checksum is left
/// zero, which IPv4 permits.
pub fn build_udp_packet(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: &[u8],
) -> io::Result<Vec<u8>> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_HEADER_LEN + udp_len;
    if total_len > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "payload too large for one IPv4 packet",
        ));
    }

    let mut pkt = vec![0u8; total_len];

    // IPv4 header
    pkt[0] = 0x45; // version 4, IHL 5
    pkt[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    pkt[8] = RETURN_TTL;
    pkt[9] = libc::IPPROTO_UDP as u8;
    pkt[12..16].copy_from_slice(&src.ip().octets());
    pkt[16..20].copy_from_slice(&dst.ip().octets());
    let checksum = ipv4_header_checksum(&pkt[..IPV4_HEADER_LEN]);
    pkt[10..12].copy_from_slice(&checksum.to_be_bytes());

    // UDP header, checksum zero
    pkt[20..22].copy_from_slice(&src.port().to_be_bytes());
    pkt[22..24].copy_from_slice(&dst.port().to_be_bytes());
    pkt[24..26].copy_from_slice(&(udp_len as u16).to_be_bytes());

    pkt[28..].copy_from_slice(payload);

    Ok(pkt)
}

/// One's-complement sum over the IPv4 header with the checksum field
/// treated as zero.
fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for i in (0..header.len()).step_by(2) {
        // skip the checksum field itself
        if i == 10 {
            continue;
        }
        sum += u32::from(u16::from_be_bytes([header[i], header[i + 1]]));
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
