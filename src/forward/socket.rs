//! Transparent-proxy socket plumbing
//!
//! The forwarders rely on three Linux facilities:
//!
//! - `IP_TRANSPARENT`: lets a socket bind to and accept traffic for
//!   addresses the host does not own, which is how TPROXY-redirected flows
//!   reach the listeners.
//! - `SO_ORIGINAL_DST` / TCP: recovers where a redirected connection was
//!   actually headed.
//! - `IP_RECVORIGDSTADDR` / UDP: delivers the original destination of each
//!   datagram in a control message.
//!
//! All of this requires CAP_NET_ADMIN plus the usual TPROXY iptables and
//! routing setup (`route_localnet`, `rp_filter`, a local-delivery rule for
//! the tproxy mark).

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::error::ForwardError;

/// Linux kernel constant: `IP_TRANSPARENT` socket option (`SOL_IP` level)
pub const IP_TRANSPARENT: libc::c_int = 19;

/// Linux kernel constant: `IP_RECVORIGDSTADDR` (`SOL_IP` level)
pub const IP_RECVORIGDSTADDR: libc::c_int = 20;

/// Linux kernel constant: `SO_ORIGINAL_DST` (`SOL_IP` level)
pub const SO_ORIGINAL_DST: libc::c_int = 80;

/// Control message buffer size; enough for a `sockaddr_in` cmsg
const CMSG_BUFFER_SIZE: usize = 64;

/// Create a TCP socket with `IP_TRANSPARENT` enabled.
///
/// # Errors
///
/// Returns `ForwardError::PermissionDenied` without CAP_NET_ADMIN, other
/// `ForwardError` variants on socket failures.
pub fn create_transparent_tcp_socket() -> Result<Socket, ForwardError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ForwardError::SocketCreation(e.to_string()))?;

    set_sol_ip_flag(&socket, IP_TRANSPARENT, "IP_TRANSPARENT")?;

    socket
        .set_reuse_address(true)
        .map_err(|e| ForwardError::socket_option("SO_REUSEADDR", e.to_string()))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| ForwardError::socket_option("O_NONBLOCK", e.to_string()))?;

    debug!("Created transparent TCP socket");
    Ok(socket)
}

/// Create a UDP socket with `IP_TRANSPARENT` and `IP_RECVORIGDSTADDR`
/// enabled.
///
/// # Errors
///
/// Returns `ForwardError::PermissionDenied` without CAP_NET_ADMIN, other
/// `ForwardError` variants on socket failures.
pub fn create_transparent_udp_socket() -> Result<Socket, ForwardError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| ForwardError::SocketCreation(e.to_string()))?;

    set_sol_ip_flag(&socket, IP_TRANSPARENT, "IP_TRANSPARENT")?;
    set_sol_ip_flag(&socket, IP_RECVORIGDSTADDR, "IP_RECVORIGDSTADDR")?;

    socket
        .set_reuse_address(true)
        .map_err(|e| ForwardError::socket_option("SO_REUSEADDR", e.to_string()))?;

    socket
        .set_nonblocking(true)
        .map_err(|e| ForwardError::socket_option("O_NONBLOCK", e.to_string()))?;

    debug!("Created transparent UDP socket");
    Ok(socket)
}

/// Set an integer boolean option at `SOL_IP` level via libc.
fn set_sol_ip_flag(
    socket: &Socket,
    option: libc::c_int,
    name: &'static str,
) -> Result<(), ForwardError> {
    let fd = socket.as_raw_fd();
    let one: libc::c_int = 1;

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_IP,
            option,
            std::ptr::addr_of!(one).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            return Err(ForwardError::PermissionDenied);
        }
        return Err(ForwardError::socket_option(name, err.to_string()));
    }

    Ok(())
}

/// Recover the original destination of a redirected TCP connection.
///
/// # Errors
///
/// Returns `ForwardError::OriginalDst` if the socket carries no redirect
/// state (not a TPROXY connection) or the getsockopt fails.
pub fn get_original_dst(fd: RawFd) -> Result<SocketAddrV4, ForwardError> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_IP,
            SO_ORIGINAL_DST,
            std::ptr::addr_of_mut!(addr).cast::<libc::c_void>(),
            &mut len,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOPROTOOPT) {
            return Err(ForwardError::OriginalDst(
                "SO_ORIGINAL_DST not available; not a redirected connection?".into(),
            ));
        }
        return Err(ForwardError::OriginalDst(format!(
            "getsockopt SO_ORIGINAL_DST failed: {err}"
        )));
    }

    let port = u16::from_be(addr.sin_port);
    let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
    Ok(SocketAddrV4::new(ip, port))
}

/// Receive a datagram together with its original destination from the
/// `IP_RECVORIGDSTADDR` control message.
///
/// Returns `(bytes_received, source, original_destination)`. Call only
/// after the socket reported readable; a `WouldBlock` error means the
/// wakeup was spurious and the caller should retry.
#[allow(clippy::cast_sign_loss)] // n is checked non-negative
pub fn recv_with_original_dst(
    fd: RawFd,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddrV4, SocketAddrV4)> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };

    let mut src_addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut cmsg_buf = [0u8; CMSG_BUFFER_SIZE];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(src_addr).cast::<libc::c_void>();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    msg.msg_iov = std::ptr::addr_of_mut!(iov);
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = CMSG_BUFFER_SIZE;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    // A truncated control message means the original destination may be
    // missing or corrupt; treat as undeliverable.
    if (msg.msg_flags & libc::MSG_CTRUNC) != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "control message truncated (MSG_CTRUNC)",
        ));
    }

    let src = SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(src_addr.sin_addr.s_addr)),
        u16::from_be(src_addr.sin_port),
    );

    let mut original_dst: Option<SocketAddrV4> = None;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let cmsg_ref = unsafe { &*cmsg };
        if cmsg_ref.cmsg_level == libc::SOL_IP && cmsg_ref.cmsg_type == IP_RECVORIGDSTADDR {
            let addr_ptr = unsafe { libc::CMSG_DATA(cmsg) }.cast::<libc::sockaddr_in>();
            let addr = unsafe { addr_ptr.read_unaligned() };
            original_dst = Some(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                u16::from_be(addr.sin_port),
            ));
            break;
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    let dst = original_dst.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            "original destination not found in cmsg",
        )
    })?;

    Ok((n as usize, src, dst))
}

/// Bind a transparent socket to `addr`.
///
/// # Errors
///
/// Returns `ForwardError::BindError` on failure.
pub fn bind_socket(socket: &Socket, addr: SocketAddr) -> Result<(), ForwardError> {
    socket
        .bind(&addr.into())
        .map_err(|e| ForwardError::bind(addr, e.to_string()))
}

/// Check if running as root (effective UID = 0).
#[must_use]
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}
