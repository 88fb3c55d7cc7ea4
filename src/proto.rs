//! Control-channel and sub-stream wire protocol
//!
//! Three encodings live here:
//!
//! - **Control frames** on the per-client control stream:
//!   `| length u16-be | cmd u8 | payload |`, where `length` counts
//!   `cmd` + `payload`. `Auth` carries UTF-8 JSON, `Data` carries one raw
//!   IPv4 packet, `Heartbeat` is empty.
//! - **Proxy-protocol header**, the first frame on every forwarder
//!   sub-stream: `| length u16-be | protocol 3 ascii | src-ip 4 |
//!   src-port u16-be | dst-ip 4 | dst-port u16-be |`. It tells the client
//!   which backend the flow belongs to.
//! - **UDP body frames** on UDP sub-streams: `| length u16-be | datagram |`,
//!   so several datagrams can ride one stream back-to-back.

use std::net::{Ipv4Addr, SocketAddrV4};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::SessionError;

/// Largest frame payload the codec will read or write
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

/// Control-frame commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    /// JSON auth exchange
    Auth = 1,
    /// One raw IPv4 packet
    Data = 2,
    /// Liveness probe/reply, empty payload
    Heartbeat = 3,
}

impl Cmd {
    /// Decode a command byte; `None` for unknown commands, which the
    /// reader loop logs and skips.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Auth),
            2 => Some(Self::Data),
            3 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// A decoded control frame; `cmd` stays raw so unknown commands can be
/// reported before being skipped.
#[derive(Debug)]
pub struct Frame {
    pub cmd: u8,
    pub payload: Vec<u8>,
}

/// Client-to-server auth request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct C2SAuth {
    /// Pre-shared key
    pub key: String,

    /// Requested domain; empty asks the server to generate one
    #[serde(default)]
    pub domain: String,

    /// Backend HTTP port to expose, 0 = none
    #[serde(default)]
    pub http: u16,

    /// Backend HTTPS port to expose, 0 = none
    #[serde(default)]
    pub https: u16,

    /// Backend gRPC port to expose, 0 = none
    #[serde(default)]
    pub grpc: u16,
}

/// Server-to-client auth reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S2CAuth {
    /// Assigned virtual IP
    pub vip: String,

    /// Pool CIDR; the client derives the gateway from it
    pub gateway: String,

    /// Registered domain
    pub domain: String,
}

/// Read one control frame.
///
/// # Errors
///
/// Returns `SessionError::Io` on transport errors (including EOF) and
/// `SessionError::Protocol` on a zero-length frame.
pub async fn read_frame<R>(r: &mut R) -> Result<Frame, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; 2];
    r.read_exact(&mut hdr).await?;
    let len = u16::from_be_bytes(hdr) as usize;
    if len == 0 {
        return Err(SessionError::Protocol("zero-length frame".into()));
    }

    let cmd = r.read_u8().await?;
    let mut payload = vec![0u8; len - 1];
    r.read_exact(&mut payload).await?;

    Ok(Frame { cmd, payload })
}

/// Write one control frame.
///
/// # Errors
///
/// Returns `SessionError::Protocol` if the payload exceeds the u16 length
/// field, `SessionError::Io` on transport errors.
pub async fn write_frame<W>(w: &mut W, cmd: Cmd, payload: &[u8]) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    let len = payload.len() + 1;
    if len > MAX_FRAME_LEN {
        return Err(SessionError::Protocol(format!(
            "frame payload too large: {} bytes",
            payload.len()
        )));
    }

    let mut buf = Vec::with_capacity(2 + len);
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.push(cmd as u8);
    buf.extend_from_slice(payload);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Flow transport advertised in the proxy-protocol header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Tcp,
    Udp,
}

impl Proto {
    const fn tag(self) -> &'static [u8; 3] {
        match self {
            Self::Tcp => b"tcp",
            Self::Udp => b"udp",
        }
    }
}

/// Proxy-protocol header, the first bytes on every forwarder sub-stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub protocol: Proto,
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

/// Encoded record length: 3-byte protocol + two (ip, port) pairs
const PROXY_HEADER_BODY_LEN: usize = 3 + 4 + 2 + 4 + 2;

impl ProxyHeader {
    #[must_use]
    pub fn new(protocol: Proto, src: SocketAddrV4, dst: SocketAddrV4) -> Self {
        Self { protocol, src, dst }
    }

    /// Encode as a length-prefixed record.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + PROXY_HEADER_BODY_LEN);
        buf.extend_from_slice(&(PROXY_HEADER_BODY_LEN as u16).to_be_bytes());
        buf.extend_from_slice(self.protocol.tag());
        buf.extend_from_slice(&self.src.ip().octets());
        buf.extend_from_slice(&self.src.port().to_be_bytes());
        buf.extend_from_slice(&self.dst.ip().octets());
        buf.extend_from_slice(&self.dst.port().to_be_bytes());
        buf
    }

    /// Decode a length-prefixed record produced by [`encode`](Self::encode).
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Protocol` on a bad length or protocol tag.
    pub fn decode(buf: &[u8]) -> Result<Self, SessionError> {
        if buf.len() != 2 + PROXY_HEADER_BODY_LEN {
            return Err(SessionError::Protocol(format!(
                "proxy header length {} (expected {})",
                buf.len(),
                2 + PROXY_HEADER_BODY_LEN
            )));
        }
        let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
        if len != PROXY_HEADER_BODY_LEN {
            return Err(SessionError::Protocol(format!(
                "proxy header body length {len}"
            )));
        }

        let protocol = match &buf[2..5] {
            b"tcp" => Proto::Tcp,
            b"udp" => Proto::Udp,
            other => {
                return Err(SessionError::Protocol(format!(
                    "unknown proxy protocol tag {other:?}"
                )))
            }
        };

        let src_ip = Ipv4Addr::new(buf[5], buf[6], buf[7], buf[8]);
        let src_port = u16::from_be_bytes([buf[9], buf[10]]);
        let dst_ip = Ipv4Addr::new(buf[11], buf[12], buf[13], buf[14]);
        let dst_port = u16::from_be_bytes([buf[15], buf[16]]);

        Ok(Self {
            protocol,
            src: SocketAddrV4::new(src_ip, src_port),
            dst: SocketAddrV4::new(dst_ip, dst_port),
        })
    }
}

/// Write one length-prefixed UDP body frame.
///
/// # Errors
///
/// Returns `SessionError::Protocol` if the datagram exceeds the u16 length
/// field, `SessionError::Io` on transport errors.
pub async fn write_udp_frame<W>(w: &mut W, datagram: &[u8]) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    if datagram.len() > MAX_FRAME_LEN {
        return Err(SessionError::Protocol(format!(
            "datagram too large: {} bytes",
            datagram.len()
        )));
    }

    let mut buf = Vec::with_capacity(2 + datagram.len());
    buf.extend_from_slice(&(datagram.len() as u16).to_be_bytes());
    buf.extend_from_slice(datagram);
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Read one length-prefixed UDP body frame.
///
/// # Errors
///
/// Returns `SessionError::Io` on transport errors (including EOF between
/// frames).
pub async fn read_udp_frame<R>(r: &mut R) -> Result<Vec<u8>, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = [0u8; 2];
    r.read_exact(&mut hdr).await?;
    let len = u16::from_be_bytes(hdr) as usize;

    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(256);

        write_frame(&mut a, Cmd::Data, b"\x45\x00packet").await.unwrap();
        let frame = read_frame(&mut b).await.unwrap();
        assert_eq!(frame.cmd, Cmd::Data as u8);
        assert_eq!(frame.payload, b"\x45\x00packet");
    }

    #[tokio::test]
    async fn test_heartbeat_frame_is_empty() {
        let (mut a, mut b) = tokio::io::duplex(16);

        write_frame(&mut a, Cmd::Heartbeat, &[]).await.unwrap();
        let frame = read_frame(&mut b).await.unwrap();
        assert_eq!(Cmd::from_u8(frame.cmd), Some(Cmd::Heartbeat));
        assert!(frame.payload.is_empty());
    }

    #[tokio::test]
    async fn test_frame_wire_layout() {
        let (mut a, mut b) = tokio::io::duplex(16);

        write_frame(&mut a, Cmd::Auth, b"{}").await.unwrap();
        let mut raw = [0u8; 5];
        b.read_exact(&mut raw).await.unwrap();
        // length counts cmd + payload
        assert_eq!(raw, [0x00, 0x03, 0x01, b'{', b'}']);
    }

    #[tokio::test]
    async fn test_eof_mid_frame() {
        let (mut a, mut b) = tokio::io::duplex(16);
        a.write_all(&[0x00, 0x05, 0x02]).await.unwrap();
        drop(a);

        assert!(matches!(
            read_frame(&mut b).await,
            Err(SessionError::Io(_))
        ));
    }

    #[test]
    fn test_unknown_cmd() {
        assert_eq!(Cmd::from_u8(0), None);
        assert_eq!(Cmd::from_u8(99), None);
        assert_eq!(Cmd::from_u8(1), Some(Cmd::Auth));
    }

    #[test]
    fn test_auth_json_defaults() {
        let auth: C2SAuth = serde_json::from_str(r#"{"key":"K"}"#).unwrap();
        assert_eq!(auth.key, "K");
        assert!(auth.domain.is_empty());
        assert_eq!(auth.http, 0);
        assert_eq!(auth.https, 0);
        assert_eq!(auth.grpc, 0);
    }

    #[test]
    fn test_proxy_header_round_trip() {
        let hdr = ProxyHeader::new(
            Proto::Udp,
            "198.51.100.7:40000".parse().unwrap(),
            "127.0.0.1:5300".parse().unwrap(),
        );
        let encoded = hdr.encode();
        assert_eq!(ProxyHeader::decode(&encoded).unwrap(), hdr);
    }

    #[test]
    fn test_proxy_header_layout() {
        // "tcp" | 203.0.113.5 | 52000 | 127.0.0.1 | 8080
        let hdr = ProxyHeader::new(
            Proto::Tcp,
            "203.0.113.5:52000".parse().unwrap(),
            "127.0.0.1:8080".parse().unwrap(),
        );
        let encoded = hdr.encode();
        assert_eq!(encoded.len(), 17);
        assert_eq!(&encoded[..2], &[0x00, 0x0f]);
        assert_eq!(&encoded[2..5], b"tcp");
        assert_eq!(&encoded[5..9], &[203, 0, 113, 5]);
        assert_eq!(&encoded[9..11], &52000u16.to_be_bytes());
        assert_eq!(&encoded[11..15], &[127, 0, 0, 1]);
        assert_eq!(&encoded[15..17], &8080u16.to_be_bytes());
    }

    #[test]
    fn test_proxy_header_rejects_garbage() {
        assert!(ProxyHeader::decode(&[0u8; 3]).is_err());

        let hdr = ProxyHeader::new(
            Proto::Tcp,
            "203.0.113.5:52000".parse().unwrap(),
            "127.0.0.1:8080".parse().unwrap(),
        );
        let mut encoded = hdr.encode();
        encoded[2..5].copy_from_slice(b"xxx");
        assert!(ProxyHeader::decode(&encoded).is_err());
    }

    #[tokio::test]
    async fn test_udp_frames_concatenate() {
        let (mut a, mut b) = tokio::io::duplex(64);

        write_udp_frame(&mut a, b"PING").await.unwrap();
        write_udp_frame(&mut a, b"PONG").await.unwrap();

        assert_eq!(read_udp_frame(&mut b).await.unwrap(), b"PING");
        assert_eq!(read_udp_frame(&mut b).await.unwrap(), b"PONG");
    }

    #[tokio::test]
    async fn test_udp_frame_layout() {
        let (mut a, mut b) = tokio::io::duplex(16);
        write_udp_frame(&mut a, b"PING").await.unwrap();

        let mut raw = [0u8; 6];
        b.read_exact(&mut raw).await.unwrap();
        assert_eq!(raw, [0x00, 0x04, b'P', b'I', b'N', b'G']);
    }
}
