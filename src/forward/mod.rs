//! Transparent TCP/UDP forwarders
//!
//! Public traffic destined for a client's VIP is redirected here by the
//! host kernel; the forwarders look up the owning session by
//! original-destination address and relay each flow over a dedicated
//! sub-stream on that session's multiplexer.

pub mod raw;
pub mod socket;
pub mod tcp;
pub mod udp;

pub use raw::RawSender;
pub use tcp::TcpForward;
pub use udp::UdpForward;

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Splice buffer size per direction
pub(crate) const SPLICE_BUF_SIZE: usize = 1500;

/// Sentinel destination in proxy headers: tells the client the flow is a
/// local delivery, selected by port alone
pub(crate) const LOCAL_SENTINEL: [u8; 4] = [127, 0, 0, 1];

/// Copy both directions between two streams until either side reaches EOF
/// or errors, then close both. Deadlines of zero-duration `None` leave the
/// splice bounded only by the peers.
pub(crate) async fn splice<A, B>(
    a: A,
    b: B,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ar, mut aw) = tokio::io::split(a);
    let (mut br, mut bw) = tokio::io::split(b);

    let forward = pipe(&mut ar, &mut bw, read_timeout, write_timeout);
    let backward = pipe(&mut br, &mut aw, read_timeout, write_timeout);
    tokio::pin!(forward, backward);

    // First direction to finish ends the splice; dropping the halves
    // closes both sockets.
    tokio::select! {
        r = &mut forward => r,
        r = &mut backward => r,
    }
}

/// One direction of a splice.
async fn pipe<R, W>(
    r: &mut R,
    w: &mut W,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; SPLICE_BUF_SIZE];
    loop {
        let n = match read_timeout {
            Some(t) => timeout(t, r.read(&mut buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "splice read timed out"))??,
            None => r.read(&mut buf).await?,
        };
        if n == 0 {
            break;
        }

        match write_timeout {
            Some(t) => timeout(t, w.write_all(&buf[..n]))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "splice write timed out"))??,
            None => w.write_all(&buf[..n]).await?,
        }
    }

    let _ = w.shutdown().await;
    Ok(())
}

/// Convert a configured timeout in seconds to an optional duration;
/// zero means unset.
pub(crate) fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_splice_moves_both_directions() {
        let (client, client_far) = tokio::io::duplex(4096);
        let (server, server_far) = tokio::io::duplex(4096);

        let splicer = tokio::spawn(splice(client_far, server_far, None, None));

        let (mut cr, mut cw) = tokio::io::split(client);
        let (mut sr, mut sw) = tokio::io::split(server);

        cw.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        sr.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        sw.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        cr.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        // Closing one side ends the splice
        cw.shutdown().await.unwrap();
        drop(cw);
        drop(cr);
        splicer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_splice_read_timeout() {
        let (_client, client_far) = tokio::io::duplex(64);
        let (_server, server_far) = tokio::io::duplex(64);

        let err = splice(
            client_far,
            server_far,
            Some(Duration::from_millis(20)),
            None,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_timeout_from_secs() {
        assert_eq!(timeout_from_secs(0), None);
        assert_eq!(timeout_from_secs(10), Some(Duration::from_secs(10)));
    }
}
