//! Auth handshake integration tests
//!
//! Drives `TunnelServer::handle_conn` over an in-memory duplex transport
//! with a real mux client endpoint on the far side, the way a dialed-in
//! client would.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_yamux::config::Config as YamuxConfig;
use tokio_yamux::session::Session as YamuxSession;
use tokio_yamux::stream::StreamHandle;

use tunneld::config::ServerConfig;
use tunneld::proto::{C2SAuth, S2CAuth};
use tunneld::session::{SessionRegistry, TunnelServer};
use tunneld::tun::PacketSink;
use tunneld::vip::VipPool;

const AUTH_KEY: &str = "integration test key";

/// Discards session Data payloads
struct NullSink;

#[async_trait::async_trait]
impl PacketSink for NullSink {
    async fn send_packet(&self, _pkt: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

struct TestHarness {
    server: Arc<TunnelServer>,
    vip_pool: Arc<VipPool>,
    registry: Arc<SessionRegistry>,
}

fn harness() -> TestHarness {
    let config = ServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        auth_key: AUTH_KEY.into(),
        domain: "tunnel.example.com".into(),
    };
    let vip_pool = Arc::new(VipPool::new("10.0.0.0/30", Ipv4Addr::new(10, 0, 0, 1)).unwrap());
    let registry = Arc::new(SessionRegistry::new());

    let server = Arc::new(TunnelServer::new(
        &config,
        Ipv4Addr::new(198, 51, 100, 1),
        vip_pool.clone(),
        None,
        registry.clone(),
        Arc::new(NullSink),
    ));

    TestHarness {
        server,
        vip_pool,
        registry,
    }
}

/// Connect a mux client over a duplex pipe to `handle_conn` and open the
/// control sub-stream.
async fn connect_client(
    server: Arc<TunnelServer>,
) -> (StreamHandle, tokio::task::JoinHandle<()>) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let peer: SocketAddr = "203.0.113.5:52000".parse().unwrap();

    let server_task = tokio::spawn(server.handle_conn(near, peer));

    let mut mux = YamuxSession::new_client(far, YamuxConfig::default());
    let mut control = mux.control();

    // client side must keep polling its mux for stream I/O to progress
    tokio::spawn(async move {
        loop {
            match mux.next().await {
                Some(Ok(_)) | Some(Err(_)) => {}
                None => break,
            }
        }
    });

    let stream = control.open_stream().await.expect("open control stream");
    (stream, server_task)
}

async fn write_auth(stream: &mut StreamHandle, auth: &C2SAuth) {
    let payload = serde_json::to_vec(auth).unwrap();
    let mut frame = Vec::with_capacity(3 + payload.len());
    frame.extend_from_slice(&((payload.len() + 1) as u16).to_be_bytes());
    frame.push(1); // Auth
    frame.extend_from_slice(&payload);
    stream.write_all(&frame).await.unwrap();
}

async fn read_auth_reply(stream: &mut StreamHandle) -> S2CAuth {
    let mut hdr = [0u8; 2];
    stream.read_exact(&mut hdr).await.unwrap();
    let len = u16::from_be_bytes(hdr) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    assert_eq!(body[0], 1, "expected an auth reply frame");
    serde_json::from_slice(&body[1..]).unwrap()
}

#[tokio::test]
async fn auth_success_assigns_vip_and_domain() {
    let harness = harness();
    let (mut stream, _server_task) = connect_client(harness.server.clone()).await;

    write_auth(
        &mut stream,
        &C2SAuth {
            key: AUTH_KEY.into(),
            ..Default::default()
        },
    )
    .await;

    let reply = timeout(Duration::from_secs(5), read_auth_reply(&mut stream))
        .await
        .expect("auth reply in time");

    // Pool 10.0.0.0/30 with gateway .1 has exactly .2 to hand out
    assert_eq!(reply.vip, "10.0.0.2");
    assert_eq!(reply.gateway, "10.0.0.0/30");
    assert!(reply.domain.ends_with(".tunnel.example.com"));
    let label = reply.domain.strip_suffix(".tunnel.example.com").unwrap();
    assert!(!label.is_empty());
    assert!(label
        .bytes()
        .all(|b| b"123456789abcdefghijklmnopqrstuvwxyz".contains(&b)));

    // Registry has exactly this session
    let vip: Ipv4Addr = reply.vip.parse().unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while harness.registry.get(vip).is_none() {
        assert!(tokio::time::Instant::now() < deadline, "session registered");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let session = harness.registry.get(vip).unwrap();
    assert_eq!(session.domain(), reply.domain);
    assert_eq!(harness.vip_pool.free_count(), 0);
}

#[tokio::test]
async fn auth_requested_domain_is_honored() {
    let harness = harness();
    let (mut stream, _server_task) = connect_client(harness.server.clone()).await;

    write_auth(
        &mut stream,
        &C2SAuth {
            key: AUTH_KEY.into(),
            domain: "mine.tunnel.example.com".into(),
            ..Default::default()
        },
    )
    .await;

    let reply = timeout(Duration::from_secs(5), read_auth_reply(&mut stream))
        .await
        .expect("auth reply in time");
    assert_eq!(reply.domain, "mine.tunnel.example.com");
}

#[tokio::test]
async fn auth_bad_key_leaves_pool_untouched() {
    let harness = harness();
    let (mut stream, server_task) = connect_client(harness.server.clone()).await;

    write_auth(
        &mut stream,
        &C2SAuth {
            key: "wrong key".into(),
            ..Default::default()
        },
    )
    .await;

    // The server rejects and closes; handle_conn returns
    timeout(Duration::from_secs(5), server_task)
        .await
        .expect("rejection in time")
        .unwrap();

    assert_eq!(harness.vip_pool.free_count(), 1);
    assert!(harness.registry.is_empty());
}

#[tokio::test]
async fn auth_vip_exhaustion_rejects_second_client() {
    let harness = harness();

    // First client claims the only VIP
    let (mut first, _first_task) = connect_client(harness.server.clone()).await;
    write_auth(
        &mut first,
        &C2SAuth {
            key: AUTH_KEY.into(),
            ..Default::default()
        },
    )
    .await;
    let reply = timeout(Duration::from_secs(5), read_auth_reply(&mut first))
        .await
        .expect("first auth in time");
    assert_eq!(reply.vip, "10.0.0.2");

    // Second client is turned away, first stays registered
    let (mut second, second_task) = connect_client(harness.server.clone()).await;
    write_auth(
        &mut second,
        &C2SAuth {
            key: AUTH_KEY.into(),
            ..Default::default()
        },
    )
    .await;
    timeout(Duration::from_secs(5), second_task)
        .await
        .expect("rejection in time")
        .unwrap();

    let vip: Ipv4Addr = "10.0.0.2".parse().unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while harness.registry.get(vip).is_none() {
        assert!(tokio::time::Instant::now() < deadline, "first session kept");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn malformed_auth_payload_is_rejected() {
    let harness = harness();
    let (mut stream, server_task) = connect_client(harness.server.clone()).await;

    // valid frame, invalid JSON
    let garbage = b"not json at all";
    let mut frame = Vec::new();
    frame.extend_from_slice(&((garbage.len() + 1) as u16).to_be_bytes());
    frame.push(1);
    frame.extend_from_slice(garbage);
    stream.write_all(&frame).await.unwrap();

    timeout(Duration::from_secs(5), server_task)
        .await
        .expect("rejection in time")
        .unwrap();

    assert_eq!(harness.vip_pool.free_count(), 1);
    assert!(harness.registry.is_empty());
}
