//! In-process client/server scenarios over loopback.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::access::file::{CreateTokenOptions, FileAccessManager};
use crate::access::AccessToken;
use crate::packet;
use crate::protocol::{ErrorCode, SuppressedTo};
use crate::proxy::pool::{IcmpHandle, RawSocketFactory};
use crate::server::{Server, ServerOptions};
use crate::session::client::{ClientError, ClientSession, ClientSessionOptions};
use crate::session::testing::ChannelTunAdapter;
use crate::session::SessionState;

struct DenyRawSockets;

#[async_trait::async_trait]
impl RawSocketFactory for DenyRawSockets {
    async fn open_icmp(&self, _v6: bool) -> std::io::Result<Arc<dyn IcmpHandle>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "no raw sockets in tests",
        ))
    }
}

struct TestServer {
    server: Arc<Server>,
    access: Arc<FileAccessManager>,
    shutdown: watch::Sender<bool>,
    _dir: Arc<tempfile::TempDir>,
}

impl TestServer {
    async fn start_with(dir: Arc<tempfile::TempDir>, mutate: impl FnOnce(&mut ServerOptions)) -> Self {
        let mut opts = ServerOptions {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            udp_listen_addr: Some("127.0.0.1:0".parse().unwrap()),
            cert_file: dir.path().join("cert.pem"),
            key_file: dir.path().join("key.pem"),
            host_name: "localhost".into(),
            usage_sync_interval: Duration::from_millis(200),
            cleanup_interval: Duration::from_millis(500),
            ..ServerOptions::default()
        };
        mutate(&mut opts);

        let access = Arc::new(FileAccessManager::new(dir.path().join("tokens")).unwrap());
        let server = Server::bind(opts, access.clone(), None, Arc::new(DenyRawSockets))
            .await
            .unwrap();

        let (shutdown, rx) = watch::channel(false);
        tokio::spawn(server.clone().run(rx));
        Self {
            server,
            access,
            shutdown,
            _dir: dir,
        }
    }

    async fn start() -> Self {
        Self::start_with(Arc::new(tempfile::tempdir().unwrap()), |_| {}).await
    }

    async fn mint_token(&self, mutate: impl FnOnce(&mut CreateTokenOptions)) -> AccessToken {
        let mut opts = CreateTokenOptions {
            server_endpoints: vec![self.server.local_addr()],
            host_name: "localhost".into(),
            cert_hash: self.server.cert_hash(),
            ..CreateTokenOptions::default()
        };
        mutate(&mut opts);
        self.access.create_token(opts).await.unwrap()
    }

    fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

struct TestClient {
    session: Arc<ClientSession>,
    tun_tx: mpsc::Sender<Bytes>,
    tun_rx: mpsc::Receiver<Bytes>,
}

fn fast_client_options(token: AccessToken) -> ClientSessionOptions {
    let mut opts = ClientSessionOptions::new(token);
    opts.reconnect_timeout = Duration::from_millis(600);
    opts.auto_wait_timeout = Duration::from_millis(600);
    opts.session_timeout = Duration::from_secs(30);
    opts.request_timeout = Duration::from_secs(5);
    opts.server_query_timeout = Duration::from_secs(2);
    opts.channel_refill_interval = Duration::from_millis(200);
    opts.cleanup_interval = Duration::from_millis(500);
    opts
}

async fn start_client(opts: ClientSessionOptions) -> TestClient {
    let (tun, tun_tx, tun_rx) = ChannelTunAdapter::new(false);
    let session = ClientSession::spawn(opts, tun, None, Arc::new(DenyRawSockets));
    TestClient {
        session,
        tun_tx,
        tun_rx,
    }
}

fn ping_packet(src: std::net::Ipv4Addr, dst: std::net::Ipv4Addr, seq: u16) -> Bytes {
    // 20 IP + 8 ICMP + 56 payload = the classic 84-byte ping.
    let payload = [0x5au8; 56];
    Bytes::from(
        packet::build_icmp_echo(src.into(), dst.into(), false, 0x77, seq, &payload).unwrap(),
    )
}

async fn wait_for_state(client: &TestClient, want: SessionState, within: Duration) {
    let mut rx = client.session.subscribe_state();
    tokio::time::timeout(within, async {
        loop {
            if *rx.borrow() == want {
                return;
            }
            if rx.changed().await.is_err() {
                panic!("state channel closed while waiting for {want:?}");
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"));
}

/// Sends pings until one echo reply arrives; returns the reply packet.
async fn ping_until_reply(client: &mut TestClient, within: Duration) -> Bytes {
    let (v4, _) = client.session.virtual_ips().expect("negotiated");
    let gateway: std::net::Ipv4Addr = "10.255.0.1".parse().unwrap();

    tokio::time::timeout(within, async {
        let mut seq = 0u16;
        loop {
            seq = seq.wrapping_add(1);
            let _ = client.tun_tx.send(ping_packet(v4, gateway, seq)).await;
            match tokio::time::timeout(Duration::from_millis(250), client.tun_rx.recv()).await {
                Ok(Some(reply)) => {
                    let meta = packet::parse(&reply).expect("parseable reply");
                    if meta.is_icmp_echo_reply() {
                        return reply;
                    }
                }
                _ => continue,
            }
        }
    })
    .await
    .expect("no echo reply in time")
}

#[tokio::test]
async fn happy_path_ping_and_status() {
    let server = TestServer::start().await;
    let token = server.mint_token(|_| {}).await;

    let mut client = start_client(fast_client_options(token)).await;
    client.session.connect().await.unwrap();
    assert_eq!(client.session.state(), SessionState::Connected);

    let reply = ping_until_reply(&mut client, Duration::from_secs(2)).await;
    let meta = packet::parse(&reply).unwrap();
    let (v4, _) = client.session.virtual_ips().unwrap();
    assert_eq!(meta.dst, std::net::IpAddr::V4(v4));
    assert_eq!(reply.len(), 84);

    let status = client.session.session_status().await.unwrap();
    assert!(status.traffic.sent >= 84, "{:?}", status.traffic);
    assert!(status.traffic.received >= 84, "{:?}", status.traffic);
    assert!(!status.is_udp_mode);

    client.session.close().await;
    assert_eq!(client.session.state(), SessionState::Disposed);
    server.stop();
}

#[tokio::test]
async fn udp_mode_uses_exactly_one_channel() {
    let server = TestServer::start().await;
    let token = server.mint_token(|_| {}).await;

    let mut opts = fast_client_options(token);
    opts.use_udp_channel = true;
    let mut client = start_client(opts).await;
    client.session.connect().await.unwrap();

    let _reply = ping_until_reply(&mut client, Duration::from_secs(3)).await;

    assert!(client.session.tunnel().is_udp_mode());
    assert_eq!(client.session.tunnel().channel_count(), 1);

    let status = client.session.session_status().await.unwrap();
    assert!(status.is_udp_mode);
    assert_eq!(status.packet_channel_count, 1);

    client.session.close().await;
    server.stop();
}

#[tokio::test]
async fn redirect_lands_on_the_second_server() {
    let dir = Arc::new(tempfile::tempdir().unwrap());
    let target = TestServer::start_with(dir.clone(), |_| {}).await;
    let target_addr = target.server.local_addr();
    let front =
        TestServer::start_with(dir.clone(), |o| o.redirect_to = vec![target_addr]).await;

    // The token names the redirecting front server; minted on the shared
    // storage so the target recognizes it.
    let token = target
        .mint_token(|o| o.server_endpoints = vec![front.server.local_addr()])
        .await;

    let client = start_client(fast_client_options(token)).await;
    client.session.connect().await.unwrap();

    assert_eq!(client.session.state(), SessionState::Connected);
    assert_eq!(front.server.session_count(), 0);
    assert_eq!(target.server.session_count(), 1);

    client.session.close().await;
    front.stop();
    target.stop();
}

#[tokio::test]
async fn quota_exhaustion_disposes_the_session() {
    let server = TestServer::start().await;
    // Small quota so a handful of pings trip it.
    let token = server.mint_token(|o| o.max_traffic = Some(8 * 1024)).await;

    let mut client = start_client(fast_client_options(token)).await;
    client.session.connect().await.unwrap();

    let disposed = tokio::time::timeout(Duration::from_secs(20), async {
        let (v4, _) = client.session.virtual_ips().unwrap();
        let gateway: std::net::Ipv4Addr = "10.255.0.1".parse().unwrap();
        let mut seq = 0u16;
        loop {
            seq = seq.wrapping_add(1);
            let _ = client.tun_tx.send(ping_packet(v4, gateway, seq)).await;
            while client.tun_rx.try_recv().is_ok() {}

            // The verdict lands on whatever request runs next.
            match client.session.session_status().await {
                Err(ClientError::Rejected(code)) => return code,
                _ => {}
            }
            if let Some(code) = client.session.disposed_code() {
                return code;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("quota verdict in time");

    assert_eq!(disposed, ErrorCode::AccessTrafficOverflow);
    wait_for_state(&client, SessionState::Disposed, Duration::from_secs(5)).await;
}

#[tokio::test]
async fn pause_and_resume_across_a_server_outage() {
    let dir = Arc::new(tempfile::tempdir().unwrap());
    let server = TestServer::start_with(dir.clone(), |_| {}).await;
    let addr = server.server.local_addr();
    let token = server.mint_token(|_| {}).await;

    let mut client = start_client(fast_client_options(token)).await;
    client.session.connect().await.unwrap();
    let _ = ping_until_reply(&mut client, Duration::from_secs(2)).await;

    // Kill the server for longer than the reconnect window.
    server.stop();
    drop(server);
    wait_for_state(&client, SessionState::Waiting, Duration::from_secs(10)).await;

    // Paused: TUN packets are dropped, no reply possible.
    while client.tun_rx.try_recv().is_ok() {}

    // Restart on the same address; the next packet past the pause
    // reconnects.
    let restarted =
        TestServer::start_with(dir.clone(), |o| o.listen_addr = addr).await;
    tokio::time::sleep(Duration::from_millis(700)).await;

    let (v4, _) = client.session.virtual_ips().unwrap();
    let gateway = "10.255.0.1".parse().unwrap();
    let _ = client.tun_tx.send(ping_packet(v4, gateway, 1)).await;

    wait_for_state(&client, SessionState::Connected, Duration::from_secs(10)).await;
    let _ = ping_until_reply(&mut client, Duration::from_secs(3)).await;

    client.session.close().await;
    restarted.stop();
}

#[tokio::test]
async fn duplicate_client_id_suppresses_the_older_session() {
    let server = TestServer::start().await;
    let token = server.mint_token(|o| o.max_client_count = Some(1)).await;
    let client_id = uuid::Uuid::new_v4();

    let mut first_opts = fast_client_options(token.clone());
    first_opts.client_id = client_id;
    let first = start_client(first_opts).await;
    first.session.connect().await.unwrap();
    assert_eq!(first.session.suppressed_to(), Some(SuppressedTo::None));

    let mut second_opts = fast_client_options(token);
    second_opts.client_id = client_id;
    let second = start_client(second_opts).await;
    second.session.connect().await.unwrap();

    // The newcomer is told it replaced itself.
    assert_eq!(
        second.session.suppressed_to(),
        Some(SuppressedTo::SameClient)
    );

    // The older session learns its fate on its next request and disposes.
    let verdict = first.session.session_status().await;
    match verdict {
        Err(ClientError::Rejected(ErrorCode::SessionSuppressed)) => {}
        other => panic!("expected suppression, got {other:?}"),
    }
    wait_for_state(&first, SessionState::Disposed, Duration::from_secs(5)).await;
    assert_eq!(
        first.session.disposed_code(),
        Some(ErrorCode::SessionSuppressed)
    );

    second.session.close().await;
    server.stop();
}

#[tokio::test]
async fn stream_proxy_splices_to_a_local_tcp_server() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let server = TestServer::start().await;
    let token = server.mint_token(|_| {}).await;

    let client = start_client(fast_client_options(token)).await;
    client.session.connect().await.unwrap();

    // A tiny echo server standing in for "the Internet".
    let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut s, _) = echo.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = s.read(&mut buf).await.unwrap();
        s.write_all(&buf[..n]).await.unwrap();
    });

    let mut stream = client.session.open_stream_proxy(echo_addr).await.unwrap();
    stream.write_all(b"through the tunnel").await.unwrap();
    stream.flush().await.unwrap();

    let mut got = [0u8; 18];
    tokio::time::timeout(Duration::from_secs(3), stream.read_exact(&mut got))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&got, b"through the tunnel");

    client.session.close().await;
    server.stop();
}

#[tokio::test]
async fn wrong_token_secret_is_unauthorized() {
    let server = TestServer::start().await;
    let mut token = server.mint_token(|_| {}).await;
    token.secret = crate::crypto::random_key().to_vec();

    let client = start_client(fast_client_options(token)).await;
    let err = client.session.connect().await.unwrap_err();
    match err {
        ClientError::Rejected(ErrorCode::UnauthorizedAccess) => {}
        other => panic!("expected unauthorized, got {other:?}"),
    }
    wait_for_state(&client, SessionState::Disposed, Duration::from_secs(5)).await;
    server.stop();
}
