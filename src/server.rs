use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use futures_util::StreamExt;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::access::AccessManager;
use crate::crypto;
use crate::net::BoxedStream;
use crate::protocol::{
    self, AdRequirement, ByeRequest, ErrorCode, HelloRequest, HelloResponse, OpCode,
    RewardedAdRequest, SessionRequest, SessionResponse, SessionStatusRequest, StreamProxyRequest,
    SuppressedTo, TcpPacketChannelRequest, Traffic, UdpChannelRequest, UdpChannelResponse,
    PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN,
};
use crate::proxy::channel as proxy_channel;
use crate::proxy::pool::RawSocketFactory;
use crate::reporter::EventKind;
use crate::session::TunAdapter;
use crate::session::server::{ServerSession, ServerSessionOptions, ServerSessionParams};
use crate::tunnel::udp::UdpChannelHub;

const SNI_PEEK_TIMEOUT: Duration = Duration::from_millis(500);
const SNI_PEEK_MAX: usize = 16 * 1024;

#[derive(Clone)]
pub struct ServerOptions {
    pub listen_addr: SocketAddr,
    /// `None` disables the UDP channel entirely.
    pub udp_listen_addr: Option<SocketAddr>,
    /// PEM certificate/key; generated self-signed on first start when absent.
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub host_name: String,
    pub gateway_ip_v4: Ipv4Addr,
    pub gateway_ip_v6: Ipv6Addr,
    pub mtu: u16,
    pub is_ipv6_supported: bool,
    pub dns_servers: Vec<IpAddr>,
    /// Answer every hello with these endpoints instead of serving.
    pub redirect_to: Vec<SocketAddr>,
    pub cleanup_interval: Duration,
    pub usage_sync_interval: Duration,
    pub connect_timeout: Duration,
    pub session: ServerSessionOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:443".parse().expect("valid addr"),
            udp_listen_addr: Some("0.0.0.0:0".parse().expect("valid addr")),
            cert_file: PathBuf::from("shroud-cert.pem"),
            key_file: PathBuf::from("shroud-key.pem"),
            host_name: "shroud".into(),
            gateway_ip_v4: Ipv4Addr::new(10, 255, 0, 1),
            gateway_ip_v6: "fd12::1".parse().expect("valid addr"),
            mtu: 1500,
            is_ipv6_supported: false,
            dns_servers: vec!["8.8.8.8".parse().expect("valid"), "1.1.1.1".parse().expect("valid")],
            redirect_to: Vec::new(),
            cleanup_interval: Duration::from_secs(30),
            usage_sync_interval: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            session: ServerSessionOptions::default(),
        }
    }
}

/// The server: terminates control connections, authenticates hellos against
/// the access manager, and owns every live [`ServerSession`].
pub struct Server {
    opts: ServerOptions,
    access: Arc<dyn AccessManager>,
    tun: Option<Arc<dyn TunAdapter>>,
    raw: Arc<dyn RawSocketFactory>,
    acceptor: TlsAcceptor,
    cert_hash: Vec<u8>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    udp_hub: Option<Arc<UdpChannelHub>>,
    sessions: DashMap<u64, Arc<ServerSession>>,
    by_virtual_ip: DashMap<IpAddr, u64>,
    /// Retired sessions keep answering with their final verdict.
    dead: DashMap<u64, (ErrorCode, SuppressedTo)>,
    next_host: AtomicU32,
}

impl Server {
    pub async fn bind(
        opts: ServerOptions,
        access: Arc<dyn AccessManager>,
        tun: Option<Arc<dyn TunAdapter>>,
        raw: Arc<dyn RawSocketFactory>,
    ) -> anyhow::Result<Arc<Self>> {
        let (certs, key) = load_or_generate_identity(&opts.cert_file, &opts.key_file, &opts.host_name)?;
        let cert_hash = crypto::cert_hash(certs[0].as_ref()).to_vec();

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let mut tls = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .context("tls: protocol versions")?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .context("tls: certificate")?;
        tls.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(tls));

        // Reuse-addr so a restart can reclaim the port immediately.
        let socket = if opts.listen_addr.is_ipv4() {
            tokio::net::TcpSocket::new_v4()
        } else {
            tokio::net::TcpSocket::new_v6()
        }
        .context("create listen socket")?;
        socket.set_reuseaddr(true).context("set reuseaddr")?;
        socket
            .bind(opts.listen_addr)
            .with_context(|| format!("bind {}", opts.listen_addr))?;
        let listener = socket.listen(1024).context("listen")?;
        let local_addr = listener.local_addr().context("listener addr")?;

        let udp_hub = match opts.udp_listen_addr {
            Some(addr) => Some(UdpChannelHub::bind(addr).await.context("bind udp")?),
            None => None,
        };

        Ok(Arc::new(Self {
            opts,
            access,
            tun,
            raw,
            acceptor,
            cert_hash,
            listener: Mutex::new(Some(listener)),
            local_addr,
            udp_hub,
            sessions: DashMap::new(),
            by_virtual_ip: DashMap::new(),
            dead: DashMap::new(),
            next_host: AtomicU32::new(2),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn udp_port(&self) -> Option<u16> {
        self.udp_hub.as_ref().and_then(|h| h.local_port())
    }

    /// SHA-256 of the server certificate, for token pinning.
    pub fn cert_hash(&self) -> Vec<u8> {
        self.cert_hash.clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = self
            .listener
            .lock()
            .expect("listener poisoned")
            .take()
            .context("server already running")?;

        if let Some(hub) = &self.udp_hub {
            tokio::spawn(hub.clone().run(shutdown.clone()));
        }
        if self.tun.is_some() {
            tokio::spawn(self.clone().tun_router(shutdown.clone()));
        }
        tokio::spawn(self.clone().maintenance_loop(shutdown.clone()));

        tracing::info!(addr = %self.local_addr, udp_port = ?self.udp_port(), "server listening");

        let mut shutdown_rx = shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (tcp, peer) = accepted?;
                    let server = self.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = server.handle_connection(tcp, peer, shutdown).await {
                            tracing::debug!(peer = %peer, err = %err, "connection ended");
                        }
                    });
                }
            }
        }

        for entry in self.sessions.iter() {
            entry.value().dispose(ErrorCode::SessionClosed, SuppressedTo::None);
        }
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        tcp: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let _ = tcp.set_nodelay(true);
        let tls = self.acceptor.accept(tcp).await.context("tls accept")?;

        let mut session = tokio_yamux::Session::new_server(tls, tokio_yamux::Config::default());
        let mut control = session.control();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = control.close().await;
                        break;
                    }
                }
                next = session.next() => {
                    let Some(next) = next else { break };
                    let Ok(stream) = next else { break };
                    let server = self.clone();
                    tokio::spawn(async move {
                        let mut stream: BoxedStream = Box::new(stream);
                        if let Err(err) = server.handle_stream(&mut stream, peer).await {
                            tracing::debug!(peer = %peer, err = %err, "request stream failed");
                        }
                    });
                }
            }
        }
        Ok(())
    }

    async fn handle_stream(
        self: &Arc<Self>,
        stream: &mut BoxedStream,
        peer: SocketAddr,
    ) -> anyhow::Result<()> {
        let (op, body) = protocol::read_request_frame(stream).await?;
        match op {
            OpCode::Hello => {
                let hello: HelloRequest = protocol::parse_body(&body)?;
                let resp = self.handle_hello(&hello, peer).await;
                protocol::write_response(stream, &resp).await?;
            }
            OpCode::Bye => {
                let req: ByeRequest = protocol::parse_body(&body)?;
                let resp = match self.find_session(&req.session) {
                    Ok(session) => {
                        self.retire_session(&session, ErrorCode::SessionClosed, SuppressedTo::None)
                            .await;
                        SessionResponse::ok()
                    }
                    Err(resp) => resp,
                };
                protocol::write_response(stream, &resp).await?;
            }
            OpCode::SessionStatus => {
                let req: SessionStatusRequest = protocol::parse_body(&body)?;
                match self.find_session(&req.session) {
                    Ok(session) => {
                        protocol::write_response(stream, &session.status()).await?;
                    }
                    Err(resp) => protocol::write_response(stream, &resp).await?,
                }
            }
            OpCode::RewardedAd => {
                let req: RewardedAdRequest = protocol::parse_body(&body)?;
                let resp = match self.find_session(&req.session) {
                    Ok(session) => {
                        match self
                            .access
                            .session_add_usage(session.session_id, Traffic::default(), Some(&req.ad_data))
                            .await
                        {
                            Ok((ErrorCode::Ok, usage)) => {
                                session.clear_ad_pending();
                                SessionResponse {
                                    access_usage: Some(usage),
                                    ..SessionResponse::ok()
                                }
                            }
                            Ok((code, _)) => SessionResponse::error(code, "ad rejected"),
                            Err(err) => SessionResponse::error(ErrorCode::AccessError, err.to_string()),
                        }
                    }
                    Err(resp) => resp,
                };
                protocol::write_response(stream, &resp).await?;
            }
            OpCode::TcpPacketChannel => {
                let req: TcpPacketChannelRequest = protocol::parse_body(&body)?;
                match self.find_session(&req.session) {
                    Ok(session) => {
                        protocol::write_response(stream, &SessionResponse::ok()).await?;
                        let id = format!("tcp:{}:{}", session.session_id, peer);
                        let taken = std::mem::replace(stream, Box::new(tokio::io::empty()));
                        if let Err(err) = session.attach_stream_channel(id, taken) {
                            session
                                .reporter()
                                .report(EventKind::ChannelClosed, &err.to_string());
                        }
                    }
                    Err(resp) => protocol::write_response(stream, &resp).await?,
                }
            }
            OpCode::StreamProxy => {
                let req: StreamProxyRequest = protocol::parse_body(&body)?;
                match self.find_session(&req.session) {
                    Ok(session) => {
                        self.handle_stream_proxy(&session, req.destination, stream)
                            .await?;
                    }
                    Err(resp) => protocol::write_response(stream, &resp).await?,
                }
            }
            OpCode::UdpPacket => {
                let req: UdpChannelRequest = protocol::parse_body(&body)?;
                let resp = match self.find_session(&req.session) {
                    Ok(session) => match &self.udp_hub {
                        Some(hub) => {
                            if let Err(err) = session.attach_udp_channel(hub) {
                                UdpChannelResponse {
                                    base: SessionResponse::error(
                                        ErrorCode::GeneralError,
                                        err.to_string(),
                                    ),
                                    udp_port: None,
                                }
                            } else {
                                UdpChannelResponse {
                                    base: SessionResponse::ok(),
                                    udp_port: hub.local_port(),
                                }
                            }
                        }
                        None => UdpChannelResponse {
                            base: SessionResponse::error(
                                ErrorCode::GeneralError,
                                "udp channel disabled",
                            ),
                            udp_port: None,
                        },
                    },
                    Err(resp) => UdpChannelResponse {
                        base: resp,
                        udp_port: None,
                    },
                };
                protocol::write_response(stream, &resp).await?;
            }
        }
        Ok(())
    }

    async fn handle_hello(self: &Arc<Self>, hello: &HelloRequest, peer: SocketAddr) -> HelloResponse {
        let reject = |code: ErrorCode, msg: &str| HelloResponse {
            base: SessionResponse::error(code, msg),
            ..empty_hello_response()
        };

        if !self.opts.redirect_to.is_empty() {
            if !hello.allow_redirect {
                return reject(ErrorCode::GeneralError, "redirect required");
            }
            return HelloResponse {
                base: SessionResponse {
                    error_code: ErrorCode::RedirectHost,
                    redirect_endpoints: self.opts.redirect_to.clone(),
                    ..SessionResponse::default()
                },
                ..empty_hello_response()
            };
        }

        let proto_min = PROTOCOL_VERSION_MIN.max(hello.client_info.min_protocol_version);
        let proto_max = PROTOCOL_VERSION_MAX.min(hello.client_info.max_protocol_version);
        if proto_min > proto_max {
            return reject(ErrorCode::GeneralError, "no protocol version overlap");
        }

        let decision = match self.access.session_add(hello).await {
            Ok(d) => d,
            Err(err) => return reject(ErrorCode::AccessError, &err.to_string()),
        };
        if decision.error_code != ErrorCode::Ok {
            return HelloResponse {
                base: SessionResponse {
                    error_code: decision.error_code,
                    error_message: decision.error_message,
                    ..SessionResponse::default()
                },
                ..empty_hello_response()
            };
        }

        for sid in &decision.suppress_session_ids {
            if let Some((_, old)) = self.sessions.remove(sid) {
                self.finalize_session(&old, ErrorCode::SessionSuppressed, SuppressedTo::Other)
                    .await;
            }
        }

        let host = self.next_host.fetch_add(1, Ordering::Relaxed);
        let virtual_ip_v4 = offset_v4(self.opts.gateway_ip_v4, host);
        let virtual_ip_v6 = offset_v6(self.opts.gateway_ip_v6, host);

        let session = ServerSession::spawn(
            ServerSessionParams {
                session_id: decision.session_id,
                session_key: crypto::random_key().to_vec(),
                server_secret: crypto::random_key().to_vec(),
                client_id: hello.client_id,
                token_id: hello.token_id.clone(),
                virtual_ip_v4,
                virtual_ip_v6,
                gateway_ip_v4: self.opts.gateway_ip_v4,
                gateway_ip_v6: self.opts.gateway_ip_v6,
                expiration: decision.expiration,
                ad_pending: decision.ad_requirement == AdRequirement::Rewarded,
            },
            self.opts.session.clone(),
            self.tun.clone(),
            self.raw.clone(),
        );

        self.sessions.insert(session.session_id, session.clone());
        self.by_virtual_ip
            .insert(IpAddr::V4(virtual_ip_v4), session.session_id);
        self.by_virtual_ip
            .insert(IpAddr::V6(virtual_ip_v6), session.session_id);

        tracing::info!(
            session = session.session_id,
            client = %hello.client_id,
            peer = %peer,
            "session established"
        );

        HelloResponse {
            base: SessionResponse {
                suppressed_to: decision.suppressed_to,
                access_usage: Some(decision.access_usage),
                ..SessionResponse::ok()
            },
            session_id: session.session_id,
            session_key: session.hello_key(),
            server_secret: session.server_secret().to_vec(),
            protocol_version: proto_max,
            udp_port: self.udp_port(),
            virtual_ip_v4,
            virtual_ip_v6,
            mtu: self.opts.mtu,
            max_packet_channel_count: self.opts.session.max_packet_channel_count,
            include_ip_ranges: Vec::new(),
            vpn_adapter_include_ip_ranges: Vec::new(),
            dns_servers: self.opts.dns_servers.clone(),
            client_public_address: Some(peer.ip()),
            ad_requirement: decision.ad_requirement,
            access_usage: decision.access_usage,
        }
    }

    async fn handle_stream_proxy(
        self: &Arc<Self>,
        session: &Arc<ServerSession>,
        destination: SocketAddr,
        stream: &mut BoxedStream,
    ) -> anyhow::Result<()> {
        if !session.check_net_scan(destination) {
            protocol::write_response(stream, &SessionResponse::error(ErrorCode::GeneralError, "net scan"))
                .await?;
            return Ok(());
        }
        let permit = match session.begin_stream_proxy() {
            Ok(p) => p,
            Err(code) => {
                protocol::write_response(stream, &SessionResponse::error(code, "limit")).await?;
                return Ok(());
            }
        };

        protocol::write_response(stream, &SessionResponse::ok()).await?;

        // Single TLS SNI peek for domain filtering; no deeper L7 parsing.
        let mut initial = Vec::new();
        if destination.port() == 443 && session.has_blocked_domains() {
            let mut buf = vec![0u8; SNI_PEEK_MAX];
            if let Ok(Ok(n)) =
                tokio::time::timeout(SNI_PEEK_TIMEOUT, stream.read(&mut buf)).await
            {
                initial.extend_from_slice(&buf[..n]);
                if let Some(sni) = peek_sni(&initial) {
                    if session.is_domain_blocked(&sni) {
                        session
                            .reporter()
                            .report(EventKind::NetFilter, &format!("blocked domain {sni}"));
                        return Ok(());
                    }
                }
            }
        }

        let downstream =
            tokio::time::timeout(self.opts.connect_timeout, TcpStream::connect(destination)).await;
        let mut downstream = match downstream {
            Ok(Ok(s)) => s,
            _ => {
                // The ok response is already on the wire; closing the stream
                // is the failure signal, as with any mid-flight TCP error.
                return Ok(());
            }
        };
        let _ = downstream.set_nodelay(true);
        if !initial.is_empty() {
            downstream.write_all(&initial).await?;
        }

        let guard = permit.connected();
        let taken = std::mem::replace(stream, Box::new(tokio::io::empty()));
        let traffic = proxy_channel::splice(
            taken,
            downstream,
            self.opts.session.tcp_buffer_size,
        )
        .await;
        session.add_proxy_traffic(Traffic {
            sent: traffic.sent + initial.len() as u64,
            received: traffic.received,
        });
        drop(guard);
        Ok(())
    }

    fn find_session(&self, req: &SessionRequest) -> Result<Arc<ServerSession>, SessionResponse> {
        if let Some((code, suppressed_to)) = self.dead.get(&req.session_id).map(|e| *e.value()) {
            return Err(SessionResponse {
                error_code: code,
                suppressed_to,
                ..SessionResponse::default()
            });
        }
        let Some(session) = self.sessions.get(&req.session_id).map(|e| e.value().clone()) else {
            return Err(SessionResponse::error(
                ErrorCode::SessionClosed,
                "session not found",
            ));
        };
        if !session.validate_key(&req.session_key) {
            return Err(SessionResponse::error(
                ErrorCode::UnauthorizedAccess,
                "bad session key",
            ));
        }
        Ok(session)
    }

    /// Removes the session from the live map and disposes it.
    async fn retire_session(
        &self,
        session: &Arc<ServerSession>,
        code: ErrorCode,
        suppressed_to: SuppressedTo,
    ) {
        self.sessions.remove(&session.session_id);
        self.finalize_session(session, code, suppressed_to).await;
    }

    async fn finalize_session(
        &self,
        session: &Arc<ServerSession>,
        code: ErrorCode,
        suppressed_to: SuppressedTo,
    ) {
        if !session.dispose(code, suppressed_to) {
            return;
        }
        self.dead.insert(session.session_id, (code, suppressed_to));
        self.by_virtual_ip
            .remove(&IpAddr::V4(session.virtual_ip_v4));
        self.by_virtual_ip
            .remove(&IpAddr::V6(session.virtual_ip_v6));
        if let Some(hub) = &self.udp_hub {
            hub.remove_channel(session.session_id);
        }
        let final_traffic = session.take_traffic_delta();
        if let Err(err) = self
            .access
            .session_close(session.session_id, final_traffic)
            .await
        {
            tracing::warn!(session = session.session_id, err = %err, "session close report failed");
        }
    }

    /// Shared TUN: replies coming back from the Internet are routed to the
    /// owning session by destination virtual address.
    async fn tun_router(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(tun) = self.tun.clone() else { return };
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                pkt = tun.read_packet() => {
                    let Ok(pkt) = pkt else { break };
                    let Some(meta) = crate::packet::parse(&pkt) else { continue };
                    let Some(sid) = self.by_virtual_ip.get(&meta.dst).map(|e| *e.value()) else {
                        continue;
                    };
                    let Some(session) = self.sessions.get(&sid).map(|e| e.value().clone()) else {
                        continue;
                    };
                    let _ = session.to_client().try_send(pkt);
                }
            }
        }
    }

    /// Periodic sweep: expire sessions, push usage deltas, and enforce the
    /// access verdicts that come back.
    async fn maintenance_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self
            .opts
            .usage_sync_interval
            .min(self.opts.cleanup_interval)
            .max(Duration::from_millis(200));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if *shutdown.borrow() {
                break;
            }

            let live: Vec<Arc<ServerSession>> =
                self.sessions.iter().map(|e| e.value().clone()).collect();
            for session in live {
                if session.is_expired() {
                    self.retire_session(&session, ErrorCode::AccessExpired, SuppressedTo::None)
                        .await;
                    continue;
                }
                if session.is_disposed() {
                    self.retire_session(
                        &session,
                        session.disposed_info().map(|d| d.0).unwrap_or(ErrorCode::SessionClosed),
                        SuppressedTo::None,
                    )
                    .await;
                    continue;
                }

                let delta = session.take_traffic_delta();
                if delta.sent == 0 && delta.received == 0 {
                    continue;
                }
                match self
                    .access
                    .session_add_usage(session.session_id, delta, None)
                    .await
                {
                    Ok((ErrorCode::Ok, _)) => {}
                    Ok((code, _)) => {
                        tracing::info!(session = session.session_id, code = ?code, "access verdict closes session");
                        self.retire_session(&session, code, SuppressedTo::None).await;
                    }
                    Err(err) => {
                        tracing::warn!(session = session.session_id, err = %err, "usage sync failed");
                    }
                }
            }
        }
    }
}

fn empty_hello_response() -> HelloResponse {
    HelloResponse {
        base: SessionResponse::default(),
        session_id: 0,
        session_key: Vec::new(),
        server_secret: Vec::new(),
        protocol_version: 0,
        udp_port: None,
        virtual_ip_v4: Ipv4Addr::UNSPECIFIED,
        virtual_ip_v6: Ipv6Addr::UNSPECIFIED,
        mtu: 0,
        max_packet_channel_count: 0,
        include_ip_ranges: Vec::new(),
        vpn_adapter_include_ip_ranges: Vec::new(),
        dns_servers: Vec::new(),
        client_public_address: None,
        ad_requirement: AdRequirement::None,
        access_usage: Default::default(),
    }
}

fn offset_v4(gateway: Ipv4Addr, host: u32) -> Ipv4Addr {
    let base = u32::from(gateway) & !0xffff;
    Ipv4Addr::from(base | (host & 0xffff))
}

fn offset_v6(gateway: Ipv6Addr, host: u32) -> Ipv6Addr {
    let mut segs = gateway.segments();
    segs[7] = host as u16;
    Ipv6Addr::from(segs)
}

/// Loads (or creates) the server identity and returns its pinnable SHA-256,
/// for token minting without starting a server.
pub fn identity_cert_hash(
    cert_file: &PathBuf,
    key_file: &PathBuf,
    host_name: &str,
) -> anyhow::Result<Vec<u8>> {
    let (certs, _key) = load_or_generate_identity(cert_file, key_file, host_name)?;
    Ok(crypto::cert_hash(certs[0].as_ref()).to_vec())
}

fn load_or_generate_identity(
    cert_file: &PathBuf,
    key_file: &PathBuf,
    host_name: &str,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    if !cert_file.exists() || !key_file.exists() {
        let name = if host_name.trim().is_empty() {
            "localhost".to_string()
        } else {
            host_name.trim().to_string()
        };
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![name])
                .context("generate self-signed certificate")?;
        if let Some(parent) = cert_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(cert_file, cert.pem()).context("write certificate")?;
        std::fs::write(key_file, key_pair.serialize_pem()).context("write key")?;
        tracing::info!(cert = %cert_file.display(), "generated self-signed server identity");
    }

    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert_file).with_context(|| format!("open {}", cert_file.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("parse certificate pem")?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {}", cert_file.display());

    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key_file).with_context(|| format!("open {}", key_file.display()))?,
    ))
    .context("parse key pem")?
    .context("no private key found")?;

    Ok((certs, key))
}

/// Extracts the SNI host from a TLS ClientHello, if the buffer holds one.
fn peek_sni(buf: &[u8]) -> Option<String> {
    // TLS record header: handshake(22), version, length.
    if buf.len() < 5 || buf[0] != 22 {
        return None;
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let hs = buf.get(5..5 + record_len)?;

    // Handshake header: client_hello(1) + u24 length.
    if hs.len() < 4 || hs[0] != 1 {
        return None;
    }
    let mut i = 4;
    i += 2 + 32; // client version + random
    let sid_len = *hs.get(i)? as usize;
    i += 1 + sid_len;
    let cs_len = u16::from_be_bytes([*hs.get(i)?, *hs.get(i + 1)?]) as usize;
    i += 2 + cs_len;
    let comp_len = *hs.get(i)? as usize;
    i += 1 + comp_len;

    let ext_total = u16::from_be_bytes([*hs.get(i)?, *hs.get(i + 1)?]) as usize;
    i += 2;
    let mut remaining = ext_total.min(hs.len().saturating_sub(i));
    while remaining >= 4 {
        let ext_type = u16::from_be_bytes([*hs.get(i)?, *hs.get(i + 1)?]);
        let ext_len = u16::from_be_bytes([*hs.get(i + 2)?, *hs.get(i + 3)?]) as usize;
        i += 4;
        remaining = remaining.saturating_sub(4);
        if ext_type == 0 {
            // server_name: list length, then type(0) + length + host.
            let name = hs.get(i + 5..i + ext_len)?;
            let name_len = u16::from_be_bytes([*hs.get(i + 3)?, *hs.get(i + 4)?]) as usize;
            let name = name.get(..name_len.min(name.len()))?;
            return Some(String::from_utf8_lossy(name).into_owned());
        }
        i += ext_len;
        remaining = remaining.saturating_sub(ext_len);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_ip_offsets() {
        let g4: Ipv4Addr = "10.255.0.1".parse().unwrap();
        assert_eq!(offset_v4(g4, 2), "10.255.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(
            offset_v4(g4, 260),
            "10.255.1.4".parse::<Ipv4Addr>().unwrap()
        );

        let g6: Ipv6Addr = "fd12::1".parse().unwrap();
        assert_eq!(offset_v6(g6, 9), "fd12::9".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn sni_peek_reads_a_client_hello() {
        // Minimal ClientHello carrying server_name "blocked.example".
        let host = b"blocked.example";
        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&(host.len() as u16 + 3).to_be_bytes()); // list len
        sni_ext.push(0); // host_name type
        sni_ext.extend_from_slice(&(host.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(host);

        let mut exts = Vec::new();
        exts.extend_from_slice(&0u16.to_be_bytes()); // ext type: server_name
        exts.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        exts.extend_from_slice(&sni_ext);

        let mut body = Vec::new();
        body.extend_from_slice(&[3, 3]); // version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites len
        body.extend_from_slice(&[0, 0x2f]);
        body.push(1); // compression methods
        body.push(0);
        body.extend_from_slice(&(exts.len() as u16).to_be_bytes());
        body.extend_from_slice(&exts);

        let mut hs = vec![1, 0, 0, 0];
        hs[1..4].copy_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        hs.extend_from_slice(&body);

        let mut record = vec![22, 3, 1];
        record.extend_from_slice(&(hs.len() as u16).to_be_bytes());
        record.extend_from_slice(&hs);

        assert_eq!(peek_sni(&record).as_deref(), Some("blocked.example"));
        assert_eq!(peek_sni(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(peek_sni(&[]), None);
    }
}
