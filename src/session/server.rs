use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::access::now_millis;
use crate::crypto::SessionCrypt;
use crate::iprange::IpRangeFilter;
use crate::net::BoxedStream;
use crate::packet::{self, IpProtocol};
use crate::protocol::{ErrorCode, StatusResponse, SuppressedTo, Traffic};
use crate::proxy::pool::{ProxyPool, ProxyPoolCallbacks, ProxyPoolOptions, RawSocketFactory};
use crate::reporter::{EventKind, EventReporter};
use crate::session::TunAdapter;
use crate::tunnel::stream::{StreamChannelOptions, StreamPacketChannel};
use crate::tunnel::udp::UdpChannelHub;
use crate::tunnel::{ChannelError, PacketChannel, Tunnel};

/// Limits how many distinct destination endpoints a session may reach
/// within a sliding window; port scanners trip it, browsers do not.
pub struct NetScanDetector {
    limit: usize,
    window: Duration,
    seen: Mutex<VecDeque<(Instant, SocketAddr)>>,
}

impl NetScanDetector {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            seen: Mutex::new(VecDeque::new()),
        }
    }

    pub fn allow(&self, endpoint: SocketAddr) -> bool {
        let mut seen = self.seen.lock().expect("netscan poisoned");
        let now = Instant::now();
        while let Some((t, _)) = seen.front() {
            if now.duration_since(*t) > self.window {
                seen.pop_front();
            } else {
                break;
            }
        }
        if seen.iter().any(|(_, e)| *e == endpoint) {
            return true;
        }
        if seen.len() >= self.limit {
            return false;
        }
        seen.push_back((now, endpoint));
        true
    }
}

#[derive(Clone)]
pub struct ServerSessionOptions {
    pub max_packet_channel_count: usize,
    pub max_tcp_channel_count: usize,
    pub max_tcp_connect_wait_count: usize,
    pub net_scan_limit: Option<usize>,
    pub net_scan_window: Duration,
    pub tcp_buffer_size: usize,
    pub packet_queue_capacity: usize,
    pub blocked_ip_ranges: IpRangeFilter,
    /// Domain suffixes rejected by the stream-proxy SNI peek.
    pub blocked_domains: Vec<String>,
    pub proxy_pool: ProxyPoolOptions,
}

impl Default for ServerSessionOptions {
    fn default() -> Self {
        Self {
            max_packet_channel_count: 4,
            max_tcp_channel_count: 8,
            max_tcp_connect_wait_count: 500,
            net_scan_limit: None,
            net_scan_window: Duration::from_secs(10),
            tcp_buffer_size: 32 * 1024,
            packet_queue_capacity: crate::tunnel::DEFAULT_PACKET_QUEUE_CAPACITY,
            blocked_ip_ranges: IpRangeFilter::default(),
            blocked_domains: Vec::new(),
            proxy_pool: ProxyPoolOptions::default(),
        }
    }
}

pub struct ServerSessionParams {
    pub session_id: u64,
    pub session_key: Vec<u8>,
    pub server_secret: Vec<u8>,
    pub client_id: uuid::Uuid,
    pub token_id: String,
    pub virtual_ip_v4: Ipv4Addr,
    pub virtual_ip_v6: Ipv6Addr,
    /// The server's own virtual addresses; echo requests to them are
    /// answered in place.
    pub gateway_ip_v4: Ipv4Addr,
    pub gateway_ip_v6: Ipv6Addr,
    pub expiration: Option<u64>,
    pub ad_pending: bool,
}

/// Server half of one VPN session: authenticated identity, the tunnel the
/// client's packet channels hang off, and the NAT pool carrying its
/// Internet traffic.
pub struct ServerSession {
    pub session_id: u64,
    session_key: Vec<u8>,
    server_secret: Vec<u8>,
    pub client_id: uuid::Uuid,
    pub token_id: String,
    pub virtual_ip_v4: Ipv4Addr,
    pub virtual_ip_v6: Ipv6Addr,
    gateway_ip_v4: Ipv4Addr,
    gateway_ip_v6: Ipv6Addr,
    expiration: Option<u64>,
    opts: ServerSessionOptions,

    tunnel: Arc<Tunnel>,
    pool: Arc<ProxyPool>,
    tun: Option<Arc<dyn TunAdapter>>,
    reporter: EventReporter,
    netscan: Option<NetScanDetector>,

    ad_pending: AtomicBool,
    tcp_channel_count: AtomicUsize,
    tcp_connect_wait_count: AtomicUsize,
    proxy_traffic: Mutex<Traffic>,
    prev_traffic: Mutex<Traffic>,

    from_client_tx: mpsc::Sender<Bytes>,
    to_client_tx: mpsc::Sender<Bytes>,
    shutdown_tx: watch::Sender<bool>,
    disposed: Mutex<Option<(ErrorCode, SuppressedTo)>>,
}

impl ServerSession {
    pub fn spawn(
        params: ServerSessionParams,
        opts: ServerSessionOptions,
        tun: Option<Arc<dyn TunAdapter>>,
        raw: Arc<dyn RawSocketFactory>,
    ) -> Arc<Self> {
        let tunnel = Arc::new(Tunnel::new(opts.max_packet_channel_count));
        tunnel.start_speedometer();

        let (from_client_tx, from_client_rx) = mpsc::channel(opts.packet_queue_capacity.max(16));
        let (to_client_tx, to_client_rx) = mpsc::channel(opts.packet_queue_capacity.max(16));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let netscan = opts
            .net_scan_limit
            .map(|limit| NetScanDetector::new(limit, opts.net_scan_window));

        let pool = ProxyPool::new(
            opts.proxy_pool.clone(),
            raw,
            to_client_tx.clone(),
            ProxyPoolCallbacks::default(),
        );

        let session = Arc::new(Self {
            session_id: params.session_id,
            session_key: params.session_key,
            server_secret: params.server_secret,
            client_id: params.client_id,
            token_id: params.token_id,
            virtual_ip_v4: params.virtual_ip_v4,
            virtual_ip_v6: params.virtual_ip_v6,
            gateway_ip_v4: params.gateway_ip_v4,
            gateway_ip_v6: params.gateway_ip_v6,
            expiration: params.expiration,
            opts,
            tunnel,
            pool,
            tun,
            reporter: EventReporter::default(),
            netscan,
            ad_pending: AtomicBool::new(params.ad_pending),
            tcp_channel_count: AtomicUsize::new(0),
            tcp_connect_wait_count: AtomicUsize::new(0),
            proxy_traffic: Mutex::new(Traffic::default()),
            prev_traffic: Mutex::new(Traffic::default()),
            from_client_tx,
            to_client_tx,
            shutdown_tx,
            disposed: Mutex::new(None),
        });

        tokio::spawn(session.clone().inbound_loop(from_client_rx, shutdown_rx.clone()));
        tokio::spawn(session.clone().outbound_loop(to_client_rx, shutdown_rx));
        session
    }

    pub fn validate_key(&self, key: &[u8]) -> bool {
        !self.session_key.is_empty() && self.session_key == key
    }

    pub fn server_secret(&self) -> &[u8] {
        &self.server_secret
    }

    /// The session key as sent in the hello response; never leaves the
    /// server anywhere else.
    pub fn hello_key(&self) -> Vec<u8> {
        self.session_key.clone()
    }

    pub fn has_blocked_domains(&self) -> bool {
        !self.opts.blocked_domains.is_empty()
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    pub fn reporter(&self) -> &EventReporter {
        &self.reporter
    }

    /// A packet stream toward the client; used by front-end glue that must
    /// inject packets (e.g. a shared TUN router).
    pub fn to_client(&self) -> mpsc::Sender<Bytes> {
        self.to_client_tx.clone()
    }

    pub fn is_expired(&self) -> bool {
        self.expiration.is_some_and(|exp| now_millis() >= exp)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.lock().expect("disposed poisoned").is_some()
    }

    pub fn disposed_info(&self) -> Option<(ErrorCode, SuppressedTo)> {
        *self.disposed.lock().expect("disposed poisoned")
    }

    pub fn clear_ad_pending(&self) {
        self.ad_pending.store(false, Ordering::Relaxed);
    }

    /// Attaches a freshly negotiated stream packet channel.
    pub fn attach_stream_channel(&self, id: String, stream: BoxedStream) -> Result<(), ChannelError> {
        let ch = StreamPacketChannel::spawn(
            id,
            stream,
            StreamChannelOptions {
                queue_capacity: self.opts.packet_queue_capacity,
                lifespan: None,
            },
            self.from_client_tx.clone(),
        );
        let res = self.tunnel.add_channel(ch.clone());
        if res.is_err() {
            ch.close();
        }
        res
    }

    /// Registers this session's UDP channel on the shared hub, displacing
    /// stream channels per the UDP-mode invariant.
    pub fn attach_udp_channel(&self, hub: &UdpChannelHub) -> Result<(), ChannelError> {
        let crypt = SessionCrypt::new(&self.server_secret)
            .map_err(|_| ChannelError::Closed)?;
        let ch = hub.create_channel(
            self.session_id,
            crypt,
            self.opts.packet_queue_capacity,
            self.from_client_tx.clone(),
        );
        let res = self.tunnel.add_channel(ch.clone());
        if res.is_err() {
            hub.remove_channel(self.session_id);
        }
        res
    }

    /// Counts bytes moved by a stream-proxy splice; the splice's `sent`
    /// axis (client toward the Internet) is already the token `sent` axis.
    pub fn add_proxy_traffic(&self, traffic: Traffic) {
        *self.proxy_traffic.lock().expect("proxy traffic poisoned") += traffic;
    }

    /// Cumulative session traffic in token axes: the tunnel counters with
    /// sent and received swapped (the server's sent is the client's
    /// received), plus passthrough-TCP bytes.
    pub fn traffic(&self) -> Traffic {
        self.tunnel.traffic().swapped()
            + *self.proxy_traffic.lock().expect("proxy traffic poisoned")
    }

    /// Snapshots current traffic and returns the delta accrued since the
    /// previous snapshot; this is what gets reported to the access manager.
    pub fn take_traffic_delta(&self) -> Traffic {
        let current = self.traffic();
        let mut prev = self.prev_traffic.lock().expect("prev traffic poisoned");
        let delta = current.saturating_sub(*prev);
        *prev = current;
        delta
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            base: Default::default(),
            traffic: self.traffic(),
            speed: self.tunnel.speed().swapped(),
            packet_channel_count: self.tunnel.channel_count(),
            is_udp_mode: self.tunnel.is_udp_mode(),
        }
    }

    pub fn begin_stream_proxy(self: &Arc<Self>) -> Result<StreamProxyPermit, ErrorCode> {
        if self.tcp_channel_count.load(Ordering::Relaxed) >= self.opts.max_tcp_channel_count {
            self.reporter
                .report(EventKind::MaxTcpChannel, "tcp channel limit");
            return Err(ErrorCode::GeneralError);
        }
        if self.tcp_connect_wait_count.fetch_add(1, Ordering::Relaxed)
            >= self.opts.max_tcp_connect_wait_count
        {
            self.tcp_connect_wait_count.fetch_sub(1, Ordering::Relaxed);
            self.reporter
                .report(EventKind::MaxTcpConnectWait, "tcp connect-wait limit");
            return Err(ErrorCode::GeneralError);
        }
        Ok(StreamProxyPermit {
            session: self.clone(),
        })
    }

    pub fn check_net_scan(&self, endpoint: SocketAddr) -> bool {
        match &self.netscan {
            Some(d) if !d.allow(endpoint) => {
                self.reporter
                    .report(EventKind::NetScan, &endpoint.to_string());
                false
            }
            _ => true,
        }
    }

    pub fn is_domain_blocked(&self, sni: &str) -> bool {
        let sni = sni.trim().to_ascii_lowercase();
        self.opts
            .blocked_domains
            .iter()
            .any(|d| sni == *d || sni.ends_with(&format!(".{d}")))
    }

    /// Disposes the session once; later calls are no-ops. Returns whether
    /// this call performed the disposal.
    pub fn dispose(&self, code: ErrorCode, suppressed_to: SuppressedTo) -> bool {
        {
            let mut disposed = self.disposed.lock().expect("disposed poisoned");
            if disposed.is_some() {
                return false;
            }
            *disposed = Some((code, suppressed_to));
        }
        tracing::info!(
            session = self.session_id,
            code = ?code,
            "server session disposed"
        );
        let _ = self.shutdown_tx.send(true);
        self.tunnel.remove_all_packet_channels();
        self.pool.shutdown();
        true
    }

    async fn inbound_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Bytes>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                pkt = rx.recv() => {
                    let Some(pkt) = pkt else { break };
                    self.dispatch_inbound(pkt).await;
                }
            }
        }
    }

    async fn outbound_loop(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Bytes>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                pkt = rx.recv() => {
                    let Some(pkt) = pkt else { break };
                    if self.tunnel.send(pkt).is_err() {
                        self.reporter
                            .report(EventKind::PacketDrop, "no channel toward client");
                    }
                }
            }
        }
    }

    /// One tunneled packet from the client, headed for the Internet.
    async fn dispatch_inbound(&self, pkt: Bytes) {
        let Some(meta) = packet::parse(&pkt) else {
            self.reporter.report(EventKind::PacketDrop, "unparseable");
            return;
        };

        if self.ad_pending.load(Ordering::Relaxed) {
            self.reporter.report(EventKind::PacketDrop, "ad pending");
            return;
        }

        // Source must be the session's own virtual address.
        let spoofed = match meta.src {
            IpAddr::V4(src) => src != self.virtual_ip_v4,
            IpAddr::V6(src) => src != self.virtual_ip_v6,
        };
        if spoofed {
            self.reporter
                .report(EventKind::NetFilter, &format!("spoofed source {}", meta.src));
            return;
        }

        if self.opts.blocked_ip_ranges.contains(meta.dst) {
            self.reporter
                .report(EventKind::NetFilter, &format!("blocked {}", meta.dst));
            return;
        }

        // Echo to the server's virtual address is terminated here.
        let is_gateway = meta.dst == IpAddr::V4(self.gateway_ip_v4)
            || meta.dst == IpAddr::V6(self.gateway_ip_v6);
        if is_gateway && meta.is_icmp_echo_request() {
            if let Some(icmp) = meta.icmp {
                let payload = meta.icmp_payload(&pkt).unwrap_or_default();
                if let Some(reply) = packet::build_icmp_echo(
                    meta.dst,
                    meta.src,
                    true,
                    icmp.ident,
                    icmp.seq,
                    payload,
                ) {
                    let _ = self.to_client_tx.try_send(Bytes::from(reply));
                }
            }
            return;
        }

        if let Some(tun) = &self.tun {
            if tun.ip_version_supported(meta.version) {
                if tun.write_packet(pkt).is_err() {
                    self.reporter.report(EventKind::PacketDrop, "tun write");
                }
                return;
            }
        }

        if matches!(meta.protocol, IpProtocol::Udp) {
            if !self.check_net_scan(meta.dst_socket()) {
                return;
            }
        }
        if let Err(err) = self.pool.handle_packet(&pkt).await {
            self.reporter
                .report(EventKind::PacketDrop, &format!("proxy pool: {err}"));
        }
    }
}

/// RAII slot on the connect-wait counter; converts into a channel slot once
/// the TCP connect succeeds.
pub struct StreamProxyPermit {
    session: Arc<ServerSession>,
}

impl StreamProxyPermit {
    pub fn connected(self) -> StreamProxyChannelGuard {
        self.session
            .tcp_channel_count
            .fetch_add(1, Ordering::Relaxed);
        StreamProxyChannelGuard {
            // The permit's own drop releases the wait slot.
            session: self.session.clone(),
        }
    }
}

impl Drop for StreamProxyPermit {
    fn drop(&mut self) {
        self.session
            .tcp_connect_wait_count
            .fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct StreamProxyChannelGuard {
    session: Arc<ServerSession>,
}

impl Drop for StreamProxyChannelGuard {
    fn drop(&mut self) {
        self.session
            .tcp_channel_count
            .fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::ChannelTunAdapter;

    struct NoIcmpFactory;

    #[async_trait::async_trait]
    impl RawSocketFactory for NoIcmpFactory {
        async fn open_icmp(
            &self,
            _v6: bool,
        ) -> std::io::Result<Arc<dyn crate::proxy::pool::IcmpHandle>> {
            Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "no raw sockets in tests",
            ))
        }
    }

    fn params() -> ServerSessionParams {
        ServerSessionParams {
            session_id: 7,
            session_key: vec![1u8; 16],
            server_secret: vec![2u8; 16],
            client_id: uuid::Uuid::new_v4(),
            token_id: "t".into(),
            virtual_ip_v4: "10.255.0.2".parse().unwrap(),
            virtual_ip_v6: "fd12::2".parse().unwrap(),
            gateway_ip_v4: "10.255.0.1".parse().unwrap(),
            gateway_ip_v6: "fd12::1".parse().unwrap(),
            expiration: None,
            ad_pending: false,
        }
    }

    #[test]
    fn netscan_allows_repeats_but_blocks_fanout()  {
        let d = NetScanDetector::new(2, Duration::from_secs(10));
        let a: SocketAddr = "1.1.1.1:53".parse().unwrap();
        let b: SocketAddr = "8.8.8.8:53".parse().unwrap();
        let c: SocketAddr = "9.9.9.9:53".parse().unwrap();

        assert!(d.allow(a));
        assert!(d.allow(a));
        assert!(d.allow(b));
        assert!(!d.allow(c));
    }

    #[tokio::test]
    async fn spoofed_source_is_reported_not_forwarded() {
        let (tun, _tun_tx, mut tun_rx) = ChannelTunAdapter::new(false);
        let session = ServerSession::spawn(
            params(),
            ServerSessionOptions::default(),
            Some(tun),
            Arc::new(NoIcmpFactory),
        );

        // Source address is not the session's virtual IP.
        let pkt = packet::build_udp_packet(
            "10.255.0.99:1000".parse().unwrap(),
            "1.1.1.1:53".parse().unwrap(),
            b"x",
        )
        .unwrap();
        session.dispatch_inbound(Bytes::from(pkt)).await;

        assert_eq!(session.reporter.count(EventKind::NetFilter), 1);
        assert!(tun_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn valid_packet_goes_to_the_tun() {
        let (tun, _tun_tx, mut tun_rx) = ChannelTunAdapter::new(false);
        let session = ServerSession::spawn(
            params(),
            ServerSessionOptions::default(),
            Some(tun),
            Arc::new(NoIcmpFactory),
        );

        let pkt = packet::build_udp_packet(
            "10.255.0.2:1000".parse().unwrap(),
            "1.1.1.1:53".parse().unwrap(),
            b"x",
        )
        .unwrap();
        session.dispatch_inbound(Bytes::from(pkt.clone())).await;

        let got = tun_rx.recv().await.unwrap();
        assert_eq!(got.as_ref(), pkt.as_slice());
    }

    #[tokio::test]
    async fn gateway_ping_is_answered_in_place() {
        let session = ServerSession::spawn(
            params(),
            ServerSessionOptions::default(),
            None,
            Arc::new(NoIcmpFactory),
        );

        let ping = packet::build_icmp_echo(
            "10.255.0.2".parse().unwrap(),
            "10.255.0.1".parse().unwrap(),
            false,
            42,
            1,
            b"0123456789",
        )
        .unwrap();
        session.dispatch_inbound(Bytes::from(ping)).await;

        // The reply heads back through the tunnel; with no channels it is
        // dropped, but it must have been produced: give the outbound loop a
        // moment, then check the drop counter moved.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.reporter.count(EventKind::PacketDrop), 1);
    }

    #[tokio::test]
    async fn blocked_range_is_filtered() {
        let opts = ServerSessionOptions {
            blocked_ip_ranges: IpRangeFilter::new(["1.0.0.0/8".parse().unwrap()]),
            ..Default::default()
        };
        let session = ServerSession::spawn(params(), opts, None, Arc::new(NoIcmpFactory));

        let pkt = packet::build_udp_packet(
            "10.255.0.2:1000".parse().unwrap(),
            "1.1.1.1:53".parse().unwrap(),
            b"x",
        )
        .unwrap();
        session.dispatch_inbound(Bytes::from(pkt)).await;
        assert_eq!(session.reporter.count(EventKind::NetFilter), 1);
    }

    #[tokio::test]
    async fn stream_proxy_limits_are_enforced() {
        let opts = ServerSessionOptions {
            max_tcp_channel_count: 1,
            ..Default::default()
        };
        let session = ServerSession::spawn(params(), opts, None, Arc::new(NoIcmpFactory));

        let permit = session.begin_stream_proxy().unwrap();
        let guard = permit.connected();
        assert!(session.begin_stream_proxy().is_err());
        assert_eq!(session.reporter.count(EventKind::MaxTcpChannel), 1);

        drop(guard);
        assert!(session.begin_stream_proxy().is_ok());
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let session = ServerSession::spawn(
            params(),
            ServerSessionOptions::default(),
            None,
            Arc::new(NoIcmpFactory),
        );
        assert!(session.dispose(ErrorCode::SessionSuppressed, SuppressedTo::Other));
        assert!(!session.dispose(ErrorCode::SessionClosed, SuppressedTo::None));
        assert_eq!(
            session.disposed_info(),
            Some((ErrorCode::SessionSuppressed, SuppressedTo::Other))
        );
    }

    #[tokio::test]
    async fn traffic_axes_are_swapped_and_delta_resets() {
        let session = ServerSession::spawn(
            params(),
            ServerSessionOptions::default(),
            None,
            Arc::new(NoIcmpFactory),
        );

        // No channels: traffic stays zero but the API shape holds.
        assert_eq!(session.take_traffic_delta(), Traffic::default());
        assert_eq!(session.traffic(), Traffic::default());

        // Passthrough-TCP bytes land on the token axes unchanged.
        session.add_proxy_traffic(Traffic::new(100, 40));
        assert_eq!(session.traffic(), Traffic::new(100, 40));
        assert_eq!(session.take_traffic_delta(), Traffic::new(100, 40));
        assert_eq!(session.take_traffic_delta(), Traffic::default());
    }
}
