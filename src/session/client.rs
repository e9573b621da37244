use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::access::{AccessToken, now_millis};
use crate::connector::{Connector, ConnectorError, ConnectorOptions};
use crate::crypto::{self, SessionCrypt};
use crate::iprange::{CachedIpRangeFilter, IpRangeFilter};
use crate::packet::{self, IpProtocol};
use crate::protocol::{
    AdRequirement, ByeRequest, ErrorCode, HelloRequest, HelloResponse, OpCode, RewardedAdRequest,
    SessionRequest, SessionResponse, SessionStatusRequest, StatusResponse, StreamProxyRequest,
    SuppressedTo, TcpPacketChannelRequest, UdpChannelRequest, UdpChannelResponse, ClientInfo,
    PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN,
};
use crate::proxy::pool::{ProxyPool, ProxyPoolCallbacks, ProxyPoolOptions, RawSocketFactory};
use crate::reporter::{EventKind, EventReporter};
use crate::session::finder::ServerFinder;
use crate::session::{SessionState, TcpProxyHost, TunAdapter};
use crate::state::{ConnectionInfo, ConnectionInfoWriter, SessionInfo};
use crate::tunnel::stream::{StreamChannelOptions, StreamPacketChannel};
use crate::tunnel::udp::UdpPacketChannel;
use crate::tunnel::{PacketChannel, Tunnel};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("no reachable server endpoint")]
    NoEndpoint,
    #[error("server rejected: {0:?}")]
    Rejected(ErrorCode),
    #[error("session disposed")]
    Disposed,
    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

#[derive(Clone)]
pub struct ClientSessionOptions {
    pub token: AccessToken,
    pub client_id: uuid::Uuid,
    pub client_version: String,
    pub user_agent: String,

    pub use_udp_channel: bool,
    pub drop_udp: bool,
    pub drop_quic: bool,
    pub use_tcp_over_tun: bool,
    pub include_local_network: bool,
    pub allow_redirect: bool,
    pub is_ipv6_supported: bool,
    /// Proof handed to the rewarded-ad flow when the server requires one.
    pub ad_data: Option<String>,

    /// Window of immediate reconnect attempts before pausing.
    pub reconnect_timeout: Duration,
    /// Pause length in `waiting`; the first packet afterwards reconnects.
    pub auto_wait_timeout: Duration,
    /// Give up entirely after this long without a working session.
    pub session_timeout: Duration,
    pub bye_timeout: Duration,
    pub request_timeout: Duration,
    pub tcp_reuse_timeout: Duration,
    pub server_query_timeout: Duration,
    pub cleanup_interval: Duration,
    pub channel_refill_interval: Duration,
    pub min_channel_lifespan: Duration,
    pub max_channel_lifespan: Duration,
    pub packet_queue_capacity: usize,

    pub proxy_pool: ProxyPoolOptions,
    pub state_file: Option<std::path::PathBuf>,
}

impl ClientSessionOptions {
    pub fn new(token: AccessToken) -> Self {
        Self {
            token,
            client_id: uuid::Uuid::new_v4(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            user_agent: concat!("shroud/", env!("CARGO_PKG_VERSION")).into(),
            use_udp_channel: false,
            drop_udp: false,
            drop_quic: false,
            use_tcp_over_tun: false,
            include_local_network: false,
            allow_redirect: true,
            is_ipv6_supported: false,
            ad_data: None,
            reconnect_timeout: Duration::from_secs(5),
            auto_wait_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(60),
            bye_timeout: Duration::from_secs(10),
            request_timeout: crate::connector::DEFAULT_REQUEST_TIMEOUT,
            tcp_reuse_timeout: crate::connector::DEFAULT_TCP_REUSE_TIMEOUT,
            server_query_timeout: crate::session::finder::DEFAULT_SERVER_QUERY_TIMEOUT,
            cleanup_interval: Duration::from_secs(30),
            channel_refill_interval: Duration::from_secs(1),
            min_channel_lifespan: Duration::from_secs(300),
            max_channel_lifespan: Duration::from_secs(1200),
            packet_queue_capacity: crate::tunnel::DEFAULT_PACKET_QUEUE_CAPACITY,
            proxy_pool: ProxyPoolOptions::default(),
            state_file: None,
        }
    }

    /// Applies the runtime boolean overrides from the environment.
    pub fn apply_env(mut self) -> Self {
        use crate::config::env_flag;
        if let Some(v) = env_flag("SHROUD_ENABLE_UDP_CHANNEL") {
            self.use_udp_channel = v;
        }
        if let Some(v) = env_flag("SHROUD_DROP_UDP") {
            self.drop_udp = v;
        }
        if let Some(v) = env_flag("SHROUD_DROP_QUIC") {
            self.drop_quic = v;
        }
        if let Some(v) = env_flag("SHROUD_USE_TCP_OVER_TUN") {
            self.use_tcp_over_tun = v;
        }
        if let Some(v) = env_flag("SHROUD_INCLUDE_LOCAL_NETWORK") {
            self.include_local_network = v;
        }
        self
    }
}

struct Negotiated {
    session_id: u64,
    session_key: Vec<u8>,
    server_secret: Vec<u8>,
    udp_port: Option<u16>,
    server_ip: IpAddr,
    virtual_ip_v4: std::net::Ipv4Addr,
    virtual_ip_v6: std::net::Ipv6Addr,
    server_ipv6_supported: bool,
    max_packet_channel_count: usize,
    expiration: Option<u64>,
    suppressed_to: SuppressedTo,
}

impl Negotiated {
    fn request_base(&self) -> SessionRequest {
        SessionRequest {
            session_id: self.session_id,
            session_key: self.session_key.clone(),
        }
    }
}

/// Client half of one VPN session: drives the state machine, decides per
/// TUN packet whether to tunnel, locally proxy, or drop, and keeps the
/// packet-channel set filled.
pub struct ClientSession {
    opts: ClientSessionOptions,
    tun: Arc<dyn TunAdapter>,
    tcp_host: Option<Arc<dyn TcpProxyHost>>,

    state_tx: watch::Sender<SessionState>,
    connector: Mutex<Option<Arc<Connector>>>,
    negotiated: Mutex<Option<Arc<Negotiated>>>,
    filter: Mutex<Arc<CachedIpRangeFilter>>,
    tunnel: Arc<Tunnel>,
    pool: Arc<ProxyPool>,
    reporter: EventReporter,

    from_server_tx: mpsc::Sender<Bytes>,
    shutdown_tx: watch::Sender<bool>,
    connect_gate: tokio::sync::Mutex<()>,
    refill_lock: tokio::sync::Mutex<()>,

    first_error_at: Mutex<Option<Instant>>,
    pause_until: Mutex<Option<Instant>>,
    redirected: AtomicBool,
    reached_connected: AtomicBool,
    fatal: AtomicBool,
    disposed_code: Mutex<Option<ErrorCode>>,
    info_writer: Option<ConnectionInfoWriter>,
}

impl ClientSession {
    pub fn spawn(
        opts: ClientSessionOptions,
        tun: Arc<dyn TunAdapter>,
        tcp_host: Option<Arc<dyn TcpProxyHost>>,
        raw: Arc<dyn RawSocketFactory>,
    ) -> Arc<Self> {
        let tunnel = Arc::new(Tunnel::new(1));
        tunnel.start_speedometer();

        let (from_server_tx, from_server_rx) =
            mpsc::channel::<Bytes>(opts.packet_queue_capacity.max(16));
        let (local_reply_tx, local_reply_rx) =
            mpsc::channel::<Bytes>(opts.packet_queue_capacity.max(16));
        let (state_tx, _) = watch::channel(SessionState::None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pool = ProxyPool::new(
            opts.proxy_pool.clone(),
            raw,
            local_reply_tx,
            ProxyPoolCallbacks::default(),
        );

        let info_writer = opts.state_file.clone().map(ConnectionInfoWriter::new);

        let session = Arc::new(Self {
            opts,
            tun,
            tcp_host,
            state_tx,
            connector: Mutex::new(None),
            negotiated: Mutex::new(None),
            filter: Mutex::new(Arc::new(CachedIpRangeFilter::new(IpRangeFilter::all()))),
            tunnel,
            pool,
            reporter: EventReporter::default(),
            from_server_tx,
            shutdown_tx,
            connect_gate: tokio::sync::Mutex::new(()),
            refill_lock: tokio::sync::Mutex::new(()),
            first_error_at: Mutex::new(None),
            pause_until: Mutex::new(None),
            redirected: AtomicBool::new(false),
            reached_connected: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            disposed_code: Mutex::new(None),
            info_writer,
        });

        tokio::spawn(session.clone().tun_loop(shutdown_rx.clone()));
        tokio::spawn(
            session
                .clone()
                .to_tun_loop(from_server_rx, shutdown_rx.clone()),
        );
        tokio::spawn(
            session
                .clone()
                .to_tun_loop(local_reply_rx, shutdown_rx.clone()),
        );
        tokio::spawn(session.clone().cleanup_loop(shutdown_rx.clone()));
        tokio::spawn(session.clone().channel_loop(shutdown_rx));
        session
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    pub fn reporter(&self) -> &EventReporter {
        &self.reporter
    }

    pub fn session_id(&self) -> Option<u64> {
        self.negotiated
            .lock()
            .expect("negotiated poisoned")
            .as_ref()
            .map(|n| n.session_id)
    }

    pub fn virtual_ips(&self) -> Option<(std::net::Ipv4Addr, std::net::Ipv6Addr)> {
        self.negotiated
            .lock()
            .expect("negotiated poisoned")
            .as_ref()
            .map(|n| (n.virtual_ip_v4, n.virtual_ip_v6))
    }

    /// What the last hello said about suppression.
    pub fn suppressed_to(&self) -> Option<SuppressedTo> {
        self.negotiated
            .lock()
            .expect("negotiated poisoned")
            .as_ref()
            .map(|n| n.suppressed_to)
    }

    pub fn disposed_code(&self) -> Option<ErrorCode> {
        *self.disposed_code.lock().expect("disposed poisoned")
    }

    /// Initial connect; later reconnects are driven by the packet path.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ClientError> {
        self.connect_once().await
    }

    pub async fn session_status(self: &Arc<Self>) -> Result<StatusResponse, ClientError> {
        let (connector, neg) = self.control_handles()?;
        let (resp, _stream) = connector
            .request::<_, StatusResponse>(
                OpCode::SessionStatus,
                &SessionStatusRequest {
                    session: neg.request_base(),
                },
            )
            .await?;
        if resp.base.error_code != ErrorCode::Ok {
            self.handle_response_code(resp.base.error_code).await;
            return Err(ClientError::Rejected(resp.base.error_code));
        }
        Ok(resp)
    }

    /// Opens a passthrough TCP byte stream to `destination` through the
    /// server. The local TCP proxy host splices terminated connections
    /// onto streams obtained here.
    pub async fn open_stream_proxy(
        self: &Arc<Self>,
        destination: SocketAddr,
    ) -> Result<crate::net::BoxedStream, ClientError> {
        let (connector, neg) = self.control_handles()?;
        let (resp, stream) = connector
            .request::<_, SessionResponse>(
                OpCode::StreamProxy,
                &StreamProxyRequest {
                    session: neg.request_base(),
                    destination,
                },
            )
            .await?;
        if resp.error_code != ErrorCode::Ok {
            self.handle_response_code(resp.error_code).await;
            return Err(ClientError::Rejected(resp.error_code));
        }
        Ok(stream)
    }

    /// Graceful shutdown: bye, then release everything.
    pub async fn close(self: &Arc<Self>) {
        self.dispose(ErrorCode::Ok, None).await;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed_code
            .lock()
            .expect("disposed poisoned")
            .is_some()
    }

    fn control_handles(&self) -> Result<(Arc<Connector>, Arc<Negotiated>), ClientError> {
        let connector = self
            .connector
            .lock()
            .expect("connector poisoned")
            .clone()
            .ok_or(ClientError::Disposed)?;
        let neg = self
            .negotiated
            .lock()
            .expect("negotiated poisoned")
            .clone()
            .ok_or(ClientError::Disposed)?;
        Ok((connector, neg))
    }

    fn set_state(self: &Arc<Self>, state: SessionState) {
        let changed = {
            let prev = *self.state_tx.borrow();
            prev != state
        };
        if !changed {
            return;
        }
        tracing::info!(state = ?state, "client session state");
        self.state_tx.send_replace(state);
        self.write_connection_info(state, None);
    }

    fn write_connection_info(self: &Arc<Self>, state: SessionState, error: Option<String>) {
        let Some(writer) = self.info_writer.clone() else {
            return;
        };
        let mut info = ConnectionInfo::new(state);
        info.api_key = Some(self.opts.token.token_id.clone());
        info.error = error;
        {
            let connector = self.connector.lock().expect("connector poisoned");
            info.api_endpoint = connector.as_ref().map(|c| c.endpoint());
        }
        if let Some(neg) = self.negotiated.lock().expect("negotiated poisoned").as_ref() {
            info.session_info = Some(SessionInfo {
                session_id: neg.session_id,
                virtual_ip_v4: neg.virtual_ip_v4,
                virtual_ip_v6: neg.virtual_ip_v6,
            });
        }
        tokio::spawn(async move { writer.write(&info).await });
    }

    // ----- connect / hello -----

    async fn connect_once(self: &Arc<Self>) -> Result<(), ClientError> {
        let _gate = self.connect_gate.lock().await;
        if self.is_disposed() {
            return Err(ClientError::Disposed);
        }
        // A concurrent attempt may have already won.
        if self.state() == SessionState::Connected {
            return Ok(());
        }
        self.set_state(SessionState::Connecting);

        let result = self.try_hello().await;
        match result {
            Ok(()) => {
                *self.first_error_at.lock().expect("error stamp poisoned") = None;
                *self.pause_until.lock().expect("pause poisoned") = None;
                self.reached_connected.store(true, Ordering::Relaxed);
                self.set_state(SessionState::Connected);
                self.manage_channels().await;
                Ok(())
            }
            Err(err) => {
                self.handle_connect_error(&err).await;
                Err(err)
            }
        }
    }

    async fn try_hello(self: &Arc<Self>) -> Result<(), ClientError> {
        let endpoint = match self.current_endpoint() {
            Some(ep) => ep,
            None => {
                let finder = ServerFinder {
                    query_timeout: self.opts.server_query_timeout,
                    prefer_ipv6: self.opts.is_ipv6_supported,
                };
                finder
                    .find(&self.opts.token.server_endpoints)
                    .await
                    .ok_or(ClientError::NoEndpoint)?
            }
        };

        let connector = self.build_connector(endpoint);
        let resp = self.hello_on(&connector).await?;

        match resp.base.error_code {
            ErrorCode::Ok => {
                self.install_session(endpoint, connector, resp).await?;
                Ok(())
            }
            ErrorCode::RedirectHost => {
                // One redirect is allowed; the next one is always fatal.
                if !self.opts.allow_redirect || self.redirected.swap(true, Ordering::SeqCst) {
                    self.reporter
                        .report(EventKind::RedirectLoop, "second redirect");
                    self.fatal.store(true, Ordering::Relaxed);
                    return Err(ClientError::Rejected(ErrorCode::RedirectHost));
                }
                let target = resp
                    .base
                    .redirect_endpoints
                    .first()
                    .copied()
                    .ok_or(ClientError::Rejected(ErrorCode::RedirectHost))?;
                tracing::info!(target = %target, "hello redirected");

                let connector = self.build_connector(target);
                let resp = self.hello_on(&connector).await?;
                match resp.base.error_code {
                    ErrorCode::Ok => {
                        self.install_session(target, connector, resp).await?;
                        Ok(())
                    }
                    code => {
                        self.fatal.store(code.is_terminal(), Ordering::Relaxed);
                        Err(ClientError::Rejected(code))
                    }
                }
            }
            code => {
                // general_error on the hello is terminal by contract.
                self.fatal.store(
                    code.is_terminal() || code == ErrorCode::GeneralError,
                    Ordering::Relaxed,
                );
                Err(ClientError::Rejected(code))
            }
        }
    }

    async fn hello_on(&self, connector: &Arc<Connector>) -> Result<HelloResponse, ClientError> {
        let token = &self.opts.token;
        let encrypted_client_id = crypto::encrypt_client_id(&token.secret, self.opts.client_id)
            .map(|b| b.to_vec())
            .unwrap_or_default();

        let req = HelloRequest {
            client_id: self.opts.client_id,
            encrypted_client_id,
            client_info: ClientInfo {
                client_version: self.opts.client_version.clone(),
                min_protocol_version: PROTOCOL_VERSION_MIN,
                max_protocol_version: PROTOCOL_VERSION_MAX,
                user_agent: self.opts.user_agent.clone(),
            },
            token_id: token.token_id.clone(),
            server_location: None,
            plan_id: None,
            access_code: None,
            allow_redirect: self.opts.allow_redirect && !self.redirected.load(Ordering::SeqCst),
            is_ipv6_supported: self.opts.is_ipv6_supported,
        };

        let (resp, _stream) = connector
            .request::<_, HelloResponse>(OpCode::Hello, &req)
            .await?;
        Ok(resp)
    }

    async fn install_session(
        self: &Arc<Self>,
        endpoint: SocketAddr,
        connector: Arc<Connector>,
        resp: HelloResponse,
    ) -> Result<(), ClientError> {
        let neg = Arc::new(Negotiated {
            session_id: resp.session_id,
            session_key: resp.session_key.clone(),
            server_secret: resp.server_secret.clone(),
            udp_port: resp.udp_port,
            server_ip: endpoint.ip(),
            virtual_ip_v4: resp.virtual_ip_v4,
            virtual_ip_v6: resp.virtual_ip_v6,
            server_ipv6_supported: !resp.virtual_ip_v6.is_unspecified(),
            max_packet_channel_count: resp.max_packet_channel_count.max(1),
            expiration: resp.access_usage.expiration,
            suppressed_to: resp.base.suppressed_to,
        });

        let filter = if resp.include_ip_ranges.is_empty() {
            IpRangeFilter::all()
        } else {
            IpRangeFilter::new(resp.include_ip_ranges.iter().copied())
        };

        // A fresh session invalidates every old channel.
        self.tunnel.remove_all_packet_channels();
        self.tunnel
            .set_max_packet_channels(neg.max_packet_channel_count);
        *self.filter.lock().expect("filter poisoned") = Arc::new(CachedIpRangeFilter::new(filter));
        *self.negotiated.lock().expect("negotiated poisoned") = Some(neg);
        {
            let mut slot = self.connector.lock().expect("connector poisoned");
            if let Some(_old) = slot.replace(connector) {
                // Old connector's idle reaper dies with its Arc.
            }
        }

        if resp.ad_requirement == AdRequirement::Rewarded {
            self.set_state(SessionState::WaitingForAd);
            self.submit_rewarded_ad().await?;
        }

        tracing::info!(
            session = resp.session_id,
            endpoint = %endpoint,
            udp_port = ?resp.udp_port,
            "hello accepted"
        );
        Ok(())
    }

    async fn submit_rewarded_ad(self: &Arc<Self>) -> Result<(), ClientError> {
        let Some(ad_data) = self.opts.ad_data.clone() else {
            self.fatal.store(true, Ordering::Relaxed);
            return Err(ClientError::Rejected(ErrorCode::RewardedAdRejected));
        };
        let (connector, neg) = self.control_handles()?;
        let (resp, _stream) = connector
            .request::<_, SessionResponse>(
                OpCode::RewardedAd,
                &RewardedAdRequest {
                    session: neg.request_base(),
                    ad_data,
                },
            )
            .await?;
        if resp.error_code != ErrorCode::Ok {
            self.fatal.store(true, Ordering::Relaxed);
            return Err(ClientError::Rejected(resp.error_code));
        }
        Ok(())
    }

    fn current_endpoint(&self) -> Option<SocketAddr> {
        self.connector
            .lock()
            .expect("connector poisoned")
            .as_ref()
            .map(|c| c.endpoint())
    }

    fn build_connector(&self, endpoint: SocketAddr) -> Arc<Connector> {
        let mut copts = ConnectorOptions::new(
            endpoint,
            self.opts.token.host_name.clone(),
            self.opts.token.cert_hash.clone(),
        );
        copts.request_timeout = self.opts.request_timeout;
        copts.tcp_reuse_timeout = self.opts.tcp_reuse_timeout;
        Connector::new(copts)
    }

    // ----- error / retry path -----

    async fn handle_connect_error(self: &Arc<Self>, err: &ClientError) {
        if let ClientError::Rejected(code) = err {
            self.handle_response_code(*code).await;
            return;
        }
        self.note_transport_error().await;
    }

    /// Applies a server verdict carried on any response.
    async fn handle_response_code(self: &Arc<Self>, code: ErrorCode) {
        if code.is_terminal() {
            self.fatal.store(true, Ordering::Relaxed);
            self.dispose(code, Some(format!("server verdict {code:?}"))).await;
        } else if code == ErrorCode::GeneralError && !self.reached_connected.load(Ordering::Relaxed)
        {
            self.fatal.store(true, Ordering::Relaxed);
            self.dispose(code, Some("general error on hello".into())).await;
        } else if code != ErrorCode::Ok {
            self.note_transport_error().await;
        }
    }

    /// Transport-level failure: retry inside `reconnect_timeout`, pause
    /// until `auto_wait_timeout` inside `session_timeout`, then give up.
    async fn note_transport_error(self: &Arc<Self>) {
        let first = {
            let mut stamp = self.first_error_at.lock().expect("error stamp poisoned");
            *stamp.get_or_insert_with(Instant::now)
        };
        let elapsed = first.elapsed();

        if elapsed >= self.opts.session_timeout {
            self.fatal.store(true, Ordering::Relaxed);
            self.dispose(ErrorCode::SessionClosed, Some("session timeout".into()))
                .await;
        } else if elapsed >= self.opts.reconnect_timeout {
            *self.pause_until.lock().expect("pause poisoned") =
                Some(Instant::now() + self.opts.auto_wait_timeout);
            tracing::warn!(
                pause = %humantime::format_duration(self.opts.auto_wait_timeout),
                "requests keep failing; pausing session"
            );
            self.set_state(SessionState::Waiting);
        } else {
            self.set_state(SessionState::Connecting);
        }
    }

    // ----- packet dispatch -----

    async fn tun_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                pkt = self.tun.read_packet() => {
                    let Ok(pkt) = pkt else { break };
                    self.dispatch(pkt).await;
                }
            }
        }
    }

    async fn to_tun_loop(
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
                    if self.tun.write_packet(pkt).is_err() {
                        self.reporter.report(EventKind::PacketDrop, "tun write");
                    }
                }
            }
        }
    }

    /// One packet off the TUN adapter, in test order.
    pub async fn dispatch(self: &Arc<Self>, pkt: Bytes) {
        // 1. Paused sessions drop everything; an elapsed pause reconnects.
        match self.state() {
            SessionState::Connected => {}
            SessionState::Waiting => {
                let elapsed = self
                    .pause_until
                    .lock()
                    .expect("pause poisoned")
                    .is_some_and(|t| Instant::now() >= t);
                if elapsed {
                    let session = self.clone();
                    tokio::spawn(async move {
                        let _ = session.connect_once().await;
                    });
                }
                return;
            }
            _ => return,
        }

        let Some(meta) = packet::parse(&pkt) else {
            self.reporter.report(EventKind::PacketDrop, "unparseable");
            return;
        };

        // 2. Multicast is never carried.
        if meta.is_multicast() {
            return;
        }

        // 3. Catcher addresses loop TCP back into the local proxy host.
        if let Some(host) = &self.tcp_host {
            let catcher = IpAddr::V4(host.catcher_ip_v4());
            if meta.src == catcher || meta.dst == catcher {
                host.handle_packet(pkt);
                return;
            }
        }

        let in_range = self.dst_in_range(meta.dst);

        // 4/5. TCP either rides the tunnel or terminates locally.
        if meta.protocol == IpProtocol::Tcp {
            if self.opts.use_tcp_over_tun && in_range {
                self.send_to_tunnel(pkt);
            } else if let Some(host) = &self.tcp_host {
                host.handle_packet(pkt);
            } else {
                self.reporter
                    .report(EventKind::PacketDrop, "no local tcp host");
            }
            return;
        }

        // 6. IPv6 without server support is dropped.
        if meta.version == 6 && !self.server_supports_ipv6() {
            return;
        }

        // 7. ICMP echo cannot use the local proxy.
        if meta.is_icmp_echo_request() {
            self.send_to_tunnel(pkt);
            return;
        }

        // 8. Out-of-range traffic goes to the local UDP/ICMP proxy.
        if !in_range {
            if let Err(err) = self.pool.handle_packet(&pkt).await {
                self.reporter
                    .report(EventKind::PacketDrop, &format!("local proxy: {err}"));
            }
            return;
        }

        // 9/10. Configured UDP drops.
        if meta.protocol == IpProtocol::Udp {
            if self.opts.drop_udp {
                return;
            }
            if self.opts.drop_quic && matches!(meta.dst_port, 80 | 443) {
                return;
            }
        }

        // 11. Everything left rides the tunnel.
        self.send_to_tunnel(pkt);
    }

    fn send_to_tunnel(&self, pkt: Bytes) {
        if self.tunnel.send(pkt).is_err() {
            self.reporter
                .report(EventKind::PacketDrop, "tunnel refused packet");
        }
    }

    fn dst_in_range(&self, dst: IpAddr) -> bool {
        if !self.opts.include_local_network && is_local_address(dst) {
            return false;
        }
        let filter = self.filter.lock().expect("filter poisoned").clone();
        filter.contains(dst)
    }

    fn server_supports_ipv6(&self) -> bool {
        self.negotiated
            .lock()
            .expect("negotiated poisoned")
            .as_ref()
            .is_some_and(|n| n.server_ipv6_supported)
    }

    // ----- channel management -----

    async fn channel_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.opts.channel_refill_interval) => {
                    match self.state() {
                        SessionState::Connected => self.manage_channels().await,
                        // Retry loop while the pause has not kicked in.
                        SessionState::Connecting => {
                            let _ = self.connect_once().await;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// Keeps the channel set full; guarded by a try-lock so at most one
    /// refill is in flight.
    async fn manage_channels(self: &Arc<Self>) {
        let Ok(_guard) = self.refill_lock.try_lock() else {
            return;
        };
        let Ok((connector, neg)) = self.control_handles() else {
            return;
        };

        if self.opts.use_udp_channel && neg.udp_port.is_some() {
            if !self.tunnel.is_udp_mode() {
                if let Err(err) = self.open_udp_channel(&connector, &neg).await {
                    tracing::debug!(err = %err, "udp channel open failed");
                    self.handle_channel_error(err).await;
                }
            }
            return;
        }

        while self.tunnel.channel_count() < self.tunnel.max_packet_channels() {
            if self.state() != SessionState::Connected {
                return;
            }
            if let Err(err) = self.open_stream_channel(&connector, &neg).await {
                tracing::debug!(err = %err, "stream channel open failed");
                self.handle_channel_error(err).await;
                return;
            }
        }
    }

    async fn handle_channel_error(self: &Arc<Self>, err: ClientError) {
        match err {
            ClientError::Rejected(code) => self.handle_response_code(code).await,
            ClientError::Connector(_) | ClientError::NoEndpoint => {
                self.note_transport_error().await
            }
            ClientError::Disposed => {}
        }
    }

    async fn open_stream_channel(
        self: &Arc<Self>,
        connector: &Arc<Connector>,
        neg: &Arc<Negotiated>,
    ) -> Result<(), ClientError> {
        let (resp, stream) = connector
            .request::<_, SessionResponse>(
                OpCode::TcpPacketChannel,
                &TcpPacketChannelRequest {
                    session: neg.request_base(),
                },
            )
            .await?;
        if resp.error_code != ErrorCode::Ok {
            return Err(ClientError::Rejected(resp.error_code));
        }

        let lifespan = random_lifespan(self.opts.min_channel_lifespan, self.opts.max_channel_lifespan);
        let ch = StreamPacketChannel::spawn(
            format!("tcp:{}:{}", neg.session_id, self.tunnel.channel_count()),
            stream,
            StreamChannelOptions {
                queue_capacity: self.opts.packet_queue_capacity,
                lifespan,
            },
            self.from_server_tx.clone(),
        );
        if let Err(err) = self.tunnel.add_channel(ch.clone()) {
            ch.close();
            tracing::debug!(err = %err, "channel not added");
        }
        *self.first_error_at.lock().expect("error stamp poisoned") = None;
        Ok(())
    }

    async fn open_udp_channel(
        self: &Arc<Self>,
        connector: &Arc<Connector>,
        neg: &Arc<Negotiated>,
    ) -> Result<(), ClientError> {
        // Confirm the endpoint with the server before switching modes.
        let (resp, _stream) = connector
            .request::<_, UdpChannelResponse>(
                OpCode::UdpPacket,
                &UdpChannelRequest {
                    session: neg.request_base(),
                },
            )
            .await?;
        if resp.base.error_code != ErrorCode::Ok {
            return Err(ClientError::Rejected(resp.base.error_code));
        }
        let port = resp
            .udp_port
            .or(neg.udp_port)
            .ok_or(ClientError::Rejected(ErrorCode::GeneralError))?;

        let bind: SocketAddr = if neg.server_ip.is_ipv4() {
            "0.0.0.0:0".parse().expect("valid addr")
        } else {
            "[::]:0".parse().expect("valid addr")
        };
        let socket = tokio::net::UdpSocket::bind(bind)
            .await
            .map_err(|e| ConnectorError::Connect(SocketAddr::new(neg.server_ip, port), e))?;
        socket
            .connect(SocketAddr::new(neg.server_ip, port))
            .await
            .map_err(|e| ConnectorError::Connect(SocketAddr::new(neg.server_ip, port), e))?;

        let crypt = SessionCrypt::new(&neg.server_secret)
            .map_err(|_| ClientError::Rejected(ErrorCode::GeneralError))?;
        let ch = UdpPacketChannel::client(
            format!("udp:{}", neg.session_id),
            Arc::new(socket),
            neg.session_id,
            crypt,
            self.opts.packet_queue_capacity,
            self.from_server_tx.clone(),
        );
        if let Err(err) = self.tunnel.add_channel(ch.clone()) {
            ch.close();
            tracing::debug!(err = %err, "udp channel not added");
        }
        *self.first_error_at.lock().expect("error stamp poisoned") = None;
        Ok(())
    }

    // ----- lifecycle -----

    async fn cleanup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.opts.cleanup_interval) => {}
            }
            if *shutdown.borrow() {
                break;
            }
            let expired = self
                .negotiated
                .lock()
                .expect("negotiated poisoned")
                .as_ref()
                .and_then(|n| n.expiration)
                .is_some_and(|exp| now_millis() >= exp);
            if expired {
                self.dispose(ErrorCode::AccessExpired, Some("session expired".into()))
                    .await;
                break;
            }
        }
    }

    /// Disposes once; a second call is a no-op.
    pub async fn dispose(self: &Arc<Self>, code: ErrorCode, error: Option<String>) {
        {
            let mut disposed = self.disposed_code.lock().expect("disposed poisoned");
            if disposed.is_some() {
                return;
            }
            *disposed = Some(code);
        }
        self.set_state(SessionState::Disconnecting);
        if let Some(err) = &error {
            tracing::info!(code = ?code, err = %err, "client session disposing");
            self.write_connection_info(SessionState::Disconnecting, error.clone());
        }

        // Bye only after a successful connect and no fatal verdict.
        let send_bye =
            self.reached_connected.load(Ordering::Relaxed) && !self.fatal.load(Ordering::Relaxed);
        if send_bye {
            if let Ok((connector, neg)) = self.control_handles() {
                let bye = ByeRequest {
                    session: neg.request_base(),
                };
                let _ = tokio::time::timeout(
                    self.opts.bye_timeout,
                    connector.request::<_, SessionResponse>(OpCode::Bye, &bye),
                )
                .await;
            }
        }

        let _ = self.shutdown_tx.send(true);
        self.tunnel.remove_all_packet_channels();
        self.pool.shutdown();
        let connector = self.connector.lock().expect("connector poisoned").take();
        if let Some(connector) = connector {
            connector.disconnect().await;
        }
        self.set_state(SessionState::Disposed);
    }
}

fn random_lifespan(min: Duration, max: Duration) -> Option<Duration> {
    if max.is_zero() {
        return None;
    }
    let (lo, hi) = (min.min(max), min.max(max));
    if hi == lo {
        return Some(lo);
    }
    let span = (hi - lo).as_secs().max(1);
    let extra = rand::random_range(0..span);
    Some(lo + Duration::from_secs(extra))
}

fn is_local_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_link_local() || v4.is_loopback() || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifespan_stays_in_bounds() {
        for _ in 0..32 {
            let l = random_lifespan(Duration::from_secs(300), Duration::from_secs(1200)).unwrap();
            assert!(l >= Duration::from_secs(300) && l <= Duration::from_secs(1200));
        }
        assert_eq!(random_lifespan(Duration::ZERO, Duration::ZERO), None);
        assert_eq!(
            random_lifespan(Duration::from_secs(5), Duration::from_secs(5)),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn local_addresses_are_recognized() {
        assert!(is_local_address("192.168.1.1".parse().unwrap()));
        assert!(is_local_address("10.0.0.1".parse().unwrap()));
        assert!(is_local_address("127.0.0.1".parse().unwrap()));
        assert!(is_local_address("fe80::1".parse().unwrap()));
        assert!(is_local_address("fd00::1".parse().unwrap()));
        assert!(!is_local_address("8.8.8.8".parse().unwrap()));
        assert!(!is_local_address("2001:4860:4860::8888".parse().unwrap()));
    }
}
