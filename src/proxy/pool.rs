use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::packet::{self, IpProtocol, PacketMeta};
use crate::protocol::Traffic;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("packet not parseable")]
    BadPacket,
    #[error("protocol not proxyable")]
    Unsupported,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Issues ICMP echo handles. Raw sockets need privileges and platform glue,
/// so the factory is injected; the pool only speaks this interface.
#[async_trait]
pub trait RawSocketFactory: Send + Sync {
    async fn open_icmp(&self, v6: bool) -> std::io::Result<Arc<dyn IcmpHandle>>;
}

#[derive(Debug, Clone)]
pub struct IcmpEcho {
    pub from: IpAddr,
    pub ident: u16,
    pub seq: u16,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait IcmpHandle: Send + Sync {
    async fn send_echo(&self, dst: IpAddr, ident: u16, seq: u16, payload: &[u8])
    -> std::io::Result<()>;
    async fn recv_echo(&self) -> std::io::Result<IcmpEcho>;
}

#[derive(Debug, Clone)]
pub struct ProxyPoolOptions {
    pub udp_timeout: Duration,
    pub icmp_timeout: Duration,
    pub max_udp_client_count: usize,
    pub max_ping_client_count: usize,
}

impl Default for ProxyPoolOptions {
    fn default() -> Self {
        Self {
            udp_timeout: Duration::from_secs(120),
            icmp_timeout: Duration::from_secs(30),
            max_udp_client_count: 500,
            max_ping_client_count: 200,
        }
    }
}

/// Observers for flow lifecycle: `new_endpoint` fires once per previously
/// unseen remote (the NetScan feed), `mapping` once per established local
/// binding.
#[derive(Clone, Default)]
pub struct ProxyPoolCallbacks {
    pub new_endpoint: Option<Arc<dyn Fn(SocketAddr) + Send + Sync>>,
    pub mapping: Option<Arc<dyn Fn(SocketAddr, SocketAddr) + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct UdpFlowKey {
    src: SocketAddr,
    dst: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct IcmpFlowKey {
    src: IpAddr,
    dst: IpAddr,
    ident: u16,
}

struct UdpFlow {
    socket: Arc<UdpSocket>,
    last_used: Mutex<Instant>,
    stop: watch::Sender<bool>,
}

struct IcmpFlow {
    handle: Arc<dyn IcmpHandle>,
    last_used: Mutex<Instant>,
    stop: watch::Sender<bool>,
}

/// NAT between a session's virtual addresses and the public interface.
///
/// UDP flows are keyed by the client 5-tuple and mapped to ephemeral
/// outbound sockets; ICMP echo flows to raw echo handles. Replies are
/// rebuilt into IP packets addressed to the virtual source and pushed to
/// the owner sink. Idle flows expire; hard caps evict least-recently-used.
pub struct ProxyPool {
    opts: ProxyPoolOptions,
    raw: Arc<dyn RawSocketFactory>,
    sink: mpsc::Sender<Bytes>,
    callbacks: ProxyPoolCallbacks,
    udp_flows: Mutex<LruCache<UdpFlowKey, Arc<UdpFlow>>>,
    icmp_flows: Mutex<LruCache<IcmpFlowKey, Arc<IcmpFlow>>>,
    traffic: Mutex<Traffic>,
}

impl ProxyPool {
    pub fn new(
        opts: ProxyPoolOptions,
        raw: Arc<dyn RawSocketFactory>,
        sink: mpsc::Sender<Bytes>,
        callbacks: ProxyPoolCallbacks,
    ) -> Arc<Self> {
        let udp_cap = NonZeroUsize::new(opts.max_udp_client_count.max(1)).expect("nonzero");
        let icmp_cap = NonZeroUsize::new(opts.max_ping_client_count.max(1)).expect("nonzero");
        Arc::new(Self {
            opts,
            raw,
            sink,
            callbacks,
            udp_flows: Mutex::new(LruCache::new(udp_cap)),
            icmp_flows: Mutex::new(LruCache::new(icmp_cap)),
            traffic: Mutex::new(Traffic::default()),
        })
    }

    pub fn udp_flow_count(&self) -> usize {
        self.udp_flows.lock().expect("udp flows poisoned").len()
    }

    pub fn icmp_flow_count(&self) -> usize {
        self.icmp_flows.lock().expect("icmp flows poisoned").len()
    }

    pub fn traffic(&self) -> Traffic {
        *self.traffic.lock().expect("pool traffic poisoned")
    }

    /// Routes one outbound IP packet from the session into the NAT.
    pub async fn handle_packet(self: &Arc<Self>, pkt: &[u8]) -> Result<(), PoolError> {
        let meta = packet::parse(pkt).ok_or(PoolError::BadPacket)?;
        match meta.protocol {
            IpProtocol::Udp => self.handle_udp(&meta, pkt).await,
            IpProtocol::Icmp | IpProtocol::IcmpV6 if meta.is_icmp_echo_request() => {
                self.handle_icmp(&meta, pkt).await
            }
            _ => Err(PoolError::Unsupported),
        }
    }

    /// Drops every flow; the pool is unusable afterwards.
    pub fn shutdown(&self) {
        let mut udp = self.udp_flows.lock().expect("udp flows poisoned");
        while let Some((_, flow)) = udp.pop_lru() {
            let _ = flow.stop.send(true);
        }
        drop(udp);
        let mut icmp = self.icmp_flows.lock().expect("icmp flows poisoned");
        while let Some((_, flow)) = icmp.pop_lru() {
            let _ = flow.stop.send(true);
        }
    }

    async fn handle_udp(self: &Arc<Self>, meta: &PacketMeta, pkt: &[u8]) -> Result<(), PoolError> {
        let payload = meta.udp_payload(pkt).ok_or(PoolError::BadPacket)?;
        let key = UdpFlowKey {
            src: meta.src_socket(),
            dst: meta.dst_socket(),
        };

        let flow = {
            let cached = self
                .udp_flows
                .lock()
                .expect("udp flows poisoned")
                .get(&key)
                .cloned();
            match cached {
                Some(f) => f,
                None => self.open_udp_flow(key).await?,
            }
        };

        *flow.last_used.lock().expect("flow stamp poisoned") = Instant::now();
        let n = flow.socket.send(payload).await?;
        self.traffic.lock().expect("pool traffic poisoned").sent += n as u64;
        Ok(())
    }

    async fn open_udp_flow(self: &Arc<Self>, key: UdpFlowKey) -> Result<Arc<UdpFlow>, PoolError> {
        let bind_addr: SocketAddr = if key.dst.is_ipv4() {
            "0.0.0.0:0".parse().expect("valid addr")
        } else {
            "[::]:0".parse().expect("valid addr")
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        socket.connect(key.dst).await?;

        if let Some(cb) = &self.callbacks.new_endpoint {
            cb(key.dst);
        }
        if let (Some(cb), Ok(local)) = (&self.callbacks.mapping, socket.local_addr()) {
            cb(local, key.dst);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let flow = Arc::new(UdpFlow {
            socket: socket.clone(),
            last_used: Mutex::new(Instant::now()),
            stop: stop_tx,
        });

        let evicted = {
            let mut flows = self.udp_flows.lock().expect("udp flows poisoned");
            let evicted = if flows.len() >= self.opts.max_udp_client_count {
                flows.pop_lru()
            } else {
                None
            };
            flows.put(key, flow.clone());
            evicted
        };
        if let Some((_, old)) = evicted {
            let _ = old.stop.send(true);
        }

        tokio::spawn(udp_flow_reader(
            Arc::downgrade(self),
            key,
            flow.clone(),
            stop_rx,
            self.sink.clone(),
            self.opts.udp_timeout,
        ));
        Ok(flow)
    }

    async fn handle_icmp(self: &Arc<Self>, meta: &PacketMeta, pkt: &[u8]) -> Result<(), PoolError> {
        let icmp = meta.icmp.ok_or(PoolError::BadPacket)?;
        let payload = meta.icmp_payload(pkt).ok_or(PoolError::BadPacket)?;
        let key = IcmpFlowKey {
            src: meta.src,
            dst: meta.dst,
            ident: icmp.ident,
        };

        let flow = {
            let cached = self
                .icmp_flows
                .lock()
                .expect("icmp flows poisoned")
                .get(&key)
                .cloned();
            match cached {
                Some(f) => f,
                None => self.open_icmp_flow(key).await?,
            }
        };

        *flow.last_used.lock().expect("flow stamp poisoned") = Instant::now();
        flow.handle
            .send_echo(key.dst, icmp.ident, icmp.seq, payload)
            .await?;
        self.traffic.lock().expect("pool traffic poisoned").sent += pkt.len() as u64;
        Ok(())
    }

    async fn open_icmp_flow(self: &Arc<Self>, key: IcmpFlowKey) -> Result<Arc<IcmpFlow>, PoolError> {
        let handle = self.raw.open_icmp(key.dst.is_ipv6()).await?;

        if let Some(cb) = &self.callbacks.new_endpoint {
            cb(SocketAddr::new(key.dst, 0));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let flow = Arc::new(IcmpFlow {
            handle: handle.clone(),
            last_used: Mutex::new(Instant::now()),
            stop: stop_tx,
        });

        let evicted = {
            let mut flows = self.icmp_flows.lock().expect("icmp flows poisoned");
            let evicted = if flows.len() >= self.opts.max_ping_client_count {
                flows.pop_lru()
            } else {
                None
            };
            flows.put(key, flow.clone());
            evicted
        };
        if let Some((_, old)) = evicted {
            let _ = old.stop.send(true);
        }

        tokio::spawn(icmp_flow_reader(
            Arc::downgrade(self),
            key,
            flow.clone(),
            stop_rx,
            self.sink.clone(),
            self.opts.icmp_timeout,
        ));
        Ok(flow)
    }

    fn count_received(&self, n: usize) {
        self.traffic.lock().expect("pool traffic poisoned").received += n as u64;
    }
}

/// Reads NAT replies for one UDP flow, rebuilding IP packets toward the
/// client virtual address. The same task is the idle watchdog.
async fn udp_flow_reader(
    pool: Weak<ProxyPool>,
    key: UdpFlowKey,
    flow: Arc<UdpFlow>,
    mut stop: watch::Receiver<bool>,
    sink: mpsc::Sender<Bytes>,
    idle_timeout: Duration,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let idle_deadline = *flow.last_used.lock().expect("flow stamp poisoned") + idle_timeout;
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                let now = Instant::now();
                if now >= *flow.last_used.lock().expect("flow stamp poisoned") + idle_timeout {
                    if let Some(pool) = pool.upgrade() {
                        let mut flows = pool.udp_flows.lock().expect("udp flows poisoned");
                        // A newer flow may already own this key.
                        if flows.peek(&key).is_some_and(|cur| Arc::ptr_eq(cur, &flow)) {
                            flows.pop(&key);
                        }
                    }
                    break;
                }
            }
            res = flow.socket.recv(&mut buf) => {
                let Ok(n) = res else { break };
                *flow.last_used.lock().expect("flow stamp poisoned") = Instant::now();
                let Some(reply) = packet::build_udp_packet(key.dst, key.src, &buf[..n]) else {
                    continue;
                };
                if let Some(pool) = pool.upgrade() {
                    pool.count_received(reply.len());
                }
                // A saturated sink disposes the reply; UDP owes no delivery.
                let _ = sink.try_send(Bytes::from(reply));
            }
        }
    }
}

async fn icmp_flow_reader(
    pool: Weak<ProxyPool>,
    key: IcmpFlowKey,
    flow: Arc<IcmpFlow>,
    mut stop: watch::Receiver<bool>,
    sink: mpsc::Sender<Bytes>,
    idle_timeout: Duration,
) {
    loop {
        let idle_deadline = *flow.last_used.lock().expect("flow stamp poisoned") + idle_timeout;
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                let now = Instant::now();
                if now >= *flow.last_used.lock().expect("flow stamp poisoned") + idle_timeout {
                    if let Some(pool) = pool.upgrade() {
                        let mut flows = pool.icmp_flows.lock().expect("icmp flows poisoned");
                        if flows.peek(&key).is_some_and(|cur| Arc::ptr_eq(cur, &flow)) {
                            flows.pop(&key);
                        }
                    }
                    break;
                }
            }
            res = flow.handle.recv_echo() => {
                let Ok(echo) = res else { break };
                if echo.ident != key.ident {
                    continue;
                }
                *flow.last_used.lock().expect("flow stamp poisoned") = Instant::now();
                let Some(reply) = packet::build_icmp_echo(
                    echo.from,
                    key.src,
                    true,
                    echo.ident,
                    echo.seq,
                    &echo.payload,
                ) else {
                    continue;
                };
                if let Some(pool) = pool.upgrade() {
                    pool.count_received(reply.len());
                }
                let _ = sink.try_send(Bytes::from(reply));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_udp_packet;

    /// Echoes every request back, as if the destination always answers.
    struct EchoIcmpFactory;

    struct EchoIcmpHandle {
        tx: mpsc::Sender<IcmpEcho>,
        rx: tokio::sync::Mutex<mpsc::Receiver<IcmpEcho>>,
    }

    #[async_trait]
    impl RawSocketFactory for EchoIcmpFactory {
        async fn open_icmp(&self, _v6: bool) -> std::io::Result<Arc<dyn IcmpHandle>> {
            let (tx, rx) = mpsc::channel(16);
            Ok(Arc::new(EchoIcmpHandle {
                tx,
                rx: tokio::sync::Mutex::new(rx),
            }))
        }
    }

    #[async_trait]
    impl IcmpHandle for EchoIcmpHandle {
        async fn send_echo(
            &self,
            dst: IpAddr,
            ident: u16,
            seq: u16,
            payload: &[u8],
        ) -> std::io::Result<()> {
            let _ = self
                .tx
                .send(IcmpEcho {
                    from: dst,
                    ident,
                    seq,
                    payload: payload.to_vec(),
                })
                .await;
            Ok(())
        }

        async fn recv_echo(&self) -> std::io::Result<IcmpEcho> {
            self.rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    fn pool_with_sink(
        opts: ProxyPoolOptions,
    ) -> (Arc<ProxyPool>, mpsc::Receiver<Bytes>) {
        let (sink, rx) = mpsc::channel(64);
        let pool = ProxyPool::new(opts, Arc::new(EchoIcmpFactory), sink, Default::default());
        (pool, rx)
    }

    #[tokio::test]
    async fn udp_flow_roundtrips_through_the_nat() {
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();

        let (pool, mut rx) = pool_with_sink(Default::default());
        let virtual_src: SocketAddr = "10.255.0.2:40000".parse().unwrap();
        let pkt = build_udp_packet(virtual_src, remote_addr, b"question").unwrap();

        pool.handle_packet(&pkt).await.unwrap();
        assert_eq!(pool.udp_flow_count(), 1);

        let mut buf = [0u8; 1024];
        let (n, from) = remote.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"question");

        remote.send_to(b"answer", from).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        let meta = packet::parse(&reply).unwrap();
        assert_eq!(meta.src_socket(), remote_addr);
        assert_eq!(meta.dst_socket(), virtual_src);
        assert_eq!(meta.udp_payload(&reply).unwrap(), b"answer");
    }

    #[tokio::test]
    async fn icmp_echo_is_answered_via_the_factory() {
        let (pool, mut rx) = pool_with_sink(Default::default());
        let src: IpAddr = "10.255.0.2".parse().unwrap();
        let dst: IpAddr = "192.0.2.1".parse().unwrap();
        let ping = packet::build_icmp_echo(src, dst, false, 7, 1, b"payload").unwrap();

        pool.handle_packet(&ping).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();

        let meta = packet::parse(&reply).unwrap();
        assert!(meta.is_icmp_echo_reply());
        assert_eq!(meta.src, dst);
        assert_eq!(meta.dst, src);
        assert_eq!(meta.icmp.unwrap().ident, 7);
    }

    #[tokio::test]
    async fn tcp_packets_are_not_proxyable() {
        let (pool, _rx) = pool_with_sink(Default::default());
        // Hand-assemble a minimal TCP/IPv4 packet.
        let udp = build_udp_packet(
            "10.0.0.1:1".parse().unwrap(),
            "10.0.0.2:2".parse().unwrap(),
            b"",
        )
        .unwrap();
        let mut tcp = udp.clone();
        tcp[9] = packet::PROTO_TCP;
        assert!(matches!(
            pool.handle_packet(&tcp).await,
            Err(PoolError::Unsupported)
        ));
    }

    #[tokio::test]
    async fn udp_flows_respect_the_hard_cap() {
        let (pool, _rx) = pool_with_sink(ProxyPoolOptions {
            max_udp_client_count: 2,
            ..Default::default()
        });
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();

        for port in 1..=3u16 {
            let src: SocketAddr = format!("10.255.0.2:{}", 40000 + port).parse().unwrap();
            let pkt = build_udp_packet(src, remote_addr, b"x").unwrap();
            pool.handle_packet(&pkt).await.unwrap();
        }
        assert_eq!(pool.udp_flow_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_udp_flows_expire() {
        let (pool, _rx) = pool_with_sink(ProxyPoolOptions {
            udp_timeout: Duration::from_secs(5),
            ..Default::default()
        });
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();

        let pkt = build_udp_packet("10.255.0.2:40001".parse().unwrap(), remote_addr, b"x").unwrap();
        pool.handle_packet(&pkt).await.unwrap();
        assert_eq!(pool.udp_flow_count(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(pool.udp_flow_count(), 0);
    }
}
