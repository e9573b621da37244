use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};

use crate::crypto::SessionCrypt;
use crate::protocol::{self, Traffic};
use crate::tunnel::{ChannelError, ChannelState, PacketChannel};

/// Largest datagram either side will emit; headroom over the tunnel MTU for
/// the frame header and the AEAD tag.
pub const MAX_UDP_DATAGRAM: usize = 0xffff;

enum UdpEndpoint {
    /// Client mode: a socket of our own, connected to the server.
    Client { socket: Arc<UdpSocket> },
    /// Server mode: the process-wide socket shared by all sessions; replies
    /// go to wherever the last authenticated datagram came from.
    Shared {
        socket: Arc<UdpSocket>,
        peer: Mutex<Option<SocketAddr>>,
    },
}

/// The unordered packet channel. Each datagram is sealed with the session
/// crypt at a strictly-increasing position; the position travels in the
/// frame header and doubles as the AEAD nonce input.
pub struct UdpPacketChannel {
    id: String,
    session_id: u64,
    crypt: SessionCrypt,
    endpoint: UdpEndpoint,
    state: AtomicU8,
    position: AtomicU64,
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    out_tx: mpsc::Sender<Bytes>,
    shutdown_tx: watch::Sender<bool>,
    sink: mpsc::Sender<Bytes>,
}

impl UdpPacketChannel {
    /// Client-side channel owning its socket. The socket must already be
    /// connected to the server's UDP endpoint.
    pub fn client(
        id: impl Into<String>,
        socket: Arc<UdpSocket>,
        session_id: u64,
        crypt: SessionCrypt,
        queue_capacity: usize,
        sink: mpsc::Sender<Bytes>,
    ) -> Arc<Self> {
        let ch = Self::build(
            id,
            UdpEndpoint::Client {
                socket: socket.clone(),
            },
            session_id,
            crypt,
            queue_capacity,
            sink,
        );

        let reader = ch.clone();
        let mut shutdown = ch.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_UDP_DATAGRAM];
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    res = socket.recv(&mut buf) => {
                        let Ok(n) = res else { break };
                        reader.accept_datagram(&buf[..n], None);
                    }
                }
            }
            reader.set_state(ChannelState::Closed);
        });

        ch
    }

    fn build(
        id: impl Into<String>,
        endpoint: UdpEndpoint,
        session_id: u64,
        crypt: SessionCrypt,
        queue_capacity: usize,
        sink: mpsc::Sender<Bytes>,
    ) -> Arc<Self> {
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(queue_capacity.max(1));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let ch = Arc::new(Self {
            id: id.into(),
            session_id,
            crypt,
            endpoint,
            state: AtomicU8::new(ChannelState::Connected as u8),
            position: AtomicU64::new(1),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            out_tx,
            shutdown_tx,
            sink,
        });

        let writer = ch.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    pkt = out_rx.recv() => {
                        let Some(pkt) = pkt else { break };
                        writer.transmit(&pkt).await;
                    }
                }
            }
            writer.set_state(ChannelState::Closed);
        });

        ch
    }

    async fn transmit(&self, packet: &[u8]) {
        let position = self.position.fetch_add(1, Ordering::Relaxed);
        let sealed = self.crypt.seal(position, packet);
        let frame = protocol::encode_udp_frame(self.session_id, position, &sealed);

        let res = match &self.endpoint {
            UdpEndpoint::Client { socket } => socket.send(&frame).await,
            UdpEndpoint::Shared { socket, peer } => {
                let target = *peer.lock().expect("udp peer poisoned");
                match target {
                    Some(addr) => socket.send_to(&frame, addr).await,
                    None => {
                        // No authenticated return address yet.
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
        };

        match res {
            Ok(n) => {
                self.sent.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(err) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(channel = %self.id, err = %err, "udp send failed");
            }
        }
    }

    /// Feeds one raw datagram into the channel: decode, authenticate,
    /// deliver. Server mode learns the peer return address from the first
    /// datagram that authenticates.
    pub fn accept_datagram(&self, frame: &[u8], from: Option<SocketAddr>) {
        if self.state() >= ChannelState::Closing {
            return;
        }
        let Ok((session_id, position, ciphertext)) = protocol::decode_udp_frame(frame) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if session_id != self.session_id {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Ok(packet) = self.crypt.open(position, ciphertext) else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if let (UdpEndpoint::Shared { peer, .. }, Some(from)) = (&self.endpoint, from) {
            *peer.lock().expect("udp peer poisoned") = Some(from);
        }

        self.received.fetch_add(frame.len() as u64, Ordering::Relaxed);
        match self.sink.try_send(Bytes::from(packet)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => self.close(),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn set_state(&self, s: ChannelState) {
        self.state.store(s as u8, Ordering::Release);
    }
}

impl PacketChannel for UdpPacketChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_stream(&self) -> bool {
        false
    }

    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn send(&self, packet: Bytes) -> Result<(), ChannelError> {
        if self.state() >= ChannelState::Closing {
            return Err(ChannelError::Closed);
        }
        match self.out_tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(ChannelError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ChannelError::Closed),
        }
    }

    fn traffic(&self) -> Traffic {
        Traffic::new(
            self.sent.load(Ordering::Relaxed),
            self.received.load(Ordering::Relaxed),
        )
    }

    fn close(&self) {
        if self.state() < ChannelState::Closing {
            self.set_state(ChannelState::Closing);
        }
        let _ = self.shutdown_tx.send(true);
    }
}

/// Server-side owner of the shared UDP socket. One hub serves every session
/// on the endpoint; inbound datagrams are dispatched by the session id in
/// the frame header.
pub struct UdpChannelHub {
    socket: Arc<UdpSocket>,
    channels: DashMap<u64, Arc<UdpPacketChannel>>,
}

impl UdpChannelHub {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Arc<Self>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        Ok(Arc::new(Self {
            socket,
            channels: DashMap::new(),
        }))
    }

    pub fn local_port(&self) -> Option<u16> {
        self.socket.local_addr().ok().map(|a| a.port())
    }

    /// Registers a channel for a session, replacing any previous one.
    pub fn create_channel(
        &self,
        session_id: u64,
        crypt: SessionCrypt,
        queue_capacity: usize,
        sink: mpsc::Sender<Bytes>,
    ) -> Arc<UdpPacketChannel> {
        let ch = UdpPacketChannel::build(
            format!("udp:{session_id}"),
            UdpEndpoint::Shared {
                socket: self.socket.clone(),
                peer: Mutex::new(None),
            },
            session_id,
            crypt,
            queue_capacity,
            sink,
        );
        if let Some(old) = self.channels.insert(session_id, ch.clone()) {
            old.close();
        }
        ch
    }

    pub fn remove_channel(&self, session_id: u64) {
        if let Some((_, ch)) = self.channels.remove(&session_id) {
            ch.close();
        }
    }

    /// Receive loop; runs until shutdown flips or the socket errors.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut buf = vec![0u8; MAX_UDP_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                res = self.socket.recv_from(&mut buf) => {
                    let Ok((n, from)) = res else { break };
                    let Ok((session_id, _, _)) = protocol::decode_udp_frame(&buf[..n]) else {
                        continue;
                    };
                    let Some(ch) = self.channels.get(&session_id).map(|e| e.value().clone())
                    else {
                        continue;
                    };
                    ch.accept_datagram(&buf[..n], Some(from));
                }
            }
        }

        for entry in self.channels.iter() {
            entry.value().close();
        }
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;
    use std::time::Duration;

    async fn client_server_pair() -> (Arc<UdpPacketChannel>, Arc<UdpPacketChannel>, Arc<UdpChannelHub>, mpsc::Receiver<Bytes>, mpsc::Receiver<Bytes>) {
        let secret = crypto::random_key();
        let session_id = 404;

        let hub = UdpChannelHub::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let port = hub.local_port().unwrap();

        let (server_sink, server_rx) = mpsc::channel(32);
        let server_ch = hub.create_channel(
            session_id,
            SessionCrypt::new(&secret).unwrap(),
            32,
            server_sink,
        );

        let (_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(hub.clone().run(shutdown_rx));
        // Leak the shutdown sender for the test's lifetime.
        std::mem::forget(_tx);

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket.connect(("127.0.0.1", port)).await.unwrap();
        let (client_sink, client_rx) = mpsc::channel(32);
        let client_ch = UdpPacketChannel::client(
            "udp:client",
            Arc::new(socket),
            session_id,
            SessionCrypt::new(&secret).unwrap(),
            32,
            client_sink,
        );

        (client_ch, server_ch, hub, client_rx, server_rx)
    }

    #[tokio::test]
    async fn datagrams_flow_both_ways() {
        let (client, server, _hub, mut client_rx, mut server_rx) = client_server_pair().await;

        client.send(Bytes::from_static(b"up-packet")).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), server_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_ref(), b"up-packet");

        // The hub learned the return address from the first datagram.
        server.send(Bytes::from_static(b"down-packet")).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), client_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_ref(), b"down-packet");
    }

    #[tokio::test]
    async fn forged_datagrams_are_dropped() {
        let (client, _server, _hub, _client_rx, mut server_rx) = client_server_pair().await;

        client.send(Bytes::from_static(b"good")).unwrap();
        tokio::time::timeout(Duration::from_secs(2), server_rx.recv())
            .await
            .unwrap()
            .unwrap();

        // A frame sealed under the wrong key never reaches the sink.
        let bogus_crypt = SessionCrypt::new(&crypto::random_key()).unwrap();
        let sealed = bogus_crypt.seal(1, b"forged");
        let frame = protocol::encode_udp_frame(404, 1, &sealed);
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = _hub.local_port().unwrap();
        sock.send_to(&frame, ("127.0.0.1", port)).await.unwrap();

        let got = tokio::time::timeout(Duration::from_millis(300), server_rx.recv()).await;
        assert!(got.is_err(), "forged frame must not be delivered");
    }

    #[tokio::test]
    async fn closed_channel_rejects_send() {
        let (client, _server, _hub, _client_rx, _server_rx) = client_server_pair().await;
        client.close();
        assert_eq!(
            client.send(Bytes::from_static(b"late")),
            Err(ChannelError::Closed)
        );
    }
}
