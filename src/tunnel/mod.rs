use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

use crate::protocol::Traffic;

pub mod speedometer;
pub mod stream;
pub mod udp;

use self::speedometer::Speedometer;

pub const DEFAULT_PACKET_QUEUE_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Connected = 1,
    Closing = 2,
    Closed = 3,
}

impl ChannelState {
    pub(crate) fn from_u8(v: u8) -> ChannelState {
        match v {
            0 => ChannelState::Connecting,
            1 => ChannelState::Connected,
            2 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("send queue full")]
    QueueFull,
    #[error("packet channel limit reached")]
    LimitReached,
}

/// A framed transport carrying whole IP packets for one session.
///
/// `send` must never block: it enqueues or fails. Inbound packets are pushed
/// to the sink the channel was constructed with.
pub trait PacketChannel: Send + Sync {
    fn id(&self) -> &str;
    fn is_stream(&self) -> bool;
    fn state(&self) -> ChannelState;
    fn send(&self, packet: Bytes) -> Result<(), ChannelError>;
    fn traffic(&self) -> Traffic;
    /// Begin a graceful close; idempotent.
    fn close(&self);
}

/// The set of packet channels belonging to one session plus its multiplexer.
///
/// Outgoing packets round-robin across connected channels; incoming packets
/// from every channel fan in to the single owner sink. Closed channels are
/// pruned lazily and their counters folded into `closed_traffic` so the
/// tunnel total stays the sum over its channels.
pub struct Tunnel {
    channels: RwLock<Vec<Arc<dyn PacketChannel>>>,
    rr: AtomicUsize,
    max_packet_channels: AtomicUsize,
    closed_traffic: Mutex<Traffic>,
    dropped: AtomicU64,
    speedometer: Arc<Speedometer>,
}

impl Tunnel {
    pub fn new(max_packet_channels: usize) -> Self {
        Self {
            channels: RwLock::new(Vec::new()),
            rr: AtomicUsize::new(0),
            max_packet_channels: AtomicUsize::new(max_packet_channels.max(1)),
            closed_traffic: Mutex::new(Traffic::default()),
            dropped: AtomicU64::new(0),
            speedometer: Arc::new(Speedometer::default()),
        }
    }

    pub fn max_packet_channels(&self) -> usize {
        self.max_packet_channels.load(Ordering::Relaxed)
    }

    /// Shrinking never evicts existing channels; the tunnel just stops
    /// accepting new ones until the count falls below the new limit.
    pub fn set_max_packet_channels(&self, n: usize) {
        self.max_packet_channels.store(n.max(1), Ordering::Relaxed);
    }

    pub fn channel_count(&self) -> usize {
        self.prune_closed();
        self.channels.read().expect("channel list poisoned").len()
    }

    pub fn is_udp_mode(&self) -> bool {
        self.channels
            .read()
            .expect("channel list poisoned")
            .iter()
            .any(|c| !c.is_stream())
    }

    /// Adds a channel, enforcing the channel-count limit and the UDP-mode
    /// invariant: a UDP channel displaces every stream channel and at most
    /// one UDP channel exists.
    pub fn add_channel(&self, ch: Arc<dyn PacketChannel>) -> Result<(), ChannelError> {
        self.prune_closed();
        let mut channels = self.channels.write().expect("channel list poisoned");

        if !ch.is_stream() {
            for old in channels.drain(..) {
                old.close();
                self.fold_traffic(&*old);
            }
        } else if channels.iter().any(|c| !c.is_stream()) {
            // Stream channels may not join a UDP-mode tunnel.
            return Err(ChannelError::LimitReached);
        }

        if channels.len() >= self.max_packet_channels.load(Ordering::Relaxed) {
            return Err(ChannelError::LimitReached);
        }
        channels.push(ch);
        Ok(())
    }

    pub fn remove_all_packet_channels(&self) {
        let mut channels = self.channels.write().expect("channel list poisoned");
        for ch in channels.drain(..) {
            ch.close();
            self.fold_traffic(&*ch);
        }
    }

    /// Non-blocking send: round-robin over connected channels, skipping any
    /// that refuse. A packet nobody accepts is dropped and counted.
    pub fn send(&self, packet: Bytes) -> Result<(), ChannelError> {
        let channels = self.channels.read().expect("channel list poisoned");
        let n = channels.len();
        if n == 0 {
            drop(channels);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(ChannelError::Closed);
        }

        let start = self.rr.fetch_add(1, Ordering::Relaxed);
        let mut err = ChannelError::Closed;
        for i in 0..n {
            let ch = &channels[(start + i) % n];
            if ch.state() != ChannelState::Connected {
                continue;
            }
            match ch.send(packet.clone()) {
                Ok(()) => return Ok(()),
                Err(e) => err = e,
            }
        }
        drop(channels);
        self.dropped.fetch_add(1, Ordering::Relaxed);
        Err(err)
    }

    pub fn traffic(&self) -> Traffic {
        let mut total = *self.closed_traffic.lock().expect("closed traffic poisoned");
        for ch in self.channels.read().expect("channel list poisoned").iter() {
            total += ch.traffic();
        }
        total
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn speed(&self) -> Traffic {
        self.speedometer.speed()
    }

    /// Starts the optional 1-Hz sampler feeding [`Tunnel::speed`]. Runs
    /// until the tunnel is dropped.
    pub fn start_speedometer(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let Some(tunnel) = weak.upgrade() else { break };
                tunnel.speedometer.sample(tunnel.traffic());
            }
        });
    }

    fn prune_closed(&self) {
        let has_closed = self
            .channels
            .read()
            .expect("channel list poisoned")
            .iter()
            .any(|c| c.state() == ChannelState::Closed);
        if !has_closed {
            return;
        }
        let mut channels = self.channels.write().expect("channel list poisoned");
        channels.retain(|ch| {
            if ch.state() == ChannelState::Closed {
                self.fold_traffic(&**ch);
                false
            } else {
                true
            }
        });
    }

    fn fold_traffic(&self, ch: &dyn PacketChannel) {
        let mut closed = self.closed_traffic.lock().expect("closed traffic poisoned");
        *closed += ch.traffic();
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.remove_all_packet_channels();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU8;

    struct FakeChannel {
        id: String,
        stream: bool,
        state: AtomicU8,
        accepted: Mutex<Vec<Bytes>>,
        sent: AtomicU64,
    }

    impl FakeChannel {
        fn new(id: &str, stream: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                stream,
                state: AtomicU8::new(ChannelState::Connected as u8),
                accepted: Mutex::new(Vec::new()),
                sent: AtomicU64::new(0),
            })
        }
    }

    impl PacketChannel for FakeChannel {
        fn id(&self) -> &str {
            &self.id
        }

        fn is_stream(&self) -> bool {
            self.stream
        }

        fn state(&self) -> ChannelState {
            ChannelState::from_u8(self.state.load(Ordering::Relaxed))
        }

        fn send(&self, packet: Bytes) -> Result<(), ChannelError> {
            if self.state() != ChannelState::Connected {
                return Err(ChannelError::Closed);
            }
            self.sent.fetch_add(packet.len() as u64, Ordering::Relaxed);
            self.accepted.lock().unwrap().push(packet);
            Ok(())
        }

        fn traffic(&self) -> Traffic {
            Traffic::new(self.sent.load(Ordering::Relaxed), 0)
        }

        fn close(&self) {
            self.state
                .store(ChannelState::Closed as u8, Ordering::Relaxed);
        }
    }

    #[test]
    fn round_robin_spreads_across_connected_channels() {
        let tunnel = Tunnel::new(4);
        let a = FakeChannel::new("a", true);
        let b = FakeChannel::new("b", true);
        tunnel.add_channel(a.clone()).unwrap();
        tunnel.add_channel(b.clone()).unwrap();

        for _ in 0..10 {
            tunnel.send(Bytes::from_static(b"pkt")).unwrap();
        }
        assert_eq!(a.accepted.lock().unwrap().len(), 5);
        assert_eq!(b.accepted.lock().unwrap().len(), 5);
    }

    #[test]
    fn send_skips_non_connected_channels() {
        let tunnel = Tunnel::new(4);
        let a = FakeChannel::new("a", true);
        let b = FakeChannel::new("b", true);
        tunnel.add_channel(a.clone()).unwrap();
        tunnel.add_channel(b.clone()).unwrap();
        a.close();

        for _ in 0..4 {
            tunnel.send(Bytes::from_static(b"pkt")).unwrap();
        }
        assert_eq!(a.accepted.lock().unwrap().len(), 0);
        assert_eq!(b.accepted.lock().unwrap().len(), 4);
    }

    #[test]
    fn send_with_no_channels_counts_a_drop() {
        let tunnel = Tunnel::new(2);
        assert_eq!(
            tunnel.send(Bytes::from_static(b"pkt")),
            Err(ChannelError::Closed)
        );
        assert_eq!(tunnel.dropped(), 1);
    }

    #[test]
    fn channel_limit_is_enforced_but_never_evicts() {
        let tunnel = Tunnel::new(2);
        tunnel.add_channel(FakeChannel::new("a", true)).unwrap();
        tunnel.add_channel(FakeChannel::new("b", true)).unwrap();
        assert_eq!(
            tunnel.add_channel(FakeChannel::new("c", true)),
            Err(ChannelError::LimitReached)
        );

        tunnel.set_max_packet_channels(1);
        assert_eq!(tunnel.channel_count(), 2);
    }

    #[test]
    fn udp_channel_displaces_stream_channels() {
        let tunnel = Tunnel::new(4);
        let a = FakeChannel::new("a", true);
        tunnel.add_channel(a.clone()).unwrap();
        tunnel.add_channel(FakeChannel::new("u", false)).unwrap();

        assert_eq!(a.state(), ChannelState::Closed);
        assert_eq!(tunnel.channel_count(), 1);
        assert!(tunnel.is_udp_mode());

        assert_eq!(
            tunnel.add_channel(FakeChannel::new("b", true)),
            Err(ChannelError::LimitReached)
        );
    }

    #[test]
    fn traffic_is_preserved_across_removal() {
        let tunnel = Tunnel::new(4);
        let a = FakeChannel::new("a", true);
        tunnel.add_channel(a.clone()).unwrap();
        tunnel.send(Bytes::from_static(b"12345")).unwrap();
        assert_eq!(tunnel.traffic().sent, 5);

        tunnel.remove_all_packet_channels();
        assert_eq!(tunnel.channel_count(), 0);
        assert_eq!(tunnel.traffic().sent, 5);
    }
}
