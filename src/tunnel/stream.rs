use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};

use crate::net::BoxedStream;
use crate::protocol::Traffic;
use crate::tunnel::{ChannelError, ChannelState, PacketChannel};

#[derive(Debug, Clone)]
pub struct StreamChannelOptions {
    pub queue_capacity: usize,
    /// Stream channels with a lifespan close themselves at expiry; the
    /// session opens a replacement before the last one drains.
    pub lifespan: Option<Duration>,
}

impl Default for StreamChannelOptions {
    fn default() -> Self {
        Self {
            queue_capacity: super::DEFAULT_PACKET_QUEUE_CAPACITY,
            lifespan: None,
        }
    }
}

/// Packet channel over one multiplexed byte stream: u16-BE length prefix per
/// IP packet. The stream is already authenticated and encrypted by the
/// control connection it was carved from.
pub struct StreamPacketChannel {
    id: String,
    state: AtomicU8,
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    out_tx: mpsc::Sender<Bytes>,
    shutdown_tx: watch::Sender<bool>,
}

impl StreamPacketChannel {
    pub fn spawn(
        id: impl Into<String>,
        stream: BoxedStream,
        opts: StreamChannelOptions,
        sink: mpsc::Sender<Bytes>,
    ) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(opts.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ch = Arc::new(Self {
            id: id.into(),
            state: AtomicU8::new(ChannelState::Connected as u8),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            out_tx,
            shutdown_tx,
        });

        let (rd, wr) = tokio::io::split(stream);
        tokio::spawn(write_loop(ch.clone(), wr, out_rx, shutdown_rx.clone()));
        tokio::spawn(read_loop(ch.clone(), rd, sink, shutdown_rx));

        if let Some(lifespan) = opts.lifespan {
            let weak = Arc::downgrade(&ch);
            tokio::spawn(async move {
                tokio::time::sleep(lifespan).await;
                if let Some(ch) = weak.upgrade() {
                    tracing::debug!(channel = %ch.id, "packet channel lifespan expired");
                    ch.close();
                }
            });
        }

        ch
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn set_state(&self, s: ChannelState) {
        self.state.store(s as u8, Ordering::Release);
    }
}

impl PacketChannel for StreamPacketChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_stream(&self) -> bool {
        true
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

/// Consumes the outgoing queue; on shutdown it drains whatever is already
/// queued, then closes the write side and marks the channel closed.
async fn write_loop(
    ch: Arc<StreamPacketChannel>,
    mut wr: WriteHalf<BoxedStream>,
    mut out_rx: mpsc::Receiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    while let Ok(pkt) = out_rx.try_recv() {
                        if write_frame(&ch, &mut wr, &pkt).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
            }
            pkt = out_rx.recv() => {
                let Some(pkt) = pkt else { break };
                if write_frame(&ch, &mut wr, &pkt).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = wr.shutdown().await;
    ch.set_state(ChannelState::Closed);
}

async fn write_frame(
    ch: &StreamPacketChannel,
    wr: &mut WriteHalf<BoxedStream>,
    pkt: &[u8],
) -> std::io::Result<()> {
    let n: u16 = match pkt.len().try_into() {
        Ok(n) => n,
        // Oversized packets cannot be framed; count and move on.
        Err(_) => {
            ch.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
    };
    wr.write_u16(n).await?;
    wr.write_all(pkt).await?;
    wr.flush().await?;
    ch.sent.fetch_add(2 + u64::from(n), Ordering::Relaxed);
    Ok(())
}

/// Reads length-prefixed packets and hands them to the sink without ever
/// blocking the stream: a full sink disposes the packet and counts a drop.
async fn read_loop(
    ch: Arc<StreamPacketChannel>,
    mut rd: ReadHalf<BoxedStream>,
    sink: mpsc::Sender<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; usize::from(u16::MAX)];
    loop {
        let n = tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
                continue;
            }
            n = rd.read_u16() => match n {
                Ok(n) => usize::from(n),
                Err(_) => break,
            },
        };

        if n == 0 {
            continue; // keep-alive frame
        }
        if rd.read_exact(&mut buf[..n]).await.is_err() {
            break;
        }
        ch.received.fetch_add(2 + n as u64, Ordering::Relaxed);

        match sink.try_send(Bytes::copy_from_slice(&buf[..n])) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                ch.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }

    // Peer EOF or owner gone: wind the channel down so the writer drains.
    ch.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(
        s: tokio::io::DuplexStream,
    ) -> BoxedStream {
        Box::new(s)
    }

    #[tokio::test]
    async fn frames_cross_the_stream_both_ways() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (sink_a, mut rx_a) = mpsc::channel(16);
        let (sink_b, mut rx_b) = mpsc::channel(16);

        let ca = StreamPacketChannel::spawn("a", boxed(a), StreamChannelOptions::default(), sink_a);
        let cb = StreamPacketChannel::spawn("b", boxed(b), StreamChannelOptions::default(), sink_b);

        ca.send(Bytes::from_static(b"ping-packet")).unwrap();
        let got = rx_b.recv().await.unwrap();
        assert_eq!(got.as_ref(), b"ping-packet");

        cb.send(Bytes::from_static(b"pong-packet")).unwrap();
        let got = rx_a.recv().await.unwrap();
        assert_eq!(got.as_ref(), b"pong-packet");

        // Framing overhead is two bytes per packet on each axis.
        assert_eq!(ca.traffic().sent, 13);
        assert_eq!(cb.traffic().received, 13);
    }

    #[tokio::test]
    async fn send_after_close_fails_and_emits_nothing() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (sink_a, _rx_a) = mpsc::channel(16);
        let (sink_b, mut rx_b) = mpsc::channel(16);

        let ca = StreamPacketChannel::spawn("a", boxed(a), StreamChannelOptions::default(), sink_a);
        let _cb = StreamPacketChannel::spawn("b", boxed(b), StreamChannelOptions::default(), sink_b);

        ca.close();
        assert_eq!(
            ca.send(Bytes::from_static(b"late")),
            Err(ChannelError::Closed)
        );

        // The closed channel must not emit the late packet.
        let got = tokio::time::timeout(Duration::from_millis(200), rx_b.recv()).await;
        assert!(got.is_err() || got.unwrap().is_none());
    }

    #[tokio::test]
    async fn lifespan_closes_the_channel() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (sink_a, _rx_a) = mpsc::channel(16);
        let (sink_b, _rx_b) = mpsc::channel(16);

        let ca = StreamPacketChannel::spawn(
            "a",
            boxed(a),
            StreamChannelOptions {
                queue_capacity: 16,
                lifespan: Some(Duration::from_millis(50)),
            },
            sink_a,
        );
        let _cb = StreamPacketChannel::spawn("b", boxed(b), StreamChannelOptions::default(), sink_b);

        tokio::time::timeout(Duration::from_secs(2), async {
            while ca.state() != ChannelState::Closed {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("channel should close at lifespan expiry");
    }

    #[tokio::test]
    async fn full_queue_drops_newest() {
        let (a, _b_held_open) = tokio::io::duplex(16);
        let (sink_a, _rx_a) = mpsc::channel(16);

        let ca = StreamPacketChannel::spawn(
            "a",
            boxed(a),
            StreamChannelOptions {
                queue_capacity: 1,
                lifespan: None,
            },
            sink_a,
        );

        // Saturate the tiny duplex buffer and the queue behind it.
        let mut saw_full = false;
        for _ in 0..64 {
            match ca.send(Bytes::from(vec![0u8; 8])) {
                Ok(()) => {}
                Err(ChannelError::QueueFull) => {
                    saw_full = true;
                    break;
                }
                Err(other) => panic!("unexpected {other:?}"),
            }
        }
        assert!(saw_full);
        assert!(ca.dropped() >= 1);
    }
}
