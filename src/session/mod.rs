use std::net::Ipv4Addr;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub mod client;
pub mod finder;
pub mod server;

/// Client-side session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    None,
    Connecting,
    WaitingForAd,
    Connected,
    /// Paused after repeated request failures; resumed by the next TUN
    /// packet once the pause has elapsed.
    Waiting,
    Disconnecting,
    Disposed,
}

impl SessionState {
    pub fn is_done(self) -> bool {
        matches!(self, SessionState::Disconnecting | SessionState::Disposed)
    }
}

/// Virtual network interface seam. The driver itself is platform glue and
/// lives outside this crate; sessions only pull and push whole IP packets.
#[async_trait]
pub trait TunAdapter: Send + Sync {
    async fn read_packet(&self) -> std::io::Result<Bytes>;
    /// Must not block; a congested adapter drops.
    fn write_packet(&self, packet: Bytes) -> std::io::Result<()>;
    fn ip_version_supported(&self, version: u8) -> bool;
}

/// Local TCP termination seam on the client. Packets addressed to the
/// catcher addresses, and TCP flows excluded from the tunnel, are looped
/// into this host instead of the wire.
pub trait TcpProxyHost: Send + Sync {
    fn catcher_ip_v4(&self) -> Ipv4Addr;
    fn handle_packet(&self, packet: Bytes);
}

/// In-memory TUN adapter for in-process wiring and tests.
#[cfg(test)]
pub mod testing {
    use super::*;
    use tokio::sync::{Mutex, mpsc};

    pub struct ChannelTunAdapter {
        outbound_rx: Mutex<mpsc::Receiver<Bytes>>,
        inbound_tx: mpsc::Sender<Bytes>,
        ipv6: bool,
    }

    impl ChannelTunAdapter {
        /// Returns the adapter plus the far side: send on the first handle
        /// to emit packets "from the device", receive on the second to see
        /// packets the session wrote back.
        pub fn new(ipv6: bool) -> (std::sync::Arc<Self>, mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
            let (out_tx, out_rx) = mpsc::channel(1024);
            let (in_tx, in_rx) = mpsc::channel(1024);
            (
                std::sync::Arc::new(Self {
                    outbound_rx: Mutex::new(out_rx),
                    inbound_tx: in_tx,
                    ipv6,
                }),
                out_tx,
                in_rx,
            )
        }
    }

    #[async_trait]
    impl TunAdapter for ChannelTunAdapter {
        async fn read_packet(&self) -> std::io::Result<Bytes> {
            self.outbound_rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "tun closed"))
        }

        fn write_packet(&self, packet: Bytes) -> std::io::Result<()> {
            let _ = self.inbound_tx.try_send(packet);
            Ok(())
        }

        fn ip_version_supported(&self, version: u8) -> bool {
            version == 4 || (version == 6 && self.ipv6)
        }
    }
}
