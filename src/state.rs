use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::access::now_millis;
use crate::protocol::Traffic;
use crate::session::SessionState;

const WRITE_RETRY_TIMEOUT: Duration = Duration::from_secs(2);
const WRITE_RETRY_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub session_id: u64,
    pub virtual_ip_v4: Ipv4Addr,
    pub virtual_ip_v6: Ipv6Addr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionStatusInfo {
    pub traffic: Traffic,
    pub is_udp_mode: bool,
    pub packet_channel_count: usize,
}

/// Snapshot the VPN service persists after every client state change, so
/// front-ends can render progress without holding the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionInfo {
    pub client_state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<SocketAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_info: Option<SessionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_status: Option<SessionStatusInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_time: u64,
}

impl ConnectionInfo {
    pub fn new(client_state: SessionState) -> Self {
        Self {
            client_state,
            api_endpoint: None,
            api_key: None,
            session_info: None,
            session_status: None,
            error: None,
            created_time: now_millis(),
        }
    }
}

/// Writes `ConnectionInfo` as JSON with bounded retry: front-ends read the
/// file concurrently and transient sharing violations must not take the
/// session down.
#[derive(Debug, Clone)]
pub struct ConnectionInfoWriter {
    path: PathBuf,
}

impl ConnectionInfoWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub async fn write(&self, info: &ConnectionInfo) {
        let deadline = tokio::time::Instant::now() + WRITE_RETRY_TIMEOUT;
        loop {
            match self.try_write(info) {
                Ok(()) => return,
                Err(err) if tokio::time::Instant::now() >= deadline => {
                    tracing::warn!(path = %self.path.display(), err = %err, "connection info write gave up");
                    return;
                }
                Err(_) => tokio::time::sleep(WRITE_RETRY_PAUSE).await,
            }
        }
    }

    fn try_write(&self, info: &ConnectionInfo) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let data = serde_json::to_vec_pretty(info)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)
    }

    pub fn read(&self) -> std::io::Result<ConnectionInfo> {
        let data = std::fs::read(&self.path)?;
        serde_json::from_slice(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn info_roundtrips_through_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ConnectionInfoWriter::new(dir.path().join("connection.json"));

        let mut info = ConnectionInfo::new(SessionState::Connected);
        info.api_endpoint = Some("127.0.0.1:443".parse().unwrap());
        info.session_info = Some(SessionInfo {
            session_id: 12,
            virtual_ip_v4: "10.255.0.2".parse().unwrap(),
            virtual_ip_v6: "fd12::2".parse().unwrap(),
        });

        writer.write(&info).await;
        let got = writer.read().unwrap();
        assert_eq!(got, info);

        // Overwrites replace, not append.
        let second = ConnectionInfo::new(SessionState::Disposed);
        writer.write(&second).await;
        assert_eq!(writer.read().unwrap().client_state, SessionState::Disposed);
    }
}
