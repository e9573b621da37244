use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;

use crate::crypto;
use crate::net::BoxedStream;
use crate::protocol::{self, OpCode, ProtocolError};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TCP_REUSE_TIMEOUT: Duration = Duration::from_secs(40);

#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("request timed out")]
    Timeout,
    #[error("connect {0}: {1}")]
    Connect(SocketAddr, std::io::Error),
    #[error("tls: {0}")]
    Tls(String),
    #[error("mux: {0}")]
    Mux(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct ConnectorOptions {
    pub endpoint: SocketAddr,
    /// TLS server name; falls back to the endpoint IP when empty.
    pub host_name: String,
    /// Pinned SHA-256 of the server certificate. Empty trusts any
    /// certificate, which is only acceptable for loopback testing.
    pub cert_hash: Vec<u8>,
    pub request_timeout: Duration,
    pub tcp_reuse_timeout: Duration,
}

impl ConnectorOptions {
    pub fn new(endpoint: SocketAddr, host_name: impl Into<String>, cert_hash: Vec<u8>) -> Self {
        Self {
            endpoint,
            host_name: host_name.into(),
            cert_hash,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            tcp_reuse_timeout: DEFAULT_TCP_REUSE_TIMEOUT,
        }
    }
}

struct Mux {
    control: tokio_yamux::Control,
    drive_task: tokio::task::JoinHandle<()>,
    last_used: Instant,
    /// One clone per handed-out stream; the reaper only closes a
    /// connection nobody is riding.
    live_streams: Arc<()>,
}

impl Mux {
    fn has_live_streams(&self) -> bool {
        Arc::strong_count(&self.live_streams) > 1
    }

    async fn shutdown(mut self) {
        let _ = self.control.close().await;
        self.drive_task.abort();
    }
}

/// A yamux stream plus a liveness token for the idle reaper.
struct TrackedStream {
    inner: tokio_yamux::StreamHandle,
    _live: Arc<()>,
}

impl tokio::io::AsyncRead for TrackedStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for TrackedStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Client control plane: one TLS connection to the server, multiplexed with
/// yamux. Every request opens a fresh stream, writes one framed request, and
/// reads one framed response; channel-establishing requests keep the stream.
/// The connection itself is reused across requests and reaped when idle.
pub struct Connector {
    opts: ConnectorOptions,
    tls: TlsConnector,
    mux: tokio::sync::Mutex<Option<Mux>>,
}

impl Connector {
    pub fn new(opts: ConnectorOptions) -> Arc<Self> {
        let tls = TlsConnector::from(Arc::new(client_tls_config(&opts.cert_hash)));
        let connector = Arc::new(Self {
            opts,
            tls,
            mux: tokio::sync::Mutex::new(None),
        });
        connector.clone().spawn_idle_reaper();
        connector
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.opts.endpoint
    }

    /// Sends one framed request and reads the framed response. The returned
    /// stream carries any follow-on payload (packet channel, stream proxy);
    /// callers that do not need it simply drop it.
    pub async fn request<Req, Resp>(
        &self,
        op: OpCode,
        body: &Req,
    ) -> Result<(Resp, BoxedStream), ConnectorError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        tokio::time::timeout(self.opts.request_timeout, self.request_inner(op, body))
            .await
            .map_err(|_| ConnectorError::Timeout)?
    }

    async fn request_inner<Req, Resp>(
        &self,
        op: OpCode,
        body: &Req,
    ) -> Result<(Resp, BoxedStream), ConnectorError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let mut stream = self.open_stream().await?;
        protocol::write_request(&mut stream, op, body).await?;
        let resp: Resp = protocol::read_response(&mut stream).await?;
        Ok((resp, stream))
    }

    async fn open_stream(&self) -> Result<BoxedStream, ConnectorError> {
        let mut mux = self.mux.lock().await;

        if let Some(m) = mux.as_mut() {
            m.last_used = Instant::now();
            match m.control.open_stream().await {
                Ok(st) => {
                    return Ok(Box::new(TrackedStream {
                        inner: st,
                        _live: m.live_streams.clone(),
                    }));
                }
                Err(err) => {
                    tracing::debug!(err = %err, "control connection went stale; redialing");
                    if let Some(stale) = mux.take() {
                        stale.shutdown().await;
                    }
                }
            }
        }

        let mut fresh = self.dial().await?;
        let st = fresh
            .control
            .open_stream()
            .await
            .map_err(|e| ConnectorError::Mux(e.to_string()))?;
        let tracked = TrackedStream {
            inner: st,
            _live: fresh.live_streams.clone(),
        };
        *mux = Some(fresh);
        Ok(Box::new(tracked))
    }

    async fn dial(&self) -> Result<Mux, ConnectorError> {
        let tcp = TcpStream::connect(self.opts.endpoint)
            .await
            .map_err(|e| ConnectorError::Connect(self.opts.endpoint, e))?;
        let _ = tcp.set_nodelay(true);

        let server_name = server_name_for(&self.opts.host_name, self.opts.endpoint.ip());
        let tls = self
            .tls
            .connect(server_name, tcp)
            .await
            .map_err(|e| ConnectorError::Tls(e.to_string()))?;

        let mut session = tokio_yamux::Session::new_client(tls, tokio_yamux::Config::default());
        let control = session.control();

        let drive_task = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(mut st) => {
                        // The server never opens streams toward us; close quietly.
                        let _ = tokio::time::timeout(Duration::from_secs(1), st.shutdown()).await;
                    }
                    Err(_) => break,
                }
            }
        });

        tracing::debug!(endpoint = %self.opts.endpoint, "control connection established");
        Ok(Mux {
            control,
            drive_task,
            last_used: Instant::now(),
            live_streams: Arc::new(()),
        })
    }

    /// Closes the control connection; the next request redials.
    pub async fn disconnect(&self) {
        if let Some(m) = self.mux.lock().await.take() {
            m.shutdown().await;
        }
    }

    fn spawn_idle_reaper(self: Arc<Self>) {
        let weak = Arc::downgrade(&self);
        let reuse = self.opts.tcp_reuse_timeout;
        drop(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(reuse / 2).await;
                let Some(connector) = weak.upgrade() else { break };

                let mut mux = connector.mux.lock().await;
                let idle_expired = mux
                    .as_ref()
                    .is_some_and(|m| m.last_used.elapsed() >= reuse && !m.has_live_streams());
                if idle_expired {
                    if let Some(stale) = mux.take() {
                        tracing::debug!(endpoint = %connector.opts.endpoint, "reaping idle control connection");
                        stale.shutdown().await;
                    }
                }
            }
        });
    }
}

fn server_name_for(host_name: &str, fallback: IpAddr) -> ServerName<'static> {
    let host = host_name.trim();
    if host.is_empty() {
        return ServerName::from(fallback);
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ServerName::from(ip);
    }
    ServerName::try_from(host.to_string()).unwrap_or(ServerName::from(fallback))
}

fn client_tls_config(cert_hash: &[u8]) -> rustls::ClientConfig {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let verifier = Arc::new(PinnedServerVerifier {
        pin: (!cert_hash.is_empty()).then(|| cert_hash.to_vec()),
        provider: provider.clone(),
    });

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("tls versions supported by provider")
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    config
}

/// Accepts exactly the certificate whose SHA-256 matches the token pin;
/// standard chain building does not apply to self-issued VPN endpoints.
#[derive(Debug)]
struct PinnedServerVerifier {
    pin: Option<Vec<u8>>,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        match &self.pin {
            Some(pin) if crypto::cert_hash(end_entity.as_ref()).as_slice() == pin.as_slice() => {
                Ok(rustls::client::danger::ServerCertVerified::assertion())
            }
            Some(_) => Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            )),
            None => Ok(rustls::client::danger::ServerCertVerified::assertion()),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_prefers_host_then_ip() {
        let ip: IpAddr = "203.0.113.5".parse().unwrap();
        assert!(matches!(
            server_name_for("vpn.example.com", ip),
            ServerName::DnsName(_)
        ));
        assert!(matches!(
            server_name_for("198.51.100.1", ip),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(server_name_for("  ", ip), ServerName::IpAddress(_)));
    }
}
