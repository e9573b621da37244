use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic prefix carried by every control request. The trailing byte is the
/// wire protocol generation and bumps only on incompatible framing changes.
pub const REQUEST_MAGIC: &[u8; 8] = b"SHROUD\0\x01";

pub const PROTOCOL_VERSION_MIN: u16 = 4;
pub const PROTOCOL_VERSION_MAX: u16 = 5;

pub const MAX_REQUEST_JSON_BYTES: u32 = 1 << 20; // 1 MiB
pub const MAX_RESPONSE_JSON_BYTES: u32 = 1 << 20; // 1 MiB

/// Stream packet channels prefix each IP packet with a u16-BE length.
pub const MAX_STREAM_PACKET_BYTES: u16 = u16::MAX;

/// UDP channel datagram header: `session_id u64-BE | crypt_position u64-BE`.
pub const UDP_FRAME_HEADER_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic")]
    BadMagic,
    #[error("unknown op code {0}")]
    BadOpCode(u8),
    #[error("payload too large: {0}")]
    PayloadTooLarge(u32),
    #[error("short udp frame: {0} bytes")]
    ShortUdpFrame(usize),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Hello = 1,
    Bye = 2,
    SessionStatus = 3,
    RewardedAd = 4,
    TcpPacketChannel = 5,
    StreamProxy = 6,
    UdpPacket = 7,
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(v: u8) -> Result<Self, ProtocolError> {
        match v {
            1 => Ok(OpCode::Hello),
            2 => Ok(OpCode::Bye),
            3 => Ok(OpCode::SessionStatus),
            4 => Ok(OpCode::RewardedAd),
            5 => Ok(OpCode::TcpPacketChannel),
            6 => Ok(OpCode::StreamProxy),
            7 => Ok(OpCode::UdpPacket),
            other => Err(ProtocolError::BadOpCode(other)),
        }
    }
}

/// Error taxonomy shared by client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    #[default]
    Ok,
    SessionClosed,
    SessionSuppressed,
    AccessExpired,
    AccessTrafficOverflow,
    AccessError,
    RedirectHost,
    RewardedAdRejected,
    UnauthorizedAccess,
    GeneralError,
}

impl ErrorCode {
    /// Terminal codes dispose the session with no retry.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorCode::AccessExpired
                | ErrorCode::AccessTrafficOverflow
                | ErrorCode::UnauthorizedAccess
                | ErrorCode::SessionSuppressed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SuppressedTo {
    #[default]
    None,
    #[serde(rename = "self")]
    SameClient,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdRequirement {
    #[default]
    None,
    Flexible,
    Rewarded,
}

/// Cumulative byte counters for one direction pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Traffic {
    pub sent: u64,
    pub received: u64,
}

impl Traffic {
    pub fn new(sent: u64, received: u64) -> Self {
        Self { sent, received }
    }

    pub fn total(&self) -> u64 {
        self.sent.saturating_add(self.received)
    }

    pub fn saturating_sub(&self, other: Traffic) -> Traffic {
        Traffic {
            sent: self.sent.saturating_sub(other.sent),
            received: self.received.saturating_sub(other.received),
        }
    }

    /// The same counters seen from the opposite end of the wire.
    pub fn swapped(&self) -> Traffic {
        Traffic {
            sent: self.received,
            received: self.sent,
        }
    }
}

impl std::ops::Add for Traffic {
    type Output = Traffic;

    fn add(self, rhs: Traffic) -> Traffic {
        Traffic {
            sent: self.sent.saturating_add(rhs.sent),
            received: self.received.saturating_add(rhs.received),
        }
    }
}

impl std::ops::AddAssign for Traffic {
    fn add_assign(&mut self, rhs: Traffic) {
        *self = *self + rhs;
    }
}

/// Usage snapshot a server reports back to the client, in token units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AccessUsage {
    pub sent: u64,
    pub received: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_traffic: Option<u64>,
    /// Unix epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionResponse {
    #[serde(default)]
    pub error_code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_usage: Option<AccessUsage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirect_endpoints: Vec<SocketAddr>,
    #[serde(default)]
    pub suppressed_to: SuppressedTo,
}

impl SessionResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_version: String,
    pub min_protocol_version: u16,
    pub max_protocol_version: u16,
    #[serde(default)]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    pub client_id: uuid::Uuid,
    /// AES-ECB(token secret, client id); proves knowledge of the token secret.
    pub encrypted_client_id: Vec<u8>,
    pub client_info: ClientInfo,
    pub token_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_code: Option<String>,
    #[serde(default)]
    pub allow_redirect: bool,
    #[serde(default)]
    pub is_ipv6_supported: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloResponse {
    #[serde(flatten)]
    pub base: SessionResponse,
    #[serde(default)]
    pub session_id: u64,
    #[serde(default)]
    pub session_key: Vec<u8>,
    #[serde(default)]
    pub server_secret: Vec<u8>,
    #[serde(default)]
    pub protocol_version: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_port: Option<u16>,
    #[serde(default = "default_virtual_v4")]
    pub virtual_ip_v4: Ipv4Addr,
    #[serde(default = "default_virtual_v6")]
    pub virtual_ip_v6: Ipv6Addr,
    #[serde(default)]
    pub mtu: u16,
    #[serde(default)]
    pub max_packet_channel_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_ip_ranges: Vec<ipnet::IpNet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vpn_adapter_include_ip_ranges: Vec<ipnet::IpNet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_servers: Vec<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_public_address: Option<IpAddr>,
    #[serde(default)]
    pub ad_requirement: AdRequirement,
    #[serde(default)]
    pub access_usage: AccessUsage,
}

fn default_virtual_v4() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_virtual_v6() -> Ipv6Addr {
    Ipv6Addr::UNSPECIFIED
}

/// Base fields every post-hello request carries; the key authenticates the
/// request against the session established by hello.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: u64,
    pub session_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByeRequest {
    #[serde(flatten)]
    pub session: SessionRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatusRequest {
    #[serde(flatten)]
    pub session: SessionRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub base: SessionResponse,
    #[serde(default)]
    pub traffic: Traffic,
    #[serde(default)]
    pub speed: Traffic,
    #[serde(default)]
    pub packet_channel_count: usize,
    #[serde(default)]
    pub is_udp_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardedAdRequest {
    #[serde(flatten)]
    pub session: SessionRequest,
    pub ad_data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpPacketChannelRequest {
    #[serde(flatten)]
    pub session: SessionRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamProxyRequest {
    #[serde(flatten)]
    pub session: SessionRequest,
    pub destination: SocketAddr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpChannelRequest {
    #[serde(flatten)]
    pub session: SessionRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpChannelResponse {
    #[serde(flatten)]
    pub base: SessionResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_port: Option<u16>,
}

pub async fn write_request<W, T>(w: &mut W, op: OpCode, body: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    w.write_all(REQUEST_MAGIC).await?;
    w.write_u8(op as u8).await?;

    let b = serde_json::to_vec(body)?;
    let n: u32 = b.len().try_into().unwrap_or(u32::MAX);
    if n > MAX_REQUEST_JSON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    w.write_u32_le(n).await?;
    w.write_all(&b).await?;
    w.flush().await?;
    Ok(())
}

/// Reads the magic, op code, and raw JSON body of one request. The caller
/// dispatches on the op code and parses the body with [`parse_body`].
pub async fn read_request_frame<R>(r: &mut R) -> Result<(OpCode, Vec<u8>), ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic).await?;
    if &magic != REQUEST_MAGIC {
        return Err(ProtocolError::BadMagic);
    }

    let op = OpCode::try_from(r.read_u8().await?)?;

    let n = r.read_u32_le().await?;
    if n > MAX_REQUEST_JSON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let mut body = vec![0u8; n as usize];
    r.read_exact(&mut body).await?;
    Ok((op, body))
}

pub fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(body)?)
}

pub async fn write_response<W, T>(w: &mut W, resp: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let b = serde_json::to_vec(resp)?;
    let n: u32 = b.len().try_into().unwrap_or(u32::MAX);
    if n > MAX_RESPONSE_JSON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    w.write_u32_le(n).await?;
    w.write_all(&b).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_response<R, T>(r: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let n = r.read_u32_le().await?;
    if n > MAX_RESPONSE_JSON_BYTES {
        return Err(ProtocolError::PayloadTooLarge(n));
    }
    let mut body = vec![0u8; n as usize];
    r.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Encodes one UDP channel datagram: header + sealed payload.
pub fn encode_udp_frame(session_id: u64, position: u64, ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(UDP_FRAME_HEADER_LEN + ciphertext.len());
    out.extend_from_slice(&session_id.to_be_bytes());
    out.extend_from_slice(&position.to_be_bytes());
    out.extend_from_slice(ciphertext);
    out
}

/// Splits a UDP channel datagram into `(session_id, crypt_position, ciphertext)`.
pub fn decode_udp_frame(frame: &[u8]) -> Result<(u64, u64, &[u8]), ProtocolError> {
    if frame.len() < UDP_FRAME_HEADER_LEN {
        return Err(ProtocolError::ShortUdpFrame(frame.len()));
    }
    let session_id = u64::from_be_bytes(frame[0..8].try_into().unwrap());
    let position = u64::from_be_bytes(frame[8..16].try_into().unwrap());
    Ok((session_id, position, &frame[UDP_FRAME_HEADER_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn request_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(16 * 1024);

        let req = ByeRequest {
            session: SessionRequest {
                session_id: 42,
                session_key: vec![7u8; 16],
            },
        };

        let w = tokio::spawn(async move { write_request(&mut a, OpCode::Bye, &req).await });
        let (op, body) = read_request_frame(&mut b).await.unwrap();
        w.await.unwrap().unwrap();

        assert_eq!(op, OpCode::Bye);
        let got: ByeRequest = parse_body(&body).unwrap();
        assert_eq!(got.session.session_id, 42);
        assert_eq!(got.session.session_key, vec![7u8; 16]);
    }

    #[tokio::test]
    async fn request_rejects_bad_magic() {
        let (mut a, mut b) = tokio::io::duplex(128);
        tokio::spawn(async move {
            a.write_all(b"NOTSHRD\x01").await.unwrap();
            a.write_u8(1).await.unwrap();
            a.write_u32_le(0).await.unwrap();
        });

        let err = read_request_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::BadMagic));
    }

    #[tokio::test]
    async fn request_rejects_too_large_length_without_reading_payload() {
        let (mut a, mut b) = tokio::io::duplex(128);
        tokio::spawn(async move {
            a.write_all(REQUEST_MAGIC).await.unwrap();
            a.write_u8(OpCode::Hello as u8).await.unwrap();
            a.write_u32_le(MAX_REQUEST_JSON_BYTES + 1).await.unwrap();
            // no payload needed
        });

        let err = read_request_frame(&mut b).await.unwrap_err();
        match err {
            ProtocolError::PayloadTooLarge(n) => assert!(n > MAX_REQUEST_JSON_BYTES),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn hello_response_roundtrips_without_loss() {
        let resp = HelloResponse {
            base: SessionResponse::ok(),
            session_id: 9001,
            session_key: vec![1u8; 16],
            server_secret: vec![2u8; 16],
            protocol_version: PROTOCOL_VERSION_MAX,
            udp_port: Some(5050),
            virtual_ip_v4: "10.255.0.2".parse().unwrap(),
            virtual_ip_v6: "fd12::2".parse().unwrap(),
            mtu: 1500,
            max_packet_channel_count: 4,
            include_ip_ranges: vec!["0.0.0.0/0".parse().unwrap()],
            vpn_adapter_include_ip_ranges: vec![],
            dns_servers: vec!["8.8.8.8".parse().unwrap()],
            client_public_address: Some("203.0.113.9".parse().unwrap()),
            ad_requirement: AdRequirement::Flexible,
            access_usage: AccessUsage {
                sent: 10,
                received: 20,
                max_traffic: Some(1 << 20),
                expiration: None,
            },
        };

        let (mut a, mut b) = tokio::io::duplex(16 * 1024);
        let send = resp.clone();
        tokio::spawn(async move { write_response(&mut a, &send).await });
        let got: HelloResponse = read_response(&mut b).await.unwrap();

        assert_eq!(got.base.error_code, ErrorCode::Ok);
        assert_eq!(got.session_id, resp.session_id);
        assert_eq!(got.session_key, resp.session_key);
        assert_eq!(got.server_secret, resp.server_secret);
        assert_eq!(got.udp_port, resp.udp_port);
        assert_eq!(got.virtual_ip_v4, resp.virtual_ip_v4);
        assert_eq!(got.virtual_ip_v6, resp.virtual_ip_v6);
        assert_eq!(got.include_ip_ranges, resp.include_ip_ranges);
        assert_eq!(got.dns_servers, resp.dns_servers);
        assert_eq!(got.ad_requirement, resp.ad_requirement);
        assert_eq!(got.access_usage, resp.access_usage);
    }

    #[tokio::test]
    async fn response_error_codes_use_snake_case() {
        let resp = SessionResponse::error(ErrorCode::AccessTrafficOverflow, "quota");
        let js = serde_json::to_string(&resp).unwrap();
        assert!(js.contains("access_traffic_overflow"), "{js}");

        let resp = SessionResponse {
            suppressed_to: SuppressedTo::SameClient,
            ..SessionResponse::ok()
        };
        let js = serde_json::to_string(&resp).unwrap();
        assert!(js.contains("\"self\""), "{js}");
    }

    #[test]
    fn udp_frame_roundtrip() {
        let frame = encode_udp_frame(77, 12345, b"sealed");
        let (sid, pos, ct) = decode_udp_frame(&frame).unwrap();
        assert_eq!(sid, 77);
        assert_eq!(pos, 12345);
        assert_eq!(ct, b"sealed");

        let err = decode_udp_frame(&frame[..10]).unwrap_err();
        assert!(matches!(err, ProtocolError::ShortUdpFrame(10)));
    }
}
