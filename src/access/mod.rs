use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{
    AccessUsage, AdRequirement, ErrorCode, HelloRequest, SuppressedTo, Traffic,
};

pub mod file;

pub const TOKEN_SCHEMA_VERSION: u32 = 2;
pub const USAGE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum AccessError {
    #[error("token {0} not found")]
    TokenNotFound(String),
    #[error("session {0} not found")]
    SessionNotFound(u64),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Identity issued out of band; consumed read-only by sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccessToken {
    #[serde(default = "default_schema_version")]
    pub version: u32,
    pub token_id: String,
    /// 128-bit symmetric secret shared with the server.
    pub secret: Vec<u8>,
    #[serde(default)]
    pub name: Option<String>,
    /// Unix epoch milliseconds.
    #[serde(default)]
    pub expiration: Option<u64>,
    #[serde(default)]
    pub max_traffic: Option<u64>,
    #[serde(default)]
    pub max_client_count: Option<u32>,
    #[serde(default)]
    pub ad_requirement: AdRequirement,
    /// Candidate server endpoints, probed by the server finder.
    #[serde(default)]
    pub server_endpoints: Vec<SocketAddr>,
    /// TLS server name the client presents as SNI.
    #[serde(default)]
    pub host_name: String,
    /// Pinned SHA-256 of the server certificate; empty disables pinning.
    #[serde(default)]
    pub cert_hash: Vec<u8>,
}

fn default_schema_version() -> u32 {
    TOKEN_SCHEMA_VERSION
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessTokenUsage {
    #[serde(default)]
    pub version: u32,
    pub sent: u64,
    pub received: u64,
    /// Unix epoch milliseconds.
    pub created: u64,
    pub last_used: u64,
}

impl AccessTokenUsage {
    pub fn new_now() -> Self {
        let now = now_millis();
        Self {
            version: USAGE_SCHEMA_VERSION,
            sent: 0,
            received: 0,
            created: now,
            last_used: now,
        }
    }

    pub fn total(&self) -> u64 {
        self.sent.saturating_add(self.received)
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Outcome of authorizing a hello.
#[derive(Debug, Clone)]
pub struct AccessDecision {
    pub error_code: ErrorCode,
    pub error_message: Option<String>,
    /// Server-assigned session id; zero when rejected.
    pub session_id: u64,
    pub access_usage: AccessUsage,
    pub ad_requirement: AdRequirement,
    /// Unix epoch milliseconds at which the session must expire.
    pub expiration: Option<u64>,
    pub suppressed_to: SuppressedTo,
    /// Sessions the caller must dispose with `session_suppressed`.
    pub suppress_session_ids: Vec<u64>,
}

impl AccessDecision {
    pub fn rejected(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            error_message: Some(message.into()),
            session_id: 0,
            access_usage: AccessUsage::default(),
            ad_requirement: AdRequirement::None,
            expiration: None,
            suppressed_to: SuppressedTo::None,
            suppress_session_ids: Vec::new(),
        }
    }
}

/// External authority that authorizes sessions, meters usage, and issues
/// access tokens. The session core only consumes this interface.
#[async_trait]
pub trait AccessManager: Send + Sync {
    async fn session_add(&self, hello: &HelloRequest) -> Result<AccessDecision, AccessError>;

    /// Re-validates a live session, returning the current verdict.
    async fn session_get(&self, session_id: u64) -> Result<(ErrorCode, AccessUsage), AccessError>;

    /// Adds traffic (token axes: sent = toward Internet) and optionally a
    /// rewarded-ad proof; returns the post-update verdict.
    async fn session_add_usage(
        &self,
        session_id: u64,
        traffic: Traffic,
        ad_data: Option<&str>,
    ) -> Result<(ErrorCode, AccessUsage), AccessError>;

    async fn session_close(&self, session_id: u64, traffic: Traffic) -> Result<(), AccessError>;
}
