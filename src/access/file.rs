use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::protocol::{
    AccessUsage, AdRequirement, ErrorCode, HelloRequest, SuppressedTo, Traffic,
};

use super::{
    AccessDecision, AccessError, AccessManager, AccessToken, AccessTokenUsage, now_millis,
    TOKEN_SCHEMA_VERSION,
};

const TOKEN_EXT: &str = "token2";
const LEGACY_TOKEN_EXT: &str = "token";
const USAGE_EXT: &str = "usage";

/// Keyed mutex map with weak-value semantics: a lock entry lives only while
/// somebody holds or awaits it, so idle tokens cost nothing.
#[derive(Default)]
struct KeyedLocks {
    map: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    fn lock_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.map.lock().expect("keyed locks poisoned");
        if let Some(existing) = map.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        map.retain(|_, w| w.strong_count() > 0);
        let fresh = Arc::new(tokio::sync::Mutex::new(()));
        map.insert(key.to_string(), Arc::downgrade(&fresh));
        fresh
    }
}

/// Pre-v2 token layout, auto-converted on open.
#[derive(Debug, Deserialize)]
struct LegacyToken {
    token_id: String,
    secret: Vec<u8>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    server_endpoints: Vec<SocketAddr>,
    #[serde(default)]
    host_name: String,
}

#[derive(Debug, Clone)]
struct SessionRecord {
    token_id: String,
    client_id: uuid::Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateTokenOptions {
    pub name: Option<String>,
    pub expiration: Option<u64>,
    pub max_traffic: Option<u64>,
    pub max_client_count: Option<u32>,
    pub ad_requirement: AdRequirement,
    pub server_endpoints: Vec<SocketAddr>,
    pub host_name: String,
    pub cert_hash: Vec<u8>,
}

impl Default for CreateTokenOptions {
    fn default() -> Self {
        Self {
            name: None,
            expiration: None,
            max_traffic: None,
            max_client_count: None,
            ad_requirement: AdRequirement::None,
            server_endpoints: Vec::new(),
            host_name: String::new(),
            cert_hash: Vec::new(),
        }
    }
}

/// File-backed access manager: one `<id>.token2` and one `<id>.usage` JSON
/// per token, every mutation persisted under the token's exclusive lock.
/// Session records live in memory; they die with the process, which is fine
/// because sessions do not survive a server restart either.
pub struct FileAccessManager {
    storage_dir: PathBuf,
    locks: KeyedLocks,
    sessions: DashMap<u64, SessionRecord>,
    next_session_id: AtomicU64,
}

impl FileAccessManager {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Result<Self, AccessError> {
        let storage_dir = storage_dir.into();
        std::fs::create_dir_all(&storage_dir)?;
        Ok(Self {
            storage_dir,
            locks: KeyedLocks::default(),
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(rand::random::<u32>() as u64 + 1),
        })
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub async fn create_token(
        &self,
        opts: CreateTokenOptions,
    ) -> Result<AccessToken, AccessError> {
        let token = AccessToken {
            version: TOKEN_SCHEMA_VERSION,
            token_id: uuid::Uuid::new_v4().to_string(),
            secret: crypto::random_key().to_vec(),
            name: opts.name,
            expiration: opts.expiration,
            max_traffic: opts.max_traffic,
            max_client_count: opts.max_client_count,
            ad_requirement: opts.ad_requirement,
            server_endpoints: opts.server_endpoints,
            host_name: opts.host_name,
            cert_hash: opts.cert_hash,
        };

        let guard = self.locks.lock_for(&token.token_id);
        let _held = guard.lock().await;
        self.write_json(&token.token_id, TOKEN_EXT, &token)?;
        self.write_json(&token.token_id, USAGE_EXT, &AccessTokenUsage::new_now())?;
        Ok(token)
    }

    /// Loads a token, converting a legacy `.token` file if that is all
    /// there is.
    pub async fn get_token(&self, token_id: &str) -> Result<AccessToken, AccessError> {
        let guard = self.locks.lock_for(token_id);
        let _held = guard.lock().await;
        self.read_token_locked(token_id)
    }

    pub async fn get_usage(&self, token_id: &str) -> Result<AccessTokenUsage, AccessError> {
        let guard = self.locks.lock_for(token_id);
        let _held = guard.lock().await;
        self.read_usage_locked(token_id)
    }

    fn read_token_locked(&self, token_id: &str) -> Result<AccessToken, AccessError> {
        let path = self.file_path(token_id, TOKEN_EXT);
        match std::fs::read(&path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.convert_legacy_locked(token_id)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn convert_legacy_locked(&self, token_id: &str) -> Result<AccessToken, AccessError> {
        let legacy_path = self.file_path(token_id, LEGACY_TOKEN_EXT);
        let data = std::fs::read(&legacy_path)
            .map_err(|_| AccessError::TokenNotFound(token_id.to_string()))?;
        let legacy: LegacyToken = serde_json::from_slice(&data)?;

        let token = AccessToken {
            version: TOKEN_SCHEMA_VERSION,
            token_id: legacy.token_id,
            secret: legacy.secret,
            name: legacy.name,
            expiration: None,
            max_traffic: None,
            max_client_count: None,
            ad_requirement: AdRequirement::None,
            server_endpoints: legacy.server_endpoints,
            host_name: legacy.host_name,
            cert_hash: Vec::new(),
        };
        self.write_json(&token.token_id, TOKEN_EXT, &token)?;
        let _ = std::fs::remove_file(&legacy_path);
        tracing::info!(token = %token.token_id, "converted legacy token file");
        Ok(token)
    }

    fn read_usage_locked(&self, token_id: &str) -> Result<AccessTokenUsage, AccessError> {
        let path = self.file_path(token_id, USAGE_EXT);
        match std::fs::read(&path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let usage = AccessTokenUsage::new_now();
                self.write_json(token_id, USAGE_EXT, &usage)?;
                Ok(usage)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write_json<T: Serialize>(
        &self,
        token_id: &str,
        ext: &str,
        value: &T,
    ) -> Result<(), AccessError> {
        let path = self.file_path(token_id, ext);
        let tmp = path.with_extension(format!("{ext}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn file_path(&self, token_id: &str, ext: &str) -> PathBuf {
        self.storage_dir.join(format!("{token_id}.{ext}"))
    }

    fn verdict(token: &AccessToken, usage: &AccessTokenUsage) -> ErrorCode {
        if let Some(exp) = token.expiration {
            if now_millis() >= exp {
                return ErrorCode::AccessExpired;
            }
        }
        if let Some(max) = token.max_traffic {
            if usage.total() >= max {
                return ErrorCode::AccessTrafficOverflow;
            }
        }
        ErrorCode::Ok
    }

    fn usage_snapshot(token: &AccessToken, usage: &AccessTokenUsage) -> AccessUsage {
        AccessUsage {
            sent: usage.sent,
            received: usage.received,
            max_traffic: token.max_traffic,
            expiration: token.expiration,
        }
    }
}

#[async_trait::async_trait]
impl AccessManager for FileAccessManager {
    async fn session_add(&self, hello: &HelloRequest) -> Result<AccessDecision, AccessError> {
        let guard = self.locks.lock_for(&hello.token_id);
        let _held = guard.lock().await;

        let token = match self.read_token_locked(&hello.token_id) {
            Ok(t) => t,
            Err(AccessError::TokenNotFound(_)) => {
                return Ok(AccessDecision::rejected(
                    ErrorCode::AccessError,
                    "unknown token",
                ));
            }
            Err(err) => return Err(err),
        };

        let proof = crypto::encrypt_client_id(&token.secret, hello.client_id)
            .map(|b| b.to_vec())
            .unwrap_or_default();
        if proof.is_empty() || proof != hello.encrypted_client_id {
            return Ok(AccessDecision::rejected(
                ErrorCode::UnauthorizedAccess,
                "client id proof mismatch",
            ));
        }

        let mut usage = self.read_usage_locked(&hello.token_id)?;
        let verdict = Self::verdict(&token, &usage);
        if verdict != ErrorCode::Ok {
            return Ok(AccessDecision::rejected(verdict, "access rejected"));
        }

        usage.last_used = now_millis();
        self.write_json(&hello.token_id, USAGE_EXT, &usage)?;

        // Suppression: the same client always replaces its own older
        // session; over-subscribed tokens evict the oldest other client.
        let mut suppress = Vec::new();
        let mut suppressed_to = SuppressedTo::None;
        let mut others = Vec::new();
        for entry in self.sessions.iter() {
            if entry.value().token_id != hello.token_id {
                continue;
            }
            if entry.value().client_id == hello.client_id {
                suppress.push(*entry.key());
                suppressed_to = SuppressedTo::SameClient;
            } else {
                others.push(*entry.key());
            }
        }
        if let Some(max) = token.max_client_count {
            if max > 0 && others.len() >= max as usize {
                others.sort_unstable();
                let excess = others.len() + 1 - max as usize;
                for id in others.into_iter().take(excess) {
                    suppress.push(id);
                }
                if suppressed_to == SuppressedTo::None {
                    suppressed_to = SuppressedTo::Other;
                }
            }
        }
        for id in &suppress {
            self.sessions.remove(id);
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.insert(
            session_id,
            SessionRecord {
                token_id: hello.token_id.clone(),
                client_id: hello.client_id,
            },
        );

        Ok(AccessDecision {
            error_code: ErrorCode::Ok,
            error_message: None,
            session_id,
            access_usage: Self::usage_snapshot(&token, &usage),
            ad_requirement: token.ad_requirement,
            expiration: token.expiration,
            suppressed_to,
            suppress_session_ids: suppress,
        })
    }

    async fn session_get(&self, session_id: u64) -> Result<(ErrorCode, AccessUsage), AccessError> {
        let record = self
            .sessions
            .get(&session_id)
            .map(|e| e.value().clone())
            .ok_or(AccessError::SessionNotFound(session_id))?;

        let guard = self.locks.lock_for(&record.token_id);
        let _held = guard.lock().await;
        let token = self.read_token_locked(&record.token_id)?;
        let usage = self.read_usage_locked(&record.token_id)?;
        Ok((
            Self::verdict(&token, &usage),
            Self::usage_snapshot(&token, &usage),
        ))
    }

    async fn session_add_usage(
        &self,
        session_id: u64,
        traffic: Traffic,
        ad_data: Option<&str>,
    ) -> Result<(ErrorCode, AccessUsage), AccessError> {
        let record = self
            .sessions
            .get(&session_id)
            .map(|e| e.value().clone())
            .ok_or(AccessError::SessionNotFound(session_id))?;

        if let Some(ad) = ad_data {
            // The reward backend is external; an empty proof is the only
            // thing rejectable here.
            if ad.trim().is_empty() {
                return Ok((ErrorCode::RewardedAdRejected, AccessUsage::default()));
            }
        }

        let guard = self.locks.lock_for(&record.token_id);
        let _held = guard.lock().await;
        let token = self.read_token_locked(&record.token_id)?;
        let mut usage = self.read_usage_locked(&record.token_id)?;

        usage.sent = usage.sent.saturating_add(traffic.sent);
        usage.received = usage.received.saturating_add(traffic.received);
        usage.last_used = now_millis();
        self.write_json(&record.token_id, USAGE_EXT, &usage)?;

        Ok((
            Self::verdict(&token, &usage),
            Self::usage_snapshot(&token, &usage),
        ))
    }

    async fn session_close(&self, session_id: u64, traffic: Traffic) -> Result<(), AccessError> {
        if traffic.sent > 0 || traffic.received > 0 {
            let _ = self.session_add_usage(session_id, traffic, None).await;
        }
        self.sessions.remove(&session_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientInfo;

    fn hello_for(token: &AccessToken, client_id: uuid::Uuid) -> HelloRequest {
        HelloRequest {
            client_id,
            encrypted_client_id: crypto::encrypt_client_id(&token.secret, client_id)
                .unwrap()
                .to_vec(),
            client_info: ClientInfo {
                client_version: "0.1.0".into(),
                min_protocol_version: 4,
                max_protocol_version: 5,
                user_agent: "test".into(),
            },
            token_id: token.token_id.clone(),
            server_location: None,
            plan_id: None,
            access_code: None,
            allow_redirect: true,
            is_ipv6_supported: false,
        }
    }

    async fn manager() -> (FileAccessManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mgr = FileAccessManager::new(dir.path()).unwrap();
        (mgr, dir)
    }

    #[tokio::test]
    async fn token_files_roundtrip() {
        let (mgr, _dir) = manager().await;
        let token = mgr.create_token(Default::default()).await.unwrap();
        assert!(mgr.storage_dir().join(format!("{}.token2", token.token_id)).exists());

        let loaded = mgr.get_token(&token.token_id).await.unwrap();
        assert_eq!(loaded, token);

        let usage = mgr.get_usage(&token.token_id).await.unwrap();
        assert_eq!(usage.total(), 0);
    }

    #[tokio::test]
    async fn legacy_token_is_converted_on_open() {
        let (mgr, _dir) = manager().await;
        let legacy = serde_json::json!({
            "token_id": "old-token",
            "secret": crypto::random_key().to_vec(),
            "host_name": "vpn.example.com",
        });
        std::fs::write(
            mgr.storage_dir().join("old-token.token"),
            serde_json::to_vec(&legacy).unwrap(),
        )
        .unwrap();

        let token = mgr.get_token("old-token").await.unwrap();
        assert_eq!(token.version, TOKEN_SCHEMA_VERSION);
        assert_eq!(token.host_name, "vpn.example.com");
        assert!(mgr.storage_dir().join("old-token.token2").exists());
        assert!(!mgr.storage_dir().join("old-token.token").exists());
    }

    #[tokio::test]
    async fn hello_is_rejected_for_bad_proof() {
        let (mgr, _dir) = manager().await;
        let token = mgr.create_token(Default::default()).await.unwrap();

        let mut hello = hello_for(&token, uuid::Uuid::new_v4());
        hello.encrypted_client_id = vec![0u8; 16];
        let d = mgr.session_add(&hello).await.unwrap();
        assert_eq!(d.error_code, ErrorCode::UnauthorizedAccess);

        let hello = HelloRequest {
            token_id: "missing".into(),
            ..hello_for(&token, uuid::Uuid::new_v4())
        };
        let d = mgr.session_add(&hello).await.unwrap();
        assert_eq!(d.error_code, ErrorCode::AccessError);
    }

    #[tokio::test]
    async fn usage_accumulates_until_overflow() {
        let (mgr, _dir) = manager().await;
        let token = mgr
            .create_token(CreateTokenOptions {
                max_traffic: Some(1000),
                ..Default::default()
            })
            .await
            .unwrap();

        let d = mgr
            .session_add(&hello_for(&token, uuid::Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(d.error_code, ErrorCode::Ok);

        let (code, usage) = mgr
            .session_add_usage(d.session_id, Traffic::new(400, 300), None)
            .await
            .unwrap();
        assert_eq!(code, ErrorCode::Ok);
        assert_eq!(usage.sent, 400);
        assert_eq!(usage.received, 300);

        let (code, usage) = mgr
            .session_add_usage(d.session_id, Traffic::new(400, 300), None)
            .await
            .unwrap();
        assert_eq!(code, ErrorCode::AccessTrafficOverflow);
        assert_eq!(usage.sent, 800);

        // The verdict survives a fresh manager over the same directory.
        let mgr2 = FileAccessManager::new(mgr.storage_dir()).unwrap();
        let usage = mgr2.get_usage(&token.token_id).await.unwrap();
        assert_eq!(usage.total(), 1400);
    }

    #[tokio::test]
    async fn expired_token_is_rejected_at_hello() {
        let (mgr, _dir) = manager().await;
        let token = mgr
            .create_token(CreateTokenOptions {
                expiration: Some(now_millis().saturating_sub(1000)),
                ..Default::default()
            })
            .await
            .unwrap();

        let d = mgr
            .session_add(&hello_for(&token, uuid::Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(d.error_code, ErrorCode::AccessExpired);
    }

    #[tokio::test]
    async fn same_client_suppresses_its_own_session() {
        let (mgr, _dir) = manager().await;
        let token = mgr
            .create_token(CreateTokenOptions {
                max_client_count: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();
        let client = uuid::Uuid::new_v4();

        let first = mgr.session_add(&hello_for(&token, client)).await.unwrap();
        assert_eq!(first.suppressed_to, SuppressedTo::None);

        let second = mgr.session_add(&hello_for(&token, client)).await.unwrap();
        assert_eq!(second.suppressed_to, SuppressedTo::SameClient);
        assert_eq!(second.suppress_session_ids, vec![first.session_id]);
    }

    #[tokio::test]
    async fn oversubscribed_token_suppresses_oldest_other() {
        let (mgr, _dir) = manager().await;
        let token = mgr
            .create_token(CreateTokenOptions {
                max_client_count: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();

        let first = mgr
            .session_add(&hello_for(&token, uuid::Uuid::new_v4()))
            .await
            .unwrap();
        let second = mgr
            .session_add(&hello_for(&token, uuid::Uuid::new_v4()))
            .await
            .unwrap();
        assert_eq!(second.suppressed_to, SuppressedTo::Other);
        assert!(second.suppress_session_ids.contains(&first.session_id));
    }

    #[tokio::test]
    async fn rewarded_ad_requires_a_proof() {
        let (mgr, _dir) = manager().await;
        let token = mgr.create_token(Default::default()).await.unwrap();
        let d = mgr
            .session_add(&hello_for(&token, uuid::Uuid::new_v4()))
            .await
            .unwrap();

        let (code, _) = mgr
            .session_add_usage(d.session_id, Traffic::default(), Some("  "))
            .await
            .unwrap();
        assert_eq!(code, ErrorCode::RewardedAdRejected);

        let (code, _) = mgr
            .session_add_usage(d.session_id, Traffic::default(), Some("watched:abc"))
            .await
            .unwrap();
        assert_eq!(code, ErrorCode::Ok);
    }
}
