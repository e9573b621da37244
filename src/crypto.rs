use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit as BlockKeyInit};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const KEY_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("bad key length {0}, expected {KEY_LEN}")]
    BadKeyLength(usize),
    #[error("datagram failed authentication")]
    OpenFailed,
}

/// Per-session AEAD for the UDP channel, keyed by the server secret. The
/// 64-bit position counter carried in each datagram header is the only
/// varying nonce input, so a sender must never reuse a position.
pub struct SessionCrypt {
    cipher: Aes128Gcm,
}

impl SessionCrypt {
    pub fn new(server_secret: &[u8]) -> Result<Self, CryptoError> {
        if server_secret.len() != KEY_LEN {
            return Err(CryptoError::BadKeyLength(server_secret.len()));
        }
        Ok(Self {
            cipher: Aes128Gcm::new(GenericArray::from_slice(server_secret)),
        })
    }

    fn nonce(position: u64) -> [u8; NONCE_LEN] {
        let mut n = [0u8; NONCE_LEN];
        n[4..].copy_from_slice(&position.to_be_bytes());
        n
    }

    pub fn seal(&self, position: u64, plaintext: &[u8]) -> Vec<u8> {
        let nonce = Self::nonce(position);
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), Payload::from(plaintext))
            .expect("aes-gcm seal is infallible for in-memory buffers")
    }

    pub fn open(&self, position: u64, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Self::nonce(position);
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), Payload::from(ciphertext))
            .map_err(|_| CryptoError::OpenFailed)
    }
}

/// Hello proof: one AES block of the client id under the token secret.
pub fn encrypt_client_id(token_secret: &[u8], client_id: uuid::Uuid) -> Result<[u8; 16], CryptoError> {
    if token_secret.len() != KEY_LEN {
        return Err(CryptoError::BadKeyLength(token_secret.len()));
    }
    let cipher = Aes128::new(GenericArray::from_slice(token_secret));
    let mut block = GenericArray::clone_from_slice(client_id.as_bytes());
    cipher.encrypt_block(&mut block);
    Ok(block.into())
}

/// SHA-256 over the DER encoding of a certificate, as pinned in tokens.
pub fn cert_hash(cert_der: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(cert_der);
    h.finalize().into()
}

pub fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::fill(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let key = random_key();
        let crypt = SessionCrypt::new(&key).unwrap();

        let ct = crypt.seal(1, b"ip packet bytes");
        assert_eq!(ct.len(), b"ip packet bytes".len() + TAG_LEN);
        let pt = crypt.open(1, &ct).unwrap();
        assert_eq!(pt, b"ip packet bytes");
    }

    #[test]
    fn open_rejects_wrong_position() {
        let key = random_key();
        let crypt = SessionCrypt::new(&key).unwrap();
        let ct = crypt.seal(5, b"payload");
        assert!(matches!(crypt.open(6, &ct), Err(CryptoError::OpenFailed)));
    }

    #[test]
    fn open_rejects_tampering_and_wrong_key() {
        let crypt = SessionCrypt::new(&random_key()).unwrap();
        let mut ct = crypt.seal(9, b"payload");
        ct[0] ^= 1;
        assert!(crypt.open(9, &ct).is_err());

        let other = SessionCrypt::new(&random_key()).unwrap();
        let ct = crypt.seal(9, b"payload");
        assert!(other.open(9, &ct).is_err());
    }

    #[test]
    fn positions_produce_distinct_ciphertexts() {
        let crypt = SessionCrypt::new(&random_key()).unwrap();
        assert_ne!(crypt.seal(1, b"same"), crypt.seal(2, b"same"));
    }

    #[test]
    fn client_id_proof_is_deterministic_per_secret() {
        let id = uuid::Uuid::new_v4();
        let secret = random_key();
        let a = encrypt_client_id(&secret, id).unwrap();
        let b = encrypt_client_id(&secret, id).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.as_slice(), id.as_bytes());

        let c = encrypt_client_id(&random_key(), id).unwrap();
        assert_ne!(a, c);

        assert!(matches!(
            encrypt_client_id(&[1, 2, 3], id),
            Err(CryptoError::BadKeyLength(3))
        ));
    }

    #[test]
    fn cert_hash_is_stable() {
        assert_eq!(cert_hash(b"der"), cert_hash(b"der"));
        assert_ne!(cert_hash(b"der"), cert_hash(b"red"));
    }
}
