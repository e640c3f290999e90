//! Authenticated encryption of room payloads.
//!
//! Peers share only a secret string, so the AES-256-GCM key is derived
//! deterministically from it:
//!
//! ```text
//! secret ──PBKDF2-HMAC-SHA256(KEY_SALT, 100_000)──► 32-byte key
//!
//! encrypt:  IV(12, random) || AES-GCM(plaintext) + tag(16)
//! ```
//!
//! `KEY_SALT` is one application-wide constant shared by every room, so key
//! strength rests entirely on the entropy of the room secret. It is kept
//! fixed for compatibility with existing rooms and snapshots.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use rand::RngCore;
use sha2::Sha256;

/// Application-wide PBKDF2 salt.
pub const KEY_SALT: &[u8] = b"drawsync-room-key-v1";
pub const PBKDF2_ROUNDS: u32 = 100_000;
pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Crypto errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("ciphertext too short: {0} bytes, need at least {IV_LEN}")]
    TooShort(usize),
    #[error("decryption failed (authentication tag mismatch): wrong secret or corrupted data")]
    Authentication,
    #[error("encryption failed")]
    Encryption,
}

/// Symmetric key derived from a room secret.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomKey([u8; KEY_LEN]);

impl RoomKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RoomKey(..)")
    }
}

/// Derive the AES-256-GCM key for `secret`.
///
/// Same secret, same key: peers derive it independently.
pub fn derive_key(secret: &str) -> RoomKey {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), KEY_SALT, PBKDF2_ROUNDS, &mut key);
    RoomKey(key)
}

/// Encrypt `plaintext` under the key derived from `secret`.
pub fn encrypt(plaintext: &[u8], secret: &str) -> Result<Vec<u8>, CryptoError> {
    RoomCipher::new(secret).encrypt(plaintext)
}

/// Decrypt an `IV || ciphertext` blob under the key derived from `secret`.
pub fn decrypt(blob: &[u8], secret: &str) -> Result<Vec<u8>, CryptoError> {
    RoomCipher::new(secret).decrypt(blob)
}

/// Cipher bound to one room key.
///
/// Derivation costs 100k PBKDF2 rounds, so a session derives once and
/// reuses the cipher for every frame and snapshot.
#[derive(Clone)]
pub struct RoomCipher {
    cipher: Aes256Gcm,
}

impl RoomCipher {
    pub fn new(secret: &str) -> Self {
        Self::from_key(&derive_key(secret))
    }

    pub fn from_key(key: &RoomKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(GenericArray::from_slice(key.as_bytes())),
        }
    }

    /// Encrypt with a fresh random IV; returns `IV || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        rand::rng().fill_bytes(&mut iv);

        let ciphertext = self
            .cipher
            .encrypt(GenericArray::from_slice(&iv), plaintext)
            .map_err(|_| CryptoError::Encryption)?;

        let mut blob = Vec::with_capacity(IV_LEN + ciphertext.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a whole `IV || ciphertext` blob.
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if blob.len() < IV_LEN {
            return Err(CryptoError::TooShort(blob.len()));
        }
        let (iv, ciphertext) = blob.split_at(IV_LEN);
        self.cipher
            .decrypt(GenericArray::from_slice(iv), ciphertext)
            .map_err(|_| CryptoError::Authentication)
    }
}

impl std::fmt::Debug for RoomCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RoomCipher(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        assert_eq!(derive_key("room-secret"), derive_key("room-secret"));
        assert_ne!(derive_key("room-secret"), derive_key("room-secret!"));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = RoomCipher::new("s3cret");
        for plaintext in [&b""[..], &b"<mxfile>A</mxfile>"[..], &[0u8; 4096][..]] {
            let blob = cipher.encrypt(plaintext).unwrap();
            assert_eq!(blob.len(), IV_LEN + plaintext.len() + TAG_LEN);
            assert_eq!(cipher.decrypt(&blob).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_free_functions_interoperate() {
        let blob = encrypt(b"hello", "shared").unwrap();
        assert_eq!(decrypt(&blob, "shared").unwrap(), b"hello");
    }

    #[test]
    fn test_wrong_secret_fails() {
        let blob = RoomCipher::new("right").encrypt(b"diagram").unwrap();
        let err = RoomCipher::new("wrong").decrypt(&blob).unwrap_err();
        assert_eq!(err, CryptoError::Authentication);
    }

    #[test]
    fn test_iv_freshness() {
        let cipher = RoomCipher::new("s3cret");
        let a = cipher.encrypt(b"same plaintext").unwrap();
        let b = cipher.encrypt(b"same plaintext").unwrap();
        assert_ne!(a, b);
        assert_ne!(a[..IV_LEN], b[..IV_LEN]);
    }

    #[test]
    fn test_corrupted_ciphertext_fails() {
        let cipher = RoomCipher::new("s3cret");
        let mut blob = cipher.encrypt(b"diagram").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert_eq!(cipher.decrypt(&blob), Err(CryptoError::Authentication));
    }

    #[test]
    fn test_short_blob_rejected() {
        let cipher = RoomCipher::new("s3cret");
        assert_eq!(cipher.decrypt(&[0u8; 5]), Err(CryptoError::TooShort(5)));
        // IV alone, no tag
        assert_eq!(cipher.decrypt(&[0u8; IV_LEN]), Err(CryptoError::Authentication));
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = derive_key("top-secret");
        assert_eq!(format!("{key:?}"), "RoomKey(..)");
        assert_eq!(format!("{:?}", RoomCipher::from_key(&key)), "RoomCipher(..)");
    }
}
