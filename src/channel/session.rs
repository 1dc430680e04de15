//! Session key and call envelopes
//!
//! `encrypt` is AES-128-CTR with a random IV prefixed to the ciphertext.
//! `seal` encrypts the payload, MACs the ciphertext, and encrypts the
//! `{ciphertext, hmac}` bundle again for transport. `open` reverses that and
//! checks the MAC before the inner payload is decrypted.

use crate::error::FsError;
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 16;
const IV_LEN: usize = 16;

#[derive(Serialize, Deserialize)]
struct Envelope {
    ciphertext: Vec<u8>,
    hmac: Vec<u8>,
}

/// Symmetric key shared by every authenticated replica
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_LEN]);

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        SessionKey(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FsError> {
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            FsError::AuthenticationFailure(format!("session key must be {} bytes", KEY_LEN))
        })?;
        Ok(SessionKey(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn cipher(&self, iv: &[u8]) -> Result<Aes128Ctr, FsError> {
        Aes128Ctr::new_from_slices(&self.0, iv)
            .map_err(|_| FsError::AuthenticationFailure("bad cipher parameters".to_string()))
    }

    fn mac(&self) -> Result<HmacSha256, FsError> {
        HmacSha256::new_from_slice(&self.0)
            .map_err(|_| FsError::AuthenticationFailure("bad MAC key".to_string()))
    }

    /// IV followed by the AES-CTR ciphertext
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, FsError> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let mut out = Vec::with_capacity(IV_LEN + plaintext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(plaintext);
        self.cipher(&iv)?.apply_keystream(&mut out[IV_LEN..]);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, FsError> {
        if data.len() < IV_LEN {
            return Err(FsError::AuthenticationFailure(
                "ciphertext shorter than its IV".to_string(),
            ));
        }
        let (iv, body) = data.split_at(IV_LEN);
        let mut out = body.to_vec();
        self.cipher(iv)?.apply_keystream(&mut out);
        Ok(out)
    }

    /// Wrap a call payload for transport
    pub fn seal(&self, payload: &[u8]) -> Result<Vec<u8>, FsError> {
        let ciphertext = self.encrypt(payload)?;
        let mut mac = self.mac()?;
        mac.update(&ciphertext);
        let envelope = Envelope {
            hmac: mac.finalize().into_bytes().to_vec(),
            ciphertext,
        };
        self.encrypt(&bincode::serialize(&envelope)?)
    }

    /// Unwrap a sealed payload; any tampering is an authentication failure
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, FsError> {
        let bundle = self.decrypt(sealed)?;
        let envelope: Envelope = bincode::deserialize(&bundle)
            .map_err(|_| FsError::AuthenticationFailure("malformed envelope".to_string()))?;
        let mut mac = self.mac()?;
        mac.update(&envelope.ciphertext);
        mac.verify_slice(&envelope.hmac)
            .map_err(|_| FsError::AuthenticationFailure("HMAC mismatch".to_string()))?;
        self.decrypt(&envelope.ciphertext)
    }
}

/// The session key once the handshake has produced it
#[derive(Debug, Default)]
pub struct SessionSlot(RwLock<Option<SessionKey>>);

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: SessionKey) {
        *self.0.write() = Some(key);
    }

    pub fn is_established(&self) -> bool {
        self.0.read().is_some()
    }

    pub fn get(&self) -> Result<SessionKey, FsError> {
        self.0
            .read()
            .clone()
            .ok_or_else(|| FsError::AuthenticationFailure("no session key yet".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = SessionKey::generate();
        let sealed = key.seal(b"receive this node").unwrap();
        assert_eq!(key.open(&sealed).unwrap(), b"receive this node".to_vec());
    }

    #[test]
    fn test_encryption_uses_fresh_iv() {
        let key = SessionKey::generate();
        let a = key.encrypt(b"same").unwrap();
        let b = key.encrypt(b"same").unwrap();
        assert_ne!(a, b);
        assert_eq!(key.decrypt(&a).unwrap(), key.decrypt(&b).unwrap());
    }

    #[test]
    fn test_any_flipped_bit_is_rejected() {
        let key = SessionKey::generate();
        let sealed = key.seal(&[0x5a; 64]).unwrap();
        for byte in 0..sealed.len() {
            for bit in [0u8, 3, 7] {
                let mut tampered = sealed.clone();
                tampered[byte] ^= 1 << bit;
                let err = key.open(&tampered).unwrap_err();
                assert!(matches!(err, FsError::AuthenticationFailure(_)));
            }
        }
    }

    #[test]
    fn test_wrong_key_is_rejected() {
        let sealed = SessionKey::generate().seal(b"payload").unwrap();
        let other = SessionKey::generate();
        assert!(matches!(
            other.open(&sealed),
            Err(FsError::AuthenticationFailure(_))
        ));
    }

    #[test]
    fn test_slot_starts_empty() {
        let slot = SessionSlot::new();
        assert!(slot.get().is_err());
        slot.set(SessionKey::generate());
        assert!(slot.is_established());
    }
}
