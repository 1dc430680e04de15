//! RSA key files
//!
//! Each replica has `<name>_private.pem` and `<name>_public.pem` (PKCS#8 PEM)
//! in the configured key directory. Public keys of every peer must be present.

use crate::error::FsError;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use tracing::info;

/// Key directory
#[derive(Debug, Clone)]
pub struct KeyRing {
    dir: PathBuf,
}

impl KeyRing {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        KeyRing { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn private_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}_private.pem", name))
    }

    pub fn public_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}_public.pem", name))
    }

    pub fn load_private(&self, name: &str) -> Result<RsaPrivateKey, FsError> {
        let path = self.private_path(name);
        let pem = std::fs::read_to_string(&path)
            .map_err(|e| FsError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|e| FsError::Config(format!("bad private key {}: {}", path.display(), e)))
    }

    pub fn load_public(&self, name: &str) -> Result<RsaPublicKey, FsError> {
        let path = self.public_path(name);
        let pem = std::fs::read_to_string(&path)
            .map_err(|e| FsError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        RsaPublicKey::from_public_key_pem(&pem)
            .map_err(|e| FsError::Config(format!("bad public key {}: {}", path.display(), e)))
    }

    /// Generate and write a key pair for `name`
    pub fn generate(&self, name: &str, bits: usize) -> Result<(), FsError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| FsError::Config(format!("cannot create {}: {}", self.dir.display(), e)))?;
        let private = RsaPrivateKey::new(&mut rand::thread_rng(), bits)
            .map_err(|e| FsError::Config(format!("key generation failed: {}", e)))?;
        let public = RsaPublicKey::from(&private);

        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| FsError::Config(format!("cannot encode private key: {}", e)))?;
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| FsError::Config(format!("cannot encode public key: {}", e)))?;

        let write = |path: PathBuf, body: &str| {
            std::fs::write(&path, body)
                .map_err(|e| FsError::Config(format!("cannot write {}: {}", path.display(), e)))
        };
        write(self.private_path(name), private_pem.as_str())?;
        write(self.public_path(name), &public_pem)?;
        info!(name, bits, dir = %self.dir.display(), "Generated key pair");
        Ok(())
    }
}

/// RSA-OAEP (SHA-256) encryption to `key`
pub fn rsa_encrypt(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>, FsError> {
    key.encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), data)
        .map_err(|e| FsError::AuthenticationFailure(format!("RSA encrypt: {}", e)))
}

pub fn rsa_decrypt(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, FsError> {
    key.decrypt(Oaep::new::<Sha256>(), data)
        .map_err(|e| FsError::AuthenticationFailure(format!("RSA decrypt: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_load_and_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ring = KeyRing::new(dir.path());
        ring.generate("hub", 1024).unwrap();
        assert!(ring.private_path("hub").exists());

        let public = ring.load_public("hub").unwrap();
        let private = ring.load_private("hub").unwrap();
        let sealed = rsa_encrypt(&public, b"nonce").unwrap();
        assert_eq!(rsa_decrypt(&private, &sealed).unwrap(), b"nonce".to_vec());
    }

    #[test]
    fn test_missing_key_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let ring = KeyRing::new(dir.path());
        assert!(matches!(ring.load_public("nobody"), Err(FsError::Config(_))));
    }

    #[test]
    fn test_decrypt_with_other_key_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ring = KeyRing::new(dir.path());
        ring.generate("a", 1024).unwrap();
        ring.generate("b", 1024).unwrap();
        let sealed = rsa_encrypt(&ring.load_public("a").unwrap(), b"secret").unwrap();
        assert!(matches!(
            rsa_decrypt(&ring.load_private("b").unwrap(), &sealed),
            Err(FsError::AuthenticationFailure(_))
        ));
    }
}
