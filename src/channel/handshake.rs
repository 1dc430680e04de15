//! Authenticate exchange
//!
//! The joining replica sends `{name, nonce}` RSA-encrypted to the auth peer.
//! The auth peer answers with the session key RSA-encrypted to the joiner's
//! public key and the nonce encrypted under that session key. The joiner only
//! accepts the key if the nonce comes back intact.

use super::keys::{rsa_decrypt, rsa_encrypt, KeyRing};
use super::session::SessionKey;
use crate::error::FsError;
use rand::RngCore;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const NONCE_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub name: String,
    pub nonce: [u8; NONCE_LEN],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthReply {
    /// Session key, RSA-encrypted to the requester
    pub wrapped_key: Vec<u8>,
    /// Echoed nonce, encrypted under the session key
    pub sealed_nonce: Vec<u8>,
}

/// Requester state between sending the request and reading the reply
#[derive(Debug)]
pub struct PendingAuth {
    nonce: [u8; NONCE_LEN],
}

impl PendingAuth {
    /// Build the encrypted request for the auth peer
    pub fn begin(name: &str, auth_public: &RsaPublicKey) -> Result<(Self, Vec<u8>), FsError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let request = AuthRequest {
            name: name.to_string(),
            nonce,
        };
        let encrypted = rsa_encrypt(auth_public, &bincode::serialize(&request)?)?;
        Ok((PendingAuth { nonce }, encrypted))
    }

    /// Unwrap the session key and check the echoed nonce
    pub fn finish(self, reply: &AuthReply, own_private: &RsaPrivateKey) -> Result<SessionKey, FsError> {
        let key = SessionKey::from_bytes(&rsa_decrypt(own_private, &reply.wrapped_key)?)?;
        let echoed = key.decrypt(&reply.sealed_nonce)?;
        if echoed != self.nonce {
            return Err(FsError::AuthenticationFailure(
                "auth reply does not echo our nonce".to_string(),
            ));
        }
        info!("Session key established");
        Ok(key)
    }
}

/// Auth-peer side: answer an encrypted request with `session`
///
/// Returns the requester's name along with the reply.
pub fn answer(
    encrypted: &[u8],
    own_private: &RsaPrivateKey,
    keys: &KeyRing,
    session: &SessionKey,
) -> Result<(String, AuthReply), FsError> {
    let request: AuthRequest = bincode::deserialize(&rsa_decrypt(own_private, encrypted)?)
        .map_err(|_| FsError::AuthenticationFailure("malformed auth request".to_string()))?;
    let requester = keys.load_public(&request.name).map_err(|e| {
        FsError::AuthenticationFailure(format!("unknown replica '{}': {}", request.name, e))
    })?;
    let reply = AuthReply {
        wrapped_key: rsa_encrypt(&requester, session.as_bytes())?,
        sealed_nonce: session.encrypt(&request.nonce)?,
    };
    debug!(requester = %request.name, "Answered authentication");
    Ok((request.name, reply))
}
