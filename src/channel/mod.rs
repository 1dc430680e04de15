//! Secure channel
//!
//! RSA key exchange that hands every replica the cluster session key, and the
//! AES-CTR + HMAC-SHA256 envelope wrapping every call after that.

pub mod handshake;
pub mod keys;
pub mod session;

pub use handshake::{answer, AuthReply, AuthRequest, PendingAuth};
pub use keys::KeyRing;
pub use session::{SessionKey, SessionSlot};
