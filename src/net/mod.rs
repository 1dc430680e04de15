//! Peer wire protocol
//!
//! Every frame is a big-endian `u32` length followed by a bincode body.
//! `Authenticate` travels in the clear (its payload is RSA-encrypted); every
//! other call is a bincode [`Call`] sealed under the cluster session key, and
//! its [`Reply`] comes back sealed the same way.

pub mod client;
pub mod server;

pub use client::{BroadcastReport, PeerClient, PeerSet};
pub use server::Server;

use crate::channel::{AuthReply, SessionKey};
use crate::error::FsError;
use crate::types::{Hash, Inode, ReplicaId};
use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Upper bound on one frame; a node blob or a single chunk is far smaller
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Frames sent by the dialing side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireRequest {
    /// RSA-encrypted `AuthRequest`
    Authenticate(Vec<u8>),
    /// Sealed `Call`
    Sealed(Vec<u8>),
}

/// Frames sent back by the listening side
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireResponse {
    Authenticated(AuthReply),
    /// Sealed `Reply`
    Sealed(Vec<u8>),
    /// The request failed verification; the connection is closed after this
    Rejected(String),
}

/// Authenticated RPCs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Call {
    ReqToken { from: ReplicaId },
    ReqDNode(Hash),
    ReqData(Hash),
    /// Push of a serialized root node along with the sender's inode counter
    Receive { node: Vec<u8>, next_inode: Inode },
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::ReqToken { .. } => "ReqToken",
            Call::ReqDNode(_) => "ReqDNode",
            Call::ReqData(_) => "ReqData",
            Call::Receive { .. } => "Receive",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub ack: bool,
    /// Replica that produced the reply
    pub from: ReplicaId,
    pub payload: Option<Vec<u8>>,
}

impl Reply {
    pub fn ack(from: ReplicaId) -> Self {
        Reply {
            ack: true,
            from,
            payload: None,
        }
    }

    pub fn nack(from: ReplicaId) -> Self {
        Reply {
            ack: false,
            from,
            payload: None,
        }
    }

    pub fn with_payload(from: ReplicaId, payload: Vec<u8>) -> Self {
        Reply {
            ack: true,
            from,
            payload: Some(payload),
        }
    }
}

pub fn seal_message<T: Serialize>(key: &SessionKey, message: &T) -> Result<Vec<u8>, FsError> {
    key.seal(&bincode::serialize(message)?)
}

/// Open and decode a sealed message; a bad body after a good HMAC is still
/// an authentication failure
pub fn open_message<T: DeserializeOwned>(key: &SessionKey, sealed: &[u8]) -> Result<T, FsError> {
    let plain = key.open(sealed)?;
    bincode::deserialize(&plain)
        .map_err(|e| FsError::AuthenticationFailure(format!("undecodable sealed body: {}", e)))
}

/// Length-prefixed bincode codec decoding `D` and encoding `E`
#[derive(Debug)]
pub struct WireCodec<D, E> {
    _marker: PhantomData<fn(E) -> D>,
}

impl<D, E> Default for WireCodec<D, E> {
    fn default() -> Self {
        WireCodec {
            _marker: PhantomData,
        }
    }
}

impl<D: DeserializeOwned, E> Decoder for WireCodec<D, E> {
    type Item = D;
    type Error = FsError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<D>, FsError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > MAX_FRAME_LEN {
            return Err(FsError::SerializationFailure(format!(
                "received frame that is too large: {}",
                frame_len
            )));
        }
        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }
        let message = bincode::deserialize(&src[4..4 + frame_len])?;
        src.advance(4 + frame_len);
        Ok(Some(message))
    }
}

impl<D, E: Serialize> Encoder<E> for WireCodec<D, E> {
    type Error = FsError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), FsError> {
        let body = bincode::serialize(&item)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(FsError::SerializationFailure(format!(
                "attempting to send frame that is too large: {}",
                body.len()
            )));
        }
        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}

/// Dialing side of a connection
pub type ClientTransport = Framed<TcpStream, WireCodec<WireResponse, WireRequest>>;

/// Listening side of a connection
pub type ServerTransport = Framed<TcpStream, WireCodec<WireRequest, WireResponse>>;

pub fn client_transport(stream: TcpStream) -> ClientTransport {
    Framed::new(stream, WireCodec::default())
}

pub fn server_transport(stream: TcpStream) -> ServerTransport {
    Framed::new(stream, WireCodec::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_waits_for_whole_frame() {
        let mut codec: WireCodec<WireRequest, WireRequest> = WireCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(WireRequest::Sealed(vec![7; 300]), &mut buf)
            .unwrap();
        let full = buf.clone();

        let mut partial = BytesMut::from(&full[..100]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        let mut whole = full;
        match codec.decode(&mut whole).unwrap() {
            Some(WireRequest::Sealed(body)) => assert_eq!(body, vec![7; 300]),
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(whole.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec: WireCodec<WireRequest, WireRequest> = WireCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_LEN + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_sealed_call_opens_with_same_key_only() {
        let key = SessionKey::generate();
        let call = Call::Receive {
            node: b"root".to_vec(),
            next_inode: 9,
        };
        let sealed = seal_message(&key, &call).unwrap();
        let opened: Call = open_message(&key, &sealed).unwrap();
        assert_eq!(opened, call);

        let other = SessionKey::generate();
        let err = open_message::<Call>(&other, &sealed).unwrap_err();
        assert!(matches!(err, FsError::AuthenticationFailure(_)));
    }
}
