//! Handshake messages exchanged while upgrading a TCP connection to RDMA.
//!
//! The hello travels over the byte socket; the connect request/response
//! travel as private data on the RDMA connection manager. All multi-byte
//! integers are big-endian on the wire.

use crate::error::{Error, Result};

/// Magic prefix of the client hello.
pub const MAGIC: [u8; MAGIC_LENGTH] = *b"RDMA";

/// Length of the magic prefix in bytes.
pub const MAGIC_LENGTH: usize = 4;

/// Length of the per-connection nonce in bytes.
pub const NONCE_LENGTH: usize = 16;

/// Length of the client hello: magic followed by the nonce.
pub const HELLO_LENGTH: usize = MAGIC_LENGTH + NONCE_LENGTH;

/// Length of the socket identifier the server answers with.
pub const SID_LENGTH: usize = 8;

/// Serialized length of [`ConnectRequest`].
pub const CONNECT_REQUEST_LENGTH: usize = SID_LENGTH + NONCE_LENGTH + 8;

/// Serialized length of [`ConnectResponse`].
pub const CONNECT_RESPONSE_LENGTH: usize = 8;

/// Client hello written over the byte socket.
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       4     magic ("RDMA")
/// 4       16    nonce
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    /// Random value binding the later connect request to this connection.
    pub nonce: [u8; NONCE_LENGTH],
}

impl Hello {
    /// Serialize the hello.
    pub fn to_bytes(&self) -> [u8; HELLO_LENGTH] {
        let mut out = [0u8; HELLO_LENGTH];
        out[..MAGIC_LENGTH].copy_from_slice(&MAGIC);
        out[MAGIC_LENGTH..].copy_from_slice(&self.nonce);
        out
    }

    /// Parse a hello, validating the magic prefix.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HELLO_LENGTH {
            return Err(Error::Truncated {
                required: HELLO_LENGTH,
                available: bytes.len(),
            });
        }
        if bytes[..MAGIC_LENGTH] != MAGIC {
            let mut got = [0u8; MAGIC_LENGTH];
            got.copy_from_slice(&bytes[..MAGIC_LENGTH]);
            return Err(Error::InvalidMagic { got });
        }
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce.copy_from_slice(&bytes[MAGIC_LENGTH..HELLO_LENGTH]);
        Ok(Self { nonce })
    }
}

/// Private data of the client's connection-manager connect.
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       8     sid (u64 BE)
/// 8       16    nonce
/// 24      4     rq_size (u32 BE)
/// 28      4     sq_size (u32 BE)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Server-side socket identifier the request targets.
    pub sid: u64,
    /// Nonce from the hello on the same connection.
    pub nonce: [u8; NONCE_LENGTH],
    /// Client receive queue depth.
    pub rq_size: u32,
    /// Client send queue depth.
    pub sq_size: u32,
}

impl ConnectRequest {
    /// Serialize the request.
    pub fn to_bytes(&self) -> [u8; CONNECT_REQUEST_LENGTH] {
        let mut out = [0u8; CONNECT_REQUEST_LENGTH];
        out[..8].copy_from_slice(&self.sid.to_be_bytes());
        out[8..24].copy_from_slice(&self.nonce);
        out[24..28].copy_from_slice(&self.rq_size.to_be_bytes());
        out[28..32].copy_from_slice(&self.sq_size.to_be_bytes());
        out
    }

    /// Parse a request.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CONNECT_REQUEST_LENGTH {
            return Err(Error::Truncated {
                required: CONNECT_REQUEST_LENGTH,
                available: bytes.len(),
            });
        }
        let mut sid = [0u8; 8];
        sid.copy_from_slice(&bytes[..8]);
        let mut nonce = [0u8; NONCE_LENGTH];
        nonce.copy_from_slice(&bytes[8..24]);
        let mut rq = [0u8; 4];
        rq.copy_from_slice(&bytes[24..28]);
        let mut sq = [0u8; 4];
        sq.copy_from_slice(&bytes[28..32]);
        Ok(Self {
            sid: u64::from_be_bytes(sid),
            nonce,
            rq_size: u32::from_be_bytes(rq),
            sq_size: u32::from_be_bytes(sq),
        })
    }
}

/// Private data of the server's connection-manager accept.
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       4     rq_size (u32 BE)
/// 4       4     sq_size (u32 BE)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponse {
    /// Server receive queue depth.
    pub rq_size: u32,
    /// Server send queue depth.
    pub sq_size: u32,
}

impl ConnectResponse {
    /// Serialize the response.
    pub fn to_bytes(&self) -> [u8; CONNECT_RESPONSE_LENGTH] {
        let mut out = [0u8; CONNECT_RESPONSE_LENGTH];
        out[..4].copy_from_slice(&self.rq_size.to_be_bytes());
        out[4..8].copy_from_slice(&self.sq_size.to_be_bytes());
        out
    }

    /// Parse a response.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CONNECT_RESPONSE_LENGTH {
            return Err(Error::Truncated {
                required: CONNECT_RESPONSE_LENGTH,
                available: bytes.len(),
            });
        }
        let mut rq = [0u8; 4];
        rq.copy_from_slice(&bytes[..4]);
        let mut sq = [0u8; 4];
        sq.copy_from_slice(&bytes[4..8]);
        Ok(Self {
            rq_size: u32::from_be_bytes(rq),
            sq_size: u32::from_be_bytes(sq),
        })
    }
}
