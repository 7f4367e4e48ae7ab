//! rdmalink - a credit-windowed RDMA message stream bound to an existing
//! TCP socket.
//!
//! # Architecture
//!
//! ```text
//!                 byte socket (TCP)
//!                       |
//!           hello / sid exchange, fallback
//!                       v
//! +---------------------------------------------------+
//! |                    Endpoint                       |
//! |  +-------------+  +-----------+  +-------------+  |
//! |  | Handshake   |  | Send      |  | Completion  |  |
//! |  | FSM         |  | engine    |  | handler     |  |
//! |  | (status)    |  | (sbuf,    |  | (rbuf,      |  |
//! |  |             |  |  window)  |  |  credits)   |  |
//! |  +-------------+  +-----------+  +-------------+  |
//! +---------------------------------------------------+
//!        |                  |                |
//!   ConnManager          QueuePair      Completion
//!   (out-of-band         (post_send,    (from the CQ
//!    negotiation)         post_recv)     dispatcher)
//! ```
//!
//! - The upgrade runs over the byte socket first: the client writes a magic
//!   plus a random nonce, the server answers with its socket identifier,
//!   and the RDMA connect request must echo both. A mismatched magic or a
//!   zero identifier falls the connection back to plain TCP.
//! - Every send costs one window credit and carries the receive credits
//!   accumulated since the last send in its immediate data; pure acks ship
//!   credits when there is no data to piggyback them on.
//! - The device, connection manager, completion queue, and socket are
//!   reached through traits; the endpoint owns only its queue pair, its
//!   rings, and its window accounting.

pub mod buf;
pub mod cm;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod socket;
pub mod verbs;
pub mod wire;

mod datapath;
mod handshake;

pub use buf::{BlockBuf, BlockRef, BLOCK_PAYLOAD};
pub use cm::{CmEvent, CmProgress, ConnManager};
pub use config::{Config, MIN_QUEUE_SIZE};
pub use datapath::INLINE_THRESHOLD;
pub use endpoint::{Endpoint, HandshakeProgress, Status, RESERVED_WR_NUM};
pub use error::{Error, Result};
pub use socket::{ByteSocket, RdmaState, SocketTable};
pub use verbs::{
    Completion, CompletionBinding, QueuePair, RdmaEnv, RecvWr, SendWr, Sge, WrFlags, WrOpcode,
};
pub use wire::{
    ConnectRequest, ConnectResponse, Hello, CONNECT_REQUEST_LENGTH, CONNECT_RESPONSE_LENGTH,
    HELLO_LENGTH, MAGIC, NONCE_LENGTH, SID_LENGTH,
};
