//! Byte-socket collaborator traits.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::buf::BlockBuf;
use crate::endpoint::Endpoint;

/// Whether the connection has been upgraded to RDMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdmaState {
    /// The handshake has not decided yet.
    Uninitialized,
    /// Data flows over the queue pair.
    On,
    /// The connection stays plain TCP.
    Off,
}

/// The TCP socket an endpoint is attached to.
///
/// The socket owns the endpoint; the endpoint keeps a non-owning handle and
/// reaches everything it needs through this trait.
pub trait ByteSocket: Send + Sync {
    /// The socket fd.
    fn fd(&self) -> RawFd;
    /// Process-wide socket identifier; also used as the work-request id.
    fn id(&self) -> u64;
    /// Peer address.
    fn remote_side(&self) -> SocketAddr;
    /// Whether this side initiated the connection.
    fn created_by_connect(&self) -> bool;
    /// Current upgrade state.
    fn rdma_state(&self) -> RdmaState;
    /// Change the upgrade state.
    fn set_rdma_state(&self, state: RdmaState);
    /// Non-blocking read from the socket fd. `Ok(0)` means the peer closed;
    /// `WouldBlock` means nothing is buffered.
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Non-blocking write to the socket fd.
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
    /// Append received bytes to the socket read buffer for the upper layer.
    fn append_read_buf(&self, data: BlockBuf);
    /// Bytes currently waiting in the read buffer.
    fn read_buf_len(&self) -> usize;
    /// Wake writers blocked on writability.
    fn wake_as_epoll_out(&self);
    /// Fail the connection with a reason.
    fn set_failed(&self, msg: &str);
    /// Whether the connection has already failed.
    fn failed(&self) -> bool;
}

/// Lookup of endpoints by socket identifier, used by the listener to match
/// an incoming connect request to its endpoint without holding a reference
/// across destruction.
pub trait SocketTable: Send + Sync {
    fn find(&self, sid: u64) -> Option<Arc<Endpoint>>;
}
