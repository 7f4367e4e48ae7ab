//! Connection-manager collaborator trait.
//!
//! The RDMA connection manager negotiates queue-pair parameters out of band.
//! Its fd is level-polled by the event dispatcher; the endpoint drains one
//! event per handshake tick through [`ConnManager::poll_event`].

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::verbs::{CompletionBinding, QueuePair};

/// One event off the connection manager's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEvent {
    /// Nothing pending.
    None,
    /// Address resolution finished.
    AddrResolved,
    /// Route resolution finished.
    RouteResolved,
    /// An incoming connect request was matched to this endpoint.
    Accept,
    /// The connection is up.
    Established,
    /// The peer disconnected.
    Disconnect,
    /// The connection manager failed.
    Error,
    /// An event the endpoint does not handle.
    Other,
}

/// Outcome of an asynchronous connection-manager call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmProgress {
    /// Completed synchronously; proceed without waiting for the event.
    Done,
    /// In flight; the matching [`CmEvent`] arrives later.
    Pending,
}

/// One RDMA connection manager, bound to one endpoint for its lifetime.
pub trait ConnManager: Send + Sync {
    /// The event channel fd, for dispatcher subscription.
    fn fd(&self) -> RawFd;
    /// Start resolving the peer address.
    fn resolve_addr(&self, addr: SocketAddr) -> io::Result<CmProgress>;
    /// Start resolving the route to the resolved address.
    fn resolve_route(&self) -> io::Result<CmProgress>;
    /// Post the connect request carrying `private_data`.
    fn connect(&self, private_data: &[u8]) -> io::Result<CmProgress>;
    /// Accept the pending connect request, answering with `private_data`.
    fn accept(&self, private_data: &[u8]) -> io::Result<CmProgress>;
    /// Drain one event, or [`CmEvent::None`].
    fn poll_event(&self) -> CmEvent;
    /// Private data attached to the peer's connect response, if any.
    fn conn_data(&self) -> Option<Vec<u8>>;
    /// Create the queue pair for this connection on `cq`.
    fn create_qp(
        &self,
        sq_depth: u32,
        rq_depth: u32,
        cq: &dyn CompletionBinding,
        user_id: u64,
    ) -> io::Result<Box<dyn QueuePair>>;
}
