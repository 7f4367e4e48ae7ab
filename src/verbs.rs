//! Work-request model and the device-side collaborator traits.
//!
//! The endpoint does not talk to a verbs library directly. It builds
//! [`SendWr`]/[`RecvWr`] values, posts them through a [`QueuePair`], and
//! consumes [`Completion`]s delivered by the completion-queue dispatcher.
//! Process-global device services (memory registration lookup, CQ bindings,
//! the event dispatcher) are reached through [`RdmaEnv`].

use std::io;
use std::net::IpAddr;
use std::os::unix::io::RawFd;

use bitflags::bitflags;

use crate::buf::BlockRef;
use crate::cm::ConnManager;

bitflags! {
    /// Flags attached to an outbound work request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WrFlags: u32 {
        /// Embed the payload in the work request itself.
        const INLINE = 1 << 0;
        /// Ask the peer CPU to wake up for this completion.
        const SOLICITED = 1 << 1;
        /// Generate a local completion for this work request.
        const SIGNALED = 1 << 2;
    }
}

/// Scatter/gather entry: one address/length/key tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// Opcode of an outbound work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrOpcode {
    /// Send with immediate data.
    SendWithImm,
    /// RDMA write with immediate data and no payload, used for pure acks.
    WriteWithImm,
}

/// An outbound work request.
///
/// `imm` is the logical credit count. Transports put it on the wire in
/// big-endian and deliver the decoded value back in [`Completion`]s.
#[derive(Debug, Clone)]
pub struct SendWr {
    pub wr_id: u64,
    pub opcode: WrOpcode,
    pub imm: u32,
    pub flags: WrFlags,
    pub sge_list: Vec<Sge>,
}

impl SendWr {
    /// Total payload bytes across the scatter/gather list.
    pub fn payload_len(&self) -> usize {
        self.sge_list.iter().map(|sge| sge.length as usize).sum()
    }
}

/// An inbound work request posting one receive block.
#[derive(Debug, Clone, Copy)]
pub struct RecvWr {
    pub wr_id: u64,
    pub sge: Sge,
}

/// A completed work request as delivered by the CQ dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Local completion of a data send.
    Send,
    /// Local completion of a pure ack.
    Write,
    /// Data arrived; `imm` carries the peer's piggybacked credits.
    Recv { len: u32, imm: u32 },
    /// A pure ack arrived; `imm` carries the returned credits.
    RecvImm { imm: u32 },
    /// The work request completed with an error status.
    Error,
}

/// A queue pair owned by one endpoint.
///
/// Send and receive postings may come from different threads; the
/// implementation locks each queue independently, as verbs does.
pub trait QueuePair: Send + Sync {
    fn post_send(&self, wr: &SendWr) -> io::Result<()>;
    fn post_recv(&self, wr: &RecvWr) -> io::Result<()>;
}

/// A binding to a completion queue, shared with other endpoints or
/// exclusive to one.
pub trait CompletionBinding: Send + Sync {
    /// Whether the underlying queue serves multiple endpoints.
    fn is_shared(&self) -> bool;
    /// Give the binding back: drops the subscription on a shared queue,
    /// destroys an exclusive one. Called exactly once at teardown.
    fn release(&self);
}

/// Process-global RDMA device services.
pub trait RdmaEnv: Send + Sync {
    /// Create a connection manager for an outgoing connection.
    fn create_cm(&self) -> io::Result<Box<dyn ConnManager>>;
    /// Obtain a completion-queue binding of at least `capacity` entries for
    /// the socket identified by `sid`.
    fn get_cq(&self, sid: u64, capacity: u32) -> io::Result<Box<dyn CompletionBinding>>;
    /// Registration key covering `addr`, or 0 when the address is not in
    /// registered memory.
    fn lkey(&self, addr: u64) -> u32;
    /// Largest scatter/gather list the device accepts.
    fn max_sge(&self) -> usize;
    /// One payload block out of the registered pool.
    fn alloc_block(&self) -> Option<BlockRef>;
    /// Subscribe `fd` to the event dispatcher under `sid`.
    fn add_consumer(&self, sid: u64, fd: RawFd) -> io::Result<()>;
    /// Whether `ip` falls inside the configured RDMA cluster prefix.
    fn in_rdma_cluster(&self, ip: IpAddr) -> bool;
}
