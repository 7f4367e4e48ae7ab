//! The RDMA endpoint attached to one upgraded connection.
//!
//! Lifecycle: the endpoint is created alongside its socket in
//! [`Status::Uninitialized`], walks the handshake state machine until the
//! queue pair is established, and is torn down by [`Endpoint::reset`], which
//! releases every resource exactly once and rewinds all counters.

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Weak};
use std::thread;

use log::warn;

use crate::buf::BlockBuf;
use crate::cm::ConnManager;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::socket::ByteSocket;
use crate::verbs::{Completion, CompletionBinding, QueuePair, RdmaEnv};
use crate::wire::NONCE_LENGTH;

/// Work requests reserved in each queue direction for pure-ack traffic.
///
/// DO NOT change this value unless you know the safe value.
pub const RESERVED_WR_NUM: u32 = 3;

/// Handshake state machine position.
///
/// Clients walk `Uninitialized -> HelloC -> AddrResolving -> RouteResolving
/// -> Connecting -> Established`; servers walk `Uninitialized -> HelloS ->
/// Accepting -> Established`. Both chains advance monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Uninitialized,
    HelloC,
    AddrResolving,
    RouteResolving,
    Connecting,
    HelloS,
    Accepting,
    Established,
}

/// Outcome of one handshake tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeProgress {
    /// Input not ready yet; re-arm the dispatcher and call again.
    Again,
    /// The connection stays plain TCP; this many bytes now sit in the
    /// socket read buffer.
    Bytes(usize),
    /// The peer closed, or the connection disconnected.
    Closed,
}

pub(crate) struct HandshakeState {
    pub(crate) status: Status,
    /// Staging buffer for the hello / sid bytes read off the socket.
    pub(crate) hello_buf: BlockBuf,
    pub(crate) nonce: [u8; NONCE_LENGTH],
    pub(crate) remote_sid: u64,
    /// Outstanding sends the peer permits; shrunk at handshake to the
    /// smaller of our send depth and the peer's receive depth.
    pub(crate) local_window_capacity: u32,
    /// The analogous value on the peer side; drives pure-ack emission.
    pub(crate) remote_window_capacity: u32,
}

pub(crate) struct SendState {
    /// Next send-ring slot to fill.
    pub(crate) sq_current: u32,
    /// Sends posted without SIGNALED since the last signaled one.
    pub(crate) sq_unsignaled: u32,
    /// Consecutive sends posted without SOLICITED.
    pub(crate) unsolicited: u32,
    /// Credits shipped in immediates since the last solicited send.
    pub(crate) accumulated_ack: u32,
}

pub(crate) struct RecvState {
    /// Next send-ring slot to free when peer acks arrive.
    pub(crate) sq_sent: u32,
    /// Next receive-ring slot to re-post.
    pub(crate) rq_received: u32,
    /// Receive blocks, one per posted work request.
    pub(crate) rbuf: Vec<BlockBuf>,
    /// Raw addresses of the posted blocks.
    pub(crate) rbuf_data: Vec<u64>,
}

pub(crate) struct Resources {
    pub(crate) cm: Option<Box<dyn ConnManager>>,
    pub(crate) cq: Option<Box<dyn CompletionBinding>>,
    pub(crate) qp: Option<Box<dyn QueuePair>>,
    /// Wakeup channel from the listener to the server handshake.
    pub(crate) pipefd: [libc::c_int; 2],
    /// Feed of the shared-CQ consumer task, when one is attached.
    pub(crate) completions: Option<mpsc::Sender<Completion>>,
}

/// One endpoint per upgraded connection.
pub struct Endpoint {
    socket: Arc<dyn ByteSocket>,
    env: Arc<dyn RdmaEnv>,
    config: Config,
    /// Nominal send ring depth, fixed at construction.
    pub(crate) sq_size: u32,
    /// Nominal receive ring depth, fixed at construction.
    pub(crate) rq_size: u32,
    /// Credits currently available to the send path.
    pub(crate) window: AtomicU32,
    /// Receive work requests replenished since the last credit shipment.
    pub(crate) new_rq_wrs: AtomicU32,
    hs: UnsafeCell<HandshakeState>,
    send: UnsafeCell<SendState>,
    recv: UnsafeCell<RecvState>,
    /// In-flight send data, one slot per send work request.
    sbuf: UnsafeCell<Vec<UnsafeCell<BlockBuf>>>,
    res: UnsafeCell<Resources>,
    weak: Weak<Endpoint>,
}

// Safety: apart from the two atomics, endpoint state is partitioned by path
// ownership. The handshake state is only touched by the handshake tick,
// which is single-threaded until Established (dispatcher wakeups order the
// accept-path capacity writes before the pipe byte that lets the server FSM
// proceed). The send state is serialized by the socket's write-side
// exclusion. The recv state is serialized by the single completion
// consumer. The sbuf ring uses one cell per slot: the send path only writes
// slot sq_current while holding a credit, the completion path only clears
// slots in [sq_sent, sq_current), so no slot ever has two owners. Resources
// are installed during the single-threaded handshake phase and only read
// afterwards; reset() requires external quiescence, as teardown does.
unsafe impl Send for Endpoint {}
unsafe impl Sync for Endpoint {}

impl Endpoint {
    /// Create an endpoint for `socket`. Heavy resources are not allocated
    /// until the handshake reaches the connection-manager phase.
    pub fn new(socket: Arc<dyn ByteSocket>, env: Arc<dyn RdmaEnv>, config: Config) -> Arc<Self> {
        let sq_size = config.sq_size();
        let rq_size = config.rq_size();
        Arc::new_cyclic(|weak| Self {
            socket,
            env,
            config,
            sq_size,
            rq_size,
            window: AtomicU32::new(sq_size),
            new_rq_wrs: AtomicU32::new(0),
            hs: UnsafeCell::new(HandshakeState {
                status: Status::Uninitialized,
                hello_buf: BlockBuf::new(),
                nonce: [0; NONCE_LENGTH],
                remote_sid: 0,
                local_window_capacity: sq_size,
                remote_window_capacity: rq_size,
            }),
            send: UnsafeCell::new(SendState {
                sq_current: 0,
                sq_unsignaled: 0,
                unsolicited: 0,
                accumulated_ack: 0,
            }),
            recv: UnsafeCell::new(RecvState {
                sq_sent: 0,
                rq_received: 0,
                rbuf: Vec::new(),
                rbuf_data: Vec::new(),
            }),
            sbuf: UnsafeCell::new(Vec::new()),
            res: UnsafeCell::new(Resources {
                cm: None,
                cq: None,
                qp: None,
                pipefd: [-1, -1],
                completions: None,
            }),
            weak: weak.clone(),
        })
    }

    /// Nominal send queue depth.
    #[inline]
    pub fn sq_size(&self) -> u32 {
        self.sq_size
    }

    /// Nominal receive queue depth.
    #[inline]
    pub fn rq_size(&self) -> u32 {
        self.rq_size
    }

    /// Current handshake state.
    #[inline]
    pub fn status(&self) -> Status {
        self.hs().status
    }

    /// Credits currently available to the send path.
    #[inline]
    pub fn window(&self) -> u32 {
        self.window.load(Ordering::Relaxed)
    }

    /// Whether a send would currently be admitted.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.window.load(Ordering::Relaxed) > 0
    }

    /// Receive credits accumulated since the last outbound shipment.
    #[inline]
    pub fn new_rq_wrs(&self) -> u32 {
        self.new_rq_wrs.load(Ordering::Relaxed)
    }

    /// Maximum outstanding unacked sends the peer permits.
    #[inline]
    pub fn local_window_capacity(&self) -> u32 {
        self.hs().local_window_capacity
    }

    /// The peer's window capacity as negotiated at handshake.
    #[inline]
    pub fn remote_window_capacity(&self) -> u32 {
        self.hs().remote_window_capacity
    }

    // Interior-state accessors. Callers must hold the path ownership
    // documented on the Sync impl above.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn hs(&self) -> &mut HandshakeState {
        unsafe { &mut *self.hs.get() }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn send_state(&self) -> &mut SendState {
        unsafe { &mut *self.send.get() }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn recv_state(&self) -> &mut RecvState {
        unsafe { &mut *self.recv.get() }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn resources(&self) -> &mut Resources {
        unsafe { &mut *self.res.get() }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn sbuf_slot(&self, idx: u32) -> &mut BlockBuf {
        let ring = unsafe { &*self.sbuf.get() };
        unsafe { &mut *ring[idx as usize].get() }
    }

    pub(crate) fn socket(&self) -> &dyn ByteSocket {
        self.socket.as_ref()
    }

    pub(crate) fn env(&self) -> &dyn RdmaEnv {
        self.env.as_ref()
    }

    pub(crate) fn cfg(&self) -> &Config {
        &self.config
    }

    pub(crate) fn window_store(&self, credits: u32) {
        self.window.store(credits, Ordering::Relaxed);
    }

    pub(crate) fn cm(&self) -> Result<&dyn ConnManager> {
        self.resources()
            .cm
            .as_deref()
            .ok_or_else(|| Error::Io(io::Error::other("connection manager not bound")))
    }

    pub(crate) fn qp(&self) -> Result<&dyn QueuePair> {
        self.resources()
            .qp
            .as_deref()
            .ok_or_else(|| Error::Io(io::Error::other("queue pair not created")))
    }

    /// Open the wakeup pipe the listener uses to hand the accept event to
    /// the server handshake.
    pub(crate) fn init_pipe(&self) -> Result<()> {
        let res = self.resources();
        debug_assert!(res.pipefd[0] < 0 && res.pipefd[1] < 0);
        let mut fds = [-1 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        res.pipefd = fds;
        Ok(())
    }

    /// Allocate the queue pair, the CQ binding, and both rings, then
    /// pre-post every receive slot.
    pub(crate) fn allocate_resources(&self) -> Result<()> {
        // The CQ capacity is hard to estimate; twice the sum of both queue
        // depths works empirically.
        let cq = self
            .env
            .get_cq(self.socket.id(), 2 * (self.sq_size + self.rq_size))
            .map_err(Error::Io)?;
        let completions = if cq.is_shared() && self.config.completion_in_thread {
            Some(self.start_completion_task()?)
        } else {
            None
        };
        let qp = self.cm()?.create_qp(
            self.sq_size + RESERVED_WR_NUM,
            self.rq_size + RESERVED_WR_NUM,
            cq.as_ref(),
            self.socket.id(),
        )?;
        {
            let res = self.resources();
            res.cq = Some(cq);
            res.qp = Some(qp);
            res.completions = completions;
        }
        {
            let ring = unsafe { &mut *self.sbuf.get() };
            ring.clear();
            ring.resize_with(self.sq_size as usize, || UnsafeCell::new(BlockBuf::new()));
        }
        let depth = (self.rq_size + RESERVED_WR_NUM) as usize;
        {
            let rs = self.recv_state();
            rs.rbuf.clear();
            rs.rbuf.resize_with(depth, BlockBuf::new);
            rs.rbuf_data.clear();
            rs.rbuf_data.resize(depth, 0);
        }
        self.post_recv(depth as u32)
    }

    /// Spawn the single consumer that serializes shared-CQ completions for
    /// this endpoint.
    fn start_completion_task(&self) -> Result<mpsc::Sender<Completion>> {
        let (tx, rx) = mpsc::channel::<Completion>();
        let endpoint = self.weak.clone();
        thread::Builder::new()
            .name("rdma-completion".into())
            .spawn(move || {
                while let Ok(completion) = rx.recv() {
                    let Some(ep) = endpoint.upgrade() else { break };
                    if ep.socket.failed() {
                        continue;
                    }
                    if let Err(e) = ep.handle_completion(completion) {
                        warn!("Fail to handle RDMA completion: {}", e);
                        ep.socket.set_failed(&e.to_string());
                    }
                }
            })
            .map_err(Error::Io)?;
        Ok(tx)
    }

    /// Release every resource exactly once. Safe to call in any state.
    pub(crate) fn deallocate_resources(&self) {
        let res = self.resources();
        // Dropping the sender ends the consumer task; it is not joined, the
        // task exits on its own once the channel drains.
        res.completions = None;
        unsafe { &mut *self.sbuf.get() }.clear();
        {
            let rs = self.recv_state();
            rs.rbuf.clear();
            rs.rbuf_data.clear();
        }
        res.cm = None;
        if let Some(cq) = res.cq.take() {
            cq.release();
        }
        res.qp = None;
    }

    /// Tear down resources and rewind all counters to their construction
    /// values. Idempotent; used both at destruction and to prepare reuse.
    pub fn reset(&self) {
        {
            let res = self.resources();
            for fd in res.pipefd.iter_mut() {
                if *fd >= 0 {
                    unsafe { libc::close(*fd) };
                    *fd = -1;
                }
            }
        }
        self.deallocate_resources();
        {
            let hs = self.hs();
            hs.status = Status::Uninitialized;
            hs.hello_buf.clear();
            hs.remote_sid = 0;
            hs.local_window_capacity = self.sq_size;
            hs.remote_window_capacity = self.rq_size;
        }
        {
            let ss = self.send_state();
            ss.sq_current = 0;
            ss.sq_unsignaled = 0;
            ss.unsolicited = 0;
            ss.accumulated_ack = 0;
        }
        {
            let rs = self.recv_state();
            rs.sq_sent = 0;
            rs.rq_received = 0;
        }
        self.window.store(self.sq_size, Ordering::Relaxed);
        self.new_rq_wrs.store(0, Ordering::Relaxed);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.reset();
    }
}
