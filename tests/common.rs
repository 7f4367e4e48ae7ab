//! Shared test fixtures: mock collaborators and handshake harnesses.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use rdmalink::{
    BlockBuf, BlockRef, ByteSocket, CmEvent, CmProgress, CompletionBinding, Config, ConnManager,
    ConnectRequest, ConnectResponse, Endpoint, HandshakeProgress, Hello, QueuePair, RdmaEnv,
    RdmaState, RecvWr, SendWr, SocketTable, Status, BLOCK_PAYLOAD,
};

/// Registration key shared by every block of the mock registered pool.
pub const POOL_LKEY: u32 = 100;

// =============================================================================
// Mock socket
// =============================================================================

pub struct TestSocket {
    id: u64,
    fd: RawFd,
    remote: SocketAddr,
    from_connect: bool,
    /// Bytes the peer has "sent" over TCP; drained by try_read.
    pub rx: Mutex<VecDeque<u8>>,
    /// Peer closed the connection.
    pub closed: AtomicBool,
    /// Bytes written toward the peer.
    pub tx: Mutex<Vec<u8>>,
    /// Bytes delivered upward through append_read_buf.
    pub read_buf: Mutex<Vec<u8>>,
    pub state: Mutex<RdmaState>,
    pub wakes: AtomicU32,
    pub failure: Mutex<Option<String>>,
}

impl TestSocket {
    fn new(id: u64, remote: &str, from_connect: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            fd: 3,
            remote: remote.parse().unwrap(),
            from_connect,
            rx: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            tx: Mutex::new(Vec::new()),
            read_buf: Mutex::new(Vec::new()),
            state: Mutex::new(RdmaState::Uninitialized),
            wakes: AtomicU32::new(0),
            failure: Mutex::new(None),
        })
    }

    pub fn client(id: u64) -> Arc<Self> {
        Self::new(id, "10.0.0.2:9000", true)
    }

    pub fn server(id: u64) -> Arc<Self> {
        Self::new(id, "10.0.0.3:9000", false)
    }

    pub fn push_rx(&self, bytes: &[u8]) {
        self.rx.lock().unwrap().extend(bytes.iter().copied());
    }

    pub fn rdma(&self) -> RdmaState {
        *self.state.lock().unwrap()
    }

    pub fn read_buf_bytes(&self) -> Vec<u8> {
        self.read_buf.lock().unwrap().clone()
    }

    pub fn tx_bytes(&self) -> Vec<u8> {
        self.tx.lock().unwrap().clone()
    }
}

impl ByteSocket for TestSocket {
    fn fd(&self) -> RawFd {
        self.fd
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn remote_side(&self) -> SocketAddr {
        self.remote
    }

    fn created_by_connect(&self) -> bool {
        self.from_connect
    }

    fn rdma_state(&self) -> RdmaState {
        *self.state.lock().unwrap()
    }

    fn set_rdma_state(&self, state: RdmaState) {
        *self.state.lock().unwrap() = state;
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock().unwrap();
        if rx.is_empty() {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(0);
            }
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = buf.len().min(rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = rx.pop_front().unwrap();
        }
        Ok(n)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        self.tx.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn append_read_buf(&self, data: BlockBuf) {
        let mut flat = vec![0u8; data.len()];
        data.copy_to(&mut flat);
        self.read_buf.lock().unwrap().extend_from_slice(&flat);
    }

    fn read_buf_len(&self) -> usize {
        self.read_buf.lock().unwrap().len()
    }

    fn wake_as_epoll_out(&self) {
        self.wakes.fetch_add(1, Ordering::SeqCst);
    }

    fn set_failed(&self, msg: &str) {
        *self.failure.lock().unwrap() = Some(msg.to_string());
    }

    fn failed(&self) -> bool {
        self.failure.lock().unwrap().is_some()
    }
}

// =============================================================================
// Mock queue pair
// =============================================================================

#[derive(Default)]
pub struct TestQp {
    pub sends: Mutex<Vec<SendWr>>,
    pub recvs: Mutex<Vec<RecvWr>>,
    pub fail_send: AtomicBool,
}

impl TestQp {
    pub fn sends(&self) -> Vec<SendWr> {
        self.sends.lock().unwrap().clone()
    }

    pub fn recvs(&self) -> Vec<RecvWr> {
        self.recvs.lock().unwrap().clone()
    }
}

struct QpHandle(Arc<TestQp>);

impl QueuePair for QpHandle {
    fn post_send(&self, wr: &SendWr) -> io::Result<()> {
        if self.0.fail_send.load(Ordering::SeqCst) {
            return Err(io::Error::other("device rejected the work request"));
        }
        self.0.sends.lock().unwrap().push(wr.clone());
        Ok(())
    }

    fn post_recv(&self, wr: &RecvWr) -> io::Result<()> {
        self.0.recvs.lock().unwrap().push(*wr);
        Ok(())
    }
}

// =============================================================================
// Mock connection manager
// =============================================================================

pub struct TestCm {
    pub events: Mutex<VecDeque<CmEvent>>,
    pub conn_data: Mutex<Option<Vec<u8>>>,
    pub connect_data: Mutex<Option<Vec<u8>>>,
    pub accept_data: Mutex<Option<Vec<u8>>>,
    pub resolve_addr_calls: AtomicU32,
    pub resolve_route_calls: AtomicU32,
    pub created_qp: Mutex<Option<(u32, u32, u64)>>,
    pub qp: Arc<TestQp>,
}

impl TestCm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(VecDeque::new()),
            conn_data: Mutex::new(None),
            connect_data: Mutex::new(None),
            accept_data: Mutex::new(None),
            resolve_addr_calls: AtomicU32::new(0),
            resolve_route_calls: AtomicU32::new(0),
            created_qp: Mutex::new(None),
            qp: Arc::new(TestQp::default()),
        })
    }

    pub fn boxed(cm: &Arc<TestCm>) -> Box<dyn ConnManager> {
        Box::new(CmHandle(cm.clone()))
    }

    pub fn push_event(&self, event: CmEvent) {
        self.events.lock().unwrap().push_back(event);
    }

    pub fn set_conn_data(&self, data: Vec<u8>) {
        *self.conn_data.lock().unwrap() = Some(data);
    }
}

struct CmHandle(Arc<TestCm>);

impl ConnManager for CmHandle {
    fn fd(&self) -> RawFd {
        77
    }

    fn resolve_addr(&self, _addr: SocketAddr) -> io::Result<CmProgress> {
        self.0.resolve_addr_calls.fetch_add(1, Ordering::SeqCst);
        Ok(CmProgress::Pending)
    }

    fn resolve_route(&self) -> io::Result<CmProgress> {
        self.0.resolve_route_calls.fetch_add(1, Ordering::SeqCst);
        Ok(CmProgress::Pending)
    }

    fn connect(&self, private_data: &[u8]) -> io::Result<CmProgress> {
        *self.0.connect_data.lock().unwrap() = Some(private_data.to_vec());
        Ok(CmProgress::Pending)
    }

    fn accept(&self, private_data: &[u8]) -> io::Result<CmProgress> {
        *self.0.accept_data.lock().unwrap() = Some(private_data.to_vec());
        Ok(CmProgress::Pending)
    }

    fn poll_event(&self) -> CmEvent {
        self.0.events.lock().unwrap().pop_front().unwrap_or(CmEvent::None)
    }

    fn conn_data(&self) -> Option<Vec<u8>> {
        self.0.conn_data.lock().unwrap().clone()
    }

    fn create_qp(
        &self,
        sq_depth: u32,
        rq_depth: u32,
        _cq: &dyn CompletionBinding,
        user_id: u64,
    ) -> io::Result<Box<dyn QueuePair>> {
        *self.0.created_qp.lock().unwrap() = Some((sq_depth, rq_depth, user_id));
        Ok(Box::new(QpHandle(self.0.qp.clone())))
    }
}

// =============================================================================
// Mock completion queue binding and environment
// =============================================================================

struct TestCq {
    shared: bool,
    released: Arc<AtomicU32>,
}

impl CompletionBinding for TestCq {
    fn is_shared(&self) -> bool {
        self.shared
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct TestEnv {
    staged_cm: Mutex<Option<Arc<TestCm>>>,
    /// Registered ranges: (base, size, lkey).
    ranges: Mutex<Vec<(u64, usize, u32)>>,
    /// Keeps registered blocks alive so addresses are never reused.
    pool: Mutex<Vec<BlockRef>>,
    next_lkey: AtomicU32,
    pub alloc_count: AtomicU32,
    pub alloc_fail: AtomicBool,
    pub max_sge: usize,
    pub cq_shared: AtomicBool,
    pub cq_released: Arc<AtomicU32>,
    pub consumers: Mutex<Vec<(u64, RawFd)>>,
    pub cluster: AtomicBool,
}

impl TestEnv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            staged_cm: Mutex::new(None),
            ranges: Mutex::new(Vec::new()),
            pool: Mutex::new(Vec::new()),
            next_lkey: AtomicU32::new(200),
            alloc_count: AtomicU32::new(0),
            alloc_fail: AtomicBool::new(false),
            max_sge: 6,
            cq_shared: AtomicBool::new(false),
            cq_released: Arc::new(AtomicU32::new(0)),
            consumers: Mutex::new(Vec::new()),
            cluster: AtomicBool::new(true),
        })
    }

    /// Hand this CM to the next create_cm call.
    pub fn stage_cm(&self, cm: &Arc<TestCm>) {
        *self.staged_cm.lock().unwrap() = Some(cm.clone());
    }

    /// Register a standalone block under its own fresh lkey.
    pub fn register_block(&self, capacity: usize) -> BlockRef {
        let lkey = self.next_lkey.fetch_add(1, Ordering::SeqCst);
        self.register_block_with_lkey(capacity, lkey)
    }

    fn register_block_with_lkey(&self, capacity: usize, lkey: u32) -> BlockRef {
        let block = BlockRef::alloc(capacity);
        self.ranges.lock().unwrap().push((block.addr(), capacity, lkey));
        self.pool.lock().unwrap().push(block.clone());
        block
    }
}

impl RdmaEnv for TestEnv {
    fn create_cm(&self) -> io::Result<Box<dyn ConnManager>> {
        match self.staged_cm.lock().unwrap().take() {
            Some(cm) => Ok(TestCm::boxed(&cm)),
            None => Err(io::Error::other("no connection manager staged")),
        }
    }

    fn get_cq(&self, _sid: u64, _capacity: u32) -> io::Result<Box<dyn CompletionBinding>> {
        Ok(Box::new(TestCq {
            shared: self.cq_shared.load(Ordering::SeqCst),
            released: self.cq_released.clone(),
        }))
    }

    fn lkey(&self, addr: u64) -> u32 {
        for (base, size, lkey) in self.ranges.lock().unwrap().iter() {
            if addr >= *base && addr < *base + *size as u64 {
                return *lkey;
            }
        }
        0
    }

    fn max_sge(&self) -> usize {
        self.max_sge
    }

    fn alloc_block(&self) -> Option<BlockRef> {
        if self.alloc_fail.load(Ordering::SeqCst) {
            return None;
        }
        self.alloc_count.fetch_add(1, Ordering::SeqCst);
        Some(self.register_block_with_lkey(BLOCK_PAYLOAD, POOL_LKEY))
    }

    fn add_consumer(&self, sid: u64, fd: RawFd) -> io::Result<()> {
        self.consumers.lock().unwrap().push((sid, fd));
        Ok(())
    }

    fn in_rdma_cluster(&self, _ip: IpAddr) -> bool {
        self.cluster.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Socket table
// =============================================================================

#[derive(Default)]
pub struct TestTable {
    pub map: Mutex<HashMap<u64, Arc<Endpoint>>>,
}

impl TestTable {
    pub fn insert(&self, sid: u64, ep: Arc<Endpoint>) {
        self.map.lock().unwrap().insert(sid, ep);
    }
}

impl SocketTable for TestTable {
    fn find(&self, sid: u64) -> Option<Arc<Endpoint>> {
        self.map.lock().unwrap().get(&sid).cloned()
    }
}

// =============================================================================
// Harnesses
// =============================================================================

pub struct Harness {
    pub ep: Arc<Endpoint>,
    pub socket: Arc<TestSocket>,
    pub env: Arc<TestEnv>,
    pub cm: Arc<TestCm>,
}

/// Write `data` into a posted block by raw address.
pub fn write_block(addr: u64, data: &[u8]) {
    unsafe {
        std::ptr::copy_nonoverlapping(data.as_ptr(), addr as usize as *mut u8, data.len());
    }
}

/// A client endpoint with a staged CM, before any handshake step.
pub fn client_endpoint(config: Config) -> Harness {
    let env = TestEnv::new();
    let cm = TestCm::new();
    env.stage_cm(&cm);
    let socket = TestSocket::client(9);
    let ep = Endpoint::new(socket.clone(), env.clone(), config);
    Harness { ep, socket, env, cm }
}

/// Walk a client endpoint all the way to Established against a peer that
/// advertised the given queue depths.
pub fn establish_client(config: Config, peer_rq: u32, peer_sq: u32) -> Harness {
    let h = client_endpoint(config);
    h.ep.start_handshake().unwrap();

    // Server answers with its socket identifier.
    h.socket.push_rx(&5u64.to_be_bytes());
    assert_eq!(h.ep.handshake().unwrap(), HandshakeProgress::Again);
    assert_eq!(h.ep.status(), Status::AddrResolving);

    h.cm.push_event(CmEvent::AddrResolved);
    assert_eq!(h.ep.handshake().unwrap(), HandshakeProgress::Again);
    assert_eq!(h.ep.status(), Status::RouteResolving);

    h.cm.push_event(CmEvent::RouteResolved);
    assert_eq!(h.ep.handshake().unwrap(), HandshakeProgress::Again);
    assert_eq!(h.ep.status(), Status::Connecting);

    h.cm.set_conn_data(
        ConnectResponse { rq_size: peer_rq, sq_size: peer_sq }
            .to_bytes()
            .to_vec(),
    );
    h.cm.push_event(CmEvent::Established);
    assert_eq!(h.ep.handshake().unwrap(), HandshakeProgress::Again);
    assert_eq!(h.ep.status(), Status::Established);
    h
}

/// A server endpoint that has processed the hello and now waits in HelloS.
pub fn server_after_hello(config: Config, sid: u64, nonce: [u8; 16]) -> Harness {
    let env = TestEnv::new();
    let cm = TestCm::new();
    let socket = TestSocket::server(sid);
    let ep = Endpoint::new(socket.clone(), env.clone(), config);

    socket.push_rx(&Hello { nonce }.to_bytes());
    assert_eq!(ep.handshake().unwrap(), HandshakeProgress::Again);
    assert_eq!(ep.status(), Status::HelloS);
    Harness { ep, socket, env, cm }
}

/// Walk a server endpoint all the way to Established from the given client
/// connect request.
pub fn establish_server(config: Config, req: &ConnectRequest) -> Harness {
    let h = server_after_hello(config, req.sid, req.nonce);

    let table = TestTable::default();
    table.insert(req.sid, h.ep.clone());
    Endpoint::initialize_from_accept(&table, TestCm::boxed(&h.cm), &req.to_bytes()).unwrap();

    // The pipe byte from the listener advances the FSM to the accept.
    assert_eq!(h.ep.handshake().unwrap(), HandshakeProgress::Again);
    assert_eq!(h.ep.status(), Status::Accepting);

    h.cm.push_event(CmEvent::Established);
    assert_eq!(h.ep.handshake().unwrap(), HandshakeProgress::Again);
    assert_eq!(h.ep.status(), Status::Established);
    h
}

/// A config whose rings floor at exactly 16 slots each.
pub fn small_config() -> Config {
    Config::new()
        .with_send_buf_size(BLOCK_PAYLOAD * 15)
        .with_recv_buf_size(BLOCK_PAYLOAD * 15)
}
