//! The out-of-band handshake that binds a queue pair to the byte socket.
//!
//! RDMA connections are negotiated by their own connection manager, not by
//! TCP. The socket still establishes a TCP connection first, so ordinary
//! tooling keeps seeing the service, and the upgrade then runs over that
//! socket:
//!
//! 1. The client writes a hello: the magic string and a random nonce.
//! 2. The server keeps the nonce and answers with its socket identifier.
//! 3. The client starts the RDMA connection, carrying the identifier and
//!    the nonce as private data.
//! 4. The listener matches the identifier to a socket and accepts only if
//!    the nonce equals the one kept at step 2; otherwise the request is
//!    ignored.
//!
//! A forged connect request cannot match the nonce, since it was only ever
//! delivered over the byte socket. This is not a cryptographic
//! authenticator; it assumes a trusted cluster.

use std::io;

use log::warn;
use rand::RngCore;

use crate::buf::BlockBuf;
use crate::cm::{CmEvent, CmProgress, ConnManager};
use crate::endpoint::{Endpoint, HandshakeProgress, Status};
use crate::error::{Error, Result};
use crate::socket::{RdmaState, SocketTable};
use crate::wire::{
    ConnectRequest, ConnectResponse, Hello, CONNECT_RESPONSE_LENGTH, HELLO_LENGTH, SID_LENGTH,
};

impl Endpoint {
    /// Client side: begin the upgrade by writing the hello over the byte
    /// socket.
    pub fn start_handshake(&self) -> Result<()> {
        let hs = self.hs();
        debug_assert_eq!(hs.status, Status::Uninitialized);

        // RDMA needs PFC and ECN configured in the switches, so it is only
        // enabled inside a cluster. A peer outside the cluster prefix stays
        // on plain TCP.
        if !self.env().in_rdma_cluster(self.socket().remote_side().ip()) {
            warn!("Destination is not in the RDMA cluster");
            self.socket().set_rdma_state(RdmaState::Off);
            return Ok(());
        }

        hs.status = Status::HelloC;
        rand::thread_rng().fill_bytes(&mut hs.nonce);
        let hello = Hello { nonce: hs.nonce };
        self.write_fully(&hello.to_bytes())
    }

    /// Drive the upgrade forward by one tick. Inputs are polled in order:
    /// bytes on the socket, then the CM event queue, then the listener
    /// wakeup pipe.
    pub fn handshake(&self) -> Result<HandshakeProgress> {
        let expected = if self.socket().created_by_connect() {
            SID_LENGTH
        } else {
            HELLO_LENGTH
        };
        let mut read_len = 0usize;
        {
            let hs = self.hs();
            if hs.hello_buf.len() < expected {
                // One read per tick, capped at the bytes still missing so
                // no application byte is consumed. A partial message is
                // finished when the dispatcher fires again.
                let want = expected - hs.hello_buf.len();
                let mut tmp = [0u8; HELLO_LENGTH];
                match self.socket().try_read(&mut tmp[..want]) {
                    Ok(0) => return Ok(HandshakeProgress::Closed),
                    Ok(n) => {
                        hs.hello_buf.append_bytes(&tmp[..n]);
                        read_len = n;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(Error::Io(e)),
                }
            }
        }

        let mut event = CmEvent::None;
        if read_len == 0 {
            if let Some(cm) = self.resources().cm.as_deref() {
                event = cm.poll_event();
            }
            if event == CmEvent::None {
                if !self.read_pipe_byte()? {
                    return Ok(HandshakeProgress::Again);
                }
                event = CmEvent::Accept;
            }
        }

        if event == CmEvent::Other || event == CmEvent::Error {
            return Err(Error::Cm(event));
        }

        if self.socket().created_by_connect() {
            self.handshake_at_client(event)
        } else {
            self.handshake_at_server(event)
        }
    }

    /// Drive the FSM from a CM event once a CM is bound. Used by the
    /// dispatcher when the rdmacm fd turns readable.
    pub fn complete_handshake(&self) -> Result<HandshakeProgress> {
        let event = self.cm()?.poll_event();
        match event {
            CmEvent::Established | CmEvent::Disconnect => {
                if self.socket().created_by_connect() {
                    self.handshake_at_client(event)
                } else {
                    self.handshake_at_server(event)
                }
            }
            CmEvent::None => Ok(HandshakeProgress::Again),
            _ => Err(Error::Cm(event)),
        }
    }

    fn handshake_at_client(&self, event: CmEvent) -> Result<HandshakeProgress> {
        let hs = self.hs();
        let mut direct_pass = false;

        if hs.status == Status::Uninitialized {
            // The dispatcher fired before start_handshake finished; the
            // next tick observes HelloC.
            return Ok(HandshakeProgress::Again);
        }

        if hs.status == Status::HelloC {
            if event != CmEvent::None {
                return Err(self.protocol_error(event));
            }
            if hs.hello_buf.len() < SID_LENGTH {
                return Ok(HandshakeProgress::Again);
            }
            let mut tmp = [0u8; SID_LENGTH];
            hs.hello_buf.copy_to(&mut tmp);
            hs.hello_buf.clear();
            hs.remote_sid = u64::from_be_bytes(tmp);
            if hs.remote_sid == 0 {
                // The server declined RDMA; the connection stays plain TCP.
                self.socket().set_rdma_state(RdmaState::Off);
                self.socket().wake_as_epoll_out();
                return Ok(HandshakeProgress::Again);
            }

            let cm = self.env().create_cm()?;
            if let Err(e) = self.env().add_consumer(self.socket().id(), cm.fd()) {
                warn!("Fail to add rdmacm fd into event dispatcher");
                return Err(Error::Io(e));
            }
            hs.status = Status::AddrResolving;
            let progress = cm.resolve_addr(self.socket().remote_side())?;
            self.resources().cm = Some(cm);
            match progress {
                CmProgress::Pending => return Ok(HandshakeProgress::Again),
                CmProgress::Done => direct_pass = true,
            }
        }

        if hs.status == Status::AddrResolving {
            if !direct_pass && event != CmEvent::AddrResolved {
                return Err(self.protocol_error(event));
            }
            hs.status = Status::RouteResolving;
            match self.cm()?.resolve_route()? {
                CmProgress::Pending => return Ok(HandshakeProgress::Again),
                CmProgress::Done => direct_pass = true,
            }
        }

        if hs.status == Status::RouteResolving {
            if !direct_pass && event != CmEvent::RouteResolved {
                return Err(self.protocol_error(event));
            }
            if let Err(e) = self.allocate_resources() {
                warn!("Fail to allocate resources for RDMA: {}", e);
                return Err(e);
            }
            let req = ConnectRequest {
                sid: hs.remote_sid,
                nonce: hs.nonce,
                rq_size: self.rq_size(),
                sq_size: self.sq_size(),
            };
            hs.status = Status::Connecting;
            match self.cm()?.connect(&req.to_bytes())? {
                CmProgress::Pending => return Ok(HandshakeProgress::Again),
                CmProgress::Done => direct_pass = true,
            }
        }

        if hs.status == Status::Connecting {
            if !direct_pass && event != CmEvent::Established {
                return Err(self.protocol_error(event));
            }
            let data = self.cm()?.conn_data().ok_or(Error::Truncated {
                required: CONNECT_RESPONSE_LENGTH,
                available: 0,
            })?;
            let res = ConnectResponse::from_bytes(&data)?;
            if res.rq_size < self.sq_size() {
                hs.local_window_capacity = res.rq_size;
                self.window_store(res.rq_size);
            }
            if res.sq_size < self.rq_size() {
                hs.remote_window_capacity = res.sq_size;
            }
            hs.status = Status::Established;
            self.socket().set_rdma_state(RdmaState::On);
            self.socket().wake_as_epoll_out();
            return Ok(HandshakeProgress::Again);
        }

        if hs.status == Status::Established {
            if event != CmEvent::Disconnect {
                return Err(self.protocol_error(event));
            }
            return Ok(HandshakeProgress::Closed);
        }

        warn!("Incorrect RDMA handshake protocol");
        Err(self.protocol_error(event))
    }

    fn handshake_at_server(&self, event: CmEvent) -> Result<HandshakeProgress> {
        let hs = self.hs();
        let mut direct_pass = false;

        if hs.status == Status::Uninitialized {
            if event != CmEvent::None {
                return Err(self.protocol_error(event));
            }
            if hs.hello_buf.len() < HELLO_LENGTH {
                return Ok(HandshakeProgress::Again);
            }
            let mut tmp = [0u8; HELLO_LENGTH];
            hs.hello_buf.copy_to(&mut tmp);
            match Hello::from_bytes(&tmp) {
                Ok(hello) => hs.nonce = hello.nonce,
                Err(Error::InvalidMagic { .. }) => {
                    // Not an upgrade attempt; hand the bytes to plain TCP.
                    let mut staged = BlockBuf::new();
                    staged.append_buf(&mut hs.hello_buf);
                    self.socket().append_read_buf(staged);
                    self.socket().set_rdma_state(RdmaState::Off);
                    return Ok(HandshakeProgress::Bytes(self.socket().read_buf_len()));
                }
                Err(e) => return Err(e),
            }

            self.init_pipe()?;
            hs.hello_buf.clear();
            hs.status = Status::HelloS;
            self.write_fully(&self.socket().id().to_be_bytes())?;
            return Ok(HandshakeProgress::Again);
        }

        if hs.status == Status::HelloS {
            if event != CmEvent::Accept {
                return Err(self.protocol_error(event));
            }
            if let Err(e) = self.allocate_resources() {
                warn!("Fail to allocate resources for RDMA: {}", e);
                return Err(e);
            }
            let cm_fd = self.cm()?.fd();
            if let Err(e) = self.env().add_consumer(self.socket().id(), cm_fd) {
                warn!("Fail to add rdmacm fd into event dispatcher");
                return Err(Error::Io(e));
            }
            let res = ConnectResponse {
                rq_size: self.rq_size(),
                sq_size: self.sq_size(),
            };
            hs.status = Status::Accepting;
            match self.cm()?.accept(&res.to_bytes())? {
                CmProgress::Pending => return Ok(HandshakeProgress::Again),
                CmProgress::Done => direct_pass = true,
            }
        }

        if hs.status == Status::Accepting {
            if !direct_pass && event != CmEvent::Established {
                return Err(self.protocol_error(event));
            }
            hs.status = Status::Established;
            self.socket().set_rdma_state(RdmaState::On);
            return Ok(HandshakeProgress::Again);
        }

        if hs.status == Status::Established {
            if event != CmEvent::Disconnect {
                return Err(self.protocol_error(event));
            }
            return Ok(HandshakeProgress::Closed);
        }

        warn!("Incorrect RDMA handshake protocol");
        Err(self.protocol_error(event))
    }

    /// Listener side: match an incoming connect request to its endpoint,
    /// install the connection manager, and wake the server handshake.
    ///
    /// Rejections discard the request without failing the targeted socket;
    /// a forged or replayed request must not take a healthy connection
    /// down. Only a dispatcher registration failure fails the socket.
    pub fn initialize_from_accept(
        table: &dyn SocketTable,
        cm: Box<dyn ConnManager>,
        private_data: &[u8],
    ) -> Result<()> {
        let req = ConnectRequest::from_bytes(private_data)?;
        let ep = match table.find(req.sid) {
            Some(ep) => ep,
            None => {
                warn!("Invalid socket id for RDMA accept");
                return Err(Error::Rejected("unknown socket id"));
            }
        };

        let hs = ep.hs();
        if hs.nonce != req.nonce {
            warn!("Random string does not match");
            return Err(Error::Rejected("nonce mismatch"));
        }

        let res = ep.resources();
        if res.cm.is_some() {
            warn!("RDMA connection already exists");
            return Err(Error::Rejected("connection manager already bound"));
        }
        res.cm = Some(cm);

        if let Err(e) = ep.env().add_consumer(ep.socket().id(), res.pipefd[0]) {
            ep.socket()
                .set_failed("Fail to add pipe fd to event dispatcher");
            return Err(Error::Io(e));
        }

        if ep.sq_size() > req.rq_size {
            hs.local_window_capacity = req.rq_size;
            ep.window_store(req.rq_size);
        }
        if ep.rq_size() > req.sq_size {
            hs.remote_window_capacity = req.sq_size;
        }

        // Wake the server handshake.
        let fd = res.pipefd[1];
        loop {
            let tmp = 0u8; // content is irrelevant
            let n = unsafe { libc::write(fd, &tmp as *const u8 as *const libc::c_void, 1) };
            if n == 1 {
                break;
            }
            let err = io::Error::last_os_error();
            if n < 0 && err.kind() != io::ErrorKind::WouldBlock {
                return Err(Error::Io(err));
            }
        }
        Ok(())
    }

    fn read_pipe_byte(&self) -> Result<bool> {
        let fd = self.resources().pipefd[0];
        if fd < 0 {
            return Ok(false);
        }
        let mut tmp = 0u8;
        let n = unsafe { libc::read(fd, &mut tmp as *mut u8 as *mut libc::c_void, 1) };
        if n == 1 {
            return Ok(true);
        }
        if n == 0 {
            return Ok(false);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(false);
        }
        Err(Error::Io(err))
    }

    /// Write all of `data` to the socket. A few bytes at the head of a
    /// fresh connection; in practice a single call suffices.
    fn write_fully(&self, data: &[u8]) -> Result<()> {
        let mut off = 0;
        while off < data.len() {
            match self.socket().try_write(&data[off..]) {
                Ok(n) => off += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    warn!("Fail to write on fd={}", self.socket().fd());
                    return Err(Error::Io(e));
                }
            }
        }
        Ok(())
    }

    fn protocol_error(&self, event: CmEvent) -> Error {
        Error::Protocol {
            state: self.hs().status,
            event,
        }
    }
}
