//! Send engine, flow control, and completion handling.
//!
//! Every data send is a SEND_WITH_IMM whose immediate carries the receive
//! credits accumulated since the last outbound work request. Each send
//! costs one window credit; credits only return through the immediates of
//! received work requests, so the peer's receive queue can never be
//! overrun. When credits pile up with nothing to piggyback them on, a
//! zero-payload WRITE_WITH_IMM ships them back.

use std::sync::atomic::Ordering;

use log::warn;

use crate::buf::{BlockBuf, BLOCK_PAYLOAD};
use crate::endpoint::{Endpoint, RESERVED_WR_NUM};
use crate::error::{Error, Result};
use crate::socket::RdmaState;
use crate::verbs::{Completion, RecvWr, SendWr, Sge, WrFlags, WrOpcode};

/// Payloads at or below this many bytes are embedded in the work request.
pub const INLINE_THRESHOLD: usize = 64;

impl Endpoint {
    /// Cut bytes off the front of `bufs` into at most one send work
    /// request, retaining them in the in-flight ring until the peer acks
    /// the slot. Returns the number of bytes consumed, or
    /// [`Error::WindowFull`] when no credit is available; writers then wait
    /// for the completion path to wake them.
    pub fn cut_from_buf_list(&self, bufs: &mut [BlockBuf]) -> Result<usize> {
        if self.window.load(Ordering::Relaxed) == 0 {
            return Err(Error::WindowFull);
        }

        let slot = self.send_state().sq_current;
        let imm = self.new_rq_wrs.swap(0, Ordering::Relaxed);
        let nw = {
            let to = self.sbuf_slot(slot);
            debug_assert!(to.is_empty());
            self.do_cut(bufs, to, imm)?
        };

        let ss = self.send_state();
        ss.sq_current = (slot + 1) % self.sq_size;
        self.window.fetch_sub(1, Ordering::Relaxed);
        Ok(nw)
    }

    /// Build and post one work request from the heads of `bufs`, moving the
    /// consumed bytes into `to`.
    fn do_cut(&self, bufs: &mut [BlockBuf], to: &mut BlockBuf, imm: u32) -> Result<usize> {
        debug_assert!(!bufs.is_empty());

        let max_sge = self.env().max_sge();
        let mut sges: Vec<Sge> = Vec::with_capacity(max_sge);
        let mut total_len = 0usize;
        let mut lkey = 0u32;
        let mut current = 0usize;
        while sges.len() < max_sge && total_len < BLOCK_PAYLOAD {
            if bufs[current].is_empty() {
                current += 1;
                if current == bufs.len() {
                    break;
                }
                continue;
            }
            let remaining_sge = max_sge - sges.len();
            let len = bufs[current].cut_into_sge_list(
                self.env(),
                to,
                &mut sges,
                remaining_sge,
                BLOCK_PAYLOAD - total_len,
                &mut lkey,
            )?;
            if len == 0 {
                // The registration key changed between blocks, or a whole
                // block was left for the next work request
                break;
            }
            total_len += len;
        }

        // Bound the peer's CQ latency: wake its CPU when this request
        // finishes a message, and periodically even when it does not.
        let boundary = current > 0 || bufs.get(current).map_or(true, |b| b.is_empty());
        let ss = self.send_state();
        let hs = self.hs();
        let mut solicited = boundary;
        if !boundary {
            ss.unsolicited += 1;
            ss.accumulated_ack += imm;
            if ss.unsolicited > hs.local_window_capacity / 4 {
                // The receive side must get a chance to return acks
                solicited = true;
            } else if ss.accumulated_ack > hs.remote_window_capacity / 4 {
                // The receive side must get a chance to handle acks
                solicited = true;
            }
        }

        let mut flags = WrFlags::empty();
        if total_len <= INLINE_THRESHOLD {
            flags |= WrFlags::INLINE;
        }
        if solicited {
            flags |= WrFlags::SOLICITED;
            ss.unsolicited = 0;
            ss.accumulated_ack = 0;
        }

        // Bound the local CQ pressure while keeping a completion firing
        // regularly; see www.rdmamojo.com/2014/06/30/working-unsignaled-completions
        ss.sq_unsignaled += 1;
        if ss.sq_unsignaled >= hs.local_window_capacity / 4 {
            flags |= WrFlags::SIGNALED;
            ss.sq_unsignaled = 0;
        }

        let wr = SendWr {
            wr_id: self.socket().id(),
            opcode: WrOpcode::SendWithImm,
            imm,
            flags,
            sge_list: sges,
        };
        if let Err(e) = self.qp()?.post_send(&wr) {
            // The window accounting keeps the send queue from filling, so a
            // post failure is unrecoverable.
            warn!("Fail to post send work request");
            return Err(Error::PostFailed(e));
        }
        Ok(total_len)
    }

    /// Ship `imm` credits back without data. Skipped when `imm` is zero.
    pub(crate) fn send_imm(&self, imm: u32) -> Result<()> {
        if imm == 0 {
            return Ok(());
        }
        let wr = SendWr {
            wr_id: self.socket().id(),
            opcode: WrOpcode::WriteWithImm,
            imm,
            flags: WrFlags::SOLICITED | WrFlags::SIGNALED,
            sge_list: Vec::new(),
        };
        if let Err(e) = self.qp()?.post_send(&wr) {
            warn!("Fail to post pure ack");
            return Err(Error::PostFailed(e));
        }
        Ok(())
    }

    /// Dispatcher entry point: queue the completion to the consumer task
    /// when one is attached, otherwise handle it inline.
    pub fn on_completion(&self, completion: Completion) -> Result<usize> {
        if let Some(tx) = self.resources().completions.as_ref() {
            if tx.send(completion).is_ok() {
                return Ok(0);
            }
        }
        self.handle_completion(completion)
    }

    /// Consume one completion. Returns the number of bytes delivered
    /// upward (zero for everything but data receives).
    pub fn handle_completion(&self, completion: Completion) -> Result<usize> {
        // A data completion can overtake the server's ESTABLISHED event, so
        // the socket is on RDMA from the first completion onward.
        self.socket().set_rdma_state(RdmaState::On);

        match completion {
            // Slot recycling is driven by peer acks, not local completions.
            Completion::Send | Completion::Write => Ok(0),
            Completion::Recv { len, imm } => {
                debug_assert!(len > 0);
                {
                    let rs = self.recv_state();
                    let slot = rs.rq_received as usize;
                    if self.cfg().recv_zerocopy {
                        let mut piece = BlockBuf::new();
                        rs.rbuf[slot].cut_to(&mut piece, len as usize);
                        self.socket().append_read_buf(piece);
                    } else {
                        // Only the first len bytes of the block are valid
                        let data = unsafe {
                            std::slice::from_raw_parts(
                                rs.rbuf_data[slot] as usize as *const u8,
                                len as usize,
                            )
                        };
                        self.socket().append_read_buf(BlockBuf::from_bytes(data));
                    }
                }
                self.return_credits(imm);
                self.post_recv(1)?;
                let half = self.hs().remote_window_capacity / 2;
                if self.new_rq_wrs.fetch_add(1, Ordering::Relaxed) + 1 > half {
                    self.send_imm(self.new_rq_wrs.swap(0, Ordering::Relaxed))?;
                }
                Ok(len as usize)
            }
            Completion::RecvImm { imm } => {
                self.return_credits(imm);
                self.post_recv(1)?;
                Ok(0)
            }
            Completion::Error => Err(Error::FailedCompletion),
        }
    }

    /// Free acked in-flight slots and reopen the window.
    fn return_credits(&self, imm: u32) {
        if imm == 0 {
            return;
        }
        let rs = self.recv_state();
        for _ in 0..imm {
            let slot = self.sbuf_slot(rs.sq_sent);
            debug_assert!(!slot.is_empty());
            slot.clear();
            rs.sq_sent = (rs.sq_sent + 1) % self.sq_size;
        }
        if self.window.fetch_add(imm, Ordering::Relaxed) == 0 {
            self.socket().wake_as_epoll_out();
        }
    }

    /// Re-post `num` receive work requests starting at the next slot to
    /// recycle.
    pub(crate) fn post_recv(&self, num: u32) -> Result<()> {
        if num == 0 {
            return Ok(());
        }
        let depth = (self.rq_size + RESERVED_WR_NUM) as usize;
        let rs = self.recv_state();
        for _ in 0..num {
            let slot = rs.rq_received as usize;
            if self.cfg().recv_zerocopy || rs.rbuf[slot].is_empty() {
                rs.rbuf[slot].clear();
                let block = self.env().alloc_block().ok_or(Error::NoMemory)?;
                rs.rbuf_data[slot] = block.addr();
                rs.rbuf[slot].append_block(block);
            }
            let addr = rs.rbuf_data[slot];
            let wr = RecvWr {
                wr_id: self.socket().id(),
                sge: Sge {
                    addr,
                    length: BLOCK_PAYLOAD as u32,
                    lkey: self.env().lkey(addr),
                },
            };
            if let Err(e) = self.qp()?.post_recv(&wr) {
                rs.rbuf[slot].clear();
                warn!("Fail to post recv work request");
                return Err(Error::PostFailed(e));
            }
            rs.rq_received = (rs.rq_received + 1) % depth as u32;
        }
        Ok(())
    }
}
