//! Reliable Multi-Packet Protocol.
//!
//! Segmentation and windowing for payloads larger than one MAD. Sender and
//! receiver flows follow the InfiniBand RMPP flow diagrams. Every flow runs under the
//! message mutex and returns [`Effects`]: frames to send and whether to
//! terminate, applied by the caller once the mutex is dropped.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::client::{Client, ClientStats};
use crate::error::TransStatus;
use crate::mad::{
    self, rmpp_status, MadHdr, RmppHdr, RmppType, MAD_HDR_SIZE, MAD_SIZE, RMPP_VERSION,
};
use crate::msg::{Message, MsgBufs, MsgFlags, MsgState, TimerKind};
use crate::port::PortInner;
use crate::terminate::Notification;
use crate::timeouts::{trans_timeout_us, TimeoutFn};
use crate::transport::OutboundMad;

/// Packets added to a receive buffer of unknown size at a time.
const BUF_PKTS: usize = 10;

/// Packet count assumed for a receive of unknown size.
const DYN_NUM_PKTS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RmppState {
    #[default]
    Idle,
    SenderActive,
    /// Last segment acknowledged; waiting for the response to flow back.
    SenderSwitch,
    ReceiverActive,
    /// Last segment received; absorbing duplicates.
    ReceiverTerminate,
    Abort,
    Done,
}

/// Per-message RMPP bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct RmppCtx {
    pub state: RmppState,
    /// Window first.
    pub wf: u32,
    /// Window last.
    pub wl: u32,
    /// Next segment to send.
    pub ns: u32,
    /// Expected segment.
    pub es: u32,
    pub num_pkts: u32,
    /// Class data bytes of the whole transfer.
    pub pyld_len: usize,
    pub pkt_data_sz: usize,
    pub last_pkt_sz: usize,
    /// Receive assembly offset.
    pub data_offset: usize,
    /// Receiving without a known payload length.
    pub dyn_pyld: bool,
    /// The transfer continues in the other direction once this side is done.
    pub is_ds: bool,
    /// Header for ACK/STOP/ABORT frames.
    pub ctl_hdr: MadHdr,
}

impl RmppCtx {
    /// Lay out `buf_sz` bytes of class data for sending.
    pub fn start_sender(&mut self, ctl_hdr: MadHdr, buf_sz: usize, is_ds: bool) {
        let cl_data_sz = mad::class_data_capacity(ctl_hdr.mgmt_class);
        let resid = buf_sz % cl_data_sz;
        let num_pkts = if resid != 0 {
            buf_sz / cl_data_sz + 1
        } else {
            (buf_sz / cl_data_sz).max(1)
        };
        *self = RmppCtx {
            state: RmppState::SenderActive,
            wf: 1,
            wl: 1,
            ns: 1,
            es: 0,
            num_pkts: num_pkts as u32,
            pyld_len: buf_sz,
            pkt_data_sz: buf_sz.min(cl_data_sz),
            last_pkt_sz: if resid == 0 {
                if buf_sz == 0 {
                    0
                } else {
                    cl_data_sz
                }
            } else {
                resid
            },
            data_offset: 0,
            dyn_pyld: false,
            is_ds,
            ctl_hdr,
        };
    }

    /// Prepare to receive a transfer whose control frames use `ctl_hdr`.
    pub fn start_receiver(&mut self, ctl_hdr: MadHdr, is_ds: bool) {
        *self = RmppCtx {
            state: RmppState::ReceiverActive,
            wf: 1,
            wl: 1,
            es: 1,
            is_ds,
            ctl_hdr,
            ..Default::default()
        };
    }
}

/// Work left for the caller after a flow ran under the message mutex.
#[derive(Default)]
pub(crate) struct Effects {
    pub frames: Vec<OutboundMad>,
    /// A failed send of these frames is recorded as SEND_DONE.
    pub critical: bool,
    /// The transaction reached DONE here; terminate it.
    pub terminate: bool,
    /// Leave a termination context behind to absorb duplicate segments.
    pub termination: Option<RmppCtx>,
}

/// Build an ACK, STOP or ABORT frame.
pub(crate) fn ctrl_frame(st: &MsgState, ty: RmppType, status: u8, segnum: u32, nwl: u32) -> OutboundMad {
    let mut hdr = st.rmpp.ctl_hdr;
    hdr.status = 0;
    let rmpp = RmppHdr::new(ty, 0, status, segnum, nwl);
    OutboundMad {
        bytes: mad::build_mad(&hdr, Some(&rmpp), &[], &[]),
        addr: st.addr,
        global: st.global,
    }
}

/// Build DATA segment `segnum` of the send buffer.
pub(crate) fn data_frame(st: &MsgState, segnum: u32) -> OutboundMad {
    let ctx = &st.rmpp;
    let (cl_hdr_sz, _) = mad::class_hdr_sz_off(st.send.hdr.mgmt_class);
    let pyldlen = if segnum == 1 {
        ctx.pyld_len + ctx.num_pkts as usize * cl_hdr_sz
    } else if segnum == ctx.num_pkts {
        ctx.last_pkt_sz + cl_hdr_sz
    } else {
        ctx.pkt_data_sz
    };
    let mut flags = 0;
    if segnum == 1 {
        flags |= mad::rmpp_flags::FIRST;
    }
    if segnum == ctx.num_pkts {
        flags |= mad::rmpp_flags::LAST;
    }
    let rmpp = RmppHdr::new(RmppType::Data, flags, rmpp_status::NORMAL, segnum, pyldlen as u32);
    let start = ((segnum as usize - 1) * ctx.pkt_data_sz).min(st.send.data.len());
    let end = (start + ctx.pkt_data_sz).min(st.send.data.len());
    OutboundMad {
        bytes: mad::build_mad(&st.send.hdr, Some(&rmpp), &st.send.cl_hdr, &st.send.data[start..end]),
        addr: st.addr,
        global: st.global,
    }
}

impl PortInner {
    /// Frames for segments `ns..=wl`; advances `ns`.
    pub(crate) fn rmpp_window_frames(&self, st: &mut MsgState) -> Vec<OutboundMad> {
        let mut frames = Vec::new();
        while st.rmpp.ns <= st.rmpp.wl {
            frames.push(data_frame(st, st.rmpp.ns));
            st.rmpp.ns += 1;
            st.rmpp.data_offset = ((st.rmpp.ns - 1) as usize * st.rmpp.pkt_data_sz).min(st.rmpp.pyld_len);
        }
        frames
    }

    fn rmpp_send_window(&self, msg: &Arc<Message>, st: &mut MsgState, fx: &mut Effects) {
        fx.frames.extend(self.rmpp_window_frames(st));
        self.set_timer(msg, st, TimerKind::Resp, TimeoutFn::Send);
    }

    fn rmpp_ack(&self, st: &MsgState, fx: &mut Effects) {
        let es = st.rmpp.es;
        fx.frames.push(ctrl_frame(
            st,
            RmppType::Ack,
            rmpp_status::NORMAL,
            es - 1,
            es - 1 + self.config.rmpp_window,
        ));
    }

    /// Send an ABORT with `status` (unless `status` is `None`), stop the
    /// transaction timer and let the response timer finish the transaction
    /// with a failure.
    fn rmpp_abort(
        &self,
        client: &Arc<Client>,
        msg: &Arc<Message>,
        st: &mut MsgState,
        status: Option<u8>,
        fx: &mut Effects,
    ) {
        if let Some(status) = status {
            debug!(tid = st.tid, status, "aborting RMPP transfer");
            fx.frames.push(ctrl_frame(st, RmppType::Abort, status, 0, 0));
            fx.critical = true;
            ClientStats::bump(&client.stats.rmpp_errors);
        } else {
            debug!(tid = st.tid, "RMPP transfer stopped by peer");
            st.flags.insert(MsgFlags::SEND_DONE);
        }
        st.rmpp.state = RmppState::Abort;
        self.unset_timer(st, TimerKind::Trans);
        self.set_timer(msg, st, TimerKind::Resp, TimeoutFn::ErrTerminate);
    }

    /// Dispatch one inbound RMPP-active datagram for `msg`.
    pub(crate) fn handle_rmpp(
        &self,
        client: &Arc<Client>,
        msg: &Arc<Message>,
        st: &mut MsgState,
        raw: &[u8],
        rh: &RmppHdr,
    ) -> Effects {
        let mut fx = Effects::default();
        let involved = st.flags.intersects(MsgFlags::SEND_RMPP | MsgFlags::RECV_RMPP)
            || st.flags.contains(MsgFlags::TERMINATION);

        let bad = if rh.version != RMPP_VERSION {
            Some(rmpp_status::UNV)
        } else if !rh.has_valid_status() {
            Some(rmpp_status::IS)
        } else {
            None
        };
        if let Some(status) = bad {
            if !involved {
                trace!(tid = st.tid, status, "dropping bad RMPP header");
                if st.flags.contains(MsgFlags::SEND_DONE) {
                    self.set_timer(msg, st, TimerKind::Resp, TimeoutFn::Send);
                }
                return fx;
            }
            self.rmpp_abort(client, msg, st, Some(status), &mut fx);
            return fx;
        }

        let state = st.rmpp.state;
        match state {
            RmppState::SenderActive => self.sender_active_flow(client, msg, st, rh, &mut fx),
            RmppState::SenderSwitch => self.sender_switch_flow(client, msg, st, raw, rh, &mut fx),
            RmppState::ReceiverActive => self.recvr_active_flow(client, msg, st, raw, rh, &mut fx),
            RmppState::ReceiverTerminate => self.recvr_term_flow(client, msg, st, rh, &mut fx),
            RmppState::Abort => {
                self.set_timer(msg, st, TimerKind::Resp, TimeoutFn::ErrTerminate);
            }
            RmppState::Idle | RmppState::Done => {
                trace!(tid = st.tid, "RMPP datagram outside a transfer");
                if !involved && st.flags.contains(MsgFlags::SEND_DONE) {
                    self.set_timer(msg, st, TimerKind::Resp, TimeoutFn::Send);
                }
            }
        }
        fx
    }

    fn sender_active_flow(
        &self,
        client: &Arc<Client>,
        msg: &Arc<Message>,
        st: &mut MsgState,
        rh: &RmppHdr,
        fx: &mut Effects,
    ) {
        match rh.frame_type() {
            Some(RmppType::Data) => {
                // The receiver is confused; resend what is outstanding.
                self.rmpp_send_window(msg, st, fx);
                return;
            }
            Some(RmppType::Ack) => {}
            Some(RmppType::Stop) | Some(RmppType::Abort) => {
                self.rmpp_abort(client, msg, st, None, fx);
                return;
            }
            None => {
                self.rmpp_abort(client, msg, st, Some(rmpp_status::BADT), fx);
                return;
            }
        }

        let segnum = rh.segnum;
        let nwl = rh.pyldlen_nwl;
        if segnum > st.rmpp.wl {
            self.rmpp_abort(client, msg, st, Some(rmpp_status::S2B), fx);
            return;
        }
        if segnum < st.rmpp.wf {
            // Old ACK.
            self.rmpp_send_window(msg, st, fx);
            return;
        }
        if nwl < st.rmpp.wl {
            self.rmpp_abort(client, msg, st, Some(rmpp_status::W2S), fx);
            return;
        }

        if segnum == st.rmpp.num_pkts {
            if st.rmpp.is_ds {
                trace!(tid = st.tid, "RMPP sender switching to receive");
                st.rmpp.is_ds = false;
                st.rmpp.state = RmppState::SenderSwitch;
                st.rmpp.wf = 1;
                st.rmpp.wl = 1;
                st.rmpp.es = 1;
                st.retries_done = 0;
                fx.frames.push(ctrl_frame(st, RmppType::Ack, rmpp_status::NORMAL, 0, 1));
                self.set_timer(msg, st, TimerKind::Resp, TimeoutFn::Send);
                return;
            }
            trace!(tid = st.tid, "RMPP send complete");
            st.rmpp.state = RmppState::Done;
            fx.terminate = self.mark_done(st, TransStatus::Success);
            return;
        }

        st.rmpp.wf = segnum + 1;
        st.rmpp.ns = segnum + 1;
        st.rmpp.wl = st.rmpp.num_pkts.min(nwl);
        st.retries_done = 0;
        self.rmpp_send_window(msg, st, fx);
    }

    fn sender_switch_flow(
        &self,
        client: &Arc<Client>,
        msg: &Arc<Message>,
        st: &mut MsgState,
        raw: &[u8],
        rh: &RmppHdr,
        fx: &mut Effects,
    ) {
        match rh.frame_type() {
            Some(RmppType::Ack) => {
                fx.frames.push(ctrl_frame(st, RmppType::Ack, rmpp_status::NORMAL, 0, 1));
                self.set_timer(msg, st, TimerKind::Resp, TimeoutFn::Send);
            }
            Some(RmppType::Data) => {
                st.flags.insert(MsgFlags::RECV_RMPP);
                st.rmpp.state = RmppState::ReceiverActive;
                if let Ok(hdr) = MadHdr::from_bytes(raw) {
                    st.rmpp.ctl_hdr = hdr;
                }
                self.recvr_flow_main(client, msg, st, raw, rh, fx);
            }
            _ => self.rmpp_abort(client, msg, st, Some(rmpp_status::BADT), fx),
        }
    }

    fn recvr_active_flow(
        &self,
        client: &Arc<Client>,
        msg: &Arc<Message>,
        st: &mut MsgState,
        raw: &[u8],
        rh: &RmppHdr,
        fx: &mut Effects,
    ) {
        match rh.frame_type() {
            Some(RmppType::Ack) => {
                // Still waiting for the first segment; keep the peer honest.
                if st.rmpp.es == 1 {
                    self.set_timer(msg, st, TimerKind::Resp, TimeoutFn::Send);
                }
            }
            Some(RmppType::Data) => self.recvr_flow_main(client, msg, st, raw, rh, fx),
            Some(RmppType::Stop) | Some(RmppType::Abort) => {
                self.rmpp_abort(client, msg, st, None, fx)
            }
            None => self.rmpp_abort(client, msg, st, Some(rmpp_status::BADT), fx),
        }
    }

    /// Absorb one DATA segment.
    fn recvr_flow_main(
        &self,
        client: &Arc<Client>,
        msg: &Arc<Message>,
        st: &mut MsgState,
        raw: &[u8],
        rh: &RmppHdr,
        fx: &mut Effects,
    ) {
        let segnum = rh.segnum;
        if segnum != st.rmpp.es {
            trace!(tid = st.tid, segnum, es = st.rmpp.es, "unexpected segment");
            if st.rmpp.es > 1 {
                self.rmpp_ack(st, fx);
            } else {
                self.set_timer(msg, st, TimerKind::Resp, TimeoutFn::Send);
            }
            return;
        }

        let class = raw[1];
        let (cl_hdr_sz, cl_hdr_off) = mad::class_hdr_sz_off(class);
        let cl_hdr_start = MAD_HDR_SIZE + cl_hdr_off;
        let data_start = cl_hdr_start + cl_hdr_sz;
        let cl_data_sz = MAD_SIZE - data_start;

        if rh.is_first() || segnum == 1 {
            if !rh.is_first() || segnum != 1 {
                self.rmpp_abort(client, msg, st, Some(rmpp_status::IFSN), fx);
                return;
            }

            let buf_sz = rh.pyldlen_nwl as usize;
            let cl_hdrdata_sz = cl_hdr_sz + cl_data_sz;
            let num_pkts = if buf_sz == 0 { 1 } else { buf_sz.div_ceil(cl_hdrdata_sz) };
            if buf_sz != 0 {
                st.rmpp.pyld_len = buf_sz.saturating_sub(num_pkts * cl_hdr_sz);
                st.rmpp.dyn_pyld = false;
            } else {
                st.rmpp.pyld_len = BUF_PKTS * cl_data_sz;
                st.rmpp.dyn_pyld = true;
            }

            let mut data = Vec::new();
            if data.try_reserve_exact(st.rmpp.pyld_len).is_err() {
                warn!(tid = st.tid, len = st.rmpp.pyld_len, "no memory for RMPP receive buffer");
                fx.terminate = self.mark_done(st, TransStatus::NoMemory);
                return;
            }
            data.resize(st.rmpp.pyld_len, 0);
            ClientStats::bump(&client.stats.recv_bufs_alloced);
            let hdr = match MadHdr::from_bytes(raw) {
                Ok(hdr) => hdr,
                Err(_) => return,
            };
            st.recv = Some(MsgBufs::new(hdr, raw[cl_hdr_start..data_start].to_vec(), data));

            st.rmpp.data_offset = 0;
            st.rmpp.pkt_data_sz = cl_data_sz;
            st.rmpp.num_pkts = if st.rmpp.dyn_pyld {
                DYN_NUM_PKTS
            } else {
                st.rmpp.pyld_len.div_ceil(cl_data_sz).max(1) as u32
            };

            if !rh.is_last() {
                let multiplier = client.trans_multiplier();
                st.trans_to_us = trans_timeout_us(
                    &self.config,
                    st.retrans.trans_to_us,
                    st.retrans.resp_interval_us(),
                    &st.rmpp,
                    multiplier,
                );
                self.set_timer(msg, st, TimerKind::Trans, TimeoutFn::Recv);
            }
        }

        let mut data_sz = if rh.is_last() {
            (rh.pyldlen_nwl as usize).saturating_sub(cl_hdr_sz)
        } else {
            st.rmpp.pkt_data_sz
        };

        if data_sz + st.rmpp.data_offset >= st.rmpp.pyld_len && !rh.is_last() {
            if !st.rmpp.dyn_pyld {
                self.rmpp_abort(client, msg, st, Some(rmpp_status::ILPL), fx);
                return;
            }
            let grow = BUF_PKTS * st.rmpp.pkt_data_sz;
            let Some(recv) = st.recv.as_mut() else {
                return;
            };
            if recv.data.try_reserve_exact(grow).is_err() {
                warn!(tid = st.tid, "no memory to grow RMPP receive buffer");
                fx.terminate = self.mark_done(st, TransStatus::NoMemory);
                return;
            }
            st.rmpp.pyld_len += grow;
            recv.data.resize(st.rmpp.pyld_len, 0);
            ClientStats::bump(&client.stats.recv_bufs_alloced);
        }

        let offset = st.rmpp.data_offset;
        data_sz = data_sz
            .min(st.rmpp.pyld_len.saturating_sub(offset))
            .min(MAD_SIZE - data_start)
            .min(raw.len().saturating_sub(data_start));
        if let Some(recv) = st.recv.as_mut() {
            recv.data[offset..offset + data_sz].copy_from_slice(&raw[data_start..data_start + data_sz]);
        }
        st.rmpp.data_offset += data_sz;
        st.rmpp.es += 1;

        if rh.is_last() {
            if st.rmpp.dyn_pyld {
                st.rmpp.dyn_pyld = false;
                st.rmpp.pyld_len = st.rmpp.data_offset;
                let len = st.rmpp.pyld_len;
                if let Some(recv) = st.recv.as_mut() {
                    recv.data.truncate(len);
                    recv.data.shrink_to_fit();
                }
            }
            trace!(tid = st.tid, len = st.rmpp.pyld_len, "RMPP receive complete");
            st.rmpp.state = RmppState::ReceiverTerminate;
            self.rmpp_ack(st, fx);
            fx.critical = true;
            fx.termination = Some(st.rmpp.clone());
            fx.terminate = self.mark_done(st, TransStatus::Success);
            return;
        }

        if segnum == st.rmpp.wl {
            self.rmpp_ack(st, fx);
            st.rmpp.wl += self.config.rmpp_window;
        }
    }

    fn recvr_term_flow(
        &self,
        client: &Arc<Client>,
        msg: &Arc<Message>,
        st: &mut MsgState,
        rh: &RmppHdr,
        fx: &mut Effects,
    ) {
        match rh.frame_type() {
            Some(RmppType::Data) => {
                trace!(tid = st.tid, segnum = rh.segnum, "duplicate segment after completion");
                self.rmpp_ack(st, fx);
                self.set_timer(msg, st, TimerKind::Resp, TimeoutFn::Recv);
            }
            Some(RmppType::Ack) if st.rmpp.is_ds => {
                trace!(tid = st.tid, "peer switched direction");
                st.rmpp.state = RmppState::Done;
                fx.terminate = self.mark_done(st, TransStatus::Success);
            }
            _ => self.rmpp_abort(client, msg, st, Some(rmpp_status::BADT), fx),
        }
    }

    /// Send `fx.frames`, leave a termination context behind if asked to,
    /// and terminate the transaction if it finished.
    pub(crate) fn apply(&self, client: &Arc<Client>, msg: &Arc<Message>, fx: Effects) -> Vec<Notification> {
        let mut notes = Vec::new();
        for frame in &fx.frames {
            match self.transport.send(frame) {
                Ok(()) => ClientStats::bump(&client.stats.msgs_sent),
                Err(e) => {
                    warn!(error = %e, "RMPP frame send failed");
                    if fx.critical {
                        msg.state.lock().flags.insert(MsgFlags::SEND_DONE);
                    }
                }
            }
        }
        if let Some(ctx) = fx.termination {
            self.spawn_termination(client, msg, ctx);
        }
        if fx.terminate {
            notes.extend(self.terminate(client, msg));
        }
        notes
    }

    /// Put a termination context for a completed receive on the registry.
    /// It re-acknowledges duplicate segments until its timer runs out, then
    /// frees itself.
    fn spawn_termination(&self, client: &Arc<Client>, msg: &Arc<Message>, ctx: RmppCtx) {
        if !client.reserve_alloc(self.config.max_msgs_per_client) {
            debug!("no room for RMPP termination context");
            return;
        }
        let term = Message::new(client, MsgFlags::INIT | MsgFlags::TERMINATION | MsgFlags::RECV_RMPP);
        {
            let src = msg.state.lock();
            let mut st = term.state.lock();
            st.tid = src.tid;
            st.class = src.class;
            st.method = src.method;
            st.addr = src.addr;
            st.global = src.global;
            st.retrans = src.retrans;
            st.rmpp = ctx;
        }
        client.add_msg(&term);
        let mut st = term.state.lock();
        self.set_timer(&term, &mut st, TimerKind::Resp, TimeoutFn::Recv);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mad::{CLASS_SUBN_ADM, METHOD_GET_TABLE_RESP};

    #[test]
    fn test_sender_layout() {
        let hdr = MadHdr::new(CLASS_SUBN_ADM, 2, METHOD_GET_TABLE_RESP, 1, 0x11);
        let mut ctx = RmppCtx::default();

        ctx.start_sender(hdr, 450, false);
        assert_eq!(ctx.num_pkts, 3);
        assert_eq!(ctx.pkt_data_sz, 200);
        assert_eq!(ctx.last_pkt_sz, 50);
        assert_eq!((ctx.wf, ctx.wl, ctx.ns), (1, 1, 1));
        assert_eq!(ctx.state, RmppState::SenderActive);

        ctx.start_sender(hdr, 400, true);
        assert_eq!(ctx.num_pkts, 2);
        assert_eq!(ctx.last_pkt_sz, 200);
        assert!(ctx.is_ds);

        ctx.start_sender(hdr, 0, false);
        assert_eq!(ctx.num_pkts, 1);
        assert_eq!(ctx.last_pkt_sz, 0);
    }

    #[test]
    fn test_data_frame_payload_lengths() {
        let hdr = MadHdr::new(CLASS_SUBN_ADM, 2, METHOD_GET_TABLE_RESP, 1, 0x11);
        let data: Vec<u8> = (0..450u32).map(|i| i as u8).collect();
        let mut st = MsgState::new(MsgFlags::INIT);
        st.send = MsgBufs::new(hdr, vec![0xee; 20], data.clone());
        st.rmpp.start_sender(hdr, data.len(), false);

        let first = RmppHdr::from_mad(&data_frame(&st, 1).bytes).unwrap();
        assert!(first.is_first() && !first.is_last());
        assert_eq!(first.pyldlen_nwl, 450 + 3 * 20);

        let last_frame = data_frame(&st, 3);
        let last = RmppHdr::from_mad(&last_frame.bytes).unwrap();
        assert!(last.is_last());
        assert_eq!(last.pyldlen_nwl, 50 + 20);
        let (cl_hdr, cl_data) = mad::split_mad(&last_frame.bytes);
        assert_eq!(cl_hdr, &[0xee; 20][..]);
        assert_eq!(&cl_data[..50], &data[400..]);
    }
}
