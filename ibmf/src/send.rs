//! Submitting a message for transport.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::client::{Client, ClientStats, RegFlags};
use crate::config::RetransParams;
use crate::error::{Error, Result, TransStatus};
use crate::loopback::Loopback;
use crate::mad::{self, MadHdr};
use crate::msg::{Message, MsgFlags, MsgState, TimerKind, TransCallback};
use crate::port::PortInner;
use crate::rmpp::RmppCtx;
use crate::terminate::{deliver_all, Notification};
use crate::timeouts::{trans_timeout_us, TimeoutFn};
use crate::transport::OutboundMad;

/// Options for one [`crate::Port::msg_transport`] call.
#[derive(Default)]
pub struct TransportOpts {
    /// Wait for the transaction to finish before returning.
    pub blocking: bool,
    /// The send expects a response.
    pub sequenced: bool,
    pub retrans: RetransParams,
    /// Called once when a non-blocking transaction finishes.
    pub callback: Option<TransCallback>,
}

impl TransportOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }

    pub fn sequenced(mut self) -> Self {
        self.sequenced = true;
        self
    }

    pub fn with_retrans(mut self, retrans: RetransParams) -> Self {
        self.retrans = retrans;
        self
    }

    pub fn with_callback(mut self, cb: impl FnOnce(Arc<Message>) + Send + 'static) -> Self {
        self.callback = Some(Box::new(cb));
        self
    }
}

impl std::fmt::Debug for TransportOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportOpts")
            .field("blocking", &self.blocking)
            .field("sequenced", &self.sequenced)
            .field("retrans", &self.retrans)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// The whole send buffer as one datagram.
pub(crate) fn single_packet(st: &MsgState) -> OutboundMad {
    OutboundMad {
        bytes: mad::build_mad(&st.send.hdr, None, &st.send.cl_hdr, &st.send.data),
        addr: st.addr,
        global: st.global,
    }
}

impl PortInner {
    pub(crate) fn msg_transport(&self, client: &Arc<Client>, msg: &Arc<Message>, opts: TransportOpts) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        match msg.client() {
            Some(owner) if Arc::ptr_eq(&owner, client) => {}
            _ => return Err(Error::InvalidArgument("message belongs to another client")),
        }

        let TransportOpts {
            blocking,
            sequenced,
            retrans,
            callback,
        } = opts;

        let frames = {
            let mut st = msg.state.lock();
            if st.flags.contains(MsgFlags::BUSY) || st.on_registry || st.ref_cnt > 0 {
                return Err(Error::Busy("message is in a transaction"));
            }
            if st.flags.contains(MsgFlags::UNINIT) {
                return Err(Error::InvalidArgument("message has been freed"));
            }
            let hdr = st.send.hdr;
            if hdr.base_version == 0 {
                return Err(Error::InvalidArgument("send header not set"));
            }
            if !client.client_type().serves_class(hdr.mgmt_class) {
                return Err(Error::InvalidArgument("management class not served by client"));
            }
            let class = hdr.mgmt_class;
            let len = st.send.data.len();
            let use_rmpp = client.flags().contains(RegFlags::RMPP)
                && mad::class_has_rmpp(class)
                && len > mad::class_data_capacity(class);
            if !use_rmpp && len > mad::class_data_capacity(class) {
                return Err(Error::InvalidArgument("payload does not fit one MAD"));
            }

            self.prepare(client, &mut st, hdr, blocking, sequenced, retrans, callback, use_rmpp);
            trace!(tid = st.tid, class, method = st.method, blocking, sequenced, use_rmpp, "submitting");
            if use_rmpp {
                self.rmpp_window_frames(&mut st)
            } else {
                vec![single_packet(&st)]
            }
        };

        client.add_msg(msg);

        if let Err(e) = self.transmit(client, msg, frames) {
            self.rollback(client, msg);
            return Err(e);
        }

        let mut notes: Vec<Notification> = Vec::new();
        notes.extend(self.complete_send(client, msg));
        if blocking {
            self.wait_blocking(msg);
        } else {
            notes.extend(self.release(client, msg, true));
        }
        deliver_all(notes);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare(
        &self,
        client: &Client,
        st: &mut MsgState,
        hdr: MadHdr,
        blocking: bool,
        sequenced: bool,
        retrans: RetransParams,
        callback: Option<TransCallback>,
        use_rmpp: bool,
    ) {
        let mut flags = MsgFlags::INIT | MsgFlags::BUSY;
        if sequenced {
            flags |= MsgFlags::SEQUENCED;
        }
        if blocking {
            flags |= MsgFlags::WAIT;
        }
        if use_rmpp {
            flags |= MsgFlags::SEND_RMPP;
        }
        st.flags = flags;
        st.ref_cnt = 1;
        st.status = TransStatus::Pending;
        st.tid = hdr.tid;
        st.class = hdr.mgmt_class;
        st.method = hdr.method;
        st.recv = None;
        st.retrans = retrans.resolve(&self.config);
        st.retries_done = 0;
        st.trans_to_us = st.retrans.trans_to_us;
        st.callback = if blocking { None } else { callback };
        st.rmpp = RmppCtx::default();

        if use_rmpp {
            let is_ds = sequenced && !mad::is_reply(hdr.method);
            let len = st.send.data.len();
            st.rmpp.start_sender(hdr, len, is_ds);
            st.trans_to_us = trans_timeout_us(
                &self.config,
                st.retrans.trans_to_us,
                st.retrans.resp_interval_us(),
                &st.rmpp,
                client.trans_multiplier(),
            );
        }
    }

    /// Deliver `frames`: through the loopback filter when the adapter needs
    /// it and the first frame is a zero-hop directed-route MAD, otherwise
    /// over the transport.
    pub(crate) fn transmit(&self, client: &Arc<Client>, msg: &Arc<Message>, frames: Vec<OutboundMad>) -> Result<()> {
        let Some(first) = frames.first() else {
            return Ok(());
        };
        let zero_hop_dr = MadHdr::from_bytes(&first.bytes)
            .map(|hdr| hdr.is_zero_hop_dr())
            .unwrap_or(false);
        if zero_hop_dr && self.config.needs_dr_loopback(self.hca.id) {
            match self.loopback(client, msg)? {
                Loopback::Delivered => return Ok(()),
                Loopback::Wire => {}
            }
        }
        for frame in &frames {
            self.transport.send(frame)?;
            ClientStats::bump(&client.stats.msgs_sent);
        }
        Ok(())
    }

    /// Undo a submission whose first send failed. The caller gets the error
    /// and no notification follows.
    fn rollback(&self, client: &Arc<Client>, msg: &Arc<Message>) {
        client.remove_msg(msg);
        let mut st = msg.state.lock();
        debug!(tid = st.tid, "send failed, rolling back");
        self.unset_timer(&mut st, TimerKind::Resp);
        self.unset_timer(&mut st, TimerKind::Trans);
        st.ref_cnt -= 1;
        st.flags = MsgFlags::INIT;
        st.callback = None;
    }

    /// Record that the first batch left and arm what waits for the peer.
    fn complete_send(&self, client: &Arc<Client>, msg: &Arc<Message>) -> Option<Notification> {
        let mut st = msg.state.lock();
        st.flags.insert(MsgFlags::SEND_DONE);
        if st.flags.contains(MsgFlags::DONE) {
            // Finished while we were sending.
            return None;
        }
        if st.flags.intersects(MsgFlags::SEQUENCED | MsgFlags::SEND_RMPP) {
            self.set_timer(msg, &mut st, TimerKind::Resp, TimeoutFn::Send);
            if st.flags.contains(MsgFlags::SEND_RMPP) && st.timer(TimerKind::Trans).live.is_none() {
                self.set_timer(msg, &mut st, TimerKind::Trans, TimeoutFn::Recv);
            }
            return None;
        }
        let done = self.mark_done(&mut st, TransStatus::Success);
        drop(st);
        if done {
            self.terminate(client, msg)
        } else {
            None
        }
    }

    /// Block until the transaction is done and every other path has let go
    /// of the message. The submitter's reference is the only one left.
    fn wait_blocking(&self, msg: &Arc<Message>) {
        let mut st = msg.state.lock();
        while !(st.flags.contains(MsgFlags::DONE) && !st.on_registry && st.ref_cnt == 1) {
            msg.cv.wait(&mut st);
        }
        st.ref_cnt = 0;
        st.flags.remove(MsgFlags::WAIT | MsgFlags::BUSY);
        st.flags.insert(MsgFlags::SIGNALED);
        if st.status != TransStatus::Success {
            warn!(tid = st.tid, status = ?st.status, "blocking transaction failed");
        }
    }
}
