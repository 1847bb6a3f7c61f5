//! Per-message response and transaction timers.
//!
//! Arming and disarming happen under the message mutex. Firing is
//! asynchronous, so every callback re-validates under the mutex before it
//! acts: the message may have completed, been freed, or had its timer
//! replaced since the callback was scheduled.

use std::sync::{Arc, Weak};

use tracing::{debug, trace, warn};

use crate::client::{Client, ClientStats};
use crate::config::IbmfConfig;
use crate::error::TransStatus;
use crate::mad::{rmpp_status, RmppType};
use crate::msg::{Message, MsgFlags, MsgState, TimerKind};
use crate::port::PortInner;
use crate::rmpp::{ctrl_frame, Effects, RmppCtx, RmppState};
use crate::terminate::{deliver_all, Notification};
use crate::timer::TimerId;

/// What to do when a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutFn {
    /// Retry the outstanding send or re-acknowledge.
    Send,
    /// Give up on the transaction, or finish an RMPP receiver termination.
    Recv,
    /// Finish an aborted RMPP transaction with a failure.
    ErrTerminate,
}

/// Transaction timeout for an RMPP transfer.
///
/// An explicit per-message value wins. Without a known payload size the
/// class default applies. Otherwise the per-window response budget is
/// scaled by the client's multiplier and the packet count, capped at the
/// default.
pub(crate) fn trans_timeout_us(
    config: &IbmfConfig,
    explicit_us: u64,
    resp_interval_us: u64,
    rmpp: &RmppCtx,
    multiplier: u8,
) -> u64 {
    if explicit_us != 0 {
        return explicit_us;
    }
    if rmpp.dyn_pyld || rmpp.num_pkts == 0 {
        return config.default_trans_to_us;
    }
    let base = resp_interval_us / config.rmpp_window.max(1) as u64;
    let num_pkts = rmpp.num_pkts as u64;
    let to = if (1..=10).contains(&multiplier) {
        base * config.trans_multiplier_scale * multiplier as u64 * num_pkts
    } else {
        base * config.trans_multiplier_fallback * num_pkts
    };
    to.min(config.default_trans_to_us)
}

impl PortInner {
    /// Arm the `kind` timer of `msg` to run `func`, replacing any armed one.
    pub(crate) fn set_timer(&self, msg: &Arc<Message>, st: &mut MsgState, kind: TimerKind, func: TimeoutFn) {
        self.unset_timer(st, kind);
        let interval = match kind {
            TimerKind::Resp => {
                if st.flags.contains(MsgFlags::TERMINATION) && self.config.termination_wait_us != 0 {
                    self.config.termination_wait_us
                } else {
                    st.retrans.resp_interval_us()
                }
            }
            TimerKind::Trans => st.trans_to_us,
        };
        let port: Weak<PortInner> = self.weak.clone();
        let weak_msg = Arc::downgrade(msg);
        let id = self.timers.schedule(
            interval,
            Box::new(move |id| {
                if let (Some(port), Some(msg)) = (port.upgrade(), weak_msg.upgrade()) {
                    port.on_timeout(&msg, kind, func, id);
                }
            }),
        );
        trace!(tid = st.tid, ?kind, ?func, interval, timer = id.as_u64(), "timer set");
        st.timer(kind).live = Some(id);
    }

    /// Disarm the `kind` timer. Idempotent. The cancelled handle is kept so
    /// a callback already in flight recognizes itself and backs off.
    pub(crate) fn unset_timer(&self, st: &mut MsgState, kind: TimerKind) {
        let slot = st.timer(kind);
        if let Some(id) = slot.live.take() {
            slot.unset = Some(id);
            self.timers.cancel(id);
            trace!(tid = st.tid, ?kind, timer = id.as_u64(), "timer unset");
        }
    }

    /// Decide whether a firing timer may act. Consumes the live handle on
    /// success.
    fn validate_fire(st: &mut MsgState, kind: TimerKind, id: TimerId) -> bool {
        let tid = st.tid;
        let flags = st.flags;
        let slot = st.timer(kind);
        if slot.unset == Some(id) {
            slot.unset = None;
        }
        if flags.intersects(MsgFlags::UNINIT | MsgFlags::DONE) {
            trace!(tid, ?kind, "timer fired on finished message");
            return false;
        }
        // Also covers a response that cleared the handle just before we
        // got the mutex.
        if slot.live != Some(id) {
            trace!(tid, ?kind, timer = id.as_u64(), "stale timer");
            return false;
        }
        slot.live = None;
        true
    }

    fn on_timeout(&self, msg: &Arc<Message>, kind: TimerKind, func: TimeoutFn, id: TimerId) {
        let Some(client) = msg.client() else {
            return;
        };
        match func {
            TimeoutFn::Send => self.send_timeout(&client, msg, kind, id),
            TimeoutFn::Recv => self.recv_timeout(&client, msg, kind, id),
            TimeoutFn::ErrTerminate => self.err_terminate_timeout(&client, msg, kind, id),
        }
    }

    /// Response timer expiry: retry, re-acknowledge, or give up.
    pub(crate) fn send_timeout(&self, client: &Arc<Client>, msg: &Arc<Message>, kind: TimerKind, id: TimerId) {
        let mut st = msg.state.lock();
        if !Self::validate_fire(&mut st, kind, id) {
            return;
        }

        if st.flags.contains(MsgFlags::RECV_RMPP) {
            let fx = self.recv_rmpp_send_timeout(client, msg, &mut st);
            drop(st);
            deliver_all(self.apply(client, msg, fx));
            return;
        }
        if st.flags.contains(MsgFlags::SEND_RMPP) {
            let fx = self.send_rmpp_send_timeout(client, msg, &mut st);
            drop(st);
            deliver_all(self.apply(client, msg, fx));
            return;
        }

        if st.retries_done >= st.retrans.retries {
            debug!(tid = st.tid, retries = st.retries_done, "retries exhausted");
            ClientStats::bump(&client.stats.timeouts);
            let done = self.mark_done(&mut st, TransStatus::TransTimeout);
            drop(st);
            if done {
                deliver_all(self.terminate(client, msg));
            }
            return;
        }

        st.retries_done += 1;
        st.ref_cnt += 1;
        let frame = crate::send::single_packet(&st);
        debug!(tid = st.tid, attempt = st.retries_done, "resending");
        drop(st);
        ClientStats::bump(&client.stats.retries);

        let sent = self.transmit(client, msg, vec![frame]);

        let mut notes = Vec::new();
        {
            let mut st = msg.state.lock();
            match sent {
                _ if st.flags.contains(MsgFlags::DONE) => {}
                Ok(()) => {
                    st.flags.insert(MsgFlags::SEND_DONE);
                    self.set_timer(msg, &mut st, TimerKind::Resp, TimeoutFn::Send);
                }
                Err(e) => {
                    warn!(tid = st.tid, error = %e, "resend failed");
                    st.flags.insert(MsgFlags::SEND_DONE);
                    if self.mark_done(&mut st, TransStatus::TransFailure) {
                        drop(st);
                        notes.extend(self.terminate(client, msg));
                    }
                }
            }
        }
        notes.extend(self.release(client, msg, false));
        deliver_all(notes);
    }

    fn send_rmpp_send_timeout(&self, client: &Arc<Client>, msg: &Arc<Message>, st: &mut MsgState) -> Effects {
        let mut fx = Effects::default();
        let exhausted = st.retries_done >= st.retrans.retries;
        let state = st.rmpp.state;
        match state {
            RmppState::SenderActive if !exhausted => {
                st.retries_done += 1;
                ClientStats::bump(&client.stats.retries);
                st.rmpp.ns = st.rmpp.wf;
                debug!(tid = st.tid, wf = st.rmpp.wf, wl = st.rmpp.wl, "resending RMPP window");
                fx.frames = self.rmpp_window_frames(st);
                self.set_timer(msg, st, TimerKind::Resp, TimeoutFn::Send);
            }
            RmppState::SenderSwitch if !exhausted => {
                st.retries_done += 1;
                ClientStats::bump(&client.stats.retries);
                fx.frames.push(ctrl_frame(st, RmppType::Ack, rmpp_status::NORMAL, 0, 1));
                self.set_timer(msg, st, TimerKind::Resp, TimeoutFn::Send);
            }
            RmppState::SenderActive | RmppState::SenderSwitch => {
                debug!(tid = st.tid, "RMPP sender retries exhausted");
                self.rmpp_give_up(client, st, rmpp_status::TMR, &mut fx);
            }
            state => {
                trace!(tid = st.tid, ?state, "response timer in passive RMPP state");
            }
        }
        fx
    }

    fn recv_rmpp_send_timeout(&self, client: &Arc<Client>, msg: &Arc<Message>, st: &mut MsgState) -> Effects {
        let mut fx = Effects::default();
        if st.rmpp.state != RmppState::ReceiverActive {
            trace!(tid = st.tid, state = ?st.rmpp.state, "response timer in passive RMPP state");
            return fx;
        }
        if st.retries_done >= st.retrans.retries {
            debug!(tid = st.tid, es = st.rmpp.es, "RMPP receiver retries exhausted");
            self.rmpp_give_up(client, st, rmpp_status::TMR, &mut fx);
            return fx;
        }
        st.retries_done += 1;
        ClientStats::bump(&client.stats.retries);
        let es = st.rmpp.es;
        if es > 1 {
            let nwl = es - 1 + self.config.rmpp_window;
            fx.frames.push(ctrl_frame(st, RmppType::Ack, rmpp_status::NORMAL, es - 1, nwl));
        }
        self.set_timer(msg, st, TimerKind::Resp, TimeoutFn::Send);
        fx
    }

    /// Send an ABORT with `status` and end the transaction with a timeout.
    fn rmpp_give_up(&self, client: &Arc<Client>, st: &mut MsgState, status: u8, fx: &mut Effects) {
        fx.frames.push(ctrl_frame(st, RmppType::Abort, status, 0, 0));
        fx.critical = true;
        ClientStats::bump(&client.stats.timeouts);
        st.rmpp.state = RmppState::Abort;
        fx.terminate = self.mark_done(st, TransStatus::TransTimeout);
    }

    /// Transaction timer expiry, or the end of an RMPP receiver's
    /// termination wait.
    pub(crate) fn recv_timeout(&self, client: &Arc<Client>, msg: &Arc<Message>, kind: TimerKind, id: TimerId) {
        let mut st = msg.state.lock();
        if !Self::validate_fire(&mut st, kind, id) {
            return;
        }
        let mut fx = Effects::default();
        let state = st.rmpp.state;
        match state {
            RmppState::ReceiverTerminate => {
                trace!(tid = st.tid, "RMPP receiver termination complete");
                st.rmpp.state = RmppState::Done;
                fx.terminate = self.mark_done(&mut st, TransStatus::Success);
            }
            RmppState::ReceiverActive | RmppState::SenderActive | RmppState::SenderSwitch => {
                debug!(tid = st.tid, state = ?st.rmpp.state, "RMPP transaction timed out");
                self.rmpp_give_up(client, &mut st, rmpp_status::T2L, &mut fx);
            }
            _ => {
                debug!(tid = st.tid, "transaction timed out");
                ClientStats::bump(&client.stats.timeouts);
                fx.terminate = self.mark_done(&mut st, TransStatus::TransTimeout);
            }
        }
        drop(st);
        deliver_all(self.apply(client, msg, fx));
    }

    /// Response timer expiry after an RMPP abort.
    pub(crate) fn err_terminate_timeout(
        &self,
        client: &Arc<Client>,
        msg: &Arc<Message>,
        kind: TimerKind,
        id: TimerId,
    ) {
        let mut st = msg.state.lock();
        if !Self::validate_fire(&mut st, kind, id) {
            return;
        }
        debug!(tid = st.tid, "terminating aborted transaction");
        let done = self.mark_done(&mut st, TransStatus::TransFailure);
        drop(st);
        if done {
            let notes: Option<Notification> = self.terminate(client, msg);
            deliver_all(notes);
        }
    }
}
