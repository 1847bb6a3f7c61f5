//! Transaction termination and client notification.
//!
//! A message is notified exactly once: by whichever path observes it done,
//! unlinked from its registry and unreferenced, and wins the SIGNALED flag.
//! The winner gets a [`Notification`] and delivers it after dropping every
//! lock, so a callback may start new transactions on the same port.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::client::{Client, ClientStats};
use crate::error::TransStatus;
use crate::msg::{Message, MsgFlags, MsgState};
use crate::port::PortInner;

/// A claimed, not yet delivered completion.
#[must_use = "a claimed notification must be delivered"]
pub(crate) struct Notification {
    client: Arc<Client>,
    msg: Arc<Message>,
}

impl Notification {
    fn new(client: &Arc<Client>, msg: &Arc<Message>) -> Self {
        Self {
            client: client.clone(),
            msg: msg.clone(),
        }
    }

    /// Run the client's callback. Must be called with no IBMF lock held.
    pub(crate) fn deliver(self) {
        let Notification { client, msg } = self;
        let (unsolicited, status, callback) = {
            let mut st = msg.state.lock();
            (
                st.flags.contains(MsgFlags::UNSOLICITED),
                st.status,
                st.callback.take(),
            )
        };

        if unsolicited {
            match client.recv_callback() {
                Some(cb) if status == TransStatus::Success => {
                    ClientStats::bump(&client.stats.msgs_received);
                    cb(msg);
                }
                _ => {
                    debug!(client = ?client.client_type(), ?status, "dropping unsolicited message");
                    msg.state.lock().flags.insert(MsgFlags::UNINIT);
                    client.release_alloc();
                }
            }
            client.recv_cb_exit();
        } else if let Some(cb) = callback {
            cb(msg);
        } else {
            trace!(tid = msg.tid(), ?status, "transaction finished without callback");
        }
    }
}

/// Deliver every notification in order.
pub(crate) fn deliver_all(notes: impl IntoIterator<Item = Notification>) {
    for note in notes {
        note.deliver();
    }
}

impl PortInner {
    /// Mark the transaction done with `status` and disarm both timers.
    /// Returns false if it was already done.
    pub(crate) fn mark_done(&self, st: &mut MsgState, status: TransStatus) -> bool {
        if st.flags.contains(MsgFlags::DONE) {
            return false;
        }
        debug_assert!(status.is_terminal());
        st.flags.insert(MsgFlags::DONE);
        st.status = status;
        self.unset_timer(st, crate::msg::TimerKind::Resp);
        self.unset_timer(st, crate::msg::TimerKind::Trans);
        trace!(tid = st.tid, ?status, "transaction done");
        true
    }

    /// Take a done message off its registry and claim its notification if
    /// nothing else still references it.
    ///
    /// RMPP termination contexts are released here instead of notified.
    pub(crate) fn terminate(&self, client: &Arc<Client>, msg: &Arc<Message>) -> Option<Notification> {
        let ref_cnt = client.remove_msg(msg);
        let mut st = msg.state.lock();
        debug_assert!(st.flags.contains(MsgFlags::DONE));

        if st.flags.contains(MsgFlags::TERMINATION) {
            trace!(tid = st.tid, "termination context released");
            st.flags.insert(MsgFlags::UNINIT);
            drop(st);
            client.release_alloc();
            return None;
        }
        if st.flags.contains(MsgFlags::WAIT) {
            msg.cv.notify_all();
            return None;
        }
        trace!(tid = st.tid, ref_cnt, "terminated");
        st.claim_notify().then(|| Notification::new(client, msg))
    }

    /// Drop one reference taken by a lookup, creation or submission.
    pub(crate) fn release(
        &self,
        client: &Arc<Client>,
        msg: &Arc<Message>,
        clear_busy: bool,
    ) -> Option<Notification> {
        let mut st = msg.state.lock();
        assert!(st.ref_cnt > 0, "message reference count underflow");
        st.ref_cnt -= 1;
        if clear_busy {
            st.flags.remove(MsgFlags::BUSY);
        }
        if st.flags.contains(MsgFlags::WAIT) {
            msg.cv.notify_all();
            return None;
        }
        st.claim_notify().then(|| Notification::new(client, msg))
    }
}
