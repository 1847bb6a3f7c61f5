//! Inbound datagram processing.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{trace, warn};

use crate::client::{Client, ClientStats, ClientType};
use crate::config::RetransParams;
use crate::error::{Error, Result, TransStatus};
use crate::mad::{self, MadHdr, RmppHdr, RmppType, ATTR_SM_INFO, MAD_SIZE};
use crate::msg::{AddrInfo, GlobalRoute, Message, MsgBufs, MsgFlags, MsgKey, TimerKind};
use crate::port::PortInner;
use crate::rmpp::RmppState;
use crate::terminate::{deliver_all, Notification};

impl PortInner {
    /// Process one datagram received on the port.
    ///
    /// Datagrams that belong to nothing are counted as strays and dropped.
    /// An error means the datagram was malformed or could not be given a
    /// message context.
    pub(crate) fn recv_mad(&self, raw: &[u8], addr: AddrInfo, global: Option<GlobalRoute>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        if raw.len() != MAD_SIZE {
            return Err(Error::InvalidArgument("datagram is not a MAD"));
        }
        let hdr = MadHdr::from_bytes(raw)?;
        let class = hdr.mgmt_class;
        let rmpp = if mad::class_has_rmpp(class) {
            RmppHdr::from_mad(raw).ok().filter(|rh| rh.is_active())
        } else {
            None
        };

        let to_manager =
            mad::targets_manager(hdr.method) || (mad::is_subn_class(class) && hdr.attr_id == ATTR_SM_INFO);
        let Some(primary) = ClientType::for_inbound(class, to_manager) else {
            trace!(class, "no client type for class");
            return Ok(());
        };

        let key = MsgKey {
            tid: hdr.tid,
            class,
            method: hdr.method,
            remote_lid: addr.remote_lid,
        };

        // RMPP control frames carry the header of the data they answer, so
        // they may belong to either side of the class.
        let mut candidates = vec![primary];
        if rmpp.is_some_and(|rh| rh.frame_type() != Some(RmppType::Data)) {
            if let Some(other) = ClientType::for_inbound(class, !to_manager) {
                if other != primary {
                    candidates.push(other);
                }
            }
        }
        for ty in candidates {
            let Some(client) = self.client(ty) else {
                continue;
            };
            if let Some(msg) = client.find_msg(&key) {
                self.process_matched(&client, &msg, raw, &hdr, rmpp.as_ref());
                return Ok(());
            }
        }

        let Some(client) = self.client(primary) else {
            trace!(tid = hdr.tid, client = ?primary, "no client registered for datagram");
            return Ok(());
        };
        let can_start = !mad::is_reply(hdr.method)
            && rmpp.map_or(true, |rh| rh.frame_type() == Some(RmppType::Data))
            && client.has_recv_callback();
        if !can_start {
            trace!(tid = hdr.tid, class, method = hdr.method, "stray datagram");
            ClientStats::bump(&client.stats.strays);
            return Ok(());
        }
        let msg = self.new_unsolicited(&client, &hdr, addr, global)?;
        self.process_matched(&client, &msg, raw, &hdr, rmpp.as_ref());
        Ok(())
    }

    /// Create and register an unsolicited message for an inbound request.
    /// The caller owns one reference.
    pub(crate) fn new_unsolicited(
        &self,
        client: &Arc<Client>,
        hdr: &MadHdr,
        addr: AddrInfo,
        global: Option<GlobalRoute>,
    ) -> Result<Arc<Message>> {
        if !client.reserve_alloc(self.config.max_msgs_per_client) {
            warn!(client = ?client.client_type(), "message limit reached, dropping unsolicited datagram");
            return Err(Error::NoResources("message contexts"));
        }
        client.recv_cb_enter();
        let msg = Message::new(client, MsgFlags::UNINIT | MsgFlags::UNSOLICITED);
        {
            let mut st = msg.state.lock();
            st.tid = hdr.tid;
            st.class = hdr.mgmt_class;
            st.method = hdr.method;
            st.addr = addr;
            st.global = global;
            st.retrans = RetransParams::default().resolve(&self.config);
            st.ref_cnt = 1;
        }
        client.add_msg(&msg);
        {
            let mut st = msg.state.lock();
            st.flags.remove(MsgFlags::UNINIT);
            st.flags.insert(MsgFlags::INIT);
        }
        Ok(msg)
    }

    /// Run a datagram against the message it matched, then drop the
    /// reference the lookup or creation took.
    fn process_matched(
        &self,
        client: &Arc<Client>,
        msg: &Arc<Message>,
        raw: &[u8],
        hdr: &MadHdr,
        rmpp: Option<&RmppHdr>,
    ) {
        let mut notes: Vec<Notification> = Vec::new();
        let mut st = msg.state.lock();

        if st.flags.intersects(MsgFlags::UNINIT | MsgFlags::DONE) {
            trace!(tid = st.tid, "datagram for finished message");
            drop(st);
        } else if let Some(rh) = rmpp {
            let starts_receive = rh.frame_type() == Some(RmppType::Data)
                && st.rmpp.state == RmppState::Idle
                && (st.flags.contains(MsgFlags::UNSOLICITED)
                    || (st.flags.contains(MsgFlags::SEQUENCED) && mad::is_reply(hdr.method)));
            if starts_receive {
                let is_ds = st.flags.contains(MsgFlags::UNSOLICITED) && !mad::is_reply(hdr.method);
                st.rmpp.start_receiver(*hdr, is_ds);
                st.flags.insert(MsgFlags::RECV_RMPP);
                st.retries_done = 0;
                self.unset_timer(&mut st, TimerKind::Resp);
            }
            let fx = self.handle_rmpp(client, msg, &mut st, raw, rh);
            drop(st);
            notes.extend(self.apply(client, msg, fx));
        } else if (st.flags.contains(MsgFlags::UNSOLICITED) && st.recv.is_none())
            || (st.flags.contains(MsgFlags::SEQUENCED) && mad::is_reply(hdr.method))
        {
            match MsgBufs::from_mad(raw) {
                Ok(bufs) => st.recv = Some(bufs),
                Err(e) => warn!(tid = st.tid, error = %e, "undecodable response"),
            }
            let done = self.mark_done(&mut st, TransStatus::Success);
            drop(st);
            if done {
                if !msg.is_unsolicited() {
                    ClientStats::bump(&client.stats.msgs_received);
                }
                notes.extend(self.terminate(client, msg));
            }
        } else {
            trace!(tid = st.tid, method = hdr.method, "datagram not expected by message");
            drop(st);
            ClientStats::bump(&client.stats.strays);
        }

        notes.extend(self.release(client, msg, false));
        deliver_all(notes);
    }
}
