//! Software loopback of zero-hop directed-route SMPs.
//!
//! Some adapters put a zero-hop directed-route MAD on the wire instead of
//! handing it to the local SM or SMA. For those, the send path calls
//! [`PortInner::loopback`], which delivers the send buffers straight into
//! the local destination client.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::client::{Client, ClientStats, ClientType};
use crate::error::{Error, Result, TransStatus};
use crate::mad::{self, ATTR_SM_INFO};
use crate::msg::{Message, MsgFlags, MsgKey};
use crate::port::PortInner;
use crate::terminate::deliver_all;

/// Outcome of the loopback filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Loopback {
    /// Delivered locally; nothing goes on the wire.
    Delivered,
    /// No local destination; send normally.
    Wire,
}

/// The local client a looped-back SMP is meant for.
pub(crate) fn loopback_dest(src: ClientType, method: u8, attr_id: u16) -> Option<ClientType> {
    let dest = if attr_id == ATTR_SM_INFO {
        ClientType::SubnManager
    } else {
        match method {
            mad::METHOD_GET | mad::METHOD_SET | mad::METHOD_TRAP_REPRESS => ClientType::SubnAgent,
            mad::METHOD_GET_RESP | mad::METHOD_TRAP => ClientType::SubnManager,
            _ => return None,
        }
    };
    // An SM asking itself for its own SMInfo.
    if src == ClientType::SubnManager
        && dest == ClientType::SubnManager
        && attr_id == ATTR_SM_INFO
        && !mad::is_response(method)
    {
        return None;
    }
    Some(dest)
}

impl PortInner {
    /// Deliver the send buffers of `msg` to the local SM or SMA.
    ///
    /// A pending destination message waiting for exactly this datagram
    /// receives it; otherwise a new unsolicited message is created. A
    /// destination that already completed fails the call with
    /// [`Error::LoopbackStale`].
    pub(crate) fn loopback(&self, client: &Arc<Client>, msg: &Arc<Message>) -> Result<Loopback> {
        let (send, addr, global) = {
            let st = msg.state.lock();
            (st.send.clone(), st.addr, st.global)
        };
        let hdr = send.hdr;

        let Some(dest_ty) = loopback_dest(client.client_type(), hdr.method, hdr.attr_id) else {
            warn!(tid = hdr.tid, method = hdr.method, attr = hdr.attr_id, "no loopback destination");
            return Ok(Loopback::Wire);
        };
        let Some(dest) = self.client(dest_ty) else {
            warn!(tid = hdr.tid, dest = ?dest_ty, "loopback destination not registered");
            return Ok(Loopback::Wire);
        };

        let key = MsgKey {
            tid: hdr.tid,
            class: hdr.mgmt_class,
            method: hdr.method,
            remote_lid: addr.remote_lid,
        };
        let found = match dest.find_msg(&key) {
            Some(found) if Arc::ptr_eq(&found, msg) => {
                deliver_all(self.release(&dest, &found, false));
                None
            }
            other => other,
        };

        let target = match found {
            Some(target) => {
                let stale = target.state.lock().flags.intersects(MsgFlags::DONE | MsgFlags::UNINIT);
                if stale {
                    debug!(tid = hdr.tid, dest = ?dest_ty, "loopback destination already completed");
                    deliver_all(self.release(&dest, &target, false));
                    return Err(Error::LoopbackStale { tid: hdr.tid });
                }
                trace!(tid = hdr.tid, dest = ?dest_ty, "loopback to pending message");
                target
            }
            None => {
                trace!(tid = hdr.tid, dest = ?dest_ty, "loopback to new unsolicited message");
                self.new_unsolicited(&dest, &hdr, addr, global)?
            }
        };

        {
            let mut st = target.state.lock();
            st.recv = Some(send);
            st.addr = addr;
            st.global = global;
            self.mark_done(&mut st, TransStatus::Success);
        }
        ClientStats::bump(&client.stats.loopbacks);
        ClientStats::bump(&dest.stats.loopbacks);

        let mut notes = Vec::new();
        notes.extend(self.terminate(&dest, &target));
        notes.extend(self.release(&dest, &target, false));
        deliver_all(notes);
        Ok(Loopback::Delivered)
    }
}
