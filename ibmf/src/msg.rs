//! Message context: one management transaction.

use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};

use crate::client::Client;
use crate::config::Retrans;
use crate::error::{Error, Result, TransStatus};
use crate::mad::{self, MadHdr};
use crate::rmpp::RmppCtx;
use crate::timer::TimerId;

bitflags! {
    /// Message state flags. Guarded by the message mutex.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MsgFlags: u32 {
        /// Freed, or not yet visible to other paths.
        const UNINIT = 1 << 0;
        const INIT = 1 << 1;
        /// Terminal. Set at most once per transaction.
        const DONE = 1 << 2;
        /// The completion notification has been claimed.
        const SIGNALED = 1 << 3;
        /// The last outbound batch has left (or its failure was recorded).
        const SEND_DONE = 1 << 4;
        /// A blocking sender is waiting on the condvar.
        const WAIT = 1 << 5;
        /// A thread is inside the send path for this message.
        const BUSY = 1 << 6;
        const SEND_RMPP = 1 << 7;
        const RECV_RMPP = 1 << 8;
        /// RMPP receiver termination context; freed by the timer path.
        const TERMINATION = 1 << 9;
        const UNSOLICITED = 1 << 10;
        /// The send expects a response.
        const SEQUENCED = 1 << 11;
    }
}

/// Addressing of the remote end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddrInfo {
    /// LID of the remote port.
    pub remote_lid: u16,
    /// Remote queue pair number.
    pub remote_qpn: u32,
    /// Q_Key the remote QP accepts.
    pub q_key: u32,
    /// Partition key.
    pub p_key: u16,
    /// Service level.
    pub sl: u8,
}

/// Global routing information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalRoute {
    /// Source GID.
    pub sgid: [u8; 16],
    /// Destination GID.
    pub dgid: [u8; 16],
    /// 20-bit flow label.
    pub flow_label: u32,
    /// Traffic class.
    pub tclass: u8,
    pub hop_limit: u8,
}

/// Header, class header and class data of one direction of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgBufs {
    /// Common MAD header.
    pub hdr: MadHdr,
    /// Class-specific header, without the RMPP header.
    pub cl_hdr: Vec<u8>,
    /// Class data. Spans every segment of an RMPP transfer.
    pub data: Vec<u8>,
}

impl MsgBufs {
    pub fn new(hdr: MadHdr, cl_hdr: Vec<u8>, data: Vec<u8>) -> Self {
        Self { hdr, cl_hdr, data }
    }

    /// Unpack a single non-RMPP datagram.
    pub fn from_mad(mad: &[u8]) -> Result<Self> {
        let hdr = MadHdr::from_bytes(mad)?;
        let (cl_hdr, data) = mad::split_mad(mad);
        Ok(Self {
            hdr,
            cl_hdr: cl_hdr.to_vec(),
            data: data.to_vec(),
        })
    }
}

/// Per-transaction completion callback.
pub type TransCallback = Box<dyn FnOnce(Arc<Message>) + Send>;

/// Which of the two per-message timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    Resp = 0,
    Trans = 1,
}

/// A timer handle and the handle most recently cancelled.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TimerSlot {
    pub live: Option<TimerId>,
    pub unset: Option<TimerId>,
}

/// Key used to match inbound datagrams against pending messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MsgKey {
    pub tid: u64,
    pub class: u8,
    pub method: u8,
    pub remote_lid: u16,
}

pub(crate) struct MsgState {
    pub flags: MsgFlags,
    pub ref_cnt: u32,
    pub on_registry: bool,
    pub status: TransStatus,

    pub tid: u64,
    pub class: u8,
    pub method: u8,

    pub addr: AddrInfo,
    pub global: Option<GlobalRoute>,
    pub send: MsgBufs,
    pub recv: Option<MsgBufs>,

    pub retrans: Retrans,
    pub retries_done: u32,
    pub trans_to_us: u64,
    pub rmpp: RmppCtx,
    pub timers: [TimerSlot; 2],
    pub callback: Option<TransCallback>,
}

impl MsgState {
    pub(crate) fn new(flags: MsgFlags) -> Self {
        Self {
            flags,
            ref_cnt: 0,
            on_registry: false,
            status: TransStatus::Pending,
            tid: 0,
            class: 0,
            method: 0,
            addr: AddrInfo::default(),
            global: None,
            send: MsgBufs::default(),
            recv: None,
            retrans: Retrans::default(),
            retries_done: 0,
            trans_to_us: 0,
            rmpp: RmppCtx::default(),
            timers: [TimerSlot::default(); 2],
            callback: None,
        }
    }

    #[inline]
    pub fn timer(&mut self, kind: TimerKind) -> &mut TimerSlot {
        &mut self.timers[kind as usize]
    }

    pub fn key(&self) -> MsgKey {
        MsgKey {
            tid: self.tid,
            class: self.class,
            method: self.method,
            remote_lid: self.addr.remote_lid,
        }
    }

    /// Whether an inbound datagram with `key` belongs to this message. A
    /// reply also matches any request it can answer.
    pub fn matches(&self, key: &MsgKey) -> bool {
        self.tid == key.tid
            && self.class == key.class
            && self.addr.remote_lid == key.remote_lid
            && (self.method == key.method || mad::answers(self.method, key.method))
    }

    /// Claim the right to notify the client. Succeeds at most once, and
    /// only when the message is done, unlinked and unreferenced.
    pub fn claim_notify(&mut self) -> bool {
        let blocked = MsgFlags::SIGNALED | MsgFlags::WAIT | MsgFlags::TERMINATION;
        if self.flags.contains(MsgFlags::DONE)
            && !self.on_registry
            && self.ref_cnt == 0
            && !self.flags.intersects(blocked)
        {
            self.flags.insert(MsgFlags::SIGNALED);
            true
        } else {
            false
        }
    }
}

/// A management transaction context.
///
/// Shared between the owning client, the client's registry and any timer
/// or receive path acting on it. All mutable state sits behind one mutex.
pub struct Message {
    client: Weak<Client>,
    pub(crate) state: Mutex<MsgState>,
    pub(crate) cv: Condvar,
}

impl Message {
    pub(crate) fn new(client: &Arc<Client>, flags: MsgFlags) -> Arc<Self> {
        Arc::new(Self {
            client: Arc::downgrade(client),
            state: Mutex::new(MsgState::new(flags)),
            cv: Condvar::new(),
        })
    }

    /// The owning client, unless it has been unregistered and dropped.
    pub fn client(&self) -> Option<Arc<Client>> {
        self.client.upgrade()
    }

    /// Set the outbound header, class header and data.
    pub fn set_send(&self, bufs: MsgBufs) -> Result<()> {
        let mut st = self.state.lock();
        if st.flags.contains(MsgFlags::BUSY) || st.on_registry {
            return Err(Error::Busy("message is in a transaction"));
        }
        st.send = bufs;
        Ok(())
    }

    /// Set the remote address and optional global route.
    pub fn set_addr(&self, addr: AddrInfo, global: Option<GlobalRoute>) -> Result<()> {
        let mut st = self.state.lock();
        if st.flags.contains(MsgFlags::BUSY) || st.on_registry {
            return Err(Error::Busy("message is in a transaction"));
        }
        st.addr = addr;
        st.global = global;
        Ok(())
    }

    pub fn send_bufs(&self) -> MsgBufs {
        self.state.lock().send.clone()
    }

    /// Received header, class header and data, once a response or
    /// unsolicited datagram has been assembled.
    pub fn recv_bufs(&self) -> Option<MsgBufs> {
        self.state.lock().recv.clone()
    }

    pub fn addr(&self) -> AddrInfo {
        self.state.lock().addr
    }

    pub fn global_route(&self) -> Option<GlobalRoute> {
        self.state.lock().global
    }

    /// Terminal status of the last transaction.
    pub fn status(&self) -> TransStatus {
        self.state.lock().status
    }

    pub fn flags(&self) -> MsgFlags {
        self.state.lock().flags
    }

    pub fn tid(&self) -> u64 {
        self.state.lock().tid
    }

    pub fn is_unsolicited(&self) -> bool {
        self.state.lock().flags.contains(MsgFlags::UNSOLICITED)
    }

    #[cfg(test)]
    pub(crate) fn ref_cnt(&self) -> u32 {
        self.state.lock().ref_cnt
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.state.try_lock() {
            Some(st) => f
                .debug_struct("Message")
                .field("tid", &format_args!("{:#x}", st.tid))
                .field("class", &st.class)
                .field("method", &st.method)
                .field("flags", &st.flags)
                .field("status", &st.status)
                .finish(),
            None => f.debug_struct("Message").finish_non_exhaustive(),
        }
    }
}
