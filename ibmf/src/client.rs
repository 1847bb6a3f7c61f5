//! Registered clients and their message registries.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::mad;
use crate::msg::{Message, MsgKey};

/// Management class and role a client registers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientType {
    /// Subnet management agent (SMA).
    SubnAgent,
    /// Subnet manager (SM).
    SubnManager,
    SubnAdmAgent,
    SubnAdmManager,
    PerfAgent,
    PerfManager,
    BmAgent,
    BmManager,
    DevMgtAgent,
    DevMgtManager,
    CommMgt,
    SnmpAgent,
    /// A vendor-specific class (0x09..=0x0F or 0x30..=0x4F).
    Vendor(u8),
}

impl ClientType {
    /// The client that receives inbound MADs of `class` flowing towards
    /// the manager side (`to_manager`) or the agent side.
    pub fn for_inbound(class: u8, to_manager: bool) -> Option<ClientType> {
        use ClientType::*;
        let pick = |agent, manager| Some(if to_manager { manager } else { agent });
        match class {
            mad::CLASS_SUBN_LID_ROUTED | mad::CLASS_SUBN_DIRECT_ROUTE => pick(SubnAgent, SubnManager),
            mad::CLASS_SUBN_ADM => pick(SubnAdmAgent, SubnAdmManager),
            mad::CLASS_PERF => pick(PerfAgent, PerfManager),
            mad::CLASS_BM => pick(BmAgent, BmManager),
            mad::CLASS_DEV_MGT => pick(DevMgtAgent, DevMgtManager),
            mad::CLASS_COMM_MGT => Some(CommMgt),
            mad::CLASS_SNMP => Some(SnmpAgent),
            mad::CLASS_VENDOR_09..=mad::CLASS_VENDOR_0F
            | mad::CLASS_VENDOR_30..=mad::CLASS_VENDOR_4F => Some(Vendor(class)),
            _ => None,
        }
    }

    /// Whether this client may send MADs of `class`.
    pub fn serves_class(self, class: u8) -> bool {
        use ClientType::*;
        match self {
            SubnAgent | SubnManager => mad::is_subn_class(class),
            SubnAdmAgent | SubnAdmManager => class == mad::CLASS_SUBN_ADM,
            PerfAgent | PerfManager => class == mad::CLASS_PERF,
            BmAgent | BmManager => class == mad::CLASS_BM,
            DevMgtAgent | DevMgtManager => class == mad::CLASS_DEV_MGT,
            CommMgt => class == mad::CLASS_COMM_MGT,
            SnmpAgent => class == mad::CLASS_SNMP,
            Vendor(c) => c == class,
        }
    }

    pub fn is_valid(self) -> bool {
        match self {
            ClientType::Vendor(c) => {
                (mad::CLASS_VENDOR_09..=mad::CLASS_VENDOR_0F).contains(&c)
                    || (mad::CLASS_VENDOR_30..=mad::CLASS_VENDOR_4F).contains(&c)
            }
            _ => true,
        }
    }
}

bitflags! {
    /// Registration flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RegFlags: u32 {
        /// Segment large payloads with RMPP.
        const RMPP = 1 << 0;
    }
}

/// Callback for unsolicited messages. The message is handed over to the
/// client, which must eventually free it.
pub type RecvCallback = Arc<dyn Fn(Arc<Message>) + Send + Sync>;

/// Registration options.
#[derive(Clone, Default)]
pub struct ClientOptions {
    pub flags: RegFlags,
    /// Scales the RMPP transaction timeout; valid range 1..=10.
    pub trans_multiplier: u8,
    pub recv_callback: Option<RecvCallback>,
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flags(mut self, flags: RegFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_trans_multiplier(mut self, multiplier: u8) -> Self {
        self.trans_multiplier = multiplier;
        self
    }

    pub fn with_recv_callback(mut self, cb: impl Fn(Arc<Message>) + Send + Sync + 'static) -> Self {
        self.recv_callback = Some(Arc::new(cb));
        self
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("flags", &self.flags)
            .field("trans_multiplier", &self.trans_multiplier)
            .field("recv_callback", &self.recv_callback.is_some())
            .finish()
    }
}

/// Per-client counters.
#[derive(Debug, Default)]
pub struct ClientStats {
    pub msgs_sent: AtomicU64,
    pub msgs_received: AtomicU64,
    pub retries: AtomicU64,
    pub timeouts: AtomicU64,
    pub rmpp_errors: AtomicU64,
    pub loopbacks: AtomicU64,
    pub strays: AtomicU64,
    pub recv_bufs_alloced: AtomicU64,
}

/// Point-in-time copy of [`ClientStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStatsSnapshot {
    pub msgs_sent: u64,
    pub msgs_received: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub rmpp_errors: u64,
    pub loopbacks: u64,
    pub strays: u64,
    pub recv_bufs_alloced: u64,
}

impl ClientStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            msgs_sent: self.msgs_sent.load(Ordering::Relaxed),
            msgs_received: self.msgs_received.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rmpp_errors: self.rmpp_errors.load(Ordering::Relaxed),
            loopbacks: self.loopbacks.load(Ordering::Relaxed),
            strays: self.strays.load(Ordering::Relaxed),
            recv_bufs_alloced: self.recv_bufs_alloced.load(Ordering::Relaxed),
        }
    }
}

/// A registered client.
pub struct Client {
    id: u32,
    client_type: ClientType,
    flags: RegFlags,
    trans_multiplier: u8,
    recv_callback: Option<RecvCallback>,
    /// In-flight messages. Never locked while a message lock is held, and
    /// never held while taking one.
    registry: Mutex<Vec<Arc<Message>>>,
    msgs_alloced: AtomicUsize,
    recv_cb_active: AtomicUsize,
    next_tid: AtomicU32,
    pub(crate) stats: ClientStats,
}

impl Client {
    pub(crate) fn new(id: u32, client_type: ClientType, opts: ClientOptions) -> Self {
        Self {
            id,
            client_type,
            flags: opts.flags,
            trans_multiplier: opts.trans_multiplier,
            recv_callback: opts.recv_callback,
            registry: Mutex::new(Vec::new()),
            msgs_alloced: AtomicUsize::new(0),
            recv_cb_active: AtomicUsize::new(0),
            next_tid: AtomicU32::new(1),
            stats: ClientStats::default(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn client_type(&self) -> ClientType {
        self.client_type
    }

    pub fn flags(&self) -> RegFlags {
        self.flags
    }

    pub fn trans_multiplier(&self) -> u8 {
        self.trans_multiplier
    }

    pub fn stats(&self) -> ClientStatsSnapshot {
        self.stats.snapshot()
    }

    /// Allocate a transaction id: client id in the upper half, a per-client
    /// sequence in the lower half.
    pub fn alloc_tid(&self) -> u64 {
        let seq = self.next_tid.fetch_add(1, Ordering::Relaxed);
        ((self.id as u64) << 32) | seq as u64
    }

    /// Number of message contexts the client currently holds.
    pub fn msgs_alloced(&self) -> usize {
        self.msgs_alloced.load(Ordering::SeqCst)
    }

    /// Number of messages on the registry.
    pub fn registry_len(&self) -> usize {
        self.registry.lock().len()
    }

    pub(crate) fn has_recv_callback(&self) -> bool {
        self.recv_callback.is_some()
    }

    pub(crate) fn recv_callback(&self) -> Option<&RecvCallback> {
        self.recv_callback.as_ref()
    }

    /// Reserve a message slot, failing once `limit` is reached.
    pub(crate) fn reserve_alloc(&self, limit: usize) -> bool {
        self.msgs_alloced
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < limit).then_some(n + 1))
            .is_ok()
    }

    pub(crate) fn release_alloc(&self) {
        let prev = self.msgs_alloced.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    pub(crate) fn recv_cb_enter(&self) {
        self.recv_cb_active.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn recv_cb_exit(&self) {
        let prev = self.recv_cb_active.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
    }

    pub(crate) fn recv_cb_active(&self) -> usize {
        self.recv_cb_active.load(Ordering::SeqCst)
    }

    /// Put `msg` on the registry.
    pub(crate) fn add_msg(&self, msg: &Arc<Message>) {
        msg.state.lock().on_registry = true;
        self.registry.lock().push(msg.clone());
    }

    /// Take `msg` off the registry and return its reference count.
    pub(crate) fn remove_msg(&self, msg: &Arc<Message>) -> u32 {
        {
            let mut registry = self.registry.lock();
            if let Some(pos) = registry.iter().position(|m| Arc::ptr_eq(m, msg)) {
                registry.remove(pos);
            }
        }
        let mut st = msg.state.lock();
        st.on_registry = false;
        st.ref_cnt
    }

    /// Find the message `key` belongs to and take a reference on it.
    /// Messages still in progress win over completed ones.
    ///
    /// Works on a snapshot of the registry. A message removed since the
    /// snapshot has `on_registry` cleared under its own lock and is skipped,
    /// so no reference is taken after `remove_msg` read the count.
    pub(crate) fn find_msg(&self, key: &MsgKey) -> Option<Arc<Message>> {
        let snapshot = self.registry.lock().clone();
        let mut done_match = None;
        for msg in snapshot {
            let live = {
                let mut st = msg.state.lock();
                if !st.on_registry || !st.matches(key) {
                    continue;
                }
                let live = !st.flags.contains(crate::msg::MsgFlags::DONE);
                if live {
                    st.ref_cnt += 1;
                }
                live
            };
            if live {
                return Some(msg);
            }
            if done_match.is_none() {
                done_match = Some(msg);
            }
        }
        let msg = done_match?;
        {
            let mut st = msg.state.lock();
            if !st.on_registry {
                return None;
            }
            st.ref_cnt += 1;
        }
        Some(msg)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("client_type", &self.client_type)
            .field("flags", &self.flags)
            .field("msgs_alloced", &self.msgs_alloced())
            .finish()
    }
}
