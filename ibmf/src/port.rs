//! The IBMF instance for one HCA port.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::client::{Client, ClientOptions, ClientType};
use crate::config::IbmfConfig;
use crate::error::{Error, Result};
use crate::msg::{AddrInfo, GlobalRoute, Message, MsgFlags};
use crate::send::TransportOpts;
use crate::timer::TimerQueue;
use crate::transport::{HcaInfo, Transport};

pub(crate) struct PortInner {
    pub(crate) config: IbmfConfig,
    pub(crate) hca: HcaInfo,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) timers: Arc<TimerQueue>,
    clients: Mutex<Vec<Arc<Client>>>,
    next_client_id: AtomicU32,
    pub(crate) closed: AtomicBool,
    /// Handed to timer callbacks so a dropped port cancels them.
    pub(crate) weak: Weak<PortInner>,
}

impl PortInner {
    pub(crate) fn client(&self, client_type: ClientType) -> Option<Arc<Client>> {
        self.clients
            .lock()
            .iter()
            .find(|c| c.client_type() == client_type)
            .cloned()
    }
}

/// Management datagram transactions on one HCA port.
///
/// Cloning is cheap; clones share the same clients and timers. Timer
/// callbacks hold only a weak reference, so dropping every clone stops
/// them from acting.
#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl Port {
    /// Create a port that sends through `transport` and schedules on
    /// `timers`. The caller drives `timers`, with a
    /// [`crate::timer::TimerDriver`] or by hand.
    pub fn new(config: IbmfConfig, hca: HcaInfo, transport: Arc<dyn Transport>, timers: Arc<TimerQueue>) -> Self {
        let inner = Arc::new_cyclic(|weak| PortInner {
            config,
            hca,
            transport,
            timers,
            clients: Mutex::new(Vec::new()),
            next_client_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            weak: weak.clone(),
        });
        info!(
            vendor = inner.hca.id.vendor_id,
            device = inner.hca.id.device_id,
            port = inner.hca.port_num,
            loopback = inner.config.needs_dr_loopback(inner.hca.id),
            "port created"
        );
        Self { inner }
    }

    pub fn config(&self) -> &IbmfConfig {
        &self.inner.config
    }

    pub fn hca(&self) -> &HcaInfo {
        &self.inner.hca
    }

    pub fn timers(&self) -> &Arc<TimerQueue> {
        &self.inner.timers
    }

    /// Register a client. One client per type.
    pub fn register(&self, client_type: ClientType, opts: ClientOptions) -> Result<Arc<Client>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Shutdown);
        }
        if !client_type.is_valid() {
            return Err(Error::InvalidArgument("not a vendor management class"));
        }
        let mut clients = self.inner.clients.lock();
        if clients.iter().any(|c| c.client_type() == client_type) {
            return Err(Error::ClientExists(client_type));
        }
        let id = self.inner.next_client_id.fetch_add(1, Ordering::Relaxed);
        let client = Arc::new(Client::new(id, client_type, opts));
        clients.push(client.clone());
        debug!(id, ?client_type, "client registered");
        Ok(client)
    }

    /// Unregister a client. Refused while it holds messages or an
    /// unsolicited callback is running.
    pub fn unregister(&self, client: &Arc<Client>) -> Result<()> {
        let mut clients = self.inner.clients.lock();
        let Some(pos) = clients.iter().position(|c| Arc::ptr_eq(c, client)) else {
            return Err(Error::ClientNotFound(client.client_type()));
        };
        if client.msgs_alloced() > 0 || client.recv_cb_active() > 0 || client.registry_len() > 0 {
            return Err(Error::Busy("client has outstanding messages"));
        }
        clients.remove(pos);
        debug!(id = client.id(), client_type = ?client.client_type(), "client unregistered");
        Ok(())
    }

    /// The registered client of `client_type`.
    pub fn client(&self, client_type: ClientType) -> Option<Arc<Client>> {
        self.inner.client(client_type)
    }

    /// Allocate a message context for `client`.
    pub fn alloc_msg(&self, client: &Arc<Client>) -> Result<Arc<Message>> {
        if !client.reserve_alloc(self.inner.config.max_msgs_per_client) {
            return Err(Error::NoResources("message contexts"));
        }
        Ok(Message::new(client, MsgFlags::INIT))
    }

    /// Return a message context. Refused while a transaction still holds it.
    pub fn free_msg(&self, client: &Arc<Client>, msg: Arc<Message>) -> Result<()> {
        match msg.client() {
            Some(owner) if Arc::ptr_eq(&owner, client) => {}
            _ => return Err(Error::InvalidArgument("message belongs to another client")),
        }
        {
            let mut st = msg.state.lock();
            if st.flags.contains(MsgFlags::BUSY) || st.on_registry || st.ref_cnt > 0 {
                return Err(Error::Busy("message is in a transaction"));
            }
            if st.flags.contains(MsgFlags::UNINIT) {
                return Err(Error::InvalidArgument("message already freed"));
            }
            st.flags = MsgFlags::UNINIT;
            st.recv = None;
            st.callback = None;
        }
        client.release_alloc();
        Ok(())
    }

    /// Start a transaction for `msg`.
    ///
    /// A non-blocking call returns once the first datagram (or RMPP window)
    /// has been handed to the transport; the outcome arrives later through
    /// the callback in `opts`. A blocking call returns after the
    /// transaction finished; read the outcome from [`Message::status`].
    pub fn msg_transport(&self, client: &Arc<Client>, msg: &Arc<Message>, opts: TransportOpts) -> Result<()> {
        self.inner.msg_transport(client, msg, opts)
    }

    /// Feed a datagram received on this port.
    pub fn recv_mad(&self, mad: &[u8], addr: AddrInfo, global: Option<GlobalRoute>) -> Result<()> {
        self.inner.recv_mad(mad, addr, global)
    }

    /// Refuse new transactions and inbound datagrams. Pending timers still
    /// run so in-flight transactions finish.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            info!(port = self.inner.hca.port_num, "port closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<PortInner> {
        &self.inner
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("hca", &self.inner.hca)
            .field("clients", &self.inner.clients.lock().len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
