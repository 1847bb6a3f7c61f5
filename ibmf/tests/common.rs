//! Common test utilities for IBMF integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use parking_lot::Mutex;

use ibmf::config::{DEVICE_TAVOR, VENDOR_MELLANOX};
use ibmf::mad::{self, MadHdr, RmppHdr, RmppType};
use ibmf::timer::{ManualClock, TimerQueue};
use ibmf::{
    AddrInfo, Error, HcaInfo, IbmfConfig, Message, MsgBufs, OutboundMad, Port, Transport, TransStatus,
};

pub const LOCAL_LID: u16 = 1;
pub const REMOTE_LID: u16 = 7;

/// Install a fmt subscriber that writes through the test harness.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Replies the peer produces for one outbound datagram.
pub type Responder = Arc<dyn Fn(&OutboundMad) -> Vec<Vec<u8>> + Send + Sync>;

/// Transport that records every datagram and can answer synchronously.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<OutboundMad>>,
    responder: Mutex<Option<Responder>>,
    port: Mutex<Option<Port>>,
    fail: AtomicBool,
}

impl MockTransport {
    pub fn sent(&self) -> Vec<OutboundMad> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn last(&self) -> Option<OutboundMad> {
        self.sent.lock().last().cloned()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    fn send(&self, mad: &OutboundMad) -> ibmf::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Transport("injected failure".to_string()));
        }
        self.sent.lock().push(mad.clone());
        let responder = self.responder.lock().clone();
        let port = self.port.lock().clone();
        if let (Some(responder), Some(port)) = (responder, port) {
            for reply in responder(mad) {
                let _ = port.recv_mad(&reply, mad.addr, None);
            }
        }
        Ok(())
    }
}

/// A port on a manual clock with a mock transport.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub timers: Arc<TimerQueue>,
    pub transport: Arc<MockTransport>,
    pub port: Port,
}

impl Harness {
    /// A port on an adapter that loops directed-route MADs back itself.
    pub fn new(config: IbmfConfig) -> Self {
        Self::with_hca(config, HcaInfo::new(0x1234, 0x0001, 1, LOCAL_LID))
    }

    /// A port on an adapter that needs software loopback.
    pub fn quirky(config: IbmfConfig) -> Self {
        Self::with_hca(config, HcaInfo::new(VENDOR_MELLANOX, DEVICE_TAVOR, 1, LOCAL_LID))
    }

    pub fn with_hca(config: IbmfConfig, hca: HcaInfo) -> Self {
        init_tracing();
        let clock = Arc::new(ManualClock::new());
        let timers = Arc::new(TimerQueue::new(clock.clone()));
        let transport = Arc::new(MockTransport::default());
        let port = Port::new(config, hca, transport.clone(), timers.clone());
        Self {
            clock,
            timers,
            transport,
            port,
        }
    }

    /// Answer outbound datagrams from inside `send`.
    pub fn set_responder(&self, responder: impl Fn(&OutboundMad) -> Vec<Vec<u8>> + Send + Sync + 'static) {
        *self.transport.responder.lock() = Some(Arc::new(responder));
        *self.transport.port.lock() = Some(self.port.clone());
    }

    /// Move time forward and fire whatever came due.
    pub fn advance_ms(&self, ms: u64) -> usize {
        self.clock.advance(ms * 1000);
        self.timers.run_expired()
    }

    /// Advance in 1 ms steps.
    pub fn run_for_ms(&self, ms: u64) {
        for _ in 0..ms {
            self.advance_ms(1);
        }
    }

    pub fn deliver(&self, mad: &[u8]) -> ibmf::Result<()> {
        self.port.recv_mad(mad, remote_addr(), None)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        // The responder holds a port clone.
        *self.transport.port.lock() = None;
        *self.transport.responder.lock() = None;
    }
}

/// Response interval 11 ms.
pub fn fast_config() -> IbmfConfig {
    IbmfConfig::default().with_rtv_us(10_000).with_rttv_us(1_000)
}

pub fn remote_addr() -> AddrInfo {
    AddrInfo {
        remote_lid: REMOTE_LID,
        remote_qpn: 1,
        q_key: 0x8001_0000,
        p_key: 0xffff,
        sl: 0,
    }
}

pub fn send_bufs(class: u8, method: u8, tid: u64, attr: u16, data: &[u8]) -> MsgBufs {
    let (cl_hdr_sz, _) = mad::class_hdr_sz_off(class);
    MsgBufs::new(MadHdr::new(class, 1, method, tid, attr), vec![0; cl_hdr_sz], data.to_vec())
}

/// A zero-hop directed-route SMP with a recognizable class header.
pub fn dr_bufs(method: u8, tid: u64, attr: u16, data: &[u8]) -> MsgBufs {
    let mut hdr = MadHdr::new(mad::CLASS_SUBN_DIRECT_ROUTE, 1, method, tid, attr);
    hdr.set_hops(0, 0);
    let cl_hdr = (0..40u8).collect();
    MsgBufs::new(hdr, cl_hdr, data.to_vec())
}

/// A single-packet datagram.
pub fn mad_bytes(class: u8, method: u8, tid: u64, attr: u16, data: &[u8]) -> Vec<u8> {
    mad::build_mad(&MadHdr::new(class, 1, method, tid, attr), None, &[], data)
}

/// The method a peer answers `method` with.
pub fn reply_method(method: u8) -> u8 {
    match method {
        mad::METHOD_SET => mad::METHOD_GET_RESP,
        mad::METHOD_TRAP => mad::METHOD_TRAP_REPRESS,
        m => m | mad::METHOD_RESP_BIT,
    }
}

/// A response to `frame` carrying `data`.
pub fn response_to(frame: &OutboundMad, data: &[u8]) -> Vec<u8> {
    let req = MadHdr::from_bytes(&frame.bytes).expect("outbound frame has a valid header");
    let mut hdr = req;
    hdr.method = reply_method(req.method);
    mad::build_mad(&hdr, None, &[], data)
}

pub fn sa_hdr(method: u8, tid: u64) -> MadHdr {
    MadHdr::new(mad::CLASS_SUBN_ADM, 2, method, tid, 0x0011)
}

/// An SA RMPP control frame.
pub fn rmpp_ctrl(method: u8, tid: u64, ty: RmppType, status: u8, segnum: u32, nwl: u32) -> Vec<u8> {
    let rmpp = RmppHdr::new(ty, 0, status, segnum, nwl);
    mad::build_mad(&sa_hdr(method, tid), Some(&rmpp), &[], &[])
}

/// SA DATA segment `segnum` of `payload` as a peer would send it.
pub fn rmpp_data(method: u8, tid: u64, payload: &[u8], segnum: u32, cl_hdr: &[u8]) -> Vec<u8> {
    let cap = mad::class_data_capacity(mad::CLASS_SUBN_ADM);
    let (cl_hdr_sz, _) = mad::class_hdr_sz_off(mad::CLASS_SUBN_ADM);
    let num_pkts = payload.len().div_ceil(cap).max(1) as u32;
    let mut flags = 0;
    let mut pyldlen = 0;
    if segnum == 1 {
        flags |= mad::rmpp_flags::FIRST;
        pyldlen = (payload.len() + num_pkts as usize * cl_hdr_sz) as u32;
    }
    if segnum == num_pkts {
        flags |= mad::rmpp_flags::LAST;
        pyldlen = (payload.len() - (num_pkts as usize - 1) * cap + cl_hdr_sz) as u32;
    }
    let start = (segnum as usize - 1) * cap;
    let end = (start + cap).min(payload.len());
    let rmpp = RmppHdr::new(RmppType::Data, flags, mad::rmpp_status::NORMAL, segnum, pyldlen);
    mad::build_mad(&sa_hdr(method, tid), Some(&rmpp), cl_hdr, &payload[start..end])
}

/// Collects `(tid, status)` of every finished transaction.
#[derive(Clone, Default)]
pub struct Completions(Arc<Mutex<Vec<(u64, TransStatus)>>>);

impl Completions {
    pub fn new() -> Self {
        Self::default()
    }

    /// A per-transaction callback that records into this log.
    pub fn callback(&self) -> impl FnOnce(Arc<Message>) + Send + 'static {
        let log = self.0.clone();
        move |msg: Arc<Message>| {
            let entry = (msg.tid(), msg.status());
            log.lock().push(entry);
        }
    }

    pub fn all(&self) -> Vec<(u64, TransStatus)> {
        self.0.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn statuses(&self) -> Vec<TransStatus> {
        self.0.lock().iter().map(|(_, s)| *s).collect()
    }
}
