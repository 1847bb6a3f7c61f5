//! Send primitive and adapter identity.
//!
//! IBMF does not own a queue pair. The embedding code hands in a
//! [`Transport`] that puts one datagram on the wire, and feeds inbound
//! datagrams back through [`crate::Port::recv_mad`].

use crate::config::HcaId;
use crate::error::Result;
use crate::msg::{AddrInfo, GlobalRoute};

/// One outbound datagram and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMad {
    /// Exactly [`crate::mad::MAD_SIZE`] bytes.
    pub bytes: Vec<u8>,
    pub addr: AddrInfo,
    /// Present when the datagram needs a GRH.
    pub global: Option<GlobalRoute>,
}

/// The datagram send primitive.
///
/// `send` returning `Ok` counts as send completion. No IBMF lock is held
/// during the call, so an implementation may deliver the datagram (or a
/// reply) to [`crate::Port::recv_mad`] before returning.
pub trait Transport: Send + Sync {
    fn send(&self, mad: &OutboundMad) -> Result<()>;
}

/// The adapter and port an IBMF instance runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HcaInfo {
    pub id: HcaId,
    /// Port number on the adapter, starting at 1.
    pub port_num: u8,
    /// LID assigned to the port.
    pub local_lid: u16,
}

impl HcaInfo {
    pub fn new(vendor_id: u32, device_id: u16, port_num: u8, local_lid: u16) -> Self {
        Self {
            id: HcaId {
                vendor_id,
                device_id,
            },
            port_num,
            local_lid,
        }
    }
}
