//! Management datagram (MAD) layout.
//!
//! Every MAD is a fixed 256-byte datagram:
//!
//! ```text
//! Offset  Size  Field
//! 0       24    common MAD header (MadHdr)
//! 24      12    RMPP header (classes that carry one)
//! ..      ..    class header (size depends on the class)
//! ..      ..    class data, zero padded to 256 bytes
//! ```
//!
//! Only the fields the transaction core inspects are decoded; everything
//! else is carried as opaque bytes.

use crate::error::{Error, Result};

/// Size of a MAD on the wire.
pub const MAD_SIZE: usize = 256;

/// Size of the common MAD header.
pub const MAD_HDR_SIZE: usize = 24;

/// Size of the RMPP header.
pub const RMPP_HDR_SIZE: usize = 12;

/// Base version of every MAD.
pub const MAD_BASE_VERSION: u8 = 1;

/// Response bit of the method field.
pub const METHOD_RESP_BIT: u8 = 0x80;

pub const METHOD_GET: u8 = 0x01;
pub const METHOD_SET: u8 = 0x02;
pub const METHOD_SEND: u8 = 0x03;
pub const METHOD_TRAP: u8 = 0x05;
pub const METHOD_REPORT: u8 = 0x06;
pub const METHOD_TRAP_REPRESS: u8 = 0x07;
pub const METHOD_GET_TABLE: u8 = 0x12;
pub const METHOD_GET_RESP: u8 = METHOD_GET | METHOD_RESP_BIT;
pub const METHOD_REPORT_RESP: u8 = METHOD_REPORT | METHOD_RESP_BIT;
pub const METHOD_GET_TABLE_RESP: u8 = METHOD_GET_TABLE | METHOD_RESP_BIT;

pub const CLASS_SUBN_LID_ROUTED: u8 = 0x01;
pub const CLASS_SUBN_ADM: u8 = 0x03;
pub const CLASS_PERF: u8 = 0x04;
pub const CLASS_BM: u8 = 0x05;
pub const CLASS_DEV_MGT: u8 = 0x06;
pub const CLASS_COMM_MGT: u8 = 0x07;
pub const CLASS_SNMP: u8 = 0x08;
pub const CLASS_VENDOR_09: u8 = 0x09;
pub const CLASS_VENDOR_0F: u8 = 0x0F;
pub const CLASS_VENDOR_30: u8 = 0x30;
pub const CLASS_VENDOR_4F: u8 = 0x4F;
pub const CLASS_SUBN_DIRECT_ROUTE: u8 = 0x81;

/// SMInfo attribute.
pub const ATTR_SM_INFO: u16 = 0x0020;

/// Class header size of SMPs (M_Key, DR LIDs, reserved).
const CL_HDR_SZ_SMP: usize = 40;
/// Class header size of SA MADs (SM_Key, attribute offset, component mask).
const CL_HDR_SZ_SA: usize = 20;
/// Class header size of Perf/BM MADs.
const CL_HDR_SZ_RESERVED: usize = 40;
/// Class header size of vendor MADs with an OUI.
const CL_HDR_SZ_VENDOR_OUI: usize = 4;

/// Whether `method` is a response.
#[inline]
pub fn is_response(method: u8) -> bool {
    method & METHOD_RESP_BIT != 0
}

/// Whether `method` answers an earlier request. TrapRepress carries no
/// response bit but is the reply to a Trap.
#[inline]
pub fn is_reply(method: u8) -> bool {
    is_response(method) || method == METHOD_TRAP_REPRESS
}

/// Whether a datagram with method `reply` can answer a request sent with
/// method `request`. GetResp answers both Get and Set.
pub fn answers(request: u8, reply: u8) -> bool {
    match reply {
        METHOD_GET_RESP => request == METHOD_GET || request == METHOD_SET,
        METHOD_TRAP_REPRESS => request == METHOD_TRAP,
        _ => is_response(reply) && !is_response(request) && reply & !METHOD_RESP_BIT == request,
    }
}

/// Whether MADs of `method` are delivered to the manager side of a class
/// (responses, traps and reports) rather than the agent side.
#[inline]
pub fn targets_manager(method: u8) -> bool {
    is_response(method) || method == METHOD_TRAP || method == METHOD_REPORT
}

/// Whether `class` is a subnet management class.
#[inline]
pub fn is_subn_class(class: u8) -> bool {
    class == CLASS_SUBN_LID_ROUTED || class == CLASS_SUBN_DIRECT_ROUTE
}

/// Whether MADs of `class` carry an RMPP header.
#[inline]
pub fn class_has_rmpp(class: u8) -> bool {
    class == CLASS_SUBN_ADM || (CLASS_VENDOR_30..=CLASS_VENDOR_4F).contains(&class)
}

/// Class header size and its offset from the end of the common MAD header.
pub fn class_hdr_sz_off(class: u8) -> (usize, usize) {
    match class {
        CLASS_SUBN_LID_ROUTED | CLASS_SUBN_DIRECT_ROUTE => (CL_HDR_SZ_SMP, 0),
        CLASS_SUBN_ADM => (CL_HDR_SZ_SA, RMPP_HDR_SIZE),
        CLASS_PERF | CLASS_BM => (CL_HDR_SZ_RESERVED, 0),
        CLASS_VENDOR_30..=CLASS_VENDOR_4F => (CL_HDR_SZ_VENDOR_OUI, RMPP_HDR_SIZE),
        _ => (0, 0),
    }
}

/// Number of class data bytes that fit in a single MAD of `class`.
pub fn class_data_capacity(class: u8) -> usize {
    let (hdr_sz, hdr_off) = class_hdr_sz_off(class);
    MAD_SIZE - MAD_HDR_SIZE - hdr_off - hdr_sz
}

/// Common MAD header (24 bytes, big endian on the wire).
///
/// For directed-route SMPs the 16-bit status word holds the D bit and a
/// 15-bit status, and the class-specific word holds hop pointer and hop
/// count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MadHdr {
    pub base_version: u8,
    pub mgmt_class: u8,
    pub class_version: u8,
    /// R bit and method.
    pub method: u8,
    pub status: u16,
    pub class_specific: u16,
    pub tid: u64,
    pub attr_id: u16,
    pub attr_mod: u32,
}

impl MadHdr {
    /// Create a header with the base version filled in.
    pub fn new(mgmt_class: u8, class_version: u8, method: u8, tid: u64, attr_id: u16) -> Self {
        Self {
            base_version: MAD_BASE_VERSION,
            mgmt_class,
            class_version,
            method,
            tid,
            attr_id,
            ..Default::default()
        }
    }

    /// Directed-route hop count.
    #[inline]
    pub fn hop_count(&self) -> u8 {
        (self.class_specific & 0xff) as u8
    }

    /// Directed-route hop pointer.
    #[inline]
    pub fn hop_pointer(&self) -> u8 {
        (self.class_specific >> 8) as u8
    }

    /// Set directed-route hop pointer and hop count.
    pub fn set_hops(&mut self, hop_pointer: u8, hop_count: u8) {
        self.class_specific = ((hop_pointer as u16) << 8) | hop_count as u16;
    }

    /// Whether this is a zero-hop directed-route SMP.
    #[inline]
    pub fn is_zero_hop_dr(&self) -> bool {
        self.mgmt_class == CLASS_SUBN_DIRECT_ROUTE && self.hop_count() == 0
    }

    /// Serialize into `buf[..MAD_HDR_SIZE]`.
    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= MAD_HDR_SIZE);
        buf[0] = self.base_version;
        buf[1] = self.mgmt_class;
        buf[2] = self.class_version;
        buf[3] = self.method;
        buf[4..6].copy_from_slice(&self.status.to_be_bytes());
        buf[6..8].copy_from_slice(&self.class_specific.to_be_bytes());
        buf[8..16].copy_from_slice(&self.tid.to_be_bytes());
        buf[16..18].copy_from_slice(&self.attr_id.to_be_bytes());
        buf[18..20].fill(0);
        buf[20..24].copy_from_slice(&self.attr_mod.to_be_bytes());
    }

    /// Serialize into a new array.
    pub fn to_bytes(&self) -> [u8; MAD_HDR_SIZE] {
        let mut buf = [0u8; MAD_HDR_SIZE];
        self.write_to(&mut buf);
        buf
    }

    /// Parse from the start of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MAD_HDR_SIZE {
            return Err(Error::InvalidArgument("MAD shorter than its header"));
        }
        let hdr = Self {
            base_version: bytes[0],
            mgmt_class: bytes[1],
            class_version: bytes[2],
            method: bytes[3],
            status: u16::from_be_bytes([bytes[4], bytes[5]]),
            class_specific: u16::from_be_bytes([bytes[6], bytes[7]]),
            tid: u64::from_be_bytes(bytes[8..16].try_into().unwrap_or_default()),
            attr_id: u16::from_be_bytes([bytes[16], bytes[17]]),
            attr_mod: u32::from_be_bytes([bytes[20], bytes[21], bytes[22], bytes[23]]),
        };
        if hdr.base_version != MAD_BASE_VERSION {
            return Err(Error::InvalidArgument("unsupported MAD base version"));
        }
        Ok(hdr)
    }
}

/// RMPP protocol version.
pub const RMPP_VERSION: u8 = 1;

/// RMPP frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RmppType {
    Data = 1,
    Ack = 2,
    Stop = 3,
    Abort = 4,
}

impl TryFrom<u8> for RmppType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RmppType::Data),
            2 => Ok(RmppType::Ack),
            3 => Ok(RmppType::Stop),
            4 => Ok(RmppType::Abort),
            _ => Err(Error::InvalidArgument("unknown RMPP type")),
        }
    }
}

/// RMPP status codes.
pub mod rmpp_status {
    pub const NORMAL: u8 = 0;
    pub const RESX: u8 = 1;
    /// Total time too long.
    pub const T2L: u8 = 118;
    /// Inconsistent last and payload length.
    pub const ILPL: u8 = 119;
    /// Inconsistent first and segment number.
    pub const IFSN: u8 = 120;
    /// Bad RMPP type.
    pub const BADT: u8 = 121;
    /// New window last too small.
    pub const W2S: u8 = 122;
    /// Segment number too big.
    pub const S2B: u8 = 123;
    /// Illegal status.
    pub const IS: u8 = 124;
    /// Unsupported version.
    pub const UNV: u8 = 125;
    /// Too many retries.
    pub const TMR: u8 = 126;
    /// Unspecified.
    pub const USP: u8 = 127;
}

/// RMPP flags (low bits of the response-time byte).
pub mod rmpp_flags {
    pub const ACTIVE: u8 = 0x01;
    pub const FIRST: u8 = 0x02;
    pub const LAST: u8 = 0x04;
}

/// RMPP header, located right after the common MAD header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RmppHdr {
    pub version: u8,
    /// Raw frame type; see [`RmppType`].
    pub rmpp_type: u8,
    /// Response time (upper five bits) and flags (lower three bits).
    pub resp_time_flags: u8,
    pub status: u8,
    pub segnum: u32,
    /// Payload length on the first/last DATA segment, new window last on
    /// ACKs.
    pub pyldlen_nwl: u32,
}

impl RmppHdr {
    /// Build a header for an outbound frame.
    pub fn new(rmpp_type: RmppType, flags: u8, status: u8, segnum: u32, pyldlen_nwl: u32) -> Self {
        Self {
            version: RMPP_VERSION,
            rmpp_type: rmpp_type as u8,
            resp_time_flags: flags | rmpp_flags::ACTIVE,
            status,
            segnum,
            pyldlen_nwl,
        }
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.resp_time_flags & 0x07
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.flags() & rmpp_flags::ACTIVE != 0
    }

    #[inline]
    pub fn is_first(&self) -> bool {
        self.flags() & rmpp_flags::FIRST != 0
    }

    #[inline]
    pub fn is_last(&self) -> bool {
        self.flags() & rmpp_flags::LAST != 0
    }

    /// Frame type, if it is one of the four defined types.
    #[inline]
    pub fn frame_type(&self) -> Option<RmppType> {
        RmppType::try_from(self.rmpp_type).ok()
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= RMPP_HDR_SIZE);
        buf[0] = self.version;
        buf[1] = self.rmpp_type;
        buf[2] = self.resp_time_flags;
        buf[3] = self.status;
        buf[4..8].copy_from_slice(&self.segnum.to_be_bytes());
        buf[8..12].copy_from_slice(&self.pyldlen_nwl.to_be_bytes());
    }

    /// Parse the RMPP header of a full MAD.
    pub fn from_mad(mad: &[u8]) -> Result<Self> {
        if mad.len() < MAD_HDR_SIZE + RMPP_HDR_SIZE {
            return Err(Error::InvalidArgument("MAD shorter than its RMPP header"));
        }
        let b = &mad[MAD_HDR_SIZE..MAD_HDR_SIZE + RMPP_HDR_SIZE];
        Ok(Self {
            version: b[0],
            rmpp_type: b[1],
            resp_time_flags: b[2],
            status: b[3],
            segnum: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
            pyldlen_nwl: u32::from_be_bytes([b[8], b[9], b[10], b[11]]),
        })
    }

    /// Whether the status is legal for the frame type.
    pub fn has_valid_status(&self) -> bool {
        use rmpp_status::*;
        let ty = self.frame_type();
        if matches!(ty, Some(RmppType::Data) | Some(RmppType::Ack)) && self.status != NORMAL {
            return false;
        }
        if self.status == RESX && ty != Some(RmppType::Stop) {
            return false;
        }
        if (T2L..=USP).contains(&self.status) && ty != Some(RmppType::Abort) {
            return false;
        }
        true
    }
}

/// Assemble one outbound MAD.
///
/// `rmpp` is written only for classes that carry an RMPP header; `cl_data`
/// is truncated to what fits.
pub fn build_mad(hdr: &MadHdr, rmpp: Option<&RmppHdr>, cl_hdr: &[u8], cl_data: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; MAD_SIZE];
    hdr.write_to(&mut buf);
    let (hdr_sz, hdr_off) = class_hdr_sz_off(hdr.mgmt_class);
    if let Some(rmpp) = rmpp {
        if hdr_off >= RMPP_HDR_SIZE {
            rmpp.write_to(&mut buf[MAD_HDR_SIZE..]);
        }
    }
    let cl_hdr_start = MAD_HDR_SIZE + hdr_off;
    let cl_hdr_len = cl_hdr.len().min(hdr_sz);
    buf[cl_hdr_start..cl_hdr_start + cl_hdr_len].copy_from_slice(&cl_hdr[..cl_hdr_len]);
    let data_start = cl_hdr_start + hdr_sz;
    let data_len = cl_data.len().min(MAD_SIZE - data_start);
    buf[data_start..data_start + data_len].copy_from_slice(&cl_data[..data_len]);
    buf
}

/// Split an inbound MAD into class header and class data slices.
pub fn split_mad(mad: &[u8]) -> (&[u8], &[u8]) {
    let class = mad.get(1).copied().unwrap_or(0);
    let (hdr_sz, hdr_off) = class_hdr_sz_off(class);
    let cl_hdr_start = (MAD_HDR_SIZE + hdr_off).min(mad.len());
    let data_start = (cl_hdr_start + hdr_sz).min(mad.len());
    (&mad[cl_hdr_start..data_start], &mad[data_start..])
}
