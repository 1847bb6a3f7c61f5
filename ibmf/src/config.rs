//! Configuration types for IBMF.

/// PCI identity of a host channel adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HcaId {
    /// PCI vendor id.
    pub vendor_id: u32,
    /// PCI device id.
    pub device_id: u16,
}

/// Mellanox PCI vendor id.
pub const VENDOR_MELLANOX: u32 = 0x02c9;
/// Tavor (InfiniHost) device id.
pub const DEVICE_TAVOR: u16 = 0x5a44;
/// Arbel (InfiniHost III Ex) device id.
pub const DEVICE_ARBEL: u16 = 0x6278;

/// Port-wide configuration.
///
/// The retry and timeout constants are empirically tuned defaults, not
/// protocol invariants.
#[derive(Debug, Clone)]
pub struct IbmfConfig {
    /// Default response time value in microseconds.
    /// Default: 4_000_000 (4s)
    pub rtv_us: u64,
    /// Default round-trip time value in microseconds.
    /// Default: 100_000 (100ms)
    pub rttv_us: u64,
    /// Default number of retransmissions for a sequenced send.
    /// Default: 3
    pub retries: u32,
    /// Upper bound and fallback for the RMPP transaction timer, in
    /// microseconds.
    /// Default: 40_000_000 (40s)
    pub default_trans_to_us: u64,
    /// RMPP window size in segments.
    /// Default: 5
    pub rmpp_window: u32,
    /// Scale applied to a client transaction multiplier in 1..=10.
    /// Default: 7
    pub trans_multiplier_scale: u64,
    /// Multiplier used when the client's is outside 1..=10.
    /// Default: 4
    pub trans_multiplier_fallback: u64,
    /// Maximum number of message contexts a client may hold.
    /// Default: 4096
    pub max_msgs_per_client: usize,
    /// How long an RMPP receiver keeps absorbing duplicate segments after
    /// the last one, in microseconds. Zero uses `rtv_us + rttv_us`.
    /// Default: 0
    pub termination_wait_us: u64,
    /// Adapters that do not loop zero-hop directed-route MADs back
    /// internally.
    /// Default: Mellanox Tavor and Arbel
    pub loopback_quirks: Vec<HcaId>,
}

impl Default for IbmfConfig {
    fn default() -> Self {
        Self {
            rtv_us: 4_000_000,
            rttv_us: 100_000,
            retries: 3,
            default_trans_to_us: 40_000_000,
            rmpp_window: 5,
            trans_multiplier_scale: 7,
            trans_multiplier_fallback: 4,
            max_msgs_per_client: 4096,
            termination_wait_us: 0,
            loopback_quirks: vec![
                HcaId {
                    vendor_id: VENDOR_MELLANOX,
                    device_id: DEVICE_TAVOR,
                },
                HcaId {
                    vendor_id: VENDOR_MELLANOX,
                    device_id: DEVICE_ARBEL,
                },
            ],
        }
    }
}

impl IbmfConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default response time value.
    pub fn with_rtv_us(mut self, rtv_us: u64) -> Self {
        self.rtv_us = rtv_us;
        self
    }

    /// Set the default round-trip time value.
    pub fn with_rttv_us(mut self, rttv_us: u64) -> Self {
        self.rttv_us = rttv_us;
        self
    }

    /// Set the default retry count.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set the default transaction timeout.
    pub fn with_default_trans_to_us(mut self, trans_to_us: u64) -> Self {
        self.default_trans_to_us = trans_to_us;
        self
    }

    /// Set the RMPP window size.
    pub fn with_rmpp_window(mut self, rmpp_window: u32) -> Self {
        self.rmpp_window = rmpp_window.max(1);
        self
    }

    /// Set the transaction multiplier scale and fallback.
    pub fn with_trans_multipliers(mut self, scale: u64, fallback: u64) -> Self {
        self.trans_multiplier_scale = scale;
        self.trans_multiplier_fallback = fallback;
        self
    }

    /// Set the per-client message limit.
    pub fn with_max_msgs_per_client(mut self, max: usize) -> Self {
        self.max_msgs_per_client = max;
        self
    }

    /// Set the RMPP receiver termination wait.
    pub fn with_termination_wait_us(mut self, wait_us: u64) -> Self {
        self.termination_wait_us = wait_us;
        self
    }

    /// Replace the list of adapters needing software loopback.
    pub fn with_loopback_quirks(mut self, quirks: Vec<HcaId>) -> Self {
        self.loopback_quirks = quirks;
        self
    }

    /// Whether `hca` needs zero-hop directed-route MADs looped back in
    /// software.
    pub fn needs_dr_loopback(&self, hca: HcaId) -> bool {
        self.loopback_quirks.contains(&hca)
    }
}

/// Per-transaction retransmission parameters as supplied by a client.
///
/// A zero or `None` field means "use the port default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetransParams {
    /// Response time value in microseconds.
    pub rtv_us: u64,
    /// Round-trip time value in microseconds.
    pub rttv_us: u64,
    /// Explicit transaction timeout in microseconds.
    pub trans_to_us: u64,
    /// Number of retransmissions.
    pub retries: Option<u32>,
}

impl RetransParams {
    /// Fill unset fields from `config`.
    pub fn resolve(self, config: &IbmfConfig) -> Retrans {
        Retrans {
            rtv_us: if self.rtv_us == 0 { config.rtv_us } else { self.rtv_us },
            rttv_us: if self.rttv_us == 0 { config.rttv_us } else { self.rttv_us },
            trans_to_us: self.trans_to_us,
            retries: self.retries.unwrap_or(config.retries),
        }
    }
}

/// Resolved retransmission parameters stored on a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Retrans {
    /// Response time value in microseconds.
    pub rtv_us: u64,
    /// Round-trip time value in microseconds.
    pub rttv_us: u64,
    /// Transaction timeout. Zero means "compute from the RMPP context".
    pub trans_to_us: u64,
    /// Retransmissions allowed before the transaction times out.
    pub retries: u32,
}

impl Retrans {
    /// Response timer interval.
    #[inline]
    pub fn resp_interval_us(&self) -> u64 {
        self.rtv_us + self.rttv_us
    }
}
