//! Per-slot and process-wide configuration.
//!
//! Parsing the `[Settings]`/`[ril_X]` configuration file is the
//! embedder's job; these are the parsed values with the documented
//! defaults. A missing file maps to [`ManagerConfig::default_slots`].

use embassy_time::Duration;
use heapless::{String, Vec};

use crate::ril::pref_net_type;

pub const MAX_SLOTS: usize = 4;

pub const DEFAULT_SOCKET: &str = "/dev/socket/rild";
pub const DEFAULT_SOCKET2: &str = "/dev/socket/rild2";
pub const DEFAULT_SUB: &str = "SUB1";

/// Radio access mode, ordered so that the numeric minimum of two modes
/// is the more restrictive one. `Any` means "no clamp".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum AccessMode {
    #[default]
    Any = 0,
    Gsm = 1,
    Umts = 2,
    Lte = 4,
}

impl AccessMode {
    /// Combines the user preference with an external clamp; zero (`Any`)
    /// on either side means "no limit from this side".
    pub fn clamp(self, max: AccessMode) -> AccessMode {
        match (self, max) {
            (AccessMode::Any, m) => m,
            (m, AccessMode::Any) => m,
            (a, b) => a.min(b),
        }
    }

    pub fn bit(self) -> u32 {
        self as u32
    }
}

/// Set of radio technologies a slot is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TechMask(pub u32);

impl TechMask {
    pub const NONE: TechMask = TechMask(0);
    pub const GSM: TechMask = TechMask(AccessMode::Gsm as u32);
    pub const UMTS: TechMask = TechMask(AccessMode::Umts as u32);
    pub const LTE: TechMask = TechMask(AccessMode::Lte as u32);
    pub const ALL: TechMask =
        TechMask(AccessMode::Gsm as u32 | AccessMode::Umts as u32 | AccessMode::Lte as u32);

    pub fn contains(self, mode: AccessMode) -> bool {
        self.0 & mode.bit() != 0
    }

    /// Parses the comma-separated `technologies` config value.
    pub fn parse(value: &str) -> Option<TechMask> {
        if value.trim() == "all" {
            return Some(TechMask::ALL);
        }
        let mut mask = TechMask::NONE;
        for item in value.split(',') {
            match item.trim() {
                "" => {}
                "gsm" => mask.0 |= TechMask::GSM.0,
                "umts" => mask.0 |= TechMask::UMTS.0,
                "lte" => mask.0 |= TechMask::LTE.0,
                _ => return None,
            }
        }
        Some(mask)
    }
}

impl Default for TechMask {
    fn default() -> Self {
        TechMask::ALL
    }
}

/// Whether ALLOW_DATA is actually sent to this slot. `Auto` resolves
/// against the peer protocol version once it is known (the request
/// appeared in RIL v10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AllowData {
    #[default]
    Auto,
    Enabled,
    Disabled,
}

/// Forced data call record layout; `Auto` trusts the version field of
/// the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataCallFormat {
    #[default]
    Auto,
    V6,
    V9,
    V11,
}

impl DataCallFormat {
    pub fn version(self) -> Option<u32> {
        match self {
            DataCallFormat::Auto => None,
            DataCallFormat::V6 => Some(6),
            DataCallFormat::V9 => Some(9),
            DataCallFormat::V11 => Some(11),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataOptions {
    pub allow_data: AllowData,
    pub data_call_format: DataCallFormat,
    /// Silent retries of a SETUP_DATA_CALL that failed with the
    /// unspecified cause.
    pub data_call_retry_limit: u32,
    /// Delay before the second and subsequent silent retries.
    pub data_call_retry_delay: Duration,
}

impl Default for DataOptions {
    fn default() -> Self {
        Self {
            allow_data: AllowData::Auto,
            data_call_format: DataCallFormat::Auto,
            data_call_retry_limit: 4,
            data_call_retry_delay: Duration::from_millis(200),
        }
    }
}

/// Everything configurable per `[ril_X]` section.
#[derive(Debug, Clone)]
pub struct SlotConfig {
    pub slot: u32,
    /// Short display name used as the log prefix ("RIL1", ...).
    pub name: String<16>,
    /// Socket path for the embedder's connector.
    pub socket: String<64>,
    /// Multi-SIM subscription selector sent once after connect.
    pub sub: Option<String<8>>,
    /// How long the manager waits for this slot at start-up.
    pub start_timeout: Duration,
    /// Default per-request timeout; `None` leaves requests without a
    /// deadline unless they set their own.
    pub req_timeout: Option<Duration>,
    pub techs: TechMask,
    /// Wire value used for SET_PREFERRED_NETWORK_TYPE when LTE is
    /// selected.
    pub lte_network_mode: i32,
    pub network_mode_timeout: Duration,
    /// Use the v9 request code for UICC subscription on old peers.
    pub uicc_workaround: bool,
    /// Probe PIN/PUK retry counters with an empty-pin request.
    pub empty_pin_query: bool,
    pub enable_voicecall: bool,
    pub enable_cellbroadcast: bool,
    pub query_available_band_mode: bool,
    /// Query GET_IMEI/GET_IMEISV instead of DEVICE_IDENTITY.
    pub legacy_imei_query: bool,
    pub local_hangup_reasons: Vec<i32, 8>,
    pub remote_hangup_reasons: Vec<i32, 8>,
    pub ecclist_file: Option<String<64>>,
    /// Vendor driver name ("", "mtk", "mtk1", "mtk2").
    pub vendor: String<16>,
    pub data: DataOptions,
}

impl SlotConfig {
    pub fn new(slot: u32, socket: &str) -> Self {
        let mut cfg = Self::default();
        cfg.slot = slot;
        cfg.socket = String::try_from(socket).unwrap_or_default();
        cfg
    }
}

impl Default for SlotConfig {
    fn default() -> Self {
        Self {
            slot: 0,
            name: String::new(),
            socket: String::try_from(DEFAULT_SOCKET).unwrap_or_default(),
            sub: None,
            start_timeout: Duration::from_secs(20),
            req_timeout: None,
            techs: TechMask::ALL,
            lte_network_mode: pref_net_type::LTE_GSM_WCDMA,
            network_mode_timeout: Duration::from_secs(20),
            uicc_workaround: true,
            empty_pin_query: true,
            enable_voicecall: true,
            enable_cellbroadcast: true,
            query_available_band_mode: true,
            legacy_imei_query: false,
            local_hangup_reasons: Vec::new(),
            remote_hangup_reasons: Vec::new(),
            ecclist_file: None,
            vendor: String::new(),
            data: DataOptions::default(),
        }
    }
}

/// Radio capability probing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SetRadioCap {
    #[default]
    Auto,
    Enabled,
    Disabled,
}

/// `[Settings]` section.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Only one slot at a time gets non-GSM technologies.
    pub handover_3g_lte: bool,
    pub set_radio_cap: SetRadioCap,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            handover_3g_lte: true,
            set_radio_cap: SetRadioCap::Auto,
        }
    }
}

impl ManagerConfig {
    /// Slot layout used when no configuration file exists: one or two
    /// slots on the stock rild sockets.
    pub fn default_slots(multisim: bool) -> Vec<SlotConfig, MAX_SLOTS> {
        let mut slots = Vec::new();
        if multisim {
            let mut first = SlotConfig::new(0, DEFAULT_SOCKET);
            first.sub = String::try_from(DEFAULT_SUB).ok();
            first.name = String::try_from("RIL1").unwrap_or_default();
            let mut second = SlotConfig::new(1, DEFAULT_SOCKET2);
            second.sub = String::try_from("SUB2").ok();
            second.name = String::try_from("RIL2").unwrap_or_default();
            slots.push(first).ok();
            slots.push(second).ok();
        } else {
            slots.push(SlotConfig::new(0, DEFAULT_SOCKET)).ok();
        }
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tech_mask_parse() {
        assert_eq!(TechMask::parse("all"), Some(TechMask::ALL));
        assert_eq!(TechMask::parse("gsm"), Some(TechMask::GSM));
        assert_eq!(
            TechMask::parse("gsm,umts"),
            Some(TechMask(TechMask::GSM.0 | TechMask::UMTS.0))
        );
        assert_eq!(TechMask::parse("gsm, lte"), Some(TechMask(0x5)));
        assert_eq!(TechMask::parse("cdma"), None);
    }

    #[test]
    fn access_mode_clamp() {
        assert_eq!(AccessMode::Lte.clamp(AccessMode::Gsm), AccessMode::Gsm);
        assert_eq!(AccessMode::Gsm.clamp(AccessMode::Lte), AccessMode::Gsm);
        assert_eq!(AccessMode::Any.clamp(AccessMode::Umts), AccessMode::Umts);
        assert_eq!(AccessMode::Lte.clamp(AccessMode::Any), AccessMode::Lte);
        assert_eq!(AccessMode::Any.clamp(AccessMode::Any), AccessMode::Any);
    }

    #[test]
    fn slot_defaults() {
        let cfg = SlotConfig::default();
        assert_eq!(cfg.lte_network_mode, pref_net_type::LTE_GSM_WCDMA);
        assert_eq!(cfg.start_timeout, Duration::from_secs(20));
        assert_eq!(cfg.data.data_call_retry_limit, 4);
        assert!(cfg.uicc_workaround);
        assert!(!cfg.legacy_imei_query);
    }

    #[test]
    fn default_slot_layout() {
        let single = ManagerConfig::default_slots(false);
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].socket, DEFAULT_SOCKET);
        assert!(single[0].sub.is_none());

        let dual = ManagerConfig::default_slots(true);
        assert_eq!(dual.len(), 2);
        assert_eq!(dual[1].socket, DEFAULT_SOCKET2);
        assert_eq!(dual[0].sub.as_deref(), Some(DEFAULT_SUB));
    }
}
