//! Binary wire protocol of the vendor RIL daemon.
//!
//! Numeric codes follow AOSP's `hardware/ril/include/telephony/ril.h`.
//! Everything on the wire is little-endian except the frame length
//! prefix, which is big-endian.

pub mod frame;
pub mod parcel;

/// RIL request codes.
pub mod request {
    pub const GET_SIM_STATUS: u32 = 1;
    pub const ENTER_SIM_PIN: u32 = 2;
    pub const ENTER_SIM_PUK: u32 = 3;
    pub const ENTER_SIM_PIN2: u32 = 4;
    pub const ENTER_SIM_PUK2: u32 = 5;
    pub const CHANGE_SIM_PIN: u32 = 6;
    pub const CHANGE_SIM_PIN2: u32 = 7;
    pub const ENTER_NETWORK_DEPERSONALIZATION: u32 = 8;
    pub const GET_CURRENT_CALLS: u32 = 9;
    pub const DIAL: u32 = 10;
    pub const GET_IMSI: u32 = 11;
    pub const HANGUP: u32 = 12;
    pub const SIGNAL_STRENGTH: u32 = 19;
    pub const VOICE_REGISTRATION_STATE: u32 = 20;
    pub const DATA_REGISTRATION_STATE: u32 = 21;
    pub const OPERATOR: u32 = 22;
    pub const RADIO_POWER: u32 = 23;
    pub const SETUP_DATA_CALL: u32 = 27;
    pub const SIM_IO: u32 = 28;
    pub const GET_IMEI: u32 = 38;
    pub const GET_IMEISV: u32 = 39;
    pub const DEACTIVATE_DATA_CALL: u32 = 41;
    pub const QUERY_FACILITY_LOCK: u32 = 42;
    pub const SET_FACILITY_LOCK: u32 = 43;
    pub const BASEBAND_VERSION: u32 = 51;
    pub const DATA_CALL_LIST: u32 = 57;
    pub const OEM_HOOK_RAW: u32 = 59;
    pub const SCREEN_STATE: u32 = 61;
    pub const SET_PREFERRED_NETWORK_TYPE: u32 = 73;
    pub const GET_PREFERRED_NETWORK_TYPE: u32 = 74;
    pub const DEVICE_IDENTITY: u32 = 98;
    pub const GET_CELL_INFO_LIST: u32 = 109;
    pub const SET_UNSOL_CELL_INFO_LIST_RATE: u32 = 110;
    pub const SET_INITIAL_ATTACH_APN: u32 = 111;
    pub const SET_UICC_SUBSCRIPTION: u32 = 122;
    pub const ALLOW_DATA: u32 = 123;
    pub const SHUTDOWN: u32 = 129;
    pub const GET_RADIO_CAPABILITY: u32 = 130;
    pub const SET_RADIO_CAPABILITY: u32 = 131;

    /// On RIL v9 and older SET_UICC_SUBSCRIPTION had a different code.
    pub const V9_SET_UICC_SUBSCRIPTION: u32 = 115;
}

/// RIL unsolicited event codes.
pub mod unsol {
    pub const RESPONSE_BASE: u32 = 1000;
    pub const RADIO_STATE_CHANGED: u32 = 1000;
    pub const CALL_STATE_CHANGED: u32 = 1001;
    pub const VOICE_NETWORK_STATE_CHANGED: u32 = 1002;
    pub const NEW_SMS: u32 = 1003;
    pub const NEW_SMS_STATUS_REPORT: u32 = 1004;
    pub const NEW_SMS_ON_SIM: u32 = 1005;
    pub const NITZ_TIME_RECEIVED: u32 = 1008;
    pub const SIGNAL_STRENGTH: u32 = 1009;
    pub const DATA_CALL_LIST_CHANGED: u32 = 1010;
    pub const SUPP_SVC_NOTIFICATION: u32 = 1011;
    pub const STK_SESSION_END: u32 = 1012;
    pub const STK_PROACTIVE_COMMAND: u32 = 1013;
    pub const STK_EVENT_NOTIFY: u32 = 1014;
    pub const SIM_REFRESH: u32 = 1017;
    pub const CALL_RING: u32 = 1018;
    pub const SIM_STATUS_CHANGED: u32 = 1019;
    pub const RESTRICTED_STATE_CHANGED: u32 = 1023;
    pub const RIL_CONNECTED: u32 = 1034;
    pub const CELL_INFO_LIST: u32 = 1036;
    pub const UICC_SUBSCRIPTION_STATUS_CHANGED: u32 = 1038;
    pub const RADIO_CAPABILITY: u32 = 1042;
}

/// Peer-reported error codes (the `status` field of a response frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RilError {
    RadioNotAvailable,
    GenericFailure,
    PasswordIncorrect,
    SimPin2,
    SimPuk2,
    RequestNotSupported,
    Cancelled,
    SmsSendFailRetry,
    SimAbsent,
    SubscriptionNotAvailable,
    ModeNotSupported,
    FdnCheckFailure,
    IllegalSimOrMe,
    MissingResource,
    NoSuchElement,
    InvalidParameter,
    Other(i32),
}

impl RilError {
    pub fn code(self) -> i32 {
        match self {
            Self::RadioNotAvailable => 1,
            Self::GenericFailure => 2,
            Self::PasswordIncorrect => 3,
            Self::SimPin2 => 4,
            Self::SimPuk2 => 5,
            Self::RequestNotSupported => 6,
            Self::Cancelled => 7,
            Self::SmsSendFailRetry => 10,
            Self::SimAbsent => 11,
            Self::SubscriptionNotAvailable => 12,
            Self::ModeNotSupported => 13,
            Self::FdnCheckFailure => 14,
            Self::IllegalSimOrMe => 15,
            Self::MissingResource => 27,
            Self::NoSuchElement => 28,
            Self::InvalidParameter => 29,
            Self::Other(code) => code,
        }
    }
}

impl From<i32> for RilError {
    fn from(code: i32) -> Self {
        match code {
            1 => Self::RadioNotAvailable,
            2 => Self::GenericFailure,
            3 => Self::PasswordIncorrect,
            4 => Self::SimPin2,
            5 => Self::SimPuk2,
            6 => Self::RequestNotSupported,
            7 => Self::Cancelled,
            10 => Self::SmsSendFailRetry,
            11 => Self::SimAbsent,
            12 => Self::SubscriptionNotAvailable,
            13 => Self::ModeNotSupported,
            14 => Self::FdnCheckFailure,
            15 => Self::IllegalSimOrMe,
            27 => Self::MissingResource,
            28 => Self::NoSuchElement,
            29 => Self::InvalidParameter,
            other => Self::Other(other),
        }
    }
}

/// Terminal outcome of a submitted request.
///
/// `TimedOut` and `Cancelled` are local verdicts and never appear on the
/// wire; peer codes map onto `Ok`/`Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Status {
    Ok,
    TimedOut,
    Cancelled,
    Error(RilError),
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    pub fn radio_not_available(self) -> bool {
        self == Status::Error(RilError::RadioNotAvailable)
    }
}

impl From<i32> for Status {
    fn from(code: i32) -> Self {
        if code == 0 {
            Status::Ok
        } else {
            Status::Error(RilError::from(code))
        }
    }
}

/// Unsolicited radio state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RadioState {
    #[default]
    Off,
    Unavailable,
    SimNotReady,
    SimLockedOrAbsent,
    SimReady,
    RuimNotReady,
    RuimReady,
    RuimLockedOrAbsent,
    NvNotReady,
    NvReady,
    On,
}

impl RadioState {
    pub fn is_on(self) -> bool {
        self != RadioState::Off
    }
}

impl From<i32> for RadioState {
    fn from(v: i32) -> Self {
        match v {
            0 => Self::Off,
            2 => Self::SimNotReady,
            3 => Self::SimLockedOrAbsent,
            4 => Self::SimReady,
            5 => Self::RuimNotReady,
            6 => Self::RuimReady,
            7 => Self::RuimLockedOrAbsent,
            8 => Self::NvNotReady,
            9 => Self::NvReady,
            10 => Self::On,
            _ => Self::Unavailable,
        }
    }
}

/// Preferred network type, the wire value of [SG]ET_PREFERRED_NETWORK_TYPE.
pub mod pref_net_type {
    pub const GSM_WCDMA: i32 = 0;
    pub const GSM_ONLY: i32 = 1;
    pub const WCDMA: i32 = 2;
    pub const GSM_WCDMA_AUTO: i32 = 3;
    pub const LTE_CDMA_EVDO: i32 = 8;
    pub const LTE_GSM_WCDMA: i32 = 9;
    pub const LTE_CDMA_EVDO_GSM_WCDMA: i32 = 10;
    pub const LTE_ONLY: i32 = 11;
    pub const LTE_WCDMA: i32 = 12;
}

/// Radio technology as reported in registration responses.
pub mod radio_tech {
    pub const UNKNOWN: i32 = 0;
    pub const GPRS: i32 = 1;
    pub const EDGE: i32 = 2;
    pub const UMTS: i32 = 3;
    pub const HSDPA: i32 = 9;
    pub const HSUPA: i32 = 10;
    pub const HSPA: i32 = 11;
    pub const LTE: i32 = 14;
    pub const HSPAP: i32 = 15;
    pub const GSM: i32 = 16;
    pub const TD_SCDMA: i32 = 17;
    pub const DC_HSDPA: i32 = 18;
}

/// Access technology exposed upward, per 27.007 +CREG <AcT>.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AccessTech {
    Unknown,
    Gsm,
    Umts,
    Edge,
    Hsdpa,
    Hsupa,
    Hspa,
    Lte,
}

/// Maps a raw RIL radio technology to the exposed access technology.
pub fn access_tech_from_ril(tech: i32) -> AccessTech {
    match tech {
        radio_tech::GPRS | radio_tech::GSM => AccessTech::Gsm,
        radio_tech::EDGE => AccessTech::Edge,
        radio_tech::UMTS | radio_tech::TD_SCDMA => AccessTech::Umts,
        radio_tech::HSDPA | radio_tech::DC_HSDPA => AccessTech::Hsdpa,
        radio_tech::HSUPA => AccessTech::Hsupa,
        radio_tech::HSPA | radio_tech::HSPAP => AccessTech::Hspa,
        radio_tech::LTE => AccessTech::Lte,
        _ => AccessTech::Unknown,
    }
}

/// Registration status as exposed upward. Values above 10 encode the
/// "emergency only" convention and are folded back by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegStatus {
    NotRegistered,
    Registered,
    Searching,
    Denied,
    #[default]
    Unknown,
    Roaming,
}

impl From<i32> for RegStatus {
    fn from(v: i32) -> Self {
        match v {
            0 => Self::NotRegistered,
            1 => Self::Registered,
            2 => Self::Searching,
            3 => Self::Denied,
            5 => Self::Roaming,
            _ => Self::Unknown,
        }
    }
}

/// SIM card state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CardState {
    #[default]
    Absent,
    Present,
    Error,
}

impl From<i32> for CardState {
    fn from(v: i32) -> Self {
        match v {
            1 => Self::Present,
            2 => Self::Error,
            _ => Self::Absent,
        }
    }
}

/// SIM application type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AppType {
    #[default]
    Unknown,
    Sim,
    Usim,
    Ruim,
    Csim,
    Isim,
}

impl From<i32> for AppType {
    fn from(v: i32) -> Self {
        match v {
            1 => Self::Sim,
            2 => Self::Usim,
            3 => Self::Ruim,
            4 => Self::Csim,
            5 => Self::Isim,
            _ => Self::Unknown,
        }
    }
}

/// SIM application state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AppState {
    #[default]
    Unknown,
    Detected,
    Pin,
    Puk,
    SubscriptionPerso,
    Ready,
}

impl From<i32> for AppState {
    fn from(v: i32) -> Self {
        match v {
            // ILLEGAL (-1) still permits ICC operations, the modem is
            // merely in limited service.
            -1 | 5 => Self::Ready,
            1 => Self::Detected,
            2 => Self::Pin,
            3 => Self::Puk,
            4 => Self::SubscriptionPerso,
            _ => Self::Unknown,
        }
    }
}

/// SIM PIN state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinState {
    #[default]
    Unknown,
    EnabledNotVerified,
    EnabledVerified,
    Disabled,
    EnabledBlocked,
    EnabledPermBlocked,
}

impl From<i32> for PinState {
    fn from(v: i32) -> Self {
        match v {
            1 => Self::EnabledNotVerified,
            2 => Self::EnabledVerified,
            3 => Self::Disabled,
            4 => Self::EnabledBlocked,
            5 => Self::EnabledPermBlocked,
            _ => Self::Unknown,
        }
    }
}

/// SIM personalization substate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PersoSubstate {
    #[default]
    Unknown,
    InProgress,
    Ready,
    SimNetwork,
    SimNetworkSubset,
    SimCorporate,
    SimServiceProvider,
    SimSim,
    SimNetworkPuk,
    SimNetworkSubsetPuk,
    SimCorporatePuk,
    SimServiceProviderPuk,
    SimSimPuk,
    Other(i32),
}

impl From<i32> for PersoSubstate {
    fn from(v: i32) -> Self {
        match v {
            0 => Self::Unknown,
            1 => Self::InProgress,
            2 => Self::Ready,
            3 => Self::SimNetwork,
            4 => Self::SimNetworkSubset,
            5 => Self::SimCorporate,
            6 => Self::SimServiceProvider,
            7 => Self::SimSim,
            8 => Self::SimNetworkPuk,
            9 => Self::SimNetworkSubsetPuk,
            10 => Self::SimCorporatePuk,
            11 => Self::SimServiceProviderPuk,
            12 => Self::SimSimPuk,
            other => Self::Other(other),
        }
    }
}

/// UICC subscription activation argument.
pub mod uicc_sub {
    pub const DEACTIVATE: i32 = 0;
    pub const ACTIVATE: i32 = 1;
}

/// PDP authentication methods for SETUP_DATA_CALL.
pub mod auth {
    pub const NONE: i32 = 0;
    pub const PAP: i32 = 1;
    pub const CHAP: i32 = 2;
    pub const BOTH: i32 = 3;
}

/// DEACTIVATE_DATA_CALL reasons.
pub mod deact_reason {
    pub const NO_REASON: i32 = 0;
    pub const RADIO_SHUTDOWN: i32 = 1;
}

/// SETUP_DATA_CALL fail causes we interpret. Everything else is passed
/// through verbatim.
pub mod pdp_fail {
    pub const NONE: i32 = 0;
    pub const ERROR_UNSPECIFIED: i32 = 0xffff;
}

/// `active` field of a data call record.
pub mod data_call_state {
    pub const INACTIVE: i32 = 0;
    pub const LINK_DOWN: i32 = 1;
    pub const ACTIVE: i32 = 2;
}

/// RESTRICTED_STATE_CHANGED bitmask.
pub mod restricted_state {
    pub const CS_NORMAL: u32 = 0x01;
    pub const CS_EMERGENCY: u32 = 0x02;
    pub const CS_ALL: u32 = 0x04;
    pub const PS_ALL: u32 = 0x10;
}

/// Common retry cadence for requests that are re-issued until the modem
/// answers.
pub const RETRY_MS: u64 = 2000;

/// Printable name of a request code, vendor codes excluded.
pub fn request_name(code: u32) -> &'static str {
    match code {
        request::GET_SIM_STATUS => "GET_SIM_STATUS",
        request::ENTER_SIM_PIN => "ENTER_SIM_PIN",
        request::ENTER_SIM_PUK => "ENTER_SIM_PUK",
        request::ENTER_SIM_PIN2 => "ENTER_SIM_PIN2",
        request::ENTER_SIM_PUK2 => "ENTER_SIM_PUK2",
        request::CHANGE_SIM_PIN => "CHANGE_SIM_PIN",
        request::CHANGE_SIM_PIN2 => "CHANGE_SIM_PIN2",
        request::ENTER_NETWORK_DEPERSONALIZATION => "ENTER_NETWORK_DEPERSONALIZATION",
        request::GET_IMSI => "GET_IMSI",
        request::SIGNAL_STRENGTH => "SIGNAL_STRENGTH",
        request::VOICE_REGISTRATION_STATE => "VOICE_REGISTRATION_STATE",
        request::DATA_REGISTRATION_STATE => "DATA_REGISTRATION_STATE",
        request::OPERATOR => "OPERATOR",
        request::RADIO_POWER => "RADIO_POWER",
        request::SETUP_DATA_CALL => "SETUP_DATA_CALL",
        request::SIM_IO => "SIM_IO",
        request::GET_IMEI => "GET_IMEI",
        request::GET_IMEISV => "GET_IMEISV",
        request::DEACTIVATE_DATA_CALL => "DEACTIVATE_DATA_CALL",
        request::QUERY_FACILITY_LOCK => "QUERY_FACILITY_LOCK",
        request::SET_FACILITY_LOCK => "SET_FACILITY_LOCK",
        request::DATA_CALL_LIST => "DATA_CALL_LIST",
        request::SCREEN_STATE => "SCREEN_STATE",
        request::SET_PREFERRED_NETWORK_TYPE => "SET_PREFERRED_NETWORK_TYPE",
        request::GET_PREFERRED_NETWORK_TYPE => "GET_PREFERRED_NETWORK_TYPE",
        request::DEVICE_IDENTITY => "DEVICE_IDENTITY",
        request::SET_INITIAL_ATTACH_APN => "SET_INITIAL_ATTACH_APN",
        request::SET_UICC_SUBSCRIPTION => "SET_UICC_SUBSCRIPTION",
        request::ALLOW_DATA => "ALLOW_DATA",
        request::GET_RADIO_CAPABILITY => "GET_RADIO_CAPABILITY",
        request::SET_RADIO_CAPABILITY => "SET_RADIO_CAPABILITY",
        _ => "UNKNOWN",
    }
}

/// Printable name of an unsolicited event code, vendor codes excluded.
pub fn unsol_name(code: u32) -> &'static str {
    match code {
        unsol::RADIO_STATE_CHANGED => "RADIO_STATE_CHANGED",
        unsol::CALL_STATE_CHANGED => "CALL_STATE_CHANGED",
        unsol::VOICE_NETWORK_STATE_CHANGED => "VOICE_NETWORK_STATE_CHANGED",
        unsol::NITZ_TIME_RECEIVED => "NITZ_TIME_RECEIVED",
        unsol::SIGNAL_STRENGTH => "SIGNAL_STRENGTH",
        unsol::DATA_CALL_LIST_CHANGED => "DATA_CALL_LIST_CHANGED",
        unsol::SIM_REFRESH => "SIM_REFRESH",
        unsol::CALL_RING => "CALL_RING",
        unsol::SIM_STATUS_CHANGED => "SIM_STATUS_CHANGED",
        unsol::RESTRICTED_STATE_CHANGED => "RESTRICTED_STATE_CHANGED",
        unsol::RIL_CONNECTED => "RIL_CONNECTED",
        unsol::CELL_INFO_LIST => "CELL_INFO_LIST",
        unsol::UICC_SUBSCRIPTION_STATUS_CHANGED => "UICC_SUBSCRIPTION_STATUS_CHANGED",
        unsol::RADIO_CAPABILITY => "RADIO_CAPABILITY",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_from_wire() {
        assert_eq!(Status::from(0), Status::Ok);
        assert_eq!(Status::from(1), Status::Error(RilError::RadioNotAvailable));
        assert_eq!(Status::from(2), Status::Error(RilError::GenericFailure));
        assert_eq!(Status::from(12345), Status::Error(RilError::Other(12345)));
        assert!(Status::from(1).radio_not_available());
    }

    #[test]
    fn illegal_app_state_reads_ready() {
        assert_eq!(AppState::from(-1), AppState::Ready);
        assert_eq!(AppState::from(5), AppState::Ready);
        assert_eq!(AppState::from(2), AppState::Pin);
    }

    #[test]
    fn tech_mapping() {
        assert_eq!(access_tech_from_ril(radio_tech::LTE), AccessTech::Lte);
        assert_eq!(access_tech_from_ril(radio_tech::GPRS), AccessTech::Gsm);
        assert_eq!(access_tech_from_ril(radio_tech::HSPAP), AccessTech::Hspa);
        assert_eq!(access_tech_from_ril(99), AccessTech::Unknown);
    }

    #[test]
    fn radio_state_parse() {
        assert_eq!(RadioState::from(0), RadioState::Off);
        assert_eq!(RadioState::from(10), RadioState::On);
        assert_eq!(RadioState::from(1), RadioState::Unavailable);
        assert!(RadioState::On.is_on());
        assert!(!RadioState::Off.is_on());
    }
}
