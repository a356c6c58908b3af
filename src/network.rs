//! Per-slot network registration and preferred RAT controller.
//!
//! Registration and operator identity are polled on every relevant
//! trigger; a poll already in flight is nudged out of its retry gap
//! instead of duplicated. The preferred-RAT setter combines the user
//! preference with the externally imposed clamp, refuses to run while
//! the SIM is mid-enumeration or busy with file I/O, and enforces a
//! hold-off between consecutive SET_PREFERRED_NETWORK_TYPE requests.

use core::cell::RefCell;

use embassy_futures::join::join3;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use heapless::{String, Vec};

use crate::chan::{next_unsol, Channel, Queue, Request, RetryPolicy};
use crate::config::{AccessMode, SlotConfig, TechMask};
use crate::events::{next_event, publish, Events, SlotEvent};
use crate::radio::RadioController;
use crate::ril::parcel::Parser;
use crate::ril::{
    access_tech_from_ril, pref_net_type, request, unsol, AccessTech, RadioState, RegStatus,
};
use crate::sim::settings::SimSettings;
use crate::sim::SimCard;

/// Back-off between consecutive set-RAT requests.
const SET_PREF_MODE_HOLDOFF: Duration = Duration::from_millis(crate::ril::RETRY_MS);

pub const MAX_NAME: usize = 64;
pub const MAX_SPDI: usize = 16;

/// One voice or data registration snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegState {
    pub status: RegStatus,
    pub access_tech: AccessTech,
    /// Raw technology value kept for vendor passthrough.
    pub ril_tech: i32,
    pub lac: i32,
    pub ci: i32,
    /// Maximum concurrent PDP contexts the network grants us.
    pub max_calls: u32,
}

impl Default for RegState {
    fn default() -> Self {
        Self {
            status: RegStatus::Unknown,
            access_tech: AccessTech::Unknown,
            ril_tech: -1,
            lac: -1,
            ci: -1,
            max_calls: 0,
        }
    }
}

impl RegState {
    /// Parses a [VOICE|DATA]_REGISTRATION_STATE response: an array of
    /// strings, of which the smallest seen in the wild has three.
    pub fn parse(data: &[u8]) -> Option<RegState> {
        let mut p = Parser::new(data);
        let nparams = p.get_i32()?;
        if nparams < 3 {
            debug!("broken registration response");
            return None;
        }
        let sstatus: Option<String<8>> = p.get_string()?;
        let sstatus = sstatus?;
        let slac: Option<String<12>> = p.get_string()?;
        let sci: Option<String<12>> = p.get_string()?;
        let stech: Option<String<8>> = if nparams > 3 { p.get_string()? } else { None };
        let _reason: Option<String<8>> = if nparams > 4 { p.get_string()? } else { None };
        let smax: Option<String<8>> = if nparams > 5 { p.get_string()? } else { None };

        let mut state = RegState::default();

        let raw_status: i32 = sstatus.parse().ok()?;
        // Values above ten mean "emergency calls possible" on top of
        // the basic status.
        state.status = RegStatus::from(if raw_status > 10 {
            raw_status - 10
        } else {
            raw_status
        });

        state.lac = parse_int_radix(slac.as_deref(), 16).unwrap_or(-1);
        state.ci = parse_int_radix(sci.as_deref(), 16).unwrap_or(-1);

        state.ril_tech = stech
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(-1);
        state.access_tech = if state.ril_tech >= 0 {
            access_tech_from_ril(state.ril_tech)
        } else {
            AccessTech::Unknown
        };

        state.max_calls = smax.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
        // Older peers don't provide the maximum; two simultaneous data
        // calls is all anybody needs.
        if state.max_calls < 1 {
            state.max_calls = 2;
        }

        Some(state)
    }

    pub fn registered(&self) -> bool {
        matches!(self.status, RegStatus::Registered | RegStatus::Roaming)
    }
}

fn parse_int_radix(s: Option<&str>, radix: u32) -> Option<i32> {
    let s = s?;
    u32::from_str_radix(s, radix).ok().map(|v| v as i32)
}

/// Reduces a RIL_SignalStrength payload (GW, CDMA, EVDO and LTE
/// blocks) to a 0..=100 percentage; `None` when nothing in it is
/// usable.
pub fn parse_signal_strength(data: &[u8]) -> Option<i32> {
    let mut p = Parser::new(data);
    let gw = p.get_i32()?; // 0-31 per TS 27.007 8.5, 99 unknown
    p.get_i32()?; // bit error rate
    p.get_i32()?; // CDMA dbm
    p.get_i32()?; // CDMA ecio
    p.get_i32()?; // EVDO dbm
    p.get_i32()?; // EVDO ecio
    p.get_i32()?; // EVDO snr
    // The LTE block only exists on v8+ peers.
    let lte = p.get_i32().unwrap_or(99);
    let rsrp = p.get_i32().unwrap_or(i32::MAX);

    if (0..=31).contains(&gw) {
        Some(gw * 100 / 31)
    } else if (0..=31).contains(&lte) {
        Some(lte * 100 / 31)
    } else if (44..=140).contains(&rsrp) {
        // RSRP is reported as a positive attenuation, 44 best.
        Some((140 - rsrp) * 100 / 96)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MccMnc {
    pub mcc: String<4>,
    pub mnc: String<4>,
}

/// Splits the numeric operator code into MCC and MNC.
pub fn parse_mcc_mnc(numeric: &str) -> Option<MccMnc> {
    if !(5..=6).contains(&numeric.len()) || !numeric.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (mcc, mnc) = numeric.split_at(3);
    Some(MccMnc {
        mcc: String::try_from(mcc).ok()?,
        mnc: String::try_from(mnc).ok()?,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    pub id: MccMnc,
    pub name: String<MAX_NAME>,
    pub tech: AccessTech,
}

/// Parses an OPERATOR response; `None` inside means "no operator".
fn parse_operator(data: &[u8], fallback_tech: AccessTech) -> Option<Option<Operator>> {
    let mut p = Parser::new(data);
    p.get_i32()?;
    let lalpha: Option<String<MAX_NAME>> = p.get_string()?;
    let salpha: Option<String<MAX_NAME>> = p.get_string()?;
    let numeric: Option<String<8>> = p.get_string()?;

    let Some(id) = numeric.as_deref().and_then(parse_mcc_mnc) else {
        return Some(None);
    };
    let name = lalpha
        .or(salpha)
        .or_else(|| numeric.and_then(|n| String::try_from(n.as_str()).ok()))
        .unwrap_or_default();
    Some(Some(Operator {
        id,
        name,
        tech: fallback_tech,
    }))
}

/// Maps the modem-reported preferred network type onto the coarse
/// access mode.
pub fn rat_to_mode(rat: i32) -> AccessMode {
    match rat {
        pref_net_type::LTE_CDMA_EVDO
        | pref_net_type::LTE_GSM_WCDMA
        | pref_net_type::LTE_CDMA_EVDO_GSM_WCDMA
        | pref_net_type::LTE_ONLY
        | pref_net_type::LTE_WCDMA => AccessMode::Lte,
        pref_net_type::GSM_WCDMA_AUTO | pref_net_type::WCDMA | pref_net_type::GSM_WCDMA => {
            AccessMode::Umts
        }
        pref_net_type::GSM_ONLY => AccessMode::Gsm,
        _ => {
            debug!("unexpected rat mode {}", rat);
            AccessMode::Gsm
        }
    }
}

struct Inner {
    voice: RegState,
    data: RegState,
    operator: Option<Operator>,
    spdi: Vec<MccMnc, MAX_SPDI>,
    /// Preferred network type last reported by the modem.
    rat: i32,
    pref_mode: AccessMode,
    max_pref_mode: AccessMode,
    assert_rat: bool,
    holdoff_until: Option<Instant>,
    force_check: bool,
    want_operator: bool,
    want_voice: bool,
    want_data: bool,
    operator_serial: u32,
    voice_serial: u32,
    data_serial: u32,
    /// Last reported signal strength percentage, -1 unknown.
    signal: i32,
}

pub struct NetworkController {
    inner: Mutex<NoopRawMutex, RefCell<Inner>>,
    kick_poll: Signal<NoopRawMutex, ()>,
    kick_rat: Signal<NoopRawMutex, ()>,
    lte_network_mode: i32,
    network_mode_timeout: Duration,
    techs: TechMask,
}

impl NetworkController {
    pub fn new(config: &SlotConfig) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                voice: RegState::default(),
                data: RegState::default(),
                operator: None,
                spdi: Vec::new(),
                rat: -1,
                pref_mode: AccessMode::Any,
                max_pref_mode: AccessMode::Any,
                assert_rat: false,
                holdoff_until: None,
                force_check: false,
                want_operator: false,
                want_voice: false,
                want_data: false,
                operator_serial: 0,
                voice_serial: 0,
                data_serial: 0,
                signal: -1,
            })),
            kick_poll: Signal::new(),
            kick_rat: Signal::new(),
            lte_network_mode: config.lte_network_mode,
            network_mode_timeout: config.network_mode_timeout,
            techs: config.techs,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        self.inner.lock(|i| f(&mut i.borrow_mut()))
    }

    /// Voice registration with the SPDI adjustment: roaming inside the
    /// home service provider's list is displayed as registered. The
    /// rewrite happens here, at the exposure point; the stored state
    /// keeps what the network said.
    pub fn voice_state(&self) -> RegState {
        self.with(|i| {
            let mut state = i.voice;
            if state.status == RegStatus::Roaming && i.operator_in_spdi() {
                state.status = RegStatus::Registered;
            }
            state
        })
    }

    pub fn data_state(&self) -> RegState {
        self.with(|i| i.data)
    }

    pub fn operator(&self) -> Option<Operator> {
        self.with(|i| i.operator.clone())
    }

    /// Signal strength percentage, -1 while unknown.
    pub fn signal_strength(&self) -> i32 {
        self.with(|i| i.signal)
    }

    /// Service Provider Display Information from the current SIM.
    pub fn set_spdi(&self, spdi: &[MccMnc], events: &Events) {
        let changed = self.with(|i| {
            let mut new: Vec<MccMnc, MAX_SPDI> = Vec::new();
            for entry in spdi.iter().take(MAX_SPDI) {
                new.push(entry.clone()).ok();
            }
            if i.spdi != new {
                i.spdi = new;
                true
            } else {
                false
            }
        });
        if changed {
            publish(events, SlotEvent::VoiceStateChanged);
        }
    }

    pub fn pref_mode(&self) -> AccessMode {
        self.with(|i| i.pref_mode)
    }

    pub fn max_pref_mode(&self) -> AccessMode {
        self.with(|i| i.max_pref_mode)
    }

    /// External clamp on the preferred mode; the cross-slot handover
    /// logic speaks to the slots through this.
    pub fn set_max_pref_mode(&self, mode: AccessMode, force_check: bool, events: &Events) {
        let changed = self.with(|i| {
            if i.max_pref_mode != mode {
                i.max_pref_mode = mode;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("max pref mode changed");
            publish(events, SlotEvent::MaxPrefModeChanged);
        }
        if changed || force_check {
            self.check_pref_mode(true);
        }
    }

    /// Forces a re-issue of the preferred mode even when the cached
    /// value matches, e.g. after a radio capability switch.
    pub fn assert_pref_mode(&self, immediate: bool) {
        self.with(|i| i.assert_rat = true);
        self.check_pref_mode(immediate);
    }

    fn check_pref_mode(&self, immediate: bool) {
        self.with(|i| {
            let immediate = immediate || core::mem::take(&mut i.force_check);
            if immediate {
                i.holdoff_until = None;
            }
        });
        self.kick_rat.signal(());
    }

    /// Registration-only poll (the vendor hooks use this).
    pub fn query_registration_state(&self, chan: &Channel) {
        self.trigger_poll(chan, false);
    }

    fn poll_state(&self, chan: &Channel) {
        self.trigger_poll(chan, true);
    }

    fn trigger_poll(&self, chan: &Channel, operator: bool) {
        let retries = self.with(|i| {
            let mut retries: Vec<u32, 3> = Vec::new();
            if operator {
                if i.operator_serial != 0 {
                    retries.push(i.operator_serial).ok();
                } else {
                    i.want_operator = true;
                }
            }
            if i.voice_serial != 0 {
                retries.push(i.voice_serial).ok();
            } else {
                i.want_voice = true;
            }
            if i.data_serial != 0 {
                retries.push(i.data_serial).ok();
            } else {
                i.want_data = true;
            }
            retries
        });
        for serial in retries {
            chan.retry_now(serial);
        }
        self.kick_poll.signal(());
    }

    fn expected_rat(&self, radio: &RadioController, settings: &SimSettings) -> i32 {
        let max_pref = self.with(|i| i.max_pref_mode);
        // Even a powered-down slot must release LTE to the others, so
        // a radio that is not fully on clamps to GSM.
        let max_pref = if radio.state() == RadioState::On {
            max_pref
        } else {
            AccessMode::Gsm
        };
        let mode = settings.pref_mode().clamp(max_pref);
        self.mode_to_rat(mode)
    }

    fn mode_to_rat(&self, mode: AccessMode) -> i32 {
        match mode {
            AccessMode::Any | AccessMode::Lte if self.techs.contains(AccessMode::Lte) => {
                self.lte_network_mode
            }
            AccessMode::Gsm => pref_net_type::GSM_ONLY,
            _ if self.techs.contains(AccessMode::Umts) => pref_net_type::GSM_WCDMA_AUTO,
            _ => pref_net_type::GSM_ONLY,
        }
    }

    /// Setting the RAT while the SIM is busy slows its I/O to a crawl
    /// on some modems, hence the extra gating.
    fn can_set_rat(&self, radio: &RadioController, sim: &SimCard) -> bool {
        radio.online() && sim.ready() && !sim.io_active()
    }

    pub async fn run(
        &self,
        chan: &Channel,
        queue: &Queue<'_>,
        radio: &RadioController,
        sim: &SimCard,
        settings: &SimSettings,
        events: &Events,
    ) -> ! {
        join3(
            self.event_loop(chan, radio, sim, events),
            self.poll_loop(queue, events),
            self.rat_loop(queue, radio, sim, settings, events),
        )
        .await
        .0
    }

    async fn event_loop(
        &self,
        chan: &Channel,
        radio: &RadioController,
        sim: &SimCard,
        events: &Events,
    ) -> ! {
        let mut unsol_sub = chan.subscribe_unsol();
        let mut event_sub = events.subscriber().expect("event subscriber");

        if radio.state() == RadioState::On {
            self.poll_state(chan);
        }

        loop {
            match select(next_unsol(&mut unsol_sub), next_event(&mut event_sub)).await {
                Either::First(ev) => match ev.code {
                    unsol::VOICE_NETWORK_STATE_CHANGED => self.poll_state(chan),
                    unsol::RADIO_CAPABILITY => self.assert_pref_mode(false),
                    unsol::SIGNAL_STRENGTH => {
                        if let Some(signal) = parse_signal_strength(&ev.data) {
                            let changed = self.with(|i| {
                                if i.signal != signal {
                                    i.signal = signal;
                                    true
                                } else {
                                    false
                                }
                            });
                            if changed {
                                publish(events, SlotEvent::SignalStrengthChanged);
                            }
                        }
                    }
                    _ => {}
                },
                Either::Second(ev) => match ev {
                    SlotEvent::RadioStateChanged => {
                        self.check_pref_mode(false);
                        if radio.state() == RadioState::On {
                            self.poll_state(chan);
                        }
                    }
                    SlotEvent::RadioOnlineChanged => {
                        if self.can_set_rat(radio, sim) {
                            self.check_pref_mode(true);
                        }
                    }
                    SlotEvent::SimStatusChanged
                    | SlotEvent::SimAppChanged
                    | SlotEvent::SimIoActiveChanged => {
                        if self.can_set_rat(radio, sim) {
                            self.check_pref_mode(false);
                        }
                    }
                    SlotEvent::PrefModeSettingChanged => {
                        // Deferred so other listeners (the data
                        // manager) can adjust the clamp first.
                        self.with(|i| i.force_check = true);
                        self.kick_rat.signal(());
                    }
                    _ => {}
                },
            }
        }
    }

    async fn poll_loop(&self, queue: &Queue<'_>, events: &Events) -> ! {
        loop {
            let (operator, voice, data) = self.with(|i| {
                (
                    core::mem::take(&mut i.want_operator),
                    core::mem::take(&mut i.want_voice),
                    core::mem::take(&mut i.want_data),
                )
            });
            if !(operator || voice || data) {
                self.kick_poll.wait().await;
                continue;
            }
            join3(
                self.poll_operator(queue, events, operator),
                self.poll_reg(queue, events, voice, true),
                self.poll_reg(queue, events, data, false),
            )
            .await;
        }
    }

    async fn poll_operator(&self, queue: &Queue<'_>, events: &Events, wanted: bool) {
        if !wanted {
            return;
        }
        let sub = queue.submit(
            Request::new(request::OPERATOR)
                .retry(RetryPolicy::forever(Duration::from_millis(crate::ril::RETRY_MS))),
        );
        self.with(|i| i.operator_serial = sub.serial());
        let resp = sub.await;
        self.with(|i| i.operator_serial = 0);
        if !resp.status.is_ok() {
            return;
        }
        let fallback = self.with(|i| i.voice.access_tech);
        let Some(op) = parse_operator(&resp.data, fallback) else {
            warn!("broken operator response");
            return;
        };
        let changed = self.with(|i| {
            if i.operator != op {
                i.operator = op;
                true
            } else {
                false
            }
        });
        if changed {
            publish(events, SlotEvent::OperatorChanged);
        }
    }

    async fn poll_reg(&self, queue: &Queue<'_>, events: &Events, wanted: bool, voice: bool) {
        if !wanted {
            return;
        }
        let code = if voice {
            request::VOICE_REGISTRATION_STATE
        } else {
            request::DATA_REGISTRATION_STATE
        };
        let sub = queue.submit(
            Request::new(code)
                .retry(RetryPolicy::forever(Duration::from_millis(crate::ril::RETRY_MS))),
        );
        self.with(|i| {
            if voice {
                i.voice_serial = sub.serial();
            } else {
                i.data_serial = sub.serial();
            }
        });
        let resp = sub.await;
        self.with(|i| {
            if voice {
                i.voice_serial = 0;
            } else {
                i.data_serial = 0;
            }
        });
        if !resp.status.is_ok() {
            return;
        }
        let Some(state) = RegState::parse(&resp.data) else {
            return;
        };
        let changed = self.with(|i| {
            let slot = if voice { &mut i.voice } else { &mut i.data };
            if *slot != state {
                *slot = state;
                true
            } else {
                false
            }
        });
        if changed {
            if voice {
                debug!("voice registration changed");
                publish(events, SlotEvent::VoiceStateChanged);
            } else {
                debug!("data registration changed");
                publish(events, SlotEvent::DataStateChanged);
            }
        }
    }

    async fn rat_loop(
        &self,
        queue: &Queue<'_>,
        radio: &RadioController,
        sim: &SimCard,
        settings: &SimSettings,
        events: &Events,
    ) -> ! {
        // The initial preferred mode. Querying network state before the
        // radio has been turned on makes some peers unhappy, but this
        // one is safe.
        self.query_pref_mode(queue, events).await;

        loop {
            let holdoff = self.with(|i| {
                i.holdoff_until
                    .filter(|at| *at > Instant::now())
            });
            if holdoff.is_none() {
                self.with(|i| i.holdoff_until = None);
                let expected = self.expected_rat(radio, settings);
                let need = self.with(|i| i.rat != expected || i.assert_rat);
                if need && self.can_set_rat(radio, sim) {
                    self.set_rat(queue, expected, events).await;
                    continue;
                } else if need {
                    debug!("need to set rat mode {}", expected);
                }
            }
            match holdoff {
                Some(at) => {
                    let _ = select(self.kick_rat.wait(), Timer::at(at)).await;
                }
                None => self.kick_rat.wait().await,
            }
        }
    }

    async fn set_rat(&self, queue: &Queue<'_>, rat: i32, events: &Events) {
        debug!("setting rat mode {}", rat);
        self.with(|i| {
            i.assert_rat = false;
            // Don't do it too often.
            i.holdoff_until = Some(Instant::now() + SET_PREF_MODE_HOLDOFF);
        });
        let resp = queue
            .send(
                Request::ints(request::SET_PREFERRED_NETWORK_TYPE, &[rat])
                    .timeout(self.network_mode_timeout),
            )
            .await;
        if !resp.status.is_ok() {
            error!("failed to set rat mode");
        }
        // Confirm what the modem actually settled on; disagreement
        // reschedules another set once the hold-off expires.
        self.query_pref_mode(queue, events).await;
    }

    async fn query_pref_mode(&self, queue: &Queue<'_>, events: &Events) {
        let resp = queue
            .send(
                Request::new(request::GET_PREFERRED_NETWORK_TYPE)
                    .retry(RetryPolicy::forever(Duration::from_millis(crate::ril::RETRY_MS))),
            )
            .await;
        if !resp.status.is_ok() {
            return;
        }
        let mut p = resp.parser();
        p.get_i32();
        let Some(rat) = p.get_i32() else {
            return;
        };
        let changed = self.with(|i| {
            i.rat = rat;
            let mode = rat_to_mode(rat);
            if i.pref_mode != mode {
                i.pref_mode = mode;
                true
            } else {
                false
            }
        });
        debug!("rat mode {}", rat);
        if changed {
            publish(events, SlotEvent::PrefModeChanged);
        }
        self.kick_rat.signal(());
    }
}

impl Inner {
    fn operator_in_spdi(&self) -> bool {
        match self.operator.as_ref() {
            Some(op) => self.spdi.iter().any(|entry| *entry == op.id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ril::parcel::Builder;

    fn reg_response(fields: &[Option<&str>]) -> Vec<u8, 256> {
        let mut b: Builder<256> = Builder::new();
        b.append_utf8_array(fields);
        let mut out = Vec::new();
        out.extend_from_slice(b.as_slice()).unwrap();
        out
    }

    #[test]
    fn registration_parse_lte() {
        let data = reg_response(&[Some("1"), Some("1234"), Some("ABCD1234"), Some("14")]);
        let state = RegState::parse(&data).unwrap();
        assert_eq!(state.status, RegStatus::Registered);
        assert_eq!(state.lac, 0x1234);
        assert_eq!(state.ci, 0xABCD1234u32 as i32);
        assert_eq!(state.ril_tech, 14);
        assert_eq!(state.access_tech, AccessTech::Lte);
        assert_eq!(state.max_calls, 2);
    }

    #[test]
    fn registration_parse_emergency_offset() {
        let data = reg_response(&[Some("13"), None, None]);
        let state = RegState::parse(&data).unwrap();
        assert_eq!(state.status, RegStatus::Denied);
        assert_eq!(state.lac, -1);
        assert_eq!(state.ci, -1);
        assert_eq!(state.access_tech, AccessTech::Unknown);
    }

    #[test]
    fn registration_parse_max_calls() {
        let data = reg_response(&[
            Some("5"),
            Some("1"),
            Some("2"),
            Some("3"),
            None,
            Some("4"),
        ]);
        let state = RegState::parse(&data).unwrap();
        assert_eq!(state.status, RegStatus::Roaming);
        assert_eq!(state.access_tech, AccessTech::Umts);
        assert_eq!(state.max_calls, 4);
    }

    #[test]
    fn registration_parse_too_short() {
        let data = reg_response(&[Some("1")]);
        assert!(RegState::parse(&data).is_none());
    }

    #[test]
    fn signal_strength_reduction() {
        fn payload(ints: &[i32]) -> Vec<u8, 64> {
            let mut b: Builder<64> = Builder::new();
            for v in ints {
                b.append_i32(*v);
            }
            let mut out = Vec::new();
            out.extend_from_slice(b.as_slice()).unwrap();
            out
        }
        // A GW reading wins.
        let data = payload(&[31, 0, 0, 0, 0, 0, 0, 99, i32::MAX]);
        assert_eq!(parse_signal_strength(&data), Some(100));
        // LTE signal strength next.
        let data = payload(&[99, 0, 0, 0, 0, 0, 0, 16, i32::MAX]);
        assert_eq!(parse_signal_strength(&data), Some(16 * 100 / 31));
        // RSRP as the last resort; 140 is the floor.
        let data = payload(&[99, 0, 0, 0, 0, 0, 0, 99, 140]);
        assert_eq!(parse_signal_strength(&data), Some(0));
        let data = payload(&[99, 0, 0, 0, 0, 0, 0, 99, 44]);
        assert_eq!(parse_signal_strength(&data), Some(100));
        // Nothing usable.
        let data = payload(&[99, 0, 0, 0, 0, 0, 0, 99, i32::MAX]);
        assert_eq!(parse_signal_strength(&data), None);
        // A pre-v8 peer without the LTE block still works.
        let data = payload(&[20, 0, 0, 0, 0, 0, 0]);
        assert_eq!(parse_signal_strength(&data), Some(20 * 100 / 31));
    }

    #[test]
    fn mcc_mnc_split() {
        let id = parse_mcc_mnc("25001").unwrap();
        assert_eq!(id.mcc, "250");
        assert_eq!(id.mnc, "01");
        let id = parse_mcc_mnc("310260").unwrap();
        assert_eq!(id.mnc, "260");
        assert!(parse_mcc_mnc("2501").is_none());
        assert!(parse_mcc_mnc("25O01").is_none());
    }

    #[test]
    fn operator_name_preference() {
        let mut b: Builder<256> = Builder::new();
        b.append_i32(3)
            .append_utf8(Some("Operator"))
            .append_utf8(Some("OP"))
            .append_utf8(Some("25001"));
        let op = parse_operator(b.as_slice(), AccessTech::Lte)
            .unwrap()
            .unwrap();
        assert_eq!(op.name, "Operator");
        assert_eq!(op.id.mcc, "250");
        assert_eq!(op.tech, AccessTech::Lte);

        let mut b: Builder<256> = Builder::new();
        b.append_i32(3)
            .append_utf8(None)
            .append_utf8(None)
            .append_utf8(Some("25001"));
        let op = parse_operator(b.as_slice(), AccessTech::Unknown)
            .unwrap()
            .unwrap();
        assert_eq!(op.name, "25001");

        let mut b: Builder<256> = Builder::new();
        b.append_i32(3)
            .append_utf8(None)
            .append_utf8(None)
            .append_utf8(None);
        assert_eq!(parse_operator(b.as_slice(), AccessTech::Unknown), Some(None));
    }

    #[test]
    fn rat_mode_mapping() {
        assert_eq!(rat_to_mode(pref_net_type::LTE_GSM_WCDMA), AccessMode::Lte);
        assert_eq!(rat_to_mode(pref_net_type::GSM_WCDMA_AUTO), AccessMode::Umts);
        assert_eq!(rat_to_mode(pref_net_type::GSM_ONLY), AccessMode::Gsm);
        assert_eq!(rat_to_mode(99), AccessMode::Gsm);
    }

    fn controller(techs: TechMask) -> NetworkController {
        let mut cfg = SlotConfig::default();
        cfg.techs = techs;
        NetworkController::new(&cfg)
    }

    #[test]
    fn mode_to_rat_respects_techs() {
        let net = controller(TechMask::ALL);
        assert_eq!(
            net.mode_to_rat(AccessMode::Any),
            pref_net_type::LTE_GSM_WCDMA
        );
        assert_eq!(
            net.mode_to_rat(AccessMode::Lte),
            pref_net_type::LTE_GSM_WCDMA
        );
        assert_eq!(
            net.mode_to_rat(AccessMode::Umts),
            pref_net_type::GSM_WCDMA_AUTO
        );
        assert_eq!(net.mode_to_rat(AccessMode::Gsm), pref_net_type::GSM_ONLY);

        // Without LTE in the mask everything tops out at UMTS.
        let net = controller(TechMask(TechMask::GSM.0 | TechMask::UMTS.0));
        assert_eq!(
            net.mode_to_rat(AccessMode::Lte),
            pref_net_type::GSM_WCDMA_AUTO
        );

        let net = controller(TechMask::GSM);
        assert_eq!(net.mode_to_rat(AccessMode::Any), pref_net_type::GSM_ONLY);
    }

    #[test]
    fn spdi_rewrites_roaming_at_exposure() {
        let net = controller(TechMask::ALL);
        let events = Events::new();
        net.with(|i| {
            i.voice.status = RegStatus::Roaming;
            i.operator = Some(Operator {
                id: parse_mcc_mnc("25001").unwrap(),
                name: String::try_from("Operator").unwrap(),
                tech: AccessTech::Lte,
            });
        });
        assert_eq!(net.voice_state().status, RegStatus::Roaming);

        net.set_spdi(&[parse_mcc_mnc("25001").unwrap()], &events);
        assert_eq!(net.voice_state().status, RegStatus::Registered);
        // The stored state is untouched.
        assert_eq!(net.with(|i| i.voice.status), RegStatus::Roaming);

        net.set_spdi(&[parse_mcc_mnc("26002").unwrap()], &events);
        assert_eq!(net.voice_state().status, RegStatus::Roaming);
    }

    #[test]
    fn holdoff_suppresses_duplicate_sets() {
        let net = controller(TechMask::ALL);
        net.with(|i| {
            i.rat = pref_net_type::GSM_ONLY;
            i.holdoff_until = Some(Instant::now() + SET_PREF_MODE_HOLDOFF);
        });
        // A non-immediate check leaves the hold-off in place.
        net.check_pref_mode(false);
        assert!(net.with(|i| i.holdoff_until.is_some()));
        // An immediate one clears it.
        net.check_pref_mode(true);
        assert!(net.with(|i| i.holdoff_until.is_none()));
    }

    #[test]
    fn max_pref_clamp_changes_expected_rat() {
        let net = controller(TechMask::ALL);
        let events = Events::new();
        net.set_max_pref_mode(AccessMode::Gsm, false, &events);
        assert_eq!(net.max_pref_mode(), AccessMode::Gsm);
        // mode_to_rat of the clamped mode is GSM only.
        assert_eq!(
            net.mode_to_rat(AccessMode::Any.clamp(AccessMode::Gsm)),
            pref_net_type::GSM_ONLY
        );
    }
}
