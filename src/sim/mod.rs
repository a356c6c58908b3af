//! Per-slot SIM card state machine.
//!
//! Aggregates GET_SIM_STATUS responses into the current card status,
//! selects the active application, drives UICC subscription on
//! multi-SIM peers, and maintains the SIM-I/O activity beacon that the
//! network controller consults before touching the preferred RAT.

pub mod io;
pub mod settings;
pub mod status;

use core::cell::RefCell;

use embassy_futures::join::join4;
use embassy_futures::select::{select, Either};
use embassy_futures::yield_now;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use heapless::FnvIndexSet;

use crate::chan::{next_unsol, Channel, Queue, Request, RetryPolicy};
use crate::events::{publish, Events, SlotEvent};
use crate::ril::parcel::Builder;
use crate::ril::{request, uicc_sub, unsol, AppState, CardState, PersoSubstate};

use status::{SimApp, SimStatus};

/// How long a freshly appeared card gets to activate its own USIM app
/// before we poke it with SET_UICC_SUBSCRIPTION.
const UICC_SUBSCRIPTION_START: Duration = Duration::from_secs(5);
/// Some peers take their time answering the subscription request, and
/// some never do.
const UICC_SUBSCRIPTION_TIMEOUT: Duration = Duration::from_secs(30);

/// SIM I/O quiescence is counted in executor idle turns rather than
/// wall time; between back-to-back SIM_IO requests the loop very rarely
/// gets more than one idle turn, so ten in a row means the flurry is
/// over regardless of system load.
const SIM_IO_IDLE_LOOPS: u32 = 10;

pub const MAX_SIM_IO_PENDING: usize = 16;

struct Inner {
    slot: u32,
    uicc_workaround: bool,
    status: Option<SimStatus>,
    app_index: Option<usize>,
    status_serial: u32,
    want_status: bool,
    sub_serial: u32,
    want_subscribe: Option<usize>,
    sub_cancel: bool,
    sub_start_at: Option<Instant>,
    io_pending: FnvIndexSet<u32, MAX_SIM_IO_PENDING>,
    io_active: bool,
    io_idle_armed: bool,
    io_epoch: u32,
}

impl Inner {
    /// Re-evaluates which application is selected; may arm a
    /// subscription request. Returns whether the selected app changed.
    fn update_app(&mut self) -> bool {
        let old = self.current_app().cloned();
        let mut app_index = None;

        if let Some(status) = self.status.as_ref() {
            if status.card_state == CardState::Present {
                if let Some(i) = status.modem_selected_app() {
                    app_index = Some(i);
                    self.subscription_done();
                } else if let Some(sel) = status.select_app() {
                    if self.sub_start_at.is_none() {
                        self.want_subscribe = Some(sel);
                    }
                    app_index = Some(sel);
                }
            } else {
                self.subscription_done();
            }
        }

        self.app_index = match app_index {
            Some(i)
                if self
                    .status
                    .as_ref()
                    .and_then(|s| s.apps.get(i))
                    .map_or(false, |a| a.app_type != crate::ril::AppType::Unknown) =>
            {
                Some(i)
            }
            _ => None,
        };

        old.as_ref() != self.current_app()
    }

    fn subscription_done(&mut self) {
        self.sub_start_at = None;
        if self.sub_serial != 0 {
            self.sub_cancel = true;
        }
    }

    fn current_app(&self) -> Option<&SimApp> {
        let i = self.app_index?;
        self.status.as_ref()?.apps.get(i)
    }

    fn update_io_active(&mut self) -> bool {
        let active = self.io_idle_armed || !self.io_pending.is_empty();
        if self.io_active != active {
            self.io_active = active;
            true
        } else {
            false
        }
    }
}

pub struct SimCard {
    inner: Mutex<NoopRawMutex, RefCell<Inner>>,
    kick_status: Signal<NoopRawMutex, ()>,
    kick_sub: Signal<NoopRawMutex, ()>,
    kick_io: Signal<NoopRawMutex, ()>,
}

impl SimCard {
    pub fn new(slot: u32, uicc_workaround: bool) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                slot,
                uicc_workaround,
                status: None,
                app_index: None,
                status_serial: 0,
                want_status: true,
                sub_serial: 0,
                want_subscribe: None,
                sub_cancel: false,
                sub_start_at: None,
                io_pending: FnvIndexSet::new(),
                io_active: false,
                io_idle_armed: false,
                io_epoch: 0,
            })),
            kick_status: Signal::new(),
            kick_sub: Signal::new(),
            kick_io: Signal::new(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        self.inner.lock(|i| f(&mut i.borrow_mut()))
    }

    pub fn status(&self) -> Option<SimStatus> {
        self.with(|i| i.status.clone())
    }

    pub fn has_status(&self) -> bool {
        self.with(|i| i.status.is_some())
    }

    pub fn card_state(&self) -> CardState {
        self.with(|i| {
            i.status
                .as_ref()
                .map(|s| s.card_state)
                .unwrap_or(CardState::Absent)
        })
    }

    pub fn app(&self) -> Option<SimApp> {
        self.with(|i| i.current_app().cloned())
    }

    pub fn app_aid(&self) -> Option<status::Aid> {
        self.with(|i| i.current_app().and_then(|a| a.aid.clone()))
    }

    /// SIM is usable for network and file operations.
    pub fn ready(&self) -> bool {
        self.with(|i| {
            i.current_app().map_or(false, |app| {
                app.app_state == AppState::Ready
                    || (app.app_state == AppState::SubscriptionPerso
                        && app.perso_substate == PersoSubstate::Ready)
            })
        })
    }

    pub fn io_active(&self) -> bool {
        self.with(|i| i.io_active)
    }

    /// Coalesced status query: an in-flight query is nudged out of its
    /// retry gap instead of starting a second one.
    pub fn request_status(&self, chan: &Channel) {
        let serial = self.with(|i| i.status_serial);
        if serial != 0 {
            chan.retry_now(serial);
        } else {
            self.with(|i| i.want_status = true);
            self.kick_status.signal(());
        }
    }

    /// Simulates card removal and re-queries. Used when the upper layer
    /// resets the SIM.
    pub fn reset(&self, chan: &Channel, events: &Events) {
        self.apply_status(SimStatus::absent(), events);
        self.request_status(chan);
    }

    /// SIM_IO bookkeeping from the file I/O paths.
    pub fn sim_io_started(&self, serial: u32, events: &Events) {
        let changed = self.with(|i| {
            i.io_pending.insert(serial).ok();
            i.io_idle_armed = false;
            i.io_epoch = i.io_epoch.wrapping_add(1);
            i.update_io_active()
        });
        if changed {
            publish(events, SlotEvent::SimIoActiveChanged);
        }
    }

    pub fn sim_io_finished(&self, serial: u32, events: &Events) {
        let changed = self.with(|i| {
            if i.io_pending.remove(&serial) && i.io_pending.is_empty() {
                i.io_idle_armed = true;
                i.io_epoch = i.io_epoch.wrapping_add(1);
            }
            i.update_io_active()
        });
        self.kick_io.signal(());
        if changed {
            publish(events, SlotEvent::SimIoActiveChanged);
        }
    }

    fn apply_status(&self, new: SimStatus, events: &Events) {
        let (diff, app_changed) = self.with(|i| {
            let diff = SimStatus::diff(i.status.as_ref(), &new);
            if diff.state && new.card_state == CardState::Present {
                // Give the card some time to activate the USIM app by
                // itself before poking it.
                debug!("card appeared, starting subscription timer");
                i.sub_start_at = Some(Instant::now() + UICC_SUBSCRIPTION_START);
            }
            i.status = Some(new);
            let app_changed = i.update_app();
            (diff, app_changed)
        });

        self.kick_sub.signal(());

        if app_changed {
            publish(events, SlotEvent::SimAppChanged);
        }
        publish(events, SlotEvent::SimStatusReceived);
        if diff.status {
            debug!("SIM status changed");
            publish(events, SlotEvent::SimStatusChanged);
        }
        if diff.state {
            debug!("SIM state changed");
            publish(events, SlotEvent::SimStateChanged);
        }
    }

    /// The enumeration transaction holds the channel while the card
    /// status or subscription is unresolved, so nobody interleaves SIM
    /// traffic with the enumeration.
    fn tx_check(&self, q: &Queue<'_>) {
        if !q.transaction_active() {
            return;
        }
        let finish = self.with(|i| match i.status.as_ref() {
            Some(status) if status.card_state == CardState::Present => {
                i.status_serial == 0
                    && i.sub_serial == 0
                    && status.modem_selected_app().is_some()
            }
            _ => true,
        });
        if finish {
            debug!("status tx finished");
            q.transaction_finish();
        }
    }

    pub async fn run(&self, chan: &Channel, queue: &Queue<'_>, events: &Events) -> ! {
        join4(
            self.status_loop(queue, events),
            self.sub_loop(chan, queue, events),
            self.unsol_loop(chan),
            self.io_idle_loop(events),
        )
        .await
        .0
    }

    async fn status_loop(&self, queue: &Queue<'_>, events: &Events) -> ! {
        loop {
            let submit = self.with(|i| {
                if i.want_status && i.status_serial == 0 {
                    i.want_status = false;
                    true
                } else {
                    false
                }
            });
            if !submit {
                self.kick_status.wait().await;
                continue;
            }

            // Keep other components from interleaving while the card is
            // being enumerated.
            queue.transaction_start();
            let sub = queue.submit(
                Request::new(request::GET_SIM_STATUS)
                    .retry(RetryPolicy::forever(Duration::from_millis(crate::ril::RETRY_MS)).any_error()),
            );
            self.with(|i| i.status_serial = sub.serial());
            let resp = sub.await;
            self.with(|i| i.status_serial = 0);

            if resp.status.is_ok() {
                match SimStatus::parse(&resp.data) {
                    Some(status) => self.apply_status(status, events),
                    None => error!("failed to parse SIM card status"),
                }
            }
            self.tx_check(queue);
        }
    }

    async fn sub_loop(&self, chan: &Channel, queue: &Queue<'_>, events: &Events) -> ! {
        loop {
            if self.with(|i| core::mem::take(&mut i.sub_cancel)) {
                let serial = self.with(|i| core::mem::take(&mut i.sub_serial));
                if serial != 0 {
                    // Some peers never answer SET_UICC_SUBSCRIPTION, so
                    // a superseded request is dropped rather than
                    // cancelled.
                    chan.drop_request(serial);
                }
                self.tx_check(queue);
                continue;
            }

            if let Some(app_index) = self.with(|i| i.want_subscribe.take()) {
                self.subscribe(chan, queue, app_index).await;
                self.tx_check(queue);
                continue;
            }

            let timer_at = self.with(|i| i.sub_start_at);
            match select(self.kick_sub.wait(), maybe_at(timer_at)).await {
                Either::First(()) => {}
                Either::Second(()) => {
                    debug!("subscription start timeout");
                    self.with(|i| i.sub_start_at = None);
                    let app_changed = self.with(|i| i.update_app());
                    if app_changed {
                        publish(events, SlotEvent::SimAppChanged);
                    }
                }
            }
        }
    }

    async fn subscribe(&self, chan: &Channel, queue: &Queue<'_>, app_index: usize) {
        let (slot, workaround) = self.with(|i| (i.slot, i.uicc_workaround));
        let code = if chan.ril_version() != 0 && chan.ril_version() <= 9 && workaround {
            request::V9_SET_UICC_SUBSCRIPTION
        } else {
            request::SET_UICC_SUBSCRIPTION
        };
        debug!("subscribing app {} on slot {}", app_index, slot);

        let mut body: Builder<{ crate::chan::MAX_BODY }> = Builder::new();
        body.append_i32(slot as i32)
            .append_i32(app_index as i32)
            .append_i32(slot as i32) // subscription id
            .append_i32(uicc_sub::ACTIVATE);

        queue.transaction_start();
        let mut sub = queue.submit(
            Request::with_body(code, body).timeout(UICC_SUBSCRIPTION_TIMEOUT),
        );
        let serial = sub.serial();
        self.with(|i| i.sub_serial = serial);

        loop {
            match select(&mut sub, self.kick_sub.wait()).await {
                Either::First(resp) => {
                    if resp.status.is_ok() {
                        debug!("UICC subscription ok");
                    }
                    break;
                }
                Either::Second(()) => {
                    let superseded =
                        self.with(|i| i.sub_cancel || i.want_subscribe.is_some());
                    if superseded {
                        chan.drop_request(serial);
                        // The submission resolves as cancelled on the
                        // next turn of this loop.
                    }
                }
            }
        }

        self.with(|i| {
            i.sub_serial = 0;
            i.sub_cancel = false;
            i.sub_start_at = None;
        });
    }

    async fn unsol_loop(&self, chan: &Channel) -> ! {
        let mut sub = chan.subscribe_unsol();
        loop {
            let ev = next_unsol(&mut sub).await;
            match ev.code {
                unsol::SIM_STATUS_CHANGED | unsol::UICC_SUBSCRIPTION_STATUS_CHANGED => {
                    self.request_status(chan);
                }
                _ => {}
            }
        }
    }

    /// Declares SIM I/O quiet only after N consecutive idle turns with
    /// nothing pending; any new request restarts the count.
    async fn io_idle_loop(&self, events: &Events) -> ! {
        loop {
            if !self.with(|i| i.io_idle_armed) {
                self.kick_io.wait().await;
                continue;
            }
            let epoch = self.with(|i| i.io_epoch);
            let mut quiet = true;
            for _ in 0..SIM_IO_IDLE_LOOPS {
                yield_now().await;
                if self.with(|i| i.io_epoch != epoch || !i.io_idle_armed) {
                    quiet = false;
                    break;
                }
            }
            if quiet {
                let changed = self.with(|i| {
                    i.io_idle_armed = false;
                    i.update_io_active()
                });
                if changed {
                    debug!("SIM I/O is inactive");
                    publish(events, SlotEvent::SimIoActiveChanged);
                }
            }
        }
    }
}

async fn maybe_at(at: Option<Instant>) {
    match at {
        Some(at) => Timer::at(at).await,
        None => core::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ril::AppType;
    use heapless::Vec;

    fn present(apps: &[SimApp], gsm_index: i32) -> SimStatus {
        let mut v = Vec::new();
        for a in apps {
            v.push(a.clone()).unwrap();
        }
        SimStatus {
            card_state: CardState::Present,
            pin_state: crate::ril::PinState::Unknown,
            gsm_umts_index: gsm_index,
            cdma_index: -1,
            ims_index: -1,
            apps: v,
        }
    }

    fn usim(state: AppState) -> SimApp {
        SimApp {
            app_type: AppType::Usim,
            app_state: state,
            ..Default::default()
        }
    }

    fn inner(slot: u32) -> Inner {
        Inner {
            slot,
            uicc_workaround: true,
            status: None,
            app_index: None,
            status_serial: 0,
            want_status: false,
            sub_serial: 0,
            want_subscribe: None,
            sub_cancel: false,
            sub_start_at: None,
            io_pending: FnvIndexSet::new(),
            io_active: false,
            io_idle_armed: false,
            io_epoch: 0,
        }
    }

    #[test]
    fn modem_selected_app_wins() {
        let mut i = inner(0);
        i.status = Some(present(&[usim(AppState::Ready)], 0));
        assert!(i.update_app());
        assert_eq!(i.app_index, Some(0));
        assert_eq!(i.want_subscribe, None);
    }

    #[test]
    fn unselected_app_requests_subscription() {
        let mut i = inner(0);
        i.status = Some(present(&[usim(AppState::Detected)], -1));
        i.update_app();
        // No start timer armed, so the subscription fires right away.
        assert_eq!(i.want_subscribe, Some(0));
        assert_eq!(i.app_index, Some(0));
    }

    #[test]
    fn start_timer_defers_subscription() {
        let mut i = inner(0);
        i.status = Some(present(&[usim(AppState::Detected)], -1));
        i.sub_start_at = Some(Instant::now() + UICC_SUBSCRIPTION_START);
        i.update_app();
        assert_eq!(i.want_subscribe, None);
        // Timer expiry path re-runs selection without the timer.
        i.sub_start_at = None;
        i.update_app();
        assert_eq!(i.want_subscribe, Some(0));
    }

    #[test]
    fn absent_card_clears_app_and_cancels_subscription() {
        let mut i = inner(0);
        i.status = Some(present(&[usim(AppState::Ready)], -1));
        i.update_app();
        i.sub_serial = 42;
        i.status = Some(SimStatus::absent());
        let changed = i.update_app();
        assert!(changed);
        assert_eq!(i.app_index, None);
        assert!(i.sub_cancel);
        assert_eq!(i.sub_start_at, None);
    }

    #[test]
    fn unknown_app_type_is_not_selected() {
        let mut i = inner(0);
        i.status = Some(present(&[SimApp::default()], 0));
        i.update_app();
        assert_eq!(i.app_index, None);
    }

    #[test]
    fn io_beacon_tracks_pending_set() {
        let mut i = inner(0);
        i.io_pending.insert(1).unwrap();
        assert!(i.update_io_active());
        assert!(i.io_active);

        // Last one out arms the idle countdown; still active during it.
        i.io_pending.remove(&1);
        i.io_idle_armed = true;
        assert!(!i.update_io_active());
        assert!(i.io_active);

        // Countdown elapsed.
        i.io_idle_armed = false;
        assert!(i.update_io_active());
        assert!(!i.io_active);
    }

    #[test]
    fn ready_includes_perso_ready() {
        let mut i = inner(0);
        let mut app = usim(AppState::SubscriptionPerso);
        app.perso_substate = PersoSubstate::Ready;
        i.status = Some(present(&[app], 0));
        i.update_app();
        let ready = i.current_app().map_or(false, |app| {
            app.app_state == AppState::Ready
                || (app.app_state == AppState::SubscriptionPerso
                    && app.perso_substate == PersoSubstate::Ready)
        });
        assert!(ready);
    }
}
