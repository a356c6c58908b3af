//! Per-slot radio power controller.
//!
//! Keeps the modem's power in line with the demand expressed by the
//! online flag and a set of power-on holders. Exactly one blocking
//! RADIO_POWER request is in flight at a time; demand changes during
//! that window are coalesced into a single follow-up. The public state
//! only moves while nothing is pending and no retry is armed, so
//! observers never see the intermediate flapping.
//!
//! States: idle (no request, no retry), request pending, retry armed.
//! Pending and retry are mutually exclusive.

use core::cell::RefCell;

use embassy_futures::select::{select, select3, Either, Either3};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};

use crate::chan::{next_unsol, Channel, Queue, Request};
use crate::events::{publish, Events, SlotEvent};
use crate::ril::{request, unsol, RadioState};

const POWER_RETRY: Duration = Duration::from_secs(1);

/// Holders of a power-on request. Each holder counts once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PowerTag {
    Data = 0x01,
    CellInfo = 0x02,
    Caps = 0x04,
    Client = 0x08,
}

#[derive(Debug, Default)]
struct Inner {
    online: bool,
    tags: u32,
    power_cycle: bool,
    /// What observers see.
    state: RadioState,
    /// What the modem last reported.
    last_known: RadioState,
    pending: bool,
    /// Target of the in-flight request.
    pending_target: bool,
    /// Coalesced follow-up to send once the in-flight request ends.
    next_state: Option<bool>,
    /// Unsolicited state changes observed while a request was pending
    /// that disagreed with the desired state.
    changed_while_pending: u32,
    retry_at: Option<Instant>,
    /// Submission the task should perform when it gets around to it.
    submit_now: Option<bool>,
}

enum StateEventOutcome {
    None,
    /// The modem reached the desired state on its own; the pending
    /// request is moot and can be dropped.
    DropPending,
}

impl Inner {
    fn should_be_on(&self) -> bool {
        (self.online || self.tags != 0) && !self.power_cycle
    }

    /// The C-shaped request path: queue while pending, ignore if the
    /// modem already reports the wanted state, otherwise ask the task
    /// to submit.
    fn request_power(&mut self, on: bool, allow_repeat: bool) {
        if self.pending {
            let effective = self.next_state.unwrap_or(self.pending_target);
            if allow_repeat || effective != on {
                self.next_state = Some(on);
            }
        } else if self.last_known.is_on() == on {
            // Nothing to send; the periodic check may still need to
            // cancel a retry or publish the state.
        } else {
            self.submit_now = Some(on);
        }
    }

    fn begin_submit(&mut self, on: bool) {
        self.pending = true;
        self.pending_target = on;
        self.next_state = None;
        self.changed_while_pending = 0;
        self.retry_at = None;
    }

    fn request_done(&mut self) {
        self.pending = false;
        if let Some(next) = self.next_state.take() {
            self.submit_now = Some(next);
        }
    }

    /// Reconciles demand with the last reported state. Returns whether
    /// the public state moved.
    fn check_state(&mut self, now: Instant) -> bool {
        if !self.pending && self.submit_now.is_none() {
            let should = self.should_be_on();
            if self.last_known.is_on() == should {
                // All good, cancel pending retry if there is one.
                self.retry_at = None;
            } else if self.changed_while_pending > 0 {
                // The modem reacted, just not the way we wanted.
                self.submit_now = Some(should);
            } else if self.retry_at.is_none() {
                // No reaction so far, wait a bit.
                self.retry_at = Some(now + POWER_RETRY);
            }
        }

        if !self.pending
            && self.submit_now.is_none()
            && self.retry_at.is_none()
            && self.state != self.last_known
        {
            self.state = self.last_known;
            true
        } else {
            false
        }
    }

    fn handle_state_event(&mut self, state: RadioState) -> StateEventOutcome {
        if state == RadioState::Unavailable {
            return StateEventOutcome::None;
        }

        if self.power_cycle && !state.is_on() {
            debug!("switched off for power cycle");
            self.power_cycle = false;
        }

        self.last_known = state;

        if self.pending {
            if state.is_on() == self.should_be_on() {
                return StateEventOutcome::DropPending;
            }
            self.changed_while_pending += 1;
        }

        StateEventOutcome::None
    }
}

pub struct RadioController {
    inner: Mutex<NoopRawMutex, RefCell<Inner>>,
    kick: Signal<NoopRawMutex, ()>,
}

impl Default for RadioController {
    fn default() -> Self {
        Self::new()
    }
}

impl RadioController {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                online: false,
                tags: 0,
                power_cycle: false,
                state: RadioState::Off,
                last_known: RadioState::Off,
                pending: false,
                pending_target: false,
                next_state: None,
                changed_while_pending: 0,
                retry_at: None,
                submit_now: None,
            })),
            kick: Signal::new(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        self.inner.lock(|i| f(&mut i.borrow_mut()))
    }

    /// The gated public state.
    pub fn state(&self) -> RadioState {
        self.with(|i| i.state)
    }

    pub fn online(&self) -> bool {
        self.with(|i| i.online)
    }

    /// Adds a power-on holder. The first holder turns the radio on.
    pub fn power_on(&self, tag: PowerTag) {
        self.with(|i| {
            if i.tags & tag as u32 == 0 {
                let was_on = i.should_be_on();
                i.tags |= tag as u32;
                if !was_on && i.should_be_on() {
                    i.request_power(true, false);
                }
            }
        });
        self.kick.signal(());
    }

    /// Drops a power-on holder. The last one turns the lights off.
    pub fn power_off(&self, tag: PowerTag) {
        self.with(|i| {
            if i.tags & tag as u32 != 0 {
                i.tags &= !(tag as u32);
                if !i.should_be_on() {
                    i.request_power(false, false);
                }
            }
        });
        self.kick.signal(());
    }

    pub fn set_online(&self, online: bool, events: &Events) {
        let changed = self.with(|i| {
            if i.online == online {
                return false;
            }
            let was_on = i.should_be_on();
            i.online = online;
            let on = i.should_be_on();
            if was_on != on {
                i.request_power(on, false);
            }
            true
        });
        if changed {
            publish(events, SlotEvent::RadioOnlineChanged);
            self.kick.signal(());
        }
    }

    /// Re-asserts "on" even if we believe the radio is already on. Used
    /// after another slot powered down, which is known to confuse some
    /// modems.
    pub fn confirm_power_on(&self) {
        self.with(|i| {
            if i.should_be_on() {
                i.request_power(true, true);
            }
        });
        self.kick.signal(());
    }

    /// Forces the radio off until the modem confirms, then lets the
    /// normal demand logic power it back up.
    pub fn power_cycle(&self) {
        self.with(|i| {
            if !i.last_known.is_on() {
                debug!("power is already off");
            } else if i.power_cycle {
                debug!("power cycle already in progress");
            } else {
                debug!("power cycle initiated");
                i.power_cycle = true;
                if !i.pending {
                    i.submit_now = Some(false);
                }
            }
        });
        self.kick.signal(());
    }

    /// Runs the controller against its channel queue.
    pub async fn run(&self, chan: &Channel, queue: &Queue<'_>, events: &Events) -> ! {
        let mut unsol_sub = chan.subscribe_unsol();
        loop {
            if let Some(on) = self.with(|i| i.submit_now.take()) {
                self.drive_power_request(chan, queue, &mut unsol_sub, on)
                    .await;
                continue;
            }

            if self.with(|i| i.check_state(Instant::now())) {
                publish(events, SlotEvent::RadioStateChanged);
            }
            if self.with(|i| i.submit_now.is_some()) {
                continue;
            }

            let retry_at = self.with(|i| i.retry_at);
            match select3(
                next_unsol(&mut unsol_sub),
                self.kick.wait(),
                maybe_at(retry_at),
            )
            .await
            {
                Either3::First(ev) => {
                    if ev.code == unsol::RADIO_STATE_CHANGED {
                        self.on_state_event(&ev.data);
                    }
                }
                Either3::Second(()) => {}
                Either3::Third(()) => {
                    self.with(|i| {
                        i.retry_at = None;
                        let should = i.should_be_on();
                        i.submit_now = Some(should);
                    });
                }
            }
        }
    }

    fn on_state_event(&self, data: &[u8]) {
        let Some(state) = parse_radio_state(data) else {
            error!("error parsing radio state");
            return;
        };
        debug!("radio state event");
        self.with(|i| match i.handle_state_event(state) {
            StateEventOutcome::None => {}
            // Outside a pending request this cannot happen; the select
            // in drive_power_request handles the drop.
            StateEventOutcome::DropPending => {}
        });
    }

    async fn drive_power_request(
        &self,
        chan: &Channel,
        queue: &Queue<'_>,
        unsol_sub: &mut crate::chan::UnsolSubscriber<'_>,
        on: bool,
    ) {
        self.with(|i| i.begin_submit(on));
        debug!("radio power {}", on);

        let mut sub = queue.submit(Request::ints(request::RADIO_POWER, &[on as i32]).blocking());
        let serial = sub.serial();

        loop {
            match select(&mut sub, next_unsol(unsol_sub)).await {
                Either::First(resp) => {
                    if !resp.status.is_ok() && resp.status != crate::ril::Status::Cancelled {
                        error!("power request failed");
                    }
                    break;
                }
                Either::Second(ev) => {
                    if ev.code != unsol::RADIO_STATE_CHANGED {
                        continue;
                    }
                    let Some(state) = parse_radio_state(&ev.data) else {
                        continue;
                    };
                    let drop_pending =
                        self.with(|i| matches!(i.handle_state_event(state), StateEventOutcome::DropPending));
                    if drop_pending {
                        // The modem switched to the desired state on its
                        // own; the answer no longer matters.
                        debug!("dropping pending power request");
                        chan.cancel(serial, false);
                    }
                }
            }
        }

        self.with(|i| i.request_done());
        self.kick.signal(());
    }
}

fn parse_radio_state(data: &[u8]) -> Option<RadioState> {
    crate::ril::parcel::Parser::new(data)
        .get_i32()
        .map(RadioState::from)
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

    fn idle_inner() -> Inner {
        Inner {
            online: false,
            tags: 0,
            power_cycle: false,
            state: RadioState::Off,
            last_known: RadioState::Off,
            pending: false,
            pending_target: false,
            next_state: None,
            changed_while_pending: 0,
            retry_at: None,
            submit_now: None,
        }
    }

    #[test]
    fn first_holder_powers_on() {
        let mut i = idle_inner();
        let was_on = i.should_be_on();
        i.tags |= PowerTag::Data as u32;
        assert!(!was_on && i.should_be_on());
        i.request_power(true, false);
        assert_eq!(i.submit_now, Some(true));
    }

    #[test]
    fn already_on_submits_nothing() {
        let mut i = idle_inner();
        i.last_known = RadioState::On;
        i.tags = PowerTag::Data as u32;
        i.request_power(true, false);
        assert_eq!(i.submit_now, None);
    }

    #[test]
    fn queued_next_state_rules() {
        let mut i = idle_inner();
        i.begin_submit(true);
        // Identical target without repeat is dropped.
        i.request_power(true, false);
        assert_eq!(i.next_state, None);
        // Repeat is honoured (confirm_power_on path).
        i.request_power(true, true);
        assert_eq!(i.next_state, Some(true));
        // A different target always queues.
        i.next_state = None;
        i.request_power(false, false);
        assert_eq!(i.next_state, Some(false));
        // Completion turns the queued state into a submission.
        i.request_done();
        assert_eq!(i.submit_now, Some(false));
    }

    #[test]
    fn agreeing_state_event_drops_pending() {
        let mut i = idle_inner();
        i.tags = PowerTag::Data as u32;
        i.begin_submit(true);
        assert!(matches!(
            i.handle_state_event(RadioState::On),
            StateEventOutcome::DropPending
        ));
        assert_eq!(i.last_known, RadioState::On);
    }

    #[test]
    fn disagreeing_state_event_counts() {
        let mut i = idle_inner();
        i.tags = PowerTag::Data as u32;
        i.begin_submit(true);
        assert!(matches!(
            i.handle_state_event(RadioState::Off),
            StateEventOutcome::None
        ));
        assert_eq!(i.changed_while_pending, 1);
        // After completion the mismatch triggers an immediate resubmit.
        i.request_done();
        let now = Instant::now();
        i.check_state(now);
        assert_eq!(i.submit_now, Some(true));
    }

    #[test]
    fn silent_modem_schedules_retry() {
        let mut i = idle_inner();
        i.tags = PowerTag::Data as u32;
        i.begin_submit(true);
        i.request_done();
        let now = Instant::now();
        assert!(!i.check_state(now));
        assert_eq!(i.retry_at, Some(now + POWER_RETRY));
        // No public state movement while the retry is armed.
        assert_eq!(i.state, RadioState::Off);
    }

    #[test]
    fn public_state_moves_only_when_quiet() {
        let mut i = idle_inner();
        assert!(matches!(
            i.handle_state_event(RadioState::On),
            StateEventOutcome::None
        ));
        // Demand is off and the modem says on: mismatch arms a retry
        // first, so nothing is published yet.
        i.online = true;
        let now = Instant::now();
        assert!(i.check_state(now));
        assert_eq!(i.state, RadioState::On);
    }

    #[test]
    fn unavailable_is_ignored() {
        let mut i = idle_inner();
        i.last_known = RadioState::On;
        i.handle_state_event(RadioState::Unavailable);
        assert_eq!(i.last_known, RadioState::On);
    }

    #[test]
    fn power_cycle_clears_on_off_event() {
        let mut i = idle_inner();
        i.online = true;
        i.last_known = RadioState::On;
        i.state = RadioState::On;
        i.power_cycle = true;
        assert!(!i.should_be_on());
        i.handle_state_event(RadioState::Off);
        assert!(!i.power_cycle);
        // Demand returns once the cycle flag drops.
        assert!(i.should_be_on());
    }

    #[test]
    fn last_holder_powers_off() {
        let mut i = idle_inner();
        i.last_known = RadioState::On;
        i.state = RadioState::On;
        i.tags = PowerTag::Data as u32;
        i.tags &= !(PowerTag::Data as u32);
        assert!(!i.should_be_on());
        i.request_power(false, false);
        assert_eq!(i.submit_now, Some(false));
    }
}
