//! Process-wide slot manager.
//!
//! Collects the configured slots, waits for each to finish its
//! start-up handshake (bounded by the per-slot start timeout, with the
//! longest timeout as the overall cap), and afterwards runs the
//! cross-slot machinery: the data manager's check-data loop, the
//! power-on confirmation fan-out and screen state forwarding.

use core::cell::RefCell;
use core::future::pending;

use embassy_futures::join::join3;
use embassy_futures::select::{select, select4, Either, Either4};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Instant, Timer};
use heapless::Vec;

use crate::config::{ManagerConfig, SetRadioCap, MAX_SLOTS};
use crate::data::manager::{DataManager, SlotLink};
use crate::data::DataRole;
use crate::events::{next_event, EventSubscriber, SlotEvent};
use crate::chan::{next_unsol, UnsolSubscriber};
use crate::ril::{unsol, RadioState};
use crate::slot::Slot;

struct State {
    started: bool,
    display_on: bool,
}

pub struct SlotManager {
    dm: DataManager,
    config: ManagerConfig,
    state: Mutex<NoopRawMutex, RefCell<State>>,
}

impl SlotManager {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            dm: DataManager::new(config),
            config: config.clone(),
            state: Mutex::new(RefCell::new(State {
                started: false,
                display_on: true,
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        self.state.lock(|s| f(&mut s.borrow_mut()))
    }

    /// Every slot has either registered or run out of its start budget.
    pub fn started(&self) -> bool {
        self.with(|s| s.started)
    }

    fn links<'a>(slots: &'a [&'a Slot]) -> Vec<SlotLink<'a>, MAX_SLOTS> {
        slots
            .iter()
            .map(|s| SlotLink {
                chan: &s.chan,
                radio: &s.radio,
                engine: &s.engine,
                network: &s.network,
                settings: &s.settings,
                events: &s.events,
            })
            .collect()
    }

    /// Grants the data role; see [`DataManager::allow`].
    pub fn allow_data(&self, slots: &[&Slot], index: usize, role: DataRole) {
        self.dm.allow(&Self::links(slots), index, role);
    }

    /// Display state forwarding: each transition is sent to every
    /// connected slot exactly once.
    pub fn set_display_state(&self, slots: &[&Slot], on: bool) {
        let changed = self.with(|s| {
            if s.display_on != on {
                s.display_on = on;
                true
            } else {
                false
            }
        });
        if changed {
            for slot in slots {
                slot.send_screen_state(on);
                // Cell monitoring follows the screen.
                slot.cellinfo.set_enabled(on);
            }
        }
    }

    /// Runs the cross-slot machinery; the slots themselves are driven
    /// by their own [`Slot::run`] calls.
    pub async fn run(&self, slots: &[&Slot]) -> ! {
        if slots.len() > MAX_SLOTS {
            warn!("only the first {} slots are managed", MAX_SLOTS);
        }
        join3(
            self.startup_barrier(slots),
            self.check_data_loop(slots),
            self.power_watch_loop(slots),
        )
        .await
        .0;
        unreachable!()
    }

    /// Waits until every slot is ready or out of time. Slots that
    /// exceeded their budget are reported and left behind; their tasks
    /// keep running and may still come up later, but nobody waits for
    /// them.
    async fn startup_barrier(&self, slots: &[&Slot]) -> ! {
        let t0 = Instant::now();
        for slot in slots.iter().take(MAX_SLOTS) {
            let deadline = t0 + slot.config.start_timeout;
            let mut sub = slot.events.subscriber().expect("event subscriber");
            let wait_ready = async {
                while !slot.ready() {
                    let _ = next_event(&mut sub).await;
                }
            };
            match select(wait_ready, Timer::at(deadline)).await {
                Either::First(()) => {}
                Either::Second(()) => {
                    warn!("slot {} missed the start timeout", slot.config.slot);
                }
            }
        }

        info!("manager started");
        self.with(|s| s.started = true);
        self.dm.check_data(&Self::links(slots));

        // Probe radio capability management; only answering peers take
        // part in capability coordination.
        if slots.len() > 1 && self.config.set_radio_cap != SetRadioCap::Disabled {
            for slot in slots.iter().take(MAX_SLOTS) {
                let capable = match self.config.set_radio_cap {
                    SetRadioCap::Enabled => true,
                    SetRadioCap::Auto => slot.chan.ril_version() >= 11,
                    SetRadioCap::Disabled => false,
                };
                if capable && slot.ready() {
                    let caps = slot.probe_radio_caps().await;
                    debug!(
                        "slot {} radio caps {}",
                        slot.config.slot,
                        if caps.is_some() { "ok" } else { "not supported" }
                    );
                }
            }
        }

        pending().await
    }

    /// Runs check-data whenever a slot's engine drains or its settings
    /// move; this is the only place cross-slot data decisions happen.
    async fn check_data_loop(&self, slots: &[&Slot]) -> ! {
        let mut subs: Vec<EventSubscriber<'_>, MAX_SLOTS> = slots
            .iter()
            .take(MAX_SLOTS)
            .map(|s| s.events.subscriber().expect("event subscriber"))
            .collect();
        let mut it = subs.iter_mut();
        let (mut a, mut b, mut c, mut d) = (it.next(), it.next(), it.next(), it.next());

        loop {
            let event = select4(
                next_event_or_never(a.as_deref_mut()),
                next_event_or_never(b.as_deref_mut()),
                next_event_or_never(c.as_deref_mut()),
                next_event_or_never(d.as_deref_mut()),
            )
            .await;
            let event = match event {
                Either4::First(e) | Either4::Second(e) | Either4::Third(e) | Either4::Fourth(e) => e,
            };
            if !self.started() {
                continue;
            }
            match event {
                SlotEvent::CheckData => self.dm.check_data(&Self::links(slots)),
                SlotEvent::PrefModeSettingChanged | SlotEvent::ImsiChanged => {
                    // The clamp may need to move to another slot.
                    self.dm.check_data(&Self::links(slots));
                }
                _ => {}
            }
        }
    }

    /// After one modem powers off, the others that should be on need a
    /// RADIO_POWER nudge or they may never register again.
    async fn power_watch_loop(&self, slots: &[&Slot]) -> ! {
        let mut subs: Vec<UnsolSubscriber<'_>, MAX_SLOTS> = slots
            .iter()
            .take(MAX_SLOTS)
            .map(|s| s.chan.subscribe_unsol())
            .collect();
        let mut it = subs.iter_mut();
        let (mut a, mut b, mut c, mut d) = (it.next(), it.next(), it.next(), it.next());

        loop {
            let off = select4(
                radio_off_or_never(a.as_deref_mut()),
                radio_off_or_never(b.as_deref_mut()),
                radio_off_or_never(c.as_deref_mut()),
                radio_off_or_never(d.as_deref_mut()),
            )
            .await;
            let _ = off;
            debug!("a slot reported power off");
            for slot in slots {
                slot.radio.confirm_power_on();
            }
        }
    }
}

async fn next_event_or_never(sub: Option<&mut EventSubscriber<'_>>) -> SlotEvent {
    match sub {
        Some(sub) => next_event(sub).await,
        None => pending().await,
    }
}

/// Resolves when this subscriber sees an unsolicited radio-off.
async fn radio_off_or_never(sub: Option<&mut UnsolSubscriber<'_>>) -> () {
    let Some(sub) = sub else {
        return pending().await;
    };
    loop {
        let ev = next_unsol(sub).await;
        if ev.code == unsol::RADIO_STATE_CHANGED {
            let state = crate::ril::parcel::Parser::new(&ev.data)
                .get_i32()
                .map(RadioState::from);
            if state == Some(RadioState::Off) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SlotConfig;

    fn two_slots() -> (Slot, Slot) {
        let mut c0 = SlotConfig::default();
        c0.slot = 0;
        let mut c1 = SlotConfig::default();
        c1.slot = 1;
        (Slot::new(c0), Slot::new(c1))
    }

    #[test]
    fn allow_data_keeps_single_owner() {
        let (s0, s1) = two_slots();
        let mgr = SlotManager::new(&ManagerConfig::default());
        let slots = [&s0, &s1];

        mgr.allow_data(&slots, 0, DataRole::Internet);
        assert!(s0.engine.allowed_flag());
        assert!(!s1.engine.allowed_flag());

        mgr.allow_data(&slots, 1, DataRole::Mms);
        assert!(!s0.engine.allowed_flag());
        assert!(s1.engine.allowed_flag());
        // MMS does not move the speed entitlement.
        assert!(s0.engine.max_speed());
    }

    #[test]
    fn display_transitions_are_edge_triggered() {
        let (s0, _s1) = two_slots();
        let mgr = SlotManager::new(&ManagerConfig::default());
        let slots = [&s0];
        // Initial state is "on"; repeating it is a no-op and nothing
        // panics without a connection.
        mgr.set_display_state(&slots, true);
        mgr.set_display_state(&slots, false);
        mgr.set_display_state(&slots, false);
        mgr.set_display_state(&slots, true);
        assert!(!mgr.started());
    }
}
