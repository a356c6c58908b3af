//! Cross-slot data coordination: at most one slot holds the data role,
//! at most one is entitled to full speed, and on handover-capable
//! hardware every other slot is clamped down to GSM so the chosen one
//! can have LTE.

use crate::chan::Channel;
use crate::config::{AccessMode, ManagerConfig};
use crate::events::{publish, Events, SlotEvent};
use crate::network::NetworkController;
use crate::radio::RadioController;
use crate::sim::settings::SimSettings;

use super::{DataEngine, DataRole};

/// Everything the manager needs from one slot; built by the slot
/// manager and handed in by reference for every cross-slot operation.
pub struct SlotLink<'a> {
    pub chan: &'a Channel,
    pub radio: &'a RadioController,
    pub engine: &'a DataEngine,
    pub network: &'a NetworkController,
    pub settings: &'a SimSettings,
    pub events: &'a Events,
}

pub struct DataManager {
    handover: bool,
}

impl DataManager {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            handover: config.handover_3g_lte,
        }
    }

    /// 3G/LTE handover only makes sense with more than one slot.
    fn handover_active(&self, slots: &[SlotLink<'_>]) -> bool {
        self.handover && slots.len() > 1
    }

    pub fn requests_pending(slots: &[SlotLink<'_>]) -> bool {
        slots.iter().any(|s| s.engine.requests_pending())
    }

    fn allowed_index(slots: &[SlotLink<'_>]) -> Option<usize> {
        slots.iter().position(|s| s.engine.allowed_flag())
    }

    /// Grants or withdraws the data role of a slot. Role `None`
    /// releases it; anything else makes this the single data slot,
    /// `Internet` also the single full-speed one.
    pub fn allow(&self, slots: &[SlotLink<'_>], index: usize, role: DataRole) {
        let slot = &slots[index];
        debug!("slot {} role {:?}", index, role);

        if role == DataRole::None {
            if slot.engine.allowed_flag() {
                slot.engine.disallow(slot.chan, slot.radio, slot.events);
                self.check_data(slots);
            }
            return;
        }

        let mut speed_changed = false;
        if role == DataRole::Internet && !slot.engine.max_speed() {
            slot.engine.set_max_speed_flag(true);
            speed_changed = true;
            for (i, other) in slots.iter().enumerate() {
                if i != index {
                    other.engine.set_max_speed_flag(false);
                }
            }
        }

        if slot.engine.allowed_flag() {
            // Already the data slot; only the speed entitlement moved.
            if speed_changed {
                self.check_network_mode(slots);
            }
        } else {
            slot.engine.set_allowed_flag(true);
            slot.engine.set_on_flag(false);
            for (i, other) in slots.iter().enumerate() {
                if i != index && other.engine.allowed_flag() {
                    other.engine.disallow(other.chan, other.radio, other.events);
                }
            }
            slot.engine.cancel_when_allowed(slot.chan);
            self.check_data(slots);
            slot.engine.power_update(slot.radio);
        }
    }

    /// Acts across slots only when every engine is quiet; this is the
    /// handover serialization point.
    pub fn check_data(&self, slots: &[SlotLink<'_>]) {
        if Self::requests_pending(slots) {
            return;
        }
        self.check_network_mode(slots);
        if let Some(index) = Self::allowed_index(slots) {
            if !slots[index].engine.on() {
                self.switch_data_on(slots, index);
            }
        }
    }

    /// Applies the handover RAT clamp: the full-speed slot (or, with
    /// nobody entitled, the first slot) gets LTE, everybody else GSM.
    fn check_network_mode(&self, slots: &[SlotLink<'_>]) {
        if self.handover_active(slots) {
            let mut lte_index = None;
            for (i, slot) in slots.iter().enumerate() {
                if slot.settings.pref_mode() != AccessMode::Gsm
                    && slot.engine.max_speed()
                    && lte_index.is_none()
                {
                    lte_index = Some(i);
                }
            }
            let lte_index = lte_index.unwrap_or(0);

            for (i, slot) in slots.iter().enumerate() {
                let mode = if i == lte_index {
                    AccessMode::Any
                } else {
                    AccessMode::Gsm
                };
                slot.network.set_max_pref_mode(mode, false, slot.events);
            }
        } else {
            // No reason to limit anything.
            for slot in slots {
                slot.network
                    .set_max_pref_mode(AccessMode::Any, false, slot.events);
            }
        }
    }

    fn switch_data_on(&self, slots: &[SlotLink<'_>], index: usize) {
        let slot = &slots[index];
        debug!("allowing data on slot {}", index);

        if self.handover_active(slots) {
            slot.network
                .set_max_pref_mode(AccessMode::Any, true, slot.events);
        }

        if slot.engine.allow_data_enabled(slot.chan) {
            slot.engine.queue_allow(true);
        } else {
            slot.engine.set_on_flag(true);
            debug!("data on");
            publish(slot.events, SlotEvent::AllowChanged);
        }
    }

    /// Re-sends ALLOW_DATA to the current data slot; used after a radio
    /// capability switch leaves the modems confused.
    pub fn assert_data_on(&self, slots: &[SlotLink<'_>]) {
        if let Some(index) = Self::allowed_index(slots) {
            slots[index].engine.queue_allow(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataOptions, SlotConfig, TechMask};
    use crate::ril::parcel::Builder;

    struct Fixture {
        chan: Channel,
        radio: RadioController,
        engine: DataEngine,
        network: NetworkController,
        settings: SimSettings,
        events: Events,
    }

    impl Fixture {
        fn new(slot: u32) -> Self {
            Self {
                chan: Channel::new(),
                radio: RadioController::new(),
                engine: DataEngine::new(slot, DataOptions::default()),
                network: NetworkController::new(&SlotConfig::default()),
                settings: SimSettings::new(TechMask::ALL),
                events: Events::new(),
            }
        }

        fn link(&self) -> SlotLink<'_> {
            SlotLink {
                chan: &self.chan,
                radio: &self.radio,
                engine: &self.engine,
                network: &self.network,
                settings: &self.settings,
                events: &self.events,
            }
        }

        fn connect_v11(&self) {
            let mut b: Builder<16> = Builder::new();
            b.append_i32(1).append_i32(11);
            let body = b.take().unwrap();
            self.chan
                .handle_unsol(crate::ril::unsol::RIL_CONNECTED, &body);
        }
    }

    fn manager(handover: bool) -> DataManager {
        let mut cfg = ManagerConfig::default();
        cfg.handover_3g_lte = handover;
        DataManager::new(&cfg)
    }

    #[test]
    fn at_most_one_allowed_engine() {
        let a = Fixture::new(0);
        let b = Fixture::new(1);
        let dm = manager(true);

        for role in [DataRole::Internet, DataRole::Mms, DataRole::Internet] {
            for index in [0usize, 1, 0, 1] {
                dm.allow(&[a.link(), b.link()], index, role);
                let allowed = [a.engine.allowed_flag(), b.engine.allowed_flag()];
                assert!(
                    allowed.iter().filter(|f| **f).count() <= 1,
                    "two slots allowed after allow({}, {:?})",
                    index,
                    role
                );
            }
        }
    }

    #[test]
    fn at_most_one_max_speed_engine() {
        let a = Fixture::new(0);
        let b = Fixture::new(1);
        let dm = manager(true);

        dm.allow(&[a.link(), b.link()], 0, DataRole::Internet);
        assert!(a.engine.max_speed());
        dm.allow(&[a.link(), b.link()], 1, DataRole::Internet);
        assert!(b.engine.max_speed());
        assert!(!a.engine.max_speed());
    }

    #[test]
    fn role_none_releases() {
        let a = Fixture::new(0);
        let dm = manager(false);
        dm.allow(&[a.link()], 0, DataRole::Internet);
        assert!(a.engine.allowed_flag());
        dm.allow(&[a.link()], 0, DataRole::None);
        assert!(!a.engine.allowed_flag());
    }

    #[test]
    fn check_data_waits_for_quiet_slots() {
        let a = Fixture::new(0);
        let b = Fixture::new(1);
        let dm = manager(true);
        a.connect_v11();

        a.engine.set_allowed_flag(true);
        // Another slot is mid-request: nothing may happen yet.
        b.engine.queue_deactivate(3);
        dm.check_data(&[a.link(), b.link()]);
        assert!(!a.engine.on());
        assert!(!a.engine.requests_pending());

        // Drain the other slot and try again.
        b.engine.with(|i| {
            i.queue.clear();
        });
        dm.check_data(&[a.link(), b.link()]);
        // ALLOW_DATA(true) got queued on the chosen slot.
        assert!(a.engine.requests_pending());
    }

    #[test]
    fn handover_clamps_other_slots_to_gsm() {
        let a = Fixture::new(0);
        let b = Fixture::new(1);
        let dm = manager(true);

        dm.allow(&[a.link(), b.link()], 1, DataRole::Internet);
        assert_eq!(b.network.max_pref_mode(), AccessMode::Any);
        assert_eq!(a.network.max_pref_mode(), AccessMode::Gsm);

        // Switch the role over; the clamps swap.
        dm.allow(&[a.link(), b.link()], 0, DataRole::Internet);
        assert_eq!(a.network.max_pref_mode(), AccessMode::Any);
        assert_eq!(b.network.max_pref_mode(), AccessMode::Gsm);
    }

    #[test]
    fn no_handover_leaves_modes_unlimited() {
        let a = Fixture::new(0);
        let b = Fixture::new(1);
        let dm = manager(false);
        dm.allow(&[a.link(), b.link()], 1, DataRole::Internet);
        assert_eq!(a.network.max_pref_mode(), AccessMode::Any);
        assert_eq!(b.network.max_pref_mode(), AccessMode::Any);
    }

    #[test]
    fn lte_slot_falls_back_to_first() {
        let a = Fixture::new(0);
        let b = Fixture::new(1);
        let dm = manager(true);
        // Nobody has the full-speed entitlement: first slot wins LTE.
        dm.check_data(&[a.link(), b.link()]);
        assert_eq!(a.network.max_pref_mode(), AccessMode::Any);
        assert_eq!(b.network.max_pref_mode(), AccessMode::Gsm);
    }

    #[test]
    fn gsm_preference_excludes_slot_from_lte_choice() {
        let a = Fixture::new(0);
        let b = Fixture::new(1);
        let dm = manager(true);
        let events = Events::new();
        b.engine.set_max_speed_flag(true);
        // Slot 1 holds the entitlement but its user pinned it to GSM,
        // so the fallback applies.
        b.settings.set_pref_mode(AccessMode::Gsm, &events);
        dm.check_data(&[a.link(), b.link()]);
        assert_eq!(a.network.max_pref_mode(), AccessMode::Any);
        assert_eq!(b.network.max_pref_mode(), AccessMode::Gsm);
    }

    #[test]
    fn switch_role_tears_down_the_old_slot_first() {
        let a = Fixture::new(0);
        let b = Fixture::new(1);
        let dm = manager(true);
        a.connect_v11();
        b.connect_v11();

        dm.allow(&[a.link(), b.link()], 1, DataRole::Internet);
        // Drain slot 1's queue by force to simulate completion.
        b.engine.with(|i| i.queue.clear());
        b.engine.set_on_flag(true);

        dm.allow(&[a.link(), b.link()], 0, DataRole::Internet);
        // Slot 1 was told to drop data; slot 0 cannot have ALLOW_DATA
        // queued while slot 1 still has requests pending.
        assert!(b.engine.requests_pending());
        assert!(!a.engine.requests_pending());

        // Once slot 1 quiesces, check-data switches slot 0 on.
        b.engine.with(|i| i.queue.clear());
        b.engine.set_on_flag(false);
        dm.check_data(&[a.link(), b.link()]);
        assert!(a.engine.requests_pending());
    }

    #[test]
    fn assert_data_on_requeues_allow() {
        let a = Fixture::new(0);
        let dm = manager(false);
        a.engine.set_allowed_flag(true);
        dm.assert_data_on(&[a.link()]);
        assert!(a.engine.requests_pending());
    }
}
