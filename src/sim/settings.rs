//! Per-SIM user settings the core reacts to: the preferred radio
//! access mode and the IMSI of the current subscriber. The upper layer
//! writes them, the network controller and data manager read them.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::String;

use crate::config::{AccessMode, TechMask};
use crate::events::{publish, Events, SlotEvent};

pub type Imsi = String<16>;

struct Inner {
    techs: TechMask,
    pref_mode: AccessMode,
    imsi: Option<Imsi>,
}

pub struct SimSettings {
    inner: Mutex<NoopRawMutex, RefCell<Inner>>,
}

impl SimSettings {
    pub fn new(techs: TechMask) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                techs,
                pref_mode: AccessMode::Any,
                imsi: None,
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        self.inner.lock(|i| f(&mut i.borrow_mut()))
    }

    /// Technologies this slot may use at all (config, not user choice).
    pub fn techs(&self) -> TechMask {
        self.with(|i| i.techs)
    }

    pub fn pref_mode(&self) -> AccessMode {
        self.with(|i| i.pref_mode)
    }

    pub fn set_pref_mode(&self, mode: AccessMode, events: &Events) {
        let changed = self.with(|i| {
            if i.pref_mode != mode {
                i.pref_mode = mode;
                true
            } else {
                false
            }
        });
        if changed {
            publish(events, SlotEvent::PrefModeSettingChanged);
        }
    }

    pub fn imsi(&self) -> Option<Imsi> {
        self.with(|i| i.imsi.clone())
    }

    pub fn set_imsi(&self, imsi: Option<Imsi>, events: &Events) {
        let changed = self.with(|i| {
            if i.imsi != imsi {
                i.imsi = imsi;
                true
            } else {
                false
            }
        });
        if changed {
            publish(events, SlotEvent::ImsiChanged);
        }
    }
}
