//! GET_SIM_STATUS response model.

use heapless::{String, Vec};

use crate::ril::parcel::Parser;
use crate::ril::{AppState, AppType, CardState, PersoSubstate, PinState};

pub const MAX_APPS: usize = 8;

pub type Aid = String<64>;

/// One application entry of the card status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SimApp {
    pub app_type: AppType,
    pub app_state: AppState,
    pub perso_substate: PersoSubstate,
    pub aid: Option<Aid>,
    pub label: Option<String<64>>,
    pub pin_replaced: bool,
    pub pin1_state: PinState,
    pub pin2_state: PinState,
}

impl SimApp {
    fn parse(p: &mut Parser<'_>) -> Option<Self> {
        let app_type = AppType::from(p.get_i32()?);
        let app_state = AppState::from(p.get_i32()?);
        let perso_substate = PersoSubstate::from(p.get_i32()?);
        let aid = p.get_string()?;
        let label = p.get_string()?;
        let pin_replaced = p.get_i32()? != 0;
        let pin1_state = PinState::from(p.get_i32()?);
        let pin2_state = PinState::from(p.get_i32()?);
        Some(Self {
            app_type,
            app_state,
            perso_substate,
            aid,
            label,
            pin_replaced,
            pin1_state,
            pin2_state,
        })
    }
}

/// Difference classes between two statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusDiff {
    /// Card state (present/absent/error) moved.
    pub state: bool,
    /// Anything else moved.
    pub status: bool,
}

impl StatusDiff {
    pub fn any(self) -> bool {
        self.state || self.status
    }
}

/// Parsed card status; replaces the previous one atomically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimStatus {
    pub card_state: CardState,
    /// Universal PIN state.
    pub pin_state: PinState,
    pub gsm_umts_index: i32,
    pub cdma_index: i32,
    pub ims_index: i32,
    pub apps: Vec<SimApp, MAX_APPS>,
}

impl SimStatus {
    /// Synthetic removed-card status used by [`super::SimCard::reset`].
    pub fn absent() -> Self {
        Self {
            card_state: CardState::Absent,
            pin_state: PinState::Unknown,
            gsm_umts_index: -1,
            cdma_index: -1,
            ims_index: -1,
            apps: Vec::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut p = Parser::new(data);
        let card_state = CardState::from(p.get_i32()?);
        let pin_state = PinState::from(p.get_i32()?);
        let gsm_umts_index = p.get_i32()?;
        let cdma_index = p.get_i32()?;
        let ims_index = p.get_i32()?;
        let num_apps = p.get_i32()?;
        if !(0..=MAX_APPS as i32).contains(&num_apps) {
            error!("invalid SIM app count {}", num_apps);
            return None;
        }
        let mut apps = Vec::new();
        for _ in 0..num_apps {
            apps.push(SimApp::parse(&mut p)?).ok()?;
        }
        Some(Self {
            card_state,
            pin_state,
            gsm_umts_index,
            cdma_index,
            ims_index,
            apps,
        })
    }

    pub fn diff(old: Option<&SimStatus>, new: &SimStatus) -> StatusDiff {
        let Some(old) = old else {
            return StatusDiff {
                state: true,
                status: true,
            };
        };
        StatusDiff {
            state: old.card_state != new.card_state,
            status: old.pin_state != new.pin_state
                || old.gsm_umts_index != new.gsm_umts_index
                || old.cdma_index != new.cdma_index
                || old.ims_index != new.ims_index
                || old.apps != new.apps,
        }
    }

    /// Index reported by the modem, when it points at a real entry.
    pub fn modem_selected_app(&self) -> Option<usize> {
        let i = self.gsm_umts_index;
        if i >= 0 && (i as usize) < self.apps.len() {
            Some(i as usize)
        } else {
            None
        }
    }

    /// Fallback selection: first USIM/RUIM, else first app of any known
    /// type.
    pub fn select_app(&self) -> Option<usize> {
        let mut selected = None;
        for (i, app) in self.apps.iter().enumerate() {
            match app.app_type {
                AppType::Usim | AppType::Ruim => return Some(i),
                AppType::Unknown => {}
                _ => {
                    if selected.is_none() {
                        selected = Some(i);
                    }
                }
            }
        }
        selected
    }
}
