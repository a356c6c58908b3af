//! Activation glue between one upper-layer context and the data
//! engine: turns a negotiated data call into interface and IP settings
//! for the external context consumer, keeps the claim on the context
//! id, and tracks the call through list reconciliations.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Vec;
use no_std_net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::events::{next_event, Events, SlotEvent};
use crate::ril::{data_call_state, RegStatus, Status};

use super::call::{Addr, DataCall, Ifname};
use super::{DataEngine, SetupParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
    Unspec,
}

fn address_family(addr: &str) -> Family {
    if addr.contains(':') {
        Family::V6
    } else if addr.contains('.') {
        Family::V4
    } else {
        Family::Unspec
    }
}

/// IPv4 netmask from a CIDR prefix length.
pub fn netmask_from_bits(bits: u32) -> Option<Ipv4Addr> {
    if !(1..=32).contains(&bits) {
        return None;
    }
    let raw: u32 = if bits == 32 {
        0xffff_ffff
    } else {
        ((1u32 << bits) - 1) << (32 - bits)
    };
    Some(Ipv4Addr::from(raw.to_be_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ipv4Settings {
    pub address: Addr,
    pub netmask: Addr,
    pub gateway: Option<Addr>,
    pub dns: Vec<Addr, 4>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Ipv6Settings {
    pub address: Addr,
    pub prefix_len: u8,
    pub gateway: Option<Addr>,
    pub dns: Vec<Addr, 4>,
}

/// What the external IP stack learns about an activated context.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContextSettings {
    pub cid: i32,
    pub ifname: Ifname,
    pub mtu: i32,
    pub ipv4: Option<Ipv4Settings>,
    pub ipv6: Option<Ipv6Settings>,
}

fn push_addr(out: &mut Vec<Addr, 4>, addr: &str) {
    if let Ok(a) = Addr::try_from(addr) {
        out.push(a).ok();
    }
}

fn fmt_ipv4(addr: Ipv4Addr) -> Addr {
    let mut s = Addr::new();
    let o = addr.octets();
    core::fmt::Write::write_fmt(&mut s, format_args!("{}.{}.{}.{}", o[0], o[1], o[2], o[3])).ok();
    s
}

/// Derives the exposed settings from a call record. One address and
/// gateway per family; all matching DNS servers.
pub fn settings_from_call(call: &DataCall) -> ContextSettings {
    let mut settings = ContextSettings {
        cid: call.cid,
        ifname: call.ifname.clone().unwrap_or_default(),
        mtu: call.mtu,
        ipv4: None,
        ipv6: None,
    };

    for addr in &call.addresses {
        match address_family(addr) {
            Family::V4 if settings.ipv4.is_none() => {
                let mut v4 = Ipv4Settings::default();
                match addr.split_once('/') {
                    Some((ip, bits)) => {
                        v4.address = Addr::try_from(ip).unwrap_or_default();
                        v4.netmask = bits
                            .parse()
                            .ok()
                            .and_then(netmask_from_bits)
                            .map(fmt_ipv4)
                            .unwrap_or_else(|| Addr::try_from("255.255.255.0").unwrap());
                    }
                    None => {
                        v4.address = addr.clone();
                        v4.netmask = Addr::try_from("255.255.255.0").unwrap();
                    }
                }
                settings.ipv4 = Some(v4);
            }
            Family::V6 if settings.ipv6.is_none() => {
                let mut v6 = Ipv6Settings::default();
                match addr.split_once('/') {
                    Some((ip, bits)) => {
                        v6.address = Addr::try_from(ip).unwrap_or_default();
                        v6.prefix_len = bits.parse().ok().filter(|p| *p <= 128).unwrap_or(0);
                    }
                    None => v6.address = addr.clone(),
                }
                settings.ipv6 = Some(v6);
            }
            _ => {}
        }
    }

    if settings.ipv4.is_none() && settings.ipv6.is_none() {
        error!("data call has no IP address");
    }

    for gw in &call.gateways {
        match address_family(gw) {
            Family::V4 => {
                if let Some(v4) = settings.ipv4.as_mut() {
                    if v4.gateway.is_none() {
                        v4.gateway = Addr::try_from(gw.as_str()).ok();
                    }
                }
            }
            Family::V6 => {
                if let Some(v6) = settings.ipv6.as_mut() {
                    if v6.gateway.is_none() {
                        v6.gateway = Addr::try_from(gw.as_str()).ok();
                    }
                }
            }
            Family::Unspec => {}
        }
    }

    for dns in &call.dnses {
        match address_family(dns) {
            Family::V4 => {
                if let Some(v4) = settings.ipv4.as_mut() {
                    push_addr(&mut v4.dns, dns);
                }
            }
            Family::V6 => {
                if let Some(v6) = settings.ipv6.as_mut() {
                    push_addr(&mut v6.dns, dns);
                }
            }
            Family::Unspec => {}
        }
    }

    settings
}

/// Change notifications delivered by [`DataContext::watch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextEvent {
    /// The call is still up but its parameters moved.
    Updated(ContextSettings),
    /// The call disappeared or went link-down; the context is gone.
    Disconnected,
}

/// One upper-layer context bound to the engine.
pub struct DataContext<'a> {
    engine: &'a DataEngine,
    events: &'a Events,
    owner: u8,
    active: Mutex<NoopRawMutex, RefCell<Option<DataCall>>>,
}

impl<'a> DataContext<'a> {
    pub fn new(engine: &'a DataEngine, events: &'a Events, owner: u8) -> Self {
        Self {
            engine,
            events,
            owner,
            active: Mutex::new(RefCell::new(None)),
        }
    }

    pub fn active_cid(&self) -> Option<i32> {
        self.active.lock(|a| a.borrow().as_ref().map(|c| c.cid))
    }

    fn set_active(&self, call: Option<DataCall>) {
        self.active.lock(|a| *a.borrow_mut() = call);
    }

    fn active_call(&self) -> Option<DataCall> {
        self.active.lock(|a| a.borrow().clone())
    }

    /// Activates the context and claims its cid. The engine handles
    /// silent retries underneath; this resolves with the final word.
    pub async fn activate(&self, params: SetupParams) -> Result<ContextSettings> {
        let id = self.engine.queue_setup(params);
        let result = self.engine.wait_result(id).await;

        match (result.status, result.call) {
            (Status::Ok, Some(call)) if call.ok() => {
                self.engine.grab(call.cid, self.owner);
                let settings = settings_from_call(&call);
                info!("activated data call {}", call.cid);
                self.set_active(Some(call));
                Ok(settings)
            }
            (Status::Ok, Some(call)) => Err(Error::CallFail(call.status)),
            (Status::Ok, None) => Err(Error::Parse),
            (status, _) => Err(Error::from_status(status)),
        }
    }

    /// Deactivates the active context. A call that vanished while the
    /// request was in flight counts as success: we wanted it gone and
    /// it is gone.
    pub async fn deactivate(&self) -> Result<()> {
        let Some(cid) = self.active_cid() else {
            return Ok(());
        };
        let id = self.engine.queue_deactivate(cid);
        let result = self.engine.wait_result(id).await;

        self.engine.release(cid, self.owner);
        self.set_active(None);

        match result.status {
            Status::Ok => {
                info!("deactivated data call {}", cid);
                Ok(())
            }
            _ if self.engine.find_call(cid).is_none() => Ok(()),
            status => Err(Error::from_status(status)),
        }
    }

    /// Follows the engine's call list; resolves when the active call
    /// changes or disappears.
    pub async fn watch(&self) -> ContextEvent {
        let mut sub = self.events.subscriber().expect("event subscriber");
        loop {
            if next_event(&mut sub).await != SlotEvent::CallsChanged {
                continue;
            }
            let Some(active) = self.active_call() else {
                continue;
            };
            match self.engine.find_call(active.cid) {
                None => {
                    debug!("context {} deactivated", active.cid);
                    self.set_active(None);
                    return ContextEvent::Disconnected;
                }
                Some(call) if call.active == data_call_state::INACTIVE => {
                    self.set_active(None);
                    return ContextEvent::Disconnected;
                }
                Some(call) if call != active => {
                    self.set_active(Some(call.clone()));
                    return ContextEvent::Updated(settings_from_call(&call));
                }
                Some(_) => {}
            }
        }
    }
}

/// Packet-service attachment bookkeeping. Attachment is driven by the
/// data manager through the allowed predicate, not by an attach
/// request of its own.
#[derive(Debug, Default)]
pub struct AttachState {
    attached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachEvent {
    /// Data was disallowed; the service layer must consider itself
    /// detached.
    Detached,
    /// Data became allowed while registered; the service layer should
    /// attach with this status.
    StatusNotify(RegStatus),
}

impl AttachState {
    pub fn attached(&self) -> bool {
        self.attached
    }

    pub fn set_attached(&mut self, attached: bool) {
        self.attached = attached;
    }

    /// Reconciles the attach state with the allowed predicate and the
    /// data registration status.
    pub fn check(&mut self, allowed: bool, data_reg: RegStatus) -> Option<AttachEvent> {
        if !allowed && self.attached {
            self.attached = false;
            return Some(AttachEvent::Detached);
        }
        if allowed
            && !self.attached
            && matches!(data_reg, RegStatus::Registered | RegStatus::Roaming)
        {
            return Some(AttachEvent::StatusNotify(data_reg));
        }
        None
    }
}
