//! Data call records and their wire formats.
//!
//! Three record layouts are in circulation: v6 (the base), v9 (adds
//! the P-CSCF address) and v11 (adds the MTU). The response carries a
//! version field, but some peers lie about it, so the configuration may
//! pin the format. Vendor hooks get the first chance at each record.

use heapless::{String, Vec};

use crate::config::DataCallFormat;
use crate::ril::parcel::Parser;
use crate::vendor::VendorHook;

pub const MAX_CALLS: usize = 8;
pub const MAX_ADDRS: usize = 4;
pub const MAX_ADDR_LEN: usize = 64;

pub type Addr = String<MAX_ADDR_LEN>;
pub type AddrList = Vec<Addr, MAX_ADDRS>;
pub type Ifname = String<16>;

/// PDP type as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Protocol {
    #[default]
    Ip,
    Ipv6,
    Ipv4v6,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Ip => "IP",
            Protocol::Ipv6 => "IPV6",
            Protocol::Ipv4v6 => "IPV4V6",
        }
    }

    pub fn parse(s: &str) -> Option<Protocol> {
        match s {
            "IP" => Some(Protocol::Ip),
            "IPV6" => Some(Protocol::Ipv6),
            "IPV4V6" => Some(Protocol::Ipv4v6),
            _ => None,
        }
    }
}

/// One negotiated (or failed) PDP context. Equality compares every
/// observable field, which is what the change detection relies on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataCall {
    pub cid: i32,
    /// Fail cause; zero means the context is usable.
    pub status: i32,
    pub active: i32,
    pub prot: Option<Protocol>,
    pub retry_time: i32,
    pub mtu: i32,
    pub ifname: Option<Ifname>,
    pub addresses: AddrList,
    pub dnses: AddrList,
    pub gateways: AddrList,
}

impl DataCall {
    pub fn ok(&self) -> bool {
        self.status == crate::ril::pdp_fail::NONE
    }

    /// The default (AOSP) record layout.
    pub fn parse_default(version: u32, p: &mut Parser<'_>) -> Option<DataCall> {
        let mut call = DataCall {
            status: p.get_i32()?,
            retry_time: p.get_i32()?,
            cid: p.get_i32()?,
            active: p.get_i32()?,
            ..Default::default()
        };
        let prot: Option<String<8>> = p.get_string()?;
        call.prot = prot.as_deref().and_then(Protocol::parse);
        if call.prot.is_none() && call.status == crate::ril::pdp_fail::NONE {
            error!("invalid data call protocol");
        }
        call.ifname = p.get_string()?;
        call.addresses = p.split_string()?;
        call.dnses = p.split_string()?;
        call.gateways = p.split_string()?;

        if version >= 9 {
            // P-CSCF address, unused here.
            if !p.skip_string() {
                return None;
            }
            if version >= 11 {
                call.mtu = p.get_i32()?;
            }
        }
        Some(call)
    }
}

/// The current set of contexts, ordered by cid.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataCallList {
    pub version: u32,
    pub calls: Vec<DataCall, MAX_CALLS>,
}

impl DataCallList {
    /// Parses a SETUP_DATA_CALL response or DATA_CALL_LIST payload.
    /// Returns `None` when there are no calls at all (which the engine
    /// treats as an empty list), like a short or empty payload.
    pub fn parse(data: &[u8], format: DataCallFormat, vendor: &VendorHook) -> Option<DataCallList> {
        let mut p = Parser::new(data);
        let wire_version = p.get_u32()?;
        let n = p.get_u32()?;

        let version = match format.version() {
            None => wire_version,
            Some(v) if v == wire_version => wire_version,
            Some(v) => {
                debug!("forcing data call format {} (wire said {})", v, wire_version);
                v
            }
        };

        let mut list = DataCallList {
            version,
            calls: Vec::new(),
        };
        for _ in 0..n {
            if p.at_end() {
                break;
            }
            // The vendor parser works on a copy; a refusal rewinds to
            // the default layout.
            let mut vp = p.clone();
            let call = match vendor.data_call_parse(version, &mut vp) {
                Some(call) => {
                    p = vp;
                    call
                }
                None => DataCall::parse_default(version, &mut p)?,
            };
            list.insert_sorted(call);
        }

        if list.calls.is_empty() {
            debug!("no data calls");
            None
        } else {
            Some(list)
        }
    }

    pub fn insert_sorted(&mut self, call: DataCall) {
        let pos = self
            .calls
            .iter()
            .position(|c| c.cid > call.cid)
            .unwrap_or(self.calls.len());
        if self.calls.insert(pos, call).is_err() {
            warn!("data call list overflow");
        }
    }

    pub fn find(&self, cid: i32) -> Option<&DataCall> {
        self.calls.iter().find(|c| c.cid == cid)
    }

    pub fn contains(&self, call: &DataCall) -> bool {
        self.calls.iter().any(|c| c == call)
    }

    pub fn remove(&mut self, cid: i32) -> Option<DataCall> {
        let pos = self.calls.iter().position(|c| c.cid == cid)?;
        Some(self.calls.remove(pos))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::ril::parcel::Builder;

    pub fn encode_call(b: &mut Builder<1024>, version: u32, call: &DataCall) {
        b.append_i32(call.status)
            .append_i32(call.retry_time)
            .append_i32(call.cid)
            .append_i32(call.active)
            .append_utf8(call.prot.map(Protocol::as_str));
        b.append_utf8(call.ifname.as_deref());
        append_joined(b, &call.addresses);
        append_joined(b, &call.dnses);
        append_joined(b, &call.gateways);
        if version >= 9 {
            b.append_utf8(Some("")); // pcscf
            if version >= 11 {
                b.append_i32(call.mtu);
            }
        }
    }

    pub fn encode_list(version: u32, calls: &[DataCall]) -> Builder<1024> {
        let mut b = Builder::new();
        b.append_u32(version).append_u32(calls.len() as u32);
        for call in calls {
            encode_call(&mut b, version, call);
        }
        b
    }

    fn append_joined(b: &mut Builder<1024>, list: &AddrList) {
        if list.is_empty() {
            b.append_utf8(None);
            return;
        }
        let mut joined: String<{ MAX_ADDRS * (MAX_ADDR_LEN + 1) }> = String::new();
        for (i, addr) in list.iter().enumerate() {
            if i > 0 {
                joined.push(' ').unwrap();
            }
            joined.push_str(addr).unwrap();
        }
        b.append_utf8(Some(&joined));
    }

    pub fn call(cid: i32) -> DataCall {
        let mut addresses = AddrList::new();
        addresses.push(Addr::try_from("10.0.0.2/24").unwrap()).unwrap();
        let mut dnses = AddrList::new();
        dnses.push(Addr::try_from("8.8.8.8").unwrap()).unwrap();
        let mut gateways = AddrList::new();
        gateways.push(Addr::try_from("10.0.0.1").unwrap()).unwrap();
        DataCall {
            cid,
            status: 0,
            active: crate::ril::data_call_state::ACTIVE,
            prot: Some(Protocol::Ip),
            retry_time: -1,
            mtu: 0,
            ifname: Some(Ifname::try_from("rmnet0").unwrap()),
            addresses,
            dnses,
            gateways,
        }
    }
}
