//! Serving/neighbour cell reporter, available on v9+ peers.
//!
//! Queries GET_CELL_INFO_LIST when the radio is on and the SIM is
//! ready (the request fails without a card), follows the unsolicited
//! list events, and throttles the unsolicited rate with
//! SET_UNSOL_CELL_INFO_LIST_RATE. Reporting is tied to the display:
//! with the screen off the rate is parked at "never" and the cache is
//! dropped.

use core::cell::RefCell;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_time::Duration;
use heapless::Vec;

use crate::chan::{next_unsol, Channel, Queue, Request, RetryPolicy};
use crate::events::{next_event, publish, Events, SlotEvent};
use crate::radio::RadioController;
use crate::ril::parcel::Parser;
use crate::ril::{request, unsol, RadioState};
use crate::sim::SimCard;

pub const MAX_CELLS: usize = 16;

const QUERY_RETRIES: i32 = 5;
/// Rate value meaning "unsolicited reports off".
const RATE_NEVER: i32 = i32::MAX;

mod cell_type {
    pub const GSM: i32 = 1;
    pub const CDMA: i32 = 2;
    pub const LTE: i32 = 3;
    pub const WCDMA: i32 = 4;
    pub const TD_SCDMA: i32 = 5;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GsmCell {
    pub mcc: i32,
    pub mnc: i32,
    pub lac: i32,
    pub cid: i32,
    pub signal_strength: i32,
    pub bit_error_rate: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WcdmaCell {
    pub mcc: i32,
    pub mnc: i32,
    pub lac: i32,
    pub cid: i32,
    pub psc: i32,
    pub signal_strength: i32,
    pub bit_error_rate: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LteCell {
    pub mcc: i32,
    pub mnc: i32,
    pub ci: i32,
    pub pci: i32,
    pub tac: i32,
    pub signal_strength: i32,
    pub rsrp: i32,
    pub rsrq: i32,
    pub rssnr: i32,
    pub cqi: i32,
    pub timing_advance: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cell {
    Gsm { registered: bool, cell: GsmCell },
    Wcdma { registered: bool, cell: WcdmaCell },
    Lte { registered: bool, cell: LteCell },
}

impl Cell {
    pub fn registered(&self) -> bool {
        match self {
            Cell::Gsm { registered, .. }
            | Cell::Wcdma { registered, .. }
            | Cell::Lte { registered, .. } => *registered,
        }
    }
}

fn parse_gsm(p: &mut Parser<'_>, version: u32, registered: bool) -> Option<Cell> {
    let mcc = p.get_i32()?;
    let mnc = p.get_i32()?;
    let lac = p.get_i32()?;
    let cid = p.get_i32()?;
    if version >= 12 {
        p.get_i32()?; // arfcn
        p.get_i32()?; // bsic
    }
    let signal_strength = p.get_i32()?;
    let bit_error_rate = p.get_i32()?;
    if version >= 12 {
        p.get_i32()?; // timing advance
    }
    Some(Cell::Gsm {
        registered,
        cell: GsmCell {
            mcc,
            mnc,
            lac,
            cid,
            signal_strength,
            bit_error_rate,
        },
    })
}

fn parse_wcdma(p: &mut Parser<'_>, version: u32, registered: bool) -> Option<Cell> {
    let mcc = p.get_i32()?;
    let mnc = p.get_i32()?;
    let lac = p.get_i32()?;
    let cid = p.get_i32()?;
    let psc = p.get_i32()?;
    if version >= 12 {
        p.get_i32()?; // uarfcn
    }
    let signal_strength = p.get_i32()?;
    let bit_error_rate = p.get_i32()?;
    Some(Cell::Wcdma {
        registered,
        cell: WcdmaCell {
            mcc,
            mnc,
            lac,
            cid,
            psc,
            signal_strength,
            bit_error_rate,
        },
    })
}

fn parse_lte(p: &mut Parser<'_>, version: u32, registered: bool) -> Option<Cell> {
    let mcc = p.get_i32()?;
    let mnc = p.get_i32()?;
    let ci = p.get_i32()?;
    let pci = p.get_i32()?;
    let tac = p.get_i32()?;
    if version >= 12 {
        p.get_i32()?; // earfcn
    }
    Some(Cell::Lte {
        registered,
        cell: LteCell {
            mcc,
            mnc,
            ci,
            pci,
            tac,
            signal_strength: p.get_i32()?,
            rsrp: p.get_i32()?,
            rsrq: p.get_i32()?,
            rssnr: p.get_i32()?,
            cqi: p.get_i32()?,
            timing_advance: p.get_i32()?,
        },
    })
}

/// Parses one record; unsupported families are skipped field-wise so
/// the rest of the list survives.
fn parse_cell(p: &mut Parser<'_>, version: u32) -> Option<Option<Cell>> {
    let cell_type = p.get_i32()?;
    let registered = p.get_i32()? != 0;
    // Timestamp type + 64-bit timestamp.
    p.get_i32()?;
    p.get_i32()?;
    p.get_i32()?;

    match cell_type {
        cell_type::GSM => Some(parse_gsm(p, version, registered)),
        cell_type::WCDMA => Some(parse_wcdma(p, version, registered)),
        cell_type::LTE => Some(parse_lte(p, version, registered)),
        cell_type::CDMA => {
            for _ in 0..10 {
                p.get_i32()?;
            }
            Some(None)
        }
        cell_type::TD_SCDMA => {
            for _ in 0..6 {
                p.get_i32()?;
            }
            Some(None)
        }
        _ => None,
    }
}

pub fn parse_cell_list(version: u32, data: &[u8]) -> Vec<Cell, MAX_CELLS> {
    let mut cells = Vec::new();
    let mut p = Parser::new(data);
    let Some(n) = p.get_i32() else {
        return cells;
    };
    for _ in 0..n.max(0) {
        match parse_cell(&mut p, version) {
            Some(Some(cell)) => {
                if cells.push(cell).is_err() {
                    break;
                }
            }
            Some(None) => {}
            None => {
                error!("failed to parse cell info");
                break;
            }
        }
    }
    cells
}

struct Inner {
    enabled: bool,
    update_rate: Option<Duration>,
    cells: Vec<Cell, MAX_CELLS>,
}

pub struct CellInfoReporter {
    inner: Mutex<NoopRawMutex, RefCell<Inner>>,
    kick: Signal<NoopRawMutex, ()>,
}

impl Default for CellInfoReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl CellInfoReporter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                enabled: true,
                update_rate: None,
                cells: Vec::new(),
            })),
            kick: Signal::new(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        self.inner.lock(|i| f(&mut i.borrow_mut()))
    }

    pub fn cells(&self) -> Vec<Cell, MAX_CELLS> {
        self.with(|i| i.cells.clone())
    }

    /// Tied to the display: nobody looks at cells with the screen off.
    pub fn set_enabled(&self, enabled: bool) {
        let changed = self.with(|i| {
            if i.enabled != enabled {
                i.enabled = enabled;
                true
            } else {
                false
            }
        });
        if changed {
            self.kick.signal(());
        }
    }

    pub fn set_update_rate(&self, rate: Option<Duration>) {
        self.with(|i| i.update_rate = rate);
        self.kick.signal(());
    }

    fn update_cells(&self, cells: Vec<Cell, MAX_CELLS>, events: &Events) {
        let changed = self.with(|i| {
            if i.cells != cells {
                i.cells = cells;
                true
            } else {
                false
            }
        });
        if changed {
            publish(events, SlotEvent::CellInfoChanged);
        }
    }

    pub async fn run(
        &self,
        chan: &Channel,
        queue: &Queue<'_>,
        radio: &RadioController,
        sim: &SimCard,
        events: &Events,
    ) -> ! {
        chan.wait_connected().await;
        if chan.ril_version() < 9 {
            // Older peers have no cell info interface at all.
            core::future::pending::<()>().await;
        }

        let mut unsol_sub = chan.subscribe_unsol();
        let mut event_sub = events.subscriber().expect("event subscriber");
        let mut was_ready = false;

        loop {
            let refresh = async {
                loop {
                    match select(next_unsol(&mut unsol_sub), next_event(&mut event_sub)).await {
                        Either::First(ev) if ev.code == unsol::CELL_INFO_LIST => {
                            let cells = parse_cell_list(chan.ril_version(), &ev.data);
                            self.update_cells(cells, events);
                        }
                        Either::First(_) => {}
                        Either::Second(
                            SlotEvent::RadioStateChanged
                            | SlotEvent::SimStatusChanged
                            | SlotEvent::SimAppChanged,
                        ) => return,
                        Either::Second(_) => {}
                    }
                }
            };
            let _ = select(refresh, self.kick.wait()).await;

            // The query fails without a SIM card, so gate on readiness.
            let ready = radio.state() == RadioState::On && sim.ready();
            let enabled = self.with(|i| i.enabled);
            if enabled && ready {
                self.query(queue, chan, events).await;
                if !was_ready {
                    self.set_rate(queue).await;
                }
            } else {
                self.update_cells(Vec::new(), events);
            }
            was_ready = ready;
        }
    }

    async fn query(&self, queue: &Queue<'_>, chan: &Channel, events: &Events) {
        let resp = queue
            .send(
                Request::new(request::GET_CELL_INFO_LIST).retry(RetryPolicy::up_to(
                    Duration::from_millis(crate::ril::RETRY_MS),
                    QUERY_RETRIES,
                )),
            )
            .await;
        if resp.status.is_ok() && self.with(|i| i.enabled) {
            let cells = parse_cell_list(chan.ril_version(), &resp.data);
            self.update_cells(cells, events);
        } else {
            self.update_cells(Vec::new(), events);
        }
    }

    async fn set_rate(&self, queue: &Queue<'_>) {
        let rate = self.with(|i| {
            if i.enabled {
                i.update_rate
                    .map(|r| r.as_millis() as i32)
                    .unwrap_or(RATE_NEVER)
            } else {
                RATE_NEVER
            }
        });
        let resp = queue
            .send(
                Request::ints(request::SET_UNSOL_CELL_INFO_LIST_RATE, &[rate]).retry(
                    RetryPolicy::up_to(Duration::from_millis(crate::ril::RETRY_MS), QUERY_RETRIES),
                ),
            )
            .await;
        if !resp.status.is_ok() {
            debug!("cell info rate not accepted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ril::parcel::Builder;

    fn lte_record(b: &mut Builder<512>, registered: bool) {
        b.append_i32(cell_type::LTE)
            .append_i32(registered as i32)
            .append_i32(0) // timestamp type
            .append_i32(0)
            .append_i32(0) // 64-bit timestamp
            .append_i32(250)
            .append_i32(1)
            .append_i32(0xABCD)
            .append_i32(42)
            .append_i32(0x1234)
            .append_i32(20)
            .append_i32(90)
            .append_i32(10)
            .append_i32(50)
            .append_i32(7)
            .append_i32(0);
    }

    #[test]
    fn parse_lte_list() {
        let mut b: Builder<512> = Builder::new();
        b.append_i32(2);
        lte_record(&mut b, true);
        lte_record(&mut b, false);
        let cells = parse_cell_list(11, b.as_slice());
        assert_eq!(cells.len(), 2);
        assert!(cells[0].registered());
        assert!(!cells[1].registered());
        match cells[0] {
            Cell::Lte { cell, .. } => {
                assert_eq!(cell.mcc, 250);
                assert_eq!(cell.ci, 0xABCD);
                assert_eq!(cell.tac, 0x1234);
                assert_eq!(cell.rsrp, 90);
            }
            _ => panic!("wrong family"),
        }
    }

    #[test]
    fn unsupported_family_is_skipped() {
        let mut b: Builder<512> = Builder::new();
        b.append_i32(2);
        // A CDMA record (10 ints) followed by a GSM one.
        b.append_i32(cell_type::CDMA)
            .append_i32(0)
            .append_i32(0)
            .append_i32(0)
            .append_i32(0);
        for _ in 0..10 {
            b.append_i32(0);
        }
        b.append_i32(cell_type::GSM)
            .append_i32(1)
            .append_i32(0)
            .append_i32(0)
            .append_i32(0)
            .append_i32(250)
            .append_i32(1)
            .append_i32(0x1234)
            .append_i32(0x5678)
            .append_i32(21)
            .append_i32(99);
        let cells = parse_cell_list(9, b.as_slice());
        assert_eq!(cells.len(), 1);
        match cells[0] {
            Cell::Gsm { cell, .. } => {
                assert_eq!(cell.lac, 0x1234);
                assert_eq!(cell.cid, 0x5678);
                assert_eq!(cell.signal_strength, 21);
            }
            _ => panic!("wrong family"),
        }
    }

    #[test]
    fn garbage_yields_empty_list() {
        assert!(parse_cell_list(11, &[]).is_empty());
        let mut b: Builder<64> = Builder::new();
        b.append_i32(3).append_i32(99); // bogus type, truncated
        assert!(parse_cell_list(11, b.as_slice()).is_empty());
    }
}
