//! SIM file I/O, PIN/PUK and facility lock operations.
//!
//! Every elementary-file access goes through RIL_REQUEST_SIM_IO with
//! the APDU instruction in the body. The requests are blocking with a
//! 20 s deadline, and each one feeds the card's SIM-I/O activity beacon
//! so the RAT controller stays out of the way during file flurries.

use core::cell::RefCell;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Timer};
use heapless::{String, Vec};

use crate::chan::{Channel, Queue, Request, Response, RetryPolicy};
use crate::error::{Error, Result};
use crate::events::{next_event, Events};
use crate::ril::parcel::Builder;
use crate::ril::{request, AppState, AppType, PinState, Status};

use super::status::SimApp;
use super::SimCard;

const SIM_IO_TIMEOUT: Duration = Duration::from_secs(20);
const FAC_LOCK_QUERY_TIMEOUT: Duration = Duration::from_secs(10);
const FAC_LOCK_QUERY_RETRIES: i32 = 1;
/// Grace period for the card status to reflect a PIN state change.
const STATE_CHANGE_GRACE: Duration = Duration::from_secs(5);

const CMD_READ_BINARY: i32 = 0xB0;
const CMD_READ_RECORD: i32 = 0xB2;
const CMD_GET_RESPONSE: i32 = 0xC0;
const CMD_UPDATE_BINARY: i32 = 0xD6;
const CMD_UPDATE_RECORD: i32 = 0xDC;

/// P2 for absolute record addressing.
const MODE_ABSOLUTE: i32 = 0x04;

const ROOTMF: &str = "3F00";
const EF_ICCID: i32 = 0x2FE2;
const EF_PL: i32 = 0x2F05;

pub const MAX_FILE_DATA: usize = 256;
pub type FileData = Vec<u8, MAX_FILE_DATA>;

/// Password types with tracked retry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PasswdType {
    SimPin = 0,
    SimPin2 = 1,
    SimPuk = 2,
    SimPuk2 = 3,
    PhNetPin = 4,
    PhNetSubPin = 5,
    PhSpPin = 6,
    PhCorpPin = 7,
    PhSimPin = 8,
}

pub const PASSWD_COUNT: usize = 9;

/// What the card currently asks for, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PasswdState {
    None,
    Required(PasswdType),
}

/// Maps the selected application onto the exposed password state.
/// `None` means the state is not known (no app, transient app state).
pub fn passwd_state(app: Option<&SimApp>) -> Option<PasswdState> {
    use crate::ril::PersoSubstate as P;
    let app = app?;
    match app.app_state {
        AppState::Pin => Some(PasswdState::Required(PasswdType::SimPin)),
        AppState::Puk => Some(PasswdState::Required(PasswdType::SimPuk)),
        AppState::Ready => Some(PasswdState::None),
        AppState::SubscriptionPerso => match app.perso_substate {
            P::Ready => Some(PasswdState::None),
            P::SimNetwork => Some(PasswdState::Required(PasswdType::PhNetPin)),
            P::SimNetworkSubset => Some(PasswdState::Required(PasswdType::PhNetSubPin)),
            P::SimCorporate => Some(PasswdState::Required(PasswdType::PhCorpPin)),
            P::SimServiceProvider => Some(PasswdState::Required(PasswdType::PhSpPin)),
            P::SimSim => Some(PasswdState::Required(PasswdType::PhSimPin)),
            _ => None,
        },
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EfStructure {
    Transparent,
    Linear,
    Cyclic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimFileInfo {
    pub file_len: usize,
    pub record_len: usize,
    pub structure: EfStructure,
    pub access: [u8; 3],
    pub valid: bool,
}

struct IoResponse {
    sw1: u8,
    sw2: u8,
    data: FileData,
}

impl IoResponse {
    fn parse(resp: &Response) -> Option<Self> {
        let mut p = resp.parser();
        let sw1 = p.get_i32()?;
        let sw2 = p.get_i32()?;
        let hex: Option<String<{ 2 * MAX_FILE_DATA }>> = p.get_string()?;
        let data = match hex {
            Some(hex) => decode_hex(&hex)?,
            None => FileData::new(),
        };
        Some(Self {
            sw1: sw1 as u8,
            sw2: sw2 as u8,
            data,
        })
    }

    /// Success classification per TS 102.221 / TS 51.011.
    fn ok(&self) -> bool {
        match self.sw1 {
            0x90 => self.sw2 == 0x00,
            0x91 | 0x9e | 0x9f => true,
            // '92 40' is "memory problem", everything else in 0x92 is
            // a success with information.
            0x92 => self.sw2 != 0x40,
            _ => false,
        }
    }
}

pub fn encode_hex<const N: usize>(data: &[u8]) -> String<N> {
    let mut s = String::new();
    for b in data {
        let hi = b >> 4;
        let lo = b & 0xf;
        s.push(char::from_digit(hi as u32, 16).unwrap().to_ascii_uppercase())
            .ok();
        s.push(char::from_digit(lo as u32, 16).unwrap().to_ascii_uppercase())
            .ok();
    }
    s
}

pub fn decode_hex(hex: &str) -> Option<FileData> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let mut out = FileData::new();
    let bytes = hex.as_bytes();
    for pair in bytes.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8).ok()?;
    }
    Some(out)
}

/// TS 51.011 9.2.1 GET RESPONSE payload.
fn parse_2g_file_info(data: &[u8]) -> Option<SimFileInfo> {
    if data.len() < 15 {
        return None;
    }
    let file_len = ((data[2] as usize) << 8) | data[3] as usize;
    let structure = match data[13] {
        0x00 => EfStructure::Transparent,
        0x01 => EfStructure::Linear,
        0x03 => EfStructure::Cyclic,
        _ => return None,
    };
    let record_len = if structure == EfStructure::Transparent {
        0
    } else {
        data[14] as usize
    };
    Some(SimFileInfo {
        file_len,
        record_len,
        structure,
        access: [data[8], data[9], data[10]],
        valid: data[11] & 0x01 != 0,
    })
}

/// TS 102.221 FCP template (tag 0x62).
fn parse_3g_file_info(data: &[u8]) -> Option<SimFileInfo> {
    if data.first() != Some(&0x62) || data.len() < 2 {
        return None;
    }
    let mut info = SimFileInfo {
        file_len: 0,
        record_len: 0,
        structure: EfStructure::Transparent,
        access: [0; 3],
        valid: true,
    };
    let mut pos = 2;
    let end = (2 + data[1] as usize).min(data.len());
    while pos + 2 <= end {
        let tag = data[pos];
        let len = data[pos + 1] as usize;
        let value = data.get(pos + 2..pos + 2 + len)?;
        match tag {
            0x80 if len >= 2 => {
                info.file_len = ((value[0] as usize) << 8) | value[1] as usize;
            }
            0x82 if len >= 2 => {
                info.structure = match value[0] & 0x07 {
                    0x01 => EfStructure::Transparent,
                    0x02 => EfStructure::Linear,
                    0x06 => EfStructure::Cyclic,
                    _ => return None,
                };
                if len >= 4 {
                    info.record_len = ((value[2] as usize) << 8) | value[3] as usize;
                }
            }
            _ => {}
        }
        pos += 2 + len;
    }
    Some(info)
}

struct IoInner {
    retries: [i32; PASSWD_COUNT],
    empty_pin_query_allowed: bool,
}

/// Per-slot SIM operation facade. One per slot, owning its own channel
/// queue so tear-down cancels exactly its traffic.
pub struct SimIo<'a> {
    card: &'a SimCard,
    events: &'a Events,
    queue: Queue<'a>,
    inner: Mutex<NoopRawMutex, RefCell<IoInner>>,
}

impl<'a> SimIo<'a> {
    pub fn new(chan: &'a Channel, card: &'a SimCard, events: &'a Events, empty_pin_query: bool) -> Self {
        Self {
            card,
            events,
            queue: chan.queue(),
            inner: Mutex::new(RefCell::new(IoInner {
                retries: [-1; PASSWD_COUNT],
                empty_pin_query_allowed: empty_pin_query,
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut IoInner) -> R) -> R {
        self.inner.lock(|i| f(&mut i.borrow_mut()))
    }

    /// Path of an EF when the caller did not provide one. The root
    /// files live directly under the MF; everything else sits under the
    /// application DF.
    fn default_path(&self, fileid: i32) -> Option<&'static str> {
        if fileid == EF_ICCID || fileid == EF_PL {
            return Some(ROOTMF);
        }
        match self.card.app().map(|a| a.app_type) {
            Some(AppType::Usim) => Some("3F007FFF"),
            Some(AppType::Sim) => Some("3F007F20"),
            _ => None,
        }
    }

    async fn request_io(
        &self,
        cmd: i32,
        fileid: i32,
        p1: i32,
        p2: i32,
        p3: i32,
        hex_data: Option<&str>,
        path: Option<&[u8]>,
    ) -> Result<IoResponse> {
        let aid = self.card.app_aid();
        let mut body: Builder<{ crate::chan::MAX_BODY }> = Builder::new();
        body.append_i32(cmd).append_i32(fileid);
        match path {
            Some(path) if !path.is_empty() && path.len() < 7 => {
                let hex: String<16> = encode_hex(path);
                body.append_utf8(Some(&hex));
            }
            _ => {
                body.append_utf8(self.default_path(fileid));
            }
        }
        body.append_i32(p1)
            .append_i32(p2)
            .append_i32(p3)
            .append_utf8(hex_data)
            .append_utf8(None) // pin2, writes only
            .append_utf8(aid.as_deref());

        let sub = self.queue.submit(
            Request::with_body(request::SIM_IO, body)
                .blocking()
                .timeout(SIM_IO_TIMEOUT),
        );
        let serial = sub.serial();
        self.card.sim_io_started(serial, self.events);
        let resp = sub.await;
        self.card.sim_io_finished(serial, self.events);

        let parsed = IoResponse::parse(&resp);
        match (resp.status, parsed) {
            (Status::Ok, Some(io)) if io.ok() => Ok(io),
            (_, Some(io)) => Err(Error::Sim {
                sw1: io.sw1,
                sw2: io.sw2,
            }),
            (Status::Ok, None) => Err(Error::Parse),
            (status, None) => Err(Error::from_status(status)),
        }
    }

    pub async fn read_file_info(&self, fileid: i32, path: Option<&[u8]>) -> Result<SimFileInfo> {
        let io = self
            .request_io(CMD_GET_RESPONSE, fileid, 0, 0, 15, None, path)
            .await?;
        if io.data.first() == Some(&0x62) {
            parse_3g_file_info(&io.data).ok_or(Error::Parse)
        } else {
            parse_2g_file_info(&io.data).ok_or(Error::Parse)
        }
    }

    pub async fn read_file_transparent(
        &self,
        fileid: i32,
        start: u16,
        length: usize,
        path: Option<&[u8]>,
    ) -> Result<FileData> {
        let io = self
            .request_io(
                CMD_READ_BINARY,
                fileid,
                (start >> 8) as i32,
                (start & 0xff) as i32,
                length as i32,
                None,
                path,
            )
            .await?;
        Ok(io.data)
    }

    pub async fn read_file_linear(
        &self,
        fileid: i32,
        record: u8,
        length: usize,
        path: Option<&[u8]>,
    ) -> Result<FileData> {
        let io = self
            .request_io(
                CMD_READ_RECORD,
                fileid,
                record as i32,
                MODE_ABSOLUTE,
                length as i32,
                None,
                path,
            )
            .await?;
        Ok(io.data)
    }

    pub async fn read_file_cyclic(
        &self,
        fileid: i32,
        record: u8,
        length: usize,
        path: Option<&[u8]>,
    ) -> Result<FileData> {
        self.read_file_linear(fileid, record, length, path).await
    }

    pub async fn write_file_transparent(
        &self,
        fileid: i32,
        start: u16,
        data: &[u8],
        path: Option<&[u8]>,
    ) -> Result<()> {
        let hex: String<{ 2 * MAX_FILE_DATA }> = encode_hex(data);
        self.request_io(
            CMD_UPDATE_BINARY,
            fileid,
            (start >> 8) as i32,
            (start & 0xff) as i32,
            data.len() as i32,
            Some(&hex),
            path,
        )
        .await?;
        Ok(())
    }

    pub async fn write_file_linear(
        &self,
        fileid: i32,
        record: u8,
        data: &[u8],
        path: Option<&[u8]>,
    ) -> Result<()> {
        let hex: String<{ 2 * MAX_FILE_DATA }> = encode_hex(data);
        self.request_io(
            CMD_UPDATE_RECORD,
            fileid,
            record as i32,
            MODE_ABSOLUTE,
            data.len() as i32,
            Some(&hex),
            path,
        )
        .await?;
        Ok(())
    }

    pub async fn write_file_cyclic(
        &self,
        fileid: i32,
        data: &[u8],
        path: Option<&[u8]>,
    ) -> Result<()> {
        // P1 is ignored for cyclic files, records rotate.
        self.write_file_linear(fileid, 0, data, path).await
    }

    pub async fn read_imsi(&self) -> Result<super::settings::Imsi> {
        let aid = self.card.app_aid();
        let mut body: Builder<{ crate::chan::MAX_BODY }> = Builder::new();
        body.append_utf8_array(&[aid.as_deref()]);
        let resp = self
            .queue
            .send(Request::with_body(request::GET_IMSI, body).blocking())
            .await;
        if !resp.status.is_ok() {
            return Err(Error::from_status(resp.status));
        }
        let imsi: Option<super::settings::Imsi> =
            resp.parser().get_string().ok_or(Error::Parse)?;
        imsi.ok_or(Error::Parse)
    }

    /// Exposed password state from the cached card status.
    pub fn passwd_state(&self) -> Option<PasswdState> {
        passwd_state(self.card.app().as_ref())
    }

    /// Queries the password state, asking for a fresh card status and
    /// allowing a short grace period for the state to settle.
    pub async fn query_passwd_state(&self, chan: &Channel) -> Result<PasswdState> {
        self.card.request_status(chan);
        let mut sub = self.events.subscriber().map_err(|_| Error::Overflow)?;
        let deadline = Timer::after(STATE_CHANGE_GRACE);
        let wait = async {
            loop {
                if let Some(state) = self.passwd_state() {
                    return state;
                }
                let _ = next_event(&mut sub).await;
            }
        };
        match select(wait, deadline).await {
            Either::First(state) => Ok(state),
            Either::Second(()) => Err(Error::Timeout),
        }
    }

    /// Retry counters, permanently-locked PUK clamped to zero no matter
    /// what the peer said.
    pub fn retries(&self) -> [i32; PASSWD_COUNT] {
        let mut retries = self.with(|i| i.retries);
        if let Some(app) = self.card.app() {
            if app.app_state == AppState::Puk && app.pin1_state == PinState::EnabledPermBlocked {
                retries[PasswdType::SimPuk as usize] = 0;
            }
        }
        retries
    }

    async fn send_passwd(
        &self,
        chan: &Channel,
        code: u32,
        strings: &[Option<&str>],
        passwd_type: PasswdType,
    ) -> Result<()> {
        let mut body: Builder<{ crate::chan::MAX_BODY }> = Builder::new();
        body.append_utf8_array(strings);
        let resp = self
            .queue
            .send(Request::with_body(code, body).blocking())
            .await;

        if let Some(count) = parse_retry_count(&resp) {
            self.with(|i| i.retries[passwd_type as usize] = count);
        }

        if !resp.status.is_ok() {
            return Err(Error::from_status(resp.status));
        }

        // The card status lags the verification; wait for it to move
        // off the entered state (bounded by the usual grace).
        self.card.request_status(chan);
        let mut sub = self.events.subscriber().map_err(|_| Error::Overflow)?;
        let settle = async {
            loop {
                match self.passwd_state() {
                    Some(PasswdState::Required(t)) if t == passwd_type => {}
                    _ => return,
                }
                let _ = next_event(&mut sub).await;
            }
        };
        match select(settle, Timer::after(STATE_CHANGE_GRACE)).await {
            Either::First(()) => Ok(()),
            Either::Second(()) => Err(Error::Timeout),
        }
    }

    pub async fn enter_pin(&self, chan: &Channel, pin: &str) -> Result<()> {
        let aid = self.card.app_aid();
        self.send_passwd(
            chan,
            request::ENTER_SIM_PIN,
            &[Some(pin), aid.as_deref()],
            PasswdType::SimPin,
        )
        .await
    }

    pub async fn enter_pin2(&self, chan: &Channel, pin2: &str) -> Result<()> {
        let aid = self.card.app_aid();
        self.send_passwd(
            chan,
            request::ENTER_SIM_PIN2,
            &[Some(pin2), aid.as_deref()],
            PasswdType::SimPin2,
        )
        .await
    }

    pub async fn enter_puk(&self, chan: &Channel, puk: &str, new_pin: &str) -> Result<()> {
        let aid = self.card.app_aid().ok_or(Error::NoSim)?;
        self.send_passwd(
            chan,
            request::ENTER_SIM_PUK,
            &[Some(puk), Some(new_pin), Some(aid.as_str())],
            PasswdType::SimPuk,
        )
        .await
    }

    pub async fn enter_puk2(&self, chan: &Channel, puk2: &str, new_pin2: &str) -> Result<()> {
        let aid = self.card.app_aid().ok_or(Error::NoSim)?;
        self.send_passwd(
            chan,
            request::ENTER_SIM_PUK2,
            &[Some(puk2), Some(new_pin2), Some(aid.as_str())],
            PasswdType::SimPuk2,
        )
        .await
    }

    pub async fn change_pin(&self, chan: &Channel, old: &str, new: &str) -> Result<()> {
        let aid = self.card.app_aid();
        self.send_passwd(
            chan,
            request::CHANGE_SIM_PIN,
            &[Some(old), Some(new), aid.as_deref()],
            PasswdType::SimPin,
        )
        .await
    }

    pub async fn change_pin2(&self, chan: &Channel, old: &str, new: &str) -> Result<()> {
        let aid = self.card.app_aid();
        self.send_passwd(
            chan,
            request::CHANGE_SIM_PIN2,
            &[Some(old), Some(new), aid.as_deref()],
            PasswdType::SimPin2,
        )
        .await
    }

    pub async fn depersonalize(&self, chan: &Channel, passwd: &str) -> Result<()> {
        self.send_passwd(
            chan,
            request::ENTER_NETWORK_DEPERSONALIZATION,
            &[Some(passwd)],
            PasswdType::PhNetPin,
        )
        .await
    }

    /// Some peers let us probe retry counters by submitting the empty
    /// password; when one refuses, we stop asking for good.
    pub async fn query_pin_retries(&self) -> Result<[i32; PASSWD_COUNT]> {
        if self.with(|i| i.empty_pin_query_allowed) {
            let aid = self.card.app_aid();
            let queries: [(u32, PasswdType, [Option<&str>; 3], usize); 2] = [
                (
                    request::ENTER_SIM_PIN,
                    PasswdType::SimPin,
                    [Some(""), aid.as_deref(), None],
                    2,
                ),
                (
                    request::ENTER_SIM_PUK,
                    PasswdType::SimPuk,
                    [Some(""), Some(""), aid.as_deref()],
                    3,
                ),
            ];
            for (code, passwd_type, strings, n) in queries {
                if self.with(|i| i.retries[passwd_type as usize] >= 0) {
                    continue;
                }
                let mut body: Builder<{ crate::chan::MAX_BODY }> = Builder::new();
                body.append_utf8_array(&strings[..n]);
                let resp = self.queue.send(Request::with_body(code, body)).await;
                match parse_retry_count(&resp) {
                    Some(count) if count >= 0 => {
                        self.with(|i| i.retries[passwd_type as usize] = count);
                    }
                    _ => {
                        warn!("pin retry query is not supported");
                        self.with(|i| i.empty_pin_query_allowed = false);
                        break;
                    }
                }
            }
        }
        Ok(self.retries())
    }

    /// Queries a facility lock ("SC", "FD", ...); true means engaged.
    pub async fn query_facility_lock(&self, facility: &str) -> Result<bool> {
        let aid = self.card.app_aid();
        let mut body: Builder<{ crate::chan::MAX_BODY }> = Builder::new();
        body.append_utf8_array(&[Some(facility), Some(""), Some("0"), aid.as_deref()]);
        let resp = self
            .queue
            .send(
                Request::with_body(request::QUERY_FACILITY_LOCK, body)
                    .timeout(FAC_LOCK_QUERY_TIMEOUT)
                    .retry(RetryPolicy::up_to(
                        Duration::from_millis(crate::ril::RETRY_MS),
                        FAC_LOCK_QUERY_RETRIES,
                    )),
            )
            .await;
        if !resp.status.is_ok() {
            return Err(Error::from_status(resp.status));
        }
        let mut p = resp.parser();
        p.get_i32();
        let status = p.get_i32().ok_or(Error::Parse)?;
        Ok(status != 0)
    }

    pub async fn set_facility_lock(
        &self,
        facility: &str,
        lock: bool,
        passwd: &str,
    ) -> Result<()> {
        let aid = self.card.app_aid();
        let mut body: Builder<{ crate::chan::MAX_BODY }> = Builder::new();
        body.append_utf8_array(&[
            Some(facility),
            Some(if lock { "1" } else { "0" }),
            Some(passwd),
            Some("0"),
            aid.as_deref(),
        ]);
        let resp = self
            .queue
            .send(Request::with_body(request::SET_FACILITY_LOCK, body).blocking())
            .await;
        if let Some(count) = parse_retry_count(&resp) {
            // Facility "SC" guards PIN1.
            if facility == "SC" {
                self.with(|i| i.retries[PasswdType::SimPin as usize] = count);
            }
        }
        if resp.status.is_ok() {
            Ok(())
        } else {
            Err(Error::from_status(resp.status))
        }
    }

    /// Cancels everything this facade has in flight.
    pub fn shutdown(&self) {
        self.queue.cancel_all();
    }
}

/// Responses to PIN operations carry `[count, retries]`.
fn parse_retry_count(resp: &Response) -> Option<i32> {
    let mut p = resp.parser();
    p.get_i32()?;
    p.get_i32()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ril::RilError;

    #[test]
    fn hex_round_trip() {
        let data = [0x3F, 0x00, 0x7F, 0x20, 0xAB];
        let hex: String<16> = encode_hex(&data);
        assert_eq!(hex, "3F007F20AB");
        assert_eq!(decode_hex(&hex).unwrap().as_slice(), &data);
        assert!(decode_hex("ABC").is_none());
        assert!(decode_hex("XY").is_none());
    }

    #[test]
    fn status_word_classification() {
        let ok = |sw1, sw2| IoResponse {
            sw1,
            sw2,
            data: FileData::new(),
        };
        assert!(ok(0x90, 0x00).ok());
        assert!(ok(0x91, 0x05).ok());
        assert!(ok(0x92, 0x01).ok());
        assert!(!ok(0x92, 0x40).ok()); // memory problem
        assert!(!ok(0x90, 0x01).ok());
        assert!(!ok(0x6a, 0x82).ok()); // file not found
        assert!(!ok(0x94, 0x04).ok());
    }

    #[test]
    fn file_info_2g() {
        // EF_ICCID-like: size 10, transparent.
        let data = [
            0x00, 0x00, 0x00, 0x0A, 0x2F, 0xE2, 0x04, 0x00, 0x0F, 0xF0, 0xFF, 0x01, 0x02, 0x00,
            0x00,
        ];
        let info = parse_2g_file_info(&data).unwrap();
        assert_eq!(info.file_len, 10);
        assert_eq!(info.structure, EfStructure::Transparent);
        assert_eq!(info.record_len, 0);
        assert_eq!(info.access, [0x0F, 0xF0, 0xFF]);
        assert!(info.valid);

        // Linear fixed with 0x20-byte records.
        let mut rec = data;
        rec[13] = 0x01;
        rec[14] = 0x20;
        let info = parse_2g_file_info(&rec).unwrap();
        assert_eq!(info.structure, EfStructure::Linear);
        assert_eq!(info.record_len, 0x20);
    }

    #[test]
    fn file_info_3g_fcp() {
        // FCP with file descriptor (linear, 0x1A records) and size 0x68.
        let data = [
            0x62, 0x0C, // FCP, 12 bytes
            0x82, 0x05, 0x42, 0x21, 0x00, 0x1A, 0x04, // descriptor
            0x80, 0x02, 0x00, 0x68, // size
            0x00,
        ];
        let info = parse_3g_file_info(&data).unwrap();
        assert_eq!(info.structure, EfStructure::Linear);
        assert_eq!(info.record_len, 0x1A);
        assert_eq!(info.file_len, 0x68);

        assert!(parse_3g_file_info(&[0x62]).is_none());
        assert!(parse_2g_file_info(&[0x00]).is_none());
    }

    #[test]
    fn passwd_state_mapping() {
        use crate::ril::PersoSubstate;

        assert_eq!(passwd_state(None), None);

        let mut app = SimApp::default();
        app.app_state = AppState::Pin;
        assert_eq!(
            passwd_state(Some(&app)),
            Some(PasswdState::Required(PasswdType::SimPin))
        );

        app.app_state = AppState::Puk;
        assert_eq!(
            passwd_state(Some(&app)),
            Some(PasswdState::Required(PasswdType::SimPuk))
        );

        app.app_state = AppState::Ready;
        assert_eq!(passwd_state(Some(&app)), Some(PasswdState::None));

        app.app_state = AppState::SubscriptionPerso;
        app.perso_substate = PersoSubstate::SimNetwork;
        assert_eq!(
            passwd_state(Some(&app)),
            Some(PasswdState::Required(PasswdType::PhNetPin))
        );

        app.perso_substate = PersoSubstate::InProgress;
        assert_eq!(passwd_state(Some(&app)), None);

        app.app_state = AppState::Detected;
        assert_eq!(passwd_state(Some(&app)), None);
    }

    #[test]
    fn perm_blocked_puk_retries_are_zero() {
        use crate::ril::CardState;
        use crate::sim::status::SimStatus;
        use heapless::Vec as HVec;

        let chan = Channel::new();
        let events = Events::new();
        let card = SimCard::new(0, true);

        let mut apps = HVec::new();
        apps.push(SimApp {
            app_type: AppType::Usim,
            app_state: AppState::Puk,
            pin1_state: PinState::EnabledPermBlocked,
            ..Default::default()
        })
        .unwrap();
        card.apply_status(
            SimStatus {
                card_state: CardState::Present,
                pin_state: PinState::Unknown,
                gsm_umts_index: 0,
                cdma_index: -1,
                ims_index: -1,
                apps,
            },
            &events,
        );

        let io = SimIo::new(&chan, &card, &events, true);
        // Peer claims three PUK attempts remain; the lock state wins.
        io.with(|i| i.retries[PasswdType::SimPuk as usize] = 3);
        assert_eq!(io.retries()[PasswdType::SimPuk as usize], 0);
        // PIN retry reporting is untouched.
        io.with(|i| i.retries[PasswdType::SimPin as usize] = 2);
        assert_eq!(io.retries()[PasswdType::SimPin as usize], 2);
    }

    #[test]
    fn retry_count_parse() {
        let mut b: Builder<64> = Builder::new();
        b.append_i32(1).append_i32(2);
        let resp = Response {
            status: Status::Error(RilError::PasswordIncorrect),
            data: {
                let mut v = crate::chan::ResponseData::new();
                v.extend_from_slice(b.as_slice()).unwrap();
                v
            },
        };
        assert_eq!(parse_retry_count(&resp), Some(2));
    }
}
