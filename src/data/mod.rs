//! Per-slot data-allow and data-call engine.
//!
//! One engine per slot. Data requests (allow, setup, deactivate) run
//! through a strictly serial FIFO: at most one has a pending serial at
//! any time. The engine also mirrors the peer's data call list, reaps
//! contexts nobody claimed, and folds the restricted-state mask into
//! the exposed "data allowed" predicate.
//!
//! The ALLOWED/MAX_SPEED flags are owned cross-slot by the
//! [`manager::DataManager`]; the engine only stores them.

pub mod call;
pub mod context;
pub mod manager;

use core::cell::RefCell;
use core::future::poll_fn;
use core::task::Poll;

use embassy_futures::join::join3;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use embassy_sync::waitqueue::MultiWakerRegistration;
use embassy_time::{Duration, Timer};
use heapless::{Deque, FnvIndexMap, String, Vec};

use crate::chan::{next_unsol, Channel, Queue, Request, RetryPolicy};
use crate::config::{AllowData, DataOptions};
use crate::events::{publish, Events, SlotEvent};
use crate::network::NetworkController;
use crate::radio::{PowerTag, RadioController};
use crate::ril::parcel::Builder;
use crate::ril::{auth, deact_reason, pdp_fail, radio_tech, request, restricted_state, unsol, Status};
use crate::vendor::VendorHook;

use call::{DataCall, DataCallList, Protocol};

/// Data call setup can genuinely take minutes in roaming.
const SETUP_DATA_CALL_TIMEOUT: Duration = Duration::from_secs(300);

const DATA_PROFILE_DEFAULT: &str = "0";

pub const MAX_REQUESTS: usize = 8;
pub const MAX_RESULTS: usize = 4;

const FLAG_ALLOWED: u8 = 0x01;
const FLAG_MAX_SPEED: u8 = 0x02;
const FLAG_ON: u8 = 0x04;

const REQ_CANCEL_WHEN_ALLOWED: u8 = 0x01;
const REQ_CANCEL_WHEN_DISALLOWED: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataRole {
    #[default]
    None,
    Mms,
    Internet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AuthMethod {
    #[default]
    Any,
    None,
    Chap,
    Pap,
}

impl AuthMethod {
    /// The wire value; anonymous contexts never authenticate.
    fn to_ril(self, username: &str) -> i32 {
        if username.is_empty() {
            return auth::NONE;
        }
        match self {
            AuthMethod::Any => auth::BOTH,
            AuthMethod::None => auth::NONE,
            AuthMethod::Chap => auth::CHAP,
            AuthMethod::Pap => auth::PAP,
        }
    }
}

/// Parameters of a context activation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetupParams {
    pub apn: String<100>,
    pub username: String<64>,
    pub password: String<64>,
    pub proto: Protocol,
    pub auth_method: AuthMethod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataRequestKind {
    Setup,
    Deactivate { cid: i32 },
    Allow(bool),
}

#[derive(Debug, Clone)]
struct DataRequest {
    id: u32,
    kind: DataRequestKind,
    /// Setup parameters live out of band to keep the queue entries
    /// small; only one setup per id.
    setup: Option<SetupParams>,
    flags: u8,
    /// Whether anybody intends to collect the result.
    watched: bool,
}

/// Terminal outcome of a data request, collected via
/// [`DataEngine::wait_result`].
#[derive(Debug, Clone)]
pub struct RequestResult {
    pub status: Status,
    /// The negotiated call, for successful setups.
    pub call: Option<DataCall>,
}

struct Inner {
    flags: u8,
    restricted: u32,
    calls: Option<DataCallList>,
    grab: FnvIndexMap<i32, u8, { call::MAX_CALLS }>,
    queue: Deque<DataRequest, MAX_REQUESTS>,
    pending: Option<DataRequest>,
    pending_serial: u32,
    query_serial: u32,
    want_query: bool,
    next_id: u32,
    results: FnvIndexMap<u32, RequestResult, MAX_RESULTS>,
    results_waker: MultiWakerRegistration<4>,
}

impl Inner {
    fn allowed(&self) -> bool {
        (self.restricted & restricted_state::PS_ALL) == 0
            && self.flags & (FLAG_ALLOWED | FLAG_ON) == (FLAG_ALLOWED | FLAG_ON)
    }

    fn requests_pending(&self) -> bool {
        self.pending.is_some() || !self.queue.is_empty()
    }

    fn finish(&mut self, id: u32, watched: bool, result: RequestResult) {
        if watched {
            if self.results.insert(id, result).is_err() {
                warn!("data result table full, dropping result {}", id);
            }
            self.results_waker.wake();
        }
    }

    /// Replaces the cached list; returns (changed, stray cid to reap).
    fn set_calls(&mut self, new: Option<DataCallList>) -> (bool, Option<i32>) {
        let changed = self.calls != new;
        if changed {
            debug!("data calls changed");
            self.calls = new;
        }

        // A grab for a cid that is gone is implicitly released.
        let present: Vec<i32, { call::MAX_CALLS }> = self
            .calls
            .as_ref()
            .map(|l| l.calls.iter().map(|c| c.cid).collect())
            .unwrap_or_default();
        let stale: Vec<i32, { call::MAX_CALLS }> = self
            .grab
            .keys()
            .filter(|cid| !present.contains(cid))
            .copied()
            .collect();
        for cid in stale {
            self.grab.remove(&cid);
        }

        // Disconnect stray calls, one per reconciliation.
        let stray = self.calls.as_ref().and_then(|list| {
            list.calls
                .iter()
                .find(|c| !self.grab.contains_key(&c.cid))
                .map(|c| c.cid)
        });
        (changed, stray)
    }
}

pub struct DataEngine {
    inner: Mutex<NoopRawMutex, RefCell<Inner>>,
    kick_queue: Signal<NoopRawMutex, ()>,
    kick_query: Signal<NoopRawMutex, ()>,
    kick_cancel: Signal<NoopRawMutex, ()>,
    slot: u32,
    options: DataOptions,
}

impl DataEngine {
    pub fn new(slot: u32, options: DataOptions) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                flags: 0,
                restricted: 0,
                calls: None,
                grab: FnvIndexMap::new(),
                queue: Deque::new(),
                pending: None,
                pending_serial: 0,
                query_serial: 0,
                want_query: true,
                next_id: 1,
                results: FnvIndexMap::new(),
                results_waker: MultiWakerRegistration::new(),
            })),
            kick_queue: Signal::new(),
            kick_query: Signal::new(),
            kick_cancel: Signal::new(),
            slot,
            options,
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        self.inner.lock(|i| f(&mut i.borrow_mut()))
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// The predicate exposed upward: allowed, confirmed on, and packet
    /// services not restricted.
    pub fn allowed(&self) -> bool {
        self.with(|i| i.allowed())
    }

    pub fn allowed_flag(&self) -> bool {
        self.with(|i| i.flags & FLAG_ALLOWED != 0)
    }

    pub fn max_speed(&self) -> bool {
        self.with(|i| i.flags & FLAG_MAX_SPEED != 0)
    }

    pub fn on(&self) -> bool {
        self.with(|i| i.flags & FLAG_ON != 0)
    }

    pub fn requests_pending(&self) -> bool {
        self.with(|i| i.requests_pending())
    }

    pub fn calls(&self) -> Option<DataCallList> {
        self.with(|i| i.calls.clone())
    }

    pub fn find_call(&self, cid: i32) -> Option<DataCall> {
        self.with(|i| i.calls.as_ref().and_then(|l| l.find(cid)).cloned())
    }

    /// Whether ALLOW_DATA is actually spoken to this peer; the request
    /// appeared in RIL v10 and older rilds choke on it.
    pub fn allow_data_enabled(&self, chan: &Channel) -> bool {
        match self.options.allow_data {
            AllowData::Enabled => true,
            AllowData::Disabled => false,
            AllowData::Auto => chan.ril_version() > 10,
        }
    }

    /// Claims a context id for an owner. At most one owner per cid; a
    /// repeated grab by the same owner is fine.
    pub fn grab(&self, cid: i32, owner: u8) -> bool {
        self.with(|i| {
            if i.calls.as_ref().and_then(|l| l.find(cid)).is_none() {
                return false;
            }
            match i.grab.get(&cid) {
                None => i.grab.insert(cid, owner).is_ok(),
                Some(existing) => *existing == owner,
            }
        })
    }

    pub fn release(&self, cid: i32, owner: u8) {
        self.with(|i| {
            if i.grab.get(&cid) == Some(&owner) {
                i.grab.remove(&cid);
            }
        });
    }

    pub fn grabbed(&self, cid: i32) -> bool {
        self.with(|i| i.grab.contains_key(&cid))
    }

    fn enqueue(&self, kind: DataRequestKind, setup: Option<SetupParams>, flags: u8, watched: bool) -> u32 {
        let id = self.with(|i| {
            let id = i.next_id;
            i.next_id = i.next_id.wrapping_add(1).max(1);
            let req = DataRequest {
                id,
                kind,
                setup,
                flags,
                watched,
            };
            if i.queue.push_back(req).is_err() {
                error!("data request queue overflow");
                return 0;
            }
            id
        });
        self.kick_queue.signal(());
        id
    }

    /// Queues a context activation.
    pub fn queue_setup(&self, params: SetupParams) -> u32 {
        self.enqueue(
            DataRequestKind::Setup,
            Some(params),
            REQ_CANCEL_WHEN_DISALLOWED,
            true,
        )
    }

    /// Queues a context deactivation.
    pub fn queue_deactivate(&self, cid: i32) -> u32 {
        self.enqueue(DataRequestKind::Deactivate { cid }, None, 0, true)
    }

    fn queue_deactivate_unwatched(&self, cid: i32) {
        self.enqueue(DataRequestKind::Deactivate { cid }, None, 0, false);
    }

    pub(crate) fn queue_allow(&self, allow: bool) {
        self.enqueue(
            DataRequestKind::Allow(allow),
            None,
            REQ_CANCEL_WHEN_DISALLOWED,
            false,
        );
    }

    /// Collects the outcome of a queued request.
    pub async fn wait_result(&self, id: u32) -> RequestResult {
        if id == 0 {
            return RequestResult {
                status: Status::Cancelled,
                call: None,
            };
        }
        poll_fn(|cx| {
            self.with(|i| match i.results.remove(&id) {
                Some(result) => Poll::Ready(result),
                None => {
                    i.results_waker.register(cx.waker());
                    Poll::Pending
                }
            })
        })
        .await
    }

    /// Coalesced DATA_CALL_LIST poll.
    pub fn poll_call_state(&self, chan: &Channel) {
        let serial = self.with(|i| i.query_serial);
        if serial != 0 {
            chan.retry_now(serial);
        } else {
            self.with(|i| i.want_query = true);
            self.kick_query.signal(());
        }
    }

    /// Cancels queued and pending requests carrying `mask`.
    fn cancel_requests(&self, chan: &Channel, mask: u8) {
        let (cancelled, pending_serial) = self.with(|i| {
            let mut cancelled: Vec<(u32, bool), MAX_REQUESTS> = Vec::new();
            let mut keep: Deque<DataRequest, MAX_REQUESTS> = Deque::new();
            while let Some(req) = i.queue.pop_front() {
                if req.flags & mask != 0 {
                    cancelled.push((req.id, req.watched)).ok();
                } else {
                    keep.push_back(req).ok();
                }
            }
            i.queue = keep;
            let pending_serial = match i.pending.as_ref() {
                Some(req) if req.flags & mask != 0 => i.pending_serial,
                _ => 0,
            };
            (cancelled, pending_serial)
        });
        for (id, watched) in cancelled {
            self.with(|i| {
                i.finish(
                    id,
                    watched,
                    RequestResult {
                        status: Status::Cancelled,
                        call: None,
                    },
                )
            });
        }
        if pending_serial != 0 {
            chan.cancel(pending_serial, true);
        }
        // Abort a setup sitting in its silent-retry gap too.
        self.kick_cancel.signal(());
    }

    pub(crate) fn power_update(&self, radio: &RadioController) {
        if self.with(|i| i.requests_pending()) {
            radio.power_on(PowerTag::Data);
        } else {
            radio.power_off(PowerTag::Data);
        }
    }

    fn check_allowed(&self, was_allowed: bool, events: &Events) {
        if self.allowed() != was_allowed {
            publish(events, SlotEvent::AllowChanged);
        }
    }

    /// Flag plumbing for the cross-slot manager.
    pub(crate) fn set_allowed_flag(&self, on: bool) {
        self.with(|i| {
            if on {
                i.flags |= FLAG_ALLOWED;
            } else {
                i.flags &= !FLAG_ALLOWED;
            }
        });
    }

    pub(crate) fn set_max_speed_flag(&self, on: bool) {
        self.with(|i| {
            if on {
                i.flags |= FLAG_MAX_SPEED;
            } else {
                i.flags &= !FLAG_MAX_SPEED;
            }
        });
    }

    pub(crate) fn set_on_flag(&self, on: bool) {
        self.with(|i| {
            if on {
                i.flags |= FLAG_ON;
            } else {
                i.flags &= !FLAG_ON;
            }
        });
    }

    pub(crate) fn cancel_when_allowed(&self, chan: &Channel) {
        self.cancel_requests(chan, REQ_CANCEL_WHEN_ALLOWED);
    }

    /// Withdraws the data role from this slot: cancel what can be
    /// cancelled, tell the peer data is off, and drop every context.
    pub(crate) fn disallow(
        &self,
        chan: &Channel,
        radio: &RadioController,
        events: &Events,
    ) {
        debug!("data disallowed");
        let was_allowed = self.allowed();
        self.set_allowed_flag(false);

        self.cancel_requests(chan, REQ_CANCEL_WHEN_DISALLOWED);

        if self.allow_data_enabled(chan) {
            // Tell rild data is now disabled, then tear the contexts
            // down behind it.
            self.queue_allow(false);
        }

        let active: Vec<i32, { call::MAX_CALLS }> = self.with(|i| {
            i.calls
                .as_ref()
                .map(|l| {
                    l.calls
                        .iter()
                        .filter(|c| c.status == pdp_fail::NONE)
                        .map(|c| c.cid)
                        .collect()
                })
                .unwrap_or_default()
        });
        for cid in active {
            debug!("deactivating call {}", cid);
            self.queue_deactivate_unwatched(cid);
        }

        if !self.allow_data_enabled(chan) {
            self.set_on_flag(false);
            debug!("data off");
        }

        self.power_update(radio);
        self.check_allowed(was_allowed, events);
    }

    fn apply_calls(&self, list: Option<DataCallList>, events: &Events) {
        let (changed, stray) = self.with(|i| i.set_calls(list));
        if changed {
            publish(events, SlotEvent::CallsChanged);
        }
        if let Some(cid) = stray {
            debug!("stray call {}", cid);
            self.queue_deactivate_unwatched(cid);
        }
    }

    pub async fn run(
        &self,
        chan: &Channel,
        queue: &Queue<'_>,
        radio: &RadioController,
        network: &NetworkController,
        vendor: &VendorHook,
        events: &Events,
    ) -> ! {
        join3(
            self.request_loop(chan, queue, radio, network, vendor, events),
            self.query_loop(queue, events, vendor),
            self.unsol_loop(chan, events, vendor),
        )
        .await
        .0
    }

    async fn request_loop(
        &self,
        chan: &Channel,
        queue: &Queue<'_>,
        radio: &RadioController,
        network: &NetworkController,
        vendor: &VendorHook,
        events: &Events,
    ) -> ! {
        loop {
            let req = self.with(|i| {
                if i.pending.is_some() {
                    return None;
                }
                let req = i.queue.pop_front()?;
                i.pending = Some(req.clone());
                Some(req)
            });
            let Some(req) = req else {
                self.kick_queue.wait().await;
                continue;
            };

            // Power is held while anything is queued or in flight.
            self.power_update(radio);
            debug!("submitting data request {}", req.id);

            let result = match req.kind {
                DataRequestKind::Setup => {
                    let params = req.setup.clone().unwrap_or_default();
                    self.run_setup(queue, network, vendor, events, &params).await
                }
                DataRequestKind::Deactivate { cid } => {
                    self.run_deactivate(chan, queue, events, cid).await
                }
                DataRequestKind::Allow(allow) => self.run_allow(queue, events, allow).await,
            };

            self.with(|i| {
                i.pending = None;
                i.pending_serial = 0;
                i.finish(req.id, req.watched, result);
            });

            if !self.with(|i| i.requests_pending()) {
                // The manager only acts across slots when everything is
                // quiet; tell it we got there.
                publish(events, SlotEvent::CheckData);
            }
            self.power_update(radio);
        }
    }

    async fn run_setup(
        &self,
        queue: &Queue<'_>,
        network: &NetworkController,
        vendor: &VendorHook,
        events: &Events,
        params: &SetupParams,
    ) -> RequestResult {
        let mut retry_count: u32 = 0;
        loop {
            let req = self.build_setup_request(network, vendor, params);
            let sub = queue.submit(req);
            self.with(|i| i.pending_serial = sub.serial());
            let resp = sub.await;
            self.with(|i| i.pending_serial = 0);

            if !resp.status.is_ok() {
                return RequestResult {
                    status: resp.status,
                    call: None,
                };
            }

            let list =
                DataCallList::parse(&resp.data, self.options.data_call_format, vendor);
            let Some(list) = list else {
                return RequestResult {
                    status: Status::Error(crate::ril::RilError::GenericFailure),
                    call: None,
                };
            };
            if list.calls.len() != 1 {
                error!("unexpected number of data calls {}", list.calls.len());
                return RequestResult {
                    status: Status::Error(crate::ril::RilError::GenericFailure),
                    call: None,
                };
            }
            let call = list.calls[0].clone();

            if call.status == pdp_fail::ERROR_UNSPECIFIED
                && retry_count < self.options.data_call_retry_limit
            {
                // The unspecified cause calls for a silent retry: the
                // first one right away, the rest after a breather.
                retry_count += 1;
                debug!(
                    "silent retry {} out of {}",
                    retry_count, self.options.data_call_retry_limit
                );
                if retry_count > 1 {
                    match select(
                        Timer::after(self.options.data_call_retry_delay),
                        self.kick_cancel.wait(),
                    )
                    .await
                    {
                        Either::First(()) => {}
                        Either::Second(()) => {
                            return RequestResult {
                                status: Status::Cancelled,
                                call: None,
                            };
                        }
                    }
                }
                continue;
            }

            if call.ok() {
                let added = self.with(|i| match i.calls.as_mut() {
                    Some(calls) if calls.contains(&call) => false,
                    Some(calls) => {
                        calls.insert_sorted(call.clone());
                        true
                    }
                    None => {
                        let mut fresh = DataCallList {
                            version: list.version,
                            calls: Vec::new(),
                        };
                        fresh.insert_sorted(call.clone());
                        i.calls = Some(fresh);
                        true
                    }
                });
                if added {
                    debug!("data call added");
                    publish(events, SlotEvent::CallsChanged);
                }
            }

            return RequestResult {
                status: Status::Ok,
                call: Some(call),
            };
        }
    }

    fn build_setup_request(
        &self,
        network: &NetworkController,
        vendor: &VendorHook,
        params: &SetupParams,
    ) -> Request {
        // The radio tech parameter predates sanity: 0 CDMA, 1 GSM/UMTS,
        // and above that RIL_RadioTechnology + 2. The historical
        // default is HSPA.
        let ril_tech = network.data_state().ril_tech;
        let tech = if ril_tech > 2 {
            ril_tech + 2
        } else {
            radio_tech::HSPA
        };
        let auth = params.auth_method.to_ril(&params.username);

        let req = vendor
            .data_call_req(
                self.slot,
                tech,
                DATA_PROFILE_DEFAULT,
                &params.apn,
                &params.username,
                &params.password,
                auth,
                params.proto.as_str(),
            )
            .unwrap_or_else(|| {
                let mut body: Builder<{ crate::chan::MAX_BODY }> = Builder::new();
                body.append_i32(7)
                    .append_int_utf8(tech)
                    .append_utf8(Some(DATA_PROFILE_DEFAULT))
                    .append_utf8(Some(&params.apn))
                    .append_utf8(Some(&params.username))
                    .append_utf8(Some(&params.password))
                    .append_int_utf8(auth)
                    .append_utf8(Some(params.proto.as_str()));
                Request::with_body(request::SETUP_DATA_CALL, body)
            });
        req.timeout(SETUP_DATA_CALL_TIMEOUT)
    }

    async fn run_deactivate(
        &self,
        chan: &Channel,
        queue: &Queue<'_>,
        events: &Events,
        cid: i32,
    ) -> RequestResult {
        let mut body: Builder<{ crate::chan::MAX_BODY }> = Builder::new();
        body.append_i32(2)
            .append_int_utf8(cid)
            .append_int_utf8(deact_reason::NO_REASON);
        let sub = queue.submit(Request::with_body(request::DEACTIVATE_DATA_CALL, body));
        self.with(|i| i.pending_serial = sub.serial());
        let resp = sub.await;
        self.with(|i| i.pending_serial = 0);

        match resp.status {
            Status::Ok => {
                // Some peers don't follow up with a call list event, so
                // drop the context locally.
                let removed = self.with(|i| {
                    let removed = i
                        .calls
                        .as_mut()
                        .and_then(|l| l.remove(cid))
                        .is_some();
                    if removed
                        && i.calls.as_ref().map_or(false, |l| l.calls.is_empty())
                    {
                        i.calls = None;
                    }
                    if removed {
                        i.grab.remove(&cid);
                    }
                    removed
                });
                if removed {
                    debug!("removed call {}", cid);
                    publish(events, SlotEvent::CallsChanged);
                }
            }
            Status::Cancelled => {}
            _ => {
                // Something is out of sync; ask for the real list.
                self.poll_call_state(chan);
            }
        }

        RequestResult {
            status: resp.status,
            call: None,
        }
    }

    async fn run_allow(&self, queue: &Queue<'_>, events: &Events, allow: bool) -> RequestResult {
        let sub = queue.submit(
            Request::ints(request::ALLOW_DATA, &[allow as i32])
                .retry(RetryPolicy::forever(Duration::from_millis(crate::ril::RETRY_MS)))
                .blocking(),
        );
        self.with(|i| i.pending_serial = sub.serial());
        let resp = sub.await;
        self.with(|i| i.pending_serial = 0);

        if resp.status.is_ok() {
            let was_allowed = self.allowed();
            self.set_on_flag(allow);
            debug!("data {}", if allow { "on" } else { "off" });
            self.check_allowed(was_allowed, events);
        }

        RequestResult {
            status: resp.status,
            call: None,
        }
    }

    async fn query_loop(&self, queue: &Queue<'_>, events: &Events, vendor: &VendorHook) -> ! {
        loop {
            let submit = self.with(|i| {
                if i.want_query && i.query_serial == 0 {
                    i.want_query = false;
                    true
                } else {
                    false
                }
            });
            if !submit {
                self.kick_query.wait().await;
                continue;
            }

            let sub = queue.submit(
                Request::new(request::DATA_CALL_LIST)
                    .retry(RetryPolicy::forever(Duration::from_millis(crate::ril::RETRY_MS))),
            );
            self.with(|i| i.query_serial = sub.serial());
            let resp = sub.await;
            self.with(|i| i.query_serial = 0);

            match resp.status {
                Status::Ok => {
                    let list =
                        DataCallList::parse(&resp.data, self.options.data_call_format, vendor);
                    self.apply_calls(list, events);
                }
                Status::Cancelled => {
                    // Superseded by an unsolicited list.
                }
                _ => {
                    // Radio-not-available reads as "no calls".
                    self.apply_calls(None, events);
                }
            }
        }
    }

    async fn unsol_loop(&self, chan: &Channel, events: &Events, vendor: &VendorHook) -> ! {
        let mut sub = chan.subscribe_unsol();
        loop {
            let ev = next_unsol(&mut sub).await;
            match ev.code {
                unsol::DATA_CALL_LIST_CHANGED => {
                    // The event supersedes a query still in flight.
                    let serial = self.with(|i| core::mem::take(&mut i.query_serial));
                    if serial != 0 {
                        debug!("cancelling data call query");
                        chan.cancel(serial, true);
                    }
                    let list =
                        DataCallList::parse(&ev.data, self.options.data_call_format, vendor);
                    self.apply_calls(list, events);
                }
                unsol::RESTRICTED_STATE_CHANGED => {
                    let mut p = crate::ril::parcel::Parser::new(&ev.data);
                    let Some(1) = p.get_i32() else { continue };
                    let Some(state) = p.get_i32() else { continue };
                    let state = state as u32;
                    let was_allowed = self.allowed();
                    let changed = self.with(|i| {
                        if i.restricted != state {
                            i.restricted = state;
                            true
                        } else {
                            false
                        }
                    });
                    if changed {
                        debug!("restricted state {}", state);
                        self.check_allowed(was_allowed, events);
                    }
                }
                _ => {}
            }
        }
    }
}

/// The attach facade: what the packet-switched service layer sees.
/// Attachment follows the combined allowed predicate and the data
/// registration status.
pub fn attach_allowed(engine: &DataEngine, data_reg: crate::ril::RegStatus) -> bool {
    engine.allowed()
        && matches!(
            data_reg,
            crate::ril::RegStatus::Registered | crate::ril::RegStatus::Roaming
        )
}

#[cfg(test)]
mod tests {
    use super::call::testutil;
    use super::*;

    fn engine() -> DataEngine {
        DataEngine::new(0, DataOptions::default())
    }

    #[test]
    fn allowed_predicate_needs_all_three() {
        let e = engine();
        assert!(!e.allowed());
        e.set_allowed_flag(true);
        assert!(!e.allowed());
        e.set_on_flag(true);
        assert!(e.allowed());
        // PS restriction vetoes.
        e.with(|i| i.restricted = restricted_state::PS_ALL);
        assert!(!e.allowed());
        e.with(|i| i.restricted = restricted_state::CS_ALL);
        assert!(e.allowed());
    }

    #[test]
    fn queue_is_strictly_serial() {
        let e = engine();
        let a = e.queue_setup(SetupParams::default());
        let b = e.queue_deactivate(7);
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert!(e.requests_pending());
        // The loop takes requests one at a time, in order.
        let popped = e.with(|i| {
            assert!(i.pending.is_none());
            let req = i.queue.pop_front().unwrap();
            i.pending = Some(req.clone());
            req
        });
        assert_eq!(popped.id, a);
        let next_in_line = e.with(|i| i.queue.front().map(|r| r.id));
        assert_eq!(next_in_line, Some(b));
        // Queued entries never hold a serial; only the pending one may.
        assert_eq!(e.with(|i| i.pending_serial), 0);
    }

    #[test]
    fn set_calls_reaps_one_stray_and_releases_grabs() {
        let e = engine();
        let mut list = DataCallList::default();
        list.version = 11;
        list.insert_sorted(testutil::call(5));
        list.insert_sorted(testutil::call(9));
        let (changed, _) = e.with(|i| i.set_calls(Some(list.clone())));
        assert!(changed);

        assert!(e.grab(5, 1));
        let (changed, stray) = e.with(|i| i.set_calls(Some(list.clone())));
        assert!(!changed);
        // cid 9 is nobody's, exactly one deactivation candidate.
        assert_eq!(stray, Some(9));

        // cid 5 disappears from the list: its grab dies with it.
        let mut shorter = DataCallList::default();
        shorter.version = 11;
        shorter.insert_sorted(testutil::call(9));
        let (changed, _) = e.with(|i| i.set_calls(Some(shorter)));
        assert!(changed);
        assert!(!e.grabbed(5));
        assert!(!e.grab(5, 1));
    }

    #[test]
    fn grab_rules() {
        let e = engine();
        let mut list = DataCallList::default();
        list.insert_sorted(testutil::call(3));
        e.with(|i| i.set_calls(Some(list)));

        assert!(e.grab(3, 1));
        assert!(e.grab(3, 1)); // same owner again
        assert!(!e.grab(3, 2)); // different owner
        assert!(!e.grab(4, 1)); // unknown cid

        e.release(3, 2); // wrong owner, no-op
        assert!(e.grabbed(3));
        e.release(3, 1);
        assert!(!e.grabbed(3));
    }

    #[test]
    fn cancel_requests_honours_flags() {
        let e = engine();
        let chan = Channel::new();
        let setup_id = e.queue_setup(SetupParams::default());
        let deact_id = e.queue_deactivate(1);
        e.cancel_requests(&chan, REQ_CANCEL_WHEN_DISALLOWED);

        // The setup is gone with a cancelled result, the deactivation
        // survives.
        let result = e.with(|i| i.results.remove(&setup_id)).unwrap();
        assert_eq!(result.status, Status::Cancelled);
        assert!(e.with(|i| i.results.get(&deact_id).is_none()));
        let remaining = e.with(|i| i.queue.len());
        assert_eq!(remaining, 1);
    }

    #[test]
    fn disallow_queues_allow_false_then_deactivations() {
        let e = engine();
        let chan = Channel::new(); // version 0 -> allow-data auto = off
        let radio = RadioController::new();
        let events = Events::new();

        let mut list = DataCallList::default();
        list.insert_sorted(testutil::call(2));
        let mut failed = testutil::call(4);
        failed.status = pdp_fail::ERROR_UNSPECIFIED;
        list.insert_sorted(failed);
        e.with(|i| i.set_calls(Some(list)));

        e.set_allowed_flag(true);
        e.set_on_flag(true);
        e.disallow(&chan, &radio, &events);

        assert!(!e.allowed_flag());
        // allow-data disabled peer: ON cleared locally, only the good
        // call is deactivated.
        assert!(!e.on());
        let kinds: heapless::Vec<DataRequestKind, 8> =
            e.with(|i| i.queue.iter().map(|r| r.kind).collect());
        assert_eq!(kinds.as_slice(), &[DataRequestKind::Deactivate { cid: 2 }]);
    }

    #[test]
    fn disallow_with_allow_data_speaks_to_the_peer() {
        let e = engine();
        let chan = Channel::new();
        let radio = RadioController::new();
        let events = Events::new();
        // Pretend the peer announced a modern protocol.
        let mut b: Builder<16> = Builder::new();
        b.append_i32(1).append_i32(11);
        let body = b.take().unwrap();
        chan.handle_unsol(crate::ril::unsol::RIL_CONNECTED, &body);

        e.set_allowed_flag(true);
        e.set_on_flag(true);
        e.disallow(&chan, &radio, &events);

        let kinds: heapless::Vec<DataRequestKind, 8> =
            e.with(|i| i.queue.iter().map(|r| r.kind).collect());
        // ALLOW_DATA(false) goes first, contexts die behind it.
        assert_eq!(kinds.as_slice(), &[DataRequestKind::Allow(false)]);
        assert!(e.on()); // cleared only when the peer confirms
    }

    #[test]
    fn auth_mapping() {
        assert_eq!(AuthMethod::Any.to_ril(""), auth::NONE);
        assert_eq!(AuthMethod::Any.to_ril("user"), auth::BOTH);
        assert_eq!(AuthMethod::Chap.to_ril("user"), auth::CHAP);
        assert_eq!(AuthMethod::Pap.to_ril("user"), auth::PAP);
        assert_eq!(AuthMethod::None.to_ril("user"), auth::NONE);
    }

    #[tokio::test]
    async fn setup_silent_retry_resubmits_immediately() {
        use crate::config::SlotConfig;
        use crate::vendor::VendorHook;
        use embassy_futures::select::{select, Either};
        use embassy_futures::yield_now;

        let chan = Channel::new();
        chan.mark_connected_for_test();
        let queue = chan.queue();
        let radio = RadioController::new();
        let network = NetworkController::new(&SlotConfig::default());
        let vendor = VendorHook::none();
        let events = Events::new();
        let engine = DataEngine::new(0, DataOptions::default());

        async fn wait_for_code(chan: &Channel, code: u32) -> u32 {
            loop {
                match chan.take_tx_for_test() {
                    Some((serial, c, _)) if c == code => return serial,
                    Some((serial, c, _)) if c == request::DATA_CALL_LIST => {
                        // The startup poll; radio-not-available means
                        // "no calls" and ends it.
                        chan.handle_response(serial, 1, &[]);
                    }
                    _ => yield_now().await,
                }
            }
        }

        let script = async {
            let mut sub = events.subscriber().unwrap();
            let id = engine.queue_setup(SetupParams::default());

            // First attempt fails with the unspecified cause.
            let serial = wait_for_code(&chan, request::SETUP_DATA_CALL).await;
            let mut failed = testutil::call(7);
            failed.status = pdp_fail::ERROR_UNSPECIFIED;
            let body = testutil::encode_list(11, core::slice::from_ref(&failed));
            chan.handle_response(serial, 0, body.as_slice());

            // The retry goes out immediately, same request code.
            let serial2 = wait_for_code(&chan, request::SETUP_DATA_CALL).await;
            assert_ne!(serial, serial2);
            let good = testutil::call(7);
            let body = testutil::encode_list(11, core::slice::from_ref(&good));
            chan.handle_response(serial2, 0, body.as_slice());

            let result = engine.wait_result(id).await;
            assert!(result.status.is_ok());
            assert_eq!(result.call.unwrap().cid, 7);
            assert_eq!(engine.find_call(7).unwrap().ifname.as_deref(), Some("rmnet0"));

            // Exactly one calls-changed along the way.
            let mut calls_changed = 0;
            while let Some(ev) = sub.try_next_message_pure() {
                if ev == SlotEvent::CallsChanged {
                    calls_changed += 1;
                }
            }
            assert_eq!(calls_changed, 1);
        };

        match select(
            engine.run(&chan, &queue, &radio, &network, &vendor, &events),
            script,
        )
        .await
        {
            Either::First(_) => unreachable!(),
            Either::Second(()) => {}
        }
    }

    #[test]
    fn attach_follows_allowed_and_registration() {
        let e = engine();
        assert!(!attach_allowed(&e, crate::ril::RegStatus::Registered));
        e.set_allowed_flag(true);
        e.set_on_flag(true);
        assert!(attach_allowed(&e, crate::ril::RegStatus::Registered));
        assert!(attach_allowed(&e, crate::ril::RegStatus::Roaming));
        assert!(!attach_allowed(&e, crate::ril::RegStatus::Searching));
    }
}
