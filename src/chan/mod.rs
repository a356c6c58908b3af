//! Framed request/response channel to one rild socket.
//!
//! The channel assigns serials, keeps the pending-by-serial map, applies
//! per-request timeouts and retry policies, enforces the blocking flag,
//! the start-up serialization gate and queue transactions, and fans
//! unsolicited events out to subscribers. The I/O itself is driven by
//! [`runner::Runner`], which the slot attaches to a fresh socket on
//! every (re)connect.
//!
//! A retry policy is plain data rather than a callback, so cancelling a
//! request in its retry gap needs no coordination: removing the entry
//! is enough.

pub mod runner;

use core::cell::RefCell;
use core::future::{poll_fn, Future};
use core::pin::Pin;
use core::task::{Context, Poll};

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::pubsub::{PubSubChannel, Subscriber, WaitResult};
use embassy_sync::waitqueue::{MultiWakerRegistration, WakerRegistration};
use embassy_time::{Duration, Instant};
use heapless::{FnvIndexMap, Vec};

use crate::ril::parcel::{Builder, Parser};
use crate::ril::{RilError, Status};

pub const MAX_PENDING: usize = 16;
pub const MAX_BODY: usize = 1024;
pub const MAX_RESPONSE: usize = 2048;
pub const MAX_UNSOL: usize = 2048;
pub const UNSOL_CAP: usize = 8;
pub const UNSOL_SUBS: usize = 8;
pub const MAX_LOGGERS: usize = 4;

/// Queue id for [`Channel::submit`]; never handed to a component.
pub const SYSTEM_QUEUE: u8 = u8::MAX;

pub type Body = Vec<u8, MAX_BODY>;
pub type ResponseData = Vec<u8, MAX_RESPONSE>;

/// One unsolicited event as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct Unsol {
    pub code: u32,
    pub data: Vec<u8, MAX_UNSOL>,
}

pub type UnsolChannel = PubSubChannel<NoopRawMutex, Unsol, UNSOL_CAP, UNSOL_SUBS, 2>;
pub type UnsolSubscriber<'a> = Subscriber<'a, NoopRawMutex, Unsol, UNSOL_CAP, UNSOL_SUBS, 2>;

/// Waits for the next unsolicited event, swallowing lag markers.
pub async fn next_unsol(sub: &mut UnsolSubscriber<'_>) -> Unsol {
    loop {
        match sub.next_message().await {
            WaitResult::Message(ev) => return ev,
            WaitResult::Lagged(n) => warn!("unsol subscriber lagged by {}", n),
        }
    }
}

/// When a non-success outcome may be re-submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RetryWhen {
    /// Retry unless success, cancelled or radio-not-available.
    #[default]
    Transient,
    /// Retry on every failure; used by the start-up queries that must
    /// outlive early radio states.
    AnyError,
}

impl RetryWhen {
    fn retryable(self, status: Status) -> bool {
        match status {
            Status::Ok | Status::Cancelled => false,
            Status::TimedOut => true,
            Status::Error(RilError::RadioNotAvailable) => self == RetryWhen::AnyError,
            Status::Error(_) => true,
        }
    }
}

/// Retry policy carried by a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RetryPolicy {
    pub delay: Duration,
    /// Remaining retries; negative means unbounded.
    pub max_retries: i32,
    pub when: RetryWhen,
}

impl RetryPolicy {
    pub const NONE: RetryPolicy = RetryPolicy {
        delay: Duration::from_ticks(0),
        max_retries: 0,
        when: RetryWhen::Transient,
    };

    pub const fn forever(delay: Duration) -> Self {
        Self {
            delay,
            max_retries: -1,
            when: RetryWhen::Transient,
        }
    }

    pub const fn up_to(delay: Duration, retries: i32) -> Self {
        Self {
            delay,
            max_retries: retries,
            when: RetryWhen::Transient,
        }
    }

    pub const fn any_error(mut self) -> Self {
        self.when = RetryWhen::AnyError;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum TimeoutCfg {
    /// Use the channel default.
    #[default]
    Default,
    Never,
    After(Duration),
}

/// An outbound request before submission.
#[derive(Debug, Clone, Default)]
pub struct Request {
    code: u32,
    body: Body,
    timeout: TimeoutCfg,
    retry: RetryPolicy,
    blocking: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::NONE
    }
}

impl Request {
    pub fn new(code: u32) -> Self {
        Self {
            code,
            ..Default::default()
        }
    }

    /// Request whose body is one int32 array, the most common shape.
    pub fn ints(code: u32, values: &[i32]) -> Self {
        let mut b: Builder<MAX_BODY> = Builder::new();
        b.append_i32_array(values);
        Self::with_body(code, b)
    }

    pub fn with_body(code: u32, body: Builder<MAX_BODY>) -> Self {
        let body = body.take().unwrap_or_else(|| {
            error!("request body overflow, code {}", code);
            Body::new()
        });
        Self {
            code,
            body,
            ..Default::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = TimeoutCfg::After(timeout);
        self
    }

    pub fn no_timeout(mut self) -> Self {
        self.timeout = TimeoutCfg::Never;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stalls all later submissions on the channel until this request
    /// reaches a terminal outcome.
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self
    }
}

/// Terminal outcome of a submission.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: Status,
    pub data: ResponseData,
}

impl Response {
    pub fn parser(&self) -> Parser<'_> {
        Parser::new(&self.data)
    }

    fn cancelled() -> Self {
        Self {
            status: Status::Cancelled,
            data: ResponseData::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Queued,
    Sent,
    RetryWait,
    Done,
}

struct Entry {
    code: u32,
    queue: u8,
    body: Body,
    state: EntryState,
    /// Deadline while `Sent`, retry point while `RetryWait`.
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    retry: RetryPolicy,
    retries_left: i32,
    blocking: bool,
    detached: bool,
    status: Status,
    data: ResponseData,
    waker: WakerRegistration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PacketDir {
    Req,
    Resp,
    Unsol,
}

/// One packet as seen by a channel logger.
pub struct LogRecord<'a> {
    pub dir: PacketDir,
    pub serial: u32,
    pub code: u32,
    pub status: i32,
    pub data: &'a [u8],
}

pub type LoggerFn = fn(&LogRecord<'_>);

struct Shared {
    next_serial: u32,
    next_queue: u8,
    next_logger: u8,
    connected: bool,
    ril_version: u32,
    default_timeout: Option<Duration>,
    entries: FnvIndexMap<u32, Entry, MAX_PENDING>,
    /// Submission order; stale serials are skipped lazily.
    order: Vec<u32, MAX_PENDING>,
    blocking_sent: Option<u32>,
    gate: Option<(u8, u8)>,
    txn_owner: Option<u8>,
    loggers: Vec<(u8, LoggerFn), MAX_LOGGERS>,
    /// Bumped on any change to tx eligibility or deadlines.
    epoch: u32,
    tx_waker: WakerRegistration,
    timer_waker: WakerRegistration,
    conn_wakers: MultiWakerRegistration<4>,
}

impl Shared {
    const fn new() -> Self {
        Self {
            next_serial: 1,
            next_queue: 0,
            next_logger: 0,
            connected: false,
            ril_version: 0,
            default_timeout: None,
            entries: FnvIndexMap::new(),
            order: Vec::new(),
            blocking_sent: None,
            gate: None,
            txn_owner: None,
            loggers: Vec::new(),
            epoch: 0,
            tx_waker: WakerRegistration::new(),
            timer_waker: WakerRegistration::new(),
            conn_wakers: MultiWakerRegistration::new(),
        }
    }

    fn bump(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.tx_waker.wake();
        self.timer_waker.wake();
    }

    fn eligible(&self, serial: u32, entry: &Entry) -> bool {
        if entry.state != EntryState::Queued {
            return false;
        }
        // A blocking request in flight stalls everything but its own
        // retries.
        match self.blocking_sent {
            Some(blocker) if blocker != serial => return false,
            _ => {}
        }
        if let Some((a, b)) = self.gate {
            if entry.queue != a && entry.queue != b {
                return false;
            }
        }
        if let Some(owner) = self.txn_owner {
            if entry.queue != owner {
                return false;
            }
        }
        true
    }

    /// Completes an entry. Detached entries are dropped on the spot,
    /// waited-on entries hold the outcome until the future collects it.
    fn complete(&mut self, serial: u32, status: Status, data: &[u8]) {
        let detached = match self.entries.get(&serial) {
            Some(e) => e.detached,
            None => return,
        };
        if detached {
            self.remove(serial);
            return;
        }
        if let Some(entry) = self.entries.get_mut(&serial) {
            entry.state = EntryState::Done;
            entry.status = status;
            entry.deadline = None;
            entry.data.clear();
            let n = data.len().min(MAX_RESPONSE);
            if entry.data.extend_from_slice(&data[..n]).is_err() {
                warn!("response for serial {} truncated", serial);
            }
            entry.waker.wake();
        }
        if self.blocking_sent == Some(serial) {
            self.blocking_sent = None;
        }
        self.bump();
    }

    fn remove(&mut self, serial: u32) {
        self.entries.remove(&serial);
        self.order.retain(|s| *s != serial);
        if self.blocking_sent == Some(serial) {
            self.blocking_sent = None;
        }
        self.bump();
    }

    fn schedule_retry(&mut self, serial: u32, now: Instant) {
        if let Some(entry) = self.entries.get_mut(&serial) {
            if entry.retries_left > 0 {
                entry.retries_left -= 1;
            }
            if entry.retry.delay.as_ticks() == 0 {
                entry.state = EntryState::Queued;
                entry.deadline = None;
                if !self.order.contains(&serial) {
                    self.order.push(serial).ok();
                }
            } else {
                entry.state = EntryState::RetryWait;
                entry.deadline = Some(now + entry.retry.delay);
            }
            self.bump();
        }
    }

    fn log(&self, record: &LogRecord<'_>) {
        for (_, logger) in &self.loggers {
            logger(record);
        }
    }
}

/// The channel proper; components keep `&Channel` and allocate one
/// [`Queue`] each.
pub struct Channel {
    shared: Mutex<NoopRawMutex, RefCell<Shared>>,
    unsol: UnsolChannel,
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel {
    pub const fn new() -> Self {
        Self {
            shared: Mutex::new(RefCell::new(Shared::new())),
            unsol: PubSubChannel::new(),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Shared) -> R) -> R {
        self.shared.lock(|s| f(&mut s.borrow_mut()))
    }

    /// Submits outside any component queue; used for one-shot traffic
    /// like screen state that no teardown should cancel.
    pub fn submit(&self, req: Request) -> Submission<'_> {
        self.submit_on(SYSTEM_QUEUE, req)
    }

    pub fn queue(&self) -> Queue<'_> {
        let id = self.with(|s| {
            let id = s.next_queue;
            s.next_queue += 1;
            id
        });
        Queue { chan: self, id }
    }

    pub fn set_default_timeout(&self, timeout: Option<Duration>) {
        self.with(|s| s.default_timeout = timeout);
    }

    pub fn connected(&self) -> bool {
        self.with(|s| s.connected)
    }

    /// Protocol version announced by RIL_CONNECTED; 0 until then.
    pub fn ril_version(&self) -> u32 {
        self.with(|s| s.ril_version)
    }

    pub async fn wait_connected(&self) {
        poll_fn(|cx| {
            self.with(|s| {
                if s.connected {
                    Poll::Ready(())
                } else {
                    s.conn_wakers.register(cx.waker());
                    Poll::Pending
                }
            })
        })
        .await
    }

    pub fn subscribe_unsol(&self) -> UnsolSubscriber<'_> {
        self.unsol.subscriber().expect("unsol subscriber slots exhausted")
    }

    /// Synthesises a local unsolicited event; the vendor hooks use this
    /// to normalise vendor notifications into standard ones.
    pub fn inject_unsol(&self, code: u32, data: &[u8]) {
        self.publish_unsol(code, data);
    }

    fn publish_unsol(&self, code: u32, data: &[u8]) {
        let mut payload = Vec::new();
        if payload.extend_from_slice(data).is_err() {
            warn!("unsol {} payload too large, dropped", code);
            return;
        }
        self.unsol
            .immediate_publisher()
            .publish_immediate(Unsol { code, data: payload });
    }

    pub fn add_logger(&self, logger: LoggerFn) -> Option<u8> {
        self.with(|s| {
            let id = s.next_logger;
            s.loggers.push((id, logger)).ok()?;
            s.next_logger += 1;
            Some(id)
        })
    }

    pub fn remove_logger(&self, id: u8) {
        self.with(|s| s.loggers.retain(|(lid, _)| *lid != id));
    }

    /// Restricts transmission to two queues (the slot's own and the SIM
    /// card's) until [`Self::lift_gate`]. Used during start-up so that
    /// only the identity and SIM status queries reach the peer.
    pub fn set_gate(&self, first: u8, second: u8) {
        self.with(|s| {
            s.gate = Some((first, second));
            s.bump();
        });
    }

    pub fn lift_gate(&self) {
        self.with(|s| {
            s.gate = None;
            s.bump();
        });
    }

    pub fn gated(&self) -> bool {
        self.with(|s| s.gate.is_some())
    }

    fn submit_on(&self, queue: u8, req: Request) -> Submission<'_> {
        let serial = self.with(|s| {
            let serial = s.next_serial;
            s.next_serial = s.next_serial.wrapping_add(1).max(1);
            let timeout = match req.timeout {
                TimeoutCfg::Default => s.default_timeout,
                TimeoutCfg::Never => None,
                TimeoutCfg::After(t) => Some(t),
            };
            let entry = Entry {
                code: req.code,
                queue,
                body: req.body,
                state: EntryState::Queued,
                deadline: None,
                timeout,
                retry: req.retry,
                retries_left: req.retry.max_retries,
                blocking: req.blocking,
                detached: false,
                status: Status::Cancelled,
                data: ResponseData::new(),
                waker: WakerRegistration::new(),
            };
            if s.entries.insert(serial, entry).is_err() {
                error!("pending map full, dropping request {}", req.code);
                return 0;
            }
            s.order.push(serial).ok();
            s.bump();
            serial
        });
        Submission {
            chan: self,
            serial,
            finished: serial == 0,
        }
    }

    /// Removes a pending request. With `notify` the waiting future (if
    /// any) observes the cancelled sentinel; without it a detached
    /// request simply disappears, which is the "drop" the SIM
    /// subscription path needs for peers that never answer.
    pub fn cancel(&self, serial: u32, notify: bool) {
        self.with(|s| {
            let detached = match s.entries.get(&serial) {
                Some(e) if e.state != EntryState::Done => e.detached,
                _ => return,
            };
            if detached || !notify {
                s.remove(serial);
            }
            if !detached {
                s.complete(serial, Status::Cancelled, &[]);
            }
        });
    }

    /// Like cancel without notification.
    pub fn drop_request(&self, serial: u32) {
        self.cancel(serial, false);
    }

    /// Moves a request sitting in its retry gap to the front of the
    /// line right away, keeping the serial stable.
    pub fn retry_now(&self, serial: u32) {
        self.with(|s| {
            if let Some(entry) = s.entries.get_mut(&serial) {
                if entry.state == EntryState::RetryWait {
                    entry.state = EntryState::Queued;
                    entry.deadline = None;
                    if !s.order.contains(&serial) {
                        s.order.push(serial).ok();
                    }
                    s.bump();
                }
            }
        });
    }

    /// Releases every pending request with the cancelled sentinel and
    /// drops the connected flag; the slot calls this when the socket
    /// dies before entering its reconnect loop.
    pub fn fail_all(&self) {
        self.with(|s| {
            s.connected = false;
            let serials: Vec<u32, MAX_PENDING> = s.entries.keys().copied().collect();
            for serial in serials {
                let detached = s.entries.get(&serial).map(|e| e.detached).unwrap_or(true);
                if detached {
                    s.remove(serial);
                } else {
                    s.complete(serial, Status::Cancelled, &[]);
                }
            }
            s.blocking_sent = None;
        });
    }

    // Runner-side hooks. Crate-visible so tests can script a peer.

    pub(crate) fn handle_response(&self, serial: u32, status_code: i32, data: &[u8]) {
        let now = Instant::now();
        self.with(|s| {
            s.log(&LogRecord {
                dir: PacketDir::Resp,
                serial,
                code: 0,
                status: status_code,
                data,
            });
            let Some(entry) = s.entries.get(&serial) else {
                trace!("response for unknown serial {}", serial);
                return;
            };
            if entry.state == EntryState::Done {
                return;
            }
            let status = Status::from(status_code);
            let retry = entry.retry.when.retryable(status)
                && (entry.retries_left != 0);
            if retry {
                s.schedule_retry(serial, now);
            } else {
                s.complete(serial, status, data);
            }
        });
    }

    pub(crate) fn handle_unsol(&self, code: u32, data: &[u8]) {
        self.with(|s| {
            s.log(&LogRecord {
                dir: PacketDir::Unsol,
                serial: 0,
                code,
                status: 0,
                data,
            });
            if code == crate::ril::unsol::RIL_CONNECTED {
                let mut p = Parser::new(data);
                p.get_i32(); // element count
                let version = p.get_i32().unwrap_or(0);
                s.connected = true;
                s.ril_version = version.max(0) as u32;
                s.conn_wakers.wake();
                info!("RIL connected, version {}", version);
            }
        });
        self.publish_unsol(code, data);
    }

    /// Picks the next transmittable entry, marks it sent and hands the
    /// frame contents to the runner.
    fn poll_next_tx(&self, cx: &mut Context<'_>) -> Poll<(u32, u32, Body)> {
        let now = Instant::now();
        self.with(|s| {
            if !s.connected {
                s.tx_waker.register(cx.waker());
                return Poll::Pending;
            }
            let mut picked = None;
            let mut stale: Vec<u32, MAX_PENDING> = Vec::new();
            for &serial in s.order.iter() {
                match s.entries.get(&serial) {
                    None => {
                        stale.push(serial).ok();
                    }
                    Some(entry) => {
                        if s.eligible(serial, entry) {
                            picked = Some(serial);
                            break;
                        }
                    }
                }
            }
            s.order.retain(|serial| !stale.contains(serial));
            let Some(serial) = picked else {
                s.tx_waker.register(cx.waker());
                return Poll::Pending;
            };
            s.order.retain(|other| *other != serial);
            let entry = s.entries.get_mut(&serial).unwrap();
            entry.state = EntryState::Sent;
            entry.deadline = entry.timeout.map(|t| now + t);
            let code = entry.code;
            let body = entry.body.clone();
            if entry.blocking {
                s.blocking_sent = Some(serial);
            }
            s.timer_waker.wake();
            s.log(&LogRecord {
                dir: PacketDir::Req,
                serial,
                code,
                status: 0,
                data: &body,
            });
            Poll::Ready((serial, code, body))
        })
    }

    #[cfg(test)]
    pub(crate) fn mark_connected_for_test(&self) {
        self.with(|s| {
            s.connected = true;
            s.conn_wakers.wake();
            s.bump();
        });
    }

    /// Test-side stand-in for the runner's transmit pick.
    #[cfg(test)]
    pub(crate) fn take_tx_for_test(&self) -> Option<(u32, u32, Body)> {
        use core::task::{RawWaker, RawWakerVTable, Waker};
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(core::ptr::null(), &VTABLE)
        }
        fn nop(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, nop, nop, nop);
        let waker = unsafe { Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE)) };
        let mut cx = Context::from_waker(&waker);
        match self.poll_next_tx(&mut cx) {
            Poll::Ready(v) => Some(v),
            Poll::Pending => None,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.with(|s| {
            s.entries
                .values()
                .filter_map(|e| e.deadline)
                .min()
        })
    }

    fn process_deadlines(&self, now: Instant) {
        self.with(|s| {
            let due: Vec<(u32, EntryState), MAX_PENDING> = s
                .entries
                .iter()
                .filter(|(_, e)| e.deadline.map_or(false, |d| d <= now))
                .map(|(serial, e)| (*serial, e.state))
                .collect();
            for (serial, state) in due {
                match state {
                    EntryState::Sent => {
                        let entry = s.entries.get(&serial).unwrap();
                        let retry = entry.retry.when.retryable(Status::TimedOut)
                            && entry.retries_left != 0;
                        if retry {
                            debug!("serial {} timed out, retrying", serial);
                            s.schedule_retry(serial, now);
                        } else {
                            debug!("serial {} timed out", serial);
                            s.complete(serial, Status::TimedOut, &[]);
                        }
                    }
                    EntryState::RetryWait => {
                        let entry = s.entries.get_mut(&serial).unwrap();
                        entry.state = EntryState::Queued;
                        entry.deadline = None;
                        if !s.order.contains(&serial) {
                            s.order.push(serial).ok();
                        }
                        s.bump();
                    }
                    _ => {}
                }
            }
        });
    }

    fn poll_epoch_change(&self, seen: u32, cx: &mut Context<'_>) -> Poll<u32> {
        self.with(|s| {
            if s.epoch != seen {
                Poll::Ready(s.epoch)
            } else {
                s.timer_waker.register(cx.waker());
                Poll::Pending
            }
        })
    }

    fn epoch(&self) -> u32 {
        self.with(|s| s.epoch)
    }
}

/// A cancellable submission group. Dropping a component's queue leaves
/// entries behind, so owners call [`Queue::cancel_all`] on teardown.
pub struct Queue<'a> {
    chan: &'a Channel,
    id: u8,
}

impl<'a> Queue<'a> {
    pub fn channel(&self) -> &'a Channel {
        self.chan
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn submit(&self, req: Request) -> Submission<'a> {
        self.chan.submit_on(self.id, req)
    }

    /// Submits and waits for the terminal outcome.
    pub async fn send(&self, req: Request) -> Response {
        self.submit(req).await
    }

    /// Cancels every request this queue submitted, leaving other
    /// components' traffic alone.
    pub fn cancel_all(&self) {
        let serials: Vec<u32, MAX_PENDING> = self.chan.with(|s| {
            s.entries
                .iter()
                .filter(|(_, e)| e.queue == self.id && e.state != EntryState::Done)
                .map(|(serial, _)| *serial)
                .collect()
        });
        for serial in serials {
            self.chan.cancel(serial, true);
        }
    }

    /// Claims exclusive transmission for this queue. Returns false if
    /// another queue already owns the channel.
    pub fn transaction_start(&self) -> bool {
        self.chan.with(|s| match s.txn_owner {
            None => {
                s.txn_owner = Some(self.id);
                s.bump();
                true
            }
            Some(owner) => owner == self.id,
        })
    }

    pub fn transaction_active(&self) -> bool {
        self.chan.with(|s| s.txn_owner == Some(self.id))
    }

    pub fn transaction_finish(&self) {
        self.chan.with(|s| {
            if s.txn_owner == Some(self.id) {
                s.txn_owner = None;
                s.bump();
            }
        });
    }
}

/// Future side of a submitted request. Dropping it cancels the request
/// silently unless it was detached.
pub struct Submission<'a> {
    chan: &'a Channel,
    serial: u32,
    finished: bool,
}

impl Submission<'_> {
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Leaves the request in flight with nobody waiting; pair with
    /// [`Channel::drop_request`] or [`Channel::cancel`].
    pub fn detach(mut self) -> u32 {
        self.chan.with(|s| {
            let done = match s.entries.get_mut(&self.serial) {
                Some(entry) => {
                    entry.detached = true;
                    entry.state == EntryState::Done
                }
                None => false,
            };
            if done {
                s.remove(self.serial);
            }
        });
        self.finished = true;
        self.serial
    }
}

impl Future for Submission<'_> {
    type Output = Response;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Response> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(Response::cancelled());
        }
        let serial = this.serial;
        let result = this.chan.with(|s| {
            let done = match s.entries.get(&serial) {
                None => return Poll::Ready(Response::cancelled()),
                Some(entry) => entry.state == EntryState::Done,
            };
            if done {
                let mut data = ResponseData::new();
                let status = {
                    let entry = s.entries.get_mut(&serial).unwrap();
                    core::mem::swap(&mut data, &mut entry.data);
                    entry.status
                };
                s.remove(serial);
                Poll::Ready(Response { status, data })
            } else {
                let entry = s.entries.get_mut(&serial).unwrap();
                entry.waker.register(cx.waker());
                Poll::Pending
            }
        });
        if result.is_ready() {
            this.finished = true;
        }
        result
    }
}

impl Drop for Submission<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.chan.with(|s| s.remove(self.serial));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ril::request;

    fn noop_waker() -> core::task::Waker {
        use core::task::{RawWaker, RawWakerVTable, Waker};
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(core::ptr::null(), &VTABLE)
        }
        fn nop(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, nop, nop, nop);
        unsafe { Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE)) }
    }

    fn poll_once(fut: &mut Submission<'_>) -> Poll<Response> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    fn pick_tx(chan: &Channel) -> Option<(u32, u32, Body)> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        match chan.poll_next_tx(&mut cx) {
            Poll::Ready(v) => Some(v),
            Poll::Pending => None,
        }
    }

    #[test]
    fn serials_are_sequential_and_nonzero() {
        let chan = Channel::new();
        chan.mark_connected_for_test();
        let q = chan.queue();
        let a = q.submit(Request::new(request::RADIO_POWER));
        let b = q.submit(Request::new(request::OPERATOR));
        assert_eq!(a.serial(), 1);
        assert_eq!(b.serial(), 2);
    }

    #[test]
    fn response_completes_submission() {
        let chan = Channel::new();
        chan.mark_connected_for_test();
        let q = chan.queue();
        let mut sub = q.submit(Request::new(request::GET_SIM_STATUS));
        let serial = sub.serial();
        assert!(pick_tx(&chan).is_some());
        chan.handle_response(serial, 0, &[1, 2, 3, 4]);
        match poll_once(&mut sub) {
            Poll::Ready(resp) => {
                assert_eq!(resp.status, Status::Ok);
                assert_eq!(resp.data.as_slice(), &[1, 2, 3, 4]);
            }
            Poll::Pending => panic!("not done"),
        }
    }

    #[test]
    fn nothing_sent_until_connected() {
        let chan = Channel::new();
        let q = chan.queue();
        let _sub = q.submit(Request::new(request::GET_SIM_STATUS));
        assert!(pick_tx(&chan).is_none());
        chan.mark_connected_for_test();
        assert!(pick_tx(&chan).is_some());
    }

    #[test]
    fn blocking_stalls_the_pipe() {
        let chan = Channel::new();
        chan.mark_connected_for_test();
        let q = chan.queue();
        let blocking = q.submit(Request::new(request::RADIO_POWER).blocking());
        let _other = q.submit(Request::new(request::OPERATOR));
        let (serial, code, _) = pick_tx(&chan).unwrap();
        assert_eq!(serial, blocking.serial());
        assert_eq!(code, request::RADIO_POWER);
        // Second request waits for the blocking one to resolve.
        assert!(pick_tx(&chan).is_none());
        chan.handle_response(blocking.serial(), 0, &[]);
        let (_, code, _) = pick_tx(&chan).unwrap();
        assert_eq!(code, request::OPERATOR);
    }

    #[test]
    fn blocking_request_can_retry_itself() {
        let chan = Channel::new();
        chan.mark_connected_for_test();
        let q = chan.queue();
        let blocking = q.submit(
            Request::ints(request::ALLOW_DATA, &[1])
                .blocking()
                .retry(RetryPolicy::forever(Duration::from_ticks(0))),
        );
        let serial = blocking.serial();
        let _other = q.submit(Request::new(request::OPERATOR));
        assert_eq!(pick_tx(&chan).map(|(s, _, _)| s), Some(serial));
        assert!(pick_tx(&chan).is_none());
        // A retryable failure re-queues the blocker; it must get
        // through its own stall while everything else keeps waiting.
        chan.handle_response(serial, 2, &[]);
        assert_eq!(pick_tx(&chan).map(|(s, _, _)| s), Some(serial));
        assert!(pick_tx(&chan).is_none());
        chan.handle_response(serial, 0, &[]);
        let (_, code, _) = pick_tx(&chan).unwrap();
        assert_eq!(code, request::OPERATOR);
    }

    #[test]
    fn gate_admits_only_listed_queues() {
        let chan = Channel::new();
        chan.mark_connected_for_test();
        let slot_q = chan.queue();
        let sim_q = chan.queue();
        let other_q = chan.queue();
        chan.set_gate(slot_q.id(), sim_q.id());

        let _radio = other_q.submit(Request::new(request::RADIO_POWER));
        let imei = slot_q.submit(Request::new(request::DEVICE_IDENTITY));
        let sim = sim_q.submit(Request::new(request::GET_SIM_STATUS));

        let (serial, _, _) = pick_tx(&chan).unwrap();
        assert_eq!(serial, imei.serial());
        let (serial, _, _) = pick_tx(&chan).unwrap();
        assert_eq!(serial, sim.serial());
        assert!(pick_tx(&chan).is_none());

        chan.lift_gate();
        let (_, code, _) = pick_tx(&chan).unwrap();
        assert_eq!(code, request::RADIO_POWER);
    }

    #[test]
    fn transaction_gives_one_queue_exclusive_tx() {
        let chan = Channel::new();
        chan.mark_connected_for_test();
        let sim_q = chan.queue();
        let net_q = chan.queue();
        let _poll = net_q.submit(Request::new(request::OPERATOR));
        assert!(sim_q.transaction_start());
        let status = sim_q.submit(Request::new(request::GET_SIM_STATUS));
        let (serial, _, _) = pick_tx(&chan).unwrap();
        assert_eq!(serial, status.serial());
        assert!(pick_tx(&chan).is_none());
        sim_q.transaction_finish();
        let (_, code, _) = pick_tx(&chan).unwrap();
        assert_eq!(code, request::OPERATOR);
    }

    #[test]
    fn retry_policy_requeues_on_error() {
        let chan = Channel::new();
        chan.mark_connected_for_test();
        let q = chan.queue();
        let mut sub = q.submit(
            Request::new(request::DATA_CALL_LIST)
                .retry(RetryPolicy::forever(Duration::from_ticks(0))),
        );
        let serial = sub.serial();
        assert!(pick_tx(&chan).is_some());
        chan.handle_response(serial, 2, &[]); // GENERIC_FAILURE -> retry
        assert!(matches!(poll_once(&mut sub), Poll::Pending));
        // Re-queued with the same serial.
        let (again, _, _) = pick_tx(&chan).unwrap();
        assert_eq!(again, serial);
        // RADIO_NOT_AVAILABLE terminates a Transient policy.
        chan.handle_response(serial, 1, &[]);
        match poll_once(&mut sub) {
            Poll::Ready(resp) => {
                assert_eq!(resp.status, Status::Error(RilError::RadioNotAvailable))
            }
            Poll::Pending => panic!("should be terminal"),
        }
    }

    #[test]
    fn retry_count_is_bounded() {
        let chan = Channel::new();
        chan.mark_connected_for_test();
        let q = chan.queue();
        let mut sub = q.submit(
            Request::new(request::SETUP_DATA_CALL)
                .retry(RetryPolicy::up_to(Duration::from_ticks(0), 1)),
        );
        let serial = sub.serial();
        assert!(pick_tx(&chan).is_some());
        chan.handle_response(serial, 2, &[]);
        let (again, _, _) = pick_tx(&chan).unwrap();
        assert_eq!(again, serial);
        chan.handle_response(serial, 2, &[]);
        match poll_once(&mut sub) {
            Poll::Ready(resp) => {
                assert_eq!(resp.status, Status::Error(RilError::GenericFailure))
            }
            Poll::Pending => panic!("retries exhausted, should be terminal"),
        }
    }

    #[test]
    fn cancel_notifies_waiter() {
        let chan = Channel::new();
        chan.mark_connected_for_test();
        let q = chan.queue();
        let mut sub = q.submit(Request::new(request::OPERATOR));
        chan.cancel(sub.serial(), true);
        match poll_once(&mut sub) {
            Poll::Ready(resp) => assert_eq!(resp.status, Status::Cancelled),
            Poll::Pending => panic!(),
        }
    }

    #[test]
    fn drop_request_removes_detached_entry() {
        let chan = Channel::new();
        chan.mark_connected_for_test();
        let q = chan.queue();
        let serial = q
            .submit(Request::new(request::SET_UICC_SUBSCRIPTION))
            .detach();
        chan.drop_request(serial);
        // A very late response is ignored without fuss.
        chan.handle_response(serial, 0, &[]);
        assert!(pick_tx(&chan).is_none());
    }

    #[test]
    fn queue_cancel_all_leaves_other_queues_alone() {
        let chan = Channel::new();
        chan.mark_connected_for_test();
        let q1 = chan.queue();
        let q2 = chan.queue();
        let mut doomed = q1.submit(Request::new(request::OPERATOR));
        let survivor = q2.submit(Request::new(request::GET_SIM_STATUS));
        q1.cancel_all();
        assert!(matches!(
            poll_once(&mut doomed),
            Poll::Ready(Response {
                status: Status::Cancelled,
                ..
            })
        ));
        let (serial, _, _) = pick_tx(&chan).unwrap();
        assert_eq!(serial, survivor.serial());
    }

    #[test]
    fn retry_now_skips_the_delay() {
        let chan = Channel::new();
        chan.mark_connected_for_test();
        let q = chan.queue();
        let sub = q.submit(
            Request::new(request::VOICE_REGISTRATION_STATE)
                .retry(RetryPolicy::forever(Duration::from_secs(2))),
        );
        let serial = sub.serial();
        assert!(pick_tx(&chan).is_some());
        chan.handle_response(serial, 2, &[]);
        // Sitting in the retry gap now; nothing to transmit.
        assert!(pick_tx(&chan).is_none());
        chan.retry_now(serial);
        let (again, _, _) = pick_tx(&chan).unwrap();
        assert_eq!(again, serial);
    }

    #[test]
    fn fail_all_releases_everything() {
        let chan = Channel::new();
        chan.mark_connected_for_test();
        let q = chan.queue();
        let mut a = q.submit(Request::new(request::OPERATOR));
        let b = q
            .submit(Request::new(request::SET_UICC_SUBSCRIPTION))
            .detach();
        chan.fail_all();
        assert!(!chan.connected());
        assert!(matches!(
            poll_once(&mut a),
            Poll::Ready(Response {
                status: Status::Cancelled,
                ..
            })
        ));
        chan.handle_response(b, 0, &[]);
        assert!(pick_tx(&chan).is_none());
    }

    #[test]
    fn unsol_connected_sets_version() {
        let chan = Channel::new();
        let mut body = Builder::<64>::new();
        body.append_i32(1).append_i32(11);
        chan.handle_unsol(crate::ril::unsol::RIL_CONNECTED, body.as_slice());
        assert!(chan.connected());
        assert_eq!(chan.ril_version(), 11);
    }

    #[test]
    fn dropping_submission_cancels_silently() {
        let chan = Channel::new();
        chan.mark_connected_for_test();
        let q = chan.queue();
        let serial;
        {
            let sub = q.submit(Request::new(request::OPERATOR));
            serial = sub.serial();
        }
        chan.handle_response(serial, 0, &[]);
        assert!(pick_tx(&chan).is_none());
    }
}
