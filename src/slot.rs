//! One logical modem endpoint: socket lifecycle, identity handshake
//! and component wiring.
//!
//! On every (re)connect the slot closes the serialization gate so that
//! only the identity and SIM status queries reach the peer, asks for
//! IMEI/IMEISV, and lifts the gate once both the identity and a first
//! SIM status are known. Everything else then flows freely.

use core::cell::RefCell;

use embassy_futures::join::{join, join3};
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_time::{Duration, Timer};
use embedded_io_async::{Read, Write};
use heapless::String;

use crate::cellinfo::CellInfoReporter;
use crate::chan::{runner::Runner, Channel, Queue, Request, RetryPolicy, Submission};
use crate::config::SlotConfig;
use crate::data::context::DataContext;
use crate::data::DataEngine;
use crate::events::{next_event, publish, Events, SlotEvent};
use crate::network::NetworkController;
use crate::radio::RadioController;
use crate::ril::{request, Status};
use crate::sim::io::SimIo;
use crate::sim::settings::SimSettings;
use crate::sim::SimCard;
use crate::vendor::VendorHook;

/// Fixed-delay reconnect loop, same cadence as the request retries.
const CONNECT_RETRY: Duration = Duration::from_millis(crate::ril::RETRY_MS);

/// Identity retries once the modem proved alive by answering the SIM
/// status query.
const IMEI_RETRIES_LAST: i32 = 2;

pub type Imei = String<20>;
pub type Imeisv = String<4>;

/// Socket factory the embedder provides; called for every reconnect.
pub trait SlotTransport {
    type Rx: Read;
    type Tx: Write;
    async fn connect(&mut self) -> Result<(Self::Rx, Self::Tx), ()>;
}

/// Radio capability as reported by GET_RADIO_CAPABILITY; only peers
/// that answer the probe take part in capability switching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RadioCapability {
    pub version: i32,
    pub session: i32,
    pub phase: i32,
    /// Bitmask of RAF_* radio access families.
    pub raf: i32,
    pub uuid: String<64>,
    pub status: i32,
}

impl RadioCapability {
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut p = crate::ril::parcel::Parser::new(data);
        let version = p.get_i32()?;
        let session = p.get_i32()?;
        let phase = p.get_i32()?;
        let raf = p.get_i32()?;
        let uuid: Option<String<64>> = p.get_string()?;
        let status = p.get_i32()?;
        Some(Self {
            version,
            session,
            phase,
            raf,
            uuid: uuid.unwrap_or_default(),
            status,
        })
    }
}

#[derive(Default)]
struct Identity {
    imei: Option<Imei>,
    imeisv: Option<Imeisv>,
    ready: bool,
    caps: Option<RadioCapability>,
}

pub struct Slot {
    pub config: SlotConfig,
    pub chan: Channel,
    pub events: Events,
    pub radio: RadioController,
    pub sim: SimCard,
    pub settings: SimSettings,
    pub network: NetworkController,
    pub engine: DataEngine,
    pub vendor: VendorHook,
    pub cellinfo: CellInfoReporter,
    ident: Mutex<NoopRawMutex, RefCell<Identity>>,
}

impl Slot {
    pub fn new(config: SlotConfig) -> Self {
        let vendor = VendorHook::create(&config.vendor, config.slot);
        let sim = SimCard::new(config.slot, config.uicc_workaround);
        let settings = SimSettings::new(config.techs);
        let network = NetworkController::new(&config);
        let engine = DataEngine::new(config.slot, config.data);
        Self {
            chan: Channel::new(),
            events: Events::new(),
            radio: RadioController::new(),
            sim,
            settings,
            network,
            engine,
            vendor,
            cellinfo: CellInfoReporter::new(),
            ident: Mutex::new(RefCell::new(Identity::default())),
            config,
        }
    }

    fn with_ident<R>(&self, f: impl FnOnce(&mut Identity) -> R) -> R {
        self.ident.lock(|i| f(&mut i.borrow_mut()))
    }

    pub fn imei(&self) -> Option<Imei> {
        self.with_ident(|i| i.imei.clone())
    }

    pub fn imeisv(&self) -> Option<Imeisv> {
        self.with_ident(|i| i.imeisv.clone())
    }

    /// Identity and first SIM status are in; the gate has been lifted.
    pub fn ready(&self) -> bool {
        self.with_ident(|i| i.ready)
    }

    pub fn radio_caps(&self) -> Option<RadioCapability> {
        self.with_ident(|i| i.caps.clone())
    }

    /// Probes GET_RADIO_CAPABILITY; the manager runs this on capable
    /// peers once the slot is up. A peer that answers takes part in
    /// cross-slot capability coordination.
    pub async fn probe_radio_caps(&self) -> Option<RadioCapability> {
        let resp = self
            .chan
            .submit(Request::new(request::GET_RADIO_CAPABILITY))
            .await;
        if !resp.status.is_ok() {
            debug!("slot {} has no radio capability support", self.config.slot);
            return None;
        }
        let caps = RadioCapability::parse(&resp.data);
        self.with_ident(|i| i.caps = caps.clone());
        caps
    }

    /// Enabling a slot brings its modem online; disabling takes it
    /// offline (and, through the radio demand logic, powers it down
    /// unless something else holds it).
    pub fn set_enabled(&self, enabled: bool) {
        self.radio.set_online(enabled, &self.events);
    }

    /// One SCREEN_STATE notification; fire and forget.
    pub fn send_screen_state(&self, on: bool) {
        if self.chan.connected() {
            self.chan
                .submit(Request::ints(request::SCREEN_STATE, &[on as i32]))
                .detach();
        }
    }

    /// A context activation handle bound to this slot's engine.
    pub fn data_context(&self, owner: u8) -> DataContext<'_> {
        DataContext::new(&self.engine, &self.events, owner)
    }

    /// The SIM operation facade for this slot. Create it once and keep
    /// it; each facade owns its own channel queue.
    pub fn sim_io(&self) -> SimIo<'_> {
        SimIo::new(
            &self.chan,
            &self.sim,
            &self.events,
            self.config.empty_pin_query,
        )
    }

    /// Drives the slot forever: connect, run, reconnect on failure.
    pub async fn run<T: SlotTransport>(&self, transport: &mut T) -> ! {
        let slot_q = self.chan.queue();
        let sim_q = self.chan.queue();
        let radio_q = self.chan.queue();
        let net_q = self.chan.queue();
        let data_q = self.chan.queue();
        let vendor_q = self.chan.queue();
        let cell_q = self.chan.queue();
        self.chan.set_default_timeout(self.config.req_timeout);

        loop {
            let (rx, tx) = match transport.connect().await {
                Ok(pair) => pair,
                Err(()) => {
                    Timer::after(CONNECT_RETRY).await;
                    continue;
                }
            };
            debug!("slot {} socket open", self.config.slot);

            // Nothing but the identity and SIM status queries may cross
            // the wire until we know who we are talking to.
            self.chan.set_gate(slot_q.id(), sim_q.id());
            self.with_ident(|i| i.ready = false);

            let mut runner = Runner::new(&self.chan, rx, tx);
            if let Some(sub) = self.config.sub.as_deref() {
                runner = runner.with_subscription(sub);
            }

            let components = async {
                join(
                    join3(
                        self.lifecycle(&slot_q),
                        self.radio.run(&self.chan, &radio_q, &self.events),
                        self.sim.run(&self.chan, &sim_q, &self.events),
                    ),
                    join3(
                        self.network.run(
                            &self.chan,
                            &net_q,
                            &self.radio,
                            &self.sim,
                            &self.settings,
                            &self.events,
                        ),
                        self.engine.run(
                            &self.chan,
                            &data_q,
                            &self.radio,
                            &self.network,
                            &self.vendor,
                            &self.events,
                        ),
                        join(
                            self.vendor
                                .run(&self.chan, &vendor_q, &self.network, &self.events),
                            self.cellinfo.run(
                                &self.chan,
                                &cell_q,
                                &self.radio,
                                &self.sim,
                                &self.events,
                            ),
                        ),
                    ),
                )
                .await
            };

            match select(runner.run(), components).await {
                Either::First(_err) => {
                    error!("slot {} channel error", self.config.slot);
                }
                Either::Second(_) => unreachable!(),
            }

            // Release every waiter with the cancellation sentinel;
            // cached state is stale until the peer talks to us again.
            self.chan.fail_all();
            publish(&self.events, SlotEvent::ChannelError);
            Timer::after(CONNECT_RETRY).await;
        }
    }

    /// Start-up sequence of one connection.
    async fn lifecycle(&self, queue: &Queue<'_>) -> ! {
        self.chan.wait_connected().await;
        info!(
            "slot {} RIL version {}",
            self.config.slot,
            self.chan.ril_version()
        );

        self.query_identity(queue).await;

        // The SIM card machinery queried its status on its own; wait
        // for the first answer before opening the flood gates.
        let mut sub = self.events.subscriber().expect("event subscriber");
        while !self.sim.has_status() {
            let _ = next_event(&mut sub).await;
        }

        self.chan.lift_gate();
        self.with_ident(|i| i.ready = true);
        info!("slot {} ready", self.config.slot);
        publish(&self.events, SlotEvent::SlotReady);

        core::future::pending().await
    }

    fn submit_identity<'a>(&self, queue: &Queue<'a>, retry: RetryPolicy) -> Submission<'a> {
        let code = if self.config.legacy_imei_query {
            request::GET_IMEI
        } else {
            request::DEVICE_IDENTITY
        };
        queue.submit(Request::new(code).blocking().no_timeout().retry(retry))
    }

    /// Waits until the peer coughs up the device identity. Initially
    /// the query retries forever; some rilds only answer once the modem
    /// is initialised, which we detect by the SIM status arriving
    /// first, and then give the query a short final run.
    async fn query_identity(&self, queue: &Queue<'_>) {
        let mut sub = self.events.subscriber().expect("event subscriber");
        let mut last_chance = false;
        let mut req = self.submit_identity(
            queue,
            RetryPolicy::forever(Duration::from_millis(crate::ril::RETRY_MS)).any_error(),
        );

        let resp = loop {
            match select(&mut req, next_event(&mut sub)).await {
                Either::First(resp) => {
                    if resp.status == Status::Cancelled && last_chance {
                        // Restart with a bounded retry budget.
                        req = self.submit_identity(
                            queue,
                            RetryPolicy::up_to(
                                Duration::from_millis(crate::ril::RETRY_MS),
                                IMEI_RETRIES_LAST,
                            )
                            .any_error(),
                        );
                        continue;
                    }
                    break resp;
                }
                Either::Second(SlotEvent::SimStatusReceived) if !last_chance => {
                    // The modem answered the SIM query but not the
                    // identity one; give it one last chance.
                    debug!("slot {} gets its last identity chance", self.config.slot);
                    last_chance = true;
                    self.chan.cancel(req.serial(), true);
                }
                Either::Second(_) => {}
            }
        };

        let mut imei: Option<Imei> = None;
        let mut imeisv: Option<Imeisv> = None;

        if resp.status.is_ok() {
            let mut p = resp.parser();
            if self.config.legacy_imei_query {
                imei = p.get_string().unwrap_or(None);
            } else if p.get_i32().map_or(false, |n| n >= 2) {
                imei = p.get_string().unwrap_or(None);
                imeisv = p.get_string().unwrap_or(None);
            } else {
                debug!("identity parsing failure");
            }
        } else {
            error!("slot {} identity query failed", self.config.slot);
        }

        if self.config.legacy_imei_query && imei.is_some() {
            // Fetch the software version separately.
            let resp = queue.send(Request::new(request::GET_IMEISV)).await;
            if resp.status.is_ok() {
                imeisv = resp.parser().get_string().unwrap_or(None);
            } else {
                error!("slot {} IMEISV query failed", self.config.slot);
            }
        }

        self.with_ident(|i| {
            // The identity never changes; a reconnect only fills the
            // blanks in.
            if i.imei.is_none() {
                i.imei = Some(imei.unwrap_or_else(|| {
                    let mut fallback = Imei::new();
                    core::fmt::Write::write_fmt(
                        &mut fallback,
                        format_args!("{}", self.config.slot),
                    )
                    .ok();
                    fallback
                }));
            }
            if i.imeisv.is_none() {
                i.imeisv = Some(imeisv.unwrap_or_default());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TechMask;

    #[test]
    fn new_slot_wires_config_through() {
        let mut cfg = SlotConfig::default();
        cfg.slot = 1;
        cfg.techs = TechMask::GSM;
        cfg.vendor = String::try_from("mtk1").unwrap();
        let slot = Slot::new(cfg);
        assert_eq!(slot.engine.slot(), 1);
        assert_eq!(slot.settings.techs(), TechMask::GSM);
        assert!(matches!(slot.vendor, VendorHook::Mtk(_)));
        assert!(slot.imei().is_none());
        assert!(!slot.ready());
    }

    #[test]
    fn radio_capability_parse() {
        use crate::ril::parcel::Builder;
        let mut b: Builder<128> = Builder::new();
        b.append_i32(1) // version
            .append_i32(7) // session
            .append_i32(0) // phase
            .append_i32(0x5) // raf
            .append_utf8(Some("com.qualcomm.uuid"))
            .append_i32(1);
        let caps = RadioCapability::parse(b.as_slice()).unwrap();
        assert_eq!(caps.session, 7);
        assert_eq!(caps.raf, 0x5);
        assert_eq!(caps.uuid, "com.qualcomm.uuid");
        assert!(RadioCapability::parse(&[1, 0]).is_none());
    }

    #[test]
    fn screen_state_needs_connection() {
        let slot = Slot::new(SlotConfig::default());
        // Not connected: nothing is queued.
        slot.send_screen_state(true);
        assert!(!slot.chan.connected());
    }
}
