//! Signal fabric between the per-slot components.
//!
//! The original object model wired components together with per-signal
//! handler lists; here every slot owns one pubsub channel of coarse
//! notifications and each interested task subscribes and re-checks the
//! shared state it cares about. Losing an event to subscriber lag is
//! harmless for the same reason: events carry no payload.

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::pubsub::{PubSubChannel, Subscriber, WaitResult};

pub const EVENT_CAP: usize = 16;
pub const EVENT_SUBS: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotEvent {
    /// Public radio state moved (no request pending, no retry armed).
    RadioStateChanged,
    RadioOnlineChanged,
    /// A GET_SIM_STATUS response was processed (even if identical).
    SimStatusReceived,
    SimStatusChanged,
    SimStateChanged,
    SimAppChanged,
    SimIoActiveChanged,
    ImsiChanged,
    /// User preferred mode in the SIM settings moved.
    PrefModeSettingChanged,
    OperatorChanged,
    SignalStrengthChanged,
    CellInfoChanged,
    VoiceStateChanged,
    DataStateChanged,
    PrefModeChanged,
    MaxPrefModeChanged,
    AllowChanged,
    CallsChanged,
    /// A data request finished and its result is ready to collect.
    DataRequestDone,
    /// The engine went idle; the manager may act across slots.
    CheckData,
    /// The transport died; cached state is stale until reconnect.
    ChannelError,
    /// IMEI and first SIM status are in; the gate was lifted.
    SlotReady,
}

pub type Events = PubSubChannel<NoopRawMutex, SlotEvent, EVENT_CAP, EVENT_SUBS, 16>;
pub type EventSubscriber<'a> =
    Subscriber<'a, NoopRawMutex, SlotEvent, EVENT_CAP, EVENT_SUBS, 16>;

/// Publishes without blocking; with `EVENT_CAP` backlog the slowest
/// subscriber lags, which collapses into a spurious re-check.
pub fn publish(events: &Events, event: SlotEvent) {
    events.immediate_publisher().publish_immediate(event);
}

/// Strips the lag marker; a lagged subscriber treats the gap as "some
/// event" and re-reads whatever state it mirrors.
pub async fn next_event(sub: &mut EventSubscriber<'_>) -> SlotEvent {
    loop {
        match sub.next_message().await {
            WaitResult::Message(ev) => return ev,
            WaitResult::Lagged(_) => continue,
        }
    }
}
