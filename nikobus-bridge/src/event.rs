//! Events published to host layers.

use nikobus_protocol::{Group, ModuleAddress};
use tokio::sync::broadcast;

/// Capacity of the event channel; slow subscribers lose the oldest events.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What a finished discovery run covered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryScope {
    /// Controller address inventory.
    Addresses,
    /// Register inventory of one output module.
    Module(ModuleAddress),
}

/// Something observed on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A push button was pressed (`#N` + 6-hex bus address).
    ButtonPressed { address: String },
    /// An output module reported the state of one group.
    FeedbackState {
        address: ModuleAddress,
        group: Group,
        /// 12 hex digits, one byte per channel.
        state: String,
    },
    /// A discovery sweep ended.
    DiscoveryFinished {
        scope: DiscoveryScope,
        /// Devices recorded during the run.
        devices: usize,
        /// Button links written to the button document.
        links: usize,
    },
    /// The read loop stopped on a transport error.
    ConnectionLost { reason: String },
}

/// Create the sender side of the event bus.
pub fn event_channel() -> broadcast::Sender<BusEvent> {
    let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}

/// Publish without caring whether anyone listens.
pub(crate) fn publish(events: &broadcast::Sender<BusEvent>, event: BusEvent) {
    if events.send(event).is_err() {
        log::trace!("No event subscribers");
    }
}
