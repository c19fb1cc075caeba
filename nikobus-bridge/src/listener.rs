//! Continuous read loop that classifies bus traffic.
//!
//! Each line is matched against known prefixes in priority order:
//!
//! | Order | Prefix | Route |
//! |-------|--------|-------|
//! | 1 | `#N` | [`BusEvent::ButtonPressed`] |
//! | 2 | handshake echoes, `$0E` | dropped |
//! | 3 | `$0515`, `$0516` | response queue |
//! | 4 | `$1012`, `$1017` | remembered as pending feedback refresh |
//! | 5 | `$1C` (refresh pending) | [`BusEvent::FeedbackState`] + response queue |
//! | 6 | `$0512`, `$0517` | response queue |
//! | 7 | `$2E` | discovery |
//! | 8 | `$18` | discovery + response queue |
//! | 9 | anything else | response queue |
//!
//! Inventory records often follow the ack of the command that requested
//! them on the same line (`$0514$18...`, `$0510$2E...`); they are matched on
//! the embedded frame.
//!
//! Frames from categories 5 to 8 must pass [`validate_crc`]; a bad frame is
//! logged and dropped, the loop keeps running. A bare `$0512` / `$0517` ack
//! carries no checksum and is queued as is.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use nikobus_protocol::{
    parse_frame, validate_crc, Group, ModuleAddress, ACK_PREFIX, ADDRESS_INVENTORY_PREFIX,
    BUTTON_PRESS_PREFIX,
    COMMAND_PROCESSED_PREFIXES, FEEDBACK_ANSWER_PREFIX, FEEDBACK_REFRESH_PREFIXES,
    IGNORED_PREFIXES, MANUAL_REFRESH_PREFIXES, MODULE_INVENTORY_PREFIX, STATE_HEX_LEN,
};

use crate::error::BridgeError;
use crate::event::{publish, BusEvent};
use crate::transport::BusTransport;

/// Inventory traffic handed to discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryFrame {
    /// `$18` controller address inventory record.
    Address(String),
    /// `$2E` module register inventory block.
    Module(String),
}

/// Category of a received line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameClass {
    ButtonPress(String),
    Ignored,
    CommandProcessed,
    FeedbackRefresh(Group),
    FeedbackAnswer,
    ManualRefresh,
    DeviceInventory,
    AddressInventory,
    Unmatched,
}

fn starts_with_any(line: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|prefix| line.starts_with(prefix))
}

/// Length of an ack such as `$0514`.
const ACK_LEN: usize = 5;

/// The frame following a leading ack, or the whole line.
fn strip_ack(line: &str) -> &str {
    match line.get(ACK_LEN..) {
        Some(rest) if line.starts_with(ACK_PREFIX) && rest.starts_with('$') => rest,
        _ => line,
    }
}

/// True when `line` carries more than a bare ack.
fn has_embedded_frame(line: &str) -> bool {
    line.get(1..).is_some_and(|rest| rest.contains('$'))
}

/// Classify `line`. `$1C` only counts as a feedback answer while a refresh
/// request is pending.
pub fn classify(line: &str, feedback_pending: bool) -> FrameClass {
    if let Some(rest) = line.strip_prefix(BUTTON_PRESS_PREFIX) {
        return FrameClass::ButtonPress(rest.trim().to_uppercase());
    }
    if starts_with_any(line, &IGNORED_PREFIXES) {
        return FrameClass::Ignored;
    }
    if starts_with_any(line, &COMMAND_PROCESSED_PREFIXES) {
        return FrameClass::CommandProcessed;
    }
    if line.starts_with(FEEDBACK_REFRESH_PREFIXES[0]) {
        return FrameClass::FeedbackRefresh(Group::One);
    }
    if line.starts_with(FEEDBACK_REFRESH_PREFIXES[1]) {
        return FrameClass::FeedbackRefresh(Group::Two);
    }
    if feedback_pending && line.starts_with(FEEDBACK_ANSWER_PREFIX) {
        return FrameClass::FeedbackAnswer;
    }
    if starts_with_any(line, &MANUAL_REFRESH_PREFIXES) {
        return FrameClass::ManualRefresh;
    }
    let frame = strip_ack(line);
    if frame.starts_with(MODULE_INVENTORY_PREFIX) {
        return FrameClass::DeviceInventory;
    }
    if frame.starts_with(ADDRESS_INVENTORY_PREFIX) {
        return FrameClass::AddressInventory;
    }
    FrameClass::Unmatched
}

/// Module address and 12-hex state of a `$1C` answer frame.
pub fn parse_feedback_answer(line: &str) -> Option<(ModuleAddress, String)> {
    let frame = parse_frame(line).ok()?;
    let wire_address = frame.data.get(0..4)?;
    let address = ModuleAddress::new(&nikobus_protocol::swap_bytes(wire_address).ok()?).ok()?;
    let state = frame.data.get(6..6 + STATE_HEX_LEN)?.to_string();
    Some((address, state))
}

/// The read loop.
pub struct FrameListener {
    transport: Arc<dyn BusTransport>,
    responses: mpsc::UnboundedSender<String>,
    inventory: mpsc::UnboundedSender<InventoryFrame>,
    events: broadcast::Sender<BusEvent>,
    read_timeout: Duration,
    cancel: CancellationToken,
    /// Group requested by the last feedback refresh trigger.
    pending_feedback: Option<Group>,
}

impl FrameListener {
    pub fn new(
        transport: Arc<dyn BusTransport>,
        responses: mpsc::UnboundedSender<String>,
        inventory: mpsc::UnboundedSender<InventoryFrame>,
        events: broadcast::Sender<BusEvent>,
        read_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            responses,
            inventory,
            events,
            read_timeout,
            cancel,
            pending_feedback: None,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        info!("Frame listener started");
        let cancel = self.cancel.clone();
        let transport = self.transport.clone();

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                read = timeout(self.read_timeout, transport.read()) => read,
            };

            match read {
                Err(_) => continue,
                Ok(Ok(line)) => self.handle_line(&line),
                Ok(Err(BridgeError::Closed)) if cancel.is_cancelled() || !transport.is_open() => {
                    break;
                }
                Ok(Err(e)) => {
                    error!("Listener read failed: {}", e);
                    publish(
                        &self.events,
                        BusEvent::ConnectionLost {
                            reason: e.to_string(),
                        },
                    );
                    break;
                }
            }
        }
        info!("Frame listener stopped");
    }

    /// Route one line.
    pub fn handle_line(&mut self, line: &str) {
        let line = line.trim();
        trace!("<- {}", line);

        match classify(line, self.pending_feedback.is_some()) {
            FrameClass::ButtonPress(address) => {
                if address.len() != 6 || !address.chars().all(|c| c.is_ascii_hexdigit()) {
                    warn!("Malformed button press: {}", line);
                    return;
                }
                info!("Button pressed: {}", address);
                publish(&self.events, BusEvent::ButtonPressed { address });
            }
            FrameClass::Ignored => trace!("Ignoring {}", line),
            FrameClass::CommandProcessed => self.queue(line),
            FrameClass::FeedbackRefresh(group) => {
                debug!("Feedback refresh requested for group {}", group.number());
                self.pending_feedback = Some(group);
            }
            FrameClass::FeedbackAnswer => {
                let group = self.pending_feedback.take();
                if !self.check(line) {
                    return;
                }
                match (group, parse_feedback_answer(line)) {
                    (Some(group), Some((address, state))) => {
                        debug!("Feedback state {} group {}: {}", address, group.number(), state);
                        publish(
                            &self.events,
                            BusEvent::FeedbackState {
                                address,
                                group,
                                state,
                            },
                        );
                    }
                    _ => warn!("Unparseable feedback answer: {}", line),
                }
                self.queue(line);
            }
            FrameClass::ManualRefresh => {
                if !has_embedded_frame(line) || self.check(line) {
                    self.queue(line);
                }
            }
            FrameClass::DeviceInventory => {
                if self.check(line) {
                    self.forward(InventoryFrame::Module(line.to_string()));
                }
            }
            FrameClass::AddressInventory => {
                if self.check(line) {
                    self.forward(InventoryFrame::Address(line.to_string()));
                    self.queue(line);
                }
            }
            FrameClass::Unmatched => self.queue(line),
        }
    }

    fn check(&self, line: &str) -> bool {
        match validate_crc(line) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping frame {}: {}", line, e);
                false
            }
        }
    }

    fn queue(&self, line: &str) {
        if self.responses.send(line.to_string()).is_err() {
            debug!("Response queue closed, dropping {}", line);
        }
    }

    fn forward(&self, frame: InventoryFrame) {
        if let Err(e) = self.inventory.send(frame) {
            debug!("Discovery not running, dropping {:?}", e.0);
        }
    }
}
