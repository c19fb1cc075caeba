//! Device and link discovery.
//!
//! Two kinds of sweep exist:
//!
//! - the address sweep reads the controller's address registers and
//!   records every module and button on the bus
//! - the register sweep reads one output module's memory and decodes which
//!   button keys drive which outputs
//!
//! Results are merged into the module and button documents.

pub mod decoder;
pub mod devices;
pub mod engine;
pub mod mapping;
pub mod merge;
pub mod segment;
pub mod service;

use std::time::Duration;

pub use decoder::{assess_chunk, decode_command_payload, DecodedCommand, FrequencyTable};
pub use devices::{DeviceCategory, DiscoveredDevice, ModuleKind};
pub use engine::{AddressSweepReport, DiscoveryEngine, DiscoveryPhase, ModuleSweepReport};
pub use merge::{OutputDefinition, OutputMapping};
pub use segment::{segment_payload, Segmentation};
pub use service::{DiscoveryHandle, DiscoveryOutcome, DiscoveryRequest, DiscoveryService};

/// Default bus address of the PC-Link controller.
pub const DEFAULT_CONTROLLER_ADDRESS: &str = "0000";

/// Discovery settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Controller whose address registers are read.
    pub controller_address: String,
    /// A sweep ends once no inventory frame has arrived for this long.
    pub quiet_period: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            controller_address: DEFAULT_CONTROLLER_ADDRESS.to_string(),
            quiet_period: Duration::from_secs(5),
        }
    }
}
