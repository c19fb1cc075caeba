//! Device type catalogue and discovered device records.

use std::fmt;
use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nikobus_protocol::FunctionCode;

/// Broad class of a bus device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceCategory {
    Module,
    Button,
    Unknown,
}

/// Output module families with their own inventory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModuleKind {
    Switch,
    Dimmer,
    Roller,
}

impl ModuleKind {
    pub const ALL: [ModuleKind; 3] = [ModuleKind::Switch, ModuleKind::Dimmer, ModuleKind::Roller];

    /// Section of the module document holding this kind.
    pub fn config_key(self) -> &'static str {
        match self {
            ModuleKind::Switch => "switch_module",
            ModuleKind::Dimmer => "dimmer_module",
            ModuleKind::Roller => "roller_module",
        }
    }

    /// Candidate chunk lengths (hex digits) in a register inventory,
    /// preferred size first.
    pub fn chunk_sizes(self) -> &'static [usize] {
        match self {
            ModuleKind::Switch | ModuleKind::Roller => &[12],
            ModuleKind::Dimmer => &[12, 14, 16],
        }
    }

    pub fn preferred_chunk_size(self) -> usize {
        self.chunk_sizes()[0]
    }

    /// Chunks can be sliced without segmentation.
    pub fn has_fixed_chunks(self) -> bool {
        self.chunk_sizes().len() == 1
    }

    pub fn inventory_function(self) -> FunctionCode {
        match self {
            ModuleKind::Switch | ModuleKind::Roller => FunctionCode::ModuleInventory,
            ModuleKind::Dimmer => FunctionCode::DimmerInventory,
        }
    }

    pub fn inventory_registers(self) -> RangeInclusive<u8> {
        match self {
            ModuleKind::Switch | ModuleKind::Roller => 0x10..=0x3F,
            ModuleKind::Dimmer => 0x10..=0x7F,
        }
    }

    /// Output count of the full-size module.
    pub fn default_channels(self) -> u8 {
        match self {
            ModuleKind::Switch | ModuleKind::Dimmer => 12,
            ModuleKind::Roller => 6,
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleKind::Switch => "switch",
            ModuleKind::Dimmer => "dimmer",
            ModuleKind::Roller => "roller",
        };
        f.write_str(name)
    }
}

/// Static description of a device type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceType {
    pub code: u8,
    pub category: DeviceCategory,
    pub name: &'static str,
    pub model: &'static str,
    /// Outputs for modules, operation points for buttons.
    pub channels: Option<u8>,
    pub module_kind: Option<ModuleKind>,
}

const fn module(
    code: u8,
    name: &'static str,
    model: &'static str,
    channels: Option<u8>,
    kind: Option<ModuleKind>,
) -> DeviceType {
    DeviceType {
        code,
        category: DeviceCategory::Module,
        name,
        model,
        channels,
        module_kind: kind,
    }
}

const fn button(
    code: u8,
    name: &'static str,
    model: &'static str,
    channels: Option<u8>,
) -> DeviceType {
    DeviceType {
        code,
        category: DeviceCategory::Button,
        name,
        model,
        channels,
        module_kind: None,
    }
}

/// Known device type codes.
pub const DEVICE_TYPES: &[DeviceType] = &[
    module(0x01, "Switch Module", "05-000-02", Some(12), Some(ModuleKind::Switch)),
    module(0x02, "Roller Shutter Module", "05-001-02", Some(6), Some(ModuleKind::Roller)),
    module(0x03, "Dimmer Module", "05-007-02", Some(12), Some(ModuleKind::Dimmer)),
    button(0x04, "Button with 2 Operation Points", "05-342", Some(2)),
    button(0x06, "Button with 4 Operation Points", "05-346", Some(4)),
    module(0x08, "PC Logic", "05-201", None, None),
    module(0x09, "Compact Switch Module", "05-002-02", Some(4), Some(ModuleKind::Switch)),
    module(0x0A, "PC Link", "05-200", None, None),
    button(0x0C, "IR Button with 4 Operation Points", "05-348", Some(4)),
    button(0x12, "Button with 8 Operation Points", "05-349", Some(8)),
    button(0x1F, "RF Transmitter with 2 Operation Points", "05-311", Some(2)),
    button(0x23, "RF Transmitter with 4 Operation Points", "05-312", Some(4)),
    button(0x25, "Interface", "05-055", None),
    button(0x3F, "Feedback Button with 2 Operation Points", "05-344", Some(2)),
    button(0x40, "Feedback Button with 4 Operation Points", "05-343", Some(4)),
    module(0x42, "Feedback Module", "05-207", None, None),
    button(0x44, "Switch Interface", "05-057", None),
];

pub fn lookup_device_type(code: u8) -> Option<&'static DeviceType> {
    DEVICE_TYPES.iter().find(|t| t.code == code)
}

/// A device seen during an address inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// 4 hex digits for modules, 6 for buttons.
    pub address: String,
    pub category: DeviceCategory,
    /// Type code as 2 hex digits.
    pub device_type: String,
    pub name: String,
    pub model: String,
    pub channel_count: Option<u8>,
    pub module_kind: Option<ModuleKind>,
    pub last_seen: DateTime<Utc>,
}

impl DiscoveredDevice {
    /// Build a record from a type code; unknown codes become `Unknown`.
    pub fn from_type_code(address: String, code: u8, seen: DateTime<Utc>) -> Self {
        match lookup_device_type(code) {
            Some(info) => Self {
                address,
                category: info.category,
                device_type: format!("{:02X}", code),
                name: info.name.to_string(),
                model: info.model.to_string(),
                channel_count: info.channels,
                module_kind: info.module_kind,
                last_seen: seen,
            },
            None => Self {
                address,
                category: DeviceCategory::Unknown,
                device_type: format!("{:02X}", code),
                name: format!("Unknown device type {:02X}", code),
                model: String::new(),
                channel_count: None,
                module_kind: None,
                last_seen: seen,
            },
        }
    }

    /// Refresh from a newer observation of the same address.
    pub fn refresh(&mut self, newer: &DiscoveredDevice) {
        self.category = newer.category;
        self.device_type = newer.device_type.clone();
        self.name = newer.name.clone();
        self.model = newer.model.clone();
        self.channel_count = newer.channel_count;
        self.module_kind = newer.module_kind;
        self.last_seen = newer.last_seen;
    }
}
