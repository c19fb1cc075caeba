//! Typed views of the module and button documents.
//!
//! Unknown fields are kept in `extra` so that user edits survive a
//! load/merge/write cycle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::discovery::ModuleKind;

/// `nikobus_module_config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default)]
    pub switch_module: BTreeMap<String, ModuleEntry>,
    #[serde(default)]
    pub dimmer_module: BTreeMap<String, ModuleEntry>,
    #[serde(default)]
    pub roller_module: BTreeMap<String, ModuleEntry>,
}

impl ModuleConfig {
    pub fn section(&self, kind: ModuleKind) -> &BTreeMap<String, ModuleEntry> {
        match kind {
            ModuleKind::Switch => &self.switch_module,
            ModuleKind::Dimmer => &self.dimmer_module,
            ModuleKind::Roller => &self.roller_module,
        }
    }

    pub fn section_mut(&mut self, kind: ModuleKind) -> &mut BTreeMap<String, ModuleEntry> {
        match kind {
            ModuleKind::Switch => &mut self.switch_module,
            ModuleKind::Dimmer => &mut self.dimmer_module,
            ModuleKind::Roller => &mut self.roller_module,
        }
    }

    /// Find a module by address in any section.
    pub fn find(&self, address: &str) -> Option<(ModuleKind, &ModuleEntry)> {
        ModuleKind::ALL
            .iter()
            .find_map(|kind| self.section(*kind).get(address).map(|entry| (*kind, entry)))
    }

    /// Number of configured modules.
    pub fn len(&self) -> usize {
        self.switch_module.len() + self.dimmer_module.len() + self.roller_module.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One output module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleEntry {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub channels: Vec<ChannelEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered_info: Option<DiscoveredInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One output channel of a module.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelEntry {
    #[serde(default)]
    pub description: String,
    /// Roller travel time; stored as written by the user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_time: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// What the address inventory reported about a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredInfo {
    pub name: String,
    pub device_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    pub last_seen: DateTime<Utc>,
}

/// `nikobus_button_config.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ButtonConfig {
    #[serde(default)]
    pub nikobus_button: BTreeMap<String, ButtonEntry>,
}

/// One push button (keyed by push-button address) or button device
/// (keyed by bus address).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ButtonEntry {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub impacted_module: Vec<ImpactedModule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discovered_links: Vec<DiscoveredLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered_info: Option<DiscoveredInfo>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Module group refreshed when the button is pressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImpactedModule {
    pub address: String,
    pub group: String,
}

/// Outputs of one module driven by one button key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredLink {
    pub module_address: String,
    pub key: u8,
    pub outputs: Vec<OutputEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEntry {
    pub channel: u8,
    pub mode: String,
    #[serde(default)]
    pub t1: Option<String>,
    #[serde(default)]
    pub t2: Option<String>,
    pub payload: String,
    pub button_address: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_module_config_keeps_unknown_fields() {
        let raw = json!({
            "switch_module": {
                "4707": {
                    "description": "Ground floor",
                    "model": "05-000-02",
                    "channels": [{"description": "Kitchen", "led_on": true}],
                    "area": "downstairs"
                }
            }
        });
        let config: ModuleConfig = serde_json::from_value(raw).unwrap();
        let entry = &config.switch_module["4707"];
        assert_eq!(entry.extra["area"], "downstairs");
        assert_eq!(entry.channels[0].extra["led_on"], true);
        assert!(config.dimmer_module.is_empty());

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["switch_module"]["4707"]["area"], "downstairs");
        assert!(back["switch_module"]["4707"].get("discovered_info").is_none());
    }

    #[test]
    fn test_find_module() {
        let raw = json!({"roller_module": {"9105": {"description": "Shutters", "channels": []}}});
        let config: ModuleConfig = serde_json::from_value(raw).unwrap();
        let (kind, entry) = config.find("9105").unwrap();
        assert_eq!(kind, ModuleKind::Roller);
        assert_eq!(entry.description, "Shutters");
        assert!(config.find("4707").is_none());
        assert_eq!(config.len(), 1);
    }

    #[test]
    fn test_button_config_parse() {
        let raw = json!({
            "nikobus_button": {
                "1A2B3C": {
                    "description": "Hall",
                    "impacted_module": [{"address": "4707", "group": "1"}]
                }
            }
        });
        let config: ButtonConfig = serde_json::from_value(raw).unwrap();
        let entry = &config.nikobus_button["1A2B3C"];
        assert_eq!(entry.impacted_module[0].group, "1");
        assert!(entry.discovered_links.is_empty());
    }
}
