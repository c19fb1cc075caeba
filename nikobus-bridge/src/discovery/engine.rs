//! Discovery state machine.
//!
//! The engine is plain synchronous state: it builds sweep frames, consumes
//! inventory frames and merges the results into the configuration store.
//! [`super::service`] drives it from a single task.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, trace, warn};
use nikobus_protocol::types::{ADDRESS_INVENTORY_PREFIX, MODULE_INVENTORY_PREFIX};
use nikobus_protocol::{hex, make_command, make_raw_command, parse_frame, FunctionCode, ModuleAddress};

use super::decoder::{decode_command_payload, DecodeContext, DecodeVariant, DecodedCommand, FrequencyTable};
use super::devices::{DeviceCategory, DiscoveredDevice, ModuleKind};
use super::merge::{
    build_output_mappings, merge_devices_into_button_config, merge_devices_into_module_config,
    merge_into_button_config, OutputMapping,
};
use super::segment::segment_payload;
use crate::error::{BridgeError, Result};
use crate::store::{
    load_button_config, load_module_config, write_button_config, write_module_config, ConfigStore,
    ModuleConfig,
};

/// First controller register holding an address record.
pub const ADDRESS_REGISTER_FIRST: u8 = 0xA3;
/// Last controller register holding an address record.
pub const ADDRESS_REGISTER_LAST: u8 = 0xFF;

/// Module whose registers are being read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleTarget {
    pub address: ModuleAddress,
    pub kind: ModuleKind,
    pub channels: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DiscoveryPhase {
    #[default]
    Idle,
    SweepingAddresses,
    SweepingModule(ModuleTarget),
}

/// Outcome of an address sweep.
#[derive(Debug, Clone, Default)]
pub struct AddressSweepReport {
    /// Modules and buttons, keyed by address.
    pub devices: Vec<DiscoveredDevice>,
    /// Records with an unknown type code; reported, never persisted.
    pub unknown: Vec<DiscoveredDevice>,
    pub modules_added: usize,
    pub buttons_added: usize,
}

/// Outcome of a module register sweep.
#[derive(Debug, Clone)]
pub struct ModuleSweepReport {
    pub target: ModuleTarget,
    pub records: Vec<DecodedCommand>,
    pub mappings: Vec<OutputMapping>,
}

pub struct DiscoveryEngine {
    store: Arc<dyn ConfigStore>,
    controller_address: String,
    phase: DiscoveryPhase,
    /// Every module and button seen so far.
    devices: BTreeMap<String, DiscoveredDevice>,
    unknown: Vec<DiscoveredDevice>,
    /// Raw register payload of the current module sweep.
    buffer: String,
    /// Set once a fixed-size sweep reached an all-`F` chunk.
    terminated: bool,
    decoded: Vec<DecodedCommand>,
    frequency: FrequencyTable,
}

impl DiscoveryEngine {
    pub fn new(store: Arc<dyn ConfigStore>, controller_address: impl Into<String>) -> Self {
        Self {
            store,
            controller_address: controller_address.into(),
            phase: DiscoveryPhase::Idle,
            devices: BTreeMap::new(),
            unknown: Vec::new(),
            buffer: String::new(),
            terminated: false,
            decoded: Vec::new(),
            frequency: FrequencyTable::new(),
        }
    }

    pub fn phase(&self) -> &DiscoveryPhase {
        &self.phase
    }

    pub fn is_idle(&self) -> bool {
        self.phase == DiscoveryPhase::Idle
    }

    pub fn devices(&self) -> &BTreeMap<String, DiscoveredDevice> {
        &self.devices
    }

    pub fn frequency(&self) -> &FrequencyTable {
        &self.frequency
    }

    /// Forget which dimmer layouts have been seen.
    pub fn reset_frequency_table(&mut self) {
        self.frequency.reset();
    }

    /// Discovered output modules, in address order.
    pub fn discovered_modules(&self) -> Vec<ModuleAddress> {
        self.devices
            .values()
            .filter(|d| d.module_kind.is_some())
            .filter_map(|d| ModuleAddress::new(&d.address).ok())
            .collect()
    }

    /// Abandon the current sweep without merging anything.
    pub fn abort(&mut self) {
        if !self.is_idle() {
            warn!("Discovery: aborting {:?}", self.phase);
        }
        self.phase = DiscoveryPhase::Idle;
        self.clear_module_state();
    }

    fn clear_module_state(&mut self) {
        self.buffer.clear();
        self.terminated = false;
        self.decoded.clear();
    }

    /// Enter the address sweep and return the inventory frames to send.
    pub fn start_address_sweep(&mut self) -> Result<Vec<String>> {
        let frames = (ADDRESS_REGISTER_FIRST..=ADDRESS_REGISTER_LAST)
            .map(|register| {
                make_command(
                    FunctionCode::AddressInventory.code(),
                    &self.controller_address,
                    Some(&format!("{:02X}04", register)),
                )
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.unknown.clear();
        self.phase = DiscoveryPhase::SweepingAddresses;
        info!(
            "Discovery: address sweep of controller {} ({} registers)",
            self.controller_address,
            frames.len()
        );
        Ok(frames)
    }

    /// Kind and channel count of an output module, from discovery results
    /// first and the module document second.
    pub fn module_kind_of(&self, address: &ModuleAddress) -> Result<Option<(ModuleKind, u8)>> {
        if let Some(device) = self.devices.get(address.as_str()) {
            if let Some(kind) = device.module_kind {
                let channels = device.channel_count.unwrap_or_else(|| kind.default_channels());
                return Ok(Some((kind, channels)));
            }
        }

        let config = match load_module_config(self.store.as_ref()) {
            Ok(config) => config,
            Err(BridgeError::MissingConfig(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(config.find(address.as_str()).map(|(kind, entry)| {
            let channels = match entry.channels.len() {
                0 => kind.default_channels(),
                n => n.min(u8::MAX as usize) as u8,
            };
            (kind, channels)
        }))
    }

    /// Enter a register sweep of `address` and return the frames to send.
    pub fn start_module_sweep(&mut self, address: &ModuleAddress) -> Result<Vec<String>> {
        let (kind, channels) = self.module_kind_of(address)?.ok_or_else(|| {
            BridgeError::Config(format!("Module {} is not a known output module", address))
        })?;

        let function = kind.inventory_function().code();
        let frames = kind
            .inventory_registers()
            .map(|register| {
                make_raw_command(&format!(
                    "{:02X}{}{:02X}04",
                    function,
                    address.swapped(),
                    register
                ))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        self.clear_module_state();
        self.phase = DiscoveryPhase::SweepingModule(ModuleTarget {
            address: address.clone(),
            kind,
            channels,
        });
        info!(
            "Discovery: register sweep of {} module {} ({} registers)",
            kind,
            address,
            frames.len()
        );
        Ok(frames)
    }

    /// Record one `$18` address record.
    ///
    /// Returns the device described by the record, or `None` for an empty
    /// register.
    pub fn parse_inventory_response(&mut self, frame: &str) -> Result<Option<DiscoveredDevice>> {
        let start = frame
            .rfind(ADDRESS_INVENTORY_PREFIX)
            .ok_or_else(|| BridgeError::Data(format!("Not an address record: {}", frame)))?;
        let bytes = hex::decode(frame[start + 1..].trim())?;
        if bytes.len() < 8 {
            return Err(BridgeError::Data(format!("Short address record: {}", frame)));
        }

        let device_type = bytes[7];
        if device_type == 0xFF {
            trace!("Discovery: empty register {}", frame);
            return Ok(None);
        }

        let raw_address = format!("{:02X}{:02X}{:02X}", bytes[6], bytes[5], bytes[4]);
        let mut device = DiscoveredDevice::from_type_code(raw_address, device_type, Utc::now());
        if device.category == DeviceCategory::Module {
            device.address = device.address[2..].to_string();
        }

        match device.category {
            DeviceCategory::Unknown => {
                warn!(
                    "Discovery: unknown device type {} at {}",
                    device.device_type, device.address
                );
                if !self.unknown.iter().any(|d| d.address == device.address) {
                    self.unknown.push(device.clone());
                }
            }
            _ => {
                info!(
                    "Discovery: found {} at {} ({})",
                    device.name, device.address, device.model
                );
                self.devices
                    .entry(device.address.clone())
                    .and_modify(|existing| existing.refresh(&device))
                    .or_insert_with(|| device.clone());
            }
        }
        Ok(Some(device))
    }

    /// Append one `$2E` register block to the current module sweep.
    ///
    /// Returns how many records were decoded from it; dimmer blocks are only
    /// buffered and decoded when the sweep finishes.
    pub fn parse_module_inventory_response(&mut self, frame: &str) -> Result<usize> {
        let DiscoveryPhase::SweepingModule(target) = &self.phase else {
            debug!("Discovery: register block outside a module sweep: {}", frame);
            return Ok(0);
        };
        let start = frame
            .rfind(MODULE_INVENTORY_PREFIX)
            .ok_or_else(|| BridgeError::Data(format!("Not a register block: {}", frame)))?;
        let parsed = parse_frame(&frame[start..])?;
        let wire_address = parsed
            .data
            .get(..4)
            .ok_or_else(|| BridgeError::Data(format!("Short register block: {}", frame)))?;
        let address = hex::swap_bytes(wire_address)?;
        if address != target.address.as_str() {
            debug!(
                "Discovery: register block from {} while sweeping {}",
                address, target.address
            );
            return Ok(0);
        }

        let payload = parsed.data[4..].to_uppercase();
        self.buffer.push_str(&payload);
        if !target.kind.has_fixed_chunks() {
            return Ok(0);
        }

        let kind = target.kind;
        let size = kind.preferred_chunk_size();
        let ctx = DecodeContext {
            module_address: &target.address,
            module_channels: target.channels,
            devices: &self.devices,
            frequency: &self.frequency,
        };
        let mut consumed = 0;
        let mut decoded = 0;
        while !self.terminated && self.buffer.len() - consumed >= size {
            let chunk = &self.buffer[consumed..consumed + size];
            consumed += size;
            if hex::is_filler(chunk) {
                debug!("Discovery: end of register data for {}", target.address);
                self.terminated = true;
                break;
            }
            match decode_command_payload(chunk, kind, &ctx) {
                Some(record) => {
                    debug!(
                        "Discovery: {} key {} -> {} channel {} ({})",
                        record.button_address,
                        record.key_raw,
                        record.metadata.module_address,
                        record.metadata.channel,
                        record.metadata.mode
                    );
                    self.decoded.push(record);
                    decoded += 1;
                }
                None => debug!("Discovery: skipping chunk {}", chunk),
            }
        }
        self.buffer.drain(..consumed);
        Ok(decoded)
    }

    /// Leave the address sweep and merge what it found into the documents.
    pub fn finish_address_sweep(&mut self) -> Result<AddressSweepReport> {
        if self.phase != DiscoveryPhase::SweepingAddresses {
            return Err(BridgeError::Data("No address sweep in progress".into()));
        }
        self.phase = DiscoveryPhase::Idle;

        let mut modules = match load_module_config(self.store.as_ref()) {
            Ok(config) => config,
            Err(BridgeError::MissingConfig(_)) => ModuleConfig::default(),
            Err(e) => return Err(e),
        };
        let module_summary = merge_devices_into_module_config(&mut modules, self.devices.values());
        if module_summary.changed() {
            write_module_config(self.store.as_ref(), &modules)?;
        }

        let mut buttons = load_button_config(self.store.as_ref())?;
        let button_summary = merge_devices_into_button_config(&mut buttons, self.devices.values());
        if button_summary.changed() {
            write_button_config(self.store.as_ref(), &buttons)?;
        }

        info!(
            "Discovery: address sweep done, {} devices ({} new modules, {} new buttons, {} unknown)",
            self.devices.len(),
            module_summary.added,
            button_summary.added,
            self.unknown.len()
        );
        Ok(AddressSweepReport {
            devices: self.devices.values().cloned().collect(),
            unknown: std::mem::take(&mut self.unknown),
            modules_added: module_summary.added,
            buttons_added: button_summary.added,
        })
    }

    /// Leave the module sweep, decode what is left and merge the links into
    /// the button document.
    pub fn finish_module_sweep(&mut self) -> Result<ModuleSweepReport> {
        let target = match std::mem::take(&mut self.phase) {
            DiscoveryPhase::SweepingModule(target) => target,
            other => {
                self.phase = other;
                return Err(BridgeError::Data("No module sweep in progress".into()));
            }
        };

        if !target.kind.has_fixed_chunks() {
            self.decode_segmented(&target);
        }
        let records = std::mem::take(&mut self.decoded);
        self.clear_module_state();

        let mappings = build_output_mappings(&records);
        let mut buttons = load_button_config(self.store.as_ref())?;
        let summary = merge_into_button_config(&mut buttons, &mappings);
        if summary.changed() {
            write_button_config(self.store.as_ref(), &buttons)?;
        }

        info!(
            "Discovery: module {} done, {} records, {} button links ({} new buttons)",
            target.address,
            records.len(),
            mappings.len(),
            summary.added
        );
        Ok(ModuleSweepReport {
            target,
            records,
            mappings,
        })
    }

    fn decode_segmented(&mut self, target: &ModuleTarget) {
        let segmentation = {
            let ctx = DecodeContext {
                module_address: &target.address,
                module_channels: target.channels,
                devices: &self.devices,
                frequency: &self.frequency,
            };
            segment_payload(&self.buffer, target.kind, &ctx)
        };
        debug!(
            "Discovery: {} chunks for {} (score {:.1}, {} hex left over)",
            segmentation.chunks.len(),
            target.address,
            segmentation.score,
            segmentation.remainder.len()
        );

        for chunk in &segmentation.chunks {
            let ctx = DecodeContext {
                module_address: &target.address,
                module_channels: target.channels,
                devices: &self.devices,
                frequency: &self.frequency,
            };
            let Some(record) = decode_command_payload(chunk, target.kind, &ctx) else {
                debug!("Discovery: skipping chunk {}", chunk);
                continue;
            };
            if let DecodeVariant::Dimmer(layout) = record.metadata.variant {
                self.frequency.record(layout);
            }
            self.decoded.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::{ConfigKind, ImpactedModule, MemoryStore};

    fn engine_with(store: Arc<MemoryStore>) -> DiscoveryEngine {
        DiscoveryEngine::new(store, "0000")
    }

    fn record(data: &str) -> String {
        make_raw_command(data).unwrap()
    }

    fn block(address_wire: &str, payload: &str) -> String {
        assert_eq!(payload.len(), 32);
        make_raw_command(&format!("{}{}", address_wire, payload)).unwrap()
    }

    #[test]
    fn test_address_sweep_frames() {
        let mut engine = engine_with(Arc::new(MemoryStore::new()));
        let frames = engine.start_address_sweep().unwrap();
        assert_eq!(frames.len(), 93);
        assert_eq!(frames[0], make_command(0x14, "0000", Some("A304")).unwrap());
        assert_eq!(frames[92], make_command(0x14, "0000", Some("FF04")).unwrap());
        assert_eq!(engine.phase(), &DiscoveryPhase::SweepingAddresses);
    }

    #[test]
    fn test_parse_inventory_response() {
        let mut engine = engine_with(Arc::new(MemoryStore::new()));
        engine.start_address_sweep().unwrap();

        let module = engine
            .parse_inventory_response(&record("0000A307470001"))
            .unwrap()
            .unwrap();
        assert_eq!(module.address, "4707");
        assert_eq!(module.module_kind, Some(ModuleKind::Switch));

        let button = engine
            .parse_inventory_response(&record("0000A4801C0D06"))
            .unwrap()
            .unwrap();
        assert_eq!(button.address, "0D1C80");
        assert_eq!(button.category, DeviceCategory::Button);
        assert_eq!(button.channel_count, Some(4));

        assert!(engine
            .parse_inventory_response(&record("0000A5FFFFFFFF"))
            .unwrap()
            .is_none());

        let unknown = engine
            .parse_inventory_response(&record("0000A6123456EE"))
            .unwrap()
            .unwrap();
        assert_eq!(unknown.category, DeviceCategory::Unknown);

        // Embedded after an echoed command.
        let echoed = format!("$0514{}", record("0000A76C0E0003"));
        let dimmer = engine.parse_inventory_response(&echoed).unwrap().unwrap();
        assert_eq!(dimmer.address, "0E6C");
        assert_eq!(dimmer.module_kind, Some(ModuleKind::Dimmer));

        assert_eq!(engine.devices().len(), 3);
        assert!(engine.parse_inventory_response("$0514").is_err());
    }

    #[test]
    fn test_finish_address_sweep_writes_documents() {
        let store = Arc::new(MemoryStore::with_modules(json!({
            "switch_module": {"4707": {"description": "Ground floor", "channels": []}}
        })));
        let mut engine = engine_with(store.clone());
        engine.start_address_sweep().unwrap();
        engine.parse_inventory_response(&record("0000A307470001")).unwrap();
        engine.parse_inventory_response(&record("0000A4801C0D06")).unwrap();
        engine.parse_inventory_response(&record("0000A6123456EE")).unwrap();

        let report = engine.finish_address_sweep().unwrap();
        assert!(engine.is_idle());
        assert_eq!(report.devices.len(), 2);
        assert_eq!(report.unknown.len(), 1);
        assert_eq!(report.buttons_added, 1);

        let modules = load_module_config(store.as_ref()).unwrap();
        assert_eq!(modules.switch_module["4707"].description, "Ground floor");
        assert_eq!(modules.switch_module["4707"].model, "05-000-02");
        let buttons = load_button_config(store.as_ref()).unwrap();
        assert!(buttons.nikobus_button.contains_key("0D1C80"));
        assert!(!buttons.nikobus_button.contains_key("563412"));

        assert_eq!(engine.discovered_modules(), vec![ModuleAddress::new("4707").unwrap()]);
        assert!(engine.finish_address_sweep().is_err());
    }

    #[test]
    fn test_module_kind_from_config() {
        let store = Arc::new(MemoryStore::with_modules(json!({
            "roller_module": {"9105": {"description": "Shutters", "channels": [{}, {}, {}]}}
        })));
        let engine = engine_with(store);
        let roller = ModuleAddress::new("9105").unwrap();
        assert_eq!(engine.module_kind_of(&roller).unwrap(), Some((ModuleKind::Roller, 3)));
        assert_eq!(engine.module_kind_of(&ModuleAddress::new("1234").unwrap()).unwrap(), None);
    }

    #[test]
    fn test_module_sweep_frames() {
        let store = Arc::new(MemoryStore::with_modules(json!({
            "dimmer_module": {"0E6C": {"channels": []}}
        })));
        let mut engine = engine_with(store);
        let address = ModuleAddress::new("0E6C").unwrap();
        let frames = engine.start_module_sweep(&address).unwrap();
        assert_eq!(frames.len(), 0x70);
        assert_eq!(frames[0], make_raw_command("226C0E1004").unwrap());
        assert!(matches!(engine.phase(), DiscoveryPhase::SweepingModule(t) if t.kind == ModuleKind::Dimmer));

        assert!(engine.start_module_sweep(&ModuleAddress::new("1234").unwrap()).is_err());
    }

    #[test]
    fn test_switch_module_sweep() {
        let store = Arc::new(MemoryStore::with_modules(json!({"switch_module": {}})));
        let mut engine = engine_with(store.clone());
        engine.start_address_sweep().unwrap();
        engine.parse_inventory_response(&record("0000A307470001")).unwrap();
        engine.finish_address_sweep().unwrap();

        let address = ModuleAddress::new("4707").unwrap();
        let frames = engine.start_module_sweep(&address).unwrap();
        assert_eq!(frames.len(), 0x30);
        assert_eq!(frames[0], make_raw_command("1007471004").unwrap());

        let first = format!("10030056340A13400156340A{}", "F".repeat(8));
        assert_eq!(engine.parse_module_inventory_response(&block("0747", &first)).unwrap(), 2);
        // A block for another module is ignored.
        let foreign = format!("{}{}", "10030056340A".repeat(2), "F".repeat(8));
        assert_eq!(
            engine.parse_module_inventory_response(&block("0E6C", &foreign)).unwrap(),
            0
        );
        assert_eq!(
            engine.parse_module_inventory_response(&block("0747", &"F".repeat(32))).unwrap(),
            0
        );
        // Data after the end marker is not decoded.
        assert_eq!(
            engine
                .parse_module_inventory_response(&block("0747", &format!("10030056340A{}", "0".repeat(20))))
                .unwrap(),
            0
        );

        let report = engine.finish_module_sweep().unwrap();
        assert!(engine.is_idle());
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.mappings.len(), 1);
        assert_eq!(report.mappings[0].push_button_address, "1A8B14");
        assert_eq!(report.mappings[0].outputs.len(), 2);

        let buttons = load_button_config(store.as_ref()).unwrap();
        let entry = &buttons.nikobus_button["1A8B14"];
        assert_eq!(entry.description, "Discovered button 1A8B14");
        assert_eq!(
            entry.impacted_module,
            vec![
                ImpactedModule {
                    address: "4707".into(),
                    group: "1".into()
                },
                ImpactedModule {
                    address: "4707".into(),
                    group: "2".into()
                },
            ]
        );
    }

    #[test]
    fn test_dimmer_module_sweep_segments_at_end() {
        let store = Arc::new(MemoryStore::with_modules(json!({
            "dimmer_module": {"0E6C": {"description": "Living", "channels": []}}
        })));
        let mut engine = engine_with(store.clone());
        let address = ModuleAddress::new("0E6C").unwrap();
        engine.start_module_sweep(&address).unwrap();

        let first = "10300A9B56340A1030000A9B56340AFF";
        assert_eq!(engine.parse_module_inventory_response(&block("6C0E", first)).unwrap(), 0);
        engine
            .parse_module_inventory_response(&block("6C0E", &"F".repeat(32)))
            .unwrap();

        let report = engine.finish_module_sweep().unwrap();
        assert_eq!(report.records.len(), 2);
        assert!(report.records.iter().all(|r| r.metadata.channel == 4 && r.t2_raw.is_none()));
        // Same key, channel, mode and timer: one output.
        assert_eq!(report.mappings.len(), 1);
        assert_eq!(report.mappings[0].outputs.len(), 1);
        assert!(!engine.frequency().is_empty());

        engine.reset_frequency_table();
        assert!(engine.frequency().is_empty());
        assert_eq!(store.write_count(), 1);
        assert!(store.load(ConfigKind::Button).unwrap().is_some());
    }

    #[test]
    fn test_abort_and_idle_frames() {
        let mut engine = engine_with(Arc::new(MemoryStore::new()));
        assert_eq!(
            engine
                .parse_module_inventory_response(&block("0747", &"1".repeat(32)))
                .unwrap(),
            0
        );
        engine.start_address_sweep().unwrap();
        engine.abort();
        assert!(engine.is_idle());
        assert!(engine.finish_module_sweep().is_err());
    }
}
