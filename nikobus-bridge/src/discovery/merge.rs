//! Folding discovery results into the persisted documents.
//!
//! Everything here is additive: user-written descriptions and unknown
//! fields are never touched, and merging the same results twice leaves the
//! documents unchanged.

use std::collections::BTreeMap;

use nikobus_protocol::Group;

use super::decoder::DecodedCommand;
use super::devices::{DeviceCategory, DiscoveredDevice};
use crate::store::{
    ButtonConfig, ButtonEntry, ChannelEntry, DiscoveredInfo, DiscoveredLink, ImpactedModule,
    ModuleConfig, ModuleEntry, OutputEntry,
};

/// One output driven by a button key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputDefinition {
    pub channel: u8,
    pub mode: String,
    pub t1: Option<String>,
    pub t2: Option<String>,
    pub payload: String,
    pub button_address: String,
}

impl OutputDefinition {
    fn identity(&self) -> (u8, &str, Option<&str>, Option<&str>) {
        (self.channel, &self.mode, self.t1.as_deref(), self.t2.as_deref())
    }
}

/// All outputs of one module that a push button key drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMapping {
    pub push_button_address: String,
    pub key: u8,
    pub module_address: String,
    pub outputs: Vec<OutputDefinition>,
}

impl OutputMapping {
    /// Groups of `module_address` the outputs belong to.
    pub fn impacted_groups(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self
            .outputs
            .iter()
            .filter_map(|o| Group::of_channel(o.channel))
            .collect();
        groups.sort_by_key(|g| g.number());
        groups.dedup();
        groups
    }
}

/// Group decoded records by push-button address and key, dropping
/// duplicate outputs. Records without a push-button address are skipped.
pub fn build_output_mappings(records: &[DecodedCommand]) -> Vec<OutputMapping> {
    let mut grouped: BTreeMap<(String, u8, String), Vec<OutputDefinition>> = BTreeMap::new();

    for record in records {
        let Some(push_button) = record.push_button_address.clone() else {
            continue;
        };
        let key = (
            push_button,
            record.key_raw,
            record.metadata.module_address.as_str().to_string(),
        );
        let output = OutputDefinition {
            channel: record.metadata.channel,
            mode: record.metadata.mode.clone(),
            t1: record.metadata.t1.clone(),
            t2: record.metadata.t2.clone(),
            payload: record.metadata.chunk.clone(),
            button_address: record.button_address.clone(),
        };
        let outputs = grouped.entry(key).or_default();
        if !outputs.iter().any(|o| o.identity() == output.identity()) {
            outputs.push(output);
        }
    }

    grouped
        .into_iter()
        .map(|((push_button_address, key, module_address), outputs)| OutputMapping {
            push_button_address,
            key,
            module_address,
            outputs,
        })
        .collect()
}

/// What a merge changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub updated: usize,
}

impl MergeSummary {
    pub fn changed(&self) -> bool {
        self.added + self.updated > 0
    }
}

fn discovered_button(address: &str) -> ButtonEntry {
    ButtonEntry {
        description: format!("Discovered button {}", address),
        ..ButtonEntry::default()
    }
}

/// Merge output mappings into the button document.
pub fn merge_into_button_config(config: &mut ButtonConfig, mappings: &[OutputMapping]) -> MergeSummary {
    let mut summary = MergeSummary::default();

    for mapping in mappings {
        let address = &mapping.push_button_address;
        if !config.nikobus_button.contains_key(address) {
            summary.added += 1;
        }
        let entry = config
            .nikobus_button
            .entry(address.clone())
            .or_insert_with(|| discovered_button(address));

        let link = DiscoveredLink {
            module_address: mapping.module_address.clone(),
            key: mapping.key,
            outputs: mapping
                .outputs
                .iter()
                .map(|o| OutputEntry {
                    channel: o.channel,
                    mode: o.mode.clone(),
                    t1: o.t1.clone(),
                    t2: o.t2.clone(),
                    payload: o.payload.clone(),
                    button_address: o.button_address.clone(),
                })
                .collect(),
        };
        let mut changed = false;
        match entry
            .discovered_links
            .iter_mut()
            .find(|l| l.module_address == link.module_address && l.key == link.key)
        {
            Some(existing) if *existing == link => {}
            Some(existing) => {
                *existing = link;
                changed = true;
            }
            None => {
                entry.discovered_links.push(link);
                changed = true;
            }
        }

        for group in mapping.impacted_groups() {
            let impacted = ImpactedModule {
                address: mapping.module_address.clone(),
                group: group.number().to_string(),
            };
            if !entry.impacted_module.contains(&impacted) {
                entry.impacted_module.push(impacted);
                changed = true;
            }
        }

        if changed {
            summary.updated += 1;
        }
    }
    summary
}

fn info_of(device: &DiscoveredDevice) -> DiscoveredInfo {
    DiscoveredInfo {
        name: device.name.clone(),
        device_type: device.device_type.clone(),
        channels: device.channel_count,
        last_seen: device.last_seen,
    }
}

/// Add or refresh discovered output modules.
///
/// A module already present in any section keeps its place and its
/// description; only the model and discovery details are refreshed.
pub fn merge_devices_into_module_config<'a>(
    config: &mut ModuleConfig,
    devices: impl IntoIterator<Item = &'a DiscoveredDevice>,
) -> MergeSummary {
    let mut summary = MergeSummary::default();

    for device in devices {
        let Some(kind) = device.module_kind else {
            continue;
        };
        let section = config
            .find(&device.address)
            .map(|(existing, _)| existing)
            .unwrap_or(kind);
        let modules = config.section_mut(section);

        match modules.get_mut(&device.address) {
            Some(entry) => {
                if entry.model.is_empty() {
                    entry.model = device.model.clone();
                }
                entry.discovered_info = Some(info_of(device));
                summary.updated += 1;
            }
            None => {
                let channels = (1..=device.channel_count.unwrap_or_else(|| kind.default_channels()))
                    .map(|n| ChannelEntry {
                        description: format!("Output {}", n),
                        ..ChannelEntry::default()
                    })
                    .collect();
                modules.insert(
                    device.address.clone(),
                    ModuleEntry {
                        description: format!("{} {}", device.name, device.address),
                        model: device.model.clone(),
                        channels,
                        discovered_info: Some(info_of(device)),
                        ..ModuleEntry::default()
                    },
                );
                summary.added += 1;
            }
        }
    }
    summary
}

/// Add or refresh discovered button devices, keyed by bus address.
pub fn merge_devices_into_button_config<'a>(
    config: &mut ButtonConfig,
    devices: impl IntoIterator<Item = &'a DiscoveredDevice>,
) -> MergeSummary {
    let mut summary = MergeSummary::default();

    for device in devices {
        if device.category != DeviceCategory::Button {
            continue;
        }
        match config.nikobus_button.get_mut(&device.address) {
            Some(entry) => {
                entry.discovered_info = Some(info_of(device));
                summary.updated += 1;
            }
            None => {
                let mut entry = discovered_button(&device.address);
                entry.discovered_info = Some(info_of(device));
                config.nikobus_button.insert(device.address.clone(), entry);
                summary.added += 1;
            }
        }
    }
    summary
}
