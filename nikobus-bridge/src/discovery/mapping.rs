//! Lookup tables for inventory decoding: key numbering, push-button address
//! offsets, mode and timer labels.

use std::collections::BTreeMap;

use nikobus_protocol::{encode_address_value, hex, parse_bus_address};

use super::devices::{DeviceCategory, DiscoveredDevice, ModuleKind};

/// Operation point counts a button can have.
pub const BUTTON_SIZES: [u8; 3] = [2, 4, 8];

/// Raw key nibble to key index, per button size.
fn key_table(channels: u8) -> Option<&'static [(u8, u8)]> {
    match channels {
        2 => Some(&[(0x1, 0), (0x3, 1)]),
        4 => Some(&[(0x1, 0), (0x0, 1), (0x3, 2), (0x2, 3)]),
        8 => Some(&[
            (0x5, 0),
            (0x4, 1),
            (0x7, 2),
            (0x6, 3),
            (0x1, 4),
            (0x0, 5),
            (0x3, 6),
            (0x2, 7),
        ]),
        _ => None,
    }
}

/// Value added to the top nibble of the encoded address, per key index.
fn nibble_add_table(channels: u8) -> Option<&'static [u8]> {
    match channels {
        2 => Some(&[0x0, 0x8]),
        4 => Some(&[0x0, 0x4, 0x8, 0xC]),
        8 => Some(&[0x0, 0x2, 0x4, 0x6, 0x8, 0xA, 0xC, 0xE]),
        _ => None,
    }
}

/// A key nibble resolved against a button size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyMatch {
    pub index: u8,
    pub channels: u8,
}

/// Map a raw key nibble to a key index.
///
/// With a known button size only that table is used. Otherwise the nibble
/// is accepted only if exactly one table contains it.
pub fn normalize_key(nibble: u8, channels: Option<u8>) -> Option<KeyMatch> {
    let lookup = |size: u8| {
        key_table(size)?
            .iter()
            .find(|(raw, _)| *raw == nibble)
            .map(|(_, index)| KeyMatch {
                index: *index,
                channels: size,
            })
    };
    match channels {
        Some(size) => lookup(size),
        None => {
            let mut matches = BUTTON_SIZES.iter().filter_map(|size| lookup(*size));
            let first = matches.next()?;
            match matches.next() {
                Some(_) => None,
                None => Some(first),
            }
        }
    }
}

pub fn nibble_add(channels: u8, key_index: u8) -> Option<u8> {
    nibble_add_table(channels)?.get(key_index as usize).copied()
}

/// Push-button address of key `key_index` on the button at `bus_address`.
pub fn push_button_address(bus_address: &str, channels: u8, key_index: u8) -> Option<String> {
    let raw = parse_bus_address(bus_address).ok()?;
    let add = nibble_add(channels, key_index)? as u32;
    let encoded = encode_address_value(raw);
    let top = ((encoded >> 20) + add) & 0xF;
    Some(hex::int_to_hex((encoded & 0x0F_FFFF) | (top << 20), 6))
}

/// Operation point count of the button at `bus_address`.
///
/// Known button devices win; otherwise a leading `0` nibble means a 4-key
/// button, and an odd last nibble is retried as `address - 1`.
pub fn resolve_button_channels(
    bus_address: &str,
    devices: &BTreeMap<String, DiscoveredDevice>,
) -> Option<u8> {
    let address = bus_address.to_uppercase();
    if let Some(channels) = known_button_channels(&address, devices) {
        return Some(channels);
    }
    if address.starts_with('0') {
        return Some(4);
    }
    let value = parse_bus_address(&address).ok()?;
    if value & 1 == 1 {
        let even = hex::int_to_hex(value - 1, 6);
        if let Some(channels) = known_button_channels(&even, devices) {
            return Some(channels);
        }
        if even.starts_with('0') {
            return Some(4);
        }
    }
    None
}

fn known_button_channels(
    address: &str,
    devices: &BTreeMap<String, DiscoveredDevice>,
) -> Option<u8> {
    devices
        .get(address)
        .filter(|device| device.category == DeviceCategory::Button)
        .and_then(|device| device.channel_count)
        .filter(|channels| BUTTON_SIZES.contains(channels))
}

const SWITCH_MODES: [&str; 12] = [
    "M01 (On / off)",
    "M02 (On, with operating time)",
    "M03 (Off, with operating time)",
    "M04 (Pushbutton)",
    "M05 (Impulse)",
    "M06 (Delayed off)",
    "M07 (Delayed on)",
    "M08 (Flashing)",
    "M11 (Delayed off, long)",
    "M12 (Delayed on, long)",
    "M14 (Light scene on)",
    "M15 (Light scene on / off)",
];

const ROLLER_MODES: [&str; 6] = [
    "M01 (Open - stop - close)",
    "M02 (Open - stop - close, with operating time)",
    "M03 (Open)",
    "M04 (Close)",
    "M05 (Stop)",
    "M06 (Open, with operating time)",
];

const DIMMER_MODES: [&str; 11] = [
    "M01 (Dim on / off, 2 buttons)",
    "M02 (Dim on / off, 4 buttons)",
    "M03 (Light scene on)",
    "M04 (Light scene on / off)",
    "M05 (Light scene off)",
    "M06 (Delayed off)",
    "M07 (Delayed on)",
    "M08 (Flashing)",
    "M11 (On, with operating time)",
    "M12 (Off, with operating time)",
    "M14 (Dim up / down)",
];

const TIMER_LABELS: [&str; 15] = [
    "10s", "1m", "2m", "3m", "4m", "5m", "6m", "7m", "8m", "9m", "10m", "15m", "30m", "45m", "60m",
];

/// Label of a mode nibble for `kind`, if the nibble is a known mode.
pub fn mode_label(kind: ModuleKind, nibble: u8) -> Option<&'static str> {
    let table: &[&str] = match kind {
        ModuleKind::Switch => &SWITCH_MODES,
        ModuleKind::Roller => &ROLLER_MODES,
        ModuleKind::Dimmer => &DIMMER_MODES,
    };
    table.get(nibble as usize).copied()
}

/// Label of a timer nibble; `F` is never a timer.
pub fn timer_label(nibble: u8) -> Option<&'static str> {
    TIMER_LABELS.get(nibble as usize).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn button_device(address: &str, channels: u8) -> DiscoveredDevice {
        DiscoveredDevice {
            address: address.into(),
            category: DeviceCategory::Button,
            device_type: "06".into(),
            name: "Button".into(),
            model: "05-346".into(),
            channel_count: Some(channels),
            module_kind: None,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_normalize_key_with_known_size() {
        assert_eq!(
            normalize_key(0x3, Some(2)),
            Some(KeyMatch { index: 1, channels: 2 })
        );
        assert_eq!(normalize_key(0x0, Some(2)), None);
        assert_eq!(
            normalize_key(0x2, Some(8)),
            Some(KeyMatch { index: 7, channels: 8 })
        );
    }

    #[test]
    fn test_normalize_key_unknown_size_requires_unique_table() {
        // 1 and 3 appear in every table.
        assert_eq!(normalize_key(0x1, None), None);
        assert_eq!(normalize_key(0x0, None), None);
        // 4..7 exist only for 8-key buttons.
        assert_eq!(
            normalize_key(0x6, None),
            Some(KeyMatch { index: 3, channels: 8 })
        );
        assert_eq!(normalize_key(0x9, None), None);
    }

    #[test]
    fn test_push_button_address() {
        // encode_address(0x000001) == 0x200000, key 1 of a 2-key button adds 8.
        assert_eq!(push_button_address("000001", 2, 0).as_deref(), Some("200000"));
        assert_eq!(push_button_address("000001", 2, 1).as_deref(), Some("A00000"));
        // Top nibble wraps modulo 16.
        assert_eq!(push_button_address("000001", 4, 3).as_deref(), Some("E00000"));
        assert_eq!(push_button_address("100000", 8, 7).as_deref(), Some("E00002"));
        assert_eq!(push_button_address("000001", 3, 0), None);
        assert_eq!(push_button_address("000001", 2, 2), None);
    }

    #[test]
    fn test_resolve_button_channels() {
        let mut devices = BTreeMap::new();
        devices.insert("1A2B3C".to_string(), button_device("1A2B3C", 8));

        assert_eq!(resolve_button_channels("1A2B3C", &devices), Some(8));
        assert_eq!(resolve_button_channels("1a2b3d", &devices), Some(8));
        assert_eq!(resolve_button_channels("0D1C80", &devices), Some(4));
        assert_eq!(resolve_button_channels("1A2B3E", &devices), None);
        assert_eq!(resolve_button_channels("1A2B41", &devices), None);
    }

    #[test]
    fn test_labels() {
        assert_eq!(mode_label(ModuleKind::Switch, 0), Some("M01 (On / off)"));
        assert_eq!(mode_label(ModuleKind::Roller, 6), None);
        assert!(mode_label(ModuleKind::Dimmer, 0xA).is_some());
        assert_eq!(timer_label(0), Some("10s"));
        assert_eq!(timer_label(0xF), None);
    }
}
