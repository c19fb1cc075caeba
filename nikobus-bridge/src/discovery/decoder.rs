//! Field extraction from register inventory chunks.
//!
//! A chunk is `H` header nibbles followed by the 6-hex bus address of the
//! button, least significant byte first. Where the header fields sit depends
//! on the module kind:
//!
//! - switch (H = 6): key, mode, channel byte (2 nibbles), t1, t2
//! - roller (H = 6): key and mode swap places between firmware variants, so
//!   both orders are probed; the channel byte is twice the channel index
//! - dimmer (H = 6, 8 or 10): field positions vary, every plausible layout is
//!   scored and the most often confirmed layout wins ties

use std::collections::{BTreeMap, HashMap};

use nikobus_protocol::{hex, ModuleAddress};

use super::devices::{DiscoveredDevice, ModuleKind};
use super::mapping::{
    mode_label, normalize_key, push_button_address, resolve_button_channels, timer_label, KeyMatch,
};

/// Hex digits of the button address at the end of each chunk.
pub const BUTTON_ADDRESS_LEN: usize = 6;

/// Nibble positions of the dimmer header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimmerLayout {
    pub key: usize,
    pub channel: usize,
    pub mode: usize,
    pub t1: usize,
    /// Header length the layout applies to.
    pub header: usize,
}

/// How often each dimmer layout has been selected.
#[derive(Debug, Clone, Default)]
pub struct FrequencyTable {
    counts: HashMap<DimmerLayout, u32>,
}

impl FrequencyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, layout: &DimmerLayout) -> u32 {
        self.counts.get(layout).copied().unwrap_or(0)
    }

    pub fn record(&mut self, layout: DimmerLayout) {
        *self.counts.entry(layout).or_insert(0) += 1;
    }

    pub fn reset(&mut self) {
        self.counts.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Which decoding path produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeVariant {
    Switch { bitmask_channel: bool },
    Roller { key_position: usize, mode_position: usize },
    Dimmer(DimmerLayout),
}

/// Human-oriented details of a decoded chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeMetadata {
    pub chunk: String,
    pub module_address: ModuleAddress,
    /// 1-based output channel.
    pub channel: u8,
    pub mode: String,
    pub t1: Option<String>,
    pub t2: Option<String>,
    pub key_index: u8,
    pub button_channels: u8,
    pub variant: DecodeVariant,
}

/// One button-to-output link read from a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCommand {
    pub module_type: ModuleKind,
    pub key_raw: u8,
    pub channel_raw: u8,
    pub mode_raw: u8,
    pub t1_raw: Option<u8>,
    pub t2_raw: Option<u8>,
    /// Bus address of the button, most significant byte first.
    pub button_address: String,
    pub push_button_address: Option<String>,
    pub metadata: DecodeMetadata,
}

/// Inputs shared by every chunk of one module.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    pub module_address: &'a ModuleAddress,
    pub module_channels: u8,
    pub devices: &'a BTreeMap<String, DiscoveredDevice>,
    pub frequency: &'a FrequencyTable,
}

/// Result of looking at one candidate chunk.
#[derive(Debug, Clone, Default)]
pub struct ChunkAssessment {
    pub decoded: Option<DecodedCommand>,
    /// Plausible fields among key, channel, mode and t1.
    pub plausible_fields: usize,
}

impl ChunkAssessment {
    fn rejected() -> Self {
        Self::default()
    }
}

/// Decode one chunk; `None` for filler or anything implausible.
pub fn decode_command_payload(chunk: &str, kind: ModuleKind, ctx: &DecodeContext<'_>) -> Option<DecodedCommand> {
    assess_chunk(chunk, kind, ctx).decoded
}

/// All-`F` or all-`0` chunks carry no record.
pub fn is_empty_chunk(chunk: &str) -> bool {
    hex::is_filler(chunk) || (!chunk.is_empty() && chunk.chars().all(|c| c == '0'))
}

/// Decode one chunk and report how plausible its fields are.
pub fn assess_chunk(chunk: &str, kind: ModuleKind, ctx: &DecodeContext<'_>) -> ChunkAssessment {
    let chunk = chunk.to_uppercase();
    if is_empty_chunk(&chunk)
        || !kind.chunk_sizes().contains(&chunk.len())
        || !hex::is_hex(&chunk)
    {
        return ChunkAssessment::rejected();
    }
    let nibbles: Vec<u8> = chunk.chars().filter_map(hex::nibble).collect();
    let header = chunk.len() - BUTTON_ADDRESS_LEN;
    let button_address = match hex::reverse_bytes(&chunk[header..]) {
        Ok(address) => address,
        Err(_) => return ChunkAssessment::rejected(),
    };
    let button_channels = resolve_button_channels(&button_address, ctx.devices);
    let chunk_ref = ChunkRef {
        chunk: &chunk,
        nibbles: &nibbles,
        header,
        button_address: &button_address,
        button_channels,
    };

    match kind {
        ModuleKind::Switch => assess_switch(&chunk_ref, ctx),
        ModuleKind::Roller => assess_roller(&chunk_ref, ctx),
        ModuleKind::Dimmer => assess_dimmer(&chunk_ref, ctx),
    }
}

struct ChunkRef<'a> {
    chunk: &'a str,
    nibbles: &'a [u8],
    header: usize,
    button_address: &'a str,
    button_channels: Option<u8>,
}

impl ChunkRef<'_> {
    fn byte(&self, position: usize) -> u8 {
        (self.nibbles[position] << 4) | self.nibbles[position + 1]
    }
}

/// Fields chosen for a record, before assembly.
struct Fields {
    key_raw: u8,
    key: KeyMatch,
    channel_raw: u8,
    channel: u8,
    mode_raw: u8,
    t1_raw: Option<u8>,
    t2_raw: Option<u8>,
    variant: DecodeVariant,
}

fn build(kind: ModuleKind, chunk: &ChunkRef<'_>, ctx: &DecodeContext<'_>, fields: Fields) -> DecodedCommand {
    let mode = mode_label(kind, fields.mode_raw)
        .map(str::to_string)
        .unwrap_or_else(|| format!("Unknown ({:X})", fields.mode_raw));
    DecodedCommand {
        module_type: kind,
        key_raw: fields.key_raw,
        channel_raw: fields.channel_raw,
        mode_raw: fields.mode_raw,
        t1_raw: fields.t1_raw,
        t2_raw: fields.t2_raw,
        button_address: chunk.button_address.to_string(),
        push_button_address: push_button_address(
            chunk.button_address,
            fields.key.channels,
            fields.key.index,
        ),
        metadata: DecodeMetadata {
            chunk: chunk.chunk.to_string(),
            module_address: ctx.module_address.clone(),
            channel: fields.channel,
            mode,
            t1: fields.t1_raw.and_then(timer_label).map(str::to_string),
            t2: fields.t2_raw.and_then(timer_label).map(str::to_string),
            key_index: fields.key.index,
            button_channels: fields.key.channels,
            variant: fields.variant,
        },
    }
}

/// Switch channel byte: a direct index, or a one-hot bitmask.
fn switch_channel(byte: u8, channels: u8) -> Option<(u8, bool)> {
    if byte < channels {
        return Some((byte + 1, false));
    }
    if byte.is_power_of_two() {
        let index = byte.trailing_zeros() as u8;
        if index < channels {
            return Some((index + 1, true));
        }
    }
    None
}

fn assess_switch(chunk: &ChunkRef<'_>, ctx: &DecodeContext<'_>) -> ChunkAssessment {
    let n = chunk.nibbles;
    let key = normalize_key(n[0], chunk.button_channels);
    let mode_ok = mode_label(ModuleKind::Switch, n[1]).is_some();
    let channel_byte = chunk.byte(2);
    let channel = switch_channel(channel_byte, ctx.module_channels);
    let t1_ok = timer_label(n[4]).is_some();
    let plausible_fields = [key.is_some(), channel.is_some(), mode_ok, t1_ok]
        .iter()
        .filter(|ok| **ok)
        .count();

    let decoded = match (key, channel, mode_ok) {
        (Some(key), Some((channel, bitmask)), true) => Some(build(
            ModuleKind::Switch,
            chunk,
            ctx,
            Fields {
                key_raw: n[0],
                key,
                channel_raw: channel_byte,
                channel,
                mode_raw: n[1],
                t1_raw: Some(n[4]),
                t2_raw: Some(n[5]),
                variant: DecodeVariant::Switch {
                    bitmask_channel: bitmask,
                },
            },
        )),
        _ => None,
    };
    ChunkAssessment {
        decoded,
        plausible_fields,
    }
}

/// Key/mode nibble values that only appear in padding.
fn is_reserved(nibble: u8) -> bool {
    nibble >= 0xE
}

fn assess_roller(chunk: &ChunkRef<'_>, ctx: &DecodeContext<'_>) -> ChunkAssessment {
    let n = chunk.nibbles;
    if is_reserved(n[0]) || is_reserved(n[1]) {
        return ChunkAssessment::rejected();
    }
    let channel_byte = chunk.byte(2);
    let channel = (channel_byte % 2 == 0 && channel_byte < 2 * ctx.module_channels)
        .then_some(channel_byte / 2 + 1);
    let t1_ok = timer_label(n[4]).is_some();

    let mut first_fields = None;
    for (key_position, mode_position) in [(0usize, 1usize), (1, 0)] {
        let key = normalize_key(n[key_position], chunk.button_channels);
        let mode_ok = mode_label(ModuleKind::Roller, n[mode_position]).is_some();
        let fields = [key.is_some(), channel.is_some(), mode_ok, t1_ok]
            .iter()
            .filter(|ok| **ok)
            .count();
        first_fields.get_or_insert(fields);

        let Some(key) = key.filter(|_| mode_ok) else {
            continue;
        };
        let decoded = channel.map(|channel| {
            build(
                ModuleKind::Roller,
                chunk,
                ctx,
                Fields {
                    key_raw: n[key_position],
                    key,
                    channel_raw: channel_byte,
                    channel,
                    mode_raw: n[mode_position],
                    t1_raw: Some(n[4]),
                    t2_raw: Some(n[5]),
                    variant: DecodeVariant::Roller {
                        key_position,
                        mode_position,
                    },
                },
            )
        });
        return ChunkAssessment {
            decoded,
            plausible_fields: fields,
        };
    }

    ChunkAssessment {
        decoded: None,
        plausible_fields: first_fields.unwrap_or(0),
    }
}

struct DimmerCandidate {
    layout: DimmerLayout,
    key: Option<KeyMatch>,
    channel_ok: bool,
    valid: usize,
}

/// Dimmer layouts for a header of `header` nibbles, in preference order.
pub fn dimmer_layouts(header: usize) -> Vec<DimmerLayout> {
    let mut t1_positions: Vec<usize> = Vec::new();
    for position in [4, 5, header.saturating_sub(1)] {
        if !t1_positions.contains(&position) {
            t1_positions.push(position);
        }
    }

    let mut layouts = Vec::new();
    for key in [0, 1] {
        for channel in [2, 3] {
            for mode in [1, 4, 5] {
                for &t1 in &t1_positions {
                    let positions = [key, channel, mode, t1];
                    let distinct = (0..4).all(|i| (i + 1..4).all(|j| positions[i] != positions[j]));
                    if distinct && positions.iter().all(|p| *p < header) {
                        layouts.push(DimmerLayout {
                            key,
                            channel,
                            mode,
                            t1,
                            header,
                        });
                    }
                }
            }
        }
    }
    layouts
}

fn assess_dimmer(chunk: &ChunkRef<'_>, ctx: &DecodeContext<'_>) -> ChunkAssessment {
    let n = chunk.nibbles;
    let candidates: Vec<DimmerCandidate> = dimmer_layouts(chunk.header)
        .into_iter()
        .map(|layout| {
            let key = normalize_key(n[layout.key], chunk.button_channels);
            let channel_ok = n[layout.channel] < ctx.module_channels;
            let mode_ok = mode_label(ModuleKind::Dimmer, n[layout.mode]).is_some();
            let t1_ok = timer_label(n[layout.t1]).is_some();
            let valid = [key.is_some(), channel_ok, mode_ok, t1_ok]
                .iter()
                .filter(|ok| **ok)
                .count();
            DimmerCandidate {
                layout,
                key,
                channel_ok,
                valid,
            }
        })
        .collect();

    let Some(best) = select_dimmer_candidate(&candidates, ctx.frequency) else {
        return ChunkAssessment {
            decoded: None,
            plausible_fields: candidates.iter().map(|c| c.valid).max().unwrap_or(0),
        };
    };
    let Some(key) = best.key else {
        return ChunkAssessment::rejected();
    };

    let layout = best.layout;
    let decoded = build(
        ModuleKind::Dimmer,
        chunk,
        ctx,
        Fields {
            key_raw: n[layout.key],
            key,
            channel_raw: n[layout.channel],
            channel: n[layout.channel] + 1,
            mode_raw: n[layout.mode],
            t1_raw: Some(n[layout.t1]),
            t2_raw: None,
            variant: DecodeVariant::Dimmer(layout),
        },
    );
    ChunkAssessment {
        decoded: Some(decoded),
        plausible_fields: best.valid,
    }
}

/// Fully valid layouts first; otherwise the most valid layout with a usable
/// key and channel. Ties go to the more frequently selected layout, then to
/// enumeration order.
fn select_dimmer_candidate<'c>(
    candidates: &'c [DimmerCandidate],
    frequency: &FrequencyTable,
) -> Option<&'c DimmerCandidate> {
    let usable = candidates.iter().filter(|c| c.key.is_some() && c.channel_ok);
    let top = usable.clone().map(|c| c.valid).max()?;

    let mut best: Option<&DimmerCandidate> = None;
    for candidate in usable.filter(|c| c.valid == top) {
        let better = match best {
            None => true,
            Some(current) => frequency.count(&candidate.layout) > frequency.count(&current.layout),
        };
        if better {
            best = Some(candidate);
        }
    }
    best
}
