//! Splitting a module inventory payload into chunks.
//!
//! Dimmer registers hold records of 12, 14 or 16 hex digits with no
//! separator, so the payload is segmented by dynamic programming over every
//! offset: each candidate chunk is scored by how well it decodes and the
//! best total wins.

use nikobus_protocol::hex;

use super::decoder::{assess_chunk, DecodeContext};
use super::devices::ModuleKind;

pub const DECODE_SUCCESS_BONUS: f64 = 10.0;
pub const FIELD_BONUS: f64 = 1.0;
pub const LENGTH_MATCH_BONUS: f64 = 2.0;
pub const FILLER_PENALTY: f64 = 6.0;
pub const UNDECODED_PENALTY: f64 = 4.0;
pub const REMAINDER_PENALTY: f64 = 1.0;

/// End of the used register area.
pub const PAYLOAD_TERMINATOR: &str = "FFFFFFFFFFFF";

/// Chunks chosen for a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Segmentation {
    pub chunks: Vec<String>,
    /// Trailing hex not covered by any chunk.
    pub remainder: String,
    pub score: f64,
}

/// Cut the payload at the first run of 12 `F`.
pub fn truncate_at_terminator(payload: &str) -> &str {
    match payload.find(PAYLOAD_TERMINATOR) {
        Some(end) => &payload[..end],
        None => payload,
    }
}

/// Score of a single chunk.
pub fn chunk_score(chunk: &str, kind: ModuleKind, ctx: &DecodeContext<'_>) -> f64 {
    let assessment = assess_chunk(chunk, kind, ctx);
    let filler = FILLER_PENALTY * hex::filler_ratio(chunk);
    if assessment.decoded.is_some() {
        let length_bonus = if chunk.len() == kind.preferred_chunk_size() {
            LENGTH_MATCH_BONUS
        } else {
            0.0
        };
        DECODE_SUCCESS_BONUS + FIELD_BONUS * assessment.plausible_fields as f64 + length_bonus - filler
    } else {
        -UNDECODED_PENALTY - filler
    }
}

/// Best split of `payload` into chunks of the sizes `kind` allows.
///
/// `best[i]` holds the best score for `payload[i..]`. On equal scores the
/// earlier candidate size is kept, so the preferred size wins ties.
pub fn segment_payload(payload: &str, kind: ModuleKind, ctx: &DecodeContext<'_>) -> Segmentation {
    let payload = truncate_at_terminator(payload).to_uppercase();
    let n = payload.len();
    let sizes = kind.chunk_sizes();

    let mut best = vec![0.0f64; n + 1];
    let mut choice: Vec<Option<usize>> = vec![None; n + 1];

    for i in (0..n).rev() {
        let mut best_here: Option<(f64, Option<usize>)> = None;
        for &size in sizes {
            if i + size > n {
                continue;
            }
            let score = chunk_score(&payload[i..i + size], kind, ctx) + best[i + size];
            if best_here.map_or(true, |(current, _)| score > current) {
                best_here = Some((score, Some(size)));
            }
        }

        let remainder = -REMAINDER_PENALTY * (n - i) as f64;
        let (score, size) = match best_here {
            Some((score, size)) if score >= remainder => (score, size),
            _ => (remainder, None),
        };
        best[i] = score;
        choice[i] = size;
    }

    let mut chunks = Vec::new();
    let mut i = 0;
    while let Some(size) = choice.get(i).copied().flatten() {
        chunks.push(payload[i..i + size].to_string());
        i += size;
    }

    Segmentation {
        chunks,
        remainder: payload[i..].to_string(),
        score: best[0],
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use nikobus_protocol::ModuleAddress;

    use super::*;
    use crate::discovery::decoder::FrequencyTable;

    fn segment(payload: &str, kind: ModuleKind) -> Segmentation {
        let address = ModuleAddress::new("4707").unwrap();
        let devices = BTreeMap::new();
        let frequency = FrequencyTable::new();
        let ctx = DecodeContext {
            module_address: &address,
            module_channels: 12,
            devices: &devices,
            frequency: &frequency,
        };
        segment_payload(payload, kind, &ctx)
    }

    #[test]
    fn test_truncate_at_terminator() {
        assert_eq!(truncate_at_terminator("10030056340AFFFFFFFFFFFF1234"), "10030056340A");
        assert_eq!(truncate_at_terminator("10030056340A"), "10030056340A");
        assert_eq!(truncate_at_terminator("FFFFFFFFFFFF"), "");
    }

    #[test]
    fn test_switch_chunks() {
        for copies in 1..=3 {
            let payload = "10030056340A".repeat(copies);
            let result = segment(&payload, ModuleKind::Switch);
            assert_eq!(result.chunks.len(), copies);
            assert!(result.remainder.is_empty());
            assert_eq!(result.score, 16.0 * copies as f64);
        }
    }

    #[test]
    fn test_roller_chunks() {
        let result = segment(&"10060056340A".repeat(2), ModuleKind::Roller);
        assert_eq!(result.chunks, vec!["10060056340A", "10060056340A"]);
        assert_eq!(result.score, 32.0);
    }

    #[test]
    fn test_dimmer_chunk_sizes() {
        for (chunk, per_chunk) in [
            ("10300056340A", 16.0),
            ("10300A9B56340A", 14.0),
            ("1030000A9B56340A", 14.0),
        ] {
            for copies in 1..=3 {
                let result = segment(&chunk.repeat(copies), ModuleKind::Dimmer);
                assert_eq!(result.chunks, vec![chunk.to_string(); copies]);
                assert!(result.remainder.is_empty());
                assert_eq!(result.score, per_chunk * copies as f64);
            }
        }
    }

    #[test]
    fn test_dimmer_mixed_sizes() {
        let payload = "10300056340A10300A9B56340A1030000A9B56340A";
        let result = segment(payload, ModuleKind::Dimmer);
        assert_eq!(
            result.chunks,
            vec!["10300056340A", "10300A9B56340A", "1030000A9B56340A"]
        );
        assert_eq!(result.score, 44.0);
    }

    #[test]
    fn test_remainder_and_terminator() {
        let result = segment("10030056340AFFFFFFFFFFFFFFFF", ModuleKind::Switch);
        assert_eq!(result.chunks, vec!["10030056340A"]);
        assert!(result.remainder.is_empty());

        // An undecodable chunk still beats leaving 12 more digits unused.
        let result = segment("10300056340AFFFF", ModuleKind::Switch);
        assert_eq!(result.chunks, vec!["10300056340A"]);
        assert_eq!(result.remainder, "FFFF");
        assert_eq!(result.score, -8.0);

        let result = segment("", ModuleKind::Dimmer);
        assert!(result.chunks.is_empty());
        assert_eq!(result.score, 0.0);
    }
}
