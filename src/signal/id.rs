// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Monotonic, time-ordered 128-bit ID generation (UUIDv7-compatible
//! layout).
//!
//! Layout (big-endian bit positions, matching RFC 9562 UUIDv7):
//! - bits 0..48: Unix milliseconds
//! - bits 48..52: version (= 7)
//! - bits 52..64: 12-bit sequence, monotonic within a millisecond
//! - bits 64..66: variant (= 0b10)
//! - bits 66..128: 62 bits of random data
//!
//! A single [`IdGenerator`] instance produces IDs that are strictly
//! monotonically comparable. When a caller exhausts all 4096 sequence
//! numbers within one millisecond, the embedded timestamp is advanced
//! artificially rather than stalling the caller; "id timestamp" is
//! therefore an upper bound on wall-clock time, not the wall clock itself.

use std::{
    sync::Mutex,
    time::{SystemTime, UNIX_EPOCH},
};

use rand::RngCore;

const VERSION: u128 = 0x7;
const VARIANT: u128 = 0b10;
const SEQ_MASK: u16 = 0x0FFF;
const MAX_SEQ: u16 = 0x0FFF;

/// Generator state: last-used timestamp and the sequence counter used
/// within that millisecond.
struct GeneratorState {
    last_ms: u64,
    seq: u16,
}

/// Produces monotonic UUIDv7-compatible IDs.
///
/// Clock non-monotonicity (the wall clock moving backward) is handled by
/// clamping the embedded timestamp to `max(previous, now)`: this avoids ID
/// collisions and out-of-order IDs without requiring a dedicated monotonic
/// clock source.
pub struct IdGenerator {
    state: Mutex<GeneratorState>,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    /// Creates a new generator with its internal clock primed from the
    /// current wall-clock time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GeneratorState {
                last_ms: current_millis(),
                seq: 0,
            }),
        }
    }

    /// Generates a new ID and returns it alongside the millisecond
    /// timestamp embedded in it.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned by a prior panic in
    /// another thread holding the lock.
    pub fn generate(&self) -> (String, u64) {
        let now = current_millis();
        let mut state = self.state.lock().expect("id generator mutex poisoned");

        let ts = if now > state.last_ms {
            state.seq = 0;
            state.last_ms = now;
            now
        } else if state.seq >= MAX_SEQ {
            // Sequence space exhausted within this millisecond: advance the
            // timestamp artificially rather than stalling the caller.
            state.last_ms += 1;
            state.seq = 0;
            state.last_ms
        } else {
            state.seq += 1;
            state.last_ms
        };

        let seq = state.seq;
        drop(state);

        (encode(ts, seq), ts)
    }

    /// Generates `count` IDs in a single call, advancing the timestamp
    /// across millisecond boundaries as needed.
    pub fn generate_batch(&self, count: usize) -> Vec<(String, u64)> {
        (0..count).map(|_| self.generate()).collect()
    }
}

fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn encode(ts_ms: u64, seq: u16) -> String {
    let mut rng = rand::rng();
    let rand62 = rng.next_u64() & 0x3FFF_FFFF_FFFF_FFFF;

    let mut id: u128 = 0;
    id |= u128::from(ts_ms) << 80;
    id |= VERSION << 76;
    id |= u128::from(seq & SEQ_MASK) << 64;
    id |= VARIANT << 62;
    id |= u128::from(rand62);

    format!("{id:032x}")
}

/// Parses a 32-character lowercase hex ID back into its 128-bit value.
fn decode(id: &str) -> Option<u128> {
    if id.len() != 32 || !id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u128::from_str_radix(id, 16).ok()
}

/// Extracts the embedded millisecond timestamp from an ID produced by
/// [`IdGenerator::generate`].
#[must_use]
pub fn extract_timestamp(id: &str) -> Option<u64> {
    let raw = decode(id)?;
    Some(u64::try_from(raw >> 80).unwrap_or(u64::MAX))
}

/// Extracts the embedded 12-bit sequence number from an ID.
#[must_use]
pub fn sequence(id: &str) -> Option<u16> {
    let raw = decode(id)?;
    Some(((raw >> 64) & u128::from(SEQ_MASK)) as u16)
}

/// Compares two IDs by `(timestamp, sequence, lexicographic)` order.
///
/// Because the timestamp and sequence occupy the most significant bits
/// of the encoded value, this is equivalent to a plain numeric (and
/// therefore lexicographic hex-string) comparison of the decoded value.
#[must_use]
pub fn compare(a: &str, b: &str) -> std::cmp::Ordering {
    match (decode(a), decode(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_round_trips_timestamp_and_sequence() {
        let gen = IdGenerator::new();
        let (id, ts) = gen.generate();
        assert_eq!(extract_timestamp(&id), Some(ts));
        assert!(sequence(&id).is_some());
    }

    #[test]
    fn sequential_ids_from_one_generator_are_strictly_increasing() {
        let gen = IdGenerator::new();
        let ids: Vec<String> = (0..500).map(|_| gen.generate().0).collect();
        for pair in ids.windows(2) {
            assert_eq!(compare(&pair[0], &pair[1]), std::cmp::Ordering::Less);
        }
    }

    #[test]
    fn batch_generation_is_monotonic_across_many_ids() {
        let gen = IdGenerator::new();
        let ids = gen.generate_batch(10_000);
        for pair in ids.windows(2) {
            assert_eq!(compare(&pair[0].0, &pair[1].0), std::cmp::Ordering::Less);
        }
    }

    #[test]
    fn id_is_32_lowercase_hex_chars() {
        let gen = IdGenerator::new();
        let (id, _) = gen.generate();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn version_and_variant_bits_are_set() {
        let gen = IdGenerator::new();
        let (id, _) = gen.generate();
        let raw = decode(&id).expect("valid id");
        let version = (raw >> 76) & 0xF;
        let variant = (raw >> 62) & 0b11;
        assert_eq!(version, 7);
        assert_eq!(variant, 0b10);
    }

    #[test]
    fn compare_is_consistent_with_ord() {
        assert_eq!(compare("a", "a"), std::cmp::Ordering::Equal);
    }
}
