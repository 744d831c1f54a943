//! Keyspace-id ranges and vindexes
//!
//! A shard owns a contiguous range of the keyspace-id space, written in the
//! usual hex form: `-80` is everything below `0x80...`, `80-` everything at
//! or above it. A vindex maps a column value to a keyspace id; `in_keyrange`
//! predicates test that id against the shard's range. Multi-column vindexes
//! concatenate the hash outputs of the consecutive columns.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use tabletd_core::{Result, TabletError};

/// A half-open range [start, end) of keyspace-id prefixes. Empty bounds are
/// unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeyRange {
    pub start: Vec<u8>,
    pub end: Vec<u8>,
}

impl KeyRange {
    /// Parse the canonical shard-range form: `-80`, `40-80`, `80-`, `-`.
    pub fn parse(spec: &str) -> Result<Self> {
        let (start, end) = spec.split_once('-').ok_or_else(|| {
            TabletError::failed_precondition(format!("invalid key range {spec:?}"))
        })?;
        Ok(Self {
            start: decode_hex(start)?,
            end: decode_hex(end)?,
        })
    }

    /// Whether `keyspace_id` falls in this range. Comparison is big-endian
    /// bytewise, so a short bound acts as a prefix.
    pub fn contains(&self, keyspace_id: &[u8]) -> bool {
        if !self.start.is_empty() && keyspace_id < self.start.as_slice() {
            return false;
        }
        if !self.end.is_empty() && keyspace_id >= self.end.as_slice() {
            return false;
        }
        true
    }

    pub fn is_full(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", encode_hex(&self.start), encode_hex(&self.end))
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Vec::new());
    }
    if s.len() % 2 != 0 {
        return Err(TabletError::failed_precondition(format!(
            "odd-length hex key range bound {s:?}"
        )));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16).map_err(|e| {
                TabletError::failed_precondition(format!("invalid hex in key range: {e}"))
            })
        })
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Maps a column value to a keyspace id.
pub trait Vindex: Send + Sync {
    fn name(&self) -> &'static str;

    /// The keyspace id for one value (canonical byte form).
    fn map(&self, value: &[u8]) -> Result<Vec<u8>>;
}

/// 64-bit mixing hash over the numeric value of the column. Distributes
/// sequential ids uniformly over the keyspace.
pub struct HashVindex;

impl Vindex for HashVindex {
    fn name(&self) -> &'static str {
        "hash"
    }

    fn map(&self, value: &[u8]) -> Result<Vec<u8>> {
        let n = parse_numeric(value)?;
        Ok(mix64(n).to_be_bytes().to_vec())
    }
}

/// Identity over the numeric value: keyspace id is the big-endian u64.
/// Keeps ranges humanly predictable; common for lookup-style keyspaces.
pub struct NumericVindex;

impl Vindex for NumericVindex {
    fn name(&self) -> &'static str {
        "numeric"
    }

    fn map(&self, value: &[u8]) -> Result<Vec<u8>> {
        let n = parse_numeric(value)?;
        Ok(n.to_be_bytes().to_vec())
    }
}

/// Identity over the raw bytes.
pub struct BinaryVindex;

impl Vindex for BinaryVindex {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn map(&self, value: &[u8]) -> Result<Vec<u8>> {
        Ok(value.to_vec())
    }
}

fn parse_numeric(value: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(value)
        .map_err(|_| TabletError::failed_precondition("vindex input is not numeric"))?;
    if let Ok(v) = text.parse::<u64>() {
        return Ok(v);
    }
    if let Ok(v) = text.parse::<i64>() {
        return Ok(v as u64);
    }
    Err(TabletError::failed_precondition(format!(
        "vindex input {text:?} is not numeric"
    )))
}

/// splitmix64 finalizer: a full-avalanche 64-bit block mix.
fn mix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

static VINDEX_REGISTRY: Lazy<HashMap<&'static str, Arc<dyn Vindex>>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, Arc<dyn Vindex>> = HashMap::new();
    m.insert("hash", Arc::new(HashVindex));
    m.insert("numeric", Arc::new(NumericVindex));
    m.insert("binary", Arc::new(BinaryVindex));
    m
});

/// Look up a registered vindex by name.
pub fn vindex_by_name(name: &str) -> Result<Arc<dyn Vindex>> {
    VINDEX_REGISTRY
        .get(name)
        .cloned()
        .ok_or_else(|| TabletError::not_found(format!("unknown vindex {name:?}")))
}

/// Compute the keyspace id for one or more consecutive vindex columns: the
/// concatenation of the per-column hash outputs.
pub fn keyspace_id(vindex: &dyn Vindex, values: &[&[u8]]) -> Result<Vec<u8>> {
    let mut id = Vec::new();
    for value in values {
        id.extend(vindex.map(value)?);
    }
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ranges() {
        let left = KeyRange::parse("-80").unwrap();
        assert!(left.start.is_empty());
        assert_eq!(left.end, vec![0x80]);

        let right = KeyRange::parse("80-").unwrap();
        assert_eq!(right.start, vec![0x80]);
        assert!(right.end.is_empty());

        let mid = KeyRange::parse("40-80").unwrap();
        assert_eq!(mid.to_string(), "40-80");

        assert!(KeyRange::parse("-8").is_err());
        assert!(KeyRange::parse("zz-").is_err());
        assert!(KeyRange::parse("80").is_err());
        assert!(KeyRange::parse("-").unwrap().is_full());
    }

    #[test]
    fn test_contains_prefix_semantics() {
        let left = KeyRange::parse("-80").unwrap();
        let right = KeyRange::parse("80-").unwrap();
        assert!(left.contains(&[0x00, 0x01]));
        assert!(left.contains(&[0x7f, 0xff, 0xff]));
        assert!(!left.contains(&[0x80]));
        assert!(!left.contains(&[0x80, 0x00]));
        assert!(right.contains(&[0x80]));
        assert!(right.contains(&[0xff, 0x00]));
        assert!(!right.contains(&[0x7f, 0xff]));

        // Every id is in exactly one of the two halves.
        for id in [[0x00u8; 8], [0x7f; 8], [0x80; 8], [0xff; 8]] {
            assert_ne!(left.contains(&id), right.contains(&id));
        }
    }

    #[test]
    fn test_numeric_vindex() {
        let v = NumericVindex;
        assert_eq!(v.map(b"1").unwrap(), 1u64.to_be_bytes().to_vec());
        assert_eq!(v.map(b"256").unwrap(), 256u64.to_be_bytes().to_vec());
        assert!(v.map(b"abc").is_err());
        // Small ids land in the left half.
        let left = KeyRange::parse("-80").unwrap();
        assert!(left.contains(&v.map(b"12345").unwrap()));
        // The top half starts at 2^63.
        let big = v.map(b"9223372036854775808").unwrap();
        assert!(KeyRange::parse("80-").unwrap().contains(&big));
    }

    #[test]
    fn test_hash_vindex_deterministic_and_spread() {
        let v = HashVindex;
        assert_eq!(v.map(b"42").unwrap(), v.map(b"42").unwrap());
        assert_ne!(v.map(b"42").unwrap(), v.map(b"43").unwrap());

        // Sequential ids spread over both halves.
        let left = KeyRange::parse("-80").unwrap();
        let mut sides = [0usize; 2];
        for i in 0..64 {
            let id = v.map(i.to_string().as_bytes()).unwrap();
            sides[left.contains(&id) as usize] += 1;
        }
        assert!(sides[0] > 8, "hash never lands in 80-");
        assert!(sides[1] > 8, "hash never lands in -80");
    }

    #[test]
    fn test_multi_column_keyspace_id() {
        let id = keyspace_id(&NumericVindex, &[b"1", b"2"]).unwrap();
        let mut expected = 1u64.to_be_bytes().to_vec();
        expected.extend(2u64.to_be_bytes());
        assert_eq!(id, expected);
    }

    #[test]
    fn test_registry() {
        assert_eq!(vindex_by_name("hash").unwrap().name(), "hash");
        assert_eq!(vindex_by_name("numeric").unwrap().name(), "numeric");
        assert!(vindex_by_name("consistent_lookup").is_err());
    }
}
