//! Core value types: ids, items, range bounds, and the additive set
//! fingerprint they roll up into.

use std::cmp::Ordering;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::encoding;
use crate::{Error, Result};

/// Ids are opaque 32-byte values; the engine never interprets them.
pub const ID_SIZE: usize = 32;

/// Wire size of a finalized fingerprint.
pub const FINGERPRINT_SIZE: usize = 16;

/// A reconcilable identifier.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id([u8; ID_SIZE]);

impl Id {
    pub const fn new(bytes: [u8; ID_SIZE]) -> Self {
        Id(bytes)
    }

    pub fn bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn hex(&self) -> String {
        hex::encode(self.bytes())
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)?;
        Self::try_from(bytes.as_slice())
    }
}

impl TryFrom<&[u8]> for Id {
    type Error = Error;

    fn try_from(slice: &[u8]) -> Result<Self> {
        if slice.len() != ID_SIZE {
            return Err(Error::BadIdSize);
        }
        let mut bytes = [0u8; ID_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Id(bytes))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hex())
    }
}

/// A reconcilable record. Ordering is timestamp first, then id.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Item {
    pub timestamp: u64,
    pub id: Id,
}

impl Item {
    pub fn new(timestamp: u64, id: Id) -> Self {
        Item { timestamp, id }
    }
}

impl Ord for Item {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Item {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Item {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.timestamp, self.id.hex())
    }
}

/// A half-key used as a range endpoint: a timestamp plus an id prefix of
/// 0..=32 bytes. For comparisons the prefix is right-padded with zeros, so
/// a `Bound` orders like the smallest item it could stand for. Equality and
/// ordering ignore the prefix length; the wire encoding preserves it.
#[derive(Clone, Copy)]
pub struct Bound {
    item: Item,
    id_len: usize,
}

impl Bound {
    /// The lowest possible bound.
    pub fn zero() -> Self {
        Bound {
            item: Item::default(),
            id_len: 0,
        }
    }

    /// The "no upper limit" sentinel.
    pub fn infinite() -> Self {
        Bound {
            item: Item::new(u64::MAX, Id::default()),
            id_len: 0,
        }
    }

    pub fn new(timestamp: u64, id_prefix: &[u8]) -> Result<Self> {
        if id_prefix.len() > ID_SIZE {
            return Err(Error::BadIdSize);
        }
        let mut bytes = [0u8; ID_SIZE];
        bytes[..id_prefix.len()].copy_from_slice(id_prefix);
        Ok(Bound {
            item: Item::new(timestamp, Id::new(bytes)),
            id_len: id_prefix.len(),
        })
    }

    pub fn with_timestamp(timestamp: u64) -> Self {
        Bound {
            item: Item::new(timestamp, Id::default()),
            id_len: 0,
        }
    }

    pub fn from_item(item: &Item) -> Self {
        Bound {
            item: *item,
            id_len: ID_SIZE,
        }
    }

    /// The shortest bound strictly greater than `prev` and `<= curr`.
    ///
    /// If the timestamps differ the timestamp alone suffices; otherwise the
    /// prefix is one byte past the ids' shared prefix.
    pub fn between(prev: &Item, curr: &Item) -> Self {
        if curr.timestamp != prev.timestamp {
            return Bound::with_timestamp(curr.timestamp);
        }

        let prev_id = prev.id.bytes();
        let curr_id = curr.id.bytes();
        let mut shared = 0;
        while shared < ID_SIZE && prev_id[shared] == curr_id[shared] {
            shared += 1;
        }

        let id_len = (shared + 1).min(ID_SIZE);
        let mut bytes = [0u8; ID_SIZE];
        bytes[..id_len].copy_from_slice(&curr_id[..id_len]);
        Bound {
            item: Item::new(curr.timestamp, Id::new(bytes)),
            id_len,
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.item.timestamp
    }

    pub fn id_len(&self) -> usize {
        self.id_len
    }

    pub fn id_prefix(&self) -> &[u8] {
        &self.item.id.bytes()[..self.id_len]
    }

    /// The zero-padded item this bound compares as.
    pub fn as_item(&self) -> &Item {
        &self.item
    }
}

impl PartialEq for Bound {
    fn eq(&self, other: &Self) -> bool {
        self.item == other.item
    }
}

impl Eq for Bound {}

impl Ord for Bound {
    fn cmp(&self, other: &Self) -> Ordering {
        self.item.cmp(&other.item)
    }
}

impl PartialOrd for Bound {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bound({},{})",
            self.item.timestamp,
            hex::encode(self.id_prefix())
        )
    }
}

/// 256-bit additive set summary, stored as canonical little-endian bytes.
///
/// Addition is carry-propagating modulo 2^256; subtraction adds the two's
/// complement. Working on the byte form via [`u64::from_le_bytes`] keeps the
/// canonical representation identical on big-endian hosts.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Accumulator {
    buf: [u8; ID_SIZE],
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Accumulator { buf: bytes }
    }

    pub fn bytes(&self) -> &[u8; ID_SIZE] {
        &self.buf
    }

    pub fn add_id(&mut self, id: &Id) {
        self.add_bytes(id.bytes());
    }

    pub fn add(&mut self, other: &Accumulator) {
        self.add_bytes(&other.buf);
    }

    pub fn negate(&mut self) {
        for b in &mut self.buf {
            *b = !*b;
        }
        let mut one = [0u8; ID_SIZE];
        one[0] = 1;
        self.add_bytes(&one);
    }

    pub fn sub_id(&mut self, id: &Id) {
        let mut neg = Accumulator { buf: *id.bytes() };
        neg.negate();
        self.add(&neg);
    }

    pub fn sub(&mut self, other: &Accumulator) {
        let mut neg = *other;
        neg.negate();
        self.add(&neg);
    }

    /// Finalize to a wire fingerprint: `SHA-256(accum || varint(count))`
    /// truncated to 16 bytes.
    pub fn fingerprint(&self, count: u64) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.buf);
        hasher.update(encoding::encode_varint(count));
        let digest = hasher.finalize();

        let mut bytes = [0u8; FINGERPRINT_SIZE];
        bytes.copy_from_slice(&digest[..FINGERPRINT_SIZE]);
        Fingerprint(bytes)
    }

    fn add_bytes(&mut self, other: &[u8; ID_SIZE]) {
        let mut carry = 0u64;
        for i in (0..ID_SIZE).step_by(8) {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&self.buf[i..i + 8]);
            let a = u64::from_le_bytes(chunk);
            chunk.copy_from_slice(&other[i..i + 8]);
            let b = u64::from_le_bytes(chunk);

            let (sum, c1) = a.overflowing_add(b);
            let (sum, c2) = sum.overflowing_add(carry);
            carry = u64::from(c1) + u64::from(c2);

            self.buf[i..i + 8].copy_from_slice(&sum.to_le_bytes());
        }
    }
}

impl fmt::Debug for Accumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.buf))
    }
}

/// Finalized 16-byte range fingerprint.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint([u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    pub fn bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Fingerprint {
    type Error = Error;

    fn try_from(slice: &[u8]) -> Result<Self> {
        if slice.len() != FINGERPRINT_SIZE {
            return Err(Error::ParseEndsPrematurely);
        }
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Fingerprint(bytes))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
