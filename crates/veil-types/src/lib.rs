#![forbid(unsafe_code)]
//! Scalar types shared across veilfs crates.
//!
//! Unit-carrying newtypes prevent mixing virtual and physical block
//! addresses, generations, and key ids; byte helpers do bounds-checked
//! little-endian access for the hand-packed on-disk codecs.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Physical block address: the storage unit managed by the free-space engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pba(pub u64);

impl Pba {
    /// The null address. Leaf records and inner entries with a null address
    /// are vacant.
    pub const NULL: Self = Self(0);
    /// Reserved non-addressable sentinel.
    pub const INVALID: Self = Self(u64::MAX);

    /// Whether this address may refer to a real block.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::NULL && self != Self::INVALID
    }
}

/// Virtual block address: the caller-visible address space unit being
/// copy-on-written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Vba(pub u64);

/// Monotonically increasing version counter. A generation is "secured" once
/// its writes are durably committed by the superblock manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Generation {
    pub const ZERO: Self = Self(0);
}

/// Encryption key identifier. Rekeying moves blocks from the previous key id
/// to the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyId(pub u32);

impl fmt::Display for Pba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Vba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Content digest ──────────────────────────────────────────────────────────

/// Size of a content digest in bytes.
pub const DIGEST_SIZE: usize = 32;

/// blake3 content digest of one block image.
///
/// Inner entries record the digest of the child block; the engine verifies
/// every block it reads against the parent-recorded digest before trusting
/// its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest(pub [u8; DIGEST_SIZE]);

impl Digest {
    pub const ZERO: Self = Self([0_u8; DIGEST_SIZE]);

    /// Digest a full block image, padding included.
    #[must_use]
    pub fn of_block(bytes: &[u8]) -> Self {
        Self(*blake3::hash(bytes).as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

// ── Snapshot view ───────────────────────────────────────────────────────────

/// Read-only view of the snapshot registry and the last securely-committed
/// generation, supplied by the superblock manager on every `execute()` call.
///
/// The engine never mutates it.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotView<'a> {
    /// Generations of the currently valid snapshots, in no particular order.
    pub snapshots: &'a [Generation],
    /// Highest generation whose writes are durably committed.
    pub last_secured: Generation,
}

impl<'a> SnapshotView<'a> {
    #[must_use]
    pub fn new(snapshots: &'a [Generation], last_secured: Generation) -> Self {
        Self {
            snapshots,
            last_secured,
        }
    }
}

// ── Byte-level parse errors ─────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::IntegerConversion { field: "offset" });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    let end = offset
        .checked_add(4)
        .ok_or(ParseError::IntegerConversion { field: "offset" })?;
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: 4,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    data[offset..end].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    let end = offset
        .checked_add(8)
        .ok_or(ParseError::IntegerConversion { field: "offset" })?;
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: 8,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    data[offset..end].copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_fixed<const N: usize>(
    data: &mut [u8],
    offset: usize,
    value: &[u8; N],
) -> Result<(), ParseError> {
    let end = offset
        .checked_add(N)
        .ok_or(ParseError::IntegerConversion { field: "offset" })?;
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: N,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    data[offset..end].copy_from_slice(value);
    Ok(())
}
