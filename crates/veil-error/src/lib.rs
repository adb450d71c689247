#![forbid(unsafe_code)]
//! Error types for veilfs.
//!
//! # Error Taxonomy
//!
//! The reclamation engine distinguishes two failure classes:
//!
//! | Class | Representation | Examples |
//! |-------|----------------|----------|
//! | Expected outcome | `ReclaimRequest { success: false, failure }` | free tree exhausted, digest mismatch |
//! | Precondition / protocol violation | `Fault` (this crate) | pool exhausted, sub-request misuse, bad rekey cursor |
//!
//! A `Fault` means the caller or the engine's own state has diverged from a
//! provably-safe condition; it is unrecoverable by design and must never be
//! conflated with a request that merely failed to find free blocks. The
//! enclosing store decides whether a `Fault` terminates the process.

use thiserror::Error;

/// Unrecoverable engine fault.
///
/// Every variant is an unconditional abort: a precondition or protocol
/// contract was broken. None of them are retryable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Fault {
    /// `submit` was called with every channel occupied. Callers must poll
    /// `ready_to_submit()` first.
    #[error("channel pool exhausted")]
    PoolExhausted,

    /// A request was submitted with `needed == 0`.
    #[error("request reclaims zero blocks")]
    EmptyRequest,

    /// The retire array length does not match `needed`.
    #[error("retire array length {retire} does not match needed {needed}")]
    RetireMismatch { retire: usize, needed: usize },

    /// `needed` exceeds the bounded retained-leaf queue.
    #[error("needed {needed} exceeds retain capacity {capacity}")]
    RetainCapacity { needed: usize, capacity: usize },

    /// Tree shape parameters are structurally invalid.
    #[error("invalid tree shape: {0}")]
    Shape(String),

    /// The request is internally incoherent (invalid root pointer, rekeying
    /// allocation kind with rekeying inactive).
    #[error("malformed request: {0}")]
    Request(String),

    /// Engine configuration is unusable.
    #[error("invalid engine config: {0}")]
    Config(String),

    /// A channel id is out of range or its slot is in the wrong state for
    /// the requested operation.
    #[error("channel {channel} in unexpected state: {detail}")]
    ChannelState { channel: usize, detail: String },

    /// The dual peek/drop sub-request protocol was violated (completing a
    /// sub-request that was never accepted, responding with the wrong kind,
    /// dropping when nothing is pending).
    #[error("sub-request protocol violation on channel {channel}: {detail}")]
    SubRequestProtocol { channel: usize, detail: String },

    /// The rekeying cursor stands in a relation to a leaf's VBA range that
    /// matches neither defined `RekeyingOldGen` case.
    #[error(
        "rekey cursor {cursor} outside both defined relations for VBA range [{lo}, {range_end})"
    )]
    RekeyCursor { cursor: u64, lo: u64, range_end: u64 },

    /// A block image could not be decoded against the declared tree shape.
    #[error("malformed node block at pba {pba}: {detail}")]
    MalformedBlock { pba: u64, detail: String },

    /// Traversal state became internally inconsistent (empty stack where a
    /// node was expected, write phase entered with nothing pending).
    #[error("traversal invariant violated: {0}")]
    Traversal(String),

    /// Arithmetic on tree geometry overflowed.
    #[error("tree geometry overflow: {0}")]
    Overflow(&'static str),
}

/// Result alias using `Fault`.
pub type Result<T> = std::result::Result<T, Fault>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_formatting() {
        assert_eq!(Fault::PoolExhausted.to_string(), "channel pool exhausted");
        assert_eq!(
            Fault::RetainCapacity {
                needed: 9,
                capacity: 4
            }
            .to_string(),
            "needed 9 exceeds retain capacity 4"
        );
        let cursor = Fault::RekeyCursor {
            cursor: 17,
            lo: 8,
            range_end: 16,
        };
        assert!(cursor.to_string().contains("cursor 17"));
        assert!(cursor.to_string().contains("[8, 16)"));
    }

    #[test]
    fn faults_are_comparable() {
        // Tests match on fault variants; equality must hold for identical payloads.
        assert_eq!(Fault::PoolExhausted, Fault::PoolExhausted);
        assert_ne!(
            Fault::EmptyRequest,
            Fault::Overflow("coverage exceeds u64")
        );
    }
}
