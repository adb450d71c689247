//! Reclamation requests and the value types they carry.

use serde::{Deserialize, Serialize};
use veil_error::{Fault, Result};
use veil_types::{Digest, Generation, KeyId, Pba, Vba};

use crate::codec::{INNER_ENTRY_SIZE, LEAF_RECORD_SIZE};

/// How the replacement blocks will be used by the caller.
///
/// The kinds are mutually exclusive and change how exchanged leaf records
/// are stamped (reserved flag, key id, last-owning VBA).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocKind {
    /// Ordinary copy-on-write allocation.
    NonRekeying,
    /// Allocation while re-encrypting a block written in the current
    /// generation.
    RekeyingCurrentGen,
    /// Allocation while re-encrypting a block from a prior generation.
    RekeyingOldGen,
}

/// Persisted pointer to a tree node: address, generation it was written in,
/// and the digest of its block image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub pba: Pba,
    pub gen: Generation,
    pub digest: Digest,
}

impl NodeRef {
    /// A zeroed reference, used for not-yet-produced outputs.
    pub const ZERO: Self = Self {
        pba: Pba::NULL,
        gen: Generation::ZERO,
        digest: Digest::ZERO,
    };
}

/// Shape of one authenticated tree.
///
/// Level 0 holds leaf blocks of `leaf_slots` accounting records; levels
/// `1..=max_level` hold inner blocks of `degree` child entries. A node at
/// level `l` covers `degree^l` leaf blocks. Each leaf record's tree
/// position covers `slot_span` consecutive VBAs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeShape {
    pub max_level: u32,
    pub degree: u32,
    pub leaf_slots: u32,
    pub slot_span: u64,
    pub block_size: u32,
}

impl TreeShape {
    /// Validate the shape against the node codec's layout requirements.
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Fault::Shape(format!(
                "block_size={} must be a power of two",
                self.block_size
            )));
        }
        if self.leaf_slots == 0 {
            return Err(Fault::Shape("leaf_slots must be > 0".to_owned()));
        }
        if self.slot_span == 0 {
            return Err(Fault::Shape("slot_span must be > 0".to_owned()));
        }
        if self.max_level > 0 && self.degree < 2 {
            return Err(Fault::Shape(format!(
                "degree={} must be >= 2 for max_level={}",
                self.degree, self.max_level
            )));
        }
        let leaf_bytes = (self.leaf_slots as usize).saturating_mul(LEAF_RECORD_SIZE);
        if leaf_bytes > self.block_size as usize {
            return Err(Fault::Shape(format!(
                "leaf_slots={} does not fit block_size={}",
                self.leaf_slots, self.block_size
            )));
        }
        let inner_bytes = (self.degree as usize).saturating_mul(INNER_ENTRY_SIZE);
        if self.max_level > 0 && inner_bytes > self.block_size as usize {
            return Err(Fault::Shape(format!(
                "degree={} does not fit block_size={}",
                self.degree, self.block_size
            )));
        }
        // The whole tree's coverage must be computable.
        let _ = self.coverage(self.max_level)?;
        Ok(())
    }

    /// Number of leaf blocks covered by one node at `level` (`degree^level`).
    pub(crate) fn coverage(&self, level: u32) -> Result<u64> {
        u64::from(self.degree)
            .checked_pow(level)
            .ok_or(Fault::Overflow("tree coverage exceeds u64"))
    }
}

/// State of an in-progress encryption-key rotation.
///
/// The rotation is advanced by a moving VBA cursor; `highest` is the top of
/// the virtual address space being rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RekeyState {
    pub active: bool,
    pub prev_key: KeyId,
    pub current_key: KeyId,
    pub cursor: Vba,
    pub highest: Vba,
}

impl RekeyState {
    /// State with no rotation in progress; key ids collapse to `current`.
    #[must_use]
    pub fn inactive(current: KeyId) -> Self {
        Self {
            active: false,
            prev_key: current,
            current_key: current,
            cursor: Vba(0),
            highest: Vba(0),
        }
    }
}

/// One block the caller is retiring in exchange for a reclaimed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiredBlock {
    pub pba: Pba,
    pub gen: Generation,
}

/// Why a request completed with `success = false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The whole free tree was scanned before the quota was met. No partial
    /// allocation is returned.
    NotEnoughFreeBlocks,
    /// A node's on-disk content failed digest verification; the caller
    /// should treat the tree as corrupt.
    TreeHashMismatch,
}

/// A sub-request the engine generates for an external collaborator.
///
/// Exposed through [`peek_generated`](crate::ReclaimEngine::peek_generated);
/// at most one cache op and one relocation is outstanding per channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubOp {
    /// Read one block from the cache/storage layer.
    CacheRead { pba: Pba },
    /// Persist one block image through the cache/storage layer.
    CacheWrite { pba: Pba, bytes: Vec<u8> },
    /// Relocate a non-volatile metadata block: the metadata allocator
    /// returns a fresh physical address under its own COW discipline.
    Relocate {
        target: Pba,
        meta_root: NodeRef,
        meta_shape: TreeShape,
        current_gen: Generation,
    },
}

/// One reclamation transaction.
///
/// Immutable once submitted, except for the output fields (`output`,
/// `output_root`, `success`, `failure`) which the engine fills before the
/// request becomes retrievable again.
#[derive(Debug, Clone)]
pub struct ReclaimRequest {
    pub kind: AllocKind,
    /// Root of the free tree to reclaim from.
    pub free_root: NodeRef,
    pub free_shape: TreeShape,
    /// Root of the metadata tree backing node relocation.
    pub meta_root: NodeRef,
    pub meta_shape: TreeShape,
    /// The caller's current generation.
    pub current_gen: Generation,
    /// Free generation stamped on every reclaimed record.
    pub free_gen: Generation,
    /// Number of blocks to reclaim; always equals `retire.len()`.
    pub needed: usize,
    /// Blocks being retired, one per reclaimed block.
    pub retire: Vec<RetiredBlock>,
    pub rekey: RekeyState,
    /// Replacement physical addresses, in retire order. Empty on failure.
    pub output: Vec<Pba>,
    /// The rewritten free-tree root. `NodeRef::ZERO` on failure.
    pub output_root: NodeRef,
    pub success: bool,
    pub failure: Option<FailureKind>,
}

impl ReclaimRequest {
    /// Build a request; `needed` is derived from `retire`.
    #[expect(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        kind: AllocKind,
        free_root: NodeRef,
        free_shape: TreeShape,
        meta_root: NodeRef,
        meta_shape: TreeShape,
        current_gen: Generation,
        free_gen: Generation,
        retire: Vec<RetiredBlock>,
        rekey: RekeyState,
    ) -> Self {
        let needed = retire.len();
        Self {
            kind,
            free_root,
            free_shape,
            meta_root,
            meta_shape,
            current_gen,
            free_gen,
            needed,
            retire,
            rekey,
            output: Vec::new(),
            output_root: NodeRef::ZERO,
            success: false,
            failure: None,
        }
    }

    /// Submit-time validation: faults here are caller errors.
    pub fn validate(&self) -> Result<()> {
        if self.needed == 0 {
            return Err(Fault::EmptyRequest);
        }
        if self.retire.len() != self.needed {
            return Err(Fault::RetireMismatch {
                retire: self.retire.len(),
                needed: self.needed,
            });
        }
        self.free_shape.validate()?;
        self.meta_shape.validate()?;
        if !self.free_root.pba.is_valid() {
            return Err(Fault::Request(format!(
                "free root pba {} is not addressable",
                self.free_root.pba
            )));
        }
        if self.kind != AllocKind::NonRekeying && !self.rekey.active {
            return Err(Fault::Request(
                "rekeying allocation kind with rekeying inactive".to_owned(),
            ));
        }
        for retired in &self.retire {
            if !retired.pba.is_valid() {
                return Err(Fault::Request(format!(
                    "retired pba {} is not addressable",
                    retired.pba
                )));
            }
        }
        Ok(())
    }

    /// Whether `gen` counts as volatile for this request: written in the
    /// current generation (or never written), hence overwritable in place.
    #[must_use]
    pub fn is_volatile(&self, gen: Generation) -> bool {
        gen == Generation::ZERO || gen == self.current_gen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> TreeShape {
        TreeShape {
            max_level: 2,
            degree: 4,
            leaf_slots: 8,
            slot_span: 1,
            block_size: 4096,
        }
    }

    fn request(retire: Vec<RetiredBlock>) -> ReclaimRequest {
        let root = NodeRef {
            pba: Pba(10),
            gen: Generation(3),
            digest: Digest::ZERO,
        };
        ReclaimRequest::new(
            AllocKind::NonRekeying,
            root,
            shape(),
            root,
            shape(),
            Generation(7),
            Generation(7),
            retire,
            RekeyState::inactive(KeyId(1)),
        )
    }

    #[test]
    fn shape_validation() {
        assert!(shape().validate().is_ok());

        let mut bad = shape();
        bad.block_size = 3000;
        assert!(matches!(bad.validate(), Err(Fault::Shape(_))));

        let mut bad = shape();
        bad.leaf_slots = 0;
        assert!(bad.validate().is_err());

        let mut bad = shape();
        bad.degree = 1;
        assert!(bad.validate().is_err());

        // degree 1 is fine for a tree that has no inner levels
        let mut flat = shape();
        flat.max_level = 0;
        flat.degree = 1;
        assert!(flat.validate().is_ok());

        // 128 slots * 40 bytes > 4096
        let mut bad = shape();
        bad.leaf_slots = 128;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn coverage_is_degree_to_the_level() {
        let s = shape();
        assert_eq!(s.coverage(0).unwrap(), 1);
        assert_eq!(s.coverage(1).unwrap(), 4);
        assert_eq!(s.coverage(2).unwrap(), 16);
    }

    #[test]
    fn request_validation() {
        let retired = RetiredBlock {
            pba: Pba(99),
            gen: Generation(6),
        };
        assert!(request(vec![retired]).validate().is_ok());

        assert!(matches!(
            request(Vec::new()).validate(),
            Err(Fault::EmptyRequest)
        ));

        let mut mismatch = request(vec![retired]);
        mismatch.needed = 2;
        assert!(matches!(
            mismatch.validate(),
            Err(Fault::RetireMismatch { .. })
        ));

        let mut bad_root = request(vec![retired]);
        bad_root.free_root.pba = Pba::NULL;
        assert!(matches!(bad_root.validate(), Err(Fault::Request(_))));

        let mut bad_kind = request(vec![retired]);
        bad_kind.kind = AllocKind::RekeyingOldGen;
        assert!(matches!(bad_kind.validate(), Err(Fault::Request(_))));

        let mut bad_retire = request(vec![RetiredBlock {
            pba: Pba::INVALID,
            gen: Generation(6),
        }]);
        bad_retire.needed = 1;
        assert!(matches!(bad_retire.validate(), Err(Fault::Request(_))));
    }

    #[test]
    fn volatility_tracks_current_generation() {
        let req = request(vec![RetiredBlock {
            pba: Pba(99),
            gen: Generation(6),
        }]);
        assert!(req.is_volatile(Generation::ZERO));
        assert!(req.is_volatile(Generation(7)));
        assert!(!req.is_volatile(Generation(6)));
        assert!(!req.is_volatile(Generation(8)));
    }
}
