//! Transient per-node views used by the traversal stacks.

use veil_error::{Fault, Result};
use veil_types::Vba;

use crate::codec::LeafRecord;
use crate::request::{NodeRef, TreeShape};

/// Progress of one node through a phase.
///
/// Scan uses `Unread -> Available -> Complete`; update additionally passes
/// through `Read` (children in flight) and `Write` (relocation/persist in
/// flight).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VisitState {
    /// Not yet fetched from the cache.
    Unread,
    /// Block bytes delivered, digest not yet verified.
    Available,
    /// Decoded; descendants still being processed.
    Read,
    /// Mutated image waiting on relocation and/or persist.
    Write,
    /// Fully processed; ready to be popped.
    Complete,
}

/// View of one tree node while it sits on a traversal stack.
#[derive(Debug, Clone)]
pub(crate) struct NodeDesc {
    /// Persisted form; `update` rewrites `pba`/`gen`/`digest` in place as
    /// the node is relocated and re-digested.
    pub node: NodeRef,
    /// Index of this node's entry within its parent block.
    pub index_in_parent: u32,
    /// Global index of the first leaf block covered by this node's subtree.
    pub base: u64,
    /// Written in the current generation (or never written); overwritable
    /// in place without relocation.
    pub volatile: bool,
    pub visit: VisitState,
}

/// View of one leaf accounting record selected during scan.
#[derive(Debug, Clone)]
pub(crate) struct LeafDesc {
    pub record: LeafRecord,
    /// Global index of the leaf block holding the record.
    pub block_index: u64,
    /// Record index within that leaf block.
    pub slot: u32,
}

impl LeafDesc {
    /// Lowest VBA covered by this record's tree position.
    pub(crate) fn lowest_vba(&self, shape: &TreeShape) -> Result<Vba> {
        let slot_index = self
            .block_index
            .checked_mul(u64::from(shape.leaf_slots))
            .and_then(|base| base.checked_add(u64::from(self.slot)))
            .ok_or(Fault::Overflow("leaf slot index exceeds u64"))?;
        slot_index
            .checked_mul(shape.slot_span)
            .map(Vba)
            .ok_or(Fault::Overflow("leaf VBA exceeds u64"))
    }
}
