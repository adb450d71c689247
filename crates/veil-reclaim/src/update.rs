//! Update phase: exchange the selected leaf records and rewrite the
//! modified tree path up to a freshly digested root.
//!
//! The descent re-reads and re-verifies every node on the way down (scan
//! state was discarded), follows only the paths that contain exchange
//! targets, and persists bottom-up: a node is written only after all of its
//! modified children are durable and its child entries are patched with
//! their new addresses and digests. Non-volatile nodes are relocated
//! through the metadata allocator before being written; the root is the
//! last block written in the whole transaction.

use tracing::{debug, trace, warn};
use veil_error::{Fault, Result};
use veil_types::{Digest, KeyId, Vba};

use crate::channel::{Channel, ChannelState};
use crate::codec::{self, LeafRecord};
use crate::descriptor::{NodeDesc, VisitState};
use crate::request::{AllocKind, RekeyState, SubOp};

impl Channel {
    pub(crate) fn update_tick(&mut self) -> Result<()> {
        let id = self.id;
        let Some(level) = self.deepest() else {
            return Err(Fault::Traversal(format!(
                "channel {id}: update phase with no node on any stack"
            )));
        };
        let Some(desc) = self.stacks[level].last() else {
            return Err(Fault::Traversal(format!(
                "channel {id}: empty stack at level {level}"
            )));
        };
        match desc.visit {
            VisitState::Unread => self.issue_node_read(level),
            VisitState::Available => self.update_receive(level),
            VisitState::Read => self.update_descend(level),
            VisitState::Write => self.update_persist(level),
            VisitState::Complete => self.update_pop(level),
        }
    }

    /// Verify the freshly read block and park its image for patching.
    fn update_receive(&mut self, level: usize) -> Result<()> {
        let id = self.id;
        let bytes = self.read_buf.take().ok_or_else(|| {
            Fault::Traversal(format!("channel {id}: node available without block bytes"))
        })?;
        let (expected, pba) = {
            let Some(desc) = self.stacks[level].last() else {
                return Err(Fault::Traversal(format!(
                    "channel {id}: empty stack at level {level}"
                )));
            };
            (desc.node.digest, desc.node.pba)
        };
        if Digest::of_block(&bytes) != expected {
            warn!(channel = id, level, %pba, "node digest mismatch");
            self.fail(ChannelState::TreeHashMismatch);
            return Ok(());
        }
        self.buffers[level] = Some(bytes);
        if level == 0 {
            self.exchange_block()
        } else {
            let Some(desc) = self.stacks[level].last_mut() else {
                return Err(Fault::Traversal(format!(
                    "channel {id}: empty stack at level {level}"
                )));
            };
            desc.visit = VisitState::Read;
            Ok(())
        }
    }

    /// Exchange every target record housed in the leaf block under the
    /// cursor, then mark the block for persisting.
    fn exchange_block(&mut self) -> Result<()> {
        let id = self.id;
        let (shape, kind, rekey, free_gen, needed) = {
            let req = self.request()?;
            (
                req.free_shape,
                req.kind,
                req.rekey,
                req.free_gen,
                req.needed,
            )
        };
        let (base, block_pba) = {
            let Some(desc) = self.stacks[0].last() else {
                return Err(Fault::Traversal(format!(
                    "channel {id}: leaf exchange with empty stack"
                )));
            };
            (desc.base, desc.node.pba)
        };
        let mut image = self.buffers[0].take().ok_or_else(|| {
            Fault::Traversal(format!("channel {id}: leaf exchange without block image"))
        })?;

        while self.exchanged < needed {
            let Some(front) = self.targets.front() else {
                break;
            };
            if front.block_index != base {
                break;
            }
            let Some(leaf) = self.targets.pop_front() else {
                break;
            };

            let record = codec::leaf_record(&image, block_pba, leaf.slot)?;
            let retiring = self.request()?.retire[self.exchanged];
            let lo = leaf.lowest_vba(&shape)?;
            let (reserved, key_id, last_vba) = stamp(kind, &rekey, lo, shape.slot_span)?;
            codec::set_leaf_record(
                &mut image,
                block_pba,
                leaf.slot,
                &LeafRecord {
                    pba: retiring.pba,
                    alloc_gen: retiring.gen,
                    free_gen,
                    last_vba,
                    key_id,
                    reserved,
                },
            )?;
            // The record's prior address is the caller's replacement block.
            self.request_mut()?.output.push(record.pba);
            self.exchanged += 1;
            trace!(
                channel = id,
                slot = leaf.slot,
                freed = %record.pba,
                retired = %retiring.pba,
                "leaf exchanged"
            );
        }

        self.buffers[0] = Some(image);
        let Some(desc) = self.stacks[0].last_mut() else {
            return Err(Fault::Traversal(format!(
                "channel {id}: leaf exchange with empty stack"
            )));
        };
        desc.visit = VisitState::Write;
        Ok(())
    }

    /// Push the next target-bearing child, or mark the node for persisting
    /// once its subtree holds no more targets.
    fn update_descend(&mut self, level: usize) -> Result<()> {
        let id = self.id;
        let shape = self.request()?.free_shape;
        let (base, node_pba) = {
            let Some(desc) = self.stacks[level].last() else {
                return Err(Fault::Traversal(format!(
                    "channel {id}: empty stack at level {level}"
                )));
            };
            (desc.base, desc.node.pba)
        };

        let cov = shape.coverage(level as u32)?;
        let end = base
            .checked_add(cov)
            .ok_or(Fault::Overflow("subtree coverage exceeds u64"))?;
        let next_target = self
            .targets
            .front()
            .filter(|target| target.block_index >= base && target.block_index < end)
            .map(|target| target.block_index);

        let Some(target_block) = next_target else {
            let Some(desc) = self.stacks[level].last_mut() else {
                return Err(Fault::Traversal(format!(
                    "channel {id}: empty stack at level {level}"
                )));
            };
            desc.visit = VisitState::Write;
            return Ok(());
        };

        let child_cov = shape.coverage(level as u32 - 1)?;
        let idx = u32::try_from((target_block - base) / child_cov)
            .map_err(|_| Fault::Overflow("child index exceeds u32"))?;
        let image = self.buffers[level].as_ref().ok_or_else(|| {
            Fault::Traversal(format!("channel {id}: descend without block image"))
        })?;
        let child = codec::inner_child(image, node_pba, idx)?;
        if !child.pba.is_valid() {
            return Err(Fault::Traversal(format!(
                "channel {id}: update path hit vacant child {idx} at level {level}"
            )));
        }
        let child_base = u64::from(idx)
            .checked_mul(child_cov)
            .and_then(|offset| base.checked_add(offset))
            .ok_or(Fault::Overflow("child base exceeds u64"))?;
        let volatile = self.request()?.is_volatile(child.gen);
        self.stacks[level - 1].push(NodeDesc {
            node: child,
            index_in_parent: idx,
            base: child_base,
            volatile,
            visit: VisitState::Unread,
        });
        trace!(channel = id, level, child = idx, "descending into child");
        Ok(())
    }

    /// Relocate (if non-volatile) and write the patched node image.
    fn update_persist(&mut self, level: usize) -> Result<()> {
        let id = self.id;
        let (meta_root, meta_shape, current_gen) = {
            let req = self.request()?;
            (req.meta_root, req.meta_shape, req.current_gen)
        };
        let (volatile, pba) = {
            let Some(desc) = self.stacks[level].last() else {
                return Err(Fault::Traversal(format!(
                    "channel {id}: empty stack at level {level}"
                )));
            };
            (desc.volatile, desc.node.pba)
        };

        if !volatile {
            trace!(channel = id, level, target = %pba, "relocating non-volatile node");
            return self.issue_meta(SubOp::Relocate {
                target: pba,
                meta_root,
                meta_shape,
                current_gen,
            });
        }

        let bytes = self.buffers[level].take().ok_or_else(|| {
            Fault::Traversal(format!("channel {id}: persist without block image"))
        })?;
        let digest = Digest::of_block(&bytes);
        let Some(desc) = self.stacks[level].last_mut() else {
            return Err(Fault::Traversal(format!(
                "channel {id}: empty stack at level {level}"
            )));
        };
        desc.node.digest = digest;
        desc.node.gen = current_gen;
        let pba = desc.node.pba;
        trace!(channel = id, level, %pba, "writing node");
        self.issue_cache(SubOp::CacheWrite { pba, bytes })
    }

    /// Retire a durable node: patch its parent's entry, or finish the
    /// request if it was the root.
    fn update_pop(&mut self, level: usize) -> Result<()> {
        let id = self.id;
        let Some(desc) = self.stacks[level].pop() else {
            return Err(Fault::Traversal(format!(
                "channel {id}: empty stack at level {level}"
            )));
        };
        self.buffers[level] = None;

        let (max_level, needed) = {
            let req = self.request()?;
            (req.free_shape.max_level as usize, req.needed)
        };
        if level == max_level {
            if self.exchanged != needed {
                return Err(Fault::Traversal(format!(
                    "channel {id}: root rewritten with {} of {needed} exchanges",
                    self.exchanged
                )));
            }
            let root = desc.node;
            self.request_mut()?.output_root = root;
            self.state = ChannelState::UpdateComplete;
            debug!(channel = id, root = %root.pba, "free tree root rewritten");
            return Ok(());
        }

        let Some(parent) = self.stacks[level + 1].last() else {
            return Err(Fault::Traversal(format!(
                "channel {id}: completed node at level {level} has no parent"
            )));
        };
        let parent_pba = parent.node.pba;
        let image = self.buffers[level + 1].as_mut().ok_or_else(|| {
            Fault::Traversal(format!("channel {id}: parent image missing during propagation"))
        })?;
        codec::set_inner_child(image, parent_pba, desc.index_in_parent, &desc.node)?;
        Ok(())
    }
}

/// Reserved flag, key id and last-owning VBA for an exchanged record, per
/// allocation kind.
///
/// `lo` is the lowest VBA of the record's tree position; `slot_span` the
/// width of its VBA range.
fn stamp(
    kind: AllocKind,
    rekey: &RekeyState,
    lo: Vba,
    slot_span: u64,
) -> Result<(bool, KeyId, Vba)> {
    match kind {
        AllocKind::NonRekeying => {
            let key = if !rekey.active || lo >= rekey.cursor {
                rekey.current_key
            } else {
                rekey.prev_key
            };
            Ok((true, key, lo))
        }
        AllocKind::RekeyingCurrentGen => Ok((false, rekey.prev_key, lo)),
        AllocKind::RekeyingOldGen => {
            let range_end = lo
                .0
                .checked_add(slot_span)
                .ok_or(Fault::Overflow("VBA range end exceeds u64"))?;
            let cursor = rekey.cursor.0;
            if cursor < range_end && cursor < rekey.highest.0 {
                // Rotation still inside the range: the tail keeps the old key.
                Ok((true, rekey.prev_key, Vba(cursor + 1)))
            } else if cursor == range_end || cursor == rekey.highest.0 {
                // Rotation exactly at a boundary: the range is fully rotated.
                Ok((true, rekey.current_key, lo))
            } else {
                Err(Fault::RekeyCursor {
                    cursor,
                    lo: lo.0,
                    range_end,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rekey(cursor: u64, highest: u64) -> RekeyState {
        RekeyState {
            active: true,
            prev_key: KeyId(1),
            current_key: KeyId(2),
            cursor: Vba(cursor),
            highest: Vba(highest),
        }
    }

    #[test]
    fn non_rekeying_stamps_reserved_with_split_keys() {
        // Inactive rotation: always the current key.
        let inactive = RekeyState::inactive(KeyId(5));
        assert_eq!(
            stamp(AllocKind::NonRekeying, &inactive, Vba(7), 1).unwrap(),
            (true, KeyId(5), Vba(7))
        );

        // Active rotation: current key at/after the cursor, previous below.
        let state = rekey(40, 1000);
        assert_eq!(
            stamp(AllocKind::NonRekeying, &state, Vba(40), 1).unwrap(),
            (true, KeyId(2), Vba(40))
        );
        assert_eq!(
            stamp(AllocKind::NonRekeying, &state, Vba(39), 1).unwrap(),
            (true, KeyId(1), Vba(39))
        );
    }

    #[test]
    fn rekeying_current_gen_releases_the_reservation() {
        let state = rekey(40, 1000);
        assert_eq!(
            stamp(AllocKind::RekeyingCurrentGen, &state, Vba(64), 4).unwrap(),
            (false, KeyId(1), Vba(64))
        );
    }

    #[test]
    fn rekeying_old_gen_mid_range_keeps_previous_key() {
        // Range [64, 72), cursor 66: tail [67, 72) still under the old key.
        let state = rekey(66, 1000);
        assert_eq!(
            stamp(AllocKind::RekeyingOldGen, &state, Vba(64), 8).unwrap(),
            (true, KeyId(1), Vba(67))
        );
    }

    #[test]
    fn rekeying_old_gen_boundary_takes_current_key() {
        // Cursor exactly at the range end.
        let state = rekey(72, 1000);
        assert_eq!(
            stamp(AllocKind::RekeyingOldGen, &state, Vba(64), 8).unwrap(),
            (true, KeyId(2), Vba(64))
        );
        // Cursor at the highest VBA.
        let state = rekey(1000, 1000);
        assert_eq!(
            stamp(AllocKind::RekeyingOldGen, &state, Vba(64), 8).unwrap(),
            (true, KeyId(2), Vba(64))
        );
    }

    #[test]
    fn rekeying_old_gen_rejects_any_third_relation() {
        // Cursor beyond both the range end and the highest VBA.
        let state = rekey(90, 80);
        let err = stamp(AllocKind::RekeyingOldGen, &state, Vba(64), 8).unwrap_err();
        assert!(matches!(
            err,
            Fault::RekeyCursor {
                cursor: 90,
                lo: 64,
                range_end: 72
            }
        ));
    }
}
