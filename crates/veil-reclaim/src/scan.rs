//! Scan phase: descend the free tree and collect reclaimable leaf records.
//!
//! The descent is deepest-first over the per-level stacks, so each stack
//! never holds more than one node's worth of children and leaf blocks are
//! visited in tree order. Every block read is verified against the digest
//! its parent recorded before anything is decoded from it.

use tracing::{debug, trace, warn};
use veil_error::{Fault, Result};
use veil_types::{Digest, Generation, Pba, SnapshotView};

use crate::channel::{Channel, ChannelState};
use crate::codec;
use crate::descriptor::{LeafDesc, NodeDesc, VisitState};
use crate::policy;

impl Channel {
    pub(crate) fn scan_tick(&mut self, view: &SnapshotView<'_>) -> Result<()> {
        let Some(level) = self.deepest() else {
            // Whole tree visited without meeting the quota.
            warn!(
                channel = self.id,
                found = self.found,
                "free tree exhausted before quota"
            );
            self.fail(ChannelState::NotEnoughFreeBlocks);
            return Ok(());
        };

        let Some(desc) = self.stacks[level].last() else {
            return Err(Fault::Traversal(format!(
                "channel {}: empty stack at level {level}",
                self.id
            )));
        };
        match desc.visit {
            VisitState::Unread => self.issue_node_read(level),
            VisitState::Available => self.scan_visit(level, view),
            state => Err(Fault::Traversal(format!(
                "channel {}: scan found node in state {state:?}",
                self.id
            ))),
        }
    }

    /// Verify, decode and consume the node on top of `level`'s stack.
    fn scan_visit(&mut self, level: usize, view: &SnapshotView<'_>) -> Result<()> {
        let id = self.id;
        let bytes = self.read_buf.take().ok_or_else(|| {
            Fault::Traversal(format!("channel {id}: node available without block bytes"))
        })?;
        let Some(desc) = self.stacks[level].pop() else {
            return Err(Fault::Traversal(format!(
                "channel {id}: empty stack at level {level}"
            )));
        };

        if Digest::of_block(&bytes) != desc.node.digest {
            warn!(channel = id, level, pba = %desc.node.pba, "node digest mismatch");
            self.fail(ChannelState::TreeHashMismatch);
            return Ok(());
        }

        let req = self.request()?;
        let shape = req.free_shape;
        let current_gen = req.current_gen;
        let rekey = req.rekey;
        let needed = req.needed;

        if level > 0 {
            // Inner node: push children in reverse so pops run in tree order.
            let child_cov = shape.coverage(level as u32 - 1)?;
            for idx in (0..shape.degree).rev() {
                let child = codec::inner_child(&bytes, desc.node.pba, idx)?;
                if child.pba == Pba::NULL {
                    continue;
                }
                if !child.pba.is_valid() {
                    return Err(Fault::MalformedBlock {
                        pba: desc.node.pba.0,
                        detail: format!("child {idx} points at the invalid sentinel"),
                    });
                }
                let base = u64::from(idx)
                    .checked_mul(child_cov)
                    .and_then(|offset| desc.base.checked_add(offset))
                    .ok_or(Fault::Overflow("child base exceeds u64"))?;
                self.stacks[level - 1].push(NodeDesc {
                    node: child,
                    index_in_parent: idx,
                    base,
                    volatile: child.gen == Generation::ZERO || child.gen == current_gen,
                    visit: VisitState::Unread,
                });
            }
            trace!(channel = id, level, pba = %desc.node.pba, "inner node expanded");
        } else {
            // Leaf block: stage eligible records, then retain them.
            for slot in 0..shape.leaf_slots {
                let record = codec::leaf_record(&bytes, desc.node.pba, slot)?;
                if policy::is_eligible(&record, &rekey, view) {
                    self.staged.push(LeafDesc {
                        record,
                        block_index: desc.base,
                        slot,
                    });
                }
            }
            for leaf in self.staged.drain(..) {
                if self.retained.len() < self.retain_capacity {
                    self.retained.push_back(leaf);
                    self.found += 1;
                }
            }
            trace!(
                channel = id,
                block = desc.base,
                found = self.found,
                "leaf block scanned"
            );
            if self.found >= needed {
                debug!(channel = id, found = self.found, needed, "scan quota met");
                self.state = ChannelState::ScanComplete;
            }
        }
        Ok(())
    }

    /// Discard scan state and re-seed the root for the update descent.
    pub(crate) fn begin_update(&mut self) -> Result<()> {
        let id = self.id;
        for stack in &mut self.stacks {
            stack.clear();
        }
        self.staged.clear();
        self.read_buf = None;
        for buffer in &mut self.buffers {
            *buffer = None;
        }

        let req = self.request()?;
        let needed = req.needed;
        let root = req.free_root;
        let volatile = req.is_volatile(root.gen);
        let top = req.free_shape.max_level as usize;

        if self.retained.len() < needed {
            return Err(Fault::Traversal(format!(
                "channel {id}: scan complete with {} retained, needed {needed}",
                self.retained.len()
            )));
        }
        self.targets = self.retained.drain(..).take(needed).collect();
        self.stacks[top].push(NodeDesc {
            node: root,
            index_in_parent: 0,
            base: 0,
            volatile,
            visit: VisitState::Unread,
        });
        self.state = ChannelState::Updating;
        debug!(channel = id, needed, "update phase started");
        Ok(())
    }
}
