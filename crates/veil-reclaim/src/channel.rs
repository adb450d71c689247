//! Per-request execution context.
//!
//! A channel is one slot of the engine's fixed pool. It owns the installed
//! request, the per-level traversal stacks, the bounded retained-leaf
//! queue, the per-level block images of the update phase, and the (at most
//! one each) outstanding cache and metadata sub-requests.

use std::collections::VecDeque;

use tracing::{debug, trace, warn};
use veil_error::{Fault, Result};
use veil_types::{Pba, SnapshotView};

use crate::descriptor::{LeafDesc, NodeDesc, VisitState};
use crate::request::{FailureKind, NodeRef, ReclaimRequest, SubOp};

/// Channel lifecycle.
///
/// `Invalid` and `Complete` are the only externally observable states; the
/// rest are internal progress. The two failure states exist for exactly one
/// tick before collapsing into `Complete` with the request's success flag
/// cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Invalid,
    Scanning,
    ScanComplete,
    Updating,
    UpdateComplete,
    NotEnoughFreeBlocks,
    TreeHashMismatch,
    Complete,
}

/// One generated sub-request; `accepted` flips when the external driver
/// claims it via `drop_generated`.
#[derive(Debug, Clone)]
pub(crate) struct SubSlot {
    pub op: SubOp,
    pub accepted: bool,
}

#[derive(Debug)]
pub(crate) struct Channel {
    pub id: usize,
    pub state: ChannelState,
    pub req: Option<ReclaimRequest>,
    /// Traversal stacks indexed by level; level 0 points at leaf blocks.
    pub stacks: Vec<Vec<NodeDesc>>,
    /// Leaf descriptors decoded from the block under scan, pre-retention.
    pub staged: Vec<LeafDesc>,
    /// Reclaimable descriptors kept for the update phase; bounded.
    pub retained: VecDeque<LeafDesc>,
    pub retain_capacity: usize,
    /// Descriptors chosen for exchange, in tree order.
    pub targets: VecDeque<LeafDesc>,
    pub found: usize,
    pub exchanged: usize,
    pub cache_sub: Option<SubSlot>,
    pub meta_sub: Option<SubSlot>,
    /// Bytes delivered by the last cache read, pending verification.
    pub read_buf: Option<Vec<u8>>,
    /// Update-phase block image per level; the path is held exclusively,
    /// so one image per level suffices.
    pub buffers: Vec<Option<Vec<u8>>>,
}

impl Channel {
    pub(crate) fn new(id: usize, retain_capacity: usize) -> Self {
        Self {
            id,
            state: ChannelState::Invalid,
            req: None,
            stacks: Vec::new(),
            staged: Vec::new(),
            retained: VecDeque::new(),
            retain_capacity,
            targets: VecDeque::new(),
            found: 0,
            exchanged: 0,
            cache_sub: None,
            meta_sub: None,
            read_buf: None,
            buffers: Vec::new(),
        }
    }

    /// Install a validated request and seed the scan with the free root.
    pub(crate) fn install(&mut self, req: ReclaimRequest) -> Result<()> {
        if self.state != ChannelState::Invalid {
            return Err(Fault::ChannelState {
                channel: self.id,
                detail: "install on an occupied channel".to_owned(),
            });
        }
        self.clear_traversal();
        self.found = 0;
        self.exchanged = 0;

        let shape = req.free_shape;
        let levels = shape.max_level as usize + 1;
        self.stacks = (0..levels)
            .map(|_| Vec::with_capacity(shape.degree as usize))
            .collect();
        self.buffers = vec![None; levels];
        self.stacks[shape.max_level as usize].push(NodeDesc {
            node: req.free_root,
            index_in_parent: 0,
            base: 0,
            volatile: req.is_volatile(req.free_root.gen),
            visit: VisitState::Unread,
        });
        self.req = Some(req);
        self.state = ChannelState::Scanning;
        Ok(())
    }

    pub(crate) fn has_outstanding(&self) -> bool {
        self.cache_sub.is_some() || self.meta_sub.is_some()
    }

    /// Advance exactly one unit of work.
    pub(crate) fn tick(&mut self, view: &SnapshotView<'_>) -> Result<()> {
        match self.state {
            ChannelState::Scanning => self.scan_tick(view),
            ChannelState::ScanComplete => self.begin_update(),
            ChannelState::Updating => self.update_tick(),
            ChannelState::UpdateComplete => self.finish_success(),
            ChannelState::NotEnoughFreeBlocks => {
                self.finish_failure(FailureKind::NotEnoughFreeBlocks)
            }
            ChannelState::TreeHashMismatch => self.finish_failure(FailureKind::TreeHashMismatch),
            ChannelState::Invalid | ChannelState::Complete => Err(Fault::ChannelState {
                channel: self.id,
                detail: format!("tick in terminal state {:?}", self.state),
            }),
        }
    }

    pub(crate) fn request(&self) -> Result<&ReclaimRequest> {
        self.req.as_ref().ok_or_else(|| Fault::ChannelState {
            channel: self.id,
            detail: "no installed request".to_owned(),
        })
    }

    pub(crate) fn request_mut(&mut self) -> Result<&mut ReclaimRequest> {
        let id = self.id;
        self.req.as_mut().ok_or_else(|| Fault::ChannelState {
            channel: id,
            detail: "no installed request".to_owned(),
        })
    }

    /// Deepest level with a node still on its stack, if any.
    pub(crate) fn deepest(&self) -> Option<usize> {
        (0..self.stacks.len()).find(|&level| !self.stacks[level].is_empty())
    }

    /// The node the channel is currently working on: top of the deepest
    /// non-empty stack.
    pub(crate) fn current(&mut self) -> Result<(usize, &mut NodeDesc)> {
        let id = self.id;
        let Some(level) = self.deepest() else {
            return Err(Fault::Traversal(format!(
                "channel {id}: no node on any stack"
            )));
        };
        let Some(desc) = self.stacks[level].last_mut() else {
            return Err(Fault::Traversal(format!(
                "channel {id}: empty stack at level {level}"
            )));
        };
        Ok((level, desc))
    }

    /// Issue the cache read for the node on top of `level`'s stack.
    pub(crate) fn issue_node_read(&mut self, level: usize) -> Result<()> {
        let id = self.id;
        let Some(desc) = self.stacks[level].last() else {
            return Err(Fault::Traversal(format!(
                "channel {id}: read issued with empty stack at level {level}"
            )));
        };
        let pba = desc.node.pba;
        trace!(channel = id, level, %pba, "reading node");
        self.issue_cache(SubOp::CacheRead { pba })
    }

    pub(crate) fn issue_cache(&mut self, op: SubOp) -> Result<()> {
        if self.cache_sub.is_some() {
            return Err(Fault::SubRequestProtocol {
                channel: self.id,
                detail: "cache sub-request already outstanding".to_owned(),
            });
        }
        self.cache_sub = Some(SubSlot {
            op,
            accepted: false,
        });
        Ok(())
    }

    pub(crate) fn issue_meta(&mut self, op: SubOp) -> Result<()> {
        if self.meta_sub.is_some() {
            return Err(Fault::SubRequestProtocol {
                channel: self.id,
                detail: "metadata sub-request already outstanding".to_owned(),
            });
        }
        self.meta_sub = Some(SubSlot {
            op,
            accepted: false,
        });
        Ok(())
    }

    // ── Sub-request completion ──────────────────────────────────────────────

    pub(crate) fn on_cache_read(&mut self, bytes: Vec<u8>) -> Result<()> {
        let expected = self.request()?.free_shape.block_size as usize;
        if bytes.len() != expected {
            return Err(Fault::SubRequestProtocol {
                channel: self.id,
                detail: format!("cache read returned {} bytes, expected {expected}", bytes.len()),
            });
        }
        let id = self.id;
        let (_, desc) = self.current()?;
        if desc.visit != VisitState::Unread {
            return Err(Fault::SubRequestProtocol {
                channel: id,
                detail: format!("read completed for node in state {:?}", desc.visit),
            });
        }
        desc.visit = VisitState::Available;
        self.read_buf = Some(bytes);
        Ok(())
    }

    pub(crate) fn on_cache_write(&mut self) -> Result<()> {
        let id = self.id;
        let (_, desc) = self.current()?;
        if desc.visit != VisitState::Write {
            return Err(Fault::SubRequestProtocol {
                channel: id,
                detail: format!("write completed for node in state {:?}", desc.visit),
            });
        }
        desc.visit = VisitState::Complete;
        Ok(())
    }

    pub(crate) fn on_relocate(&mut self, new_pba: Pba) -> Result<()> {
        let id = self.id;
        if !new_pba.is_valid() {
            return Err(Fault::SubRequestProtocol {
                channel: id,
                detail: format!("relocation returned non-addressable pba {new_pba}"),
            });
        }
        let (_, desc) = self.current()?;
        if desc.visit != VisitState::Write || desc.volatile {
            return Err(Fault::SubRequestProtocol {
                channel: id,
                detail: "relocation completed for a node that was not awaiting one".to_owned(),
            });
        }
        desc.node.pba = new_pba;
        // Relocated under the current generation: in-place from here on.
        desc.volatile = true;
        Ok(())
    }

    // ── Terminal transitions ────────────────────────────────────────────────

    pub(crate) fn fail(&mut self, state: ChannelState) {
        debug_assert!(matches!(
            state,
            ChannelState::NotEnoughFreeBlocks | ChannelState::TreeHashMismatch
        ));
        self.state = state;
    }

    fn finish_success(&mut self) -> Result<()> {
        let id = self.id;
        if let Some(req) = &self.req {
            debug_assert_eq!(self.exchanged, req.needed);
        }
        let req = self.request_mut()?;
        req.success = true;
        req.failure = None;
        self.clear_traversal();
        self.state = ChannelState::Complete;
        debug!(channel = id, "reclamation complete");
        Ok(())
    }

    fn finish_failure(&mut self, kind: FailureKind) -> Result<()> {
        let id = self.id;
        let req = self.request_mut()?;
        req.success = false;
        req.failure = Some(kind);
        // No partial allocation escapes a failed request.
        req.output.clear();
        req.output_root = NodeRef::ZERO;
        self.clear_traversal();
        self.state = ChannelState::Complete;
        warn!(channel = id, ?kind, "reclamation failed");
        Ok(())
    }

    /// Drain the installed request once the caller observed `Complete`.
    pub(crate) fn drain(&mut self) -> Result<ReclaimRequest> {
        if self.state != ChannelState::Complete {
            return Err(Fault::ChannelState {
                channel: self.id,
                detail: format!("drain in state {:?}", self.state),
            });
        }
        let req = self.req.take().ok_or_else(|| Fault::ChannelState {
            channel: self.id,
            detail: "complete channel without a request".to_owned(),
        })?;
        self.clear_traversal();
        self.state = ChannelState::Invalid;
        Ok(req)
    }

    pub(crate) fn clear_traversal(&mut self) {
        for stack in &mut self.stacks {
            stack.clear();
        }
        self.staged.clear();
        self.retained.clear();
        self.targets.clear();
        self.read_buf = None;
        for buffer in &mut self.buffers {
            *buffer = None;
        }
    }
}
