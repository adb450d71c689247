//! The reclamation engine: channel pool and the caller/collaborator
//! protocols.
//!
//! The pool is the only process-wide mutable state, an explicit owned
//! array of slots indexed by small integer id. Both the generated
//! sub-request queue and the completed-request queue are realized as
//! scan-and-claim over that array, which keeps "at most one outstanding"
//! an assertable per-slot invariant instead of a queue discipline.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;
use veil_error::{Fault, Result};
use veil_types::{Pba, SnapshotView};

use crate::channel::{Channel, ChannelState, SubSlot};
use crate::request::{ReclaimRequest, SubOp};

/// Index of a channel slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub usize);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrently executing requests.
    pub channels: usize,
    /// Bound of the per-channel retained-leaf queue. `submit` rejects
    /// requests needing more blocks than this.
    pub retain_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channels: 4,
            retain_capacity: 64,
        }
    }
}

/// A sub-request exposed to the external cache / metadata-allocator driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedRequest {
    pub channel: ChannelId,
    pub op: SubOp,
}

/// Collaborator result for a previously accepted sub-request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubResponse {
    CacheRead { bytes: Vec<u8> },
    CacheWrite,
    Relocate { new_pba: Pba },
}

/// Free-space reclamation engine. See the crate docs for the drive loop.
#[derive(Debug)]
pub struct ReclaimEngine {
    config: EngineConfig,
    channels: Vec<Channel>,
}

impl ReclaimEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        if config.channels == 0 {
            return Err(Fault::Config("channel pool must have at least one slot".to_owned()));
        }
        if config.retain_capacity == 0 {
            return Err(Fault::Config("retain_capacity must be > 0".to_owned()));
        }
        let channels = (0..config.channels)
            .map(|id| Channel::new(id, config.retain_capacity))
            .collect();
        Ok(Self { config, channels })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether a free channel slot exists. Callers must check this before
    /// `submit`; submitting into a full pool is a fault, not backpressure.
    #[must_use]
    pub fn ready_to_submit(&self) -> bool {
        self.channels
            .iter()
            .any(|chan| chan.state == ChannelState::Invalid)
    }

    /// Install a request into the first free channel and start its scan.
    pub fn submit(&mut self, req: ReclaimRequest) -> Result<ChannelId> {
        let Some(slot) = self
            .channels
            .iter()
            .position(|chan| chan.state == ChannelState::Invalid)
        else {
            return Err(Fault::PoolExhausted);
        };
        req.validate()?;
        if req.needed > self.config.retain_capacity {
            return Err(Fault::RetainCapacity {
                needed: req.needed,
                capacity: self.config.retain_capacity,
            });
        }
        debug!(
            channel = slot,
            needed = req.needed,
            kind = ?req.kind,
            root = %req.free_root.pba,
            "request submitted"
        );
        self.channels[slot].install(req)?;
        Ok(ChannelId(slot))
    }

    /// Advance every runnable channel by exactly one unit of work.
    ///
    /// Channels with an outstanding sub-request are suspended until the
    /// collaborator delivers via [`generated_request_complete`].
    ///
    /// [`generated_request_complete`]: Self::generated_request_complete
    pub fn execute(&mut self, view: &SnapshotView<'_>) -> Result<()> {
        for chan in &mut self.channels {
            if matches!(chan.state, ChannelState::Invalid | ChannelState::Complete) {
                continue;
            }
            if chan.has_outstanding() {
                continue;
            }
            chan.tick(view)?;
        }
        Ok(())
    }

    // ── Collaborator-facing protocol ────────────────────────────────────────

    /// Next generated sub-request not yet claimed by the driver, if any.
    #[must_use]
    pub fn peek_generated(&self) -> Option<GeneratedRequest> {
        for chan in &self.channels {
            for slot in [&chan.cache_sub, &chan.meta_sub].into_iter().flatten() {
                if !slot.accepted {
                    return Some(GeneratedRequest {
                        channel: ChannelId(chan.id),
                        op: slot.op.clone(),
                    });
                }
            }
        }
        None
    }

    /// Mark the peeked sub-request of `id` as in-progress.
    pub fn drop_generated(&mut self, id: ChannelId) -> Result<()> {
        let chan = self.channel_mut(id)?;
        let unaccepted = [&mut chan.cache_sub, &mut chan.meta_sub]
            .into_iter()
            .flatten()
            .find(|slot| !slot.accepted);
        match unaccepted {
            Some(slot) => {
                slot.accepted = true;
                Ok(())
            }
            None => Err(Fault::SubRequestProtocol {
                channel: id.0,
                detail: "no generated sub-request to accept".to_owned(),
            }),
        }
    }

    /// Deliver the result of an in-progress sub-request back into its
    /// channel.
    pub fn generated_request_complete(
        &mut self,
        id: ChannelId,
        response: SubResponse,
    ) -> Result<()> {
        let chan = self.channel_mut(id)?;
        match response {
            SubResponse::CacheRead { bytes } => {
                Self::expect_in_progress(id, &chan.cache_sub, "cache read", |op| {
                    matches!(op, SubOp::CacheRead { .. })
                })?;
                chan.cache_sub = None;
                chan.on_cache_read(bytes)
            }
            SubResponse::CacheWrite => {
                Self::expect_in_progress(id, &chan.cache_sub, "cache write", |op| {
                    matches!(op, SubOp::CacheWrite { .. })
                })?;
                chan.cache_sub = None;
                chan.on_cache_write()
            }
            SubResponse::Relocate { new_pba } => {
                Self::expect_in_progress(id, &chan.meta_sub, "relocation", |op| {
                    matches!(op, SubOp::Relocate { .. })
                })?;
                chan.meta_sub = None;
                chan.on_relocate(new_pba)
            }
        }
    }

    fn expect_in_progress(
        id: ChannelId,
        slot: &Option<SubSlot>,
        label: &str,
        matches_op: impl Fn(&SubOp) -> bool,
    ) -> Result<()> {
        match slot {
            Some(sub) if sub.accepted && matches_op(&sub.op) => Ok(()),
            Some(sub) if !sub.accepted => Err(Fault::SubRequestProtocol {
                channel: id.0,
                detail: format!("{label} completed before being accepted"),
            }),
            Some(_) => Err(Fault::SubRequestProtocol {
                channel: id.0,
                detail: format!("{label} response does not match the outstanding sub-request"),
            }),
            None => Err(Fault::SubRequestProtocol {
                channel: id.0,
                detail: format!("{label} completed with nothing outstanding"),
            }),
        }
    }

    // ── Caller-facing drain protocol ────────────────────────────────────────

    /// First channel whose request reached a terminal outcome, if any.
    #[must_use]
    pub fn peek_completed(&self) -> Option<(ChannelId, &ReclaimRequest)> {
        self.channels.iter().find_map(|chan| {
            if chan.state == ChannelState::Complete {
                chan.req.as_ref().map(|req| (ChannelId(chan.id), req))
            } else {
                None
            }
        })
    }

    /// Take the finished request out of `id` and free the channel.
    pub fn drop_completed(&mut self, id: ChannelId) -> Result<ReclaimRequest> {
        self.channel_mut(id)?.drain()
    }

    fn channel_mut(&mut self, id: ChannelId) -> Result<&mut Channel> {
        let count = self.channels.len();
        self.channels.get_mut(id.0).ok_or(Fault::ChannelState {
            channel: id.0,
            detail: format!("channel id out of range (pool has {count} slots)"),
        })
    }
}
