#![forbid(unsafe_code)]
//! Free-space reclamation engine for the veilfs block store.
//!
//! Every copy-on-write of a virtual block needs a replacement physical
//! block. This engine supplies them: it walks the authenticated free tree
//! (per-physical-block accounting records, digest-chained to a root),
//! selects records that no durable snapshot or unsecured generation still
//! depends on, swaps them for the blocks being retired, and rewrites the
//! modified tree path back up to a freshly digested root.
//!
//! The engine is single-threaded and cooperative. It owns a fixed pool of
//! channel slots; callers [`submit`](ReclaimEngine::submit)
//! one [`ReclaimRequest`] per slot, drive progress with
//! [`execute`](ReclaimEngine::execute), service the generated cache and
//! metadata-allocator sub-requests through the peek/drop protocol, and
//! drain finished requests with
//! [`drop_completed`](ReclaimEngine::drop_completed). All I/O is
//! asynchronous from the engine's point of view: a channel with an
//! outstanding sub-request is suspended until the collaborator delivers the
//! result.

mod channel;
mod codec;
mod descriptor;
mod engine;
mod policy;
mod request;
mod scan;
mod update;

pub use codec::{
    inner_child, leaf_record, set_inner_child, set_leaf_record, LeafRecord, INNER_ENTRY_SIZE,
    LEAF_RECORD_SIZE,
};
pub use engine::{
    ChannelId, EngineConfig, GeneratedRequest, ReclaimEngine, SubResponse,
};
pub use policy::is_eligible;
pub use request::{
    AllocKind, FailureKind, NodeRef, ReclaimRequest, RekeyState, RetiredBlock, SubOp, TreeShape,
};
