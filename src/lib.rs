//! A replicated tree of typed values, arrays, and maps with incremental
//! (delta) server-to-client synchronization on top of a generational slab
//! arena.
//!
//! The server owns the authoritative [`SyncTree`]; mutations go through
//! path-based [`Visitor`]s. A replication runtime calls
//! [`SyncTree::net_delta_serialize`] with the last acknowledged
//! [`BaselineState`] per client and ships the resulting byte stream; the
//! client side of the same entry point replays it, converging on an identical
//! tree while allowing cheap local value prediction through an overlay.

mod arena;
mod baseline;
mod delta;
mod error;
mod host;
mod name;
mod node;
mod node_id;
mod tree;
mod types;
mod value;
mod visitor;
mod wire;

pub use arena::{
    AllocReplay, Arena, ArenaStats, Chunk, ChunkMeta, ParentEdge, CHUNK_SIZE, MAX_CHUNKS,
    TOTAL_CAPACITY,
};
pub use baseline::BaselineState;
pub use delta::NetDeltaParams;
pub use error::{OpReport, OpStatus, WireError};
pub use host::{HostAdapter, ReplicationSink};
pub use name::Name;
pub use node::Node;
pub use node_id::NodeId;
pub use tree::SyncTree;
pub use types::{builtin, TypeInfo, TypeRef, TypeRegistry, ValueOps};
pub use value::{HeapValue, SmallValue, INLINE_ALIGN, INLINE_SIZE};
pub use visitor::{PathSegment, Visitor};
pub use wire::{WireReader, WireWriter};

use ahash::{AHashMap, AHashSet};

pub(crate) type SmallKeyHashMap<K, V> = AHashMap<K, V>;
pub(crate) type SmallKeySet<K> = AHashSet<K>;

/// Children of an Array node, in insertion order.
pub type ArrayChildren = Vec<NodeId>;

/// Children of a Map node. Iteration order is unspecified by the data model;
/// this implementation uses insertion order, which stays stable per process.
pub type MapChildren = indexmap::IndexMap<Name, NodeId, ahash::RandomState>;
