use crate::arena::ChunkMeta;
use crate::node::Node;
use crate::node_id::NodeId;
use crate::tree::TreeCore;
use crate::{ArrayChildren, MapChildren, SmallKeyHashMap};

/// Snapshot of the tree shape a client last acknowledged: a copy of every
/// chunk's metadata plus per-container content mirrors.
///
/// The baseline owns its copies outright; it never references the live
/// allocator, which will have changed by the next write call. The replication
/// runtime passes the old state in and receives a freshly built one on every
/// successful send.
pub struct BaselineState {
    pub(crate) data_version: u32,
    pub(crate) chunks: Vec<ChunkMeta>,
    pub(crate) array_mirror: SmallKeyHashMap<NodeId, ArrayChildren>,
    pub(crate) map_mirror: SmallKeyHashMap<NodeId, MapChildren>,
}

impl BaselineState {
    /// Full snapshot of the current allocator shape and container contents.
    pub(crate) fn capture(core: &TreeCore) -> Self {
        let chunks = (0..core.arena.chunk_count())
            .filter_map(|ci| core.arena.chunk_meta(ci as u16).cloned())
            .collect();

        let mut array_mirror = SmallKeyHashMap::default();
        let mut map_mirror = SmallKeyHashMap::default();
        core.arena.for_each_node(|id, node, _, _, _| match node {
            Node::Array(children) => {
                array_mirror.insert(id, children.clone());
            }
            Node::Map(children) => {
                map_mirror.insert(id, children.clone());
            }
            _ => {}
        });

        Self {
            data_version: core.data_version,
            chunks,
            array_mirror,
            map_mirror,
        }
    }

    /// The tree data version this baseline was taken at.
    pub fn data_version(&self) -> u32 {
        self.data_version
    }

    /// Baselines at the same data version describe the same acknowledged
    /// state.
    pub fn is_state_equal(&self, other: &BaselineState) -> bool {
        self.data_version == other.data_version
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
