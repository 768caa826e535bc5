use crate::name::Name;
use crate::node::Node;
use crate::node_id::{NodeId, INVALID_INDEX};
use crate::types::TypeRef;

pub const CHUNK_SIZE: usize = 32;
pub const CHUNK_SHIFT: u16 = 5;
pub const CHUNK_MASK: u16 = 0x1F;
pub const MAX_CHUNKS: usize = 2048;
/// 65,536 slots; the very last slot is reserved so the all-ones [`NodeId`]
/// stays invalid, leaving 65,535 usable.
pub const TOTAL_CAPACITY: u32 = (MAX_CHUNKS * CHUNK_SIZE) as u32;

const LAST_CHUNK: u16 = (MAX_CHUNKS - 1) as u16;
const LAST_LOCAL: u16 = (CHUNK_SIZE - 1) as u16;

/// Reverse pointer from a child to its location in the parent container.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ParentEdge {
    #[default]
    None,
    ArrayIndex(u16),
    MapLabel(Name),
}

/// Outcome of a deterministic [`Arena::allocate_at`] replay.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AllocReplay {
    /// Slot was free; now used with the expected generation.
    New,
    /// Slot held a different generation; the old node was destroyed.
    Replaced,
    /// Slot already holds the expected generation; no-op.
    Exists,
}

/// Per-slot metadata of one chunk, kept in parallel arrays so the replication
/// baseline can snapshot a chunk with a single clone.
#[derive(Clone)]
pub struct ChunkMeta {
    pub generations: [u16; CHUNK_SIZE],
    pub versions: [u32; CHUNK_SIZE],
    pub parents: [NodeId; CHUNK_SIZE],
    pub value_types: [TypeRef; CHUNK_SIZE],
    pub parent_edges: [ParentEdge; CHUNK_SIZE],
    pub used_mask: u32,
    pub chunk_index: u16,
    pub used_count: u8,
}

impl ChunkMeta {
    fn new(chunk_index: u16) -> Self {
        Self {
            generations: [0; CHUNK_SIZE],
            versions: [0; CHUNK_SIZE],
            parents: [NodeId::INVALID; CHUNK_SIZE],
            value_types: [TypeRef::EMPTY; CHUNK_SIZE],
            parent_edges: std::array::from_fn(|_| ParentEdge::None),
            used_mask: 0,
            chunk_index,
            used_count: 0,
        }
    }

    pub fn is_used(&self, local: u16) -> bool {
        local < CHUNK_SIZE as u16 && self.used_mask & (1u32 << local) != 0
    }
}

pub struct Chunk {
    pub meta: ChunkMeta,
    nodes: [Node; CHUNK_SIZE],
}

impl Chunk {
    fn new(chunk_index: u16) -> Self {
        Self {
            meta: ChunkMeta::new(chunk_index),
            nodes: std::array::from_fn(|_| Node::Empty),
        }
    }

    fn has_free_slot(&self) -> bool {
        if self.meta.chunk_index == LAST_CHUNK {
            return usize::from(self.meta.used_count) < CHUNK_SIZE - 1;
        }
        usize::from(self.meta.used_count) < CHUNK_SIZE
    }

    fn is_node_valid(&self, local: u16, generation: u16) -> bool {
        self.meta.is_used(local) && self.meta.generations[usize::from(local)] == generation
    }

    pub fn node(&self, local: u16) -> &Node {
        &self.nodes[usize::from(local)]
    }

    fn clear_slot_metadata(&mut self, local: u16) {
        let i = usize::from(local);
        self.meta.parents[i] = NodeId::INVALID;
        self.meta.value_types[i] = TypeRef::EMPTY;
        self.meta.parent_edges[i] = ParentEdge::None;
    }

    fn allocate_slot(&mut self) -> Option<u16> {
        let free_mask = !self.meta.used_mask;
        if free_mask == 0 {
            return None;
        }
        let local = free_mask.trailing_zeros() as u16;
        if self.meta.chunk_index == LAST_CHUNK && local == LAST_LOCAL {
            return None;
        }
        let i = usize::from(local);
        self.meta.used_mask |= 1u32 << local;
        self.meta.used_count += 1;
        self.meta.generations[i] = self.meta.generations[i].wrapping_add(1);
        self.meta.versions[i] += 1;
        self.nodes[i] = Node::Empty;
        self.clear_slot_metadata(local);
        Some(local)
    }

    fn allocate_slot_at(&mut self, local: u16, expected_generation: u16) -> Option<AllocReplay> {
        if local >= CHUNK_SIZE as u16 {
            return None;
        }
        let i = usize::from(local);
        if self.meta.is_used(local) {
            if self.meta.generations[i] == expected_generation {
                return Some(AllocReplay::Exists);
            }
            self.meta.generations[i] = expected_generation;
            self.nodes[i] = Node::Empty;
            self.clear_slot_metadata(local);
            Some(AllocReplay::Replaced)
        } else {
            self.meta.used_mask |= 1u32 << local;
            self.meta.used_count += 1;
            self.meta.generations[i] = expected_generation;
            self.nodes[i] = Node::Empty;
            self.clear_slot_metadata(local);
            Some(AllocReplay::New)
        }
    }

    fn deallocate_slot(&mut self, local: u16, expected_generation: u16) -> bool {
        if !self.is_node_valid(local, expected_generation) {
            return false;
        }
        let i = usize::from(local);
        self.nodes[i] = Node::Empty;
        self.clear_slot_metadata(local);
        self.meta.used_mask &= !(1u32 << local);
        self.meta.used_count -= 1;
        true
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ArenaStats {
    pub total_allocated: u32,
    pub total_deallocated: u32,
    pub peak_active: u32,
    pub current_active: u16,
    first_free_hint: u16,
}

/// Generational slab of [`Node`]s in 32-slot chunks.
///
/// Slot identity is pinned by a per-slot generation counter; a stale
/// [`NodeId`] resolves to `None` rather than to the slot's new occupant.
pub struct Arena {
    chunks: Vec<Box<Chunk>>,
    stats: ArenaStats,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    pub fn new() -> Self {
        let mut arena = Self {
            chunks: Vec::with_capacity(4),
            stats: ArenaStats {
                first_free_hint: INVALID_INDEX,
                ..ArenaStats::default()
            },
        };
        arena.push_chunk();
        arena
    }

    pub fn reset(&mut self) {
        self.chunks.clear();
        self.stats = ArenaStats {
            first_free_hint: INVALID_INDEX,
            ..ArenaStats::default()
        };
    }

    fn to_chunk(global: u16) -> u16 {
        global >> CHUNK_SHIFT
    }

    fn to_local(global: u16) -> u16 {
        global & CHUNK_MASK
    }

    fn push_chunk(&mut self) -> Option<u16> {
        let index = self.chunks.len();
        if index >= MAX_CHUNKS {
            return None;
        }
        self.chunks.push(Box::new(Chunk::new(index as u16)));
        Some(index as u16)
    }

    fn ensure_chunk(&mut self, chunk_index: u16) -> bool {
        if usize::from(chunk_index) >= MAX_CHUNKS {
            return false;
        }
        while self.chunks.len() <= usize::from(chunk_index) {
            if self.push_chunk().is_none() {
                return false;
            }
        }
        true
    }

    fn select_chunk(&mut self) -> Option<u16> {
        let hint = self.stats.first_free_hint;
        if let Some(chunk) = self.chunks.get(usize::from(hint)) {
            if chunk.has_free_slot() {
                return Some(hint);
            }
        }
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.has_free_slot() {
                self.stats.first_free_hint = i as u16;
                return Some(i as u16);
            }
        }
        let created = self.push_chunk()?;
        self.stats.first_free_hint = created;
        Some(created)
    }

    /// Allocate a fresh empty node. Returns [`NodeId::INVALID`] on pool
    /// exhaustion; never panics.
    pub fn allocate(&mut self) -> NodeId {
        if u32::from(self.stats.current_active) >= TOTAL_CAPACITY - 1 {
            log::error!(
                "node pool exhausted: {} active, capacity {}",
                self.stats.current_active,
                TOTAL_CAPACITY - 1
            );
            return NodeId::INVALID;
        }
        let Some(chunk_index) = self.select_chunk() else {
            log::error!("no chunk with a free slot and chunk limit reached");
            return NodeId::INVALID;
        };
        let chunk = &mut self.chunks[usize::from(chunk_index)];
        let Some(local) = chunk.allocate_slot() else {
            log::error!("chunk {chunk_index} reported free space but allocation failed");
            return NodeId::INVALID;
        };

        self.stats.total_allocated += 1;
        self.stats.current_active += 1;
        self.stats.peak_active = self
            .stats
            .peak_active
            .max(u32::from(self.stats.current_active));

        let global = (chunk_index << CHUNK_SHIFT) | local;
        NodeId::new(global, chunk.meta.generations[usize::from(local)])
    }

    /// Deterministic allocation at a caller-chosen id, used when replaying
    /// replication records. Generations come from the wire, which makes the
    /// replay idempotent and order-tolerant.
    pub fn allocate_at(&mut self, id: NodeId) -> Option<AllocReplay> {
        if !id.is_valid() {
            return None;
        }
        let chunk_index = Self::to_chunk(id.index());
        if !self.ensure_chunk(chunk_index) {
            log::error!("allocate_at: cannot materialize chunk {chunk_index}");
            return None;
        }
        let outcome = self.chunks[usize::from(chunk_index)]
            .allocate_slot_at(Self::to_local(id.index()), id.generation())?;
        match outcome {
            AllocReplay::New => {
                self.stats.total_allocated += 1;
                self.stats.current_active += 1;
                self.stats.peak_active = self
                    .stats
                    .peak_active
                    .max(u32::from(self.stats.current_active));
            }
            AllocReplay::Replaced => {
                self.stats.total_allocated += 1;
            }
            AllocReplay::Exists => {}
        }
        Some(outcome)
    }

    /// Destroy the node and free its slot. Fails on stale generation.
    pub fn deallocate(&mut self, id: NodeId) -> bool {
        if !id.is_valid() {
            return false;
        }
        let chunk_index = Self::to_chunk(id.index());
        let Some(chunk) = self.chunks.get_mut(usize::from(chunk_index)) else {
            return false;
        };
        if chunk.deallocate_slot(Self::to_local(id.index()), id.generation()) {
            self.stats.total_deallocated += 1;
            self.stats.current_active -= 1;
            true
        } else {
            false
        }
    }

    fn chunk_of(&self, id: NodeId) -> Option<(&Chunk, u16)> {
        if !id.is_valid() {
            return None;
        }
        let chunk = self.chunks.get(usize::from(Self::to_chunk(id.index())))?;
        let local = Self::to_local(id.index());
        chunk.is_node_valid(local, id.generation()).then_some(())?;
        Some((chunk, local))
    }

    fn chunk_of_mut(&mut self, id: NodeId) -> Option<(&mut Chunk, u16)> {
        if !id.is_valid() {
            return None;
        }
        let chunk = self
            .chunks
            .get_mut(usize::from(Self::to_chunk(id.index())))?;
        let local = Self::to_local(id.index());
        chunk.is_node_valid(local, id.generation()).then_some(())?;
        Some((chunk, local))
    }

    pub fn is_valid(&self, id: NodeId) -> bool {
        self.chunk_of(id).is_some()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.chunk_of(id).map(|(c, l)| &c.nodes[usize::from(l)])
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.chunk_of_mut(id)
            .map(|(c, l)| &mut c.nodes[usize::from(l)])
    }

    pub fn parent(&self, id: NodeId) -> NodeId {
        self.chunk_of(id)
            .map(|(c, l)| c.meta.parents[usize::from(l)])
            .unwrap_or(NodeId::INVALID)
    }

    pub fn set_parent(&mut self, id: NodeId, parent: NodeId) -> bool {
        match self.chunk_of_mut(id) {
            Some((c, l)) => {
                c.meta.parents[usize::from(l)] = parent;
                true
            }
            None => false,
        }
    }

    pub fn value_type(&self, id: NodeId) -> Option<TypeRef> {
        self.chunk_of(id).map(|(c, l)| c.meta.value_types[usize::from(l)])
    }

    pub fn set_value_type(&mut self, id: NodeId, value_type: TypeRef) -> bool {
        match self.chunk_of_mut(id) {
            Some((c, l)) => {
                c.meta.value_types[usize::from(l)] = value_type;
                true
            }
            None => false,
        }
    }

    pub fn version(&self, id: NodeId) -> Option<u32> {
        self.chunk_of(id).map(|(c, l)| c.meta.versions[usize::from(l)])
    }

    pub fn parent_edge(&self, id: NodeId) -> ParentEdge {
        self.chunk_of(id)
            .map(|(c, l)| c.meta.parent_edges[usize::from(l)].clone())
            .unwrap_or(ParentEdge::None)
    }

    pub fn set_parent_edge_array(&mut self, id: NodeId, index: u16) -> bool {
        match self.chunk_of_mut(id) {
            Some((c, l)) => {
                c.meta.parent_edges[usize::from(l)] = ParentEdge::ArrayIndex(index);
                true
            }
            None => false,
        }
    }

    pub fn set_parent_edge_map(&mut self, id: NodeId, label: Name) -> bool {
        match self.chunk_of_mut(id) {
            Some((c, l)) => {
                c.meta.parent_edges[usize::from(l)] = ParentEdge::MapLabel(label);
                true
            }
            None => false,
        }
    }

    pub fn clear_parent_edge(&mut self, id: NodeId) -> bool {
        match self.chunk_of_mut(id) {
            Some((c, l)) => {
                c.meta.parent_edges[usize::from(l)] = ParentEdge::None;
                true
            }
            None => false,
        }
    }

    /// Bump the per-slot version.
    pub fn mark_dirty(&mut self, id: NodeId, bump_version: bool) -> bool {
        match self.chunk_of_mut(id) {
            Some((c, l)) => {
                if bump_version {
                    c.meta.versions[usize::from(l)] += 1;
                }
                true
            }
            None => false,
        }
    }

    /// Whether `ancestor` is a strict ancestor of `id` via parent links.
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        if ancestor == id || !self.is_valid(ancestor) || !self.is_valid(id) {
            return false;
        }
        let mut current = id;
        loop {
            current = self.parent(current);
            if current == ancestor {
                return true;
            }
            if !current.is_valid() {
                return false;
            }
        }
    }

    /// Visit every live node with its metadata, chunk by chunk.
    pub fn for_each_node(&self, mut f: impl FnMut(NodeId, &Node, u32, NodeId, TypeRef)) {
        for chunk in &self.chunks {
            if chunk.meta.used_count == 0 {
                continue;
            }
            let mut mask = chunk.meta.used_mask;
            while mask != 0 {
                let local = mask.trailing_zeros() as u16;
                let i = usize::from(local);
                let global = (chunk.meta.chunk_index << CHUNK_SHIFT) | local;
                f(
                    NodeId::new(global, chunk.meta.generations[i]),
                    &chunk.nodes[i],
                    chunk.meta.versions[i],
                    chunk.meta.parents[i],
                    chunk.meta.value_types[i],
                );
                mask &= mask - 1;
            }
        }
    }

    pub fn chunk_meta(&self, chunk_index: u16) -> Option<&ChunkMeta> {
        self.chunks.get(usize::from(chunk_index)).map(|c| &c.meta)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn stats(&self) -> ArenaStats {
        self.stats
    }

    pub fn current_active(&self) -> u32 {
        u32::from(self.stats.current_active)
    }

    pub fn free_remaining(&self) -> u32 {
        (TOTAL_CAPACITY - 1) - self.current_active()
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_bumps_generation_and_reuses_slots() {
        let mut arena = Arena::new();
        let first = arena.allocate();
        assert_eq!(first, NodeId::new(0, 1));
        assert!(arena.is_valid(first));

        assert!(arena.deallocate(first));
        assert!(!arena.is_valid(first));
        assert!(arena.node(first).is_none());

        let second = arena.allocate();
        assert_eq!(second, NodeId::new(0, 2));
        assert!(arena.is_valid(second));
        // Stale id still refers to nothing.
        assert!(arena.node(first).is_none());
    }

    #[test]
    fn stale_generation_cannot_deallocate() {
        let mut arena = Arena::new();
        let id = arena.allocate();
        assert!(!arena.deallocate(NodeId::new(id.index(), id.generation() + 1)));
        assert!(arena.is_valid(id));
    }

    #[test]
    fn allocate_at_is_idempotent() {
        let mut arena = Arena::new();
        let id = NodeId::new(40, 7);
        assert_eq!(arena.allocate_at(id), Some(AllocReplay::New));
        assert_eq!(arena.allocate_at(id), Some(AllocReplay::Exists));
        assert_eq!(arena.current_active(), 1);

        // Different generation replaces the occupant.
        let newer = NodeId::new(40, 9);
        assert_eq!(arena.allocate_at(newer), Some(AllocReplay::Replaced));
        assert!(!arena.is_valid(id));
        assert!(arena.is_valid(newer));
        assert_eq!(arena.current_active(), 1);
    }

    #[test]
    fn allocate_at_materializes_intermediate_chunks() {
        let mut arena = Arena::new();
        let far = NodeId::new(5 * CHUNK_SIZE as u16 + 3, 1);
        assert_eq!(arena.allocate_at(far), Some(AllocReplay::New));
        assert_eq!(arena.chunk_count(), 6);
        assert!(arena.is_valid(far));
    }

    #[test]
    fn metadata_accessors_validate_generation() {
        let mut arena = Arena::new();
        let parent = arena.allocate();
        let child = arena.allocate();
        assert!(arena.set_parent(child, parent));
        assert!(arena.set_parent_edge_array(child, 4));
        assert_eq!(arena.parent(child), parent);
        assert_eq!(arena.parent_edge(child), ParentEdge::ArrayIndex(4));

        let stale = NodeId::new(child.index(), child.generation() + 1);
        assert!(!arena.set_parent(stale, parent));
        assert_eq!(arena.parent(stale), NodeId::INVALID);
        assert_eq!(arena.parent_edge(stale), ParentEdge::None);
    }

    #[test]
    fn ancestor_walks_parent_links() {
        let mut arena = Arena::new();
        let a = arena.allocate();
        let b = arena.allocate();
        let c = arena.allocate();
        arena.set_parent(b, a);
        arena.set_parent(c, b);
        assert!(arena.is_ancestor(a, c));
        assert!(arena.is_ancestor(b, c));
        assert!(!arena.is_ancestor(c, a));
        assert!(!arena.is_ancestor(a, a));
    }

    #[test]
    fn for_each_node_visits_only_live_slots() {
        let mut arena = Arena::new();
        let a = arena.allocate();
        let b = arena.allocate();
        let c = arena.allocate();
        arena.deallocate(b);

        let mut seen = Vec::new();
        arena.for_each_node(|id, _, _, _, _| seen.push(id));
        assert_eq!(seen, vec![a, c]);
    }

    #[test]
    fn stats_track_allocation_lifecycle() {
        let mut arena = Arena::new();
        let a = arena.allocate();
        let _b = arena.allocate();
        assert_eq!(arena.stats().total_allocated, 2);
        assert_eq!(arena.stats().peak_active, 2);
        assert_eq!(arena.current_active(), 2);

        arena.deallocate(a);
        assert_eq!(arena.stats().total_deallocated, 1);
        assert_eq!(arena.current_active(), 1);
        assert_eq!(arena.stats().peak_active, 2);
        assert_eq!(arena.free_remaining(), TOTAL_CAPACITY - 2);
    }

    #[test]
    fn mark_dirty_bumps_the_slot_version() {
        let mut arena = Arena::new();
        let id = arena.allocate();
        let before = arena.version(id).unwrap();
        assert!(arena.mark_dirty(id, true));
        assert_eq!(arena.version(id), Some(before + 1));
        assert!(arena.mark_dirty(id, false));
        assert_eq!(arena.version(id), Some(before + 1));
    }
}
