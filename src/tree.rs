use std::cell::{Cell, RefCell};
use std::fmt::Write as _;
use std::rc::{Rc, Weak};

use crate::arena::{Arena, ArenaStats, ParentEdge};
use crate::delta::{self, NetDeltaParams};
use crate::error::OpStatus;
use crate::node::Node;
use crate::node_id::NodeId;
use crate::types::{TypeRef, TypeRegistry};
use crate::value::payload_equals;
use crate::visitor::{PathSegment, Visitor};
use crate::{SmallKeyHashMap, SmallKeySet};

/// Longest resolvable visitor path.
pub(crate) const MAX_PATH_DEPTH: usize = 64;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ResolveMode {
    /// Fail on any missing segment; never mutate.
    ReadOnly,
    /// Create missing map entries and promote empty nodes to the needed kind.
    EnsureCreate,
    /// As EnsureCreate, but also coerce mismatching nodes (releasing their
    /// subtree).
    ForceOverride,
}

pub(crate) type OnChangedFn = Rc<dyn Fn(&Visitor)>;

pub(crate) struct OnChangedBinding {
    pub path: Vec<PathSegment>,
    pub depth: i32,
    pub owner: u64,
    pub callback: OnChangedFn,
}

/// Source side of a deep copy: the tree itself or another tree's core.
#[derive(Clone, Copy)]
pub(crate) enum CopySource<'a> {
    Own,
    Other(&'a TreeCore),
}

pub(crate) struct TreeCore {
    pub(crate) arena: Arena,
    pub(crate) registry: Rc<TypeRegistry>,
    pub(crate) root: NodeId,
    pub(crate) data_version: u32,
    pub(crate) struct_version: u32,
    pub(crate) running_on_server: bool,
    /// Client-only: shadow nodes for predicted values, keyed by authoritative
    /// id. Cleared before every incoming delta.
    pub(crate) overlay: SmallKeyHashMap<NodeId, Node>,
    /// Client-only: pre-apply values captured during delta apply, readable
    /// during listener dispatch.
    pub(crate) old_values: SmallKeyHashMap<NodeId, (TypeRef, Box<[u8]>)>,
    pub(crate) changed_nodes: SmallKeySet<NodeId>,
    pub(crate) bindings: Vec<OnChangedBinding>,
    pub(crate) dirty_flag: Option<Rc<Cell<bool>>>,
}

impl TreeCore {
    fn new(registry: Rc<TypeRegistry>) -> Self {
        let mut core = Self {
            arena: Arena::new(),
            registry,
            root: NodeId::INVALID,
            data_version: 0,
            struct_version: 0,
            running_on_server: true,
            overlay: SmallKeyHashMap::default(),
            old_values: SmallKeyHashMap::default(),
            changed_nodes: SmallKeySet::default(),
            bindings: Vec::new(),
            dirty_flag: None,
        };
        core.root = core.arena.allocate();
        core.bump_node_data_and_struct(core.root);
        core
    }

    // ---- version plumbing -------------------------------------------------

    fn mark_host_dirty(&self) {
        if let Some(flag) = &self.dirty_flag {
            flag.set(true);
        }
    }

    pub(crate) fn bump_data_version(&mut self) {
        if !self.running_on_server {
            return;
        }
        self.data_version += 1;
        self.mark_host_dirty();
    }

    pub(crate) fn bump_struct_version(&mut self) {
        if !self.running_on_server {
            return;
        }
        self.struct_version += 1;
        self.data_version += 1;
        self.mark_host_dirty();
    }

    /// Bump the slot version and record the change, without touching the
    /// tree-level counters.
    pub(crate) fn bump_only_node_data_version(&mut self, id: NodeId) {
        if !self.running_on_server {
            return;
        }
        self.arena.mark_dirty(id, true);
        self.changed_nodes.insert(id);
    }

    pub(crate) fn bump_node_data_version(&mut self, id: NodeId) {
        if !self.running_on_server {
            return;
        }
        self.arena.mark_dirty(id, true);
        self.changed_nodes.insert(id);
        self.bump_data_version();
    }

    pub(crate) fn bump_node_data_and_struct(&mut self, id: NodeId) {
        if !self.running_on_server {
            return;
        }
        self.arena.mark_dirty(id, true);
        self.changed_nodes.insert(id);
        self.bump_struct_version();
    }

    pub(crate) fn set_node_type(&mut self, id: NodeId, value_type: TypeRef) {
        if !self.running_on_server {
            return;
        }
        self.arena.set_value_type(id, value_type);
    }

    // ---- reads ------------------------------------------------------------

    /// The node visible to a reader: on the client, overlay entries shadow
    /// the authoritative node.
    pub(crate) fn node_for_read(&self, id: NodeId) -> Option<&Node> {
        if !self.running_on_server {
            if let Some(shadow) = self.overlay.get(&id) {
                return Some(shadow);
            }
        }
        self.arena.node(id)
    }

    pub(crate) fn count_recursive(&self, id: NodeId) -> u32 {
        let Some(node) = self.arena.node(id) else {
            return 0;
        };
        let mut count = 1;
        match node {
            Node::Array(children) => {
                for child in children.clone() {
                    count += self.count_recursive(child);
                }
            }
            Node::Map(children) => {
                for child in children.values().copied().collect::<Vec<_>>() {
                    count += self.count_recursive(child);
                }
            }
            _ => {}
        }
        count
    }

    // ---- variant transitions ---------------------------------------------

    pub(crate) fn reset_to_empty(&mut self, id: NodeId) -> OpStatus {
        if !self.arena.is_valid(id) {
            return OpStatus::InvalidNode;
        }
        self.release_children(id);
        let Some(node) = self.arena.node_mut(id) else {
            return OpStatus::InvalidNode;
        };
        let status = node.reset_empty();
        match status {
            OpStatus::SameValueNoChange => {}
            OpStatus::SuccessOverrideEmpty => {
                self.set_node_type(id, TypeRef::EMPTY);
                self.bump_node_data_version(id);
            }
            _ => {
                self.set_node_type(id, TypeRef::EMPTY);
                self.bump_node_data_and_struct(id);
            }
        }
        status
    }

    pub(crate) fn reset_to_empty_array(&mut self, id: NodeId) -> OpStatus {
        if !self.arena.is_valid(id) {
            return OpStatus::InvalidNode;
        }
        self.release_children(id);
        let Some(node) = self.arena.node_mut(id) else {
            return OpStatus::InvalidNode;
        };
        let status = node.reset_empty_array();
        match status {
            OpStatus::SameValueNoChange => {}
            OpStatus::SuccessChangeValue => self.bump_node_data_and_struct(id),
            OpStatus::SuccessOverrideEmpty => {
                self.set_node_type(id, TypeRef::ARRAY);
                self.bump_node_data_version(id);
            }
            _ => {
                self.set_node_type(id, TypeRef::ARRAY);
                self.bump_node_data_and_struct(id);
            }
        }
        status
    }

    pub(crate) fn reset_to_empty_map(&mut self, id: NodeId) -> OpStatus {
        if !self.arena.is_valid(id) {
            return OpStatus::InvalidNode;
        }
        self.release_children(id);
        let Some(node) = self.arena.node_mut(id) else {
            return OpStatus::InvalidNode;
        };
        let status = node.reset_empty_map();
        match status {
            OpStatus::SameValueNoChange => {}
            OpStatus::SuccessChangeValue => self.bump_node_data_and_struct(id),
            OpStatus::SuccessOverrideEmpty => {
                self.set_node_type(id, TypeRef::MAP);
                self.bump_node_data_version(id);
            }
            _ => {
                self.set_node_type(id, TypeRef::MAP);
                self.bump_node_data_and_struct(id);
            }
        }
        status
    }

    // ---- release ----------------------------------------------------------

    fn release_subtree_impl(&mut self, id: NodeId, cleared: &mut u32) {
        if !self.arena.is_valid(id) {
            return;
        }
        let children: Vec<NodeId> = match self.arena.node(id) {
            Some(Node::Array(children)) => children.clone(),
            Some(Node::Map(children)) => children.values().copied().collect(),
            _ => Vec::new(),
        };
        for child in children {
            if child.is_valid() {
                self.release_subtree_impl(child, cleared);
            }
        }
        if self.arena.deallocate(id) {
            *cleared += 1;
        }
    }

    pub(crate) fn release_recursive(&mut self, id: NodeId) -> u32 {
        let mut cleared = 0;
        self.release_subtree_impl(id, &mut cleared);
        if cleared > 0 {
            self.bump_struct_version();
        }
        cleared
    }

    /// Free every child subtree but keep the container node, emptied.
    pub(crate) fn release_children(&mut self, id: NodeId) -> u32 {
        if !self.arena.is_valid(id) {
            return 0;
        }
        let children: Vec<NodeId> = match self.arena.node(id) {
            Some(Node::Array(children)) => children.clone(),
            Some(Node::Map(children)) => children.values().copied().collect(),
            _ => return 0,
        };
        let mut cleared = 0;
        for child in children {
            if child.is_valid() {
                self.release_subtree_impl(child, &mut cleared);
            }
        }
        match self.arena.node_mut(id) {
            Some(Node::Array(children)) => children.clear(),
            Some(Node::Map(children)) => children.clear(),
            _ => {}
        }
        if cleared > 0 {
            self.bump_node_data_and_struct(id);
        }
        cleared
    }

    // ---- deep copy --------------------------------------------------------

    fn source_snapshot(&self, source: CopySource<'_>, id: NodeId) -> Option<Node> {
        match source {
            CopySource::Own => self.arena.node(id).cloned(),
            CopySource::Other(other) => other.arena.node(id).cloned(),
        }
    }

    fn source_count(&self, source: CopySource<'_>, id: NodeId) -> u32 {
        match source {
            CopySource::Own => self.count_recursive(id),
            CopySource::Other(other) => other.count_recursive(id),
        }
    }

    /// Deep-copy a subtree into this tree, returning the new root id or
    /// invalid when the space check fails.
    pub(crate) fn deep_copy_node(&mut self, source: CopySource<'_>, src_id: NodeId) -> NodeId {
        let needed = self.source_count(source, src_id);
        if needed == 0 || self.arena.free_remaining() <= needed {
            return NodeId::INVALID;
        }
        let mut copied = 0;
        let new_id = self.deep_copy_impl(source, src_id, &mut copied);
        if copied > 0 {
            self.bump_struct_version();
        }
        new_id
    }

    fn deep_copy_impl(&mut self, source: CopySource<'_>, src_id: NodeId, copied: &mut u32) -> NodeId {
        let Some(snapshot) = self.source_snapshot(source, src_id) else {
            return NodeId::INVALID;
        };
        let new_id = self.arena.allocate();
        if !new_id.is_valid() {
            return NodeId::INVALID;
        }

        match snapshot {
            Node::Map(children) => {
                if let Some(node) = self.arena.node_mut(new_id) {
                    node.reset_empty_map();
                }
                self.arena.set_value_type(new_id, TypeRef::MAP);
                for (key, src_child) in children {
                    let new_child = self.deep_copy_impl(source, src_child, copied);
                    if new_child.is_valid() {
                        if let Some(map) = self.arena.node_mut(new_id).and_then(Node::as_map_mut) {
                            map.insert(key.clone(), new_child);
                        }
                        self.arena.set_parent(new_child, new_id);
                        self.arena.set_parent_edge_map(new_child, key);
                    }
                }
                self.bump_only_node_data_version(new_id);
                *copied += 1;
            }
            Node::Array(children) => {
                if let Some(node) = self.arena.node_mut(new_id) {
                    node.reset_empty_array();
                }
                self.arena.set_value_type(new_id, TypeRef::ARRAY);
                let mut index: u16 = 0;
                for src_child in children {
                    let new_child = self.deep_copy_impl(source, src_child, copied);
                    if new_child.is_valid() {
                        if let Some(array) =
                            self.arena.node_mut(new_id).and_then(Node::as_array_mut)
                        {
                            array.push(new_child);
                        }
                        self.arena.set_parent(new_child, new_id);
                        self.arena.set_parent_edge_array(new_child, index);
                        index += 1;
                    }
                }
                self.bump_only_node_data_version(new_id);
                *copied += 1;
            }
            value @ (Node::Small(_) | Node::Heap(_)) => {
                let value_type = value.kind_type();
                if let Some(node) = self.arena.node_mut(new_id) {
                    *node = value;
                }
                self.arena.set_value_type(new_id, value_type);
                self.bump_only_node_data_version(new_id);
                *copied += 1;
            }
            Node::Empty => {
                self.arena.set_value_type(new_id, TypeRef::EMPTY);
                self.bump_only_node_data_version(new_id);
                *copied += 1;
            }
        }

        new_id
    }

    // ---- redirect ---------------------------------------------------------

    /// Replace `old` with `new` in the parent container (or as root), then
    /// release the old subtree. Uses the reverse edge as the fast path and
    /// falls back to a scan that also restores the edge.
    pub(crate) fn redirect(&mut self, old: NodeId, new: NodeId) -> bool {
        if old == new || !self.arena.is_valid(old) || !self.arena.is_valid(new) {
            return false;
        }

        if old == self.root {
            self.root = new;
            self.release_recursive(old);
            return true;
        }

        let parent = self.arena.parent(old);
        let parent_is_array = match self.arena.node(parent) {
            Some(node) if node.is_array() => true,
            Some(node) if node.is_map() => false,
            _ => return false,
        };

        if parent_is_array {
            let slot = {
                let Some(array) = self.arena.node(parent).and_then(Node::as_array) else {
                    return false;
                };
                let fast = match self.arena.parent_edge(old) {
                    ParentEdge::ArrayIndex(index)
                        if array.get(usize::from(index)) == Some(&old) =>
                    {
                        Some(usize::from(index))
                    }
                    _ => None,
                };
                match fast {
                    Some(index) => Some(index),
                    None => {
                        let scanned = array.iter().position(|child| *child == old);
                        if scanned.is_some() {
                            log::warn!("reverse edge out of sync for {old:?}; restored by scan");
                        }
                        scanned
                    }
                }
            };
            let Some(index) = slot else {
                return false;
            };
            if let Some(array) = self.arena.node_mut(parent).and_then(Node::as_array_mut) {
                array[index] = new;
            }
            self.arena.set_parent(new, parent);
            self.arena.set_parent_edge_array(new, index as u16);
            self.bump_node_data_and_struct(parent);
        } else {
            let key = {
                let Some(map) = self.arena.node(parent).and_then(Node::as_map) else {
                    return false;
                };
                let fast = match self.arena.parent_edge(old) {
                    ParentEdge::MapLabel(label) if map.get(&label) == Some(&old) => Some(label),
                    _ => None,
                };
                match fast {
                    Some(label) => Some(label),
                    None => {
                        let scanned = map
                            .iter()
                            .find(|(_, child)| **child == old)
                            .map(|(label, _)| label.clone());
                        if scanned.is_some() {
                            log::warn!("reverse edge out of sync for {old:?}; restored by scan");
                        }
                        scanned
                    }
                }
            };
            let Some(key) = key else {
                return false;
            };
            if let Some(map) = self.arena.node_mut(parent).and_then(Node::as_map_mut) {
                map.insert(key.clone(), new);
            }
            self.arena.set_parent(new, parent);
            self.arena.set_parent_edge_map(new, key);
            self.bump_node_data_and_struct(parent);
        }

        self.release_recursive(old);
        true
    }

    // ---- structural composites --------------------------------------------

    fn is_ancestor_or_descendant(&self, a: NodeId, b: NodeId) -> bool {
        self.arena.is_ancestor(a, b) || self.arena.is_ancestor(b, a)
    }

    pub(crate) fn copy_node_same(&mut self, target: NodeId, src_id: NodeId) -> bool {
        if target == src_id || !self.arena.is_valid(target) || !self.arena.is_valid(src_id) {
            return false;
        }
        let new_id = self.deep_copy_node(CopySource::Own, src_id);
        if !new_id.is_valid() {
            return false;
        }
        if !self.redirect(target, new_id) {
            self.release_recursive(new_id);
            return false;
        }
        true
    }

    pub(crate) fn swap_node_same(&mut self, a: NodeId, b: NodeId) -> bool {
        if a == b || !self.arena.is_valid(a) || !self.arena.is_valid(b) {
            return false;
        }
        if self.is_ancestor_or_descendant(a, b) {
            return false;
        }
        if self.arena.free_remaining() <= self.count_recursive(a) + self.count_recursive(b) {
            return false;
        }

        let new_a = self.deep_copy_node(CopySource::Own, b);
        let new_b = self.deep_copy_node(CopySource::Own, a);
        if !new_a.is_valid() || !new_b.is_valid() {
            self.release_recursive(new_a);
            self.release_recursive(new_b);
            return false;
        }

        let ok_a = self.redirect(a, new_a);
        let ok_b = self.redirect(b, new_b);
        if !ok_a || !ok_b {
            log::error!("swap redirect failed; releasing replacement subtrees");
            if !ok_a {
                self.release_recursive(new_a);
            }
            if !ok_b {
                self.release_recursive(new_b);
            }
            return false;
        }
        true
    }

    pub(crate) fn move_node_same(&mut self, target: NodeId, src_id: NodeId) -> bool {
        if target == src_id || !self.arena.is_valid(target) || !self.arena.is_valid(src_id) {
            return false;
        }
        if self.is_ancestor_or_descendant(target, src_id) {
            return false;
        }
        let new_id = self.deep_copy_node(CopySource::Own, src_id);
        if !new_id.is_valid() {
            return false;
        }
        if !self.redirect(target, new_id) {
            self.release_recursive(new_id);
            return false;
        }
        self.release_recursive(src_id);
        true
    }

    // ---- resolve ----------------------------------------------------------

    pub(crate) fn resolve(&mut self, path: &[PathSegment], mode: ResolveMode) -> (OpStatus, NodeId) {
        // Clients may not create or coerce structure.
        let mode = if self.running_on_server {
            mode
        } else {
            ResolveMode::ReadOnly
        };

        if path.len() > MAX_PATH_DEPTH {
            return (OpStatus::ResolvePathTooDeep, NodeId::INVALID);
        }
        let mut current = self.root;
        if !self.arena.is_valid(current) {
            return (OpStatus::InvalidRootNode, NodeId::INVALID);
        }
        if path.is_empty() {
            return (OpStatus::PathEmptyResolvedToRoot, current);
        }

        for segment in path {
            let Some(node) = self.arena.node(current) else {
                return (OpStatus::InvalidNode, NodeId::INVALID);
            };
            match segment {
                PathSegment::Name(key) => {
                    if !node.is_map() {
                        let coerce = match mode {
                            ResolveMode::ReadOnly => false,
                            ResolveMode::EnsureCreate => node.is_empty(),
                            ResolveMode::ForceOverride => true,
                        };
                        if !coerce {
                            return (OpStatus::SegmentNameButNodeNotMap, NodeId::INVALID);
                        }
                        if !self.reset_to_empty_map(current).is_ok() {
                            return (OpStatus::ResolveOperatorFailure, NodeId::INVALID);
                        }
                    }
                    let existing = self
                        .arena
                        .node(current)
                        .and_then(Node::as_map)
                        .and_then(|map| map.get(key))
                        .copied();
                    match existing {
                        Some(child) => current = child,
                        None => {
                            if mode == ResolveMode::ReadOnly {
                                return (OpStatus::ResolveMapKeyNotFound, NodeId::INVALID);
                            }
                            let child = self.arena.allocate();
                            if !child.is_valid() {
                                return (OpStatus::ResolveAllocateFailed, NodeId::INVALID);
                            }
                            match self.arena.node_mut(current).and_then(Node::as_map_mut) {
                                Some(map) => {
                                    map.insert(key.clone(), child);
                                }
                                None => {
                                    self.arena.deallocate(child);
                                    return (OpStatus::ResolveInternalNullMap, NodeId::INVALID);
                                }
                            }
                            self.arena.set_parent(child, current);
                            self.arena.set_parent_edge_map(child, key.clone());
                            self.bump_only_node_data_version(child);
                            self.bump_node_data_and_struct(current);
                            current = child;
                        }
                    }
                }
                PathSegment::Index(index) => {
                    if *index < 0 {
                        return (OpStatus::ResolveArrayIndexNegative, NodeId::INVALID);
                    }
                    if !node.is_array() {
                        let coerce = match mode {
                            ResolveMode::ReadOnly => false,
                            ResolveMode::EnsureCreate => node.is_empty(),
                            ResolveMode::ForceOverride => true,
                        };
                        if !coerce {
                            return (OpStatus::SegmentIndexButNodeNotArray, NodeId::INVALID);
                        }
                        if !self.reset_to_empty_array(current).is_ok() {
                            return (OpStatus::ResolveOperatorFailure, NodeId::INVALID);
                        }
                    }
                    let child = match self.arena.node(current).and_then(Node::as_array) {
                        Some(array) => array.get(*index as usize).copied(),
                        None => return (OpStatus::ResolveInternalNullArray, NodeId::INVALID),
                    };
                    // Arrays never sparse-create; an index only resolves
                    // inside the current bounds.
                    match child {
                        Some(child) => current = child,
                        None => return (OpStatus::ResolveArrayIndexOutOfRange, NodeId::INVALID),
                    }
                }
            }
        }

        (OpStatus::Success, current)
    }

    // ---- client value prediction ------------------------------------------

    fn overlay_node_mut(&mut self, id: NodeId) -> &mut Node {
        self.overlay.entry(id).or_default()
    }

    pub(crate) fn clear_overlay(&mut self) {
        self.overlay.clear();
    }

    /// Server: authoritative write with version/type bookkeeping.
    /// Client: prediction into the overlay; never touches arena metadata.
    pub(crate) fn try_set_value_at(
        &mut self,
        id: NodeId,
        type_ref: TypeRef,
        bytes: &[u8],
    ) -> OpStatus {
        if self.running_on_server {
            let registry = Rc::clone(&self.registry);
            let Some(node) = self.arena.node_mut(id) else {
                return OpStatus::InvalidNode;
            };
            let status = node.try_set_value(&registry, type_ref, bytes);
            match status {
                OpStatus::SuccessChangeValue | OpStatus::SuccessOverrideEmpty => {
                    self.set_node_type(id, type_ref);
                    self.bump_node_data_version(id);
                }
                OpStatus::SuccessChangeValueAndType => {
                    self.set_node_type(id, type_ref);
                    self.bump_node_data_and_struct(id);
                }
                _ => {}
            }
            status
        } else {
            // Skip creating an overlay when the authoritative value already
            // matches.
            if !self.overlay.contains_key(&id) {
                if let Some(current) = self.arena.node(id).and_then(|n| n.try_get_value(type_ref)) {
                    if payload_equals(&self.registry, type_ref, current, bytes) {
                        return OpStatus::SameValueNoChange;
                    }
                }
            }
            let registry = Rc::clone(&self.registry);
            self.overlay_node_mut(id).try_set_value(&registry, type_ref, bytes)
        }
    }

    pub(crate) fn try_set_to_empty_at(&mut self, id: NodeId) -> OpStatus {
        if self.running_on_server {
            return self.reset_to_empty(id);
        }
        if !self.overlay.contains_key(&id) {
            if let Some(node) = self.arena.node(id) {
                if node.is_empty() {
                    return OpStatus::SameValueNoChange;
                }
            }
        }
        self.overlay_node_mut(id).reset_empty()
    }

    // ---- structure queries -------------------------------------------------

    /// Reconstruct the path of a node from its reverse parent edges.
    pub(crate) fn path_of(&self, id: NodeId) -> Option<Vec<PathSegment>> {
        if !self.arena.is_valid(id) {
            return None;
        }
        let mut segments = Vec::new();
        let mut current = id;
        while current != self.root {
            if segments.len() > MAX_PATH_DEPTH {
                return None;
            }
            let parent = self.arena.parent(current);
            let parent_node = self.arena.node(parent)?;
            let segment = match self.arena.parent_edge(current) {
                ParentEdge::ArrayIndex(index)
                    if parent_node.as_array().and_then(|a| a.get(usize::from(index)))
                        == Some(&current) =>
                {
                    PathSegment::Index(i32::from(index))
                }
                ParentEdge::MapLabel(label)
                    if parent_node.as_map().and_then(|m| m.get(&label)) == Some(&current) =>
                {
                    PathSegment::Name(label)
                }
                _ => match parent_node {
                    Node::Array(children) => PathSegment::Index(
                        children.iter().position(|c| *c == current)? as i32,
                    ),
                    Node::Map(children) => PathSegment::Name(
                        children
                            .iter()
                            .find(|(_, c)| **c == current)
                            .map(|(k, _)| k.clone())?,
                    ),
                    _ => return None,
                },
            };
            segments.push(segment);
            current = parent;
        }
        segments.reverse();
        Some(segments)
    }

    pub(crate) fn subtree_identical(&self, id: NodeId, other: &TreeCore, other_id: NodeId) -> bool {
        let (Some(a), Some(b)) = (self.arena.node(id), other.arena.node(other_id)) else {
            return false;
        };
        match (a, b) {
            (Node::Empty, Node::Empty) => true,
            (Node::Array(left), Node::Array(right)) => {
                left.len() == right.len()
                    && left
                        .iter()
                        .zip(right.iter())
                        .all(|(l, r)| self.subtree_identical(*l, other, *r))
            }
            (Node::Map(left), Node::Map(right)) => {
                left.len() == right.len()
                    && left.iter().all(|(key, l)| {
                        right
                            .get(key)
                            .is_some_and(|r| self.subtree_identical(*l, other, *r))
                    })
            }
            _ => match (a.value_payload(), b.value_payload()) {
                (Some((ta, ba)), Some((tb, bb))) => {
                    ta == tb && payload_equals(&self.registry, ta, ba, bb)
                }
                _ => false,
            },
        }
    }

    // ---- dumps -------------------------------------------------------------

    pub(crate) fn render(&self, debug: bool) -> String {
        let mut out = String::new();
        if debug {
            let stats = self.arena.stats();
            let _ = writeln!(
                out,
                "tree data_ver={} struct_ver={}\n allocator {{ total_alloc={}, total_free={}, current={}, peak={}, chunks={}, free_remain={} }}",
                self.data_version,
                self.struct_version,
                stats.total_allocated,
                stats.total_deallocated,
                stats.current_active,
                stats.peak_active,
                self.arena.chunk_count(),
                self.arena.free_remaining(),
            );
        } else {
            let _ = writeln!(
                out,
                "tree data_ver={} struct_ver={} nodes={}",
                self.data_version,
                self.struct_version,
                self.arena.current_active()
            );
        }
        if self.root.is_valid() {
            self.render_node(&mut out, self.root, 0, "root", debug);
        } else {
            out.push_str("<no root>\n");
        }
        out
    }

    pub(crate) fn render_node(
        &self,
        out: &mut String,
        id: NodeId,
        depth: usize,
        label: &str,
        debug: bool,
    ) {
        let indent = "   ".repeat(depth);
        let Some(node) = self.arena.node(id) else {
            let _ = writeln!(out, "{indent}- {label} {id:?} <invalid>");
            return;
        };
        let version = self.arena.version(id).unwrap_or(0);
        let suffix = if debug {
            format!(" [id={id:?} ver={version}]")
        } else {
            String::new()
        };
        match node {
            Node::Array(children) => {
                let _ = writeln!(out, "{indent}- {label} array(count={}){suffix}", children.len());
                for (i, child) in children.clone().into_iter().enumerate() {
                    self.render_node(out, child, depth + 1, &format!("[{i}]"), debug);
                }
            }
            Node::Map(children) => {
                let _ = writeln!(out, "{indent}- {label} map(count={}){suffix}", children.len());
                for (key, child) in children.clone() {
                    self.render_node(out, child, depth + 1, key.as_str(), debug);
                }
            }
            Node::Empty => {
                let _ = writeln!(out, "{indent}- {label} empty{suffix}");
            }
            value => {
                let (type_ref, bytes) = value.value_payload().expect("value node has a payload");
                let type_name = self.registry.display_name(type_ref);
                let text = match self.registry.resolve(type_ref) {
                    Some(info) => (info.ops.display)(bytes),
                    None => format!("<{} bytes>", bytes.len()),
                };
                let _ = writeln!(out, "{indent}- {label} {type_name} = {text}{suffix}");
            }
        }
    }
}

/// The replicated hierarchical container.
///
/// A `SyncTree` is a shared handle; [`Visitor`]s hold a weak reference to the
/// same core, which doubles as the live token guarding use-after-destroy.
/// There is deliberately no `Clone`: the tree is identity-based, and copying
/// is explicit deep copy via [`SyncTree::deep_clone`].
pub struct SyncTree {
    core: Rc<RefCell<TreeCore>>,
}

impl SyncTree {
    /// Create a tree holding only an empty root node.
    pub fn new(registry: Rc<TypeRegistry>) -> Self {
        Self {
            core: Rc::new(RefCell::new(TreeCore::new(registry))),
        }
    }

    pub(crate) fn core(&self) -> &Rc<RefCell<TreeCore>> {
        &self.core
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<TreeCore>> {
        Rc::downgrade(&self.core)
    }

    pub(crate) fn from_core(core: Rc<RefCell<TreeCore>>) -> Self {
        Self { core }
    }

    /// A visitor addressing the root.
    pub fn visitor(&self) -> Visitor {
        Visitor::from_parts(self.downgrade(), Vec::new())
    }

    /// A visitor for a `"a/b/$3/c"` style path ( `$N` is an array index).
    pub fn visitor_from_path(&self, path: &str) -> Visitor {
        self.visitor().make_visitor_by_parse_path(path)
    }

    pub fn registry(&self) -> Rc<TypeRegistry> {
        Rc::clone(&self.core.borrow().registry)
    }

    pub fn node_count(&self) -> u32 {
        self.core.borrow().arena.current_active()
    }

    pub fn node_count_recursive(&self, id: NodeId) -> u32 {
        self.core.borrow().count_recursive(id)
    }

    pub fn data_version(&self) -> u32 {
        self.core.borrow().data_version
    }

    pub fn struct_version(&self) -> u32 {
        self.core.borrow().struct_version
    }

    pub fn is_running_on_server(&self) -> bool {
        self.core.borrow().running_on_server
    }

    pub fn stats(&self) -> ArenaStats {
        self.core.borrow().arena.stats()
    }

    pub fn chunk_count(&self) -> usize {
        self.core.borrow().arena.chunk_count()
    }

    pub fn free_remaining(&self) -> u32 {
        self.core.borrow().arena.free_remaining()
    }

    pub fn root_id(&self) -> NodeId {
        self.core.borrow().root
    }

    pub fn is_node_valid(&self, id: NodeId) -> bool {
        self.core.borrow().arena.is_valid(id)
    }

    pub fn node_parent(&self, id: NodeId) -> NodeId {
        self.core.borrow().arena.parent(id)
    }

    pub fn node_value_type(&self, id: NodeId) -> Option<TypeRef> {
        self.core.borrow().arena.value_type(id)
    }

    /// Drop all nodes including the root. The tree is unusable until a full
    /// replication read rebuilds it.
    pub fn clear(&self) {
        let mut core = self.core.borrow_mut();
        core.arena.reset();
        core.root = NodeId::INVALID;
        core.overlay.clear();
        core.changed_nodes.clear();
    }

    /// Deep copy into a fresh tree sharing the same registry.
    pub fn deep_clone(&self) -> SyncTree {
        let clone = SyncTree::new(self.registry());
        clone.copy_from(self);
        clone
    }

    /// Reset this tree and deep-copy everything from `other`.
    pub fn copy_from(&self, other: &SyncTree) {
        if Rc::ptr_eq(&self.core, &other.core) {
            return;
        }
        let mut dst = self.core.borrow_mut();
        let src = other.core.borrow();
        if !src.root.is_valid() {
            return;
        }
        dst.arena.reset();
        dst.root = dst.deep_copy_node(CopySource::Other(&src), src.root);
    }

    /// Structural equality of the two trees' contents (ids are not compared).
    pub fn identical_to(&self, other: &SyncTree) -> bool {
        if Rc::ptr_eq(&self.core, &other.core) {
            return true;
        }
        let a = self.core.borrow();
        let b = other.core.borrow();
        a.subtree_identical(a.root, &b, b.root)
    }

    // ---- structural operations --------------------------------------------

    /// Replace the subtree at `target` with a deep copy of `src_id` from
    /// `src_tree`.
    pub fn copy_node(&self, target: NodeId, src_tree: &SyncTree, src_id: NodeId) -> bool {
        if !self.is_running_on_server() {
            return false;
        }
        if Rc::ptr_eq(&self.core, &src_tree.core) {
            return self.core.borrow_mut().copy_node_same(target, src_id);
        }
        let new_id = {
            let mut dst = self.core.borrow_mut();
            let src = src_tree.core.borrow();
            if !dst.arena.is_valid(target) || !src.arena.is_valid(src_id) {
                return false;
            }
            dst.deep_copy_node(CopySource::Other(&src), src_id)
        };
        if !new_id.is_valid() {
            return false;
        }
        let mut dst = self.core.borrow_mut();
        if !dst.redirect(target, new_id) {
            dst.release_recursive(new_id);
            return false;
        }
        true
    }

    /// Swap the subtrees at `target` and `other_id`, always through
    /// authoritative deep copies (never a move), so parent links, reverse
    /// edges, and versions stay consistent.
    pub fn swap_node(&self, target: NodeId, other_tree: &SyncTree, other_id: NodeId) -> bool {
        if !self.is_running_on_server() {
            return false;
        }
        if Rc::ptr_eq(&self.core, &other_tree.core) {
            return self.core.borrow_mut().swap_node_same(target, other_id);
        }

        {
            let dst = self.core.borrow();
            let src = other_tree.core.borrow();
            if !dst.arena.is_valid(target) || !src.arena.is_valid(other_id) {
                return false;
            }
            if dst.arena.free_remaining() <= src.count_recursive(other_id)
                || src.arena.free_remaining() <= dst.count_recursive(target)
            {
                return false;
            }
        }

        let new_here = {
            let mut dst = self.core.borrow_mut();
            let src = other_tree.core.borrow();
            dst.deep_copy_node(CopySource::Other(&src), other_id)
        };
        let new_there = {
            let mut src = other_tree.core.borrow_mut();
            let dst = self.core.borrow();
            src.deep_copy_node(CopySource::Other(&dst), target)
        };
        if !new_here.is_valid() || !new_there.is_valid() {
            self.core.borrow_mut().release_recursive(new_here);
            other_tree.core.borrow_mut().release_recursive(new_there);
            return false;
        }

        let ok_here = self.core.borrow_mut().redirect(target, new_here);
        let ok_there = other_tree.core.borrow_mut().redirect(other_id, new_there);
        if !ok_here || !ok_there {
            log::error!("cross-tree swap redirect failed");
            if !ok_here {
                self.core.borrow_mut().release_recursive(new_here);
            }
            if !ok_there {
                other_tree.core.borrow_mut().release_recursive(new_there);
            }
            return false;
        }
        true
    }

    /// As swap, but the destination keeps its id and the source subtree is
    /// released after a successful redirect.
    pub fn move_node(&self, target: NodeId, other_tree: &SyncTree, other_id: NodeId) -> bool {
        if !self.is_running_on_server() {
            return false;
        }
        if Rc::ptr_eq(&self.core, &other_tree.core) {
            return self.core.borrow_mut().move_node_same(target, other_id);
        }

        let new_id = {
            let mut dst = self.core.borrow_mut();
            let src = other_tree.core.borrow();
            if !dst.arena.is_valid(target) || !src.arena.is_valid(other_id) {
                return false;
            }
            dst.deep_copy_node(CopySource::Other(&src), other_id)
        };
        if !new_id.is_valid() {
            return false;
        }
        {
            let mut dst = self.core.borrow_mut();
            if !dst.redirect(target, new_id) {
                dst.release_recursive(new_id);
                return false;
            }
        }
        other_tree.core.borrow_mut().release_recursive(other_id);
        true
    }

    // ---- replication surface ----------------------------------------------

    /// Single entry point for both replication directions; see
    /// [`NetDeltaParams`].
    pub fn net_delta_serialize(&self, params: &mut NetDeltaParams<'_, '_>) -> bool {
        delta::net_delta_serialize(self, params)
    }

    /// The pre-apply value captured for a node during the last delta apply.
    pub fn try_get_old_value(&self, id: NodeId) -> Option<(TypeRef, Box<[u8]>)> {
        self.core.borrow().old_values.get(&id).cloned()
    }

    pub fn clear_frame_changed_nodes(&self) {
        self.core.borrow_mut().changed_nodes.clear();
    }

    pub(crate) fn frame_changed_nodes(&self) -> Vec<NodeId> {
        self.core.borrow().changed_nodes.iter().copied().collect()
    }

    // ---- listeners ---------------------------------------------------------

    /// Register `callback` for changes at `position` and up to `depth` levels
    /// below it (depth 0 is exactly that node). `owner` groups bindings for
    /// [`SyncTree::unbind_all_for`]. Dispatch order follows registration
    /// order.
    pub fn bind_on_changed(
        &self,
        position: &Visitor,
        depth: i32,
        owner: u64,
        callback: impl Fn(&Visitor) + 'static,
    ) -> bool {
        if !position.belongs_to(self) {
            return false;
        }
        self.core.borrow_mut().bindings.push(OnChangedBinding {
            path: position.path().to_vec(),
            depth,
            owner,
            callback: Rc::new(callback),
        });
        true
    }

    pub fn unbind_on_changed(&self, position: &Visitor) {
        let path = position.path().to_vec();
        self.core
            .borrow_mut()
            .bindings
            .retain(|binding| binding.path != path);
    }

    pub fn unbind_all_for(&self, owner: u64) {
        self.core
            .borrow_mut()
            .bindings
            .retain(|binding| binding.owner != owner);
    }

    // ---- host wiring -------------------------------------------------------

    pub(crate) fn set_dirty_flag(&self, flag: Option<Rc<Cell<bool>>>) {
        self.core.borrow_mut().dirty_flag = flag;
    }

    // ---- dumps -------------------------------------------------------------

    /// Indented dump of the whole tree.
    pub fn render(&self) -> String {
        self.core.borrow().render(false)
    }

    /// As [`SyncTree::render`], with node ids, versions, and allocator
    /// statistics.
    pub fn render_debug(&self) -> String {
        self.core.borrow().render(true)
    }
}

impl PartialEq for SyncTree {
    /// Version-counter equality, the cheap identity check used by the
    /// replication layer.
    fn eq(&self, other: &Self) -> bool {
        let a = self.core.borrow();
        let b = other.core.borrow();
        a.data_version == b.data_version && a.struct_version == b.struct_version
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

    fn server_tree() -> SyncTree {
        SyncTree::new(Rc::new(TypeRegistry::with_builtins()))
    }

    #[test]
    fn new_tree_has_an_empty_root() {
        let tree = server_tree();
        assert_eq!(tree.node_count(), 1);
        let root = tree.root_id();
        assert!(tree.is_node_valid(root));
        assert_eq!(tree.node_parent(root), NodeId::INVALID);
        assert_eq!(tree.node_value_type(root), Some(TypeRef::EMPTY));
    }

    #[test]
    fn set_value_bumps_versions() {
        let tree = server_tree();
        let data_before = tree.data_version();
        let struct_before = tree.struct_version();

        let report = tree
            .visitor()
            .make_visitor_by_name("hp")
            .ensure_and_set_i64(100);
        assert_eq!(report.status, OpStatus::SuccessChangeValueAndType);
        assert!(tree.data_version() > data_before);
        assert!(tree.struct_version() > struct_before);
        assert_eq!(
            tree.visitor().make_visitor_by_name("hp").try_get_i64(),
            Some(100)
        );
    }

    #[test]
    fn deep_clone_preserves_structure_and_counts() {
        let tree = server_tree();
        let root = tree.visitor();
        root.make_visitor_by_name("hp").ensure_and_set_i64(10);
        root.make_visitor_by_name("name")
            .ensure_and_set_str("boblin");
        let list = root.make_visitor_by_name("list").ensure_array();
        list.array_add().try_set_i64(1);
        list.array_add().try_set_i64(2);

        let clone = tree.deep_clone();
        assert_eq!(clone.node_count(), tree.node_count());
        assert_eq!(
            clone.node_count_recursive(clone.root_id()),
            tree.node_count_recursive(tree.root_id())
        );
        assert!(clone.identical_to(&tree));

        // Mutating the clone leaves the original alone.
        clone
            .visitor()
            .make_visitor_by_name("hp")
            .try_set_i64(99);
        assert!(!clone.identical_to(&tree));
        assert_eq!(
            tree.visitor().make_visitor_by_name("hp").try_get_i64(),
            Some(10)
        );
    }

    #[test]
    fn parent_links_match_containers() {
        let tree = server_tree();
        let list = tree
            .visitor()
            .make_visitor_by_name("list")
            .ensure_array();
        let a = list.array_add();
        let b = list.array_add();
        a.try_set_i64(1);
        b.try_set_i64(2);

        let core = tree.core().borrow();
        core.arena.for_each_node(|id, _, _, parent, _| {
            if id == core.root {
                assert_eq!(parent, NodeId::INVALID);
                return;
            }
            let parent_node = core.arena.node(parent).expect("live parent");
            match core.arena.parent_edge(id) {
                ParentEdge::ArrayIndex(index) => {
                    assert_eq!(
                        parent_node.as_array().unwrap()[usize::from(index)],
                        id
                    );
                }
                ParentEdge::MapLabel(label) => {
                    assert_eq!(parent_node.as_map().unwrap()[&label], id);
                }
                ParentEdge::None => panic!("non-root node without a parent edge"),
            }
        });
    }

    #[test]
    fn release_recursive_frees_the_subtree_and_bumps_struct() {
        let tree = server_tree();
        let map = tree.visitor().make_visitor_by_name("stuff").ensure_map();
        map.make_visitor_by_name("a").ensure_and_set_i64(1);
        map.make_visitor_by_name("b").ensure_and_set_i64(2);
        let before_count = tree.node_count();
        let before_struct = tree.struct_version();

        let id = map.cached_node_id();
        let released = tree.core().borrow_mut().release_recursive(id);
        assert_eq!(released, 3);
        assert_eq!(tree.node_count(), before_count - 3);
        assert!(tree.struct_version() > before_struct);
    }

    #[test]
    fn redirect_replaces_the_container_entry_once() {
        let tree = server_tree();
        let slot = tree.visitor().make_visitor_by_name("slot");
        slot.ensure_and_set_i64(5);
        let old_id = slot.cached_node_id();

        let (new_id, ok) = {
            let mut core = tree.core().borrow_mut();
            let new_id = core.deep_copy_node(CopySource::Own, old_id);
            let ok = core.redirect(old_id, new_id);
            (new_id, ok)
        };
        assert!(ok);
        assert!(!tree.is_node_valid(old_id));

        let core = tree.core().borrow();
        let root_map = core.arena.node(core.root).unwrap().as_map().unwrap();
        let occurrences = root_map.values().filter(|c| **c == new_id).count();
        assert_eq!(occurrences, 1);
        assert_eq!(core.arena.parent(new_id), core.root);
    }

    #[test]
    fn swap_node_same_tree_rejects_ancestry() {
        let tree = server_tree();
        let outer = tree.visitor().make_visitor_by_name("outer").ensure_map();
        let inner = outer.make_visitor_by_name("inner");
        inner.ensure_and_set_i64(1);

        let outer_id = outer.cached_node_id();
        let inner_id = inner.cached_node_id();
        assert!(!tree.swap_node(outer_id, &tree, inner_id));
    }

    #[test]
    fn swap_node_swaps_subtrees_under_new_ids() {
        let tree = server_tree();
        let a = tree.visitor().make_visitor_by_name("A").ensure_map();
        a.make_visitor_by_name("x").ensure_and_set_i64(1);
        let b = tree.visitor().make_visitor_by_name("B").ensure_map();
        b.make_visitor_by_name("y").ensure_and_set_i64(2);

        let a_id = a.cached_node_id();
        let b_id = b.cached_node_id();
        assert!(tree.swap_node(a_id, &tree, b_id));

        // Both old ids are gone, both labels now carry the other payload.
        assert!(!tree.is_node_valid(a_id));
        assert!(!tree.is_node_valid(b_id));
        let root = tree.visitor();
        assert_eq!(
            root.make_visitor_by_name("A")
                .make_visitor_by_name("y")
                .try_get_i64(),
            Some(2)
        );
        assert_eq!(
            root.make_visitor_by_name("B")
                .make_visitor_by_name("x")
                .try_get_i64(),
            Some(1)
        );
        assert!(root.make_visitor_by_name("A").make_visitor_by_name("x").try_get_i64().is_none());
    }

    #[test]
    fn move_node_releases_the_source() {
        let tree = server_tree();
        let src = tree.visitor().make_visitor_by_name("src");
        src.ensure_and_set_i64(42);
        let dst = tree.visitor().make_visitor_by_name("dst");
        dst.ensure_and_set_i64(0);

        let src_id = src.cached_node_id();
        let dst_id = dst.cached_node_id();
        assert!(tree.move_node(dst_id, &tree, src_id));
        assert!(!tree.is_node_valid(src_id));
        assert_eq!(
            tree.visitor().make_visitor_by_name("dst").try_get_i64(),
            Some(42)
        );
    }

    #[test]
    fn cross_tree_copy_node() {
        let a = server_tree();
        let b = server_tree();
        let src = a.visitor().make_visitor_by_name("payload").ensure_map();
        src.make_visitor_by_name("v").ensure_and_set_i64(7);

        let dst = b.visitor().make_visitor_by_name("landing");
        dst.ensure_and_set_i64(0);
        assert!(b.copy_node(dst.cached_node_id(), &a, src.cached_node_id()));
        assert_eq!(
            b.visitor()
                .make_visitor_by_name("landing")
                .make_visitor_by_name("v")
                .try_get_i64(),
            Some(7)
        );
        // Source untouched.
        assert_eq!(
            a.visitor()
                .make_visitor_by_name("payload")
                .make_visitor_by_name("v")
                .try_get_i64(),
            Some(7)
        );
    }

    #[test]
    fn resolve_rejects_deep_and_malformed_paths() {
        let tree = server_tree();
        let mut deep = tree.visitor();
        for i in 0..(MAX_PATH_DEPTH + 1) {
            deep = deep.make_visitor_by_name(&format!("level{i}"));
        }
        assert_eq!(
            deep.ensure_and_set_i64(1).status,
            OpStatus::ResolvePathTooDeep
        );

        let list = tree.visitor().make_visitor_by_name("list").ensure_array();
        list.array_add().try_set_i64(1);
        assert_eq!(
            list.make_visitor_by_index(-1).ensure_and_set_i64(2).status,
            OpStatus::ResolveArrayIndexNegative
        );
        // Sparse creation is forbidden even in ensure mode.
        assert_eq!(
            list.make_visitor_by_index(5).ensure_and_set_i64(2).status,
            OpStatus::ResolveArrayIndexOutOfRange
        );
        // Kind mismatch without side effects in read-only resolution.
        assert_eq!(
            list.make_visitor_by_name("oops").try_get_i64(),
            None
        );
    }

    #[test]
    fn version_equality_shortcut() {
        let a = server_tree();
        let b = server_tree();
        assert!(a == b);
        a.visitor().make_visitor_by_name("x").ensure_and_set_i64(1);
        assert!(a != b);
    }

    #[test]
    fn render_shows_labels_and_values() {
        let tree = server_tree();
        tree.visitor().make_visitor_by_name("hp").ensure_and_set_i64(100);
        let text = tree.render();
        assert!(text.contains("root"));
        assert!(text.contains("hp"));
        assert!(text.contains("100"));
        let debug = tree.render_debug();
        assert!(debug.contains("allocator"));
        assert!(debug.contains("ver="));
    }
}
