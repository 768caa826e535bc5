use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::error::{OpReport, OpStatus, WireError};
use crate::name::Name;
use crate::node::Node;
use crate::node_id::NodeId;
use crate::tree::{ResolveMode, SyncTree, TreeCore};
use crate::types::{builtin, TypeRef};
use crate::wire::{WireReader, WireWriter};

/// Longest visitor path accepted on the wire.
pub(crate) const MAX_WIRE_PATH_LEN: u32 = 2048;

/// One step of a visitor path: a map key or an array index.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum PathSegment {
    Name(Name),
    Index(i32),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Name(name) => f.write_str(name.as_str()),
            PathSegment::Index(index) => write!(f, "${index}"),
        }
    }
}

/// A lightweight path-based handle to one node of a [`SyncTree`].
///
/// The visitor holds a weak reference to the tree core — the live token — and
/// a lazily resolved path. The resolved [`NodeId`] is cached and revalidated
/// against the tree's structure version: value-only mutations keep the cache,
/// topology changes force a re-walk from the root (remembering the previous
/// id so old-value lookups still work).
pub struct Visitor {
    core: Weak<RefCell<TreeCore>>,
    path: Vec<PathSegment>,
    cached_id: Cell<NodeId>,
    cached_struct_version: Cell<u32>,
    old_id: Cell<NodeId>,
}

impl Default for Visitor {
    fn default() -> Self {
        Self {
            core: Weak::new(),
            path: Vec::new(),
            cached_id: Cell::new(NodeId::INVALID),
            cached_struct_version: Cell::new(0),
            old_id: Cell::new(NodeId::INVALID),
        }
    }
}

impl Clone for Visitor {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            path: self.path.clone(),
            cached_id: Cell::new(self.cached_id.get()),
            cached_struct_version: Cell::new(self.cached_struct_version.get()),
            old_id: Cell::new(self.old_id.get()),
        }
    }
}

impl PartialEq for Visitor {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.core, &other.core) && self.path == other.path
    }
}

impl Visitor {
    pub(crate) fn from_parts(core: Weak<RefCell<TreeCore>>, path: Vec<PathSegment>) -> Self {
        Self {
            core,
            path,
            ..Self::default()
        }
    }

    fn child(&self, segment: PathSegment) -> Visitor {
        let mut path = self.path.clone();
        path.push(segment);
        Visitor::from_parts(self.core.clone(), path)
    }

    // ---- resolution --------------------------------------------------------

    /// Resolve the path, reusing the cached id when the structure version
    /// still matches and the id is still live.
    fn resolve(&self, mode: ResolveMode) -> Result<(Rc<RefCell<TreeCore>>, NodeId), OpStatus> {
        let Some(rc) = self.core.upgrade() else {
            return Err(OpStatus::InvalidVisitor);
        };
        {
            let core = rc.borrow();
            let cached = self.cached_id.get();
            if cached.is_valid()
                && self.cached_struct_version.get() == core.struct_version
                && core.arena.is_valid(cached)
            {
                drop(core);
                return Ok((rc, cached));
            }
        }

        // The cache is stale; keep the previous id around for old-value
        // lookups across the structure change.
        if self.cached_id.get().is_valid() {
            self.old_id.set(self.cached_id.get());
        }

        let (status, id) = rc.borrow_mut().resolve(&self.path, mode);
        if !status.is_ok() {
            return Err(status);
        }
        self.cached_id.set(id);
        self.cached_struct_version.set(rc.borrow().struct_version);
        Ok((rc, id))
    }

    fn with_read_node<T>(&self, f: impl FnOnce(&TreeCore, NodeId, &Node) -> T) -> Option<T> {
        let (rc, id) = self.resolve(ResolveMode::ReadOnly).ok()?;
        let core = rc.borrow();
        let node = core.node_for_read(id)?;
        Some(f(&core, id, node))
    }

    // ---- identity ----------------------------------------------------------

    /// Whether the visitor still points at a live tree.
    pub fn is_valid(&self) -> bool {
        self.core.strong_count() > 0
    }

    /// Whether the path currently resolves to a node.
    pub fn has_data(&self) -> bool {
        self.resolve(ResolveMode::ReadOnly).is_ok()
    }

    pub(crate) fn belongs_to(&self, tree: &SyncTree) -> bool {
        self.core
            .upgrade()
            .is_some_and(|rc| Rc::ptr_eq(&rc, tree.core()))
    }

    pub fn path(&self) -> &[PathSegment] {
        &self.path
    }

    pub fn path_segment_count(&self) -> usize {
        self.path.len()
    }

    /// The most recently resolved id (may be stale).
    pub fn cached_node_id(&self) -> NodeId {
        self.cached_id.get()
    }

    /// The id recorded just before the last cache invalidation.
    pub fn old_node_id(&self) -> NodeId {
        self.old_id.get()
    }

    /// `"a/b/$3/c"` form of the path; empty for the root.
    pub fn path_string(&self) -> String {
        use itertools::Itertools;
        self.path.iter().map(ToString::to_string).join("/")
    }

    /// Strict-ancestor test via path prefixes; both visitors must resolve on
    /// the same tree.
    pub fn is_ancestor_of(&self, other: &Visitor) -> bool {
        if !Weak::ptr_eq(&self.core, &other.core) {
            return false;
        }
        if self.resolve(ResolveMode::ReadOnly).is_err()
            || other.resolve(ResolveMode::ReadOnly).is_err()
        {
            return false;
        }
        self.path.len() < other.path.len() && other.path[..self.path.len()] == self.path[..]
    }

    /// Depth of this visitor below `ancestor`, or -1 when `ancestor` is not a
    /// strict ancestor.
    pub fn depth_relative_to(&self, ancestor: &Visitor) -> i32 {
        if ancestor.is_ancestor_of(self) {
            (self.path.len() - ancestor.path.len()) as i32
        } else {
            -1
        }
    }

    // ---- navigation --------------------------------------------------------

    pub fn make_visitor_to_parent(&self) -> Visitor {
        if self.path.is_empty() || self.resolve(ResolveMode::ReadOnly).is_err() {
            return Visitor::default();
        }
        let mut path = self.path.clone();
        path.pop();
        Visitor::from_parts(self.core.clone(), path)
    }

    pub fn make_visitor_by_name(&self, key: &str) -> Visitor {
        let name = Name::new(key);
        let child = self.child(PathSegment::Name(name.clone()));
        // Extend the parent's cache when it is still valid.
        if let Some(rc) = self.core.upgrade() {
            let core = rc.borrow();
            if self.cached_struct_version.get() == core.struct_version {
                if let Some(map) = core
                    .node_for_read(self.cached_id.get())
                    .and_then(Node::as_map)
                {
                    if let Some(id) = map.get(&name) {
                        child.cached_id.set(*id);
                        child.cached_struct_version.set(core.struct_version);
                    }
                }
            }
        }
        child
    }

    pub fn make_visitor_by_index(&self, index: i32) -> Visitor {
        let child = self.child(PathSegment::Index(index));
        if index >= 0 {
            if let Some(rc) = self.core.upgrade() {
                let core = rc.borrow();
                if self.cached_struct_version.get() == core.struct_version {
                    if let Some(array) = core
                        .node_for_read(self.cached_id.get())
                        .and_then(Node::as_array)
                    {
                        if let Some(id) = array.get(index as usize) {
                            child.cached_id.set(*id);
                            child.cached_struct_version.set(core.struct_version);
                        }
                    }
                }
            }
        }
        child
    }

    pub fn make_visitor_by_full_path(&self, path: Vec<PathSegment>) -> Visitor {
        if !self.is_valid() {
            return Visitor::default();
        }
        Visitor::from_parts(self.core.clone(), path)
    }

    /// Append a parsed `"a/b/$3"` path to this visitor's path. Empty
    /// segments invalidate the whole visitor.
    pub fn make_visitor_by_parse_path(&self, path: &str) -> Visitor {
        if !self.is_valid() {
            return Visitor::default();
        }
        if path.is_empty() {
            log::warn!("visitor path parse: empty path");
            return Visitor::default();
        }
        let mut segments = self.path.clone();
        for part in path.split('/') {
            if part.is_empty() {
                log::warn!("visitor path parse: empty segment in {path:?}");
                return Visitor::default();
            }
            match parse_index_segment(part) {
                Some(index) => segments.push(PathSegment::Index(index)),
                None => segments.push(PathSegment::Name(Name::new(part))),
            }
        }
        Visitor::from_parts(self.core.clone(), segments)
    }

    // ---- state queries -----------------------------------------------------

    pub fn is_empty_node(&self) -> bool {
        self.with_read_node(|_, _, node| node.is_empty()).unwrap_or(false)
    }

    pub fn is_empty_map(&self) -> bool {
        self.with_read_node(|_, _, node| node.is_empty_map()).unwrap_or(false)
    }

    pub fn is_empty_array(&self) -> bool {
        self.with_read_node(|_, _, node| node.is_empty_array())
            .unwrap_or(false)
    }

    pub fn is_non_empty_map(&self) -> bool {
        self.with_read_node(|_, _, node| node.is_map() && !node.is_empty_map())
            .unwrap_or(false)
    }

    pub fn is_non_empty_array(&self) -> bool {
        self.with_read_node(|_, _, node| node.is_array() && !node.is_empty_array())
            .unwrap_or(false)
    }

    pub fn is_map(&self) -> bool {
        self.with_read_node(|_, _, node| node.is_map()).unwrap_or(false)
    }

    pub fn is_array(&self) -> bool {
        self.with_read_node(|_, _, node| node.is_array()).unwrap_or(false)
    }

    pub fn is_value(&self) -> bool {
        self.with_read_node(|_, _, node| node.is_value()).unwrap_or(false)
    }

    // ---- generic reads and writes ------------------------------------------

    /// The payload bytes if the node holds a value of exactly `type_ref`.
    pub fn try_get_value(&self, type_ref: TypeRef) -> Option<Box<[u8]>> {
        self.with_read_node(|_, _, node| node.try_get_value(type_ref).map(Box::from))
            .flatten()
    }

    /// The payload and its type, whatever the type is.
    pub fn try_get_value_generic(&self) -> Option<(TypeRef, Box<[u8]>)> {
        self.with_read_node(|_, _, node| {
            node.value_payload().map(|(t, bytes)| (t, Box::from(bytes)))
        })
        .flatten()
    }

    /// Write a typed value at an existing node. On the client this predicts
    /// into the overlay instead of touching authoritative state.
    pub fn try_set_value(&self, type_ref: TypeRef, bytes: &[u8]) -> OpReport {
        match self.resolve(ResolveMode::ReadOnly) {
            Ok((rc, id)) => rc.borrow_mut().try_set_value_at(id, type_ref, bytes).into(),
            Err(status) => status.into(),
        }
    }

    /// As [`Visitor::try_set_value`], creating missing path segments on the
    /// server first.
    pub fn ensure_and_set_value(&self, type_ref: TypeRef, bytes: &[u8]) -> OpReport {
        match self.resolve(ResolveMode::EnsureCreate) {
            Ok((rc, id)) => rc.borrow_mut().try_set_value_at(id, type_ref, bytes).into(),
            Err(status) => status.into(),
        }
    }

    /// Reset the node to the empty variant (client: overlay-only).
    pub fn try_set_to_empty(&self) -> OpReport {
        match self.resolve(ResolveMode::ReadOnly) {
            Ok((rc, id)) => rc.borrow_mut().try_set_to_empty_at(id).into(),
            Err(status) => status.into(),
        }
    }

    // ---- old values --------------------------------------------------------

    fn try_get_old_payload(&self, type_ref: TypeRef) -> Option<Box<[u8]>> {
        let rc = self.core.upgrade()?;
        let core = rc.borrow();
        let id = if self.old_id.get().is_valid() {
            self.old_id.get()
        } else {
            self.cached_id.get()
        };
        let (captured_type, bytes) = core.old_values.get(&id)?;
        (*captured_type == type_ref).then(|| bytes.clone())
    }

    // ---- structure ---------------------------------------------------------

    /// Make sure this node is an array (promoting an empty node on the
    /// server); returns an invalid visitor on failure.
    pub fn ensure_array(&self) -> Visitor {
        let Ok((rc, id)) = self.resolve(ResolveMode::EnsureCreate) else {
            return Visitor::default();
        };
        let mut core = rc.borrow_mut();
        let kind = core.arena.node(id).map(|node| (node.is_array(), node.is_empty()));
        let ok = match kind {
            Some((true, _)) => true,
            Some((_, true)) if core.running_on_server => core.reset_to_empty_array(id).is_ok(),
            _ => false,
        };
        drop(core);
        if ok {
            self.clone()
        } else {
            Visitor::default()
        }
    }

    /// Map counterpart of [`Visitor::ensure_array`].
    pub fn ensure_map(&self) -> Visitor {
        let Ok((rc, id)) = self.resolve(ResolveMode::EnsureCreate) else {
            return Visitor::default();
        };
        let mut core = rc.borrow_mut();
        let kind = core.arena.node(id).map(|node| (node.is_map(), node.is_empty()));
        let ok = match kind {
            Some((true, _)) => true,
            Some((_, true)) if core.running_on_server => core.reset_to_empty_map(id).is_ok(),
            _ => false,
        };
        drop(core);
        if ok {
            self.clone()
        } else {
            Visitor::default()
        }
    }

    fn other_tree(&self, other: &Visitor) -> Option<(SyncTree, SyncTree)> {
        Some((
            SyncTree::from_core(self.core.upgrade()?),
            SyncTree::from_core(other.core.upgrade()?),
        ))
    }

    /// Replace this subtree with a deep copy of `src`.
    pub fn ensure_and_copy_from(&self, src: &Visitor) -> OpReport {
        let Some((this_tree, src_tree)) = self.other_tree(src) else {
            return OpStatus::InvalidVisitor.into();
        };
        if !this_tree.is_running_on_server() {
            return OpStatus::PermissionDenied.into();
        }
        let Ok((_, target)) = self.resolve(ResolveMode::EnsureCreate) else {
            return OpStatus::InvalidVisitor.into();
        };
        let Ok((_, src_id)) = src.resolve(ResolveMode::ReadOnly) else {
            return OpStatus::InvalidVisitor.into();
        };
        if target == src_id && self.belongs_to(&src_tree) {
            return OpStatus::SameValueNoChange.into();
        }
        if this_tree.copy_node(target, &src_tree, src_id) {
            OpStatus::Success.into()
        } else {
            OpStatus::UnknownFailure.into()
        }
    }

    /// Swap this subtree with `other` through authoritative copies.
    pub fn ensure_and_swap_with(&self, other: &Visitor) -> OpReport {
        let Some((this_tree, other_tree)) = self.other_tree(other) else {
            return OpStatus::InvalidVisitor.into();
        };
        if !this_tree.is_running_on_server() {
            return OpStatus::PermissionDenied.into();
        }
        let Ok((_, target)) = self.resolve(ResolveMode::EnsureCreate) else {
            return OpStatus::InvalidVisitor.into();
        };
        let Ok((_, other_id)) = other.resolve(ResolveMode::ReadOnly) else {
            return OpStatus::InvalidVisitor.into();
        };
        if target == other_id && self.belongs_to(&other_tree) {
            return OpStatus::SameValueNoChange.into();
        }
        if this_tree.swap_node(target, &other_tree, other_id) {
            OpStatus::Success.into()
        } else {
            OpStatus::UnknownFailure.into()
        }
    }

    /// Move `src` over this node; the source subtree is released.
    pub fn ensure_and_move_from(&self, src: &Visitor) -> OpReport {
        let Some((this_tree, src_tree)) = self.other_tree(src) else {
            return OpStatus::InvalidVisitor.into();
        };
        if !this_tree.is_running_on_server() {
            return OpStatus::PermissionDenied.into();
        }
        let Ok((_, target)) = self.resolve(ResolveMode::EnsureCreate) else {
            return OpStatus::InvalidVisitor.into();
        };
        let Ok((_, src_id)) = src.resolve(ResolveMode::ReadOnly) else {
            return OpStatus::InvalidVisitor.into();
        };
        if target == src_id && self.belongs_to(&src_tree) {
            return OpStatus::SameValueNoChange.into();
        }
        if this_tree.move_node(target, &src_tree, src_id) {
            OpStatus::Success.into()
        } else {
            OpStatus::UnknownFailure.into()
        }
    }

    // ---- array surface -----------------------------------------------------

    pub fn array_num(&self) -> i32 {
        self.with_read_node(|_, _, node| node.as_array().map_or(0, |a| a.len() as i32))
            .unwrap_or(0)
    }

    /// Append a fresh empty element and return a visitor to it.
    pub fn array_add(&self) -> Visitor {
        let Ok((rc, id)) = self.resolve(ResolveMode::EnsureCreate) else {
            return Visitor::default();
        };
        let mut core = rc.borrow_mut();
        if !core.running_on_server {
            return Visitor::default();
        }
        let kind = core.arena.node(id).map(|node| (node.is_array(), node.is_empty()));
        match kind {
            Some((true, _)) => {}
            Some((_, true)) => {
                if !core.reset_to_empty_array(id).is_ok() {
                    return Visitor::default();
                }
            }
            _ => return Visitor::default(),
        }
        let child = core.arena.allocate();
        if !child.is_valid() {
            return Visitor::default();
        }
        let index = match core.arena.node_mut(id).and_then(Node::as_array_mut) {
            Some(array) => {
                array.push(child);
                array.len() - 1
            }
            None => {
                core.arena.deallocate(child);
                return Visitor::default();
            }
        };
        core.arena.set_parent(child, id);
        core.arena.set_parent_edge_array(child, index as u16);
        core.bump_only_node_data_version(child);
        core.bump_node_data_and_struct(id);
        let struct_version = core.struct_version;
        drop(core);

        let visitor = self.child(PathSegment::Index(index as i32));
        visitor.cached_id.set(child);
        visitor.cached_struct_version.set(struct_version);
        visitor
    }

    /// Insert a fresh empty element at `index` (`0..=len`), shifting the
    /// reverse edges of everything behind it.
    pub fn array_insert(&self, index: i32) -> Visitor {
        if index < 0 {
            return Visitor::default();
        }
        let Ok((rc, id)) = self.resolve(ResolveMode::EnsureCreate) else {
            return Visitor::default();
        };
        let mut core = rc.borrow_mut();
        if !core.running_on_server {
            return Visitor::default();
        }
        let len = match core.arena.node(id).and_then(Node::as_array) {
            Some(array) => array.len(),
            None => return Visitor::default(),
        };
        if index as usize > len {
            return Visitor::default();
        }
        let child = core.arena.allocate();
        if !child.is_valid() {
            return Visitor::default();
        }
        let shifted: Vec<NodeId> = match core.arena.node_mut(id).and_then(Node::as_array_mut) {
            Some(array) => {
                array.insert(index as usize, child);
                array[index as usize..].to_vec()
            }
            None => {
                core.arena.deallocate(child);
                return Visitor::default();
            }
        };
        for (offset, moved) in shifted.into_iter().enumerate() {
            core.arena
                .set_parent_edge_array(moved, index as u16 + offset as u16);
        }
        core.arena.set_parent(child, id);
        core.bump_only_node_data_version(child);
        core.bump_node_data_and_struct(id);
        let struct_version = core.struct_version;
        drop(core);

        let visitor = self.child(PathSegment::Index(index));
        visitor.cached_id.set(child);
        visitor.cached_struct_version.set(struct_version);
        visitor
    }

    /// Remove and release the last element.
    pub fn array_remove(&self) -> bool {
        let Ok((rc, id)) = self.resolve(ResolveMode::ReadOnly) else {
            return false;
        };
        let mut core = rc.borrow_mut();
        if !core.running_on_server {
            return false;
        }
        let popped = match core.arena.node_mut(id).and_then(Node::as_array_mut) {
            Some(array) => array.pop(),
            None => return false,
        };
        let Some(child) = popped else {
            return false;
        };
        core.release_recursive(child);
        core.bump_node_data_and_struct(id);
        true
    }

    /// Release every element, keeping the (now empty) array node.
    pub fn array_clear(&self) -> bool {
        let Ok((rc, id)) = self.resolve(ResolveMode::ReadOnly) else {
            return false;
        };
        let mut core = rc.borrow_mut();
        if !core.running_on_server {
            return false;
        }
        if !core.arena.node(id).is_some_and(Node::is_array) {
            return false;
        }
        core.release_children(id);
        true
    }

    /// Grow the array to at least `count` elements; never shrinks.
    pub fn array_ensure_min_num(&self, count: i32) -> OpReport {
        if count < 0 {
            return OpStatus::InvalidTargetValue.into();
        }
        let Ok((rc, id)) = self.resolve(ResolveMode::EnsureCreate) else {
            return OpStatus::InvalidVisitor.into();
        };
        let mut core = rc.borrow_mut();
        if !core.running_on_server {
            return OpStatus::PermissionDenied.into();
        }
        let kind = core.arena.node(id).map(|node| (node.is_array(), node.is_empty()));
        match kind {
            Some((true, _)) => {}
            Some((_, true)) => {
                if !core.reset_to_empty_array(id).is_ok() {
                    return OpStatus::ResolveOperatorFailure.into();
                }
            }
            _ => return OpStatus::SegmentIndexButNodeNotArray.into(),
        }
        let mut added = false;
        loop {
            let len = match core.arena.node(id).and_then(Node::as_array) {
                Some(array) => array.len(),
                None => return OpStatus::ResolveInternalNullArray.into(),
            };
            if len >= count as usize {
                break;
            }
            let child = core.arena.allocate();
            if !child.is_valid() {
                return OpStatus::ResolveAllocateFailed.into();
            }
            if let Some(array) = core.arena.node_mut(id).and_then(Node::as_array_mut) {
                array.push(child);
            }
            core.arena.set_parent(child, id);
            core.arena.set_parent_edge_array(child, len as u16);
            core.bump_only_node_data_version(child);
            added = true;
        }
        if added {
            core.bump_node_data_and_struct(id);
            OpStatus::Success.into()
        } else {
            OpStatus::SameValueNoChange.into()
        }
    }

    pub fn array_get(&self, index: i32) -> Visitor {
        self.make_visitor_by_index(index)
    }

    pub fn array_children(&self) -> Vec<Visitor> {
        let count = self.array_num();
        (0..count).map(|i| self.make_visitor_by_index(i)).collect()
    }

    /// The previous sibling in the parent array.
    pub fn array_get_prev(&self) -> Visitor {
        match self.index_in_parent_array() {
            Some(index) if index > 0 => {
                let mut path = self.path.clone();
                path.pop();
                path.push(PathSegment::Index(index - 1));
                Visitor::from_parts(self.core.clone(), path)
            }
            _ => Visitor::default(),
        }
    }

    /// The next sibling in the parent array.
    pub fn array_get_next(&self) -> Visitor {
        match self.index_in_parent_array() {
            Some(index) => {
                let parent = self.make_visitor_to_parent();
                if index + 1 < parent.array_num() {
                    let mut path = self.path.clone();
                    path.pop();
                    path.push(PathSegment::Index(index + 1));
                    Visitor::from_parts(self.core.clone(), path)
                } else {
                    Visitor::default()
                }
            }
            None => Visitor::default(),
        }
    }

    // ---- map surface -------------------------------------------------------

    pub fn map_num(&self) -> i32 {
        self.with_read_node(|_, _, node| node.as_map().map_or(0, |m| m.len() as i32))
            .unwrap_or(0)
    }

    /// Create (or get) the entry under `key` and return a visitor to it.
    pub fn map_add(&self, key: &str) -> Visitor {
        let ensured = self.ensure_map();
        if !ensured.has_data() {
            return Visitor::default();
        }
        let child = self.make_visitor_by_name(key);
        match child.resolve(ResolveMode::EnsureCreate) {
            Ok(_) => child,
            Err(_) => Visitor::default(),
        }
    }

    /// Remove and release the entry under `key`.
    pub fn map_remove(&self, key: &str) -> bool {
        let Ok((rc, id)) = self.resolve(ResolveMode::ReadOnly) else {
            return false;
        };
        let mut core = rc.borrow_mut();
        if !core.running_on_server {
            return false;
        }
        let name = Name::new(key);
        let removed = match core.arena.node_mut(id).and_then(Node::as_map_mut) {
            Some(map) => map.shift_remove(&name),
            None => return false,
        };
        let Some(child) = removed else {
            return false;
        };
        core.release_recursive(child);
        core.bump_node_data_and_struct(id);
        true
    }

    pub fn map_clear(&self) -> bool {
        let Ok((rc, id)) = self.resolve(ResolveMode::ReadOnly) else {
            return false;
        };
        let mut core = rc.borrow_mut();
        if !core.running_on_server {
            return false;
        }
        if !core.arena.node(id).is_some_and(Node::is_map) {
            return false;
        }
        core.release_children(id);
        true
    }

    pub fn map_get(&self, key: &str) -> Visitor {
        self.make_visitor_by_name(key)
    }

    pub fn map_children(&self) -> Vec<Visitor> {
        self.with_read_node(|_, _, node| {
            node.as_map()
                .map(|map| map.keys().cloned().collect::<Vec<_>>())
                .unwrap_or_default()
        })
        .unwrap_or_default()
        .into_iter()
        .map(|key| self.make_visitor_by_name(key.as_str()))
        .collect()
    }

    // ---- position in parent ------------------------------------------------

    /// The index of this node in its parent array, verified through the
    /// reverse edge with a scan fallback that restores the edge.
    pub fn index_in_parent_array(&self) -> Option<i32> {
        let (rc, id) = self.resolve(ResolveMode::ReadOnly).ok()?;
        let mut core = rc.borrow_mut();
        let parent = core.arena.parent(id);
        let array = core.arena.node(parent)?.as_array()?;
        if let crate::arena::ParentEdge::ArrayIndex(index) = core.arena.parent_edge(id) {
            if array.get(usize::from(index)) == Some(&id) {
                return Some(i32::from(index));
            }
        }
        let found = array.iter().position(|child| *child == id)?;
        log::warn!("reverse edge out of sync for {id:?}; restored by scan");
        core.arena.set_parent_edge_array(id, found as u16);
        Some(found as i32)
    }

    /// The key of this node in its parent map, reverse-edge first.
    pub fn key_in_parent_map(&self) -> Option<Name> {
        let (rc, id) = self.resolve(ResolveMode::ReadOnly).ok()?;
        let mut core = rc.borrow_mut();
        let parent = core.arena.parent(id);
        let map = core.arena.node(parent)?.as_map()?;
        if let crate::arena::ParentEdge::MapLabel(label) = core.arena.parent_edge(id) {
            if map.get(&label) == Some(&id) {
                return Some(label);
            }
        }
        let found = map
            .iter()
            .find(|(_, child)| **child == id)
            .map(|(key, _)| key.clone())?;
        log::warn!("reverse edge out of sync for {id:?}; restored by scan");
        core.arena.set_parent_edge_map(id, found.clone());
        Some(found)
    }

    /// The array index taken directly below `ancestor` on the way to this
    /// node.
    pub fn index_under_ancestor_array(&self, ancestor: &Visitor) -> Option<i32> {
        if !ancestor.is_ancestor_of(self) {
            return None;
        }
        match &self.path[ancestor.path.len()] {
            PathSegment::Index(index) => Some(*index),
            PathSegment::Name(_) => None,
        }
    }

    /// The map key taken directly below `ancestor` on the way to this node.
    pub fn key_under_ancestor_map(&self, ancestor: &Visitor) -> Option<Name> {
        if !ancestor.is_ancestor_of(self) {
            return None;
        }
        match &self.path[ancestor.path.len()] {
            PathSegment::Name(name) => Some(name.clone()),
            PathSegment::Index(_) => None,
        }
    }

    // ---- search ------------------------------------------------------------

    /// Scan children in container order and return a visitor to the first
    /// node matching `predicate`.
    pub fn search_child_by(&self, predicate: impl Fn(&Node) -> bool) -> Visitor {
        enum Found {
            Index(i32),
            Key(Name),
        }
        let found = self.with_read_node(|core, _, node| {
            if let Some(array) = node.as_array() {
                for (i, child) in array.iter().enumerate() {
                    if core.node_for_read(*child).is_some_and(&predicate) {
                        return Some(Found::Index(i as i32));
                    }
                }
            } else if let Some(map) = node.as_map() {
                for (key, child) in map {
                    if core.node_for_read(*child).is_some_and(&predicate) {
                        return Some(Found::Key(key.clone()));
                    }
                }
            }
            None
        });
        match found.flatten() {
            Some(Found::Index(i)) => self.make_visitor_by_index(i),
            Some(Found::Key(key)) => self.make_visitor_by_name(key.as_str()),
            None => Visitor::default(),
        }
    }

    pub fn search_empty_child_node(&self) -> Visitor {
        self.search_child_by(Node::is_empty)
    }

    pub fn search_empty_child_map_node(&self) -> Visitor {
        self.search_child_by(Node::is_empty_map)
    }

    pub fn search_empty_child_array_node(&self) -> Visitor {
        self.search_child_by(Node::is_empty_array)
    }

    // ---- typed builtin accessors -------------------------------------------

    pub fn try_get_bool(&self) -> Option<bool> {
        self.try_get_value(builtin::BOOL)
            .and_then(|b| builtin::bytes_bool(&b))
    }

    pub fn try_get_old_bool(&self) -> Option<bool> {
        self.try_get_old_payload(builtin::BOOL)
            .and_then(|b| builtin::bytes_bool(&b))
    }

    pub fn try_set_bool(&self, value: bool) -> OpReport {
        self.try_set_value(builtin::BOOL, &builtin::bool_bytes(value))
    }

    pub fn ensure_and_set_bool(&self, value: bool) -> OpReport {
        self.ensure_and_set_value(builtin::BOOL, &builtin::bool_bytes(value))
    }

    pub fn try_get_i64(&self) -> Option<i64> {
        self.try_get_value(builtin::I64)
            .and_then(|b| builtin::bytes_i64(&b))
    }

    pub fn try_get_old_i64(&self) -> Option<i64> {
        self.try_get_old_payload(builtin::I64)
            .and_then(|b| builtin::bytes_i64(&b))
    }

    pub fn try_set_i64(&self, value: i64) -> OpReport {
        self.try_set_value(builtin::I64, &builtin::i64_bytes(value))
    }

    pub fn ensure_and_set_i64(&self, value: i64) -> OpReport {
        self.ensure_and_set_value(builtin::I64, &builtin::i64_bytes(value))
    }

    pub fn try_get_f32(&self) -> Option<f32> {
        self.try_get_value(builtin::F32)
            .and_then(|b| builtin::bytes_f32(&b))
    }

    pub fn try_get_old_f32(&self) -> Option<f32> {
        self.try_get_old_payload(builtin::F32)
            .and_then(|b| builtin::bytes_f32(&b))
    }

    pub fn try_set_f32(&self, value: f32) -> OpReport {
        self.try_set_value(builtin::F32, &builtin::f32_bytes(value))
    }

    pub fn ensure_and_set_f32(&self, value: f32) -> OpReport {
        self.ensure_and_set_value(builtin::F32, &builtin::f32_bytes(value))
    }

    pub fn try_get_name(&self) -> Option<Name> {
        self.try_get_value(builtin::NAME)
            .and_then(|b| builtin::bytes_name(&b))
    }

    pub fn try_get_old_name(&self) -> Option<Name> {
        self.try_get_old_payload(builtin::NAME)
            .and_then(|b| builtin::bytes_name(&b))
    }

    pub fn try_set_name(&self, value: &Name) -> OpReport {
        self.try_set_value(builtin::NAME, &builtin::name_bytes(value))
    }

    pub fn ensure_and_set_name(&self, value: &Name) -> OpReport {
        self.ensure_and_set_value(builtin::NAME, &builtin::name_bytes(value))
    }

    pub fn try_get_str(&self) -> Option<String> {
        self.try_get_value(builtin::STR)
            .and_then(|b| builtin::bytes_str(&b))
    }

    pub fn try_get_old_str(&self) -> Option<String> {
        self.try_get_old_payload(builtin::STR)
            .and_then(|b| builtin::bytes_str(&b))
    }

    pub fn try_set_str(&self, value: &str) -> OpReport {
        self.try_set_value(builtin::STR, &builtin::str_bytes(value))
    }

    pub fn ensure_and_set_str(&self, value: &str) -> OpReport {
        self.ensure_and_set_value(builtin::STR, &builtin::str_bytes(value))
    }

    pub fn try_get_vec3(&self) -> Option<[f32; 3]> {
        self.try_get_value(builtin::VEC3)
            .and_then(|b| builtin::bytes_triple(&b))
    }

    pub fn try_get_old_vec3(&self) -> Option<[f32; 3]> {
        self.try_get_old_payload(builtin::VEC3)
            .and_then(|b| builtin::bytes_triple(&b))
    }

    pub fn try_set_vec3(&self, value: [f32; 3]) -> OpReport {
        self.try_set_value(builtin::VEC3, &builtin::triple_bytes(value))
    }

    pub fn ensure_and_set_vec3(&self, value: [f32; 3]) -> OpReport {
        self.ensure_and_set_value(builtin::VEC3, &builtin::triple_bytes(value))
    }

    pub fn try_get_rot3(&self) -> Option<[f32; 3]> {
        self.try_get_value(builtin::ROT3)
            .and_then(|b| builtin::bytes_triple(&b))
    }

    pub fn try_get_old_rot3(&self) -> Option<[f32; 3]> {
        self.try_get_old_payload(builtin::ROT3)
            .and_then(|b| builtin::bytes_triple(&b))
    }

    pub fn try_set_rot3(&self, value: [f32; 3]) -> OpReport {
        self.try_set_value(builtin::ROT3, &builtin::triple_bytes(value))
    }

    pub fn ensure_and_set_rot3(&self, value: [f32; 3]) -> OpReport {
        self.ensure_and_set_value(builtin::ROT3, &builtin::triple_bytes(value))
    }

    // ---- wire form ---------------------------------------------------------

    /// Over-the-wire form: `has_data`, component reference, then the tagged
    /// path segments.
    pub fn write_net(&self, w: &mut WireWriter, component_ref: u64) {
        let usable = self.is_valid() && self.path.len() as u32 <= MAX_WIRE_PATH_LEN;
        if !usable {
            w.write_u8(0);
            return;
        }
        w.write_u8(1);
        w.write_u64v(component_ref);
        w.write_u32v(self.path.len() as u32);
        for segment in &self.path {
            match segment {
                PathSegment::Name(name) => {
                    w.write_u8(0);
                    w.write_name(name);
                }
                PathSegment::Index(index) => {
                    w.write_u8(1);
                    w.write_i64v(i64::from(*index));
                }
            }
        }
    }

    /// Read the wire form. A component reference the host cannot map fails
    /// only this field: the stream is fully consumed and the invalid visitor
    /// is returned.
    pub fn read_net(
        r: &mut WireReader<'_>,
        resolve_component: impl FnOnce(u64) -> Option<SyncTree>,
    ) -> Result<Visitor, WireError> {
        if r.read_u8()? == 0 {
            return Ok(Visitor::default());
        }
        let component_ref = r.read_u64v()?;
        let count = r.read_u32v()?;
        if count > MAX_WIRE_PATH_LEN {
            return Err(WireError::PathTooLong(count, MAX_WIRE_PATH_LEN));
        }
        let mut path = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match r.read_u8()? {
                0 => path.push(PathSegment::Name(r.read_name()?)),
                1 => {
                    let index = r.read_i64v()?;
                    let index =
                        i32::try_from(index).map_err(|_| WireError::VarintOverflow)?;
                    path.push(PathSegment::Index(index));
                }
                tag => return Err(WireError::BadSegmentTag(tag)),
            }
        }
        match resolve_component(component_ref) {
            Some(tree) => Ok(Visitor::from_parts(tree.downgrade(), path)),
            None => {
                log::warn!("visitor read: unknown component reference {component_ref}");
                Ok(Visitor::default())
            }
        }
    }

    // ---- dumps -------------------------------------------------------------

    /// Indented dump of the subtree under this visitor.
    pub fn render(&self) -> String {
        self.render_impl(false)
    }

    pub fn render_debug(&self) -> String {
        self.render_impl(true)
    }

    fn render_impl(&self, debug: bool) -> String {
        let Ok((rc, id)) = self.resolve(ResolveMode::ReadOnly) else {
            return "<unresolved visitor>\n".to_owned();
        };
        let core = rc.borrow();
        let label = match self.path.last() {
            Some(segment) => segment.to_string(),
            None => "root".to_owned(),
        };
        let mut out = String::new();
        core.render_node(&mut out, id, 0, &label, debug);
        out
    }
}

fn parse_index_segment(segment: &str) -> Option<i32> {
    let digits = segment.strip_prefix('$')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse::<i32>().ok()
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
