use std::rc::Rc;

use itertools::{EitherOrBoth, Itertools};

use crate::arena::{ChunkMeta, CHUNK_SHIFT, CHUNK_SIZE};
use crate::baseline::BaselineState;
use crate::error::WireError;
use crate::name::Name;
use crate::node::Node;
use crate::node_id::NodeId;
use crate::tree::{SyncTree, TreeCore};
use crate::types::TypeRef;
use crate::wire::{WireReader, WireWriter};
use crate::{ArrayChildren, MapChildren};

const ENVELOPE_FULL: u8 = 1;
const ENVELOPE_DELTA: u8 = 0;

// Flags byte, msb to lsb: op (2 bits), has_parent, has_type, has_value,
// has_cdelta, is_cfull, reserved.
const OP_SHIFT: u8 = 6;
const OP_ADD: u8 = 0b01;
const OP_UPDATE: u8 = 0b10;
const FLAG_HAS_PARENT: u8 = 1 << 5;
const FLAG_HAS_TYPE: u8 = 1 << 4;
const FLAG_HAS_VALUE: u8 = 1 << 3;
const FLAG_HAS_CDELTA: u8 = 1 << 2;
const FLAG_IS_CFULL: u8 = 1 << 1;

const ARRAY_DELTA_REPLACE_MIDDLE: u8 = 0;
const ARRAY_DELTA_CLEAR: u8 = 1;

/// Container encoding heuristic: a size swing beyond
/// `max(CONTAINER_FULL_MIN_SLACK, new_len / CONTAINER_FULL_DIVISOR)` sends
/// the container in full instead of as a diff.
const CONTAINER_FULL_MIN_SLACK: usize = 1;
const CONTAINER_FULL_DIVISOR: usize = 2;

fn container_delta_too_large(old_len: usize, new_len: usize) -> bool {
    old_len.abs_diff(new_len) > CONTAINER_FULL_MIN_SLACK.max(new_len / CONTAINER_FULL_DIVISOR)
}

/// Parameters of [`SyncTree::net_delta_serialize`], the single entry point
/// for both replication directions. A writer makes the call a server-side
/// send (full when `old_state` is absent, delta otherwise); a reader makes it
/// a client-side apply.
pub struct NetDeltaParams<'a, 'b> {
    pub writer: Option<&'a mut WireWriter>,
    pub reader: Option<&'a mut WireReader<'b>>,
    pub old_state: Option<&'a BaselineState>,
    /// Out: the refreshed baseline after a successful write.
    pub new_state: Option<BaselineState>,
    /// Out: the packet referenced a value type this side has not mapped yet.
    /// Nothing further was consumed; retry the same packet later.
    pub has_more_unmapped: bool,
}

impl<'a, 'b> NetDeltaParams<'a, 'b> {
    pub fn for_write(writer: &'a mut WireWriter, old_state: Option<&'a BaselineState>) -> Self {
        Self {
            writer: Some(writer),
            reader: None,
            old_state,
            new_state: None,
            has_more_unmapped: false,
        }
    }

    pub fn for_read(reader: &'a mut WireReader<'b>) -> Self {
        Self {
            writer: None,
            reader: Some(reader),
            old_state: None,
            new_state: None,
            has_more_unmapped: false,
        }
    }
}

enum Disposition {
    Applied,
    Deferred,
}

pub(crate) fn net_delta_serialize(tree: &SyncTree, params: &mut NetDeltaParams<'_, '_>) -> bool {
    if params.writer.is_some() {
        server_write(tree, params)
    } else if params.reader.is_some() {
        client_read(tree, params)
    } else {
        false
    }
}

// ---- server side -----------------------------------------------------------

fn server_write(tree: &SyncTree, params: &mut NetDeltaParams<'_, '_>) -> bool {
    let mut core = tree.core().borrow_mut();
    let core = &mut *core;
    core.running_on_server = true;
    if core.arena.current_active() <= 1 {
        return false;
    }
    if core.data_version == 0 && core.struct_version == 0 {
        return false;
    }
    let Some(w) = params.writer.as_deref_mut() else {
        return false;
    };

    match params.old_state {
        None => {
            write_full(core, w);
            log::trace!(
                "replication full write: {} nodes, {} bytes",
                core.arena.current_active(),
                w.len()
            );
            params.new_state = Some(BaselineState::capture(core));
            true
        }
        Some(old) => {
            if old.data_version == core.data_version {
                return false;
            }
            let next = write_delta(core, old, w);
            params.new_state = Some(next);
            true
        }
    }
}

fn write_full(core: &TreeCore, w: &mut WireWriter) {
    w.write_u8(ENVELOPE_FULL);
    w.write_u32v(core.arena.current_active());
    core.arena.for_each_node(|id, node, _, parent, value_type| {
        id.write(w);
        parent.write(w);
        value_type.write(w);
        match node {
            Node::Array(_) | Node::Map(_) => write_container_full(w, node),
            Node::Small(_) | Node::Heap(_) => write_value_payload(core, w, node),
            Node::Empty => {}
        }
    });
}

fn write_value_payload(core: &TreeCore, w: &mut WireWriter, node: &Node) {
    let Some((type_ref, bytes)) = node.value_payload() else {
        return;
    };
    match core.registry.resolve(type_ref) {
        Some(info) => (info.ops.write)(w, bytes),
        None => {
            log::error!("serializing a value of unregistered type {}", type_ref.raw());
            w.write_bytes(bytes);
        }
    }
}

fn write_container_full(w: &mut WireWriter, node: &Node) {
    match node {
        Node::Array(children) => {
            w.write_u32v(children.len() as u32);
            for child in children {
                child.write(w);
            }
        }
        Node::Map(children) => {
            w.write_u32v(children.len() as u32);
            for (key, child) in children {
                w.write_name(key);
                child.write(w);
            }
        }
        _ => {}
    }
}

enum ContainerEncoding {
    Full,
    ArrayClear,
    ArrayReplace {
        start: u32,
        old_count: u32,
        new_ids: Vec<NodeId>,
    },
    MapDelta {
        removes: Vec<Name>,
        adds: Vec<(Name, NodeId)>,
        rebinds: Vec<(Name, NodeId)>,
    },
}

struct UpdatePlan {
    id: NodeId,
    parent: Option<NodeId>,
    value_type: Option<TypeRef>,
    has_value: bool,
    container: Option<ContainerEncoding>,
}

fn diff_array(old: &[NodeId], new: &[NodeId]) -> ContainerEncoding {
    // The clear form only ever describes a now-empty array; partial clears
    // use replace-middle.
    if new.is_empty() {
        return ContainerEncoding::ArrayClear;
    }
    if container_delta_too_large(old.len(), new.len()) {
        return ContainerEncoding::Full;
    }
    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = (0..max_suffix)
        .take_while(|i| old[old.len() - 1 - i] == new[new.len() - 1 - i])
        .count();
    ContainerEncoding::ArrayReplace {
        start: prefix as u32,
        old_count: (old.len() - prefix - suffix) as u32,
        new_ids: new[prefix..new.len() - suffix].to_vec(),
    }
}

fn diff_map(old: &MapChildren, new: &MapChildren) -> ContainerEncoding {
    if container_delta_too_large(old.len(), new.len()) {
        return ContainerEncoding::Full;
    }
    let mut removes = Vec::new();
    let mut adds = Vec::new();
    let mut rebinds = Vec::new();
    for (key, old_child) in old {
        match new.get(key) {
            None => removes.push(key.clone()),
            Some(new_child) if new_child != old_child => {
                rebinds.push((key.clone(), *new_child));
            }
            Some(_) => {}
        }
    }
    for (key, new_child) in new {
        if !old.contains_key(key) {
            adds.push((key.clone(), *new_child));
        }
    }
    ContainerEncoding::MapDelta {
        removes,
        adds,
        rebinds,
    }
}

fn diff_container(old: &BaselineState, id: NodeId, node: &Node) -> Option<ContainerEncoding> {
    match node {
        Node::Array(children) => match old.array_mirror.get(&id) {
            None => Some(ContainerEncoding::Full),
            Some(mirror) if mirror == children => None,
            Some(mirror) => Some(diff_array(mirror, children)),
        },
        Node::Map(children) => match old.map_mirror.get(&id) {
            None => Some(ContainerEncoding::Full),
            Some(mirror) if mirror == children => None,
            Some(mirror) => Some(diff_map(mirror, children)),
        },
        _ => None,
    }
}

fn write_delta(core: &TreeCore, old: &BaselineState, w: &mut WireWriter) -> BaselineState {
    w.write_u8(ENVELOPE_DELTA);

    let mut removes: Vec<NodeId> = Vec::new();
    let mut adds: Vec<NodeId> = Vec::new();
    let mut updates: Vec<UpdatePlan> = Vec::new();

    let live: Vec<&ChunkMeta> = (0..core.arena.chunk_count() as u16)
        .filter_map(|ci| core.arena.chunk_meta(ci))
        .collect();

    for pair in old.chunks.iter().zip_longest(live.iter().copied()) {
        let (old_meta, new_meta) = match pair {
            EitherOrBoth::Both(o, n) => (Some(o), Some(n)),
            EitherOrBoth::Left(o) => (Some(o), None),
            EitherOrBoth::Right(n) => (None, Some(n)),
        };
        let chunk_index = old_meta
            .or(new_meta)
            .map(|meta| meta.chunk_index)
            .unwrap_or_default();

        for local in 0..CHUNK_SIZE as u16 {
            let i = usize::from(local);
            let global = (chunk_index << CHUNK_SHIFT) | local;
            let old_used = old_meta.is_some_and(|m| m.is_used(local));
            let new_used = new_meta.is_some_and(|m| m.is_used(local));
            match (old_used, new_used) {
                (false, false) => {}
                (true, false) => {
                    removes.push(NodeId::new(global, old_meta.unwrap().generations[i]));
                }
                (false, true) => {
                    adds.push(NodeId::new(global, new_meta.unwrap().generations[i]));
                }
                (true, true) => {
                    let om = old_meta.unwrap();
                    let nm = new_meta.unwrap();
                    if om.generations[i] != nm.generations[i] {
                        // A different generation at the same slot is a
                        // remove of the old occupant plus an add.
                        removes.push(NodeId::new(global, om.generations[i]));
                        adds.push(NodeId::new(global, nm.generations[i]));
                        continue;
                    }
                    let id = NodeId::new(global, nm.generations[i]);
                    let Some(node) = core.arena.node(id) else {
                        continue;
                    };
                    let parent = (om.parents[i] != nm.parents[i]).then_some(nm.parents[i]);
                    let value_type =
                        (om.value_types[i] != nm.value_types[i]).then_some(nm.value_types[i]);
                    let version_changed = om.versions[i] != nm.versions[i];
                    let has_value = node.is_value() && (version_changed || value_type.is_some());
                    let container = diff_container(old, id, node);
                    if parent.is_none() && value_type.is_none() && !has_value && container.is_none()
                    {
                        continue;
                    }
                    updates.push(UpdatePlan {
                        id,
                        parent,
                        value_type,
                        has_value,
                        container,
                    });
                }
            }
        }
    }

    w.write_u32v(adds.len() as u32);
    w.write_u32v(removes.len() as u32);
    w.write_u32v(updates.len() as u32);
    for id in &removes {
        id.write(w);
    }
    for id in &adds {
        write_add_record(core, w, *id);
    }
    for plan in &updates {
        write_update_record(core, w, plan);
    }

    log::trace!(
        "replication delta write: {} adds, {} removes, {} updates, {} bytes",
        adds.len(),
        removes.len(),
        updates.len(),
        w.len()
    );

    build_next_baseline(core, old, &removes, &adds, &updates)
}

fn write_add_record(core: &TreeCore, w: &mut WireWriter, id: NodeId) {
    let parent = core.arena.parent(id);
    let value_type = core.arena.value_type(id).unwrap_or(TypeRef::EMPTY);
    let node = core.arena.node(id);

    let mut flags = (OP_ADD << OP_SHIFT) | FLAG_HAS_PARENT | FLAG_HAS_TYPE;
    match node {
        Some(Node::Small(_) | Node::Heap(_)) => flags |= FLAG_HAS_VALUE,
        Some(Node::Array(_) | Node::Map(_)) => flags |= FLAG_IS_CFULL,
        _ => {}
    }

    id.write(w);
    w.write_u8(flags);
    parent.write(w);
    value_type.write(w);
    if let Some(node) = node {
        if flags & FLAG_HAS_VALUE != 0 {
            write_value_payload(core, w, node);
        } else if flags & FLAG_IS_CFULL != 0 {
            write_container_full(w, node);
        }
    }
}

fn write_update_record(core: &TreeCore, w: &mut WireWriter, plan: &UpdatePlan) {
    let mut flags = OP_UPDATE << OP_SHIFT;
    if plan.parent.is_some() {
        flags |= FLAG_HAS_PARENT;
    }
    if plan.value_type.is_some() {
        flags |= FLAG_HAS_TYPE;
    }
    if plan.has_value {
        flags |= FLAG_HAS_VALUE;
    }
    match plan.container {
        Some(ContainerEncoding::Full) => flags |= FLAG_IS_CFULL,
        Some(_) => flags |= FLAG_HAS_CDELTA,
        None => {}
    }

    plan.id.write(w);
    w.write_u8(flags);
    if let Some(parent) = plan.parent {
        parent.write(w);
    }
    if let Some(value_type) = plan.value_type {
        value_type.write(w);
    }

    if plan.has_value {
        if let Some(node) = core.arena.node(plan.id) {
            write_value_payload(core, w, node);
        }
    } else if let Some(encoding) = &plan.container {
        match encoding {
            ContainerEncoding::Full => {
                if let Some(node) = core.arena.node(plan.id) {
                    write_container_full(w, node);
                }
            }
            ContainerEncoding::ArrayClear => {
                w.write_u8(ARRAY_DELTA_CLEAR);
            }
            ContainerEncoding::ArrayReplace {
                start,
                old_count,
                new_ids,
            } => {
                w.write_u8(ARRAY_DELTA_REPLACE_MIDDLE);
                w.write_u32v(*start);
                w.write_u32v(*old_count);
                w.write_u32v(new_ids.len() as u32);
                for id in new_ids {
                    id.write(w);
                }
            }
            ContainerEncoding::MapDelta {
                removes,
                adds,
                rebinds,
            } => {
                w.write_u32v(removes.len() as u32);
                w.write_u32v(adds.len() as u32);
                w.write_u32v(rebinds.len() as u32);
                for key in removes {
                    w.write_name(key);
                }
                for (key, id) in adds {
                    w.write_name(key);
                    id.write(w);
                }
                for (key, id) in rebinds {
                    w.write_name(key);
                    id.write(w);
                }
            }
        }
    }
}

/// The baseline for the next delta: fresh chunk-metadata clones, with the
/// container mirrors carried forward and refreshed for everything this packet
/// touched.
fn build_next_baseline(
    core: &TreeCore,
    old: &BaselineState,
    removes: &[NodeId],
    adds: &[NodeId],
    updates: &[UpdatePlan],
) -> BaselineState {
    let chunks = (0..core.arena.chunk_count() as u16)
        .filter_map(|ci| core.arena.chunk_meta(ci).cloned())
        .collect();

    let mut array_mirror = old.array_mirror.clone();
    let mut map_mirror = old.map_mirror.clone();
    for id in removes {
        array_mirror.remove(id);
        map_mirror.remove(id);
    }
    for id in adds.iter().chain(updates.iter().map(|plan| &plan.id)) {
        match core.arena.node(*id) {
            Some(Node::Array(children)) => {
                array_mirror.insert(*id, children.clone());
                map_mirror.remove(id);
            }
            Some(Node::Map(children)) => {
                map_mirror.insert(*id, children.clone());
                array_mirror.remove(id);
            }
            _ => {
                array_mirror.remove(id);
                map_mirror.remove(id);
            }
        }
    }

    BaselineState {
        data_version: core.data_version,
        chunks,
        array_mirror,
        map_mirror,
    }
}

// ---- client side -----------------------------------------------------------

fn client_read(tree: &SyncTree, params: &mut NetDeltaParams<'_, '_>) -> bool {
    let mut core = tree.core().borrow_mut();
    let core = &mut *core;
    core.running_on_server = false;
    core.old_values.clear();
    let Some(r) = params.reader.as_deref_mut() else {
        return false;
    };

    let outcome = (|| -> Result<Disposition, WireError> {
        match r.read_u8()? {
            ENVELOPE_FULL => client_full_read(core, r),
            ENVELOPE_DELTA => client_delta_read(core, r),
            other => Err(WireError::BadFlags(other)),
        }
    })();

    match outcome {
        Ok(Disposition::Applied) => true,
        Ok(Disposition::Deferred) => {
            log::trace!("replication read deferred on an unmapped type");
            params.has_more_unmapped = true;
            true
        }
        Err(error) => {
            log::error!("replication read failed: {error}");
            false
        }
    }
}

fn read_id_list(r: &mut WireReader<'_>) -> Result<ArrayChildren, WireError> {
    let count = r.read_u32v()?;
    let mut out = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        out.push(NodeId::read(r)?);
    }
    Ok(out)
}

fn read_pair_list(r: &mut WireReader<'_>) -> Result<MapChildren, WireError> {
    let count = r.read_u32v()?;
    let mut out = MapChildren::default();
    for _ in 0..count {
        let key = r.read_name()?;
        let id = NodeId::read(r)?;
        out.insert(key, id);
    }
    Ok(out)
}

fn client_full_read(core: &mut TreeCore, r: &mut WireReader<'_>) -> Result<Disposition, WireError> {
    core.arena.reset();
    core.root = NodeId::INVALID;
    core.overlay.clear();
    core.changed_nodes.clear();
    let registry = Rc::clone(&core.registry);

    let count = r.read_u32v()?;
    let mut root_candidate = NodeId::INVALID;
    for _ in 0..count {
        let id = NodeId::read(r)?;
        let parent = NodeId::read(r)?;
        let value_type = TypeRef::read(r)?;
        // Bail out before touching the payload; the retry replays the whole
        // packet and `allocate_at` re-completes every entry.
        if !registry.is_mapped(value_type) {
            return Ok(Disposition::Deferred);
        }
        if core.arena.allocate_at(id).is_none() {
            return Err(WireError::BadNodeId);
        }
        core.arena.set_parent(id, parent);
        core.arena.set_value_type(id, value_type);
        match value_type {
            TypeRef::EMPTY => {}
            TypeRef::ARRAY => {
                let children = read_id_list(r)?;
                if let Some(node) = core.arena.node_mut(id) {
                    *node = Node::Array(children);
                }
            }
            TypeRef::MAP => {
                let children = read_pair_list(r)?;
                if let Some(node) = core.arena.node_mut(id) {
                    *node = Node::Map(children);
                }
            }
            concrete => {
                let info = registry.resolve(concrete).ok_or(WireError::BadNodeId)?;
                let bytes = (info.ops.read)(r)?;
                if let Some(node) = core.arena.node_mut(id) {
                    *node = Node::new_value(concrete, &bytes);
                }
            }
        }
        if !parent.is_valid() {
            root_candidate = id;
        }
    }

    core.root = root_candidate;
    rebuild_all_edges(core);
    core.struct_version += 1;
    core.data_version += 1;
    log::trace!("replication full read: {count} nodes applied");
    Ok(Disposition::Applied)
}

fn client_delta_read(
    core: &mut TreeCore,
    r: &mut WireReader<'_>,
) -> Result<Disposition, WireError> {
    // Prediction is dropped unconditionally before applying authoritative
    // changes.
    core.clear_overlay();

    let adds_count = r.read_u32v()?;
    let removes_count = r.read_u32v()?;
    let updates_count = r.read_u32v()?;

    let mut removed = Vec::with_capacity(removes_count.min(1024) as usize);
    for _ in 0..removes_count {
        removed.push(NodeId::read(r)?);
    }

    // Capture pre-apply values first: releasing one subtree may free nodes
    // that later remove records also name.
    for id in &removed {
        let captured = core
            .arena
            .node(*id)
            .and_then(|node| node.value_payload())
            .map(|(t, bytes)| (t, Box::from(bytes)));
        if let Some(entry) = captured {
            core.old_values.insert(*id, entry);
        }
    }

    let mut any_struct = false;
    let mut any_value = false;
    for id in removed {
        if core.release_recursive(id) > 0 {
            any_struct = true;
        }
        core.changed_nodes.insert(id);
    }

    let mut reattached: Vec<NodeId> = Vec::new();
    for _ in 0..adds_count + updates_count {
        if let Disposition::Deferred =
            apply_record(core, r, &mut reattached, &mut any_struct, &mut any_value)?
        {
            return Ok(Disposition::Deferred);
        }
    }

    rebuild_edges_for(core, &reattached);
    if any_struct {
        core.struct_version += 1;
        core.data_version += 1;
    }
    if any_value {
        core.data_version += 1;
    }
    log::trace!(
        "replication delta read: {adds_count} adds, {removes_count} removes, {updates_count} updates"
    );
    Ok(Disposition::Applied)
}

fn apply_record(
    core: &mut TreeCore,
    r: &mut WireReader<'_>,
    reattached: &mut Vec<NodeId>,
    any_struct: &mut bool,
    any_value: &mut bool,
) -> Result<Disposition, WireError> {
    let id = NodeId::read(r)?;
    let flags = r.read_u8()?;
    let op = flags >> OP_SHIFT;
    if op != OP_ADD && op != OP_UPDATE {
        return Err(WireError::BadFlags(flags));
    }
    let parent = if flags & FLAG_HAS_PARENT != 0 {
        Some(NodeId::read(r)?)
    } else {
        None
    };
    let value_type = if flags & FLAG_HAS_TYPE != 0 {
        Some(TypeRef::read(r)?)
    } else {
        None
    };
    let registry = Rc::clone(&core.registry);
    if let Some(t) = value_type {
        if !registry.is_mapped(t) {
            return Ok(Disposition::Deferred);
        }
    }

    // Generations come from the wire; replays of the same record are
    // idempotent.
    if core.arena.allocate_at(id).is_none() {
        return Err(WireError::BadNodeId);
    }
    if op == OP_ADD {
        *any_struct = true;
    }

    if let Some(parent) = parent {
        core.arena.set_parent(id, parent);
        if op == OP_UPDATE {
            // A reparent on an existing node is a topology change.
            *any_struct = true;
        }
        if !parent.is_valid() {
            // A redirect replaced the root on the server.
            core.root = id;
        }
    }
    if let Some(t) = value_type {
        core.arena.set_value_type(id, t);
        if let Some(node) = core.arena.node_mut(id) {
            match t {
                TypeRef::ARRAY => {
                    if !node.is_array() {
                        *node = Node::Array(ArrayChildren::default());
                    }
                }
                TypeRef::MAP => {
                    if !node.is_map() {
                        *node = Node::Map(MapChildren::default());
                    }
                }
                TypeRef::EMPTY => *node = Node::Empty,
                _ => {}
            }
        }
        *any_struct = true;
    }

    if flags & FLAG_HAS_VALUE != 0 {
        let type_ref = value_type
            .or_else(|| core.arena.value_type(id))
            .unwrap_or(TypeRef::EMPTY);
        let Some(info) = registry.resolve(type_ref) else {
            return Ok(Disposition::Deferred);
        };
        let bytes = (info.ops.read)(r)?;
        let previous = core
            .arena
            .node(id)
            .and_then(|node| node.value_payload())
            .map(|(t, b)| (t, Box::from(b)));
        if let Some(entry) = previous {
            core.old_values.insert(id, entry);
        }
        if let Some(node) = core.arena.node_mut(id) {
            *node = Node::new_value(type_ref, &bytes);
        }
        *any_value = true;
    } else if flags & FLAG_IS_CFULL != 0 {
        let type_ref = value_type
            .or_else(|| core.arena.value_type(id))
            .unwrap_or(TypeRef::EMPTY);
        match type_ref {
            TypeRef::ARRAY => {
                let children = read_id_list(r)?;
                if let Some(node) = core.arena.node_mut(id) {
                    *node = Node::Array(children);
                }
            }
            TypeRef::MAP => {
                let children = read_pair_list(r)?;
                if let Some(node) = core.arena.node_mut(id) {
                    *node = Node::Map(children);
                }
            }
            _ => return Err(WireError::BadFlags(flags)),
        }
        reattached.push(id);
        *any_struct = true;
    } else if flags & FLAG_HAS_CDELTA != 0 {
        let type_ref = value_type
            .or_else(|| core.arena.value_type(id))
            .unwrap_or(TypeRef::EMPTY);
        match type_ref {
            TypeRef::ARRAY => apply_array_delta(core, r, id)?,
            TypeRef::MAP => apply_map_delta(core, r, id)?,
            _ => return Err(WireError::BadFlags(flags)),
        }
        reattached.push(id);
        *any_struct = true;
    }

    core.changed_nodes.insert(id);
    Ok(Disposition::Applied)
}

fn apply_array_delta(
    core: &mut TreeCore,
    r: &mut WireReader<'_>,
    id: NodeId,
) -> Result<(), WireError> {
    match r.read_u8()? {
        ARRAY_DELTA_CLEAR => {
            if let Some(array) = core.arena.node_mut(id).and_then(Node::as_array_mut) {
                array.clear();
            }
            Ok(())
        }
        ARRAY_DELTA_REPLACE_MIDDLE => {
            let start = r.read_u32v()? as usize;
            let old_count = r.read_u32v()? as usize;
            let new_count = r.read_u32v()?;
            let mut new_ids = Vec::with_capacity(new_count.min(1024) as usize);
            for _ in 0..new_count {
                new_ids.push(NodeId::read(r)?);
            }
            if let Some(array) = core.arena.node_mut(id).and_then(Node::as_array_mut) {
                let start = start.min(array.len());
                let end = (start + old_count).min(array.len());
                array.splice(start..end, new_ids);
            } else {
                log::warn!("array delta for non-array node {id:?}");
            }
            Ok(())
        }
        kind => Err(WireError::BadContainerDeltaKind(kind)),
    }
}

fn apply_map_delta(
    core: &mut TreeCore,
    r: &mut WireReader<'_>,
    id: NodeId,
) -> Result<(), WireError> {
    let removes_count = r.read_u32v()?;
    let adds_count = r.read_u32v()?;
    let rebinds_count = r.read_u32v()?;

    let mut removes = Vec::with_capacity(removes_count.min(1024) as usize);
    for _ in 0..removes_count {
        removes.push(r.read_name()?);
    }
    let mut inserts = Vec::with_capacity((adds_count + rebinds_count).min(1024) as usize);
    for _ in 0..adds_count + rebinds_count {
        let key = r.read_name()?;
        let child = NodeId::read(r)?;
        inserts.push((key, child));
    }

    if let Some(map) = core.arena.node_mut(id).and_then(Node::as_map_mut) {
        for key in removes {
            map.shift_remove(&key);
        }
        for (key, child) in inserts {
            map.insert(key, child);
        }
    } else {
        log::warn!("map delta for non-map node {id:?}");
    }
    Ok(())
}

/// Rebuild reverse parent edges for the children of every container in `ids`.
fn rebuild_edges_for(core: &mut TreeCore, ids: &[NodeId]) {
    for id in ids {
        let node = core.arena.node(*id).cloned();
        match node {
            Some(Node::Array(children)) => {
                for (index, child) in children.into_iter().enumerate() {
                    core.arena.set_parent_edge_array(child, index as u16);
                }
            }
            Some(Node::Map(children)) => {
                for (key, child) in children {
                    core.arena.set_parent_edge_map(child, key);
                }
            }
            _ => {}
        }
    }
}

fn rebuild_all_edges(core: &mut TreeCore) {
    let mut containers = Vec::new();
    core.arena.for_each_node(|id, node, _, _, _| {
        if node.is_compound() {
            containers.push(id);
        }
    });
    rebuild_edges_for(core, &containers);
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
    use crate::types::{TypeRegistry, ValueOps};
    use pretty_assertions::assert_eq;

    fn pair() -> (SyncTree, SyncTree) {
        let registry = Rc::new(TypeRegistry::with_builtins());
        (
            SyncTree::new(Rc::clone(&registry)),
            SyncTree::new(registry),
        )
    }

    fn sync_full(server: &SyncTree, client: &SyncTree) -> BaselineState {
        let mut w = WireWriter::new();
        let mut write = NetDeltaParams::for_write(&mut w, None);
        assert!(server.net_delta_serialize(&mut write));
        let baseline = write.new_state.take().expect("full write yields a baseline");

        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        let mut read = NetDeltaParams::for_read(&mut r);
        assert!(client.net_delta_serialize(&mut read));
        assert!(!read.has_more_unmapped);
        baseline
    }

    /// Returns the refreshed baseline, or `None` when the server had nothing
    /// to send.
    fn sync_delta(
        server: &SyncTree,
        client: &SyncTree,
        old: &BaselineState,
    ) -> Option<BaselineState> {
        let mut w = WireWriter::new();
        let mut write = NetDeltaParams::for_write(&mut w, Some(old));
        if !server.net_delta_serialize(&mut write) {
            return None;
        }
        let baseline = write.new_state.take().expect("delta write yields a baseline");

        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        let mut read = NetDeltaParams::for_read(&mut r);
        assert!(client.net_delta_serialize(&mut read));
        assert!(!read.has_more_unmapped);
        Some(baseline)
    }

    #[test]
    fn create_and_read_int_over_full_sync() {
        let (server, client) = pair();
        let data_before = server.data_version();
        let struct_before = server.struct_version();

        let report = server
            .visitor()
            .make_visitor_by_name("hp")
            .ensure_and_set_i64(100);
        assert_eq!(report.status, crate::OpStatus::SuccessChangeValueAndType);
        assert!(server.data_version() > data_before);
        assert!(server.struct_version() > struct_before);

        sync_full(&server, &client);
        assert!(!client.is_running_on_server());
        assert_eq!(
            client.visitor().make_visitor_by_name("hp").try_get_i64(),
            Some(100)
        );
        assert!(client.identical_to(&server));
    }

    #[test]
    fn array_append_syncs_as_delta() {
        let (server, client) = pair();
        let list = server.visitor().make_visitor_by_name("list").ensure_array();
        list.array_add().try_set_i64(7);
        let baseline = sync_full(&server, &client);

        list.array_add().try_set_i64(9);
        sync_delta(&server, &client, &baseline).expect("changes to send");

        let client_list = client.visitor().make_visitor_by_name("list");
        assert_eq!(client_list.array_num(), 2);
        assert_eq!(client_list.make_visitor_by_index(0).try_get_i64(), Some(7));
        assert_eq!(client_list.make_visitor_by_index(1).try_get_i64(), Some(9));
        assert!(client.identical_to(&server));
    }

    #[test]
    fn array_diff_emits_replace_middle() {
        let a = NodeId::new(1, 1);
        let b = NodeId::new(2, 1);
        let c = NodeId::new(3, 1);
        let d = NodeId::new(4, 1);
        let e = NodeId::new(5, 1);
        let x = NodeId::new(6, 1);
        let y = NodeId::new(7, 1);

        match diff_array(&[a, b, c, d, e], &[a, x, y, e]) {
            ContainerEncoding::ArrayReplace {
                start,
                old_count,
                new_ids,
            } => {
                assert_eq!(start, 1);
                assert_eq!(old_count, 3);
                assert_eq!(new_ids, vec![x, y]);
            }
            _ => panic!("expected a replace-middle encoding"),
        }

        // New array empty: the dedicated clear form.
        assert!(matches!(
            diff_array(&[a, b], &[]),
            ContainerEncoding::ArrayClear
        ));

        // Large size swing: full resend.
        assert!(matches!(
            diff_array(&[a], &[a, b, c, d, e]),
            ContainerEncoding::Full
        ));
    }

    #[test]
    fn array_middle_insert_converges_over_delta() {
        let (server, client) = pair();
        let list = server.visitor().make_visitor_by_name("list").ensure_array();
        list.array_add().try_set_i64(1);
        list.array_add().try_set_i64(2);
        let baseline = sync_full(&server, &client);

        list.array_insert(1).try_set_i64(99);
        sync_delta(&server, &client, &baseline).expect("changes to send");

        let values: Vec<i64> = client
            .visitor()
            .make_visitor_by_name("list")
            .array_children()
            .iter()
            .map(|child| child.try_get_i64().unwrap())
            .collect();
        assert_eq!(values, vec![1, 99, 2]);
        assert!(client.identical_to(&server));
    }

    #[test]
    fn array_clear_converges_over_delta() {
        let (server, client) = pair();
        let list = server.visitor().make_visitor_by_name("list").ensure_array();
        list.array_add().try_set_i64(1);
        list.array_add().try_set_i64(2);
        let baseline = sync_full(&server, &client);

        list.array_clear();
        sync_delta(&server, &client, &baseline).expect("changes to send");

        assert_eq!(client.visitor().make_visitor_by_name("list").array_num(), 0);
        assert!(client
            .visitor()
            .make_visitor_by_name("list")
            .is_empty_array());
        assert!(client.identical_to(&server));
    }

    #[test]
    fn map_rebind_converges_and_releases_the_old_child() {
        let (server, client) = pair();
        let slot = server.visitor().make_visitor_by_name("slot");
        slot.ensure_and_set_i64(1);
        let donor = server.visitor().make_visitor_by_name("donor");
        donor.ensure_and_set_i64(2);
        let baseline = sync_full(&server, &client);
        let old_child = client
            .visitor()
            .make_visitor_by_name("slot")
            .cached_node_id();
        assert!(client.is_node_valid(old_child));

        // Redirect-by-copy rebinds the "slot" key to a new id.
        assert_eq!(
            slot.ensure_and_copy_from(&donor).status,
            crate::OpStatus::Success
        );
        sync_delta(&server, &client, &baseline).expect("changes to send");

        assert_eq!(
            client.visitor().make_visitor_by_name("slot").try_get_i64(),
            Some(2)
        );
        assert!(!client.is_node_valid(old_child));
        assert!(client.identical_to(&server));
    }

    #[test]
    fn subtree_swap_converges_under_new_ids() {
        let (server, client) = pair();
        let a = server.visitor().make_visitor_by_name("A").ensure_map();
        a.make_visitor_by_name("x").ensure_and_set_i64(1);
        let b = server.visitor().make_visitor_by_name("B").ensure_map();
        b.make_visitor_by_name("y").ensure_and_set_i64(2);
        let baseline = sync_full(&server, &client);
        let struct_before = server.struct_version();

        assert_eq!(a.ensure_and_swap_with(&b).status, crate::OpStatus::Success);
        assert!(server.struct_version() > struct_before);
        sync_delta(&server, &client, &baseline).expect("changes to send");

        let root = client.visitor();
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
        assert!(client.identical_to(&server));
    }

    #[test]
    fn client_prediction_is_dropped_on_apply() {
        let (server, client) = pair();
        let hp = server.visitor().make_visitor_by_name("hp");
        hp.ensure_and_set_i64(50);
        let baseline = sync_full(&server, &client);

        // Client predicts locally; authoritative state is untouched.
        let struct_before = client.struct_version();
        let data_before = client.data_version();
        let client_hp = client.visitor().make_visitor_by_name("hp");
        assert_eq!(
            client_hp.try_set_i64(90).status,
            crate::OpStatus::SuccessChangeValueAndType
        );
        assert_eq!(client_hp.try_get_i64(), Some(90));
        // Prediction never moves tree-level counters.
        assert_eq!(client.struct_version(), struct_before);
        assert_eq!(client.data_version(), data_before);

        // Predicting the authoritative value again creates no overlay.
        let same = client.visitor().make_visitor_by_name("hp");
        client.core().borrow_mut().overlay.clear();
        assert_eq!(
            same.try_set_i64(50).status,
            crate::OpStatus::SameValueNoChange
        );
        assert!(client.core().borrow().overlay.is_empty());

        client_hp.try_set_i64(90);
        hp.try_set_i64(100);
        sync_delta(&server, &client, &baseline).expect("changes to send");

        // Overlay cleared; authoritative value wins; old value is readable.
        assert!(client.core().borrow().overlay.is_empty());
        assert_eq!(client_hp.try_get_i64(), Some(100));
        assert_eq!(client_hp.try_get_old_i64(), Some(50));
    }

    #[test]
    fn removed_value_nodes_land_in_the_old_value_map() {
        let (server, client) = pair();
        let bag = server.visitor().make_visitor_by_name("bag").ensure_map();
        bag.map_add("gone").try_set_i64(13);
        let baseline = sync_full(&server, &client);
        let doomed = client
            .visitor()
            .make_visitor_by_name("bag")
            .make_visitor_by_name("gone")
            .cached_node_id();

        bag.map_remove("gone");
        sync_delta(&server, &client, &baseline).expect("changes to send");

        assert!(!client.is_node_valid(doomed));
        let (type_ref, bytes) = client.try_get_old_value(doomed).expect("old value captured");
        assert_eq!(type_ref, crate::builtin::I64);
        assert_eq!(crate::builtin::bytes_i64(&bytes), Some(13));
        assert!(client.identical_to(&server));
    }

    #[test]
    fn delta_with_no_changes_sends_nothing() {
        let (server, client) = pair();
        server.visitor().make_visitor_by_name("x").ensure_and_set_i64(1);
        let baseline = sync_full(&server, &client);
        assert!(sync_delta(&server, &client, &baseline).is_none());
    }

    #[test]
    fn same_value_write_does_not_dirty_the_delta() {
        let (server, client) = pair();
        let x = server.visitor().make_visitor_by_name("x");
        x.ensure_and_set_i64(1);
        let baseline = sync_full(&server, &client);

        assert_eq!(x.try_set_i64(1).status, crate::OpStatus::SameValueNoChange);
        assert!(sync_delta(&server, &client, &baseline).is_none());
    }

    #[test]
    fn full_packet_replay_is_idempotent() {
        let (server, client) = pair();
        server.visitor().make_visitor_by_name("hp").ensure_and_set_i64(1);
        server
            .visitor()
            .make_visitor_by_name("list")
            .ensure_array()
            .array_add()
            .try_set_i64(2);

        let mut w = WireWriter::new();
        let mut write = NetDeltaParams::for_write(&mut w, None);
        assert!(server.net_delta_serialize(&mut write));
        let bytes = w.into_bytes();

        for _ in 0..2 {
            let mut r = WireReader::new(&bytes);
            let mut read = NetDeltaParams::for_read(&mut r);
            assert!(client.net_delta_serialize(&mut read));
        }
        assert!(client.identical_to(&server));
        assert_eq!(client.node_count(), server.node_count());
    }

    #[test]
    fn chained_deltas_stay_convergent() {
        let (server, client) = pair();
        let root = server.visitor();
        root.make_visitor_by_name("hp").ensure_and_set_i64(10);
        let mut baseline = sync_full(&server, &client);

        let steps: Vec<Box<dyn Fn(&SyncTree)>> = vec![
            Box::new(|s| {
                s.visitor().make_visitor_by_name("hp").try_set_i64(20);
            }),
            Box::new(|s| {
                let list = s.visitor().make_visitor_by_name("list").ensure_array();
                list.array_add().try_set_str("alpha");
                list.array_add().try_set_str("beta");
            }),
            Box::new(|s| {
                s.visitor().make_visitor_by_name("list").array_remove();
            }),
            Box::new(|s| {
                let bag = s.visitor().make_visitor_by_name("bag").ensure_map();
                bag.map_add("k1").try_set_bool(true);
                bag.map_add("k2").try_set_vec3([1.0, 2.0, 3.0]);
            }),
            Box::new(|s| {
                s.visitor().make_visitor_by_name("bag").map_remove("k1");
                s.visitor().make_visitor_by_name("hp").try_set_to_empty();
            }),
        ];

        for step in steps {
            step(&server);
            if let Some(next) = sync_delta(&server, &client, &baseline) {
                baseline = next;
            }
            assert!(client.identical_to(&server));
            assert_eq!(client.node_count(), server.node_count());
        }
    }

    #[test]
    fn unmapped_type_defers_and_applies_after_mapping() {
        let rich = {
            let mut registry = TypeRegistry::with_builtins();
            registry.register("custom", ValueOps::plain_binary());
            Rc::new(registry)
        };
        let server = SyncTree::new(Rc::clone(&rich));
        let custom = rich.find("custom").unwrap();
        server
            .visitor()
            .make_visitor_by_name("blob")
            .ensure_and_set_value(custom, &[1, 2, 3]);

        let mut w = WireWriter::new();
        let mut write = NetDeltaParams::for_write(&mut w, None);
        assert!(server.net_delta_serialize(&mut write));
        let bytes = w.into_bytes();

        // A client without the custom type defers the packet.
        let poor_client = SyncTree::new(Rc::new(TypeRegistry::with_builtins()));
        let mut r = WireReader::new(&bytes);
        let mut read = NetDeltaParams::for_read(&mut r);
        assert!(poor_client.net_delta_serialize(&mut read));
        assert!(read.has_more_unmapped);

        // A client with the full mapping applies the very same packet.
        let mapped_client = SyncTree::new(rich);
        let mut r = WireReader::new(&bytes);
        let mut read = NetDeltaParams::for_read(&mut r);
        assert!(mapped_client.net_delta_serialize(&mut read));
        assert!(!read.has_more_unmapped);
        assert_eq!(
            mapped_client
                .visitor()
                .make_visitor_by_name("blob")
                .try_get_value(custom)
                .as_deref(),
            Some([1u8, 2, 3].as_slice())
        );
    }

    #[test]
    fn client_structural_writes_are_denied() {
        let (server, client) = pair();
        server.visitor().make_visitor_by_name("x").ensure_and_set_i64(1);
        sync_full(&server, &client);

        let root = client.visitor();
        assert_eq!(
            root.make_visitor_by_name("fresh").ensure_and_set_i64(1).status,
            crate::OpStatus::ResolveMapKeyNotFound
        );
        assert!(!root.make_visitor_by_name("list").ensure_array().has_data());
        assert!(!root.make_visitor_by_name("x").array_remove());
        assert_eq!(
            root.make_visitor_by_name("x")
                .ensure_and_copy_from(&root.make_visitor_by_name("x"))
                .status,
            crate::OpStatus::PermissionDenied
        );
    }

    #[test]
    fn empty_tree_writes_nothing() {
        let (server, _client) = pair();
        let mut w = WireWriter::new();
        let mut write = NetDeltaParams::for_write(&mut w, None);
        assert!(!server.net_delta_serialize(&mut write));
        assert!(w.is_empty());
    }
}
