use std::cell::Cell;
use std::rc::Rc;

use crate::tree::SyncTree;
use crate::visitor::PathSegment;

/// Where batched dirty marks go on flush; in a real host this pokes the
/// replication system once per frame instead of once per mutation.
pub trait ReplicationSink {
    fn mark_dirty(&self, tree: &SyncTree);
}

struct HostedTree {
    tree: SyncTree,
    pending_dirty: Rc<Cell<bool>>,
}

/// Owns the per-frame plumbing around a set of trees: buffered dirty flags,
/// the batched flush, and OnChanged listener dispatch over the per-frame
/// changed-node set.
///
/// Trees raise the buffered flag on every mutation; [`HostAdapter::tick`]
/// (called once per frame, before the world ticks) forwards one mark per
/// dirty tree to the sink, dispatches listeners, and clears the changed set.
#[derive(Default)]
pub struct HostAdapter {
    trees: Vec<HostedTree>,
    sink: Option<Rc<dyn ReplicationSink>>,
}

impl HostAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(sink: Rc<dyn ReplicationSink>) -> Self {
        Self {
            trees: Vec::new(),
            sink: Some(sink),
        }
    }

    pub fn register(&mut self, tree: &SyncTree) {
        if self
            .trees
            .iter()
            .any(|hosted| Rc::ptr_eq(hosted.tree.core(), tree.core()))
        {
            return;
        }
        let pending_dirty = Rc::new(Cell::new(false));
        tree.set_dirty_flag(Some(Rc::clone(&pending_dirty)));
        self.trees.push(HostedTree {
            tree: SyncTree::from_core(Rc::clone(tree.core())),
            pending_dirty,
        });
        log::debug!("host: registered tree ({} total)", self.trees.len());
    }

    pub fn unregister(&mut self, tree: &SyncTree) {
        self.trees.retain(|hosted| {
            if Rc::ptr_eq(hosted.tree.core(), tree.core()) {
                hosted.tree.set_dirty_flag(None);
                false
            } else {
                true
            }
        });
    }

    /// Per-frame flush: batch-mark dirty trees, dispatch listeners for the
    /// frame's changed nodes, then clear the changed sets.
    pub fn tick(&mut self) {
        for hosted in &self.trees {
            if hosted.pending_dirty.replace(false) {
                log::trace!("host: flushing dirty mark");
                if let Some(sink) = &self.sink {
                    sink.mark_dirty(&hosted.tree);
                }
            }
            Self::dispatch_listeners(&hosted.tree);
            hosted.tree.clear_frame_changed_nodes();
        }
    }

    /// A changed node fires a binding when it lies within `depth` steps below
    /// the listen path and that path still resolves. Each changed node is
    /// delivered at most once per binding per frame, in registration order.
    fn dispatch_listeners(tree: &SyncTree) {
        let changed = tree.frame_changed_nodes();
        if changed.is_empty() {
            return;
        }
        let bindings: Vec<(Vec<PathSegment>, i32, crate::tree::OnChangedFn)> = tree
            .core()
            .borrow()
            .bindings
            .iter()
            .map(|binding| {
                (
                    binding.path.clone(),
                    binding.depth,
                    Rc::clone(&binding.callback),
                )
            })
            .collect();
        if bindings.is_empty() {
            return;
        }

        for id in changed {
            // Removed nodes have no position any more; nothing to deliver.
            let Some(path) = tree.core().borrow().path_of(id) else {
                continue;
            };
            for (listen_path, depth, callback) in &bindings {
                if !path_matches(listen_path, &path, *depth) {
                    continue;
                }
                let listen = tree.visitor().make_visitor_by_full_path(listen_path.clone());
                if !listen.has_data() {
                    continue;
                }
                let position = tree.visitor().make_visitor_by_full_path(path.clone());
                callback(&position);
            }
        }
    }
}

fn path_matches(listen: &[PathSegment], changed: &[PathSegment], depth: i32) -> bool {
    if depth < 0 || changed.len() < listen.len() {
        return false;
    }
    changed.len() - listen.len() <= depth as usize && changed[..listen.len()] == *listen
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
