use ahash::{AHashSet, RandomState};
use indexmap::IndexMap;

use crate::capture::HeapId;
use crate::classifier::filter::Filter;
use crate::classifier::strategy::ClassGrouping;
use crate::classifier::{ClassifierSet, ClassifierTree, InstanceLookup, NodeId};
use crate::instance::{InstanceId, InstanceObject, NO_ALLOC_TIME, NO_DEALLOC_TIME};

/// One change to the content of a heap.
#[derive(Debug, Clone)]
pub enum HeapDelta {
    AddSnapshot(InstanceObject),
    RemoveSnapshot(InstanceId),
    AddAllocation(InstanceObject),
    RemoveAllocation(InstanceId),
    AddDeallocation(InstanceObject),
    RemoveDeallocation(InstanceId),
    /// Drops every instance, the grouping and filter are kept.
    Clear,
}

/// Instances of one heap and the roles they play in the current window.
#[derive(Debug, Default)]
pub struct InstanceStore {
    objects: IndexMap<InstanceId, InstanceObject, RandomState>,
    snapshot: AHashSet<InstanceId>,
}

impl InstanceLookup for InstanceStore {
    fn instance(&self, id: InstanceId) -> Option<&InstanceObject> {
        self.objects.get(&id)
    }

    fn is_snapshot(&self, id: InstanceId) -> bool {
        self.snapshot.contains(&id)
    }
}

impl InstanceStore {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn clear(&mut self) {
        self.objects.clear();
        self.snapshot.clear();
    }

    /// Inserts `instance`, or merges its timestamps into the stored one.
    ///
    /// Fields used for classification are kept from the first insertion so an
    /// instance always routes to the same leaf.
    fn upsert(&mut self, instance: InstanceObject) -> &mut InstanceObject {
        let id = instance.id;
        let (has_alloc_time, has_dealloc_time) = (instance.has_alloc_time(), instance.has_dealloc_time());
        match self.objects.entry(id) {
            indexmap::map::Entry::Occupied(entry) => {
                let stored = entry.into_mut();
                if has_alloc_time {
                    stored.alloc_time = instance.alloc_time;
                }
                if has_dealloc_time {
                    stored.dealloc_time = instance.dealloc_time;
                    stored.dealloc_thread = instance.dealloc_thread.or(stored.dealloc_thread.take());
                }
                stored
            }
            indexmap::map::Entry::Vacant(entry) => entry.insert(instance),
        }
    }

    /// Drops `id` once it plays no role anymore.
    fn forget_if_unused(&mut self, id: InstanceId) {
        let unused = self
            .objects
            .get(&id)
            .map_or(false, |instance| !instance.has_time_data());
        if unused && !self.snapshot.contains(&id) {
            self.objects.shift_remove(&id);
        }
    }
}

/// Classified content of one heap of a capture.
///
/// Owns its instances and the classification tree built over them. Reads
/// through [`HeapSet::children`] see the tree filtered by the current filter.
#[derive(Debug)]
pub struct HeapSet {
    heap_id: HeapId,
    name: String,
    tree: ClassifierTree,
    store: InstanceStore,
    filter: Option<Filter>,
    needs_refiltering: bool,
    in_batch: bool,
}

impl HeapSet {
    pub fn new(heap_id: HeapId, name: &str) -> Self {
        HeapSet {
            heap_id,
            name: name.to_string(),
            tree: ClassifierTree::new(heap_id, name, ClassGrouping::default()),
            store: InstanceStore::default(),
            filter: None,
            needs_refiltering: false,
            in_batch: false,
        }
    }

    pub fn heap_id(&self) -> HeapId {
        self.heap_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_grouping(&self) -> ClassGrouping {
        self.tree.grouping()
    }

    pub fn filter(&self) -> Option<&Filter> {
        self.filter.as_ref()
    }

    pub fn instances_count(&self) -> usize {
        self.store.len()
    }

    pub fn instance(&self, id: InstanceId) -> Option<&InstanceObject> {
        self.store.instance(id)
    }

    pub fn root(&self) -> NodeId {
        ClassifierTree::ROOT
    }

    pub fn node(&self, id: NodeId) -> &ClassifierSet {
        self.tree.node(id)
    }

    /// Heap level aggregates, filtered when a filter is active.
    pub fn root_set(&self) -> &ClassifierSet {
        self.tree.root()
    }

    /// Rebuilds the tree under `grouping`. Returns `false` when unchanged.
    pub fn set_class_grouping(&mut self, grouping: ClassGrouping) -> bool {
        if self.tree.grouping() == grouping {
            return false;
        }
        log::debug!("heap `{}` regrouped by {}", self.name, grouping);
        self.tree.reset(grouping);
        for id in self.store.objects.keys() {
            self.tree.place_instance_object(&self.store, *id);
        }
        self.needs_refiltering = self.filter.is_some();
        self.refilter_if_needed();
        true
    }

    /// Installs `filter`. Returns `false` when it equals the current one.
    pub fn select_filter(&mut self, filter: Option<Filter>) -> bool {
        if self.filter == filter {
            return false;
        }
        self.filter = filter;
        self.tree.apply_filter(&self.store, self.filter.as_ref());
        self.needs_refiltering = false;
        true
    }

    /// Re-evaluates the filter after content changes.
    fn refilter_if_needed(&mut self) {
        if self.needs_refiltering {
            self.tree.apply_filter(&self.store, self.filter.as_ref());
            self.needs_refiltering = false;
        }
    }

    fn mark_changed(&mut self) {
        if self.filter.is_some() {
            self.needs_refiltering = true;
        }
    }

    /// Brings the filtered aggregates up to date unless a batch is running.
    fn settle(&mut self) {
        if !self.in_batch {
            self.refilter_if_needed();
        }
    }

    /// Removes every instance, keeping grouping and filter.
    pub fn clear(&mut self) {
        self.store.clear();
        self.tree.clear_classifier_sets();
        self.mark_changed();
        self.settle();
    }

    /// Records `instance` as alive at the window start. Its timestamps are
    /// ignored, they belong to the delta roles.
    pub fn add_snapshot_instance_object(&mut self, mut instance: InstanceObject) -> bool {
        let id = instance.id;
        instance.alloc_time = NO_ALLOC_TIME;
        instance.dealloc_time = NO_DEALLOC_TIME;
        self.store.upsert(instance);
        if !self.store.snapshot.insert(id) {
            return false;
        }
        self.mark_changed();
        self.tree.add_snapshot_instance_object(&self.store, id);
        self.settle();
        true
    }

    pub fn remove_snapshot_instance_object(&mut self, id: InstanceId) -> bool {
        if !self.store.snapshot.remove(&id) {
            return false;
        }
        self.mark_changed();
        self.tree.remove_snapshot_instance_object(&self.store, id);
        self.store.forget_if_unused(id);
        self.settle();
        true
    }

    /// Records the allocation of `instance` inside the window.
    pub fn add_delta_instance_object(&mut self, instance: InstanceObject) -> bool {
        if !instance.has_alloc_time() {
            log::warn!("allocation of {} carries no timestamp, ignored", instance.id);
            return false;
        }
        let id = instance.id;
        let already_allocated = self
            .store
            .instance(id)
            .map_or(false, InstanceObject::has_alloc_time);
        if already_allocated {
            return false;
        }
        self.store.upsert(instance);
        self.mark_changed();
        self.tree.add_delta_instance_object(&self.store, id);
        self.settle();
        true
    }

    /// Records the deallocation of `instance` inside the window.
    pub fn free_delta_instance_object(&mut self, instance: InstanceObject) -> bool {
        if !instance.has_dealloc_time() {
            log::warn!("deallocation of {} carries no timestamp, ignored", instance.id);
            return false;
        }
        let id = instance.id;
        let already_freed = self
            .store
            .instance(id)
            .map_or(false, InstanceObject::has_dealloc_time);
        if already_freed {
            return false;
        }
        self.store.upsert(instance);
        self.mark_changed();
        self.tree.free_delta_instance_object(&self.store, id);
        self.settle();
        true
    }

    pub fn remove_added_delta_instance_object(&mut self, id: InstanceId) -> bool {
        let Some(stored) = self.store.objects.get_mut(&id) else {
            return false;
        };
        if !stored.has_alloc_time() {
            return false;
        }
        stored.alloc_time = NO_ALLOC_TIME;
        if self.tree.remove_added_delta_instance_object(&self.store, id) {
            log::trace!("{} left heap `{}`", id, self.name);
        }
        self.mark_changed();
        self.store.forget_if_unused(id);
        self.settle();
        true
    }

    pub fn remove_freed_delta_instance_object(&mut self, id: InstanceId) -> bool {
        let Some(stored) = self.store.objects.get_mut(&id) else {
            return false;
        };
        if !stored.has_dealloc_time() {
            return false;
        }
        stored.dealloc_time = NO_DEALLOC_TIME;
        stored.dealloc_thread = None;
        self.tree.remove_freed_delta_instance_object(&self.store, id);
        self.mark_changed();
        self.store.forget_if_unused(id);
        self.settle();
        true
    }

    pub fn apply(&mut self, delta: HeapDelta) -> bool {
        match delta {
            HeapDelta::AddSnapshot(instance) => self.add_snapshot_instance_object(instance),
            HeapDelta::RemoveSnapshot(id) => self.remove_snapshot_instance_object(id),
            HeapDelta::AddAllocation(instance) => self.add_delta_instance_object(instance),
            HeapDelta::RemoveAllocation(id) => self.remove_added_delta_instance_object(id),
            HeapDelta::AddDeallocation(instance) => self.free_delta_instance_object(instance),
            HeapDelta::RemoveDeallocation(id) => self.remove_freed_delta_instance_object(id),
            HeapDelta::Clear => {
                self.clear();
                true
            }
        }
    }

    /// Applies `deltas` in order and re-evaluates the filter once at the end.
    /// Returns how many of them changed the heap.
    pub fn apply_batch(&mut self, deltas: impl IntoIterator<Item = HeapDelta>) -> usize {
        self.in_batch = true;
        let mut applied = 0;
        for delta in deltas {
            if self.apply(delta) {
                applied += 1;
            }
        }
        self.in_batch = false;
        self.refilter_if_needed();
        applied
    }

    /// Visible non empty children of `node`.
    pub fn children(&mut self, node: NodeId) -> Vec<NodeId> {
        self.refilter_if_needed();
        self.tree.children(&self.store, node)
    }

    /// Non empty children of `node`, including the ones the filter hides.
    pub fn all_children(&mut self, node: NodeId) -> Vec<NodeId> {
        self.refilter_if_needed();
        self.tree.all_children(&self.store, node)
    }

    /// Same sets as [`HeapSet::children`]: the ones passing the filter.
    pub fn filtered_children(&mut self, node: NodeId) -> Vec<NodeId> {
        self.refilter_if_needed();
        self.tree.filtered_children(&self.store, node)
    }

    /// Every instance classified below `node`.
    pub fn instances(&self, node: NodeId) -> Vec<&InstanceObject> {
        self.tree
            .instances(node)
            .into_iter()
            .filter_map(|id| self.store.instance(id))
            .collect()
    }
}
