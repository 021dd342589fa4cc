pub mod filter;
pub mod strategy;

use std::mem;
use std::ops::{AddAssign, Neg, SubAssign};

use ahash::RandomState;
use indexmap::{IndexMap, IndexSet};

use crate::capture::HeapId;
use crate::classifier::filter::Filter;
use crate::classifier::strategy::{ClassGrouping, Classifier, SetKey, SetKind};
use crate::instance::{InstanceId, InstanceObject};

/// Read access to the instances a tree classifies.
///
/// The tree only stores instance ids, the owning heap keeps the objects.
pub trait InstanceLookup {
    fn instance(&self, id: InstanceId) -> Option<&InstanceObject>;

    /// Whether `id` is part of the snapshot at the window start.
    fn is_snapshot(&self, id: InstanceId) -> bool;
}

/// Capacity in which an instance contributes to a set.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Snapshot,
    Allocation,
    Deallocation,
}

/// Aggregates of a set, maintained incrementally.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct SetStats {
    pub snapshot_count: i64,
    pub delta_allocation_count: i64,
    pub delta_deallocation_count: i64,
    /// Alive totals: snapshot and allocations count positive, deallocations negative.
    pub total_shallow_size: i64,
    pub total_native_size: i64,
    pub total_retained_size: i64,
    pub allocation_size: i64,
    pub deallocation_size: i64,
    /// Distinct instances, whatever their roles.
    pub instance_count: i64,
    pub stack_info_count: i64,
}

impl SetStats {
    fn for_role(instance: &InstanceObject, role: Role) -> SetStats {
        let shallow = instance.valid_shallow_size();
        let mut stats = SetStats {
            total_shallow_size: shallow,
            total_native_size: instance.valid_native_size(),
            total_retained_size: instance.valid_retained_size(),
            ..SetStats::default()
        };
        match role {
            Role::Snapshot => stats.snapshot_count = 1,
            Role::Allocation => {
                stats.delta_allocation_count = 1;
                stats.allocation_size = shallow;
            }
            Role::Deallocation => {
                stats.delta_deallocation_count = 1;
                stats.deallocation_size = shallow;
                stats.total_shallow_size = -stats.total_shallow_size;
                stats.total_native_size = -stats.total_native_size;
                stats.total_retained_size = -stats.total_retained_size;
                return stats;
            }
        }
        stats
    }

    fn for_membership(instance: &InstanceObject) -> SetStats {
        SetStats {
            instance_count: 1,
            stack_info_count: i64::from(instance.has_stack_info()),
            ..SetStats::default()
        }
    }

    /// Every role `instance` currently plays plus its membership.
    fn for_instance(instance: &InstanceObject, in_snapshot: bool) -> SetStats {
        let mut stats = SetStats::for_membership(instance);
        if in_snapshot {
            stats += SetStats::for_role(instance, Role::Snapshot);
        }
        if instance.has_alloc_time() {
            stats += SetStats::for_role(instance, Role::Allocation);
        }
        if instance.has_dealloc_time() {
            stats += SetStats::for_role(instance, Role::Deallocation);
        }
        stats
    }

    /// Objects alive at the window end.
    pub fn total_object_count(&self) -> i64 {
        self.snapshot_count + self.delta_allocation_count - self.delta_deallocation_count
    }

    pub fn is_empty(&self) -> bool {
        self.instance_count == 0
    }
}

impl AddAssign for SetStats {
    fn add_assign(&mut self, rhs: SetStats) {
        self.snapshot_count += rhs.snapshot_count;
        self.delta_allocation_count += rhs.delta_allocation_count;
        self.delta_deallocation_count += rhs.delta_deallocation_count;
        self.total_shallow_size += rhs.total_shallow_size;
        self.total_native_size += rhs.total_native_size;
        self.total_retained_size += rhs.total_retained_size;
        self.allocation_size += rhs.allocation_size;
        self.deallocation_size += rhs.deallocation_size;
        self.instance_count += rhs.instance_count;
        self.stack_info_count += rhs.stack_info_count;
    }
}

impl Neg for SetStats {
    type Output = SetStats;

    fn neg(self) -> SetStats {
        let mut negated = SetStats::default();
        negated -= self;
        negated
    }
}

impl SubAssign for SetStats {
    fn sub_assign(&mut self, rhs: SetStats) {
        self.snapshot_count -= rhs.snapshot_count;
        self.delta_allocation_count -= rhs.delta_allocation_count;
        self.delta_deallocation_count -= rhs.delta_deallocation_count;
        self.total_shallow_size -= rhs.total_shallow_size;
        self.total_native_size -= rhs.total_native_size;
        self.total_retained_size -= rhs.total_retained_size;
        self.allocation_size -= rhs.allocation_size;
        self.deallocation_size -= rhs.deallocation_size;
        self.instance_count -= rhs.instance_count;
        self.stack_info_count -= rhs.stack_info_count;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

type InstanceIndex = IndexSet<InstanceId, RandomState>;

#[derive(Debug)]
struct Partition {
    classifier: Classifier,
    children: IndexMap<SetKey, NodeId, RandomState>,
}

/// One node of the classification tree.
///
/// An unpartitioned node holds its instances directly. Once partitioned the
/// instances live in the children and the node only keeps aggregates.
#[derive(Debug)]
pub struct ClassifierSet {
    kind: SetKind,
    parent: Option<NodeId>,
    stats: SetStats,
    visible_stats: Option<SetStats>,
    matched: bool,
    filtered: bool,
    instances: InstanceIndex,
    partition: Option<Partition>,
}

impl ClassifierSet {
    fn new(kind: SetKind, parent: Option<NodeId>) -> Self {
        ClassifierSet {
            kind,
            parent,
            stats: SetStats::default(),
            visible_stats: None,
            matched: false,
            filtered: false,
            instances: InstanceIndex::default(),
            partition: None,
        }
    }

    pub fn kind(&self) -> &SetKind {
        &self.kind
    }

    pub fn label(&self) -> String {
        self.kind.label()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Counts restricted to the visible part of the set while a filter is
    /// active. Instance and stack counts are never filtered.
    pub fn stats(&self) -> SetStats {
        match self.visible_stats {
            Some(mut visible) => {
                visible.instance_count = self.stats.instance_count;
                visible.stack_info_count = self.stats.stack_info_count;
                visible
            }
            None => self.stats,
        }
    }

    /// Counts ignoring any filter.
    pub fn unfiltered_stats(&self) -> SetStats {
        self.stats
    }

    pub fn snapshot_count(&self) -> i64 {
        self.stats().snapshot_count
    }

    pub fn delta_allocation_count(&self) -> i64 {
        self.stats().delta_allocation_count
    }

    pub fn delta_deallocation_count(&self) -> i64 {
        self.stats().delta_deallocation_count
    }

    pub fn total_object_count(&self) -> i64 {
        self.stats().total_object_count()
    }

    pub fn instances_count(&self) -> i64 {
        self.stats.instance_count
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn has_stack_info(&self) -> bool {
        self.stats.stack_info_count > 0
    }

    /// Hidden by the active filter.
    pub fn is_filtered(&self) -> bool {
        self.filtered
    }

    /// The label itself matched the active filter.
    pub fn is_matched(&self) -> bool {
        self.matched
    }

    pub fn is_partitioned(&self) -> bool {
        self.partition.is_some()
    }
}

/// Arena backed classification tree of one heap.
///
/// Children are created lazily: a node splits its instances the first time
/// its children are read, and every later insertion is routed through the
/// existing partitions down to a leaf.
#[derive(Debug)]
pub struct ClassifierTree {
    grouping: ClassGrouping,
    nodes: Vec<ClassifierSet>,
}

impl ClassifierTree {
    pub const ROOT: NodeId = NodeId(0);

    pub fn new(heap_id: HeapId, name: &str, grouping: ClassGrouping) -> Self {
        let root = ClassifierSet::new(
            SetKind::Heap {
                heap_id,
                name: name.into(),
            },
            None,
        );
        ClassifierTree {
            grouping,
            nodes: vec![root],
        }
    }

    pub fn grouping(&self) -> ClassGrouping {
        self.grouping
    }

    pub fn node(&self, id: NodeId) -> &ClassifierSet {
        &self.nodes[id.0]
    }

    pub fn root(&self) -> &ClassifierSet {
        self.node(Self::ROOT)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Drops every child set and all instances, keeping the root.
    pub fn clear_classifier_sets(&mut self) {
        self.nodes.truncate(1);
        let root = &mut self.nodes[0];
        root.stats = SetStats::default();
        root.visible_stats = None;
        root.matched = false;
        root.filtered = false;
        root.instances.clear();
        root.partition = None;
    }

    /// Clears the tree and switches the first level grouping.
    pub fn reset(&mut self, grouping: ClassGrouping) {
        self.grouping = grouping;
        self.clear_classifier_sets();
    }

    pub fn add_snapshot_instance_object<L: InstanceLookup>(&mut self, lookup: &L, id: InstanceId) -> bool {
        self.add_role(lookup, id, Role::Snapshot)
    }

    pub fn add_delta_instance_object<L: InstanceLookup>(&mut self, lookup: &L, id: InstanceId) -> bool {
        self.add_role(lookup, id, Role::Allocation)
    }

    pub fn free_delta_instance_object<L: InstanceLookup>(&mut self, lookup: &L, id: InstanceId) -> bool {
        self.add_role(lookup, id, Role::Deallocation)
    }

    /// `lookup` must already reflect the removed role when called.
    pub fn remove_snapshot_instance_object<L: InstanceLookup>(
        &mut self,
        lookup: &L,
        id: InstanceId,
    ) -> bool {
        self.remove_role(lookup, id, Role::Snapshot)
    }

    pub fn remove_added_delta_instance_object<L: InstanceLookup>(
        &mut self,
        lookup: &L,
        id: InstanceId,
    ) -> bool {
        self.remove_role(lookup, id, Role::Allocation)
    }

    pub fn remove_freed_delta_instance_object<L: InstanceLookup>(
        &mut self,
        lookup: &L,
        id: InstanceId,
    ) -> bool {
        self.remove_role(lookup, id, Role::Deallocation)
    }

    /// Places `id` with every role it currently plays, used when rebuilding.
    pub fn place_instance_object<L: InstanceLookup>(&mut self, lookup: &L, id: InstanceId) -> bool {
        let Some(instance) = lookup.instance(id) else {
            return false;
        };
        let leaf = self.locate(instance);
        if !self.nodes[leaf.0].instances.insert(id) {
            return false;
        }
        let stats = SetStats::for_instance(instance, lookup.is_snapshot(id));
        self.propagate(leaf, stats);
        true
    }

    /// Returns whether `id` became a new member of the tree.
    fn add_role<L: InstanceLookup>(&mut self, lookup: &L, id: InstanceId, role: Role) -> bool {
        let Some(instance) = lookup.instance(id) else {
            log::warn!("cannot classify unknown instance {}", id);
            return false;
        };
        let leaf = self.locate(instance);
        let mut delta = SetStats::for_role(instance, role);
        let inserted = self.nodes[leaf.0].instances.insert(id);
        if inserted {
            delta += SetStats::for_membership(instance);
        }
        self.propagate(leaf, delta);
        inserted
    }

    /// Returns whether `id` left the tree. Instances still in the snapshot or
    /// still carrying time data stay members.
    fn remove_role<L: InstanceLookup>(&mut self, lookup: &L, id: InstanceId, role: Role) -> bool {
        let Some(instance) = lookup.instance(id) else {
            log::warn!("cannot remove unknown instance {}", id);
            return false;
        };
        let Some(leaf) = self.find(instance, id) else {
            log::debug!("instance {} is not classified, nothing to remove", id);
            return false;
        };
        let mut delta = -SetStats::for_role(instance, role);
        let retain = lookup.is_snapshot(id) || instance.has_time_data();
        let removed = !retain && self.nodes[leaf.0].instances.shift_remove(&id);
        if removed {
            delta -= SetStats::for_membership(instance);
        }
        self.propagate(leaf, delta);
        removed
    }

    /// Leaf `instance` belongs to, creating the missing child sets on the way.
    fn locate(&mut self, instance: &InstanceObject) -> NodeId {
        let mut node = Self::ROOT;
        loop {
            let Some(partition) = &self.nodes[node.0].partition else {
                return node;
            };
            let classifier = partition.classifier;
            let key = classifier.classify(instance);
            let existing = partition.children.get(&key).copied();
            node = match existing {
                Some(child) => child,
                None => self.create_child(node, classifier, key, instance),
            };
        }
    }

    /// Leaf currently holding `id`, without creating anything.
    fn find(&self, instance: &InstanceObject, id: InstanceId) -> Option<NodeId> {
        let mut node = Self::ROOT;
        loop {
            let set = &self.nodes[node.0];
            match &set.partition {
                None => return set.instances.contains(&id).then_some(node),
                Some(partition) => {
                    let key = partition.classifier.classify(instance);
                    node = *partition.children.get(&key)?;
                }
            }
        }
    }

    fn create_child(
        &mut self,
        parent: NodeId,
        classifier: Classifier,
        key: SetKey,
        instance: &InstanceObject,
    ) -> NodeId {
        let child = NodeId(self.nodes.len());
        let kind = classifier.child_kind(&key, instance);
        self.nodes.push(ClassifierSet::new(kind, Some(parent)));
        if let Some(partition) = &mut self.nodes[parent.0].partition {
            partition.children.insert(key, child);
        }
        child
    }

    fn propagate(&mut self, from: NodeId, delta: SetStats) {
        let mut current = Some(from);
        while let Some(node) = current {
            let set = &mut self.nodes[node.0];
            set.stats += delta;
            current = set.parent;
        }
    }

    /// Splits the instances of `node` into child sets, once.
    fn ensure_partition<L: InstanceLookup>(&mut self, lookup: &L, node: NodeId) {
        let set = &mut self.nodes[node.0];
        if set.partition.is_some() {
            return;
        }
        let Some(classifier) = set.kind.sub_classifier(self.grouping) else {
            return;
        };
        let instances = mem::take(&mut set.instances);
        set.partition = Some(Partition {
            classifier,
            children: IndexMap::default(),
        });

        for id in instances {
            let Some(instance) = lookup.instance(id) else {
                log::warn!("dropping unknown instance {} while partitioning", id);
                continue;
            };
            let key = classifier.classify(instance);
            let existing = self.nodes[node.0]
                .partition
                .as_ref()
                .and_then(|partition| partition.children.get(&key).copied());
            let child = match existing {
                Some(child) => child,
                None => self.create_child(node, classifier, key, instance),
            };
            let child_set = &mut self.nodes[child.0];
            child_set.instances.insert(id);
            child_set.stats += SetStats::for_instance(instance, lookup.is_snapshot(id));
        }
    }

    fn partition_children(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes[node.0]
            .partition
            .as_ref()
            .map(|partition| partition.children.values().copied().collect())
            .unwrap_or_default()
    }

    /// Non empty children, in insertion order, partitioning `node` if needed.
    pub fn all_children<L: InstanceLookup>(&mut self, lookup: &L, node: NodeId) -> Vec<NodeId> {
        self.ensure_partition(lookup, node);
        self.partition_children(node)
            .into_iter()
            .filter(|child| !self.nodes[child.0].is_empty())
            .collect()
    }

    /// Non empty children not hidden by the active filter.
    pub fn children<L: InstanceLookup>(&mut self, lookup: &L, node: NodeId) -> Vec<NodeId> {
        self.filtered_children(lookup, node)
    }

    /// Non empty children passing the active filter, every non empty child
    /// when no filter is set.
    pub fn filtered_children<L: InstanceLookup>(&mut self, lookup: &L, node: NodeId) -> Vec<NodeId> {
        self.all_children(lookup, node)
            .into_iter()
            .filter(|child| !self.nodes[child.0].filtered)
            .collect()
    }

    /// Every instance below `node`, partitioned or not.
    pub fn instances(&self, node: NodeId) -> Vec<InstanceId> {
        let mut instances = Vec::new();
        let mut stack = vec![node];
        while let Some(current) = stack.pop() {
            let set = &self.nodes[current.0];
            instances.extend(set.instances.iter().copied());
            if let Some(partition) = &set.partition {
                stack.extend(partition.children.values().rev().copied());
            }
        }
        instances
    }

    /// Recomputes visibility for the whole tree, fully partitioning it when a
    /// filter is set.
    pub fn apply_filter<L: InstanceLookup>(&mut self, lookup: &L, filter: Option<&Filter>) {
        match filter {
            None => {
                for set in &mut self.nodes {
                    set.visible_stats = None;
                    set.matched = false;
                    set.filtered = false;
                }
            }
            Some(filter) => {
                self.filter_node(lookup, Self::ROOT, filter, false);
                self.nodes[0].filtered = false;
            }
        }
    }

    fn filter_node<L: InstanceLookup>(
        &mut self,
        lookup: &L,
        node: NodeId,
        filter: &Filter,
        ancestor_matched: bool,
    ) -> bool {
        self.ensure_partition(lookup, node);
        let matched = node != Self::ROOT && self.nodes[node.0].kind.matches(filter);
        let include_all = ancestor_matched || matched;

        let mut visible = if include_all {
            self.nodes[node.0].stats
        } else {
            SetStats::default()
        };
        let mut visible_child = false;
        for child in self.partition_children(node) {
            if self.filter_node(lookup, child, filter, include_all) {
                visible_child = true;
                if !include_all {
                    if let Some(child_visible) = self.nodes[child.0].visible_stats {
                        visible += child_visible;
                    }
                }
            }
        }

        let is_visible = include_all || visible_child;
        let set = &mut self.nodes[node.0];
        set.visible_stats = Some(visible);
        set.matched = matched;
        set.filtered = !is_visible;
        is_visible
    }
}
