pub mod context;
pub mod live;
mod worker;

use std::time::Duration;

use ahash::RandomState;
use indexmap::IndexMap;

use crate::capture::context::ContextIndex;
use crate::classifier::filter::Filter;
use crate::classifier::strategy::ClassGrouping;
use crate::errors::LoadError;
use crate::heap_set::{HeapDelta, HeapSet};
use crate::instance::{InstanceId, InstanceObject};
use crate::source::{AllocationEventSource, TimeRange};

pub type HeapId = i32;

pub const DEFAULT_HEAP_ID: HeapId = 0;
pub const IMAGE_HEAP_ID: HeapId = 1;
pub const ZYGOTE_HEAP_ID: HeapId = 2;
pub const APP_HEAP_ID: HeapId = 3;
/// Synthetic heap holding JNI global references.
pub const JNI_HEAP_ID: HeapId = 4;

pub const DEFAULT_HEAP_NAME: &str = "default";
pub const IMAGE_HEAP_NAME: &str = "image";
pub const ZYGOTE_HEAP_NAME: &str = "zygote";
pub const APP_HEAP_NAME: &str = "app";
pub const JNI_HEAP_NAME: &str = "JNI";

pub fn heap_name(heap_id: HeapId) -> Option<&'static str> {
    match heap_id {
        DEFAULT_HEAP_ID => Some(DEFAULT_HEAP_NAME),
        IMAGE_HEAP_ID => Some(IMAGE_HEAP_NAME),
        ZYGOTE_HEAP_ID => Some(ZYGOTE_HEAP_NAME),
        APP_HEAP_ID => Some(APP_HEAP_NAME),
        JNI_HEAP_ID => Some(JNI_HEAP_NAME),
        _ => None,
    }
}

pub fn heap_id_by_name(name: &str) -> Option<HeapId> {
    [DEFAULT_HEAP_ID, IMAGE_HEAP_ID, ZYGOTE_HEAP_ID, APP_HEAP_ID, JNI_HEAP_ID]
        .into_iter()
        .find(|heap_id| heap_name(*heap_id).is_some_and(|heap| heap.eq_ignore_ascii_case(name)))
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Padding applied on both sides of every range query, in nanoseconds.
    pub load_buffer_ns: i64,
    pub retry_interval: Duration,
    pub load_timeout: Duration,
    pub track_jni_references: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            load_buffer_ns: 5_000_000_000,
            retry_interval: Duration::from_millis(50),
            load_timeout: Duration::from_secs(10),
            track_jni_references: false,
        }
    }
}

/// Notification fired to capture listeners.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CaptureAspect {
    HeapUpdating,
    HeapUpdated,
    LoadError,
}

/// Changes computed for one window load.
#[derive(Debug, Clone)]
pub struct DeltaBatch {
    /// Window the deltas bring the heaps to.
    pub range: TimeRange,
    /// Heaps are cleared before the deltas apply.
    pub reset: bool,
    pub deltas: Vec<(HeapId, HeapDelta)>,
}

impl DeltaBatch {
    pub fn new(range: TimeRange) -> Self {
        DeltaBatch {
            range,
            reset: false,
            deltas: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.reset && self.deltas.is_empty()
    }

    /// Applies the batch to `heap_sets`, skipping heaps that are not tracked.
    pub fn apply_to(self, heap_sets: &mut [HeapSet]) {
        let mut by_heap: IndexMap<HeapId, Vec<HeapDelta>, RandomState> = IndexMap::default();
        if self.reset {
            for heap_set in heap_sets.iter() {
                by_heap.insert(heap_set.heap_id(), vec![HeapDelta::Clear]);
            }
        }
        for (heap_id, delta) in self.deltas {
            by_heap.entry(heap_id).or_default().push(delta);
        }
        for (heap_id, deltas) in by_heap {
            match heap_sets.iter_mut().find(|heap_set| heap_set.heap_id() == heap_id) {
                Some(heap_set) => {
                    heap_set.apply_batch(deltas);
                }
                None => log::warn!("dropping {} changes for untracked heap {}", deltas.len(), heap_id),
            }
        }
    }
}

/// Read model shared by every kind of capture.
pub trait CaptureObject {
    fn name(&self) -> &str;

    fn heap_sets(&self) -> &[HeapSet];

    fn heap_sets_mut(&mut self) -> &mut [HeapSet];

    fn is_done_loading(&self) -> bool;

    fn is_error(&self) -> bool;

    fn heap_set(&self, heap_id: HeapId) -> Option<&HeapSet> {
        self.heap_sets().iter().find(|heap_set| heap_set.heap_id() == heap_id)
    }

    fn heap_set_mut(&mut self, heap_id: HeapId) -> Option<&mut HeapSet> {
        self.heap_sets_mut()
            .iter_mut()
            .find(|heap_set| heap_set.heap_id() == heap_id)
    }

    /// Distinct instances across all heaps.
    fn instances_count(&self) -> usize {
        self.heap_sets().iter().map(HeapSet::instances_count).sum()
    }

    fn set_class_grouping(&mut self, grouping: ClassGrouping) {
        for heap_set in self.heap_sets_mut() {
            heap_set.set_class_grouping(grouping);
        }
    }

    fn select_filter(&mut self, filter: Option<Filter>) {
        for heap_set in self.heap_sets_mut() {
            heap_set.select_filter(filter.clone());
        }
    }
}

/// Static capture of the objects alive at one point in time.
#[derive(Debug)]
pub struct HeapDumpCapture {
    name: String,
    heap_sets: Vec<HeapSet>,
}

impl HeapDumpCapture {
    pub fn new(name: &str) -> Self {
        HeapDumpCapture {
            name: name.to_string(),
            heap_sets: Vec::new(),
        }
    }

    /// Objects alive at `at` (nanoseconds), plus the JNI references alive
    /// then when `track_jni_references` is set.
    pub fn from_source<S: AllocationEventSource>(
        name: &str,
        source: &S,
        at: i64,
        track_jni_references: bool,
    ) -> Result<Self, LoadError> {
        let mut contexts = ContextIndex::new();
        contexts.register(source.allocation_contexts(TimeRange::new(i64::MIN, at.saturating_add(1)))?);

        let mut capture = HeapDumpCapture::new(name);
        let mut referents = ahash::AHashMap::new();
        for data in source.allocation_snapshot(at)? {
            if let Some(instance) = contexts.object_template(&data) {
                if track_jni_references {
                    referents.insert(data.tag, instance.clone());
                }
                capture.add_instance_object(instance);
            }
        }
        if track_jni_references {
            for event in source.jni_reference_snapshot(at)? {
                match referents.get(&event.tag) {
                    Some(referent) => capture.add_instance_object(contexts.jni_template(&event, referent)),
                    None => log::debug!("JNI reference to unknown object @{} dropped", event.tag),
                }
            }
        }
        Ok(capture)
    }

    pub fn add_instance_object(&mut self, instance: InstanceObject) {
        let heap_id = instance.heap_id;
        let position = match self.heap_sets.iter().position(|heap_set| heap_set.heap_id() == heap_id) {
            Some(position) => position,
            None => {
                let name = heap_name(heap_id)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("heap-{}", heap_id));
                self.heap_sets.push(HeapSet::new(heap_id, &name));
                self.heap_sets.len() - 1
            }
        };
        self.heap_sets[position].add_snapshot_instance_object(instance);
    }

    pub fn remove_instance_object(&mut self, heap_id: HeapId, id: InstanceId) -> bool {
        self.heap_set_mut(heap_id)
            .map_or(false, |heap_set| heap_set.remove_snapshot_instance_object(id))
    }
}

impl CaptureObject for HeapDumpCapture {
    fn name(&self) -> &str {
        &self.name
    }

    fn heap_sets(&self) -> &[HeapSet] {
        &self.heap_sets
    }

    fn heap_sets_mut(&mut self) -> &mut [HeapSet] {
        &mut self.heap_sets
    }

    fn is_done_loading(&self) -> bool {
        true
    }

    fn is_error(&self) -> bool {
        false
    }
}
