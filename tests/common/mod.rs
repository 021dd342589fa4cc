#![allow(dead_code)]

use std::time::Duration;

use heap_sift::capture::live::LiveAllocationCapture;
use heap_sift::capture::{CaptureObject, HeapId};
use heap_sift::classifier::NodeId;
use heap_sift::heap_set::HeapSet;
use heap_sift::parser::trace_record::TraceRecord;
use heap_sift::source::{
    AllocatedClass, AllocationData, AllocationMethod, AllocationStack, ThreadDescriptor,
};
use heap_sift::trace_log::TraceLog;

pub const WAIT: Duration = Duration::from_secs(10);

pub const FOO: i64 = 1;
pub const BAR: i64 = 2;
pub const ALSO_FOO: i64 = 3;
pub const ALSO_BAR: i64 = 4;

const CLASSES: [(i64, &str); 4] = [
    (FOO, "This.Is.Foo"),
    (BAR, "That.Is.Bar"),
    (ALSO_FOO, "This.Also.Foo"),
    (ALSO_BAR, "That.Also.Bar"),
];

const METHODS: [(u64, &str, &str); 4] = [
    (1, "FooMethodA", "This.Is.Foo"),
    (2, "BarMethodA", "That.Is.Bar"),
    (3, "FooMethodB", "This.Also.Foo"),
    (4, "BarMethodB", "That.Also.Bar"),
];

// innermost frame first
const STACKS: [(u64, [u64; 2]); 4] = [(1, [1, 2]), (2, [2, 3]), (3, [3, 4]), (4, [4, 1])];

pub fn us(micros: i64) -> i64 {
    micros * 1000
}

pub fn contexts_at_zero() -> Vec<TraceRecord> {
    let mut records = Vec::new();
    for (class_id, class_name) in CLASSES {
        records.push(TraceRecord::Class {
            timestamp: 0,
            class: AllocatedClass {
                class_id,
                super_class_id: None,
                class_name: class_name.to_string(),
            },
        });
    }
    for (method_id, method_name, class_name) in METHODS {
        records.push(TraceRecord::Method {
            timestamp: 0,
            method: AllocationMethod {
                method_id,
                method_name: method_name.to_string(),
                class_name: class_name.to_string(),
            },
        });
    }
    for (stack_id, frames) in STACKS {
        records.push(TraceRecord::Stack {
            timestamp: 0,
            stack: AllocationStack {
                stack_id,
                frames: frames.iter().map(|method_id| (*method_id, 10)).collect(),
            },
        });
    }
    for (thread_id, name) in [(1, "main"), (2, "worker")] {
        records.push(TraceRecord::Thread {
            timestamp: 0,
            thread: ThreadDescriptor {
                thread_id,
                name: name.to_string(),
            },
        });
    }
    records
}

pub fn alloc(at_us: i64, tag: u64, class_tag: i64, heap_id: HeapId) -> TraceRecord {
    TraceRecord::Alloc {
        timestamp: us(at_us),
        data: AllocationData {
            tag,
            class_tag,
            size: 16,
            length: -1,
            heap_id,
            thread_id: Some(1 + (tag % 2) as u32),
            stack_id: Some(class_tag as u64),
        },
    }
}

pub fn free(at_us: i64, tag: u64) -> TraceRecord {
    TraceRecord::Free {
        timestamp: us(at_us),
        tag,
    }
}

/// Every period `p` spans 4µs starting at `4p`: the four classes get
/// allocated one per µs, `This.Is.Foo` and `That.Is.Bar` die two µs later and
/// the `Also` classes four µs later.
pub fn periodic_trace(periods: u64) -> TraceLog {
    let mut records = contexts_at_zero();
    for period in 0..periods {
        let base = 4 * period as i64;
        let tag = 4 * period;
        records.push(alloc(base, tag, FOO, 3));
        records.push(alloc(base + 1, tag + 1, BAR, 3));
        records.push(alloc(base + 2, tag + 2, ALSO_FOO, 3));
        records.push(free(base + 2, tag));
        records.push(alloc(base + 3, tag + 3, ALSO_BAR, 3));
        records.push(free(base + 3, tag + 1));
        records.push(free(base + 4, tag + 2));
        records.push(free(base + 5, tag + 3));
    }
    TraceLog::from_records(records)
}

/// `(allocations, deallocations, total, instances)` of a node.
pub fn counts(heap: &HeapSet, node: NodeId) -> (i64, i64, i64, i64) {
    let set = heap.node(node);
    (
        set.delta_allocation_count(),
        set.delta_deallocation_count(),
        set.total_object_count(),
        set.instances_count(),
    )
}

pub fn child(heap: &mut HeapSet, node: NodeId, label: &str) -> NodeId {
    let children = heap.children(node);
    children
        .into_iter()
        .find(|child| heap.node(*child).label() == label)
        .unwrap_or_else(|| panic!("no child `{}` under `{}`", label, heap.node(node).label()))
}

pub fn load(capture: &mut LiveAllocationCapture, start_us: i64, end_us: i64) {
    capture.load(start_us, end_us).unwrap();
    capture.wait_for_load(WAIT).unwrap();
}

pub fn app_heap(capture: &mut LiveAllocationCapture) -> &mut HeapSet {
    capture.heap_set_mut(3).unwrap()
}
