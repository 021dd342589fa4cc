mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use heap_sift::capture::live::LiveAllocationCapture;
use heap_sift::capture::{CaptureAspect, CaptureConfig, CaptureObject, JNI_HEAP_ID};
use heap_sift::classifier::filter::Filter;
use heap_sift::classifier::strategy::ClassGrouping;
use heap_sift::errors::{HeapSiftError, SourceError};
use heap_sift::parser::trace_record::TraceRecord;
use heap_sift::source::{
    AllocatedClass, AllocationContexts, AllocationData, AllocationEvent, AllocationEventSource, JniReferenceEvent,
    JniReferenceEventKind, TimeRange,
};
use heap_sift::trace_log::TraceLog;

use common::*;

fn capture_of(trace: TraceLog) -> LiveAllocationCapture {
    LiveAllocationCapture::new("periodic", trace, CaptureConfig::default()).unwrap()
}

#[test]
fn package_tree_of_first_period() {
    let mut capture = capture_of(periodic_trace(2));
    capture.set_class_grouping(ClassGrouping::ArrangeByPackage);
    load(&mut capture, 0, 4);
    assert_eq!(capture.loaded_range(), Some(TimeRange::new(0, us(4))));
    assert!(capture.is_done_loading());

    let heap = app_heap(&mut capture);
    let root = heap.root();
    assert_eq!(counts(heap, root), (4, 2, 2, 4));
    assert_eq!(heap.children(root).len(), 2);

    let this = child(heap, root, "This");
    assert_eq!(counts(heap, this), (2, 1, 1, 2));
    assert_eq!(heap.children(this).len(), 2);
    let is = child(heap, this, "Is");
    assert_eq!(counts(heap, is), (1, 1, 0, 1));
    let foo = child(heap, is, "Foo");
    assert_eq!(counts(heap, foo), (1, 1, 0, 1));
    assert!(heap.children(foo).is_empty());
    let also = child(heap, this, "Also");
    assert_eq!(counts(heap, also), (1, 0, 1, 1));
    assert_eq!(heap.children(also).len(), 1);

    let that = child(heap, root, "That");
    assert_eq!(counts(heap, that), (2, 1, 1, 2));
    let that_is = child(heap, that, "Is");
    assert_eq!(counts(heap, that_is), (1, 1, 0, 1));

    // other heaps stay empty
    assert!(capture.heap_set(0).unwrap().root_set().is_empty());
    assert_eq!(capture.instances_count(), 4);
}

#[test]
fn window_moves_match_expected_counts() {
    let mut capture = capture_of(periodic_trace(2));
    let expectations = [
        ((0, 4), (4, 2, 2, 4)),
        ((2, 4), (2, 2, 2, 4)),
        ((4, 4), (0, 0, 2, 2)),
        ((0, 2), (2, 0, 2, 2)),
        ((4, 8), (4, 4, 2, 6)),
        ((0, 8), (8, 6, 2, 8)),
        ((2, 8), (6, 6, 2, 8)),
        ((2, 4), (2, 2, 2, 4)),
    ];
    for ((start, end), expected) in expectations {
        load(&mut capture, start, end);
        let heap = app_heap(&mut capture);
        let root = heap.root();
        assert_eq!(counts(heap, root), expected, "window [{}, {})", start, end);
    }
}

#[test]
fn empty_window_has_no_children() {
    let mut capture = capture_of(periodic_trace(2));
    load(&mut capture, 0, 0);
    let heap = app_heap(&mut capture);
    let root = heap.root();
    assert_eq!(counts(heap, root), (0, 0, 0, 0));
    assert!(heap.children(root).is_empty());
    assert!(!heap.root_set().has_stack_info());
}

#[test]
fn window_end_is_capped_at_last_event() {
    // last event is the free at 9µs
    let mut capture = capture_of(periodic_trace(2));
    load(&mut capture, 0, 100);
    assert_eq!(capture.loaded_range(), Some(TimeRange::new(0, us(9) + 1)));
    let heap = app_heap(&mut capture);
    let root = heap.root();
    assert_eq!(counts(heap, root), (8, 8, 0, 8));
}

#[test]
fn class_filter_hides_other_packages() {
    let mut capture = capture_of(periodic_trace(2));
    capture.set_class_grouping(ClassGrouping::ArrangeByPackage);
    capture.select_filter(Filter::new("Foo", true, false).unwrap());
    load(&mut capture, 0, 4);

    let heap = app_heap(&mut capture);
    let root = heap.root();
    assert_eq!(counts(heap, root), (2, 1, 1, 4));
    let children = heap.children(root);
    assert_eq!(children.len(), 1);
    assert_eq!(heap.node(children[0]).label(), "This");
    // hidden sets are still reachable
    assert_eq!(heap.all_children(root).len(), 2);

    // lowercase does not match once case matters
    heap.select_filter(Filter::new("foo", true, false).unwrap());
    assert!(heap.children(root).is_empty());
    heap.select_filter(None);
    assert_eq!(counts(heap, root), (4, 2, 2, 4));
}

#[test]
fn callstack_filter_keeps_matching_frames() {
    let mut capture = capture_of(periodic_trace(2));
    capture.set_class_grouping(ClassGrouping::ArrangeByCallstack);
    load(&mut capture, 0, 4);
    {
        let heap = app_heap(&mut capture);
        let root = heap.root();
        assert_eq!(heap.children(root).len(), 4);
        let outer = child(heap, root, "BarMethodA() (That.Is.Bar)");
        let inner = child(heap, outer, "FooMethodA() (This.Is.Foo)");
        let class = child(heap, inner, "Foo");
        assert_eq!(counts(heap, class), (1, 1, 0, 1));
    }

    capture.select_filter(Filter::new("MethodA", false, false).unwrap());
    let heap = app_heap(&mut capture);
    let root = heap.root();
    let (allocations, deallocations, total, _) = counts(heap, root);
    assert_eq!((allocations, deallocations, total), (3, 2, 1));
    assert_eq!(heap.children(root).len(), 3);
}

#[test]
fn thread_grouping() {
    let mut capture = capture_of(periodic_trace(1));
    capture.set_class_grouping(ClassGrouping::ArrangeByThread);
    load(&mut capture, 0, 4);
    let heap = app_heap(&mut capture);
    let root = heap.root();
    let main = child(heap, root, "main");
    let worker = child(heap, root, "worker");
    // even tags run on main
    assert_eq!(counts(heap, main).3, 2);
    assert_eq!(counts(heap, worker).3, 2);
}

#[test]
fn regrouping_keeps_loaded_content() {
    let mut capture = capture_of(periodic_trace(2));
    load(&mut capture, 0, 8);
    capture.set_class_grouping(ClassGrouping::ArrangeByPackage);
    let heap = app_heap(&mut capture);
    let root = heap.root();
    assert_eq!(counts(heap, root), (8, 6, 2, 8));
    assert_eq!(heap.children(root).len(), 2);
}

#[test]
fn allocation_freed_after_window_shift() {
    let records = vec![
        contexts_at_zero(),
        vec![alloc(60, 1, FOO, 3), free(120, 1), alloc(400, 2, BAR, 3)],
    ]
    .concat();
    let mut capture = capture_of(TraceLog::from_records(records));

    load(&mut capture, 0, 100);
    let heap = app_heap(&mut capture);
    let root = heap.root();
    assert_eq!(counts(heap, root), (1, 0, 1, 1));
    assert_eq!(heap.root_set().stats().total_shallow_size, 16);

    load(&mut capture, 50, 150);
    let heap = app_heap(&mut capture);
    assert_eq!(counts(heap, root), (1, 1, 0, 1));
    assert_eq!(heap.root_set().stats().total_shallow_size, 0);

    // the allocation leaves the window, the object still died in it
    load(&mut capture, 100, 150);
    let heap = app_heap(&mut capture);
    assert_eq!(counts(heap, root), (0, 1, 0, 1));
    assert_eq!(heap.root_set().snapshot_count(), 1);
}

#[test]
fn unknown_classes_are_skipped() {
    let records = vec![contexts_at_zero(), vec![alloc(1, 1, 99, 3), alloc(2, 2, FOO, 3)]].concat();
    let mut capture = capture_of(TraceLog::from_records(records));
    load(&mut capture, 0, 10);
    let heap = app_heap(&mut capture);
    let root = heap.root();
    assert_eq!(counts(heap, root), (1, 0, 1, 1));
}

fn jni(kind: JniReferenceEventKind, at_us: i64, tag: u64) -> TraceRecord {
    TraceRecord::Jni(JniReferenceEvent {
        kind,
        timestamp: us(at_us),
        tag,
        ref_value: 0x100 + tag,
        thread_id: Some(1),
        backtrace: Some(vec![0xdead, 0xbeef].into()),
    })
}

#[test]
fn jni_references_have_their_own_heap() {
    let records = vec![
        contexts_at_zero(),
        vec![
            alloc(1, 1, FOO, 3),
            jni(JniReferenceEventKind::Create, 2, 1),
            jni(JniReferenceEventKind::Create, 2, 77),
            jni(JniReferenceEventKind::Delete, 3, 1),
            alloc(10, 2, BAR, 3),
        ],
    ]
    .concat();
    let config = CaptureConfig {
        track_jni_references: true,
        ..CaptureConfig::default()
    };
    let mut capture = LiveAllocationCapture::new("jni", TraceLog::from_records(records), config).unwrap();
    assert_eq!(capture.heap_sets().len(), 5);

    load(&mut capture, 0, 3);
    let heap = capture.heap_set_mut(JNI_HEAP_ID).unwrap();
    let root = heap.root();
    // the reference to the unknown object 77 is dropped
    assert_eq!(counts(heap, root), (1, 0, 1, 1));
    let foo = child(heap, root, "Foo");
    let instance = heap.instances(foo)[0];
    assert_eq!(instance.native_backtrace.as_deref(), Some(&[0xdead, 0xbeef][..]));

    load(&mut capture, 0, 5);
    let heap = capture.heap_set_mut(JNI_HEAP_ID).unwrap();
    assert_eq!(counts(heap, root), (1, 1, 0, 1));

    // deleted references do not survive into later snapshots
    load(&mut capture, 5, 6);
    let heap = capture.heap_set_mut(JNI_HEAP_ID).unwrap();
    assert!(heap.root_set().is_empty());
}

#[test]
fn queued_loads_end_on_latest_window() {
    let mut capture = capture_of(periodic_trace(4));
    for end in 1..=12 {
        capture.load(0, end).unwrap();
    }
    capture.load(4, 8).unwrap();
    capture.wait_for_load(WAIT).unwrap();
    assert_eq!(capture.loaded_range(), Some(TimeRange::new(us(4), us(8))));
    let heap = app_heap(&mut capture);
    let root = heap.root();
    assert_eq!(counts(heap, root), (4, 4, 2, 6));
    assert_eq!(capture.apply_pending(), 0);
}

#[test]
fn listeners_see_update_notifications() {
    let mut capture = capture_of(periodic_trace(1));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    capture.add_listener(move |aspect| sink.borrow_mut().push(aspect));
    load(&mut capture, 0, 4);
    assert_eq!(
        *seen.borrow(),
        vec![CaptureAspect::HeapUpdating, CaptureAspect::HeapUpdated]
    );
}

/// Answers `NotReady` to the first queries, then delegates.
struct SlowSource {
    inner: TraceLog,
    not_ready: AtomicUsize,
}

impl SlowSource {
    fn gate(&self) -> Result<(), SourceError> {
        let remaining = self.not_ready.load(Ordering::SeqCst);
        if remaining > 0 {
            self.not_ready.store(remaining - 1, Ordering::SeqCst);
            return Err(SourceError::NotReady);
        }
        Ok(())
    }
}

impl AllocationEventSource for SlowSource {
    fn latest_timestamp(&self) -> Result<Option<i64>, SourceError> {
        self.gate()?;
        self.inner.latest_timestamp()
    }

    fn allocation_contexts(&self, range: TimeRange) -> Result<AllocationContexts, SourceError> {
        self.gate()?;
        self.inner.allocation_contexts(range)
    }

    fn allocation_snapshot(&self, at: i64) -> Result<Vec<AllocationData>, SourceError> {
        self.gate()?;
        self.inner.allocation_snapshot(at)
    }

    fn allocation_events(&self, range: TimeRange) -> Result<Vec<AllocationEvent>, SourceError> {
        self.gate()?;
        self.inner.allocation_events(range)
    }

    fn jni_reference_snapshot(&self, at: i64) -> Result<Vec<JniReferenceEvent>, SourceError> {
        self.gate()?;
        self.inner.jni_reference_snapshot(at)
    }

    fn jni_reference_events(&self, range: TimeRange) -> Result<Vec<JniReferenceEvent>, SourceError> {
        self.gate()?;
        self.inner.jni_reference_events(range)
    }
}

/// Exposes the trace up to `flushed` only, like a recorder still writing.
struct StagedSource {
    inner: TraceLog,
    flushed: AtomicI64,
}

impl StagedSource {
    fn visible(&self, range: TimeRange) -> TimeRange {
        TimeRange::new(range.start, range.end.min(self.flushed.load(Ordering::SeqCst) + 1))
    }
}

impl AllocationEventSource for StagedSource {
    fn latest_timestamp(&self) -> Result<Option<i64>, SourceError> {
        let flushed = self.flushed.load(Ordering::SeqCst);
        Ok(self.inner.latest_timestamp()?.map(|latest| latest.min(flushed)))
    }

    fn allocation_contexts(&self, range: TimeRange) -> Result<AllocationContexts, SourceError> {
        self.inner.allocation_contexts(self.visible(range))
    }

    fn allocation_snapshot(&self, at: i64) -> Result<Vec<AllocationData>, SourceError> {
        self.inner.allocation_snapshot(at.min(self.flushed.load(Ordering::SeqCst) + 1))
    }

    fn allocation_events(&self, range: TimeRange) -> Result<Vec<AllocationEvent>, SourceError> {
        self.inner.allocation_events(self.visible(range))
    }

    fn jni_reference_snapshot(&self, at: i64) -> Result<Vec<JniReferenceEvent>, SourceError> {
        self.inner.jni_reference_snapshot(at.min(self.flushed.load(Ordering::SeqCst) + 1))
    }

    fn jni_reference_events(&self, range: TimeRange) -> Result<Vec<JniReferenceEvent>, SourceError> {
        self.inner.jni_reference_events(self.visible(range))
    }
}

fn late_class_trace() -> TraceLog {
    let mut records = contexts_at_zero();
    records.push(TraceRecord::Class {
        timestamp: us(2),
        class: AllocatedClass {
            class_id: 5,
            super_class_id: None,
            class_name: "Late.Comer".to_string(),
        },
    });
    records.push(alloc(1, 1, FOO, 3));
    records.push(alloc(3, 2, 5, 3));
    TraceLog::from_records(records)
}

#[test]
fn classes_flushed_after_a_load_are_picked_up() {
    let source = Arc::new(StagedSource {
        inner: late_class_trace(),
        flushed: AtomicI64::new(us(1)),
    });
    let mut capture = LiveAllocationCapture::new("staged", source.clone(), CaptureConfig::default()).unwrap();
    load(&mut capture, 0, 10);
    assert_eq!(capture.loaded_range(), Some(TimeRange::new(0, us(1) + 1)));
    assert_eq!(capture.instances_count(), 1);

    source.flushed.store(us(10), Ordering::SeqCst);
    load(&mut capture, 0, 10);
    assert_eq!(capture.loaded_range(), Some(TimeRange::new(0, us(3) + 1)));
    assert_eq!(capture.instances_count(), 2);

    let mut fresh = LiveAllocationCapture::new("fresh", late_class_trace(), CaptureConfig::default()).unwrap();
    load(&mut fresh, 0, 10);
    assert_eq!(capture.instances_count(), fresh.instances_count());
    let heap = app_heap(&mut capture);
    let root = heap.root();
    let late = child(heap, root, "Comer");
    assert_eq!(counts(heap, late), (1, 0, 1, 1));
}

fn quick_config(load_timeout: Duration) -> CaptureConfig {
    CaptureConfig {
        retry_interval: Duration::from_millis(5),
        load_timeout,
        ..CaptureConfig::default()
    }
}

#[test]
fn not_ready_source_is_retried() {
    let source = SlowSource {
        inner: periodic_trace(2),
        not_ready: AtomicUsize::new(3),
    };
    let mut capture = LiveAllocationCapture::new("slow", source, quick_config(Duration::from_secs(5))).unwrap();
    load(&mut capture, 0, 4);
    let heap = app_heap(&mut capture);
    let root = heap.root();
    assert_eq!(counts(heap, root), (4, 2, 2, 4));
}

#[test]
fn source_never_ready_times_out() {
    let source = SlowSource {
        inner: periodic_trace(1),
        not_ready: AtomicUsize::new(usize::MAX),
    };
    let mut capture = LiveAllocationCapture::new("stuck", source, quick_config(Duration::from_millis(30))).unwrap();
    capture.load(0, 4).unwrap();
    let result = capture.wait_for_load(WAIT);
    assert!(matches!(result, Err(HeapSiftError::CaptureLoadError { .. })));
    assert!(capture.is_error());
    assert!(!capture.is_done_loading());
    assert!(capture.error().is_some());
    // errors are terminal
    assert!(capture.load(0, 2).is_err());
}

struct BrokenSource;

impl AllocationEventSource for BrokenSource {
    fn latest_timestamp(&self) -> Result<Option<i64>, SourceError> {
        Err(SourceError::Failed("connection reset".to_string()))
    }

    fn allocation_contexts(&self, _range: TimeRange) -> Result<AllocationContexts, SourceError> {
        Ok(AllocationContexts::default())
    }

    fn allocation_snapshot(&self, _at: i64) -> Result<Vec<AllocationData>, SourceError> {
        Ok(Vec::new())
    }

    fn allocation_events(&self, _range: TimeRange) -> Result<Vec<AllocationEvent>, SourceError> {
        Ok(Vec::new())
    }

    fn jni_reference_snapshot(&self, _at: i64) -> Result<Vec<JniReferenceEvent>, SourceError> {
        Ok(Vec::new())
    }

    fn jni_reference_events(&self, _range: TimeRange) -> Result<Vec<JniReferenceEvent>, SourceError> {
        Ok(Vec::new())
    }
}

#[test]
fn source_failure_marks_the_capture() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    let mut capture = LiveAllocationCapture::new("broken", BrokenSource, CaptureConfig::default()).unwrap();
    capture.add_listener(move |aspect| sink.borrow_mut().push(aspect));
    capture.load(0, 4).unwrap();
    match capture.wait_for_load(WAIT) {
        Err(HeapSiftError::CaptureLoadError { message }) => assert!(message.contains("connection reset")),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(*seen.borrow(), vec![CaptureAspect::LoadError]);
}

#[test]
fn shared_sources_are_accepted() {
    let trace = Arc::new(periodic_trace(1));
    let mut capture = LiveAllocationCapture::new("shared", trace.clone(), CaptureConfig::default()).unwrap();
    load(&mut capture, 0, 4);
    assert_eq!(capture.instances_count(), 4);
    drop(capture);
    assert_eq!(Arc::strong_count(&trace), 1);
}
