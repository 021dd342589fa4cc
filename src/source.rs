use std::fmt;
use std::sync::Arc;

use crate::capture::HeapId;
use crate::class_db::ClassId;
use crate::errors::SourceError;
use crate::instance::ThreadId;

pub type MethodId = u64;
pub type StackId = u64;

/// Half open `[start, end)` range of nanosecond timestamps.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        TimeRange { start, end }
    }

    /// Range given in microseconds, as exposed to callers.
    pub fn from_micros(start_us: i64, end_us: i64) -> Self {
        TimeRange {
            start: start_us.saturating_mul(1000),
            end: end_us.saturating_mul(1000),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.start <= timestamp && timestamp < self.end
    }

    /// Whether both ranges share at least one boundary region worth an
    /// incremental update.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        !(self.start >= other.end || self.end <= other.start)
    }

    pub fn padded(&self, padding: i64) -> TimeRange {
        TimeRange {
            start: self.start.saturating_sub(padding),
            end: self.end.saturating_add(padding),
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}ns, {}ns)", self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedClass {
    pub class_id: ClassId,
    pub super_class_id: Option<ClassId>,
    pub class_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationMethod {
    pub method_id: MethodId,
    pub method_name: String,
    pub class_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationStack {
    pub stack_id: StackId,
    /// `(method_id, line_number)` pairs, innermost frame first.
    pub frames: Vec<(MethodId, i32)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadDescriptor {
    pub thread_id: ThreadId,
    pub name: String,
}

/// Context records registered in a time range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationContexts {
    pub classes: Vec<AllocatedClass>,
    pub methods: Vec<AllocationMethod>,
    pub stacks: Vec<AllocationStack>,
    pub threads: Vec<ThreadDescriptor>,
}

impl AllocationContexts {
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
            && self.methods.is_empty()
            && self.stacks.is_empty()
            && self.threads.is_empty()
    }
}

/// Allocation site data of one object, carried by both its allocation and
/// its deallocation event.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AllocationData {
    pub tag: u64,
    pub class_tag: ClassId,
    pub size: i64,
    /// Array length, negative for non arrays.
    pub length: i32,
    pub heap_id: HeapId,
    pub thread_id: Option<ThreadId>,
    pub stack_id: Option<StackId>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum AllocationEventKind {
    Allocation(AllocationData),
    Deallocation(AllocationData),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AllocationEvent {
    pub timestamp: i64,
    pub kind: AllocationEventKind,
}

impl AllocationEvent {
    pub fn data(&self) -> &AllocationData {
        match &self.kind {
            AllocationEventKind::Allocation(data) | AllocationEventKind::Deallocation(data) => data,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum JniReferenceEventKind {
    Create,
    Delete,
}

/// JNI global reference event for the object with `tag`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct JniReferenceEvent {
    pub kind: JniReferenceEventKind,
    pub timestamp: i64,
    pub tag: u64,
    pub ref_value: u64,
    pub thread_id: Option<ThreadId>,
    pub backtrace: Option<Arc<[u64]>>,
}

/// Upstream provider of allocation tracking data.
///
/// Every query may answer [`SourceError::NotReady`] while the producer has
/// not flushed the requested range yet, callers retry.
pub trait AllocationEventSource: Send + 'static {
    /// Timestamp of the most recent event available, if any.
    fn latest_timestamp(&self) -> Result<Option<i64>, SourceError>;

    fn allocation_contexts(&self, range: TimeRange) -> Result<AllocationContexts, SourceError>;

    /// Objects allocated before `at` and not freed before `at`.
    fn allocation_snapshot(&self, at: i64) -> Result<Vec<AllocationData>, SourceError>;

    fn allocation_events(&self, range: TimeRange) -> Result<Vec<AllocationEvent>, SourceError>;

    /// Creation events of the references alive at `at`.
    fn jni_reference_snapshot(&self, at: i64) -> Result<Vec<JniReferenceEvent>, SourceError>;

    fn jni_reference_events(&self, range: TimeRange) -> Result<Vec<JniReferenceEvent>, SourceError>;
}

impl<S: AllocationEventSource + Sync> AllocationEventSource for Arc<S> {
    fn latest_timestamp(&self) -> Result<Option<i64>, SourceError> {
        (**self).latest_timestamp()
    }

    fn allocation_contexts(&self, range: TimeRange) -> Result<AllocationContexts, SourceError> {
        (**self).allocation_contexts(range)
    }

    fn allocation_snapshot(&self, at: i64) -> Result<Vec<AllocationData>, SourceError> {
        (**self).allocation_snapshot(at)
    }

    fn allocation_events(&self, range: TimeRange) -> Result<Vec<AllocationEvent>, SourceError> {
        (**self).allocation_events(range)
    }

    fn jni_reference_snapshot(&self, at: i64) -> Result<Vec<JniReferenceEvent>, SourceError> {
        (**self).jni_reference_snapshot(at)
    }

    fn jni_reference_events(&self, range: TimeRange) -> Result<Vec<JniReferenceEvent>, SourceError> {
        (**self).jni_reference_events(range)
    }
}
