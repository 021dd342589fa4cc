use crate::source::{
    AllocatedClass, AllocationData, AllocationMethod, AllocationStack, JniReferenceEvent, ThreadDescriptor,
};

/// Record tags as written in trace files.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RecordTag {
    Class,
    Method,
    Stack,
    Thread,
    Alloc,
    Free,
    JniCreate,
    JniDelete,
}

impl RecordTag {
    pub fn keyword(&self) -> &'static str {
        match self {
            RecordTag::Class => "class",
            RecordTag::Method => "method",
            RecordTag::Stack => "stack",
            RecordTag::Thread => "thread",
            RecordTag::Alloc => "alloc",
            RecordTag::Free => "free",
            RecordTag::JniCreate => "jni+",
            RecordTag::JniDelete => "jni-",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceRecord {
    Class { timestamp: i64, class: AllocatedClass },
    Method { timestamp: i64, method: AllocationMethod },
    Stack { timestamp: i64, stack: AllocationStack },
    Thread { timestamp: i64, thread: ThreadDescriptor },
    Alloc { timestamp: i64, data: AllocationData },
    /// Deallocation, resolved against the matching `Alloc` when recorded.
    Free { timestamp: i64, tag: u64 },
    Jni(JniReferenceEvent),
}

impl TraceRecord {
    pub fn timestamp(&self) -> i64 {
        match self {
            TraceRecord::Class { timestamp, .. }
            | TraceRecord::Method { timestamp, .. }
            | TraceRecord::Stack { timestamp, .. }
            | TraceRecord::Thread { timestamp, .. }
            | TraceRecord::Alloc { timestamp, .. }
            | TraceRecord::Free { timestamp, .. } => *timestamp,
            TraceRecord::Jni(event) => event.timestamp,
        }
    }

    pub fn tag(&self) -> RecordTag {
        match self {
            TraceRecord::Class { .. } => RecordTag::Class,
            TraceRecord::Method { .. } => RecordTag::Method,
            TraceRecord::Stack { .. } => RecordTag::Stack,
            TraceRecord::Thread { .. } => RecordTag::Thread,
            TraceRecord::Alloc { .. } => RecordTag::Alloc,
            TraceRecord::Free { .. } => RecordTag::Free,
            TraceRecord::Jni(event) => match event.kind {
                crate::source::JniReferenceEventKind::Create => RecordTag::JniCreate,
                crate::source::JniReferenceEventKind::Delete => RecordTag::JniDelete,
            },
        }
    }
}
