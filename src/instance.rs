use std::fmt;
use std::sync::Arc;

use crate::capture::HeapId;
use crate::class_db::ClassEntry;

/// Size sentinel meaning "unknown / not computed".
pub const INVALID_VALUE: i64 = -1;

/// Allocation time of an instance allocated before the current window.
pub const NO_ALLOC_TIME: i64 = i64::MIN;

/// Deallocation time of an instance not freed within the current window.
pub const NO_DEALLOC_TIME: i64 = i64::MAX;

/// Unique key of an instance within one capture.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstanceId {
    /// Java object, keyed by its allocation tag.
    Object(u64),
    /// JNI global reference to the object with `tag`.
    JniReference { tag: u64, ref_value: u64 },
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceId::Object(tag) => write!(f, "@{}", tag),
            InstanceId::JniReference { tag, ref_value } => {
                write!(f, "@{} (jni 0x{:x})", tag, ref_value)
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    Null,
    Boolean,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Float,
    Double,
    Object,
    Class,
    String,
    Array,
}

impl ValueType {
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            ValueType::Boolean
                | ValueType::Byte
                | ValueType::Char
                | ValueType::Short
                | ValueType::Int
                | ValueType::Long
                | ValueType::Float
                | ValueType::Double
        )
    }

    /// Value type of an instance of `class_name` (Java source form).
    pub fn from_class_name(class_name: &str) -> ValueType {
        if class_name.ends_with("[]") {
            ValueType::Array
        } else if class_name == "java.lang.String" {
            ValueType::String
        } else if class_name == "java.lang.Class" {
            ValueType::Class
        } else {
            ValueType::Object
        }
    }
}

pub type ThreadId = u32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub thread_id: ThreadId,
    pub name: Option<Arc<str>>,
}

impl ThreadInfo {
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.to_string(),
            None => format!("Thread {}", self.thread_id),
        }
    }
}

/// One frame of an allocation call stack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CodeLocation {
    pub class_name: Arc<str>,
    pub method_name: Arc<str>,
    pub line_number: i32,
}

impl CodeLocation {
    pub fn label(&self) -> String {
        format!("{}() ({})", self.method_name, self.class_name)
    }
}

/// Frames ordered innermost (allocation site) first.
pub type CallStack = Arc<[CodeLocation]>;

#[derive(Debug, Clone)]
pub struct InstanceObject {
    pub id: InstanceId,
    pub class_entry: ClassEntry,
    pub heap_id: HeapId,
    pub value_type: ValueType,
    pub shallow_size: i64,
    pub native_size: i64,
    pub retained_size: i64,
    pub array_length: Option<u32>,
    pub alloc_time: i64,
    pub dealloc_time: i64,
    pub alloc_thread: Option<ThreadInfo>,
    pub dealloc_thread: Option<ThreadInfo>,
    pub call_stack: Option<CallStack>,
    pub native_backtrace: Option<Arc<[u64]>>,
}

impl InstanceObject {
    /// Instance with unknown sizes and no time data.
    pub fn new(id: InstanceId, class_entry: ClassEntry, heap_id: HeapId) -> Self {
        let value_type = ValueType::from_class_name(class_entry.class_name());
        InstanceObject {
            id,
            class_entry,
            heap_id,
            value_type,
            shallow_size: INVALID_VALUE,
            native_size: INVALID_VALUE,
            retained_size: INVALID_VALUE,
            array_length: None,
            alloc_time: NO_ALLOC_TIME,
            dealloc_time: NO_DEALLOC_TIME,
            alloc_thread: None,
            dealloc_thread: None,
            call_stack: None,
            native_backtrace: None,
        }
    }

    pub fn with_shallow_size(mut self, size: i64) -> Self {
        self.shallow_size = size;
        self
    }

    pub fn with_native_size(mut self, size: i64) -> Self {
        self.native_size = size;
        self
    }

    pub fn with_retained_size(mut self, size: i64) -> Self {
        self.retained_size = size;
        self
    }

    pub fn with_call_stack(mut self, call_stack: CallStack) -> Self {
        self.call_stack = Some(call_stack);
        self
    }

    pub fn with_alloc_thread(mut self, thread: ThreadInfo) -> Self {
        self.alloc_thread = Some(thread);
        self
    }

    pub fn class_name(&self) -> &str {
        self.class_entry.class_name()
    }

    pub fn has_alloc_time(&self) -> bool {
        self.alloc_time != NO_ALLOC_TIME
    }

    pub fn has_dealloc_time(&self) -> bool {
        self.dealloc_time != NO_DEALLOC_TIME
    }

    pub fn has_time_data(&self) -> bool {
        self.has_alloc_time() || self.has_dealloc_time()
    }

    pub fn call_stack_depth(&self) -> usize {
        self.call_stack.as_ref().map_or(0, |frames| frames.len())
    }

    /// Frame at `depth` counting from the outermost caller.
    pub fn frame_from_outermost(&self, depth: usize) -> Option<&CodeLocation> {
        let frames = self.call_stack.as_ref()?;
        let index = frames.len().checked_sub(depth + 1)?;
        frames.get(index)
    }

    pub fn has_stack_info(&self) -> bool {
        self.call_stack_depth() > 0 || self.native_backtrace.as_ref().is_some_and(|b| !b.is_empty())
    }

    /// Size contribution to aggregates, unknown sizes count as zero.
    pub fn valid_shallow_size(&self) -> i64 {
        valid_size(self.shallow_size)
    }

    pub fn valid_native_size(&self) -> i64 {
        valid_size(self.native_size)
    }

    pub fn valid_retained_size(&self) -> i64 {
        valid_size(self.retained_size)
    }
}

fn valid_size(size: i64) -> i64 {
    if size == INVALID_VALUE {
        0
    } else {
        size
    }
}
