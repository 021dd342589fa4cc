use std::fmt;

use crate::capture::HeapId;
use crate::class_db::ClassEntry;
use crate::classifier::filter::Filter;
use crate::instance::{CodeLocation, InstanceObject, ThreadId, ThreadInfo};

/// Grouping dimension of the first level below a heap.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum ClassGrouping {
    #[default]
    ArrangeByClass,
    ArrangeByPackage,
    ArrangeByCallstack,
    ArrangeByThread,
}

impl ClassGrouping {
    pub fn from_name(name: &str) -> Option<ClassGrouping> {
        let grouping = match name.to_ascii_lowercase().as_str() {
            "class" => ClassGrouping::ArrangeByClass,
            "package" => ClassGrouping::ArrangeByPackage,
            "callstack" | "stack" => ClassGrouping::ArrangeByCallstack,
            "thread" => ClassGrouping::ArrangeByThread,
            _ => return None,
        };
        Some(grouping)
    }
}

impl fmt::Display for ClassGrouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClassGrouping::ArrangeByClass => "class",
            ClassGrouping::ArrangeByPackage => "package",
            ClassGrouping::ArrangeByCallstack => "callstack",
            ClassGrouping::ArrangeByThread => "thread",
        };
        f.write_str(name)
    }
}

/// Key of a child set under a partitioned node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SetKey {
    Class(ClassEntry),
    Package(Box<str>),
    Method(CodeLocation),
    Thread(ThreadId),
}

/// Splitting policy of a partitioned node.
///
/// `depth` is the package segment / stack frame index (outermost first) the
/// classifier looks at.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Classifier {
    Class,
    Package { depth: usize },
    Method { depth: usize },
    Thread,
}

impl Classifier {
    pub fn for_grouping(grouping: ClassGrouping) -> Classifier {
        match grouping {
            ClassGrouping::ArrangeByClass => Classifier::Class,
            ClassGrouping::ArrangeByPackage => Classifier::Package { depth: 0 },
            ClassGrouping::ArrangeByCallstack => Classifier::Method { depth: 0 },
            ClassGrouping::ArrangeByThread => Classifier::Thread,
        }
    }

    /// Whether the children produced by this classifier hold instances
    /// directly and never partition further.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Classifier::Class)
    }

    pub fn classify(&self, instance: &InstanceObject) -> SetKey {
        match *self {
            Classifier::Class => SetKey::Class(instance.class_entry.clone()),
            Classifier::Package { depth } => match instance.class_entry.split_package_name().get(depth) {
                Some(segment) => SetKey::Package(segment.clone()),
                None => SetKey::Class(instance.class_entry.clone()),
            },
            Classifier::Method { depth } => match instance.frame_from_outermost(depth) {
                Some(frame) => SetKey::Method(frame.clone()),
                None => SetKey::Class(instance.class_entry.clone()),
            },
            Classifier::Thread => match &instance.alloc_thread {
                Some(thread) => SetKey::Thread(thread.thread_id),
                None => Classifier::Method { depth: 0 }.classify(instance),
            },
        }
    }

    /// Kind of the child set created for `key`, `instance` being the first
    /// instance routed to it.
    pub fn child_kind(&self, key: &SetKey, instance: &InstanceObject) -> SetKind {
        let depth = match *self {
            Classifier::Package { depth } | Classifier::Method { depth } => depth,
            Classifier::Class | Classifier::Thread => 0,
        };
        match key {
            SetKey::Class(entry) => SetKind::Class(entry.clone()),
            SetKey::Package(segment) => SetKind::Package {
                name: segment.clone(),
                depth: depth + 1,
            },
            SetKey::Method(location) => SetKind::Method {
                location: location.clone(),
                depth: depth + 1,
            },
            SetKey::Thread(thread_id) => SetKind::Thread(
                instance
                    .alloc_thread
                    .clone()
                    .filter(|thread| thread.thread_id == *thread_id)
                    .unwrap_or(ThreadInfo {
                        thread_id: *thread_id,
                        name: None,
                    }),
            ),
        }
    }
}

/// What a node of the classification tree groups.
#[derive(Debug, Clone)]
pub enum SetKind {
    Heap { heap_id: HeapId, name: Box<str> },
    Class(ClassEntry),
    /// `depth` is the index of the next package segment to split on.
    Package { name: Box<str>, depth: usize },
    /// `depth` is the index of the next frame to split on.
    Method { location: CodeLocation, depth: usize },
    Thread(ThreadInfo),
}

impl SetKind {
    pub fn label(&self) -> String {
        match self {
            SetKind::Heap { name, .. } => name.to_string(),
            SetKind::Class(entry) => entry.simple_class_name().to_string(),
            SetKind::Package { name, .. } => name.to_string(),
            SetKind::Method { location, .. } => location.label(),
            SetKind::Thread(thread) => thread.label(),
        }
    }

    /// Classifier used once this node gets partitioned, `None` for leaves.
    pub fn sub_classifier(&self, grouping: ClassGrouping) -> Option<Classifier> {
        match self {
            SetKind::Heap { .. } => Some(Classifier::for_grouping(grouping)),
            SetKind::Class(_) => None,
            SetKind::Package { depth, .. } => Some(Classifier::Package { depth: *depth }),
            SetKind::Method { depth, .. } => Some(Classifier::Method { depth: *depth }),
            SetKind::Thread(_) => Some(Classifier::Method { depth: 0 }),
        }
    }

    pub fn matches(&self, filter: &Filter) -> bool {
        match self {
            SetKind::Heap { .. } => false,
            SetKind::Class(entry) => filter.matches(entry.class_name()),
            SetKind::Package { name, .. } => filter.matches(name),
            SetKind::Method { location, .. } => {
                filter.matches(&location.method_name) || filter.matches(&location.class_name)
            }
            SetKind::Thread(thread) => filter.matches(&thread.label()),
        }
    }

    pub fn is_class_set(&self) -> bool {
        matches!(self, SetKind::Class(_))
    }
}
