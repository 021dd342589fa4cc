use std::sync::Arc;

use ahash::AHashMap;

use crate::capture::JNI_HEAP_ID;
use crate::class_db::ClassDb;
use crate::instance::{CallStack, CodeLocation, InstanceId, InstanceObject, ThreadId, ThreadInfo};
use crate::source::{AllocationContexts, AllocationData, JniReferenceEvent, MethodId, StackId};
use crate::utils::normalize_class_name;

const UNKNOWN_METHOD: &str = "<unknown method>";
const UNKNOWN_CLASS: &str = "<unknown class>";

/// Resolved allocation contexts, used to turn raw events into instances.
#[derive(Debug, Default)]
pub struct ContextIndex {
    class_db: ClassDb,
    methods: AHashMap<MethodId, (Arc<str>, Arc<str>)>,
    stacks: AHashMap<StackId, CallStack>,
    threads: AHashMap<ThreadId, ThreadInfo>,
}

impl ContextIndex {
    pub fn new() -> Self {
        ContextIndex::default()
    }

    /// Registers contexts, methods before the stacks referring to them.
    pub fn register(&mut self, contexts: AllocationContexts) {
        for class in contexts.classes {
            let class_name = normalize_class_name(&class.class_name);
            self.class_db
                .register_class(class.class_id, class.super_class_id, &class_name);
        }
        for method in contexts.methods {
            let class_name = normalize_class_name(&method.class_name);
            self.methods.insert(
                method.method_id,
                (Arc::from(method.method_name.as_str()), Arc::from(class_name.as_str())),
            );
        }
        for stack in contexts.stacks {
            let frames: Vec<CodeLocation> = stack
                .frames
                .iter()
                .map(|(method_id, line_number)| self.code_location(*method_id, *line_number))
                .collect();
            self.stacks.insert(stack.stack_id, frames.into());
        }
        for thread in contexts.threads {
            self.threads.insert(
                thread.thread_id,
                ThreadInfo {
                    thread_id: thread.thread_id,
                    name: Some(Arc::from(thread.name.as_str())),
                },
            );
        }
    }

    fn code_location(&self, method_id: MethodId, line_number: i32) -> CodeLocation {
        match self.methods.get(&method_id) {
            Some((method_name, class_name)) => CodeLocation {
                class_name: class_name.clone(),
                method_name: method_name.clone(),
                line_number,
            },
            None => {
                log::warn!("stack frame refers to unregistered method {}", method_id);
                CodeLocation {
                    class_name: Arc::from(UNKNOWN_CLASS),
                    method_name: Arc::from(UNKNOWN_METHOD),
                    line_number,
                }
            }
        }
    }

    pub fn thread(&self, thread_id: ThreadId) -> ThreadInfo {
        self.threads.get(&thread_id).cloned().unwrap_or(ThreadInfo {
            thread_id,
            name: None,
        })
    }

    /// Instance without time data for an allocated object, `None` when its
    /// class was never registered.
    pub fn object_template(&self, data: &AllocationData) -> Option<InstanceObject> {
        let Some(class_entry) = self.class_db.get_entry(data.class_tag) else {
            log::warn!(
                "object @{} refers to unregistered class {}, skipped",
                data.tag,
                data.class_tag
            );
            return None;
        };
        let mut instance = InstanceObject::new(InstanceId::Object(data.tag), class_entry.clone(), data.heap_id)
            .with_shallow_size(data.size);
        instance.array_length = u32::try_from(data.length).ok();
        instance.alloc_thread = data.thread_id.map(|thread_id| self.thread(thread_id));
        instance.call_stack = match data.stack_id {
            Some(stack_id) => match self.stacks.get(&stack_id) {
                Some(stack) => Some(stack.clone()),
                None => {
                    log::warn!("object @{} refers to unregistered stack {}", data.tag, stack_id);
                    None
                }
            },
            None => None,
        };
        Some(instance)
    }

    /// Instance for a JNI global reference pointing at `referent`.
    pub fn jni_template(&self, event: &JniReferenceEvent, referent: &InstanceObject) -> InstanceObject {
        let id = InstanceId::JniReference {
            tag: event.tag,
            ref_value: event.ref_value,
        };
        let mut instance = InstanceObject::new(id, referent.class_entry.clone(), JNI_HEAP_ID);
        instance.alloc_thread = event.thread_id.map(|thread_id| self.thread(thread_id));
        instance.native_backtrace = event.backtrace.clone();
        instance
    }
}
