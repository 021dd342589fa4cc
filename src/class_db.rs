use ahash::{AHashMap, AHashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub type ClassId = i64;

#[derive(Debug)]
struct ClassEntryData {
    class_id: ClassId,
    super_class_id: Option<ClassId>,
    class_name: Box<str>,
    split_package_name: Box<[Box<str>]>,
    simple_class_name: Box<str>,
}

/// Identity of a class as seen by the profiler.
///
/// Equality and hashing only look at the fully qualified name: the same class
/// loaded under two ids (e.g. by two class loaders) aggregates into one group.
#[derive(Clone)]
pub struct ClassEntry {
    data: Arc<ClassEntryData>,
}

impl ClassEntry {
    pub fn new(class_id: ClassId, super_class_id: Option<ClassId>, class_name: &str) -> Self {
        let (package, simple) = match class_name.rfind('.') {
            Some(index) => (&class_name[..index], &class_name[index + 1..]),
            None => ("", class_name),
        };
        let split_package_name = if package.is_empty() {
            Box::default()
        } else {
            package.split('.').map(Box::from).collect()
        };
        ClassEntry {
            data: Arc::new(ClassEntryData {
                class_id,
                super_class_id: super_class_id.filter(|id| *id >= 0),
                class_name: class_name.into(),
                split_package_name,
                simple_class_name: simple.into(),
            }),
        }
    }

    pub fn class_id(&self) -> ClassId {
        self.data.class_id
    }

    pub fn super_class_id(&self) -> Option<ClassId> {
        self.data.super_class_id
    }

    pub fn class_name(&self) -> &str {
        &self.data.class_name
    }

    pub fn simple_class_name(&self) -> &str {
        &self.data.simple_class_name
    }

    /// Package segments, outermost first.
    pub fn split_package_name(&self) -> &[Box<str>] {
        &self.data.split_package_name
    }

    fn same_identity(&self, super_class_id: Option<ClassId>, class_name: &str) -> bool {
        self.data.super_class_id == super_class_id.filter(|id| *id >= 0)
            && &*self.data.class_name == class_name
    }
}

impl PartialEq for ClassEntry {
    fn eq(&self, other: &Self) -> bool {
        self.data.class_name == other.data.class_name
    }
}

impl Eq for ClassEntry {}

impl Hash for ClassEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.class_name.hash(state);
    }
}

impl fmt::Debug for ClassEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassEntry")
            .field("class_id", &self.data.class_id)
            .field("super_class_id", &self.data.super_class_id)
            .field("class_name", &self.data.class_name)
            .finish()
    }
}

#[derive(Debug, Default)]
enum SubclassIndex {
    #[default]
    Unresolved,
    Resolved(AHashMap<ClassId, Vec<ClassId>>),
}

/// Per capture class registry.
#[derive(Debug, Default)]
pub struct ClassDb {
    entries: AHashMap<ClassId, ClassEntry>,
    subclasses: SubclassIndex,
}

impl ClassDb {
    pub fn new() -> Self {
        ClassDb::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers or replaces the entry for `class_id`.
    ///
    /// The existing entry is handed back untouched when the identity tuple is
    /// unchanged. A negative `super_class_id` is treated like `None`.
    pub fn register_class(
        &mut self,
        class_id: ClassId,
        super_class_id: Option<ClassId>,
        class_name: &str,
    ) -> ClassEntry {
        if let Some(existing) = self.entries.get(&class_id) {
            if existing.same_identity(super_class_id, class_name) {
                return existing.clone();
            }
        }
        let entry = ClassEntry::new(class_id, super_class_id, class_name);
        self.entries.insert(class_id, entry.clone());
        entry
    }

    pub fn get_entry(&self, class_id: ClassId) -> Option<&ClassEntry> {
        self.entries.get(&class_id)
    }

    /// Every registered entry carrying `class_name`, one per class id.
    pub fn entries_by_name(&self, class_name: &str) -> Vec<ClassEntry> {
        let mut entries: Vec<ClassEntry> = self
            .entries
            .values()
            .filter(|entry| entry.class_name() == class_name)
            .cloned()
            .collect();
        entries.sort_by_key(ClassEntry::class_id);
        entries
    }

    /// `class_id` and all its transitive subclasses.
    ///
    /// The subclass index is built on the first call and never rebuilt, so
    /// classes registered afterwards are not visible here.
    pub fn descendant_classes(&mut self, class_id: ClassId) -> Vec<ClassEntry> {
        if !self.entries.contains_key(&class_id) {
            return Vec::new();
        }
        self.resolve_subclasses();
        let SubclassIndex::Resolved(index) = &self.subclasses else {
            return Vec::new();
        };

        let mut visited = AHashSet::new();
        let mut descendants = Vec::new();
        let mut stack = vec![class_id];
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            if let Some(entry) = self.entries.get(&current) {
                descendants.push(entry.clone());
            }
            if let Some(subclasses) = index.get(&current) {
                stack.extend(subclasses.iter().copied());
            }
        }
        descendants
    }

    fn resolve_subclasses(&mut self) {
        if let SubclassIndex::Unresolved = self.subclasses {
            let mut index: AHashMap<ClassId, Vec<ClassId>> = AHashMap::new();
            for entry in self.entries.values() {
                if let Some(super_class_id) = entry.super_class_id() {
                    index
                        .entry(super_class_id)
                        .or_default()
                        .push(entry.class_id());
                }
            }
            self.subclasses = SubclassIndex::Resolved(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_under_two_ids() {
        let mut db = ClassDb::new();
        db.register_class(1, None, "com.foo.Bar");
        db.register_class(2, Some(1), "com.foo.Bar");

        assert_eq!(db.get_entry(1).unwrap().class_name(), "com.foo.Bar");
        assert_eq!(db.get_entry(2).unwrap().class_name(), "com.foo.Bar");
        assert_eq!(db.entries_by_name("com.foo.Bar").len(), 2);
        // equal for aggregation purposes
        assert_eq!(db.get_entry(1).unwrap(), db.get_entry(2).unwrap());
    }

    #[test]
    fn register_is_create_or_replace() {
        let mut db = ClassDb::new();
        let first = db.register_class(7, None, "a.A");
        let again = db.register_class(7, Some(-1), "a.A");
        assert!(Arc::ptr_eq(&first.data, &again.data));

        let replaced = db.register_class(7, Some(3), "a.A");
        assert!(!Arc::ptr_eq(&first.data, &replaced.data));
        assert_eq!(db.get_entry(7).unwrap().super_class_id(), Some(3));
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn package_split() {
        let entry = ClassEntry::new(1, None, "a.b.C");
        let segments: Vec<&str> = entry.split_package_name().iter().map(|s| &**s).collect();
        assert_eq!(segments, vec!["a", "b"]);
        assert_eq!(entry.simple_class_name(), "C");

        let no_package = ClassEntry::new(2, None, "int[]");
        assert!(no_package.split_package_name().is_empty());
        assert_eq!(no_package.simple_class_name(), "int[]");
    }

    #[test]
    fn descendants_include_self() {
        let mut db = ClassDb::new();
        db.register_class(1, None, "java.lang.Object");
        db.register_class(2, Some(1), "a.Base");
        db.register_class(3, Some(2), "a.Child");
        db.register_class(4, Some(2), "a.OtherChild");
        db.register_class(5, Some(1), "b.Unrelated");

        let mut names: Vec<String> = db
            .descendant_classes(2)
            .iter()
            .map(|e| e.class_name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.Base", "a.Child", "a.OtherChild"]);
        assert_eq!(db.descendant_classes(1).len(), 5);
        assert!(db.descendant_classes(42).is_empty());
    }

    #[test]
    fn subclass_index_is_not_invalidated() {
        let mut db = ClassDb::new();
        db.register_class(1, None, "a.Base");
        assert_eq!(db.descendant_classes(1).len(), 1);

        db.register_class(2, Some(1), "a.Late");
        // resolved once, the late registration stays invisible
        assert_eq!(db.descendant_classes(1).len(), 1);
    }
}
