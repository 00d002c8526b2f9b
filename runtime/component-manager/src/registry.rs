//! Interned interface types.
//!
//! Interface types are identified by name. The registry keeps one
//! descriptor object per name and hands out shared references, so "same
//! name" and "same object" coincide and binding compatibility is a pointer
//! compare. Entries are reference counted by the templates that mention
//! them and disappear when the last holder releases.

use alloc::collections::BTreeMap;
use alloc::rc::Rc;
use alloc::string::String;
use alloc::vec::Vec;

/// Description of one interface type: its name and method names, in
/// declaration order.
#[derive(Debug, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub type_name: String,
    pub methods: Vec<String>,
}

impl InterfaceDescriptor {
    /// Number of methods, which is also the patch-cell width minus the
    /// "this" word.
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}

/// Shared reference to an interned descriptor.
pub type InterfaceRef = Rc<InterfaceDescriptor>;

struct Entry {
    desc: InterfaceRef,
    refs: usize,
}

/// The interface type registry.
#[derive(Default)]
pub struct InterfaceRegistry {
    entries: BTreeMap<String, Entry>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern one interface type and take a reference on it.
    ///
    /// The first registration of a name wins. A later registration whose
    /// method list disagrees is diagnosed but still resolves to the
    /// registered object; refusing it would make component load order
    /// matter, which no deployment can control.
    pub fn intern(&mut self, type_name: &str, methods: Vec<String>) -> InterfaceRef {
        if let Some(entry) = self.entries.get_mut(type_name) {
            if entry.desc.methods != methods {
                log::warn!(
                    "interface {:?} re-registered with {} methods, keeping the {} registered",
                    type_name,
                    methods.len(),
                    entry.desc.methods.len()
                );
            }
            entry.refs += 1;
            return entry.desc.clone();
        }
        let desc = Rc::new(InterfaceDescriptor {
            type_name: String::from(type_name),
            methods,
        });
        self.entries.insert(
            String::from(type_name),
            Entry {
                desc: desc.clone(),
                refs: 1,
            },
        );
        desc
    }

    /// Drop one reference; the entry unlinks when the count reaches zero.
    pub fn release(&mut self, desc: &InterfaceRef) {
        match self.entries.get_mut(&desc.type_name) {
            Some(entry) => {
                entry.refs -= 1;
                if entry.refs == 0 {
                    self.entries.remove(&desc.type_name);
                }
            }
            None => {
                debug_assert!(false, "release of uninterned interface {:?}", desc.type_name);
                log::warn!("release of uninterned interface {:?}", desc.type_name);
            }
        }
    }

    /// Look up without taking a reference.
    pub fn get(&self, type_name: &str) -> Option<InterfaceRef> {
        self.entries.get(type_name).map(|e| e.desc.clone())
    }

    /// References held on a name, 0 when not interned.
    pub fn ref_count(&self, type_name: &str) -> usize {
        self.entries.get(type_name).map_or(0, |e| e.refs)
    }

    /// Number of distinct interned types.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    fn methods(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_intern_same_name_shares_object() {
        let mut reg = InterfaceRegistry::new();
        let a = reg.intern("audio.sink", methods(&["open", "write", "close"]));
        let b = reg.intern("audio.sink", methods(&["open", "write", "close"]));
        assert!(Rc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.ref_count("audio.sink"), 2);
    }

    #[test]
    fn test_release_unlinks_at_zero() {
        let mut reg = InterfaceRegistry::new();
        let a = reg.intern("clock", methods(&["now"]));
        let b = reg.intern("clock", methods(&["now"]));
        reg.release(&a);
        assert_eq!(reg.ref_count("clock"), 1);
        assert!(reg.get("clock").is_some());
        reg.release(&b);
        assert!(reg.is_empty());
        assert!(reg.get("clock").is_none());
    }

    #[test]
    fn test_mismatched_methods_keep_first_registration() {
        let mut reg = InterfaceRegistry::new();
        let first = reg.intern("dma", methods(&["submit", "wait"]));
        // Diagnosed but not refused
        let second = reg.intern("dma", methods(&["submit"]));
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(second.methods, methods(&["submit", "wait"]));
        assert_eq!(reg.ref_count("dma"), 2);
    }

    #[test]
    fn test_get_does_not_count() {
        let mut reg = InterfaceRegistry::new();
        reg.intern("timer", methods(&["arm"]));
        let _peek = reg.get("timer");
        assert_eq!(reg.ref_count("timer"), 1);
    }

    #[test]
    fn test_reintern_after_drop_is_fresh() {
        let mut reg = InterfaceRegistry::new();
        let a = reg.intern("gpio", methods(&["set"]));
        reg.release(&a);
        let b = reg.intern("gpio", methods(&["set", "get"]));
        // The old entry died, so the new method list wins
        assert_eq!(b.methods, methods(&["set", "get"]));
        assert!(!Rc::ptr_eq(&a, &b));
    }
}
