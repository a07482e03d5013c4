use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::error::BridgeError;
use crate::value::ObjectHandle;

use super::invokable::Invokable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// The table keeps the object alive until it is released.
    Strong,
    /// Someone else owns the object; the entry dies with it.
    Weak,
}

enum Slot {
    Strong(Arc<dyn Invokable>),
    Weak(Weak<dyn Invokable>),
}

struct Entry {
    slot: Slot,
    type_tag: &'static str,
    address: usize,
}

impl Entry {
    fn upgrade(&self) -> Option<Arc<dyn Invokable>> {
        match &self.slot {
            Slot::Strong(object) => Some(Arc::clone(object)),
            Slot::Weak(object) => object.upgrade(),
        }
    }
}

pub(crate) fn object_address(object: &dyn Invokable) -> usize {
    object as *const dyn Invokable as *const () as usize
}

/// Handles for host objects handed to a page.
///
/// Exposing the same object twice yields the same handle for as long as the
/// first entry is alive.
#[derive(Default)]
pub struct ObjectTable {
    entries: HashMap<u64, Entry>,
    by_address: HashMap<usize, u64>,
    next_id: u64,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expose(&mut self, object: &Arc<dyn Invokable>, retention: Retention) -> ObjectHandle {
        self.prune_dead();
        let address = object_address(object.as_ref());
        if let Some(id) = self.by_address.get(&address).copied() {
            if let Some(entry) = self.entries.get_mut(&id) {
                if entry.upgrade().is_some() {
                    if retention == Retention::Strong {
                        entry.slot = Slot::Strong(Arc::clone(object));
                    }
                    return ObjectHandle {
                        id,
                        type_tag: entry.type_tag.to_string(),
                    };
                }
                self.entries.remove(&id);
            }
        }

        self.next_id += 1;
        let id = self.next_id;
        let slot = match retention {
            Retention::Strong => Slot::Strong(Arc::clone(object)),
            Retention::Weak => Slot::Weak(Arc::downgrade(object)),
        };
        let type_tag = object.type_name();
        self.entries.insert(
            id,
            Entry {
                slot,
                type_tag,
                address,
            },
        );
        self.by_address.insert(address, id);
        ObjectHandle {
            id,
            type_tag: type_tag.to_string(),
        }
    }

    pub fn resolve(&mut self, id: u64) -> Result<Arc<dyn Invokable>, BridgeError> {
        let object = self.entries.get(&id).and_then(Entry::upgrade);
        match object {
            Some(object) => Ok(object),
            None => {
                self.remove(id);
                Err(BridgeError::UnknownObject(id))
            }
        }
    }

    pub fn release(&mut self, id: u64) -> bool {
        self.remove(id)
    }

    /// Drops a weak entry. Strong entries stay until the page releases them.
    pub fn forget_weak(&mut self, id: u64) -> bool {
        let weak = self
            .entries
            .get(&id)
            .is_some_and(|entry| matches!(entry.slot, Slot::Weak(_)));
        weak && self.remove(id)
    }

    /// Keeps only the entries whose id satisfies `keep`.
    pub fn retain(&mut self, mut keep: impl FnMut(u64) -> bool) {
        self.entries.retain(|id, _| keep(*id));
        let entries = &self.entries;
        self.by_address.retain(|_, id| entries.contains_key(id));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_address.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn prune_dead(&mut self) {
        self.entries.retain(|_, entry| match &entry.slot {
            Slot::Strong(_) => true,
            Slot::Weak(object) => object.strong_count() > 0,
        });
        let entries = &self.entries;
        self.by_address.retain(|_, id| entries.contains_key(id));
    }

    fn remove(&mut self, id: u64) -> bool {
        match self.entries.remove(&id) {
            Some(entry) => {
                if self.by_address.get(&entry.address) == Some(&id) {
                    self.by_address.remove(&entry.address);
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::invokable::{MethodCall, MethodSpec};
    use crate::value::TypedValue;

    struct Token(#[allow(dead_code)] u32);

    impl Invokable for Token {
        fn type_name(&self) -> &'static str {
            "Token"
        }

        fn methods(&self) -> &'static [MethodSpec] {
            &[]
        }

        fn invoke(
            &self,
            _method: &MethodSpec,
            _call: MethodCall,
        ) -> Result<Option<TypedValue>, BridgeError> {
            Ok(None)
        }
    }

    fn token(value: u32) -> Arc<dyn Invokable> {
        Arc::new(Token(value))
    }

    #[test]
    fn same_object_same_handle() {
        let mut table = ObjectTable::new();
        let object = token(1);
        let first = table.expose(&object, Retention::Weak);
        let second = table.expose(&object, Retention::Strong);
        assert_eq!(first, second);
        assert_eq!(first.type_tag, "Token");

        let other = token(1);
        assert_ne!(table.expose(&other, Retention::Weak).id, first.id);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn weak_entries_die_with_their_object() {
        let mut table = ObjectTable::new();
        let object = token(2);
        let handle = table.expose(&object, Retention::Weak);
        assert!(table.resolve(handle.id).is_ok());
        drop(object);
        assert_eq!(
            table.resolve(handle.id).err(),
            Some(BridgeError::UnknownObject(handle.id))
        );
        assert!(table.is_empty());
    }

    #[test]
    fn strong_entries_live_until_released() {
        let mut table = ObjectTable::new();
        let handle = table.expose(&token(3), Retention::Strong);
        assert!(table.resolve(handle.id).is_ok());
        assert!(table.release(handle.id));
        assert!(!table.release(handle.id));
        assert!(table.resolve(handle.id).is_err());
    }

    #[test]
    fn dead_weak_entries_are_pruned_on_expose() {
        let mut table = ObjectTable::new();
        let kept = token(6);
        table.expose(&kept, Retention::Weak);
        for value in 0..5 {
            table.expose(&token(value), Retention::Weak);
        }
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn forget_weak_leaves_strong_entries() {
        let mut table = ObjectTable::new();
        let bound = token(7);
        let weak = table.expose(&bound, Retention::Weak);
        let strong = table.expose(&token(8), Retention::Strong);
        assert!(!table.forget_weak(strong.id));
        assert!(table.forget_weak(weak.id));
        assert!(!table.forget_weak(weak.id));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn retain_drops_address_index_too() {
        let mut table = ObjectTable::new();
        let kept = token(4);
        let dropped = token(5);
        let kept_handle = table.expose(&kept, Retention::Weak);
        let dropped_handle = table.expose(&dropped, Retention::Weak);
        table.retain(|id| id == kept_handle.id);
        assert_eq!(table.len(), 1);
        let again = table.expose(&dropped, Retention::Weak);
        assert_ne!(again.id, dropped_handle.id);
    }
}
