use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use crate::value::ObjectHandle;

use super::invokable::Invokable;
use super::objects::object_address;

#[derive(Clone)]
pub enum BindingTarget {
    Strong(Arc<dyn Invokable>),
    Weak(Weak<dyn Invokable>),
}

impl BindingTarget {
    pub fn upgrade(&self) -> Option<Arc<dyn Invokable>> {
        match self {
            BindingTarget::Strong(object) => Some(Arc::clone(object)),
            BindingTarget::Weak(object) => object.upgrade(),
        }
    }

    /// Pointer identity, ignoring vtables.
    pub fn is_same_object(&self, other: &dyn Invokable) -> bool {
        let address = match self {
            BindingTarget::Strong(object) => Arc::as_ptr(object) as *const () as usize,
            BindingTarget::Weak(object) => Weak::as_ptr(object) as *const () as usize,
        };
        address == object_address(other)
    }
}

#[derive(Clone)]
pub struct Binding {
    /// Name as exposed to script.
    pub name: String,
    pub target: BindingTarget,
    pub permanent: bool,
    pub generation: u64,
    pub handle: ObjectHandle,
}

impl Binding {
    pub fn method_names(&self, lowercase: bool) -> Vec<String> {
        let Some(object) = self.target.upgrade() else {
            return Vec::new();
        };
        object
            .methods()
            .iter()
            .map(|spec| exposed_name(spec.name, lowercase))
            .collect()
    }
}

pub(crate) fn exposed_name(name: &str, lowercase: bool) -> String {
    if lowercase {
        name.to_lowercase()
    } else {
        name.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub name: String,
    pub handle: ObjectHandle,
    pub methods: Vec<String>,
    pub permanent: bool,
}

/// Bindings installed into a new page before any of its scripts run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub bindings: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn names(&self) -> Vec<&str> {
        self.bindings.iter().map(|entry| entry.name.as_str()).collect()
    }
}

/// Named bindings of one scripting context. At most one binding per name.
pub struct BindingRegistry {
    bindings: HashMap<String, Binding>,
    lowercase: bool,
    next_generation: u64,
}

impl BindingRegistry {
    pub fn new(lowercase: bool) -> Self {
        Self {
            bindings: HashMap::new(),
            lowercase,
            next_generation: 0,
        }
    }

    pub fn key(&self, name: &str) -> String {
        exposed_name(name, self.lowercase)
    }

    /// Registers `target` under `name`, returning the binding it replaced.
    pub fn bind(
        &mut self,
        name: &str,
        target: BindingTarget,
        permanent: bool,
        handle: ObjectHandle,
    ) -> (Binding, Option<Binding>) {
        self.next_generation += 1;
        let binding = Binding {
            name: self.key(name),
            target,
            permanent,
            generation: self.next_generation,
            handle,
        };
        let replaced = self.bindings.insert(binding.name.clone(), binding.clone());
        (binding, replaced)
    }

    /// Removes the binding only if its permanence matches and, when `target`
    /// is given, it still points at that object.
    pub fn unbind(
        &mut self,
        name: &str,
        target: Option<&dyn Invokable>,
        permanent: bool,
    ) -> Option<Binding> {
        let key = self.key(name);
        let existing = self.bindings.get(&key)?;
        if existing.permanent != permanent {
            return None;
        }
        if let Some(target) = target {
            if !existing.target.is_same_object(target) {
                return None;
            }
        }
        self.bindings.remove(&key)
    }

    pub fn get(&self, name: &str) -> Option<&Binding> {
        self.bindings.get(&self.key(name))
    }

    pub fn resolve(&self, name: &str) -> Option<(Arc<dyn Invokable>, u64, String)> {
        let binding = self.get(name)?;
        let object = binding.target.upgrade()?;
        Some((object, binding.generation, binding.name.clone()))
    }

    /// All bindings, sorted by name.
    pub fn bindings(&self) -> Vec<&Binding> {
        let mut bindings: Vec<_> = self.bindings.values().collect();
        bindings.sort_by(|a, b| a.name.cmp(&b.name));
        bindings
    }

    pub fn snapshot_permanent(&self) -> Manifest {
        let bindings = self
            .bindings()
            .into_iter()
            .filter(|binding| binding.permanent)
            .map(|binding| self.manifest_entry(binding))
            .collect();
        Manifest { bindings }
    }

    pub fn manifest_entry(&self, binding: &Binding) -> ManifestEntry {
        ManifestEntry {
            name: binding.name.clone(),
            handle: binding.handle.clone(),
            methods: binding.method_names(self.lowercase),
            permanent: binding.permanent,
        }
    }

    /// Drops session bindings, returning the ones removed.
    pub fn clear_session(&mut self) -> Vec<Binding> {
        let names: Vec<String> = self
            .bindings
            .values()
            .filter(|binding| !binding.permanent)
            .map(|binding| binding.name.clone())
            .collect();
        names
            .into_iter()
            .filter_map(|name| self.bindings.remove(&name))
            .collect()
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::invokable::{MethodCall, MethodSpec};
    use crate::error::BridgeError;
    use crate::value::TypedValue;

    struct Named(&'static str);

    impl Invokable for Named {
        fn type_name(&self) -> &'static str {
            self.0
        }

        fn methods(&self) -> &'static [MethodSpec] {
            const METHODS: &[MethodSpec] = &[MethodSpec {
                name: "GetValue",
                params: &[],
                response: false,
            }];
            METHODS
        }

        fn invoke(
            &self,
            _method: &MethodSpec,
            _call: MethodCall,
        ) -> Result<Option<TypedValue>, BridgeError> {
            Ok(Some(self.0.into()))
        }
    }

    fn handle(id: u64) -> ObjectHandle {
        ObjectHandle {
            id,
            type_tag: "Named".into(),
        }
    }

    fn strong(name: &'static str) -> Arc<dyn Invokable> {
        Arc::new(Named(name))
    }

    #[test]
    fn rebind_replaces_and_bumps_generation() {
        let mut registry = BindingRegistry::new(true);
        let first = strong("first");
        let second = strong("second");
        let (bound, replaced) =
            registry.bind("Calc", BindingTarget::Strong(first), false, handle(1));
        assert!(replaced.is_none());
        assert_eq!(bound.name, "calc");

        let (rebound, replaced) =
            registry.bind("calc", BindingTarget::Strong(second), false, handle(2));
        assert_eq!(replaced.map(|b| b.generation), Some(bound.generation));
        assert!(rebound.generation > bound.generation);
        assert_eq!(registry.len(), 1);
        let (object, _, _) = registry.resolve("CALC").unwrap();
        assert_eq!(object.type_name(), "second");
    }

    #[test]
    fn unbind_requires_matching_permanence_and_target() {
        let mut registry = BindingRegistry::new(false);
        let current = strong("current");
        let stale = strong("stale");
        registry.bind("x", BindingTarget::Strong(Arc::clone(&current)), true, handle(1));

        assert!(registry.unbind("x", None, false).is_none());
        assert!(registry.unbind("x", Some(stale.as_ref()), true).is_none());
        assert!(registry.get("x").is_some());
        assert!(registry.unbind("x", Some(current.as_ref()), true).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn weak_binding_resolves_only_while_alive() {
        let mut registry = BindingRegistry::new(true);
        let object = strong("weak");
        registry.bind("w", BindingTarget::Weak(Arc::downgrade(&object)), false, handle(1));
        assert!(registry.resolve("w").is_some());
        drop(object);
        assert!(registry.resolve("w").is_none());
    }

    #[test]
    fn manifest_lists_permanent_bindings_sorted() {
        let mut registry = BindingRegistry::new(true);
        registry.bind("Zeta", BindingTarget::Strong(strong("z")), true, handle(1));
        registry.bind("alpha", BindingTarget::Strong(strong("a")), true, handle(2));
        registry.bind("session", BindingTarget::Strong(strong("s")), false, handle(3));

        let manifest = registry.snapshot_permanent();
        assert_eq!(manifest.names(), ["alpha", "zeta"]);
        assert_eq!(manifest.bindings[0].methods, ["getvalue"]);

        let removed = registry.clear_session();
        assert_eq!(removed.len(), 1);
        assert_eq!(registry.len(), 2);
    }
}
