// File: src/module.rs
//
// Module registry backing the `use` statement. Unlike the teacher's
// `ModuleLoader`, there is no filesystem resolution — modules are
// in-process, host-registered namespaces (spec §5's native bridge), keyed
// by their top-level name. Materialization is cached per-VM so `use std`
// twice returns the same object and any constructor side effects run once
// (spec §8 Testable Property: `Use` idempotence).

use crate::errors::{PyleError, RuntimeErrorKind, SourceLocation};
use crate::value::{ModuleValue, Value};
use std::collections::HashMap;
use std::rc::Rc;

pub type ModuleCtor = fn() -> ModuleValue;

#[derive(Default)]
pub struct ModuleRegistry {
    ctors: HashMap<&'static str, ModuleCtor>,
    cache: HashMap<String, Rc<ModuleValue>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        let mut registry = Self::default();
        for (name, ctor) in crate::native::builtin_modules() {
            registry.ctors.insert(name, ctor);
        }
        registry
    }

    pub fn register(&mut self, name: &'static str, ctor: ModuleCtor) {
        self.ctors.insert(name, ctor);
    }

    pub fn resolve(&mut self, path: &[String]) -> Result<Value, PyleError> {
        let root_name = path.first().ok_or_else(|| {
            PyleError::runtime(RuntimeErrorKind::ModuleNotFound, "empty module path", SourceLocation::unknown())
        })?;

        let root = if let Some(cached) = self.cache.get(root_name) {
            cached.clone()
        } else {
            let ctor = self.ctors.get(root_name.as_str()).ok_or_else(|| {
                PyleError::runtime(
                    RuntimeErrorKind::ModuleNotFound,
                    format!("no module named '{}'", root_name),
                    SourceLocation::unknown(),
                )
            })?;
            let built = Rc::new(ctor());
            tracing::debug!(module = root_name.as_str(), "materialized module");
            self.cache.insert(root_name.clone(), built.clone());
            built
        };

        let mut current = Value::Module(root);
        for segment in &path[1..] {
            current = match &current {
                Value::Module(m) => m.attrs.get(segment).cloned().ok_or_else(|| {
                    PyleError::runtime(
                        RuntimeErrorKind::MissingAttribute,
                        format!("module has no member '{}'", segment),
                        SourceLocation::unknown(),
                    )
                })?,
                _ => {
                    return Err(PyleError::runtime(
                        RuntimeErrorKind::MissingAttribute,
                        format!("'{}' is not a module", segment),
                        SourceLocation::unknown(),
                    ))
                }
            };
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_builtin_std_module() {
        let mut reg = ModuleRegistry::new();
        let v = reg.resolve(&["std".to_string()]).unwrap();
        assert!(matches!(v, Value::Module(_)));
    }

    #[test]
    fn unknown_module_is_an_error() {
        let mut reg = ModuleRegistry::new();
        let err = reg.resolve(&["nope".to_string()]).unwrap_err();
        assert!(matches!(err, PyleError::Runtime { kind: RuntimeErrorKind::ModuleNotFound, .. }));
    }

    #[test]
    fn resolution_is_cached_across_calls() {
        let mut reg = ModuleRegistry::new();
        let a = reg.resolve(&["std".to_string()]).unwrap();
        let b = reg.resolve(&["std".to_string()]).unwrap();
        match (a, b) {
            (Value::Module(x), Value::Module(y)) => assert!(Rc::ptr_eq(&x, &y)),
            _ => panic!("expected modules"),
        }
    }
}
