//! Replacement queries for the compiler pipeline.
//!
//! The shim answers "is this method replaced, and by which entry" and hands
//! out compiled calls. Resolution is idempotent: the registry is frozen, so a
//! method resolves to the same `Arc<Entry>` for the lifetime of the runtime.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::bridge::{CompiledCall, DispatchBridge};
use crate::descriptor::MethodId;
use crate::error::DispatchError;
use crate::heap::Heap;
use crate::registry::{Entry, FrozenRegistry};
use crate::value::Value;

/// How a replaced method is being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Interpreted,
    Compiled,
}

pub struct ReplacementShim {
    registry: Arc<FrozenRegistry>,
    compiled: RwLock<HashMap<MethodId, Arc<CompiledCall>>>,
}

impl ReplacementShim {
    pub fn new(registry: Arc<FrozenRegistry>) -> Self {
        Self {
            registry,
            compiled: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<FrozenRegistry> {
        &self.registry
    }

    pub fn resolve_replacement(&self, method: &MethodId) -> Option<Arc<Entry>> {
        self.registry.find(method).cloned()
    }

    /// Like [`resolve_replacement`](Self::resolve_replacement), but rejects an
    /// entry whose receiver does not agree with the method being static.
    pub fn resolve_for(&self, method: &MethodId, is_static: bool) -> Option<Arc<Entry>> {
        let entry = self.resolve_replacement(method)?;
        let has_receiver = entry.convention().has_receiver();
        if has_receiver == is_static {
            tracing::warn!(
                entry = %method,
                unit = entry.unit(),
                is_static,
                has_receiver,
                "accel entry receiver does not match method, not replacing"
            );
            return None;
        }
        Some(entry)
    }

    /// Compiled call for `method`, lowered on first request. Failed lowerings
    /// are not cached.
    pub fn compile(&self, method: &MethodId) -> Result<Arc<CompiledCall>, DispatchError> {
        if let Some(call) = self.compiled.read().get(method) {
            return Ok(call.clone());
        }
        let entry = self
            .resolve_replacement(method)
            .ok_or_else(|| DispatchError::NotReplaced(method.to_string()))?;
        let mut compiled = self.compiled.write();
        if let Some(call) = compiled.get(method) {
            return Ok(call.clone());
        }
        let call = Arc::new(CompiledCall::compile(entry)?);
        compiled.insert(method.clone(), call.clone());
        Ok(call)
    }

    /// Whether a lowered call targets an accel native function.
    pub fn is_accel_native_call(&self, native_name: &str) -> bool {
        self.registry.is_accel_native_call(native_name)
    }

    /// Run a replaced method.
    pub fn invoke(
        &self,
        method: &MethodId,
        mode: CallMode,
        heap: &Heap,
        args: &[Value],
    ) -> Result<Option<Value>, DispatchError> {
        let not_replaced = || DispatchError::NotReplaced(method.to_string());
        match mode {
            CallMode::Interpreted => {
                let entry = self.resolve_replacement(method).ok_or_else(not_replaced)?;
                DispatchBridge::invoke(heap, &entry, args)
            }
            CallMode::Compiled => self.compile(method)?.call(heap, args),
        }
    }

    pub fn compiled_count(&self) -> usize {
        self.compiled.read().len()
    }
}

impl std::fmt::Debug for ReplacementShim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplacementShim")
            .field("entries", &self.registry.len())
            .field("compiled", &self.compiled_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::tag;
    use crate::descriptor::CallingConvention;
    use crate::registry::{NativeFn, Registry};
    use crate::unit_spec::UnitSpec;
    use std::ffi::c_void;

    extern "C" fn twice(v: i32) -> i32 {
        v * 2
    }

    extern "C" fn field0(this: *const i64) -> i64 {
        unsafe { *this }
    }

    /// The registry owns the unit and must outlive the calls.
    fn shim() -> (ReplacementShim, Registry) {
        let mut registry = Registry::new();
        let handle = registry.register(UnitSpec::parse("libShim_1").unwrap()).unwrap().handle();
        let unit: Arc<str> = Arc::from("libShim_1");
        let entries = vec![
            Entry::new(
                unit.clone(),
                MethodId::new("Shim", "twice", "(I)I"),
                "shim_twice".to_string(),
                NativeFn::new(twice as *const c_void).unwrap(),
                CallingConvention::from_tags(&[tag::INT, tag::INT]).unwrap(),
            ),
            Entry::new(
                unit,
                MethodId::new("Shim", "field0", "()J"),
                "shim_field0".to_string(),
                NativeFn::new(field0 as *const c_void).unwrap(),
                CallingConvention::from_tags(&[tag::IMPLICIT_RECEIVER, tag::LONG]).unwrap(),
            ),
        ];
        // Entries follow the unit's loaded flag.
        registry.units_mut()[0].attach(
            Box::new(crate::loader::StaticModule::new("libShim_1")),
            crate::loader::EntryPoints {
                init: noop,
                post_init: None,
                finalize: None,
                exports: no_exports,
            },
        );
        registry.register_entries(handle, entries).unwrap();
        (ReplacementShim::new(Arc::new(registry.snapshot())), registry)
    }

    unsafe extern "C" fn noop(_: *const crate::abi::AccelEnv, _: u64) -> i32 {
        0
    }

    unsafe extern "C" fn no_exports() -> *const crate::abi::ExportTable {
        std::ptr::null()
    }

    #[test]
    fn test_resolution_is_stable() {
        let (shim, _registry) = shim();
        let m = MethodId::new("Shim", "twice", "(I)I");
        let a = shim.resolve_replacement(&m).unwrap();
        let b = shim.resolve_replacement(&m).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(shim.resolve_replacement(&MethodId::new("Shim", "twice", "(J)J")).is_none());
    }

    #[test]
    fn test_resolve_for_checks_receiver() {
        let (shim, _registry) = shim();
        let twice = MethodId::new("Shim", "twice", "(I)I");
        let field0 = MethodId::new("Shim", "field0", "()J");
        assert!(shim.resolve_for(&twice, true).is_some());
        assert!(shim.resolve_for(&twice, false).is_none());
        assert!(shim.resolve_for(&field0, false).is_some());
        assert!(shim.resolve_for(&field0, true).is_none());
    }

    #[test]
    fn test_compile_is_cached() {
        let (shim, _registry) = shim();
        let m = MethodId::new("Shim", "twice", "(I)I");
        let a = shim.compile(&m).unwrap();
        let b = shim.compile(&m).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(shim.compiled_count(), 1);
        assert_eq!(
            shim.compile(&MethodId::new("Shim", "other", "()V")).unwrap_err(),
            DispatchError::NotReplaced("Shim::other()V".to_string())
        );
    }

    #[test]
    fn test_invoke_both_modes() {
        let (shim, _registry) = shim();
        let heap = Heap::new();
        let m = MethodId::new("Shim", "twice", "(I)I");
        for mode in [CallMode::Interpreted, CallMode::Compiled] {
            assert_eq!(shim.invoke(&m, mode, &heap, &[Value::Int(21)]), Ok(Some(Value::Int(42))));
        }

        let obj = heap.new_object("Shim", 1);
        let f = MethodId::new("Shim", "field0", "()J");
        assert_eq!(shim.invoke(&f, CallMode::Compiled, &heap, &[Value::from_ref(obj)]), Ok(Some(Value::Long(0))));

        let missing = MethodId::new("Shim", "missing", "()V");
        assert_eq!(
            shim.invoke(&missing, CallMode::Interpreted, &heap, &[]),
            Err(DispatchError::NotReplaced("Shim::missing()V".to_string()))
        );
        assert!(shim.is_accel_native_call("shim_twice"));
        assert!(!shim.is_accel_native_call("twice"));
    }
}
