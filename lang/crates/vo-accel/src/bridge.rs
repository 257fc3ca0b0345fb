//! Dispatch bridge: managed arguments in, native call, managed result out.
//!
//! A [`CallPlan`] is the lowered form of an entry: native parameter types and
//! a prepared libffi call interface. The interpreted path lowers on every
//! call; the compiled path lowers once into a [`CompiledCall`]. Both go
//! through [`CallPlan::call`], so marshalling is identical.
//!
//! Lowering rules:
//!
//! | kind                    | native                       |
//! |-------------------------|------------------------------|
//! | receiver / object       | pointer to pinned storage    |
//! | `T[]`                   | pointer + `i32` length       |
//! | boolean                 | `u8`                         |
//! | byte / char / short     | `i8` / `u16` / `i16`         |
//! | int / long              | `i32` / `i64`                |
//! | float / double          | `f32` / `f64`                |

use std::ffi::c_void;
use std::sync::Arc;

use libffi::middle::{Arg, Cif, CodePtr, Type};

use crate::descriptor::{ElemKind, ParamKind};
use crate::error::DispatchError;
use crate::heap::{Heap, ObjRef, ObjectKind, Pinned};
use crate::registry::{Entry, NativeFn};
use crate::value::Value;

/// Native parameter or return type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeType {
    Void,
    U8,
    I8,
    U16,
    I16,
    I32,
    I64,
    F32,
    F64,
    Pointer,
}

impl NativeType {
    fn ffi_type(self) -> Type {
        match self {
            NativeType::Void => Type::void(),
            NativeType::U8 => Type::u8(),
            NativeType::I8 => Type::i8(),
            NativeType::U16 => Type::u16(),
            NativeType::I16 => Type::i16(),
            NativeType::I32 => Type::i32(),
            NativeType::I64 => Type::i64(),
            NativeType::F32 => Type::f32(),
            NativeType::F64 => Type::f64(),
            NativeType::Pointer => Type::pointer(),
        }
    }

    fn of_elem(kind: ElemKind) -> Self {
        match kind {
            ElemKind::Boolean => NativeType::U8,
            ElemKind::Byte => NativeType::I8,
            ElemKind::Char => NativeType::U16,
            ElemKind::Short => NativeType::I16,
            ElemKind::Int => NativeType::I32,
            ElemKind::Long => NativeType::I64,
            ElemKind::Float => NativeType::F32,
            ElemKind::Double => NativeType::F64,
        }
    }

    /// Native slots one managed kind lowers to.
    fn lower(kind: ParamKind, out: &mut Vec<NativeType>) {
        match kind {
            ParamKind::Void => {}
            ParamKind::Prim(k) => out.push(Self::of_elem(k)),
            ParamKind::ObjectRef | ParamKind::ImplicitReceiver => out.push(NativeType::Pointer),
            ParamKind::Array(_) => {
                out.push(NativeType::Pointer);
                out.push(NativeType::I32);
            }
        }
    }

    fn of_return(kind: ParamKind) -> Self {
        match kind {
            ParamKind::Void => NativeType::Void,
            ParamKind::Prim(k) => Self::of_elem(k),
            ParamKind::ObjectRef | ParamKind::ImplicitReceiver | ParamKind::Array(_) => NativeType::Pointer,
        }
    }
}

/// Owned storage for one marshalled native argument.
#[derive(Debug, Clone, Copy)]
enum NativeArg {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Pointer(*mut c_void),
}

impl NativeArg {
    fn as_arg(&self) -> Arg {
        match self {
            NativeArg::U8(v) => Arg::new(v),
            NativeArg::I8(v) => Arg::new(v),
            NativeArg::U16(v) => Arg::new(v),
            NativeArg::I16(v) => Arg::new(v),
            NativeArg::I32(v) => Arg::new(v),
            NativeArg::I64(v) => Arg::new(v),
            NativeArg::F32(v) => Arg::new(v),
            NativeArg::F64(v) => Arg::new(v),
            NativeArg::Pointer(v) => Arg::new(v),
        }
    }
}

struct SharedCif(Cif);

// A prepared cif is immutable after construction.
unsafe impl Send for SharedCif {}
unsafe impl Sync for SharedCif {}

// ==================== CallPlan ====================

/// Lowered form of one entry.
pub struct CallPlan {
    entry: Arc<Entry>,
    func: NativeFn,
    params: Vec<NativeType>,
    ret: NativeType,
    cif: SharedCif,
}

impl CallPlan {
    /// Fails if the owning unit is gone or a provider produced no function.
    pub fn lower(entry: Arc<Entry>) -> Result<Self, DispatchError> {
        if !entry.is_loaded() {
            return Err(unloaded(&entry));
        }
        let func = entry.native_func().ok_or_else(|| DispatchError::NativeUnavailable {
            method: entry.method().to_string(),
            native: entry.native_name().to_string(),
        })?;

        let convention = entry.convention();
        let mut params = Vec::with_capacity(convention.arg_count() + 1);
        for kind in convention.native_params() {
            NativeType::lower(kind, &mut params);
        }
        let ret = NativeType::of_return(convention.ret());
        let cif = Cif::new(params.iter().map(|t| t.ffi_type()), ret.ffi_type());
        Ok(Self {
            entry,
            func,
            params,
            ret,
            cif: SharedCif(cif),
        })
    }

    pub fn entry(&self) -> &Arc<Entry> {
        &self.entry
    }

    /// Native parameter types in call order.
    pub fn native_params(&self) -> &[NativeType] {
        &self.params
    }

    pub fn native_ret(&self) -> NativeType {
        self.ret
    }

    /// Marshal `args`, call the native function, convert the result.
    ///
    /// Referenced cells stay pinned until the call returns. Returns `None` for
    /// void entries.
    pub fn call(&self, heap: &Heap, args: &[Value]) -> Result<Option<Value>, DispatchError> {
        let entry = &self.entry;
        if !entry.is_loaded() {
            return Err(unloaded(entry));
        }

        let convention = entry.convention();
        if args.len() != convention.arg_count() {
            return Err(DispatchError::ArityMismatch {
                method: entry.method().to_string(),
                expected: convention.arg_count(),
                found: args.len(),
            });
        }

        let mut pins: Vec<Pinned<'_>> = Vec::new();
        let mut storage: Vec<NativeArg> = Vec::with_capacity(self.params.len());
        for (index, (kind, value)) in convention.native_params().zip(args).enumerate() {
            self.marshal(heap, index, kind, value, &mut pins, &mut storage)?;
        }
        debug_assert_eq!(storage.len(), self.params.len());

        let ffi_args: Vec<Arg> = storage.iter().map(NativeArg::as_arg).collect();
        let code = CodePtr(self.func.as_ptr() as *mut c_void);
        let cif = &self.cif.0;

        tracing::trace!(entry = %entry.method(), native = entry.native_name(), "native call");
        // Integer results are read through a full register-sized slot and
        // truncated to the declared width.
        let ret = unsafe {
            match self.ret {
                NativeType::Void => {
                    cif.call::<()>(code, &ffi_args);
                    return Ok(None);
                }
                NativeType::U8 => Value::Boolean(cif.call::<u64>(code, &ffi_args) as u8 != 0),
                NativeType::I8 => Value::Byte(cif.call::<u64>(code, &ffi_args) as i8),
                NativeType::U16 => Value::Char(cif.call::<u64>(code, &ffi_args) as u16),
                NativeType::I16 => Value::Short(cif.call::<u64>(code, &ffi_args) as i16),
                NativeType::I32 => Value::Int(cif.call::<u64>(code, &ffi_args) as i32),
                NativeType::I64 => Value::Long(cif.call::<i64>(code, &ffi_args)),
                NativeType::F32 => Value::Float(cif.call::<f32>(code, &ffi_args)),
                NativeType::F64 => Value::Double(cif.call::<f64>(code, &ffi_args)),
                NativeType::Pointer => {
                    let addr = cif.call::<usize>(code, &ffi_args);
                    self.unmarshal_ref(heap, addr)?
                }
            }
        };
        drop(pins);
        Ok(Some(ret))
    }

    fn marshal<'h>(
        &self,
        heap: &'h Heap,
        index: usize,
        kind: ParamKind,
        value: &Value,
        pins: &mut Vec<Pinned<'h>>,
        out: &mut Vec<NativeArg>,
    ) -> Result<(), DispatchError> {
        let mismatch = || DispatchError::ArgumentMismatch {
            method: self.entry.method().to_string(),
            index,
            expected: kind.to_string(),
            found: value.kind_name().to_string(),
        };

        let arg = match (kind, *value) {
            (ParamKind::Prim(ElemKind::Boolean), Value::Boolean(v)) => NativeArg::U8(u8::from(v)),
            (ParamKind::Prim(ElemKind::Byte), Value::Byte(v)) => NativeArg::I8(v),
            (ParamKind::Prim(ElemKind::Char), Value::Char(v)) => NativeArg::U16(v),
            (ParamKind::Prim(ElemKind::Short), Value::Short(v)) => NativeArg::I16(v),
            (ParamKind::Prim(ElemKind::Int), Value::Int(v)) => NativeArg::I32(v),
            (ParamKind::Prim(ElemKind::Long), Value::Long(v)) => NativeArg::I64(v),
            (ParamKind::Prim(ElemKind::Float), Value::Float(v)) => NativeArg::F32(v),
            (ParamKind::Prim(ElemKind::Double), Value::Double(v)) => NativeArg::F64(v),

            (ParamKind::ImplicitReceiver, Value::Ref(None)) => {
                return Err(DispatchError::NullReceiver {
                    method: self.entry.method().to_string(),
                });
            }
            (ParamKind::ObjectRef, Value::Ref(None)) => NativeArg::Pointer(std::ptr::null_mut()),
            (ParamKind::ImplicitReceiver | ParamKind::ObjectRef, Value::Ref(Some(obj))) => {
                let pin = heap.pin(obj)?;
                let ptr = pin.base().cast::<c_void>();
                pins.push(pin);
                NativeArg::Pointer(ptr)
            }

            (ParamKind::Array(_), Value::Ref(None)) => {
                return Err(DispatchError::NullArray {
                    method: self.entry.method().to_string(),
                    index,
                });
            }
            (ParamKind::Array(elem), Value::Ref(Some(obj))) => {
                if heap.kind(obj)? != ObjectKind::Array(elem) {
                    return Err(mismatch());
                }
                let pin = heap.pin(obj)?;
                let len = i32::try_from(pin.len()).map_err(|_| mismatch())?;
                out.push(NativeArg::Pointer(pin.base().cast::<c_void>()));
                out.push(NativeArg::I32(len));
                pins.push(pin);
                return Ok(());
            }

            _ => return Err(mismatch()),
        };
        out.push(arg);
        Ok(())
    }

    fn unmarshal_ref(&self, heap: &Heap, addr: usize) -> Result<Value, DispatchError> {
        if addr == 0 {
            return Ok(Value::NULL);
        }
        let obj: ObjRef = heap.resolve_address(addr).ok_or_else(|| DispatchError::UnknownReference {
            method: self.entry.method().to_string(),
            address: addr,
        })?;
        if let ParamKind::Array(elem) = self.entry.convention().ret() {
            let found = heap.kind(obj)?;
            if found != ObjectKind::Array(elem) {
                return Err(DispatchError::ReturnMismatch {
                    method: self.entry.method().to_string(),
                    expected: ParamKind::Array(elem).to_string(),
                    found: found.to_string(),
                });
            }
        }
        Ok(Value::Ref(Some(obj)))
    }
}

fn unloaded(entry: &Entry) -> DispatchError {
    DispatchError::UnitUnloaded {
        method: entry.method().to_string(),
        unit: entry.unit().to_string(),
    }
}

impl std::fmt::Debug for CallPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallPlan")
            .field("entry", self.entry.method())
            .field("params", &self.params)
            .field("ret", &self.ret)
            .finish()
    }
}

// ==================== Interpreted and compiled paths ====================

/// Interpreted path: lower and call in one step.
pub struct DispatchBridge;

impl DispatchBridge {
    pub fn invoke(heap: &Heap, entry: &Arc<Entry>, args: &[Value]) -> Result<Option<Value>, DispatchError> {
        CallPlan::lower(entry.clone())?.call(heap, args)
    }
}

/// Compiled path: a plan lowered once and reused.
#[derive(Debug)]
pub struct CompiledCall {
    plan: CallPlan,
}

impl CompiledCall {
    pub fn compile(entry: Arc<Entry>) -> Result<Self, DispatchError> {
        let plan = CallPlan::lower(entry)?;
        tracing::debug!(entry = %plan.entry.method(), native = plan.entry.native_name(), "compiled accel call");
        Ok(Self { plan })
    }

    pub fn plan(&self) -> &CallPlan {
        &self.plan
    }

    pub fn entry(&self) -> &Arc<Entry> {
        self.plan.entry()
    }

    pub fn call(&self, heap: &Heap, args: &[Value]) -> Result<Option<Value>, DispatchError> {
        self.plan.call(heap, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::tag;
    use crate::descriptor::{CallingConvention, MethodId};
    use crate::registry::NativeTarget;
    use std::ffi::c_char;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(func: *const c_void, descriptor: &str, tags: &[u8]) -> Arc<Entry> {
        Arc::new(Entry::new(
            Arc::from("libTest_1"),
            MethodId::new("Test", "m", descriptor),
            "test_m".to_string(),
            NativeFn::new(func).unwrap(),
            CallingConvention::from_tags(tags).unwrap(),
        ))
    }

    extern "C" fn widen(b: u8, c: i8, ch: u16, s: i16) -> i64 {
        i64::from(b) * 1000 + i64::from(c) * 100 + i64::from(ch) + i64::from(s)
    }

    extern "C" fn negate_byte(v: i8) -> i8 {
        -v
    }

    extern "C" fn flip(v: u8) -> u8 {
        u8::from(v == 0)
    }

    extern "C" fn sum_bytes(data: *const i8, len: i32) -> i32 {
        let bytes = unsafe { std::slice::from_raw_parts(data, len as usize) };
        bytes.iter().map(|&b| i32::from(b)).sum()
    }

    extern "C" fn identity(obj: *mut c_void) -> *mut c_void {
        obj
    }

    extern "C" fn bogus(_: *mut c_void) -> *mut c_void {
        1usize as *mut c_void
    }

    #[test]
    fn test_lowering() {
        let e = entry(
            sum_bytes as *const c_void,
            "(I[BLjava/lang/Object;)V",
            &[tag::IMPLICIT_RECEIVER, tag::INT, tag::BYTE_ARRAY, tag::OBJECT_REF, tag::VOID],
        );
        let plan = CallPlan::lower(e).unwrap();
        assert_eq!(
            plan.native_params(),
            &[NativeType::Pointer, NativeType::I32, NativeType::Pointer, NativeType::I32, NativeType::Pointer]
        );
        assert_eq!(plan.native_ret(), NativeType::Void);
    }

    #[test]
    fn test_small_primitives() {
        let heap = Heap::new();
        let e = entry(widen as *const c_void, "(ZBCS)J", &[tag::BOOLEAN, tag::BYTE, tag::CHAR, tag::SHORT, tag::LONG]);
        let ret = DispatchBridge::invoke(&heap, &e, &[Value::Boolean(true), Value::Byte(-2), Value::Char(65), Value::Short(-1)]);
        assert_eq!(ret, Ok(Some(Value::Long(1000 - 200 + 65 - 1))));

        let e = entry(negate_byte as *const c_void, "(B)B", &[tag::BYTE, tag::BYTE]);
        assert_eq!(DispatchBridge::invoke(&heap, &e, &[Value::Byte(5)]), Ok(Some(Value::Byte(-5))));

        let e = entry(flip as *const c_void, "(Z)Z", &[tag::BOOLEAN, tag::BOOLEAN]);
        assert_eq!(DispatchBridge::invoke(&heap, &e, &[Value::Boolean(false)]), Ok(Some(Value::Boolean(true))));
    }

    #[test]
    fn test_array_argument() {
        let heap = Heap::new();
        let bytes = heap.new_array_from(&[1i8, 2, 3, -4]);
        let e = entry(sum_bytes as *const c_void, "([B)I", &[tag::BYTE_ARRAY, tag::INT]);
        assert_eq!(DispatchBridge::invoke(&heap, &e, &[Value::from_ref(bytes)]), Ok(Some(Value::Int(2))));
        assert!(!heap.is_pinned(bytes));

        assert!(matches!(
            DispatchBridge::invoke(&heap, &e, &[Value::NULL]),
            Err(DispatchError::NullArray { index: 0, .. })
        ));

        let ints = heap.new_array_from(&[1i32]);
        assert!(matches!(
            DispatchBridge::invoke(&heap, &e, &[Value::from_ref(ints)]),
            Err(DispatchError::ArgumentMismatch { .. })
        ));
    }

    #[test]
    fn test_reference_roundtrip() {
        let heap = Heap::new();
        let obj = heap.new_object("Hello", 1);
        let e = entry(identity as *const c_void, "(Ljava/lang/Object;)Ljava/lang/Object;", &[tag::OBJECT_REF, tag::OBJECT_REF]);
        assert_eq!(DispatchBridge::invoke(&heap, &e, &[Value::from_ref(obj)]), Ok(Some(Value::from_ref(obj))));
        assert_eq!(DispatchBridge::invoke(&heap, &e, &[Value::NULL]), Ok(Some(Value::NULL)));

        let e = entry(bogus as *const c_void, "(Ljava/lang/Object;)Ljava/lang/Object;", &[tag::OBJECT_REF, tag::OBJECT_REF]);
        assert!(matches!(
            DispatchBridge::invoke(&heap, &e, &[Value::NULL]),
            Err(DispatchError::UnknownReference { address: 1, .. })
        ));
    }

    #[test]
    fn test_argument_checks() {
        let heap = Heap::new();
        let e = entry(identity as *const c_void, "()Ljava/lang/Object;", &[tag::IMPLICIT_RECEIVER, tag::OBJECT_REF]);
        assert!(matches!(DispatchBridge::invoke(&heap, &e, &[]), Err(DispatchError::ArityMismatch { expected: 1, found: 0, .. })));
        assert!(matches!(DispatchBridge::invoke(&heap, &e, &[Value::NULL]), Err(DispatchError::NullReceiver { .. })));
        assert!(matches!(
            DispatchBridge::invoke(&heap, &e, &[Value::Int(1)]),
            Err(DispatchError::ArgumentMismatch { index: 0, .. })
        ));
    }

    #[test]
    fn test_compiled_matches_interpreted() {
        let heap = Heap::new();
        let e = entry(widen as *const c_void, "(ZBCS)J", &[tag::BOOLEAN, tag::BYTE, tag::CHAR, tag::SHORT, tag::LONG]);
        let args = [Value::Boolean(false), Value::Byte(3), Value::Char(7), Value::Short(9)];
        let compiled = CompiledCall::compile(e.clone()).unwrap();
        assert_eq!(compiled.call(&heap, &args), DispatchBridge::invoke(&heap, &e, &args));
        assert!(Arc::ptr_eq(compiled.entry(), &e));
    }

    static PROVIDER_CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn provide_negate(
        _env: *const crate::abi::AccelEnv,
        name: *const c_char,
        data: *mut c_void,
    ) -> *const c_void {
        PROVIDER_CALLS.fetch_add(1, Ordering::SeqCst);
        match std::ffi::CStr::from_ptr(name).to_str() {
            Ok("test_m") => data as *const c_void,
            _ => std::ptr::null(),
        }
    }

    unsafe extern "C" fn provide_nothing(_: *const crate::abi::AccelEnv, _: *const c_char, _: *mut c_void) -> *const c_void {
        std::ptr::null()
    }

    fn provided(provider: crate::abi::ProviderFn, data: *const c_void, native_name: &str) -> Arc<Entry> {
        Arc::new(Entry::new(
            Arc::from("libTest_1"),
            MethodId::new("Test", "m", "(B)B"),
            native_name.to_string(),
            NativeTarget::Provided {
                provider,
                data: data as usize,
            },
            CallingConvention::from_tags(&[tag::BYTE, tag::BYTE]).unwrap(),
        ))
    }

    #[test]
    fn test_provider_resolves_once() {
        let heap = Heap::new();
        let e = provided(provide_negate, negate_byte as *const c_void, "test_m");
        let before = PROVIDER_CALLS.load(Ordering::SeqCst);
        let compiled = CompiledCall::compile(e.clone()).unwrap();
        assert_eq!(compiled.call(&heap, &[Value::Byte(4)]), Ok(Some(Value::Byte(-4))));
        assert_eq!(DispatchBridge::invoke(&heap, &e, &[Value::Byte(9)]), Ok(Some(Value::Byte(-9))));
        assert_eq!(DispatchBridge::invoke(&heap, &e, &[Value::Byte(1)]), Ok(Some(Value::Byte(-1))));
        assert_eq!(PROVIDER_CALLS.load(Ordering::SeqCst) - before, 1);
    }

    #[test]
    fn test_provider_without_function_fails_lowering() {
        let heap = Heap::new();
        let e = provided(provide_nothing, negate_byte as *const c_void, "unknown_name");
        let expected = DispatchError::NativeUnavailable {
            method: "Test::m(B)B".to_string(),
            native: "unknown_name".to_string(),
        };
        assert_eq!(CompiledCall::compile(e.clone()).unwrap_err(), expected);
        assert_eq!(DispatchBridge::invoke(&heap, &e, &[Value::Byte(1)]), Err(expected));
    }
}
