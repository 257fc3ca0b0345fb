//! SDK for writing native acceleration units.
//!
//! A unit is a `cdylib` that exports `naccel_init`, `naccel_exports` and
//! optionally `naccel_post_init` / `naccel_finalize`. This crate generates
//! those symbols and wraps the host env in a safe [`Env`].
//!
//! # Example
//!
//! ```ignore
//! use vo_accel_ext::prelude::*;
//!
//! extern "C" fn add(a: i32, b: i32) -> i32 {
//!     a + b
//! }
//!
//! fn init(env: &Env) -> Result<(), String> {
//!     if env.param("fail").is_some() {
//!         return Err("asked to fail".into());
//!     }
//!     Ok(())
//! }
//!
//! vo_accel_ext::export_entries! {
//!     entry!("demo/Math", "add", "(II)I", add, [tag::INT, tag::INT, tag::INT]),
//! }
//! vo_accel_ext::export_lifecycle!(init: init);
//! ```
//!
//! The library file is named `{feature}_{version}` plus the platform suffix,
//! e.g. `libMathAccel_1.so`, and declared with `--unit libMathAccel_1`.

use std::ffi::{c_char, CStr, CString};
use std::fmt;

pub use vo_accel::abi::{
    log_level, tag, AccelEnv, AccelHandle, AccelStatus, ExportEntry, ExportTable, ProviderFn,
    ACCEL_ABI_VERSION, ACCEL_ERROR, ACCEL_OK,
};

/// Largest parameter list the host accepts, plus the terminator.
const PARAM_BUF: usize = 1025;
const NAME_BUF: usize = 256;

/// Safe view of the host env during one lifecycle call.
#[derive(Clone, Copy)]
pub struct Env<'a> {
    raw: &'a AccelEnv,
    handle: AccelHandle,
}

/// What the host knows about the calling unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitInfo {
    pub feature: String,
    /// Empty when the unit is unversioned.
    pub version: String,
    /// Raw `key=value:key=value` list, empty when absent.
    pub params: String,
}

impl<'a> Env<'a> {
    /// # Safety
    /// `env` must be null or the pointer the host passed to the current
    /// lifecycle call.
    pub unsafe fn from_raw(env: *const AccelEnv, handle: AccelHandle) -> Option<Self> {
        let raw = env.as_ref()?;
        if raw.version != ACCEL_ABI_VERSION {
            return None;
        }
        Some(Self { raw, handle })
    }

    pub fn handle(&self) -> AccelHandle {
        self.handle
    }

    pub fn accel_version(&self) -> u32 {
        (self.raw.get_accel_version)()
    }

    pub fn vm_version(&self) -> Option<String> {
        read_buf(NAME_BUF, |buf, len| (self.raw.get_vm_version)(buf, len))
    }

    pub fn unit_info(&self) -> Option<UnitInfo> {
        let mut feature = vec![0 as c_char; NAME_BUF];
        let mut version = vec![0 as c_char; NAME_BUF];
        let mut params = vec![0 as c_char; PARAM_BUF];
        let rc = (self.raw.get_unit_info)(
            self.handle,
            feature.as_mut_ptr(),
            feature.len(),
            version.as_mut_ptr(),
            version.len(),
            params.as_mut_ptr(),
            params.len(),
        );
        (rc == ACCEL_OK).then(|| UnitInfo {
            feature: from_buf(&feature),
            version: from_buf(&version),
            params: from_buf(&params),
        })
    }

    /// Value of `key` in the unit's parameter list.
    pub fn param(&self, key: &str) -> Option<String> {
        let key = CString::new(key).ok()?;
        read_buf(PARAM_BUF, |buf, len| (self.raw.get_param)(self.handle, key.as_ptr(), buf, len))
    }

    pub fn flag(&self, name: &str) -> Option<String> {
        let name = CString::new(name).ok()?;
        read_buf(PARAM_BUF, |buf, len| (self.raw.get_flag)(name.as_ptr(), buf, len))
    }

    /// Set an existing host flag. Returns false if the host refused.
    pub fn set_flag(&self, name: &str, value: &str) -> bool {
        let (Ok(name), Ok(value)) = (CString::new(name), CString::new(value)) else {
            return false;
        };
        (self.raw.set_flag)(name.as_ptr(), value.as_ptr()) == ACCEL_OK
    }

    pub fn supports_cpu_feature(&self, name: &str) -> bool {
        CString::new(name).is_ok_and(|name| (self.raw.support_cpu_feature)(name.as_ptr()) != 0)
    }

    /// Register one more entry. Only valid from `init` and `post_init`.
    pub fn register(&self, entry: &'static ExportEntry) -> Result<(), AccelStatus> {
        match (self.raw.register_native)(self.handle, entry) {
            ACCEL_OK => Ok(()),
            status => Err(status),
        }
    }

    /// Attach a diagnostic to the failure this call is about to return.
    pub fn report_error(&self, message: impl fmt::Display) {
        if let Ok(message) = CString::new(sanitize(message)) {
            (self.raw.report_error)(self.handle, message.as_ptr());
        }
    }

    pub fn log(&self, level: u32, message: impl fmt::Display) {
        if let Ok(message) = CString::new(sanitize(message)) {
            (self.raw.log)(self.handle, level, message.as_ptr());
        }
    }
}

impl fmt::Debug for Env<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env").field("handle", &self.handle).finish()
    }
}

fn read_buf(size: usize, fill: impl FnOnce(*mut c_char, usize) -> AccelStatus) -> Option<String> {
    let mut buf = vec![0 as c_char; size];
    (fill(buf.as_mut_ptr(), buf.len()) == ACCEL_OK).then(|| from_buf(&buf))
}

fn from_buf(buf: &[c_char]) -> String {
    // The host always NUL-terminates within the buffer.
    unsafe { CStr::from_ptr(buf.as_ptr()) }.to_string_lossy().into_owned()
}

fn sanitize(message: impl fmt::Display) -> String {
    message.to_string().replace('\0', "\\0")
}

/// Convert a lifecycle result into a status, reporting the error text.
pub fn status<E: fmt::Display>(env: &Env<'_>, result: Result<(), E>) -> AccelStatus {
    match result {
        Ok(()) => ACCEL_OK,
        Err(e) => {
            env.report_error(e);
            ACCEL_ERROR
        }
    }
}

/// Run a lifecycle hook for the `extern "C"` entry points generated by
/// [`export_lifecycle!`].
///
/// # Safety
/// `env` must be the pointer the host passed to the current lifecycle call.
#[doc(hidden)]
pub unsafe fn run_hook<E: fmt::Display>(
    env: *const AccelEnv,
    handle: AccelHandle,
    hook: fn(&Env<'_>) -> Result<(), E>,
) -> AccelStatus {
    match Env::from_raw(env, handle) {
        Some(env) => status(&env, hook(&env)),
        None => ACCEL_ERROR,
    }
}

#[doc(hidden)]
pub const fn __cstr(bytes: &'static [u8]) -> &'static CStr {
    match CStr::from_bytes_with_nul(bytes) {
        Ok(s) => s,
        Err(_) => panic!("string literal contains an interior NUL"),
    }
}

/// Build an [`ExportEntry`] in a `static`.
///
/// `entry!(class, method, descriptor, function, [tags...])`; the native name
/// defaults to the function's identifier. `function as "name"` overrides it.
///
/// `entry!(class, method, descriptor, provider p as "name", [tags...])`
/// defers the function to `p`, which the host calls with `"name"` the first
/// time the entry is lowered. Append `data expr` before the tags to pass a
/// pointer to the provider.
#[macro_export]
macro_rules! entry {
    ($class:literal, $method:literal, $descriptor:literal, provider $provider:path as $native:literal, $(data $data:expr,)? [$($tag:expr),* $(,)?]) => {
        $crate::ExportEntry::new(
            $crate::__cstr(concat!($class, "\0").as_bytes()),
            $crate::__cstr(concat!($method, "\0").as_bytes()),
            $crate::__cstr(concat!($descriptor, "\0").as_bytes()),
            $crate::__cstr(concat!($native, "\0").as_bytes()),
            $crate::__provider_data!($($data)?),
            &[$($tag),*],
        )
        .with_provider($provider)
    };
    (@build $class:literal, $method:literal, $descriptor:literal, $func:path, $native:expr, [$($tag:expr),*]) => {
        $crate::ExportEntry::new(
            $crate::__cstr(concat!($class, "\0").as_bytes()),
            $crate::__cstr(concat!($method, "\0").as_bytes()),
            $crate::__cstr(concat!($descriptor, "\0").as_bytes()),
            $crate::__cstr($native.as_bytes()),
            $func as *const ::std::ffi::c_void,
            &[$($tag),*],
        )
    };
    ($class:literal, $method:literal, $descriptor:literal, $func:ident, [$($tag:expr),* $(,)?]) => {
        $crate::entry!(@build $class, $method, $descriptor, $func, concat!(stringify!($func), "\0"), [$($tag),*])
    };
    ($class:literal, $method:literal, $descriptor:literal, $func:path as $native:literal, [$($tag:expr),* $(,)?]) => {
        $crate::entry!(@build $class, $method, $descriptor, $func, concat!($native, "\0"), [$($tag),*])
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __provider_data {
    () => {
        ::std::ptr::null()
    };
    ($data:expr) => {
        $data as *const ::std::ffi::c_void
    };
}

/// Generate `naccel_exports` returning a table of the given entries.
#[macro_export]
macro_rules! export_entries {
    ($($entry:expr),* $(,)?) => {
        const __NACCEL_ENTRIES: &[$crate::ExportEntry] = &[$($entry),*];
        static __NACCEL_TABLE: $crate::ExportTable = $crate::ExportTable::new(__NACCEL_ENTRIES);

        #[no_mangle]
        pub unsafe extern "C" fn naccel_exports() -> *const $crate::ExportTable {
            &__NACCEL_TABLE
        }
    };
}

/// Generate the lifecycle entry points from `fn(&Env) -> Result<(), E>` hooks.
///
/// `init` is required; `post_init` and `finalize` are exported only when given.
#[macro_export]
macro_rules! export_lifecycle {
    (init: $init:path $(, post_init: $post:path)? $(, finalize: $fin:path)? $(,)?) => {
        #[no_mangle]
        pub unsafe extern "C" fn naccel_init(
            env: *const $crate::AccelEnv,
            handle: $crate::AccelHandle,
        ) -> $crate::AccelStatus {
            $crate::run_hook(env, handle, $init)
        }

        $(
            #[no_mangle]
            pub unsafe extern "C" fn naccel_post_init(
                env: *const $crate::AccelEnv,
                handle: $crate::AccelHandle,
            ) -> $crate::AccelStatus {
                $crate::run_hook(env, handle, $post)
            }
        )?

        $(
            #[no_mangle]
            pub unsafe extern "C" fn naccel_finalize(
                env: *const $crate::AccelEnv,
                handle: $crate::AccelHandle,
            ) -> $crate::AccelStatus {
                $crate::run_hook(env, handle, $fin)
            }
        )?
    };
}

/// Common imports for unit crates.
pub mod prelude {
    pub use crate::{entry, export_entries, export_lifecycle};
    pub use crate::{log_level, status, tag, Env, UnitInfo};
    pub use crate::{AccelEnv, AccelStatus, ExportEntry, ACCEL_ERROR, ACCEL_OK};
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn twice(v: i32) -> i32 {
        v * 2
    }

    static TWICE: ExportEntry = entry!("demo/Math", "twice", "(I)I", twice, [tag::INT, tag::INT]);
    static RENAMED: ExportEntry = entry!("demo/Math", "twice", "(I)I", twice as "math_twice", [tag::INT, tag::INT]);

    unsafe extern "C" fn pick(_: *const AccelEnv, _: *const c_char, data: *mut std::ffi::c_void) -> *const std::ffi::c_void {
        data
    }

    static LAZY: ExportEntry = entry!("demo/Math", "lazy", "(I)I", provider pick as "math_lazy", [tag::INT, tag::INT]);
    static LAZY_DATA: ExportEntry =
        entry!("demo/Math", "lazy", "(I)I", provider pick as "math_lazy", data twice, [tag::INT, tag::INT]);

    fn read(ptr: *const c_char) -> &'static str {
        unsafe { CStr::from_ptr(ptr) }.to_str().unwrap()
    }

    #[test]
    fn test_entry_macro() {
        assert_eq!(read(TWICE.class_name), "demo/Math");
        assert_eq!(read(TWICE.method_name), "twice");
        assert_eq!(read(TWICE.descriptor), "(I)I");
        assert_eq!(read(TWICE.native_name), "twice");
        assert_eq!(TWICE.convention_len, 2);
        assert!(!TWICE.func.is_null());
        assert_eq!(read(RENAMED.native_name), "math_twice");
        assert!(TWICE.provider.is_none());
    }

    #[test]
    fn test_provided_entry_macro() {
        assert_eq!(read(LAZY.native_name), "math_lazy");
        assert!(LAZY.func.is_null());
        assert!(LAZY.provider.is_some());
        assert!(!LAZY_DATA.func.is_null());
        assert_eq!(LAZY_DATA.convention_len, 2);
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("a\0b"), "a\\0b");
        assert_eq!(sanitize(format_args!("{}-{}", 1, 2)), "1-2");
    }

    #[test]
    fn test_null_env() {
        assert!(unsafe { Env::from_raw(std::ptr::null(), 1) }.is_none());
        fn ok(_: &Env<'_>) -> Result<(), String> {
            Ok(())
        }
        assert_eq!(unsafe { run_hook(std::ptr::null(), 1, ok) }, ACCEL_ERROR);
    }
}
