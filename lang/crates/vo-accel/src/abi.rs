//! C ABI shared between the host and native acceleration units.
//!
//! Everything in this module is `#[repr(C)]` and crosses the dylib boundary.
//! Unit authors should use the re-exports in `vo-accel-ext` instead of
//! depending on the layout directly.

use std::ffi::{c_char, c_void};

/// ABI version, must match `ExportTable::version` and `AccelEnv::version`.
pub const ACCEL_ABI_VERSION: u32 = 1;

/// Accel version reported through `get_accel_version`.
pub const ACCEL_VERSION: u32 = 1;

/// Upper bound on the number of entries in one export table.
pub const MAX_EXPORT_ENTRIES: u32 = 65536;

/// Status returned by lifecycle entry points and env callbacks.
pub type AccelStatus = i32;

pub const ACCEL_OK: AccelStatus = 0;
pub const ACCEL_ERROR: AccelStatus = -1;

/// Process-unique identifier of a unit, handed to every lifecycle call.
pub type AccelHandle = u64;

// ==================== Entry points ====================

pub const INIT_SYMBOL: &str = "naccel_init";
pub const POST_INIT_SYMBOL: &str = "naccel_post_init";
pub const FINALIZE_SYMBOL: &str = "naccel_finalize";
pub const EXPORTS_SYMBOL: &str = "naccel_exports";

/// `naccel_init`, `naccel_post_init` and `naccel_finalize` share this signature.
pub type LifecycleFn = unsafe extern "C" fn(env: *const AccelEnv, handle: AccelHandle) -> AccelStatus;

/// `naccel_exports`.
pub type ExportsFn = unsafe extern "C" fn() -> *const ExportTable;

/// Produces the native function of a provided entry. Called at most once per
/// entry, when the entry is first lowered; `data` is the entry's `func` field.
/// Returning null makes the entry unusable.
pub type ProviderFn =
    unsafe extern "C" fn(env: *const AccelEnv, native_name: *const c_char, data: *mut c_void) -> *const c_void;

// ==================== Calling-convention tags ====================

/// Calling-convention tags used in `ExportEntry::convention`.
pub mod tag {
    pub const VOID: u8 = 0;
    pub const BOOLEAN: u8 = 1;
    pub const BYTE: u8 = 2;
    pub const CHAR: u8 = 3;
    pub const SHORT: u8 = 4;
    pub const INT: u8 = 5;
    pub const LONG: u8 = 6;
    pub const FLOAT: u8 = 7;
    pub const DOUBLE: u8 = 8;
    pub const OBJECT_REF: u8 = 9;
    pub const IMPLICIT_RECEIVER: u8 = 10;

    /// Set on a primitive tag to describe an array of that primitive.
    pub const ARRAY: u8 = 0x10;

    pub const BOOLEAN_ARRAY: u8 = ARRAY | BOOLEAN;
    pub const BYTE_ARRAY: u8 = ARRAY | BYTE;
    pub const CHAR_ARRAY: u8 = ARRAY | CHAR;
    pub const SHORT_ARRAY: u8 = ARRAY | SHORT;
    pub const INT_ARRAY: u8 = ARRAY | INT;
    pub const LONG_ARRAY: u8 = ARRAY | LONG;
    pub const FLOAT_ARRAY: u8 = ARRAY | FLOAT;
    pub const DOUBLE_ARRAY: u8 = ARRAY | DOUBLE;
}

/// Log levels accepted by `AccelEnv::log`.
pub mod log_level {
    pub const ERROR: u32 = 1;
    pub const WARN: u32 = 2;
    pub const INFO: u32 = 3;
    pub const DEBUG: u32 = 4;
    pub const TRACE: u32 = 5;
}

// ==================== Export table ====================

/// One exported replacement.
///
/// Strings are NUL-terminated UTF-8. `convention` lists the native parameter
/// tags followed by exactly one return tag. When `provider` is set, `func` is
/// opaque data handed to the provider and may be null.
#[repr(C)]
pub struct ExportEntry {
    pub class_name: *const c_char,
    pub method_name: *const c_char,
    pub descriptor: *const c_char,
    /// Symbolic name of the native function, used in diagnostics and by
    /// `is_accel_native_call`.
    pub native_name: *const c_char,
    pub func: *const c_void,
    pub convention: *const u8,
    pub convention_len: u32,
    pub provider: Option<ProviderFn>,
}

impl ExportEntry {
    /// Build an entry from `'static` C strings and a tag list.
    pub const fn new(
        class_name: &'static std::ffi::CStr,
        method_name: &'static std::ffi::CStr,
        descriptor: &'static std::ffi::CStr,
        native_name: &'static std::ffi::CStr,
        func: *const c_void,
        convention: &'static [u8],
    ) -> Self {
        Self {
            class_name: class_name.as_ptr(),
            method_name: method_name.as_ptr(),
            descriptor: descriptor.as_ptr(),
            native_name: native_name.as_ptr(),
            func,
            convention: convention.as_ptr(),
            convention_len: convention.len() as u32,
            provider: None,
        }
    }

    /// Resolve the native function lazily through `provider`; `func` becomes
    /// its data argument.
    pub const fn with_provider(self, provider: ProviderFn) -> Self {
        Self {
            provider: Some(provider),
            ..self
        }
    }
}

unsafe impl Send for ExportEntry {}
unsafe impl Sync for ExportEntry {}

/// Table returned by `naccel_exports()`.
#[repr(C)]
pub struct ExportTable {
    pub version: u32,
    pub count: u32,
    pub entries: *const ExportEntry,
}

impl ExportTable {
    pub const fn new(entries: &'static [ExportEntry]) -> Self {
        Self {
            version: ACCEL_ABI_VERSION,
            count: entries.len() as u32,
            entries: entries.as_ptr(),
        }
    }
}

unsafe impl Send for ExportTable {}
unsafe impl Sync for ExportTable {}

// ==================== Host env ====================

/// Callback table passed to every lifecycle call.
///
/// Output buffers are filled snprintf-style: truncated to `len - 1` bytes and
/// always NUL-terminated. Callbacks only act while the host is inside a
/// lifecycle call on the calling thread; otherwise they return `ACCEL_ERROR`.
#[repr(C)]
pub struct AccelEnv {
    pub version: u32,
    pub get_accel_version: extern "C" fn() -> u32,
    pub get_vm_version: extern "C" fn(buf: *mut c_char, len: usize) -> AccelStatus,
    pub get_unit_info: extern "C" fn(
        handle: AccelHandle,
        feature_buf: *mut c_char,
        feature_len: usize,
        version_buf: *mut c_char,
        version_len: usize,
        params_buf: *mut c_char,
        params_len: usize,
    ) -> AccelStatus,
    pub get_param: extern "C" fn(
        handle: AccelHandle,
        key: *const c_char,
        buf: *mut c_char,
        len: usize,
    ) -> AccelStatus,
    pub get_flag: extern "C" fn(name: *const c_char, buf: *mut c_char, len: usize) -> AccelStatus,
    pub set_flag: extern "C" fn(name: *const c_char, value: *const c_char) -> AccelStatus,
    pub support_cpu_feature: extern "C" fn(name: *const c_char) -> u8,
    pub register_native: extern "C" fn(handle: AccelHandle, entry: *const ExportEntry) -> AccelStatus,
    pub report_error: extern "C" fn(handle: AccelHandle, message: *const c_char),
    pub log: extern "C" fn(handle: AccelHandle, level: u32, message: *const c_char),
}
