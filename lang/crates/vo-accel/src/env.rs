//! Host callbacks exposed to units through [`AccelEnv`].
//!
//! Callbacks only act while the controller is inside a lifecycle call on the
//! current thread. The controller installs a [`Session`] for the duration of
//! each call; outside of it every callback reports `ACCEL_ERROR`.

use std::cell::{Cell, RefCell};
use std::ffi::{c_char, CStr};
use std::sync::Arc;

use crate::abi::{
    log_level, AccelEnv, AccelHandle, AccelStatus, ExportEntry, ACCEL_ABI_VERSION, ACCEL_ERROR, ACCEL_OK,
    ACCEL_VERSION,
};
use crate::config::FlagStore;
use crate::error::AccelError;
use crate::loader::read_export_entry;
use crate::registry::Registry;

/// The env table handed to every lifecycle call.
pub static HOST_ENV: AccelEnv = AccelEnv {
    version: ACCEL_ABI_VERSION,
    get_accel_version,
    get_vm_version,
    get_unit_info,
    get_param,
    get_flag,
    set_flag,
    support_cpu_feature,
    register_native,
    report_error,
    log,
};

// ==================== Session ====================

/// State visible to callbacks during one lifecycle call.
pub(crate) struct Session<'a> {
    /// The unit whose entry point is running. Handle-taking callbacks reject
    /// every other handle.
    handle: AccelHandle,
    registry: &'a RefCell<Registry>,
    flags: &'a FlagStore,
    vm_version: &'a str,
    /// Set when a callback rejected something the unit asked for.
    failure: RefCell<Option<AccelError>>,
    /// Text passed to `report_error`, per handle.
    reports: RefCell<Vec<(AccelHandle, String)>>,
}

impl<'a> Session<'a> {
    pub(crate) fn new(
        handle: AccelHandle,
        registry: &'a RefCell<Registry>,
        flags: &'a FlagStore,
        vm_version: &'a str,
    ) -> Self {
        Self {
            handle,
            registry,
            flags,
            vm_version,
            failure: RefCell::new(None),
            reports: RefCell::new(Vec::new()),
        }
    }

    /// Run `f` with this session installed for the current thread.
    pub(crate) fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let _scope = SessionScope::install(self);
        f()
    }

    /// First error raised by a callback, if any.
    pub(crate) fn take_failure(&self) -> Option<AccelError> {
        self.failure.borrow_mut().take()
    }

    /// Messages reported for `handle`, joined.
    pub(crate) fn take_report(&self, handle: AccelHandle) -> Option<String> {
        let mut reports = self.reports.borrow_mut();
        let (mine, rest): (Vec<_>, Vec<_>) = reports.drain(..).partition(|(h, _)| *h == handle);
        *reports = rest;
        if mine.is_empty() {
            None
        } else {
            Some(mine.into_iter().map(|(_, m)| m).collect::<Vec<_>>().join("; "))
        }
    }

    fn owns(&self, handle: AccelHandle) -> bool {
        if handle != self.handle {
            tracing::warn!(handle, current = self.handle, "accel env callback used with another unit's handle");
            return false;
        }
        true
    }

    fn fail(&self, err: AccelError) {
        let mut failure = self.failure.borrow_mut();
        if failure.is_none() {
            *failure = Some(err);
        }
    }
}

thread_local! {
    static CURRENT: Cell<*const ()> = const { Cell::new(std::ptr::null()) };
}

struct SessionScope {
    previous: *const (),
}

impl SessionScope {
    fn install(session: &Session<'_>) -> Self {
        let ptr = session as *const Session<'_> as *const ();
        Self {
            previous: CURRENT.with(|c| c.replace(ptr)),
        }
    }
}

impl Drop for SessionScope {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.previous));
    }
}

fn with_session<R>(f: impl FnOnce(&Session<'_>) -> R) -> Option<R> {
    let ptr = CURRENT.with(Cell::get);
    if ptr.is_null() {
        tracing::warn!("accel env callback used outside a lifecycle call");
        return None;
    }
    // The scope guard keeps the session alive while the pointer is installed.
    let session = unsafe { &*(ptr as *const Session<'_>) };
    Some(f(session))
}

fn status(ok: bool) -> AccelStatus {
    if ok {
        ACCEL_OK
    } else {
        ACCEL_ERROR
    }
}

// ==================== Helpers ====================

unsafe fn read_c_str<'s>(ptr: *const c_char) -> Option<&'s str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Copy `value` into `buf` snprintf-style: truncate to `len - 1` bytes and
/// NUL-terminate. Returns false if there is no room for the terminator.
unsafe fn write_c_str(value: &str, buf: *mut c_char, len: usize) -> bool {
    if buf.is_null() || len == 0 {
        return false;
    }
    let n = value.len().min(len - 1);
    std::ptr::copy_nonoverlapping(value.as_ptr(), buf.cast::<u8>(), n);
    *buf.add(n) = 0;
    true
}

/// Like [`write_c_str`] but a null buffer means "not requested".
unsafe fn write_optional(value: &str, buf: *mut c_char, len: usize) -> bool {
    buf.is_null() || write_c_str(value, buf, len)
}

// ==================== Callbacks ====================

extern "C" fn get_accel_version() -> u32 {
    ACCEL_VERSION
}

extern "C" fn get_vm_version(buf: *mut c_char, len: usize) -> AccelStatus {
    with_session(|s| unsafe { status(write_c_str(s.vm_version, buf, len)) }).unwrap_or(ACCEL_ERROR)
}

extern "C" fn get_unit_info(
    handle: AccelHandle,
    feature_buf: *mut c_char,
    feature_len: usize,
    version_buf: *mut c_char,
    version_len: usize,
    params_buf: *mut c_char,
    params_len: usize,
) -> AccelStatus {
    with_session(|s| {
        if !s.owns(handle) {
            return ACCEL_ERROR;
        }
        let registry = s.registry.borrow();
        let Some(unit) = registry.unit(handle) else {
            return ACCEL_ERROR;
        };
        let spec = unit.spec();
        unsafe {
            status(
                write_optional(spec.feature(), feature_buf, feature_len)
                    && write_optional(spec.version().unwrap_or(""), version_buf, version_len)
                    && write_optional(spec.raw_params().unwrap_or(""), params_buf, params_len),
            )
        }
    })
    .unwrap_or(ACCEL_ERROR)
}

extern "C" fn get_param(handle: AccelHandle, key: *const c_char, buf: *mut c_char, len: usize) -> AccelStatus {
    with_session(|s| {
        if !s.owns(handle) {
            return ACCEL_ERROR;
        }
        let Some(key) = (unsafe { read_c_str(key) }) else {
            return ACCEL_ERROR;
        };
        let registry = s.registry.borrow();
        match registry.unit(handle).and_then(|u| u.spec().param(key)) {
            Some(value) => unsafe { status(write_c_str(value, buf, len)) },
            None => ACCEL_ERROR,
        }
    })
    .unwrap_or(ACCEL_ERROR)
}

extern "C" fn get_flag(name: *const c_char, buf: *mut c_char, len: usize) -> AccelStatus {
    with_session(|s| {
        let value = unsafe { read_c_str(name) }.and_then(|name| s.flags.get(name));
        match value {
            Some(value) => unsafe { status(write_c_str(&value, buf, len)) },
            None => ACCEL_ERROR,
        }
    })
    .unwrap_or(ACCEL_ERROR)
}

extern "C" fn set_flag(name: *const c_char, value: *const c_char) -> AccelStatus {
    with_session(|s| {
        let (Some(name), Some(value)) = (unsafe { read_c_str(name) }, unsafe { read_c_str(value) }) else {
            return ACCEL_ERROR;
        };
        let ok = s.flags.set(name, value);
        if ok {
            tracing::debug!(flag = name, value, "flag set by unit");
        } else {
            tracing::warn!(flag = name, "unit tried to set an undefined flag");
        }
        status(ok)
    })
    .unwrap_or(ACCEL_ERROR)
}

extern "C" fn support_cpu_feature(name: *const c_char) -> u8 {
    match unsafe { read_c_str(name) } {
        Some(name) => u8::from(cpu_feature_supported(name)),
        None => 0,
    }
}

extern "C" fn register_native(handle: AccelHandle, entry: *const ExportEntry) -> AccelStatus {
    with_session(|s| {
        if !s.owns(handle) {
            return ACCEL_ERROR;
        }
        let unit_name: Arc<str> = match s.registry.borrow().unit(handle) {
            Some(unit) => unit.name_arc(),
            None => return ACCEL_ERROR,
        };
        let Some(raw) = (unsafe { entry.as_ref() }) else {
            s.fail(AccelError::invalid_table(&unit_name, "register_native called with a null entry"));
            return ACCEL_ERROR;
        };
        let result = unsafe { read_export_entry(raw, &unit_name, 0) }
            .and_then(|entry| s.registry.borrow_mut().register_entries(handle, vec![entry]));
        match result {
            Ok(()) => ACCEL_OK,
            Err(e) => {
                s.fail(e);
                ACCEL_ERROR
            }
        }
    })
    .unwrap_or(ACCEL_ERROR)
}

extern "C" fn report_error(handle: AccelHandle, message: *const c_char) {
    let Some(message) = (unsafe { read_c_str(message) }) else {
        return;
    };
    with_session(|s| {
        if s.owns(handle) {
            s.reports.borrow_mut().push((handle, message.to_string()));
        }
    });
}

extern "C" fn log(handle: AccelHandle, level: u32, message: *const c_char) {
    let Some(message) = (unsafe { read_c_str(message) }) else {
        return;
    };
    match level {
        log_level::ERROR => tracing::error!(target: "vo_accel::unit", handle, "{}", message),
        log_level::WARN => tracing::warn!(target: "vo_accel::unit", handle, "{}", message),
        log_level::INFO => tracing::info!(target: "vo_accel::unit", handle, "{}", message),
        log_level::DEBUG => tracing::debug!(target: "vo_accel::unit", handle, "{}", message),
        _ => tracing::trace!(target: "vo_accel::unit", handle, "{}", message),
    }
}

/// Runtime CPU feature detection by lowercase name.
pub fn cpu_feature_supported(name: &str) -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        match name {
            "sse2" => is_x86_feature_detected!("sse2"),
            "sse3" => is_x86_feature_detected!("sse3"),
            "ssse3" => is_x86_feature_detected!("ssse3"),
            "sse4.1" => is_x86_feature_detected!("sse4.1"),
            "sse4.2" => is_x86_feature_detected!("sse4.2"),
            "popcnt" => is_x86_feature_detected!("popcnt"),
            "avx" => is_x86_feature_detected!("avx"),
            "avx2" => is_x86_feature_detected!("avx2"),
            "fma" => is_x86_feature_detected!("fma"),
            "bmi1" => is_x86_feature_detected!("bmi1"),
            "bmi2" => is_x86_feature_detected!("bmi2"),
            "avx512f" => is_x86_feature_detected!("avx512f"),
            _ => false,
        }
    }
    #[cfg(target_arch = "aarch64")]
    {
        match name {
            "neon" | "asimd" => std::arch::is_aarch64_feature_detected!("neon"),
            "crc" | "crc32" => std::arch::is_aarch64_feature_detected!("crc"),
            "aes" => std::arch::is_aarch64_feature_detected!("aes"),
            "sha2" => std::arch::is_aarch64_feature_detected!("sha2"),
            "sve" => std::arch::is_aarch64_feature_detected!("sve"),
            "fp16" => std::arch::is_aarch64_feature_detected!("fp16"),
            _ => false,
        }
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        let _ = name;
        false
    }
}
