//! In-process acceleration units used by the integration tests.
//!
//! Every unit records lifecycle events under the value of its `tag` parameter,
//! so tests running in parallel do not see each other's events. Error
//! injection is driven by parameters: `init_error`, `post_init_error` and
//! `finalize_error`.

#![allow(dead_code)]

use std::ffi::{c_char, c_void, CStr};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use vo_accel::abi::{
    tag, AccelEnv, AccelHandle, AccelStatus, ExportEntry, ExportTable, ACCEL_ERROR, ACCEL_OK,
};
use vo_accel::{AccelConfig, StaticModule, StaticSource};

static EVENTS: Mutex<Vec<(String, String)>> = parking_lot::const_mutex(Vec::new());

/// Events recorded for `tag`, in order.
pub fn events(tag: &str) -> Vec<String> {
    EVENTS
        .lock()
        .iter()
        .filter(|(t, _)| t == tag)
        .map(|(_, e)| e.clone())
        .collect()
}

pub fn count(tag: &str, event: &str) -> usize {
    events(tag).iter().filter(|e| *e == event).count()
}

unsafe fn param(env: *const AccelEnv, handle: AccelHandle, key: &CStr) -> Option<String> {
    let mut buf = [0 as c_char; 256];
    let rc = ((*env).get_param)(handle, key.as_ptr(), buf.as_mut_ptr(), buf.len());
    (rc == ACCEL_OK).then(|| CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned())
}

unsafe fn unit_info(env: *const AccelEnv, handle: AccelHandle) -> String {
    let mut feature = [0 as c_char; 64];
    let mut version = [0 as c_char; 64];
    let mut params = [0 as c_char; 256];
    let rc = ((*env).get_unit_info)(
        handle,
        feature.as_mut_ptr(),
        feature.len(),
        version.as_mut_ptr(),
        version.len(),
        params.as_mut_ptr(),
        params.len(),
    );
    if rc != ACCEL_OK {
        return "info-error".to_string();
    }
    let s = |b: &[c_char]| CStr::from_ptr(b.as_ptr()).to_string_lossy().into_owned();
    format!("info:{}:{}:{}", s(&feature), s(&version), s(&params))
}

unsafe fn record(env: *const AccelEnv, handle: AccelHandle, event: impl Into<String>) {
    if let Some(tag) = param(env, handle, c"tag") {
        EVENTS.lock().push((tag, event.into()));
    }
}

/// Record `event`, then fail with `message` if `error_key` is set.
unsafe fn step(
    env: *const AccelEnv,
    handle: AccelHandle,
    event: &str,
    error_key: &CStr,
    message: &CStr,
) -> AccelStatus {
    record(env, handle, event);
    if param(env, handle, error_key).is_some() {
        ((*env).report_error)(handle, message.as_ptr());
        return ACCEL_ERROR;
    }
    ACCEL_OK
}

// ==================== Lifecycle entry points ====================

unsafe extern "C" fn hello_init(env: *const AccelEnv, handle: AccelHandle) -> AccelStatus {
    record(env, handle, unit_info(env, handle));
    step(env, handle, "init", c"init_error", c"Returning error in `naccel_init`")
}

unsafe extern "C" fn hello_post_init(env: *const AccelEnv, handle: AccelHandle) -> AccelStatus {
    step(env, handle, "post_init", c"post_init_error", c"Returning error in `naccel_post_init`")
}

unsafe extern "C" fn hello_finalize(env: *const AccelEnv, handle: AccelHandle) -> AccelStatus {
    step(env, handle, "finalize", c"finalize_error", c"Returning error in `naccel_finalize`")
}

/// Fails without a diagnostic.
unsafe extern "C" fn silent_init(env: *const AccelEnv, handle: AccelHandle) -> AccelStatus {
    record(env, handle, "init");
    7
}

/// Registers an extra entry from post_init; `late_dup` makes it collide.
unsafe extern "C" fn late_post_init(env: *const AccelEnv, handle: AccelHandle) -> AccelStatus {
    record(env, handle, "post_init");
    let entry = if param(env, handle, c"late_dup").is_some() {
        &HELLO_ENTRIES[0]
    } else {
        &LATE_ENTRY
    };
    let rc = ((*env).register_native)(handle, entry);
    record(env, handle, if rc == ACCEL_OK { "registered" } else { "register_failed" });
    rc
}

/// Toggles a host flag through the env.
unsafe extern "C" fn flag_init(env: *const AccelEnv, handle: AccelHandle) -> AccelStatus {
    record(env, handle, "init");
    ((*env).set_flag)(c"AccelFastPath".as_ptr(), c"on".as_ptr())
}

// ==================== Native replacements ====================

extern "C" fn int_value() -> i32 {
    42
}

extern "C" fn long_value() -> i64 {
    43
}

extern "C" fn float_value() -> f32 {
    44.0
}

extern "C" fn double_value() -> f64 {
    45.0
}

extern "C" fn checksum(data: *const i8, len: i32) -> i32 {
    let bytes = unsafe { std::slice::from_raw_parts(data, len as usize) };
    bytes.iter().map(|&b| i32::from(b)).sum()
}

extern "C" fn is_null(obj: *const c_void) -> u8 {
    u8::from(obj.is_null())
}

extern "C" fn identity(obj: *mut c_void) -> *mut c_void {
    obj
}

/// Instance method: first field of `this` plus `s`.
extern "C" fn scaled(this: *const i64, s: i16) -> i32 {
    let field = unsafe { *this };
    field as i32 + i32::from(s)
}

extern "C" fn add_ints(a: i32, b: i32) -> i32 {
    a + b
}

extern "C" fn add_doubles(a: f64, b: f64) -> f64 {
    a + b
}

/// `a[i] += b[i]` over the shorter length, in place.
extern "C" fn add_arrays(a: *mut i32, a_len: i32, b: *const i32, b_len: i32) {
    let n = a_len.min(b_len) as usize;
    let (a, b) = unsafe { (std::slice::from_raw_parts_mut(a, n), std::slice::from_raw_parts(b, n)) };
    for (x, y) in a.iter_mut().zip(b) {
        *x += y;
    }
}

extern "C" fn mix(i: i32, l: i64, f: f32, d: f64) -> f64 {
    f64::from(i) + l as f64 + f64::from(f) + d
}

extern "C" fn upper(c: u16) -> u16 {
    if (u16::from(b'a')..=u16::from(b'z')).contains(&c) {
        c - 32
    } else {
        c
    }
}

extern "C" fn other_int_value() -> i32 {
    -1
}

extern "C" fn late_answer() -> i32 {
    7
}

pub const HELLO_CLASS: &str = "demo/Hello";

pub static HELLO_ENTRIES: [ExportEntry; 13] = [
    ExportEntry::new(c"demo/Hello", c"intValue", c"()I", c"hello_int_value", int_value as *const c_void, &[tag::INT]),
    ExportEntry::new(c"demo/Hello", c"longValue", c"()J", c"hello_long_value", long_value as *const c_void, &[tag::LONG]),
    ExportEntry::new(c"demo/Hello", c"floatValue", c"()F", c"hello_float_value", float_value as *const c_void, &[tag::FLOAT]),
    ExportEntry::new(c"demo/Hello", c"doubleValue", c"()D", c"hello_double_value", double_value as *const c_void, &[tag::DOUBLE]),
    ExportEntry::new(c"demo/Hello", c"checksum", c"([B)I", c"hello_checksum", checksum as *const c_void, &[tag::BYTE_ARRAY, tag::INT]),
    ExportEntry::new(
        c"demo/Hello",
        c"isNull",
        c"(Ljava/lang/Object;)Z",
        c"hello_is_null",
        is_null as *const c_void,
        &[tag::OBJECT_REF, tag::BOOLEAN],
    ),
    ExportEntry::new(
        c"demo/Hello",
        c"identity",
        c"(Ljava/lang/Object;)Ljava/lang/Object;",
        c"hello_identity",
        identity as *const c_void,
        &[tag::OBJECT_REF, tag::OBJECT_REF],
    ),
    ExportEntry::new(
        c"demo/Hello",
        c"scaled",
        c"(S)I",
        c"hello_scaled",
        scaled as *const c_void,
        &[tag::IMPLICIT_RECEIVER, tag::SHORT, tag::INT],
    ),
    ExportEntry::new(c"demo/Hello", c"addInts", c"(II)I", c"hello_add_ints", add_ints as *const c_void, &[tag::INT, tag::INT, tag::INT]),
    ExportEntry::new(
        c"demo/Hello",
        c"addDoubles",
        c"(DD)D",
        c"hello_add_doubles",
        add_doubles as *const c_void,
        &[tag::DOUBLE, tag::DOUBLE, tag::DOUBLE],
    ),
    ExportEntry::new(
        c"demo/Hello",
        c"addArrays",
        c"([I[I)V",
        c"hello_add_arrays",
        add_arrays as *const c_void,
        &[tag::INT_ARRAY, tag::INT_ARRAY, tag::VOID],
    ),
    ExportEntry::new(
        c"demo/Hello",
        c"mix",
        c"(IJFD)D",
        c"hello_mix",
        mix as *const c_void,
        &[tag::INT, tag::LONG, tag::FLOAT, tag::DOUBLE, tag::DOUBLE],
    ),
    ExportEntry::new(c"demo/Hello", c"upper", c"(C)C", c"hello_upper", upper as *const c_void, &[tag::CHAR, tag::CHAR]),
];

static HELLO_TABLE: ExportTable = ExportTable::new(&HELLO_ENTRIES);

unsafe extern "C" fn hello_exports() -> *const ExportTable {
    &HELLO_TABLE
}

/// Exports `demo/Hello.intValue()I` again.
static OTHER_ENTRIES: [ExportEntry; 1] = [ExportEntry::new(
    c"demo/Hello",
    c"intValue",
    c"()I",
    c"other_int_value",
    other_int_value as *const c_void,
    &[tag::INT],
)];

static OTHER_TABLE: ExportTable = ExportTable::new(&OTHER_ENTRIES);

unsafe extern "C" fn other_exports() -> *const ExportTable {
    &OTHER_TABLE
}

static LATE_ENTRY: ExportEntry =
    ExportEntry::new(c"demo/Late", c"answer", c"()I", c"late_answer", late_answer as *const c_void, &[tag::INT]);

static EMPTY_TABLE: ExportTable = ExportTable::new(&[]);

unsafe extern "C" fn empty_exports() -> *const ExportTable {
    &EMPTY_TABLE
}

/// Declares `(I)I` for a `(J)J` method.
static MISMATCHED_ENTRIES: [ExportEntry; 1] = [ExportEntry::new(
    c"demo/Bad",
    c"widen",
    c"(J)J",
    c"bad_widen",
    add_ints as *const c_void,
    &[tag::INT, tag::INT],
)];

static MISMATCHED_TABLE: ExportTable = ExportTable::new(&MISMATCHED_ENTRIES);

unsafe extern "C" fn mismatched_exports() -> *const ExportTable {
    &MISMATCHED_TABLE
}

unsafe extern "C" fn null_exports() -> *const ExportTable {
    std::ptr::null()
}

// ==================== Provided entries ====================

extern "C" fn square(v: i32) -> i32 {
    v * v
}

static SQUARE_PROVIDED: AtomicUsize = AtomicUsize::new(0);
static MISSING_PROVIDED: AtomicUsize = AtomicUsize::new(0);

/// Times the provider was asked for `native_name`.
pub fn provider_calls(native_name: &str) -> usize {
    match native_name {
        "provided_square" => SQUARE_PROVIDED.load(Ordering::SeqCst),
        "provided_missing" => MISSING_PROVIDED.load(Ordering::SeqCst),
        _ => 0,
    }
}

/// Hands back `data` for names it knows.
unsafe extern "C" fn provide(env: *const AccelEnv, native_name: *const c_char, data: *mut c_void) -> *const c_void {
    assert_eq!(((*env).get_accel_version)(), vo_accel::abi::ACCEL_VERSION);
    match CStr::from_ptr(native_name).to_bytes() {
        b"provided_square" => {
            SQUARE_PROVIDED.fetch_add(1, Ordering::SeqCst);
            data as *const c_void
        }
        b"provided_missing" => {
            MISSING_PROVIDED.fetch_add(1, Ordering::SeqCst);
            std::ptr::null()
        }
        _ => std::ptr::null(),
    }
}

static PROVIDED_ENTRIES: [ExportEntry; 2] = [
    ExportEntry::new(c"demo/Provided", c"square", c"(I)I", c"provided_square", square as *const c_void, &[tag::INT, tag::INT])
        .with_provider(provide),
    ExportEntry::new(c"demo/Provided", c"missing", c"()I", c"provided_missing", std::ptr::null(), &[tag::INT])
        .with_provider(provide),
];

static PROVIDED_TABLE: ExportTable = ExportTable::new(&PROVIDED_ENTRIES);

unsafe extern "C" fn provided_exports() -> *const ExportTable {
    &PROVIDED_TABLE
}

// ==================== Source ====================

/// Every fixture unit, keyed by identifier.
pub fn source() -> StaticSource {
    StaticSource::new()
        .with("libHelloAccel_1", || {
            StaticModule::new("libHelloAccel_1")
                .init(hello_init)
                .post_init(hello_post_init)
                .finalize(hello_finalize)
                .exports(hello_exports)
        })
        .with("libHelloAccel_2", || {
            StaticModule::new("libHelloAccel_2")
                .init(hello_init)
                .exports(empty_exports)
        })
        .with("libOtherAccel_1", || {
            StaticModule::new("libOtherAccel_1")
                .init(hello_init)
                .post_init(hello_post_init)
                .finalize(hello_finalize)
                .exports(other_exports)
        })
        .with("libEmptyAccel_1", || {
            StaticModule::new("libEmptyAccel_1")
                .init(hello_init)
                .post_init(hello_post_init)
                .finalize(hello_finalize)
                .exports(empty_exports)
        })
        .with("libNoFinalize_1", || {
            StaticModule::new("libNoFinalize_1")
                .init(hello_init)
                .exports(empty_exports)
        })
        .with("libSilentAccel_1", || {
            StaticModule::new("libSilentAccel_1")
                .init(silent_init)
                .finalize(hello_finalize)
                .exports(empty_exports)
        })
        .with("libLateAccel_1", || {
            StaticModule::new("libLateAccel_1")
                .init(hello_init)
                .post_init(late_post_init)
                .finalize(hello_finalize)
                .exports(empty_exports)
        })
        .with("libFlagAccel_1", || {
            StaticModule::new("libFlagAccel_1")
                .init(flag_init)
                .exports(empty_exports)
        })
        .with("libBadConv_1", || {
            StaticModule::new("libBadConv_1")
                .init(hello_init)
                .finalize(hello_finalize)
                .exports(mismatched_exports)
        })
        .with("libNullTable_1", || {
            StaticModule::new("libNullTable_1")
                .init(hello_init)
                .exports(null_exports)
        })
        .with("libNoInit_1", || StaticModule::new("libNoInit_1").exports(empty_exports))
        .with("libProvidedAccel_1", || {
            StaticModule::new("libProvidedAccel_1")
                .init(hello_init)
                .exports(provided_exports)
        })
}

/// Enabled config declaring `options`.
pub fn config<const N: usize>(options: [&str; N]) -> AccelConfig {
    AccelConfig::new().enabled(true).units(options)
}
