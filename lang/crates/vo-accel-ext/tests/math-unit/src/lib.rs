//! `MathDylibAccel_1`: a unit shipped as a real shared library.
//!
//! Parameters: `fail=<anything>` makes `naccel_init` fail.

#![allow(non_snake_case)]

use std::ffi::{c_char, c_void, CStr};

use vo_accel_ext::prelude::*;

extern "C" fn add(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

extern "C" fn sum(data: *const i32, len: i32) -> i64 {
    let values = unsafe { std::slice::from_raw_parts(data, len as usize) };
    values.iter().map(|&v| i64::from(v)).sum()
}

extern "C" fn negate(v: i32) -> i32 {
    v.wrapping_neg()
}

unsafe extern "C" fn provide(_env: *const AccelEnv, native_name: *const c_char, _data: *mut c_void) -> *const c_void {
    match CStr::from_ptr(native_name).to_bytes() {
        b"dylib_negate" => negate as *const c_void,
        _ => std::ptr::null(),
    }
}

fn init(env: &Env<'_>) -> Result<(), String> {
    if env.param("fail").is_some() {
        return Err("asked to fail".to_string());
    }
    env.log(log_level::DEBUG, "math dylib unit ready");
    Ok(())
}

fn finalize(env: &Env<'_>) -> Result<(), String> {
    env.log(log_level::DEBUG, "math dylib unit finalized");
    Ok(())
}

export_entries! {
    entry!("demo/DylibMath", "add", "(II)I", add, [tag::INT, tag::INT, tag::INT]),
    entry!("demo/DylibMath", "sum", "([I)J", sum, [tag::INT_ARRAY, tag::LONG]),
    entry!("demo/DylibMath", "negate", "(I)I", provider provide as "dylib_negate", [tag::INT, tag::INT]),
}

export_lifecycle!(init: init, finalize: finalize);
