//! Native call surface: values, errors, scopes and references
//!
//! Every entry point follows the same calling convention:
//! - the environment handle comes first (except the few thread-safe entry
//!   points that are callable from any thread)
//! - outputs are written through caller-provided pointers
//! - the return value is a `napi_status`, also recorded as the
//!   environment's last error
//!
//! Entry points that may run native callbacks use [`napi_call_reentrant`],
//! which refuses to start while an exception is pending and never holds a
//! borrow of the environment across the callback. Object, property and
//! function entry points live in `runtime::object`; async work and thread-safe
//! functions in `runtime::r#async`.

use std::ffi::{CStr, c_char, c_void};

use crate::error::Status;

use super::abi::{
    NAPI_AUTO_LENGTH, NAPI_VERSION, napi_cleanup_hook, napi_env, napi_escapable_handle_scope,
    napi_extended_error_info, napi_handle_scope, napi_handle_scope__, napi_escapable_handle_scope__,
    napi_ref, napi_ref__, napi_status, napi_value, napi_valuetype,
};
use super::env::RawEnv;
use super::heap::{HeapId, HeapValue, ObjectKind, Property, PropertyKey, PropertySlot};
use super::abi::PropertyAttributes;

// =========================================================================
// Calling convention helpers
// =========================================================================

/// Run `body` against the environment on its own thread and record the
/// outcome as the last error.
///
/// # Safety
/// `env` must be null or a live environment.
#[inline]
pub(crate) unsafe fn napi_call(
    env: napi_env,
    body: impl FnOnce(&mut RawEnv) -> Result<(), Status>,
) -> napi_status {
    if let Err(status) = unsafe { owner_check(env) } {
        return status.as_raw();
    }
    let Some(raw) = (unsafe { RawEnv::from_raw(env) }) else {
        return Status::InvalidArg.as_raw();
    };
    let outcome = body(raw);
    raw.record(outcome)
}

/// Reject null environments and calls from a foreign thread without
/// touching the environment's mutable state.
///
/// # Safety
/// `env` must be null or a live environment.
#[inline]
unsafe fn owner_check(env: napi_env) -> Result<(), Status> {
    let Some(raw) = (unsafe { RawEnv::from_raw_ref(env) }) else {
        return Err(Status::InvalidArg);
    };
    raw.check_thread()
}

/// Like [`napi_call`], but refuses to start while an exception is pending.
///
/// # Safety
/// `env` must be null or a live environment.
#[inline]
pub(crate) unsafe fn napi_call_preamble(
    env: napi_env,
    body: impl FnOnce(&mut RawEnv) -> Result<(), Status>,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            if raw.is_exception_pending() {
                return Err(Status::PendingException);
            }
            body(raw)
        })
    }
}

/// For entry points that may run native callbacks. `body` gets the raw
/// handle and must re-borrow the environment after every callback.
///
/// # Safety
/// `env` must be null or a live environment.
pub(crate) unsafe fn napi_call_reentrant(
    env: napi_env,
    body: impl FnOnce(napi_env) -> Result<(), Status>,
) -> napi_status {
    if let Err(status) = unsafe { owner_check(env) } {
        return status.as_raw();
    }
    let Some(raw) = (unsafe { RawEnv::from_raw(env) }) else {
        return Status::InvalidArg.as_raw();
    };
    if raw.is_exception_pending() {
        return raw.record(Err(Status::PendingException));
    }
    let outcome = body(env);
    match unsafe { RawEnv::from_raw(env) } {
        Some(raw) => raw.record(outcome),
        None => Status::InvalidArg.as_raw(),
    }
}

/// # Safety
/// `env` must be null or a live environment, and no other borrow of it may
/// be used afterwards.
#[inline]
pub(crate) unsafe fn env_mut<'a>(env: napi_env) -> Result<&'a mut RawEnv, Status> {
    unsafe { RawEnv::from_raw(env) }.ok_or(Status::InvalidArg)
}

/// # Safety
/// `ptr` must be null or valid for writes.
#[inline]
pub(crate) unsafe fn out<'a, T>(ptr: *mut T) -> Result<&'a mut T, Status> {
    unsafe { ptr.as_mut() }.ok_or(Status::InvalidArg)
}

/// Read a UTF-8 string given as pointer plus length, or NUL-terminated when
/// `len` is `NAPI_AUTO_LENGTH`.
///
/// # Safety
/// `ptr` must be null or valid for `len` bytes (or up to its NUL).
pub(crate) unsafe fn read_str(ptr: *const c_char, len: usize) -> Result<String, Status> {
    if ptr.is_null() {
        return if len == 0 { Ok(String::new()) } else { Err(Status::InvalidArg) };
    }
    let bytes = if len == NAPI_AUTO_LENGTH {
        unsafe { CStr::from_ptr(ptr) }.to_bytes()
    } else {
        unsafe { std::slice::from_raw_parts(ptr as *const u8, len) }
    };
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| Status::InvalidArg)
}

pub(crate) fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".into()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".into() } else { "-Infinity".into() }
    } else if n == 0.0 {
        "0".into()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{:.0}", n)
    } else {
        format!("{}", n)
    }
}

fn to_int32(n: f64) -> i32 {
    if n.is_finite() {
        n.trunc().rem_euclid(4_294_967_296.0) as u32 as i32
    } else {
        0
    }
}

fn to_uint32(n: f64) -> u32 {
    if n.is_finite() {
        n.trunc().rem_euclid(4_294_967_296.0) as u32
    } else {
        0
    }
}

fn to_int64(n: f64) -> i64 {
    if n.is_finite() { n as i64 } else { 0 }
}

fn truthy(value: &HeapValue) -> bool {
    match value {
        HeapValue::Undefined | HeapValue::Null => false,
        HeapValue::Boolean(b) => *b,
        HeapValue::Number(n) => *n != 0.0 && !n.is_nan(),
        HeapValue::String(s) => !s.is_empty(),
        HeapValue::Symbol(_) | HeapValue::Object(_) => true,
    }
}

fn to_number(value: &HeapValue) -> Option<f64> {
    match value {
        HeapValue::Undefined => Some(f64::NAN),
        HeapValue::Null => Some(0.0),
        HeapValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
        HeapValue::Number(n) => Some(*n),
        HeapValue::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                Some(0.0)
            } else {
                Some(s.parse::<f64>().unwrap_or(f64::NAN))
            }
        }
        HeapValue::Symbol(_) => None,
        HeapValue::Object(_) => Some(f64::NAN),
    }
}

/// `None` for symbols, which have no implicit string form.
pub(crate) fn to_js_string(raw: &RawEnv, id: HeapId) -> Option<String> {
    to_js_string_depth(raw, id, 0)
}

fn to_js_string_depth(raw: &RawEnv, id: HeapId, depth: usize) -> Option<String> {
    Some(match raw.heap.get(id)? {
        HeapValue::Undefined => "undefined".into(),
        HeapValue::Null => "null".into(),
        HeapValue::Boolean(b) => b.to_string(),
        HeapValue::Number(n) => number_to_string(*n),
        HeapValue::String(s) => s.clone(),
        HeapValue::Symbol(_) => return None,
        HeapValue::Object(obj) => match &obj.kind {
            ObjectKind::Array(elements) if depth < 8 => elements
                .iter()
                .map(|e| match e.and_then(|e| raw.heap.get(e)) {
                    None | Some(HeapValue::Undefined) | Some(HeapValue::Null) => String::new(),
                    Some(_) => e
                        .and_then(|e| to_js_string_depth(raw, e, depth + 1))
                        .unwrap_or_default(),
                })
                .collect::<Vec<_>>()
                .join(","),
            ObjectKind::Array(_) => String::new(),
            ObjectKind::Function { name, .. } => format!("function {}() {{ [native code] }}", name),
            ObjectKind::Error => {
                let message = raw.describe(id);
                if message.is_empty() { "Error".into() } else { format!("Error: {}", message) }
            }
            ObjectKind::Object | ObjectKind::External(_) => "[object Object]".into(),
        },
    })
}

// =========================================================================
// Singletons and primitives
// =========================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_undefined(env: napi_env, result: *mut napi_value) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            *out(result)? = raw.push_handle(raw.singletons.undefined);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_null(env: napi_env, result: *mut napi_value) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            *out(result)? = raw.push_handle(raw.singletons.null);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_global(env: napi_env, result: *mut napi_value) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            *out(result)? = raw.push_handle(raw.singletons.global);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_boolean(env: napi_env, value: bool, result: *mut napi_value) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let id = raw.boolean(value);
            *out(result)? = raw.push_handle(id);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_double(env: napi_env, value: f64, result: *mut napi_value) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            *result = raw.alloc(HeapValue::Number(value));
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_int32(env: napi_env, value: i32, result: *mut napi_value) -> napi_status {
    unsafe { napi_create_double(env, value as f64, result) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_uint32(env: napi_env, value: u32, result: *mut napi_value) -> napi_status {
    unsafe { napi_create_double(env, value as f64, result) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_int64(env: napi_env, value: i64, result: *mut napi_value) -> napi_status {
    unsafe { napi_create_double(env, value as f64, result) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_string_utf8(
    env: napi_env,
    str: *const c_char,
    length: usize,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let s = read_str(str, length)?;
            *result = raw.alloc(HeapValue::String(s));
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_symbol(
    env: napi_env,
    description: napi_value,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let description = if description.is_null() {
                None
            } else {
                match raw.value(description)? {
                    HeapValue::String(s) => Some(s.clone()),
                    _ => return Err(Status::StringExpected),
                }
            };
            *result = raw.alloc(HeapValue::Symbol(description));
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_typeof(env: napi_env, value: napi_value, result: *mut napi_valuetype) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            *result = raw.value(value)?.value_type().as_raw();
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_value_double(env: napi_env, value: napi_value, result: *mut f64) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            match raw.value(value)? {
                HeapValue::Number(n) => *result = *n,
                _ => return Err(Status::NumberExpected),
            }
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_value_int32(env: napi_env, value: napi_value, result: *mut i32) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            match raw.value(value)? {
                HeapValue::Number(n) => *result = to_int32(*n),
                _ => return Err(Status::NumberExpected),
            }
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_value_uint32(env: napi_env, value: napi_value, result: *mut u32) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            match raw.value(value)? {
                HeapValue::Number(n) => *result = to_uint32(*n),
                _ => return Err(Status::NumberExpected),
            }
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_value_int64(env: napi_env, value: napi_value, result: *mut i64) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            match raw.value(value)? {
                HeapValue::Number(n) => *result = to_int64(*n),
                _ => return Err(Status::NumberExpected),
            }
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_value_bool(env: napi_env, value: napi_value, result: *mut bool) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            match raw.value(value)? {
                HeapValue::Boolean(b) => *result = *b,
                _ => return Err(Status::BooleanExpected),
            }
            Ok(())
        })
    }
}

/// With a null `buf`, reports the byte length through `result`. Otherwise
/// copies as much as fits (whole characters only) and NUL-terminates.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_value_string_utf8(
    env: napi_env,
    value: napi_value,
    buf: *mut c_char,
    bufsize: usize,
    result: *mut usize,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let HeapValue::String(s) = raw.value(value)? else {
                return Err(Status::StringExpected);
            };
            if buf.is_null() {
                *out(result)? = s.len();
                return Ok(());
            }
            let mut n = s.len().min(bufsize.saturating_sub(1));
            while !s.is_char_boundary(n) {
                n -= 1;
            }
            if bufsize > 0 {
                std::ptr::copy_nonoverlapping(s.as_ptr(), buf as *mut u8, n);
                *buf.add(n) = 0;
            }
            if let Some(result) = result.as_mut() {
                *result = n;
            }
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_coerce_to_bool(env: napi_env, value: napi_value, result: *mut napi_value) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let b = truthy(raw.value(value)?);
            let id = raw.boolean(b);
            *result = raw.push_handle(id);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_coerce_to_number(
    env: napi_env,
    value: napi_value,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let n = to_number(raw.value(value)?).ok_or(Status::NumberExpected)?;
            *result = raw.alloc(HeapValue::Number(n));
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_coerce_to_string(
    env: napi_env,
    value: napi_value,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let id = raw.resolve(value)?;
            let s = to_js_string(raw, id).ok_or(Status::StringExpected)?;
            *result = raw.alloc(HeapValue::String(s));
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_strict_equals(
    env: napi_env,
    lhs: napi_value,
    rhs: napi_value,
    result: *mut bool,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let (a, b) = (raw.resolve(lhs)?, raw.resolve(rhs)?);
            *result = match (raw.heap.get(a), raw.heap.get(b)) {
                (Some(HeapValue::Number(x)), Some(HeapValue::Number(y))) => x == y,
                (Some(HeapValue::String(x)), Some(HeapValue::String(y))) => x == y,
                (Some(HeapValue::Boolean(x)), Some(HeapValue::Boolean(y))) => x == y,
                (Some(HeapValue::Undefined), Some(HeapValue::Undefined))
                | (Some(HeapValue::Null), Some(HeapValue::Null)) => true,
                _ => a == b,
            };
            Ok(())
        })
    }
}

// =========================================================================
// Errors and exceptions
// =========================================================================

fn make_error(raw: &mut RawEnv, code: napi_value, msg: napi_value, name: Option<&str>) -> Result<HeapId, Status> {
    let HeapValue::String(message) = raw.value(msg)? else {
        return Err(Status::StringExpected);
    };
    let message = message.clone();
    let code = if code.is_null() {
        None
    } else {
        match raw.value(code)? {
            HeapValue::String(code) => Some(code.clone()),
            _ => return Err(Status::StringExpected),
        }
    };
    let error = raw.new_error(&message, code.as_deref());
    if let Some(name) = name {
        set_error_name(raw, error, name);
    }
    Ok(error)
}

fn set_error_name(raw: &mut RawEnv, error: HeapId, name: &str) {
    let name = raw.heap.alloc(HeapValue::String(name.into()));
    if let Some(obj) = raw.heap.object_mut(error) {
        obj.insert(
            PropertyKey::String("name".into()),
            Property {
                slot: PropertySlot::Data(name),
                attributes: PropertyAttributes::WRITABLE | PropertyAttributes::CONFIGURABLE,
            },
        );
    }
}

unsafe fn create_error_of(
    env: napi_env,
    code: napi_value,
    msg: napi_value,
    result: *mut napi_value,
    name: Option<&str>,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let error = make_error(raw, code, msg, name)?;
            *result = raw.push_handle(error);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_error(
    env: napi_env,
    code: napi_value,
    msg: napi_value,
    result: *mut napi_value,
) -> napi_status {
    unsafe { create_error_of(env, code, msg, result, None) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_type_error(
    env: napi_env,
    code: napi_value,
    msg: napi_value,
    result: *mut napi_value,
) -> napi_status {
    unsafe { create_error_of(env, code, msg, result, Some("TypeError")) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_range_error(
    env: napi_env,
    code: napi_value,
    msg: napi_value,
    result: *mut napi_value,
) -> napi_status {
    unsafe { create_error_of(env, code, msg, result, Some("RangeError")) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_throw(env: napi_env, error: napi_value) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let error = raw.resolve(error)?;
            raw.throw(error);
            Ok(())
        })
    }
}

unsafe fn throw_error_of(env: napi_env, code: *const c_char, msg: *const c_char, name: Option<&str>) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            if msg.is_null() {
                return Err(Status::InvalidArg);
            }
            let message = read_str(msg, NAPI_AUTO_LENGTH)?;
            let code = if code.is_null() {
                None
            } else {
                Some(read_str(code, NAPI_AUTO_LENGTH)?)
            };
            let error = raw.new_error(&message, code.as_deref());
            if let Some(name) = name {
                set_error_name(raw, error, name);
            }
            raw.throw(error);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_throw_error(env: napi_env, code: *const c_char, msg: *const c_char) -> napi_status {
    unsafe { throw_error_of(env, code, msg, None) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_throw_type_error(env: napi_env, code: *const c_char, msg: *const c_char) -> napi_status {
    unsafe { throw_error_of(env, code, msg, Some("TypeError")) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_throw_range_error(env: napi_env, code: *const c_char, msg: *const c_char) -> napi_status {
    unsafe { throw_error_of(env, code, msg, Some("RangeError")) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_is_error(env: napi_env, value: napi_value, result: *mut bool) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            *result = matches!(
                raw.value(value)?,
                HeapValue::Object(obj) if matches!(obj.kind, ObjectKind::Error)
            );
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_is_exception_pending(env: napi_env, result: *mut bool) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            *out(result)? = raw.is_exception_pending();
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_and_clear_last_exception(env: napi_env, result: *mut napi_value) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let error = raw.take_exception().unwrap_or(raw.singletons.undefined);
            *result = raw.push_handle(error);
            Ok(())
        })
    }
}

/// Reads the last error without overwriting it.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_last_error_info(
    env: napi_env,
    result: *mut *const napi_extended_error_info,
) -> napi_status {
    if let Err(status) = unsafe { owner_check(env) } {
        return status.as_raw();
    }
    let Some(raw) = (unsafe { RawEnv::from_raw(env) }) else {
        return Status::InvalidArg.as_raw();
    };
    match unsafe { result.as_mut() } {
        Some(result) => {
            *result = raw.last_error() as *const napi_extended_error_info;
            Status::Ok.as_raw()
        }
        None => raw.record(Err(Status::InvalidArg)),
    }
}

/// Log and abort. Never returns.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_fatal_error(
    location: *const c_char,
    location_len: usize,
    message: *const c_char,
    message_len: usize,
) -> ! {
    let location = unsafe { read_str(location, location_len) }.unwrap_or_default();
    let message = unsafe { read_str(message, message_len) }.unwrap_or_default();
    tracing::error!(%location, %message, "FATAL ERROR");
    eprintln!("FATAL ERROR: {} {}", location, message);
    std::process::abort()
}

// =========================================================================
// Handle scopes
// =========================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_open_handle_scope(env: napi_env, result: *mut napi_handle_scope) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            *result = raw.open_scope(false) as *mut napi_handle_scope__;
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_close_handle_scope(env: napi_env, scope: napi_handle_scope) -> napi_status {
    unsafe { napi_call(env, |raw| raw.close_scope(scope as usize, false)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_open_escapable_handle_scope(
    env: napi_env,
    result: *mut napi_escapable_handle_scope,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            *result = raw.open_scope(true) as *mut napi_escapable_handle_scope__;
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_close_escapable_handle_scope(
    env: napi_env,
    scope: napi_escapable_handle_scope,
) -> napi_status {
    unsafe { napi_call(env, |raw| raw.close_scope(scope as usize, true)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_escape_handle(
    env: napi_env,
    scope: napi_escapable_handle_scope,
    escapee: napi_value,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            *result = raw.escape(scope as usize, escapee)?;
            Ok(())
        })
    }
}

// =========================================================================
// References
// =========================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_reference(
    env: napi_env,
    value: napi_value,
    initial_refcount: u32,
    result: *mut napi_ref,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let target = raw.resolve(value)?;
            let id = raw.create_reference(target, initial_refcount);
            tracing::trace!(reference = id, initial_refcount, "reference created");
            *result = id as *mut napi_ref__;
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_delete_reference(env: napi_env, reference: napi_ref) -> napi_status {
    unsafe { napi_call(env, |raw| raw.delete_reference(reference as usize)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_reference_ref(env: napi_env, reference: napi_ref, result: *mut u32) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let count = raw.reference_ref(reference as usize)?;
            if let Some(result) = result.as_mut() {
                *result = count;
            }
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_reference_unref(env: napi_env, reference: napi_ref, result: *mut u32) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let count = raw.reference_unref(reference as usize)?;
            if let Some(result) = result.as_mut() {
                *result = count;
            }
            Ok(())
        })
    }
}

/// Writes null when the target has been collected.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_reference_value(
    env: napi_env,
    reference: napi_ref,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            *result = match raw.reference_target(reference as usize)? {
                Some(id) => raw.push_handle(id),
                None => std::ptr::null_mut(),
            };
            Ok(())
        })
    }
}

// =========================================================================
// Environment
// =========================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_add_env_cleanup_hook(
    env: napi_env,
    fun: napi_cleanup_hook,
    arg: *mut c_void,
) -> napi_status {
    unsafe { napi_call(env, |raw| raw.add_cleanup_hook(fun, arg)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_remove_env_cleanup_hook(
    env: napi_env,
    fun: napi_cleanup_hook,
    arg: *mut c_void,
) -> napi_status {
    unsafe { napi_call(env, |raw| raw.remove_cleanup_hook(fun, arg)) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_version(env: napi_env, result: *mut u32) -> napi_status {
    unsafe {
        napi_call(env, |_raw| {
            *out(result)? = NAPI_VERSION;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::r#async::{Runtime, RuntimeConfig, SendEnv};
    use std::ptr;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig {
            worker_threads: 1,
            gc_threshold: 1024,
        })
        .unwrap()
    }

    #[test]
    fn test_number_to_string() {
        assert_eq!(number_to_string(42.0), "42");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(1.5), "1.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_int32_wraps_like_js() {
        assert_eq!(to_int32(4_294_967_297.0), 1);
        assert_eq!(to_int32(-1.5), -1);
        assert_eq!(to_int32(f64::NAN), 0);
        assert_eq!(to_uint32(-1.0), u32::MAX);
    }

    #[test]
    fn test_null_env_is_invalid_arg() {
        let mut v = ptr::null_mut();
        assert_eq!(unsafe { napi_get_undefined(ptr::null_mut(), &mut v) }, Status::InvalidArg.as_raw());
    }

    #[test]
    fn test_string_round_trip_truncates_on_char_boundary() {
        let rt = runtime();
        let env = rt.create_env();
        let e = env.raw();
        unsafe {
            let mut v = ptr::null_mut();
            assert_eq!(napi_create_string_utf8(e, c"h\u{e9}llo".as_ptr(), NAPI_AUTO_LENGTH, &mut v), 0);

            let mut len = 0usize;
            assert_eq!(napi_get_value_string_utf8(e, v, ptr::null_mut(), 0, &mut len), 0);
            assert_eq!(len, 6);

            // Room for 'h' and half of 'é': only 'h' fits.
            let mut buf = [0 as c_char; 3];
            assert_eq!(napi_get_value_string_utf8(e, v, buf.as_mut_ptr(), buf.len(), &mut len), 0);
            assert_eq!(len, 1);
            assert_eq!(CStr::from_ptr(buf.as_ptr()).to_str().unwrap(), "h");
        }
    }

    #[test]
    fn test_type_mismatch_is_recorded_as_last_error() {
        let rt = runtime();
        let env = rt.create_env();
        let e = env.raw();
        unsafe {
            let mut v = ptr::null_mut();
            napi_create_double(e, 1.0, &mut v);
            let mut b = false;
            assert_eq!(napi_get_value_bool(e, v, &mut b), Status::BooleanExpected.as_raw());

            let mut info = ptr::null();
            assert_eq!(napi_get_last_error_info(e, &mut info), 0);
            assert_eq!((*info).error_code, Status::BooleanExpected.as_raw());
        }
    }

    #[test]
    fn test_foreign_thread_call_leaves_owner_state_alone() {
        let rt = runtime();
        let env = rt.create_env();
        let e = env.raw();
        unsafe {
            let mut v = ptr::null_mut();
            napi_create_double(e, 1.0, &mut v);
            let mut b = false;
            assert_eq!(napi_get_value_bool(e, v, &mut b), Status::BooleanExpected.as_raw());
        }

        let foreign = SendEnv(e);
        let status = std::thread::spawn(move || {
            let foreign = foreign;
            let mut v = ptr::null_mut();
            unsafe { napi_get_undefined(foreign.0, &mut v) }
        })
        .join()
        .unwrap();
        assert_eq!(status, Status::GenericFailure.as_raw());

        unsafe {
            let mut info = ptr::null();
            assert_eq!(napi_get_last_error_info(e, &mut info), 0);
            assert_eq!((*info).error_code, Status::BooleanExpected.as_raw());
        }
    }

    #[test]
    fn test_throw_and_clear() {
        let rt = runtime();
        let env = rt.create_env();
        let e = env.raw();
        unsafe {
            assert_eq!(napi_throw_type_error(e, c"E_CODE".as_ptr(), c"bad".as_ptr()), 0);
            let mut pending = false;
            napi_is_exception_pending(e, &mut pending);
            assert!(pending);

            let mut err = ptr::null_mut();
            assert_eq!(napi_get_and_clear_last_exception(e, &mut err), 0);
            let mut is_error = false;
            napi_is_error(e, err, &mut is_error);
            assert!(is_error);

            napi_is_exception_pending(e, &mut pending);
            assert!(!pending);
        }
    }

    #[test]
    fn test_escapable_scope_through_the_surface() {
        let rt = runtime();
        let env = rt.create_env();
        let e = env.raw();
        unsafe {
            let mut outer = ptr::null_mut();
            let mut inner = ptr::null_mut();
            assert_eq!(napi_open_handle_scope(e, &mut outer), 0);
            assert_eq!(napi_open_escapable_handle_scope(e, &mut inner), 0);

            // Out of order close leaves both open.
            assert_eq!(napi_close_handle_scope(e, outer), Status::HandleScopeMismatch.as_raw());

            let mut v = ptr::null_mut();
            napi_create_int32(e, 7, &mut v);
            let mut escaped = ptr::null_mut();
            assert_eq!(napi_escape_handle(e, inner, v, &mut escaped), 0);
            assert_eq!(napi_escape_handle(e, inner, v, &mut escaped), Status::EscapeCalledTwice.as_raw());
            assert_eq!(napi_close_escapable_handle_scope(e, inner), 0);

            let mut n = 0;
            assert_eq!(napi_get_value_int32(e, escaped, &mut n), 0);
            assert_eq!(n, 7);
            assert_eq!(napi_close_handle_scope(e, outer), 0);
        }
    }

    #[test]
    fn test_get_version() {
        let rt = runtime();
        let env = rt.create_env();
        let mut version = 0;
        assert_eq!(unsafe { napi_get_version(env.raw(), &mut version) }, 0);
        assert_eq!(version, 8);
    }
}
