//! Managed handles over the native surface
//!
//! `Env` and `Value` are thin `Copy` wrappers around `napi_env` and
//! `napi_value`. Every method makes exactly one native call (occasionally
//! two, for length-then-copy reads) and turns a failing status into
//! [`Error`], with the reason taken from the environment's last error info.
//!
//! Neither type may be cached beyond the callback that produced it; use a
//! [`Reference`](super::scope::Reference) to keep a value across calls.

use std::ffi::{CStr, CString, c_void};
use std::fmt;
use std::ptr;

use crate::error::{Error, Result, Status};
use crate::runtime::OwnedEnv;
use crate::runtime::abi::ValueType;
use crate::runtime::sys::{self, napi_callback_info, napi_env, napi_status, napi_value};

use super::property::{Descriptors, Property};
use super::registry::{self, Handler, Registration};
use super::scope::{EscapableHandleScope, HandleScope, Reference};
use super::trampoline;

pub(crate) fn c_string(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::new(Status::InvalidArg, format!("{s:?} contains a NUL byte")))
}

/// Report an unrecoverable invariant violation and abort.
pub fn fatal_error(location: &str, message: &str) -> ! {
    unsafe {
        sys::napi_fatal_error(
            location.as_ptr().cast(),
            location.len(),
            message.as_ptr().cast(),
            message.len(),
        )
    }
}

// ============================================================================
// Env
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Env(napi_env);

// The pointer is only dereferenced by the runtime, which checks the calling
// thread itself; moving the handle between threads is harmless.
unsafe impl Send for Env {}
unsafe impl Sync for Env {}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Env({:p})", self.0)
    }
}

impl Env {
    /// # Safety
    /// `env` must be a live environment handed out by the runtime.
    pub unsafe fn from_raw(env: napi_env) -> Self {
        Env(env)
    }

    /// Handle for an environment owned on this thread.
    ///
    /// # Safety
    /// `Env` is `Copy` and carries no lifetime: the caller must not use the
    /// handle, or any `Value` made through it, after `owned` is dropped.
    pub unsafe fn from_owned(owned: &OwnedEnv) -> Self {
        Env(owned.raw())
    }

    pub fn raw(self) -> napi_env {
        self.0
    }

    /// Turn a native status into a `Result`, attaching the last error message.
    pub fn check(self, code: napi_status) -> Result<()> {
        let status = Status::from_raw(code);
        if status == Status::Ok {
            return Ok(());
        }
        let mut info = ptr::null();
        let reason = unsafe {
            if sys::napi_get_last_error_info(self.0, &mut info) == sys::napi_ok {
                info.as_ref()
                    .filter(|info| !info.error_message.is_null())
                    .map(|info| CStr::from_ptr(info.error_message).to_string_lossy().into_owned())
            } else {
                None
            }
        };
        Err(Error::new(status, reason.unwrap_or_else(|| status.message().to_owned())))
    }

    pub(crate) fn make(self, f: impl FnOnce(*mut napi_value) -> napi_status) -> Result<Value> {
        let mut raw = ptr::null_mut();
        self.check(f(&mut raw))?;
        Ok(Value { env: self, raw })
    }

    // ------------------------------------------------------------------------
    // Primitives
    // ------------------------------------------------------------------------

    pub fn get_undefined(self) -> Result<Value> {
        self.make(|out| unsafe { sys::napi_get_undefined(self.0, out) })
    }

    pub fn get_null(self) -> Result<Value> {
        self.make(|out| unsafe { sys::napi_get_null(self.0, out) })
    }

    pub fn get_global(self) -> Result<Value> {
        self.make(|out| unsafe { sys::napi_get_global(self.0, out) })
    }

    pub fn get_boolean(self, value: bool) -> Result<Value> {
        self.make(|out| unsafe { sys::napi_get_boolean(self.0, value, out) })
    }

    pub fn create_double(self, value: f64) -> Result<Value> {
        self.make(|out| unsafe { sys::napi_create_double(self.0, value, out) })
    }

    pub fn create_int32(self, value: i32) -> Result<Value> {
        self.make(|out| unsafe { sys::napi_create_int32(self.0, value, out) })
    }

    pub fn create_uint32(self, value: u32) -> Result<Value> {
        self.make(|out| unsafe { sys::napi_create_uint32(self.0, value, out) })
    }

    pub fn create_int64(self, value: i64) -> Result<Value> {
        self.make(|out| unsafe { sys::napi_create_int64(self.0, value, out) })
    }

    pub fn create_string(self, value: &str) -> Result<Value> {
        self.make(|out| unsafe { sys::napi_create_string_utf8(self.0, value.as_ptr().cast(), value.len(), out) })
    }

    pub fn create_symbol(self, description: Option<&str>) -> Result<Value> {
        let description = match description {
            Some(d) => self.create_string(d)?.raw,
            None => ptr::null_mut(),
        };
        self.make(|out| unsafe { sys::napi_create_symbol(self.0, description, out) })
    }

    pub fn create_object(self) -> Result<Value> {
        self.make(|out| unsafe { sys::napi_create_object(self.0, out) })
    }

    pub fn create_array(self) -> Result<Value> {
        self.make(|out| unsafe { sys::napi_create_array(self.0, out) })
    }

    pub fn create_array_with_length(self, length: usize) -> Result<Value> {
        self.make(|out| unsafe { sys::napi_create_array_with_length(self.0, length, out) })
    }

    pub fn get_version(self) -> Result<u32> {
        let mut version = 0;
        self.check(unsafe { sys::napi_get_version(self.0, &mut version) })?;
        Ok(version)
    }

    // ------------------------------------------------------------------------
    // Errors and exceptions
    // ------------------------------------------------------------------------

    fn error_parts(self, code: Option<&str>, message: &str) -> Result<(napi_value, napi_value)> {
        let code = match code {
            Some(code) => self.create_string(code)?.raw,
            None => ptr::null_mut(),
        };
        Ok((code, self.create_string(message)?.raw))
    }

    pub fn create_error(self, code: Option<&str>, message: &str) -> Result<Value> {
        let (code, msg) = self.error_parts(code, message)?;
        self.make(|out| unsafe { sys::napi_create_error(self.0, code, msg, out) })
    }

    pub fn create_type_error(self, code: Option<&str>, message: &str) -> Result<Value> {
        let (code, msg) = self.error_parts(code, message)?;
        self.make(|out| unsafe { sys::napi_create_type_error(self.0, code, msg, out) })
    }

    pub fn create_range_error(self, code: Option<&str>, message: &str) -> Result<Value> {
        let (code, msg) = self.error_parts(code, message)?;
        self.make(|out| unsafe { sys::napi_create_range_error(self.0, code, msg, out) })
    }

    pub fn throw(self, error: Value) -> Result<()> {
        self.check(unsafe { sys::napi_throw(self.0, error.raw) })
    }

    pub fn throw_error(self, message: &str, code: Option<&str>) -> Result<()> {
        let message = c_string(message)?;
        let code = code.map(c_string).transpose()?;
        let code_ptr = code.as_ref().map_or(ptr::null(), |c| c.as_ptr());
        self.check(unsafe { sys::napi_throw_error(self.0, code_ptr, message.as_ptr()) })
    }

    pub fn throw_type_error(self, message: &str, code: Option<&str>) -> Result<()> {
        let message = c_string(message)?;
        let code = code.map(c_string).transpose()?;
        let code_ptr = code.as_ref().map_or(ptr::null(), |c| c.as_ptr());
        self.check(unsafe { sys::napi_throw_type_error(self.0, code_ptr, message.as_ptr()) })
    }

    pub fn throw_range_error(self, message: &str, code: Option<&str>) -> Result<()> {
        let message = c_string(message)?;
        let code = code.map(c_string).transpose()?;
        let code_ptr = code.as_ref().map_or(ptr::null(), |c| c.as_ptr());
        self.check(unsafe { sys::napi_throw_range_error(self.0, code_ptr, message.as_ptr()) })
    }

    pub fn is_exception_pending(self) -> Result<bool> {
        let mut pending = false;
        self.check(unsafe { sys::napi_is_exception_pending(self.0, &mut pending) })?;
        Ok(pending)
    }

    /// The pending exception, cleared; `None` if nothing was pending.
    pub fn get_and_clear_last_exception(self) -> Result<Option<Value>> {
        if !self.is_exception_pending()? {
            return Ok(None);
        }
        self.make(|out| unsafe { sys::napi_get_and_clear_last_exception(self.0, out) })
            .map(Some)
    }

    // ------------------------------------------------------------------------
    // Scopes and references
    // ------------------------------------------------------------------------

    pub fn open_handle_scope(self) -> Result<HandleScope> {
        HandleScope::open(self)
    }

    pub fn open_escapable_handle_scope(self) -> Result<EscapableHandleScope> {
        EscapableHandleScope::open(self)
    }

    pub fn create_reference(self, value: Value, initial_count: u32) -> Result<Reference> {
        Reference::new(self, value, initial_count)
    }

    // ------------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------------

    /// A callable value dispatching to `handler`. The registration lives as
    /// long as the function value does.
    pub fn create_function<F>(self, name: &str, handler: F) -> Result<Value>
    where
        F: Fn(&CallInfo) -> Result<Value> + Send + Sync + 'static,
    {
        let registration = Registration::new(Handler::Method(std::sync::Arc::new(handler)));
        let function = self.make(|out| unsafe {
            sys::napi_create_function(
                self.0,
                name.as_ptr().cast(),
                name.len(),
                Some(trampoline::call_trampoline),
                registration.as_ptr(),
                out,
            )
        })?;
        self.add_finalizer(function, move |_env| drop(registration))?;
        Ok(function)
    }

    pub fn call_function(self, recv: Option<Value>, func: Value, args: &[Value]) -> Result<Value> {
        let argv: Vec<napi_value> = args.iter().map(|a| a.raw).collect();
        let recv = recv.map_or(ptr::null_mut(), |r| r.raw);
        self.make(|out| unsafe { sys::napi_call_function(self.0, recv, func.raw, argv.len(), argv.as_ptr(), out) })
    }

    pub fn new_instance(self, constructor: Value, args: &[Value]) -> Result<Value> {
        let argv: Vec<napi_value> = args.iter().map(|a| a.raw).collect();
        self.make(|out| unsafe { sys::napi_new_instance(self.0, constructor.raw, argv.len(), argv.as_ptr(), out) })
    }

    // ------------------------------------------------------------------------
    // Properties and classes
    // ------------------------------------------------------------------------

    /// Install every property in one native call. Their handlers stay
    /// registered until the environment is torn down.
    pub fn define_properties(self, object: Value, properties: &[Property]) -> Result<()> {
        let Descriptors {
            names,
            registrations,
            raw,
        } = Descriptors::build(self, properties)?;
        self.check(unsafe { sys::napi_define_properties(self.0, object.raw, raw.len(), raw.as_ptr()) })?;
        drop(names);
        self.keep_alive(registrations)
    }

    /// Define a constructible class. Static properties go on the constructor,
    /// the rest on its prototype.
    pub fn define_class<F>(self, name: &str, constructor: F, properties: &[Property]) -> Result<Value>
    where
        F: Fn(&CallInfo) -> Result<Value> + Send + Sync + 'static,
    {
        let Descriptors {
            names,
            mut registrations,
            raw,
        } = Descriptors::build(self, properties)?;
        let cons = Registration::new(Handler::Constructor(std::sync::Arc::new(constructor)));
        let class = self.make(|out| unsafe {
            sys::napi_define_class(
                self.0,
                name.as_ptr().cast(),
                name.len(),
                Some(trampoline::constructor_trampoline),
                cons.as_ptr(),
                raw.len(),
                raw.as_ptr(),
                out,
            )
        })?;
        drop(names);
        registrations.push(cons);
        self.keep_alive(registrations)?;
        tracing::debug!(class = name, "class registered");
        Ok(class)
    }

    // ------------------------------------------------------------------------
    // Native data: externals, wrapping, finalizers
    // ------------------------------------------------------------------------

    /// An external value owning `data`; dropped when the value is collected.
    pub fn create_external<T: Send + 'static>(self, data: T) -> Result<Value> {
        let data = Box::into_raw(Box::new(data));
        let result = self.make(|out| unsafe {
            sys::napi_create_external(
                self.0,
                data.cast(),
                Some(trampoline::drop_boxed::<T>),
                ptr::null_mut(),
                out,
            )
        });
        if result.is_err() {
            drop(unsafe { Box::from_raw(data) });
        }
        result
    }

    /// # Safety
    /// `value` must have been created by [`Env::create_external`] with the same `T`.
    pub unsafe fn get_value_external<'a, T>(self, value: Value) -> Result<&'a T> {
        let mut data = ptr::null_mut();
        self.check(unsafe { sys::napi_get_value_external(self.0, value.raw, &mut data) })?;
        unsafe { (data as *const T).as_ref() }.ok_or_else(|| Error::from_status(Status::InvalidArg))
    }

    /// Attach `native` to `object`; it is dropped when the object is collected.
    pub fn wrap<T: Send + 'static>(self, object: Value, native: T) -> Result<()> {
        let native = Box::into_raw(Box::new(native));
        let status = unsafe {
            sys::napi_wrap(
                self.0,
                object.raw,
                native.cast(),
                Some(trampoline::drop_boxed::<T>),
                ptr::null_mut(),
                ptr::null_mut(),
            )
        };
        if let Err(err) = self.check(status) {
            drop(unsafe { Box::from_raw(native) });
            return Err(err);
        }
        Ok(())
    }

    /// # Safety
    /// `object` must have been wrapped by [`Env::wrap`] with the same `T`, and
    /// no other borrow of the native value may be alive.
    pub unsafe fn unwrap<'a, T>(self, object: Value) -> Result<&'a mut T> {
        let mut native = ptr::null_mut();
        self.check(unsafe { sys::napi_unwrap(self.0, object.raw, &mut native) })?;
        unsafe { (native as *mut T).as_mut() }.ok_or_else(|| Error::from_status(Status::InvalidArg))
    }

    /// Detach and return the wrapped value; its finalizer will not run.
    ///
    /// # Safety
    /// As [`Env::unwrap`].
    pub unsafe fn remove_wrap<T>(self, object: Value) -> Result<T> {
        let mut native = ptr::null_mut();
        self.check(unsafe { sys::napi_remove_wrap(self.0, object.raw, &mut native) })?;
        if native.is_null() {
            return Err(Error::from_status(Status::InvalidArg));
        }
        Ok(*unsafe { Box::from_raw(native as *mut T) })
    }

    /// Run `finalize` on the runtime thread once `object` is collected, or at
    /// teardown.
    pub fn add_finalizer<F>(self, object: Value, finalize: F) -> Result<()>
    where
        F: FnOnce(Env) + Send + 'static,
    {
        let finalize = registry::once(finalize);
        let registration = Registration::new(Handler::Finalize(std::sync::Arc::new(move |env: Env, _data: *mut c_void| finalize(env))));
        let hint = registration.into_raw();
        let status = unsafe {
            sys::napi_add_finalizer(
                self.0,
                object.raw,
                ptr::null_mut(),
                Some(trampoline::finalize_trampoline),
                hint,
                ptr::null_mut(),
            )
        };
        if let Err(err) = self.check(status) {
            drop(unsafe { Registration::from_raw(hint) });
            return Err(err);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Cleanup hooks
    // ------------------------------------------------------------------------

    /// Run `hook` when the environment is torn down. Hooks run in reverse
    /// order of registration.
    pub fn add_env_cleanup_hook<F>(self, hook: F) -> Result<CleanupHook>
    where
        F: FnOnce() + Send + 'static,
    {
        let hook = registry::once(move |()| hook());
        let registration = Registration::new(Handler::Cleanup(std::sync::Arc::new(move || hook(()))));
        let arg = registration.into_raw();
        let status = unsafe { sys::napi_add_env_cleanup_hook(self.0, Some(trampoline::cleanup_trampoline), arg) };
        if let Err(err) = self.check(status) {
            drop(unsafe { Registration::from_raw(arg) });
            return Err(err);
        }
        Ok(CleanupHook { arg })
    }

    /// Unregister a hook without running it.
    pub fn remove_env_cleanup_hook(self, hook: CleanupHook) -> Result<()> {
        self.check(unsafe {
            sys::napi_remove_env_cleanup_hook(self.0, Some(trampoline::cleanup_trampoline), hook.arg)
        })?;
        drop(unsafe { Registration::from_raw(hook.arg) });
        Ok(())
    }

    /// Hold `registrations` until teardown.
    pub(crate) fn keep_alive(self, registrations: Vec<Registration>) -> Result<()> {
        if registrations.is_empty() {
            return Ok(());
        }
        self.add_env_cleanup_hook(move || drop(registrations)).map(|_| ())
    }
}

/// Token for [`Env::remove_env_cleanup_hook`].
#[derive(Debug)]
pub struct CleanupHook {
    arg: *mut c_void,
}

// ============================================================================
// Value
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Value {
    env: Env,
    raw: napi_value,
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({:p})", self.raw)
    }
}

impl Value {
    /// # Safety
    /// `raw` must be a live handle of `env`.
    pub unsafe fn from_raw(env: Env, raw: napi_value) -> Self {
        Value { env, raw }
    }

    pub fn raw(self) -> napi_value {
        self.raw
    }

    pub fn env(self) -> Env {
        self.env
    }

    pub fn value_type(self) -> Result<ValueType> {
        let mut kind = 0;
        self.env.check(unsafe { sys::napi_typeof(self.env.0, self.raw, &mut kind) })?;
        ValueType::from_raw(kind).ok_or_else(|| Error::from_reason(format!("unknown value type {kind}")))
    }

    pub fn is_undefined(self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::Undefined)
    }

    pub fn is_null(self) -> Result<bool> {
        Ok(self.value_type()? == ValueType::Null)
    }

    // ------------------------------------------------------------------------
    // Conversions
    // ------------------------------------------------------------------------

    pub fn get_double(self) -> Result<f64> {
        let mut n = 0.0;
        self.env.check(unsafe { sys::napi_get_value_double(self.env.0, self.raw, &mut n) })?;
        Ok(n)
    }

    pub fn get_int32(self) -> Result<i32> {
        let mut n = 0;
        self.env.check(unsafe { sys::napi_get_value_int32(self.env.0, self.raw, &mut n) })?;
        Ok(n)
    }

    pub fn get_uint32(self) -> Result<u32> {
        let mut n = 0;
        self.env.check(unsafe { sys::napi_get_value_uint32(self.env.0, self.raw, &mut n) })?;
        Ok(n)
    }

    pub fn get_int64(self) -> Result<i64> {
        let mut n = 0;
        self.env.check(unsafe { sys::napi_get_value_int64(self.env.0, self.raw, &mut n) })?;
        Ok(n)
    }

    pub fn get_bool(self) -> Result<bool> {
        let mut b = false;
        self.env.check(unsafe { sys::napi_get_value_bool(self.env.0, self.raw, &mut b) })?;
        Ok(b)
    }

    pub fn get_string(self) -> Result<String> {
        let mut len = 0;
        self.env.check(unsafe {
            sys::napi_get_value_string_utf8(self.env.0, self.raw, ptr::null_mut(), 0, &mut len)
        })?;
        let mut buf = vec![0u8; len + 1];
        let mut written = 0;
        self.env.check(unsafe {
            sys::napi_get_value_string_utf8(self.env.0, self.raw, buf.as_mut_ptr().cast(), buf.len(), &mut written)
        })?;
        buf.truncate(written);
        String::from_utf8(buf).map_err(|e| Error::new(Status::StringExpected, e.to_string()))
    }

    pub fn coerce_to_bool(self) -> Result<Value> {
        self.env.make(|out| unsafe { sys::napi_coerce_to_bool(self.env.0, self.raw, out) })
    }

    pub fn coerce_to_number(self) -> Result<Value> {
        self.env.make(|out| unsafe { sys::napi_coerce_to_number(self.env.0, self.raw, out) })
    }

    pub fn coerce_to_string(self) -> Result<Value> {
        self.env.make(|out| unsafe { sys::napi_coerce_to_string(self.env.0, self.raw, out) })
    }

    pub fn strict_equals(self, other: Value) -> Result<bool> {
        let mut equal = false;
        self.env.check(unsafe { sys::napi_strict_equals(self.env.0, self.raw, other.raw, &mut equal) })?;
        Ok(equal)
    }

    pub fn is_error(self) -> Result<bool> {
        let mut b = false;
        self.env.check(unsafe { sys::napi_is_error(self.env.0, self.raw, &mut b) })?;
        Ok(b)
    }

    pub fn is_array(self) -> Result<bool> {
        let mut b = false;
        self.env.check(unsafe { sys::napi_is_array(self.env.0, self.raw, &mut b) })?;
        Ok(b)
    }

    pub fn array_length(self) -> Result<u32> {
        let mut len = 0;
        self.env.check(unsafe { sys::napi_get_array_length(self.env.0, self.raw, &mut len) })?;
        Ok(len)
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    pub fn set_property(self, key: Value, value: Value) -> Result<()> {
        self.env.check(unsafe { sys::napi_set_property(self.env.0, self.raw, key.raw, value.raw) })
    }

    pub fn get_property(self, key: Value) -> Result<Value> {
        self.env.make(|out| unsafe { sys::napi_get_property(self.env.0, self.raw, key.raw, out) })
    }

    pub fn has_property(self, key: Value) -> Result<bool> {
        let mut b = false;
        self.env.check(unsafe { sys::napi_has_property(self.env.0, self.raw, key.raw, &mut b) })?;
        Ok(b)
    }

    pub fn has_own_property(self, key: Value) -> Result<bool> {
        let mut b = false;
        self.env.check(unsafe { sys::napi_has_own_property(self.env.0, self.raw, key.raw, &mut b) })?;
        Ok(b)
    }

    pub fn delete_property(self, key: Value) -> Result<bool> {
        let mut b = false;
        self.env.check(unsafe { sys::napi_delete_property(self.env.0, self.raw, key.raw, &mut b) })?;
        Ok(b)
    }

    pub fn set_named_property(self, name: &str, value: Value) -> Result<()> {
        let name = c_string(name)?;
        self.env.check(unsafe { sys::napi_set_named_property(self.env.0, self.raw, name.as_ptr(), value.raw) })
    }

    pub fn get_named_property(self, name: &str) -> Result<Value> {
        let name = c_string(name)?;
        self.env.make(|out| unsafe { sys::napi_get_named_property(self.env.0, self.raw, name.as_ptr(), out) })
    }

    pub fn has_named_property(self, name: &str) -> Result<bool> {
        let name = c_string(name)?;
        let mut b = false;
        self.env.check(unsafe { sys::napi_has_named_property(self.env.0, self.raw, name.as_ptr(), &mut b) })?;
        Ok(b)
    }

    pub fn set_element(self, index: u32, value: Value) -> Result<()> {
        self.env.check(unsafe { sys::napi_set_element(self.env.0, self.raw, index, value.raw) })
    }

    pub fn get_element(self, index: u32) -> Result<Value> {
        self.env.make(|out| unsafe { sys::napi_get_element(self.env.0, self.raw, index, out) })
    }

    pub fn has_element(self, index: u32) -> Result<bool> {
        let mut b = false;
        self.env.check(unsafe { sys::napi_has_element(self.env.0, self.raw, index, &mut b) })?;
        Ok(b)
    }

    pub fn delete_element(self, index: u32) -> Result<bool> {
        let mut b = false;
        self.env.check(unsafe { sys::napi_delete_element(self.env.0, self.raw, index, &mut b) })?;
        Ok(b)
    }

    /// Enumerable string keys, own and inherited, as an array value.
    pub fn property_names(self) -> Result<Value> {
        self.env.make(|out| unsafe { sys::napi_get_property_names(self.env.0, self.raw, out) })
    }

    pub fn prototype(self) -> Result<Value> {
        self.env.make(|out| unsafe { sys::napi_get_prototype(self.env.0, self.raw, out) })
    }

    pub fn define_properties(self, properties: &[Property]) -> Result<()> {
        self.env.define_properties(self, properties)
    }

    // ------------------------------------------------------------------------
    // Calls
    // ------------------------------------------------------------------------

    pub fn call(self, recv: Option<Value>, args: &[Value]) -> Result<Value> {
        self.env.call_function(recv, self, args)
    }

    pub fn new_instance(self, args: &[Value]) -> Result<Value> {
        self.env.new_instance(self, args)
    }

    pub fn instance_of(self, constructor: Value) -> Result<bool> {
        let mut b = false;
        self.env.check(unsafe { sys::napi_instanceof(self.env.0, self.raw, constructor.raw, &mut b) })?;
        Ok(b)
    }
}

// ============================================================================
// CallInfo
// ============================================================================

/// Arguments of one native callback invocation.
#[derive(Debug)]
pub struct CallInfo {
    env: Env,
    this: Value,
    args: Vec<Value>,
    new_target: Option<Value>,
    data: *mut c_void,
}

impl CallInfo {
    /// # Safety
    /// `info` must belong to the callback currently running on `env`.
    pub(crate) unsafe fn from_raw(env: Env, info: napi_callback_info) -> Result<Self> {
        let mut argc = 0usize;
        let mut this = ptr::null_mut();
        let mut data = ptr::null_mut();
        env.check(unsafe { sys::napi_get_cb_info(env.0, info, &mut argc, ptr::null_mut(), &mut this, &mut data) })?;
        let mut argv = vec![ptr::null_mut(); argc];
        if argc > 0 {
            env.check(unsafe {
                sys::napi_get_cb_info(env.0, info, &mut argc, argv.as_mut_ptr(), ptr::null_mut(), ptr::null_mut())
            })?;
        }
        let mut new_target = ptr::null_mut();
        env.check(unsafe { sys::napi_get_new_target(env.0, info, &mut new_target) })?;
        Ok(CallInfo {
            env,
            this: Value { env, raw: this },
            args: argv.into_iter().map(|raw| Value { env, raw }).collect(),
            new_target: (!new_target.is_null()).then_some(Value { env, raw: new_target }),
            data,
        })
    }

    pub fn env(&self) -> Env {
        self.env
    }

    pub fn this(&self) -> Value {
        self.this
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Argument `index`, or `undefined` when it was not passed.
    pub fn arg(&self, index: usize) -> Result<Value> {
        match self.args.get(index) {
            Some(value) => Ok(*value),
            None => self.env.get_undefined(),
        }
    }

    pub fn new_target(&self) -> Option<Value> {
        self.new_target
    }

    pub fn is_construct_call(&self) -> bool {
        self.new_target.is_some()
    }

    pub(crate) fn data(&self) -> *mut c_void {
        self.data
    }
}
