//! Thread-safe functions
//!
//! A typed handle over the runtime's bounded call queue. Any thread may
//! `call` with a `T`; the value is boxed, queued, and handed to the
//! registered `call_js` closure on the runtime thread in FIFO order. After an
//! abort, queued values are dropped without running `call_js`.

use std::ffi::c_void;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::check_status;
use crate::error::{Error, Result, Status};
use crate::runtime::r#async::ThreadsafeFunction as HostFunction;
use crate::runtime::sys::{self, napi_threadsafe_function};

use super::env::{Env, Value};
use super::registry::{self, Handler, Registration};
use super::trampoline;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallMode {
    NonBlocking,
    /// Wait for queue space instead of failing with `QueueFull`.
    Blocking,
}

impl CallMode {
    fn as_raw(self) -> sys::napi_threadsafe_function_call_mode {
        match self {
            CallMode::NonBlocking => sys::napi_tsfn_nonblocking,
            CallMode::Blocking => sys::napi_tsfn_blocking,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseMode {
    Release,
    /// Close immediately; later calls from any thread fail with `Closing`.
    Abort,
}

impl ReleaseMode {
    fn as_raw(self) -> sys::napi_threadsafe_function_release_mode {
        match self {
            ReleaseMode::Release => sys::napi_tsfn_release,
            ReleaseMode::Abort => sys::napi_tsfn_abort,
        }
    }
}

/// Each handle holds its own strong count on the host object, so calls from
/// other threads stay valid (and fail with `Closing`) after the environment
/// is gone.
pub struct ThreadsafeFunction<T> {
    raw: napi_threadsafe_function,
    _item: PhantomData<fn(T)>,
}

// The runtime side is a mutex-guarded queue; call/acquire/release are legal
// from any thread.
unsafe impl<T> Send for ThreadsafeFunction<T> {}
unsafe impl<T> Sync for ThreadsafeFunction<T> {}

impl<T> Clone for ThreadsafeFunction<T> {
    fn clone(&self) -> Self {
        unsafe { HostFunction::retain_raw(self.raw) };
        Self {
            raw: self.raw,
            _item: PhantomData,
        }
    }
}

impl<T> Drop for ThreadsafeFunction<T> {
    fn drop(&mut self) {
        unsafe { HostFunction::release_raw(self.raw) };
    }
}

impl<T> std::fmt::Debug for ThreadsafeFunction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ThreadsafeFunction({:p})", self.raw)
    }
}

impl<T: Send + 'static> ThreadsafeFunction<T> {
    /// `max_queue_size` 0 means unbounded. `func`, if given, is passed to
    /// `call_js` on every delivery.
    pub fn create<F>(
        env: Env,
        func: Option<Value>,
        name: &str,
        max_queue_size: usize,
        initial_thread_count: usize,
        call_js: F,
    ) -> Result<Self>
    where
        F: Fn(Env, Option<Value>, T) -> Result<()> + Send + Sync + 'static,
    {
        Self::create_with_finalizer(env, func, name, max_queue_size, initial_thread_count, call_js, |_| {})
    }

    /// As [`ThreadsafeFunction::create`], running `finalize` on the runtime
    /// thread once the function has closed and drained.
    pub fn create_with_finalizer<F, D>(
        env: Env,
        func: Option<Value>,
        name: &str,
        max_queue_size: usize,
        initial_thread_count: usize,
        call_js: F,
        finalize: D,
    ) -> Result<Self>
    where
        F: Fn(Env, Option<Value>, T) -> Result<()> + Send + Sync + 'static,
        D: FnOnce(Env) + Send + 'static,
    {
        let deliver = move |delivery: Option<(Env, Option<Value>)>, data: *mut c_void| {
            if data.is_null() {
                return Ok(());
            }
            let item = unsafe { Box::from_raw(data as *mut T) };
            match delivery {
                Some((env, callback)) => call_js(env, callback, *item),
                None => Ok(()),
            }
        };
        let call = Registration::new(Handler::ThreadsafeCall(Arc::new(deliver)));
        let context = call.as_ptr();

        let tsfn_name = name.to_owned();
        let finalize = registry::once(move |env: Env| {
            finalize(env);
            drop(call);
            tracing::debug!(tsfn = %tsfn_name, "thread-safe function released");
        });
        let finalize_data =
            Registration::new(Handler::Finalize(Arc::new(move |env: Env, _context: *mut c_void| finalize(env))))
                .into_raw();

        let resource_name = env.create_string(name)?;
        let mut raw = std::ptr::null_mut();
        let status = unsafe {
            sys::napi_create_threadsafe_function(
                env.raw(),
                func.map_or(std::ptr::null_mut(), |f| f.raw()),
                std::ptr::null_mut(),
                resource_name.raw(),
                max_queue_size,
                initial_thread_count,
                finalize_data,
                Some(trampoline::threadsafe_finalize_trampoline),
                context,
                Some(trampoline::threadsafe_call_trampoline),
                &mut raw,
            )
        };
        if let Err(err) = env.check(status) {
            drop(unsafe { Registration::from_raw(finalize_data) });
            return Err(err);
        }
        unsafe { HostFunction::retain_raw(raw) };
        Ok(Self {
            raw,
            _item: PhantomData,
        })
    }

    /// Queue `value` for delivery on the runtime thread. On failure the value
    /// is dropped.
    pub fn call(&self, value: T, mode: CallMode) -> Result<()> {
        let data = Box::into_raw(Box::new(value));
        let status = unsafe { sys::napi_call_threadsafe_function(self.raw, data.cast(), mode.as_raw()) };
        if status != sys::napi_ok {
            drop(unsafe { Box::from_raw(data) });
        }
        check_status!(status);
        Ok(())
    }
}

impl<T> ThreadsafeFunction<T> {
    pub fn raw(&self) -> napi_threadsafe_function {
        self.raw
    }

    /// Register one more user thread.
    pub fn acquire(&self) -> Result<()> {
        check_status!(unsafe { sys::napi_acquire_threadsafe_function(self.raw) });
        Ok(())
    }

    pub fn release(&self, mode: ReleaseMode) -> Result<()> {
        check_status!(
            unsafe { sys::napi_release_threadsafe_function(self.raw, mode.as_raw()) },
            "releasing thread-safe function with {:?}",
            mode
        );
        Ok(())
    }

    pub fn abort(&self) -> Result<()> {
        self.release(ReleaseMode::Abort)
    }

    /// The opaque context pointer the runtime passes back on delivery.
    pub fn context(&self) -> Result<*mut c_void> {
        let mut context = std::ptr::null_mut();
        check_status!(unsafe { sys::napi_get_threadsafe_function_context(self.raw, &mut context) });
        if context.is_null() {
            return Err(Error::from_status(Status::InvalidArg));
        }
        Ok(context)
    }

    /// Keep the event loop alive while this function is open (the default).
    pub fn reference(&self, env: Env) -> Result<()> {
        env.check(unsafe { sys::napi_ref_threadsafe_function(env.raw(), self.raw) })
    }

    /// Let the event loop exit even while this function is open.
    pub fn unref(&self, env: Env) -> Result<()> {
        env.check(unsafe { sys::napi_unref_threadsafe_function(env.raw(), self.raw) })
    }
}
