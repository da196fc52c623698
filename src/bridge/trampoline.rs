//! Fixed native entry points
//!
//! One `extern "C"` function per callback shape. None of them captures
//! anything: the only per-registration state is the pointer the runtime hands
//! back in the callback's data slot, which points at a [`CallbackData`]
//! tag. Each trampoline checks the tag's kind, resolves the id through the
//! registry and runs the handler.
//!
//! Nothing unwinds out of here. Handler errors and panics on the synchronous
//! paths become a thrown error and a null return; on the loop-driven paths
//! they are thrown so the runtime reports them as uncaught.

use std::any::Any;
use std::ffi::c_void;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;

use crate::error::{Error, Result, Status};
use crate::runtime::sys::{napi_callback_info, napi_env, napi_status, napi_value};

use super::env::{CallInfo, Env, Value, fatal_error};
use super::registry::{Callback, CallbackData, CallbackKind, Handler, Registration, Registry};

/// Execute and complete share the single data slot of an async work item.
#[repr(C)]
#[derive(Debug)]
pub(crate) struct WorkSlot {
    pub execute: *const CallbackData,
    pub complete: *const CallbackData,
}

const LOCATION: &str = "napi_bridge::trampoline";

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("handler panicked")
    }
}

/// Read the tag behind `data` and find its handler.
///
/// A tag of the wrong kind means a pointer was handed to the wrong
/// trampoline; that is fatal.
///
/// # Safety
/// `data` must be null or point at a live `CallbackData`.
unsafe fn resolve(data: *const c_void, expected: CallbackKind) -> Option<Handler> {
    let tag = unsafe { (data as *const CallbackData).as_ref() }?;
    if tag.kind != expected {
        tracing::error!(expected = ?expected, found = ?tag.kind, id = tag.id, "callback kind mismatch");
        fatal_error(LOCATION, "callback data kind does not match trampoline");
    }
    let handler = Registry::global().lookup(tag.id);
    if handler.is_none() {
        tracing::warn!(id = tag.id, kind = ?expected, "callback fired after its handler was released");
    }
    handler
}

/// Leave `err` as the pending exception unless one is already set.
fn throw(env: Env, err: &Error) {
    if err.status == Status::PendingException || env.is_exception_pending().unwrap_or(true) {
        return;
    }
    if let Err(failed) = env.throw_error(&err.reason, Some(&err.status.to_string())) {
        tracing::error!(%failed, original = %err, "could not throw handler error");
    }
}

fn settle(env: Env, outcome: std::thread::Result<Result<Value>>) -> napi_value {
    match outcome {
        Ok(Ok(value)) => value.raw(),
        Ok(Err(err)) => {
            tracing::debug!(%err, "handler returned an error");
            throw(env, &err);
            ptr::null_mut()
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(%message, "handler panicked");
            throw(env, &Error::from_reason(message));
            ptr::null_mut()
        }
    }
}

/// Shared body of the four `(env, info) -> value` trampolines.
///
/// # Safety
/// Must only be called by the runtime with a live `env` and `info`.
unsafe fn dispatch(
    env: napi_env,
    info: napi_callback_info,
    expected: CallbackKind,
    select: impl FnOnce(Handler) -> Option<Callback>,
) -> napi_value {
    let env = unsafe { Env::from_raw(env) };
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let call = unsafe { CallInfo::from_raw(env, info) }?;
        tracing::trace!(kind = ?expected, argc = call.len(), "dispatch");
        let handler = unsafe { resolve(call.data(), expected) }
            .ok_or_else(|| Error::from_reason("callback is no longer registered"))?;
        let callback =
            select(handler).ok_or_else(|| Error::from_reason(format!("no {expected:?} handler for this slot")))?;
        callback(&call)
    }));
    settle(env, outcome)
}

// ============================================================================
// Synchronous callbacks
// ============================================================================

pub(crate) unsafe extern "C" fn call_trampoline(env: napi_env, info: napi_callback_info) -> napi_value {
    unsafe {
        dispatch(env, info, CallbackKind::Method, |handler| match handler {
            Handler::Method(f) => Some(f),
            _ => None,
        })
    }
}

pub(crate) unsafe extern "C" fn getter_trampoline(env: napi_env, info: napi_callback_info) -> napi_value {
    unsafe {
        dispatch(env, info, CallbackKind::Accessor, |handler| match handler {
            Handler::Accessor { getter, .. } => getter,
            _ => None,
        })
    }
}

pub(crate) unsafe extern "C" fn setter_trampoline(env: napi_env, info: napi_callback_info) -> napi_value {
    unsafe {
        dispatch(env, info, CallbackKind::Accessor, |handler| match handler {
            Handler::Accessor { setter, .. } => setter,
            _ => None,
        })
    }
}

pub(crate) unsafe extern "C" fn constructor_trampoline(env: napi_env, info: napi_callback_info) -> napi_value {
    unsafe {
        dispatch(env, info, CallbackKind::Constructor, |handler| match handler {
            Handler::Constructor(f) => Some(f),
            _ => None,
        })
    }
}

// ============================================================================
// Async work
// ============================================================================

/// Runs on a pool thread; must not touch the environment.
pub(crate) unsafe extern "C" fn execute_trampoline(_env: napi_env, data: *mut c_void) {
    let Some(slot) = (unsafe { (data as *const WorkSlot).as_ref() }) else {
        return;
    };
    let Some(Handler::Execute(execute)) = (unsafe { resolve(slot.execute.cast(), CallbackKind::Execute) }) else {
        return;
    };
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| execute())) {
        tracing::error!(message = %panic_message(payload.as_ref()), "execute handler panicked");
    }
}

pub(crate) unsafe extern "C" fn complete_trampoline(env: napi_env, status: napi_status, data: *mut c_void) {
    let Some(slot) = (unsafe { (data as *const WorkSlot).as_ref() }) else {
        return;
    };
    let Some(Handler::Complete(complete)) = (unsafe { resolve(slot.complete.cast(), CallbackKind::Complete) })
    else {
        return;
    };
    let env = unsafe { Env::from_raw(env) };
    let status = Status::from_raw(status);
    let outcome = catch_unwind(AssertUnwindSafe(|| complete(env, status).and_then(|()| env.get_undefined())));
    settle(env, outcome);
}

// ============================================================================
// Finalizers and cleanup hooks
// ============================================================================

/// Consume the one-shot finalize registration at `registration` and run it.
///
/// # Safety
/// `registration` must come from `Registration::into_raw` of a `Finalize`
/// handler and not be consumed yet.
unsafe fn finalize_once(env: napi_env, registration: *mut c_void, data: *mut c_void) {
    if registration.is_null() {
        return;
    }
    let handler = unsafe { resolve(registration, CallbackKind::Finalize) };
    let registration = unsafe { Registration::from_raw(registration) };
    if let Some(Handler::Finalize(finalize)) = handler {
        let env = unsafe { Env::from_raw(env) };
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| finalize(env, data))) {
            tracing::error!(message = %panic_message(payload.as_ref()), "finalizer panicked");
        }
    }
    tracing::trace!(id = registration.id(), "finalizer released");
}

/// Registration travels in the hint slot.
pub(crate) unsafe extern "C" fn finalize_trampoline(env: napi_env, data: *mut c_void, hint: *mut c_void) {
    unsafe { finalize_once(env, hint, data) }
}

/// Thread-safe functions pass `(finalize_data, context)`; the registration
/// travels in `finalize_data`.
pub(crate) unsafe extern "C" fn threadsafe_finalize_trampoline(
    env: napi_env,
    finalize_data: *mut c_void,
    context: *mut c_void,
) {
    unsafe { finalize_once(env, finalize_data, context) }
}

/// Finalizer for values that own a `Box<T>` directly.
pub(crate) unsafe extern "C" fn drop_boxed<T>(_env: napi_env, data: *mut c_void, _hint: *mut c_void) {
    if !data.is_null() {
        drop(unsafe { Box::from_raw(data as *mut T) });
    }
}

pub(crate) unsafe extern "C" fn cleanup_trampoline(arg: *mut c_void) {
    if arg.is_null() {
        return;
    }
    let handler = unsafe { resolve(arg, CallbackKind::Cleanup) };
    let _registration = unsafe { Registration::from_raw(arg) };
    if let Some(Handler::Cleanup(hook)) = handler {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook())) {
            tracing::error!(message = %panic_message(payload.as_ref()), "cleanup hook panicked");
        }
    }
}

// ============================================================================
// Thread-safe calls
// ============================================================================

/// Delivery of one queued item. A null `env` means the function was aborted
/// and the item is only being released.
pub(crate) unsafe extern "C" fn threadsafe_call_trampoline(
    env: napi_env,
    js_callback: napi_value,
    context: *mut c_void,
    data: *mut c_void,
) {
    let Some(Handler::ThreadsafeCall(call)) = (unsafe { resolve(context, CallbackKind::ThreadsafeCall) }) else {
        return;
    };
    if env.is_null() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| call(None, data))) {
            tracing::error!(message = %panic_message(payload.as_ref()), "discarding a queued call panicked");
        }
        return;
    }
    let env = unsafe { Env::from_raw(env) };
    let callback = (!js_callback.is_null()).then(|| unsafe { Value::from_raw(env, js_callback) });
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        call(Some((env, callback)), data).and_then(|()| env.get_undefined())
    }));
    settle(env, outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_panic_message_extracts_str_and_string() {
        let payload = catch_unwind(|| panic!("plain")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "plain");
        let payload = catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "formatted 7");
    }

    #[test]
    fn test_resolve_null_and_released_ids() {
        assert!(unsafe { resolve(ptr::null(), CallbackKind::Method) }.is_none());

        let registration = Registration::new(Handler::Cleanup(Arc::new(|| {})));
        let tag = CallbackData {
            kind: CallbackKind::Cleanup,
            id: registration.id(),
        };
        let ptr = &tag as *const CallbackData as *const c_void;
        assert!(matches!(
            unsafe { resolve(ptr, CallbackKind::Cleanup) },
            Some(Handler::Cleanup(_))
        ));
        drop(registration);
        assert!(unsafe { resolve(ptr, CallbackKind::Cleanup) }.is_none());
    }

    #[test]
    fn test_cleanup_trampoline_consumes_registration() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = hits.clone();
        let registration = Registration::new(Handler::Cleanup(Arc::new(move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        })));
        let id = registration.id();
        let arg = registration.into_raw();
        unsafe { cleanup_trampoline(arg) };
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!Registry::global().contains(id));
    }

    #[test]
    fn test_drop_boxed_runs_destructor() {
        struct Flag(Arc<std::sync::atomic::AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }
        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let data = Box::into_raw(Box::new(Flag(dropped.clone())));
        unsafe { drop_boxed::<Flag>(ptr::null_mut(), data.cast(), ptr::null_mut()) };
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }
}
