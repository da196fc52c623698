//! Host side of thread-safe functions
//!
//! A bounded FIFO queue guarded by a mutex, plus the acquire/release count.
//! Producers on any thread push into the queue and post a `Threadsafe`
//! message; the runtime thread drains the queue one item at a time during its
//! loop turn and invokes `call_js` there.
//!
//! Lifecycle: open while the thread count is positive. The last `release`
//! closes it (queued items are still delivered), `release(abort)` closes it
//! and drops whatever is still queued. Once closed and drained the finalizer
//! runs exactly once.

use std::collections::VecDeque;
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};

use crate::error::Status;
use crate::runtime::abi::{
    napi_env, napi_finalize, napi_status, napi_threadsafe_function, napi_threadsafe_function__,
    napi_threadsafe_function_call_js, napi_threadsafe_function_call_mode,
    napi_threadsafe_function_release_mode, napi_tsfn_abort, napi_tsfn_blocking, napi_value,
};
use crate::runtime::env::{RawEnv, invoke_native, report_uncaught};
use crate::runtime::heap::{HeapValue, ObjectKind};
use crate::runtime::stubs::{napi_call, out};

use super::{LoopMessage, SendPtr};

struct QueueState {
    queue: VecDeque<SendPtr>,
    thread_count: usize,
    closing: bool,
    aborted: bool,
    finalized: bool,
}

/// What the loop should do next with a thread-safe function.
pub(crate) enum Next {
    Deliver(SendPtr),
    /// Aborted: hand these back to `call_js` with a null env so they can be freed.
    Discard(Vec<SendPtr>),
    Finalize,
    Idle,
}

pub struct ThreadsafeFunction {
    name: String,
    /// Strong reference id holding the JS function, if one was given.
    callback_ref: Option<usize>,
    call_js: napi_threadsafe_function_call_js,
    context: SendPtr,
    finalize_cb: napi_finalize,
    finalize_data: SendPtr,
    max_queue_size: usize,
    state: Mutex<QueueState>,
    space: Condvar,
    refed: AtomicBool,
    loop_tx: Sender<LoopMessage>,
}

impl ThreadsafeFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> *mut c_void {
        self.context.0
    }

    pub fn is_refed(&self) -> bool {
        self.refed.load(Ordering::Acquire)
    }

    pub fn set_refed(&self, refed: bool) {
        self.refed.store(refed, Ordering::Release);
    }

    pub fn is_finalized(&self) -> bool {
        self.state.lock().finalized
    }

    pub fn is_closing(&self) -> bool {
        self.state.lock().closing
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn notify_loop(self: &Arc<Self>) {
        let _ = self.loop_tx.send(LoopMessage::Threadsafe(self.clone()));
    }

    /// Enqueue `data`. Blocking mode waits for space; non-blocking fails fast.
    pub fn call(self: &Arc<Self>, data: *mut c_void, blocking: bool) -> Result<(), Status> {
        let mut state = self.state.lock();
        loop {
            if state.closing {
                return Err(Status::Closing);
            }
            if self.max_queue_size == 0 || state.queue.len() < self.max_queue_size {
                break;
            }
            if !blocking {
                tracing::trace!(tsfn = %self.name, "queue full");
                return Err(Status::QueueFull);
            }
            self.space.wait(&mut state);
        }
        state.queue.push_back(SendPtr(data));
        drop(state);
        self.notify_loop();
        Ok(())
    }

    pub fn acquire(&self) -> Result<(), Status> {
        let mut state = self.state.lock();
        if state.closing {
            return Err(Status::Closing);
        }
        state.thread_count += 1;
        Ok(())
    }

    pub fn release(self: &Arc<Self>, abort: bool) -> Result<(), Status> {
        let mut state = self.state.lock();
        if state.thread_count == 0 {
            return Err(Status::InvalidArg);
        }
        state.thread_count -= 1;
        if abort {
            state.aborted = true;
            state.closing = true;
        } else if state.thread_count == 0 {
            state.closing = true;
        }
        let closing = state.closing;
        drop(state);
        if closing {
            tracing::debug!(tsfn = %self.name, abort, "thread-safe function closing");
            self.space.notify_all();
            self.notify_loop();
        }
        Ok(())
    }

    /// Close and drop queued items regardless of the thread count.
    pub(crate) fn force_abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        state.closing = true;
        drop(state);
        self.space.notify_all();
    }

    pub(crate) fn next(&self) -> Next {
        let mut state = self.state.lock();
        if state.aborted && !state.queue.is_empty() {
            let dropped = state.queue.drain(..).collect();
            self.space.notify_all();
            return Next::Discard(dropped);
        }
        if let Some(item) = state.queue.pop_front() {
            self.space.notify_one();
            return Next::Deliver(item);
        }
        if state.closing && !state.finalized {
            state.finalized = true;
            return Next::Finalize;
        }
        Next::Idle
    }

    /// Loop side: deliver everything queued, in order, and finalize once closed.
    ///
    /// # Safety
    /// `env` must be the owning environment, on its own thread.
    pub(crate) unsafe fn drain(&self, env: napi_env) {
        loop {
            match self.next() {
                Next::Deliver(item) => unsafe { self.deliver(env, item.0) },
                Next::Discard(items) => {
                    tracing::debug!(tsfn = %self.name, dropped = items.len(), "aborted, dropping queued calls");
                    if let Some(call_js) = self.call_js {
                        for item in items {
                            unsafe { call_js(std::ptr::null_mut(), std::ptr::null_mut(), self.context.0, item.0) };
                        }
                    }
                }
                Next::Finalize => {
                    unsafe { self.finalize(env) };
                    return;
                }
                Next::Idle => return,
            }
        }
    }

    unsafe fn deliver(&self, env: napi_env, data: *mut c_void) {
        let Some(raw) = (unsafe { RawEnv::from_raw(env) }) else {
            return;
        };
        let frame = raw.open_callback_frame();
        let target = self
            .callback_ref
            .and_then(|r| raw.reference_target(r).ok().flatten());
        tracing::trace!(tsfn = %self.name, "delivering call");
        match self.call_js {
            Some(call_js) => {
                let callback = target.map_or(std::ptr::null_mut(), |id| raw.push_handle(id));
                unsafe { call_js(env, callback, self.context.0, data) };
            }
            None => {
                // No call_js: invoke the function with no arguments.
                let native = target.and_then(|id| match &raw.heap.object(id)?.kind {
                    ObjectKind::Function { native, .. } => Some(*native),
                    _ => None,
                });
                if let Some(native) = native {
                    let this = raw.singletons.undefined;
                    let _ = unsafe { invoke_native(env, native, this, &[], None) };
                }
            }
        }
        if let Some(raw) = unsafe { RawEnv::from_raw(env) } {
            raw.close_callback_frame(frame);
            report_uncaught(raw, "thread-safe call");
        }
    }

    unsafe fn finalize(&self, env: napi_env) {
        tracing::debug!(tsfn = %self.name, "thread-safe function finalized");
        if let Some(finalize_cb) = self.finalize_cb {
            let Some(raw) = (unsafe { RawEnv::from_raw(env) }) else {
                return;
            };
            let frame = raw.open_callback_frame();
            unsafe { finalize_cb(env, self.finalize_data.0, self.context.0) };
            if let Some(raw) = unsafe { RawEnv::from_raw(env) } {
                raw.close_callback_frame(frame);
                report_uncaught(raw, "thread-safe finalizer");
            }
        }
        if let (Some(r), Some(raw)) = (self.callback_ref, unsafe { RawEnv::from_raw(env) }) {
            let _ = raw.delete_reference(r);
        }
    }

    fn as_raw(self: &Arc<Self>) -> napi_threadsafe_function {
        Arc::as_ptr(self) as *mut napi_threadsafe_function__
    }

    /// Take a strong count for a handle that may outlive its environment.
    ///
    /// # Safety
    /// `func` must be a live handle from `napi_create_threadsafe_function`.
    pub(crate) unsafe fn retain_raw(func: napi_threadsafe_function) {
        if !func.is_null() {
            unsafe { Arc::increment_strong_count(func as *const ThreadsafeFunction) };
        }
    }

    /// Give back a count taken by [`ThreadsafeFunction::retain_raw`].
    ///
    /// # Safety
    /// Must pair with exactly one earlier `retain_raw` on `func`.
    pub(crate) unsafe fn release_raw(func: napi_threadsafe_function) {
        if !func.is_null() {
            unsafe { Arc::decrement_strong_count(func as *const ThreadsafeFunction) };
        }
    }

    /// # Safety
    /// `func` must come from `napi_create_threadsafe_function` and still be
    /// kept alive by its environment or by a retained handle.
    unsafe fn borrow_raw(func: napi_threadsafe_function) -> Option<Arc<Self>> {
        if func.is_null() {
            return None;
        }
        let ptr = func as *const ThreadsafeFunction;
        unsafe {
            Arc::increment_strong_count(ptr);
            Some(Arc::from_raw(ptr))
        }
    }
}

// =========================================================================
// Native surface
// =========================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_threadsafe_function(
    env: napi_env,
    func: napi_value,
    _async_resource: napi_value,
    async_resource_name: napi_value,
    max_queue_size: usize,
    initial_thread_count: usize,
    thread_finalize_data: *mut c_void,
    thread_finalize_cb: napi_finalize,
    context: *mut c_void,
    call_js_cb: napi_threadsafe_function_call_js,
    result: *mut napi_threadsafe_function,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            if initial_thread_count == 0 {
                return Err(Status::InvalidArg);
            }
            let callback_ref = if func.is_null() {
                if call_js_cb.is_none() {
                    return Err(Status::InvalidArg);
                }
                None
            } else {
                let target = raw.resolve(func)?;
                if !raw.heap.object(target).is_some_and(|obj| obj.is_function()) {
                    return Err(Status::FunctionExpected);
                }
                Some(raw.create_reference(target, 1))
            };
            let name = match raw.value(async_resource_name) {
                Ok(HeapValue::String(s)) => s.clone(),
                _ => String::from("threadsafe function"),
            };
            let tsfn = Arc::new(ThreadsafeFunction {
                name,
                callback_ref,
                call_js: call_js_cb,
                context: SendPtr(context),
                finalize_cb: thread_finalize_cb,
                finalize_data: SendPtr(thread_finalize_data),
                max_queue_size,
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    thread_count: initial_thread_count,
                    closing: false,
                    aborted: false,
                    finalized: false,
                }),
                space: Condvar::new(),
                refed: AtomicBool::new(true),
                loop_tx: raw.event_loop.sender(),
            });
            tracing::debug!(tsfn = %tsfn.name, max_queue_size, initial_thread_count, "thread-safe function created");
            *result = tsfn.as_raw();
            raw.event_loop.threadsafe.push(tsfn);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_threadsafe_function_context(
    func: napi_threadsafe_function,
    result: *mut *mut c_void,
) -> napi_status {
    let (Some(tsfn), Ok(result)) = (unsafe { ThreadsafeFunction::borrow_raw(func) }, unsafe { out(result) }) else {
        return Status::InvalidArg.as_raw();
    };
    *result = tsfn.context();
    Status::Ok.as_raw()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_call_threadsafe_function(
    func: napi_threadsafe_function,
    data: *mut c_void,
    is_blocking: napi_threadsafe_function_call_mode,
) -> napi_status {
    let Some(tsfn) = (unsafe { ThreadsafeFunction::borrow_raw(func) }) else {
        return Status::InvalidArg.as_raw();
    };
    match tsfn.call(data, is_blocking == napi_tsfn_blocking) {
        Ok(()) => Status::Ok.as_raw(),
        Err(status) => status.as_raw(),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_acquire_threadsafe_function(func: napi_threadsafe_function) -> napi_status {
    let Some(tsfn) = (unsafe { ThreadsafeFunction::borrow_raw(func) }) else {
        return Status::InvalidArg.as_raw();
    };
    match tsfn.acquire() {
        Ok(()) => Status::Ok.as_raw(),
        Err(status) => status.as_raw(),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_release_threadsafe_function(
    func: napi_threadsafe_function,
    mode: napi_threadsafe_function_release_mode,
) -> napi_status {
    let Some(tsfn) = (unsafe { ThreadsafeFunction::borrow_raw(func) }) else {
        return Status::InvalidArg.as_raw();
    };
    match tsfn.release(mode == napi_tsfn_abort) {
        Ok(()) => Status::Ok.as_raw(),
        Err(status) => status.as_raw(),
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_ref_threadsafe_function(env: napi_env, func: napi_threadsafe_function) -> napi_status {
    unsafe {
        napi_call(env, |_raw| {
            ThreadsafeFunction::borrow_raw(func)
                .ok_or(Status::InvalidArg)?
                .set_refed(true);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_unref_threadsafe_function(env: napi_env, func: napi_threadsafe_function) -> napi_status {
    unsafe {
        napi_call(env, |_raw| {
            ThreadsafeFunction::borrow_raw(func)
                .ok_or(Status::InvalidArg)?
                .set_refed(false);
            Ok(())
        })
    }
}
