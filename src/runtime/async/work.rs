//! Host side of async work
//!
//! A work item moves `PENDING -> RUNNING -> COMPLETED` when a pool worker
//! picks it up, or `PENDING -> CANCELLED` when cancelled first. Whichever
//! terminal state it reaches, a `WorkDone` message is posted and the complete
//! callback fires exactly once on the runtime thread.

use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crossbeam_channel::Sender;

use crate::error::Status;
use crate::runtime::abi::{
    napi_async_complete_callback, napi_async_work, napi_async_work__, napi_env, napi_status,
};
use crate::runtime::env::{RawEnv, report_uncaught};
use crate::runtime::stubs::{napi_call, out};

use super::{LoopMessage, SendEnv, SendPtr};

pub const WORK_PENDING: u8 = 0;
pub const WORK_RUNNING: u8 = 1;
pub const WORK_COMPLETED: u8 = 2;
pub const WORK_CANCELLED: u8 = 3;

pub struct AsyncWork {
    env: SendEnv,
    name: String,
    execute: unsafe extern "C" fn(napi_env, *mut c_void),
    complete: napi_async_complete_callback,
    data: SendPtr,
    state: AtomicU8,
    /// Set once by queue or cancel; the item is then owned by the loop until
    /// its complete callback has fired.
    in_flight: AtomicBool,
    complete_fired: AtomicBool,
    loop_tx: Sender<LoopMessage>,
}

impl AsyncWork {
    pub(crate) fn new(
        env: napi_env,
        name: String,
        execute: unsafe extern "C" fn(napi_env, *mut c_void),
        complete: napi_async_complete_callback,
        data: *mut c_void,
        loop_tx: Sender<LoopMessage>,
    ) -> Arc<Self> {
        Arc::new(Self {
            env: SendEnv(env),
            name,
            execute,
            complete,
            data: SendPtr(data),
            state: AtomicU8::new(WORK_PENDING),
            in_flight: AtomicBool::new(false),
            complete_fired: AtomicBool::new(false),
            loop_tx,
        })
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn complete_fired(&self) -> bool {
        self.complete_fired.load(Ordering::Acquire)
    }

    /// Deletable before it was ever queued or cancelled, or after completion.
    pub fn can_delete(&self) -> bool {
        !self.in_flight.load(Ordering::Acquire) || self.complete_fired()
    }

    fn into_raw(self: Arc<Self>) -> napi_async_work {
        Arc::into_raw(self) as *mut napi_async_work__
    }

    /// # Safety
    /// `work` must come from [`AsyncWork::into_raw`] and not be deleted yet.
    unsafe fn borrow_raw(work: napi_async_work) -> Option<Arc<Self>> {
        if work.is_null() {
            return None;
        }
        let ptr = work as *const AsyncWork;
        unsafe {
            Arc::increment_strong_count(ptr);
            Some(Arc::from_raw(ptr))
        }
    }

    /// # Safety
    /// As [`AsyncWork::borrow_raw`]; consumes the handle's own count.
    unsafe fn reclaim_raw(work: napi_async_work) -> Arc<Self> {
        unsafe { Arc::from_raw(work as *const AsyncWork) }
    }

    fn queue(self: &Arc<Self>, pool: &super::WorkStealingPool) -> Result<(), Status> {
        if self.state() != WORK_PENDING || self.in_flight.swap(true, Ordering::AcqRel) {
            tracing::warn!(work = %self.name, "async work queued twice");
            return Err(Status::GenericFailure);
        }
        let work = self.clone();
        pool.submit(Box::new(move || work.run()));
        tracing::debug!(work = %self.name, "async work queued");
        Ok(())
    }

    /// Worker side.
    fn run(self: Arc<Self>) {
        if self
            .state
            .compare_exchange(WORK_PENDING, WORK_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Cancelled while waiting in the pool; cancel already notified the loop.
            return;
        }
        tracing::trace!(work = %self.name, "executing");
        let execute = self.execute;
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
            execute(self.env.0, self.data.0)
        }));
        if outcome.is_err() {
            tracing::error!(work = %self.name, "execute callback unwound");
        }
        self.state.store(WORK_COMPLETED, Ordering::Release);
        let _ = self.loop_tx.send(LoopMessage::WorkDone(self.clone()));
    }

    /// Only a pending item can be cancelled. Returns whether it had been queued.
    fn cancel(self: &Arc<Self>) -> Result<bool, Status> {
        self.state
            .compare_exchange(WORK_PENDING, WORK_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Status::GenericFailure)?;
        let was_queued = self.in_flight.swap(true, Ordering::AcqRel);
        let _ = self.loop_tx.send(LoopMessage::WorkDone(self.clone()));
        tracing::debug!(work = %self.name, was_queued, "async work cancelled");
        Ok(was_queued)
    }

    /// Loop side: fire the complete callback once.
    ///
    /// # Safety
    /// `env` must be the owning environment, on its own thread.
    pub(crate) unsafe fn deliver(&self, env: napi_env) {
        if self.complete_fired() {
            return;
        }
        let status = if self.state() == WORK_CANCELLED {
            Status::Cancelled
        } else {
            Status::Ok
        };
        tracing::trace!(work = %self.name, ?status, "completing");
        if let Some(complete) = self.complete {
            let Some(raw) = (unsafe { RawEnv::from_raw(env) }) else {
                return;
            };
            let frame = raw.open_callback_frame();
            unsafe { complete(env, status.as_raw(), self.data.0) };
            if let Some(raw) = unsafe { RawEnv::from_raw(env) } {
                raw.close_callback_frame(frame);
                report_uncaught(raw, "async complete");
            }
        }
        self.complete_fired.store(true, Ordering::Release);
    }
}

// =========================================================================
// Native surface
// =========================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_async_work(
    env: napi_env,
    _async_resource: crate::runtime::abi::napi_value,
    async_resource_name: crate::runtime::abi::napi_value,
    execute: crate::runtime::abi::napi_async_execute_callback,
    complete: napi_async_complete_callback,
    data: *mut c_void,
    result: *mut napi_async_work,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let execute = execute.ok_or(Status::InvalidArg)?;
            let name = match raw.value(async_resource_name) {
                Ok(crate::runtime::heap::HeapValue::String(s)) => s.clone(),
                _ => String::from("async work"),
            };
            let work = AsyncWork::new(raw.as_raw(), name, execute, complete, data, raw.event_loop.sender());
            tracing::debug!(work = %work.name, "async work created");
            *result = work.into_raw();
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_delete_async_work(env: napi_env, work: napi_async_work) -> napi_status {
    unsafe {
        napi_call(env, |_raw| {
            let handle = AsyncWork::borrow_raw(work).ok_or(Status::InvalidArg)?;
            if !handle.can_delete() {
                tracing::warn!(work = %handle.name, "async work deleted before its complete callback");
                return Err(Status::GenericFailure);
            }
            drop(handle);
            drop(AsyncWork::reclaim_raw(work));
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_queue_async_work(env: napi_env, work: napi_async_work) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let handle = AsyncWork::borrow_raw(work).ok_or(Status::InvalidArg)?;
            handle.queue(&raw.pool)?;
            raw.event_loop.active_work += 1;
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_cancel_async_work(env: napi_env, work: napi_async_work) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let handle = AsyncWork::borrow_raw(work).ok_or(Status::InvalidArg)?;
            if !handle.cancel()? {
                // Never queued, so the loop does not owe it yet.
                raw.event_loop.active_work += 1;
            }
            Ok(())
        })
    }
}

