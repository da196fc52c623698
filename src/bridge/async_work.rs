//! Two-phase async work
//!
//! `execute` runs on a pool thread and produces a `Result<T>`; `complete`
//! runs on the runtime thread and receives it. The complete phase always
//! fires exactly once per queued or cancelled item, with
//! `Err(Cancelled)` if the item never ran and an error if `execute`
//! panicked.
//!
//! The work must outlive its complete callback: `delete` fails until then,
//! and dropping an item that is still in flight leaks its handlers instead
//! of freeing them under the loop.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result, Status};
use crate::runtime::sys::{self, napi_async_work};

use super::env::Env;
use super::registry::{CallbackData, Handler, Registration};
use super::trampoline::{self, WorkSlot};

/// Keeps the native data slot and both handlers alive until deletion.
#[allow(dead_code)]
struct WorkGuard {
    slot: Box<WorkSlot>,
    execute: Registration,
    complete: Registration,
}

pub struct AsyncWork<T> {
    env: Env,
    raw: napi_async_work,
    name: String,
    guard: Option<WorkGuard>,
    _output: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> AsyncWork<T> {
    pub fn create<E, C>(env: Env, name: &str, execute: E, complete: C) -> Result<Self>
    where
        E: FnOnce() -> Result<T> + Send + 'static,
        C: FnOnce(Env, Result<T>) -> Result<()> + Send + 'static,
    {
        let output: Arc<Mutex<Option<Result<T>>>> = Arc::new(Mutex::new(None));

        let execute = {
            let output = output.clone();
            let execute = Mutex::new(Some(execute));
            Registration::new(Handler::Execute(Arc::new(move || {
                let Some(execute) = execute.lock().take() else {
                    return;
                };
                let result = execute();
                *output.lock() = Some(result);
            })))
        };

        let complete = {
            let complete = Mutex::new(Some(complete));
            Registration::new(Handler::Complete(Arc::new(move |env: Env, status: Status| {
                let Some(complete) = complete.lock().take() else {
                    return Ok(());
                };
                let result = match status {
                    Status::Ok => output
                        .lock()
                        .take()
                        .unwrap_or_else(|| Err(Error::from_reason("execute phase did not finish"))),
                    other => Err(Error::from_status(other)),
                };
                complete(env, result)
            })))
        };

        let slot = Box::new(WorkSlot {
            execute: execute.as_ptr() as *const CallbackData,
            complete: complete.as_ptr() as *const CallbackData,
        });
        let resource_name = env.create_string(name)?;
        let mut raw = std::ptr::null_mut();
        env.check(unsafe {
            sys::napi_create_async_work(
                env.raw(),
                std::ptr::null_mut(),
                resource_name.raw(),
                Some(trampoline::execute_trampoline),
                Some(trampoline::complete_trampoline),
                &*slot as *const WorkSlot as *mut std::ffi::c_void,
                &mut raw,
            )
        })?;
        tracing::debug!(work = name, "async work created");

        Ok(Self {
            env,
            raw,
            name: name.to_owned(),
            guard: Some(WorkGuard {
                slot,
                execute,
                complete,
            }),
            _output: PhantomData,
        })
    }
}

impl<T> AsyncWork<T> {
    pub fn raw(&self) -> napi_async_work {
        self.raw
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn live(&self) -> Result<()> {
        if self.guard.is_none() {
            return Err(Error::new(Status::InvalidArg, format!("async work {} already deleted", self.name)));
        }
        Ok(())
    }

    /// Hand the item to the worker pool. Only valid once, while pending.
    pub fn queue(&self) -> Result<()> {
        self.live()?;
        self.env.check(unsafe { sys::napi_queue_async_work(self.env.raw(), self.raw) })
    }

    /// Cancel before the execute phase starts. Fails with `GenericFailure`
    /// once it is running or done; the complete phase still fires.
    pub fn cancel(&self) -> Result<()> {
        self.live()?;
        self.env.check(unsafe { sys::napi_cancel_async_work(self.env.raw(), self.raw) })
    }

    /// Free the item. Fails with `GenericFailure` while the complete phase is
    /// still owed.
    pub fn delete(&mut self) -> Result<()> {
        self.live()?;
        self.env.check(unsafe { sys::napi_delete_async_work(self.env.raw(), self.raw) })?;
        self.guard = None;
        tracing::debug!(work = %self.name, "async work deleted");
        Ok(())
    }
}

impl<T> Drop for AsyncWork<T> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        let status = unsafe { sys::napi_delete_async_work(self.env.raw(), self.raw) };
        if Status::from_raw(status) == Status::Ok {
            drop(guard);
        } else {
            tracing::warn!(work = %self.name, "async work dropped while in flight; leaking its handlers");
            std::mem::forget(guard);
        }
    }
}

impl<T> std::fmt::Debug for AsyncWork<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncWork")
            .field("name", &self.name)
            .field("deleted", &self.guard.is_none())
            .finish()
    }
}
