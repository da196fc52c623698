//! Off-thread machinery of the runtime
//!
//! - `work_stealing` / `worker`: the pool that runs async-work execute phases
//! - `work`: the async work state machine (Pending -> Running -> Completed,
//!   or Pending -> Cancelled)
//! - `threadsafe`: bounded call queues reachable from any thread
//! - `runtime_impl`: `Runtime`, owned environments and the event loop driver
//!
//! Producers on other threads never touch the environment. They post a
//! [`LoopMessage`] and the runtime thread, the single consumer, does the rest
//! during its own loop turn.

use std::ffi::c_void;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use super::abi::napi_env;

pub mod runtime_impl;
pub mod threadsafe;
pub mod work;
pub mod work_stealing;
pub mod worker;

pub use runtime_impl::{OwnedEnv, Runtime, RuntimeConfig};
pub use threadsafe::ThreadsafeFunction;
pub use work::{AsyncWork, WORK_CANCELLED, WORK_COMPLETED, WORK_PENDING, WORK_RUNNING};
pub use work_stealing::WorkStealingPool;
pub use worker::{Job, Worker};

/// Raw pointer that is only dereferenced on the thread that owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct SendPtr(pub *mut c_void);

// SAFETY: the pointee is opaque user data; the runtime only passes it back to
// the callbacks that own it.
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

/// Environment pointer carried to worker threads and back.
#[derive(Clone, Copy, Debug)]
#[repr(transparent)]
pub struct SendEnv(pub napi_env);

// SAFETY: worker threads only hand it to execute callbacks, which must not use
// it for value operations; every value operation re-checks the owning thread.
unsafe impl Send for SendEnv {}
unsafe impl Sync for SendEnv {}

pub enum LoopMessage {
    /// An async work item finished executing or was cancelled.
    WorkDone(Arc<AsyncWork>),
    /// A thread-safe function has queued items or changed state.
    Threadsafe(Arc<ThreadsafeFunction>),
}

/// Per-environment loop bookkeeping.
pub struct EventLoop {
    tx: Sender<LoopMessage>,
    rx: Receiver<LoopMessage>,
    /// Queued or cancelled work items whose complete callback is still owed.
    pub(crate) active_work: usize,
    /// Every thread-safe function created on this environment. Kept until
    /// teardown so late callers on other threads still see `Closing`.
    pub(crate) threadsafe: Vec<Arc<ThreadsafeFunction>>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            active_work: 0,
            threadsafe: Vec::new(),
        }
    }

    pub fn sender(&self) -> Sender<LoopMessage> {
        self.tx.clone()
    }

    pub fn receiver(&self) -> Receiver<LoopMessage> {
        self.rx.clone()
    }

    /// The loop keeps running while work is owed or a referenced thread-safe
    /// function is still open.
    pub fn is_alive(&self) -> bool {
        self.active_work > 0
            || self
                .threadsafe
                .iter()
                .any(|tsfn| tsfn.is_refed() && !tsfn.is_finalized())
    }
}
