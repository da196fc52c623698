use std::io;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;

use crate::error::Status;
use crate::runtime::abi::{napi_addon_register_func, napi_env, napi_value};
use crate::runtime::env::{self, RawEnv, report_uncaught};
use crate::runtime::heap::ObjectKind;

use super::work_stealing::WorkStealingPool;
use super::LoopMessage;

// ============================================================================
// Configuration
// ============================================================================

const DEFAULT_GC_THRESHOLD: usize = 4096;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Worker threads for async work execute phases.
    pub worker_threads: usize,
    /// Live heap slots above which a loop turn triggers a collection.
    pub gc_threshold: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            gc_threshold: DEFAULT_GC_THRESHOLD,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overridden by `NAPI_BRIDGE_WORKERS` / `NAPI_BRIDGE_GC_THRESHOLD`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(workers) = read_var("NAPI_BRIDGE_WORKERS") {
            config.worker_threads = workers;
        }
        if let Some(threshold) = read_var("NAPI_BRIDGE_GC_THRESHOLD") {
            config.gc_threshold = threshold;
        }
        config
    }
}

fn read_var(name: &str) -> Option<usize> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(value) if value > 0 => Some(value),
        _ => {
            tracing::warn!(var = name, value = %raw, "ignoring invalid configuration value");
            None
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Owns the worker pool shared by every environment it creates.
pub struct Runtime {
    config: RuntimeConfig,
    pool: Arc<WorkStealingPool>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> io::Result<Self> {
        let pool = Arc::new(WorkStealingPool::new(config.worker_threads)?);
        tracing::info!(workers = pool.num_workers(), gc_threshold = config.gc_threshold, "runtime started");
        Ok(Self { config, pool })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn num_workers(&self) -> usize {
        self.pool.num_workers()
    }

    /// Create an environment bound to the calling thread.
    pub fn create_env(&self) -> OwnedEnv {
        let raw = RawEnv::new(self.pool.clone(), self.config.gc_threshold);
        OwnedEnv {
            raw: NonNull::from(Box::leak(raw)),
        }
    }
}

// ============================================================================
// Owned environment and its event loop
// ============================================================================

/// An environment plus the loop that drives its completions.
///
/// Not `Send`: everything except the thread-safe function entry points must
/// stay on the creating thread.
pub struct OwnedEnv {
    raw: NonNull<RawEnv>,
}

impl OwnedEnv {
    pub fn raw(&self) -> napi_env {
        self.raw.as_ptr().cast()
    }

    #[allow(clippy::mut_from_ref)]
    fn state(&self) -> &mut RawEnv {
        // SAFETY: the environment lives until drop and is only touched from
        // this thread; no other borrow is held across these calls.
        unsafe { &mut *self.raw.as_ptr() }
    }

    /// Call a module entry point with a fresh exports object.
    ///
    /// Returns the exports value (or whatever the entry point returned instead)
    /// rooted for the lifetime of the environment.
    pub fn load_module(&self, init: napi_addon_register_func) -> Result<napi_value, Status> {
        let init = init.ok_or(Status::InvalidArg)?;
        let env = self.raw();
        let raw = self.state();
        let exports = raw.heap.alloc_object(ObjectKind::Object);
        let exports_handle = raw.push_handle(exports);

        let frame = raw.open_callback_frame();
        let returned = unsafe { init(env, exports_handle) };
        let raw = self.state();
        let result = if returned.is_null() {
            exports
        } else {
            raw.resolve(returned).unwrap_or(exports)
        };
        raw.close_callback_frame(frame);
        if let Some(error) = raw.take_exception() {
            let message = raw.describe(error);
            tracing::warn!(%message, "module initialization threw");
            raw.uncaught.push(message);
            return Err(Status::PendingException);
        }
        tracing::debug!("module loaded");
        Ok(raw.push_handle(result))
    }

    /// Handle one loop message, waiting at most `timeout`. Returns whether one
    /// was handled.
    pub fn tick(&self, timeout: Duration) -> bool {
        let rx = self.state().event_loop.receiver();
        match rx.recv_timeout(timeout) {
            Ok(message) => {
                unsafe { dispatch(self.raw(), message) };
                self.maybe_collect();
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Handle every message that is already waiting. Returns how many.
    pub fn pump(&self) -> usize {
        let rx = self.state().event_loop.receiver();
        let mut handled = 0;
        while let Ok(message) = rx.try_recv() {
            unsafe { dispatch(self.raw(), message) };
            handled += 1;
        }
        if handled > 0 {
            self.maybe_collect();
        }
        handled
    }

    /// Run until no async work is owed and no referenced thread-safe function
    /// is open.
    pub fn run_loop(&self) {
        while self.state().event_loop.is_alive() {
            self.tick(Duration::from_millis(50));
        }
        self.pump();
    }

    /// Like [`OwnedEnv::run_loop`] but gives up at `timeout`. Returns whether
    /// the loop drained.
    pub fn run_loop_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.state().event_loop.is_alive() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.tick((deadline - now).min(Duration::from_millis(50)));
        }
        self.pump();
        true
    }

    pub fn collect_garbage(&self) {
        unsafe { env::collect_garbage(self.raw()) };
    }

    fn maybe_collect(&self) {
        if self.state().should_collect() {
            self.collect_garbage();
        }
    }

    /// Messages of exceptions that reached the loop uncaught.
    pub fn take_uncaught(&self) -> Vec<String> {
        std::mem::take(&mut self.state().uncaught)
    }

    pub fn scope_depth(&self) -> usize {
        self.state().scope_depth()
    }

    fn teardown(&self) {
        let env = self.raw();

        // Work already handed to the pool still owes a complete callback.
        while self.state().event_loop.active_work > 0 {
            if !self.tick(Duration::from_secs(5)) {
                tracing::warn!(
                    owed = self.state().event_loop.active_work,
                    "async work still running at teardown"
                );
                break;
            }
        }
        self.pump();

        let open: Vec<_> = self
            .state()
            .event_loop
            .threadsafe
            .iter()
            .filter(|tsfn| !tsfn.is_finalized())
            .cloned()
            .collect();
        for tsfn in open {
            tsfn.force_abort();
            unsafe { tsfn.drain(env) };
        }

        let finalizers = self.state().heap.drain_finalizers();
        unsafe { env::run_finalizers(env, finalizers) };

        // Last: hooks may release data that the callbacks above still reach.
        for (hook, arg) in self.state().take_cleanup_hooks() {
            unsafe { hook(arg) };
        }
        report_uncaught(self.state(), "teardown");
        tracing::debug!("environment torn down");
    }
}

impl Drop for OwnedEnv {
    fn drop(&mut self) {
        self.teardown();
        // SAFETY: allocated by `Box::leak` in `create_env`; nothing else frees it.
        drop(unsafe { Box::from_raw(self.raw.as_ptr()) });
    }
}

/// # Safety
/// `env` must be a live environment on its own thread.
unsafe fn dispatch(env: napi_env, message: LoopMessage) {
    match message {
        LoopMessage::WorkDone(work) => {
            unsafe { work.deliver(env) };
            if let Some(raw) = unsafe { RawEnv::from_raw(env) } {
                raw.event_loop.active_work = raw.event_loop.active_work.saturating_sub(1);
            }
        }
        LoopMessage::Threadsafe(tsfn) => unsafe { tsfn.drain(env) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.worker_threads >= 1);
        assert_eq!(config.gc_threshold, DEFAULT_GC_THRESHOLD);
    }

    #[test]
    fn test_fresh_env_loop_is_idle() {
        let runtime = Runtime::new(RuntimeConfig {
            worker_threads: 1,
            gc_threshold: 64,
        })
        .unwrap();
        let env = runtime.create_env();
        assert!(env.run_loop_for(Duration::from_millis(10)));
        assert_eq!(env.pump(), 0);
        assert_eq!(env.scope_depth(), 1);
    }

    #[test]
    fn test_load_module_without_entry_point_is_invalid() {
        let runtime = Runtime::new(RuntimeConfig::default()).unwrap();
        let env = runtime.create_env();
        assert_eq!(env.load_module(None), Err(Status::InvalidArg));
    }
}
