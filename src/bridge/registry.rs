//! Handler registry
//!
//! Native callbacks carry exactly one pointer of user data. Every managed
//! handler is therefore registered here under a fresh `u64` id, and the native
//! data slot gets a pointer to a boxed [`CallbackData`] tagged with the
//! callback kind and that id. Trampolines resolve the id back to the handler
//! on every call.
//!
//! Ids are never reused, so a stale pointer can only miss, never reach a
//! different handler. Lookups take a read lock and clone the handler out;
//! the lock is never held while a handler runs, so handlers may register
//! more handlers.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::error::{Result, Status};

use super::env::{CallInfo, Env, Value};

/// Which trampoline a registration belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CallbackKind {
    Method = 0,
    /// Getter and/or setter sharing one descriptor data slot.
    Accessor = 1,
    Constructor = 2,
    Execute = 3,
    Complete = 4,
    Finalize = 5,
    ThreadsafeCall = 6,
    Cleanup = 7,
}

/// What a native data slot points at.
#[repr(C)]
#[derive(Debug, PartialEq, Eq)]
pub struct CallbackData {
    pub kind: CallbackKind,
    pub id: u64,
}

/// Synchronous JS-facing handler: methods, accessors, constructors.
pub type Callback = Arc<dyn Fn(&CallInfo) -> Result<Value> + Send + Sync>;

/// Async work execute phase; runs on a pool thread without an environment.
pub type ExecuteHandler = Arc<dyn Fn() + Send + Sync>;

/// Async work complete phase, with the raw completion status.
pub type CompleteHandler = Arc<dyn Fn(Env, Status) -> Result<()> + Send + Sync>;

/// Receives the finalized native pointer.
pub type FinalizeHandler = Arc<dyn Fn(Env, *mut c_void) + Send + Sync>;

/// Thread-safe call delivery. `None` when the call is being discarded after an
/// abort, in which case only the payload should be released.
pub type ThreadsafeCallHandler =
    Arc<dyn Fn(Option<(Env, Option<Value>)>, *mut c_void) -> Result<()> + Send + Sync>;

pub type CleanupHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
pub enum Handler {
    Method(Callback),
    Accessor {
        getter: Option<Callback>,
        setter: Option<Callback>,
    },
    Constructor(Callback),
    Execute(ExecuteHandler),
    Complete(CompleteHandler),
    Finalize(FinalizeHandler),
    ThreadsafeCall(ThreadsafeCallHandler),
    Cleanup(CleanupHandler),
}

impl Handler {
    pub fn kind(&self) -> CallbackKind {
        match self {
            Handler::Method(_) => CallbackKind::Method,
            Handler::Accessor { .. } => CallbackKind::Accessor,
            Handler::Constructor(_) => CallbackKind::Constructor,
            Handler::Execute(_) => CallbackKind::Execute,
            Handler::Complete(_) => CallbackKind::Complete,
            Handler::Finalize(_) => CallbackKind::Finalize,
            Handler::ThreadsafeCall(_) => CallbackKind::ThreadsafeCall,
            Handler::Cleanup(_) => CallbackKind::Cleanup,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler::{:?}", self.kind())
    }
}

pub struct Registry {
    entries: RwLock<HashMap<u64, Handler>>,
    next_id: AtomicU64,
}

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

impl Registry {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn global() -> &'static Registry {
        &REGISTRY
    }

    /// Register `handler` under a fresh id. The handler stays reachable until
    /// the returned guard is dropped.
    pub fn register(&'static self, handler: Handler) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = handler.kind();
        self.entries.write().insert(id, handler);
        tracing::debug!(id, ?kind, "handler registered");
        Registration {
            data: Box::new(CallbackData { kind, id }),
            registry: self,
        }
    }

    pub fn lookup(&self, id: u64) -> Option<Handler> {
        self.entries.read().get(&id).cloned()
    }

    fn unregister(&self, id: u64) -> Option<Handler> {
        let removed = self.entries.write().remove(&id);
        if removed.is_some() {
            tracing::debug!(id, "handler unregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.read().contains_key(&id)
    }
}

/// Owner of one registry entry and of the `CallbackData` its native data slot
/// points at. Dropping it unregisters the handler.
pub struct Registration {
    data: Box<CallbackData>,
    registry: &'static Registry,
}

impl Registration {
    pub fn new(handler: Handler) -> Self {
        Registry::global().register(handler)
    }

    pub fn id(&self) -> u64 {
        self.data.id
    }

    pub fn kind(&self) -> CallbackKind {
        self.data.kind
    }

    /// Stable pointer for a native data slot; valid while `self` lives.
    pub fn as_ptr(&self) -> *mut c_void {
        &*self.data as *const CallbackData as *mut c_void
    }

    /// Hand ownership to native code; reclaim it with [`Registration::from_raw`].
    pub fn into_raw(self) -> *mut c_void {
        let this = std::mem::ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the box is moved out exactly once.
        let data = unsafe { std::ptr::read(&this.data) };
        Box::into_raw(data) as *mut c_void
    }

    /// # Safety
    /// `ptr` must come from [`Registration::into_raw`] and not be reclaimed yet.
    pub unsafe fn from_raw(ptr: *mut c_void) -> Self {
        Self {
            data: unsafe { Box::from_raw(ptr as *mut CallbackData) },
            registry: Registry::global(),
        }
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("kind", &self.data.kind)
            .field("id", &self.data.id)
            .finish()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.data.id);
    }
}

/// Wrap a one-shot closure so it fits a `Fn` handler slot. Later calls are
/// no-ops.
pub(crate) fn once<A, F>(f: F) -> impl Fn(A) + Send + Sync + 'static
where
    F: FnOnce(A) + Send + 'static,
{
    let slot = parking_lot::Mutex::new(Some(f));
    move |arg| {
        if let Some(f) = slot.lock().take() {
            f(arg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Barrier, mpsc};
    use std::thread;
    use std::time::Duration;

    fn cleanup(counter: Arc<AtomicUsize>, by: usize) -> Handler {
        Handler::Cleanup(Arc::new(move || {
            counter.fetch_add(by, Ordering::SeqCst);
        }))
    }

    fn run(id: u64) {
        match Registry::global().lookup(id) {
            Some(Handler::Cleanup(f)) => f(),
            other => panic!("unexpected entry {:?}", other),
        }
    }

    #[test]
    fn test_distinct_registrations_dispatch_independently() {
        let counter = Arc::new(AtomicUsize::new(0));
        let a = Registration::new(cleanup(counter.clone(), 1));
        let b = Registration::new(cleanup(counter.clone(), 100));
        assert_ne!(a.id(), b.id());
        assert_ne!(a.as_ptr(), b.as_ptr());

        run(a.id());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        run(b.id());
        assert_eq!(counter.load(Ordering::SeqCst), 101);
        run(a.id());
        assert_eq!(counter.load(Ordering::SeqCst), 102);
    }

    #[test]
    fn test_concurrent_registration_keeps_every_handler() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 50;
        let barrier = Arc::new(Barrier::new(THREADS));
        let (tx, rx) = mpsc::channel();

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let barrier = barrier.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let regs: Vec<_> = (0..PER_THREAD)
                        .map(|i| {
                            let hits = Arc::new(AtomicUsize::new(0));
                            let reg = Registration::new(cleanup(hits.clone(), t * 1000 + i));
                            (reg, hits, t * 1000 + i)
                        })
                        .collect();
                    for (reg, hits, expected) in &regs {
                        run(reg.id());
                        assert_eq!(hits.load(Ordering::SeqCst), *expected);
                    }
                    tx.send(regs.len()).unwrap();
                })
            })
            .collect();
        drop(tx);

        let mut total = 0;
        for _ in 0..THREADS {
            total += rx.recv_timeout(Duration::from_secs(10)).unwrap();
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(total, THREADS * PER_THREAD);
    }

    #[test]
    fn test_drop_unregisters_and_ids_are_not_reused() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = Registration::new(cleanup(counter.clone(), 1));
        let old = first.id();
        drop(first);
        assert!(!Registry::global().contains(old));
        let second = Registration::new(cleanup(counter, 1));
        assert!(second.id() > old);
    }

    #[test]
    fn test_into_raw_round_trip_keeps_entry_alive() {
        let counter = Arc::new(AtomicUsize::new(0));
        let reg = Registration::new(cleanup(counter, 1));
        let id = reg.id();
        let ptr = reg.into_raw();
        assert!(Registry::global().contains(id));

        let data = unsafe { &*(ptr as *const CallbackData) };
        assert_eq!(data.kind, CallbackKind::Cleanup);
        assert_eq!(data.id, id);

        drop(unsafe { Registration::from_raw(ptr) });
        assert!(!Registry::global().contains(id));
    }

    #[test]
    fn test_once_runs_a_single_time() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let f = once(move |n: usize| {
            c.fetch_add(n, Ordering::SeqCst);
        });
        f(5);
        f(5);
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
