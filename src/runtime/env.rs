//! Per-environment runtime state
//!
//! `RawEnv` is what a `napi_env` points at. It owns:
//! - the value heap and the handle table that value handles index into
//! - the LIFO stack of handle scopes (plus internal callback frames)
//! - persistent references and their counts
//! - the pending exception and the last error info
//! - environment cleanup hooks and the event loop state
//!
//! Methods on `RawEnv` never call back into native code. Anything that does
//! (callbacks, finalizers) is a free function taking the raw `napi_env`, so no
//! `&mut RawEnv` is held while managed code re-enters the native surface.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use crate::error::Status;

use super::abi::{
    napi_callback_info, napi_callback_info__, napi_cleanup_hook, napi_env, napi_env__,
    napi_extended_error_info, napi_status, napi_value, napi_value__,
};
use super::heap::{Finalizer, Heap, HeapId, HeapValue, NativeFunction, ObjectKind};
use super::r#async::work_stealing::WorkStealingPool;
use super::r#async::EventLoop;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FrameKind {
    Handle,
    Escapable { slot: usize, escaped: bool },
    /// Opened by the runtime around every native callback; never exposed.
    Callback,
}

#[derive(Clone, Copy, Debug)]
struct ScopeFrame {
    id: usize,
    base: usize,
    kind: FrameKind,
}

#[derive(Clone, Copy, Debug)]
struct Reference {
    target: HeapId,
    count: u32,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Singletons {
    pub undefined: HeapId,
    pub null: HeapId,
    pub true_: HeapId,
    pub false_: HeapId,
    pub global: HeapId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct CleanupHook {
    hook: unsafe extern "C" fn(*mut c_void),
    arg: *mut c_void,
}

/// Target of a `napi_callback_info` handle during one native callback.
pub(crate) struct CallbackFrame {
    pub this: napi_value,
    pub args: Vec<napi_value>,
    pub new_target: napi_value,
    pub data: *mut c_void,
}

impl CallbackFrame {
    /// # Safety
    /// `info` must come from a live callback invocation.
    pub unsafe fn from_raw<'a>(info: napi_callback_info) -> Option<&'a CallbackFrame> {
        unsafe { (info as *const CallbackFrame).as_ref() }
    }
}

pub struct RawEnv {
    pub(crate) heap: Heap,
    handles: Vec<HeapId>,
    scopes: Vec<ScopeFrame>,
    next_scope_id: usize,
    references: HashMap<usize, Reference>,
    next_reference_id: usize,
    pending_exception: Option<HeapId>,
    last_error: napi_extended_error_info,
    cleanup_hooks: Vec<CleanupHook>,
    pub(crate) singletons: Singletons,
    pub(crate) event_loop: EventLoop,
    pub(crate) pool: Arc<WorkStealingPool>,
    pub(crate) gc_threshold: usize,
    /// Messages of exceptions nobody caught (complete and thread-safe callbacks).
    pub(crate) uncaught: Vec<String>,
    thread: ThreadId,
}

impl RawEnv {
    pub(crate) fn new(pool: Arc<WorkStealingPool>, gc_threshold: usize) -> Box<Self> {
        let mut heap = Heap::new();
        let singletons = Singletons {
            undefined: heap.alloc(HeapValue::Undefined),
            null: heap.alloc(HeapValue::Null),
            true_: heap.alloc(HeapValue::Boolean(true)),
            false_: heap.alloc(HeapValue::Boolean(false)),
            global: heap.alloc_object(ObjectKind::Object),
        };
        Box::new(Self {
            heap,
            handles: Vec::new(),
            // Root frame; lives as long as the environment.
            scopes: vec![ScopeFrame {
                id: 0,
                base: 0,
                kind: FrameKind::Handle,
            }],
            next_scope_id: 1,
            references: HashMap::new(),
            next_reference_id: 1,
            pending_exception: None,
            last_error: napi_extended_error_info {
                error_message: std::ptr::null(),
                engine_reserved: std::ptr::null_mut(),
                engine_error_code: 0,
                error_code: Status::Ok.as_raw(),
            },
            cleanup_hooks: Vec::new(),
            singletons,
            event_loop: EventLoop::new(),
            pool,
            gc_threshold,
            uncaught: Vec::new(),
            thread: thread::current().id(),
        })
    }

    /// # Safety
    /// `env` must be null or a pointer produced by [`RawEnv::as_raw`] on a
    /// live environment.
    #[inline]
    pub(crate) unsafe fn from_raw<'a>(env: napi_env) -> Option<&'a mut RawEnv> {
        unsafe { (env as *mut RawEnv).as_mut() }
    }

    /// Shared view, for checks that may run on any thread.
    ///
    /// # Safety
    /// As [`RawEnv::from_raw`].
    #[inline]
    pub(crate) unsafe fn from_raw_ref<'a>(env: napi_env) -> Option<&'a RawEnv> {
        unsafe { (env as *const RawEnv).as_ref() }
    }

    #[inline]
    pub(crate) fn as_raw(&mut self) -> napi_env {
        self as *mut RawEnv as *mut napi_env__
    }

    /// Value and object operations are only legal on the owning thread.
    pub(crate) fn check_thread(&self) -> Result<(), Status> {
        if thread::current().id() == self.thread {
            Ok(())
        } else {
            tracing::warn!("environment used from a foreign thread");
            Err(Status::GenericFailure)
        }
    }

    pub(crate) fn record(&mut self, outcome: Result<(), Status>) -> napi_status {
        let status = match outcome {
            Ok(()) => Status::Ok,
            Err(status) => status,
        };
        self.last_error.error_code = status.as_raw();
        self.last_error.error_message = if status == Status::Ok {
            std::ptr::null()
        } else {
            status.c_message().as_ptr()
        };
        status.as_raw()
    }

    pub(crate) fn clear_last_error(&mut self) {
        self.record(Ok(()));
    }

    pub(crate) fn last_error(&self) -> &napi_extended_error_info {
        &self.last_error
    }

    // =========================================================================
    // Handles
    // =========================================================================

    pub(crate) fn push_handle(&mut self, id: HeapId) -> napi_value {
        self.handles.push(id);
        self.handles.len() as *mut napi_value__
    }

    pub(crate) fn resolve(&self, value: napi_value) -> Result<HeapId, Status> {
        let index = (value as usize).checked_sub(1).ok_or(Status::InvalidArg)?;
        let id = *self.handles.get(index).ok_or(Status::InvalidArg)?;
        if self.heap.is_live(id) {
            Ok(id)
        } else {
            Err(Status::InvalidArg)
        }
    }

    pub(crate) fn value(&self, value: napi_value) -> Result<&HeapValue, Status> {
        let id = self.resolve(value)?;
        self.heap.get(id).ok_or(Status::InvalidArg)
    }

    pub(crate) fn alloc(&mut self, value: HeapValue) -> napi_value {
        let id = self.heap.alloc(value);
        self.push_handle(id)
    }

    pub(crate) fn boolean(&self, value: bool) -> HeapId {
        if value {
            self.singletons.true_
        } else {
            self.singletons.false_
        }
    }

    // =========================================================================
    // Handle scopes
    // =========================================================================

    pub(crate) fn open_scope(&mut self, escapable: bool) -> usize {
        let kind = if escapable {
            // The escape slot belongs to the parent scope.
            let slot = self.handles.len();
            self.handles.push(self.singletons.undefined);
            FrameKind::Escapable {
                slot,
                escaped: false,
            }
        } else {
            FrameKind::Handle
        };
        let id = self.next_scope_id;
        self.next_scope_id += 1;
        self.scopes.push(ScopeFrame {
            id,
            base: self.handles.len(),
            kind,
        });
        tracing::trace!(scope = id, escapable, depth = self.scopes.len(), "scope opened");
        id
    }

    /// Close `id`, which must be the innermost open scope of the given flavour.
    pub(crate) fn close_scope(&mut self, id: usize, escapable: bool) -> Result<(), Status> {
        let top = *self.scopes.last().ok_or(Status::HandleScopeMismatch)?;
        if top.id != id || id == 0 {
            tracing::warn!(scope = id, top = top.id, "handle scope closed out of order");
            return Err(Status::HandleScopeMismatch);
        }
        let top_escapable = matches!(top.kind, FrameKind::Escapable { .. });
        if top.kind == FrameKind::Callback || top_escapable != escapable {
            return Err(Status::InvalidArg);
        }
        self.scopes.pop();
        self.handles.truncate(top.base);
        tracing::trace!(scope = id, depth = self.scopes.len(), "scope closed");
        Ok(())
    }

    pub(crate) fn escape(&mut self, id: usize, value: napi_value) -> Result<napi_value, Status> {
        let target = self.resolve(value)?;
        let frame = self
            .scopes
            .iter_mut()
            .rev()
            .find(|frame| frame.id == id)
            .ok_or(Status::InvalidArg)?;
        match &mut frame.kind {
            FrameKind::Escapable { escaped: true, .. } => Err(Status::EscapeCalledTwice),
            FrameKind::Escapable { slot, escaped } => {
                *escaped = true;
                let slot = *slot;
                self.handles[slot] = target;
                Ok((slot + 1) as *mut napi_value__)
            }
            _ => Err(Status::InvalidArg),
        }
    }

    pub(crate) fn open_callback_frame(&mut self) -> usize {
        let id = self.next_scope_id;
        self.next_scope_id += 1;
        self.scopes.push(ScopeFrame {
            id,
            base: self.handles.len(),
            kind: FrameKind::Callback,
        });
        id
    }

    /// Pop the callback frame `id` and anything a misbehaving callback left
    /// open above it.
    pub(crate) fn close_callback_frame(&mut self, id: usize) {
        let Some(pos) = self.scopes.iter().rposition(|frame| frame.id == id) else {
            return;
        };
        let leaked = self.scopes.len() - pos - 1;
        if leaked > 0 {
            tracing::warn!(leaked, "callback returned with handle scopes still open");
        }
        let base = self.scopes[pos].base;
        self.scopes.truncate(pos);
        self.handles.truncate(base);
    }

    pub(crate) fn scope_depth(&self) -> usize {
        self.scopes.len()
    }

    // =========================================================================
    // References
    // =========================================================================

    pub(crate) fn create_reference(&mut self, target: HeapId, count: u32) -> usize {
        let id = self.next_reference_id;
        self.next_reference_id += 1;
        self.references.insert(id, Reference { target, count });
        id
    }

    /// Ids are never reused, so a second delete of the same id is detected.
    pub(crate) fn delete_reference(&mut self, id: usize) -> Result<(), Status> {
        match self.references.remove(&id) {
            Some(_) => Ok(()),
            None => {
                tracing::warn!(reference = id, "reference deleted twice or never created");
                Err(Status::InvalidArg)
            }
        }
    }

    pub(crate) fn reference_ref(&mut self, id: usize) -> Result<u32, Status> {
        let reference = self.references.get_mut(&id).ok_or(Status::InvalidArg)?;
        reference.count += 1;
        Ok(reference.count)
    }

    /// Unref at zero is rejected and leaves the count at zero.
    pub(crate) fn reference_unref(&mut self, id: usize) -> Result<u32, Status> {
        let reference = self.references.get_mut(&id).ok_or(Status::InvalidArg)?;
        if reference.count == 0 {
            return Err(Status::GenericFailure);
        }
        reference.count -= 1;
        Ok(reference.count)
    }

    /// `None` once a weak target has been collected.
    pub(crate) fn reference_target(&self, id: usize) -> Result<Option<HeapId>, Status> {
        let reference = self.references.get(&id).ok_or(Status::InvalidArg)?;
        Ok(self
            .heap
            .is_live(reference.target)
            .then_some(reference.target))
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    pub(crate) fn throw(&mut self, error: HeapId) {
        self.pending_exception = Some(error);
    }

    pub(crate) fn is_exception_pending(&self) -> bool {
        self.pending_exception.is_some()
    }

    pub(crate) fn take_exception(&mut self) -> Option<HeapId> {
        self.pending_exception.take()
    }

    /// Create an `Error` object with a `message` and optional `code`.
    pub(crate) fn new_error(&mut self, message: &str, code: Option<&str>) -> HeapId {
        use super::abi::PropertyAttributes;
        use super::heap::{Property, PropertyKey, PropertySlot};

        let message = self.heap.alloc(HeapValue::String(message.to_string()));
        let code = code.map(|code| self.heap.alloc(HeapValue::String(code.to_string())));
        let error = self.heap.alloc_object(ObjectKind::Error);
        let attributes = PropertyAttributes::WRITABLE | PropertyAttributes::CONFIGURABLE;
        if let Some(obj) = self.heap.object_mut(error) {
            obj.insert(
                PropertyKey::String("message".into()),
                Property {
                    slot: PropertySlot::Data(message),
                    attributes,
                },
            );
            if let Some(code) = code {
                obj.insert(
                    PropertyKey::String("code".into()),
                    Property {
                        slot: PropertySlot::Data(code),
                        attributes,
                    },
                );
            }
        }
        error
    }

    /// Best-effort description of an error value, for logs.
    pub(crate) fn describe(&self, id: HeapId) -> String {
        use super::heap::{PropertyKey, PropertySlot};

        match self.heap.get(id) {
            Some(HeapValue::String(s)) => s.clone(),
            Some(HeapValue::Object(obj)) => obj
                .find(&PropertyKey::String("message".into()))
                .and_then(|p| match p.slot {
                    PropertySlot::Data(m) => match self.heap.get(m) {
                        Some(HeapValue::String(s)) => Some(s.clone()),
                        _ => None,
                    },
                    PropertySlot::Accessor { .. } => None,
                })
                .unwrap_or_else(|| "[object]".into()),
            Some(other) => format!("{:?}", other),
            None => "<collected>".into(),
        }
    }

    // =========================================================================
    // Cleanup hooks and collection
    // =========================================================================

    pub(crate) fn add_cleanup_hook(&mut self, hook: napi_cleanup_hook, arg: *mut c_void) -> Result<(), Status> {
        let hook = CleanupHook {
            hook: hook.ok_or(Status::InvalidArg)?,
            arg,
        };
        if self.cleanup_hooks.contains(&hook) {
            return Err(Status::InvalidArg);
        }
        self.cleanup_hooks.push(hook);
        Ok(())
    }

    pub(crate) fn remove_cleanup_hook(&mut self, hook: napi_cleanup_hook, arg: *mut c_void) -> Result<(), Status> {
        let hook = CleanupHook {
            hook: hook.ok_or(Status::InvalidArg)?,
            arg,
        };
        let pos = self
            .cleanup_hooks
            .iter()
            .position(|h| *h == hook)
            .ok_or(Status::InvalidArg)?;
        self.cleanup_hooks.remove(pos);
        Ok(())
    }

    pub(crate) fn take_cleanup_hooks(&mut self) -> Vec<(unsafe extern "C" fn(*mut c_void), *mut c_void)> {
        self.cleanup_hooks
            .drain(..)
            .rev()
            .map(|h| (h.hook, h.arg))
            .collect()
    }

    fn roots(&self) -> Vec<HeapId> {
        let mut roots = Vec::with_capacity(self.handles.len() + self.references.len() + 6);
        roots.extend(self.handles.iter().copied());
        roots.extend(
            self.references
                .values()
                .filter(|r| r.count > 0)
                .map(|r| r.target),
        );
        roots.extend(self.pending_exception);
        let s = self.singletons;
        roots.extend([s.undefined, s.null, s.true_, s.false_, s.global]);
        roots
    }

    pub(crate) fn collect(&mut self) -> Vec<Finalizer> {
        let roots = self.roots();
        self.heap.collect(roots)
    }

    pub(crate) fn should_collect(&self) -> bool {
        self.heap.live() > self.gc_threshold
    }
}

// =========================================================================
// Re-entrant operations (take the raw env; never hold a borrow across a call)
// =========================================================================

/// Invoke a native callback inside a fresh callback frame.
///
/// Returns the heap id of the callback's result, re-rooted in the caller's
/// scope, or `PendingException` if the callback threw.
///
/// # Safety
/// `env` must point to a live environment on its owning thread.
pub(crate) unsafe fn invoke_native(
    env: napi_env,
    native: NativeFunction,
    this: HeapId,
    args: &[HeapId],
    new_target: Option<HeapId>,
) -> Result<HeapId, Status> {
    let raw = unsafe { RawEnv::from_raw(env) }.ok_or(Status::InvalidArg)?;
    let frame_id = raw.open_callback_frame();
    let mut frame = CallbackFrame {
        this: raw.push_handle(this),
        args: args.iter().map(|id| raw.push_handle(*id)).collect(),
        new_target: new_target.map_or(std::ptr::null_mut(), |id| raw.push_handle(id)),
        data: native.data,
    };
    let info = &mut frame as *mut CallbackFrame as *mut napi_callback_info__;

    let result = unsafe { (native.callback)(env, info) };

    let raw = unsafe { RawEnv::from_raw(env) }.ok_or(Status::InvalidArg)?;
    let result = if result.is_null() {
        raw.singletons.undefined
    } else {
        raw.resolve(result).unwrap_or(raw.singletons.undefined)
    };
    raw.close_callback_frame(frame_id);
    if raw.is_exception_pending() {
        Err(Status::PendingException)
    } else {
        Ok(result)
    }
}

/// Run finalizers, each inside its own callback frame.
///
/// # Safety
/// `env` must point to a live environment on its owning thread.
pub(crate) unsafe fn run_finalizers(env: napi_env, finalizers: Vec<Finalizer>) {
    for finalizer in finalizers {
        let Some(raw) = (unsafe { RawEnv::from_raw(env) }) else {
            return;
        };
        let frame_id = raw.open_callback_frame();
        unsafe { (finalizer.callback)(env, finalizer.data, finalizer.hint) };
        if let Some(raw) = unsafe { RawEnv::from_raw(env) } {
            raw.close_callback_frame(frame_id);
            report_uncaught(raw, "finalizer");
        }
    }
}

/// Collect garbage and run the finalizers of whatever was swept.
///
/// # Safety
/// `env` must point to a live environment on its owning thread.
pub(crate) unsafe fn collect_garbage(env: napi_env) {
    let Some(raw) = (unsafe { RawEnv::from_raw(env) }) else {
        return;
    };
    let finalizers = raw.collect();
    unsafe { run_finalizers(env, finalizers) };
}

/// Record and clear an exception left behind by a callback with no JS caller.
pub(crate) fn report_uncaught(raw: &mut RawEnv, origin: &str) {
    if let Some(error) = raw.take_exception() {
        let message = raw.describe(error);
        tracing::warn!(origin, %message, "uncaught exception");
        raw.uncaught.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env() -> Box<RawEnv> {
        RawEnv::new(Arc::new(WorkStealingPool::new(1).unwrap()), 64)
    }

    #[test]
    fn test_scope_close_out_of_order_is_rejected() {
        let mut env = env();
        let a = env.open_scope(false);
        let b = env.open_scope(false);
        let depth = env.scope_depth();

        assert_eq!(env.close_scope(a, false), Err(Status::HandleScopeMismatch));
        assert_eq!(env.scope_depth(), depth);

        assert_eq!(env.close_scope(b, false), Ok(()));
        assert_eq!(env.close_scope(a, false), Ok(()));
        assert_eq!(env.scope_depth(), 1);
    }

    #[test]
    fn test_root_frame_cannot_be_closed() {
        let mut env = env();
        assert_eq!(env.close_scope(0, false), Err(Status::HandleScopeMismatch));
    }

    #[test]
    fn test_handles_die_with_their_scope() {
        let mut env = env();
        let scope = env.open_scope(false);
        let v = env.alloc(HeapValue::Number(1.0));
        assert!(env.resolve(v).is_ok());
        env.close_scope(scope, false).unwrap();
        assert_eq!(env.resolve(v), Err(Status::InvalidArg));
    }

    #[test]
    fn test_escape_once_into_parent() {
        let mut env = env();
        let scope = env.open_scope(true);
        let inner = env.alloc(HeapValue::Number(5.0));
        let escaped = env.escape(scope, inner).unwrap();
        assert_eq!(env.escape(scope, inner), Err(Status::EscapeCalledTwice));
        env.close_scope(scope, true).unwrap();

        let id = env.resolve(escaped).unwrap();
        assert!(matches!(env.heap.get(id), Some(HeapValue::Number(n)) if *n == 5.0));
    }

    #[test]
    fn test_close_with_wrong_flavour_is_invalid() {
        let mut env = env();
        let scope = env.open_scope(true);
        assert_eq!(env.close_scope(scope, false), Err(Status::InvalidArg));
        assert_eq!(env.close_scope(scope, true), Ok(()));
    }

    #[test]
    fn test_reference_counts_never_go_negative() {
        let mut env = env();
        let target = env.heap.alloc(HeapValue::Number(1.0));
        let r = env.create_reference(target, 1);
        assert_eq!(env.reference_unref(r), Ok(0));
        assert_eq!(env.reference_unref(r), Err(Status::GenericFailure));
        assert_eq!(env.reference_ref(r), Ok(1));
        env.delete_reference(r).unwrap();
        assert_eq!(env.delete_reference(r), Err(Status::InvalidArg));
    }

    #[test]
    fn test_weak_reference_empties_after_collection() {
        let mut env = env();
        let target = env.heap.alloc_object(ObjectKind::Object);
        let strong = env.create_reference(target, 1);
        let weak = env.create_reference(target, 0);

        env.collect();
        assert_eq!(env.reference_target(weak), Ok(Some(target)));

        env.reference_unref(strong).unwrap();
        env.collect();
        assert_eq!(env.reference_target(weak), Ok(None));
    }

    #[test]
    fn test_last_error_tracks_latest_status() {
        let mut env = env();
        env.record(Err(Status::QueueFull));
        assert_eq!(env.last_error().error_code, Status::QueueFull.as_raw());
        assert!(!env.last_error().error_message.is_null());
        env.clear_last_error();
        assert_eq!(env.last_error().error_code, Status::Ok.as_raw());
    }
}
