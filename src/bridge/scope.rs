//! Handle scopes and references
//!
//! Each guard tracks its own small state machine so misuse fails with a
//! status instead of silently doing nothing:
//! - `HandleScope`: Open -> Closed
//! - `EscapableHandleScope`: additionally NotEscaped -> Escaped
//! - `Reference`: Live -> Deleted
//!
//! Scopes close on drop. The runtime enforces LIFO order; closing out of
//! order reports `HandleScopeMismatch` and leaves the scope open.

use crate::error::{Error, Result, Status};
use crate::runtime::sys::{self, napi_escapable_handle_scope, napi_handle_scope, napi_ref};

use super::env::{Env, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeState {
    Open,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EscapeState {
    NotEscaped,
    Escaped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceState {
    Live,
    Deleted,
}

// ============================================================================
// HandleScope
// ============================================================================

#[derive(Debug)]
pub struct HandleScope {
    env: Env,
    raw: napi_handle_scope,
    state: ScopeState,
}

impl HandleScope {
    pub fn open(env: Env) -> Result<Self> {
        let mut raw = std::ptr::null_mut();
        env.check(unsafe { sys::napi_open_handle_scope(env.raw(), &mut raw) })?;
        tracing::trace!(scope = ?raw, "handle scope opened");
        Ok(Self {
            env,
            raw,
            state: ScopeState::Open,
        })
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    /// Close explicitly. On `HandleScopeMismatch` the scope stays open and may
    /// be closed again once the scopes above it are gone.
    pub fn close(&mut self) -> Result<()> {
        if self.state == ScopeState::Closed {
            return Err(Error::new(Status::HandleScopeMismatch, "handle scope already closed"));
        }
        self.env
            .check(unsafe { sys::napi_close_handle_scope(self.env.raw(), self.raw) })?;
        self.state = ScopeState::Closed;
        Ok(())
    }
}

impl Drop for HandleScope {
    fn drop(&mut self) {
        if self.state == ScopeState::Open {
            if let Err(err) = self.close() {
                tracing::warn!(%err, "handle scope dropped out of order");
            }
        }
    }
}

// ============================================================================
// EscapableHandleScope
// ============================================================================

#[derive(Debug)]
pub struct EscapableHandleScope {
    env: Env,
    raw: napi_escapable_handle_scope,
    state: ScopeState,
    escape: EscapeState,
}

impl EscapableHandleScope {
    pub fn open(env: Env) -> Result<Self> {
        let mut raw = std::ptr::null_mut();
        env.check(unsafe { sys::napi_open_escapable_handle_scope(env.raw(), &mut raw) })?;
        Ok(Self {
            env,
            raw,
            state: ScopeState::Open,
            escape: EscapeState::NotEscaped,
        })
    }

    pub fn state(&self) -> ScopeState {
        self.state
    }

    pub fn escape_state(&self) -> EscapeState {
        self.escape
    }

    /// Promote `value` into the parent scope. Only once per scope.
    pub fn escape(&mut self, value: Value) -> Result<Value> {
        if self.state == ScopeState::Closed {
            return Err(Error::new(Status::HandleScopeMismatch, "escape from a closed scope"));
        }
        let result = self.env.make(|out| unsafe {
            sys::napi_escape_handle(self.env.raw(), self.raw, value.raw(), out)
        });
        if result.is_ok() {
            self.escape = EscapeState::Escaped;
        }
        result
    }

    pub fn close(&mut self) -> Result<()> {
        if self.state == ScopeState::Closed {
            return Err(Error::new(Status::HandleScopeMismatch, "handle scope already closed"));
        }
        self.env
            .check(unsafe { sys::napi_close_escapable_handle_scope(self.env.raw(), self.raw) })?;
        self.state = ScopeState::Closed;
        Ok(())
    }
}

impl Drop for EscapableHandleScope {
    fn drop(&mut self) {
        if self.state == ScopeState::Open {
            if let Err(err) = self.close() {
                tracing::warn!(%err, "escapable handle scope dropped out of order");
            }
        }
    }
}

// ============================================================================
// Reference
// ============================================================================

/// Counted persistent handle. Count 0 is weak.
///
/// Must be deleted explicitly with [`Reference::delete`]; dropping a live
/// reference leaks it (the runtime frees it at teardown) and logs a warning.
#[derive(Debug)]
pub struct Reference {
    env: Env,
    raw: napi_ref,
    state: ReferenceState,
}

impl Reference {
    pub fn new(env: Env, value: Value, initial_count: u32) -> Result<Self> {
        let mut raw = std::ptr::null_mut();
        env.check(unsafe { sys::napi_create_reference(env.raw(), value.raw(), initial_count, &mut raw) })?;
        Ok(Self {
            env,
            raw,
            state: ReferenceState::Live,
        })
    }

    pub fn state(&self) -> ReferenceState {
        self.state
    }

    fn live(&self) -> Result<()> {
        match self.state {
            ReferenceState::Live => Ok(()),
            ReferenceState::Deleted => Err(Error::new(Status::InvalidArg, "reference already deleted")),
        }
    }

    /// Increment the count; returns the new count.
    pub fn reference(&mut self) -> Result<u32> {
        self.live()?;
        let mut count = 0;
        self.env
            .check(unsafe { sys::napi_reference_ref(self.env.raw(), self.raw, &mut count) })?;
        Ok(count)
    }

    /// Decrement the count; returns the new count. Rejected at 0.
    pub fn unref(&mut self) -> Result<u32> {
        self.live()?;
        let mut count = 0;
        self.env
            .check(unsafe { sys::napi_reference_unref(self.env.raw(), self.raw, &mut count) })?;
        Ok(count)
    }

    /// The referenced value, or `None` once a weak target was collected.
    pub fn get_value(&self) -> Result<Option<Value>> {
        self.live()?;
        let value = self.env.make(|out| unsafe {
            sys::napi_get_reference_value(self.env.raw(), self.raw, out)
        })?;
        Ok((!value.raw().is_null()).then_some(value))
    }

    pub fn delete(&mut self) -> Result<()> {
        self.live()?;
        self.env
            .check(unsafe { sys::napi_delete_reference(self.env.raw(), self.raw) })?;
        self.state = ReferenceState::Deleted;
        Ok(())
    }
}

impl Drop for Reference {
    fn drop(&mut self) {
        if self.state == ReferenceState::Live {
            tracing::warn!(reference = ?self.raw, "reference dropped without delete");
        }
    }
}
