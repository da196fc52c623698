//! Library target for the bridge
//!
//! Two layers:
//! - `runtime`: an in-process embedding runtime exposing the native
//!   `napi_*` call surface as `extern "C"` functions, with its own heap,
//!   handle scopes, worker pool and event loop
//! - `bridge`: the managed side, which registers closures behind fixed
//!   trampolines and wraps the native surface in `Result`-returning calls
//!
//! Built as an `rlib` for Rust callers and a `cdylib` exporting the native
//! surface.

pub mod bridge;
pub mod error;
pub mod runtime;

pub use bridge::{
    AsyncWork, CallInfo, CallMode, Env, EscapableHandleScope, HandleScope, Property, Reference, ReleaseMode,
    ThreadsafeFunction, Value,
};
pub use error::{Error, Result, Status};
pub use runtime::{OwnedEnv, PropertyAttributes, Runtime, RuntimeConfig, ValueType};

#[cfg(test)]
mod tests;
