//! In-process embedding runtime
//!
//! This module is the host side of the bridge: a small single-threaded value
//! runtime that implements the native call surface as `extern "C"` functions.
//! It separates:
//! - The ABI vocabulary (abi.rs)
//! - The value heap and object model, with mark/sweep collection (heap.rs)
//! - Per-environment state: handles, scopes, references, exceptions (env.rs)
//! - The `napi_*` entry points (stubs.rs, object.rs, async/)
//! - Worker pool, async work, thread-safe functions and the event loop (async/)
//!
//! Managed code should go through `crate::bridge`; the raw surface is public so
//! native-shaped callers and tests can drive it directly.

pub mod abi;
pub mod env;
pub mod heap;
pub mod object;
pub mod stubs;
pub mod r#async;

/// Flat view of the ABI vocabulary and every native entry point.
pub mod sys {
    pub use super::abi::*;
    pub use super::object::*;
    pub use super::r#async::threadsafe::*;
    pub use super::r#async::work::*;
    pub use super::stubs::*;
}

pub use abi::{NAPI_VERSION, PropertyAttributes, TypedArrayType, ValueType};
pub use r#async::{OwnedEnv, Runtime, RuntimeConfig};
