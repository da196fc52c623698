//! Managed side of the bridge
//!
//! Closures registered here are reachable from the runtime's fixed C entry
//! points through the handler registry:
//! - `registry`: per-registration ids and the global handler table
//! - `trampoline`: one `extern "C"` entry point per callback shape
//! - `env`: `Env`, `Value` and `CallInfo` wrappers over the native surface
//! - `scope`: handle scopes and counted references
//! - `property`: descriptor builder for `define_properties`/`define_class`
//! - `async_work`, `threadsafe`: off-thread work and cross-thread calls
//! - `module`: module entry points

pub mod async_work;
pub mod env;
pub mod module;
pub mod property;
pub mod registry;
pub mod scope;
pub mod threadsafe;
pub(crate) mod trampoline;

pub use async_work::AsyncWork;
pub use env::{CallInfo, CleanupHook, Env, Value, fatal_error};
pub use module::{ModuleInit, run_init};
pub use property::{Descriptors, Property, build_descriptors};
pub use registry::{CallbackKind, Handler, Registration, Registry};
pub use scope::{EscapableHandleScope, EscapeState, HandleScope, Reference, ReferenceState, ScopeState};
pub use threadsafe::{CallMode, ReleaseMode, ThreadsafeFunction};
