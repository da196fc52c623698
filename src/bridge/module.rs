//! Module entry point
//!
//! A module exports one `(env, exports) -> exports` function. [`run_init`]
//! adapts a managed init function to that shape; [`register_module!`]
//! declares the exported symbol.

use std::panic::{AssertUnwindSafe, catch_unwind};

use crate::error::Result;
use crate::runtime::sys::{napi_env, napi_value};

use super::env::{Env, Value};

pub type ModuleInit = fn(Env, Value) -> Result<Value>;

/// Run `init` against the exports object. Errors and panics are thrown and
/// a null handle is returned.
///
/// # Safety
/// Must be called by the runtime with a live `env` and `exports`.
pub unsafe fn run_init(env: napi_env, exports: napi_value, init: ModuleInit) -> napi_value {
    let env = unsafe { Env::from_raw(env) };
    let exports = unsafe { Value::from_raw(env, exports) };
    match catch_unwind(AssertUnwindSafe(|| init(env, exports))) {
        Ok(Ok(exports)) => {
            tracing::debug!("module initialized");
            exports.raw()
        }
        Ok(Err(err)) => {
            tracing::warn!(%err, "module initialization failed");
            if !env.is_exception_pending().unwrap_or(true) {
                if let Err(failed) = env.throw_error(&err.reason, Some(&err.status.to_string())) {
                    tracing::error!(%failed, original = %err, "could not throw init error");
                }
            }
            std::ptr::null_mut()
        }
        Err(_) => {
            tracing::error!("module initialization panicked");
            if let Err(failed) = env.throw_error("module initialization panicked", None) {
                tracing::error!(%failed, "could not throw init panic");
            }
            std::ptr::null_mut()
        }
    }
}

/// Declare a module entry point.
///
/// `register_module!(init)` exports `napi_register_module_v1`.
/// `register_module!(name, init)` defines an unexported entry point called
/// `name`, for hosts that load modules by function pointer.
#[macro_export]
macro_rules! register_module {
    ($init:path) => {
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn napi_register_module_v1(
            env: $crate::runtime::sys::napi_env,
            exports: $crate::runtime::sys::napi_value,
        ) -> $crate::runtime::sys::napi_value {
            unsafe { $crate::bridge::module::run_init(env, exports, $init) }
        }
    };
    ($name:ident, $init:path) => {
        pub unsafe extern "C" fn $name(
            env: $crate::runtime::sys::napi_env,
            exports: $crate::runtime::sys::napi_value,
        ) -> $crate::runtime::sys::napi_value {
            unsafe { $crate::bridge::module::run_init(env, exports, $init) }
        }
    };
}
