//! Status codes and the crate error type.

use std::fmt;

use crate::runtime::abi::{self, napi_status};

/// Outcome of a boundary-crossing operation.
///
/// Mirrors `napi_status` one to one; `Ok` is the only success value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    InvalidArg,
    ObjectExpected,
    StringExpected,
    NameExpected,
    FunctionExpected,
    NumberExpected,
    BooleanExpected,
    ArrayExpected,
    GenericFailure,
    PendingException,
    Cancelled,
    EscapeCalledTwice,
    HandleScopeMismatch,
    CallbackScopeMismatch,
    QueueFull,
    Closing,
    BigintExpected,
    DateExpected,
}

impl Status {
    /// Unknown raw codes collapse to `GenericFailure`.
    pub fn from_raw(raw: napi_status) -> Self {
        match raw {
            abi::napi_ok => Status::Ok,
            abi::napi_invalid_arg => Status::InvalidArg,
            abi::napi_object_expected => Status::ObjectExpected,
            abi::napi_string_expected => Status::StringExpected,
            abi::napi_name_expected => Status::NameExpected,
            abi::napi_function_expected => Status::FunctionExpected,
            abi::napi_number_expected => Status::NumberExpected,
            abi::napi_boolean_expected => Status::BooleanExpected,
            abi::napi_array_expected => Status::ArrayExpected,
            abi::napi_pending_exception => Status::PendingException,
            abi::napi_cancelled => Status::Cancelled,
            abi::napi_escape_called_twice => Status::EscapeCalledTwice,
            abi::napi_handle_scope_mismatch => Status::HandleScopeMismatch,
            abi::napi_callback_scope_mismatch => Status::CallbackScopeMismatch,
            abi::napi_queue_full => Status::QueueFull,
            abi::napi_closing => Status::Closing,
            abi::napi_bigint_expected => Status::BigintExpected,
            abi::napi_date_expected => Status::DateExpected,
            _ => Status::GenericFailure,
        }
    }

    pub fn as_raw(self) -> napi_status {
        match self {
            Status::Ok => abi::napi_ok,
            Status::InvalidArg => abi::napi_invalid_arg,
            Status::ObjectExpected => abi::napi_object_expected,
            Status::StringExpected => abi::napi_string_expected,
            Status::NameExpected => abi::napi_name_expected,
            Status::FunctionExpected => abi::napi_function_expected,
            Status::NumberExpected => abi::napi_number_expected,
            Status::BooleanExpected => abi::napi_boolean_expected,
            Status::ArrayExpected => abi::napi_array_expected,
            Status::GenericFailure => abi::napi_generic_failure,
            Status::PendingException => abi::napi_pending_exception,
            Status::Cancelled => abi::napi_cancelled,
            Status::EscapeCalledTwice => abi::napi_escape_called_twice,
            Status::HandleScopeMismatch => abi::napi_handle_scope_mismatch,
            Status::CallbackScopeMismatch => abi::napi_callback_scope_mismatch,
            Status::QueueFull => abi::napi_queue_full,
            Status::Closing => abi::napi_closing,
            Status::BigintExpected => abi::napi_bigint_expected,
            Status::DateExpected => abi::napi_date_expected,
        }
    }

    /// Fixed human-readable message, as reported by `napi_get_last_error_info`.
    pub fn message(self) -> &'static str {
        match self {
            Status::Ok => "",
            Status::InvalidArg => "Invalid argument",
            Status::ObjectExpected => "An object was expected",
            Status::StringExpected => "A string was expected",
            Status::NameExpected => "A string or symbol was expected",
            Status::FunctionExpected => "A function was expected",
            Status::NumberExpected => "A number was expected",
            Status::BooleanExpected => "A boolean was expected",
            Status::ArrayExpected => "An array was expected",
            Status::GenericFailure => "Unknown failure",
            Status::PendingException => "An exception is pending",
            Status::Cancelled => "The async work item was cancelled",
            Status::EscapeCalledTwice => "napi_escape_handle already called on scope",
            Status::HandleScopeMismatch => "Invalid handle scope usage",
            Status::CallbackScopeMismatch => "Invalid callback scope usage",
            Status::QueueFull => "Thread-safe function queue is full",
            Status::Closing => "Thread-safe function handle is closing",
            Status::BigintExpected => "A bigint was expected",
            Status::DateExpected => "A date was expected",
        }
    }

    /// NUL-terminated variant of [`Status::message`] for the C surface.
    pub(crate) fn c_message(self) -> &'static std::ffi::CStr {
        match self {
            Status::Ok => c"",
            Status::InvalidArg => c"Invalid argument",
            Status::ObjectExpected => c"An object was expected",
            Status::StringExpected => c"A string was expected",
            Status::NameExpected => c"A string or symbol was expected",
            Status::FunctionExpected => c"A function was expected",
            Status::NumberExpected => c"A number was expected",
            Status::BooleanExpected => c"A boolean was expected",
            Status::ArrayExpected => c"An array was expected",
            Status::GenericFailure => c"Unknown failure",
            Status::PendingException => c"An exception is pending",
            Status::Cancelled => c"The async work item was cancelled",
            Status::EscapeCalledTwice => c"napi_escape_handle already called on scope",
            Status::HandleScopeMismatch => c"Invalid handle scope usage",
            Status::CallbackScopeMismatch => c"Invalid callback scope usage",
            Status::QueueFull => c"Thread-safe function queue is full",
            Status::Closing => c"Thread-safe function handle is closing",
            Status::BigintExpected => c"A bigint was expected",
            Status::DateExpected => c"A date was expected",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Error returned by every managed wrapper around the native surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{status}: {reason}")]
pub struct Error {
    pub status: Status,
    pub reason: String,
}

impl Error {
    pub fn new(status: Status, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
        }
    }

    pub fn from_status(status: Status) -> Self {
        Self::new(status, status.message())
    }

    /// Shorthand for a `GenericFailure` carrying a message.
    pub fn from_reason(reason: impl Into<String>) -> Self {
        Self::new(Status::GenericFailure, reason)
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::from_status(status)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::from_reason(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Evaluate a native call and convert a non-Ok status into `Err`.
///
/// The two-argument form attaches a formatted reason instead of the status's
/// stock message.
#[macro_export]
macro_rules! check_status {
    ($code:expr) => {{
        let status = $crate::error::Status::from_raw($code);
        if status != $crate::error::Status::Ok {
            return Err($crate::error::Error::from_status(status));
        }
    }};
    ($code:expr, $($msg:tt)+) => {{
        let status = $crate::error::Status::from_raw($code);
        if status != $crate::error::Status::Ok {
            return Err($crate::error::Error::new(status, format!($($msg)+)));
        }
    }};
}
