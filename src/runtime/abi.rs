//! Fixed C-ABI vocabulary shared by the runtime and the managed bridge
//!
//! Everything in this module has a stable, `#[repr(C)]` (or plain integer)
//! layout so it can cross the native boundary unchanged:
//! - Opaque handle types (environment, value, reference, scope, work, ...)
//! - Status codes and value/typed-array kinds (plain `i32` constants)
//! - Property descriptor and extended error info structs
//! - One callback typedef per callback kind
//!
//! The raw integers are mirrored by Rust enums (`ValueType`, `TypedArrayType`,
//! `PropertyAttributes`) for the managed side.

#![allow(non_camel_case_types, non_upper_case_globals)]

use std::ffi::{c_char, c_void};

/// Node-API version implemented by the runtime.
pub const NAPI_VERSION: u32 = 8;

/// Length marker for NUL-terminated strings.
pub const NAPI_AUTO_LENGTH: usize = usize::MAX;

// =========================================================================
// Opaque handles
// =========================================================================

#[repr(C)]
pub struct napi_env__ {
    _private: [u8; 0],
}
#[repr(C)]
pub struct napi_value__ {
    _private: [u8; 0],
}
#[repr(C)]
pub struct napi_ref__ {
    _private: [u8; 0],
}
#[repr(C)]
pub struct napi_handle_scope__ {
    _private: [u8; 0],
}
#[repr(C)]
pub struct napi_escapable_handle_scope__ {
    _private: [u8; 0],
}
#[repr(C)]
pub struct napi_callback_info__ {
    _private: [u8; 0],
}
#[repr(C)]
pub struct napi_async_work__ {
    _private: [u8; 0],
}
#[repr(C)]
pub struct napi_threadsafe_function__ {
    _private: [u8; 0],
}

pub type napi_env = *mut napi_env__;
pub type napi_value = *mut napi_value__;
pub type napi_ref = *mut napi_ref__;
pub type napi_handle_scope = *mut napi_handle_scope__;
pub type napi_escapable_handle_scope = *mut napi_escapable_handle_scope__;
pub type napi_callback_info = *mut napi_callback_info__;
pub type napi_async_work = *mut napi_async_work__;
pub type napi_threadsafe_function = *mut napi_threadsafe_function__;

// =========================================================================
// Status codes
// =========================================================================

pub type napi_status = i32;

pub const napi_ok: napi_status = 0;
pub const napi_invalid_arg: napi_status = 1;
pub const napi_object_expected: napi_status = 2;
pub const napi_string_expected: napi_status = 3;
pub const napi_name_expected: napi_status = 4;
pub const napi_function_expected: napi_status = 5;
pub const napi_number_expected: napi_status = 6;
pub const napi_boolean_expected: napi_status = 7;
pub const napi_array_expected: napi_status = 8;
pub const napi_generic_failure: napi_status = 9;
pub const napi_pending_exception: napi_status = 10;
pub const napi_cancelled: napi_status = 11;
pub const napi_escape_called_twice: napi_status = 12;
pub const napi_handle_scope_mismatch: napi_status = 13;
pub const napi_callback_scope_mismatch: napi_status = 14;
pub const napi_queue_full: napi_status = 15;
pub const napi_closing: napi_status = 16;
pub const napi_bigint_expected: napi_status = 17;
pub const napi_date_expected: napi_status = 18;

// =========================================================================
// Value kinds
// =========================================================================

pub type napi_valuetype = i32;

pub const napi_undefined: napi_valuetype = 0;
pub const napi_null: napi_valuetype = 1;
pub const napi_boolean: napi_valuetype = 2;
pub const napi_number: napi_valuetype = 3;
pub const napi_string: napi_valuetype = 4;
pub const napi_symbol: napi_valuetype = 5;
pub const napi_object: napi_valuetype = 6;
pub const napi_function: napi_valuetype = 7;
pub const napi_external: napi_valuetype = 8;
pub const napi_bigint: napi_valuetype = 9;

pub type napi_typedarray_type = i32;

pub const napi_int8_array: napi_typedarray_type = 0;
pub const napi_uint8_array: napi_typedarray_type = 1;
pub const napi_uint8_clamped_array: napi_typedarray_type = 2;
pub const napi_int16_array: napi_typedarray_type = 3;
pub const napi_uint16_array: napi_typedarray_type = 4;
pub const napi_int32_array: napi_typedarray_type = 5;
pub const napi_uint32_array: napi_typedarray_type = 6;
pub const napi_float32_array: napi_typedarray_type = 7;
pub const napi_float64_array: napi_typedarray_type = 8;
pub const napi_bigint64_array: napi_typedarray_type = 9;
pub const napi_biguint64_array: napi_typedarray_type = 10;

// =========================================================================
// Property attributes and thread-safe modes
// =========================================================================

pub type napi_property_attributes = i32;

pub const napi_default: napi_property_attributes = 0;
pub const napi_writable: napi_property_attributes = 1 << 0;
pub const napi_enumerable: napi_property_attributes = 1 << 1;
pub const napi_configurable: napi_property_attributes = 1 << 2;
pub const napi_static: napi_property_attributes = 1 << 10;
pub const napi_default_method: napi_property_attributes = napi_writable | napi_configurable;
pub const napi_default_jsproperty: napi_property_attributes =
    napi_writable | napi_enumerable | napi_configurable;

pub type napi_threadsafe_function_call_mode = i32;

pub const napi_tsfn_nonblocking: napi_threadsafe_function_call_mode = 0;
pub const napi_tsfn_blocking: napi_threadsafe_function_call_mode = 1;

pub type napi_threadsafe_function_release_mode = i32;

pub const napi_tsfn_release: napi_threadsafe_function_release_mode = 0;
pub const napi_tsfn_abort: napi_threadsafe_function_release_mode = 1;

// =========================================================================
// Callback shapes, one per callback kind
// =========================================================================

pub type napi_callback =
    Option<unsafe extern "C" fn(env: napi_env, info: napi_callback_info) -> napi_value>;

pub type napi_finalize = Option<
    unsafe extern "C" fn(env: napi_env, finalize_data: *mut c_void, finalize_hint: *mut c_void),
>;

pub type napi_async_execute_callback = Option<unsafe extern "C" fn(env: napi_env, data: *mut c_void)>;

pub type napi_async_complete_callback =
    Option<unsafe extern "C" fn(env: napi_env, status: napi_status, data: *mut c_void)>;

pub type napi_threadsafe_function_call_js = Option<
    unsafe extern "C" fn(
        env: napi_env,
        js_callback: napi_value,
        context: *mut c_void,
        data: *mut c_void,
    ),
>;

pub type napi_cleanup_hook = Option<unsafe extern "C" fn(arg: *mut c_void)>;

/// Module entry point: `(env, exports) -> exports`.
pub type napi_addon_register_func =
    Option<unsafe extern "C" fn(env: napi_env, exports: napi_value) -> napi_value>;

// =========================================================================
// Structs
// =========================================================================

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct napi_property_descriptor {
    /// NUL-terminated UTF-8 name; takes precedence over `name` when non-null.
    pub utf8name: *const c_char,
    pub name: napi_value,
    pub method: napi_callback,
    pub getter: napi_callback,
    pub setter: napi_callback,
    pub value: napi_value,
    pub attributes: napi_property_attributes,
    pub data: *mut c_void,
}

impl Default for napi_property_descriptor {
    fn default() -> Self {
        Self {
            utf8name: std::ptr::null(),
            name: std::ptr::null_mut(),
            method: None,
            getter: None,
            setter: None,
            value: std::ptr::null_mut(),
            attributes: napi_default,
            data: std::ptr::null_mut(),
        }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct napi_extended_error_info {
    pub error_message: *const c_char,
    pub engine_reserved: *mut c_void,
    pub engine_error_code: u32,
    pub error_code: napi_status,
}

// =========================================================================
// Managed mirrors of the integer vocabularies
// =========================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Symbol,
    Object,
    Function,
    External,
    BigInt,
}

impl ValueType {
    pub fn from_raw(raw: napi_valuetype) -> Option<Self> {
        Some(match raw {
            napi_undefined => ValueType::Undefined,
            napi_null => ValueType::Null,
            napi_boolean => ValueType::Boolean,
            napi_number => ValueType::Number,
            napi_string => ValueType::String,
            napi_symbol => ValueType::Symbol,
            napi_object => ValueType::Object,
            napi_function => ValueType::Function,
            napi_external => ValueType::External,
            napi_bigint => ValueType::BigInt,
            _ => return None,
        })
    }

    pub fn as_raw(self) -> napi_valuetype {
        match self {
            ValueType::Undefined => napi_undefined,
            ValueType::Null => napi_null,
            ValueType::Boolean => napi_boolean,
            ValueType::Number => napi_number,
            ValueType::String => napi_string,
            ValueType::Symbol => napi_symbol,
            ValueType::Object => napi_object,
            ValueType::Function => napi_function,
            ValueType::External => napi_external,
            ValueType::BigInt => napi_bigint,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TypedArrayType {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
}

impl TypedArrayType {
    pub fn from_raw(raw: napi_typedarray_type) -> Option<Self> {
        Some(match raw {
            napi_int8_array => TypedArrayType::Int8,
            napi_uint8_array => TypedArrayType::Uint8,
            napi_uint8_clamped_array => TypedArrayType::Uint8Clamped,
            napi_int16_array => TypedArrayType::Int16,
            napi_uint16_array => TypedArrayType::Uint16,
            napi_int32_array => TypedArrayType::Int32,
            napi_uint32_array => TypedArrayType::Uint32,
            napi_float32_array => TypedArrayType::Float32,
            napi_float64_array => TypedArrayType::Float64,
            napi_bigint64_array => TypedArrayType::BigInt64,
            napi_biguint64_array => TypedArrayType::BigUint64,
            _ => return None,
        })
    }

    /// Size in bytes of one element.
    pub fn element_size(self) -> usize {
        match self {
            TypedArrayType::Int8 | TypedArrayType::Uint8 | TypedArrayType::Uint8Clamped => 1,
            TypedArrayType::Int16 | TypedArrayType::Uint16 => 2,
            TypedArrayType::Int32 | TypedArrayType::Uint32 | TypedArrayType::Float32 => 4,
            TypedArrayType::Float64 | TypedArrayType::BigInt64 | TypedArrayType::BigUint64 => 8,
        }
    }
}

/// Attribute bitset for property descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct PropertyAttributes(napi_property_attributes);

impl PropertyAttributes {
    pub const DEFAULT: Self = Self(napi_default);
    pub const WRITABLE: Self = Self(napi_writable);
    pub const ENUMERABLE: Self = Self(napi_enumerable);
    pub const CONFIGURABLE: Self = Self(napi_configurable);
    pub const STATIC: Self = Self(napi_static);
    pub const DEFAULT_METHOD: Self = Self(napi_default_method);
    pub const DEFAULT_JSPROPERTY: Self = Self(napi_default_jsproperty);

    #[inline]
    pub const fn from_raw(raw: napi_property_attributes) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn bits(self) -> napi_property_attributes {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl std::ops::BitOr for PropertyAttributes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_numbering_is_stable() {
        // Any change here breaks the native ABI
        assert_eq!(napi_ok, 0);
        assert_eq!(napi_generic_failure, 9);
        assert_eq!(napi_escape_called_twice, 12);
        assert_eq!(napi_handle_scope_mismatch, 13);
        assert_eq!(napi_queue_full, 15);
        assert_eq!(napi_closing, 16);
        assert_eq!(napi_date_expected, 18);
    }

    #[test]
    fn test_value_type_raw_mapping() {
        for raw in napi_undefined..=napi_bigint {
            let ty = ValueType::from_raw(raw).expect("known value type");
            assert_eq!(ty.as_raw(), raw);
        }
        assert_eq!(ValueType::from_raw(42), None);
    }

    #[test]
    fn test_typed_array_element_sizes() {
        assert_eq!(TypedArrayType::from_raw(napi_uint8_clamped_array).unwrap().element_size(), 1);
        assert_eq!(TypedArrayType::from_raw(napi_int16_array).unwrap().element_size(), 2);
        assert_eq!(TypedArrayType::from_raw(napi_float32_array).unwrap().element_size(), 4);
        assert_eq!(TypedArrayType::from_raw(napi_biguint64_array).unwrap().element_size(), 8);
        assert_eq!(TypedArrayType::from_raw(11), None);
    }

    #[test]
    fn test_property_attribute_composites() {
        let method = PropertyAttributes::DEFAULT_METHOD;
        assert!(method.contains(PropertyAttributes::WRITABLE));
        assert!(method.contains(PropertyAttributes::CONFIGURABLE));
        assert!(!method.contains(PropertyAttributes::ENUMERABLE));

        let stat = PropertyAttributes::ENUMERABLE | PropertyAttributes::STATIC;
        assert!(stat.contains(PropertyAttributes::STATIC));
        assert_eq!(stat.without(PropertyAttributes::STATIC), PropertyAttributes::ENUMERABLE);
    }

    #[test]
    fn test_descriptor_is_pointer_sized_fields() {
        // 6 pointer-sized slots plus attributes and data
        assert!(std::mem::size_of::<napi_property_descriptor>() >= 7 * std::mem::size_of::<usize>());
        assert_eq!(std::mem::size_of::<napi_callback>(), std::mem::size_of::<usize>());
    }
}
