//! Native call surface: objects, properties, functions and classes
//!
//! Property reads and writes follow the prototype chain and run accessor
//! callbacks, so they go through the re-entrant calling convention. Batch
//! definitions (`napi_define_properties`, `napi_define_class`) validate every
//! descriptor before installing any of them.

use std::ffi::{c_char, c_void};

use crate::error::Status;

use super::abi::{
    NAPI_AUTO_LENGTH, PropertyAttributes, napi_callback, napi_callback_info, napi_env, napi_finalize,
    napi_property_descriptor, napi_ref, napi_ref__, napi_status, napi_value,
};
use super::env::{CallbackFrame, RawEnv, invoke_native};
use super::heap::{
    Finalizer, Heap, HeapId, HeapObject, HeapValue, NativeFunction, ObjectKind, Property, PropertyKey,
    PropertySlot,
};
use super::stubs::{env_mut, napi_call, napi_call_preamble, napi_call_reentrant, number_to_string, out, read_str};

const MAX_PROTOTYPE_DEPTH: usize = 256;

// =========================================================================
// Lookup helpers
// =========================================================================

enum Lookup {
    Value(HeapId),
    Accessor {
        getter: Option<NativeFunction>,
        setter: Option<NativeFunction>,
    },
    Missing,
}

fn property_key(raw: &RawEnv, key: napi_value) -> Result<PropertyKey, Status> {
    let id = raw.resolve(key)?;
    match raw.heap.get(id) {
        Some(HeapValue::String(s)) => Ok(PropertyKey::String(s.clone())),
        Some(HeapValue::Symbol(_)) => Ok(PropertyKey::Symbol(id)),
        Some(HeapValue::Number(n)) => Ok(PropertyKey::String(number_to_string(*n))),
        _ => Err(Status::NameExpected),
    }
}

fn object_id(raw: &RawEnv, value: napi_value) -> Result<HeapId, Status> {
    let id = raw.resolve(value)?;
    match raw.heap.get(id) {
        Some(HeapValue::Object(_)) => Ok(id),
        _ => Err(Status::ObjectExpected),
    }
}

fn array_index(key: &PropertyKey) -> Option<usize> {
    match key {
        PropertyKey::String(s) if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => s.parse().ok(),
        _ => None,
    }
}

/// Own element or `length` of an array, if `key` names one.
fn own_array_slot(obj: &HeapObject, key: &PropertyKey) -> Option<Option<HeapId>> {
    let ObjectKind::Array(elements) = &obj.kind else {
        return None;
    };
    let index = array_index(key)?;
    Some(elements.get(index).copied().flatten())
}

fn lookup(heap: &Heap, mut id: HeapId, key: &PropertyKey) -> Lookup {
    for _ in 0..MAX_PROTOTYPE_DEPTH {
        let Some(obj) = heap.object(id) else {
            return Lookup::Missing;
        };
        if let Some(Some(element)) = own_array_slot(obj, key) {
            return Lookup::Value(element);
        }
        if let Some(property) = obj.find(key) {
            return match &property.slot {
                PropertySlot::Data(value) => Lookup::Value(*value),
                PropertySlot::Accessor { getter, setter } => Lookup::Accessor {
                    getter: *getter,
                    setter: *setter,
                },
            };
        }
        match obj.prototype {
            Some(parent) => id = parent,
            None => return Lookup::Missing,
        }
    }
    Lookup::Missing
}

fn is_array_length(obj: &HeapObject, key: &PropertyKey) -> Option<usize> {
    match (&obj.kind, key) {
        (ObjectKind::Array(elements), PropertyKey::String(s)) if s == "length" => Some(elements.len()),
        _ => None,
    }
}

fn function_native(raw: &RawEnv, id: HeapId) -> Result<NativeFunction, Status> {
    match raw.heap.object(id).map(|obj| &obj.kind) {
        Some(ObjectKind::Function { native, .. }) => Ok(*native),
        _ => Err(Status::FunctionExpected),
    }
}

/// # Safety
/// `argv` must be valid for `argc` reads when `argc > 0`.
unsafe fn read_args(raw: &RawEnv, argc: usize, argv: *const napi_value) -> Result<Vec<HeapId>, Status> {
    if argc == 0 {
        return Ok(Vec::new());
    }
    if argv.is_null() {
        return Err(Status::InvalidArg);
    }
    unsafe { std::slice::from_raw_parts(argv, argc) }
        .iter()
        .map(|arg| raw.resolve(*arg))
        .collect()
}

pub(crate) fn alloc_function(heap: &mut Heap, name: String, native: NativeFunction, constructor: bool) -> HeapId {
    heap.alloc_object(ObjectKind::Function {
        name,
        native,
        constructor,
    })
}

// =========================================================================
// Property access
// =========================================================================

/// Arrays are stored densely; larger lengths and indices are rejected.
pub const MAX_ARRAY_LENGTH: usize = 1 << 20;

/// # Safety
/// `env` must be a live environment on its own thread.
unsafe fn get_by_key(env: napi_env, object: HeapId, key: PropertyKey) -> Result<HeapId, Status> {
    let raw = unsafe { env_mut(env) }?;
    if let Some(len) = raw.heap.object(object).and_then(|obj| is_array_length(obj, &key)) {
        return Ok(raw.heap.alloc(HeapValue::Number(len as f64)));
    }
    match lookup(&raw.heap, object, &key) {
        Lookup::Value(value) => Ok(value),
        Lookup::Missing | Lookup::Accessor { getter: None, .. } => Ok(raw.singletons.undefined),
        Lookup::Accessor {
            getter: Some(getter),
            ..
        } => unsafe { invoke_native(env, getter, object, &[], None) },
    }
}

/// # Safety
/// `env` must be a live environment on its own thread.
unsafe fn set_by_key(env: napi_env, object: HeapId, key: PropertyKey, value: HeapId) -> Result<(), Status> {
    let raw = unsafe { env_mut(env) }?;
    let obj = raw.heap.object_mut(object).ok_or(Status::ObjectExpected)?;
    if let (ObjectKind::Array(elements), Some(index)) = (&mut obj.kind, array_index(&key)) {
        if index >= MAX_ARRAY_LENGTH {
            tracing::warn!(index, "array index beyond the dense element limit");
            return Err(Status::InvalidArg);
        }
        if elements.len() <= index {
            elements.resize(index + 1, None);
        }
        elements[index] = Some(value);
        return Ok(());
    }
    if let Some(existing) = obj.find_mut(&key) {
        if let PropertySlot::Data(slot) = &mut existing.slot {
            if existing.attributes.contains(PropertyAttributes::WRITABLE) {
                *slot = value;
            }
            return Ok(());
        }
    }
    match lookup(&raw.heap, object, &key) {
        Lookup::Accessor {
            setter: Some(setter),
            ..
        } => unsafe { invoke_native(env, setter, object, &[value], None) }.map(|_| ()),
        Lookup::Accessor { setter: None, .. } => Ok(()),
        Lookup::Value(_) | Lookup::Missing => {
            let obj = raw.heap.object_mut(object).ok_or(Status::ObjectExpected)?;
            obj.insert(
                key,
                Property {
                    slot: PropertySlot::Data(value),
                    attributes: PropertyAttributes::DEFAULT_JSPROPERTY,
                },
            );
            Ok(())
        }
    }
}

fn has_by_key(raw: &RawEnv, object: HeapId, key: &PropertyKey) -> bool {
    if raw.heap.object(object).and_then(|obj| is_array_length(obj, key)).is_some() {
        return true;
    }
    !matches!(lookup(&raw.heap, object, key), Lookup::Missing)
}

fn delete_by_key(raw: &mut RawEnv, object: HeapId, key: &PropertyKey) -> Result<bool, Status> {
    let obj = raw.heap.object_mut(object).ok_or(Status::ObjectExpected)?;
    if let (ObjectKind::Array(elements), Some(index)) = (&mut obj.kind, array_index(key)) {
        if let Some(slot) = elements.get_mut(index) {
            *slot = None;
        }
        return Ok(true);
    }
    Ok(obj.remove(key))
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_object(env: napi_env, result: *mut napi_value) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let id = raw.heap.alloc_object(ObjectKind::Object);
            *result = raw.push_handle(id);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_array(env: napi_env, result: *mut napi_value) -> napi_status {
    unsafe { napi_create_array_with_length(env, 0, result) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_array_with_length(
    env: napi_env,
    length: usize,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            if length > MAX_ARRAY_LENGTH {
                return Err(Status::InvalidArg);
            }
            let id = raw.heap.alloc_object(ObjectKind::Array(vec![None; length]));
            *result = raw.push_handle(id);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_prototype(env: napi_env, object: napi_value, result: *mut napi_value) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let id = object_id(raw, object)?;
            let proto = raw
                .heap
                .object(id)
                .and_then(|obj| obj.prototype)
                .unwrap_or(raw.singletons.null);
            *result = raw.push_handle(proto);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_set_property(
    env: napi_env,
    object: napi_value,
    key: napi_value,
    value: napi_value,
) -> napi_status {
    unsafe {
        napi_call_reentrant(env, |env| {
            let raw = env_mut(env)?;
            let object = object_id(raw, object)?;
            let key = property_key(raw, key)?;
            let value = raw.resolve(value)?;
            set_by_key(env, object, key, value)
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_property(
    env: napi_env,
    object: napi_value,
    key: napi_value,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call_reentrant(env, |env| {
            let result = out(result)?;
            let raw = env_mut(env)?;
            let object = object_id(raw, object)?;
            let key = property_key(raw, key)?;
            let value = get_by_key(env, object, key)?;
            *result = env_mut(env)?.push_handle(value);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_has_property(
    env: napi_env,
    object: napi_value,
    key: napi_value,
    result: *mut bool,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let object = object_id(raw, object)?;
            let key = property_key(raw, key)?;
            *result = has_by_key(raw, object, &key);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_has_own_property(
    env: napi_env,
    object: napi_value,
    key: napi_value,
    result: *mut bool,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let object = object_id(raw, object)?;
            let key = property_key(raw, key)?;
            let obj = raw.heap.object(object).ok_or(Status::ObjectExpected)?;
            *result = obj.find(&key).is_some()
                || matches!(own_array_slot(obj, &key), Some(Some(_)))
                || is_array_length(obj, &key).is_some();
            Ok(())
        })
    }
}

/// `result`, when given, is false only for a non-configurable property.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_delete_property(
    env: napi_env,
    object: napi_value,
    key: napi_value,
    result: *mut bool,
) -> napi_status {
    unsafe {
        napi_call_preamble(env, |raw| {
            let object = object_id(raw, object)?;
            let key = property_key(raw, key)?;
            let deleted = delete_by_key(raw, object, &key)?;
            if let Some(result) = result.as_mut() {
                *result = deleted;
            }
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_set_named_property(
    env: napi_env,
    object: napi_value,
    utf8name: *const c_char,
    value: napi_value,
) -> napi_status {
    unsafe {
        napi_call_reentrant(env, |env| {
            let raw = env_mut(env)?;
            let object = object_id(raw, object)?;
            let key = PropertyKey::String(read_str(utf8name, NAPI_AUTO_LENGTH)?);
            let value = raw.resolve(value)?;
            set_by_key(env, object, key, value)
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_named_property(
    env: napi_env,
    object: napi_value,
    utf8name: *const c_char,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call_reentrant(env, |env| {
            let result = out(result)?;
            let raw = env_mut(env)?;
            let object = object_id(raw, object)?;
            let key = PropertyKey::String(read_str(utf8name, NAPI_AUTO_LENGTH)?);
            let value = get_by_key(env, object, key)?;
            *result = env_mut(env)?.push_handle(value);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_has_named_property(
    env: napi_env,
    object: napi_value,
    utf8name: *const c_char,
    result: *mut bool,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let object = object_id(raw, object)?;
            let key = PropertyKey::String(read_str(utf8name, NAPI_AUTO_LENGTH)?);
            *result = has_by_key(raw, object, &key);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_set_element(env: napi_env, object: napi_value, index: u32, value: napi_value) -> napi_status {
    unsafe {
        napi_call_reentrant(env, |env| {
            let raw = env_mut(env)?;
            let object = object_id(raw, object)?;
            let value = raw.resolve(value)?;
            set_by_key(env, object, PropertyKey::String(index.to_string()), value)
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_element(
    env: napi_env,
    object: napi_value,
    index: u32,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call_reentrant(env, |env| {
            let result = out(result)?;
            let raw = env_mut(env)?;
            let object = object_id(raw, object)?;
            let value = get_by_key(env, object, PropertyKey::String(index.to_string()))?;
            *result = env_mut(env)?.push_handle(value);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_has_element(env: napi_env, object: napi_value, index: u32, result: *mut bool) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let object = object_id(raw, object)?;
            *result = has_by_key(raw, object, &PropertyKey::String(index.to_string()));
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_delete_element(
    env: napi_env,
    object: napi_value,
    index: u32,
    result: *mut bool,
) -> napi_status {
    unsafe {
        napi_call_preamble(env, |raw| {
            let object = object_id(raw, object)?;
            let deleted = delete_by_key(raw, object, &PropertyKey::String(index.to_string()))?;
            if let Some(result) = result.as_mut() {
                *result = deleted;
            }
            Ok(())
        })
    }
}

/// Enumerable string keys, own first, then inherited; array indices lead.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_property_names(
    env: napi_env,
    object: napi_value,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let mut id = object_id(raw, object)?;
            let mut names: Vec<String> = Vec::new();
            for _ in 0..MAX_PROTOTYPE_DEPTH {
                let Some(obj) = raw.heap.object(id) else { break };
                if let ObjectKind::Array(elements) = &obj.kind {
                    names.extend(
                        elements
                            .iter()
                            .enumerate()
                            .filter(|(_, e)| e.is_some())
                            .map(|(i, _)| i.to_string()),
                    );
                }
                for (key, property) in &obj.properties {
                    if let PropertyKey::String(name) = key {
                        if property.attributes.contains(PropertyAttributes::ENUMERABLE) && !names.contains(name) {
                            names.push(name.clone());
                        }
                    }
                }
                match obj.prototype {
                    Some(parent) => id = parent,
                    None => break,
                }
            }
            let elements = names
                .into_iter()
                .map(|name| Some(raw.heap.alloc(HeapValue::String(name))))
                .collect();
            let array = raw.heap.alloc_object(ObjectKind::Array(elements));
            *result = raw.push_handle(array);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_is_array(env: napi_env, value: napi_value, result: *mut bool) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            *result = matches!(
                raw.value(value)?,
                HeapValue::Object(HeapObject {
                    kind: ObjectKind::Array(_),
                    ..
                })
            );
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_array_length(env: napi_env, value: napi_value, result: *mut u32) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            match raw.value(value)? {
                HeapValue::Object(HeapObject {
                    kind: ObjectKind::Array(elements),
                    ..
                }) => *result = elements.len() as u32,
                _ => return Err(Status::ArrayExpected),
            }
            Ok(())
        })
    }
}

// =========================================================================
// Functions
// =========================================================================

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_function(
    env: napi_env,
    utf8name: *const c_char,
    length: usize,
    cb: napi_callback,
    data: *mut c_void,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let native = NativeFunction::from_raw(cb, data).ok_or(Status::InvalidArg)?;
            let name = if utf8name.is_null() {
                String::new()
            } else {
                read_str(utf8name, length)?
            };
            let id = alloc_function(&mut raw.heap, name, native, false);
            *result = raw.push_handle(id);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_call_function(
    env: napi_env,
    recv: napi_value,
    func: napi_value,
    argc: usize,
    argv: *const napi_value,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call_reentrant(env, |env| {
            let raw = env_mut(env)?;
            let this = if recv.is_null() {
                raw.singletons.undefined
            } else {
                raw.resolve(recv)?
            };
            let native = function_native(raw, raw.resolve(func)?)?;
            let args = read_args(raw, argc, argv)?;
            let value = invoke_native(env, native, this, &args, None)?;
            if let Some(result) = result.as_mut() {
                *result = env_mut(env)?.push_handle(value);
            }
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_new_instance(
    env: napi_env,
    constructor: napi_value,
    argc: usize,
    argv: *const napi_value,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call_reentrant(env, |env| {
            let result = out(result)?;
            let raw = env_mut(env)?;
            let cons = raw.resolve(constructor)?;
            let native = function_native(raw, cons)?;
            let args = read_args(raw, argc, argv)?;
            let prototype = match lookup(&raw.heap, cons, &PropertyKey::String("prototype".into())) {
                Lookup::Value(proto) if raw.heap.object(proto).is_some() => Some(proto),
                _ => None,
            };
            let this = raw.heap.alloc_object(ObjectKind::Object);
            if let Some(obj) = raw.heap.object_mut(this) {
                obj.prototype = prototype;
            }
            let returned = invoke_native(env, native, this, &args, Some(cons))?;
            let raw = env_mut(env)?;
            let instance = if raw.heap.object(returned).is_some() { returned } else { this };
            *result = raw.push_handle(instance);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_instanceof(
    env: napi_env,
    object: napi_value,
    constructor: napi_value,
    result: *mut bool,
) -> napi_status {
    unsafe {
        napi_call_preamble(env, |raw| {
            let result = out(result)?;
            let cons = raw.resolve(constructor)?;
            function_native(raw, cons)?;
            let prototype = match lookup(&raw.heap, cons, &PropertyKey::String("prototype".into())) {
                Lookup::Value(proto) => proto,
                _ => {
                    *result = false;
                    return Ok(());
                }
            };
            let mut current = raw.heap.object(raw.resolve(object)?).and_then(|obj| obj.prototype);
            *result = false;
            for _ in 0..MAX_PROTOTYPE_DEPTH {
                match current {
                    Some(p) if p == prototype => {
                        *result = true;
                        break;
                    }
                    Some(p) => current = raw.heap.object(p).and_then(|obj| obj.prototype),
                    None => break,
                }
            }
            Ok(())
        })
    }
}

/// `argc` is in/out: capacity of `argv` on entry, actual count on return.
/// Unused `argv` slots are filled with `undefined`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_cb_info(
    env: napi_env,
    cbinfo: napi_callback_info,
    argc: *mut usize,
    argv: *mut napi_value,
    this_arg: *mut napi_value,
    data: *mut *mut c_void,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let frame = CallbackFrame::from_raw(cbinfo).ok_or(Status::InvalidArg)?;
            if !argv.is_null() {
                let capacity = *out(argc)?;
                let undefined = raw.push_handle(raw.singletons.undefined);
                for i in 0..capacity {
                    *argv.add(i) = frame.args.get(i).copied().unwrap_or(undefined);
                }
            }
            if let Some(argc) = argc.as_mut() {
                *argc = frame.args.len();
            }
            if let Some(this_arg) = this_arg.as_mut() {
                *this_arg = frame.this;
            }
            if let Some(data) = data.as_mut() {
                *data = frame.data;
            }
            Ok(())
        })
    }
}

/// Null unless the callback runs as a constructor.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_new_target(
    env: napi_env,
    cbinfo: napi_callback_info,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call(env, |_raw| {
            let result = out(result)?;
            let frame = CallbackFrame::from_raw(cbinfo).ok_or(Status::InvalidArg)?;
            *result = frame.new_target;
            Ok(())
        })
    }
}

// =========================================================================
// Batch definitions
// =========================================================================

enum Planned {
    Method(NativeFunction),
    Accessor {
        getter: Option<NativeFunction>,
        setter: Option<NativeFunction>,
    },
    Value(HeapId),
}

struct PlannedProperty {
    key: PropertyKey,
    planned: Planned,
    attributes: PropertyAttributes,
}

/// # Safety
/// `properties` must be valid for `count` reads when `count > 0`.
unsafe fn descriptors<'a>(count: usize, properties: *const napi_property_descriptor) -> Result<&'a [napi_property_descriptor], Status> {
    if count == 0 {
        return Ok(&[]);
    }
    if properties.is_null() {
        return Err(Status::InvalidArg);
    }
    Ok(unsafe { std::slice::from_raw_parts(properties, count) })
}

/// Validate every descriptor; nothing is installed if any one is bad.
fn plan(raw: &RawEnv, descriptors: &[napi_property_descriptor]) -> Result<Vec<PlannedProperty>, Status> {
    descriptors
        .iter()
        .map(|d| {
            let key = if !d.utf8name.is_null() {
                PropertyKey::String(unsafe { read_str(d.utf8name, NAPI_AUTO_LENGTH) }?)
            } else if !d.name.is_null() {
                property_key(raw, d.name)?
            } else {
                return Err(Status::NameExpected);
            };
            let attributes = PropertyAttributes::from_raw(d.attributes);
            let planned = if d.getter.is_some() || d.setter.is_some() {
                if d.method.is_some() || !d.value.is_null() {
                    return Err(Status::InvalidArg);
                }
                Planned::Accessor {
                    getter: NativeFunction::from_raw(d.getter, d.data),
                    setter: NativeFunction::from_raw(d.setter, d.data),
                }
            } else if let Some(method) = NativeFunction::from_raw(d.method, d.data) {
                if !d.value.is_null() {
                    return Err(Status::InvalidArg);
                }
                Planned::Method(method)
            } else if d.value.is_null() {
                Planned::Value(raw.singletons.undefined)
            } else {
                Planned::Value(raw.resolve(d.value)?)
            };
            Ok(PlannedProperty {
                key,
                planned,
                attributes,
            })
        })
        .collect()
}

fn install(heap: &mut Heap, target: HeapId, property: PlannedProperty) {
    let PlannedProperty {
        key,
        planned,
        attributes,
    } = property;
    let attributes = attributes.without(PropertyAttributes::STATIC);
    let slot = match planned {
        Planned::Method(native) => {
            let name = match &key {
                PropertyKey::String(s) => s.clone(),
                PropertyKey::Symbol(_) => String::new(),
            };
            PropertySlot::Data(alloc_function(heap, name, native, false))
        }
        Planned::Accessor { getter, setter } => PropertySlot::Accessor { getter, setter },
        Planned::Value(value) => PropertySlot::Data(value),
    };
    let attributes = match slot {
        PropertySlot::Accessor { .. } => attributes.without(PropertyAttributes::WRITABLE),
        PropertySlot::Data(_) => attributes,
    };
    if let Some(obj) = heap.object_mut(target) {
        obj.insert(key, Property { slot, attributes });
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_define_properties(
    env: napi_env,
    object: napi_value,
    property_count: usize,
    properties: *const napi_property_descriptor,
) -> napi_status {
    unsafe {
        napi_call_preamble(env, |raw| {
            let target = object_id(raw, object)?;
            let planned = plan(raw, descriptors(property_count, properties)?)?;
            tracing::debug!(count = planned.len(), "defining properties");
            for property in planned {
                install(&mut raw.heap, target, property);
            }
            Ok(())
        })
    }
}

/// Static descriptors land on the constructor, the rest on its prototype.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_define_class(
    env: napi_env,
    utf8name: *const c_char,
    length: usize,
    constructor: napi_callback,
    data: *mut c_void,
    property_count: usize,
    properties: *const napi_property_descriptor,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call_preamble(env, |raw| {
            let result = out(result)?;
            let native = NativeFunction::from_raw(constructor, data).ok_or(Status::InvalidArg)?;
            let name = read_str(utf8name, length)?;
            let planned = plan(raw, descriptors(property_count, properties)?)?;

            let cons = alloc_function(&mut raw.heap, name.clone(), native, true);
            let prototype = raw.heap.alloc_object(ObjectKind::Object);
            if let Some(obj) = raw.heap.object_mut(cons) {
                obj.insert(
                    PropertyKey::String("prototype".into()),
                    Property {
                        slot: PropertySlot::Data(prototype),
                        attributes: PropertyAttributes::WRITABLE,
                    },
                );
            }
            if let Some(obj) = raw.heap.object_mut(prototype) {
                obj.insert(
                    PropertyKey::String("constructor".into()),
                    Property {
                        slot: PropertySlot::Data(cons),
                        attributes: PropertyAttributes::WRITABLE | PropertyAttributes::CONFIGURABLE,
                    },
                );
            }
            for property in planned {
                let target = if property.attributes.contains(PropertyAttributes::STATIC) {
                    cons
                } else {
                    prototype
                };
                install(&mut raw.heap, target, property);
            }
            tracing::debug!(class = %name, "class defined");
            *result = raw.push_handle(cons);
            Ok(())
        })
    }
}

// =========================================================================
// Wrapping, externals and finalizers
// =========================================================================

fn weak_reference_out(raw: &mut RawEnv, target: HeapId, result: *mut napi_ref) {
    if let Some(result) = unsafe { result.as_mut() } {
        *result = raw.create_reference(target, 0) as *mut napi_ref__;
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_wrap(
    env: napi_env,
    js_object: napi_value,
    native_object: *mut c_void,
    finalize_cb: napi_finalize,
    finalize_hint: *mut c_void,
    result: *mut napi_ref,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let target = object_id(raw, js_object)?;
            let obj = raw.heap.object_mut(target).ok_or(Status::ObjectExpected)?;
            if obj.wrap.is_some() {
                return Err(Status::InvalidArg);
            }
            obj.wrap = Some((native_object, Finalizer::from_raw(finalize_cb, native_object, finalize_hint)));
            weak_reference_out(raw, target, result);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_unwrap(env: napi_env, js_object: napi_value, result: *mut *mut c_void) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let target = object_id(raw, js_object)?;
            let (native, _) = raw
                .heap
                .object(target)
                .and_then(|obj| obj.wrap)
                .ok_or(Status::InvalidArg)?;
            *result = native;
            Ok(())
        })
    }
}

/// Detach the native pointer without running its finalizer.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_remove_wrap(env: napi_env, js_object: napi_value, result: *mut *mut c_void) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let target = object_id(raw, js_object)?;
            let (native, _) = raw
                .heap
                .object_mut(target)
                .and_then(|obj| obj.wrap.take())
                .ok_or(Status::InvalidArg)?;
            if let Some(result) = result.as_mut() {
                *result = native;
            }
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_create_external(
    env: napi_env,
    data: *mut c_void,
    finalize_cb: napi_finalize,
    finalize_hint: *mut c_void,
    result: *mut napi_value,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            let id = raw.heap.alloc_object(ObjectKind::External(data));
            if let Some(finalizer) = Finalizer::from_raw(finalize_cb, data, finalize_hint) {
                if let Some(obj) = raw.heap.object_mut(id) {
                    obj.finalizers.push(finalizer);
                }
            }
            *result = raw.push_handle(id);
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_get_value_external(
    env: napi_env,
    value: napi_value,
    result: *mut *mut c_void,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let result = out(result)?;
            match raw.value(value)? {
                HeapValue::Object(HeapObject {
                    kind: ObjectKind::External(data),
                    ..
                }) => *result = *data,
                _ => return Err(Status::InvalidArg),
            }
            Ok(())
        })
    }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn napi_add_finalizer(
    env: napi_env,
    js_object: napi_value,
    finalize_data: *mut c_void,
    finalize_cb: napi_finalize,
    finalize_hint: *mut c_void,
    result: *mut napi_ref,
) -> napi_status {
    unsafe {
        napi_call(env, |raw| {
            let finalizer =
                Finalizer::from_raw(finalize_cb, finalize_data, finalize_hint).ok_or(Status::InvalidArg)?;
            let target = object_id(raw, js_object)?;
            raw.heap
                .object_mut(target)
                .ok_or(Status::ObjectExpected)?
                .finalizers
                .push(finalizer);
            weak_reference_out(raw, target, result);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::r#async::{OwnedEnv, Runtime, RuntimeConfig};
    use crate::runtime::stubs::*;
    use std::ptr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig {
            worker_threads: 1,
            gc_threshold: 1024,
        })
        .unwrap()
    }

    unsafe fn num(env: &OwnedEnv, n: f64) -> napi_value {
        let mut v = ptr::null_mut();
        assert_eq!(unsafe { napi_create_double(env.raw(), n, &mut v) }, 0);
        v
    }

    unsafe fn read_num(env: &OwnedEnv, v: napi_value) -> f64 {
        let mut n = 0.0;
        assert_eq!(unsafe { napi_get_value_double(env.raw(), v, &mut n) }, 0);
        n
    }

    unsafe extern "C" fn forty_two(env: napi_env, _info: napi_callback_info) -> napi_value {
        let mut v = ptr::null_mut();
        unsafe { napi_create_int32(env, 42, &mut v) };
        v
    }

    unsafe extern "C" fn first_arg(env: napi_env, info: napi_callback_info) -> napi_value {
        let mut argc = 1usize;
        let mut argv = [ptr::null_mut(); 1];
        unsafe { napi_get_cb_info(env, info, &mut argc, argv.as_mut_ptr(), ptr::null_mut(), ptr::null_mut()) };
        argv[0]
    }

    unsafe extern "C" fn thrower(env: napi_env, _info: napi_callback_info) -> napi_value {
        unsafe { napi_throw_error(env, ptr::null(), c"nope".as_ptr()) };
        ptr::null_mut()
    }

    #[test]
    fn test_named_properties_round_trip() {
        let rt = runtime();
        let env = rt.create_env();
        let e = env.raw();
        unsafe {
            let mut obj = ptr::null_mut();
            napi_create_object(e, &mut obj);
            let v = num(&env, 3.5);
            assert_eq!(napi_set_named_property(e, obj, c"x".as_ptr(), v), 0);

            let mut has = false;
            napi_has_named_property(e, obj, c"x".as_ptr(), &mut has);
            assert!(has);

            let mut got = ptr::null_mut();
            assert_eq!(napi_get_named_property(e, obj, c"x".as_ptr(), &mut got), 0);
            assert_eq!(read_num(&env, got), 3.5);

            napi_get_named_property(e, obj, c"missing".as_ptr(), &mut got);
            let mut t = 0;
            napi_typeof(e, got, &mut t);
            assert_eq!(t, crate::runtime::abi::napi_undefined);
        }
    }

    #[test]
    fn test_elements_and_length() {
        let rt = runtime();
        let env = rt.create_env();
        let e = env.raw();
        unsafe {
            let mut arr = ptr::null_mut();
            napi_create_array(e, &mut arr);
            let v = num(&env, 1.0);
            assert_eq!(napi_set_element(e, arr, 2, v), 0);
            let mut len = 0;
            assert_eq!(napi_get_array_length(e, arr, &mut len), 0);
            assert_eq!(len, 3);

            let mut has = true;
            napi_has_element(e, arr, 0, &mut has);
            assert!(!has);

            let mut obj = ptr::null_mut();
            napi_create_object(e, &mut obj);
            assert_eq!(napi_get_array_length(e, obj, &mut len), Status::ArrayExpected.as_raw());
        }
    }

    #[test]
    fn test_huge_array_lengths_are_rejected() {
        let rt = runtime();
        let env = rt.create_env();
        let e = env.raw();
        unsafe {
            let mut arr = ptr::null_mut();
            assert_eq!(napi_create_array_with_length(e, usize::MAX, &mut arr), Status::InvalidArg.as_raw());
            assert!(arr.is_null());

            napi_create_array(e, &mut arr);
            let v = num(&env, 1.0);
            assert_eq!(napi_set_element(e, arr, 4_000_000_000, v), Status::InvalidArg.as_raw());
            let mut len = 1;
            assert_eq!(napi_get_array_length(e, arr, &mut len), 0);
            assert_eq!(len, 0);
        }
    }

    #[test]
    fn test_call_function_and_pending_exception_preamble() {
        let rt = runtime();
        let env = rt.create_env();
        let e = env.raw();
        unsafe {
            let mut echo = ptr::null_mut();
            assert_eq!(napi_create_function(e, c"echo".as_ptr(), NAPI_AUTO_LENGTH, Some(first_arg), ptr::null_mut(), &mut echo), 0);
            let arg = num(&env, 9.0);
            let mut out_v = ptr::null_mut();
            assert_eq!(napi_call_function(e, ptr::null_mut(), echo, 1, &arg, &mut out_v), 0);
            assert_eq!(read_num(&env, out_v), 9.0);

            let mut bad = ptr::null_mut();
            napi_create_function(e, ptr::null(), 0, Some(thrower), ptr::null_mut(), &mut bad);
            assert_eq!(
                napi_call_function(e, ptr::null_mut(), bad, 0, ptr::null(), &mut out_v),
                Status::PendingException.as_raw()
            );
            // Refused while the exception is pending.
            assert_eq!(
                napi_call_function(e, ptr::null_mut(), echo, 1, &arg, &mut out_v),
                Status::PendingException.as_raw()
            );
            let mut err = ptr::null_mut();
            napi_get_and_clear_last_exception(e, &mut err);
            assert_eq!(napi_call_function(e, ptr::null_mut(), echo, 1, &arg, &mut out_v), 0);
        }
    }

    #[test]
    fn test_define_properties_is_all_or_nothing() {
        let rt = runtime();
        let env = rt.create_env();
        let e = env.raw();
        unsafe {
            let mut obj = ptr::null_mut();
            napi_create_object(e, &mut obj);
            let good = napi_property_descriptor {
                utf8name: c"answer".as_ptr(),
                method: Some(forty_two),
                attributes: crate::runtime::abi::napi_default_method,
                ..Default::default()
            };
            let nameless = napi_property_descriptor {
                method: Some(forty_two),
                ..Default::default()
            };
            let batch = [good, nameless];
            assert_eq!(napi_define_properties(e, obj, 2, batch.as_ptr()), Status::NameExpected.as_raw());
            let mut has = true;
            napi_has_named_property(e, obj, c"answer".as_ptr(), &mut has);
            assert!(!has);

            assert_eq!(napi_define_properties(e, obj, 1, &good), 0);
            let mut func = ptr::null_mut();
            napi_get_named_property(e, obj, c"answer".as_ptr(), &mut func);
            let mut out_v = ptr::null_mut();
            assert_eq!(napi_call_function(e, obj, func, 0, ptr::null(), &mut out_v), 0);
            assert_eq!(read_num(&env, out_v), 42.0);
        }
    }

    #[test]
    fn test_getter_runs_on_property_read() {
        let rt = runtime();
        let env = rt.create_env();
        let e = env.raw();
        unsafe {
            let mut obj = ptr::null_mut();
            napi_create_object(e, &mut obj);
            let desc = napi_property_descriptor {
                utf8name: c"value".as_ptr(),
                getter: Some(forty_two),
                ..Default::default()
            };
            assert_eq!(napi_define_properties(e, obj, 1, &desc), 0);
            let mut got = ptr::null_mut();
            assert_eq!(napi_get_named_property(e, obj, c"value".as_ptr(), &mut got), 0);
            assert_eq!(read_num(&env, got), 42.0);
        }
    }

    #[test]
    fn test_define_class_and_instanceof() {
        let rt = runtime();
        let env = rt.create_env();
        let e = env.raw();
        unsafe {
            let method = napi_property_descriptor {
                utf8name: c"answer".as_ptr(),
                method: Some(forty_two),
                ..Default::default()
            };
            let stat = napi_property_descriptor {
                utf8name: c"create".as_ptr(),
                method: Some(forty_two),
                attributes: crate::runtime::abi::napi_static,
                ..Default::default()
            };
            let props = [method, stat];
            let mut class = ptr::null_mut();
            assert_eq!(
                napi_define_class(e, c"Thing".as_ptr(), NAPI_AUTO_LENGTH, Some(first_arg), ptr::null_mut(), 2, props.as_ptr(), &mut class),
                0
            );
            let mut instance = ptr::null_mut();
            assert_eq!(napi_new_instance(e, class, 0, ptr::null(), &mut instance), 0);

            let mut is = false;
            assert_eq!(napi_instanceof(e, instance, class, &mut is), 0);
            assert!(is);

            let mut has = false;
            napi_has_named_property(e, instance, c"answer".as_ptr(), &mut has);
            assert!(has);
            napi_has_own_property(e, instance, num(&env, 0.0), &mut has);
            assert!(!has);
            napi_has_named_property(e, class, c"create".as_ptr(), &mut has);
            assert!(has);
            napi_has_named_property(e, instance, c"create".as_ptr(), &mut has);
            assert!(!has);
        }
    }

    static FINALIZED: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn count_finalize(_env: napi_env, _data: *mut c_void, _hint: *mut c_void) {
        FINALIZED.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_wrap_unwrap_and_finalize_on_collection() {
        let rt = runtime();
        let env = rt.create_env();
        let e = env.raw();
        let mut native = 5u32;
        let before = FINALIZED.load(Ordering::SeqCst);
        unsafe {
            let mut scope = ptr::null_mut();
            napi_open_handle_scope(e, &mut scope);
            let mut obj = ptr::null_mut();
            napi_create_object(e, &mut obj);
            let ptr_native = &mut native as *mut u32 as *mut c_void;
            let mut weak = ptr::null_mut();
            assert_eq!(napi_wrap(e, obj, ptr_native, Some(count_finalize), ptr::null_mut(), &mut weak), 0);
            assert_eq!(
                napi_wrap(e, obj, ptr_native, None, ptr::null_mut(), ptr::null_mut()),
                Status::InvalidArg.as_raw()
            );
            let mut got = ptr::null_mut();
            assert_eq!(napi_unwrap(e, obj, &mut got), 0);
            assert_eq!(got, ptr_native);
            napi_close_handle_scope(e, scope);

            env.collect_garbage();
            assert_eq!(FINALIZED.load(Ordering::SeqCst), before + 1);

            let mut value = ptr::null_mut();
            assert_eq!(napi_get_reference_value(e, weak, &mut value), 0);
            assert!(value.is_null());
            assert_eq!(napi_delete_reference(e, weak), 0);
        }
    }
}
