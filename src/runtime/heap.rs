//! Value heap for the embedding runtime
//!
//! Every runtime value (primitives included) lives in a slot of the heap and
//! is addressed by a generation-checked [`HeapId`]. Value handles handed across
//! the ABI point at handle-table entries which in turn hold `HeapId`s, so a
//! collected slot that gets reused is never confused with the old value.
//!
//! Collection is a plain mark/sweep over the roots the environment supplies
//! (open handle scopes, strong references, pending exception, singletons).
//! Finalizers of swept objects are handed back to the caller instead of being
//! run here, since they re-enter the native surface.

use std::ffi::c_void;

use super::abi::{napi_callback, napi_finalize, PropertyAttributes, ValueType};

/// Generation-checked index of a heap slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapId {
    index: u32,
    generation: u32,
}

impl HeapId {
    #[inline]
    pub fn index(self) -> usize {
        self.index as usize
    }
}

/// A native callback plus the opaque data pointer it is invoked with.
#[derive(Clone, Copy, Debug)]
pub struct NativeFunction {
    pub callback: unsafe extern "C" fn(
        super::abi::napi_env,
        super::abi::napi_callback_info,
    ) -> super::abi::napi_value,
    pub data: *mut c_void,
}

impl NativeFunction {
    pub fn from_raw(callback: napi_callback, data: *mut c_void) -> Option<Self> {
        callback.map(|callback| Self { callback, data })
    }
}

/// A finalizer registered against an object; runs once when it is collected.
#[derive(Clone, Copy, Debug)]
pub struct Finalizer {
    pub callback: unsafe extern "C" fn(super::abi::napi_env, *mut c_void, *mut c_void),
    pub data: *mut c_void,
    pub hint: *mut c_void,
}

impl Finalizer {
    pub fn from_raw(callback: napi_finalize, data: *mut c_void, hint: *mut c_void) -> Option<Self> {
        callback.map(|callback| Self {
            callback,
            data,
            hint,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyKey {
    String(String),
    Symbol(HeapId),
}

#[derive(Clone, Debug)]
pub enum PropertySlot {
    Data(HeapId),
    Accessor {
        getter: Option<NativeFunction>,
        setter: Option<NativeFunction>,
    },
}

#[derive(Clone, Debug)]
pub struct Property {
    pub slot: PropertySlot,
    pub attributes: PropertyAttributes,
}

/// Own properties in insertion order.
pub type PropertyMap = Vec<(PropertyKey, Property)>;

#[derive(Debug)]
pub enum ObjectKind {
    Object,
    Array(Vec<Option<HeapId>>),
    Error,
    Function {
        name: String,
        native: NativeFunction,
        constructor: bool,
    },
    External(*mut c_void),
}

/// Any non-primitive value.
#[derive(Debug)]
pub struct HeapObject {
    pub kind: ObjectKind,
    pub properties: PropertyMap,
    pub prototype: Option<HeapId>,
    /// Native pointer attached with `napi_wrap`, with its optional finalizer.
    pub wrap: Option<(*mut c_void, Option<Finalizer>)>,
    pub finalizers: Vec<Finalizer>,
}

impl HeapObject {
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            properties: PropertyMap::new(),
            prototype: None,
            wrap: None,
            finalizers: Vec::new(),
        }
    }

    pub fn find(&self, key: &PropertyKey) -> Option<&Property> {
        self.properties.iter().find(|(k, _)| k == key).map(|(_, p)| p)
    }

    pub fn find_mut(&mut self, key: &PropertyKey) -> Option<&mut Property> {
        self.properties
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, p)| p)
    }

    pub fn insert(&mut self, key: PropertyKey, property: Property) {
        match self.find_mut(&key) {
            Some(existing) => *existing = property,
            None => self.properties.push((key, property)),
        }
    }

    pub fn remove(&mut self, key: &PropertyKey) -> bool {
        let before = self.properties.len();
        self.properties.retain(|(k, p)| {
            k != key || !p.attributes.contains(PropertyAttributes::CONFIGURABLE)
        });
        before != self.properties.len() || self.find(key).is_none()
    }

    pub fn is_function(&self) -> bool {
        matches!(self.kind, ObjectKind::Function { .. })
    }

    /// Take every finalizer owned by this object, wrap finalizer first.
    fn take_finalizers(&mut self) -> Vec<Finalizer> {
        let mut out = Vec::new();
        if let Some((_, Some(finalizer))) = self.wrap.take() {
            out.push(finalizer);
        }
        out.append(&mut self.finalizers);
        out
    }
}

#[derive(Debug)]
pub enum HeapValue {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Symbol(Option<String>),
    Object(HeapObject),
}

impl HeapValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            HeapValue::Undefined => ValueType::Undefined,
            HeapValue::Null => ValueType::Null,
            HeapValue::Boolean(_) => ValueType::Boolean,
            HeapValue::Number(_) => ValueType::Number,
            HeapValue::String(_) => ValueType::String,
            HeapValue::Symbol(_) => ValueType::Symbol,
            HeapValue::Object(obj) => match obj.kind {
                ObjectKind::Function { .. } => ValueType::Function,
                ObjectKind::External(_) => ValueType::External,
                _ => ValueType::Object,
            },
        }
    }

    pub fn as_object(&self) -> Option<&HeapObject> {
        match self {
            HeapValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut HeapObject> {
        match self {
            HeapValue::Object(obj) => Some(obj),
            _ => None,
        }
    }
}

struct Slot {
    generation: u32,
    marked: bool,
    value: Option<HeapValue>,
}

/// Slot allocator with a free list and mark/sweep collection.
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn alloc(&mut self, value: HeapValue) -> HeapId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            slot.marked = false;
            return HeapId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            marked: false,
            value: Some(value),
        });
        HeapId {
            index,
            generation: 0,
        }
    }

    pub fn alloc_object(&mut self, kind: ObjectKind) -> HeapId {
        self.alloc(HeapValue::Object(HeapObject::new(kind)))
    }

    pub fn get(&self, id: HeapId) -> Option<&HeapValue> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_ref())
    }

    pub fn get_mut(&mut self, id: HeapId) -> Option<&mut HeapValue> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.value.as_mut())
    }

    pub fn object(&self, id: HeapId) -> Option<&HeapObject> {
        self.get(id).and_then(HeapValue::as_object)
    }

    pub fn object_mut(&mut self, id: HeapId) -> Option<&mut HeapObject> {
        self.get_mut(id).and_then(HeapValue::as_object_mut)
    }

    pub fn is_live(&self, id: HeapId) -> bool {
        self.get(id).is_some()
    }

    /// Number of occupied slots.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Mark everything reachable from `roots`, free the rest, and return the
    /// finalizers of freed objects in collection order.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = HeapId>) -> Vec<Finalizer> {
        let mut stack: Vec<HeapId> = roots.into_iter().collect();
        while let Some(id) = stack.pop() {
            let Some(slot) = self.slots.get_mut(id.index()) else {
                continue;
            };
            if slot.generation != id.generation || slot.marked || slot.value.is_none() {
                continue;
            }
            slot.marked = true;
            if let Some(HeapValue::Object(obj)) = &slot.value {
                stack.extend(obj.prototype);
                for (key, property) in &obj.properties {
                    if let PropertyKey::Symbol(sym) = key {
                        stack.push(*sym);
                    }
                    if let PropertySlot::Data(value) = property.slot {
                        stack.push(value);
                    }
                }
                if let ObjectKind::Array(elements) = &obj.kind {
                    stack.extend(elements.iter().flatten().copied());
                }
            }
        }

        let mut finalizers = Vec::new();
        let mut freed = 0usize;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.value.is_none() {
                continue;
            }
            if slot.marked {
                slot.marked = false;
                continue;
            }
            if let Some(HeapValue::Object(mut obj)) = slot.value.take() {
                finalizers.extend(obj.take_finalizers());
            }
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(index as u32);
            freed += 1;
        }
        self.live -= freed;
        tracing::debug!(freed, live = self.live, "heap collection finished");
        finalizers
    }

    /// Remove every finalizer still attached to a live object. Used on teardown.
    pub fn drain_finalizers(&mut self) -> Vec<Finalizer> {
        let mut out = Vec::new();
        for slot in &mut self.slots {
            if let Some(HeapValue::Object(obj)) = &mut slot.value {
                out.extend(obj.take_finalizers());
            }
        }
        out
    }
}
