//! Property and class descriptors
//!
//! [`Property`] is a builder for one named capability. A slice of them is
//! lowered into native descriptors by [`build_descriptors`]: every method,
//! getter and setter is registered first, and each descriptor carries only a
//! trampoline pointer plus its registration tag as data. The whole batch is
//! then handed to the runtime in a single define call.

use std::ffi::CString;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result, Status};
use crate::runtime::abi::PropertyAttributes;
use crate::runtime::sys::napi_property_descriptor;

use super::env::{CallInfo, Env, Value, c_string};
use super::registry::{Callback, Handler, Registration};
use super::trampoline;

#[derive(Clone, Debug)]
enum PropertyName {
    Utf8(String),
    Value(Value),
}

#[derive(Clone)]
pub struct Property {
    name: PropertyName,
    method: Option<Callback>,
    getter: Option<Callback>,
    setter: Option<Callback>,
    value: Option<Value>,
    attributes: PropertyAttributes,
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("method", &self.method.is_some())
            .field("getter", &self.getter.is_some())
            .field("setter", &self.setter.is_some())
            .field("value", &self.value)
            .field("attributes", &self.attributes)
            .finish()
    }
}

impl Property {
    pub fn new(name: &str) -> Self {
        Self::named(PropertyName::Utf8(name.to_owned()))
    }

    /// Keyed by a string or symbol value instead of a UTF-8 name.
    pub fn with_name_value(name: Value) -> Self {
        Self::named(PropertyName::Value(name))
    }

    fn named(name: PropertyName) -> Self {
        Self {
            name,
            method: None,
            getter: None,
            setter: None,
            value: None,
            attributes: PropertyAttributes::DEFAULT,
        }
    }

    pub fn with_method<F>(mut self, method: F) -> Self
    where
        F: Fn(&CallInfo) -> Result<Value> + Send + Sync + 'static,
    {
        self.method = Some(Arc::new(method));
        self
    }

    pub fn with_getter<F>(mut self, getter: F) -> Self
    where
        F: Fn(&CallInfo) -> Result<Value> + Send + Sync + 'static,
    {
        self.getter = Some(Arc::new(getter));
        self
    }

    /// The new value is argument 0 of the call.
    pub fn with_setter<F>(mut self, setter: F) -> Self
    where
        F: Fn(&CallInfo) -> Result<Value> + Send + Sync + 'static,
    {
        self.setter = Some(Arc::new(setter));
        self
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_attributes(mut self, attributes: PropertyAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Class properties only: install on the constructor instead of the
    /// prototype.
    pub fn static_property(mut self) -> Self {
        self.attributes = self.attributes | PropertyAttributes::STATIC;
        self
    }

    pub fn attributes(&self) -> PropertyAttributes {
        self.attributes
    }

    fn name_for_errors(&self) -> String {
        match &self.name {
            PropertyName::Utf8(name) => name.clone(),
            PropertyName::Value(value) => format!("{value:?}"),
        }
    }
}

/// Lowered descriptors plus everything their raw pointers borrow from.
///
/// `raw` is only valid while `names` and `registrations` are alive.
#[derive(Debug)]
pub struct Descriptors {
    pub(crate) names: Vec<CString>,
    pub(crate) registrations: Vec<Registration>,
    pub(crate) raw: Vec<napi_property_descriptor>,
}

impl Descriptors {
    pub(crate) fn build(env: Env, properties: &[Property]) -> Result<Self> {
        let mut names = Vec::new();
        let mut registrations = Vec::new();
        let mut raw = Vec::with_capacity(properties.len());

        for property in properties {
            let accessor = property.getter.is_some() || property.setter.is_some();
            if accessor && (property.method.is_some() || property.value.is_some())
                || property.method.is_some() && property.value.is_some()
            {
                return Err(Error::new(
                    Status::InvalidArg,
                    format!("property {} mixes a value, a method and accessors", property.name_for_errors()),
                ));
            }

            let mut descriptor = napi_property_descriptor {
                attributes: property.attributes.bits(),
                ..Default::default()
            };
            match &property.name {
                PropertyName::Utf8(name) => {
                    let name = c_string(name)?;
                    descriptor.utf8name = name.as_ptr();
                    names.push(name);
                }
                PropertyName::Value(value) => descriptor.name = value.raw(),
            }

            if let Some(method) = &property.method {
                let registration = Registration::new(Handler::Method(method.clone()));
                descriptor.method = Some(trampoline::call_trampoline);
                descriptor.data = registration.as_ptr();
                registrations.push(registration);
            } else if accessor {
                let registration = Registration::new(Handler::Accessor {
                    getter: property.getter.clone(),
                    setter: property.setter.clone(),
                });
                if property.getter.is_some() {
                    descriptor.getter = Some(trampoline::getter_trampoline);
                }
                if property.setter.is_some() {
                    descriptor.setter = Some(trampoline::setter_trampoline);
                }
                descriptor.data = registration.as_ptr();
                registrations.push(registration);
            } else {
                descriptor.value = match property.value {
                    Some(value) => value.raw(),
                    None => env.get_undefined()?.raw(),
                };
            }
            raw.push(descriptor);
        }

        tracing::debug!(count = raw.len(), handlers = registrations.len(), "descriptors built");
        Ok(Self {
            names,
            registrations,
            raw,
        })
    }

    pub fn as_raw(&self) -> &[napi_property_descriptor] {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Registrations backing the method and accessor descriptors.
    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }
}

/// Register every handler in `properties` and lower them to native
/// descriptors, ready for a single define call.
pub fn build_descriptors(env: Env, properties: &[Property]) -> Result<Descriptors> {
    Descriptors::build(env, properties)
}
