//! Conversion of host data into VM values.
//!
//! [`to_host_value`] runs a serde pass on the calling thread and produces a
//! [`HostValue`] tree; [`materialize`] turns that tree into V8 handles on the
//! isolate thread.

use crate::runtime::callback;
use crate::runtime::context::Context;
use crate::runtime::error::{Error, MarshalError, Result};
use crate::runtime::js_value::{HostValue, LimitTracker, MAX_JS_DEPTH};
use crate::runtime::placeholder::{self, Placeholder, StashScope, DATE_TOKEN, FUNCTION_TOKEN, VALUE_TOKEN};
use crate::runtime::runner;
use indexmap::IndexMap;
use serde::ser::{self, Serialize};

/// Serialize `value` into a [`HostValue`] destined for `context`.
pub(crate) fn to_host_value<T: Serialize + ?Sized>(
    context: &Context,
    value: &T,
) -> std::result::Result<HostValue, MarshalError> {
    let _stash = StashScope::enter();
    let mut marshaller = Marshaller {
        context,
        tracker: LimitTracker::new(MAX_JS_DEPTH),
    };
    value.serialize(&mut marshaller)
}

/// Build the VM value described by `host` in the entered context.
pub(crate) fn materialize<'s>(
    scope: &mut rusty_v8::HandleScope<'s>,
    host: HostValue,
) -> Result<rusty_v8::Local<'s, rusty_v8::Value>> {
    let value: rusty_v8::Local<rusty_v8::Value> = match host {
        HostValue::Undefined => rusty_v8::undefined(scope).into(),
        HostValue::Null => rusty_v8::null(scope).into(),
        HostValue::Bool(value) => rusty_v8::Boolean::new(scope, value).into(),
        HostValue::Number(value) => rusty_v8::Number::new(scope, value).into(),
        HostValue::String(value) => runner::new_string(scope, &value)?.into(),
        HostValue::Date(millis) => rusty_v8::Date::new(scope, millis)
            .ok_or_else(|| Error::Engine("Failed to create Date".to_string()))?
            .into(),
        HostValue::Bytes(bytes) if bytes.is_empty() => rusty_v8::ArrayBuffer::new(scope, 0).into(),
        HostValue::Bytes(bytes) => {
            let store = rusty_v8::ArrayBuffer::new_backing_store_from_vec(bytes).make_shared();
            rusty_v8::ArrayBuffer::with_backing_store(scope, &store).into()
        }
        HostValue::Array(items) => {
            let elements = items
                .into_iter()
                .map(|item| materialize(scope, item))
                .collect::<Result<Vec<_>>>()?;
            rusty_v8::Array::new_with_elements(scope, &elements).into()
        }
        HostValue::Object(entries) => {
            let object = rusty_v8::Object::new(scope);
            for (key, value) in entries {
                let name = runner::new_string(scope, &key)?;
                let value = materialize(scope, value)?;
                object
                    .create_data_property(scope, name.into(), value)
                    .ok_or_else(|| Error::Engine(format!("Failed to set property '{}'", key)))?;
            }
            object.into()
        }
        HostValue::Function { name, token } => callback::new_function(scope, &name, &token)?.into(),
        HostValue::Existing { slot } => runner::value_local(scope, slot)?,
    };
    Ok(value)
}

struct Marshaller<'c> {
    context: &'c Context,
    tracker: LimitTracker,
}

impl Marshaller<'_> {
    fn nested<T: Serialize + ?Sized>(&mut self, value: &T) -> std::result::Result<HostValue, MarshalError> {
        self.tracker.enter()?;
        let result = value.serialize(&mut *self);
        self.tracker.exit();
        result
    }

    /// Resolve a placeholder whose stash index was serialized as `payload`.
    fn placeholder(&mut self, payload: HostValue) -> std::result::Result<HostValue, MarshalError> {
        let index = match payload {
            HostValue::Number(index) => index as u64,
            other => return Err(MarshalError::Custom(format!(
                "Malformed placeholder payload: {}",
                other.kind_name()
            ))),
        };
        match placeholder::take(index).ok_or(MarshalError::StalePlaceholder(index))? {
            Placeholder::Value { released: true, .. } => Err(MarshalError::ReleasedValue),
            Placeholder::Value { isolate, slot, .. } => {
                if isolate != self.context.isolate().id() {
                    return Err(MarshalError::ForeignIsolate);
                }
                Ok(HostValue::Existing { slot })
            }
            Placeholder::Function(function) => {
                let name = function.name().to_string();
                let token = self.context.register_callback(function);
                Ok(HostValue::Function { name, token })
            }
        }
    }
}

impl<'a, 'c> ser::Serializer for &'a mut Marshaller<'c> {
    type Ok = HostValue;
    type Error = MarshalError;

    type SerializeSeq = SerializeVec<'a, 'c>;
    type SerializeTuple = SerializeVec<'a, 'c>;
    type SerializeTupleStruct = SerializeVec<'a, 'c>;
    type SerializeTupleVariant = SerializeTupleVariant<'a, 'c>;
    type SerializeMap = SerializeObject<'a, 'c>;
    type SerializeStruct = SerializeObject<'a, 'c>;
    type SerializeStructVariant = SerializeStructVariant<'a, 'c>;

    fn serialize_bool(self, v: bool) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Number(v.into()))
    }

    fn serialize_i16(self, v: i16) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Number(v.into()))
    }

    fn serialize_i32(self, v: i32) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Number(v.into()))
    }

    fn serialize_i64(self, v: i64) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Number(v as f64))
    }

    fn serialize_i128(self, v: i128) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Number(v as f64))
    }

    fn serialize_u8(self, v: u8) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Number(v.into()))
    }

    fn serialize_u16(self, v: u16) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Number(v.into()))
    }

    fn serialize_u32(self, v: u32) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Number(v.into()))
    }

    fn serialize_u64(self, v: u64) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Number(v as f64))
    }

    fn serialize_u128(self, v: u128) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Number(v as f64))
    }

    fn serialize_f32(self, v: f32) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Number(v.into()))
    }

    fn serialize_f64(self, v: f64) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Number(v))
    }

    fn serialize_char(self, v: char) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::String(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::String(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Bytes(v.to_vec()))
    }

    fn serialize_none(self) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Undefined)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> std::result::Result<HostValue, MarshalError> {
        self.nested(value)
    }

    fn serialize_unit(self) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Undefined)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::Object(IndexMap::new()))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> std::result::Result<HostValue, MarshalError> {
        Ok(HostValue::String(variant.to_string()))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        value: &T,
    ) -> std::result::Result<HostValue, MarshalError> {
        let inner = self.nested(value)?;
        match name {
            VALUE_TOKEN | FUNCTION_TOKEN => self.placeholder(inner),
            DATE_TOKEN => match inner {
                HostValue::Number(millis) => Ok(HostValue::Date(millis)),
                other => Err(MarshalError::Custom(format!(
                    "Date must be a number of milliseconds, got {}",
                    other.kind_name()
                ))),
            },
            _ => Ok(inner),
        }
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> std::result::Result<HostValue, MarshalError> {
        let inner = self
            .nested(value)
            .map_err(|err| err.at(format!("field {:?}", variant)))?;
        let mut object = IndexMap::with_capacity(1);
        object.insert(variant.to_string(), inner);
        Ok(HostValue::Object(object))
    }

    fn serialize_seq(self, len: Option<usize>) -> std::result::Result<SerializeVec<'a, 'c>, MarshalError> {
        self.tracker.enter()?;
        Ok(SerializeVec {
            marshaller: self,
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> std::result::Result<SerializeVec<'a, 'c>, MarshalError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> std::result::Result<SerializeVec<'a, 'c>, MarshalError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> std::result::Result<SerializeTupleVariant<'a, 'c>, MarshalError> {
        Ok(SerializeTupleVariant {
            variant,
            inner: self.serialize_seq(Some(len))?,
        })
    }

    fn serialize_map(self, len: Option<usize>) -> std::result::Result<SerializeObject<'a, 'c>, MarshalError> {
        self.tracker.enter()?;
        Ok(SerializeObject {
            marshaller: self,
            entries: IndexMap::with_capacity(len.unwrap_or(0)),
            // Maps with a known length are sorted; flattened structs and
            // `Methods` keep insertion order.
            sorted: len.is_some(),
            pending_key: None,
        })
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        len: usize,
    ) -> std::result::Result<SerializeObject<'a, 'c>, MarshalError> {
        let mut object = self.serialize_map(Some(len))?;
        object.sorted = false;
        Ok(object)
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> std::result::Result<SerializeStructVariant<'a, 'c>, MarshalError> {
        Ok(SerializeStructVariant {
            variant,
            inner: self.serialize_struct(variant, len)?,
        })
    }
}

pub(crate) struct SerializeVec<'a, 'c> {
    marshaller: &'a mut Marshaller<'c>,
    items: Vec<HostValue>,
}

impl SerializeVec<'_, '_> {
    fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> std::result::Result<(), MarshalError> {
        let index = self.items.len();
        let item = value
            .serialize(&mut *self.marshaller)
            .map_err(|err| err.at(format!("index {}", index)))?;
        self.items.push(item);
        Ok(())
    }

    fn finish(self) -> HostValue {
        self.marshaller.tracker.exit();
        HostValue::Array(self.items)
    }
}

impl ser::SerializeSeq for SerializeVec<'_, '_> {
    type Ok = HostValue;
    type Error = MarshalError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> std::result::Result<(), MarshalError> {
        self.push(value)
    }

    fn end(self) -> std::result::Result<HostValue, MarshalError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTuple for SerializeVec<'_, '_> {
    type Ok = HostValue;
    type Error = MarshalError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> std::result::Result<(), MarshalError> {
        self.push(value)
    }

    fn end(self) -> std::result::Result<HostValue, MarshalError> {
        Ok(self.finish())
    }
}

impl ser::SerializeTupleStruct for SerializeVec<'_, '_> {
    type Ok = HostValue;
    type Error = MarshalError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> std::result::Result<(), MarshalError> {
        self.push(value)
    }

    fn end(self) -> std::result::Result<HostValue, MarshalError> {
        Ok(self.finish())
    }
}

pub(crate) struct SerializeTupleVariant<'a, 'c> {
    variant: &'static str,
    inner: SerializeVec<'a, 'c>,
}

impl ser::SerializeTupleVariant for SerializeTupleVariant<'_, '_> {
    type Ok = HostValue;
    type Error = MarshalError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> std::result::Result<(), MarshalError> {
        let variant = self.variant;
        self.inner
            .push(value)
            .map_err(|err| err.at(format!("field {:?}", variant)))
    }

    fn end(self) -> std::result::Result<HostValue, MarshalError> {
        let mut object = IndexMap::with_capacity(1);
        object.insert(self.variant.to_string(), self.inner.finish());
        Ok(HostValue::Object(object))
    }
}

pub(crate) struct SerializeObject<'a, 'c> {
    marshaller: &'a mut Marshaller<'c>,
    entries: IndexMap<String, HostValue>,
    sorted: bool,
    pending_key: Option<String>,
}

impl SerializeObject<'_, '_> {
    fn insert<T: Serialize + ?Sized>(&mut self, key: String, value: &T) -> std::result::Result<(), MarshalError> {
        let segment = if self.sorted { "map key" } else { "field" };
        let value = value
            .serialize(&mut *self.marshaller)
            .map_err(|err| err.at(format!("{} {:?}", segment, key)))?;
        self.entries.insert(key, value);
        Ok(())
    }

    fn finish(mut self) -> HostValue {
        self.marshaller.tracker.exit();
        if self.sorted {
            self.entries.sort_keys();
        }
        HostValue::Object(self.entries)
    }
}

impl ser::SerializeMap for SerializeObject<'_, '_> {
    type Ok = HostValue;
    type Error = MarshalError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> std::result::Result<(), MarshalError> {
        match key.serialize(&mut *self.marshaller)? {
            HostValue::String(key) => {
                self.pending_key = Some(key);
                Ok(())
            }
            other => Err(MarshalError::NonStringKey {
                kind: other.kind_name(),
            }),
        }
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> std::result::Result<(), MarshalError> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| MarshalError::Custom("serialize_value called before serialize_key".to_string()))?;
        self.insert(key, value)
    }

    fn end(self) -> std::result::Result<HostValue, MarshalError> {
        Ok(self.finish())
    }
}

impl ser::SerializeStruct for SerializeObject<'_, '_> {
    type Ok = HostValue;
    type Error = MarshalError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> std::result::Result<(), MarshalError> {
        self.insert(key.to_string(), value)
    }

    fn end(self) -> std::result::Result<HostValue, MarshalError> {
        Ok(self.finish())
    }
}

pub(crate) struct SerializeStructVariant<'a, 'c> {
    variant: &'static str,
    inner: SerializeObject<'a, 'c>,
}

impl ser::SerializeStructVariant for SerializeStructVariant<'_, '_> {
    type Ok = HostValue;
    type Error = MarshalError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> std::result::Result<(), MarshalError> {
        let variant = self.variant;
        self.inner
            .insert(key.to_string(), value)
            .map_err(|err| err.at(format!("field {:?}", variant)))
    }

    fn end(self) -> std::result::Result<HostValue, MarshalError> {
        let mut object = IndexMap::with_capacity(1);
        object.insert(self.variant.to_string(), self.inner.finish());
        Ok(HostValue::Object(object))
    }
}
