//! Host handles to values living inside a context.

use crate::runtime::context::{Context, ContextCore};
use crate::runtime::error::{Error, Result};
use crate::runtime::kind::{Kind, KindMask};
use crate::runtime::placeholder::{self, Placeholder, VALUE_TOKEN};
use crate::runtime::runner::{self, IsolateId, StoredRef};
use chrono::{DateTime, TimeZone, Utc};
use serde::ser::Error as _;
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A reference to one VM value, owned by the [`Context`] that produced it.
///
/// A value keeps its native context alive, but not the host functions bound
/// in it: once every [`Context`] handle is gone, calling one of them throws.
///
/// The kinds of the value are computed once, when the handle is created.
/// The underlying VM handle is released exactly once: on [`Value::release`],
/// on drop, or when the owning context is released, whichever comes first.
///
/// Serializing a `Value` inside [`Context::create`] passes the VM value through
/// unchanged.
pub struct Value {
    core: Arc<ContextCore>,
    slot: u64,
    kinds: KindMask,
    released: AtomicBool,
}

impl Value {
    pub(crate) fn from_stored(core: Arc<ContextCore>, stored: StoredRef) -> Value {
        Value {
            core,
            slot: stored.slot,
            kinds: stored.kinds,
            released: AtomicBool::new(false),
        }
    }

    /// The owning context, while a host handle to it still exists.
    pub fn context(&self) -> Result<Context> {
        self.core.context().ok_or(Error::Released("context"))
    }

    pub(crate) fn core(&self) -> &Arc<ContextCore> {
        &self.core
    }

    pub(crate) fn isolate_id(&self) -> IsolateId {
        self.core.isolate().id()
    }

    /// The slot backing this value, unless it has been released.
    pub(crate) fn slot(&self) -> Result<u64> {
        if self.is_released() {
            return Err(Error::Released("value"));
        }
        Ok(self.slot)
    }

    pub fn kinds(&self) -> KindMask {
        self.kinds
    }

    pub fn is_kind(&self, kind: Kind) -> bool {
        self.kinds.is(kind)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Release the VM handle. Idempotent.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.core.release_slot(self.slot);
    }

    /// Slot of `other` after checking it can be used alongside `self`.
    fn peer_slot(&self, other: &Value) -> Result<u64> {
        if other.isolate_id() != self.isolate_id() {
            return Err(Error::ForeignIsolate);
        }
        other.slot()
    }

    fn run<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: for<'a, 'b, 's> FnOnce(
                &'a mut rusty_v8::TryCatch<'b, rusty_v8::HandleScope<'s>>,
                rusty_v8::Local<'s, rusty_v8::Value>,
            ) -> Result<R>
            + Send
            + 'static,
    {
        let slot = self.slot()?;
        self.core.run(move |tc| {
            let local = runner::value_local(tc, slot)?;
            f(tc, local)
        })
    }

    /// Run `f` and wrap the VM value it returns as a new handle in the same
    /// context.
    fn derive<F>(&self, f: F) -> Result<Value>
    where
        F: for<'a, 'b, 's> FnOnce(
                &'a mut rusty_v8::TryCatch<'b, rusty_v8::HandleScope<'s>>,
                rusty_v8::Local<'s, rusty_v8::Value>,
            ) -> Result<rusty_v8::Local<'s, rusty_v8::Value>>
            + Send
            + 'static,
    {
        let context_id = self.core.id;
        let stored = self.run(move |tc, local| {
            let result = f(tc, local)?;
            runner::stash(tc, context_id, result)
        })?;
        Ok(self.core.wrap(stored))
    }

    /// The VM's string conversion of the value (`String(value)`).
    pub fn to_string(&self) -> Result<String> {
        self.run(|tc, local| {
            let string = local
                .to_string(tc)
                .ok_or_else(|| Error::Engine("String conversion failed".to_string()))?;
            Ok(string.to_rust_string_lossy(tc))
        })
    }

    pub fn to_f64(&self) -> Result<f64> {
        self.run(|tc, local| {
            local
                .number_value(tc)
                .ok_or_else(|| Error::Engine("Number conversion failed".to_string()))
        })
    }

    pub fn to_i64(&self) -> Result<i64> {
        self.run(|tc, local| {
            local
                .integer_value(tc)
                .ok_or_else(|| Error::Engine("Integer conversion failed".to_string()))
        })
    }

    pub fn to_bool(&self) -> Result<bool> {
        self.run(|tc, local| Ok(local.boolean_value(tc)))
    }

    /// Copy the contents of an `ArrayBuffer` or `ArrayBufferView`. Returns
    /// `None` for any other kind.
    pub fn to_bytes(&self) -> Result<Option<Vec<u8>>> {
        if !self.is_kind(Kind::ArrayBuffer) && !self.is_kind(Kind::ArrayBufferView) {
            return Ok(None);
        }
        self.run(|tc, local| {
            if let Ok(view) = rusty_v8::Local::<rusty_v8::ArrayBufferView>::try_from(local) {
                let mut bytes = vec![0; view.byte_length()];
                let copied = view.copy_contents(&mut bytes);
                bytes.truncate(copied);
                return Ok(Some(bytes));
            }
            let buffer = rusty_v8::Local::<rusty_v8::ArrayBuffer>::try_from(local)
                .map_err(|_| Error::Engine("Expected an ArrayBuffer".to_string()))?;
            let length = buffer.byte_length();
            if length == 0 {
                return Ok(Some(Vec::new()));
            }
            let view = rusty_v8::Uint8Array::new(tc, buffer, 0, length)
                .ok_or_else(|| Error::Engine("Failed to view ArrayBuffer".to_string()))?;
            let mut bytes = vec![0; length];
            view.copy_contents(&mut bytes);
            Ok(Some(bytes))
        })
    }

    pub fn to_date(&self) -> Result<DateTime<Utc>> {
        if !self.is_kind(Kind::Date) {
            return Err(Error::NotADate);
        }
        let millis = self.run(|_, local| {
            let date = rusty_v8::Local::<rusty_v8::Date>::try_from(local)
                .map_err(|_| Error::NotADate)?;
            Ok(date.value_of())
        })?;
        if !millis.is_finite() {
            return Err(Error::NotADate);
        }
        Utc.timestamp_millis_opt(millis as i64)
            .single()
            .ok_or(Error::NotADate)
    }

    /// `JSON.stringify(value)`.
    pub fn to_json(&self) -> Result<String> {
        self.run(|tc, local| {
            let json = rusty_v8::json::stringify(tc, local).ok_or_else(|| {
                Error::Engine("Value cannot be represented as JSON".to_string())
            })?;
            Ok(json.to_rust_string_lossy(tc))
        })
    }

    /// Read property `name`.
    pub fn get(&self, name: &str) -> Result<Value> {
        let name = name.to_string();
        self.derive(move |tc, local| {
            let object = rusty_v8::Local::<rusty_v8::Object>::try_from(local)
                .map_err(|_| Error::NotAnObject)?;
            let key = runner::new_string(tc, &name)?;
            object
                .get(tc, key.into())
                .ok_or_else(|| Error::Engine(format!("Failed to get property '{}'", name)))
        })
    }

    /// Assign property `name`.
    pub fn set(&self, name: &str, value: &Value) -> Result<()> {
        let slot = self.peer_slot(value)?;
        let name = name.to_string();
        self.run(move |tc, local| {
            let object = rusty_v8::Local::<rusty_v8::Object>::try_from(local)
                .map_err(|_| Error::NotAnObject)?;
            let key = runner::new_string(tc, &name)?;
            let value = runner::value_local(tc, slot)?;
            object
                .set(tc, key.into(), value)
                .ok_or_else(|| Error::Engine(format!("Failed to set property '{}'", name)))?;
            Ok(())
        })
    }

    /// Read element `index`.
    ///
    /// On an `ArrayBuffer` this reads byte `index`, or `undefined` past the
    /// end.
    pub fn get_index(&self, index: u32) -> Result<Value> {
        let is_buffer = self.is_kind(Kind::ArrayBuffer);
        self.derive(move |tc, local| {
            if is_buffer {
                let buffer = rusty_v8::Local::<rusty_v8::ArrayBuffer>::try_from(local)
                    .map_err(|_| Error::NotAnObject)?;
                let length = buffer.byte_length();
                if index as usize >= length {
                    return Ok(rusty_v8::undefined(tc).into());
                }
                let view = rusty_v8::Uint8Array::new(tc, buffer, 0, length)
                    .ok_or_else(|| Error::Engine("Failed to view ArrayBuffer".to_string()))?;
                return view
                    .get_index(tc, index)
                    .ok_or_else(|| Error::Engine(format!("Failed to get index {}", index)));
            }
            let object = rusty_v8::Local::<rusty_v8::Object>::try_from(local)
                .map_err(|_| Error::NotAnObject)?;
            object
                .get_index(tc, index)
                .ok_or_else(|| Error::Engine(format!("Failed to get index {}", index)))
        })
    }

    /// Assign element `index`.
    ///
    /// On an `ArrayBuffer` the value is stored as a byte (modulo 256); writing
    /// past the end is an error.
    pub fn set_index(&self, index: u32, value: &Value) -> Result<()> {
        let slot = self.peer_slot(value)?;
        let is_buffer = self.is_kind(Kind::ArrayBuffer);
        self.run(move |tc, local| {
            let value = runner::value_local(tc, slot)?;
            let target: rusty_v8::Local<rusty_v8::Object> = if is_buffer {
                let buffer = rusty_v8::Local::<rusty_v8::ArrayBuffer>::try_from(local)
                    .map_err(|_| Error::NotAnObject)?;
                let length = buffer.byte_length();
                if index as usize >= length {
                    return Err(Error::IndexOutOfRange { index, length });
                }
                rusty_v8::Uint8Array::new(tc, buffer, 0, length)
                    .ok_or_else(|| Error::Engine("Failed to view ArrayBuffer".to_string()))?
                    .into()
            } else {
                rusty_v8::Local::<rusty_v8::Object>::try_from(local)
                    .map_err(|_| Error::NotAnObject)?
            };
            target
                .set_index(tc, index, value)
                .ok_or_else(|| Error::Engine(format!("Failed to set index {}", index)))?;
            Ok(())
        })
    }

    /// Call the value as a function. `this` defaults to `undefined`.
    pub fn call(&self, this: Option<&Value>, args: &[&Value]) -> Result<Value> {
        let this = this.map(|this| self.peer_slot(this)).transpose()?;
        let args = self.arg_slots(args)?;
        self.derive(move |tc, local| {
            let function = rusty_v8::Local::<rusty_v8::Function>::try_from(local)
                .map_err(|_| Error::NotAFunction)?;
            let receiver = match this {
                Some(slot) => runner::value_local(tc, slot)?,
                None => rusty_v8::undefined(tc).into(),
            };
            let args = args
                .iter()
                .map(|slot| runner::value_local(tc, *slot))
                .collect::<Result<Vec<_>>>()?;
            function
                .call(tc, receiver, &args)
                .ok_or_else(|| Error::Engine("Function call failed".to_string()))
        })
    }

    /// Call the value as a constructor (`new value(...args)`).
    pub fn construct(&self, args: &[&Value]) -> Result<Value> {
        let args = self.arg_slots(args)?;
        self.derive(move |tc, local| {
            let function = rusty_v8::Local::<rusty_v8::Function>::try_from(local)
                .map_err(|_| Error::NotAFunction)?;
            let args = args
                .iter()
                .map(|slot| runner::value_local(tc, *slot))
                .collect::<Result<Vec<_>>>()?;
            function
                .new_instance(tc, &args)
                .map(Into::into)
                .ok_or_else(|| Error::Engine("Constructor call failed".to_string()))
        })
    }

    fn arg_slots(&self, args: &[&Value]) -> Result<Vec<u64>> {
        args.iter().map(|arg| self.peer_slot(arg)).collect()
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        self.release();
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let index = placeholder::stash(Placeholder::Value {
            isolate: self.isolate_id(),
            slot: self.slot,
            released: self.is_released(),
        })
        .ok_or_else(|| S::Error::custom("Value can only be serialized by Context::create"))?;
        serializer.serialize_newtype_struct(VALUE_TOKEN, &index)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value")
            .field("context", &self.core.id)
            .field("slot", &self.slot)
            .field("kinds", &self.kinds)
            .field("released", &self.is_released())
            .finish()
    }
}
