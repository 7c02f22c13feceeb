//! Owned, engine-independent shape of a host value on its way into the VM.
//!
//! Host data is first serialized into a [`HostValue`] tree on the calling
//! thread and then materialized into V8 handles on the isolate thread. The tree
//! only contains plain data, so it can be moved across threads freely.

use crate::runtime::error::MarshalError;
use indexmap::IndexMap;

/// Maximum nesting depth accepted by the marshaller.
pub const MAX_JS_DEPTH: usize = 100;

/// Closed set of shapes the marshaller produces.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Milliseconds since the Unix epoch.
    Date(f64),
    /// Contents of a new ArrayBuffer, moved into V8 without copying.
    Bytes(Vec<u8>),
    Array(Vec<HostValue>),
    /// Property order is assignment order.
    Object(IndexMap<String, HostValue>),
    /// A host function already registered in the target context's callback
    /// table.
    Function { name: String, token: String },
    /// An existing VM value, referenced by slot.
    Existing { slot: u64 },
}

impl HostValue {
    /// The shape name used in error messages.
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "null",
            HostValue::Bool(_) => "bool",
            HostValue::Number(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Date(_) => "date",
            HostValue::Bytes(_) => "bytes",
            HostValue::Array(_) => "array",
            HostValue::Object(_) => "object",
            HostValue::Function { .. } => "function",
            HostValue::Existing { .. } => "value",
        }
    }
}

/// Tracks nesting depth during conversion.
///
/// Reference-counted host graphs can be cyclic; without a bound the
/// serializer would recurse until the stack overflows.
pub(crate) struct LimitTracker {
    max_depth: usize,
    current_depth: usize,
}

impl LimitTracker {
    pub(crate) fn new(max_depth: usize) -> Self {
        Self {
            max_depth,
            current_depth: 0,
        }
    }

    /// Enter a new depth level.
    pub(crate) fn enter(&mut self) -> Result<(), MarshalError> {
        self.current_depth += 1;
        if self.current_depth > self.max_depth {
            return Err(MarshalError::DepthExceeded {
                limit: self.max_depth,
            });
        }
        Ok(())
    }

    /// Exit a depth level.
    pub(crate) fn exit(&mut self) {
        self.current_depth = self.current_depth.saturating_sub(1);
    }
}
