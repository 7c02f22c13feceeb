//! Classification of VM values into overlapping kinds.
//!
//! A single VM value usually belongs to several kinds at once: the string
//! `"foo"` is a `String` and a `Name`, the number `-1` is a `Number` and an
//! `Int32`. The full set is computed once when a [`Value`](crate::Value) is
//! produced and stored as a [`KindMask`].

use std::fmt;

macro_rules! kinds {
    ($($(#[$meta:meta])* $kind:ident => $predicate:ident,)+) => {
        /// One kind in the VM value taxonomy.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Kind {
            $($(#[$meta])* $kind,)+
        }

        impl Kind {
            /// Every kind, in bit order.
            pub const ALL: &'static [Kind] = &[$(Kind::$kind,)+];

            /// Display name of the kind.
            pub fn name(self) -> &'static str {
                match self {
                    $(Kind::$kind => stringify!($kind),)+
                }
            }
        }

        /// Test every predicate V8 exposes and collect the matches.
        pub(crate) fn classify(value: rusty_v8::Local<'_, rusty_v8::Value>) -> KindMask {
            let mut mask = KindMask::EMPTY;
            $(
                if value.$predicate() {
                    mask = mask.with(Kind::$kind);
                }
            )+
            mask
        }
    };
}

kinds! {
    Undefined => is_undefined,
    Null => is_null,
    /// Strings and symbols.
    Name => is_name,
    String => is_string,
    Symbol => is_symbol,
    Function => is_function,
    Array => is_array,
    Object => is_object,
    Boolean => is_boolean,
    Number => is_number,
    External => is_external,
    Int32 => is_int32,
    Uint32 => is_uint32,
    Date => is_date,
    ArgumentsObject => is_arguments_object,
    BooleanObject => is_boolean_object,
    NumberObject => is_number_object,
    StringObject => is_string_object,
    SymbolObject => is_symbol_object,
    NativeError => is_native_error,
    RegExp => is_reg_exp,
    AsyncFunction => is_async_function,
    GeneratorFunction => is_generator_function,
    GeneratorObject => is_generator_object,
    Promise => is_promise,
    Map => is_map,
    Set => is_set,
    MapIterator => is_map_iterator,
    SetIterator => is_set_iterator,
    WeakMap => is_weak_map,
    WeakSet => is_weak_set,
    ArrayBuffer => is_array_buffer,
    ArrayBufferView => is_array_buffer_view,
    TypedArray => is_typed_array,
    Uint8Array => is_uint8_array,
    Uint8ClampedArray => is_uint8_clamped_array,
    Int8Array => is_int8_array,
    Uint16Array => is_uint16_array,
    Int16Array => is_int16_array,
    Uint32Array => is_uint32_array,
    Int32Array => is_int32_array,
    Float32Array => is_float32_array,
    Float64Array => is_float64_array,
    DataView => is_data_view,
    SharedArrayBuffer => is_shared_array_buffer,
    Proxy => is_proxy,
    WebAssemblyCompiledModule => is_wasm_module_object,
    BigInt => is_big_int,
    BigIntObject => is_big_int_object,
    BigInt64Array => is_big_int64_array,
    BigUint64Array => is_big_uint64_array,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bitset of [`Kind`]s. Immutable once attached to a value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KindMask(u64);

impl KindMask {
    pub const EMPTY: KindMask = KindMask(0);

    /// Build a mask from an explicit list of kinds.
    pub fn of(kinds: &[Kind]) -> Self {
        kinds.iter().fold(Self::EMPTY, |mask, kind| mask.with(*kind))
    }

    pub const fn with(self, kind: Kind) -> Self {
        KindMask(self.0 | (1 << kind as u8))
    }

    /// Whether the value belongs to `kind`.
    pub const fn is(self, kind: Kind) -> bool {
        self.0 & (1 << kind as u8) != 0
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterate the member kinds in bit order.
    pub fn iter(self) -> impl Iterator<Item = Kind> {
        Kind::ALL.iter().copied().filter(move |kind| self.is(*kind))
    }
}

impl fmt::Display for KindMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, kind) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(kind.name())?;
        }
        Ok(())
    }
}

impl fmt::Debug for KindMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KindMask[{}]", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Isolate;
    use proptest::prelude::*;

    #[test]
    fn test_kind_count_fits_mask() {
        assert_eq!(Kind::ALL.len(), 51);
        assert!(Kind::ALL.len() <= 64);
        for (i, kind) in Kind::ALL.iter().enumerate() {
            assert_eq!(*kind as usize, i);
        }
    }

    #[test]
    fn test_mask_display() {
        let mask = KindMask::of(&[Kind::String, Kind::Name]);
        assert_eq!(mask.to_string(), "Name, String");
        assert_eq!(KindMask::EMPTY.to_string(), "");
    }

    proptest! {
        #[test]
        fn test_mask_membership_matches_construction(picks in proptest::collection::vec(0usize..51, 0..20)) {
            let kinds: Vec<Kind> = picks.iter().map(|i| Kind::ALL[*i]).collect();
            let mask = KindMask::of(&kinds);
            for kind in Kind::ALL {
                prop_assert_eq!(mask.is(*kind), kinds.contains(kind));
            }
            prop_assert_eq!(mask.iter().count(), mask.bits().count_ones() as usize);
        }
    }

    fn assert_kinds(source: &str, expected: &[Kind]) {
        let isolate = Isolate::new().unwrap();
        let ctx = isolate.new_context().unwrap();
        let value = ctx.eval(source, "kinds.js").unwrap();
        assert_eq!(value.kinds(), KindMask::of(expected), "kinds of `{}`", source);
    }

    #[test]
    fn test_classify_table() {
        use Kind::*;

        assert_kinds("undefined", &[Undefined]);
        assert_kinds("null", &[Null]);
        assert_kinds("'foo'", &[Name, String]);
        assert_kinds("Symbol()", &[Name, Symbol]);
        assert_kinds("(function(){})", &[Function, Object]);
        assert_kinds("[]", &[Array, Object]);
        assert_kinds("({})", &[Object]);
        assert_kinds("true", &[Boolean]);
        assert_kinds("-1", &[Number, Int32]);
        assert_kinds("1", &[Number, Int32, Uint32]);
        assert_kinds("1.5", &[Number]);
        assert_kinds("new Date()", &[Date, Object]);
        assert_kinds("(function(){ return arguments; })()", &[ArgumentsObject, Object]);
        assert_kinds("new Boolean(false)", &[BooleanObject, Object]);
        assert_kinds("new Number(3)", &[NumberObject, Object]);
        assert_kinds("new String('x')", &[StringObject, Object]);
        assert_kinds("Object(Symbol())", &[SymbolObject, Object]);
        assert_kinds("new Error('boom')", &[NativeError, Object]);
        assert_kinds("/x/", &[RegExp, Object]);
        assert_kinds("(async function(){})", &[AsyncFunction, Function, Object]);
        assert_kinds("(function*(){})", &[GeneratorFunction, Function, Object]);
        assert_kinds("(function*(){})()", &[GeneratorObject, Object]);
        assert_kinds("Promise.resolve(1)", &[Promise, Object]);
        assert_kinds("new Map()", &[Map, Object]);
        assert_kinds("new Set()", &[Set, Object]);
        assert_kinds("new Map().entries()", &[MapIterator, Object]);
        assert_kinds("new Set().entries()", &[SetIterator, Object]);
        assert_kinds("new WeakMap()", &[WeakMap, Object]);
        assert_kinds("new WeakSet()", &[WeakSet, Object]);
        assert_kinds("new ArrayBuffer(4)", &[ArrayBuffer, Object]);
        assert_kinds(
            "new Uint8Array(4)",
            &[ArrayBufferView, TypedArray, Uint8Array, Object],
        );
        assert_kinds(
            "new Float64Array(4)",
            &[ArrayBufferView, TypedArray, Float64Array, Object],
        );
        assert_kinds(
            "new DataView(new ArrayBuffer(4))",
            &[ArrayBufferView, DataView, Object],
        );
        assert_kinds("new Proxy({}, {})", &[Proxy, Object]);
        assert_kinds("10n", &[BigInt]);
        assert_kinds("Object(10n)", &[BigIntObject, Object]);
        assert_kinds(
            "new BigInt64Array(2)",
            &[ArrayBufferView, TypedArray, BigInt64Array, Object],
        );
    }
}
