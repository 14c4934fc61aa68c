//! Structural shape signatures for payload types.
//!
//! A shape is derived by driving a type's `Deserialize` impl against a tracing
//! deserializer that hands back zero values and records every request it
//! receives. Two types that ask for the same serde data model in the same
//! order get the same shape, wherever they are declared:
//!
//! ```text
//! struct Operands { a: i64, b: i64 }   =>  {a:i64,b:i64}
//! Vec<Option<String>>                   =>  seq<option<string>>
//! ```
//!
//! Types the tracer cannot drive (self-describing `deserialize_any` types,
//! impls that reject zero values, recursion deeper than [`MAX_DEPTH`]) fall
//! back to `type <rust type name>`.

use serde::de::{self, DeserializeOwned, DeserializeSeed, Deserializer, IntoDeserializer, Visitor};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{OnceLock, PoisonError, RwLock};
use thiserror::Error;

/// Nesting limit for sequences, maps, structs and enums.
const MAX_DEPTH: usize = 32;

/// Shape signature of `T`, computed once per type.
pub fn shape_of<T: DeserializeOwned + 'static>() -> &'static str {
    static SHAPES: OnceLock<RwLock<HashMap<TypeId, &'static str>>> = OnceLock::new();
    let shapes = SHAPES.get_or_init(Default::default);
    let id = TypeId::of::<T>();

    if let Some(shape) = shapes.read().unwrap_or_else(PoisonError::into_inner).get(&id) {
        return *shape;
    }
    let traced: &'static str = Box::leak(trace::<T>().into_boxed_str());
    *shapes
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(id)
        .or_insert(traced)
}

fn trace<T: DeserializeOwned>() -> String {
    let mut out = String::new();
    match T::deserialize(Tracer { out: &mut out, depth: 0 }) {
        Ok(_) => out,
        Err(_) => format!("type {}", std::any::type_name::<T>()),
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct TraceError(String);

impl de::Error for TraceError {
    fn custom<T: std::fmt::Display>(msg: T) -> Self {
        TraceError(msg.to_string())
    }
}

type TraceResult<T> = std::result::Result<T, TraceError>;

struct Tracer<'a> {
    out: &'a mut String,
    depth: usize,
}

impl Tracer<'_> {
    fn child_depth(&self) -> TraceResult<usize> {
        if self.depth >= MAX_DEPTH {
            return Err(TraceError("shape nests too deeply".to_string()));
        }
        Ok(self.depth + 1)
    }
}

macro_rules! primitive {
    ($de:lifetime; $($method:ident => $visit:ident($value:expr), $name:literal;)*) => {
        $(
            fn $method<V: Visitor<$de>>(self, visitor: V) -> TraceResult<V::Value> {
                self.out.push_str($name);
                visitor.$visit($value)
            }
        )*
    };
}

impl<'de> Deserializer<'de> for Tracer<'_> {
    type Error = TraceError;

    primitive! {
        'de;
        deserialize_bool => visit_bool(false), "bool";
        deserialize_i8 => visit_i8(0), "i8";
        deserialize_i16 => visit_i16(0), "i16";
        deserialize_i32 => visit_i32(0), "i32";
        deserialize_i64 => visit_i64(0), "i64";
        deserialize_i128 => visit_i128(0), "i128";
        deserialize_u8 => visit_u8(0), "u8";
        deserialize_u16 => visit_u16(0), "u16";
        deserialize_u32 => visit_u32(0), "u32";
        deserialize_u64 => visit_u64(0), "u64";
        deserialize_u128 => visit_u128(0), "u128";
        deserialize_f32 => visit_f32(0.0), "f32";
        deserialize_f64 => visit_f64(0.0), "f64";
        deserialize_char => visit_char('\0'), "char";
        deserialize_str => visit_str(""), "string";
        deserialize_string => visit_str(""), "string";
        deserialize_bytes => visit_bytes(&[]), "bytes";
        deserialize_byte_buf => visit_bytes(&[]), "bytes";
    }

    fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> TraceResult<V::Value> {
        self.out.push_str("()");
        visitor.visit_unit()
    }

    fn deserialize_any<V: Visitor<'de>>(self, _visitor: V) -> TraceResult<V::Value> {
        Err(TraceError("self-describing type".to_string()))
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> TraceResult<V::Value> {
        // Recursive types bottom out on `None`.
        if self.depth + 2 > MAX_DEPTH {
            self.out.push_str("option<..>");
            return visitor.visit_none();
        }
        self.out.push_str("option<");
        let depth = self.depth + 1;
        let value = visitor.visit_some(Tracer { out: &mut *self.out, depth })?;
        self.out.push('>');
        Ok(value)
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> TraceResult<V::Value> {
        self.deserialize_unit(visitor)
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> TraceResult<V::Value> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> TraceResult<V::Value> {
        let depth = self.child_depth()?;
        self.out.push_str("seq<");
        let value = visitor.visit_seq(Elements {
            out: &mut *self.out,
            depth,
            len: 1,
            index: 0,
        })?;
        self.out.push('>');
        Ok(value)
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, len: usize, visitor: V) -> TraceResult<V::Value> {
        let depth = self.child_depth()?;
        self.out.push('(');
        let value = visitor.visit_seq(Elements {
            out: &mut *self.out,
            depth,
            len,
            index: 0,
        })?;
        self.out.push(')');
        Ok(value)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        len: usize,
        visitor: V,
    ) -> TraceResult<V::Value> {
        self.deserialize_tuple(len, visitor)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> TraceResult<V::Value> {
        let depth = self.child_depth()?;
        self.out.push_str("map<");
        let value = visitor.visit_map(Entry {
            out: &mut *self.out,
            depth,
            done: false,
        })?;
        self.out.push('>');
        Ok(value)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> TraceResult<V::Value> {
        let depth = self.child_depth()?;
        self.out.push('{');
        let value = visitor.visit_map(Fields {
            out: &mut *self.out,
            depth,
            fields,
            index: 0,
        })?;
        self.out.push('}');
        Ok(value)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> TraceResult<V::Value> {
        let depth = self.child_depth()?;
        let Some(&variant) = variants.first() else {
            return Err(TraceError("enum without variants".to_string()));
        };
        self.out.push_str("enum{");
        self.out.push_str(&variants.join(","));
        self.out.push('}');
        visitor.visit_enum(FirstVariant { variant, depth })
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> TraceResult<V::Value> {
        visitor.visit_str("")
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> TraceResult<V::Value> {
        visitor.visit_unit()
    }

    fn is_human_readable(&self) -> bool {
        false
    }
}

/// `len` elements, traced in order.
struct Elements<'a> {
    out: &'a mut String,
    depth: usize,
    len: usize,
    index: usize,
}

impl<'de> de::SeqAccess<'de> for Elements<'_> {
    type Error = TraceError;

    fn next_element_seed<T: DeserializeSeed<'de>>(&mut self, seed: T) -> TraceResult<Option<T::Value>> {
        if self.index == self.len {
            return Ok(None);
        }
        if self.index > 0 {
            self.out.push(',');
        }
        self.index += 1;
        seed.deserialize(Tracer {
            out: &mut *self.out,
            depth: self.depth,
        })
        .map(Some)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.len - self.index)
    }
}

/// A single key/value pair.
struct Entry<'a> {
    out: &'a mut String,
    depth: usize,
    done: bool,
}

impl<'de> de::MapAccess<'de> for Entry<'_> {
    type Error = TraceError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> TraceResult<Option<K::Value>> {
        if self.done {
            return Ok(None);
        }
        self.done = true;
        seed.deserialize(Tracer {
            out: &mut *self.out,
            depth: self.depth,
        })
        .map(Some)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> TraceResult<V::Value> {
        self.out.push(',');
        seed.deserialize(Tracer {
            out: &mut *self.out,
            depth: self.depth,
        })
    }
}

/// Struct fields by their serialized names.
struct Fields<'a> {
    out: &'a mut String,
    depth: usize,
    fields: &'static [&'static str],
    index: usize,
}

impl<'de> de::MapAccess<'de> for Fields<'_> {
    type Error = TraceError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> TraceResult<Option<K::Value>> {
        let Some(&field) = self.fields.get(self.index) else {
            return Ok(None);
        };
        if self.index > 0 {
            self.out.push(',');
        }
        self.index += 1;
        self.out.push_str(field);
        self.out.push(':');
        let key: de::value::StrDeserializer<'_, TraceError> = field.into_deserializer();
        seed.deserialize(key).map(Some)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> TraceResult<V::Value> {
        seed.deserialize(Tracer {
            out: &mut *self.out,
            depth: self.depth,
        })
    }
}

/// Builds an enum value from its first variant. Only variant names go into the
/// shape, so the payload is traced into a scratch buffer.
struct FirstVariant {
    variant: &'static str,
    depth: usize,
}

impl<'de> de::EnumAccess<'de> for FirstVariant {
    type Error = TraceError;
    type Variant = Self;

    fn variant_seed<V: DeserializeSeed<'de>>(self, seed: V) -> TraceResult<(V::Value, Self)> {
        let key: de::value::StrDeserializer<'_, TraceError> = self.variant.into_deserializer();
        let value = seed.deserialize(key)?;
        Ok((value, self))
    }
}

impl<'de> de::VariantAccess<'de> for FirstVariant {
    type Error = TraceError;

    fn unit_variant(self) -> TraceResult<()> {
        Ok(())
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> TraceResult<T::Value> {
        let mut scratch = String::new();
        seed.deserialize(Tracer {
            out: &mut scratch,
            depth: self.depth,
        })
    }

    fn tuple_variant<V: Visitor<'de>>(self, len: usize, visitor: V) -> TraceResult<V::Value> {
        let mut scratch = String::new();
        Deserializer::deserialize_tuple(
            Tracer {
                out: &mut scratch,
                depth: self.depth,
            },
            len,
            visitor,
        )
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        fields: &'static [&'static str],
        visitor: V,
    ) -> TraceResult<V::Value> {
        let mut scratch = String::new();
        Deserializer::deserialize_struct(
            Tracer {
                out: &mut scratch,
                depth: self.depth,
            },
            "",
            fields,
            visitor,
        )
    }
}
