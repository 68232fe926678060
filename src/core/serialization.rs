//! # Value Serialization
//!
//! Conversion between application types and [`Value`]s, plus the two
//! extension points for types outside the built-in kinds:
//!
//! - [`ByteSerializable`]: types that know how to write themselves
//! - [`TypeWrapper`]: external adapters registered for types the application
//!   cannot modify
//!
//! Object and connection references travel as numeric ids. [`ValueCodec`]
//! checks every id in a decoded value against a [`ReferenceResolver`] so an
//! unknown id fails with `UnresolvedReference` before any handler sees it.
//!
//! ```rust
//! use synclink::core::serialization::{FromValue, IntoValue};
//! use synclink::Value;
//!
//! let v = vec![1u16, 2, 3].into_value();
//! assert!(matches!(v, Value::List(_)));
//! assert_eq!(Vec::<u16>::from_value(v).unwrap(), vec![1, 2, 3]);
//! ```

use crate::core::buffer::{ByteReader, ByteWriter};
use crate::core::value::{SerializedData, TypeTag, Value};
use crate::error::{ProtocolError, Result};
use crate::{ConnectionId, NetworkId};
use bytes::Bytes;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

/// A type that writes and reads its own byte representation
pub trait ByteSerializable: Sized {
    /// Name carried on the wire so the receiver can check it decodes the right type
    const TYPE_NAME: &'static str;

    fn serialize(&self, w: &mut ByteWriter) -> Result<()>;

    fn deserialize(r: &mut ByteReader<'_>) -> Result<Self>;

    fn serialized_len(&self) -> usize {
        let mut w = ByteWriter::new();
        match self.serialize(&mut w) {
            Ok(()) => w.len(),
            Err(_) => 0,
        }
    }
}

impl Value {
    pub fn from_serializable<T: ByteSerializable>(value: &T) -> Result<Value> {
        let mut w = ByteWriter::with_capacity(value.serialized_len());
        value.serialize(&mut w)?;
        Ok(Value::Serializable {
            type_name: T::TYPE_NAME.to_string(),
            data: w.into_bytes(),
        })
    }

    pub fn to_serializable<T: ByteSerializable>(&self) -> Result<T> {
        match self {
            Value::Serializable { type_name, data } if type_name == T::TYPE_NAME => {
                let mut r = ByteReader::new(data);
                let out = T::deserialize(&mut r)?;
                r.finish()?;
                Ok(out)
            }
            Value::Serializable { type_name, .. } => Err(ProtocolError::Deserialization(format!(
                "expected serializable {}, found {type_name}",
                T::TYPE_NAME
            ))),
            other => Err(mismatch(T::TYPE_NAME, other)),
        }
    }

    pub fn from_enum<E: WireEnum>(value: E) -> Value {
        Value::Enum(value.to_i32())
    }

    pub fn to_enum<E: WireEnum>(&self) -> Result<E> {
        match self {
            Value::Enum(raw) => E::from_i32(*raw).ok_or_else(|| {
                ProtocolError::Deserialization(format!(
                    "{raw} is not a valid {}",
                    type_name::<E>()
                ))
            }),
            other => Err(mismatch(type_name::<E>(), other)),
        }
    }
}

/// Enumerations carried as their underlying integer
pub trait WireEnum: Sized {
    fn to_i32(&self) -> i32;
    fn from_i32(raw: i32) -> Option<Self>;
}

/// External adapter for a type the codec cannot modify
pub trait TypeWrapper: Send + Sync + 'static {
    type Target: Send + 'static;

    /// Name carried on the wire
    fn name(&self) -> &'static str;

    fn wrap(&self, value: &Self::Target, w: &mut ByteWriter) -> Result<()>;

    fn unwrap(&self, r: &mut ByteReader<'_>) -> Result<Self::Target>;
}

trait ErasedWrapper: Send + Sync {
    fn name(&self) -> &'static str;
    fn wrap_any(&self, value: &dyn Any, w: &mut ByteWriter) -> Result<()>;
    fn unwrap_any(&self, r: &mut ByteReader<'_>) -> Result<Box<dyn Any + Send>>;
}

impl<W: TypeWrapper> ErasedWrapper for W {
    fn name(&self) -> &'static str {
        TypeWrapper::name(self)
    }

    fn wrap_any(&self, value: &dyn Any, w: &mut ByteWriter) -> Result<()> {
        let value = value.downcast_ref::<W::Target>().ok_or_else(|| {
            ProtocolError::Serialization(format!(
                "wrapper {} cannot encode this value",
                TypeWrapper::name(self)
            ))
        })?;
        self.wrap(value, w)
    }

    fn unwrap_any(&self, r: &mut ByteReader<'_>) -> Result<Box<dyn Any + Send>> {
        Ok(Box::new(self.unwrap(r)?))
    }
}

/// Type adapters keyed by Rust type and by wire name
#[derive(Default, Clone)]
pub struct TypeWrapperRegistry {
    by_type: HashMap<TypeId, Arc<dyn ErasedWrapper>>,
    by_name: HashMap<&'static str, TypeId>,
}

impl std::fmt::Debug for TypeWrapperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeWrapperRegistry")
            .field("names", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TypeWrapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter. Registering a second adapter for the same type or
    /// wire name is a startup error.
    pub fn register<W: TypeWrapper>(&mut self, wrapper: W) -> Result<()> {
        let type_id = TypeId::of::<W::Target>();
        let name = TypeWrapper::name(&wrapper);
        if self.by_type.contains_key(&type_id) {
            return Err(ProtocolError::ConfigError(format!(
                "a type wrapper for {} is already registered",
                type_name::<W::Target>()
            )));
        }
        if self.by_name.contains_key(name) {
            return Err(ProtocolError::ConfigError(format!(
                "type wrapper name '{name}' is already registered"
            )));
        }
        self.by_name.insert(name, type_id);
        self.by_type.insert(type_id, Arc::new(wrapper));
        Ok(())
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<T>())
    }

    /// Encode `value` with its registered adapter.
    ///
    /// # Errors
    /// `Serialization` naming the type when no adapter is registered.
    pub fn wrap<T: 'static>(&self, value: &T) -> Result<Value> {
        let wrapper = self.by_type.get(&TypeId::of::<T>()).ok_or_else(|| {
            ProtocolError::Serialization(format!(
                "unsupported type {}: no type wrapper registered",
                type_name::<T>()
            ))
        })?;
        let mut w = ByteWriter::new();
        wrapper.wrap_any(value, &mut w)?;
        Ok(Value::Wrapped {
            type_name: wrapper.name().to_string(),
            data: w.into_bytes(),
        })
    }

    pub fn unwrap<T: 'static>(&self, value: &Value) -> Result<T> {
        let (name, data) = match value {
            Value::Wrapped { type_name, data } => (type_name, data),
            other => return Err(mismatch(type_name::<T>(), other)),
        };
        let type_id = self.by_name.get(name.as_str()).copied().ok_or_else(|| {
            ProtocolError::Deserialization(format!("no type wrapper registered for '{name}'"))
        })?;
        if type_id != TypeId::of::<T>() {
            return Err(ProtocolError::Deserialization(format!(
                "wrapped '{name}' cannot decode into {}",
                type_name::<T>()
            )));
        }
        let wrapper = self.by_type.get(&type_id).ok_or_else(|| {
            ProtocolError::Deserialization(format!("no type wrapper registered for '{name}'"))
        })?;
        let mut r = ByteReader::new(data);
        let boxed = wrapper.unwrap_any(&mut r)?;
        r.finish()?;
        boxed.downcast::<T>().map(|b| *b).map_err(|_| {
            ProtocolError::Deserialization(format!(
                "wrapper for '{name}' produced a value that is not {}",
                type_name::<T>()
            ))
        })
    }

    /// Whether a wrapped value with this wire name can be decoded here
    pub fn knows(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }
}

/// Registry lookups used to validate references in decoded values
pub trait ReferenceResolver {
    fn has_object(&self, id: NetworkId) -> bool;
    fn has_connection(&self, id: ConnectionId) -> bool;
}

/// Accepts every reference; for contexts with no registry
pub struct NoResolver;

impl ReferenceResolver for NoResolver {
    fn has_object(&self, _id: NetworkId) -> bool {
        true
    }

    fn has_connection(&self, _id: ConnectionId) -> bool {
        true
    }
}

/// Tagged-value codec bound to the process type adapters
#[derive(Debug, Clone, Default)]
pub struct ValueCodec {
    wrappers: Arc<TypeWrapperRegistry>,
}

impl ValueCodec {
    pub fn new(wrappers: Arc<TypeWrapperRegistry>) -> Self {
        Self { wrappers }
    }

    pub fn wrappers(&self) -> &TypeWrapperRegistry {
        &self.wrappers
    }

    pub fn serialize(&self, value: &Value) -> Result<SerializedData> {
        value.to_tagged()
    }

    /// Decode and check every reference and wrapped type name.
    pub fn deserialize(
        &self,
        data: &SerializedData,
        resolver: &dyn ReferenceResolver,
    ) -> Result<Value> {
        let value = Value::from_tagged(data)?;
        self.check(&value, resolver)?;
        Ok(value)
    }

    fn check(&self, value: &Value, resolver: &dyn ReferenceResolver) -> Result<()> {
        match value {
            Value::ObjectRef(id) if !resolver.has_object(*id) => {
                Err(ProtocolError::UnresolvedReference {
                    kind: "object",
                    id: *id,
                })
            }
            Value::ConnectionRef(id) if !resolver.has_connection(*id) => {
                Err(ProtocolError::UnresolvedReference {
                    kind: "connection",
                    id: *id,
                })
            }
            Value::Wrapped { type_name, .. } if !self.wrappers.knows(type_name) => Err(
                ProtocolError::Deserialization(format!("no type wrapper registered for '{type_name}'")),
            ),
            Value::List(items) => items.iter().try_for_each(|item| self.check(item, resolver)),
            _ => Ok(()),
        }
    }
}

fn mismatch(expected: &str, found: &Value) -> ProtocolError {
    ProtocolError::Deserialization(format!("expected {expected}, found {}", found.tag()))
}

/// Handle to a replicated object inside a value
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef(pub NetworkId);

/// Handle to a peer connection inside a value
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionRef(pub ConnectionId);

/// Conversion into a [`Value`]
pub trait IntoValue {
    fn into_value(self) -> Value;
}

/// Conversion out of a [`Value`]
pub trait FromValue: Sized {
    /// Tag this type is carried as; `None` when several tags are accepted
    fn expected_tag() -> Option<TypeTag>;

    fn from_value(value: Value) -> Result<Self>;
}

macro_rules! scalar_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl IntoValue for $ty {
                fn into_value(self) -> Value {
                    Value::$variant(self)
                }
            }

            impl FromValue for $ty {
                fn expected_tag() -> Option<TypeTag> {
                    Some(TypeTag::$variant)
                }

                fn from_value(value: Value) -> Result<Self> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(mismatch(stringify!($ty), &other)),
                    }
                }
            }
        )*
    };
}

scalar_value! {
    bool => Bool,
    u8 => U8,
    i8 => I8,
    u16 => U16,
    i16 => I16,
    u32 => U32,
    i32 => I32,
    u64 => U64,
    i64 => I64,
    f32 => F32,
    f64 => F64,
    char => Char,
    String => String,
    Bytes => Bytes,
}

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::String(self.to_owned())
    }
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::Void
    }
}

impl FromValue for () {
    fn expected_tag() -> Option<TypeTag> {
        Some(TypeTag::Void)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Void => Ok(()),
            other => Err(mismatch("void", &other)),
        }
    }
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl FromValue for Value {
    fn expected_tag() -> Option<TypeTag> {
        None
    }

    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

impl IntoValue for ObjectRef {
    fn into_value(self) -> Value {
        Value::ObjectRef(self.0)
    }
}

impl FromValue for ObjectRef {
    fn expected_tag() -> Option<TypeTag> {
        Some(TypeTag::ObjectRef)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::ObjectRef(id) => Ok(ObjectRef(id)),
            other => Err(mismatch("object reference", &other)),
        }
    }
}

impl IntoValue for ConnectionRef {
    fn into_value(self) -> Value {
        Value::ConnectionRef(self.0)
    }
}

impl FromValue for ConnectionRef {
    fn expected_tag() -> Option<TypeTag> {
        Some(TypeTag::ConnectionRef)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::ConnectionRef(id) => Ok(ConnectionRef(id)),
            other => Err(mismatch("connection reference", &other)),
        }
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(v) => v.into_value(),
            None => Value::Void,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn expected_tag() -> Option<TypeTag> {
        T::expected_tag()
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Void => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl<T: IntoValue> IntoValue for Vec<T> {
    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(IntoValue::into_value).collect())
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn expected_tag() -> Option<TypeTag> {
        Some(TypeTag::List)
    }

    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::List(items) => items.into_iter().map(T::from_value).collect(),
            other => Err(mismatch("list", &other)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Vec3 {
        x: f32,
        y: f32,
        z: f32,
    }

    impl ByteSerializable for Vec3 {
        const TYPE_NAME: &'static str = "Vec3";

        fn serialize(&self, w: &mut ByteWriter) -> Result<()> {
            w.write_f32(self.x);
            w.write_f32(self.y);
            w.write_f32(self.z);
            Ok(())
        }

        fn deserialize(r: &mut ByteReader<'_>) -> Result<Self> {
            Ok(Vec3 {
                x: r.read_f32()?,
                y: r.read_f32()?,
                z: r.read_f32()?,
            })
        }
    }

    #[derive(Debug, PartialEq)]
    struct Instant2(u64);

    struct InstantWrapper;

    impl TypeWrapper for InstantWrapper {
        type Target = Instant2;

        fn name(&self) -> &'static str {
            "Instant2"
        }

        fn wrap(&self, value: &Instant2, w: &mut ByteWriter) -> Result<()> {
            w.write_u64(value.0);
            Ok(())
        }

        fn unwrap(&self, r: &mut ByteReader<'_>) -> Result<Instant2> {
            Ok(Instant2(r.read_u64()?))
        }
    }

    #[derive(Debug, PartialEq, Clone, Copy)]
    enum Team {
        Red,
        Blue,
    }

    impl WireEnum for Team {
        fn to_i32(&self) -> i32 {
            *self as i32
        }

        fn from_i32(raw: i32) -> Option<Self> {
            match raw {
                0 => Some(Team::Red),
                1 => Some(Team::Blue),
                _ => None,
            }
        }
    }

    struct OnlyObjectSeven;

    impl ReferenceResolver for OnlyObjectSeven {
        fn has_object(&self, id: NetworkId) -> bool {
            id == 7
        }

        fn has_connection(&self, _id: ConnectionId) -> bool {
            false
        }
    }

    #[test]
    fn test_serializable_roundtrip() {
        let v = Vec3 { x: 1.0, y: -2.0, z: 0.5 };
        assert_eq!(v.serialized_len(), 12);
        let value = Value::from_serializable(&v).unwrap();
        let tagged = value.to_tagged().unwrap();
        let decoded = Value::from_tagged(&tagged).unwrap();
        assert_eq!(decoded.to_serializable::<Vec3>().unwrap(), v);
    }

    #[test]
    fn test_wrapper_roundtrip() {
        let mut registry = TypeWrapperRegistry::new();
        registry.register(InstantWrapper).unwrap();
        let value = registry.wrap(&Instant2(99)).unwrap();
        assert_eq!(registry.unwrap::<Instant2>(&value).unwrap(), Instant2(99));
    }

    #[test]
    fn test_unregistered_type_names_type() {
        let registry = TypeWrapperRegistry::new();
        let err = registry.wrap(&Instant2(1)).unwrap_err();
        assert!(err.to_string().contains("Instant2"));
    }

    #[test]
    fn test_duplicate_wrapper_rejected() {
        let mut registry = TypeWrapperRegistry::new();
        registry.register(InstantWrapper).unwrap();
        assert!(registry.register(InstantWrapper).is_err());
    }

    #[test]
    fn test_enum_as_integer() {
        let value = Value::from_enum(Team::Blue);
        assert_eq!(value, Value::Enum(1));
        assert_eq!(value.to_enum::<Team>().unwrap(), Team::Blue);
        assert!(Value::Enum(5).to_enum::<Team>().is_err());
    }

    #[test]
    fn test_unresolved_object_reference() {
        let codec = ValueCodec::default();
        let ok = Value::ObjectRef(7).to_tagged().unwrap();
        assert!(codec.deserialize(&ok, &OnlyObjectSeven).is_ok());

        let nested = Value::List(vec![Value::ObjectRef(8)]).to_tagged().unwrap();
        assert!(matches!(
            codec.deserialize(&nested, &OnlyObjectSeven),
            Err(ProtocolError::UnresolvedReference { kind: "object", id: 8 })
        ));
    }

    #[test]
    fn test_option_maps_to_void() {
        assert_eq!(None::<u32>.into_value(), Value::Void);
        assert_eq!(Option::<u32>::from_value(Value::Void).unwrap(), None);
        assert_eq!(Option::<u32>::from_value(Value::U32(4)).unwrap(), Some(4));
    }

    #[test]
    fn test_type_mismatch_reported() {
        let err = u32::from_value(Value::String("x".into())).unwrap_err();
        assert!(err.to_string().contains("u32"));
    }
}
