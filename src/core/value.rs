//! Self-describing values.
//!
//! [`Value`] is the closed set of kinds the codec understands. On the wire a
//! value travels as a [`SerializedData`]: `{u8 tag}{u8 is_null}{u32 len}{payload}`.
//! A tagged value is null exactly when its tag is `Void`.

use crate::core::buffer::{ByteReader, ByteWriter};
use crate::error::{ProtocolError, Result};
use crate::{ConnectionId, NetworkId};
use bytes::Bytes;
use std::fmt;

/// Deepest list nesting accepted from the wire
pub const MAX_LIST_DEPTH: usize = 32;

/// Type tag written before every tagged value
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Void = 0,
    Bool = 1,
    U8 = 2,
    I8 = 3,
    U16 = 4,
    I16 = 5,
    U32 = 6,
    I32 = 7,
    U64 = 8,
    I64 = 9,
    F32 = 10,
    F64 = 11,
    Char = 12,
    String = 13,
    Bytes = 14,
    List = 15,
    Enum = 16,
    Serializable = 17,
    Wrapped = 18,
    ObjectRef = 19,
    ConnectionRef = 20,
}

impl TypeTag {
    pub fn from_u8(raw: u8) -> Result<Self> {
        use TypeTag::*;
        Ok(match raw {
            0 => Void,
            1 => Bool,
            2 => U8,
            3 => I8,
            4 => U16,
            5 => I16,
            6 => U32,
            7 => I32,
            8 => U64,
            9 => I64,
            10 => F32,
            11 => F64,
            12 => Char,
            13 => String,
            14 => Bytes,
            15 => List,
            16 => Enum,
            17 => Serializable,
            18 => Wrapped,
            19 => ObjectRef,
            20 => ConnectionRef,
            other => {
                return Err(ProtocolError::Deserialization(format!(
                    "unknown type tag {other}"
                )))
            }
        })
    }

    pub fn name(self) -> &'static str {
        use TypeTag::*;
        match self {
            Void => "void",
            Bool => "bool",
            U8 => "u8",
            I8 => "i8",
            U16 => "u16",
            I16 => "i16",
            U32 => "u32",
            I32 => "i32",
            U64 => "u64",
            I64 => "i64",
            F32 => "f32",
            F64 => "f64",
            Char => "char",
            String => "string",
            Bytes => "bytes",
            List => "list",
            Enum => "enum",
            Serializable => "serializable",
            Wrapped => "wrapped",
            ObjectRef => "object",
            ConnectionRef => "connection",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A type-tagged byte payload as carried in RPC arguments, results and sync vars
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedData {
    tag: TypeTag,
    is_null: bool,
    payload: Bytes,
}

impl SerializedData {
    /// The null value
    pub fn null() -> Self {
        Self {
            tag: TypeTag::Void,
            is_null: true,
            payload: Bytes::new(),
        }
    }

    /// A non-null value. `Void` is only representable through [`SerializedData::null`].
    pub fn new(tag: TypeTag, payload: Bytes) -> Result<Self> {
        if tag == TypeTag::Void {
            if !payload.is_empty() {
                return Err(ProtocolError::Serialization("void value with payload".into()));
            }
            return Ok(Self::null());
        }
        Ok(Self {
            tag,
            is_null: false,
            payload,
        })
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    pub fn is_null(&self) -> bool {
        self.is_null
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn encoded_len(&self) -> usize {
        6 + self.payload.len()
    }

    pub fn write_to(&self, w: &mut ByteWriter) -> Result<()> {
        w.write_u8(self.tag as u8);
        w.write_bool(self.is_null);
        w.write_blob(&self.payload)
    }

    pub fn read_from(r: &mut ByteReader<'_>) -> Result<Self> {
        let tag = TypeTag::from_u8(r.read_u8()?)?;
        let is_null = r.read_bool()?;
        let payload = r.read_blob()?;
        if (tag == TypeTag::Void) != is_null {
            return Err(ProtocolError::Deserialization(format!(
                "null flag {is_null} inconsistent with tag {tag}"
            )));
        }
        if is_null && !payload.is_empty() {
            return Err(ProtocolError::Deserialization("null value with payload".into()));
        }
        Ok(Self {
            tag,
            is_null,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut w = ByteWriter::with_capacity(self.encoded_len());
        self.write_to(&mut w)?;
        Ok(w.into_bytes())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let out = Self::read_from(&mut r)?;
        r.finish()?;
        Ok(out)
    }
}

/// Every value kind the codec can carry
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Void,
    Bool(bool),
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
    Char(char),
    String(String),
    Bytes(Bytes),
    /// Heterogeneous list; every element keeps its own tag
    List(Vec<Value>),
    /// Enumeration carried as its underlying integer
    Enum(i32),
    /// A [`ByteSerializable`](crate::core::serialization::ByteSerializable) value
    Serializable { type_name: String, data: Bytes },
    /// A value encoded by a registered [`TypeWrapper`](crate::core::serialization::TypeWrapper)
    Wrapped { type_name: String, data: Bytes },
    ObjectRef(NetworkId),
    ConnectionRef(ConnectionId),
}

impl Value {
    pub fn tag(&self) -> TypeTag {
        match self {
            Value::Void => TypeTag::Void,
            Value::Bool(_) => TypeTag::Bool,
            Value::U8(_) => TypeTag::U8,
            Value::I8(_) => TypeTag::I8,
            Value::U16(_) => TypeTag::U16,
            Value::I16(_) => TypeTag::I16,
            Value::U32(_) => TypeTag::U32,
            Value::I32(_) => TypeTag::I32,
            Value::U64(_) => TypeTag::U64,
            Value::I64(_) => TypeTag::I64,
            Value::F32(_) => TypeTag::F32,
            Value::F64(_) => TypeTag::F64,
            Value::Char(_) => TypeTag::Char,
            Value::String(_) => TypeTag::String,
            Value::Bytes(_) => TypeTag::Bytes,
            Value::List(_) => TypeTag::List,
            Value::Enum(_) => TypeTag::Enum,
            Value::Serializable { .. } => TypeTag::Serializable,
            Value::Wrapped { .. } => TypeTag::Wrapped,
            Value::ObjectRef(_) => TypeTag::ObjectRef,
            Value::ConnectionRef(_) => TypeTag::ConnectionRef,
        }
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Value::Void)
    }

    fn write_payload(&self, w: &mut ByteWriter, depth: usize) -> Result<()> {
        match self {
            Value::Void => {}
            Value::Bool(v) => w.write_bool(*v),
            Value::U8(v) => w.write_u8(*v),
            Value::I8(v) => w.write_i8(*v),
            Value::U16(v) => w.write_u16(*v),
            Value::I16(v) => w.write_i16(*v),
            Value::U32(v) => w.write_u32(*v),
            Value::I32(v) => w.write_i32(*v),
            Value::U64(v) => w.write_u64(*v),
            Value::I64(v) => w.write_i64(*v),
            Value::F32(v) => w.write_f32(*v),
            Value::F64(v) => w.write_f64(*v),
            Value::Char(v) => w.write_char(*v),
            Value::String(v) => w.write_raw(v.as_bytes()),
            Value::Bytes(v) => w.write_raw(v),
            Value::List(items) => {
                w.write_list(items, |w, item| item.to_tagged_at(depth + 1)?.write_to(w))?
            }
            Value::Enum(v) => w.write_i32(*v),
            Value::Serializable { type_name, data } | Value::Wrapped { type_name, data } => {
                w.write_string(type_name)?;
                w.write_raw(data);
            }
            Value::ObjectRef(id) | Value::ConnectionRef(id) => w.write_u32(*id),
        }
        Ok(())
    }

    /// Encode into a tagged value. References stay numeric ids.
    pub fn to_tagged(&self) -> Result<SerializedData> {
        self.to_tagged_at(0)
    }

    fn to_tagged_at(&self, depth: usize) -> Result<SerializedData> {
        if depth > MAX_LIST_DEPTH {
            return Err(ProtocolError::Serialization(format!(
                "lists nested deeper than {MAX_LIST_DEPTH}"
            )));
        }
        if self.is_void() {
            return Ok(SerializedData::null());
        }
        let mut w = ByteWriter::new();
        self.write_payload(&mut w, depth)?;
        SerializedData::new(self.tag(), w.into_bytes())
    }

    /// Decode a tagged value without resolving references
    pub fn from_tagged(data: &SerializedData) -> Result<Self> {
        Self::from_tagged_at(data, 0)
    }

    fn from_tagged_at(data: &SerializedData, depth: usize) -> Result<Self> {
        if depth > MAX_LIST_DEPTH {
            return Err(ProtocolError::Deserialization(format!(
                "lists nested deeper than {MAX_LIST_DEPTH}"
            )));
        }
        let payload = data.payload();
        let mut r = ByteReader::new(payload);
        let value = match data.tag() {
            TypeTag::Void => Value::Void,
            TypeTag::Bool => Value::Bool(r.read_bool()?),
            TypeTag::U8 => Value::U8(r.read_u8()?),
            TypeTag::I8 => Value::I8(r.read_i8()?),
            TypeTag::U16 => Value::U16(r.read_u16()?),
            TypeTag::I16 => Value::I16(r.read_i16()?),
            TypeTag::U32 => Value::U32(r.read_u32()?),
            TypeTag::I32 => Value::I32(r.read_i32()?),
            TypeTag::U64 => Value::U64(r.read_u64()?),
            TypeTag::I64 => Value::I64(r.read_i64()?),
            TypeTag::F32 => Value::F32(r.read_f32()?),
            TypeTag::F64 => Value::F64(r.read_f64()?),
            TypeTag::Char => Value::Char(r.read_char()?),
            TypeTag::String => {
                let bytes = r.read_slice(r.remaining())?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|e| ProtocolError::Deserialization(format!("invalid utf-8: {e}")))?;
                Value::String(s.to_owned())
            }
            TypeTag::Bytes => {
                let len = r.remaining();
                r.read_slice(len)?;
                Value::Bytes(payload.clone())
            }
            TypeTag::List => Value::List(r.read_list(|r| {
                let element = SerializedData::read_from(r)?;
                Value::from_tagged_at(&element, depth + 1)
            })?),
            TypeTag::Enum => Value::Enum(r.read_i32()?),
            tag @ (TypeTag::Serializable | TypeTag::Wrapped) => {
                let type_name = r.read_string()?;
                let data = payload.slice(r.position()..);
                r.read_slice(r.remaining())?;
                if tag == TypeTag::Serializable {
                    Value::Serializable { type_name, data }
                } else {
                    Value::Wrapped { type_name, data }
                }
            }
            TypeTag::ObjectRef => Value::ObjectRef(r.read_u32()?),
            TypeTag::ConnectionRef => Value::ConnectionRef(r.read_u32()?),
        };
        r.finish()?;
        Ok(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn roundtrip(value: Value) {
        let tagged = value.to_tagged().unwrap();
        let bytes = tagged.to_bytes().unwrap();
        let decoded = SerializedData::from_bytes(&bytes).unwrap();
        assert_eq!(Value::from_tagged(&decoded).unwrap(), value);
    }

    #[test]
    fn test_scalar_roundtrips() {
        roundtrip(Value::Void);
        roundtrip(Value::Bool(true));
        roundtrip(Value::I8(-3));
        roundtrip(Value::U64(u64::MAX));
        roundtrip(Value::F64(-0.125));
        roundtrip(Value::Char('é'));
        roundtrip(Value::String("avatar".into()));
        roundtrip(Value::Enum(-7));
        roundtrip(Value::ObjectRef(7));
    }

    #[test]
    fn test_nested_list_roundtrip() {
        roundtrip(Value::List(vec![
            Value::U8(1),
            Value::String("two".into()),
            Value::List(vec![Value::Void, Value::F32(3.5)]),
        ]));
    }

    #[test]
    fn test_serializable_roundtrip() {
        roundtrip(Value::Serializable {
            type_name: "Vec3".into(),
            data: Bytes::from_static(&[1, 2, 3]),
        });
    }

    #[test]
    fn test_void_is_null() {
        let tagged = Value::Void.to_tagged().unwrap();
        assert!(tagged.is_null());
        assert_eq!(tagged.tag(), TypeTag::Void);
        assert!(!Value::U8(0).to_tagged().unwrap().is_null());
    }

    #[test]
    fn test_inconsistent_null_flag_rejected() {
        // void tag, not null
        assert!(SerializedData::from_bytes(&[0, 0, 0, 0, 0, 0]).is_err());
        // u8 tag, null
        assert!(SerializedData::from_bytes(&[2, 1, 0, 0, 0, 0]).is_err());
    }

    #[test]
    fn test_short_payload_rejected() {
        let tagged = SerializedData::new(TypeTag::U32, Bytes::from_static(&[0, 1])).unwrap();
        assert!(Value::from_tagged(&tagged).is_err());
    }

    #[test]
    fn test_trailing_payload_rejected() {
        let tagged = SerializedData::new(TypeTag::U8, Bytes::from_static(&[1, 2])).unwrap();
        assert!(Value::from_tagged(&tagged).is_err());
    }

    fn nested(depth: usize) -> Value {
        let mut value = Value::U8(1);
        for _ in 0..depth {
            value = Value::List(vec![value]);
        }
        value
    }

    #[test]
    fn test_nesting_limit_on_decode() {
        let deepest = nested(MAX_LIST_DEPTH).to_tagged().unwrap();
        assert_eq!(Value::from_tagged(&deepest).unwrap(), nested(MAX_LIST_DEPTH));

        // One more level, assembled by hand since the encoder refuses it
        let mut w = ByteWriter::new();
        w.write_list(&[deepest], |w, item| item.write_to(w)).unwrap();
        let too_deep = SerializedData::new(TypeTag::List, w.into_bytes()).unwrap();
        assert!(Value::from_tagged(&too_deep).is_err());
    }

    #[test]
    fn test_nesting_limit_on_encode() {
        let err = nested(MAX_LIST_DEPTH + 1).to_tagged().unwrap_err();
        assert!(matches!(err, ProtocolError::Serialization(_)));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(TypeTag::from_u8(200).is_err());
    }
}
