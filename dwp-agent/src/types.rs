// DWP type definitions
//
// Host-side handles, wire IDs and the tagged value codec

use crate::protocol::{AgentError, AgentResult, ErrorCode, ProtocolVersion};
use crate::reader::{read_i32, read_i64, read_u8};
use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Wire IDs are 4 bytes
pub type ObjectId = i32;
pub type EntityId = i32;
pub type RequestId = i32;
pub type FrameId = i32;

macro_rules! host_handle {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
            pub struct $name(pub u64);
        )+
    };
}

host_handle!(
    /// A native thread known to the host
    ThreadRef,
    MethodRef,
    TypeRef,
    AssemblyRef,
    ModuleRef,
    FieldRef,
    /// A lifetime domain; entities minted in it die with it
    DomainRef,
    /// One compiled (possibly specialized) body of a method
    CodeRef,
);

/// Execution position captured for a thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadContext {
    pub method: MethodRef,
    pub code: CodeRef,
    pub il_offset: i64,
    pub sp: u64,
}

// Value tags
pub mod value_tags {
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0a;
    pub const U8: u8 = 0x0b;
    pub const R4: u8 = 0x0c;
    pub const R8: u8 = 0x0d;
    pub const STRING: u8 = 0x0e;
    pub const PTR: u8 = 0x0f;
    pub const VALUETYPE: u8 = 0x11;
    pub const CLASS: u8 = 0x12;
    pub const ARRAY: u8 = 0x14;
    pub const OBJECT: u8 = 0x1c;
    pub const SZARRAY: u8 = 0x1d;
    pub const NULL: u8 = 0xf0;
    pub const TYPE: u8 = 0xf1;
    pub const PARENT_VTYPE: u8 = 0xf2;
}

/// Nesting limit when decoding client supplied values
const MAX_VALUE_DEPTH: usize = 64;

/// A tagged value as it travels on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Void,
    Null,
    Boolean(bool),
    Char(u16),
    I1(i8),
    U1(u8),
    I2(i16),
    U2(u16),
    I4(i32),
    U4(u32),
    I8(i64),
    U8(u64),
    R4(f32),
    R8(f64),
    Ptr { address: u64, type_id: EntityId },
    /// String, class, array or plain object reference
    Object { tag: u8, id: ObjectId },
    Type(EntityId),
    ValueType(ValueTypeValue),
    /// A boxed value type living at `address`; resolved through [`BoxedValues`] when encoding
    Boxed(u64),
    /// Back-reference to the n-th enclosing boxed value type
    ParentVType(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueTypeValue {
    pub is_enum: bool,
    pub type_id: EntityId,
    pub fields: Vec<Value>,
}

/// Storage for boxed value types reachable from a value graph
pub trait BoxedValues {
    fn boxed_value(&self, address: u64) -> Option<&ValueTypeValue>;
}

impl BoxedValues for HashMap<u64, ValueTypeValue> {
    fn boxed_value(&self, address: u64) -> Option<&ValueTypeValue> {
        self.get(&address)
    }
}

/// For values with no boxed value types in them
pub struct NoBoxedValues;

impl BoxedValues for NoBoxedValues {
    fn boxed_value(&self, _address: u64) -> Option<&ValueTypeValue> {
        None
    }
}

/// Encodes values, turning cycles through boxed value types into back-references.
///
/// `open` holds the addresses of the boxed values currently being written,
/// outermost first. An address is removed as soon as its fields are done,
/// so a boxed value shared by two siblings is written twice in full.
pub struct ValueEncoder<'a, H: BoxedValues + ?Sized> {
    heap: &'a H,
    version: ProtocolVersion,
    open: Vec<u64>,
}

impl<'a, H: BoxedValues + ?Sized> ValueEncoder<'a, H> {
    pub fn new(heap: &'a H, version: ProtocolVersion) -> Self {
        Self {
            heap,
            version,
            open: Vec::new(),
        }
    }

    pub fn encode<B: BufMut>(&mut self, buf: &mut B, value: &Value) -> Result<(), ErrorCode> {
        use value_tags::*;

        match value {
            Value::Void => buf.put_u8(VOID),
            Value::Null => buf.put_u8(NULL),
            Value::Boolean(v) => {
                buf.put_u8(BOOLEAN);
                buf.put_i32(*v as i32);
            }
            Value::Char(v) => {
                buf.put_u8(CHAR);
                buf.put_i32(*v as i32);
            }
            Value::I1(v) => {
                buf.put_u8(I1);
                buf.put_i32(*v as i32);
            }
            Value::U1(v) => {
                buf.put_u8(U1);
                buf.put_i32(*v as i32);
            }
            Value::I2(v) => {
                buf.put_u8(I2);
                buf.put_i32(*v as i32);
            }
            Value::U2(v) => {
                buf.put_u8(U2);
                buf.put_i32(*v as i32);
            }
            Value::I4(v) => {
                buf.put_u8(I4);
                buf.put_i32(*v);
            }
            Value::U4(v) => {
                buf.put_u8(U4);
                buf.put_u32(*v);
            }
            Value::I8(v) => {
                buf.put_u8(I8);
                buf.put_i64(*v);
            }
            Value::U8(v) => {
                buf.put_u8(U8);
                buf.put_u64(*v);
            }
            Value::R4(v) => {
                buf.put_u8(R4);
                buf.put_u32(v.to_bits());
            }
            Value::R8(v) => {
                buf.put_u8(R8);
                buf.put_u64(v.to_bits());
            }
            Value::Ptr { address, type_id } => {
                buf.put_u8(PTR);
                buf.put_u64(*address);
                buf.put_i32(*type_id);
            }
            Value::Object { tag, id } => {
                buf.put_u8(*tag);
                buf.put_i32(*id);
            }
            Value::Type(id) => {
                buf.put_u8(TYPE);
                buf.put_i32(*id);
            }
            Value::ValueType(vtype) => self.encode_vtype(buf, vtype)?,
            Value::Boxed(address) => {
                if let Some(index) = self.open.iter().position(|a| a == address) {
                    if self.version.at_least(2, 33) {
                        buf.put_u8(PARENT_VTYPE);
                        buf.put_i32(index as i32);
                    } else {
                        buf.put_u8(NULL);
                    }
                    return Ok(());
                }

                let heap = self.heap;
                let vtype = heap.boxed_value(*address).ok_or(ErrorCode::InvalidObject)?;
                self.open.push(*address);
                let result = self.encode_vtype(buf, vtype);
                self.open.pop();
                result?;
            }
            Value::ParentVType(index) => {
                buf.put_u8(PARENT_VTYPE);
                buf.put_i32(*index as i32);
            }
        }
        Ok(())
    }

    fn encode_vtype<B: BufMut>(&mut self, buf: &mut B, vtype: &ValueTypeValue) -> Result<(), ErrorCode> {
        buf.put_u8(value_tags::VALUETYPE);
        buf.put_u8(vtype.is_enum as u8);
        buf.put_i32(vtype.type_id);
        buf.put_i32(vtype.fields.len() as i32);
        for field in &vtype.fields {
            self.encode(buf, field)?;
        }
        Ok(())
    }
}

/// Encode a value that holds no boxed value types
pub fn encode_value<B: BufMut>(buf: &mut B, value: &Value, version: ProtocolVersion) -> Result<(), ErrorCode> {
    ValueEncoder::new(&NoBoxedValues, version).encode(buf, value)
}

/// Decode one tagged value
pub fn decode_value(buf: &mut &[u8]) -> AgentResult<Value> {
    decode_value_at(buf, 0)
}

fn decode_value_at(buf: &mut &[u8], depth: usize) -> AgentResult<Value> {
    use value_tags::*;

    if depth > MAX_VALUE_DEPTH {
        return Err(AgentError::Protocol("Value nested too deeply".to_string()));
    }

    let tag = read_u8(buf)?;
    let value = match tag {
        VOID => Value::Void,
        NULL => Value::Null,
        BOOLEAN => Value::Boolean(read_i32(buf)? != 0),
        CHAR => Value::Char(read_i32(buf)? as u16),
        I1 => Value::I1(read_i32(buf)? as i8),
        U1 => Value::U1(read_i32(buf)? as u8),
        I2 => Value::I2(read_i32(buf)? as i16),
        U2 => Value::U2(read_i32(buf)? as u16),
        I4 => Value::I4(read_i32(buf)?),
        U4 => Value::U4(read_i32(buf)? as u32),
        I8 => Value::I8(read_i64(buf)?),
        U8 => Value::U8(read_i64(buf)? as u64),
        R4 => Value::R4(f32::from_bits(read_i32(buf)? as u32)),
        R8 => Value::R8(f64::from_bits(read_i64(buf)? as u64)),
        PTR => Value::Ptr {
            address: read_i64(buf)? as u64,
            type_id: read_i32(buf)?,
        },
        STRING | CLASS | ARRAY | OBJECT | SZARRAY => Value::Object {
            tag,
            id: read_i32(buf)?,
        },
        TYPE => Value::Type(read_i32(buf)?),
        VALUETYPE => {
            let is_enum = read_u8(buf)? != 0;
            let type_id = read_i32(buf)?;
            let nfields = read_i32(buf)?;
            if nfields < 0 {
                return Err(AgentError::Protocol(format!("Negative field count: {}", nfields)));
            }
            let mut fields = Vec::new();
            for _ in 0..nfields {
                fields.push(decode_value_at(buf, depth + 1)?);
            }
            Value::ValueType(ValueTypeValue {
                is_enum,
                type_id,
                fields,
            })
        }
        PARENT_VTYPE => {
            let index = read_i32(buf)?;
            if index < 0 {
                return Err(AgentError::Protocol(format!("Invalid parent index: {}", index)));
            }
            Value::ParentVType(index as u32)
        }
        other => {
            return Err(AgentError::Protocol(format!("Unknown value tag: {:#x}", other)));
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn round_trip(value: &Value) -> Value {
        let mut buf = BytesMut::new();
        encode_value(&mut buf, value, ProtocolVersion::CURRENT).unwrap();
        let mut data = &buf[..];
        let decoded = decode_value(&mut data).unwrap();
        assert!(data.is_empty(), "trailing bytes after {:?}", value);
        decoded
    }

    #[test]
    fn test_every_tag_round_trips() {
        let values = vec![
            Value::Void,
            Value::Null,
            Value::Boolean(true),
            Value::Char(0x263a),
            Value::I1(-5),
            Value::U1(250),
            Value::I2(-30000),
            Value::U2(65000),
            Value::I4(i32::MIN),
            Value::U4(u32::MAX),
            Value::I8(i64::MIN),
            Value::U8(u64::MAX),
            Value::R4(1.5),
            Value::R8(-2.25e100),
            Value::Ptr { address: 0xdead_beef_0000, type_id: 7 },
            Value::Object { tag: value_tags::STRING, id: 3 },
            Value::Object { tag: value_tags::SZARRAY, id: 4 },
            Value::Type(12),
            Value::ParentVType(1),
        ];

        for value in values {
            assert_eq!(round_trip(&value), value);
        }
    }

    #[test]
    fn test_nested_value_types_round_trip() {
        let inner = ValueTypeValue {
            is_enum: true,
            type_id: 2,
            fields: vec![Value::I4(1)],
        };
        let outer = Value::ValueType(ValueTypeValue {
            is_enum: false,
            type_id: 1,
            fields: vec![Value::ValueType(inner), Value::Null, Value::R8(0.5)],
        });
        assert_eq!(round_trip(&outer), outer);
    }

    #[test]
    fn test_self_referential_boxed_value() {
        // A boxed struct whose second field points back at itself
        let mut heap: HashMap<u64, ValueTypeValue> = HashMap::new();
        heap.insert(
            0x1000,
            ValueTypeValue {
                is_enum: false,
                type_id: 9,
                fields: vec![Value::I4(42), Value::Boxed(0x1000)],
            },
        );

        let mut buf = BytesMut::new();
        ValueEncoder::new(&heap, ProtocolVersion::CURRENT)
            .encode(&mut buf, &Value::Boxed(0x1000))
            .unwrap();

        let mut data = &buf[..];
        let decoded = decode_value(&mut data).unwrap();
        assert_eq!(
            decoded,
            Value::ValueType(ValueTypeValue {
                is_enum: false,
                type_id: 9,
                fields: vec![Value::I4(42), Value::ParentVType(0)],
            })
        );

        // The decoded tree encodes to the same bytes
        let mut again = BytesMut::new();
        encode_value(&mut again, &decoded, ProtocolVersion::CURRENT).unwrap();
        assert_eq!(again, buf);
    }

    #[test]
    fn test_mutual_cycle_uses_depth_index() {
        let mut heap: HashMap<u64, ValueTypeValue> = HashMap::new();
        heap.insert(
            1,
            ValueTypeValue { is_enum: false, type_id: 1, fields: vec![Value::Boxed(2)] },
        );
        heap.insert(
            2,
            ValueTypeValue { is_enum: false, type_id: 2, fields: vec![Value::Boxed(1), Value::Boxed(2)] },
        );

        let mut buf = BytesMut::new();
        ValueEncoder::new(&heap, ProtocolVersion::CURRENT)
            .encode(&mut buf, &Value::Boxed(1))
            .unwrap();

        let decoded = decode_value(&mut &buf[..]).unwrap();
        let expected = Value::ValueType(ValueTypeValue {
            is_enum: false,
            type_id: 1,
            fields: vec![Value::ValueType(ValueTypeValue {
                is_enum: false,
                type_id: 2,
                fields: vec![Value::ParentVType(0), Value::ParentVType(1)],
            })],
        });
        assert_eq!(decoded, expected);
    }

    #[test]
    fn test_shared_sibling_is_not_a_cycle() {
        let mut heap: HashMap<u64, ValueTypeValue> = HashMap::new();
        heap.insert(5, ValueTypeValue { is_enum: false, type_id: 3, fields: vec![Value::U1(1)] });
        let pair = Value::ValueType(ValueTypeValue {
            is_enum: false,
            type_id: 4,
            fields: vec![Value::Boxed(5), Value::Boxed(5)],
        });

        let mut buf = BytesMut::new();
        ValueEncoder::new(&heap, ProtocolVersion::CURRENT).encode(&mut buf, &pair).unwrap();

        let Value::ValueType(decoded) = decode_value(&mut &buf[..]).unwrap() else {
            panic!("expected a value type");
        };
        assert!(decoded.fields.iter().all(|f| matches!(f, Value::ValueType(_))));
    }

    #[test]
    fn test_old_clients_get_null_for_cycles() {
        let mut heap: HashMap<u64, ValueTypeValue> = HashMap::new();
        heap.insert(7, ValueTypeValue { is_enum: false, type_id: 1, fields: vec![Value::Boxed(7)] });

        let mut buf = BytesMut::new();
        ValueEncoder::new(&heap, ProtocolVersion::new(2, 30))
            .encode(&mut buf, &Value::Boxed(7))
            .unwrap();

        let decoded = decode_value(&mut &buf[..]).unwrap();
        assert_eq!(
            decoded,
            Value::ValueType(ValueTypeValue { is_enum: false, type_id: 1, fields: vec![Value::Null] })
        );
    }

    #[test]
    fn test_unknown_boxed_address_is_invalid_object() {
        let mut buf = BytesMut::new();
        let err = encode_value(&mut buf, &Value::Boxed(99), ProtocolVersion::CURRENT).unwrap_err();
        assert_eq!(err, ErrorCode::InvalidObject);
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let mut data = &[0x55u8, 0, 0, 0, 0][..];
        assert!(decode_value(&mut data).is_err());
    }
}
