// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Schema-driven message codec
//!
//! Messages are named, with fields held as a JSON object. Field values map to
//! JSON as follows:
//!
//! | Schema type                      | JSON                                |
//! |----------------------------------|-------------------------------------|
//! | integer types                    | number (or numeric string)          |
//! | `float` / `double`               | number                              |
//! | `bool`                           | bool                                |
//! | `string`                         | string                              |
//! | `bytes`                          | hex string                          |
//! | enum                             | value name (numbers accepted)       |
//! | message                          | object                              |
//! | `repeated` fields                | array                               |
//!
//! Payloads use the protobuf wire format. `null` is treated as absent.

use bytes::Buf;
use log::debug;
use prost::encoding::{decode_key, decode_varint, encode_key, encode_varint, WireType};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::{
    frame::{frame_message, split, EncodedFrame, FrameHeader},
    schema::{FieldSchema, FieldType, MessageSchema, Rule, SchemaSet},
    Error, HEADER_LEN,
};

/// Message field map
pub type Fields = serde_json::Map<String, Value>;

/// A named message with its fields
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    #[serde(default)]
    pub fields: Fields,
}

impl Message {
    pub fn new(name: impl Into<String>, fields: Fields) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }
}

/// Encode a named message into a framed message buffer
pub fn encode(schemas: &SchemaSet, name: &str, fields: &Fields) -> Result<Vec<u8>, Error> {
    let schema = schemas.message(name)?;

    let type_id = schema
        .type_id
        .ok_or_else(|| Error::SchemaNotFound(format!("{name} (no message type id)")))?;

    let mut payload = Vec::new();
    encode_fields(schemas, schema, fields, &mut payload)?;

    debug!("Encoded {} ({} payload bytes)", name, payload.len());

    frame_message(type_id, &payload)
}

/// Encode a named message and split it into frames of at most `max_frame_size` bytes
pub fn encode_frames(
    schemas: &SchemaSet,
    name: &str,
    fields: &Fields,
    max_frame_size: usize,
) -> Result<Vec<EncodedFrame>, Error> {
    let buff = encode(schemas, name, fields)?;
    split(&buff, max_frame_size)
}

/// Decode a complete message buffer
pub fn decode(schemas: &SchemaSet, buffer: &[u8]) -> Result<Message, Error> {
    let header = FrameHeader::parse(buffer)
        .ok_or_else(|| Error::MalformedMessage("missing message header".to_string()))?;

    let schema = schemas.message_by_type(header.message_type).ok_or_else(|| {
        Error::MalformedMessage(format!("unknown message type {}", header.message_type))
    })?;

    let payload = &buffer[HEADER_LEN..];
    if payload.len() != header.length as usize {
        return Err(Error::MalformedMessage(format!(
            "{} header declares {} bytes, buffer holds {}",
            schema.name,
            header.length,
            payload.len()
        )));
    }

    let fields = decode_fields(schemas, schema, payload)?;

    Ok(Message::new(schema.name.clone(), fields))
}

fn encode_fields(
    schemas: &SchemaSet,
    schema: &MessageSchema,
    fields: &Fields,
    buff: &mut Vec<u8>,
) -> Result<(), Error> {
    for (k, _) in fields.iter().filter(|(k, _)| schema.field(k).is_none()) {
        debug!("Ignoring unknown field {}.{}", schema.name, k);
    }

    for f in schema.fields.iter() {
        let v = match fields.get(&f.name) {
            None | Some(Value::Null) if f.rule == Rule::Required => {
                return Err(Error::field(&f.name, "missing required field"))
            }
            None | Some(Value::Null) => continue,
            Some(v) => v,
        };

        if f.rule != Rule::Repeated {
            encode_value(schemas, f, v, buff)?;
            continue;
        }

        let items = v
            .as_array()
            .ok_or_else(|| Error::field(&f.name, "expected an array"))?;

        if f.packed {
            if items.is_empty() {
                continue;
            }

            let mut packed = Vec::new();
            for i in items {
                encode_raw(schemas, f, i, &mut packed)?;
            }

            encode_key(f.id, WireType::LengthDelimited, buff);
            encode_varint(packed.len() as u64, buff);
            buff.extend_from_slice(&packed);
        } else {
            for i in items {
                encode_value(schemas, f, i, buff)?;
            }
        }
    }

    Ok(())
}

/// Encode a single keyed value
fn encode_value(
    schemas: &SchemaSet,
    f: &FieldSchema,
    v: &Value,
    buff: &mut Vec<u8>,
) -> Result<(), Error> {
    encode_key(f.id, wire_type(&f.kind), buff);
    encode_raw(schemas, f, v, buff)
}

/// Encode a value without its key
fn encode_raw(
    schemas: &SchemaSet,
    f: &FieldSchema,
    v: &Value,
    buff: &mut Vec<u8>,
) -> Result<(), Error> {
    match &f.kind {
        FieldType::Bool => {
            let b = v
                .as_bool()
                .ok_or_else(|| Error::field(&f.name, "expected a bool"))?;
            encode_varint(b as u64, buff);
        }
        FieldType::Int32 => {
            let n = to_i64(f, v)?;
            let n = i32::try_from(n).map_err(|_| Error::field(&f.name, "out of range for int32"))?;
            // Negative int32 values are sign extended to ten bytes
            encode_varint(n as i64 as u64, buff);
        }
        FieldType::Int64 => encode_varint(to_i64(f, v)? as u64, buff),
        FieldType::Uint32 => {
            let n = to_u64(f, v)?;
            let n =
                u32::try_from(n).map_err(|_| Error::field(&f.name, "out of range for uint32"))?;
            encode_varint(n as u64, buff);
        }
        FieldType::Uint64 => encode_varint(to_u64(f, v)?, buff),
        FieldType::Sint32 => {
            let n = to_i64(f, v)?;
            let n = i32::try_from(n).map_err(|_| Error::field(&f.name, "out of range for sint32"))?;
            encode_varint(((n << 1) ^ (n >> 31)) as u32 as u64, buff);
        }
        FieldType::Sint64 => {
            let n = to_i64(f, v)?;
            encode_varint(((n << 1) ^ (n >> 63)) as u64, buff);
        }
        FieldType::Fixed32 => {
            let n = to_u64(f, v)?;
            let n =
                u32::try_from(n).map_err(|_| Error::field(&f.name, "out of range for fixed32"))?;
            buff.extend_from_slice(&n.to_le_bytes());
        }
        FieldType::Sfixed32 => {
            let n = to_i64(f, v)?;
            let n =
                i32::try_from(n).map_err(|_| Error::field(&f.name, "out of range for sfixed32"))?;
            buff.extend_from_slice(&n.to_le_bytes());
        }
        FieldType::Fixed64 => buff.extend_from_slice(&to_u64(f, v)?.to_le_bytes()),
        FieldType::Sfixed64 => buff.extend_from_slice(&to_i64(f, v)?.to_le_bytes()),
        FieldType::Float => buff.extend_from_slice(&(to_f64(f, v)? as f32).to_le_bytes()),
        FieldType::Double => buff.extend_from_slice(&to_f64(f, v)?.to_le_bytes()),
        FieldType::String => {
            let s = v
                .as_str()
                .ok_or_else(|| Error::field(&f.name, "expected a string"))?;
            encode_varint(s.len() as u64, buff);
            buff.extend_from_slice(s.as_bytes());
        }
        FieldType::Bytes => {
            let s = v
                .as_str()
                .ok_or_else(|| Error::field(&f.name, "expected a hex string"))?;
            let d = hex::decode(s).map_err(|e| Error::field(&f.name, e.to_string()))?;
            encode_varint(d.len() as u64, buff);
            buff.extend_from_slice(&d);
        }
        FieldType::Enum(name) => {
            let e = schemas
                .enum_schema(name)
                .ok_or_else(|| Error::SchemaNotFound(name.clone()))?;

            let n = match v {
                Value::String(s) => e
                    .value(s)
                    .ok_or_else(|| Error::field(&f.name, format!("unknown {name} value '{s}'")))?,
                Value::Number(_) => {
                    let n = to_i64(f, v)?;
                    i32::try_from(n).map_err(|_| Error::field(&f.name, "enum out of range"))?
                }
                _ => return Err(Error::field(&f.name, "expected an enum name")),
            };

            encode_varint(n as i64 as u64, buff);
        }
        FieldType::Message(name) => {
            let nested = v
                .as_object()
                .ok_or_else(|| Error::field(&f.name, "expected an object"))?;

            let mut d = Vec::new();
            encode_fields(schemas, schemas.message(name)?, nested, &mut d)?;

            encode_varint(d.len() as u64, buff);
            buff.extend_from_slice(&d);
        }
    }

    Ok(())
}

fn decode_fields(
    schemas: &SchemaSet,
    schema: &MessageSchema,
    mut buff: &[u8],
) -> Result<Fields, Error> {
    let mut fields = Fields::new();

    while buff.has_remaining() {
        let (tag, wire) = decode_key(&mut buff)?;

        let f = match schema.field_by_id(tag) {
            Some(f) => f,
            None => {
                debug!("Skipping unknown field {} in {}", tag, schema.name);
                skip(wire, &mut buff)?;
                continue;
            }
        };

        if f.rule != Rule::Repeated {
            let v = decode_value(schemas, f, wire, &mut buff)?;
            fields.insert(f.name.clone(), v);
            continue;
        }

        let mut items = Vec::new();

        // Packed values may be received regardless of the schema packing option
        if wire == WireType::LengthDelimited && f.kind.is_packable() {
            let len = decode_varint(&mut buff)? as usize;
            let mut packed = take(&mut buff, len)?;
            while packed.has_remaining() {
                items.push(decode_raw(schemas, f, &mut packed)?);
            }
        } else {
            items.push(decode_value(schemas, f, wire, &mut buff)?);
        }

        if let Value::Array(a) = fields
            .entry(f.name.clone())
            .or_insert_with(|| Value::Array(vec![]))
        {
            a.extend(items);
        }
    }

    // Absent repeated fields decode as empty lists
    for f in schema.fields.iter().filter(|f| f.rule == Rule::Repeated) {
        fields
            .entry(f.name.clone())
            .or_insert_with(|| Value::Array(vec![]));
    }

    if let Some(f) = schema
        .fields
        .iter()
        .find(|f| f.rule == Rule::Required && !fields.contains_key(&f.name))
    {
        return Err(Error::MalformedMessage(format!(
            "{} missing required field '{}'",
            schema.name, f.name
        )));
    }

    Ok(fields)
}

fn decode_value(
    schemas: &SchemaSet,
    f: &FieldSchema,
    wire: WireType,
    buff: &mut &[u8],
) -> Result<Value, Error> {
    let expected = wire_type(&f.kind);
    if wire != expected {
        return Err(Error::MalformedMessage(format!(
            "field '{}' has wire type {:?}, expected {:?}",
            f.name, wire, expected
        )));
    }

    decode_raw(schemas, f, buff)
}

fn decode_raw(schemas: &SchemaSet, f: &FieldSchema, buff: &mut &[u8]) -> Result<Value, Error> {
    let v = match &f.kind {
        FieldType::Bool => Value::Bool(decode_varint(buff)? != 0),
        FieldType::Int32 => Value::from(decode_varint(buff)? as i64 as i32),
        FieldType::Int64 => Value::from(decode_varint(buff)? as i64),
        FieldType::Uint32 => Value::from(decode_varint(buff)? as u32),
        FieldType::Uint64 => Value::from(decode_varint(buff)?),
        FieldType::Sint32 => {
            let n = decode_varint(buff)? as u32;
            Value::from(((n >> 1) as i32) ^ -((n & 1) as i32))
        }
        FieldType::Sint64 => {
            let n = decode_varint(buff)?;
            Value::from(((n >> 1) as i64) ^ -((n & 1) as i64))
        }
        FieldType::Fixed32 => Value::from(take(buff, 4)?.get_u32_le()),
        FieldType::Sfixed32 => Value::from(take(buff, 4)?.get_i32_le()),
        FieldType::Fixed64 => Value::from(take(buff, 8)?.get_u64_le()),
        FieldType::Sfixed64 => Value::from(take(buff, 8)?.get_i64_le()),
        FieldType::Float => float(take(buff, 4)?.get_f32_le() as f64),
        FieldType::Double => float(take(buff, 8)?.get_f64_le()),
        FieldType::String => {
            let len = decode_varint(buff)? as usize;
            let d = take(buff, len)?;
            let s = std::str::from_utf8(d).map_err(|_| {
                Error::MalformedMessage(format!("field '{}' is not valid utf-8", f.name))
            })?;
            Value::String(s.to_string())
        }
        FieldType::Bytes => {
            let len = decode_varint(buff)? as usize;
            Value::String(hex::encode(take(buff, len)?))
        }
        FieldType::Enum(name) => {
            let n = decode_varint(buff)? as i64 as i32;
            match schemas.enum_schema(name).and_then(|e| e.name(n)) {
                Some(s) => Value::String(s.to_string()),
                None => Value::from(n),
            }
        }
        FieldType::Message(name) => {
            let len = decode_varint(buff)? as usize;
            let d = take(buff, len)?;
            Value::Object(decode_fields(schemas, schemas.message(name)?, d)?)
        }
    };

    Ok(v)
}

/// Split `len` bytes off the front of the buffer
fn take<'a>(buff: &mut &'a [u8], len: usize) -> Result<&'a [u8], Error> {
    let b: &'a [u8] = buff;
    if b.len() < len {
        return Err(Error::MalformedMessage(format!(
            "truncated field ({} of {} bytes)",
            b.len(),
            len
        )));
    }

    let (head, tail) = b.split_at(len);
    *buff = tail;

    Ok(head)
}

/// Skip an unknown field
fn skip(wire: WireType, buff: &mut &[u8]) -> Result<(), Error> {
    match wire {
        WireType::Varint => {
            decode_varint(buff)?;
        }
        WireType::SixtyFourBit => {
            take(buff, 8)?;
        }
        WireType::ThirtyTwoBit => {
            take(buff, 4)?;
        }
        WireType::LengthDelimited => {
            let len = decode_varint(buff)? as usize;
            take(buff, len)?;
        }
        WireType::StartGroup | WireType::EndGroup => {
            return Err(Error::MalformedMessage("groups are not supported".to_string()))
        }
    }

    Ok(())
}

fn wire_type(kind: &FieldType) -> WireType {
    match kind {
        FieldType::Bool
        | FieldType::Int32
        | FieldType::Int64
        | FieldType::Uint32
        | FieldType::Uint64
        | FieldType::Sint32
        | FieldType::Sint64
        | FieldType::Enum(_) => WireType::Varint,
        FieldType::Fixed32 | FieldType::Sfixed32 | FieldType::Float => WireType::ThirtyTwoBit,
        FieldType::Fixed64 | FieldType::Sfixed64 | FieldType::Double => WireType::SixtyFourBit,
        FieldType::String | FieldType::Bytes | FieldType::Message(_) => WireType::LengthDelimited,
    }
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn to_i64(f: &FieldSchema, v: &Value) -> Result<i64, Error> {
    match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| Error::field(&f.name, "expected an integer"))
}

fn to_u64(f: &FieldSchema, v: &Value) -> Result<u64, Error> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| Error::field(&f.name, "expected an unsigned integer"))
}

fn to_f64(f: &FieldSchema, v: &Value) -> Result<f64, Error> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| Error::field(&f.name, "expected a number"))
}
