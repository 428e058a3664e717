// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Message schema definitions
//!
//! Schemas are loaded from a protobufjs-style JSON bundle, where namespaces
//! contain `nested` definitions, messages carry `fields` and enums carry `values`.
//! Names are resolved by their final path segment, so `hw.management.Failure`
//! is addressed as `Failure`.
//!
//! Wire identifiers for messages are read from the `MessageType` enum,
//! where `MessageType_Foo = N` assigns identifier `N` to message `Foo`.

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};
use once_cell::sync::Lazy;
use serde::Deserialize;

use crate::{Error, MESSAGE_TYPE_ENUM};

/// Schema bundle shipped with this crate, covering device management messages
pub const DEFAULT_BUNDLE: &str = include_str!("../messages.json");

static DEFAULT_SCHEMAS: Lazy<Result<SchemaSet, Error>> =
    Lazy::new(|| SchemaSet::from_json(DEFAULT_BUNDLE));

/// Fetch the schema set parsed from [DEFAULT_BUNDLE]
pub fn default_schemas() -> Result<&'static SchemaSet, Error> {
    DEFAULT_SCHEMAS.as_ref().map_err(Clone::clone)
}

/// Field value types
#[derive(Clone, Debug, PartialEq)]
pub enum FieldType {
    Double,
    Float,
    Int32,
    Int64,
    Uint32,
    Uint64,
    Sint32,
    Sint64,
    Fixed32,
    Fixed64,
    Sfixed32,
    Sfixed64,
    Bool,
    String,
    Bytes,
    /// Reference to an enum by name
    Enum(String),
    /// Reference to a nested message by name
    Message(String),
}

impl FieldType {
    fn scalar(name: &str) -> Option<Self> {
        let t = match name {
            "double" => Self::Double,
            "float" => Self::Float,
            "int32" => Self::Int32,
            "int64" => Self::Int64,
            "uint32" => Self::Uint32,
            "uint64" => Self::Uint64,
            "sint32" => Self::Sint32,
            "sint64" => Self::Sint64,
            "fixed32" => Self::Fixed32,
            "fixed64" => Self::Fixed64,
            "sfixed32" => Self::Sfixed32,
            "sfixed64" => Self::Sfixed64,
            "bool" => Self::Bool,
            "string" => Self::String,
            "bytes" => Self::Bytes,
            _ => return None,
        };
        Some(t)
    }

    /// Whether repeated values of this type may use packed encoding
    pub fn is_packable(&self) -> bool {
        !matches!(self, Self::String | Self::Bytes | Self::Message(_))
    }
}

/// Field cardinality
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Rule {
    Optional,
    Required,
    Repeated,
}

/// Schema for a single message field
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSchema {
    pub name: String,
    pub id: u32,
    pub kind: FieldType,
    pub rule: Rule,
    /// Emit repeated values packed
    pub packed: bool,
}

/// Schema for a named message, fields ordered by identifier
#[derive(Clone, Debug, PartialEq)]
pub struct MessageSchema {
    pub name: String,
    /// Wire identifier, where this message may be sent as a top-level message
    pub type_id: Option<u16>,
    pub fields: Vec<FieldSchema>,
}

impl MessageSchema {
    /// Look up a field by wire identifier
    pub fn field_by_id(&self, id: u32) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.id == id)
    }

    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Schema for a named enum
#[derive(Clone, Debug, PartialEq)]
pub struct EnumSchema {
    pub name: String,
    values: BTreeMap<String, i32>,
    names: BTreeMap<i32, String>,
}

impl EnumSchema {
    /// Resolve a value name to its number
    pub fn value(&self, name: &str) -> Option<i32> {
        self.values.get(name).copied()
    }

    /// Resolve a number to its value name
    pub fn name(&self, value: i32) -> Option<&str> {
        self.names.get(&value).map(|s| s.as_str())
    }
}

/// Immutable set of message and enum schemas
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SchemaSet {
    messages: HashMap<String, MessageSchema>,
    enums: HashMap<String, EnumSchema>,
    by_type: HashMap<u16, String>,
}

#[derive(Deserialize)]
struct RawNamespace {
    #[serde(default)]
    nested: BTreeMap<String, RawNode>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawNode {
    Message(RawMessage),
    Enum(RawEnum),
    Namespace(RawNamespace),
}

#[derive(Deserialize)]
struct RawMessage {
    fields: BTreeMap<String, RawField>,
    #[serde(default)]
    nested: BTreeMap<String, RawNode>,
}

#[derive(Deserialize)]
struct RawEnum {
    values: BTreeMap<String, i32>,
}

#[derive(Deserialize)]
struct RawField {
    #[serde(rename = "type")]
    kind: String,
    id: u32,
    #[serde(default)]
    rule: Option<String>,
    #[serde(default)]
    options: Option<RawFieldOptions>,
}

#[derive(Deserialize)]
struct RawFieldOptions {
    #[serde(default)]
    packed: Option<bool>,
}

impl SchemaSet {
    /// Parse a schema set from a JSON bundle
    pub fn from_json(bundle: &str) -> Result<Self, Error> {
        let raw: RawNamespace =
            serde_json::from_str(bundle).map_err(|e| Error::InvalidSchema(e.to_string()))?;
        Self::from_raw(raw)
    }

    /// Parse a schema set from an already deserialised JSON bundle
    pub fn from_value(bundle: serde_json::Value) -> Result<Self, Error> {
        let raw: RawNamespace =
            serde_json::from_value(bundle).map_err(|e| Error::InvalidSchema(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawNamespace) -> Result<Self, Error> {
        let mut messages = BTreeMap::new();
        let mut enums = HashMap::new();

        collect(raw.nested, &mut messages, &mut enums);

        // Resolve field type references
        let mut resolved = HashMap::new();
        for (name, raw) in messages.iter() {
            let mut fields = Vec::with_capacity(raw.fields.len());

            for (field_name, f) in raw.fields.iter() {
                let kind = match FieldType::scalar(&f.kind) {
                    Some(k) => k,
                    None => {
                        let target = short_name(&f.kind);
                        if enums.contains_key(target) {
                            FieldType::Enum(target.to_string())
                        } else if messages.contains_key(target) {
                            FieldType::Message(target.to_string())
                        } else {
                            return Err(Error::InvalidSchema(format!(
                                "unresolved type '{}' for {}.{}",
                                f.kind, name, field_name
                            )));
                        }
                    }
                };

                let rule = match f.rule.as_deref() {
                    None | Some("optional") => Rule::Optional,
                    Some("required") => Rule::Required,
                    Some("repeated") => Rule::Repeated,
                    Some(other) => {
                        return Err(Error::InvalidSchema(format!(
                            "unsupported rule '{other}' for {name}.{field_name}"
                        )))
                    }
                };

                let packed = rule == Rule::Repeated
                    && kind.is_packable()
                    && f.options.as_ref().and_then(|o| o.packed).unwrap_or(false);

                fields.push(FieldSchema {
                    name: field_name.clone(),
                    id: f.id,
                    kind,
                    rule,
                    packed,
                });
            }

            fields.sort_by_key(|f| f.id);

            resolved.insert(
                name.clone(),
                MessageSchema {
                    name: name.clone(),
                    type_id: None,
                    fields,
                },
            );
        }

        // Assign wire identifiers from the message type enum
        let mut by_type = HashMap::new();
        if let Some(e) = enums.get(MESSAGE_TYPE_ENUM) {
            for (value_name, id) in e.values.iter() {
                let message_name = value_name
                    .strip_prefix("MessageType_")
                    .unwrap_or(value_name.as_str());

                let id = u16::try_from(*id).map_err(|_| {
                    Error::InvalidSchema(format!("message type {value_name} out of range"))
                })?;

                match resolved.get_mut(message_name) {
                    Some(m) => {
                        m.type_id = Some(id);
                        by_type.insert(id, message_name.to_string());
                    }
                    None => debug!("No message definition for {}", value_name),
                }
            }
        }

        debug!(
            "Loaded {} messages ({} with type ids), {} enums",
            resolved.len(),
            by_type.len(),
            enums.len()
        );

        Ok(Self {
            messages: resolved,
            enums,
            by_type,
        })
    }

    /// Look up a message schema by name
    pub fn message(&self, name: &str) -> Result<&MessageSchema, Error> {
        self.messages
            .get(name)
            .ok_or_else(|| Error::SchemaNotFound(name.to_string()))
    }

    /// Look up a message schema by wire identifier
    pub fn message_by_type(&self, type_id: u16) -> Option<&MessageSchema> {
        self.by_type.get(&type_id).and_then(|n| self.messages.get(n))
    }

    /// Look up an enum schema by name
    pub fn enum_schema(&self, name: &str) -> Option<&EnumSchema> {
        self.enums.get(name)
    }

    /// Check whether a message is defined and may be sent on the wire
    pub fn contains(&self, name: &str) -> bool {
        self.messages
            .get(name)
            .map(|m| m.type_id.is_some())
            .unwrap_or(false)
    }

    /// Number of loaded message schemas
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

fn short_name(path: &str) -> &str {
    path.rsplit('.').next().unwrap_or(path)
}

/// Flatten nested namespaces into message and enum tables
fn collect(
    nested: BTreeMap<String, RawNode>,
    messages: &mut BTreeMap<String, RawMessage>,
    enums: &mut HashMap<String, EnumSchema>,
) {
    for (name, node) in nested {
        match node {
            RawNode::Message(mut m) => {
                collect(std::mem::take(&mut m.nested), messages, enums);
                if messages.insert(name.clone(), m).is_some() {
                    warn!("Duplicate message definition: {}", name);
                }
            }
            RawNode::Enum(e) => {
                let names = e.values.iter().map(|(k, v)| (*v, k.clone())).collect();
                let schema = EnumSchema {
                    name: name.clone(),
                    values: e.values,
                    names,
                };
                if enums.insert(name.clone(), schema).is_some() {
                    warn!("Duplicate enum definition: {}", name);
                }
            }
            RawNode::Namespace(n) => collect(n.nested, messages, enums),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::test_schemas;

    #[test]
    fn resolves_nested_types() {
        let s = test_schemas();

        let m = s.message("SignThing").unwrap();
        assert_eq!(m.type_id, Some(700));

        let ids: Vec<_> = m.fields.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7, 8]);

        let path = m.field("path").unwrap();
        assert_eq!(path.kind, FieldType::Message("Path".to_string()));
        assert_eq!(path.rule, Rule::Required);

        assert_eq!(m.field("kind").unwrap().kind, FieldType::Enum("Kind".to_string()));

        let p = s.message("Path").unwrap();
        assert!(p.field("address_n").unwrap().packed);
        assert_eq!(p.type_id, None);
        assert!(!s.contains("Path"));
    }

    #[test]
    fn enum_lookup() {
        let s = test_schemas();
        let e = s.enum_schema("FailureType").unwrap();

        assert_eq!(e.value("Failure_ActionCancelled"), Some(4));
        assert_eq!(e.name(7), Some("Failure_PinInvalid"));
        assert_eq!(e.name(42), None);
    }

    #[test]
    fn unknown_message() {
        let s = test_schemas();
        assert_eq!(
            s.message("Nope"),
            Err(Error::SchemaNotFound("Nope".to_string()))
        );
    }

    #[test]
    fn unresolved_type_rejected() {
        let bundle = r#"{ "nested": { "A": { "fields": { "b": { "type": "Missing", "id": 1 } } } } }"#;

        match SchemaSet::from_json(bundle) {
            Err(Error::InvalidSchema(_)) => (),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn invalid_json_rejected() {
        assert!(matches!(
            SchemaSet::from_json("not json"),
            Err(Error::InvalidSchema(_))
        ));
    }
}
