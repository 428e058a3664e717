// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Typed calls
//!
//! Each [Call] binds a request message name to serde request / response
//! types. Supported calls are resolved against the configured schemas once,
//! when the session is configured.

use std::collections::HashSet;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use hwlink_proto::{Fields, Message, SchemaSet};

use crate::{ErrorCode, HardwareError};

/// Typed response message
pub trait Response: DeserializeOwned {
    /// Message name
    const NAME: &'static str;
}

/// Typed request message
pub trait Call: Serialize {
    /// Message name
    const NAME: &'static str;

    /// Expected response
    type Response: Response;
}

/// Name pairs for every typed call, as `(request, response)`
pub const TYPED_CALLS: &[(&str, &str)] = &[
    (Initialize::NAME, Features::NAME),
    (GetFeatures::NAME, Features::NAME),
    (Ping::NAME, Success::NAME),
    (Cancel::NAME, Success::NAME),
    (GetEntropy::NAME, Entropy::NAME),
    (EndSession::NAME, Success::NAME),
];

/// Resolve the typed calls supported by a schema set
pub(crate) fn resolve(schemas: &SchemaSet) -> HashSet<&'static str> {
    TYPED_CALLS
        .iter()
        .filter(|(req, resp)| schemas.contains(req) && schemas.contains(resp))
        .map(|(req, _)| *req)
        .collect()
}

/// Convert a request into message fields
pub(crate) fn to_fields<C: Call>(req: &C) -> Result<Fields, HardwareError> {
    match serde_json::to_value(req)? {
        Value::Object(m) => Ok(m),
        _ => Err(HardwareError::new(
            ErrorCode::InvalidParameter,
            format!("{} must serialize to an object", C::NAME),
        )),
    }
}

/// Convert a response message into its typed form
pub(crate) fn from_message<R: Response>(m: Message) -> Result<R, HardwareError> {
    if m.name != R::NAME {
        return Err(HardwareError::new(
            ErrorCode::ResponseUnexpectedType,
            format!("Expected {}, received {}", R::NAME, m.name),
        ));
    }

    let r = serde_json::from_value(Value::Object(m.fields)).map_err(|e| {
        HardwareError::new(
            ErrorCode::MalformedMessage,
            format!("Invalid {}: {}", R::NAME, e),
        )
    })?;

    Ok(r)
}

/// Start or resume a device session
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Initialize {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Call for Initialize {
    const NAME: &'static str = "Initialize";
    type Response = Features;
}

/// Fetch device features without resetting the session
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GetFeatures {}

impl Call for GetFeatures {
    const NAME: &'static str = "GetFeatures";
    type Response = Features;
}

/// Device features
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    pub vendor: Option<String>,
    pub major_version: u32,
    pub minor_version: u32,
    pub patch_version: u32,
    pub bootloader_mode: Option<bool>,
    pub device_id: Option<String>,
    pub pin_protection: Option<bool>,
    pub passphrase_protection: Option<bool>,
    pub language: Option<String>,
    pub label: Option<String>,
    pub initialized: Option<bool>,
    pub revision: Option<String>,
    pub unlocked: Option<bool>,
    pub model: Option<String>,
    pub session_id: Option<String>,
    pub capabilities: Vec<String>,
}

impl Response for Features {
    const NAME: &'static str = "Features";
}

impl Features {
    /// Firmware version string
    pub fn version(&self) -> String {
        format!(
            "{}.{}.{}",
            self.major_version, self.minor_version, self.patch_version
        )
    }
}

/// Ping the device, optionally requiring button confirmation
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Ping {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button_protection: Option<bool>,
}

impl Call for Ping {
    const NAME: &'static str = "Ping";
    type Response = Success;
}

/// Generic success response
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Success {
    pub message: Option<String>,
}

impl Response for Success {
    const NAME: &'static str = "Success";
}

/// Cancel the current device operation
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Cancel {}

impl Call for Cancel {
    const NAME: &'static str = "Cancel";
    type Response = Success;
}

/// Request device entropy
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GetEntropy {
    pub size: u32,
}

impl Call for GetEntropy {
    const NAME: &'static str = "GetEntropy";
    type Response = Entropy;
}

/// Device entropy, hex encoded
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Entropy {
    pub entropy: String,
}

impl Response for Entropy {
    const NAME: &'static str = "Entropy";
}

impl Entropy {
    /// Decode entropy bytes
    pub fn bytes(&self) -> Result<Vec<u8>, HardwareError> {
        hex::decode(&self.entropy)
            .map_err(|e| HardwareError::new(ErrorCode::MalformedMessage, e.to_string()))
    }
}

/// End the current device session
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EndSession {}

impl Call for EndSession {
    const NAME: &'static str = "EndSession";
    type Response = Success;
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use hwlink_proto::default_schemas;

    use super::*;

    #[test]
    fn default_schemas_support_all_calls() {
        let s = default_schemas().unwrap();
        let supported = resolve(s);

        for (req, _) in TYPED_CALLS {
            assert!(supported.contains(req), "{req} not supported");
        }
    }

    #[test]
    fn partial_schemas() {
        let s = SchemaSet::from_json(
            r#"{ "nested": {
                "Ping": { "fields": {} },
                "Success": { "fields": {} },
                "MessageType": { "values": { "MessageType_Ping": 1, "MessageType_Success": 2 } }
            } }"#,
        )
        .unwrap();

        let supported = resolve(&s);
        assert_eq!(supported, HashSet::from(["Ping"]));
    }

    #[test]
    fn request_fields() {
        let f = to_fields(&Ping {
            message: Some("hi".to_string()),
            button_protection: None,
        })
        .unwrap();
        assert_eq!(Value::Object(f), json!({ "message": "hi" }));

        let f = to_fields(&GetEntropy { size: 32 }).unwrap();
        assert_eq!(Value::Object(f), json!({ "size": 32 }));
    }

    #[test]
    fn typed_responses() {
        let m = Message::new(
            "Features",
            json!({ "major_version": 2, "minor_version": 1, "patch_version": 0, "label": "x" })
                .as_object()
                .cloned()
                .unwrap(),
        );

        let f: Features = from_message(m).unwrap();
        assert_eq!(f.version(), "2.1.0");
        assert_eq!(f.label.as_deref(), Some("x"));
        assert!(f.capabilities.is_empty());

        let m = Message::new("Success", Fields::new());
        let e = from_message::<Features>(m).unwrap_err();
        assert_eq!(e.code, ErrorCode::ResponseUnexpectedType);
    }
}
