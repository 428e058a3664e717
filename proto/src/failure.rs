// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Device failure responses

use std::str::FromStr;

use num_enum::TryFromPrimitive;
use serde_json::Value;
use strum::{Display, EnumString};

use crate::{Message, FAILURE_MESSAGE};

/// Failure codes reported by the device in `Failure` messages
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString, TryFromPrimitive)]
#[repr(u32)]
pub enum FailureType {
    /// Code missing or not recognised
    Unknown = 0,
    UnexpectedMessage = 1,
    ButtonExpected = 2,
    DataError = 3,
    ActionCancelled = 4,
    PinExpected = 5,
    PinCancelled = 6,
    PinInvalid = 7,
    InvalidSignature = 8,
    ProcessError = 9,
    NotEnoughFunds = 10,
    NotInitialized = 11,
    PinMismatch = 12,
    WipeCodeMismatch = 13,
    InvalidSession = 14,
    FirmwareError = 99,
}

impl FailureType {
    /// Resolve a failure code from its JSON form, either `Failure_Name` or a number
    pub fn from_value(v: &Value) -> Self {
        match v {
            Value::String(s) => {
                let name = s.strip_prefix("Failure_").unwrap_or(s);
                Self::from_str(name).unwrap_or(Self::Unknown)
            }
            Value::Number(n) => n
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .and_then(|n| Self::try_from(n).ok())
                .unwrap_or(Self::Unknown),
            _ => Self::Unknown,
        }
    }

    /// Wire name of this failure code, as used in schema enums
    pub fn wire_name(&self) -> String {
        format!("Failure_{self}")
    }
}

/// Failure reported by the device in response to a call
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceFailure {
    pub code: FailureType,
    pub message: String,
}

/// Check a decoded message for a device `Failure`
///
/// Must be applied to every decoded response before it is returned to a caller.
pub fn check_for_application_error(m: &Message) -> Option<DeviceFailure> {
    if m.name != FAILURE_MESSAGE {
        return None;
    }

    let code = m
        .fields
        .get("code")
        .map(FailureType::from_value)
        .unwrap_or(FailureType::Unknown);

    let message = match m.fields.get("message") {
        Some(Value::String(s)) => s.clone(),
        _ => "Failure".to_string(),
    };

    Some(DeviceFailure { code, message })
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::test::fields;

    #[test]
    fn parse_codes() {
        assert_eq!(
            FailureType::from_value(&json!("Failure_ActionCancelled")),
            FailureType::ActionCancelled
        );
        assert_eq!(FailureType::from_value(&json!(7)), FailureType::PinInvalid);
        assert_eq!(FailureType::from_value(&json!(500)), FailureType::Unknown);
        assert_eq!(FailureType::from_value(&json!("Bogus")), FailureType::Unknown);
        assert_eq!(FailureType::PinMismatch.wire_name(), "Failure_PinMismatch");
    }

    #[test]
    fn non_failure_passes() {
        let m = Message::new("Success", fields(json!({ "message": "ok" })));
        assert_eq!(check_for_application_error(&m), None);
    }

    #[test]
    fn failure_without_fields() {
        let m = Message::new("Failure", Default::default());

        assert_eq!(
            check_for_application_error(&m),
            Some(DeviceFailure {
                code: FailureType::Unknown,
                message: "Failure".to_string()
            })
        );
    }
}
