// Copyright (c) 2022-2023 The MobileCoin Foundation

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

use hwlink_proto::{DeviceFailure, Error as ProtoError, FailureType};

/// Canonical error codes, stable across transports
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[repr(u16)]
#[non_exhaustive]
pub enum ErrorCode {
    UnknownError = 0,

    // Codec / framing
    SchemaNotFound = 100,
    MalformedMessage = 101,
    UnexpectedContinuation = 102,
    InvalidParameter = 103,
    ResponseUnexpectedType = 104,

    // Dispatcher / session
    TransportNotConfigured = 200,
    TransportCallInProgress = 201,
    TransportNotFound = 202,
    RuntimeError = 203,

    // Device
    DeviceNotFound = 300,
    DeviceDisconnected = 301,
    DeviceInterruptedFromOutside = 302,
    DeviceFailure = 303,
    ActionCancelled = 304,
    PinInvalid = 305,
    PinCancelled = 306,
    PinMismatch = 307,

    // USB
    UsbError = 400,

    // BLE
    BleRequiredUUID = 500,
    BlePoweredOff = 501,
    BleUnsupported = 502,
    BlePermissionError = 503,
    BleScanError = 504,
    BleConnectedError = 505,
    BleWriteCharacteristicError = 506,
    BleDeviceBondedCanceled = 507,
    BleForceCleanRunPromise = 508,

    // Bridge
    NetworkError = 600,
    BridgeNetworkError = 601,
    BridgeTimeoutError = 602,
}

impl ErrorCode {
    /// Numeric value for this code
    pub fn code(&self) -> u16 {
        *self as u16
    }
}

/// Canonical error returned by every session and call operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HardwareError {
    pub code: ErrorCode,
    pub message: String,
}

impl HardwareError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Build an error using the code name as the message
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.to_string())
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl From<ErrorCode> for HardwareError {
    fn from(code: ErrorCode) -> Self {
        Self::from_code(code)
    }
}

impl From<ProtoError> for HardwareError {
    fn from(e: ProtoError) -> Self {
        let code = match &e {
            ProtoError::SchemaNotFound(_) => ErrorCode::SchemaNotFound,
            ProtoError::MalformedMessage(_) => ErrorCode::MalformedMessage,
            ProtoError::UnexpectedContinuation(_) => ErrorCode::UnexpectedContinuation,
            ProtoError::InvalidField { .. }
            | ProtoError::InvalidFrame(_)
            | ProtoError::InvalidSchema(_) => ErrorCode::InvalidParameter,
        };

        Self::new(code, e.to_string())
    }
}

/// Convert failures reported by the device
impl From<DeviceFailure> for HardwareError {
    fn from(f: DeviceFailure) -> Self {
        let code = match f.code {
            FailureType::ActionCancelled => ErrorCode::ActionCancelled,
            FailureType::PinInvalid => ErrorCode::PinInvalid,
            FailureType::PinCancelled => ErrorCode::PinCancelled,
            FailureType::PinMismatch => ErrorCode::PinMismatch,
            _ => ErrorCode::DeviceFailure,
        };

        Self::new(code, f.message)
    }
}

impl From<serde_json::Error> for HardwareError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(ErrorCode::InvalidParameter, e.to_string())
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn codes_are_unique() {
        let codes: HashSet<_> = ErrorCode::iter().map(|c| c.code()).collect();
        assert_eq!(codes.len(), ErrorCode::iter().count());
    }

    #[test]
    fn device_failure_mapping() {
        let tests = &[
            (FailureType::ActionCancelled, ErrorCode::ActionCancelled),
            (FailureType::PinInvalid, ErrorCode::PinInvalid),
            (FailureType::PinCancelled, ErrorCode::PinCancelled),
            (FailureType::PinMismatch, ErrorCode::PinMismatch),
            (FailureType::DataError, ErrorCode::DeviceFailure),
            (FailureType::Unknown, ErrorCode::DeviceFailure),
        ];

        for (failure, code) in tests {
            let e = HardwareError::from(DeviceFailure {
                code: *failure,
                message: "nope".to_string(),
            });

            assert_eq!(e, HardwareError::new(*code, "nope"));
        }
    }

    #[test]
    fn proto_error_mapping() {
        let e = HardwareError::from(ProtoError::SchemaNotFound("Foo".to_string()));
        assert_eq!(e.code, ErrorCode::SchemaNotFound);

        let e = HardwareError::from(ProtoError::InvalidField {
            field: "size".to_string(),
            reason: "expected an unsigned integer".to_string(),
        });
        assert_eq!(e.code, ErrorCode::InvalidParameter);
    }

    #[test]
    fn serialize_error() {
        let e = HardwareError::new(ErrorCode::DeviceDisconnected, "gone");
        let v = serde_json::to_value(&e).unwrap();

        assert_eq!(
            v,
            serde_json::json!({ "code": "DeviceDisconnected", "message": "gone" })
        );
        assert_eq!(e.to_string(), "DeviceDisconnected: gone");
    }
}
