// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Handles for acquired devices

use serde::{Deserialize, Serialize};

use crate::transport::TransportKind;

/// Device reported by transport enumeration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Transport-specific device identifier
    pub id: String,
    /// Human readable device name
    pub name: String,
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:16} ({})", self.name, self.id)
    }
}

/// Handle for an acquired device, owned by a [Session](crate::Session)
/// from `acquire` until `release` or disconnect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Transport-specific device identifier
    pub id: String,
    /// Human readable device name
    pub name: String,
    /// Transport this device was acquired with
    pub kind: TransportKind,
    /// Per-session counter, distinguishing repeated acquisitions of the same device
    #[serde(rename = "connectId")]
    pub connect_id: u64,
}

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:16} ({}, {}, connection {})",
            self.name, self.kind, self.id, self.connect_id
        )
    }
}
