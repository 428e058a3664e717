// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Transport and session events
//!
//! Transports push [TransportEvent]s into a per-session channel, which the
//! session consumes to drive reassembly, call resolution and disconnect
//! cleanup. Sessions publish [SessionEvent]s to subscribers.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::DeviceHandle;

/// Events pushed by transport drivers
#[derive(Clone, Debug, PartialEq)]
pub enum TransportEvent {
    /// Raw frame received from a device
    Frame { id: String, bytes: Vec<u8> },
    /// Device physically disconnected or connection lost
    Disconnected { id: String },
    /// User rejected pairing with the device
    PairingRejected { id: String },
}

impl TransportEvent {
    /// Device identifier this event relates to
    pub fn id(&self) -> &str {
        match self {
            Self::Frame { id, .. } | Self::Disconnected { id } | Self::PairingRejected { id } => id,
        }
    }
}

/// Sender used by transport drivers to deliver [TransportEvent]s
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Events published by a [Session](crate::Session)
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    /// Device acquired
    DeviceConnect(DeviceHandle),
    /// Acquired device disconnected
    DeviceDisconnect(DeviceHandle),
    /// Device requested button confirmation during a typed call
    ButtonRequest { id: String, code: Option<String> },
}
