// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Transport driver abstraction
//!
//! Every transport (USB, BLE, HTTP bridge, emulator) implements [Transport],
//! which covers device discovery, acquisition and single frame writes.
//! Inbound frames and disconnects are pushed to the session through the
//! [EventSink] provided at acquisition, except for [Delivery::Response]
//! transports, where each write returns the device reply directly.

use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{events::EventSink, DeviceInfo, HardwareError};

pub mod ble;
pub use ble::{BleAdapter, BleTransport};

#[cfg(feature = "transport_bridge")]
pub mod bridge;
#[cfg(feature = "transport_bridge")]
pub use bridge::BridgeTransport;

pub mod emulator;
pub use emulator::EmulatorTransport;

#[cfg(feature = "transport_hid")]
pub mod usb;
#[cfg(feature = "transport_hid")]
pub use usb::UsbTransport;

/// Supported transport kinds
#[derive(
    Copy,
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    clap::ValueEnum,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
#[non_exhaustive]
pub enum TransportKind {
    /// Direct USB HID
    Usb,
    /// Bluetooth Low Energy
    Ble,
    /// Local HTTP bridge daemon
    Bridge,
    /// In-process software device
    Emulator,
}

/// Inbound delivery model for a transport
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Frames are pushed to the session [EventSink] as they arrive
    Push,
    /// Each write returns the complete reply buffer
    Response,
}

/// Transport driver capability contract
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Kind of this transport
    fn kind(&self) -> TransportKind;

    /// Inbound delivery model
    fn delivery(&self) -> Delivery;

    /// Largest frame accepted by [Transport::write]
    fn max_frame_size(&self) -> usize;

    /// List currently reachable devices, returning an empty list when none are found
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, HardwareError>;

    /// Acquire a device, registering `sink` for inbound frames and disconnect events
    async fn acquire(&self, id: &str, sink: EventSink) -> Result<DeviceInfo, HardwareError>;

    /// Release a device, idempotent
    async fn release(&self, id: &str) -> Result<(), HardwareError>;

    /// Write a single frame to an acquired device
    ///
    /// [Delivery::Response] transports return the reply buffer, push transports return `None`.
    async fn write(
        &self,
        id: &str,
        frame: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, HardwareError>;
}
