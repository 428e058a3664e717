// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Session and transport configuration

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{ErrorCode, HardwareError};

/// Default local bridge address
pub const DEFAULT_BRIDGE_URL: &str = "http://127.0.0.1:21320";

/// Well-known local bridge ports
pub const BRIDGE_PORTS: [u16; 2] = [21320, 21325];

/// `Origin` header sent to the local bridge from non-browser runtimes
pub const BRIDGE_ORIGIN: &str = "https://jssdk.onekey.so";

/// BLE GATT service UUID
pub const BLE_SERVICE_UUID: &str = "00000001-0000-1000-8000-00805f9b34fb";

/// BLE write characteristic UUID
pub const BLE_WRITE_UUID: &str = "00000002-0000-1000-8000-00805f9b34fb";

/// BLE notify characteristic UUID
pub const BLE_NOTIFY_UUID: &str = "00000003-0000-1000-8000-00805f9b34fb";

/// USB HID report size
pub const USB_FRAME_SIZE: usize = 64;

/// Default BLE frame size
pub const BLE_FRAME_SIZE: usize = 64;

/// Aggregate transport configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub bridge: BridgeOptions,
    pub ble: BleOptions,
    pub usb: UsbOptions,
    pub emulator: EmulatorOptions,
}

impl Options {
    /// Load options from a JSON file, missing fields take default values
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HardwareError> {
        let p = path.as_ref();

        let s = std::fs::read_to_string(p).map_err(|e| {
            HardwareError::new(
                ErrorCode::RuntimeError,
                format!("Failed to read {}: {}", p.display(), e),
            )
        })?;

        let o = serde_json::from_str(&s)?;

        Ok(o)
    }
}

/// HTTP bridge options
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, clap::Args)]
#[serde(default)]
pub struct BridgeOptions {
    /// Bridge base URL
    #[clap(long = "bridge-url", env = "HWLINK_BRIDGE_URL", default_value = DEFAULT_BRIDGE_URL)]
    pub url: String,

    /// Timeout for bridge management requests (enumerate / acquire / release)
    #[clap(long = "bridge-timeout-ms", env = "HWLINK_BRIDGE_TIMEOUT_MS", default_value = "10000")]
    pub request_timeout_ms: u64,
}

impl BridgeOptions {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_BRIDGE_URL.to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

/// BLE options
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleOptions {
    /// Maximum frame (characteristic write) size
    pub frame_size: usize,
    /// Scan duration for device enumeration
    pub scan_timeout_ms: u64,
}

impl BleOptions {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}

impl Default for BleOptions {
    fn default() -> Self {
        Self {
            frame_size: BLE_FRAME_SIZE,
            scan_timeout_ms: 5_000,
        }
    }
}

/// USB HID options
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UsbOptions {
    /// Reader poll interval, bounding release latency
    pub read_timeout_ms: i32,
}

impl Default for UsbOptions {
    fn default() -> Self {
        Self {
            read_timeout_ms: 100,
        }
    }
}

/// Emulator options
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, clap::Args)]
#[serde(default)]
pub struct EmulatorOptions {
    /// Number of emulated devices
    #[clap(long = "emulator-devices", env = "HWLINK_EMULATOR_DEVICES", default_value = "1")]
    pub devices: usize,

    /// Hold button requests until a simulated press, rather than confirming on ack
    #[clap(long = "emulator-manual-confirm")]
    pub manual_confirm: bool,

    /// Emulated frame size
    #[clap(long = "emulator-frame-size", default_value = "64")]
    pub frame_size: usize,
}

impl Default for EmulatorOptions {
    fn default() -> Self {
        Self {
            devices: 1,
            manual_confirm: false,
            frame_size: USB_FRAME_SIZE,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn load_partial_options() {
        let d = std::env::temp_dir().join(format!("hwlink-options-{}.json", std::process::id()));
        std::fs::write(
            &d,
            r#"{ "bridge": { "url": "http://127.0.0.1:21325" }, "emulator": { "devices": 2 } }"#,
        )
        .unwrap();

        let o = Options::load(&d).unwrap();
        let _ = std::fs::remove_file(&d);

        assert_eq!(o.bridge.url, "http://127.0.0.1:21325");
        assert_eq!(o.bridge.request_timeout_ms, 10_000);
        assert_eq!(o.emulator.devices, 2);
        assert_eq!(o.emulator.frame_size, USB_FRAME_SIZE);
        assert_eq!(o.ble, BleOptions::default());
    }

    #[test]
    fn load_missing_file() {
        let e = Options::load("/nonexistent/hwlink.json").unwrap_err();
        assert_eq!(e.code, ErrorCode::RuntimeError);
    }
}
