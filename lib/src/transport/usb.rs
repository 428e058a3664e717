// Copyright (c) 2022-2023 The MobileCoin Foundation

//! USB HID transport
//!
//! Devices exchange fixed size 64-byte reports. Writes are prefixed with a
//! zero report id and padded, reads are performed by a reader thread per
//! acquired device which pushes frames to the session and reports a
//! disconnect when reads fail.

use std::{
    collections::HashMap,
    ffi::CString,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use hidapi::{HidApi, HidDevice, HidError};
use log::{debug, error, warn};
use strum::Display;

use super::{Delivery, Transport, TransportKind};
use crate::{
    config::{UsbOptions, USB_FRAME_SIZE},
    events::{EventSink, TransportEvent},
    DeviceInfo, ErrorCode, HardwareError,
};

/// Device operating mode
#[derive(Copy, Clone, Debug, PartialEq, Eq, Display)]
pub enum UsbMode {
    Bootloader,
    Firmware,
}

/// Supported device filter entry
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct UsbFilter {
    pub vendor_id: u16,
    pub product_id: u16,
    pub family: &'static str,
    pub mode: UsbMode,
}

/// Supported (vendor, product) pairs, enumeration is restricted to these
pub const USB_FILTERS: &[UsbFilter] = &[
    UsbFilter {
        vendor_id: 0x534c,
        product_id: 0x0001,
        family: "Classic",
        mode: UsbMode::Firmware,
    },
    UsbFilter {
        vendor_id: 0x1209,
        product_id: 0x53c0,
        family: "Touch",
        mode: UsbMode::Bootloader,
    },
    UsbFilter {
        vendor_id: 0x1209,
        product_id: 0x53c1,
        family: "Touch",
        mode: UsbMode::Firmware,
    },
];

/// Find the filter entry for a (vendor, product) pair
pub fn usb_filter(vendor_id: u16, product_id: u16) -> Option<&'static UsbFilter> {
    USB_FILTERS
        .iter()
        .find(|f| f.vendor_id == vendor_id && f.product_id == product_id)
}

impl From<HidError> for HardwareError {
    fn from(e: HidError) -> Self {
        HardwareError::new(ErrorCode::UsbError, e.to_string())
    }
}

/// Failure to create the HID context, reported as a runtime error
fn init_error(e: HidError) -> HardwareError {
    HardwareError::new(
        ErrorCode::RuntimeError,
        format!("USB HID initialisation failed: {e}"),
    )
}

/// Acquired device
struct UsbDevice {
    device: Arc<Mutex<HidDevice>>,
    stop: Arc<AtomicBool>,
}

/// USB HID transport
pub struct UsbTransport {
    api: Mutex<HidApi>,
    opts: UsbOptions,
    devices: Mutex<HashMap<String, UsbDevice>>,
}

impl std::fmt::Debug for UsbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbTransport")
            .field("opts", &self.opts)
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl UsbTransport {
    /// Create a USB transport
    ///
    /// NOTE: only one [HidApi] context should exist at a time
    pub fn new(opts: UsbOptions) -> Result<Self, HardwareError> {
        let api = HidApi::new().map_err(init_error)?;

        Ok(Self {
            api: Mutex::new(api),
            opts,
            devices: Mutex::new(HashMap::new()),
        })
    }

    fn list(&self) -> Result<Vec<DeviceInfo>, HardwareError> {
        let mut api = lock(&self.api);
        api.refresh_devices()?;

        let devices = api
            .device_list()
            .filter_map(|d| {
                let f = usb_filter(d.vendor_id(), d.product_id())?;

                let name = match d.product_string() {
                    Some(p) => format!("{} ({})", p, f.mode),
                    None => format!("{} ({})", f.family, f.mode),
                };

                Some(DeviceInfo {
                    id: d.path().to_string_lossy().to_string(),
                    name,
                })
            })
            .collect();

        Ok(devices)
    }
}

/// Read reports until stopped or the device fails
fn reader(
    id: String,
    device: Arc<Mutex<HidDevice>>,
    stop: Arc<AtomicBool>,
    sink: EventSink,
    timeout_ms: i32,
) {
    let mut buff = [0u8; USB_FRAME_SIZE];

    while !stop.load(Ordering::Relaxed) {
        let r = lock(&device).read_timeout(&mut buff, timeout_ms);

        match r {
            Ok(0) => continue,
            Ok(n) => {
                let evt = TransportEvent::Frame {
                    id: id.clone(),
                    bytes: buff[..n].to_vec(),
                };
                if sink.send(evt).is_err() {
                    debug!("Session closed, stopping reader for {}", id);
                    return;
                }
            }
            Err(e) => {
                if !stop.load(Ordering::Relaxed) {
                    error!("USB read failed for {}: {}", id, e);
                    let _ = sink.send(TransportEvent::Disconnected { id: id.clone() });
                }
                return;
            }
        }
    }

    debug!("Reader stopped for {}", id);
}

#[async_trait]
impl Transport for UsbTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Usb
    }

    fn delivery(&self) -> Delivery {
        Delivery::Push
    }

    fn max_frame_size(&self) -> usize {
        USB_FRAME_SIZE
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, HardwareError> {
        let devices = self.list()?;

        debug!("Found {} USB devices: {:?}", devices.len(), devices);

        Ok(devices)
    }

    async fn acquire(&self, id: &str, sink: EventSink) -> Result<DeviceInfo, HardwareError> {
        let info = self
            .list()?
            .into_iter()
            .find(|d| d.id == id)
            .ok_or_else(|| HardwareError::new(ErrorCode::DeviceNotFound, id))?;

        let path = CString::new(id)
            .map_err(|e| HardwareError::new(ErrorCode::InvalidParameter, e.to_string()))?;
        let device = lock(&self.api).open_path(&path)?;

        let device = Arc::new(Mutex::new(device));
        let stop = Arc::new(AtomicBool::new(false));

        {
            let (id, device, stop) = (id.to_string(), device.clone(), stop.clone());
            let timeout_ms = self.opts.read_timeout_ms;
            std::thread::spawn(move || reader(id, device, stop, sink, timeout_ms));
        }

        if let Some(old) = lock(&self.devices).insert(id.to_string(), UsbDevice { device, stop }) {
            warn!("Replacing existing handle for {}", id);
            old.stop.store(true, Ordering::Relaxed);
        }

        Ok(info)
    }

    async fn release(&self, id: &str) -> Result<(), HardwareError> {
        if let Some(d) = lock(&self.devices).remove(id) {
            debug!("Releasing {}", id);
            d.stop.store(true, Ordering::Relaxed);
        }

        Ok(())
    }

    async fn write(
        &self,
        id: &str,
        frame: &[u8],
        _timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, HardwareError> {
        if frame.len() > USB_FRAME_SIZE {
            return Err(HardwareError::new(
                ErrorCode::InvalidParameter,
                format!("Frame exceeds {USB_FRAME_SIZE} bytes"),
            ));
        }

        let device = match lock(&self.devices).get(id) {
            Some(d) => d.device.clone(),
            None => {
                return Err(HardwareError::new(
                    ErrorCode::TransportNotFound,
                    format!("{id} not acquired"),
                ))
            }
        };

        // Report id, then the padded frame
        let mut report = [0u8; USB_FRAME_SIZE + 1];
        report[1..][..frame.len()].copy_from_slice(frame);

        let n = tokio::task::spawn_blocking(move || lock(&device).write(&report))
            .await
            .map_err(|e| HardwareError::new(ErrorCode::RuntimeError, e.to_string()))??;

        if n < report.len() {
            warn!("Short USB write for {} ({} of {} bytes)", id, n, report.len());
        }

        Ok(None)
    }
}
