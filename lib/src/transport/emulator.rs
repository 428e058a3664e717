// Copyright (c) 2022-2023 The MobileCoin Foundation

//! In-process emulator transport
//!
//! Hosts one or more [Firmware] instances, reassembling written frames into
//! requests on the device side and pushing response frames back through the
//! session [EventSink]. Button presses and physical disconnects may be
//! simulated for testing.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, warn};

use hwlink_proto::{
    decode, default_schemas, encode, split, FailureType, Message, Reassembler, SchemaSet,
};
use hwlink_sim::{failure, Firmware, SimDevice, SimOptions};

use super::{Delivery, Transport, TransportKind};
use crate::{
    config::EmulatorOptions,
    events::{EventSink, TransportEvent},
    DeviceInfo, ErrorCode, HardwareError,
};

/// Default emulated device name
pub const EMULATOR_NAME: &str = "Emulator";

/// Emulated device
struct EmulatedDevice {
    name: String,
    firmware: Box<dyn Firmware>,
    /// Device is plugged in (and enumerable)
    present: bool,
    /// Session sink, set while acquired
    sink: Option<EventSink>,
}

struct EmulatorState {
    /// Devices by identifier, in insertion order
    devices: Vec<(String, EmulatedDevice)>,
    /// Device-side reassembly of written frames
    rx: Reassembler,
}

impl EmulatorState {
    fn device(&mut self, id: &str) -> Option<&mut EmulatedDevice> {
        self.devices
            .iter_mut()
            .find(|(i, _)| i == id)
            .map(|(_, d)| d)
    }
}

/// Software device transport
pub struct EmulatorTransport {
    schemas: &'static SchemaSet,
    frame_size: usize,
    state: Mutex<EmulatorState>,
    writes: AtomicUsize,
}

impl std::fmt::Debug for EmulatorTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmulatorTransport")
            .field("frame_size", &self.frame_size)
            .finish()
    }
}

impl EmulatorTransport {
    /// Create an emulator with [SimDevice] instances per `opts`,
    /// identified as `emulator-1`, `emulator-2`...
    pub fn new(opts: &EmulatorOptions) -> Result<Self, HardwareError> {
        let e = Self::empty(opts.frame_size)?;

        for i in 0..opts.devices {
            let sim = SimDevice::new(SimOptions {
                device_id: format!("{:025}", i + 1),
                auto_confirm: !opts.manual_confirm,
                ..Default::default()
            });

            e.add_device(format!("emulator-{}", i + 1), EMULATOR_NAME, Box::new(sim));
        }

        Ok(e)
    }

    /// Create an emulator with no devices
    pub fn empty(frame_size: usize) -> Result<Self, HardwareError> {
        Ok(Self {
            schemas: default_schemas()?,
            frame_size,
            state: Mutex::new(EmulatorState {
                devices: vec![],
                rx: Reassembler::new(),
            }),
            writes: AtomicUsize::new(0),
        })
    }

    /// Plug in a device running the provided firmware
    pub fn add_device(&self, id: impl Into<String>, name: &str, firmware: Box<dyn Firmware>) {
        let id = id.into();
        debug!("Adding emulated device {} ({})", id, name);

        let mut s = self.state();
        s.devices.retain(|(i, _)| i != &id);
        s.devices.push((
            id,
            EmulatedDevice {
                name: name.to_string(),
                firmware,
                present: true,
                sink: None,
            },
        ));
    }

    /// Simulate a button press on a device
    pub fn press_button(&self, id: &str) -> Result<(), HardwareError> {
        let mut s = self.state();

        let d = s.device(id).ok_or_else(|| not_found(id))?;
        let sink = d.sink.clone();

        match (d.firmware.press_button(), sink) {
            (Some(resp), Some(sink)) => self.respond(id, &sink, &resp),
            (Some(resp), None) => {
                warn!("Dropping {} from {} (not acquired)", resp.name, id);
                Ok(())
            }
            (None, _) => Ok(()),
        }
    }

    /// Simulate a physical disconnect, the device is no longer enumerable
    pub fn disconnect(&self, id: &str) -> Result<(), HardwareError> {
        let mut s = self.state();
        s.rx.discard(id);

        let d = s.device(id).ok_or_else(|| not_found(id))?;
        d.present = false;

        if let Some(sink) = d.sink.take() {
            debug!("Disconnecting emulated device {}", id);
            let _ = sink.send(TransportEvent::Disconnected { id: id.to_string() });
        }

        Ok(())
    }

    /// Simulate a device being plugged back in
    pub fn reconnect(&self, id: &str) -> Result<(), HardwareError> {
        let mut s = self.state();
        let d = s.device(id).ok_or_else(|| not_found(id))?;
        d.present = true;
        Ok(())
    }

    /// Number of frames written to this transport
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }

    fn state(&self) -> MutexGuard<'_, EmulatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Encode and push a response, padding the final frame as a HID report would be
    fn respond(&self, id: &str, sink: &EventSink, resp: &Message) -> Result<(), HardwareError> {
        let buff = encode(self.schemas, &resp.name, &resp.fields)?;
        let mut frames = split(&buff, self.frame_size)?;

        if let Some(f) = frames.last_mut() {
            f.resize(self.frame_size, 0);
        }

        debug!("Emulator {} response: {} ({} frames)", id, resp.name, frames.len());

        for f in frames {
            sink.send(TransportEvent::Frame {
                id: id.to_string(),
                bytes: f,
            })
            .map_err(|_| HardwareError::new(ErrorCode::RuntimeError, "Session closed"))?;
        }

        Ok(())
    }
}

#[async_trait]
impl Transport for EmulatorTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Emulator
    }

    fn delivery(&self) -> Delivery {
        Delivery::Push
    }

    fn max_frame_size(&self) -> usize {
        self.frame_size
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, HardwareError> {
        let s = self.state();

        let devices = s
            .devices
            .iter()
            .filter(|(_, d)| d.present)
            .map(|(id, d)| DeviceInfo {
                id: id.clone(),
                name: d.name.clone(),
            })
            .collect();

        Ok(devices)
    }

    async fn acquire(&self, id: &str, sink: EventSink) -> Result<DeviceInfo, HardwareError> {
        let mut s = self.state();
        s.rx.discard(id);

        let d = match s.device(id) {
            Some(d) if d.present => d,
            _ => return Err(HardwareError::new(ErrorCode::DeviceNotFound, id)),
        };

        d.sink = Some(sink);

        Ok(DeviceInfo {
            id: id.to_string(),
            name: d.name.clone(),
        })
    }

    async fn release(&self, id: &str) -> Result<(), HardwareError> {
        let mut s = self.state();
        s.rx.discard(id);

        if let Some(d) = s.device(id) {
            d.sink = None;
        }

        Ok(())
    }

    async fn write(
        &self,
        id: &str,
        frame: &[u8],
        _timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, HardwareError> {
        self.writes.fetch_add(1, Ordering::Relaxed);

        let mut s = self.state();

        let sink = match s.device(id).and_then(|d| d.sink.clone()) {
            Some(s) => s,
            None => return Err(not_found(id)),
        };

        let buff = match s.rx.ingest(id, frame)? {
            Some(b) => b,
            None => return Ok(None),
        };

        let resp = match decode(self.schemas, &buff) {
            Ok(req) => s.device(id).and_then(|d| d.firmware.handle(&req)),
            Err(e) => {
                warn!("Emulator {} failed to decode request: {}", id, e);
                Some(failure(FailureType::DataError, &e.to_string()))
            }
        };

        drop(s);

        if let Some(r) = resp {
            self.respond(id, &sink, &r)?;
        }

        Ok(None)
    }
}

fn not_found(id: &str) -> HardwareError {
    HardwareError::new(ErrorCode::TransportNotFound, format!("{id} not acquired"))
}
