// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Bluetooth Low Energy transport
//!
//! BLE access is platform specific, so the transport is driven through a
//! [BleAdapter] supplied by the host application. Frames are written to the
//! write characteristic, and notifications from the notify characteristic
//! are forwarded to the session as frames.
//!
//! A notification carrying [PAIRING_REJECTED] is not a frame: it signals the
//! user rejected pairing, and fails any pending call immediately.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};

use super::{Delivery, Transport, TransportKind};
use crate::{
    config::{BleOptions, BLE_NOTIFY_UUID, BLE_SERVICE_UUID, BLE_WRITE_UUID},
    events::{EventSink, TransportEvent},
    DeviceInfo, ErrorCode, HardwareError,
};

/// Notification value signalling the user rejected pairing
pub const PAIRING_REJECTED: &[u8] = b"PairingRejected";

/// BLE adapter state
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
pub enum AdapterState {
    PoweredOn,
    PoweredOff,
    Unsupported,
    Unauthorized,
}

/// Peripheral found while scanning
#[derive(Clone, Debug, PartialEq)]
pub struct Peripheral {
    pub id: String,
    pub name: Option<String>,
}

/// BLE adapter errors
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum BleError {
    #[error("Bluetooth adapter powered off")]
    PoweredOff,

    #[error("Bluetooth unsupported")]
    Unsupported,

    #[error("Bluetooth permission denied")]
    Unauthorized,

    #[error("Peripheral {0} not found")]
    NotFound(String),

    #[error("Scan failed: {0}")]
    Scan(String),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Characteristic write failed: {0}")]
    Write(String),

    #[error("Peripheral {0} disconnected")]
    Disconnected(String),
}

impl From<BleError> for HardwareError {
    fn from(e: BleError) -> Self {
        let code = match &e {
            BleError::PoweredOff => ErrorCode::BlePoweredOff,
            BleError::Unsupported => ErrorCode::BleUnsupported,
            BleError::Unauthorized => ErrorCode::BlePermissionError,
            BleError::NotFound(_) => ErrorCode::DeviceNotFound,
            BleError::Scan(_) => ErrorCode::BleScanError,
            BleError::Connect(_) => ErrorCode::BleConnectedError,
            BleError::Write(_) => ErrorCode::BleWriteCharacteristicError,
            BleError::Disconnected(_) => ErrorCode::DeviceDisconnected,
        };

        HardwareError::new(code, e.to_string())
    }
}

/// Platform BLE capability
///
/// Notification channels are closed by the adapter when the peripheral disconnects.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Fetch adapter state
    async fn state(&self) -> Result<AdapterState, BleError>;

    /// Scan for peripherals advertising `service`
    async fn scan(&self, service: &str, timeout: Duration) -> Result<Vec<Peripheral>, BleError>;

    /// Connect to a peripheral, returning its discovered service UUIDs
    async fn connect(&self, id: &str) -> Result<Vec<String>, BleError>;

    /// Subscribe to notifications on a characteristic
    async fn subscribe(
        &self,
        id: &str,
        characteristic: &str,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<(), BleError>;

    /// Write a value to a characteristic
    async fn write(&self, id: &str, characteristic: &str, value: &[u8]) -> Result<(), BleError>;

    /// Disconnect from a peripheral
    async fn disconnect(&self, id: &str) -> Result<(), BleError>;
}

/// Connected peripheral
struct Connection {
    /// Notification forwarding task
    forward: JoinHandle<()>,
}

/// BLE transport over a [BleAdapter]
pub struct BleTransport {
    adapter: Arc<dyn BleAdapter>,
    opts: BleOptions,
    connections: Mutex<HashMap<String, Connection>>,
    /// Advertised names from the last scan, by peripheral id
    names: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for BleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleTransport")
            .field("opts", &self.opts)
            .finish()
    }
}

impl BleTransport {
    pub fn new(adapter: Arc<dyn BleAdapter>, opts: BleOptions) -> Self {
        Self {
            adapter,
            opts,
            connections: Mutex::new(HashMap::new()),
            names: Mutex::new(HashMap::new()),
        }
    }

    /// Check the adapter is usable
    async fn check_state(&self) -> Result<(), HardwareError> {
        match self.adapter.state().await? {
            AdapterState::PoweredOn => Ok(()),
            AdapterState::PoweredOff => Err(BleError::PoweredOff.into()),
            AdapterState::Unsupported => Err(BleError::Unsupported.into()),
            AdapterState::Unauthorized => Err(BleError::Unauthorized.into()),
        }
    }
}

/// Forward notifications to the session until the adapter closes the channel
async fn forward(id: String, mut rx: mpsc::UnboundedReceiver<Vec<u8>>, sink: EventSink) {
    while let Some(v) = rx.recv().await {
        let evt = match v.as_slice() == PAIRING_REJECTED {
            true => {
                warn!("Pairing rejected for {}", id);
                TransportEvent::PairingRejected { id: id.clone() }
            }
            false => TransportEvent::Frame {
                id: id.clone(),
                bytes: v,
            },
        };

        if sink.send(evt).is_err() {
            debug!("Session closed, stopping notifications for {}", id);
            return;
        }
    }

    debug!("Notifications ended for {}", id);
    let _ = sink.send(TransportEvent::Disconnected { id });
}

#[async_trait]
impl Transport for BleTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    fn delivery(&self) -> Delivery {
        Delivery::Push
    }

    fn max_frame_size(&self) -> usize {
        self.opts.frame_size
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, HardwareError> {
        self.check_state().await?;

        let peripherals = self
            .adapter
            .scan(BLE_SERVICE_UUID, self.opts.scan_timeout())
            .await?;

        let devices: Vec<_> = peripherals
            .into_iter()
            .map(|p| DeviceInfo {
                name: p.name.unwrap_or_else(|| p.id.clone()),
                id: p.id,
            })
            .collect();

        let mut names = self.names.lock().await;
        names.extend(devices.iter().map(|d| (d.id.clone(), d.name.clone())));

        Ok(devices)
    }

    async fn acquire(&self, id: &str, sink: EventSink) -> Result<DeviceInfo, HardwareError> {
        self.check_state().await?;

        // Drop any existing connection
        if let Some(c) = self.connections.lock().await.remove(id) {
            c.forward.abort();
        }

        let services = self.adapter.connect(id).await?;

        let service_found = services
            .iter()
            .any(|s| s.eq_ignore_ascii_case(BLE_SERVICE_UUID));
        if !service_found {
            let _ = self.adapter.disconnect(id).await;

            return Err(HardwareError::new(
                ErrorCode::BleRequiredUUID,
                format!("{id} does not expose service {BLE_SERVICE_UUID}"),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(e) = self.adapter.subscribe(id, BLE_NOTIFY_UUID, tx).await {
            error!("Failed to subscribe to {}: {}", id, e);
            let _ = self.adapter.disconnect(id).await;
            return Err(e.into());
        }

        let forward = tokio::spawn(forward(id.to_string(), rx, sink));
        self.connections
            .lock()
            .await
            .insert(id.to_string(), Connection { forward });

        // Names are only reported by scans, fall back to the id if not enumerated
        let name = self
            .names
            .lock()
            .await
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string());

        Ok(DeviceInfo {
            id: id.to_string(),
            name,
        })
    }

    async fn release(&self, id: &str) -> Result<(), HardwareError> {
        let c = match self.connections.lock().await.remove(id) {
            Some(c) => c,
            None => return Ok(()),
        };

        c.forward.abort();

        if let Err(e) = self.adapter.disconnect(id).await {
            warn!("Failed to disconnect {}: {}", id, e);
        }

        Ok(())
    }

    async fn write(
        &self,
        id: &str,
        frame: &[u8],
        _timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, HardwareError> {
        if !self.connections.lock().await.contains_key(id) {
            return Err(HardwareError::new(
                ErrorCode::TransportNotFound,
                format!("{id} not acquired"),
            ));
        }

        self.adapter
            .write(id, BLE_WRITE_UUID, frame)
            .await
            .map_err(|e| match e {
                BleError::Disconnected(_) => HardwareError::from(e),
                e => HardwareError::new(ErrorCode::BleWriteCharacteristicError, e.to_string()),
            })?;

        Ok(None)
    }
}
