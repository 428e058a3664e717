// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Device session manager
//!
//! A [Session] owns one transport driver, the configured schemas, the set of
//! acquired devices with their reassembly state, and the single call slot.
//! Transport events are consumed by a per-session task, which completes
//! pending calls and performs disconnect cleanup.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use log::{debug, warn};
use once_cell::sync::OnceCell;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};

use hwlink_proto::{
    check_for_application_error, decode, encode_frames, schema::DEFAULT_BUNDLE, Fields, Message,
    Reassembler, SchemaSet,
};

use crate::{
    calls::{self, Call, Cancel},
    config::Options,
    dispatch::{self, CallOptions, CallSlot, InFlight},
    events::{EventSink, SessionEvent, TransportEvent},
    transport::{BleAdapter, BleTransport, EmulatorTransport, Transport, TransportKind},
    DeviceHandle, DeviceInfo, ErrorCode, HardwareError,
};

/// Device request for user confirmation
pub const BUTTON_REQUEST: &str = "ButtonRequest";

/// Acknowledgement of a [BUTTON_REQUEST]
pub const BUTTON_ACK: &str = "ButtonAck";

/// Capacity of the session event channel
const EVENT_CAPACITY: usize = 64;

/// Builder for [Session]s, supplying transport options and platform capabilities
pub struct SessionBuilder {
    kind: TransportKind,
    opts: Options,
    ble_adapter: Option<Arc<dyn BleAdapter>>,
}

impl SessionBuilder {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            opts: Options::default(),
            ble_adapter: None,
        }
    }

    /// Set transport options
    pub fn options(mut self, opts: Options) -> Self {
        self.opts = opts;
        self
    }

    /// Set the platform BLE adapter, required for [TransportKind::Ble]
    pub fn ble_adapter(mut self, adapter: Arc<dyn BleAdapter>) -> Self {
        self.ble_adapter = Some(adapter);
        self
    }

    /// Initialise the selected transport and open a session
    pub fn open(self) -> Result<Session, HardwareError> {
        let t: Arc<dyn Transport> = match self.kind {
            TransportKind::Usb => usb_transport(&self.opts)?,
            TransportKind::Ble => match self.ble_adapter {
                Some(a) => Arc::new(BleTransport::new(a, self.opts.ble.clone())),
                None => {
                    return Err(HardwareError::new(
                        ErrorCode::RuntimeError,
                        "No BLE adapter available",
                    ))
                }
            },
            TransportKind::Bridge => bridge_transport(&self.opts)?,
            TransportKind::Emulator => Arc::new(EmulatorTransport::new(&self.opts.emulator)?),
        };

        debug!("Opening {} session", self.kind);

        Session::with_transport(t)
    }
}

#[cfg(feature = "transport_hid")]
fn usb_transport(opts: &Options) -> Result<Arc<dyn Transport>, HardwareError> {
    Ok(Arc::new(crate::transport::UsbTransport::new(opts.usb.clone())?))
}

#[cfg(not(feature = "transport_hid"))]
fn usb_transport(_opts: &Options) -> Result<Arc<dyn Transport>, HardwareError> {
    Err(HardwareError::new(
        ErrorCode::RuntimeError,
        "USB support not enabled (transport_hid)",
    ))
}

#[cfg(feature = "transport_bridge")]
fn bridge_transport(opts: &Options) -> Result<Arc<dyn Transport>, HardwareError> {
    Ok(Arc::new(crate::transport::BridgeTransport::new(
        opts.bridge.clone(),
    )?))
}

#[cfg(not(feature = "transport_bridge"))]
fn bridge_transport(_opts: &Options) -> Result<Arc<dyn Transport>, HardwareError> {
    Err(HardwareError::new(
        ErrorCode::RuntimeError,
        "Bridge support not enabled (transport_bridge)",
    ))
}

/// Schemas installed by [Session::configure]
struct Configured {
    schemas: SchemaSet,
    /// Typed calls supported by the schemas
    typed: HashSet<&'static str>,
}

#[derive(Default)]
struct SessionState {
    /// Acquired devices
    devices: HashMap<String, DeviceHandle>,
    /// Per-device inbound reassembly
    reassembler: Reassembler,
    /// Single-flight call slot
    slot: CallSlot,
    next_connect_id: u64,
}

struct SessionInner {
    transport: Arc<dyn Transport>,
    configured: OnceCell<Configured>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    sink: EventSink,
}

/// Device session, created with [Session::open] or [SessionBuilder]
///
/// Lifecycle: `enumerate` → `acquire` → `configure` → `call`* → `release`.
/// Schemas must be configured exactly once before any call.
pub struct Session {
    inner: Arc<SessionInner>,
    pump: JoinHandle<()>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("transport", &self.inner.transport)
            .field("configured", &self.is_configured())
            .finish()
    }
}

impl Session {
    /// Open a session with default options for the specified transport
    pub fn open(kind: TransportKind) -> Result<Self, HardwareError> {
        SessionBuilder::new(kind).open()
    }

    /// Open a session over an existing transport
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_transport(transport: Arc<dyn Transport>) -> Result<Self, HardwareError> {
        let rt = tokio::runtime::Handle::try_current().map_err(|e| {
            HardwareError::new(ErrorCode::RuntimeError, format!("No async runtime: {e}"))
        })?;

        let (sink, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(SessionInner {
            transport,
            configured: OnceCell::new(),
            state: Mutex::new(SessionState::default()),
            events,
            sink,
        });

        let pump = rt.spawn(pump(Arc::downgrade(&inner), rx));

        Ok(Self { inner, pump })
    }

    /// Transport kind for this session
    pub fn kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    /// Install schemas from a JSON bundle
    pub fn configure(&self, bundle: &str) -> Result<(), HardwareError> {
        let schemas = SchemaSet::from_json(bundle)?;
        self.configure_schemas(schemas)
    }

    /// Install the default schema bundle
    pub fn configure_default(&self) -> Result<(), HardwareError> {
        self.configure(DEFAULT_BUNDLE)
    }

    /// Install a parsed schema set
    pub fn configure_schemas(&self, schemas: SchemaSet) -> Result<(), HardwareError> {
        let typed = calls::resolve(&schemas);

        debug!(
            "Configuring {} schemas ({} typed calls)",
            schemas.len(),
            typed.len()
        );

        self.inner
            .configured
            .set(Configured { schemas, typed })
            .map_err(|_| HardwareError::new(ErrorCode::RuntimeError, "Session already configured"))
    }

    pub fn is_configured(&self) -> bool {
        self.inner.configured.get().is_some()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// List reachable devices
    pub async fn enumerate(&self) -> Result<Vec<DeviceInfo>, HardwareError> {
        self.inner.transport.enumerate().await
    }

    /// Acquired devices
    pub fn devices(&self) -> Vec<DeviceHandle> {
        self.inner.state().devices.values().cloned().collect()
    }

    /// Currently in-flight call, if any
    pub fn in_flight(&self) -> Option<InFlight> {
        self.inner.state().slot.in_flight()
    }

    /// Acquire a device, emitting [SessionEvent::DeviceConnect]
    ///
    /// Acquiring an already acquired device returns the existing handle.
    pub async fn acquire(&self, id: &str) -> Result<DeviceHandle, HardwareError> {
        if let Some(h) = self.inner.state().devices.get(id) {
            return Ok(h.clone());
        }

        let t = &self.inner.transport;

        let info = match t.acquire(id, self.inner.sink.clone()).await {
            Ok(i) => i,
            Err(e) => {
                warn!("Failed to acquire {}: {}", id, e);
                let _ = t.release(id).await;
                return Err(e);
            }
        };

        let handle = {
            let mut s = self.inner.state();
            s.next_connect_id += 1;

            let h = DeviceHandle {
                id: info.id,
                name: info.name,
                kind: t.kind(),
                connect_id: s.next_connect_id,
            };

            s.reassembler.discard(id);
            s.devices.insert(id.to_string(), h.clone());

            h
        };

        debug!("Acquired {}", handle);
        self.inner.emit(SessionEvent::DeviceConnect(handle.clone()));

        Ok(handle)
    }

    /// Release a device, idempotent
    ///
    /// Any pending call for the device is rejected.
    pub async fn release(&self, id: &str) -> Result<(), HardwareError> {
        {
            let mut s = self.inner.state();
            s.devices.remove(id);
            s.reassembler.discard(id);
            s.slot.resolve(
                id,
                Err(HardwareError::new(
                    ErrorCode::DeviceDisconnected,
                    format!("{id} released"),
                )),
            );
        }

        self.inner.transport.release(id).await
    }

    /// Release all acquired devices
    pub async fn release_all(&self) -> Result<(), HardwareError> {
        let ids: Vec<_> = self.devices().into_iter().map(|d| d.id).collect();

        let results = futures::future::join_all(ids.iter().map(|id| self.release(id))).await;

        results.into_iter().collect()
    }

    /// Issue a call to an acquired device, returning the decoded response
    ///
    /// Fails with [ErrorCode::TransportCallInProgress] if another call is in
    /// flight, unless `opts.force_preempt` is set or `name` is a control call,
    /// in which case the in-flight call is rejected. Device `Failure`
    /// responses are returned as errors.
    pub async fn call(
        &self,
        device: &str,
        name: &str,
        fields: Fields,
        opts: CallOptions,
    ) -> Result<Message, HardwareError> {
        let c = self.inner.configured()?;

        let (seq, rx) = {
            let mut s = self.inner.state();

            if !s.devices.contains_key(device) {
                return Err(HardwareError::new(
                    ErrorCode::TransportNotFound,
                    format!("{device} not acquired"),
                ));
            }

            s.slot.begin(name, device, opts.force_preempt)?
        };

        // Clear the slot however this call completes
        let _guard = SlotGuard {
            inner: &self.inner,
            seq,
        };

        debug!("Call {} on {} (seq: {})", name, device, seq);

        let t = &self.inner.transport;
        let frames = encode_frames(&c.schemas, name, &fields, t.max_frame_size())?;

        let buff = dispatch::exchange(t.as_ref(), device, frames, opts.timeout, rx).await?;

        let m = decode(&c.schemas, &buff)?;
        if let Some(f) = check_for_application_error(&m) {
            debug!("{} failed on {}: {:?}", name, device, f);
            return Err(f.into());
        }

        debug!("{} on {} returned {}", name, device, m.name);

        Ok(m)
    }

    /// Issue a typed call, acknowledging button requests until the final response
    pub async fn typed_call<C: Call>(
        &self,
        device: &str,
        req: &C,
    ) -> Result<C::Response, HardwareError> {
        if !self.inner.configured()?.typed.contains(C::NAME) {
            return Err(HardwareError::new(
                ErrorCode::SchemaNotFound,
                format!("{} not supported by configured schemas", C::NAME),
            ));
        }

        let fields = calls::to_fields(req)?;
        let mut m = self
            .call(device, C::NAME, fields, CallOptions::default())
            .await?;

        while m.name == BUTTON_REQUEST {
            let code = m
                .fields
                .get("code")
                .and_then(|v| v.as_str())
                .map(String::from);

            debug!("Button request from {} ({:?})", device, code);
            self.inner.emit(SessionEvent::ButtonRequest {
                id: device.to_string(),
                code,
            });

            m = self
                .call(device, BUTTON_ACK, Fields::new(), CallOptions::default())
                .await?;
        }

        calls::from_message(m)
    }

    /// Cancel the current device operation, preempting any in-flight call
    pub async fn cancel(&self, device: &str) -> Result<(), HardwareError> {
        let r = self
            .call(device, Cancel::NAME, Fields::new(), CallOptions::forced())
            .await;

        match r {
            Ok(_) => Ok(()),
            Err(e) if e.code == ErrorCode::ActionCancelled => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

impl SessionInner {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn configured(&self) -> Result<&Configured, HardwareError> {
        self.configured.get().ok_or_else(|| {
            HardwareError::new(
                ErrorCode::TransportNotConfigured,
                "Session schemas not configured",
            )
        })
    }

    fn emit(&self, e: SessionEvent) {
        // No subscribers is not an error
        let _ = self.events.send(e);
    }

    /// Handle an inbound frame
    fn on_frame(&self, id: &str, bytes: &[u8]) {
        let mut s = self.state();

        if !s.devices.contains_key(id) {
            warn!("Dropping frame from unacquired device {}", id);
            return;
        }

        debug!("Frame from {}: {}", id, hex::encode(bytes));

        match s.reassembler.ingest(id, bytes) {
            Ok(None) => (),
            Ok(Some(b)) => {
                if !s.slot.resolve(id, Ok(b)) {
                    warn!("Dropping unsolicited message from {}", id);
                }
            }
            Err(e) => {
                warn!("Reassembly failed for {}: {}", id, e);
                s.slot.resolve(id, Err(e.into()));
            }
        }
    }

    fn on_pairing_rejected(&self, id: &str) {
        let mut s = self.state();

        s.reassembler.discard(id);
        s.slot.resolve(
            id,
            Err(HardwareError::new(
                ErrorCode::BleDeviceBondedCanceled,
                format!("Pairing rejected by {id}"),
            )),
        );
    }

    /// Clean up after a transport-reported disconnect
    async fn on_disconnect(&self, id: &str) {
        {
            let mut s = self.state();

            s.reassembler.discard(id);
            s.slot.resolve(
                id,
                Err(HardwareError::new(
                    ErrorCode::DeviceDisconnected,
                    format!("{id} disconnected"),
                )),
            );

            match s.devices.remove(id) {
                Some(h) => {
                    debug!("Disconnected {}", h);
                    self.emit(SessionEvent::DeviceDisconnect(h));
                }
                None => return,
            }
        }

        if let Err(e) = self.transport.release(id).await {
            warn!("Failed to release {} after disconnect: {}", id, e);
        }
    }
}

/// Clears the call slot on drop, if still held by the call
struct SlotGuard<'a> {
    inner: &'a SessionInner,
    seq: u64,
}

impl<'a> Drop for SlotGuard<'a> {
    fn drop(&mut self) {
        self.inner.state().slot.finish(self.seq);
    }
}

/// Consume transport events for a session
async fn pump(inner: Weak<SessionInner>, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(evt) = rx.recv().await {
        let inner = match inner.upgrade() {
            Some(i) => i,
            None => break,
        };

        match evt {
            TransportEvent::Frame { id, bytes } => inner.on_frame(&id, &bytes),
            TransportEvent::PairingRejected { id } => inner.on_pairing_rejected(&id),
            TransportEvent::Disconnected { id } => inner.on_disconnect(&id).await,
        }
    }

    debug!("Session event pump exiting");
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use serde_json::json;

    use hwlink_proto::{default_schemas, encode, split};

    use super::*;
    use crate::transport::ble::{test::MockAdapter, PAIRING_REJECTED};

    const PERIPHERAL: &str = "AA:BB";

    #[test]
    fn open_requires_runtime() {
        let e = Session::open(TransportKind::Emulator).unwrap_err();
        assert_eq!(e.code, ErrorCode::RuntimeError);
    }

    #[tokio::test]
    async fn open_requires_ble_adapter() {
        let e = Session::open(TransportKind::Ble).unwrap_err();
        assert_eq!(e.code, ErrorCode::RuntimeError);
    }

    async fn ble_session() -> (Arc<Session>, Arc<MockAdapter>) {
        let a = Arc::new(MockAdapter::new());

        let s = SessionBuilder::new(TransportKind::Ble)
            .ble_adapter(a.clone())
            .open()
            .unwrap();
        s.configure_default().unwrap();
        s.acquire(PERIPHERAL).await.unwrap();

        (Arc::new(s), a)
    }

    async fn await_pending(s: &Session) {
        for _ in 0..100 {
            if s.in_flight().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("Timeout waiting for pending call");
    }

    #[tokio::test]
    async fn notifications_resolve_call() {
        let (s, a) = ble_session().await;

        let s1 = s.clone();
        let pending = tokio::spawn(async move {
            s1.call(PERIPHERAL, "GetFeatures", Fields::new(), CallOptions::default())
                .await
        });

        await_pending(&s).await;

        let f = json!({
            "vendor": "ble",
            "major_version": 2,
            "minor_version": 1,
            "patch_version": 0,
            "label": "x".repeat(100),
        });
        let buff = encode(default_schemas().unwrap(), "Features", f.as_object().unwrap()).unwrap();

        let frames = split(&buff, 64).unwrap();
        assert!(frames.len() > 1);
        for frame in frames {
            a.notify(PERIPHERAL, &frame);
        }

        let m = pending.await.unwrap().unwrap();
        assert_eq!(m.name, "Features");
        assert_eq!(m.fields["vendor"], json!("ble"));
        assert_eq!(m.fields["major_version"], json!(2));
        assert_eq!(s.in_flight(), None);
    }

    #[tokio::test]
    async fn pairing_rejected() {
        let (s, a) = ble_session().await;

        let s1 = s.clone();
        let pending = tokio::spawn(async move {
            s1.call(PERIPHERAL, "GetFeatures", Fields::new(), CallOptions::default())
                .await
        });

        await_pending(&s).await;
        a.notify(PERIPHERAL, PAIRING_REJECTED);

        let e = pending.await.unwrap().unwrap_err();
        assert_eq!(e.code, ErrorCode::BleDeviceBondedCanceled);

        // Device remains acquired
        assert_eq!(s.devices().len(), 1);
    }

    #[tokio::test]
    async fn unsolicited_frames_dropped() {
        let (s, a) = ble_session().await;

        let buff = encode(default_schemas().unwrap(), "Success", &Fields::new()).unwrap();
        a.notify(PERIPHERAL, &buff);

        // Pump processes the frame without a pending call
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(s.in_flight(), None);

        // Subsequent calls are unaffected
        let s1 = s.clone();
        let pending = tokio::spawn(async move {
            s1.call(PERIPHERAL, "Ping", Fields::new(), CallOptions::default())
                .await
        });

        await_pending(&s).await;
        a.notify(PERIPHERAL, &buff);

        assert_eq!(pending.await.unwrap().unwrap().name, "Success");
    }
}
