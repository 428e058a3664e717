// Copyright (c) 2022-2023 The MobileCoin Foundation

//! HTTP bridge transport
//!
//! The bridge is a local daemon proxying USB devices over HTTP. All requests
//! are `POST`s, device calls carry the hex-encoded message (without the `?##`
//! marker) and return the hex-encoded reply, so each write yields a complete
//! response and no reassembly is required.
//!
//! | Endpoint                           | Response                          |
//! |------------------------------------|-----------------------------------|
//! | `/`                                | `{ "version": .. }`               |
//! | `/enumerate`                       | `[{ "path": .., "session": .. }]` |
//! | `/acquire/{path}/{previous\|null}` | `{ "session": .. }`               |
//! | `/release/{session}`               | `{}`                              |
//! | `/call/{session}`                  | hex message                       |
//!
//! Failures are reported with non-2xx status and an `{ "error": .. }` body.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use log::{debug, error, warn};
use reqwest::{header::ORIGIN, Client, RequestBuilder, StatusCode, Url};
use serde::{de::DeserializeOwned, Deserialize};
use tokio::sync::Mutex;

use hwlink_proto::MAGIC;

use super::{Delivery, Transport, TransportKind};
use crate::{
    config::{BridgeOptions, BRIDGE_ORIGIN, BRIDGE_PORTS},
    events::{EventSink, TransportEvent},
    DeviceInfo, ErrorCode, HardwareError,
};

/// Device listing entry returned by `/enumerate`
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct BridgeDevice {
    pub path: String,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub product: Option<u16>,
    #[serde(default)]
    pub vendor: Option<u16>,
    #[serde(default)]
    pub debug: bool,
}

impl BridgeDevice {
    fn info(&self) -> DeviceInfo {
        let name = match (self.vendor, self.product) {
            (Some(v), Some(p)) => format!("USB {v:04x}:{p:04x}"),
            _ => format!("Bridge device {}", self.path),
        };

        DeviceInfo {
            id: self.path.clone(),
            name,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
struct VersionResp {
    version: String,
}

#[derive(Clone, Debug, Deserialize)]
struct AcquireResp {
    session: String,
}

#[derive(Clone, Debug, Deserialize)]
struct ErrorResp {
    error: String,
}

/// Acquired bridge device
struct BridgeSession {
    session: String,
    sink: EventSink,
}

/// HTTP bridge transport
pub struct BridgeTransport {
    client: Client,
    url: Url,
    opts: BridgeOptions,
    /// Acquired sessions by device path
    sessions: Mutex<HashMap<String, BridgeSession>>,
}

impl std::fmt::Debug for BridgeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeTransport")
            .field("url", &self.url.as_str())
            .finish()
    }
}

impl BridgeTransport {
    pub fn new(opts: BridgeOptions) -> Result<Self, HardwareError> {
        let url = Url::parse(&opts.url).map_err(|e| {
            HardwareError::new(
                ErrorCode::RuntimeError,
                format!("Invalid bridge url '{}': {}", opts.url, e),
            )
        })?;

        let client = Client::builder()
            .build()
            .map_err(|e| HardwareError::new(ErrorCode::RuntimeError, e.to_string()))?;

        Ok(Self {
            client,
            url,
            opts,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch the bridge version
    pub async fn version(&self) -> Result<String, HardwareError> {
        let r: VersionResp = self.post_json("", self.opts.request_timeout()).await?;
        Ok(r.version)
    }

    /// List devices attached to the bridge
    pub async fn devices(&self) -> Result<Vec<BridgeDevice>, HardwareError> {
        self.post_json("enumerate", self.opts.request_timeout())
            .await
    }

    /// Whether requests to this bridge require the fixed `Origin` header
    fn needs_origin(&self) -> bool {
        let loopback = match self.url.host_str() {
            Some("localhost") => true,
            Some(h) => h
                .trim_start_matches('[')
                .trim_end_matches(']')
                .parse::<std::net::IpAddr>()
                .map(|a| a.is_loopback())
                .unwrap_or(false),
            None => false,
        };

        let port = self.url.port_or_known_default().unwrap_or(0);

        loopback && BRIDGE_PORTS.contains(&port)
    }

    /// Build a POST request for a bridge endpoint
    fn post(&self, endpoint: &str) -> Result<RequestBuilder, HardwareError> {
        let url = self.url.join(endpoint).map_err(|e| {
            HardwareError::new(ErrorCode::RuntimeError, format!("Invalid endpoint: {e}"))
        })?;

        let mut r = self.client.post(url);
        if self.needs_origin() {
            r = r.header(ORIGIN, BRIDGE_ORIGIN);
        }

        Ok(r)
    }

    /// Issue a request, returning the body of successful responses
    async fn send(&self, r: RequestBuilder) -> Result<String, HardwareError> {
        let resp = r.send().await.map_err(request_error)?;
        let status = resp.status();
        let body = resp.text().await.map_err(request_error)?;

        if !status.is_success() {
            return Err(response_error(status, &body));
        }

        Ok(body)
    }

    async fn post_json<R: DeserializeOwned>(
        &self,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<R, HardwareError> {
        let body = self.send(self.post(endpoint)?.timeout(timeout)).await?;

        serde_json::from_str(&body).map_err(|e| {
            HardwareError::new(
                ErrorCode::NetworkError,
                format!("Invalid bridge response: {e}"),
            )
        })
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Bridge
    }

    fn delivery(&self) -> Delivery {
        Delivery::Response
    }

    fn max_frame_size(&self) -> usize {
        usize::MAX
    }

    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, HardwareError> {
        let devices = self.devices().await?;

        debug!("Bridge devices: {:?}", devices);

        Ok(devices.iter().map(BridgeDevice::info).collect())
    }

    async fn acquire(&self, id: &str, sink: EventSink) -> Result<DeviceInfo, HardwareError> {
        let d = self
            .devices()
            .await?
            .into_iter()
            .find(|d| d.path == id)
            .ok_or_else(|| HardwareError::new(ErrorCode::DeviceNotFound, id))?;

        // Acquisition must reference the current session, if any
        let previous = d.session.as_deref().unwrap_or("null");

        let r: AcquireResp = self
            .post_json(
                &format!("acquire/{id}/{previous}"),
                self.opts.request_timeout(),
            )
            .await?;

        debug!("Acquired {} (session: {})", id, r.session);

        self.sessions.lock().await.insert(
            id.to_string(),
            BridgeSession {
                session: r.session,
                sink,
            },
        );

        Ok(d.info())
    }

    async fn release(&self, id: &str) -> Result<(), HardwareError> {
        let s = match self.sessions.lock().await.remove(id) {
            Some(s) => s,
            None => return Ok(()),
        };

        let r = self
            .post(&format!("release/{}", s.session))?
            .timeout(self.opts.request_timeout());

        if let Err(e) = self.send(r).await {
            warn!("Failed to release {} (session {}): {}", id, s.session, e);
        }

        Ok(())
    }

    async fn write(
        &self,
        id: &str,
        frame: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, HardwareError> {
        let session = match self.sessions.lock().await.get(id) {
            Some(s) => s.session.clone(),
            None => {
                return Err(HardwareError::new(
                    ErrorCode::TransportNotFound,
                    format!("{id} not acquired"),
                ))
            }
        };

        let body = frame.strip_prefix(&MAGIC[..]).ok_or_else(|| {
            HardwareError::new(
                ErrorCode::InvalidParameter,
                "Bridge writes must contain a complete message",
            )
        })?;

        let mut r = self
            .post(&format!("call/{session}"))?
            .body(hex::encode(body));
        if let Some(t) = timeout {
            r = r.timeout(t);
        }

        let resp = match self.send(r).await {
            Ok(v) => v,
            Err(e) => {
                if e.code == ErrorCode::DeviceDisconnected {
                    if let Some(s) = self.sessions.lock().await.get(id) {
                        let _ = s.sink.send(TransportEvent::Disconnected { id: id.to_string() });
                    }
                }
                return Err(e);
            }
        };

        let reply = hex::decode(resp.trim()).map_err(|e| {
            HardwareError::new(ErrorCode::NetworkError, format!("Invalid bridge reply: {e}"))
        })?;

        let mut buff = Vec::with_capacity(MAGIC.len() + reply.len());
        buff.extend_from_slice(&MAGIC);
        buff.extend_from_slice(&reply);

        Ok(Some(buff))
    }
}

/// Classify a bridge error string
pub fn classify(error: &str) -> ErrorCode {
    let e = error.to_lowercase();

    if e.contains("device disconnected") {
        ErrorCode::DeviceDisconnected
    } else if e.contains("wrong previous session") || e.contains("session not found") {
        ErrorCode::DeviceInterruptedFromOutside
    } else if e.contains("device not found") {
        ErrorCode::DeviceNotFound
    } else if e.contains("other call in progress") {
        ErrorCode::TransportCallInProgress
    } else if e.contains("cancelled") {
        ErrorCode::ActionCancelled
    } else {
        ErrorCode::BridgeNetworkError
    }
}

/// Convert a non-2xx bridge response
fn response_error(status: StatusCode, body: &str) -> HardwareError {
    match serde_json::from_str::<ErrorResp>(body) {
        Ok(r) => {
            debug!("Bridge error ({}): {}", status, r.error);
            HardwareError::new(classify(&r.error), r.error)
        }
        Err(_) => {
            error!("Bridge request failed ({}): {}", status, body);
            HardwareError::new(ErrorCode::NetworkError, format!("Bridge returned {status}"))
        }
    }
}

/// Convert request failures (connection, timeout, body read)
fn request_error(e: reqwest::Error) -> HardwareError {
    let code = match e.is_timeout() {
        true => ErrorCode::BridgeTimeoutError,
        false => ErrorCode::BridgeNetworkError,
    };

    HardwareError::new(code, e.to_string())
}
