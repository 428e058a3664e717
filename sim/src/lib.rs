// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Simulated hardware wallet firmware
//!
//! Provides a [Firmware] abstraction over decoded request / response
//! messages, and [SimDevice], a minimal device implementing the management
//! messages from the default schema bundle. This is used by the emulator
//! transport to exercise sessions without hardware.
//!
//! Calls requiring user confirmation reply with a `ButtonRequest`, then wait
//! for a `ButtonAck` followed by a (simulated) button press before issuing
//! the final response.

use log::{debug, warn};
use rand::{rngs::OsRng, RngCore};
use serde_json::{json, Value};
use strum::Display;

use hwlink_proto::{Fields, FailureType, Message};

/// Largest entropy request served by [SimDevice]
pub const MAX_ENTROPY: u32 = 1024;

/// Device firmware interface, handling one request at a time
pub trait Firmware: Send {
    /// Handle a request message, returning the response if one is to be sent immediately
    fn handle(&mut self, req: &Message) -> Option<Message>;

    /// Simulate a physical button press, returning any response released by this
    fn press_button(&mut self) -> Option<Message>;
}

/// Simulated device configuration
#[derive(Clone, Debug, PartialEq)]
pub struct SimOptions {
    /// Label reported in `Features`
    pub label: String,
    /// Device identifier reported in `Features`
    pub device_id: String,
    /// Model reported in `Features`
    pub model: String,
    /// Firmware version reported in `Features`
    pub version: (u32, u32, u32),
    /// Confirm button requests immediately on `ButtonAck`
    pub auto_confirm: bool,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            label: "hwlink sim".to_string(),
            device_id: "0000000000000000000000000".to_string(),
            model: "sim".to_string(),
            version: (1, 0, 0),
            auto_confirm: true,
        }
    }
}

/// Interaction state for a [SimDevice]
#[derive(Clone, Debug, PartialEq, Display)]
pub enum SimState {
    /// Ready for a new request
    Idle,
    /// `ButtonRequest` sent, awaiting `ButtonAck`
    AwaitingAck(Message),
    /// `ButtonAck` received, awaiting a button press
    AwaitingButton(Message),
}

/// Simulated device implementing the management messages
#[derive(Debug)]
pub struct SimDevice {
    opts: SimOptions,
    state: SimState,
    session_id: Option<Vec<u8>>,
}

impl SimDevice {
    pub fn new(opts: SimOptions) -> Self {
        Self {
            opts,
            state: SimState::Idle,
            session_id: None,
        }
    }

    /// Current interaction state
    pub fn state(&self) -> &SimState {
        &self.state
    }

    /// Active session identifier, created on `Initialize`
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    fn features(&self) -> Message {
        let (major, minor, patch) = self.opts.version;

        let mut f = fields(json!({
            "vendor": "hwlink",
            "major_version": major,
            "minor_version": minor,
            "patch_version": patch,
            "bootloader_mode": false,
            "device_id": self.opts.device_id,
            "pin_protection": false,
            "passphrase_protection": false,
            "label": self.opts.label,
            "initialized": true,
            "unlocked": true,
            "model": self.opts.model,
            "capabilities": ["Capability_Bitcoin", "Capability_Ethereum"],
        }));

        if let Some(s) = &self.session_id {
            f.insert("session_id".to_string(), Value::String(hex::encode(s)));
        }

        Message::new("Features", f)
    }

    fn initialize(&mut self, req: &Message) -> Message {
        // Resume a matching session, otherwise start a new one
        let requested = req
            .fields
            .get("session_id")
            .and_then(|v| v.as_str())
            .and_then(|s| hex::decode(s).ok());

        match (requested, &self.session_id) {
            (Some(r), Some(s)) if &r == s => debug!("Resuming session {}", hex::encode(s)),
            _ => {
                let mut s = vec![0u8; 32];
                OsRng.fill_bytes(&mut s);
                debug!("New session {}", hex::encode(&s));
                self.session_id = Some(s);
            }
        }

        self.state = SimState::Idle;

        self.features()
    }

    fn entropy(&self, req: &Message) -> Message {
        let size = req
            .fields
            .get("size")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        if size > MAX_ENTROPY as u64 {
            return failure(
                FailureType::DataError,
                &format!("Entropy size {size} exceeds {MAX_ENTROPY}"),
            );
        }

        let mut e = vec![0u8; size as usize];
        OsRng.fill_bytes(&mut e);

        Message::new("Entropy", fields(json!({ "entropy": hex::encode(e) })))
    }

    /// Hold `resp` pending confirmation, returning the button request
    fn confirm(&mut self, resp: Message) -> Message {
        self.state = SimState::AwaitingAck(resp);

        Message::new(
            "ButtonRequest",
            fields(json!({ "code": "ButtonRequest_ProtectCall" })),
        )
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new(SimOptions::default())
    }
}

impl Firmware for SimDevice {
    fn handle(&mut self, req: &Message) -> Option<Message> {
        debug!("Sim request: {} (state: {})", req.name, self.state);

        // Requests outside the confirmation flow abandon any held operation
        let held = std::mem::replace(&mut self.state, SimState::Idle);

        let resp = match (req.name.as_str(), held) {
            ("ButtonAck", SimState::AwaitingAck(resp)) if self.opts.auto_confirm => resp,
            ("ButtonAck", SimState::AwaitingAck(resp)) => {
                self.state = SimState::AwaitingButton(resp);
                return None;
            }
            ("Cancel", _) => failure(FailureType::ActionCancelled, "Cancelled"),
            ("Initialize", _) => self.initialize(req),
            ("GetFeatures", _) => self.features(),
            ("Ping", _) => {
                let m = req
                    .fields
                    .get("message")
                    .cloned()
                    .unwrap_or_else(|| Value::String(String::new()));
                let resp = Message::new("Success", fields(json!({ "message": m })));

                match req.fields.get("button_protection") {
                    Some(Value::Bool(true)) => self.confirm(resp),
                    _ => resp,
                }
            }
            ("GetEntropy", _) => {
                let resp = self.entropy(req);
                match resp.name == "Entropy" {
                    true => self.confirm(resp),
                    false => resp,
                }
            }
            ("EndSession", _) => {
                self.session_id = None;
                Message::new("Success", fields(json!({ "message": "Session ended" })))
            }
            (name, _) => {
                warn!("Unhandled request: {}", name);
                failure(FailureType::UnexpectedMessage, "Unexpected message")
            }
        };

        debug!("Sim response: {}", resp.name);

        Some(resp)
    }

    fn press_button(&mut self) -> Option<Message> {
        match std::mem::replace(&mut self.state, SimState::Idle) {
            SimState::AwaitingButton(resp) => Some(resp),
            other => {
                debug!("Button press ignored (state: {})", other);
                self.state = other;
                None
            }
        }
    }
}

/// Build a `Failure` message
pub fn failure(code: FailureType, message: &str) -> Message {
    Message::new(
        "Failure",
        fields(json!({ "code": code.wire_name(), "message": message })),
    )
}

fn fields(v: Value) -> Fields {
    match v {
        Value::Object(m) => m,
        _ => Fields::new(),
    }
}

#[cfg(test)]
mod test {
    use hwlink_proto::{check_for_application_error, decode, default_schemas, encode};

    use super::*;

    fn req(name: &str, v: Value) -> Message {
        Message::new(name, fields(v))
    }

    /// Pass a message through the codec, as the emulator transport would
    fn wire(m: Message) -> Message {
        let s = default_schemas().unwrap();
        let b = encode(s, &m.name, &m.fields).unwrap();
        decode(s, &b).unwrap()
    }

    #[test]
    fn initialize_reports_features() {
        let mut d = SimDevice::default();

        let f = wire(d.handle(&req("Initialize", json!({}))).unwrap());
        assert_eq!(f.name, "Features");
        assert_eq!(f.fields["major_version"], json!(1));

        let session = f.fields["session_id"].as_str().unwrap().to_string();
        assert_eq!(session.len(), 64);

        // Resume with the same session id
        let f = d
            .handle(&req("Initialize", json!({ "session_id": session })))
            .unwrap();
        assert_eq!(f.fields["session_id"], json!(session));

        // Unknown session id starts a new one
        let f = d
            .handle(&req("Initialize", json!({ "session_id": "00" })))
            .unwrap();
        assert_ne!(f.fields["session_id"], json!(session));
    }

    #[test]
    fn ping_without_protection() {
        let mut d = SimDevice::default();

        let r = d.handle(&req("Ping", json!({ "message": "hello" }))).unwrap();
        assert_eq!(r, req("Success", json!({ "message": "hello" })));
        assert_eq!(d.state(), &SimState::Idle);
    }

    #[test]
    fn ping_with_button_press() {
        let mut d = SimDevice::new(SimOptions {
            auto_confirm: false,
            ..Default::default()
        });

        let r = d
            .handle(&req("Ping", json!({ "message": "a", "button_protection": true })))
            .unwrap();
        assert_eq!(r.name, "ButtonRequest");
        assert_eq!(r.fields["code"], json!("ButtonRequest_ProtectCall"));

        // Press before ack has no effect
        assert_eq!(d.press_button(), None);

        assert_eq!(d.handle(&req("ButtonAck", json!({}))), None);
        assert!(matches!(d.state(), SimState::AwaitingButton(_)));

        assert_eq!(
            d.press_button(),
            Some(req("Success", json!({ "message": "a" })))
        );
        assert_eq!(d.state(), &SimState::Idle);
    }

    #[test]
    fn auto_confirm_on_ack() {
        let mut d = SimDevice::default();

        let r = d.handle(&req("GetEntropy", json!({ "size": 16 }))).unwrap();
        assert_eq!(r.name, "ButtonRequest");

        let r = wire(d.handle(&req("ButtonAck", json!({}))).unwrap());
        assert_eq!(r.name, "Entropy");
        assert_eq!(r.fields["entropy"].as_str().unwrap().len(), 32);
    }

    #[test]
    fn cancel_drops_held_operation() {
        let mut d = SimDevice::new(SimOptions {
            auto_confirm: false,
            ..Default::default()
        });

        d.handle(&req("Ping", json!({ "button_protection": true })));
        d.handle(&req("ButtonAck", json!({})));

        let r = d.handle(&req("Cancel", json!({}))).unwrap();
        let f = check_for_application_error(&r).unwrap();
        assert_eq!(f.code, FailureType::ActionCancelled);

        assert_eq!(d.press_button(), None);
    }

    #[test]
    fn failures() {
        let mut d = SimDevice::default();

        let r = d.handle(&req("GetEntropy", json!({ "size": 4096 }))).unwrap();
        assert_eq!(
            check_for_application_error(&r).map(|f| f.code),
            Some(FailureType::DataError)
        );

        let r = wire(d.handle(&req("PinMatrixAck", json!({ "pin": "1234" }))).unwrap());
        assert_eq!(
            check_for_application_error(&r).map(|f| f.code),
            Some(FailureType::UnexpectedMessage)
        );
    }
}
