// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Call dispatcher
//!
//! A session holds a single [CallSlot]. Starting a call occupies the slot
//! with a [PendingCall], which is resolved by frame reassembly (push
//! transports) or by the write response (response transports), and cleared
//! before the call returns.
//!
//! ```text
//!          begin                 resolve / reject
//!   Idle ─────────▶ CallInFlight ─────────────────▶ Idle
//!                        │  control call / forced
//!                        └──────────────────────────▶ (rejected, replaced)
//! ```

use std::time::Duration;

use log::{debug, warn};
use tokio::sync::oneshot;

use crate::{
    transport::{Delivery, Transport},
    ErrorCode, HardwareError,
};

/// Calls permitted to preempt an in-flight call without forcing
pub const CONTROL_CALLS: &[&str] = &["Initialize", "Cancel"];

/// Check whether a message name is a control call
pub fn is_control_call(name: &str) -> bool {
    CONTROL_CALLS.contains(&name)
}

/// Per-call options
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CallOptions {
    /// Preempt any in-flight call
    pub force_preempt: bool,
    /// Timeout applied by transports supporting per-write timeouts
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn forced() -> Self {
        Self {
            force_preempt: true,
            ..Default::default()
        }
    }
}

/// Result delivered to a pending call, a complete message buffer
pub(crate) type CallResult = Result<Vec<u8>, HardwareError>;

/// Snapshot of the in-flight call
#[derive(Clone, Debug, PartialEq)]
pub struct InFlight {
    pub name: String,
    pub device: String,
    /// Call was started as a control or forced call
    pub preemptive: bool,
}

/// The single outstanding call for a session
#[derive(Debug)]
pub(crate) struct PendingCall {
    seq: u64,
    name: String,
    device: String,
    allow_preemption: bool,
    tx: oneshot::Sender<CallResult>,
}

/// Single-flight call slot
#[derive(Debug, Default)]
pub(crate) struct CallSlot {
    pending: Option<PendingCall>,
    next_seq: u64,
}

impl CallSlot {
    /// Occupy the slot for a new call, returning the call sequence number and
    /// the receiver its result will be delivered to
    pub fn begin(
        &mut self,
        name: &str,
        device: &str,
        force: bool,
    ) -> Result<(u64, oneshot::Receiver<CallResult>), HardwareError> {
        let preempt = force || is_control_call(name);

        if let Some(p) = &self.pending {
            if !preempt {
                return Err(HardwareError::new(
                    ErrorCode::TransportCallInProgress,
                    format!("{} call in progress on {}", p.name, p.device),
                ));
            }
        }

        if let Some(p) = self.pending.take() {
            debug!(
                "{} preempting {} (seq: {}, preemptive: {})",
                name, p.name, p.seq, p.allow_preemption
            );

            let _ = p.tx.send(Err(HardwareError::new(
                ErrorCode::BleForceCleanRunPromise,
                format!("{} preempted by {}", p.name, name),
            )));
        }

        self.next_seq += 1;
        let seq = self.next_seq;

        let (tx, rx) = oneshot::channel();
        self.pending = Some(PendingCall {
            seq,
            name: name.to_string(),
            device: device.to_string(),
            allow_preemption: preempt,
            tx,
        });

        Ok((seq, rx))
    }

    /// Deliver a result to the pending call for `device`, returning false where
    /// no call for this device is pending
    pub fn resolve(&mut self, device: &str, r: CallResult) -> bool {
        match &self.pending {
            Some(p) if p.device == device => (),
            _ => return false,
        }

        if let Some(p) = self.pending.take() {
            debug!("Resolving {} (seq: {}, ok: {})", p.name, p.seq, r.is_ok());
            let _ = p.tx.send(r);
        }

        true
    }

    /// Clear the slot if still occupied by call `seq`
    pub fn finish(&mut self, seq: u64) {
        if matches!(&self.pending, Some(p) if p.seq == seq) {
            self.pending = None;
        }
    }

    /// Fetch the in-flight call, if any
    pub fn in_flight(&self) -> Option<InFlight> {
        self.pending.as_ref().map(|p| InFlight {
            name: p.name.clone(),
            device: p.device.clone(),
            preemptive: p.allow_preemption,
        })
    }
}

/// Write frames for a call and await its result
///
/// Completes early if the pending call is resolved or rejected while frames
/// are still being written.
pub(crate) async fn exchange(
    transport: &dyn Transport,
    device: &str,
    frames: Vec<Vec<u8>>,
    timeout: Option<Duration>,
    mut rx: oneshot::Receiver<CallResult>,
) -> CallResult {
    let delivery = transport.delivery();

    let write = async {
        let mut reply = None;
        for f in frames.iter() {
            reply = transport.write(device, f, timeout).await?;
        }
        Ok::<_, HardwareError>(reply)
    };
    tokio::pin!(write);

    let reply = tokio::select! {
        r = &mut rx => return r.unwrap_or_else(|_| Err(abandoned())),
        w = &mut write => w?,
    };

    match (delivery, reply) {
        (Delivery::Response, Some(b)) => Ok(b),
        (Delivery::Response, None) => {
            warn!("Response transport returned no reply for {}", device);
            Err(HardwareError::new(
                ErrorCode::MalformedMessage,
                "Transport returned no reply",
            ))
        }
        (Delivery::Push, _) => rx.await.unwrap_or_else(|_| Err(abandoned())),
    }
}

fn abandoned() -> HardwareError {
    HardwareError::new(ErrorCode::RuntimeError, "Call abandoned by session")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn single_flight() {
        let mut s = CallSlot::default();

        let (seq, _rx) = s.begin("Ping", "a", false).unwrap();
        assert_eq!(s.in_flight().map(|f| f.name), Some("Ping".to_string()));

        // Non-control calls are rejected, for any device
        for d in ["a", "b"] {
            let e = s.begin("GetFeatures", d, false).unwrap_err();
            assert_eq!(e.code, ErrorCode::TransportCallInProgress);
        }

        // Slot still held by the first call
        assert_eq!(s.in_flight().map(|f| f.name), Some("Ping".to_string()));

        s.finish(seq);
        assert_eq!(s.in_flight(), None);

        assert!(s.begin("GetFeatures", "a", false).is_ok());
    }

    #[test]
    fn control_calls_preempt() {
        let mut s = CallSlot::default();

        let (_seq, mut rx) = s.begin("Ping", "a", false).unwrap();
        let (seq, _rx) = s.begin("Cancel", "a", false).unwrap();

        assert_eq!(
            rx.try_recv().unwrap().unwrap_err().code,
            ErrorCode::BleForceCleanRunPromise
        );

        let f = s.in_flight().unwrap();
        assert_eq!(f.name, "Cancel");
        assert!(f.preemptive);

        // Forced calls preempt control calls too
        let (_, _rx) = s.begin("Ping", "a", true).unwrap();

        // The preempted call finishing leaves the new call in place
        s.finish(seq);
        assert_eq!(s.in_flight().map(|f| f.name), Some("Ping".to_string()));
    }

    #[test]
    fn resolve_matches_device() {
        let mut s = CallSlot::default();

        let (_seq, mut rx) = s.begin("Ping", "a", false).unwrap();

        assert!(!s.resolve("b", Ok(vec![1])));
        assert!(s.resolve("a", Ok(vec![2])));
        assert!(!s.resolve("a", Ok(vec![3])));

        assert_eq!(rx.try_recv().unwrap(), Ok(vec![2]));
        assert_eq!(s.in_flight(), None);
    }
}
