// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Inbound frame reassembly
//!
//! Frames are accumulated per device until the length declared by the most
//! recent header frame is satisfied, at which point the complete message
//! buffer (header included) is returned and the accumulator reset.
//!
//! Transports must deliver frames in order and without loss, no
//! resequencing is performed.

use std::collections::HashMap;

use log::{debug, warn};

use crate::{frame::FrameHeader, Error, HEADER_LEN};

/// Upper bound on a declared message length
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Accumulator for a single device
#[derive(Debug, Default)]
struct ReassemblyBuffer {
    /// Accumulated bytes, starting with the header frame
    bytes: Vec<u8>,
    /// Payload length declared by the header frame
    declared: Option<usize>,
}

impl ReassemblyBuffer {
    fn reset(&mut self) {
        self.bytes.clear();
        self.declared = None;
    }
}

/// Per-device frame reassembler
#[derive(Debug, Default)]
pub struct Reassembler {
    buffers: HashMap<String, ReassemblyBuffer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ingest a frame for a device, returning the complete message buffer once
    /// the declared length is satisfied
    ///
    /// Bytes beyond the declared length (report padding) are discarded.
    pub fn ingest(&mut self, device: &str, frame: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let b = self.buffers.entry(device.to_string()).or_default();

        match FrameHeader::parse(frame) {
            Some(h) => {
                let declared = h.length as usize;
                if declared > MAX_MESSAGE_LEN {
                    b.reset();
                    return Err(Error::MalformedMessage(format!(
                        "declared length {declared} exceeds maximum {MAX_MESSAGE_LEN}"
                    )));
                }

                if b.declared.is_some() {
                    warn!(
                        "Discarding {} partial bytes for {} on new header",
                        b.bytes.len(),
                        device
                    );
                }

                b.bytes.clear();
                b.bytes.extend_from_slice(frame);
                b.declared = Some(declared);
            }
            None => {
                if b.declared.is_none() {
                    b.reset();
                    return Err(Error::UnexpectedContinuation(device.to_string()));
                }

                b.bytes.extend_from_slice(frame);
            }
        }

        let declared = match b.declared {
            Some(d) => d,
            None => return Ok(None),
        };

        if b.bytes.len() - HEADER_LEN < declared {
            debug!(
                "Reassembling {}: {} / {} bytes",
                device,
                b.bytes.len() - HEADER_LEN,
                declared
            );
            return Ok(None);
        }

        let mut complete = std::mem::take(&mut b.bytes);
        complete.truncate(HEADER_LEN + declared);
        b.reset();

        Ok(Some(complete))
    }

    /// Discard any partial state for a device
    pub fn discard(&mut self, device: &str) {
        if let Some(b) = self.buffers.remove(device) {
            if !b.bytes.is_empty() {
                debug!("Discarded {} partial bytes for {}", b.bytes.len(), device);
            }
        }
    }

    /// Number of bytes accumulated for a device
    pub fn buffered(&self, device: &str) -> usize {
        self.buffers.get(device).map(|b| b.bytes.len()).unwrap_or(0)
    }

    /// Check whether no partial message is held for a device
    pub fn is_idle(&self, device: &str) -> bool {
        self.buffers
            .get(device)
            .map(|b| b.declared.is_none())
            .unwrap_or(true)
    }
}
