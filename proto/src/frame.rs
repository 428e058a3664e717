// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Frame header and chunking
//!
//! A message buffer starts with a 9-byte header and is split into frames of
//! at most `max_frame_size` bytes. The first (header) frame carries the header
//! and as much payload as fits, subsequent (continuation) frames carry raw
//! payload bytes only.
//!
//! ```text
//! header frame:        [ ? # # | TYPE (2) | LENGTH (4) | payload... ]
//! continuation frame:  [ payload... ]
//! ```

use byteorder::{BigEndian, ByteOrder};

use crate::Error;

/// Fixed marker opening every header frame
pub const MAGIC: [u8; 3] = [0x3f, 0x23, 0x23];

/// Header length (marker, message type, payload length)
pub const HEADER_LEN: usize = 9;

/// A single frame as written to / read from a transport
pub type EncodedFrame = Vec<u8>;

/// Parsed header frame fields
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FrameHeader {
    /// Message type identifier, carried in the header's reserved slot
    pub message_type: u16,
    /// Total payload length, excluding the header
    pub length: u32,
}

impl FrameHeader {
    /// Parse a header from the start of a frame, returning `None` for continuation frames
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if !is_header_frame(frame) {
            return None;
        }

        Some(Self {
            message_type: BigEndian::read_u16(&frame[3..5]),
            length: BigEndian::read_u32(&frame[5..9]),
        })
    }

    /// Encode the header
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut h = [0u8; HEADER_LEN];

        h[..3].copy_from_slice(&MAGIC);
        BigEndian::write_u16(&mut h[3..5], self.message_type);
        BigEndian::write_u32(&mut h[5..9], self.length);

        h
    }
}

/// Check whether a frame begins a new message
pub fn is_header_frame(frame: &[u8]) -> bool {
    frame.len() >= HEADER_LEN && frame[..3] == MAGIC
}

/// Build a message buffer from a message type and encoded payload
pub fn frame_message(message_type: u16, payload: &[u8]) -> Result<Vec<u8>, Error> {
    let length = u32::try_from(payload.len())
        .map_err(|_| Error::InvalidFrame(format!("payload too large ({} bytes)", payload.len())))?;

    let header = FrameHeader {
        message_type,
        length,
    };

    let mut buff = Vec::with_capacity(HEADER_LEN + payload.len());
    buff.extend_from_slice(&header.encode());
    buff.extend_from_slice(payload);

    Ok(buff)
}

/// Split a message buffer into frames of at most `max_frame_size` bytes
///
/// The buffer must begin with a header whose length matches the payload.
/// Output is deterministic: the same inputs always produce the same frames.
pub fn split(buffer: &[u8], max_frame_size: usize) -> Result<Vec<EncodedFrame>, Error> {
    if max_frame_size < HEADER_LEN {
        return Err(Error::InvalidFrame(format!(
            "frame size {max_frame_size} cannot hold a {HEADER_LEN} byte header"
        )));
    }

    let header = FrameHeader::parse(buffer)
        .ok_or_else(|| Error::InvalidFrame("buffer does not start with a header".to_string()))?;

    if header.length as usize != buffer.len() - HEADER_LEN {
        return Err(Error::InvalidFrame(format!(
            "header declares {} payload bytes, buffer holds {}",
            header.length,
            buffer.len() - HEADER_LEN
        )));
    }

    Ok(buffer.chunks(max_frame_size).map(|c| c.to_vec()).collect())
}

#[cfg(test)]
mod test {
    use super::*;

    fn message(payload_len: usize) -> Vec<u8> {
        let payload: Vec<u8> = (0..payload_len).map(|i| i as u8).collect();
        frame_message(1, &payload).unwrap()
    }

    #[test]
    fn header_detection() {
        let m = message(4);
        assert!(is_header_frame(&m));

        // Too short to hold a header
        assert!(!is_header_frame(&m[..8]));

        // Marker mismatch
        let mut c = m.clone();
        c[1] = 0x00;
        assert!(!is_header_frame(&c));

        assert_eq!(
            FrameHeader::parse(&m),
            Some(FrameHeader {
                message_type: 1,
                length: 4
            })
        );
    }

    #[test]
    fn split_header_and_continuations() {
        // 200 byte buffer, 64 byte frames
        let m = message(200 - HEADER_LEN);
        let frames = split(&m, 64).unwrap();

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[0].len(), 64);
        assert!(is_header_frame(&frames[0]));

        let continuation: usize = frames[1..].iter().map(|f| f.len()).sum();
        assert_eq!(continuation, 136);

        assert_eq!(frames.concat(), m);
    }

    #[test]
    fn split_is_deterministic() {
        let m = message(300);

        for size in [9, 10, 63, 64, 65, 512] {
            let a = split(&m, size).unwrap();
            let b = split(&m, size).unwrap();
            assert_eq!(a, b);

            assert!(a.iter().all(|f| f.len() <= size));
            assert_eq!(a.iter().map(|f| f.len()).sum::<usize>(), m.len());
        }
    }

    #[test]
    fn split_empty_payload() {
        let m = message(0);
        let frames = split(&m, 64).unwrap();

        assert_eq!(frames, vec![m]);
    }

    #[test]
    fn split_rejects_bad_input() {
        let m = message(10);

        assert!(matches!(split(&m, 8), Err(Error::InvalidFrame(_))));
        assert!(matches!(split(&m[9..], 64), Err(Error::InvalidFrame(_))));
        assert!(matches!(split(&m[..15], 64), Err(Error::InvalidFrame(_))));
    }
}
