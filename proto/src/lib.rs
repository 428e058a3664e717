// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Message schema, codec and framing definitions for hardware wallet communication
//!
//! This crate provides the transport-independent half of the protocol:
//!
//! - [schema]: loads a protobufjs-style JSON schema bundle into an immutable [SchemaSet]
//! - [codec]: encodes named messages with JSON field maps into framed message buffers
//!   and decodes them back, validating against the schema
//! - [frame]: splits message buffers into transport-sized frames
//! - [reassembly]: reconstitutes inbound frames into complete message buffers, per device
//! - [failure]: detects device `Failure` responses
//!
//! A framed message is laid out as follows, with all integers big-endian:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      '?'      |      '#'      |      '#'      |  MESSAGE_TYPE |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  MESSAGE_TYPE |                    LENGTH                     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    LENGTH     |                  PAYLOAD...                   /
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The payload uses the protobuf wire format, driven by the loaded schema.

pub mod codec;
pub mod failure;
pub mod frame;
pub mod reassembly;
pub mod schema;

mod error;
pub use error::Error;

pub use codec::{decode, encode, encode_frames, Fields, Message};
pub use failure::{check_for_application_error, DeviceFailure, FailureType};
pub use frame::{is_header_frame, split, EncodedFrame, FrameHeader, HEADER_LEN, MAGIC};
pub use reassembly::Reassembler;
pub use schema::{default_schemas, SchemaSet};

/// Name of the device failure message
pub const FAILURE_MESSAGE: &str = "Failure";

/// Name of the enum mapping message names to wire type identifiers
pub const MESSAGE_TYPE_ENUM: &str = "MessageType";
