// Copyright (c) 2022-2023 The MobileCoin Foundation

//! Hardware wallet session and transport library (and CLI)
//!
//! A [Session] wraps a single [Transport](transport::Transport) driver
//! (USB HID, BLE, HTTP bridge or the built-in emulator) and provides device
//! enumeration and acquisition, schema configuration, and single-flight
//! request / response calls using the [proto] codec and framing.
//!
//! ```no_run
//! # async fn run() -> Result<(), hwlink::HardwareError> {
//! use hwlink::{calls::GetFeatures, Session, TransportKind};
//!
//! let s = Session::open(TransportKind::Emulator)?;
//! s.configure_default()?;
//!
//! let devices = s.enumerate().await?;
//! let d = s.acquire(&devices[0].id).await?;
//!
//! let f = s.typed_call(&d.id, &GetFeatures {}).await?;
//! println!("firmware: {}", f.version());
//!
//! s.release(&d.id).await?;
//! # Ok(())
//! # }
//! ```

/// Re-export `hwlink-proto` for consumers
pub use hwlink_proto::{self as proto};

pub mod calls;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod transport;

mod error;
pub use error::{ErrorCode, HardwareError};

mod handle;
pub use handle::{DeviceHandle, DeviceInfo};

mod session;
pub use session::{Session, SessionBuilder, BUTTON_ACK, BUTTON_REQUEST};

pub use dispatch::{CallOptions, InFlight};
pub use events::SessionEvent;
pub use transport::TransportKind;
