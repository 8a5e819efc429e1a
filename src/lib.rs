//! turnie-link library
//! Companion controller for the turnie wireless display peripheral: discovers
//! the device over BLE, keeps a bonded connection across restarts, and
//! transfers text and pixel-art content as chunked JSON frames.
//!
//! The UI layer only talks to [`session::Session`]; everything below it is
//! the connection controller, the transfer encoder and the transport adapter.

pub mod core;
pub mod error;
pub mod session;

pub use crate::core::link::{BondedDevice, DeviceId, OutboundPayload, PeripheralRef};
pub use error::{EncodeError, LinkError, TransferError, TransportError};
pub use session::{Session, SessionSnapshot};
