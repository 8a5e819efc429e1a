//! Link layer for the turnie display peripheral: connection lifecycle,
//! chunked transfer protocol, transport adapter boundary and bonded-device
//! persistence.

mod bluest;
mod constants;
mod controller;
mod encoder;
mod store;
mod transport;
mod types;

pub use self::bluest::BluestTransport;
pub use constants::*;
pub use controller::{Command, LinkController, SessionSnapshot};
pub use encoder::{Chunk, MessageFrame, OutboundPayload, encode, send};
pub use store::{BondedStore, JsonFileStore, MemoryStore};
pub use transport::{
    AdapterState, EventReceiver, EventSender, MessageChannel, NotifyChannel, SessionChannels,
    Transport, TransportEvent, event_channel,
};
pub use types::{
    ActiveSession, BondedDevice, ConnectionState, DeviceId, DiscoveredDevices, PeripheralRef,
};
