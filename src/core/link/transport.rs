//! Transport adapter boundary.
//!
//! The controller drives a `Transport` with fire-and-forget requests and
//! consumes the adapter's inbound notifications from a single ordered event
//! channel. Implementations must preserve per-peripheral delivery order on
//! that channel; the controller does not reorder events.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::link::types::{DeviceId, PeripheralRef};
use crate::error::TransportError;

/// Write endpoint of the active session. Borrowed by the transfer path for
/// the duration of one send call, never cached across calls.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Writes one chunk. `with_response` selects acknowledged delivery;
    /// the chunked transfer protocol requires it (see the encoder docs).
    async fn write(&self, bytes: &[u8], with_response: bool) -> Result<(), TransportError>;
}

/// Notify endpoint of the active session. Enabling it makes the transport
/// emit `TransportEvent::ValueUpdated` for every peripheral-sent value.
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    async fn set_notify(&self, enabled: bool) -> Result<(), TransportError>;
}

/// The pair of characteristic handles resolved for one connection.
#[derive(Clone)]
pub struct SessionChannels {
    pub write: Arc<dyn MessageChannel>,
    pub notify: Arc<dyn NotifyChannel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    PoweredOn,
    /// Powered off, unauthorized or unsupported. Not retried.
    Unavailable,
}

/// Inbound notifications from the transport, delivered in emission order on
/// one channel so they serialize onto the controller task.
pub enum TransportEvent {
    StateChanged(AdapterState),
    Advertisement(PeripheralRef),
    Connected(DeviceId),
    ServicesDiscovered {
        id: DeviceId,
        result: Result<Uuid, TransportError>,
    },
    CharacteristicsDiscovered {
        id: DeviceId,
        result: Result<SessionChannels, TransportError>,
    },
    /// A value arrived on the notify characteristic.
    ValueUpdated(Result<Vec<u8>, TransportError>),
    ConnectFailed {
        id: DeviceId,
        error: TransportError,
    },
    Disconnected {
        id: DeviceId,
        error: Option<TransportError>,
    },
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Creates the event channel a transport reports into and the controller
/// consumes from.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Scan/connect/discovery primitives of the wireless stack. All methods
/// acknowledge the request only; outcomes arrive as `TransportEvent`s.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts advertising discovery filtered to the given service. A scan
    /// already in progress is cancelled first.
    async fn start_scan(&self, service: Uuid) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Tries to resolve a previously seen identifier without scanning.
    /// `None` means the transport no longer remembers the device and the
    /// caller should fall back to a filtered scan.
    async fn resolve(&self, id: &DeviceId) -> Result<Option<PeripheralRef>, TransportError>;

    async fn connect(&self, id: &DeviceId) -> Result<(), TransportError>;

    async fn disconnect(&self, id: &DeviceId) -> Result<(), TransportError>;

    async fn discover_services(&self, id: &DeviceId, service: Uuid) -> Result<(), TransportError>;

    async fn discover_characteristics(
        &self,
        id: &DeviceId,
        service: Uuid,
    ) -> Result<(), TransportError>;
}
