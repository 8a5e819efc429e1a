//! Shared data structures for the link module.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::link::constants::UNKNOWN_DEVICE_NAME;
use crate::core::link::transport::{MessageChannel, NotifyChannel};

/// Opaque transport-assigned device identifier. UUID text on macOS, an
/// object path on BlueZ; the controller never looks inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peripheral seen during one scan session. Ephemeral: the id is only
/// guaranteed to resolve while the transport still remembers the device.
#[derive(Debug, Clone, Serialize)]
pub struct PeripheralRef {
    pub id: DeviceId,
    /// Advertised name, if the advertisement carried one.
    pub name: Option<String>,
    /// Signal strength in dBm at discovery time.
    pub rssi: Option<i16>,
}

impl PeripheralRef {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNKNOWN_DEVICE_NAME)
    }
}

/// The single durable record: the last peripheral that completed a full
/// service + characteristic negotiation. Overwritten on each new bond,
/// never deleted by normal flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BondedDevice {
    pub identifier: DeviceId,
    pub display_name: String,
}

/// Characteristic handles bound for the current connection. Exclusively
/// owned by the controller; dropped on any disconnect, including link loss.
#[derive(Clone)]
pub struct ActiveSession {
    pub write: Arc<dyn MessageChannel>,
    pub notify: Arc<dyn NotifyChannel>,
}

impl fmt::Debug for ActiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ActiveSession")
    }
}

/// The connection lifecycle. Exactly one value is live at a time and only
/// the controller task mutates it; everyone else sees snapshots.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting { target: PeripheralRef },
    AutoConnecting { target: BondedDevice },
    Connected { session: ActiveSession },
    Disconnected { last_known: Option<BondedDevice> },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn session(&self) -> Option<&ActiveSession> {
        match self {
            Self::Connected { session } => Some(session),
            _ => None,
        }
    }
}

/// Devices found during the current scan session, ordered by discovery time
/// and deduplicated by identifier.
#[derive(Debug, Clone, Default)]
pub struct DiscoveredDevices {
    devices: Vec<PeripheralRef>,
}

impl DiscoveredDevices {
    /// Appends a device unless one with the same identifier is already
    /// listed. Returns whether the list changed.
    pub fn push(&mut self, device: PeripheralRef) -> bool {
        if self.devices.iter().any(|d| d.id == device.id) {
            return false;
        }
        self.devices.push(device);
        true
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn as_slice(&self) -> &[PeripheralRef] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
