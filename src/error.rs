//! Error taxonomy for the link layer.
//! Connection-level failures are folded into the published session state;
//! transfer-level failures are returned to the caller of the send intent.

use thiserror::Error;

/// Connection-level failures. These never abort the controller task; each one
/// maps to a `ConnectionState` transition plus a last-error field the UI can
/// surface ("disconnected, tap to retry").
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The radio is powered off or the platform has no usable adapter.
    /// Reported once, not retried.
    #[error("bluetooth transport unavailable")]
    TransportUnavailable,
    /// The auto-connect deadline elapsed before the bonded device resolved.
    #[error("auto-connect timed out")]
    DiscoveryTimeout,
    /// Connect or service/characteristic discovery failed.
    #[error("link failure: {0}")]
    LinkFailure(String),
    /// The peripheral dropped the link without the app asking for it.
    #[error("connection lost")]
    LinkLost,
}

/// Failures of one send intent. Rejected sends leave no partial artifact on
/// our side; chunks already written before a mid-transfer failure are not
/// rolled back (the peripheral discards incomplete frames on its next write).
#[derive(Debug, Error)]
pub enum TransferError {
    /// No active session: nothing has been written.
    #[error("no active session, connect before sending")]
    NotReady,
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// A chunk write was refused by the transport mid-transfer.
    #[error("chunk write failed: {0}")]
    Write(String),
}

/// Failures while turning a payload into a framed chunk sequence.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Zero-length payloads are rejected before any transport call.
    #[error("payload is empty")]
    Empty,
    #[error("frame serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failures reported by a transport adapter implementation.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The identifier is not known to this transport (stale `PeripheralRef`
    /// or a bonded record from a previous process).
    #[error("unknown device: {0}")]
    UnknownDevice(String),
    #[error("{0}")]
    Backend(String),
}
