//! Constants for the turnie wire protocol and connection policy:
//! fixed UUIDs, chunking limits and timeouts.

use std::time::Duration;
use uuid::Uuid;

/// The turnie display service.
pub const UUID_TURNIE_SERVICE: Uuid = Uuid::from_u128(0x12345678_1234_1234_1234_1234567890ab);

/// Write characteristic, app -> peripheral (commands and framed messages).
pub const UUID_TURNIE_WRITE_CHAR: Uuid = Uuid::from_u128(0xabcd1234_5678_90ab_cdef_1234567890ab);

/// Notify characteristic, peripheral -> app (newline-delimited text stream).
pub const UUID_TURNIE_NOTIFY_CHAR: Uuid = Uuid::from_u128(0xabcd1234_5678_90ab_cdef_1234567890ac);

/// Literal command asking the peripheral to stream back its stored content.
pub const GET_DATA_COMMAND: &str = "GET_DATA";

/// Hard ceiling for one auto-connect attempt.
pub const AUTO_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on one chunk; the peripheral's receive buffer cannot take
/// larger writes.
pub const MAX_CHUNK_BYTES: usize = 100;

/// Pause between consecutive chunk writes so the peripheral can drain its
/// buffer.
pub const CHUNK_PACING: Duration = Duration::from_millis(30);

/// Display grid is 8x8, three bytes per pixel (R, G, B row-major).
pub const PIXEL_GRID_SIDE: usize = 8;
pub const PIXEL_PAYLOAD_BYTES: usize = 3 * PIXEL_GRID_SIDE * PIXEL_GRID_SIDE;

/// Frame slot ids the peripheral stores content under.
pub const TEXT_FRAME_ID: &str = "p001";
pub const IMAGE_FRAME_ID: &str = "p002";

/// Fallback display names.
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown";
pub const NO_DEVICE_NAME: &str = "No Device";
