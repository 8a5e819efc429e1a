//! Transfer encoder: serializes an outbound payload into one JSON frame and
//! splits it into transport-sized chunks.
//!
//! Chunks carry no header; reassembly on the peripheral relies entirely on
//! the write channel delivering them in order, reliably and exactly once
//! (write-with-response over a connected link). Substituting an unordered or
//! lossy channel is an unsupported configuration.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;

use crate::core::link::constants::{CHUNK_PACING, IMAGE_FRAME_ID, MAX_CHUNK_BYTES, TEXT_FRAME_ID};
use crate::core::link::transport::MessageChannel;
use crate::error::{EncodeError, TransferError};

/// User-authored content ready for transfer.
#[derive(Debug, Clone)]
pub enum OutboundPayload {
    Text(String),
    /// Row-major R,G,B bytes, 3 per pixel (192 bytes for the 8x8 product).
    ImagePixels(Vec<u8>),
}

/// One complete serialized message. The peripheral keys stored content by
/// the frame id and dispatches on the flag.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageFrame {
    pub id: String,
    pub flag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rgb: Option<Vec<u8>>,
}

impl MessageFrame {
    fn from_payload(payload: &OutboundPayload) -> Result<Self, EncodeError> {
        match payload {
            OutboundPayload::Text(text) => {
                if text.is_empty() {
                    return Err(EncodeError::Empty);
                }
                Ok(Self {
                    id: TEXT_FRAME_ID.to_string(),
                    flag: "text".to_string(),
                    text: Some(text.clone()),
                    rgb: None,
                })
            }
            OutboundPayload::ImagePixels(pixels) => {
                if pixels.is_empty() {
                    return Err(EncodeError::Empty);
                }
                Ok(Self {
                    id: IMAGE_FRAME_ID.to_string(),
                    flag: "image".to_string(),
                    text: None,
                    rgb: Some(pixels.clone()),
                })
            }
        }
    }
}

/// A size-bounded fragment of a serialized frame, written as one transport
/// write operation. Ordering is implicit in the sequence position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk(Vec<u8>);

impl Chunk {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Serializes `payload` into one frame and splits it into chunks of at most
/// `MAX_CHUNK_BYTES`, preserving byte order. The frame is treated as an
/// opaque byte stream; boundaries carry no meaning.
pub fn encode(payload: &OutboundPayload) -> Result<Vec<Chunk>, EncodeError> {
    let frame = MessageFrame::from_payload(payload)?;
    let serialized = serde_json::to_string(&frame)?;
    let chunks: Vec<Chunk> = serialized
        .as_bytes()
        .chunks(MAX_CHUNK_BYTES)
        .map(|part| Chunk(part.to_vec()))
        .collect();
    debug!(
        "Encoded {} frame into {} chunk(s), {} bytes total",
        frame.flag,
        chunks.len(),
        serialized.len()
    );
    Ok(chunks)
}

/// Writes chunks strictly in order with acknowledged delivery, pausing
/// between consecutive writes so the peripheral can drain its buffer.
/// Suspends for the cumulative pacing duration.
pub async fn send(chunks: &[Chunk], channel: &dyn MessageChannel) -> Result<(), TransferError> {
    info!("Sending frame in {} chunk(s)", chunks.len());
    for (index, chunk) in chunks.iter().enumerate() {
        if index > 0 {
            sleep(CHUNK_PACING).await;
        }
        channel
            .write(chunk.as_bytes(), true)
            .await
            .map_err(|e| TransferError::Write(e.to_string()))?;
    }
    info!("Frame sent");
    Ok(())
}
