//! Session facade: the single object a UI layer observes and drives.
//!
//! It re-publishes the controller's state as a watchable snapshot and
//! forwards user intents into the controller task. No logic of its own.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};

use crate::core::link::{
    BondedStore, Command, EventReceiver, LinkController, OutboundPayload, Transport,
};
pub use crate::core::link::SessionSnapshot;
use crate::core::link::PeripheralRef;
use crate::error::TransferError;

pub struct Session {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl Session {
    /// Spawns the controller over the given transport and store and returns
    /// the facade wrapping it.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        events: EventReceiver,
        store: Arc<dyn BondedStore>,
    ) -> Self {
        let (commands, snapshot) = LinkController::spawn(transport, events, store);
        Self { commands, snapshot }
    }

    /// Current state, fully formed; never a partially-updated view.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Watch receiver for callers that want change notifications.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub async fn start_scan(&self) -> Result<()> {
        self.forward(Command::StartScan).await
    }

    pub async fn stop_scan(&self) -> Result<()> {
        self.forward(Command::StopScan).await
    }

    pub async fn connect_to(&self, target: PeripheralRef) -> Result<()> {
        self.forward(Command::Connect(target)).await
    }

    pub async fn reconnect_last(&self) -> Result<()> {
        self.forward(Command::ReconnectLast).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.forward(Command::Disconnect).await
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TransferError> {
        self.send(OutboundPayload::Text(text.into())).await
    }

    pub async fn send_image(&self, pixel_bytes: Vec<u8>) -> Result<(), TransferError> {
        self.send(OutboundPayload::ImagePixels(pixel_bytes)).await
    }

    /// Sends one payload and waits for the transfer outcome, including the
    /// cumulative inter-chunk pacing time.
    pub async fn send(&self, payload: OutboundPayload) -> Result<(), TransferError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Send { payload, reply })
            .await
            .map_err(|_| TransferError::NotReady)?;
        outcome.await.map_err(|_| TransferError::NotReady)?
    }

    /// Asks the peripheral to stream back its stored content; the text
    /// arrives incrementally in `last_received_text`.
    pub async fn request_stored_data(&self) -> Result<(), TransferError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::RequestStoredData { reply })
            .await
            .map_err(|_| TransferError::NotReady)?;
        outcome.await.map_err(|_| TransferError::NotReady)?
    }

    async fn forward(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .ok()
            .context("link controller is no longer running")
    }
}
