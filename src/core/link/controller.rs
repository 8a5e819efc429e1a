//! Connection controller: the single owner of the connection lifecycle.
//!
//! One task consumes facade commands and transport events from a `select!`
//! loop, so every `ConnectionState` mutation is serialized. Observers only
//! ever see fully-formed snapshots through a watch channel.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::core::link::constants::{
    AUTO_CONNECT_TIMEOUT, GET_DATA_COMMAND, NO_DEVICE_NAME, UUID_TURNIE_SERVICE,
};
use crate::core::link::encoder::{self, OutboundPayload};
use crate::core::link::store::BondedStore;
use crate::core::link::transport::{
    AdapterState, EventReceiver, SessionChannels, Transport, TransportEvent,
};
use crate::core::link::types::{
    ActiveSession, BondedDevice, ConnectionState, DeviceId, DiscoveredDevices, PeripheralRef,
};
use crate::error::{LinkError, TransferError, TransportError};

/// User intents forwarded by the session facade.
pub enum Command {
    StartScan,
    StopScan,
    Connect(PeripheralRef),
    ReconnectLast,
    Disconnect,
    Send {
        payload: OutboundPayload,
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
    RequestStoredData {
        reply: oneshot::Sender<Result<(), TransferError>>,
    },
}

/// Read-only view of the controller published after every handled command,
/// event or timeout.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub connected: bool,
    pub scanning: bool,
    pub auto_connecting: bool,
    pub device_name: String,
    pub discovered: Vec<PeripheralRef>,
    pub has_previous_device: bool,
    /// Newline-delimited text streamed from the peripheral's notify
    /// characteristic.
    pub last_received_text: String,
    pub last_error: Option<LinkError>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            connected: false,
            scanning: false,
            auto_connecting: false,
            device_name: NO_DEVICE_NAME.to_string(),
            discovered: Vec::new(),
            has_previous_device: false,
            last_received_text: String::new(),
            last_error: None,
        }
    }
}

pub struct LinkController {
    transport: Arc<dyn Transport>,
    store: Arc<dyn BondedStore>,
    commands: mpsc::Receiver<Command>,
    events: EventReceiver,
    snapshot: watch::Sender<SessionSnapshot>,

    state: ConnectionState,
    discovered: DiscoveredDevices,
    bonded: Option<BondedDevice>,
    /// Identifier of the peripheral the current connect/connected flow is
    /// about; stale events for other peripherals are dropped.
    peer_id: Option<DeviceId>,
    device_name: String,
    /// While set, an advertisement matching the bonded identifier redirects
    /// straight into a connect instead of populating the discovered list.
    /// A manual scan disables it for the remainder of that scan session.
    auto_filter: bool,
    auto_deadline: Option<Instant>,
    /// Whether the transport was asked to scan and not yet asked to stop.
    scan_active: bool,
    disconnect_requested: bool,
    last_error: Option<LinkError>,
    received_text: String,
}

impl LinkController {
    /// Loads the bonded record, then runs the controller on a spawned task.
    /// Returns the command sender and the snapshot receiver the facade
    /// wraps.
    pub fn spawn(
        transport: Arc<dyn Transport>,
        events: EventReceiver,
        store: Arc<dyn BondedStore>,
    ) -> (mpsc::Sender<Command>, watch::Receiver<SessionSnapshot>) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        tokio::spawn(async move {
            let bonded = match store.load().await {
                Ok(record) => record,
                Err(e) => {
                    error!("Failed to load bonded device record: {e:#}");
                    None
                }
            };
            let device_name = bonded
                .as_ref()
                .map(|b| b.display_name.clone())
                .unwrap_or_else(|| NO_DEVICE_NAME.to_string());

            let controller = LinkController {
                transport,
                store,
                commands: command_rx,
                events,
                snapshot: snapshot_tx,
                state: ConnectionState::Idle,
                discovered: DiscoveredDevices::default(),
                bonded,
                peer_id: None,
                device_name,
                auto_filter: true,
                auto_deadline: None,
                scan_active: false,
                disconnect_requested: false,
                last_error: None,
                received_text: String::new(),
            };
            controller.run().await;
        });

        (command_tx, snapshot_rx)
    }

    async fn run(mut self) {
        info!("Link controller started");
        self.publish();
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!("Transport event channel closed");
                        break;
                    }
                },
                _ = Self::until(self.auto_deadline), if self.auto_deadline.is_some() => {
                    self.on_auto_connect_deadline().await;
                }
            }
            self.publish();
        }
        info!("Link controller stopped");
    }

    async fn until(deadline: Option<Instant>) {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartScan => self.start_scan().await,
            Command::StopScan => self.stop_scan().await,
            Command::Connect(target) => self.connect_to(target).await,
            Command::ReconnectLast => self.reconnect_last().await,
            Command::Disconnect => self.disconnect().await,
            Command::Send { payload, reply } => {
                let _ = reply.send(self.send_payload(payload).await);
            }
            Command::RequestStoredData { reply } => {
                let _ = reply.send(self.request_stored_data().await);
            }
        }
    }

    async fn start_scan(&mut self) {
        self.cancel_outstanding().await;
        self.discovered.clear();
        // A manual scan never auto-redirects into a silent reconnect.
        self.auto_filter = false;
        match self.transport.start_scan(UUID_TURNIE_SERVICE).await {
            Ok(()) => {
                self.scan_active = true;
                self.state = ConnectionState::Scanning;
                info!("Started scanning for turnie peripherals");
            }
            Err(e) => {
                error!("Failed to start scan: {e}");
                self.last_error = Some(LinkError::LinkFailure(e.to_string()));
            }
        }
    }

    async fn stop_scan(&mut self) {
        if self.scan_active {
            if let Err(e) = self.transport.stop_scan().await {
                warn!("Failed to stop scan: {e}");
            }
            self.scan_active = false;
        }
        self.discovered.clear();
        if matches!(self.state, ConnectionState::Scanning) {
            self.state = ConnectionState::Idle;
        }
        info!("Stopped scanning");
    }

    async fn connect_to(&mut self, target: PeripheralRef) {
        self.cancel_outstanding().await;
        self.teardown_session().await;

        self.disconnect_requested = false;
        self.last_error = None;
        self.device_name = target.display_name().to_string();
        self.peer_id = Some(target.id.clone());
        info!("Connecting to {}", self.device_name);
        self.state = ConnectionState::Connecting {
            target: target.clone(),
        };
        if let Err(e) = self.transport.connect(&target.id).await {
            error!("Connect request failed: {e}");
            self.fail_link(LinkError::LinkFailure(e.to_string()));
        }
    }

    async fn reconnect_last(&mut self) {
        if self.bonded.is_none() {
            info!("No previous device to reconnect");
            return;
        }
        info!("Manual reconnect triggered");
        self.auto_filter = true;
        self.cancel_outstanding().await;
        self.begin_auto_connect().await;
    }

    async fn begin_auto_connect(&mut self) {
        let Some(target) = self.bonded.clone() else {
            return;
        };
        info!("Attempting auto-connect to last device: {}", target.display_name);
        self.disconnect_requested = false;
        self.last_error = None;
        self.device_name = target.display_name.clone();
        self.peer_id = Some(target.identifier.clone());
        self.auto_deadline = Some(Instant::now() + AUTO_CONNECT_TIMEOUT);
        self.state = ConnectionState::AutoConnecting {
            target: target.clone(),
        };

        match self.transport.resolve(&target.identifier).await {
            Ok(Some(peripheral)) => {
                if let Some(name) = &peripheral.name {
                    self.device_name = name.clone();
                }
                if let Err(e) = self.transport.connect(&peripheral.id).await {
                    error!("Auto-connect request failed: {e}");
                    self.fail_link(LinkError::LinkFailure(e.to_string()));
                }
            }
            Ok(None) => {
                info!("Last device not resolvable, falling back to a filtered scan");
                match self.transport.start_scan(UUID_TURNIE_SERVICE).await {
                    Ok(()) => self.scan_active = true,
                    Err(e) => {
                        error!("Fallback scan failed to start: {e}");
                        self.fail_link(LinkError::LinkFailure(e.to_string()));
                    }
                }
            }
            Err(e) => {
                error!("Failed to resolve bonded device: {e}");
                self.fail_link(LinkError::LinkFailure(e.to_string()));
            }
        }
    }

    async fn disconnect(&mut self) {
        match &self.state {
            ConnectionState::Connected { session } => {
                self.disconnect_requested = true;
                let session = session.clone();
                if let Err(e) = session.notify.set_notify(false).await {
                    debug!("Failed to disable notifications: {e}");
                }
                if let Some(id) = self.peer_id.clone() {
                    if let Err(e) = self.transport.disconnect(&id).await {
                        warn!("Disconnect request failed: {e}");
                        self.finish_disconnect(None);
                    }
                }
            }
            ConnectionState::Connecting { target } => {
                self.disconnect_requested = true;
                let id = target.id.clone();
                if let Err(e) = self.transport.disconnect(&id).await {
                    warn!("Disconnect request failed: {e}");
                    self.finish_disconnect(None);
                }
            }
            ConnectionState::AutoConnecting { .. } => {
                self.disconnect_requested = true;
                self.cancel_outstanding().await;
                self.finish_disconnect(None);
            }
            // No active link: a no-op, not an error.
            _ => debug!("Disconnect with no active link, ignoring"),
        }
    }

    async fn send_payload(&mut self, payload: OutboundPayload) -> Result<(), TransferError> {
        let Some(session) = self.state.session().cloned() else {
            return Err(TransferError::NotReady);
        };
        let chunks = encoder::encode(&payload)?;
        // The write handle is borrowed for this one call only; a disconnect
        // invalidates it by replacing the whole state.
        encoder::send(&chunks, session.write.as_ref()).await
    }

    async fn request_stored_data(&mut self) -> Result<(), TransferError> {
        let Some(session) = self.state.session().cloned() else {
            return Err(TransferError::NotReady);
        };
        // Drop whatever the previous request streamed in.
        self.received_text.clear();
        info!("Requesting stored content from {}", self.device_name);
        session
            .write
            .write(GET_DATA_COMMAND.as_bytes(), true)
            .await
            .map_err(|e| TransferError::Write(e.to_string()))
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => self.on_adapter_state(state).await,
            TransportEvent::Advertisement(peripheral) => self.on_advertisement(peripheral).await,
            TransportEvent::Connected(id) => self.on_connected(id).await,
            TransportEvent::ServicesDiscovered { id, result } => {
                self.on_services_discovered(id, result).await;
            }
            TransportEvent::CharacteristicsDiscovered { id, result } => {
                self.on_characteristics_discovered(id, result).await;
            }
            TransportEvent::ValueUpdated(result) => self.on_value_updated(result),
            TransportEvent::ConnectFailed { id, error } => {
                if self.is_current_peer(&id) {
                    error!("Failed to connect to {id}: {error}");
                    self.fail_link(LinkError::LinkFailure(error.to_string()));
                }
            }
            TransportEvent::Disconnected { id, error } => self.on_disconnected(id, error),
        }
    }

    async fn on_adapter_state(&mut self, state: AdapterState) {
        match state {
            AdapterState::PoweredOn => {
                info!("Bluetooth is ready");
                self.last_error = None;
                if self.auto_filter
                    && self.bonded.is_some()
                    && matches!(self.state, ConnectionState::Idle)
                {
                    self.begin_auto_connect().await;
                }
            }
            AdapterState::Unavailable => {
                warn!("Bluetooth is not available");
                self.last_error = Some(LinkError::TransportUnavailable);
            }
        }
    }

    async fn on_advertisement(&mut self, peripheral: PeripheralRef) {
        // Scan cancellation is asynchronous, so advertisements can still be
        // queued after a connect began. Only a live scan may redirect.
        let scanning = matches!(
            self.state,
            ConnectionState::Scanning | ConnectionState::AutoConnecting { .. }
        );
        if self.auto_filter && scanning {
            if let Some(bonded) = &self.bonded {
                if bonded.identifier == peripheral.id {
                    // Bonded device seen while the filter is active:
                    // preempt list population and connect right away.
                    info!("Found last connected device: {}", peripheral.display_name());
                    if self.scan_active {
                        if let Err(e) = self.transport.stop_scan().await {
                            warn!("Failed to stop scan: {e}");
                        }
                        self.scan_active = false;
                    }
                    let name = peripheral
                        .name
                        .clone()
                        .unwrap_or_else(|| bonded.display_name.clone());
                    self.device_name = name;
                    self.peer_id = Some(peripheral.id.clone());
                    self.state = ConnectionState::Connecting {
                        target: peripheral.clone(),
                    };
                    if let Err(e) = self.transport.connect(&peripheral.id).await {
                        error!("Connect request failed: {e}");
                        self.fail_link(LinkError::LinkFailure(e.to_string()));
                    }
                    return;
                }
            }
        }
        if matches!(self.state, ConnectionState::Scanning)
            && self.discovered.push(peripheral.clone())
        {
            info!(
                "Found device: {} RSSI: {:?}",
                peripheral.display_name(),
                peripheral.rssi
            );
        }
    }

    async fn on_connected(&mut self, id: DeviceId) {
        if !self.is_current_peer(&id) {
            debug!("Ignoring connect event for stale peer {id}");
            return;
        }
        info!("Link established with {}, discovering services", self.device_name);
        self.auto_deadline = None;
        if let ConnectionState::AutoConnecting { target } = &self.state {
            // Direct resolve path: the link came up without a Connecting hop.
            let target = PeripheralRef {
                id: target.identifier.clone(),
                name: Some(target.display_name.clone()),
                rssi: None,
            };
            self.state = ConnectionState::Connecting { target };
        }
        if let Err(e) = self
            .transport
            .discover_services(&id, UUID_TURNIE_SERVICE)
            .await
        {
            error!("Service discovery request failed: {e}");
            self.fail_link(LinkError::LinkFailure(e.to_string()));
        }
    }

    async fn on_services_discovered(
        &mut self,
        id: DeviceId,
        result: Result<uuid::Uuid, TransportError>,
    ) {
        if !self.is_current_peer(&id) {
            return;
        }
        match result {
            Ok(service) => {
                if let Err(e) = self.transport.discover_characteristics(&id, service).await {
                    error!("Characteristic discovery request failed: {e}");
                    self.fail_link(LinkError::LinkFailure(e.to_string()));
                }
            }
            Err(e) => {
                error!("Error discovering services: {e}");
                self.fail_link(LinkError::LinkFailure(e.to_string()));
            }
        }
    }

    async fn on_characteristics_discovered(
        &mut self,
        id: DeviceId,
        result: Result<SessionChannels, TransportError>,
    ) {
        if !self.is_current_peer(&id) {
            return;
        }
        let channels = match result {
            Ok(channels) => channels,
            Err(e) => {
                error!("Error discovering characteristics: {e}");
                self.fail_link(LinkError::LinkFailure(e.to_string()));
                return;
            }
        };

        // Fully negotiated: this is the one place the bond is written.
        let bonded = BondedDevice {
            identifier: id.clone(),
            display_name: self.device_name.clone(),
        };
        if let Err(e) = self.store.save(&bonded).await {
            error!("Failed to persist bonded device: {e:#}");
        }
        self.bonded = Some(bonded);

        let session = ActiveSession {
            write: channels.write,
            notify: channels.notify,
        };
        if let Err(e) = session.notify.set_notify(true).await {
            warn!("Failed to enable notifications: {e}");
        }
        self.state = ConnectionState::Connected { session };
        self.auto_deadline = None;
        self.last_error = None;
        info!("Ready to send frames to {}", self.device_name);
    }

    fn on_value_updated(&mut self, result: Result<Vec<u8>, TransportError>) {
        match result {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => {
                    self.received_text.push_str(&text);
                    self.received_text.push('\n');
                }
                Err(_) => warn!("Dropping non-UTF-8 notification value"),
            },
            Err(e) => warn!("Error receiving data: {e}"),
        }
    }

    fn on_disconnected(&mut self, id: DeviceId, error: Option<TransportError>) {
        if !self.is_current_peer(&id) {
            debug!("Ignoring disconnect event for stale peer {id}");
            return;
        }
        info!("Disconnected from {}", self.device_name);
        let link_lost = !self.disconnect_requested;
        if let Some(e) = &error {
            warn!("Disconnect reported error: {e}");
        }
        self.finish_disconnect(link_lost.then_some(LinkError::LinkLost));
    }

    async fn on_auto_connect_deadline(&mut self) {
        self.auto_deadline = None;
        if self.state.is_connected() {
            // The connect completed after the timer was armed; the timer
            // firing late must be a no-op.
            return;
        }
        warn!("Auto-connect timed out");
        if self.scan_active {
            if let Err(e) = self.transport.stop_scan().await {
                warn!("Failed to stop scan after timeout: {e}");
            }
            self.scan_active = false;
        }
        self.fail_link(LinkError::DiscoveryTimeout);
    }

    /// Cancels any outstanding scan and auto-connect timer before a new
    /// scan or connect attempt is issued.
    async fn cancel_outstanding(&mut self) {
        self.auto_deadline = None;
        if self.scan_active {
            if let Err(e) = self.transport.stop_scan().await {
                warn!("Failed to stop scan: {e}");
            }
            self.scan_active = false;
        }
    }

    /// Tears down the previous session before a new one may exist.
    async fn teardown_session(&mut self) {
        if let ConnectionState::Connected { session } = &self.state {
            let session = session.clone();
            if let Err(e) = session.notify.set_notify(false).await {
                debug!("Failed to disable notifications: {e}");
            }
            if let Some(id) = self.peer_id.clone() {
                if let Err(e) = self.transport.disconnect(&id).await {
                    warn!("Failed to disconnect previous session: {e}");
                }
            }
            self.state = ConnectionState::Disconnected {
                last_known: self.bonded.clone(),
            };
        }
    }

    fn finish_disconnect(&mut self, error: Option<LinkError>) {
        self.peer_id = None;
        self.auto_deadline = None;
        self.disconnect_requested = false;
        self.state = ConnectionState::Disconnected {
            last_known: self.bonded.clone(),
        };
        self.device_name = self
            .bonded
            .as_ref()
            .map(|b| b.display_name.clone())
            .unwrap_or_else(|| NO_DEVICE_NAME.to_string());
        self.last_error = error;
    }

    fn fail_link(&mut self, error: LinkError) {
        self.finish_disconnect(Some(error));
    }

    fn is_current_peer(&self, id: &DeviceId) -> bool {
        self.peer_id.as_ref() == Some(id)
    }

    fn publish(&self) {
        let snapshot = SessionSnapshot {
            connected: self.state.is_connected(),
            scanning: matches!(self.state, ConnectionState::Scanning),
            auto_connecting: matches!(self.state, ConnectionState::AutoConnecting { .. }),
            device_name: self.device_name.clone(),
            discovered: self.discovered.as_slice().to_vec(),
            has_previous_device: self.bonded.is_some(),
            last_received_text: self.received_text.clone(),
            last_error: self.last_error.clone(),
        };
        self.snapshot.send_replace(snapshot);
    }
}
