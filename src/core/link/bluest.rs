//! Production transport over the `bluest` BLE stack.
//!
//! Requests are acknowledged immediately; the actual radio work runs on
//! spawned tasks that report outcomes into the controller's event channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use bluest::{Adapter, Characteristic, ConnectionEvent, Device, Service};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::link::constants::{UUID_TURNIE_NOTIFY_CHAR, UUID_TURNIE_WRITE_CHAR};
use crate::core::link::transport::{
    AdapterState, EventSender, MessageChannel, NotifyChannel, SessionChannels, Transport,
    TransportEvent,
};
use crate::core::link::types::{DeviceId, PeripheralRef};
use crate::error::TransportError;

fn backend(e: impl std::fmt::Display) -> TransportError {
    TransportError::Backend(e.to_string())
}

pub struct BluestTransport {
    adapter: Adapter,
    events: EventSender,
    /// Devices seen during this process; `resolve` and `connect` only work
    /// for identifiers the platform still remembers.
    known: Arc<Mutex<HashMap<DeviceId, Device>>>,
    services: Arc<Mutex<HashMap<DeviceId, Service>>>,
    scan_cancel: Mutex<Option<CancellationToken>>,
}

impl BluestTransport {
    pub async fn new(events: EventSender) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("no Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available");
        let _ = events.send(TransportEvent::StateChanged(AdapterState::PoweredOn));

        Ok(Self {
            adapter,
            events,
            known: Arc::new(Mutex::new(HashMap::new())),
            services: Arc::new(Mutex::new(HashMap::new())),
            scan_cancel: Mutex::new(None),
        })
    }

    fn known_device(&self, id: &DeviceId) -> Result<Device, TransportError> {
        self.known
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownDevice(id.to_string()))
    }

    fn remember(&self, device: &Device) -> DeviceId {
        let id = DeviceId::new(device.id().to_string());
        self.known
            .lock()
            .unwrap()
            .insert(id.clone(), device.clone());
        id
    }

}

#[async_trait]
impl Transport for BluestTransport {
    async fn start_scan(&self, service: Uuid) -> Result<(), TransportError> {
        let token = CancellationToken::new();
        if let Some(previous) = self.scan_cancel.lock().unwrap().replace(token.clone()) {
            previous.cancel();
        }

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let known = self.known.clone();
        tokio::spawn(async move {
            let services = [service];
            let mut stream = match adapter.scan(&services).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to start scan: {e}");
                    let _ = events.send(TransportEvent::StateChanged(AdapterState::Unavailable));
                    return;
                }
            };
            info!("Scan stream open");
            loop {
                tokio::select! {
                    discovered = stream.next() => match discovered {
                        Some(discovered) => {
                            let device = discovered.device;
                            let id = DeviceId::new(device.id().to_string());
                            let name = device.name().ok();
                            known.lock().unwrap().insert(id.clone(), device);
                            let _ = events.send(TransportEvent::Advertisement(PeripheralRef {
                                id,
                                name,
                                rssi: discovered.rssi,
                            }));
                        }
                        None => {
                            info!("Scan stream ended");
                            break;
                        }
                    },
                    _ = token.cancelled() => break,
                }
            }
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        if let Some(token) = self.scan_cancel.lock().unwrap().take() {
            token.cancel();
        }
        Ok(())
    }

    async fn resolve(&self, id: &DeviceId) -> Result<Option<PeripheralRef>, TransportError> {
        if let Ok(devices) = self.adapter.connected_devices().await {
            for device in devices {
                if device.id().to_string() == id.as_str() {
                    let name = device.name().ok();
                    self.remember(&device);
                    return Ok(Some(PeripheralRef {
                        id: id.clone(),
                        name,
                        rssi: None,
                    }));
                }
            }
        }
        let known = self.known.lock().unwrap().get(id).cloned();
        Ok(known.map(|device| PeripheralRef {
            id: id.clone(),
            name: device.name().ok(),
            rssi: None,
        }))
    }

    async fn connect(&self, id: &DeviceId) -> Result<(), TransportError> {
        let device = self.known_device(id)?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let id = id.clone();
        // Run the connect on its own task; the outcome arrives as an event.
        tokio::spawn(async move {
            match adapter.connect_device(&device).await {
                Ok(()) => {
                    info!("Connected to {id}");
                    let _ = events.send(TransportEvent::Connected(id.clone()));
                    // Watch for unsolicited drops on this link.
                    match adapter.device_connection_events(&device).await {
                        Ok(mut stream) => {
                            while let Some(event) = stream.next().await {
                                if matches!(event, ConnectionEvent::Disconnected) {
                                    debug!("Connection event: {id} disconnected");
                                    let _ = events.send(TransportEvent::Disconnected {
                                        id: id.clone(),
                                        error: None,
                                    });
                                    break;
                                }
                            }
                        }
                        Err(e) => debug!("Connection events unavailable for {id}: {e}"),
                    }
                }
                Err(e) => {
                    warn!("Failed to connect to {id}: {e}");
                    let _ = events.send(TransportEvent::ConnectFailed {
                        id,
                        error: backend(e),
                    });
                }
            }
        });
        Ok(())
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<(), TransportError> {
        let device = self.known_device(id)?;
        if device.is_connected().await {
            info!("Disconnecting from {id}");
            self.adapter
                .disconnect_device(&device)
                .await
                .map_err(backend)?;
            // The connection-events watcher also reports this; the
            // controller drops the duplicate.
            let _ = self.events.send(TransportEvent::Disconnected {
                id: id.clone(),
                error: None,
            });
        } else {
            debug!("Device {id} not connected");
        }
        Ok(())
    }

    async fn discover_services(&self, id: &DeviceId, service: Uuid) -> Result<(), TransportError> {
        let device = self.known_device(id)?;
        let events = self.events.clone();
        let services = self.services.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let result = match device.services().await {
                Ok(found) => match found.into_iter().find(|s| s.uuid() == service) {
                    Some(found) => {
                        services.lock().unwrap().insert(id.clone(), found);
                        Ok(service)
                    }
                    None => Err(TransportError::Backend(format!(
                        "service {service} not found"
                    ))),
                },
                Err(e) => Err(backend(e)),
            };
            let _ = events.send(TransportEvent::ServicesDiscovered { id, result });
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        id: &DeviceId,
        service: Uuid,
    ) -> Result<(), TransportError> {
        let resolved = self
            .services
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::Backend(format!("service {service} not discovered")))?;
        let events = self.events.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let result = match resolved.characteristics().await {
                Ok(characteristics) => {
                    let mut write = None;
                    let mut notify = None;
                    for characteristic in characteristics {
                        let uuid = characteristic.uuid();
                        if uuid == UUID_TURNIE_WRITE_CHAR {
                            write = Some(characteristic);
                        } else if uuid == UUID_TURNIE_NOTIFY_CHAR {
                            notify = Some(characteristic);
                        }
                    }
                    match (write, notify) {
                        (Some(write), Some(notify)) => Ok(SessionChannels {
                            write: Arc::new(BluestMessageChannel { inner: write }),
                            notify: Arc::new(BluestNotifyChannel {
                                inner: notify,
                                events: events.clone(),
                                cancel: Mutex::new(None),
                            }),
                        }),
                        (None, _) => Err(TransportError::Backend(
                            "write characteristic not found".to_string(),
                        )),
                        (_, None) => Err(TransportError::Backend(
                            "notify characteristic not found".to_string(),
                        )),
                    }
                }
                Err(e) => Err(backend(e)),
            };
            let _ = events.send(TransportEvent::CharacteristicsDiscovered { id, result });
        });
        Ok(())
    }
}

struct BluestMessageChannel {
    inner: Characteristic,
}

#[async_trait]
impl MessageChannel for BluestMessageChannel {
    async fn write(&self, bytes: &[u8], with_response: bool) -> Result<(), TransportError> {
        if with_response {
            self.inner.write(bytes).await.map_err(backend)
        } else {
            self.inner
                .write_without_response(bytes)
                .await
                .map_err(backend)
        }
    }
}

struct BluestNotifyChannel {
    inner: Characteristic,
    events: EventSender,
    cancel: Mutex<Option<CancellationToken>>,
}

#[async_trait]
impl NotifyChannel for BluestNotifyChannel {
    async fn set_notify(&self, enabled: bool) -> Result<(), TransportError> {
        if !enabled {
            if let Some(token) = self.cancel.lock().unwrap().take() {
                token.cancel();
            }
            return Ok(());
        }

        let token = CancellationToken::new();
        if let Some(previous) = self.cancel.lock().unwrap().replace(token.clone()) {
            previous.cancel();
        }
        let characteristic = self.inner.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut stream = match characteristic.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to subscribe to notifications: {e}");
                    let _ = events.send(TransportEvent::ValueUpdated(Err(backend(e))));
                    return;
                }
            };
            info!("Listening for peripheral notifications");
            loop {
                tokio::select! {
                    value = stream.next() => match value {
                        Some(Ok(bytes)) => {
                            let _ = events.send(TransportEvent::ValueUpdated(Ok(bytes)));
                        }
                        Some(Err(e)) => {
                            warn!("Error in notification stream: {e}");
                            let _ = events.send(TransportEvent::ValueUpdated(Err(backend(e))));
                            break;
                        }
                        None => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
            info!("Notification stream ended");
        });
        Ok(())
    }
}
