//! Scenario tests for the connection lifecycle and the chunked transfer
//! path, driven through the session facade over a scripted transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use turnie_link::core::link::{
    BondedDevice, DeviceId, EventSender, MAX_CHUNK_BYTES, MemoryStore, MessageChannel,
    MessageFrame, NotifyChannel, PeripheralRef, SessionChannels, Transport, TransportEvent,
    UUID_TURNIE_SERVICE, encode, event_channel,
};
use turnie_link::core::link::{AdapterState, BondedStore, OutboundPayload};
use turnie_link::error::{EncodeError, LinkError, TransferError, TransportError};
use turnie_link::session::Session;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    StartScan,
    StopScan,
    Resolve(String),
    Connect(String),
    Disconnect(String),
    DiscoverServices(String),
    DiscoverCharacteristics(String),
}

/// Transport double: records every request and lets the test script inbound
/// events directly on the event channel.
struct FakeTransport {
    calls: Arc<Mutex<Vec<Call>>>,
    resolvable: Mutex<Vec<String>>,
}

impl FakeTransport {
    fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            resolvable: Mutex::new(Vec::new()),
        }
    }

    fn make_resolvable(&self, id: &str) {
        self.resolvable.lock().unwrap().push(id.to_string());
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn start_scan(&self, _service: Uuid) -> Result<(), TransportError> {
        self.record(Call::StartScan);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn resolve(&self, id: &DeviceId) -> Result<Option<PeripheralRef>, TransportError> {
        self.record(Call::Resolve(id.to_string()));
        let known = self
            .resolvable
            .lock()
            .unwrap()
            .contains(&id.as_str().to_string());
        Ok(known.then(|| PeripheralRef {
            id: id.clone(),
            name: None,
            rssi: None,
        }))
    }

    async fn connect(&self, id: &DeviceId) -> Result<(), TransportError> {
        self.record(Call::Connect(id.to_string()));
        Ok(())
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<(), TransportError> {
        self.record(Call::Disconnect(id.to_string()));
        Ok(())
    }

    async fn discover_services(&self, id: &DeviceId, _service: Uuid) -> Result<(), TransportError> {
        self.record(Call::DiscoverServices(id.to_string()));
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        id: &DeviceId,
        _service: Uuid,
    ) -> Result<(), TransportError> {
        self.record(Call::DiscoverCharacteristics(id.to_string()));
        Ok(())
    }
}

struct FakeWriteChannel {
    writes: Arc<Mutex<Vec<(Vec<u8>, bool)>>>,
}

#[async_trait]
impl MessageChannel for FakeWriteChannel {
    async fn write(&self, bytes: &[u8], with_response: bool) -> Result<(), TransportError> {
        self.writes.lock().unwrap().push((bytes.to_vec(), with_response));
        Ok(())
    }
}

struct FakeNotifyChannel {
    switches: Arc<Mutex<Vec<bool>>>,
}

#[async_trait]
impl NotifyChannel for FakeNotifyChannel {
    async fn set_notify(&self, enabled: bool) -> Result<(), TransportError> {
        self.switches.lock().unwrap().push(enabled);
        Ok(())
    }
}

struct Harness {
    session: Session,
    events: EventSender,
    transport: Arc<FakeTransport>,
    store: Arc<MemoryStore>,
    writes: Arc<Mutex<Vec<(Vec<u8>, bool)>>>,
    switches: Arc<Mutex<Vec<bool>>>,
}

impl Harness {
    fn calls(&self) -> Vec<Call> {
        self.transport.calls.lock().unwrap().clone()
    }

    fn channels(&self) -> SessionChannels {
        SessionChannels {
            write: Arc::new(FakeWriteChannel {
                writes: self.writes.clone(),
            }),
            notify: Arc::new(FakeNotifyChannel {
                switches: self.switches.clone(),
            }),
        }
    }

    fn emit(&self, event: TransportEvent) {
        self.events.send(event).unwrap();
    }

    /// Scripts the events of a successful link-up after a connect request.
    async fn complete_discovery(&self, id: &str) {
        self.emit(TransportEvent::Connected(DeviceId::new(id)));
        settle().await;
        self.emit(TransportEvent::ServicesDiscovered {
            id: DeviceId::new(id),
            result: Ok(UUID_TURNIE_SERVICE),
        });
        settle().await;
        self.emit(TransportEvent::CharacteristicsDiscovered {
            id: DeviceId::new(id),
            result: Ok(self.channels()),
        });
        settle().await;
    }
}

async fn harness(bonded: Option<BondedDevice>) -> Harness {
    let (events, events_rx) = event_channel();
    let transport = Arc::new(FakeTransport::new());
    let store = Arc::new(MemoryStore::new(bonded));
    let session = Session::spawn(transport.clone(), events_rx, store.clone());
    settle().await;
    Harness {
        session,
        events,
        transport,
        store,
        writes: Arc::new(Mutex::new(Vec::new())),
        switches: Arc::new(Mutex::new(Vec::new())),
    }
}

/// Lets the controller task drain its queues on the current-thread runtime.
async fn settle() {
    for _ in 0..25 {
        tokio::task::yield_now().await;
    }
}

fn bonded(id: &str, name: &str) -> BondedDevice {
    BondedDevice {
        identifier: DeviceId::new(id),
        display_name: name.to_string(),
    }
}

fn peripheral(id: &str, name: &str) -> PeripheralRef {
    PeripheralRef {
        id: DeviceId::new(id),
        name: Some(name.to_string()),
        rssi: Some(-42),
    }
}

async fn connected_harness(id: &str, name: &str) -> Harness {
    let h = harness(None).await;
    h.session.start_scan().await.unwrap();
    settle().await;
    h.emit(TransportEvent::Advertisement(peripheral(id, name)));
    settle().await;
    let target = h.session.snapshot().discovered[0].clone();
    h.session.connect_to(target).await.unwrap();
    settle().await;
    h.complete_discovery(id).await;
    assert!(h.session.snapshot().connected);
    h
}

#[tokio::test]
async fn disconnect_from_idle_is_a_noop() {
    let h = harness(None).await;
    h.session.disconnect().await.unwrap();
    settle().await;

    assert!(h.calls().is_empty());
    let snapshot = h.session.snapshot();
    assert!(!snapshot.connected);
    assert!(!snapshot.scanning);
    assert!(!snapshot.auto_connecting);
}

#[tokio::test]
async fn send_without_session_is_rejected_with_zero_writes() {
    let h = harness(None).await;
    let err = h.session.send_text("happy").await.unwrap_err();
    assert!(matches!(err, TransferError::NotReady));
    assert!(h.writes.lock().unwrap().is_empty());
    assert!(h.calls().is_empty());
}

#[tokio::test]
async fn manual_scan_clears_list_and_disables_auto_redirect() {
    let h = harness(Some(bonded("dev-1", "turnie"))).await;
    h.session.start_scan().await.unwrap();
    settle().await;
    assert!(h.calls().contains(&Call::StartScan));
    assert!(h.session.snapshot().scanning);

    // The bonded device advertises, but a manual scan must list it instead
    // of silently reconnecting.
    h.emit(TransportEvent::Advertisement(peripheral("dev-1", "turnie")));
    h.emit(TransportEvent::Advertisement(peripheral("dev-2", "other")));
    h.emit(TransportEvent::Advertisement(peripheral("dev-1", "turnie")));
    settle().await;

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.discovered.len(), 2);
    assert_eq!(snapshot.discovered[0].id.as_str(), "dev-1");
    assert_eq!(snapshot.discovered[1].id.as_str(), "dev-2");
    assert!(!h.calls().iter().any(|c| matches!(c, Call::Connect(_))));
}

#[tokio::test]
async fn stop_scan_clears_discovered_list() {
    let h = harness(None).await;
    h.session.start_scan().await.unwrap();
    settle().await;
    h.emit(TransportEvent::Advertisement(peripheral("dev-2", "other")));
    settle().await;
    assert_eq!(h.session.snapshot().discovered.len(), 1);

    h.session.stop_scan().await.unwrap();
    settle().await;
    let snapshot = h.session.snapshot();
    assert!(snapshot.discovered.is_empty());
    assert!(!snapshot.scanning);
    assert!(h.calls().contains(&Call::StopScan));
}

#[tokio::test(start_paused = true)]
async fn auto_connect_times_out_at_deadline_and_stops_scan() {
    let h = harness(Some(bonded("dev-1", "turnie"))).await;
    h.emit(TransportEvent::StateChanged(AdapterState::PoweredOn));
    settle().await;

    // Unresolvable identifier falls back to a filtered scan.
    assert!(h.calls().contains(&Call::Resolve("dev-1".to_string())));
    assert!(h.calls().contains(&Call::StartScan));
    assert!(h.session.snapshot().auto_connecting);

    tokio::time::sleep(Duration::from_secs(9)).await;
    settle().await;
    assert!(h.session.snapshot().auto_connecting);

    tokio::time::sleep(Duration::from_millis(1001)).await;
    settle().await;
    let snapshot = h.session.snapshot();
    assert!(!snapshot.auto_connecting);
    assert_eq!(snapshot.last_error, Some(LinkError::DiscoveryTimeout));
    assert_eq!(snapshot.device_name, "turnie");
    assert!(h.calls().contains(&Call::StopScan));
}

#[tokio::test(start_paused = true)]
async fn auto_connect_happy_path_keeps_bond_unchanged() {
    let h = harness(Some(bonded("dev-1", "turnie"))).await;
    h.transport.make_resolvable("dev-1");
    h.emit(TransportEvent::StateChanged(AdapterState::PoweredOn));
    settle().await;
    assert!(h.calls().contains(&Call::Connect("dev-1".to_string())));

    h.complete_discovery("dev-1").await;

    let snapshot = h.session.snapshot();
    assert!(snapshot.connected);
    assert!(!snapshot.auto_connecting);
    assert_eq!(snapshot.device_name, "turnie");
    assert_eq!(snapshot.last_error, None);
    assert_eq!(*h.switches.lock().unwrap(), vec![true]);
    assert_eq!(
        h.store.load().await.unwrap(),
        Some(bonded("dev-1", "turnie"))
    );

    // The deadline was cancelled on link-up; firing late must be a no-op.
    tokio::time::sleep(Duration::from_secs(11)).await;
    settle().await;
    let snapshot = h.session.snapshot();
    assert!(snapshot.connected);
    assert_eq!(snapshot.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn fallback_scan_preempts_on_bonded_advertisement() {
    let h = harness(Some(bonded("dev-1", "turnie"))).await;
    h.emit(TransportEvent::StateChanged(AdapterState::PoweredOn));
    settle().await;
    assert!(h.calls().contains(&Call::StartScan));
    assert!(h.session.snapshot().auto_connecting);

    // The bonded device advertises during the fallback scan: the scan stops
    // and the connect goes straight out, nothing lands in the list.
    h.emit(TransportEvent::Advertisement(peripheral("dev-1", "turnie")));
    settle().await;
    let calls = h.calls();
    let stop = calls.iter().position(|c| *c == Call::StopScan).unwrap();
    let connect = calls
        .iter()
        .position(|c| *c == Call::Connect("dev-1".to_string()))
        .unwrap();
    assert!(stop < connect);
    assert!(h.session.snapshot().discovered.is_empty());

    h.complete_discovery("dev-1").await;
    let snapshot = h.session.snapshot();
    assert!(snapshot.connected);
    assert_eq!(snapshot.device_name, "turnie");
    assert_eq!(snapshot.last_error, None);
}

#[tokio::test(start_paused = true)]
async fn late_advertisement_for_bonded_device_leaves_connection_alone() {
    let h = harness(Some(bonded("dev-1", "turnie"))).await;
    h.transport.make_resolvable("dev-1");
    h.emit(TransportEvent::StateChanged(AdapterState::PoweredOn));
    settle().await;
    h.complete_discovery("dev-1").await;
    assert!(h.session.snapshot().connected);
    let connects_before = h
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::Connect(_)))
        .count();

    // Scan cancellation is asynchronous, so an advertisement for the bonded
    // device can still be queued after link-up. It must not restart the
    // connect flow or replace the live session.
    h.emit(TransportEvent::Advertisement(peripheral("dev-1", "turnie")));
    settle().await;

    let connects_after = h
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::Connect(_)))
        .count();
    assert_eq!(connects_before, connects_after);
    let snapshot = h.session.snapshot();
    assert!(snapshot.connected);
    assert_eq!(snapshot.last_error, None);
    // The notify subscription of the live session was never torn down.
    assert_eq!(*h.switches.lock().unwrap(), vec![true]);

    // Still usable after the stale advertisement.
    h.session.send_text("hi").await.unwrap();
    assert!(!h.writes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn manual_connect_persists_bond_and_sends_frames() {
    let h = connected_harness("dev-2", "turnie-2").await;

    // Scan was stopped before the connect request went out.
    let calls = h.calls();
    let stop = calls.iter().position(|c| *c == Call::StopScan).unwrap();
    let connect = calls
        .iter()
        .position(|c| *c == Call::Connect("dev-2".to_string()))
        .unwrap();
    assert!(stop < connect);

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.device_name, "turnie-2");
    assert!(snapshot.has_previous_device);
    assert_eq!(
        h.store.load().await.unwrap(),
        Some(bonded("dev-2", "turnie-2"))
    );

    h.session.send_text("hi").await.unwrap();
    let writes = h.writes.lock().unwrap().clone();
    assert!(!writes.is_empty());
    assert!(writes.iter().all(|(_, with_response)| *with_response));
    let sent: Vec<u8> = writes.iter().flat_map(|(bytes, _)| bytes.clone()).collect();
    let frame: MessageFrame = serde_json::from_slice(&sent).unwrap();
    assert_eq!(frame.flag, "text");
    assert_eq!(frame.text.as_deref(), Some("hi"));
}

#[tokio::test]
async fn link_loss_tears_down_session() {
    let h = connected_harness("dev-2", "turnie-2").await;

    h.emit(TransportEvent::Disconnected {
        id: DeviceId::new("dev-2"),
        error: None,
    });
    settle().await;

    let snapshot = h.session.snapshot();
    assert!(!snapshot.connected);
    assert_eq!(snapshot.last_error, Some(LinkError::LinkLost));
    assert_eq!(snapshot.device_name, "turnie-2");
    assert!(snapshot.has_previous_device);

    let err = h.session.send_text("hi").await.unwrap_err();
    assert!(matches!(err, TransferError::NotReady));
}

#[tokio::test]
async fn requested_disconnect_reports_no_error() {
    let h = connected_harness("dev-2", "turnie-2").await;
    h.session.disconnect().await.unwrap();
    settle().await;
    assert!(h.calls().contains(&Call::Disconnect("dev-2".to_string())));
    // Disabled notifications on the way down.
    assert_eq!(*h.switches.lock().unwrap(), vec![true, false]);

    h.emit(TransportEvent::Disconnected {
        id: DeviceId::new("dev-2"),
        error: None,
    });
    settle().await;
    let snapshot = h.session.snapshot();
    assert!(!snapshot.connected);
    assert_eq!(snapshot.last_error, None);
}

#[tokio::test]
async fn empty_payload_rejected_before_any_write() {
    let h = connected_harness("dev-2", "turnie-2").await;
    let err = h.session.send_text("").await.unwrap_err();
    assert!(matches!(err, TransferError::Encode(EncodeError::Empty)));
    let err = h.session.send_image(Vec::new()).await.unwrap_err();
    assert!(matches!(err, TransferError::Encode(EncodeError::Empty)));
    assert!(h.writes.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn chunk_writes_are_paced() {
    let h = connected_harness("dev-2", "turnie-2").await;

    let text = "a".repeat(250);
    let chunks = encode(&OutboundPayload::Text(text.clone())).unwrap();
    assert!(chunks.len() > 1);
    assert!(chunks.iter().all(|c| c.as_bytes().len() <= MAX_CHUNK_BYTES));

    let started = Instant::now();
    h.session.send_text(text).await.unwrap();
    let elapsed = started.elapsed();
    // One 30ms pause between each pair of consecutive writes.
    assert_eq!(
        elapsed,
        Duration::from_millis(30) * (chunks.len() as u32 - 1)
    );
    assert_eq!(h.writes.lock().unwrap().len(), chunks.len());
}

#[tokio::test]
async fn image_payload_round_trips_through_writes() {
    let h = connected_harness("dev-2", "turnie-2").await;
    let pixels: Vec<u8> = (0..192).map(|i| (i % 256) as u8).collect();
    h.session.send_image(pixels.clone()).await.unwrap();

    let writes = h.writes.lock().unwrap().clone();
    let sent: Vec<u8> = writes.iter().flat_map(|(bytes, _)| bytes.clone()).collect();
    let frame: MessageFrame = serde_json::from_slice(&sent).unwrap();
    assert_eq!(frame.flag, "image");
    assert_eq!(frame.rgb.unwrap(), pixels);
}

#[tokio::test]
async fn stored_data_request_streams_newline_delimited_text() {
    let h = connected_harness("dev-2", "turnie-2").await;
    h.session.request_stored_data().await.unwrap();

    let writes = h.writes.lock().unwrap().clone();
    assert_eq!(writes.last().unwrap().0, b"GET_DATA".to_vec());

    h.emit(TransportEvent::ValueUpdated(Ok(b"line1".to_vec())));
    h.emit(TransportEvent::ValueUpdated(Ok(b"line2".to_vec())));
    settle().await;
    assert_eq!(h.session.snapshot().last_received_text, "line1\nline2\n");

    // A new request drops the previous stream.
    h.session.request_stored_data().await.unwrap();
    settle().await;
    assert_eq!(h.session.snapshot().last_received_text, "");
}

#[tokio::test]
async fn unavailable_adapter_surfaces_persistent_error() {
    let h = harness(None).await;
    h.emit(TransportEvent::StateChanged(AdapterState::Unavailable));
    settle().await;
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.last_error, Some(LinkError::TransportUnavailable));
    assert!(!snapshot.connected);
}
