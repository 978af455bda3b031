use std::sync::{Arc, Mutex};
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use hm10_drive::device::controller::{spawn_controller, ControllerHandle};
use hm10_drive::device::machine::{ConnectionMachine, MachineSettings};
use hm10_drive::device::transport::{Transport, TransportEvent};
use hm10_drive::device::types::{ConnectionState, ControlCommand, DeviceDescriptor, DeviceEvent, DeviceId, WriteHandle};
use hm10_drive::error::DeviceError;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    StartScan,
    StopScan,
    Connect(DeviceId),
    Discover(DeviceId),
    Subscribe(DeviceId),
    Write(String),
    Disconnect(DeviceId),
}

#[derive(Clone, Default)]
struct RecordingTransport {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl RecordingTransport {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn writes(&self) -> Vec<String> {
        self.calls().into_iter().filter_map(|call| match call {
            Call::Write(payload) => Some(payload),
            _ => None,
        }).collect()
    }
}

impl Transport for RecordingTransport {
    fn start_scan(&mut self, _filter: Option<Uuid>) {
        self.record(Call::StartScan);
    }

    fn stop_scan(&mut self) {
        self.record(Call::StopScan);
    }

    fn connect(&mut self, device: &DeviceId) {
        self.record(Call::Connect(device.clone()));
    }

    fn discover(&mut self, device: &DeviceId, _service: Uuid, _characteristic: Uuid) {
        self.record(Call::Discover(device.clone()));
    }

    fn subscribe(&mut self, handle: &WriteHandle) {
        self.record(Call::Subscribe(handle.device.clone()));
    }

    fn write(&mut self, _handle: &WriteHandle, payload: &[u8], _ack: bool) -> Result<(), DeviceError> {
        self.record(Call::Write(String::from_utf8_lossy(payload).to_string()));
        Ok(())
    }

    fn disconnect(&mut self, device: &DeviceId) {
        self.record(Call::Disconnect(device.clone()));
    }
}

struct Harness {
    transport: RecordingTransport,
    transport_events: Sender<TransportEvent>,
    events: Receiver<DeviceEvent>,
    controller: ControllerHandle,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start() -> Harness {
        let transport = RecordingTransport::default();
        let machine = ConnectionMachine::new(transport.clone(), MachineSettings::default());
        let (transport_events, transport_receiver) = channel(64);
        let (event_sender, events) = channel(256);
        let cancel = CancellationToken::new();
        let (controller, task) = spawn_controller(machine, transport_receiver, vec![event_sender], cancel.clone());

        Harness { transport, transport_events, events, controller, cancel, task }
    }

    async fn inject(&mut self, event: TransportEvent) {
        self.transport_events.send(event).await.unwrap();
    }

    async fn wait_for(&mut self, wanted: DeviceEvent) {
        let events = &mut self.events;
        let found = timeout(Duration::from_secs(30), async move {
            while let Some(event) = events.next().await {
                if event == wanted {
                    return true;
                }
            }
            false
        }).await;

        assert_eq!(found, Ok(true), "event did not arrive");
    }

    async fn wait_for_state(&mut self, state: ConnectionState) {
        self.wait_for(DeviceEvent::StateChange(state)).await;
    }
}

fn handle(device: &str) -> WriteHandle {
    let settings = MachineSettings::default();
    WriteHandle {
        device: device.into(),
        service: settings.service,
        characteristic: settings.characteristic,
    }
}

async fn make_ready(harness: &mut Harness, device: &str) {
    harness.controller.connect(device.into()).unwrap();
    harness.wait_for_state(ConnectionState::Connecting(device.into())).await;
    harness.inject(TransportEvent::Connected(device.into())).await;
    harness.wait_for_state(ConnectionState::AttributeDiscovery(device.into())).await;
    harness.inject(TransportEvent::Resolved(handle(device))).await;
    harness.wait_for_state(ConnectionState::Ready(device.into(), handle(device))).await;
    harness.wait_for(DeviceEvent::CommandSent("0:0:0".to_string())).await;
}

#[tokio::test]
async fn test_scan_connect_and_drive() {
    let mut harness = Harness::start();

    harness.controller.start_scan().unwrap();
    harness.wait_for_state(ConnectionState::Scanning).await;

    harness.inject(TransportEvent::Discovered(DeviceDescriptor::new("A", Some("HMSoft".to_string())))).await;
    harness.inject(TransportEvent::Discovered(DeviceDescriptor::new("B", None))).await;
    harness.inject(TransportEvent::Discovered(DeviceDescriptor::new("A", None))).await;
    harness.wait_for(DeviceEvent::DevicesChanged(vec![
        DeviceDescriptor::new("A", Some("HMSoft".to_string())),
        DeviceDescriptor::new("B", None),
    ])).await;

    // connect without stopping the scan first
    make_ready(&mut harness, "A").await;

    let snapshot = harness.controller.snapshot();
    let ids: Vec<DeviceId> = snapshot.devices.iter().map(|device| device.id.clone()).collect();
    assert_eq!(ids, vec![DeviceId::from("A"), DeviceId::from("B")]);
    assert_eq!(harness.transport.writes(), vec!["0:0:0\n"]);

    harness.controller.submit(ControlCommand::Drive { x: 1.0, y: 0.0 }).unwrap();
    harness.wait_for(DeviceEvent::CommandSent("500:-500:0".to_string())).await;
    assert_eq!(harness.transport.writes(), vec!["0:0:0\n", "500:-500:0\n"]);
    assert_eq!(harness.controller.snapshot().last_sent.as_deref(), Some("500:-500:0"));

    let calls = harness.transport.calls();
    assert_eq!(
        calls[..5],
        [
            Call::StartScan,
            Call::StopScan,
            Call::Connect("A".into()),
            Call::Discover("A".into()),
            Call::Subscribe("A".into()),
        ],
    );

    harness.controller.disconnect().unwrap();
    harness.wait_for_state(ConnectionState::Disconnecting("A".into())).await;
    let calls = harness.transport.calls();
    assert_eq!(
        calls[calls.len() - 2..],
        [Call::Write("0:0:0\n".to_string()), Call::Disconnect("A".into())],
    );

    harness.inject(TransportEvent::Disconnected("A".into())).await;
    harness.wait_for_state(ConnectionState::Idle).await;
}

#[tokio::test]
async fn test_commands_before_ready_are_dropped() {
    let mut harness = Harness::start();

    harness.controller.send(100, 100).unwrap();
    harness.controller.send_aux(1).unwrap();
    harness.controller.submit(ControlCommand::Stop).unwrap();
    // commands are applied in order, so this also flushes the ones above
    harness.controller.start_scan().unwrap();
    harness.wait_for_state(ConnectionState::Scanning).await;

    assert!(harness.transport.writes().is_empty());
    assert_eq!(harness.controller.snapshot().last_error, None);
}

#[tokio::test(start_paused = true)]
async fn test_scan_stops_after_window() {
    let mut harness = Harness::start();

    harness.controller.start_scan().unwrap();
    harness.wait_for_state(ConnectionState::Scanning).await;
    // the paused clock jumps ahead to the scan deadline
    harness.wait_for_state(ConnectionState::Idle).await;

    assert_eq!(harness.transport.calls(), vec![Call::StartScan, Call::StopScan]);
}

#[tokio::test(start_paused = true)]
async fn test_connect_gives_up_after_timeout() {
    let mut harness = Harness::start();

    harness.controller.connect("A".into()).unwrap();
    harness.wait_for_state(ConnectionState::Connecting("A".into())).await;
    harness.wait_for_state(ConnectionState::Idle).await;

    assert!(matches!(
        harness.controller.snapshot().last_error,
        Some(hm10_drive::error::ControlError::Connect { .. }),
    ));
    assert_eq!(harness.transport.calls().last(), Some(&Call::Disconnect("A".into())));
}

#[tokio::test]
async fn test_cancel_stops_motors_and_disconnects() {
    let mut harness = Harness::start();
    make_ready(&mut harness, "A").await;

    harness.cancel.cancel();
    timeout(Duration::from_secs(30), harness.task).await.unwrap().unwrap();

    let calls = harness.transport.calls();
    assert_eq!(
        calls[calls.len() - 2..],
        [Call::Write("0:0:0\n".to_string()), Call::Disconnect("A".into())],
    );
}

#[tokio::test]
async fn test_stalled_observer_does_not_block_controller() {
    let transport = RecordingTransport::default();
    let machine = ConnectionMachine::new(transport.clone(), MachineSettings::default());
    let (_transport_events, transport_receiver) = channel::<TransportEvent>(8);
    // never read from
    let (stalled, _stalled_receiver) = channel::<DeviceEvent>(0);
    let (mut controller, task) = spawn_controller(machine, transport_receiver, vec![stalled], CancellationToken::new());

    for _ in 0..5 {
        controller.start_scan().unwrap();
        controller.stop_scan().unwrap();
    }
    controller.connect("A".into()).unwrap();

    let mut snapshots = controller.watch();
    let reached = timeout(Duration::from_secs(30), async move {
        loop {
            if snapshots.borrow_and_update().state == ConnectionState::Connecting("A".into()) {
                return;
            }
            snapshots.changed().await.unwrap();
        }
    }).await;
    assert!(reached.is_ok(), "controller stopped making progress");
    assert_eq!(transport.calls().last(), Some(&Call::Connect("A".into())));

    drop(controller);
    timeout(Duration::from_secs(30), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_dropping_handles_stops_controller() {
    let harness = Harness::start();
    let Harness { controller, task, .. } = harness;

    drop(controller);
    timeout(Duration::from_secs(30), task).await.unwrap().unwrap();
}
