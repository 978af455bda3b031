use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::future::pending;
use futures::StreamExt;
use log::{info, warn};
use tokio::spawn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::device::machine::ConnectionMachine;
use crate::device::transport::{Transport, TransportEvent};
use crate::device::types::{ControlCommand, DeviceEvent, DeviceId, Snapshot};
use crate::error::DeviceError;

/**
 * Caller commands waiting for the controller. Drive samples beyond this are dropped.
 */
pub const COMMAND_QUEUE_SIZE: usize = 64;

/// Cheap, cloneable way to talk to a running controller.
///
/// Every method only queues the command and returns; outcomes are observed
/// through `DeviceEvent`s or `snapshot`.
#[derive(Clone)]
pub struct ControllerHandle {
    commands: Sender<ControlCommand>,
    snapshot: watch::Receiver<Snapshot>,
}

impl ControllerHandle {
    pub fn submit(&mut self, command: ControlCommand) -> Result<(), DeviceError> {
        self.commands
            .try_send(command)
            .map_err(|err| DeviceError::SendError { source: err.into_send_error() })
    }

    pub fn start_scan(&mut self) -> Result<(), DeviceError> {
        self.submit(ControlCommand::StartScan)
    }

    pub fn stop_scan(&mut self) -> Result<(), DeviceError> {
        self.submit(ControlCommand::StopScan)
    }

    pub fn connect(&mut self, device: DeviceId) -> Result<(), DeviceError> {
        self.submit(ControlCommand::Connect(device))
    }

    pub fn disconnect(&mut self) -> Result<(), DeviceError> {
        self.submit(ControlCommand::Disconnect)
    }

    pub fn send(&mut self, left: i32, right: i32) -> Result<(), DeviceError> {
        self.submit(ControlCommand::Send { left, right })
    }

    pub fn send_aux(&mut self, value: i8) -> Result<(), DeviceError> {
        self.submit(ControlCommand::Aux(value))
    }

    /// Latest published state.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to snapshot changes.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}

fn publish<T: Transport>(
    machine: &mut ConnectionMachine<T>,
    snapshot: &watch::Sender<Snapshot>,
    senders: &mut Vec<Sender<DeviceEvent>>,
) {
    let next = machine.snapshot();
    snapshot.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        *current = next;
        true
    });

    // an observer that falls behind loses events, it never holds up the controller
    for event in machine.drain_events() {
        for sender in senders.iter_mut() {
            if let Err(err) = sender.try_send(event.clone()) {
                if err.is_full() {
                    warn!("Observer is not keeping up, dropping {:?}", err.into_inner());
                }
            }
        }
    }

    // forget observers that went away
    senders.retain(|sender| !sender.is_closed());
}

/// Run the connection state machine on its own task.
///
/// Caller commands, transport events and deadlines are applied strictly one
/// at a time. Cancelling `cancel` or dropping every `ControllerHandle` runs
/// the disconnect path before the task ends.
pub fn spawn_controller<T>(
    mut machine: ConnectionMachine<T>,
    mut transport_events: Receiver<TransportEvent>,
    mut senders: Vec<Sender<DeviceEvent>>,
    cancel: CancellationToken,
) -> (ControllerHandle, JoinHandle<()>)
where
    T: Transport + Send + 'static,
{
    let (command_sender, mut command_receiver) = channel::<ControlCommand>(COMMAND_QUEUE_SIZE);
    let (snapshot_sender, snapshot_receiver) = watch::channel(machine.snapshot());

    let handle = spawn(async move {
        'mainloop: loop {
            let deadline = machine.next_deadline();

            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                command = command_receiver.next() => match command {
                    Some(command) => machine.handle_command(command, Instant::now()),
                    None => break 'mainloop,
                },
                Some(event) = transport_events.next() => {
                    machine.handle_event(event, Instant::now());
                },
                _ = wait_for_deadline(deadline) => {
                    machine.poll_deadline(Instant::now());
                },
            }

            publish(&mut machine, &snapshot_sender, &mut senders);
        }

        info!("Controller stopping");
        machine.handle_command(ControlCommand::Disconnect, Instant::now());
        publish(&mut machine, &snapshot_sender, &mut senders);
    });

    let controller = ControllerHandle {
        commands: command_sender,
        snapshot: snapshot_receiver,
    };

    (controller, handle)
}
