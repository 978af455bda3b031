use std::collections::HashSet;
use indexmap::IndexMap;
use log::{debug, info, trace, warn};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::types::Config;
use crate::device::transport::{Transport, TransportEvent};
use crate::device::types::{
    ConnectionState, ControlCommand, DeviceDescriptor, DeviceEvent, DeviceId, Snapshot, WriteHandle,
};
use crate::drive::command::{Aux, MotorCommand};
use crate::drive::mapper::{clamp_input, map, MaxSpeed};
use crate::drive::throttle::Throttler;
use crate::error::ControlError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSettings {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub filter_by_service: bool,
    pub max_speed: MaxSpeed,
    pub send_interval: Duration,
    pub scan_timeout: Duration,
    /// Bound for Connecting, AttributeDiscovery and Disconnecting.
    pub operation_timeout: Duration,
}

impl From<&Config> for MachineSettings {
    fn from(config: &Config) -> Self {
        MachineSettings {
            service: config.service_uuid,
            characteristic: config.characteristic_uuid,
            filter_by_service: config.filter_by_service,
            max_speed: config.max_speed,
            send_interval: Duration::from_millis(config.send_interval_ms),
            scan_timeout: Duration::from_millis(config.scan_timeout_ms),
            operation_timeout: Duration::from_millis(config.connect_timeout_ms),
        }
    }
}

impl Default for MachineSettings {
    fn default() -> Self {
        MachineSettings::from(&Config::default())
    }
}

/// Connection lifecycle of a single peripheral plus the outbound send path.
///
/// Inputs (caller commands, transport events and deadline expiry) must be fed
/// one at a time; the machine itself never blocks or waits. Everything
/// observers should learn about is collected and handed out by
/// `drain_events`.
pub struct ConnectionMachine<T: Transport> {
    transport: T,
    settings: MachineSettings,
    state: ConnectionState,
    deadline: Option<Instant>,
    devices: IndexMap<DeviceId, DeviceDescriptor>,
    throttler: Throttler,
    max_speed: MaxSpeed,
    last_command: MotorCommand,
    last_sent: Option<String>,
    last_error: Option<ControlError>,
    // reason the radio can not be used, if any
    unavailable: Option<String>,
    // links we asked the transport to drop that have not reported Disconnected yet
    tearing_down: HashSet<DeviceId>,
    outbox: Vec<DeviceEvent>,
}

impl<T: Transport> ConnectionMachine<T> {
    pub fn new(transport: T, settings: MachineSettings) -> Self {
        ConnectionMachine {
            transport,
            throttler: Throttler::new(settings.send_interval),
            max_speed: settings.max_speed,
            settings,
            state: ConnectionState::Idle,
            deadline: None,
            devices: IndexMap::new(),
            last_command: MotorCommand::STOP,
            last_sent: None,
            last_error: None,
            unavailable: None,
            tearing_down: HashSet::new(),
            outbox: Vec::new(),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.values().cloned().collect()
    }

    pub fn max_speed(&self) -> MaxSpeed {
        self.max_speed
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// When `poll_deadline` has to be called next.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn drain_events(&mut self) -> Vec<DeviceEvent> {
        std::mem::take(&mut self.outbox)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state.clone(),
            devices: self.devices(),
            last_command: self.last_command,
            last_sent: self.last_sent.clone(),
            last_error: self.last_error.clone(),
            transport_available: self.unavailable.is_none(),
            max_speed: self.max_speed,
        }
    }

    pub fn handle_command(&mut self, command: ControlCommand, now: Instant) {
        match command {
            ControlCommand::StartScan => self.start_scan(now),
            ControlCommand::StopScan => self.stop_scan(),
            ControlCommand::Connect(device) => self.connect(device, now),
            ControlCommand::Disconnect => self.disconnect(now),
            ControlCommand::Send { left, right } => self.send(left, right, now),
            ControlCommand::Drive { x, y } => {
                let (left, right) = map(clamp_input(x), clamp_input(y), self.max_speed);
                self.send(left, right, now);
            },
            ControlCommand::Aux(value) => self.send_aux(value),
            ControlCommand::Stop => self.stop(),
            ControlCommand::SendText(text) => self.send_text(text),
            ControlCommand::SetMaxSpeed(value) => {
                self.max_speed = MaxSpeed::new(value);
                info!("Max speed set to {}", self.max_speed);
            },
            ControlCommand::DismissError => {
                self.last_error = None;
            },
        }
    }

    pub fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Unavailable(reason) => {
                match self.state.clone() {
                    ConnectionState::Scanning => self.transport.stop_scan(),
                    state => {
                        if let Some(device) = state.device() {
                            self.teardown(device);
                        }
                    },
                }

                self.unavailable = Some(reason.clone());
                self.surface(ControlError::TransportUnavailable(reason));
                self.enter_idle();
            },
            TransportEvent::Available => {
                if self.unavailable.take().is_some() {
                    info!("Bluetooth is available again");
                }
            },
            TransportEvent::Discovered(descriptor) => {
                if self.state != ConnectionState::Scanning {
                    trace!("Ignoring discovery of {} while not scanning", descriptor.id);
                    return;
                }
                if self.devices.contains_key(&descriptor.id) {
                    return;
                }

                info!("Discovered {}", descriptor);
                self.devices.insert(descriptor.id.clone(), descriptor);
                self.outbox.push(DeviceEvent::DevicesChanged(self.devices()));
            },
            TransportEvent::ScanFailed(reason) => {
                if self.state == ConnectionState::Scanning {
                    self.surface(ControlError::Scan(reason));
                    self.set_state(ConnectionState::Idle, None);
                }
            },
            TransportEvent::Connected(device) => match self.state.clone() {
                ConnectionState::Connecting(expected) if expected == device => {
                    info!("Connected to {}; Discovering services...", device);
                    self.transport.discover(&device, self.settings.service, self.settings.characteristic);
                    self.set_state(
                        ConnectionState::AttributeDiscovery(device),
                        Some(now + self.settings.operation_timeout),
                    );
                },
                state => {
                    if state.device() != Some(&device) {
                        // a connect that completed after we gave up on it
                        warn!("Dropping unexpected link to {}", device);
                        self.teardown(&device);
                    }
                },
            },
            TransportEvent::ConnectFailed(device, reason) => {
                if self.state == ConnectionState::Connecting(device.clone()) {
                    self.fail(ControlError::Connect { device, reason });
                }
            },
            TransportEvent::Resolved(handle) => {
                if self.state == ConnectionState::AttributeDiscovery(handle.device.clone()) {
                    self.enter_ready(handle);
                } else {
                    debug!("Ignoring resolved handle for {}", handle.device);
                }
            },
            TransportEvent::DiscoveryFailed(device, reason) => {
                if self.state == ConnectionState::AttributeDiscovery(device.clone()) {
                    self.teardown(&device);
                    self.fail(ControlError::Discovery { device, reason });
                }
            },
            TransportEvent::Disconnected(device) => {
                let requested = self.tearing_down.remove(&device);
                self.disconnected(device, requested);
            },
            TransportEvent::Notification(device, value) => {
                debug!("Received from {}: {}", device, String::from_utf8_lossy(&value));
            },
            TransportEvent::WriteFailed(reason) => {
                self.surface(ControlError::Write(reason));
            },
        }
    }

    fn disconnected(&mut self, device: DeviceId, requested: bool) {
        match self.state.clone() {
            ConnectionState::Ready(current, _) | ConnectionState::Disconnecting(current) if current == device => {
                info!("Disconnected from {}", device);
                self.enter_idle();
            },
            ConnectionState::Connecting(current) if current == device && requested => {
                // the old link is gone, the connect waiting on it can start now
                info!("Connecting to {}...", device);
                self.transport.connect(&device);
            },
            ConnectionState::Connecting(current) | ConnectionState::AttributeDiscovery(current) if current == device => {
                self.fail(ControlError::Connect {
                    device,
                    reason: "connection lost during setup".to_string(),
                });
            },
            _ => debug!("Ignoring disconnect of {}", device),
        }
    }

    pub fn poll_deadline(&mut self, now: Instant) {
        match self.deadline {
            Some(deadline) if now >= deadline => {},
            _ => return,
        }
        self.deadline = None;

        match self.state.clone() {
            ConnectionState::Scanning => {
                info!("Scan window elapsed");
                self.stop_scan();
            },
            ConnectionState::Connecting(device) => {
                self.teardown(&device);
                self.fail(ControlError::Connect { device, reason: "timed out".to_string() });
            },
            ConnectionState::AttributeDiscovery(device) => {
                self.teardown(&device);
                self.fail(ControlError::Discovery { device, reason: "timed out".to_string() });
            },
            ConnectionState::Disconnecting(device) => {
                warn!("Disconnecting from {} took too long", device);
                self.enter_idle();
            },
            _ => {},
        }
    }

    fn start_scan(&mut self, now: Instant) {
        if let Some(reason) = self.unavailable.clone() {
            self.surface(ControlError::TransportUnavailable(reason));
            return;
        }

        match self.state {
            ConnectionState::Idle => {
                let filter = match self.settings.filter_by_service {
                    true => Some(self.settings.service),
                    false => None,
                };
                info!("Scanning for peripherals...");
                self.transport.start_scan(filter);
            },
            ConnectionState::Scanning => {
                debug!("Restarting scan window");
            },
            _ => {
                self.reject("scan");
                return;
            },
        }

        self.devices.clear();
        self.outbox.push(DeviceEvent::DevicesChanged(Vec::new()));
        self.set_state(ConnectionState::Scanning, Some(now + self.settings.scan_timeout));
    }

    fn stop_scan(&mut self) {
        if self.state == ConnectionState::Scanning {
            self.transport.stop_scan();
            self.set_state(ConnectionState::Idle, None);
        }
    }

    fn connect(&mut self, device: DeviceId, now: Instant) {
        if let Some(reason) = self.unavailable.clone() {
            self.surface(ControlError::TransportUnavailable(reason));
            return;
        }

        match self.state {
            ConnectionState::Idle => {},
            // the radio can not connect while it is scanning
            ConnectionState::Scanning => self.transport.stop_scan(),
            _ => {
                self.reject("connect");
                return;
            },
        }

        if self.tearing_down.contains(&device) {
            // connecting now would race the pending disconnect of the same peripheral
            debug!("Waiting for the previous link to {} to close", device);
        } else {
            info!("Connecting to {}...", device);
            self.transport.connect(&device);
        }
        self.set_state(ConnectionState::Connecting(device), Some(now + self.settings.operation_timeout));
    }

    fn disconnect(&mut self, now: Instant) {
        match self.state.clone() {
            ConnectionState::Scanning => self.stop_scan(),
            ConnectionState::Connecting(device) | ConnectionState::AttributeDiscovery(device) => {
                self.teardown(&device);
                self.set_state(
                    ConnectionState::Disconnecting(device),
                    Some(now + self.settings.operation_timeout),
                );
            },
            ConnectionState::Ready(device, handle) => {
                let stop = self.throttler.force_stop();
                match self.transport.write(&handle, &stop.encode(), false) {
                    Ok(()) => self.record_sent(stop),
                    Err(err) => warn!("Failed to send stop before disconnecting: {}", err),
                }

                info!("Disconnecting from {}...", device);
                self.teardown(&device);
                self.set_state(
                    ConnectionState::Disconnecting(device),
                    Some(now + self.settings.operation_timeout),
                );
            },
            ConnectionState::Idle | ConnectionState::Disconnecting(_) | ConnectionState::Failed(_) => {
                debug!("Nothing to disconnect");
            },
        }
    }

    fn send(&mut self, left: i32, right: i32, now: Instant) {
        let Some(handle) = self.ready_handle() else {
            trace!("Not ready, dropping {}:{}", left, right);
            return;
        };

        let left = self.max_speed.clamp(left);
        let right = self.max_speed.clamp(right);

        if let Some(command) = self.throttler.offer_continuous_at(left, right, now) {
            if self.write_command(&handle, command) {
                self.throttler.record_continuous(&command, now);
            }
        }
    }

    fn send_aux(&mut self, value: i8) {
        let aux = match Aux::try_from(value) {
            Ok(aux) => aux,
            Err(err) => {
                self.surface(err);
                return;
            },
        };

        if let Some(handle) = self.ready_handle() {
            let command = self.throttler.offer_immediate(aux);
            self.write_command(&handle, command);
        }
    }

    fn stop(&mut self) {
        if let Some(handle) = self.ready_handle() {
            self.write_stop(&handle);
        }
    }

    fn send_text(&mut self, text: String) {
        if text.is_empty() {
            return;
        }

        if let Some(handle) = self.ready_handle() {
            match self.transport.write(&handle, text.as_bytes(), false) {
                Ok(()) => {
                    self.last_sent = Some(text.clone());
                    self.outbox.push(DeviceEvent::CommandSent(text));
                },
                Err(err) => self.surface(ControlError::Write(err.to_string())),
            }
        }
    }

    fn enter_ready(&mut self, handle: WriteHandle) {
        info!("Subscribing to characteristic {:?} {:?}", handle.service, handle.characteristic);
        self.transport.subscribe(&handle);

        info!("Peripheral {} ready", handle.device);
        self.throttler.reset();
        self.set_state(ConnectionState::Ready(handle.device.clone(), handle.clone()), None);

        // never let the peripheral keep moving on whatever it received before
        self.write_stop(&handle);
    }

    fn enter_idle(&mut self) {
        self.throttler.reset();
        self.last_command = MotorCommand::STOP;
        self.set_state(ConnectionState::Idle, None);
    }

    /// Surface the error, pass through Failed and settle in Idle.
    fn fail(&mut self, error: ControlError) {
        self.surface(error.clone());
        self.set_state(ConnectionState::Failed(error), None);
        self.enter_idle();
    }

    fn reject(&mut self, operation: &'static str) {
        let state = self.state.to_string();
        self.surface(ControlError::InvalidState { operation, state });
    }

    fn ready_handle(&self) -> Option<WriteHandle> {
        match &self.state {
            ConnectionState::Ready(_, handle) => Some(handle.clone()),
            _ => None,
        }
    }

    /// Returns whether the transport took the command.
    fn write_command(&mut self, handle: &WriteHandle, command: MotorCommand) -> bool {
        match self.transport.write(handle, &command.encode(), false) {
            Ok(()) => {
                self.record_sent(command);
                true
            },
            Err(err) => {
                self.surface(ControlError::Write(err.to_string()));
                false
            },
        }
    }

    fn write_stop(&mut self, handle: &WriteHandle) {
        let stop = self.throttler.force_stop();
        if self.write_command(handle, stop) {
            self.throttler.record_stop();
        }
    }

    fn teardown(&mut self, device: &DeviceId) {
        self.transport.disconnect(device);
        self.tearing_down.insert(device.clone());
    }

    fn record_sent(&mut self, command: MotorCommand) {
        trace!("Sent {}", command);
        let payload = command.to_string();
        self.last_command = command;
        self.last_sent = Some(payload.clone());
        self.outbox.push(DeviceEvent::CommandSent(payload));
    }

    fn surface(&mut self, error: ControlError) {
        warn!("{}", error);
        self.last_error = Some(error.clone());
        self.outbox.push(DeviceEvent::Error(error));
    }

    fn set_state(&mut self, state: ConnectionState, deadline: Option<Instant>) {
        self.deadline = deadline;
        if self.state != state {
            debug!("Connection state: {} -> {}", self.state, state);
            self.state = state.clone();
            self.outbox.push(DeviceEvent::StateChange(state));
        }
    }
}
