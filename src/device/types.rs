use std::fmt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::drive::command::MotorCommand;
use crate::drive::mapper::MaxSpeed;
use crate::error::ControlError;

/// Stable identifier of a peripheral, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        DeviceId(value.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        DeviceId(value)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub display_name: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<DeviceId>, display_name: Option<String>) -> Self {
        DeviceDescriptor { id: id.into(), display_name }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "Unknown Device ({})", self.id),
        }
    }
}

/// Resolved command-write endpoint of a connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WriteHandle {
    pub device: DeviceId,
    pub service: Uuid,
    pub characteristic: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting(DeviceId),
    AttributeDiscovery(DeviceId),
    Ready(DeviceId, WriteHandle),
    Disconnecting(DeviceId),
    Failed(ControlError),
}

impl ConnectionState {
    /// The peripheral this state is about, if any.
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            ConnectionState::Connecting(id)
            | ConnectionState::AttributeDiscovery(id)
            | ConnectionState::Ready(id, _)
            | ConnectionState::Disconnecting(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready(..))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Scanning => write!(f, "scanning"),
            ConnectionState::Connecting(id) => write!(f, "connecting to {}", id),
            ConnectionState::AttributeDiscovery(id) => write!(f, "discovering attributes of {}", id),
            ConnectionState::Ready(id, _) => write!(f, "connected to {}", id),
            ConnectionState::Disconnecting(id) => write!(f, "disconnecting from {}", id),
            ConnectionState::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

/// Caller side inputs of the connection state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    StartScan,
    StopScan,
    Connect(DeviceId),
    Disconnect,
    /// Continuous drive values, rate limited and deduplicated.
    Send { left: i32, right: i32 },
    /// Continuous drive input vector, mapped with the current max speed.
    Drive { x: f32, y: f32 },
    /// Discrete auxiliary directive, sent right away.
    Aux(i8),
    /// Unconditional (0,0,0).
    Stop,
    /// Raw payload written as-is.
    SendText(String),
    SetMaxSpeed(i32),
    DismissError,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    StateChange(ConnectionState),
    DevicesChanged(Vec<DeviceDescriptor>),
    CommandSent(String),
    Error(ControlError),
}

/// Read-only view of everything the controller publishes.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub state: ConnectionState,
    pub devices: Vec<DeviceDescriptor>,
    pub last_command: MotorCommand,
    pub last_sent: Option<String>,
    pub last_error: Option<ControlError>,
    pub transport_available: bool,
    pub max_speed: MaxSpeed,
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot {
            state: ConnectionState::Idle,
            devices: Vec::new(),
            last_command: MotorCommand::STOP,
            last_sent: None,
            last_error: None,
            transport_available: true,
            max_speed: MaxSpeed::default(),
        }
    }
}
