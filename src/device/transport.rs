use uuid::Uuid;

use crate::device::types::{DeviceDescriptor, DeviceId, WriteHandle};
use crate::error::DeviceError;

/// Completions reported by the radio stack, consumed one at a time by the
/// connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The radio is off, unauthorized or missing.
    Unavailable(String),
    /// The radio came back after being reported unavailable.
    Available,
    Discovered(DeviceDescriptor),
    ScanFailed(String),
    Connected(DeviceId),
    ConnectFailed(DeviceId, String),
    /// The command characteristic was found under the expected service.
    Resolved(WriteHandle),
    DiscoveryFailed(DeviceId, String),
    Disconnected(DeviceId),
    Notification(DeviceId, Vec<u8>),
    WriteFailed(String),
}

/// Radio stack as seen by the state machine.
///
/// Every method only initiates the operation and returns immediately; the
/// outcome arrives later as a `TransportEvent`. `write` may also fail right
/// away when the payload can not even be queued.
pub trait Transport {
    fn start_scan(&mut self, filter: Option<Uuid>);

    fn stop_scan(&mut self);

    fn connect(&mut self, device: &DeviceId);

    fn discover(&mut self, device: &DeviceId, service: Uuid, characteristic: Uuid);

    /// Enable value change notifications on the handle.
    fn subscribe(&mut self, handle: &WriteHandle);

    fn write(&mut self, handle: &WriteHandle, payload: &[u8], ack: bool) -> Result<(), DeviceError>;

    fn disconnect(&mut self, device: &DeviceId);
}
