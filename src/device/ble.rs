use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use btleplug::api::{Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::{DISCONNECT_DEADLINE, WRITE_DEADLINE, WRITE_QUEUE_SIZE};
use crate::device::transport::{Transport, TransportEvent};
use crate::device::types::{DeviceDescriptor, DeviceId, WriteHandle};
use crate::error::DeviceError;

type Links = Arc<Mutex<HashMap<DeviceId, Peripheral>>>;

/// Radio work that has to happen in order: a stop written before a
/// disconnect must reach the radio first.
enum LinkOp {
    Write {
        peripheral: Peripheral,
        characteristic: Characteristic,
        payload: Vec<u8>,
        write_type: WriteType,
    },
    Disconnect {
        device: DeviceId,
        peripheral: Option<Peripheral>,
    },
}

/// `Transport` backed by the platform bluetooth stack.
pub struct BtleTransport {
    adapter: Option<Adapter>,
    events: Sender<TransportEvent>,
    links: Links,
    ops: Sender<LinkOp>,
    cancel: CancellationToken,
    scan_cancel: Option<CancellationToken>,
    scan: Option<JoinHandle<()>>,
    // cancelled whenever the current link is torn down
    link_cancel: CancellationToken,
}

fn lock_links(links: &Links) -> MutexGuard<'_, HashMap<DeviceId, Peripheral>> {
    links.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn device_id(peripheral: &Peripheral) -> DeviceId {
    DeviceId::new(peripheral.id().to_string())
}

fn is_permission_denied(err: &DeviceError) -> bool {
    matches!(err, DeviceError::Btle { source: btleplug::Error::PermissionDenied })
}

async fn forward(events: &mut Sender<TransportEvent>, event: TransportEvent) {
    if let Err(err) = events.send(event).await {
        debug!("Dropping transport event, controller is gone: {}", err);
    }
}

async fn find_adapter() -> Result<Adapter, DeviceError> {
    let manager = Manager::new().await?;
    let adapter = manager.adapters().await?.into_iter().next().ok_or(DeviceError::NoAdapter)?;
    info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
    Ok(adapter)
}

async fn find_peripheral(adapter: &Adapter, device: &DeviceId) -> Result<Option<Peripheral>, DeviceError> {
    let peripherals = adapter.peripherals().await?;
    Ok(peripherals.into_iter().find(|peripheral| &device_id(peripheral) == device))
}

async fn describe(peripheral: &Peripheral, filter: Option<Uuid>) -> Option<DeviceDescriptor> {
    match peripheral.properties().await {
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            None
        },
        Ok(None) => {
            debug!("Peripheral has no properties");
            None
        },
        Ok(Some(properties)) => {
            // Some environments ignore the filter, so make sure to check the service uuid again
            if let Some(service) = filter {
                if !properties.services.contains(&service) {
                    return None;
                }
            }

            Some(DeviceDescriptor::new(device_id(peripheral), properties.local_name))
        },
    }
}

async fn scan(
    cancel: &CancellationToken,
    adapter: &Adapter,
    filter: Option<Uuid>,
    events: &mut Sender<TransportEvent>,
) -> Result<(), DeviceError> {
    let mut central_events = adapter.events().await?;
    let scan_filter = ScanFilter {
        services: filter.into_iter().collect(),
    };

    info!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
    adapter.start_scan(scan_filter).await?;

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            event = central_events.next() => match event {
                // already known peripherals only show up as updates on some platforms
                Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => {
                    let peripheral = match adapter.peripheral(&id).await {
                        Ok(peripheral) => peripheral,
                        Err(err) => {
                            warn!("Failed to query BLE adapter for peripheral: {}", err);
                            continue 'mainloop;
                        },
                    };

                    if let Some(descriptor) = describe(&peripheral, filter).await {
                        forward(events, TransportEvent::Discovered(descriptor)).await;
                    }
                },
                Some(_) => {},
                None => break 'mainloop,
            },
        }
    }

    Ok(())
}

/// Run `next` only after `previous` finished.
fn spawn_after<F>(previous: Option<JoinHandle<()>>, next: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    spawn(async move {
        if let Some(previous) = previous {
            if let Err(err) = previous.await {
                debug!("Previous task failed: {:?}", err);
            }
        }
        next.await
    })
}

// The previous scan stops the adapter on its way out, so the next one has to
// wait for it or it would be stopped right after starting.
fn scan_task(
    previous: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    adapter: Adapter,
    filter: Option<Uuid>,
    mut events: Sender<TransportEvent>,
) -> JoinHandle<()> {
    spawn_after(previous, async move {
        if cancel.is_cancelled() {
            return;
        }

        if let Err(err) = scan(&cancel, &adapter, filter, &mut events).await {
            warn!("Scanning failed {:?}", err);

            let event = match is_permission_denied(&err) {
                true => TransportEvent::Unavailable("not allowed to access Bluetooth".to_string()),
                false => TransportEvent::ScanFailed(err.to_string()),
            };
            forward(&mut events, event).await;
        }

        if let Err(err) = adapter.stop_scan().await {
            debug!("Failed to stop scanning: {:?}", err);
        }
    })
}

async fn connect_peripheral(adapter: &Adapter, device: &DeviceId) -> Result<Peripheral, DeviceError> {
    let peripheral = find_peripheral(adapter, device)
        .await?
        .ok_or_else(|| DeviceError::UnknownDevice(device.clone()))?;

    info!("Connecting to peripheral {}...", device);
    peripheral.connect().await?;
    Ok(peripheral)
}

async fn resolve_characteristic(peripheral: &Peripheral, service_uuid: Uuid, characteristic_uuid: Uuid) -> Result<Characteristic, DeviceError> {
    info!("Connected; Discovering services...");
    peripheral.discover_services().await?;

    let service = peripheral.services()
        .into_iter()
        .find(|service| service.uuid == service_uuid)
        .ok_or(DeviceError::MissingService)?;

    service.characteristics
        .into_iter()
        .find(|characteristic| characteristic.uuid == characteristic_uuid)
        .ok_or(DeviceError::MissingCharacteristic)
}

fn read_notifications_task(
    cancel: CancellationToken,
    device: DeviceId,
    peripheral: Peripheral,
    characteristic: Characteristic,
    mut events: Sender<TransportEvent>,
) -> JoinHandle<()> {
    spawn(async move {
        if let Err(err) = peripheral.subscribe(&characteristic).await {
            warn!("Failed to subscribe to characteristic {:?}: {:?}", characteristic.uuid, err);
            return;
        }

        let mut notification_stream = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to read notifications: {:?}", err);
                return;
            },
        };

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                data = notification_stream.next() => match data {
                    Some(data) => {
                        if data.uuid == characteristic.uuid {
                            forward(&mut events, TransportEvent::Notification(device.clone(), data.value)).await;
                        }
                    },
                    None => break 'mainloop,
                },
            }
        }
    })
}

async fn perform_write(peripheral: &Peripheral, characteristic: &Characteristic, payload: &[u8], write_type: WriteType) -> Result<(), String> {
    let fut = peripheral.write(characteristic, payload, write_type);

    tokio::select! {
        _ = sleep(Duration::from_millis(WRITE_DEADLINE)) => {
            warn!("Sending to data characteristic took too long");
            Err("write timed out".to_string())
        }
        result = fut => result.map_err(|err| {
            warn!("Failed to send to data characteristic: {:?}", err);
            err.to_string()
        }),
    }
}

async fn perform_disconnect(adapter: Option<&Adapter>, device: &DeviceId, peripheral: Option<Peripheral>) {
    let peripheral = match (peripheral, adapter) {
        (Some(peripheral), _) => Some(peripheral),
        // the connect was still in flight, the adapter may have linked it anyway
        (None, Some(adapter)) => find_peripheral(adapter, device).await.unwrap_or(None),
        (None, None) => None,
    };

    let Some(peripheral) = peripheral else {
        return;
    };

    tokio::select! {
        _ = sleep(Duration::from_millis(DISCONNECT_DEADLINE)) => {
            warn!("Disconnecting from {} took too long", device);
        }
        result = peripheral.disconnect() => {
            if let Err(err) = result {
                warn!("Failed to disconnect from {}: {:?}", device, err);
            }
        }
    }
}

/// Applies `LinkOp`s one after another. Ends once every sender is dropped and
/// the queue is drained, so the final stop still goes out on shutdown.
fn link_worker_task(adapter: Option<Adapter>, mut ops: Receiver<LinkOp>, mut events: Sender<TransportEvent>) -> JoinHandle<()> {
    spawn(async move {
        while let Some(op) = ops.next().await {
            match op {
                LinkOp::Write { peripheral, characteristic, payload, write_type } => {
                    if let Err(reason) = perform_write(&peripheral, &characteristic, &payload, write_type).await {
                        forward(&mut events, TransportEvent::WriteFailed(reason)).await;
                    }
                },
                LinkOp::Disconnect { device, peripheral } => {
                    perform_disconnect(adapter.as_ref(), &device, peripheral).await;
                    info!("Disconnected from {}", device);
                    forward(&mut events, TransportEvent::Disconnected(device)).await;
                },
            }
        }

        debug!("Link worker stopped");
    })
}

/// Reports lost links and adapter power changes.
async fn watch_adapter(cancel: CancellationToken, adapter: Adapter, links: Links, mut events: Sender<TransportEvent>) -> Result<(), DeviceError> {
    let mut central_events = adapter.events().await?;

    'mainloop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            event = central_events.next() => match event {
                Some(CentralEvent::StateUpdate(CentralState::PoweredOff)) => {
                    warn!("Bluetooth was powered off");
                    forward(&mut events, TransportEvent::Unavailable("Bluetooth is powered off".to_string())).await;
                },
                Some(CentralEvent::StateUpdate(CentralState::PoweredOn)) => {
                    info!("Bluetooth was powered on");
                    forward(&mut events, TransportEvent::Available).await;
                },
                Some(CentralEvent::DeviceDisconnected(id)) => {
                    let device = DeviceId::new(id.to_string());
                    let known = lock_links(&links).remove(&device).is_some();
                    if known {
                        warn!("Connection to {} lost", device);
                        forward(&mut events, TransportEvent::Disconnected(device)).await;
                    }
                },
                Some(_) => {},
                None => break 'mainloop,
            },
        }
    }

    Ok(())
}

impl BtleTransport {
    /// Set up the first bluetooth adapter. A missing or inaccessible adapter is
    /// reported as `TransportEvent::Unavailable` rather than as an error.
    ///
    /// The returned handle finishes once every queued write and disconnect was
    /// attempted after the transport is dropped.
    pub async fn new(mut events: Sender<TransportEvent>, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let adapter = match find_adapter().await {
            Ok(adapter) => Some(adapter),
            Err(err) => {
                warn!("Bluetooth is not available: {:?}", err);
                let reason = match is_permission_denied(&err) {
                    true => "not allowed to access Bluetooth".to_string(),
                    false => err.to_string(),
                };
                forward(&mut events, TransportEvent::Unavailable(reason)).await;
                None
            },
        };

        let links: Links = Arc::new(Mutex::new(HashMap::new()));
        let (ops, ops_receiver) = channel::<LinkOp>(WRITE_QUEUE_SIZE);
        let worker = link_worker_task(adapter.clone(), ops_receiver, events.clone());

        if let Some(adapter) = &adapter {
            let watch_cancel = cancel.child_token();
            let adapter = adapter.clone();
            let links = links.clone();
            let events = events.clone();
            spawn(async move {
                if let Err(err) = watch_adapter(watch_cancel, adapter, links, events).await {
                    warn!("Failed to watch the adapter: {:?}", err);
                }
            });
        }

        let transport = BtleTransport {
            adapter,
            events,
            links,
            ops,
            link_cancel: cancel.child_token(),
            scan_cancel: None,
            scan: None,
            cancel,
        };

        (transport, worker)
    }

    fn report(&self, event: TransportEvent) {
        let mut events = self.events.clone();
        if let Err(err) = events.try_send(event) {
            warn!("Failed to report transport event: {}", err);
        }
    }

    fn adapter_or_report(&self) -> Option<Adapter> {
        if self.adapter.is_none() {
            self.report(TransportEvent::Unavailable(DeviceError::NoAdapter.to_string()));
        }
        self.adapter.clone()
    }

    fn link(&self, device: &DeviceId) -> Option<Peripheral> {
        lock_links(&self.links).get(device).cloned()
    }

    fn endpoint(&self, handle: &WriteHandle) -> Result<(Peripheral, Characteristic), DeviceError> {
        let peripheral = self.link(&handle.device)
            .ok_or_else(|| DeviceError::UnknownDevice(handle.device.clone()))?;

        let characteristic = peripheral.characteristics()
            .into_iter()
            .find(|characteristic| {
                characteristic.uuid == handle.characteristic && characteristic.service_uuid == handle.service
            })
            .ok_or(DeviceError::MissingCharacteristic)?;

        Ok((peripheral, characteristic))
    }

    fn queue(&mut self, op: LinkOp) -> Result<(), DeviceError> {
        self.ops.try_send(op).map_err(|err| DeviceError::SendError { source: err.into_send_error() })
    }
}

impl Transport for BtleTransport {
    fn start_scan(&mut self, filter: Option<Uuid>) {
        let Some(adapter) = self.adapter_or_report() else {
            return;
        };

        self.stop_scan();
        let scan_cancel = self.cancel.child_token();
        self.scan_cancel = Some(scan_cancel.clone());
        self.scan = Some(scan_task(self.scan.take(), scan_cancel, adapter, filter, self.events.clone()));
    }

    fn stop_scan(&mut self) {
        if let Some(scan_cancel) = self.scan_cancel.take() {
            scan_cancel.cancel();
        }
    }

    fn connect(&mut self, device: &DeviceId) {
        let Some(adapter) = self.adapter_or_report() else {
            return;
        };

        let cancel = self.link_cancel.clone();
        let links = self.links.clone();
        let mut events = self.events.clone();
        let device = device.clone();

        spawn(async move {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Connecting to {} was cancelled", device);
                    return;
                }
                result = connect_peripheral(&adapter, &device) => match result {
                    Ok(peripheral) => {
                        lock_links(&links).insert(device.clone(), peripheral);
                        TransportEvent::Connected(device)
                    },
                    Err(err) => {
                        warn!("Connecting to peripheral failed: {:?}", err);
                        TransportEvent::ConnectFailed(device, err.to_string())
                    },
                },
            };

            forward(&mut events, event).await;
        });
    }

    fn discover(&mut self, device: &DeviceId, service: Uuid, characteristic: Uuid) {
        let peripheral = self.link(device);
        let cancel = self.link_cancel.clone();
        let mut events = self.events.clone();
        let device = device.clone();

        spawn(async move {
            let Some(peripheral) = peripheral else {
                forward(&mut events, TransportEvent::DiscoveryFailed(device, "not connected".to_string())).await;
                return;
            };

            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    return;
                }
                result = resolve_characteristic(&peripheral, service, characteristic) => match result {
                    Ok(_) => TransportEvent::Resolved(WriteHandle { device, service, characteristic }),
                    Err(err) => {
                        warn!("Resolving the command characteristic failed: {:?}", err);
                        TransportEvent::DiscoveryFailed(device, err.to_string())
                    },
                },
            };

            forward(&mut events, event).await;
        });
    }

    fn subscribe(&mut self, handle: &WriteHandle) {
        match self.endpoint(handle) {
            Ok((peripheral, characteristic)) => {
                read_notifications_task(
                    self.link_cancel.clone(),
                    handle.device.clone(),
                    peripheral,
                    characteristic,
                    self.events.clone(),
                );
            },
            Err(err) => warn!("Can not subscribe to {}: {}", handle.device, err),
        }
    }

    fn write(&mut self, handle: &WriteHandle, payload: &[u8], ack: bool) -> Result<(), DeviceError> {
        let (peripheral, characteristic) = self.endpoint(handle)?;
        let write_type = match ack {
            true => WriteType::WithResponse,
            false => WriteType::WithoutResponse,
        };

        self.queue(LinkOp::Write {
            peripheral,
            characteristic,
            payload: payload.to_vec(),
            write_type,
        })
    }

    fn disconnect(&mut self, device: &DeviceId) {
        // stop notification readers and any connect/discovery still in flight
        self.link_cancel.cancel();
        self.link_cancel = self.cancel.child_token();

        let peripheral = lock_links(&self.links).remove(device);
        let op = LinkOp::Disconnect { device: device.clone(), peripheral };

        if let Err(err) = self.ops.try_send(op) {
            // queue is full; wait for room without holding up the caller
            let op = err.into_inner();
            let mut ops = self.ops.clone();
            spawn(async move {
                if let Err(err) = ops.send(op).await {
                    warn!("Failed to queue disconnect: {}", err);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_spawn_after_waits_for_previous() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release, released) = oneshot::channel::<()>();

        let first = {
            let order = order.clone();
            spawn(async move {
                let _ = released.await;
                order.lock().unwrap().push("first stopped");
            })
        };
        let second = {
            let order = order.clone();
            spawn_after(Some(first), async move {
                order.lock().unwrap().push("second started");
            })
        };

        tokio::task::yield_now().await;
        assert!(order.lock().unwrap().is_empty());

        release.send(()).unwrap();
        second.await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first stopped", "second started"]);
    }

    #[tokio::test]
    async fn test_spawn_after_without_previous() {
        let task = spawn_after(None, async {});
        task.await.unwrap();
    }
}
