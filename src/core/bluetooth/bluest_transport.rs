//! Transport implementation on top of the platform stack via bluest.
//! Every request spawns a task that performs the bluest call and posts the
//! completion to the link mailbox.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Result, anyhow};
use bluest::{Adapter, Characteristic, ConnectionEvent, Device};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::constants::GATT_FAILURE;
use crate::core::bluetooth::transport::{
    EventSender, ScanFilter, ScanSettings, Transport, TransportEvent,
};
use crate::core::bluetooth::types::{
    Advertisement, ConnectionState, DeviceAddress, DiscoveredService, GattStatus, LinkHandle,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct LinkEntry {
    device: Device,
    characteristics: HashMap<Uuid, Characteristic>,
    /// Connects and then watches the link; aborted on close
    watcher: JoinHandle<()>,
}

pub struct BluestTransport {
    adapter: Adapter,
    events: EventSender,
    /// Devices seen while scanning, keyed by hardware address
    devices: Arc<Mutex<HashMap<DeviceAddress, Device>>>,
    links: Arc<Mutex<HashMap<LinkHandle, LinkEntry>>>,
    next_handle: AtomicU64,
    scan_cancel: Mutex<Option<CancellationToken>>,
}

impl BluestTransport {
    pub async fn new(events: EventSender) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");

        Ok(Self {
            adapter,
            events,
            devices: Arc::new(Mutex::new(HashMap::new())),
            links: Arc::new(Mutex::new(HashMap::new())),
            next_handle: AtomicU64::new(0),
            scan_cancel: Mutex::new(None),
        })
    }

    fn device_for(&self, handle: LinkHandle) -> Result<Device> {
        lock(&self.links)
            .get(&handle)
            .map(|entry| entry.device.clone())
            .ok_or_else(|| anyhow!("Unknown {}", handle))
    }

    /// Caches `device` when it is the one the filter asks for
    fn remember(
        devices: &Mutex<HashMap<DeviceAddress, Device>>,
        filter: &ScanFilter,
        device: Device,
        rssi: Option<i16>,
    ) -> Option<Advertisement> {
        let id = device.id().to_string();
        let Some(address) = DeviceAddress::extract(&id) else {
            debug!("Device {} carries no hardware address, skipping", id);
            return None;
        };
        let advertisement = Advertisement {
            address: address.clone(),
            name: device.name().ok(),
            rssi,
        };
        if !filter.matches(&advertisement) {
            return None;
        }
        lock(devices).insert(address, device);
        Some(advertisement)
    }

    async fn internal_scan_task(
        adapter: Adapter,
        devices: Arc<Mutex<HashMap<DeviceAddress, Device>>>,
        filter: ScanFilter,
        tx: mpsc::UnboundedSender<Advertisement>,
        cancel_token: CancellationToken,
    ) -> Result<()> {
        info!("Checking for connected devices");
        for device in adapter.connected_devices().await? {
            if let Some(advertisement) = Self::remember(&devices, &filter, device, None) {
                info!("{} is already connected to this host", advertisement.address);
                let _ = tx.send(advertisement);
            }
        }

        info!("Starting bluetooth scan");
        let mut scan_stream = adapter.scan(&[]).await?;
        loop {
            tokio::select! {
                result = scan_stream.next() => match result {
                    Some(discovered) => {
                        if let Some(advertisement) =
                            Self::remember(&devices, &filter, discovered.device, discovered.rssi)
                        {
                            if tx.send(advertisement).is_err() {
                                break;
                            }
                        }
                    }
                    None => {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    }
                },
                _ = cancel_token.cancelled() => break,
            }
        }
        Ok(())
    }

    fn report(events: &EventSender, handle: LinkHandle, status: GattStatus, state: ConnectionState) {
        let _ = events.send(TransportEvent::ConnectionStateChanged {
            handle,
            status,
            state,
        });
    }

    /// Connects, then reports the link up and keeps watching it until it drops
    async fn run_link(adapter: Adapter, device: Device, handle: LinkHandle, events: EventSender) {
        info!("Initiating connection to {} as {}...", device.id(), handle);
        if !device.is_connected().await {
            if let Err(e) = adapter.connect_device(&device).await {
                warn!("Connection attempt for {} failed: {}", handle, e);
                Self::report(
                    &events,
                    handle,
                    GattStatus::Failure(GATT_FAILURE),
                    ConnectionState::Disconnected,
                );
                return;
            }
        }

        // Subscribe before announcing the link so no drop goes unseen
        let connection_events = adapter.device_connection_events(&device).await;
        if !device.is_connected().await {
            info!("{} dropped while connecting", handle);
            Self::report(&events, handle, GattStatus::Success, ConnectionState::Disconnected);
            return;
        }
        Self::report(&events, handle, GattStatus::Success, ConnectionState::Connected);

        let mut connection_events = match connection_events {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot watch connection state of {}: {}", handle, e);
                return;
            }
        };
        while let Some(event) = connection_events.next().await {
            if matches!(event, ConnectionEvent::Disconnected) {
                info!("{} dropped", handle);
                Self::report(&events, handle, GattStatus::Success, ConnectionState::Disconnected);
                break;
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for BluestTransport {
    async fn scan(
        &self,
        filter: &ScanFilter,
        settings: &ScanSettings,
    ) -> Result<BoxStream<'static, Advertisement>> {
        debug!("Scan settings {:?}; bluest scans with platform defaults", settings);
        let cancel_token = CancellationToken::new();
        if let Some(previous) = lock(&self.scan_cancel).replace(cancel_token.clone()) {
            previous.cancel();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let filter = filter.clone();
        tokio::spawn(async move {
            if let Err(e) = Self::internal_scan_task(adapter, devices, filter, tx, cancel_token).await {
                error!("Bluetooth scan failed: {}", e);
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|advertisement| (advertisement, rx))
        })
        .boxed())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(cancel_token) = lock(&self.scan_cancel).take() {
            info!("Stopping Bluetooth scan.");
            cancel_token.cancel();
        }
        Ok(())
    }

    async fn connect(&self, address: &DeviceAddress, auto_reconnect: bool) -> Result<LinkHandle> {
        let device = lock(&self.devices)
            .get(address)
            .cloned()
            .ok_or_else(|| anyhow!("Device not found with address: {}", address))?;
        let handle = LinkHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        if auto_reconnect {
            debug!("Auto-reconnect requested for {}; drops are reported as disconnects", handle);
        }

        let watcher = tokio::spawn(Self::run_link(
            self.adapter.clone(),
            device.clone(),
            handle,
            self.events.clone(),
        ));
        lock(&self.links).insert(
            handle,
            LinkEntry {
                device,
                characteristics: HashMap::new(),
                watcher,
            },
        );
        Ok(handle)
    }

    async fn discover_services(&self, handle: LinkHandle) -> Result<()> {
        let device = self.device_for(handle)?;
        let events = self.events.clone();
        let links = self.links.clone();
        tokio::spawn(async move {
            let result: Result<(Vec<DiscoveredService>, HashMap<Uuid, Characteristic>)> = async {
                let mut discovered = Vec::new();
                let mut characteristics = HashMap::new();
                for service in device.services().await? {
                    let mut uuids = Vec::new();
                    for characteristic in service.characteristics().await? {
                        uuids.push(characteristic.uuid());
                        characteristics.insert(characteristic.uuid(), characteristic);
                    }
                    discovered.push(DiscoveredService {
                        uuid: service.uuid(),
                        characteristics: uuids,
                    });
                }
                Ok((discovered, characteristics))
            }
            .await;

            let event = match result {
                Ok((services, characteristics)) => {
                    if let Some(entry) = lock(&links).get_mut(&handle) {
                        entry.characteristics = characteristics;
                    }
                    TransportEvent::ServicesDiscovered {
                        handle,
                        status: GattStatus::Success,
                        services,
                    }
                }
                Err(e) => {
                    error!("Service discovery on {} failed: {}", handle, e);
                    TransportEvent::ServicesDiscovered {
                        handle,
                        status: GattStatus::InternalError,
                        services: Vec::new(),
                    }
                }
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    async fn read_characteristic(&self, handle: LinkHandle, characteristic: Uuid) -> Result<()> {
        let target = lock(&self.links)
            .get(&handle)
            .ok_or_else(|| anyhow!("Unknown {}", handle))?
            .characteristics
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| anyhow!("Characteristic {} not discovered on {}", characteristic, handle))?;

        let events = self.events.clone();
        tokio::spawn(async move {
            let (status, value) = match target.read().await {
                Ok(value) => (GattStatus::Success, value),
                Err(e) => {
                    debug!("Read of {} failed: {}", characteristic, e);
                    (GattStatus::Failure(GATT_FAILURE), Vec::new())
                }
            };
            let _ = events.send(TransportEvent::CharacteristicRead {
                handle,
                characteristic,
                status,
                value,
            });
        });
        Ok(())
    }

    async fn disconnect(&self, handle: LinkHandle) -> Result<()> {
        let device = self.device_for(handle)?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            info!("Disconnecting from device {}", device.id());
            let status = match adapter.disconnect_device(&device).await {
                Ok(()) => GattStatus::Success,
                Err(e) => {
                    warn!("Disconnect of {} failed: {}", handle, e);
                    GattStatus::Failure(GATT_FAILURE)
                }
            };
            let _ = events.send(TransportEvent::ConnectionStateChanged {
                handle,
                status,
                state: ConnectionState::Disconnected,
            });
        });
        Ok(())
    }

    async fn close(&self, handle: LinkHandle) -> Result<()> {
        match lock(&self.links).remove(&handle) {
            Some(entry) => {
                entry.watcher.abort();
                info!("Closed {}, releasing device and characteristic objects.", handle);
            }
            None => debug!("{} already closed", handle),
        }
        Ok(())
    }
}
