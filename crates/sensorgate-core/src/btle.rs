//! [`Transport`] implementation backed by btleplug.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DeviceNotFoundReason, Error, Result};
use crate::transport::{PeripheralHandle, Transport, TransportEvent, TransportEvents};
use crate::util::peripheral_handle;

/// How often the scan loop re-checks discovered peripherals.
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Capacity of the transport event channel.
const EVENT_CAPACITY: usize = 256;

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or(Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter))
}

/// BLE central built on the platform adapter.
pub struct BtleTransport {
    adapter: Adapter,
    peripherals: RwLock<HashMap<PeripheralHandle, Peripheral>>,
    events: broadcast::Sender<TransportEvent>,
    forwarders: Mutex<HashMap<PeripheralHandle, JoinHandle<()>>>,
    central_task: JoinHandle<()>,
}

impl BtleTransport {
    /// Open the first adapter and start listening for link losses.
    pub async fn new() -> Result<Arc<Self>> {
        let adapter = get_adapter().await?;
        Self::with_adapter(adapter).await
    }

    /// Wrap an already opened adapter.
    pub async fn with_adapter(adapter: Adapter) -> Result<Arc<Self>> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let mut central_events = adapter.events().await?;
        let sender = events.clone();

        let central_task = tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    let handle = peripheral_handle(&id);
                    debug!(%handle, "Peripheral disconnected");
                    // Ignore error if no receivers
                    let _ = sender.send(TransportEvent::Disconnected { handle });
                }
            }
        });

        Ok(Arc::new(Self {
            adapter,
            peripherals: RwLock::new(HashMap::new()),
            events,
            forwarders: Mutex::new(HashMap::new()),
            central_task,
        }))
    }

    async fn peripheral(&self, handle: &PeripheralHandle) -> Result<Peripheral> {
        self.peripherals
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| Error::device_not_found(handle.as_str()))
    }

    fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| {
                Error::characteristic_not_found(uuid.to_string(), peripheral.services().len())
            })
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Peripheral>> {
        for peripheral in self.adapter.peripherals().await? {
            let Some(props) = peripheral.properties().await? else {
                continue;
            };
            if props.local_name.as_deref() == Some(name) {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    /// Forward notifications of `peripheral` onto the shared event channel.
    async fn start_forwarder(&self, handle: &PeripheralHandle, peripheral: &Peripheral) -> Result<()> {
        let mut stream = peripheral.notifications().await?;
        let sender = self.events.clone();
        let owner = handle.clone();
        let source = peripheral.clone();

        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                let service = source
                    .characteristics()
                    .into_iter()
                    .find(|c| c.uuid == notification.uuid)
                    .map(|c| c.service_uuid)
                    .unwrap_or_default();
                let _ = sender.send(TransportEvent::CharacteristicUpdate {
                    handle: owner.clone(),
                    service,
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }
        });

        if let Some(previous) = self.forwarders.lock().await.insert(handle.clone(), task) {
            previous.abort();
        }
        Ok(())
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.central_task.abort();
        if let Ok(forwarders) = self.forwarders.try_lock() {
            for task in forwarders.values() {
                task.abort();
            }
        }
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn is_powered(&self) -> bool {
        matches!(self.adapter.adapter_state().await, Ok(CentralState::PoweredOn))
    }

    #[tracing::instrument(level = "info", skip_all, fields(name = %name, timeout = ?timeout))]
    async fn scan(&self, name: &str, timeout: Duration) -> Result<Option<PeripheralHandle>> {
        info!("Scanning for device...");
        self.adapter.start_scan(ScanFilter::default()).await?;

        let deadline = Instant::now() + timeout;
        let found = loop {
            match self.find_by_name(name).await {
                Ok(Some(peripheral)) => break Some(peripheral),
                Ok(None) => {}
                Err(e) => warn!("Failed to inspect peripherals: {}", e),
            }
            if Instant::now() >= deadline {
                break None;
            }
            sleep(SCAN_POLL_INTERVAL).await;
        };

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        let Some(peripheral) = found else {
            info!("Device not found");
            return Ok(None);
        };
        let handle = peripheral_handle(&peripheral.id());
        info!(%handle, "Found device");
        self.peripherals
            .write()
            .await
            .insert(handle.clone(), peripheral);
        Ok(Some(handle))
    }

    #[tracing::instrument(level = "info", skip_all, fields(handle = %handle))]
    async fn connect(&self, handle: &PeripheralHandle, connect_timeout: Duration) -> Result<Vec<Uuid>> {
        let peripheral = self.peripheral(handle).await?;

        timeout(connect_timeout, peripheral.connect())
            .await
            .map_err(|_| Error::timeout("connect to device", connect_timeout))??;

        timeout(connect_timeout, peripheral.discover_services())
            .await
            .map_err(|_| Error::timeout("discover services", connect_timeout))??;

        let services: Vec<Uuid> = peripheral.services().iter().map(|s| s.uuid).collect();
        debug!("Found {} services", services.len());

        self.start_forwarder(handle, &peripheral).await?;
        Ok(services)
    }

    async fn discover_characteristics(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        discovery_timeout: Duration,
    ) -> Result<Vec<Uuid>> {
        let peripheral = self.peripheral(handle).await?;
        if peripheral.services().is_empty() {
            timeout(discovery_timeout, peripheral.discover_services())
                .await
                .map_err(|_| Error::timeout("discover characteristics", discovery_timeout))??;
        }

        Ok(peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.into_iter().map(|c| c.uuid))
            .collect())
    }

    async fn write(
        &self,
        handle: &PeripheralHandle,
        characteristic: Uuid,
        value: &[u8],
        with_response: bool,
        write_timeout: Duration,
    ) -> Result<()> {
        let peripheral = self.peripheral(handle).await?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        timeout(write_timeout, peripheral.write(&target, value, write_type))
            .await
            .map_err(|_| Error::timeout("write characteristic", write_timeout))??;
        Ok(())
    }

    async fn set_notify(
        &self,
        handle: &PeripheralHandle,
        characteristic: Uuid,
        enabled: bool,
        notify_timeout: Duration,
    ) -> Result<()> {
        let peripheral = self.peripheral(handle).await?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        let (operation, result) = if enabled {
            ("subscribe", timeout(notify_timeout, peripheral.subscribe(&target)).await)
        } else {
            ("unsubscribe", timeout(notify_timeout, peripheral.unsubscribe(&target)).await)
        };
        result.map_err(|_| Error::timeout(operation, notify_timeout))??;
        Ok(())
    }

    async fn is_connected(&self, handle: &PeripheralHandle) -> bool {
        match self.peripheral(handle).await {
            Ok(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<()> {
        if let Some(task) = self.forwarders.lock().await.remove(handle) {
            task.abort();
        }
        let peripheral = self.peripheral(handle).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    fn subscribe(&self) -> TransportEvents {
        self.events.subscribe()
    }
}
