//! Gateway runtime.
//!
//! A [`Gateway`] owns one [`DeviceConnection`] per configured device, the
//! upgrade orchestrator when a cloud is configured, and the event dispatcher
//! both report to.

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sensorgate_core::{
    AlwaysForeground, CloudApi, CommandDisposition, DeviceConnection, DeviceContext,
    EventDispatcher, TransferReport, Transport, UpgradeContext, UpgradeJob, UpgradeManager,
    UpgradeManagerConfig,
};
use sensorgate_store::SharedStore;
use sensorgate_types::{FirmwareVersion, UpgradeState};

use crate::config::Config;

/// Gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error(transparent)]
    Core(#[from] sensorgate_core::Error),
    #[error("Storage error: {0}")]
    Store(#[from] sensorgate_store::Error),
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Upgrades are disabled, no cloud URL configured")]
    UpgradesDisabled,
    #[error("Failed to read firmware image {path}: {source}")]
    ReadImage {
        path: String,
        source: std::io::Error,
    },
    #[error("Firmware transfer failed: {0}")]
    Transfer(#[from] sensorgate_core::UpgradeError),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Running gateway.
pub struct Gateway {
    config: Config,
    store: Arc<SharedStore>,
    events: Arc<EventDispatcher>,
    devices: Vec<Arc<DeviceConnection>>,
    upgrades: Option<Arc<UpgradeManager>>,
}

impl Gateway {
    /// Build the gateway from a validated configuration.
    ///
    /// Devices are recorded in the store. Without a cloud the gateway only
    /// monitors and upgrade commands are refused.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        store: Arc<SharedStore>,
        cloud: Option<Arc<dyn CloudApi>>,
    ) -> Result<Self> {
        Self::with_manager_config(config, transport, store, cloud, UpgradeManagerConfig::default())
    }

    /// Like [`Gateway::new`] with explicit orchestrator delays.
    pub fn with_manager_config(
        config: Config,
        transport: Arc<dyn Transport>,
        store: Arc<SharedStore>,
        cloud: Option<Arc<dyn CloudApi>>,
        manager_config: UpgradeManagerConfig,
    ) -> Result<Self> {
        let events = Arc::new(EventDispatcher::default());
        let app = Arc::new(AlwaysForeground);
        let connection_config = config.gateway.connection_config();

        let upgrades = cloud.map(|cloud| {
            UpgradeManager::new(
                UpgradeContext {
                    transport: transport.clone(),
                    store: store.clone(),
                    cloud,
                    app: app.clone(),
                    delegate: events.clone(),
                },
                manager_config,
            )
        });

        let mut devices = Vec::with_capacity(config.devices.len());
        for device_config in &config.devices {
            let Some(descriptor) = device_config.descriptor() else {
                warn!(device = %device_config.id, "Skipping device of unknown family");
                continue;
            };
            store.lock().upsert_device(
                &descriptor.id,
                &descriptor.name,
                descriptor.family,
                descriptor.model.as_deref(),
            )?;

            let ctx = DeviceContext::new(transport.clone())
                .with_delegate(events.clone())
                .with_app_state(app.clone());
            let device = DeviceConnection::new(descriptor, ctx, connection_config.clone());
            if let Some(manager) = &upgrades {
                manager.register_device(device.clone());
            }
            devices.push(device);
        }

        Ok(Self {
            config,
            store,
            events,
            devices,
            upgrades,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Event dispatcher fed by every device and the orchestrator.
    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub fn store(&self) -> &Arc<SharedStore> {
        &self.store
    }

    pub fn devices(&self) -> &[Arc<DeviceConnection>] {
        &self.devices
    }

    pub fn device(&self, device_id: &str) -> Result<&Arc<DeviceConnection>> {
        self.devices
            .iter()
            .find(|d| d.id() == device_id)
            .ok_or_else(|| GatewayError::UnknownDevice(device_id.to_string()))
    }

    pub fn upgrades(&self) -> Option<&Arc<UpgradeManager>> {
        self.upgrades.as_ref()
    }

    fn manager(&self) -> Result<&Arc<UpgradeManager>> {
        self.upgrades.as_ref().ok_or(GatewayError::UpgradesDisabled)
    }

    /// Apply sensor preferences and bring every device up.
    ///
    /// Devices that fail to come up are logged and left to the reconnect
    /// policy; returns the number of devices that reached monitoring.
    #[tracing::instrument(level = "info", skip_all, fields(devices = self.devices.len()))]
    pub async fn connect_all(&self) -> usize {
        let mut monitoring = 0;
        for device in &self.devices {
            if let Some(device_config) = self.config.device(device.id()) {
                for kind in &device_config.disabled_sensors {
                    if let Err(e) = device.set_sensor_enabled(*kind, false).await {
                        warn!(device = %device.id(), sensor = %kind, "Failed to disable sensor: {}", e);
                    }
                }
            }

            match device.enable().await {
                Ok(()) => monitoring += 1,
                Err(e) => warn!(device = %device.id(), "Failed to enable device: {}", e),
            }
        }
        info!("{} of {} device(s) monitoring", monitoring, self.devices.len());
        monitoring
    }

    /// Reconcile upgrade records left by a previous run.
    ///
    /// Interrupted transfers are resumed in the background or abandoned,
    /// depending on `gateway.resume_interrupted`. Returns the affected
    /// device ids.
    pub async fn recover_upgrades(&self) -> Result<Vec<String>> {
        let Some(manager) = &self.upgrades else {
            return Ok(Vec::new());
        };
        let interrupted = manager.recover().await?;

        for device_id in &interrupted {
            if self.config.gateway.resume_interrupted {
                info!(device = %device_id, "Resuming interrupted upgrade");
                let manager = manager.clone();
                let device_id = device_id.clone();
                tokio::spawn(async move {
                    if let Err(e) = manager.resume_upgrade(&device_id).await {
                        warn!(device = %device_id, "Resume failed: {}", e);
                    }
                });
            } else {
                info!(device = %device_id, "Abandoning interrupted upgrade");
                manager.abandon_upgrade(device_id).await?;
            }
        }
        Ok(interrupted)
    }

    /// Bring devices up, then reconcile upgrades.
    pub async fn start(&self) -> Result<()> {
        self.connect_all().await;
        self.recover_upgrades().await?;
        Ok(())
    }

    /// Hand an upgrade command to the orchestrator.
    pub async fn submit(&self, job: UpgradeJob) -> Result<CommandDisposition> {
        let manager = self.manager()?;
        self.device(&job.device_id)?;
        Ok(manager.handle_upgrade_command(job).await?)
    }

    /// Cancel the running upgrade of a device.
    pub async fn cancel(&self, device_id: &str) -> Result<bool> {
        self.device(device_id)?;
        Ok(self.manager()?.cancel_upgrade(device_id).await?)
    }

    /// Current upgrade record of a device.
    pub fn upgrade_state(&self, device_id: &str) -> Result<UpgradeState> {
        self.device(device_id)?;
        Ok(self.manager()?.state(device_id)?)
    }

    /// Forward a cloud reachability change; returns how many queued reports
    /// were delivered.
    pub async fn on_reachability_changed(&self, reachable: bool) -> Result<usize> {
        match &self.upgrades {
            Some(manager) => Ok(manager.on_reachability_changed(reachable).await?),
            None => Ok(0),
        }
    }

    /// Ask a device for its firmware version and remember it.
    pub async fn query_version(&self, device_id: &str) -> Result<FirmwareVersion> {
        let device = self.device(device_id)?;
        let version = device.query_firmware_version().await?;
        if !self.store.lock().set_firmware(device_id, &version.to_string())? {
            debug!(device = %device_id, "Version reported by a device missing from the store");
        }
        Ok(version)
    }

    /// Flash a local image without going through the cloud.
    #[tracing::instrument(level = "info", skip_all, fields(device = %device_id))]
    pub async fn flash(
        &self,
        device_id: &str,
        image: &Path,
        cancel: &CancellationToken,
    ) -> Result<TransferReport> {
        let device = self.device(device_id)?;
        let data = tokio::fs::read(image)
            .await
            .map_err(|e| GatewayError::ReadImage {
                path: image.display().to_string(),
                source: e,
            })?;
        info!(bytes = data.len(), "Flashing {}", image.display());

        if !device.is_connected().await {
            device.enable().await?;
        }

        let owner = device_id.to_string();
        let progress = move |fraction: f32| {
            debug!(device = %owner, "Transfer {:.0}%", fraction * 100.0);
        };
        let report = device.upgrade_firmware(&data, progress, cancel).await?;
        info!(
            bytes = report.bytes_sent,
            implicit = report.implicit,
            "Firmware flashed"
        );
        Ok(report)
    }

    /// Disconnect every device.
    pub async fn shutdown(&self) {
        for device in &self.devices {
            if let Err(e) = device.disconnect().await {
                debug!(device = %device.id(), "Disconnect failed: {}", e);
            }
            device.shutdown();
        }
        info!("Gateway stopped");
    }
}
