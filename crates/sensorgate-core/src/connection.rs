//! Device connection state machine.
//!
//! A [`DeviceConnection`] owns the lifecycle of one peripheral: it scans for
//! it by name, connects, discovers characteristics, switches the sensors on,
//! and decodes the notifications they produce. When the link drops while the
//! device is enabled it schedules a fresh [`DeviceConnection::enable`].
//!
//! All state lives behind one async mutex, so transitions of a given device
//! are serialized. Transport events for the device are consumed by a single
//! pump task in arrival order.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sensorgate_types::codec;
use sensorgate_types::types::DEFAULT_PERIOD;
use sensorgate_types::{DeviceFamily, FirmwareVersion, Reading, SensorKind, SensorSpec};

use crate::error::{Error, Result, UpgradeError};
use crate::reconnect::ReconnectOptions;
use crate::traits::{AlwaysForeground, AppState, DeviceDelegate, NoopDelegate};
use crate::transport::{PeripheralHandle, Transport, TransportEvent};
use crate::upgrade::{TransferReport, UpgradeConfig, UpgradeEngine};

/// Command that asks a SensorNode for its firmware version.
pub const VERSION_COMMAND: &[u8] = b"versionFw\r\n";

/// Connection lifecycle of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Scanning for the peripheral.
    Detecting,
    /// The scan finished without a match.
    NotFound,
    /// Connecting and discovering services.
    Connecting,
    /// Services discovered; sensors not yet running.
    Connected,
    /// Sensors are enabled and producing readings.
    Monitoring,
    /// Sensors were switched off by the user; the link is kept.
    Stopped,
    /// Bring-up failed.
    Error,
}

impl ConnectionState {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Detecting => "detecting",
            ConnectionState::NotFound => "not_found",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Monitoring => "monitoring",
            ConnectionState::Stopped => "stopped",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timeouts and tuning for a device connection.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sensorgate_core::ConnectionConfig;
///
/// let config = ConnectionConfig::default()
///     .scan_timeout(Duration::from_secs(15))
///     .sampling_period(50);
/// assert_eq!(config.connect_timeout, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long to scan for the peripheral.
    pub scan_timeout: Duration,
    /// Timeout for connecting and discovering services.
    pub connect_timeout: Duration,
    /// Timeout for characteristic discovery, per service.
    pub discovery_timeout: Duration,
    /// Timeout for configuration writes.
    pub write_timeout: Duration,
    /// How long to wait for the `versionFw` reply.
    pub version_timeout: Duration,
    /// Sampling period byte written to every sensor (units of 10 ms).
    pub sampling_period: u8,
    /// What to do after a link loss.
    pub reconnect: ReconnectOptions,
    /// Firmware transfer tuning.
    pub upgrade: UpgradeConfig,
}

/// Default scan timeout.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(7);
/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default per-service discovery timeout.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            write_timeout: Duration::from_secs(5),
            version_timeout: Duration::from_secs(5),
            sampling_period: DEFAULT_PERIOD,
            reconnect: ReconnectOptions::default(),
            upgrade: UpgradeConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Create a new connection config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    #[must_use]
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    #[must_use]
    pub fn sampling_period(mut self, period: u8) -> Self {
        self.sampling_period = period;
        self
    }

    #[must_use]
    pub fn reconnect(mut self, options: ReconnectOptions) -> Self {
        self.reconnect = options;
        self
    }

    #[must_use]
    pub fn upgrade(mut self, config: UpgradeConfig) -> Self {
        self.upgrade = config;
        self
    }
}

/// Static identity of a registered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Stable id used by the cloud and the upgrade store.
    pub id: String,
    /// Advertised name used for scanning.
    pub name: String,
    pub family: DeviceFamily,
    /// Hardware model, if known.
    pub model: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>, family: DeviceFamily) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            family,
            model: None,
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Collaborators a device connection needs.
#[derive(Clone)]
pub struct DeviceContext {
    pub transport: Arc<dyn Transport>,
    pub delegate: Arc<dyn DeviceDelegate>,
    pub app: Arc<dyn AppState>,
}

impl DeviceContext {
    /// Context with a silent delegate and an always-foreground host.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            delegate: Arc::new(NoopDelegate),
            app: Arc::new(AlwaysForeground),
        }
    }

    #[must_use]
    pub fn with_delegate(mut self, delegate: Arc<dyn DeviceDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    #[must_use]
    pub fn with_app_state(mut self, app: Arc<dyn AppState>) -> Self {
        self.app = app;
        self
    }
}

/// A sensor instantiated on a connected device.
#[derive(Debug, Clone)]
pub struct Sensor {
    pub spec: &'static SensorSpec,
    /// Whether notifications and the sensor itself are switched on.
    pub enabled: bool,
    pub last_reading: Option<Reading>,
}

impl Sensor {
    pub fn kind(&self) -> SensorKind {
        self.spec.kind
    }
}

struct Inner {
    state: ConnectionState,
    handle: Option<PeripheralHandle>,
    /// Keyed by the family's dispatch key.
    sensors: HashMap<Uuid, Sensor>,
    enabled: bool,
    /// User preference per sensor; missing means on.
    properties: HashMap<SensorKind, bool>,
    pump: Option<CancellationToken>,
}

impl Inner {
    fn wants(&self, kind: SensorKind) -> bool {
        self.properties.get(&kind).copied().unwrap_or(true)
    }
}

/// Connection to one BLE sensor peripheral.
pub struct DeviceConnection {
    descriptor: DeviceDescriptor,
    ctx: DeviceContext,
    config: ConnectionConfig,
    inner: Mutex<Inner>,
    /// Listener for values on the debug characteristic.
    responses: std::sync::Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    debug_busy: AtomicBool,
    reconnect_attempts: AtomicU32,
    shutdown: CancellationToken,
    this: Weak<DeviceConnection>,
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Releases the debug channel when dropped.
struct DebugChannel<'a> {
    conn: &'a DeviceConnection,
}

impl Drop for DebugChannel<'_> {
    fn drop(&mut self) {
        self.conn.set_listener(None);
        self.conn.debug_busy.store(false, Ordering::SeqCst);
    }
}

impl DeviceConnection {
    /// Create a connection in the `Disconnected` state.
    pub fn new(
        descriptor: DeviceDescriptor,
        ctx: DeviceContext,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            descriptor,
            ctx,
            config,
            inner: Mutex::new(Inner {
                state: ConnectionState::Disconnected,
                handle: None,
                sensors: HashMap::new(),
                enabled: false,
                properties: HashMap::new(),
                pump: None,
            }),
            responses: std::sync::Mutex::new(None),
            debug_busy: AtomicBool::new(false),
            reconnect_attempts: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
            this: this.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn family(&self) -> DeviceFamily {
        self.descriptor.family
    }

    pub fn model(&self) -> Option<&str> {
        self.descriptor.model.as_deref()
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.lock().await.enabled
    }

    pub async fn handle(&self) -> Option<PeripheralHandle> {
        self.inner.lock().await.handle.clone()
    }

    /// Number of instantiated sensors.
    pub async fn sensor_count(&self) -> usize {
        self.inner.lock().await.sensors.len()
    }

    /// Snapshot of the instantiated sensors.
    pub async fn sensors(&self) -> Vec<Sensor> {
        self.inner.lock().await.sensors.values().cloned().collect()
    }

    /// Whether a transport handle is held and its link is up.
    pub async fn is_connected(&self) -> bool {
        match self.handle().await {
            Some(handle) => self.ctx.transport.is_connected(&handle).await,
            None => false,
        }
    }

    /// Like [`is_connected`](Self::is_connected) but never waits on a
    /// connect in progress; a device still connecting counts as not connected.
    pub async fn is_connected_now(&self) -> bool {
        let handle = match self.inner.try_lock() {
            Ok(inner) => inner.handle.clone(),
            Err(_) => return false,
        };
        match handle {
            Some(handle) => self.ctx.transport.is_connected(&handle).await,
            None => false,
        }
    }

    /// Whether a firmware transfer or version query is running.
    pub fn is_upgrading(&self) -> bool {
        self.debug_busy.load(Ordering::SeqCst)
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state == state {
            return;
        }
        debug!(device = %self.descriptor.name, from = %inner.state, to = %state, "State change");
        inner.state = state;
        self.ctx.delegate.state_changed(&self.descriptor.id, state);
    }

    /// Bring the device up to `Monitoring`.
    ///
    /// Scans when no transport handle is held. A scan without a match leaves
    /// the device `NotFound` and disabled; a peripheral without services
    /// leaves it in `Error`, disabled, with the handle released.
    #[tracing::instrument(level = "info", skip_all, fields(device = %self.descriptor.name))]
    pub async fn enable(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enabled = true;
        if inner.state == ConnectionState::Monitoring {
            return Ok(());
        }

        let result = self.bring_up(&mut inner).await;
        match &result {
            Ok(()) => {
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                info!("Monitoring {} sensors", inner.sensors.len());
            }
            Err(e) => {
                warn!("Enable failed: {}", e);
                self.ctx.delegate.error(&self.descriptor.id, &e.to_string());
            }
        }
        result
    }

    async fn bring_up(&self, inner: &mut Inner) -> Result<()> {
        let transport = &self.ctx.transport;

        let handle = match inner.handle.clone() {
            Some(handle) => handle,
            None => {
                self.set_state(inner, ConnectionState::Detecting);
                match transport
                    .scan(&self.descriptor.name, self.config.scan_timeout)
                    .await
                {
                    Ok(Some(handle)) => {
                        inner.handle = Some(handle.clone());
                        handle
                    }
                    Ok(None) => {
                        inner.enabled = false;
                        self.set_state(inner, ConnectionState::NotFound);
                        return Err(Error::device_not_found(&self.descriptor.name));
                    }
                    Err(e) => {
                        inner.enabled = false;
                        self.set_state(inner, ConnectionState::Error);
                        return Err(e);
                    }
                }
            }
        };

        self.set_state(inner, ConnectionState::Connecting);
        self.start_pump(inner, &handle);

        let services = match transport.connect(&handle, self.config.connect_timeout).await {
            Ok(services) if !services.is_empty() => services,
            Ok(_) => {
                self.release(inner);
                inner.enabled = false;
                self.set_state(inner, ConnectionState::Error);
                return Err(Error::NoServices);
            }
            Err(e) => {
                self.release(inner);
                self.set_state(inner, ConnectionState::Error);
                return Err(e);
            }
        };
        self.set_state(inner, ConnectionState::Connected);
        debug!("Found {} services", services.len());

        let family = self.descriptor.family;
        let debug_char = family.debug_characteristic();
        let mut has_debug = false;
        let mut sensors = HashMap::new();

        for service in &services {
            if !transport.is_connected(&handle).await {
                self.release(inner);
                self.set_state(inner, ConnectionState::Error);
                return Err(Error::NotConnected);
            }
            let characteristics = match transport
                .discover_characteristics(&handle, *service, self.config.discovery_timeout)
                .await
            {
                Ok(chars) => chars,
                Err(e) => {
                    self.release(inner);
                    self.set_state(inner, ConnectionState::Error);
                    return Err(e);
                }
            };
            for characteristic in characteristics {
                if Some(characteristic) == debug_char {
                    has_debug = true;
                }
                if let Some(spec) = family.match_sensor(*service, characteristic) {
                    sensors
                        .entry(family.dispatch_key(spec.service, spec.data))
                        .or_insert(Sensor {
                            spec,
                            enabled: false,
                            last_reading: None,
                        });
                }
            }
        }

        for sensor in sensors.values_mut() {
            if !inner.wants(sensor.kind()) {
                debug!(sensor = %sensor.kind(), "Sensor switched off, leaving it disabled");
                continue;
            }
            if let Err(e) = self.switch_sensor(&handle, sensor.spec, true).await {
                self.release(inner);
                self.set_state(inner, ConnectionState::Error);
                return Err(e);
            }
            sensor.enabled = true;
        }
        inner.sensors = sensors;

        if let (true, Some(debug_char)) = (has_debug, debug_char) {
            if let Err(e) = transport
                .set_notify(&handle, debug_char, true, self.config.write_timeout)
                .await
            {
                warn!("Failed to subscribe to debug channel: {}", e);
            }
        }

        self.set_state(inner, ConnectionState::Monitoring);
        Ok(())
    }

    /// Switch every sensor off and stop. The transport handle is kept.
    #[tracing::instrument(level = "info", skip_all, fields(device = %self.descriptor.name))]
    pub async fn disable(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enabled = false;
        if let Some(handle) = inner.handle.clone() {
            for sensor in inner.sensors.values().filter(|s| s.enabled) {
                if let Err(e) = self.switch_sensor(&handle, sensor.spec, false).await {
                    warn!(sensor = %sensor.kind(), "Failed to disable sensor: {}", e);
                }
            }
        }
        inner.sensors.clear();
        self.set_state(&mut inner, ConnectionState::Stopped);
        Ok(())
    }

    /// Disable the device and drop the link.
    #[tracing::instrument(level = "info", skip_all, fields(device = %self.descriptor.name))]
    pub async fn disconnect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enabled = false;
        let handle = inner.handle.clone();
        if let Some(handle) = &handle {
            for sensor in inner.sensors.values().filter(|s| s.enabled) {
                if let Err(e) = self.switch_sensor(handle, sensor.spec, false).await {
                    debug!(sensor = %sensor.kind(), "Failed to disable sensor: {}", e);
                }
            }
        }
        self.release(&mut inner);
        self.set_state(&mut inner, ConnectionState::Disconnected);
        drop(inner);

        if let Some(handle) = handle {
            self.ctx.transport.disconnect(&handle).await?;
        }
        Ok(())
    }

    /// Stop the event pump and any pending reconnect for good.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Record a sensor preference and apply it to the live sensor while the
    /// device is enabled.
    ///
    /// Returns `true` if the change was applied to a running sensor.
    pub async fn set_sensor_enabled(&self, kind: SensorKind, on: bool) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.properties.insert(kind, on);
        if !inner.enabled {
            return Ok(false);
        }
        let Some(handle) = inner.handle.clone() else {
            return Ok(false);
        };
        let Some(sensor) = inner.sensors.values_mut().find(|s| s.kind() == kind) else {
            return Ok(false);
        };
        if sensor.enabled == on {
            return Ok(true);
        }
        self.switch_sensor(&handle, sensor.spec, on).await?;
        sensor.enabled = on;
        info!(device = %self.descriptor.name, sensor = %kind, on, "Sensor toggled");
        Ok(true)
    }

    async fn switch_sensor(
        &self,
        handle: &PeripheralHandle,
        spec: &SensorSpec,
        on: bool,
    ) -> Result<()> {
        let transport = &self.ctx.transport;
        let write_timeout = self.config.write_timeout;
        if on {
            transport
                .set_notify(handle, spec.data, true, write_timeout)
                .await?;
            transport
                .write(handle, spec.config, spec.enable, true, write_timeout)
                .await?;
            transport
                .write(handle, spec.period, &[self.config.sampling_period], true, write_timeout)
                .await?;
        } else {
            transport
                .write(handle, spec.config, spec.disable, true, write_timeout)
                .await?;
            transport
                .set_notify(handle, spec.data, false, write_timeout)
                .await?;
        }
        Ok(())
    }

    /// Forget the handle and sensors and stop the event pump.
    fn release(&self, inner: &mut Inner) {
        if let Some(pump) = inner.pump.take() {
            pump.cancel();
        }
        inner.handle = None;
        inner.sensors.clear();
    }

    fn start_pump(&self, inner: &mut Inner, handle: &PeripheralHandle) {
        if let Some(previous) = inner.pump.take() {
            previous.cancel();
        }
        let Some(conn) = self.this.upgrade() else {
            return;
        };
        let token = self.shutdown.child_token();
        inner.pump = Some(token.clone());

        let mut events = self.ctx.transport.subscribe();
        let handle = handle.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) if event.handle() == &handle => {
                        let link_lost = matches!(event, TransportEvent::Disconnected { .. });
                        conn.handle_event(event).await;
                        if link_lost {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!(device = %conn.descriptor.name, "Dropped {} transport events", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::CharacteristicUpdate {
                handle,
                service,
                characteristic,
                value,
            } => {
                if Some(characteristic) == self.descriptor.family.debug_characteristic() {
                    self.route_debug(value);
                } else {
                    self.dispatch(&handle, service, characteristic, &value).await;
                }
            }
            TransportEvent::Disconnected { handle } => self.on_link_lost(&handle).await,
        }
    }

    fn route_debug(&self, value: Vec<u8>) {
        let slot = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_ref() {
            Some(listener) => {
                let _ = listener.send(value);
            }
            None => debug!(len = value.len(), "Debug channel value without listener"),
        }
    }

    async fn dispatch(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) {
        let mut inner = self.inner.lock().await;
        if inner.handle.as_ref() != Some(handle) {
            return;
        }
        let key = self.descriptor.family.dispatch_key(service, characteristic);
        let Some(sensor) = inner.sensors.get_mut(&key) else {
            debug!(%service, %characteristic, "Dropping update for unknown sensor");
            return;
        };
        if !sensor.enabled {
            return;
        }
        let kind = sensor.kind();
        match codec::decode(kind, value) {
            Ok(reading) => {
                sensor.last_reading = Some(reading);
                drop(inner);
                debug!(sensor = %kind, "{}", reading);
                self.ctx.delegate.reading(&self.descriptor.id, kind, &reading);
            }
            Err(e) => {
                drop(inner);
                warn!(sensor = %kind, "Failed to decode reading: {}", e);
                self.ctx.delegate.error(&self.descriptor.id, &e.to_string());
            }
        }
    }

    async fn on_link_lost(&self, handle: &PeripheralHandle) {
        let mut inner = self.inner.lock().await;
        if inner.handle.as_ref() != Some(handle) {
            return;
        }
        info!(device = %self.descriptor.name, "Link lost");
        self.release(&mut inner);
        self.set_state(&mut inner, ConnectionState::Disconnected);
        if inner.enabled {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.config.reconnect.allows(attempt) {
            warn!(device = %self.descriptor.name, attempt, "Giving up reconnecting");
            return;
        }
        let this = self.this.clone();
        let delay = self.config.reconnect.delay;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = sleep(delay) => {}
            }
            let Some(conn) = this.upgrade() else {
                return;
            };
            if conn.is_enabled().await {
                info!(device = %conn.descriptor.name, attempt, "Reconnecting");
                // enable() already reports failures to the delegate
                let _ = conn.enable().await;
            }
        });
    }

    fn set_listener(&self, listener: Option<mpsc::UnboundedSender<Vec<u8>>>) {
        *self.responses.lock().unwrap_or_else(|e| e.into_inner()) = listener;
    }

    fn open_debug_channel(
        &self,
    ) -> std::result::Result<(DebugChannel<'_>, mpsc::UnboundedReceiver<Vec<u8>>), UpgradeError> {
        if self.debug_busy.swap(true, Ordering::SeqCst) {
            return Err(UpgradeError::AlreadyInProgress);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.set_listener(Some(tx));
        Ok((DebugChannel { conn: self }, rx))
    }

    /// Ask the device for its firmware version over the debug channel.
    #[tracing::instrument(level = "info", skip_all, fields(device = %self.descriptor.name))]
    pub async fn query_firmware_version(&self) -> Result<FirmwareVersion> {
        let debug_char = self
            .descriptor
            .family
            .debug_characteristic()
            .ok_or_else(|| Error::characteristic_not_found("debug channel", 0))?;
        let handle = self.handle().await.ok_or(Error::NotConnected)?;
        let (_channel, mut rx) = self.open_debug_channel()?;

        self.ctx
            .transport
            .write(&handle, debug_char, VERSION_COMMAND, true, self.config.write_timeout)
            .await?;

        let collect = async {
            let mut line = String::new();
            while let Some(chunk) = rx.recv().await {
                line.push_str(&String::from_utf8_lossy(&chunk));
                if line.contains("\r\n") {
                    return Some(line);
                }
            }
            None
        };
        let line = timeout(self.config.version_timeout, collect)
            .await
            .map_err(|_| Error::timeout("query firmware version", self.config.version_timeout))?
            .ok_or(Error::NotConnected)?;

        let version = FirmwareVersion::parse(&line)?;
        info!(%version, "Firmware version");
        Ok(version)
    }

    /// Transfer a firmware image to the device.
    ///
    /// Only one transfer (or version query) runs per device at a time.
    /// `cancel` is checked once per block.
    pub async fn upgrade_firmware<F>(
        &self,
        data: &[u8],
        progress: F,
        cancel: &CancellationToken,
    ) -> std::result::Result<TransferReport, UpgradeError>
    where
        F: Fn(f32) + Send + Sync,
    {
        let debug_char = self
            .descriptor
            .family
            .debug_characteristic()
            .ok_or(UpgradeError::UnsupportedFamily)?;
        let (_channel, rx) = self.open_debug_channel()?;
        let handle = self
            .handle()
            .await
            .ok_or(UpgradeError::CantSendDeviceIsNotConnected)?;

        let engine = UpgradeEngine::new(
            self.ctx.transport.clone(),
            self.ctx.app.clone(),
            handle,
            debug_char,
            self.config.upgrade.clone(),
        );
        engine.run(data, rx, progress, cancel).await
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::NotFound.to_string(), "not_found");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.scan_timeout, Duration::from_secs(7));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.discovery_timeout, Duration::from_secs(5));
        assert_eq!(config.sampling_period, DEFAULT_PERIOD);
        assert_eq!(config.reconnect.delay, Duration::from_millis(600));
        assert!(config.reconnect.max_attempts.is_none());
    }

    #[test]
    fn test_descriptor_builder() {
        let d = DeviceDescriptor::new("n1", "SensorNode 01", DeviceFamily::SensorNode)
            .with_model("SN-200");
        assert_eq!(d.model.as_deref(), Some("SN-200"));
    }
}
