//! In-memory implementations of the gateway seams for testing.
//!
//! - [`MockTransport`]: a BLE central with scripted peripherals. SensorNode
//!   peripherals emulate the bootloader, so full firmware transfers and
//!   version queries run against it.
//! - [`MemoryStore`]: an [`UpgradeStore`] kept in memory.
//! - [`MockCloud`]: a [`CloudApi`] with a reachability switch and call log.
//! - [`FixedAppState`]: a switchable foreground flag.
//! - [`RecordingDelegate`]: records every delegate callback.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use sensorgate_core::mock::{MockPeripheral, MockTransport};
//! use sensorgate_core::{ConnectionState, DeviceConnection, DeviceContext, DeviceDescriptor};
//! use sensorgate_types::DeviceFamily;
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = Arc::new(MockTransport::new());
//!     transport.add_peripheral(MockPeripheral::sensor_tag("SensorTag"));
//!
//!     let device = DeviceConnection::new(
//!         DeviceDescriptor::new("tag-1", "SensorTag", DeviceFamily::SensorTag),
//!         DeviceContext::new(transport.clone()),
//!         Default::default(),
//!     );
//!     device.enable().await.unwrap();
//!     assert_eq!(device.state().await, ConnectionState::Monitoring);
//! }
//! ```

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast};
use uuid::Uuid;

use sensorgate_types::uuids;
use sensorgate_types::{
    DeviceFamily, PendingTransaction, Reading, SensorKind, UpgradeState, UpgradeStatus,
};

use crate::connection::{ConnectionState, VERSION_COMMAND};
use crate::error::{Error, Result};
use crate::traits::{AppState, CloudApi, DeviceDelegate, UpgradeDelegate, UpgradeStore};
use crate::transport::{PeripheralHandle, Transport, TransportEvent, TransportEvents};
use crate::upgrade::protocol::{FINISH_ACK, START_FRAME_LEN, UPGRADE_COMMAND};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A scripted peripheral.
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    pub name: String,
    pub handle: PeripheralHandle,
    /// Services and their characteristics.
    pub services: Vec<(Uuid, Vec<Uuid>)>,
    /// Reply to `versionFw`, without the line terminator.
    pub firmware_version: Option<String>,
    /// Whether writes to the debug characteristic drive an emulated bootloader.
    pub bootloader: bool,
}

impl MockPeripheral {
    /// A peripheral without services.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            handle: PeripheralHandle::new(format!("mock-{name}")),
            name,
            services: Vec::new(),
            firmware_version: None,
            bootloader: false,
        }
    }

    /// A SensorTag with all five sensor services.
    pub fn sensor_tag(name: impl Into<String>) -> Self {
        let mut peripheral = Self::new(name);
        peripheral.services = DeviceFamily::SensorTag
            .sensors()
            .iter()
            .map(|s| (s.service, vec![s.data, s.config, s.period]))
            .collect();
        peripheral
    }

    /// A SensorNode with its multiplexed service and debug channel.
    pub fn sensor_node(name: impl Into<String>) -> Self {
        let mut peripheral = Self::new(name);
        let mut characteristics: Vec<Uuid> = DeviceFamily::SensorNode
            .sensors()
            .iter()
            .flat_map(|s| [s.data, s.config, s.period])
            .collect();
        characteristics.push(uuids::NODE_DEBUG);
        peripheral.services = vec![(uuids::NODE_SERVICE, characteristics)];
        peripheral.firmware_version = Some("sn_nrf52_1.2.3".to_string());
        peripheral.bootloader = true;
        peripheral
    }

    #[must_use]
    pub fn with_services(mut self, services: Vec<(Uuid, Vec<Uuid>)>) -> Self {
        self.services = services;
        self
    }
}

/// A write observed by the mock transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub handle: PeripheralHandle,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
    pub with_response: bool,
}

#[derive(Debug)]
struct Transfer {
    expected: usize,
    received: usize,
}

/// In-memory BLE central.
pub struct MockTransport {
    powered: AtomicBool,
    fail_connect: AtomicBool,
    connect_delay: Mutex<Duration>,
    stall_notify: AtomicBool,
    silent_finish: AtomicBool,
    finish_byte: AtomicU8,
    crc_echo: Mutex<Option<u32>>,
    peripherals: Mutex<Vec<MockPeripheral>>,
    connected: Mutex<HashSet<PeripheralHandle>>,
    notifying: Mutex<HashSet<(PeripheralHandle, Uuid)>>,
    writes: Mutex<Vec<WriteRecord>>,
    transfers: Mutex<HashMap<PeripheralHandle, Transfer>>,
    scans: AtomicU32,
    events: broadcast::Sender<TransportEvent>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            powered: AtomicBool::new(true),
            fail_connect: AtomicBool::new(false),
            connect_delay: Mutex::new(Duration::ZERO),
            stall_notify: AtomicBool::new(false),
            silent_finish: AtomicBool::new(false),
            finish_byte: AtomicU8::new(FINISH_ACK),
            crc_echo: Mutex::new(None),
            peripherals: Mutex::new(Vec::new()),
            connected: Mutex::new(HashSet::new()),
            notifying: Mutex::new(HashSet::new()),
            writes: Mutex::new(Vec::new()),
            transfers: Mutex::new(HashMap::new()),
            scans: AtomicU32::new(0),
            events,
        }
    }

    /// Put a peripheral in range. Returns its handle.
    pub fn add_peripheral(&self, peripheral: MockPeripheral) -> PeripheralHandle {
        let handle = peripheral.handle.clone();
        lock(&self.peripherals).push(peripheral);
        handle
    }

    /// Take a peripheral out of range.
    pub fn remove_peripheral(&self, name: &str) {
        lock(&self.peripherals).retain(|p| p.name != name);
    }

    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
    }

    /// Make every connect attempt time out.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make connect attempts take `delay`; attempts whose timeout is shorter
    /// time out.
    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.connect_delay) = delay;
    }

    /// Make notification subscriptions hang until their timeout.
    pub fn set_stall_notify(&self, stall: bool) {
        self.stall_notify.store(stall, Ordering::SeqCst);
    }

    /// Make the bootloader skip the finish acknowledgement.
    pub fn set_silent_finish(&self, silent: bool) {
        self.silent_finish.store(silent, Ordering::SeqCst);
    }

    /// Byte the bootloader sends once the image is complete.
    pub fn set_finish_byte(&self, byte: u8) {
        self.finish_byte.store(byte, Ordering::SeqCst);
    }

    /// Make the bootloader echo a fixed CRC instead of the one it received.
    pub fn set_crc_echo(&self, crc: Option<u32>) {
        *lock(&self.crc_echo) = crc;
    }

    /// Drop the link as if the peripheral went away.
    pub fn simulate_disconnect(&self, handle: &PeripheralHandle) {
        lock(&self.connected).remove(handle);
        let _ = self.events.send(TransportEvent::Disconnected {
            handle: handle.clone(),
        });
    }

    /// Deliver a notification.
    pub fn notify(&self, handle: &PeripheralHandle, service: Uuid, characteristic: Uuid, value: &[u8]) {
        let _ = self.events.send(TransportEvent::CharacteristicUpdate {
            handle: handle.clone(),
            service,
            characteristic,
            value: value.to_vec(),
        });
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        lock(&self.writes).clone()
    }

    /// Writes to one characteristic, in order.
    pub fn writes_to(&self, characteristic: Uuid) -> Vec<WriteRecord> {
        lock(&self.writes)
            .iter()
            .filter(|w| w.characteristic == characteristic)
            .cloned()
            .collect()
    }

    pub fn clear_writes(&self) {
        lock(&self.writes).clear();
    }

    pub fn is_notifying(&self, handle: &PeripheralHandle, characteristic: Uuid) -> bool {
        lock(&self.notifying).contains(&(handle.clone(), characteristic))
    }

    /// Number of scans performed.
    pub fn scan_count(&self) -> u32 {
        self.scans.load(Ordering::SeqCst)
    }

    fn peripheral_by_handle(&self, handle: &PeripheralHandle) -> Option<MockPeripheral> {
        lock(&self.peripherals)
            .iter()
            .find(|p| &p.handle == handle)
            .cloned()
    }

    fn require_connected(&self, handle: &PeripheralHandle) -> Result<()> {
        if lock(&self.connected).contains(handle) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }

    /// Emulate the SensorNode side of the debug channel.
    fn bootloader_write(&self, peripheral: &MockPeripheral, value: &[u8]) {
        let handle = &peripheral.handle;
        let reply = |bytes: &[u8]| {
            self.notify(handle, uuids::NODE_SERVICE, uuids::NODE_DEBUG, bytes);
        };

        if value == VERSION_COMMAND {
            if let Some(version) = &peripheral.firmware_version {
                reply(format!("{version}\r\n").as_bytes());
            }
            return;
        }

        if value.len() == START_FRAME_LEN && value.starts_with(UPGRADE_COMMAND) {
            let at = UPGRADE_COMMAND.len();
            let expected = u32::from_le_bytes([value[at], value[at + 1], value[at + 2], value[at + 3]]);
            let crc = u32::from_le_bytes([
                value[at + 4],
                value[at + 5],
                value[at + 6],
                value[at + 7],
            ]);
            lock(&self.transfers).insert(
                handle.clone(),
                Transfer {
                    expected: expected as usize,
                    received: 0,
                },
            );
            let echo = lock(&self.crc_echo).unwrap_or(crc);
            reply(&echo.to_le_bytes());
            return;
        }

        let complete = {
            let mut transfers = lock(&self.transfers);
            match transfers.get_mut(handle) {
                Some(transfer) => {
                    transfer.received += value.len();
                    let done = transfer.received >= transfer.expected;
                    if done {
                        transfers.remove(handle);
                    }
                    done
                }
                None => false,
            }
        };
        if complete && !self.silent_finish.load(Ordering::SeqCst) {
            reply(&[self.finish_byte.load(Ordering::SeqCst)]);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn is_powered(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    async fn scan(&self, name: &str, _timeout: Duration) -> Result<Option<PeripheralHandle>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if !self.powered.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(lock(&self.peripherals)
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.handle.clone()))
    }

    async fn connect(&self, handle: &PeripheralHandle, timeout: Duration) -> Result<Vec<Uuid>> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::timeout("connect to device", timeout));
        }
        let delay = *lock(&self.connect_delay);
        if !delay.is_zero() {
            if delay >= timeout {
                tokio::time::sleep(timeout).await;
                return Err(Error::timeout("connect to device", timeout));
            }
            tokio::time::sleep(delay).await;
        }
        let peripheral = self
            .peripheral_by_handle(handle)
            .ok_or_else(|| Error::device_not_found(handle.as_str()))?;
        lock(&self.connected).insert(handle.clone());
        Ok(peripheral.services.iter().map(|(service, _)| *service).collect())
    }

    async fn discover_characteristics(
        &self,
        handle: &PeripheralHandle,
        service: Uuid,
        _timeout: Duration,
    ) -> Result<Vec<Uuid>> {
        self.require_connected(handle)?;
        let peripheral = self
            .peripheral_by_handle(handle)
            .ok_or_else(|| Error::device_not_found(handle.as_str()))?;
        Ok(peripheral
            .services
            .iter()
            .filter(|(uuid, _)| *uuid == service)
            .flat_map(|(_, chars)| chars.iter().copied())
            .collect())
    }

    async fn write(
        &self,
        handle: &PeripheralHandle,
        characteristic: Uuid,
        value: &[u8],
        with_response: bool,
        _timeout: Duration,
    ) -> Result<()> {
        self.require_connected(handle)?;
        lock(&self.writes).push(WriteRecord {
            handle: handle.clone(),
            characteristic,
            value: value.to_vec(),
            with_response,
        });
        if characteristic == uuids::NODE_DEBUG {
            if let Some(peripheral) = self.peripheral_by_handle(handle).filter(|p| p.bootloader) {
                self.bootloader_write(&peripheral, value);
            }
        }
        Ok(())
    }

    async fn set_notify(
        &self,
        handle: &PeripheralHandle,
        characteristic: Uuid,
        enabled: bool,
        timeout: Duration,
    ) -> Result<()> {
        self.require_connected(handle)?;
        if self.stall_notify.load(Ordering::SeqCst) {
            tokio::time::sleep(timeout).await;
            let operation = if enabled { "subscribe" } else { "unsubscribe" };
            return Err(Error::timeout(operation, timeout));
        }
        let mut notifying = lock(&self.notifying);
        if enabled {
            notifying.insert((handle.clone(), characteristic));
        } else {
            notifying.remove(&(handle.clone(), characteristic));
        }
        Ok(())
    }

    async fn is_connected(&self, handle: &PeripheralHandle) -> bool {
        lock(&self.connected).contains(handle)
    }

    async fn disconnect(&self, handle: &PeripheralHandle) -> Result<()> {
        let was_connected = lock(&self.connected).remove(handle);
        if was_connected {
            let _ = self.events.send(TransportEvent::Disconnected {
                handle: handle.clone(),
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> TransportEvents {
        self.events.subscribe()
    }
}

/// [`UpgradeStore`] kept in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<String, UpgradeState>>,
    pending: Mutex<Vec<PendingTransaction>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UpgradeStore for MemoryStore {
    fn load_state(&self, device_id: &str) -> Result<Option<UpgradeState>> {
        Ok(lock(&self.states).get(device_id).cloned())
    }

    fn save_state(&self, state: &UpgradeState) -> Result<()> {
        lock(&self.states).insert(state.device_id.clone(), state.clone());
        Ok(())
    }

    fn all_states(&self) -> Result<Vec<UpgradeState>> {
        let mut states: Vec<_> = lock(&self.states).values().cloned().collect();
        states.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(states)
    }

    fn pending_transactions(&self) -> Result<Vec<PendingTransaction>> {
        Ok(lock(&self.pending).clone())
    }

    fn push_pending(&self, pending: &PendingTransaction) -> Result<()> {
        let mut queue = lock(&self.pending);
        queue.retain(|p| p.transaction_id != pending.transaction_id);
        queue.push(pending.clone());
        Ok(())
    }

    fn remove_pending(&self, transaction_id: &str) -> Result<()> {
        lock(&self.pending).retain(|p| p.transaction_id != transaction_id);
        Ok(())
    }
}

/// A call received by [`MockCloud`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudCall {
    Received(String),
    Succeeded(String),
    Failed { transaction_id: String, message: String },
}

/// [`CloudApi`] that serves one firmware image from memory.
pub struct MockCloud {
    reachable: AtomicBool,
    fail_download: AtomicBool,
    firmware: Mutex<Vec<u8>>,
    download_dir: PathBuf,
    gate: Mutex<Option<Arc<Notify>>>,
    calls: Mutex<Vec<CloudCall>>,
    cancelled: Mutex<Vec<String>>,
}

impl MockCloud {
    /// Downloads are written below `download_dir`.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            reachable: AtomicBool::new(true),
            fail_download: AtomicBool::new(false),
            firmware: Mutex::new(Vec::new()),
            download_dir: download_dir.into(),
            gate: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn set_firmware(&self, image: &[u8]) {
        *lock(&self.firmware) = image.to_vec();
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_fail_download(&self, fail: bool) {
        self.fail_download.store(fail, Ordering::SeqCst);
    }

    /// Block downloads until the returned [`Notify`] is signalled.
    pub fn hold_downloads(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.gate) = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        lock(&self.calls).clone()
    }

    /// Number of success reports for a transaction.
    pub fn succeeded_count(&self, transaction_id: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, CloudCall::Succeeded(t) if t == transaction_id))
            .count()
    }

    /// Failure reports for a transaction.
    pub fn failures(&self, transaction_id: &str) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                CloudCall::Failed {
                    transaction_id: t,
                    message,
                } if t == transaction_id => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// File tokens whose download was cancelled.
    pub fn cancelled_downloads(&self) -> Vec<String> {
        lock(&self.cancelled).clone()
    }

    fn record(&self, call: CloudCall) -> bool {
        if !self.reachable.load(Ordering::SeqCst) {
            return false;
        }
        lock(&self.calls).push(call);
        true
    }
}

#[async_trait]
impl CloudApi for MockCloud {
    async fn download_file(
        &self,
        _transaction_id: &str,
        file_token: &str,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<PathBuf> {
        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_download.load(Ordering::SeqCst) {
            return Err(Error::Cloud("download failed".to_string()));
        }
        let image = lock(&self.firmware).clone();
        progress(0.5);
        let path = self.download_dir.join(format!("{file_token}.bin"));
        tokio::fs::write(&path, &image).await?;
        progress(1.0);
        Ok(path)
    }

    fn cancel_download(&self, file_token: &str) {
        lock(&self.cancelled).push(file_token.to_string());
    }

    async fn report_received(&self, transaction_id: &str) -> bool {
        self.record(CloudCall::Received(transaction_id.to_string()))
    }

    async fn report_succeeded(&self, transaction_id: &str) -> bool {
        self.record(CloudCall::Succeeded(transaction_id.to_string()))
    }

    async fn report_failed(&self, transaction_id: &str, message: &str) -> bool {
        self.record(CloudCall::Failed {
            transaction_id: transaction_id.to_string(),
            message: message.to_string(),
        })
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Switchable [`AppState`].
#[derive(Debug)]
pub struct FixedAppState {
    foreground: AtomicBool,
}

impl FixedAppState {
    pub fn new(foreground: bool) -> Self {
        Self {
            foreground: AtomicBool::new(foreground),
        }
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::SeqCst);
    }
}

impl AppState for FixedAppState {
    fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }
}

/// Delegate that records every callback.
#[derive(Debug, Default)]
pub struct RecordingDelegate {
    states: Mutex<Vec<ConnectionState>>,
    readings: Mutex<Vec<(SensorKind, Reading)>>,
    errors: Mutex<Vec<String>>,
    upgrade_states: Mutex<Vec<(UpgradeStatus, Option<String>)>>,
    progress: Mutex<Vec<(UpgradeStatus, f32)>>,
    resumable: Mutex<Vec<String>>,
}

impl RecordingDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn states(&self) -> Vec<ConnectionState> {
        lock(&self.states).clone()
    }

    pub fn readings(&self) -> Vec<(SensorKind, Reading)> {
        lock(&self.readings).clone()
    }

    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).clone()
    }

    /// Upgrade states in the order they were entered.
    pub fn upgrade_states(&self) -> Vec<UpgradeStatus> {
        lock(&self.upgrade_states).iter().map(|(s, _)| *s).collect()
    }

    /// Message attached to the last `Error` state.
    pub fn last_error_message(&self) -> Option<String> {
        lock(&self.upgrade_states)
            .iter()
            .rev()
            .find(|(s, _)| *s == UpgradeStatus::Error)
            .and_then(|(_, m)| m.clone())
    }

    pub fn progress(&self) -> Vec<(UpgradeStatus, f32)> {
        lock(&self.progress).clone()
    }

    pub fn resumable(&self) -> Vec<String> {
        lock(&self.resumable).clone()
    }
}

impl DeviceDelegate for RecordingDelegate {
    fn state_changed(&self, _device_id: &str, state: ConnectionState) {
        lock(&self.states).push(state);
    }

    fn reading(&self, _device_id: &str, sensor: SensorKind, reading: &Reading) {
        lock(&self.readings).push((sensor, *reading));
    }

    fn error(&self, _device_id: &str, message: &str) {
        lock(&self.errors).push(message.to_string());
    }
}

impl UpgradeDelegate for RecordingDelegate {
    fn upgrade_state_changed(&self, _device_id: &str, state: UpgradeStatus, message: Option<&str>) {
        lock(&self.upgrade_states).push((state, message.map(str::to_string)));
    }

    fn upgrade_progress(&self, _device_id: &str, state: UpgradeStatus, fraction: f32) {
        lock(&self.progress).push((state, fraction));
    }

    fn resumable_upgrade(&self, device_id: &str, _state: UpgradeStatus) {
        lock(&self.resumable).push(device_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_finds_peripheral_by_name() {
        let transport = MockTransport::new();
        let handle = transport.add_peripheral(MockPeripheral::sensor_tag("Tag A"));
        let found = transport
            .scan("Tag A", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(found, Some(handle));
        assert!(
            transport
                .scan("Tag B", Duration::from_secs(1))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(transport.scan_count(), 2);
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let transport = MockTransport::new();
        let handle = transport.add_peripheral(MockPeripheral::sensor_node("Node"));
        let err = transport
            .write(&handle, uuids::NODE_DEBUG, b"x", true, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn test_bootloader_echoes_crc() {
        let transport = MockTransport::new();
        let handle = transport.add_peripheral(MockPeripheral::sensor_node("Node"));
        let mut events = transport.subscribe();
        transport.connect(&handle, Duration::from_secs(1)).await.unwrap();

        let frame = crate::upgrade::start_frame(8, 0xDEAD_BEEF);
        transport
            .write(&handle, uuids::NODE_DEBUG, &frame, true, Duration::from_secs(1))
            .await
            .unwrap();
        match events.recv().await.unwrap() {
            TransportEvent::CharacteristicUpdate { value, .. } => {
                assert_eq!(value, 0xDEAD_BEEFu32.to_le_bytes().to_vec());
            }
            other => panic!("unexpected event {other:?}"),
        }

        transport
            .write(&handle, uuids::NODE_DEBUG, &[0; 8], false, Duration::from_secs(1))
            .await
            .unwrap();
        match events.recv().await.unwrap() {
            TransportEvent::CharacteristicUpdate { value, .. } => assert_eq!(value, vec![FINISH_ACK]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_memory_store_replaces_pending_for_same_transaction() {
        let store = MemoryStore::new();
        let pending = PendingTransaction {
            transaction_id: "tx".into(),
            device_id: None,
            outcome: sensorgate_types::TransactionOutcome::Failed,
            message: None,
            queued_at: 1,
        };
        store.push_pending(&pending).unwrap();
        store.push_pending(&pending).unwrap();
        assert_eq!(store.pending_transactions().unwrap().len(), 1);
        store.remove_pending("tx").unwrap();
        assert!(store.pending_transactions().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_cloud_rejects_reports() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = MockCloud::new(dir.path());
        cloud.set_reachable(false);
        assert!(!cloud.report_succeeded("tx").await);
        assert!(cloud.calls().is_empty());
        cloud.set_reachable(true);
        assert!(cloud.report_succeeded("tx").await);
        assert_eq!(cloud.succeeded_count("tx"), 1);
    }
}
