//! Gateway wiring against the in-memory transport, cloud and a SQLite store.

use std::sync::Arc;
use std::time::Duration;

use md5::{Digest, Md5};
use tokio_util::sync::CancellationToken;

use sensorgate_core::mock::{MockCloud, MockPeripheral, MockTransport};
use sensorgate_core::{
    CloudApi, CommandDisposition, ConnectionState, GatewayEvent, UpgradeJob, UpgradeManagerConfig,
};
use sensorgate_service::{Config, DeviceConfig, Gateway, GatewayError};
use sensorgate_store::{SharedStore, Store};
use sensorgate_types::{DeviceFamily, SensorKind, UpgradeState, UpgradeStatus};

fn node_config() -> DeviceConfig {
    DeviceConfig {
        id: "node-1".to_string(),
        name: "SensorNode 01".to_string(),
        family: None,
        model: Some("SN-100".to_string()),
        disabled_sensors: vec![SensorKind::Light],
    }
}

fn tag_config() -> DeviceConfig {
    DeviceConfig {
        id: "tag-1".to_string(),
        name: "Kitchen".to_string(),
        family: Some(DeviceFamily::SensorTag),
        model: None,
        disabled_sensors: Vec::new(),
    }
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8 + 1).collect()
}

fn md5_hex(data: &[u8]) -> String {
    Md5::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

struct Setup {
    transport: Arc<MockTransport>,
    store: Arc<SharedStore>,
    cloud: Arc<MockCloud>,
    dir: tempfile::TempDir,
}

impl Setup {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.add_peripheral(MockPeripheral::sensor_node("SensorNode 01"));
        transport.add_peripheral(MockPeripheral::sensor_tag("Kitchen"));
        let store = Arc::new(SharedStore::new(
            Store::open(dir.path().join("gateway.db")).unwrap(),
        ));
        let cloud = Arc::new(MockCloud::new(dir.path()));
        Self {
            transport,
            store,
            cloud,
            dir,
        }
    }

    fn config(&self) -> Config {
        let mut config = Config::default();
        config.devices = vec![node_config(), tag_config()];
        config.storage.path = self.dir.path().join("gateway.db");
        config.storage.firmware_dir = self.dir.path().to_path_buf();
        config.cloud.url = Some("https://iot.example.com".to_string());
        config
    }

    fn gateway(&self, config: Config, with_cloud: bool) -> Gateway {
        let cloud = with_cloud.then(|| self.cloud.clone() as Arc<dyn CloudApi>);
        Gateway::with_manager_config(
            config,
            self.transport.clone(),
            self.store.clone(),
            cloud,
            UpgradeManagerConfig {
                prepare_reconnect_delay: Duration::from_millis(50),
                post_upgrade_reconnect_delay: Duration::from_millis(50),
            },
        )
        .unwrap()
    }
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(30), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

#[tokio::test(start_paused = true)]
async fn test_start_monitors_devices() {
    let setup = Setup::new();
    let gateway = setup.gateway(setup.config(), false);
    let mut events = gateway.events().subscribe();

    gateway.start().await.unwrap();

    for device in gateway.devices() {
        assert_eq!(device.state().await, ConnectionState::Monitoring);
    }
    let stored = setup.store.lock().list_devices().unwrap();
    assert_eq!(stored.len(), 2);

    let mut saw_monitoring = false;
    while let Ok(event) = events.try_recv() {
        if let GatewayEvent::StateChanged { device_id, state } = event
            && device_id == "node-1"
            && state == ConnectionState::Monitoring
        {
            saw_monitoring = true;
        }
    }
    assert!(saw_monitoring);

    gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disabled_sensor_left_off() {
    let setup = Setup::new();
    let gateway = setup.gateway(setup.config(), false);
    gateway.start().await.unwrap();

    let light = DeviceFamily::SensorNode
        .sensors()
        .iter()
        .find(|s| s.kind == SensorKind::Light)
        .unwrap();
    assert!(setup.transport.writes_to(light.config).is_empty());

    let node = gateway.device("node-1").unwrap();
    let sensors = node.sensors().await;
    let light_sensor = sensors.iter().find(|s| s.kind() == SensorKind::Light).unwrap();
    assert!(!light_sensor.enabled);
    assert!(
        sensors
            .iter()
            .filter(|s| s.kind() != SensorKind::Light)
            .all(|s| s.enabled)
    );
}

#[tokio::test(start_paused = true)]
async fn test_missing_peripheral_does_not_stop_start() {
    let setup = Setup::new();
    setup.transport.remove_peripheral("Kitchen");
    let gateway = setup.gateway(setup.config(), false);

    assert_eq!(gateway.connect_all().await, 1);
    let tag = gateway.device("tag-1").unwrap();
    assert_eq!(tag.state().await, ConnectionState::NotFound);
}

#[tokio::test]
async fn test_upgrades_need_a_cloud() {
    let setup = Setup::new();
    let gateway = setup.gateway(setup.config(), false);

    let job = UpgradeJob {
        device_id: "node-1".into(),
        transaction_id: "tx-1".into(),
        file_token: "tok".into(),
        md5: "00".into(),
    };
    assert!(matches!(
        gateway.submit(job).await,
        Err(GatewayError::UpgradesDisabled)
    ));
    assert_eq!(gateway.on_reachability_changed(true).await.unwrap(), 0);
    assert!(gateway.recover_upgrades().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_device_rejected() {
    let setup = Setup::new();
    let gateway = setup.gateway(setup.config(), true);

    let job = UpgradeJob {
        device_id: "ghost".into(),
        transaction_id: "tx-1".into(),
        file_token: "tok".into(),
        md5: "00".into(),
    };
    assert!(matches!(
        gateway.submit(job).await,
        Err(GatewayError::UnknownDevice(id)) if id == "ghost"
    ));
    assert!(setup.cloud.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_query_version_is_stored() {
    let setup = Setup::new();
    let gateway = setup.gateway(setup.config(), false);
    gateway.start().await.unwrap();

    let version = gateway.query_version("node-1").await.unwrap();
    assert_eq!(version.to_string(), "sn_nrf52_1.2.3");

    let device = setup.store.lock().get_device("node-1").unwrap().unwrap();
    assert_eq!(device.firmware.as_deref(), Some("sn_nrf52_1.2.3"));
}

#[tokio::test(start_paused = true)]
async fn test_submitted_upgrade_completes() {
    let setup = Setup::new();
    let firmware = image(320);
    setup.cloud.set_firmware(&firmware);
    let gateway = setup.gateway(setup.config(), true);
    gateway.start().await.unwrap();

    let disposition = gateway
        .submit(UpgradeJob {
            device_id: "node-1".into(),
            transaction_id: "tx-1".into(),
            file_token: "tok-1".into(),
            md5: md5_hex(&firmware),
        })
        .await
        .unwrap();
    assert_eq!(disposition, CommandDisposition::Started);

    let cloud = setup.cloud.clone();
    wait_until("success report", move || cloud.succeeded_count("tx-1") == 1).await;
    wait_until("idle record", || {
        gateway.upgrade_state("node-1").unwrap().state == UpgradeStatus::Idle
    })
    .await;
    assert!(setup.store.lock().pending_transactions().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_upgrade_abandoned_on_start() {
    let setup = Setup::new();
    let mut state = UpgradeState::idle("node-1");
    state.state = UpgradeStatus::Upgrading;
    state.transaction_id = Some("tx-9".into());
    setup.store.lock().save_upgrade_state(&state).unwrap();

    let mut config = setup.config();
    config.gateway.resume_interrupted = false;
    let gateway = setup.gateway(config, true);

    gateway.start().await.unwrap();

    assert_eq!(setup.cloud.failures("tx-9"), vec!["Upgrade abandoned".to_string()]);
    assert_eq!(
        gateway.upgrade_state("node-1").unwrap().state,
        UpgradeStatus::Idle
    );
}

#[tokio::test(start_paused = true)]
async fn test_reports_replayed_when_cloud_returns() {
    let setup = Setup::new();
    let mut state = UpgradeState::idle("node-1");
    state.state = UpgradeStatus::Downloading;
    state.transaction_id = Some("tx-3".into());
    setup.store.lock().save_upgrade_state(&state).unwrap();
    setup.cloud.set_reachable(false);

    let gateway = setup.gateway(setup.config(), true);
    gateway.start().await.unwrap();

    assert_eq!(setup.store.lock().pending_transactions().unwrap().len(), 1);
    assert_eq!(gateway.on_reachability_changed(false).await.unwrap(), 0);

    setup.cloud.set_reachable(true);
    assert_eq!(gateway.on_reachability_changed(true).await.unwrap(), 1);
    assert_eq!(
        setup.cloud.failures("tx-3"),
        vec!["Upgrade interrupted by restart".to_string()]
    );
    assert!(setup.store.lock().pending_transactions().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_flash_local_image() {
    let setup = Setup::new();
    let gateway = setup.gateway(setup.config(), false);
    let path = setup.dir.path().join("local.bin");
    let data = image(96);
    std::fs::write(&path, &data).unwrap();

    // flash connects the device itself
    let report = gateway
        .flash("node-1", &path, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.bytes_sent, 96);
    assert_eq!(report.packages_sent, 6);
    assert!(!report.implicit);
}

#[tokio::test(start_paused = true)]
async fn test_flash_missing_image() {
    let setup = Setup::new();
    let gateway = setup.gateway(setup.config(), false);

    let err = gateway
        .flash(
            "node-1",
            &setup.dir.path().join("missing.bin"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::ReadImage { .. }));
}
