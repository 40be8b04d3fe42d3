//! Device state machine against the mock transport.

use std::sync::Arc;
use std::time::Duration;

use sensorgate_core::mock::{MockPeripheral, MockTransport, RecordingDelegate};
use sensorgate_core::uuids;
use sensorgate_core::{
    ConnectionConfig, ConnectionState, DeviceConnection, DeviceContext, DeviceDescriptor, Error,
    ReconnectOptions,
};
use sensorgate_types::{DeviceFamily, Reading, SensorKind};

fn device(
    transport: &Arc<MockTransport>,
    delegate: &Arc<RecordingDelegate>,
    name: &str,
    family: DeviceFamily,
    config: ConnectionConfig,
) -> Arc<DeviceConnection> {
    DeviceConnection::new(
        DeviceDescriptor::new(format!("id-{name}"), name, family),
        DeviceContext::new(transport.clone()).with_delegate(delegate.clone()),
        config,
    )
}

#[tokio::test]
async fn test_sensortag_reaches_monitoring() {
    let transport = Arc::new(MockTransport::new());
    let delegate = Arc::new(RecordingDelegate::new());
    let handle = transport.add_peripheral(MockPeripheral::sensor_tag("Tag"));
    let tag = device(
        &transport,
        &delegate,
        "Tag",
        DeviceFamily::SensorTag,
        ConnectionConfig::default(),
    );

    tag.enable().await.unwrap();

    assert_eq!(tag.state().await, ConnectionState::Monitoring);
    assert_eq!(tag.sensor_count().await, 5);
    assert_eq!(
        delegate.states(),
        vec![
            ConnectionState::Detecting,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Monitoring,
        ]
    );
    assert!(transport.is_notifying(&handle, uuids::HUMIDITY_DATA));

    let config_writes = transport.writes_to(uuids::MOVEMENT_CONFIG);
    assert_eq!(config_writes.len(), 1);
    assert_eq!(config_writes[0].value, vec![0x7F, 0x00]);
    let period_writes = transport.writes_to(uuids::OPTICAL_PERIOD);
    assert_eq!(period_writes[0].value, vec![100]);
}

#[tokio::test]
async fn test_scan_without_match_is_not_found() {
    let transport = Arc::new(MockTransport::new());
    let delegate = Arc::new(RecordingDelegate::new());
    let tag = device(
        &transport,
        &delegate,
        "Missing",
        DeviceFamily::SensorTag,
        ConnectionConfig::default(),
    );

    let err = tag.enable().await.unwrap_err();

    assert!(matches!(err, Error::DeviceNotFound(_)));
    assert_eq!(tag.state().await, ConnectionState::NotFound);
    assert!(!tag.is_enabled().await);
    assert_eq!(delegate.errors().len(), 1);
}

#[tokio::test]
async fn test_zero_services_is_error() {
    let transport = Arc::new(MockTransport::new());
    let delegate = Arc::new(RecordingDelegate::new());
    transport.add_peripheral(MockPeripheral::new("Empty"));
    let tag = device(
        &transport,
        &delegate,
        "Empty",
        DeviceFamily::SensorTag,
        ConnectionConfig::default(),
    );

    let err = tag.enable().await.unwrap_err();

    assert!(matches!(err, Error::NoServices));
    assert_eq!(tag.state().await, ConnectionState::Error);
    assert!(!tag.is_enabled().await);
    assert!(tag.handle().await.is_none());
}

#[tokio::test]
async fn test_sensortag_dispatches_by_service() {
    let transport = Arc::new(MockTransport::new());
    let delegate = Arc::new(RecordingDelegate::new());
    let handle = transport.add_peripheral(MockPeripheral::sensor_tag("Tag"));
    let tag = device(
        &transport,
        &delegate,
        "Tag",
        DeviceFamily::SensorTag,
        ConnectionConfig::default(),
    );
    tag.enable().await.unwrap();

    // humidity: raw temperature 0x6660, raw humidity 0x8000
    transport.notify(
        &handle,
        uuids::HUMIDITY_SERVICE,
        uuids::HUMIDITY_DATA,
        &[0x60, 0x66, 0x00, 0x80],
    );
    // a notification on an unknown service is dropped
    transport.notify(
        &handle,
        uuids::NODE_SERVICE,
        uuids::NODE_LIGHT_DATA,
        &[0x00, 0x10],
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let readings = delegate.readings();
    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].0, SensorKind::Humidity);
    assert!(matches!(readings[0].1, Reading::Humidity { .. }));
}

#[tokio::test]
async fn test_sensornode_dispatches_by_characteristic() {
    let transport = Arc::new(MockTransport::new());
    let delegate = Arc::new(RecordingDelegate::new());
    let handle = transport.add_peripheral(MockPeripheral::sensor_node("Node"));
    let node = device(
        &transport,
        &delegate,
        "Node",
        DeviceFamily::SensorNode,
        ConnectionConfig::default(),
    );
    node.enable().await.unwrap();
    assert_eq!(node.sensor_count().await, 4);
    assert!(transport.is_notifying(&handle, uuids::NODE_DEBUG));

    transport.notify(
        &handle,
        uuids::NODE_SERVICE,
        uuids::NODE_LIGHT_DATA,
        &[0x01, 0x2C],
    );
    transport.notify(
        &handle,
        uuids::NODE_SERVICE,
        uuids::NODE_ACCEL_DATA,
        &[0x00, 0x00, 0x00, 0x00, 0x00, 0x40],
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    let kinds: Vec<SensorKind> = delegate.readings().iter().map(|(k, _)| *k).collect();
    assert_eq!(kinds, vec![SensorKind::Light, SensorKind::Accelerometer]);
    assert_eq!(delegate.readings()[0].1, Reading::Light { lux: 300.0 });
}

#[tokio::test]
async fn test_short_payload_reports_error() {
    let transport = Arc::new(MockTransport::new());
    let delegate = Arc::new(RecordingDelegate::new());
    let handle = transport.add_peripheral(MockPeripheral::sensor_node("Node"));
    let node = device(
        &transport,
        &delegate,
        "Node",
        DeviceFamily::SensorNode,
        ConnectionConfig::default(),
    );
    node.enable().await.unwrap();

    transport.notify(&handle, uuids::NODE_SERVICE, uuids::NODE_ENV_DATA, &[0x01]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(delegate.readings().is_empty());
    assert_eq!(delegate.errors().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_link_loss() {
    let transport = Arc::new(MockTransport::new());
    let delegate = Arc::new(RecordingDelegate::new());
    let handle = transport.add_peripheral(MockPeripheral::sensor_tag("Tag"));
    let tag = device(
        &transport,
        &delegate,
        "Tag",
        DeviceFamily::SensorTag,
        ConnectionConfig::default(),
    );
    tag.enable().await.unwrap();

    assert!(tag.sensor_count().await > 0);
    let before = delegate.states().len();

    transport.simulate_disconnect(&handle);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(tag.state().await, ConnectionState::Disconnected);
    assert!(tag.is_enabled().await);
    assert_eq!(tag.sensor_count().await, 0);
    assert!(tag.handle().await.is_none());

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(tag.state().await, ConnectionState::Monitoring);
    assert_eq!(transport.scan_count(), 2);
    assert!(tag.sensor_count().await > 0);

    let after_loss = delegate.states().split_off(before);
    assert_eq!(after_loss.first(), Some(&ConnectionState::Disconnected));
    assert!(after_loss.contains(&ConnectionState::Detecting));
    assert_eq!(after_loss.last(), Some(&ConnectionState::Monitoring));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_respects_attempt_cap() {
    let transport = Arc::new(MockTransport::new());
    let delegate = Arc::new(RecordingDelegate::new());
    let handle = transport.add_peripheral(MockPeripheral::sensor_tag("Tag"));
    let config = ConnectionConfig::default().reconnect(ReconnectOptions::disabled());
    let tag = device(&transport, &delegate, "Tag", DeviceFamily::SensorTag, config);
    tag.enable().await.unwrap();

    transport.simulate_disconnect(&handle);
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(tag.state().await, ConnectionState::Disconnected);
    assert_eq!(transport.scan_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_reconnect_after_disconnect() {
    let transport = Arc::new(MockTransport::new());
    let delegate = Arc::new(RecordingDelegate::new());
    transport.add_peripheral(MockPeripheral::sensor_tag("Tag"));
    let tag = device(
        &transport,
        &delegate,
        "Tag",
        DeviceFamily::SensorTag,
        ConnectionConfig::default(),
    );
    tag.enable().await.unwrap();

    tag.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(tag.state().await, ConnectionState::Disconnected);
    assert!(!tag.is_enabled().await);
    assert_eq!(transport.scan_count(), 1);
}

#[tokio::test]
async fn test_disable_stops_sensors_and_keeps_handle() {
    let transport = Arc::new(MockTransport::new());
    let delegate = Arc::new(RecordingDelegate::new());
    let handle = transport.add_peripheral(MockPeripheral::sensor_tag("Tag"));
    let tag = device(
        &transport,
        &delegate,
        "Tag",
        DeviceFamily::SensorTag,
        ConnectionConfig::default(),
    );
    tag.enable().await.unwrap();

    tag.disable().await.unwrap();

    assert_eq!(tag.state().await, ConnectionState::Stopped);
    assert_eq!(tag.sensor_count().await, 0);
    assert_eq!(tag.handle().await, Some(handle.clone()));
    assert!(!transport.is_notifying(&handle, uuids::HUMIDITY_DATA));
    let last = transport.writes_to(uuids::HUMIDITY_CONFIG);
    assert_eq!(last.last().map(|w| w.value.clone()), Some(vec![0x00]));

    // re-enable reuses the handle without scanning
    tag.enable().await.unwrap();
    assert_eq!(tag.state().await, ConnectionState::Monitoring);
    assert_eq!(transport.scan_count(), 1);
}

#[tokio::test]
async fn test_sensor_property_toggle() {
    let transport = Arc::new(MockTransport::new());
    let delegate = Arc::new(RecordingDelegate::new());
    let handle = transport.add_peripheral(MockPeripheral::sensor_tag("Tag"));
    let tag = device(
        &transport,
        &delegate,
        "Tag",
        DeviceFamily::SensorTag,
        ConnectionConfig::default(),
    );

    // recorded while disabled, applied at the next enable
    assert!(!tag.set_sensor_enabled(SensorKind::Barometer, false).await.unwrap());
    tag.enable().await.unwrap();
    assert!(!transport.is_notifying(&handle, uuids::BAROMETER_DATA));
    assert!(transport.writes_to(uuids::BAROMETER_CONFIG).is_empty());

    assert!(tag.set_sensor_enabled(SensorKind::Barometer, true).await.unwrap());
    assert!(transport.is_notifying(&handle, uuids::BAROMETER_DATA));

    assert!(tag.set_sensor_enabled(SensorKind::Optical, false).await.unwrap());
    assert!(!transport.is_notifying(&handle, uuids::OPTICAL_DATA));
    let sensors = tag.sensors().await;
    let optical = sensors
        .iter()
        .find(|s| s.kind() == SensorKind::Optical)
        .unwrap();
    assert!(!optical.enabled);
}

#[tokio::test]
async fn test_query_firmware_version() {
    let transport = Arc::new(MockTransport::new());
    let delegate = Arc::new(RecordingDelegate::new());
    transport.add_peripheral(MockPeripheral::sensor_node("Node"));
    let node = device(
        &transport,
        &delegate,
        "Node",
        DeviceFamily::SensorNode,
        ConnectionConfig::default(),
    );
    node.enable().await.unwrap();

    let version = node.query_firmware_version().await.unwrap();

    assert_eq!(version.to_string(), "sn_nrf52_1.2.3");
    assert_eq!((version.major, version.minor, version.patch), (1, 2, 3));
    assert!(!node.is_upgrading());
}

#[tokio::test]
async fn test_sensortag_has_no_debug_channel() {
    let transport = Arc::new(MockTransport::new());
    let delegate = Arc::new(RecordingDelegate::new());
    transport.add_peripheral(MockPeripheral::sensor_tag("Tag"));
    let tag = device(
        &transport,
        &delegate,
        "Tag",
        DeviceFamily::SensorTag,
        ConnectionConfig::default(),
    );
    tag.enable().await.unwrap();

    let err = tag.query_firmware_version().await.unwrap_err();
    assert!(matches!(err, Error::CharacteristicNotFound { .. }));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_subscribe_times_out() {
    let transport = Arc::new(MockTransport::new());
    let delegate = Arc::new(RecordingDelegate::new());
    transport.add_peripheral(MockPeripheral::sensor_tag("Tag"));
    transport.set_stall_notify(true);
    let config = ConnectionConfig::default().write_timeout(Duration::from_secs(2));
    let tag = device(&transport, &delegate, "Tag", DeviceFamily::SensorTag, config);

    let started = tokio::time::Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(60), tag.enable())
        .await
        .expect("enable hung on a stalled subscribe");

    let err = result.unwrap_err();
    assert!(matches!(err, Error::Timeout { ref operation, .. } if operation == "subscribe"));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(tag.state().await, ConnectionState::Error);
    assert_eq!(tag.sensor_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_connected_now_does_not_wait_for_connect() {
    let transport = Arc::new(MockTransport::new());
    let delegate = Arc::new(RecordingDelegate::new());
    transport.add_peripheral(MockPeripheral::sensor_tag("Tag"));
    transport.set_connect_delay(Duration::from_secs(3));
    let tag = device(
        &transport,
        &delegate,
        "Tag",
        DeviceFamily::SensorTag,
        ConnectionConfig::default(),
    );

    let connecting = tag.clone();
    let enable = tokio::spawn(async move { connecting.enable().await });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let started = tokio::time::Instant::now();
    assert!(!tag.is_connected_now().await);
    assert_eq!(started.elapsed(), Duration::ZERO);

    enable.await.unwrap().unwrap();
    assert!(tag.is_connected_now().await);
}
