//! Upgrade records and queued reports survive a restart.

use std::sync::Arc;

use sensorgate_core::mock::{FixedAppState, MockCloud, MockTransport, RecordingDelegate};
use sensorgate_core::{UpgradeContext, UpgradeManager, UpgradeManagerConfig, UpgradeStore};
use sensorgate_store::{SharedStore, Store};
use sensorgate_types::{PendingTransaction, TransactionOutcome, UpgradeState, UpgradeStatus};

fn manager(store: Arc<SharedStore>, cloud: Arc<MockCloud>) -> Arc<UpgradeManager> {
    UpgradeManager::new(
        UpgradeContext {
            transport: Arc::new(MockTransport::new()),
            store,
            cloud,
            app: Arc::new(FixedAppState::new(true)),
            delegate: Arc::new(RecordingDelegate::new()),
        },
        UpgradeManagerConfig::default(),
    )
}

#[test]
fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("gateway.db");

    {
        let store = Store::open(&path).unwrap();
        let mut state = UpgradeState::idle("node-1");
        state.state = UpgradeStatus::Preparing;
        state.transaction_id = Some("tx-1".into());
        store.save_upgrade_state(&state).unwrap();
        store
            .push_pending(&PendingTransaction {
                transaction_id: "tx-0".into(),
                device_id: None,
                outcome: TransactionOutcome::Failed,
                message: Some("Upgrade already in progress".into()),
                queued_at: 5,
            })
            .unwrap();
    }

    let store = Store::open(&path).unwrap();
    let state = store.load_upgrade_state("node-1").unwrap().unwrap();
    assert_eq!(state.state, UpgradeStatus::Preparing);
    let pending = store.pending_transactions().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].message.as_deref(), Some("Upgrade already in progress"));
}

#[tokio::test]
async fn test_queued_success_replayed_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gateway.db");
    let firmware = dir.path().join("tok.bin");
    std::fs::write(&firmware, b"image").unwrap();

    // a previous run finished the upgrade while offline
    {
        let store = Store::open(&path).unwrap();
        let mut state = UpgradeState::idle("node-1");
        state.state = UpgradeStatus::Success;
        state.transaction_id = Some("tx-1".into());
        state.firmware_file_location = Some(firmware.to_string_lossy().into_owned());
        store.save_upgrade_state(&state).unwrap();
        store
            .push_pending(&PendingTransaction {
                transaction_id: "tx-1".into(),
                device_id: Some("node-1".into()),
                outcome: TransactionOutcome::Succeeded,
                message: None,
                queued_at: 1,
            })
            .unwrap();
    }

    let store = Arc::new(SharedStore::new(Store::open(&path).unwrap()));
    let cloud = Arc::new(MockCloud::new(dir.path()));
    let manager = manager(store.clone(), cloud.clone());

    let resumable = manager.recover().await.unwrap();

    assert!(resumable.is_empty());
    assert_eq!(cloud.succeeded_count("tx-1"), 1);
    assert!(store.pending_transactions().unwrap().is_empty());
    assert_eq!(manager.state("node-1").unwrap(), UpgradeState::idle("node-1"));
    assert!(!firmware.exists());

    // a second recovery has nothing left to send
    manager.recover().await.unwrap();
    assert_eq!(cloud.succeeded_count("tx-1"), 1);
}

#[tokio::test]
async fn test_interrupted_download_fails_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SharedStore::new(Store::open_in_memory().unwrap()));
    let mut state = UpgradeState::idle("node-1");
    state.state = UpgradeStatus::Downloading;
    state.transaction_id = Some("tx-1".into());
    store.save_state(&state).unwrap();

    let cloud = Arc::new(MockCloud::new(dir.path()));
    cloud.set_reachable(false);
    let manager = manager(store.clone(), cloud.clone());

    manager.recover().await.unwrap();

    let state = manager.state("node-1").unwrap();
    assert_eq!(state.state, UpgradeStatus::Error);
    assert_eq!(state.error_message.as_deref(), Some("Upgrade interrupted by restart"));
    assert_eq!(store.lock().pending_transactions().unwrap().len(), 1);

    cloud.set_reachable(true);
    assert_eq!(manager.on_reachability_changed(true).await.unwrap(), 1);
    assert_eq!(cloud.failures("tx-1").len(), 1);
    assert_eq!(manager.state("node-1").unwrap().state, UpgradeStatus::Idle);
}
