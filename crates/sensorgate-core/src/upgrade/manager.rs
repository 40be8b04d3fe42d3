//! Persisted per-device upgrade orchestration.
//!
//! Each device has one [`UpgradeState`] record in the [`UpgradeStore`]. A job
//! walks `Scheduled → Downloading → Preparing → Upgrading` and ends in
//! `Success` or `Error`, where its outcome is reported to the cloud. Once the
//! report is delivered the record returns to `Idle` and the downloaded image
//! is deleted. If the cloud is unreachable the report is queued as a
//! [`PendingTransaction`] and the record keeps its terminal state until the
//! queue is replayed.
//!
//! Every read-modify-write of a record happens under one manager-wide lock.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sensorgate_types::{PendingTransaction, TransactionOutcome, UpgradeState, UpgradeStatus};

use crate::connection::DeviceConnection;
use crate::error::{Error, Result, UpgradeError};
use crate::traits::{AppState, CloudApi, UpgradeDelegate, UpgradeStore};
use crate::transport::Transport;
use crate::util::{hex_digest, unix_now};

/// An upgrade command received from the cloud.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeJob {
    pub device_id: String,
    pub transaction_id: String,
    /// Token used to fetch the image.
    pub file_token: String,
    /// Expected hex MD5 digest of the image.
    pub md5: String,
}

impl UpgradeJob {
    fn apply(&self, state: &mut UpgradeState) {
        state.transaction_id = Some(self.transaction_id.clone());
        state.file_token = Some(self.file_token.clone());
        state.md5_checksum = Some(self.md5.clone());
    }

    /// Rebuild the job stored in a record.
    fn from_state(state: &UpgradeState) -> Option<Self> {
        Some(Self {
            device_id: state.device_id.clone(),
            transaction_id: state.transaction_id.clone()?,
            file_token: state.file_token.clone()?,
            md5: state.md5_checksum.clone()?,
        })
    }
}

/// What happened to an upgrade command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandDisposition {
    /// The download was started in the background.
    Started,
    /// The job was recorded and waits for the host to come to the foreground.
    Scheduled,
    /// Another upgrade is running on the device; the transaction was
    /// reported as failed.
    Rejected,
}

/// Delays used by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeManagerConfig {
    /// How long to wait for a reconnect while preparing.
    pub prepare_reconnect_delay: Duration,
    /// When to reconnect after a successful transfer; the device reboots.
    pub post_upgrade_reconnect_delay: Duration,
}

impl Default for UpgradeManagerConfig {
    fn default() -> Self {
        Self {
            prepare_reconnect_delay: Duration::from_secs(5),
            post_upgrade_reconnect_delay: Duration::from_secs(15),
        }
    }
}

/// Collaborators of the upgrade orchestrator.
#[derive(Clone)]
pub struct UpgradeContext {
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn UpgradeStore>,
    pub cloud: Arc<dyn CloudApi>,
    pub app: Arc<dyn AppState>,
    pub delegate: Arc<dyn UpgradeDelegate>,
}

/// Orchestrates firmware upgrades for registered devices.
pub struct UpgradeManager {
    ctx: UpgradeContext,
    config: UpgradeManagerConfig,
    devices: std::sync::RwLock<HashMap<String, Arc<DeviceConnection>>>,
    cancels: std::sync::Mutex<HashMap<String, CancellationToken>>,
    state_lock: Mutex<()>,
    replay_lock: Mutex<()>,
    this: Weak<UpgradeManager>,
}

impl UpgradeManager {
    pub fn new(ctx: UpgradeContext, config: UpgradeManagerConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            ctx,
            config,
            devices: std::sync::RwLock::new(HashMap::new()),
            cancels: std::sync::Mutex::new(HashMap::new()),
            state_lock: Mutex::new(()),
            replay_lock: Mutex::new(()),
            this: this.clone(),
        })
    }

    // --- Device registry ---

    /// Make a device eligible for upgrades.
    pub fn register_device(&self, device: Arc<DeviceConnection>) {
        self.devices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device.id().to_string(), device);
    }

    pub fn unregister_device(&self, device_id: &str) -> Option<Arc<DeviceConnection>> {
        self.devices
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id)
    }

    pub fn device(&self, device_id: &str) -> Option<Arc<DeviceConnection>> {
        self.devices
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned()
    }

    // --- Record helpers ---

    fn load(&self, device_id: &str) -> Result<UpgradeState> {
        Ok(self
            .ctx
            .store
            .load_state(device_id)?
            .unwrap_or_else(|| UpgradeState::idle(device_id)))
    }

    async fn update(
        &self,
        device_id: &str,
        f: impl FnOnce(&mut UpgradeState) + Send,
    ) -> Result<UpgradeState> {
        let _guard = self.state_lock.lock().await;
        let mut state = self.load(device_id)?;
        f(&mut state);
        self.ctx.store.save_state(&state)?;
        Ok(state)
    }

    fn notify(&self, state: &UpgradeState) {
        match &state.error_message {
            Some(message) => info!(device = %state.device_id, state = %state.state, "Upgrade state: {}", message),
            None => info!(device = %state.device_id, state = %state.state, "Upgrade state"),
        }
        self.ctx.delegate.upgrade_state_changed(
            &state.device_id,
            state.state,
            state.error_message.as_deref(),
        );
    }

    fn fresh_token(&self, device_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device_id.to_string(), token.clone());
        token
    }

    fn token(&self, device_id: &str) -> CancellationToken {
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    fn forget_token(&self, device_id: &str) {
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id);
    }

    /// Current record of a device; `Idle` if none was saved.
    pub fn state(&self, device_id: &str) -> Result<UpgradeState> {
        self.load(device_id)
    }

    /// Whether a new upgrade may be scheduled on the device.
    pub fn can_schedule_upgrade(&self, device_id: &str) -> Result<bool> {
        Ok(self.load(device_id)?.state.accepts_new_job())
    }

    // --- Commands ---

    /// Record `job` in state `next` unless another upgrade is running.
    ///
    /// The check and the write happen under one lock acquisition, so of two
    /// commands racing for a device only one is accepted.
    async fn try_schedule(
        &self,
        job: &UpgradeJob,
        next: UpgradeStatus,
    ) -> Result<Option<UpgradeState>> {
        let _guard = self.state_lock.lock().await;
        let mut state = self.load(&job.device_id)?;
        if !state.state.accepts_new_job() {
            return Ok(None);
        }
        state.reset();
        job.apply(&mut state);
        state.state = next;
        state.start_time = Some(unix_now());
        self.ctx.store.save_state(&state)?;
        Ok(Some(state))
    }

    /// Move a `Scheduled` record holding `transaction_id` to `Downloading`.
    async fn claim_scheduled(
        &self,
        device_id: &str,
        transaction_id: &str,
    ) -> Result<Option<UpgradeState>> {
        let _guard = self.state_lock.lock().await;
        let mut state = self.load(device_id)?;
        if state.state != UpgradeStatus::Scheduled
            || state.transaction_id.as_deref() != Some(transaction_id)
        {
            return Ok(None);
        }
        state.state = UpgradeStatus::Downloading;
        state.canceled = false;
        self.ctx.store.save_state(&state)?;
        Ok(Some(state))
    }

    /// Accept an upgrade command from the cloud.
    ///
    /// A device whose record is neither `Idle` nor `Scheduled` rejects the
    /// command; the new transaction is reported as failed and the running
    /// job is left untouched. Accepted commands are acknowledged and either
    /// started in the background or left `Scheduled` while the host is not
    /// in the foreground. A started job is recorded as `Downloading` before
    /// this returns.
    #[tracing::instrument(level = "info", skip_all, fields(device = %job.device_id, transaction = %job.transaction_id))]
    pub async fn handle_upgrade_command(&self, job: UpgradeJob) -> Result<CommandDisposition> {
        let start_now = self.ctx.app.is_foreground();
        let next = if start_now {
            UpgradeStatus::Downloading
        } else {
            UpgradeStatus::Scheduled
        };
        let Some(state) = self.try_schedule(&job, next).await? else {
            warn!("Rejecting upgrade command, another upgrade is running");
            self.report_outcome(
                &job.transaction_id,
                None,
                TransactionOutcome::Failed,
                Some(UpgradeError::AlreadyInProgress.to_string()),
            )
            .await?;
            return Ok(CommandDisposition::Rejected);
        };
        if start_now {
            self.ctx
                .delegate
                .upgrade_state_changed(&job.device_id, UpgradeStatus::Scheduled, None);
        }
        self.notify(&state);

        if !self.ctx.cloud.report_received(&job.transaction_id).await {
            warn!("Failed to acknowledge transaction");
        }

        if !start_now {
            info!("Host in background, upgrade scheduled");
            return Ok(CommandDisposition::Scheduled);
        }
        self.spawn_download(job);
        Ok(CommandDisposition::Started)
    }

    /// Run the download of a job whose record is already `Downloading`.
    fn spawn_download(&self, job: UpgradeJob) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let cancel = self.fresh_token(&job.device_id);
        tokio::spawn(async move {
            let device_id = job.device_id.clone();
            if let Err(e) = this.download(job, cancel).await {
                error!(device = %device_id, "Upgrade job aborted: {}", e);
            }
        });
    }

    /// Record a job without starting it.
    pub async fn scheduled_state(&self, job: UpgradeJob) -> Result<()> {
        let state = self
            .try_schedule(&job, UpgradeStatus::Scheduled)
            .await?
            .ok_or(Error::Upgrade(UpgradeError::AlreadyInProgress))?;
        self.notify(&state);
        Ok(())
    }

    /// Start every scheduled job; called when the host comes to the foreground.
    ///
    /// Each record is moved to `Downloading` before its task is spawned, so a
    /// second call does not start the same job again.
    pub async fn start_scheduled(&self) -> Result<usize> {
        let mut started = 0;
        for state in self.ctx.store.all_states()? {
            if state.state != UpgradeStatus::Scheduled {
                continue;
            }
            let Some(job) = UpgradeJob::from_state(&state) else {
                warn!(device = %state.device_id, "Scheduled upgrade is missing job fields");
                continue;
            };
            let Some(claimed) = self
                .claim_scheduled(&job.device_id, &job.transaction_id)
                .await?
            else {
                continue;
            };
            self.notify(&claimed);
            self.spawn_download(job);
            started += 1;
        }
        Ok(started)
    }

    /// Download and verify the image, then continue with preparing.
    #[tracing::instrument(level = "info", skip_all, fields(device = %job.device_id))]
    pub async fn downloading_state(&self, job: UpgradeJob) -> Result<()> {
        let device_id = job.device_id.as_str();
        let cancel = self.fresh_token(device_id);

        let state = self
            .update(device_id, |s| {
                if s.transaction_id.as_deref() != Some(job.transaction_id.as_str()) {
                    s.reset();
                    s.start_time = Some(unix_now());
                }
                job.apply(s);
                s.state = UpgradeStatus::Downloading;
                s.canceled = false;
                s.error_message = None;
            })
            .await?;
        self.notify(&state);
        self.download(job, cancel).await
    }

    async fn download(&self, job: UpgradeJob, cancel: CancellationToken) -> Result<()> {
        let device_id = job.device_id.as_str();
        let delegate = self.ctx.delegate.clone();
        let cloud = self.ctx.cloud.clone();
        let watched = cancel.clone();
        let owner = job.device_id.clone();
        let token = job.file_token.clone();
        let progress = move |fraction: f32| {
            delegate.upgrade_progress(&owner, UpgradeStatus::Downloading, fraction);
            if watched.is_cancelled() {
                cloud.cancel_download(&token);
            }
        };

        let downloaded = self
            .ctx
            .cloud
            .download_file(&job.transaction_id, &job.file_token, &progress)
            .await;

        if cancel.is_cancelled() {
            if let Ok(path) = &downloaded {
                remove_firmware(path).await;
            }
            return self.error_state(device_id, UpgradeError::Canceled).await;
        }
        let path = match downloaded {
            Ok(path) => path,
            Err(e) => {
                return self
                    .error_state(device_id, UpgradeError::DownloadFailed(e.to_string()))
                    .await;
            }
        };

        let image = match tokio::fs::read(&path).await {
            Ok(image) => image,
            Err(e) => {
                remove_firmware(&path).await;
                return self
                    .error_state(device_id, UpgradeError::DownloadFailed(e.to_string()))
                    .await;
            }
        };
        let digest = hex_digest(Md5::digest(&image).as_slice());
        if !digest.eq_ignore_ascii_case(job.md5.trim()) {
            warn!(expected = %job.md5, actual = %digest, "Firmware digest mismatch");
            remove_firmware(&path).await;
            return self.error_state(device_id, UpgradeError::Md5CheckFailed).await;
        }
        debug!(bytes = image.len(), "Firmware image verified");

        let location = path.to_string_lossy().into_owned();
        self.update(device_id, |s| s.firmware_file_location = Some(location))
            .await?;
        self.preparing_state(device_id).await
    }

    /// Check that the device can take the image, reconnecting if needed.
    #[tracing::instrument(level = "info", skip_all, fields(device = %device_id))]
    pub async fn preparing_state(&self, device_id: &str) -> Result<()> {
        let state = self
            .update(device_id, |s| s.state = UpgradeStatus::Preparing)
            .await?;
        self.notify(&state);

        if state.canceled || self.token(device_id).is_cancelled() {
            return self.error_state(device_id, UpgradeError::Canceled).await;
        }
        if !self.ctx.transport.is_powered().await {
            return self.error_state(device_id, UpgradeError::BluetoothDisabled).await;
        }
        let Some(device) = self.device(device_id) else {
            return self.error_state(device_id, UpgradeError::DeviceNotRegistered).await;
        };
        let family = device.family();
        if !family.supports_upgrade() {
            return self.error_state(device_id, UpgradeError::UnsupportedFamily).await;
        }
        if !device
            .model()
            .is_some_and(|model| family.model_supports_upgrade(model))
        {
            return self.error_state(device_id, UpgradeError::UnsupportedModel).await;
        }

        if !device.is_connected_now().await {
            info!("Device not connected, trying to reconnect");
            let conn = device.clone();
            tokio::spawn(async move {
                if let Err(e) = conn.enable().await {
                    debug!("Reconnect before upgrade failed: {}", e);
                }
            });
            sleep(self.config.prepare_reconnect_delay).await;
            if !device.is_connected_now().await {
                return self.error_state(device_id, UpgradeError::FailedToConnect).await;
            }
        }

        self.upgrading_state(device_id).await
    }

    /// Transfer the downloaded image to the device.
    #[tracing::instrument(level = "info", skip_all, fields(device = %device_id))]
    pub async fn upgrading_state(&self, device_id: &str) -> Result<()> {
        let state = self
            .update(device_id, |s| s.state = UpgradeStatus::Upgrading)
            .await?;
        self.notify(&state);

        let Some(device) = self.device(device_id) else {
            return self.error_state(device_id, UpgradeError::DeviceNotRegistered).await;
        };
        let Some(location) = state.firmware_file_location.clone() else {
            return self
                .error_state(device_id, UpgradeError::InvalidJob("no firmware file".into()))
                .await;
        };
        let image = match tokio::fs::read(&location).await {
            Ok(image) => image,
            Err(e) => {
                return self
                    .error_state(
                        device_id,
                        UpgradeError::InvalidJob(format!("cannot read firmware: {e}")),
                    )
                    .await;
            }
        };

        let cancel = self.token(device_id);
        let delegate = self.ctx.delegate.clone();
        let owner = device_id.to_string();
        let progress = move |fraction: f32| {
            delegate.upgrade_progress(&owner, UpgradeStatus::Upgrading, fraction);
        };

        match device.upgrade_firmware(&image, progress, &cancel).await {
            Ok(report) => {
                info!(
                    bytes = report.bytes_sent,
                    packages = report.packages_sent,
                    implicit = report.implicit,
                    "Firmware transferred"
                );
                self.schedule_reconnect(device);
                self.success_state(device_id).await
            }
            Err(e) => self.error_state(device_id, e).await,
        }
    }

    /// The device reboots after flashing; bring it back once it had time to.
    fn schedule_reconnect(&self, device: Arc<DeviceConnection>) {
        let delay = self.config.post_upgrade_reconnect_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            if !device.is_connected().await {
                info!(device = %device.name(), "Reconnecting after upgrade");
                if let Err(e) = device.enable().await {
                    warn!(device = %device.name(), "Reconnect after upgrade failed: {}", e);
                }
            }
        });
    }

    /// Mark the job successful and report it.
    pub async fn success_state(&self, device_id: &str) -> Result<()> {
        let state = self
            .update(device_id, |s| {
                s.state = UpgradeStatus::Success;
                s.canceled = false;
                s.error_message = None;
            })
            .await?;
        self.notify(&state);
        self.finish(device_id).await
    }

    /// Mark the job failed with `reason` and report it.
    pub async fn error_state(&self, device_id: &str, reason: UpgradeError) -> Result<()> {
        let message = reason.to_string();
        let state = self
            .update(device_id, |s| {
                s.state = UpgradeStatus::Error;
                s.canceled = false;
                s.error_message = Some(message);
            })
            .await?;
        self.notify(&state);
        self.finish(device_id).await
    }

    /// Report the terminal state of a job; reset it once the report is
    /// delivered.
    async fn finish(&self, device_id: &str) -> Result<()> {
        let state = self.load(device_id)?;
        let Some(transaction_id) = state.transaction_id.clone() else {
            return self.reset_to_idle(device_id).await;
        };
        let outcome = if state.state == UpgradeStatus::Success {
            TransactionOutcome::Succeeded
        } else {
            TransactionOutcome::Failed
        };
        let delivered = self
            .report_outcome(
                &transaction_id,
                Some(device_id),
                outcome,
                state.error_message.clone(),
            )
            .await?;
        if delivered {
            self.reset_to_idle(device_id).await?;
        }
        Ok(())
    }

    async fn reset_to_idle(&self, device_id: &str) -> Result<()> {
        let (state, file) = {
            let _guard = self.state_lock.lock().await;
            let mut state = self.load(device_id)?;
            let file = state.firmware_file_location.take();
            state.reset();
            self.ctx.store.save_state(&state)?;
            (state, file)
        };
        if let Some(file) = file {
            remove_firmware(Path::new(&file)).await;
        }
        self.forget_token(device_id);
        self.notify(&state);
        Ok(())
    }

    /// Deliver a report now, or queue it for replay.
    ///
    /// Returns `true` if the cloud accepted the report.
    async fn report_outcome(
        &self,
        transaction_id: &str,
        device_id: Option<&str>,
        outcome: TransactionOutcome,
        message: Option<String>,
    ) -> Result<bool> {
        if self
            .deliver(transaction_id, outcome, message.as_deref())
            .await
        {
            return Ok(true);
        }
        info!(transaction = %transaction_id, outcome = outcome.as_str(), "Queueing report for replay");
        self.ctx.store.push_pending(&PendingTransaction {
            transaction_id: transaction_id.to_string(),
            device_id: device_id.map(str::to_string),
            outcome,
            message,
            queued_at: unix_now(),
        })?;
        Ok(false)
    }

    async fn deliver(
        &self,
        transaction_id: &str,
        outcome: TransactionOutcome,
        message: Option<&str>,
    ) -> bool {
        if !self.ctx.cloud.is_reachable() {
            return false;
        }
        match outcome {
            TransactionOutcome::Succeeded => self.ctx.cloud.report_succeeded(transaction_id).await,
            TransactionOutcome::Failed => {
                self.ctx
                    .cloud
                    .report_failed(transaction_id, message.unwrap_or("Upgrade failed"))
                    .await
            }
        }
    }

    /// Request cancellation of a running job.
    ///
    /// Returns `false` if the job is not in a cancelable state. The job
    /// observes the request at its next block or phase boundary.
    pub async fn cancel_upgrade(&self, device_id: &str) -> Result<bool> {
        let state = {
            let _guard = self.state_lock.lock().await;
            let mut state = self.load(device_id)?;
            if !state.state.is_cancelable() {
                return Ok(false);
            }
            state.canceled = true;
            self.ctx.store.save_state(&state)?;
            state
        };
        info!(device = %device_id, state = %state.state, "Cancelling upgrade");
        self.token(device_id).cancel();
        if state.state == UpgradeStatus::Downloading {
            if let Some(token) = &state.file_token {
                self.ctx.cloud.cancel_download(token);
            }
        }
        Ok(true)
    }

    // --- Restart recovery ---

    /// Reconcile records left behind by a previous run.
    ///
    /// Jobs caught scheduling or downloading fail as interrupted. Jobs caught
    /// preparing or transferring are returned, and announced to the delegate,
    /// so the user can resume or abandon them. Terminal records whose report
    /// is not queued are reported again.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn recover(&self) -> Result<Vec<String>> {
        let queued: HashSet<String> = self
            .ctx
            .store
            .pending_transactions()?
            .into_iter()
            .map(|p| p.transaction_id)
            .collect();

        let mut resumable = Vec::new();
        for state in self.ctx.store.all_states()? {
            let device_id = state.device_id.clone();
            match state.state {
                UpgradeStatus::Idle => {}
                UpgradeStatus::Scheduled | UpgradeStatus::Downloading => {
                    warn!(device = %device_id, state = %state.state, "Upgrade interrupted by restart");
                    self.error_state(&device_id, UpgradeError::Interrupted).await?;
                }
                UpgradeStatus::Preparing | UpgradeStatus::Upgrading => {
                    info!(device = %device_id, state = %state.state, "Upgrade can be resumed");
                    self.ctx.delegate.resumable_upgrade(&device_id, state.state);
                    resumable.push(device_id);
                }
                UpgradeStatus::Success | UpgradeStatus::Error => {
                    let already_queued = state
                        .transaction_id
                        .as_ref()
                        .is_some_and(|t| queued.contains(t));
                    if !already_queued {
                        self.finish(&device_id).await?;
                    }
                }
            }
        }

        if self.ctx.cloud.is_reachable() {
            self.replay_pending().await?;
        }
        Ok(resumable)
    }

    fn ensure_interrupted(&self, device_id: &str) -> Result<()> {
        let state = self.load(device_id)?;
        if matches!(
            state.state,
            UpgradeStatus::Preparing | UpgradeStatus::Upgrading
        ) {
            Ok(())
        } else {
            Err(Error::Upgrade(UpgradeError::InvalidJob(format!(
                "no interrupted upgrade for {device_id} (state {})",
                state.state
            ))))
        }
    }

    /// Retry an interrupted transfer from the preparing step.
    pub async fn resume_upgrade(&self, device_id: &str) -> Result<()> {
        self.ensure_interrupted(device_id)?;
        self.fresh_token(device_id);
        self.update(device_id, |s| s.canceled = false).await?;
        self.preparing_state(device_id).await
    }

    /// Give up on an interrupted transfer and report it as failed.
    pub async fn abandon_upgrade(&self, device_id: &str) -> Result<()> {
        self.ensure_interrupted(device_id)?;
        self.error_state(device_id, UpgradeError::Abandoned).await
    }

    // --- Offline replay ---

    /// React to a change in cloud reachability.
    pub async fn on_reachability_changed(&self, reachable: bool) -> Result<usize> {
        if !reachable {
            debug!("Cloud unreachable");
            return Ok(0);
        }
        self.replay_pending().await
    }

    /// Deliver queued reports, oldest first.
    ///
    /// Each delivered report is removed from the queue, and the record it
    /// belongs to is reset if it still holds that transaction.
    pub async fn replay_pending(&self) -> Result<usize> {
        let _replay = self.replay_lock.lock().await;
        let mut delivered = 0;

        for pending in self.ctx.store.pending_transactions()? {
            if !self.ctx.cloud.is_reachable() {
                break;
            }
            if !self
                .deliver(
                    &pending.transaction_id,
                    pending.outcome,
                    pending.message.as_deref(),
                )
                .await
            {
                debug!(transaction = %pending.transaction_id, "Replay not accepted, keeping it queued");
                continue;
            }
            self.ctx.store.remove_pending(&pending.transaction_id)?;
            delivered += 1;

            if let Some(device_id) = &pending.device_id {
                let state = self.load(device_id)?;
                let same_job = state.transaction_id.as_deref() == Some(pending.transaction_id.as_str());
                if same_job
                    && matches!(state.state, UpgradeStatus::Success | UpgradeStatus::Error)
                {
                    self.reset_to_idle(device_id).await?;
                }
            }
        }

        if delivered > 0 {
            info!("Replayed {} queued reports", delivered);
        }
        Ok(delivered)
    }
}

async fn remove_firmware(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed firmware image"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove firmware image: {}", e),
    }
}
