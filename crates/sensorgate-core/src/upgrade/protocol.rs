//! Block-oriented firmware transfer over the debug characteristic.
//!
//! The exchange with the bootloader is:
//!
//! 1. gateway writes `b"upgradeFw" || len:u32le || crc:u32le`
//! 2. device echoes the 4 CRC bytes
//! 3. gateway streams the image in blocks of at most 16 bytes, one block per
//!    tick of a 90 Hz timer, without waiting for acknowledgements
//! 4. device answers a single `0x01` byte once the whole image arrived
//!
//! [`TransferSession`] is the pure state machine. [`UpgradeEngine`] drives it
//! against a [`Transport`] with timers, cancellation and progress reporting.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::UpgradeError;
use crate::traits::AppState;
use crate::transport::{PeripheralHandle, Transport};
use crate::upgrade::crc::crc32;

/// ASCII command that opens a transfer.
pub const UPGRADE_COMMAND: &[u8] = b"upgradeFw";

/// Byte the bootloader sends once the image is complete.
pub const FINISH_ACK: u8 = 0x01;

/// Length of the start frame.
pub const START_FRAME_LEN: usize = UPGRADE_COMMAND.len() + 8;

/// Timing and sizing of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeConfig {
    /// How long to wait for an acknowledgement, re-armed after every block.
    pub response_timeout: Duration,
    /// Interval between block writes.
    pub block_interval: Duration,
    /// Largest block written in one go.
    pub block_size: usize,
    /// Timeout of the acknowledged start-frame write.
    pub write_timeout: Duration,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            block_interval: Duration::from_nanos(1_000_000_000 / 90),
            block_size: 16,
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl UpgradeConfig {
    #[must_use]
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    #[must_use]
    pub fn block_interval(mut self, interval: Duration) -> Self {
        self.block_interval = interval;
        self
    }

    #[must_use]
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size.max(1);
        self
    }
}

/// Phase of a transfer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPhase {
    None,
    Started,
    AckCrcWait,
    DataUpload,
    AckFinishWait,
    Finished,
    Error(UpgradeError),
}

impl TransferPhase {
    /// Whether the session can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferPhase::Finished | TransferPhase::Error(_))
    }
}

/// Build the frame that opens a transfer.
pub fn start_frame(length: u32, crc: u32) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(START_FRAME_LEN);
    frame.put_slice(UPGRADE_COMMAND);
    frame.put_u32_le(length);
    frame.put_u32_le(crc);
    frame.to_vec()
}

/// State of one firmware transfer, independent of any I/O.
#[derive(Debug, Clone)]
pub struct TransferSession {
    image: Vec<u8>,
    crc: u32,
    block_size: usize,
    bytes_sent: usize,
    packages_sent: usize,
    phase: TransferPhase,
    implicit_finish: bool,
}

impl TransferSession {
    /// Prepare a session; the image is truncated to a multiple of 4 bytes.
    pub fn new(data: &[u8], block_size: usize) -> Self {
        let aligned = data.len() & !3;
        let image = data[..aligned].to_vec();
        let crc = crc32(&image);
        Self {
            image,
            crc,
            block_size: block_size.max(1),
            bytes_sent: 0,
            packages_sent: 0,
            phase: TransferPhase::None,
            implicit_finish: false,
        }
    }

    pub fn phase(&self) -> &TransferPhase {
        &self.phase
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    /// Length of the aligned image.
    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn packages_sent(&self) -> usize {
        self.packages_sent
    }

    /// Whether the session finished on a background timeout rather than an
    /// explicit acknowledgement.
    pub fn finished_implicitly(&self) -> bool {
        self.implicit_finish
    }

    /// Fraction of the image sent so far.
    pub fn progress(&self) -> f32 {
        if self.image.is_empty() {
            return 1.0;
        }
        self.bytes_sent as f32 / self.image.len() as f32
    }

    fn fail(&mut self, error: UpgradeError) {
        if !self.phase.is_terminal() {
            self.phase = TransferPhase::Error(error);
        }
    }

    /// Open the session and return the start frame to send.
    pub fn start(&mut self) -> Result<Vec<u8>, UpgradeError> {
        if self.phase != TransferPhase::None {
            return Err(UpgradeError::AlreadyInProgress);
        }
        if self.crc == 0 {
            self.fail(UpgradeError::WrongCrc);
            return Err(UpgradeError::WrongCrc);
        }
        self.phase = TransferPhase::Started;
        Ok(start_frame(self.image.len() as u32, self.crc))
    }

    /// The start frame reached the device; wait for the CRC echo.
    pub fn command_sent(&mut self) {
        if self.phase == TransferPhase::Started {
            self.phase = TransferPhase::AckCrcWait;
        }
    }

    /// Feed bytes received on the debug characteristic.
    ///
    /// Returns `true` if the bytes moved the session forward or failed it.
    /// Bytes outside an acknowledgement phase are ignored.
    pub fn on_response(&mut self, bytes: &[u8]) -> bool {
        match self.phase {
            TransferPhase::AckCrcWait => {
                let Ok(echo) = <[u8; 4]>::try_from(bytes) else {
                    self.fail(UpgradeError::UnexpectedResponse);
                    return true;
                };
                let received = u32::from_le_bytes(echo);
                if received != self.crc {
                    self.fail(UpgradeError::WrongCrcReceived {
                        expected: self.crc,
                        received,
                    });
                } else {
                    self.bytes_sent = 0;
                    self.packages_sent = 0;
                    self.phase = TransferPhase::DataUpload;
                }
                true
            }
            TransferPhase::AckFinishWait => match bytes {
                [FINISH_ACK] => {
                    self.phase = TransferPhase::Finished;
                    true
                }
                [_] => {
                    self.fail(UpgradeError::UnexpectedFinishByte);
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Next block to send during upload.
    ///
    /// Handing out the last block moves the session to
    /// [`TransferPhase::AckFinishWait`], so the finish byte is accepted even
    /// if it arrives right after the final write.
    pub fn next_block(&mut self) -> Option<Vec<u8>> {
        if self.phase != TransferPhase::DataUpload {
            return None;
        }
        if self.bytes_sent >= self.image.len() {
            self.phase = TransferPhase::AckFinishWait;
            return None;
        }
        let end = (self.bytes_sent + self.block_size).min(self.image.len());
        let block = self.image[self.bytes_sent..end].to_vec();
        self.bytes_sent = end;
        self.packages_sent += 1;
        if self.bytes_sent >= self.image.len() {
            self.phase = TransferPhase::AckFinishWait;
        }
        Some(block)
    }

    /// The response timer expired.
    ///
    /// A missing finish acknowledgement while the host is in the background
    /// is taken as success; background hosts often miss the last
    /// notification even though the device flashed the image.
    pub fn on_timeout(&mut self, foreground: bool) {
        match self.phase {
            TransferPhase::AckFinishWait if !foreground => {
                warn!("No finish acknowledgement while in background, assuming success");
                self.implicit_finish = true;
                self.phase = TransferPhase::Finished;
            }
            TransferPhase::Started
            | TransferPhase::AckCrcWait
            | TransferPhase::DataUpload
            | TransferPhase::AckFinishWait => {
                self.fail(UpgradeError::DataTransmissionTimeout);
            }
            _ => {}
        }
    }

    /// The link dropped.
    pub fn on_disconnected(&mut self) {
        self.fail(UpgradeError::CantSendDeviceIsNotConnected);
    }

    /// The user cancelled.
    pub fn cancel(&mut self) {
        self.fail(UpgradeError::Canceled);
    }

    /// A write failed.
    pub fn on_write_error(&mut self, message: String) {
        self.fail(UpgradeError::Transport(message));
    }
}

/// Summary of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub crc: u32,
    pub bytes_sent: usize,
    pub packages_sent: usize,
    /// Finished on a background timeout instead of an explicit `0x01`.
    pub implicit: bool,
}

/// Drives a [`TransferSession`] over a transport.
pub struct UpgradeEngine {
    transport: Arc<dyn Transport>,
    app: Arc<dyn AppState>,
    handle: PeripheralHandle,
    characteristic: Uuid,
    config: UpgradeConfig,
}

impl UpgradeEngine {
    pub fn new(
        transport: Arc<dyn Transport>,
        app: Arc<dyn AppState>,
        handle: PeripheralHandle,
        characteristic: Uuid,
        config: UpgradeConfig,
    ) -> Self {
        Self {
            transport,
            app,
            handle,
            characteristic,
            config,
        }
    }

    /// Transfer `data` to the device.
    ///
    /// `responses` carries raw values received on the debug characteristic,
    /// in arrival order. `cancel` is checked once per block.
    #[tracing::instrument(level = "info", skip_all, fields(handle = %self.handle, len = data.len()))]
    pub async fn run<F>(
        &self,
        data: &[u8],
        mut responses: mpsc::UnboundedReceiver<Vec<u8>>,
        progress: F,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, UpgradeError>
    where
        F: Fn(f32) + Send + Sync,
    {
        let mut session = TransferSession::new(data, self.config.block_size);
        let frame = session.start()?;

        if !self.transport.is_connected(&self.handle).await {
            return Err(UpgradeError::CantSendDeviceIsNotConnected);
        }
        info!("Starting firmware transfer, crc {:#010x}", session.crc());
        self.transport
            .write(
                &self.handle,
                self.characteristic,
                &frame,
                true,
                self.config.write_timeout,
            )
            .await
            .map_err(|e| UpgradeError::Transport(e.to_string()))?;
        session.command_sent();

        let mut deadline = Instant::now() + self.config.response_timeout;
        let mut ticker = interval(self.config.block_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            match session.phase() {
                TransferPhase::Finished => {
                    progress(1.0);
                    info!(
                        bytes = session.bytes_sent(),
                        packages = session.packages_sent(),
                        "Firmware transfer finished"
                    );
                    return Ok(TransferReport {
                        crc: session.crc(),
                        bytes_sent: session.bytes_sent(),
                        packages_sent: session.packages_sent(),
                        implicit: session.finished_implicitly(),
                    });
                }
                TransferPhase::Error(error) => {
                    warn!("Firmware transfer failed: {}", error);
                    return Err(error.clone());
                }
                _ => {}
            }

            let uploading = *session.phase() == TransferPhase::DataUpload;

            tokio::select! {
                biased;

                Some(bytes) = responses.recv() => {
                    let was_waiting_crc = *session.phase() == TransferPhase::AckCrcWait;
                    if !session.on_response(&bytes) {
                        debug!(len = bytes.len(), "Ignoring out-of-phase response");
                    }
                    if was_waiting_crc && *session.phase() == TransferPhase::DataUpload {
                        debug!("CRC acknowledged, uploading blocks");
                        deadline = Instant::now() + self.config.response_timeout;
                        ticker.reset();
                    }
                }

                _ = ticker.tick(), if uploading => {
                    if cancel.is_cancelled() {
                        session.cancel();
                        continue;
                    }
                    if !self.transport.is_connected(&self.handle).await {
                        session.on_disconnected();
                        continue;
                    }
                    if let Some(block) = session.next_block() {
                        if let Err(e) = self
                            .transport
                            .write(&self.handle, self.characteristic, &block, false, self.config.write_timeout)
                            .await
                        {
                            session.on_write_error(e.to_string());
                            continue;
                        }
                        progress(session.progress());
                    }
                    deadline = Instant::now() + self.config.response_timeout;
                }

                _ = sleep_until(deadline) => {
                    session.on_timeout(self.app.is_foreground());
                }
            }
        }
    }
}
