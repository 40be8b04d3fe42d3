//! HTTP implementation of [`CloudApi`].
//!
//! Endpoints, relative to the configured base URL:
//!
//! | Call | Request |
//! |------|---------|
//! | download | `GET /transactions/{tx}/files/{token}` |
//! | received | `POST /transactions/{tx}/received` |
//! | succeeded | `POST /transactions/{tx}/succeeded` |
//! | failed | `POST /transactions/{tx}/failed` with `{"message": ...}` |
//! | reachability probe | `GET /health` |
//!
//! # Example
//!
//! ```no_run
//! use sensorgate_core::cloud_client::{CloudClientConfig, HttpCloudClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpCloudClient::new(CloudClientConfig::new(
//!     "https://iot.example.com/api",
//!     "/var/lib/sensorgate/firmware",
//! ))?;
//! client.probe().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::traits::CloudApi;

/// Settings for [`HttpCloudClient`].
#[derive(Debug, Clone)]
pub struct CloudClientConfig {
    pub base_url: String,
    /// Directory downloaded images are written to.
    pub download_dir: PathBuf,
    pub request_timeout: Duration,
    /// Optional bearer token sent with every request.
    pub api_key: Option<String>,
}

impl CloudClientConfig {
    pub fn new(base_url: impl Into<String>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            download_dir: download_dir.into(),
            request_timeout: Duration::from_secs(30),
            api_key: None,
        }
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

#[derive(Serialize)]
struct FailureBody<'a> {
    message: &'a str,
}

/// Cloud client over HTTP.
pub struct HttpCloudClient {
    client: Client,
    config: CloudClientConfig,
    reachable: AtomicBool,
    downloads: Mutex<HashMap<String, CancellationToken>>,
}

impl HttpCloudClient {
    pub fn new(mut config: CloudClientConfig) -> Result<Self> {
        config.base_url = config.base_url.trim_end_matches('/').to_string();
        if !config.base_url.starts_with("http://") && !config.base_url.starts_with("https://") {
            return Err(Error::invalid_config(format!(
                "cloud URL must start with http:// or https://, got: {}",
                config.base_url
            )));
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::Cloud(e.to_string()))?;

        Ok(Self {
            client,
            config,
            reachable: AtomicBool::new(false),
            downloads: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Check the health endpoint and update the reachability flag.
    ///
    /// Returns the new reachability.
    pub async fn probe(&self) -> bool {
        let url = format!("{}/health", self.config.base_url);
        let reachable = match self.request(self.client.get(&url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Cloud probe failed: {}", e);
                false
            }
        };
        self.reachable.store(reachable, Ordering::SeqCst);
        reachable
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn downloads(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.downloads.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn post_report(&self, transaction_id: &str, outcome: &str, message: Option<&str>) -> bool {
        let url = format!(
            "{}/transactions/{}/{}",
            self.config.base_url, transaction_id, outcome
        );
        let mut builder = self.request(self.client.post(&url));
        if let Some(message) = message {
            builder = builder.json(&FailureBody { message });
        }

        match builder.send().await {
            Ok(response) if response.status().is_success() => {
                self.reachable.store(true, Ordering::SeqCst);
                true
            }
            Ok(response) => {
                warn!(
                    "Cloud rejected {} report for {}: {}",
                    outcome,
                    transaction_id,
                    response.status()
                );
                false
            }
            Err(e) => {
                warn!("Failed to send {} report for {}: {}", outcome, transaction_id, e);
                if e.is_connect() || e.is_timeout() {
                    self.reachable.store(false, Ordering::SeqCst);
                }
                false
            }
        }
    }

    async fn fetch(
        &self,
        url: &str,
        path: &PathBuf,
        cancel: &CancellationToken,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<()> {
        let mut response = self
            .request(self.client.get(url))
            .send()
            .await
            .map_err(|e| Error::Cloud(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::Cloud(format!(
                "download failed with status {}",
                response.status()
            )));
        }

        let total = response.content_length();
        let mut received: u64 = 0;
        let mut file = tokio::fs::File::create(path).await?;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                chunk = response.chunk() => chunk.map_err(|e| Error::Cloud(e.to_string()))?,
            };
            let Some(chunk) = chunk else { break };
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(total) = total.filter(|t| *t > 0) {
                progress((received as f32 / total as f32).min(1.0));
            }
        }
        file.flush().await?;
        progress(1.0);
        Ok(())
    }
}

/// File tokens name the image on disk, so they are limited to
/// `[A-Za-z0-9_-]`.
fn is_valid_file_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[async_trait]
impl CloudApi for HttpCloudClient {
    async fn download_file(
        &self,
        transaction_id: &str,
        file_token: &str,
        progress: &(dyn Fn(f32) + Send + Sync),
    ) -> Result<PathBuf> {
        if !is_valid_file_token(file_token) {
            return Err(Error::Cloud(format!("invalid file token {file_token:?}")));
        }
        let url = format!(
            "{}/transactions/{}/files/{}",
            self.config.base_url, transaction_id, file_token
        );
        tokio::fs::create_dir_all(&self.config.download_dir).await?;
        let path = self.config.download_dir.join(format!("{file_token}.bin"));

        let cancel = CancellationToken::new();
        self.downloads()
            .insert(file_token.to_string(), cancel.clone());

        let result = self.fetch(&url, &path, &cancel, progress).await;
        self.downloads().remove(file_token);

        match result {
            Ok(()) => Ok(path),
            Err(e) => {
                if let Err(remove) = tokio::fs::remove_file(&path).await
                    && remove.kind() != std::io::ErrorKind::NotFound
                {
                    warn!("Failed to remove partial download {}: {}", path.display(), remove);
                }
                Err(e)
            }
        }
    }

    fn cancel_download(&self, file_token: &str) {
        if let Some(cancel) = self.downloads().get(file_token) {
            cancel.cancel();
        }
    }

    async fn report_received(&self, transaction_id: &str) -> bool {
        self.post_report(transaction_id, "received", None).await
    }

    async fn report_succeeded(&self, transaction_id: &str) -> bool {
        self.post_report(transaction_id, "succeeded", None).await
    }

    async fn report_failed(&self, transaction_id: &str, message: &str) -> bool {
        self.post_report(transaction_id, "failed", Some(message)).await
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}
