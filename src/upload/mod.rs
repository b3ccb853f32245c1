//! Remote delivery of the encrypted artifact.

pub mod auth;
pub mod drive;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use auth::ServiceAccountKey;
pub use drive::DriveStore;

use crate::errors::{TransferError, UploadError};

/// Where an artifact goes and the credential allowed to write there.
#[derive(Debug, Clone, Copy)]
pub struct UploadTarget<'a> {
    pub folder_id: &'a str,
    pub credential: &'a ServiceAccountKey,
    /// Transfer granularity hint; stores round it to what their protocol allows.
    pub chunk_size: usize,
}

/// Identifier the store assigned to a finished upload. Only used for logs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteObject {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// One upload attempt against a remote store.
///
/// An implementation must not publish anything under `name` unless the whole
/// file was transferred.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_file(
        &self,
        source: &Path,
        name: &str,
        target: &UploadTarget<'_>,
    ) -> Result<RemoteObject, TransferError>;
}

/// How many times to try, how long to wait in between, and which failures
/// deserve another try at all.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: u32,
    pub is_transient: fn(&TransferError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2,
            is_transient: TransferError::is_transient,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    pub fn should_retry(&self, error: &TransferError, attempt: u32) -> bool {
        attempt < self.max_attempts && (self.is_transient)(error)
    }
}

/// Drives an [`ObjectStore`] under a retry policy, an overall deadline and
/// a cancellation token.
pub struct Uploader<'a> {
    store: &'a dyn ObjectStore,
    policy: RetryPolicy,
    timeout: Duration,
}

impl<'a> Uploader<'a> {
    pub fn new(store: &'a dyn ObjectStore, policy: RetryPolicy, timeout: Duration) -> Self {
        Self { store, policy, timeout }
    }

    pub async fn upload(
        &self,
        source: &Path,
        name: &str,
        target: &UploadTarget<'_>,
        cancel: &CancellationToken,
    ) -> Result<RemoteObject, UploadError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, self.upload_with_retries(source, name, target)) => {
                outcome.unwrap_or(Err(UploadError::TimedOut(self.timeout)))
            }
        }
    }

    async fn upload_with_retries(
        &self,
        source: &Path,
        name: &str,
        target: &UploadTarget<'_>,
    ) -> Result<RemoteObject, UploadError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.put_file(source, name, target).await {
                Ok(object) => {
                    if attempt > 1 {
                        info!(attempt, "Upload succeeded after retry");
                    }
                    return Ok(object);
                }
                Err(error) if self.policy.should_retry(&error, attempt) => {
                    let delay = self.policy.backoff_after(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        ?delay,
                        %error,
                        "⚠️ Upload attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) if (self.policy.is_transient)(&error) => {
                    return Err(UploadError::Exhausted { attempts: attempt, source: error });
                }
                Err(error) => {
                    return Err(UploadError::Permanent { attempts: attempt, source: error });
                }
            }
        }
    }
}
