// drivevault/src/backup/logic.rs
use std::fmt;
use std::path::Path;

use chrono::Utc;
use secrecy::ExposeSecret;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use super::artifact::BackupArtifact;
use super::db_dump::DumpRunner;
use crate::config::{BackupConfig, PipelineSettings, RawBackupConfig};
use crate::crypto;
use crate::errors::{BackupError, DumpError, EncryptionError, Result, UploadError};
use crate::upload::{ObjectStore, RetryPolicy, UploadTarget, Uploader};

/// Where a run is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Dumping,
    Encrypting,
    Uploading,
    CleaningUp,
    Done,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Stage::Validating => "validating",
            Stage::Dumping => "dumping",
            Stage::Encrypting => "encrypting",
            Stage::Uploading => "uploading",
            Stage::CleaningUp => "cleaning up",
            Stage::Done => "done",
            Stage::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub artifact_name: String,
    pub remote_name: String,
    pub remote_id: String,
    /// Size of the uploaded envelope.
    pub size_bytes: u64,
    /// Hex SHA-256 of the uploaded envelope.
    pub sha256: String,
}

struct Sealed {
    size_bytes: u64,
    sha256: String,
}

/// Sequences one dump → encrypt → upload cycle and owns everything it
/// leaves on disk.
pub struct BackupOrchestrator<'a> {
    dumper: &'a dyn DumpRunner,
    store: &'a dyn ObjectStore,
    retry_policy: RetryPolicy,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(dumper: &'a dyn DumpRunner, store: &'a dyn ObjectStore) -> Self {
        Self {
            dumper,
            store,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Backoff and classification for uploads. The attempt limit always
    /// comes from the validated settings.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub async fn run(&self, raw: &RawBackupConfig, cancel: &CancellationToken) -> Result<RunReport> {
        info!(stage = %Stage::Validating, "🚀 Starting backup run");
        let (config, settings) = match raw.validate() {
            Ok(validated) => validated,
            Err(e) => return Err(self.report_failure(BackupError::Config(e))),
        };

        let artifact = match BackupArtifact::create(
            &settings.name_prefix,
            Utc::now(),
            settings.scratch_root.as_deref(),
        ) {
            Ok(artifact) => artifact,
            Err(e) => {
                return Err(self.report_failure(BackupError::Internal(format!(
                    "could not create scratch directory: {e}"
                ))));
            }
        };
        info!(artifact = %artifact.name(), scratch = %artifact.scratch_dir().display(), "📂 Prepared scratch space");

        let outcome = self.execute(&config, &settings, &artifact, cancel).await;

        info!(stage = %Stage::CleaningUp, "Removing local files");
        artifact.cleanup();

        match outcome {
            Ok(report) => {
                info!(
                    stage = %Stage::Done,
                    artifact = %report.artifact_name,
                    remote_id = %report.remote_id,
                    size_bytes = report.size_bytes,
                    sha256 = %report.sha256,
                    "✅ Backup completed"
                );
                Ok(report)
            }
            Err(e) => Err(self.report_failure(e)),
        }
    }

    fn report_failure(&self, e: BackupError) -> BackupError {
        error!(stage = %Stage::Failed, failed_while = %e.stage(), exit_code = e.exit_code(), "❌ {e}");
        e
    }

    async fn execute(
        &self,
        config: &BackupConfig,
        settings: &PipelineSettings,
        artifact: &BackupArtifact,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        checkpoint(cancel, Stage::Dumping)?;
        info!(stage = %Stage::Dumping, "🔍 Dumping database");
        let dump_path = artifact.dump_path();
        self.dump(config, settings, &dump_path, cancel).await?;

        checkpoint(cancel, Stage::Encrypting)?;
        info!(stage = %Stage::Encrypting, "🔐 Encrypting dump");
        let encrypted_path = artifact.encrypted_path();
        let sealed = seal(config, &dump_path, &encrypted_path).await?;
        info!(size_bytes = sealed.size_bytes, "✓ Encrypted artifact written");

        checkpoint(cancel, Stage::Uploading)?;
        let remote_name = artifact.remote_name();
        info!(stage = %Stage::Uploading, remote_name = %remote_name, folder_id = %config.folder_id, "☁️ Uploading artifact");
        let target = UploadTarget {
            folder_id: &config.folder_id,
            credential: &config.service_account,
            chunk_size: settings.upload_chunk_size,
        };
        let policy = self.retry_policy.clone().with_max_attempts(settings.upload_max_attempts);
        let remote = Uploader::new(self.store, policy, settings.upload_timeout)
            .upload(&encrypted_path, &remote_name, &target, cancel)
            .await
            .map_err(|e| match e {
                UploadError::Cancelled => BackupError::Cancelled(Stage::Uploading),
                other => BackupError::Upload(other),
            })?;
        info!(remote_id = %remote.id, "✓ Upload completed");

        Ok(RunReport {
            artifact_name: artifact.name().to_string(),
            remote_name,
            remote_id: remote.id,
            size_bytes: sealed.size_bytes,
            sha256: sealed.sha256,
        })
    }

    async fn dump(
        &self,
        config: &BackupConfig,
        settings: &PipelineSettings,
        dump_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let tool = self.dumper.probe(&settings.pg_dump_path).await?;
        checkpoint(cancel, Stage::Dumping)?;

        let dump = self.dumper.dump(&tool, &config.database_url, dump_path);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackupError::Cancelled(Stage::Dumping)),
            outcome = tokio::time::timeout(settings.dump_timeout, dump) => match outcome {
                Ok(result) => result?,
                Err(_) => return Err(DumpError::TimedOut(settings.dump_timeout).into()),
            },
        }

        let size = tokio::fs::metadata(dump_path).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(DumpError::EmptyOutput(dump_path.display().to_string()).into());
        }
        info!(size_bytes = size, "✓ Dump completed");
        Ok(())
    }
}

fn checkpoint(cancel: &CancellationToken, next: Stage) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(BackupError::Cancelled(next));
    }
    Ok(())
}

/// Encrypts the dump into the envelope file, then removes the plaintext.
async fn seal(config: &BackupConfig, dump_path: &Path, encrypted_path: &Path) -> Result<Sealed> {
    let io_error = |path: &Path| {
        let path = path.display().to_string();
        move |source| EncryptionError::Io { path, source }
    };

    let plaintext = Zeroizing::new(tokio::fs::read(dump_path).await.map_err(io_error(dump_path))?);
    let password = Zeroizing::new(config.backup_password.expose_secret().to_string());
    let envelope = tokio::task::spawn_blocking(move || crypto::encrypt(&password, &plaintext))
        .await
        .map_err(|e| EncryptionError::Task(e.to_string()))??;

    tokio::fs::write(encrypted_path, &envelope)
        .await
        .map_err(io_error(encrypted_path))?;
    if let Err(e) = tokio::fs::remove_file(dump_path).await {
        warn!(path = %dump_path.display(), error = %e, "⚠️ Could not remove plaintext dump early");
    }

    Ok(Sealed {
        size_bytes: envelope.len() as u64,
        sha256: hex::encode(Sha256::digest(&envelope)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_labels() {
        assert_eq!(Stage::CleaningUp.to_string(), "cleaning up");
        assert_eq!(Stage::Uploading.to_string(), "uploading");
    }

    #[test]
    fn test_cancelled_checkpoint() {
        let cancel = CancellationToken::new();
        assert!(checkpoint(&cancel, Stage::Encrypting).is_ok());
        cancel.cancel();
        assert!(matches!(
            checkpoint(&cancel, Stage::Encrypting),
            Err(BackupError::Cancelled(Stage::Encrypting))
        ));
    }
}
