pub mod artifact;
pub mod db_dump;
mod logic;

use tokio_util::sync::CancellationToken;

pub use artifact::{BackupArtifact, ScratchSpace, artifact_name};
pub use db_dump::{DumpRunner, DumpTool, PgDumpRunner};
pub use logic::{BackupOrchestrator, RunReport, Stage};

use crate::config::RawBackupConfig;
use crate::errors::{BackupError, Result};
use crate::upload::DriveStore;

/// Public entry point for one backup run against PostgreSQL and Google Drive.
pub async fn run_backup_flow(raw: &RawBackupConfig, cancel: &CancellationToken) -> Result<RunReport> {
    let store = DriveStore::new().map_err(|e| BackupError::Internal(format!("could not build HTTP client: {e}")))?;
    BackupOrchestrator::new(&PgDumpRunner, &store).run(raw, cancel).await
}
