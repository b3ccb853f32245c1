// drivevault/src/backup/artifact.rs
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tracing::{debug, warn};

const SCRATCH_PREFIX: &str = "pg_backup_";

/// `<prefix>-YYYY-MM-DD_HHMMSS` in UTC. Sorts chronologically and differs
/// for runs started in different seconds.
pub fn artifact_name(prefix: &str, started_at: DateTime<Utc>) -> String {
    format!("{}-{}", prefix, started_at.format("%Y-%m-%d_%H%M%S"))
}

/// The unit of output of one run, together with the local scratch space its
/// intermediate files live in.
pub struct BackupArtifact {
    name: String,
    scratch: ScratchSpace,
}

impl BackupArtifact {
    pub fn create(prefix: &str, started_at: DateTime<Utc>, scratch_root: Option<&Path>) -> io::Result<Self> {
        Ok(Self {
            name: artifact_name(prefix, started_at),
            scratch: ScratchSpace::create(scratch_root)?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Object name at the remote destination.
    pub fn remote_name(&self) -> String {
        format!("{}.enc", self.name)
    }

    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    pub fn dump_path(&self) -> PathBuf {
        self.scratch.path().join(format!("{}.dump", self.name))
    }

    pub fn encrypted_path(&self) -> PathBuf {
        self.scratch.path().join(self.remote_name())
    }

    /// Removes the scratch directory and everything in it.
    pub fn cleanup(self) {
        self.scratch.close();
    }
}

/// Exclusively-owned temporary directory. Removed on [`ScratchSpace::close`]
/// or, failing that, when dropped, so early returns, panics and dropped
/// futures all release it.
pub struct ScratchSpace {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl ScratchSpace {
    pub fn create(root: Option<&Path>) -> io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(SCRATCH_PREFIX);
        let dir = match root {
            Some(root) => builder.tempdir_in(root)?,
            None => builder.tempdir()?,
        };
        debug!(path = %dir.path().display(), "Created scratch directory");
        Ok(Self {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        match dir.close() {
            Ok(()) => debug!(path = %self.path.display(), "🧹 Removed scratch directory"),
            // Leftover files are reported, never turned into a run failure.
            Err(error) => warn!(
                path = %self.path.display(),
                %error,
                "⚠️ Could not remove scratch directory"
            ),
        }
    }
}

impl Drop for ScratchSpace {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_artifact_name_format() {
        let at = Utc.with_ymd_and_hms(2025, 3, 9, 4, 5, 6).unwrap();
        assert_eq!(artifact_name("agent_152t-backup", at), "agent_152t-backup-2025-03-09_040506");
    }

    #[test]
    fn test_names_one_second_apart_differ_and_sort() {
        let first = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap();
        let second = first + chrono::Duration::seconds(1);
        let a = artifact_name("db", first);
        let b = artifact_name("db", second);
        assert_ne!(a, b);
        assert!(a < b);
    }

    #[test]
    fn test_artifact_paths_live_in_scratch() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let artifact = BackupArtifact::create("db", at, Some(root.path()))?;
        assert_eq!(artifact.remote_name(), "db-2025-01-02_030405.enc");
        assert!(artifact.dump_path().starts_with(artifact.scratch_dir()));
        assert!(artifact.encrypted_path().starts_with(artifact.scratch_dir()));
        assert!(artifact.scratch_dir().starts_with(root.path()));
        Ok(())
    }

    #[test]
    fn test_cleanup_removes_directory_and_contents() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let artifact = BackupArtifact::create("db", Utc::now(), Some(root.path()))?;
        std::fs::write(artifact.dump_path(), b"dump")?;
        std::fs::write(artifact.encrypted_path(), b"enc")?;
        let scratch = artifact.scratch_dir().to_path_buf();
        artifact.cleanup();
        assert!(!scratch.exists());
        Ok(())
    }

    #[test]
    fn test_drop_releases_scratch() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let scratch = {
            let space = ScratchSpace::create(Some(root.path()))?;
            std::fs::write(space.path().join("partial.dump"), b"x")?;
            space.path().to_path_buf()
        };
        assert!(!scratch.exists());
        Ok(())
    }

    #[test]
    fn test_scratch_dirs_are_unique() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let a = ScratchSpace::create(Some(root.path()))?;
        let b = ScratchSpace::create(Some(root.path()))?;
        assert_ne!(a.path(), b.path());
        Ok(())
    }
}
