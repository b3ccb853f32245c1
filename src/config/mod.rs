// drivevault/src/config/mod.rs
use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::errors::ConfigError;
use crate::upload::ServiceAccountKey;
use crate::upload::drive::CHUNK_ALIGNMENT;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const GOOGLE_SERVICE_ACCOUNT_JSON: &str = "GOOGLE_SERVICE_ACCOUNT_JSON";
pub const GOOGLE_DRIVE_FOLDER_ID: &str = "GOOGLE_DRIVE_FOLDER_ID";
pub const BACKUP_PASSWORD: &str = "BACKUP_PASSWORD";

pub const BACKUP_NAME_PREFIX: &str = "BACKUP_NAME_PREFIX";
pub const PG_DUMP_PATH: &str = "PG_DUMP_PATH";
pub const BACKUP_SCRATCH_ROOT: &str = "BACKUP_SCRATCH_ROOT";
pub const DUMP_TIMEOUT_SECS: &str = "DUMP_TIMEOUT_SECS";
pub const UPLOAD_TIMEOUT_SECS: &str = "UPLOAD_TIMEOUT_SECS";
pub const UPLOAD_MAX_ATTEMPTS: &str = "UPLOAD_MAX_ATTEMPTS";
pub const UPLOAD_CHUNK_SIZE_MIB: &str = "UPLOAD_CHUNK_SIZE_MIB";

const DEFAULT_NAME_PREFIX: &str = "agent_152t-backup";
const DEFAULT_PG_DUMP: &str = "pg_dump";
const DEFAULT_DUMP_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_UPLOAD_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_UPLOAD_CHUNK_SIZE_MIB: usize = 8;

/// Named values exactly as the host environment supplied them, before any
/// validation. Blank values count as unset.
#[derive(Debug, Clone, Default)]
pub struct RawBackupConfig {
    pub database_url: Option<SecretString>,
    pub service_account_json: Option<SecretString>,
    pub folder_id: Option<String>,
    pub backup_password: Option<SecretString>,
    pub name_prefix: Option<String>,
    pub pg_dump_path: Option<String>,
    pub scratch_root: Option<String>,
    pub dump_timeout_secs: Option<String>,
    pub upload_timeout_secs: Option<String>,
    pub upload_max_attempts: Option<String>,
    pub upload_chunk_size_mib: Option<String>,
}

/// The four values a run cannot start without. Immutable once built.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub database_url: SecretString,
    pub service_account: ServiceAccountKey,
    pub folder_id: String,
    pub backup_password: SecretString,
}

/// Tunables with defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub name_prefix: String,
    pub pg_dump_path: PathBuf,
    pub scratch_root: Option<PathBuf>,
    pub dump_timeout: Duration,
    pub upload_timeout: Duration,
    pub upload_max_attempts: u32,
    pub upload_chunk_size: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            pg_dump_path: PathBuf::from(DEFAULT_PG_DUMP),
            scratch_root: None,
            dump_timeout: Duration::from_secs(DEFAULT_DUMP_TIMEOUT_SECS),
            upload_timeout: Duration::from_secs(DEFAULT_UPLOAD_TIMEOUT_SECS),
            upload_max_attempts: DEFAULT_UPLOAD_MAX_ATTEMPTS,
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE_MIB * 1024 * 1024,
        }
    }
}

impl RawBackupConfig {
    /// Reads every known name through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let secret = |key: &str| text(key).map(SecretString::from);

        Self {
            database_url: secret(DATABASE_URL),
            service_account_json: secret(GOOGLE_SERVICE_ACCOUNT_JSON),
            folder_id: text(GOOGLE_DRIVE_FOLDER_ID).map(|v| v.trim().to_string()),
            backup_password: secret(BACKUP_PASSWORD),
            name_prefix: text(BACKUP_NAME_PREFIX).map(|v| v.trim().to_string()),
            pg_dump_path: text(PG_DUMP_PATH),
            scratch_root: text(BACKUP_SCRATCH_ROOT),
            dump_timeout_secs: text(DUMP_TIMEOUT_SECS),
            upload_timeout_secs: text(UPLOAD_TIMEOUT_SECS),
            upload_max_attempts: text(UPLOAD_MAX_ATTEMPTS),
            upload_chunk_size_mib: text(UPLOAD_CHUNK_SIZE_MIB),
        }
    }

    /// Reads the process environment. Call `dotenv` first if a `.env` file
    /// should contribute.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Validates everything in one pass so an operator sees every problem at once.
    pub fn validate(&self) -> Result<(BackupConfig, PipelineSettings), ConfigError> {
        let mut problems = Vec::new();

        let database_url = required(&self.database_url, DATABASE_URL, &mut problems);
        let backup_password = required(&self.backup_password, BACKUP_PASSWORD, &mut problems);
        let folder_id = match &self.folder_id {
            Some(id) => Some(id.clone()),
            None => {
                problems.push(format!("{GOOGLE_DRIVE_FOLDER_ID} is not set"));
                None
            }
        };
        let service_account = match &self.service_account_json {
            Some(json) => match ServiceAccountKey::from_json(json.expose_secret()) {
                Ok(key) => Some(key),
                Err(reason) => {
                    problems.push(format!("{GOOGLE_SERVICE_ACCOUNT_JSON} {reason}"));
                    None
                }
            },
            None => {
                problems.push(format!("{GOOGLE_SERVICE_ACCOUNT_JSON} is not set"));
                None
            }
        };

        let settings = self.settings(&mut problems);

        match (database_url, service_account, folder_id, backup_password) {
            (Some(database_url), Some(service_account), Some(folder_id), Some(backup_password))
                if problems.is_empty() =>
            {
                Ok((
                    BackupConfig {
                        database_url,
                        service_account,
                        folder_id,
                        backup_password,
                    },
                    settings,
                ))
            }
            _ => Err(ConfigError { problems }),
        }
    }

    fn settings(&self, problems: &mut Vec<String>) -> PipelineSettings {
        let defaults = PipelineSettings::default();

        let name_prefix = match &self.name_prefix {
            Some(prefix) if is_filename_safe(prefix) => prefix.clone(),
            Some(_) => {
                problems.push(format!(
                    "{BACKUP_NAME_PREFIX} may only contain letters, digits, '-', '_' and '.'"
                ));
                defaults.name_prefix.clone()
            }
            None => defaults.name_prefix.clone(),
        };

        let dump_timeout = parse_positive::<u64>(&self.dump_timeout_secs, DUMP_TIMEOUT_SECS, problems)
            .map(Duration::from_secs)
            .unwrap_or(defaults.dump_timeout);
        let upload_timeout = parse_positive::<u64>(&self.upload_timeout_secs, UPLOAD_TIMEOUT_SECS, problems)
            .map(Duration::from_secs)
            .unwrap_or(defaults.upload_timeout);
        let upload_max_attempts =
            parse_positive::<u32>(&self.upload_max_attempts, UPLOAD_MAX_ATTEMPTS, problems)
                .unwrap_or(defaults.upload_max_attempts);
        let upload_chunk_size =
            parse_positive::<usize>(&self.upload_chunk_size_mib, UPLOAD_CHUNK_SIZE_MIB, problems)
                .and_then(|mib| mib.checked_mul(4 * CHUNK_ALIGNMENT))
                .unwrap_or(defaults.upload_chunk_size);

        PipelineSettings {
            name_prefix,
            pg_dump_path: self.pg_dump_path.as_ref().map(PathBuf::from).unwrap_or(defaults.pg_dump_path),
            scratch_root: self.scratch_root.as_ref().map(PathBuf::from),
            dump_timeout,
            upload_timeout,
            upload_max_attempts,
            upload_chunk_size,
        }
    }
}

fn required(value: &Option<SecretString>, key: &str, problems: &mut Vec<String>) -> Option<SecretString> {
    if value.is_none() {
        problems.push(format!("{key} is not set"));
    }
    value.clone()
}

fn parse_positive<T>(value: &Option<String>, key: &str, problems: &mut Vec<String>) -> Option<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let raw = value.as_ref()?;
    match raw.trim().parse::<T>() {
        Ok(parsed) if parsed > T::default() => Some(parsed),
        _ => {
            problems.push(format!("{key} must be a positive integer, got {raw:?}"));
            None
        }
    }
}

fn is_filename_safe(prefix: &str) -> bool {
    !prefix.is_empty()
        && !prefix.starts_with('.')
        && prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}
