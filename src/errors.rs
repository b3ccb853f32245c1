use std::time::Duration;

use thiserror::Error;

use crate::backup::Stage;

/// Terminal failure of one backup run. Each variant names the stage that
/// failed and maps to one process exit code.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dump tool unavailable: {0}")]
    ToolUnavailable(#[from] ToolUnavailableError),

    #[error("Database dump failed: {0}")]
    Dump(#[from] DumpError),

    #[error("Encryption failed: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Upload failed: {0}")]
    Upload(#[from] UploadError),

    #[error("Backup cancelled while {0}")]
    Cancelled(Stage),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackupError {
    pub const EXIT_CONFIG: u8 = 1;
    pub const EXIT_TOOL_UNAVAILABLE: u8 = 2;
    pub const EXIT_DUMP: u8 = 3;
    pub const EXIT_ENCRYPTION: u8 = 4;
    pub const EXIT_UPLOAD: u8 = 5;
    pub const EXIT_INTERNAL: u8 = 70;
    pub const EXIT_CANCELLED: u8 = 130;

    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::Config(_) => Self::EXIT_CONFIG,
            BackupError::ToolUnavailable(_) => Self::EXIT_TOOL_UNAVAILABLE,
            BackupError::Dump(_) => Self::EXIT_DUMP,
            BackupError::Encryption(_) => Self::EXIT_ENCRYPTION,
            BackupError::Upload(_) => Self::EXIT_UPLOAD,
            BackupError::Cancelled(_) => Self::EXIT_CANCELLED,
            BackupError::Internal(_) => Self::EXIT_INTERNAL,
        }
    }

    /// The pipeline stage this failure originated in.
    pub fn stage(&self) -> Stage {
        match self {
            BackupError::Config(_) => Stage::Validating,
            BackupError::ToolUnavailable(_) | BackupError::Dump(_) => Stage::Dumping,
            BackupError::Encryption(_) => Stage::Encrypting,
            BackupError::Upload(_) => Stage::Uploading,
            BackupError::Cancelled(stage) => *stage,
            BackupError::Internal(_) => Stage::Failed,
        }
    }
}

/// Every missing or malformed setting, collected in one pass.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", .problems.join("; "))]
pub struct ConfigError {
    pub problems: Vec<String>,
}

impl ConfigError {
    /// Whether `key` is among the settings reported as missing or invalid.
    pub fn mentions(&self, key: &str) -> bool {
        self.problems.iter().any(|p| p.starts_with(key))
    }
}

/// A service-account key document that cannot be used. Messages describe
/// the problem without quoting the document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("is not a service-account key document ({category} error at line {line} column {column})")]
    Malformed {
        category: String,
        line: usize,
        column: usize,
    },

    #[error("has type {0:?}, expected \"service_account\"")]
    WrongType(String),

    #[error("has an empty client_email")]
    MissingClientEmail,

    #[error("has a private_key that is not an RSA PEM key")]
    InvalidPrivateKey,
}

#[derive(Error, Debug)]
#[error("{program} is not invocable: {reason}")]
pub struct ToolUnavailableError {
    pub program: String,
    pub reason: String,
}

#[derive(Error, Debug)]
pub enum DumpError {
    #[error("dump tool exited with {}\n{output}", exit_label(.exit_code))]
    Failed {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("dump did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("dump finished but produced no data at {0}")]
    EmptyOutput(String),

    #[error("failed to run dump tool: {0}")]
    Spawn(#[source] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (killed by signal)".to_string(),
    }
}

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("backup password is empty")]
    EmptyPassword,

    #[error("cipher failure: {0}")]
    Cipher(String),

    #[error("OS random source unavailable: {0}")]
    RandomSource(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("encryption task aborted: {0}")]
    Task(String),
}

/// Decryption could not authenticate the envelope. Wrong password, flipped
/// bits and truncation all look the same to the AEAD.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("envelope is {0} bytes, shorter than the minimum envelope size")]
    Truncated(usize),

    #[error("authentication failed: wrong password or corrupted backup")]
    AuthenticationFailed,

    #[error("password is empty")]
    EmptyPassword,
}

/// A single failed attempt against the remote store.
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("network error during {operation}: {source}")]
    Network {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("credential rejected: {0}")]
    Auth(String),

    #[error("upload session expired")]
    SessionExpired,

    #[error("unexpected response from {operation}: {detail}")]
    Protocol {
        operation: &'static str,
        detail: String,
    },

    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransferError {
    /// Whether another attempt can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::Status { status, body, .. } => match *status {
                408 | 429 => true,
                500..=599 => true,
                403 => body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded"),
                _ => false,
            },
            TransferError::Network { .. } | TransferError::SessionExpired => true,
            TransferError::Auth(_) | TransferError::Protocol { .. } | TransferError::Io(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("permanent failure on attempt {attempts}: {source}")]
    Permanent {
        attempts: u32,
        #[source]
        source: TransferError,
    },

    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: TransferError,
    },

    #[error("upload did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("upload cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, BackupError>;
