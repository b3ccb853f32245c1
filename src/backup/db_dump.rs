// drivevault/src/backup/db_dump.rs
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use percent_encoding::percent_decode_str;
use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;
use tracing::{debug, info};
use url::Url;
use which::which;

use crate::errors::{DumpError, ToolUnavailableError};

const REDACTED: &str = "[REDACTED]";

/// A located, invocable dump program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpTool {
    pub path: PathBuf,
    pub version: String,
}

/// Produces a logical dump of one database into a local file.
#[async_trait]
pub trait DumpRunner: Send + Sync {
    /// Resolves `program` and checks that it runs.
    async fn probe(&self, program: &Path) -> Result<DumpTool, ToolUnavailableError>;

    /// Writes the dump of the database behind `connection` to `destination`.
    ///
    /// Dropping the returned future stops the dump.
    async fn dump(
        &self,
        tool: &DumpTool,
        connection: &SecretString,
        destination: &Path,
    ) -> Result<(), DumpError>;
}

/// Runs PostgreSQL's `pg_dump` in custom archive format.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgDumpRunner;

#[async_trait]
impl DumpRunner for PgDumpRunner {
    async fn probe(&self, program: &Path) -> Result<DumpTool, ToolUnavailableError> {
        let unavailable = |reason: String| ToolUnavailableError {
            program: program.display().to_string(),
            reason,
        };

        let path = which(program).map_err(|e| unavailable(format!("not found on PATH ({e})")))?;
        let output = Command::new(&path)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| unavailable(format!("could not be executed ({e})")))?;
        if !output.status.success() {
            return Err(unavailable(format!("--version exited with {}", output.status)));
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(path = %path.display(), %version, "Found dump tool");
        Ok(DumpTool { path, version })
    }

    async fn dump(
        &self,
        tool: &DumpTool,
        connection: &SecretString,
        destination: &Path,
    ) -> Result<(), DumpError> {
        let target = DumpTarget::from_connection(connection);

        let mut command = Command::new(&tool.path);
        command
            .arg("--format=custom")
            .arg("--no-password")
            .arg("--file")
            .arg(destination)
            .arg("--dbname")
            .arg(target.dbname.expose_secret())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = &target.password {
            command.env("PGPASSWORD", password.expose_secret());
        }

        debug!(destination = %destination.display(), "Spawning pg_dump");
        let output = command.output().await.map_err(DumpError::Spawn)?;
        if output.status.success() {
            return Ok(());
        }

        let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
        captured.push_str(&String::from_utf8_lossy(&output.stderr));
        Err(DumpError::Failed {
            exit_code: output.status.code(),
            output: redact(captured.trim(), &target.secrets(connection)),
        })
    }
}

/// What gets handed to pg_dump: a connection string with the password taken
/// out of it, and the password on its own for `PGPASSWORD`.
struct DumpTarget {
    dbname: SecretString,
    password: Option<SecretString>,
    encoded_password: Option<SecretString>,
}

impl DumpTarget {
    fn from_connection(connection: &SecretString) -> Self {
        let unchanged = || Self {
            dbname: connection.clone(),
            password: None,
            encoded_password: None,
        };

        let Ok(mut url) = Url::parse(connection.expose_secret()) else {
            // key=value connection strings go through untouched
            return unchanged();
        };
        if !matches!(url.scheme(), "postgres" | "postgresql") {
            return unchanged();
        }
        let Some(encoded) = url.password().map(str::to_string) else {
            return unchanged();
        };
        if url.set_password(None).is_err() {
            return unchanged();
        }

        Self {
            dbname: SecretString::from(url.to_string()),
            password: Some(SecretString::from(
                percent_decode_str(&encoded).decode_utf8_lossy().into_owned(),
            )),
            encoded_password: Some(SecretString::from(encoded)),
        }
    }

    fn secrets(&self, connection: &SecretString) -> Vec<String> {
        let mut secrets = vec![connection.expose_secret().to_string()];
        secrets.extend(self.password.iter().map(|p| p.expose_secret().to_string()));
        secrets.extend(self.encoded_password.iter().map(|p| p.expose_secret().to_string()));
        secrets
    }
}

/// Replaces every occurrence of each secret in `text`. Longest first, so a
/// password is not half-replaced inside a connection string that contains it.
pub fn redact(text: &str, secrets: &[String]) -> String {
    let mut ordered: Vec<&String> = secrets.iter().filter(|s| !s.is_empty()).collect();
    ordered.sort_by_key(|s| std::cmp::Reverse(s.len()));
    ordered
        .into_iter()
        .fold(text.to_string(), |acc, secret| acc.replace(secret.as_str(), REDACTED))
}
