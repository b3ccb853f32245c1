//! Restores the plaintext dump from a downloaded backup artifact.
//!
//! Usage: `decrypt_backup <input.enc> <output.dump>` with `BACKUP_PASSWORD`
//! set in the environment or in `.env`.

// drivevault/src/bin/decrypt_backup.rs
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use zeroize::Zeroizing;

use drivevault::config::BACKUP_PASSWORD;
use drivevault::crypto;
use drivevault::errors::{BackupError, IntegrityError};

const EXIT_USAGE: u8 = 1;

enum Failure {
    Usage(String),
    Integrity(IntegrityError),
    Other(anyhow::Error),
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    match run() {
        Ok((output, bytes)) => {
            println!("✅ Decrypted {} bytes to {}", bytes, output.display());
            ExitCode::SUCCESS
        }
        Err(Failure::Usage(message)) => {
            eprintln!("❌ {message}");
            eprintln!("Usage: decrypt_backup <input.enc> <output.dump>");
            ExitCode::from(EXIT_USAGE)
        }
        Err(Failure::Integrity(e)) => {
            eprintln!("❌ Backup could not be decrypted: {e}");
            ExitCode::from(BackupError::EXIT_ENCRYPTION)
        }
        Err(Failure::Other(e)) => {
            eprintln!("❌ Error: {e:?}");
            ExitCode::from(BackupError::EXIT_INTERNAL)
        }
    }
}

fn run() -> Result<(PathBuf, usize), Failure> {
    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        return Err(Failure::Usage(format!("expected 2 arguments, got {}", args.len().saturating_sub(1))));
    }
    let input = PathBuf::from(&args[1]);
    let output = PathBuf::from(&args[2]);

    let password = match env::var(BACKUP_PASSWORD) {
        Ok(value) if !value.is_empty() => Zeroizing::new(value),
        _ => return Err(Failure::Usage(format!("{BACKUP_PASSWORD} is not set"))),
    };

    let envelope = read(&input).map_err(Failure::Other)?;
    let plaintext = Zeroizing::new(crypto::decrypt(&password, &envelope).map_err(Failure::Integrity)?);
    write(&output, &plaintext).map_err(Failure::Other)?;
    Ok((output, plaintext.len()))
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Failed to read backup artifact {}", path.display()))
}

fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("Failed to write dump to {}", path.display()))
}
