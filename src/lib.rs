//! Encrypted PostgreSQL backups delivered to Google Drive.
//!
//! One run dumps the database with `pg_dump`, seals the dump under a
//! password-derived AES-256-GCM key, uploads the envelope to a Drive folder
//! and removes every local file it created.

pub mod backup;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod upload;
