//! Self-contained backup envelope.
//!
//! Layout: `salt (16) || nonce (12) || AES-256-GCM ciphertext || tag (16)`.
//! The salt feeds [`derive_key`], so the passphrase is the only secret needed
//! to open an envelope. This layout is what restore tooling reads; keep it
//! stable.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::TryRngCore;
use rand::rngs::OsRng;

use super::kdf::{SALT_LEN, derive_key};
use crate::errors::{EncryptionError, IntegrityError};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Smallest possible envelope: an empty payload still carries salt, nonce and tag.
pub const MIN_ENVELOPE_LEN: usize = SALT_LEN + NONCE_LEN + TAG_LEN;

/// Seals `plaintext` under a key derived from `password` and a fresh salt.
pub fn encrypt(password: &str, plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    if password.is_empty() {
        return Err(EncryptionError::EmptyPassword);
    }

    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut salt)
        .and_then(|()| OsRng.try_fill_bytes(&mut nonce))
        .map_err(|e| EncryptionError::RandomSource(e.to_string()))?;

    let key = derive_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| EncryptionError::Cipher(e.to_string()))?;
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| EncryptionError::Cipher(e.to_string()))?;

    let mut envelope = Vec::with_capacity(SALT_LEN + NONCE_LEN + sealed.len());
    envelope.extend_from_slice(&salt);
    envelope.extend_from_slice(&nonce);
    envelope.extend_from_slice(&sealed);
    Ok(envelope)
}

/// Opens an envelope produced by [`encrypt`].
pub fn decrypt(password: &str, envelope: &[u8]) -> Result<Vec<u8>, IntegrityError> {
    if password.is_empty() {
        return Err(IntegrityError::EmptyPassword);
    }
    if envelope.len() < MIN_ENVELOPE_LEN {
        return Err(IntegrityError::Truncated(envelope.len()));
    }

    let (salt, rest) = envelope.split_at(SALT_LEN);
    let (nonce, sealed) = rest.split_at(NONCE_LEN);
    let mut salt_bytes = [0u8; SALT_LEN];
    salt_bytes.copy_from_slice(salt);

    let key = derive_key(password, &salt_bytes);
    let cipher =
        Aes256Gcm::new_from_slice(&key[..]).map_err(|_| IntegrityError::AuthenticationFailed)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| IntegrityError::AuthenticationFailed)
}
