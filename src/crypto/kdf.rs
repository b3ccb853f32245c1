//! Password-based key derivation for backup envelopes.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const PBKDF2_ITERATIONS: u32 = 390_000;

/// Derives the 32-byte envelope key from `password` and `salt` with
/// PBKDF2-HMAC-SHA256. Callers reject empty passwords before getting here.
pub fn derive_key(password: &str, salt: &[u8; SALT_LEN]) -> Zeroizing<[u8; KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key[..]);
    key
}
