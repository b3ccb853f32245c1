pub mod envelope;
pub mod kdf;

pub use envelope::{MIN_ENVELOPE_LEN, decrypt, encrypt};
pub use kdf::{KEY_LEN, PBKDF2_ITERATIONS, SALT_LEN, derive_key};
