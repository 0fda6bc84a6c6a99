//! Durable credential persistence.

pub mod file;

pub use file::EncryptedFileStore;

use crate::error::Result;

/// Keys the session layer persists.
pub mod keys {
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const REFRESH_TOKEN: &str = "refresh_token";
    pub const USER: &str = "user";
    pub const SAVED_EMAIL: &str = "saved_email";
    pub const BIOMETRIC_SECRET: &str = "biometric_secret";
}

/// Storage abstraction for persisted session credentials.
///
/// Implementations must complete the write before returning: the session
/// layer reports success to its callers only after `set` returns `Ok`, so a
/// deferred or silently-dropped write would let a process restart lose a
/// token the UI believes it holds.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}
