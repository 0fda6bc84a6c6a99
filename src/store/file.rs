//! Encrypted file-backed credential store.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::error::{LanewireError, Result};

const KEY_FILE: &str = "store.key";
const DATA_FILE: &str = "credentials.enc";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Credential store persisting a ChaCha20-Poly1305-encrypted key/value map.
///
/// The data file holds `nonce || ciphertext` over the JSON-serialized map; a
/// fresh nonce is drawn for every write. The encryption key lives next to
/// the data with 0o600 permissions and is created lazily. Platforms with an
/// OS keychain can substitute their own [`CredentialStore`] implementation.
///
/// [`CredentialStore`]: super::CredentialStore
pub struct EncryptedFileStore {
    dir: PathBuf,
    cipher: ChaCha20Poly1305,
    // Serializes read-modify-write cycles on the data file.
    io: Mutex<()>,
}

impl EncryptedFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(storage_error)?;
        let key = load_or_create_key(&dir.join(KEY_FILE))?;
        Ok(Self {
            dir,
            cipher: ChaCha20Poly1305::new(&key),
            io: Mutex::new(()),
        })
    }

    /// Store rooted at `~/.lanewire`.
    pub fn new_default() -> Result<Self> {
        Self::new(default_store_dir())
    }

    fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_FILE)
    }

    fn read_map(&self) -> Result<HashMap<String, String>> {
        let raw = match fs::read(self.data_path()) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HashMap::new())
            }
            Err(err) => return Err(storage_error(err)),
        };
        if raw.len() < NONCE_LEN {
            return Err(LanewireError::Storage(
                "credential store file truncated".to_string(),
            ));
        }
        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                LanewireError::Storage("credential store decryption failed".to_string())
            })?;
        serde_json::from_slice(&plaintext)
            .map_err(|err| LanewireError::Storage(format!("credential store unreadable: {err}")))
    }

    fn write_map(&self, map: &HashMap<String, String>) -> Result<()> {
        let plaintext = serde_json::to_vec(map)
            .map_err(|err| LanewireError::Storage(err.to_string()))?;
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| LanewireError::Storage("credential store encryption failed".to_string()))?;
        let mut contents = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        contents.extend_from_slice(&nonce);
        contents.extend_from_slice(&ciphertext);
        let path = self.data_path();
        fs::write(&path, contents).map_err(storage_error)?;
        restrict_permissions(&path)?;
        Ok(())
    }
}

impl super::CredentialStore for EncryptedFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = lock(&self.io);
        Ok(self.read_map()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = lock(&self.io);
        let mut map = self.read_map()?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let _guard = lock(&self.io);
        let mut map = self.read_map()?;
        if map.remove(key).is_some() {
            self.write_map(&map)?;
        }
        Ok(())
    }
}

fn lock(mutex: &Mutex<()>) -> std::sync::MutexGuard<'_, ()> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn storage_error(err: std::io::Error) -> LanewireError {
    LanewireError::Storage(err.to_string())
}

fn load_or_create_key(path: &Path) -> Result<Key> {
    match fs::read(path) {
        Ok(raw) => {
            if raw.len() != KEY_LEN {
                return Err(LanewireError::Storage(
                    "credential store key file corrupted".to_string(),
                ));
            }
            Ok(*Key::from_slice(&raw))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let key = ChaCha20Poly1305::generate_key(&mut OsRng);
            fs::write(path, key.as_slice()).map_err(storage_error)?;
            restrict_permissions(path)?;
            Ok(key)
        }
        Err(err) => Err(storage_error(err)),
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(storage_error)
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

fn default_store_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().join(".lanewire"))
        .unwrap_or_else(|| PathBuf::from(".lanewire"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CredentialStore;
    use tempfile::TempDir;

    fn temp_store() -> (TempDir, EncryptedFileStore) {
        let dir = TempDir::new().unwrap();
        let store = EncryptedFileStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn round_trip_works() {
        let (_dir, store) = temp_store();
        store.set("access_token", "tok-1").unwrap();
        assert_eq!(store.get("access_token").unwrap().as_deref(), Some("tok-1"));
    }

    #[test]
    fn missing_key_reads_none() {
        let (_dir, store) = temp_store();
        assert!(store.get("refresh_token").unwrap().is_none());
    }

    #[test]
    fn overwrite_replaces_value() {
        let (_dir, store) = temp_store();
        store.set("access_token", "old").unwrap();
        store.set("access_token", "new").unwrap();
        assert_eq!(store.get("access_token").unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn delete_removes_value_and_is_idempotent() {
        let (_dir, store) = temp_store();
        store.set("user", "{}").unwrap();
        store.delete("user").unwrap();
        store.delete("user").unwrap();
        assert!(store.get("user").unwrap().is_none());
    }

    #[test]
    fn values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = EncryptedFileStore::new(dir.path()).unwrap();
            store.set("refresh_token", "ref-9").unwrap();
        }
        let reopened = EncryptedFileStore::new(dir.path()).unwrap();
        assert_eq!(
            reopened.get("refresh_token").unwrap().as_deref(),
            Some("ref-9")
        );
    }

    #[test]
    fn data_file_does_not_leak_plaintext() {
        let (dir, store) = temp_store();
        store.set("access_token", "super-secret-token").unwrap();
        let raw = std::fs::read(dir.path().join(DATA_FILE)).unwrap();
        let haystack = String::from_utf8_lossy(&raw);
        assert!(!haystack.contains("super-secret-token"));
        assert!(!haystack.contains("access_token"));
    }

    #[test]
    fn tampered_file_surfaces_storage_error() {
        let (dir, store) = temp_store();
        store.set("access_token", "tok").unwrap();
        let path = dir.path().join(DATA_FILE);
        let mut raw = std::fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        std::fs::write(&path, raw).unwrap();
        assert!(matches!(
            store.get("access_token"),
            Err(crate::error::LanewireError::Storage(_))
        ));
    }
}
