#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use lanewire::error::{LanewireError, Result};
use lanewire::session::{Identity, UserRole};
use lanewire::store::CredentialStore;

/// In-memory credential store with optional write-failure injection.
#[derive(Default)]
pub struct MemoryCredentialStore {
    values: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write (set or delete) fail with a storage
    /// error. Reads keep working.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .expect("store lock poisoned")
            .get(key)
            .cloned()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.value(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LanewireError::Storage(
                "simulated write failure".to_string(),
            ));
        }
        self.values
            .lock()
            .expect("store lock poisoned")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LanewireError::Storage(
                "simulated write failure".to_string(),
            ));
        }
        self.values
            .lock()
            .expect("store lock poisoned")
            .remove(key);
        Ok(())
    }
}

pub fn shipper() -> Identity {
    Identity {
        user_id: "u-1".to_string(),
        role: UserRole::Shipper,
        email_verified: true,
    }
}

pub fn driver() -> Identity {
    Identity {
        user_id: "u-2".to_string(),
        role: UserRole::Driver,
        email_verified: false,
    }
}
