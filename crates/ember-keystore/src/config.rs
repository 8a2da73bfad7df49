use std::path::Path;

use serde::Deserialize;

use crate::error::KeyStoreError;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Who holds private key halves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyCustody {
    /// Private halves are returned to the owner once and never persisted.
    #[default]
    OwnerOnly,
    /// NON-PRODUCTION: private halves are persisted next to the public keys so
    /// the store can act as the responder. A server holding these can decrypt
    /// every session; use only for demos and tests.
    ServerHeld,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KeyPolicy {
    /// One-time prekeys generated at registration.
    pub prekey_batch_size: u32,
    pub signed_prekey_lifetime_secs: u64,
    /// Remaining active one-time prekeys at or below which replenishment is signalled.
    pub prekey_low_water_mark: u32,
    pub custody: KeyCustody,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            prekey_batch_size: 100,
            signed_prekey_lifetime_secs: 30 * DAY_SECS,
            prekey_low_water_mark: 10,
            custody: KeyCustody::OwnerOnly,
        }
    }
}

impl KeyPolicy {
    /// Load a JSON policy; absent fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, KeyStoreError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| KeyStoreError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, KeyStoreError> {
        let policy: Self = serde_json::from_str(raw)
            .map_err(|e| KeyStoreError::Config(format!("failed to parse key policy: {e}")))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), KeyStoreError> {
        if self.prekey_batch_size == 0 {
            return Err(KeyStoreError::Config("prekey_batch_size must be at least 1".into()));
        }
        if self.signed_prekey_lifetime_secs == 0 {
            return Err(KeyStoreError::Config(
                "signed_prekey_lifetime_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn stores_private_keys(&self) -> bool {
        self.custody == KeyCustody::ServerHeld
    }
}
