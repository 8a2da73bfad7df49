use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::KeyStoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Identity,
    SignedPrekey,
    Prekey,
}

impl KeyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::SignedPrekey => "signed_prekey",
            Self::Prekey => "prekey",
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyKind {
    type Err = KeyStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "identity" => Ok(Self::Identity),
            "signed_prekey" => Ok(Self::SignedPrekey),
            "prekey" => Ok(Self::Prekey),
            other => Err(KeyStoreError::Storage(format!("unknown key kind '{other}'"))),
        }
    }
}

/// A persisted key.
///
/// `private_key` is only populated under server-held custody; in the default
/// owner-only mode the private half never reaches the store.
#[derive(Clone)]
pub struct KeyRecord {
    pub id: String,
    pub owner_id: String,
    pub key_kind: KeyKind,
    pub public_key: [u8; 32],
    pub private_key: Option<Zeroizing<[u8; 32]>>,
    /// Only for [`KeyKind::Prekey`].
    pub key_index: Option<u32>,
    /// Only for [`KeyKind::SignedPrekey`].
    pub signature: Option<Vec<u8>>,
    /// Unix seconds.
    pub created_at: u64,
    pub expires_at: Option<u64>,
    pub is_active: bool,
}

impl KeyRecord {
    /// A new active record with a fresh opaque id.
    pub fn new(
        owner_id: &str,
        key_kind: KeyKind,
        public_key: [u8; 32],
        created_at: u64,
    ) -> Result<Self, KeyStoreError> {
        Ok(Self {
            id: new_record_id()?,
            owner_id: owner_id.to_string(),
            key_kind,
            public_key,
            private_key: None,
            key_index: None,
            signature: None,
            created_at,
            expires_at: None,
            is_active: true,
        })
    }

    pub fn with_private_key(mut self, private_key: Option<[u8; 32]>) -> Self {
        self.private_key = private_key.map(Zeroizing::new);
        self
    }

    pub fn with_index(mut self, index: u32) -> Self {
        self.key_index = Some(index);
        self
    }

    pub fn with_signature(mut self, signature: Vec<u8>, expires_at: u64) -> Self {
        self.signature = Some(signature);
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("key_kind", &self.key_kind)
            .field("public_key", &hex::encode(self.public_key))
            .field("has_private_key", &self.private_key.is_some())
            .field("key_index", &self.key_index)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("is_active", &self.is_active)
            .finish_non_exhaustive()
    }
}

/// Opaque 128-bit record id, hex-encoded.
pub fn new_record_id() -> Result<String, KeyStoreError> {
    let raw: [u8; 16] = ember_crypto::rng::random_array()?;
    Ok(hex::encode(raw))
}

pub fn timestamp_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
