use ember_crypto::CryptoError;
use thiserror::Error;

use crate::record::KeyKind;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("no active {kind} key for owner {owner_id}")]
    KeyNotFound { owner_id: String, kind: KeyKind },

    #[error("one-time prekeys exhausted for owner {0}")]
    PrekeyExhausted(String),

    #[error("owner {0} already has an active identity key")]
    AlreadyRegistered(String),

    #[error("signed prekey for owner {0} has expired")]
    SignedPrekeyExpired(String),

    #[error("identity key does not match the registered identity for owner {0}")]
    IdentityMismatch(String),

    #[error("invalid key policy: {0}")]
    Config(String),

    #[error("key storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl KeyStoreError {
    pub(crate) fn not_found(owner_id: &str, kind: KeyKind) -> Self {
        Self::KeyNotFound {
            owner_id: owner_id.to_string(),
            kind,
        }
    }

    /// Whether the caller's transaction layer may retry.
    ///
    /// Storage failures are transient; signature and tag failures are never
    /// retried with the same inputs.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Storage(_) => true,
            Self::Crypto(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Opaque text for end users; does not reveal which check failed.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Crypto(e) => e.user_message(),
            Self::KeyNotFound { .. } | Self::SignedPrekeyExpired(_) | Self::IdentityMismatch(_) => {
                "secure channel could not be established"
            }
            Self::PrekeyExhausted(_) | Self::AlreadyRegistered(_) | Self::Config(_) | Self::Storage(_) => {
                "secure channel is temporarily unavailable"
            }
        }
    }
}
