use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signed prekey signature verification failed")]
    SignatureVerification,

    #[error("authentication tag did not verify")]
    AuthenticationTag,

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("message key unavailable: {0}")]
    MessageKeyUnavailable(String),
}

impl CryptoError {
    /// Whether retrying the same operation with the same inputs can succeed.
    ///
    /// Signature and tag failures are deterministic for a given input and are
    /// never retried; only a failing randomness source may recover.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::KeyGeneration(_))
    }

    /// Opaque text safe to show a user.
    ///
    /// Never reveals which check failed, so callers cannot be used as an oracle.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::AuthenticationTag | Self::MessageKeyUnavailable(_) => {
                "message could not be verified"
            }
            Self::SignatureVerification | Self::InvalidKey(_) | Self::KeyDerivation(_) => {
                "secure channel could not be established"
            }
            Self::KeyGeneration(_) | Self::Encryption(_) => "secure channel is temporarily unavailable",
        }
    }
}
