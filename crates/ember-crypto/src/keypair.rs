use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;
use crate::rng;

/// An X25519 key pair: signed prekeys, one-time prekeys and ephemeral keys.
#[derive(Clone)]
pub struct X25519KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl X25519KeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = rng::random_array()?;
        Ok(Self::from_secret_bytes(bytes))
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// Raw secret for owner-side storage.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

impl std::fmt::Debug for X25519KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X25519KeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}
