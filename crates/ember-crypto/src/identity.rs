use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::rng;

/// A party's long-lived identity key pair.
///
/// The identity is an Ed25519 signing key so it can sign prekeys. Its X25519
/// agreement half is derived from the same scalar, and peers derive the
/// matching X25519 public key from the published Ed25519 key via the
/// Edwards→Montgomery map, so one 32-byte public key serves both roles.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    signing_key: SigningKey,
}

/// Generate a fresh identity key pair from the OS randomness source.
pub fn generate_identity_keypair() -> Result<IdentityKeyPair, CryptoError> {
    IdentityKeyPair::generate()
}

impl IdentityKeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let mut seed: [u8; 32] = rng::random_array()?;
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        Ok(Self { signing_key })
    }

    /// Restore an identity from its 32-byte secret seed.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Published identity key (Ed25519, 32 bytes).
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Secret seed for owner-side storage.
    ///
    /// # Security
    /// Handle with care — this is the private key material.
    pub fn secret_key_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// X25519 secret used in Diffie-Hellman exchanges.
    ///
    /// Uses the SHA-512-expanded scalar (the scalar Ed25519 signs with) so the
    /// result pairs with [`peer_identity_to_x25519`] applied to our public key.
    pub fn to_x25519_secret(&self) -> StaticSecret {
        StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    pub fn to_x25519_public(&self) -> PublicKey {
        PublicKey::from(&self.to_x25519_secret())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key_bytes())
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

/// Parse a published identity key.
pub fn parse_identity_key(bytes: &[u8; 32]) -> Result<VerifyingKey, CryptoError> {
    VerifyingKey::from_bytes(bytes)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid Ed25519 identity key: {e}")))
}

/// Convert a peer's published Ed25519 identity key to its X25519 agreement key.
pub fn peer_identity_to_x25519(identity_public: &[u8; 32]) -> Result<PublicKey, CryptoError> {
    let verifying_key = parse_identity_key(identity_public)?;
    Ok(PublicKey::from(verifying_key.to_montgomery().to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::Verifier;

    #[test]
    fn generate_and_sign() {
        let identity = generate_identity_keypair().unwrap();
        let signature = identity.sign(b"hello ember");
        assert!(identity.public_key().verify(b"hello ember", &signature).is_ok());
    }

    #[test]
    fn every_call_yields_a_fresh_key() {
        let a = generate_identity_keypair().unwrap();
        let b = generate_identity_keypair().unwrap();
        assert_ne!(a.public_key_bytes(), b.public_key_bytes());
    }

    #[test]
    fn roundtrip_secret_bytes() {
        let identity = IdentityKeyPair::generate().unwrap();
        let restored = IdentityKeyPair::from_secret_bytes(identity.secret_key_bytes());
        assert_eq!(identity.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn peer_conversion_matches_own_derivation() {
        let identity = IdentityKeyPair::generate().unwrap();
        let from_secret = identity.to_x25519_public();
        let from_public = peer_identity_to_x25519(&identity.public_key_bytes()).unwrap();
        assert_eq!(from_secret.as_bytes(), from_public.as_bytes());
    }

    #[test]
    fn debug_prints_only_the_public_half() {
        let identity = IdentityKeyPair::generate().unwrap();
        let rendered = format!("{identity:?}");
        assert!(rendered.contains(&identity.public_key_hex()));
        assert!(!rendered.contains(&hex::encode(identity.secret_key_bytes())));
    }
}
