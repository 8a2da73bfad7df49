//! One-time and signed prekey generation.
//!
//! A signed prekey's public half is signed with the owner's Ed25519 identity
//! key so an initiator can detect a substituted prekey before agreeing on a
//! secret with it.

use ed25519_dalek::Signature;

use crate::error::CryptoError;
use crate::identity::{parse_identity_key, IdentityKeyPair};
use crate::keypair::X25519KeyPair;

/// Ed25519 signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// A one-time prekey, tagged with its position in a generation batch.
#[derive(Debug, Clone)]
pub struct OneTimePrekey {
    pub index: u32,
    pub keypair: X25519KeyPair,
}

/// A medium-lived prekey plus the identity signature over its public key.
#[derive(Debug, Clone)]
pub struct SignedPrekey {
    pub keypair: X25519KeyPair,
    pub signature: Signature,
}

impl SignedPrekey {
    pub fn signature_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.signature.to_bytes()
    }
}

pub fn generate_prekey(index: u32) -> Result<OneTimePrekey, CryptoError> {
    Ok(OneTimePrekey {
        index,
        keypair: X25519KeyPair::generate()?,
    })
}

/// Generate `count` one-time prekeys with indexes `first_index..first_index + count`.
pub fn generate_prekey_batch(first_index: u32, count: u32) -> Result<Vec<OneTimePrekey>, CryptoError> {
    let last = first_index
        .checked_add(count)
        .ok_or_else(|| CryptoError::KeyGeneration("prekey index space exhausted".into()))?;
    (first_index..last).map(generate_prekey).collect()
}

pub fn generate_signed_prekey(identity: &IdentityKeyPair) -> Result<SignedPrekey, CryptoError> {
    let keypair = X25519KeyPair::generate()?;
    let signature = identity.sign(keypair.public_key().as_bytes());
    Ok(SignedPrekey { keypair, signature })
}

/// Check that `signature` is the identity's signature over `signed_prekey_public`.
pub fn verify_signed_prekey(
    identity_public: &[u8; 32],
    signed_prekey_public: &[u8; 32],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let verifying_key = parse_identity_key(identity_public)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| CryptoError::SignatureVerification)?;
    verifying_key
        .verify_strict(signed_prekey_public, &signature)
        .map_err(|_| CryptoError::SignatureVerification)
}
