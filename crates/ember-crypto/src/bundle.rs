//! Public key material exchanged between parties.
//!
//! A [`PreKeyBundle`] is what a responder publishes for initiators; a
//! [`SessionHeader`] is what the transport carries next to the first
//! ciphertext so the responder can reconstruct the agreement. Both hold only
//! public halves. Key bytes are base64 strings on the wire.

use serde::{Deserialize, Serialize};

use crate::identity::IdentityKeyPair;
use crate::keypair::X25519KeyPair;
use crate::prekeys::SignedPrekey;

/// Signed prekey as published: the public key and the identity's signature over it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPrekeyPublic {
    #[serde(with = "base64_bytes")]
    pub public_key: [u8; 32],
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

impl From<&SignedPrekey> for SignedPrekeyPublic {
    fn from(spk: &SignedPrekey) -> Self {
        Self {
            public_key: spk.keypair.public_bytes(),
            signature: spk.signature_bytes().to_vec(),
        }
    }
}

/// A single one-time prekey handed to exactly one initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePrekeyPublic {
    pub index: u32,
    #[serde(with = "base64_bytes")]
    pub public_key: [u8; 32],
}

/// The subset of a responder's keys an initiator needs to start a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Ed25519 identity public key.
    #[serde(with = "base64_bytes")]
    pub identity_key: [u8; 32],
    pub signed_prekey: SignedPrekeyPublic,
    /// Absent when the responder's pool is exhausted; agreement then uses three DH exchanges.
    pub one_time_prekey: Option<OneTimePrekeyPublic>,
}

/// Initiator material sent alongside the first ciphertext of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    #[serde(with = "base64_bytes")]
    pub identity_key: [u8; 32],
    #[serde(with = "base64_bytes")]
    pub ephemeral_key: [u8; 32],
    /// The responder's signed prekey the initiator agreed against.
    #[serde(with = "base64_bytes")]
    pub signed_prekey: [u8; 32],
    pub one_time_prekey_index: Option<u32>,
}

impl SessionHeader {
    /// Header for a session initiated against `bundle`.
    pub fn new(identity: &IdentityKeyPair, ephemeral: &X25519KeyPair, bundle: &PreKeyBundle) -> Self {
        Self {
            identity_key: identity.public_key_bytes(),
            ephemeral_key: ephemeral.public_bytes(),
            signed_prekey: bundle.signed_prekey.public_key,
            one_time_prekey_index: bundle.one_time_prekey.map(|opk| opk.index),
        }
    }
}

/// Serde adapter encoding byte strings and fixed-size keys as standard base64.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        let encoded = String::deserialize(deserializer)?;
        let raw = STANDARD.decode(encoded).map_err(D::Error::custom)?;
        let len = raw.len();
        T::try_from(raw).map_err(|_| D::Error::custom(format!("unexpected key length {len}")))
    }
}
