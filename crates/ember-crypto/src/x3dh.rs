//! X3DH key agreement.
//!
//! Initiator (A) and responder (B) each compute the same ordered list of
//! Diffie-Hellman outputs and feed it to [`derive_root_key`]:
//!
//! ```text
//! DH1 = DH(IKa, SPKb)   DH2 = DH(EKa, IKb)   DH3 = DH(EKa, SPKb)   [DH4 = DH(EKa, OPKb)]
//! ```
//!
//! DH4 is present only when the responder's bundle carried a one-time prekey.
//! The order is part of the protocol: a mismatch yields different root keys
//! and every later decryption fails its authentication tag.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::bundle::PreKeyBundle;
use crate::error::CryptoError;
use crate::identity::{peer_identity_to_x25519, IdentityKeyPair};
use crate::keypair::X25519KeyPair;
use crate::prekeys::verify_signed_prekey;

/// HKDF context label for root key derivation.
pub const ROOT_KEY_INFO: &[u8] = b"EmberX3DH";

pub const ROOT_KEY_LEN: usize = 32;

/// Symmetric key shared by both parties of a session.
#[derive(Clone, ZeroizeOnDrop)]
pub struct RootKey([u8; ROOT_KEY_LEN]);

impl RootKey {
    pub fn from_bytes(bytes: [u8; ROOT_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ROOT_KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for RootKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RootKey(..)")
    }
}

/// One X25519 exchange.
///
/// Rejects non-contributory results (a low-order peer key forces an all-zero
/// output that any observer could compute).
pub fn derive_shared_secret(
    my_private: &StaticSecret,
    their_public: &PublicKey,
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let shared = my_private.diffie_hellman(their_public);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("non-contributory Diffie-Hellman output".into()));
    }
    Ok(Zeroizing::new(shared.to_bytes()))
}

/// Concatenate `shared_secrets` in order and run HKDF-SHA256 with [`ROOT_KEY_INFO`].
pub fn derive_root_key(shared_secrets: &[&[u8]]) -> Result<RootKey, CryptoError> {
    if shared_secrets.is_empty() {
        return Err(CryptoError::KeyDerivation("no shared secrets supplied".into()));
    }

    let mut ikm = Zeroizing::new(Vec::with_capacity(shared_secrets.len() * 32));
    for secret in shared_secrets {
        ikm.extend_from_slice(secret);
    }

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut okm = [0u8; ROOT_KEY_LEN];
    hk.expand(ROOT_KEY_INFO, &mut okm)
        .map_err(|e| CryptoError::KeyDerivation(format!("HKDF expand failed: {e}")))?;
    let root = RootKey(okm);
    okm.zeroize();
    Ok(root)
}

/// Initiator side: verify the bundle, run three or four exchanges, derive the root key.
///
/// The one-time prekey in `their_bundle` must already be reserved on the
/// responder's side (the bundle service does this when dispensing it).
pub fn initiate_session(
    my_identity: &IdentityKeyPair,
    my_ephemeral: &X25519KeyPair,
    their_bundle: &PreKeyBundle,
) -> Result<RootKey, CryptoError> {
    let spk = &their_bundle.signed_prekey;
    if let Err(e) = verify_signed_prekey(&their_bundle.identity_key, &spk.public_key, &spk.signature) {
        tracing::warn!(
            identity = %hex::encode(their_bundle.identity_key),
            "signed prekey signature rejected — aborting session"
        );
        return Err(e);
    }

    let their_identity = peer_identity_to_x25519(&their_bundle.identity_key)?;
    let their_signed_prekey = PublicKey::from(spk.public_key);
    let ephemeral = my_ephemeral.secret();

    let dh1 = derive_shared_secret(&my_identity.to_x25519_secret(), &their_signed_prekey)?;
    let dh2 = derive_shared_secret(ephemeral, &their_identity)?;
    let dh3 = derive_shared_secret(ephemeral, &their_signed_prekey)?;

    match &their_bundle.one_time_prekey {
        Some(opk) => {
            let dh4 = derive_shared_secret(ephemeral, &PublicKey::from(opk.public_key))?;
            derive_root_key(&[&dh1[..], &dh2[..], &dh3[..], &dh4[..]])
        }
        None => {
            tracing::debug!("bundle carries no one-time prekey — using 3-DH agreement");
            derive_root_key(&[&dh1[..], &dh2[..], &dh3[..]])
        }
    }
}

/// Responder side: mirror the initiator's exchanges with our private halves.
///
/// `my_one_time_prekey` must be `Some` exactly when the initiator consumed one.
pub fn accept_session(
    my_identity: &IdentityKeyPair,
    my_signed_prekey: &StaticSecret,
    my_one_time_prekey: Option<&StaticSecret>,
    their_identity_public: &[u8; 32],
    their_ephemeral_public: &[u8; 32],
) -> Result<RootKey, CryptoError> {
    let their_identity = peer_identity_to_x25519(their_identity_public)?;
    let their_ephemeral = PublicKey::from(*their_ephemeral_public);

    let dh1 = derive_shared_secret(my_signed_prekey, &their_identity)?;
    let dh2 = derive_shared_secret(&my_identity.to_x25519_secret(), &their_ephemeral)?;
    let dh3 = derive_shared_secret(my_signed_prekey, &their_ephemeral)?;

    match my_one_time_prekey {
        Some(opk) => {
            let dh4 = derive_shared_secret(opk, &their_ephemeral)?;
            derive_root_key(&[&dh1[..], &dh2[..], &dh3[..], &dh4[..]])
        }
        None => derive_root_key(&[&dh1[..], &dh2[..], &dh3[..]]),
    }
}
