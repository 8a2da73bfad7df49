use std::collections::HashMap;

use ember_crypto::{accept_session, IdentityKeyPair, OneTimePrekey, RootKey, SessionHeader, SignedPrekey};

use crate::error::KeyStoreError;
use crate::record::KeyKind;
use crate::service::OwnerPrivateKeys;

/// The private halves an owner keeps on their own device.
///
/// Holds the current signed prekey and the one it replaced, so a session
/// started against a bundle fetched just before rotation still completes.
#[derive(Debug)]
pub struct OwnerKeyring {
    owner_id: String,
    identity: IdentityKeyPair,
    signed_prekey: SignedPrekey,
    previous_signed_prekey: Option<SignedPrekey>,
    one_time_prekeys: HashMap<u32, OneTimePrekey>,
}

impl OwnerKeyring {
    pub fn new(owner_id: &str, keys: OwnerPrivateKeys) -> Self {
        let mut keyring = Self {
            owner_id: owner_id.to_string(),
            identity: keys.identity,
            signed_prekey: keys.signed_prekey,
            previous_signed_prekey: None,
            one_time_prekeys: HashMap::new(),
        };
        keyring.add_prekeys(keys.prekeys);
        keyring
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn identity(&self) -> &IdentityKeyPair {
        &self.identity
    }

    pub fn install_signed_prekey(&mut self, signed_prekey: SignedPrekey) {
        let retired = std::mem::replace(&mut self.signed_prekey, signed_prekey);
        self.previous_signed_prekey = Some(retired);
    }

    pub fn add_prekeys(&mut self, prekeys: Vec<OneTimePrekey>) {
        self.one_time_prekeys
            .extend(prekeys.into_iter().map(|prekey| (prekey.index, prekey)));
    }

    pub fn one_time_prekey_count(&self) -> usize {
        self.one_time_prekeys.len()
    }

    /// Derive the responder's root key for an initial message header.
    ///
    /// The consumed one-time prekey is dropped only after agreement succeeds;
    /// a second header naming the same index fails with
    /// [`KeyStoreError::KeyNotFound`].
    pub fn accept_session(&mut self, header: &SessionHeader) -> Result<RootKey, KeyStoreError> {
        let signed_prekey = [Some(&self.signed_prekey), self.previous_signed_prekey.as_ref()]
            .into_iter()
            .flatten()
            .find(|spk| spk.keypair.public_bytes() == header.signed_prekey)
            .ok_or_else(|| KeyStoreError::not_found(&self.owner_id, KeyKind::SignedPrekey))?;

        let one_time_prekey = header
            .one_time_prekey_index
            .map(|index| {
                self.one_time_prekeys
                    .get(&index)
                    .ok_or_else(|| KeyStoreError::not_found(&self.owner_id, KeyKind::Prekey))
            })
            .transpose()?;

        let root = accept_session(
            &self.identity,
            signed_prekey.keypair.secret(),
            one_time_prekey.map(|prekey| prekey.keypair.secret()),
            &header.identity_key,
            &header.ephemeral_key,
        )?;

        if let Some(index) = header.one_time_prekey_index {
            self.one_time_prekeys.remove(&index);
        }
        Ok(root)
    }
}
