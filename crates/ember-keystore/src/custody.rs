//! NON-PRODUCTION server-held key custody.
//!
//! Lets the key store act as the responder of a session using private halves
//! it persisted under [`crate::config::KeyCustody::ServerHeld`]. Anyone with
//! access to such a store can derive every session key, so this exists only
//! to drive the protocol end to end in demos and tests. Real responders hold
//! their private keys in an [`crate::keyring::OwnerKeyring`].

use ember_crypto::{accept_session, IdentityKeyPair, RootKey, SessionHeader, X25519KeyPair};
use zeroize::Zeroizing;

use crate::error::KeyStoreError;
use crate::record::{timestamp_now, KeyKind, KeyRecord};
use crate::repository::KeyRepository;

pub struct ServerCustody<'a> {
    repo: &'a dyn KeyRepository,
}

impl<'a> ServerCustody<'a> {
    pub(crate) fn new(repo: &'a dyn KeyRepository) -> Self {
        Self { repo }
    }

    /// Derive the responder's root key for `header` and delete the consumed
    /// one-time prekey.
    ///
    /// The header must name the active signed prekey or, until it expires, the
    /// one it replaced. A one-time prekey is only usable after a bundle handed
    /// it out, and it is removed before agreement, so a replayed header fails
    /// with [`KeyStoreError::KeyNotFound`].
    pub fn accept_session(&self, owner_id: &str, header: &SessionHeader) -> Result<RootKey, KeyStoreError> {
        let identity = self
            .repo
            .find_active(owner_id, KeyKind::Identity)?
            .ok_or_else(|| KeyStoreError::not_found(owner_id, KeyKind::Identity))?;
        let signed_prekey = self.current_signed_prekey(owner_id, &header.signed_prekey)?;

        let one_time_prekey = match header.one_time_prekey_index {
            Some(index) => {
                let record = self
                    .repo
                    .remove_reserved_prekey(owner_id, index)?
                    .ok_or_else(|| KeyStoreError::not_found(owner_id, KeyKind::Prekey))?;
                tracing::debug!(owner = %owner_id, index, "purged consumed one-time prekey");
                Some(X25519KeyPair::from_secret_bytes(*private_half(&record)?))
            }
            None => None,
        };

        let identity = IdentityKeyPair::from_secret_bytes(&*private_half(&identity)?);
        let signed_prekey = X25519KeyPair::from_secret_bytes(*private_half(&signed_prekey)?);

        Ok(accept_session(
            &identity,
            signed_prekey.secret(),
            one_time_prekey.as_ref().map(X25519KeyPair::secret),
            &header.identity_key,
            &header.ephemeral_key,
        )?)
    }

    /// The signed prekey with `public_key`, if it is the active one or the
    /// unexpired one before it.
    fn current_signed_prekey(&self, owner_id: &str, public_key: &[u8; 32]) -> Result<KeyRecord, KeyStoreError> {
        let now = timestamp_now();
        self.repo
            .recent_signed_prekeys(owner_id, 2)?
            .into_iter()
            .enumerate()
            .find(|(position, record)| {
                &record.public_key == public_key && (record.is_active || (*position == 1 && !record.is_expired(now)))
            })
            .map(|(_, record)| record)
            .ok_or_else(|| KeyStoreError::not_found(owner_id, KeyKind::SignedPrekey))
    }
}

fn private_half(record: &KeyRecord) -> Result<Zeroizing<[u8; 32]>, KeyStoreError> {
    record.private_key.clone().ok_or_else(|| {
        KeyStoreError::Config(format!(
            "no server-held private key for {} record {}",
            record.key_kind, record.id
        ))
    })
}
