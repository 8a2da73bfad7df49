//! Registration, bundle dispensing and prekey lifecycle for key owners.

use ember_crypto::prekeys::generate_prekey_batch;
use ember_crypto::{
    generate_identity_keypair, generate_signed_prekey, IdentityKeyPair, OneTimePrekey,
    OneTimePrekeyPublic, PreKeyBundle, SignedPrekey, SignedPrekeyPublic,
};

use crate::config::KeyPolicy;
use crate::custody::ServerCustody;
use crate::error::KeyStoreError;
use crate::record::{timestamp_now, KeyKind, KeyRecord};
use crate::repository::KeyRepository;

/// Public halves produced at registration, safe to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedKeys {
    pub identity_public: [u8; 32],
    pub signed_prekey: SignedPrekeyPublic,
    pub prekeys: Vec<OneTimePrekeyPublic>,
}

/// Private halves produced at registration. Returned to the owner only.
#[derive(Debug)]
pub struct OwnerPrivateKeys {
    pub identity: IdentityKeyPair,
    pub signed_prekey: SignedPrekey,
    pub prekeys: Vec<OneTimePrekey>,
}

#[derive(Debug)]
pub struct UserKeySetup {
    pub published: PublishedKeys,
    pub private_keys: OwnerPrivateKeys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrekeyStatus {
    pub active_prekeys: u32,
    pub needs_replenish: bool,
    pub signed_prekey_expires_at: Option<u64>,
    pub needs_rotation: bool,
}

pub struct KeyService {
    repo: Box<dyn KeyRepository>,
    policy: KeyPolicy,
}

impl KeyService {
    pub fn new(repo: Box<dyn KeyRepository>, policy: KeyPolicy) -> Result<Self, KeyStoreError> {
        policy.validate()?;
        if policy.stores_private_keys() {
            tracing::warn!("server-held key custody enabled — private keys will be persisted (non-production)");
        }
        Ok(Self { repo, policy })
    }

    pub fn policy(&self) -> &KeyPolicy {
        &self.policy
    }

    /// The backing repository, for read-side inspection.
    pub fn repository(&self) -> &dyn KeyRepository {
        self.repo.as_ref()
    }

    /// Register an owner with the policy's batch size.
    pub fn register(&self, owner_id: &str) -> Result<UserKeySetup, KeyStoreError> {
        self.setup_user_keys(owner_id, self.policy.prekey_batch_size)
    }

    /// Generate and persist an identity, a signed prekey and `num_prekeys`
    /// one-time prekeys (indexes `0..num_prekeys`) in one transaction.
    pub fn setup_user_keys(&self, owner_id: &str, num_prekeys: u32) -> Result<UserKeySetup, KeyStoreError> {
        let identity = generate_identity_keypair()?;
        let signed_prekey = generate_signed_prekey(&identity)?;
        let prekeys = generate_prekey_batch(0, num_prekeys)?;
        let now = timestamp_now();

        let mut records = Vec::with_capacity(prekeys.len() + 2);
        records.push(
            KeyRecord::new(owner_id, KeyKind::Identity, identity.public_key_bytes(), now)?
                .with_private_key(self.custody_copy(*identity.secret_key_bytes())),
        );
        records.push(self.signed_prekey_record(owner_id, &signed_prekey, now)?);
        for prekey in &prekeys {
            records.push(self.prekey_record(owner_id, prekey, now)?);
        }

        self.repo.register_owner(owner_id, &records)?;
        tracing::info!(owner = %owner_id, prekeys = num_prekeys, "registered key owner");

        let published = PublishedKeys {
            identity_public: identity.public_key_bytes(),
            signed_prekey: SignedPrekeyPublic::from(&signed_prekey),
            prekeys: prekeys.iter().map(prekey_public).collect(),
        };
        Ok(UserKeySetup {
            published,
            private_keys: OwnerPrivateKeys {
                identity,
                signed_prekey,
                prekeys,
            },
        })
    }

    /// Assemble a bundle for an initiator, reserving one one-time prekey.
    ///
    /// The reserved prekey is never handed out again. When none remain the
    /// bundle omits it and agreement falls back to three exchanges.
    pub fn get_bundle(&self, owner_id: &str) -> Result<PreKeyBundle, KeyStoreError> {
        let identity = self
            .repo
            .find_active(owner_id, KeyKind::Identity)?
            .ok_or_else(|| KeyStoreError::not_found(owner_id, KeyKind::Identity))?;
        let signed_prekey = self
            .repo
            .find_active(owner_id, KeyKind::SignedPrekey)?
            .ok_or_else(|| KeyStoreError::not_found(owner_id, KeyKind::SignedPrekey))?;
        if signed_prekey.is_expired(timestamp_now()) {
            return Err(KeyStoreError::SignedPrekeyExpired(owner_id.to_string()));
        }
        let signature = signed_prekey
            .signature
            .ok_or_else(|| KeyStoreError::Storage(format!("signed prekey {} has no signature", signed_prekey.id)))?;

        // Reserve last so a failed lookup above never burns a prekey.
        let one_time_prekey = match self.reserve_one_time_prekey(owner_id) {
            Ok(prekey) => Some(prekey),
            Err(KeyStoreError::PrekeyExhausted(_)) => {
                tracing::warn!(owner = %owner_id, "one-time prekeys exhausted — bundle falls back to 3-DH");
                None
            }
            Err(e) => return Err(e),
        };

        Ok(PreKeyBundle {
            identity_key: identity.public_key,
            signed_prekey: SignedPrekeyPublic {
                public_key: signed_prekey.public_key,
                signature,
            },
            one_time_prekey,
        })
    }

    /// Atomically deactivate and return the owner's lowest-indexed one-time prekey.
    pub fn reserve_one_time_prekey(&self, owner_id: &str) -> Result<OneTimePrekeyPublic, KeyStoreError> {
        let record = self
            .repo
            .take_prekey(owner_id)?
            .ok_or_else(|| KeyStoreError::PrekeyExhausted(owner_id.to_string()))?;
        let index = record
            .key_index
            .ok_or_else(|| KeyStoreError::Storage(format!("prekey {} has no index", record.id)))?;

        let remaining = self.repo.count_active(owner_id, KeyKind::Prekey)?;
        if remaining <= self.policy.prekey_low_water_mark {
            tracing::warn!(owner = %owner_id, remaining, "one-time prekey pool low — replenish");
        }
        tracing::debug!(owner = %owner_id, index, remaining, "dispensed one-time prekey");

        Ok(OneTimePrekeyPublic {
            index,
            public_key: record.public_key,
        })
    }

    /// Replace the owner's signed prekey with a fresh one signed by `identity`.
    ///
    /// The previous signed prekey is deactivated but kept, so sessions
    /// initiated against it just before rotation can still be accepted.
    pub fn rotate_signed_prekey(
        &self,
        owner_id: &str,
        identity: &IdentityKeyPair,
    ) -> Result<SignedPrekey, KeyStoreError> {
        let registered = self
            .repo
            .find_active(owner_id, KeyKind::Identity)?
            .ok_or_else(|| KeyStoreError::not_found(owner_id, KeyKind::Identity))?;
        if registered.public_key != identity.public_key_bytes() {
            return Err(KeyStoreError::IdentityMismatch(owner_id.to_string()));
        }

        let signed_prekey = generate_signed_prekey(identity)?;
        let record = self.signed_prekey_record(owner_id, &signed_prekey, timestamp_now())?;
        self.repo.rotate_signed_prekey(owner_id, &record)?;

        tracing::info!(owner = %owner_id, expires_at = ?record.expires_at, "rotated signed prekey");
        Ok(signed_prekey)
    }

    /// Append `count` one-time prekeys with indexes above any ever issued.
    ///
    /// Two concurrent calls for the same owner may pick the same starting
    /// index; the loser fails with a retryable storage error.
    pub fn replenish_prekeys(&self, owner_id: &str, count: u32) -> Result<Vec<OneTimePrekey>, KeyStoreError> {
        let first_index = self.repo.next_prekey_index(owner_id)?;
        let prekeys = generate_prekey_batch(first_index, count)?;
        let now = timestamp_now();

        let records = prekeys
            .iter()
            .map(|prekey| self.prekey_record(owner_id, prekey, now))
            .collect::<Result<Vec<_>, _>>()?;
        self.repo.insert_prekeys(owner_id, &records)?;

        tracing::info!(owner = %owner_id, first_index, count, "replenished one-time prekeys");
        Ok(prekeys)
    }

    pub fn prekey_status(&self, owner_id: &str) -> Result<PrekeyStatus, KeyStoreError> {
        let signed_prekey = self
            .repo
            .find_active(owner_id, KeyKind::SignedPrekey)?
            .ok_or_else(|| KeyStoreError::not_found(owner_id, KeyKind::SignedPrekey))?;
        let active_prekeys = self.repo.count_active(owner_id, KeyKind::Prekey)?;

        Ok(PrekeyStatus {
            active_prekeys,
            needs_replenish: active_prekeys <= self.policy.prekey_low_water_mark,
            signed_prekey_expires_at: signed_prekey.expires_at,
            needs_rotation: signed_prekey.is_expired(timestamp_now()),
        })
    }

    /// Responder backed by server-held private keys.
    ///
    /// Fails with [`KeyStoreError::Config`] unless the policy opts into
    /// [`crate::config::KeyCustody::ServerHeld`].
    pub fn server_custody(&self) -> Result<ServerCustody<'_>, KeyStoreError> {
        if !self.policy.stores_private_keys() {
            return Err(KeyStoreError::Config(
                "server custody requires custody = \"server_held\"".into(),
            ));
        }
        Ok(ServerCustody::new(self.repo.as_ref()))
    }

    fn custody_copy(&self, secret: [u8; 32]) -> Option<[u8; 32]> {
        self.policy.stores_private_keys().then_some(secret)
    }

    fn signed_prekey_record(
        &self,
        owner_id: &str,
        signed_prekey: &SignedPrekey,
        now: u64,
    ) -> Result<KeyRecord, KeyStoreError> {
        let expires_at = now.saturating_add(self.policy.signed_prekey_lifetime_secs);
        Ok(
            KeyRecord::new(owner_id, KeyKind::SignedPrekey, signed_prekey.keypair.public_bytes(), now)?
                .with_private_key(self.custody_copy(signed_prekey.keypair.secret_bytes()))
                .with_signature(signed_prekey.signature_bytes().to_vec(), expires_at),
        )
    }

    fn prekey_record(&self, owner_id: &str, prekey: &OneTimePrekey, now: u64) -> Result<KeyRecord, KeyStoreError> {
        Ok(
            KeyRecord::new(owner_id, KeyKind::Prekey, prekey.keypair.public_bytes(), now)?
                .with_private_key(self.custody_copy(prekey.keypair.secret_bytes()))
                .with_index(prekey.index),
        )
    }
}

fn prekey_public(prekey: &OneTimePrekey) -> OneTimePrekeyPublic {
    OneTimePrekeyPublic {
        index: prekey.index,
        public_key: prekey.keypair.public_bytes(),
    }
}
