//! Storage contract for key records.
//!
//! Every method is a single transaction: implementations must either apply
//! all of a multi-record write or none of it, and `take_prekey` must be an
//! atomic select-and-deactivate so two callers never receive the same
//! one-time prekey.

use crate::error::KeyStoreError;
use crate::record::{KeyKind, KeyRecord};

pub trait KeyRepository: Send + Sync {
    /// Insert an owner's initial key set.
    ///
    /// Fails with [`KeyStoreError::AlreadyRegistered`] if the owner already has
    /// an active identity. Advances the owner's prekey cursor past every
    /// prekey index in `records`.
    fn register_owner(&self, owner_id: &str, records: &[KeyRecord]) -> Result<(), KeyStoreError>;

    /// The owner's active key of `kind`. For prekeys, the lowest active index.
    fn find_active(&self, owner_id: &str, kind: KeyKind) -> Result<Option<KeyRecord>, KeyStoreError>;

    /// A key of `kind` with the given public half, active or not.
    fn find_by_public(
        &self,
        owner_id: &str,
        kind: KeyKind,
        public_key: &[u8; 32],
    ) -> Result<Option<KeyRecord>, KeyStoreError>;

    /// Deactivate and return the lowest-indexed active one-time prekey.
    fn take_prekey(&self, owner_id: &str) -> Result<Option<KeyRecord>, KeyStoreError>;

    /// The owner's signed prekeys, newest first, at most `limit` of them.
    ///
    /// The first entry is the active one; the next is the one it replaced.
    fn recent_signed_prekeys(&self, owner_id: &str, limit: usize) -> Result<Vec<KeyRecord>, KeyStoreError>;

    /// Physically delete a one-time prekey that `take_prekey` already
    /// reserved, returning it. Active (never dispensed) prekeys are left in
    /// place and yield `None`.
    fn remove_reserved_prekey(&self, owner_id: &str, index: u32) -> Result<Option<KeyRecord>, KeyStoreError>;

    /// Deactivate the current signed prekey and insert `record` in its place.
    fn rotate_signed_prekey(&self, owner_id: &str, record: &KeyRecord) -> Result<(), KeyStoreError>;

    /// Append one-time prekeys. Indexes must be unused for this owner.
    fn insert_prekeys(&self, owner_id: &str, records: &[KeyRecord]) -> Result<(), KeyStoreError>;

    fn count_active(&self, owner_id: &str, kind: KeyKind) -> Result<u32, KeyStoreError>;

    /// One past the highest prekey index ever issued to the owner, including
    /// prekeys that have since been deleted.
    fn next_prekey_index(&self, owner_id: &str) -> Result<u32, KeyStoreError>;
}

/// Checks shared by every backend before a batch is written.
pub(crate) fn validate_batch(owner_id: &str, records: &[KeyRecord]) -> Result<(), KeyStoreError> {
    let mut identities = 0;
    let mut signed_prekeys = 0;
    let mut indexes = std::collections::HashSet::new();

    for record in records {
        if record.owner_id != owner_id {
            return Err(KeyStoreError::Storage(format!(
                "record {} belongs to {}, not {owner_id}",
                record.id, record.owner_id
            )));
        }
        match record.key_kind {
            KeyKind::Identity if record.is_active => identities += 1,
            KeyKind::SignedPrekey if record.is_active => signed_prekeys += 1,
            KeyKind::Prekey => {
                let index = record
                    .key_index
                    .ok_or_else(|| KeyStoreError::Storage(format!("prekey record {} has no index", record.id)))?;
                if !indexes.insert(index) {
                    return Err(KeyStoreError::Storage(format!("duplicate prekey index {index}")));
                }
            }
            _ => {}
        }
    }

    if identities > 1 || signed_prekeys > 1 {
        return Err(KeyStoreError::Storage(
            "batch holds more than one active identity or signed prekey".into(),
        ));
    }
    Ok(())
}

/// Cursor value after inserting `records`: one past their highest prekey index.
pub(crate) fn cursor_after(current: u32, records: &[KeyRecord]) -> u32 {
    records
        .iter()
        .filter_map(|r| r.key_index)
        .map(|index| index.saturating_add(1))
        .fold(current, u32::max)
}
