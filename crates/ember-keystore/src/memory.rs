use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::KeyStoreError;
use crate::record::{KeyKind, KeyRecord};
use crate::repository::{cursor_after, validate_batch, KeyRepository};

#[derive(Default)]
struct OwnerPool {
    records: Vec<KeyRecord>,
    next_prekey_index: u32,
}

impl OwnerPool {
    fn active(&self, kind: KeyKind) -> impl Iterator<Item = &KeyRecord> {
        self.records
            .iter()
            .filter(move |r| r.key_kind == kind && r.is_active)
    }

    fn is_registered(&self) -> bool {
        self.active(KeyKind::Identity).next().is_some()
    }

    fn has_prekey_index(&self, index: u32) -> bool {
        self.records
            .iter()
            .any(|r| r.key_kind == KeyKind::Prekey && r.key_index == Some(index))
    }
}

/// In-process repository. One lock guards every owner, so each method is
/// trivially a single transaction.
#[derive(Default)]
pub struct MemoryKeyRepository {
    owners: Mutex<HashMap<String, OwnerPool>>,
}

impl MemoryKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyRepository for MemoryKeyRepository {
    fn register_owner(&self, owner_id: &str, records: &[KeyRecord]) -> Result<(), KeyStoreError> {
        validate_batch(owner_id, records)?;
        let mut owners = self.owners.lock();

        if let Some(pool) = owners.get(owner_id) {
            if pool.is_registered() {
                return Err(KeyStoreError::AlreadyRegistered(owner_id.to_string()));
            }
            if let Some(index) = records
                .iter()
                .filter_map(|r| r.key_index)
                .find(|&index| pool.has_prekey_index(index))
            {
                return Err(KeyStoreError::Storage(format!("prekey index {index} already issued")));
            }
        }

        let pool = owners.entry(owner_id.to_string()).or_default();
        pool.next_prekey_index = cursor_after(pool.next_prekey_index, records);
        pool.records.extend_from_slice(records);
        Ok(())
    }

    fn find_active(&self, owner_id: &str, kind: KeyKind) -> Result<Option<KeyRecord>, KeyStoreError> {
        let owners = self.owners.lock();
        Ok(owners
            .get(owner_id)
            .and_then(|pool| pool.active(kind).min_by_key(|r| r.key_index))
            .cloned())
    }

    fn find_by_public(
        &self,
        owner_id: &str,
        kind: KeyKind,
        public_key: &[u8; 32],
    ) -> Result<Option<KeyRecord>, KeyStoreError> {
        let owners = self.owners.lock();
        Ok(owners
            .get(owner_id)
            .and_then(|pool| {
                pool.records
                    .iter()
                    .find(|r| r.key_kind == kind && &r.public_key == public_key)
            })
            .cloned())
    }

    fn take_prekey(&self, owner_id: &str) -> Result<Option<KeyRecord>, KeyStoreError> {
        let mut owners = self.owners.lock();
        let Some(pool) = owners.get_mut(owner_id) else {
            return Ok(None);
        };

        let lowest = pool
            .records
            .iter_mut()
            .filter(|r| r.key_kind == KeyKind::Prekey && r.is_active)
            .min_by_key(|r| r.key_index);

        Ok(lowest.map(|record| {
            record.is_active = false;
            record.clone()
        }))
    }

    fn recent_signed_prekeys(&self, owner_id: &str, limit: usize) -> Result<Vec<KeyRecord>, KeyStoreError> {
        let owners = self.owners.lock();
        Ok(owners.get(owner_id).map_or_else(Vec::new, |pool| {
            pool.records
                .iter()
                .rev()
                .filter(|r| r.key_kind == KeyKind::SignedPrekey)
                .take(limit)
                .cloned()
                .collect()
        }))
    }

    fn remove_reserved_prekey(&self, owner_id: &str, index: u32) -> Result<Option<KeyRecord>, KeyStoreError> {
        let mut owners = self.owners.lock();
        let Some(pool) = owners.get_mut(owner_id) else {
            return Ok(None);
        };

        // `remove` keeps insertion order, which `recent_signed_prekeys` relies on.
        let position = pool
            .records
            .iter()
            .position(|r| r.key_kind == KeyKind::Prekey && r.key_index == Some(index) && !r.is_active);
        Ok(position.map(|i| pool.records.remove(i)))
    }

    fn rotate_signed_prekey(&self, owner_id: &str, record: &KeyRecord) -> Result<(), KeyStoreError> {
        validate_batch(owner_id, std::slice::from_ref(record))?;
        let mut owners = self.owners.lock();
        let pool = owners
            .get_mut(owner_id)
            .filter(|pool| pool.is_registered())
            .ok_or_else(|| KeyStoreError::not_found(owner_id, KeyKind::Identity))?;

        for existing in pool
            .records
            .iter_mut()
            .filter(|r| r.key_kind == KeyKind::SignedPrekey)
        {
            existing.is_active = false;
        }
        pool.records.push(record.clone());
        Ok(())
    }

    fn insert_prekeys(&self, owner_id: &str, records: &[KeyRecord]) -> Result<(), KeyStoreError> {
        validate_batch(owner_id, records)?;
        if let Some(record) = records.iter().find(|r| r.key_kind != KeyKind::Prekey) {
            return Err(KeyStoreError::Storage(format!(
                "expected prekey records, got {}",
                record.key_kind
            )));
        }

        let mut owners = self.owners.lock();
        let pool = owners
            .get_mut(owner_id)
            .filter(|pool| pool.is_registered())
            .ok_or_else(|| KeyStoreError::not_found(owner_id, KeyKind::Identity))?;
        if let Some(index) = records
            .iter()
            .filter_map(|r| r.key_index)
            .find(|&index| index < pool.next_prekey_index || pool.has_prekey_index(index))
        {
            return Err(KeyStoreError::Storage(format!("prekey index {index} already issued")));
        }

        pool.next_prekey_index = cursor_after(pool.next_prekey_index, records);
        pool.records.extend_from_slice(records);
        Ok(())
    }

    fn count_active(&self, owner_id: &str, kind: KeyKind) -> Result<u32, KeyStoreError> {
        let owners = self.owners.lock();
        let count = owners.get(owner_id).map_or(0, |pool| pool.active(kind).count());
        u32::try_from(count).map_err(|_| KeyStoreError::Storage("active key count overflow".into()))
    }

    fn next_prekey_index(&self, owner_id: &str) -> Result<u32, KeyStoreError> {
        let owners = self.owners.lock();
        Ok(owners.get(owner_id).map_or(0, |pool| pool.next_prekey_index))
    }
}
