//! Key records, transactional repositories and prekey bundle dispensing.
//!
//! [`KeyService`] registers owners, hands out [`ember_crypto::PreKeyBundle`]s
//! and manages prekey rotation and replenishment on top of any
//! [`KeyRepository`]. Private key halves stay with the owner
//! ([`OwnerKeyring`]) unless the policy opts into server-held custody.

pub mod config;
pub mod custody;
pub mod error;
pub mod keyring;
pub mod memory;
pub mod record;
pub mod repository;
pub mod service;
pub mod sqlite;

pub use config::{KeyCustody, KeyPolicy};
pub use custody::ServerCustody;
pub use error::KeyStoreError;
pub use keyring::OwnerKeyring;
pub use memory::MemoryKeyRepository;
pub use record::{KeyKind, KeyRecord};
pub use repository::KeyRepository;
pub use service::{KeyService, OwnerPrivateKeys, PrekeyStatus, PublishedKeys, UserKeySetup};
pub use sqlite::SqliteKeyRepository;
