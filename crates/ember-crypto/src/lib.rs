//! Key material, X3DH agreement and message encryption for Ember.
//!
//! This crate holds no storage: key records, bundle dispensing and
//! one-time-prekey bookkeeping live in `ember-keystore`.

pub mod bundle;
pub mod chain;
pub mod cipher;
pub mod error;
pub mod identity;
pub mod keypair;
pub mod prekeys;
pub mod rng;
pub mod x3dh;

pub use bundle::{OneTimePrekeyPublic, PreKeyBundle, SessionHeader, SignedPrekeyPublic};
pub use cipher::{decrypt, encrypt, EncryptedMessage};
pub use error::CryptoError;
pub use identity::{generate_identity_keypair, IdentityKeyPair};
pub use keypair::X25519KeyPair;
pub use prekeys::{generate_prekey, generate_signed_prekey, OneTimePrekey, SignedPrekey};
pub use x3dh::{accept_session, initiate_session, RootKey};
