//! Per-message keys derived from a session's root key.
//!
//! Each direction of a session gets its own chain seeded from the root key.
//! Every message steps the chain with HKDF-SHA256, yielding a one-use message
//! key and the next chain key, so a message key never encrypts twice and old
//! chain keys are dropped as the chain advances.

use std::collections::BTreeMap;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::cipher::{self, EncryptedMessage, KEY_LEN};
use crate::error::CryptoError;
use crate::x3dh::RootKey;

/// Maximum number of message keys held for out-of-order delivery.
pub const MAX_SKIP: u64 = 1000;

const INITIATOR_CHAIN_INFO: &[u8] = b"EmberChainInitiator";
const RESPONDER_CHAIN_INFO: &[u8] = b"EmberChainResponder";
const MESSAGE_KEY_INFO: &[u8] = b"EmberMsgKey";
const NEXT_CHAIN_INFO: &[u8] = b"EmberChainKey";

/// Which side of the X3DH agreement this party played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Clone, ZeroizeOnDrop)]
struct ChainKey([u8; KEY_LEN]);

type MessageKey = Zeroizing<[u8; KEY_LEN]>;

impl ChainKey {
    fn seed(root: &RootKey, info: &[u8]) -> Result<Self, CryptoError> {
        let mut key = [0u8; KEY_LEN];
        expand(root.as_bytes(), info, &mut key)?;
        Ok(Self(key))
    }

    /// Derive this step's message key and the following chain key.
    fn step(&self) -> Result<(Self, MessageKey), CryptoError> {
        let mut message_key = Zeroizing::new([0u8; KEY_LEN]);
        let mut next = [0u8; KEY_LEN];
        expand(&self.0, MESSAGE_KEY_INFO, &mut message_key[..])?;
        expand(&self.0, NEXT_CHAIN_INFO, &mut next)?;
        Ok((Self(next), message_key))
    }
}

fn expand(ikm: &[u8], info: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
    Hkdf::<Sha256>::new(None, ikm)
        .expand(info, out)
        .map_err(|e| CryptoError::KeyDerivation(format!("HKDF expand failed: {e}")))
}

/// A message sealed under a chain-derived key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainedMessage {
    pub counter: u64,
    pub sealed: EncryptedMessage,
}

/// Both directions of a session's message-key chains.
pub struct ChainedSession {
    sending: ChainKey,
    send_counter: u64,
    receiving: ChainKey,
    recv_counter: u64,
    skipped: BTreeMap<u64, MessageKey>,
}

impl ChainedSession {
    pub fn new(root: &RootKey, role: Role) -> Result<Self, CryptoError> {
        let (send_info, recv_info) = match role {
            Role::Initiator => (INITIATOR_CHAIN_INFO, RESPONDER_CHAIN_INFO),
            Role::Responder => (RESPONDER_CHAIN_INFO, INITIATOR_CHAIN_INFO),
        };
        Ok(Self {
            sending: ChainKey::seed(root, send_info)?,
            send_counter: 0,
            receiving: ChainKey::seed(root, recv_info)?,
            recv_counter: 0,
            skipped: BTreeMap::new(),
        })
    }

    /// Encrypt the next outgoing message. `associated_data` is bound alongside the counter.
    pub fn seal(&mut self, plaintext: &[u8], associated_data: &[u8]) -> Result<ChainedMessage, CryptoError> {
        let counter = self.send_counter;
        let (next, message_key) = self.sending.step()?;
        let sealed =
            cipher::encrypt_with_context(plaintext, &message_key, &bind_counter(associated_data, counter))?;

        self.sending = next;
        self.send_counter += 1;
        Ok(ChainedMessage { counter, sealed })
    }

    /// Decrypt an incoming message, tolerating bounded reordering.
    ///
    /// Chain state only advances when the tag verifies, so forged messages
    /// cannot push the receiving chain forward.
    pub fn open(&mut self, message: &ChainedMessage, associated_data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let aad = bind_counter(associated_data, message.counter);

        if message.counter < self.recv_counter {
            let key = self.skipped.get(&message.counter).ok_or_else(|| {
                CryptoError::MessageKeyUnavailable(format!(
                    "message {} already consumed or too old",
                    message.counter
                ))
            })?;
            let plaintext =
                cipher::decrypt_with_context(&message.sealed.ciphertext, &message.sealed.nonce, key, &aad)?;
            self.skipped.remove(&message.counter);
            return Ok(plaintext);
        }

        let gap = message.counter - self.recv_counter;
        if gap > MAX_SKIP {
            return Err(CryptoError::MessageKeyUnavailable(format!(
                "message {} skips {gap} keys (limit {MAX_SKIP})",
                message.counter
            )));
        }

        let mut chain = self.receiving.clone();
        let mut passed = Vec::new();
        for counter in self.recv_counter..message.counter {
            let (next, key) = chain.step()?;
            passed.push((counter, key));
            chain = next;
        }
        let (next, key) = chain.step()?;
        let plaintext =
            cipher::decrypt_with_context(&message.sealed.ciphertext, &message.sealed.nonce, &key, &aad)?;

        if !passed.is_empty() {
            tracing::debug!(
                counter = message.counter,
                skipped = passed.len(),
                "holding keys for out-of-order messages"
            );
        }
        self.receiving = next;
        self.recv_counter = message.counter + 1;
        self.skipped.extend(passed);
        while self.skipped.len() as u64 > MAX_SKIP {
            self.skipped.pop_first();
        }
        Ok(plaintext)
    }
}

fn bind_counter(associated_data: &[u8], counter: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(associated_data.len() + 8);
    aad.extend_from_slice(associated_data);
    aad.extend_from_slice(&counter.to_be_bytes());
    aad
}
