//! Property-based tests for key agreement and message encryption.
//!
//! 1. **DH symmetry**: both parties of an exchange compute the same secret
//! 2. **Round-trip**: decrypt(encrypt(p, k), k) == p
//! 3. **Tamper detection**: any single flipped ciphertext bit fails the tag check
//! 4. **Agreement**: initiator and responder derive the same root key, with and
//!    without a one-time prekey

use ember_crypto::bundle::{OneTimePrekeyPublic, PreKeyBundle, SignedPrekeyPublic};
use ember_crypto::cipher::{decrypt, encrypt, KEY_LEN};
use ember_crypto::x3dh::{accept_session, derive_shared_secret, initiate_session};
use ember_crypto::{generate_prekey, generate_signed_prekey, CryptoError, IdentityKeyPair, X25519KeyPair};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_encrypt_decrypt_roundtrip(
        plaintext in prop::collection::vec(any::<u8>(), 0..2048),
        key in any::<[u8; KEY_LEN]>(),
    ) {
        let sealed = encrypt(&plaintext, &key).unwrap();
        prop_assert_eq!(sealed.ciphertext.len(), plaintext.len() + 16);

        let opened = decrypt(&sealed.ciphertext, &sealed.nonce, &key).unwrap();
        prop_assert_eq!(opened, plaintext);
    }

    #[test]
    fn prop_single_bit_flip_is_detected(
        plaintext in prop::collection::vec(any::<u8>(), 1..512),
        key in any::<[u8; KEY_LEN]>(),
        position in any::<prop::sample::Index>(),
    ) {
        let sealed = encrypt(&plaintext, &key).unwrap();
        let bit = position.index(sealed.ciphertext.len() * 8);

        let mut tampered = sealed.ciphertext.clone();
        tampered[bit / 8] ^= 1 << (bit % 8);

        let result = decrypt(&tampered, &sealed.nonce, &key);
        prop_assert!(matches!(result, Err(CryptoError::AuthenticationTag)));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_dh_is_symmetric(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
        let alice = X25519KeyPair::from_secret_bytes(a);
        let bob = X25519KeyPair::from_secret_bytes(b);

        let ab = derive_shared_secret(alice.secret(), bob.public_key()).unwrap();
        let ba = derive_shared_secret(bob.secret(), alice.public_key()).unwrap();
        prop_assert_eq!(*ab, *ba);
    }

    #[test]
    fn prop_initiator_and_responder_agree(with_one_time in any::<bool>(), index in any::<u32>()) {
        let bob = IdentityKeyPair::generate().unwrap();
        let spk = generate_signed_prekey(&bob).unwrap();
        let opk = generate_prekey(index).unwrap();
        let bundle = PreKeyBundle {
            identity_key: bob.public_key_bytes(),
            signed_prekey: SignedPrekeyPublic::from(&spk),
            one_time_prekey: with_one_time.then(|| OneTimePrekeyPublic {
                index: opk.index,
                public_key: opk.keypair.public_bytes(),
            }),
        };

        let alice = IdentityKeyPair::generate().unwrap();
        let ephemeral = X25519KeyPair::generate().unwrap();
        let sent = initiate_session(&alice, &ephemeral, &bundle).unwrap();
        let received = accept_session(
            &bob,
            spk.keypair.secret(),
            with_one_time.then(|| opk.keypair.secret()),
            &alice.public_key_bytes(),
            &ephemeral.public_bytes(),
        )
        .unwrap();

        prop_assert_eq!(sent.as_bytes(), received.as_bytes());
    }
}
