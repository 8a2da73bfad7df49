//! End-to-end key lifecycle against both repositories: registration, bundle
//! dispensing, agreement, rotation and replenishment.

use std::collections::HashSet;

use ember_crypto::cipher::{associated_data, decrypt, decrypt_with_context, encrypt, encrypt_with_context};
use ember_crypto::{initiate_session, CryptoError, IdentityKeyPair, PreKeyBundle, SessionHeader, X25519KeyPair};
use ember_keystore::{
    KeyCustody, KeyKind, KeyPolicy, KeyRecord, KeyRepository, KeyService, KeyStoreError, MemoryKeyRepository,
    OwnerKeyring, SqliteKeyRepository,
};

fn backends() -> Vec<(&'static str, Box<dyn KeyRepository>)> {
    vec![
        ("memory", Box::new(MemoryKeyRepository::new()) as Box<dyn KeyRepository>),
        ("sqlite", Box::new(SqliteKeyRepository::open_in_memory().unwrap()) as Box<dyn KeyRepository>),
    ]
}

fn services(policy: &KeyPolicy) -> Vec<(&'static str, KeyService)> {
    backends()
        .into_iter()
        .map(|(name, repo)| (name, KeyService::new(repo, policy.clone()).unwrap()))
        .collect()
}

fn initiate(bundle: &PreKeyBundle) -> ([u8; 32], SessionHeader) {
    let initiator = IdentityKeyPair::generate().unwrap();
    let ephemeral = X25519KeyPair::generate().unwrap();
    let root = initiate_session(&initiator, &ephemeral, bundle).unwrap();
    let header = SessionHeader::new(&initiator, &ephemeral, bundle);
    (*root.as_bytes(), header)
}

#[test]
fn dispensed_prekey_is_never_handed_out_again() {
    for (name, service) in services(&KeyPolicy::default()) {
        let alice = service.register("alice").unwrap();
        service.register("bob").unwrap();

        let for_bob = service.get_bundle("alice").unwrap();
        assert_eq!(for_bob.one_time_prekey.map(|p| p.index), Some(0), "{name}");
        assert_eq!(service.prekey_status("alice").unwrap().active_prekeys, 99, "{name}");

        let first = &alice.published.prekeys[0];
        assert_eq!(first.index, 0, "{name}");
        let reserved = service
            .repository()
            .find_by_public("alice", KeyKind::Prekey, &first.public_key)
            .unwrap()
            .unwrap();
        assert!(!reserved.is_active, "{name}");

        for _ in 0..99 {
            let bundle = service.get_bundle("alice").unwrap();
            assert_ne!(bundle.one_time_prekey.map(|p| p.index), Some(0), "{name}");
        }
        assert!(service.get_bundle("alice").unwrap().one_time_prekey.is_none(), "{name}");
    }
}

#[test]
fn initiator_and_owner_derive_the_same_root_key() {
    for (name, service) in services(&KeyPolicy::default()) {
        let bob_setup = service.setup_user_keys("bob", 10).unwrap();
        let mut bob = OwnerKeyring::new("bob", bob_setup.private_keys);

        let bundle = service.get_bundle("bob").unwrap();
        assert!(bundle.one_time_prekey.is_some(), "{name}");
        let (alice_root, header) = initiate(&bundle);

        let bob_root = bob.accept_session(&header).unwrap();
        assert_eq!(&alice_root, bob_root.as_bytes(), "{name}");

        let sealed = encrypt(b"first contact", &alice_root).unwrap();
        assert_eq!(decrypt(&sealed.ciphertext, &sealed.nonce, bob_root.as_bytes()).unwrap(), b"first contact");
    }
}

#[test]
fn exhausted_pool_degrades_to_three_exchanges() {
    for (name, service) in services(&KeyPolicy::default()) {
        let setup = service.setup_user_keys("bob", 0).unwrap();
        let mut bob = OwnerKeyring::new("bob", setup.private_keys);

        let bundle = service.get_bundle("bob").unwrap();
        assert!(bundle.one_time_prekey.is_none(), "{name}");
        let (alice_root, header) = initiate(&bundle);
        assert_eq!(header.one_time_prekey_index, None);

        assert_eq!(&alice_root, bob.accept_session(&header).unwrap().as_bytes(), "{name}");
    }
}

#[test]
fn hello_under_zero_key() {
    let key = [0u8; 32];
    let sealed = encrypt(b"hello", &key).unwrap();
    assert_eq!(sealed.ciphertext.len(), 5 + 16);
    assert_eq!(decrypt(&sealed.ciphertext, &sealed.nonce, &key).unwrap(), b"hello");
}

#[test]
fn concurrent_bundle_requests_get_distinct_prekeys() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 10;

    for (name, service) in services(&KeyPolicy::default()) {
        service.setup_user_keys("alice", 64).unwrap();

        let dispensed: Vec<Option<u32>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        (0..PER_THREAD)
                            .map(|_| service.get_bundle("alice").unwrap().one_time_prekey.map(|p| p.index))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });

        let indexes: Vec<u32> = dispensed.iter().filter_map(|i| *i).collect();
        let unique: HashSet<u32> = indexes.iter().copied().collect();
        assert_eq!(indexes.len(), 64, "{name}");
        assert_eq!(unique.len(), indexes.len(), "{name}: a prekey was dispensed twice");
        assert_eq!(dispensed.len() - indexes.len(), THREADS * PER_THREAD - 64, "{name}");
    }
}

#[test]
fn second_registration_keeps_the_first_key_set() {
    for (name, service) in services(&KeyPolicy::default()) {
        let first = service.setup_user_keys("alice", 3).unwrap();

        let err = service.setup_user_keys("alice", 3).unwrap_err();
        assert!(matches!(err, KeyStoreError::AlreadyRegistered(_)), "{name}: {err}");

        let bundle = service.get_bundle("alice").unwrap();
        assert_eq!(bundle.identity_key, first.published.identity_public, "{name}");
        assert_eq!(service.prekey_status("alice").unwrap().active_prekeys, 2, "{name}");
    }
}

#[test]
fn failed_batch_leaves_no_records() {
    for (name, repo) in backends() {
        let mut records = vec![
            KeyRecord::new("alice", KeyKind::Identity, [1; 32], 0).unwrap(),
            KeyRecord::new("alice", KeyKind::SignedPrekey, [2; 32], 0)
                .unwrap()
                .with_signature(vec![0; 64], 100),
        ];
        records.push(KeyRecord::new("alice", KeyKind::Prekey, [3; 32], 0).unwrap().with_index(0));
        records.push(KeyRecord::new("alice", KeyKind::Prekey, [4; 32], 0).unwrap().with_index(0));

        assert!(repo.register_owner("alice", &records).is_err(), "{name}");
        for kind in [KeyKind::Identity, KeyKind::SignedPrekey, KeyKind::Prekey] {
            assert_eq!(repo.count_active("alice", kind).unwrap(), 0, "{name}: {kind}");
        }
    }
}

#[test]
fn rotation_leaves_one_verifiable_signed_prekey() {
    for (name, service) in services(&KeyPolicy::default()) {
        let setup = service.setup_user_keys("alice", 2).unwrap();
        let mut alice = OwnerKeyring::new("alice", setup.private_keys);

        let before = service.get_bundle("alice").unwrap();
        let (root_before, header_before) = initiate(&before);

        let rotated = service.rotate_signed_prekey("alice", alice.identity()).unwrap();
        alice.install_signed_prekey(rotated);

        let after = service.get_bundle("alice").unwrap();
        assert_ne!(after.signed_prekey, before.signed_prekey, "{name}");
        let (root_after, header_after) = initiate(&after);

        // In-flight session against the retired prekey still completes.
        assert_eq!(&root_before, alice.accept_session(&header_before).unwrap().as_bytes(), "{name}");
        assert_eq!(&root_after, alice.accept_session(&header_after).unwrap().as_bytes(), "{name}");
    }
}

#[test]
fn replenished_indexes_continue_past_every_issued_index() {
    for (name, service) in services(&KeyPolicy::default()) {
        let setup = service.setup_user_keys("alice", 3).unwrap();
        let mut alice = OwnerKeyring::new("alice", setup.private_keys);
        for _ in 0..3 {
            service.get_bundle("alice").unwrap();
        }

        let fresh = service.replenish_prekeys("alice", 4).unwrap();
        let indexes: Vec<u32> = fresh.iter().map(|p| p.index).collect();
        assert_eq!(indexes, vec![3, 4, 5, 6], "{name}");
        alice.add_prekeys(fresh);

        let bundle = service.get_bundle("alice").unwrap();
        assert_eq!(bundle.one_time_prekey.map(|p| p.index), Some(3), "{name}");
        let (root, header) = initiate(&bundle);
        assert_eq!(&root, alice.accept_session(&header).unwrap().as_bytes(), "{name}");
    }
}

#[test]
fn server_custody_accepts_once() {
    let policy = KeyPolicy {
        custody: KeyCustody::ServerHeld,
        ..KeyPolicy::default()
    };
    for (name, service) in services(&policy) {
        service.setup_user_keys("bob", 2).unwrap();
        let bundle = service.get_bundle("bob").unwrap();
        let (root, header) = initiate(&bundle);

        let custody = service.server_custody().unwrap();
        assert_eq!(&root, custody.accept_session("bob", &header).unwrap().as_bytes(), "{name}");

        let replay = custody.accept_session("bob", &header).unwrap_err();
        assert!(
            matches!(replay, KeyStoreError::KeyNotFound { kind: KeyKind::Prekey, .. }),
            "{name}: {replay}"
        );
    }
}

#[test]
fn server_custody_honours_only_the_last_two_signed_prekeys() {
    let policy = KeyPolicy {
        custody: KeyCustody::ServerHeld,
        ..KeyPolicy::default()
    };
    for (name, service) in services(&policy) {
        let setup = service.setup_user_keys("bob", 4).unwrap();
        let identity = &setup.private_keys.identity;
        let custody = service.server_custody().unwrap();

        let (root, header) = initiate(&service.get_bundle("bob").unwrap());
        let (_, stale_header) = initiate(&service.get_bundle("bob").unwrap());

        service.rotate_signed_prekey("bob", identity).unwrap();
        assert_eq!(&root, custody.accept_session("bob", &header).unwrap().as_bytes(), "{name}");

        service.rotate_signed_prekey("bob", identity).unwrap();
        let err = custody.accept_session("bob", &stale_header).unwrap_err();
        assert!(
            matches!(err, KeyStoreError::KeyNotFound { kind: KeyKind::SignedPrekey, .. }),
            "{name}: {err}"
        );
    }
}

#[test]
fn server_custody_refuses_an_undispensed_prekey() {
    let policy = KeyPolicy {
        custody: KeyCustody::ServerHeld,
        ..KeyPolicy::default()
    };
    for (name, service) in services(&policy) {
        service.setup_user_keys("bob", 3).unwrap();
        let (_, mut header) = initiate(&service.get_bundle("bob").unwrap());
        assert_eq!(header.one_time_prekey_index, Some(0), "{name}");
        header.one_time_prekey_index = Some(1);

        let custody = service.server_custody().unwrap();
        let err = custody.accept_session("bob", &header).unwrap_err();
        assert!(
            matches!(err, KeyStoreError::KeyNotFound { kind: KeyKind::Prekey, .. }),
            "{name}: {err}"
        );
        assert_eq!(service.prekey_status("bob").unwrap().active_prekeys, 2, "{name}");
        assert_eq!(service.get_bundle("bob").unwrap().one_time_prekey.map(|p| p.index), Some(1), "{name}");
    }
}

#[test]
fn tampered_signature_aborts_agreement() {
    for (name, service) in services(&KeyPolicy::default()) {
        service.setup_user_keys("bob", 1).unwrap();
        let mut bundle = service.get_bundle("bob").unwrap();
        bundle.signed_prekey.signature[10] ^= 0x04;

        let initiator = IdentityKeyPair::generate().unwrap();
        let ephemeral = X25519KeyPair::generate().unwrap();
        let err = initiate_session(&initiator, &ephemeral, &bundle).unwrap_err();
        assert!(matches!(err, CryptoError::SignatureVerification), "{name}");
        assert_eq!(
            KeyStoreError::from(err).user_message(),
            "secure channel could not be established"
        );
    }
}

#[test]
fn context_bound_message_fails_in_another_context() {
    let key = [7u8; 32];
    let context = associated_data("bob", "alice");
    let sealed = encrypt_with_context(b"for alice", &key, &context).unwrap();

    let other = associated_data("mallory", "alice");
    let err = decrypt_with_context(&sealed.ciphertext, &sealed.nonce, &key, &other).unwrap_err();
    assert!(matches!(err, CryptoError::AuthenticationTag));
    assert_eq!(
        decrypt_with_context(&sealed.ciphertext, &sealed.nonce, &key, &context).unwrap(),
        b"for alice"
    );
}

#[test]
fn sqlite_store_survives_reopen() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("keys.db");

    let published = {
        let repo = SqliteKeyRepository::open(&path).unwrap();
        let service = KeyService::new(Box::new(repo), KeyPolicy::default()).unwrap();
        let setup = service.setup_user_keys("alice", 5).unwrap();
        service.get_bundle("alice").unwrap();
        setup.published
    };

    let repo = SqliteKeyRepository::open(&path).unwrap();
    let service = KeyService::new(Box::new(repo), KeyPolicy::default()).unwrap();
    let bundle = service.get_bundle("alice").unwrap();

    assert_eq!(bundle.identity_key, published.identity_public);
    assert_eq!(bundle.signed_prekey, published.signed_prekey);
    assert_eq!(bundle.one_time_prekey, Some(published.prekeys[1]));
    assert_eq!(service.replenish_prekeys("alice", 1).unwrap()[0].index, 5);
}
