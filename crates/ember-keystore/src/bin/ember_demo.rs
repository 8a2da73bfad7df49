//! Walks a first-contact session between two owners against a SQLite key store.

use std::path::PathBuf;

use anyhow::Context;
use ember_crypto::cipher::{associated_data, decrypt_with_context, encrypt_with_context};
use ember_crypto::{initiate_session, IdentityKeyPair, SessionHeader, X25519KeyPair};
use ember_keystore::{KeyPolicy, KeyService, OwnerKeyring, SqliteKeyRepository};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the demo.
struct Args {
    db_path: PathBuf,
    config_path: Option<PathBuf>,
    prekeys: Option<u32>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut db_path = None;
    let mut config_path = None;
    let mut prekeys = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--db" => db_path = args.next().map(PathBuf::from),
            "--config" => config_path = args.next().map(PathBuf::from),
            "--prekeys" => {
                let raw = args.next().unwrap_or_default();
                prekeys = Some(raw.parse().with_context(|| format!("invalid --prekeys value '{raw}'"))?);
            }
            other => tracing::warn!(arg = other, "ignoring unknown argument"),
        }
    }

    Ok(Args {
        db_path: db_path.unwrap_or_else(|| PathBuf::from("ember-keys.db")),
        config_path,
        prekeys,
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args()?;
    let mut policy = match &args.config_path {
        Some(path) => KeyPolicy::from_json_file(path)?,
        None => KeyPolicy::default(),
    };
    if let Some(count) = args.prekeys {
        policy.prekey_batch_size = count;
    }

    let repo = SqliteKeyRepository::open(&args.db_path)
        .with_context(|| format!("failed to open key store at {}", args.db_path.display()))?;
    let service = KeyService::new(Box::new(repo), policy)?;

    // Fresh owner ids per run so the same database can be reused.
    let run = hex::encode(ember_crypto::rng::random_array::<4>()?);
    let alice_id = format!("alice-{run}");
    let bob_id = format!("bob-{run}");

    let alice_setup = service.register(&alice_id)?;
    let mut alice = OwnerKeyring::new(&alice_id, alice_setup.private_keys);
    let bob_setup = service.register(&bob_id)?;
    let bob = OwnerKeyring::new(&bob_id, bob_setup.private_keys);

    // Bob initiates with Alice's bundle.
    let bundle = service.get_bundle(&alice_id)?;
    tracing::info!(
        prekey = ?bundle.one_time_prekey.map(|p| p.index),
        "fetched bundle for {alice_id}"
    );
    let ephemeral = X25519KeyPair::generate()?;
    let bob_root = initiate_session(bob.identity(), &ephemeral, &bundle)?;
    let header = SessionHeader::new(bob.identity(), &ephemeral, &bundle);

    let context = associated_data(bob.owner_id(), alice.owner_id());
    let sealed = encrypt_with_context(b"hello from bob", bob_root.as_bytes(), &context)?;
    println!("header: {}", serde_json::to_string(&header)?);
    println!("ciphertext: {}", hex::encode(&sealed.ciphertext));

    // Alice responds from her own keyring.
    let alice_root = alice.accept_session(&header)?;
    let opened = decrypt_with_context(&sealed.ciphertext, &sealed.nonce, alice_root.as_bytes(), &context)?;
    println!("alice read: {}", String::from_utf8_lossy(&opened));

    let replay = alice.accept_session(&header);
    println!("replayed header rejected: {}", replay.is_err());

    if service.policy().stores_private_keys() {
        let stranger = IdentityKeyPair::generate()?;
        let ephemeral = X25519KeyPair::generate()?;
        let bundle = service.get_bundle(&bob_id)?;
        let root = initiate_session(&stranger, &ephemeral, &bundle)?;
        let header = SessionHeader::new(&stranger, &ephemeral, &bundle);
        let custodial = service.server_custody()?.accept_session(&bob_id, &header)?;
        println!("server custody agreed: {}", custodial.as_bytes() == root.as_bytes());
    }

    let status = service.prekey_status(&alice_id)?;
    println!(
        "{alice_id}: {} one-time prekeys left, replenish={}, rotate={}",
        status.active_prekeys, status.needs_replenish, status.needs_rotation
    );
    Ok(())
}
