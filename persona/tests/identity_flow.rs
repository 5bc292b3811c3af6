//! End-to-end identity flows over the public API.

use std::sync::Arc;

use http::HeaderMap;
use persona::prelude::*;
use persona::seed::SEED_STORAGE_KEY;
use persona::signer::HEADER_PERSONA_PKH;
use persona::store::{PERSONA_KEY_FORMAT, PERSONA_KEYS_STORAGE_KEY, StaleReason};
use serde_json::json;

const DEV_PHRASE: &str = "bottom drive obey lake curtain smoke basket hold race lonely fit walk";
const MESH_PHRASE: &str = "mesh pioneer noble decorate space jacket arrive resource true curtain \
    neglect gate brave liquid solar toy rule ten album way target dumb social camera";

fn file_config(dir: &std::path::Path) -> IdentityConfig {
    IdentityConfig {
        storage_dir: Some(dir.to_path_buf()),
        ..IdentityConfig::default()
    }
}

async fn start(config: &IdentityConfig) -> IdentitySession {
    let storage = Arc::new(FileStore::new(config.storage_dir()));
    IdentitySession::start(storage, config.clone()).await.unwrap()
}

fn headers_for(envelope: &SignedEnvelope, pkh: &Pkh) -> AuthHeaders {
    let mut map = HeaderMap::new();
    envelope.apply(&mut map).unwrap();
    map.insert(HEADER_PERSONA_PKH, pkh.as_str().parse().unwrap());
    AuthHeaders::from_header_map(&map).unwrap()
}

#[tokio::test]
async fn test_identity_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(dir.path());

    let first = start(&config).await;
    let persona = first.active_persona().await.unwrap();
    drop(first);

    let second = start(&config).await;
    assert_eq!(second.startup_report().store_state, StoreState::Fresh);
    assert_eq!(second.active_persona().await.unwrap(), persona);

    let seed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("hdkey_seed.json")).unwrap())
            .unwrap();
    assert_eq!(seed["format"], 2);
    assert_eq!(seed["phrase"].as_str().unwrap().split(' ').count(), 24);
}

#[tokio::test]
async fn test_signed_envelope_verifies_once() {
    let session = IdentitySession::start(Arc::new(MemoryStore::new()), IdentityConfig::default())
        .await
        .unwrap();
    let persona = session.active_persona().await.unwrap();
    let body = br#"{"query":"query { personas { name } }","variables":{}}"#;

    let envelope = session.sign(body).await.unwrap();
    let headers = headers_for(&envelope, &persona.pkh);

    let guard = ReplayGuard::new(session.config().verifier);
    let now: u64 = envelope.sent_at.parse().unwrap();
    let verified = guard.verify(&headers, body, now).unwrap();
    assert_eq!(verified.pkh, persona.pkh);

    assert!(guard.verify(&headers, body, now).is_err());
    assert!(verify_headers(&headers, b"{}", PayloadMode::Raw).is_err());
}

#[tokio::test]
async fn test_reseed_replaces_identity_and_persists() {
    let dir = tempfile::tempdir().unwrap();
    let config = file_config(dir.path());

    let session = start(&config).await;
    let old = session.active_persona().await.unwrap();

    let report = session.replace_seed(DEV_PHRASE).await.unwrap();
    assert!(matches!(
        report.store_state,
        StoreState::Stale(StaleReason::MasterChanged { .. })
    ));
    assert!(report.warnings.is_empty());

    let new = session.active_persona().await.unwrap();
    assert_eq!(new, derive_key_at(DEV_PHRASE, 0).unwrap());
    assert_ne!(new.pkh, old.pkh);
    drop(session);

    let restarted = start(&config).await;
    assert_eq!(restarted.active_persona().await.unwrap(), new);
    let store = restarted.persona_store().await;
    assert_eq!(store.format, PERSONA_KEY_FORMAT);
    assert_eq!(store.num, store.info.len());
    assert!(store.info.iter().skip(1).all(|k| !k.active));
}

#[tokio::test]
async fn test_stale_format_is_rebuilt_on_start() {
    let storage = Arc::new(MemoryStore::new());
    storage
        .set(SEED_STORAGE_KEY, &json!({"format": 2, "phrase": DEV_PHRASE}))
        .await
        .unwrap();

    let persona = derive_key_at(DEV_PHRASE, 0).unwrap();
    let master = Keyring::from_uri(DEV_PHRASE).unwrap();
    storage
        .set(
            PERSONA_KEYS_STORAGE_KEY,
            &json!({
                "num": 1,
                "master_pkh": master.pkh(),
                "info": [persona],
            }),
        )
        .await
        .unwrap();

    let session = IdentitySession::start(
        Arc::clone(&storage) as Arc<dyn KeyValueStore>,
        IdentityConfig::default(),
    )
    .await
    .unwrap();

    assert!(matches!(
        session.startup_report().store_state,
        StoreState::Stale(StaleReason::FormatChanged { found: 0, .. })
    ));
    assert_eq!(session.active_persona().await.unwrap(), persona);

    let stored = storage.get(PERSONA_KEYS_STORAGE_KEY).await.unwrap().unwrap();
    assert_eq!(stored["format"], PERSONA_KEY_FORMAT);
}

#[tokio::test]
async fn test_account_id_pseudo_seed() {
    let session = IdentitySession::start(Arc::new(MemoryStore::new()), IdentityConfig::default())
        .await
        .unwrap();

    session.replace_seed("88213").await.unwrap();
    let persona = session.active_persona().await.unwrap();
    assert_eq!(persona.hdkey(), "88213");
    assert_eq!(persona, derive_key_at("88213", 0).unwrap());

    let envelope = session.sign(b"{}").await.unwrap();
    let headers = headers_for(&envelope, &persona.pkh);
    verify_headers(&headers, b"{}", PayloadMode::Raw).unwrap();
}

#[tokio::test]
async fn test_byte_list_encoding_round_trip() {
    let config = IdentityConfig {
        signer: SignerConfig {
            key_encoding: KeyEncoding::ByteList,
            ..SignerConfig::default()
        },
        ..IdentityConfig::default()
    };
    let session = IdentitySession::start(Arc::new(MemoryStore::new()), config)
        .await
        .unwrap();
    let persona = session.active_persona().await.unwrap();

    let envelope = session.sign(b"payload").await.unwrap();
    let headers = headers_for(&envelope, &persona.pkh);
    assert!(headers.pubkey.contains(','));
    verify_headers(&headers, b"payload", PayloadMode::Raw).unwrap();
}

#[tokio::test]
async fn test_reseed_with_known_phrase_yields_golden_persona() {
    let session = IdentitySession::start(Arc::new(MemoryStore::new()), IdentityConfig::default())
        .await
        .unwrap();

    let report = session.replace_seed(MESH_PHRASE).await.unwrap();
    assert_eq!(
        report.active_pkh.as_str(),
        "0xf2d3e43ae36fe5cf4760cfdf5ebdf87f0710b2c635211ce6b621ddc314b5d6fd"
    );
    assert_eq!(session.active_persona().await.unwrap().pkh, report.active_pkh);
}
