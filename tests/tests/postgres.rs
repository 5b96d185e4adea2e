//! Runs against a real database when `DATABASE_URL` is set, and is skipped
//! otherwise.

use {
    chrono::Utc,
    futures::future::join_all,
    realmvault_protocol::{
        RealmError, ReencryptionBatchEntry, ReencryptionBatchStats, Role, UserId, VlobId,
    },
    realmvault_sdk::{BlockChunker, FileBlob, crypto::SymmetricKey},
    realmvault_server::{Config, config::BackendConfig},
    realmvault_tests::Env,
    std::{collections::HashMap, env, sync::Arc},
    tracing::warn,
};

async fn postgres_env() -> Option<Env> {
    realmvault_tests::init_logging();
    let Ok(database_url) = env::var("DATABASE_URL") else {
        warn!("DATABASE_URL is not set, skipping");
        return None;
    };
    realmvault_server::migrate(&database_url).await.unwrap();
    let config = Config {
        backend: BackendConfig::Postgres { database_url },
        ..Config::default()
    };
    Some(Env::new(&config).await.unwrap())
}

#[tokio::test]
async fn versions_and_checkpoints() {
    let Some(env) = postgres_env().await else {
        return;
    };
    let org = &env.organization_id;
    let vlobs = &env.server.vlobs;
    let realm_id = env.create_realm().await.unwrap();
    assert!(matches!(
        env.server
            .realms
            .create(
                org,
                realmvault_tests::grant(
                    realm_id,
                    "alice",
                    Some(Role::Owner),
                    &env.alice,
                    Utc::now()
                )
            )
            .await,
        Err(RealmError::AlreadyExists)
    ));

    let vlob_id = VlobId::generate();
    vlobs
        .create(
            org,
            &env.alice,
            realm_id,
            vlob_id,
            Utc::now(),
            b"b1".to_vec(),
        )
        .await
        .unwrap();
    assert!(matches!(
        vlobs
            .update(org, &env.alice, vlob_id, 1, Utc::now(), b"x".to_vec())
            .await,
        Err(RealmError::Version)
    ));
    vlobs
        .update(org, &env.alice, vlob_id, 2, Utc::now(), b"b2".to_vec())
        .await
        .unwrap();
    let atom = vlobs.read(org, &env.alice, vlob_id, None).await.unwrap();
    assert_eq!((atom.version, atom.blob.as_slice()), (2, &b"b2"[..]));
    assert!(matches!(
        vlobs.read(org, &env.alice, vlob_id, Some(3)).await,
        Err(RealmError::Version)
    ));
    let changes = vlobs
        .poll_changes(org, &env.alice, realm_id, 0)
        .await
        .unwrap();
    assert_eq!(changes.checkpoint, 2);
    assert_eq!(changes.changes, HashMap::from([(vlob_id, 2)]));
}

#[tokio::test]
async fn concurrent_updates() {
    let Some(env) = postgres_env().await else {
        return;
    };
    let env = Arc::new(env);
    let realm_id = env.create_realm().await.unwrap();
    let vlob_id = VlobId::generate();
    env.server
        .vlobs
        .create(
            &env.organization_id,
            &env.alice,
            realm_id,
            vlob_id,
            Utc::now(),
            b"v1".to_vec(),
        )
        .await
        .unwrap();

    let results = join_all((0..4u8).map(|index| {
        let env = Arc::clone(&env);
        tokio::spawn(async move {
            env.server
                .vlobs
                .update(
                    &env.organization_id,
                    &env.alice,
                    vlob_id,
                    2,
                    Utc::now(),
                    vec![index],
                )
                .await
        })
    }))
    .await;
    let succeeded = results
        .into_iter()
        .map(|result| result.unwrap())
        .filter(|result| match result {
            Ok(()) => true,
            Err(RealmError::Version) => false,
            Err(err) => panic!("unexpected error: {err}"),
        })
        .count();
    assert_eq!(succeeded, 1);
}

#[tokio::test]
async fn reencryption_and_files() {
    let Some(env) = postgres_env().await else {
        return;
    };
    let org = &env.organization_id;
    let realm_id = env.create_realm().await.unwrap();
    env.share(realm_id, "bob", Some(Role::Reader))
        .await
        .unwrap();
    let context = env.file_context(
        &env.alice,
        realm_id,
        SymmetricKey::generate().unwrap(),
        BlockChunker::new(8).unwrap(),
    );
    let mut file = FileBlob::create(context, VlobId::generate()).await.unwrap();
    file.write(0, b"stored in postgres").await.unwrap();
    file.commit().await.unwrap();
    assert_eq!(file.history().await.unwrap().len(), 2);

    env.server
        .maintenance
        .start_reencryption(
            org,
            &env.alice,
            realm_id,
            2,
            HashMap::from([
                (UserId::from("alice"), b"a".to_vec()),
                (UserId::from("bob"), b"b".to_vec()),
            ]),
            Utc::now(),
        )
        .await
        .unwrap();
    let vlobs = &env.server.vlobs;
    let batch = vlobs
        .maintenance_get_reencryption_batch(org, &env.alice, realm_id, 2, 10)
        .await
        .unwrap();
    assert_eq!(batch.len(), 2);
    let stats = vlobs
        .maintenance_save_reencryption_batch(org, &env.alice, realm_id, 2, batch)
        .await
        .unwrap();
    assert_eq!(stats, ReencryptionBatchStats { total: 2, done: 2 });
    env.server
        .maintenance
        .finish_reencryption(org, &env.alice, realm_id, 2)
        .await
        .unwrap();

    // Blobs were saved unchanged, so the file still decrypts.
    assert_eq!(file.read(0, 100).await.unwrap(), b"stored in postgres");
    let status = env
        .server
        .realms
        .get_status(org, &env.bob, realm_id)
        .await
        .unwrap();
    assert_eq!(status.encryption_revision, 2);
}

#[tokio::test]
async fn versions_beyond_storage_range() {
    let Some(env) = postgres_env().await else {
        return;
    };
    let org = &env.organization_id;
    let vlobs = &env.server.vlobs;
    let realm_id = env.create_realm().await.unwrap();
    let vlob_id = VlobId::generate();
    vlobs
        .create(
            org,
            &env.alice,
            realm_id,
            vlob_id,
            Utc::now(),
            b"v1".to_vec(),
        )
        .await
        .unwrap();
    for version in [u32::MAX, 1 << 31] {
        assert!(matches!(
            vlobs.read(org, &env.alice, vlob_id, Some(version)).await,
            Err(RealmError::Version)
        ));
        assert!(matches!(
            vlobs
                .update(org, &env.alice, vlob_id, version, Utc::now(), Vec::new())
                .await,
            Err(RealmError::Version)
        ));
    }

    env.server
        .maintenance
        .start_reencryption(
            org,
            &env.alice,
            realm_id,
            2,
            HashMap::from([(UserId::from("alice"), b"a".to_vec())]),
            Utc::now(),
        )
        .await
        .unwrap();
    let stats = vlobs
        .maintenance_save_reencryption_batch(
            org,
            &env.alice,
            realm_id,
            2,
            vec![ReencryptionBatchEntry {
                vlob_id,
                version: u32::MAX,
                blob: b"ignored".to_vec(),
            }],
        )
        .await
        .unwrap();
    assert_eq!(stats, ReencryptionBatchStats { total: 1, done: 0 });
}
