use {
    chrono::Utc,
    rand::{SeedableRng, rngs::StdRng},
    realmvault_protocol::{BlockError, RealmError, Role, UserId, VlobId},
    realmvault_sdk::{BlockChunker, FileBlob, FileError, crypto::SymmetricKey},
    realmvault_server::{
        Config,
        config::{BackendConfig, BlockstoreConfig},
    },
    realmvault_tests::{
        Env,
        shuffle::{FileOp, apply_to_file, apply_to_model, random_op},
    },
    std::{collections::HashMap, time::Duration},
    tempfile::TempDir,
};

const CHUNK_SIZE: usize = 16;

fn chunker() -> BlockChunker {
    BlockChunker::new(CHUNK_SIZE).unwrap()
}

#[tokio::test]
async fn shared_file() {
    let env = Env::memory().await.unwrap();
    let realm_id = env.create_realm().await.unwrap();
    env.share(realm_id, "bob", Some(Role::Reader))
        .await
        .unwrap();
    let key = SymmetricKey::generate().unwrap();
    let vlob_id = VlobId::generate();

    let mut file = FileBlob::create(
        env.file_context(&env.alice, realm_id, key.clone(), chunker()),
        vlob_id,
    )
    .await
    .unwrap();
    file.write(0, b"The quick brown fox jumps over the lazy dog")
        .await
        .unwrap();
    file.commit().await.unwrap();

    let bob_context = env.file_context(&env.bob, realm_id, key, chunker());
    let mut bob_file = FileBlob::load(bob_context.clone(), vlob_id, None)
        .await
        .unwrap();
    assert_eq!(bob_file.read(4, 5).await.unwrap(), b"quick");

    // A reader cannot upload blocks.
    assert!(matches!(
        bob_file.write(0, b"THE").await,
        Err(FileError::Block(BlockError::AccessDenied))
    ));
    assert!(!bob_file.is_dirty());

    // Nor can someone outside of the realm read them.
    let mallory = "mallory@pc".parse().unwrap();
    let mallory_file = FileBlob::load(
        env.file_context(
            &mallory,
            realm_id,
            SymmetricKey::generate().unwrap(),
            chunker(),
        ),
        vlob_id,
        None,
    )
    .await;
    assert!(matches!(
        mallory_file,
        Err(FileError::Realm(RealmError::AccessDenied))
    ));
}

#[tokio::test]
async fn obsolete_blocks_are_reclaimed_after_commit() {
    let env = Env::memory().await.unwrap();
    let realm_id = env.create_realm().await.unwrap();
    let context = env.file_context(
        &env.alice,
        realm_id,
        SymmetricKey::generate().unwrap(),
        chunker(),
    );
    let mut file = FileBlob::create(context.clone(), VlobId::generate())
        .await
        .unwrap();
    file.write(0, &[1; 4 * CHUNK_SIZE]).await.unwrap();
    file.commit().await.unwrap();
    let before = file.manifest().block_ids();

    let obsoleted = file
        .write(CHUNK_SIZE as u64, &[2; CHUNK_SIZE])
        .await
        .unwrap();
    assert_eq!(obsoleted.len(), 1);
    let after = file.manifest().block_ids();
    assert!(after.iter().all(|id| !obsoleted.contains(id)));
    assert!(obsoleted.iter().all(|id| before.contains(id)));

    // The old version still reads fine until the new one is committed.
    let old = FileBlob::load(context.clone(), file.vlob_id(), None)
        .await
        .unwrap();
    assert_eq!(old.read(0, 100).await.unwrap(), [1; 4 * CHUNK_SIZE]);

    file.commit().await.unwrap();
    assert!(matches!(
        env.server
            .blocks
            .read(&env.organization_id, &env.alice, obsoleted[0])
            .await,
        Err(BlockError::NotFound)
    ));
    for id in after {
        env.server
            .blocks
            .read(&env.organization_id, &env.alice, id)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn blocks_frozen_during_maintenance() {
    let env = Env::memory().await.unwrap();
    let realm_id = env.create_realm().await.unwrap();
    let context = env.file_context(
        &env.alice,
        realm_id,
        SymmetricKey::generate().unwrap(),
        chunker(),
    );
    let mut file = FileBlob::create(context, VlobId::generate()).await.unwrap();
    file.write(0, b"before").await.unwrap();
    file.commit().await.unwrap();

    env.server
        .maintenance
        .start_reencryption(
            &env.organization_id,
            &env.alice,
            realm_id,
            2,
            HashMap::from([(UserId::from("alice"), b"key".to_vec())]),
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(file.read(0, 6).await.unwrap(), b"before");
    assert!(matches!(
        file.write(0, b"during").await,
        Err(FileError::Block(BlockError::InMaintenance))
    ));
}

async fn shuffle(env: &Env, seed: u64, steps: usize) {
    let realm_id = env.create_realm().await.unwrap();
    let context = env.file_context(
        &env.alice,
        realm_id,
        SymmetricKey::generate().unwrap(),
        chunker(),
    );
    let mut file = FileBlob::create(context.clone(), VlobId::generate())
        .await
        .unwrap();
    let mut model = Vec::new();
    let mut committed = Vec::new();
    let mut rng = StdRng::seed_from_u64(seed);

    for _ in 0..steps {
        let op = random_op(&mut rng, file.size(), CHUNK_SIZE as u64);
        apply_to_model(&mut model, &op).unwrap();
        apply_to_file(&mut file, &op).await.unwrap();
        if op == FileOp::Commit {
            committed.clone_from(&model);
        }
        assert_eq!(file.size(), model.len() as u64, "after {op:?}");
        assert_eq!(file.read(0, file.size()).await.unwrap(), model);
    }
    file.commit().await.unwrap();
    committed.clone_from(&model);

    let loaded = FileBlob::load(context, file.vlob_id(), None).await.unwrap();
    assert_eq!(loaded.read(0, loaded.size()).await.unwrap(), committed);
    let middle = loaded.size() / 2;
    assert_eq!(
        loaded.read(middle, 20).await.unwrap(),
        committed[committed.len() / 2..]
            .iter()
            .take(20)
            .copied()
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn random_mutations_in_memory() {
    let env = Env::memory().await.unwrap();
    for seed in 0..4 {
        shuffle(&env, seed, 60).await;
    }
}

#[tokio::test]
async fn random_mutations_on_mirrored_disks() {
    let dirs = [TempDir::new().unwrap(), TempDir::new().unwrap()];
    let config = Config {
        backend: BackendConfig::Memory,
        blockstore: BlockstoreConfig::Raid1 {
            stores: dirs
                .iter()
                .map(|dir| BlockstoreConfig::Filesystem {
                    path: dir.path().into(),
                })
                .collect(),
        },
        block_timeout: Duration::from_secs(10),
        ..Config::default()
    };
    let env = Env::new(&config).await.unwrap();
    shuffle(&env, 42, 40).await;
}
