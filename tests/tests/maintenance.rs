use {
    chrono::Utc,
    realmvault_protocol::{
        RealmError, ReencryptionBatchEntry, ReencryptionBatchStats, Role, UserId, VlobId,
        events::Event,
    },
    realmvault_tests::Env,
    std::collections::HashMap,
};

fn messages(users: &[&str]) -> HashMap<UserId, Vec<u8>> {
    users
        .iter()
        .map(|&user| {
            (
                UserId::from(user),
                format!("new key for {user}").into_bytes(),
            )
        })
        .collect()
}

#[tokio::test]
async fn reencryption_ceremony() {
    let env = Env::memory().await.unwrap();
    let org = &env.organization_id;
    let realm_id = env.create_realm().await.unwrap();
    env.share(realm_id, "bob", Some(Role::Contributor))
        .await
        .unwrap();
    let vlobs = &env.server.vlobs;
    let maintenance = &env.server.maintenance;
    let mut vlob_ids = Vec::new();
    for index in 0..3u8 {
        let vlob_id = VlobId::generate();
        vlobs
            .create(org, &env.bob, realm_id, vlob_id, Utc::now(), vec![index])
            .await
            .unwrap();
        vlob_ids.push(vlob_id);
    }
    vlobs
        .update(org, &env.bob, vlob_ids[0], 2, Utc::now(), b"v2".to_vec())
        .await
        .unwrap();

    // The message map must name exactly the current members.
    for wrong in [&["alice"][..], &["alice", "bob", "carol"]] {
        assert!(matches!(
            maintenance
                .start_reencryption(org, &env.alice, realm_id, 2, messages(wrong), Utc::now())
                .await,
            Err(RealmError::ParticipantsMismatch)
        ));
    }
    assert!(matches!(
        maintenance
            .start_reencryption(
                org,
                &env.alice,
                realm_id,
                3,
                messages(&["alice", "bob"]),
                Utc::now()
            )
            .await,
        Err(RealmError::EncryptionRevision)
    ));
    assert!(matches!(
        maintenance
            .start_reencryption(
                org,
                &env.bob,
                realm_id,
                2,
                messages(&["alice", "bob"]),
                Utc::now()
            )
            .await,
        Err(RealmError::AccessDenied)
    ));
    let status = env
        .server
        .realms
        .get_status(org, &env.alice, realm_id)
        .await
        .unwrap();
    assert!(!status.in_maintenance());
    assert!(env.server.messaging.inbox(org, &"bob".into()).is_empty());

    let mut rx = env.server.events.subscribe();
    let started = maintenance
        .start_reencryption(
            org,
            &env.alice,
            realm_id,
            2,
            messages(&["alice", "bob"]),
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(started.undelivered.is_empty());
    assert!(matches!(
        rx.try_recv().unwrap().event,
        Event::MaintenanceStarted {
            encryption_revision: 2,
            ..
        }
    ));
    let inbox = env.server.messaging.inbox(org, &"bob".into());
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].sender, env.alice);
    assert_eq!(inbox[0].body, b"new key for bob");

    // Writes are blocked, reads are not.
    assert!(matches!(
        vlobs
            .update(org, &env.bob, vlob_ids[1], 2, Utc::now(), b"x".to_vec())
            .await,
        Err(RealmError::InMaintenance)
    ));
    assert!(matches!(
        vlobs
            .create(
                org,
                &env.bob,
                realm_id,
                VlobId::generate(),
                Utc::now(),
                b"x".to_vec()
            )
            .await,
        Err(RealmError::InMaintenance)
    ));
    vlobs.read(org, &env.bob, vlob_ids[1], None).await.unwrap();

    // Nothing has been re-encrypted yet.
    assert!(matches!(
        maintenance
            .finish_reencryption(org, &env.alice, realm_id, 2)
            .await,
        Err(RealmError::Maintenance(_))
    ));

    let batch = vlobs
        .maintenance_get_reencryption_batch(org, &env.alice, realm_id, 2, 100)
        .await
        .unwrap();
    assert_eq!(batch.len(), 4);
    assert!(matches!(
        vlobs
            .maintenance_get_reencryption_batch(org, &env.bob, realm_id, 2, 100)
            .await,
        Err(RealmError::AccessDenied)
    ));
    let reencrypted: Vec<ReencryptionBatchEntry> = batch
        .into_iter()
        .map(|entry| ReencryptionBatchEntry {
            blob: [b"r2:".as_slice(), &entry.blob].concat(),
            ..entry
        })
        .collect();
    let stats = vlobs
        .maintenance_save_reencryption_batch(
            org,
            &env.alice,
            realm_id,
            2,
            reencrypted[..2].to_vec(),
        )
        .await
        .unwrap();
    assert_eq!(stats, ReencryptionBatchStats { total: 4, done: 2 });
    let remaining = vlobs
        .maintenance_get_reencryption_batch(org, &env.alice, realm_id, 2, 100)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 2);
    let stats = vlobs
        .maintenance_save_reencryption_batch(
            org,
            &env.alice,
            realm_id,
            2,
            reencrypted[2..].to_vec(),
        )
        .await
        .unwrap();
    assert_eq!(stats, ReencryptionBatchStats { total: 4, done: 4 });

    maintenance
        .finish_reencryption(org, &env.alice, realm_id, 2)
        .await
        .unwrap();
    assert!(matches!(
        rx.try_recv().unwrap().event,
        Event::MaintenanceFinished {
            encryption_revision: 2,
            ..
        }
    ));
    let status = env
        .server
        .realms
        .get_status(org, &env.alice, realm_id)
        .await
        .unwrap();
    assert!(!status.in_maintenance());
    assert_eq!(status.encryption_revision, 2);

    let atom = vlobs
        .read(org, &env.bob, vlob_ids[0], Some(1))
        .await
        .unwrap();
    assert_eq!(atom.blob, b"r2:\0");
    let atom = vlobs.read(org, &env.bob, vlob_ids[0], None).await.unwrap();
    assert_eq!(atom.blob, b"r2:v2");
    vlobs
        .update(org, &env.bob, vlob_ids[1], 2, Utc::now(), b"after".to_vec())
        .await
        .unwrap();

    assert!(matches!(
        maintenance
            .finish_reencryption(org, &env.alice, realm_id, 2)
            .await,
        Err(RealmError::NotInMaintenance)
    ));
}

#[tokio::test]
async fn roles_frozen_during_maintenance() {
    let env = Env::memory().await.unwrap();
    let org = &env.organization_id;
    let realm_id = env.create_realm().await.unwrap();
    env.server
        .maintenance
        .start_reencryption(
            org,
            &env.alice,
            realm_id,
            2,
            messages(&["alice"]),
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(matches!(
        env.share(realm_id, "bob", Some(Role::Reader))
            .await
            .unwrap_err()
            .downcast::<RealmError>(),
        Ok(RealmError::InMaintenance)
    ));

    // An empty realm is re-encrypted as soon as it starts.
    env.server
        .maintenance
        .finish_reencryption(org, &env.alice, realm_id, 2)
        .await
        .unwrap();
    env.share(realm_id, "bob", Some(Role::Reader))
        .await
        .unwrap();
}
