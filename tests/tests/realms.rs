use {
    chrono::{Duration, Utc},
    futures::future::join_all,
    realmvault_protocol::{
        RealmError, Role, UserId, VlobId,
        events::{Event, OrganizationEvent},
    },
    realmvault_tests::{Env, grant},
    std::{collections::HashMap, sync::Arc},
    tokio::sync::broadcast::Receiver,
};

fn drain(rx: &mut Receiver<OrganizationEvent>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.event);
    }
    events
}

#[tokio::test]
async fn end_to_end() {
    let env = Env::memory().await.unwrap();
    let mut rx = env.server.events.subscribe();
    let org = &env.organization_id;
    let realm_id = env.create_realm().await.unwrap();
    let vlob_id = VlobId::generate();
    let vlobs = &env.server.vlobs;

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
            .update(org, &env.alice, vlob_id, 1, Utc::now(), b"b1bis".to_vec())
            .await,
        Err(RealmError::Version)
    ));
    vlobs
        .update(org, &env.alice, vlob_id, 2, Utc::now(), b"b2".to_vec())
        .await
        .unwrap();

    let atom = vlobs.read(org, &env.alice, vlob_id, None).await.unwrap();
    assert_eq!(atom.version, 2);
    assert_eq!(atom.blob, b"b2");
    assert_eq!(atom.author, env.alice);
    let first = vlobs.read(org, &env.alice, vlob_id, Some(1)).await.unwrap();
    assert_eq!(first.blob, b"b1");
    for version in [3, 1 << 31, u32::MAX] {
        assert!(matches!(
            vlobs.read(org, &env.alice, vlob_id, Some(version)).await,
            Err(RealmError::Version)
        ));
    }

    let changes = vlobs
        .poll_changes(org, &env.alice, realm_id, 0)
        .await
        .unwrap();
    assert_eq!(changes.checkpoint, 2);
    assert_eq!(changes.changes, HashMap::from([(vlob_id, 2)]));
    let changes = vlobs
        .poll_changes(org, &env.alice, realm_id, 2)
        .await
        .unwrap();
    assert_eq!(changes.checkpoint, 2);
    assert!(changes.changes.is_empty());

    let versions: Vec<u32> = vlobs
        .list_versions(org, &env.alice, vlob_id)
        .await
        .unwrap()
        .iter()
        .map(|version| version.version)
        .collect();
    assert_eq!(versions, [1, 2]);

    let checkpoints: Vec<(u64, u32)> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            Event::VlobsUpdated {
                checkpoint,
                version,
                ..
            } => Some((checkpoint, version)),
            _ => None,
        })
        .collect();
    assert_eq!(checkpoints, [(1, 1), (2, 2)]);
}

#[tokio::test]
async fn concurrent_updates() {
    let env = Arc::new(Env::memory().await.unwrap());
    let realm_id = env.create_realm().await.unwrap();
    env.share(realm_id, "bob", Some(Role::Contributor))
        .await
        .unwrap();
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

    let results = join_all([&env.alice, &env.bob].map(|author| {
        let env = Arc::clone(&env);
        let author = author.clone();
        tokio::spawn(async move {
            let blob = author.to_string().into_bytes();
            env.server
                .vlobs
                .update(
                    &env.organization_id,
                    &author,
                    vlob_id,
                    2,
                    Utc::now(),
                    blob.clone(),
                )
                .await
                .map(|()| blob)
        })
    }))
    .await;

    let mut winners = Vec::new();
    for result in results {
        match result.unwrap() {
            Ok(blob) => winners.push(blob),
            Err(RealmError::Version) => {}
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert_eq!(winners.len(), 1);
    let atom = env
        .server
        .vlobs
        .read(&env.organization_id, &env.bob, vlob_id, None)
        .await
        .unwrap();
    assert_eq!(atom.version, 2);
    assert_eq!(atom.blob, winners[0]);
}

#[tokio::test]
async fn role_lattice() {
    let env = Env::memory().await.unwrap();
    let org = &env.organization_id;
    let realms = &env.server.realms;
    let realm_id = env.create_realm().await.unwrap();
    env.share(realm_id, "bob", Some(Role::Manager))
        .await
        .unwrap();
    let now = Utc::now() + Duration::seconds(1);

    // A manager handles readers and contributors only.
    for role in [Some(Role::Reader), Some(Role::Contributor), None] {
        realms
            .update_roles(org, grant(realm_id, "carol", role, &env.bob, now))
            .await
            .unwrap();
    }
    for role in [Role::Manager, Role::Owner] {
        assert!(matches!(
            realms
                .update_roles(org, grant(realm_id, "carol", Some(role), &env.bob, now))
                .await,
            Err(RealmError::AccessDenied)
        ));
    }
    // Nobody changes their own role.
    for role in [None, Some(Role::Reader), Some(Role::Owner)] {
        assert!(matches!(
            realms
                .update_roles(org, grant(realm_id, "bob", role, &env.bob, now))
                .await,
            Err(RealmError::AccessDenied)
        ));
        assert!(matches!(
            realms
                .update_roles(org, grant(realm_id, "alice", role, &env.alice, now))
                .await,
            Err(RealmError::AccessDenied)
        ));
    }
    // Only an owner handles managers and owners.
    realms
        .update_roles(
            org,
            grant(realm_id, "dave", Some(Role::Owner), &env.alice, now),
        )
        .await
        .unwrap();
    assert!(matches!(
        realms
            .update_roles(
                org,
                grant(realm_id, "dave", Some(Role::Owner), &env.alice, now)
            )
            .await,
        Err(RealmError::AlreadyExists)
    ));

    let roles = realms.get_roles(org, &env.bob, realm_id).await.unwrap();
    assert_eq!(
        roles,
        HashMap::from([
            (UserId::from("alice"), Role::Owner),
            (UserId::from("bob"), Role::Manager),
            (UserId::from("dave"), Role::Owner),
        ])
    );
    assert_eq!(
        realms
            .get_realms_for_user(org, &"bob".into())
            .await
            .unwrap(),
        HashMap::from([(realm_id, Role::Manager)])
    );
    assert!(matches!(
        realms
            .get_roles(org, &"mallory@pc".parse().unwrap(), realm_id)
            .await,
        Err(RealmError::AccessDenied)
    ));
}
