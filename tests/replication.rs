//! Object replication across a server and several clients.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{connect, eventually, next_event, test_config};
use synclink::error::ProtocolError;
use synclink::replication::object::{ObjectType, OwnershipMode, VisibilityMode};
use synclink::replication::spawn::{ObjectChange, SpawnOptions};
use synclink::runtime::{RegistryBuilder, Registries, RuntimeEvent, Server};
use synclink::{Value, SERVER_ID};

fn registries() -> Registries {
    let mut builder = RegistryBuilder::new();
    let types = builder.object_types();
    types
        .register(
            ObjectType::new("Avatar")
                .ownership(OwnershipMode::Client)
                .sync_var("position", OwnershipMode::Client, Value::I32(0))
                .sync_var("score", OwnershipMode::Server, Value::U32(0)),
        )
        .unwrap();
    types
        .register(
            ObjectType::new("Diary")
                .ownership(OwnershipMode::Client)
                .visibility(VisibilityMode::OwnerAndServer),
        )
        .unwrap();
    types.register(ObjectType::new("Terrain")).unwrap();
    builder.build()
}

#[tokio::test]
async fn test_client_spawn_replicates_everywhere() {
    let config = test_config();
    let registries = registries();
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let (alice, alice_id) = connect(&server, &config, registries.clone()).await;
    let (bob, _) = connect(&server, &config, registries).await;

    let avatar = alice.spawn("Avatar", SpawnOptions::default()).await.unwrap();
    assert_eq!(avatar, 1);

    let on_server = server.runtime().objects().get_active(avatar).unwrap();
    assert_eq!(on_server.owner_id, alice_id);
    assert_eq!(on_server.type_name, "Avatar");
    assert!(alice.runtime().objects().contains(avatar));
    eventually(|| bob.runtime().objects().contains(avatar)).await;

    let replica = bob.runtime().objects().get_active(avatar).unwrap();
    assert_eq!(replica.owner_id, alice_id);
    assert_eq!(replica.sync_var("position"), Some(&Value::I32(0)));
    server.shutdown().await;
}

#[tokio::test]
async fn test_owner_only_visibility() {
    let config = test_config();
    let registries = registries();
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let (alice, _) = connect(&server, &config, registries.clone()).await;
    let (bob, bob_id) = connect(&server, &config, registries).await;

    let diary = alice.spawn("Diary", SpawnOptions::default()).await.unwrap();
    assert!(alice.runtime().objects().contains(diary));
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!bob.runtime().objects().contains(diary));

    // Handing the diary to bob moves the replica with it
    let object = server.runtime().objects().get_active(diary).unwrap();
    let mut change = ObjectChange::from_object(&object);
    change.owner_id = bob_id;
    server.runtime().modify(diary, change).unwrap();

    eventually(|| bob.runtime().objects().contains(diary)).await;
    eventually(|| !alice.runtime().objects().contains(diary)).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_sync_var_relay_and_authority() {
    let config = test_config();
    let registries = registries();
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let (alice, _) = connect(&server, &config, registries.clone()).await;
    let (bob, _) = connect(&server, &config, registries).await;
    let mut bob_events = bob.runtime().subscribe();

    let avatar = alice.spawn("Avatar", SpawnOptions::default()).await.unwrap();
    eventually(|| bob.runtime().objects().contains(avatar)).await;

    alice.set_sync_var(avatar, "position", Value::I32(12)).unwrap();
    let (id, name, value) = next_event(&mut bob_events, |e| match e {
        RuntimeEvent::SyncVarChanged {
            network_id,
            name,
            value,
        } => Some((network_id, name, value)),
        _ => None,
    })
    .await;
    assert_eq!((id, name.as_str(), value), (avatar, "position", Value::I32(12)));
    assert_eq!(
        server.runtime().sync_var(avatar, "position").unwrap(),
        Value::I32(12)
    );

    // Only the owner writes the position; only the server writes the score
    assert!(matches!(
        bob.set_sync_var(avatar, "position", Value::I32(99)),
        Err(ProtocolError::PermissionDenied(_))
    ));
    assert!(matches!(
        alice.set_sync_var(avatar, "score", Value::U32(5)),
        Err(ProtocolError::PermissionDenied(_))
    ));

    server
        .runtime()
        .set_sync_var(avatar, "score", Value::U32(7))
        .unwrap();
    let alice_runtime = alice.runtime().clone();
    eventually(|| alice_runtime.sync_var(avatar, "score").ok() == Some(Value::U32(7))).await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_owner_disconnect_applies_fallback() {
    let config = test_config();
    let registries = registries();
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let (alice, _) = connect(&server, &config, registries.clone()).await;
    let (bob, _) = connect(&server, &config, registries).await;

    let avatar = alice.spawn("Avatar", SpawnOptions::default()).await.unwrap();
    eventually(|| bob.runtime().objects().contains(avatar)).await;
    alice.disconnect("gone").await.unwrap();

    let runtime = server.runtime().clone();
    eventually(|| {
        runtime
            .objects()
            .get_active(avatar)
            .map(|o| o.owner_id == SERVER_ID && o.ownership == OwnershipMode::Server)
            .unwrap_or(false)
    })
    .await;
    eventually(|| {
        bob.runtime()
            .objects()
            .get_active(avatar)
            .map(|o| o.owner_id == SERVER_ID)
            .unwrap_or(false)
    })
    .await;

    // The server now owns the client-owned field
    server
        .runtime()
        .set_sync_var(avatar, "position", Value::I32(-3))
        .unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn test_late_joiner_receives_snapshot() {
    let config = test_config();
    let registries = registries();
    let server = Server::new(config.clone(), registries.clone()).unwrap();

    let ground = server
        .runtime()
        .spawn("Terrain", SpawnOptions::default())
        .await
        .unwrap();
    let hill = server
        .runtime()
        .spawn(
            "Terrain",
            SpawnOptions {
                required: vec![ground],
                spawn_priority: 10,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (late, _) = connect(&server, &config, registries).await;
    eventually(|| late.runtime().objects().len() == 2).await;
    let replica = late.runtime().objects().get_active(hill).unwrap();
    assert_eq!(replica.required, vec![ground]);
    server.shutdown().await;
}

#[tokio::test]
async fn test_rejected_spawn_reports_reason() {
    let config = test_config();
    let server = Server::new(config.clone(), registries()).unwrap();

    let mut builder = RegistryBuilder::new();
    builder
        .object_types()
        .register(ObjectType::new("Contraband"))
        .unwrap();
    let (client, _) = connect(&server, &config, builder.build()).await;
    let mut events = client.runtime().subscribe();

    let err = client
        .spawn("Contraband", SpawnOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Rejected(ref reason) if reason.contains("Contraband")));
    let reason = next_event(&mut events, |e| match e {
        RuntimeEvent::RequestRejected { reason, .. } => Some(reason),
        _ => None,
    })
    .await;
    assert!(reason.contains("Contraband"));
    assert!(server.runtime().objects().is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn test_owner_destroys_object() {
    let config = test_config();
    let registries = registries();
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let (alice, _) = connect(&server, &config, registries.clone()).await;
    let (bob, _) = connect(&server, &config, registries).await;

    let avatar = alice.spawn("Avatar", SpawnOptions::default()).await.unwrap();
    eventually(|| bob.runtime().objects().contains(avatar)).await;

    assert!(matches!(
        bob.destroy(avatar),
        Err(ProtocolError::PermissionDenied(_))
    ));
    alice.destroy(avatar).unwrap();

    let runtime = server.runtime().clone();
    eventually(|| runtime.objects().is_empty()).await;
    eventually(|| bob.runtime().objects().is_empty()).await;
    eventually(|| alice.runtime().objects().is_empty()).await;
    assert_eq!(runtime.metrics().snapshot().objects_destroyed, 1);
    server.shutdown().await;
}

#[tokio::test]
async fn test_refused_sync_var_write_reported_and_resynced() {
    let config = test_config();
    let registries = registries();
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let (alice, _) = connect(&server, &config, registries.clone()).await;
    let (bob, bob_id) = connect(&server, &config, registries).await;
    let mut bob_events = bob.runtime().subscribe();

    let avatar = alice.spawn("Avatar", SpawnOptions::default()).await.unwrap();
    let object = server.runtime().objects().get_active(avatar).unwrap();
    let mut change = ObjectChange::from_object(&object);
    change.privileged.insert(bob_id);
    server.runtime().modify(avatar, change).unwrap();
    eventually(|| {
        bob.runtime()
            .objects()
            .get_active(avatar)
            .map(|o| o.privileged.contains(&bob_id))
            .unwrap_or(false)
    })
    .await;

    // The server revokes the privilege before bob hears about it
    server
        .runtime()
        .objects()
        .update(avatar, |o| {
            o.privileged.remove(&bob_id);
            Ok(())
        })
        .unwrap();
    bob.set_sync_var(avatar, "score", Value::U32(50)).unwrap();
    assert_eq!(bob.runtime().sync_var(avatar, "score").unwrap(), Value::U32(50));

    let (network_id, reason) = next_event(&mut bob_events, |e| match e {
        RuntimeEvent::RequestRejected { network_id, reason } => Some((network_id, reason)),
        _ => None,
    })
    .await;
    assert_eq!(network_id, avatar);
    assert!(reason.contains("may not write"));

    let bob_runtime = bob.runtime().clone();
    eventually(|| bob_runtime.sync_var(avatar, "score").ok() == Some(Value::U32(0))).await;
    assert_eq!(
        server.runtime().sync_var(avatar, "score").unwrap(),
        Value::U32(0)
    );
    server.shutdown().await;
}
