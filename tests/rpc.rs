//! Remote calls between live runtimes.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{connect, eventually, test_config};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use synclink::config::NetworkConfig;
use synclink::core::serialization::ValueCodec;
use synclink::error::ProtocolError;
use synclink::protocol::auth::NoAuthentication;
use synclink::protocol::dispatcher::PacketRegistry;
use synclink::protocol::message::Message;
use synclink::protocol::session::{ConnectionState, Session, SessionSettings, Side};
use synclink::replication::object::{ObjectType, OwnershipMode};
use synclink::replication::spawn::SpawnOptions;
use synclink::rpc::invoke::{RpcResult, RpcTarget};
use synclink::rpc::method::{MethodTarget, ParamType, RpcDirection, SecurityMode};
use synclink::runtime::{RegistryBuilder, Registries, Server};
use synclink::transport::framed::FramedTransport;
use synclink::transport::memory;
use synclink::{ConnectionId, TypeTag, Value, SERVER_ID};
use tokio::io::DuplexStream;

fn slow_registries(delay: Duration) -> Registries {
    let mut builder = RegistryBuilder::new();
    builder
        .methods()
        .method(MethodTarget::Connection, "slow")
        .handler(move |_, _| {
            std::thread::sleep(delay);
            Ok(Value::Bool(true))
        })
        .unwrap();
    builder.build()
}

/// A client session driven by hand, able to put any message on the wire
struct ManualPeer {
    session: Session,
    transport: FramedTransport<DuplexStream>,
}

impl ManualPeer {
    async fn connect(server: &Server, config: &NetworkConfig) -> (Self, ConnectionId) {
        let (server_end, client_end) = memory::pair(config.transport.max_payload_size);
        let id = server.attach_transport(server_end).await.unwrap();
        let settings = Arc::new(SessionSettings::from_config(
            Side::Client,
            config,
            Arc::new(NoAuthentication),
            Arc::new(PacketRegistry::new()),
        ));
        let mut peer = Self {
            session: Session::client(settings, "manual", Instant::now()),
            transport: client_end,
        };
        peer.session.start().unwrap();
        tokio::time::timeout(common::WAIT, async {
            while !peer.session.is_connected() {
                peer.flush().await;
                let frame = peer.transport.receive().await.unwrap().expect("server hung up");
                peer.session.receive(frame, Instant::now()).unwrap();
            }
            peer.flush().await;
        })
        .await
        .expect("manual handshake finished");
        let runtime = server.runtime().clone();
        eventually(|| runtime.connection_state(id) == Some(ConnectionState::Connected)).await;
        (peer, id)
    }

    async fn flush(&mut self) {
        for frame in self.session.drain_frames() {
            self.transport.send(frame).await.unwrap();
        }
    }

    async fn send(&mut self, message: Message) {
        self.session.send(message).unwrap();
        self.flush().await;
    }
}

fn registries(hits: Arc<AtomicUsize>) -> Registries {
    let mut builder = RegistryBuilder::new();
    builder
        .object_types()
        .register(ObjectType::new("Lamp").ownership(OwnershipMode::Client))
        .unwrap();
    let methods = builder.methods();
    methods
        .method(MethodTarget::Connection, "add")
        .params([ParamType::Tag(TypeTag::I32), ParamType::Tag(TypeTag::I32)])
        .handler(|_, args| match args.as_slice() {
            [Value::I32(a), Value::I32(b)] => Ok(Value::I32(a + b)),
            _ => Err(ProtocolError::Deserialization("expected two i32".into())),
        })
        .unwrap();
    methods
        .method(MethodTarget::Connection, "whoami")
        .with_connection()
        .handler(|_, args| Ok(args.into_iter().next().unwrap_or(Value::Void)))
        .unwrap();
    methods
        .method(MethodTarget::Connection, "ping")
        .direction(RpcDirection::Client)
        .handler(|ctx, _| Ok(Value::U32(ctx.caller)))
        .unwrap();
    let counter = Arc::clone(&hits);
    methods
        .method(MethodTarget::Connection, "notify")
        .param(ParamType::Tag(TypeTag::String))
        .handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Void)
        })
        .unwrap();
    methods
        .method(MethodTarget::object("Lamp"), "toggle")
        .handler(|ctx, _| Ok(Value::U32(ctx.network_id.unwrap_or(0))))
        .unwrap();
    methods
        .method(MethodTarget::object("Lamp"), "look")
        .security(SecurityMode::Open)
        .handler(|_, _| Ok(Value::Bool(true)))
        .unwrap();
    builder.build()
}

#[tokio::test]
async fn test_client_calls_server() {
    let config = test_config();
    let registries = registries(Arc::default());
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let (client, _) = connect(&server, &config, registries).await;

    let sum = client
        .call("add", vec![Value::I32(2), Value::I32(40)])
        .await
        .unwrap();
    assert_eq!(sum, Value::I32(42));

    let err = client
        .call("add", vec![Value::String("2".into()), Value::I32(40)])
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::RpcFailed(ref m) if m.contains("no overload")));

    let err = client.call("missing", vec![]).await.unwrap_err();
    assert!(matches!(err, ProtocolError::RpcFailed(_)));
    server.shutdown().await;
}

#[tokio::test]
async fn test_handler_sees_caller() {
    let config = test_config();
    let registries = registries(Arc::default());
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let (_first, _) = connect(&server, &config, registries.clone()).await;
    let (second, second_id) = connect(&server, &config, registries).await;

    let caller = second.call("whoami", vec![]).await.unwrap();
    assert_eq!(caller, Value::ConnectionRef(second_id));
    server.shutdown().await;
}

#[tokio::test]
async fn test_server_calls_client() {
    let config = test_config();
    let registries = registries(Arc::default());
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let (client, id) = connect(&server, &config, registries).await;

    let pending = server
        .runtime()
        .invoke(id, RpcTarget::Connection, "ping", vec![])
        .unwrap();
    assert_eq!(pending.wait().await.unwrap(), Value::U32(SERVER_ID));

    // Client-direction methods never run on the server
    let err = client.call("ping", vec![]).await.unwrap_err();
    assert!(matches!(err, ProtocolError::RpcFailed(_)));
    server.shutdown().await;
}

#[tokio::test]
async fn test_object_method_authority() {
    let config = test_config();
    let registries = registries(Arc::default());
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let (owner, owner_id) = connect(&server, &config, registries.clone()).await;
    let (other, _) = connect(&server, &config, registries).await;

    let lamp = server
        .runtime()
        .spawn(
            "Lamp",
            SpawnOptions {
                owner: Some(owner_id),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    eventually(|| owner.runtime().objects().contains(lamp)).await;
    eventually(|| other.runtime().objects().contains(lamp)).await;

    assert_eq!(
        owner.call_object(lamp, "toggle", vec![]).await.unwrap(),
        Value::U32(lamp)
    );
    let err = other.call_object(lamp, "toggle", vec![]).await.unwrap_err();
    assert!(matches!(err, ProtocolError::RpcFailed(ref m) if m.contains("authority")));
    assert_eq!(
        other.call_object(lamp, "look", vec![]).await.unwrap(),
        Value::Bool(true)
    );

    // Unknown objects are refused before anything is sent
    let err = other.call_object(9999, "look", vec![]).await.unwrap_err();
    assert!(!matches!(err, ProtocolError::RpcFailed(_)));
    server.shutdown().await;
}

#[tokio::test]
async fn test_fire_and_forget() {
    let config = test_config();
    let hits = Arc::new(AtomicUsize::new(0));
    let registries = registries(Arc::clone(&hits));
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let (client, _) = connect(&server, &config, registries).await;

    for _ in 0..3 {
        client
            .runtime()
            .invoke_ignore(
                SERVER_ID,
                RpcTarget::Connection,
                "notify",
                vec![Value::String("hello".into())],
            )
            .unwrap();
    }
    eventually(|| hits.load(Ordering::SeqCst) == 3).await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_call_discards_result() {
    let config = test_config();
    let registries = slow_registries(Duration::from_millis(150));
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let (client, _) = connect(&server, &config, registries).await;

    let pending = client
        .runtime()
        .invoke(SERVER_ID, RpcTarget::Connection, "slow", vec![])
        .unwrap();
    pending.cancel().unwrap();

    let runtime = client.runtime().clone();
    eventually(|| runtime.metrics().snapshot().rpc_results_discarded == 1).await;
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disconnect_fails_pending_calls() {
    let config = test_config();
    let registries = slow_registries(Duration::from_millis(300));
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let (client, _) = connect(&server, &config, registries).await;

    let pending = client
        .runtime()
        .invoke(SERVER_ID, RpcTarget::Connection, "slow", vec![])
        .unwrap();
    client.disconnect("leaving").await.unwrap();

    let err = pending.wait().await.unwrap_err();
    assert!(matches!(err, ProtocolError::ConnectionClosed));
    assert!(matches!(
        client.call("slow", vec![]).await,
        Err(ProtocolError::NotConnected(SERVER_ID))
    ));
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_result_only_accepted_from_called_connection() {
    let config = test_config();
    let registries = slow_registries(Duration::from_millis(300));
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let (mut intruder, intruder_id) = ManualPeer::connect(&server, &config).await;
    let (_callee, callee_id) = connect(&server, &config, registries).await;

    let pending = server
        .runtime()
        .invoke(callee_id, RpcTarget::Connection, "slow", vec![])
        .unwrap();
    let forged = ValueCodec::default()
        .serialize(&Value::String("forged".into()))
        .unwrap();
    intruder
        .send(Message::RpcResult(RpcResult::ok(pending.id(), forged)))
        .await;

    assert_eq!(pending.wait().await.unwrap(), Value::Bool(true));
    let runtime = server.runtime().clone();
    assert_eq!(runtime.metrics().snapshot().rpc_results_discarded, 1);
    assert_eq!(
        runtime.connection_state(intruder_id),
        Some(ConnectionState::Connected)
    );
    server.shutdown().await;
}
