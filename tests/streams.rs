//! Stream multiplexing between live runtimes.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use bytes::{Bytes, BytesMut};
use common::{connect, eventually, next_event, test_config};
use std::sync::Arc;
use std::time::Duration;
use synclink::runtime::{RegistryBuilder, Registries, Runtime, RuntimeEvent, Server};
use synclink::stream::channel::StreamCapabilities;
use synclink::stream::mux::{StreamDecision, StreamEvent};
use synclink::{ConnectionId, SERVER_ID};
use tokio::sync::broadcast;

const CATALOG: &[u8] = b"hello world, this is the catalog";

fn registries() -> Registries {
    let mut builder = RegistryBuilder::new();
    let streams = builder.streams();
    streams
        .register("upload", |_| StreamDecision::Accept {
            capabilities: StreamCapabilities::default(),
            capacity: Some(32),
            source: None,
        })
        .unwrap();
    streams
        .register("catalog", |_| {
            StreamDecision::serve(Arc::new(Bytes::from_static(CATALOG)))
        })
        .unwrap();
    builder.build()
}

async fn stream_event(events: &mut broadcast::Receiver<RuntimeEvent>) -> StreamEvent {
    next_event(events, |e| match e {
        RuntimeEvent::Stream { event, .. } => Some(event),
        _ => None,
    })
    .await
}

/// Read until `expected` bytes arrived
async fn read_all(runtime: &Runtime, connection: ConnectionId, stream_id: u16, expected: usize) -> Bytes {
    let mut received = BytesMut::new();
    tokio::time::timeout(common::WAIT, async {
        while received.len() < expected {
            let chunk = runtime.read_stream(connection, stream_id, 16).unwrap();
            if chunk.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            received.extend_from_slice(&chunk);
        }
    })
    .await
    .expect("stream data not received in time");
    received.freeze()
}

#[tokio::test]
async fn test_credit_limited_transfer() {
    let config = test_config();
    let registries = registries();
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let mut server_events = server.runtime().subscribe();
    let (client, client_id) = connect(&server, &config, registries).await;
    let mut client_events = client.runtime().subscribe();

    let stream_id = client
        .runtime()
        .open_stream(SERVER_ID, "upload", None, Bytes::from_static(b"avatar.png"))
        .unwrap();
    assert_eq!(stream_id % 2, 1);

    match stream_event(&mut server_events).await {
        StreamEvent::Opened {
            stream_id: opened,
            handler,
            metadata,
        } => {
            assert_eq!(opened, stream_id);
            assert_eq!(handler, "upload");
            assert_eq!(&metadata[..], b"avatar.png");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(matches!(
        stream_event(&mut client_events).await,
        StreamEvent::Accepted { .. }
    ));

    // Five times the advertised window; only flows as the server reads
    let payload: Bytes = (0..160u8).collect::<Vec<_>>().into();
    client
        .runtime()
        .write_stream(SERVER_ID, stream_id, payload.clone())
        .unwrap();
    let received = read_all(server.runtime(), client_id, stream_id, payload.len()).await;
    assert_eq!(received, payload);

    let runtime = server.runtime().clone();
    assert!(runtime.metrics().snapshot().stream_bytes_received >= payload.len() as u64);
    server.shutdown().await;
}

#[tokio::test]
async fn test_unknown_handler_rejected() {
    let config = test_config();
    let registries = registries();
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let (client, _) = connect(&server, &config, registries).await;
    let mut events = client.runtime().subscribe();

    let stream_id = client
        .runtime()
        .open_stream(SERVER_ID, "voice", None, Bytes::new())
        .unwrap();
    match stream_event(&mut events).await {
        StreamEvent::Rejected {
            stream_id: rejected,
            reason,
        } => {
            assert_eq!(rejected, stream_id);
            assert!(reason.contains("voice"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(client
        .runtime()
        .write_stream(SERVER_ID, stream_id, Bytes::from_static(b"x"))
        .is_err());
    server.shutdown().await;
}

#[tokio::test]
async fn test_seekable_source() {
    let config = test_config();
    let registries = registries();
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let (client, _) = connect(&server, &config, registries).await;
    let mut events = client.runtime().subscribe();
    let runtime = client.runtime().clone();

    let stream_id = runtime
        .open_stream(SERVER_ID, "catalog", None, Bytes::new())
        .unwrap();
    match stream_event(&mut events).await {
        StreamEvent::Accepted { capabilities, .. } => assert!(capabilities.can_seek),
        other => panic!("unexpected event {other:?}"),
    }

    runtime.request_stream(SERVER_ID, stream_id, 6, 5).unwrap();
    let slice = read_all(&runtime, SERVER_ID, stream_id, 5).await;
    assert_eq!(&slice[..], b"world");

    runtime.request_stream(SERVER_ID, stream_id, 4096, 5).unwrap();
    let failed = next_event(&mut events, |e| match e {
        RuntimeEvent::Stream {
            event: StreamEvent::RequestFailed { offset, .. },
            ..
        } => Some(offset),
        _ => None,
    })
    .await;
    assert_eq!(failed, 4096);
    server.shutdown().await;
}

#[tokio::test]
async fn test_close_and_disconnect_end_streams() {
    let config = test_config();
    let registries = registries();
    let server = Server::new(config.clone(), registries.clone()).unwrap();
    let mut server_events = server.runtime().subscribe();
    let (client, _) = connect(&server, &config, registries).await;

    let first = client
        .runtime()
        .open_stream(SERVER_ID, "upload", None, Bytes::new())
        .unwrap();
    let second = client
        .runtime()
        .open_stream(SERVER_ID, "upload", None, Bytes::new())
        .unwrap();
    assert_ne!(first, second);
    for _ in 0..2 {
        assert!(matches!(
            stream_event(&mut server_events).await,
            StreamEvent::Opened { .. }
        ));
    }

    client
        .runtime()
        .close_stream(SERVER_ID, first, "done")
        .unwrap();
    match stream_event(&mut server_events).await {
        StreamEvent::Closed { stream_id, reason } => {
            assert_eq!(stream_id, first);
            assert_eq!(reason, "done");
        }
        other => panic!("unexpected event {other:?}"),
    }

    client.disconnect("bye").await.unwrap();
    match stream_event(&mut server_events).await {
        StreamEvent::Closed { stream_id, .. } => assert_eq!(stream_id, second),
        other => panic!("unexpected event {other:?}"),
    }
    let runtime = server.runtime().clone();
    eventually(|| runtime.connection_count() == 0).await;
    server.shutdown().await;
}
