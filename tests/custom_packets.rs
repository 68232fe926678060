//! Application-defined packets between live runtimes.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{connect, eventually, next_event, test_config};
use std::sync::{Arc, Mutex};
use synclink::core::buffer::{ByteReader, ByteWriter};
use synclink::error::Result;
use synclink::protocol::dispatcher::CustomPacket;
use synclink::runtime::{RegistryBuilder, Registries, RuntimeEvent, Server};
use synclink::{ConnectionId, SERVER_ID};

#[derive(Debug, Clone, PartialEq)]
struct Chat {
    channel: u16,
    text: String,
}

impl CustomPacket for Chat {
    const ID: u16 = 40;
    const NAME: &'static str = "chat";

    fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        w.write_u16(self.channel);
        w.write_string(&self.text)
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            channel: r.read_u16()?,
            text: r.read_string()?,
        })
    }
}

type Inbox = Arc<Mutex<Vec<(ConnectionId, Chat)>>>;

fn registries() -> (Registries, Inbox) {
    let registries = RegistryBuilder::new().packet::<Chat>().unwrap().build();
    let inbox: Inbox = Arc::default();
    let sink = Arc::clone(&inbox);
    registries
        .packets
        .on::<Chat, _>(move |from, chat| {
            sink.lock().unwrap().push((from, chat));
            Ok(())
        })
        .unwrap();
    (registries, inbox)
}

#[tokio::test]
async fn test_client_to_server_packet() {
    let config = test_config();
    let (server_registries, server_inbox) = registries();
    let server = Server::new(config.clone(), server_registries).unwrap();
    let mut events = server.runtime().subscribe();

    let (client_registries, _) = registries();
    let (client, id) = connect(&server, &config, client_registries).await;

    let chat = Chat {
        channel: 3,
        text: "gg".into(),
    };
    client.runtime().send_custom(SERVER_ID, &chat).unwrap();

    let (from, packet_id) = next_event(&mut events, |e| match e {
        RuntimeEvent::CustomPacket { connection, id } => Some((connection, id)),
        _ => None,
    })
    .await;
    assert_eq!((from, packet_id), (id, Chat::ID));
    assert_eq!(server_inbox.lock().unwrap().as_slice(), &[(id, chat)]);
    server.shutdown().await;
}

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    let config = test_config();
    let (server_registries, _) = registries();
    let server = Server::new(config.clone(), server_registries).unwrap();

    let mut inboxes = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..3 {
        let (client_registries, inbox) = registries();
        clients.push(connect(&server, &config, client_registries).await.0);
        inboxes.push(inbox);
    }

    let sent = server
        .runtime()
        .broadcast_custom(&Chat {
            channel: 0,
            text: "server restarting".into(),
        })
        .unwrap();
    assert_eq!(sent, 3);
    for inbox in &inboxes {
        eventually(|| inbox.lock().unwrap().len() == 1).await;
        assert_eq!(inbox.lock().unwrap()[0].0, SERVER_ID);
    }
    server.shutdown().await;
}

#[tokio::test]
async fn test_unregistered_packet_refused_locally() {
    let config = test_config();
    let server = Server::new(config.clone(), RegistryBuilder::new().build()).unwrap();
    let (client, _) = connect(&server, &config, RegistryBuilder::new().build()).await;

    let result = client.runtime().send_custom(
        SERVER_ID,
        &Chat {
            channel: 1,
            text: "hello?".into(),
        },
    );
    assert!(result.is_err());
    assert!(client.is_connected());
    server.shutdown().await;
}
