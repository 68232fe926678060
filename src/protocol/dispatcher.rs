//! Custom packet registry and dispatch.
//!
//! Application packets travel as [`PacketKind::Custom`](crate::core::packet::PacketKind)
//! with a 16-bit id. Ids are registered once at startup; registering a second
//! type under a taken id fails immediately with `PacketIdCollision`.

use crate::core::buffer::{ByteReader, ByteWriter};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::message::{CustomPayload, PacketMapping};
use crate::utils::locks;
use crate::ConnectionId;
use std::any::TypeId;
use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use tracing::{debug, warn};

/// An application-defined packet type
pub trait CustomPacket: Sized + Send + 'static {
    const ID: u16;
    const NAME: &'static str;

    fn encode(&self, w: &mut ByteWriter) -> Result<()>;
    fn decode(r: &mut ByteReader<'_>) -> Result<Self>;
}

type HandlerFn = dyn Fn(ConnectionId, &[u8]) -> Result<()> + Send + Sync + 'static;

#[derive(Debug)]
struct Registered {
    name: Cow<'static, str>,
    type_id: TypeId,
}

pub struct PacketRegistry {
    names: BTreeMap<u16, Registered>,
    handlers: RwLock<HashMap<u16, Box<HandlerFn>>>,
}

impl Default for PacketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PacketRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRegistry")
            .field("names", &self.names)
            .finish_non_exhaustive()
    }
}

impl PacketRegistry {
    pub fn new() -> Self {
        Self {
            names: BTreeMap::new(),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `P` under its id. Registering the same type twice is a no-op.
    pub fn register<P: CustomPacket>(&mut self) -> Result<()> {
        if let Some(existing) = self.names.get(&P::ID) {
            if existing.type_id != TypeId::of::<P>() {
                return Err(ProtocolError::PacketIdCollision {
                    id: P::ID,
                    existing: existing.name.to_string(),
                    new: format!("{} ({})", P::NAME, std::any::type_name::<P>()),
                });
            }
            return Ok(());
        }
        self.names.insert(
            P::ID,
            Registered {
                name: Cow::Borrowed(P::NAME),
                type_id: TypeId::of::<P>(),
            },
        );
        debug!(id = P::ID, name = P::NAME, "registered custom packet");
        Ok(())
    }

    /// Install a typed handler for a registered packet
    pub fn on<P, F>(&self, handler: F) -> Result<()>
    where
        P: CustomPacket,
        F: Fn(ConnectionId, P) -> Result<()> + Send + Sync + 'static,
    {
        if !self.is_registered::<P>() {
            return Err(ProtocolError::ConfigError(format!(
                "custom packet {} (id {}) is not registered",
                P::NAME,
                P::ID
            )));
        }
        let erased = move |connection: ConnectionId, payload: &[u8]| {
            let mut r = ByteReader::new(payload);
            let packet = P::decode(&mut r)?;
            r.finish()?;
            handler(connection, packet)
        };
        locks::write(&self.handlers)?.insert(P::ID, Box::new(erased));
        Ok(())
    }

    pub fn name(&self, id: u16) -> Option<&str> {
        self.names.get(&id).map(|r| r.name.as_ref())
    }

    fn is_registered<P: CustomPacket>(&self) -> bool {
        self.names
            .get(&P::ID)
            .is_some_and(|r| r.type_id == TypeId::of::<P>())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn encode<P: CustomPacket>(&self, packet: &P) -> Result<CustomPayload> {
        if !self.is_registered::<P>() {
            return Err(ProtocolError::Serialization(format!(
                "custom packet {} is not registered",
                P::NAME
            )));
        }
        let mut w = ByteWriter::new();
        packet.encode(&mut w)?;
        Ok(CustomPayload {
            id: P::ID,
            payload: w.into_bytes(),
        })
    }

    pub fn decode<P: CustomPacket>(&self, custom: &CustomPayload) -> Result<P> {
        if custom.id != P::ID {
            return Err(ProtocolError::Deserialization(format!(
                "packet id {} is not {}",
                custom.id,
                P::NAME
            )));
        }
        let mut r = ByteReader::new(&custom.payload);
        let packet = P::decode(&mut r)?;
        r.finish()?;
        Ok(packet)
    }

    /// The table announced to clients after the server handshake
    pub fn mapping(&self) -> PacketMapping {
        PacketMapping {
            entries: self
                .names
                .iter()
                .map(|(id, r)| (*id, r.name.to_string()))
                .collect(),
        }
    }

    /// Fail if any id known to both sides names a different type
    pub fn verify_mapping(&self, remote: &PacketMapping) -> Result<()> {
        for (id, name) in &remote.entries {
            if let Some(local) = self.names.get(id).map(|r| &r.name) {
                if local != name {
                    warn!(id, local = %local, remote = %name, "custom packet mapping mismatch");
                    return Err(ProtocolError::HandshakeError(format!(
                        "{}: id {id} is '{local}' locally but '{name}' remotely",
                        constants::ERR_PACKET_MAPPING_MISMATCH
                    )));
                }
            }
        }
        Ok(())
    }

    /// Run the handler for `custom`. Returns `false` when no handler is set.
    pub fn dispatch(&self, connection: ConnectionId, custom: &CustomPayload) -> Result<bool> {
        if !self.names.contains_key(&custom.id) {
            return Err(ProtocolError::Deserialization(format!(
                "unknown custom packet id {}",
                custom.id
            )));
        }
        let handlers = locks::read(&self.handlers)?;
        match handlers.get(&custom.id) {
            Some(handler) => handler(connection, &custom.payload).map(|()| true),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    struct Chat(String);

    impl CustomPacket for Chat {
        const ID: u16 = 1;
        const NAME: &'static str = "Chat";

        fn encode(&self, w: &mut ByteWriter) -> Result<()> {
            w.write_string(&self.0)
        }

        fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
            Ok(Chat(r.read_string()?))
        }
    }

    struct Emote;

    impl CustomPacket for Emote {
        const ID: u16 = 1;
        const NAME: &'static str = "Emote";

        fn encode(&self, _w: &mut ByteWriter) -> Result<()> {
            Ok(())
        }

        fn decode(_r: &mut ByteReader<'_>) -> Result<Self> {
            Ok(Emote)
        }
    }

    #[test]
    fn test_collision_detected_at_registration() {
        let mut registry = PacketRegistry::new();
        registry.register::<Chat>().unwrap();
        registry.register::<Chat>().unwrap();
        let err = registry.register::<Emote>().unwrap_err();
        assert!(matches!(err, ProtocolError::PacketIdCollision { id: 1, .. }));
    }

    mod v2 {
        use super::*;

        /// Same id and name as the outer `Chat`, different type
        pub struct Chat;

        impl CustomPacket for Chat {
            const ID: u16 = 1;
            const NAME: &'static str = "Chat";

            fn encode(&self, _w: &mut ByteWriter) -> Result<()> {
                Ok(())
            }

            fn decode(_r: &mut ByteReader<'_>) -> Result<Self> {
                Ok(Chat)
            }
        }
    }

    #[test]
    fn test_same_name_different_type_collides() {
        let mut registry = PacketRegistry::new();
        registry.register::<Chat>().unwrap();
        let err = registry.register::<v2::Chat>().unwrap_err();
        assert!(matches!(err, ProtocolError::PacketIdCollision { id: 1, .. }));

        assert!(registry.on::<v2::Chat, _>(|_, _| Ok(())).is_err());
        assert!(registry.encode(&v2::Chat).is_err());
        assert!(registry.encode(&Chat("still mine".into())).is_ok());
    }

    #[test]
    fn test_dispatch_decodes_and_calls_handler() {
        let mut registry = PacketRegistry::new();
        registry.register::<Chat>().unwrap();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        registry
            .on::<Chat, _>(move |conn, chat| {
                assert_eq!(chat, Chat("hi".into()));
                counter.store(conn, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let payload = registry.encode(&Chat("hi".into())).unwrap();
        assert!(registry.dispatch(42, &payload).unwrap());
        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn test_mapping_mismatch_detected() {
        let mut local = PacketRegistry::new();
        local.register::<Chat>().unwrap();
        let mut remote = PacketRegistry::new();
        remote.register::<Emote>().unwrap();

        assert!(local.verify_mapping(&local.mapping()).is_ok());
        assert!(local.verify_mapping(&remote.mapping()).is_err());
        assert!(local
            .verify_mapping(&PacketMapping { entries: vec![(9, "Other".into())] })
            .is_ok());
    }
}
