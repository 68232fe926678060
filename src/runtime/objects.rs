//! Object replication on top of the runtime: spawn, destroy, modify and
//! sync-var routing for both sides.
//!
//! The server is the single authority. Clients send requests and apply only
//! what the server confirms.

use crate::core::value::Value;
use crate::error::{ProtocolError, Result};
use crate::protocol::message::Message;
use crate::protocol::session::Side;
use crate::replication::object::{NetworkObject, OwnershipMode};
use crate::replication::spawn::{
    ObjectAction, ObjectChange, ObjectManagement, SpawnOptions, SpawnOutcome, SpawnQueue,
};
use crate::replication::syncvar::{apply_update, changes_to_update, SyncVarChange, SyncVarUpdate};
use crate::runtime::context::{Connection, Runtime, RuntimeEvent};
use crate::utils::locks;
use crate::{ConnectionId, NetworkId, SERVER_ID};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

impl Runtime {
    /// Spawn an object of a registered type and return its network id.
    ///
    /// On a server the object is created immediately. A client sends a
    /// request and waits up to `response_timeout` for the server's answer.
    pub async fn spawn(&self, type_name: &str, options: SpawnOptions) -> Result<NetworkId> {
        let object_type = self
            .inner
            .registries
            .object_types
            .get(type_name)
            .ok_or_else(|| ProtocolError::Serialization(format!("unknown object type '{type_name}'")))?;

        match self.inner.side {
            Side::Server => {
                let request = ObjectManagement::create(0, object_type, &options);
                let outcome = locks::lock(&self.inner.authority)?.spawn(
                    &self.inner.registries.object_types,
                    &self.inner.objects,
                    SERVER_ID,
                    &request,
                )?;
                match outcome {
                    SpawnOutcome::Created(object) => {
                        let id = object.network_id;
                        self.announce_spawn(&object, None)?;
                        Ok(id)
                    }
                    SpawnOutcome::Duplicate(id) => Ok(id),
                }
            }
            Side::Client => {
                let server = self.connection(SERVER_ID)?;
                let request_id = self.inner.next_request.fetch_add(1, Ordering::Relaxed);
                let request = ObjectManagement::create(request_id, object_type, &options);
                let (tx, rx) = oneshot::channel();
                locks::lock(&self.inner.spawn_waiters)?.insert(request_id, tx);

                if let Err(e) = self.send_to(&server, Message::ObjectManagement(request)) {
                    locks::lock(&self.inner.spawn_waiters)?.remove(&request_id);
                    return Err(e);
                }
                let limit = self.inner.config.client.response_timeout;
                match tokio::time::timeout(limit, rx).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
                    Err(_) => {
                        locks::lock(&self.inner.spawn_waiters)?.remove(&request_id);
                        Err(ProtocolError::Timeout)
                    }
                }
            }
        }
    }

    /// Destroy an object. Objects others still require cannot be destroyed.
    pub fn destroy(&self, network_id: NetworkId) -> Result<()> {
        let object = self.inner.objects.get_active(network_id)?;
        let local = self.local_id();
        if !object.has_authority(local) {
            return Err(ProtocolError::PermissionDenied(format!(
                "no authority to destroy object {network_id}"
            )));
        }
        match self.inner.side {
            Side::Server => {
                self.check_no_dependents(network_id)?;
                self.destroy_object(&object)
            }
            Side::Client => {
                let server = self.connection(SERVER_ID)?;
                self.send_to(
                    &server,
                    Message::ObjectManagement(ObjectManagement::destroy(network_id)),
                )
            }
        }
    }

    /// Change ownership, visibility or privileges. Clients apply the change
    /// only once the server confirms it.
    pub fn modify(&self, network_id: NetworkId, change: ObjectChange) -> Result<()> {
        let object = self.inner.objects.get_active(network_id)?;
        if !object.has_authority(self.local_id()) {
            return Err(ProtocolError::PermissionDenied(format!(
                "no authority to modify object {network_id}"
            )));
        }
        match self.inner.side {
            Side::Server => self.apply_modify(&object, &change),
            Side::Client => {
                let server = self.connection(SERVER_ID)?;
                self.send_to(
                    &server,
                    Message::ObjectManagement(ObjectManagement::modify(network_id, &change)),
                )
            }
        }
    }

    /// Write a sync var locally and replicate it
    pub fn set_sync_var(&self, network_id: NetworkId, name: &str, value: Value) -> Result<()> {
        let writer = self.local_id();
        let data = self.inner.codec.serialize(&value)?;
        let object = self.inner.objects.update(network_id, |object| {
            object.may_write(name, writer)?;
            if let Some(var) = object.sync_vars.get_mut(name) {
                var.value = value;
            }
            Ok(object.clone())
        })?;
        self.inner.metrics.sync_var_update(1);

        let message = Message::SyncVarUpdate(SyncVarUpdate::single(network_id, name, data));
        match self.inner.side {
            Side::Server => {
                self.send_to_viewers(&object, None, &message);
                Ok(())
            }
            Side::Client => {
                let server = self.connection(SERVER_ID)?;
                self.send_to(&server, message)
            }
        }
    }

    pub fn sync_var(&self, network_id: NetworkId, name: &str) -> Result<Value> {
        let object = self.inner.objects.get_active(network_id)?;
        object.sync_var(name).cloned().ok_or_else(|| {
            ProtocolError::Deserialization(format!("object {network_id} has no sync var '{name}'"))
        })
    }

    /// Connected peers that hold a replica of `object`, minus `except`
    fn viewers(&self, object: &NetworkObject, except: Option<ConnectionId>) -> Vec<Arc<Connection>> {
        self.connected_peers()
            .into_iter()
            .filter(|c| Some(c.id()) != except && object.is_visible_to(c.id()))
            .collect()
    }

    fn send_to_viewers(&self, object: &NetworkObject, except: Option<ConnectionId>, message: &Message) {
        for connection in self.viewers(object, except) {
            if let Err(e) = self.send_to(&connection, message.clone()) {
                debug!(connection_id = connection.id(), error = %e, "replication send skipped");
            }
        }
    }

    fn reply(&self, connection: &Arc<Connection>, management: ObjectManagement) -> Result<()> {
        self.send_to(connection, Message::ObjectManagement(management))
    }

    fn check_no_dependents(&self, network_id: NetworkId) -> Result<()> {
        let dependents = self.inner.objects.dependents_of(network_id)?;
        if dependents.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::PermissionDenied(format!(
                "object {network_id} is still required by {dependents:?}"
            )))
        }
    }

    /// Server: tell every eligible peer about a freshly created object.
    /// `requester` gets the confirmation tagged with its request id.
    fn announce_spawn(
        &self,
        object: &NetworkObject,
        requester: Option<(ConnectionId, u32)>,
    ) -> Result<()> {
        self.inner.metrics.object_spawned();
        info!(network_id = object.network_id, type_name = %object.type_name, owner = object.owner_id, "object spawned");
        for connection in self.viewers(object, None) {
            let request_id = match requester {
                Some((id, request_id)) if id == connection.id() => request_id,
                _ => 0,
            };
            let confirm = ObjectManagement::confirm_create(object, request_id, &self.inner.codec)?;
            if let Err(e) = self.reply(&connection, confirm) {
                debug!(connection_id = connection.id(), error = %e, "spawn announcement skipped");
            }
        }
        self.emit(RuntimeEvent::ObjectSpawned(object.network_id));
        Ok(())
    }

    /// Server: mark inactive, confirm to viewers, then drop from the arena
    fn destroy_object(&self, object: &NetworkObject) -> Result<()> {
        let id = object.network_id;
        self.inner.objects.mark_inactive(id)?;
        let notice = Message::ObjectManagement(ObjectManagement::confirm_destroy(id));
        self.send_to_viewers(object, None, &notice);
        self.inner.objects.remove(id)?;
        locks::lock(&self.inner.authority)?.forget_object(id);
        self.inner.metrics.object_destroyed();
        info!(network_id = id, "object destroyed");
        self.emit(RuntimeEvent::ObjectDestroyed(id));
        Ok(())
    }

    /// Server: apply a modification and reconcile every peer's view
    fn apply_modify(&self, before: &NetworkObject, change: &ObjectChange) -> Result<()> {
        let after = self.inner.objects.update(before.network_id, |object| {
            change.apply(object);
            Ok(object.clone())
        })?;
        self.reconcile(before, &after)?;
        self.emit(RuntimeEvent::ObjectModified(after.network_id));
        Ok(())
    }

    /// Send each peer what it needs after an object's visibility or owner
    /// changed: a spawn if it gained sight, a destroy if it lost it, a
    /// modification otherwise.
    fn reconcile(&self, before: &NetworkObject, after: &NetworkObject) -> Result<()> {
        for connection in self.connected_peers() {
            let id = connection.id();
            let management = match (before.is_visible_to(id), after.is_visible_to(id)) {
                (false, true) => ObjectManagement::confirm_create(after, 0, &self.inner.codec)?,
                (true, false) => ObjectManagement::confirm_destroy(after.network_id),
                (true, true) => ObjectManagement::confirm_modify(after),
                (false, false) => continue,
            };
            if let Err(e) = self.reply(&connection, management) {
                debug!(connection_id = id, error = %e, "modify notice skipped");
            }
        }
        Ok(())
    }

    /// Server: a client is gone; hand its objects to the fallback owner
    pub(crate) fn owner_left(&self, connection: ConnectionId) {
        let fallback = self.inner.config.replication.owner_fallback;
        match self.inner.objects.apply_owner_fallback(connection, fallback) {
            Ok(changed) => {
                for object in changed {
                    debug!(network_id = object.network_id, ?fallback, "owner left, fallback applied");
                    let notice = Message::ObjectManagement(ObjectManagement::confirm_modify(&object));
                    self.send_to_viewers(&object, None, &notice);
                    self.emit(RuntimeEvent::ObjectModified(object.network_id));
                }
            }
            Err(e) => warn!(connection_id = connection, error = %e, "owner fallback failed"),
        }
        if let Ok(mut authority) = locks::lock(&self.inner.authority) {
            authority.forget_connection(connection);
        }
    }

    /// Server: every visible object, requirements first
    pub(crate) fn send_snapshot(&self, connection: &Arc<Connection>) -> Result<()> {
        let visible = self.inner.objects.visible_to(connection.id())?;
        if visible.is_empty() {
            return Ok(());
        }
        let ordered = SpawnQueue::order(visible)?;
        debug!(connection_id = connection.id(), objects = ordered.len(), "sending object snapshot");
        for object in &ordered {
            let confirm = ObjectManagement::confirm_create(object, 0, &self.inner.codec)?;
            self.reply(connection, confirm)?;
        }
        Ok(())
    }

    /// Client: the server link dropped; nobody will answer pending spawns
    pub(crate) fn fail_spawn_waiters(&self) {
        if let Ok(mut waiters) = locks::lock(&self.inner.spawn_waiters) {
            for (_, waiter) in waiters.drain() {
                let _ = waiter.send(Err(ProtocolError::ConnectionClosed));
            }
        }
    }

    fn resolve_spawn(&self, request_id: u32, result: Result<NetworkId>) {
        if request_id == 0 {
            return;
        }
        let waiter = locks::lock(&self.inner.spawn_waiters)
            .ok()
            .and_then(|mut w| w.remove(&request_id));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => debug!(request_id, "spawn answer without a waiter"),
        }
    }

    pub(crate) fn on_object_management(
        &self,
        connection: &Arc<Connection>,
        management: ObjectManagement,
    ) -> Result<()> {
        match (self.inner.side, management.action) {
            (Side::Server, ObjectAction::Create) => self.on_create(connection, management),
            (Side::Server, ObjectAction::Destroy) => self.on_destroy(connection, management),
            (Side::Server, ObjectAction::Modify) => self.on_modify(connection, management),
            (Side::Client, ObjectAction::ConfirmCreate) => self.on_confirm_create(management),
            (Side::Client, ObjectAction::AlreadyExists) => {
                self.resolve_spawn(management.request_id, Ok(management.network_id));
                Ok(())
            }
            (Side::Client, ObjectAction::Rejected) => {
                warn!(network_id = management.network_id, reason = %management.reason, "request rejected");
                self.resolve_spawn(
                    management.request_id,
                    Err(ProtocolError::Rejected(management.reason.clone())),
                );
                self.emit(RuntimeEvent::RequestRejected {
                    network_id: management.network_id,
                    reason: management.reason,
                });
                Ok(())
            }
            (Side::Client, ObjectAction::ConfirmDestroy) => {
                self.remove_replica(management.network_id)
            }
            (Side::Client, ObjectAction::ConfirmModify) => self.on_confirm_modify(management),
            (side, action) => Err(ProtocolError::UnexpectedMessage(format!(
                "{action:?} is not accepted on the {side:?} side"
            ))),
        }
    }

    fn on_create(&self, connection: &Arc<Connection>, request: ObjectManagement) -> Result<()> {
        let requester = connection.id();
        let outcome = locks::lock(&self.inner.authority)?.spawn(
            &self.inner.registries.object_types,
            &self.inner.objects,
            requester,
            &request,
        );
        match outcome {
            Ok(SpawnOutcome::Created(object)) => {
                self.announce_spawn(&object, Some((requester, request.request_id)))?;
                if !object.is_visible_to(requester) {
                    self.reply(
                        connection,
                        ObjectManagement::already_exists(request.request_id, object.network_id),
                    )?;
                }
                Ok(())
            }
            Ok(SpawnOutcome::Duplicate(id)) => {
                self.reply(connection, ObjectManagement::already_exists(request.request_id, id))
            }
            Err(e) if !e.is_fatal() => {
                warn!(connection_id = requester, type_name = %request.type_name, error = %e, "spawn refused");
                self.reply(
                    connection,
                    ObjectManagement::rejected(request.request_id, 0, e.to_string()),
                )
            }
            Err(e) => Err(e),
        }
    }

    fn on_destroy(&self, connection: &Arc<Connection>, request: ObjectManagement) -> Result<()> {
        let id = request.network_id;
        let checked = self.inner.objects.get_active(id).and_then(|object| {
            if !object.has_authority(connection.id()) {
                return Err(ProtocolError::PermissionDenied(format!(
                    "connection {} may not destroy object {id}",
                    connection.id()
                )));
            }
            self.check_no_dependents(id)?;
            Ok(object)
        });
        match checked {
            Ok(object) => self.destroy_object(&object),
            Err(e) => {
                warn!(connection_id = connection.id(), network_id = id, error = %e, "destroy refused");
                self.reply(connection, ObjectManagement::rejected(0, id, e.to_string()))
            }
        }
    }

    fn on_modify(&self, connection: &Arc<Connection>, request: ObjectManagement) -> Result<()> {
        let id = request.network_id;
        let checked = self.inner.objects.get_active(id).and_then(|object| {
            if object.has_authority(connection.id()) {
                Ok(object)
            } else {
                Err(ProtocolError::PermissionDenied(format!(
                    "connection {} may not modify object {id}",
                    connection.id()
                )))
            }
        });
        match checked {
            Ok(object) => self.apply_modify(&object, &request.change()),
            Err(e) => {
                warn!(connection_id = connection.id(), network_id = id, error = %e, "modify refused");
                self.reply(connection, ObjectManagement::rejected(0, id, e.to_string()))
            }
        }
    }

    fn on_confirm_create(&self, confirm: ObjectManagement) -> Result<()> {
        let request_id = confirm.request_id;
        let id = confirm.network_id;
        if self.inner.objects.contains(id) {
            debug!(network_id = id, "replica already present");
            self.resolve_spawn(request_id, Ok(id));
            return Ok(());
        }
        let mut object = confirm.to_object(&self.inner.codec, self)?;
        self.restore_var_owners(&mut object);

        let released = {
            let objects = &self.inner.objects;
            locks::lock(&self.inner.spawn_queue)?.offer(object, |r| objects.contains(r))?
        };
        for object in released {
            let spawned = object.network_id;
            if self.inner.objects.insert(object)? {
                self.inner.metrics.object_spawned();
                self.emit(RuntimeEvent::ObjectSpawned(spawned));
            }
        }
        self.resolve_spawn(request_id, Ok(id));
        Ok(())
    }

    /// Confirmations carry values, not per-field owners; take those from the
    /// registered type when it is known here.
    fn restore_var_owners(&self, object: &mut NetworkObject) {
        let Some(object_type) = self.inner.registries.object_types.get(&object.type_name) else {
            return;
        };
        for def in &object_type.sync_vars {
            if let Some(var) = object.sync_vars.get_mut(&def.name) {
                var.sync_owner = match def.sync_owner {
                    OwnershipMode::Client if object.ownership != OwnershipMode::Client => {
                        object.ownership
                    }
                    owner => owner,
                };
            }
        }
    }

    fn remove_replica(&self, network_id: NetworkId) -> Result<()> {
        self.inner.objects.mark_inactive(network_id)?;
        if self.inner.objects.remove(network_id)?.is_some() {
            self.inner.metrics.object_destroyed();
            self.emit(RuntimeEvent::ObjectDestroyed(network_id));
        }
        Ok(())
    }

    fn on_confirm_modify(&self, confirm: ObjectManagement) -> Result<()> {
        let change = confirm.change();
        self.inner.objects.update(confirm.network_id, |object| {
            let had_client_owner = object.owner_id != SERVER_ID;
            change.apply(object);
            if had_client_owner
                && change.owner_id == SERVER_ID
                && change.ownership != OwnershipMode::Client
            {
                object.apply_fallback(change.ownership);
            }
            Ok(())
        })?;
        self.emit(RuntimeEvent::ObjectModified(confirm.network_id));
        Ok(())
    }

    pub(crate) fn on_sync_var_update(
        &self,
        connection: &Arc<Connection>,
        update: SyncVarUpdate,
    ) -> Result<()> {
        let (writer, check_authority) = match self.inner.side {
            Side::Server => (connection.id(), true),
            Side::Client => (SERVER_ID, false),
        };
        let changes = match apply_update(
            &self.inner.objects,
            &self.inner.codec,
            self,
            writer,
            &update,
            check_authority,
        ) {
            Ok(changes) => changes,
            Err(e) => {
                if self.inner.side == Side::Server
                    && matches!(
                        e,
                        ProtocolError::PermissionDenied(_) | ProtocolError::ObjectInactive(_)
                    )
                {
                    self.refuse_sync_update(connection, &update, &e);
                }
                return Err(e);
            }
        };
        if changes.is_empty() {
            return Ok(());
        }
        self.inner.metrics.sync_var_update(changes.len() as u64);

        if self.inner.side == Side::Server {
            let object = self.inner.objects.get_active(update.network_id)?;
            let relay = changes_to_update(&self.inner.codec, update.network_id, &changes)?;
            self.send_to_viewers(&object, Some(connection.id()), &Message::SyncVarUpdate(relay));
        }
        for SyncVarChange {
            network_id,
            name,
            value,
        } in changes
        {
            self.emit(RuntimeEvent::SyncVarChanged {
                network_id,
                name,
                value,
            });
        }
        Ok(())
    }

    /// Server: tell the writer its update was refused and resend the
    /// authoritative values so its replica converges again
    fn refuse_sync_update(
        &self,
        connection: &Arc<Connection>,
        update: &SyncVarUpdate,
        error: &ProtocolError,
    ) {
        let network_id = update.network_id;
        let rejected = ObjectManagement::rejected(0, network_id, error.to_string());
        if let Err(e) = self.send_to(connection, Message::ObjectManagement(rejected)) {
            debug!(connection_id = connection.id(), error = %e, "sync var refusal not sent");
            return;
        }
        let object = match self.inner.objects.get_active(network_id) {
            Ok(object) if object.is_visible_to(connection.id()) => object,
            _ => return,
        };
        let authoritative: Vec<SyncVarChange> = update
            .entries
            .iter()
            .filter_map(|(name, _)| {
                object.sync_var(name).map(|value| SyncVarChange {
                    network_id,
                    name: name.clone(),
                    value: value.clone(),
                })
            })
            .collect();
        if authoritative.is_empty() {
            return;
        }
        match changes_to_update(&self.inner.codec, network_id, &authoritative) {
            Ok(resync) => {
                if let Err(e) = self.send_to(connection, Message::SyncVarUpdate(resync)) {
                    debug!(connection_id = connection.id(), error = %e, "sync var resync not sent");
                }
            }
            Err(e) => warn!(network_id, error = %e, "sync var resync failed"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::replication::object::ObjectType;
    use crate::runtime::context::RegistryBuilder;

    fn server() -> Runtime {
        let mut builder = RegistryBuilder::new();
        builder
            .object_types()
            .register(
                ObjectType::new("Crate")
                    .sync_var("health", OwnershipMode::Server, Value::I32(100)),
            )
            .unwrap();
        Runtime::new(Side::Server, NetworkConfig::default(), builder.build()).unwrap()
    }

    #[tokio::test]
    async fn test_server_spawn_allocates_from_one() {
        let runtime = server();
        let mut events = runtime.subscribe();
        let first = runtime.spawn("Crate", SpawnOptions::default()).await.unwrap();
        let second = runtime.spawn("Crate", SpawnOptions::default()).await.unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(events.recv().await.unwrap(), RuntimeEvent::ObjectSpawned(1));
        assert_eq!(runtime.objects().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_type_refused() {
        let runtime = server();
        assert!(runtime.spawn("Ghost", SpawnOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_destroy_blocked_by_dependents() {
        let runtime = server();
        let base = runtime.spawn("Crate", SpawnOptions::default()).await.unwrap();
        let top = runtime
            .spawn(
                "Crate",
                SpawnOptions {
                    required: vec![base],
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            runtime.destroy(base),
            Err(ProtocolError::PermissionDenied(_))
        ));
        runtime.destroy(top).unwrap();
        runtime.destroy(base).unwrap();
        assert!(runtime.objects().is_empty());
    }

    #[tokio::test]
    async fn test_server_writes_sync_var() {
        let runtime = server();
        let id = runtime.spawn("Crate", SpawnOptions::default()).await.unwrap();
        runtime.set_sync_var(id, "health", Value::I32(40)).unwrap();
        assert_eq!(runtime.sync_var(id, "health").unwrap(), Value::I32(40));
        assert!(runtime.set_sync_var(id, "armor", Value::I32(1)).is_err());
    }

    #[tokio::test]
    async fn test_server_modify_applies() {
        let runtime = server();
        let id = runtime.spawn("Crate", SpawnOptions::default()).await.unwrap();
        let mut change = ObjectChange::from_object(&runtime.objects().get_active(id).unwrap());
        change.privileged.insert(9);
        runtime.modify(id, change).unwrap();
        assert!(runtime.objects().get_active(id).unwrap().privileged.contains(&9));
    }
}
