//! Object management messages, server-side spawn authority and
//! dependency-ordered spawning.

use crate::core::buffer::{ByteReader, ByteWriter};
use crate::core::serialization::{ReferenceResolver, ValueCodec};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{
    read_ids, read_named_values, write_ids, write_named_values, WireMessage,
};
use crate::core::value::SerializedData;
use crate::replication::object::{
    NetworkObject, ObjectType, ObjectTypeRegistry, OwnershipMode, SpawnRequest, SyncVar, VisibilityMode,
};
use crate::replication::registry::ObjectRegistry;
use crate::{ConnectionId, NetworkId, SERVER_ID};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, warn};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectAction {
    Create = 0,
    ConfirmCreate = 1,
    AlreadyExists = 2,
    Destroy = 3,
    ConfirmDestroy = 4,
    Modify = 5,
    ConfirmModify = 6,
    Rejected = 7,
}

impl ObjectAction {
    pub fn from_u8(raw: u8) -> Result<Self> {
        use ObjectAction::*;
        Ok(match raw {
            0 => Create,
            1 => ConfirmCreate,
            2 => AlreadyExists,
            3 => Destroy,
            4 => ConfirmDestroy,
            5 => Modify,
            6 => ConfirmModify,
            7 => Rejected,
            other => {
                return Err(ProtocolError::Deserialization(format!(
                    "unknown object action {other}"
                )))
            }
        })
    }
}

/// One object management packet. Fields irrelevant to `action` are left at
/// their defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectManagement {
    pub action: ObjectAction,
    /// Requester-local correlation id for `Create`, echoed in replies
    pub request_id: u32,
    pub network_id: NetworkId,
    pub type_name: String,
    /// For `Create`, 0 means the requester itself
    pub owner_id: ConnectionId,
    pub ownership: OwnershipMode,
    pub visibility: VisibilityMode,
    pub privileged: Vec<ConnectionId>,
    pub required: Vec<NetworkId>,
    pub spawn_priority: i32,
    pub payload: Bytes,
    pub sync_vars: Vec<(String, SerializedData)>,
    pub reason: String,
}

impl ObjectManagement {
    fn empty(action: ObjectAction) -> Self {
        Self {
            action,
            request_id: 0,
            network_id: 0,
            type_name: String::new(),
            owner_id: 0,
            ownership: OwnershipMode::Server,
            visibility: VisibilityMode::Everyone,
            privileged: Vec::new(),
            required: Vec::new(),
            spawn_priority: 0,
            payload: Bytes::new(),
            sync_vars: Vec::new(),
            reason: String::new(),
        }
    }

    /// Spawn request; unset options fall back to the type's declared modes
    pub fn create(request_id: u32, object_type: &ObjectType, options: &SpawnOptions) -> Self {
        Self {
            request_id,
            type_name: object_type.name.clone(),
            owner_id: options.owner.unwrap_or(0),
            ownership: options.ownership.unwrap_or(object_type.ownership),
            visibility: options.visibility.unwrap_or(object_type.visibility),
            privileged: options.privileged.clone(),
            required: options.required.clone(),
            spawn_priority: options.spawn_priority,
            payload: options.payload.clone(),
            ..Self::empty(ObjectAction::Create)
        }
    }

    /// Full description of a confirmed object
    pub fn confirm_create(object: &NetworkObject, request_id: u32, codec: &ValueCodec) -> Result<Self> {
        let sync_vars = object
            .sync_vars
            .values()
            .map(|var| Ok((var.name.clone(), codec.serialize(&var.value)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            request_id,
            network_id: object.network_id,
            type_name: object.type_name.clone(),
            owner_id: object.owner_id,
            ownership: object.ownership,
            visibility: object.visibility,
            privileged: object.privileged.iter().copied().collect(),
            required: object.required.clone(),
            spawn_priority: object.spawn_priority,
            payload: object.payload.clone(),
            sync_vars,
            ..Self::empty(ObjectAction::ConfirmCreate)
        })
    }

    pub fn already_exists(request_id: u32, network_id: NetworkId) -> Self {
        Self {
            request_id,
            network_id,
            ..Self::empty(ObjectAction::AlreadyExists)
        }
    }

    pub fn destroy(network_id: NetworkId) -> Self {
        Self {
            network_id,
            ..Self::empty(ObjectAction::Destroy)
        }
    }

    pub fn confirm_destroy(network_id: NetworkId) -> Self {
        Self {
            network_id,
            ..Self::empty(ObjectAction::ConfirmDestroy)
        }
    }

    pub fn modify(network_id: NetworkId, change: &ObjectChange) -> Self {
        Self {
            network_id,
            owner_id: change.owner_id,
            ownership: change.ownership,
            visibility: change.visibility,
            privileged: change.privileged.iter().copied().collect(),
            ..Self::empty(ObjectAction::Modify)
        }
    }

    pub fn confirm_modify(object: &NetworkObject) -> Self {
        Self {
            network_id: object.network_id,
            owner_id: object.owner_id,
            ownership: object.ownership,
            visibility: object.visibility,
            privileged: object.privileged.iter().copied().collect(),
            ..Self::empty(ObjectAction::ConfirmModify)
        }
    }

    pub fn rejected(request_id: u32, network_id: NetworkId, reason: impl Into<String>) -> Self {
        Self {
            request_id,
            network_id,
            reason: reason.into(),
            ..Self::empty(ObjectAction::Rejected)
        }
    }

    /// The ownership fields of a `Modify` or `ConfirmModify`
    pub fn change(&self) -> ObjectChange {
        ObjectChange {
            owner_id: self.owner_id,
            ownership: self.ownership,
            visibility: self.visibility,
            privileged: self.privileged.iter().copied().collect(),
        }
    }

    /// Rebuild the object carried by a `ConfirmCreate`
    pub fn to_object(
        &self,
        codec: &ValueCodec,
        resolver: &dyn ReferenceResolver,
    ) -> Result<NetworkObject> {
        let mut sync_vars = BTreeMap::new();
        for (name, data) in &self.sync_vars {
            sync_vars.insert(
                name.clone(),
                SyncVar {
                    name: name.clone(),
                    // Writers are validated by the server; replicas only need values
                    sync_owner: self.ownership,
                    value: codec.deserialize(data, resolver)?,
                },
            );
        }
        Ok(NetworkObject {
            network_id: self.network_id,
            type_name: self.type_name.clone(),
            owner_id: self.owner_id,
            ownership: self.ownership,
            visibility: self.visibility,
            active: true,
            privileged: self.privileged.iter().copied().collect(),
            required: self.required.clone(),
            spawn_priority: self.spawn_priority,
            payload: self.payload.clone(),
            sync_vars,
        })
    }
}

impl WireMessage for ObjectManagement {
    fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        w.write_u8(self.action as u8);
        w.write_u32(self.request_id);
        w.write_u32(self.network_id);
        w.write_string(&self.type_name)?;
        w.write_u32(self.owner_id);
        w.write_u8(self.ownership.to_wire());
        w.write_u8(self.visibility.to_wire());
        write_ids(w, &self.privileged)?;
        write_ids(w, &self.required)?;
        w.write_i32(self.spawn_priority);
        w.write_blob(&self.payload)?;
        write_named_values(w, &self.sync_vars)?;
        w.write_string(&self.reason)
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            action: ObjectAction::from_u8(r.read_u8()?)?,
            request_id: r.read_u32()?,
            network_id: r.read_u32()?,
            type_name: r.read_string()?,
            owner_id: r.read_u32()?,
            ownership: OwnershipMode::from_wire(r.read_u8()?)?,
            visibility: VisibilityMode::from_wire(r.read_u8()?)?,
            privileged: read_ids(r)?,
            required: read_ids(r)?,
            spawn_priority: r.read_i32()?,
            payload: Bytes::copy_from_slice(r.read_blob()?),
            sync_vars: read_named_values(r)?,
            reason: r.read_string()?,
        })
    }
}

/// Caller-chosen parameters of a spawn; unset fields use the type defaults
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Owning connection; `None` means the spawning side
    pub owner: Option<ConnectionId>,
    pub ownership: Option<OwnershipMode>,
    pub visibility: Option<VisibilityMode>,
    pub privileged: Vec<ConnectionId>,
    pub required: Vec<NetworkId>,
    pub spawn_priority: i32,
    pub payload: Bytes,
}

/// New ownership state requested through `Modify`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectChange {
    pub owner_id: ConnectionId,
    pub ownership: OwnershipMode,
    pub visibility: VisibilityMode,
    pub privileged: BTreeSet<ConnectionId>,
}

impl ObjectChange {
    /// Start from an object's current state
    pub fn from_object(object: &NetworkObject) -> Self {
        Self {
            owner_id: object.owner_id,
            ownership: object.ownership,
            visibility: object.visibility,
            privileged: object.privileged.clone(),
        }
    }

    pub fn apply(&self, object: &mut NetworkObject) {
        object.owner_id = self.owner_id;
        object.ownership = self.ownership;
        object.visibility = self.visibility;
        object.privileged = self.privileged.clone();
    }
}

#[derive(Debug)]
pub enum SpawnOutcome {
    Created(NetworkObject),
    Duplicate(NetworkId),
}

/// Server-side network id allocation and `Create` deduplication
#[derive(Debug)]
pub struct SpawnAuthority {
    next_id: NetworkId,
    requests: HashMap<(ConnectionId, u32), NetworkId>,
}

impl Default for SpawnAuthority {
    fn default() -> Self {
        Self::new()
    }
}

impl SpawnAuthority {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            requests: HashMap::new(),
        }
    }

    fn allocate(&mut self, registry: &ObjectRegistry) -> NetworkId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !registry.contains(id) {
                return id;
            }
        }
    }

    /// Validate and register an object on behalf of `requester`.
    ///
    /// `owner` and the modes are taken from the request; the server is the
    /// requester for local spawns.
    pub fn spawn(
        &mut self,
        types: &ObjectTypeRegistry,
        registry: &ObjectRegistry,
        requester: ConnectionId,
        request: &ObjectManagement,
    ) -> Result<SpawnOutcome> {
        if requester != SERVER_ID && request.request_id != 0 {
            if let Some(id) = self.requests.get(&(requester, request.request_id)) {
                debug!(requester, request_id = request.request_id, network_id = *id, "duplicate create");
                return Ok(SpawnOutcome::Duplicate(*id));
            }
        }
        if request.network_id != 0 && registry.contains(request.network_id) {
            return Ok(SpawnOutcome::Duplicate(request.network_id));
        }

        let object_type = types.get(&request.type_name).ok_or_else(|| {
            ProtocolError::Deserialization(format!("unknown object type '{}'", request.type_name))
        })?;

        let (owner_id, ownership) = match request.ownership {
            OwnershipMode::Client => {
                let owner = if requester != SERVER_ID && request.owner_id == 0 {
                    requester
                } else {
                    request.owner_id
                };
                if requester != SERVER_ID && owner != requester {
                    return Err(ProtocolError::PermissionDenied(
                        "clients may only spawn objects they own".into(),
                    ));
                }
                (owner, OwnershipMode::Client)
            }
            mode => (SERVER_ID, mode),
        };

        if let Some(validator) = &object_type.validator {
            validator(&SpawnRequest {
                requester,
                type_name: &request.type_name,
                owner_id,
                payload: &request.payload,
            })?;
        }
        registry.check_dependencies(None, &request.required)?;

        let network_id = self.allocate(registry);
        let object = NetworkObject {
            network_id,
            type_name: object_type.name.clone(),
            owner_id,
            ownership,
            visibility: request.visibility,
            active: true,
            privileged: request.privileged.iter().copied().collect(),
            required: request.required.clone(),
            spawn_priority: request.spawn_priority,
            payload: request.payload.clone(),
            sync_vars: object_type.instantiate_vars(),
        };
        if !registry.insert(object.clone())? {
            return Ok(SpawnOutcome::Duplicate(network_id));
        }
        if requester != SERVER_ID && request.request_id != 0 {
            self.requests.insert((requester, request.request_id), network_id);
        }
        Ok(SpawnOutcome::Created(object))
    }

    /// Drop dedup records of a connection that left
    pub fn forget_connection(&mut self, connection: ConnectionId) {
        self.requests.retain(|(requester, _), _| *requester != connection);
    }

    /// Drop dedup records pointing at a destroyed object
    pub fn forget_object(&mut self, network_id: NetworkId) {
        self.requests.retain(|_, id| *id != network_id);
    }
}

/// Holds confirmed objects whose requirements have not arrived yet and
/// releases them in dependency order.
#[derive(Debug, Default)]
pub struct SpawnQueue {
    parked: BTreeMap<NetworkId, NetworkObject>,
}

impl SpawnQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.parked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parked.is_empty()
    }

    /// Queue `object`; return everything now spawnable, requirements first.
    ///
    /// `is_spawned` reports ids already present locally.
    pub fn offer(
        &mut self,
        object: NetworkObject,
        is_spawned: impl Fn(NetworkId) -> bool,
    ) -> Result<Vec<NetworkObject>> {
        self.parked.insert(object.network_id, object);
        self.release(is_spawned)
    }

    /// Order a batch so every object follows the objects it requires.
    /// Requirements outside the batch are assumed present. Higher
    /// `spawn_priority` goes first among objects that are ready together.
    pub fn order(batch: Vec<NetworkObject>) -> Result<Vec<NetworkObject>> {
        let inside: HashSet<NetworkId> = batch.iter().map(|o| o.network_id).collect();
        let mut queue = SpawnQueue::new();
        queue
            .parked
            .extend(batch.into_iter().map(|o| (o.network_id, o)));
        let ordered = queue.release(|id| !inside.contains(&id))?;
        match queue.parked.keys().next() {
            Some(stuck) => Err(ProtocolError::CircularDependency(*stuck)),
            None => Ok(ordered),
        }
    }

    fn release(&mut self, is_spawned: impl Fn(NetworkId) -> bool) -> Result<Vec<NetworkObject>> {
        let mut released: Vec<NetworkObject> = Vec::new();
        let mut available: HashSet<NetworkId> = HashSet::new();
        loop {
            let ready: Vec<NetworkId> = self
                .parked
                .values()
                .filter(|o| {
                    o.required
                        .iter()
                        .all(|r| is_spawned(*r) || available.contains(r))
                })
                .map(|o| o.network_id)
                .collect();
            if ready.is_empty() {
                break;
            }
            let mut batch: Vec<NetworkObject> = ready
                .iter()
                .filter_map(|id| self.parked.remove(id))
                .collect();
            batch.sort_by(|a, b| {
                b.spawn_priority
                    .cmp(&a.spawn_priority)
                    .then(a.network_id.cmp(&b.network_id))
            });
            available.extend(batch.iter().map(|o| o.network_id));
            released.extend(batch);
        }

        if let Some(id) = Self::find_cycle(&self.parked) {
            warn!(network_id = id, "dropping objects caught in a dependency cycle");
            self.parked.clear();
            return Err(ProtocolError::CircularDependency(id));
        }
        Ok(released)
    }

    fn find_cycle(parked: &BTreeMap<NetworkId, NetworkObject>) -> Option<NetworkId> {
        for start in parked.keys() {
            let mut seen = HashSet::new();
            let mut current = *start;
            while let Some(object) = parked.get(&current) {
                if !seen.insert(current) {
                    return Some(current);
                }
                match object.required.iter().find(|r| parked.contains_key(r)) {
                    Some(next) => current = *next,
                    None => break,
                }
            }
        }
        None
    }
}
