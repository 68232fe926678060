//! Network objects, their ownership and visibility, and registered object types.

use crate::core::value::Value;
use crate::error::{ProtocolError, Result};
use crate::{ConnectionId, NetworkId, SERVER_ID};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Who may author changes to an object or a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipMode {
    /// The owning client
    Client,
    #[default]
    Server,
    /// Anyone
    Public,
}

impl OwnershipMode {
    pub fn to_wire(self) -> u8 {
        match self {
            OwnershipMode::Client => 0,
            OwnershipMode::Server => 1,
            OwnershipMode::Public => 2,
        }
    }

    pub fn from_wire(code: u8) -> Result<Self> {
        match code {
            0 => Ok(OwnershipMode::Client),
            1 => Ok(OwnershipMode::Server),
            2 => Ok(OwnershipMode::Public),
            other => Err(ProtocolError::Deserialization(format!(
                "invalid ownership mode {other}"
            ))),
        }
    }
}

/// Which peers hold a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibilityMode {
    OwnerAndServer,
    #[default]
    Everyone,
}

impl VisibilityMode {
    pub fn to_wire(self) -> u8 {
        match self {
            VisibilityMode::OwnerAndServer => 0,
            VisibilityMode::Everyone => 1,
        }
    }

    pub fn from_wire(code: u8) -> Result<Self> {
        match code {
            0 => Ok(VisibilityMode::OwnerAndServer),
            1 => Ok(VisibilityMode::Everyone),
            other => Err(ProtocolError::Deserialization(format!(
                "invalid visibility mode {other}"
            ))),
        }
    }
}

/// A replicated field bound to its object
#[derive(Debug, Clone, PartialEq)]
pub struct SyncVar {
    pub name: String,
    pub sync_owner: OwnershipMode,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkObject {
    pub network_id: NetworkId,
    pub type_name: String,
    pub owner_id: ConnectionId,
    pub ownership: OwnershipMode,
    pub visibility: VisibilityMode,
    pub active: bool,
    pub privileged: BTreeSet<ConnectionId>,
    pub required: Vec<NetworkId>,
    pub spawn_priority: i32,
    /// Constructor payload, opaque to the core
    pub payload: Bytes,
    pub sync_vars: BTreeMap<String, SyncVar>,
}

impl NetworkObject {
    /// Whether `connection` holds a replica. The server always does.
    pub fn is_visible_to(&self, connection: ConnectionId) -> bool {
        connection == SERVER_ID
            || match self.visibility {
                VisibilityMode::Everyone => true,
                VisibilityMode::OwnerAndServer => connection == self.owner_id,
            }
    }

    /// Object-level authority used by strict RPCs, destroy and modify
    pub fn has_authority(&self, connection: ConnectionId) -> bool {
        connection == SERVER_ID
            || self.privileged.contains(&connection)
            || match self.ownership {
                OwnershipMode::Client => connection == self.owner_id,
                OwnershipMode::Server => false,
                OwnershipMode::Public => true,
            }
    }

    /// Whether `writer` may originate a change to the field `name`
    pub fn may_write(&self, name: &str, writer: ConnectionId) -> Result<()> {
        let var = self.sync_vars.get(name).ok_or_else(|| {
            ProtocolError::Deserialization(format!(
                "object {} ({}) has no sync var '{name}'",
                self.network_id, self.type_name
            ))
        })?;
        let allowed = writer == SERVER_ID
            || self.privileged.contains(&writer)
            || match var.sync_owner {
                OwnershipMode::Client => writer == self.owner_id,
                OwnershipMode::Server => false,
                OwnershipMode::Public => true,
            };
        if allowed {
            Ok(())
        } else {
            Err(ProtocolError::PermissionDenied(format!(
                "connection {writer} may not write '{name}' on object {}",
                self.network_id
            )))
        }
    }

    pub fn sync_var(&self, name: &str) -> Option<&Value> {
        self.sync_vars.get(name).map(|v| &v.value)
    }

    /// Hand the object to the fallback authority after its owner left
    pub fn apply_fallback(&mut self, fallback: OwnershipMode) {
        self.owner_id = SERVER_ID;
        self.ownership = fallback;
        for var in self.sync_vars.values_mut() {
            if var.sync_owner == OwnershipMode::Client {
                var.sync_owner = fallback;
            }
        }
    }
}

/// Declared field of an object type
#[derive(Debug, Clone, PartialEq)]
pub struct SyncVarDef {
    pub name: String,
    pub sync_owner: OwnershipMode,
    pub default: Value,
}

/// Spawn details a validator gets to inspect
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub requester: ConnectionId,
    pub type_name: &'a str,
    pub owner_id: ConnectionId,
    pub payload: &'a [u8],
}

pub type SpawnValidator = Arc<dyn Fn(&SpawnRequest<'_>) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct ObjectType {
    pub name: String,
    pub ownership: OwnershipMode,
    pub visibility: VisibilityMode,
    pub sync_vars: Vec<SyncVarDef>,
    pub validator: Option<SpawnValidator>,
}

impl fmt::Debug for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectType")
            .field("name", &self.name)
            .field("ownership", &self.ownership)
            .field("visibility", &self.visibility)
            .field("sync_vars", &self.sync_vars)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl ObjectType {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ownership: OwnershipMode::default(),
            visibility: VisibilityMode::default(),
            sync_vars: Vec::new(),
            validator: None,
        }
    }

    pub fn ownership(mut self, ownership: OwnershipMode) -> Self {
        self.ownership = ownership;
        self
    }

    pub fn visibility(mut self, visibility: VisibilityMode) -> Self {
        self.visibility = visibility;
        self
    }

    pub fn sync_var(
        mut self,
        name: impl Into<String>,
        sync_owner: OwnershipMode,
        default: Value,
    ) -> Self {
        self.sync_vars.push(SyncVarDef {
            name: name.into(),
            sync_owner,
            default,
        });
        self
    }

    pub fn validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&SpawnRequest<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Fresh sync var table populated with defaults
    pub fn instantiate_vars(&self) -> BTreeMap<String, SyncVar> {
        self.sync_vars
            .iter()
            .map(|def| {
                (
                    def.name.clone(),
                    SyncVar {
                        name: def.name.clone(),
                        sync_owner: def.sync_owner,
                        value: def.default.clone(),
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct ObjectTypeRegistry {
    types: HashMap<String, ObjectType>,
}

impl ObjectTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, object_type: ObjectType) -> Result<()> {
        if self.types.contains_key(&object_type.name) {
            return Err(ProtocolError::ConfigError(format!(
                "object type '{}' registered twice",
                object_type.name
            )));
        }
        let mut seen = BTreeSet::new();
        for var in &object_type.sync_vars {
            if !seen.insert(var.name.as_str()) {
                return Err(ProtocolError::ConfigError(format!(
                    "object type '{}' declares sync var '{}' twice",
                    object_type.name, var.name
                )));
            }
        }
        self.types.insert(object_type.name.clone(), object_type);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ObjectType> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn avatar(owner: ConnectionId) -> NetworkObject {
        let object_type = ObjectType::new("Avatar")
            .ownership(OwnershipMode::Client)
            .sync_var("hp", OwnershipMode::Server, Value::U32(100))
            .sync_var("name", OwnershipMode::Client, Value::String("anon".into()));
        NetworkObject {
            network_id: 7,
            type_name: "Avatar".into(),
            owner_id: owner,
            ownership: OwnershipMode::Client,
            visibility: VisibilityMode::OwnerAndServer,
            active: true,
            privileged: BTreeSet::from([9]),
            required: Vec::new(),
            spawn_priority: 0,
            payload: Bytes::new(),
            sync_vars: object_type.instantiate_vars(),
        }
    }

    #[test]
    fn test_write_authority() {
        let obj = avatar(3);
        assert!(obj.may_write("name", 3).is_ok());
        assert!(obj.may_write("name", SERVER_ID).is_ok());
        assert!(obj.may_write("name", 9).is_ok());
        assert!(matches!(obj.may_write("name", 4), Err(ProtocolError::PermissionDenied(_))));
        assert!(matches!(obj.may_write("hp", 3), Err(ProtocolError::PermissionDenied(_))));
        assert!(obj.may_write("missing", 3).is_err());
    }

    #[test]
    fn test_visibility() {
        let mut obj = avatar(3);
        assert!(obj.is_visible_to(3));
        assert!(obj.is_visible_to(SERVER_ID));
        assert!(!obj.is_visible_to(4));
        obj.visibility = VisibilityMode::Everyone;
        assert!(obj.is_visible_to(4));
    }

    #[test]
    fn test_fallback_moves_authority_to_server() {
        let mut obj = avatar(3);
        obj.apply_fallback(OwnershipMode::Server);
        assert_eq!(obj.owner_id, SERVER_ID);
        assert!(!obj.has_authority(3));
        assert!(obj.may_write("name", 3).is_err());
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let mut types = ObjectTypeRegistry::new();
        types.register(ObjectType::new("Door")).unwrap();
        assert!(types.register(ObjectType::new("Door")).is_err());
        assert!(types
            .register(
                ObjectType::new("Lamp")
                    .sync_var("on", OwnershipMode::Server, Value::Bool(false))
                    .sync_var("on", OwnershipMode::Server, Value::Bool(true))
            )
            .is_err());
    }

    #[test]
    fn test_wire_codes() {
        for mode in [OwnershipMode::Client, OwnershipMode::Server, OwnershipMode::Public] {
            assert_eq!(OwnershipMode::from_wire(mode.to_wire()).unwrap(), mode);
        }
        assert!(VisibilityMode::from_wire(7).is_err());
    }
}
