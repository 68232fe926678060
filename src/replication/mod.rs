//! Object replication: the object arena, spawn/destroy/modify management and
//! synchronized fields.

pub mod object;
pub mod registry;
pub mod spawn;
pub mod syncvar;

pub use object::{
    NetworkObject, ObjectType, ObjectTypeRegistry, OwnershipMode, SpawnRequest, SyncVar,
    VisibilityMode,
};
pub use registry::ObjectRegistry;
pub use spawn::{
    ObjectAction, ObjectChange, ObjectManagement, SpawnAuthority, SpawnOptions, SpawnOutcome,
    SpawnQueue,
};
pub use syncvar::{SyncVarChange, SyncVarUpdate};
