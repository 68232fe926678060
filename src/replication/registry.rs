//! Arena of live network objects keyed by network id.
//!
//! All other references to an object are its id; lookups return clones or
//! run a closure under the lock, so no caller ever holds a pointer into the
//! arena across a mutation.

use crate::core::serialization::ReferenceResolver;
use crate::error::{ProtocolError, Result};
use crate::replication::object::{NetworkObject, OwnershipMode};
use crate::utils::locks;
use crate::{ConnectionId, NetworkId};
use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: RwLock<BTreeMap<NetworkId, NetworkObject>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a confirmed object. Returns `false` if the id is taken.
    pub fn insert(&self, object: NetworkObject) -> Result<bool> {
        let mut objects = locks::write(&self.objects)?;
        if objects.contains_key(&object.network_id) {
            return Ok(false);
        }
        debug!(network_id = object.network_id, type_name = %object.type_name, "object registered");
        objects.insert(object.network_id, object);
        Ok(true)
    }

    pub fn get(&self, id: NetworkId) -> Result<Option<NetworkObject>> {
        Ok(locks::read(&self.objects)?.get(&id).cloned())
    }

    pub fn contains(&self, id: NetworkId) -> bool {
        locks::read(&self.objects)
            .map(|objects| objects.contains_key(&id))
            .unwrap_or(false)
    }

    /// Clone of an object that exists and is active
    pub fn get_active(&self, id: NetworkId) -> Result<NetworkObject> {
        let objects = locks::read(&self.objects)?;
        let object = objects
            .get(&id)
            .ok_or(ProtocolError::UnresolvedReference { kind: "object", id })?;
        if !object.active {
            return Err(ProtocolError::ObjectInactive(id));
        }
        Ok(object.clone())
    }

    /// Run `f` on an active object under the write lock
    pub fn update<T>(
        &self,
        id: NetworkId,
        f: impl FnOnce(&mut NetworkObject) -> Result<T>,
    ) -> Result<T> {
        let mut objects = locks::write(&self.objects)?;
        let object = objects
            .get_mut(&id)
            .ok_or(ProtocolError::UnresolvedReference { kind: "object", id })?;
        if !object.active {
            return Err(ProtocolError::ObjectInactive(id));
        }
        f(object)
    }

    /// First step of a destroy: later lookups fail with `ObjectInactive`
    pub fn mark_inactive(&self, id: NetworkId) -> Result<bool> {
        let mut objects = locks::write(&self.objects)?;
        Ok(match objects.get_mut(&id) {
            Some(object) => {
                object.active = false;
                true
            }
            None => false,
        })
    }

    pub fn remove(&self, id: NetworkId) -> Result<Option<NetworkObject>> {
        let removed = locks::write(&self.objects)?.remove(&id);
        if removed.is_some() {
            debug!(network_id = id, "object removed");
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        locks::read(&self.objects).map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Result<Vec<NetworkId>> {
        Ok(locks::read(&self.objects)?.keys().copied().collect())
    }

    /// Active objects that list `id` as a requirement
    pub fn dependents_of(&self, id: NetworkId) -> Result<Vec<NetworkId>> {
        Ok(locks::read(&self.objects)?
            .values()
            .filter(|o| o.active && o.required.contains(&id))
            .map(|o| o.network_id)
            .collect())
    }

    /// Every active object `connection` should hold, in id order
    pub fn visible_to(&self, connection: ConnectionId) -> Result<Vec<NetworkObject>> {
        let objects = locks::read(&self.objects)?;
        Ok(objects
            .values()
            .filter(|o| o.active && o.is_visible_to(connection))
            .cloned()
            .collect())
    }

    /// Move every object owned by `connection` to `fallback` and drop it
    /// from every privilege list; returns the updated objects
    pub fn apply_owner_fallback(
        &self,
        connection: ConnectionId,
        fallback: OwnershipMode,
    ) -> Result<Vec<NetworkObject>> {
        let mut objects = locks::write(&self.objects)?;
        let mut changed = Vec::new();
        for object in objects.values_mut() {
            let mut touched = object.privileged.remove(&connection);
            if object.owner_id == connection && object.ownership == OwnershipMode::Client {
                object.apply_fallback(fallback);
                touched = true;
            } else if object.owner_id == connection {
                object.owner_id = crate::SERVER_ID;
                touched = true;
            }
            if touched {
                changed.push(object.clone());
            }
        }
        Ok(changed)
    }

    /// Check that every id in `required` is spawned and active, and that
    /// following requirements from them never leads back to `subject` or
    /// around a loop.
    pub fn check_dependencies(&self, subject: Option<NetworkId>, required: &[NetworkId]) -> Result<()> {
        let objects = locks::read(&self.objects)?;
        for id in required {
            match objects.get(id) {
                None => return Err(ProtocolError::UnresolvedReference { kind: "object", id: *id }),
                Some(o) if !o.active => return Err(ProtocolError::ObjectInactive(*id)),
                Some(_) => {}
            }
        }

        // Iterative DFS; `on_path` holds the current chain
        let mut done: HashSet<NetworkId> = HashSet::new();
        for root in required {
            let mut on_path: HashSet<NetworkId> = HashSet::new();
            let mut stack: Vec<(NetworkId, usize)> = vec![(*root, 0)];
            while let Some((id, next_child)) = stack.pop() {
                if next_child == 0 {
                    if Some(id) == subject || on_path.contains(&id) {
                        return Err(ProtocolError::CircularDependency(id));
                    }
                    if done.contains(&id) {
                        continue;
                    }
                    on_path.insert(id);
                }
                let children = objects.get(&id).map(|o| o.required.as_slice()).unwrap_or(&[]);
                if let Some(child) = children.get(next_child) {
                    stack.push((id, next_child + 1));
                    stack.push((*child, 0));
                } else {
                    on_path.remove(&id);
                    done.insert(id);
                }
            }
        }
        Ok(())
    }
}

impl ReferenceResolver for ObjectRegistry {
    fn has_object(&self, id: NetworkId) -> bool {
        self.contains(id)
    }

    fn has_connection(&self, _id: ConnectionId) -> bool {
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::replication::object::VisibilityMode;
    use bytes::Bytes;
    use std::collections::BTreeSet;

    fn object(id: NetworkId, owner: ConnectionId, required: Vec<NetworkId>) -> NetworkObject {
        NetworkObject {
            network_id: id,
            type_name: "Thing".into(),
            owner_id: owner,
            ownership: OwnershipMode::Client,
            visibility: VisibilityMode::Everyone,
            active: true,
            privileged: BTreeSet::new(),
            required,
            spawn_priority: 0,
            payload: Bytes::new(),
            sync_vars: Default::default(),
        }
    }

    #[test]
    fn test_insert_is_unique() {
        let registry = ObjectRegistry::new();
        assert!(registry.insert(object(1, 2, vec![])).unwrap());
        assert!(!registry.insert(object(1, 3, vec![])).unwrap());
        assert_eq!(registry.get(1).unwrap().unwrap().owner_id, 2);
    }

    #[test]
    fn test_inactive_fails_fast() {
        let registry = ObjectRegistry::new();
        registry.insert(object(1, 2, vec![])).unwrap();
        registry.mark_inactive(1).unwrap();
        assert!(matches!(registry.get_active(1), Err(ProtocolError::ObjectInactive(1))));
        assert!(matches!(
            registry.update(1, |_| Ok(())),
            Err(ProtocolError::ObjectInactive(1))
        ));
        assert!(matches!(
            registry.get_active(9),
            Err(ProtocolError::UnresolvedReference { id: 9, .. })
        ));
    }

    #[test]
    fn test_dependencies_must_exist() {
        let registry = ObjectRegistry::new();
        registry.insert(object(1, 2, vec![])).unwrap();
        assert!(registry.check_dependencies(None, &[1]).is_ok());
        assert!(registry.check_dependencies(None, &[1, 5]).is_err());
    }

    #[test]
    fn test_cycle_detected() {
        let registry = ObjectRegistry::new();
        registry.insert(object(1, 2, vec![2])).unwrap();
        registry.insert(object(2, 2, vec![1])).unwrap();
        assert!(matches!(
            registry.check_dependencies(None, &[1]),
            Err(ProtocolError::CircularDependency(_))
        ));
    }

    #[test]
    fn test_self_reference_detected() {
        let registry = ObjectRegistry::new();
        registry.insert(object(1, 2, vec![])).unwrap();
        registry.insert(object(2, 2, vec![1])).unwrap();
        assert!(matches!(
            registry.check_dependencies(Some(1), &[2]),
            Err(ProtocolError::CircularDependency(1))
        ));
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let registry = ObjectRegistry::new();
        registry.insert(object(1, 2, vec![])).unwrap();
        registry.insert(object(2, 2, vec![1])).unwrap();
        registry.insert(object(3, 2, vec![1])).unwrap();
        assert!(registry.check_dependencies(None, &[2, 3]).is_ok());
    }

    #[test]
    fn test_owner_fallback() {
        let registry = ObjectRegistry::new();
        registry.insert(object(1, 4, vec![])).unwrap();
        registry.insert(object(2, 5, vec![])).unwrap();
        let changed = registry.apply_owner_fallback(4, OwnershipMode::Server).unwrap();
        assert_eq!(changed.len(), 1);
        let obj = registry.get(1).unwrap().unwrap();
        assert_eq!(obj.owner_id, crate::SERVER_ID);
        assert_eq!(obj.ownership, OwnershipMode::Server);
        assert_eq!(registry.get(2).unwrap().unwrap().owner_id, 5);
    }

    #[test]
    fn test_departed_privilege_reported() {
        let registry = ObjectRegistry::new();
        let mut shared = object(1, 5, vec![]);
        shared.privileged.insert(4);
        registry.insert(shared).unwrap();
        registry.insert(object(2, 5, vec![])).unwrap();

        let changed = registry.apply_owner_fallback(4, OwnershipMode::Server).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].network_id, 1);
        assert!(changed[0].privileged.is_empty());
        assert_eq!(changed[0].owner_id, 5);
        assert_eq!(changed[0].ownership, OwnershipMode::Client);
    }
}
