//! Replicated field updates.

use crate::core::buffer::{ByteReader, ByteWriter};
use crate::core::serialization::{ReferenceResolver, ValueCodec};
use crate::core::value::{SerializedData, Value};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{read_named_values, write_named_values, WireMessage};
use crate::replication::registry::ObjectRegistry;
use crate::{ConnectionId, NetworkId};

/// One or more field values for a single object
#[derive(Debug, Clone, PartialEq)]
pub struct SyncVarUpdate {
    pub network_id: NetworkId,
    pub entries: Vec<(String, SerializedData)>,
}

impl SyncVarUpdate {
    pub fn single(network_id: NetworkId, name: impl Into<String>, value: SerializedData) -> Self {
        Self {
            network_id,
            entries: vec![(name.into(), value)],
        }
    }
}

impl WireMessage for SyncVarUpdate {
    fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        w.write_u32(self.network_id);
        write_named_values(w, &self.entries)
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            network_id: r.read_u32()?,
            entries: read_named_values(r)?,
        })
    }
}

/// A field whose value changed
#[derive(Debug, Clone, PartialEq)]
pub struct SyncVarChange {
    pub network_id: NetworkId,
    pub name: String,
    pub value: Value,
}

/// Validate and apply an update originated by `writer`.
///
/// With `check_authority` every entry is checked against the field's owner
/// before anything is written; one rejected entry rejects the whole update.
/// Returns the entries whose value actually changed.
pub fn apply_update(
    registry: &ObjectRegistry,
    codec: &ValueCodec,
    resolver: &dyn ReferenceResolver,
    writer: ConnectionId,
    update: &SyncVarUpdate,
    check_authority: bool,
) -> Result<Vec<SyncVarChange>> {
    let mut decoded = Vec::with_capacity(update.entries.len());
    for (name, data) in &update.entries {
        decoded.push((name.as_str(), codec.deserialize(data, resolver)?));
    }

    registry.update(update.network_id, |object| {
        for (name, _) in &decoded {
            if check_authority {
                object.may_write(name, writer)?;
            } else if !object.sync_vars.contains_key(*name) {
                return Err(ProtocolError::Deserialization(format!(
                    "object {} has no sync var '{name}'",
                    object.network_id
                )));
            }
        }
        let mut changes = Vec::new();
        for (name, value) in decoded {
            if let Some(var) = object.sync_vars.get_mut(name) {
                if var.value != value {
                    var.value = value.clone();
                    changes.push(SyncVarChange {
                        network_id: object.network_id,
                        name: name.to_string(),
                        value,
                    });
                }
            }
        }
        Ok(changes)
    })
}

/// Re-encode changed fields for relaying
pub fn changes_to_update(
    codec: &ValueCodec,
    network_id: NetworkId,
    changes: &[SyncVarChange],
) -> Result<SyncVarUpdate> {
    let entries = changes
        .iter()
        .map(|c| Ok((c.name.clone(), codec.serialize(&c.value)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok(SyncVarUpdate { network_id, entries })
}
