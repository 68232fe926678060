//! Call and result messages and server/client-side call execution.

use crate::core::buffer::{ByteReader, ByteWriter};
use crate::core::serialization::{ReferenceResolver, ValueCodec};
use crate::core::value::{SerializedData, Value};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::{read_values, write_values, WireMessage};
use crate::protocol::session::Side;
use crate::replication::registry::ObjectRegistry;
use crate::rpc::method::{CallContext, MethodRegistry, MethodTarget, SecurityMode};
use crate::{ConnectionId, NetworkId};
use tracing::{debug, trace};

/// Receiver of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcTarget {
    /// The peer connection itself
    Connection,
    Object(NetworkId),
}

impl RpcTarget {
    fn write(&self, w: &mut ByteWriter) {
        match self {
            RpcTarget::Connection => {
                w.write_u8(0);
                w.write_u32(0);
            }
            RpcTarget::Object(id) => {
                w.write_u8(1);
                w.write_u32(*id);
            }
        }
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let kind = r.read_u8()?;
        let id = r.read_u32()?;
        match kind {
            0 => Ok(RpcTarget::Connection),
            1 => Ok(RpcTarget::Object(id)),
            other => Err(ProtocolError::Deserialization(format!(
                "unknown rpc target type {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    pub target: RpcTarget,
    pub method: String,
    /// 0 when no result is expected
    pub callback_id: u32,
    pub ignore_result: bool,
    pub args: Vec<SerializedData>,
}

impl WireMessage for RpcCall {
    fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        self.target.write(w);
        w.write_string(&self.method)?;
        w.write_u32(self.callback_id);
        w.write_bool(self.ignore_result);
        write_values(w, &self.args)
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            target: RpcTarget::read(r)?,
            method: r.read_string()?,
            callback_id: r.read_u32()?,
            ignore_result: r.read_bool()?,
            args: read_values(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RpcResult {
    pub callback_id: u32,
    pub success: bool,
    pub error: String,
    pub value: SerializedData,
}

impl RpcResult {
    pub fn ok(callback_id: u32, value: SerializedData) -> Self {
        Self {
            callback_id,
            success: true,
            error: String::new(),
            value,
        }
    }

    pub fn failed(callback_id: u32, error: impl Into<String>) -> Self {
        Self {
            callback_id,
            success: false,
            error: error.into(),
            value: SerializedData::null(),
        }
    }

    /// Caller-side view of the outcome
    pub fn into_outcome(
        self,
        codec: &ValueCodec,
        resolver: &dyn ReferenceResolver,
    ) -> Result<Value> {
        if self.success {
            codec.deserialize(&self.value, resolver)
        } else {
            Err(ProtocolError::RpcFailed(self.error))
        }
    }
}

impl WireMessage for RpcResult {
    fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        w.write_u32(self.callback_id);
        w.write_bool(self.success);
        w.write_string(&self.error)?;
        self.value.write_to(w)
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            callback_id: r.read_u32()?,
            success: r.read_bool()?,
            error: r.read_string()?,
            value: SerializedData::read_from(r)?,
        })
    }
}

/// Everything needed to execute incoming calls
pub struct CallEnv<'a> {
    pub methods: &'a MethodRegistry,
    pub objects: &'a ObjectRegistry,
    pub codec: &'a ValueCodec,
    pub resolver: &'a dyn ReferenceResolver,
    pub local: Side,
}

/// Execute `call` from `caller`. Returns the reply to send, if any.
pub fn handle_call(env: &CallEnv<'_>, caller: ConnectionId, call: &RpcCall) -> Option<RpcResult> {
    let outcome = execute(env, caller, call);
    if let Err(e) = &outcome {
        debug!(caller, method = %call.method, error = %e, "rpc failed");
    }
    if call.ignore_result || call.callback_id == 0 {
        return None;
    }
    Some(match outcome {
        Ok(value) => RpcResult::ok(call.callback_id, value),
        Err(e) => RpcResult::failed(call.callback_id, e.to_string()),
    })
}

fn execute(env: &CallEnv<'_>, caller: ConnectionId, call: &RpcCall) -> Result<SerializedData> {
    let (method_target, object) = match call.target {
        RpcTarget::Connection => (MethodTarget::Connection, None),
        RpcTarget::Object(id) => {
            let object = env.objects.get_active(id)?;
            (MethodTarget::Object(object.type_name.clone()), Some(object))
        }
    };

    let method = env
        .methods
        .resolve(&method_target, &call.method, env.local, &call.args)?;

    // Calls arriving at a client come from the server, which is always trusted
    if let (Some(object), Side::Server) = (&object, env.local) {
        if method.security == SecurityMode::Strict && !object.has_authority(caller) {
            return Err(ProtocolError::PermissionDenied(format!(
                "connection {caller} lacks authority over object {}",
                object.network_id
            )));
        }
    }

    let mut args = Vec::with_capacity(call.args.len() + 1);
    if method.with_connection {
        args.push(Value::ConnectionRef(caller));
    }
    for arg in &call.args {
        args.push(env.codec.deserialize(arg, env.resolver)?);
    }

    let context = CallContext {
        caller,
        target: call.target,
        network_id: object.as_ref().map(|o| o.network_id),
    };
    trace!(caller, method = %call.method, "invoking");
    let value = (method.handler)(&context, args)?;
    env.codec.serialize(&value)
}
