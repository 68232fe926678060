//! Remote procedure calls on connections and network objects.

pub mod invoke;
pub mod method;
pub mod pending;

pub use invoke::{handle_call, CallEnv, RpcCall, RpcResult, RpcTarget};
pub use method::{
    CallContext, Method, MethodRegistry, MethodTarget, ParamType, RpcDirection, SecurityMode,
};
pub use pending::{PendingCall, PendingCalls, Resolution};
