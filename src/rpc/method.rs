//! Network-invokable method registry.
//!
//! Methods are registered per target (the connection itself or an object
//! type) under a name, with a declared direction, security mode and parameter
//! shape. Several overloads may share a name as long as their shapes differ.

use crate::core::value::{SerializedData, TypeTag, Value};
use crate::error::{ProtocolError, Result};
use crate::protocol::session::Side;
use crate::rpc::invoke::RpcTarget;
use crate::{ConnectionId, NetworkId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Which way a call must travel to be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RpcDirection {
    /// Runs on clients; only the server may call it
    Client,
    /// Runs on the server; called by clients
    #[default]
    Server,
    Any,
}

impl RpcDirection {
    /// Whether a method with this direction may run on `local`
    pub fn runs_on(self, local: Side) -> bool {
        match self {
            RpcDirection::Any => true,
            RpcDirection::Client => local == Side::Client,
            RpcDirection::Server => local == Side::Server,
        }
    }
}

/// Authority requirement for object methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    /// Caller must own the object, be privileged, or the object is public
    #[default]
    Strict,
    /// Any connected caller
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Any,
    Tag(TypeTag),
    /// The tag, or a null value
    Nullable(TypeTag),
}

impl ParamType {
    pub fn accepts(self, value: &SerializedData) -> bool {
        match self {
            ParamType::Any => true,
            ParamType::Tag(tag) => !value.is_null() && value.tag() == tag,
            ParamType::Nullable(tag) => value.is_null() || value.tag() == tag,
        }
    }
}

/// What a method is attached to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MethodTarget {
    Connection,
    Object(String),
}

impl MethodTarget {
    pub fn object(type_name: impl Into<String>) -> Self {
        MethodTarget::Object(type_name.into())
    }
}

/// Information a handler gets about the call
#[derive(Debug, Clone)]
pub struct CallContext {
    pub caller: ConnectionId,
    pub target: RpcTarget,
    /// Network id of the target object, if any
    pub network_id: Option<NetworkId>,
}

pub type MethodHandler = Arc<dyn Fn(&CallContext, Vec<Value>) -> Result<Value> + Send + Sync>;

#[derive(Clone)]
pub struct Method {
    pub name: String,
    pub direction: RpcDirection,
    pub security: SecurityMode,
    pub params: Vec<ParamType>,
    /// Prepend the caller as a `ConnectionRef` argument
    pub with_connection: bool,
    pub handler: MethodHandler,
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("security", &self.security)
            .field("params", &self.params)
            .field("with_connection", &self.with_connection)
            .finish_non_exhaustive()
    }
}

impl Method {
    fn accepts(&self, args: &[SerializedData]) -> bool {
        self.params.len() == args.len()
            && self.params.iter().zip(args).all(|(p, a)| p.accepts(a))
    }
}

#[derive(Debug, Default)]
pub struct MethodRegistry {
    methods: HashMap<(MethodTarget, String), Vec<Method>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start describing a method; finish with [`MethodBuilder::handler`]
    pub fn method(&mut self, target: MethodTarget, name: impl Into<String>) -> MethodBuilder<'_> {
        MethodBuilder {
            registry: self,
            target,
            name: name.into(),
            direction: RpcDirection::default(),
            security: SecurityMode::default(),
            params: Vec::new(),
            with_connection: false,
        }
    }

    pub fn register(&mut self, target: MethodTarget, method: Method) -> Result<()> {
        let overloads = self
            .methods
            .entry((target.clone(), method.name.clone()))
            .or_default();
        if overloads.iter().any(|m| m.params == method.params) {
            return Err(ProtocolError::ConfigError(format!(
                "method {:?}::{} already has an overload with parameters {:?}",
                target, method.name, method.params
            )));
        }
        overloads.push(method);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.methods.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Find the overload `args` select, checking direction against `local`.
    pub fn resolve(
        &self,
        target: &MethodTarget,
        name: &str,
        local: Side,
        args: &[SerializedData],
    ) -> Result<&Method> {
        let overloads = self
            .methods
            .get(&(target.clone(), name.to_string()))
            .ok_or_else(|| ProtocolError::RpcFailed(format!("unknown method {name}")))?;

        let runnable: Vec<&Method> = overloads
            .iter()
            .filter(|m| m.direction.runs_on(local))
            .collect();
        if runnable.is_empty() {
            return Err(ProtocolError::PermissionDenied(format!(
                "method {name} cannot be invoked on the {local:?}"
            )));
        }

        runnable
            .into_iter()
            .find(|m| m.accepts(args))
            .ok_or_else(|| {
                let shape: Vec<&str> = args
                    .iter()
                    .map(|a| if a.is_null() { "null" } else { a.tag().name() })
                    .collect();
                ProtocolError::Deserialization(format!(
                    "no overload of {name} accepts ({})",
                    shape.join(", ")
                ))
            })
    }
}

pub struct MethodBuilder<'a> {
    registry: &'a mut MethodRegistry,
    target: MethodTarget,
    name: String,
    direction: RpcDirection,
    security: SecurityMode,
    params: Vec<ParamType>,
    with_connection: bool,
}

impl MethodBuilder<'_> {
    pub fn direction(mut self, direction: RpcDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn security(mut self, security: SecurityMode) -> Self {
        self.security = security;
        self
    }

    pub fn param(mut self, param: ParamType) -> Self {
        self.params.push(param);
        self
    }

    pub fn params(mut self, params: impl IntoIterator<Item = ParamType>) -> Self {
        self.params.extend(params);
        self
    }

    pub fn with_connection(mut self) -> Self {
        self.with_connection = true;
        self
    }

    pub fn handler<F>(self, handler: F) -> Result<()>
    where
        F: Fn(&CallContext, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        let method = Method {
            name: self.name,
            direction: self.direction,
            security: self.security,
            params: self.params,
            with_connection: self.with_connection,
            handler: Arc::new(handler),
        };
        self.registry.register(self.target, method)
    }
}
