//! Method trait and registry

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::context::RequestContext;
use crate::error::{Error, Result};
use crate::gateway::protocol::Role;

/// An RPC method served by the gateway
///
/// `Params` is the method's schema: requests whose params do not
/// deserialize into it are rejected before [`call`](Method::call) runs.
#[async_trait]
pub trait Method: Send + Sync + 'static {
    /// Typed parameters
    type Params: DeserializeOwned + JsonSchema + Send + 'static;

    /// Method name, e.g. `sessions.list`
    fn name(&self) -> &'static str;

    /// One-line description
    fn description(&self) -> &'static str {
        ""
    }

    /// Lowest role allowed to call the method
    fn required_role(&self) -> Role {
        Role::Operator
    }

    /// Run the method
    async fn call(&self, ctx: &RequestContext, params: Self::Params) -> Result<Value>;
}

/// A validated call, ready to run
pub type PreparedCall = Box<dyn FnOnce(RequestContext) -> BoxFuture<'static, Result<Value>> + Send>;

/// Published description of a method
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodInfo {
    /// Method name
    pub name: String,
    /// Description
    pub description: String,
    /// Lowest role allowed
    pub role: Role,
    /// JSON schema of the params
    pub params: Value,
}

/// Object-safe view of a [`Method`]
trait ErasedMethod: Send + Sync {
    fn name(&self) -> &'static str;
    fn required_role(&self) -> Role;
    fn info(&self) -> MethodInfo;
    fn prepare(self: Arc<Self>, params: Value) -> Result<PreparedCall>;
}

struct Typed<M>(M);

impl<M: Method> ErasedMethod for Typed<M> {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn required_role(&self) -> Role {
        self.0.required_role()
    }

    fn info(&self) -> MethodInfo {
        let schema = schemars::schema_for!(M::Params);
        MethodInfo {
            name: self.0.name().to_string(),
            description: self.0.description().to_string(),
            role: self.0.required_role(),
            params: serde_json::to_value(schema).unwrap_or(Value::Null),
        }
    }

    fn prepare(self: Arc<Self>, params: Value) -> Result<PreparedCall> {
        let params = match params {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other,
        };
        let params: M::Params = serde_json::from_value(params)
            .map_err(|e| Error::InvalidInput(format!("invalid params for {}: {}", self.0.name(), e)))?;

        Ok(Box::new(move |ctx: RequestContext| -> BoxFuture<'static, Result<Value>> {
            Box::pin(async move { self.0.call(&ctx, params).await })
        }))
    }
}

/// Registered methods, keyed by name
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: BTreeMap<String, Arc<dyn ErasedMethod>>,
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

impl MethodRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method, replacing any method with the same name
    pub fn register<M: Method>(&mut self, method: M) {
        let name = method.name().to_string();
        if self.methods.insert(name.clone(), Arc::new(Typed(method))).is_some() {
            tracing::warn!(method = %name, "replaced existing method handler");
        }
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Lowest role allowed to call `name`
    pub fn required_role(&self, name: &str) -> Option<Role> {
        self.methods.get(name).map(|m| m.required_role())
    }

    /// Validate params and bind them to the method
    ///
    /// Fails with [`Error::NotFound`] for unknown methods and
    /// [`Error::InvalidInput`] for params that do not match the schema.
    pub fn prepare(&self, name: &str, params: Value) -> Result<PreparedCall> {
        let method = self
            .methods
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("unknown method: {}", name)))?;
        Arc::clone(method).prepare(params)
    }

    /// Descriptions of every method, sorted by name
    pub fn describe(&self) -> Vec<MethodInfo> {
        self.methods.values().map(|m| m.info()).collect()
    }

    /// Method names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.methods.values().map(|m| m.name()).collect()
    }

    /// Number of methods
    pub fn count(&self) -> usize {
        self.methods.len()
    }
}
