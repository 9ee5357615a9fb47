//! Gateway introspection methods

use std::sync::{Arc, OnceLock};
use std::time::Instant;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Result;
use crate::gateway::dispatch::{Method, MethodInfo, RequestContext};
use crate::gateway::handshake::ConnectionRegistry;
use crate::gateway::protocol::{Role, PROTOCOL_VERSION};

/// Parameters of methods that take none
#[derive(Debug, Default, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct NoParams {}

/// `health`: liveness and basic counters
pub struct Health {
    pub(crate) connections: ConnectionRegistry,
    pub(crate) started: Instant,
}

#[async_trait]
impl Method for Health {
    type Params = NoParams;

    fn name(&self) -> &'static str {
        "health"
    }

    fn description(&self) -> &'static str {
        "Gateway liveness, version and connection count"
    }

    fn required_role(&self) -> Role {
        Role::Viewer
    }

    async fn call(&self, _ctx: &RequestContext, _params: NoParams) -> Result<Value> {
        Ok(json!({
            "ok": true,
            "version": crate::VERSION,
            "protocol": PROTOCOL_VERSION,
            "uptimeMs": self.started.elapsed().as_millis() as u64,
            "connections": self.connections.count().await,
        }))
    }
}

/// `gateway.methods`: published method catalog with parameter schemas
pub struct Methods {
    pub(crate) catalog: Arc<OnceLock<Vec<MethodInfo>>>,
}

#[async_trait]
impl Method for Methods {
    type Params = NoParams;

    fn name(&self) -> &'static str {
        "gateway.methods"
    }

    fn description(&self) -> &'static str {
        "List methods with their minimum role and parameter schema"
    }

    fn required_role(&self) -> Role {
        Role::Viewer
    }

    async fn call(&self, _ctx: &RequestContext, _params: NoParams) -> Result<Value> {
        let methods = self.catalog.get().map(Vec::as_slice).unwrap_or_default();
        Ok(json!({ "methods": methods }))
    }
}

/// `gateway.connections`: live connection metadata
pub struct Connections {
    pub(crate) connections: ConnectionRegistry,
}

#[async_trait]
impl Method for Connections {
    type Params = NoParams;

    fn name(&self) -> &'static str {
        "gateway.connections"
    }

    fn description(&self) -> &'static str {
        "List connected clients"
    }

    async fn call(&self, _ctx: &RequestContext, _params: NoParams) -> Result<Value> {
        Ok(json!({ "connections": self.connections.list().await }))
    }
}
