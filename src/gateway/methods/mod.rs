//! Built-in gateway methods
//!
//! - `health`, `gateway.methods`, `gateway.connections`: introspection
//! - `device.pair.*`: operator approval of pending devices
//! - `sessions.*`: session transcripts and archives

mod devices;
mod sessions;
mod system;

use std::sync::{Arc, OnceLock};
use std::time::Instant;

pub use devices::{ApprovePairing, ListPairing, RejectPairing, RemoveDevice};
pub use sessions::{
    AppendSession, DeleteSession, ListArchives, ListSessions, ResetSession, SessionHistory,
    DEFAULT_HISTORY_BATCH, MAX_HISTORY_BATCH,
};
pub use system::{Connections, Health, Methods};

use super::dispatch::{MethodInfo, MethodRegistry};
use super::handshake::ConnectionRegistry;
use super::pairing::PairingStore;
use crate::sessions::SessionStore;

/// Shared state the built-in methods operate on
#[derive(Debug, Clone)]
pub struct MethodDeps {
    /// Device pairing tables
    pub pairing: Arc<PairingStore>,
    /// Session transcripts
    pub sessions: Arc<SessionStore>,
    /// Live connections
    pub connections: ConnectionRegistry,
    /// Process start, for uptime
    pub started: Instant,
}

/// Registry with every built-in method
pub fn builtin_registry(deps: &MethodDeps) -> MethodRegistry {
    let catalog: Arc<OnceLock<Vec<MethodInfo>>> = Arc::new(OnceLock::new());
    let mut registry = MethodRegistry::new();

    registry.register(Health {
        connections: deps.connections.clone(),
        started: deps.started,
    });
    registry.register(Methods {
        catalog: catalog.clone(),
    });
    registry.register(Connections {
        connections: deps.connections.clone(),
    });

    registry.register(ListPairing {
        store: deps.pairing.clone(),
    });
    registry.register(ApprovePairing {
        store: deps.pairing.clone(),
    });
    registry.register(RejectPairing {
        store: deps.pairing.clone(),
    });
    registry.register(RemoveDevice {
        store: deps.pairing.clone(),
    });

    registry.register(ListSessions {
        store: deps.sessions.clone(),
    });
    registry.register(SessionHistory {
        store: deps.sessions.clone(),
    });
    registry.register(AppendSession {
        store: deps.sessions.clone(),
    });
    registry.register(ResetSession {
        store: deps.sessions.clone(),
    });
    registry.register(DeleteSession {
        store: deps.sessions.clone(),
    });
    registry.register(ListArchives {
        store: deps.sessions.clone(),
    });

    let _ = catalog.set(registry.describe());
    registry
}


#[cfg(test)]
mod tests {
    use super::test_support::fixture;
    use crate::gateway::protocol::Role;
    use serde_json::json;

    #[tokio::test]
    async fn test_gateway_methods_lists_everything() {
        let fx = fixture();
        let res = fx.call(Role::Viewer, "gateway.methods", json!({})).await;
        assert!(res.ok, "{:?}", res.error);

        let methods = res.result.unwrap()["methods"].as_array().unwrap().clone();
        let names: Vec<&str> = methods.iter().map(|m| m["name"].as_str().unwrap()).collect();
        for expected in [
            "health",
            "gateway.methods",
            "device.pair.list",
            "device.pair.approve",
            "sessions.archives",
            "sessions.history",
        ] {
            assert!(names.contains(&expected), "missing {}", expected);
        }
        assert_eq!(names.len(), fx.dispatcher.methods().count());
    }

    #[tokio::test]
    async fn test_health() {
        let fx = fixture();
        let res = fx.call(Role::Viewer, "health", serde_json::Value::Null).await;
        let result = res.result.unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(result["connections"], 0);
    }
}
