//! `device.pair.*` methods

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::error::Result;
use crate::gateway::dispatch::{Method, RequestContext};
use crate::gateway::pairing::PairingStore;
use crate::gateway::protocol::{ApprovePairingParams, PairListParams, RejectPairingParams, RemoveDeviceParams};

/// `device.pair.list`
pub struct ListPairing {
    pub(crate) store: Arc<PairingStore>,
}

#[async_trait]
impl Method for ListPairing {
    type Params = PairListParams;

    fn name(&self) -> &'static str {
        "device.pair.list"
    }

    fn description(&self) -> &'static str {
        "Pending pairing requests and paired devices"
    }

    async fn call(&self, _ctx: &RequestContext, _params: PairListParams) -> Result<Value> {
        Ok(serde_json::to_value(self.store.list().await?)?)
    }
}

/// `device.pair.approve`
pub struct ApprovePairing {
    pub(crate) store: Arc<PairingStore>,
}

#[async_trait]
impl Method for ApprovePairing {
    type Params = ApprovePairingParams;

    fn name(&self) -> &'static str {
        "device.pair.approve"
    }

    fn description(&self) -> &'static str {
        "Approve a pending pairing request"
    }

    async fn call(&self, ctx: &RequestContext, params: ApprovePairingParams) -> Result<Value> {
        let approved = self.store.approve(&params.request_id, params.note).await?;
        info!(
            conn_id = %ctx.conn_id,
            request_id = %approved.request_id,
            device_id = %approved.device.device_id,
            "device pairing approved"
        );
        Ok(serde_json::to_value(approved)?)
    }
}

/// `device.pair.reject`
pub struct RejectPairing {
    pub(crate) store: Arc<PairingStore>,
}

#[async_trait]
impl Method for RejectPairing {
    type Params = RejectPairingParams;

    fn name(&self) -> &'static str {
        "device.pair.reject"
    }

    fn description(&self) -> &'static str {
        "Reject a pending pairing request"
    }

    async fn call(&self, ctx: &RequestContext, params: RejectPairingParams) -> Result<Value> {
        let rejected = self.store.reject(&params.request_id).await?;
        info!(conn_id = %ctx.conn_id, request_id = %rejected.request_id, "device pairing rejected");
        Ok(serde_json::json!({ "requestId": rejected.request_id, "deviceId": rejected.device_id }))
    }
}

/// `device.pair.remove`
pub struct RemoveDevice {
    pub(crate) store: Arc<PairingStore>,
}

#[async_trait]
impl Method for RemoveDevice {
    type Params = RemoveDeviceParams;

    fn name(&self) -> &'static str {
        "device.pair.remove"
    }

    fn description(&self) -> &'static str {
        "Revoke a paired device"
    }

    async fn call(&self, ctx: &RequestContext, params: RemoveDeviceParams) -> Result<Value> {
        let removed = self.store.remove_paired(&params.device_id).await?;
        info!(conn_id = %ctx.conn_id, device_id = %removed.device_id, "paired device removed");
        Ok(serde_json::json!({ "deviceId": removed.device_id }))
    }
}

#[cfg(test)]
mod tests {
    use crate::gateway::methods::test_support::fixture;
    use crate::gateway::pairing::NewPairingRequest;
    use crate::gateway::protocol::{ErrorCode, Role};
    use serde_json::json;

    fn request(device_id: &str) -> NewPairingRequest {
        NewPairingRequest {
            device_id: device_id.into(),
            public_key: "pk".into(),
            role: Role::Operator,
            is_repair: false,
            client_id: None,
            platform: None,
            remote_ip: None,
        }
    }

    #[tokio::test]
    async fn test_list_approve_remove() {
        let fx = fixture();
        let (pending, _) = fx.deps.pairing.request_pairing(request("dev-1")).await.unwrap();

        let res = fx.call(Role::Operator, "device.pair.list", json!({})).await;
        let listed = res.result.unwrap();
        assert_eq!(listed["pending"].as_array().unwrap().len(), 1);

        let res = fx
            .call(
                Role::Operator,
                "device.pair.approve",
                json!({ "requestId": pending.request_id, "note": "laptop" }),
            )
            .await;
        assert!(res.ok, "{:?}", res.error);
        assert_eq!(res.result.unwrap()["device"]["deviceId"], "dev-1");

        let res = fx
            .call(Role::Operator, "device.pair.approve", json!({ "requestId": pending.request_id }))
            .await;
        assert_eq!(res.error.unwrap().code, ErrorCode::NotFound);

        let res = fx.call(Role::Operator, "device.pair.remove", json!({ "deviceId": "dev-1" })).await;
        assert!(res.ok);
    }

    #[tokio::test]
    async fn test_reject_and_role_gate() {
        let fx = fixture();
        let (pending, _) = fx.deps.pairing.request_pairing(request("dev-2")).await.unwrap();

        let res = fx.call(Role::Viewer, "device.pair.list", json!({})).await;
        assert_eq!(res.error.unwrap().code, ErrorCode::Unauthorized);

        let res = fx
            .call(Role::Operator, "device.pair.reject", json!({ "requestId": pending.request_id }))
            .await;
        assert!(res.ok);
        assert!(fx.deps.pairing.list().await.unwrap().pending.is_empty());
    }
}
