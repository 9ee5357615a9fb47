//! Device repair auto-approval
//!
//! A previously paired device whose verification fails (rotated key, role
//! drift) is sent back through pairing with a repair request. When the
//! gateway runs on the same machine, the client may approve that request
//! itself and retry once:
//!
//! 1. call; success returns immediately
//! 2. errors other than "pairing required" propagate unchanged
//! 3. gateways not reached over loopback propagate unchanged
//! 4. list pending requests and pick a repair candidate for this device;
//!    none means [`GatewayRepairError`]
//! 5. approve it and retry exactly once, returning whatever the retry returns
//!
//! [`decide_repair`] and [`find_repair_candidate`] are pure; the executor
//! only sequences I/O around them.

use async_trait::async_trait;
use serde_json::Value;

use super::store::PairingStore;
use crate::error::Error;
use crate::gateway::client::{is_loopback_url, GatewayCallError};
use crate::gateway::protocol::{ApprovedDevice, DevicePairingList, ErrorCode, PairingRequest, Role, PAIRING_REQUIRED_REASON};

/// Oldest repair request that may be auto-approved
pub const REPAIR_MAX_AGE_MS: i64 = 120_000;

/// Something that can perform a gateway call
#[async_trait]
pub trait GatewayCaller: Send + Sync {
    /// Gateway URL the call goes to
    fn url(&self) -> &str;

    /// Perform the call once
    async fn call(&self, method: &str, params: Value) -> Result<Value, GatewayCallError>;
}

/// Local pairing administration
#[async_trait]
pub trait PairingAdmin: Send + Sync {
    /// Pending requests and paired devices
    async fn list_device_pairing(&self) -> crate::Result<DevicePairingList>;

    /// Approve a pending request; `None` when it no longer exists
    async fn approve_device_pairing(&self, request_id: &str) -> crate::Result<Option<ApprovedDevice>>;
}

#[async_trait]
impl PairingAdmin for PairingStore {
    async fn list_device_pairing(&self) -> crate::Result<DevicePairingList> {
        self.list().await
    }

    async fn approve_device_pairing(&self, request_id: &str) -> crate::Result<Option<ApprovedDevice>> {
        match self.approve(request_id, None).await {
            Ok(approved) => Ok(Some(approved)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Repair was warranted but could not be carried out
#[derive(Debug, thiserror::Error)]
#[error("device repair failed: {reason}")]
pub struct GatewayRepairError {
    /// Why no repair happened
    pub reason: String,
    /// The pairing failure that triggered the attempt
    #[source]
    pub original: GatewayCallError,
}

/// Failure of [`call_gateway_with_repair_approval`]
#[derive(Debug, thiserror::Error)]
pub enum RepairFlowError {
    /// The call's own error, unchanged (first attempt or the single retry)
    #[error(transparent)]
    Call(#[from] GatewayCallError),
    /// Repair was attempted and could not proceed
    #[error(transparent)]
    Repair(#[from] GatewayRepairError),
}

impl RepairFlowError {
    /// The underlying call error, when there is one
    pub fn call_error(&self) -> &GatewayCallError {
        match self {
            RepairFlowError::Call(e) => e,
            RepairFlowError::Repair(e) => &e.original,
        }
    }
}

/// Whether a call failed because the device needs (re)pairing
pub fn is_pairing_required_error(err: &GatewayCallError) -> bool {
    err.code == ErrorCode::PairingRequired || err.message.to_lowercase().contains(PAIRING_REQUIRED_REASON)
}

/// Outcome of [`decide_repair`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairDecision {
    /// Propagate the error unchanged
    Propagate,
    /// Look for a repair candidate
    AttemptRepair,
}

/// Decide whether a failed call may go through local repair
pub fn decide_repair(err: &GatewayCallError, gateway_url: &str) -> RepairDecision {
    if is_pairing_required_error(err) && is_loopback_url(gateway_url) {
        RepairDecision::AttemptRepair
    } else {
        RepairDecision::Propagate
    }
}

/// Pick the pending request this device may auto-approve
///
/// A candidate must belong to `device_id`, ask for the operator role, be a
/// repair of an earlier pairing and be at most [`REPAIR_MAX_AGE_MS`] old.
pub fn find_repair_candidate<'a>(
    pending: &'a [PairingRequest],
    device_id: &str,
    now_ms: i64,
) -> Option<&'a PairingRequest> {
    pending
        .iter()
        .filter(|r| {
            r.device_id == device_id
                && r.role == Role::Operator
                && r.is_repair
                && now_ms - r.ts <= REPAIR_MAX_AGE_MS
        })
        .max_by_key(|r| r.ts)
}

/// Call the gateway, auto-approving a local repair request at most once
pub async fn call_gateway_with_repair_approval<C, A>(
    caller: &C,
    admin: &A,
    device_id: &str,
    method: &str,
    params: Value,
) -> Result<Value, RepairFlowError>
where
    C: GatewayCaller + ?Sized,
    A: PairingAdmin + ?Sized,
{
    let original = match caller.call(method, params.clone()).await {
        Ok(result) => return Ok(result),
        Err(e) => e,
    };

    if decide_repair(&original, caller.url()) == RepairDecision::Propagate {
        return Err(original.into());
    }

    let pending = match admin.list_device_pairing().await {
        Ok(list) => list.pending,
        Err(e) => {
            return Err(GatewayRepairError {
                reason: format!("listing pending pairing requests failed: {}", e),
                original,
            }
            .into())
        }
    };

    let now_ms = chrono::Utc::now().timestamp_millis();
    let Some(candidate) = find_repair_candidate(&pending, device_id, now_ms) else {
        return Err(GatewayRepairError {
            reason: format!("no eligible repair request for device {}", device_id),
            original,
        }
        .into());
    };

    match admin.approve_device_pairing(&candidate.request_id).await {
        Ok(Some(approved)) => {
            tracing::info!(
                request_id = %approved.request_id,
                device_id = %device_id,
                "auto-approved device repair request"
            );
        }
        Ok(None) => {
            return Err(GatewayRepairError {
                reason: format!("repair request {} disappeared before approval", candidate.request_id),
                original,
            }
            .into())
        }
        Err(e) => {
            return Err(GatewayRepairError {
                reason: format!("approving repair request {} failed: {}", candidate.request_id, e),
                original,
            }
            .into())
        }
    }

    caller.call(method, params).await.map_err(RepairFlowError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const NOW: i64 = 1_700_000_000_000;

    fn request(device_id: &str, role: Role, is_repair: bool, age_ms: i64) -> PairingRequest {
        PairingRequest {
            request_id: format!("req-{}", device_id),
            device_id: device_id.to_string(),
            public_key: "test-key".to_string(),
            role,
            is_repair,
            ts: NOW - age_ms,
            client_id: None,
            platform: None,
            remote_ip: None,
        }
    }

    #[test]
    fn test_candidate_requires_every_condition() {
        let good = vec![request("dev-7", Role::Operator, true, 10_000)];
        assert!(find_repair_candidate(&good, "dev-7", NOW).is_some());

        // Boundary age is still eligible
        let edge = vec![request("dev-7", Role::Operator, true, 120_000)];
        assert!(find_repair_candidate(&edge, "dev-7", NOW).is_some());

        let wrong_device = vec![request("other-device", Role::Operator, true, 10_000)];
        assert!(find_repair_candidate(&wrong_device, "dev-7", NOW).is_none());

        let viewer = vec![request("dev-7", Role::Viewer, true, 10_000)];
        assert!(find_repair_candidate(&viewer, "dev-7", NOW).is_none());

        let initial = vec![request("dev-7", Role::Operator, false, 10_000)];
        assert!(find_repair_candidate(&initial, "dev-7", NOW).is_none());

        let old = vec![request("dev-7", Role::Operator, true, 200_000)];
        assert!(find_repair_candidate(&old, "dev-7", NOW).is_none());

        assert!(find_repair_candidate(&[], "dev-7", NOW).is_none());
    }

    #[test]
    fn test_candidate_prefers_newest() {
        let mut older = request("dev-7", Role::Operator, true, 50_000);
        older.request_id = "older".into();
        let mut newer = request("dev-7", Role::Operator, true, 5_000);
        newer.request_id = "newer".into();
        let pending = vec![older, newer];
        assert_eq!(find_repair_candidate(&pending, "dev-7", NOW).unwrap().request_id, "newer");
    }

    fn pairing_error() -> GatewayCallError {
        GatewayCallError::from_close(1008, "pairing required")
    }

    #[test]
    fn test_decision() {
        assert_eq!(decide_repair(&pairing_error(), "ws://127.0.0.1:18789"), RepairDecision::AttemptRepair);
        assert_eq!(decide_repair(&pairing_error(), "wss://remote.example.com/ws"), RepairDecision::Propagate);

        let plain = GatewayCallError::from_close(1008, "unauthorized: token mismatch");
        assert_eq!(decide_repair(&plain, "ws://127.0.0.1:18789"), RepairDecision::Propagate);

        let by_message = GatewayCallError::new(ErrorCode::Unauthorized, "Pairing Required: device dev-1");
        assert!(is_pairing_required_error(&by_message));
    }

    struct MockCaller {
        url: String,
        results: Mutex<VecDeque<Result<Value, GatewayCallError>>>,
        calls: AtomicUsize,
    }

    impl MockCaller {
        fn new(url: &str, results: Vec<Result<Value, GatewayCallError>>) -> Self {
            MockCaller {
                url: url.to_string(),
                results: Mutex::new(results.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GatewayCaller for MockCaller {
        fn url(&self) -> &str {
            &self.url
        }

        async fn call(&self, _method: &str, _params: Value) -> Result<Value, GatewayCallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(GatewayCallError::unavailable("no scripted result")))
        }
    }

    #[derive(Default)]
    struct MockAdmin {
        pending: Vec<PairingRequest>,
        lists: AtomicUsize,
        approvals: Mutex<Vec<String>>,
        approve_misses: bool,
    }

    impl MockAdmin {
        fn with_pending(pending: Vec<PairingRequest>) -> Self {
            MockAdmin {
                pending,
                ..MockAdmin::default()
            }
        }

        fn lists(&self) -> usize {
            self.lists.load(Ordering::SeqCst)
        }

        fn approvals(&self) -> Vec<String> {
            self.approvals.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PairingAdmin for MockAdmin {
        async fn list_device_pairing(&self) -> crate::Result<DevicePairingList> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            Ok(DevicePairingList {
                pending: self.pending.clone(),
                paired: Vec::new(),
            })
        }

        async fn approve_device_pairing(&self, request_id: &str) -> crate::Result<Option<ApprovedDevice>> {
            self.approvals.lock().unwrap().push(request_id.to_string());
            if self.approve_misses {
                return Ok(None);
            }
            let request = self.pending.iter().find(|r| r.request_id == request_id);
            Ok(request.map(|r| ApprovedDevice {
                request_id: r.request_id.clone(),
                device: crate::gateway::protocol::PairedDevice {
                    device_id: r.device_id.clone(),
                    public_key: r.public_key.clone(),
                    role: r.role,
                    approved_at: 0,
                    note: None,
                    client_id: None,
                    platform: None,
                },
            }))
        }
    }

    fn fresh_candidate(device_id: &str) -> PairingRequest {
        let mut r = request(device_id, Role::Operator, true, 0);
        r.ts = chrono::Utc::now().timestamp_millis() - 10_000;
        r
    }

    const LOCAL: &str = "ws://127.0.0.1:18789";

    #[tokio::test]
    async fn test_success_makes_one_call() {
        let caller = MockCaller::new(LOCAL, vec![Ok(serde_json::json!({"ok": true}))]);
        let admin = MockAdmin::default();

        let result = call_gateway_with_repair_approval(&caller, &admin, "dev-1", "health", Value::Null)
            .await
            .unwrap();
        assert_eq!(result["ok"], true);
        assert_eq!(caller.calls(), 1);
        assert_eq!(admin.lists(), 0);
    }

    #[tokio::test]
    async fn test_non_pairing_error_propagates_unchanged() {
        let original = GatewayCallError::new(ErrorCode::InvalidRequest, "bad params");
        let caller = MockCaller::new(LOCAL, vec![Err(original.clone())]);
        let admin = MockAdmin::default();

        let err = call_gateway_with_repair_approval(&caller, &admin, "dev-1", "x", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(&err, RepairFlowError::Call(e) if *e == original));
        assert_eq!(caller.calls(), 1);
        assert_eq!(admin.lists(), 0);
    }

    #[tokio::test]
    async fn test_remote_gateway_skips_listing() {
        let caller = MockCaller::new("wss://remote.example.com/ws", vec![Err(pairing_error())]);
        let admin = MockAdmin::with_pending(vec![fresh_candidate("dev-1")]);

        let err = call_gateway_with_repair_approval(&caller, &admin, "dev-1", "x", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(&err, RepairFlowError::Call(e) if *e == pairing_error()));
        assert_eq!(caller.calls(), 1);
        assert_eq!(admin.lists(), 0);
        assert!(admin.approvals().is_empty());
    }

    #[tokio::test]
    async fn test_no_candidate_is_repair_error() {
        let caller = MockCaller::new(LOCAL, vec![Err(pairing_error())]);
        let admin = MockAdmin::default();

        let err = call_gateway_with_repair_approval(&caller, &admin, "dev-1", "x", Value::Null)
            .await
            .unwrap_err();
        match &err {
            RepairFlowError::Repair(repair) => assert_eq!(repair.original, pairing_error()),
            other => panic!("expected repair error, got {:?}", other),
        }
        assert_eq!(err.call_error().code, ErrorCode::PairingRequired);
        assert_eq!(caller.calls(), 1);
        assert_eq!(admin.lists(), 1);
        assert!(admin.approvals().is_empty());
    }

    #[tokio::test]
    async fn test_candidate_is_approved_and_retried_once() {
        let caller = MockCaller::new(LOCAL, vec![Err(pairing_error()), Ok(serde_json::json!("second"))]);
        let admin = MockAdmin::with_pending(vec![fresh_candidate("dev-7")]);

        let result = call_gateway_with_repair_approval(&caller, &admin, "dev-7", "x", Value::Null)
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("second"));
        assert_eq!(caller.calls(), 2);
        assert_eq!(admin.lists(), 1);
        assert_eq!(admin.approvals(), vec!["req-dev-7".to_string()]);
    }

    #[tokio::test]
    async fn test_second_pairing_failure_propagates() {
        let caller = MockCaller::new(
            LOCAL,
            vec![Err(pairing_error()), Err(pairing_error()), Ok(Value::Null)],
        );
        let admin = MockAdmin::with_pending(vec![fresh_candidate("dev-7")]);

        let err = call_gateway_with_repair_approval(&caller, &admin, "dev-7", "x", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RepairFlowError::Call(_)));
        assert_eq!(caller.calls(), 2);
        assert_eq!(admin.lists(), 1);
        assert_eq!(admin.approvals().len(), 1);
    }

    #[tokio::test]
    async fn test_vanished_candidate_is_repair_error() {
        let caller = MockCaller::new(LOCAL, vec![Err(pairing_error()), Ok(Value::Null)]);
        let admin = MockAdmin {
            approve_misses: true,
            ..MockAdmin::with_pending(vec![fresh_candidate("dev-7")])
        };

        let err = call_gateway_with_repair_approval(&caller, &admin, "dev-7", "x", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RepairFlowError::Repair(_)));
        assert_eq!(caller.calls(), 1);
        assert_eq!(admin.approvals().len(), 1);
    }

    #[tokio::test]
    async fn test_pairing_store_as_admin() {
        let dir = tempfile::tempdir().unwrap();
        let store = PairingStore::new(dir.path());
        let (request, _) = store
            .request_pairing(super::super::store::NewPairingRequest {
                device_id: "dev-1".into(),
                public_key: "k".into(),
                role: Role::Operator,
                is_repair: true,
                client_id: None,
                platform: None,
                remote_ip: None,
            })
            .await
            .unwrap();

        let list = store.list_device_pairing().await.unwrap();
        assert!(find_repair_candidate(&list.pending, "dev-1", chrono::Utc::now().timestamp_millis()).is_some());

        assert!(store.approve_device_pairing(&request.request_id).await.unwrap().is_some());
        assert!(store.approve_device_pairing(&request.request_id).await.unwrap().is_none());
    }
}
