//! RPC dispatcher
//!
//! Routes authenticated requests to registered [`Method`]s. Each request is
//! resolved in a fixed order: method lookup (`NOT_FOUND`), role check
//! (`UNAUTHORIZED`), parameter validation (`INVALID_REQUEST`), then execution.
//! Requests carrying an idempotency key share one execution per
//! `method + key` within the retention window; the final result is replayed
//! to later duplicates. Failed executions are not retained.

pub mod context;
pub mod registry;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use moka::future::Cache;
use serde_json::Value;
use tracing::{debug, error};

pub use context::{cancel_pair, CancelHandle, CancelSignal, InFlight, InFlightGuard, Outbound, RequestContext};
pub use registry::{Method, MethodInfo, MethodRegistry, PreparedCall};

use crate::error::{Error, Result};
use crate::gateway::protocol::{ErrorShape, RequestFrame, ResponseFrame};

/// Executes requests against a [`MethodRegistry`]
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<MethodRegistry>,
    idempotency: Cache<String, Value>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("idempotency_entries", &self.idempotency.entry_count())
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher retaining idempotent results for `ttl`
    pub fn new(registry: MethodRegistry, ttl: Duration, capacity: u64) -> Self {
        let idempotency = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();

        Dispatcher {
            registry: Arc::new(registry),
            idempotency,
        }
    }

    /// Registered methods
    pub fn methods(&self) -> &MethodRegistry {
        &self.registry
    }

    /// Run one request to its final response
    ///
    /// Intermediate responses are sent by the method through `ctx` before
    /// this returns; the returned frame is always final.
    pub async fn dispatch(&self, ctx: RequestContext, frame: RequestFrame) -> ResponseFrame {
        let id = frame.id.clone();
        let method = frame.method.clone();

        match self.execute(ctx, frame).await {
            Ok(result) => ResponseFrame::success(id, result),
            Err(err) => ResponseFrame::error(id, shape_for(&method, &err)),
        }
    }

    async fn execute(&self, ctx: RequestContext, frame: RequestFrame) -> std::result::Result<Value, Arc<Error>> {
        let required = self
            .registry
            .required_role(&frame.method)
            .ok_or_else(|| Arc::new(Error::NotFound(format!("unknown method: {}", frame.method))))?;

        if !ctx.role.allows(required) {
            return Err(Arc::new(Error::Unauthorized(format!(
                "{} requires role {}",
                frame.method, required
            ))));
        }

        let key = frame
            .resolved_idempotency_key()
            .map(|key| format!("{}:{}", frame.method, key));
        let call = self.registry.prepare(&frame.method, frame.params).map_err(Arc::new)?;

        match key {
            Some(key) => {
                debug!(method = %frame.method, request_id = %ctx.request_id, "idempotent request");
                self.idempotency.try_get_with(key, run_guarded(call, ctx)).await
            }
            None => run_guarded(call, ctx).await.map_err(Arc::new),
        }
    }
}

/// Run a prepared call, converting a panic into an internal error
async fn run_guarded(call: PreparedCall, ctx: RequestContext) -> Result<Value> {
    match AssertUnwindSafe(call(ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(Error::Internal(format!("handler panicked: {}", message)))
        }
    }
}

fn shape_for(method: &str, err: &Error) -> ErrorShape {
    let shape = err.to_shape();
    if shape.code == crate::gateway::protocol::ErrorCode::Internal {
        error!(method = %method, error = %err, details = ?err, "request failed");
    } else {
        debug!(method = %method, error = %err, "request rejected");
    }
    shape
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::protocol::{ErrorCode, Role};
    use async_trait::async_trait;
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Deserialize, JsonSchema)]
    #[serde(rename_all = "camelCase", deny_unknown_fields)]
    struct BumpParams {
        #[serde(default)]
        by: Option<usize>,
        #[serde(default)]
        idempotency_key: Option<String>,
    }

    struct Bump {
        counter: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl Method for Bump {
        type Params = BumpParams;

        fn name(&self) -> &'static str {
            "test.bump"
        }

        async fn call(&self, _ctx: &RequestContext, params: BumpParams) -> Result<Value> {
            tokio::time::sleep(self.delay).await;
            let value = self.counter.fetch_add(params.by.unwrap_or(1), Ordering::SeqCst);
            Ok(serde_json::json!({ "before": value }))
        }
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct NoParams {}

    struct Stream;

    #[async_trait]
    impl Method for Stream {
        type Params = NoParams;

        fn name(&self) -> &'static str {
            "test.stream"
        }

        fn required_role(&self) -> Role {
            Role::Viewer
        }

        async fn call(&self, ctx: &RequestContext, _params: NoParams) -> Result<Value> {
            for n in 0..3 {
                ctx.emit(serde_json::json!({ "n": n })).await?;
            }
            Ok(serde_json::json!({ "done": true }))
        }
    }

    struct Fails;

    #[async_trait]
    impl Method for Fails {
        type Params = NoParams;

        fn name(&self) -> &'static str {
            "test.fails"
        }

        async fn call(&self, _ctx: &RequestContext, _params: NoParams) -> Result<Value> {
            Err(Error::Internal("disk exploded at /var/secret".into()))
        }
    }

    struct Panics;

    #[async_trait]
    impl Method for Panics {
        type Params = NoParams;

        fn name(&self) -> &'static str {
            "test.panics"
        }

        async fn call(&self, _ctx: &RequestContext, _params: NoParams) -> Result<Value> {
            panic!("boom");
        }
    }

    fn dispatcher(counter: Arc<AtomicUsize>, delay: Duration) -> Dispatcher {
        let mut registry = MethodRegistry::new();
        registry.register(Bump { counter, delay });
        registry.register(Stream);
        registry.register(Fails);
        registry.register(Panics);
        Dispatcher::new(registry, Duration::from_secs(60), 100)
    }

    fn ctx(role: Role) -> RequestContext {
        RequestContext::detached("r", role).0
    }

    #[tokio::test]
    async fn test_idempotent_requests_execute_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher(counter.clone(), Duration::ZERO);

        let frame = RequestFrame::new("1", "test.bump", Value::Null).with_idempotency_key("k1");
        let first = dispatcher.dispatch(ctx(Role::Operator), frame.clone()).await;
        let second = dispatcher
            .dispatch(ctx(Role::Operator), RequestFrame { id: "2".into(), ..frame })
            .await;

        assert!(first.ok);
        assert_eq!(first.result, second.result);
        assert_eq!(second.id, "2");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Different key runs again
        let third = dispatcher
            .dispatch(
                ctx(Role::Operator),
                RequestFrame::new("3", "test.bump", Value::Null).with_idempotency_key("k2"),
            )
            .await;
        assert!(third.ok);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_idempotency_key_in_params() {
        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher(counter.clone(), Duration::ZERO);
        let params = serde_json::json!({ "idempotencyKey": "p1" });

        for id in ["1", "2"] {
            let res = dispatcher
                .dispatch(ctx(Role::Operator), RequestFrame::new(id, "test.bump", params.clone()))
                .await;
            assert!(res.ok);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_coalesce() {
        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher(counter.clone(), Duration::from_millis(50));

        let a = dispatcher.dispatch(
            ctx(Role::Operator),
            RequestFrame::new("a", "test.bump", Value::Null).with_idempotency_key("same"),
        );
        let b = dispatcher.dispatch(
            ctx(Role::Operator),
            RequestFrame::new("b", "test.bump", Value::Null).with_idempotency_key("same"),
        );
        let (a, b) = tokio::join!(a, b);

        assert_eq!(a.result, b.result);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_params_have_no_side_effects() {
        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = dispatcher(counter.clone(), Duration::ZERO);

        let res = dispatcher
            .dispatch(
                ctx(Role::Operator),
                RequestFrame::new("1", "test.bump", serde_json::json!({ "by": "lots" })),
            )
            .await;
        assert!(!res.ok);
        assert_eq!(res.error.unwrap().code, ErrorCode::InvalidRequest);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_method_and_role_gate() {
        let dispatcher = dispatcher(Arc::new(AtomicUsize::new(0)), Duration::ZERO);

        let res = dispatcher
            .dispatch(ctx(Role::Operator), RequestFrame::new("1", "nope", Value::Null))
            .await;
        assert_eq!(res.error.unwrap().code, ErrorCode::NotFound);

        let res = dispatcher
            .dispatch(ctx(Role::Viewer), RequestFrame::new("2", "test.bump", Value::Null))
            .await;
        assert_eq!(res.error.unwrap().code, ErrorCode::Unauthorized);

        // Streaming methods need a live outbound queue
        let (viewer, _rx) = RequestContext::detached("3", Role::Viewer);
        let res = dispatcher
            .dispatch(viewer, RequestFrame::new("3", "test.stream", Value::Null))
            .await;
        assert!(res.ok, "{:?}", res.error);
    }

    #[tokio::test]
    async fn test_intermediate_frames_precede_final() {
        let dispatcher = dispatcher(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
        let (ctx, mut rx) = RequestContext::detached("s1", Role::Operator);

        let last = dispatcher
            .dispatch(ctx, RequestFrame::new("s1", "test.stream", Value::Null))
            .await;
        assert!(last.is_final);
        assert_eq!(last.result, Some(serde_json::json!({ "done": true })));

        let mut seen = Vec::new();
        while let Ok(Outbound::Response(frame)) = rx.try_recv() {
            assert!(!frame.is_final);
            seen.push(frame.result.unwrap()["n"].as_u64().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_internal_errors_are_generic() {
        let dispatcher = dispatcher(Arc::new(AtomicUsize::new(0)), Duration::ZERO);

        let res = dispatcher
            .dispatch(ctx(Role::Operator), RequestFrame::new("1", "test.fails", Value::Null))
            .await;
        let err = res.error.unwrap();
        assert_eq!(err.code, ErrorCode::Internal);
        assert!(!err.message.contains("/var/secret"));

        let res = dispatcher
            .dispatch(ctx(Role::Operator), RequestFrame::new("2", "test.panics", Value::Null))
            .await;
        assert_eq!(res.error.unwrap().code, ErrorCode::Internal);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let dispatcher = dispatcher(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
        let frame = RequestFrame::new("1", "test.fails", Value::Null).with_idempotency_key("f");

        dispatcher.dispatch(ctx(Role::Operator), frame.clone()).await;
        dispatcher.dispatch(ctx(Role::Operator), frame).await;
        dispatcher.idempotency.run_pending_tasks().await;
        assert_eq!(dispatcher.idempotency.entry_count(), 0);
    }
}
