//! `sessions.*` methods

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::gateway::dispatch::{Method, RequestContext};
use crate::gateway::protocol::{
    ArchivesListParams, Role, SessionAppendParams, SessionHistoryParams, SessionKeyParams, SessionsListParams,
};
use crate::sessions::SessionStore;

/// Messages per `sessions.history` batch when unspecified
pub const DEFAULT_HISTORY_BATCH: usize = 100;
/// Largest `sessions.history` batch
pub const MAX_HISTORY_BATCH: usize = 1000;

/// `sessions.list`
pub struct ListSessions {
    pub(crate) store: Arc<SessionStore>,
}

#[async_trait]
impl Method for ListSessions {
    type Params = SessionsListParams;

    fn name(&self) -> &'static str {
        "sessions.list"
    }

    fn description(&self) -> &'static str {
        "Active sessions, most recently updated first"
    }

    fn required_role(&self) -> Role {
        Role::Viewer
    }

    async fn call(&self, _ctx: &RequestContext, params: SessionsListParams) -> Result<Value> {
        let agent = self.store.agent_or_default(params.agent_id.as_deref());
        let sessions = self
            .store
            .list_sessions(agent, params.limit.map(|l| l as usize))
            .await?;
        Ok(json!({ "agentId": agent, "sessions": sessions }))
    }
}

/// `sessions.history`: streams the transcript in batches
///
/// Each batch is an intermediate response; the final response carries the
/// total message count.
pub struct SessionHistory {
    pub(crate) store: Arc<SessionStore>,
}

#[async_trait]
impl Method for SessionHistory {
    type Params = SessionHistoryParams;

    fn name(&self) -> &'static str {
        "sessions.history"
    }

    fn description(&self) -> &'static str {
        "Stream a session transcript in batches"
    }

    fn required_role(&self) -> Role {
        Role::Viewer
    }

    async fn call(&self, ctx: &RequestContext, params: SessionHistoryParams) -> Result<Value> {
        let agent = self.store.agent_or_default(params.agent_id.as_deref());
        let batch_size = params
            .batch_size
            .map(|b| (b as usize).clamp(1, MAX_HISTORY_BATCH))
            .unwrap_or(DEFAULT_HISTORY_BATCH);

        let messages = self.store.read_messages(agent, &params.key).await?;
        let total = messages.len();

        for (index, batch) in messages.chunks(batch_size).enumerate() {
            if ctx.is_cancelled() {
                return Err(Error::Unavailable("request cancelled".into()));
            }
            ctx.emit(json!({
                "key": params.key,
                "offset": index * batch_size,
                "messages": batch,
            }))
            .await?;
        }

        Ok(json!({ "key": params.key, "agentId": agent, "total": total }))
    }
}

/// `sessions.append`
pub struct AppendSession {
    pub(crate) store: Arc<SessionStore>,
}

#[async_trait]
impl Method for AppendSession {
    type Params = SessionAppendParams;

    fn name(&self) -> &'static str {
        "sessions.append"
    }

    fn description(&self) -> &'static str {
        "Append a message to a session transcript"
    }

    async fn call(&self, _ctx: &RequestContext, params: SessionAppendParams) -> Result<Value> {
        if !params.message.is_object() {
            return Err(Error::InvalidInput("message must be an object".into()));
        }
        let agent = self.store.agent_or_default(params.agent_id.as_deref());
        let entry = self.store.append_message(agent, &params.key, params.message).await?;
        Ok(json!({
            "key": params.key,
            "sessionId": entry.session_id,
            "updatedAt": entry.updated_at,
        }))
    }
}

/// `sessions.reset`
pub struct ResetSession {
    pub(crate) store: Arc<SessionStore>,
}

#[async_trait]
impl Method for ResetSession {
    type Params = SessionKeyParams;

    fn name(&self) -> &'static str {
        "sessions.reset"
    }

    fn description(&self) -> &'static str {
        "Archive the active transcript and start a new one"
    }

    async fn call(&self, _ctx: &RequestContext, params: SessionKeyParams) -> Result<Value> {
        let agent = self.store.agent_or_default(params.agent_id.as_deref());
        let reset = self.store.reset_session(agent, &params.key).await?;
        Ok(json!({
            "key": params.key,
            "sessionId": reset.entry.session_id,
            "archived": reset.archived,
        }))
    }
}

/// `sessions.delete`
pub struct DeleteSession {
    pub(crate) store: Arc<SessionStore>,
}

#[async_trait]
impl Method for DeleteSession {
    type Params = SessionKeyParams;

    fn name(&self) -> &'static str {
        "sessions.delete"
    }

    fn description(&self) -> &'static str {
        "Remove a session and archive its transcript"
    }

    async fn call(&self, _ctx: &RequestContext, params: SessionKeyParams) -> Result<Value> {
        let agent = self.store.agent_or_default(params.agent_id.as_deref());
        let archived = self.store.delete_session(agent, &params.key).await?;
        Ok(json!({ "key": params.key, "archived": archived }))
    }
}

/// `sessions.archives`
pub struct ListArchives {
    pub(crate) store: Arc<SessionStore>,
}

#[async_trait]
impl Method for ListArchives {
    type Params = ArchivesListParams;

    fn name(&self) -> &'static str {
        "sessions.archives"
    }

    fn description(&self) -> &'static str {
        "Archived transcripts, newest first"
    }

    fn required_role(&self) -> Role {
        Role::Viewer
    }

    async fn call(&self, _ctx: &RequestContext, params: ArchivesListParams) -> Result<Value> {
        let agent = self.store.agent_or_default(params.agent_id.as_deref());
        Ok(serde_json::to_value(self.store.list_archives(agent, params.limit).await?)?)
    }
}

#[cfg(test)]
mod tests {
    use crate::gateway::dispatch::{Outbound, RequestContext};
    use crate::gateway::methods::test_support::fixture;
    use crate::gateway::protocol::{ErrorCode, RequestFrame, Role};
    use serde_json::json;

    #[tokio::test]
    async fn test_append_history_streams_batches() {
        let fx = fixture();
        for n in 0..5 {
            let res = fx
                .call(Role::Operator, "sessions.append", json!({ "key": "k", "message": { "n": n } }))
                .await;
            assert!(res.ok, "{:?}", res.error);
        }

        let (ctx, mut rx) = RequestContext::detached("h", Role::Viewer);
        let last = fx
            .dispatcher
            .dispatch(
                ctx,
                RequestFrame::new("h", "sessions.history", json!({ "key": "k", "batchSize": 2 })),
            )
            .await;
        assert!(last.is_final);
        assert_eq!(last.result.unwrap()["total"], 5);

        let mut offsets = Vec::new();
        while let Ok(Outbound::Response(frame)) = rx.try_recv() {
            assert!(!frame.is_final);
            offsets.push(frame.result.unwrap()["offset"].as_u64().unwrap());
        }
        assert_eq!(offsets, vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn test_append_is_idempotent() {
        let fx = fixture();
        let params = json!({ "key": "k", "message": { "text": "once" }, "idempotencyKey": "abc" });

        let first = fx.call(Role::Operator, "sessions.append", params.clone()).await;
        let second = fx.call(Role::Operator, "sessions.append", params).await;
        assert_eq!(first.result, second.result);

        let messages = fx.deps.sessions.read_messages("main", "k").await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_viewer_cannot_append() {
        let fx = fixture();
        let res = fx
            .call(Role::Viewer, "sessions.append", json!({ "key": "k", "message": {} }))
            .await;
        assert_eq!(res.error.unwrap().code, ErrorCode::Unauthorized);
    }

    #[tokio::test]
    async fn test_reset_delete_and_archives() {
        let fx = fixture();
        fx.call(Role::Operator, "sessions.append", json!({ "key": "a", "message": {} })).await;
        fx.call(Role::Operator, "sessions.append", json!({ "key": "b", "message": {} })).await;

        let res = fx.call(Role::Operator, "sessions.reset", json!({ "key": "a" })).await;
        assert!(res.result.unwrap()["archived"].is_string());
        let res = fx.call(Role::Operator, "sessions.delete", json!({ "key": "b" })).await;
        assert!(res.ok);

        let res = fx.call(Role::Viewer, "sessions.archives", json!({ "limit": 1 })).await;
        let listing = res.result.unwrap();
        assert_eq!(listing["total"], 2);
        assert_eq!(listing["archives"].as_array().unwrap().len(), 1);

        let res = fx.call(Role::Viewer, "sessions.list", json!({})).await;
        assert_eq!(res.result.unwrap()["sessions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_history_of_unknown_session() {
        let fx = fixture();
        let res = fx.call(Role::Viewer, "sessions.history", json!({ "key": "missing" })).await;
        assert_eq!(res.error.unwrap().code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_archives_rejects_unknown_fields() {
        let fx = fixture();
        let res = fx.call(Role::Viewer, "sessions.archives", json!({ "limt": 5 })).await;
        assert_eq!(res.error.unwrap().code, ErrorCode::InvalidRequest);
    }
}
