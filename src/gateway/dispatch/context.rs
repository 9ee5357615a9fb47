//! Per-request context: streaming responder, cancellation, in-flight tracking

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::gateway::protocol::{EventFrame, ResponseFrame, Role};

/// Frames queued for a connection's writer
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Response (intermediate or final)
    Response(ResponseFrame),
    /// Server event
    Event(EventFrame),
    /// Close the socket
    Close {
        /// Close code
        code: u16,
        /// Close reason
        reason: String,
    },
}

/// Observable cancellation flag
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

/// Owner side of a [`CancelSignal`]
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Create a linked handle/signal pair
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx: Some(rx) })
}

impl CancelHandle {
    /// Signal cancellation to every clone of the signal
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// A new signal observing this handle
    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: Some(self.tx.subscribe()),
        }
    }
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        CancelSignal { rx: None }
    }

    /// Whether cancellation was requested (or the owner is gone)
    pub fn is_cancelled(&self) -> bool {
        match &self.rx {
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
            None => false,
        }
    }

    /// Resolve once cancelled
    pub async fn cancelled(&self) {
        match &self.rx {
            Some(rx) => {
                let mut rx = rx.clone();
                // A dropped handle counts as cancellation
                let _ = rx.wait_for(|cancelled| *cancelled).await;
            }
            None => std::future::pending().await,
        }
    }
}

/// Everything a method sees about its request
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Connection id
    pub conn_id: String,
    /// Request id
    pub request_id: String,
    /// Caller's role
    pub role: Role,
    /// Caller identity asserted by a trusted proxy
    pub user: Option<String>,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancelSignal,
}

impl RequestContext {
    /// Create a context bound to a connection's outbound queue
    pub fn new(
        conn_id: impl Into<String>,
        request_id: impl Into<String>,
        role: Role,
        user: Option<String>,
        outbound: mpsc::Sender<Outbound>,
        cancel: CancelSignal,
    ) -> Self {
        RequestContext {
            conn_id: conn_id.into(),
            request_id: request_id.into(),
            role,
            user,
            outbound,
            cancel,
        }
    }

    /// Context with its own queue, for running methods outside a connection
    pub fn detached(request_id: impl Into<String>, role: Role) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self::new("detached", request_id, role, None, tx, CancelSignal::never()),
            rx,
        )
    }

    /// Send an intermediate (non-final) response for this request
    ///
    /// Intermediate responses are queued in order ahead of the final one.
    pub async fn emit(&self, result: Value) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Unavailable("request cancelled".into()));
        }
        self.outbound
            .send(Outbound::Response(ResponseFrame::intermediate(
                self.request_id.clone(),
                result,
            )))
            .await
            .map_err(|_| Error::Unavailable("connection closed".into()))
    }

    /// Cancellation signal for this request
    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Whether the request was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Request ids currently executing on one connection
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<String>>>,
}

/// Removes its id from [`InFlight`] when dropped
#[derive(Debug)]
pub struct InFlightGuard {
    ids: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl InFlight {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`; `None` when a request with that id is still running
    pub fn begin(&self, id: &str) -> Option<InFlightGuard> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if !ids.insert(id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            ids: self.ids.clone(),
            id: id.to_string(),
        })
    }

    /// Number of running requests
    pub fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether nothing is running
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
