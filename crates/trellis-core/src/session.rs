use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Result, TrellisError};
use crate::graph::GraphDefinition;
use crate::types::{Payload, SessionId, SessionStatus};

/// Lifecycle fields guarded together.
struct LifecycleState {
    status: SessionStatus,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    error: Option<String>,
    cancel: CancellationToken,
}

/// One-shot mailbox an external actor uses to unblock a waiting node.
struct SignalSlot {
    tx: mpsc::Sender<Value>,
    rx: Arc<Mutex<mpsc::Receiver<Value>>>,
}

impl SignalSlot {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }
}

/// One stateful execution of a graph.
///
/// Mutated by its engine and by external control calls (pause, resume,
/// stop, signals). Every field sits behind its own lock, independent of
/// the engine's bookkeeping locks.
pub struct Session {
    id: SessionId,
    graph: Arc<GraphDefinition>,
    inputs: Payload,
    state: RwLock<LifecycleState>,
    pause_tx: watch::Sender<bool>,
    outputs: RwLock<Payload>,
    context: RwLock<Payload>,
    signals: Mutex<HashMap<String, SignalSlot>>,
}

impl Session {
    pub fn new(graph: Arc<GraphDefinition>, inputs: Payload) -> Self {
        Self::with_id(SessionId::new(), graph, inputs)
    }

    pub fn with_id(id: SessionId, graph: Arc<GraphDefinition>, inputs: Payload) -> Self {
        let (pause_tx, _) = watch::channel(false);
        Self {
            id,
            graph,
            inputs,
            state: RwLock::new(LifecycleState {
                status: SessionStatus::Pending,
                started_at: None,
                ended_at: None,
                error: None,
                cancel: CancellationToken::new(),
            }),
            pause_tx,
            outputs: RwLock::new(Payload::new()),
            context: RwLock::new(Payload::new()),
            signals: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn graph(&self) -> &Arc<GraphDefinition> {
        &self.graph
    }

    /// Initial input bag.
    pub fn inputs(&self) -> &Payload {
        &self.inputs
    }

    pub async fn status(&self) -> SessionStatus {
        self.state.read().await.status
    }

    pub async fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.started_at
    }

    pub async fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.ended_at
    }

    /// Error text recorded by [`Session::fail`].
    pub async fn error(&self) -> Option<String> {
        self.state.read().await.error.clone()
    }

    /// Cancellation token for this execution. Cancelled on every terminal
    /// transition.
    pub async fn context(&self) -> CancellationToken {
        self.state.read().await.cancel.clone()
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// pending → running. The session token becomes a child of `parent`.
    pub async fn start(&self, parent: &CancellationToken) -> Result<()> {
        let mut state = self.state.write().await;
        if state.status != SessionStatus::Pending {
            return Err(invalid(state.status, SessionStatus::Running));
        }
        state.status = SessionStatus::Running;
        state.started_at = Some(Utc::now());
        state.cancel = parent.child_token();
        info!(session_id = %self.id, "Session started");
        Ok(())
    }

    /// running/paused → completed.
    pub async fn complete(&self) -> Result<()> {
        self.finish(SessionStatus::Completed, None).await
    }

    /// running/paused → failed, recording `reason`.
    pub async fn fail(&self, reason: impl Into<String>) -> Result<()> {
        self.finish(SessionStatus::Failed, Some(reason.into())).await
    }

    /// Explicit stop request: pending/running/paused → cancelled.
    ///
    /// Distinct from [`Session::fail`] so consumers can tell a user
    /// cancellation from a fault.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.status.is_terminal() {
            return Err(invalid(state.status, SessionStatus::Cancelled));
        }
        state.status = SessionStatus::Cancelled;
        state.ended_at = Some(Utc::now());
        state.cancel.cancel();
        self.pause_tx.send_replace(false);
        info!(session_id = %self.id, "Session cancelled");
        Ok(())
    }

    async fn finish(&self, to: SessionStatus, error: Option<String>) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.status.is_active() {
            return Err(invalid(state.status, to));
        }
        state.status = to;
        state.ended_at = Some(Utc::now());
        state.error = error;
        state.cancel.cancel();
        self.pause_tx.send_replace(false);
        info!(session_id = %self.id, status = %to, "Session finished");
        Ok(())
    }

    // ── Pause gate ──────────────────────────────────────────────

    /// running → paused. New dispatches block until [`Session::resume`].
    pub async fn pause(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.status != SessionStatus::Running {
            return Err(invalid(state.status, SessionStatus::Paused));
        }
        state.status = SessionStatus::Paused;
        self.pause_tx.send_replace(true);
        debug!(session_id = %self.id, "Session paused");
        Ok(())
    }

    /// paused → running, releasing every blocked dispatch.
    pub async fn resume(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if state.status != SessionStatus::Paused {
            return Err(invalid(state.status, SessionStatus::Running));
        }
        state.status = SessionStatus::Running;
        self.pause_tx.send_replace(false);
        debug!(session_id = %self.id, "Session resumed");
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }

    /// Block while the session is paused.
    ///
    /// Returns `Cancelled` as soon as `cancel` fires, paused or not.
    pub async fn wait_if_paused(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(TrellisError::Cancelled);
        }
        let mut rx = self.pause_tx.subscribe();
        if !*rx.borrow_and_update() {
            return Ok(());
        }
        tokio::select! {
            _ = rx.wait_for(|paused| !*paused) => Ok(()),
            _ = cancel.cancelled() => Err(TrellisError::Cancelled),
        }
    }

    // ── Outputs and scratch context ─────────────────────────────

    pub async fn set_output(&self, key: impl Into<String>, value: Value) {
        self.outputs.write().await.insert(key.into(), value);
    }

    pub async fn outputs(&self) -> Payload {
        self.outputs.read().await.clone()
    }

    pub async fn set_context(&self, key: impl Into<String>, value: Value) {
        self.context.write().await.insert(key.into(), value);
    }

    pub async fn context_value(&self, key: &str) -> Option<Value> {
        self.context.read().await.get(key).cloned()
    }

    // ── Signals ─────────────────────────────────────────────────

    /// Open the signal mailbox for `node_id` if it is not open yet.
    pub async fn open_signal(&self, node_id: &str) {
        self.signals
            .lock()
            .await
            .entry(node_id.to_string())
            .or_insert_with(SignalSlot::new);
    }

    pub async fn is_waiting_for_signal(&self, node_id: &str) -> bool {
        self.signals.lock().await.contains_key(node_id)
    }

    /// Deliver `payload` to the node waiting on `node_id`.
    ///
    /// Fails with `SignalNotWaiting` if no mailbox is open (never opened,
    /// or already consumed) and `SignalChannelFull` if a payload is
    /// already pending.
    pub async fn send_signal(&self, node_id: &str, payload: Value) -> Result<()> {
        let signals = self.signals.lock().await;
        let slot = signals
            .get(node_id)
            .ok_or_else(|| TrellisError::SignalNotWaiting(node_id.to_string()))?;
        slot.tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TrellisError::SignalChannelFull(node_id.to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                TrellisError::SignalNotWaiting(node_id.to_string())
            }
        })
    }

    /// Wait for one external payload addressed to `node_id`.
    ///
    /// Opens the mailbox lazily and retires it after delivery, so the
    /// channel is strictly one-shot.
    pub async fn wait_for_signal(&self, node_id: &str) -> Result<Value> {
        self.open_signal(node_id).await;
        let rx = match self.signals.lock().await.get(node_id) {
            Some(slot) => slot.rx.clone(),
            None => return Err(TrellisError::SignalNotWaiting(node_id.to_string())),
        };
        let cancel = self.context().await;

        let mut rx = rx.lock().await;
        let payload = tokio::select! {
            payload = rx.recv() => payload.ok_or_else(|| TrellisError::SignalNotWaiting(node_id.to_string())),
            _ = cancel.cancelled() => Err(TrellisError::Cancelled),
        };
        drop(rx);

        if payload.is_ok() {
            self.signals.lock().await.remove(node_id);
        }
        payload
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("graph", &self.graph.id)
            .field("paused", &self.is_paused())
            .finish()
    }
}

fn invalid(from: SessionStatus, to: SessionStatus) -> TrellisError {
    TrellisError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}
