//! Bounded, best-effort persistence of node status transitions.
//!
//! Persistence never blocks or fails a workflow: a full queue drops the
//! update and repository errors are only logged.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tracing::{debug, warn};

use trellis_core::error::Result;
use trellis_core::traits::SessionRepository;
use trellis_core::types::{NodeStatus, SessionId};

struct StatusUpdate {
    session_id: SessionId,
    node_id: String,
    status: NodeStatus,
}

/// Queue feeding a [`SessionRepository`] with at most `max_in_flight`
/// concurrent writes.
#[derive(Clone)]
pub struct PersistQueue {
    tx: mpsc::Sender<StatusUpdate>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl PersistQueue {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn spawn(
        repo: Arc<dyn SessionRepository>,
        capacity: usize,
        max_in_flight: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());
        let permits = Arc::new(Semaphore::new(max_in_flight.max(1)));

        tokio::spawn(run_worker(rx, repo, permits, pending.clone(), idle.clone()));

        Self { tx, pending, idle }
    }

    /// Queue one status write. Never waits; drops the update when full.
    pub fn enqueue(&self, session_id: &SessionId, node_id: &str, status: NodeStatus) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let update = StatusUpdate {
            session_id: session_id.clone(),
            node_id: node_id.to_string(),
            status,
        };
        if let Err(e) = self.tx.try_send(update) {
            self.finish_one();
            warn!(node_id = %node_id, status = %status, error = %e, "Status persistence queue rejected update");
        }
    }

    /// Updates accepted but not yet written.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Resolve once every accepted update has been written (or has failed).
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<StatusUpdate>,
    repo: Arc<dyn SessionRepository>,
    permits: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
) {
    while let Some(update) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let repo = repo.clone();
        let pending = pending.clone();
        let idle = idle.clone();
        tokio::spawn(async move {
            let StatusUpdate {
                session_id,
                node_id,
                status,
            } = update;
            match repo.update_node_status(&session_id, &node_id, status).await {
                Ok(()) => debug!(node_id = %node_id, status = %status, "Node status persisted"),
                Err(e) => warn!(node_id = %node_id, status = %status, error = %e, "Failed to persist node status"),
            }
            drop(permit);
            if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });
    }
    debug!("Status persistence worker stopped");
}

/// Reference repository keeping the latest status per session and node.
#[derive(Default)]
pub struct InMemorySessionRepository {
    statuses: Mutex<HashMap<(String, String), NodeStatus>>,
    writes: AtomicUsize,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn status(&self, session_id: &SessionId, node_id: &str) -> Option<NodeStatus> {
        self.statuses
            .lock()
            .await
            .get(&(session_id.to_string(), node_id.to_string()))
            .copied()
    }

    /// Total writes received.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SessionRepository for InMemorySessionRepository {
    fn update_node_status<'a>(
        &'a self,
        session_id: &'a SessionId,
        node_id: &'a str,
        status: NodeStatus,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.statuses
                .lock()
                .await
                .insert((session_id.to_string(), node_id.to_string()), status);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use trellis_core::error::TrellisError;

    struct FailingRepo;

    impl SessionRepository for FailingRepo {
        fn update_node_status<'a>(
            &'a self,
            _session_id: &'a SessionId,
            _node_id: &'a str,
            _status: NodeStatus,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async { Err(TrellisError::Persistence("disk full".into())) })
        }
    }

    /// Holds each write until the gate opens, tracking peak concurrency.
    struct GatedRepo {
        gate: Semaphore,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SessionRepository for GatedRepo {
        fn update_node_status<'a>(
            &'a self,
            _session_id: &'a SessionId,
            _node_id: &'a str,
            _status: NodeStatus,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                let _permit = self.gate.acquire().await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn writes_reach_repository() {
        let repo = Arc::new(InMemorySessionRepository::new());
        let queue = PersistQueue::spawn(repo.clone(), 16, 2);
        let sid = SessionId::new();

        queue.enqueue(&sid, "a", NodeStatus::Running);
        queue.enqueue(&sid, "b", NodeStatus::Completed);
        tokio::time::timeout(Duration::from_secs(1), queue.wait_idle())
            .await
            .unwrap();

        assert_eq!(repo.writes(), 2);
        assert_eq!(repo.status(&sid, "b").await, Some(NodeStatus::Completed));
    }

    #[tokio::test]
    async fn repository_errors_are_swallowed() {
        let queue = PersistQueue::spawn(Arc::new(FailingRepo), 4, 1);
        queue.enqueue(&SessionId::new(), "a", NodeStatus::Failed);
        tokio::time::timeout(Duration::from_secs(1), queue.wait_idle())
            .await
            .unwrap();
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let repo = Arc::new(GatedRepo {
            gate: Semaphore::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let queue = PersistQueue::spawn(repo.clone(), 32, 2);
        let sid = SessionId::new();
        for i in 0..6 {
            queue.enqueue(&sid, &format!("n{}", i), NodeStatus::Running);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(repo.peak.load(Ordering::SeqCst), 2);

        repo.gate.add_permits(6);
        tokio::time::timeout(Duration::from_secs(1), queue.wait_idle())
            .await
            .unwrap();
        assert_eq!(repo.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let repo = Arc::new(GatedRepo {
            gate: Semaphore::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let queue = PersistQueue::spawn(repo.clone(), 1, 1);
        let sid = SessionId::new();
        for i in 0..50 {
            queue.enqueue(&sid, &format!("n{}", i), NodeStatus::Running);
        }
        // One in flight, at most one queued, one possibly held by the worker.
        assert!(queue.pending() <= 3);

        repo.gate.add_permits(50);
        tokio::time::timeout(Duration::from_secs(1), queue.wait_idle())
            .await
            .unwrap();
    }
}
