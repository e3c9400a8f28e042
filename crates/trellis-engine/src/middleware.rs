use std::collections::HashMap;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::warn;

use trellis_core::error::{Result, TrellisError};
use trellis_core::graph::Node;
use trellis_core::session::Session;
use trellis_core::traits::Middleware;

/// Stops runaway cycles by capping how often a node may run per session.
pub struct CircuitBreaker {
    max_visits: usize,
    visits: Mutex<HashMap<(String, String), usize>>,
}

impl CircuitBreaker {
    /// `max_visits` of 0 disables the breaker.
    pub fn new(max_visits: usize) -> Self {
        Self {
            max_visits,
            visits: Mutex::new(HashMap::new()),
        }
    }

    pub async fn visits(&self, session: &Session, node_id: &str) -> usize {
        self.visits
            .lock()
            .await
            .get(&(session.id().to_string(), node_id.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

impl Middleware for CircuitBreaker {
    fn name(&self) -> &str {
        "LogicCircuitBreaker"
    }

    fn before_node_execution<'a>(
        &'a self,
        session: &'a Session,
        node: &'a Node,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let count = {
                let mut visits = self.visits.lock().await;
                let count = visits
                    .entry((session.id().to_string(), node.id.clone()))
                    .or_insert(0);
                *count += 1;
                *count
            };
            if self.max_visits > 0 && count > self.max_visits {
                warn!(node_id = %node.id, visits = count, limit = self.max_visits, "Circuit breaker tripped");
                return Err(TrellisError::node_failed(
                    node.id.clone(),
                    format!("visited {} times, limit is {}", count, self.max_visits),
                ));
            }
            Ok(())
        })
    }
}
