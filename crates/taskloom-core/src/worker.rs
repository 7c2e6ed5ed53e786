//! Distributed worker: pops queued tasks, executes them through the
//! handler runtime and publishes result events back to the orchestrator.
//!
//! Workers re-run permission checks from the wire context instead of
//! trusting the producer, and own the retry delays for their nodes. A
//! worker that dies mid-task leaves the payload on the processing list for
//! redelivery.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;

use crate::error::TaskloomError;
use crate::events::{Event, EventBus};
use crate::orchestrator::NodeExecutor;
use crate::queue::{QueuedTask, TaskQueue};
use crate::runtime::HandlerRegistry;
use crate::validation::ValidationService;

const POP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Worker {
    worker_id: String,
    queue: Arc<dyn TaskQueue>,
    bus: Arc<EventBus>,
    registry: Arc<HandlerRegistry>,
    validation: Arc<ValidationService>,
    shutdown_tx: watch::Sender<bool>,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<String>,
        queue: Arc<dyn TaskQueue>,
        bus: Arc<EventBus>,
        registry: Arc<HandlerRegistry>,
        validation: Arc<ValidationService>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            worker_id: worker_id.into(),
            queue,
            bus,
            registry,
            validation,
            shutdown_tx,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Handle used to stop a running worker from another task.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Main loop: pop, execute, publish, complete. Returns when shut down;
    /// an in-flight pop observes the shutdown and the loop exits without
    /// acking anything it did not finish.
    pub async fn run(&self) -> Result<(), TaskloomError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tracing::info!(worker_id = %self.worker_id, "worker started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let popped = tokio::select! {
                _ = shutdown_rx.changed() => break,
                popped = self.queue.pop(POP_TIMEOUT) => popped,
            };

            let task = match popped {
                Ok(Some(task)) => task,
                Ok(None) => continue,
                Err(err) => {
                    tracing::error!(worker_id = %self.worker_id, error = %err, "pop failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            self.process(task).await;
        }

        tracing::info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn process(&self, task: QueuedTask) {
        let graph_id = task.graph_id.clone();
        let node_id = task.node.id.clone();
        let ctx = task.context.clone().into_context();
        tracing::info!(
            worker_id = %self.worker_id,
            node_id = %node_id,
            graph_id = %graph_id,
            "executing queued node"
        );

        let executor = NodeExecutor {
            graph_id: graph_id.clone(),
            registry: self.registry.clone(),
            validation: self.validation.clone(),
            bus: self.bus.clone(),
            ctx,
            streaming: false,
            sequence: Arc::new(AtomicU64::new(0)),
        };

        let mut node = task.node.clone();
        node.started_at = None;
        node.completed_at = None;
        let (node, result) = executor.execute(node).await;

        let event = match &result {
            Ok(value) => Event::new("task.completed", self.worker_id.clone()).with_payload(json!({
                "graph_id": graph_id,
                "node_id": node_id,
                "result": value,
                "status": "success",
            })),
            Err(err) => Event::new("task.failed", self.worker_id.clone()).with_payload(json!({
                "graph_id": graph_id,
                "node_id": node_id,
                "error": err.to_string(),
            })),
        };

        if let Err(err) = self.bus.publish(event).await {
            // The result event is the only way the orchestrator learns the
            // outcome; keep the payload on processing for redelivery.
            tracing::error!(
                worker_id = %self.worker_id,
                node_id = %node.id,
                error = %err,
                "failed to publish result event"
            );
            return;
        }

        if let Err(err) = self.queue.complete(&task).await {
            tracing::warn!(node_id = %node.id, error = %err, "failed to ack queued task");
        }

        tracing::info!(
            worker_id = %self.worker_id,
            node_id = %node.id,
            success = result.is_ok(),
            "queued node finished"
        );
    }
}
