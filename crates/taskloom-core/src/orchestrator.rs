//! Graph orchestration: risk assessment, admission, mode-specific
//! scheduling, persistence on every status change, execution memory and
//! lifecycle events.
//!
//! The orchestrator owns an in-flight graph exclusively. Nodes are executed
//! through the handler runtime; in distributed mode they are serialized
//! onto the task queue and advanced by result events from remote workers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::billing::BillingGate;
use crate::broker::StreamBroker;
use crate::config::Config;
use crate::error::{HandlerError, TaskloomError};
use crate::events::{BusConfig, Event, EventBus, EventHandler};
use crate::graph::{
    ExecutionLogEntry, ExecutionMode, RiskLevel, SecurityContext, StreamKind, StreamUpdate,
    TaskGraph, TaskNode, TaskStatus,
};
use crate::memory::{MemoryService, MemoryVectorStore, StoreMemoryRequest, VectorStore};
use crate::metrics;
use crate::queue::{MemoryTaskQueue, QueuedTask, TaskQueue};
use crate::retry::retry_delay;
use crate::runtime::{HandlerRegistry, TaskHandler};
use crate::security::SecurityService;
use crate::store::{GraphSnapshotRow, MemoryStore, Store};
use crate::validation::ValidationService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphStatus {
    Success,
    PartialFailure,
    Failed,
}

impl GraphStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphStatus::Success => "success",
            GraphStatus::PartialFailure => "partial_failure",
            GraphStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeError {
    pub node_id: String,
    pub error: String,
    pub timestamp: chrono::DateTime<Utc>,
}

/// Caller-visible result of one orchestration run.
#[derive(Debug, Clone, Serialize)]
pub struct GraphReport {
    pub graph_id: String,
    pub goal: String,
    pub status: GraphStatus,
    pub risk_level: RiskLevel,
    pub completed_nodes: Vec<String>,
    pub total_nodes: usize,
    pub errors: Vec<NodeError>,
    pub execution_log: Vec<ExecutionLogEntry>,
    pub execution_time_seconds: f64,
    pub execution_mode: ExecutionMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub active_graphs: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub avg_execution_time_ms: f64,
    pub error_rate: f64,
    pub uptime_seconds: f64,
}

/// Builder wiring the orchestrator's collaborators; in-memory backends by
/// default, durable ones injected per deployment.
pub struct OrchestratorBuilder {
    config: Config,
    store: Option<Arc<dyn Store>>,
    queue: Option<Arc<dyn TaskQueue>>,
    vectors: Option<Arc<dyn VectorStore>>,
    broker: Option<Arc<dyn StreamBroker>>,
}

impl OrchestratorBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            queue: None,
            vectors: None,
            broker: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_vector_store(mut self, vectors: Arc<dyn VectorStore>) -> Self {
        self.vectors = Some(vectors);
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn StreamBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn build(self) -> Orchestrator {
        let bus_config = BusConfig {
            max_history: self.config.orchestrator.max_event_history,
            ..BusConfig::default()
        };
        // `distributed` turns on the durable bus even when no external
        // broker was injected; the in-process broker keeps the contract.
        let broker = self.broker.or_else(|| {
            self.config
                .orchestrator
                .distributed
                .then(|| Arc::new(crate::broker::MemoryBroker::new()) as Arc<dyn StreamBroker>)
        });
        let bus = Arc::new(match broker {
            Some(broker) => EventBus::with_broker(bus_config, broker),
            None => EventBus::new(bus_config),
        });

        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(MemoryTaskQueue::new()));
        let vectors = self
            .vectors
            .unwrap_or_else(|| Arc::new(MemoryVectorStore::new()));

        let security = Arc::new(SecurityService::new(
            bus.clone(),
            self.config.security.clone(),
        ));
        let validation = Arc::new(ValidationService::new(
            bus.clone(),
            self.config.validation.clone(),
        ));
        let memory = Arc::new(MemoryService::new(
            store.clone(),
            vectors,
            bus.clone(),
            self.config.memory.clone(),
        ));
        let billing = Arc::new(BillingGate::new(store.clone()));
        let registry = Arc::new(
            HandlerRegistry::new(bus.clone(), security.clone()).with_billing(billing.clone()),
        );

        Orchestrator {
            config: self.config,
            bus,
            registry,
            store,
            queue,
            security,
            validation,
            memory,
            billing,
            active_graphs: AtomicUsize::new(0),
            tasks_executed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            total_task_time_us: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }
}

pub struct Orchestrator {
    config: Config,
    bus: Arc<EventBus>,
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    security: Arc<SecurityService>,
    validation: Arc<ValidationService>,
    memory: Arc<MemoryService>,
    billing: Arc<BillingGate>,
    active_graphs: AtomicUsize,
    tasks_executed: AtomicU64,
    tasks_failed: AtomicU64,
    total_task_time_us: AtomicU64,
    started_at: Instant,
}

impl Orchestrator {
    pub fn builder(config: Config) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn registry(&self) -> Arc<HandlerRegistry> {
        self.registry.clone()
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub fn queue(&self) -> Arc<dyn TaskQueue> {
        self.queue.clone()
    }

    pub fn security(&self) -> Arc<SecurityService> {
        self.security.clone()
    }

    pub fn validation(&self) -> Arc<ValidationService> {
        self.validation.clone()
    }

    pub fn memory(&self) -> Arc<MemoryService> {
        self.memory.clone()
    }

    pub fn billing(&self) -> Arc<BillingGate> {
        self.billing.clone()
    }

    pub fn register_handler(&self, handler: Arc<dyn TaskHandler>) {
        self.registry.register(handler);
    }

    pub fn start(&self) {
        self.bus.start();
        tracing::info!("orchestrator started");
    }

    pub async fn shutdown(&self) {
        self.bus.shutdown().await;
        tracing::info!("orchestrator stopped");
    }

    pub fn health(&self) -> HealthSnapshot {
        let executed = self.tasks_executed.load(Ordering::Relaxed);
        let failed = self.tasks_failed.load(Ordering::Relaxed);
        let total_us = self.total_task_time_us.load(Ordering::Relaxed);
        HealthSnapshot {
            active_graphs: self.active_graphs.load(Ordering::Relaxed),
            completed_tasks: executed,
            failed_tasks: failed,
            avg_execution_time_ms: if executed == 0 {
                0.0
            } else {
                (total_us as f64 / executed as f64) / 1000.0
            },
            error_rate: if executed == 0 {
                0.0
            } else {
                failed as f64 / executed as f64
            },
            uptime_seconds: self.started_at.elapsed().as_secs_f64(),
        }
    }

    /// Main entry point: execute a task graph under a security context.
    pub async fn process_goal(
        &self,
        mut graph: TaskGraph,
        ctx: SecurityContext,
    ) -> Result<GraphReport, TaskloomError> {
        graph.validate()?;
        let graph_id = graph.graph_id.clone();
        self.active_graphs.fetch_add(1, Ordering::SeqCst);

        let outcome = self.process_inner(&mut graph, &ctx).await;
        self.active_graphs.fetch_sub(1, Ordering::SeqCst);

        match outcome {
            Ok(report) => {
                self.publish(
                    Event::new("graph.completed", "orchestrator")
                        .with_payload(json!({
                            "graph_id": graph_id,
                            "status": report.status.as_str(),
                            "error_count": report.errors.len(),
                        }))
                        .with_priority(1),
                )
                .await;
                Ok(report)
            }
            Err(err) => {
                tracing::error!(graph_id = %graph_id, error = %err, "graph processing failed");
                self.publish(
                    Event::new("graph.failed", "orchestrator")
                        .with_payload(json!({
                            "graph_id": graph_id,
                            "error": err.to_string(),
                        }))
                        .with_priority(2),
                )
                .await;
                Err(err)
            }
        }
    }

    async fn process_inner(
        &self,
        graph: &mut TaskGraph,
        ctx: &SecurityContext,
    ) -> Result<GraphReport, TaskloomError> {
        let started = Instant::now();

        self.persist(graph).await;
        self.publish(
            Event::new("graph.started", "orchestrator")
                .with_payload(json!({
                    "graph_id": graph.graph_id,
                    "goal": graph.goal_summary,
                    "node_count": graph.len(),
                }))
                .with_priority(1),
        )
        .await;

        // Risk: the graph inherits its riskiest node.
        let mut max_score = 0.0f64;
        let mut level = RiskLevel::Low;
        for node in graph.nodes() {
            let assessment = self
                .security
                .assess_risk(&node.required_permissions, ctx)
                .await;
            if assessment.risk_score >= max_score {
                max_score = assessment.risk_score;
                level = assessment.risk_level;
            }
        }
        graph.risk_level = level;

        self.billing.admit(&ctx.user_id, graph.len()).await?;

        let mut tracker = RunTracker::new();
        match graph.execution_mode {
            ExecutionMode::Sequential => {
                self.run_local(graph, ctx, &mut tracker, 1, false).await;
            }
            ExecutionMode::Streaming => {
                self.run_local(graph, ctx, &mut tracker, 1, true).await;
            }
            ExecutionMode::Parallel => {
                let fan_out = graph.max_parallel_tasks.max(1);
                self.run_local(graph, ctx, &mut tracker, fan_out, false).await;
            }
            ExecutionMode::Distributed => {
                self.run_distributed(graph, ctx, &mut tracker).await?;
            }
        }

        let all_success = graph
            .nodes()
            .all(|node| node.status == TaskStatus::Success);
        let status = if all_success {
            GraphStatus::Success
        } else if tracker.completed.is_empty() {
            GraphStatus::Failed
        } else {
            GraphStatus::PartialFailure
        };
        graph.status = if all_success {
            TaskStatus::Success
        } else {
            TaskStatus::Failed
        };

        let report = GraphReport {
            graph_id: graph.graph_id.clone(),
            goal: graph.goal_summary.clone(),
            status,
            risk_level: graph.risk_level,
            completed_nodes: tracker.completed.clone(),
            total_nodes: graph.len(),
            errors: tracker.errors.clone(),
            execution_log: tracker.log.clone(),
            execution_time_seconds: started.elapsed().as_secs_f64(),
            execution_mode: graph.execution_mode,
        };

        self.store_execution_memory(graph, &report).await;
        self.persist(graph).await;

        Ok(report)
    }

    /// Sequential / streaming / bounded-parallel scheduling. Waves of ready
    /// nodes execute through the runtime; individual failures never abort
    /// peers, only a tripped cost budget does.
    async fn run_local(
        &self,
        graph: &mut TaskGraph,
        ctx: &SecurityContext,
        tracker: &mut RunTracker,
        fan_out: usize,
        streaming: bool,
    ) {
        let executor = NodeExecutor {
            graph_id: graph.graph_id.clone(),
            registry: self.registry.clone(),
            validation: self.validation.clone(),
            bus: self.bus.clone(),
            ctx: ctx.clone(),
            streaming,
            sequence: Arc::new(AtomicU64::new(0)),
        };

        'graph: loop {
            let ready: Vec<TaskNode> = graph
                .ready_nodes()
                .into_iter()
                .take(fan_out)
                .cloned()
                .collect();

            if ready.is_empty() {
                // Settled, or stuck behind failed dependencies.
                break;
            }

            if fan_out == 1 {
                for node in ready {
                    let node_id = node.id.clone();
                    let (node, result) = executor.clone().execute(node).await;
                    let aborted = self.absorb_local(graph, tracker, node, result).await;
                    if streaming {
                        executor
                            .emit_stream(
                                &node_id,
                                StreamKind::Progress,
                                json!({
                                    "completed": tracker.completed.len(),
                                    "total": graph.len(),
                                }),
                            )
                            .await;
                    }
                    if aborted {
                        break 'graph;
                    }
                }
            } else {
                let mut wave = JoinSet::new();
                for node in ready {
                    let executor = executor.clone();
                    wave.spawn(async move { executor.execute(node).await });
                }

                let mut aborted = false;
                while let Some(joined) = wave.join_next().await {
                    match joined {
                        Ok((node, result)) => {
                            aborted |= self.absorb_local(graph, tracker, node, result).await;
                        }
                        Err(join_err) => {
                            tracing::error!(error = %join_err, "node execution task panicked");
                        }
                    }
                }
                if aborted {
                    break 'graph;
                }
            }
        }
    }

    /// Merge one executed node back into the graph and persist. Returns
    /// true when the run must abort (cost budget exceeded).
    async fn absorb_local(
        &self,
        graph: &mut TaskGraph,
        tracker: &mut RunTracker,
        node: TaskNode,
        result: Result<Value, HandlerError>,
    ) -> bool {
        let duration_ms = node.execution_time_ms;
        let node_id = node.id.clone();
        let agent_type = node.agent_type;
        let status = node.status;
        graph.put_node(node);

        let mut abort = false;
        match &result {
            Ok(_) => {
                self.record_task_outcome(true, duration_ms);
                tracker.completed.push(node_id.clone());
            }
            Err(HandlerError::BudgetExceeded) => {
                // The node itself finished; the graph stops here.
                self.record_task_outcome(true, duration_ms);
                tracker.completed.push(node_id.clone());
                tracker.errors.push(NodeError {
                    node_id: "GLOBAL".to_string(),
                    error: "Cost budget exceeded".to_string(),
                    timestamp: Utc::now(),
                });
                abort = true;
            }
            Err(err) => {
                self.record_task_outcome(false, duration_ms);
                tracker.errors.push(NodeError {
                    node_id: node_id.clone(),
                    error: err.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }

        tracker.log.push(ExecutionLogEntry {
            graph_id: graph.graph_id.clone(),
            node_id,
            agent_type,
            action: "execute".to_string(),
            status,
            error_message: result.as_ref().err().map(|e| e.to_string()),
            timestamp: Utc::now(),
            duration_ms,
        });

        self.persist(graph).await;
        abort
    }

    /// Distributed scheduling: push ready nodes onto the task queue and
    /// advance the graph from `task.completed` / `task.failed` events.
    async fn run_distributed(
        &self,
        graph: &mut TaskGraph,
        ctx: &SecurityContext,
        tracker: &mut RunTracker,
    ) -> Result<(), TaskloomError> {
        let results: Arc<DashMap<String, Result<Value, String>>> = Arc::new(DashMap::new());

        let completed = Arc::new(ResultCollector {
            graph_id: graph.graph_id.clone(),
            results: results.clone(),
            failure: false,
        });
        let failed = Arc::new(ResultCollector {
            graph_id: graph.graph_id.clone(),
            results: results.clone(),
            failure: true,
        });
        let completed_sub = self.bus.subscribe("task.completed", completed);
        let failed_sub = self.bus.subscribe("task.failed", failed);

        let max_credits = self.config.orchestrator.max_credits;
        let mut credits_used = 0.0f64;

        loop {
            if credits_used >= max_credits {
                tracing::error!(
                    used = credits_used,
                    budget = max_credits,
                    "cost budget exceeded, terminating orchestration"
                );
                tracker.errors.push(NodeError {
                    node_id: "GLOBAL".to_string(),
                    error: "Cost budget exceeded".to_string(),
                    timestamp: Utc::now(),
                });
                // Give already-dispatched nodes a chance to report back so
                // their results are not lost with the budget.
                let drain_deadline = Instant::now() + Duration::from_secs(10);
                while graph.count_with_status(TaskStatus::Running) > 0
                    && Instant::now() < drain_deadline
                {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    self.absorb_remote(graph, tracker, &results).await;
                    self.enforce_sla(graph, tracker).await;
                }
                break;
            }

            self.absorb_remote(graph, tracker, &results).await;
            self.enforce_sla(graph, tracker).await;

            let ready: Vec<String> = graph
                .ready_nodes()
                .into_iter()
                .map(|n| n.id.clone())
                .collect();

            if ready.is_empty() {
                if graph.is_settled() {
                    break;
                }
                let in_flight = graph.count_with_status(TaskStatus::Running)
                    + graph.count_with_status(TaskStatus::Queued);
                if in_flight == 0 {
                    // Stuck: pending nodes behind failed dependencies.
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            let queue_len = match self.queue.len().await {
                Ok(len) => len,
                Err(err) => {
                    tracing::warn!(error = %err, "queue length probe failed");
                    0
                }
            };
            metrics::record_queue_depth(queue_len as u64);
            if queue_len > self.config.orchestrator.max_queue_size {
                tracing::warn!(
                    queue_len,
                    threshold = self.config.orchestrator.max_queue_size,
                    "backpressure: throttling dispatch"
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            let graph_id = graph.graph_id.clone();
            for node_id in ready {
                credits_used += 1.0;
                let task = {
                    let node = graph.node_mut(&node_id).expect("ready node exists");
                    node.status = TaskStatus::Running;
                    node.started_at = Some(Utc::now());
                    QueuedTask::new(node.clone(), graph_id.clone(), ctx)
                };
                self.persist(graph).await;
                if let Err(err) = self.queue.push(&task).await {
                    // A failed push is surfaced on the node, not swallowed.
                    let node = graph.node_mut(&node_id).expect("ready node exists");
                    node.status = TaskStatus::Failed;
                    node.error_log.push(err.to_string());
                    tracker.errors.push(NodeError {
                        node_id: node_id.clone(),
                        error: err.to_string(),
                        timestamp: Utc::now(),
                    });
                    self.persist(graph).await;
                    continue;
                }
                tracing::info!(node_id = %node_id, "dispatched node to worker queue");
            }
        }

        self.bus.unsubscribe("task.completed", completed_sub);
        self.bus.unsubscribe("task.failed", failed_sub);
        Ok(())
    }

    /// Apply remote results that arrived since the last pass.
    async fn absorb_remote(
        &self,
        graph: &mut TaskGraph,
        tracker: &mut RunTracker,
        results: &DashMap<String, Result<Value, String>>,
    ) {
        let graph_id = graph.graph_id.clone();
        let node_ids: Vec<String> = results.iter().map(|e| e.key().clone()).collect();
        for node_id in node_ids {
            let Some((_, result)) = results.remove(&node_id) else {
                continue;
            };
            let Some(node) = graph.node_mut(&node_id) else {
                continue;
            };
            if node.status.is_terminal() {
                // Duplicate delivery; at-least-once queues allow it.
                continue;
            }
            let agent_type = node.agent_type;

            match result {
                Ok(output) => {
                    node.output_data = output;
                    node.status = TaskStatus::Success;
                    node.completed_at = Some(Utc::now());
                    let duration_ms = node.execution_time_ms;
                    tracker.completed.push(node_id.clone());
                    self.record_task_outcome(true, duration_ms);
                    tracker.log.push(ExecutionLogEntry {
                        graph_id: graph_id.clone(),
                        node_id,
                        agent_type,
                        action: "remote_execute".to_string(),
                        status: TaskStatus::Success,
                        error_message: None,
                        timestamp: Utc::now(),
                        duration_ms,
                    });
                }
                Err(error) => {
                    tracing::error!(node_id = %node_id, error = %error, "node failed remotely");
                    node.status = TaskStatus::Failed;
                    node.completed_at = Some(Utc::now());
                    node.error_log.push(error.clone());
                    let duration_ms = node.execution_time_ms;
                    self.record_task_outcome(false, duration_ms);
                    tracker.log.push(ExecutionLogEntry {
                        graph_id: graph_id.clone(),
                        node_id: node_id.clone(),
                        agent_type,
                        action: "remote_execute".to_string(),
                        status: TaskStatus::Failed,
                        error_message: Some(error.clone()),
                        timestamp: Utc::now(),
                        duration_ms,
                    });
                    tracker.errors.push(NodeError {
                        node_id,
                        error,
                        timestamp: Utc::now(),
                    });
                }
            }
            self.persist(graph).await;
        }
    }

    /// Fail RUNNING nodes whose wall-clock exceeded their SLA; the remote
    /// worker is not cancelled.
    async fn enforce_sla(&self, graph: &mut TaskGraph, tracker: &mut RunTracker) {
        let now = Utc::now();
        let mut breached = Vec::new();
        for node in graph.nodes_mut() {
            if node.status != TaskStatus::Running {
                continue;
            }
            let Some(started_at) = node.started_at else {
                continue;
            };
            let elapsed = now.signed_duration_since(started_at).num_seconds();
            if elapsed > node.timeout_seconds as i64 {
                let message = format!("SLA Timeout ({}s)", node.timeout_seconds);
                tracing::error!(node_id = %node.id, "sla violation");
                node.status = TaskStatus::Failed;
                node.completed_at = Some(now);
                node.error_log.push(message.clone());
                breached.push((node.id.clone(), message));
            }
        }
        for (node_id, message) in breached {
            tracker.errors.push(NodeError {
                node_id,
                error: message,
                timestamp: now,
            });
            self.persist(graph).await;
        }
    }

    async fn store_execution_memory(&self, graph: &TaskGraph, report: &GraphReport) {
        let snapshot = serde_json::to_value(graph).ok();
        let logs = report
            .execution_log
            .iter()
            .filter_map(|entry| serde_json::to_value(entry).ok())
            .collect();
        let errors = report
            .errors
            .iter()
            .filter_map(|error| serde_json::to_value(error).ok())
            .collect();

        let request = StoreMemoryRequest {
            category: "orchestrated_execution".to_string(),
            goal_summary: graph.goal_summary.clone(),
            task_graph_snapshot: snapshot,
            execution_logs: logs,
            errors,
            tags: vec![
                format!("risk:{}", graph.risk_level.as_str()),
                format!("status:{}", report.status.as_str()),
            ],
        };

        if let Err(err) = self.memory.store_execution(request).await {
            tracing::error!(graph_id = %graph.graph_id, error = %err, "failed to store execution memory");
        }
    }

    /// Snapshot persistence is best-effort: an unreachable store is logged
    /// and retried on the next status change.
    async fn persist(&self, graph: &TaskGraph) {
        let state_json = match serde_json::to_string(graph) {
            Ok(encoded) => encoded,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode graph snapshot");
                return;
            }
        };
        let row = GraphSnapshotRow {
            id: graph.graph_id.clone(),
            status: graph.status.as_str().to_string(),
            state_json,
            created_at: graph.created_at,
            updated_at: Utc::now(),
        };
        if let Err(err) = self.store.upsert_graph(row).await {
            tracing::error!(graph_id = %graph.graph_id, error = %err, "failed to persist graph state");
        }
    }

    fn record_task_outcome(&self, success: bool, duration_ms: f64) {
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.total_task_time_us
            .fetch_add((duration_ms * 1000.0) as u64, Ordering::Relaxed);
    }

    async fn publish(&self, event: Event) {
        if let Err(err) = self.bus.publish(event).await {
            tracing::warn!(error = %err, "failed to publish lifecycle event");
        }
    }
}

#[derive(Default)]
struct RunTracker {
    completed: Vec<String>,
    errors: Vec<NodeError>,
    log: Vec<ExecutionLogEntry>,
}

impl RunTracker {
    fn new() -> Self {
        Self::default()
    }
}

/// Executes one node through the handler runtime, owning the retry-delay
/// loop, post-success validation and streaming emission. Shared between the
/// orchestrator's local modes and the distributed worker.
#[derive(Clone)]
pub(crate) struct NodeExecutor {
    pub graph_id: String,
    pub registry: Arc<HandlerRegistry>,
    pub validation: Arc<ValidationService>,
    pub bus: Arc<EventBus>,
    pub ctx: SecurityContext,
    pub streaming: bool,
    pub sequence: Arc<AtomicU64>,
}

impl NodeExecutor {
    pub(crate) async fn execute(self, mut node: TaskNode) -> (TaskNode, Result<Value, HandlerError>) {
        self.emit_stream(&node.id, StreamKind::Status, json!({"status": "running"}))
            .await;

        let Some(runtime) = self.registry.get(node.agent_type) else {
            let message = format!("no handler registered for {}", node.agent_type);
            node.status = TaskStatus::Failed;
            node.error_log.push(message.clone());
            self.emit_stream(&node.id, StreamKind::Error, json!({"error": message}))
                .await;
            return (node, Err(HandlerError::failed(message)));
        };

        loop {
            match runtime.run(&mut node, &self.ctx).await {
                Ok(value) => {
                    if !node.validation_rule.trim().is_empty() {
                        let report = self.validation.validate_node(&mut node).await;
                        if !report.passed {
                            let message = format!("validation failed: {}", report.message);
                            node.status = TaskStatus::Failed;
                            node.error_log.push(message.clone());
                            self.emit_stream(
                                &node.id,
                                StreamKind::Error,
                                json!({"error": message}),
                            )
                            .await;
                            return (node, Err(HandlerError::ValidationFailed(report.message)));
                        }
                    }
                    self.emit_stream(&node.id, StreamKind::Output, value.clone())
                        .await;
                    return (node, Ok(value));
                }
                Err(_) if node.status == TaskStatus::Retry => {
                    // Attempts are 0-indexed; `retries` already counts the
                    // failed one. Whoever runs the node owns the sleep: the
                    // orchestrator in local modes, the worker in distributed.
                    let delay = retry_delay(&node.retry_config, node.retries.saturating_sub(1));
                    tracing::warn!(
                        node_id = %node.id,
                        attempt = node.retries,
                        delay_ms = delay.as_millis() as u64,
                        "node failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(err) => {
                    self.emit_stream(
                        &node.id,
                        StreamKind::Error,
                        json!({"error": err.to_string()}),
                    )
                    .await;
                    return (node, Err(err));
                }
            }
        }
    }

    pub(crate) async fn emit_stream(&self, node_id: &str, kind: StreamKind, data: Value) {
        if !self.streaming {
            return;
        }
        let update = StreamUpdate {
            update_id: Uuid::new_v4().to_string()[..8].to_string(),
            graph_id: self.graph_id.clone(),
            node_id: node_id.to_string(),
            kind,
            data,
            timestamp: Utc::now(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
        };
        let payload = match serde_json::to_value(&update) {
            Ok(payload) => payload,
            Err(_) => return,
        };
        let event = Event::new(format!("stream.{}", kind.as_str()), "orchestrator")
            .with_payload(payload);
        if let Err(err) = self.bus.publish(event).await {
            tracing::warn!(error = %err, "failed to publish stream update");
        }
    }
}

/// Collects distributed result events for one graph.
struct ResultCollector {
    graph_id: String,
    results: Arc<DashMap<String, Result<Value, String>>>,
    failure: bool,
}

#[async_trait::async_trait]
impl EventHandler for ResultCollector {
    fn name(&self) -> &str {
        "distributed_result_collector"
    }

    async fn handle(&self, event: Event) -> Result<(), TaskloomError> {
        if event.payload.get("graph_id").and_then(Value::as_str) != Some(self.graph_id.as_str()) {
            return Ok(());
        }
        let Some(node_id) = event.payload.get("node_id").and_then(Value::as_str) else {
            return Ok(());
        };

        let entry = if self.failure {
            Err(event
                .payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown remote failure")
                .to_string())
        } else {
            Ok(event
                .payload
                .get("result")
                .cloned()
                .unwrap_or(Value::Null))
        };
        self.results.insert(node_id.to_string(), entry);
        Ok(())
    }
}
