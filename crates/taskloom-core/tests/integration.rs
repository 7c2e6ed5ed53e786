//! End-to-end scenarios across the orchestration substrate: the execution
//! modes, retry behavior, policy enforcement, event delivery and the
//! distributed queue/worker round trip.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{Value, json};
use taskloom_core::broker::MemoryBroker;
use taskloom_core::config::Config;
use taskloom_core::error::HandlerError;
use taskloom_core::events::{BusConfig, Event, EventBus};
use taskloom_core::graph::{
    ExecutionMode, HandlerKind, PermissionScope, RetryConfig, RetryStrategy, SecurityContext,
    TaskGraph, TaskNode, TaskStatus,
};
use taskloom_core::orchestrator::{GraphStatus, Orchestrator};
use taskloom_core::queue::{MemoryTaskQueue, TaskQueue};
use taskloom_core::runtime::TaskHandler;
use taskloom_core::security::AuditQuery;
use taskloom_core::worker::Worker;

struct CountingEcho {
    kind: HandlerKind,
    calls: AtomicUsize,
}

impl CountingEcho {
    fn new(kind: HandlerKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TaskHandler for CountingEcho {
    fn kind(&self) -> HandlerKind {
        self.kind
    }

    async fn execute(
        &self,
        node: &TaskNode,
        _ctx: &SecurityContext,
    ) -> Result<Value, HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"ok": true, "echo": node.input_data}))
    }
}

struct SleepyHandler;

#[async_trait]
impl TaskHandler for SleepyHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::DataProcessing
    }

    async fn execute(
        &self,
        _node: &TaskNode,
        _ctx: &SecurityContext,
    ) -> Result<Value, HandlerError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(json!({"ok": true}))
    }
}

/// Fails the first `fail_times` attempts, then succeeds.
struct FlakyHandler {
    fail_times: usize,
    calls: AtomicUsize,
}

impl FlakyHandler {
    fn new(fail_times: usize) -> Arc<Self> {
        Arc::new(Self {
            fail_times,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Api
    }

    async fn execute(
        &self,
        _node: &TaskNode,
        _ctx: &SecurityContext,
    ) -> Result<Value, HandlerError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_times {
            return Err(HandlerError::failed("simulated transient failure"));
        }
        Ok(json!({"ok": true, "attempt": call}))
    }
}

fn trusted_ctx() -> SecurityContext {
    SecurityContext::new("integration-user")
        .authenticated()
        .with_scopes(vec![
            PermissionScope::Read,
            PermissionScope::Write,
            PermissionScope::Execute,
        ])
}

fn echo_node(id: &str, kind: HandlerKind) -> TaskNode {
    TaskNode::new(id, kind).with_input(json!({"from": id}))
}

async fn fresh_orchestrator() -> Orchestrator {
    let orchestrator = Orchestrator::builder(Config::default()).build();
    orchestrator.start();
    orchestrator
}

#[tokio::test]
async fn sequential_two_node_success() {
    let orchestrator = fresh_orchestrator().await;
    orchestrator.register_handler(CountingEcho::new(HandlerKind::Research));

    let mut graph = TaskGraph::new("two step echo");
    graph
        .add_node(echo_node("a", HandlerKind::Research))
        .unwrap();
    graph
        .add_node(echo_node("b", HandlerKind::Research).with_dependency("a"))
        .unwrap();
    let graph_id = graph.graph_id.clone();

    let report = orchestrator
        .process_goal(graph, trusted_ctx())
        .await
        .unwrap();

    assert_eq!(report.status, GraphStatus::Success);
    assert_eq!(report.completed_nodes, vec!["a", "b"]);
    assert!(report.errors.is_empty());

    // The snapshot in the store reflects both terminal states and the
    // dependency happens-before edge.
    let row = orchestrator
        .store()
        .load_graph(&graph_id)
        .await
        .unwrap()
        .expect("snapshot persisted");
    let decoded: TaskGraph = serde_json::from_str(&row.state_json).unwrap();
    let a = decoded.node("a").unwrap();
    let b = decoded.node("b").unwrap();
    assert_eq!(a.status, TaskStatus::Success);
    assert_eq!(b.status, TaskStatus::Success);
    assert!(b.started_at.unwrap() >= a.completed_at.unwrap());
    assert_eq!(a.output_data["ok"], true);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn parallel_fan_out_is_concurrent_and_bounded() {
    // Three 100 ms nodes at fan-out 3 finish well under the serial time.
    let orchestrator = fresh_orchestrator().await;
    orchestrator.register_handler(Arc::new(SleepyHandler));

    let mut graph = TaskGraph::new("parallel sleeps")
        .with_mode(ExecutionMode::Parallel)
        .with_max_parallel(3);
    for id in ["s1", "s2", "s3"] {
        graph
            .add_node(echo_node(id, HandlerKind::DataProcessing))
            .unwrap();
    }

    let report = orchestrator
        .process_goal(graph, trusted_ctx())
        .await
        .unwrap();
    assert_eq!(report.status, GraphStatus::Success);
    assert!(
        report.execution_time_seconds < 0.25,
        "parallel run took {}s",
        report.execution_time_seconds
    );

    // The same shape at fan-out 1 degrades to serial latency.
    let mut serial = TaskGraph::new("serial sleeps")
        .with_mode(ExecutionMode::Parallel)
        .with_max_parallel(1);
    for id in ["s1", "s2", "s3"] {
        serial
            .add_node(echo_node(id, HandlerKind::DataProcessing))
            .unwrap();
    }
    let report = orchestrator
        .process_goal(serial, trusted_ctx())
        .await
        .unwrap();
    assert!(
        report.execution_time_seconds >= 0.3,
        "serial run took {}s",
        report.execution_time_seconds
    );

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn retry_to_success_with_exponential_delays() {
    let orchestrator = fresh_orchestrator().await;
    let handler = FlakyHandler::new(2);
    orchestrator.register_handler(handler.clone());

    let mut graph = TaskGraph::new("flaky api call");
    graph
        .add_node(
            echo_node("flaky", HandlerKind::Api).with_retry_config(RetryConfig {
                max_retries: 2,
                strategy: RetryStrategy::ExponentialBackoff,
                initial_delay_seconds: 0.1,
                max_delay_seconds: 60.0,
                backoff_multiplier: 2.0,
                jitter: false,
            }),
        )
        .unwrap();
    let graph_id = graph.graph_id.clone();

    let started = Instant::now();
    let report = orchestrator
        .process_goal(graph, trusted_ctx())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.status, GraphStatus::Success);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    // Sleeps of ~0.1 s then ~0.2 s are observable in the wall clock.
    assert!(elapsed >= Duration::from_millis(290), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(3), "elapsed {elapsed:?}");

    let row = orchestrator
        .store()
        .load_graph(&graph_id)
        .await
        .unwrap()
        .unwrap();
    let decoded: TaskGraph = serde_json::from_str(&row.state_json).unwrap();
    let node = decoded.node("flaky").unwrap();
    assert_eq!(node.status, TaskStatus::Success);
    assert_eq!(node.retries, 2);
    assert_eq!(node.error_log.len(), 2);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn permission_denied_skips_handler_and_audits() {
    let orchestrator = fresh_orchestrator().await;
    let handler = CountingEcho::new(HandlerKind::Shell);
    orchestrator.register_handler(handler.clone());

    let mut graph = TaskGraph::new("locked down");
    graph
        .add_node(
            echo_node("locked", HandlerKind::Shell)
                .with_permissions(vec![PermissionScope::Admin]),
        )
        .unwrap();

    let ctx = SecurityContext::new("restricted-user")
        .authenticated()
        .with_scopes(vec![PermissionScope::Read]);

    let report = orchestrator.process_goal(graph, ctx).await.unwrap();

    assert_eq!(report.status, GraphStatus::Failed);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].error.contains("permission denied"));

    let denied = orchestrator.security().audit_entries(&AuditQuery {
        action: Some("permission_check".to_string()),
        ..Default::default()
    });
    assert_eq!(denied.len(), 1);
    assert!(!denied[0].allowed);

    // The audit decision is also on the bus.
    let audit_events = orchestrator.bus().history(Some("security.audit"), 100);
    assert!(
        audit_events
            .iter()
            .any(|e| e.payload["action"] == "permission_check" && e.payload["allowed"] == false)
    );

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn rate_limit_denies_the_sixth_request() {
    let mut config = Config::default();
    config.security.max_requests_per_hour = 5;
    let orchestrator = Orchestrator::builder(config).build();

    let security = orchestrator.security();
    let ctx = SecurityContext::new("limited-user").authenticated();

    for i in 0..5 {
        assert!(
            security.check_rate_limit(&ctx).await.allowed,
            "request {i} should be allowed"
        );
    }
    let denied = security.check_rate_limit(&ctx).await;
    assert!(!denied.allowed);
    let retry_after = denied.retry_after_seconds.unwrap();
    assert!(
        (700.0..=725.0).contains(&retry_after),
        "retry_after {retry_after}"
    );
}

#[tokio::test]
async fn wildcard_subscription_sees_priority_order() {
    let bus = EventBus::new(BusConfig::default());
    let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.subscribe_fn("task.*", "observer", move |event| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(event.event_type);
            Ok(())
        }
    });

    bus.publish(Event::new("task.started", "test").with_priority(1))
        .await
        .unwrap();
    bus.publish(Event::new("task.completed", "test").with_priority(10))
        .await
        .unwrap();
    bus.publish(Event::new("other.event", "test").with_priority(5))
        .await
        .unwrap();

    bus.start();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["task.completed".to_string(), "task.started".to_string()]
    );
    bus.shutdown().await;
}

#[tokio::test]
async fn distributed_happy_path_through_queue_and_worker() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = Arc::new(MemoryTaskQueue::new());

    let mut config = Config::default();
    config.orchestrator.distributed = true;
    let orchestrator = Orchestrator::builder(config)
        .with_broker(broker)
        .with_queue(queue.clone())
        .build();
    orchestrator.register_handler(CountingEcho::new(HandlerKind::Research));
    orchestrator.start();

    let worker = Worker::new(
        "worker-1",
        orchestrator.queue(),
        orchestrator.bus(),
        orchestrator.registry(),
        orchestrator.validation(),
    );
    let worker_handle = worker.shutdown_handle();
    let worker_task = tokio::spawn(async move { worker.run().await });

    let mut graph = TaskGraph::new("distributed echo").with_mode(ExecutionMode::Distributed);
    graph
        .add_node(echo_node("a", HandlerKind::Research))
        .unwrap();
    graph
        .add_node(echo_node("b", HandlerKind::Research).with_dependency("a"))
        .unwrap();
    let graph_id = graph.graph_id.clone();

    let report = tokio::time::timeout(
        Duration::from_secs(30),
        orchestrator.process_goal(graph, trusted_ctx()),
    )
    .await
    .expect("distributed run finishes")
    .unwrap();

    assert_eq!(report.status, GraphStatus::Success);
    assert_eq!(report.completed_nodes, vec!["a", "b"]);

    let row = orchestrator
        .store()
        .load_graph(&graph_id)
        .await
        .unwrap()
        .unwrap();
    let decoded: TaskGraph = serde_json::from_str(&row.state_json).unwrap();
    assert_eq!(decoded.node("a").unwrap().status, TaskStatus::Success);
    assert_eq!(decoded.node("b").unwrap().status, TaskStatus::Success);

    // Queue fully drained: nothing pending, nothing stuck on processing.
    // The worker acks the payload just after publishing its result, so give
    // that final step a beat.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(queue.len().await.unwrap(), 0);
    assert_eq!(queue.processing_len(), 0);

    let _ = worker_handle.send(true);
    worker_task.await.unwrap().unwrap();
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn distributed_budget_exhaustion_leaves_partial_failure() {
    let broker = Arc::new(MemoryBroker::new());
    let queue = Arc::new(MemoryTaskQueue::new());

    let mut config = Config::default();
    config.orchestrator.distributed = true;
    config.orchestrator.max_credits = 1.0;
    let orchestrator = Orchestrator::builder(config)
        .with_broker(broker)
        .with_queue(queue.clone())
        .build();
    orchestrator.register_handler(CountingEcho::new(HandlerKind::Research));
    orchestrator.start();

    let worker = Worker::new(
        "worker-1",
        orchestrator.queue(),
        orchestrator.bus(),
        orchestrator.registry(),
        orchestrator.validation(),
    );
    let worker_handle = worker.shutdown_handle();
    let worker_task = tokio::spawn(async move { worker.run().await });

    let mut graph = TaskGraph::new("budget bound").with_mode(ExecutionMode::Distributed);
    graph
        .add_node(echo_node("first", HandlerKind::Research))
        .unwrap();
    graph
        .add_node(echo_node("second", HandlerKind::Research).with_dependency("first"))
        .unwrap();
    let graph_id = graph.graph_id.clone();

    let report = tokio::time::timeout(
        Duration::from_secs(30),
        orchestrator.process_goal(graph, trusted_ctx()),
    )
    .await
    .expect("budget-bound run finishes")
    .unwrap();

    assert_eq!(report.status, GraphStatus::PartialFailure);
    assert_eq!(report.completed_nodes, vec!["first"]);
    assert!(
        report
            .errors
            .iter()
            .any(|e| e.node_id == "GLOBAL" && e.error == "Cost budget exceeded")
    );

    let row = orchestrator
        .store()
        .load_graph(&graph_id)
        .await
        .unwrap()
        .unwrap();
    let decoded: TaskGraph = serde_json::from_str(&row.state_json).unwrap();
    assert_eq!(decoded.node("first").unwrap().status, TaskStatus::Success);
    assert_eq!(decoded.node("second").unwrap().status, TaskStatus::Pending);

    let _ = worker_handle.send(true);
    worker_task.await.unwrap().unwrap();
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn streaming_mode_emits_ordered_updates() {
    let orchestrator = fresh_orchestrator().await;
    orchestrator.register_handler(CountingEcho::new(HandlerKind::Research));

    let updates: Arc<std::sync::Mutex<Vec<Value>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = updates.clone();
    orchestrator
        .bus()
        .subscribe_fn("stream.*", "stream_observer", move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(event.payload);
                Ok(())
            }
        });

    let mut graph = TaskGraph::new("streamed").with_mode(ExecutionMode::Streaming);
    graph
        .add_node(echo_node("a", HandlerKind::Research))
        .unwrap();
    graph
        .add_node(echo_node("b", HandlerKind::Research).with_dependency("a"))
        .unwrap();

    let report = orchestrator
        .process_goal(graph, trusted_ctx())
        .await
        .unwrap();
    assert_eq!(report.status, GraphStatus::Success);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let updates = updates.lock().unwrap();
    assert!(updates.len() >= 4, "expected stream updates, got {updates:?}");

    // Sequence numbers increase monotonically per graph.
    let sequences: Vec<u64> = updates
        .iter()
        .filter_map(|u| u.get("sequence").and_then(Value::as_u64))
        .collect();
    let mut sorted = sequences.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sequences.len(), sorted.len());

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn failed_dependency_strands_downstream_nodes() {
    let orchestrator = fresh_orchestrator().await;
    orchestrator.register_handler(FlakyHandler::new(usize::MAX));

    let mut graph = TaskGraph::new("doomed chain");
    let mut failing = echo_node("broken", HandlerKind::Api);
    failing.retry_config.max_retries = 0;
    graph.add_node(failing).unwrap();
    graph
        .add_node(echo_node("downstream", HandlerKind::Api).with_dependency("broken"))
        .unwrap();
    let graph_id = graph.graph_id.clone();

    let report = orchestrator
        .process_goal(graph, trusted_ctx())
        .await
        .unwrap();

    assert_eq!(report.status, GraphStatus::Failed);
    assert!(report.completed_nodes.is_empty());
    assert_eq!(report.errors.len(), 1);

    let row = orchestrator
        .store()
        .load_graph(&graph_id)
        .await
        .unwrap()
        .unwrap();
    let decoded: TaskGraph = serde_json::from_str(&row.state_json).unwrap();
    assert_eq!(decoded.node("broken").unwrap().status, TaskStatus::Failed);
    assert_eq!(
        decoded.node("downstream").unwrap().status,
        TaskStatus::Pending
    );

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn validation_rule_failure_fails_the_node_without_retry() {
    let orchestrator = fresh_orchestrator().await;
    let handler = CountingEcho::new(HandlerKind::Research);
    orchestrator.register_handler(handler.clone());

    let mut graph = TaskGraph::new("validated");
    graph
        .add_node(
            echo_node("checked", HandlerKind::Research)
                .with_validation_rule("output.nonexistent == 1"),
        )
        .unwrap();

    let report = orchestrator
        .process_goal(graph, trusted_ctx())
        .await
        .unwrap();

    assert_eq!(report.status, GraphStatus::Failed);
    // One invocation: validation failures are terminal, never retried.
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert!(report.errors[0].error.contains("validation failed"));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn tier_limit_rejects_oversize_graphs() {
    let orchestrator = fresh_orchestrator().await;
    orchestrator.register_handler(CountingEcho::new(HandlerKind::Research));

    // Free tier allows 5 nodes per graph.
    let mut graph = TaskGraph::new("too big");
    for i in 0..6 {
        graph
            .add_node(echo_node(&format!("n{i}"), HandlerKind::Research))
            .unwrap();
    }

    let err = orchestrator
        .process_goal(graph, trusted_ctx())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("tier limit"));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn execution_memory_is_searchable_after_completion() {
    let orchestrator = fresh_orchestrator().await;
    orchestrator.register_handler(CountingEcho::new(HandlerKind::Research));

    let mut graph = TaskGraph::new("index the service inventory");
    graph
        .add_node(echo_node("only", HandlerKind::Research))
        .unwrap();

    orchestrator
        .process_goal(graph, trusted_ctx())
        .await
        .unwrap();

    let hits = orchestrator
        .memory()
        .search("index the service inventory", 5)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].data["category"], "orchestrated_execution");
    assert!(
        hits[0].data["context_tags"]
            .as_array()
            .unwrap()
            .iter()
            .any(|t| t == "status:success")
    );

    orchestrator.shutdown().await;
}
