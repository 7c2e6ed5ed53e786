//! Handler runtime: wraps every handler invocation with the cross-cutting
//! concerns (circuit breaker, permission guard, lifecycle hooks, result
//! cache, metrics, billing) so handler bodies stay pure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};

use crate::billing::BillingGate;
use crate::breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::HandlerError;
use crate::events::{Event, EventBus};
use crate::graph::{HandlerKind, SecurityContext, TaskNode, TaskStatus};
use crate::metrics;
use crate::security::SecurityService;

/// A typed handler bound to nodes via their `agent_type`.
///
/// Handlers see one node at a time and return their output; the runtime
/// owns all status and bookkeeping mutations.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn kind(&self) -> HandlerKind;

    async fn execute(
        &self,
        node: &TaskNode,
        ctx: &SecurityContext,
    ) -> Result<Value, HandlerError>;

    /// Opt-in result caching: return a key derived from the inputs.
    fn cache_key(&self, _node: &TaskNode) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookStage {
    BeforeExecute,
    AfterExecute,
    OnSuccess,
    OnFailure,
    OnRetry,
}

#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn call(&self, node: &TaskNode, ctx: &SecurityContext);
}

#[derive(Debug, Clone, Serialize)]
pub struct HandlerStats {
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub avg_execution_time_ms: f64,
    pub breaker_state: &'static str,
    pub enabled: bool,
}

/// Per-handler wrapper owning the breaker, hooks, cache and counters.
pub struct HandlerRuntime {
    handler: Arc<dyn TaskHandler>,
    bus: Arc<EventBus>,
    security: Arc<SecurityService>,
    billing: Option<Arc<BillingGate>>,
    breaker: CircuitBreaker,
    hooks: RwLock<HashMap<HookStage, Vec<Arc<dyn LifecycleHook>>>>,
    cache: DashMap<String, Value>,
    enabled: AtomicBool,
    executions: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    total_time_us: AtomicU64,
}

impl HandlerRuntime {
    pub fn new(
        handler: Arc<dyn TaskHandler>,
        bus: Arc<EventBus>,
        security: Arc<SecurityService>,
        billing: Option<Arc<BillingGate>>,
    ) -> Self {
        let name = handler.kind().as_str();
        Self {
            handler,
            bus,
            security,
            billing,
            breaker: CircuitBreaker::new(name, CircuitBreakerConfig::default()),
            hooks: RwLock::new(HashMap::new()),
            cache: DashMap::new(),
            enabled: AtomicBool::new(true),
            executions: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            total_time_us: AtomicU64::new(0),
        }
    }

    pub fn kind(&self) -> HandlerKind {
        self.handler.kind()
    }

    pub fn register_hook(&self, stage: HookStage, hook: Arc<dyn LifecycleHook>) {
        self.hooks
            .write()
            .expect("hook lock")
            .entry(stage)
            .or_default()
            .push(hook);
    }

    async fn run_hooks(&self, stage: HookStage, node: &TaskNode, ctx: &SecurityContext) {
        let hooks: Vec<Arc<dyn LifecycleHook>> = self
            .hooks
            .read()
            .expect("hook lock")
            .get(&stage)
            .cloned()
            .unwrap_or_default();
        for hook in hooks {
            hook.call(node, ctx).await;
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn reset_breaker(&self) {
        self.breaker.reset();
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn stats(&self) -> HandlerStats {
        let executions = self.executions.load(Ordering::Relaxed);
        let total_us = self.total_time_us.load(Ordering::Relaxed);
        HandlerStats {
            executions,
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            avg_execution_time_ms: if executions == 0 {
                0.0
            } else {
                (total_us as f64 / executions as f64) / 1000.0
            },
            breaker_state: self.breaker.state().as_str(),
            enabled: self.enabled.load(Ordering::SeqCst),
        }
    }

    /// Execute one invocation under the full wrapper sequence. On success
    /// the node carries SUCCESS and its output; on a retryable failure the
    /// node carries RETRY and the caller schedules the delay; anything else
    /// leaves the node FAILED.
    pub async fn run(
        &self,
        node: &mut TaskNode,
        ctx: &SecurityContext,
    ) -> Result<Value, HandlerError> {
        if !self.enabled.load(Ordering::SeqCst) {
            node.status = TaskStatus::Failed;
            node.error_log.push("handler is disabled".to_string());
            return Err(HandlerError::Disabled);
        }

        if !self.breaker.should_allow() {
            // The breaker caused this failure; it is not counted against it.
            node.status = TaskStatus::Failed;
            node.error_log.push("circuit breaker is open".to_string());
            return Err(HandlerError::CircuitOpen);
        }

        if let Err(err) = self.security.enforce_permissions(node, ctx).await {
            node.status = TaskStatus::Failed;
            node.error_log.push(err.to_string());
            return Err(err);
        }

        self.run_hooks(HookStage::BeforeExecute, node, ctx).await;

        let started = Instant::now();
        node.status = TaskStatus::Running;
        node.started_at = Some(Utc::now());

        self.publish(
            Event::new(format!("task.{}.started", node.id), self.kind().as_str()).with_payload(
                json!({
                    "node_id": node.id,
                    "agent_type": self.kind(),
                }),
            ),
        )
        .await;

        let cache_key = self.handler.cache_key(node);
        let cached = cache_key
            .as_ref()
            .and_then(|key| self.cache.get(key).map(|v| v.clone()));

        let outcome = match cached {
            Some(value) => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(node_id = %node.id, "handler cache hit");
                Ok(value)
            }
            None => {
                let result = self.handler.execute(node, ctx).await;
                if let (Ok(value), Some(key)) = (&result, &cache_key) {
                    self.cache.insert(key.clone(), value.clone());
                }
                result
            }
        };

        let result = match outcome {
            Ok(value) => {
                self.breaker.record_success();
                self.successes.fetch_add(1, Ordering::Relaxed);
                node.status = TaskStatus::Success;
                node.output_data = value.clone();

                self.run_hooks(HookStage::OnSuccess, node, ctx).await;
                self.publish(
                    Event::new(format!("task.{}.completed", node.id), self.kind().as_str())
                        .with_payload(json!({
                            "node_id": node.id,
                            "status": "success",
                            "result": value,
                        })),
                )
                .await;
                Ok(value)
            }
            Err(err) => {
                self.breaker.record_failure();
                self.failures.fetch_add(1, Ordering::Relaxed);
                node.error_log.push(err.to_string());

                self.run_hooks(HookStage::OnFailure, node, ctx).await;

                if err.retryable() && node.retries < node.retry_config.max_retries {
                    node.retries += 1;
                    node.status = TaskStatus::Retry;
                    self.run_hooks(HookStage::OnRetry, node, ctx).await;
                    self.publish(
                        Event::new(format!("task.{}.retry", node.id), self.kind().as_str())
                            .with_payload(json!({
                                "node_id": node.id,
                                "retry_count": node.retries,
                                "error": err.to_string(),
                            })),
                    )
                    .await;
                } else {
                    node.status = TaskStatus::Failed;
                    self.publish(
                        Event::new(format!("task.{}.failed", node.id), self.kind().as_str())
                            .with_payload(json!({
                                "node_id": node.id,
                                "error": err.to_string(),
                            }))
                            .with_priority(1),
                    )
                    .await;
                }
                Err(err)
            }
        };

        // Tail bookkeeping runs on every attempt.
        let elapsed = started.elapsed();
        node.completed_at = Some(Utc::now());
        node.execution_time_ms = elapsed.as_secs_f64() * 1000.0;
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.total_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        self.run_hooks(HookStage::AfterExecute, node, ctx).await;
        metrics::record_task(
            self.kind().as_str(),
            result.is_ok(),
            node.execution_time_ms,
        );

        let mut charged = true;
        if let Some(billing) = &self.billing {
            match billing.debit_cycle(&ctx.user_id).await {
                Ok(ok) => charged = ok,
                Err(err) => {
                    tracing::warn!(error = %err, "billing debit errored");
                }
            }
        }

        match result {
            // The node completed, but the budget gate trips the graph.
            Ok(_) if !charged => Err(HandlerError::BudgetExceeded),
            other => other,
        }
    }

    async fn publish(&self, event: Event) {
        if let Err(err) = self.bus.publish(event).await {
            tracing::warn!(error = %err, "failed to publish task lifecycle event");
        }
    }
}

/// Registry of handler runtimes keyed by handler kind.
pub struct HandlerRegistry {
    bus: Arc<EventBus>,
    security: Arc<SecurityService>,
    billing: Option<Arc<BillingGate>>,
    cells: DashMap<HandlerKind, Arc<HandlerRuntime>>,
}

impl HandlerRegistry {
    pub fn new(bus: Arc<EventBus>, security: Arc<SecurityService>) -> Self {
        Self {
            bus,
            security,
            billing: None,
            cells: DashMap::new(),
        }
    }

    pub fn with_billing(mut self, billing: Arc<BillingGate>) -> Self {
        self.billing = Some(billing);
        self
    }

    pub fn register(&self, handler: Arc<dyn TaskHandler>) -> Arc<HandlerRuntime> {
        let kind = handler.kind();
        let runtime = Arc::new(HandlerRuntime::new(
            handler,
            self.bus.clone(),
            self.security.clone(),
            self.billing.clone(),
        ));
        self.cells.insert(kind, runtime.clone());
        tracing::info!(handler = %kind, "registered handler");
        runtime
    }

    pub fn get(&self, kind: HandlerKind) -> Option<Arc<HandlerRuntime>> {
        self.cells.get(&kind).map(|cell| cell.clone())
    }

    pub fn kinds(&self) -> Vec<HandlerKind> {
        self.cells.iter().map(|cell| *cell.key()).collect()
    }

    pub fn stats(&self) -> Vec<HandlerStats> {
        self.cells.iter().map(|cell| cell.stats()).collect()
    }
}
