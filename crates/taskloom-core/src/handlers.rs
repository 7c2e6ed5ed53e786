//! Handler adapters exposing the core services (security, validation,
//! memory, planning) as typed task handlers, plus a trivial echo handler
//! for demos and smoke tests.
//!
//! Each adapter decodes `input_data` into a typed action enum at the
//! boundary; no string dispatch reaches the service layer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::HandlerError;
use crate::graph::{HandlerKind, SecurityContext, TaskNode};
use crate::memory::{MemoryService, StoreMemoryRequest};
use crate::planner::Planner;
use crate::runtime::TaskHandler;
use crate::security::{AuditQuery, SecurityService};
use crate::validation::ValidationService;

fn decode<T: for<'de> Deserialize<'de>>(input: &Value) -> Result<T, HandlerError> {
    serde_json::from_value(input.clone())
        .map_err(|err| HandlerError::failed(format!("bad action payload: {err}")))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum SecurityAction {
    ValidatePermissions,
    CheckRateLimit,
    AssessRisk,
    CreateSession,
    VerifySession { session_id: String },
    AuditLog { user_id: Option<String> },
    BlockIp { ip: String },
    UnblockIp { ip: String },
}

pub struct SecurityHandler {
    service: Arc<SecurityService>,
}

impl SecurityHandler {
    pub fn new(service: Arc<SecurityService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl TaskHandler for SecurityHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Security
    }

    async fn execute(
        &self,
        node: &TaskNode,
        ctx: &SecurityContext,
    ) -> Result<Value, HandlerError> {
        match decode::<SecurityAction>(&node.input_data)? {
            SecurityAction::ValidatePermissions => {
                let check = self.service.validate_permissions(node, ctx).await;
                Ok(json!({
                    "valid": check.valid,
                    "missing_permissions": check.missing,
                    "required_permissions": check.required,
                }))
            }
            SecurityAction::CheckRateLimit => {
                let decision = self.service.check_rate_limit(ctx).await;
                serde_json::to_value(&decision)
                    .map_err(|err| HandlerError::failed(err.to_string()))
            }
            SecurityAction::AssessRisk => {
                let assessment = self
                    .service
                    .assess_risk(&node.required_permissions, ctx)
                    .await;
                serde_json::to_value(&assessment)
                    .map_err(|err| HandlerError::failed(err.to_string()))
            }
            SecurityAction::CreateSession => {
                let mut session_ctx = ctx.clone();
                let session = self.service.create_session(&mut session_ctx).await;
                serde_json::to_value(&session)
                    .map_err(|err| HandlerError::failed(err.to_string()))
            }
            SecurityAction::VerifySession { session_id } => {
                let check = self.service.verify_session(&session_id).await;
                serde_json::to_value(&check)
                    .map_err(|err| HandlerError::failed(err.to_string()))
            }
            SecurityAction::AuditLog { user_id } => {
                let entries = self.service.audit_entries(&AuditQuery {
                    user_id,
                    ..Default::default()
                });
                let count = entries.len();
                Ok(json!({"entries": entries, "count": count}))
            }
            SecurityAction::BlockIp { ip } => {
                self.service.block_ip(&ip);
                Ok(json!({"blocked": ip}))
            }
            SecurityAction::UnblockIp { ip } => {
                self.service.unblock_ip(&ip);
                Ok(json!({"unblocked": ip}))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ValidationAction {
    Check { rule: String, value: Option<Value> },
}

pub struct ValidationHandler {
    service: Arc<ValidationService>,
}

impl ValidationHandler {
    pub fn new(service: Arc<ValidationService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl TaskHandler for ValidationHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Validation
    }

    async fn execute(
        &self,
        node: &TaskNode,
        _ctx: &SecurityContext,
    ) -> Result<Value, HandlerError> {
        let ValidationAction::Check { rule, value } = decode(&node.input_data)?;

        // Validate the supplied value (or this node's own dependencies'
        // output passed through input) via a scratch node.
        let mut scratch = TaskNode::new(format!("{}-check", node.id), HandlerKind::Validation);
        scratch.validation_rule = rule;
        scratch.output_data = value.unwrap_or_else(|| node.output_data.clone());

        let report = self.service.validate_node(&mut scratch).await;
        Ok(json!({
            "valid": report.passed,
            "message": report.message,
            "expected": report.expected,
            "actual": report.actual,
            "suggestions": report.suggestions,
            "confidence": report.confidence_score,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum MemoryAction {
    Store {
        #[serde(default)]
        category: Option<String>,
        #[serde(default)]
        goal_summary: String,
        #[serde(default)]
        task_graph: Option<Value>,
        #[serde(default)]
        execution_logs: Vec<Value>,
        #[serde(default)]
        errors: Vec<Value>,
        #[serde(default)]
        tags: Vec<String>,
    },
    Recall {
        record_id: String,
    },
    Search {
        query: String,
        #[serde(default = "default_search_limit")]
        limit: usize,
    },
}

fn default_search_limit() -> usize {
    10
}

pub struct MemoryHandler {
    service: Arc<MemoryService>,
}

impl MemoryHandler {
    pub fn new(service: Arc<MemoryService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl TaskHandler for MemoryHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Memory
    }

    async fn execute(
        &self,
        node: &TaskNode,
        _ctx: &SecurityContext,
    ) -> Result<Value, HandlerError> {
        match decode::<MemoryAction>(&node.input_data)? {
            MemoryAction::Store {
                category,
                goal_summary,
                task_graph,
                execution_logs,
                errors,
                tags,
            } => {
                let record_id = self
                    .service
                    .store_execution(StoreMemoryRequest {
                        category: category.unwrap_or_else(|| "general".to_string()),
                        goal_summary,
                        task_graph_snapshot: task_graph,
                        execution_logs,
                        errors,
                        tags,
                    })
                    .await
                    .map_err(|err| HandlerError::failed(err.to_string()))?;
                Ok(json!({"stored": true, "record_id": record_id}))
            }
            MemoryAction::Recall { record_id } => {
                let record = self
                    .service
                    .recall(&record_id)
                    .await
                    .map_err(|err| HandlerError::failed(err.to_string()))?;
                match record {
                    Some(data) => Ok(json!({"found": true, "record": data})),
                    None => Ok(json!({"found": false})),
                }
            }
            MemoryAction::Search { query, limit } => {
                let hits = self
                    .service
                    .search(&query, limit)
                    .await
                    .map_err(|err| HandlerError::failed(err.to_string()))?;
                Ok(json!({"query": query, "count": hits.len(), "results": hits}))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlanRequest {
    goal: String,
}

pub struct PlannerHandler {
    planner: Arc<dyn Planner>,
}

impl PlannerHandler {
    pub fn new(planner: Arc<dyn Planner>) -> Self {
        Self { planner }
    }
}

#[async_trait]
impl TaskHandler for PlannerHandler {
    fn kind(&self) -> HandlerKind {
        HandlerKind::Planner
    }

    async fn execute(
        &self,
        node: &TaskNode,
        ctx: &SecurityContext,
    ) -> Result<Value, HandlerError> {
        let request: PlanRequest = decode(&node.input_data)?;
        let graph = self
            .planner
            .plan(&request.goal, ctx)
            .await
            .map_err(|err| HandlerError::failed(err.to_string()))?;
        let encoded =
            serde_json::to_value(&graph).map_err(|err| HandlerError::failed(err.to_string()))?;
        Ok(json!({
            "status": "planned",
            "graph_id": graph.graph_id,
            "graph": encoded,
        }))
    }
}

/// Returns its input plus `{"ok": true}`; handy for demos and wiring tests.
pub struct EchoHandler {
    kind: HandlerKind,
}

impl EchoHandler {
    pub fn new(kind: HandlerKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl TaskHandler for EchoHandler {
    fn kind(&self) -> HandlerKind {
        self.kind
    }

    async fn execute(
        &self,
        node: &TaskNode,
        _ctx: &SecurityContext,
    ) -> Result<Value, HandlerError> {
        Ok(json!({"ok": true, "echo": node.input_data}))
    }
}
