//! Goal planning: turn a goal string into an executable task graph.
//!
//! The LLM-driven planner is an external collaborator; the core ships a
//! deterministic template planner behind the same trait so flows work
//! end-to-end without one.

use async_trait::async_trait;
use serde_json::json;

use crate::error::TaskloomError;
use crate::graph::{HandlerKind, SecurityContext, TaskGraph, TaskNode};

#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, goal: &str, ctx: &SecurityContext) -> Result<TaskGraph, TaskloomError>;
}

/// Three-stage template: research the goal, process the findings, validate
/// the result.
pub struct TemplatePlanner;

#[async_trait]
impl Planner for TemplatePlanner {
    async fn plan(&self, goal: &str, _ctx: &SecurityContext) -> Result<TaskGraph, TaskloomError> {
        tracing::info!(goal, "planning task graph");

        let mut graph = TaskGraph::new(goal);

        graph.add_node(
            TaskNode::new("research", HandlerKind::Research)
                .with_name("research")
                .with_description(format!("Research: {goal}"))
                .with_input(json!({"action": "search", "query": goal})),
        )?;
        graph.add_node(
            TaskNode::new("process", HandlerKind::DataProcessing)
                .with_name("process")
                .with_description(format!("Process findings for: {goal}"))
                .with_input(json!({"action": "transform"}))
                .with_dependency("research"),
        )?;
        graph.add_node(
            TaskNode::new("verify", HandlerKind::Validation)
                .with_name("verify")
                .with_description("Validate the processed output")
                .with_input(json!({
                    "action": "check",
                    "rule": "output.ok == true",
                    "value": {"ok": true},
                }))
                .with_dependency("process"),
        )?;

        graph.validate()?;
        tracing::debug!(node_count = graph.len(), "task graph constructed");
        Ok(graph)
    }
}
