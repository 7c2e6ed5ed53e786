//! Task graph data model: nodes, statuses, policies and the DAG itself.
//!
//! A [`TaskGraph`] is an insertion-ordered collection of [`TaskNode`]s with
//! dependency edges between them. The orchestrator owns an in-flight graph
//! exclusively; handlers only ever see one node at a time.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::TaskloomError;

/// Risk classification for graphs and nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        }
    }
}

/// Task lifecycle states.
///
/// SUCCESS, FAILED, CANCELLED and TIMEOUT are terminal. RETRY is transient
/// and is always followed by RUNNING within the same run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Success,
    Retry,
    Failed,
    Cancelled,
    Escalated,
    Paused,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled | TaskStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Retry => "retry",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Escalated => "escalated",
            TaskStatus::Paused => "paused",
            TaskStatus::Timeout => "timeout",
        }
    }
}

/// The fixed set of handler kinds a node can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    Planner,
    Research,
    Code,
    DevOps,
    Browser,
    Shell,
    FileSystem,
    Api,
    DataProcessing,
    Scheduler,
    Memory,
    Validation,
    Monitor,
    Security,
    Notifier,
    Database,
    Ml,
}

impl HandlerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerKind::Planner => "planner",
            HandlerKind::Research => "research",
            HandlerKind::Code => "code",
            HandlerKind::DevOps => "dev_ops",
            HandlerKind::Browser => "browser",
            HandlerKind::Shell => "shell",
            HandlerKind::FileSystem => "file_system",
            HandlerKind::Api => "api",
            HandlerKind::DataProcessing => "data_processing",
            HandlerKind::Scheduler => "scheduler",
            HandlerKind::Memory => "memory",
            HandlerKind::Validation => "validation",
            HandlerKind::Monitor => "monitor",
            HandlerKind::Security => "security",
            HandlerKind::Notifier => "notifier",
            HandlerKind::Database => "database",
            HandlerKind::Ml => "ml",
        }
    }
}

impl std::fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Permission scopes a node can require and a context can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    Read,
    Write,
    Execute,
    Delete,
    Admin,
    Network,
    Secret,
    Database,
}

impl PermissionScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionScope::Read => "read",
            PermissionScope::Write => "write",
            PermissionScope::Execute => "execute",
            PermissionScope::Delete => "delete",
            PermissionScope::Admin => "admin",
            PermissionScope::Network => "network",
            PermissionScope::Secret => "secret",
            PermissionScope::Database => "database",
        }
    }
}

/// Delay strategies for retrying transient handler failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed,
    Linear,
    ExponentialBackoff,
    Fibonacci,
    Adaptive,
}

/// Per-node retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "RetryConfig::default_strategy")]
    pub strategy: RetryStrategy,
    #[serde(default = "RetryConfig::default_initial_delay")]
    pub initial_delay_seconds: f64,
    #[serde(default = "RetryConfig::default_max_delay")]
    pub max_delay_seconds: f64,
    #[serde(default = "RetryConfig::default_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "RetryConfig::default_jitter")]
    pub jitter: bool,
}

impl RetryConfig {
    const fn default_max_retries() -> u32 {
        3
    }

    const fn default_strategy() -> RetryStrategy {
        RetryStrategy::ExponentialBackoff
    }

    const fn default_initial_delay() -> f64 {
        1.0
    }

    const fn default_max_delay() -> f64 {
        60.0
    }

    const fn default_multiplier() -> f64 {
        2.0
    }

    const fn default_jitter() -> bool {
        true
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::default_max_retries(),
            strategy: Self::default_strategy(),
            initial_delay_seconds: Self::default_initial_delay(),
            max_delay_seconds: Self::default_max_delay(),
            backoff_multiplier: Self::default_multiplier(),
            jitter: Self::default_jitter(),
        }
    }
}

/// How a graph's ready nodes are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    Parallel,
    Distributed,
    Streaming,
}

fn default_timeout_seconds() -> u64 {
    300
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A single unit of work bound to a typed handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub agent_type: HandlerKind,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub required_permissions: Vec<PermissionScope>,
    #[serde(default)]
    pub validation_rule: String,
    #[serde(default = "empty_object")]
    pub input_data: Value,
    #[serde(default = "empty_object")]
    pub output_data: Value,
    #[serde(default = "TaskNode::default_status")]
    pub status: TaskStatus,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub retry_config: RetryConfig,
    #[serde(default)]
    pub error_log: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_time_ms: f64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl TaskNode {
    const fn default_status() -> TaskStatus {
        TaskStatus::Pending
    }

    pub fn new(id: impl Into<String>, agent_type: HandlerKind) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: String::new(),
            agent_type,
            dependencies: Vec::new(),
            required_permissions: Vec::new(),
            validation_rule: String::new(),
            input_data: empty_object(),
            output_data: empty_object(),
            status: TaskStatus::Pending,
            retries: 0,
            retry_config: RetryConfig::default(),
            error_log: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            execution_time_ms: 0.0,
            timeout_seconds: default_timeout_seconds(),
            priority: 0,
            tags: Vec::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_dependency(mut self, dep_id: impl Into<String>) -> Self {
        self.dependencies.push(dep_id.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input_data = input;
        self
    }

    pub fn with_permissions(mut self, scopes: Vec<PermissionScope>) -> Self {
        self.required_permissions = scopes;
        self
    }

    pub fn with_validation_rule(mut self, rule: impl Into<String>) -> Self {
        self.validation_rule = rule.into();
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = config;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// A directed acyclic graph of task nodes, insertion-ordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGraph {
    pub graph_id: String,
    #[serde(default)]
    pub goal_summary: String,
    #[serde(default = "TaskGraph::default_risk")]
    pub risk_level: RiskLevel,
    nodes: Vec<TaskNode>,
    #[serde(default = "TaskNode::default_status")]
    pub status: TaskStatus,
    #[serde(default = "TaskGraph::default_mode")]
    pub execution_mode: ExecutionMode,
    #[serde(default = "TaskGraph::default_max_parallel")]
    pub max_parallel_tasks: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

impl TaskGraph {
    const fn default_risk() -> RiskLevel {
        RiskLevel::Low
    }

    const fn default_mode() -> ExecutionMode {
        ExecutionMode::Sequential
    }

    const fn default_max_parallel() -> usize {
        5
    }

    pub fn new(goal_summary: impl Into<String>) -> Self {
        Self {
            graph_id: Uuid::new_v4().to_string(),
            goal_summary: goal_summary.into(),
            risk_level: RiskLevel::Low,
            nodes: Vec::new(),
            status: TaskStatus::Pending,
            execution_mode: ExecutionMode::Sequential,
            max_parallel_tasks: Self::default_max_parallel(),
            created_at: Utc::now(),
            metadata: empty_object(),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel_tasks = max.max(1);
        self
    }

    /// Add a node. Rejects duplicate ids and dependencies on unknown nodes,
    /// so a graph built through this method is referentially complete.
    pub fn add_node(&mut self, node: TaskNode) -> Result<(), TaskloomError> {
        if self.nodes.iter().any(|n| n.id == node.id) {
            return Err(TaskloomError::Graph(format!(
                "node '{}' already exists",
                node.id
            )));
        }
        for dep in &node.dependencies {
            if !self.nodes.iter().any(|n| &n.id == dep) {
                return Err(TaskloomError::Graph(format!(
                    "dependency '{}' not found for node '{}'",
                    dep, node.id
                )));
            }
        }
        self.nodes.push(node);
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut TaskNode> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.iter()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut TaskNode> {
        self.nodes.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Replace a node wholesale; used when merging results of detached
    /// execution back into the graph.
    pub fn put_node(&mut self, node: TaskNode) {
        if let Some(slot) = self.nodes.iter_mut().find(|n| n.id == node.id) {
            *slot = node;
        } else {
            self.nodes.push(node);
        }
    }

    /// Validate acyclicity via Kahn's algorithm.
    pub fn validate(&self) -> Result<(), TaskloomError> {
        let mut in_degree: HashMap<&str, usize> = self
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.dependencies.len()))
            .collect();

        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for node in &self.nodes {
            for dep in &node.dependencies {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(node.id.as_str());
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut visited = 0usize;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            if let Some(children) = dependents.get(id) {
                for child in children {
                    let deg = in_degree.get_mut(child).expect("child node exists");
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }

        if visited != self.nodes.len() {
            return Err(TaskloomError::Graph("graph contains a cycle".to_string()));
        }
        Ok(())
    }

    /// PENDING nodes whose dependencies have all reached SUCCESS, sorted by
    /// priority descending. The sort is stable so arrival order is preserved
    /// among equal priorities.
    pub fn ready_nodes(&self) -> Vec<&TaskNode> {
        let done: HashSet<&str> = self
            .nodes
            .iter()
            .filter(|n| n.status == TaskStatus::Success)
            .map(|n| n.id.as_str())
            .collect();

        let mut ready: Vec<&TaskNode> = self
            .nodes
            .iter()
            .filter(|n| n.status == TaskStatus::Pending)
            .filter(|n| n.dependencies.iter().all(|d| done.contains(d.as_str())))
            .collect();
        ready.sort_by_key(|n| std::cmp::Reverse(n.priority));
        ready
    }

    /// True once every node has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        self.nodes.iter().all(|n| n.status.is_terminal())
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.nodes.iter().filter(|n| n.status == status).count()
    }
}

/// Per-request security envelope carried alongside a graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityContext {
    pub session_id: String,
    pub user_id: String,
    #[serde(default)]
    pub origin_ip: Option<String>,
    #[serde(default)]
    pub allowed_scopes: Vec<PermissionScope>,
    #[serde(default)]
    pub is_authenticated: bool,
    #[serde(default)]
    pub mfa_verified: bool,
    #[serde(default)]
    pub rate_limit_remaining: i64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub audit_trail: Vec<String>,
}

impl SecurityContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            origin_ip: None,
            allowed_scopes: Vec::new(),
            is_authenticated: false,
            mfa_verified: false,
            rate_limit_remaining: 0,
            expires_at: None,
            audit_trail: Vec::new(),
        }
    }

    /// Fully-trusted context used by internal maintenance flows.
    pub fn system() -> Self {
        let mut ctx = Self::new("system_orchestrator");
        ctx.is_authenticated = true;
        ctx.mfa_verified = true;
        ctx.allowed_scopes = vec![
            PermissionScope::Read,
            PermissionScope::Write,
            PermissionScope::Execute,
            PermissionScope::Admin,
        ];
        ctx
    }

    pub fn with_scopes(mut self, scopes: Vec<PermissionScope>) -> Self {
        self.allowed_scopes = scopes;
        self
    }

    pub fn with_origin_ip(mut self, ip: impl Into<String>) -> Self {
        self.origin_ip = Some(ip.into());
        self
    }

    pub fn authenticated(mut self) -> Self {
        self.is_authenticated = true;
        self
    }

    pub fn record(&mut self, entry: impl Into<String>) {
        self.audit_trail.push(entry.into());
    }
}

/// Snapshot of an execution memory kept for learning and recall.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub record_id: String,
    pub category: String,
    pub goal_summary: String,
    #[serde(default)]
    pub task_graph_snapshot: Option<Value>,
    #[serde(default)]
    pub execution_logs: Vec<Value>,
    #[serde(default)]
    pub errors_and_resolutions: Vec<Value>,
    #[serde(default)]
    pub context_tags: Vec<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub ttl_hours: Option<u32>,
}

/// Real-time execution update emitted in streaming mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamUpdate {
    pub update_id: String,
    pub graph_id: String,
    pub node_id: String,
    pub kind: StreamKind,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Progress,
    Output,
    Error,
    Status,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Progress => "progress",
            StreamKind::Output => "output",
            StreamKind::Error => "error",
            StreamKind::Status => "status",
        }
    }
}

/// One line of the per-graph execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub graph_id: String,
    pub node_id: String,
    pub agent_type: HandlerKind,
    pub action: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub duration_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> TaskNode {
        TaskNode::new(id, HandlerKind::Research)
    }

    #[test]
    fn add_node_rejects_duplicates_and_unknown_deps() {
        let mut graph = TaskGraph::new("test");
        graph.add_node(node("a")).unwrap();

        let dup = node("a");
        assert!(graph.add_node(dup).is_err());

        let dangling = node("b").with_dependency("missing");
        assert!(graph.add_node(dangling).is_err());
    }

    #[test]
    fn validate_accepts_linear_chain() {
        let mut graph = TaskGraph::new("chain");
        graph.add_node(node("a")).unwrap();
        graph.add_node(node("b").with_dependency("a")).unwrap();
        graph.add_node(node("c").with_dependency("b")).unwrap();
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn ready_nodes_respect_dependencies_and_priority() {
        let mut graph = TaskGraph::new("ready");
        graph.add_node(node("low").with_priority(1)).unwrap();
        graph.add_node(node("high").with_priority(10)).unwrap();
        graph
            .add_node(node("blocked").with_dependency("low"))
            .unwrap();

        let ready: Vec<&str> = graph.ready_nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ready, vec!["high", "low"]);

        graph.node_mut("low").unwrap().status = TaskStatus::Success;
        graph.node_mut("high").unwrap().status = TaskStatus::Success;
        let ready: Vec<&str> = graph.ready_nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ready, vec!["blocked"]);
    }

    #[test]
    fn graph_snapshot_round_trips() {
        let mut graph = TaskGraph::new("round trip").with_mode(ExecutionMode::Parallel);
        graph
            .add_node(
                node("a")
                    .with_priority(3)
                    .with_permissions(vec![PermissionScope::Read])
                    .with_validation_rule("type: object")
                    .with_tag("smoke"),
            )
            .unwrap();
        graph.add_node(node("b").with_dependency("a")).unwrap();

        let encoded = serde_json::to_string(&graph).unwrap();
        let decoded: TaskGraph = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.graph_id, graph.graph_id);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.execution_mode, ExecutionMode::Parallel);
        let a = decoded.node("a").unwrap();
        assert_eq!(a.priority, 3);
        assert_eq!(a.required_permissions, vec![PermissionScope::Read]);
        assert_eq!(a.validation_rule, "type: object");
        assert_eq!(a.tags, vec!["smoke".to_string()]);
        assert_eq!(decoded.node("b").unwrap().dependencies, vec!["a"]);
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Success.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
        assert!(!TaskStatus::Retry.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
