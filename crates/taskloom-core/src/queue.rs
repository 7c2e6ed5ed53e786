//! Distributed task queue: reliable hand-off from orchestrator to workers.
//!
//! The queue keeps a pending list and a processing list. Popping atomically
//! moves the head of pending onto processing, so a consumer that dies
//! mid-flight leaves its payload visible for redelivery. Completion removes
//! the payload from processing. At-least-once delivery; the orchestrator
//! dedupes results by node id.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::TaskloomError;
use crate::graph::{PermissionScope, SecurityContext, TaskNode};

/// Caller identity carried with a queued task so workers can re-run
/// permission checks instead of trusting the producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireContext {
    pub user_id: String,
    pub session_id: String,
    #[serde(default)]
    pub allowed_scopes: Vec<PermissionScope>,
    #[serde(default)]
    pub is_authenticated: bool,
    #[serde(default)]
    pub mfa_verified: bool,
}

impl WireContext {
    pub fn from_context(ctx: &SecurityContext) -> Self {
        Self {
            user_id: ctx.user_id.clone(),
            session_id: ctx.session_id.clone(),
            allowed_scopes: ctx.allowed_scopes.clone(),
            is_authenticated: ctx.is_authenticated,
            mfa_verified: ctx.mfa_verified,
        }
    }

    pub fn into_context(self) -> SecurityContext {
        let mut ctx = SecurityContext::new(self.user_id);
        ctx.session_id = self.session_id;
        ctx.allowed_scopes = self.allowed_scopes;
        ctx.is_authenticated = self.is_authenticated;
        ctx.mfa_verified = self.mfa_verified;
        ctx
    }
}

/// Self-describing queue payload: the node plus everything a remote worker
/// needs to execute it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedTask {
    pub node: TaskNode,
    pub graph_id: String,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    pub context: WireContext,
}

impl QueuedTask {
    pub fn new(node: TaskNode, graph_id: impl Into<String>, ctx: &SecurityContext) -> Self {
        let priority = node.priority;
        Self {
            node,
            graph_id: graph_id.into(),
            priority,
            queued_at: Utc::now(),
            context: WireContext::from_context(ctx),
        }
    }

    pub fn encode(&self) -> Result<String, TaskloomError> {
        serde_json::to_string(self).map_err(|err| TaskloomError::Queue(format!("encode: {err}")))
    }

    pub fn decode(raw: &str) -> Result<Self, TaskloomError> {
        serde_json::from_str(raw).map_err(|err| TaskloomError::Queue(format!("decode: {err}")))
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Append to the pending list.
    async fn push(&self, task: &QueuedTask) -> Result<(), TaskloomError>;

    /// Reliable pop: move the head of pending to processing, blocking up to
    /// `timeout`. Returns `None` on timeout or shutdown.
    async fn pop(&self, timeout: Duration) -> Result<Option<QueuedTask>, TaskloomError>;

    /// Pending-list length, used for backpressure.
    async fn len(&self) -> Result<usize, TaskloomError>;

    /// Remove a completed payload from the processing list.
    async fn complete(&self, task: &QueuedTask) -> Result<(), TaskloomError>;
}

/// Single-process queue with the same reliable-pop contract; the default
/// when no backing store is configured.
pub struct MemoryTaskQueue {
    pending: Mutex<VecDeque<String>>,
    processing: Mutex<Vec<String>>,
    notify: Notify,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            processing: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    pub fn processing_len(&self) -> usize {
        self.processing.lock().expect("queue lock").len()
    }

    fn try_pop(&self) -> Option<String> {
        let mut pending = self.pending.lock().expect("queue lock");
        let payload = pending.pop_front()?;
        self.processing
            .lock()
            .expect("queue lock")
            .push(payload.clone());
        Some(payload)
    }
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn push(&self, task: &QueuedTask) -> Result<(), TaskloomError> {
        let payload = task.encode()?;
        self.pending
            .lock()
            .expect("queue lock")
            .push_back(payload);
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<QueuedTask>, TaskloomError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.try_pop() {
                return QueuedTask::decode(&payload).map(Some);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, self.notify.notified()).await;
        }
    }

    async fn len(&self) -> Result<usize, TaskloomError> {
        Ok(self.pending.lock().expect("queue lock").len())
    }

    async fn complete(&self, task: &QueuedTask) -> Result<(), TaskloomError> {
        let payload = task.encode()?;
        self.processing
            .lock()
            .expect("queue lock")
            .retain(|p| p != &payload);
        Ok(())
    }
}

#[cfg(feature = "redis-backend")]
pub use self::redis_backend::RedisTaskQueue;

#[cfg(feature = "redis-backend")]
mod redis_backend {
    use redis::aio::ConnectionManager;

    use super::*;

    const PENDING_KEY: &str = "taskloom:task_queue";
    const PROCESSING_KEY: &str = "taskloom:task_processing";

    /// Redis-backed queue using the BRPOPLPUSH reliable-queue pattern.
    pub struct RedisTaskQueue {
        connection: ConnectionManager,
    }

    impl RedisTaskQueue {
        pub async fn connect(url: &str) -> Result<Self, TaskloomError> {
            let client = redis::Client::open(url)
                .map_err(|err| TaskloomError::Queue(format!("redis client: {err}")))?;
            let connection = ConnectionManager::new(client)
                .await
                .map_err(|err| TaskloomError::Queue(format!("redis connect: {err}")))?;
            Ok(Self { connection })
        }
    }

    #[async_trait]
    impl TaskQueue for RedisTaskQueue {
        async fn push(&self, task: &QueuedTask) -> Result<(), TaskloomError> {
            let payload = task.encode()?;
            let mut connection = self.connection.clone();
            let _: i64 = redis::cmd("LPUSH")
                .arg(PENDING_KEY)
                .arg(payload)
                .query_async(&mut connection)
                .await
                .map_err(|err| TaskloomError::Queue(format!("lpush: {err}")))?;
            Ok(())
        }

        async fn pop(&self, timeout: Duration) -> Result<Option<QueuedTask>, TaskloomError> {
            let mut connection = self.connection.clone();
            let payload: Option<String> = redis::cmd("BRPOPLPUSH")
                .arg(PENDING_KEY)
                .arg(PROCESSING_KEY)
                .arg(timeout.as_secs_f64())
                .query_async(&mut connection)
                .await
                .map_err(|err| TaskloomError::Queue(format!("brpoplpush: {err}")))?;
            match payload {
                Some(raw) => QueuedTask::decode(&raw).map(Some),
                None => Ok(None),
            }
        }

        async fn len(&self) -> Result<usize, TaskloomError> {
            let mut connection = self.connection.clone();
            let len: i64 = redis::cmd("LLEN")
                .arg(PENDING_KEY)
                .query_async(&mut connection)
                .await
                .map_err(|err| TaskloomError::Queue(format!("llen: {err}")))?;
            Ok(len.max(0) as usize)
        }

        async fn complete(&self, task: &QueuedTask) -> Result<(), TaskloomError> {
            let payload = task.encode()?;
            let mut connection = self.connection.clone();
            let _: i64 = redis::cmd("LREM")
                .arg(PROCESSING_KEY)
                .arg(0)
                .arg(payload)
                .query_async(&mut connection)
                .await
                .map_err(|err| TaskloomError::Queue(format!("lrem: {err}")))?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::HandlerKind;

    fn queued(id: &str) -> QueuedTask {
        QueuedTask::new(
            TaskNode::new(id, HandlerKind::Research),
            "graph-1",
            &SecurityContext::system(),
        )
    }

    #[tokio::test]
    async fn push_pop_complete_cycle() {
        let queue = MemoryTaskQueue::new();
        queue.push(&queued("a")).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 1);

        let popped = queue
            .pop(Duration::from_millis(100))
            .await
            .unwrap()
            .expect("task available");
        assert_eq!(popped.node.id, "a");
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(queue.processing_len(), 1);

        queue.complete(&popped).await.unwrap();
        assert_eq!(queue.processing_len(), 0);
    }

    #[tokio::test]
    async fn pop_times_out_when_empty() {
        let queue = MemoryTaskQueue::new();
        let start = std::time::Instant::now();
        let popped = queue.pop(Duration::from_millis(50)).await.unwrap();
        assert!(popped.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = std::sync::Arc::new(MemoryTaskQueue::new());
        let pusher = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.push(&queued("late")).await.unwrap();
        });

        let popped = queue.pop(Duration::from_secs(2)).await.unwrap();
        assert_eq!(popped.unwrap().node.id, "late");
    }

    #[tokio::test]
    async fn unfinished_task_stays_on_processing() {
        let queue = MemoryTaskQueue::new();
        queue.push(&queued("crash")).await.unwrap();
        let _popped = queue.pop(Duration::from_millis(50)).await.unwrap();
        // No complete() call: the payload survives for redelivery.
        assert_eq!(queue.processing_len(), 1);
    }

    #[tokio::test]
    async fn fifo_over_pending_list() {
        let queue = MemoryTaskQueue::new();
        for id in ["one", "two", "three"] {
            queue.push(&queued(id)).await.unwrap();
        }
        let mut order = Vec::new();
        while let Some(task) = queue.pop(Duration::from_millis(10)).await.unwrap() {
            order.push(task.node.id.clone());
        }
        assert_eq!(order, vec!["one", "two", "three"]);
    }

    #[test]
    fn queued_task_round_trips() {
        let task = queued("rt");
        let encoded = task.encode().unwrap();
        let decoded = QueuedTask::decode(&encoded).unwrap();
        assert_eq!(decoded.node.id, "rt");
        assert_eq!(decoded.graph_id, "graph-1");
        assert_eq!(decoded.context.user_id, "system_orchestrator");
    }
}
