//! Core primitives for the taskloom orchestration system.
//!
//! The substrate has four load-bearing subsystems:
//! - the graph scheduler with its dependency engine and execution modes
//!   ([`orchestrator`], [`graph`]);
//! - the priority event bus with wildcard routing, request/response
//!   correlation, replay and dead-lettering ([`events`], [`broker`]);
//! - the reliable distributed task queue ([`queue`], [`worker`]);
//! - the handler runtime wrapping every invocation with circuit breaker,
//!   retry, permission guard and metrics ([`runtime`], [`breaker`],
//!   [`retry`]).
//!
//! Around them sit the security, validation, memory and billing services,
//! the persistence and vault contracts, and the configuration/telemetry
//! bootstrap.

pub mod billing;
pub mod breaker;
pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod graph;
pub mod handlers;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod planner;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod security;
pub mod store;
pub mod telemetry;
pub mod validation;
pub mod vault;
pub mod worker;

pub use billing::{BillingGate, Tier};
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use broker::{MemoryBroker, StreamBroker};
pub use config::{Config, ConfigLoader};
pub use error::{HandlerError, TaskloomError};
pub use events::{BusConfig, Event, EventBus, EventHandler, SubscriptionId};
pub use graph::{
    ExecutionMode, HandlerKind, PermissionScope, RetryConfig, RetryStrategy, RiskLevel,
    SecurityContext, TaskGraph, TaskNode, TaskStatus,
};
pub use memory::{MemoryService, MemoryVectorStore, VectorStore, embed};
pub use orchestrator::{GraphReport, GraphStatus, Orchestrator, OrchestratorBuilder};
pub use planner::{Planner, TemplatePlanner};
pub use queue::{MemoryTaskQueue, QueuedTask, TaskQueue};
pub use runtime::{HandlerRegistry, HandlerRuntime, TaskHandler};
pub use security::SecurityService;
pub use store::{MemoryStore, Store};
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use validation::ValidationService;
pub use vault::{AesGcmVault, Vault};
pub use worker::Worker;

#[cfg(feature = "redis-backend")]
pub use broker::RedisBroker;
#[cfg(feature = "redis-backend")]
pub use queue::RedisTaskQueue;
#[cfg(feature = "postgres-store")]
pub use store::PostgresStore;
#[cfg(feature = "qdrant-vector")]
pub use memory::QdrantVectorStore;
