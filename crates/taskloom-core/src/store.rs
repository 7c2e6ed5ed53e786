//! Persistence contract for graph snapshots, memory records, secrets and
//! user accounts.
//!
//! Storage choice mirrors the backend split used elsewhere: an in-memory
//! store by default, Postgres behind the `postgres-store` feature. Snapshot
//! writes are last-writer-wins per graph id; the orchestrator holds
//! exclusive write access for a graph's lifetime, so that reduces to
//! append-in-order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::TaskloomError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSnapshotRow {
    pub id: String,
    pub status: String,
    pub state_json: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRow {
    pub id: String,
    pub content: String,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub embedding_id: Option<String>,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRow {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub encrypted_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRow {
    pub user_id: String,
    pub balance_credits: f64,
    pub tier: String,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_graph(&self, row: GraphSnapshotRow) -> Result<(), TaskloomError>;
    async fn load_graph(&self, id: &str) -> Result<Option<GraphSnapshotRow>, TaskloomError>;

    async fn upsert_memory(&self, row: MemoryRow) -> Result<(), TaskloomError>;
    async fn load_memories(&self, ids: &[String]) -> Result<Vec<MemoryRow>, TaskloomError>;
    async fn all_memories(&self) -> Result<Vec<MemoryRow>, TaskloomError>;

    async fn upsert_secret(&self, row: SecretRow) -> Result<(), TaskloomError>;
    async fn load_secret(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<SecretRow>, TaskloomError>;

    async fn load_account(&self, user_id: &str) -> Result<Option<AccountRow>, TaskloomError>;
    async fn save_account(&self, row: AccountRow) -> Result<(), TaskloomError>;

    /// Transactional read-modify-write: subtract `amount` when the balance
    /// covers it. Returns whether the debit happened.
    async fn debit(&self, user_id: &str, amount: f64) -> Result<bool, TaskloomError>;
}

/// DashMap-backed store for tests and single-process runs.
pub struct MemoryStore {
    graphs: DashMap<String, GraphSnapshotRow>,
    memories: DashMap<String, MemoryRow>,
    secrets: DashMap<(String, String), SecretRow>,
    accounts: DashMap<String, AccountRow>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            graphs: DashMap::new(),
            memories: DashMap::new(),
            secrets: DashMap::new(),
            accounts: DashMap::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_graph(&self, row: GraphSnapshotRow) -> Result<(), TaskloomError> {
        self.graphs.insert(row.id.clone(), row);
        Ok(())
    }

    async fn load_graph(&self, id: &str) -> Result<Option<GraphSnapshotRow>, TaskloomError> {
        Ok(self.graphs.get(id).map(|r| r.clone()))
    }

    async fn upsert_memory(&self, row: MemoryRow) -> Result<(), TaskloomError> {
        self.memories.insert(row.id.clone(), row);
        Ok(())
    }

    async fn load_memories(&self, ids: &[String]) -> Result<Vec<MemoryRow>, TaskloomError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.memories.get(id).map(|r| r.clone()))
            .collect())
    }

    async fn all_memories(&self) -> Result<Vec<MemoryRow>, TaskloomError> {
        Ok(self.memories.iter().map(|r| r.clone()).collect())
    }

    async fn upsert_secret(&self, row: SecretRow) -> Result<(), TaskloomError> {
        self.secrets
            .insert((row.user_id.clone(), row.provider.clone()), row);
        Ok(())
    }

    async fn load_secret(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<SecretRow>, TaskloomError> {
        Ok(self
            .secrets
            .get(&(user_id.to_string(), provider.to_string()))
            .map(|r| r.clone()))
    }

    async fn load_account(&self, user_id: &str) -> Result<Option<AccountRow>, TaskloomError> {
        Ok(self.accounts.get(user_id).map(|r| r.clone()))
    }

    async fn save_account(&self, row: AccountRow) -> Result<(), TaskloomError> {
        self.accounts.insert(row.user_id.clone(), row);
        Ok(())
    }

    async fn debit(&self, user_id: &str, amount: f64) -> Result<bool, TaskloomError> {
        match self.accounts.get_mut(user_id) {
            Some(mut account) => {
                if account.balance_credits < amount {
                    return Ok(false);
                }
                account.balance_credits -= amount;
                account.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(feature = "postgres-store")]
pub use self::postgres::PostgresStore;

#[cfg(feature = "postgres-store")]
mod postgres {
    use sqlx::PgPool;
    use sqlx::Row;

    use super::*;

    /// Postgres-backed store over the schema in the external-interfaces
    /// contract: `task_graphs`, `memory_records`, `secrets`,
    /// `user_accounts`.
    pub struct PostgresStore {
        pool: PgPool,
    }

    impl PostgresStore {
        pub async fn connect(database_url: &str) -> Result<Self, TaskloomError> {
            let pool = PgPool::connect(database_url)
                .await
                .map_err(|err| TaskloomError::Persistence(format!("connect: {err}")))?;
            Ok(Self { pool })
        }

        pub fn from_pool(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl Store for PostgresStore {
        async fn upsert_graph(&self, row: GraphSnapshotRow) -> Result<(), TaskloomError> {
            sqlx::query(
                "INSERT INTO task_graphs (id, status, state_json, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (id) DO UPDATE SET status = $2, state_json = $3, updated_at = $5",
            )
            .bind(&row.id)
            .bind(&row.status)
            .bind(&row.state_json)
            .bind(row.created_at)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|err| TaskloomError::Persistence(format!("upsert graph: {err}")))?;
            Ok(())
        }

        async fn load_graph(&self, id: &str) -> Result<Option<GraphSnapshotRow>, TaskloomError> {
            let row = sqlx::query(
                "SELECT id, status, state_json, created_at, updated_at \
                 FROM task_graphs WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| TaskloomError::Persistence(format!("load graph: {err}")))?;

            Ok(row.map(|r| GraphSnapshotRow {
                id: r.get("id"),
                status: r.get("status"),
                state_json: r.get("state_json"),
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            }))
        }

        async fn upsert_memory(&self, row: MemoryRow) -> Result<(), TaskloomError> {
            sqlx::query(
                "INSERT INTO memory_records (id, content, type, timestamp, embedding_id, metadata) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 ON CONFLICT (id) DO UPDATE SET content = $2, type = $3, metadata = $6",
            )
            .bind(&row.id)
            .bind(&row.content)
            .bind(&row.kind)
            .bind(row.timestamp)
            .bind(&row.embedding_id)
            .bind(&row.metadata)
            .execute(&self.pool)
            .await
            .map_err(|err| TaskloomError::Persistence(format!("upsert memory: {err}")))?;
            Ok(())
        }

        async fn load_memories(&self, ids: &[String]) -> Result<Vec<MemoryRow>, TaskloomError> {
            let rows = sqlx::query(
                "SELECT id, content, type, timestamp, embedding_id, metadata \
                 FROM memory_records WHERE id = ANY($1)",
            )
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| TaskloomError::Persistence(format!("load memories: {err}")))?;

            Ok(rows
                .into_iter()
                .map(|r| MemoryRow {
                    id: r.get("id"),
                    content: r.get("content"),
                    kind: r.get("type"),
                    timestamp: r.get("timestamp"),
                    embedding_id: r.get("embedding_id"),
                    metadata: r.get("metadata"),
                })
                .collect())
        }

        async fn all_memories(&self) -> Result<Vec<MemoryRow>, TaskloomError> {
            let rows = sqlx::query(
                "SELECT id, content, type, timestamp, embedding_id, metadata FROM memory_records",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|err| TaskloomError::Persistence(format!("all memories: {err}")))?;

            Ok(rows
                .into_iter()
                .map(|r| MemoryRow {
                    id: r.get("id"),
                    content: r.get("content"),
                    kind: r.get("type"),
                    timestamp: r.get("timestamp"),
                    embedding_id: r.get("embedding_id"),
                    metadata: r.get("metadata"),
                })
                .collect())
        }

        async fn upsert_secret(&self, row: SecretRow) -> Result<(), TaskloomError> {
            sqlx::query(
                "INSERT INTO secrets (id, user_id, provider, encrypted_key, created_at) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (id) DO UPDATE SET encrypted_key = $4",
            )
            .bind(&row.id)
            .bind(&row.user_id)
            .bind(&row.provider)
            .bind(&row.encrypted_key)
            .bind(row.created_at)
            .execute(&self.pool)
            .await
            .map_err(|err| TaskloomError::Persistence(format!("upsert secret: {err}")))?;
            Ok(())
        }

        async fn load_secret(
            &self,
            user_id: &str,
            provider: &str,
        ) -> Result<Option<SecretRow>, TaskloomError> {
            let row = sqlx::query(
                "SELECT id, user_id, provider, encrypted_key, created_at \
                 FROM secrets WHERE user_id = $1 AND provider = $2",
            )
            .bind(user_id)
            .bind(provider)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| TaskloomError::Persistence(format!("load secret: {err}")))?;

            Ok(row.map(|r| SecretRow {
                id: r.get("id"),
                user_id: r.get("user_id"),
                provider: r.get("provider"),
                encrypted_key: r.get("encrypted_key"),
                created_at: r.get("created_at"),
            }))
        }

        async fn load_account(&self, user_id: &str) -> Result<Option<AccountRow>, TaskloomError> {
            let row = sqlx::query(
                "SELECT user_id, balance_credits, tier, updated_at \
                 FROM user_accounts WHERE user_id = $1",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| TaskloomError::Persistence(format!("load account: {err}")))?;

            Ok(row.map(|r| AccountRow {
                user_id: r.get("user_id"),
                balance_credits: r.get("balance_credits"),
                tier: r.get("tier"),
                updated_at: r.get("updated_at"),
            }))
        }

        async fn save_account(&self, row: AccountRow) -> Result<(), TaskloomError> {
            sqlx::query(
                "INSERT INTO user_accounts (user_id, balance_credits, tier, updated_at) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (user_id) DO UPDATE SET balance_credits = $2, tier = $3, updated_at = $4",
            )
            .bind(&row.user_id)
            .bind(row.balance_credits)
            .bind(&row.tier)
            .bind(row.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|err| TaskloomError::Persistence(format!("save account: {err}")))?;
            Ok(())
        }

        async fn debit(&self, user_id: &str, amount: f64) -> Result<bool, TaskloomError> {
            let result = sqlx::query(
                "UPDATE user_accounts \
                 SET balance_credits = balance_credits - $2, updated_at = now() \
                 WHERE user_id = $1 AND balance_credits >= $2",
            )
            .bind(user_id)
            .bind(amount)
            .execute(&self.pool)
            .await
            .map_err(|err| TaskloomError::Persistence(format!("debit: {err}")))?;
            Ok(result.rows_affected() == 1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn graph_rows_upsert_last_writer_wins() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .upsert_graph(GraphSnapshotRow {
                id: "g1".into(),
                status: "running".into(),
                state_json: "{}".into(),
                created_at: now,
                updated_at: now,
            })
            .await
            .unwrap();
        store
            .upsert_graph(GraphSnapshotRow {
                id: "g1".into(),
                status: "success".into(),
                state_json: "{\"done\":true}".into(),
                created_at: now,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let row = store.load_graph("g1").await.unwrap().unwrap();
        assert_eq!(row.status, "success");
        assert_eq!(row.state_json, "{\"done\":true}");
    }

    #[tokio::test]
    async fn debit_requires_sufficient_balance() {
        let store = MemoryStore::new();
        store
            .save_account(AccountRow {
                user_id: "u1".into(),
                balance_credits: 0.25,
                tier: "free".into(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(store.debit("u1", 0.1).await.unwrap());
        assert!(store.debit("u1", 0.1).await.unwrap());
        assert!(!store.debit("u1", 0.1).await.unwrap());
        let account = store.load_account("u1").await.unwrap().unwrap();
        assert!((account.balance_credits - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_account_cannot_be_debited() {
        let store = MemoryStore::new();
        assert!(!store.debit("ghost", 1.0).await.unwrap());
    }
}
