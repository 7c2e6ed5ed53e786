//! Billing gate: tier-based admission and per-cycle credit debits.
//!
//! Credit bookkeeping only; payment collection happens elsewhere.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::TaskloomError;
use crate::metrics;
use crate::store::{AccountRow, Store};

/// Cost of one orchestration cycle in credits.
pub const CYCLE_COST: f64 = 0.1;

/// Credits a freshly created free account starts with.
const WELCOME_CREDITS: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "pro" => Tier::Pro,
            "enterprise" => Tier::Enterprise,
            _ => Tier::Free,
        }
    }

    pub fn limits(&self) -> TierLimits {
        match self {
            Tier::Free => TierLimits {
                max_concurrent_graphs: 2,
                max_nodes_per_graph: 5,
                premium_handlers: false,
            },
            Tier::Pro => TierLimits {
                max_concurrent_graphs: 10,
                max_nodes_per_graph: 50,
                premium_handlers: true,
            },
            Tier::Enterprise => TierLimits {
                max_concurrent_graphs: 100,
                max_nodes_per_graph: 500,
                premium_handlers: true,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TierLimits {
    pub max_concurrent_graphs: usize,
    pub max_nodes_per_graph: usize,
    pub premium_handlers: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub user_id: String,
    pub balance: f64,
    pub tier: Tier,
}

pub struct BillingGate {
    store: Arc<dyn Store>,
}

impl BillingGate {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Fetch the account, creating a free one on first sight.
    pub async fn account(&self, user_id: &str) -> Result<Account, TaskloomError> {
        if let Some(row) = self.store.load_account(user_id).await? {
            return Ok(Account {
                user_id: row.user_id,
                balance: row.balance_credits,
                tier: Tier::from_str(&row.tier),
            });
        }

        let row = AccountRow {
            user_id: user_id.to_string(),
            balance_credits: WELCOME_CREDITS,
            tier: Tier::Free.as_str().to_string(),
            updated_at: Utc::now(),
        };
        self.store.save_account(row).await?;
        tracing::info!(user_id, "created free account");
        Ok(Account {
            user_id: user_id.to_string(),
            balance: WELCOME_CREDITS,
            tier: Tier::Free,
        })
    }

    /// Tier admission: a graph larger than the tier's node cap is rejected
    /// before any node is dispatched.
    pub async fn admit(&self, user_id: &str, node_count: usize) -> Result<(), TaskloomError> {
        let account = self.account(user_id).await?;
        let limits = account.tier.limits();
        if node_count > limits.max_nodes_per_graph {
            return Err(TaskloomError::TierLimit(format!(
                "graph has {node_count} nodes, {} tier allows {}",
                account.tier.as_str(),
                limits.max_nodes_per_graph
            )));
        }
        Ok(())
    }

    /// Debit one orchestration cycle. Returns whether the balance covered
    /// it; the caller aborts remaining work when it did not.
    pub async fn debit_cycle(&self, user_id: &str) -> Result<bool, TaskloomError> {
        // Ensure the account exists so first-time users get their welcome
        // balance before the debit.
        self.account(user_id).await?;
        let charged = self.store.debit(user_id, CYCLE_COST).await?;
        if charged {
            metrics::record_billing_cycle(user_id);
        } else {
            tracing::warn!(user_id, "insufficient credits for orchestration cycle");
        }
        Ok(charged)
    }

    pub async fn top_up(&self, user_id: &str, amount: f64) -> Result<Account, TaskloomError> {
        let mut account = self.account(user_id).await?;
        account.balance += amount;
        self.store
            .save_account(AccountRow {
                user_id: account.user_id.clone(),
                balance_credits: account.balance,
                tier: account.tier.as_str().to_string(),
                updated_at: Utc::now(),
            })
            .await?;
        tracing::info!(user_id, amount, "topped up credits");
        Ok(account)
    }

    pub async fn set_tier(&self, user_id: &str, tier: Tier) -> Result<(), TaskloomError> {
        let account = self.account(user_id).await?;
        self.store
            .save_account(AccountRow {
                user_id: account.user_id,
                balance_credits: account.balance,
                tier: tier.as_str().to_string(),
                updated_at: Utc::now(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn gate() -> BillingGate {
        BillingGate::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn first_sight_creates_free_account() {
        let gate = gate();
        let account = gate.account("new-user").await.unwrap();
        assert_eq!(account.tier, Tier::Free);
        assert_eq!(account.balance, WELCOME_CREDITS);
    }

    #[tokio::test]
    async fn admission_enforces_tier_node_cap() {
        let gate = gate();
        assert!(gate.admit("u", 5).await.is_ok());
        let err = gate.admit("u", 6).await.unwrap_err();
        assert!(matches!(err, TaskloomError::TierLimit(_)));

        gate.set_tier("u", Tier::Pro).await.unwrap();
        assert!(gate.admit("u", 50).await.is_ok());
        assert!(gate.admit("u", 51).await.is_err());
    }

    #[tokio::test]
    async fn debit_consumes_and_eventually_denies() {
        let gate = gate();
        gate.account("spender").await.unwrap();
        // Drain the welcome balance; allow one cycle of float slack.
        let cycles = (WELCOME_CREDITS / CYCLE_COST) as usize;
        let mut successes = 0usize;
        while gate.debit_cycle("spender").await.unwrap() {
            successes += 1;
            assert!(successes <= cycles + 1, "debits never denied");
        }
        assert!(successes >= cycles - 1);
    }

    #[tokio::test]
    async fn top_up_restores_balance() {
        let gate = gate();
        let before = gate.account("payer").await.unwrap().balance;
        gate.top_up("payer", 25.0).await.unwrap();
        let after = gate.account("payer").await.unwrap().balance;
        assert!((after - before - 25.0).abs() < 1e-9);
    }
}
