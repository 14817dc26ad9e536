use crate::error::{RelayError, Result};
use anyhow::Context;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;

/// Atomic debit/refund protocol over the tenant balance.
///
/// The debit is a single conditional UPDATE, not a read-then-write pair:
/// concurrent requests against the same tenant race only inside SQLite's
/// row update, so the balance can never be driven below zero.
#[derive(Clone)]
pub struct CreditAccount {
    pool: SqlitePool,
}

impl CreditAccount {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Decrement `cost` only if the current balance covers it. Returns the
    /// post-debit balance, or `InsufficientCredit` when the condition fails
    /// (which also covers an unknown tenant id — callers that need the
    /// distinction do a secondary lookup).
    pub async fn try_debit(&self, tenant_id: &str, cost: i64) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE tenants
             SET balance = balance - $1, updated_at = $2
             WHERE id = $3 AND balance >= $1
             RETURNING balance",
        )
        .bind(cost)
        .bind(Utc::now().to_rfc3339())
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .context("conditional balance debit")?;

        match row {
            Some((balance,)) => Ok(balance),
            None => Err(RelayError::InsufficientCredit {
                tenant_id: tenant_id.to_string(),
                cost,
            }),
        }
    }

    /// Unconditional credit-back. The relay engine guarantees at most one
    /// refund per successful debit.
    pub async fn refund(&self, tenant_id: &str, cost: i64) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE tenants
             SET balance = balance + $1, updated_at = $2
             WHERE id = $3
             RETURNING balance",
        )
        .bind(cost)
        .bind(Utc::now().to_rfc3339())
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await
        .context("balance refund")?;

        match row {
            Some((balance,)) => Ok(balance),
            None => Err(RelayError::TenantNotFound(tenant_id.to_string())),
        }
    }

    pub async fn balance(&self, tenant_id: &str) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT balance FROM tenants WHERE id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await
            .context("query balance")?;
        Ok(row.map(|(balance,)| balance))
    }
}
