use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use uuid::Uuid;

/// A contact surfaced from inbound chat text. One row per
/// (tenant, contact); repeat sightings refresh `last_message` in place.
#[derive(Debug, Clone)]
pub struct Lead {
    pub id: String,
    pub tenant_id: String,
    pub contact: String,
    pub last_message: String,
    pub customer_identifier: String,
    pub status: String,
    pub created_at: String,
}

#[derive(Clone)]
pub struct LeadStore {
    pool: SqlitePool,
}

fn map_lead_row(row: &SqliteRow) -> Result<Lead> {
    Ok(Lead {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        contact: row.try_get("contact")?,
        last_message: row.try_get("last_message")?,
        customer_identifier: row.try_get("customer_identifier")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
    })
}

impl LeadStore {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record a contact sighting. New contacts insert with status `new`;
    /// known contacts only refresh the message context.
    pub async fn capture(
        &self,
        tenant_id: &str,
        contact: &str,
        last_message: &str,
        customer_identifier: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO leads
                 (id, tenant_id, contact, last_message, customer_identifier, status, created_at)
             VALUES ($1, $2, $3, $4, $5, 'new', $6)
             ON CONFLICT(tenant_id, contact)
             DO UPDATE SET last_message = excluded.last_message",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(tenant_id)
        .bind(contact)
        .bind(last_message)
        .bind(customer_identifier)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("upsert lead")?;
        Ok(())
    }

    pub async fn list_for_tenant(&self, tenant_id: &str) -> Result<Vec<Lead>> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, contact, last_message, customer_identifier, status, created_at
             FROM leads
             WHERE tenant_id = $1
             ORDER BY created_at DESC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .context("list leads")?;
        rows.iter().map(map_lead_row).collect()
    }
}
