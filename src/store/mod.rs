//! SQLite persistence for tenants, credits, conversations and leads.
//!
//! One async pool is shared by all sub-stores; schema is created on open.
//! The credit balance lives on the tenant row so the debit check-and-set is
//! a single conditional UPDATE (§ `credits`).

mod conversations;
mod credits;
mod leads;
mod tenants;

pub use conversations::{ConversationLedger, Speaker, SpeakerTurn};
pub use credits::CreditAccount;
pub use leads::{Lead, LeadStore};
pub use tenants::{NewTenant, Tenant, TenantStatus, TenantStore};

use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

const SCHEMA_META_TABLE: &str = "
CREATE TABLE IF NOT EXISTS relay_schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";
const SCHEMA_VERSION_KEY: &str = "relay_schema_version";
const SCHEMA_VERSION: u32 = 1;

/// Owns the pool and hands out per-component store handles.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

async fn ensure_schema_version(pool: &SqlitePool) -> Result<()> {
    sqlx::query(SCHEMA_META_TABLE)
        .execute(pool)
        .await
        .context("create relay_schema_meta table")?;

    let stored_version: Option<(String,)> =
        sqlx::query_as("SELECT value FROM relay_schema_meta WHERE key = $1")
            .bind(SCHEMA_VERSION_KEY)
            .fetch_optional(pool)
            .await
            .context("load relay schema version")?;

    if let Some((value,)) = stored_version {
        let parsed = value
            .parse::<u32>()
            .with_context(|| format!("invalid relay schema version value: {value}"))?;
        anyhow::ensure!(
            parsed == SCHEMA_VERSION,
            "incompatible relay schema version: stored={parsed}, expected={SCHEMA_VERSION}. \
remove the database and restart."
        );
        return Ok(());
    }

    sqlx::query("INSERT INTO relay_schema_meta (key, value) VALUES ($1, $2)")
        .bind(SCHEMA_VERSION_KEY)
        .bind(SCHEMA_VERSION.to_string())
        .execute(pool)
        .await
        .context("persist relay schema version")?;

    Ok(())
}

impl Store {
    /// Connect to `url` and run schema setup.
    pub async fn open(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await
            .with_context(|| format!("open database {url}"))?;
        Self::with_pool(pool).await
    }

    /// Wrap an existing pool (tests pass `sqlite::memory:` pools directly).
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await?;

        ensure_schema_version(&pool).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tenants (
                 id TEXT PRIMARY KEY,
                 api_key TEXT NOT NULL UNIQUE,
                 status TEXT NOT NULL DEFAULT 'draft',
                 model_name TEXT NOT NULL,
                 system_prompt TEXT NOT NULL DEFAULT '',
                 knowledge_text TEXT NOT NULL DEFAULT '',
                 language TEXT NOT NULL DEFAULT 'en',
                 balance INTEGER NOT NULL,
                 whatsapp_business_id TEXT,
                 whatsapp_phone_number_id TEXT,
                 whatsapp_token TEXT,
                 instagram_business_id TEXT,
                 instagram_token TEXT,
                 contact_email TEXT,
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tenants_whatsapp_business
                 ON tenants(whatsapp_business_id)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_tenants_instagram_business
                 ON tenants(instagram_business_id)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                 id TEXT PRIMARY KEY,
                 tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                 customer_identifier TEXT NOT NULL,
                 last_interaction_at TEXT NOT NULL,
                 UNIQUE(tenant_id, customer_identifier)
             )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_messages (
                 id TEXT PRIMARY KEY,
                 conversation_id TEXT NOT NULL
                     REFERENCES conversations(id) ON DELETE CASCADE,
                 role TEXT NOT NULL,
                 text TEXT NOT NULL,
                 seq INTEGER NOT NULL,
                 created_at TEXT NOT NULL
             )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conversation_messages_thread
                 ON conversation_messages(conversation_id, seq)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS leads (
                 id TEXT PRIMARY KEY,
                 tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
                 contact TEXT NOT NULL,
                 last_message TEXT NOT NULL,
                 customer_identifier TEXT NOT NULL,
                 status TEXT NOT NULL DEFAULT 'new',
                 created_at TEXT NOT NULL,
                 UNIQUE(tenant_id, contact)
             )",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn tenants(&self) -> TenantStore {
        TenantStore::new(self.pool.clone())
    }

    pub fn credits(&self) -> CreditAccount {
        CreditAccount::new(self.pool.clone())
    }

    pub fn conversations(&self) -> ConversationLedger {
        ConversationLedger::new(self.pool.clone())
    }

    pub fn leads(&self) -> LeadStore {
        LeadStore::new(self.pool.clone())
    }
}

#[cfg(test)]
pub(crate) async fn memory_store() -> Store {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    Store::with_pool(pool).await.unwrap()
}
