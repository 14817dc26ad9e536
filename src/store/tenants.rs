use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use uuid::Uuid;

/// Bot activation state. The relay never calls the inference gateway for a
/// tenant that is not `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantStatus {
    Draft,
    Active,
    Inactive,
}

fn status_to_str(status: TenantStatus) -> &'static str {
    match status {
        TenantStatus::Draft => "draft",
        TenantStatus::Active => "active",
        TenantStatus::Inactive => "inactive",
    }
}

fn str_to_status(value: &str) -> Result<TenantStatus> {
    match value {
        "draft" => Ok(TenantStatus::Draft),
        "active" => Ok(TenantStatus::Active),
        "inactive" => Ok(TenantStatus::Inactive),
        _ => anyhow::bail!("unknown tenant status: {value}"),
    }
}

/// Canonical Tenant Bot Configuration — one shape, deterministic lookup
/// keys written at configuration time (id, api key, platform business ids).
#[derive(Debug, Clone)]
pub struct Tenant {
    pub id: String,
    pub api_key: String,
    pub status: TenantStatus,
    pub model_name: String,
    pub system_prompt: String,
    pub knowledge_text: String,
    pub language: String,
    pub balance: i64,
    pub whatsapp_business_id: Option<String>,
    pub whatsapp_phone_number_id: Option<String>,
    pub whatsapp_token: Option<String>,
    pub instagram_business_id: Option<String>,
    pub instagram_token: Option<String>,
    pub contact_email: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Creation payload; id and timestamps are assigned by the store.
#[derive(Debug, Clone, Default)]
pub struct NewTenant {
    pub api_key: String,
    pub model_name: String,
    pub system_prompt: String,
    pub knowledge_text: String,
    pub language: String,
    pub balance: i64,
    pub whatsapp_business_id: Option<String>,
    pub whatsapp_phone_number_id: Option<String>,
    pub whatsapp_token: Option<String>,
    pub instagram_business_id: Option<String>,
    pub instagram_token: Option<String>,
    pub contact_email: Option<String>,
}

#[derive(Clone)]
pub struct TenantStore {
    pool: SqlitePool,
}

const TENANT_COLUMNS: &str = "id, api_key, status, model_name, system_prompt, knowledge_text, \
     language, balance, whatsapp_business_id, whatsapp_phone_number_id, whatsapp_token, \
     instagram_business_id, instagram_token, contact_email, created_at, updated_at";

fn map_tenant_row(row: &SqliteRow) -> Result<Tenant> {
    let status_raw: String = row.try_get("status")?;
    Ok(Tenant {
        id: row.try_get("id")?,
        api_key: row.try_get("api_key")?,
        status: str_to_status(&status_raw)?,
        model_name: row.try_get("model_name")?,
        system_prompt: row.try_get("system_prompt")?,
        knowledge_text: row.try_get("knowledge_text")?,
        language: row.try_get("language")?,
        balance: row.try_get("balance")?,
        whatsapp_business_id: row.try_get("whatsapp_business_id")?,
        whatsapp_phone_number_id: row.try_get("whatsapp_phone_number_id")?,
        whatsapp_token: row.try_get("whatsapp_token")?,
        instagram_business_id: row.try_get("instagram_business_id")?,
        instagram_token: row.try_get("instagram_token")?,
        contact_email: row.try_get("contact_email")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl TenantStore {
    pub(super) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a tenant in `draft` status and return it.
    pub async fn create(&self, new: NewTenant) -> Result<Tenant> {
        let id = Uuid::new_v4().to_string();
        let timestamp = Utc::now().to_rfc3339();

        sqlx::query(
            "INSERT INTO tenants (id, api_key, status, model_name, system_prompt, \
                 knowledge_text, language, balance, whatsapp_business_id, \
                 whatsapp_phone_number_id, whatsapp_token, instagram_business_id, \
                 instagram_token, contact_email, created_at, updated_at)
             VALUES ($1, $2, 'draft', $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $14)",
        )
        .bind(&id)
        .bind(&new.api_key)
        .bind(&new.model_name)
        .bind(&new.system_prompt)
        .bind(&new.knowledge_text)
        .bind(&new.language)
        .bind(new.balance)
        .bind(&new.whatsapp_business_id)
        .bind(&new.whatsapp_phone_number_id)
        .bind(&new.whatsapp_token)
        .bind(&new.instagram_business_id)
        .bind(&new.instagram_token)
        .bind(&new.contact_email)
        .bind(&timestamp)
        .execute(&self.pool)
        .await
        .context("insert tenant")?;

        Ok(Tenant {
            id,
            api_key: new.api_key,
            status: TenantStatus::Draft,
            model_name: new.model_name,
            system_prompt: new.system_prompt,
            knowledge_text: new.knowledge_text,
            language: new.language,
            balance: new.balance,
            whatsapp_business_id: new.whatsapp_business_id,
            whatsapp_phone_number_id: new.whatsapp_phone_number_id,
            whatsapp_token: new.whatsapp_token,
            instagram_business_id: new.instagram_business_id,
            instagram_token: new.instagram_token,
            contact_email: new.contact_email,
            created_at: timestamp.clone(),
            updated_at: timestamp,
        })
    }

    pub async fn set_status(&self, id: &str, status: TenantStatus) -> Result<()> {
        sqlx::query("UPDATE tenants SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(status_to_str(status))
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("update tenant status")?;
        Ok(())
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("query tenant by id")?;
        row.map(|r| map_tenant_row(&r)).transpose()
    }

    pub async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Tenant>> {
        let row = sqlx::query(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE api_key = $1"
        ))
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await
        .context("query tenant by api key")?;
        row.map(|r| map_tenant_row(&r)).transpose()
    }

    /// Webhook resolution key. A WhatsApp match wins when the same business
    /// account id is configured on both platforms of different tenants.
    pub async fn find_by_business_account(
        &self,
        business_account_id: &str,
    ) -> Result<Option<Tenant>> {
        let row = sqlx::query(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants
             WHERE whatsapp_business_id = $1 OR instagram_business_id = $1
             ORDER BY (whatsapp_business_id = $1) DESC
             LIMIT 1"
        ))
        .bind(business_account_id)
        .fetch_optional(&self.pool)
        .await
        .context("query tenant by business account id")?;
        row.map(|r| map_tenant_row(&r)).transpose()
    }
}
