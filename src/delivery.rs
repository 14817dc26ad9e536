use crate::store::Tenant;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Social platform an inbound event arrived on (and the reply goes back to).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    WhatsApp,
    Instagram,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WhatsApp => "whatsapp",
            Self::Instagram => "instagram",
        }
    }
}

/// Pushes a generated reply back to the end customer using the tenant's
/// stored platform credential.
#[async_trait]
pub trait DeliveryGateway: Send + Sync {
    async fn send_reply(
        &self,
        tenant: &Tenant,
        platform: Platform,
        recipient: &str,
        text: &str,
    ) -> anyhow::Result<()>;
}

/// Meta Graph API client for WhatsApp Cloud and Instagram DM sends.
pub struct MetaDelivery {
    base_url: String,
    client: Client,
}

impl MetaDelivery {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    async fn post_graph(
        &self,
        url: &str,
        token: &str,
        body: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {token}"))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_default();
            tracing::error!("graph api send failed: {status} — {error_body}");
            anyhow::bail!("graph api error: {status}");
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryGateway for MetaDelivery {
    async fn send_reply(
        &self,
        tenant: &Tenant,
        platform: Platform,
        recipient: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        match platform {
            Platform::WhatsApp => {
                let Some(phone_number_id) = tenant.whatsapp_phone_number_id.as_deref() else {
                    anyhow::bail!("tenant {} has no whatsapp phone number id", tenant.id);
                };
                let Some(token) = tenant.whatsapp_token.as_deref() else {
                    anyhow::bail!("tenant {} has no whatsapp token", tenant.id);
                };

                // WhatsApp Cloud API: POST /{phone_number_id}/messages
                let url = format!("{}/{phone_number_id}/messages", self.base_url);
                let to = recipient.strip_prefix('+').unwrap_or(recipient);
                let body = serde_json::json!({
                    "messaging_product": "whatsapp",
                    "recipient_type": "individual",
                    "to": to,
                    "type": "text",
                    "text": {
                        "preview_url": false,
                        "body": text
                    }
                });
                self.post_graph(&url, token, &body).await
            }
            Platform::Instagram => {
                let Some(token) = tenant.instagram_token.as_deref() else {
                    anyhow::bail!("tenant {} has no instagram token", tenant.id);
                };

                // Instagram DM API: POST /me/messages
                let url = format!("{}/me/messages", self.base_url);
                let body = serde_json::json!({
                    "recipient": { "id": recipient },
                    "message": { "text": text }
                });
                self.post_graph(&url, token, &body).await
            }
        }
    }
}
