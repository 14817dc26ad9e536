//! The relay engine: resolve tenant, debit, assemble, infer, log, deliver.
//!
//! Per-request state machine:
//! `Received → Resolved → Debited → Prompted → Inferred → Delivered|Refunded → Done`.
//!
//! Concurrency: requests for different threads run fully concurrently; the
//! engine serializes the whole exchange per (tenant, customer) thread,
//! inference wait included, so a chatty customer's messages are answered
//! strictly in arrival order. The credit balance needs no locking — the
//! debit is a conditional UPDATE.

mod leadscan;
mod prompt;

pub use leadscan::extract_contact;
pub use prompt::assemble_prompt;

use crate::delivery::{DeliveryGateway, Platform};
use crate::error::{RelayError, Result};
use crate::inference::InferenceGateway;
use crate::store::{
    ConversationLedger, CreditAccount, LeadStore, Tenant, TenantStatus, TenantStore,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// One inbound social-platform message, already extracted from the
/// platform envelope.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub platform: Platform,
    pub business_account_id: String,
    pub sender_id: String,
    pub message_id: String,
    pub text: String,
}

/// Successful exchange: the reply plus what it cost.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub reply: String,
    pub debited: i64,
    pub remaining_balance: i64,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub chat_cost: i64,
    pub window_limit: usize,
    pub default_model: String,
}

// Keyed mutexes serializing work per conversation thread. Entries are tiny
// and bounded by the number of distinct threads seen by this process.
#[derive(Clone, Default)]
struct ThreadLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ThreadLocks {
    async fn acquire(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                map.entry(key.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        entry.lock_owned().await
    }
}

pub struct RelayEngine {
    tenants: TenantStore,
    credits: CreditAccount,
    ledger: ConversationLedger,
    leads: LeadStore,
    inference: Arc<dyn InferenceGateway>,
    delivery: Arc<dyn DeliveryGateway>,
    thread_locks: ThreadLocks,
    config: RelayConfig,
}

impl RelayEngine {
    pub fn new(
        tenants: TenantStore,
        credits: CreditAccount,
        ledger: ConversationLedger,
        leads: LeadStore,
        inference: Arc<dyn InferenceGateway>,
        delivery: Arc<dyn DeliveryGateway>,
        config: RelayConfig,
    ) -> Self {
        Self {
            tenants,
            credits,
            ledger,
            leads,
            inference,
            delivery,
            thread_locks: ThreadLocks::default(),
            config,
        }
    }

    pub fn chat_cost(&self) -> i64 {
        self.config.chat_cost
    }

    /// Run one metered exchange for an already-resolved tenant and return
    /// the reply inline (API paths).
    ///
    /// The debit→infer→refund-or-log section runs in a spawned task: once
    /// the balance is touched it completes even if the originating request
    /// is cancelled, so a client disconnect cannot leak a debit.
    pub async fn exchange(
        &self,
        tenant: &Tenant,
        customer_identifier: &str,
        message: &str,
        model_override: Option<&str>,
    ) -> Result<ExchangeOutcome> {
        if tenant.status != TenantStatus::Active {
            return Err(RelayError::TenantInactive(tenant.id.clone()));
        }

        let lock_key = format!("{}/{customer_identifier}", tenant.id);
        let _thread_guard = self.thread_locks.acquire(&lock_key).await;

        let section = MeteredSection {
            credits: self.credits.clone(),
            ledger: self.ledger.clone(),
            leads: self.leads.clone(),
            inference: Arc::clone(&self.inference),
            tenant: tenant.clone(),
            customer_identifier: customer_identifier.to_string(),
            message: message.to_string(),
            model: self.resolve_model(tenant, model_override),
            chat_cost: self.config.chat_cost,
            window_limit: self.config.window_limit,
        };

        match tokio::spawn(section.run()).await {
            Ok(outcome) => outcome,
            Err(join_error) => Err(RelayError::Other(anyhow::anyhow!(
                "metered exchange task failed: {join_error}"
            ))),
        }
    }

    /// Webhook entry: resolve the tenant from the platform business account
    /// id, run the exchange, push the reply through the delivery gateway.
    /// Delivery failure is logged and does not refund — the inference cost
    /// was legitimately incurred.
    pub async fn handle_inbound(&self, event: &InboundEvent) -> Result<ExchangeOutcome> {
        let tenant = self
            .tenants
            .find_by_business_account(&event.business_account_id)
            .await?
            .ok_or_else(|| RelayError::TenantNotFound(event.business_account_id.clone()))?;

        let outcome = self
            .exchange(&tenant, &event.sender_id, &event.text, None)
            .await?;

        if let Err(send_error) = self
            .delivery
            .send_reply(&tenant, event.platform, &event.sender_id, &outcome.reply)
            .await
        {
            let failure = RelayError::DeliveryFailed {
                platform: event.platform.as_str().to_string(),
                message: send_error.to_string(),
            };
            tracing::warn!(tenant = %tenant.id, "{failure}");
        }

        Ok(outcome)
    }

    fn resolve_model(&self, tenant: &Tenant, model_override: Option<&str>) -> String {
        match model_override {
            Some(model) if !model.is_empty() => model.to_string(),
            _ if !tenant.model_name.is_empty() => tenant.model_name.clone(),
            _ => self.config.default_model.clone(),
        }
    }
}

/// Everything the critical section owns, cloned so the spawned task is
/// independent of the caller's lifetime.
struct MeteredSection {
    credits: CreditAccount,
    ledger: ConversationLedger,
    leads: LeadStore,
    inference: Arc<dyn InferenceGateway>,
    tenant: Tenant,
    customer_identifier: String,
    message: String,
    model: String,
    chat_cost: i64,
    window_limit: usize,
}

impl MeteredSection {
    async fn run(self) -> Result<ExchangeOutcome> {
        // Debited
        let remaining_balance = self
            .credits
            .try_debit(&self.tenant.id, self.chat_cost)
            .await?;

        // Prompted — the window read is best-effort memory, not
        // correctness: a degraded ledger yields an empty window.
        let window = match self
            .ledger
            .recent_window(&self.tenant.id, &self.customer_identifier, self.window_limit)
            .await
        {
            Ok(window) => window,
            Err(error) => {
                tracing::warn!(
                    tenant = %self.tenant.id,
                    "{}",
                    RelayError::StorageDegraded(format!("recent window read failed: {error}"))
                );
                Vec::new()
            }
        };
        let turns = assemble_prompt(
            &self.tenant.system_prompt,
            &self.tenant.knowledge_text,
            &window,
            &self.message,
        );

        // Inferred | Refunded
        let reply = match self.inference.complete(&self.model, &turns).await {
            Ok(reply) => reply,
            Err(inference_error) => {
                if let Err(refund_error) =
                    self.credits.refund(&self.tenant.id, self.chat_cost).await
                {
                    // A failed refund is a real balance leak; make it loud.
                    tracing::error!(
                        tenant = %self.tenant.id,
                        "refund after failed inference did not apply: {refund_error}"
                    );
                }
                return Err(RelayError::InferenceUnavailable(
                    inference_error.to_string(),
                ));
            }
        };

        // Logged (best-effort)
        if let Err(error) = self
            .ledger
            .append_exchange(
                &self.tenant.id,
                &self.customer_identifier,
                &self.message,
                &reply,
            )
            .await
        {
            tracing::warn!(
                tenant = %self.tenant.id,
                "{}",
                RelayError::StorageDegraded(format!("ledger append failed: {error}"))
            );
        }

        // Lead scan (best-effort)
        if let Some(contact) = extract_contact(&self.message) {
            if let Err(error) = self
                .leads
                .capture(
                    &self.tenant.id,
                    &contact,
                    &self.message,
                    &self.customer_identifier,
                )
                .await
            {
                tracing::warn!(
                    tenant = %self.tenant.id,
                    "{}",
                    RelayError::StorageDegraded(format!("lead capture failed: {error}"))
                );
            }
        }

        Ok(ExchangeOutcome {
            reply,
            debited: self.chat_cost,
            remaining_balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::ChatTurn;
    use crate::store::{NewTenant, memory_store};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedInference {
        reply: Option<String>,
        calls: AtomicUsize,
    }

    impl ScriptedInference {
        fn replying(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Some(reply.to_string()),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: None,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl InferenceGateway for ScriptedInference {
        async fn complete(&self, _model: &str, _messages: &[ChatTurn]) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.reply {
                Some(reply) => Ok(reply.clone()),
                None => anyhow::bail!("inference endpoint returned 500"),
            }
        }
    }

    #[derive(Default)]
    struct RecordingDelivery {
        sends: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl DeliveryGateway for RecordingDelivery {
        async fn send_reply(
            &self,
            _tenant: &Tenant,
            _platform: Platform,
            recipient: &str,
            text: &str,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("graph api error: 401");
            }
            self.sends
                .lock()
                .unwrap()
                .push((recipient.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn engine_with(
        store: &crate::store::Store,
        inference: Arc<dyn InferenceGateway>,
        delivery: Arc<dyn DeliveryGateway>,
    ) -> RelayEngine {
        RelayEngine::new(
            store.tenants(),
            store.credits(),
            store.conversations(),
            store.leads(),
            inference,
            delivery,
            RelayConfig {
                chat_cost: 5,
                window_limit: 6,
                default_model: "llama3".to_string(),
            },
        )
    }

    async fn active_tenant(store: &crate::store::Store, balance: i64) -> Tenant {
        let tenants = store.tenants();
        let tenant = tenants
            .create(NewTenant {
                api_key: "key-1".to_string(),
                model_name: "llama3".to_string(),
                system_prompt: "You are a shop assistant.".to_string(),
                balance,
                whatsapp_business_id: Some("waba-1".to_string()),
                whatsapp_phone_number_id: Some("phone-1".to_string()),
                whatsapp_token: Some("token".to_string()),
                ..NewTenant::default()
            })
            .await
            .unwrap();
        tenants
            .set_status(&tenant.id, TenantStatus::Active)
            .await
            .unwrap();
        tenants.find_by_id(&tenant.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn successful_exchange_debits_and_logs() {
        let store = memory_store().await;
        let tenant = active_tenant(&store, 50).await;
        let engine = engine_with(
            &store,
            ScriptedInference::replying("Hello there!"),
            Arc::new(RecordingDelivery::default()),
        );

        let outcome = engine
            .exchange(&tenant, "guest", "hi", None)
            .await
            .unwrap();

        assert_eq!(outcome.reply, "Hello there!");
        assert_eq!(outcome.debited, 5);
        assert_eq!(outcome.remaining_balance, 45);

        let window = store
            .conversations()
            .recent_window(&tenant.id, "guest", 6)
            .await
            .unwrap();
        assert_eq!(window.len(), 2);
    }

    // The single most important failure-recovery contract: a failed
    // inference attempt must leave the balance exactly where it started.
    #[tokio::test]
    async fn failed_inference_refunds_in_full() {
        let store = memory_store().await;
        let tenant = active_tenant(&store, 50).await;
        let engine = engine_with(
            &store,
            ScriptedInference::failing(),
            Arc::new(RecordingDelivery::default()),
        );

        let err = engine
            .exchange(&tenant, "guest", "hi", None)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::InferenceUnavailable(_)));
        assert_eq!(store.credits().balance(&tenant.id).await.unwrap(), Some(50));
        // nothing meaningful happened, so nothing is logged
        let count = store
            .conversations()
            .message_count(&tenant.id, "guest")
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn inactive_tenant_is_rejected_before_any_debit() {
        let store = memory_store().await;
        let tenants = store.tenants();
        let tenant = tenants
            .create(NewTenant {
                api_key: "key-1".to_string(),
                model_name: "llama3".to_string(),
                balance: 50,
                ..NewTenant::default()
            })
            .await
            .unwrap();
        let inference = ScriptedInference::replying("nope");
        let engine = engine_with(
            &store,
            Arc::clone(&inference) as Arc<dyn InferenceGateway>,
            Arc::new(RecordingDelivery::default()),
        );

        let err = engine
            .exchange(&tenant, "guest", "hi", None)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::TenantInactive(_)));
        assert_eq!(store.credits().balance(&tenant.id).await.unwrap(), Some(50));
        assert_eq!(inference.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_balance_is_terminal_without_inference() {
        let store = memory_store().await;
        let tenant = active_tenant(&store, 3).await;
        let inference = ScriptedInference::replying("never");
        let engine = engine_with(
            &store,
            Arc::clone(&inference) as Arc<dyn InferenceGateway>,
            Arc::new(RecordingDelivery::default()),
        );

        let err = engine
            .exchange(&tenant, "guest", "hi", None)
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::InsufficientCredit { .. }));
        assert_eq!(inference.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn contact_in_message_becomes_a_lead() {
        let store = memory_store().await;
        let tenant = active_tenant(&store, 50).await;
        let engine = engine_with(
            &store,
            ScriptedInference::replying("Thanks, noted!"),
            Arc::new(RecordingDelivery::default()),
        );

        engine
            .exchange(&tenant, "guest", "my email is jane@example.com", None)
            .await
            .unwrap();

        let leads = store.leads().list_for_tenant(&tenant.id).await.unwrap();
        assert_eq!(leads.len(), 1);
        assert_eq!(leads[0].contact, "jane@example.com");
    }

    #[tokio::test]
    async fn inbound_event_resolves_and_delivers() {
        let store = memory_store().await;
        let tenant = active_tenant(&store, 50).await;
        let delivery = Arc::new(RecordingDelivery::default());
        let engine = engine_with(
            &store,
            ScriptedInference::replying("On the way!"),
            Arc::clone(&delivery) as Arc<dyn DeliveryGateway>,
        );

        let event = InboundEvent {
            platform: Platform::WhatsApp,
            business_account_id: "waba-1".to_string(),
            sender_id: "15551230000".to_string(),
            message_id: "wamid.1".to_string(),
            text: "where is my order?".to_string(),
        };
        let outcome = engine.handle_inbound(&event).await.unwrap();

        assert_eq!(outcome.reply, "On the way!");
        let sends = delivery.sends.lock().unwrap();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, "15551230000");
        assert_eq!(store.credits().balance(&tenant.id).await.unwrap(), Some(45));
    }

    #[tokio::test]
    async fn delivery_failure_does_not_refund() {
        let store = memory_store().await;
        let tenant = active_tenant(&store, 50).await;
        let engine = engine_with(
            &store,
            ScriptedInference::replying("reply"),
            Arc::new(RecordingDelivery {
                fail: true,
                ..RecordingDelivery::default()
            }),
        );

        let event = InboundEvent {
            platform: Platform::WhatsApp,
            business_account_id: "waba-1".to_string(),
            sender_id: "15551230000".to_string(),
            message_id: "wamid.2".to_string(),
            text: "hello?".to_string(),
        };
        let outcome = engine.handle_inbound(&event).await.unwrap();

        // cost was legitimately incurred; the exchange is still logged
        assert_eq!(outcome.remaining_balance, 45);
        assert_eq!(store.credits().balance(&tenant.id).await.unwrap(), Some(45));
    }

    #[tokio::test]
    async fn unknown_business_account_is_not_found() {
        let store = memory_store().await;
        active_tenant(&store, 50).await;
        let engine = engine_with(
            &store,
            ScriptedInference::replying("reply"),
            Arc::new(RecordingDelivery::default()),
        );

        let event = InboundEvent {
            platform: Platform::Instagram,
            business_account_id: "unknown".to_string(),
            sender_id: "ig-1".to_string(),
            message_id: "mid.1".to_string(),
            text: "hi".to_string(),
        };
        let err = engine.handle_inbound(&event).await.unwrap_err();
        assert!(matches!(err, RelayError::TenantNotFound(_)));
    }
}
