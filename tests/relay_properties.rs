//! End-to-end relay engine properties against a stubbed inference endpoint.

use async_trait::async_trait;
use botrelay::delivery::{DeliveryGateway, Platform};
use botrelay::inference::{HttpInferenceClient, InferenceGateway};
use botrelay::relay::{RelayConfig, RelayEngine};
use botrelay::store::{NewTenant, Store, Tenant, TenantStatus};
use botrelay::RelayError;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct NullDelivery;

#[async_trait]
impl DeliveryGateway for NullDelivery {
    async fn send_reply(
        &self,
        _tenant: &Tenant,
        _platform: Platform,
        _recipient: &str,
        _text: &str,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

async fn store_with_active_tenant(balance: i64) -> (Store, Tenant) {
    let store = Store::open("sqlite::memory:").await.unwrap();
    let tenants = store.tenants();
    let tenant = tenants
        .create(NewTenant {
            api_key: "key-1".to_string(),
            model_name: "llama3".to_string(),
            system_prompt: "You are a shop assistant.".to_string(),
            knowledge_text: "Opening hours: 9-17.".to_string(),
            balance,
            ..NewTenant::default()
        })
        .await
        .unwrap();
    tenants
        .set_status(&tenant.id, TenantStatus::Active)
        .await
        .unwrap();
    let tenant = tenants.find_by_id(&tenant.id).await.unwrap().unwrap();
    (store, tenant)
}

fn engine_against(store: &Store, inference_url: &str, timeout: Duration) -> RelayEngine {
    RelayEngine::new(
        store.tenants(),
        store.credits(),
        store.conversations(),
        store.leads(),
        Arc::new(HttpInferenceClient::new(inference_url, timeout, 0.2)),
        Arc::new(NullDelivery),
        RelayConfig {
            chat_cost: 5,
            window_limit: 6,
            default_model: "llama3".to_string(),
        },
    )
}

fn chat_reply(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(serde_json::json!({
        "message": { "role": "assistant", "content": content }
    }))
}

#[tokio::test]
async fn successful_exchange_debits_once_and_remembers() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(chat_reply("Hola!"))
        .mount(&server)
        .await;

    let (store, tenant) = store_with_active_tenant(50).await;
    let engine = engine_against(&store, &server.uri(), Duration::from_secs(5));

    let outcome = engine
        .exchange(&tenant, "guest", "hello", None)
        .await
        .unwrap();
    assert_eq!(outcome.reply, "Hola!");
    assert_eq!(outcome.remaining_balance, 45);

    let window = store
        .conversations()
        .recent_window(&tenant.id, "guest", 6)
        .await
        .unwrap();
    assert_eq!(window.len(), 2);
}

// The replayed window rides along on the next request: system turn, the
// first exchange, then the new message.
#[tokio::test]
async fn second_exchange_replays_the_window() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(chat_reply("noted"))
        .mount(&server)
        .await;

    let (store, tenant) = store_with_active_tenant(50).await;
    let engine = engine_against(&store, &server.uri(), Duration::from_secs(5));

    engine
        .exchange(&tenant, "guest", "first question", None)
        .await
        .unwrap();
    engine
        .exchange(&tenant, "guest", "second question", None)
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);

    let second: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    let messages = second["messages"].as_array().unwrap();
    // system + first question + reply + second question
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0]["role"], "system");
    assert!(
        messages[0]["content"]
            .as_str()
            .unwrap()
            .contains("[KNOWLEDGE_BASE]")
    );
    assert_eq!(messages[1]["content"], "first question");
    assert_eq!(messages[2]["role"], "assistant");
    assert_eq!(messages[3]["content"], "second question");
}

// Refund correctness: a 5xx from the inference endpoint leaves the balance
// exactly where it started.
#[tokio::test]
async fn inference_error_refunds_the_debit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let (store, tenant) = store_with_active_tenant(50).await;
    let engine = engine_against(&store, &server.uri(), Duration::from_secs(5));

    let err = engine
        .exchange(&tenant, "guest", "hello", None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::InferenceUnavailable(_)));
    assert_eq!(store.credits().balance(&tenant.id).await.unwrap(), Some(50));

    // nothing meaningful occurred, so nothing was logged
    let count = store
        .conversations()
        .message_count(&tenant.id, "guest")
        .await
        .unwrap();
    assert_eq!(count, 0);
}

// Same contract on timeout: balance before = 50, after the failed attempt
// still 50, not 45.
#[tokio::test]
async fn inference_timeout_refunds_the_debit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(chat_reply("too late").set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let (store, tenant) = store_with_active_tenant(50).await;
    let engine = engine_against(&store, &server.uri(), Duration::from_millis(500));

    let err = engine
        .exchange(&tenant, "guest", "hello", None)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::InferenceUnavailable(_)));
    assert_eq!(store.credits().balance(&tenant.id).await.unwrap(), Some(50));
}

#[tokio::test]
async fn exhausted_balance_never_reaches_the_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/chat"))
        .respond_with(chat_reply("unreachable"))
        .expect(2)
        .mount(&server)
        .await;

    let (store, tenant) = store_with_active_tenant(12).await;
    let engine = engine_against(&store, &server.uri(), Duration::from_secs(5));

    engine
        .exchange(&tenant, "guest", "one", None)
        .await
        .unwrap();
    engine
        .exchange(&tenant, "guest", "two", None)
        .await
        .unwrap();
    let err = engine
        .exchange(&tenant, "guest", "three", None)
        .await
        .unwrap_err();

    assert!(matches!(err, RelayError::InsufficientCredit { .. }));
    assert_eq!(store.credits().balance(&tenant.id).await.unwrap(), Some(2));
    server.verify().await;
}
