use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One role-tagged turn of an assembled prompt.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// External LLM serving endpoint. Latency and failure modes are
/// unpredictable; every implementation must enforce a finite timeout.
#[async_trait]
pub trait InferenceGateway: Send + Sync {
    async fn complete(&self, model: &str, messages: &[ChatTurn]) -> anyhow::Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    stream: bool,
    options: Options,
}

#[derive(Debug, Serialize)]
struct Options {
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// HTTP client for a self-hosted `/api/chat` endpoint.
pub struct HttpInferenceClient {
    base_url: String,
    temperature: f64,
    client: Client,
}

impl HttpInferenceClient {
    pub fn new(base_url: &str, timeout: Duration, temperature: f64) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            temperature,
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }
}

#[async_trait]
impl InferenceGateway for HttpInferenceClient {
    async fn complete(&self, model: &str, messages: &[ChatTurn]) -> anyhow::Result<String> {
        let request = ChatRequest {
            model,
            messages,
            stream: false,
            options: Options {
                temperature: self.temperature,
            },
        };
        let url = format!("{}/api/chat", self.base_url);

        let response = self.client.post(&url).json(&request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            anyhow::bail!("inference endpoint returned {status}");
        }

        let chat_response: ChatResponse = response.json().await?;
        Ok(chat_response.message.content)
    }
}
