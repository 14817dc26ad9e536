use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub inference: InferenceConfig,

    #[serde(default)]
    pub meta: MetaConfig,

    #[serde(default)]
    pub credits: CreditsConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub dedup: DedupConfig,
}

// ── HTTP server ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host (default: 127.0.0.1)
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port (default: 8080)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Whole-request timeout. Must exceed the inference timeout or public
    /// chat calls are cut off mid-generation.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Request body cap in bytes (default: 64KB)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_body_bytes() -> usize {
    65_536
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

// ── Persistence ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL. `mode=rwc` creates the file on first run.
    #[serde(default = "default_database_url")]
    pub url: String,
}

fn default_database_url() -> String {
    "sqlite:botrelay.db?mode=rwc".into()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

// ── Inference gateway ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Base URL of the self-hosted LLM endpoint
    #[serde(default = "default_inference_url")]
    pub base_url: String,
    /// Model used when a tenant has none configured
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Hard bound on a single generation call
    #[serde(default = "default_inference_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_inference_url() -> String {
    "http://localhost:11434".into()
}

fn default_model() -> String {
    "llama3".into()
}

fn default_temperature() -> f64 {
    0.2
}

fn default_inference_timeout_secs() -> u64 {
    45
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: default_inference_url(),
            default_model: default_model(),
            temperature: default_temperature(),
            timeout_secs: default_inference_timeout_secs(),
        }
    }
}

// ── Meta Graph API ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    #[serde(default = "default_graph_base_url")]
    pub graph_base_url: String,
    /// Shared secret echoed during the GET verification handshake
    #[serde(default)]
    pub verify_token: String,
    /// App secret for X-Hub-Signature-256 validation. Unset skips the check.
    #[serde(default)]
    pub app_secret: Option<String>,
    /// Bound on a single reply push (seconds)
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

fn default_graph_base_url() -> String {
    "https://graph.facebook.com/v19.0".into()
}

fn default_send_timeout_secs() -> u64 {
    10
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            graph_base_url: default_graph_base_url(),
            verify_token: String::new(),
            app_secret: None,
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

// ── Credit metering ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditsConfig {
    /// Units debited per inference request
    #[serde(default = "default_chat_cost")]
    pub chat_cost: i64,
    /// Seed balance for newly created tenants
    #[serde(default = "default_initial_balance")]
    pub initial_balance: i64,
}

fn default_chat_cost() -> i64 {
    5
}

fn default_initial_balance() -> i64 {
    100
}

impl Default for CreditsConfig {
    fn default() -> Self {
        Self {
            chat_cost: default_chat_cost(),
            initial_balance: default_initial_balance(),
        }
    }
}

// ── Conversation memory ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Messages replayed into the prompt (3 exchanges)
    #[serde(default = "default_window_limit")]
    pub window_limit: usize,
}

fn default_window_limit() -> usize {
    6
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            window_limit: default_window_limit(),
        }
    }
}

// ── Webhook dedup ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Platform retries land within seconds; 60s covers the retry window.
    #[serde(default = "default_dedup_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_dedup_ttl_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    30
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_dedup_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────

impl Config {
    /// Load from a TOML file, falling back to defaults when the file is
    /// absent, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let raw = fs::read_to_string(p)
                    .with_context(|| format!("read config file {}", p.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parse config file {}", p.display()))?
            }
            Some(p) => {
                anyhow::bail!("config file not found: {}", p.display());
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment variables win over file values — secrets especially
    /// should come from the environment, not from disk.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("BOTRELAY_DATABASE_URL") {
            if !url.is_empty() {
                self.database.url = url;
            }
        }
        if let Ok(url) = std::env::var("BOTRELAY_INFERENCE_URL") {
            if !url.is_empty() {
                self.inference.base_url = url;
            }
        }
        if let Ok(token) = std::env::var("BOTRELAY_VERIFY_TOKEN") {
            if !token.is_empty() {
                self.meta.verify_token = token;
            }
        }
        if let Ok(secret) = std::env::var("BOTRELAY_APP_SECRET") {
            let secret = secret.trim().to_owned();
            if !secret.is_empty() {
                self.meta.app_secret = Some(secret);
            }
        }
        if let Ok(host) = std::env::var("BOTRELAY_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port) = std::env::var("BOTRELAY_PORT") {
            if let Ok(parsed) = port.parse() {
                self.server.port = parsed;
            }
        }
    }
}
