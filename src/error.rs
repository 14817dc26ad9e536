use thiserror::Error;

/// Request-terminating and degraded-mode failures of the relay.
///
/// The first three variants are terminal checks: no retry, no side effects
/// beyond the failed lookup. `InferenceUnavailable` is terminal for the
/// request but is always preceded by a refund of the debited cost.
/// `DeliveryFailed` and `StorageDegraded` are non-fatal: they are logged and
/// never undo a legitimately incurred inference charge.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("tenant {0} is not active")]
    TenantInactive(String),

    #[error("insufficient credit for tenant {tenant_id} (cost {cost})")]
    InsufficientCredit { tenant_id: String, cost: i64 },

    #[error("inference gateway unavailable: {0}")]
    InferenceUnavailable(String),

    #[error("delivery via {platform} failed: {message}")]
    DeliveryFailed { platform: String, message: String },

    #[error("storage degraded: {0}")]
    StorageDegraded(String),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// Stable machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TenantNotFound(_) => "tenant_not_found",
            Self::TenantInactive(_) => "tenant_inactive",
            Self::InsufficientCredit { .. } => "insufficient_credit",
            Self::InferenceUnavailable(_) => "inference_unavailable",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::StorageDegraded(_) => "storage_degraded",
            Self::Other(_) => "internal",
        }
    }
}

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, RelayError>;
