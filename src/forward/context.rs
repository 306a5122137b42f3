//! Per-request context structures.
//!
//! A `DispatchPlan` is built per request and owns copies of the selected
//! backend and the effective failover list. Handlers never mutate the
//! shared catalog; the plan is the only thing the orchestrator sees.

use std::time::Duration;

use uuid::Uuid;

use crate::config::{BackendCfg, ProviderCfg, Settings};

use super::client::CancelRegistry;
use super::failover::CooldownGate;

/// The caller's wire dialect, used to phrase response and error bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Anthropic,
    OpenAi,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Anthropic => "anthropic",
            Dialect::OpenAi => "openai",
        }
    }
}

/// A backend together with its resolved provider descriptor.
#[derive(Debug, Clone)]
pub struct BackendRef {
    pub backend: BackendCfg,
    pub provider: ProviderCfg,
}

impl BackendRef {
    pub fn model(&self) -> &str {
        &self.backend.model
    }

    pub fn model_id(&self) -> &str {
        self.backend.model_id()
    }
}

/// Everything the failover orchestrator needs, passed by value. The
/// primary is the selected backend; `failover` is the rest of the catalog
/// in configured order.
#[derive(Debug, Clone)]
pub struct DispatchPlan {
    pub request_id: Uuid,
    pub original_model: String,
    pub estimated_tokens: u64,
    pub primary: BackendRef,
    pub failover: Vec<BackendRef>,
}

impl DispatchPlan {
    /// Attempt order for one cycle. While the primary cools down it is
    /// omitted entirely.
    pub fn attempt_list(&self, include_primary: bool) -> Vec<&BackendRef> {
        let mut attempts = Vec::with_capacity(1 + self.failover.len());
        if include_primary {
            attempts.push(&self.primary);
        }
        attempts.extend(self.failover.iter());
        attempts
    }

    /// Multi-backend failover is only active with a non-empty list;
    /// otherwise a single attempt is made and errors propagate.
    pub fn failover_active(&self) -> bool {
        !self.failover.is_empty()
    }
}

/// Token usage captured from upstream responses or streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self { prompt_tokens: prompt, completion_tokens: completion }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Process-wide shared state. The settings and catalog are immutable
/// after startup; the cooldown gate and cancel registry are the only
/// mutable members and synchronize internally.
pub struct AppState {
    pub settings: Settings,
    pub http: reqwest::Client,
    pub cooldown: CooldownGate,
    pub cancels: CancelRegistry,
}

impl AppState {
    pub fn new(settings: Settings) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {}", e))?;
        Ok(Self {
            settings,
            http,
            cooldown: CooldownGate::new(),
            cancels: CancelRegistry::new(),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.request_timeout)
    }
}
