use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limiter::{LimiterError, QuotaEnforcer, UsageSnapshot};
use crate::store::CallKind;

/// Token usage reported by a completed generation call.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Clone, Debug)]
pub struct Generation {
    pub text: String,
    pub usage: Usage,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("api error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// The metered capability this crate gates. Real provider bindings live
/// behind this seam; the limiter never interprets responses beyond the
/// usage metadata a generation returns.
#[async_trait]
pub trait ModelApi: Send + Sync {
    async fn embed(&self, content: &str) -> Result<Vec<f32>, ApiError>;

    async fn generate(&self, prompt: &str) -> Result<Generation, ApiError>;

    async fn count_tokens(&self, content: &str) -> Result<u32, ApiError>;
}

#[async_trait]
impl<T: ModelApi + ?Sized> ModelApi for Arc<T> {
    async fn embed(&self, content: &str) -> Result<Vec<f32>, ApiError> {
        self.as_ref().embed(content).await
    }

    async fn generate(&self, prompt: &str) -> Result<Generation, ApiError> {
        self.as_ref().generate(prompt).await
    }

    async fn count_tokens(&self, content: &str) -> Result<u32, ApiError> {
        self.as_ref().count_tokens(content).await
    }
}

#[derive(Debug, Error)]
pub enum GatedClientError {
    #[error("quota rejected: {0}")]
    Limiter(#[from] LimiterError),
    #[error("api call failed: {0}")]
    Api(#[from] ApiError),
}

/// Rate-limited wrapper over a [`ModelApi`].
///
/// One enforcer/store pair is constructed at process start and a handle
/// passed into every component that gates calls; there is no ambient
/// singleton. Every wrapped call is admitted before the underlying api
/// is invoked, so a rejected attempt never reaches the network.
pub struct GatedClient<A: ModelApi> {
    enforcer: Arc<QuotaEnforcer>,
    api: A,
}

impl<A: ModelApi> GatedClient<A> {
    pub fn new(enforcer: Arc<QuotaEnforcer>, api: A) -> Self {
        Self { enforcer, api }
    }

    /// Embedding cost is priced by content size alone: `ceil(chars / 4)`,
    /// floored at 1. The estimate is never reconciled because the call
    /// shape returns no ground-truth usage.
    pub async fn embed(&self, content: &str) -> Result<Vec<f32>, GatedClientError> {
        let estimated = embedding_token_estimate(content);
        let _permit = self
            .enforcer
            .authorize(CallKind::Embedding, estimated)
            .await?;
        Ok(self.api.embed(content).await?)
    }

    /// Exact pre-call token count. Admitted against the request-count
    /// tiers only; counting has no generation cost, so its token cost
    /// is zero.
    pub async fn count_tokens(&self, content: &str) -> Result<u32, GatedClientError> {
        let _permit = self.enforcer.authorize(CallKind::TokenCount, 0).await?;
        Ok(self.api.count_tokens(content).await?)
    }

    /// Generation is admitted with an estimate of the exact input count
    /// plus an output heuristic of twice the input count, then the record
    /// is reconciled to the usage metadata the call itself reports.
    pub async fn generate(&self, prompt: &str) -> Result<Generation, GatedClientError> {
        let input_tokens = self.count_tokens(prompt).await?;
        let estimated = generation_token_estimate(input_tokens);

        let permit = self
            .enforcer
            .authorize(CallKind::Generation, estimated)
            .await?;
        let generation = self.api.generate(prompt).await?;

        self.enforcer
            .report_actual_usage(&permit, u64::from(generation.usage.total_tokens()))
            .await?;
        Ok(generation)
    }

    pub async fn usage_snapshot(&self) -> Result<UsageSnapshot, GatedClientError> {
        Ok(self.enforcer.usage_snapshot().await?)
    }
}

pub(crate) fn embedding_token_estimate(content: &str) -> u64 {
    let chars = content.chars().count() as u64;
    chars.div_ceil(4).max(1)
}

pub(crate) fn generation_token_estimate(input_tokens: u32) -> u64 {
    let input = u64::from(input_tokens);
    input.saturating_add(input.saturating_mul(2))
}
