use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use quotagate::{
    ApiError, GatedClient, GatedClientError, Generation, LimiterError, ModelApi, QuotaEnforcer,
    QuotaLimits, Usage, UsageStore,
};

#[derive(Default)]
struct MockApi {
    embeds: AtomicU32,
    generations: AtomicU32,
    token_counts: AtomicU32,
    input_tokens: u32,
    usage: Usage,
}

#[async_trait]
impl ModelApi for MockApi {
    async fn embed(&self, _content: &str) -> Result<Vec<f32>, ApiError> {
        self.embeds.fetch_add(1, Ordering::SeqCst);
        Ok(vec![0.0; 4])
    }

    async fn generate(&self, _prompt: &str) -> Result<Generation, ApiError> {
        self.generations.fetch_add(1, Ordering::SeqCst);
        Ok(Generation {
            text: "ok".to_string(),
            usage: self.usage,
        })
    }

    async fn count_tokens(&self, _content: &str) -> Result<u32, ApiError> {
        self.token_counts.fetch_add(1, Ordering::SeqCst);
        Ok(self.input_tokens)
    }
}

fn limits(rpm: u32, tpm: u32, rpd: u32) -> QuotaLimits {
    QuotaLimits {
        rpm_limit: rpm,
        tpm_limit: tpm,
        rpd_limit: rpd,
    }
}

async fn client(
    dir: &tempfile::TempDir,
    limits: QuotaLimits,
    api: Arc<MockApi>,
) -> GatedClient<Arc<MockApi>> {
    let store = UsageStore::new(dir.path().join("usage.sqlite"));
    store.init().await.expect("init");
    GatedClient::new(Arc::new(QuotaEnforcer::new(store, limits)), api)
}

#[tokio::test]
async fn embed_records_a_size_based_estimate_and_never_reconciles() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = client(&dir, limits(10, 1_000, 100), Arc::new(MockApi::default())).await;

    // 10 chars -> ceil(10 / 4) = 3 tokens.
    client.embed("0123456789").await.expect("embed");

    let snapshot = client.usage_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.requests_per_minute, 1);
    assert_eq!(snapshot.tokens_per_minute, 3);
}

#[tokio::test]
async fn rejected_embed_never_reaches_the_api() {
    let dir = tempfile::tempdir().expect("tempdir");
    let api = Arc::new(MockApi::default());
    let client = client(&dir, limits(0, 1_000, 100), Arc::clone(&api)).await;

    let err = client.embed("hello").await.expect_err("rpm 0 rejects");
    assert!(matches!(
        err,
        GatedClientError::Limiter(LimiterError::RpmExceeded { .. })
    ));
    let snapshot = client.usage_snapshot().await.expect("snapshot");
    assert_eq!(snapshot.requests_per_minute, 0);
    assert_eq!(api.embeds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn generate_reconciles_the_estimate_to_reported_usage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let api = Arc::new(MockApi {
        input_tokens: 10,
        usage: Usage {
            input_tokens: 10,
            output_tokens: 15,
        },
        ..MockApi::default()
    });
    let client = client(&dir, limits(10, 1_000, 100), Arc::clone(&api)).await;

    let generation = client.generate("prompt").await.expect("generate");
    assert_eq!(generation.usage.total_tokens(), 25);
    assert_eq!(api.generations.load(Ordering::SeqCst), 1);

    let snapshot = client.usage_snapshot().await.expect("snapshot");
    // One token-count admission (zero cost) plus one generation.
    assert_eq!(snapshot.requests_per_minute, 2);
    // 25 from the reconciled record, not 30 estimated and not 55.
    assert_eq!(snapshot.tokens_per_minute, 25);
}

#[tokio::test]
async fn token_counting_is_exempt_from_the_token_tier() {
    let dir = tempfile::tempdir().expect("tempdir");
    let api = Arc::new(MockApi {
        input_tokens: 10,
        ..MockApi::default()
    });
    let client = client(&dir, limits(10, 0, 100), Arc::clone(&api)).await;

    // The pre-count is admitted even with tpm_limit = 0; the generation
    // itself is then rejected on its 30-token estimate, before the api.
    let err = client.generate("prompt").await.expect_err("tpm 0 rejects");
    assert!(matches!(
        err,
        GatedClientError::Limiter(LimiterError::TpmExceeded {
            used: 0,
            requested: 30,
            limit: 0,
            ..
        })
    ));

    assert_eq!(api.token_counts.load(Ordering::SeqCst), 1);
    assert_eq!(api.generations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn count_tokens_consumes_a_request_slot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let api = Arc::new(MockApi {
        input_tokens: 4,
        ..MockApi::default()
    });
    let client = client(&dir, limits(1, 1_000, 100), api).await;

    client.count_tokens("hello").await.expect("first request");
    let err = client.count_tokens("hello").await.expect_err("rpm spent");
    assert!(matches!(
        err,
        GatedClientError::Limiter(LimiterError::RpmExceeded { .. })
    ));
}
