use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::store::{CallKind, RecordId, StoreError, UsageStore};

pub const MINUTE_WINDOW: Duration = Duration::from_secs(60);
pub const DAY_WINDOW: Duration = Duration::from_secs(86_400);

/// Ledger retention horizon. Far longer than any realistic reconciliation
/// delay, so pruning never races a pending token correction destructively.
const RETENTION: Duration = DAY_WINDOW;

/// Admissions between opportunistic prune sweeps.
const PRUNE_EVERY: u64 = 20;

/// Immutable quota configuration. A limit of 0 is legal and means
/// "always reject".
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub rpm_limit: u32,
    pub tpm_limit: u32,
    pub rpd_limit: u32,
}

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("rpd limit exceeded: {used}/{limit} requests in last 24h")]
    RpdExceeded {
        used: u64,
        limit: u32,
        reset_at_ms: i64,
    },
    #[error("rpm limit exceeded: {used}/{limit} requests in last 60s")]
    RpmExceeded {
        used: u64,
        limit: u32,
        reset_at_ms: i64,
    },
    #[error("tpm limit exceeded: used={used} requested={requested} limit={limit}")]
    TpmExceeded {
        used: u64,
        requested: u64,
        limit: u32,
        reset_at_ms: i64,
    },
    #[error("usage store error: {0}")]
    Store(#[from] StoreError),
}

impl LimiterError {
    /// True for quota rejections, which are recoverable by waiting;
    /// false for storage failures, where capacity is indeterminate.
    pub fn is_quota_rejection(&self) -> bool {
        !matches!(self, LimiterError::Store(_))
    }

    /// Earliest instant at which the offending window frees headroom.
    /// For the token tier this is the moment the oldest counted record
    /// ages out, which may free only partial headroom.
    pub fn reset_at_ms(&self) -> Option<i64> {
        match self {
            LimiterError::RpdExceeded { reset_at_ms, .. }
            | LimiterError::RpmExceeded { reset_at_ms, .. }
            | LimiterError::TpmExceeded { reset_at_ms, .. } => Some(*reset_at_ms),
            LimiterError::Store(_) => None,
        }
    }
}

/// Proof of admission, carrying the ledger row identity so the estimate
/// can be reconciled once the call's true cost is known.
#[derive(Clone, Copy, Debug)]
#[must_use]
pub struct Permit {
    record_id: RecordId,
    pub estimated_tokens: u64,
}

pub trait Clock: Send + Sync {
    fn now_epoch_millis(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_millis(&self) -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Current usage and remaining headroom for all three tiers, recomputed
/// from the ledger on every call.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub requests_per_minute: u64,
    pub rpm_limit: u32,
    pub tokens_per_minute: u64,
    pub tpm_limit: u32,
    pub requests_per_day: u64,
    pub rpd_limit: u32,
    pub rpm_remaining: u64,
    pub tpm_remaining: u64,
    pub rpd_remaining: u64,
}

/// Pre-call admission gate over three sliding-window quota tiers.
///
/// The check-then-append sequence runs under one async mutex, so two
/// concurrent callers can never both observe `count = limit - 1` and
/// both append. That mutex is the atomicity boundary for all three
/// tiers at once; reads outside `authorize` take no lock.
pub struct QuotaEnforcer {
    store: UsageStore,
    limits: QuotaLimits,
    clock: Box<dyn Clock>,
    admission: Mutex<u64>,
}

impl QuotaEnforcer {
    pub fn new(store: UsageStore, limits: QuotaLimits) -> Self {
        Self::with_clock(store, limits, Box::new(SystemClock))
    }

    pub fn with_clock(store: UsageStore, limits: QuotaLimits, clock: Box<dyn Clock>) -> Self {
        Self {
            store,
            limits,
            clock,
            admission: Mutex::new(0),
        }
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    /// Admits or rejects one prospective call.
    ///
    /// The check order is fixed policy: daily cap first (scarcest,
    /// slowest to recover), then the per-minute request cap, then the
    /// per-minute token cap. Request tiers admit up to exactly `limit`
    /// calls; the token tier admits a call landing exactly at the cap
    /// but rejects one that would cross it. A storage failure is
    /// surfaced as [`LimiterError::Store`], never as admit-or-reject.
    pub async fn authorize(
        &self,
        kind: CallKind,
        estimated_tokens: u64,
    ) -> Result<Permit, LimiterError> {
        let mut admitted = self.admission.lock().await;
        let now_ms = self.clock.now_epoch_millis();

        let day = self.store.window_usage(now_ms, DAY_WINDOW).await?;
        if day.requests >= u64::from(self.limits.rpd_limit) {
            let err = LimiterError::RpdExceeded {
                used: day.requests,
                limit: self.limits.rpd_limit,
                reset_at_ms: reset_at(day.oldest_ts_ms, now_ms, DAY_WINDOW),
            };
            tracing::warn!(used = day.requests, limit = self.limits.rpd_limit, "rpd rejection");
            return Err(err);
        }

        let minute = self.store.window_usage(now_ms, MINUTE_WINDOW).await?;
        if minute.requests >= u64::from(self.limits.rpm_limit) {
            let err = LimiterError::RpmExceeded {
                used: minute.requests,
                limit: self.limits.rpm_limit,
                reset_at_ms: reset_at(minute.oldest_ts_ms, now_ms, MINUTE_WINDOW),
            };
            tracing::warn!(used = minute.requests, limit = self.limits.rpm_limit, "rpm rejection");
            return Err(err);
        }

        if minute.tokens.saturating_add(estimated_tokens) > u64::from(self.limits.tpm_limit) {
            let err = LimiterError::TpmExceeded {
                used: minute.tokens,
                requested: estimated_tokens,
                limit: self.limits.tpm_limit,
                reset_at_ms: reset_at(minute.oldest_ts_ms, now_ms, MINUTE_WINDOW),
            };
            tracing::warn!(
                used = minute.tokens,
                requested = estimated_tokens,
                limit = self.limits.tpm_limit,
                "tpm rejection"
            );
            return Err(err);
        }

        let record_id = self.store.append(kind, estimated_tokens, now_ms).await?;
        tracing::debug!(kind = kind.as_str(), estimated_tokens, "call admitted");

        *admitted += 1;
        if *admitted % PRUNE_EVERY == 0 {
            // Amortized maintenance; the admission above already succeeded.
            if let Err(err) = self.store.prune(now_ms, RETENTION).await {
                tracing::warn!(error = %err, "retention prune failed");
            }
        }

        Ok(Permit {
            record_id,
            estimated_tokens,
        })
    }

    /// Replaces the admission-time estimate with the call's true cost.
    /// Idempotent; a no-op if the record has since been pruned.
    pub async fn report_actual_usage(
        &self,
        permit: &Permit,
        actual_tokens: u64,
    ) -> Result<(), LimiterError> {
        self.store
            .update_tokens(permit.record_id, actual_tokens)
            .await?;
        Ok(())
    }

    pub async fn usage_snapshot(&self) -> Result<UsageSnapshot, LimiterError> {
        let now_ms = self.clock.now_epoch_millis();
        let minute = self.store.window_usage(now_ms, MINUTE_WINDOW).await?;
        let day = self.store.window_usage(now_ms, DAY_WINDOW).await?;

        Ok(UsageSnapshot {
            requests_per_minute: minute.requests,
            rpm_limit: self.limits.rpm_limit,
            tokens_per_minute: minute.tokens,
            tpm_limit: self.limits.tpm_limit,
            requests_per_day: day.requests,
            rpd_limit: self.limits.rpd_limit,
            rpm_remaining: u64::from(self.limits.rpm_limit).saturating_sub(minute.requests),
            tpm_remaining: u64::from(self.limits.tpm_limit).saturating_sub(minute.tokens),
            rpd_remaining: u64::from(self.limits.rpd_limit).saturating_sub(day.requests),
        })
    }
}

/// Sliding-window reset: the oldest counted record plus the window
/// duration. An empty window is only reachable with a limit of 0, in
/// which case the window never frees; report one full window out.
fn reset_at(oldest_ts_ms: Option<i64>, now_ms: i64, window: Duration) -> i64 {
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    oldest_ts_ms
        .unwrap_or(now_ms)
        .saturating_add(window_ms)
}
