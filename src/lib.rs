pub mod client;
pub mod config;
pub mod limiter;
pub mod store;

pub use client::{ApiError, GatedClient, GatedClientError, Generation, ModelApi, Usage};
pub use config::{ConfigError, LimiterConfig};
pub use limiter::{
    Clock, DAY_WINDOW, LimiterError, MINUTE_WINDOW, Permit, QuotaEnforcer, QuotaLimits,
    SystemClock, UsageSnapshot,
};
pub use store::{CallKind, CallRecord, RecordId, StoreError, UsageStore, WindowUsage};
