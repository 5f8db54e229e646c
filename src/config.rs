use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::limiter::QuotaLimits;

/// Recognized limiter options. The component itself takes limits as
/// given; the free-tier defaults live here, in the loader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default = "default_rpm_limit")]
    pub rpm_limit: u32,
    #[serde(default = "default_tpm_limit")]
    pub tpm_limit: u32,
    #[serde(default = "default_rpd_limit")]
    pub rpd_limit: u32,
    pub store_path: PathBuf,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid limiter config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl LimiterConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn limits(&self) -> QuotaLimits {
        QuotaLimits {
            rpm_limit: self.rpm_limit,
            tpm_limit: self.tpm_limit,
            rpd_limit: self.rpd_limit,
        }
    }
}

fn default_rpm_limit() -> u32 {
    15
}

fn default_tpm_limit() -> u32 {
    250_000
}

fn default_rpd_limit() -> u32 {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_limits_fall_back_to_free_tier_defaults() {
        let config = LimiterConfig::from_toml_str(r#"store_path = "./rate_limits.db""#)
            .expect("parse");
        assert_eq!(config.rpm_limit, 15);
        assert_eq!(config.tpm_limit, 250_000);
        assert_eq!(config.rpd_limit, 1_000);
        assert_eq!(config.store_path, PathBuf::from("./rate_limits.db"));
    }

    #[test]
    fn explicit_limits_override_defaults() {
        let config = LimiterConfig::from_toml_str(
            "rpm_limit = 5\ntpm_limit = 100\nrpd_limit = 0\nstore_path = \"/tmp/usage.sqlite\"",
        )
        .expect("parse");
        let limits = config.limits();
        assert_eq!(limits.rpm_limit, 5);
        assert_eq!(limits.tpm_limit, 100);
        assert_eq!(limits.rpd_limit, 0);
    }

    #[test]
    fn store_path_is_required() {
        assert!(LimiterConfig::from_toml_str("rpm_limit = 5").is_err());
    }
}
