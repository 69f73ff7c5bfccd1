//! Executor configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Number of `work()` calls between cooperative yields. Zero disables
    /// periodic yielding; queued writes then apply only when the run ends.
    pub yield_every_works: usize,

    /// Maximum number of live tickets in the candidate pool.
    pub pool_capacity: usize,

    /// Optional cap on `work()` calls per run. Exceeding it aborts the run.
    pub max_works: Option<u64>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            yield_every_works: 128,
            pool_capacity: 1 << 20,
            max_works: None,
        }
    }
}

impl ExecConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `PLANSTAGE_YIELD_EVERY_WORKS`: work calls between yields
    /// - `PLANSTAGE_POOL_CAPACITY`: live ticket limit
    /// - `PLANSTAGE_MAX_WORKS`: per-run work cap
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("PLANSTAGE_YIELD_EVERY_WORKS") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.yield_every_works = v;
            }
        }

        if let Ok(s) = std::env::var("PLANSTAGE_POOL_CAPACITY") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.pool_capacity = v;
            }
        }

        if let Ok(s) = std::env::var("PLANSTAGE_MAX_WORKS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.max_works = Some(v);
            }
        }

        cfg
    }

    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_capacity == 0 {
            return Err(Error::Config("pool_capacity must be non-zero".into()));
        }
        if self.max_works == Some(0) {
            return Err(Error::Config("max_works must be non-zero when set".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let cfg = ExecConfig::from_json_str(r#"{"yield_every_works": 4}"#).unwrap();
        assert_eq!(cfg.yield_every_works, 4);
        assert_eq!(cfg.pool_capacity, ExecConfig::default().pool_capacity);
        assert_eq!(cfg.max_works, None);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = ExecConfig::from_json_str(r#"{"pool_capacity": 0}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn malformed_json_maps_to_config_error() {
        let err = ExecConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
