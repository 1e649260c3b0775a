//! Operator configuration from command-line flags and `PKO_*` environment variables

use std::net::SocketAddr;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::controller::{Chunker, DeploymentSettings};
use crate::error::{Error, Result};

/// How template phases are split into ObjectSlices
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum SliceStrategy {
    /// Keep every phase inline in the ObjectSet
    #[value(name = "none")]
    Inline,
    /// One slice per object
    EachObject,
    /// Pack objects into slices up to the size threshold
    #[default]
    Binpack,
}

#[derive(Clone, Debug, Parser)]
#[command(name = "package-operator")]
#[command(about = "Rolls out phased, revisioned object sets", long_about = None)]
#[command(version)]
pub struct OperatorConfig {
    /// Only watch this namespace. Watches all namespaces when unset.
    #[arg(long, env = "PKO_NAMESPACE")]
    pub namespace: Option<String>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, env = "PKO_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long, env = "PKO_LOG_JSON")]
    pub json: bool,

    /// Listen address of the health, metrics and cache API
    #[arg(long, env = "PKO_API_BIND", default_value = "0.0.0.0:8080")]
    pub api_bind: SocketAddr,

    #[arg(long, env = "PKO_SLICE_STRATEGY", value_enum, default_value_t = SliceStrategy::Binpack)]
    pub slice_strategy: SliceStrategy,

    /// Upper bound for the serialized size of one binpacked slice
    #[arg(long, env = "PKO_SLICE_THRESHOLD_BYTES", default_value_t = crate::controller::chunker::DEFAULT_SLICE_THRESHOLD)]
    pub slice_threshold_bytes: usize,

    /// Attempts for a read-modify-write before giving up on conflicts
    #[arg(long, env = "PKO_CONFLICT_RETRIES", default_value_t = 5)]
    pub conflict_retries: u32,

    /// Salted rename attempts before a slice collision is surfaced
    #[arg(long, env = "PKO_MAX_COLLISION_COUNT", default_value_t = 5)]
    pub max_collision_count: i32,

    /// History limit for deployments that do not set revisionHistoryLimit
    #[arg(long, env = "PKO_DEFAULT_REVISION_HISTORY_LIMIT", default_value_t = 10)]
    pub default_revision_history_limit: i32,

    #[arg(long, env = "PKO_RECONCILE_TIMEOUT_SECS", default_value_t = 60)]
    pub reconcile_timeout_secs: u64,

    /// How long a new informer may take to list its kind
    #[arg(long, env = "PKO_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 30)]
    pub cache_sync_timeout_secs: u64,
}

impl OperatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.slice_strategy == SliceStrategy::Binpack && self.slice_threshold_bytes == 0 {
            return Err(Error::ConfigError(
                "slice threshold must be greater than zero".to_string(),
            ));
        }
        if self.conflict_retries == 0 {
            return Err(Error::ConfigError(
                "conflict retries must be at least 1".to_string(),
            ));
        }
        if self.max_collision_count < 0 {
            return Err(Error::ConfigError(
                "max collision count must not be negative".to_string(),
            ));
        }
        if self.default_revision_history_limit < 0 {
            return Err(Error::ConfigError(
                "default revision history limit must not be negative".to_string(),
            ));
        }
        if self.reconcile_timeout_secs == 0 || self.cache_sync_timeout_secs == 0 {
            return Err(Error::ConfigError("timeouts must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn chunker(&self) -> Chunker {
        match self.slice_strategy {
            SliceStrategy::Inline => Chunker::NoOp,
            SliceStrategy::EachObject => Chunker::EachObject,
            SliceStrategy::Binpack => Chunker::Binpack {
                max_bytes: self.slice_threshold_bytes,
            },
        }
    }

    pub fn deployment_settings(&self) -> DeploymentSettings {
        DeploymentSettings {
            chunker: self.chunker(),
            conflict_retries: self.conflict_retries,
            max_collision_count: self.max_collision_count,
            default_history_limit: self.default_revision_history_limit,
        }
    }

    pub fn reconcile_timeout(&self) -> Duration {
        Duration::from_secs(self.reconcile_timeout_secs)
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> OperatorConfig {
        OperatorConfig::try_parse_from(std::iter::once("package-operator").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert!(config.validate().is_ok());
        assert_eq!(config.api_bind.port(), 8080);
        assert_eq!(config.reconcile_timeout(), Duration::from_secs(60));

        let settings = config.deployment_settings();
        assert_eq!(settings.chunker, Chunker::default());
        assert_eq!(settings.conflict_retries, 5);
        assert_eq!(settings.max_collision_count, 5);
        assert_eq!(settings.default_history_limit, 10);
    }

    #[test]
    fn test_slice_strategy_flags() {
        let config = parse(&["--slice-strategy", "each-object"]);
        assert_eq!(config.chunker(), Chunker::EachObject);

        let config = parse(&["--slice-strategy", "binpack", "--slice-threshold-bytes", "1024"]);
        assert_eq!(config.chunker(), Chunker::Binpack { max_bytes: 1024 });

        let config = parse(&["--slice-strategy", "none", "--slice-threshold-bytes", "0"]);
        assert_eq!(config.chunker(), Chunker::NoOp);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(parse(&["--slice-threshold-bytes", "0"]).validate().is_err());
        assert!(parse(&["--conflict-retries", "0"]).validate().is_err());
        assert!(parse(&["--max-collision-count=-1"]).validate().is_err());
        assert!(parse(&["--reconcile-timeout-secs", "0"]).validate().is_err());
        assert!(parse(&["--namespace", "team-a"]).validate().is_ok());
    }
}
