//! Relay configuration.
//!
//! Environment variables are the sole config source, read once at startup.
//!
//! # Required
//! - `DATABASE_URL`
//! - `REDIS_URL`
//! - `HERALD_HMAC_SECRET` (process-wide signing secret used when a
//!   subscriber has no secret of its own)
//!
//! # Optional (defaults in parentheses)
//! - `HERALD_API_BIND` (`0.0.0.0:8080`)
//! - `HERALD_WORKER_CONCURRENCY` (8)
//! - `HERALD_DB_POOL_SIZE` (10)
//! - `HERALD_RATE_LIMIT_FREE` (60), `HERALD_RATE_LIMIT_PRO` (600),
//!   `HERALD_RATE_LIMIT_ENT` (6000) — tokens per minute
//! - `SERVER_ID` (generated `srv_…` id, unique per process instance)

use std::time::Duration;

use herald_protocol::{generate_id, id_prefix};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub database_url: String,
    pub redis_url: String,
    pub api_bind: String,
    pub db_pool_size: u32,
    pub worker_concurrency: usize,
    pub hmac_secret: String,
    pub rate_limit_free: u32,
    pub rate_limit_pro: u32,
    pub rate_limit_ent: u32,
    /// Unique per process instance; used for cross-server tunnel routing.
    pub server_id: String,
    pub tunnel_heartbeat: Duration,
    pub tunnel_queue_capacity: usize,
    pub handshake_timeout: Duration,
    pub ingest_deadline: Duration,
    pub delivery_timeout: Duration,
    pub worker_job_budget: Duration,
    /// Sleep between queue polls when both lanes are empty.
    pub worker_poll_interval: Duration,
    pub stats_interval: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} is not a valid value: {value}")]
    Invalid { name: &'static str, value: String },
}

impl RelayConfig {
    /// Load from process environment variables.
    pub fn from_env() -> Result<RelayConfig, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup.  `from_env` delegates here;
    /// tests supply a closure over a map.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<RelayConfig, ConfigError> {
        let required = |name: &'static str| lookup(name).ok_or(ConfigError::Missing(name));
        let parsed = |name: &'static str, default: u64| -> Result<u64, ConfigError> {
            match lookup(name) {
                None => Ok(default),
                Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                    name,
                    value: raw.clone(),
                }),
            }
        };

        Ok(RelayConfig {
            database_url: required("DATABASE_URL")?,
            redis_url: required("REDIS_URL")?,
            api_bind: lookup("HERALD_API_BIND").unwrap_or_else(|| "0.0.0.0:8080".to_owned()),
            db_pool_size: parsed("HERALD_DB_POOL_SIZE", 10)? as u32,
            worker_concurrency: parsed("HERALD_WORKER_CONCURRENCY", 8)? as usize,
            hmac_secret: required("HERALD_HMAC_SECRET")?,
            rate_limit_free: parsed("HERALD_RATE_LIMIT_FREE", 60)? as u32,
            rate_limit_pro: parsed("HERALD_RATE_LIMIT_PRO", 600)? as u32,
            rate_limit_ent: parsed("HERALD_RATE_LIMIT_ENT", 6000)? as u32,
            server_id: lookup("SERVER_ID").unwrap_or_else(|| generate_id(id_prefix::SERVER)),
            tunnel_heartbeat: Duration::from_secs(30),
            tunnel_queue_capacity: 64,
            handshake_timeout: Duration::from_secs(10),
            ingest_deadline: Duration::from_secs(10),
            delivery_timeout: Duration::from_secs(30),
            worker_job_budget: Duration::from_secs(60),
            worker_poll_interval: Duration::from_millis(500),
            stats_interval: Duration::from_secs(60),
        })
    }

    /// Tokens per minute for a rate-limit tier.  Unknown tiers get the
    /// free-tier limit.
    pub fn tier_limit(&self, tier: &str) -> u32 {
        match tier {
            "pro" => self.rate_limit_pro,
            "enterprise" => self.rate_limit_ent,
            _ => self.rate_limit_free,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, String> {
        HashMap::from([
            ("DATABASE_URL", "postgres://localhost/herald".to_owned()),
            ("REDIS_URL", "redis://localhost:6379".to_owned()),
            ("HERALD_HMAC_SECRET", "s3cret".to_owned()),
        ])
    }

    #[test]
    fn defaults_applied() {
        let vars = base_vars();
        let cfg = RelayConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(cfg.api_bind, "0.0.0.0:8080");
        assert_eq!(cfg.db_pool_size, 10);
        assert_eq!(cfg.worker_concurrency, 8);
        assert_eq!(cfg.rate_limit_free, 60);
        assert_eq!(cfg.rate_limit_pro, 600);
        assert_eq!(cfg.rate_limit_ent, 6000);
        assert_eq!(cfg.tunnel_queue_capacity, 64);
        assert!(cfg.server_id.starts_with("srv_"));
    }

    #[test]
    fn missing_required_is_an_error() {
        let mut vars = base_vars();
        vars.remove("HERALD_HMAC_SECRET");
        let err = RelayConfig::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("HERALD_HMAC_SECRET")));
    }

    #[test]
    fn malformed_numeric_is_an_error() {
        let mut vars = base_vars();
        vars.insert("HERALD_WORKER_CONCURRENCY", "eight".to_owned());
        let err = RelayConfig::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                name: "HERALD_WORKER_CONCURRENCY",
                ..
            }
        ));
    }

    #[test]
    fn tier_limits_resolve() {
        let vars = base_vars();
        let cfg = RelayConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(cfg.tier_limit("free"), 60);
        assert_eq!(cfg.tier_limit("pro"), 600);
        assert_eq!(cfg.tier_limit("enterprise"), 6000);
        assert_eq!(cfg.tier_limit("unknown"), 60);
    }
}
