//! Lease and refresh configuration.

use std::time::Duration;

use thiserror::Error;

use crate::refresh::retry::RetryPolicy;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("Refresh timeout ({timeout:?}) must be shorter than the lease TTL ({ttl:?})")]
    TimeoutNotBelowTtl { timeout: Duration, ttl: Duration },

    #[error("Stale threshold ({threshold:?}) must be at least the lease TTL ({ttl:?})")]
    ThresholdBelowTtl { threshold: Duration, ttl: Duration },
}

/// Configuration for lease-guarded refresh and the stale-lease reaper.
#[derive(Clone, Debug)]
pub struct LeaseConfig {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Passphrase for token encryption at rest.
    pub encryption_key: String,
    /// Prefix for holder ids generated by this process.
    pub instance: String,
    /// Age after which a lease may be taken over by `acquire`.
    pub lease_ttl: Duration,
    /// Age after which the reaper clears a lease.
    pub stale_threshold: Duration,
    /// Upper bound on the work one refresh attempt does under its lease.
    pub refresh_timeout: Duration,
    /// Tokens expiring within this window are refreshed preemptively.
    pub refresh_before_expiry: Duration,
    /// Time between reaper passes.
    pub reaper_interval: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_jitter: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost:5432/credlease".into(),
            encryption_key: "credlease-default-dev-key-change-in-production".into(),
            instance: "credlease".into(),
            lease_ttl: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(90),
            refresh_timeout: Duration::from_secs(30),
            refresh_before_expiry: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(30),
            retry_max_attempts: 4,
            retry_base_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(10),
            retry_jitter: Duration::from_millis(250),
        }
    }
}

impl LeaseConfig {
    /// Reads configuration from environment variables and validates it.
    ///
    /// | Variable                   | Default                                |
    /// |----------------------------|----------------------------------------|
    /// | `DATABASE_URL`             | `postgres://localhost:5432/credlease`  |
    /// | `CREDLEASE_ENCRYPTION_KEY` | dev key (change in production)         |
    /// | `CREDLEASE_INSTANCE`       | `credlease`                            |
    /// | `LEASE_TTL_MS`             | `60000`                                |
    /// | `LEASE_STALE_THRESHOLD_MS` | `90000`                                |
    /// | `REFRESH_TIMEOUT_MS`       | `30000`                                |
    /// | `REFRESH_BEFORE_EXPIRY_MS` | `300000`                               |
    /// | `REAPER_INTERVAL_MS`       | `30000`                                |
    /// | `RETRY_MAX_ATTEMPTS`       | `4`                                    |
    /// | `RETRY_BASE_DELAY_MS`      | `250`                                  |
    /// | `RETRY_MAX_DELAY_MS`       | `10000`                                |
    /// | `RETRY_JITTER_MS`          | `250`                                  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Self::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let ms = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(var) {
                Some(raw) => parse_u64(var, &raw).map(Duration::from_millis),
                None => Ok(default),
            }
        };

        let config = Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            encryption_key: lookup("CREDLEASE_ENCRYPTION_KEY").unwrap_or(defaults.encryption_key),
            instance: lookup("CREDLEASE_INSTANCE").unwrap_or(defaults.instance),
            lease_ttl: ms("LEASE_TTL_MS", defaults.lease_ttl)?,
            stale_threshold: ms("LEASE_STALE_THRESHOLD_MS", defaults.stale_threshold)?,
            refresh_timeout: ms("REFRESH_TIMEOUT_MS", defaults.refresh_timeout)?,
            refresh_before_expiry: ms("REFRESH_BEFORE_EXPIRY_MS", defaults.refresh_before_expiry)?,
            reaper_interval: ms("REAPER_INTERVAL_MS", defaults.reaper_interval)?,
            retry_max_attempts: match lookup("RETRY_MAX_ATTEMPTS") {
                Some(raw) => {
                    let n = parse_u64("RETRY_MAX_ATTEMPTS", &raw)?;
                    u32::try_from(n).map_err(|_| ConfigError::InvalidNumber {
                        var: "RETRY_MAX_ATTEMPTS",
                        value: raw,
                    })?
                }
                None => defaults.retry_max_attempts,
            },
            retry_base_delay: ms("RETRY_BASE_DELAY_MS", defaults.retry_base_delay)?,
            retry_max_delay: ms("RETRY_MAX_DELAY_MS", defaults.retry_max_delay)?,
            retry_jitter: ms("RETRY_JITTER_MS", defaults.retry_jitter)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the timing relationships the lease relies on:
    /// `refresh_timeout < lease_ttl <= stale_threshold`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("LEASE_TTL_MS", self.lease_ttl),
            ("LEASE_STALE_THRESHOLD_MS", self.stale_threshold),
            ("REFRESH_TIMEOUT_MS", self.refresh_timeout),
            ("REAPER_INTERVAL_MS", self.reaper_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::Zero("RETRY_MAX_ATTEMPTS"));
        }
        if self.refresh_timeout >= self.lease_ttl {
            return Err(ConfigError::TimeoutNotBelowTtl {
                timeout: self.refresh_timeout,
                ttl: self.lease_ttl,
            });
        }
        if self.stale_threshold < self.lease_ttl {
            return Err(ConfigError::ThresholdBelowTtl {
                threshold: self.stale_threshold,
                ttl: self.lease_ttl,
            });
        }
        Ok(())
    }

    pub fn lease_ttl_chrono(&self) -> chrono::Duration {
        to_chrono(self.lease_ttl)
    }

    pub fn stale_threshold_chrono(&self) -> chrono::Duration {
        to_chrono(self.stale_threshold)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            self.retry_base_delay,
            self.retry_max_delay,
            self.retry_jitter,
        )
    }
}

fn parse_u64(var: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidNumber {
            var,
            value: raw.to_string(),
        })
}

/// Saturates at `chrono::Duration::MAX` for out-of-range values.
pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
