//! Engine configuration.
//!
//! Loads tunables from `INVENTORY_*` environment variables with sensible
//! defaults. [`SyncConfig::from_env`] falls back to the default for any value
//! it cannot parse; [`SyncConfig::try_from_env`] rejects it instead.

use crate::reconcile::ReconciliationSettings;
use crate::retry::RetryPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but does not parse.
    #[error("Invalid value for {name}: {value:?}")]
    Unparsable {
        /// Variable name
        name: &'static str,
        /// Raw value
        value: String,
    },

    /// A variable parses but is out of range.
    #[error("Invalid value for {name}: {reason}")]
    OutOfRange {
        /// Variable name
        name: &'static str,
        /// What is wrong with it
        reason: &'static str,
    },
}

/// Tunables for the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Largest discrepancy reconciliation corrects on its own (units)
    pub auto_correct_threshold: u64,
    /// Time between reconciliation cycles
    pub reconciliation_interval: Duration,
    /// Dead-letter redeliveries before escalation
    pub max_retry_attempts: u32,
    /// First dead-letter redelivery delay
    pub dead_letter_base_delay: Duration,
    /// Dead-letter backoff multiplier
    pub dead_letter_multiplier: f64,
    /// Dead-letter backoff ceiling
    pub dead_letter_max_delay: Duration,
    /// How often the dead-letter sweeper looks for due entries
    pub dead_letter_sweep_interval: Duration,
    /// Most entries redelivered per sweep
    pub dead_letter_sweep_batch: usize,
    /// How long applied event IDs are remembered
    pub idempotency_retention: Duration,
    /// How often expired event IDs are evicted
    pub ledger_housekeeping_interval: Duration,
    /// How far ahead pending receipts count toward availability
    pub pending_receipt_horizon: Duration,
    /// In-process retries of a transient apply failure
    pub ingest_local_retries: u32,
    /// Delay before the first in-process retry
    pub ingest_retry_delay: Duration,
    /// Deadline for processing one event
    pub event_processing_timeout: Duration,
    /// Deadline for entering a position's critical section
    pub key_lock_timeout: Duration,
    /// Deadline for one source-of-record query
    pub source_of_record_timeout: Duration,
    /// Consecutive unreachable cycles before alerting
    pub source_unreachable_escalation_cycles: u32,
    /// How long a corrected key is left alone before it is compared again
    pub correction_settle_window: Duration,
    /// Safety stock for positions without an explicit value
    pub default_safety_stock: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let reconciliation_interval = Duration::from_secs(15 * 60);
        Self {
            auto_correct_threshold: 5,
            reconciliation_interval,
            max_retry_attempts: 5,
            dead_letter_base_delay: Duration::from_secs(60),
            dead_letter_multiplier: 2.0,
            dead_letter_max_delay: Duration::from_secs(60 * 60),
            dead_letter_sweep_interval: Duration::from_secs(30),
            dead_letter_sweep_batch: 100,
            idempotency_retention: Duration::from_secs(24 * 60 * 60),
            ledger_housekeeping_interval: Duration::from_secs(10 * 60),
            pending_receipt_horizon: Duration::from_secs(24 * 60 * 60),
            ingest_local_retries: 3,
            ingest_retry_delay: Duration::from_millis(50),
            event_processing_timeout: Duration::from_secs(5),
            key_lock_timeout: Duration::from_secs(1),
            source_of_record_timeout: Duration::from_secs(30),
            source_unreachable_escalation_cycles: 3,
            correction_settle_window: reconciliation_interval,
            default_safety_stock: 0,
        }
    }
}

struct EnvReader<F> {
    lookup: F,
    strict: bool,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn get<T: FromStr>(&self, name: &'static str) -> Result<Option<T>, ConfigError> {
        let Some(value) = (self.lookup)(name) else {
            return Ok(None);
        };
        match value.trim().parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) if self.strict => Err(ConfigError::Unparsable { name, value }),
            Err(_) => {
                tracing::warn!(variable = name, value = %value, "Ignoring unparsable setting");
                Ok(None)
            },
        }
    }

    fn duration(
        &self,
        name: &'static str,
        unit: fn(u64) -> Duration,
        default: Duration,
    ) -> Result<Duration, ConfigError> {
        match self.get::<u64>(name)?.map(unit) {
            Some(d) if d.is_zero() => self.reject(name, "must be greater than zero", default),
            Some(d) => Ok(d),
            None => Ok(default),
        }
    }

    fn reject<T>(&self, name: &'static str, reason: &'static str, default: T) -> Result<T, ConfigError> {
        if self.strict {
            Err(ConfigError::OutOfRange { name, reason })
        } else {
            tracing::warn!(variable = name, reason, "Ignoring out-of-range setting");
            Ok(default)
        }
    }
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(60))
}

fn hours(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(3600))
}

impl SyncConfig {
    /// Load from the process environment, keeping defaults for bad values.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load from the process environment, rejecting bad values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for the first unparsable or out-of-range value.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        Self::try_from_lookup(|name| env::var(name).ok())
    }

    /// Load from an arbitrary variable source, keeping defaults for bad values.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self::load(EnvReader {
            lookup,
            strict: false,
        })
        .unwrap_or_default()
    }

    /// Load from an arbitrary variable source, rejecting bad values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for the first unparsable or out-of-range value.
    pub fn try_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Self::load(EnvReader {
            lookup,
            strict: true,
        })
    }

    fn load<F: Fn(&str) -> Option<String>>(env: EnvReader<F>) -> Result<Self, ConfigError> {
        let d = Self::default();

        let reconciliation_interval = env.duration(
            "INVENTORY_RECONCILIATION_INTERVAL_MINUTES",
            minutes,
            d.reconciliation_interval,
        )?;

        let dead_letter_multiplier = match env.get::<f64>("INVENTORY_DEAD_LETTER_MULTIPLIER")? {
            Some(m) if !m.is_finite() || m < 1.0 => env.reject(
                "INVENTORY_DEAD_LETTER_MULTIPLIER",
                "must be a finite number of at least 1.0",
                d.dead_letter_multiplier,
            )?,
            Some(m) => m,
            None => d.dead_letter_multiplier,
        };

        let dead_letter_sweep_batch = match env.get::<usize>("INVENTORY_DEAD_LETTER_SWEEP_BATCH")? {
            Some(0) => env.reject(
                "INVENTORY_DEAD_LETTER_SWEEP_BATCH",
                "must be greater than zero",
                d.dead_letter_sweep_batch,
            )?,
            Some(n) => n,
            None => d.dead_letter_sweep_batch,
        };

        Ok(Self {
            auto_correct_threshold: env
                .get("INVENTORY_AUTO_CORRECT_THRESHOLD")?
                .unwrap_or(d.auto_correct_threshold),
            reconciliation_interval,
            max_retry_attempts: env
                .get("INVENTORY_MAX_RETRY_ATTEMPTS")?
                .unwrap_or(d.max_retry_attempts),
            dead_letter_base_delay: env.duration(
                "INVENTORY_DEAD_LETTER_BASE_DELAY_SECS",
                Duration::from_secs,
                d.dead_letter_base_delay,
            )?,
            dead_letter_multiplier,
            dead_letter_max_delay: env.duration(
                "INVENTORY_DEAD_LETTER_MAX_DELAY_SECS",
                Duration::from_secs,
                d.dead_letter_max_delay,
            )?,
            dead_letter_sweep_interval: env.duration(
                "INVENTORY_DEAD_LETTER_SWEEP_INTERVAL_SECS",
                Duration::from_secs,
                d.dead_letter_sweep_interval,
            )?,
            dead_letter_sweep_batch,
            idempotency_retention: env.duration(
                "INVENTORY_IDEMPOTENCY_RETENTION_HOURS",
                hours,
                d.idempotency_retention,
            )?,
            ledger_housekeeping_interval: env.duration(
                "INVENTORY_LEDGER_HOUSEKEEPING_INTERVAL_SECS",
                Duration::from_secs,
                d.ledger_housekeeping_interval,
            )?,
            pending_receipt_horizon: env
                .get::<u64>("INVENTORY_PENDING_RECEIPT_HORIZON_HOURS")?
                .map_or(d.pending_receipt_horizon, hours),
            ingest_local_retries: env
                .get("INVENTORY_INGEST_LOCAL_RETRIES")?
                .unwrap_or(d.ingest_local_retries),
            ingest_retry_delay: env
                .get::<u64>("INVENTORY_INGEST_RETRY_DELAY_MS")?
                .map_or(d.ingest_retry_delay, Duration::from_millis),
            event_processing_timeout: env.duration(
                "INVENTORY_EVENT_TIMEOUT_MS",
                Duration::from_millis,
                d.event_processing_timeout,
            )?,
            key_lock_timeout: env.duration(
                "INVENTORY_KEY_LOCK_TIMEOUT_MS",
                Duration::from_millis,
                d.key_lock_timeout,
            )?,
            source_of_record_timeout: env.duration(
                "INVENTORY_SOURCE_OF_RECORD_TIMEOUT_SECS",
                Duration::from_secs,
                d.source_of_record_timeout,
            )?,
            source_unreachable_escalation_cycles: env
                .get("INVENTORY_SOURCE_UNREACHABLE_ESCALATION_CYCLES")?
                .unwrap_or(d.source_unreachable_escalation_cycles),
            correction_settle_window: env
                .get::<u64>("INVENTORY_CORRECTION_SETTLE_WINDOW_SECS")?
                .map_or(reconciliation_interval, Duration::from_secs),
            default_safety_stock: env
                .get("INVENTORY_DEFAULT_SAFETY_STOCK")?
                .unwrap_or(d.default_safety_stock),
        })
    }

    /// Backoff for dead-letter redelivery.
    #[must_use]
    pub fn dead_letter_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.max_retry_attempts)
            .initial_delay(self.dead_letter_base_delay)
            .max_delay(self.dead_letter_max_delay)
            .multiplier(self.dead_letter_multiplier)
            .build()
    }

    /// Backoff for in-process apply retries.
    #[must_use]
    pub fn ingest_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_retries(self.ingest_local_retries)
            .initial_delay(self.ingest_retry_delay)
            .max_delay(self.event_processing_timeout)
            .multiplier(2.0)
            .build()
    }

    /// Settings for the reconciliation scheduler.
    #[must_use]
    pub const fn reconciliation_settings(&self) -> ReconciliationSettings {
        ReconciliationSettings {
            auto_correct_threshold: self.auto_correct_threshold,
            interval: self.reconciliation_interval,
            source_timeout: self.source_of_record_timeout,
            escalation_cycles: self.source_unreachable_escalation_cycles,
            settle_window: self.correction_settle_window,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::from_lookup(vars(&[]));
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.auto_correct_threshold, 5);
        assert_eq!(config.reconciliation_interval, Duration::from_secs(900));
        assert_eq!(config.max_retry_attempts, 5);
        assert_eq!(config.idempotency_retention, Duration::from_secs(86_400));
        assert_eq!(config.pending_receipt_horizon, Duration::from_secs(86_400));
    }

    #[test]
    fn reads_overrides() {
        let config = SyncConfig::from_lookup(vars(&[
            ("INVENTORY_AUTO_CORRECT_THRESHOLD", "9"),
            ("INVENTORY_RECONCILIATION_INTERVAL_MINUTES", "5"),
            ("INVENTORY_IDEMPOTENCY_RETENTION_HOURS", "48"),
            ("INVENTORY_DEFAULT_SAFETY_STOCK", "2"),
        ]));
        assert_eq!(config.auto_correct_threshold, 9);
        assert_eq!(config.reconciliation_interval, Duration::from_secs(300));
        assert_eq!(config.correction_settle_window, Duration::from_secs(300));
        assert_eq!(config.idempotency_retention, Duration::from_secs(48 * 3600));
        assert_eq!(config.default_safety_stock, 2);
    }

    #[test]
    fn lenient_load_keeps_defaults_for_bad_values() {
        let config = SyncConfig::from_lookup(vars(&[
            ("INVENTORY_MAX_RETRY_ATTEMPTS", "lots"),
            ("INVENTORY_RECONCILIATION_INTERVAL_MINUTES", "0"),
        ]));
        assert_eq!(config.max_retry_attempts, 5);
        assert_eq!(config.reconciliation_interval, Duration::from_secs(900));
    }

    #[test]
    fn strict_load_rejects_bad_values() {
        assert_eq!(
            SyncConfig::try_from_lookup(vars(&[("INVENTORY_MAX_RETRY_ATTEMPTS", "lots")])),
            Err(ConfigError::Unparsable {
                name: "INVENTORY_MAX_RETRY_ATTEMPTS",
                value: "lots".to_string(),
            })
        );
        assert!(matches!(
            SyncConfig::try_from_lookup(vars(&[("INVENTORY_DEAD_LETTER_MULTIPLIER", "0.5")])),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn dead_letter_policy_follows_config() {
        let policy = SyncConfig::default().dead_letter_policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(120));
    }
}
