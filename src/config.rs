//! Configuration for the courier delivery daemon.

use std::time::Duration;

use anyhow::{Context, Result};
use courier_delivery::{
    CircuitConfig, ClientConfig, RetryOptions, SchedulerConfig, ServiceConfig,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "courier.toml";

/// Daemon configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`courier.toml`)
/// 3. Built-in defaults (lowest priority)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    // Client
    /// Per-attempt HTTP timeout in milliseconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_MS`
    #[serde(default = "default_delivery_timeout_ms", alias = "DELIVERY_TIMEOUT_MS")]
    pub delivery_timeout_ms: u64,
    /// `User-Agent` sent with every delivery.
    ///
    /// Environment variable: `USER_AGENT`
    #[serde(default = "default_user_agent", alias = "USER_AGENT")]
    pub user_agent: String,

    // Retry
    /// Retries after the first attempt.
    ///
    /// Environment variable: `MAX_RETRY_ATTEMPTS`
    #[serde(default = "default_retry_attempts", alias = "MAX_RETRY_ATTEMPTS")]
    pub max_retry_attempts: u32,
    /// Base delay for exponential backoff in milliseconds.
    ///
    /// Environment variable: `RETRY_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms", alias = "RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,
    /// Backoff growth factor.
    ///
    /// Environment variable: `RETRY_BACKOFF_MULTIPLIER`
    #[serde(default = "default_backoff_multiplier", alias = "RETRY_BACKOFF_MULTIPLIER")]
    pub retry_backoff_multiplier: f64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `RETRY_JITTER_FACTOR`
    #[serde(default = "default_jitter_factor", alias = "RETRY_JITTER_FACTOR")]
    pub retry_jitter_factor: f64,
    /// Retry budget of queued deliveries.
    ///
    /// Environment variable: `QUEUE_MAX_RETRIES`
    #[serde(default = "default_queue_max_retries", alias = "QUEUE_MAX_RETRIES")]
    pub queue_max_retries: u32,

    // Circuit breaker
    /// Consecutive failures that open a destination's circuit.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_FAILURE_THRESHOLD`
    #[serde(default = "default_failure_threshold", alias = "CIRCUIT_BREAKER_FAILURE_THRESHOLD")]
    pub circuit_breaker_failure_threshold: u32,
    /// Trial successes needed to close a half-open circuit.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_SUCCESS_THRESHOLD`
    #[serde(default = "default_success_threshold", alias = "CIRCUIT_BREAKER_SUCCESS_THRESHOLD")]
    pub circuit_breaker_success_threshold: u32,
    /// Milliseconds an open circuit waits before admitting trials.
    ///
    /// Environment variable: `CIRCUIT_BREAKER_TIMEOUT_MS`
    #[serde(default = "default_circuit_timeout_ms", alias = "CIRCUIT_BREAKER_TIMEOUT_MS")]
    pub circuit_breaker_timeout_ms: u64,

    // Scheduler
    /// Idle wait between queue polls in milliseconds.
    ///
    /// Environment variable: `SCHEDULER_POLL_INTERVAL_MS`
    #[serde(default = "default_poll_interval_ms", alias = "SCHEDULER_POLL_INTERVAL_MS")]
    pub scheduler_poll_interval_ms: u64,
    /// Queue items claimed per poll.
    ///
    /// Environment variable: `SCHEDULER_BATCH_SIZE`
    #[serde(default = "default_batch_size", alias = "SCHEDULER_BATCH_SIZE")]
    pub scheduler_batch_size: usize,

    // Lifecycle
    /// Time allowed for in-flight deliveries after a shutdown signal.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECONDS`
    #[serde(default = "default_shutdown_timeout", alias = "SHUTDOWN_TIMEOUT_SECONDS")]
    pub shutdown_timeout_seconds: u64,

    // Logging
    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Loads configuration from defaults, `courier.toml`, and environment
    /// variable overrides, then validates it.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed("")),
        )
    }

    fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Converts to the delivery service configuration.
    pub fn to_service_config(&self) -> ServiceConfig {
        ServiceConfig {
            client: self.to_client_config(),
            circuit: self.to_circuit_config(),
            retry: self.to_retry_options(),
            queue_max_retries: self.queue_max_retries,
        }
    }

    /// Converts to client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_millis(self.delivery_timeout_ms),
            user_agent: self.user_agent.clone(),
            ..ClientConfig::default()
        }
    }

    /// Converts to retry options.
    pub fn to_retry_options(&self) -> RetryOptions {
        RetryOptions {
            max_retries: self.max_retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_multiplier: self.retry_backoff_multiplier,
            jitter_enabled: self.retry_jitter_factor > 0.0,
            jitter_factor: self.retry_jitter_factor,
            ..RetryOptions::default()
        }
    }

    /// Converts to circuit breaker configuration.
    ///
    /// The half-open trial budget is not configurable.
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            success_threshold: self.circuit_breaker_success_threshold,
            timeout: Duration::from_millis(self.circuit_breaker_timeout_ms),
            ..CircuitConfig::default()
        }
    }

    /// Converts to scheduler configuration.
    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            poll_interval: Duration::from_millis(self.scheduler_poll_interval_ms),
            batch_size: self.scheduler_batch_size,
            ..SchedulerConfig::default()
        }
    }

    /// Grace period for shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.delivery_timeout_ms == 0 {
            anyhow::bail!("delivery_timeout_ms must be greater than 0");
        }

        if self.user_agent.trim().is_empty() {
            anyhow::bail!("user_agent must not be empty");
        }

        if self.retry_base_delay_ms == 0 {
            anyhow::bail!("retry_base_delay_ms must be greater than 0");
        }

        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            anyhow::bail!("retry_max_delay_ms cannot be less than retry_base_delay_ms");
        }

        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier < 1.0 {
            anyhow::bail!("retry_backoff_multiplier must be at least 1.0");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.circuit_breaker_failure_threshold == 0 {
            anyhow::bail!("circuit_breaker_failure_threshold must be greater than 0");
        }

        if self.circuit_breaker_success_threshold == 0 {
            anyhow::bail!("circuit_breaker_success_threshold must be greater than 0");
        }

        if self.circuit_breaker_timeout_ms == 0 {
            anyhow::bail!("circuit_breaker_timeout_ms must be greater than 0");
        }

        if self.scheduler_poll_interval_ms == 0 {
            anyhow::bail!("scheduler_poll_interval_ms must be greater than 0");
        }

        if self.scheduler_batch_size == 0 {
            anyhow::bail!("scheduler_batch_size must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            delivery_timeout_ms: default_delivery_timeout_ms(),
            user_agent: default_user_agent(),
            max_retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_backoff_multiplier: default_backoff_multiplier(),
            retry_jitter_factor: default_jitter_factor(),
            queue_max_retries: default_queue_max_retries(),
            circuit_breaker_failure_threshold: default_failure_threshold(),
            circuit_breaker_success_threshold: default_success_threshold(),
            circuit_breaker_timeout_ms: default_circuit_timeout_ms(),
            scheduler_poll_interval_ms: default_poll_interval_ms(),
            scheduler_batch_size: default_batch_size(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            rust_log: default_log_level(),
        }
    }
}

fn default_delivery_timeout_ms() -> u64 {
    courier_delivery::DEFAULT_TIMEOUT_SECONDS * 1000
}

fn default_user_agent() -> String {
    ClientConfig::default().user_agent
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.1
}

fn default_queue_max_retries() -> u32 {
    courier_core::models::DEFAULT_QUEUE_MAX_RETRIES
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_circuit_timeout_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_batch_size() -> usize {
    courier_delivery::DEFAULT_BATCH_SIZE
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info,courier=debug".to_string()
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, env, sync::Mutex};

    use super::*;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct TestEnvGuard {
        _lock: std::sync::MutexGuard<'static, ()>,
        originals: HashMap<String, Option<String>>,
    }

    impl TestEnvGuard {
        fn new() -> Self {
            let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Self { _lock: lock, originals: HashMap::new() }
        }

        fn set_var(&mut self, key: &str, value: &str) {
            self.originals.entry(key.to_string()).or_insert_with(|| env::var(key).ok());
            env::set_var(key, value);
        }
    }

    impl Drop for TestEnvGuard {
        fn drop(&mut self) {
            for (var, original) in &self.originals {
                match original {
                    Some(value) => env::set_var(var, value),
                    None => env::remove_var(var),
                }
            }
        }
    }

    #[test]
    fn defaults_match_library_defaults() {
        let config = Config::default();
        assert!(config.validate().is_ok());

        let service = config.to_service_config();
        assert_eq!(service.client, ClientConfig::default());
        assert_eq!(service.circuit, CircuitConfig::default());
        assert_eq!(service.retry, RetryOptions::default());
        assert_eq!(config.to_scheduler_config(), SchedulerConfig::default());
    }

    #[test]
    fn env_overrides_defaults() {
        let mut guard = TestEnvGuard::new();
        guard.set_var("DELIVERY_TIMEOUT_MS", "2500");
        guard.set_var("USER_AGENT", "billing-hooks/1");
        guard.set_var("MAX_RETRY_ATTEMPTS", "6");
        guard.set_var("RETRY_BASE_DELAY_MS", "250");
        guard.set_var("RETRY_MAX_DELAY_MS", "8000");
        guard.set_var("RETRY_BACKOFF_MULTIPLIER", "3.0");
        guard.set_var("RETRY_JITTER_FACTOR", "0");
        guard.set_var("CIRCUIT_BREAKER_FAILURE_THRESHOLD", "8");
        guard.set_var("CIRCUIT_BREAKER_TIMEOUT_MS", "120000");
        guard.set_var("SCHEDULER_BATCH_SIZE", "25");

        let config = Config::load().expect("config should load with env overrides");
        let service = config.to_service_config();

        assert_eq!(service.client.timeout, Duration::from_millis(2500));
        assert_eq!(service.client.user_agent, "billing-hooks/1");
        assert_eq!(service.retry.max_retries, 6);
        assert_eq!(service.retry.base_delay, Duration::from_millis(250));
        assert_eq!(service.retry.max_delay, Duration::from_secs(8));
        assert!((service.retry.backoff_multiplier - 3.0).abs() < f64::EPSILON);
        assert!(!service.retry.jitter_enabled);
        assert_eq!(service.circuit.failure_threshold, 8);
        assert_eq!(service.circuit.timeout, Duration::from_secs(120));
        assert_eq!(config.to_scheduler_config().batch_size, 25);
    }

    #[test]
    fn invalid_env_value_rejected() {
        let mut guard = TestEnvGuard::new();
        guard.set_var("RETRY_JITTER_FACTOR", "1.5");

        let error = Config::load().unwrap_err();
        assert!(format!("{error:#}").contains("retry_jitter_factor"));
    }

    #[test]
    fn toml_layer_sits_between_defaults_and_env() {
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string("scheduler_batch_size = 40\nshutdown_timeout_seconds = 5"));

        let config = Config::from_figment(figment).unwrap();
        assert_eq!(config.scheduler_batch_size, 40);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_retry_attempts, default_retry_attempts());
    }

    #[test]
    fn invalid_config_validation_fails() {
        let cases: Vec<fn(&mut Config)> = vec![
            |c| c.delivery_timeout_ms = 0,
            |c| c.user_agent = "  ".to_string(),
            |c| c.retry_base_delay_ms = 0,
            |c| c.retry_max_delay_ms = c.retry_base_delay_ms - 1,
            |c| c.retry_backoff_multiplier = 0.5,
            |c| c.retry_jitter_factor = -0.1,
            |c| c.circuit_breaker_failure_threshold = 0,
            |c| c.circuit_breaker_success_threshold = 0,
            |c| c.circuit_breaker_timeout_ms = 0,
            |c| c.scheduler_poll_interval_ms = 0,
            |c| c.scheduler_batch_size = 0,
        ];

        for (i, mutate) in cases.into_iter().enumerate() {
            let mut config = Config::default();
            mutate(&mut config);
            assert!(config.validate().is_err(), "case {i} should be rejected");
        }
    }
}
