//! Relay configuration
//!
//! `RelayConfig` groups every tunable of the relay. Build it from the environment
//! with [`FromEnv`] or programmatically with the `with_*` setters (tests do the latter).

use core_config::{ConfigError, FromEnv, env_flag, env_or_default, env_parse_or};
use std::time::Duration;
use uuid::Uuid;

/// Fixed-delay retry policy for connection-class failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay between attempts
    pub retry_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_interval: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_interval: Duration) -> Self {
        Self {
            max_retries,
            retry_interval,
        }
    }

    /// A policy that never retries
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failed calls before the circuit opens
    pub failure_threshold: u32,
    /// Consecutive successes in half-open before closing again
    pub success_threshold: u32,
    /// Time spent open before a trial call is allowed
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Startup health gate settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthGateConfig {
    pub enabled: bool,
    /// Attempts per dependency before startup is aborted
    pub max_retries: u32,
    pub interval: Duration,
}

impl Default for HealthGateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 30,
            interval: Duration::from_secs(10),
        }
    }
}

/// Wait facade defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    pub poll_interval: Duration,
    pub max_wait: Duration,
    /// Outstanding `wait_for` calls allowed at once
    pub max_concurrent: usize,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            max_wait: Duration::from_secs(30),
            max_concurrent: 256,
        }
    }
}

/// Results channel consumed by the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub stream_name: String,
    pub consumer_group: String,
    /// Unique per process
    pub consumer_id: String,
    /// Entries fetched per read
    pub batch_size: usize,
    /// XREADGROUP BLOCK in milliseconds (None = non-blocking)
    pub blocking_timeout_ms: Option<u64>,
    /// Approximate cap kept by the trim job
    pub max_length: usize,
    /// Pending entries idle this long under another consumer are claimed
    pub claim_idle: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            stream_name: "async:results".to_string(),
            consumer_group: "relay_result_listeners".to_string(),
            consumer_id: format!("listener-{}", Uuid::new_v4()),
            batch_size: 32,
            blocking_timeout_ms: Some(2000),
            max_length: 10_000,
            claim_idle: Duration::from_secs(30),
        }
    }
}

/// Distributed lock settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Renew the lease every `ttl / 3` while the guarded job runs
    pub renewal: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { renewal: true }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Identifies this process in lock holder ids and logs
    pub instance_id: String,
    pub broker_retry: RetryPolicy,
    pub store_retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
    pub health_gate: HealthGateConfig,
    pub wait: WaitConfig,
    /// TTL applied to every result record
    pub result_ttl: Duration,
    pub listener: ListenerConfig,
    pub lock: LockConfig,
    /// Approximate cap on each request stream (XADD MAXLEN ~)
    pub request_max_length: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("relay-{}", Uuid::new_v4().simple()),
            broker_retry: RetryPolicy::default(),
            store_retry: RetryPolicy::new(2, Duration::from_millis(250)),
            circuit_breaker: CircuitBreakerConfig::default(),
            health_gate: HealthGateConfig::default(),
            wait: WaitConfig::default(),
            result_ttl: Duration::from_secs(30 * 60),
            listener: ListenerConfig::default(),
            lock: LockConfig::default(),
            request_max_length: 10_000,
        }
    }
}

impl RelayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    pub fn with_broker_retry(mut self, policy: RetryPolicy) -> Self {
        self.broker_retry = policy;
        self
    }

    pub fn with_store_retry(mut self, policy: RetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn with_health_gate(mut self, config: HealthGateConfig) -> Self {
        self.health_gate = config;
        self
    }

    pub fn with_wait(mut self, config: WaitConfig) -> Self {
        self.wait = config;
        self
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }

    pub fn with_listener(mut self, config: ListenerConfig) -> Self {
        self.listener = config;
        self
    }

    pub fn with_lock_renewal(mut self, enabled: bool) -> Self {
        self.lock.renewal = enabled;
        self
    }
}

impl FromEnv for RelayConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = RelayConfig::default();

        let instance_id = env_or_default("RELAY_INSTANCE_ID", &defaults.instance_id);

        let broker_retry = RetryPolicy {
            max_retries: env_parse_or(
                "RELAY_BROKER_MAX_RETRIES",
                defaults.broker_retry.max_retries,
            )?,
            retry_interval: Duration::from_millis(env_parse_or(
                "RELAY_BROKER_RETRY_INTERVAL_MS",
                defaults.broker_retry.retry_interval.as_millis() as u64,
            )?),
        };

        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: env_parse_or(
                "RELAY_CIRCUIT_FAILURE_THRESHOLD",
                defaults.circuit_breaker.failure_threshold,
            )?,
            success_threshold: defaults.circuit_breaker.success_threshold,
            open_duration: Duration::from_secs(env_parse_or(
                "RELAY_CIRCUIT_OPEN_SECS",
                defaults.circuit_breaker.open_duration.as_secs(),
            )?),
        };

        let health_gate = HealthGateConfig {
            enabled: env_flag("RELAY_HEALTH_CHECK_ENABLED", defaults.health_gate.enabled)?,
            max_retries: env_parse_or(
                "RELAY_HEALTH_CHECK_MAX_RETRIES",
                defaults.health_gate.max_retries,
            )?,
            interval: Duration::from_secs(env_parse_or(
                "RELAY_HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_gate.interval.as_secs(),
            )?),
        };

        let wait = WaitConfig {
            poll_interval: Duration::from_millis(env_parse_or(
                "RELAY_WAIT_POLL_INTERVAL_MS",
                defaults.wait.poll_interval.as_millis() as u64,
            )?),
            max_wait: Duration::from_millis(env_parse_or(
                "RELAY_WAIT_MAX_MS",
                defaults.wait.max_wait.as_millis() as u64,
            )?),
            max_concurrent: env_parse_or("RELAY_WAIT_MAX_CONCURRENT", defaults.wait.max_concurrent)?
                .max(1),
        };

        let result_ttl = Duration::from_secs(env_parse_or(
            "RELAY_RESULT_TTL_SECS",
            defaults.result_ttl.as_secs(),
        )?);

        let listener = ListenerConfig {
            stream_name: env_or_default("RELAY_RESULTS_STREAM", &defaults.listener.stream_name),
            consumer_group: env_or_default(
                "RELAY_RESULTS_GROUP",
                &defaults.listener.consumer_group,
            ),
            consumer_id: format!("{}-listener", instance_id),
            claim_idle: Duration::from_millis(env_parse_or(
                "RELAY_CLAIM_IDLE_MS",
                defaults.listener.claim_idle.as_millis() as u64,
            )?),
            ..defaults.listener
        };

        let lock = LockConfig {
            renewal: env_flag("RELAY_LOCK_RENEWAL", defaults.lock.renewal)?,
        };

        Ok(Self {
            instance_id,
            broker_retry,
            store_retry: defaults.store_retry,
            circuit_breaker,
            health_gate,
            wait,
            result_ttl,
            listener,
            lock,
            request_max_length: defaults.request_max_length,
        })
    }
}
