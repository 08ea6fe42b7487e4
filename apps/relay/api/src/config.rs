use async_relay::RelayConfig;
use core_config::{ConfigError, FromEnv, env_flag, env_or_default, env_parse_or, env_required, server::ServerConfig};
use std::time::Duration;

pub use core_config::Environment;

/// Scheduled maintenance jobs. Cron expressions have a leading seconds field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobsConfig {
    pub enabled: bool,
    pub health_cron: String,
    pub trim_cron: String,
    /// TTL of the lock each job runs under
    pub lock_ttl: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_cron: "0 * * * * *".to_string(),
            trim_cron: "30 */5 * * * *".to_string(),
            lock_ttl: Duration::from_secs(60),
        }
    }
}

impl FromEnv for JobsConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            enabled: env_flag("RELAY_JOBS_ENABLED", defaults.enabled)?,
            health_cron: env_or_default("RELAY_HEALTH_JOB_CRON", &defaults.health_cron),
            trim_cron: env_or_default("RELAY_TRIM_JOB_CRON", &defaults.trim_cron),
            lock_ttl: Duration::from_secs(env_parse_or(
                "RELAY_JOB_LOCK_TTL_SECS",
                defaults.lock_ttl.as_secs(),
            )?),
        })
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub name: String,
    pub version: String,
    pub environment: Environment,
    pub server: ServerConfig,
    pub redis_url: String,
    pub database_url: String,
    pub relay: RelayConfig,
    pub jobs: JobsConfig,
}

impl AppConfig {
    pub fn from_env() -> eyre::Result<Self> {
        let environment = Environment::from_env();
        let server = ServerConfig::from_env()?;

        // REDIS_HOST is accepted for older deployments
        let redis_url = env_required("REDIS_URL")
            .or_else(|_| env_required("REDIS_HOST"))
            .map_err(|_| ConfigError::MissingEnvVar("REDIS_URL or REDIS_HOST".to_string()))?;
        let database_url = env_required("DATABASE_URL")?;

        Ok(Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            environment,
            server,
            redis_url,
            database_url,
            relay: RelayConfig::from_env()?,
            jobs: JobsConfig::from_env()?,
        })
    }
}
