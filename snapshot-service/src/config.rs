//! Configuration for the Snapshot Service
//!
//! Loaded once from environment variables at startup.
//!
//! # Fail-fast behaviour
//!
//! In `staging` and `prod` the SQL gateway URL is required and may not point
//! at localhost. In `dev` every variable has a local fallback. In every
//! environment the unit job lock must leave room for a snapshot run to time
//! out and finalize before the scheduler aborts the job.
//!
//! Variables:
//! - PLATFORM_ENV: dev | staging | prod
//! - SNAPSHOT_SERVICE_PORT: probe server port (8080)
//! - SQL_GATEWAY_URL: warehouse gateway endpoint (REQUIRED outside dev)
//! - SQL_GATEWAY_TOKEN: gateway bearer token
//! - SQL_GATEWAY_TIMEOUT_SECS, SQL_GATEWAY_MAX_RETRIES
//! - WORKER_CONCURRENCY, JOB_POLL_INTERVAL_MS
//! - SNAPSHOT_SWEEP_INTERVAL_SECS, MAINTENANCE_SWEEP_INTERVAL_SECS, UNIT_JOB_LOCK_SECS
//! - QUERY_CACHE_TTL_SECS, MAX_DIMENSION_CELLS
//! - LOG_LEVEL

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use tracing::info;
use url::Url;

use snapshot_engine::clients::SqlGatewayConfig;
use snapshot_engine::query_runner::QueryRunnerConfig;
use snapshot_engine::scheduler::SchedulerConfig;
use snapshot_engine::snapshots::OrchestratorConfig;

/// Platform environment.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlatformEnv {
    #[default]
    Dev,
    Staging,
    Prod,
}

impl PlatformEnv {
    fn from_env_value(value: &str) -> Self {
        match value {
            "prod" => Self::Prod,
            "staging" => Self::Staging,
            _ => Self::Dev,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Staging => "staging",
            Self::Prod => "prod",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Probe server port
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub platform_env: PlatformEnv,

    /// SQL gateway base URL (REQUIRED outside dev)
    pub sql_gateway_url: String,

    /// SQL gateway bearer token
    pub sql_gateway_token: Option<String>,

    #[serde(default = "default_gateway_timeout")]
    pub sql_gateway_timeout_secs: u64,

    #[serde(default = "default_gateway_retries")]
    pub sql_gateway_max_retries: u32,

    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_poll_interval")]
    pub job_poll_interval_ms: u64,

    #[serde(default = "default_snapshot_sweep")]
    pub snapshot_sweep_interval_secs: u64,

    #[serde(default = "default_maintenance_sweep")]
    pub maintenance_sweep_interval_secs: u64,

    #[serde(default = "default_unit_lock")]
    pub unit_job_lock_secs: u64,

    #[serde(default = "default_cache_ttl")]
    pub query_cache_ttl_secs: u64,

    #[serde(default = "default_max_dimension_cells")]
    pub max_dimension_cells: usize,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Snapshot runs stop this long before their unit job lock expires.
const RUN_TIMEOUT_MARGIN_SECS: u64 = 60;

fn default_port() -> u16 {
    8080
}

fn default_gateway_url() -> String {
    "http://localhost:8090".to_string()
}

fn default_gateway_timeout() -> u64 {
    1800
}

fn default_gateway_retries() -> u32 {
    3
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_snapshot_sweep() -> u64 {
    600
}

fn default_maintenance_sweep() -> u64 {
    86_400
}

fn default_unit_lock() -> u64 {
    1800
}

fn default_cache_ttl() -> u64 {
    86_400
}

fn default_max_dimension_cells() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Numeric variable with a default; unparsable values fall back too.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        let platform_env = PlatformEnv::from_env_value(&env::var("PLATFORM_ENV").unwrap_or_else(|_| "dev".to_string()));

        let sql_gateway_url = match env::var("SQL_GATEWAY_URL") {
            Ok(url) => url,
            Err(_) if platform_env == PlatformEnv::Dev => default_gateway_url(),
            Err(_) => {
                return Err(anyhow!(
                    "SQL_GATEWAY_URL environment variable is required in {} mode. ABORTING STARTUP.",
                    platform_env.as_str()
                ))
            }
        };

        let config = Self {
            port: env_or("SNAPSHOT_SERVICE_PORT", default_port()),
            platform_env,
            sql_gateway_url,
            sql_gateway_token: env::var("SQL_GATEWAY_TOKEN").ok().filter(|t| !t.is_empty()),
            sql_gateway_timeout_secs: env_or("SQL_GATEWAY_TIMEOUT_SECS", default_gateway_timeout()),
            sql_gateway_max_retries: env_or("SQL_GATEWAY_MAX_RETRIES", default_gateway_retries()),
            worker_concurrency: env_or("WORKER_CONCURRENCY", default_worker_concurrency()),
            job_poll_interval_ms: env_or("JOB_POLL_INTERVAL_MS", default_poll_interval()),
            snapshot_sweep_interval_secs: env_or("SNAPSHOT_SWEEP_INTERVAL_SECS", default_snapshot_sweep()),
            maintenance_sweep_interval_secs: env_or("MAINTENANCE_SWEEP_INTERVAL_SECS", default_maintenance_sweep()),
            unit_job_lock_secs: env_or("UNIT_JOB_LOCK_SECS", default_unit_lock()),
            query_cache_ttl_secs: env_or("QUERY_CACHE_TTL_SECS", default_cache_ttl()),
            max_dimension_cells: env_or("MAX_DIMENSION_CELLS", default_max_dimension_cells()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| default_log_level()),
        };

        config.validate_for_production()?;
        config.log_startup();

        Ok(config)
    }

    fn log_startup(&self) {
        info!(
            platform_env = self.platform_env.as_str(),
            port = self.port,
            sql_gateway_url = %self.sql_gateway_url,
            sql_gateway_auth = self.sql_gateway_token.is_some(),
            worker_concurrency = self.worker_concurrency,
            snapshot_sweep_interval_secs = self.snapshot_sweep_interval_secs,
            maintenance_sweep_interval_secs = self.maintenance_sweep_interval_secs,
            max_dimension_cells = self.max_dimension_cells,
            "Configuration loaded"
        );
    }

    /// Reject settings that only make sense on a developer machine.
    pub fn validate_for_production(&self) -> Result<()> {
        let url = Url::parse(&self.sql_gateway_url)
            .map_err(|e| anyhow!("SQL_GATEWAY_URL is not a valid URL ({}): {}", e, self.sql_gateway_url))?;

        if self.unit_job_lock_secs <= RUN_TIMEOUT_MARGIN_SECS {
            return Err(anyhow!(
                "UNIT_JOB_LOCK_SECS must exceed {}s so snapshot runs finalize before their job is aborted. Got: {}",
                RUN_TIMEOUT_MARGIN_SECS,
                self.unit_job_lock_secs
            ));
        }

        if self.platform_env == PlatformEnv::Dev {
            return Ok(());
        }

        if matches!(url.host_str(), Some("localhost") | Some("127.0.0.1")) {
            return Err(anyhow!(
                "SQL_GATEWAY_URL cannot be localhost in production. Got: {}",
                self.sql_gateway_url
            ));
        }

        if self.worker_concurrency == 0 {
            return Err(anyhow!("WORKER_CONCURRENCY must be at least 1"));
        }

        Ok(())
    }

    pub fn gateway_config(&self) -> Result<SqlGatewayConfig> {
        let url = Url::parse(&self.sql_gateway_url)?;
        Ok(SqlGatewayConfig::new(url)
            .with_auth_token(self.sql_gateway_token.clone())
            .with_timeout(Duration::from_secs(self.sql_gateway_timeout_secs))
            .with_max_retries(self.sql_gateway_max_retries))
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_dimension_cells: self.max_dimension_cells,
            run_timeout: Duration::from_secs(self.unit_job_lock_secs.saturating_sub(RUN_TIMEOUT_MARGIN_SECS)),
            runner: QueryRunnerConfig {
                cache_ttl: Duration::from_secs(self.query_cache_ttl_secs),
            },
            ..OrchestratorConfig::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            concurrency: self.worker_concurrency.max(1),
            poll_interval: Duration::from_millis(self.job_poll_interval_ms),
            snapshot_sweep_interval: Duration::from_secs(self.snapshot_sweep_interval_secs),
            maintenance_sweep_interval: Duration::from_secs(self.maintenance_sweep_interval_secs),
            unit_lock_lifetime: Duration::from_secs(self.unit_job_lock_secs),
            ..SchedulerConfig::default()
        }
    }
}

impl Default for Config {
    /// Development defaults. Production deployments go through [`Config::load`].
    fn default() -> Self {
        Self {
            port: default_port(),
            platform_env: PlatformEnv::default(),
            sql_gateway_url: default_gateway_url(),
            sql_gateway_token: None,
            sql_gateway_timeout_secs: default_gateway_timeout(),
            sql_gateway_max_retries: default_gateway_retries(),
            worker_concurrency: default_worker_concurrency(),
            job_poll_interval_ms: default_poll_interval(),
            snapshot_sweep_interval_secs: default_snapshot_sweep(),
            maintenance_sweep_interval_secs: default_maintenance_sweep(),
            unit_job_lock_secs: default_unit_lock(),
            query_cache_ttl_secs: default_cache_ttl(),
            max_dimension_cells: default_max_dimension_cells(),
            log_level: default_log_level(),
        }
    }
}
