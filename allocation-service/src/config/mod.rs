//! Configuration module for allocation-service.

use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct AllocationConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub ledger_backend: LedgerBackend,
    pub database: DatabaseConfig,
    pub matching: MatchingConfig,
}

/// Where invoices, allocations and decisions are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    Postgres,
    Memory,
}

impl FromStr for LedgerBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(LedgerBackend::Postgres),
            "memory" | "in-memory" => Ok(LedgerBackend::Memory),
            other => Err(AppError::ConfigError(anyhow::anyhow!(
                "LEDGER_BACKEND must be 'postgres' or 'memory', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Required for the postgres backend only.
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

/// Knobs of the matching and allocation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchingConfig {
    /// Maximum |sum - amount| accepted for multi-invoice matches.
    pub amount_tolerance_minor_units: i64,
    /// Largest invoice combination considered by the subset search.
    pub max_combination_size: usize,
    /// Number of most recent open invoices fed to the subset search.
    pub subset_pool_size: usize,
    /// Multi-invoice candidates kept after ranking.
    pub max_subset_candidates: usize,
    pub exact_name_threshold: f64,
    pub fuzzy_name_threshold: f64,
    pub auto_apply_threshold: u8,
    pub max_commit_retries: u32,
    pub batch_concurrency: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            amount_tolerance_minor_units: 0,
            max_combination_size: 5,
            subset_pool_size: 20,
            max_subset_candidates: 3,
            exact_name_threshold: 0.7,
            fuzzy_name_threshold: 0.6,
            auto_apply_threshold: 90,
            max_commit_retries: 3,
            batch_concurrency: 8,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl MatchingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            amount_tolerance_minor_units: env_or(
                "MATCH_AMOUNT_TOLERANCE",
                defaults.amount_tolerance_minor_units,
            )
            .max(0),
            max_combination_size: env_or(
                "MATCH_MAX_COMBINATION_SIZE",
                defaults.max_combination_size,
            )
            .max(2),
            subset_pool_size: env_or("MATCH_SUBSET_POOL_SIZE", defaults.subset_pool_size),
            max_subset_candidates: env_or(
                "MATCH_MAX_SUBSET_CANDIDATES",
                defaults.max_subset_candidates,
            ),
            exact_name_threshold: defaults.exact_name_threshold,
            fuzzy_name_threshold: defaults.fuzzy_name_threshold,
            auto_apply_threshold: env_or(
                "MATCH_AUTO_APPLY_THRESHOLD",
                defaults.auto_apply_threshold,
            )
            .min(100),
            max_commit_retries: env_or("MATCH_MAX_COMMIT_RETRIES", defaults.max_commit_retries),
            batch_concurrency: env_or("MATCH_BATCH_CONCURRENCY", defaults.batch_concurrency)
                .max(1),
        }
    }
}

impl AllocationConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let ledger_backend = match env::var("LEDGER_BACKEND") {
            Ok(value) => value.parse()?,
            Err(_) => LedgerBackend::Postgres,
        };
        let database_url = env::var("DATABASE_URL").ok();
        if ledger_backend == LedgerBackend::Postgres && database_url.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_URL is required for the postgres ledger backend"
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "allocation-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            ledger_backend,
            database: DatabaseConfig {
                url: database_url,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            matching: MatchingConfig::from_env(),
        })
    }
}
