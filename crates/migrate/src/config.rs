//! Runner configuration
//!
//! Defaults, overridden by environment variables, overridden in turn by the
//! CLI. [`MigrateConfig::validate`] runs after every layer is applied.

use std::env;
use std::path::PathBuf;

use crate::backends::postgres::validate_database_url;
use crate::catalog::DEFAULT_OWNING_TABLES;
use crate::error::ConfigError;
use crate::migrations::guard::ConstraintCheck;
use crate::migrations::ledger::DEFAULT_LEDGER_TABLE;
use crate::migrations::runner::RunOptions;
use crate::security::validate_identifier;

/// Advisory lock key used when none is configured ("STRATA" in ASCII)
pub const DEFAULT_LOCK_KEY: i64 = 0x5354_5241_5441;

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

#[derive(Debug, Clone, PartialEq)]
pub struct MigrateConfig {
    pub database_url: Option<String>,
    pub migrations_dir: PathBuf,
    pub ledger_table: String,
    /// Hold an advisory lock for the whole run
    pub lock: bool,
    pub lock_key: i64,
    pub constraint_check: ConstraintCheck,
    /// Tables that receive `supplier_id` from the built-in supplier unit
    pub supplier_tables: Vec<String>,
    pub log_level: String,
}

impl MigrateConfig {
    pub fn new() -> Self {
        Self {
            database_url: None,
            migrations_dir: PathBuf::from("migrations"),
            ledger_table: DEFAULT_LEDGER_TABLE.to_string(),
            lock: false,
            lock_key: DEFAULT_LOCK_KEY,
            constraint_check: ConstraintCheck::default(),
            supplier_tables: DEFAULT_OWNING_TABLES.iter().map(|t| t.to_string()).collect(),
            log_level: "info".to_string(),
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::new();

        config.database_url = env::var("DATABASE_URL").ok();

        if let Ok(dir) = env::var("STRATA_MIGRATIONS_DIR") {
            config.migrations_dir = PathBuf::from(dir);
        }

        if let Ok(table) = env::var("STRATA_LEDGER_TABLE") {
            config.ledger_table = table;
        }

        if let Ok(lock_str) = env::var("STRATA_LOCK") {
            config.lock = parse_bool(&lock_str).ok_or_else(|| {
                ConfigError::invalid_value("lock", &lock_str, "true, false, 1 or 0")
            })?;
        }

        if let Ok(key_str) = env::var("STRATA_LOCK_KEY") {
            config.lock_key = key_str
                .trim()
                .parse()
                .map_err(|_| ConfigError::invalid_value("lock_key", &key_str, "a 64-bit integer"))?;
        }

        if let Ok(check_str) = env::var("STRATA_CONSTRAINT_CHECK") {
            config.constraint_check = check_str
                .parse()
                .map_err(|_| ConfigError::invalid_value("constraint_check", &check_str, "strict or name_only"))?;
        }

        if let Ok(tables) = env::var("STRATA_SUPPLIER_TABLES") {
            config.supplier_tables = parse_list(&tables);
        }

        if let Ok(log_level) = env::var("STRATA_LOG") {
            config.log_level = log_level.to_lowercase();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.database_url {
            validate_database_url(url).map_err(|e| {
                ConfigError::invalid_value("database_url", redact(url), e.message)
            })?;
        }

        validate_identifier(&self.ledger_table).map_err(|e| {
            ConfigError::invalid_value("ledger_table", &self.ledger_table, e.reason)
        })?;

        for table in &self.supplier_tables {
            validate_identifier(table)
                .map_err(|e| ConfigError::invalid_value("supplier_tables", table, e.reason))?;
        }

        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::invalid_value(
                "log_level",
                &self.log_level,
                format!("one of: {}", LOG_LEVELS.join(", ")),
            ));
        }

        Ok(())
    }

    /// The database URL, or an error naming where to set it
    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url.as_deref().ok_or_else(|| {
            ConfigError::missing_required(
                "database_url",
                "Set DATABASE_URL or pass --database-url",
            )
        })
    }

    /// Run options implied by this configuration
    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            lock_key: self.lock.then_some(self.lock_key),
            ..RunOptions::default()
        }
    }
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Split a comma-separated list, dropping blanks
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Hide the password of a connection URL
fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => match parsed.set_password(Some("***")) {
            Ok(()) => parsed.to_string(),
            // Hostless URLs cannot carry a replacement password
            Err(()) => "<redacted>".to_string(),
        },
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<unparseable>".to_string(),
    }
}
