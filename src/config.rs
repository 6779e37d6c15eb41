//! Configuration loader for the `codemetal-damwatch` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). Engine policy that the library needs in-process
//! lives in [`EngineConfig`], which has defaults so the engine can be used
//! without any environment at all.
use std::{env, net::SocketAddr, str::FromStr};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::models::{BreachKind, DangerLevel, DangerLevelId};

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional environment variable through `FromStr` with a default value.
macro_rules! parse_env_or {
    ($var_name:expr, $ty:ty, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional boolean environment variable with a default value.
///
/// Accepts `1|true|yes|on` and `0|false|no|off`, case-insensitively.
macro_rules! parse_env_bool {
    ($var_name:expr, $default:expr) => {
        match env::var($var_name) {
            Ok(v) => parse_flag(&v)
                .ok_or_else(|| anyhow!("Invalid {}: expected a boolean, got '{}'", $var_name, v))?,
            Err(_) => $default,
        }
    };
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

// ---

/// Which outputs the instrument-wide deterministic limit applies to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeterministicScope {
    /// Every computed output is compared to the limit.
    #[default]
    EachOutput,
    /// Only the instrument's designated primary output is compared. An
    /// instrument without one, or whose primary output names no defined
    /// output, falls back to every output.
    PrimaryOutput,
}

impl FromStr for DeterministicScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "each_output" => Ok(DeterministicScope::EachOutput),
            "primary_output" => Ok(DeterministicScope::PrimaryOutput),
            other => Err(format!(
                "expected 'each_output' or 'primary_output', got '{other}'"
            )),
        }
    }
}

/// Danger level assigned to each kind of breach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DangerLevelMapping {
    pub deterministic: DangerLevelId,
    pub statistical: DangerLevelId,
}

impl Default for DangerLevelMapping {
    fn default() -> Self {
        // Statistical breaches rank below deterministic ones.
        Self {
            deterministic: 3,
            statistical: 2,
        }
    }
}

impl DangerLevelMapping {
    pub fn for_breach(&self, kind: BreachKind) -> DangerLevelId {
        match kind {
            BreachKind::Deterministic => self.deterministic,
            BreachKind::Statistical => self.statistical,
        }
    }

    fn validate(&self) -> Result<()> {
        // ---
        for (var, id) in [
            ("DETERMINISTIC_DANGER_LEVEL", self.deterministic),
            ("STATISTICAL_DANGER_LEVEL", self.statistical),
        ] {
            if DangerLevel::by_id(id).is_none() {
                return Err(anyhow!("Invalid {}: no danger level with id {}", var, id));
            }
        }
        Ok(())
    }
}

/// Engine policy shared by every pipeline invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Allow output formulas to reference other outputs.
    pub allow_output_chaining: bool,
    pub deterministic_scope: DeterministicScope,
    pub danger_levels: DangerLevelMapping,
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Address the HTTP server binds to.
    pub listen_addr: SocketAddr,

    /// Engine policy.
    pub engine: EngineConfig,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `LISTEN_ADDR` – HTTP bind address (default: `0.0.0.0:8080`)
/// - `ALLOW_OUTPUT_CHAINING` – outputs may reference outputs (default: false)
/// - `DETERMINISTIC_LIMIT_SCOPE` – `each_output` | `primary_output` (default: `each_output`)
/// - `DETERMINISTIC_DANGER_LEVEL` – danger level id for deterministic breaches (default: 3)
/// - `STATISTICAL_DANGER_LEVEL` – danger level id for statistical breaches (default: 2)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let listen_addr = parse_env_or!(
        "LISTEN_ADDR",
        SocketAddr,
        SocketAddr::from(([0, 0, 0, 0], 8080))
    );

    let defaults = EngineConfig::default();
    let engine = EngineConfig {
        allow_output_chaining: parse_env_bool!("ALLOW_OUTPUT_CHAINING", false),
        deterministic_scope: parse_env_or!(
            "DETERMINISTIC_LIMIT_SCOPE",
            DeterministicScope,
            defaults.deterministic_scope
        ),
        danger_levels: DangerLevelMapping {
            deterministic: parse_env_or!(
                "DETERMINISTIC_DANGER_LEVEL",
                DangerLevelId,
                defaults.danger_levels.deterministic
            ),
            statistical: parse_env_or!(
                "STATISTICAL_DANGER_LEVEL",
                DangerLevelId,
                defaults.danger_levels.statistical
            ),
        },
    };
    engine.danger_levels.validate()?;

    Ok(Config {
        db_url,
        db_pool_max,
        listen_addr,
        engine,
    })
}

impl Config {
    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL               : {}", self.masked_db_url());
        tracing::info!("  DB_POOL_MAX                : {}", self.db_pool_max);
        tracing::info!("  LISTEN_ADDR                : {}", self.listen_addr);
        tracing::info!("  ALLOW_OUTPUT_CHAINING      : {}", self.engine.allow_output_chaining);
        tracing::info!("  DETERMINISTIC_LIMIT_SCOPE  : {:?}", self.engine.deterministic_scope);
        tracing::info!(
            "  DETERMINISTIC_DANGER_LEVEL : {}",
            self.engine.danger_levels.deterministic
        );
        tracing::info!("  STATISTICAL_DANGER_LEVEL   : {}", self.engine.danger_levels.statistical);
    }

    /// The database URL with its password replaced by `****`.
    pub fn masked_db_url(&self) -> String {
        // ---
        if let Some(at_pos) = self.db_url.rfind('@') {
            if let Some(colon_pos) = self.db_url[..at_pos].rfind(':') {
                return format!(
                    "{}:****{}",
                    &self.db_url[..colon_pos],
                    &self.db_url[at_pos..]
                );
            }
        }
        self.db_url.clone()
    }
}
