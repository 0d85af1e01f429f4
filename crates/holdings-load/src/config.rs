//! Loader configuration
//!
//! A YAML file with `${VAR}` / `${VAR:-default}` expansion:
//!
//! ```yaml
//! database:
//!   host: ${DB_HOST:-localhost}
//!   port: 5432
//!   name: filings
//!   user: etl
//!   password: ${DB_PASSWORD}
//! target:
//!   schema: public
//!   table: holdings
//! load:
//!   max_concurrency: 4
//! periods: [2024Q1, 2024Q2]
//! source:
//!   kind: csv
//!   path: ./extract/holdings.csv
//! logging:
//!   level: info
//!   directory: ./logs
//! ```
//!
//! Without a file, [`LoaderConfig::from_env`] reads the `DB_HOST`, `DB_PORT`,
//! `DB_NAME`, `DB_USER` and `DB_PASSWORD` variables.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use validator::{Validate, ValidationError};

use crate::connection::{ConnectionConfig, ConnectionFactory};
use crate::error::{Error, Result};
use crate::loader::LoadOrchestrator;
use crate::security::{validate_parent_table_name, validate_sql_identifier};
use crate::source::SourceConfig;
use crate::telemetry::LoggingConfig;
use crate::types::{PartitionKey, PartitionedTable};

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// A string that never shows up in logs or serialized config.
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    /// Expose the secret value
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

fn validate_identifier(name: &str) -> std::result::Result<(), ValidationError> {
    validate_sql_identifier(name).map_err(|e| {
        ValidationError::new("invalid_identifier").with_message(e.to_string().into())
    })
}

fn validate_table_name(name: &str) -> std::result::Result<(), ValidationError> {
    validate_parent_table_name(name).map_err(|e| {
        ValidationError::new("invalid_table_name").with_message(e.to_string().into())
    })
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DatabaseConfig {
    /// Full connection URL; overrides the individual fields when set
    #[serde(default)]
    pub url: Option<SensitiveString>,

    /// Server host
    #[serde(default = "default_host")]
    #[validate(length(min = 1))]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    #[validate(range(min = 1))]
    pub port: u16,

    /// Database name
    #[serde(default = "default_database")]
    #[validate(length(min = 1))]
    pub name: String,

    /// User name
    #[serde(default = "default_user")]
    #[validate(length(min = 1))]
    pub user: String,

    /// Password
    #[serde(default)]
    pub password: Option<SensitiveString>,

    /// Connect timeout in milliseconds (default: 5000)
    #[serde(default = "default_connect_timeout_ms")]
    #[validate(range(min = 100, max = 600000))]
    pub connect_timeout_ms: u64,

    /// Reported as `application_name` to the server
    #[serde(default = "default_application_name")]
    pub application_name: String,

    /// Server runtime parameters (e.g. `statement_timeout`)
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "postgres".to_string()
}

fn default_user() -> String {
    "postgres".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_application_name() -> String {
    "holdings-load".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: default_port(),
            name: default_database(),
            user: default_user(),
            password: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            application_name: default_application_name(),
            properties: HashMap::new(),
        }
    }
}

impl DatabaseConfig {
    /// Settings from `DB_HOST`, `DB_PORT`, `DB_NAME`, `DB_USER`, `DB_PASSWORD`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(host) = lookup("DB_HOST") {
            config.host = host;
        }
        if let Some(port) = lookup("DB_PORT") {
            config.port = port
                .trim()
                .parse()
                .map_err(|_| Error::config(format!("DB_PORT '{}' is not a valid port", port)))?;
        }
        if let Some(name) = lookup("DB_NAME") {
            config.name = name;
        }
        if let Some(user) = lookup("DB_USER") {
            config.user = user;
        }
        config.password = lookup("DB_PASSWORD").map(SensitiveString::from);
        Ok(config)
    }

    /// Connection URL, built from the individual fields unless `url` is set
    pub fn connection_url(&self) -> Result<SensitiveString> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }

        let mut url = url::Url::parse(&format!("postgres://{}", self.host))
            .map_err(|e| Error::config(format!("invalid database host '{}': {}", self.host, e)))?;
        let invalid = |what: &str| Error::config(format!("cannot use {what} in connection url"));
        url.set_port(Some(self.port)).map_err(|_| invalid("port"))?;
        url.set_username(&self.user).map_err(|_| invalid("user"))?;
        if let Some(password) = &self.password {
            url.set_password(Some(password.expose_secret()))
                .map_err(|_| invalid("password"))?;
        }
        url.set_path(&self.name);

        Ok(SensitiveString::new(url.to_string()))
    }

    /// Connection settings for a [`ConnectionFactory`]
    pub fn connection_config(&self) -> Result<ConnectionConfig> {
        let mut config = ConnectionConfig::new(self.connection_url()?.expose_secret())
            .with_connect_timeout(self.connect_timeout_ms)
            .with_application_name(&self.application_name);
        for (key, value) in &self.properties {
            config = config.with_property(key, value);
        }
        Ok(config)
    }
}

/// Target table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct TargetConfig {
    /// Schema (default: public)
    #[serde(default = "default_schema")]
    #[validate(custom(function = "validate_identifier"))]
    pub schema: String,

    /// Parent table name (default: holdings)
    #[serde(default = "default_table")]
    #[validate(custom(function = "validate_table_name"))]
    pub table: String,
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_table() -> String {
    "holdings".to_string()
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            table: default_table(),
        }
    }
}

impl TargetConfig {
    /// Validated table reference
    pub fn table(&self) -> Result<PartitionedTable> {
        PartitionedTable::new(&self.schema, &self.table)
    }
}

/// Load behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct LoadSettings {
    /// Concurrent transfers; each opens its own connection (default: 1)
    #[serde(default = "default_max_concurrency")]
    #[validate(range(min = 1, max = 64))]
    pub max_concurrency: usize,
}

fn default_max_concurrency() -> usize {
    1
}

impl Default for LoadSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct LoaderConfig {
    /// Database connection
    #[serde(default)]
    #[validate(nested)]
    pub database: DatabaseConfig,

    /// Target table
    #[serde(default)]
    #[validate(nested)]
    pub target: TargetConfig,

    /// Load behaviour
    #[serde(default)]
    #[validate(nested)]
    pub load: LoadSettings,

    /// Reporting periods to load; empty means everything the source yields
    #[serde(default)]
    pub periods: Vec<PartitionKey>,

    /// Where records come from
    #[serde(default)]
    pub source: Option<SourceConfig>,

    /// Logging
    #[serde(default)]
    #[validate(nested)]
    pub logging: LoggingConfig,
}

impl LoaderConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| Error::config(format!("failed to parse config: {}", e)))?;
        config.check()?;
        Ok(config)
    }

    /// Defaults plus database settings from the `DB_*` environment variables
    pub fn from_env() -> Result<Self> {
        let config = Self {
            database: DatabaseConfig::from_env()?,
            ..Default::default()
        };
        config.check()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate field constraints
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::config(format!("invalid configuration: {}", e)))
    }

    /// Build an orchestrator for this configuration
    pub fn orchestrator(&self, factory: Arc<dyn ConnectionFactory>) -> Result<LoadOrchestrator> {
        Ok(LoadOrchestrator::new(
            factory,
            self.database.connection_config()?,
            self.target.table()?,
        )
        .with_max_concurrency(self.load.max_concurrency))
    }
}
