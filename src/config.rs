//! YAML configuration, deserialized with serde and validated once at
//! startup. Every optional knob carries an explicit default so a
//! minimal config file stays minimal.

use std::path::Path;

use serde::Deserialize;

use crate::utils::AppError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub homeserver: HomeserverConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub oauth2: Option<OAuth2Config>,
    #[serde(default)]
    pub ghosts: GhostsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HomeserverConfig {
    /// Client-server API base, e.g. `https://matrix.example.org`.
    pub url: String,
    /// The server name user ids end with.
    pub server_name: String,
    #[serde(alias = "as_token")]
    pub appservice_token: String,
    #[serde(alias = "hs_token")]
    pub homeserver_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub engine: DbEngine,
    /// File path for sqlite, connection URL for postgres.
    pub connection_string: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbEngine {
    #[default]
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuth2Config {
    pub client_id: String,
    pub client_secret: String,
    /// External base URL the `authorize` callback is reachable at.
    pub redirect_prefix: String,
    /// Maximum number of workspaces that may install the bridge via a
    /// bot-token grant. `None` means unlimited.
    #[serde(default)]
    pub team_limit: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhostsConfig {
    #[serde(default = "default_username_prefix")]
    pub username_prefix: String,
    /// Appended to every synced ghost displayname, e.g. " (Slack)".
    #[serde(default = "default_displayname_suffix")]
    pub displayname_suffix: String,
}

impl Default for GhostsConfig {
    fn default() -> Self {
        Self {
            username_prefix: default_username_prefix(),
            displayname_suffix: default_displayname_suffix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `pretty` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(&path)?;
        let config = Self::load_from_str(&content)?;
        Ok(config)
    }

    pub fn load_from_str(content: &str) -> Result<Self, AppError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.homeserver.url.is_empty() {
            return Err(AppError::InvalidConfig(
                "homeserver.url cannot be empty".to_string(),
            ));
        }
        if self.homeserver.server_name.is_empty() {
            return Err(AppError::InvalidConfig(
                "homeserver.server_name cannot be empty".to_string(),
            ));
        }
        if self.homeserver.appservice_token.is_empty() {
            return Err(AppError::InvalidConfig(
                "homeserver.as_token cannot be empty".to_string(),
            ));
        }
        if self.database.connection_string.is_empty() {
            return Err(AppError::InvalidConfig(
                "database.connection_string cannot be empty".to_string(),
            ));
        }
        if self.web.port == 0 {
            return Err(AppError::InvalidConfig(
                "web.port must be between 1 and 65535".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_connections() -> u32 {
    8
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9898
}

fn default_username_prefix() -> String {
    "_slack_".to_string()
}

fn default_displayname_suffix() -> String {
    " (Slack)".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
