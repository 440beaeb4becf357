//! monagent configuration loading and parsing

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "/etc/monagent/config.toml";

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub shell: ShellConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sql: SqlConfig,
    /// File the configuration was read from, `None` when running on defaults
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
    /// Reload when the definition file changes on disk
    #[serde(default = "default_true")]
    pub watch: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
            watch: true,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_shell_program")]
    pub program: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: default_shell_program(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SqlConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Databases that keep a pool between executions
    #[serde(default = "default_max_databases")]
    pub max_databases: usize,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_databases: default_max_databases(),
        }
    }
}

/// The slice of configuration the backends are built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    pub shell_program: String,
    pub user_agent: String,
    pub connect_timeout_ms: u64,
    pub sql_pool_size: usize,
    pub sql_max_databases: usize,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            shell_program: default_shell_program(),
            user_agent: default_user_agent(),
            connect_timeout_ms: default_connect_timeout_ms(),
            sql_pool_size: default_pool_size(),
            sql_max_databases: default_max_databases(),
        }
    }
}

impl AgentConfig {
    pub fn backend_settings(&self) -> BackendSettings {
        BackendSettings {
            shell_program: self.shell.program.clone(),
            user_agent: self.http.user_agent.clone(),
            connect_timeout_ms: self.http.connect_timeout_ms,
            sql_pool_size: self.sql.pool_size,
            sql_max_databases: self.sql.max_databases,
        }
    }
}

// Default value functions
fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8090))
}
fn default_log_level() -> String {
    "info".into()
}
fn default_registry_path() -> PathBuf {
    PathBuf::from("/etc/monagent/commands.toml")
}
fn default_true() -> bool {
    true
}
fn default_shell_program() -> String {
    "/bin/sh".into()
}
fn default_user_agent() -> String {
    concat!("monagent/", env!("CARGO_PKG_VERSION")).into()
}
fn default_connect_timeout_ms() -> u64 {
    2000
}
fn default_pool_size() -> usize {
    4
}
fn default_max_databases() -> usize {
    16
}

/// Load configuration from the path in `MONAGENT_CONFIG` or the default location
pub fn load_config() -> Result<AgentConfig> {
    load_config_from(&config_path())
}

pub fn config_path() -> PathBuf {
    std::env::var_os("MONAGENT_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Runs before logging is up, so it reports through `source` instead of logging

pub fn load_config_from(path: &Path) -> Result<AgentConfig> {
    if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let mut config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    } else {
        Ok(AgentConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.server.listen.port(), 8090);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert_eq!(config.registry.path, PathBuf::from("/etc/monagent/commands.toml"));
        assert!(config.registry.watch);
        assert_eq!(config.shell.program, "/bin/sh");
        assert_eq!(config.sql.pool_size, 4);
        assert_eq!(config.sql.max_databases, 16);
        assert!(config.source.is_none());
        assert!(config.http.user_agent.starts_with("monagent/"));
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml_str = r#"
[server]
listen = "127.0.0.1:9100"

[logging]
format = "json"
"#;
        let config: AgentConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.sql.pool_size, 4);
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[server]
listen = "0.0.0.0:8090"

[logging]
level = "debug"
format = "compact"

[registry]
path = "/opt/monagent/commands.json"
watch = false

[shell]
program = "/bin/bash"

[http]
user_agent = "sap-monitor/2.1"
connect_timeout_ms = 500

[sql]
pool_size = 8
max_databases = 3
"#;
        let config: AgentConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(!config.registry.watch);
        assert_eq!(config.registry.path, PathBuf::from("/opt/monagent/commands.json"));

        let settings = config.backend_settings();
        assert_eq!(settings.shell_program, "/bin/bash");
        assert_eq!(settings.user_agent, "sap-monitor/2.1");
        assert_eq!(settings.connect_timeout_ms, 500);
        assert_eq!(settings.sql_pool_size, 8);
        assert_eq!(settings.sql_max_databases, 3);
    }

    #[test]
    fn test_invalid_listen_rejected() {
        let toml_str = "[server]\nlisten = \"not an address\"\n";
        assert!(toml::from_str::<AgentConfig>(toml_str).is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.listen.port(), 8090);
        assert!(config.source.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sql]\npool_size = 2\n").unwrap();
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.sql.pool_size, 2);
        assert_eq!(config.source.as_deref(), Some(path.as_path()));

        std::fs::write(&path, "[sql]\npool_size = \"two\"\n").unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }
}
