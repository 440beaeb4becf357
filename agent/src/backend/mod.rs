//! Execution backends: shell, SOAP, REST and SQL.
//!
//! The variant set is closed: a [`ResolvedCommand`] names exactly one
//! backend and [`Backends::execute`] dispatches it with a single `match`.
//! Each backend honours the timeout it is given and releases its
//! resources (child processes, pooled connections) on every exit path.

pub mod pool;
pub mod rest;
pub mod shell;
pub mod soap;
pub mod sql;

use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::BackendSettings;
use crate::error::{BackendError, BindError};

/// Supported backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Shell,
    Soap,
    Rest,
    Sql,
}

impl BackendKind {
    pub const ALL: [BackendKind; 4] = [
        BackendKind::Shell,
        BackendKind::Soap,
        BackendKind::Rest,
        BackendKind::Sql,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Shell => "shell",
            BackendKind::Soap => "soap",
            BackendKind::Rest => "rest",
            BackendKind::Sql => "sql",
        }
    }

    /// Case-insensitive lookup by name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name.trim()))
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command with every template rendered, ready for one backend
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedCommand {
    Shell {
        command: String,
    },
    Soap {
        endpoint: Url,
        envelope: String,
        action: Option<String>,
        headers: Vec<(String, String)>,
    },
    Rest {
        method: Method,
        endpoint: Url,
        headers: Vec<(String, String)>,
        body: Option<String>,
    },
    Sql {
        database: PathBuf,
        query: String,
        params: Vec<String>,
    },
}

impl ResolvedCommand {
    pub fn kind(&self) -> BackendKind {
        match self {
            ResolvedCommand::Shell { .. } => BackendKind::Shell,
            ResolvedCommand::Soap { .. } => BackendKind::Soap,
            ResolvedCommand::Rest { .. } => BackendKind::Rest,
            ResolvedCommand::Sql { .. } => BackendKind::Sql,
        }
    }
}

/// Long-lived backend state shared by all executions
pub struct Backends {
    shell: shell::ShellBackend,
    soap: soap::SoapBackend,
    rest: rest::RestBackend,
    sql: sql::SqlBackend,
}

impl Backends {
    pub fn new(settings: &BackendSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .connect_timeout(Duration::from_millis(settings.connect_timeout_ms))
            .build()?;

        Ok(Self {
            shell: shell::ShellBackend::new(settings.shell_program.clone()),
            soap: soap::SoapBackend::new(http.clone()),
            rest: rest::RestBackend::new(http),
            sql: sql::SqlBackend::new(settings.sql_pool_size, settings.sql_max_databases),
        })
    }

    /// Execute one resolved command within `timeout`
    pub async fn execute(
        &self,
        resolved: ResolvedCommand,
        timeout: Duration,
    ) -> Result<Vec<u8>, BackendError> {
        match resolved {
            ResolvedCommand::Shell { command } => self.shell.execute(&command, timeout).await,
            ResolvedCommand::Soap {
                endpoint,
                envelope,
                action,
                headers,
            } => {
                self.soap
                    .execute(endpoint, envelope, action.as_deref(), &headers, timeout)
                    .await
            }
            ResolvedCommand::Rest {
                method,
                endpoint,
                headers,
                body,
            } => {
                self.rest
                    .execute(method, endpoint, &headers, body, timeout)
                    .await
            }
            ResolvedCommand::Sql {
                database,
                query,
                params,
            } => self.sql.execute(&database, query, params, timeout).await,
        }
    }
}

/// Parse a rendered endpoint, defaulting to `http://` when no scheme is given
pub fn parse_endpoint(rendered: &str) -> Result<Url, BindError> {
    let trimmed = rendered.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    let url = Url::parse(&candidate).map_err(|e| BindError::InvalidEndpoint {
        endpoint: rendered.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "http" | "https" if url.host_str().is_some_and(|h| !h.is_empty()) => Ok(url),
        "http" | "https" => Err(BindError::InvalidEndpoint {
            endpoint: rendered.to_string(),
            reason: "missing host".to_string(),
        }),
        other => Err(BindError::InvalidEndpoint {
            endpoint: rendered.to_string(),
            reason: format!("unsupported scheme `{other}`"),
        }),
    }
}

/// Map a transport-level reqwest failure onto the backend taxonomy
pub(crate) fn transport_error(err: reqwest::Error, timeout: Duration) -> BackendError {
    if err.is_timeout() {
        return BackendError::Timeout(timeout);
    }
    let mut message = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    BackendError::Unreachable(message)
}

/// Keep remote diagnostics readable in error envelopes
pub(crate) fn snippet(text: &str) -> String {
    const MAX_CHARS: usize = 2048;
    let text = text.trim();
    if text.chars().count() <= MAX_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_CHARS).collect();
    format!("{cut}... [truncated]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_from_name() {
        assert_eq!(BackendKind::from_name("shell"), Some(BackendKind::Shell));
        assert_eq!(BackendKind::from_name("SOAP"), Some(BackendKind::Soap));
        assert_eq!(BackendKind::from_name(" rest "), Some(BackendKind::Rest));
        assert_eq!(BackendKind::from_name("sql"), Some(BackendKind::Sql));
        assert_eq!(BackendKind::from_name("ftp"), None);
    }

    #[test]
    fn test_backend_kind_display() {
        assert_eq!(BackendKind::Soap.to_string(), "soap");
        assert_eq!(
            serde_json::to_string(&BackendKind::Rest).unwrap(),
            "\"rest\""
        );
    }

    #[test]
    fn test_parse_endpoint_adds_scheme() {
        let url = parse_endpoint("hana01.example.net:8000/rfc").unwrap();
        assert_eq!(url.as_str(), "http://hana01.example.net:8000/rfc");
        assert_eq!(url.port(), Some(8000));
    }

    #[test]
    fn test_parse_endpoint_keeps_https() {
        let url = parse_endpoint("https://mon.example.net/api/v1/cpu").unwrap();
        assert_eq!(url.scheme(), "https");
    }

    #[test]
    fn test_parse_endpoint_rejects_garbage() {
        assert!(matches!(
            parse_endpoint("http://"),
            Err(BindError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            parse_endpoint("ftp://host/file"),
            Err(BindError::InvalidEndpoint { .. })
        ));
        assert!(matches!(
            parse_endpoint("bad host:99999"),
            Err(BindError::InvalidEndpoint { .. })
        ));
    }

    #[test]
    fn test_snippet_truncates() {
        let long = "x".repeat(5000);
        let s = snippet(&long);
        assert!(s.ends_with("[truncated]"));
        assert!(s.len() < 2100);
        assert_eq!(snippet("  short  "), "short");
    }
}
