//! Command Registry: stores and retrieves command specifications
//!
//! The active [`RegistrySnapshot`] is immutable. A reload parses and
//! validates a complete definition set off to the side and only then swaps
//! the shared pointer, so readers always see one consistent snapshot and a
//! failed reload changes nothing.

use chrono::{DateTime, Utc};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

use crate::backend::{rest, BackendKind};
use crate::error::{ConfigError, ExecutionError};
use crate::template::{self, ParamValue};

/// Applied when a definition gives no timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// One named monitoring operation
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub name: String,
    pub backend: BackendKind,
    /// Shell command line, SOAP body, or SQL query template
    pub command: String,
    /// Endpoint URL template (SOAP, REST) or database path template (SQL)
    pub endpoint: Option<String>,
    /// Default parameters, overridden by request values
    pub params: BTreeMap<String, String>,
    pub timeout: Duration,
    pub description: String,
    /// REST verb
    pub method: String,
    /// SOAPAction header template
    pub action: Option<String>,
    /// Header templates for SOAP and REST requests
    pub headers: BTreeMap<String, String>,
    /// REST request body template
    pub body: Option<String>,
}

impl CommandSpec {
    fn templates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.command.as_str())
            .chain(self.endpoint.as_deref())
            .chain(self.action.as_deref())
            .chain(self.body.as_deref())
            .chain(self.headers.values().map(String::as_str))
    }

    /// Parameters a request must supply because no default covers them
    pub fn required_params(&self) -> Vec<String> {
        let mut required: Vec<String> = self
            .templates()
            .filter_map(|t| template::placeholders(t).ok())
            .flatten()
            .filter(|name| !self.params.contains_key(name))
            .collect();
        required.sort();
        required.dedup();
        required
    }
}

/// Format of a command definition document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Toml,
    Json,
}

impl SourceFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => SourceFormat::Json,
            _ => SourceFormat::Toml,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandDef {
    #[serde(default)]
    name: Option<String>,
    backend: String,
    #[serde(default)]
    command: String,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    params: BTreeMap<String, ParamValue>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandDocument {
    #[serde(default)]
    commands: Entries<CommandDef>,
    #[serde(default)]
    command: Vec<CommandDef>,
}

/// Map entries in document order, duplicates preserved so they can be reported
#[derive(Debug)]
struct Entries<T>(Vec<(String, T)>);

impl<T> Default for Entries<T> {
    fn default() -> Self {
        Entries(Vec::new())
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Entries<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for EntriesVisitor<T> {
            type Value = Entries<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a table of command definitions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((key, value)) = map.next_entry::<String, T>()? {
                    entries.push((key, value));
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn invalid(name: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidEntry {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn check_template(name: &str, field: &str, text: &str) -> Result<(), ConfigError> {
    template::parse(text)
        .map(|_| ())
        .map_err(|e| invalid(name, format!("malformed {field} template: {e}")))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Validate one definition into a spec
fn validate(name: String, def: CommandDef) -> Result<CommandSpec, ConfigError> {
    if !is_valid_name(&name) {
        return Err(invalid(
            &name,
            "names may only contain letters, digits, `_`, `-` and `.`",
        ));
    }

    let backend = BackendKind::from_name(&def.backend).ok_or_else(|| {
        invalid(
            &name,
            format!(
                "unsupported backend kind `{}` (expected shell, soap, rest or sql)",
                def.backend
            ),
        )
    })?;

    let timeout_ms = match (def.timeout_ms, def.timeout_secs) {
        (Some(_), Some(_)) => {
            return Err(invalid(&name, "set either timeout_ms or timeout_secs, not both"))
        }
        (Some(ms), None) => ms,
        (None, Some(secs)) => secs.saturating_mul(1000),
        (None, None) => DEFAULT_TIMEOUT_MS,
    };
    if timeout_ms == 0 {
        return Err(invalid(&name, "timeout must be greater than zero"));
    }

    let endpoint = non_blank(def.endpoint);
    let body = non_blank(def.body);
    let action = non_blank(def.action);

    check_template(&name, "command", &def.command)?;
    if let Some(endpoint) = &endpoint {
        check_template(&name, "endpoint", endpoint)?;
    }
    if let Some(action) = &action {
        check_template(&name, "action", action)?;
    }
    if let Some(body) = &body {
        check_template(&name, "body", body)?;
    }
    for (header, value) in &def.headers {
        check_template(&name, &format!("header `{header}`"), value)?;
    }

    let needs_command = matches!(backend, BackendKind::Shell | BackendKind::Soap | BackendKind::Sql);
    if needs_command && def.command.trim().is_empty() {
        return Err(invalid(&name, format!("{backend} commands need a `command`")));
    }
    if backend != BackendKind::Shell && endpoint.is_none() {
        let what = if backend == BackendKind::Sql {
            "a database path"
        } else {
            "an endpoint"
        };
        return Err(invalid(&name, format!("{backend} commands need `endpoint` ({what})")));
    }

    let method = match def.method {
        Some(m) if backend == BackendKind::Rest => rest::parse_method(&m)
            .ok_or_else(|| invalid(&name, format!("unsupported HTTP method `{m}`")))?
            .to_string(),
        Some(_) => return Err(invalid(&name, "`method` only applies to rest commands")),
        None => "GET".to_string(),
    };

    Ok(CommandSpec {
        name,
        backend,
        command: def.command,
        endpoint,
        params: def
            .params
            .into_iter()
            .map(|(k, v)| (k, v.into_string()))
            .collect(),
        timeout: Duration::from_millis(timeout_ms),
        description: def.description,
        method,
        action,
        headers: def.headers,
        body,
    })
}

/// Parse and validate a full definition set. Fails on the first bad entry.
pub fn parse_definitions(
    text: &str,
    format: SourceFormat,
) -> Result<HashMap<String, Arc<CommandSpec>>, ConfigError> {
    let document: CommandDocument = match format {
        SourceFormat::Toml => toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?,
        SourceFormat::Json => {
            serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?
        }
    };

    let mut named = document.commands.0;
    for (index, mut def) in document.command.into_iter().enumerate() {
        let name = def
            .name
            .take()
            .ok_or_else(|| ConfigError::Parse(format!("command entry #{} has no `name`", index + 1)))?;
        named.push((name, def));
    }

    let mut commands = HashMap::with_capacity(named.len());
    for (name, def) in named {
        if let Some(inner) = &def.name {
            if inner != &name {
                return Err(invalid(&name, format!("`name` field `{inner}` does not match table key")));
            }
        }
        if commands.contains_key(&name) {
            return Err(ConfigError::DuplicateName(name));
        }
        let spec = validate(name.clone(), def)?;
        commands.insert(name, Arc::new(spec));
    }
    Ok(commands)
}

/// One immutable, internally consistent version of the registry
#[derive(Debug)]
pub struct RegistrySnapshot {
    commands: HashMap<String, Arc<CommandSpec>>,
    /// Content digest of the source document
    pub version: String,
    pub loaded_at: DateTime<Utc>,
    pub source: Option<PathBuf>,
}

impl RegistrySnapshot {
    pub fn empty() -> Self {
        Self {
            commands: HashMap::new(),
            version: "empty".to_string(),
            loaded_at: Utc::now(),
            source: None,
        }
    }

    pub fn parse(text: &str, format: SourceFormat, source: Option<PathBuf>) -> Result<Self, ConfigError> {
        let commands = parse_definitions(text, format)?;
        let digest = Sha256::digest(text.as_bytes());
        let version: String = format!("{digest:x}").chars().take(12).collect();
        Ok(Self {
            commands,
            version,
            loaded_at: Utc::now(),
            source,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<CommandSpec>> {
        self.commands.get(name).cloned()
    }

    /// All specs sorted by name
    pub fn specs(&self) -> Vec<Arc<CommandSpec>> {
        let mut specs: Vec<_> = self.commands.values().cloned().collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Process-wide holder of the active snapshot
pub struct Registry {
    active: RwLock<Arc<RegistrySnapshot>>,
    path: Option<PathBuf>,
}

impl Registry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            active: RwLock::new(Arc::new(snapshot)),
            path: None,
        }
    }

    /// Registry backed by a definition file. A missing file starts empty so
    /// that creating it later triggers the first load.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let snapshot = if path.exists() {
            load_file(&path)?
        } else {
            warn!("Command registry {} not found, starting empty", path.display());
            RegistrySnapshot::empty()
        };
        info!(
            "Loaded {} commands (version {})",
            snapshot.len(),
            snapshot.version
        );
        Ok(Self {
            active: RwLock::new(Arc::new(snapshot)),
            path: Some(path),
        })
    }

    /// Current snapshot; callers keep it for the whole of one execution
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        match self.active.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Look up a command in the current snapshot
    pub fn lookup(&self, name: &str) -> Result<Arc<CommandSpec>, ExecutionError> {
        self.snapshot()
            .get(name)
            .ok_or_else(|| ExecutionError::NotFound(name.to_string()))
    }

    /// Commands of the current snapshot, sorted by name
    pub fn list(&self) -> Vec<Arc<CommandSpec>> {
        self.snapshot().specs()
    }

    /// Validate `text` completely, then publish it as the active snapshot
    pub fn reload(&self, text: &str, format: SourceFormat) -> Result<Arc<RegistrySnapshot>, ConfigError> {
        self.install(RegistrySnapshot::parse(text, format, None))
    }

    /// Reload from a definition file
    pub fn reload_from_path(&self, path: &Path) -> Result<Arc<RegistrySnapshot>, ConfigError> {
        self.install(load_file(path))
    }

    /// Reload from the file this registry was created with
    pub fn reload_configured(&self) -> Result<Arc<RegistrySnapshot>, ConfigError> {
        let path = self.path.as_deref().ok_or(ConfigError::NoSource)?;
        self.reload_from_path(path)
    }

    fn install(
        &self,
        candidate: Result<RegistrySnapshot, ConfigError>,
    ) -> Result<Arc<RegistrySnapshot>, ConfigError> {
        let snapshot = match candidate {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                warn!("Registry reload rejected, keeping current snapshot: {e}");
                return Err(e);
            }
        };

        let previous = {
            let mut guard = match self.active.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *guard, Arc::clone(&snapshot))
        };

        info!(
            "Registry reloaded: {} commands (version {} -> {})",
            snapshot.len(),
            previous.version,
            snapshot.version
        );
        Ok(snapshot)
    }
}

fn load_file(path: &Path) -> Result<RegistrySnapshot, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    RegistrySnapshot::parse(&text, SourceFormat::from_path(path), Some(path.to_path_buf()))
}
