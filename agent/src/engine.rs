//! Execution engine
//!
//! Pipeline: lookup spec → bind parameters → select backend → execute (with timeout) → finalize
//!
//! Every run captures one registry snapshot up front and works from it to
//! the end, so a reload in the middle of an execution cannot change the
//! spec being run.

use reqwest::header::{HeaderName, HeaderValue};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{field, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backend::{self, rest, soap, BackendKind, Backends, ResolvedCommand};
use crate::error::{BackendError, BindError, ExecutionError};
use crate::registry::{CommandSpec, Registry};
use crate::template::{self, Escape, ParameterSet};

/// Grace period on top of a spec's timeout before the engine abandons the
/// backend future itself
const TIMEOUT_SLACK: Duration = Duration::from_millis(250);

/// One request to run a named command
#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub name: String,
    pub params: ParameterSet,
}

impl ExecutionRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: ParameterSet::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// Successful result of one execution
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub execution_id: Uuid,
    pub payload: Vec<u8>,
    pub backend: BackendKind,
    pub elapsed: Duration,
}

pub type ExecutionResult = Result<ExecutionOutput, ExecutionError>;

pub struct Engine {
    registry: Arc<Registry>,
    backends: Backends,
}

impl Engine {
    pub fn new(registry: Arc<Registry>, backends: Backends) -> Self {
        Self { registry, backends }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run one request to a terminal state
    pub async fn run(&self, request: ExecutionRequest) -> ExecutionResult {
        let execution_id = Uuid::new_v4();
        let span = info_span!(
            "execution",
            id = %execution_id,
            command = %request.name,
            backend = field::Empty,
            version = field::Empty,
        );
        self.run_inner(execution_id, request).instrument(span).await
    }

    async fn run_inner(&self, execution_id: Uuid, request: ExecutionRequest) -> ExecutionResult {
        let start = Instant::now();
        let snapshot = self.registry.snapshot();
        let span = tracing::Span::current();
        span.record("version", snapshot.version.as_str());

        // 1. Lookup
        let spec = snapshot.get(&request.name).ok_or_else(|| {
            warn!("Unknown command requested");
            ExecutionError::NotFound(request.name.clone())
        })?;

        // 2. Bind
        let resolved = resolve(&spec, &request.params).map_err(|e| {
            warn!("Parameter binding failed: {e}");
            ExecutionError::BadRequest(e)
        })?;

        // 3. Select backend
        let backend = resolved.kind();
        span.record("backend", backend.as_str());

        // 4. Execute. Backends enforce the timeout themselves; the outer
        // deadline only catches one that fails to.
        let outcome = tokio::time::timeout(
            spec.timeout + TIMEOUT_SLACK,
            self.backends.execute(resolved, spec.timeout),
        )
        .await;
        let elapsed = start.elapsed();

        // 5. Finalize
        match outcome {
            Ok(Ok(payload)) => {
                info!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    bytes = payload.len(),
                    "Execution succeeded"
                );
                Ok(ExecutionOutput {
                    execution_id,
                    payload,
                    backend,
                    elapsed,
                })
            }
            Ok(Err(BackendError::Timeout(_))) | Err(_) => {
                warn!(elapsed_ms = elapsed.as_millis() as u64, "Execution timed out");
                Err(ExecutionError::Timeout {
                    command: spec.name.clone(),
                    after: spec.timeout,
                })
            }
            Ok(Err(source)) => {
                warn!(
                    elapsed_ms = elapsed.as_millis() as u64,
                    kind = source.kind(),
                    "Execution failed: {source}"
                );
                Err(ExecutionError::BackendFailure { backend, source })
            }
        }
    }
}

/// Render every template of `spec` against the merged parameters and build
/// the backend-specific command. No I/O happens here.
pub fn resolve(spec: &CommandSpec, request: &ParameterSet) -> Result<ResolvedCommand, BindError> {
    let params = template::merge(&spec.params, request);

    match spec.backend {
        BackendKind::Shell => Ok(ResolvedCommand::Shell {
            command: template::render_with(&spec.command, &params, Escape::Shell)?,
        }),
        BackendKind::Soap => {
            let body = template::render_with(&spec.command, &params, Escape::Xml)?;
            Ok(ResolvedCommand::Soap {
                endpoint: render_endpoint(spec, &params)?,
                envelope: soap::envelope(&body),
                action: spec
                    .action
                    .as_deref()
                    .map(|a| template::render(a, &params))
                    .transpose()?,
                headers: render_headers(spec, &params)?,
            })
        }
        BackendKind::Rest => {
            let method = rest::parse_method(&spec.method)
                .ok_or_else(|| BindError::InvalidMethod(spec.method.clone()))?;
            Ok(ResolvedCommand::Rest {
                method,
                endpoint: render_endpoint(spec, &params)?,
                headers: render_headers(spec, &params)?,
                body: spec
                    .body
                    .as_deref()
                    .map(|b| template::render(b, &params))
                    .transpose()?,
            })
        }
        BackendKind::Sql => {
            let database = template::render(endpoint_template(spec)?, &params)?;
            let (query, values) = template::bind_positional(&spec.command, &params)?;
            Ok(ResolvedCommand::Sql {
                database: PathBuf::from(database.trim()),
                query,
                params: values,
            })
        }
    }
}

fn endpoint_template(spec: &CommandSpec) -> Result<&str, BindError> {
    spec.endpoint
        .as_deref()
        .ok_or_else(|| BindError::InvalidEndpoint {
            endpoint: String::new(),
            reason: format!("command `{}` has no endpoint", spec.name),
        })
}

fn render_endpoint(spec: &CommandSpec, params: &ParameterSet) -> Result<reqwest::Url, BindError> {
    let rendered = template::render(endpoint_template(spec)?, params)?;
    backend::parse_endpoint(&rendered)
}

fn render_headers(
    spec: &CommandSpec,
    params: &ParameterSet,
) -> Result<Vec<(String, String)>, BindError> {
    spec.headers
        .iter()
        .map(|(name, value)| {
            let value = template::render(value, params)?;
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| BindError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
            HeaderValue::from_str(&value).map_err(|e| BindError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
            Ok((name.clone(), value))
        })
        .collect()
}
