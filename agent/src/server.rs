//! HTTP front door
//!
//! `POST /execute` runs one command and maps its terminal state onto a
//! status code. `GET /commands`, `GET /health` and `POST /reload` expose the
//! registry. Handlers share nothing mutable; each request clones the
//! current snapshot `Arc` through the engine.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::backend::BackendKind;
use crate::engine::{Engine, ExecutionRequest};
use crate::error::ExecutionError;
use crate::template::ParamValue;

const EXECUTION_ID_HEADER: &str = "x-execution-id";

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

/// Build the agent's router
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/commands", get(list_commands))
        .route("/health", get(health))
        .route("/reload", post(reload))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { engine })
}

/// Serve `app` on `listener` until `shutdown` resolves
pub async fn serve(
    listener: tokio::net::TcpListener,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("monagent listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// --- API Types ---

#[derive(Deserialize)]
struct ExecuteBody {
    name: String,
    #[serde(default)]
    params: HashMap<String, ParamValue>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    Text,
    Base64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ExecuteResponse {
    pub payload: String,
    pub encoding: PayloadEncoding,
    pub backend: BackendKind,
    pub elapsed_ms: u64,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    pub error: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct CommandInfo {
    pub name: String,
    pub backend: BackendKind,
    pub description: String,
    pub params: BTreeMap<String, String>,
    pub required: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub commands: usize,
    pub registry_version: String,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct ReloadResponse {
    pub registry_version: String,
    pub commands: usize,
}

/// Error envelope with its status code
struct ApiError {
    status: StatusCode,
    body: ErrorResponse,
}

impl ApiError {
    fn new(status: StatusCode, error: &str, detail: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorResponse {
                error: error.to_string(),
                detail: detail.into(),
                backend: None,
                kind: None,
            },
        }
    }
}

impl From<ExecutionError> for ApiError {
    fn from(err: ExecutionError) -> Self {
        let detail = err.to_string();
        match err {
            ExecutionError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "not_found", detail),
            ExecutionError::BadRequest(_) => Self::new(StatusCode::BAD_REQUEST, "bad_request", detail),
            ExecutionError::Timeout { .. } => Self::new(StatusCode::GATEWAY_TIMEOUT, "timeout", detail),
            ExecutionError::BackendFailure { backend, source } => {
                let mut api = Self::new(StatusCode::BAD_GATEWAY, "backend_failure", detail);
                api.body.backend = Some(backend);
                api.body.kind = Some(source.kind().to_string());
                api
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Text when the payload is valid UTF-8, base64 otherwise
fn encode_payload(payload: Vec<u8>) -> (String, PayloadEncoding) {
    match String::from_utf8(payload) {
        Ok(text) => (text, PayloadEncoding::Text),
        Err(e) => (
            base64::engine::general_purpose::STANDARD.encode(e.into_bytes()),
            PayloadEncoding::Base64,
        ),
    }
}

// --- Handlers ---

async fn execute(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let body: ExecuteBody = serde_json::from_slice(&body)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, "bad_request", format!("invalid request body: {e}")))?;

    let request = ExecutionRequest {
        name: body.name,
        params: body
            .params
            .into_iter()
            .map(|(k, v)| (k, v.into_string()))
            .collect(),
    };

    let output = state.engine.run(request).await?;
    let (payload, encoding) = encode_payload(output.payload);
    let mut response = Json(ExecuteResponse {
        payload,
        encoding,
        backend: output.backend,
        elapsed_ms: output.elapsed.as_millis() as u64,
    })
    .into_response();

    if let Ok(id) = HeaderValue::from_str(&output.execution_id.to_string()) {
        response.headers_mut().insert(EXECUTION_ID_HEADER, id);
    }
    Ok(response)
}

async fn list_commands(State(state): State<AppState>) -> Json<Vec<CommandInfo>> {
    let snapshot = state.engine.registry().snapshot();
    let commands = snapshot
        .specs()
        .into_iter()
        .map(|spec| CommandInfo {
            name: spec.name.clone(),
            backend: spec.backend,
            description: spec.description.clone(),
            params: spec.params.clone(),
            required: spec.required_params(),
        })
        .collect();
    Json(commands)
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.engine.registry().snapshot();
    Json(HealthResponse {
        status: "ok".to_string(),
        commands: snapshot.len(),
        registry_version: snapshot.version.clone(),
        loaded_at: snapshot.loaded_at,
    })
}

async fn reload(State(state): State<AppState>) -> Result<Json<ReloadResponse>, ApiError> {
    let engine = Arc::clone(&state.engine);
    let result = tokio::task::spawn_blocking(move || engine.registry().reload_configured())
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string()))?;

    match result {
        Ok(snapshot) => Ok(Json(ReloadResponse {
            registry_version: snapshot.version.clone(),
            commands: snapshot.len(),
        })),
        Err(e) => {
            warn!("Reload via API failed: {e}");
            Err(ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "config_error", e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackendError, TemplateError};
    use std::time::Duration;

    #[test]
    fn test_encode_payload() {
        assert_eq!(
            encode_payload(b"42\n".to_vec()),
            ("42\n".to_string(), PayloadEncoding::Text)
        );
        assert_eq!(
            encode_payload(vec![0xff, 0x00]),
            ("/wA=".to_string(), PayloadEncoding::Base64)
        );
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ExecutionError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                ExecutionError::BadRequest(TemplateError::MissingParameter("server".into()).into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                ExecutionError::Timeout {
                    command: "x".into(),
                    after: Duration::from_secs(5),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                ExecutionError::BackendFailure {
                    backend: BackendKind::Rest,
                    source: BackendError::HttpStatus {
                        status: 503,
                        body: "down".into(),
                    },
                },
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn test_backend_failure_envelope() {
        let api = ApiError::from(ExecutionError::BackendFailure {
            backend: BackendKind::Soap,
            source: BackendError::RemoteFault {
                status: 500,
                fault: "RFC_ERROR".into(),
            },
        });
        let json = serde_json::to_value(&api.body).unwrap();
        assert_eq!(json["error"], "backend_failure");
        assert_eq!(json["backend"], "soap");
        assert_eq!(json["kind"], "remote_fault");
        assert!(json["detail"].as_str().unwrap().contains("RFC_ERROR"));
    }

    #[test]
    fn test_plain_error_envelope_omits_backend_fields() {
        let api = ApiError::from(ExecutionError::NotFound("unknown_cmd".into()));
        let json = serde_json::to_value(&api.body).unwrap();
        assert_eq!(json["error"], "not_found");
        assert!(json.get("backend").is_none());
        assert!(json.get("kind").is_none());
    }
}
