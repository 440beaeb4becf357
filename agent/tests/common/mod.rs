//! Shared fixtures for the HTTP-level integration tests

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use monagent::backend::Backends;
use monagent::config::BackendSettings;
use monagent::{server, Engine, Registry};
use serde_json::Value;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceExt;

/// An agent router over a registry file in a temp dir
pub struct Agent {
    pub dir: tempfile::TempDir,
    pub registry_path: PathBuf,
    pub registry: Arc<Registry>,
    pub app: Router,
}

impl Agent {
    pub fn new(commands: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry_path = dir.path().join("commands.toml");
        std::fs::write(&registry_path, commands).unwrap();

        let registry = Arc::new(Registry::from_path(&registry_path).unwrap());
        let backends = Backends::new(&BackendSettings::default()).unwrap();
        let engine = Arc::new(Engine::new(Arc::clone(&registry), backends));

        Self {
            dir,
            registry_path,
            registry,
            app: server::router(engine),
        }
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        let request = Request::get(uri).body(Body::empty()).unwrap();
        send(self.app.clone(), request).await
    }

    pub async fn post(&self, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(self.app.clone(), request).await
    }

    pub async fn execute(&self, body: Value) -> (StatusCode, Value) {
        self.post("/execute", &body.to_string()).await
    }
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// Serve `app` on an ephemeral local port
pub async fn spawn_mock(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}
