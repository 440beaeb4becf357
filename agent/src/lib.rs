//! monagent: monitoring command execution agent
//!
//! Named monitoring commands are defined in a hot-reloadable registry and
//! run on demand against one of four backends: a local shell, a SOAP
//! service, a REST endpoint or a SQLite database. Requests arrive over HTTP
//! and every execution ends in exactly one of success, bad request, not
//! found, timeout or backend failure.

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
pub mod server;
pub mod template;
pub mod watcher;

pub use engine::{Engine, ExecutionOutput, ExecutionRequest, ExecutionResult};
pub use error::{BackendError, BindError, ConfigError, ExecutionError, TemplateError};
pub use registry::{CommandSpec, Registry, RegistrySnapshot};
