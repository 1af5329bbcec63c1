//! Command dispatch: turns a parsed `{command, payload}` request into a
//! result mapping or a [`BridgeError`].

pub mod server;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::context::{normalize_slice_names, ContextSlicer, RuntimeFacts};
use crate::engine;
use crate::exec::{ExecError, Executor, InvalidTrustLevel, TrustLevel};
use crate::modules::ModuleError;
use crate::policy::PolicyViolation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ping,
    GetContext,
    ValidateModule,
    Exec,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::GetContext => "get_context",
            Self::ValidateModule => "validate_module",
            Self::Exec => "exec",
        }
    }

    /// Commands that run script code and may go through the execution gate.
    pub fn is_execution(self) -> bool {
        matches!(self, Self::ValidateModule | Self::Exec)
    }

    /// Reads the `command` field of a request. Non-string values are unknown.
    pub fn from_request(raw: Option<&Value>) -> Result<Self, BridgeError> {
        match raw {
            Some(Value::String(name)) => name.parse(),
            Some(other) => Err(BridgeError::unknown_command(&other.to_string())),
            None => Err(BridgeError::unknown_command("")),
        }
    }
}

impl FromStr for Command {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ping" => Ok(Self::Ping),
            "get_context" => Ok(Self::GetContext),
            "validate_module" => Ok(Self::ValidateModule),
            "exec" => Ok(Self::Exec),
            _ => Err(BridgeError::unknown_command(s)),
        }
    }
}

/// Every failure a request can end in, with its HTTP status.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Policy(#[from] PolicyViolation),
    #[error("{message}")]
    Validation { code: &'static str, message: String },
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{message}")]
    Forbidden { code: &'static str, message: String },
    #[error("{message}")]
    NotFound { code: &'static str, message: String },
    #[error("{message}")]
    Host {
        code: Option<&'static str>,
        message: String,
    },
}

impl BridgeError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn unknown_command(name: &str) -> Self {
        Self::validation("UNKNOWN_COMMAND", format!("Unknown command: {name}"))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Policy(_) | Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Host { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Policy(violation) => Some(violation.code()),
            Self::Validation { code, .. }
            | Self::Forbidden { code, .. }
            | Self::NotFound { code, .. } => Some(code),
            Self::Unauthorized => None,
            Self::Host { code, .. } => *code,
        }
    }

    pub fn body(&self) -> Value {
        let mut body = Map::new();
        body.insert("ok".into(), Value::Bool(false));
        body.insert("error".into(), Value::String(self.to_string()));
        if let Some(code) = self.code() {
            body.insert("code".into(), Value::String(code.to_string()));
        }
        Value::Object(body)
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

impl From<ExecError> for BridgeError {
    fn from(err: ExecError) -> Self {
        let message = err.to_string();
        match err {
            ExecError::Policy(violation) => Self::Policy(violation),
            ExecError::Syntax { .. } => Self::validation("EXEC_SYNTAX_ERROR", message),
            ExecError::Runtime { traceback, .. } => {
                if let Some(traceback) = traceback {
                    debug!("Script traceback:\n{traceback}");
                }
                Self::Host {
                    code: Some("EXEC_RUNTIME_ERROR"),
                    message,
                }
            }
            ExecError::Worker(_) => Self::Host {
                code: Some("EXEC_WORKER_FAILED"),
                message,
            },
        }
    }
}

impl From<ModuleError> for BridgeError {
    fn from(err: ModuleError) -> Self {
        let code = err.code();
        let message = err.to_string();
        match err {
            ModuleError::PathRequired => Self::Validation { code, message },
            ModuleError::Forbidden(_) => Self::Forbidden { code, message },
            ModuleError::NotFound(_) | ModuleError::EntryMissing(_) => {
                Self::NotFound { code, message }
            }
        }
    }
}

impl From<InvalidTrustLevel> for BridgeError {
    fn from(err: InvalidTrustLevel) -> Self {
        Self::validation("EXEC_INVALID_MODE", err.to_string())
    }
}

/// Routes commands to their handlers. Shared by every request.
pub struct Dispatcher {
    executor: Executor,
    slicer: ContextSlicer,
    exec_gate: Option<Mutex<()>>,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Dispatcher {
    /// With `serialize`, execution commands run one at a time.
    pub fn new(executor: Executor, slicer: ContextSlicer, serialize: bool) -> Self {
        Self {
            executor,
            slicer,
            exec_gate: serialize.then(|| Mutex::new(())),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub async fn dispatch(
        &self,
        command: Option<&Value>,
        payload: &Map<String, Value>,
    ) -> Result<Value, BridgeError> {
        let command = Command::from_request(command)?;
        debug!("Dispatching {}", command.as_str());

        let _gate = match (&self.exec_gate, command.is_execution()) {
            (Some(gate), true) => Some(gate.lock().await),
            _ => None,
        };

        match command {
            Command::Ping => Ok(self.ping()),
            Command::GetContext => Ok(self.get_context(payload)),
            Command::ValidateModule => self.validate_module(payload).await,
            Command::Exec => self.exec(payload).await,
        }
    }

    pub fn runtime_facts(&self) -> RuntimeFacts {
        let host = self.executor.host();
        RuntimeFacts {
            pid: std::process::id(),
            cwd: std::env::current_dir()
                .ok()
                .map(|dir| dir.display().to_string()),
            runtime_version: engine::runtime_version(),
            host_version: host.version(),
            document_path: host.document_path(),
            is_background: host.is_background(),
        }
    }

    fn ping(&self) -> Value {
        json!({
            "ok": true,
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
            "startedAt": self.started_at.to_rfc3339(),
            "uptimeSecs": self.started.elapsed().as_secs(),
        })
    }

    /// Runtime facts, plus bounded slices when `payload.slices` is a list.
    /// Slice data other than `runtime` comes from the payload itself.
    fn get_context(&self, payload: &Map<String, Value>) -> Value {
        let facts = self.runtime_facts();
        let mut ctx = match facts.to_slice() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        ctx.insert("ok".into(), Value::Bool(true));

        if let Some(Value::Array(raw)) = payload.get("slices") {
            let requested = normalize_slice_names(raw);
            let (slices, meta) =
                self.slicer
                    .slice(&requested, payload, &facts, payload.get("max_bytes"));
            if meta.truncated {
                info!(
                    "Context sliced from {} to {} bytes, dropped {:?}",
                    meta.source_bytes, meta.payload_bytes, meta.dropped_slices
                );
            }
            ctx.insert("slices".into(), slices);
            ctx.insert("slicing".into(), json!(meta));
        }
        Value::Object(ctx)
    }

    /// Resolves the module directory, imports it in trusted mode and
    /// registers it on success.
    async fn validate_module(&self, payload: &Map<String, Value>) -> Result<Value, BridgeError> {
        let raw_path = payload.get("modulePath").and_then(Value::as_str);
        let loader = self.executor.loader();
        let module = loader.resolve(raw_path)?;
        info!("Validating module {} at {}", module.name, module.dir.display());

        let outcome = self
            .executor
            .import_module(&module)
            .await
            .map_err(|failure| {
                debug!(
                    "Module {} failed; discarding {} bytes of output",
                    module.name,
                    failure.stdout.len() + failure.stderr.len()
                );
                BridgeError::from(failure.error)
            })?;
        let reloaded = loader.register(&module);
        Ok(json!({
            "ok": true,
            "module": module.name,
            "modulePath": module.dir.display().to_string(),
            "reloaded": reloaded,
            "stdout": outcome.stdout,
        }))
    }

    async fn exec(&self, payload: &Map<String, Value>) -> Result<Value, BridgeError> {
        let code = match payload.get("code") {
            Some(Value::String(code)) if !code.trim().is_empty() => code,
            _ => {
                return Err(BridgeError::validation(
                    "EXEC_INVALID_CODE",
                    "code must be a non-empty string",
                ))
            }
        };
        let trust = TrustLevel::from_payload(payload.get("mode"))?;

        let outcome = self
            .executor
            .run(trust, code)
            .await
            .map_err(|failure| {
                debug!(
                    "Execution failed in {} mode; partial stdout {:?}, stderr {:?}",
                    trust, failure.stdout, failure.stderr
                );
                BridgeError::from(failure.error)
            })?;
        info!("Executed {} bytes in {} mode", code.len(), trust);
        Ok(json!({
            "ok": true,
            "mode": outcome.mode,
            "stdout": outcome.stdout,
            "stderr": outcome.stderr,
        }))
    }
}

/// Shared dispatcher handle for the transport.
pub type SharedDispatcher = Arc<Dispatcher>;
