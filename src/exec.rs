//! Execution environments for submitted code.
//!
//! [`Executor::prepare`] snapshots everything an execution needs (trust
//! level, policy, host facts, registered modules) into a plain
//! [`Environment`]. The job built from it runs in a fresh interpreter,
//! either on the blocking pool or in a worker process, so nothing a script
//! does survives into the next execution.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine;
use crate::host::{HostApplication, HostFacts};
use crate::modules::{ModuleLoader, ResolvedModule};
use crate::policy::{Policy, PolicyViolation};
use crate::worker::{self, WorkerCommand};

/// `__name__` of submitted code.
pub const BRIDGE_MODULE_NAME: &str = "__bridge__";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    #[default]
    Safe,
    Trusted,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid execution mode: {0} (expected 'safe' or 'trusted')")]
pub struct InvalidTrustLevel(pub String);

impl TrustLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Safe => "safe",
            Self::Trusted => "trusted",
        }
    }

    /// Reads `payload.mode`. Missing, `null` and `""` mean safe; anything
    /// else must spell `safe` or `trusted`.
    pub fn from_payload(raw: Option<&serde_json::Value>) -> Result<Self, InvalidTrustLevel> {
        let text = match raw {
            None | Some(serde_json::Value::Null) => return Ok(Self::Safe),
            Some(serde_json::Value::String(s)) => s.as_str(),
            Some(other) => return Err(InvalidTrustLevel(other.to_string())),
        };
        match text.trim().to_lowercase().as_str() {
            "" | "safe" => Ok(Self::Safe),
            "trusted" => Ok(Self::Trusted),
            _ => Err(InvalidTrustLevel(text.to_string())),
        }
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an execution failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "snake_case")]
pub enum ExecError {
    #[error(transparent)]
    Policy(#[from] PolicyViolation),
    #[error("SyntaxError: {message} (line {line})")]
    Syntax { message: String, line: usize },
    /// An exception escaped the script.
    #[error("{}", describe_exception(.exception, .message))]
    Runtime {
        exception: String,
        message: String,
        traceback: Option<String>,
    },
    /// The worker process died or answered with garbage.
    #[error("execution worker failed: {0}")]
    Worker(String),
}

fn describe_exception(exception: &str, message: &str) -> String {
    if message.is_empty() {
        exception.to_string()
    } else {
        format!("{exception}: {message}")
    }
}

/// Trust level plus everything the interpreter is seeded with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub trust: TrustLevel,
    pub policy: Policy,
    pub host: Option<HostFacts>,
    pub modules: Vec<ResolvedModule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Task {
    /// Run source as `__bridge__`.
    Exec { source: String },
    /// Import a registered module by name.
    Import { module: String },
}

/// Unit of work handed to the engine, possibly across a process boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub env: Environment,
    pub task: Task,
}

/// What came back from one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub stdout: String,
    pub stderr: String,
    pub error: Option<ExecError>,
}

impl Report {
    pub fn failed(error: ExecError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionOutcome {
    pub mode: TrustLevel,
    pub stdout: String,
    pub stderr: String,
}

/// The error plus whatever the script printed before it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ExecutionFailure {
    pub error: ExecError,
    pub stdout: String,
    pub stderr: String,
}

/// Where jobs run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Isolation {
    /// On the blocking pool of this process.
    #[default]
    InProcess,
    /// In a short-lived worker process, one per job.
    Subprocess(WorkerCommand),
}

#[derive(Clone)]
pub struct Executor {
    policy: Arc<Policy>,
    host: Arc<dyn HostApplication>,
    loader: Arc<ModuleLoader>,
    isolation: Isolation,
}

impl Executor {
    pub fn new(
        policy: Arc<Policy>,
        host: Arc<dyn HostApplication>,
        loader: Arc<ModuleLoader>,
    ) -> Self {
        Self {
            policy,
            host,
            loader,
            isolation: Isolation::InProcess,
        }
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn host(&self) -> &dyn HostApplication {
        self.host.as_ref()
    }

    pub fn loader(&self) -> &ModuleLoader {
        &self.loader
    }

    pub fn prepare(&self, trust: TrustLevel) -> Environment {
        Environment {
            trust,
            policy: self.policy.as_ref().clone(),
            host: HostFacts::collect(self.host.as_ref()),
            modules: self.loader.registered(),
        }
    }

    /// Runs `source` in `env`: parse, static check in safe mode, then run
    /// with stdout/stderr captured.
    pub async fn execute(
        &self,
        env: Environment,
        source: &str,
    ) -> Result<ExecutionOutcome, ExecutionFailure> {
        debug!("Executing {} bytes in {} mode", source.len(), env.trust);
        let task = Task::Exec {
            source: source.to_string(),
        };
        self.submit(Job { env, task }).await
    }

    /// `prepare` then `execute`.
    pub async fn run(
        &self,
        trust: TrustLevel,
        source: &str,
    ) -> Result<ExecutionOutcome, ExecutionFailure> {
        self.execute(self.prepare(trust), source).await
    }

    /// Imports `module` in trusted mode with it registered alongside the
    /// modules already known.
    pub async fn import_module(
        &self,
        module: &ResolvedModule,
    ) -> Result<ExecutionOutcome, ExecutionFailure> {
        let mut env = self.prepare(TrustLevel::Trusted);
        env.modules.retain(|known| known.name != module.name);
        env.modules.push(module.clone());
        let task = Task::Import {
            module: module.name.clone(),
        };
        self.submit(Job { env, task }).await
    }

    async fn submit(&self, job: Job) -> Result<ExecutionOutcome, ExecutionFailure> {
        let mode = job.env.trust;
        let report = match &self.isolation {
            Isolation::InProcess => tokio::task::spawn_blocking(move || engine::run(&job))
                .await
                .unwrap_or_else(|e| Report::failed(ExecError::Worker(e.to_string()))),
            Isolation::Subprocess(command) => worker::run_isolated(command, &job)
                .await
                .unwrap_or_else(|error| {
                    warn!("Execution worker failed: {error}");
                    Report::failed(error)
                }),
        };

        let Report {
            stdout,
            stderr,
            error,
        } = report;
        match error {
            None => Ok(ExecutionOutcome {
                mode,
                stdout,
                stderr,
            }),
            Some(error) => Err(ExecutionFailure {
                error,
                stdout,
                stderr,
            }),
        }
    }
}
