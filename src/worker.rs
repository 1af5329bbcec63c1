//! Out-of-process execution.
//!
//! The bridge re-executes its own binary with [`WORKER_FLAG`], writes one
//! [`Job`] as JSON to the child's stdin and reads one [`Report`] back from
//! its stdout. A script that aborts the interpreter (allocation failure,
//! native stack overflow, `os.abort()`) takes down the child, not the
//! bridge.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::engine;
use crate::exec::{ExecError, Job, Report};

/// Hidden argument that turns the binary into an execution worker.
pub const WORKER_FLAG: &str = "--exec-worker";

/// Default cap on the worker's address space.
pub const DEFAULT_MEMORY_LIMIT_MB: u64 = 2048;

/// Environment variables the worker never inherits.
const SCRUBBED_ENV: &[&str] = &["BRIDGE_TOKEN"];

/// How to start a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// This binary in worker mode. A memory limit of 0 leaves the address
    /// space unlimited.
    pub fn current_exe(memory_limit_mb: u64) -> std::io::Result<Self> {
        let mut args = vec![WORKER_FLAG.to_string()];
        if memory_limit_mb > 0 {
            args.push(memory_limit_mb.to_string());
        }
        Ok(Self {
            program: std::env::current_exe()?,
            args,
        })
    }
}

/// Sends `job` to a fresh worker and waits for its report.
pub async fn run_isolated(command: &WorkerCommand, job: &Job) -> Result<Report, ExecError> {
    let input = serde_json::to_vec(job)
        .map_err(|e| ExecError::Worker(format!("cannot encode job: {e}")))?;

    let mut cmd = tokio::process::Command::new(&command.program);
    cmd.args(&command.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for key in SCRUBBED_ENV {
        cmd.env_remove(key);
    }
    let mut child = cmd
        .spawn()
        .map_err(|e| ExecError::Worker(format!("cannot start worker: {e}")))?;

    if let Some(mut stdin) = child.stdin.take() {
        // A worker that dies early closes the pipe; its exit status says why.
        if let Err(e) = stdin.write_all(&input).await {
            debug!("Worker stopped reading its job: {e}");
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| ExecError::Worker(format!("cannot wait for worker: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!("Worker stderr: {}", stderr.trim());
        return Err(ExecError::Worker(output.status.to_string()));
    }
    serde_json::from_slice(&output.stdout)
        .map_err(|e| ExecError::Worker(format!("malformed report: {e}")))
}

/// Child side: limit resources, read one job from stdin, write one report
/// to stdout.
pub fn worker_main(memory_limit_mb: Option<&str>) -> anyhow::Result<()> {
    let memory_limit_mb = memory_limit_mb
        .map(|raw| raw.parse::<u64>())
        .transpose()
        .context("Worker memory limit is not a number")?;
    apply_limits(memory_limit_mb)?;

    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Cannot read job from stdin")?;
    let job: Job = serde_json::from_str(&input).context("Malformed job")?;

    let report = engine::run(&job);

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, &report).context("Cannot write report")?;
    stdout.flush()?;
    Ok(())
}

#[cfg(unix)]
fn apply_limits(memory_limit_mb: Option<u64>) -> anyhow::Result<()> {
    let ret_code = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &rlimit(0)) };
    os_result(ret_code).context("setrlimit(RLIMIT_CORE) failed")?;
    if let Some(mb) = memory_limit_mb {
        let bytes = rlimit(mb.saturating_mul(1024 * 1024));
        let ret_code = unsafe { libc::setrlimit(libc::RLIMIT_AS, &bytes) };
        os_result(ret_code).context("setrlimit(RLIMIT_AS) failed")?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_limits(_memory_limit_mb: Option<u64>) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn rlimit(value: u64) -> libc::rlimit {
    libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    }
}

#[cfg(unix)]
fn os_result(ret_code: libc::c_int) -> std::io::Result<()> {
    if ret_code != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
