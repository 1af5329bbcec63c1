//! Embedded Python engine.
//!
//! Every job gets a fresh RustPython interpreter on its own large-stack
//! thread. A bootstrap script runs first with the interpreter's full
//! builtins: it redirects `sys.stdout`/`sys.stderr` into buffers, publishes
//! the `host` module, makes registered modules importable, and then runs
//! the task in a separate namespace. In safe mode that namespace is seeded
//! with the policy's restricted builtin table.

use rustpython::vm::builtins::{PyBaseExceptionRef, PyDictRef, PyStr};
use rustpython::vm::{AsObject, PyObjectRef, PyResult, VirtualMachine};
use rustpython::InterpreterConfig;
use rustpython_parser::{ast, Parse};
use tracing::debug;

use crate::exec::{ExecError, Job, Report, Task, TrustLevel, BRIDGE_MODULE_NAME};
use crate::policy::ViolationLog;

/// Python frames a script may nest.
pub const RECURSION_LIMIT: usize = 1000;

/// Stack for the interpreter thread. Holds `RECURSION_LIMIT` frames with
/// room to spare.
const ENGINE_STACK_SIZE: usize = 256 * 1024 * 1024;

/// File name reported in tracebacks and parse errors.
const SOURCE_PATH: &str = "<bridge>";

const BOOTSTRAP: &str = r#"
import io
import json
import sys
import traceback
import types
import importlib
import importlib.util

job = json.loads(job)
env = job["env"]
task = job["task"]
sys.setrecursionlimit(recursion_limit)


class RegisteredModules:
    def __init__(self, modules):
        self.modules = {module["name"]: module for module in modules}

    def find_spec(self, name, path=None, target=None):
        module = self.modules.get(name)
        if module is None:
            return None
        return importlib.util.spec_from_file_location(
            name, module["entry"], submodule_search_locations=[module["dir"]]
        )


sys.meta_path.insert(0, RegisteredModules(env["modules"]))

if env["host"] is not None:
    host = types.ModuleType("host")
    for key, value in env["host"].items():
        setattr(host, key, value)
    sys.modules["host"] = host
    namespace["host"] = host

if shadow is not None:
    namespace.update(shadow)
    namespace["__builtins__"] = shadow
namespace["__name__"] = module_name

stdout, stderr = io.StringIO(), io.StringIO()
error_kind = error_message = error_traceback = None
previous = sys.stdout, sys.stderr
sys.stdout, sys.stderr = stdout, stderr
try:
    if task["kind"] == "exec":
        exec(compile(task["source"], source_path, "exec"), namespace)
    else:
        importlib.import_module(task["module"])
except BaseException as exc:
    error_kind = type(exc).__name__
    error_message = str(exc)
    error_traceback = traceback.format_exc()
finally:
    sys.stdout, sys.stderr = previous
stdout = stdout.getvalue()
stderr = stderr.getvalue()
"#;

/// Reported as `runtimeVersion` by `get_context`.
pub fn runtime_version() -> String {
    format!(
        "Python {} (RustPython)",
        rustpython::vm::version::get_version_number()
    )
}

/// Parses `source` as a module body.
pub fn parse(source: &str) -> Result<ast::Suite, ExecError> {
    ast::Suite::parse(source, SOURCE_PATH).map_err(|err| {
        let offset = usize::from(err.offset).min(source.len());
        let line = source.as_bytes()[..offset]
            .iter()
            .filter(|b| **b == b'\n')
            .count()
            + 1;
        ExecError::Syntax {
            message: err.error.to_string(),
            line,
        }
    })
}

/// Runs one job to completion. Never panics; every failure ends up in the
/// report.
pub fn run(job: &Job) -> Report {
    let job = job.clone();
    let thread = std::thread::Builder::new()
        .name("engine".to_string())
        .stack_size(ENGINE_STACK_SIZE)
        .spawn(move || run_on_thread(&job));
    match thread {
        Ok(handle) => handle.join().unwrap_or_else(|_| {
            Report::failed(ExecError::Worker("engine thread panicked".to_string()))
        }),
        Err(e) => Report::failed(ExecError::Worker(format!(
            "cannot start engine thread: {e}"
        ))),
    }
}

fn run_on_thread(job: &Job) -> Report {
    if let Err(error) = check(job) {
        return Report::failed(error);
    }
    let config = match serde_json::to_string(job) {
        Ok(config) => config,
        Err(e) => return Report::failed(ExecError::Worker(format!("cannot encode job: {e}"))),
    };

    let log = ViolationLog::default();
    let interpreter = InterpreterConfig::new().init_stdlib().interpreter();
    let mut report = interpreter
        .enter(|vm| {
            bootstrap(vm, job, &config, &log).map_err(|exc| exception_error(vm, &exc))
        })
        .unwrap_or_else(Report::failed);

    if let Some(violation) = log.take() {
        debug!("Guard tripped during execution: {violation}");
        report.error = Some(violation.into());
    }
    report
}

/// Static part: safe mode gets the policy walk, trusted mode only a parse.
fn check(job: &Job) -> Result<(), ExecError> {
    let Task::Exec { source } = &job.task else {
        return Ok(());
    };
    match job.env.trust {
        TrustLevel::Safe => job.env.policy.assert_safe(source),
        TrustLevel::Trusted => parse(source).map(drop),
    }
}

fn bootstrap(
    vm: &VirtualMachine,
    job: &Job,
    config: &str,
    log: &ViolationLog,
) -> PyResult<Report> {
    let scope = vm.new_scope_with_builtins();
    let control = scope.globals.clone();

    let shadow: PyObjectRef = match job.env.trust {
        TrustLevel::Safe => job.env.policy.restricted_builtins(vm, log)?.into(),
        TrustLevel::Trusted => vm.ctx.none(),
    };
    control.set_item("job", vm.ctx.new_str(config).into(), vm)?;
    control.set_item("shadow", shadow, vm)?;
    control.set_item("namespace", vm.ctx.new_dict().into(), vm)?;
    control.set_item("module_name", vm.ctx.new_str(BRIDGE_MODULE_NAME).into(), vm)?;
    control.set_item("source_path", vm.ctx.new_str(SOURCE_PATH).into(), vm)?;
    control.set_item("recursion_limit", vm.ctx.new_int(RECURSION_LIMIT).into(), vm)?;

    vm.run_code_string(scope, BOOTSTRAP, "<bootstrap>".to_owned())?;

    let error = match text(&control, "error_kind", vm)? {
        None => None,
        Some(exception) => Some(ExecError::Runtime {
            exception,
            message: text(&control, "error_message", vm)?.unwrap_or_default(),
            traceback: text(&control, "error_traceback", vm)?,
        }),
    };
    Ok(Report {
        stdout: text(&control, "stdout", vm)?.unwrap_or_default(),
        stderr: text(&control, "stderr", vm)?.unwrap_or_default(),
        error,
    })
}

/// A string global of the bootstrap scope. `None` when unset or not a str.
fn text(globals: &PyDictRef, key: &str, vm: &VirtualMachine) -> PyResult<Option<String>> {
    Ok(globals
        .get_item_opt(key, vm)?
        .and_then(|obj| obj.downcast_ref::<PyStr>().map(|s| s.as_str().to_owned())))
}

fn exception_error(vm: &VirtualMachine, exc: &PyBaseExceptionRef) -> ExecError {
    ExecError::Runtime {
        exception: (*exc.class().name()).to_owned(),
        message: exc
            .as_object()
            .str(vm)
            .map(|s| s.as_str().to_owned())
            .unwrap_or_default(),
        traceback: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::Environment;
    use crate::policy::{Policy, PolicyViolation};

    fn job(trust: TrustLevel, source: &str) -> Job {
        Job {
            env: Environment {
                trust,
                policy: Policy::default(),
                host: None,
                modules: Vec::new(),
            },
            task: Task::Exec {
                source: source.to_string(),
            },
        }
    }

    // ── parse tests ─────────────────────────────────────

    #[test]
    fn test_parse_reports_line() {
        let err = parse("a = 1\nb = 2\nc = (\n").unwrap_err();
        let ExecError::Syntax { line, message } = err else {
            panic!("expected a syntax error");
        };
        assert!(line >= 3, "line {line}");
        assert!(!message.is_empty());
    }

    #[test]
    fn test_parse_full_language() {
        let source = "async def f():\n    await g()\n@dec\nclass A(B, metaclass=M):\n    x: int = 1\nmatch v:\n    case [a, *rest]:\n        pass\n";
        assert_eq!(parse(source).unwrap().len(), 3);
    }

    #[test]
    fn test_runtime_version_names_engine() {
        assert!(runtime_version().contains("RustPython"));
    }

    // ── run tests ───────────────────────────────────────

    #[test]
    fn test_run_captures_both_streams() {
        let report = run(&job(
            TrustLevel::Trusted,
            "import sys\nprint('out')\nprint('err', file=sys.stderr)",
        ));
        assert_eq!(report.error, None);
        assert_eq!(report.stdout, "out\n");
        assert_eq!(report.stderr, "err\n");
    }

    #[test]
    fn test_run_static_check_precedes_execution() {
        let report = run(&job(TrustLevel::Safe, "print('never')\nimport socket"));
        assert_eq!(report.error, Some(PolicyViolation::import("socket").into()));
        assert_eq!(report.stdout, "");
    }

    #[test]
    fn test_run_system_exit_is_an_error() {
        let report = run(&job(TrustLevel::Trusted, "print('bye')\nraise SystemExit(3)"));
        assert_eq!(report.stdout, "bye\n");
        assert!(matches!(
            report.error,
            Some(ExecError::Runtime { ref exception, .. }) if exception == "SystemExit"
        ));
    }

    #[test]
    fn test_run_import_task() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("pkg");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("__init__.py"), "from .inner import VALUE\nprint(VALUE)\n").unwrap();
        std::fs::write(dir.join("inner.py"), "VALUE = 'nested'\n").unwrap();

        let mut job = job(TrustLevel::Trusted, "");
        job.env.modules.push(crate::modules::ResolvedModule {
            name: "pkg".to_string(),
            entry: dir.join("__init__.py"),
            dir,
        });
        job.task = Task::Import {
            module: "pkg".to_string(),
        };
        let report = run(&job);
        assert_eq!(report.error, None);
        assert_eq!(report.stdout, "nested\n");
    }
}
