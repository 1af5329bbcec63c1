//! Safe-mode policy: blocked module prefixes and blocked builtins.
//!
//! One [`Policy`] feeds two layers. [`Policy::assert_safe`] rejects parsed
//! source before it runs. [`Policy::restricted_builtins`] builds the builtin
//! table the script then runs with, so anything reached dynamically (a
//! builtin fetched out of a list, `__import__` passed around as a value)
//! still hits the same lists.
//!
//! This is a filter, not an isolation boundary.

use std::sync::{Arc, Mutex};

use rustpython::vm::builtins::{PyBaseExceptionRef, PyDictRef, PyStr};
use rustpython::vm::function::FuncArgs;
use rustpython::vm::{PyObjectRef, PyResult, VirtualMachine};
use rustpython_ast::Visitor;
use rustpython_parser::ast;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine;
use crate::exec::ExecError;

pub const DEFAULT_BLOCKED_MODULES: &[&str] = &[
    "builtins",
    "ctypes",
    "http",
    "importlib",
    "inspect",
    "multiprocessing",
    "os",
    "pathlib",
    "pickle",
    "resource",
    "shutil",
    "signal",
    "site",
    "socket",
    "subprocess",
    "sys",
    "tempfile",
    "threading",
    "urllib",
    "venv",
    "zipfile",
];

pub const DEFAULT_BLOCKED_BUILTINS: &[&str] = &[
    "__import__",
    "breakpoint",
    "compile",
    "eval",
    "exec",
    "input",
    "open",
];

/// Builtins a safe-mode script may use. Every other non-dunder builtin is
/// shadowed by a stub that raises `NameError`.
pub const SAFE_BUILTINS: &[&str] = &[
    "abs",
    "all",
    "any",
    "bool",
    "dict",
    "enumerate",
    "Exception",
    "float",
    "hasattr",
    "int",
    "isinstance",
    "len",
    "list",
    "max",
    "min",
    "object",
    "pow",
    "print",
    "range",
    "reversed",
    "round",
    "set",
    "sorted",
    "str",
    "sum",
    "super",
    "tuple",
    "type",
    "zip",
    "__build_class__",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViolationKind {
    Import,
    Builtin,
}

impl ViolationKind {
    fn describe(self) -> &'static str {
        match self {
            Self::Import => "blocked module import in safe mode",
            Self::Builtin => "blocked builtin in safe mode",
        }
    }
}

/// A blocked import or builtin call in safe mode.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{}: {}", .kind.describe(), .name)]
pub struct PolicyViolation {
    pub kind: ViolationKind,
    pub name: String,
}

impl PolicyViolation {
    pub fn import(name: impl Into<String>) -> Self {
        Self {
            kind: ViolationKind::Import,
            name: name.into(),
        }
    }

    pub fn builtin(name: impl Into<String>) -> Self {
        Self {
            kind: ViolationKind::Builtin,
            name: name.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self.kind {
            ViolationKind::Import => "POLICY_BLOCKED_IMPORT",
            ViolationKind::Builtin => "POLICY_BLOCKED_BUILTIN",
        }
    }
}

/// First violation raised by a guard during one execution. It stays set
/// even when the script catches the exception.
#[derive(Debug, Clone, Default)]
pub struct ViolationLog(Arc<Mutex<Option<PolicyViolation>>>);

impl ViolationLog {
    pub fn record(&self, violation: PolicyViolation) {
        let mut slot = self.0.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(violation);
        }
    }

    pub fn take(&self) -> Option<PolicyViolation> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    blocked_modules: Vec<String>,
    blocked_builtins: Vec<String>,
}

impl Default for Policy {
    fn default() -> Self {
        Self::new(
            DEFAULT_BLOCKED_MODULES.iter().copied(),
            DEFAULT_BLOCKED_BUILTINS.iter().copied(),
        )
    }
}

impl Policy {
    /// Module prefixes are normalized (trimmed, lowercased); empty entries
    /// are dropped.
    pub fn new<M, B>(
        modules: impl IntoIterator<Item = M>,
        builtins: impl IntoIterator<Item = B>,
    ) -> Self
    where
        M: AsRef<str>,
        B: AsRef<str>,
    {
        let blocked_modules = modules
            .into_iter()
            .map(|m| m.as_ref().trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .collect();
        let blocked_builtins = builtins
            .into_iter()
            .map(|b| b.as_ref().trim().to_string())
            .filter(|b| !b.is_empty())
            .collect();
        Self {
            blocked_modules,
            blocked_builtins,
        }
    }

    /// Lists missing from `[policy]` fall back to the defaults.
    pub fn from_config(config: &crate::config::PolicyConfig) -> Self {
        let defaults = Self::default();
        Self {
            blocked_modules: match &config.blocked_modules {
                Some(list) => Self::new(list, Vec::<String>::new()).blocked_modules,
                None => defaults.blocked_modules,
            },
            blocked_builtins: match &config.blocked_builtins {
                Some(list) => Self::new(Vec::<String>::new(), list).blocked_builtins,
                None => defaults.blocked_builtins,
            },
        }
    }

    pub fn blocked_modules(&self) -> &[String] {
        &self.blocked_modules
    }

    pub fn blocked_builtins(&self) -> &[String] {
        &self.blocked_builtins
    }

    /// `os` blocks `os` and `os.path`, not `oswald`.
    pub fn is_blocked_module(&self, name: &str) -> bool {
        let name = name.trim().to_lowercase();
        self.blocked_modules.iter().any(|prefix| {
            name == *prefix
                || name
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }

    pub fn is_blocked_builtin(&self, name: &str) -> bool {
        self.blocked_builtins.iter().any(|b| b == name)
    }

    pub fn check_module(&self, name: &str) -> Result<(), PolicyViolation> {
        if self.is_blocked_module(name) {
            Err(PolicyViolation::import(name.trim()))
        } else {
            Ok(())
        }
    }

    /// Parses `source` and runs the static check.
    pub fn assert_safe(&self, source: &str) -> Result<(), ExecError> {
        let program = engine::parse(source)?;
        self.check_program(program)?;
        Ok(())
    }

    /// Walks every statement and expression, outer nodes before the nodes
    /// they contain, and fails on the first blocked import, blocked-builtin
    /// call or deletion of a blocked builtin's name.
    pub fn check_program(&self, program: ast::Suite) -> Result<(), PolicyViolation> {
        let mut walker = SafeModeWalker {
            policy: self,
            violation: None,
        };
        for stmt in program {
            if walker.violation.is_some() {
                break;
            }
            walker.visit_stmt(stmt);
        }
        walker.violation.map_or(Ok(()), Err)
    }

    /// Builtin table for safe mode, built from the interpreter's own
    /// builtins: allow-listed entries are kept, blocked ones become stubs
    /// that record a violation, everything else raises `NameError`, and
    /// `__import__` checks the module name before importing.
    pub fn restricted_builtins(
        &self,
        vm: &VirtualMachine,
        log: &ViolationLog,
    ) -> PyResult<PyDictRef> {
        let ambient = vm.builtins.dict();
        let table = vm.ctx.new_dict();

        for (key, value) in &ambient {
            let Some(name) = key.downcast_ref::<PyStr>().map(|s| s.as_str().to_owned()) else {
                continue;
            };
            let entry = if self.is_blocked_builtin(&name) {
                blocked_stub(vm, &name, log)
            } else if SAFE_BUILTINS.contains(&name.as_str()) {
                value
            } else if name.starts_with("__") && name.ends_with("__") {
                continue;
            } else {
                hidden_stub(vm, &name)
            };
            table.set_item(name.as_str(), entry, vm)?;
        }
        for name in &self.blocked_builtins {
            if table.get_item_opt(name.as_str(), vm)?.is_none() {
                table.set_item(name.as_str(), blocked_stub(vm, name, log), vm)?;
            }
        }

        let import = ambient.get_item("__import__", vm)?;
        table.set_item(
            "__import__",
            guarded_import(vm, self.clone(), log, import),
            vm,
        )?;
        Ok(table)
    }
}

struct SafeModeWalker<'a> {
    policy: &'a Policy,
    violation: Option<PolicyViolation>,
}

impl SafeModeWalker<'_> {
    fn flag(&mut self, violation: PolicyViolation) {
        if self.violation.is_none() {
            self.violation = Some(violation);
        }
    }

    fn flag_module(&mut self, name: &str) {
        if let Err(violation) = self.policy.check_module(name) {
            self.flag(violation);
        }
    }

    fn flag_builtin_name(&mut self, expr: &ast::Expr) {
        if let ast::Expr::Name(name) = expr {
            if self.policy.is_blocked_builtin(name.id.as_str()) {
                self.flag(PolicyViolation::builtin(name.id.as_str()));
            }
        }
    }
}

impl Visitor for SafeModeWalker<'_> {
    fn visit_stmt_import(&mut self, node: ast::StmtImport) {
        for alias in &node.names {
            self.flag_module(alias.name.as_str());
        }
    }

    fn visit_stmt_import_from(&mut self, node: ast::StmtImportFrom) {
        let module = node.module.as_ref().map_or("", |m| m.as_str());
        self.flag_module(module);
    }

    fn visit_stmt_delete(&mut self, node: ast::StmtDelete) {
        for target in &node.targets {
            self.flag_builtin_name(target);
        }
        self.generic_visit_stmt_delete(node);
    }

    fn visit_expr_call(&mut self, node: ast::ExprCall) {
        self.flag_builtin_name(&node.func);
        self.generic_visit_expr_call(node);
    }
}

fn deny(vm: &VirtualMachine, log: &ViolationLog, violation: PolicyViolation) -> PyBaseExceptionRef {
    let message = violation.to_string();
    log.record(violation);
    vm.new_exception_msg(vm.ctx.exceptions.permission_error.to_owned(), message)
}

fn blocked_stub(vm: &VirtualMachine, name: &str, log: &ViolationLog) -> PyObjectRef {
    let violation = PolicyViolation::builtin(name);
    let log = log.clone();
    vm.new_function("blocked", move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult {
        Err(deny(vm, &log, violation.clone()))
    })
    .into()
}

fn hidden_stub(vm: &VirtualMachine, name: &str) -> PyObjectRef {
    let message = format!("name '{name}' is not defined");
    vm.new_function("hidden", move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult {
        Err(vm.new_exception_msg(vm.ctx.exceptions.name_error.to_owned(), message.clone()))
    })
    .into()
}

fn guarded_import(
    vm: &VirtualMachine,
    policy: Policy,
    log: &ViolationLog,
    import: PyObjectRef,
) -> PyObjectRef {
    let log = log.clone();
    vm.new_function("__import__", move |args: FuncArgs, vm: &VirtualMachine| -> PyResult {
        let checked = args
            .args
            .first()
            .and_then(|name| name.downcast_ref::<PyStr>())
            .map(|name| policy.check_module(name.as_str()));
        if let Some(Err(violation)) = checked {
            return Err(deny(vm, &log, violation));
        }
        import.call(args, vm)
    })
    .into()
}
