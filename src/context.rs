//! Bounded context slicing.
//!
//! A `get_context` request names the slices it wants; the slicer picks them
//! out of the caller-supplied data, synthesizes the `runtime` slice, and then
//! shrinks the result until its canonical size fits the byte budget:
//!
//! 1. drop whole slices in the configured drop order,
//! 2. collapse `runtime` to `{pid, hostVersion, isBackground}`,
//! 3. collapse everything to `{runtime: {pid}}`.
//!
//! The last step always fits under the minimum budget, so every response is
//! within budget.

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::canonical::{canonical_len, digest};

/// Budget used when the request carries none (or an unparsable one).
pub const DEFAULT_BUDGET_BYTES: usize = 32_768;

/// Smallest budget a request can ask for.
pub const MIN_BUDGET_BYTES: usize = 128;

/// Largest budget a request can ask for (1 MiB).
pub const MAX_BUDGET_BYTES: usize = 1024 * 1024;

/// Slice name that is synthesized from runtime facts instead of copied.
pub const RUNTIME_SLICE: &str = "runtime";

/// Most-expendable first. `runtime` is never dropped, only collapsed.
pub const DEFAULT_DROP_ORDER: &[&str] = &[
    "active_node_tree_ir",
    "geometry_stats",
    "node_tree_summary",
    "modifier_stack",
    "active_object",
    "scene",
];

/// Clamps a raw budget value into `[MIN_BUDGET_BYTES, MAX_BUDGET_BYTES]`.
///
/// Integers are taken as-is, floats are truncated, numeric strings are
/// parsed and booleans count as 0 or 1. Anything else (including a missing
/// value) yields [`DEFAULT_BUDGET_BYTES`].
pub fn normalize_budget(raw: Option<&Value>) -> usize {
    let parsed: Option<i128> = match raw {
        Some(Value::Number(n)) => n
            .as_i64()
            .map(i128::from)
            .or_else(|| n.as_u64().map(i128::from))
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i128)),
        Some(Value::String(s)) => s.trim().parse::<i128>().ok(),
        Some(Value::Bool(b)) => Some(i128::from(*b)),
        _ => None,
    };

    match parsed {
        None => DEFAULT_BUDGET_BYTES,
        Some(n) if n < MIN_BUDGET_BYTES as i128 => MIN_BUDGET_BYTES,
        Some(n) if n > MAX_BUDGET_BYTES as i128 => MAX_BUDGET_BYTES,
        Some(n) => n as usize,
    }
}

/// Normalizes the raw `slices` list of a request.
///
/// Strings are trimmed and lowercased, numbers are stringified; empty names
/// and other JSON values are skipped. Order (and duplicates) are preserved.
pub fn normalize_slice_names(raw: &[Value]) -> Vec<String> {
    raw.iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.trim().to_lowercase()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|name| !name.is_empty())
        .collect()
}

/// Facts about the running process and host, supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeFacts {
    pub pid: u32,
    pub cwd: Option<String>,
    pub runtime_version: String,
    pub host_version: Option<String>,
    pub document_path: Option<String>,
    pub is_background: Option<bool>,
}

impl RuntimeFacts {
    /// The full `runtime` slice.
    pub fn to_slice(&self) -> Value {
        json!({
            "pid": self.pid,
            "cwd": self.cwd,
            "runtimeVersion": self.runtime_version,
            "hostVersion": self.host_version,
            "documentPath": self.document_path,
            "isBackground": self.is_background,
        })
    }
}

/// What the slicer did to fit the budget.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlicingMeta {
    pub budget_bytes: usize,
    pub source_bytes: usize,
    pub payload_bytes: usize,
    pub content_hash: String,
    pub sliced_hash: String,
    pub truncated: bool,
    pub dropped_slices: Vec<String>,
    pub requested_slices: Vec<String>,
}

/// Selects and shrinks named slices to fit a byte budget.
#[derive(Debug, Clone)]
pub struct ContextSlicer {
    drop_order: Vec<String>,
}

impl Default for ContextSlicer {
    fn default() -> Self {
        Self::new(DEFAULT_DROP_ORDER.iter().map(|s| s.to_string()))
    }
}

impl ContextSlicer {
    pub fn new(drop_order: impl IntoIterator<Item = String>) -> Self {
        let drop_order = drop_order
            .into_iter()
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty() && name != RUNTIME_SLICE)
            .collect();
        Self { drop_order }
    }

    pub fn drop_order(&self) -> &[String] {
        &self.drop_order
    }

    /// Builds the candidate payload for `requested` names (already normalized).
    pub fn select(
        &self,
        requested: &[String],
        available: &Map<String, Value>,
        runtime: &RuntimeFacts,
    ) -> Map<String, Value> {
        let mut selected = Map::new();
        for name in requested {
            if selected.contains_key(name) {
                continue;
            }
            if name == RUNTIME_SLICE {
                selected.insert(name.clone(), runtime.to_slice());
            } else if let Some(value) = available.get(name) {
                selected.insert(name.clone(), value.clone());
            }
        }
        selected
    }

    /// Full pipeline: normalize budget, select, fit.
    pub fn slice(
        &self,
        requested: &[String],
        available: &Map<String, Value>,
        runtime: &RuntimeFacts,
        budget: Option<&Value>,
    ) -> (Value, SlicingMeta) {
        let budget = normalize_budget(budget);
        let selected = self.select(requested, available, runtime);
        let (payload, mut meta) = self.fit(selected, budget);
        meta.requested_slices = requested.to_vec();
        (payload, meta)
    }

    /// Shrinks `selected` until its canonical size is within `budget`.
    ///
    /// `budget` is clamped again here so direct callers get the same
    /// guarantee as requests going through [`normalize_budget`].
    pub fn fit(&self, selected: Map<String, Value>, budget: usize) -> (Value, SlicingMeta) {
        let budget = budget.clamp(MIN_BUDGET_BYTES, MAX_BUDGET_BYTES);
        let source = Value::Object(selected);
        let source_bytes = canonical_len(&source);
        let content_hash = digest(&source);

        let mut working = match source {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let mut dropped = Vec::new();

        let over = |map: &Map<String, Value>| canonical_len(&Value::Object(map.clone())) > budget;

        if over(&working) {
            for name in &self.drop_order {
                if working.contains_key(name) && over(&working) {
                    working.remove(name);
                    dropped.push(name.clone());
                }
            }
        }

        if over(&working) {
            if let Some(Value::Object(runtime)) = working.get(RUNTIME_SLICE) {
                let collapsed = json!({
                    "pid": runtime.get("pid").cloned().unwrap_or(Value::Null),
                    "hostVersion": runtime.get("hostVersion").cloned().unwrap_or(Value::Null),
                    "isBackground": runtime.get("isBackground").cloned().unwrap_or(Value::Null),
                });
                working.insert(RUNTIME_SLICE.to_string(), collapsed);
                debug!("Collapsed runtime slice to fit {budget} bytes");
            }
        }

        if over(&working) {
            let pid = working
                .get(RUNTIME_SLICE)
                .and_then(|runtime| runtime.get("pid"))
                .filter(|pid| !pid.is_null())
                .cloned()
                .unwrap_or_else(|| json!(std::process::id()));
            working = Map::new();
            working.insert(RUNTIME_SLICE.to_string(), json!({ "pid": pid }));
            debug!("Collapsed context to process identity to fit {budget} bytes");
        }

        let payload = Value::Object(working);
        let payload_bytes = canonical_len(&payload);
        let sliced_hash = digest(&payload);
        let meta = SlicingMeta {
            budget_bytes: budget,
            source_bytes,
            payload_bytes,
            truncated: content_hash != sliced_hash,
            content_hash,
            sliced_hash,
            dropped_slices: dropped,
            requested_slices: Vec::new(),
        };
        (payload, meta)
    }
}
