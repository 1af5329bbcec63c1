//! Loopback HTTP transport.
//!
//! - `POST /rpc`: `{command, payload}` → `{ok: true, result}` or an error
//!   body, behind the optional `x-bridge-token` check
//! - `GET /health`: unauthenticated liveness check
//!
//! Everything else is a 404.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::{BridgeError, Dispatcher, SharedDispatcher};

pub const TOKEN_HEADER: &str = "x-bridge-token";

#[derive(Clone)]
pub struct BridgeState {
    pub dispatcher: SharedDispatcher,
    /// `None` disables authentication.
    pub token: Option<Arc<str>>,
}

impl BridgeState {
    pub fn new(dispatcher: Dispatcher, token: Option<String>) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            token: token.filter(|t| !t.is_empty()).map(Arc::from),
        }
    }

    fn is_authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = &self.token else {
            return true;
        };
        headers
            .get(TOKEN_HEADER)
            .is_some_and(|given| tokens_match(expected.as_bytes(), given.as_bytes()))
    }
}

/// Constant-time over equal-length inputs.
fn tokens_match(expected: &[u8], given: &[u8]) -> bool {
    if expected.len() != given.len() {
        return false;
    }
    expected
        .iter()
        .zip(given)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

pub fn create_router(state: BridgeState) -> Router {
    Router::new()
        .route("/rpc", post(handle_rpc).fallback(not_found))
        .route("/health", get(health).fallback(not_found))
        .fallback(not_found)
        .with_state(state)
}

/// Binds the loopback listener. Port 0 picks a free port.
pub async fn bind(port: u16) -> std::io::Result<TcpListener> {
    TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port))).await
}

/// Serves until `shutdown` resolves, then drains in-flight requests.
pub async fn serve(
    listener: TcpListener,
    state: BridgeState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    info!("Bridge listening on http://{}", listener.local_addr()?);
    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "pid": std::process::id() }))
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "ok": false, "error": "Not found" })),
    )
        .into_response()
}

async fn handle_rpc(State(state): State<BridgeState>, headers: HeaderMap, body: Bytes) -> Response {
    let span = info_span!("rpc", id = %Uuid::new_v4());
    async move {
        match process(&state, &headers, &body).await {
            Ok(result) => Json(json!({ "ok": true, "result": result })).into_response(),
            Err(err) => {
                let status = err.status();
                if status.is_server_error() {
                    error!("Request failed ({status}): {err}");
                } else {
                    warn!("Request rejected ({status}): {err}");
                }
                err.into_response()
            }
        }
    }
    .instrument(span)
    .await
}

async fn process(state: &BridgeState, headers: &HeaderMap, body: &[u8]) -> Result<Value, BridgeError> {
    if !state.is_authorized(headers) {
        return Err(BridgeError::Unauthorized);
    }

    let request: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Object(Map::new())
    } else {
        serde_json::from_slice(body)
            .map_err(|e| BridgeError::validation("INVALID_JSON", format!("Invalid JSON body: {e}")))?
    };

    let payload = match request.get("payload") {
        Some(Value::Object(payload)) => payload.clone(),
        _ => Map::new(),
    };
    state
        .dispatcher
        .dispatch(request.get("command"), &payload)
        .await
}

#[cfg(test)]
mod tests {
    use std::fs;

    use reqwest::Client;

    use super::*;
    use crate::context::ContextSlicer;
    use crate::exec::Executor;
    use crate::host::DetachedHost;
    use crate::modules::{ModuleLoader, ENTRY_FILE};
    use crate::policy::Policy;

    struct TestServer {
        base: String,
        client: Client,
        _shutdown: tokio::sync::oneshot::Sender<()>,
    }

    impl TestServer {
        async fn post(&self, body: Value, token: Option<&str>) -> (StatusCode, Value) {
            let mut request = self.client.post(format!("{}/rpc", self.base)).json(&body);
            if let Some(token) = token {
                request = request.header(TOKEN_HEADER, token);
            }
            let response = request.send().await.unwrap();
            let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
            (status, response.json().await.unwrap())
        }
    }

    async fn start(token: Option<&str>, allowed_root: Option<std::path::PathBuf>) -> TestServer {
        let executor = Executor::new(
            Arc::new(Policy::default()),
            Arc::new(DetachedHost),
            Arc::new(ModuleLoader::new(allowed_root)),
        );
        let dispatcher = Dispatcher::new(executor, ContextSlicer::default(), true);
        let state = BridgeState::new(dispatcher, token.map(str::to_string));

        let listener = bind(0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(serve(listener, state, async move {
            let _ = rx.await;
        }));
        TestServer {
            base: format!("http://{addr}"),
            client: Client::new(),
            _shutdown: tx,
        }
    }

    // ── tokens_match tests ──────────────────────────────

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match(b"secret", b"secret"));
        assert!(!tokens_match(b"secret", b"secreT"));
        assert!(!tokens_match(b"secret", b"secret2"));
        assert!(!tokens_match(b"secret", b""));
    }

    // ── routing tests ───────────────────────────────────

    #[tokio::test]
    async fn test_listener_is_loopback() {
        let listener = bind(0).await.unwrap();
        assert!(listener.local_addr().unwrap().ip().is_loopback());
    }

    #[tokio::test]
    async fn test_health_and_not_found() {
        let server = start(Some("tok"), None).await;
        let health: Value = server
            .client
            .get(format!("{}/health", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health, json!({"ok": true, "pid": std::process::id()}));

        for response in [
            server.client.get(format!("{}/nope", server.base)).send().await.unwrap(),
            server.client.get(format!("{}/rpc", server.base)).send().await.unwrap(),
            server.client.post(format!("{}/health", server.base)).send().await.unwrap(),
        ] {
            assert_eq!(response.status().as_u16(), 404);
            let body: Value = response.json().await.unwrap();
            assert_eq!(body, json!({"ok": false, "error": "Not found"}));
        }
    }

    #[tokio::test]
    async fn test_invalid_json_and_empty_body() {
        let server = start(None, None).await;
        let response = server
            .client
            .post(format!("{}/rpc", server.base))
            .body("{not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["code"], "INVALID_JSON");

        let response = server
            .client
            .post(format!("{}/rpc", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["code"], "UNKNOWN_COMMAND");
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let server = start(None, None).await;
        let (status, body) = server.post(json!({"command": "PING"}), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["result"]["pid"], std::process::id());
    }

    // ── auth tests ──────────────────────────────────────

    #[tokio::test]
    async fn test_auth_gate_blocks_before_side_effects() {
        let server = start(Some("s3cret"), None).await;
        let tmp = tempfile::tempdir().unwrap();
        let marker = tmp.path().join("marker.txt");
        let code = format!("f = open({:?}, 'w')\nf.write('x')\nf.close()", marker.to_str().unwrap());
        let request = json!({"command": "exec", "payload": {"code": code, "mode": "trusted"}});

        for token in [None, Some("wrong"), Some("s3cre")] {
            let (status, body) = server.post(request.clone(), token).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body, json!({"ok": false, "error": "Unauthorized"}));
            assert!(!marker.exists());
        }

        let (status, _) = server.post(request, Some("s3cret")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fs::read_to_string(&marker).unwrap(), "x");
    }

    #[tokio::test]
    async fn test_unknown_command_needs_auth_first() {
        let server = start(Some("tok"), None).await;
        let (status, _) = server.post(json!({"command": "bogus"}), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, body) = server.post(json!({"command": "bogus"}), Some("tok")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "UNKNOWN_COMMAND");
    }

    // ── exec tests ──────────────────────────────────────

    #[tokio::test]
    async fn test_safe_exec_and_policy_denial() {
        let server = start(None, None).await;
        let (status, body) = server
            .post(json!({"command": "exec", "payload": {"code": "print(1+1)"}}), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["stdout"], "2\n");
        assert_eq!(body["result"]["mode"], "safe");

        let (status, body) = server
            .post(json!({"command": "exec", "payload": {"code": "from socket import socket"}}), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "POLICY_BLOCKED_IMPORT");
        assert_eq!(body["error"], "blocked module import in safe mode: socket");
    }

    #[tokio::test]
    async fn test_trust_does_not_carry_over() {
        let server = start(None, None).await;
        let import_os = |mode: Option<&str>| {
            let mut payload = json!({"code": "import os\nprint(os.getpid() > 0)"});
            if let Some(mode) = mode {
                payload["mode"] = json!(mode);
            }
            json!({"command": "exec", "payload": payload})
        };

        let (status, body) = server.post(import_os(Some("trusted")), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["stdout"], "True\n");

        for mode in [None, Some(""), Some("safe")] {
            let (status, body) = server.post(import_os(mode), None).await;
            assert_eq!(status, StatusCode::FORBIDDEN, "mode {mode:?}");
            assert_eq!(body["code"], "POLICY_BLOCKED_IMPORT");
        }
    }

    #[tokio::test]
    async fn test_runtime_error_is_500() {
        let server = start(None, None).await;
        let (status, body) = server
            .post(json!({"command": "exec", "payload": {"code": "print('partial')\nundefined_name"}}), None)
            .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "EXEC_RUNTIME_ERROR");
        assert!(body.get("stdout").is_none());
    }

    // ── validate_module tests ───────────────────────────

    #[tokio::test]
    async fn test_module_path_containment() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        for parent in [root.path(), outside.path()] {
            let dir = parent.join("plugin");
            fs::create_dir(&dir).unwrap();
            fs::write(dir.join(ENTRY_FILE), "READY = True\n").unwrap();
        }
        let server = start(None, Some(root.path().to_path_buf())).await;

        let request = |path: &std::path::Path| {
            json!({"command": "validate_module", "payload": {"modulePath": path.join("plugin").to_str().unwrap()}})
        };
        let (status, body) = server.post(request(outside.path()), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "MODULE_PATH_FORBIDDEN");

        let (status, body) = server.post(request(root.path()), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["module"], "plugin");

        let (status, body) = server
            .post(json!({"command": "validate_module", "payload": {}}), None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MODULE_PATH_REQUIRED");
    }
}
