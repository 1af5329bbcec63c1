//! End-to-end checks for out-of-process execution.
//!
//! Starts the real `host-bridge` binary with worker isolation on (the
//! default) and submits scripts that kill or exhaust their interpreter.
//! The request must fail with a structured error and the bridge must keep
//! serving afterwards.

#![cfg(unix)]

use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use serde_json::{json, Value};

/// Kills the bridge when the test ends, pass or fail.
struct Bridge {
    child: Child,
    base: String,
    client: reqwest::Client,
    _cwd: tempfile::TempDir,
}

impl Drop for Bridge {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Bridge {
    async fn start() -> Bridge {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        // An empty working directory keeps config/bridge.toml out of play.
        let cwd = tempfile::tempdir().unwrap();
        let child = Command::new(env!("CARGO_BIN_EXE_host-bridge"))
            .current_dir(cwd.path())
            .env("BRIDGE_PORT", port.to_string())
            .env_remove("BRIDGE_TOKEN")
            .env_remove("BRIDGE_ALLOWED_MODULE_ROOT")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn host-bridge");

        let bridge = Bridge {
            child,
            base: format!("http://127.0.0.1:{port}"),
            client: reqwest::Client::new(),
            _cwd: cwd,
        };
        for _ in 0..100 {
            if bridge.healthy().await {
                return bridge;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("bridge did not come up on port {port}");
    }

    async fn healthy(&self) -> bool {
        match self.client.get(format!("{}/health", self.base)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn exec(&self, code: &str, mode: &str) -> (u16, Value) {
        let response = self
            .client
            .post(format!("{}/rpc", self.base))
            .json(&json!({"command": "exec", "payload": {"code": code, "mode": mode}}))
            .timeout(Duration::from_secs(120))
            .send()
            .await
            .unwrap();
        let status = response.status().as_u16();
        (status, response.json().await.unwrap())
    }
}

#[tokio::test]
async fn test_huge_format_width_is_contained() {
    let bridge = Bridge::start().await;

    let (status, body) = bridge.exec("print('{:999999999999}'.format(1))", "safe").await;
    assert_eq!(status, 500, "{body}");
    assert_eq!(body["ok"], false);
    let code = body["code"].as_str().unwrap();
    assert!(
        code == "EXEC_RUNTIME_ERROR" || code == "EXEC_WORKER_FAILED",
        "{body}"
    );

    assert!(bridge.healthy().await);
    let (status, body) = bridge.exec("print(1+1)", "safe").await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["stdout"], "2\n");
}

#[tokio::test]
async fn test_killed_worker_reported() {
    let bridge = Bridge::start().await;

    let (status, body) = bridge
        .exec("import os\nprint('before')\nos.kill(os.getpid(), 9)", "trusted")
        .await;
    assert_eq!(status, 500, "{body}");
    assert_eq!(body["code"], "EXEC_WORKER_FAILED");
    assert!(body["error"].as_str().unwrap().contains("signal"), "{body}");

    assert!(bridge.healthy().await);
    let (status, body) = bridge.exec("print(1+1)", "trusted").await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["stdout"], "2\n");
}

#[tokio::test]
async fn test_script_runs_in_separate_process() {
    let bridge = Bridge::start().await;
    let bridge_pid = bridge.child.id();

    let (status, body) = bridge
        .exec("import os\nprint(os.getpid())", "trusted")
        .await;
    assert_eq!(status, 200, "{body}");
    let worker_pid: u32 = body["result"]["stdout"].as_str().unwrap().trim().parse().unwrap();
    assert_ne!(worker_pid, bridge_pid);
}
