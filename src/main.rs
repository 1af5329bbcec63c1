mod bridge;
mod canonical;
mod config;
mod context;
mod engine;
mod exec;
mod host;
mod modules;
mod policy;
mod worker;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::bridge::server::{self, BridgeState};
use crate::bridge::Dispatcher;
use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::context::ContextSlicer;
use crate::exec::{Executor, Isolation};
use crate::host::{DetachedHost, HostApplication, StaticHost};
use crate::modules::ModuleLoader;
use crate::policy::Policy;
use crate::worker::{WorkerCommand, WORKER_FLAG};

fn print_help() {
    println!(
        "\
host-bridge v{}

Loopback RPC bridge for policy-gated script execution inside a host application.

USAGE:
    host-bridge [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: {DEFAULT_CONFIG_PATH}]
                   (optional; built-in defaults apply when absent)

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG                      Log level filter for tracing
                                  (e.g. debug, host_bridge=debug,warn)
    BRIDGE_PORT                   Loopback port; missing or <= 0 disables the bridge
    BRIDGE_TOKEN                  Shared secret required in the x-bridge-token header
    BRIDGE_ALLOWED_MODULE_ROOT    Directory validate_module paths must stay inside

EXAMPLES:
    BRIDGE_PORT=8765 host-bridge                # defaults, port from env
    host-bridge /etc/host-bridge/bridge.toml    # custom config path
    RUST_LOG=debug host-bridge                  # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

fn main() -> Result<()> {
    // Worker mode: stdout carries the report, so logs go to stderr
    let mut args = std::env::args().skip(1);
    if args.next().as_deref() == Some(WORKER_FLAG) {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_writer(std::io::stderr)
            .init();
        return worker::worker_main(args.next().as_deref());
    }

    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("host-bridge v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("host_bridge=info")),
        )
        .init();

    let config_path = std::env::args().skip(1).find(|arg| !arg.starts_with('-'));
    info!(
        "Loading configuration from {}",
        config_path.as_deref().unwrap_or(DEFAULT_CONFIG_PATH)
    );
    let config = Config::load(config_path.as_deref())?;

    let Some(port) = config.server.listen_port() else {
        info!("Bridge disabled: no valid port configured (set [server] port or BRIDGE_PORT)");
        return Ok(());
    };

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Cannot start the async runtime")?
        .block_on(run(config, port))
}

async fn run(config: Config, port: u16) -> Result<()> {
    let policy = Arc::new(Policy::from_config(&config.policy));
    info!(
        "Safe mode blocks {} module prefixes and {} builtins",
        policy.blocked_modules().len(),
        policy.blocked_builtins().len()
    );

    let host: Arc<dyn HostApplication> = if config.host.is_configured() {
        let host = StaticHost::from_config(&config.host);
        info!(
            "Host: {} {}",
            host.name.as_deref().unwrap_or("(unnamed)"),
            host.version.as_deref().unwrap_or("(unknown version)")
        );
        Arc::new(host)
    } else {
        info!("Host: detached");
        Arc::new(DetachedHost)
    };

    let loader = Arc::new(ModuleLoader::new(config.modules.allowed_root.clone()));
    match loader.allowed_root() {
        Some(root) => info!("Module root: {}", root.display()),
        None => warn!("No allowed module root configured; validate_module accepts any path"),
    }

    let slicer = config
        .context
        .drop_order
        .clone()
        .map(ContextSlicer::new)
        .unwrap_or_default();
    info!("Context drop order: {}", slicer.drop_order().join(", "));

    let isolation = if config.exec.isolate {
        let command = WorkerCommand::current_exe(config.exec.worker_memory_mb)
            .context("Cannot locate the bridge executable for execution workers")?;
        info!(
            "Jobs run in worker processes (memory cap: {})",
            match config.exec.worker_memory_mb {
                0 => "none".to_string(),
                mb => format!("{mb} MiB"),
            }
        );
        Isolation::Subprocess(command)
    } else {
        warn!("Jobs run inside the bridge process; a crashing script stops the bridge");
        Isolation::InProcess
    };
    let executor = Executor::new(policy, host, loader).with_isolation(isolation);
    let dispatcher = Dispatcher::new(executor, slicer, config.exec.serialize);
    if config.exec.serialize {
        info!("Execution commands are serialized");
    }

    let token = config.server.token().map(str::to_string);
    if token.is_none() {
        warn!("No token configured; authentication is disabled");
    }
    let state = BridgeState::new(dispatcher, token);

    let listener = server::bind(port)
        .await
        .with_context(|| format!("Cannot bind 127.0.0.1:{port}"))?;
    info!("Bridge ready on port {port} (pid {})", std::process::id());

    server::serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received, exiting");
    })
    .await
}
