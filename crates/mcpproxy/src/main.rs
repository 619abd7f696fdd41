//! mcpproxy entry point: loads config, brings up the `Runtime`, and serves
//! the HTTP/MCP frontage over TCP and (optionally) a local Unix socket.
//!
//! Command-line parsing here is deliberately thin — rich CLI subcommands
//! (inspect, export, tray control) are an external collaborator per the
//! spec's scope and aren't built in this crate; this binary only knows how
//! to start and gracefully stop the proxy. Grounded on the teacher's
//! `turbomcp-proxy` main-then-exit-code shape (`cli::error::display_error`
//! returning a process exit code) but mapped onto this system's own
//! exit-code taxonomy (spec §6) instead of a single generic failure code.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use mcpproxy_core::{McpProxyError, Runtime};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mcpproxy", version, about = "Local MCP upstream aggregator and tool router")]
struct Cli {
    /// Path to the JSON config file; created with defaults if absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured listen address (host:port).
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

/// Exit codes (spec §6): 0 success, 1 general, 2 listen-address conflict,
/// 3 data-store locked, 4 config error, 5 permission error.
const EXIT_OK: i32 = 0;
const EXIT_GENERAL: i32 = 1;
const EXIT_LISTEN_CONFLICT: i32 = 2;
const EXIT_STORE_LOCKED: i32 = 3;
const EXIT_CONFIG_ERROR: i32 = 4;
const EXIT_PERMISSION: i32 = 5;

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    let code = runtime.block_on(run(cli));
    std::process::ExitCode::from(code as u8)
}

async fn run(cli: Cli) -> i32 {
    let config_path = cli
        .config
        .unwrap_or_else(default_config_path);

    let _file_guard = init_tracing(&config_path);

    let mcp_runtime = match Runtime::bootstrap(config_path).await {
        Ok(runtime) => runtime,
        Err(e) => return exit_code_for_bootstrap_error(&e),
    };

    if let Err(e) = mcp_runtime.start().await {
        error!(error = %e, "failed to start runtime");
        return EXIT_GENERAL;
    }

    let mut listen_addr = match mcp_runtime.config().listen_addr.parse::<SocketAddr>() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "invalid listen address");
            return EXIT_CONFIG_ERROR;
        }
    };
    if let Some(override_addr) = cli.listen {
        listen_addr = override_addr;
    }

    let app_state = mcpproxy_http::state::AppState::new(mcp_runtime.clone());
    let router = mcpproxy_http::build_router(app_state);

    let listener = match tokio::net::TcpListener::bind(listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            return match e.kind() {
                std::io::ErrorKind::AddrInUse => {
                    error!(addr = %listen_addr, "listen-conflict");
                    EXIT_LISTEN_CONFLICT
                }
                std::io::ErrorKind::PermissionDenied => {
                    error!(addr = %listen_addr, "permission denied binding listen address");
                    EXIT_PERMISSION
                }
                _ => {
                    error!(error = %e, "failed to bind listen address");
                    EXIT_GENERAL
                }
            };
        }
    };
    info!(addr = %listen_addr, "listening");

    let cancel = CancellationToken::new();

    let socket_handle = if mcp_runtime.config().enable_socket {
        let socket_path = mcp_runtime.config().socket_path();
        let socket_router = mcpproxy_http::build_unix_router(mcpproxy_http::state::AppState::new(mcp_runtime.clone()));
        let socket_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = mcpproxy_http::socket::serve_unix_socket(socket_path, socket_router, socket_cancel).await {
                error!(error = %e, "local IPC socket server exited with an error");
            }
        }))
    } else {
        None
    };

    let tcp_cancel = cancel.clone();
    let serve_result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tcp_cancel.cancel();
        })
        .await;

    if let Some(handle) = socket_handle {
        let _ = handle.await;
    }
    if let Err(e) = serve_result {
        error!(error = %e, "HTTP server exited with an error");
        return EXIT_GENERAL;
    }

    mcp_runtime.shutdown().await;
    EXIT_OK
}

fn exit_code_for_bootstrap_error(error: &McpProxyError) -> i32 {
    error!(error = %error, "failed to start mcpproxy");
    match error {
        McpProxyError::Config(_) => EXIT_CONFIG_ERROR,
        McpProxyError::Storage(inner) if inner.to_string().to_lowercase().contains("lock") => EXIT_STORE_LOCKED,
        McpProxyError::Storage(_) => EXIT_GENERAL,
        _ => EXIT_GENERAL,
    }
}

fn default_config_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mcpproxy")
        .join("config.json")
}

/// `tracing-subscriber` wired to the teacher's layering: an env-filterable
/// pretty layer on stdout for interactive use, plus a daily-rolling
/// `main.log` under the data dir's logs directory (spec §6). The returned
/// guard must stay alive for the process lifetime or the file writer drops
/// buffered lines on exit.
fn init_tracing(config_path: &std::path::Path) -> tracing_appender::non_blocking::WorkerGuard {
    let logs_dir = peek_logs_dir(config_path);
    let _ = std::fs::create_dir_all(&logs_dir);
    let file_appender = tracing_appender::rolling::daily(logs_dir, "main.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().with_writer(non_blocking).with_ansi(false).json())
        .init();

    guard
}

/// Best-effort peek at `data_dir` from an existing config file so logging
/// can start before `Runtime::bootstrap` fully validates it; falls back to
/// the same default `Runtime::bootstrap` would use.
fn peek_logs_dir(config_path: &std::path::Path) -> PathBuf {
    let default_data_dir = config_path
        .parent()
        .map(|p| p.join("data"))
        .unwrap_or_else(|| PathBuf::from("data"));

    let data_dir = std::fs::read_to_string(config_path)
        .ok()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
        .and_then(|v| v.get("data_dir").and_then(|d| d.as_str()).map(PathBuf::from))
        .unwrap_or(default_data_dir);

    data_dir.join("logs")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
