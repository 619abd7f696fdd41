//! Local IPC socket (spec §6): a Unix-domain socket at
//! `{data_dir}/mcpproxy.sock` for trusted local clients, bypassing the
//! API-key check TCP connections require. Windows would use a named pipe
//! instead (`\\.\pipe\mcpproxy`); not implemented here since this workspace
//! only targets Unix-family hosts, matching the teacher's own
//! `UnixFrontend` (no Windows pipe counterpart exists there either).
//!
//! Serves [`crate::build_unix_router`], the same route table as the TCP
//! listener but without the `require_api_key` layer: reaching this socket
//! already requires filesystem access to the data dir, which is the same
//! trust boundary the API key otherwise stands in for.

use std::path::{Path, PathBuf};

use axum::Router;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Bind and serve `router` over a Unix-domain socket at `path`, removing a
/// stale socket file left behind by an unclean shutdown first. Runs until
/// `cancel` fires.
pub async fn serve_unix_socket(path: PathBuf, router: Router, cancel: CancellationToken) -> std::io::Result<()> {
    if Path::new(&path).exists() {
        std::fs::remove_file(&path)?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&path)?;
    info!(path = %path.display(), "local IPC socket listening");

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await;

    if let Err(e) = std::fs::remove_file(&path) {
        warn!(path = %path.display(), error = %e, "failed to remove socket file on shutdown");
    }
    result
}
