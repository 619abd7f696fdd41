//! Per-upstream rotating log sink (spec §4.2): every request, response,
//! state transition, and subprocess stderr line for one upstream goes to its
//! own `server-{name}.log`, independent of the process-wide `main.log`
//! `tracing_subscriber` pipeline the `mcpproxy` binary sets up. Grounded on
//! `turbomcp-server::logging`'s `tracing-appender` + `WorkerGuard` pattern,
//! adapted from "one subscriber for the whole process" to "one appender per
//! upstream, written to directly" since per-server files aren't something a
//! single global subscriber naturally expresses.

use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// One structured line written to a server's log file.
#[derive(Debug, Serialize)]
pub struct LogLine<'a> {
    pub timestamp: chrono::DateTime<Utc>,
    pub kind: &'a str,
    pub request_id: Option<&'a str>,
    pub duration_ms: Option<u64>,
    pub status: Option<&'a str>,
    pub message: &'a str,
}

/// A rotating file sink for one upstream's structured log lines.
pub struct LogSink {
    writer: Mutex<tracing_appender::non_blocking::NonBlocking>,
    _guard: WorkerGuard,
}

impl LogSink {
    /// Open (or create) `{logs_dir}/server-{name}.log`, rotating daily.
    pub fn open(logs_dir: &Path, server_name: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(logs_dir)?;
        let appender = RollingFileAppender::new(Rotation::DAILY, logs_dir, format!("server-{server_name}.log"));
        let (writer, guard) = tracing_appender::non_blocking(appender);
        Ok(Self {
            writer: Mutex::new(writer),
            _guard: guard,
        })
    }

    pub async fn log(&self, line: LogLine<'_>) {
        let payload = json!({
            "timestamp": line.timestamp,
            "kind": line.kind,
            "request_id": line.request_id,
            "duration_ms": line.duration_ms,
            "status": line.status,
            "message": line.message,
        });
        let mut bytes = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(_) => return,
        };
        bytes.push(b'\n');
        let mut writer = self.writer.lock().await;
        let _ = writer.write_all(&bytes).await;
    }

    pub async fn state_transition(&self, from: &str, to: &str) {
        self.log(LogLine {
            timestamp: Utc::now(),
            kind: "state_transition",
            request_id: None,
            duration_ms: None,
            status: None,
            message: &format!("{from} -> {to}"),
        })
        .await;
    }

    pub async fn request(&self, request_id: &str, method: &str) {
        self.log(LogLine {
            timestamp: Utc::now(),
            kind: "request",
            request_id: Some(request_id),
            duration_ms: None,
            status: None,
            message: method,
        })
        .await;
    }

    pub async fn response(&self, request_id: &str, duration_ms: u64, status: &str) {
        self.log(LogLine {
            timestamp: Utc::now(),
            kind: "response",
            request_id: Some(request_id),
            duration_ms: Some(duration_ms),
            status: Some(status),
            message: "",
        })
        .await;
    }

    pub async fn stderr_line(&self, line: &str) {
        self.log(LogLine {
            timestamp: Utc::now(),
            kind: "stderr",
            request_id: None,
            duration_ms: None,
            status: None,
            message: line,
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_and_writes_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let sink = LogSink::open(dir.path(), "test-server").unwrap();
        sink.request("req-1", "tools/list").await;
        sink.response("req-1", 12, "ok").await;
        sink.state_transition("connecting", "ready").await;
    }
}
