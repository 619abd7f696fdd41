//! Optional container isolation for stdio upstreams (spec §4.2).
//!
//! No crate in the retrieval pack wraps a stdio command in a container
//! runtime CLI, so this is written from the spec's description directly
//! (see DESIGN.md) rather than adapted from a teacher file; it reuses
//! `ratchet-execution`'s general idea of wrapping process spawning behind a
//! narrow config type, just with a `docker`/`podman` argv builder instead of
//! an in-process sandbox.

use std::collections::HashMap;
use std::path::PathBuf;

use mcpproxy_storage::model::IsolationConfig;

/// Base image selected from the command the user configured, unless
/// `IsolationConfig.image` overrides it.
fn default_image_for(command: &str) -> Option<&'static str> {
    match command {
        "uvx" | "uv" | "pip" | "pip3" | "python" | "python3" => Some("python:3.11-slim"),
        "npx" | "npm" | "node" => Some("node:20-slim"),
        _ => None,
    }
}

/// An existing `docker`/`podman` invocation in the user's own command
/// bypasses isolation outright — nesting container runtimes inside each
/// other is never what the user meant.
pub fn is_already_containerized(command: &str) -> bool {
    matches!(command, "docker" | "podman")
}

/// Resolved argv for the container runtime that will exec the user's
/// command, plus the cidfile path the caller must clean up on teardown.
pub struct ContainerLaunch {
    pub runtime: String,
    pub args: Vec<String>,
    pub cidfile: PathBuf,
}

/// Build the `docker run`/`podman run` argv for a stdio upstream with
/// isolation enabled. `cidfile_dir` is the directory the cidfile is written
/// under (typically the data dir's `containers/` subdirectory) so a crashed
/// parent process can still find and clean up the container on next start.
pub fn build_launch(
    config: &IsolationConfig,
    runtime_binary: &str,
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
    working_dir: Option<&str>,
    cidfile_dir: &std::path::Path,
    server_key: &str,
) -> ContainerLaunch {
    let image = config
        .image
        .clone()
        .or_else(|| default_image_for(command).map(str::to_string))
        .unwrap_or_else(|| "python:3.11-slim".to_string());

    let cidfile = cidfile_dir.join(format!("{server_key}.cid"));

    let mut argv = vec!["run".to_string(), "--rm".to_string(), "-i".to_string()];
    argv.push("--cidfile".to_string());
    argv.push(cidfile.display().to_string());

    if let Some(network_mode) = &config.network_mode {
        argv.push("--network".to_string());
        argv.push(network_mode.clone());
    }
    for (k, v) in env {
        argv.push("-e".to_string());
        argv.push(format!("{k}={v}"));
    }
    if let Some(dir) = working_dir.or(config.working_dir.as_deref()) {
        argv.push("-w".to_string());
        argv.push(dir.to_string());
    }
    for extra in &config.extra_args {
        argv.push(extra.clone());
    }

    argv.push(image);
    argv.push(command.to_string());
    argv.extend(args.iter().cloned());

    ContainerLaunch {
        runtime: runtime_binary.to_string(),
        args: argv,
        cidfile,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uvx_selects_python_image() {
        assert_eq!(default_image_for("uvx"), Some("python:3.11-slim"));
    }

    #[test]
    fn npx_selects_node_image() {
        assert_eq!(default_image_for("npx"), Some("node:20-slim"));
    }

    #[test]
    fn docker_command_bypasses_isolation() {
        assert!(is_already_containerized("docker"));
        assert!(!is_already_containerized("uvx"));
    }

    #[test]
    fn explicit_image_overrides_the_command_table() {
        let config = IsolationConfig {
            enabled: true,
            image: Some("custom:latest".to_string()),
            ..Default::default()
        };
        let launch = build_launch(
            &config,
            "docker",
            "uvx",
            &["mcp-server-fetch".to_string()],
            &HashMap::new(),
            None,
            std::path::Path::new("/tmp"),
            "fetch_aabbccdd",
        );
        assert!(launch.args.contains(&"custom:latest".to_string()));
        assert!(!launch.args.contains(&"python:3.11-slim".to_string()));
    }

    #[test]
    fn env_vars_forwarded_as_dash_e_flags() {
        let mut env = HashMap::new();
        env.insert("API_KEY".to_string(), "secret".to_string());
        let launch = build_launch(
            &IsolationConfig::default(),
            "docker",
            "uvx",
            &[],
            &env,
            None,
            std::path::Path::new("/tmp"),
            "s_aabbccdd",
        );
        assert!(launch.args.iter().any(|a| a == "API_KEY=secret"));
    }

    #[test]
    fn cidfile_is_keyed_by_server_key() {
        let launch = build_launch(
            &IsolationConfig::default(),
            "docker",
            "uvx",
            &[],
            &HashMap::new(),
            None,
            std::path::Path::new("/data/containers"),
            "s_aabbccdd",
        );
        assert_eq!(launch.cidfile, PathBuf::from("/data/containers/s_aabbccdd.cid"));
    }
}
