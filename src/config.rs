use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

// ---------------------------------------------------------------------------
// Server (one backend instance)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:3178`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Root directory under which this backend's repository working copies
    /// live.  Repository IDs resolve to subdirectories of this path.
    pub repos_root: String,
    /// Name (or absolute path) of the git binary to invoke.
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
}

fn default_listen() -> String {
    "0.0.0.0:3178".to_string()
}

fn default_git_binary() -> String {
    "git".to_string()
}

// ---------------------------------------------------------------------------
// Client (broadcast fan-out)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Base URLs of every backend in the fleet (e.g. `http://git-1:3178`).
    /// Membership is externally configured; this subsystem never mutates it.
    #[serde(default)]
    pub backends: Vec<String>,
    /// Deadline in seconds for a whole broadcast call.  Exceeding it is a
    /// fatal error for that call.
    #[serde(default = "default_broadcast_timeout_secs")]
    pub broadcast_timeout_secs: u64,
}

fn default_broadcast_timeout_secs() -> u64 {
    60
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            broadcast_timeout_secs: default_broadcast_timeout_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.server.repos_root.is_empty(),
        "repos_root must not be empty"
    );
    anyhow::ensure!(
        !config.server.git_binary.is_empty(),
        "git_binary must not be empty"
    );
    anyhow::ensure!(
        config.client.broadcast_timeout_secs > 0,
        "broadcast_timeout_secs must be greater than zero"
    );
    for backend in &config.client.backends {
        anyhow::ensure!(
            backend.starts_with("http://") || backend.starts_with("https://"),
            "backend address must be an http(s) base URL: {backend}"
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(yaml)?;
        validate_config(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let config = parse("server:\n  repos_root: /srv/repos\n").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:3178");
        assert_eq!(config.server.git_binary, "git");
        assert!(config.client.backends.is_empty());
        assert_eq!(config.client.broadcast_timeout_secs, 60);
    }

    #[test]
    fn full_config_parses() {
        let yaml = "\
server:
  listen: 127.0.0.1:4000
  repos_root: /data/repos
  git_binary: /usr/local/bin/git
client:
  backends:
    - http://git-1:3178
    - http://git-2:3178
  broadcast_timeout_secs: 15
";
        let config = parse(yaml).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:4000");
        assert_eq!(config.client.backends.len(), 2);
        assert_eq!(config.client.broadcast_timeout_secs, 15);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let yaml = "\
server:
  repos_root: /srv/repos
client:
  broadcast_timeout_secs: 0
";
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn non_http_backend_is_rejected() {
        let yaml = "\
server:
  repos_root: /srv/repos
client:
  backends:
    - git-1:3178
";
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn load_config_missing_file_errors() {
        assert!(load_config("/nonexistent/gitexec-config.yaml").is_err());
    }
}
