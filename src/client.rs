//! Caller-side API: broadcast client and the `Command` facade.
//!
//! A repository lives on exactly one backend in the fleet, but callers do
//! not know which.  A broadcast call therefore sends one logical request to
//! every backend concurrently and keeps the single reply whose
//! [`BroadcastReply`] predicate holds; replies from backends that do not
//! hold the repository are disregarded.  Retry policy, if any, belongs to
//! the caller; this layer never retries.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::config::ClientConfig;
use crate::protocol::{BroadcastReply, ExecReply, ExecRequest, RemoteOpts};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Caller-visible failure modes, kept distinct so callers can tell a
/// transport problem from an in-process git failure from "not found".
#[derive(Debug, Error)]
pub enum ClientError {
    /// Every reachable backend reported `repo_exists = false`.
    #[error("repository {repo:?} not found on any backend")]
    RepoNotFound { repo: String },
    /// No backend produced a usable reply at all.
    #[error("all {count} backends failed: {detail}")]
    AllBackendsFailed { count: usize, detail: String },
    /// The owning backend executed the request but reported an error (git
    /// could not be started, or credential setup failed).
    #[error("remote git execution failed: {0}")]
    Remote(String),
    /// The whole broadcast call exceeded its deadline.  The subprocess may
    /// still be running on the backend; there is no mid-flight cancellation.
    #[error("broadcast call timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Broadcast client
// ---------------------------------------------------------------------------

/// Scatter-gather RPC client over the configured backend set.
#[derive(Clone)]
pub struct BroadcastClient {
    backends: Arc<Vec<String>>,
    http: reqwest::Client,
    timeout: Duration,
}

impl BroadcastClient {
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_backends(
            config.backends.clone(),
            Duration::from_secs(config.broadcast_timeout_secs),
        )
    }

    pub fn with_backends(backends: Vec<String>, timeout: Duration) -> Self {
        Self {
            backends: Arc::new(backends),
            http: reqwest::Client::new(),
            timeout,
        }
    }

    /// POST `request` to `path` on every backend concurrently, wait for all
    /// replies (or the deadline), and select the authoritative one.
    ///
    /// Selection rule: the first reply in configured backend order whose
    /// `repo_exists` predicate holds wins.  More than one claiming backend
    /// indicates sharding drift; the first is still used deterministically
    /// and the inconsistency is logged.  Transport errors from individual
    /// backends are tolerated as long as some backend may still hold the
    /// answer.
    #[instrument(skip(self, request), fields(%path, %repo, backends = self.backends.len()))]
    pub async fn broadcast<Req, Reply>(
        &self,
        path: &str,
        request: &Req,
        repo: &str,
    ) -> Result<Reply, ClientError>
    where
        Req: Serialize,
        Reply: DeserializeOwned + BroadcastReply + Send + 'static,
    {
        if self.backends.is_empty() {
            return Err(ClientError::AllBackendsFailed {
                count: 0,
                detail: "no backends configured".to_string(),
            });
        }

        // Serialize once; each per-backend task gets a cheap clone.
        let body = serde_json::to_value(request)?;

        let mut tasks: JoinSet<(usize, Result<Reply, String>)> = JoinSet::new();
        for (index, backend) in self.backends.iter().enumerate() {
            let url = format!("{}{}", backend.trim_end_matches('/'), path);
            let http = self.http.clone();
            let body = body.clone();
            tasks.spawn(async move {
                let outcome = match http.post(&url).json(&body).send().await {
                    Ok(resp) if resp.status().is_success() => match resp.json::<Reply>().await {
                        Ok(reply) => Ok(reply),
                        Err(e) => Err(format!("{url}: invalid reply: {e}")),
                    },
                    Ok(resp) => Err(format!("{url}: HTTP {}", resp.status())),
                    Err(e) => Err(format!("{url}: {e}")),
                };
                (index, outcome)
            });
        }

        let gather = async {
            let mut results = Vec::with_capacity(self.backends.len());
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(result) => results.push(result),
                    Err(e) => warn!(error = %e, "broadcast task panicked"),
                }
            }
            results
        };

        let results = tokio::time::timeout(self.timeout, gather)
            .await
            .map_err(|_| ClientError::Timeout(self.timeout))?;

        let mut existing: Vec<(usize, Reply)> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        for (index, outcome) in results {
            match outcome {
                Ok(reply) if reply.repo_exists() => existing.push((index, reply)),
                Ok(_) => debug!(backend = index, "backend does not hold the repository"),
                Err(detail) => {
                    warn!(backend = index, %detail, "backend failed during broadcast");
                    errors.push(detail);
                }
            }
        }

        if existing.is_empty() {
            if errors.len() == self.backends.len() {
                return Err(ClientError::AllBackendsFailed {
                    count: errors.len(),
                    detail: errors.join("; "),
                });
            }
            return Err(ClientError::RepoNotFound {
                repo: repo.to_string(),
            });
        }

        existing.sort_by_key(|(index, _)| *index);
        if existing.len() > 1 {
            // Sharding drift: the repository should live on exactly one
            // backend.  Not a per-call failure; surface it for operators.
            let claimants: Vec<usize> = existing.iter().map(|(index, _)| *index).collect();
            warn!(
                %repo,
                ?claimants,
                "multiple backends claim the repository; using the first in backend order"
            );
        }

        Ok(existing.remove(0).1)
    }
}

// ---------------------------------------------------------------------------
// Command facade
// ---------------------------------------------------------------------------

/// A constructed git command addressed at whichever backend holds `repo`.
///
/// Re-execution is allowed but re-sends the full request; `exit_status` is
/// recorded after each call returns.
#[derive(Debug, Clone)]
pub struct Command {
    /// Full argument vector, including the leading `git` token.
    pub args: Vec<String>,
    /// Repository ID resolved on the owning backend.
    pub repo: String,
    /// Optional per-call remote credentials.
    pub opt: Option<RemoteOpts>,
    /// Bytes fed to the subprocess on stdin.
    pub input: Vec<u8>,
    /// Exit status of the remote process, populated after execution.
    pub exit_status: i32,
}

impl Command {
    /// Construct a git command.
    ///
    /// # Panics
    ///
    /// Panics unless `name` is exactly `"git"`.  Any other value is misuse
    /// of this abstraction by the programmer, not a runtime condition a
    /// caller could handle.
    pub fn new<I, S>(name: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        assert!(name == "git", "command name must be \"git\", got {name:?}");
        let mut full = vec!["git".to_string()];
        full.extend(args.into_iter().map(Into::into));
        Self {
            args: full,
            repo: String::new(),
            opt: None,
            input: Vec::new(),
            exit_status: 0,
        }
    }

    /// Perform the full broadcast round-trip and return `(stdout, stderr)`.
    ///
    /// A non-empty `error` in the reply surfaces as [`ClientError::Remote`],
    /// distinct from any transport error.  The exit status is recorded on
    /// `self` before the error check, so it is available either way.
    pub async fn divided_output(
        &mut self,
        client: &BroadcastClient,
    ) -> Result<(Vec<u8>, Vec<u8>), ClientError> {
        let request = ExecRequest {
            repo: self.repo.clone(),
            args: self.args[1..].to_vec(),
            opt: self.opt.clone(),
            stdin: self.input.clone(),
        };

        let reply: ExecReply = client.broadcast("/api/exec", &request, &self.repo).await?;
        self.exit_status = reply.exit_status;

        if !reply.error.is_empty() {
            return Err(ClientError::Remote(reply.error));
        }
        Ok((reply.stdout, reply.stderr))
    }

    /// Execute and discard all output.
    pub async fn run(&mut self, client: &BroadcastClient) -> Result<(), ClientError> {
        self.divided_output(client).await.map(|_| ())
    }

    /// Execute and return stdout, discarding stderr.
    pub async fn output(&mut self, client: &BroadcastClient) -> Result<Vec<u8>, ClientError> {
        self.divided_output(client).await.map(|(stdout, _)| stdout)
    }

    /// Execute and return stdout followed by stderr, concatenated.
    pub async fn combined_output(
        &mut self,
        client: &BroadcastClient,
    ) -> Result<Vec<u8>, ClientError> {
        let (mut stdout, stderr) = self.divided_output(client).await?;
        stdout.extend_from_slice(&stderr);
        Ok(stdout)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::*;
    use crate::config::ServerConfig;
    use crate::metrics::MetricsRegistry;
    use crate::server::{create_router, AppState};

    /// Write an executable stub standing in for the git binary.
    fn write_stub(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-git");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    /// One in-process backend: repos root, stub git, real axum listener.
    struct Backend {
        base_url: String,
        repos: tempfile::TempDir,
        _stubs: tempfile::TempDir,
    }

    impl Backend {
        async fn spawn(stub_body: &str) -> Self {
            let repos = tempfile::tempdir().unwrap();
            let stubs = tempfile::tempdir().unwrap();
            let stub = write_stub(stubs.path(), stub_body);

            let state = Arc::new(AppState {
                config: Arc::new(ServerConfig {
                    listen: "127.0.0.1:0".to_string(),
                    repos_root: repos.path().to_str().unwrap().to_string(),
                    git_binary: stub.to_str().unwrap().to_string(),
                }),
                metrics: MetricsRegistry::new(),
            });

            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, create_router(state)).await.unwrap();
            });

            Self {
                base_url: format!("http://{addr}"),
                repos,
                _stubs: stubs,
            }
        }

        fn add_repo(&self, repo: &str) {
            std::fs::create_dir_all(self.repos.path().join(repo)).unwrap();
        }
    }

    fn client_for(backends: &[&Backend]) -> BroadcastClient {
        BroadcastClient::with_backends(
            backends.iter().map(|b| b.base_url.clone()).collect(),
            Duration::from_secs(10),
        )
    }

    #[test]
    #[should_panic(expected = "command name must be \"git\"")]
    fn non_git_binary_name_is_a_contract_violation() {
        let _ = Command::new("hg", ["log"]);
    }

    #[tokio::test]
    async fn broadcast_selects_the_owning_backend() {
        let a = Backend::spawn("printf '%s' shard-a").await;
        let b = Backend::spawn("printf '%s' shard-b").await;
        let c = Backend::spawn("printf '%s' shard-c").await;
        b.add_repo("org/repo");

        let client = client_for(&[&a, &b, &c]);
        let mut cmd = Command::new("git", ["rev-parse", "HEAD"]);
        cmd.repo = "org/repo".to_string();

        let stdout = cmd.output(&client).await.unwrap();
        assert_eq!(stdout, b"shard-b");
        assert_eq!(cmd.exit_status, 0);
    }

    #[tokio::test]
    async fn not_found_when_no_backend_holds_the_repo() {
        let a = Backend::spawn("printf '%s' shard-a").await;
        let b = Backend::spawn("printf '%s' shard-b").await;

        let client = client_for(&[&a, &b]);
        let mut cmd = Command::new("git", ["status"]);
        cmd.repo = "org/missing".to_string();

        match cmd.run(&client).await {
            Err(ClientError::RepoNotFound { repo }) => assert_eq!(repo, "org/missing"),
            other => panic!("expected RepoNotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_backends_are_tolerated() {
        let live = Backend::spawn("printf '%s' live").await;
        live.add_repo("org/repo");

        let client = BroadcastClient::with_backends(
            vec!["http://127.0.0.1:1".to_string(), live.base_url.clone()],
            Duration::from_secs(10),
        );
        let mut cmd = Command::new("git", ["log"]);
        cmd.repo = "org/repo".to_string();

        let stdout = cmd.output(&client).await.unwrap();
        assert_eq!(stdout, b"live");
    }

    #[tokio::test]
    async fn total_transport_failure_is_distinct_from_not_found() {
        let client = BroadcastClient::with_backends(
            vec![
                "http://127.0.0.1:1".to_string(),
                "http://127.0.0.1:2".to_string(),
            ],
            Duration::from_secs(10),
        );
        let mut cmd = Command::new("git", ["log"]);
        cmd.repo = "org/repo".to_string();

        match cmd.run(&client).await {
            Err(ClientError::AllBackendsFailed { count, .. }) => assert_eq!(count, 2),
            other => panic!("expected AllBackendsFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_backend_set_fails_immediately() {
        let client = BroadcastClient::with_backends(vec![], Duration::from_secs(10));
        let mut cmd = Command::new("git", ["log"]);
        cmd.repo = "org/repo".to_string();
        assert!(matches!(
            cmd.run(&client).await,
            Err(ClientError::AllBackendsFailed { count: 0, .. })
        ));
    }

    #[tokio::test]
    async fn multiple_claimants_resolve_to_first_in_backend_order() {
        let a = Backend::spawn("printf '%s' first").await;
        let b = Backend::spawn("printf '%s' second").await;
        a.add_repo("org/repo");
        b.add_repo("org/repo");

        let client = client_for(&[&a, &b]);
        let mut cmd = Command::new("git", ["log"]);
        cmd.repo = "org/repo".to_string();

        let stdout = cmd.output(&client).await.unwrap();
        assert_eq!(stdout, b"first");
    }

    #[tokio::test]
    async fn combined_output_is_stdout_then_stderr() {
        let backend = Backend::spawn("printf '%s' out; printf '%s' err >&2").await;
        backend.add_repo("org/repo");
        let client = client_for(&[&backend]);

        let mut cmd = Command::new("git", ["log"]);
        cmd.repo = "org/repo".to_string();
        let combined = cmd.combined_output(&client).await.unwrap();
        assert_eq!(combined, b"outerr");

        let mut cmd = Command::new("git", ["log"]);
        cmd.repo = "org/repo".to_string();
        let stdout = cmd.output(&client).await.unwrap();
        assert_eq!(stdout, b"out");
    }

    #[tokio::test]
    async fn exit_status_is_recorded_on_the_command() {
        let backend = Backend::spawn("exit 128").await;
        backend.add_repo("org/repo");
        let client = client_for(&[&backend]);

        let mut cmd = Command::new("git", ["rev-parse", "bad-ref"]);
        cmd.repo = "org/repo".to_string();
        let (stdout, stderr) = cmd.divided_output(&client).await.unwrap();
        assert_eq!(cmd.exit_status, 128);
        assert!(stdout.is_empty());
        assert!(stderr.is_empty());
    }

    #[tokio::test]
    async fn remote_start_failure_surfaces_as_remote_error() {
        // A backend whose git binary does not exist: the reply carries an
        // error message and the sentinel exit status.
        let repos = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(repos.path().join("org/repo")).unwrap();
        let state = Arc::new(AppState {
            config: Arc::new(ServerConfig {
                listen: "127.0.0.1:0".to_string(),
                repos_root: repos.path().to_str().unwrap().to_string(),
                git_binary: "/nonexistent/gitexec-no-such-binary".to_string(),
            }),
            metrics: MetricsRegistry::new(),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, create_router(state)).await.unwrap();
        });

        let client = BroadcastClient::with_backends(
            vec![format!("http://{addr}")],
            Duration::from_secs(10),
        );
        let mut cmd = Command::new("git", ["status"]);
        cmd.repo = "org/repo".to_string();

        match cmd.run(&client).await {
            Err(ClientError::Remote(message)) => assert!(!message.is_empty()),
            other => panic!("expected Remote, got {other:?}"),
        }
        assert_eq!(cmd.exit_status, 0, "start failure leaves the sentinel");
    }
}
