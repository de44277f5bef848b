use serde::Serialize;

use crate::config::ServerConfig;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub repos_root: CheckResult,
    pub git: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy(detail: Option<String>) -> Self {
        Self { ok: true, detail }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Individual checks
// ---------------------------------------------------------------------------

async fn check_repos_root(root: &str) -> CheckResult {
    match tokio::fs::metadata(root).await {
        Ok(meta) if meta.is_dir() => CheckResult::healthy(None),
        Ok(_) => CheckResult::unhealthy(format!("{root} exists but is not a directory")),
        Err(e) => CheckResult::unhealthy(format!("cannot stat {root}: {e}")),
    }
}

async fn check_git(git_binary: &str) -> CheckResult {
    let output = tokio::process::Command::new(git_binary)
        .arg("--version")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output()
        .await;

    match output {
        Ok(out) if out.status.success() => {
            let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
            CheckResult::healthy(Some(version))
        }
        Ok(out) => CheckResult::unhealthy(format!(
            "{git_binary} --version exited with {}",
            out.status
        )),
        Err(e) => CheckResult::unhealthy(format!("cannot run {git_binary}: {e}")),
    }
}

// ---------------------------------------------------------------------------
// Aggregate
// ---------------------------------------------------------------------------

fn aggregate_status(checks: &HealthChecks) -> HealthStatus {
    // Both checks are required: without either one the backend cannot serve
    // a single exec request.
    if checks.repos_root.ok && checks.git.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Unhealthy
    }
}

/// Run every check and assemble the `/healthz` body.
pub async fn check(server: &ServerConfig) -> HealthResponse {
    let (repos_root, git) = tokio::join!(
        check_repos_root(&server.repos_root),
        check_git(&server.git_binary),
    );

    let checks = HealthChecks { repos_root, git };
    let status = aggregate_status(&checks);
    HealthResponse { status, checks }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
