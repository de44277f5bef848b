//! HTTP layer for one gitexec backend.
//!
//! Routes:
//! - `POST /api/exec` - run a git subcommand against a locally held repository
//! - `GET  /healthz`  - health check
//! - `GET  /metrics`  - Prometheus metrics

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tracing::{debug, error, info, instrument};

use crate::config::ServerConfig;
use crate::credentials::CredentialContext;
use crate::metrics::{ExecLabels, ExecOutcomeLabel, MetricsRegistry};
use crate::protocol::{ExecReply, ExecRequest};
use crate::runner;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared across all request handlers on one backend.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/exec", post(handle_exec))
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Exec handler
// ---------------------------------------------------------------------------

/// `POST /api/exec`
///
/// Per-request state machine: lookup, credential setup, execute, teardown,
/// reply.  Credential artifacts are released on every exit path through the
/// [`CredentialContext`] drop guard.
#[instrument(skip(state, request), fields(repo = %request.repo))]
async fn handle_exec(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecRequest>,
) -> Json<ExecReply> {
    let started = Instant::now();
    let reply = exec(&state, &request).await;
    state
        .metrics
        .metrics
        .exec_duration_seconds
        .observe(started.elapsed().as_secs_f64());

    if reply.repo_exists {
        info!(
            exit_status = reply.exit_status,
            error = %reply.error,
            duration_ms = started.elapsed().as_millis() as u64,
            "exec finished"
        );
    }
    Json(reply)
}

async fn exec(state: &AppState, request: &ExecRequest) -> ExecReply {
    // 1. Lookup.  An unknown repository is the normal "wrong shard" answer
    //    during broadcast fan-out, not an error: reply immediately with no
    //    further work.
    let Some(repo_dir) = resolve_repo_dir(&state.config.repos_root, &request.repo) else {
        debug!("repository ID rejected by path resolution");
        count(state, ExecOutcomeLabel::RepoMissing);
        return ExecReply::default();
    };
    let is_dir = tokio::fs::metadata(&repo_dir)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        debug!("repository not present on this backend");
        count(state, ExecOutcomeLabel::RepoMissing);
        return ExecReply::default();
    }

    let mut reply = ExecReply {
        repo_exists: true,
        ..Default::default()
    };

    // 2. Credential setup.  A failure here is terminal for the request: git
    //    must never run without the intended credential.
    let credentials = match &request.opt {
        Some(opt) if !opt.is_empty() => match CredentialContext::materialize(opt) {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                error!(error = %format!("{e:#}"), "credential setup failed");
                count(state, ExecOutcomeLabel::CredentialError);
                reply.error = format!("credential setup failed: {e:#}");
                return reply;
            }
        },
        _ => None,
    };

    // 3. Execute.
    let env = credentials.as_ref().map(|c| c.env()).unwrap_or(&[]);
    match runner::run_git(
        &state.config.git_binary,
        &repo_dir,
        &request.args,
        &request.stdin,
        env,
    )
    .await
    {
        Ok(outcome) => {
            reply.exit_status = outcome.exit_status;
            reply.stdout = outcome.stdout;
            reply.stderr = outcome.stderr;
            count(state, ExecOutcomeLabel::Completed);
        }
        Err(e) => {
            // Start failure: no process state exists to interrogate, so the
            // exit status stays at the 0 sentinel.
            reply.error = format!("{e:#}");
            count(state, ExecOutcomeLabel::StartError);
        }
    }

    // 4. Teardown: dropping the context removes every credential artifact,
    //    regardless of how step 3 went.
    drop(credentials);

    // 5. Reply.
    reply
}

fn count(state: &AppState, outcome: ExecOutcomeLabel) {
    state
        .metrics
        .metrics
        .exec_requests
        .get_or_create(&ExecLabels { outcome })
        .inc();
}

// ---------------------------------------------------------------------------
// Repository path resolution
// ---------------------------------------------------------------------------

/// Resolve a repository ID to a directory under `root`.
///
/// IDs are relative paths like `org/repo`.  Anything containing `..`, an
/// absolute component, or a path prefix would escape the root; such IDs
/// resolve to `None` and behave exactly like a repository held by another
/// shard.
fn resolve_repo_dir(root: &str, repo: &str) -> Option<PathBuf> {
    if repo.is_empty() {
        return None;
    }
    let relative = Path::new(repo);
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => return None,
        }
    }
    Some(Path::new(root).join(relative))
}

// ---------------------------------------------------------------------------
// Health / metrics handlers
// ---------------------------------------------------------------------------

/// `GET /healthz`.  Returns 200 when healthy, 503 otherwise.
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = crate::health::check(&state.config).await;
    let status = match body.status {
        crate::health::HealthStatus::Ok => StatusCode::OK,
        crate::health::HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(body))
}

/// `GET /metrics`.  Prometheus text exposition.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    let mut buf = String::new();
    match prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry) {
        Ok(()) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            buf,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
