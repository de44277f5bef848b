//! git subprocess execution.
//!
//! Spawns the configured git binary with piped stdio, feeds it the request's
//! stdin bytes, and captures everything it writes.  A failure to *start* the
//! process is a different condition from the process exiting non-zero: only
//! the latter yields a valid exit status.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Captured result of a completed git subprocess.
#[derive(Debug)]
pub struct ExecOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Decoded exit status; -1 when the process was killed by a signal and
    /// no exit code exists.
    pub exit_status: i32,
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Run `git_binary args...` inside `repo_dir` and capture all output.
///
/// `env` carries the credential-helper wiring (`GIT_SSH`, `GIT_ASKPASS`,
/// `GIT_TERMINAL_PROMPT`).  Any inherited `GIT_ASKPASS` or
/// `GIT_TERMINAL_PROMPT` is removed first so git cannot skip the supplied
/// helpers in favour of a foreign one or an interactive prompt.
///
/// The `Err` case is strictly "the process never started" (binary missing,
/// not executable).  A process that starts and exits non-zero is NOT an
/// error: the decoded status and whatever partial output was produced are
/// returned normally.
#[instrument(skip(stdin, env), fields(repo_dir = %repo_dir.display(), args = args.len()))]
pub async fn run_git(
    git_binary: &str,
    repo_dir: &Path,
    args: &[String],
    stdin: &[u8],
    env: &[(String, String)],
) -> Result<ExecOutcome> {
    let mut cmd = Command::new(git_binary);
    cmd.args(args)
        .current_dir(repo_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    cmd.env_remove("GIT_ASKPASS");
    cmd.env_remove("GIT_TERMINAL_PROMPT");
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to start {git_binary}"))?;

    // Feed stdin concurrently with collecting output so a subprocess that
    // fills its stdout pipe before draining stdin cannot deadlock us.
    let stdin_pipe = child.stdin.take();
    let write_stdin = async {
        if let Some(mut pipe) = stdin_pipe {
            // Best-effort: git may legitimately exit before reading it all.
            let _ = pipe.write_all(stdin).await;
            let _ = pipe.shutdown().await;
            // Dropping the pipe signals EOF.
        }
    };

    let ((), output) = tokio::join!(write_stdin, child.wait_with_output());
    let output = output.context("failed to collect git output")?;

    let exit_status = output.status.code().unwrap_or(-1);
    debug!(
        exit_status,
        stdout_bytes = output.stdout.len(),
        stderr_bytes = output.stderr.len(),
        "git subprocess finished"
    );

    Ok(ExecOutcome {
        stdout: output.stdout,
        stderr: output.stderr,
        exit_status,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
