//! Remote git-command execution service.
//!
//! One `gitexecd` backend owns a shard of repository working copies and
//! exposes a single exec RPC that runs arbitrary git subcommands against
//! them, with per-call credential injection (SSH wrapper scripts, HTTPS
//! askpass helpers) whose filesystem artifacts never outlive the request.
//!
//! Callers use [`client::Command`], which fans each request out across the
//! configured backend fleet and keeps the reply from the one backend that
//! holds the repository.

pub mod client;
pub mod config;
pub mod credentials;
pub mod health;
pub mod metrics;
pub mod protocol;
pub mod runner;
pub mod server;

pub use client::{BroadcastClient, ClientError, Command};
pub use config::{ClientConfig, Config, ServerConfig};
pub use protocol::{ExecReply, ExecRequest, HttpsCredential, RemoteOpts, SshCredential};
