//! Wire envelope for the `Exec` RPC exchanged between the Command facade and
//! a backend.
//!
//! The envelope is JSON; byte fields (stdin, stdout, stderr, SSH keys) are
//! base64-encoded so the payload survives any transport that expects valid
//! UTF-8.  Field semantics matter more than the encoding: in particular,
//! `repo_exists = false` with an empty `error` is a valid, non-error reply
//! meaning "wrong shard".

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Base64 transport for byte fields
// ---------------------------------------------------------------------------

pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Credential options
// ---------------------------------------------------------------------------

/// Per-call credentials for git subcommands that talk to a remote.
///
/// Supplied by the upstream caller (e.g. a repository-mirroring job) and
/// never persisted beyond the single call's temp artifacts on the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteOpts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshCredential>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https: Option<HttpsCredential>,
}

impl RemoteOpts {
    pub fn is_empty(&self) -> bool {
        self.ssh.is_none() && self.https.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshCredential {
    /// Raw private key material (PEM bytes).
    #[serde(with = "base64_bytes")]
    pub private_key: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpsCredential {
    /// Plaintext password handed to git via an askpass helper.
    pub password: String,
}

// ---------------------------------------------------------------------------
// Request / reply
// ---------------------------------------------------------------------------

/// One git invocation addressed at whichever backend holds `repo`.
/// Immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    /// Repository ID, resolved to a directory under the backend's repos root.
    pub repo: String,
    /// Argument vector for the git binary (the leading `git` token already
    /// stripped by the client).
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opt: Option<RemoteOpts>,
    #[serde(default, with = "base64_bytes")]
    pub stdin: Vec<u8>,
}

/// Reply produced exactly once per handled request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecReply {
    /// Whether this backend holds the repository.  `false` is not an error;
    /// it signals "wrong shard" to the broadcast client.
    pub repo_exists: bool,
    /// Execution error text; empty means success.  Callers only ever see the
    /// message string, never a structured code.
    #[serde(default)]
    pub error: String,
    /// Decoded process exit status.  Left at the 0 sentinel when the process
    /// never started (in which case `error` is set).
    #[serde(default)]
    pub exit_status: i32,
    #[serde(default, with = "base64_bytes")]
    pub stdout: Vec<u8>,
    #[serde(default, with = "base64_bytes")]
    pub stderr: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Reply selection predicate
// ---------------------------------------------------------------------------

/// Predicate the broadcast client uses to pick the authoritative reply out
/// of a scatter-gather round.  Exactly one backend in a healthy fleet holds
/// any given repository.
pub trait BroadcastReply {
    fn repo_exists(&self) -> bool;
}

impl BroadcastReply for ExecReply {
    fn repo_exists(&self) -> bool {
        self.repo_exists
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
