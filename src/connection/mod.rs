//! Connection layer: how a command reaches the target environment.
//!
//! Every checker consumes targets exclusively through the [`Provider`] trait,
//! one capability ("run this command, give me stdout/stderr/exit code"),
//! regardless of whether the target is the local machine, a host behind SSH
//! (optionally tunneled through a jump host), or a pod reached with kubectl.
//!
//! The submodules split the SSH path the way the responsibilities split:
//!
//! - [`config`]: connection parameters and SSH-config alias resolution
//! - [`auth`]: building the ordered list of credential mechanisms per peer
//! - [`hostkey`]: deciding how the remote host's identity is verified
//! - [`ssh`]: session establishment, command execution, reconnection
//! - [`classify`]: transient vs. permanent error classification
//! - [`local`], [`kubectl`]: the non-SSH backends sharing the same contract

pub mod auth;
pub mod classify;
pub mod config;
pub mod hostkey;
pub mod kubectl;
pub mod local;
pub mod ssh;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

pub use config::ConnectionConfig;
pub use kubectl::{KubectlConfig, KubectlProvider};
pub use local::LocalProvider;
pub use ssh::SshConnection;

/// Exit code reported when the remote side never delivered one.
pub const EXIT_CODE_UNKNOWN: i32 = -1;

/// Which end of a (possibly tunneled) connection an operation concerns.
///
/// Auth and host-key failures name the peer so a user with different keys for
/// the bastion and the target can tell which one rejected them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    /// The final destination host.
    Target,
    /// The intermediate bastion host.
    Jump,
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Target => write!(f, "target host"),
            Peer::Jump => write!(f, "jump host"),
        }
    }
}

/// Errors that can occur while reaching a target or running a command on it.
///
/// Variants carry the phase that produced them; the underlying cause is kept
/// in the message, never replaced. Whether a given error is worth retrying is
/// decided by [`classify::is_transient`], not here.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// TCP dial, dial-through, or SSH handshake failure.
    #[error("dial failed for {addr}: {reason}")]
    DialFailed {
        /// Address in `host:port` form.
        addr: String,
        /// Underlying cause.
        reason: String,
    },

    /// Authentication was rejected or could not be attempted.
    #[error("{peer} authentication failed: {reason}")]
    AuthenticationFailed {
        /// Which peer rejected us.
        peer: Peer,
        /// Underlying cause.
        reason: String,
    },

    /// The remote host's key failed verification.
    #[error("host key check failed for {host}: {reason}")]
    HostKeyRejected {
        /// Hostname that presented the key.
        host: String,
        /// Underlying cause.
        reason: String,
    },

    /// Transport-level failure while running a command (not a nonzero exit).
    #[error("command execution failed: {0}")]
    ExecutionFailed(String),

    /// Dial or handshake exceeded the configured timeout.
    #[error("connection timeout after {0} seconds")]
    Timeout(u64),

    /// DNS name resolution failed.
    #[error("name resolution failed for {0}")]
    NameResolution(String),

    /// Configuration is invalid or a config file is malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The connection handle is gone.
    #[error("connection closed")]
    ConnectionClosed,

    /// I/O error on an established link.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SSH protocol error from the underlying implementation.
    #[error("SSH error: {0}")]
    Ssh(String),
}

impl From<russh::Error> for ConnectionError {
    fn from(err: russh::Error) -> Self {
        ConnectionError::Ssh(err.to_string())
    }
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Captured output of one executed command.
///
/// A nonzero exit code is a normal result, not an error; only transport
/// failures surface as [`ConnectionError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Content written to standard output.
    pub stdout: String,
    /// Content written to standard error.
    pub stderr: String,
    /// Exit code; [`EXIT_CODE_UNKNOWN`] when it could not be determined.
    pub exit_code: i32,
}

impl ExecResult {
    /// Build a result from captured streams and an optional exit code.
    pub fn new(stdout: String, stderr: String, exit_code: Option<i32>) -> Self {
        Self {
            stdout,
            stderr,
            exit_code: exit_code.unwrap_or(EXIT_CODE_UNKNOWN),
        }
    }

    /// True if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The single capability every checker consumes and every backend implements.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Identifier of the target this provider executes against.
    fn identifier(&self) -> &str;

    /// Run `command` on the target and capture its output fully.
    async fn execute_command(&self, command: &str) -> ConnectionResult<ExecResult>;
}
