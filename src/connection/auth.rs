//! Resolution of authentication methods per peer.
//!
//! Each connection attempt resolves a fresh, ordered list of credential
//! mechanisms: an explicit identity file first (its failure is fatal, never
//! silently skipped), then the SSH agent if one is advertised through
//! `SSH_AUTH_SOCK`. Agent absence contributes nothing; an empty list is a
//! configuration problem and fails immediately.

use std::path::Path;
use std::sync::Arc;

use russh_keys::key::KeyPair;
use russh_keys::load_secret_key;
use tracing::debug;

use super::config::expand_path;
use super::{ConnectionError, ConnectionResult, Peer};

/// One credential mechanism, tried in order during the handshake.
#[derive(Clone)]
pub enum AuthMethod {
    /// A private key loaded from an identity file.
    Key(Arc<KeyPair>),
    /// Identities offered by the running SSH agent.
    Agent,
}

impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Key(_) => write!(f, "Key(..)"),
            AuthMethod::Agent => write!(f, "Agent"),
        }
    }
}

/// Build the ordered method list for `peer`.
///
/// Re-run on every connection attempt; key files are re-read so a rotated
/// key takes effect without restarting.
pub fn resolve(identity_file: Option<&Path>, peer: Peer) -> ConnectionResult<Vec<AuthMethod>> {
    resolve_with_agent(
        identity_file,
        peer,
        std::env::var_os("SSH_AUTH_SOCK").is_some(),
    )
}

pub(crate) fn resolve_with_agent(
    identity_file: Option<&Path>,
    peer: Peer,
    agent_available: bool,
) -> ConnectionResult<Vec<AuthMethod>> {
    let mut methods = Vec::new();

    if let Some(path) = identity_file {
        let expanded = expand_path(path);
        if !expanded.exists() {
            return Err(ConnectionError::AuthenticationFailed {
                peer,
                reason: format!("identity file not found: {}", expanded.display()),
            });
        }
        let key = load_secret_key(&expanded, None).map_err(|e| {
            ConnectionError::AuthenticationFailed {
                peer,
                reason: format!("failed to load key {}: {}", expanded.display(), e),
            }
        })?;
        debug!(key = %expanded.display(), %peer, "loaded identity file");
        methods.push(AuthMethod::Key(Arc::new(key)));
    }

    if agent_available {
        methods.push(AuthMethod::Agent);
    }

    if methods.is_empty() {
        return Err(ConnectionError::AuthenticationFailed {
            peer,
            reason: format!("no authentication method available for {}", peer),
        });
    }

    Ok(methods)
}
