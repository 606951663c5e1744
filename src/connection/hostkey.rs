//! Host key verification policy.
//!
//! [`resolve`] turns the configured verification mode into a
//! [`HostKeyVerifier`] before any dialing happens, so a missing or malformed
//! known_hosts file fails fast instead of mid-handshake. The verifier itself
//! is a pure lookup; accept/reject decisions for unknown hosts stay with the
//! SSH handler, which also knows whether strict checking is on.

use std::path::PathBuf;

use base64::Engine;
use russh_keys::key::{parse_public_key, PublicKey};
use tracing::{debug, warn};

use super::config::{expand_path, pattern_matches};
use super::{ConnectionConfig, ConnectionError, ConnectionResult};

/// Outcome of checking a server key against the trust store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyStatus {
    /// Key matches a known_hosts entry for this host.
    Verified,
    /// No known_hosts entry covers this host.
    Unknown,
    /// An entry covers this host but the key differs (possible MITM).
    Mismatch,
}

/// A parsed known_hosts entry.
#[derive(Debug, Clone)]
pub struct KnownHostEntry {
    patterns: Vec<String>,
    key: PublicKey,
}

/// How a server's identity is checked during the handshake.
#[derive(Debug, Clone)]
pub enum HostKeyVerifier {
    /// Accept any key. Produced by insecure mode, or by a missing
    /// known_hosts file when strict checking is off.
    AcceptAll,
    /// Compare against parsed known_hosts entries.
    KnownHosts(Vec<KnownHostEntry>),
}

impl HostKeyVerifier {
    /// Check `server_key` for `host:port`.
    pub fn verify(&self, host: &str, port: u16, server_key: &PublicKey) -> HostKeyStatus {
        match self {
            HostKeyVerifier::AcceptAll => HostKeyStatus::Verified,
            HostKeyVerifier::KnownHosts(entries) => {
                for entry in entries {
                    for pattern in &entry.patterns {
                        if host_pattern_matches(pattern, host, port) {
                            if entry.key.fingerprint() == server_key.fingerprint() {
                                return HostKeyStatus::Verified;
                            }
                            return HostKeyStatus::Mismatch;
                        }
                    }
                }
                HostKeyStatus::Unknown
            }
        }
    }
}

/// Decide how the remote host's identity will be verified.
///
/// Insecure mode returns an always-accept verifier; the caller is responsible
/// for the one-time warning. Otherwise the known_hosts file (explicit
/// override or `~/.ssh/known_hosts`) is loaded: absent plus strict fails,
/// absent plus non-strict warns and falls back to accept, malformed always
/// fails.
pub fn resolve(config: &ConnectionConfig) -> ConnectionResult<HostKeyVerifier> {
    if config.insecure_ignore_host_key {
        return Ok(HostKeyVerifier::AcceptAll);
    }

    let path = known_hosts_path(config);
    if !path.exists() {
        if config.strict_host_key_checking {
            // One verifier guards both peers, so the error names every host
            // it would have checked.
            let host = match &config.jump_host {
                Some(jump) => format!("{} (via {})", config.host, jump),
                None => config.host.clone(),
            };
            return Err(ConnectionError::HostKeyRejected {
                host,
                reason: format!(
                    "strict host key checking is on and known_hosts file {} does not exist",
                    path.display()
                ),
            });
        }
        warn!(
            path = %path.display(),
            "known_hosts file not found; host keys will not be verified"
        );
        return Ok(HostKeyVerifier::AcceptAll);
    }

    let content = std::fs::read_to_string(&path).map_err(|e| {
        ConnectionError::InvalidConfig(format!(
            "failed to read known_hosts file {}: {}",
            path.display(),
            e
        ))
    })?;

    let entries = parse_known_hosts(&content, &path)?;
    debug!(entry_count = entries.len(), path = %path.display(), "loaded known_hosts");
    Ok(HostKeyVerifier::KnownHosts(entries))
}

fn known_hosts_path(config: &ConnectionConfig) -> PathBuf {
    match &config.known_hosts_path {
        Some(path) => expand_path(path),
        None => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("~"))
            .join(".ssh")
            .join("known_hosts"),
    }
}

/// Parse known_hosts text. A line that is not a comment and cannot be parsed
/// makes the whole file a fatal configuration error.
fn parse_known_hosts(
    content: &str,
    path: &std::path::Path,
) -> ConnectionResult<Vec<KnownHostEntry>> {
    let mut entries = Vec::new();

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        // Marker lines (@cert-authority, @revoked) and hashed hostnames are
        // valid known_hosts syntax this verifier cannot match against.
        if line.starts_with('@') || line.starts_with("|1|") {
            debug!(line = lineno + 1, "skipping unsupported known_hosts entry");
            continue;
        }

        let mut parts = line.split_whitespace();
        let (patterns, _key_type, key_data) = match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(t), Some(k)) => (h, t, k),
            _ => {
                return Err(ConnectionError::InvalidConfig(format!(
                    "malformed known_hosts entry at {}:{}",
                    path.display(),
                    lineno + 1
                )))
            }
        };

        let key_bytes = base64::engine::general_purpose::STANDARD
            .decode(key_data)
            .map_err(|e| {
                ConnectionError::InvalidConfig(format!(
                    "malformed known_hosts key at {}:{}: {}",
                    path.display(),
                    lineno + 1,
                    e
                ))
            })?;

        // Key types this build cannot verify are skipped rather than fatal;
        // the file itself is well-formed.
        let key = match parse_public_key(&key_bytes, None) {
            Ok(k) => k,
            Err(e) => {
                debug!(line = lineno + 1, error = %e, "skipping unsupported key type");
                continue;
            }
        };

        entries.push(KnownHostEntry {
            patterns: patterns.split(',').map(str::to_string).collect(),
            key,
        });
    }

    Ok(entries)
}

/// Match one known_hosts hostname pattern, including the `[host]:port` form.
fn host_pattern_matches(pattern: &str, host: &str, port: u16) -> bool {
    if let Some(rest) = pattern.strip_prefix('[') {
        if let Some((pattern_host, pattern_port)) = rest.split_once("]:") {
            return pattern_port.parse::<u16>() == Ok(port)
                && pattern_matches(pattern_host, host);
        }
        return false;
    }

    // A bare hostname implies the default port.
    port == 22 && pattern_matches(pattern, host)
}
